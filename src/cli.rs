use clap::Parser;

use crate::local::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "check-harness")]
#[command(about = "Runs a program as a check: target gate, state reporting and abort handling")]
pub struct Cli {
    /// Run against an embedded test collector instead of the configured one
    #[arg(short = 't', long = "test", conflicts_with = "run")]
    pub test: bool,

    /// Run locally against TARGET and print the result
    #[arg(short = 'r', long = "run", value_name = "TARGET")]
    pub run: Option<String>,

    /// Options passed to the check when running locally
    #[arg(short = 'o', long = "options", requires = "run")]
    pub options: Option<String>,

    /// Print the local result as JSON
    #[arg(short = 'j', long = "json", requires = "run")]
    pub json: bool,

    /// Program run as the check body, followed by its arguments.
    /// `{target}` and `{options}` in the arguments are substituted.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true, num_args = 1..)]
    pub command: Vec<String>,
}

/// How the binary serves the check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Push,
    Test,
    Local {
        target: String,
        options: Option<String>,
        format: OutputFormat,
    },
}

impl Cli {
    pub fn mode(&self) -> Mode {
        match &self.run {
            Some(target) => Mode::Local {
                target: target.clone(),
                options: self.options.clone(),
                format: OutputFormat::from_json_flag(self.json),
            },
            None if self.test => Mode::Test,
            None => Mode::Push,
        }
    }

    /// Program and its arguments.
    pub fn program(&self) -> (&str, &[String]) {
        match self.command.split_first() {
            Some((program, args)) => (program.as_str(), args),
            None => ("", &[]),
        }
    }
}
