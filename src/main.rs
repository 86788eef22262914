use check_harness::check::{Check, run_with_test_collector};
use check_harness::cli::{Cli, Mode};
use check_harness::command_check::CommandChecker;
use check_harness::config::Config;
use check_harness::local::run_local;
use check_harness::logging::init_logging;
use clap::Parser;
use eyre::{Result, WrapErr};
use std::path::Path;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::build().wrap_err("Failed to load configuration")?;

    let mode = cli.mode();
    if let Mode::Local { target, options, .. } = &mode {
        config.check.target = target.clone();
        if let Some(options) = options {
            config.check.options = options.clone();
        }
        config.apply_options();
    }
    init_logging(&config.log);

    let (program, args) = cli.program();
    let name = Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string());
    let checker = Arc::new(CommandChecker::new(program, args.to_vec()));
    log::info!("[main] starting: name={} mode={:?}", name, mode);

    match mode {
        Mode::Local { format, .. } => {
            run_local(&name, checker, config, format).await?;
        }
        Mode::Test => {
            let state = run_with_test_collector(&name, checker, config).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Mode::Push => {
            let state = Check::new(&name, checker, config).run_and_serve().await?;
            log::info!("[main] done: name={} status={:?}", name, state.status);
        }
    }
    Ok(())
}
