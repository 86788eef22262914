use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const CONFIG_FILE_PATH: &str = "local.toml";
pub const DEFAULT_BUFFER_LEN: usize = 10;
pub const DEFAULT_PUSH_TIMEOUT_SECS: u64 = 30;

const LOG_LEVEL_ENV: &str = "CHECK_LOG_LVL";
const LOG_FORMAT_ENV: &str = "CHECK_FMT";
const TARGET_ENV: &str = "CHECK_TARGET";
const OPTIONS_ENV: &str = "CHECK_OPTIONS";
const CHECK_ID_ENV: &str = "CHECK_ID";
const CHECKTYPE_NAME_ENV: &str = "CHECKTYPE_NAME";
const CHECKTYPE_VERSION_ENV: &str = "CHECKTYPE_VERSION";
const COMM_MODE_ENV: &str = "CHECK_COMM_MODE";
const AGENT_ADDRESS_ENV: &str = "CHECK_AGENT_ADDRESS";
const BUFFER_LEN_ENV: &str = "CHECK_MSG_BUFF_LEN";
const ALLOW_PRIVATE_IPS_ENV: &str = "CHECK_ALLOW_PRIVATE_IPS";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckConfig {
    pub target: String,
    pub options: String,
    pub check_id: String,
    pub checktype_name: String,
    pub checktype_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub log_fmt: String,
    pub log_level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    /// `host:port` or a base URL of the collector.
    pub agent_addr: String,
    pub buffer_len: usize,
    pub timeout_secs: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            agent_addr: String::new(),
            buffer_len: DEFAULT_BUFFER_LEN,
            timeout_secs: DEFAULT_PUSH_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommMode {
    #[default]
    Push,
    Pull,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub check: CheckConfig,
    pub log: LogConfig,
    pub push: PushConfig,
    pub comm_mode: CommMode,
    pub allow_private_ips: Option<bool>,
}

#[derive(Deserialize)]
struct DebugOptions {
    #[serde(default)]
    debug: bool,
}

impl Config {
    /// Reads `local.toml` when present, then applies the process environment.
    pub fn build() -> Result<Self> {
        let mut config = if Path::new(CONFIG_FILE_PATH).exists() {
            Self::from_file(CONFIG_FILE_PATH)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.apply_options();
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&contents)
            .wrap_err_with(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Overrides values from environment variables, looked up through `env`.
    pub fn apply_env<F>(&mut self, env: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |value: Option<String>, field: &mut String| {
            if let Some(v) = value.filter(|v| !v.is_empty()) {
                *field = v;
            }
        };

        set(env(LOG_LEVEL_ENV), &mut self.log.log_level);
        set(env(LOG_FORMAT_ENV), &mut self.log.log_fmt);

        set(env(OPTIONS_ENV), &mut self.check.options);
        set(env(TARGET_ENV), &mut self.check.target);
        set(env(CHECK_ID_ENV), &mut self.check.check_id);
        let checktype_name = env(CHECKTYPE_NAME_ENV).filter(|v| !v.is_empty());
        if checktype_name.is_some() {
            set(env(CHECKTYPE_VERSION_ENV), &mut self.check.checktype_version);
        }
        set(checktype_name, &mut self.check.checktype_name);

        if let Some(mode) = env(COMM_MODE_ENV).filter(|v| !v.is_empty()) {
            self.comm_mode = match mode.to_lowercase().as_str() {
                "pull" => CommMode::Pull,
                _ => CommMode::Push,
            };
        }
        set(env(AGENT_ADDRESS_ENV), &mut self.push.agent_addr);
        if let Some(len) = env(BUFFER_LEN_ENV).filter(|v| !v.is_empty()) {
            self.push.buffer_len = len.parse().unwrap_or(DEFAULT_BUFFER_LEN);
        }
        if self.push.buffer_len == 0 {
            self.push.buffer_len = DEFAULT_BUFFER_LEN;
        }

        if let Some(allow) = env(ALLOW_PRIVATE_IPS_ENV).filter(|v| !v.is_empty()) {
            let allow = parse_bool(&allow).ok_or_else(|| {
                eyre::eyre!("can not parse allow private IPs option from env var ({}={})",
                    ALLOW_PRIVATE_IPS_ENV, allow)
            })?;
            self.allow_private_ips = Some(allow);
        }
        Ok(())
    }

    /// Check options given as JSON with `"debug": true` raise the log level.
    pub fn apply_options(&mut self) {
        if self.check.options.is_empty() {
            return;
        }
        if let Ok(opts) = serde_json::from_str::<DebugOptions>(&self.check.options) {
            if opts.debug {
                self.log.log_level = "debug".to_string();
            }
        }
    }

    pub fn allows_private_ips(&self) -> bool {
        self.allow_private_ips.unwrap_or(false)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "1" | "t" | "true" => Some(true),
        "0" | "f" | "false" => Some(false),
        _ => None,
    }
}
