use log::LevelFilter;
use std::io::Write;

use crate::config::LogConfig;

const DEFAULT_LOG_LEVEL: &str = "info";
const JSON_FORMAT: &str = "json";

/// Level from configuration. Empty means info, anything unparsable means error.
pub fn log_level(config: &LogConfig) -> LevelFilter {
    let level = if config.log_level.is_empty() {
        DEFAULT_LOG_LEVEL
    } else {
        config.log_level.as_str()
    };
    level.parse::<LevelFilter>().unwrap_or(LevelFilter::Error)
}

/// Initialize logging to stderr in text or JSON format.
///
/// Safe to call more than once, only the first call installs the logger.
pub fn init_logging(config: &LogConfig) {
    let filters = std::env::var("RUST_LOG").ok();
    let mut builder = logger_builder(config, filters.as_deref());
    if builder.try_init().is_ok() {
        log::debug!("[logging] init_logging: level={} format={}", log_level(config),
            if config.log_fmt.is_empty() { "text" } else { config.log_fmt.as_str() });
    }
}

/// Builder for the stderr logger. `filters` uses the `RUST_LOG` syntax and
/// refines the configured level.
fn logger_builder(config: &LogConfig, filters: Option<&str>) -> env_logger::Builder {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(log_level(config));
    if let Some(filters) = filters {
        builder.parse_filters(filters);
    }

    if config.log_fmt == JSON_FORMAT {
        builder.format(|buf, record| {
            let line = serde_json::json!({
                "time": chrono::Utc::now().to_rfc3339(),
                "level": record.level().to_string(),
                "target": record.target(),
                "msg": record.args().to_string(),
            });
            writeln!(buf, "{}", line)
        });
    } else {
        builder.format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {} - {}",
                chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        });
    }

    builder.target(env_logger::Target::Stderr);
    builder
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_defaults() {
        let config = LogConfig::default();
        assert_eq!(log_level(&config), LevelFilter::Info);

        let config = LogConfig { log_level: "debug".to_string(), ..Default::default() };
        assert_eq!(log_level(&config), LevelFilter::Debug);

        let config = LogConfig { log_level: "chatty".to_string(), ..Default::default() };
        assert_eq!(log_level(&config), LevelFilter::Error);
    }

    #[test]
    fn test_logger_uses_configured_level() {
        let config = LogConfig { log_fmt: "json".to_string(), log_level: "warn".to_string() };
        let logger = logger_builder(&config, None).build();
        assert_eq!(logger.filter(), LevelFilter::Warn);

        let error = log::Metadata::builder().level(log::Level::Error).target("check_harness").build();
        let info = log::Metadata::builder().level(log::Level::Info).target("check_harness").build();
        assert!(log::Log::enabled(&logger, &error));
        assert!(!log::Log::enabled(&logger, &info));
    }

    #[test]
    fn test_logger_env_filters_refine_level() {
        let config = LogConfig { log_fmt: String::new(), log_level: "warn".to_string() };
        let logger = logger_builder(&config, Some("check_harness::push=debug")).build();

        let push = log::Metadata::builder().level(log::Level::Debug).target("check_harness::push").build();
        let other = log::Metadata::builder().level(log::Level::Debug).target("check_harness::state").build();
        assert!(log::Log::enabled(&logger, &push));
        assert!(!log::Log::enabled(&logger, &other));
    }
}
