use anyhow::anyhow;
use tracing_subscriber::filter::LevelFilter;

use crate::config::{Config, LogFormat};

const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::INFO;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LogSettings {
    level: LevelFilter,
    format: LogFormat,
}

/// Installs the global subscriber. A level given on the command line wins over `[logging] level`.
pub fn init(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<()> {
    let settings = resolve(config, cli_level_override)?;

    let builder = tracing_subscriber::fmt()
        .with_max_level(settings.level)
        .with_target(true)
        .with_writer(std::io::stderr);
    match settings.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    }
    .map_err(|err| anyhow!("initialize logging subscriber: {err}"))
}

fn resolve(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<LogSettings> {
    let logging = config.logging.as_ref();
    let level = match cli_level_override.or_else(|| logging.and_then(|l| l.level.as_deref())) {
        Some(raw) => parse_level(raw)?,
        None => DEFAULT_LOG_LEVEL,
    };
    let format = logging
        .and_then(|logging| logging.format)
        .unwrap_or(LogFormat::Json);

    Ok(LogSettings { level, format })
}

fn parse_level(raw: &str) -> anyhow::Result<LevelFilter> {
    raw.trim()
        .to_ascii_lowercase()
        .parse::<LevelFilter>()
        .map_err(|_| {
            anyhow!("invalid log level `{raw}`; expected one of trace, debug, info, warn, error, off")
        })
}
