use anyhow::Result;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::core::Config;

/// Initialize tracing. Env: LOG_FORMAT=compact|pretty|json
pub fn init(cfg: &Config) -> Result<()> {
    init_with(&cfg.log_level, std::env::var("LOG_FORMAT").ok().as_deref())
}

/// Same as [`init`] without a loaded config (script binaries)
pub fn init_with(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    match format {
        Some("json") => builder.json().finish().try_init()?,
        Some("pretty") => builder.pretty().finish().try_init()?,
        _ => builder.compact().finish().try_init()?,
    }
    Ok(())
}
