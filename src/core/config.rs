//! Production Configuration - All tunables in one place

use anyhow::{bail, Context, Result};
use std::env::var;
use std::time::Duration;
use url::Url;

use crate::core::reconnect::ReconnectPolicy;

/// Realtime Manager Configuration
#[derive(Debug, Clone)]
pub struct Config {
    // === Upstream ===
    pub realtime_url: String,
    pub api_key: String,
    pub log_level: String,
    pub shutdown_timeout_secs: u64,

    // === NATS relay ===
    pub nats_url: String,
    pub subject_prefix: String,

    // === Optimistic updates ===
    pub optimistic_timeout_ms: u64,

    // === Reconnection ===
    pub max_reconnect_attempts: u32,
    pub reconnect_base_ms: u64,
    pub subscribe_timeout_secs: u64,

    // === Health ===
    pub health_interval_secs: u64,
    pub stale_after_secs: u64,

    // === Binary ===
    /// `schema.table` or `table` entries to watch
    pub watch: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let cfg = Self {
            // Upstream
            realtime_url: var("NEXT_PUBLIC_SUPABASE_URL")
                .context("NEXT_PUBLIC_SUPABASE_URL required")?,
            api_key: var("NEXT_PUBLIC_SUPABASE_ANON_KEY")
                .context("NEXT_PUBLIC_SUPABASE_ANON_KEY required")?,
            log_level: var("LOG_LEVEL")
                .or_else(|_| var("RUST_LOG"))
                .unwrap_or_else(|_| "info".into()),
            shutdown_timeout_secs: env("SHUTDOWN_TIMEOUT_SECS", 5),

            // NATS
            nats_url: var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".into()),
            subject_prefix: var("REALTIME_PREFIX").unwrap_or_else(|_| "realtime".into()),

            // Optimistic
            optimistic_timeout_ms: env("OPTIMISTIC_TIMEOUT_MS", 10_000),

            // Reconnection
            max_reconnect_attempts: env("MAX_RECONNECT_ATTEMPTS", 5),
            reconnect_base_ms: env("RECONNECT_BASE_MS", 1000),
            subscribe_timeout_secs: env("SUBSCRIBE_TIMEOUT_SECS", 10),

            // Health
            health_interval_secs: env("HEALTH_INTERVAL_SECS", 30),
            stale_after_secs: env("STALE_AFTER_SECS", 120),

            watch: var("WATCH_TABLES")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        macro_rules! check {
            ($cond:expr, $msg:expr) => {
                if $cond {
                    bail!($msg);
                }
            };
        }
        let url = Url::parse(&self.realtime_url).context("NEXT_PUBLIC_SUPABASE_URL is not a URL")?;
        check!(
            !matches!(url.scheme(), "http" | "https"),
            "NEXT_PUBLIC_SUPABASE_URL must be http(s)"
        );
        check!(url.host_str().is_none(), "NEXT_PUBLIC_SUPABASE_URL has no host");
        check!(
            self.api_key.trim().is_empty(),
            "NEXT_PUBLIC_SUPABASE_ANON_KEY must not be empty"
        );
        check!(
            self.subject_prefix.is_empty() || self.subject_prefix.contains(|c: char| matches!(c, '*' | '>' | ' ')),
            "REALTIME_PREFIX must be a plain NATS token"
        );
        check!(
            self.optimistic_timeout_ms == 0,
            "OPTIMISTIC_TIMEOUT_MS must be > 0"
        );
        check!(self.reconnect_base_ms == 0, "RECONNECT_BASE_MS must be > 0");
        check!(
            self.max_reconnect_attempts > 16,
            "MAX_RECONNECT_ATTEMPTS must be <= 16"
        );
        check!(
            self.subscribe_timeout_secs == 0,
            "SUBSCRIBE_TIMEOUT_SECS must be > 0"
        );
        check!(
            self.health_interval_secs == 0,
            "HEALTH_INTERVAL_SECS must be > 0"
        );
        check!(
            self.stale_after_secs < self.health_interval_secs,
            "STALE_AFTER_SECS must be >= HEALTH_INTERVAL_SECS"
        );
        check!(
            self.shutdown_timeout_secs == 0,
            "SHUTDOWN_TIMEOUT_SECS must be > 0"
        );
        Ok(())
    }

    // === Duration helpers ===

    #[inline]
    pub fn optimistic_timeout(&self) -> Duration {
        Duration::from_millis(self.optimistic_timeout_ms)
    }
    #[inline]
    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_secs(self.subscribe_timeout_secs)
    }
    #[inline]
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }
    #[inline]
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
    #[inline]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    #[inline]
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_millis(self.reconnect_base_ms),
            self.max_reconnect_attempts,
        )
    }

    /// Project reference: first label of the realtime host
    /// (`abc123.supabase.co` → `abc123`)
    pub fn project_ref(&self) -> String {
        Url::parse(&self.realtime_url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.split('.').next().unwrap_or(h).to_string()))
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "default".into())
    }

    /// Change feed subject: realtime.{project}.{schema}.{table}
    #[inline]
    pub fn table_subject(&self, schema: &str, table: &str) -> String {
        format!(
            "{}.{}.{}.{}",
            self.subject_prefix,
            self.project_ref(),
            schema,
            table
        )
    }

    /// Safe key for logging (keeps the first 4 chars)
    pub fn api_key_safe(&self) -> String {
        let head: String = self.api_key.chars().take(4).collect();
        format!("{head}****")
    }

    /// Log all config (safe)
    pub fn log_summary(&self) {
        use tracing::info;
        info!("╭─ Realtime Config ──────────────────────╮");
        info!("│ url:       {:<27} │", &self.realtime_url);
        info!("│ key:       {:<27} │", self.api_key_safe());
        info!("│ project:   {:<27} │", self.project_ref());
        info!("│ nats:      {:<27} │", &self.nats_url);
        info!("│ prefix:    {:<27} │", &self.subject_prefix);
        info!(
            "│ retry:     {}ms x{} timeout={}s{:<8} │",
            self.reconnect_base_ms, self.max_reconnect_attempts, self.subscribe_timeout_secs, ""
        );
        info!(
            "│ health:    {}s stale={}s{:<15} │",
            self.health_interval_secs, self.stale_after_secs, ""
        );
        info!("│ watch:     {:<27} │", self.watch.join(","));
        info!("╰────────────────────────────────────────╯");
    }
}

#[inline]
fn env<T: std::str::FromStr>(key: &str, default: T) -> T {
    var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[inline]
fn split_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Builder pattern for Config (useful for testing)
#[derive(Default)]
pub struct ConfigBuilder {
    realtime_url: Option<String>,
    api_key: Option<String>,
    log_level: Option<String>,
    shutdown_timeout_secs: Option<u64>,
    nats_url: Option<String>,
    subject_prefix: Option<String>,
    optimistic_timeout_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    reconnect_base_ms: Option<u64>,
    subscribe_timeout_secs: Option<u64>,
    health_interval_secs: Option<u64>,
    stale_after_secs: Option<u64>,
    watch: Option<Vec<String>>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn realtime_url(mut self, v: impl Into<String>) -> Self {
        self.realtime_url = Some(v.into());
        self
    }
    pub fn api_key(mut self, v: impl Into<String>) -> Self {
        self.api_key = Some(v.into());
        self
    }
    pub fn log_level(mut self, v: impl Into<String>) -> Self {
        self.log_level = Some(v.into());
        self
    }
    pub fn shutdown_timeout_secs(mut self, v: u64) -> Self {
        self.shutdown_timeout_secs = Some(v);
        self
    }
    pub fn nats_url(mut self, v: impl Into<String>) -> Self {
        self.nats_url = Some(v.into());
        self
    }
    pub fn subject_prefix(mut self, v: impl Into<String>) -> Self {
        self.subject_prefix = Some(v.into());
        self
    }
    pub fn optimistic_timeout_ms(mut self, v: u64) -> Self {
        self.optimistic_timeout_ms = Some(v);
        self
    }
    pub fn max_reconnect_attempts(mut self, v: u32) -> Self {
        self.max_reconnect_attempts = Some(v);
        self
    }
    pub fn reconnect_base_ms(mut self, v: u64) -> Self {
        self.reconnect_base_ms = Some(v);
        self
    }
    pub fn subscribe_timeout_secs(mut self, v: u64) -> Self {
        self.subscribe_timeout_secs = Some(v);
        self
    }
    pub fn health_interval_secs(mut self, v: u64) -> Self {
        self.health_interval_secs = Some(v);
        self
    }
    pub fn stale_after_secs(mut self, v: u64) -> Self {
        self.stale_after_secs = Some(v);
        self
    }
    pub fn watch(mut self, v: Vec<String>) -> Self {
        self.watch = Some(v);
        self
    }

    pub fn build(self) -> Result<Config> {
        let cfg = Config {
            realtime_url: self
                .realtime_url
                .ok_or_else(|| anyhow::anyhow!("realtime_url is required"))?,
            api_key: self
                .api_key
                .ok_or_else(|| anyhow::anyhow!("api_key is required"))?,
            log_level: self.log_level.unwrap_or_else(|| "info".into()),
            shutdown_timeout_secs: self.shutdown_timeout_secs.unwrap_or(5),
            nats_url: self
                .nats_url
                .unwrap_or_else(|| "nats://localhost:4222".into()),
            subject_prefix: self.subject_prefix.unwrap_or_else(|| "realtime".into()),
            optimistic_timeout_ms: self.optimistic_timeout_ms.unwrap_or(10_000),
            max_reconnect_attempts: self.max_reconnect_attempts.unwrap_or(5),
            reconnect_base_ms: self.reconnect_base_ms.unwrap_or(1000),
            subscribe_timeout_secs: self.subscribe_timeout_secs.unwrap_or(10),
            health_interval_secs: self.health_interval_secs.unwrap_or(30),
            stale_after_secs: self.stale_after_secs.unwrap_or(120),
            watch: self.watch.unwrap_or_default(),
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

impl Config {
    /// Create a builder for Config
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}
