use std::collections::HashMap;

use serde::Deserialize;

pub const ENV_PREFIX: &str = "GATEHOUSE";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub metrics: MetricsConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub usage: UsageConfig,
    pub dial: DialConfig,
    pub pool: PoolConfig,
    pub monitor: MonitorConfig,
    pub heartbeat: HeartbeatConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Principal (or group) allowed to add controllers. Required.
    pub controller_admin: String,
    /// Static `name=token` login pairs, comma separated.
    #[serde(default)]
    pub users: String,
}

impl AuthConfig {
    /// Parses the `users` setting into a name → token map.
    pub fn user_tokens(&self) -> anyhow::Result<HashMap<String, String>> {
        let mut tokens = HashMap::new();
        for pair in self.users.split(',').filter(|p| !p.trim().is_empty()) {
            let Some((name, token)) = pair.trim().split_once('=') else {
                anyhow::bail!("auth.users entries must be \"name=token\", got {pair:?}");
            };
            tokens.insert(name.trim().to_string(), token.trim().to_string());
        }
        Ok(tokens)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UsageConfig {
    /// Metering authorization endpoint. Empty disables usage metering.
    #[serde(default)]
    pub sender_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DialConfig {
    #[serde(default = "default_dial_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_dial_retry_ms")]
    pub retry_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_pool_capacity")]
    pub capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Wait between full lease-acquisition sweeps.
    #[serde(default = "default_lease_acquire_interval_secs")]
    pub lease_acquire_interval_secs: u64,
    /// How long a lease is held before it must be renewed.
    #[serde(default = "default_lease_expiry_secs")]
    pub lease_expiry_secs: u64,
    /// Wait after a failed controller connection before retrying.
    #[serde(default = "default_api_connect_retry_secs")]
    pub api_connect_retry_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            lease_acquire_interval_secs: default_lease_acquire_interval_secs(),
            lease_expiry_secs: default_lease_expiry_secs(),
            api_connect_retry_secs: default_api_connect_retry_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    /// Idle window after which a client connection is closed.
    #[serde(default = "default_heartbeat_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_dial_timeout_secs() -> u64 {
    15
}

fn default_dial_retry_ms() -> u64 {
    500
}

fn default_pool_ttl_secs() -> u64 {
    300
}

fn default_pool_capacity() -> usize {
    64
}

fn default_lease_acquire_interval_secs() -> u64 {
    30
}

fn default_lease_expiry_secs() -> u64 {
    60
}

fn default_api_connect_retry_secs() -> u64 {
    5
}

fn default_heartbeat_idle_timeout_secs() -> u64 {
    90
}

impl MonitorConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.lease_expiry_secs == 0 {
            anyhow::bail!("monitor.lease_expiry_secs must be > 0");
        }
        if self.lease_acquire_interval_secs == 0 {
            anyhow::bail!("monitor.lease_acquire_interval_secs must be > 0");
        }
        Ok(())
    }
}

pub fn load() -> anyhow::Result<AppConfig> {
    let env = config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(false);

    let builder = config::Config::builder()
        .add_source(config::File::with_name("config").required(false))
        .add_source(env)
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 17070)?
        .set_default("metrics.host", "0.0.0.0")?
        .set_default("metrics.port", 9090)?
        .set_default("database.url", "sqlite://gatehouse.sqlite")?
        .set_default("auth.controller_admin", "")?
        .set_default("auth.users", "")?
        .set_default("usage.sender_url", "")?
        .set_default("dial.timeout_secs", default_dial_timeout_secs())?
        .set_default("dial.retry_ms", default_dial_retry_ms())?
        .set_default("pool.ttl_secs", default_pool_ttl_secs())?
        .set_default("pool.capacity", default_pool_capacity() as u64)?
        .set_default(
            "monitor.lease_acquire_interval_secs",
            default_lease_acquire_interval_secs(),
        )?
        .set_default("monitor.lease_expiry_secs", default_lease_expiry_secs())?
        .set_default(
            "monitor.api_connect_retry_secs",
            default_api_connect_retry_secs(),
        )?
        .set_default(
            "heartbeat.idle_timeout_secs",
            default_heartbeat_idle_timeout_secs(),
        )?;

    let cfg: AppConfig = builder.build()?.try_deserialize()?;
    cfg.monitor.validate()?;
    Ok(cfg)
}
