//! Configuration types.
//!
//! Everything is read from the environment once at startup. `from_lookup`
//! takes the variable source as a closure so tests don't touch process env.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Top-level process configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// HTTP listen address.
    pub bind_addr: SocketAddr,
    /// libSQL database file.
    pub db_path: PathBuf,
    /// Capacity of the live-feed broadcast channel.
    pub feed_capacity: usize,
    pub intake: IntakeConfig,
    pub dispatcher: DispatcherConfig,
}

/// Webhook intake settings.
#[derive(Debug, Clone)]
pub struct IntakeConfig {
    /// Width of the arrival-time bucket used when a payload carries no idempotency hint.
    pub dedup_bucket: Duration,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            dedup_bucket: Duration::from_secs(5),
        }
    }
}

/// Scheduler/dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of independent polling workers spawned by this process.
    pub workers: usize,
    /// Sleep between passes when there was nothing to claim.
    pub poll_interval: Duration,
    /// Maximum firings claimed per pass.
    pub batch_size: usize,
    /// How long a claim stays exclusive.
    pub lease_duration: Duration,
    /// Upper bound on a single provider call.
    pub send_timeout: Duration,
    /// Attempts before a firing is marked failed.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            poll_interval: Duration::from_millis(1000),
            batch_size: 25,
            lease_duration: Duration::from_secs(60),
            send_timeout: Duration::from_secs(15),
            max_attempts: 5,
            backoff_base: Duration::from_secs(30),
            backoff_cap: Duration::from_secs(3600), // 1 hour
        }
    }
}

impl DispatcherConfig {
    /// Network timeout handed to the email and SMS providers.
    ///
    /// Kept below `send_timeout` so a provider call gives up on its own
    /// before the dispatcher stops waiting for it.
    pub fn provider_timeout(&self) -> Duration {
        self.send_timeout * 4 / 5
    }

    /// Reject combinations that would let a lease expire mid-send.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.send_timeout >= self.lease_duration {
            return Err(ConfigError::InvalidValue {
                key: "LEAD_RELAY_SEND_TIMEOUT_SECS".into(),
                message: format!(
                    "send timeout ({:?}) must be shorter than the lease ({:?})",
                    self.send_timeout, self.lease_duration
                ),
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "LEAD_RELAY_MAX_ATTEMPTS".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "LEAD_RELAY_BATCH_SIZE".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            db_path: PathBuf::from("./data/lead-relay.db"),
            feed_capacity: 256,
            intake: IntakeConfig::default(),
            dispatcher: DispatcherConfig::default(),
        }
    }
}

impl AppConfig {
    /// Build config from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let d = &defaults.dispatcher;

        let config = Self {
            bind_addr: parse_or(&lookup, "LEAD_RELAY_BIND", defaults.bind_addr)?,
            db_path: lookup("LEAD_RELAY_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path.clone()),
            feed_capacity: parse_or(&lookup, "LEAD_RELAY_FEED_CAPACITY", defaults.feed_capacity)?,
            intake: IntakeConfig {
                dedup_bucket: secs_or(
                    &lookup,
                    "LEAD_RELAY_DEDUP_BUCKET_SECS",
                    defaults.intake.dedup_bucket,
                )?,
            },
            dispatcher: DispatcherConfig {
                workers: parse_or(&lookup, "LEAD_RELAY_WORKERS", d.workers)?,
                poll_interval: Duration::from_millis(parse_or(
                    &lookup,
                    "LEAD_RELAY_POLL_INTERVAL_MS",
                    d.poll_interval.as_millis() as u64,
                )?),
                batch_size: parse_or(&lookup, "LEAD_RELAY_BATCH_SIZE", d.batch_size)?,
                lease_duration: secs_or(&lookup, "LEAD_RELAY_LEASE_SECS", d.lease_duration)?,
                send_timeout: secs_or(&lookup, "LEAD_RELAY_SEND_TIMEOUT_SECS", d.send_timeout)?,
                max_attempts: parse_or(&lookup, "LEAD_RELAY_MAX_ATTEMPTS", d.max_attempts)?,
                backoff_base: secs_or(&lookup, "LEAD_RELAY_BACKOFF_BASE_SECS", d.backoff_base)?,
                backoff_cap: secs_or(&lookup, "LEAD_RELAY_BACKOFF_CAP_SECS", d.backoff_cap)?,
            },
        };

        if config.intake.dedup_bucket.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "LEAD_RELAY_DEDUP_BUCKET_SECS".into(),
                message: "must be at least 1".into(),
            });
        }
        config.dispatcher.validate()?;
        Ok(config)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
        }
        _ => Ok(default),
    }
}

fn secs_or<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(lookup, key, default.as_secs()).map(Duration::from_secs)
}
