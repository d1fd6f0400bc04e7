// src/config.rs

use anyhow::{Context, Result, bail};
use std::{net::SocketAddr, str::FromStr, time::Duration};

use crate::queue::OverflowPolicy;

const DEFAULT_BUS_CHANNEL: &str = "chat:broadcast";

/// Runtime configuration of the chat subsystem.
#[derive(Clone, Debug)]
pub struct ChatConfig {
    pub server_addr: SocketAddr,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub redis_url: Option<String>,
    /// Unique per process; tags envelopes and owns presence keys.
    pub instance_id: String,

    pub workers: usize,
    pub ingest_queue_capacity: usize,
    pub ingest_overflow: OverflowPolicy,
    pub bus_queue_capacity: usize,
    pub bus_overflow: OverflowPolicy,
    pub summary_queue_capacity: usize,
    pub outbound_capacity: usize,

    pub max_content_chars: usize,

    pub heartbeat_interval: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub presence_ttl: Duration,
    pub unread_ttl: Duration,
    pub publish_timeout: Duration,

    pub bus_channel: String,
    pub dedup_capacity: usize,
    pub dedup_ttl: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            database_url: None,
            database_max_connections: 10,
            redis_url: None,
            instance_id: uuid::Uuid::new_v4().to_string(),
            workers: 5,
            ingest_queue_capacity: 2000,
            ingest_overflow: OverflowPolicy::Inline,
            bus_queue_capacity: 1000,
            bus_overflow: OverflowPolicy::Block,
            summary_queue_capacity: 2000,
            outbound_capacity: 256,
            max_content_chars: 1000,
            heartbeat_interval: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            presence_ttl: Duration::from_secs(5 * 60),
            unread_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            publish_timeout: Duration::from_millis(2000),
            bus_channel: DEFAULT_BUS_CHANNEL.to_string(),
            dedup_capacity: 10_000,
            dedup_ttl: Duration::from_secs(600),
        }
    }
}

impl ChatConfig {
    /// Loads configuration from the environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup. Unset keys keep
    /// their defaults; set but unparsable keys are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Self {
            server_addr: parse_or(&get, "SERVER_ADDR", defaults.server_addr)?,
            database_url: get("DATABASE_URL"),
            database_max_connections: parse_or(
                &get,
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            )?,
            redis_url: get("REDIS_URL"),
            instance_id: get("CHAT_INSTANCE_ID").unwrap_or(defaults.instance_id),
            workers: parse_or(&get, "CHAT_WORKERS", defaults.workers)?,
            ingest_queue_capacity: parse_or(
                &get,
                "CHAT_INGEST_QUEUE",
                defaults.ingest_queue_capacity,
            )?,
            ingest_overflow: parse_or(&get, "CHAT_INGEST_OVERFLOW", defaults.ingest_overflow)?,
            bus_queue_capacity: parse_or(&get, "CHAT_BUS_QUEUE", defaults.bus_queue_capacity)?,
            bus_overflow: parse_or(&get, "CHAT_BUS_OVERFLOW", defaults.bus_overflow)?,
            summary_queue_capacity: parse_or(
                &get,
                "CHAT_SUMMARY_QUEUE",
                defaults.summary_queue_capacity,
            )?,
            outbound_capacity: parse_or(
                &get,
                "CHAT_OUTBOUND_CAPACITY",
                defaults.outbound_capacity,
            )?,
            max_content_chars: parse_or(
                &get,
                "CHAT_MAX_CONTENT_CHARS",
                defaults.max_content_chars,
            )?,
            heartbeat_interval: secs_or(&get, "CHAT_HEARTBEAT_SECS", defaults.heartbeat_interval)?,
            read_timeout: secs_or(&get, "CHAT_READ_TIMEOUT_SECS", defaults.read_timeout)?,
            write_timeout: secs_or(&get, "CHAT_WRITE_TIMEOUT_SECS", defaults.write_timeout)?,
            presence_ttl: secs_or(&get, "CHAT_PRESENCE_TTL_SECS", defaults.presence_ttl)?,
            unread_ttl: secs_or(&get, "CHAT_UNREAD_TTL_SECS", defaults.unread_ttl)?,
            publish_timeout: Duration::from_millis(parse_or(
                &get,
                "CHAT_PUBLISH_TIMEOUT_MS",
                defaults.publish_timeout.as_millis() as u64,
            )?),
            bus_channel: get("CHAT_BUS_CHANNEL").unwrap_or(defaults.bus_channel),
            dedup_capacity: parse_or(&get, "CHAT_DEDUP_CAPACITY", defaults.dedup_capacity)?,
            dedup_ttl: secs_or(&get, "CHAT_DEDUP_TTL_SECS", defaults.dedup_ttl)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("CHAT_WORKERS must be at least 1");
        }
        if self.outbound_capacity == 0
            || self.ingest_queue_capacity == 0
            || self.bus_queue_capacity == 0
            || self.summary_queue_capacity == 0
        {
            bail!("queue capacities must be greater than zero");
        }
        if self.max_content_chars == 0 {
            bail!("CHAT_MAX_CONTENT_CHARS must be greater than zero");
        }
        if self.heartbeat_interval.is_zero() {
            bail!("CHAT_HEARTBEAT_SECS must be greater than zero");
        }
        if self.ingest_overflow == OverflowPolicy::Drop {
            bail!("CHAT_INGEST_OVERFLOW=drop would lose persisted messages; use inline or block");
        }
        Ok(())
    }
}

fn parse_or<F, T>(get: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        None => Ok(default),
    }
}

fn secs_or<F>(get: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(get, key, default.as_secs()).map(Duration::from_secs)
}
