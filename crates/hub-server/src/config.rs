//! Configuration for the hub and its TCP gateway.
//!
//! You can either use defaults or override via environment variables:
//!
//! - `HUB_BIND_ADDR`               (default: "0.0.0.0")
//! - `HUB_PORT`                    (default: "9000")
//! - `HUB_MAX_CLIENTS`             (default: "1024")
//! - `HUB_QUEUE_CAPACITY`          (default: "256")
//! - `HUB_EVENT_CAPACITY`          (default: "1024")
//! - `HUB_READ_IDLE_TIMEOUT_SECS`  (default: "60")
//! - `HUB_WRITE_DEADLINE_SECS`     (default: "10")
//! - `HUB_KEEPALIVE_INTERVAL_SECS` (default: "54")
//! - `HUB_SHUTDOWN_GRACE_SECS`     (default: "5")
//! - `HUB_STATS_INTERVAL_SECS`     (default: "30", 0 disables)

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};
use hub_protocol::FrameFormat;

/// Timings and capacities of one hub.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Envelopes buffered per connection before new ones are dropped.
    pub outbound_queue_capacity: usize,

    /// Capacity of each of the hub's register/unregister/broadcast streams.
    pub event_queue_capacity: usize,

    /// A connection that sends nothing for this long is closed.
    pub read_idle_timeout: Duration,

    /// Upper bound on one frame write.
    pub write_deadline: Duration,

    /// How often the write pump pings an otherwise quiet peer.
    pub keepalive_interval: Duration,

    /// How long shutdown waits for connections to report closure.
    pub shutdown_grace: Duration,

    /// Framing used by `Hub::accept` when the gateway did not pick one.
    pub frame_format: FrameFormat,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            outbound_queue_capacity: 256,
            event_queue_capacity: 1024,
            read_idle_timeout: Duration::from_secs(60),
            write_deadline: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(54),
            shutdown_grace: Duration::from_secs(5),
            frame_format: FrameFormat::LengthPrefixed,
        }
    }
}

impl HubConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = HubConfig::default();

        let config = HubConfig {
            outbound_queue_capacity: read_env_or_default(
                "HUB_QUEUE_CAPACITY",
                defaults.outbound_queue_capacity,
            )?,
            event_queue_capacity: read_env_or_default(
                "HUB_EVENT_CAPACITY",
                defaults.event_queue_capacity,
            )?,
            read_idle_timeout: read_secs_or_default(
                "HUB_READ_IDLE_TIMEOUT_SECS",
                defaults.read_idle_timeout,
            )?,
            write_deadline: read_secs_or_default("HUB_WRITE_DEADLINE_SECS", defaults.write_deadline)?,
            keepalive_interval: read_secs_or_default(
                "HUB_KEEPALIVE_INTERVAL_SECS",
                defaults.keepalive_interval,
            )?,
            shutdown_grace: read_secs_or_default("HUB_SHUTDOWN_GRACE_SECS", defaults.shutdown_grace)?,
            frame_format: defaults.frame_format,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pumps cannot work with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.outbound_queue_capacity == 0 {
            bail!("outbound queue capacity must be at least 1");
        }
        if self.event_queue_capacity == 0 {
            bail!("event queue capacity must be at least 1");
        }
        if self.write_deadline.is_zero() || self.shutdown_grace.is_zero() {
            bail!("write deadline and shutdown grace must be non-zero");
        }
        // Peers answer pings, so a keepalive shorter than the idle timeout
        // keeps healthy-but-quiet connections open.
        if self.keepalive_interval.is_zero() || self.keepalive_interval >= self.read_idle_timeout {
            bail!(
                "keepalive interval ({:?}) must be non-zero and shorter than the read idle timeout ({:?})",
                self.keepalive_interval,
                self.read_idle_timeout
            );
        }
        Ok(())
    }
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// IP address / interface to bind to (e.g. "0.0.0.0" or "127.0.0.1").
    pub bind_addr: String,

    /// TCP port to listen on.
    pub port: u16,

    /// Maximum number of simultaneously connected clients.
    pub max_clients: usize,

    /// How often the binary logs hub stats; `None` disables it.
    pub stats_interval: Option<Duration>,

    pub hub: HubConfig,
}

impl ServerConfig {
    /// Construct a `ServerConfig` from environment variables, falling back
    /// to reasonable defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr = env::var("HUB_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = read_env_or_default("HUB_PORT", 9000u16)?;
        let max_clients = read_env_or_default("HUB_MAX_CLIENTS", 1024usize)?;
        let stats_interval = read_secs_or_default("HUB_STATS_INTERVAL_SECS", Duration::from_secs(30))?;

        Ok(ServerConfig {
            bind_addr,
            port,
            max_clients,
            stats_interval: (!stats_interval.is_zero()).then_some(stats_interval),
            hub: HubConfig::from_env()?,
        })
    }

    /// Convenience: `addr:port` socket string.
    pub fn socket_addr_string(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

fn read_env_or_default<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(val) => val
            .trim()
            .parse::<T>()
            .with_context(|| format!("invalid value for {}: {:?}", key, val)),
        Err(_) => Ok(default),
    }
}

fn read_secs_or_default(key: &str, default: Duration) -> anyhow::Result<Duration> {
    let secs = read_env_or_default(key, default.as_secs())?;
    Ok(Duration::from_secs(secs))
}
