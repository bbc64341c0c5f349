//! Tunables for alert lifetimes and therapist connections.
//!
//! Loaded as the `[dispatch]` table of the server configuration file:
//!
//! ```toml
//! [dispatch.alerts]
//! ttl_secs = 300
//!
//! [dispatch.connections]
//! queue_capacity = 64
//! heartbeat_timeout_secs = 45
//! ```

use lifeline_common::{LifelineError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub alerts: AlertConfig,

    #[serde(default)]
    pub connections: ConnectionConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertConfig {
    /// How long an alert stays claimable before it expires
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,

    /// How long terminal alerts are kept so late claims get a definitive answer
    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    /// How often terminal alerts past retention are swept
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_ttl() -> u64 {
    300
}

fn default_retention() -> u64 {
    600
}

fn default_sweep_interval() -> u64 {
    30
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl(),
            retention_secs: default_retention(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Outbound messages buffered per connection before old ones are dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Silence after which a connection is declared dead
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,

    /// Time allowed for the `connect` frame after the socket opens
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

fn default_queue_capacity() -> usize {
    64
}

fn default_heartbeat_interval() -> u64 {
    15
}

fn default_heartbeat_timeout() -> u64 {
    45
}

fn default_handshake_timeout() -> u64 {
    10
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

impl AlertConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl ConnectionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl DispatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.alerts.ttl_secs == 0 {
            return Err(LifelineError::Config("alerts.ttl_secs must be positive".into()));
        }
        if self.alerts.sweep_interval_secs == 0 {
            return Err(LifelineError::Config(
                "alerts.sweep_interval_secs must be positive".into(),
            ));
        }
        if self.connections.queue_capacity == 0 {
            return Err(LifelineError::Config(
                "connections.queue_capacity must be positive".into(),
            ));
        }
        if self.connections.heartbeat_interval_secs == 0 {
            return Err(LifelineError::Config(
                "connections.heartbeat_interval_secs must be positive".into(),
            ));
        }
        if self.connections.heartbeat_timeout_secs <= self.connections.heartbeat_interval_secs {
            return Err(LifelineError::Config(format!(
                "connections.heartbeat_timeout_secs ({}) must exceed heartbeat_interval_secs ({})",
                self.connections.heartbeat_timeout_secs, self.connections.heartbeat_interval_secs
            )));
        }
        Ok(())
    }
}
