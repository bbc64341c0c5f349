//! Per-IP limits on signal submissions and therapist sockets.
//!
//! Signal submissions use a sliding window. Sockets are counted with an RAII
//! guard held for the lifetime of the connection.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Signal submissions allowed per IP per window.
    pub max_signals: u32,
    pub window_secs: u64,
    /// Concurrent therapist sockets per IP.
    pub max_websocket_per_ip: u32,
    /// Maximum request body size in bytes.
    pub max_body_size: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_signals: 10,
            window_secs: 60,
            max_websocket_per_ip: 10,
            max_body_size: 64 * 1024,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_signals == 0 || self.window_secs == 0 {
            anyhow::bail!("rate_limit.max_signals and rate_limit.window_secs must be positive");
        }
        if self.max_body_size == 0 {
            anyhow::bail!("rate_limit.max_body_size must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RateLimitEntry {
    /// Submission timestamps within the window.
    submissions: Vec<Instant>,
    websockets: u32,
}

impl RateLimitEntry {
    fn prune(&mut self, window: Duration) {
        let now = Instant::now();
        self.submissions
            .retain(|t| now.saturating_duration_since(*t) < window);
    }

    fn is_idle(&self) -> bool {
        self.submissions.is_empty() && self.websockets == 0
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    entries: RwLock<HashMap<IpAddr, RateLimitEntry>>,
    last_cleanup: RwLock<Instant>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            last_cleanup: RwLock::new(Instant::now()),
        }
    }

    /// Record a signal submission from `ip`. Returns `false` if the IP is
    /// over its limit for the current window.
    pub fn check_signal(&self, ip: IpAddr) -> bool {
        self.maybe_cleanup();

        let mut entries = self.entries.write();
        let entry = entries.entry(ip).or_default();
        entry.prune(self.config.window());

        if entry.submissions.len() >= self.config.max_signals as usize {
            return false;
        }
        entry.submissions.push(Instant::now());
        true
    }

    pub fn acquire_websocket(&self, ip: IpAddr) -> bool {
        let mut entries = self.entries.write();
        let entry = entries.entry(ip).or_default();
        if entry.websockets >= self.config.max_websocket_per_ip {
            return false;
        }
        entry.websockets += 1;
        true
    }

    pub fn release_websocket(&self, ip: IpAddr) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(&ip) {
            entry.websockets = entry.websockets.saturating_sub(1);
        }
    }

    pub fn max_body_size(&self) -> usize {
        self.config.max_body_size
    }

    /// Drop idle entries every five minutes.
    fn maybe_cleanup(&self) {
        const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

        if self.last_cleanup.read().elapsed() <= CLEANUP_INTERVAL {
            return;
        }

        let mut entries = self.entries.write();
        let mut last = self.last_cleanup.write();
        if last.elapsed() > CLEANUP_INTERVAL {
            let window = self.config.window();
            entries.retain(|_, entry| {
                entry.prune(window);
                !entry.is_idle()
            });
            *last = Instant::now();
        }
    }

    pub fn stats(&self) -> RateLimitStats {
        let entries = self.entries.read();
        RateLimitStats {
            tracked_ips: entries.len(),
            total_websockets: entries.values().map(|e| e.websockets).sum(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStats {
    pub tracked_ips: usize,
    pub total_websockets: u32,
}

/// Holds one socket slot for `ip` until dropped.
pub struct WebSocketGuard {
    limiter: Arc<RateLimiter>,
    ip: IpAddr,
}

impl WebSocketGuard {
    pub fn new(limiter: Arc<RateLimiter>, ip: IpAddr) -> Option<Self> {
        limiter
            .acquire_websocket(ip)
            .then(|| Self { limiter, ip })
    }
}

impl Drop for WebSocketGuard {
    fn drop(&mut self) {
        self.limiter.release_websocket(self.ip);
    }
}
