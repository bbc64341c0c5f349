//! Application state for the API server.

use crate::auth::ApiKeyConfig;
use crate::config::ServerConfig;
use crate::launcher::WebhookLauncher;
use crate::rate_limit::RateLimiter;
use lifeline_common::{LoggingLauncher, SessionLauncher};
use lifeline_dispatch::BroadcastHub;
use std::sync::Arc;

pub struct AppState {
    pub hub: Arc<BroadcastHub>,

    pub limiter: Arc<RateLimiter>,

    /// Bearer key for signal and admin routes; open when `None`
    pub api_key: Option<ApiKeyConfig>,

    /// Server start time (for health checks)
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Build the state and start the dispatch hub. Must be called from within
    /// a Tokio runtime.
    pub fn new(config: ServerConfig) -> lifeline_common::Result<Self> {
        let launcher: Arc<dyn SessionLauncher> = match &config.session_webhook {
            Some(webhook) => Arc::new(WebhookLauncher::new(webhook)?),
            None => Arc::new(LoggingLauncher),
        };
        Ok(Self::with_launcher(config, launcher))
    }

    pub fn with_launcher(config: ServerConfig, launcher: Arc<dyn SessionLauncher>) -> Self {
        Self {
            hub: BroadcastHub::start(config.dispatch, launcher),
            limiter: Arc::new(RateLimiter::new(config.rate_limit)),
            api_key: config.api_key.map(ApiKeyConfig::new),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn with_api_key(mut self, api_key: ApiKeyConfig) -> Self {
        self.api_key = Some(api_key);
        self
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
