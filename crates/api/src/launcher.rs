//! Session launcher that announces grants to an HTTP endpoint.

use crate::config::WebhookConfig;
use async_trait::async_trait;
use lifeline_common::{AlertId, LifelineError, Result, SessionLauncher, TherapistId};
use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Serialize)]
struct SessionGrantedPayload<'a> {
    alert_id: &'a AlertId,
    therapist_id: &'a TherapistId,
    patient_user_id: &'a str,
}

/// POSTs `{alert_id, therapist_id, patient_user_id}` to the configured URL.
pub struct WebhookLauncher {
    client: reqwest::Client,
    url: String,
}

impl WebhookLauncher {
    pub fn new(config: &WebhookConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| LifelineError::Launcher(format!("failed to build HTTP client: {}", e)))?;

        info!(url = %config.url, "Session webhook configured");
        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }
}

#[async_trait]
impl SessionLauncher for WebhookLauncher {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn on_session_granted(
        &self,
        alert_id: &AlertId,
        therapist_id: &TherapistId,
        patient_user_id: &str,
    ) -> Result<()> {
        let payload = SessionGrantedPayload {
            alert_id,
            therapist_id,
            patient_user_id,
        };

        let response = self
            .client
            .post(self.url.as_str())
            .json(&payload)
            .send()
            .await
            .map_err(|e| LifelineError::Launcher(format!("webhook request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LifelineError::Launcher(format!(
                "webhook returned {}",
                status
            )));
        }

        debug!(alert_id = %alert_id, status = %status, "Session webhook delivered");
        Ok(())
    }
}
