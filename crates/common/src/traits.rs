//! Collaborator traits.
//!
//! Defined in `lifeline-common` so the dispatch core and the API crate can
//! both reference them without depending on each other.

use crate::{AlertId, Result, TherapistId};
use async_trait::async_trait;
use tracing::info;

/// Starts the clinical session once a therapist has claimed an alert.
///
/// The dispatch core calls this in a detached task and never waits for the
/// outcome; failures are logged by the caller and otherwise ignored.
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    /// Human-readable name used in logs.
    fn name(&self) -> &str;

    async fn on_session_granted(
        &self,
        alert_id: &AlertId,
        therapist_id: &TherapistId,
        patient_user_id: &str,
    ) -> Result<()>;
}

/// Launcher that only records the grant in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingLauncher;

#[async_trait]
impl SessionLauncher for LoggingLauncher {
    fn name(&self) -> &str {
        "logging"
    }

    async fn on_session_granted(
        &self,
        alert_id: &AlertId,
        therapist_id: &TherapistId,
        patient_user_id: &str,
    ) -> Result<()> {
        info!(
            alert_id = %alert_id,
            therapist_id = %therapist_id,
            patient_user_id = %patient_user_id,
            "Crisis session granted"
        );
        Ok(())
    }
}
