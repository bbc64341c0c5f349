//! Wire protocol between the dispatch server and therapist clients.
//!
//! Frames are JSON objects tagged by `type`:
//!
//! ```json
//! {"type": "accept_alert", "alert_id": "alert_..."}
//! {"type": "alert_withdrawn", "alert_id": "alert_...", "claimed_by": "t-7"}
//! ```

use crate::{Alert, AlertId, ClaimResult, ConnectionId, CrisisSignal, SeverityCategory, TherapistId};
use serde::{Deserialize, Serialize};

/// Why a claim did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    AlreadyClaimed,
    Expired,
    Withdrawn,
    NotFound,
}

/// Role asserted by the client's token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientRole {
    #[default]
    Therapist,
    Patient,
    Admin,
}

/// Server → client frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake accepted; replay of pending alerts follows.
    Connected {
        connection_id: ConnectionId,
        therapist_id: TherapistId,
        pending_alerts: usize,
    },

    NewAlert {
        alert_id: AlertId,
        signal: CrisisSignal,
        category: SeverityCategory,
        response_target: String,
        created_at: u64,
    },

    /// The alert is no longer open. `claimed_by` is absent for expiry and
    /// administrative withdrawal.
    AlertWithdrawn {
        alert_id: AlertId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        claimed_by: Option<TherapistId>,
    },

    SessionGranted {
        alert_id: AlertId,
    },

    ClaimRejected {
        alert_id: AlertId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        by_whom: Option<TherapistId>,
        reason: RejectReason,
    },

    /// Application-level heartbeat check; answer with `heartbeat`.
    Ping {
        seq: u64,
    },

    Error {
        code: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn new_alert(alert: &Alert) -> Self {
        Self::NewAlert {
            alert_id: alert.alert_id.clone(),
            signal: alert.signal.clone(),
            category: alert.signal.category(),
            response_target: alert.signal.response_target().to_string(),
            created_at: alert.created_at,
        }
    }

    /// The rejection frame for a failed claim, or `None` if it was accepted.
    pub fn rejection(alert_id: AlertId, result: &ClaimResult) -> Option<Self> {
        let (by_whom, reason) = match result {
            ClaimResult::Accepted(_) => return None,
            ClaimResult::AlreadyClaimed(winner) => {
                (Some(winner.clone()), RejectReason::AlreadyClaimed)
            }
            ClaimResult::Expired => (None, RejectReason::Expired),
            ClaimResult::Withdrawn => (None, RejectReason::Withdrawn),
            ClaimResult::NotFound => (None, RejectReason::NotFound),
        };
        Some(Self::ClaimRejected {
            alert_id,
            by_whom,
            reason,
        })
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Direct answers to the connection's own requests. These are never
    /// dropped on queue overflow.
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::SessionGranted { .. } | Self::ClaimRejected { .. })
    }

    pub fn alert_id(&self) -> Option<&AlertId> {
        match self {
            Self::NewAlert { alert_id, .. }
            | Self::AlertWithdrawn { alert_id, .. }
            | Self::SessionGranted { alert_id }
            | Self::ClaimRejected { alert_id, .. } => Some(alert_id),
            _ => None,
        }
    }
}

/// Client → server frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Must be the first frame on a new socket.
    Connect {
        therapist_id: TherapistId,
        auth_token: String,
        #[serde(default)]
        role: ClientRole,
    },

    AcceptAlert {
        alert_id: AlertId,
    },

    /// Hide the alert from this connection only.
    DismissAlert {
        alert_id: AlertId,
    },

    Heartbeat {
        #[serde(default)]
        seq: u64,
    },
}
