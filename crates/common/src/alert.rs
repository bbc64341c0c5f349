//! Alert records and the outcomes of operating on them.

use crate::{AlertId, CrisisSignal, TherapistId};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an alert. Everything except `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Pending,
    Claimed,
    Expired,
    Withdrawn,
}

impl AlertStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// The tracked record derived from one [`CrisisSignal`].
///
/// Copies handed out by the registry are snapshots; mutating one has no
/// effect on the canonical record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: AlertId,

    pub signal: CrisisSignal,

    pub status: AlertStatus,

    /// Set iff `status == Claimed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<TherapistId>,

    pub created_at: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<u64>,

    /// When the alert left `Pending`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub withdrawal_reason: Option<String>,
}

impl Alert {
    pub fn new(alert_id: AlertId, signal: CrisisSignal, created_at: u64) -> Self {
        Self {
            alert_id,
            signal,
            status: AlertStatus::Pending,
            claimed_by: None,
            created_at,
            claimed_at: None,
            closed_at: None,
            withdrawal_reason: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == AlertStatus::Pending
    }

    /// Patient the alert is about.
    pub fn patient_user_id(&self) -> &str {
        &self.signal.source_user_id
    }

    /// `claimed_by` and `claimed_at` are present exactly when claimed, and
    /// terminal alerts carry a close time.
    pub fn invariants_hold(&self) -> bool {
        let claimed = self.status == AlertStatus::Claimed;
        claimed == self.claimed_by.is_some()
            && claimed == self.claimed_at.is_some()
            && self.status.is_terminal() == self.closed_at.is_some()
    }
}

/// Result of a claim attempt. Only `Accepted` changes state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimResult {
    Accepted(Alert),
    AlreadyClaimed(TherapistId),
    NotFound,
    Expired,
    Withdrawn,
}

impl ClaimResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

/// State changes published by the registry, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertEvent {
    Created(Alert),
    Claimed(Alert),
    Expired(Alert),
    Withdrawn(Alert),
}

impl AlertEvent {
    pub fn alert(&self) -> &Alert {
        match self {
            Self::Created(a) | Self::Claimed(a) | Self::Expired(a) | Self::Withdrawn(a) => a,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Created(_) => "created",
            Self::Claimed(_) => "claimed",
            Self::Expired(_) => "expired",
            Self::Withdrawn(_) => "withdrawn",
        }
    }
}
