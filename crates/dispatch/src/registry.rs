//! The alert table.
//!
//! Every alert lives behind its own mutex. The table lock is only held long
//! enough to find or insert a slot, so claims on different alerts never
//! contend; concurrent claims on the same alert serialize on that alert's
//! mutex and exactly one of them observes `Pending`.
//!
//! State changes are published on an unbounded channel while the alert's
//! mutex is still held, so events for one alert are always emitted in
//! transition order.

use lifeline_common::{
    now_millis, Alert, AlertEvent, AlertId, AlertStatus, ClaimResult, CrisisSignal, TherapistId,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

struct AlertSlot {
    /// Registration order, used to keep replay stable.
    seq: u64,
    alert: Mutex<Alert>,
}

/// Counts of alerts currently held in the table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub pending: usize,
    pub claimed: usize,
    pub expired: usize,
    pub withdrawn: usize,
}

pub struct AlertRegistry {
    alerts: RwLock<HashMap<AlertId, Arc<AlertSlot>>>,
    next_seq: AtomicU64,
    retention: Duration,
    events: mpsc::UnboundedSender<AlertEvent>,
}

impl AlertRegistry {
    /// Create a registry and the receiving end of its event stream.
    pub fn new(retention: Duration) -> (Self, mpsc::UnboundedReceiver<AlertEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let registry = Self {
            alerts: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            retention,
            events,
        };
        (registry, rx)
    }

    /// Track a new alert for `signal`. Always succeeds.
    pub fn register(&self, signal: CrisisSignal) -> Alert {
        let alert_id = AlertId::generate();
        let alert = Alert::new(alert_id.clone(), signal, now_millis());
        let slot = Arc::new(AlertSlot {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            alert: Mutex::new(alert.clone()),
        });

        // Hold the new alert's lock until `Created` is out, so no transition
        // of this alert can be published ahead of it.
        let _guard = slot.alert.lock();
        self.alerts.write().insert(alert_id.clone(), slot.clone());

        info!(
            alert_id = %alert_id,
            severity = alert.signal.severity,
            urgency = ?alert.signal.urgency,
            "Alert registered"
        );
        self.emit(AlertEvent::Created(alert.clone()));
        alert
    }

    /// Try to give `therapist_id` ownership of the alert.
    pub fn claim(&self, alert_id: &AlertId, therapist_id: &TherapistId) -> ClaimResult {
        let Some(slot) = self.slot(alert_id) else {
            debug!(alert_id = %alert_id, therapist_id = %therapist_id, "Claim for unknown alert");
            return ClaimResult::NotFound;
        };

        let mut alert = slot.alert.lock();
        match alert.status {
            AlertStatus::Pending => {
                let now = now_millis();
                alert.status = AlertStatus::Claimed;
                alert.claimed_by = Some(therapist_id.clone());
                alert.claimed_at = Some(now);
                alert.closed_at = Some(now);
                assert_invariants(&alert);

                info!(alert_id = %alert_id, therapist_id = %therapist_id, "Alert claimed");
                let snapshot = alert.clone();
                self.emit(AlertEvent::Claimed(snapshot.clone()));
                ClaimResult::Accepted(snapshot)
            }
            AlertStatus::Claimed => {
                assert_invariants(&alert);
                match &alert.claimed_by {
                    Some(winner) => ClaimResult::AlreadyClaimed(winner.clone()),
                    None => unreachable!("claimed alert {} has no owner", alert_id),
                }
            }
            AlertStatus::Expired => ClaimResult::Expired,
            AlertStatus::Withdrawn => ClaimResult::Withdrawn,
        }
    }

    /// Expire the alert if nobody claimed it. Returns whether it transitioned.
    pub fn expire(&self, alert_id: &AlertId) -> bool {
        let changed = self.close(alert_id, AlertStatus::Expired, None);
        if changed {
            warn!(alert_id = %alert_id, "Alert expired unclaimed");
        }
        changed
    }

    /// Administratively remove a pending alert. Returns whether it transitioned.
    pub fn withdraw(&self, alert_id: &AlertId, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let changed = self.close(alert_id, AlertStatus::Withdrawn, Some(reason.clone()));
        if changed {
            info!(alert_id = %alert_id, reason = %reason, "Alert withdrawn");
        }
        changed
    }

    pub fn get(&self, alert_id: &AlertId) -> Option<Alert> {
        self.slot(alert_id).map(|slot| slot.alert.lock().clone())
    }

    /// Pending alerts in registration order.
    pub fn pending(&self) -> Vec<Alert> {
        let slots: Vec<Arc<AlertSlot>> = self.alerts.read().values().cloned().collect();
        let mut pending: Vec<(u64, Alert)> = slots
            .iter()
            .filter_map(|slot| {
                let alert = slot.alert.lock();
                alert.is_pending().then(|| (slot.seq, alert.clone()))
            })
            .collect();
        pending.sort_by_key(|(seq, _)| *seq);
        pending.into_iter().map(|(_, alert)| alert).collect()
    }

    /// Drop terminal alerts that closed more than the retention window
    /// before `now` (Unix millis). Returns how many were removed.
    pub fn sweep(&self, now: u64) -> usize {
        let retention_ms = self.retention.as_millis() as u64;
        let mut alerts = self.alerts.write();
        let before = alerts.len();
        alerts.retain(|_, slot| {
            let alert = slot.alert.lock();
            match alert.closed_at {
                Some(closed_at) => closed_at.saturating_add(retention_ms) > now,
                None => true,
            }
        });
        let removed = before - alerts.len();
        if removed > 0 {
            debug!(removed, remaining = alerts.len(), "Swept terminal alerts");
        }
        removed
    }

    pub fn stats(&self) -> RegistryStats {
        let slots: Vec<Arc<AlertSlot>> = self.alerts.read().values().cloned().collect();
        let mut stats = RegistryStats::default();
        for slot in slots {
            match slot.alert.lock().status {
                AlertStatus::Pending => stats.pending += 1,
                AlertStatus::Claimed => stats.claimed += 1,
                AlertStatus::Expired => stats.expired += 1,
                AlertStatus::Withdrawn => stats.withdrawn += 1,
            }
        }
        stats
    }

    fn slot(&self, alert_id: &AlertId) -> Option<Arc<AlertSlot>> {
        self.alerts.read().get(alert_id).cloned()
    }

    fn close(&self, alert_id: &AlertId, status: AlertStatus, reason: Option<String>) -> bool {
        let Some(slot) = self.slot(alert_id) else {
            return false;
        };

        let mut alert = slot.alert.lock();
        if !alert.is_pending() {
            return false;
        }
        alert.status = status;
        alert.closed_at = Some(now_millis());
        alert.withdrawal_reason = reason;
        assert_invariants(&alert);

        let snapshot = alert.clone();
        self.emit(match status {
            AlertStatus::Expired => AlertEvent::Expired(snapshot),
            _ => AlertEvent::Withdrawn(snapshot),
        });
        true
    }

    fn emit(&self, event: AlertEvent) {
        if self.events.send(event).is_err() {
            debug!("Alert event dropped, no hub is listening");
        }
    }
}

fn assert_invariants(alert: &Alert) {
    assert!(
        alert.invariants_hold(),
        "alert {} violates its state invariants: {:?}",
        alert.alert_id,
        alert
    );
}
