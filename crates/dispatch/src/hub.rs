//! Fan-out between the alert registry and therapist connections.
//!
//! The hub is the only component that talks to both sides. It consumes the
//! registry's event stream in a background task and turns events into
//! per-connection frames, and it turns client requests into registry calls.
//!
//! Every step that decides which connections see which alert runs under one
//! short `fanout` lock: event handling, the withdrawal after a successful
//! claim, and connect-time replay. None of those steps await, so the lock is
//! never held across I/O. Together with the per-connection `shown` set this
//! gives each connection `NewAlert` before any other frame about that alert,
//! and at most one `NewAlert` per alert.

use crate::config::DispatchConfig;
use crate::connection::Connection;
use crate::presence::PresenceTracker;
use crate::registry::{AlertRegistry, RegistryStats};
use lifeline_common::{
    now_millis, Alert, AlertEvent, AlertId, ClaimResult, ClientMessage, ConnectionId,
    CrisisSignal, Result, ServerMessage, SessionLauncher, TherapistId,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Point-in-time counters for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub alerts: RegistryStats,
    pub online_therapists: usize,
    pub live_connections: usize,
}

pub struct BroadcastHub {
    config: DispatchConfig,
    registry: Arc<AlertRegistry>,
    presence: PresenceTracker,
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    fanout: Mutex<()>,
    launcher: Arc<dyn SessionLauncher>,
}

impl BroadcastHub {
    /// Build the hub and spawn its background tasks: the registry event
    /// loop, the retention sweeper and the heartbeat monitor. The tasks hold
    /// weak references and stop once the hub is dropped.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: DispatchConfig, launcher: Arc<dyn SessionLauncher>) -> Arc<Self> {
        let (registry, events) = AlertRegistry::new(config.alerts.retention());
        let hub = Arc::new(Self {
            config,
            registry: Arc::new(registry),
            presence: PresenceTracker::new(),
            connections: RwLock::new(HashMap::new()),
            fanout: Mutex::new(()),
            launcher,
        });

        tokio::spawn(run_event_loop(Arc::downgrade(&hub), events));
        tokio::spawn(run_sweeper(Arc::downgrade(&hub)));
        tokio::spawn(run_heartbeat_monitor(Arc::downgrade(&hub)));

        info!(
            launcher = hub.launcher.name(),
            ttl_secs = hub.config.alerts.ttl_secs,
            "Broadcast hub started"
        );
        hub
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn registry(&self) -> &AlertRegistry {
        &self.registry
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// Ingest a signal from the alert source. The returned id acknowledges
    /// receipt only; delivery to therapists happens asynchronously.
    pub fn submit_signal(&self, signal: CrisisSignal) -> Result<AlertId> {
        signal.validate()?;
        let alert = self.registry.register(signal);
        self.schedule_expiry(alert.alert_id.clone());
        Ok(alert.alert_id)
    }

    /// Administratively withdraw a pending alert.
    pub fn withdraw(&self, alert_id: &AlertId, reason: &str) -> bool {
        self.registry.withdraw(alert_id, reason)
    }

    /// Register a new connection for `therapist_id` and replay the alerts
    /// that are currently pending.
    pub fn connect(&self, therapist_id: TherapistId) -> Arc<Connection> {
        let connection = Arc::new(Connection::new(
            ConnectionId::generate(),
            therapist_id,
            self.config.connections.queue_capacity,
        ));

        let _fanout = self.fanout.lock();
        self.connections
            .write()
            .insert(connection.id().clone(), connection.clone());
        self.presence
            .connect(connection.therapist_id(), connection.id());

        let pending = self.registry.pending();
        connection.open();
        connection.enqueue(ServerMessage::Connected {
            connection_id: connection.id().clone(),
            therapist_id: connection.therapist_id().clone(),
            pending_alerts: pending.len(),
        });
        for alert in &pending {
            connection.replay_alert(alert);
        }

        info!(
            connection_id = %connection.id(),
            therapist_id = %connection.therapist_id(),
            replayed = pending.len(),
            "Therapist connected"
        );
        connection
    }

    pub fn disconnect(&self, connection_id: &ConnectionId) {
        let removed = self.connections.write().remove(connection_id);
        self.presence.disconnect(connection_id);
        if let Some(connection) = removed {
            connection.close();
            info!(
                connection_id = %connection_id,
                therapist_id = %connection.therapist_id(),
                dropped_frames = connection.dropped(),
                "Therapist disconnected"
            );
        }
    }

    /// Put every connection into draining so writers flush and then close.
    /// Used on server shutdown.
    pub fn drain_all(&self) -> usize {
        let connections: Vec<Arc<Connection>> = self.connections.read().values().cloned().collect();
        for connection in &connections {
            connection.drain();
        }
        info!(connections = connections.len(), "Draining therapist connections");
        connections.len()
    }

    pub fn connection(&self, connection_id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().get(connection_id).cloned()
    }

    /// Dispatch one inbound frame from an open connection.
    pub fn handle_client_message(&self, connection_id: &ConnectionId, message: ClientMessage) {
        let Some(connection) = self.connection(connection_id) else {
            debug!(connection_id = %connection_id, "Frame from unknown connection ignored");
            return;
        };

        match message {
            ClientMessage::AcceptAlert { alert_id } => {
                self.accept(&connection, &alert_id);
            }
            ClientMessage::DismissAlert { alert_id } => connection.dismiss(&alert_id),
            ClientMessage::Heartbeat { .. } => {
                connection.record_heartbeat();
                self.presence.touch(connection_id);
            }
            ClientMessage::Connect { .. } => {
                connection.enqueue(ServerMessage::error(
                    "ALREADY_CONNECTED",
                    "connect is only valid as the first frame",
                ));
            }
        }
    }

    /// Claim `alert_id` on behalf of the connection's therapist and answer
    /// the connection.
    pub fn accept(&self, connection: &Connection, alert_id: &AlertId) -> ClaimResult {
        let therapist_id = connection.therapist_id();
        let result = self.registry.claim(alert_id, therapist_id);

        match &result {
            ClaimResult::Accepted(_) => {
                let _fanout = self.fanout.lock();
                connection.mark_granted(alert_id);
                connection.enqueue(ServerMessage::SessionGranted {
                    alert_id: alert_id.clone(),
                });
                let notified = self.for_each_live(|other| {
                    other.id() != connection.id()
                        && other.withdraw_alert(alert_id, Some(therapist_id.clone()))
                });
                info!(
                    alert_id = %alert_id,
                    therapist_id = %therapist_id,
                    connection_id = %connection.id(),
                    notified,
                    "Session granted"
                );
            }
            ClaimResult::AlreadyClaimed(winner)
                if winner == therapist_id && connection.has_granted(alert_id) =>
            {
                debug!(alert_id = %alert_id, "Repeated accept from winning connection");
                connection.enqueue(ServerMessage::SessionGranted {
                    alert_id: alert_id.clone(),
                });
            }
            other => {
                debug!(
                    alert_id = %alert_id,
                    therapist_id = %therapist_id,
                    result = ?other,
                    "Claim rejected"
                );
                if let Some(rejection) = ServerMessage::rejection(alert_id.clone(), other) {
                    connection.enqueue(rejection);
                }
            }
        }
        result
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            alerts: self.registry.stats(),
            online_therapists: self.presence.online_therapists(),
            live_connections: self.presence.connection_count(),
        }
    }

    /// Close connections that missed their heartbeat and ping the rest.
    /// Returns the number of connections closed.
    pub fn check_heartbeats(&self, seq: u64) -> usize {
        let timeout = self.config.connections.heartbeat_timeout();
        let snapshot: Vec<Arc<Connection>> = self.connections.read().values().cloned().collect();
        let mut closed = 0;
        for connection in snapshot {
            if connection.heartbeat_expired(timeout) {
                warn!(
                    connection_id = %connection.id(),
                    therapist_id = %connection.therapist_id(),
                    "Heartbeat timed out, closing connection"
                );
                self.disconnect(connection.id());
                closed += 1;
            } else {
                connection.enqueue(ServerMessage::Ping { seq });
            }
        }
        closed
    }

    pub(crate) fn handle_event(&self, event: AlertEvent) {
        debug!(kind = event.kind(), alert_id = %event.alert().alert_id, "Alert event");
        match event {
            AlertEvent::Created(alert) => self.broadcast_new(&alert),
            AlertEvent::Claimed(alert) => self.launch_session(alert),
            AlertEvent::Expired(alert) | AlertEvent::Withdrawn(alert) => {
                let _fanout = self.fanout.lock();
                let notified = self.for_each_live(|c| c.withdraw_alert(&alert.alert_id, None));
                info!(
                    alert_id = %alert.alert_id,
                    status = ?alert.status,
                    notified,
                    "Alert closed without a claim"
                );
            }
        }
    }

    fn broadcast_new(&self, alert: &Alert) {
        let _fanout = self.fanout.lock();
        // A claim or expiry may already have landed; replays and
        // withdrawals have then been handled against the registry's view.
        let still_pending = self
            .registry
            .get(&alert.alert_id)
            .is_some_and(|current| current.is_pending());
        if !still_pending {
            debug!(alert_id = %alert.alert_id, "Alert closed before broadcast");
            return;
        }

        let delivered = self.for_each_live(|c| c.offer_alert(alert));
        info!(
            alert_id = %alert.alert_id,
            severity = alert.signal.severity,
            delivered,
            "Alert broadcast"
        );
        if delivered == 0 && self.presence.connection_count() == 0 {
            warn!(alert_id = %alert.alert_id, "No therapist online for new alert");
        }
    }

    fn launch_session(&self, alert: Alert) {
        let Some(therapist_id) = alert.claimed_by.clone() else {
            return;
        };
        let launcher = self.launcher.clone();
        tokio::spawn(async move {
            if let Err(e) = launcher
                .on_session_granted(&alert.alert_id, &therapist_id, alert.patient_user_id())
                .await
            {
                error!(
                    alert_id = %alert.alert_id,
                    therapist_id = %therapist_id,
                    launcher = launcher.name(),
                    error = %e,
                    "Session launcher failed"
                );
            }
        });
    }

    fn schedule_expiry(&self, alert_id: AlertId) {
        let registry = Arc::downgrade(&self.registry);
        let ttl = self.config.alerts.ttl();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(registry) = registry.upgrade() {
                registry.expire(&alert_id);
            }
        });
    }

    /// Apply `f` to every connection in the presence snapshot; returns how
    /// many calls returned true.
    fn for_each_live(&self, mut f: impl FnMut(&Connection) -> bool) -> usize {
        let connections = self.connections.read();
        self.presence
            .live_connections()
            .iter()
            .filter_map(|id| connections.get(id))
            .filter(|c| f(c))
            .count()
    }
}

async fn run_event_loop(hub: Weak<BroadcastHub>, mut events: mpsc::UnboundedReceiver<AlertEvent>) {
    while let Some(event) = events.recv().await {
        let Some(hub) = hub.upgrade() else {
            break;
        };
        hub.handle_event(event);
    }
    debug!("Alert event loop stopped");
}

async fn run_sweeper(hub: Weak<BroadcastHub>) {
    let period = match hub.upgrade() {
        Some(hub) => hub.config.alerts.sweep_interval(),
        None => return,
    };
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(hub) = hub.upgrade() else {
            break;
        };
        hub.registry.sweep(now_millis());
    }
}

async fn run_heartbeat_monitor(hub: Weak<BroadcastHub>) {
    let period = match hub.upgrade() {
        Some(hub) => hub.config.connections.heartbeat_interval(),
        None => return,
    };
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    let mut seq: u64 = 0;
    loop {
        ticker.tick().await;
        let Some(hub) = hub.upgrade() else {
            break;
        };
        seq += 1;
        hub.check_heartbeats(seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lifeline_common::{AlertStatus, LoggingLauncher, RejectReason};

    fn hub() -> Arc<BroadcastHub> {
        BroadcastHub::start(DispatchConfig::default(), Arc::new(LoggingLauncher))
    }

    /// Feed pending registry events through the hub synchronously.
    fn settle(hub: &BroadcastHub, events: &mut mpsc::UnboundedReceiver<AlertEvent>) {
        while let Ok(event) = events.try_recv() {
            hub.handle_event(event);
        }
    }

    /// A hub whose event stream is driven by the test instead of a task.
    fn manual_hub() -> (BroadcastHub, mpsc::UnboundedReceiver<AlertEvent>) {
        let config = DispatchConfig::default();
        let (registry, events) = AlertRegistry::new(config.alerts.retention());
        let hub = BroadcastHub {
            config,
            registry: Arc::new(registry),
            presence: PresenceTracker::new(),
            connections: RwLock::new(HashMap::new()),
            fanout: Mutex::new(()),
            launcher: Arc::new(LoggingLauncher),
        };
        (hub, events)
    }

    fn alert_ids(frames: &[ServerMessage]) -> Vec<AlertId> {
        frames
            .iter()
            .filter_map(|f| match f {
                ServerMessage::NewAlert { alert_id, .. } => Some(alert_id.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_signal() {
        let hub = hub();
        assert!(hub.submit_signal(CrisisSignal::new("p1", 0)).is_err());
        assert_eq!(hub.stats().alerts.pending, 0);
    }

    #[tokio::test]
    async fn test_connect_replays_pending_in_order() {
        let (hub, mut events) = manual_hub();
        let ids: Vec<AlertId> = (0..4)
            .map(|_| hub.registry.register(CrisisSignal::new("p", 7)).alert_id)
            .collect();
        hub.registry.claim(&ids[0], &TherapistId::new("t9"));
        hub.registry.claim(&ids[2], &TherapistId::new("t9"));
        settle(&hub, &mut events);

        let conn = hub.connect(TherapistId::new("t1"));
        let frames = conn.drain_queued();
        assert_eq!(
            frames[0],
            ServerMessage::Connected {
                connection_id: conn.id().clone(),
                therapist_id: TherapistId::new("t1"),
                pending_alerts: 2,
            }
        );
        assert_eq!(alert_ids(&frames), vec![ids[1].clone(), ids[3].clone()]);
    }

    #[tokio::test]
    async fn test_broadcast_and_replay_do_not_duplicate() {
        let (hub, mut events) = manual_hub();
        let alert = hub.registry.register(CrisisSignal::new("p", 8));
        // Connect lands between registration and the broadcast.
        let conn = hub.connect(TherapistId::new("t1"));
        settle(&hub, &mut events);

        let frames = conn.drain_queued();
        assert_eq!(alert_ids(&frames), vec![alert.alert_id]);
    }

    #[tokio::test]
    async fn test_claim_before_broadcast_is_not_shown() {
        let (hub, mut events) = manual_hub();
        let t1 = hub.connect(TherapistId::new("t1"));
        let t2 = hub.connect(TherapistId::new("t2"));
        t1.drain_queued();
        t2.drain_queued();

        let alert = hub.registry.register(CrisisSignal::new("p", 8));
        assert!(hub.accept(&t2, &alert.alert_id).is_accepted());
        settle(&hub, &mut events);

        // t1 never saw the alert, so it gets neither NewAlert nor a withdrawal.
        assert!(t1.drain_queued().is_empty());
        assert_eq!(
            t2.drain_queued(),
            vec![ServerMessage::SessionGranted {
                alert_id: alert.alert_id
            }]
        );
    }

    #[tokio::test]
    async fn test_dismiss_is_local_and_sticky() {
        let (hub, mut events) = manual_hub();
        let t1 = hub.connect(TherapistId::new("t1"));
        let t2 = hub.connect(TherapistId::new("t2"));
        let alert = hub.registry.register(CrisisSignal::new("p", 6));
        settle(&hub, &mut events);
        t1.drain_queued();
        t2.drain_queued();

        hub.handle_client_message(
            t1.id(),
            ClientMessage::DismissAlert {
                alert_id: alert.alert_id.clone(),
            },
        );
        assert!(hub.registry.get(&alert.alert_id).unwrap().is_pending());
        assert!(hub.accept(&t2, &alert.alert_id).is_accepted());
    }

    #[tokio::test]
    async fn test_repeated_accept_from_winner() {
        let (hub, mut events) = manual_hub();
        let c1 = hub.connect(TherapistId::new("t1"));
        let c2 = hub.connect(TherapistId::new("t1"));
        let alert = hub.registry.register(CrisisSignal::new("p", 9));
        settle(&hub, &mut events);
        c1.drain_queued();
        c2.drain_queued();

        hub.accept(&c1, &alert.alert_id);
        hub.accept(&c1, &alert.alert_id);
        let granted = ServerMessage::SessionGranted {
            alert_id: alert.alert_id.clone(),
        };
        assert_eq!(c1.drain_queued(), vec![granted.clone(), granted]);

        hub.accept(&c2, &alert.alert_id);
        let frames = c2.drain_queued();
        assert_eq!(
            frames.last(),
            Some(&ServerMessage::ClaimRejected {
                alert_id: alert.alert_id,
                by_whom: Some(TherapistId::new("t1")),
                reason: RejectReason::AlreadyClaimed,
            })
        );
    }

    #[tokio::test]
    async fn test_drain_all_flushes_then_ends_writers() {
        let (hub, mut events) = manual_hub();
        let conn = hub.connect(TherapistId::new("t1"));
        let alert = hub.registry.register(CrisisSignal::new("p", 5));
        settle(&hub, &mut events);

        assert_eq!(hub.drain_all(), 1);
        hub.registry.register(CrisisSignal::new("p2", 5));
        settle(&hub, &mut events);

        assert!(matches!(conn.next_outbound().await, Some(ServerMessage::Connected { .. })));
        match conn.next_outbound().await {
            Some(ServerMessage::NewAlert { alert_id, .. }) => assert_eq!(alert_id, alert.alert_id),
            other => panic!("expected new_alert, got {:?}", other),
        }
        assert_eq!(conn.next_outbound().await, None);
    }

    #[tokio::test]
    async fn test_withdraw_notifies_viewers() {
        let (hub, mut events) = manual_hub();
        let conn = hub.connect(TherapistId::new("t1"));
        let alert = hub.registry.register(CrisisSignal::new("p", 5));
        settle(&hub, &mut events);
        conn.drain_queued();

        assert!(hub.withdraw(&alert.alert_id, "source retracted"));
        assert!(!hub.withdraw(&alert.alert_id, "again"));
        settle(&hub, &mut events);

        assert_eq!(
            conn.drain_queued(),
            vec![ServerMessage::AlertWithdrawn {
                alert_id: alert.alert_id.clone(),
                claimed_by: None,
            }]
        );
        assert_eq!(
            hub.registry.get(&alert.alert_id).unwrap().status,
            AlertStatus::Withdrawn
        );
    }

    #[tokio::test]
    async fn test_second_connect_frame_is_an_error() {
        let (hub, _events) = manual_hub();
        let conn = hub.connect(TherapistId::new("t1"));
        conn.drain_queued();
        hub.handle_client_message(
            conn.id(),
            ClientMessage::Connect {
                therapist_id: TherapistId::new("t1"),
                auth_token: "tok".into(),
                role: Default::default(),
            },
        );
        assert!(matches!(
            conn.drain_queued().as_slice(),
            [ServerMessage::Error { code, .. }] if code == "ALREADY_CONNECTED"
        ));
    }

    #[tokio::test]
    async fn test_disconnect_clears_presence() {
        let (hub, _events) = manual_hub();
        let conn = hub.connect(TherapistId::new("t1"));
        assert!(hub.presence.is_online(&TherapistId::new("t1")));

        hub.disconnect(conn.id());
        assert!(!hub.presence.is_online(&TherapistId::new("t1")));
        assert!(conn.is_closed());
        assert!(hub.connection(conn.id()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_heartbeats_closes_silent_connections() {
        let (hub, _events) = manual_hub();
        let quiet = hub.connect(TherapistId::new("t1"));
        let chatty = hub.connect(TherapistId::new("t2"));
        quiet.drain_queued();
        chatty.drain_queued();

        tokio::time::advance(std::time::Duration::from_secs(40)).await;
        hub.handle_client_message(chatty.id(), ClientMessage::Heartbeat { seq: 1 });
        tokio::time::advance(std::time::Duration::from_secs(10)).await;

        assert_eq!(hub.check_heartbeats(2), 1);
        assert!(quiet.is_closed());
        assert_eq!(chatty.drain_queued(), vec![ServerMessage::Ping { seq: 2 }]);
        assert_eq!(hub.stats().live_connections, 1);
    }
}
