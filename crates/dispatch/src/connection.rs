//! One therapist connection: its outbound queue and what it has been shown.
//!
//! The socket task owns the network side and pulls frames with
//! [`Connection::next_outbound`]; the hub pushes frames without ever
//! blocking. When the queue is full the oldest droppable frame is evicted
//! (pings first, then other non-critical frames). `SessionGranted` and
//! `ClaimRejected` are never evicted.

use lifeline_common::{Alert, AlertId, ConnectionId, ServerMessage, TherapistId};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    /// No new frames accepted; queued ones are still delivered.
    Draining,
    Closed,
}

/// Bounded FIFO of server frames.
#[derive(Debug)]
pub struct OutboundQueue {
    messages: VecDeque<ServerMessage>,
    capacity: usize,
    dropped: u64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: VecDeque::with_capacity(capacity.min(256)),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    /// Append a frame, evicting if over capacity. Returns the evicted frame.
    pub fn push(&mut self, message: ServerMessage) -> Option<ServerMessage> {
        self.messages.push_back(message);
        if self.messages.len() <= self.capacity {
            return None;
        }
        let victim = self
            .messages
            .iter()
            .position(|m| matches!(m, ServerMessage::Ping { .. }))
            .or_else(|| self.messages.iter().position(|m| !m.is_critical()))?;
        self.dropped += 1;
        self.messages.remove(victim)
    }

    /// Append without eviction; used for connect-time replay.
    pub fn push_unbounded(&mut self, message: ServerMessage) {
        self.messages.push_back(message);
    }

    /// Remove queued withdrawal notices for `alert_id`.
    pub fn remove_withdrawals(&mut self, alert_id: &AlertId) -> usize {
        let before = self.messages.len();
        self.messages.retain(
            |m| !matches!(m, ServerMessage::AlertWithdrawn { alert_id: id, .. } if id == alert_id),
        );
        before - self.messages.len()
    }

    pub fn pop(&mut self) -> Option<ServerMessage> {
        self.messages.pop_front()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

struct ConnectionInner {
    state: ConnectionState,
    queue: OutboundQueue,
    /// Alerts this connection has been sent a `NewAlert` for.
    shown: HashSet<AlertId>,
    dismissed: HashSet<AlertId>,
    /// Alerts this connection itself won.
    granted: HashSet<AlertId>,
    last_heartbeat: Instant,
}

pub struct Connection {
    id: ConnectionId,
    therapist_id: TherapistId,
    inner: Mutex<ConnectionInner>,
    wake: Notify,
}

impl Connection {
    pub fn new(id: ConnectionId, therapist_id: TherapistId, queue_capacity: usize) -> Self {
        Self {
            id,
            therapist_id,
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Connecting,
                queue: OutboundQueue::new(queue_capacity),
                shown: HashSet::new(),
                dismissed: HashSet::new(),
                granted: HashSet::new(),
                last_heartbeat: Instant::now(),
            }),
            wake: Notify::new(),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn therapist_id(&self) -> &TherapistId {
        &self.therapist_id
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn open(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Connecting {
            inner.state = ConnectionState::Open;
            inner.last_heartbeat = Instant::now();
        }
    }

    /// Stop accepting frames but let the writer flush what is queued.
    pub fn drain(&self) {
        let mut inner = self.inner.lock();
        if accepts_frames(inner.state) {
            inner.state = ConnectionState::Draining;
            drop(inner);
            self.wake.notify_one();
        }
    }

    pub fn close(&self) {
        self.inner.lock().state = ConnectionState::Closed;
        self.wake.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Queue a frame. Returns false if the connection no longer accepts frames.
    pub fn enqueue(&self, message: ServerMessage) -> bool {
        let mut inner = self.inner.lock();
        if !accepts_frames(inner.state) {
            return false;
        }
        inner.push(&self.id, message);
        drop(inner);
        self.wake.notify_one();
        true
    }

    /// Show a pending alert unless this connection already saw or dismissed it.
    pub fn offer_alert(&self, alert: &Alert) -> bool {
        self.offer(alert, false)
    }

    /// Like [`offer_alert`](Self::offer_alert), but never evicts; used for
    /// connect-time replay.
    pub fn replay_alert(&self, alert: &Alert) -> bool {
        self.offer(alert, true)
    }

    fn offer(&self, alert: &Alert, replay: bool) -> bool {
        let mut inner = self.inner.lock();
        if !accepts_frames(inner.state)
            || inner.dismissed.contains(&alert.alert_id)
            || !inner.shown.insert(alert.alert_id.clone())
        {
            return false;
        }
        let message = ServerMessage::new_alert(alert);
        if replay {
            inner.queue.push_unbounded(message);
        } else {
            inner.push(&self.id, message);
        }
        drop(inner);
        self.wake.notify_one();
        true
    }

    /// Tell this connection an alert it was shown is closed. Connections that
    /// never saw the alert get nothing.
    pub fn withdraw_alert(&self, alert_id: &AlertId, claimed_by: Option<TherapistId>) -> bool {
        if !self.inner.lock().shown.contains(alert_id) {
            return false;
        }
        self.enqueue(ServerMessage::AlertWithdrawn {
            alert_id: alert_id.clone(),
            claimed_by,
        })
    }

    pub fn has_shown(&self, alert_id: &AlertId) -> bool {
        self.inner.lock().shown.contains(alert_id)
    }

    pub fn dismiss(&self, alert_id: &AlertId) {
        debug!(connection_id = %self.id, alert_id = %alert_id, "Alert dismissed locally");
        self.inner.lock().dismissed.insert(alert_id.clone());
    }

    pub fn is_dismissed(&self, alert_id: &AlertId) -> bool {
        self.inner.lock().dismissed.contains(alert_id)
    }

    pub fn mark_granted(&self, alert_id: &AlertId) {
        self.inner.lock().granted.insert(alert_id.clone());
    }

    pub fn has_granted(&self, alert_id: &AlertId) -> bool {
        self.inner.lock().granted.contains(alert_id)
    }

    pub fn record_heartbeat(&self) {
        self.inner.lock().last_heartbeat = Instant::now();
    }

    pub fn heartbeat_expired(&self, timeout: Duration) -> bool {
        self.inner.lock().last_heartbeat.elapsed() > timeout
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn dropped(&self) -> u64 {
        self.inner.lock().queue.dropped()
    }

    /// Next frame to write, waiting if the queue is empty. Returns `None`
    /// once the connection is closed, or drained and empty.
    pub async fn next_outbound(&self) -> Option<ServerMessage> {
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.state == ConnectionState::Closed {
                    return None;
                }
                if let Some(message) = inner.queue.pop() {
                    return Some(message);
                }
                if inner.state == ConnectionState::Draining {
                    return None;
                }
            }
            self.wake.notified().await;
        }
    }

    /// Everything currently queued, without waiting.
    pub fn drain_queued(&self) -> Vec<ServerMessage> {
        let mut inner = self.inner.lock();
        std::iter::from_fn(|| inner.queue.pop()).collect()
    }
}

impl ConnectionInner {
    /// Bounded push. An evicted `NewAlert` counts as never shown: the alert
    /// leaves `shown` and any withdrawal queued behind it goes too.
    fn push(&mut self, connection_id: &ConnectionId, message: ServerMessage) {
        let Some(evicted) = self.queue.push(message) else {
            return;
        };
        if let ServerMessage::NewAlert { alert_id, .. } = &evicted {
            self.shown.remove(alert_id);
            self.queue.remove_withdrawals(alert_id);
        }
        warn!(
            connection_id = %connection_id,
            evicted = ?evicted.alert_id(),
            queued = self.queue.len(),
            "Outbound queue full, dropped oldest frame"
        );
    }
}

fn accepts_frames(state: ConnectionState) -> bool {
    matches!(state, ConnectionState::Connecting | ConnectionState::Open)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lifeline_common::{ClaimResult, CrisisSignal};

    fn connection(capacity: usize) -> Connection {
        let conn = Connection::new(ConnectionId::new("c1"), TherapistId::new("t1"), capacity);
        conn.open();
        conn
    }

    fn alert(id: &str) -> Alert {
        Alert::new(AlertId::new(id), CrisisSignal::new("p1", 8), 1)
    }

    fn withdrawn(id: &str) -> ServerMessage {
        ServerMessage::AlertWithdrawn {
            alert_id: AlertId::new(id),
            claimed_by: None,
        }
    }

    #[test]
    fn test_queue_evicts_oldest_non_critical() {
        let mut queue = OutboundQueue::new(2);
        let granted = ServerMessage::SessionGranted {
            alert_id: AlertId::new("a0"),
        };
        assert!(queue.push(granted.clone()).is_none());
        assert!(queue.push(withdrawn("a1")).is_none());

        let evicted = queue.push(withdrawn("a2"));
        assert_eq!(evicted, Some(withdrawn("a1")));
        assert_eq!(queue.pop(), Some(granted));
        assert_eq!(queue.pop(), Some(withdrawn("a2")));
        assert_eq!(queue.dropped(), 1);
    }

    #[test]
    fn test_queue_prefers_evicting_pings() {
        let mut queue = OutboundQueue::new(2);
        queue.push(withdrawn("a1"));
        queue.push(ServerMessage::Ping { seq: 1 });
        assert_eq!(queue.push(withdrawn("a2")), Some(ServerMessage::Ping { seq: 1 }));
    }

    #[test]
    fn test_critical_frames_are_never_evicted() {
        let mut queue = OutboundQueue::new(1);
        let id = AlertId::new("a1");
        let rejected = ServerMessage::rejection(id.clone(), &ClaimResult::NotFound).unwrap();
        queue.push(rejected.clone());
        queue.push(ServerMessage::SessionGranted { alert_id: id });
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 0);

        // A non-critical frame arriving at a queue full of critical ones is
        // itself the oldest droppable frame.
        assert_eq!(queue.push(withdrawn("a2")), Some(withdrawn("a2")));
        assert_eq!(queue.pop(), Some(rejected));
    }

    #[test]
    fn test_offer_alert_once_per_connection() {
        let conn = connection(8);
        let a = alert("a1");
        assert!(conn.offer_alert(&a));
        assert!(!conn.replay_alert(&a));
        assert_eq!(conn.queue_len(), 1);
        assert!(conn.has_shown(&a.alert_id));
    }

    #[test]
    fn test_dismissed_alerts_are_not_offered() {
        let conn = connection(8);
        let a = alert("a1");
        conn.dismiss(&a.alert_id);
        assert!(!conn.replay_alert(&a));
        assert!(conn.is_dismissed(&a.alert_id));
        assert_eq!(conn.queue_len(), 0);
    }

    #[test]
    fn test_withdraw_only_reaches_connections_that_saw_the_alert() {
        let conn = connection(8);
        let a = alert("a1");
        assert!(!conn.withdraw_alert(&a.alert_id, None));

        conn.offer_alert(&a);
        assert!(conn.withdraw_alert(&a.alert_id, Some(TherapistId::new("t2"))));

        let frames = conn.drain_queued();
        assert!(matches!(frames[0], ServerMessage::NewAlert { .. }));
        assert_eq!(
            frames[1],
            ServerMessage::AlertWithdrawn {
                alert_id: a.alert_id,
                claimed_by: Some(TherapistId::new("t2")),
            }
        );
    }

    #[test]
    fn test_evicted_alert_is_never_withdrawn() {
        let conn = connection(2);
        let (a, b, c) = (alert("a1"), alert("a2"), alert("a3"));
        conn.offer_alert(&a);
        conn.offer_alert(&b);
        conn.offer_alert(&c);
        assert!(!conn.has_shown(&a.alert_id));
        assert!(!conn.withdraw_alert(&a.alert_id, Some(TherapistId::new("t2"))));

        // This withdrawal evicts NewAlert(a2) and is discarded with it.
        conn.withdraw_alert(&b.alert_id, Some(TherapistId::new("t2")));
        assert!(!conn.has_shown(&b.alert_id));

        assert_eq!(conn.drain_queued(), vec![ServerMessage::new_alert(&c)]);
    }

    #[tokio::test]
    async fn test_drain_flushes_then_ends() {
        let conn = connection(8);
        let a = alert("a1");
        conn.offer_alert(&a);
        conn.drain();
        assert_eq!(conn.state(), ConnectionState::Draining);
        assert!(!conn.enqueue(ServerMessage::Ping { seq: 1 }));

        assert_eq!(conn.next_outbound().await, Some(ServerMessage::new_alert(&a)));
        assert_eq!(conn.next_outbound().await, None);
    }

    #[tokio::test]
    async fn test_drain_wakes_idle_writer() {
        let conn = std::sync::Arc::new(connection(8));
        let writer = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.next_outbound().await })
        };
        tokio::task::yield_now().await;
        conn.drain();
        assert_eq!(writer.await.unwrap(), None);
    }

    #[test]
    fn test_replay_bypasses_capacity() {
        let conn = connection(2);
        for i in 0..5 {
            conn.replay_alert(&alert(&format!("a{}", i)));
        }
        assert_eq!(conn.queue_len(), 5);
        assert_eq!(conn.dropped(), 0);
    }

    #[test]
    fn test_closed_connection_rejects_frames() {
        let conn = connection(8);
        conn.close();
        assert!(conn.is_closed());
        assert!(!conn.enqueue(ServerMessage::Ping { seq: 1 }));
        assert!(!conn.offer_alert(&alert("a1")));
    }

    #[tokio::test]
    async fn test_next_outbound_wakes_on_enqueue() {
        let conn = std::sync::Arc::new(connection(8));
        let reader = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.next_outbound().await })
        };
        tokio::task::yield_now().await;
        conn.enqueue(ServerMessage::Ping { seq: 7 });
        assert_eq!(reader.await.unwrap(), Some(ServerMessage::Ping { seq: 7 }));
    }

    #[tokio::test]
    async fn test_close_ends_writer() {
        let conn = connection(8);
        conn.enqueue(ServerMessage::Ping { seq: 1 });
        conn.close();
        assert_eq!(conn.next_outbound().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_expiry() {
        let conn = connection(8);
        let timeout = Duration::from_secs(45);
        assert!(!conn.heartbeat_expired(timeout));

        tokio::time::advance(Duration::from_secs(30)).await;
        conn.record_heartbeat();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!conn.heartbeat_expired(timeout));

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(conn.heartbeat_expired(timeout));
    }
}
