//! Which therapists are online, and through which connections.

use lifeline_common::{now_millis, ConnectionId, TherapistId};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

/// Live connections of one therapist. Never empty while stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TherapistPresence {
    pub therapist_id: TherapistId,
    pub connections: HashSet<ConnectionId>,
    pub last_seen_at: u64,
}

#[derive(Default)]
struct PresenceTable {
    therapists: HashMap<TherapistId, TherapistPresence>,
    owners: HashMap<ConnectionId, TherapistId>,
}

/// Membership bookkeeping only; no business logic lives here.
#[derive(Default)]
pub struct PresenceTracker {
    table: RwLock<PresenceTable>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, therapist_id: &TherapistId, connection_id: &ConnectionId) {
        let mut table = self.table.write();
        let now = now_millis();

        if let Some(previous) = table.owners.insert(connection_id.clone(), therapist_id.clone()) {
            if &previous != therapist_id {
                remove_connection(&mut table.therapists, &previous, connection_id);
            }
        }

        let presence = table
            .therapists
            .entry(therapist_id.clone())
            .or_insert_with(|| TherapistPresence {
                therapist_id: therapist_id.clone(),
                connections: HashSet::new(),
                last_seen_at: now,
            });
        presence.connections.insert(connection_id.clone());
        presence.last_seen_at = now;
    }

    pub fn disconnect(&self, connection_id: &ConnectionId) {
        let mut table = self.table.write();
        if let Some(therapist_id) = table.owners.remove(connection_id) {
            remove_connection(&mut table.therapists, &therapist_id, connection_id);
        }
    }

    /// Record activity on a connection.
    pub fn touch(&self, connection_id: &ConnectionId) {
        let mut table = self.table.write();
        let PresenceTable { therapists, owners } = &mut *table;
        if let Some(presence) = owners.get(connection_id).and_then(|t| therapists.get_mut(t)) {
            presence.last_seen_at = now_millis();
        }
    }

    /// Snapshot of every live connection id.
    pub fn live_connections(&self) -> Vec<ConnectionId> {
        self.table.read().owners.keys().cloned().collect()
    }

    pub fn is_online(&self, therapist_id: &TherapistId) -> bool {
        self.table.read().therapists.contains_key(therapist_id)
    }

    pub fn presence(&self, therapist_id: &TherapistId) -> Option<TherapistPresence> {
        self.table.read().therapists.get(therapist_id).cloned()
    }

    pub fn online_therapists(&self) -> usize {
        self.table.read().therapists.len()
    }

    pub fn connection_count(&self) -> usize {
        self.table.read().owners.len()
    }
}

fn remove_connection(
    therapists: &mut HashMap<TherapistId, TherapistPresence>,
    therapist_id: &TherapistId,
    connection_id: &ConnectionId,
) {
    if let Some(presence) = therapists.get_mut(therapist_id) {
        presence.connections.remove(connection_id);
        if presence.connections.is_empty() {
            therapists.remove(therapist_id);
        }
    }
}
