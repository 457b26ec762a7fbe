//! Ephemeral presence registry — per-connection liveness signals.
//!
//! DESIGN
//! ======
//! Keyed `(room_id, user_id, connection_id)`, last-writer-wins, in-process
//! only. Connections are read-only signals: they carry no ownership over
//! room or player state, and losing a write race here only affects the
//! displayed count, never correctness. Subscribers get a change feed via
//! `tokio::sync::broadcast`; a lagging subscriber just recomputes from the
//! next snapshot.
//!
//! A user may hold several simultaneous connections (multiple tabs). The
//! user is online iff any connection passes `liveness::is_active`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::LivenessConfig;
use crate::services::liveness::{self, ConnRecord};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Change notification: something moved in this room's presence.
#[derive(Debug, Clone)]
pub struct PresenceEvent {
    pub room_id: String,
}

type RoomConns = HashMap<String, HashMap<Uuid, ConnRecord>>;

#[derive(Clone)]
pub struct PresenceRegistry {
    inner: Arc<Mutex<HashMap<String, RoomConns>>>,
    events: broadcast::Sender<PresenceEvent>,
}

impl PresenceRegistry {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { inner: Arc::new(Mutex::new(HashMap::new())), events }
    }

    /// Subscribe to the change feed.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }

    fn notify(&self, room_id: &str) {
        // Best-effort: no receivers is fine.
        let _ = self.events.send(PresenceEvent { room_id: room_id.to_string() });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RoomConns>> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    // =========================================================================
    // WRITES
    // =========================================================================

    /// Register a connection. Marked explicitly online; no heartbeat yet.
    pub fn connect(&self, room_id: &str, user_id: &str, conn_id: Uuid) {
        {
            let mut rooms = self.lock();
            rooms
                .entry(room_id.to_string())
                .or_default()
                .entry(user_id.to_string())
                .or_default()
                .insert(conn_id, ConnRecord { online: Some(true), ts: None });
        }
        self.notify(room_id);
    }

    /// Record a heartbeat. Creates the record if it is missing (a process
    /// restart loses the registry; the next beat rebuilds it).
    pub fn beat(&self, room_id: &str, user_id: &str, conn_id: Uuid, ts: i64) {
        {
            let mut rooms = self.lock();
            let record = rooms
                .entry(room_id.to_string())
                .or_default()
                .entry(user_id.to_string())
                .or_default()
                .entry(conn_id)
                .or_default();
            record.online = Some(true);
            record.ts = Some(ts);
        }
        self.notify(room_id);
    }

    /// Explicitly flag a connection offline without removing it.
    pub fn mark_offline(&self, room_id: &str, user_id: &str, conn_id: Uuid) {
        let mut changed = false;
        {
            let mut rooms = self.lock();
            if let Some(record) = rooms
                .get_mut(room_id)
                .and_then(|r| r.get_mut(user_id))
                .and_then(|c| c.get_mut(&conn_id))
            {
                record.online = Some(false);
                changed = true;
            }
        }
        if changed {
            self.notify(room_id);
        }
    }

    /// Clean disconnect: remove the connection record entirely.
    pub fn disconnect(&self, room_id: &str, user_id: &str, conn_id: Uuid) {
        {
            let mut rooms = self.lock();
            if let Some(room) = rooms.get_mut(room_id) {
                if let Some(conns) = room.get_mut(user_id) {
                    conns.remove(&conn_id);
                    if conns.is_empty() {
                        room.remove(user_id);
                    }
                }
                if room.is_empty() {
                    rooms.remove(room_id);
                }
            }
        }
        self.notify(room_id);
    }

    /// Drop every record for a room (the room itself was deleted).
    pub fn remove_room(&self, room_id: &str) {
        let removed = self.lock().remove(room_id).is_some();
        if removed {
            self.notify(room_id);
        }
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// Copy of a room's connection records keyed by user.
    #[must_use]
    pub fn snapshot_room(&self, room_id: &str) -> HashMap<String, Vec<ConnRecord>> {
        let rooms = self.lock();
        let Some(room) = rooms.get(room_id) else {
            return HashMap::new();
        };
        room.iter()
            .map(|(uid, conns)| (uid.clone(), conns.values().copied().collect()))
            .collect()
    }

    /// Uids with at least one active connection, sorted for determinism.
    #[must_use]
    pub fn present_uids(&self, room_id: &str, now: i64, cfg: &LivenessConfig) -> Vec<String> {
        let rooms = self.lock();
        let Some(room) = rooms.get(room_id) else {
            return Vec::new();
        };
        let mut uids: Vec<String> = room
            .iter()
            .filter(|(_, conns)| liveness::user_present(conns.values(), now, cfg))
            .map(|(uid, _)| uid.clone())
            .collect();
        uids.sort();
        uids
    }

    /// Whether one user has any active connection in the room.
    #[must_use]
    pub fn user_present(&self, room_id: &str, user_id: &str, now: i64, cfg: &LivenessConfig) -> bool {
        let rooms = self.lock();
        rooms
            .get(room_id)
            .and_then(|r| r.get(user_id))
            .is_some_and(|conns| liveness::user_present(conns.values(), now, cfg))
    }

    /// Room ids with any records, active or not.
    #[must_use]
    pub fn room_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Total connection records, for sweep accounting and tests.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.lock()
            .values()
            .flat_map(|room| room.values())
            .map(HashMap::len)
            .sum()
    }

    // =========================================================================
    // SWEEP
    // =========================================================================

    /// Remove inactive connection records, at most `limit` per call.
    /// Returns the number removed. Idempotent; safe to re-run.
    pub fn sweep_stale(&self, now: i64, cfg: &LivenessConfig, limit: usize) -> usize {
        let mut removed = 0;
        let mut touched_rooms: Vec<String> = Vec::new();
        {
            let mut rooms = self.lock();
            'outer: for (room_id, room) in rooms.iter_mut() {
                let mut room_touched = false;
                for conns in room.values_mut() {
                    let stale: Vec<Uuid> = conns
                        .iter()
                        .filter(|(_, rec)| !liveness::is_active(rec, now, cfg))
                        .map(|(id, _)| *id)
                        .collect();
                    for conn_id in stale {
                        conns.remove(&conn_id);
                        removed += 1;
                        room_touched = true;
                        if removed >= limit {
                            break;
                        }
                    }
                    if removed >= limit {
                        break;
                    }
                }
                room.retain(|_, conns| !conns.is_empty());
                if room_touched {
                    touched_rooms.push(room_id.clone());
                }
                if removed >= limit {
                    break 'outer;
                }
            }
            rooms.retain(|_, room| !room.is_empty());
        }
        for room_id in touched_rooms {
            self.notify(&room_id);
        }
        removed
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
