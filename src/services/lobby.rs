//! Lobby count reconciler — presence-derived online counts, corrected for
//! ghost signals.
//!
//! DESIGN
//! ======
//! The displayed "players online" count is derived from the ephemeral
//! presence registry, which can lag reality in both directions. Three
//! correction layers sit between the raw signal and the display:
//!
//! - a freshness-gated zero hold (a count that reached zero stays zero for
//!   a freeze window unless a genuinely fresh signal reappears),
//! - an authoritative recount, gated per room by a health score and an
//!   exponential backoff so a flaky store is not hammered,
//! - a quarantine map for uids the recount proved absent.
//!
//! All of it is per-room soft state in one bounded in-process map owned by
//! the reconciler instance: rebuilt from scratch on restart, pruned when
//! the active room-id set changes, and never allowed to mutate the
//! authoritative store. This layer corrects displays, nothing else.
//!
//! Methods take an explicit `now` (`_at` suffix) so windows test without a
//! clock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use sqlx::PgPool;

use crate::config::{LivenessConfig, LobbyConfig};
use crate::services::liveness::{self, ConnRecord};

const HEALTH_VERIFY_REWARD: f64 = 0.25;
const HEALTH_VERIFY_PENALTY: f64 = 0.5;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct VerifiedCount {
    count: usize,
    expires_at: i64,
}

/// Per-room correction state. Soft by contract.
#[derive(Debug)]
struct RoomCounter {
    verified: Option<VerifiedCount>,
    health: f64,
    backoff_ms: u64,
    failures: u32,
    last_verify_attempt: i64,
    last_touch: i64,
    quarantine: HashMap<String, i64>,
    zero_hold_until: Option<i64>,
}

impl RoomCounter {
    fn new(now: i64, cfg: &LobbyConfig) -> Self {
        Self {
            verified: None,
            health: 1.0,
            backoff_ms: cfg.backoff_floor_ms,
            failures: 0,
            last_verify_attempt: 0,
            last_touch: now,
            quarantine: HashMap::new(),
            zero_hold_until: None,
        }
    }
}

struct LobbyInner {
    rooms: HashMap<String, RoomCounter>,
}

/// The reconciler. Cheap to clone; shares one inner map.
#[derive(Clone)]
pub struct LobbyReconciler {
    inner: Arc<Mutex<LobbyInner>>,
    config: LobbyConfig,
    liveness: LivenessConfig,
}

impl LobbyReconciler {
    #[must_use]
    pub fn new(config: LobbyConfig, liveness: LivenessConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LobbyInner { rooms: HashMap::new() })),
            config,
            liveness,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LobbyInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    // =========================================================================
    // DERIVED COUNT
    // =========================================================================

    /// Derive the displayed count from a presence snapshot.
    ///
    /// Applies exclusions, quarantine (lifted early by a fresh heartbeat),
    /// and the zero hold. Pure over `(snapshot, now)` plus the room's soft
    /// state.
    #[must_use]
    pub fn derived_count_at(
        &self,
        room_id: &str,
        snapshot: &HashMap<String, Vec<ConnRecord>>,
        exclude: &[&str],
        now: i64,
    ) -> usize {
        let mut inner = self.lock();
        let cfg = self.config;
        let entry = room_entry(&mut inner, room_id, now, &cfg);
        decay_health(entry, now, &cfg);
        entry.last_touch = now;
        entry.quarantine.retain(|_, expiry| *expiry > now);

        let mut counted: Vec<&String> = Vec::new();
        let mut lifted: Vec<String> = Vec::new();
        for (uid, conns) in snapshot {
            if exclude.contains(&uid.as_str()) {
                continue;
            }
            if !liveness::user_present(conns.iter(), now, &self.liveness) {
                continue;
            }
            if entry.quarantine.contains_key(uid) {
                if has_fresh_signal(conns, now, cfg.accept_fresh_ms) {
                    lifted.push(uid.clone());
                } else {
                    continue;
                }
            }
            counted.push(uid);
        }
        for uid in lifted {
            entry.quarantine.remove(&uid);
        }

        let raw = counted.len();
        if raw == 0 {
            if entry.zero_hold_until.is_none() {
                entry.zero_hold_until = Some(now + cfg.zero_hold_ms);
            }
            return 0;
        }

        if let Some(hold_until) = entry.zero_hold_until {
            if now < hold_until {
                let fresh = counted
                    .iter()
                    .any(|uid| has_fresh_signal(&snapshot[uid.as_str()], now, cfg.accept_fresh_ms));
                if fresh {
                    entry.zero_hold_until = None;
                    return raw;
                }
                return 0;
            }
            entry.zero_hold_until = None;
        }
        raw
    }

    // =========================================================================
    // VERIFICATION GATING
    // =========================================================================

    /// Whether an authoritative recount should run now. A `true` return
    /// also stamps the attempt, so concurrent callers cannot pile on.
    #[must_use]
    pub fn should_verify_at(&self, room_id: &str, derived: usize, now: i64) -> bool {
        let mut inner = self.lock();
        let cfg = self.config;
        let entry = room_entry(&mut inner, room_id, now, &cfg);
        decay_health(entry, now, &cfg);

        let suspicious = derived == 1 || (cfg.multi_verify && derived > 0);
        if !suspicious {
            return false;
        }
        if entry.health <= 0.0 {
            return false;
        }
        if entry
            .verified
            .is_some_and(|v| v.expires_at > now)
        {
            return false;
        }
        if now - entry.last_verify_attempt < i64::try_from(entry.backoff_ms).unwrap_or(i64::MAX) {
            return false;
        }
        entry.last_verify_attempt = now;
        true
    }

    /// Record a successful recount. Quarantines every presence-visible uid
    /// the store says is not actually there.
    pub fn record_verified_at(&self, room_id: &str, verified: usize, present_uids: &[String], now: i64) {
        let mut inner = self.lock();
        let cfg = self.config;
        let entry = room_entry(&mut inner, room_id, now, &cfg);
        entry.verified = Some(VerifiedCount { count: verified, expires_at: now + cfg.verify_cache_ms });
        entry.health = (entry.health + HEALTH_VERIFY_REWARD).min(cfg.health_max);
        entry.backoff_ms = (entry.backoff_ms / 2).max(cfg.backoff_floor_ms);
        entry.failures = 0;
        entry.last_touch = now;
        if verified == 0 {
            for uid in present_uids {
                entry.quarantine.insert(uid.clone(), now + cfg.quarantine_ms);
            }
        }
    }

    /// Record a failed recount: halve health, double the backoff.
    pub fn record_verify_failure_at(&self, room_id: &str, now: i64) {
        let mut inner = self.lock();
        let cfg = self.config;
        let entry = room_entry(&mut inner, room_id, now, &cfg);
        entry.health = (entry.health - HEALTH_VERIFY_PENALTY).max(0.0);
        entry.backoff_ms = entry.backoff_ms.saturating_mul(2).min(cfg.backoff_ceil_ms);
        entry.failures += 1;
        entry.last_touch = now;
    }

    /// Last verified count if the cache is still live.
    #[must_use]
    pub fn cached_verified_at(&self, room_id: &str, now: i64) -> Option<usize> {
        let mut inner = self.lock();
        let cfg = self.config;
        let entry = room_entry(&mut inner, room_id, now, &cfg);
        entry
            .verified
            .filter(|v| v.expires_at > now)
            .map(|v| v.count)
    }

    /// Whether a uid is currently quarantined for a room.
    #[must_use]
    pub fn is_quarantined_at(&self, room_id: &str, uid: &str, now: i64) -> bool {
        let mut inner = self.lock();
        let cfg = self.config;
        let entry = room_entry(&mut inner, room_id, now, &cfg);
        entry.quarantine.get(uid).is_some_and(|expiry| *expiry > now)
    }

    // =========================================================================
    // HOUSEKEEPING
    // =========================================================================

    /// Drop entries for rooms no longer active, then enforce the size
    /// bound by evicting the least recently touched entries.
    pub fn prune_rooms(&self, active: &HashSet<String>) {
        let mut inner = self.lock();
        inner.rooms.retain(|room_id, _| active.contains(room_id));
        let max = self.config.max_rooms;
        if inner.rooms.len() > max {
            let mut by_touch: Vec<(String, i64)> = inner
                .rooms
                .iter()
                .map(|(id, entry)| (id.clone(), entry.last_touch))
                .collect();
            by_touch.sort_by_key(|(_, touch)| *touch);
            for (room_id, _) in by_touch.into_iter().take(inner.rooms.len() - max) {
                inner.rooms.remove(&room_id);
            }
        }
    }

    #[cfg(test)]
    fn backoff_ms(&self, room_id: &str, now: i64) -> u64 {
        let mut inner = self.lock();
        let cfg = self.config;
        room_entry(&mut inner, room_id, now, &cfg).backoff_ms
    }

    #[cfg(test)]
    fn health(&self, room_id: &str, now: i64) -> f64 {
        let mut inner = self.lock();
        let cfg = self.config;
        let entry = room_entry(&mut inner, room_id, now, &cfg);
        decay_health(entry, now, &cfg);
        entry.health
    }

    #[cfg(test)]
    fn tracked_rooms(&self) -> usize {
        self.lock().rooms.len()
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn room_entry<'a>(inner: &'a mut LobbyInner, room_id: &str, now: i64, cfg: &LobbyConfig) -> &'a mut RoomCounter {
    inner
        .rooms
        .entry(room_id.to_string())
        .or_insert_with(|| RoomCounter::new(now, cfg))
}

/// Idle entries drift back to a neutral health of 1.0 so one bad (or
/// lucky) streak does not outlive the traffic that caused it.
fn decay_health(entry: &mut RoomCounter, now: i64, cfg: &LobbyConfig) {
    if now - entry.last_touch >= cfg.health_decay_after_ms && (entry.health - 1.0).abs() > f64::EPSILON {
        entry.health = 1.0;
        entry.failures = 0;
    }
}

/// A signal fresh enough to trust over a freeze window: a heartbeat inside
/// the accept-fresh window, or a brand-new connection that has not written
/// one yet (an explicit new `online` write, not a stale redelivery).
fn has_fresh_signal(conns: &[ConnRecord], now: i64, accept_fresh_ms: i64) -> bool {
    conns.iter().any(|c| match c.ts {
        Some(ts) => c.online != Some(false) && now - ts <= accept_fresh_ms && ts - now <= accept_fresh_ms,
        None => c.online == Some(true),
    })
}

// =============================================================================
// AUTHORITATIVE RECOUNT
// =============================================================================

/// Count players the authoritative store believes are actually here:
/// distinct uids whose heartbeat write-through is within the stale
/// threshold. Read-only by contract.
///
/// # Errors
///
/// Returns a database error if the count query fails.
pub async fn verify_room_count(
    pool: &PgPool,
    room_id: &str,
    liveness: &LivenessConfig,
    now: i64,
) -> Result<usize, sqlx::Error> {
    let cutoff = now - liveness.stale_threshold_ms;
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(DISTINCT user_id) FROM players WHERE room_id = $1 AND last_seen >= $2",
    )
    .bind(room_id)
    .bind(cutoff)
    .fetch_one(pool)
    .await?;
    Ok(usize::try_from(count).unwrap_or(0))
}

// =============================================================================
// RECONCILED COUNT + WATCHER
// =============================================================================

/// Derive the displayed count for a room, running the gated authoritative
/// recount when the signal looks unreliable. Never mutates room state;
/// verification failures only dent this room's health/backoff.
pub async fn reconciled_count(state: &crate::state::AppState, room_id: &str, exclude: &[&str]) -> usize {
    let now = crate::frame::now_ms();
    let snapshot = state.presence.snapshot_room(room_id);
    let derived = state.lobby.derived_count_at(room_id, &snapshot, exclude, now);

    if state.lobby.should_verify_at(room_id, derived, now) {
        match verify_room_count(&state.pool, room_id, &state.config.liveness, now).await {
            Ok(verified) => {
                let present = state.presence.present_uids(room_id, now, &state.config.liveness);
                state.lobby.record_verified_at(room_id, verified, &present, now);
                if verified == 0 && derived > 0 {
                    // Quarantine just landed; re-derive with it applied.
                    return state.lobby.derived_count_at(room_id, &snapshot, exclude, now);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, room_id, "authoritative recount failed");
                state.lobby.record_verify_failure_at(room_id, now);
            }
        }
    }
    derived
}

/// Watch the presence change feed and push corrected counts to each
/// affected room's clients. Purely a display stream.
pub fn spawn_lobby_watcher(state: crate::state::AppState) -> tokio::task::JoinHandle<()> {
    use crate::frame::{Data, Frame};

    let mut events = state.presence.subscribe();
    tokio::spawn(async move {
        loop {
            let room_id = match events.recv().await {
                Ok(event) => event.room_id,
                // Lagged: counts are recomputed per event, skipping is safe.
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            let count = reconciled_count(&state, &room_id, &[]).await;
            let mut data = Data::new();
            data.insert("count".into(), serde_json::json!(count));
            let frame = Frame::request("lobby:count", data).with_room_id(room_id.clone());
            crate::services::room::broadcast(&state, &room_id, &frame, None).await;
        }
    })
}

#[cfg(test)]
#[path = "lobby_test.rs"]
mod tests;
