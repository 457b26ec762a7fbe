//! Room lifecycle coordinator — transactional join/leave/host/round
//! mutations of the authoritative store.
//!
//! DESIGN
//! ======
//! Every operation is one atomic read-modify-write: begin a transaction,
//! lock the room row (`SELECT ... FOR UPDATE`), load the player rows, run
//! a pure planner over the snapshot, apply the computed update set, and
//! commit once. Two independent triggers, a player leaving and a round
//! completing, can race on the same room; the row lock serializes them.
//!
//! Host election stays sound without a consensus primitive only because
//! each decision is re-derived from the transactional read; nothing
//! caches "the current host" across transactions. Porting this to a store
//! without transactions would require a real lease.
//!
//! Chat/notification writes, creator backfill, and event logging are
//! best-effort: they run after commit, log failures, and never block the
//! transition.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{info, warn};

use crate::config::RoomPolicy;
use crate::frame::now_ms;
use crate::services::election::{self, Candidate, ElectionInput, HostDecision};
use crate::services::notify::{self, SystemKind};
use crate::state::{AppState, OrderState, PlayerRow, PlayerSnapshot, RoomDoc, RoomStatus};

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("room not found: {0}")]
    NotFound(String),
    #[error("only the host may {0}")]
    NotHost(&'static str),
    #[error("target player not in room: {0}")]
    TargetMissing(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl crate::frame::ErrorCode for RoomError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E_ROOM_NOT_FOUND",
            Self::NotHost(_) => "E_NOT_HOST",
            Self::TargetMissing(_) => "E_TARGET_MISSING",
            Self::Database(_) => "E_DATABASE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

// =============================================================================
// SOFT-STATE LEDGERS
// =============================================================================

/// Per-(room, user) record of the last departure notification, used to
/// suppress double-notification from redundant disconnect signals. Soft
/// state: losing it only risks one duplicate chat line.
#[derive(Clone)]
pub struct DepartureLedger {
    inner: Arc<Mutex<HashMap<(String, String), i64>>>,
}

impl DepartureLedger {
    #[must_use]
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// True if a notification for this user should go out now; records the
    /// send and opportunistically prunes entries older than `prune_ms`.
    pub fn should_notify_at(&self, room_id: &str, uid: &str, now: i64, window_ms: i64, prune_ms: i64) -> bool {
        let mut map = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        map.retain(|_, sent_at| now - *sent_at <= prune_ms);
        let key = (room_id.to_string(), uid.to_string());
        if map.get(&key).is_some_and(|sent_at| now - sent_at < window_ms) {
            return false;
        }
        map.insert(key, now);
        true
    }
}

impl Default for DepartureLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Throttle for `players.last_seen` write-through so heartbeats do not
/// turn into a row update every 20 seconds per tab.
#[derive(Clone)]
pub struct WriteThroughThrottle {
    inner: Arc<Mutex<HashMap<(String, String), i64>>>,
}

impl WriteThroughThrottle {
    #[must_use]
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())) }
    }

    pub fn should_write_at(&self, room_id: &str, uid: &str, now: i64, min_interval_ms: i64) -> bool {
        let mut map = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let key = (room_id.to_string(), uid.to_string());
        if map.get(&key).is_some_and(|last| now - last < min_interval_ms) {
            return false;
        }
        map.insert(key, now);
        true
    }
}

impl Default for WriteThroughThrottle {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// PLANS
// =============================================================================

/// Computed effect of a join, to be applied inside the open transaction.
#[derive(Debug, Clone)]
pub struct JoinPlan {
    pub was_empty: bool,
    pub rejoined: bool,
    /// Non-canonical doc ids to delete (reconnect-race duplicates).
    pub duplicate_doc_ids: Vec<String>,
    pub upsert: PlayerRow,
    pub creator_backfilled: bool,
}

/// Computed effect of a departure.
#[derive(Debug, Clone)]
pub struct LeavePlan {
    pub removed: bool,
    pub player_name: String,
    pub transitioned_to_reveal: bool,
    pub now_empty: bool,
    pub host_decision: HostDecision,
}

/// Upsert the joining player and canonicalize duplicates.
///
/// Duplicate rows for the same uid are merged into the canonical
/// `doc_id == user_id` row, keeping the earliest seat and any game state
/// (number, clue, ready) the duplicates carried; a reconnect must not
/// cost a player their hand.
pub fn plan_join(
    doc: &mut RoomDoc,
    players: &[PlayerRow],
    uid: &str,
    name: &str,
    avatar: Option<String>,
    now: i64,
) -> JoinPlan {
    let was_empty = players.is_empty();
    let canonical = players.iter().find(|p| p.doc_id == uid);
    let duplicates: Vec<&PlayerRow> = players
        .iter()
        .filter(|p| p.user_id == uid && p.doc_id != uid)
        .collect();

    let mut merged = canonical.cloned().or_else(|| {
        duplicates
            .iter()
            .min_by_key(|p| p.joined_at)
            .map(|p| (*p).clone())
    });
    if let Some(row) = merged.as_mut() {
        for dup in &duplicates {
            row.joined_at = row.joined_at.min(dup.joined_at);
            row.order_index = row.order_index.min(dup.order_index);
            if row.number.is_none() {
                row.number = dup.number;
            }
            if row.clue1.is_empty() {
                row.clue1.clone_from(&dup.clue1);
            }
            row.ready |= dup.ready;
        }
    }

    let next_index = players.iter().map(|p| p.order_index + 1).max().unwrap_or(0);
    let upsert = match merged {
        Some(row) => PlayerRow {
            doc_id: uid.to_string(),
            user_id: uid.to_string(),
            name: name.to_string(),
            avatar: avatar.clone(),
            last_seen: now,
            ..row
        },
        None => PlayerRow {
            room_id: doc.id.clone(),
            doc_id: uid.to_string(),
            user_id: uid.to_string(),
            name: name.to_string(),
            avatar: avatar.clone(),
            number: None,
            clue1: String::new(),
            ready: false,
            order_index: next_index,
            joined_at: now,
            last_seen: now,
        },
    };

    // A join means occupancy: the grace expiry must never fire now.
    doc.expires_at = None;
    doc.last_active_at = now;

    let mut creator_backfilled = false;
    if doc.creator_id.is_none() {
        doc.creator_id = Some(uid.to_string());
        doc.creator_name = Some(name.to_string());
        creator_backfilled = true;
    }

    JoinPlan {
        was_empty,
        rejoined: canonical.is_some(),
        duplicate_doc_ids: duplicates.iter().map(|p| p.doc_id.clone()).collect(),
        upsert,
        creator_backfilled,
    }
}

/// Remove a player and settle everything that depends on the seat:
/// order lists, round completion, snapshots, host seat, empty-room reset.
#[allow(clippy::too_many_arguments)]
pub fn plan_leave(
    doc: &mut RoomDoc,
    players: &[PlayerRow],
    leaving_uid: &str,
    online_uids: &HashSet<String>,
    now: i64,
    policy: RoomPolicy,
    empty_grace_ms: i64,
    snapshot_cap: usize,
) -> LeavePlan {
    let leaving_rows: Vec<&PlayerRow> = players.iter().filter(|p| p.user_id == leaving_uid).collect();
    let removed = !leaving_rows.is_empty();
    let player_name = leaving_rows
        .iter()
        .find(|p| p.doc_id == leaving_uid)
        .or_else(|| leaving_rows.first())
        .map_or_else(|| leaving_uid.to_string(), |p| p.name.clone());
    let remaining: Vec<&PlayerRow> = players.iter().filter(|p| p.user_id != leaving_uid).collect();

    // Departing during the result screen: keep the revealed card readable.
    if removed && matches!(doc.status, RoomStatus::Reveal | RoomStatus::Finished) {
        let best = leaving_rows
            .iter()
            .find(|p| p.doc_id == leaving_uid)
            .or_else(|| leaving_rows.first());
        if let Some(row) = best {
            doc.order.snapshots.insert(
                leaving_uid.to_string(),
                PlayerSnapshot {
                    name: row.name.clone(),
                    avatar: row.avatar.clone(),
                    clue1: row.clue1.clone(),
                    number: row.number,
                    captured_at: now,
                },
            );
        }
    }

    let was_participant = doc.deal_players.iter().any(|p| p == leaving_uid);
    doc.deal_players.retain(|p| p != leaving_uid);

    // Mid-round the departed card leaves the table; on the result screen
    // the lists stay intact and the snapshot above backs them.
    if matches!(doc.status, RoomStatus::Waiting | RoomStatus::Clue) {
        doc.order.list.retain(|p| p != leaving_uid);
        doc.order.proposal.retain(|p| p != leaving_uid);
        if doc.status == RoomStatus::Clue && was_participant {
            doc.order.total = (doc.order.total - 1).max(0);
        }
    }

    prune_snapshots(&mut doc.order, snapshot_cap);

    let mut transitioned_to_reveal = false;
    if doc.status == RoomStatus::Clue {
        let met_total = doc.order.total > 0 && doc.order.list.len() >= usize_from(doc.order.total);
        let failed_stop = doc.order.failed && !policy.continue_after_failure;
        if met_total || failed_stop {
            doc.status = RoomStatus::Reveal;
            doc.reveal_pending = false;
            doc.result = Some(serde_json::json!({
                "round": doc.round,
                "failed": doc.order.failed,
                "reason": "player-left",
                "at": now,
            }));
            transitioned_to_reveal = true;
        }
    }

    let now_empty = remaining.is_empty();
    if now_empty {
        let reset_allowed = !(doc.order.failed && !policy.reset_on_empty_failed);
        if reset_allowed {
            doc.status = RoomStatus::Waiting;
            doc.order = OrderState::default();
            doc.deal_players.clear();
            doc.result = None;
            doc.round_preparing = false;
            doc.reveal_pending = false;
            doc.recall_open = true;
            transitioned_to_reveal = false;
        }
        // Grace period, not immediate deletion: a refresh/reconnect within
        // the window finds the room intact.
        doc.expires_at = Some(now + empty_grace_ms);
    }

    let input = election_input(doc, &remaining, online_uids, Some(leaving_uid));
    let host_decision = election::evaluate_after_leave(&input);
    apply_host_decision(doc, &host_decision);

    doc.last_active_at = now;

    LeavePlan { removed, player_name, transitioned_to_reveal, now_empty, host_decision }
}

/// Begin a round: host-only, idempotent under client retries.
///
/// # Errors
///
/// `NotHost` when the caller does not hold the seat.
pub fn plan_start(
    doc: &mut RoomDoc,
    players: &[PlayerRow],
    by_uid: &str,
    request_id: Option<&str>,
    now: i64,
) -> Result<bool, RoomError> {
    if doc.host_id.as_deref() != Some(by_uid) {
        return Err(RoomError::NotHost("start the round"));
    }
    if request_id.is_some() && doc.last_request_id.as_deref() == request_id {
        return Ok(false);
    }

    let mut seats: Vec<&PlayerRow> = dedupe_canonical(players);
    seats.sort_by(|a, b| a.order_index.cmp(&b.order_index).then(a.joined_at.cmp(&b.joined_at)));

    doc.status = RoomStatus::Clue;
    doc.round += 1;
    doc.order = OrderState {
        total: i32::try_from(seats.len()).unwrap_or(i32::MAX),
        ..OrderState::default()
    };
    doc.deal_players = seats.iter().map(|p| p.user_id.clone()).collect();
    doc.result = None;
    doc.recall_open = false;
    doc.round_preparing = false;
    doc.reveal_pending = false;
    doc.last_request_id = request_id.map(String::from);
    doc.last_active_at = now;
    Ok(true)
}

/// Back to the lobby: host-only, idempotent, round counter untouched.
///
/// # Errors
///
/// `NotHost` when the caller does not hold the seat.
pub fn plan_reset(
    doc: &mut RoomDoc,
    by_uid: &str,
    request_id: Option<&str>,
    now: i64,
) -> Result<bool, RoomError> {
    if doc.host_id.as_deref() != Some(by_uid) {
        return Err(RoomError::NotHost("reset the room"));
    }
    if request_id.is_some() && doc.last_request_id.as_deref() == request_id {
        return Ok(false);
    }

    doc.status = RoomStatus::Waiting;
    doc.order = OrderState::default();
    doc.deal_players.clear();
    doc.result = None;
    doc.recall_open = true;
    doc.round_preparing = false;
    doc.reveal_pending = false;
    doc.last_request_id = request_id.map(String::from);
    doc.last_active_at = now;
    Ok(true)
}

/// Drop snapshots no longer referenced by the order lists, then enforce
/// the cap by evicting the oldest captures.
pub fn prune_snapshots(order: &mut OrderState, cap: usize) {
    let list = &order.list;
    let proposal = &order.proposal;
    order
        .snapshots
        .retain(|uid, _| list.iter().any(|p| p == uid) || proposal.iter().any(|p| p == uid));
    while order.snapshots.len() > cap {
        let Some(oldest) = order
            .snapshots
            .iter()
            .min_by_key(|(_, snap)| snap.captured_at)
            .map(|(uid, _)| uid.clone())
        else {
            break;
        };
        order.snapshots.remove(&oldest);
    }
}

fn usize_from(total: i32) -> usize {
    usize::try_from(total).unwrap_or(0)
}

/// One row per uid, preferring the canonical doc.
fn dedupe_canonical(players: &[PlayerRow]) -> Vec<&PlayerRow> {
    let mut by_uid: HashMap<&str, &PlayerRow> = HashMap::new();
    for player in players {
        match by_uid.get(player.user_id.as_str()) {
            Some(existing) if existing.doc_id == existing.user_id => {}
            _ => {
                if player.doc_id == player.user_id || !by_uid.contains_key(player.user_id.as_str()) {
                    by_uid.insert(player.user_id.as_str(), player);
                }
            }
        }
    }
    by_uid.into_values().collect()
}

fn election_input(
    doc: &RoomDoc,
    players: &[&PlayerRow],
    online_uids: &HashSet<String>,
    leaving_uid: Option<&str>,
) -> ElectionInput {
    ElectionInput {
        current_host_id: doc.host_id.clone(),
        players: players
            .iter()
            .map(|p| Candidate {
                id: p.user_id.clone(),
                name: p.name.clone(),
                joined_at: p.joined_at,
                order_index: p.order_index,
                last_seen_at: p.last_seen,
                is_online: online_uids.contains(&p.user_id),
            })
            .collect(),
        leaving_uid: leaving_uid.map(String::from),
    }
}

/// Apply an election decision to the document. Returns whether the seat
/// changed.
pub fn apply_host_decision(doc: &mut RoomDoc, decision: &HostDecision) -> bool {
    match decision {
        HostDecision::None => false,
        HostDecision::Assign { id, name, .. } => {
            doc.host_id = Some(id.clone());
            doc.host_name = Some(name.clone());
            true
        }
        HostDecision::Clear { .. } => {
            let had_host = doc.host_id.is_some();
            doc.host_id = None;
            doc.host_name = None;
            had_host
        }
    }
}

// =============================================================================
// ROW I/O
// =============================================================================

fn room_from_row(row: &PgRow) -> RoomDoc {
    let status: String = row.get("status");
    RoomDoc {
        id: row.get("id"),
        status: RoomStatus::from_str(&status).unwrap_or(RoomStatus::Waiting),
        host_id: row.get("host_id"),
        host_name: row.get("host_name"),
        creator_id: row.get("creator_id"),
        creator_name: row.get("creator_name"),
        round: row.get("round"),
        order: OrderState {
            list: json_column(row, "order_list"),
            proposal: json_column(row, "order_proposal"),
            total: row.get("order_total"),
            failed: row.get("order_failed"),
            snapshots: json_column(row, "order_snapshots"),
        },
        deal_players: json_column(row, "deal_players"),
        result: row.get("result"),
        recall_open: row.get("recall_open"),
        round_preparing: row.get("round_preparing"),
        reveal_pending: row.get("reveal_pending"),
        last_request_id: row.get("last_request_id"),
        last_active_at: row.get("last_active_at"),
        expires_at: row.get("expires_at"),
        created_at: row.get("created_at"),
    }
}

fn json_column<T: serde::de::DeserializeOwned + Default>(row: &PgRow, column: &str) -> T {
    let value: serde_json::Value = row.get(column);
    serde_json::from_value(value).unwrap_or_default()
}

const ROOM_COLUMNS: &str = "id, status, host_id, host_name, creator_id, creator_name, round, \
     order_list, order_proposal, order_total, order_failed, order_snapshots, \
     deal_players, result, recall_open, round_preparing, reveal_pending, \
     last_request_id, last_active_at, expires_at, created_at";

async fn fetch_room_for_update(
    tx: &mut Transaction<'_, Postgres>,
    room_id: &str,
) -> Result<Option<RoomDoc>, sqlx::Error> {
    let row = sqlx::query(&format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE id = $1 FOR UPDATE"))
        .bind(room_id)
        .fetch_optional(tx.as_mut())
        .await?;
    Ok(row.as_ref().map(room_from_row))
}

async fn fetch_players(tx: &mut Transaction<'_, Postgres>, room_id: &str) -> Result<Vec<PlayerRow>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT room_id, doc_id, user_id, name, avatar, number, clue1, ready, order_index, joined_at, last_seen \
         FROM players WHERE room_id = $1 ORDER BY order_index ASC, joined_at ASC, doc_id ASC",
    )
    .bind(room_id)
    .fetch_all(tx.as_mut())
    .await?;
    Ok(rows
        .iter()
        .map(|row| PlayerRow {
            room_id: row.get("room_id"),
            doc_id: row.get("doc_id"),
            user_id: row.get("user_id"),
            name: row.get("name"),
            avatar: row.get("avatar"),
            number: row.get("number"),
            clue1: row.get("clue1"),
            ready: row.get("ready"),
            order_index: row.get("order_index"),
            joined_at: row.get("joined_at"),
            last_seen: row.get("last_seen"),
        })
        .collect())
}

async fn update_room(tx: &mut Transaction<'_, Postgres>, doc: &RoomDoc) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE rooms SET status = $2, host_id = $3, host_name = $4, creator_id = $5, creator_name = $6, \
             round = $7, order_list = $8, order_proposal = $9, order_total = $10, order_failed = $11, \
             order_snapshots = $12, deal_players = $13, result = $14, recall_open = $15, \
             round_preparing = $16, reveal_pending = $17, last_request_id = $18, \
             last_active_at = $19, expires_at = $20 \
         WHERE id = $1",
    )
    .bind(&doc.id)
    .bind(doc.status.as_str())
    .bind(&doc.host_id)
    .bind(&doc.host_name)
    .bind(&doc.creator_id)
    .bind(&doc.creator_name)
    .bind(doc.round)
    .bind(serde_json::to_value(&doc.order.list).unwrap_or_default())
    .bind(serde_json::to_value(&doc.order.proposal).unwrap_or_default())
    .bind(doc.order.total)
    .bind(doc.order.failed)
    .bind(serde_json::to_value(&doc.order.snapshots).unwrap_or_default())
    .bind(serde_json::to_value(&doc.deal_players).unwrap_or_default())
    .bind(&doc.result)
    .bind(doc.recall_open)
    .bind(doc.round_preparing)
    .bind(doc.reveal_pending)
    .bind(&doc.last_request_id)
    .bind(doc.last_active_at)
    .bind(doc.expires_at)
    .execute(tx.as_mut())
    .await?;
    Ok(())
}

async fn upsert_player(tx: &mut Transaction<'_, Postgres>, player: &PlayerRow) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO players (room_id, doc_id, user_id, name, avatar, number, clue1, ready, order_index, joined_at, last_seen) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
         ON CONFLICT (room_id, doc_id) DO UPDATE SET \
             name = EXCLUDED.name, avatar = EXCLUDED.avatar, number = EXCLUDED.number, \
             clue1 = EXCLUDED.clue1, ready = EXCLUDED.ready, \
             order_index = LEAST(players.order_index, EXCLUDED.order_index), \
             joined_at = LEAST(players.joined_at, EXCLUDED.joined_at), \
             last_seen = EXCLUDED.last_seen",
    )
    .bind(&player.room_id)
    .bind(&player.doc_id)
    .bind(&player.user_id)
    .bind(&player.name)
    .bind(&player.avatar)
    .bind(player.number)
    .bind(&player.clue1)
    .bind(player.ready)
    .bind(player.order_index)
    .bind(player.joined_at)
    .bind(player.last_seen)
    .execute(tx.as_mut())
    .await?;
    Ok(())
}

async fn delete_player_doc(tx: &mut Transaction<'_, Postgres>, room_id: &str, doc_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM players WHERE room_id = $1 AND doc_id = $2")
        .bind(room_id)
        .bind(doc_id)
        .execute(tx.as_mut())
        .await?;
    Ok(())
}

async fn delete_player_uid(tx: &mut Transaction<'_, Postgres>, room_id: &str, uid: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM players WHERE room_id = $1 AND user_id = $2")
        .bind(room_id)
        .bind(uid)
        .execute(tx.as_mut())
        .await?;
    Ok(())
}

// =============================================================================
// SUMMARIES
// =============================================================================

#[derive(Debug, Clone)]
pub struct JoinSummary {
    pub was_empty: bool,
    pub rejoined: bool,
    pub deduped: usize,
    pub host_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LeaveSummary {
    pub removed: bool,
    pub player_name: String,
    pub transitioned_to_reveal: bool,
    pub now_empty: bool,
    pub host_decision: HostDecision,
}

// =============================================================================
// OPERATIONS
// =============================================================================

/// Create a waiting room. Idempotent: an existing room is left untouched.
///
/// # Errors
///
/// Returns a database error if the insert fails.
pub async fn create_room(state: &AppState, room_id: &str, creator_id: &str, creator_name: &str) -> Result<(), RoomError> {
    let now = now_ms();
    let mut doc = RoomDoc::new(room_id, now);
    doc.creator_id = Some(creator_id.to_string());
    doc.creator_name = Some(creator_name.to_string());

    let result = sqlx::query(
        "INSERT INTO rooms (id, status, creator_id, creator_name, round, order_list, order_proposal, \
             order_total, order_failed, order_snapshots, deal_players, recall_open, round_preparing, \
             reveal_pending, last_active_at, created_at) \
         VALUES ($1, $2, $3, $4, 0, '[]'::jsonb, '[]'::jsonb, 0, FALSE, '{}'::jsonb, '[]'::jsonb, TRUE, FALSE, FALSE, $5, $5) \
         ON CONFLICT (id) DO NOTHING",
    )
    .bind(&doc.id)
    .bind(doc.status.as_str())
    .bind(&doc.creator_id)
    .bind(&doc.creator_name)
    .bind(now)
    .execute(&state.pool)
    .await?;

    if result.rows_affected() > 0 {
        info!(room_id, creator_id, "room created");
        notify::record_event(&state.pool, room_id, "room-created", serde_json::json!({ "creator": creator_id }));
    }
    Ok(())
}

/// Join (or rejoin) a room.
///
/// # Errors
///
/// `NotFound` if the room does not exist; database errors propagate.
pub async fn join_room(
    state: &AppState,
    room_id: &str,
    uid: &str,
    name: &str,
    avatar: Option<String>,
) -> Result<JoinSummary, RoomError> {
    let now = now_ms();
    let mut tx = state.pool.begin().await?;
    let Some(mut doc) = fetch_room_for_update(&mut tx, room_id).await? else {
        return Err(RoomError::NotFound(room_id.to_string()));
    };
    let players = fetch_players(&mut tx, room_id).await?;
    let plan = plan_join(&mut doc, &players, uid, name, avatar, now);
    for dup in &plan.duplicate_doc_ids {
        delete_player_doc(&mut tx, room_id, dup).await?;
    }
    upsert_player(&mut tx, &plan.upsert).await?;
    update_room(&mut tx, &doc).await?;
    tx.commit().await?;

    info!(room_id, uid, rejoined = plan.rejoined, deduped = plan.duplicate_doc_ids.len(), "player joined");
    if !plan.rejoined {
        notify::notify_best_effort(&state.notifier, room_id, SystemKind::PlayerJoined, format!("{name} joined the room"));
    }
    notify::record_event(&state.pool, room_id, "player-joined", serde_json::json!({ "uid": uid }));

    Ok(JoinSummary {
        was_empty: plan.was_empty,
        rejoined: plan.rejoined,
        deduped: plan.duplicate_doc_ids.len(),
        host_id: doc.host_id,
    })
}

/// Remove a player and settle the room, all in one transaction.
///
/// # Errors
///
/// `NotFound` if the room does not exist; database errors propagate.
pub async fn leave_room(state: &AppState, room_id: &str, uid: &str) -> Result<LeaveSummary, RoomError> {
    let now = now_ms();
    let online: HashSet<String> = state
        .presence
        .present_uids(room_id, now, &state.config.liveness)
        .into_iter()
        .collect();

    let mut tx = state.pool.begin().await?;
    let Some(mut doc) = fetch_room_for_update(&mut tx, room_id).await? else {
        return Err(RoomError::NotFound(room_id.to_string()));
    };
    let players = fetch_players(&mut tx, room_id).await?;
    let plan = plan_leave(
        &mut doc,
        &players,
        uid,
        &online,
        now,
        state.config.policy,
        state.config.empty_room_grace_ms,
        state.config.snapshot_cap,
    );
    if plan.removed {
        delete_player_uid(&mut tx, room_id, uid).await?;
    }
    update_room(&mut tx, &doc).await?;
    tx.commit().await?;

    info!(
        room_id,
        uid,
        removed = plan.removed,
        now_empty = plan.now_empty,
        to_reveal = plan.transitioned_to_reveal,
        "player left"
    );

    // Redundant disconnect signals race here; the ledger keeps the chat to
    // one line per user.
    let cfg = &state.config;
    if plan.removed
        && state
            .departures
            .should_notify_at(room_id, uid, now, cfg.notify_dedupe_ms, cfg.notify_ledger_prune_ms)
    {
        match &plan.host_decision {
            HostDecision::Assign { name, .. } => {
                notify::notify_best_effort(
                    &state.notifier,
                    room_id,
                    SystemKind::HostChanged,
                    format!("{} left — {name} is now the host", plan.player_name),
                );
            }
            _ => {
                notify::notify_best_effort(
                    &state.notifier,
                    room_id,
                    SystemKind::PlayerLeft,
                    format!("{} left the room", plan.player_name),
                );
            }
        }
    }
    notify::record_event(&state.pool, room_id, "player-left", serde_json::json!({ "uid": uid }));

    Ok(LeaveSummary {
        removed: plan.removed,
        player_name: plan.player_name,
        transitioned_to_reveal: plan.transitioned_to_reveal,
        now_empty: plan.now_empty,
        host_decision: plan.host_decision,
    })
}

/// A player claims the host seat. The election decides; the claim only
/// succeeds when the current host is genuinely gone.
///
/// # Errors
///
/// `NotFound` if the room does not exist; database errors propagate.
pub async fn claim_host(state: &AppState, room_id: &str, claimant: &str) -> Result<HostDecision, RoomError> {
    let now = now_ms();
    let online: HashSet<String> = state
        .presence
        .present_uids(room_id, now, &state.config.liveness)
        .into_iter()
        .collect();

    let mut tx = state.pool.begin().await?;
    let Some(mut doc) = fetch_room_for_update(&mut tx, room_id).await? else {
        return Err(RoomError::NotFound(room_id.to_string()));
    };
    let players = fetch_players(&mut tx, room_id).await?;
    let refs: Vec<&PlayerRow> = players.iter().collect();
    let input = election_input(&doc, &refs, &online, None);
    let decision = election::evaluate_claim(&input, claimant);
    let changed = apply_host_decision(&mut doc, &decision);
    if changed {
        doc.last_active_at = now;
        update_room(&mut tx, &doc).await?;
    }
    tx.commit().await?;

    if let HostDecision::Assign { name, reason, .. } = &decision {
        info!(room_id, claimant, new_host = %name, reason = reason.as_str(), "host claim applied");
        notify::notify_best_effort(&state.notifier, room_id, SystemKind::HostChanged, format!("{name} is now the host"));
    }
    Ok(decision)
}

/// Explicit host transfer: current host (or an administrative override)
/// hands the seat to a present player.
///
/// # Errors
///
/// `NotHost` for non-host callers, `TargetMissing` if the target is not a
/// player, `NotFound`/database errors as usual.
pub async fn transfer_host(
    state: &AppState,
    room_id: &str,
    by_uid: &str,
    target_uid: &str,
    admin_override: bool,
) -> Result<(), RoomError> {
    let now = now_ms();
    let mut tx = state.pool.begin().await?;
    let Some(mut doc) = fetch_room_for_update(&mut tx, room_id).await? else {
        return Err(RoomError::NotFound(room_id.to_string()));
    };
    if !admin_override && doc.host_id.as_deref() != Some(by_uid) {
        return Err(RoomError::NotHost("transfer the host seat"));
    }
    let players = fetch_players(&mut tx, room_id).await?;
    let Some(target) = players.iter().find(|p| p.user_id == target_uid) else {
        return Err(RoomError::TargetMissing(target_uid.to_string()));
    };

    doc.host_id = Some(target.user_id.clone());
    doc.host_name = Some(target.name.clone());
    doc.last_active_at = now;
    update_room(&mut tx, &doc).await?;
    tx.commit().await?;

    info!(room_id, by_uid, target_uid, "host transferred");
    notify::notify_best_effort(
        &state.notifier,
        room_id,
        SystemKind::HostChanged,
        format!("{} is now the host", target.name),
    );
    Ok(())
}

/// Start a round: deal the seats, purge the chat, repost the topic.
///
/// # Errors
///
/// `NotHost` for non-host callers; `NotFound`/database errors as usual.
pub async fn start_round(
    state: &AppState,
    room_id: &str,
    by_uid: &str,
    request_id: Option<&str>,
    topic: Option<&str>,
) -> Result<bool, RoomError> {
    let now = now_ms();
    let mut tx = state.pool.begin().await?;
    let Some(mut doc) = fetch_room_for_update(&mut tx, room_id).await? else {
        return Err(RoomError::NotFound(room_id.to_string()));
    };
    let players = fetch_players(&mut tx, room_id).await?;
    let applied = plan_start(&mut doc, &players, by_uid, request_id, now)?;
    if applied {
        // Round start wipes the table talk.
        sqlx::query("DELETE FROM chat_messages WHERE room_id = $1")
            .bind(room_id)
            .execute(tx.as_mut())
            .await?;
        update_room(&mut tx, &doc).await?;
    }
    tx.commit().await?;

    if applied {
        info!(room_id, by_uid, round = doc.round, seats = doc.order.total, "round started");
        if let Some(topic) = topic {
            // The purge above took the topic line with it; put it back.
            notify::notify_best_effort(&state.notifier, room_id, SystemKind::TopicRepost, topic.to_string());
        }
        notify::record_event(&state.pool, room_id, "round-started", serde_json::json!({ "round": doc.round }));
    }
    Ok(applied)
}

/// Reset the room to the lobby.
///
/// # Errors
///
/// `NotHost` for non-host callers; `NotFound`/database errors as usual.
pub async fn reset_room(
    state: &AppState,
    room_id: &str,
    by_uid: &str,
    request_id: Option<&str>,
) -> Result<bool, RoomError> {
    let now = now_ms();
    let mut tx = state.pool.begin().await?;
    let Some(mut doc) = fetch_room_for_update(&mut tx, room_id).await? else {
        return Err(RoomError::NotFound(room_id.to_string()));
    };
    let applied = plan_reset(&mut doc, by_uid, request_id, now)?;
    if applied {
        update_room(&mut tx, &doc).await?;
    }
    tx.commit().await?;

    if applied {
        info!(room_id, by_uid, "room reset");
        notify::record_event(&state.pool, room_id, "room-reset", serde_json::json!({ "round": doc.round }));
    }
    Ok(applied)
}

// =============================================================================
// BROADCAST + PROJECTION
// =============================================================================

/// Broadcast a frame to all websocket clients in a room, optionally
/// excluding one.
pub async fn broadcast(state: &AppState, room_id: &str, frame: &crate::frame::Frame, exclude: Option<uuid::Uuid>) {
    let rooms = state.rooms.read().await;
    let Some(room) = rooms.get(room_id) else {
        return;
    };
    for (client_id, tx) in &room.clients {
        if exclude == Some(*client_id) {
            continue;
        }
        // Best-effort: if a client's channel is full, skip it.
        let _ = tx.try_send(frame.clone());
    }
}

/// Read-only projection of a room for the UI: status, host, derived
/// count, and the presence-corrected player list.
///
/// # Errors
///
/// `NotFound` if the room does not exist; database errors propagate.
pub async fn room_projection(state: &AppState, room_id: &str) -> Result<crate::frame::Data, RoomError> {
    let now = now_ms();
    let row = sqlx::query(&format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE id = $1"))
        .bind(room_id)
        .fetch_optional(&state.pool)
        .await?;
    let Some(row) = row else {
        return Err(RoomError::NotFound(room_id.to_string()));
    };
    let doc = room_from_row(&row);

    let rows = sqlx::query(
        "SELECT user_id, name, avatar, ready, order_index FROM players \
         WHERE room_id = $1 AND doc_id = user_id ORDER BY order_index ASC",
    )
    .bind(room_id)
    .fetch_all(&state.pool)
    .await?;

    let players: Vec<serde_json::Value> = rows
        .iter()
        .map(|row| {
            let uid: String = row.get("user_id");
            let online = state.presence.user_present(room_id, &uid, now, &state.config.liveness)
                && !state.lobby.is_quarantined_at(room_id, &uid, now);
            serde_json::json!({
                "id": uid,
                "name": row.get::<String, _>("name"),
                "avatar": row.get::<Option<String>, _>("avatar"),
                "ready": row.get::<bool, _>("ready"),
                "order_index": row.get::<i32, _>("order_index"),
                "online": online,
            })
        })
        .collect();

    let count = crate::services::lobby::reconciled_count(state, room_id, &[]).await;

    let mut data = crate::frame::Data::new();
    data.insert("status".into(), serde_json::json!(doc.status.as_str()));
    data.insert("host_id".into(), serde_json::json!(doc.host_id));
    data.insert("host_name".into(), serde_json::json!(doc.host_name));
    data.insert("round".into(), serde_json::json!(doc.round));
    data.insert("count".into(), serde_json::json!(count));
    data.insert("players".into(), serde_json::Value::Array(players));
    Ok(data)
}

// =============================================================================
// HEARTBEAT WRITE-THROUGH
// =============================================================================

/// Opportunistically mirror a presence heartbeat into `players.last_seen`.
/// Throttled and fire-and-forget; the transaction path never depends on it.
pub fn touch_heartbeat(state: &AppState, room_id: &str, uid: &str, now: i64) {
    if !state
        .heartbeats
        .should_write_at(room_id, uid, now, state.config.heartbeat_writethrough_ms)
    {
        return;
    }
    let pool = state.pool.clone();
    let room_id = room_id.to_string();
    let uid = uid.to_string();
    tokio::spawn(async move {
        let result = sqlx::query("UPDATE players SET last_seen = $3 WHERE room_id = $1 AND user_id = $2")
            .bind(&room_id)
            .bind(&uid)
            .bind(now)
            .execute(&pool)
            .await;
        if let Err(e) = result {
            warn!(error = %e, %room_id, %uid, "heartbeat write-through failed");
        }
    });
}

/// Did this player heartbeat (via write-through) at or after `since`?
/// Used to re-check before committing a grace-delayed leave.
///
/// # Errors
///
/// Returns a database error if the existence query fails.
pub async fn heartbeat_since(pool: &PgPool, room_id: &str, uid: &str, since: i64) -> Result<bool, sqlx::Error> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM players WHERE room_id = $1 AND user_id = $2 AND last_seen >= $3)",
    )
    .bind(room_id)
    .bind(uid)
    .bind(since)
    .fetch_one(pool)
    .await?;
    Ok(exists)
}

#[cfg(test)]
#[path = "room_test.rs"]
mod tests;
