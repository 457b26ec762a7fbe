//! Idle/ghost room reaper — scheduled sweeps reclaiming dead state.
//!
//! DESIGN
//! ======
//! Five independent sweeps, each on its own configurable interval with a
//! jittered start, each bounded per run, each idempotent. None assumes
//! exclusive access to a room: every destructive step re-checks its
//! precondition inside a transaction, so an expiry racing a legitimate
//! rejoin spares the room and refreshes it instead.
//!
//! - expired-room purge: rooms past `expires_at` with zero players
//! - ghost-room purge: old, presence-dead, heartbeat-dead rooms
//! - idle-room pruning: stale player rows only, room kept
//! - presence registry sweep: stale connection records
//! - retention: chat/event rows past their age limits, in batches

use std::collections::HashSet;
use std::time::Duration;

use rand::Rng;
use sqlx::{Postgres, Row, Transaction};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::config::ReaperConfig;
use crate::frame::now_ms;
use crate::state::{AppState, RoomStatus};

const DAY_MS: i64 = 86_400_000;
const MAX_RETENTION_BATCHES_PER_RUN: usize = 20;

// =============================================================================
// SCHEDULING
// =============================================================================

/// Spawn all sweep loops. Returns handles for shutdown.
pub fn spawn_reaper_tasks(state: &AppState) -> Vec<JoinHandle<()>> {
    let cfg = state.config.reaper;
    vec![
        spawn_sweep(state.clone(), "expired-rooms", cfg.expired_sweep_secs, |state| async move {
            sweep_expired_rooms(&state, now_ms()).await
        }),
        spawn_sweep(state.clone(), "ghost-rooms", cfg.ghost_sweep_secs, |state| async move {
            sweep_ghost_rooms(&state, now_ms()).await
        }),
        spawn_sweep(state.clone(), "idle-players", cfg.idle_sweep_secs, |state| async move {
            sweep_idle_players(&state, now_ms()).await
        }),
        spawn_sweep(state.clone(), "presence", cfg.presence_sweep_secs, |state| async move {
            Ok(sweep_presence(&state, now_ms()))
        }),
        spawn_sweep(state.clone(), "retention", cfg.retention_sweep_secs, |state| async move {
            sweep_retention(&state, now_ms()).await
        }),
    ]
}

fn spawn_sweep<F, Fut>(state: AppState, name: &'static str, interval_secs: u64, sweep: F) -> JoinHandle<()>
where
    F: Fn(AppState) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<usize, sqlx::Error>> + Send,
{
    tokio::spawn(async move {
        // Jitter the first run so co-deployed instances fan out.
        let jitter_secs = rand::rng().random_range(0..interval_secs.max(1));
        tokio::time::sleep(Duration::from_secs(jitter_secs)).await;

        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match sweep(state.clone()).await {
                Ok(touched) => {
                    if touched > 0 {
                        info!(sweep = name, touched, "reaper sweep complete");
                    }
                }
                Err(e) => warn!(sweep = name, error = %e, "reaper sweep failed"),
            }
        }
    })
}

// =============================================================================
// GHOST VERDICT
// =============================================================================

/// Pure decision: is this room a ghost worth purging?
///
/// Young rooms are never ghosts. A room with live presence or a recent
/// player heartbeat is not a ghost. A mid-round room is spared unless its
/// inactivity is far past the idle threshold ("clearly stale").
#[must_use]
pub fn ghost_verdict(
    status: RoomStatus,
    created_at: i64,
    last_active_at: i64,
    has_presence: bool,
    has_recent_heartbeat: bool,
    now: i64,
    cfg: &ReaperConfig,
) -> bool {
    if now - created_at < cfg.ghost_min_age_ms {
        return false;
    }
    if has_presence || has_recent_heartbeat {
        return false;
    }
    if now - last_active_at < cfg.ghost_idle_ms {
        return false;
    }
    if status != RoomStatus::Waiting && now - last_active_at < cfg.ghost_idle_ms.saturating_mul(2) {
        return false;
    }
    true
}

// =============================================================================
// EXPIRED-ROOM PURGE
// =============================================================================

/// Delete rooms whose zero-occupancy grace expired; spare and refresh any
/// that regained players in the meantime.
///
/// # Errors
///
/// Returns a database error if a query fails.
pub async fn sweep_expired_rooms(state: &AppState, now: i64) -> Result<usize, sqlx::Error> {
    let limit = i64::try_from(state.config.reaper.sweep_room_limit).unwrap_or(50);
    let candidates: Vec<String> = sqlx::query_scalar(
        "SELECT id FROM rooms WHERE expires_at IS NOT NULL AND expires_at < $1 ORDER BY expires_at ASC LIMIT $2",
    )
    .bind(now)
    .bind(limit)
    .fetch_all(&state.pool)
    .await?;

    let mut purged = 0;
    for room_id in candidates {
        let mut tx = state.pool.begin().await?;
        // Re-check under the lock: expiry must not race a rejoin.
        let row = sqlx::query("SELECT expires_at FROM rooms WHERE id = $1 FOR UPDATE")
            .bind(&room_id)
            .fetch_optional(tx.as_mut())
            .await?;
        let Some(row) = row else {
            continue;
        };
        let expires_at: Option<i64> = row.get("expires_at");
        if expires_at.is_none_or(|e| e >= now) {
            continue;
        }

        let occupants: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM players WHERE room_id = $1")
            .bind(&room_id)
            .fetch_one(tx.as_mut())
            .await?;

        if occupants > 0 {
            sqlx::query("UPDATE rooms SET expires_at = NULL, last_active_at = $2 WHERE id = $1")
                .bind(&room_id)
                .bind(now)
                .execute(tx.as_mut())
                .await?;
            tx.commit().await?;
            info!(room_id, occupants, "expired room spared; players present");
            continue;
        }

        delete_room_records(&mut tx, &room_id).await?;
        tx.commit().await?;
        state.presence.remove_room(&room_id);
        purged += 1;
        info!(room_id, "expired room purged");
    }
    Ok(purged)
}

/// Children first, then the room row.
async fn delete_room_records(tx: &mut Transaction<'_, Postgres>, room_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM players WHERE room_id = $1")
        .bind(room_id)
        .execute(tx.as_mut())
        .await?;
    sqlx::query("DELETE FROM chat_messages WHERE room_id = $1")
        .bind(room_id)
        .execute(tx.as_mut())
        .await?;
    sqlx::query("DELETE FROM rooms WHERE id = $1")
        .bind(room_id)
        .execute(tx.as_mut())
        .await?;
    Ok(())
}

// =============================================================================
// GHOST-ROOM PURGE
// =============================================================================

/// Purge rooms with no genuine occupants but residual document data.
///
/// # Errors
///
/// Returns a database error if a query fails.
pub async fn sweep_ghost_rooms(state: &AppState, now: i64) -> Result<usize, sqlx::Error> {
    let cfg = state.config.reaper;
    let limit = i64::try_from(cfg.sweep_room_limit).unwrap_or(50);
    let rows = sqlx::query(
        "SELECT id, status, created_at, last_active_at FROM rooms \
         WHERE created_at < $1 AND last_active_at < $2 \
         ORDER BY last_active_at ASC LIMIT $3",
    )
    .bind(now - cfg.ghost_min_age_ms)
    .bind(now - cfg.ghost_idle_ms)
    .bind(limit)
    .fetch_all(&state.pool)
    .await?;

    let heartbeat_cutoff = now - state.config.liveness.stale_threshold_ms;
    let mut purged = 0;
    for row in rows {
        let room_id: String = row.get("id");
        let status: String = row.get("status");
        let status = RoomStatus::from_str(&status).unwrap_or(RoomStatus::Waiting);
        let created_at: i64 = row.get("created_at");
        let last_active_at: i64 = row.get("last_active_at");

        let has_presence = !state
            .presence
            .present_uids(&room_id, now, &state.config.liveness)
            .is_empty();
        let has_recent_heartbeat: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM players WHERE room_id = $1 AND last_seen >= $2)",
        )
        .bind(&room_id)
        .bind(heartbeat_cutoff)
        .fetch_one(&state.pool)
        .await?;

        if !ghost_verdict(status, created_at, last_active_at, has_presence, has_recent_heartbeat, now, &cfg) {
            continue;
        }

        let mut tx = state.pool.begin().await?;
        // Lock and re-check activity: someone may have touched the room
        // between the candidate scan and now.
        let still_idle: Option<i64> = sqlx::query_scalar("SELECT last_active_at FROM rooms WHERE id = $1 FOR UPDATE")
            .bind(&room_id)
            .fetch_optional(tx.as_mut())
            .await?;
        if still_idle.is_none_or(|active| active != last_active_at) {
            continue;
        }
        delete_room_records(&mut tx, &room_id).await?;
        tx.commit().await?;
        state.presence.remove_room(&room_id);
        purged += 1;
        info!(room_id, "ghost room purged");
    }
    Ok(purged)
}

// =============================================================================
// IDLE-ROOM PRUNING
// =============================================================================

/// Remove stale player rows from long-idle rooms; the room itself stays.
/// Skips any room with live presence or a recent heartbeat.
///
/// # Errors
///
/// Returns a database error if a query fails.
pub async fn sweep_idle_players(state: &AppState, now: i64) -> Result<usize, sqlx::Error> {
    let cfg = state.config.reaper;
    let limit = i64::try_from(cfg.sweep_room_limit).unwrap_or(50);
    let candidates: Vec<String> = sqlx::query_scalar(
        "SELECT DISTINCT r.id FROM rooms r JOIN players p ON p.room_id = r.id \
         WHERE r.last_active_at < $1 LIMIT $2",
    )
    .bind(now - cfg.idle_player_ms)
    .bind(limit)
    .fetch_all(&state.pool)
    .await?;

    let heartbeat_cutoff = now - state.config.liveness.stale_threshold_ms;
    let mut pruned_rooms = 0;
    for room_id in candidates {
        // Leave active rooms untouched.
        if !state
            .presence
            .present_uids(&room_id, now, &state.config.liveness)
            .is_empty()
        {
            continue;
        }

        let mut tx = state.pool.begin().await?;
        let locked: Option<i64> = sqlx::query_scalar("SELECT last_active_at FROM rooms WHERE id = $1 FOR UPDATE")
            .bind(&room_id)
            .fetch_optional(tx.as_mut())
            .await?;
        if locked.is_none_or(|active| active >= now - cfg.idle_player_ms) {
            continue;
        }
        let has_recent_heartbeat: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM players WHERE room_id = $1 AND last_seen >= $2)",
        )
        .bind(&room_id)
        .bind(heartbeat_cutoff)
        .fetch_one(tx.as_mut())
        .await?;
        if has_recent_heartbeat {
            continue;
        }

        let deleted = sqlx::query("DELETE FROM players WHERE room_id = $1 AND last_seen < $2")
            .bind(&room_id)
            .bind(heartbeat_cutoff)
            .execute(tx.as_mut())
            .await?
            .rows_affected();

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM players WHERE room_id = $1")
            .bind(&room_id)
            .fetch_one(tx.as_mut())
            .await?;
        if remaining == 0 {
            // Nobody left: blank the host seat and arm the grace expiry so
            // the expired-room sweep can finish the job.
            sqlx::query(
                "UPDATE rooms SET host_id = NULL, host_name = NULL, expires_at = $2 WHERE id = $1",
            )
            .bind(&room_id)
            .bind(now + state.config.empty_room_grace_ms)
            .execute(tx.as_mut())
            .await?;
        }
        tx.commit().await?;

        if deleted > 0 {
            pruned_rooms += 1;
            info!(room_id, deleted, remaining, "idle room pruned");
        }
    }
    Ok(pruned_rooms)
}

// =============================================================================
// PRESENCE SWEEP
// =============================================================================

/// Drop stale connection records from the ephemeral registry and prune
/// the reconciler's soft state down to rooms that still have any signal.
pub fn sweep_presence(state: &AppState, now: i64) -> usize {
    let removed = state.presence.sweep_stale(
        now,
        &state.config.liveness,
        state.config.reaper.presence_sweep_limit,
    );
    let active: HashSet<String> = state.presence.room_ids().into_iter().collect();
    state.lobby.prune_rooms(&active);
    removed
}

// =============================================================================
// RETENTION
// =============================================================================

/// Delete chat and event rows past their retention ages, in batches that
/// respect the store's comfortable delete size.
///
/// # Errors
///
/// Returns a database error if a delete fails.
pub async fn sweep_retention(state: &AppState, now: i64) -> Result<usize, sqlx::Error> {
    let cfg = state.config.reaper;
    let mut total = 0;
    total += batched_delete(
        &state.pool,
        "chat_messages",
        now - cfg.chat_retention_days * DAY_MS,
        cfg.delete_batch,
    )
    .await?;
    total += batched_delete(
        &state.pool,
        "room_events",
        now - cfg.event_retention_days * DAY_MS,
        cfg.delete_batch,
    )
    .await?;
    Ok(total)
}

async fn batched_delete(pool: &sqlx::PgPool, table: &str, cutoff: i64, batch: usize) -> Result<usize, sqlx::Error> {
    let batch_i64 = i64::try_from(batch).unwrap_or(500);
    let mut total = 0usize;
    for _ in 0..MAX_RETENTION_BATCHES_PER_RUN {
        let deleted = sqlx::query(&format!(
            "DELETE FROM {table} WHERE id IN (SELECT id FROM {table} WHERE ts < $1 ORDER BY ts ASC LIMIT $2)"
        ))
        .bind(cutoff)
        .bind(batch_i64)
        .execute(pool)
        .await?
        .rows_affected();
        total += usize::try_from(deleted).unwrap_or(0);
        if usize::try_from(deleted).unwrap_or(0) < batch {
            break;
        }
    }
    Ok(total)
}

#[cfg(test)]
#[path = "reaper_test.rs"]
mod tests;
