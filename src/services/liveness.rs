//! Presence liveness — the single predicate deciding whether a connection
//! record counts as alive.
//!
//! DESIGN
//! ======
//! Every component that cares about liveness (registry, reconciler,
//! coordinator, reaper) calls into this module; nothing re-derives the
//! rules ad hoc. The predicate is pure over `(record, now, config)` so it
//! tests without a clock and behaves identically across call sites.

use crate::config::LivenessConfig;

/// One ephemeral presence connection as read from the registry.
///
/// `online` is an explicit flag the client writes on connect/disconnect;
/// it may be absent. `ts` is the last heartbeat in epoch ms; absent until
/// the first beat lands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnRecord {
    pub online: Option<bool>,
    pub ts: Option<i64>,
}

/// Whether a single connection is currently alive.
///
/// - An explicit `online == false` is never alive.
/// - An explicit `online == true` with no heartbeat yet is alive; covers
///   the just-connected window before the first beat is written.
/// - Otherwise a heartbeat is required: positive, not implausibly in the
///   future, and within the stale threshold.
#[must_use]
pub fn is_active(conn: &ConnRecord, now_ms: i64, cfg: &LivenessConfig) -> bool {
    if conn.online == Some(false) {
        return false;
    }
    let Some(ts) = conn.ts else {
        return conn.online == Some(true);
    };
    if ts <= 0 {
        return false;
    }
    if ts - now_ms > cfg.max_clock_skew_ms {
        return false;
    }
    now_ms - ts <= cfg.stale_threshold_ms
}

/// Whether a user is present: at least one of their connections is alive.
#[must_use]
pub fn user_present<'a, I>(conns: I, now_ms: i64, cfg: &LivenessConfig) -> bool
where
    I: IntoIterator<Item = &'a ConnRecord>,
{
    conns.into_iter().any(|c| is_active(c, now_ms, cfg))
}

#[cfg(test)]
#[path = "liveness_test.rs"]
mod tests;
