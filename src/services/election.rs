//! Host election — deterministic seat assignment over a player snapshot.
//!
//! DESIGN
//! ======
//! Election is a pure decision function: callers pass the latest snapshot
//! (players plus a liveness-derived online set) and apply the returned
//! decision themselves. No caching across calls: every evaluation starts
//! from a transactional read, which is what makes the no-consensus scheme
//! sound (see `services::room` module docs).
//!
//! The candidate order is total: two evaluators handed the same snapshot
//! always converge on the same host without coordination.

use std::collections::HashMap;

// =============================================================================
// TYPES
// =============================================================================

/// One player as seen by the election, already joined with liveness.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: String,
    pub name: String,
    pub joined_at: i64,
    pub order_index: i32,
    pub last_seen_at: i64,
    pub is_online: bool,
}

/// Snapshot handed to an evaluation.
#[derive(Debug, Clone)]
pub struct ElectionInput {
    pub current_host_id: Option<String>,
    pub players: Vec<Candidate>,
    /// Uid currently departing; never electable.
    pub leaving_uid: Option<String>,
}

/// Why a seat changed hands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    ClaimSuccess,
    AutoAssign,
    HostLeft,
    NoPlayers,
}

impl DecisionReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClaimSuccess => "claim-success",
            Self::AutoAssign => "auto-assign",
            Self::HostLeft => "host-left",
            Self::NoPlayers => "no-players",
        }
    }
}

/// What the caller must do with the host seat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostDecision {
    /// Keep the current host untouched.
    None,
    /// Set `host_id`/`host_name` to this candidate.
    Assign { id: String, name: String, reason: DecisionReason },
    /// Blank `host_id` and `host_name`.
    Clear { reason: DecisionReason },
}

// =============================================================================
// NORMALIZATION
// =============================================================================

/// Collapse the snapshot to one candidate per id.
///
/// Drops the leaving uid, keeps the earliest `joined_at`/`order_index`
/// seen for a duplicated id, and ORs the online flags; a reconnect race
/// briefly showing two records must not demote the player.
fn normalize(input: &ElectionInput) -> Vec<Candidate> {
    let mut by_id: HashMap<&str, Candidate> = HashMap::new();
    for player in &input.players {
        if input.leaving_uid.as_deref() == Some(player.id.as_str()) {
            continue;
        }
        match by_id.get_mut(player.id.as_str()) {
            Some(existing) => {
                existing.joined_at = existing.joined_at.min(player.joined_at);
                existing.order_index = existing.order_index.min(player.order_index);
                existing.last_seen_at = existing.last_seen_at.min(player.last_seen_at);
                existing.is_online |= player.is_online;
                if existing.name.is_empty() && !player.name.is_empty() {
                    existing.name = player.name.clone();
                }
            }
            None => {
                by_id.insert(player.id.as_str(), player.clone());
            }
        }
    }
    let mut candidates: Vec<Candidate> = by_id.into_values().collect();
    candidates.sort_by(|a, b| {
        b.is_online
            .cmp(&a.is_online)
            .then(a.joined_at.cmp(&b.joined_at))
            .then(a.order_index.cmp(&b.order_index))
            .then(a.last_seen_at.cmp(&b.last_seen_at))
            .then(a.id.cmp(&b.id))
    });
    candidates
}

fn host_is_present(input: &ElectionInput, candidates: &[Candidate]) -> bool {
    let Some(host_id) = input.current_host_id.as_deref() else {
        return false;
    };
    if host_id.is_empty() {
        return false;
    }
    candidates.iter().any(|c| c.id == host_id && c.is_online)
}

// =============================================================================
// EVALUATION
// =============================================================================

/// A player asks for the seat.
///
/// Rejected while the current host is present. Otherwise the seat goes to
/// the top candidate, which may not be the claimant if someone else is
/// legitimately owed it.
#[must_use]
pub fn evaluate_claim(input: &ElectionInput, claimant_id: &str) -> HostDecision {
    let candidates = normalize(input);
    if host_is_present(input, &candidates) {
        return HostDecision::None;
    }
    let Some(top) = candidates.first() else {
        return HostDecision::Clear { reason: DecisionReason::NoPlayers };
    };
    let reason = if top.id == claimant_id {
        DecisionReason::ClaimSuccess
    } else {
        DecisionReason::AutoAssign
    };
    HostDecision::Assign { id: top.id.clone(), name: top.name.clone(), reason }
}

/// Re-evaluate the seat after a departure, which may be the host's own.
#[must_use]
pub fn evaluate_after_leave(input: &ElectionInput) -> HostDecision {
    let candidates = normalize(input);
    if host_is_present(input, &candidates) {
        return HostDecision::None;
    }
    let Some(top) = candidates.first() else {
        return HostDecision::Clear { reason: DecisionReason::NoPlayers };
    };
    HostDecision::Assign { id: top.id.clone(), name: top.name.clone(), reason: DecisionReason::HostLeft }
}

#[cfg(test)]
#[path = "election_test.rs"]
mod tests;
