//! Coordination tuning knobs, loaded from environment variables.
//!
//! DESIGN
//! ======
//! Every window, threshold, and interval in the coordination core is
//! configuration, not a per-call-site constant. Defaults are chosen so a
//! bare `partyroom` binary behaves sensibly; deployments override via env.
//!
//! All durations that feed the pure predicates are epoch-millisecond
//! `i64` values, the same time currency as presence timestamps and the
//! authoritative store's BIGINT columns.

const DEFAULT_HEARTBEAT_MS: i64 = 20_000;
const DEFAULT_STALE_THRESHOLD_MS: i64 = 120_000;
const DEFAULT_MAX_CLOCK_SKEW_MS: i64 = 30_000;

const DEFAULT_ACCEPT_FRESH_MS: i64 = 5_000;
const DEFAULT_VERIFY_CACHE_MS: i64 = 30_000;
const DEFAULT_QUARANTINE_MS: i64 = 120_000;
const DEFAULT_BACKOFF_FLOOR_MS: u64 = 10_000;
const DEFAULT_BACKOFF_CEIL_MS: u64 = 300_000;
const DEFAULT_HEALTH_DECAY_AFTER_MS: i64 = 300_000;
const DEFAULT_LOBBY_MAX_ROOMS: usize = 1024;

const DEFAULT_LEAVE_GRACE_MS: u64 = 4_000;
const DEFAULT_EMPTY_ROOM_GRACE_MS: i64 = 120_000;
const DEFAULT_NOTIFY_DEDUPE_MS: i64 = 4_000;
const DEFAULT_NOTIFY_LEDGER_PRUNE_MS: i64 = 60_000;
const DEFAULT_SNAPSHOT_CAP: usize = 32;
const DEFAULT_HEARTBEAT_WRITETHROUGH_MS: i64 = 30_000;

const DEFAULT_EXPIRED_SWEEP_SECS: u64 = 3_600;
const DEFAULT_GHOST_SWEEP_SECS: u64 = 18_000;
const DEFAULT_IDLE_SWEEP_SECS: u64 = 36_000;
const DEFAULT_PRESENCE_SWEEP_SECS: u64 = 3_600;
const DEFAULT_RETENTION_SWEEP_SECS: u64 = 86_400;
const DEFAULT_SWEEP_ROOM_LIMIT: usize = 50;
const DEFAULT_PRESENCE_SWEEP_LIMIT: usize = 500;
const DEFAULT_GHOST_MIN_AGE_MS: i64 = 3_600_000;
const DEFAULT_GHOST_IDLE_MS: i64 = 21_600_000;
const DEFAULT_IDLE_PLAYER_MS: i64 = 43_200_000;
const DEFAULT_CHAT_RETENTION_DAYS: i64 = 7;
const DEFAULT_EVENT_RETENTION_DAYS: i64 = 30;
const DEFAULT_DELETE_BATCH: usize = 500;

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| match v.as_str() {
            "1" | "true" | "yes" => Some(true),
            "0" | "false" | "no" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

// =============================================================================
// LIVENESS
// =============================================================================

/// Windows for deciding whether a presence connection is alive.
#[derive(Debug, Clone, Copy)]
pub struct LivenessConfig {
    /// Expected client heartbeat interval.
    pub heartbeat_ms: i64,
    /// A connection without a heartbeat for this long is stale.
    /// Clamped to at least `heartbeat_ms + 5s` so a single late beat
    /// cannot flap a connection offline.
    pub stale_threshold_ms: i64,
    /// Reject heartbeat timestamps further in the future than this.
    pub max_clock_skew_ms: i64,
}

impl LivenessConfig {
    #[must_use]
    pub fn from_env() -> Self {
        let heartbeat_ms = env_parse("PRESENCE_HEARTBEAT_MS", DEFAULT_HEARTBEAT_MS);
        let stale_threshold_ms = env_parse("PRESENCE_STALE_THRESHOLD_MS", DEFAULT_STALE_THRESHOLD_MS);
        Self {
            heartbeat_ms,
            stale_threshold_ms,
            max_clock_skew_ms: env_parse("PRESENCE_MAX_CLOCK_SKEW_MS", DEFAULT_MAX_CLOCK_SKEW_MS),
        }
        .clamped()
    }

    /// Enforce `stale_threshold >= heartbeat + 5s`.
    #[must_use]
    pub fn clamped(mut self) -> Self {
        let floor = self.heartbeat_ms.saturating_add(5_000);
        if self.stale_threshold_ms < floor {
            self.stale_threshold_ms = floor;
        }
        self
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: DEFAULT_HEARTBEAT_MS,
            stale_threshold_ms: DEFAULT_STALE_THRESHOLD_MS,
            max_clock_skew_ms: DEFAULT_MAX_CLOCK_SKEW_MS,
        }
    }
}

// =============================================================================
// LOBBY RECONCILER
// =============================================================================

/// Tuning for the display-count reconciler.
#[derive(Debug, Clone, Copy)]
pub struct LobbyConfig {
    /// Hold a derived count at zero for this long after it first hits zero.
    pub zero_hold_ms: i64,
    /// A reappearing signal younger than this lifts the zero hold.
    pub accept_fresh_ms: i64,
    /// Lifetime of a cached authoritative recount.
    pub verify_cache_ms: i64,
    /// How long a uid verified absent stays excluded from counts.
    pub quarantine_ms: i64,
    /// Verification backoff bounds.
    pub backoff_floor_ms: u64,
    pub backoff_ceil_ms: u64,
    /// Health score ceiling (floor is 0).
    pub health_max: f64,
    /// Idle period after which health decays back toward 1.0.
    pub health_decay_after_ms: i64,
    /// Verify every non-zero count, not just count == 1.
    pub multi_verify: bool,
    /// Upper bound on tracked per-room entries.
    pub max_rooms: usize,
}

impl LobbyConfig {
    #[must_use]
    pub fn from_env(liveness: &LivenessConfig) -> Self {
        let default_zero_hold = liveness.stale_threshold_ms.saturating_add(5_000);
        Self {
            zero_hold_ms: env_parse("LOBBY_ZERO_HOLD_MS", default_zero_hold),
            accept_fresh_ms: env_parse("LOBBY_ACCEPT_FRESH_MS", DEFAULT_ACCEPT_FRESH_MS),
            verify_cache_ms: env_parse("LOBBY_VERIFY_CACHE_MS", DEFAULT_VERIFY_CACHE_MS),
            quarantine_ms: env_parse("LOBBY_QUARANTINE_MS", DEFAULT_QUARANTINE_MS),
            backoff_floor_ms: env_parse("LOBBY_BACKOFF_FLOOR_MS", DEFAULT_BACKOFF_FLOOR_MS),
            backoff_ceil_ms: env_parse("LOBBY_BACKOFF_CEIL_MS", DEFAULT_BACKOFF_CEIL_MS),
            health_max: 2.0,
            health_decay_after_ms: env_parse("LOBBY_HEALTH_DECAY_AFTER_MS", DEFAULT_HEALTH_DECAY_AFTER_MS),
            multi_verify: env_flag("LOBBY_MULTI_VERIFY", false),
            max_rooms: env_parse("LOBBY_MAX_ROOMS", DEFAULT_LOBBY_MAX_ROOMS),
        }
    }
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            zero_hold_ms: DEFAULT_STALE_THRESHOLD_MS + 5_000,
            accept_fresh_ms: DEFAULT_ACCEPT_FRESH_MS,
            verify_cache_ms: DEFAULT_VERIFY_CACHE_MS,
            quarantine_ms: DEFAULT_QUARANTINE_MS,
            backoff_floor_ms: DEFAULT_BACKOFF_FLOOR_MS,
            backoff_ceil_ms: DEFAULT_BACKOFF_CEIL_MS,
            health_max: 2.0,
            health_decay_after_ms: DEFAULT_HEALTH_DECAY_AFTER_MS,
            multi_verify: false,
            max_rooms: DEFAULT_LOBBY_MAX_ROOMS,
        }
    }
}

// =============================================================================
// REAPER
// =============================================================================

/// Intervals, limits, and age thresholds for the scheduled sweeps.
#[derive(Debug, Clone, Copy)]
pub struct ReaperConfig {
    pub expired_sweep_secs: u64,
    pub ghost_sweep_secs: u64,
    pub idle_sweep_secs: u64,
    pub presence_sweep_secs: u64,
    pub retention_sweep_secs: u64,
    /// Rooms examined per sweep run.
    pub sweep_room_limit: usize,
    /// Connection records removed per presence sweep run.
    pub presence_sweep_limit: usize,
    /// Rooms younger than this are never ghost-purged.
    pub ghost_min_age_ms: i64,
    /// Inactivity before a room is a ghost candidate.
    pub ghost_idle_ms: i64,
    /// Inactivity before stale players are pruned from a room.
    pub idle_player_ms: i64,
    pub chat_retention_days: i64,
    pub event_retention_days: i64,
    /// Rows deleted per retention batch.
    pub delete_batch: usize,
}

impl ReaperConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            expired_sweep_secs: env_parse("REAPER_EXPIRED_SWEEP_SECS", DEFAULT_EXPIRED_SWEEP_SECS),
            ghost_sweep_secs: env_parse("REAPER_GHOST_SWEEP_SECS", DEFAULT_GHOST_SWEEP_SECS),
            idle_sweep_secs: env_parse("REAPER_IDLE_SWEEP_SECS", DEFAULT_IDLE_SWEEP_SECS),
            presence_sweep_secs: env_parse("REAPER_PRESENCE_SWEEP_SECS", DEFAULT_PRESENCE_SWEEP_SECS),
            retention_sweep_secs: env_parse("REAPER_RETENTION_SWEEP_SECS", DEFAULT_RETENTION_SWEEP_SECS),
            sweep_room_limit: env_parse("REAPER_SWEEP_ROOM_LIMIT", DEFAULT_SWEEP_ROOM_LIMIT),
            presence_sweep_limit: env_parse("REAPER_PRESENCE_SWEEP_LIMIT", DEFAULT_PRESENCE_SWEEP_LIMIT),
            ghost_min_age_ms: env_parse("REAPER_GHOST_MIN_AGE_MS", DEFAULT_GHOST_MIN_AGE_MS),
            ghost_idle_ms: env_parse("REAPER_GHOST_IDLE_MS", DEFAULT_GHOST_IDLE_MS),
            idle_player_ms: env_parse("REAPER_IDLE_PLAYER_MS", DEFAULT_IDLE_PLAYER_MS),
            chat_retention_days: env_parse("REAPER_CHAT_RETENTION_DAYS", DEFAULT_CHAT_RETENTION_DAYS),
            event_retention_days: env_parse("REAPER_EVENT_RETENTION_DAYS", DEFAULT_EVENT_RETENTION_DAYS),
            delete_batch: env_parse("REAPER_DELETE_BATCH", DEFAULT_DELETE_BATCH),
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            expired_sweep_secs: DEFAULT_EXPIRED_SWEEP_SECS,
            ghost_sweep_secs: DEFAULT_GHOST_SWEEP_SECS,
            idle_sweep_secs: DEFAULT_IDLE_SWEEP_SECS,
            presence_sweep_secs: DEFAULT_PRESENCE_SWEEP_SECS,
            retention_sweep_secs: DEFAULT_RETENTION_SWEEP_SECS,
            sweep_room_limit: DEFAULT_SWEEP_ROOM_LIMIT,
            presence_sweep_limit: DEFAULT_PRESENCE_SWEEP_LIMIT,
            ghost_min_age_ms: DEFAULT_GHOST_MIN_AGE_MS,
            ghost_idle_ms: DEFAULT_GHOST_IDLE_MS,
            idle_player_ms: DEFAULT_IDLE_PLAYER_MS,
            chat_retention_days: DEFAULT_CHAT_RETENTION_DAYS,
            event_retention_days: DEFAULT_EVENT_RETENTION_DAYS,
            delete_batch: DEFAULT_DELETE_BATCH,
        }
    }
}

// =============================================================================
// ROOM POLICY
// =============================================================================

/// Lifecycle policy switches whose "correct" value depends on product intent.
#[derive(Debug, Clone, Copy)]
pub struct RoomPolicy {
    /// Allow a failed round to keep running after a mid-round leave.
    /// Off means any leave during a failed `clue` phase forces reveal.
    pub continue_after_failure: bool,
    /// Auto-reset round state when the last player leaves while the round
    /// is flagged failed. Off leaves the wreckage for a manual host reset.
    pub reset_on_empty_failed: bool,
}

impl RoomPolicy {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            continue_after_failure: env_flag("ROOM_CONTINUE_AFTER_FAILURE", false),
            reset_on_empty_failed: env_flag("ROOM_RESET_ON_EMPTY_FAILED", false),
        }
    }
}

impl Default for RoomPolicy {
    fn default() -> Self {
        Self { continue_after_failure: false, reset_on_empty_failed: false }
    }
}

// =============================================================================
// TOP LEVEL
// =============================================================================

/// Everything the coordination core needs to know about time and limits.
#[derive(Debug, Clone, Copy)]
pub struct CoordinationConfig {
    pub liveness: LivenessConfig,
    pub lobby: LobbyConfig,
    pub reaper: ReaperConfig,
    pub policy: RoomPolicy,
    /// Disconnect-to-leave grace delay; always followed by a re-check.
    pub leave_grace_ms: u64,
    /// `expires_at` offset stamped when a room hits zero occupancy.
    pub empty_room_grace_ms: i64,
    /// Window suppressing duplicate departure notifications per user.
    pub notify_dedupe_ms: i64,
    /// Ledger entries older than this are pruned opportunistically.
    pub notify_ledger_prune_ms: i64,
    /// Cap on retained departed-player snapshots per room.
    pub snapshot_cap: usize,
    /// Minimum spacing of `players.last_seen` write-through updates.
    pub heartbeat_writethrough_ms: i64,
}

impl CoordinationConfig {
    #[must_use]
    pub fn from_env() -> Self {
        let liveness = LivenessConfig::from_env();
        Self {
            liveness,
            lobby: LobbyConfig::from_env(&liveness),
            reaper: ReaperConfig::from_env(),
            policy: RoomPolicy::from_env(),
            leave_grace_ms: env_parse("ROOM_LEAVE_GRACE_MS", DEFAULT_LEAVE_GRACE_MS),
            empty_room_grace_ms: env_parse("ROOM_EMPTY_GRACE_MS", DEFAULT_EMPTY_ROOM_GRACE_MS),
            notify_dedupe_ms: env_parse("NOTIFY_DEDUPE_MS", DEFAULT_NOTIFY_DEDUPE_MS),
            notify_ledger_prune_ms: env_parse("NOTIFY_LEDGER_PRUNE_MS", DEFAULT_NOTIFY_LEDGER_PRUNE_MS),
            snapshot_cap: env_parse("ROOM_SNAPSHOT_CAP", DEFAULT_SNAPSHOT_CAP),
            heartbeat_writethrough_ms: env_parse("HEARTBEAT_WRITETHROUGH_MS", DEFAULT_HEARTBEAT_WRITETHROUGH_MS),
        }
    }
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            liveness: LivenessConfig::default(),
            lobby: LobbyConfig::default(),
            reaper: ReaperConfig::default(),
            policy: RoomPolicy::default(),
            leave_grace_ms: DEFAULT_LEAVE_GRACE_MS,
            empty_room_grace_ms: DEFAULT_EMPTY_ROOM_GRACE_MS,
            notify_dedupe_ms: DEFAULT_NOTIFY_DEDUPE_MS,
            notify_ledger_prune_ms: DEFAULT_NOTIFY_LEDGER_PRUNE_MS,
            snapshot_cap: DEFAULT_SNAPSHOT_CAP,
            heartbeat_writethrough_ms: DEFAULT_HEARTBEAT_WRITETHROUGH_MS,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_threshold_never_tighter_than_heartbeat_plus_five() {
        let cfg = LivenessConfig { heartbeat_ms: 60_000, stale_threshold_ms: 10_000, max_clock_skew_ms: 0 }.clamped();
        assert_eq!(cfg.stale_threshold_ms, 65_000);
    }

    #[test]
    fn default_stale_threshold_survives_clamp() {
        let cfg = LivenessConfig::default().clamped();
        assert_eq!(cfg.stale_threshold_ms, 120_000);
    }

    #[test]
    fn default_zero_hold_tracks_stale_threshold() {
        let cfg = LobbyConfig::default();
        assert_eq!(cfg.zero_hold_ms, 125_000);
    }

    #[test]
    fn policy_defaults_to_manual_reset() {
        let policy = RoomPolicy::default();
        assert!(!policy.reset_on_empty_failed);
        assert!(!policy.continue_after_failure);
    }
}
