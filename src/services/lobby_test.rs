use super::*;

const NOW: i64 = 1_700_000_000_000;

fn liveness() -> LivenessConfig {
    LivenessConfig { heartbeat_ms: 20_000, stale_threshold_ms: 120_000, max_clock_skew_ms: 30_000 }
}

fn lobby_cfg() -> LobbyConfig {
    LobbyConfig {
        zero_hold_ms: 125_000,
        accept_fresh_ms: 5_000,
        verify_cache_ms: 30_000,
        quarantine_ms: 120_000,
        backoff_floor_ms: 10_000,
        backoff_ceil_ms: 300_000,
        health_max: 2.0,
        health_decay_after_ms: 300_000,
        multi_verify: false,
        max_rooms: 8,
    }
}

fn reconciler() -> LobbyReconciler {
    LobbyReconciler::new(lobby_cfg(), liveness())
}

fn conn(ts: i64) -> ConnRecord {
    ConnRecord { online: None, ts: Some(ts) }
}

fn snapshot(entries: &[(&str, Vec<ConnRecord>)]) -> HashMap<String, Vec<ConnRecord>> {
    entries
        .iter()
        .map(|(uid, conns)| ((*uid).to_string(), conns.clone()))
        .collect()
}

#[test]
fn counts_present_users_and_applies_exclusions() {
    let lobby = reconciler();
    let snap = snapshot(&[
        ("u1", vec![conn(NOW - 1_000)]),
        ("u2", vec![conn(NOW - 2_000)]),
        ("viewer", vec![conn(NOW - 500)]),
        ("stale", vec![conn(NOW - 500_000)]),
    ]);
    assert_eq!(lobby.derived_count_at("r1", &snap, &["viewer"], NOW), 2);
}

#[test]
fn zero_hold_suppresses_stale_reappearance() {
    let lobby = reconciler();
    let live = snapshot(&[("u1", vec![conn(NOW - 1_000)]), ("u2", vec![conn(NOW - 1_000)])]);
    assert_eq!(lobby.derived_count_at("r1", &live, &[], NOW), 2);

    // Everyone drops; count reaches zero and the hold arms.
    let empty = snapshot(&[]);
    assert_eq!(lobby.derived_count_at("r1", &empty, &[], NOW + 1_000), 0);

    // A stale write for u1 is redelivered inside the hold window: held at 0.
    let ghost = snapshot(&[("u1", vec![conn(NOW - 100_000)])]);
    assert_eq!(lobby.derived_count_at("r1", &ghost, &[], NOW + 3_000), 0);
}

#[test]
fn fresh_reappearance_lifts_zero_hold_immediately() {
    // 2 -> 0 -> one of the two reappears 2s later with a 1s-old
    // heartbeat. The hold lifts; count shown is 1.
    let lobby = reconciler();
    let live = snapshot(&[("u1", vec![conn(NOW - 1_000)]), ("u2", vec![conn(NOW - 1_000)])]);
    assert_eq!(lobby.derived_count_at("r1", &live, &[], NOW), 2);
    assert_eq!(lobby.derived_count_at("r1", &snapshot(&[]), &[], NOW + 500), 0);

    let back = snapshot(&[("u1", vec![conn(NOW + 1_500)])]);
    assert_eq!(lobby.derived_count_at("r1", &back, &[], NOW + 2_500), 1);
    // And the hold is gone, not merely bypassed once.
    assert_eq!(lobby.derived_count_at("r1", &back, &[], NOW + 3_000), 1);
}

#[test]
fn brand_new_connection_counts_as_fresh() {
    let lobby = reconciler();
    assert_eq!(lobby.derived_count_at("r1", &snapshot(&[("u1", vec![conn(NOW)])]), &[], NOW), 1);
    assert_eq!(lobby.derived_count_at("r1", &snapshot(&[]), &[], NOW + 1_000), 0);

    // Rejoin shows up as an explicit online write with no heartbeat yet.
    let rejoin = snapshot(&[("u1", vec![ConnRecord { online: Some(true), ts: None }])]);
    assert_eq!(lobby.derived_count_at("r1", &rejoin, &[], NOW + 2_000), 1);
}

#[test]
fn zero_hold_expires_on_its_own() {
    let lobby = reconciler();
    assert_eq!(lobby.derived_count_at("r1", &snapshot(&[("u1", vec![conn(NOW)])]), &[], NOW), 1);
    assert_eq!(lobby.derived_count_at("r1", &snapshot(&[]), &[], NOW + 1_000), 0);

    // Reappearance with an oldish-but-alive heartbeat after the window.
    let after = NOW + 1_000 + 125_001;
    let snap = snapshot(&[("u1", vec![conn(after - 60_000)])]);
    assert_eq!(lobby.derived_count_at("r1", &snap, &[], after), 1);
}

#[test]
fn should_verify_only_for_single_count() {
    let lobby = reconciler();
    assert!(!lobby.should_verify_at("r1", 0, NOW));
    assert!(!lobby.should_verify_at("r1", 2, NOW));
    assert!(lobby.should_verify_at("r1", 1, NOW));
}

#[test]
fn multi_verify_widens_the_gate() {
    let mut cfg = lobby_cfg();
    cfg.multi_verify = true;
    let lobby = LobbyReconciler::new(cfg, liveness());
    assert!(lobby.should_verify_at("r1", 3, NOW));
    assert!(!lobby.should_verify_at("r1", 0, NOW));
}

#[test]
fn verify_gate_respects_backoff_and_stamps_attempt() {
    let lobby = reconciler();
    assert!(lobby.should_verify_at("r1", 1, NOW));
    // Second caller inside the backoff window is refused.
    assert!(!lobby.should_verify_at("r1", 1, NOW + 1));
    assert!(lobby.should_verify_at("r1", 1, NOW + 10_000));
}

#[test]
fn verified_cache_suppresses_repeat_recounts() {
    let lobby = reconciler();
    assert!(lobby.should_verify_at("r1", 1, NOW));
    lobby.record_verified_at("r1", 1, &["u1".into()], NOW);
    assert_eq!(lobby.cached_verified_at("r1", NOW + 1_000), Some(1));
    assert!(!lobby.should_verify_at("r1", 1, NOW + 15_000));
    // Cache expired, backoff elapsed: verification allowed again.
    assert!(lobby.should_verify_at("r1", 1, NOW + 31_000));
}

#[test]
fn verified_zero_quarantines_presence_ghosts() {
    let lobby = reconciler();
    let ghost_snap = snapshot(&[("ghost", vec![conn(NOW - 10_000)])]);
    assert_eq!(lobby.derived_count_at("r1", &ghost_snap, &[], NOW), 1);

    lobby.record_verified_at("r1", 0, &["ghost".into()], NOW);
    assert!(lobby.is_quarantined_at("r1", "ghost", NOW + 1));

    // Quarantine property: still "active" per liveness, still excluded.
    assert_eq!(lobby.derived_count_at("r1", &ghost_snap, &[], NOW + 5_000), 0);
}

#[test]
fn quarantine_lifts_on_fresh_heartbeat() {
    let lobby = reconciler();
    lobby.record_verified_at("r1", 0, &["u1".into()], NOW);
    assert!(lobby.is_quarantined_at("r1", "u1", NOW + 1));

    let fresh = snapshot(&[("u1", vec![conn(NOW + 9_000)])]);
    assert_eq!(lobby.derived_count_at("r1", &fresh, &[], NOW + 10_000), 1);
    assert!(!lobby.is_quarantined_at("r1", "u1", NOW + 10_000));
}

#[test]
fn quarantine_expires_on_its_own() {
    let lobby = reconciler();
    lobby.record_verified_at("r1", 0, &["u1".into()], NOW);
    let after = NOW + 120_001;
    assert!(!lobby.is_quarantined_at("r1", "u1", after));
    let snap = snapshot(&[("u1", vec![conn(after - 1_000)])]);
    assert_eq!(lobby.derived_count_at("r1", &snap, &[], after), 1);
}

#[test]
fn backoff_doubles_on_failure_and_halves_on_success_within_bounds() {
    let lobby = reconciler();
    lobby.record_verify_failure_at("r1", NOW);
    assert_eq!(lobby.backoff_ms("r1", NOW), 20_000);
    for i in 0..10 {
        lobby.record_verify_failure_at("r1", NOW + i);
    }
    assert_eq!(lobby.backoff_ms("r1", NOW), 300_000);

    lobby.record_verified_at("r1", 2, &[], NOW);
    assert_eq!(lobby.backoff_ms("r1", NOW), 150_000);
    for i in 0..10 {
        lobby.record_verified_at("r1", 2, &[], NOW + i);
    }
    assert_eq!(lobby.backoff_ms("r1", NOW), 10_000);
}

#[test]
fn health_clamps_and_gates_verification() {
    let lobby = reconciler();
    lobby.record_verify_failure_at("r1", NOW);
    lobby.record_verify_failure_at("r1", NOW + 1);
    assert!((lobby.health("r1", NOW + 2) - 0.0).abs() < f64::EPSILON);
    // Dead health: verification refused even after the backoff elapses.
    assert!(!lobby.should_verify_at("r1", 1, NOW + 200_000));

    for i in 0..20 {
        lobby.record_verified_at("r1", 1, &[], NOW + i);
    }
    assert!((lobby.health("r1", NOW + 100) - 2.0).abs() < f64::EPSILON);
}

#[test]
fn idle_health_decays_back_to_neutral() {
    let lobby = reconciler();
    lobby.record_verify_failure_at("r1", NOW);
    lobby.record_verify_failure_at("r1", NOW + 1);
    // 5 minutes of silence: the room is forgiven.
    let later = NOW + 1 + 300_000;
    assert!((lobby.health("r1", later) - 1.0).abs() < f64::EPSILON);
    assert!(lobby.should_verify_at("r1", 1, later));
}

#[test]
fn prune_drops_inactive_rooms_and_bounds_the_map() {
    let lobby = reconciler();
    for i in 0..20 {
        let _ = lobby.derived_count_at(&format!("r{i}"), &snapshot(&[]), &[], NOW + i);
    }
    assert_eq!(lobby.tracked_rooms(), 20);

    let active: HashSet<String> = (0..20).map(|i| format!("r{i}")).collect();
    lobby.prune_rooms(&active);
    // Size bound (8) enforced by evicting least recently touched.
    assert_eq!(lobby.tracked_rooms(), 8);

    let only_two: HashSet<String> = ["r18".to_string(), "r19".to_string()].into_iter().collect();
    lobby.prune_rooms(&only_two);
    assert_eq!(lobby.tracked_rooms(), 2);
}

#[test]
fn derived_count_never_counts_quarantined_even_multi_conn() {
    let lobby = reconciler();
    lobby.record_verified_at("r1", 0, &["u1".into()], NOW);
    let snap = snapshot(&[(
        "u1",
        vec![conn(NOW - 30_000), conn(NOW - 60_000)],
    )]);
    assert_eq!(lobby.derived_count_at("r1", &snap, &[], NOW + 1_000), 0);
}
