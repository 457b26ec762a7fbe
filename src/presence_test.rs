use super::*;

const NOW: i64 = 1_700_000_000_000;

fn cfg() -> LivenessConfig {
    LivenessConfig { heartbeat_ms: 20_000, stale_threshold_ms: 120_000, max_clock_skew_ms: 30_000 }
}

#[test]
fn connect_makes_user_present_before_first_beat() {
    let registry = PresenceRegistry::new();
    let conn = Uuid::new_v4();
    registry.connect("r1", "u1", conn);
    assert!(registry.user_present("r1", "u1", NOW, &cfg()));
    assert_eq!(registry.present_uids("r1", NOW, &cfg()), vec!["u1".to_string()]);
}

#[test]
fn beat_then_staleness_expires_presence() {
    let registry = PresenceRegistry::new();
    let conn = Uuid::new_v4();
    registry.beat("r1", "u1", conn, NOW);
    assert!(registry.user_present("r1", "u1", NOW + 1_000, &cfg()));
    assert!(!registry.user_present("r1", "u1", NOW + 120_001, &cfg()));
}

#[test]
fn multiple_tabs_one_fresh_keeps_user_present() {
    let registry = PresenceRegistry::new();
    registry.beat("r1", "u1", Uuid::new_v4(), NOW - 1_200_000);
    registry.beat("r1", "u1", Uuid::new_v4(), NOW - 1_000);
    assert!(registry.user_present("r1", "u1", NOW, &cfg()));
}

#[test]
fn disconnect_removes_record_and_empties_room() {
    let registry = PresenceRegistry::new();
    let conn = Uuid::new_v4();
    registry.connect("r1", "u1", conn);
    registry.disconnect("r1", "u1", conn);
    assert!(!registry.user_present("r1", "u1", NOW, &cfg()));
    assert!(registry.room_ids().is_empty());
    assert_eq!(registry.connection_count(), 0);
}

#[test]
fn mark_offline_kills_presence_without_removing_record() {
    let registry = PresenceRegistry::new();
    let conn = Uuid::new_v4();
    registry.beat("r1", "u1", conn, NOW);
    registry.mark_offline("r1", "u1", conn);
    assert!(!registry.user_present("r1", "u1", NOW, &cfg()));
    assert_eq!(registry.connection_count(), 1);
}

#[test]
fn present_uids_is_sorted_and_liveness_filtered() {
    let registry = PresenceRegistry::new();
    registry.beat("r1", "zed", Uuid::new_v4(), NOW);
    registry.beat("r1", "amy", Uuid::new_v4(), NOW);
    registry.beat("r1", "ghost", Uuid::new_v4(), NOW - 500_000);
    assert_eq!(
        registry.present_uids("r1", NOW, &cfg()),
        vec!["amy".to_string(), "zed".to_string()]
    );
}

#[test]
fn sweep_removes_stale_records_and_respects_limit() {
    let registry = PresenceRegistry::new();
    for i in 0..5 {
        registry.beat("r1", &format!("u{i}"), Uuid::new_v4(), NOW - 500_000);
    }
    registry.beat("r1", "fresh", Uuid::new_v4(), NOW);

    let removed = registry.sweep_stale(NOW, &cfg(), 3);
    assert_eq!(removed, 3);
    let removed = registry.sweep_stale(NOW, &cfg(), 10);
    assert_eq!(removed, 2);
    // Idempotent: nothing left to remove.
    assert_eq!(registry.sweep_stale(NOW, &cfg(), 10), 0);
    assert!(registry.user_present("r1", "fresh", NOW, &cfg()));
    assert_eq!(registry.connection_count(), 1);
}

#[test]
fn sweep_spares_connected_but_beatless_records() {
    let registry = PresenceRegistry::new();
    registry.connect("r1", "u1", Uuid::new_v4());
    assert_eq!(registry.sweep_stale(NOW, &cfg(), 10), 0);
    assert!(registry.user_present("r1", "u1", NOW, &cfg()));
}

#[test]
fn remove_room_drops_all_records() {
    let registry = PresenceRegistry::new();
    registry.beat("r1", "u1", Uuid::new_v4(), NOW);
    registry.beat("r2", "u2", Uuid::new_v4(), NOW);
    registry.remove_room("r1");
    assert_eq!(registry.room_ids(), vec!["r2".to_string()]);
}

#[tokio::test]
async fn change_feed_notifies_on_writes() {
    let registry = PresenceRegistry::new();
    let mut rx = registry.subscribe();
    registry.beat("r1", "u1", Uuid::new_v4(), NOW);
    let event = rx.recv().await.expect("event");
    assert_eq!(event.room_id, "r1");
}

#[test]
fn last_writer_wins_per_connection() {
    let registry = PresenceRegistry::new();
    let conn = Uuid::new_v4();
    registry.beat("r1", "u1", conn, NOW - 60_000);
    registry.beat("r1", "u1", conn, NOW - 1_000);
    let snapshot = registry.snapshot_room("r1");
    assert_eq!(snapshot["u1"].len(), 1);
    assert_eq!(snapshot["u1"][0].ts, Some(NOW - 1_000));
}
