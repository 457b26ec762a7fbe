use super::*;

const NOW: i64 = 1_700_000_000_000;

fn cfg() -> LivenessConfig {
    LivenessConfig { heartbeat_ms: 20_000, stale_threshold_ms: 120_000, max_clock_skew_ms: 30_000 }
}

#[test]
fn explicit_offline_is_never_active() {
    let conn = ConnRecord { online: Some(false), ts: Some(NOW) };
    assert!(!is_active(&conn, NOW, &cfg()));
}

#[test]
fn online_without_heartbeat_is_active() {
    // Just connected; heartbeat not yet written.
    let conn = ConnRecord { online: Some(true), ts: None };
    assert!(is_active(&conn, NOW, &cfg()));
}

#[test]
fn no_flag_and_no_heartbeat_is_inactive() {
    assert!(!is_active(&ConnRecord::default(), NOW, &cfg()));
}

#[test]
fn fresh_heartbeat_is_active() {
    let conn = ConnRecord { online: None, ts: Some(NOW - 1_000) };
    assert!(is_active(&conn, NOW, &cfg()));
}

#[test]
fn stale_heartbeat_is_inactive() {
    let conn = ConnRecord { online: None, ts: Some(NOW - 120_001) };
    assert!(!is_active(&conn, NOW, &cfg()));
}

#[test]
fn heartbeat_exactly_at_threshold_is_active() {
    let conn = ConnRecord { online: None, ts: Some(NOW - 120_000) };
    assert!(is_active(&conn, NOW, &cfg()));
}

#[test]
fn zero_or_negative_timestamp_is_inactive() {
    assert!(!is_active(&ConnRecord { online: None, ts: Some(0) }, NOW, &cfg()));
    assert!(!is_active(&ConnRecord { online: None, ts: Some(-5) }, NOW, &cfg()));
}

#[test]
fn future_timestamp_within_skew_is_active() {
    let conn = ConnRecord { online: None, ts: Some(NOW + 29_000) };
    assert!(is_active(&conn, NOW, &cfg()));
}

#[test]
fn future_timestamp_beyond_skew_is_inactive() {
    let conn = ConnRecord { online: None, ts: Some(NOW + 30_001) };
    assert!(!is_active(&conn, NOW, &cfg()));
}

#[test]
fn online_flag_does_not_rescue_stale_heartbeat() {
    // Once a heartbeat exists, it wins over the connect-time flag.
    let conn = ConnRecord { online: Some(true), ts: Some(NOW - 500_000) };
    assert!(!is_active(&conn, NOW, &cfg()));
}

#[test]
fn activity_is_monotonic_in_time() {
    // Active at T, no new write: there is a T' where it goes inactive and
    // stays inactive.
    let conn = ConnRecord { online: None, ts: Some(NOW) };
    assert!(is_active(&conn, NOW, &cfg()));
    let expiry = NOW + 120_001;
    assert!(!is_active(&conn, expiry, &cfg()));
    assert!(!is_active(&conn, expiry + 1_000_000, &cfg()));
}

#[test]
fn user_present_with_one_fresh_among_stale_duplicates() {
    // One stale connection (10x threshold old) plus one fresh
    // connection: the user is present.
    let stale = ConnRecord { online: None, ts: Some(NOW - 1_200_000) };
    let fresh = ConnRecord { online: None, ts: Some(NOW - 1_000) };
    assert!(user_present([stale, fresh].iter(), NOW, &cfg()));
}

#[test]
fn user_present_false_when_all_connections_stale() {
    let a = ConnRecord { online: None, ts: Some(NOW - 300_000) };
    let b = ConnRecord { online: Some(false), ts: Some(NOW) };
    assert!(!user_present([a, b].iter(), NOW, &cfg()));
}

#[test]
fn user_present_empty_is_false() {
    assert!(!user_present(std::iter::empty(), NOW, &cfg()));
}
