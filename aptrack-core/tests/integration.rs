//! Integration tests for save file decoding and progress reconciliation
//!
//! These tests use real pickled files in `tests/fixtures/` produced by the
//! game server's own serializer: a two-player save (`two_players.apsave`)
//! and the matching seed layout (`two_players.archipelago`).
//!
//! | Slot | Name  | Game          | Locations | Saved checks | Hints used | State  |
//! |------|-------|---------------|-----------|--------------|------------|--------|
//! | 1    | Alice | Factorio      | 20        | 15           | 1          | playing|
//! | 2    | Bob   | Hollow Knight | 12        | 12           | 0          | goal   |

use aptrack_core::hints::HintStatus;
use aptrack_core::progress::display;
use aptrack_core::progress::{CompletionOracle, HintCostBasis, ProgressWarning, SaveFileCompletion};
use aptrack_core::savefile::{self, StrictResolver, MULTIDATA_EXTENSION, SAVE_EXTENSION};
use aptrack_core::{Error, LiveProgress, ProgressSources};
use chrono::{Duration, Utc};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tempfile::TempDir;

/// Get the path to a fixture file
fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn sources() -> ProgressSources {
    ProgressSources {
        team: 0,
        save_file: Some(fixture_path("two_players.apsave")),
        multidata_file: Some(fixture_path("two_players.archipelago")),
    }
}

// ============================================
// Decoding
// ============================================

#[test]
fn test_decode_save_fixture() {
    let snapshot = savefile::load_snapshot(&fixture_path("two_players.apsave"))
        .expect("save fixture should decode");

    assert_eq!(snapshot.checked(0, 1).len(), 15);
    assert_eq!(snapshot.checked(0, 2).len(), 12);
    assert!(snapshot.checked(0, 1).contains(&1000));
    assert!(!snapshot.checked(0, 1).contains(&1015));
    assert_eq!(snapshot.hints_used(0, 1), 1);
    assert_eq!(snapshot.hints_used(0, 2), 0);
    assert_eq!(snapshot.slots(0), BTreeSet::from([1, 2]));
    assert!(snapshot.slots(1).is_empty());

    assert!(snapshot.has_goaled(0, 2));
    assert!(!snapshot.has_goaled(0, 1));
}

#[test]
fn test_decode_hint_objects() {
    let snapshot = savefile::load_snapshot(&fixture_path("two_players.apsave")).unwrap();

    // The same hint is filed under both players.
    let alice = snapshot.hints_for(0, 1);
    let bob = snapshot.hints_for(0, 2);
    assert_eq!(alice.len(), 1);
    assert_eq!(alice, bob);

    let hint = &alice[0];
    assert_eq!(hint.receiving_player, 1);
    assert_eq!(hint.finding_player, 2);
    assert_eq!(hint.location, 2003);
    assert_eq!(hint.item, 500);
    assert!(!hint.found);
    assert!(hint.entrance.is_empty());
    assert!(hint.item_flags.is_progression());
    assert_eq!(hint.status, HintStatus::Priority);

    // Only the receiver paid for it.
    assert_eq!(snapshot.hint_count(0, 1), 1);
    assert_eq!(snapshot.hint_count(0, 2), 0);
}

#[test]
fn test_strict_resolver_rejects_server_types() {
    let bytes = std::fs::read(fixture_path("two_players.apsave")).unwrap();
    let err = savefile::decode(&bytes, &StrictResolver).unwrap_err();
    assert!(matches!(err, Error::CorruptSnapshot(_)));
}

#[test]
fn test_decode_multidata_fixture() {
    let multidata = savefile::load_multidata(&fixture_path("two_players.archipelago"))
        .expect("multidata fixture should decode");

    assert_eq!(multidata.total_locations(1), Some(20));
    assert_eq!(multidata.total_locations(2), Some(12));
    assert_eq!(multidata.total_locations(3), None);

    let alice = &multidata.slots[&1];
    assert_eq!(alice.name, "Alice");
    assert_eq!(alice.game, "Factorio");
    assert_eq!(multidata.slots[&2].name, "Bob");

    assert_eq!(multidata.catalog.item_name("Factorio", 500), "Automation");
    assert_eq!(
        multidata.catalog.location_name("Hollow Knight", 2003),
        "Crossroads Geo Rock"
    );
    assert_eq!(multidata.catalog.item_name("Factorio", 999), "Item 999");
}

#[test]
fn test_truncated_save_is_corrupt() {
    let bytes = std::fs::read(fixture_path("two_players.apsave")).unwrap();
    let truncated = &bytes[..bytes.len() / 2];
    assert!(matches!(
        savefile::parse_snapshot(truncated),
        Err(Error::CorruptSnapshot(_))
    ));
}

// ============================================
// Progress
// ============================================

#[test]
fn test_progress_from_files() {
    let engine = sources().load(LiveProgress::new());

    assert_eq!(engine.slots(), BTreeSet::from([1, 2]));

    let alice = engine.compute_player_progress(1);
    assert_eq!((alice.checked, alice.total), (15, 20));
    assert_eq!(alice.percentage, Some(75.0));
    assert!(!alice.is_complete());

    let bob = engine.compute_player_progress(2);
    assert_eq!((bob.checked, bob.total), (12, 12));
    assert!(bob.is_complete());
}

#[test]
fn test_live_checks_add_to_saved_checks() {
    let mut live = LiveProgress::new();
    // One new check and one the save already has.
    live.record(1, 1019);
    live.record(1, 1000);

    let engine = sources().load(live);
    let alice = engine.compute_player_progress(1);
    assert_eq!((alice.checked, alice.total), (16, 20));
    assert_eq!(alice.percentage, Some(80.0));
}

#[test]
fn test_hint_economics_from_files() {
    let engine = sources().load(LiveProgress::new());

    let alice = engine.hint_economics(1);
    assert_eq!(alice.basis, HintCostBasis::LocationTotal);
    assert_eq!(alice.cost, 10);
    assert_eq!(alice.points, 5);
    assert_eq!(alice.affordable(), 0);

    let bob = engine.hint_economics(2);
    assert_eq!(bob.points, 12);
    assert_eq!(bob.affordable(), 1);
}

#[test]
fn test_hint_economics_without_multidata_uses_flat_cost() {
    let sources = ProgressSources {
        multidata_file: None,
        ..sources()
    };
    let engine = sources.load(LiveProgress::new());

    let alice = engine.hint_economics(1);
    assert_eq!(alice.basis, HintCostBasis::HintCount);
    // 10 + 10 per hint already taken
    assert_eq!(alice.cost, 20);
    assert_eq!(alice.points, 0);

    assert_eq!(engine.compute_player_progress(1).total, 0);
}

#[test]
fn test_rendered_report() {
    let engine = sources().load(LiveProgress::new());
    let roster = engine.roster();
    let slots: Vec<i64> = engine.slots().into_iter().collect();

    let lines = display::render_report(&engine, &roster, &slots, &[]);
    assert_eq!(
        lines,
        vec![
            "Alice (Factorio): 15/20 (75.0%)".to_string(),
            "Bob (Hollow Knight): 12/12 (100.0%) ✅".to_string(),
            "Overall: 27/32 (84.4%), 1/2 players complete".to_string(),
        ]
    );
}

#[test]
fn test_mismatched_live_roster_warns() {
    let sources = sources();
    let engine = sources.load(LiveProgress::new());

    let warnings = sources.warnings(
        &engine,
        &BTreeSet::from([7, 8]),
        true,
        Duration::hours(24),
        Utc::now(),
    );
    assert!(matches!(
        warnings.as_slice(),
        [ProgressWarning::Mismatch { .. }]
    ));

    let overlapping = sources.warnings(
        &engine,
        &BTreeSet::from([2, 9]),
        true,
        Duration::hours(24),
        Utc::now(),
    );
    assert!(overlapping.is_empty());
}

#[test]
fn test_unattended_save_is_stale() {
    let sources = sources();
    let engine = sources.load(LiveProgress::new());
    let much_later = Utc::now() + Duration::days(30);

    let warnings = sources.warnings(
        &engine,
        &BTreeSet::new(),
        false,
        Duration::hours(24),
        much_later,
    );
    assert!(matches!(
        warnings.as_slice(),
        [ProgressWarning::Stale { age_hours }] if *age_hours >= 24 * 30
    ));

    // Nobody looks stale while a server is connected.
    let connected = sources.warnings(
        &engine,
        &BTreeSet::new(),
        true,
        Duration::hours(24),
        much_later,
    );
    assert!(connected.is_empty());
}

#[test]
fn test_save_file_completion() {
    let oracle = SaveFileCompletion {
        team: 0,
        save_file: fixture_path("two_players.apsave"),
        multidata_file: Some(fixture_path("two_players.archipelago")),
    };
    assert!(oracle.is_complete(2));
    assert!(!oracle.is_complete(1));
    assert!(!oracle.is_complete(42));
}

// ============================================
// Discovery
// ============================================

#[test]
fn test_find_latest_in_server_directory() {
    let dir = TempDir::new().unwrap();
    std::fs::copy(
        fixture_path("two_players.apsave"),
        dir.path().join("AP_12345.apsave"),
    )
    .unwrap();
    std::fs::copy(
        fixture_path("two_players.archipelago"),
        dir.path().join("AP_12345.archipelago"),
    )
    .unwrap();

    let save = savefile::find_latest(dir.path(), SAVE_EXTENSION).unwrap();
    let multidata = savefile::find_latest(dir.path(), MULTIDATA_EXTENSION).unwrap();
    assert_eq!(save.file_name().unwrap(), "AP_12345.apsave");

    let engine = ProgressSources {
        team: 0,
        save_file: Some(save),
        multidata_file: Some(multidata),
    }
    .load(LiveProgress::new());
    assert_eq!(engine.compute_player_progress(1).checked, 15);
}
