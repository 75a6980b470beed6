//! Text rendering of progress reports.

use super::{HintCostBasis, HintEconomics, PlayerProgress, ProgressEngine, ProgressWarning};
use crate::format::format_percentage;
use crate::hints::HintRecord;
use crate::types::{NotificationKind, PlayerSlot, SlotId};
use std::collections::BTreeMap;

/// Display name of a slot, or `Player {id}`.
pub fn player_name(roster: &BTreeMap<SlotId, PlayerSlot>, slot: SlotId) -> String {
    roster
        .get(&slot)
        .map(|p| p.name.clone())
        .unwrap_or_else(|| format!("Player {}", slot))
}

/// `Name (Game): 12/200 (6.0%)`, or a no-data line when the total is unknown.
pub fn player_line(player: Option<&PlayerSlot>, progress: &PlayerProgress) -> String {
    let name = player
        .map(|p| p.name.clone())
        .unwrap_or_else(|| format!("Player {}", progress.slot));
    if progress.total == 0 {
        return format!("{}: no location data available", name);
    }
    let label = match player {
        Some(p) if !p.game.is_empty() => format!("{} ({})", name, p.game),
        _ => name,
    };
    let mark = if progress.is_complete() { " ✅" } else { "" };
    format!(
        "{}: {}/{} ({}){}",
        label,
        progress.checked,
        progress.total,
        format_percentage(progress.percentage),
        mark
    )
}

/// One-line roll-up across several slots.
pub fn summary(progress: &[PlayerProgress]) -> String {
    let known: Vec<&PlayerProgress> = progress.iter().filter(|p| p.total > 0).collect();
    if known.is_empty() {
        return "No location data available".to_string();
    }
    let checked: usize = known.iter().map(|p| p.checked).sum();
    let total: usize = known.iter().map(|p| p.total).sum();
    let complete = known.iter().filter(|p| p.is_complete()).count();
    let overall = PlayerProgress::new(0, checked, total);
    format!(
        "Overall: {}/{} ({}), {}/{} players complete",
        checked,
        total,
        format_percentage(overall.percentage),
        complete,
        known.len()
    )
}

/// Hint points, cost and how the cost was derived.
pub fn hint_lines(name: &str, economics: &HintEconomics) -> Vec<String> {
    let basis = match economics.basis {
        HintCostBasis::LocationTotal => "5% of locations",
        HintCostBasis::HintCount => "location total unknown, flat rate",
    };
    vec![
        format!(
            "{}: {} hint points ({} checks, {} hints used)",
            name, economics.points, economics.checked, economics.hints_used
        ),
        format!(
            "Hint cost: {} ({}), {} affordable now",
            economics.cost,
            basis,
            economics.affordable()
        ),
    ]
}

/// `Finder's Location holds Receiver's Item`, with status.
pub fn hint_record_line(
    roster: &BTreeMap<SlotId, PlayerSlot>,
    hint: &HintRecord,
    item_name: &str,
    location_name: &str,
) -> String {
    let found = if hint.found { "found" } else { "not found" };
    let mut line = format!(
        "{}'s {} is at {}'s {} ({}, {})",
        player_name(roster, hint.receiving_player),
        item_name,
        player_name(roster, hint.finding_player),
        location_name,
        found,
        hint.status
    );
    if !hint.entrance.is_empty() {
        line.push_str(&format!(" via {}", hint.entrance));
    }
    line
}

/// Warning text without the marker, as carried by a notification.
pub fn warning_text(warning: &ProgressWarning) -> String {
    match warning {
        ProgressWarning::Mismatch { live, snapshot } => format!(
            "Save file does not match the live server (live slots {:?}, saved slots {:?}); it may belong to another game",
            live, snapshot
        ),
        ProgressWarning::Stale { age_hours } => format!(
            "Save file is {}h old and no server is connected; progress may be out of date",
            age_hours
        ),
    }
}

pub fn warning_line(warning: &ProgressWarning) -> String {
    format!(
        "{} {}",
        NotificationKind::Warning.marker(),
        warning_text(warning)
    )
}

/// Full report: warnings, one line per slot, then the summary.
pub fn render_report(
    engine: &ProgressEngine,
    roster: &BTreeMap<SlotId, PlayerSlot>,
    slots: &[SlotId],
    warnings: &[ProgressWarning],
) -> Vec<String> {
    let mut lines: Vec<String> = warnings.iter().map(warning_line).collect();
    let progress: Vec<PlayerProgress> = slots
        .iter()
        .map(|slot| engine.compute_player_progress(*slot))
        .collect();
    lines.extend(
        progress
            .iter()
            .map(|p| player_line(roster.get(&p.slot), p)),
    );
    if progress.len() > 1 {
        lines.push(summary(&progress));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SlotKind;
    use std::collections::BTreeSet;

    fn alice() -> PlayerSlot {
        PlayerSlot {
            id: 1,
            name: "Alice".to_string(),
            game: "Factorio".to_string(),
            kind: SlotKind::Player,
        }
    }

    #[test]
    fn test_player_line_formats() {
        let slot = alice();
        assert_eq!(
            player_line(Some(&slot), &PlayerProgress::new(1, 12, 200)),
            "Alice (Factorio): 12/200 (6.0%)"
        );
        assert_eq!(
            player_line(Some(&slot), &PlayerProgress::new(1, 12, 0)),
            "Alice: no location data available"
        );
        assert_eq!(
            player_line(None, &PlayerProgress::new(4, 5, 5)),
            "Player 4: 5/5 (100.0%) ✅"
        );
    }

    #[test]
    fn test_summary_skips_unknown_totals() {
        let lines = summary(&[
            PlayerProgress::new(1, 10, 10),
            PlayerProgress::new(2, 5, 30),
            PlayerProgress::new(3, 7, 0),
        ]);
        assert_eq!(lines, "Overall: 15/40 (37.5%), 1/2 players complete");
        assert_eq!(summary(&[]), "No location data available");
    }

    #[test]
    fn test_warning_lines_carry_marker() {
        let stale = warning_line(&ProgressWarning::Stale { age_hours: 30 });
        assert!(stale.starts_with("⚠️"));
        assert!(stale.contains("30h"));

        let mismatch = warning_line(&ProgressWarning::Mismatch {
            live: BTreeSet::from([1]),
            snapshot: BTreeSet::from([9]),
        });
        assert!(mismatch.contains("another game"));
    }

    #[test]
    fn test_player_name_placeholder() {
        let roster = BTreeMap::from([(1, alice())]);
        assert_eq!(player_name(&roster, 1), "Alice");
        assert_eq!(player_name(&roster, 2), "Player 2");
    }
}
