//! Progress reconciliation
//!
//! Merges live location checks seen over the websocket with the server's
//! save file and (optionally) the multidata layout, to answer completion and
//! hint questions per slot.
//!
//! ## Sources
//!
//! | Source | Provides |
//! |--------|----------|
//! | Live progress | Checks observed this session (never removes) |
//! | Save snapshot | Checked sets, hint usage, hints, sometimes totals |
//! | Multidata | Location totals per slot, roster names |
//!
//! Only team 0 is consulted.

pub mod display;

use crate::config::ServerConfig;
use crate::savefile::{self, Multidata, Snapshot};
use crate::types::{LiveProgress, LocationId, PlayerSlot, SlotId, TeamId};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Minimum cost of one hint, in checks.
pub const MIN_HINT_COST: i64 = 10;

/// Share of a slot's locations one hint costs, in percent.
pub const HINT_COST_PERCENT: i64 = 5;

/// Completion of one slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayerProgress {
    pub slot: SlotId,
    pub checked: usize,
    /// 0 when no source knows the slot's location count
    pub total: usize,
    pub percentage: Option<f64>,
}

impl PlayerProgress {
    pub fn new(slot: SlotId, checked: usize, total: usize) -> Self {
        let percentage = if total > 0 {
            Some(checked as f64 / total as f64 * 100.0)
        } else {
            None
        };
        Self {
            slot,
            checked,
            total,
            percentage,
        }
    }

    /// 100% or more, unrounded.
    pub fn is_complete(&self) -> bool {
        self.percentage.is_some_and(|p| p >= 100.0)
    }
}

/// Where a hint cost figure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HintCostBasis {
    /// Share of the slot's location total
    LocationTotal,
    /// Flat cost growing with hints already taken (total unknown)
    HintCount,
}

/// Hint economics of one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HintEconomics {
    pub slot: SlotId,
    pub checked: usize,
    pub hints_used: i64,
    pub cost: i64,
    pub basis: HintCostBasis,
    /// Never negative
    pub points: i64,
}

impl HintEconomics {
    /// Hints affordable right now.
    pub fn affordable(&self) -> i64 {
        if self.cost > 0 {
            self.points / self.cost
        } else {
            0
        }
    }
}

/// Reasons not to trust a progress report blindly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressWarning {
    /// Live roster and save file share no slot
    Mismatch {
        live: BTreeSet<SlotId>,
        snapshot: BTreeSet<SlotId>,
    },
    /// Save file untouched for a long time with nobody connected
    Stale { age_hours: i64 },
}

/// `max(10, floor(total * 5%))`.
pub fn hint_cost(total: usize) -> i64 {
    let total = i64::try_from(total).unwrap_or(i64::MAX);
    (total.saturating_mul(HINT_COST_PERCENT) / 100).max(MIN_HINT_COST)
}

/// Cost used when the location total is unknown: `10 + 10 * hints taken`.
pub fn fallback_hint_cost(existing_hints: usize) -> i64 {
    let existing = i64::try_from(existing_hints).unwrap_or(i64::MAX);
    MIN_HINT_COST.saturating_add(MIN_HINT_COST.saturating_mul(existing))
}

/// Warn when the live roster and the save file have no slot in common.
pub fn detect_mismatch(
    live: &BTreeSet<SlotId>,
    snapshot: &BTreeSet<SlotId>,
) -> Option<ProgressWarning> {
    if live.is_empty() || snapshot.is_empty() || !live.is_disjoint(snapshot) {
        return None;
    }
    Some(ProgressWarning::Mismatch {
        live: live.clone(),
        snapshot: snapshot.clone(),
    })
}

/// Warn when nobody is connected and the save file is older than `stale_after`.
pub fn detect_staleness(
    modified: DateTime<Utc>,
    now: DateTime<Utc>,
    connected: bool,
    stale_after: Duration,
) -> Option<ProgressWarning> {
    let age = now.signed_duration_since(modified);
    if connected || age <= stale_after {
        return None;
    }
    Some(ProgressWarning::Stale {
        age_hours: age.num_hours(),
    })
}

/// Reconciles the three progress sources for one team.
#[derive(Debug, Clone, Default)]
pub struct ProgressEngine {
    team: TeamId,
    snapshot: Option<Snapshot>,
    multidata: Option<Multidata>,
    live: LiveProgress,
}

impl ProgressEngine {
    pub fn new(team: TeamId) -> Self {
        Self {
            team,
            ..Default::default()
        }
    }

    pub fn with_snapshot(mut self, snapshot: Snapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn with_multidata(mut self, multidata: Multidata) -> Self {
        self.multidata = Some(multidata);
        self
    }

    pub fn with_live(mut self, live: LiveProgress) -> Self {
        self.live = live;
        self
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    pub fn multidata(&self) -> Option<&Multidata> {
        self.multidata.as_ref()
    }

    pub fn live(&self) -> &LiveProgress {
        &self.live
    }

    /// Union of live and saved checks for a slot.
    pub fn merged_checks(&self, slot: SlotId) -> BTreeSet<LocationId> {
        let mut checked = self.live.checked(slot);
        if let Some(snapshot) = &self.snapshot {
            checked.extend(snapshot.checked(self.team, slot));
        }
        checked
    }

    /// Snapshot total, then multidata total, then 0.
    pub fn total_locations(&self, slot: SlotId) -> usize {
        self.snapshot
            .as_ref()
            .and_then(|s| s.total_locations(slot))
            .or_else(|| self.multidata.as_ref().and_then(|m| m.total_locations(slot)))
            .unwrap_or(0)
    }

    pub fn compute_player_progress(&self, slot: SlotId) -> PlayerProgress {
        PlayerProgress::new(
            slot,
            self.merged_checks(slot).len(),
            self.total_locations(slot),
        )
    }

    pub fn hint_economics(&self, slot: SlotId) -> HintEconomics {
        let checked = self.merged_checks(slot).len();
        let total = self.total_locations(slot);
        let (hints_used, existing) = self
            .snapshot
            .as_ref()
            .map(|s| (s.hints_used(self.team, slot), s.hint_count(self.team, slot)))
            .unwrap_or((0, 0));

        let (cost, basis) = if total > 0 {
            (hint_cost(total), HintCostBasis::LocationTotal)
        } else {
            (fallback_hint_cost(existing), HintCostBasis::HintCount)
        };
        let checked_i64 = i64::try_from(checked).unwrap_or(i64::MAX);
        let points = checked_i64
            .saturating_sub(hints_used.saturating_mul(cost))
            .max(0);

        HintEconomics {
            slot,
            checked,
            hints_used,
            cost,
            basis,
            points,
        }
    }

    pub fn get_hint_points(&self, slot: SlotId) -> i64 {
        self.hint_economics(slot).points
    }

    /// Every slot any source knows about.
    pub fn slots(&self) -> BTreeSet<SlotId> {
        let mut slots: BTreeSet<SlotId> = self.live.slots().collect();
        if let Some(snapshot) = &self.snapshot {
            slots.extend(snapshot.slots(self.team));
            slots.extend(snapshot.totals.keys().copied());
        }
        if let Some(multidata) = &self.multidata {
            slots.extend(multidata.totals.keys().copied());
            slots.extend(multidata.slots.keys().copied());
        }
        slots
    }

    /// Progress for every known slot, ordered by slot.
    pub fn all_progress(&self) -> Vec<PlayerProgress> {
        self.slots()
            .into_iter()
            .map(|slot| self.compute_player_progress(slot))
            .collect()
    }

    /// Compare a live roster with the slots recorded in the save file.
    pub fn mismatch(&self, live_roster: &BTreeSet<SlotId>) -> Option<ProgressWarning> {
        let snapshot_slots = self.snapshot.as_ref()?.slots(self.team);
        detect_mismatch(live_roster, &snapshot_slots)
    }

    /// Roster from the multidata file, when it was loaded.
    pub fn roster(&self) -> BTreeMap<SlotId, PlayerSlot> {
        self.multidata
            .as_ref()
            .map(|m| m.slots.clone())
            .unwrap_or_default()
    }
}

/// Files a progress query reads. Loaded fresh for every query since the
/// game server rewrites its save file while running.
#[derive(Debug, Clone, Default)]
pub struct ProgressSources {
    pub team: TeamId,
    pub save_file: Option<PathBuf>,
    pub multidata_file: Option<PathBuf>,
}

impl ProgressSources {
    /// Sources configured (or discovered) for a server.
    pub fn for_server(server: &ServerConfig, team: TeamId) -> Self {
        Self {
            team,
            save_file: server.resolve_save_file(),
            multidata_file: server.resolve_multidata_file(),
        }
    }

    /// Build an engine from disk plus live checks.
    ///
    /// Unreadable or corrupt files are logged and treated as absent.
    pub fn load(&self, live: LiveProgress) -> ProgressEngine {
        let mut engine = ProgressEngine::new(self.team).with_live(live);
        if let Some(path) = &self.save_file {
            match savefile::load_snapshot(path) {
                Ok(snapshot) => engine = engine.with_snapshot(snapshot),
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "No usable save file")
                }
            }
        }
        if let Some(path) = &self.multidata_file {
            match savefile::load_multidata(path) {
                Ok(multidata) => engine = engine.with_multidata(multidata),
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "No usable multidata file")
                }
            }
        }
        engine
    }

    /// Mismatch and staleness warnings for a loaded engine.
    pub fn warnings(
        &self,
        engine: &ProgressEngine,
        live_roster: &BTreeSet<SlotId>,
        connected: bool,
        stale_after: Duration,
        now: DateTime<Utc>,
    ) -> Vec<ProgressWarning> {
        let mut warnings = Vec::new();
        if let Some(mismatch) = engine.mismatch(live_roster) {
            warnings.push(mismatch);
        }
        let modified = self
            .save_file
            .as_deref()
            .filter(|_| engine.snapshot().is_some())
            .and_then(savefile::modified_at);
        if let Some(stale) =
            modified.and_then(|m| detect_staleness(m, now, connected, stale_after))
        {
            warnings.push(stale);
        }
        warnings
    }
}

/// Answers "has this slot already finished?" for item announcements.
pub trait CompletionOracle: Send + Sync {
    fn is_complete(&self, slot: SlotId) -> bool;

    /// Slots the save file records, or `None` without a readable save file.
    fn saved_slots(&self) -> Option<BTreeSet<SlotId>> {
        None
    }
}

/// Never considers a slot complete.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCompletion;

impl CompletionOracle for NoCompletion {
    fn is_complete(&self, _slot: SlotId) -> bool {
        false
    }
}

/// Reads the save file (and multidata) fresh on every question.
#[derive(Debug, Clone)]
pub struct SaveFileCompletion {
    pub team: TeamId,
    pub save_file: PathBuf,
    pub multidata_file: Option<PathBuf>,
}

impl SaveFileCompletion {
    fn sources(&self) -> ProgressSources {
        ProgressSources {
            team: self.team,
            save_file: Some(self.save_file.clone()),
            multidata_file: self.multidata_file.clone(),
        }
    }
}

impl CompletionOracle for SaveFileCompletion {
    fn is_complete(&self, slot: SlotId) -> bool {
        self.sources()
            .load(LiveProgress::new())
            .compute_player_progress(slot)
            .is_complete()
    }

    fn saved_slots(&self) -> Option<BTreeSet<SlotId>> {
        let engine = self.sources().load(LiveProgress::new());
        engine.snapshot().map(|s| s.slots(self.team))
    }
}
