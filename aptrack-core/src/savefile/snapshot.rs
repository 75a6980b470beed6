//! Structured views over decoded save and multidata graphs.
//!
//! Every field is optional: a missing or oddly shaped entry degrades to an
//! empty set / zero rather than failing the load.

use super::value::Value;
use crate::catalog::{Catalog, GameCatalog};
use crate::hints::{self, HintRecord};
use crate::types::{LocationId, PlayerSlot, SlotId, SlotKind, TeamId};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// `client_game_state` value of a slot that reached its goal.
pub const CLIENT_GOAL: i64 = 30;

/// Server save file contents relevant to progress tracking.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub location_checks: HashMap<(TeamId, SlotId), BTreeSet<LocationId>>,
    pub hints_used: HashMap<(TeamId, SlotId), i64>,
    pub hints: HashMap<(TeamId, SlotId), Vec<HintRecord>>,
    pub client_game_state: HashMap<(TeamId, SlotId), i64>,
    /// Per-slot location totals, when the save embeds world data
    pub totals: HashMap<SlotId, usize>,
}

impl Snapshot {
    /// Extract the known fields from a decoded save graph.
    pub fn from_value(root: &Value) -> Self {
        if root.as_dict().is_none() && root.as_object().is_none() {
            tracing::warn!("Save file root is not a mapping; treating as empty");
            return Self::default();
        }

        let mut snapshot = Self::default();

        if let Some(checks) = root.get("location_checks") {
            for (key, value) in team_slot_entries(checks) {
                let locations = value
                    .as_seq()
                    .map(|items| items.iter().filter_map(Value::as_i64).collect())
                    .unwrap_or_default();
                snapshot.location_checks.insert(key, locations);
            }
        }

        if let Some(used) = root.get("hints_used") {
            for (key, value) in team_slot_entries(used) {
                snapshot.hints_used.insert(key, value.as_i64().unwrap_or(0));
            }
        }

        if let Some(hints) = root.get("hints") {
            for (key, value) in team_slot_entries(hints) {
                snapshot.hints.insert(key, hints::normalize_all(value));
            }
        }

        if let Some(states) = root.get("client_game_state") {
            for (key, value) in team_slot_entries(states) {
                snapshot
                    .client_game_state
                    .insert(key, value.as_i64().unwrap_or(0));
            }
        }

        if let Some(locations) = root.get("locations") {
            snapshot.totals = location_totals(locations);
        }

        tracing::debug!(
            slots = snapshot.location_checks.len(),
            hint_slots = snapshot.hints.len(),
            totals = snapshot.totals.len(),
            "Decoded save snapshot"
        );
        snapshot
    }

    /// Checked locations of one slot (empty when absent).
    pub fn checked(&self, team: TeamId, slot: SlotId) -> BTreeSet<LocationId> {
        self.location_checks
            .get(&(team, slot))
            .cloned()
            .unwrap_or_default()
    }

    pub fn hints_used(&self, team: TeamId, slot: SlotId) -> i64 {
        self.hints_used.get(&(team, slot)).copied().unwrap_or(0)
    }

    /// Every hint stored under the slot, whether it asked or holds the item.
    pub fn hints_for(&self, team: TeamId, slot: SlotId) -> &[HintRecord] {
        self.hints
            .get(&(team, slot))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Hints the slot paid for.
    pub fn hint_count(&self, team: TeamId, slot: SlotId) -> usize {
        self.hints_for(team, slot)
            .iter()
            .filter(|hint| hint.receiving_player == slot)
            .count()
    }

    pub fn total_locations(&self, slot: SlotId) -> Option<usize> {
        self.totals.get(&slot).copied().filter(|total| *total > 0)
    }

    pub fn has_goaled(&self, team: TeamId, slot: SlotId) -> bool {
        self.client_game_state.get(&(team, slot)).copied() == Some(CLIENT_GOAL)
    }

    /// Slots of `team` that appear anywhere in the save.
    pub fn slots(&self, team: TeamId) -> BTreeSet<SlotId> {
        self.location_checks
            .keys()
            .chain(self.hints_used.keys())
            .chain(self.client_game_state.keys())
            .filter(|(t, _)| *t == team)
            .map(|(_, slot)| *slot)
            .collect()
    }
}

/// Seed layout from a multidata file.
#[derive(Debug, Clone, Default)]
pub struct Multidata {
    /// Locations per slot
    pub totals: HashMap<SlotId, usize>,
    /// Slot roster, when `slot_info` decodes
    pub slots: BTreeMap<SlotId, PlayerSlot>,
    /// Name tables embedded under `datapackage`
    pub catalog: Catalog,
}

impl Multidata {
    pub fn from_value(root: &Value) -> Self {
        let mut multidata = Self::default();
        if let Some(locations) = root.get("locations") {
            multidata.totals = location_totals(locations);
        }
        if let Some(info) = root.get("slot_info") {
            for (key, value) in info.as_dict().unwrap_or_default() {
                let Some(id) = key.as_i64() else { continue };
                if let Some(slot) = network_slot(id, value) {
                    multidata.slots.insert(id, slot);
                }
            }
        }
        if let Some(package) = root.get("datapackage") {
            multidata.catalog = embedded_catalog(package);
        }
        tracing::debug!(
            slots = multidata.totals.len(),
            roster = multidata.slots.len(),
            games = multidata.catalog.games().count(),
            "Decoded multidata"
        );
        multidata
    }

    pub fn total_locations(&self, slot: SlotId) -> Option<usize> {
        self.totals.get(&slot).copied().filter(|total| *total > 0)
    }
}

/// `{game: {"item_name_to_id": {..}, "location_name_to_id": {..}}}`.
fn embedded_catalog(package: &Value) -> Catalog {
    let mut catalog = Catalog::new();
    for (game, tables) in package.as_dict().unwrap_or_default() {
        let Some(game) = game.as_str() else { continue };
        let items = name_table(tables.get("item_name_to_id"));
        let locations = name_table(tables.get("location_name_to_id"));
        catalog.insert(game.to_string(), GameCatalog::new(items, locations));
    }
    catalog
}

fn name_table(table: Option<&Value>) -> HashMap<String, i64> {
    table
        .and_then(Value::as_dict)
        .unwrap_or_default()
        .iter()
        .filter_map(|(name, id)| Some((name.as_str()?.to_string(), id.as_i64()?)))
        .collect()
}

/// Entries of a `{(team, slot): value}` mapping; other keys are skipped.
fn team_slot_entries(map: &Value) -> impl Iterator<Item = ((TeamId, SlotId), &Value)> {
    map.as_dict()
        .unwrap_or_default()
        .iter()
        .filter_map(|(key, value)| key.as_int_pair().map(|pair| (pair, value)))
}

/// `{slot: {location: ...}}` → location count per slot.
fn location_totals(locations: &Value) -> HashMap<SlotId, usize> {
    locations
        .as_dict()
        .unwrap_or_default()
        .iter()
        .filter_map(|(slot, table)| {
            let slot = slot.as_i64()?;
            let count = match table {
                Value::Object(obj) => obj.len(),
                other => other
                    .as_dict()
                    .map(<[_]>::len)
                    .or_else(|| other.as_seq().map(<[_]>::len))?,
            };
            Some((slot, count))
        })
        .collect()
}

/// `NetworkSlot(name, game, type, group_members)` in any encoding.
fn network_slot(id: SlotId, value: &Value) -> Option<PlayerSlot> {
    let name = slot_field(value, "name", 0)?.as_str()?.to_string();
    let game = slot_field(value, "game", 1)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let kind = slot_field(value, "type", 2)
        .and_then(Value::as_i64)
        .map(SlotKind::from_wire)
        .unwrap_or_default();
    Some(PlayerSlot {
        id,
        name,
        game,
        kind,
    })
}

fn slot_field<'a>(value: &'a Value, name: &str, index: usize) -> Option<&'a Value> {
    match value {
        Value::Object(obj) => obj.get(name).or_else(|| obj.args.get(index)),
        Value::Dict(_) => value.get(name),
        other => other.as_seq().and_then(|items| items.get(index)),
    }
}
