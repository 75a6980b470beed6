//! Core domain types for aptrack
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Server** | One Archipelago room, keyed by its normalized websocket address |
//! | **Slot** | A numbered seat in the multiworld; one player (or item-link group) per slot |
//! | **Team** | Slot namespace; only team 0 is supported |
//! | **Catalog** | Per-game item and location name tables (the "data package") |
//! | **Roster** | Slots announced by the server in its `Connected` handshake |
//! | **Live progress** | Locations seen checked over the websocket during this process' lifetime |
//! | **Snapshot** | The server's save file, decoded on demand |

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Slot number within a team.
pub type SlotId = i64;

/// Team number. Always 0 in practice.
pub type TeamId = i64;

/// Location id, unique only within one game's id space.
pub type LocationId = i64;

/// Item id, unique only within one game's id space.
pub type ItemId = i64;

// ============================================
// Roster
// ============================================

/// Kind of slot as announced in `slot_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    Spectator,
    #[default]
    Player,
    Group,
}

impl SlotKind {
    /// Decode the numeric `type` field of a `NetworkSlot`.
    pub fn from_wire(value: i64) -> Self {
        match value {
            0 => SlotKind::Spectator,
            2 => SlotKind::Group,
            _ => SlotKind::Player,
        }
    }
}

/// A player slot from the handshake roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerSlot {
    pub id: SlotId,
    pub name: String,
    pub game: String,
    #[serde(default)]
    pub kind: SlotKind,
}

/// Item classification bitmask carried by network items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ItemFlags(pub i64);

impl ItemFlags {
    pub const PROGRESSION: i64 = 0b001;
    pub const USEFUL: i64 = 0b010;
    pub const TRAP: i64 = 0b100;

    /// Progression ("key") items are the only ones worth announcing.
    pub fn is_progression(&self) -> bool {
        self.0 & Self::PROGRESSION != 0
    }

    pub fn is_useful(&self) -> bool {
        self.0 & Self::USEFUL != 0
    }

    pub fn is_trap(&self) -> bool {
        self.0 & Self::TRAP != 0
    }
}

// ============================================
// Live progress
// ============================================

/// Locations observed checked per slot during the current process.
///
/// Entries are only ever added.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveProgress {
    checks: BTreeMap<SlotId, BTreeSet<LocationId>>,
}

impl LiveProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a check. Returns true if the location was new for this slot.
    pub fn record(&mut self, slot: SlotId, location: LocationId) -> bool {
        self.checks.entry(slot).or_default().insert(location)
    }

    /// Record several checks for one slot, returning how many were new.
    pub fn record_all(&mut self, slot: SlotId, locations: impl IntoIterator<Item = LocationId>) -> usize {
        let set = self.checks.entry(slot).or_default();
        locations
            .into_iter()
            .filter(|location| set.insert(*location))
            .count()
    }

    /// Checked locations for a slot (empty when never seen).
    pub fn checked(&self, slot: SlotId) -> BTreeSet<LocationId> {
        self.checks.get(&slot).cloned().unwrap_or_default()
    }

    pub fn count(&self, slot: SlotId) -> usize {
        self.checks.get(&slot).map(BTreeSet::len).unwrap_or(0)
    }

    pub fn slots(&self) -> impl Iterator<Item = SlotId> + '_ {
        self.checks.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.values().all(BTreeSet::is_empty)
    }
}

// ============================================
// Channel notifications
// ============================================

/// Category of a channel notification; decides the marker prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Handshake accepted, roster listed
    Connected,
    /// Item sent / received / location checked
    Item,
    /// Goal, release, collect, countdown
    Goal,
    /// Server chat and tutorial text that passed the noise filter
    Info,
    /// Online players and room details
    Room,
    /// Unrecognized command, truncated
    Unknown,
    /// Connection refused, retries exhausted
    Error,
    /// Stale or mismatched data
    Warning,
}

impl NotificationKind {
    /// Marker prepended to the text in the channel.
    pub fn marker(&self) -> &'static str {
        match self {
            NotificationKind::Connected => "🔗",
            NotificationKind::Item => "📦",
            NotificationKind::Goal => "🏁",
            NotificationKind::Info => "ℹ️",
            NotificationKind::Room => "👥",
            NotificationKind::Unknown => "❔",
            NotificationKind::Error => "❌",
            NotificationKind::Warning => "⚠️",
        }
    }
}

/// One line for the chat channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Server address the line originates from
    pub server: String,
    pub kind: NotificationKind,
    pub text: String,
}

impl Notification {
    pub fn new(server: impl Into<String>, kind: NotificationKind, text: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            kind,
            text: text.into(),
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.marker(), self.text)
    }
}
