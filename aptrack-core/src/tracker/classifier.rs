//! Inbound message classification.
//!
//! Each decoded command is routed by its `cmd` discriminator and turned into
//! zero or more [`Outcome`]s: channel notifications, catalog requests, and
//! lifecycle signals for the retry state machine. Live location checks are
//! recorded along the way.
//!
//! The server mixes session bookkeeping chatter with gameplay events in the
//! same free-text channel, so text prints go through keyword denylists.

use super::registry::{ConnectionDataStore, ConnectionRecord};
use crate::catalog::{Catalog, CatalogStore};
use crate::error::{Error, Result};
use crate::format::truncate_chars;
use crate::progress::{display, detect_mismatch, CompletionOracle, ProgressWarning};
use crate::protocol::{
    self, Connected, ConnectionRefused, JsonFragment, LocationInfo, NetworkPlayer, PrintJson,
    ReceivedItems, RoomInfo, RoomUpdate, TRACKER_NAME,
};
use crate::types::{
    ItemFlags, ItemId, LiveProgress, LocationId, Notification, NotificationKind, PlayerSlot,
    SlotId, SlotKind,
};
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Longest fallback line for unrecognized commands.
pub const FALLBACK_MAX_CHARS: usize = 200;

/// Connection chatter suppressed from `ServerChat` / `Tutorial` prints.
pub const CHAT_DENYLIST: &[&str] = &[
    "joined",
    "left",
    "tracking",
    "sync",
    "connected",
    "disconnected",
    "connection",
    "reconnect",
];

/// Extra player-action words suppressed from unclassified prints.
pub const ACTION_DENYLIST: &[&str] = &["sent", "received", "found", "checked", "collecting"];

/// Commands that are echoes of our own traffic and never shown.
const SILENT_COMMANDS: &[&str] = &["Bounced"];

/// Case-insensitive substring match against any keyword.
pub fn matches_denylist(text: &str, denylist: &[&str]) -> bool {
    let lower = text.to_lowercase();
    denylist.iter().any(|word| lower.contains(word))
}

/// Chat filter for unclassified print types.
pub fn is_broad_noise(text: &str) -> bool {
    matches_denylist(text, CHAT_DENYLIST) || matches_denylist(text, ACTION_DENYLIST)
}

/// Result of classifying one command.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Notify(Notification),
    /// Ask for the data package of these games (all games when empty)
    RequestCatalog(BTreeSet<String>),
    HandshakeConfirmed,
    Rejected(Vec<String>),
    /// Every player slot has reached its goal
    GameComplete,
}

/// Routes inbound commands for one server.
pub struct Classifier {
    server: String,
    catalogs: Arc<CatalogStore>,
    connections: Arc<ConnectionDataStore>,
    completion: Arc<dyn CompletionOracle>,
    roster: BTreeMap<SlotId, PlayerSlot>,
    own_slot: Option<SlotId>,
    live: LiveProgress,
    goaled: BTreeSet<SlotId>,
    complete_signalled: bool,
}

impl Classifier {
    pub fn new(
        server: impl Into<String>,
        catalogs: Arc<CatalogStore>,
        connections: Arc<ConnectionDataStore>,
        completion: Arc<dyn CompletionOracle>,
    ) -> Self {
        Self {
            server: server.into(),
            catalogs,
            connections,
            completion,
            roster: BTreeMap::new(),
            own_slot: None,
            live: LiveProgress::new(),
            goaled: BTreeSet::new(),
            complete_signalled: false,
        }
    }

    pub fn live(&self) -> &LiveProgress {
        &self.live
    }

    pub fn roster(&self) -> &BTreeMap<SlotId, PlayerSlot> {
        &self.roster
    }

    pub fn own_slot(&self) -> Option<SlotId> {
        self.own_slot
    }

    /// Classify one command object.
    ///
    /// Errors are per-message: the caller logs them and keeps the session.
    pub fn classify(&mut self, message: &Value) -> Result<Vec<Outcome>> {
        let cmd = protocol::command_name(message)
            .ok_or_else(|| Error::ProtocolViolation("command without \"cmd\"".to_string()))?;
        tracing::trace!(server = %self.server, cmd, "Classifying message");

        match cmd {
            "Connected" => self.on_connected(message),
            "ConnectionRefused" => self.on_refused(message),
            "ReceivedItems" => self.on_received_items(message),
            "LocationInfo" => self.on_location_info(message),
            "Print" | "PrintJSON" => self.on_print(message),
            "RoomUpdate" => self.on_room_update(message),
            "RoomInfo" => self.on_room_info(message),
            "DataPackage" => self.on_data_package(message),
            cmd if SILENT_COMMANDS.contains(&cmd) => Ok(Vec::new()),
            cmd => Ok(vec![self.notify(
                NotificationKind::Unknown,
                truncate_chars(&format!("{}: {}", cmd, message), FALLBACK_MAX_CHARS),
            )]),
        }
    }

    // ---------- handlers ----------

    fn on_connected(&mut self, message: &Value) -> Result<Vec<Outcome>> {
        let connected: Connected = view(message)?;
        self.own_slot = connected.slot;
        self.roster = roster_from(&connected);

        if let Some(slot) = self.own_slot {
            self.live
                .record_all(slot, connected.checked_locations.iter().copied());
        }

        self.connections.record(
            &self.server,
            ConnectionRecord {
                session_id: uuid::Uuid::new_v4().to_string(),
                received_at: Utc::now(),
                own_slot: self.own_slot,
                roster: self.roster.values().cloned().collect(),
                payload: message.clone(),
            },
        );

        let players: Vec<&str> = self
            .tracked_players()
            .map(|p| p.name.as_str())
            .collect();
        let text = if players.is_empty() {
            format!("Connected to {}, no players yet", self.server)
        } else {
            format!("Connected to {}, players: {}", self.server, players.join(", "))
        };
        tracing::info!(server = %self.server, players = players.len(), "Handshake confirmed");

        let games: BTreeSet<String> = self
            .roster
            .values()
            .map(|p| p.game.clone())
            .filter(|g| !g.is_empty())
            .collect();

        let mut outcomes = vec![
            Outcome::HandshakeConfirmed,
            self.notify(NotificationKind::Connected, text),
            Outcome::RequestCatalog(games),
        ];
        if let Some(warning) = self.save_file_mismatch() {
            tracing::warn!(server = %self.server, warning = ?warning, "Save file does not match roster");
            outcomes.push(self.notify(NotificationKind::Warning, display::warning_text(&warning)));
        }
        Ok(outcomes)
    }

    fn on_refused(&mut self, message: &Value) -> Result<Vec<Outcome>> {
        let refused: ConnectionRefused = view(message)?;
        let errors = if refused.errors.is_empty() {
            vec!["unspecified".to_string()]
        } else {
            refused.errors
        };
        tracing::warn!(server = %self.server, errors = ?errors, "Connection refused");
        Ok(vec![
            self.notify(
                NotificationKind::Error,
                format!("Connection to {} refused: {}", self.server, errors.join(", ")),
            ),
            Outcome::Rejected(errors),
        ])
    }

    fn on_received_items(&mut self, message: &Value) -> Result<Vec<Outcome>> {
        let batch: ReceivedItems = view(message)?;
        let catalog = self.catalogs.get(&self.server);
        let outcomes = batch
            .items
            .iter()
            .map(|item| {
                let receiver = self.own_slot.unwrap_or(item.player);
                let name = self.player_name(receiver);
                let item_name = catalog.item_name(&self.player_game(receiver), item.item);
                self.notify(
                    NotificationKind::Item,
                    format!("{} received: {}", name, item_name),
                )
            })
            .collect();
        Ok(outcomes)
    }

    fn on_location_info(&mut self, message: &Value) -> Result<Vec<Outcome>> {
        let info: LocationInfo = view(message)?;
        let catalog = self.catalogs.get(&self.server);
        let outcomes = info
            .locations
            .iter()
            .map(|item| {
                let finder = self.own_slot.unwrap_or(item.player);
                let name = self.player_name(finder);
                let location = catalog.location_name(&self.player_game(finder), item.location);
                self.notify(
                    NotificationKind::Item,
                    format!("{} checked: {}", name, location),
                )
            })
            .collect();
        Ok(outcomes)
    }

    fn on_print(&mut self, message: &Value) -> Result<Vec<Outcome>> {
        let print: PrintJson = view(message)?;
        let kind = print.kind.clone().unwrap_or_default();
        match kind.as_str() {
            "ItemSend" => self.on_item_send(&print),
            "Goal" | "Release" | "Collect" | "Countdown" => {
                let text = self.render(&print.fragments());
                let mut outcomes = Vec::new();
                if kind == "Goal" {
                    outcomes.extend(self.record_goal(&print));
                }
                if !text.trim().is_empty() {
                    outcomes.insert(0, self.notify(NotificationKind::Goal, text));
                }
                Ok(outcomes)
            }
            "Tutorial" | "ServerChat" => {
                let text = self.render(&print.fragments());
                if text.trim().is_empty() || matches_denylist(&text, CHAT_DENYLIST) {
                    tracing::debug!(server = %self.server, kind = %kind, "Suppressed server chatter");
                    return Ok(Vec::new());
                }
                Ok(vec![self.notify(NotificationKind::Info, text)])
            }
            _ => {
                let text = self.render(&print.fragments());
                if text.trim().is_empty() || is_broad_noise(&text) {
                    tracing::debug!(server = %self.server, kind = %kind, "Suppressed unclassified print");
                    return Ok(Vec::new());
                }
                Ok(vec![self.notify(NotificationKind::Info, text)])
            }
        }
    }

    fn on_item_send(&mut self, print: &PrintJson) -> Result<Vec<Outcome>> {
        let send = ItemSend::extract(print)?;

        // The check happened regardless of whether it is worth announcing.
        if let Some(location) = send.location {
            self.live.record(send.sender, location);
        }

        if !send.flags.is_progression() {
            return Ok(Vec::new());
        }
        if self.is_tracker(send.sender) || self.is_tracker(send.recipient) {
            return Ok(Vec::new());
        }
        if self.completion.is_complete(send.recipient) {
            tracing::debug!(
                server = %self.server,
                slot = send.recipient,
                "Recipient already complete, not announcing"
            );
            return Ok(Vec::new());
        }

        let catalog = self.catalogs.get(&self.server);
        let sender = self.player_name(send.sender);
        let item = catalog.item_name(&self.player_game(send.recipient), send.item);
        let location = send
            .location
            .map(|l| catalog.location_name(&self.player_game(send.sender), l));

        let mut text = if send.sender == send.recipient {
            format!("{} found their {}", sender, item)
        } else {
            format!("{} sent {} to {}", sender, item, self.player_name(send.recipient))
        };
        if let Some(location) = location {
            text.push_str(&format!(" ({})", location));
        }
        Ok(vec![self.notify(NotificationKind::Item, text)])
    }

    fn on_room_update(&mut self, message: &Value) -> Result<Vec<Outcome>> {
        let update: RoomUpdate = view(message)?;
        if let (Some(slot), Some(checked)) = (self.own_slot, &update.checked_locations) {
            self.live.record_all(slot, checked.iter().copied());
        }
        let Some(players) = update.players else {
            return Ok(Vec::new());
        };
        for player in &players {
            if let Some(slot) = self.roster.get_mut(&player.slot) {
                if !player.alias.is_empty() {
                    slot.name = player.alias.clone();
                }
            }
        }
        Ok(vec![self.notify(NotificationKind::Room, online_line(&players))])
    }

    fn on_room_info(&mut self, message: &Value) -> Result<Vec<Outcome>> {
        let info: RoomInfo = view(message)?;
        let count = info
            .players
            .as_ref()
            .map(Vec::len)
            .unwrap_or(info.games.len());
        let text = match (&info.seed_name, count) {
            (Some(seed), 0) => format!("Room {}", seed),
            (Some(seed), n) => format!("Room {}, {} players", seed, n),
            (None, 0) => return Ok(Vec::new()),
            (None, n) => format!("Room with {} players", n),
        };
        Ok(vec![self.notify(NotificationKind::Room, text)])
    }

    fn on_data_package(&mut self, message: &Value) -> Result<Vec<Outcome>> {
        let games = message
            .get("data")
            .and_then(|d| d.get("games"))
            .ok_or_else(|| Error::ProtocolViolation("DataPackage without data.games".into()))?;
        let catalog = Catalog::from_games_json(games);
        tracing::info!(
            server = %self.server,
            games = catalog.games().count(),
            "Catalog replaced"
        );
        self.catalogs.replace(&self.server, catalog);
        Ok(Vec::new())
    }

    // ---------- helpers ----------

    fn notify(&self, kind: NotificationKind, text: impl Into<String>) -> Outcome {
        Outcome::Notify(Notification::new(self.server.clone(), kind, text))
    }

    fn record_goal(&mut self, print: &PrintJson) -> Option<Outcome> {
        let slot = print.slot.or_else(|| {
            print
                .fragments()
                .iter()
                .find(|f| f.kind() == "player_id")
                .and_then(JsonFragment::id)
        })?;
        self.goaled.insert(slot);

        let all_done = {
            let mut players = self.tracked_players().peekable();
            players.peek()?;
            players.all(|p| self.goaled.contains(&p.id))
        };
        if all_done && !self.complete_signalled {
            self.complete_signalled = true;
            tracing::info!(server = %self.server, "All players reached their goal");
            return Some(Outcome::GameComplete);
        }
        None
    }

    /// Roster slots that the configured save file knows nothing about.
    fn save_file_mismatch(&self) -> Option<ProgressWarning> {
        let saved = self.completion.saved_slots()?;
        let live: BTreeSet<SlotId> = self.tracked_players().map(|p| p.id).collect();
        detect_mismatch(&live, &saved)
    }

    /// Roster entries that play the game: no groups, spectators or trackers.
    fn tracked_players(&self) -> impl Iterator<Item = &PlayerSlot> {
        self.roster.values().filter(move |p| {
            p.kind == SlotKind::Player && !self.is_tracker(p.id)
        })
    }

    fn is_tracker(&self, slot: SlotId) -> bool {
        if Some(slot) == self.own_slot {
            return true;
        }
        self.roster
            .get(&slot)
            .is_some_and(|p| p.name.eq_ignore_ascii_case(TRACKER_NAME))
    }

    fn player(&self, slot: SlotId) -> Option<PlayerSlot> {
        self.roster
            .get(&slot)
            .cloned()
            .or_else(|| self.connections.lookup_player(&self.server, slot))
    }

    fn player_name(&self, slot: SlotId) -> String {
        self.player(slot)
            .map(|p| p.name)
            .unwrap_or_else(|| format!("Player {}", slot))
    }

    fn player_game(&self, slot: SlotId) -> String {
        self.player(slot).map(|p| p.game).unwrap_or_default()
    }

    /// Concatenate fragments, resolving ids against the owning player's game.
    fn render(&self, fragments: &[JsonFragment]) -> String {
        let catalog = self.catalogs.get(&self.server);
        fragments
            .iter()
            .map(|fragment| match (fragment.kind(), fragment.id()) {
                ("player_id", Some(slot)) => self.player_name(slot),
                ("item_id", Some(id)) => {
                    let game = fragment.player.map(|p| self.player_game(p)).unwrap_or_default();
                    catalog.item_name(&game, id)
                }
                ("location_id", Some(id)) => {
                    let game = fragment.player.map(|p| self.player_game(p)).unwrap_or_default();
                    catalog.location_name(&game, id)
                }
                _ => fragment.text().to_string(),
            })
            .collect()
    }
}

/// Parties and payload of an `ItemSend` print.
#[derive(Debug, Clone, PartialEq)]
struct ItemSend {
    sender: SlotId,
    recipient: SlotId,
    item: ItemId,
    flags: ItemFlags,
    location: Option<LocationId>,
}

impl ItemSend {
    /// First `player_id` fragment is the sender, second the recipient;
    /// the structured `item` / `receiving` fields fill any gaps.
    fn extract(print: &PrintJson) -> Result<Self> {
        let fragments = print.fragments();
        let mut players = fragments
            .iter()
            .filter(|f| f.kind() == "player_id")
            .filter_map(JsonFragment::id);
        let first = players.next();
        let second = players.next();
        let item_fragment = fragments.iter().find(|f| f.kind() == "item_id");
        let location_fragment = fragments.iter().find(|f| f.kind() == "location_id");

        let sender = first
            .or(print.item.as_ref().map(|i| i.player))
            .ok_or_else(|| Error::ProtocolViolation("ItemSend without sender".into()))?;
        // A single player fragment means the sender found their own item.
        let recipient = second
            .or(print.receiving)
            .or(first.filter(|_| item_fragment.is_some()))
            .ok_or_else(|| Error::ProtocolViolation("ItemSend without recipient".into()))?;
        let item = item_fragment
            .and_then(JsonFragment::id)
            .or(print.item.as_ref().map(|i| i.item))
            .ok_or_else(|| Error::ProtocolViolation("ItemSend without item".into()))?;
        let flags = item_fragment
            .and_then(|f| f.flags)
            .or(print.item.as_ref().map(|i| i.flags))
            .map(ItemFlags)
            .unwrap_or_default();
        let location = location_fragment
            .and_then(JsonFragment::id)
            .or(print.item.as_ref().map(|i| i.location));

        Ok(Self {
            sender,
            recipient,
            item,
            flags,
            location,
        })
    }
}

fn view<T: serde::de::DeserializeOwned>(message: &Value) -> Result<T> {
    serde_json::from_value(message.clone()).map_err(|e| {
        let cmd = protocol::command_name(message).unwrap_or("?");
        Error::ProtocolViolation(format!("malformed {}: {}", cmd, e))
    })
}

/// Roster from `slot_info`, with `players` filling slots it does not list.
fn roster_from(connected: &Connected) -> BTreeMap<SlotId, PlayerSlot> {
    let mut roster: BTreeMap<SlotId, PlayerSlot> = connected
        .slot_info
        .iter()
        .filter_map(|(key, info)| {
            let id = key.parse().ok()?;
            Some((
                id,
                PlayerSlot {
                    id,
                    name: info.name.clone(),
                    game: info.game.clone(),
                    kind: SlotKind::from_wire(info.kind),
                },
            ))
        })
        .collect();
    for player in &connected.players {
        roster.entry(player.slot).or_insert_with(|| PlayerSlot {
            id: player.slot,
            name: if player.alias.is_empty() {
                player.name.clone()
            } else {
                player.alias.clone()
            },
            game: String::new(),
            kind: SlotKind::Player,
        });
    }
    roster
}

fn online_line(players: &[NetworkPlayer]) -> String {
    let online: Vec<&str> = players
        .iter()
        .filter(|p| p.status.unwrap_or(0) > 0)
        .map(|p| {
            if p.alias.is_empty() {
                p.name.as_str()
            } else {
                p.alias.as_str()
            }
        })
        .collect();
    if online.is_empty() {
        "Online: nobody".to_string()
    } else {
        format!("Online: {}", online.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoCompletion;
    use serde_json::json;
    use std::sync::Mutex;

    const SERVER: &str = "ws://localhost:38281";

    /// Oracle reporting a fixed set of slots as complete, counting queries.
    struct FixedCompletion {
        complete: BTreeSet<SlotId>,
        queries: Mutex<usize>,
    }

    impl CompletionOracle for FixedCompletion {
        fn is_complete(&self, slot: SlotId) -> bool {
            *self.queries.lock().unwrap() += 1;
            self.complete.contains(&slot)
        }
    }

    /// Oracle backed by a save file recording `slots`.
    struct SavedSlots(BTreeSet<SlotId>);

    impl CompletionOracle for SavedSlots {
        fn is_complete(&self, _slot: SlotId) -> bool {
            false
        }

        fn saved_slots(&self) -> Option<BTreeSet<SlotId>> {
            Some(self.0.clone())
        }
    }

    fn classifier_with(completion: Arc<dyn CompletionOracle>) -> Classifier {
        let catalogs = Arc::new(CatalogStore::new());
        catalogs.replace(
            SERVER,
            Catalog::from_games_json(&json!({
                "Factorio": {
                    "item_name_to_id": {"Rocket Silo": 10},
                    "location_name_to_id": {"Automation": 500}
                },
                "Hollow Knight": {
                    "item_name_to_id": {"Mantis Claw": 10},
                    "location_name_to_id": {"King's Pass": 500}
                }
            })),
        );
        Classifier::new(SERVER, catalogs, Arc::new(ConnectionDataStore::new()), completion)
    }

    fn classifier() -> Classifier {
        classifier_with(Arc::new(NoCompletion))
    }

    fn connected() -> Value {
        json!({
            "cmd": "Connected",
            "team": 0,
            "slot": 3,
            "players": [
                {"team": 0, "slot": 1, "alias": "Alice", "name": "Alice"},
                {"team": 0, "slot": 2, "alias": "Bob", "name": "Bob"},
                {"team": 0, "slot": 3, "alias": "aptrack", "name": "aptrack"}
            ],
            "slot_info": {
                "1": {"name": "Alice", "game": "Factorio", "type": 1, "group_members": []},
                "2": {"name": "Bob", "game": "Hollow Knight", "type": 1, "group_members": []},
                "3": {"name": "aptrack", "game": "", "type": 0, "group_members": []},
                "4": {"name": "Link Group", "game": "Factorio", "type": 2, "group_members": [1]}
            },
            "checked_locations": [7, 8],
            "missing_locations": []
        })
    }

    fn ready() -> Classifier {
        let mut classifier = classifier();
        classifier.classify(&connected()).unwrap();
        classifier
    }

    fn item_send(sender: i64, recipient: i64, flags: i64) -> Value {
        json!({
            "cmd": "PrintJSON",
            "type": "ItemSend",
            "receiving": recipient,
            "item": {"item": 10, "location": 500, "player": sender, "flags": flags},
            "data": [
                {"type": "player_id", "text": sender.to_string()},
                {"text": " sent "},
                {"type": "item_id", "text": "10", "player": recipient, "flags": flags},
                {"text": " to "},
                {"type": "player_id", "text": recipient.to_string()},
                {"text": " ("},
                {"type": "location_id", "text": "500", "player": sender},
                {"text": ")"}
            ]
        })
    }

    fn texts(outcomes: &[Outcome]) -> Vec<String> {
        outcomes
            .iter()
            .filter_map(|o| match o {
                Outcome::Notify(n) => Some(n.text.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_connected_confirms_and_requests_active_games() {
        let mut classifier = classifier();
        let outcomes = classifier.classify(&connected()).unwrap();

        assert_eq!(outcomes[0], Outcome::HandshakeConfirmed);
        assert_eq!(
            texts(&outcomes),
            vec![format!("Connected to {}, players: Alice, Bob", SERVER)]
        );
        assert_eq!(
            outcomes[2],
            Outcome::RequestCatalog(BTreeSet::from([
                "Factorio".to_string(),
                "Hollow Knight".to_string()
            ]))
        );
        assert_eq!(classifier.own_slot(), Some(3));
        assert_eq!(classifier.live().checked(3), BTreeSet::from([7, 8]));
        assert_eq!(classifier.connections.history(SERVER).len(), 1);
    }

    #[test]
    fn test_connected_warns_when_save_file_has_other_slots() {
        let mut classifier = classifier_with(Arc::new(SavedSlots(BTreeSet::from([7, 8]))));
        let outcomes = classifier.classify(&connected()).unwrap();

        assert_eq!(outcomes.len(), 4);
        let Outcome::Notify(warning) = &outcomes[3] else {
            panic!("expected a warning, got {:?}", outcomes[3]);
        };
        assert_eq!(warning.kind, NotificationKind::Warning);
        assert!(warning.text.contains("saved slots {7, 8}"));
        assert!(warning.text.contains("live slots {1, 2}"));
    }

    #[test]
    fn test_connected_accepts_overlapping_save_file() {
        let mut classifier = classifier_with(Arc::new(SavedSlots(BTreeSet::from([2, 9]))));
        let outcomes = classifier.classify(&connected()).unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes
            .iter()
            .all(|o| !matches!(o, Outcome::Notify(n) if n.kind == NotificationKind::Warning)));
    }

    #[test]
    fn test_goal_before_handshake_never_completes() {
        let mut classifier = classifier();
        let outcomes = classifier
            .classify(&json!({
                "cmd": "PrintJSON",
                "type": "Goal",
                "slot": 1,
                "data": [{"text": "Player 1 has completed their goal."}]
            }))
            .unwrap();
        assert!(!outcomes.contains(&Outcome::GameComplete));
    }

    #[test]
    fn test_empty_roster_requests_every_game() {
        let mut classifier = classifier();
        let outcomes = classifier
            .classify(&json!({"cmd": "Connected", "slot_info": {}}))
            .unwrap();
        assert_eq!(outcomes[2], Outcome::RequestCatalog(BTreeSet::new()));
    }

    #[test]
    fn test_refusal_is_terminal() {
        let outcomes = classifier()
            .classify(&json!({"cmd": "ConnectionRefused", "errors": ["InvalidSlot"]}))
            .unwrap();
        assert!(texts(&outcomes)[0].contains("InvalidSlot"));
        assert_eq!(outcomes[1], Outcome::Rejected(vec!["InvalidSlot".into()]));
    }

    #[test]
    fn test_item_send_resolves_names_per_game() {
        let mut classifier = ready();
        let outcomes = classifier.classify(&item_send(1, 2, 1)).unwrap();
        // Item id 10 in Bob's game, location id 500 in Alice's.
        assert_eq!(
            texts(&outcomes),
            vec!["Alice sent Mantis Claw to Bob (Automation)".to_string()]
        );
        assert_eq!(classifier.live().checked(1), BTreeSet::from([500]));
    }

    #[test]
    fn test_item_send_requires_progression_flag() {
        let mut classifier = ready();
        assert!(classifier.classify(&item_send(1, 2, 0)).unwrap().is_empty());
        assert!(classifier.classify(&item_send(1, 2, 2)).unwrap().is_empty());
        assert_eq!(classifier.classify(&item_send(1, 2, 3)).unwrap().len(), 1);
        assert_eq!(classifier.classify(&item_send(1, 2, 5)).unwrap().len(), 1);
        // Suppressed sends still count as checks.
        assert_eq!(classifier.live().count(1), 1);
    }

    #[test]
    fn test_item_send_involving_tracker_is_silent() {
        let mut classifier = ready();
        assert!(classifier.classify(&item_send(3, 2, 1)).unwrap().is_empty());
        assert!(classifier.classify(&item_send(1, 3, 1)).unwrap().is_empty());
        assert_eq!(classifier.live().checked(3), BTreeSet::from([7, 8, 500]));
    }

    #[test]
    fn test_item_send_to_complete_player_is_silent() {
        let oracle = Arc::new(FixedCompletion {
            complete: BTreeSet::from([2]),
            queries: Mutex::new(0),
        });
        let mut classifier = classifier_with(oracle.clone());
        classifier.classify(&connected()).unwrap();

        assert!(classifier.classify(&item_send(1, 2, 1)).unwrap().is_empty());
        assert_eq!(classifier.classify(&item_send(2, 1, 1)).unwrap().len(), 1);
        assert_eq!(*oracle.queries.lock().unwrap(), 2);
    }

    #[test]
    fn test_self_find_wording() {
        let mut classifier = ready();
        let outcomes = classifier
            .classify(&json!({
                "cmd": "PrintJSON",
                "type": "ItemSend",
                "receiving": 1,
                "item": {"item": 10, "location": 500, "player": 1, "flags": 1},
                "data": [
                    {"type": "player_id", "text": "1"},
                    {"text": " found their "},
                    {"type": "item_id", "text": "10", "player": 1, "flags": 1},
                    {"text": " ("},
                    {"type": "location_id", "text": "500", "player": 1},
                    {"text": ")"}
                ]
            }))
            .unwrap();
        assert_eq!(
            texts(&outcomes),
            vec!["Alice found their Rocket Silo (Automation)".to_string()]
        );
    }

    #[test]
    fn test_server_chat_filter() {
        let mut classifier = ready();
        let chat = |text: &str| json!({"cmd": "PrintJSON", "type": "ServerChat", "data": [{"text": text}]});

        assert!(classifier
            .classify(&chat("Alice has joined the game"))
            .unwrap()
            .is_empty());
        assert!(classifier
            .classify(&chat("Now TRACKING Bob"))
            .unwrap()
            .is_empty());
        let kept = classifier.classify(&chat("Server restarting in 5 minutes")).unwrap();
        assert_eq!(texts(&kept), vec!["Server restarting in 5 minutes".to_string()]);
        // The narrow filter lets player actions through.
        assert_eq!(classifier.classify(&chat("Alice found a secret")).unwrap().len(), 1);
    }

    #[test]
    fn test_unclassified_prints_use_broad_filter() {
        let mut classifier = ready();
        let print = |text: &str| json!({"cmd": "PrintJSON", "type": "Chat", "data": [{"text": text}]});
        assert!(classifier.classify(&print("Alice found a secret")).unwrap().is_empty());
        assert!(classifier.classify(&print("Bob is COLLECTING")).unwrap().is_empty());
        assert_eq!(classifier.classify(&print("gg everyone")).unwrap().len(), 1);

        // Legacy Print carries bare text.
        let legacy = classifier
            .classify(&json!({"cmd": "Print", "text": "hello"}))
            .unwrap();
        assert_eq!(texts(&legacy), vec!["hello".to_string()]);
    }

    #[test]
    fn test_goal_prints_and_game_completion() {
        let mut classifier = ready();
        let goal = |slot: i64| {
            json!({
                "cmd": "PrintJSON",
                "type": "Goal",
                "slot": slot,
                "data": [{"type": "player_id", "text": slot.to_string()}, {"text": " has completed their goal."}]
            })
        };

        let first = classifier.classify(&goal(1)).unwrap();
        assert_eq!(texts(&first), vec!["Alice has completed their goal.".to_string()]);
        assert!(!first.contains(&Outcome::GameComplete));

        let second = classifier.classify(&goal(2)).unwrap();
        assert!(second.contains(&Outcome::GameComplete));

        // Signalled once.
        let again = classifier.classify(&goal(2)).unwrap();
        assert!(!again.contains(&Outcome::GameComplete));
    }

    #[test]
    fn test_received_items_and_location_info() {
        let mut classifier = ready();
        let received = classifier
            .classify(&json!({
                "cmd": "ReceivedItems",
                "index": 0,
                "items": [{"item": 77, "location": 1, "player": 1, "flags": 0}]
            }))
            .unwrap();
        assert_eq!(texts(&received), vec!["aptrack received: Item 77".to_string()]);

        let scouted = classifier
            .classify(&json!({
                "cmd": "LocationInfo",
                "locations": [{"item": 1, "location": 9, "player": 2, "flags": 0}]
            }))
            .unwrap();
        assert_eq!(texts(&scouted), vec!["aptrack checked: Location 9".to_string()]);
    }

    #[test]
    fn test_room_messages() {
        let mut classifier = ready();
        let update = classifier
            .classify(&json!({
                "cmd": "RoomUpdate",
                "players": [
                    {"team": 0, "slot": 1, "alias": "Ali", "name": "Alice", "status": 5},
                    {"team": 0, "slot": 2, "alias": "Bob", "name": "Bob", "status": 0}
                ],
                "checked_locations": [9]
            }))
            .unwrap();
        assert_eq!(texts(&update), vec!["Online: Ali".to_string()]);
        assert!(classifier.live().checked(3).contains(&9));
        assert_eq!(classifier.roster()[&1].name, "Ali");

        let info = classifier
            .classify(&json!({"cmd": "RoomInfo", "seed_name": "12345", "games": ["A", "B"]}))
            .unwrap();
        assert_eq!(texts(&info), vec!["Room 12345, 2 players".to_string()]);
    }

    #[test]
    fn test_data_package_replaces_catalog() {
        let mut classifier = ready();
        let outcomes = classifier
            .classify(&json!({
                "cmd": "DataPackage",
                "data": {"games": {"Factorio": {"item_name_to_id": {"Gun": 99}, "location_name_to_id": {}}}}
            }))
            .unwrap();
        assert!(outcomes.is_empty());
        let catalog = classifier.catalogs.get(SERVER);
        assert_eq!(catalog.item_name("Factorio", 99), "Gun");
        assert_eq!(catalog.item_name("Hollow Knight", 10), "Item 10");
    }

    #[test]
    fn test_unknown_and_silent_commands() {
        let mut classifier = ready();
        assert!(classifier
            .classify(&json!({"cmd": "Bounced", "data": {}}))
            .unwrap()
            .is_empty());

        let long = "x".repeat(500);
        let outcomes = classifier
            .classify(&json!({"cmd": "SetReply", "value": long}))
            .unwrap();
        let text = &texts(&outcomes)[0];
        assert!(text.starts_with("SetReply: "));
        assert_eq!(text.chars().count(), FALLBACK_MAX_CHARS);
        assert!(matches!(
            &outcomes[0],
            Outcome::Notify(n) if n.kind == NotificationKind::Unknown
        ));
    }

    #[test]
    fn test_malformed_messages_are_errors() {
        let mut classifier = ready();
        assert!(matches!(
            classifier.classify(&json!({"nocmd": true})),
            Err(Error::ProtocolViolation(_))
        ));
        assert!(matches!(
            classifier.classify(&json!({"cmd": "ReceivedItems", "items": "nope"})),
            Err(Error::ProtocolViolation(_))
        ));
        assert!(matches!(
            classifier.classify(&json!({"cmd": "PrintJSON", "type": "ItemSend", "data": []})),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_denylist_is_case_insensitive() {
        assert!(matches_denylist("Reconnecting...", CHAT_DENYLIST));
        assert!(!matches_denylist("Victory!", CHAT_DENYLIST));
        assert!(is_broad_noise("Alice CHECKED a chest"));
    }
}
