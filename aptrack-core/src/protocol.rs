//! Archipelago websocket wire format
//!
//! Every frame is a JSON array of command objects discriminated by `"cmd"`.
//! Outbound commands are typed; inbound commands stay as `serde_json::Value`
//! until the classifier picks a typed view for the ones it understands.

use crate::error::{Error, Result};
use crate::types::{ItemFlags, ItemId, LocationId, SlotId, TeamId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Slot name the tracker connects with.
pub const TRACKER_NAME: &str = "aptrack";

/// Protocol version announced in `Connect`.
pub const PROTOCOL_VERSION: NetworkVersion = NetworkVersion {
    major: 0,
    minor: 5,
    build: 1,
};

/// Tag marking a passive client that wants no item delivery.
pub const TRACKER_TAG: &str = "Tracker";

// ============================================
// Client -> Server
// ============================================

/// Commands sent by the tracker.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "cmd")]
pub enum ClientMessage {
    Connect(Connect),
    GetDataPackage(GetDataPackage),
    Say(Say),
}

/// Handshake request.
#[derive(Debug, Clone, Serialize)]
pub struct Connect {
    pub game: String,
    pub password: String,
    pub name: String,
    pub version: NetworkVersion,
    pub tags: Vec<String>,
    pub items_handling: u8,
    pub uuid: String,
    pub slot_data: bool,
}

impl Connect {
    /// Passive tracker handshake with a derived client uuid.
    pub fn tracker(password: Option<&str>, uuid: String) -> Self {
        Self {
            game: String::new(),
            password: password.unwrap_or_default().to_string(),
            name: TRACKER_NAME.to_string(),
            version: PROTOCOL_VERSION,
            tags: vec![TRACKER_TAG.to_string()],
            items_handling: 0,
            uuid,
            slot_data: false,
        }
    }
}

/// Version tuple; serialized with the `class` marker the server expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct NetworkVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
}

impl Serialize for NetworkVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(4))?;
        map.serialize_entry("major", &self.major)?;
        map.serialize_entry("minor", &self.minor)?;
        map.serialize_entry("build", &self.build)?;
        map.serialize_entry("class", "Version")?;
        map.end()
    }
}

/// Catalog request; `None` asks for every game.
#[derive(Debug, Clone, Serialize)]
pub struct GetDataPackage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub games: Option<Vec<String>>,
}

/// Chat line sent to the room.
#[derive(Debug, Clone, Serialize)]
pub struct Say {
    pub text: String,
}

/// Serialize commands into one frame.
pub fn encode_frame(messages: &[ClientMessage]) -> Result<String> {
    Ok(serde_json::to_string(messages)?)
}

/// Split an inbound text frame into command objects.
///
/// Anything other than a JSON array of objects is a protocol violation.
pub fn decode_frame(text: &str) -> Result<Vec<serde_json::Value>> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| Error::ProtocolViolation(format!("frame is not JSON: {}", e)))?;
    let serde_json::Value::Array(items) = value else {
        return Err(Error::ProtocolViolation(
            "frame is not a JSON array".to_string(),
        ));
    };
    if let Some(bad) = items.iter().position(|item| !item.is_object()) {
        return Err(Error::ProtocolViolation(format!(
            "frame element {} is not an object",
            bad
        )));
    }
    Ok(items)
}

/// The `"cmd"` discriminator of an inbound command.
pub fn command_name(message: &serde_json::Value) -> Option<&str> {
    message.get("cmd").and_then(serde_json::Value::as_str)
}

// ============================================
// Server -> Client views
// ============================================

/// `NetworkSlot` from `Connected.slot_info`.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct NetworkSlot {
    pub name: String,
    pub game: String,
    #[serde(rename = "type")]
    pub kind: i64,
    pub group_members: Vec<SlotId>,
}

/// `NetworkPlayer` from `Connected.players` / `RoomUpdate.players`.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct NetworkPlayer {
    pub team: TeamId,
    pub slot: SlotId,
    pub alias: String,
    pub name: String,
    /// Client status; only some servers include it
    pub status: Option<i64>,
}

/// `NetworkItem` from item batches and `ItemSend` prints.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct NetworkItem {
    pub item: ItemId,
    pub location: LocationId,
    pub player: SlotId,
    pub flags: i64,
}

impl NetworkItem {
    pub fn flags(&self) -> ItemFlags {
        ItemFlags(self.flags)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Connected {
    pub team: TeamId,
    pub slot: Option<SlotId>,
    pub players: Vec<NetworkPlayer>,
    pub slot_info: HashMap<String, NetworkSlot>,
    pub checked_locations: Vec<LocationId>,
    pub missing_locations: Vec<LocationId>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ConnectionRefused {
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ReceivedItems {
    pub index: i64,
    pub items: Vec<NetworkItem>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LocationInfo {
    pub locations: Vec<NetworkItem>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RoomUpdate {
    pub players: Option<Vec<NetworkPlayer>>,
    pub checked_locations: Option<Vec<LocationId>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RoomInfo {
    pub seed_name: Option<String>,
    pub players: Option<Vec<serde_json::Value>>,
    pub games: Vec<String>,
}

/// One typed fragment of a `PrintJSON` message.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct JsonFragment {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub text: Option<String>,
    /// Owning slot for `item_id` / `location_id` fragments
    pub player: Option<SlotId>,
    pub flags: Option<i64>,
}

impl JsonFragment {
    pub fn kind(&self) -> &str {
        self.kind.as_deref().unwrap_or("text")
    }

    pub fn text(&self) -> &str {
        self.text.as_deref().unwrap_or_default()
    }

    /// Numeric payload of id fragments (`"12"` → 12).
    pub fn id(&self) -> Option<i64> {
        self.text().trim().parse().ok()
    }
}

/// `Print` / `PrintJSON`.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PrintJson {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub data: Vec<JsonFragment>,
    /// Legacy `Print` carries plain text instead of fragments
    pub text: Option<String>,
    pub slot: Option<SlotId>,
    pub receiving: Option<SlotId>,
    pub item: Option<NetworkItem>,
}

impl PrintJson {
    /// Fragments, with legacy `text` promoted to a single text fragment.
    pub fn fragments(&self) -> Vec<JsonFragment> {
        if !self.data.is_empty() {
            return self.data.clone();
        }
        match &self.text {
            Some(text) => vec![JsonFragment {
                text: Some(text.clone()),
                ..Default::default()
            }],
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_connect_frame_shape() {
        let frame = encode_frame(&[ClientMessage::Connect(Connect::tracker(
            Some("pw"),
            "abc".to_string(),
        ))])
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        let connect = &value[0];
        assert_eq!(connect["cmd"], "Connect");
        assert_eq!(connect["name"], TRACKER_NAME);
        assert_eq!(connect["password"], "pw");
        assert_eq!(connect["items_handling"], 0);
        assert_eq!(connect["tags"], json!(["Tracker"]));
        assert_eq!(connect["version"]["class"], "Version");
        assert_eq!(connect["version"]["minor"], 5);
        assert_eq!(connect["uuid"], "abc");
    }

    #[test]
    fn test_say_frame_shape() {
        let frame = encode_frame(&[ClientMessage::Say(Say {
            text: "!hint Hookshot".to_string(),
        })])
        .unwrap();
        assert_eq!(frame, r#"[{"cmd":"Say","text":"!hint Hookshot"}]"#);
    }

    #[test]
    fn test_get_data_package_omits_games_when_unscoped() {
        let all = encode_frame(&[ClientMessage::GetDataPackage(GetDataPackage { games: None })]).unwrap();
        assert_eq!(all, r#"[{"cmd":"GetDataPackage"}]"#);

        let scoped = encode_frame(&[ClientMessage::GetDataPackage(GetDataPackage {
            games: Some(vec!["Factorio".into()]),
        })])
        .unwrap();
        assert_eq!(scoped, r#"[{"cmd":"GetDataPackage","games":["Factorio"]}]"#);
    }

    #[test]
    fn test_decode_frame_rejects_non_arrays() {
        assert!(matches!(decode_frame("hello"), Err(Error::ProtocolViolation(_))));
        assert!(matches!(decode_frame(r#"{"cmd":"RoomInfo"}"#), Err(Error::ProtocolViolation(_))));
        assert!(matches!(decode_frame("[1, 2]"), Err(Error::ProtocolViolation(_))));

        let messages = decode_frame(r#"[{"cmd":"RoomInfo"},{"cmd":"Print","text":"hi"}]"#).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(command_name(&messages[1]), Some("Print"));
    }

    #[test]
    fn test_legacy_print_promotes_text() {
        let print: PrintJson = serde_json::from_value(json!({"cmd": "Print", "text": "hello"})).unwrap();
        let fragments = print.fragments();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].kind(), "text");
        assert_eq!(fragments[0].text(), "hello");
    }

    #[test]
    fn test_fragment_id_parsing() {
        let fragment: JsonFragment =
            serde_json::from_value(json!({"type": "item_id", "text": "77", "player": 2, "flags": 1})).unwrap();
        assert_eq!(fragment.id(), Some(77));
        assert_eq!(fragment.player, Some(2));
    }
}
