//! Hint records from the save file.
//!
//! Depending on how the server pickled them, hints arrive as named-tuple
//! placeholders, plain tuples/lists, or dicts. [`normalize`] folds all three
//! into [`HintRecord`]; nothing past this module sees the raw encodings.

use crate::savefile::Value;
use crate::types::{ItemFlags, ItemId, LocationId, SlotId};
use serde::Serialize;

/// Field order of the server's hint tuple.
const FIELDS: [&str; 8] = [
    "receiving_player",
    "finding_player",
    "location",
    "item",
    "found",
    "entrance",
    "item_flags",
    "status",
];

/// Status code of a hint (`HintStatus` on the server).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HintStatus {
    Unspecified,
    NoPriority,
    Avoid,
    Priority,
    Found,
    Other(i64),
}

impl HintStatus {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => HintStatus::Unspecified,
            10 => HintStatus::NoPriority,
            20 => HintStatus::Avoid,
            30 => HintStatus::Priority,
            40 => HintStatus::Found,
            other => HintStatus::Other(other),
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            HintStatus::Unspecified => 0,
            HintStatus::NoPriority => 10,
            HintStatus::Avoid => 20,
            HintStatus::Priority => 30,
            HintStatus::Found => 40,
            HintStatus::Other(code) => *code,
        }
    }
}

impl std::fmt::Display for HintStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HintStatus::Unspecified => write!(f, "unspecified"),
            HintStatus::NoPriority => write!(f, "no priority"),
            HintStatus::Avoid => write!(f, "avoid"),
            HintStatus::Priority => write!(f, "priority"),
            HintStatus::Found => write!(f, "found"),
            HintStatus::Other(code) => write!(f, "status {}", code),
        }
    }
}

/// Canonical hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HintRecord {
    pub receiving_player: SlotId,
    pub finding_player: SlotId,
    pub location: LocationId,
    pub item: ItemId,
    pub found: bool,
    pub entrance: String,
    pub item_flags: ItemFlags,
    pub status: HintStatus,
}

impl HintRecord {
    /// Whether `slot` asked for or is holding this hint.
    pub fn involves(&self, slot: SlotId) -> bool {
        self.receiving_player == slot || self.finding_player == slot
    }
}

/// Normalize one hint of any known encoding.
///
/// Returns `None` when the record lacks the four identifying fields.
pub fn normalize(raw: &Value) -> Option<HintRecord> {
    let fields = match raw {
        Value::Object(obj) => {
            // Named attributes win; positional constructor args fill the rest.
            let mut fields: Vec<Option<&Value>> = FIELDS.iter().map(|f| obj.get(f)).collect();
            for (slot, arg) in fields.iter_mut().zip(obj.args.iter()) {
                if slot.is_none() {
                    *slot = Some(arg);
                }
            }
            fields
        }
        Value::Tuple(items) | Value::List(items) => {
            if items.len() < 4 {
                return None;
            }
            FIELDS
                .iter()
                .enumerate()
                .map(|(i, _)| items.get(i))
                .collect()
        }
        Value::Dict(_) => FIELDS.iter().map(|f| raw.get(f)).collect(),
        _ => return None,
    };
    from_fields(&fields)
}

/// Normalize every hint in a sequence, skipping undecodable entries.
pub fn normalize_all(raw: &Value) -> Vec<HintRecord> {
    let Some(items) = raw.as_seq() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let record = normalize(item);
            if record.is_none() {
                tracing::debug!("Skipping hint with unrecognized shape");
            }
            record
        })
        .collect()
}

fn from_fields(fields: &[Option<&Value>]) -> Option<HintRecord> {
    let int = |i: usize| fields.get(i).copied().flatten().and_then(Value::as_i64);
    Some(HintRecord {
        receiving_player: int(0)?,
        finding_player: int(1)?,
        location: int(2)?,
        item: int(3)?,
        found: fields
            .get(4)
            .copied()
            .flatten()
            .and_then(Value::as_bool)
            .unwrap_or(false),
        entrance: fields
            .get(5)
            .copied()
            .flatten()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        item_flags: ItemFlags(int(6).unwrap_or(0)),
        status: HintStatus::from_code(int(7).unwrap_or(0)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::savefile::Instance;

    fn ints(values: &[i64]) -> Vec<Value> {
        values.iter().map(|v| Value::Int(*v)).collect()
    }

    fn status(code: i64) -> Value {
        let mut obj = Instance::new("NetUtils", "HintStatus");
        obj.args.push(Value::Int(code));
        Value::Object(Box::new(obj))
    }

    #[test]
    fn test_three_encodings_normalize_identically() {
        let mut positional = ints(&[1, 2, 300, 40]);
        positional.extend([
            Value::Bool(false),
            Value::Str(String::new()),
            Value::Int(1),
            status(30),
        ]);

        let mut object = Instance::new("NetUtils", "Hint");
        object.args = positional.clone();

        let dict = Value::Dict(
            FIELDS
                .iter()
                .zip(positional.iter())
                .map(|(k, v)| (Value::Str(k.to_string()), v.clone()))
                .collect(),
        );

        let from_tuple = normalize(&Value::Tuple(positional)).unwrap();
        let from_object = normalize(&Value::Object(Box::new(object))).unwrap();
        let from_dict = normalize(&dict).unwrap();

        assert_eq!(from_tuple, from_object);
        assert_eq!(from_tuple, from_dict);
        assert_eq!(from_tuple.status, HintStatus::Priority);
        assert!(from_tuple.item_flags.is_progression());
    }

    #[test]
    fn test_object_attributes_override_args() {
        let mut object = Instance::new("NetUtils", "Hint");
        object.args = ints(&[1, 2, 300, 40]);
        object.set("found", Value::Bool(true));
        let hint = normalize(&Value::Object(Box::new(object))).unwrap();
        assert!(hint.found);
        assert_eq!(hint.status, HintStatus::Unspecified);
    }

    #[test]
    fn test_short_records_are_rejected() {
        assert!(normalize(&Value::Tuple(ints(&[1, 2, 3]))).is_none());
        assert!(normalize(&Value::Int(4)).is_none());
        let set = Value::Set(vec![Value::Tuple(ints(&[1, 2, 3])), Value::Tuple(ints(&[1, 2, 3, 4]))]);
        assert_eq!(normalize_all(&set).len(), 1);
    }

    #[test]
    fn test_involves() {
        let hint = normalize(&Value::List(ints(&[1, 2, 3, 4]))).unwrap();
        assert!(hint.involves(1));
        assert!(hint.involves(2));
        assert!(!hint.involves(3));
    }
}
