//! Decoded object graph of a save file.

use std::collections::BTreeMap;

/// A value from the serialized object graph.
///
/// Sets and dicts keep insertion order and compare structurally; the graphs
/// are small enough that linear lookups are fine.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    /// Integer wider than 64 bits, two's complement little-endian
    BigInt(Vec<u8>),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Set(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    /// Reference to a type or callable by qualified name
    Class { module: String, name: String },
    /// Instance of a type the resolver could not (or chose not to) rebuild
    Object(Box<Instance>),
}

/// Placeholder for an instance of an unresolved type.
///
/// Behaves like an attribute bag: constructor arguments are kept positionally,
/// `BUILD` state lands in `attrs`, and container-style mutations are captured
/// in `items` / `entries` so nothing in the stream is lost.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Instance {
    pub module: String,
    pub name: String,
    pub args: Vec<Value>,
    pub attrs: BTreeMap<String, Value>,
    pub items: Vec<Value>,
    pub entries: Vec<(Value, Value)>,
}

impl Instance {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Qualified name, e.g. `NetUtils.Hint`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.module, self.name)
    }

    pub fn get(&self, attr: &str) -> Option<&Value> {
        self.attrs.get(attr)
    }

    pub fn set(&mut self, attr: impl Into<String>, value: Value) {
        self.attrs.insert(attr.into(), value);
    }

    pub fn contains(&self, attr: &str) -> bool {
        self.attrs.contains_key(attr)
    }

    /// Size as a container: captured items/entries, else constructor args.
    pub fn len(&self) -> usize {
        if !self.items.is_empty() {
            self.items.len()
        } else if !self.entries.is_empty() {
            self.entries.len()
        } else {
            self.args.len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            // Int-valued enums arrive as `Enum(value)` placeholders.
            Value::Object(obj) => match obj.args.as_slice() {
                [single] => single.as_i64(),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            Value::None => Some(false),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Elements of any sequence-like value (list, tuple, set, frozen set).
    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Value::List(v) | Value::Tuple(v) | Value::Set(v) => Some(v),
            Value::Object(obj) if !obj.items.is_empty() => Some(&obj.items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Dict(entries) => Some(entries),
            // Dict subclasses (defaultdict, Counter, ...) end up as placeholders.
            Value::Object(obj) if !obj.entries.is_empty() => Some(&obj.entries),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Instance> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Look up a string key in a dict-like value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(obj) => obj
                .get(key)
                .or_else(|| lookup(&obj.entries, key)),
            _ => self.as_dict().and_then(|entries| lookup(entries, key)),
        }
    }

    /// Look up an arbitrary key in a dict-like value.
    pub fn get_value(&self, key: &Value) -> Option<&Value> {
        self.as_dict()
            .and_then(|entries| entries.iter().find(|(k, _)| k == key).map(|(_, v)| v))
    }

    /// `(a, b)` integer pair, as used for `(team, slot)` keys.
    pub fn as_int_pair(&self) -> Option<(i64, i64)> {
        match self.as_seq()? {
            [a, b, ..] => Some((a.as_i64()?, b.as_i64()?)),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }
}

fn lookup<'a>(entries: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    entries
        .iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}
