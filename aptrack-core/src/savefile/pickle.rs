//! Decoder for Python pickle streams (protocols 0-5).
//!
//! The save and multidata files are pickled object graphs that reference the
//! game server's own classes (`NetUtils.Hint`, `NetUtils.HintStatus`, ...).
//! Rebuilding those types is delegated to a [`TypeResolver`] strategy passed
//! in by the caller: [`TolerantResolver`] turns every unknown type into an
//! [`Instance`] placeholder, [`StrictResolver`] refuses them.
//!
//! Only structural damage (truncation, bad opcodes, stack underflow) is an
//! error for the tolerant strategy.

use super::value::{Instance, Value};
use crate::error::{Error, Result};
use std::collections::HashMap;

/// Strategy for turning a type reference plus constructor args into a value.
pub trait TypeResolver {
    fn resolve(&self, module: &str, name: &str, args: Vec<Value>) -> Result<Value>;
}

/// Rebuilds builtins; every other type becomes an attribute-bag placeholder.
#[derive(Debug, Default, Clone, Copy)]
pub struct TolerantResolver;

impl TypeResolver for TolerantResolver {
    fn resolve(&self, module: &str, name: &str, args: Vec<Value>) -> Result<Value> {
        match construct_builtin(module, name, args) {
            Ok(value) => Ok(value),
            Err(args) => {
                tracing::trace!(module, name, "Substituting placeholder for unresolved type");
                let mut instance = Instance::new(module, name);
                instance.args = args;
                Ok(Value::Object(Box::new(instance)))
            }
        }
    }
}

/// Rebuilds builtins only; an unknown type aborts the decode.
#[derive(Debug, Default, Clone, Copy)]
pub struct StrictResolver;

impl TypeResolver for StrictResolver {
    fn resolve(&self, module: &str, name: &str, args: Vec<Value>) -> Result<Value> {
        construct_builtin(module, name, args).map_err(|_| {
            Error::CorruptSnapshot(format!("unresolved type reference {}.{}", module, name))
        })
    }
}

/// Builtin containers and the helper callables pickle uses for them.
///
/// Hands the args back when the type is not a builtin.
fn construct_builtin(module: &str, name: &str, mut args: Vec<Value>) -> std::result::Result<Value, Vec<Value>> {
    let empty = || -> Vec<Value> { Vec::new() };
    let module = match module {
        "__builtin__" => "builtins",
        "copy_reg" => "copyreg",
        other => other,
    };
    let value = match (module, name) {
        ("builtins", "set") | ("builtins", "frozenset") => {
            Value::Set(take_seq(&mut args).unwrap_or_else(empty))
        }
        ("builtins", "list") => Value::List(take_seq(&mut args).unwrap_or_else(empty)),
        ("builtins", "tuple") => Value::Tuple(take_seq(&mut args).unwrap_or_else(empty)),
        ("builtins", "dict") | ("collections", "OrderedDict") => {
            match args.into_iter().next() {
                Some(Value::Dict(entries)) => Value::Dict(entries),
                Some(Value::List(pairs)) | Some(Value::Tuple(pairs)) => Value::Dict(
                    pairs
                        .into_iter()
                        .filter_map(|pair| match pair {
                            Value::Tuple(mut kv) | Value::List(mut kv) if kv.len() == 2 => {
                                let v = kv.pop()?;
                                let k = kv.pop()?;
                                Some((k, v))
                            }
                            _ => None,
                        })
                        .collect(),
                ),
                _ => Value::Dict(Vec::new()),
            }
        }
        // The first arg is the default factory; contents arrive via SETITEMS.
        ("collections", "defaultdict") | ("collections", "Counter") => Value::Dict(Vec::new()),
        ("builtins", "bytearray") | ("_codecs", "encode") => match args.into_iter().next() {
            Some(Value::Bytes(b)) => Value::Bytes(b),
            // Python 2 style byte strings are latin-1 text.
            Some(Value::Str(s)) => Value::Bytes(s.chars().map(|c| c as u32 as u8).collect()),
            _ => Value::Bytes(Vec::new()),
        },
        ("builtins", "bytes") => match args.into_iter().next() {
            Some(Value::Bytes(b)) => Value::Bytes(b),
            _ => Value::Bytes(Vec::new()),
        },
        ("builtins", "int") => args.into_iter().next().unwrap_or(Value::Int(0)),
        ("builtins", "float") => args.into_iter().next().unwrap_or(Value::Float(0.0)),
        ("builtins", "str") => args
            .into_iter()
            .next()
            .unwrap_or_else(|| Value::Str(String::new())),
        ("builtins", "bool") => Value::Bool(
            args.into_iter()
                .next()
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        ),
        _ => return Err(args),
    };
    Ok(value)
}

fn take_seq(args: &mut Vec<Value>) -> Option<Vec<Value>> {
    if args.is_empty() {
        return None;
    }
    match args.remove(0) {
        Value::List(v) | Value::Tuple(v) | Value::Set(v) => Some(v),
        _ => None,
    }
}

/// Decode a complete pickle stream with the given resolver.
pub fn from_slice(data: &[u8], resolver: &dyn TypeResolver) -> Result<Value> {
    Machine::new(data, resolver).run()
}

mod op {
    pub const MARK: u8 = b'(';
    pub const STOP: u8 = b'.';
    pub const POP: u8 = b'0';
    pub const POP_MARK: u8 = b'1';
    pub const DUP: u8 = b'2';
    pub const FLOAT: u8 = b'F';
    pub const INT: u8 = b'I';
    pub const BININT: u8 = b'J';
    pub const BININT1: u8 = b'K';
    pub const LONG: u8 = b'L';
    pub const BININT2: u8 = b'M';
    pub const NONE: u8 = b'N';
    pub const PERSID: u8 = b'P';
    pub const BINPERSID: u8 = b'Q';
    pub const REDUCE: u8 = b'R';
    pub const STRING: u8 = b'S';
    pub const BINSTRING: u8 = b'T';
    pub const SHORT_BINSTRING: u8 = b'U';
    pub const UNICODE: u8 = b'V';
    pub const BINUNICODE: u8 = b'X';
    pub const APPEND: u8 = b'a';
    pub const BUILD: u8 = b'b';
    pub const GLOBAL: u8 = b'c';
    pub const DICT: u8 = b'd';
    pub const EMPTY_DICT: u8 = b'}';
    pub const APPENDS: u8 = b'e';
    pub const GET: u8 = b'g';
    pub const BINGET: u8 = b'h';
    pub const INST: u8 = b'i';
    pub const LONG_BINGET: u8 = b'j';
    pub const LIST: u8 = b'l';
    pub const EMPTY_LIST: u8 = b']';
    pub const OBJ: u8 = b'o';
    pub const PUT: u8 = b'p';
    pub const BINPUT: u8 = b'q';
    pub const LONG_BINPUT: u8 = b'r';
    pub const SETITEM: u8 = b's';
    pub const TUPLE: u8 = b't';
    pub const EMPTY_TUPLE: u8 = b')';
    pub const SETITEMS: u8 = b'u';
    pub const BINFLOAT: u8 = b'G';
    pub const PROTO: u8 = 0x80;
    pub const NEWOBJ: u8 = 0x81;
    pub const EXT1: u8 = 0x82;
    pub const EXT2: u8 = 0x83;
    pub const EXT4: u8 = 0x84;
    pub const TUPLE1: u8 = 0x85;
    pub const TUPLE2: u8 = 0x86;
    pub const TUPLE3: u8 = 0x87;
    pub const NEWTRUE: u8 = 0x88;
    pub const NEWFALSE: u8 = 0x89;
    pub const LONG1: u8 = 0x8a;
    pub const LONG4: u8 = 0x8b;
    pub const BINBYTES: u8 = b'B';
    pub const SHORT_BINBYTES: u8 = b'C';
    pub const SHORT_BINUNICODE: u8 = 0x8c;
    pub const BINUNICODE8: u8 = 0x8d;
    pub const BINBYTES8: u8 = 0x8e;
    pub const EMPTY_SET: u8 = 0x8f;
    pub const ADDITEMS: u8 = 0x90;
    pub const FROZENSET: u8 = 0x91;
    pub const NEWOBJ_EX: u8 = 0x92;
    pub const STACK_GLOBAL: u8 = 0x93;
    pub const MEMOIZE: u8 = 0x94;
    pub const FRAME: u8 = 0x95;
    pub const BYTEARRAY8: u8 = 0x96;
}

/// Stack slot; `memo` links a value to the memo entry it must stay in sync with.
struct Entry {
    value: Value,
    memo: Option<u32>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self { value, memo: None }
    }
}

struct Machine<'a> {
    data: &'a [u8],
    pos: usize,
    stack: Vec<Entry>,
    marks: Vec<usize>,
    memo: HashMap<u32, Value>,
    resolver: &'a dyn TypeResolver,
}

impl<'a> Machine<'a> {
    fn new(data: &'a [u8], resolver: &'a dyn TypeResolver) -> Self {
        Self {
            data,
            pos: 0,
            stack: Vec::new(),
            marks: Vec::new(),
            memo: HashMap::new(),
            resolver,
        }
    }

    fn corrupt(&self, message: impl std::fmt::Display) -> Error {
        Error::CorruptSnapshot(format!("{} at byte {}", message, self.pos))
    }

    // ---------- input ----------

    fn read_u8(&mut self) -> Result<u8> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or_else(|| self.corrupt("unexpected end of stream"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| self.corrupt(format!("truncated {}-byte payload", len)))?;
        let data: &'a [u8] = self.data;
        let slice = &data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    fn read_line(&mut self) -> Result<&'a str> {
        let data: &'a [u8] = self.data;
        let rest = &data[self.pos..];
        let newline = rest
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| self.corrupt("unterminated text argument"))?;
        let line = &rest[..newline];
        self.pos += newline + 1;
        std::str::from_utf8(line).map_err(|_| self.corrupt("text argument is not UTF-8"))
    }

    fn read_len(&mut self, width: usize) -> Result<usize> {
        let len = match width {
            1 => u64::from(self.read_u8()?),
            4 => u64::from(u32::from_le_bytes(self.read_array::<4>()?)),
            _ => u64::from_le_bytes(self.read_array::<8>()?),
        };
        usize::try_from(len).map_err(|_| self.corrupt("length does not fit in memory"))
    }

    // ---------- stack ----------

    fn push(&mut self, value: Value) {
        self.stack.push(Entry::new(value));
    }

    fn pop(&mut self) -> Result<Value> {
        match self.stack.pop() {
            Some(entry) => Ok(entry.value),
            None => Err(self.corrupt("stack underflow")),
        }
    }

    fn top_mut(&mut self) -> Result<&mut Entry> {
        let pos = self.pos;
        self.stack
            .last_mut()
            .ok_or_else(|| Error::CorruptSnapshot(format!("stack underflow at byte {}", pos)))
    }

    fn pop_mark(&mut self) -> Result<Vec<Value>> {
        let mark = self
            .marks
            .pop()
            .ok_or_else(|| self.corrupt("MARK missing"))?;
        if mark > self.stack.len() {
            return Err(self.corrupt("MARK beyond stack"));
        }
        Ok(self.stack.drain(mark..).map(|e| e.value).collect())
    }

    /// Re-copy a mutated memoized value so later GETs see the full container.
    fn sync_top(&mut self) {
        if let Some(entry) = self.stack.last() {
            if let Some(id) = entry.memo {
                self.memo.insert(id, entry.value.clone());
            }
        }
    }

    fn memoize(&mut self, id: u32) -> Result<()> {
        let entry = self.top_mut()?;
        entry.memo = Some(id);
        let value = entry.value.clone();
        self.memo.insert(id, value);
        Ok(())
    }

    fn get(&mut self, id: u32) -> Result<()> {
        let value = self
            .memo
            .get(&id)
            .cloned()
            .ok_or_else(|| self.corrupt(format!("memo key {} missing", id)))?;
        self.stack.push(Entry {
            value,
            memo: Some(id),
        });
        Ok(())
    }

    // ---------- object construction ----------

    fn call(&mut self, callable: Value, args: Vec<Value>) -> Result<Value> {
        let Value::Class { module, name } = callable else {
            return Err(self.corrupt("call target is not a type reference"));
        };
        if module.as_str() == "copyreg" || module.as_str() == "copy_reg" {
            if name == "_reconstructor" {
                // copyreg._reconstructor(cls, base, state)
                let mut args = args.into_iter();
                if let Some(Value::Class { module, name }) = args.next() {
                    return self.resolver.resolve(&module, &name, Vec::new());
                }
                return Err(self.corrupt("_reconstructor without a class"));
            }
            if name == "__newobj__" {
                let mut args = args.into_iter();
                if let Some(Value::Class { module, name }) = args.next() {
                    return self.resolver.resolve(&module, &name, args.collect());
                }
                return Err(self.corrupt("__newobj__ without a class"));
            }
        }
        self.resolver.resolve(&module, &name, args)
    }

    fn build(&mut self, state: Value) -> Result<()> {
        let entry = self.top_mut()?;
        match &mut entry.value {
            Value::Object(obj) => {
                let (dict_state, slot_state) = match state {
                    Value::Tuple(mut parts) if parts.len() == 2 => {
                        let slots = parts.pop();
                        (parts.pop(), slots)
                    }
                    other => (Some(other), None),
                };
                for part in [dict_state, slot_state].into_iter().flatten() {
                    match part {
                        Value::Dict(entries) => {
                            for (key, value) in entries {
                                match key {
                                    Value::Str(key) => obj.set(key, value),
                                    other => obj.entries.push((other, value)),
                                }
                            }
                        }
                        Value::None => {}
                        other => obj.set("__state__", other),
                    }
                }
            }
            Value::Set(items) => {
                if let Value::Set(extra) | Value::List(extra) = state {
                    items.extend(extra);
                }
            }
            Value::Dict(entries) => {
                if let Value::Dict(extra) = state {
                    entries.extend(extra);
                }
            }
            _ => {
                tracing::trace!("Ignoring BUILD state for non-object value");
            }
        }
        self.sync_top();
        Ok(())
    }

    fn append(&mut self, items: Vec<Value>) -> Result<()> {
        let pos = self.pos;
        let entry = self.top_mut()?;
        match &mut entry.value {
            Value::List(list) => list.extend(items),
            Value::Set(set) => set.extend(items),
            Value::Object(obj) => obj.items.extend(items),
            _ => {
                return Err(Error::CorruptSnapshot(format!(
                    "APPEND target is not a list at byte {}",
                    pos
                )))
            }
        }
        self.sync_top();
        Ok(())
    }

    fn set_items(&mut self, pairs: Vec<Value>) -> Result<()> {
        if pairs.len() % 2 != 0 {
            return Err(self.corrupt("odd number of SETITEMS arguments"));
        }
        let mut kv = Vec::with_capacity(pairs.len() / 2);
        let mut iter = pairs.into_iter();
        while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
            kv.push((k, v));
        }
        let pos = self.pos;
        let entry = self.top_mut()?;
        match &mut entry.value {
            Value::Dict(entries) => entries.extend(kv),
            Value::Object(obj) => obj.entries.extend(kv),
            _ => {
                return Err(Error::CorruptSnapshot(format!(
                    "SETITEM target is not a dict at byte {}",
                    pos
                )))
            }
        }
        self.sync_top();
        Ok(())
    }

    fn placeholder(&self, module: &str, name: String, args: Vec<Value>) -> Result<Value> {
        self.resolver.resolve(module, &name, args)
    }

    // ---------- main loop ----------

    fn run(mut self) -> Result<Value> {
        loop {
            let opcode = self.read_u8()?;
            match opcode {
                op::PROTO => {
                    let proto = self.read_u8()?;
                    if proto > 5 {
                        return Err(self.corrupt(format!("unsupported protocol {}", proto)));
                    }
                }
                op::FRAME => {
                    self.read_array::<8>()?;
                }
                op::STOP => return self.pop(),
                op::MARK => self.marks.push(self.stack.len()),
                op::POP => {
                    // POP also discards an open MARK when nothing was pushed after it.
                    if self.marks.last() == Some(&self.stack.len()) {
                        self.marks.pop();
                    } else {
                        self.pop()?;
                    }
                }
                op::POP_MARK => {
                    self.pop_mark()?;
                }
                op::DUP => {
                    let value = self.top_mut()?.value.clone();
                    self.push(value);
                }

                // ----- scalars -----
                op::NONE => self.push(Value::None),
                op::NEWTRUE => self.push(Value::Bool(true)),
                op::NEWFALSE => self.push(Value::Bool(false)),
                op::BININT => {
                    let v = i32::from_le_bytes(self.read_array::<4>()?);
                    self.push(Value::Int(i64::from(v)));
                }
                op::BININT1 => {
                    let v = self.read_u8()?;
                    self.push(Value::Int(i64::from(v)));
                }
                op::BININT2 => {
                    let v = u16::from_le_bytes(self.read_array::<2>()?);
                    self.push(Value::Int(i64::from(v)));
                }
                op::INT => {
                    let line = self.read_line()?;
                    let value = match line {
                        "00" => Value::Bool(false),
                        "01" => Value::Bool(true),
                        text => Value::Int(
                            text.trim()
                                .parse()
                                .map_err(|_| self.corrupt(format!("bad INT literal {:?}", text)))?,
                        ),
                    };
                    self.push(value);
                }
                op::LONG => {
                    let line = self.read_line()?;
                    let digits = line.trim_end_matches('L');
                    let value = digits
                        .parse::<i64>()
                        .map(Value::Int)
                        .unwrap_or_else(|_| Value::BigInt(digits.as_bytes().to_vec()));
                    self.push(value);
                }
                op::LONG1 => {
                    let len = self.read_len(1)?;
                    let bytes = self.read_bytes(len)?;
                    self.push(decode_long(bytes));
                }
                op::LONG4 => {
                    let len = self.read_len(4)?;
                    let bytes = self.read_bytes(len)?;
                    self.push(decode_long(bytes));
                }
                op::BINFLOAT => {
                    let v = f64::from_be_bytes(self.read_array::<8>()?);
                    self.push(Value::Float(v));
                }
                op::FLOAT => {
                    let line = self.read_line()?;
                    let v = line
                        .trim()
                        .parse()
                        .map_err(|_| self.corrupt(format!("bad FLOAT literal {:?}", line)))?;
                    self.push(Value::Float(v));
                }

                // ----- strings and bytes -----
                op::BINUNICODE | op::SHORT_BINUNICODE | op::BINUNICODE8 => {
                    let width = match opcode {
                        op::SHORT_BINUNICODE => 1,
                        op::BINUNICODE => 4,
                        _ => 8,
                    };
                    let len = self.read_len(width)?;
                    let bytes = self.read_bytes(len)?;
                    self.push(Value::Str(String::from_utf8_lossy(bytes).into_owned()));
                }
                op::UNICODE => {
                    let line = self.read_line()?;
                    self.push(Value::Str(line.to_string()));
                }
                op::BINBYTES | op::SHORT_BINBYTES | op::BINBYTES8 | op::BYTEARRAY8 => {
                    let width = match opcode {
                        op::SHORT_BINBYTES => 1,
                        op::BINBYTES => 4,
                        _ => 8,
                    };
                    let len = self.read_len(width)?;
                    let bytes = self.read_bytes(len)?;
                    self.push(Value::Bytes(bytes.to_vec()));
                }
                op::BINSTRING | op::SHORT_BINSTRING => {
                    let width = if opcode == op::SHORT_BINSTRING { 1 } else { 4 };
                    let len = self.read_len(width)?;
                    let bytes = self.read_bytes(len)?;
                    self.push(Value::Str(String::from_utf8_lossy(bytes).into_owned()));
                }
                op::STRING => {
                    let line = self.read_line()?;
                    let unquoted = line
                        .strip_prefix('\'')
                        .and_then(|s| s.strip_suffix('\''))
                        .or_else(|| line.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
                        .ok_or_else(|| self.corrupt("unquoted STRING literal"))?;
                    self.push(Value::Str(unquoted.to_string()));
                }

                // ----- containers -----
                op::EMPTY_LIST => self.push(Value::List(Vec::new())),
                op::EMPTY_TUPLE => self.push(Value::Tuple(Vec::new())),
                op::EMPTY_DICT => self.push(Value::Dict(Vec::new())),
                op::EMPTY_SET => self.push(Value::Set(Vec::new())),
                op::LIST => {
                    let items = self.pop_mark()?;
                    self.push(Value::List(items));
                }
                op::TUPLE => {
                    let items = self.pop_mark()?;
                    self.push(Value::Tuple(items));
                }
                op::TUPLE1 | op::TUPLE2 | op::TUPLE3 => {
                    let n = usize::from(opcode - op::TUPLE1 + 1);
                    if self.stack.len() < n {
                        return Err(self.corrupt("stack underflow"));
                    }
                    let start = self.stack.len() - n;
                    let items = self.stack.drain(start..).map(|e| e.value).collect();
                    self.push(Value::Tuple(items));
                }
                op::DICT => {
                    let items = self.pop_mark()?;
                    self.push(Value::Dict(Vec::new()));
                    self.set_items(items)?;
                }
                op::FROZENSET => {
                    let items = self.pop_mark()?;
                    self.push(Value::Set(items));
                }
                op::APPEND => {
                    let item = self.pop()?;
                    self.append(vec![item])?;
                }
                op::APPENDS | op::ADDITEMS => {
                    let items = self.pop_mark()?;
                    self.append(items)?;
                }
                op::SETITEM => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    self.set_items(vec![key, value])?;
                }
                op::SETITEMS => {
                    let items = self.pop_mark()?;
                    self.set_items(items)?;
                }

                // ----- memo -----
                op::PUT => {
                    let line = self.read_line()?;
                    let id = line
                        .trim()
                        .parse()
                        .map_err(|_| self.corrupt("bad PUT index"))?;
                    self.memoize(id)?;
                }
                op::BINPUT => {
                    let id = u32::from(self.read_u8()?);
                    self.memoize(id)?;
                }
                op::LONG_BINPUT => {
                    let id = u32::from_le_bytes(self.read_array::<4>()?);
                    self.memoize(id)?;
                }
                op::MEMOIZE => {
                    let id = u32::try_from(self.memo.len())
                        .map_err(|_| self.corrupt("memo overflow"))?;
                    self.memoize(id)?;
                }
                op::GET => {
                    let line = self.read_line()?;
                    let id = line
                        .trim()
                        .parse()
                        .map_err(|_| self.corrupt("bad GET index"))?;
                    self.get(id)?;
                }
                op::BINGET => {
                    let id = u32::from(self.read_u8()?);
                    self.get(id)?;
                }
                op::LONG_BINGET => {
                    let id = u32::from_le_bytes(self.read_array::<4>()?);
                    self.get(id)?;
                }

                // ----- types and instances -----
                op::GLOBAL => {
                    let module = self.read_line()?.to_string();
                    let name = self.read_line()?.to_string();
                    self.push(Value::Class { module, name });
                }
                op::STACK_GLOBAL => {
                    let name = self.pop()?;
                    let module = self.pop()?;
                    match (module, name) {
                        (Value::Str(module), Value::Str(name)) => {
                            self.push(Value::Class { module, name })
                        }
                        _ => return Err(self.corrupt("STACK_GLOBAL needs two strings")),
                    }
                }
                op::REDUCE => {
                    let args = self.pop()?;
                    let callable = self.pop()?;
                    let args = match args {
                        Value::Tuple(args) => args,
                        Value::None => Vec::new(),
                        _ => return Err(self.corrupt("REDUCE args are not a tuple")),
                    };
                    let value = self.call(callable, args)?;
                    self.push(value);
                }
                op::NEWOBJ => {
                    let args = self.pop()?;
                    let class = self.pop()?;
                    let args = match args {
                        Value::Tuple(args) => args,
                        _ => return Err(self.corrupt("NEWOBJ args are not a tuple")),
                    };
                    let value = self.call(class, args)?;
                    self.push(value);
                }
                op::NEWOBJ_EX => {
                    let kwargs = self.pop()?;
                    let args = self.pop()?;
                    let class = self.pop()?;
                    let mut args = match args {
                        Value::Tuple(args) => args,
                        _ => return Err(self.corrupt("NEWOBJ_EX args are not a tuple")),
                    };
                    if !matches!(&kwargs, Value::Dict(entries) if entries.is_empty()) {
                        args.push(kwargs);
                    }
                    let value = self.call(class, args)?;
                    self.push(value);
                }
                op::OBJ => {
                    let mut items = self.pop_mark()?.into_iter();
                    let class = items
                        .next()
                        .ok_or_else(|| self.corrupt("OBJ without a class"))?;
                    let value = self.call(class, items.collect())?;
                    self.push(value);
                }
                op::INST => {
                    let module = self.read_line()?.to_string();
                    let name = self.read_line()?.to_string();
                    let args = self.pop_mark()?;
                    let value = self.call(Value::Class { module, name }, args)?;
                    self.push(value);
                }
                op::BUILD => {
                    let state = self.pop()?;
                    self.build(state)?;
                }

                // ----- references we cannot follow -----
                op::PERSID => {
                    let id = self.read_line()?.to_string();
                    let value = self.placeholder("persistent", id, Vec::new())?;
                    self.push(value);
                }
                op::BINPERSID => {
                    let id = self.pop()?;
                    let value = self.placeholder("persistent", "id".to_string(), vec![id])?;
                    self.push(value);
                }
                op::EXT1 | op::EXT2 | op::EXT4 => {
                    let code = match opcode {
                        op::EXT1 => u32::from(self.read_u8()?),
                        op::EXT2 => u32::from(u16::from_le_bytes(self.read_array::<2>()?)),
                        _ => u32::from_le_bytes(self.read_array::<4>()?),
                    };
                    self.push(Value::Class {
                        module: "copyreg.extension".to_string(),
                        name: code.to_string(),
                    });
                }
                other => {
                    return Err(self.corrupt(format!("unknown opcode 0x{:02x}", other)));
                }
            }
        }
    }
}

/// Two's complement little-endian integer of arbitrary width.
fn decode_long(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Int(0);
    }
    if bytes.len() > 8 {
        return Value::BigInt(bytes.to_vec());
    }
    let negative = bytes[bytes.len() - 1] & 0x80 != 0;
    let mut buf = if negative { [0xffu8; 8] } else { [0u8; 8] };
    buf[..bytes.len()].copy_from_slice(bytes);
    Value::Int(i64::from_le_bytes(buf))
}
