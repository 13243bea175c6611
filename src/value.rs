//! Host-side values exchanged with a session

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::session::{FunctionHandle, Handle, TableHandle};
use crate::vm;

/// Host mapping converted to and from VM tables.
pub type Map = BTreeMap<Key, Value>;

/// Keys a host map can carry. Tables keyed by anything else (floats with a
/// fractional part, tables, functions) lose those entries on conversion.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    Boolean(bool),
    Integer(i64),
    String(String),
}

impl Key {
    pub(crate) fn from_vm(value: &vm::Value) -> Option<Key> {
        match value {
            vm::Value::Boolean(b) => Some(Key::Boolean(*b)),
            vm::Value::Integer(i) => Some(Key::Integer(*i)),
            vm::Value::Number(f) => vm::value::float_to_integer(*f).map(Key::Integer),
            vm::Value::String(s) => Some(Key::String(s.to_string())),
            _ => None,
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::String(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::String(s)
    }
}

impl From<i64> for Key {
    fn from(i: i64) -> Self {
        Key::Integer(i)
    }
}

impl From<bool> for Key {
    fn from(b: bool) -> Self {
        Key::Boolean(b)
    }
}

impl From<Key> for Value {
    fn from(key: Key) -> Self {
        match key {
            Key::Boolean(b) => Value::Boolean(b),
            Key::Integer(i) => Value::Integer(i),
            Key::String(s) => Value::String(s),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Boolean(b) => write!(f, "{}", b),
            Key::Integer(i) => write!(f, "{}", i),
            Key::String(s) => write!(f, "{}", s),
        }
    }
}

/// A value on the host side of the bridge.
///
/// Tables and functions pulled from the VM arrive as handles; `Map` is a
/// plain host mapping that becomes a fresh VM table when pushed.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(String),
    Table(TableHandle),
    Function(FunctionHandle),
    Map(Map),
    /// Host data with no VM representation. Pushing it fails with `UnsupportedType`.
    Opaque(Rc<dyn Any>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Table(_) => "table",
            Value::Function(_) => "function",
            Value::Map(_) => "map",
            Value::Opaque(_) => "opaque",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer value, also accepting floats with an exact integer value.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Number(f) => vm::value::float_to_integer(*f),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Number(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&TableHandle> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionHandle> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// The handle behind a table or function value.
    pub fn into_handle(self) -> Option<Handle> {
        match self {
            Value::Table(t) => Some(t.into_handle()),
            Value::Function(f) => Some(f.into_handle()),
            _ => None,
        }
    }

    /// Convert to JSON. Table handles are converted eagerly; functions and
    /// opaque values have no JSON form.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        use serde_json::Value as Json;
        Ok(match self {
            Value::Nil => Json::Null,
            Value::Boolean(b) => Json::Bool(*b),
            Value::Integer(i) => Json::from(*i),
            Value::Number(f) => serde_json::Number::from_f64(*f).map_or(Json::Null, Json::Number),
            Value::String(s) => Json::String(s.clone()),
            Value::Table(t) => Value::Map(t.to_map()?).to_json()?,
            Value::Map(m) => map_to_json(m)?,
            Value::Function(_) | Value::Opaque(_) => {
                return Err(Error::UnsupportedType { type_name: self.type_name() });
            }
        })
    }
}

/// Maps keyed exactly `1..=n` become arrays, everything else an object.
fn map_to_json(map: &Map) -> Result<serde_json::Value> {
    let is_sequence = !map.is_empty()
        && map
            .keys()
            .enumerate()
            .all(|(i, k)| *k == Key::Integer(i as i64 + 1));
    if is_sequence {
        return map.values().map(Value::to_json).collect::<Result<Vec<_>>>().map(serde_json::Value::Array);
    }
    let mut object = serde_json::Map::new();
    for (k, v) in map {
        object.insert(k.to_string(), v.to_json()?);
    }
    Ok(serde_json::Value::Object(object))
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::Nil,
            Json::Bool(b) => Value::Boolean(b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Value::String(s),
            Json::Array(items) => Value::from(items.into_iter().map(Value::from).collect::<Vec<_>>()),
            Json::Object(fields) => {
                Value::Map(fields.into_iter().map(|(k, v)| (Key::String(k), Value::from(v))).collect())
            }
        }
    }
}

impl PartialEq for Value {
    /// Numbers compare by value across integer and float; handles compare
    /// by handle identity (see [`Handle::same_value`] for VM identity).
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Integer(i), Value::Number(f)) | (Value::Number(f), Value::Integer(i)) => {
                vm::value::float_to_integer(*f) == Some(*i)
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Opaque(a), Value::Opaque(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "Nil"),
            Value::Boolean(b) => write!(f, "Boolean({})", b),
            Value::Integer(i) => write!(f, "Integer({})", i),
            Value::Number(n) => write!(f, "Number({})", n),
            Value::String(s) => write!(f, "String({:?})", s),
            Value::Table(t) => write!(f, "{:?}", t),
            Value::Function(func) => write!(f, "{:?}", func),
            Value::Map(m) => f.debug_map().entries(m.iter()).finish(),
            Value::Opaque(_) => write!(f, "Opaque(..)"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Number(n) => write!(f, "{}", vm::value::format_float(*n)),
            Value::String(s) => write!(f, "{}", s),
            Value::Table(t) => write!(f, "{}", t.handle()),
            Value::Function(func) => write!(f, "{}", func.handle()),
            Value::Map(m) => {
                write!(f, "{{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} = {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::Opaque(_) => write!(f, "opaque"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Number(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<TableHandle> for Value {
    fn from(t: TableHandle) -> Self {
        Value::Table(t)
    }
}

impl From<FunctionHandle> for Value {
    fn from(f: FunctionHandle) -> Self {
        Value::Function(f)
    }
}

impl From<Map> for Value {
    fn from(m: Map) -> Self {
        Value::Map(m)
    }
}

/// A sequence becomes a map keyed `1..=n`.
impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Map(
            items
                .into_iter()
                .enumerate()
                .map(|(i, v)| (Key::Integer(i as i64 + 1), v))
                .collect(),
        )
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Nil, Into::into)
    }
}
