use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::ast::FuncBody;

use super::interp::Scope;
use super::{State, VmError};

/// A native function: arguments sit at stack indices `1..=top`, results are
/// pushed and their count returned.
pub type NativeFn = Rc<dyn Fn(&State) -> Result<usize, VmError>>;

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(Rc<str>),
    Table(TableRef),
    Function(FunctionRef),
    /// Opaque host token; has no host-side conversion.
    LightUserData(usize),
}

/// VM type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    Nil,
    Boolean,
    Number,
    String,
    Table,
    Function,
    LightUserData,
}

impl Type {
    pub fn name(self) -> &'static str {
        match self {
            Type::Nil => "nil",
            Type::Boolean => "boolean",
            Type::Number => "number",
            Type::String => "string",
            Type::Table => "table",
            Type::Function => "function",
            Type::LightUserData => "userdata",
        }
    }
}

impl Value {
    pub fn string(s: &str) -> Value {
        Value::String(Rc::from(s))
    }

    pub fn type_of(&self) -> Type {
        match self {
            Value::Nil => Type::Nil,
            Value::Boolean(_) => Type::Boolean,
            Value::Integer(_) | Value::Number(_) => Type::Number,
            Value::String(_) => Type::String,
            Value::Table(_) => Type::Table,
            Value::Function(_) => Type::Function,
            Value::LightUserData(_) => Type::LightUserData,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_of().name()
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Everything except nil and false is true.
    pub fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Boolean(false))
    }

    /// Numeric value, coercing numeric strings.
    pub fn to_number(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Number(f) => Some(*f),
            Value::String(s) => match parse_number(s)? {
                Value::Integer(i) => Some(i as f64),
                Value::Number(f) => Some(f),
                _ => None,
            },
            _ => None,
        }
    }

    /// Integer value when exactly representable, coercing numeric strings.
    pub fn to_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Number(f) => float_to_integer(*f),
            Value::String(s) => parse_number(s).and_then(|v| v.to_integer()),
            _ => None,
        }
    }

    /// Arithmetic operand: numbers as-is, numeric strings converted.
    pub fn to_arith(&self) -> Option<Value> {
        match self {
            Value::Integer(_) | Value::Number(_) => Some(self.clone()),
            Value::String(s) => parse_number(s),
            _ => None,
        }
    }

    /// Primitive equality: numbers by value, strings by content, objects by identity.
    pub fn raw_equal(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Integer(a), Value::Number(b)) | (Value::Number(b), Value::Integer(a)) => {
                *a as f64 == *b && float_to_integer(*b) == Some(*a)
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => a.ptr_eq(b),
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            (Value::LightUserData(a), Value::LightUserData(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Number(n) => write!(f, "{}", format_float(*n)),
            Value::String(s) => write!(f, "{}", s),
            Value::Table(t) => write!(f, "table: {:#x}", t.addr()),
            Value::Function(func) => write!(f, "function: {:#x}", func.addr()),
            Value::LightUserData(p) => write!(f, "userdata: {:#x}", p),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{:?}", s),
            other => write!(f, "{}", other),
        }
    }
}

/// Floats always show a fractional part or exponent so they read back as floats.
pub fn format_float(n: f64) -> String {
    if n.is_nan() {
        return if n.is_sign_negative() { "-nan".into() } else { "nan".into() };
    }
    if n.is_infinite() {
        return if n > 0.0 { "inf".into() } else { "-inf".into() };
    }
    if n == n.trunc() && n.abs() < 1e16 {
        format!("{:.1}", n)
    } else {
        format!("{}", n)
    }
}

pub fn float_to_integer(f: f64) -> Option<i64> {
    // i64::MAX as f64 rounds up to 2^63, which is out of range.
    if f == f.trunc() && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

/// Parse a numeric string the way `tonumber` does (decimal, float, hex; surrounding space allowed).
pub fn parse_number(s: &str) -> Option<Value> {
    let s = s.trim();
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        let n = u64::from_str_radix(hex, 16).ok()? as i64;
        return Some(Value::Integer(if negative { n.wrapping_neg() } else { n }));
    }
    if digits.is_empty() || !digits.starts_with(|c: char| c.is_ascii_digit() || c == '.') {
        return None;
    }
    if let Ok(i) = s.parse::<i64>() {
        return Some(Value::Integer(i));
    }
    s.parse::<f64>().ok().filter(|f| !f.is_nan()).map(Value::Number)
}

// ── Tables ───────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct TableRef(Rc<RefCell<Table>>);

impl TableRef {
    pub fn new() -> Self {
        TableRef::default()
    }

    pub fn ptr_eq(&self, other: &TableRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    pub fn get(&self, key: &Value) -> Value {
        self.0.borrow().get(key)
    }

    pub fn get_str(&self, key: &str) -> Value {
        self.get(&Value::string(key))
    }

    /// Assigning nil removes the key. Fails for nil and NaN keys.
    pub fn set(&self, key: Value, value: Value) -> Result<(), VmError> {
        let key = normalize_key(key)?;
        // The replaced value is dropped only after the borrow is released.
        let old = self.0.borrow_mut().insert(key, value);
        drop(old);
        Ok(())
    }

    pub fn set_str(&self, key: &str, value: Value) {
        let old = self.0.borrow_mut().insert(Value::string(key), value);
        drop(old);
    }

    /// Entry after `key` in traversal order (`nil` starts the traversal).
    pub fn next(&self, key: &Value) -> Result<Option<(Value, Value)>, VmError> {
        self.0.borrow().next(key)
    }

    /// A border: `n` such that `t[n]` is non-nil and `t[n + 1]` is nil (0 if `t[1]` is nil).
    pub fn len(&self) -> i64 {
        let table = self.0.borrow();
        let mut n = 0;
        while !table.get(&Value::Integer(n + 1)).is_nil() {
            n += 1;
        }
        n
    }
}

/// Insertion-ordered hash table. Removed keys keep a nil tombstone so that
/// clearing fields during traversal does not break `next`.
#[derive(Default)]
pub struct Table {
    entries: Vec<(Value, Value)>,
    index: HashMap<KeyRepr, usize>,
    tombstones: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum KeyRepr {
    Boolean(bool),
    Integer(i64),
    Float(u64),
    String(Rc<str>),
    Object(usize),
    LightUserData(usize),
}

impl KeyRepr {
    fn of(key: &Value) -> Option<KeyRepr> {
        Some(match key {
            Value::Nil => return None,
            Value::Boolean(b) => KeyRepr::Boolean(*b),
            Value::Integer(i) => KeyRepr::Integer(*i),
            Value::Number(f) => match float_to_integer(*f) {
                Some(i) => KeyRepr::Integer(i),
                None if f.is_nan() => return None,
                None => KeyRepr::Float(f.to_bits()),
            },
            Value::String(s) => KeyRepr::String(s.clone()),
            Value::Table(t) => KeyRepr::Object(t.addr()),
            Value::Function(f) => KeyRepr::Object(f.addr()),
            Value::LightUserData(p) => KeyRepr::LightUserData(*p),
        })
    }
}

fn normalize_key(key: Value) -> Result<Value, VmError> {
    match key {
        Value::Nil => Err(VmError::runtime("table index is nil")),
        Value::Number(f) if f.is_nan() => Err(VmError::runtime("table index is NaN")),
        Value::Number(f) => Ok(float_to_integer(f).map_or(Value::Number(f), Value::Integer)),
        other => Ok(other),
    }
}

impl Table {
    fn get(&self, key: &Value) -> Value {
        KeyRepr::of(key)
            .and_then(|k| self.index.get(&k))
            .map(|&i| self.entries[i].1.clone())
            .unwrap_or_default()
    }

    /// Returns the previous value so the caller can drop it outside the borrow.
    fn insert(&mut self, key: Value, value: Value) -> Value {
        let Some(repr) = KeyRepr::of(&key) else { return value };
        if let Some(&i) = self.index.get(&repr) {
            let slot = &mut self.entries[i].1;
            match (slot.is_nil(), value.is_nil()) {
                (false, true) => self.tombstones += 1,
                (true, false) => self.tombstones -= 1,
                _ => {}
            }
            return std::mem::replace(slot, value);
        }
        if value.is_nil() {
            return Value::Nil;
        }
        if self.tombstones > 8 && self.tombstones * 2 > self.entries.len() {
            self.compact();
        }
        self.index.insert(repr, self.entries.len());
        self.entries.push((key, value));
        Value::Nil
    }

    fn compact(&mut self) {
        self.entries.retain(|(_, v)| !v.is_nil());
        self.index.clear();
        for (i, (k, _)) in self.entries.iter().enumerate() {
            if let Some(repr) = KeyRepr::of(k) {
                self.index.insert(repr, i);
            }
        }
        self.tombstones = 0;
    }

    fn next(&self, key: &Value) -> Result<Option<(Value, Value)>, VmError> {
        let start = match key {
            Value::Nil => 0,
            _ => match KeyRepr::of(key).and_then(|k| self.index.get(&k)) {
                Some(&i) => i + 1,
                None => return Err(VmError::runtime("invalid key to 'next'")),
            },
        };
        Ok(self.entries[start..]
            .iter()
            .find(|(_, v)| !v.is_nil())
            .map(|(k, v)| (k.clone(), v.clone())))
    }

    /// Empties the table, yielding the keys and values that own other objects.
    fn drain_composites(&mut self) -> impl Iterator<Item = Value> + use<> {
        self.index.clear();
        self.tombstones = 0;
        std::mem::take(&mut self.entries)
            .into_iter()
            .flat_map(|(k, v)| [k, v])
            .filter(|v| matches!(v, Value::Table(_) | Value::Function(_)))
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        if self.entries.iter().any(|(k, v)| is_composite(k) || is_composite(v)) {
            teardown(self.drain_composites().collect(), Vec::new());
        }
    }
}

fn is_composite(v: &Value) -> bool {
    matches!(v, Value::Table(_) | Value::Function(_))
}

/// Releases nested tables, closures and captured scopes from a worklist, so
/// that dropping a deeply nested structure uses constant stack.
fn teardown(mut values: Vec<Value>, mut scopes: Vec<Rc<Scope>>) {
    loop {
        if let Some(value) = values.pop() {
            match value {
                Value::Table(t) => {
                    if let Ok(cell) = Rc::try_unwrap(t.0) {
                        values.extend(cell.into_inner().drain_composites());
                    }
                }
                Value::Function(f) => {
                    if let Ok(Function::Script(mut closure)) = Rc::try_unwrap(f.0) {
                        scopes.extend(closure.scope.take());
                        values.push(Value::Table(std::mem::take(closure.env.get_mut())));
                    }
                }
                _ => {}
            }
        } else if let Some(scope) = scopes.pop() {
            if let Ok(scope) = Rc::try_unwrap(scope) {
                let (cells, parent) = scope.into_parts();
                scopes.extend(parent);
                values.extend(
                    cells
                        .into_iter()
                        .filter_map(|cell| Rc::try_unwrap(cell).ok())
                        .map(RefCell::into_inner)
                        .filter(is_composite),
                );
            }
        } else {
            break;
        }
    }
}

// ── Functions ────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct FunctionRef(Rc<Function>);

pub enum Function {
    Script(Closure),
    Native(NativeFn),
}

/// A script function plus the locals it captured and its global environment.
pub struct Closure {
    pub(crate) body: Rc<FuncBody>,
    pub(crate) scope: Option<Rc<Scope>>,
    pub(crate) env: RefCell<TableRef>,
}

impl Drop for Closure {
    fn drop(&mut self) {
        if let Some(scope) = self.scope.take() {
            teardown(Vec::new(), vec![scope]);
        }
    }
}

impl FunctionRef {
    pub fn script(body: Rc<FuncBody>, scope: Option<Rc<Scope>>, env: TableRef) -> Self {
        FunctionRef(Rc::new(Function::Script(Closure { body, scope, env: RefCell::new(env) })))
    }

    pub fn native(f: NativeFn) -> Self {
        FunctionRef(Rc::new(Function::Native(f)))
    }

    pub fn ptr_eq(&self, other: &FunctionRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    pub fn function(&self) -> &Function {
        &self.0
    }

    pub fn is_native(&self) -> bool {
        matches!(*self.0, Function::Native(_))
    }

    /// Environment of a script function; natives have none.
    pub fn environment(&self) -> Option<TableRef> {
        match &*self.0 {
            Function::Script(c) => Some(c.env.borrow().clone()),
            Function::Native(_) => None,
        }
    }

    /// Rebind the global environment. Returns false for natives.
    pub fn set_environment(&self, env: TableRef) -> bool {
        match &*self.0 {
            Function::Script(c) => {
                let old = c.env.replace(env);
                drop(old);
                true
            }
            Function::Native(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_keys_normalize_to_integers() {
        let t = TableRef::new();
        t.set(Value::Number(1.0), Value::string("one")).unwrap();
        assert_eq!(t.get(&Value::Integer(1)).to_string(), "one");
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn nil_and_nan_keys_rejected() {
        let t = TableRef::new();
        assert!(t.set(Value::Nil, Value::Integer(1)).is_err());
        assert!(t.set(Value::Number(f64::NAN), Value::Integer(1)).is_err());
        assert!(t.get(&Value::Nil).is_nil());
    }

    #[test]
    fn next_survives_clearing_during_traversal() {
        let t = TableRef::new();
        for i in 1..=5 {
            t.set(Value::Integer(i), Value::Integer(i * 10)).unwrap();
        }
        let mut key = Value::Nil;
        let mut seen = 0;
        while let Some((k, _)) = t.next(&key).unwrap() {
            t.set(k.clone(), Value::Nil).unwrap();
            key = k;
            seen += 1;
        }
        assert_eq!(seen, 5);
        assert!(t.next(&Value::Nil).unwrap().is_none());
    }

    #[test]
    fn next_rejects_unknown_key() {
        let t = TableRef::new();
        assert!(t.next(&Value::string("missing")).is_err());
    }

    #[test]
    fn compaction_keeps_live_entries() {
        let t = TableRef::new();
        for i in 0..40 {
            t.set(Value::Integer(i), Value::Integer(i)).unwrap();
        }
        for i in 0..30 {
            t.set(Value::Integer(i), Value::Nil).unwrap();
        }
        t.set_str("fresh", Value::Boolean(true));
        for i in 30..40 {
            assert_eq!(t.get(&Value::Integer(i)).to_integer(), Some(i));
        }
        assert!(t.get_str("fresh").truthy());
    }

    #[test]
    fn border_length() {
        let t = TableRef::new();
        assert_eq!(t.len(), 0);
        for i in 1..=3 {
            t.set(Value::Integer(i), Value::Boolean(true)).unwrap();
        }
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn raw_equality_mixes_int_and_float() {
        assert!(Value::Integer(3).raw_equal(&Value::Number(3.0)));
        assert!(!Value::Integer(3).raw_equal(&Value::Number(3.5)));
        assert!(Value::string("a").raw_equal(&Value::string("a")));
        let t = TableRef::new();
        assert!(Value::Table(t.clone()).raw_equal(&Value::Table(t)));
        assert!(!Value::Table(TableRef::new()).raw_equal(&Value::Table(TableRef::new())));
    }

    #[test]
    fn float_formatting() {
        assert_eq!(format_float(3.0), "3.0");
        assert_eq!(format_float(0.5), "0.5");
        assert_eq!(format_float(f64::INFINITY), "inf");
        assert_eq!(format_float(1e100), "1e100");
    }

    #[test]
    fn numeric_string_parsing() {
        assert!(matches!(parse_number(" 42 "), Some(Value::Integer(42))));
        assert!(matches!(parse_number("0x1F"), Some(Value::Integer(31))));
        assert!(matches!(parse_number("2.5"), Some(Value::Number(f)) if f == 2.5));
        assert!(parse_number("abc").is_none());
        assert!(parse_number("").is_none());
        assert!(parse_number("inf").is_none());
    }

    #[test]
    fn deeply_nested_tables_drop_without_recursion() {
        let mut t = TableRef::new();
        for _ in 0..200_000 {
            let outer = TableRef::new();
            outer.set(Value::Integer(1), Value::Table(t)).unwrap();
            t = outer;
        }
        drop(t);

        // nested through keys as well as values
        let mut t = TableRef::new();
        for _ in 0..200_000 {
            let outer = TableRef::new();
            outer.set(Value::Table(t), Value::Boolean(true)).unwrap();
            t = outer;
        }
        drop(t);
    }

    #[test]
    fn teardown_keeps_shared_tables_alive() {
        let shared = TableRef::new();
        shared.set_str("x", Value::Integer(7));
        let mut t = TableRef::new();
        for _ in 0..1000 {
            let outer = TableRef::new();
            outer.set(Value::Integer(1), Value::Table(t)).unwrap();
            outer.set(Value::Integer(2), Value::Table(shared.clone())).unwrap();
            t = outer;
        }
        drop(t);
        assert_eq!(shared.get_str("x").to_integer(), Some(7));
    }
}
