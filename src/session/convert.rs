use crate::error::{Error, Result};
use crate::value::{Key, Map, Value};
use crate::vm::{self, Type};

use super::handle::{FunctionHandle, HandleKind, TableHandle};
use super::Session;

/// Moves single values between a session's VM stack and the host.
///
/// Pulling a table or function pins it in the registry and yields a new
/// handle; nothing is recursed into. Pushing a host [`Map`] builds a fresh
/// VM table recursively.
pub struct ValueConverter<'s> {
    session: &'s Session,
}

impl<'s> ValueConverter<'s> {
    pub(crate) fn new(session: &'s Session) -> Self {
        ValueConverter { session }
    }

    /// Convert the slot at `idx` without popping it. Types with no host
    /// counterpart come back as nil.
    pub fn from_stack(&self, idx: i32) -> Value {
        let state = self.session.state();
        match state.value_at(idx) {
            vm::Value::Nil => Value::Nil,
            vm::Value::Boolean(b) => Value::Boolean(b),
            vm::Value::Integer(i) => Value::Integer(i),
            vm::Value::Number(n) => Value::Number(n),
            vm::Value::String(s) => Value::String(s.to_string()),
            vm::Value::Table(_) => Value::Table(TableHandle(self.pin(idx, HandleKind::Table))),
            vm::Value::Function(_) => Value::Function(FunctionHandle(self.pin(idx, HandleKind::Function))),
            vm::Value::LightUserData(_) => {
                tracing::debug!(idx, "light userdata has no host form, reading as nil");
                Value::Nil
            }
        }
    }

    fn pin(&self, idx: i32, kind: HandleKind) -> super::Handle {
        let state = self.session.state();
        state.push_value(idx);
        let key = state.reference();
        self.session.adopt(key, kind)
    }

    /// Push one host value. On failure nothing is pushed.
    pub fn to_stack(&self, value: &Value) -> Result<()> {
        self.check(value)?;
        let state = self.session.state();
        let top = state.top();
        let pushed = self.push_checked(value);
        if pushed.is_err() {
            state.set_top(top);
        }
        pushed
    }

    /// Reject foreign, dead, and unsupported values before the VM is touched.
    pub(crate) fn check(&self, value: &Value) -> Result<()> {
        match value {
            Value::Table(h) => self.session.check_handle(h),
            Value::Function(h) => self.session.check_handle(h),
            Value::Map(m) => m.values().try_for_each(|v| self.check(v)),
            Value::Opaque(_) => Err(Error::UnsupportedType { type_name: value.type_name() }),
            _ => Ok(()),
        }
    }

    /// Push a value that already passed [`ValueConverter::check`].
    pub(crate) fn push_checked(&self, value: &Value) -> Result<()> {
        let state = self.session.state();
        match value {
            Value::Nil => state.push(vm::Value::Nil),
            Value::Boolean(b) => state.push(vm::Value::Boolean(*b)),
            Value::Integer(i) => state.push(vm::Value::Integer(*i)),
            Value::Number(n) => state.push(vm::Value::Number(*n)),
            Value::String(s) => state.push(vm::Value::string(s)),
            Value::Table(h) => state.push_reference(h.registry_key()),
            Value::Function(h) => state.push_reference(h.registry_key()),
            Value::Map(map) => {
                state.new_table();
                for (k, v) in map {
                    self.push_checked(&Value::from(k.clone()))?;
                    self.push_checked(v)?;
                    state.set_table(-3)?;
                }
            }
            Value::Opaque(_) => return Err(Error::UnsupportedType { type_name: value.type_name() }),
        }
        Ok(())
    }

    /// Eagerly convert the table at `idx` into a map, recursing into nested
    /// tables. `path` holds the tables currently being converted.
    pub(crate) fn table_to_map(&self, idx: i32, path: &mut Vec<usize>) -> Result<Map> {
        let state = self.session.state();
        let idx = state.absolute_index(idx);
        let addr = match state.value_at(idx) {
            vm::Value::Table(t) => t.addr(),
            other => return Err(Error::runtime(format!("expected a table, got {}", other.type_name()))),
        };
        if path.contains(&addr) {
            return Err(Error::CyclicTable);
        }
        let limit = state.options().max_conversion_depth;
        if path.len() >= limit {
            return Err(Error::NestingTooDeep { limit });
        }
        path.push(addr);

        let mut map = Map::new();
        state.push(vm::Value::Nil);
        while state.next(idx)? {
            let value = match state.type_at(-1) {
                Some(Type::Table) => Value::Map(self.table_to_map(-1, path)?),
                _ => self.from_stack(-1),
            };
            let key = state.value_at(-2);
            state.pop(1);
            match Key::from_vm(&key) {
                Some(key) => {
                    map.insert(key, value);
                }
                None => tracing::debug!(key_type = key.type_name(), "skipping key with no host form"),
            }
        }

        path.pop();
        Ok(map)
    }
}
