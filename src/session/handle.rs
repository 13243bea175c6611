use std::fmt;
use std::ops::Deref;
use std::path::Path;
use std::rc::{Rc, Weak};

use crate::error::{Error, Result};
use crate::value::{Map, Value};
use crate::vm::{self, RegistryKey, State, VmError};

use super::registry::InstanceToken;
use super::{Session, SessionInner};

/// VM type tag cached on a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Table,
    Function,
}

impl HandleKind {
    pub fn name(self) -> &'static str {
        match self {
            HandleKind::Table => "table",
            HandleKind::Function => "function",
        }
    }
}

/// Persistent reference to a table or function pinned in a session's registry.
///
/// Clones share one registry slot; the slot is released when the last clone
/// drops, on [`Handle::invalidate`], on [`Session::remove_instance`], or when
/// the session itself goes away. Every operation checks liveness first and
/// fails with [`Error::InvalidHandle`] without touching the VM.
#[derive(Clone)]
pub struct Handle {
    inner: Rc<HandleInner>,
}

struct HandleInner {
    session: Weak<SessionInner>,
    token: InstanceToken,
    kind: HandleKind,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            session.release(self.token);
        }
    }
}

impl Handle {
    pub(crate) fn new(session: Weak<SessionInner>, token: InstanceToken, kind: HandleKind) -> Self {
        Handle {
            inner: Rc::new(HandleInner { session, token, kind }),
        }
    }

    pub fn kind(&self) -> HandleKind {
        self.inner.kind
    }

    pub fn type_name(&self) -> &'static str {
        self.inner.kind.name()
    }

    pub fn registry_key(&self) -> RegistryKey {
        self.inner.token.key()
    }

    pub(crate) fn token(&self) -> InstanceToken {
        self.inner.token
    }

    pub(crate) fn session_ref(&self) -> &Weak<SessionInner> {
        &self.inner.session
    }

    /// The owning session, if it is still alive.
    pub fn session(&self) -> Option<Session> {
        Session::from_weak(&self.inner.session)
    }

    pub fn is_valid(&self) -> bool {
        self.owner().is_ok()
    }

    /// Release the registry slot now. Returns true if the handle was live.
    pub fn invalidate(&self) -> bool {
        match self.inner.session.upgrade() {
            Some(session) => session.release(self.inner.token),
            None => false,
        }
    }

    /// Whether both handles pin the very same VM value.
    pub fn same_value(&self, other: &Handle) -> Result<bool> {
        let session = self.owner()?;
        session.check_handle(other)?;
        session.balanced(|state| {
            state.push_reference(self.registry_key());
            state.push_reference(other.registry_key());
            let same = state.value_at(-1).raw_equal(&state.value_at(-2));
            state.pop(2);
            Ok(same)
        })
    }

    pub fn as_table(&self) -> Option<TableHandle> {
        (self.kind() == HandleKind::Table).then(|| TableHandle(self.clone()))
    }

    pub fn as_function(&self) -> Option<FunctionHandle> {
        (self.kind() == HandleKind::Function).then(|| FunctionHandle(self.clone()))
    }

    /// Session that issued this handle, provided the handle is still live in it.
    pub(crate) fn owner(&self) -> Result<Session> {
        let session = self.session().ok_or(Error::InvalidHandle)?;
        session.check_handle(self)?;
        Ok(session)
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("kind", &self.inner.kind)
            .field("key", &self.inner.token.key().index())
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ref {}", self.type_name(), self.inner.token.key().index())
    }
}

// ── Tables ───────────────────────────────────────────────────────────

#[derive(Clone, PartialEq)]
pub struct TableHandle(pub(crate) Handle);

impl Deref for TableHandle {
    type Target = Handle;
    fn deref(&self) -> &Handle {
        &self.0
    }
}

impl fmt::Debug for TableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableHandle({:?})", self.0)
    }
}

impl TableHandle {
    /// Build a VM table from `map` in the calling thread's shared session.
    ///
    /// See [`Session::shared`]: each thread has its own shared session, so the
    /// handle is only usable with sessions from the same thread. Use
    /// [`TableHandle::from_map_in`] to pick the session explicitly.
    pub fn from_map(map: &Map) -> Result<TableHandle> {
        Session::shared().table_from_map(map)
    }

    pub fn from_map_in(session: &Session, map: &Map) -> Result<TableHandle> {
        session.table_from_map(map)
    }

    pub fn handle(&self) -> &Handle {
        &self.0
    }

    pub fn into_handle(self) -> Handle {
        self.0
    }

    /// Read `t[key]`.
    pub fn get(&self, key: impl Into<Value>) -> Result<Value> {
        self.owner()?.table_get(self, &key.into())
    }

    /// Store `t[key] = value`.
    pub fn set(&self, key: impl Into<Value>, value: impl Into<Value>) -> Result<()> {
        self.owner()?.table_set(self, &key.into(), &value.into())
    }

    /// Border length of the table, as the `#` operator computes it.
    pub fn len(&self) -> Result<i64> {
        let session = self.owner()?;
        session.balanced(|state| {
            state.push_reference(self.registry_key());
            let len = state.len(-1)?;
            state.pop(1);
            Ok(len)
        })
    }

    /// Convert the whole table, recursively, into a host map.
    ///
    /// Nested tables become nested maps; functions stay handles. A table that
    /// reaches itself fails with [`Error::CyclicTable`] rather than recursing
    /// forever. Use [`TableHandle::get`] to walk cyclic structures lazily.
    pub fn to_map(&self) -> Result<Map> {
        self.owner()?.table_to_map(self)
    }
}

// ── Functions ────────────────────────────────────────────────────────

#[derive(Clone, PartialEq)]
pub struct FunctionHandle(pub(crate) Handle);

impl Deref for FunctionHandle {
    type Target = Handle;
    fn deref(&self) -> &Handle {
        &self.0
    }
}

impl fmt::Debug for FunctionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FunctionHandle({:?})", self.0)
    }
}

impl FunctionHandle {
    /// Wrap a native function in the calling thread's shared session
    /// ([`Session::shared`]). The VM is not `Send`, so neither is the handle.
    pub fn from_native(f: impl Fn(&State) -> std::result::Result<usize, VmError> + 'static) -> Result<Self> {
        Session::shared().create_native(f)
    }

    pub fn from_native_in(
        session: &Session,
        f: impl Fn(&State) -> std::result::Result<usize, VmError> + 'static,
    ) -> Result<Self> {
        session.create_native(f)
    }

    /// Wrap a host closure in the calling thread's shared session.
    pub fn from_closure(f: impl Fn(&Session, Vec<Value>) -> Result<Vec<Value>> + 'static) -> Result<Self> {
        Session::shared().create_function(f)
    }

    pub fn from_closure_in(
        session: &Session,
        f: impl Fn(&Session, Vec<Value>) -> Result<Vec<Value>> + 'static,
    ) -> Result<Self> {
        session.create_function(f)
    }

    /// Compile `code` into a callable in the calling thread's shared session
    /// without running it.
    ///
    /// Each thread gets its own shared session (see [`Session::shared`]), so
    /// functions compiled here on different threads never share globals.
    pub fn from_source(code: &str) -> Result<Self> {
        Self::from_source_in(&Session::shared(), code)
    }

    pub fn from_source_in(session: &Session, code: &str) -> Result<Self> {
        session.load(code, &super::chunk_name(code))
    }

    /// Compile a script file in the calling thread's shared session.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Session::shared().load_file(path)
    }

    pub fn from_file_in(session: &Session, path: impl AsRef<Path>) -> Result<Self> {
        session.load_file(path)
    }

    pub fn handle(&self) -> &Handle {
        &self.0
    }

    pub fn into_handle(self) -> Handle {
        self.0
    }

    pub fn call(&self) -> Result<Value> {
        self.call_with_arguments(&[])
    }

    pub fn call_with_argument(&self, arg: impl Into<Value>) -> Result<Value> {
        self.call_with_arguments(&[arg.into()])
    }

    /// Call expecting one result; nil when the function returns nothing.
    pub fn call_with_arguments(&self, args: &[Value]) -> Result<Value> {
        Ok(self.call_with_results(args, 1)?.into_iter().next().unwrap_or_default())
    }

    /// Call with exactly `nresults` results, or all of them for [`vm::MULTRET`].
    pub fn call_with_results(&self, args: &[Value], nresults: i32) -> Result<Vec<Value>> {
        self.owner()?.call_function(self, args, nresults)
    }

    /// Whether the function is backed by host code.
    pub fn is_native(&self) -> Result<bool> {
        let session = self.owner()?;
        session.balanced(|state| {
            state.push_reference(self.registry_key());
            let native = matches!(state.value_at(-1), vm::Value::Function(ref f) if f.is_native());
            state.pop(1);
            Ok(native)
        })
    }

    /// The table the function resolves globals in, or `None` while it uses
    /// the session's globals (always `None` for natives). Read from the VM, so
    /// every handle to the same function sees the same answer.
    pub fn environment(&self) -> Result<Option<TableHandle>> {
        let session = self.owner()?;
        session.balanced(|state| {
            state.push_reference(self.registry_key());
            let env = match state.value_at(-1) {
                vm::Value::Function(f) => f.environment().filter(|env| !env.ptr_eq(&state.globals())),
                _ => None,
            };
            state.pop(1);
            Ok(env.map(|env| {
                state.push(vm::Value::Table(env));
                TableHandle(session.adopt_top(HandleKind::Table))
            }))
        })
    }

    /// Rebind the function's global environment. `None` restores the
    /// session's globals. Native functions have no environment and reject
    /// an override with [`Error::NativeEnvironment`].
    pub fn set_environment(&self, env: Option<TableHandle>) -> Result<()> {
        let session = self.owner()?;
        if let Some(env) = &env {
            session.check_handle(env)?;
        }
        let rebound = session.balanced(|state| {
            state.push_reference(self.registry_key());
            match &env {
                Some(env) => state.push_reference(env.registry_key()),
                None => state.push(vm::Value::Table(state.globals())),
            }
            let rebound = state.set_environment(-2)?;
            state.pop(1);
            Ok(rebound)
        })?;
        if !rebound && env.is_some() {
            return Err(Error::NativeEnvironment);
        }
        Ok(())
    }
}
