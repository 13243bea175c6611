//! One VM instance plus the handles it has issued

use std::cell::RefCell;
use std::path::Path;
use std::rc::{Rc, Weak};

use crate::error::{Error, Result};
use crate::value::{Map, Value};
use crate::vm::{self, Options, RegistryKey, State, VmError};

pub mod convert;
pub mod handle;
pub mod registry;

pub use convert::ValueConverter;
pub use handle::{FunctionHandle, Handle, HandleKind, TableHandle};
pub use registry::{HandleRegistry, InstanceToken};

pub(crate) struct SessionInner {
    state: State,
    handles: RefCell<HandleRegistry>,
}

impl SessionInner {
    /// Drop a handle's registry slot. Returns true if it was live.
    pub(crate) fn release(&self, token: InstanceToken) -> bool {
        let released = self.handles.borrow_mut().release(token);
        if released {
            // Unpinning can drop host closures that release handles of their own.
            self.state.unreference(token.key());
            tracing::trace!(key = token.key().index(), "handle released");
        }
        released
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let invalidated = self.handles.get_mut().invalidate_all();
        tracing::debug!(invalidated, "session closed");
    }
}

thread_local! {
    static SHARED: Session = Session::with_options(Options { open_libs: true, ..Options::default() });
}

/// A scripting session: owns one VM [`State`] and tracks every handle it
/// hands out. Cloning is cheap and yields the same session.
///
/// Compile and runtime failures are reported as errors and always leave the
/// VM stack at the depth it had before the call.
#[derive(Clone)]
pub struct Session {
    inner: Rc<SessionInner>,
}

impl Default for Session {
    fn default() -> Self {
        Session::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Session::with_options(Options::default())
    }

    pub fn with_options(options: Options) -> Self {
        let open_libs = options.open_libs;
        let session = Session {
            inner: Rc::new(SessionInner {
                state: State::with_options(options),
                handles: RefCell::new(HandleRegistry::new()),
            }),
        };
        if open_libs {
            session.open_default_libs();
        }
        tracing::debug!(open_libs, "session opened");
        session
    }

    /// The default session for convenience constructors such as
    /// [`FunctionHandle::from_source`]. Created with the default library on
    /// first use and kept for the rest of the thread's life; the VM is not
    /// `Send`, so each thread gets its own.
    pub fn shared() -> Session {
        SHARED.with(Session::clone)
    }

    pub(crate) fn from_weak(weak: &Weak<SessionInner>) -> Option<Session> {
        weak.upgrade().map(|inner| Session { inner })
    }

    /// Install the default library. Calling it again reinstalls the same functions.
    pub fn open_default_libs(&self) {
        self.inner.state.open_libs();
    }

    /// The underlying VM.
    pub fn state(&self) -> &State {
        &self.inner.state
    }

    pub fn options(&self) -> &Options {
        self.inner.state.options()
    }

    pub fn converter(&self) -> ValueConverter<'_> {
        ValueConverter::new(self)
    }

    pub fn ptr_eq(&self, other: &Session) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run `op` and put the stack back where it was, whatever happened.
    /// A successful operation that moved the top is a bug in this crate.
    pub(crate) fn balanced<T>(&self, op: impl FnOnce(&State) -> Result<T>) -> Result<T> {
        let state = &self.inner.state;
        let expected = state.top();
        let result = op(state);
        let found = state.top();
        if found == expected {
            return result;
        }
        state.set_top(expected);
        match result {
            Ok(_) => {
                tracing::error!(expected, found, "stack imbalance");
                Err(Error::StackImbalance { expected, found })
            }
            Err(e) => Err(e),
        }
    }

    // ---- Handles ----

    pub(crate) fn adopt(&self, key: RegistryKey, kind: HandleKind) -> Handle {
        let token = self.inner.handles.borrow_mut().register(key);
        tracing::trace!(key = key.index(), kind = kind.name(), "handle registered");
        Handle::new(Rc::downgrade(&self.inner), token, kind)
    }

    /// Pin the top value and wrap it in a handle.
    fn adopt_top(&self, kind: HandleKind) -> Handle {
        let key = self.inner.state.reference();
        self.adopt(key, kind)
    }

    /// Ok when `handle` was issued by this session and is still live.
    pub(crate) fn check_handle(&self, handle: &Handle) -> Result<()> {
        let owner = handle.session_ref();
        if owner.strong_count() == 0 {
            return Err(Error::InvalidHandle);
        }
        if !std::ptr::eq(owner.as_ptr(), Rc::as_ptr(&self.inner)) {
            return Err(Error::CrossSessionHandle);
        }
        if !self.inner.handles.borrow().is_live(handle.token()) {
            return Err(Error::InvalidHandle);
        }
        Ok(())
    }

    /// Release a handle's registry slot. Removing a dead or foreign handle does nothing.
    pub fn remove_instance(&self, handle: &Handle) {
        if self.check_handle(handle).is_ok() {
            self.inner.release(handle.token());
        }
    }

    /// Number of live handles this session has issued.
    pub fn live_instances(&self) -> usize {
        self.inner.handles.borrow().live_count()
    }

    /// Simplify a handle: tables become host maps, functions stay as they are.
    pub fn convert_instance(&self, handle: &Handle) -> Result<Value> {
        self.check_handle(handle)?;
        match (handle.as_table(), handle.as_function()) {
            (Some(table), _) => Ok(Value::Map(self.table_to_map(&table)?)),
            (_, Some(function)) => Ok(Value::Function(function)),
            _ => Ok(Value::Nil),
        }
    }

    // ---- Globals ----

    pub fn get_global(&self, name: &str) -> Result<Value> {
        self.balanced(|state| {
            state.get_global(name);
            let value = self.converter().from_stack(-1);
            state.pop(1);
            Ok(value)
        })
    }

    /// The global as a handle; `None` when it holds a primitive.
    pub fn get_global_instance(&self, name: &str) -> Result<Option<Handle>> {
        Ok(self.get_global(name)?.into_handle())
    }

    pub fn set_global(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let converter = self.converter();
        converter.check(&value)?;
        self.balanced(|state| {
            converter.push_checked(&value)?;
            state.set_global(name);
            Ok(())
        })
    }

    // ---- Running code ----

    /// Compile and run `code` as a chunk, discarding its results.
    pub fn run_string(&self, code: &str) -> Result<()> {
        self.run_chunk(code, &chunk_name(code), 0).map(drop)
    }

    pub fn run_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let code = read_source(path)?;
        self.run_chunk(&code, &path.display().to_string(), 0).map(drop)
    }

    /// Compile and run `code`, returning everything the chunk returns.
    pub fn eval(&self, code: &str) -> Result<Vec<Value>> {
        self.run_chunk(code, &chunk_name(code), vm::MULTRET)
    }

    fn run_chunk(&self, code: &str, chunk: &str, nresults: i32) -> Result<Vec<Value>> {
        self.balanced(|state| {
            let base = state.top();
            state.load(code, chunk).map_err(|e| failure(chunk, e))?;
            state.call(0, nresults).map_err(|e| failure(chunk, e))?;
            Ok(self.collect_results(base))
        })
    }

    /// Compile `code` into a function handle without running it.
    pub fn load(&self, code: &str, chunk_name: &str) -> Result<FunctionHandle> {
        self.balanced(|state| {
            state.load(code, chunk_name).map_err(|e| failure(chunk_name, e))?;
            Ok(FunctionHandle(self.adopt_top(HandleKind::Function)))
        })
    }

    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<FunctionHandle> {
        let path = path.as_ref();
        let code = read_source(path)?;
        self.load(&code, &path.display().to_string())
    }

    fn collect_results(&self, base: i32) -> Vec<Value> {
        let converter = self.converter();
        let top = self.inner.state.top();
        let results = (base + 1..=top).map(|i| converter.from_stack(i)).collect();
        self.inner.state.set_top(base);
        results
    }

    pub(crate) fn call_function(&self, f: &FunctionHandle, args: &[Value], nresults: i32) -> Result<Vec<Value>> {
        let converter = self.converter();
        for arg in args {
            converter.check(arg)?;
        }
        self.balanced(|state| {
            let base = state.top();
            state.push_reference(f.registry_key());
            for arg in args {
                converter.push_checked(arg)?;
            }
            state.call(args.len(), nresults).map_err(|e| failure("call", e))?;
            Ok(self.collect_results(base))
        })
    }

    // ---- Tables ----

    pub fn create_table(&self) -> Result<TableHandle> {
        self.balanced(|state| {
            state.new_table();
            Ok(TableHandle(self.adopt_top(HandleKind::Table)))
        })
    }

    /// Build a new VM table from `map` and return a handle to it.
    pub fn table_from_map(&self, map: &Map) -> Result<TableHandle> {
        let value = Value::Map(map.clone());
        let converter = self.converter();
        converter.check(&value)?;
        self.balanced(|_| {
            converter.push_checked(&value)?;
            Ok(TableHandle(self.adopt_top(HandleKind::Table)))
        })
    }

    pub(crate) fn table_get(&self, t: &TableHandle, key: &Value) -> Result<Value> {
        let converter = self.converter();
        converter.check(key)?;
        self.balanced(|state| {
            state.push_reference(t.registry_key());
            converter.push_checked(key)?;
            state.get_table(-2)?;
            let value = converter.from_stack(-1);
            state.pop(2);
            Ok(value)
        })
    }

    pub(crate) fn table_set(&self, t: &TableHandle, key: &Value, value: &Value) -> Result<()> {
        let converter = self.converter();
        converter.check(key)?;
        converter.check(value)?;
        self.balanced(|state| {
            state.push_reference(t.registry_key());
            converter.push_checked(key)?;
            converter.push_checked(value)?;
            state.set_table(-3)?;
            state.pop(1);
            Ok(())
        })
    }

    pub(crate) fn table_to_map(&self, t: &TableHandle) -> Result<Map> {
        self.balanced(|state| {
            state.push_reference(t.registry_key());
            let map = self.converter().table_to_map(-1, &mut Vec::new())?;
            state.pop(1);
            Ok(map)
        })
    }

    // ---- Functions ----

    /// Expose a raw native function to scripts.
    pub fn create_native(
        &self,
        f: impl Fn(&State) -> std::result::Result<usize, VmError> + 'static,
    ) -> Result<FunctionHandle> {
        self.balanced(|state| {
            state.push_native(f);
            Ok(FunctionHandle(self.adopt_top(HandleKind::Function)))
        })
    }

    /// Expose a host closure to scripts. Arguments and results are converted
    /// at the boundary; an error returned by the closure becomes a runtime
    /// error inside the VM. The closure holds the session weakly.
    pub fn create_function(
        &self,
        f: impl Fn(&Session, Vec<Value>) -> Result<Vec<Value>> + 'static,
    ) -> Result<FunctionHandle> {
        let weak = Rc::downgrade(&self.inner);
        self.create_native(move |state| {
            let session = Session::from_weak(&weak).ok_or_else(|| VmError::runtime("session is closed"))?;
            let converter = session.converter();
            let args = (1..=state.top()).map(|i| converter.from_stack(i)).collect();
            let results = f(&session, args)?;
            for value in &results {
                converter.to_stack(value)?;
            }
            Ok(results.len())
        })
    }

    // ---- Stack inspection ----

    pub fn stack_top(&self) -> i32 {
        self.inner.state.top()
    }

    /// Convert the stack slot at `idx` without popping it.
    pub fn value_at(&self, idx: i32) -> Value {
        self.converter().from_stack(idx)
    }

    /// The slot at `idx` as a handle; `None` for primitives.
    pub fn instance_at(&self, idx: i32) -> Option<Handle> {
        self.value_at(idx).into_handle()
    }

    pub fn stack_dump(&self) -> String {
        self.inner.state.stack_dump()
    }

    /// Write the current stack to stderr.
    pub fn print_stack(&self) {
        eprint!("{}", self.stack_dump());
    }
}

/// Name for a chunk run from a string, as shown in error positions.
pub(crate) fn chunk_name(code: &str) -> String {
    const MAX: usize = 40;
    let first = code.lines().next().unwrap_or_default();
    let mut shown: String = first.chars().take(MAX).collect();
    if first.chars().count() > MAX || code.trim_end().contains('\n') {
        shown.push_str("...");
    }
    format!("[string \"{}\"]", shown)
}

fn read_source(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|source| Error::Io { path: path.to_path_buf(), source })
}

fn failure(chunk: &str, e: VmError) -> Error {
    tracing::debug!(chunk, error = %e, "chunk failed");
    Error::from(e)
}
