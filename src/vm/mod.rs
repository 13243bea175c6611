use std::cell::{Cell, RefCell};
use std::fmt::Write as _;
use std::rc::Rc;

use crate::ast::{ChunkInfo, Span};
use crate::parser::{self, ParseError};

pub mod interp;
pub mod options;
pub mod stdlib;
pub mod value;

pub use options::Options;
pub use value::{Function, FunctionRef, NativeFn, TableRef, Type, Value};

/// Request every result of a call.
pub const MULTRET: i32 = -1;
/// Most results a single [`State::call`] may request.
pub const MAX_RESULTS: i32 = 1 << 20;

#[derive(Debug, Clone, thiserror::Error)]
pub enum VmError {
    #[error("{chunk}:{line}: {message}")]
    Syntax {
        code: &'static str,
        chunk: String,
        line: usize,
        message: String,
    },
    /// An error value raised by a script or native function.
    #[error("{0}")]
    Runtime(Value),
}

impl VmError {
    pub fn runtime(message: impl AsRef<str>) -> Self {
        VmError::Runtime(Value::string(message.as_ref()))
    }
}

impl From<ParseError> for VmError {
    fn from(e: ParseError) -> Self {
        VmError::Syntax { code: e.code, chunk: e.chunk, line: e.line, message: e.message }
    }
}

/// Slot in the registry returned by [`State::reference`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistryKey(usize);

impl RegistryKey {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Default)]
struct Registry {
    slots: Vec<Option<Value>>,
    free: Vec<usize>,
}

/// One VM instance: value stack, registry, and global table.
///
/// Stack indices are 1-based from the bottom of the current native frame;
/// negative indices count back from the top. Every method takes `&self` and
/// releases its interior borrows before running script or native code, so
/// native functions may call back into the same state.
pub struct State {
    stack: RefCell<Vec<Value>>,
    base: Cell<usize>,
    depth: Cell<usize>,
    /// Native stack address when the outermost call was entered.
    stack_base: Cell<usize>,
    registry: RefCell<Registry>,
    globals: TableRef,
    string_lib: RefCell<Option<TableRef>>,
    print_sink: RefCell<Rc<dyn Fn(&str)>>,
    call_site: RefCell<Option<(Rc<ChunkInfo>, Span)>>,
    options: Options,
}

impl Default for State {
    fn default() -> Self {
        State::new()
    }
}

impl State {
    pub fn new() -> Self {
        State::with_options(Options::default())
    }

    pub fn with_options(options: Options) -> Self {
        State {
            stack: RefCell::new(Vec::new()),
            base: Cell::new(0),
            depth: Cell::new(0),
            stack_base: Cell::new(0),
            registry: RefCell::new(Registry::default()),
            globals: TableRef::new(),
            string_lib: RefCell::new(None),
            print_sink: RefCell::new(Rc::new(|line: &str| println!("{}", line))),
            call_site: RefCell::new(None),
            options,
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn globals(&self) -> TableRef {
        self.globals.clone()
    }

    /// Install the default library. Safe to call more than once.
    pub fn open_libs(&self) {
        stdlib::open(self);
    }

    /// Replace where `print` writes its lines.
    pub fn set_print_sink(&self, sink: impl Fn(&str) + 'static) {
        let old = self.print_sink.replace(Rc::new(sink));
        drop(old);
    }

    pub(crate) fn print(&self, line: &str) {
        let sink = self.print_sink.borrow().clone();
        sink(line);
    }

    // ---- Stack ----

    pub fn top(&self) -> i32 {
        (self.stack.borrow().len() - self.base.get()) as i32
    }

    /// Set the top to `n` slots (negative: relative to the current top), filling with nil.
    pub fn set_top(&self, n: i32) {
        let base = self.base.get();
        let len = self.stack.borrow().len() as i64;
        let target = if n >= 0 {
            base as i64 + n as i64
        } else {
            (len + n as i64 + 1).max(base as i64)
        };
        self.resize(target as usize);
    }

    fn resize(&self, target: usize) {
        // Removed values are dropped after the borrow ends.
        let removed = {
            let mut stack = self.stack.borrow_mut();
            if target <= stack.len() {
                stack.split_off(target)
            } else {
                stack.resize(target, Value::Nil);
                Vec::new()
            }
        };
        drop(removed);
    }

    pub fn pop(&self, n: usize) {
        self.set_top(-(n as i32) - 1);
    }

    pub fn push(&self, value: Value) {
        self.stack.borrow_mut().push(value);
    }

    /// Push a copy of the value at `idx`.
    pub fn push_value(&self, idx: i32) {
        let value = self.value_at(idx);
        self.push(value);
    }

    pub fn push_native(&self, f: impl Fn(&State) -> Result<usize, VmError> + 'static) {
        self.push(Value::Function(FunctionRef::native(Rc::new(f))));
    }

    pub fn new_table(&self) {
        self.push(Value::Table(TableRef::new()));
    }

    fn pop_value(&self) -> Value {
        let mut stack = self.stack.borrow_mut();
        if stack.len() > self.base.get() {
            stack.pop().unwrap_or_default()
        } else {
            Value::Nil
        }
    }

    fn absolute(&self, idx: i32) -> Option<usize> {
        let len = self.stack.borrow().len();
        let base = self.base.get();
        if idx > 0 {
            let i = base + idx as usize - 1;
            (i < len).then_some(i)
        } else if idx < 0 {
            let back = idx.unsigned_abs() as usize;
            (back <= len - base).then(|| len - back)
        } else {
            None
        }
    }

    /// Convert a relative index into a positive one that stays put when values are pushed.
    pub fn absolute_index(&self, idx: i32) -> i32 {
        if idx < 0 { self.top() + idx + 1 } else { idx }
    }

    /// Value at `idx`; nil for indices outside the frame.
    pub fn value_at(&self, idx: i32) -> Value {
        self.absolute(idx)
            .and_then(|i| self.stack.borrow().get(i).cloned())
            .unwrap_or_default()
    }

    /// Type at `idx`, or `None` when the index is outside the frame.
    pub fn type_at(&self, idx: i32) -> Option<Type> {
        let i = self.absolute(idx)?;
        self.stack.borrow().get(i).map(Value::type_of)
    }

    // ---- Tables and globals ----

    /// Pop a key and push `t[key]` where `t` is the table at `idx`.
    pub fn get_table(&self, idx: i32) -> Result<(), VmError> {
        let target = self.value_at(idx);
        let key = self.pop_value();
        let table = expect_table(&target, "index")?;
        self.push(table.get(&key));
        Ok(())
    }

    /// Pop a value and a key and store `t[key] = value` where `t` is the table at `idx`.
    pub fn set_table(&self, idx: i32) -> Result<(), VmError> {
        let target = self.value_at(idx);
        let value = self.pop_value();
        let key = self.pop_value();
        expect_table(&target, "index")?.set(key, value)
    }

    /// Pop a key and push the next key/value pair of the table at `idx`.
    /// Pushes nothing and returns false when the traversal is done.
    pub fn next(&self, idx: i32) -> Result<bool, VmError> {
        let target = self.value_at(idx);
        let key = self.pop_value();
        match expect_table(&target, "traverse")?.next(&key)? {
            Some((k, v)) => {
                self.push(k);
                self.push(v);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Length of the string or table at `idx`.
    pub fn len(&self, idx: i32) -> Result<i64, VmError> {
        match self.value_at(idx) {
            Value::String(s) => Ok(s.len() as i64),
            Value::Table(t) => Ok(t.len()),
            other => Err(VmError::runtime(format!(
                "attempt to get length of a {} value",
                other.type_name()
            ))),
        }
    }

    pub fn get_global(&self, name: &str) {
        self.push(self.globals.get_str(name));
    }

    /// Pop a value into the global `name`.
    pub fn set_global(&self, name: &str) {
        let value = self.pop_value();
        self.globals.set_str(name, value);
    }

    // ---- Registry ----

    /// Pop the top value into a fresh registry slot.
    pub fn reference(&self) -> RegistryKey {
        let value = self.pop_value();
        let mut registry = self.registry.borrow_mut();
        match registry.free.pop() {
            Some(i) => {
                registry.slots[i] = Some(value);
                RegistryKey(i)
            }
            None => {
                registry.slots.push(Some(value));
                RegistryKey(registry.slots.len() - 1)
            }
        }
    }

    /// Free a registry slot; the key may be handed out again afterwards.
    pub fn unreference(&self, key: RegistryKey) {
        let old = {
            let mut registry = self.registry.borrow_mut();
            let old = registry.slots.get_mut(key.0).and_then(Option::take);
            if old.is_some() {
                registry.free.push(key.0);
            }
            old
        };
        drop(old);
    }

    /// Push the value pinned at `key` (nil when the slot is free).
    pub fn push_reference(&self, key: RegistryKey) {
        let value = self
            .registry
            .borrow()
            .slots
            .get(key.0)
            .cloned()
            .flatten()
            .unwrap_or_default();
        self.push(value);
    }

    /// Number of occupied registry slots.
    pub fn reference_count(&self) -> usize {
        let registry = self.registry.borrow();
        registry.slots.len() - registry.free.len()
    }

    // ---- Loading and calling ----

    /// Compile `source` and push it as a vararg function. Pushes nothing on failure.
    pub fn load(&self, source: &str, chunk_name: &str) -> Result<(), VmError> {
        let chunk = parser::compile(source, chunk_name)?;
        self.push(Value::Function(FunctionRef::script(chunk.body, None, self.globals.clone())));
        Ok(())
    }

    /// Call the function below the top `nargs` values, leaving `nresults`
    /// results (all of them for [`MULTRET`]). Function and arguments are
    /// removed either way; on error nothing is pushed.
    pub fn call(&self, nargs: usize, nresults: i32) -> Result<(), VmError> {
        if nresults < MULTRET {
            return Err(VmError::runtime(format!("invalid result count {}", nresults)));
        }
        if nresults > MAX_RESULTS {
            return Err(VmError::runtime("too many results to call"));
        }
        let (func, args) = {
            let mut stack = self.stack.borrow_mut();
            if stack.len() < self.base.get() + nargs + 1 {
                return Err(VmError::runtime("not enough values on the stack for call"));
            }
            let at = stack.len() - nargs - 1;
            let mut args = stack.split_off(at);
            let func = args.remove(0);
            (func, args)
        };
        let mut results = self.call_value(func, args)?;
        if nresults >= 0 {
            results.resize(nresults as usize, Value::Nil);
        }
        self.stack.borrow_mut().extend(results);
        Ok(())
    }

    /// Call a value directly, bypassing the stack.
    pub fn call_value(&self, func: Value, args: Vec<Value>) -> Result<Vec<Value>, VmError> {
        let f = match func {
            Value::Function(f) => f,
            other => {
                return Err(VmError::runtime(format!(
                    "attempt to call a {} value",
                    other.type_name()
                )));
            }
        };
        let _depth = self.enter()?;
        match f.function() {
            Function::Script(closure) => interp::call_closure(self, closure, args),
            Function::Native(native) => self.call_native(native, args),
        }
    }

    fn call_native(&self, native: &NativeFn, args: Vec<Value>) -> Result<Vec<Value>, VmError> {
        let saved = self.base.get();
        let base = {
            let mut stack = self.stack.borrow_mut();
            let base = stack.len();
            stack.extend(args);
            base
        };
        self.base.set(base);
        let outcome = native(self).map(|n| {
            let mut stack = self.stack.borrow_mut();
            let len = stack.len();
            let at = len - n.min(len - base);
            stack.split_off(at)
        });
        self.resize(base);
        self.base.set(saved);
        outcome
    }

    fn enter(&self) -> Result<DepthGuard<'_>, VmError> {
        let depth = self.depth.get();
        if depth == 0 {
            self.stack_base.set(stack_address());
        }
        if depth >= self.options.max_call_depth || self.stack_exhausted() {
            return Err(VmError::runtime("stack overflow"));
        }
        self.depth.set(depth + 1);
        Ok(DepthGuard(self))
    }

    /// Pop a table and make it the global environment of the function at `idx`.
    /// Returns false when the function is native and has no environment.
    pub fn set_environment(&self, idx: i32) -> Result<bool, VmError> {
        let target = self.value_at(idx);
        let env = match self.pop_value() {
            Value::Table(t) => t,
            other => {
                return Err(VmError::runtime(format!(
                    "environment must be a table, got {}",
                    other.type_name()
                )));
            }
        };
        match target {
            Value::Function(f) => Ok(f.set_environment(env)),
            other => Err(VmError::runtime(format!(
                "cannot set the environment of a {} value",
                other.type_name()
            ))),
        }
    }

    // ---- Diagnostics ----

    pub(crate) fn string_lib(&self) -> Option<TableRef> {
        self.string_lib.borrow().clone()
    }

    pub(crate) fn set_string_lib(&self, lib: TableRef) {
        let old = self.string_lib.replace(Some(lib));
        drop(old);
    }

    pub(crate) fn set_call_site(&self, source: &Rc<ChunkInfo>, span: Span) {
        let old = self.call_site.replace(Some((source.clone(), span)));
        drop(old);
    }

    /// `chunk:line:` of the most recent call made from script code.
    pub fn location(&self) -> Option<String> {
        self.call_site
            .borrow()
            .as_ref()
            .map(|(source, span)| format!("{}:{}:", source.name, source.line_of(*span)))
    }

    /// Human-readable listing of the current frame, bottom first.
    pub fn stack_dump(&self) -> String {
        let stack = self.stack.borrow();
        let slots = &stack[self.base.get()..];
        let mut out = format!("stack: {} slot(s)\n", slots.len());
        for (i, v) in slots.iter().enumerate() {
            let _ = writeln!(out, "  [{}] {}: {:?}", i + 1, v.type_name(), v);
        }
        out
    }

    /// True once the native stack has grown `max_stack_bytes` past the
    /// outermost call.
    pub(crate) fn stack_exhausted(&self) -> bool {
        self.stack_base.get().saturating_sub(stack_address()) > self.options.max_stack_bytes
    }
}

fn stack_address() -> usize {
    let marker = 0u8;
    std::hint::black_box(&marker) as *const u8 as usize
}

struct DepthGuard<'a>(&'a State);

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.depth.set(self.0.depth.get() - 1);
    }
}

fn expect_table<'v>(value: &'v Value, action: &str) -> Result<&'v TableRef, VmError> {
    match value {
        Value::Table(t) => Ok(t),
        other => Err(VmError::runtime(format!(
            "attempt to {} a {} value",
            action,
            other.type_name()
        ))),
    }
}
