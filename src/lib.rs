//! moonbridge: a small Lua-style VM and the host binding layer around it.
//!
//! A [`Session`] owns one VM. Tables and functions cross into the host as
//! [`TableHandle`] / [`FunctionHandle`], registry-pinned references that are
//! checked for liveness and ownership on every use. Primitives and plain
//! maps cross by value as [`Value`].

pub mod ast;
pub mod error;
pub mod lexer;
pub mod parser;
pub mod session;
pub mod value;
pub mod vm;

pub use error::{Error, Result};
pub use session::{FunctionHandle, Handle, HandleKind, Session, TableHandle, ValueConverter};
pub use value::{Key, Map, Value};
pub use vm::Options;
