//! Errors surfaced by the binding layer

use std::path::PathBuf;

use thiserror::Error;

use crate::vm::VmError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The handle was removed, or its session no longer exists.
    #[error("handle is no longer valid")]
    InvalidHandle,

    #[error("handle belongs to a different session")]
    CrossSessionHandle,

    #[error("host value of type {type_name} has no VM representation")]
    UnsupportedType { type_name: &'static str },

    #[error("{chunk}:{line}: {message}")]
    Compile {
        chunk: String,
        line: usize,
        message: String,
    },

    #[error("runtime error: {message}")]
    Runtime { message: String },

    /// The VM stack depth changed across an operation that must preserve it.
    #[error("stack imbalance: expected top {expected}, found {found}")]
    StackImbalance { expected: i32, found: i32 },

    #[error("native functions have no environment")]
    NativeEnvironment,

    #[error("table contains itself and cannot be converted eagerly")]
    CyclicTable,

    #[error("table nesting exceeds {limit} levels")]
    NestingTooDeep { limit: usize },

    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn runtime(message: impl Into<String>) -> Self {
        Error::Runtime { message: message.into() }
    }
}

impl From<VmError> for Error {
    fn from(e: VmError) -> Self {
        match e {
            VmError::Syntax { chunk, line, message, .. } => Error::Compile { chunk, line, message },
            VmError::Runtime(value) => Error::Runtime { message: value.to_string() },
        }
    }
}

/// Host errors raised inside a native callback travel through the VM as
/// runtime errors. Runtime messages pass through unchanged so they are not
/// prefixed twice when they come back out.
impl From<Error> for VmError {
    fn from(e: Error) -> Self {
        match e {
            Error::Runtime { message } => VmError::runtime(message),
            other => VmError::runtime(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Value;

    #[test]
    fn syntax_errors_become_compile_errors() {
        let vm = VmError::Syntax {
            code: "MB-P001",
            chunk: "main".into(),
            line: 3,
            message: "unexpected symbol".into(),
        };
        let err = Error::from(vm);
        assert!(matches!(err, Error::Compile { line: 3, .. }));
        assert_eq!(err.to_string(), "main:3: unexpected symbol");
    }

    #[test]
    fn runtime_messages_survive_the_round_trip() {
        let err = Error::from(VmError::Runtime(Value::string("boom")));
        assert_eq!(err.to_string(), "runtime error: boom");
        let back = VmError::from(err);
        assert_eq!(back.to_string(), "boom");
    }

    #[test]
    fn binding_errors_carry_their_description() {
        let vm = VmError::from(Error::CrossSessionHandle);
        assert_eq!(vm.to_string(), "handle belongs to a different session");
    }
}
