// Error taxonomy for the whole engine.
//
// Every failure the parser, compiler, or scheduler can produce is a
// variant here. All are non-recoverable within the core: an error
// aborts the current handler and fails the step that demanded it.
// The two deliberate soft spots are conversion search (degrades to
// UnknownConversion) and absent handlers (prior carry-forward, no
// error at all).

use thiserror::Error;

/// The result of any engine operation.
pub type EngineResult<T> = core::result::Result<T, JoshError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum JoshError {
    #[error("parse error at {line}:{col}: {message}")]
    Parse {
        line: usize,
        col: usize,
        message: String,
    },

    #[error("'{0}' is a reserved word and cannot be declared")]
    ReservedWord(String),

    #[error("unit mismatch: {left} vs {right}")]
    UnitMismatch { left: String, right: String },

    #[error("no conversion from {from} to {to}")]
    UnknownConversion { from: String, to: String },

    #[error("unknown attribute '{0}'")]
    UnknownAttribute(String),

    #[error("cyclic attribute dependency at {entity}.{attribute}")]
    CyclicDependency { entity: String, attribute: String },

    #[error("arithmetic error: {0}")]
    Arithmetic(String),

    #[error("cannot mutate frozen entity {entity} (attribute '{attribute}')")]
    FrozenMutation { entity: String, attribute: String },

    #[error("config key '{0}' is absent and no default was given")]
    UnresolvedConfig(String),

    #[error("type error: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },

    #[error("value stack underflow")]
    Underflow,

    #[error("handler body completed without producing a value")]
    NoReturn,

    #[error("io error: {0}")]
    Io(String),

    #[error("cancelled")]
    Cancelled,
}

impl From<std::io::Error> for JoshError {
    fn from(e: std::io::Error) -> JoshError {
        JoshError::Io(e.to_string())
    }
}

// Shortcut constructors for the errors built all over the core.

pub fn unit_mismatch(left: impl ToString, right: impl ToString) -> JoshError {
    JoshError::UnitMismatch {
        left: left.to_string(),
        right: right.to_string(),
    }
}

pub fn type_mismatch(expected: impl ToString, got: impl ToString) -> JoshError {
    JoshError::TypeMismatch {
        expected: expected.to_string(),
        got: got.to_string(),
    }
}

pub fn arithmetic(msg: impl ToString) -> JoshError {
    JoshError::Arithmetic(msg.to_string())
}
