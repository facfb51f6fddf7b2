use std::fmt;

use thiserror::Error;

/// The failure taxonomy of the bridge.
///
/// Lifecycle and marshalling kinds are reported synchronously by the call that hit them.
/// `Timeout` and `ScriptError` leave the context usable; `EngineFatal` does not.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InitializationFailed,
    EngineNotBuilt,
    DoubleFree,
    AlreadyShutdown,
    ContextsStillAlive,
    UnsupportedType,
    Timeout,
    ScriptError,
    EngineFatal,
    /// The context, or the context owning a handle, has been destroyed.
    ContextDestroyed,
    /// The handle belongs to another context or was released.
    InvalidHandle,
    SnapshotFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match *self {
            ErrorKind::InitializationFailed => "initialization failed",
            ErrorKind::EngineNotBuilt => "engine not built",
            ErrorKind::DoubleFree => "double free",
            ErrorKind::AlreadyShutdown => "already shut down",
            ErrorKind::ContextsStillAlive => "contexts still alive",
            ErrorKind::UnsupportedType => "unsupported type",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ScriptError => "script error",
            ErrorKind::EngineFatal => "engine fatal",
            ErrorKind::ContextDestroyed => "context destroyed",
            ErrorKind::InvalidHandle => "invalid handle",
            ErrorKind::SnapshotFailed => "snapshot failed",
        }
    }

    /// Whether the context that produced this failure can still run code.
    pub fn is_recoverable(&self) -> bool {
        !matches!(*self, ErrorKind::EngineFatal | ErrorKind::ContextDestroyed)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured failure: kind, message, and the script stack for `ScriptError`.
#[derive(Clone, Debug, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    stack: Option<String>,
}

impl Error {
    pub fn new<M: Into<String>>(kind: ErrorKind, message: M) -> Self {
        Error {
            kind: kind,
            message: message.into(),
            stack: None,
        }
    }

    pub fn script<M: Into<String>>(message: M, stack: Option<String>) -> Self {
        Error {
            kind: ErrorKind::ScriptError,
            message: message.into(),
            stack: stack,
        }
    }

    pub fn unsupported<M: Into<String>>(message: M) -> Self {
        Error::new(ErrorKind::UnsupportedType, message)
    }

    pub fn fatal<M: Into<String>>(message: M) -> Self {
        Error::new(ErrorKind::EngineFatal, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stack(&self) -> Option<&str> {
        self.stack.as_ref().map(|s| s.as_str())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
