//! Error types and error handling strategy for soloio.
//!
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Cancellation is a first-class error kind, distinguishable from every
//!   user failure
//! - Errors are cheap to clone so a single failure can be fanned out to a
//!   group and re-raised at the scope boundary
//!
//! # Error Categories
//!
//! - **Cancellation**: the failure injected at a suspension point of a
//!   cancelled task
//! - **Runtime**: no-progress detection and API misuse
//! - **I/O**: readiness registration or syscall failures
//! - **User**: failures originating in user code (opaque payload)

use core::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Operation was cancelled.
    Cancelled,
    /// The loop has no ready tasks, no timers, and no I/O watches, but the
    /// root task has not terminated.
    Deadlock,
    /// API misuse: re-entering `run`, opening a group outside a task,
    /// spawning into a closed group, or suspending on a foreign future.
    Misuse,
    /// A timeout deadline elapsed before the guarded operation completed.
    DeadlineExceeded,
    /// An I/O registration or syscall failed.
    Io,
    /// User-provided error.
    User,
}

impl ErrorKind {
    /// Returns a short human-readable name for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Deadlock => "deadlock",
            Self::Misuse => "misuse",
            Self::DeadlineExceeded => "deadline exceeded",
            Self::Io => "i/o error",
            Self::User => "user error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error type used throughout the runtime.
///
/// An `Error` is an [`ErrorKind`] plus an optional message and an optional
/// source. It is `Clone` because the first failure observed by a task group
/// is retained while the group drains and is re-raised at the scope
/// boundary.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<Arc<str>>,
    source: Option<Arc<std::io::Error>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
        }
    }

    /// Attaches a message to this error.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<Arc<str>>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Creates a cancellation error.
    #[must_use]
    pub const fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled)
    }

    /// Creates a deadlock error.
    #[must_use]
    pub fn deadlock() -> Self {
        Self::new(ErrorKind::Deadlock)
            .with_message("no ready tasks, timers, or I/O watches remain")
    }

    /// Creates a misuse error with the given message.
    #[must_use]
    pub fn misuse(message: impl Into<Arc<str>>) -> Self {
        Self::new(ErrorKind::Misuse).with_message(message)
    }

    /// Creates a user error with the given message.
    ///
    /// This is the constructor for failures originating in user code; the
    /// message is the opaque payload.
    #[must_use]
    pub fn user(message: impl Into<Arc<str>>) -> Self {
        Self::new(ErrorKind::User).with_message(message)
    }

    /// Wraps an I/O error.
    #[must_use]
    pub fn io(source: std::io::Error) -> Self {
        Self {
            kind: ErrorKind::Io,
            message: None,
            source: Some(Arc::new(source)),
        }
    }

    /// Returns the kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the message attached to this error, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Returns true if this error is a cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.message, &self.source) {
            (Some(message), _) => write!(f, "{}: {message}", self.kind),
            (None, Some(source)) => write!(f, "{}: {source}", self.kind),
            (None, None) => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io(source)
    }
}
