//! Error types shared by the server, the client and the transports

use std::time::Duration;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Error types organized by layer/domain
#[derive(Debug, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Common/Infrastructure Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Registry Errors
    // ─────────────────────────────────────────────────────────────
    #[error("No application instance with id {id}")]
    NotFound { id: i32 },

    #[error("Capacity exceeded: {message}")]
    CapacityExceeded { message: String },

    #[error("Application '{name}' is already running")]
    AlreadyRunning { name: String },

    #[error("No application configured with name '{name}'")]
    UnknownApplication { name: String },

    #[error("Invalid state transition: {message}")]
    InvalidTransition { message: String },

    #[error("Key '{key}' is not defined")]
    UndefinedKey { key: String },

    #[error("Key '{key}' already exists")]
    KeyAlreadyExists { key: String },

    // ─────────────────────────────────────────────────────────────
    // Process Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Failed to spawn process: {reason}")]
    ProcessSpawn { reason: String },

    // ─────────────────────────────────────────────────────────────
    // Transport/Protocol Errors
    // ─────────────────────────────────────────────────────────────
    #[error("No reply from {endpoint} within {timeout:?}")]
    ConnectionTimeout { endpoint: String, timeout: Duration },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Malformed message: {message}")]
    Parse { message: String },

    #[error("Server error: {message}")]
    Remote { message: String },

    #[error("Requester timed out and must be resynchronized")]
    Resync,

    // ─────────────────────────────────────────────────────────────
    // Waiting Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Wait was canceled")]
    Canceled,

    #[error("Wait timed out")]
    Timeout,

    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ─────────────────────────────────────────────────────────────
    // Channel/Communication Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Channel send error: {message}")]
    ChannelSend { message: String },

    #[error("Channel closed unexpectedly")]
    ChannelClosed,
}

// ─────────────────────────────────────────────────────────────────
// Convenience Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn not_found(id: i32) -> Self {
        Self::NotFound { id }
    }

    pub fn capacity(message: impl Into<String>) -> Self {
        Self::CapacityExceeded {
            message: message.into(),
        }
    }

    pub fn already_running(name: impl Into<String>) -> Self {
        Self::AlreadyRunning { name: name.into() }
    }

    pub fn unknown_application(name: impl Into<String>) -> Self {
        Self::UnknownApplication { name: name.into() }
    }

    pub fn invalid_transition(message: impl Into<String>) -> Self {
        Self::InvalidTransition {
            message: message.into(),
        }
    }

    pub fn undefined_key(key: impl Into<String>) -> Self {
        Self::UndefinedKey { key: key.into() }
    }

    pub fn key_exists(key: impl Into<String>) -> Self {
        Self::KeyAlreadyExists { key: key.into() }
    }

    pub fn connection_timeout(endpoint: impl ToString, timeout: Duration) -> Self {
        Self::ConnectionTimeout {
            endpoint: endpoint.to_string(),
            timeout,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn channel_send(message: impl Into<String>) -> Self {
        Self::ChannelSend {
            message: message.into(),
        }
    }

    /// Stable label used when an error crosses the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::NotFound { .. } => "not_found",
            Error::CapacityExceeded { .. } => "capacity_exceeded",
            Error::AlreadyRunning { .. } => "already_running",
            Error::UnknownApplication { .. } => "unknown_application",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::UndefinedKey { .. } => "undefined_key",
            Error::KeyAlreadyExists { .. } => "key_already_exists",
            Error::ProcessSpawn { .. } => "process_spawn",
            Error::ConnectionTimeout { .. } => "connection_timeout",
            Error::Transport { .. } => "transport",
            Error::Parse { .. } => "parse",
            Error::Remote { .. } => "remote",
            Error::Resync => "resync",
            Error::Canceled => "canceled",
            Error::Timeout => "timeout",
            Error::Config { .. } => "config",
            Error::ChannelSend { .. } => "channel_send",
            Error::ChannelClosed => "channel_closed",
        }
    }

    /// Rebuild an error received in an error reply.
    ///
    /// Registry errors keep their variant so callers can match on them;
    /// anything else becomes [`Error::Remote`].
    pub fn from_remote(kind: &str, subject: Option<&str>, message: &str) -> Self {
        let subject = subject.unwrap_or_default();
        match kind {
            "not_found" => subject
                .parse()
                .map(Error::not_found)
                .unwrap_or_else(|_| Error::remote(message)),
            "capacity_exceeded" => Error::capacity(message),
            "already_running" => Error::already_running(subject),
            "unknown_application" => Error::unknown_application(subject),
            "invalid_transition" => Error::invalid_transition(message),
            "undefined_key" => Error::undefined_key(subject),
            "key_already_exists" => Error::key_exists(subject),
            "process_spawn" => Error::ProcessSpawn {
                reason: message.to_string(),
            },
            _ => Error::remote(message),
        }
    }

    /// The identifying value carried by registry errors (id, name or key).
    pub fn subject(&self) -> Option<String> {
        match self {
            Error::NotFound { id } => Some(id.to_string()),
            Error::AlreadyRunning { name } | Error::UnknownApplication { name } => {
                Some(name.clone())
            }
            Error::UndefinedKey { key } | Error::KeyAlreadyExists { key } => Some(key.clone()),
            _ => None,
        }
    }

    /// Check if this is a recoverable error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout { .. }
                | Error::Parse { .. }
                | Error::Canceled
                | Error::Timeout
                | Error::Resync
                | Error::ChannelSend { .. }
        )
    }

    /// Check if this error should stop the process that hit it
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config { .. })
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Context Extensions
// ─────────────────────────────────────────────────────────────────

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", context.into(), err);
            err
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", f(), err);
            err
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = Error::not_found(42);
        assert_eq!(err.to_string(), "No application instance with id 42");

        let err = Error::connection_timeout("tcp://localhost:7000", Duration::from_millis(100));
        assert!(err.to_string().contains("tcp://localhost:7000"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_error_is_recoverable() {
        assert!(Error::Canceled.is_recoverable());
        assert!(Error::parse("bad frame").is_recoverable());
        assert!(!Error::not_found(1).is_recoverable());
    }

    #[test]
    fn test_error_is_fatal() {
        assert!(Error::config("missing file").is_fatal());
        assert!(!Error::Timeout.is_fatal());
    }

    #[test]
    fn test_remote_errors_keep_their_variant() {
        let original = Error::key_exists("color");
        let rebuilt = Error::from_remote(
            original.kind(),
            original.subject().as_deref(),
            &original.to_string(),
        );
        assert!(matches!(rebuilt, Error::KeyAlreadyExists { ref key } if key == "color"));

        let original = Error::not_found(7);
        let rebuilt = Error::from_remote(
            original.kind(),
            original.subject().as_deref(),
            &original.to_string(),
        );
        assert!(matches!(rebuilt, Error::NotFound { id: 7 }));
    }

    #[test]
    fn test_unknown_remote_kind_becomes_remote() {
        let err = Error::from_remote("io", None, "disk full");
        assert!(matches!(err, Error::Remote { ref message } if message == "disk full"));
    }
}
