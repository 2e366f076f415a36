//! Error handling types for crosspulse
//!
//! This module provides the error taxonomy shared by the endpoint, the
//! reader loop, and local method handlers.

use std::sync::PoisonError;
use std::time::Duration;
use thiserror::Error;

/// Comprehensive error type for bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A line failed to parse or lacked required fields
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// A call's deadline elapsed before any reply arrived
    #[error("Call to '{method}' timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    /// The peer replied with `success: false`
    #[error("Remote error: {message}")]
    Remote { message: String },

    /// Read or write failure on the underlying stream
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The endpoint has not been started, or has already been closed
    #[error("Not connected")]
    NotConnected,

    /// The connection closed while the call was pending
    #[error("Connection closed: {reason}")]
    ConnectionClosed { reason: String },

    /// Lifecycle operation attempted in the wrong state
    #[error("Invalid endpoint state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// Configuration error
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    /// The peer process could not be started
    #[error("Failed to spawn peer '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A message could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Helper functions for common error patterns
impl BridgeError {
    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        BridgeError::Protocol {
            message: message.into(),
        }
    }

    /// Create a remote error carrying the peer-provided message
    pub fn remote(message: impl Into<String>) -> Self {
        BridgeError::Remote {
            message: message.into(),
        }
    }

    /// Create a connection-closed error
    pub fn connection_closed(reason: impl Into<String>) -> Self {
        BridgeError::ConnectionClosed {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        BridgeError::Config {
            message: message.into(),
        }
    }

    /// Whether this error came from the peer rather than from this process.
    pub fn is_remote(&self) -> bool {
        matches!(self, BridgeError::Remote { .. })
    }
}

/// Error returned by a local method handler.
///
/// Never crosses the process boundary as a Rust value: the dispatcher turns it
/// into the `error` string of a `success: false` reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// Helper trait to recover from poisoned locks instead of panicking
pub trait LockResultExt<T> {
    /// Recover the guard from a PoisonError, logging which operation hit it.
    fn recover_poison(self, context: &str) -> T;
}

impl<T> LockResultExt<T> for Result<T, PoisonError<T>> {
    fn recover_poison(self, context: &str) -> T {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!(
                    target: "crosspulse::lock_recovery",
                    "Recovered from poisoned lock in {}",
                    context
                );
                poisoned.into_inner()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_error_names_method_and_duration() {
        let err = BridgeError::Timeout {
            method: "add".to_string(),
            timeout: Duration::from_millis(250),
        };
        let message = err.to_string();
        assert!(message.contains("'add'"), "got: {}", message);
        assert!(message.contains("250ms"), "got: {}", message);
    }

    #[test]
    fn remote_error_keeps_peer_message() {
        let err = BridgeError::remote("Method not found: ghost");
        assert!(err.is_remote());
        assert_eq!(err.to_string(), "Remote error: Method not found: ghost");
    }

    #[test]
    fn io_error_converts_to_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: BridgeError = io.into();
        assert!(matches!(err, BridgeError::Transport(_)));
        assert!(!err.is_remote());
    }

    #[test]
    fn handler_error_displays_bare_message() {
        let err = HandlerError::from("division by zero");
        assert_eq!(err.to_string(), "division by zero");
        assert_eq!(err.message(), "division by zero");
    }

    #[test]
    fn handler_error_from_serde_error() {
        let serde_err = serde_json::from_str::<i64>("\"nope\"").unwrap_err();
        let err = HandlerError::from(serde_err);
        assert!(err.message().contains("invalid type"), "got: {}", err);
    }

    #[test]
    fn recover_poison_returns_inner_guard() {
        let lock = std::sync::Arc::new(std::sync::Mutex::new(7));
        let poisoner = std::sync::Arc::clone(&lock);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        let guard = lock.lock().recover_poison("test");
        assert_eq!(*guard, 7);
    }
}
