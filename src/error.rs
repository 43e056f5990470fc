use thiserror::Error;

use crate::locks::LockClass;

/// Error types that can occur in the event gateway.
///
/// This enum represents all error conditions arising from connection
/// lifecycle management, broadcasting, bus ingress, and lock discipline.
#[derive(Error, Debug)]
pub enum GateError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A communication channel was closed unexpectedly
    #[error("Channel closed unexpectedly")]
    ChannelClosed,

    /// Configuration validation failed
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A lock was requested out of the fixed acquisition order.
    /// Programmer error; fatal to the offending operation, never recovered.
    #[error("Lock ordering violation: {requested:?} requested while holding {held:?}")]
    LockOrder {
        held: LockClass,
        requested: LockClass,
    },

    /// The circuit breaker guarding the event bus is open
    #[error("Circuit open: event bus unavailable")]
    CircuitOpen,

    /// Inbound event failed schema validation
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// No connection is registered under the given handle
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    /// Event bus operation failed
    #[error("Bus error: {0}")]
    Bus(String),
}

pub type Result<T> = std::result::Result<T, GateError>;
