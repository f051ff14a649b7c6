//! The `error` module defines the error type shared by every layer of the
//! broker: storage, wire decoding, configuration and socket I/O.
//!
//! Routing errors (`UnknownQueue`, `Protocol`) never stop the broker: the
//! handler turns them into a `QueueError` for the client that caused them.

use config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The underlying key/value engine failed.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// A record read from disk or from the wire could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A persisted record exists but is not usable.
    #[error("corrupt record at '{key}': {reason}")]
    Corrupt { key: String, reason: String },

    /// An internal invariant was found broken (e.g. an index that does not
    /// cover the key being erased).
    #[error("inconsistent state: {0}")]
    Inconsistent(String),

    #[error("no such queue: {0}")]
    UnknownQueue(String),

    /// A control frame was well formed on the wire but not acceptable.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Only Transient → Durable is a legal kind change.
    #[error("queue '{queue}' cannot change from {from} to {to}")]
    KindChange {
        queue: String,
        from: &'static str,
        to: &'static str,
    },

    /// A failure raised on purpose by a fault-injecting store backend.
    #[error("injected failure: {0}")]
    Injected(String),
}

pub type Result<T> = std::result::Result<T, Error>;
