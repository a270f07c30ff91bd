use thiserror::Error;

/// Error type for the replicated cache crate.
#[derive(Debug, Error)]
pub enum CacheError {
    /// I/O error triggered by network or file operations.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Error triggered by the durable store.
    #[error("durable store error: {0}")]
    Durable(#[from] sled::Error),

    /// Error decoding a wire frame or stored value.
    #[error("wire decode error: {0}")]
    Decode(String),

    /// Config file could not be parsed.
    #[error("config error: {0}")]
    Config(String),

    /// Binary Star FSM rejected an event.
    #[error("binary star rejected {event} in state {state}")]
    FsmRejected {
        /// The event that was rejected.
        event: String,
        /// The state it was rejected in.
        state: String,
    },

    /// Binary Star detected an unrecoverable dual-active or dual-passive condition.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Requested cache id is not known to this base.
    #[error("unknown cache id: {0}")]
    UnknownCache(String),
}

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, CacheError>;
