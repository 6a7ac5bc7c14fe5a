//! Error types for the replication pipeline.
//!
//! Errors are classified so the reader loop can tell transient failures
//! (drop the connection, back off, replay from the durable GTID) apart from
//! configuration mistakes and decode invariant violations that must abort.

use thiserror::Error;

/// Errors produced by the replication pipeline
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Failed to reach any candidate server, or an established session broke
    #[error("connection error: {0}")]
    Connection(String),

    /// The replication protocol exchange failed (handshake, auth, event stream)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The sink rejected a bulk write or a synthesized statement
    #[error("sink error: {0}")]
    Sink(String),

    /// A row image did not match its table map (invariant violation)
    #[error("decode error: {0}")]
    Decode(String),

    /// Sink-side schema could not be retrieved or does not cover the row
    #[error("schema error: {0}")]
    Schema(String),

    /// Invalid configuration, the process refuses to start
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error on the wire
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// SQL session error from the sink connection
    #[error("sql error: {0}")]
    Sql(#[from] mysql_async::Error),
}

impl ReplicationError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn sink(msg: impl Into<String>) -> Self {
        Self::Sink(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the reader should drop the connection and retry.
    ///
    /// Decode and configuration errors are not recoverable by reconnecting:
    /// the same event would fail again on replay.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Protocol(_) | Self::Io(_) => true,
            Self::Sink(_) | Self::Sql(_) => true,
            Self::Decode(_) | Self::Schema(_) | Self::Config(_) => false,
        }
    }
}

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, ReplicationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let err = ReplicationError::protocol("unexpected packet");
        assert!(err.to_string().contains("protocol error"));
        assert!(err.to_string().contains("unexpected packet"));
    }

    #[test]
    fn transient_classification() {
        assert!(ReplicationError::connection("down").is_transient());
        assert!(ReplicationError::sink("bulk rejected").is_transient());
        assert!(!ReplicationError::config("no servers").is_transient());
        assert!(!ReplicationError::decode("row too short").is_transient());
    }
}
