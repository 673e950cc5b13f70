//! Error types for the balance bridge.
//!
//! Errors are split by the layer that can recover from them:
//!
//! - **[`ConnectionError`]**: the byte stream to the instrument is unusable
//!   (connect failure, read deadline, peer closed, I/O error). The socket is
//!   dropped and the reconnect supervisor takes over.
//! - **[`ProtocolError`]**: bytes arrived but did not carry a weight. Either
//!   the line did not match the MT-SICS grammar, or the instrument reported a
//!   fault status. The socket stays up.
//! - **[`BridgeError::NotConfigured`]**: no instrument host is configured.
//!   This is a degraded mode, not a startup failure.
//!
//! [`BridgeError`] wraps all of them so callers can use `?` across layers.

use thiserror::Error;

/// Convenience alias for results using the bridge error type.
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

/// Failures of the transport to the instrument.
///
/// Any of these means the current socket can no longer be trusted for a
/// half-duplex exchange.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Connect deadline or per-exchange read deadline expired.
    ///
    /// A late reply would otherwise be consumed by the next exchange, so a
    /// timed-out socket is always discarded.
    #[error("instrument did not answer within the deadline")]
    Timeout,

    /// Operating system level I/O failure.
    #[error("instrument I/O error: {0}")]
    Io(String),

    /// The instrument closed the stream.
    #[error("instrument closed the connection")]
    Closed,

    /// No socket is currently open (supervisor is between attempts).
    #[error("instrument is not connected")]
    NotConnected,
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => ConnectionError::Timeout,
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => ConnectionError::Closed,
            _ => ConnectionError::Io(err.to_string()),
        }
    }
}

/// Failures to interpret an instrument response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The line matched no known MT-SICS response shape.
    #[error("malformed instrument response: {line:?}")]
    MalformedResponse {
        /// The offending line, trimmed of its terminator.
        line: String,
    },

    /// The instrument answered with an error status instead of a value.
    #[error("instrument fault {code}: {}", describe_fault(code))]
    InstrumentFault {
        /// Raw status token (`+`, `-`, `I`, `L`, `ES`, ...).
        code: String,
    },
}

impl ProtocolError {
    /// Build a [`ProtocolError::MalformedResponse`] from any string-like line.
    pub fn malformed(line: impl Into<String>) -> Self {
        ProtocolError::MalformedResponse { line: line.into() }
    }

    /// Build a [`ProtocolError::InstrumentFault`] from a status token.
    pub fn fault(code: impl Into<String>) -> Self {
        ProtocolError::InstrumentFault { code: code.into() }
    }
}

/// Human readable meaning of an MT-SICS status or error code.
pub fn describe_fault(code: &str) -> &'static str {
    match code {
        "+" => "balance in overload range",
        "-" => "balance in underload range",
        "I" => "command understood but currently not executable",
        "L" => "command understood but parameter out of range",
        "E" => "balance reported a general error",
        "ES" => "syntax error, command not recognised",
        "ET" => "transmission error",
        "EL" => "logical error, command cannot be executed",
        _ => "unknown instrument status",
    }
}

/// Top-level error for bridge operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Transport failure; the supervisor will reconnect.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Response could not be turned into a reading; the link is still up.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// No instrument host configured; the bridge runs in disabled mode.
    #[error("not configured")]
    NotConfigured,

    /// Semantically invalid configuration detected by validation.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Bridge has been shut down and accepts no further work.
    #[error("bridge is shut down")]
    ShutDown,
}

impl BridgeError {
    /// True when the error means the instrument link was lost.
    pub fn is_connection_level(&self) -> bool {
        matches!(self, BridgeError::Connection(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_to_connection_variants() {
        let closed = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(ConnectionError::from(closed), ConnectionError::Closed);

        let timed_out = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert_eq!(ConnectionError::from(timed_out), ConnectionError::Timeout);

        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(
            ConnectionError::from(refused),
            ConnectionError::Io(_)
        ));
    }

    #[test]
    fn fault_message_includes_description() {
        let err = ProtocolError::fault("+");
        assert_eq!(
            err.to_string(),
            "instrument fault +: balance in overload range"
        );
    }

    #[test]
    fn only_connection_errors_are_connection_level() {
        assert!(BridgeError::from(ConnectionError::Timeout).is_connection_level());
        assert!(!BridgeError::from(ProtocolError::fault("ES")).is_connection_level());
        assert!(!BridgeError::NotConfigured.is_connection_level());
    }

    #[test]
    fn not_configured_message_is_stable() {
        assert_eq!(BridgeError::NotConfigured.to_string(), "not configured");
    }
}
