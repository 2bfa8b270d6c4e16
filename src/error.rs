//! Error types for manager-session operations.

/// Errors surfaced by [`AmiClient`](crate::AmiClient) operations.
///
/// Authentication and logoff rejections are not errors: `login` and `logoff`
/// report them through their boolean results, leaving the session usable.
#[derive(Debug)]
pub enum AmiError {
    /// The transport closed or the session was torn down while the operation
    /// was in flight.
    ConnectionClosed,
    /// The banner handshake failed (transport error, unexpected banner, or
    /// banner timeout).
    Handshake(String),
    /// The action carries an `ActionID` that is already pending.
    CorrelationCollision(String),
    /// No response arrived within the configured bound.
    Timeout,
    /// The message violates the wire format and cannot be sent, or the
    /// incoming byte stream broke framing beyond recovery.
    Protocol(String),
}

impl std::fmt::Display for AmiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Handshake(msg) => write!(f, "Handshake failed: {msg}"),
            Self::CorrelationCollision(id) => write!(f, "ActionID already pending: {id}"),
            Self::Timeout => write!(f, "Timed out waiting for response"),
            Self::Protocol(msg) => write!(f, "Protocol violation: {msg}"),
        }
    }
}

impl std::error::Error for AmiError {}

/// Convenience alias for results produced by this crate.
pub type AmiResult<T> = Result<T, AmiError>;
