use thiserror::Error;

/// Errors produced by the transport and surfaced through completed async ops.
///
/// There are no synchronous exceptions across the `Pipe`/`Stream` boundary;
/// every error reaches its caller through a completed op.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("stream or connection closed")]
    Closed,

    #[error("malformed mqtt packet: {0}")]
    MalformedPacket(String),

    #[error("quic failure: {0}")]
    QuicFailure(String),

    #[error("operation canceled")]
    Canceled,

    /// Reserved: per-operation deadlines are the caller's responsibility and
    /// compose with cancellation. The transport itself never produces this.
    #[error("operation timed out")]
    Timeout,

    #[error("queue at capacity")]
    ResourceExhausted,

    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

impl From<crate::framer::FramerError> for TransportError {
    fn from(err: crate::framer::FramerError) -> Self {
        TransportError::MalformedPacket(err.to_string())
    }
}

impl From<quinn::ConnectionError> for TransportError {
    fn from(err: quinn::ConnectionError) -> Self {
        TransportError::QuicFailure(err.to_string())
    }
}

impl From<quinn::WriteError> for TransportError {
    fn from(err: quinn::WriteError) -> Self {
        TransportError::QuicFailure(err.to_string())
    }
}

impl From<quinn::ReadError> for TransportError {
    fn from(err: quinn::ReadError) -> Self {
        TransportError::QuicFailure(err.to_string())
    }
}

impl From<quinn::ConnectError> for TransportError {
    fn from(err: quinn::ConnectError) -> Self {
        TransportError::QuicFailure(err.to_string())
    }
}
