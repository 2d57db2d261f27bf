//! An MQTT-over-QUIC client transport.
//!
//! This crate owns exactly the QUIC-facing concerns of an MQTT client:
//! opening and reconnecting a QUIC connection, multiplexing MQTT control
//! packets over a single bidirectional stream, reassembling whole packets
//! out of arbitrarily chunked inbound bytes, and carrying 0-RTT session
//! resumption tickets across reconnects. It does not speak MQTT itself —
//! no packet encoding beyond the fixed header, no keep-alive state
//! machine, no subscription bookkeeping. Callers implement [`Pipe`] to
//! plug an MQTT protocol layer in above it.
//!
//! ```no_run
//! use std::sync::Arc;
//! use mqtt_quic_transport::{Config, MqttMessage, Pipe, StreamHandle, Transport, TransportError};
//!
//! struct EchoPipe;
//!
//! impl Pipe for EchoPipe {
//!     fn init(&self, _stream: StreamHandle) {}
//!     fn start(&self) {}
//!     fn recv_message(&self, _message: MqttMessage) {}
//!     fn closed(&self, _reason: TransportError) {}
//! }
//!
//! # async fn run() -> Result<(), TransportError> {
//! let transport = Transport::new(Config::default())?;
//! let stream = transport
//!     .connect("mqtt-quic://127.0.0.1:14567", Arc::new(EchoPipe))
//!     .await?;
//! let ack = stream
//!     .send(MqttMessage::new(vec![0xD0, 0x00], Vec::new()))
//!     .await;
//! ack.await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod conn;
mod error;
mod framer;
mod op;
mod outbox;
mod pipe;
mod stream;
mod url;

pub use config::Config;
pub use conn::Transport;
pub use error::TransportError;
pub use framer::MqttMessage;
pub use op::OpHandle;
pub use outbox::{Outbox, OutboxConfig, OutboxKey};
pub use pipe::Pipe;
pub use stream::StreamHandle;
pub use url::ServerAddr;

/// A [`Pipe`] that discards every callback. Useful for exercising the
/// transport's queueing and reconnect behavior in isolation, without a
/// real MQTT protocol layer attached.
#[derive(Debug, Default)]
pub struct NullPipe;

impl Pipe for NullPipe {
    fn init(&self, _stream: StreamHandle) {}
    fn start(&self) {}
    fn recv_message(&self, _message: MqttMessage) {}
    fn closed(&self, _reason: TransportError) {}
}
