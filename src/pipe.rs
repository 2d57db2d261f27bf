use crate::error::TransportError;
use crate::framer::MqttMessage;
use crate::stream::StreamHandle;

/// The upper-layer collaborator a [`crate::Transport`] drives.
///
/// A `Pipe` is the MQTT protocol layer's half of the boundary this crate
/// sits on: the transport owns framing, queuing, and the QUIC stream
/// itself, and calls into the pipe whenever there is something for the
/// protocol layer to react to. None of these methods are async — a pipe
/// that needs to do async work in response schedules it itself (typically
/// by calling back into its `StreamHandle`) rather than blocking the
/// task that invoked it, the same non-blocking-callback discipline the
/// original event-driven implementation required of its handlers.
pub trait Pipe: Send + Sync {
    /// Called once, before the stream is usable, with the handle the pipe
    /// should hold on to for `send`/`recv`/`close`.
    fn init(&self, stream: StreamHandle);

    /// Called after `init`, once the underlying QUIC stream is open and
    /// the pipe may begin sending.
    fn start(&self);

    /// Called once per whole inbound MQTT packet, in the order the packets
    /// arrived on the wire.
    fn recv_message(&self, message: MqttMessage);

    /// Called when the stream is finalized, whether by explicit close,
    /// unrecoverable QUIC failure, or a framing error. No further calls
    /// follow.
    fn closed(&self, reason: TransportError);
}
