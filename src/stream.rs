use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::error::TransportError;
use crate::framer::{FrameEvent, Framer};
use crate::op::{new_op, OpHandle, OpSlot};
use crate::pipe::Pipe;
use crate::MqttMessage;

/// Outcome of racing a queued send's write against its op's cancellation.
enum SendOutcome {
    Wrote(Result<(), quinn::WriteError>),
    Canceled,
}

struct SendEntry {
    message: MqttMessage,
    slot: OpSlot<()>,
}

struct RecvEntry {
    slot: OpSlot<MqttMessage>,
}

struct State {
    framer: Framer,
    send_queue: VecDeque<SendEntry>,
    recv_queue: VecDeque<RecvEntry>,
    /// Whole packets that arrived before a matching `recv()` call posted an
    /// op for them, and before any pipe was attached. Kept in order;
    /// drained by `recv()` before it queues a new op. Bounded by
    /// `recv_lmq_max`, the same cap the recv op queue uses: once a pipe is
    /// attached, inbound packets are forwarded to it directly instead of
    /// landing here, so in practice this only fills while a stream has
    /// neither a pending `recv()` nor an attached pipe.
    pending_messages: VecDeque<MqttMessage>,
    closed: Option<TransportError>,
}

struct Inner {
    state: Mutex<State>,
    send_ready: Notify,
    cfg: Config,
    /// Set once, by the Connection Manager, right after the stream is
    /// created. Kept outside `state` since delivering to it must never
    /// happen while the state mutex is held.
    pipe: std::sync::Mutex<Option<Arc<dyn Pipe>>>,
}

/// A single MQTT-over-QUIC stream: an ordered send queue, an ordered
/// receive queue, and the framer that reassembles inbound bytes into
/// whole packets.
///
/// Cheap to clone; every clone refers to the same underlying queues, the
/// way the original implementation's stream handle was a thin pointer to
/// a single shared `quic_strm_s`.
#[derive(Clone)]
pub struct StreamHandle {
    inner: Arc<Inner>,
}

/// Join handles for the two pump tasks driving a stream's QUIC side.
/// Dropping this does not stop the pumps; call `abort()` explicitly
/// during a reconnect replacing them.
pub(crate) struct PumpHandles {
    pub send: tokio::task::JoinHandle<()>,
    pub recv: tokio::task::JoinHandle<()>,
}

impl PumpHandles {
    pub(crate) fn abort(&self) {
        self.send.abort();
        self.recv.abort();
    }
}

impl StreamHandle {
    pub(crate) fn new(cfg: Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    framer: Framer::new(),
                    send_queue: VecDeque::new(),
                    recv_queue: VecDeque::new(),
                    pending_messages: VecDeque::new(),
                    closed: None,
                }),
                send_ready: Notify::new(),
                cfg,
                pipe: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Attach the pipe inbound packets are forwarded to. Called once, by
    /// the Connection Manager, before the pumps are spawned.
    pub(crate) fn set_pipe(&self, pipe: Arc<dyn Pipe>) {
        *self.inner.pipe.lock().expect("pipe mutex poisoned") = Some(pipe);
    }

    fn pipe(&self) -> Option<Arc<dyn Pipe>> {
        self.inner.pipe.lock().expect("pipe mutex poisoned").clone()
    }

    /// Enqueue a message to send. Returns immediately; the op completes
    /// once the message has been written to the QUIC stream (or the
    /// stream closes, or the op is canceled first).
    pub async fn send(&self, message: MqttMessage) -> OpHandle<()> {
        let (slot, handle) = new_op();
        let mut state = self.inner.state.lock().await;

        if let Some(reason) = &state.closed {
            slot.complete(Err(reason.clone()));
            return handle;
        }

        if state.send_queue.len() >= self.inner.cfg.send_lmq_max {
            slot.complete(Err(TransportError::ResourceExhausted));
            return handle;
        }

        state.send_queue.push_back(SendEntry { message, slot });
        drop(state);
        self.inner.send_ready.notify_one();
        handle
    }

    /// Enqueue a receive op. Completes with the next whole inbound packet,
    /// in arrival order, or immediately if one already arrived and is
    /// waiting to be claimed.
    pub async fn recv(&self) -> OpHandle<MqttMessage> {
        let (slot, handle) = new_op();
        let mut state = self.inner.state.lock().await;

        if let Some(message) = state.pending_messages.pop_front() {
            slot.complete(Ok(message));
            return handle;
        }

        if let Some(reason) = &state.closed {
            slot.complete(Err(reason.clone()));
            return handle;
        }

        if state.recv_queue.len() >= self.inner.cfg.recv_lmq_max {
            slot.complete(Err(TransportError::ResourceExhausted));
            return handle;
        }

        state.recv_queue.push_back(RecvEntry { slot });
        handle
    }

    /// Finalize the stream: drain both queues, completing every outstanding
    /// op with `reason`, and mark the stream closed so future `send`/`recv`
    /// calls fail immediately. Idempotent.
    pub async fn close(&self, reason: TransportError) {
        let mut state = self.inner.state.lock().await;
        if state.closed.is_some() {
            return;
        }
        state.closed = Some(reason.clone());
        while let Some(entry) = state.send_queue.pop_front() {
            entry.slot.complete(Err(reason.clone()));
        }
        while let Some(entry) = state.recv_queue.pop_front() {
            entry.slot.complete(Err(reason.clone()));
        }
        drop(state);
        self.inner.send_ready.notify_waiters();
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.state.lock().await.closed.is_some()
    }

    /// Reset framing scratch before rebinding this stream's queues to a
    /// freshly opened QUIC stream pair after a reconnect. The old
    /// connection's partial parse (e.g. a Remaining Length continuation
    /// byte seen but never completed) belongs to bytes that will never
    /// arrive; carrying it forward would prepend stale scratch onto the
    /// new stream's first bytes. `pending_messages` is cleared for the
    /// same reason: any buffered packet was framed from the dead
    /// connection's wire bytes. Queued `send`/`recv` ops themselves are
    /// left untouched and are served by the new stream pair. Not called
    /// on the initial connect, where the framer is already fresh.
    pub(crate) async fn reset_for_reconnect(&self) {
        let mut state = self.inner.state.lock().await;
        state.framer.reset();
        state.pending_messages.clear();
    }

    /// Spawn the send-pump and recv-pump tasks driving this stream's QUIC
    /// side. Called once after the initial connect, and again after a
    /// reconnect against a freshly opened stream pair, reusing the same
    /// queues and framer state.
    pub(crate) fn spawn_pumps(
        &self,
        send_stream: quinn::SendStream,
        recv_stream: quinn::RecvStream,
    ) -> PumpHandles {
        let send_handle = {
            let stream = self.clone();
            tokio::spawn(async move { stream.run_send_pump(send_stream).await })
        };
        let recv_handle = {
            let stream = self.clone();
            tokio::spawn(async move { stream.run_recv_pump(recv_stream).await })
        };
        PumpHandles {
            send: send_handle,
            recv: recv_handle,
        }
    }

    /// Drains canceled entries anywhere in `send_queue`, completing each
    /// with `Canceled`. Mid-queue cancellation does not wait for the
    /// entry to reach the head.
    async fn drain_canceled_sends(&self) {
        let mut state = self.inner.state.lock().await;
        let mut i = 0;
        while i < state.send_queue.len() {
            if state.send_queue[i].slot.is_canceled() {
                let entry = state.send_queue.remove(i).unwrap();
                entry.slot.complete(Err(TransportError::Canceled));
            } else {
                i += 1;
            }
        }
    }

    async fn drain_canceled_recvs(&self) {
        let mut state = self.inner.state.lock().await;
        let mut i = 0;
        while i < state.recv_queue.len() {
            if state.recv_queue[i].slot.is_canceled() {
                let entry = state.recv_queue.remove(i).unwrap();
                entry.slot.complete(Err(TransportError::Canceled));
            } else {
                i += 1;
            }
        }
    }

    /// Only the queue head is ever handed to the QUIC stream; everything
    /// behind it waits regardless of how much send capacity is available,
    /// preserving submission order by construction rather than by sorting.
    async fn run_send_pump(&self, mut send_stream: quinn::SendStream) {
        loop {
            self.drain_canceled_sends().await;

            let (message, cancel_signal) = {
                let mut state = self.inner.state.lock().await;
                if state.closed.is_some() {
                    return;
                }
                match state.send_queue.front() {
                    Some(entry) if !entry.slot.is_canceled() => {
                        (entry.message.clone(), entry.slot.cancel_signal())
                    }
                    Some(_) => continue,
                    None => {
                        drop(state);
                        self.inner.send_ready.notified().await;
                        continue;
                    }
                }
            };

            // Submitted as separate header/body descriptors (one if the
            // body is empty) rather than concatenated, so the QUIC layer
            // can write both `Bytes` without an intermediate copy.
            let mut chunks: Vec<bytes::Bytes> = if message.body.is_empty() {
                vec![message.header.clone()]
            } else {
                vec![message.header.clone(), message.body.clone()]
            };
            let total_len: usize = chunks.iter().map(|c| c.len()).sum();

            // Raced against the op's cancellation so a cancel requested
            // while this write is in flight aborts the submitted QUIC send
            // instead of being discovered only after it already completed.
            let outcome = tokio::select! {
                result = send_stream.write_all_chunks(&mut chunks) => SendOutcome::Wrote(result),
                _ = cancel_signal.wait() => SendOutcome::Canceled,
            };

            match outcome {
                SendOutcome::Canceled => {
                    // The head op was submitted to the QUIC library and is
                    // now being aborted; quinn has no way to cancel a single
                    // in-flight write short of resetting the whole send
                    // half, so the rest of the queue goes down with it.
                    let _ = send_stream.reset(quinn::VarInt::from_u32(0));
                    let mut state = self.inner.state.lock().await;
                    if let Some(entry) = state.send_queue.pop_front() {
                        entry.slot.complete(Err(TransportError::Canceled));
                    }
                    drop(state);
                    warn!("send canceled while in flight; resetting send stream");
                    self.close(TransportError::Canceled).await;
                    return;
                }
                SendOutcome::Wrote(result) => {
                    let mut state = self.inner.state.lock().await;
                    let Some(entry) = state.send_queue.pop_front() else {
                        continue;
                    };
                    if entry.slot.is_canceled() {
                        // Canceled after the write already succeeded or
                        // failed; the caller asked to abort, so the op
                        // reports cancellation regardless of the outcome on
                        // the wire.
                        entry.slot.complete(Err(TransportError::Canceled));
                        continue;
                    }
                    match result {
                        Ok(()) => {
                            trace!(bytes = total_len, "wrote queued message");
                            entry.slot.complete(Ok(()));
                        }
                        Err(err) => {
                            let reason = TransportError::from(err);
                            warn!(%reason, "send stream write failed");
                            entry.slot.complete(Err(reason.clone()));
                            drop(state);
                            self.close(reason).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn run_recv_pump(&self, mut recv_stream: quinn::RecvStream) {
        let mut buf = [0u8; 4096];
        loop {
            self.drain_canceled_recvs().await;

            {
                let state = self.inner.state.lock().await;
                if state.closed.is_some() {
                    return;
                }
            }

            let read = recv_stream.read(&mut buf).await;
            match read {
                Ok(Some(n)) if n > 0 => {
                    let has_pipe = self.pipe();
                    let outcome = {
                        let mut state = self.inner.state.lock().await;
                        match feed_chunk(
                            &mut state,
                            &buf[..n],
                            has_pipe.is_some(),
                            self.inner.cfg.recv_lmq_max,
                        ) {
                            Ok(outcome) => outcome,
                            Err(err) => {
                                let reason = TransportError::from(err);
                                warn!(%reason, "framer rejected inbound bytes");
                                drop(state);
                                self.close(reason).await;
                                return;
                            }
                        }
                    };

                    if let Some(pipe) = &has_pipe {
                        for message in outcome.to_deliver {
                            pipe.recv_message(message);
                        }
                    }

                    if outcome.overflow {
                        warn!("pending message buffer exhausted with no recv() or pipe to drain it");
                        self.close(TransportError::ResourceExhausted).await;
                        return;
                    }
                }
                Ok(Some(_)) => {
                    // Zero-length read; nothing to do.
                }
                Ok(None) => {
                    debug!("recv stream ended");
                    self.close(TransportError::Closed).await;
                    return;
                }
                Err(err) => {
                    let reason = TransportError::from(err);
                    warn!(%reason, "recv stream read failed");
                    self.close(reason).await;
                    return;
                }
            }
        }
    }
}

/// Messages a `feed_chunk` call found that must be handed to an attached
/// pipe. Delivery happens after the state lock is dropped, since a pipe
/// callback must never run while it is held.
#[derive(Default)]
struct FeedOutcome {
    to_deliver: Vec<MqttMessage>,
    /// Set when a whole packet arrived with no queued `recv()` op, no
    /// attached pipe, and `pending_messages` already at `recv_lmq_max`.
    overflow: bool,
}

/// Feed `chunk` through the framer. Each whole packet found is delivered,
/// in order, to the first of: a queued `recv()` op; the attached pipe (if
/// `has_pipe`); the `pending_messages` buffer, up to `recv_lmq_max`. A
/// packet that fits none of those sets `overflow` and stops being fed
/// further bytes of `chunk`.
fn feed_chunk(
    state: &mut State,
    chunk: &[u8],
    has_pipe: bool,
    recv_lmq_max: usize,
) -> Result<FeedOutcome, crate::framer::FramerError> {
    let mut outcome = FeedOutcome::default();
    let mut offset = 0;
    while offset < chunk.len() {
        match state.framer.feed(&chunk[offset..])? {
            FrameEvent::Pending { consumed } => {
                offset += consumed;
            }
            FrameEvent::Ready { consumed } => {
                offset += consumed;
                let message = state
                    .framer
                    .take_message()
                    .expect("Ready implies a message is available");
                if let Some(entry) = state.recv_queue.pop_front() {
                    entry.slot.complete(Ok(message));
                } else if has_pipe {
                    outcome.to_deliver.push(message);
                } else if state.pending_messages.len() < recv_lmq_max {
                    state.pending_messages.push_back(message);
                } else {
                    outcome.overflow = true;
                    break;
                }
            }
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(n: u8) -> MqttMessage {
        MqttMessage::new(vec![0xD0, 0x00], Vec::new()).with_marker(n)
    }

    // Small extension trait so queued messages in tests are distinguishable
    // without depending on framer internals; piggybacks the marker on the
    // header's second byte, which is otherwise always zero for PINGRESP.
    trait WithMarker {
        fn with_marker(self, n: u8) -> Self;
        fn marker(&self) -> u8;
    }
    impl WithMarker for MqttMessage {
        fn with_marker(mut self, n: u8) -> Self {
            let mut header = self.header.to_vec();
            header[1] = n;
            self.header = header.into();
            self
        }
        fn marker(&self) -> u8 {
            self.header[1]
        }
    }

    #[tokio::test]
    async fn sends_complete_in_fifo_order() {
        let stream = StreamHandle::new(Config::default());

        // No pump is running; inspect ordering by draining the queue
        // directly the way the send pump would, one head at a time.
        let h1 = stream.send(msg(1)).await;
        let h2 = stream.send(msg(2)).await;
        let h3 = stream.send(msg(3)).await;

        let mut state = stream.inner.state.lock().await;
        let order: Vec<u8> = state
            .send_queue
            .iter()
            .map(|e| e.message.marker())
            .collect();
        assert_eq!(order, vec![1, 2, 3]);

        while let Some(entry) = state.send_queue.pop_front() {
            entry.slot.complete(Ok(()));
        }
        drop(state);

        assert!(h1.await.is_ok());
        assert!(h2.await.is_ok());
        assert!(h3.await.is_ok());
    }

    #[tokio::test]
    async fn mid_queue_cancellation_removes_without_disturbing_order() {
        let stream = StreamHandle::new(Config::default());

        let h1 = stream.send(msg(1)).await;
        let h2 = stream.send(msg(2)).await;
        let h3 = stream.send(msg(3)).await;

        h2.cancel();
        stream.drain_canceled_sends().await;

        let state = stream.inner.state.lock().await;
        let order: Vec<u8> = state
            .send_queue
            .iter()
            .map(|e| e.message.marker())
            .collect();
        assert_eq!(order, vec![1, 3]);
        drop(state);

        assert_eq!(h2.await, Err(TransportError::Canceled));
        let _ = h1;
        let _ = h3;
    }

    #[tokio::test]
    async fn close_drains_queues_with_closed_reason() {
        let stream = StreamHandle::new(Config::default());
        let send_handle = stream.send(msg(1)).await;
        let recv_handle = stream.recv().await;

        stream.close(TransportError::Closed).await;

        assert_eq!(send_handle.await, Err(TransportError::Closed));
        assert_eq!(recv_handle.await, Err(TransportError::Closed));
        assert!(stream.is_closed().await);
    }

    #[tokio::test]
    async fn send_after_close_fails_immediately() {
        let stream = StreamHandle::new(Config::default());
        stream.close(TransportError::Closed).await;
        let handle = stream.send(msg(1)).await;
        assert_eq!(handle.await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn recv_returns_buffered_message_immediately() {
        let stream = StreamHandle::new(Config::default());
        {
            let mut state = stream.inner.state.lock().await;
            state.pending_messages.push_back(msg(7));
        }
        let handle = stream.recv().await;
        let message = handle.await.unwrap();
        assert_eq!(message.marker(), 7);
    }

    #[tokio::test]
    async fn send_queue_at_capacity_is_rejected() {
        let mut cfg = Config::default();
        cfg.send_lmq_max = 1;
        let stream = StreamHandle::new(cfg);

        let _first = stream.send(msg(1)).await;
        let second = stream.send(msg(2)).await;
        assert_eq!(second.await, Err(TransportError::ResourceExhausted));
    }

    #[tokio::test]
    async fn reset_for_reconnect_clears_mid_parse_framer_state_and_pending_messages() {
        let stream = StreamHandle::new(Config::default());
        {
            let mut state = stream.inner.state.lock().await;
            // Simulate a packet half-received before the old connection died:
            // a continuation-bit Remaining Length byte seen, body never
            // arrived.
            state.framer.feed(&[0x30, 0x80]).unwrap();
            state.pending_messages.push_back(msg(1));
        }

        stream.reset_for_reconnect().await;

        let mut state = stream.inner.state.lock().await;
        assert!(state.pending_messages.is_empty());
        // A fresh framer accepts a brand new packet cleanly rather than
        // treating it as a continuation of the stale parse.
        match state.framer.feed(&[0xD0, 0x00]).unwrap() {
            FrameEvent::Ready { consumed } => assert_eq!(consumed, 2),
            other => panic!("expected a fresh parse, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn feed_chunk_prefers_a_queued_recv_op_over_the_pipe() {
        let mut state = State {
            framer: Framer::new(),
            send_queue: VecDeque::new(),
            recv_queue: VecDeque::new(),
            pending_messages: VecDeque::new(),
            closed: None,
        };
        let (slot, handle) = new_op::<MqttMessage>();
        state.recv_queue.push_back(RecvEntry { slot });

        let outcome = feed_chunk(&mut state, &[0xD0, 0x00], true, 8).unwrap();
        assert!(outcome.to_deliver.is_empty());
        assert!(!outcome.overflow);

        let delivered = handle.await.expect("op should have completed");
        assert_eq!(delivered.marker(), 0);
    }

    #[test]
    fn feed_chunk_delivers_to_the_pipe_when_no_recv_op_is_queued() {
        let mut state = State {
            framer: Framer::new(),
            send_queue: VecDeque::new(),
            recv_queue: VecDeque::new(),
            pending_messages: VecDeque::new(),
            closed: None,
        };

        let outcome = feed_chunk(&mut state, &[0xD0, 0x00], true, 8).unwrap();
        assert_eq!(outcome.to_deliver.len(), 1);
        assert!(!outcome.overflow);
        assert!(state.pending_messages.is_empty());
    }

    #[test]
    fn feed_chunk_buffers_when_no_recv_op_and_no_pipe() {
        let mut state = State {
            framer: Framer::new(),
            send_queue: VecDeque::new(),
            recv_queue: VecDeque::new(),
            pending_messages: VecDeque::new(),
            closed: None,
        };

        let outcome = feed_chunk(&mut state, &[0xD0, 0x00], false, 8).unwrap();
        assert!(outcome.to_deliver.is_empty());
        assert!(!outcome.overflow);
        assert_eq!(state.pending_messages.len(), 1);
    }

    #[test]
    fn feed_chunk_reports_overflow_once_pending_messages_is_full() {
        let mut state = State {
            framer: Framer::new(),
            send_queue: VecDeque::new(),
            recv_queue: VecDeque::new(),
            pending_messages: VecDeque::new(),
            closed: None,
        };
        state.pending_messages.push_back(msg(1));

        let outcome = feed_chunk(&mut state, &[0xD0, 0x00], false, 1).unwrap();
        assert!(outcome.overflow);
        assert_eq!(state.pending_messages.len(), 1);
    }

    struct RecordingPipe {
        received: std::sync::Mutex<Vec<u8>>,
    }

    impl Pipe for RecordingPipe {
        fn init(&self, _stream: StreamHandle) {}
        fn start(&self) {}
        fn recv_message(&self, message: MqttMessage) {
            self.received.lock().unwrap().push(message.marker());
        }
        fn closed(&self, _reason: TransportError) {}
    }

    #[tokio::test]
    async fn set_pipe_attaches_the_pipe_used_by_feed_chunk_consumers() {
        let stream = StreamHandle::new(Config::default());
        let pipe = Arc::new(RecordingPipe {
            received: std::sync::Mutex::new(Vec::new()),
        });
        stream.set_pipe(pipe.clone());

        let attached = stream.pipe().expect("pipe should be attached");
        attached.recv_message(msg(9));
        assert_eq!(*pipe.received.lock().unwrap(), vec![9]);
    }
}
