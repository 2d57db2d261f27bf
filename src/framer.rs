//! Reassembles whole MQTT control packets from arbitrary QUIC byte chunks.
//!
//! MQTT's fixed header is one type/flags byte followed by a 1-4 byte
//! variable-length "Remaining Length" field (each byte uses its low 7 bits
//! for value, the top bit as a continuation flag), followed by exactly
//! Remaining Length bytes of body. QUIC delivers bytes in whatever chunk
//! sizes the peer's writes and the transport's flow control happen to
//! produce, so a chunk boundary can fall anywhere — including in the
//! middle of the Remaining Length field itself.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// The largest Remaining Length the 4-byte variable-length encoding can
/// represent (`0x7F + 0x7F*128 + 0x7F*128^2 + 0x7F*128^3`).
const MAX_REMAINING_LENGTH: u32 = 268_435_455;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramerError {
    #[error("remaining length exceeds the maximum encodable value")]
    RemainingLengthOverflow,
}

/// A whole MQTT control packet, header and body kept as separate regions
/// the way the upper protocol layer's op message slot expects them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    pub header: Bytes,
    pub body: Bytes,
}

impl MqttMessage {
    pub fn new(header: impl Into<Bytes>, body: impl Into<Bytes>) -> Self {
        Self {
            header: header.into(),
            body: body.into(),
        }
    }

    /// The packet type, the top nibble of the first header byte.
    pub fn packet_type(&self) -> u8 {
        self.header[0] >> 4
    }

    /// Concatenate header and body into a single contiguous wire encoding.
    /// Used by tests and by callers that need a single buffer rather than
    /// the two-descriptor form the stream engine submits to the QUIC layer.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.header.len() + self.body.len());
        out.extend_from_slice(&self.header);
        out.extend_from_slice(&self.body);
        out.freeze()
    }
}

/// Outcome of feeding a chunk to the framer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEvent {
    /// No whole packet yet. `consumed` bytes of the chunk were used and may
    /// be acknowledged to the QUIC library; any remainder was not touched
    /// and stays in the caller's buffer.
    Pending { consumed: usize },
    /// A whole packet was assembled. `consumed` bytes of the chunk were
    /// used. Call `take_message` to obtain it.
    Ready { consumed: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Accumulating into the 5-byte prefix buffer. `want` is 2, 4, or 5
    /// depending on what the first two bytes revealed.
    Prefix,
    /// The first Remaining Length byte had its continuation bit set;
    /// accumulating further length bytes one at a time.
    RemainingLength,
    /// The full header (type + Remaining Length encoding) is known;
    /// accumulating body bytes.
    Body,
}

/// Reassembles one MQTT control packet at a time from a stream of chunks.
///
/// A `Framer` holds at most one in-progress packet. `feed` never produces
/// more than one completed packet per call, mirroring the stream engine's
/// contract of completing exactly one receive op per whole packet.
#[derive(Debug)]
pub struct Framer {
    phase: Phase,
    prefix: [u8; 5],
    have: usize,
    want: usize,

    rl_value: u32,
    rl_shift: u32,
    rl_bytes_read: usize,
    rl_extra: [u8; 3],

    header: BytesMut,
    body: BytesMut,
    body_remaining: usize,

    completed: Option<MqttMessage>,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    pub fn new() -> Self {
        Self {
            phase: Phase::Prefix,
            prefix: [0; 5],
            have: 0,
            want: 2,
            rl_value: 0,
            rl_shift: 0,
            rl_bytes_read: 0,
            rl_extra: [0; 3],
            header: BytesMut::new(),
            body: BytesMut::new(),
            body_remaining: 0,
            completed: None,
        }
    }

    /// Reset parse state for the next packet. Called by the stream engine
    /// when a new receive op becomes the head of the receive queue.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Take the assembled message, if any, and reset scratch for the next
    /// packet. Ownership of the message transfers to the caller.
    pub fn take_message(&mut self) -> Option<MqttMessage> {
        let message = self.completed.take();
        if message.is_some() {
            self.reset();
        }
        message
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Result<FrameEvent, FramerError> {
        let mut consumed = 0;

        loop {
            match self.phase {
                Phase::Prefix => {
                    let n = (self.want - self.have).min(chunk.len() - consumed);
                    self.prefix[self.have..self.have + n]
                        .copy_from_slice(&chunk[consumed..consumed + n]);
                    self.have += n;
                    consumed += n;

                    if self.have < self.want {
                        return Ok(FrameEvent::Pending { consumed });
                    }

                    if self.want == 2 {
                        let rl0 = self.prefix[1];
                        if rl0 & 0x80 != 0 {
                            // Continuation bit set: multi-byte Remaining Length.
                            self.phase = Phase::RemainingLength;
                            self.rl_value = (rl0 & 0x7f) as u32;
                            self.rl_shift = 7;
                            self.rl_bytes_read = 1;
                            continue;
                        }
                        // Single-byte Remaining Length (0..=127). 0x02 and
                        // 0x03 are special-cased below purely to consume
                        // prefix bytes already buffered in one step rather
                        // than re-reading them one at a time; every value
                        // is otherwise handled identically.
                        match rl0 {
                            0 => {
                                self.completed = Some(MqttMessage::new(
                                    Bytes::copy_from_slice(&self.prefix[..2]),
                                    Bytes::new(),
                                ));
                                return Ok(FrameEvent::Ready { consumed });
                            }
                            0x02 => {
                                self.want = 4;
                                continue;
                            }
                            0x03 => {
                                self.want = 5;
                                continue;
                            }
                            _ => {
                                self.header.clear();
                                self.header.extend_from_slice(&self.prefix[..2]);
                                self.body.clear();
                                self.body_remaining = rl0 as usize;
                                self.phase = Phase::Body;
                                continue;
                            }
                        }
                    } else if self.want == 4 {
                        // rl0 == 0x02: exactly a 2-byte body.
                        self.completed = Some(MqttMessage::new(
                            Bytes::copy_from_slice(&self.prefix[..2]),
                            Bytes::copy_from_slice(&self.prefix[2..4]),
                        ));
                        return Ok(FrameEvent::Ready { consumed });
                    } else {
                        // want == 5, rl0 == 0x03: exactly a 3-byte body.
                        self.completed = Some(MqttMessage::new(
                            Bytes::copy_from_slice(&self.prefix[..2]),
                            Bytes::copy_from_slice(&self.prefix[2..5]),
                        ));
                        return Ok(FrameEvent::Ready { consumed });
                    }
                }

                Phase::RemainingLength => {
                    if consumed >= chunk.len() {
                        return Ok(FrameEvent::Pending { consumed });
                    }
                    let byte = chunk[consumed];
                    consumed += 1;

                    if self.rl_bytes_read >= 1 && self.rl_bytes_read <= 3 {
                        self.rl_extra[self.rl_bytes_read - 1] = byte;
                    }

                    self.rl_value |= ((byte & 0x7f) as u32) << self.rl_shift;
                    self.rl_shift += 7;
                    self.rl_bytes_read += 1;

                    if byte & 0x80 != 0 {
                        if self.rl_bytes_read >= 4 {
                            return Err(FramerError::RemainingLengthOverflow);
                        }
                        continue;
                    }

                    if self.rl_value > MAX_REMAINING_LENGTH {
                        return Err(FramerError::RemainingLengthOverflow);
                    }

                    self.header.clear();
                    self.header.push(self.prefix[0]);
                    self.header.push(self.prefix[1]);
                    self.header
                        .extend_from_slice(&self.rl_extra[..self.rl_bytes_read - 1]);

                    if self.rl_value == 0 {
                        self.completed = Some(MqttMessage::new(
                            self.header.split().freeze(),
                            Bytes::new(),
                        ));
                        return Ok(FrameEvent::Ready { consumed });
                    }

                    self.body.clear();
                    self.body_remaining = self.rl_value as usize;
                    self.phase = Phase::Body;
                    continue;
                }

                Phase::Body => {
                    let n = self.body_remaining.min(chunk.len() - consumed);
                    self.body.extend_from_slice(&chunk[consumed..consumed + n]);
                    self.body_remaining -= n;
                    consumed += n;

                    if self.body_remaining > 0 {
                        return Ok(FrameEvent::Pending { consumed });
                    }

                    self.completed = Some(MqttMessage::new(
                        self.header.split().freeze(),
                        self.body.split().freeze(),
                    ));
                    return Ok(FrameEvent::Ready { consumed });
                }
            }
        }
    }
}

/// Encode a Remaining Length value using MQTT's variable-length integer
/// scheme. Used by tests to build well-formed packets.
#[cfg(test)]
fn encode_remaining_length(mut value: u32) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(packet_type: u8, flags: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![(packet_type << 4) | flags];
        out.extend(encode_remaining_length(body.len() as u32));
        out.extend_from_slice(body);
        out
    }

    fn feed_whole(framer: &mut Framer, bytes: &[u8]) -> MqttMessage {
        let mut offset = 0;
        loop {
            match framer.feed(&bytes[offset..]).unwrap() {
                FrameEvent::Ready { consumed } => {
                    offset += consumed;
                    return framer.take_message().unwrap();
                }
                FrameEvent::Pending { consumed } => {
                    assert!(consumed > 0 || offset == bytes.len());
                    offset += consumed;
                    assert!(offset < bytes.len(), "never produced a message");
                }
            }
        }
    }

    #[test]
    fn zero_body_packet_emits_after_two_bytes() {
        // PINGRESP: 0xD0 0x00
        let bytes = [0xD0, 0x00];
        let mut framer = Framer::new();
        match framer.feed(&bytes).unwrap() {
            FrameEvent::Ready { consumed } => assert_eq!(consumed, 2),
            other => panic!("expected Ready, got {other:?}"),
        }
        let msg = framer.take_message().unwrap();
        assert_eq!(&msg.header[..], &[0xD0, 0x00]);
        assert!(msg.body.is_empty());
    }

    #[test]
    fn one_byte_body_does_not_over_read() {
        // Remaining Length 1 is a single-byte encoding below the 0x02/0x03
        // fast path and must not consume a phantom extra byte.
        let body = [0x42];
        let full = packet(0x4, 0x0, &body);
        assert_eq!(full.len(), 3);
        let mut framer = Framer::new();
        let msg = feed_whole(&mut framer, &full);
        assert_eq!(msg.encode(), Bytes::copy_from_slice(&full));
    }

    #[test]
    fn four_byte_body_uses_the_general_decode_path() {
        // Remaining Length 4 is a single-byte encoding above the 0x02/0x03
        // fast path; exercises the generic Body-phase route.
        let body = [1, 2, 3, 4];
        let full = packet(0x3, 0x0, &body);
        let mut framer = Framer::new();
        let msg = feed_whole(&mut framer, &full);
        assert_eq!(msg.encode(), Bytes::copy_from_slice(&full));
    }

    #[test]
    fn two_byte_body_emits_after_four_bytes() {
        // Short CONNACK-shaped packet: type 0x20, RL=2, body = [0x00, 0x00]
        let bytes = packet(0x2, 0x0, &[0x00, 0x00]);
        let mut framer = Framer::new();
        let msg = feed_whole(&mut framer, &bytes);
        assert_eq!(msg.encode(), Bytes::copy_from_slice(&bytes));
    }

    #[test]
    fn split_publish_across_chunks() {
        // PUBLISH with a 5-byte body split as spec scenario 3 describes:
        // 0x30 | 0x05 | "hi!" ("hi" + "!" == 3 body bytes -> pad to 5).
        let body = b"hi!!!"; // 5 bytes
        let full = packet(0x3, 0x0, body);
        assert_eq!(full, vec![0x30, 0x05, b'h', b'i', b'!', b'!', b'!']);

        let mut framer = Framer::new();

        // First callback: just the type byte.
        let ev = framer.feed(&full[0..1]).unwrap();
        assert_eq!(ev, FrameEvent::Pending { consumed: 1 });

        // Second callback: the Remaining Length byte.
        let ev = framer.feed(&full[1..2]).unwrap();
        assert_eq!(ev, FrameEvent::Pending { consumed: 1 });

        // Remaining body bytes trickle in one at a time.
        let mut offset = 2;
        while offset < full.len() {
            let ev = framer.feed(&full[offset..offset + 1]).unwrap();
            offset += 1;
            if offset == full.len() {
                assert_eq!(ev, FrameEvent::Ready { consumed: 1 });
            } else {
                assert_eq!(ev, FrameEvent::Pending { consumed: 1 });
            }
        }

        let msg = framer.take_message().unwrap();
        assert_eq!(msg.encode(), Bytes::copy_from_slice(&full));
    }

    #[test]
    fn max_remaining_length_is_accepted() {
        let body = vec![0xAB; MAX_REMAINING_LENGTH as usize];
        let full = packet(0x3, 0x0, &body);
        let mut framer = Framer::new();
        let msg = feed_whole(&mut framer, &full);
        assert_eq!(msg.body.len(), MAX_REMAINING_LENGTH as usize);
    }

    #[test]
    fn remaining_length_overflow_is_malformed() {
        // Five bytes, all with the continuation bit set: never terminates
        // within the 4-byte limit.
        let bytes = [0x30, 0xFF, 0xFF, 0xFF, 0xFF];
        let mut framer = Framer::new();
        let mut result = Ok(FrameEvent::Pending { consumed: 0 });
        for i in 0..bytes.len() {
            result = framer.feed(&bytes[i..i + 1]);
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result, Err(FramerError::RemainingLengthOverflow));
    }

    #[test]
    fn arbitrary_chunking_round_trips_a_sequence_of_packets() {
        let m1 = packet(0xD, 0x0, &[]); // PINGRESP
        let m2 = packet(0x3, 0x0, b"hello world"); // PUBLISH
        let m3 = packet(0x4, 0x2, &[0x00, 0x01]); // PUBACK-shaped, RL=2

        let mut all = Vec::new();
        all.extend_from_slice(&m1);
        all.extend_from_slice(&m2);
        all.extend_from_slice(&m3);

        // Chunk into irregular 3-byte pieces regardless of packet boundaries.
        let mut framer = Framer::new();
        let mut messages = Vec::new();
        let mut offset = 0;
        while offset < all.len() {
            let end = (offset + 3).min(all.len());
            let mut chunk_offset = offset;
            loop {
                match framer.feed(&all[chunk_offset..end]).unwrap() {
                    FrameEvent::Ready { consumed } => {
                        chunk_offset += consumed;
                        messages.push(framer.take_message().unwrap());
                    }
                    FrameEvent::Pending { consumed } => {
                        chunk_offset += consumed;
                        break;
                    }
                }
                if chunk_offset >= end {
                    break;
                }
            }
            offset = end;
        }

        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].encode(), Bytes::copy_from_slice(&m1));
        assert_eq!(messages[1].encode(), Bytes::copy_from_slice(&m2));
        assert_eq!(messages[2].encode(), Bytes::copy_from_slice(&m3));
    }
}
