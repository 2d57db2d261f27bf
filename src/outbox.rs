//! Trait boundary for optional persistent outbox storage.
//!
//! A caller may want publishes queued while the transport is disconnected to
//! survive a process restart. That storage is an external collaborator (see
//! crate docs' Non-goals): this crate never reads or writes a database
//! itself. It only names the trait a store plugs into, and the four knobs
//! the spec says belong to the caller's configuration rather than to the
//! store's own layout — the same shape as `salvo_rate_limiter`'s
//! `QuotaGetter`/store split, where the middleware names a trait and ships
//! no default backing store.

use std::path::PathBuf;

use crate::error::TransportError;
use crate::framer::MqttMessage;

/// Identifies which cached outbound queue a message belongs to: the spec's
/// `(client_id, protocol_version)` key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutboxKey {
    pub client_id: String,
    pub protocol_version: u8,
}

/// Tunables for an `Outbox` implementation. Layout beyond these four knobs
/// is entirely up to the store.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Whether persistence is active at all. Off by default: a store with
    /// no backing implementation attached has nothing to flush to.
    pub enabled: bool,
    /// Number of queued messages that triggers a flush to the store.
    pub flush_threshold: usize,
    /// Maximum number of rows the store retains per key before the oldest
    /// are dropped.
    pub max_rows: usize,
    /// Directory the store, if file-backed, should use.
    pub directory: PathBuf,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            flush_threshold: 32,
            max_rows: 1024,
            directory: PathBuf::from("."),
        }
    }
}

/// A pluggable store for pending outbound publishes, keyed by
/// `(client_id, protocol_version)`. This crate defines the contract only;
/// no default implementation is provided.
pub trait Outbox: Send + Sync {
    /// Append a message to the queue for `key`. Implementations enforce
    /// their own `max_rows` bound, dropping the oldest entries if needed.
    fn enqueue(&self, key: &OutboxKey, message: MqttMessage) -> Result<(), TransportError>;

    /// Remove and return every queued message for `key`, oldest first.
    fn drain(&self, key: &OutboxKey) -> Vec<MqttMessage>;

    /// Number of messages currently queued for `key`.
    fn len(&self, key: &OutboxKey) -> usize;

    /// Whether `key` has no queued messages.
    fn is_empty(&self, key: &OutboxKey) -> bool {
        self.len(key) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct InMemoryOutbox {
        rows: Mutex<HashMap<OutboxKey, Vec<MqttMessage>>>,
    }

    impl Outbox for InMemoryOutbox {
        fn enqueue(&self, key: &OutboxKey, message: MqttMessage) -> Result<(), TransportError> {
            self.rows
                .lock()
                .unwrap()
                .entry(key.clone())
                .or_default()
                .push(message);
            Ok(())
        }

        fn drain(&self, key: &OutboxKey) -> Vec<MqttMessage> {
            self.rows.lock().unwrap().remove(key).unwrap_or_default()
        }

        fn len(&self, key: &OutboxKey) -> usize {
            self.rows.lock().unwrap().get(key).map_or(0, Vec::len)
        }
    }

    fn key() -> OutboxKey {
        OutboxKey {
            client_id: "device-1".to_string(),
            protocol_version: 5,
        }
    }

    #[test]
    fn enqueue_and_drain_round_trip_in_order() {
        let outbox = InMemoryOutbox::default();
        let k = key();
        outbox
            .enqueue(&k, MqttMessage::new(vec![0x30, 0x00], Vec::new()))
            .unwrap();
        outbox
            .enqueue(&k, MqttMessage::new(vec![0x31, 0x00], Vec::new()))
            .unwrap();
        assert_eq!(outbox.len(&k), 2);

        let drained = outbox.drain(&k);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].header[0], 0x30);
        assert_eq!(drained[1].header[0], 0x31);
        assert!(outbox.is_empty(&k));
    }

    #[test]
    fn unknown_key_drains_empty() {
        let outbox = InMemoryOutbox::default();
        assert!(outbox.drain(&key()).is_empty());
    }

    #[test]
    fn default_config_is_disabled() {
        let cfg = OutboxConfig::default();
        assert!(!cfg.enabled);
    }
}
