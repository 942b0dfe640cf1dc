//! Storage Module Tests
//!
//! Validates the local replica and its wire formats.
//!
//! ## Test Scopes
//! - **Codec**: snapshot framing, determinism, rejection of malformed input,
//!   unknown mutation variants.
//! - **ReplicaStore**: local operations, remote application, self-delivery
//!   suppression, snapshot capture/restore and subscriber notifications.
//!
//! *Note: Multi-node behaviour over a shared transport is tested in `node` and
//! in the integration tests.*

#[cfg(test)]
mod tests {
    use crate::error::{DecodeError, TransportError};
    use crate::membership::types::NodeId;
    use crate::storage::codec::{self, SNAPSHOT_MAGIC, SNAPSHOT_VERSION};
    use crate::storage::store::ReplicaStore;
    use crate::storage::types::{Entry, MutationMessage, Origin, Snapshot, StoreEvent};
    use crate::transport::{GroupReceiver, GroupTransport};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tracing::Span;

    /// Transport that records broadcasts instead of sending them.
    struct RecordingTransport {
        id: NodeId,
        sent: Mutex<Vec<MutationMessage>>,
        fail: bool,
        /// Message whose broadcast blocks the caller for a while.
        stall: Option<(MutationMessage, Duration)>,
    }

    impl RecordingTransport {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: NodeId::from(id),
                sent: Mutex::new(Vec::new()),
                fail: false,
                stall: None,
            })
        }

        fn stalling(id: &str, message: MutationMessage, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                id: NodeId::from(id),
                sent: Mutex::new(Vec::new()),
                fail: false,
                stall: Some((message, delay)),
            })
        }

        fn failing(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: NodeId::from(id),
                sent: Mutex::new(Vec::new()),
                fail: true,
                stall: None,
            })
        }

        fn sent(&self) -> Vec<MutationMessage> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl GroupTransport for RecordingTransport {
        fn local_address(&self) -> NodeId {
            self.id.clone()
        }

        fn set_receiver(&self, _receiver: Arc<dyn GroupReceiver>) {}

        async fn connect(&self, _group: &str) -> Result<(), TransportError> {
            Ok(())
        }

        fn broadcast(&self, message: &MutationMessage) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::NotConnected);
            }
            if let Some((stalled, delay)) = &self.stall
                && stalled == message
            {
                std::thread::sleep(*delay);
            }
            self.sent.lock().push(message.clone());
            Ok(())
        }

        async fn request_state(
            &self,
            member: &NodeId,
            _timeout: Duration,
        ) -> Result<Snapshot, TransportError> {
            Err(TransportError::UnknownMember(member.clone()))
        }

        async fn disconnect(&self) {}
    }

    fn store(id: &str) -> (ReplicaStore, Arc<RecordingTransport>) {
        let transport = RecordingTransport::new(id);
        (ReplicaStore::new(transport.clone(), Span::none()), transport)
    }

    fn insert(key: &str, value: i32) -> MutationMessage {
        MutationMessage::Insert {
            key: key.to_string(),
            value,
        }
    }

    fn remove(key: &str) -> MutationMessage {
        MutationMessage::Remove {
            key: key.to_string(),
        }
    }

    // ============================================================
    // CODEC TESTS
    // ============================================================

    #[test]
    fn test_snapshot_roundtrip() {
        let mut map = HashMap::new();
        map.insert("eur".to_string(), 100);
        map.insert("usd".to_string(), -7);
        map.insert("".to_string(), 0);

        let snapshot = codec::encode_snapshot(map.iter()).unwrap();
        assert_eq!(codec::decode_snapshot(&snapshot).unwrap(), map);
    }

    #[test]
    fn test_empty_map_snapshot_is_not_empty_bytes() {
        let map: HashMap<String, i32> = HashMap::new();
        let snapshot = codec::encode_snapshot(map.iter()).unwrap();

        assert!(!snapshot.is_empty());
        assert!(codec::decode_snapshot(&snapshot).unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_encoding_is_deterministic() {
        let mut a = HashMap::new();
        let mut b = HashMap::new();
        for i in 0..50 {
            a.insert(format!("key_{}", i), i);
        }
        for i in (0..50).rev() {
            b.insert(format!("key_{}", i), i);
        }

        let snap_a = codec::encode_snapshot(a.iter()).unwrap();
        let snap_b = codec::encode_snapshot(b.iter()).unwrap();
        assert_eq!(snap_a, snap_b, "Equal maps should encode to identical bytes");
    }

    #[test]
    fn test_snapshot_header() {
        let map: HashMap<String, i32> = HashMap::new();
        let bytes = codec::encode_snapshot(map.iter()).unwrap().into_bytes();

        assert_eq!(&bytes[..4], &SNAPSHOT_MAGIC);
        assert_eq!(&bytes[4..8], &SNAPSHOT_VERSION.to_le_bytes());
    }

    #[test]
    fn test_decode_rejects_empty_snapshot() {
        let err = codec::decode_snapshot(&Snapshot::from_bytes(vec![])).unwrap_err();
        assert_eq!(err, DecodeError::Empty);
    }

    #[test]
    fn test_decode_rejects_missing_header() {
        let err = codec::decode_snapshot(&Snapshot::from_bytes(b"garbage!".to_vec())).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn test_decode_rejects_unknown_version() {
        let mut map = HashMap::new();
        map.insert("a".to_string(), 1);
        let mut bytes = codec::encode_snapshot(map.iter()).unwrap().into_bytes();
        bytes[4..8].copy_from_slice(&99u32.to_le_bytes());

        let err = codec::decode_snapshot(&Snapshot::from_bytes(bytes)).unwrap_err();
        assert_eq!(err, DecodeError::UnsupportedVersion(99));
    }

    #[test]
    fn test_decode_rejects_truncated_body() {
        let mut map = HashMap::new();
        map.insert("gbp".to_string(), 12);
        let mut bytes = codec::encode_snapshot(map.iter()).unwrap().into_bytes();
        bytes.truncate(bytes.len() - 2);

        let err = codec::decode_snapshot(&Snapshot::from_bytes(bytes)).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut map = HashMap::new();
        map.insert("gbp".to_string(), 12);
        let mut bytes = codec::encode_snapshot(map.iter()).unwrap().into_bytes();
        bytes.push(0);

        assert!(codec::decode_snapshot(&Snapshot::from_bytes(bytes)).is_err());
    }

    #[test]
    fn test_decode_rejects_duplicate_keys() {
        let a = "dup".to_string();
        let b = "dup".to_string();
        let (one, two) = (1, 2);
        let snapshot = codec::encode_snapshot(vec![(&a, &one), (&b, &two)]).unwrap();

        let err = codec::decode_snapshot(&snapshot).unwrap_err();
        assert_eq!(err, DecodeError::DuplicateKey("dup".to_string()));
    }

    #[test]
    fn test_mutation_roundtrip() {
        for message in [insert("eur", 100), remove("eur")] {
            let bytes = codec::encode_mutation(&message).unwrap();
            assert_eq!(codec::decode_mutation(&bytes).unwrap(), message);
        }
    }

    #[test]
    fn test_unknown_mutation_variant() {
        let mut bytes = 7u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[1, 2, 3]);

        let err = codec::decode_mutation(&bytes).unwrap_err();
        assert_eq!(err, DecodeError::UnknownVariant(7));
    }

    #[test]
    fn test_garbage_mutation_is_malformed() {
        assert_eq!(codec::decode_mutation(&[]).unwrap_err(), DecodeError::Empty);
        assert!(matches!(
            codec::decode_mutation(&[0, 0]).unwrap_err(),
            DecodeError::Malformed(_)
        ));
        assert!(matches!(
            codec::decode_mutation(&[0, 0, 0, 0, 0xff]).unwrap_err(),
            DecodeError::Malformed(_)
        ));
    }

    // ============================================================
    // REPLICA STORE TESTS
    // ============================================================

    #[test]
    fn test_read_your_write() {
        let (store, transport) = store("A");

        store.put("eur", 100);

        assert_eq!(store.get("eur"), Some(100));
        assert!(store.contains_key("eur"));
        assert_eq!(transport.sent(), vec![insert("eur", 100)]);
    }

    #[test]
    fn test_read_your_write_survives_broadcast_failure() {
        let transport = RecordingTransport::failing("A");
        let store = ReplicaStore::new(transport, Span::none());

        store.put("eur", 100);
        assert_eq!(store.get("eur"), Some(100));

        assert_eq!(store.remove("eur"), Some(100));
        assert_eq!(store.get("eur"), None);
    }

    #[test]
    fn test_missing_key() {
        let (store, _) = store("A");

        assert_eq!(store.get("nope"), None);
        assert!(!store.contains_key("nope"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_put_overwrites() {
        let (store, _) = store("A");

        store.put("eur", 1);
        store.put("eur", 2);

        assert_eq!(store.get("eur"), Some(2));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_remove_returns_previous_and_always_broadcasts() {
        let (store, transport) = store("A");
        store.put("eur", 100);

        assert_eq!(store.remove("eur"), Some(100));
        assert_eq!(store.remove("eur"), None);

        assert_eq!(
            transport.sent(),
            vec![insert("eur", 100), remove("eur"), remove("eur")]
        );
    }

    #[test]
    fn test_apply_remote_does_not_rebroadcast() {
        let (store, transport) = store("A");
        let peer = NodeId::from("B");

        assert!(store.apply_remote(insert("usd", 5), &peer));
        assert_eq!(store.get("usd"), Some(5));
        assert!(store.apply_remote(remove("usd"), &peer));
        assert_eq!(store.get("usd"), None);

        assert!(transport.sent().is_empty());
    }

    #[test]
    fn test_apply_remote_is_idempotent() {
        let (store, _) = store("A");
        let peer = NodeId::from("B");

        store.apply_remote(insert("eur", 100), &peer);
        let once = store.entries();
        store.apply_remote(insert("eur", 100), &peer);
        assert_eq!(store.entries(), once);

        store.apply_remote(remove("eur"), &peer);
        store.apply_remote(remove("eur"), &peer);
        assert!(store.is_empty());
    }

    #[test]
    fn test_self_delivery_is_suppressed() {
        let (store, _) = store("A");
        store.put("eur", 1);

        // A looped-back copy of an older write must not clobber newer state.
        let applied = store.apply_remote(insert("eur", 0), &NodeId::from("A"));

        assert!(!applied);
        assert_eq!(store.get("eur"), Some(1));
    }

    #[test]
    fn test_same_history_converges() {
        let (a, _) = store("A");
        let (b, _) = store("B");
        let writer = NodeId::from("C");

        let history = vec![
            insert("eur", 1),
            insert("usd", 2),
            remove("eur"),
            insert("gbp", 3),
            insert("usd", 4),
        ];
        for message in history.clone() {
            a.apply_remote(message, &writer);
        }
        for message in history {
            b.apply_remote(message, &writer);
        }

        assert_eq!(a.entries(), b.entries());
        assert_eq!(a.entries(), vec![Entry::new("gbp", 3), Entry::new("usd", 4)]);
    }

    #[test]
    fn test_snapshot_capture_and_restore() {
        let (source, _) = store("A");
        source.put("eur", 100);
        source.put("usd", 90);

        let (target, _) = store("B");
        target.put("stale", 1);

        let snapshot = source.capture_snapshot().unwrap();
        assert_eq!(target.restore_snapshot(&snapshot).unwrap(), 2);

        assert_eq!(target.entries(), source.entries());
        assert!(!target.contains_key("stale"));
    }

    #[test]
    fn test_restore_overwrites_deliveries_after_capture() {
        let (source, _) = store("A");
        source.put("eur", 100);
        let snapshot = source.capture_snapshot().unwrap();

        let (target, _) = store("B");
        target.apply_remote(insert("usd", 90), &NodeId::from("C"));
        target.restore_snapshot(&snapshot).unwrap();

        assert_eq!(target.get("eur"), Some(100));
        assert_eq!(target.get("usd"), None);
    }

    #[test]
    fn test_failed_restore_keeps_state() {
        let (store, _) = store("A");
        store.put("eur", 100);

        let result = store.restore_snapshot(&Snapshot::from_bytes(b"RMAP".to_vec()));

        assert!(result.is_err());
        assert_eq!(store.get("eur"), Some(100));
    }

    #[test]
    fn test_with_entries_is_not_broadcast() {
        let transport = RecordingTransport::new("A");
        let store = ReplicaStore::with_entries(
            transport.clone(),
            Span::none(),
            vec![("eur".to_string(), 4), ("usd".to_string(), 3)],
        );

        assert_eq!(store.len(), 2);
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn test_entries_are_sorted() {
        let (store, _) = store("A");
        store.put("usd", 1);
        store.put("chf", 2);
        store.put("eur", 3);

        let keys: Vec<String> = store.entries().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["chf", "eur", "usd"]);
    }

    #[test]
    fn test_concurrent_writers_snapshot_is_consistent() {
        let (store, _) = store("A");
        let store = Arc::new(store);

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        store.put(format!("w{}_{}", w, i), i);
                    }
                })
            })
            .collect();

        for _ in 0..20 {
            let snapshot = store.capture_snapshot().unwrap();
            codec::decode_snapshot(&snapshot).unwrap();
        }
        for writer in writers {
            writer.join().unwrap();
        }

        let snapshot = store.capture_snapshot().unwrap();
        assert_eq!(codec::decode_snapshot(&snapshot).unwrap().len(), 800);
    }

    #[test]
    fn test_local_writers_broadcast_in_apply_order() {
        let transport = RecordingTransport::stalling("A", insert("k", 1), Duration::from_millis(100));
        let writer = Arc::new(ReplicaStore::new(transport.clone(), Span::none()));

        let slow_writer = {
            let writer = writer.clone();
            std::thread::spawn(move || writer.put("k", 1))
        };
        std::thread::sleep(Duration::from_millis(20));
        writer.put("k", 2);
        slow_writer.join().unwrap();

        let (peer, _) = store("B");
        for message in transport.sent() {
            peer.apply_remote(message, &NodeId::from("A"));
        }

        let local = writer.get("k");
        assert_eq!(peer.get("k"), local, "Peer must end on the writer's value");
        assert_eq!(transport.sent(), vec![insert("k", 1), insert("k", 2)]);
        assert_eq!(local, Some(2));
    }

    // ============================================================
    // SUBSCRIBER TESTS
    // ============================================================

    fn recorder(store: &ReplicaStore) -> (Arc<Mutex<Vec<StoreEvent>>>, crate::storage::store::SubscriptionId) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let id = store.subscribe(move |event| sink.lock().push(event.clone()));
        (events, id)
    }

    #[test]
    fn test_subscribers_see_local_and_remote_changes() {
        let (store, _) = store("A");
        let (events, _) = recorder(&store);
        let peer = NodeId::from("B");

        store.put("eur", 1);
        store.apply_remote(insert("usd", 2), &peer);
        store.remove("eur");
        store.remove("absent");
        store.apply_remote(remove("usd"), &peer);

        assert_eq!(
            *events.lock(),
            vec![
                StoreEvent::Inserted {
                    key: "eur".to_string(),
                    value: 1,
                    origin: Origin::Local,
                },
                StoreEvent::Inserted {
                    key: "usd".to_string(),
                    value: 2,
                    origin: Origin::Remote(peer.clone()),
                },
                StoreEvent::Removed {
                    key: "eur".to_string(),
                    origin: Origin::Local,
                },
                StoreEvent::Removed {
                    key: "usd".to_string(),
                    origin: Origin::Remote(peer),
                },
            ]
        );
    }

    #[test]
    fn test_restore_notifies_once() {
        let (source, _) = store("A");
        source.put("eur", 1);
        let (target, _) = store("B");
        let (events, _) = recorder(&target);

        target.restore_snapshot(&source.capture_snapshot().unwrap()).unwrap();

        assert_eq!(*events.lock(), vec![StoreEvent::Restored { len: 1 }]);
    }

    #[test]
    fn test_unsubscribe() {
        let (store, _) = store("A");
        let (events, id) = recorder(&store);

        store.put("eur", 1);
        assert!(store.unsubscribe(id));
        assert!(!store.unsubscribe(id));
        store.put("eur", 2);

        assert_eq!(events.lock().len(), 1);
    }

    #[test]
    fn test_subscriber_can_read_store() {
        let (store, _) = store("A");
        let store = Arc::new(store);
        let seen = Arc::new(Mutex::new(None));

        let weak = Arc::downgrade(&store);
        let sink = seen.clone();
        store.subscribe(move |_| {
            if let Some(store) = weak.upgrade() {
                *sink.lock() = store.get("eur");
            }
        });

        store.put("eur", 42);
        assert_eq!(*seen.lock(), Some(42));
    }
}
