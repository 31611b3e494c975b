//! Process wide registry of partition endpoints.
//!
//! The rendezvous between a network source (consumer) and arriving wire
//! messages from remote producers. Consumer states move along
//! `Unregistered → Registered → Deleted` with no back edges; `Deleted` is
//! terminal per partition per process.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use rill_buffer::TupleBuffer;
use tracing::{debug, warn};

use crate::partition::Partition;
use crate::protocol::EventKind;

/// Consumer side registration state of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Unregistered,
    Registered,
    Deleted,
}

/// Producer side registration state of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    Unregistered,
    Registered,
    Deleted,
}

/// Callback installed by a consumer; invoked by the receiver loop for every
/// frame addressed to the partition.
pub trait DataEmitter: Send + Sync {
    /// A data buffer arrived for the partition.
    fn emit_buffer(&self, buffer: TupleBuffer);

    /// All producers of the partition announced end of stream.
    fn on_end_of_stream(&self);

    /// An out-of-band event arrived on the data direction.
    fn on_event(&self, kind: EventKind, payload: Bytes) {
        let _ = (kind, payload);
    }
}

/// Callback installed by a producer that wants to receive upstream events
/// (pause, resume) from its consumers.
pub trait EventListener: Send + Sync {
    fn on_event(&self, kind: EventKind, payload: Bytes);
}

struct ConsumerEntry {
    state: ConsumerState,
    count: usize,
    emitter: Option<Arc<dyn DataEmitter>>,
}

struct ProducerEntry {
    state: ProducerState,
    count: usize,
}

/// Registry mapping partitions to their consumer, producer and event
/// listener entries. State reads never take a write lock.
#[derive(Default)]
pub struct PartitionManager {
    consumers: DashMap<Partition, ConsumerEntry>,
    producers: DashMap<Partition, ProducerEntry>,
    event_listeners: DashMap<Partition, Arc<dyn EventListener>>,
}

impl PartitionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the emitter for a partition, or bump the registration count
    /// when already registered. Returns false when the partition was
    /// already deleted.
    pub fn register_consumer(&self, partition: Partition, emitter: Arc<dyn DataEmitter>) -> bool {
        let mut entry = self.consumers.entry(partition).or_insert(ConsumerEntry {
            state: ConsumerState::Unregistered,
            count: 0,
            emitter: None,
        });
        match entry.state {
            ConsumerState::Deleted => {
                warn!(%partition, "consumer registration on deleted partition");
                false
            }
            ConsumerState::Unregistered => {
                entry.state = ConsumerState::Registered;
                entry.count = 1;
                entry.emitter = Some(emitter);
                debug!(%partition, "consumer registered");
                true
            }
            ConsumerState::Registered => {
                entry.count += 1;
                true
            }
        }
    }

    /// Drop one consumer registration; the last one transitions the
    /// partition to `Deleted` and uninstalls the emitter.
    pub fn unregister_consumer(&self, partition: Partition) -> bool {
        let Some(mut entry) = self.consumers.get_mut(&partition) else {
            return false;
        };
        if entry.state != ConsumerState::Registered {
            return false;
        }
        entry.count -= 1;
        if entry.count == 0 {
            entry.state = ConsumerState::Deleted;
            entry.emitter = None;
            debug!(%partition, "consumer deleted");
        }
        true
    }

    pub fn consumer_state(&self, partition: Partition) -> ConsumerState {
        self.consumers
            .get(&partition)
            .map(|e| e.state)
            .unwrap_or(ConsumerState::Unregistered)
    }

    /// Remaining consumer registrations, for introspection and tests.
    pub fn consumer_count(&self, partition: Partition) -> usize {
        self.consumers.get(&partition).map(|e| e.count).unwrap_or(0)
    }

    /// The emitter of a registered partition.
    pub fn emitter(&self, partition: Partition) -> Option<Arc<dyn DataEmitter>> {
        self.consumers.get(&partition).and_then(|e| e.emitter.clone())
    }

    /// Producer side counterpart of [`Self::register_consumer`].
    pub fn register_producer(&self, partition: Partition) -> bool {
        let mut entry = self.producers.entry(partition).or_insert(ProducerEntry {
            state: ProducerState::Unregistered,
            count: 0,
        });
        match entry.state {
            ProducerState::Deleted => false,
            ProducerState::Unregistered => {
                entry.state = ProducerState::Registered;
                entry.count = 1;
                true
            }
            ProducerState::Registered => {
                entry.count += 1;
                true
            }
        }
    }

    /// Drop one producer registration. Returns the count left; reaching
    /// zero transitions the producer side to `Deleted`.
    pub fn unregister_producer(&self, partition: Partition) -> Option<usize> {
        let mut entry = self.producers.get_mut(&partition)?;
        if entry.state != ProducerState::Registered {
            return None;
        }
        entry.count -= 1;
        if entry.count == 0 {
            entry.state = ProducerState::Deleted;
        }
        Some(entry.count)
    }

    pub fn producer_state(&self, partition: Partition) -> ProducerState {
        self.producers
            .get(&partition)
            .map(|e| e.state)
            .unwrap_or(ProducerState::Unregistered)
    }

    pub fn producer_count(&self, partition: Partition) -> usize {
        self.producers.get(&partition).map(|e| e.count).unwrap_or(0)
    }

    /// Install the upstream event listener of a partition's producer.
    pub fn register_event_listener(&self, partition: Partition, listener: Arc<dyn EventListener>) {
        self.event_listeners.insert(partition, listener);
    }

    pub fn unregister_event_listener(&self, partition: Partition) {
        self.event_listeners.remove(&partition);
    }

    pub fn event_listener(&self, partition: Partition) -> Option<Arc<dyn EventListener>> {
        self.event_listeners.get(&partition).map(|e| e.value().clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct NoopEmitter;

    impl DataEmitter for NoopEmitter {
        fn emit_buffer(&self, _buffer: TupleBuffer) {}

        fn on_end_of_stream(&self) {}
    }

    fn partition() -> Partition {
        Partition::from((1, 2, 3, 4))
    }

    #[test]
    fn consumer_lifecycle_is_monotone() {
        let manager = PartitionManager::new();
        let p = partition();
        assert_eq!(manager.consumer_state(p), ConsumerState::Unregistered);

        assert!(manager.register_consumer(p, Arc::new(NoopEmitter)));
        assert!(manager.register_consumer(p, Arc::new(NoopEmitter)));
        assert_eq!(manager.consumer_state(p), ConsumerState::Registered);
        assert_eq!(manager.consumer_count(p), 2);

        assert!(manager.unregister_consumer(p));
        assert_eq!(manager.consumer_state(p), ConsumerState::Registered);
        assert!(manager.unregister_consumer(p));
        assert_eq!(manager.consumer_state(p), ConsumerState::Deleted);
        assert_eq!(manager.consumer_count(p), 0);
        assert!(manager.emitter(p).is_none());

        // Deleted is terminal.
        assert!(!manager.register_consumer(p, Arc::new(NoopEmitter)));
        assert!(!manager.unregister_consumer(p));
        assert_eq!(manager.consumer_state(p), ConsumerState::Deleted);
    }

    #[test]
    fn producer_counts_are_symmetric() {
        let manager = PartitionManager::new();
        let p = partition();
        assert!(manager.register_producer(p));
        assert!(manager.register_producer(p));
        assert_eq!(manager.producer_count(p), 2);
        assert_eq!(manager.unregister_producer(p), Some(1));
        assert_eq!(manager.unregister_producer(p), Some(0));
        assert_eq!(manager.producer_state(p), ProducerState::Deleted);
        assert!(!manager.register_producer(p));
    }
}
