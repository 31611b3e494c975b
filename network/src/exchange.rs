//! Dispatch of decoded frames against the partition registry, plus the
//! callback surface the engine installs.

use std::sync::Arc;

use bytes::Bytes;
use rill_buffer::TupleBuffer;
use tracing::{debug, warn};

use crate::error::NetworkError;
use crate::partition::Partition;
use crate::protocol::{ChannelKind, EventKind, WireError};
use crate::registry::PartitionManager;

/// Engine side callbacks for wire level happenings. Implementations hold
/// only weak references back into the engine.
pub trait ExchangeListener: Send + Sync {
    /// A buffer was dispatched to a registered consumer.
    fn on_data_buffer(&self, partition: Partition, buffer: &TupleBuffer) {
        let _ = (partition, buffer);
    }

    /// The last producer of a registered partition announced end of stream.
    fn on_end_of_stream(&self, partition: Partition) {
        let _ = partition;
    }

    /// The receiver loop hit an error it could not attribute to a channel.
    fn on_server_error(&self, error: &NetworkError);

    /// A producer side channel failed after registration.
    fn on_channel_error(&self, error: &NetworkError);
}

/// Frame dispatch rules of the receiver side.
#[derive(Clone)]
pub struct ExchangeProtocol {
    partitions: Arc<PartitionManager>,
    listener: Arc<dyn ExchangeListener>,
}

impl ExchangeProtocol {
    pub fn new(partitions: Arc<PartitionManager>, listener: Arc<dyn ExchangeListener>) -> Self {
        ExchangeProtocol { partitions, listener }
    }

    pub fn partitions(&self) -> &Arc<PartitionManager> {
        &self.partitions
    }

    pub fn listener(&self) -> &Arc<dyn ExchangeListener> {
        &self.listener
    }

    /// Handshake: a data producer needs a registered consumer, an event
    /// producer needs a registered event listener.
    pub(crate) fn on_announcement(
        &self,
        partition: Partition,
        kind: ChannelKind,
    ) -> Result<(), WireError> {
        match kind {
            ChannelKind::Data => {
                if self.partitions.emitter(partition).is_some() {
                    self.partitions.register_producer(partition);
                    debug!(%partition, "data producer announced");
                    Ok(())
                } else {
                    Err(WireError::PartitionNotRegistered)
                }
            }
            ChannelKind::Event => {
                if self.partitions.event_listener(partition).is_some() {
                    debug!(%partition, "event producer announced");
                    Ok(())
                } else {
                    Err(WireError::PartitionNotRegistered)
                }
            }
        }
    }

    pub(crate) fn on_data(
        &self,
        partition: Partition,
        buffer: TupleBuffer,
    ) -> Result<(), WireError> {
        let Some(emitter) = self.partitions.emitter(partition) else {
            return Err(WireError::PartitionNotRegistered);
        };
        self.listener.on_data_buffer(partition, &buffer);
        emitter.emit_buffer(buffer);
        Ok(())
    }

    /// Events are best effort; an unroutable event is dropped with a log
    /// line instead of an error reply.
    pub(crate) fn on_event(&self, partition: Partition, kind: EventKind, payload: Bytes) {
        if let Some(listener) = self.partitions.event_listener(partition) {
            listener.on_event(kind, payload);
        } else if let Some(emitter) = self.partitions.emitter(partition) {
            emitter.on_event(kind, payload);
        } else {
            warn!(%partition, ?kind, "dropping event for unknown partition");
        }
    }

    /// A producer finished its channel. The last producer of a partition
    /// propagates end of stream into the consumer.
    pub(crate) fn on_end_of_stream(
        &self,
        partition: Partition,
        kind: ChannelKind,
    ) -> Result<(), WireError> {
        if kind == ChannelKind::Event {
            return Ok(());
        }
        let Some(emitter) = self.partitions.emitter(partition) else {
            return Err(WireError::PartitionNotRegistered);
        };
        match self.partitions.unregister_producer(partition) {
            Some(0) => {
                debug!(%partition, "all producers closed, propagating end of stream");
                emitter.on_end_of_stream();
                self.listener.on_end_of_stream(partition);
            }
            Some(remaining) => debug!(%partition, remaining, "producer closed"),
            None => warn!(%partition, "end of stream from unregistered producer"),
        }
        Ok(())
    }
}
