//! Partition addressed buffer transfer between nodes.
//!
//! Producers open a [`NetworkChannel`] to a remote node, announce the
//! partition they feed and ship framed tuple buffers. The receiving node
//! runs one I/O thread accepting connections and dispatching frames against
//! its [`PartitionManager`] registry. Events travel the opposite direction
//! over [`EventChannel`]s.

mod channel;
mod error;
mod exchange;
mod manager;
mod partition;
mod registry;
mod server;

pub mod protocol;

pub use channel::{ChannelRetryPolicy, EventChannel, NetworkChannel};
pub use error::NetworkError;
pub use exchange::{ExchangeListener, ExchangeProtocol};
pub use manager::NetworkManager;
pub use partition::{NodeLocation, OperatorId, Partition, PartitionId, QueryId, SubpartitionId};
pub use registry::{ConsumerState, DataEmitter, EventListener, PartitionManager, ProducerState};
