//! error types.

use std::io;

use crate::partition::Partition;

/// Error surfaced by channels, the receiver loop and the registry.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// The remote consumer for the partition is absent. Recoverable during
    /// registration, fatal afterwards.
    #[error("partition {0} is not registered at the remote node")]
    PartitionNotRegistered(Partition),
    /// The registration retry budget is exhausted.
    #[error("channel registration for partition {partition} failed after {attempts} attempts")]
    ChannelRegistrationFailed { partition: Partition, attempts: usize },
    /// The peer sent a frame the protocol does not allow.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}
