//! Producer side channels.
//!
//! Channels are owned by one worker thread each, so all I/O here is plain
//! blocking socket code. The blocking `write_all` against the kernel send
//! queue is the bounded send queue of the protocol: a slow consumer
//! eventually stalls the producing worker.

use core::time::Duration;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;

use bytes::{Bytes, BytesMut};
use rill_buffer::TupleBuffer;
use tracing::{debug, trace, warn};

use crate::error::NetworkError;
use crate::partition::{NodeLocation, Partition};
use crate::protocol::{ChannelKind, DataHeader, EventKind, FrameDecoder, Message, WireError, encode};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
const READ_CHUNK: usize = 4096;

/// Retry budget for the registration handshake. Retries apply only to
/// registration; a send failing after registration is surfaced, not
/// retried.
#[derive(Debug, Clone, Copy)]
pub struct ChannelRetryPolicy {
    pub retries: usize,
    pub backoff: Duration,
}

impl Default for ChannelRetryPolicy {
    fn default() -> Self {
        ChannelRetryPolicy {
            retries: 10,
            backoff: Duration::from_millis(100),
        }
    }
}

#[derive(Debug)]
struct Wire {
    stream: TcpStream,
    partition: Partition,
    write_buf: BytesMut,
    read_buf: BytesMut,
    decoder: FrameDecoder,
}

impl Wire {
    /// Connect and announce, retrying while the remote consumer has not
    /// registered yet.
    fn register(
        remote: &NodeLocation,
        partition: Partition,
        kind: ChannelKind,
        policy: ChannelRetryPolicy,
    ) -> Result<Wire, NetworkError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match Wire::announce(remote, partition, kind) {
                Ok(wire) => {
                    debug!(%partition, remote = %remote.address(), attempt, "channel registered");
                    return Ok(wire);
                }
                Err(NetworkError::Protocol(reason)) => {
                    return Err(NetworkError::Protocol(reason));
                }
                Err(err) if attempt >= policy.retries.max(1) => {
                    warn!(%partition, attempt, %err, "channel registration budget exhausted");
                    return Err(NetworkError::ChannelRegistrationFailed {
                        partition,
                        attempts: attempt,
                    });
                }
                Err(err) => {
                    trace!(%partition, attempt, %err, "channel registration retry");
                    thread::sleep(policy.backoff);
                }
            }
        }
    }

    fn announce(
        remote: &NodeLocation,
        partition: Partition,
        kind: ChannelKind,
    ) -> Result<Wire, NetworkError> {
        let stream = TcpStream::connect(remote.address())?;
        stream.set_nodelay(true)?;
        let mut wire = Wire {
            stream,
            partition,
            write_buf: BytesMut::with_capacity(READ_CHUNK),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            decoder: FrameDecoder::new(READ_CHUNK),
        };
        wire.send(&Message::Announcement { kind })?;
        wire.stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        let reply = wire.read_frame()?;
        wire.stream.set_read_timeout(None)?;
        match reply {
            Message::Ack => Ok(wire),
            Message::Error {
                kind: WireError::PartitionNotRegistered,
            } => Err(NetworkError::PartitionNotRegistered(partition)),
            _ => Err(NetworkError::Protocol("unexpected handshake reply")),
        }
    }

    fn send(&mut self, message: &Message) -> Result<(), NetworkError> {
        self.write_buf.clear();
        encode(&mut self.write_buf, self.partition, message);
        self.stream.write_all(&self.write_buf)?;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Message, NetworkError> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.read_buf)? {
                return Ok(frame.message);
            }
            let mut chunk = [0u8; READ_CHUNK];
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Err(NetworkError::Protocol("connection closed during handshake"));
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Ordered close: end of stream strictly after all sent data, then an
    /// ack from the receiver.
    fn close(mut self) -> Result<(), NetworkError> {
        self.send(&Message::EndOfStream)?;
        self.stream.flush()?;
        self.stream.set_read_timeout(Some(CLOSE_TIMEOUT))?;
        match self.read_frame()? {
            Message::Ack => {
                let _ = self.stream.shutdown(std::net::Shutdown::Both);
                Ok(())
            }
            _ => Err(NetworkError::Protocol("unexpected close reply")),
        }
    }
}

/// Data channel from one local producer to a remote partition consumer.
#[derive(Debug)]
pub struct NetworkChannel {
    wire: Wire,
    next_sequence: u64,
}

impl NetworkChannel {
    /// Connect to `remote` and run the registration handshake under the
    /// given retry policy.
    pub fn connect(
        remote: &NodeLocation,
        partition: Partition,
        policy: ChannelRetryPolicy,
    ) -> Result<Self, NetworkError> {
        Ok(NetworkChannel {
            wire: Wire::register(remote, partition, ChannelKind::Data, policy)?,
            next_sequence: 1,
        })
    }

    pub fn partition(&self) -> Partition {
        self.wire.partition
    }

    /// Ship the used region of a buffer. Blocks when the kernel send queue
    /// is full, which is the backpressure path.
    pub fn send_buffer(
        &mut self,
        buffer: &TupleBuffer,
        tuple_size: usize,
    ) -> Result<(), NetworkError> {
        let tuple_count = buffer.number_of_tuples();
        let used = tuple_count as usize * tuple_size;
        if used > buffer.buffer_size() {
            return Err(NetworkError::Protocol("tuple region exceeds buffer size"));
        }
        let header = DataHeader {
            sequence: self.next_sequence,
            watermark_ms: buffer.watermark_ms(),
            tuple_count,
            tuple_size: tuple_size as u64,
        };
        self.next_sequence += 1;
        let message = Message::Data {
            header,
            payload: Bytes::copy_from_slice(&buffer.as_slice()[..used]),
        };
        self.wire.send(&message)
    }

    /// Best effort event on the data direction; never retried.
    pub fn send_event(&mut self, kind: EventKind, payload: &[u8]) -> Result<(), NetworkError> {
        self.wire.send(&Message::Event {
            kind,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    /// Send end of stream, await the ack and tear the socket down.
    pub fn close(self) -> Result<(), NetworkError> {
        debug!(partition = %self.wire.partition, "closing data channel");
        self.wire.close()
    }
}

/// Reverse direction channel carrying events from a consumer back to the
/// node hosting the producer.
pub struct EventChannel {
    wire: Wire,
}

impl EventChannel {
    pub fn connect(
        remote: &NodeLocation,
        partition: Partition,
        policy: ChannelRetryPolicy,
    ) -> Result<Self, NetworkError> {
        Ok(EventChannel {
            wire: Wire::register(remote, partition, ChannelKind::Event, policy)?,
        })
    }

    pub fn partition(&self) -> Partition {
        self.wire.partition
    }

    pub fn send_event(&mut self, kind: EventKind, payload: &[u8]) -> Result<(), NetworkError> {
        self.wire.send(&Message::Event {
            kind,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    pub fn close(self) -> Result<(), NetworkError> {
        self.wire.close()
    }
}
