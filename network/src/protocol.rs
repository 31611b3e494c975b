//! Wire protocol framing.
//!
//! Every message is a length prefixed frame: a 4 byte little endian payload
//! length, one message type byte, the partition four-tuple as four
//! consecutive little endian u64, then the type specific payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::NetworkError;
use crate::partition::Partition;

/// Message type byte plus the serialized partition.
const FRAME_HEADER: usize = 1 + 4 * 8;

/// Per-buffer metadata travelling ahead of the payload bytes of a data
/// frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub sequence: u64,
    pub watermark_ms: u64,
    pub tuple_count: u64,
    pub tuple_size: u64,
}

/// What a producer announces itself as during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Ships tuple buffers downstream.
    Data,
    /// Ships control events back upstream.
    Event,
}

/// Out-of-band control signal. Events carry urgent signals and may overtake
/// pending data in a producer's send path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    PauseRequested,
    ResumeRequested,
    Custom(u16),
}

/// Error codes that travel the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    PartitionNotRegistered,
    Protocol,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Producer handshake, answered with [`Message::Ack`] or
    /// [`Message::Error`].
    Announcement { kind: ChannelKind },
    Ack,
    Data { header: DataHeader, payload: Bytes },
    Event { kind: EventKind, payload: Bytes },
    /// Strictly ordered after all data of its channel.
    EndOfStream,
    Error { kind: WireError },
}

impl Message {
    const ANNOUNCEMENT: u8 = 0;
    const ACK: u8 = 1;
    const DATA: u8 = 2;
    const EVENT: u8 = 3;
    const END_OF_STREAM: u8 = 4;
    const ERROR: u8 = 5;

    fn type_byte(&self) -> u8 {
        match self {
            Message::Announcement { .. } => Self::ANNOUNCEMENT,
            Message::Ack => Self::ACK,
            Message::Data { .. } => Self::DATA,
            Message::Event { .. } => Self::EVENT,
            Message::EndOfStream => Self::END_OF_STREAM,
            Message::Error { .. } => Self::ERROR,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Message::Announcement { .. } => 1,
            Message::Ack | Message::EndOfStream => 0,
            Message::Data { payload, .. } => 4 * 8 + payload.len(),
            Message::Event { kind, payload } => {
                1 + if matches!(kind, EventKind::Custom(_)) { 2 } else { 0 } + payload.len()
            }
            Message::Error { .. } => 1,
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub partition: Partition,
    pub message: Message,
}

/// Serialize one frame into `dst`.
pub fn encode(dst: &mut BytesMut, partition: Partition, message: &Message) {
    let len = FRAME_HEADER + message.payload_len();
    dst.reserve(4 + len);
    dst.put_u32_le(len as u32);
    dst.put_u8(message.type_byte());
    dst.put_u64_le(partition.query_id().get());
    dst.put_u64_le(partition.operator_id().get());
    dst.put_u64_le(partition.partition_id().get());
    dst.put_u64_le(partition.subpartition_id().get());
    match message {
        Message::Announcement { kind } => {
            dst.put_u8(match kind {
                ChannelKind::Data => 0,
                ChannelKind::Event => 1,
            });
        }
        Message::Ack | Message::EndOfStream => {}
        Message::Data { header, payload } => {
            dst.put_u64_le(header.sequence);
            dst.put_u64_le(header.watermark_ms);
            dst.put_u64_le(header.tuple_count);
            dst.put_u64_le(header.tuple_size);
            dst.put_slice(payload);
        }
        Message::Event { kind, payload } => {
            match kind {
                EventKind::PauseRequested => dst.put_u8(0),
                EventKind::ResumeRequested => dst.put_u8(1),
                EventKind::Custom(code) => {
                    dst.put_u8(2);
                    dst.put_u16_le(*code);
                }
            }
            dst.put_slice(payload);
        }
        Message::Error { kind } => {
            dst.put_u8(match kind {
                WireError::PartitionNotRegistered => 0,
                WireError::Protocol => 1,
            });
        }
    }
}

/// Incremental frame decoder over a read buffer.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    max_frame: usize,
}

impl FrameDecoder {
    /// `max_frame` bounds the accepted frame length; a peer announcing more
    /// is a protocol violation, not an allocation request.
    pub fn new(max_frame: usize) -> Self {
        FrameDecoder { max_frame }
    }

    /// Pop one complete frame off `src`, or `None` when more bytes are
    /// needed.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Frame>, NetworkError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_le_bytes(src[..4].try_into().expect("peeked 4 bytes")) as usize;
        if len < FRAME_HEADER {
            return Err(NetworkError::Protocol("frame shorter than its header"));
        }
        if len > self.max_frame {
            return Err(NetworkError::Protocol("frame exceeds maximum size"));
        }
        if src.len() < 4 + len {
            return Ok(None);
        }
        src.advance(4);
        let mut frame = src.split_to(len).freeze();
        Ok(Some(parse(&mut frame)?))
    }
}

fn parse(frame: &mut Bytes) -> Result<Frame, NetworkError> {
    let type_byte = frame.get_u8();
    let partition = Partition::from((
        frame.get_u64_le(),
        frame.get_u64_le(),
        frame.get_u64_le(),
        frame.get_u64_le(),
    ));
    let message = match type_byte {
        Message::ANNOUNCEMENT => {
            if frame.remaining() < 1 {
                return Err(NetworkError::Protocol("truncated announcement"));
            }
            let kind = match frame.get_u8() {
                0 => ChannelKind::Data,
                1 => ChannelKind::Event,
                _ => return Err(NetworkError::Protocol("unknown channel kind")),
            };
            Message::Announcement { kind }
        }
        Message::ACK => Message::Ack,
        Message::DATA => {
            if frame.remaining() < 4 * 8 {
                return Err(NetworkError::Protocol("truncated data header"));
            }
            let header = DataHeader {
                sequence: frame.get_u64_le(),
                watermark_ms: frame.get_u64_le(),
                tuple_count: frame.get_u64_le(),
                tuple_size: frame.get_u64_le(),
            };
            let expected = header
                .tuple_count
                .checked_mul(header.tuple_size)
                .ok_or(NetworkError::Protocol("data size overflow"))?;
            if frame.remaining() as u64 != expected {
                return Err(NetworkError::Protocol("data payload length mismatch"));
            }
            Message::Data {
                header,
                payload: frame.split_to(frame.remaining()),
            }
        }
        Message::EVENT => {
            if frame.remaining() < 1 {
                return Err(NetworkError::Protocol("truncated event"));
            }
            let kind = match frame.get_u8() {
                0 => EventKind::PauseRequested,
                1 => EventKind::ResumeRequested,
                2 => {
                    if frame.remaining() < 2 {
                        return Err(NetworkError::Protocol("truncated event code"));
                    }
                    EventKind::Custom(frame.get_u16_le())
                }
                _ => return Err(NetworkError::Protocol("unknown event kind")),
            };
            Message::Event {
                kind,
                payload: frame.split_to(frame.remaining()),
            }
        }
        Message::END_OF_STREAM => Message::EndOfStream,
        Message::ERROR => {
            if frame.remaining() < 1 {
                return Err(NetworkError::Protocol("truncated error"));
            }
            let kind = match frame.get_u8() {
                0 => WireError::PartitionNotRegistered,
                1 => WireError::Protocol,
                _ => return Err(NetworkError::Protocol("unknown error kind")),
            };
            Message::Error { kind }
        }
        _ => return Err(NetworkError::Protocol("unknown message type")),
    };
    Ok(Frame { partition, message })
}
