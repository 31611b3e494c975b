//! Receiver side: one I/O thread per node, accepting producer connections
//! and dispatching decoded frames against the partition registry.

use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::BytesMut;
use rill_buffer::BufferProvider;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::LocalSet;
use tracing::{debug, error, trace, warn};

use crate::error::NetworkError;
use crate::exchange::ExchangeProtocol;
use crate::partition::Partition;
use crate::protocol::{ChannelKind, FrameDecoder, Message, WireError, encode};

const BACKLOG: u32 = 256;
const READ_BUF: usize = 16 * 1024;

/// Build the server socket: bound, reusable and listening before the
/// runtime thread takes over.
pub(crate) fn bind(host: &str, port: u16) -> io::Result<StdTcpListener> {
    let addr: SocketAddr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "host resolved to nothing"))?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG as i32)?;
    Ok(socket.into())
}

/// Spawn the I/O thread hosting the accept loop on a current-thread
/// runtime.
pub(crate) fn spawn(
    listener: StdTcpListener,
    protocol: ExchangeProtocol,
    provider: Arc<dyn BufferProvider>,
    shutdown: watch::Receiver<bool>,
) -> io::Result<JoinHandle<()>> {
    listener.set_nonblocking(true)?;
    thread::Builder::new()
        .name("rill-net-io".into())
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("network io runtime");
            let local = LocalSet::new();
            local.block_on(&rt, accept_loop(listener, protocol, provider, shutdown));
        })
}

async fn accept_loop(
    listener: StdTcpListener,
    protocol: ExchangeProtocol,
    provider: Arc<dyn BufferProvider>,
    mut shutdown: watch::Receiver<bool>,
) {
    let listener = tokio::net::TcpListener::from_std(listener).expect("listener onto runtime");
    let max_frame = provider.buffer_size() + 1024;
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    trace!(%peer, "accepted producer connection");
                    let protocol = protocol.clone();
                    let provider = provider.clone();
                    tokio::task::spawn_local(async move {
                        handle_connection(stream, peer, protocol, provider, max_frame).await;
                    });
                }
                Err(err) => {
                    error!(%err, "accept failed");
                    protocol.listener().on_server_error(&err.into());
                    tokio::time::sleep(core::time::Duration::from_millis(100)).await;
                }
            }
        }
    }
    debug!("network io thread stopping");
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    protocol: ExchangeProtocol,
    provider: Arc<dyn BufferProvider>,
    max_frame: usize,
) {
    match connection_loop(&mut stream, &protocol, &provider, max_frame).await {
        Ok(()) => trace!(%peer, "producer connection closed"),
        Err(err) => {
            warn!(%peer, %err, "producer connection failed");
            if matches!(err, NetworkError::Protocol(_)) {
                // Best effort notification before the close; the partition
                // of a malformed frame is unknown.
                let mut reply = BytesMut::new();
                encode(
                    &mut reply,
                    Partition::from((0, 0, 0, 0)),
                    &Message::Error {
                        kind: WireError::Protocol,
                    },
                );
                let _ = stream.write_all(&reply).await;
            }
            protocol.listener().on_server_error(&err);
        }
    }
}

async fn connection_loop(
    stream: &mut TcpStream,
    protocol: &ExchangeProtocol,
    provider: &Arc<dyn BufferProvider>,
    max_frame: usize,
) -> Result<(), NetworkError> {
    stream.set_nodelay(true)?;
    let decoder = FrameDecoder::new(max_frame);
    let mut buf = BytesMut::with_capacity(READ_BUF);
    let mut reply = BytesMut::new();
    // The channel kind is fixed by the first announcement on the
    // connection.
    let mut announced: Option<ChannelKind> = None;

    loop {
        while let Some(frame) = decoder.decode(&mut buf)? {
            let partition = frame.partition;
            match frame.message {
                Message::Announcement { kind } => {
                    let outcome = protocol.on_announcement(partition, kind);
                    if outcome.is_ok() {
                        announced = Some(kind);
                    }
                    send_reply(stream, &mut reply, partition, outcome).await?;
                }
                Message::Data { header, payload } => {
                    if announced != Some(ChannelKind::Data) {
                        return Err(NetworkError::Protocol("data before announcement"));
                    }
                    if payload.len() > provider.buffer_size() {
                        return Err(NetworkError::Protocol("data exceeds buffer size"));
                    }
                    // Check registration before taking a buffer: frames for
                    // absent consumers are rejected, never buffered.
                    if protocol.partitions().emitter(partition).is_none() {
                        send_reply(
                            stream,
                            &mut reply,
                            partition,
                            Err(WireError::PartitionNotRegistered),
                        )
                        .await?;
                        continue;
                    }
                    let mut buffer = acquire(provider.as_ref()).await;
                    buffer.as_mut_slice()[..payload.len()].copy_from_slice(&payload);
                    buffer.set_watermark_ms(header.watermark_ms);
                    buffer.set_sequence_number(header.sequence);
                    buffer.set_origin_id(partition.operator_id().get());
                    buffer.set_number_of_tuples(header.tuple_count);
                    if let Err(kind) = protocol.on_data(partition, buffer) {
                        send_reply(stream, &mut reply, partition, Err(kind)).await?;
                    }
                }
                Message::Event { kind, payload } => {
                    protocol.on_event(partition, kind, payload);
                }
                Message::EndOfStream => {
                    let Some(kind) = announced else {
                        return Err(NetworkError::Protocol("end of stream before announcement"));
                    };
                    let outcome = protocol.on_end_of_stream(partition, kind);
                    send_reply(stream, &mut reply, partition, outcome).await?;
                }
                Message::Ack | Message::Error { .. } => {
                    return Err(NetworkError::Protocol("unexpected client frame"));
                }
            }
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Ok(());
        }
    }
}

async fn send_reply(
    stream: &mut TcpStream,
    reply: &mut BytesMut,
    partition: Partition,
    outcome: Result<(), WireError>,
) -> Result<(), NetworkError> {
    reply.clear();
    let message = match outcome {
        Ok(()) => Message::Ack,
        Err(kind) => Message::Error { kind },
    };
    encode(reply, partition, &message);
    stream.write_all(reply).await?;
    Ok(())
}

/// Take a buffer without stalling the reactor. An exhausted pool pauses
/// only this connection; other channels keep draining.
async fn acquire(provider: &dyn BufferProvider) -> rill_buffer::TupleBuffer {
    loop {
        if let Some(buffer) = provider.try_get_buffer() {
            return buffer;
        }
        tokio::time::sleep(core::time::Duration::from_micros(500)).await;
    }
}
