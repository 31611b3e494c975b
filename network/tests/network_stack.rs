//! End to end exercises of the channel/server pair on loopback.

use core::time::Duration;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use rill_buffer::{BufferManager, BufferProvider, TupleBuffer};
use rill_network::protocol::EventKind;
use rill_network::{
    ChannelRetryPolicy, ConsumerState, DataEmitter, EventListener, ExchangeListener, NetworkChannel,
    NetworkError, NetworkManager, NodeLocation, Partition, PartitionManager,
};

#[derive(Default)]
struct CountingListener {
    server_errors: AtomicUsize,
    channel_errors: AtomicUsize,
}

impl ExchangeListener for CountingListener {
    fn on_server_error(&self, _error: &NetworkError) {
        self.server_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn on_channel_error(&self, _error: &NetworkError) {
        self.channel_errors.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct CollectingEmitter {
    sequences: Mutex<Vec<u64>>,
    payload_heads: Mutex<Vec<u64>>,
    end_of_stream: AtomicBool,
}

impl DataEmitter for CollectingEmitter {
    fn emit_buffer(&self, buffer: TupleBuffer) {
        self.sequences.lock().unwrap().push(buffer.sequence_number());
        let head = u64::from_le_bytes(buffer.as_slice()[..8].try_into().unwrap());
        self.payload_heads.lock().unwrap().push(head);
    }

    fn on_end_of_stream(&self) {
        self.end_of_stream.store(true, Ordering::Release);
    }
}

fn wait_until(what: &str, mut probe: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !probe() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn start_node(buffers: usize) -> (NetworkManager, Arc<PartitionManager>, BufferManager) {
    let manager = BufferManager::new(256, buffers);
    let partitions = Arc::new(PartitionManager::new());
    let network = NetworkManager::start(
        NodeLocation::new(1, "127.0.0.1", 0),
        partitions.clone(),
        Arc::new(CountingListener::default()),
        Arc::new(manager.clone()),
    )
    .unwrap();
    (network, partitions, manager)
}

#[test]
fn registration_fails_without_consumer() {
    let (network, partitions, _buffers) = start_node(4);
    let partition = Partition::from((1, 22, 33, 44));

    let policy = ChannelRetryPolicy {
        retries: 3,
        backoff: Duration::from_millis(10),
    };
    let err = NetworkChannel::connect(network.location(), partition, policy).unwrap_err();
    assert!(matches!(
        err,
        NetworkError::ChannelRegistrationFailed { attempts: 3, .. }
    ));
    assert_eq!(partitions.consumer_state(partition), ConsumerState::Unregistered);
}

#[test]
fn buffers_arrive_in_order_through_a_small_pool() {
    let (network, partitions, buffers) = start_node(4);
    let partition = Partition::from((7, 1, 0, 0));
    let emitter = Arc::new(CollectingEmitter::default());
    assert!(network.register_subpartition_consumer(partition, emitter.clone()));

    let mut channel =
        NetworkChannel::connect(network.location(), partition, ChannelRetryPolicy::default())
            .unwrap();

    // More buffers than the receiving pool holds; delivery must still be
    // complete and ordered.
    const TOTAL: u64 = 20;
    for i in 0..TOTAL {
        let mut buffer = buffers.get_buffer_blocking();
        buffer.as_mut_slice()[..8].copy_from_slice(&i.to_le_bytes());
        buffer.set_number_of_tuples(1);
        channel.send_buffer(&buffer, 8).unwrap();
    }
    channel.close().unwrap();

    wait_until("end of stream", || {
        emitter.end_of_stream.load(Ordering::Acquire)
    });
    let heads = emitter.payload_heads.lock().unwrap().clone();
    assert_eq!(heads, (0..TOTAL).collect::<Vec<_>>());
    let sequences = emitter.sequences.lock().unwrap().clone();
    assert_eq!(sequences, (1..=TOTAL).collect::<Vec<_>>());

    assert!(network.unregister_subpartition_consumer(partition));
    assert_eq!(partitions.consumer_state(partition), ConsumerState::Deleted);
}

#[test]
fn two_producers_one_consumer_eos_after_last() {
    let (network, _partitions, buffers) = start_node(8);
    let partition = Partition::from((9, 2, 0, 0));
    let emitter = Arc::new(CollectingEmitter::default());
    assert!(network.register_subpartition_consumer(partition, emitter.clone()));

    let policy = ChannelRetryPolicy::default();
    let mut a = NetworkChannel::connect(network.location(), partition, policy).unwrap();
    let mut b = NetworkChannel::connect(network.location(), partition, policy).unwrap();

    for i in 0..5u64 {
        let mut buffer = buffers.get_buffer_blocking();
        buffer.as_mut_slice()[..8].copy_from_slice(&i.to_le_bytes());
        buffer.set_number_of_tuples(1);
        a.send_buffer(&buffer, 8).unwrap();
    }
    a.close().unwrap();
    assert!(
        !emitter.end_of_stream.load(Ordering::Acquire),
        "end of stream must wait for every producer"
    );

    let mut buffer = buffers.get_buffer_blocking();
    buffer.as_mut_slice()[..8].copy_from_slice(&99u64.to_le_bytes());
    buffer.set_number_of_tuples(1);
    b.send_buffer(&buffer, 8).unwrap();
    b.close().unwrap();

    wait_until("end of stream", || {
        emitter.end_of_stream.load(Ordering::Acquire)
    });
    assert_eq!(emitter.payload_heads.lock().unwrap().len(), 6);
}

#[test]
fn events_reach_the_registered_listener() {
    struct Pause {
        seen: Mutex<Vec<(EventKind, Bytes)>>,
    }

    impl EventListener for Pause {
        fn on_event(&self, kind: EventKind, payload: Bytes) {
            self.seen.lock().unwrap().push((kind, payload));
        }
    }

    let (network, _partitions, _buffers) = start_node(4);
    let partition = Partition::from((3, 4, 5, 6));
    let listener = Arc::new(Pause {
        seen: Mutex::new(Vec::new()),
    });
    network.register_event_listener(partition, listener.clone());

    let mut channel = network
        .create_event_channel(network.location(), partition, ChannelRetryPolicy::default())
        .unwrap();
    channel.send_event(EventKind::PauseRequested, b"").unwrap();
    channel.send_event(EventKind::Custom(7), b"opaque").unwrap();
    channel.close().unwrap();

    wait_until("events", || listener.seen.lock().unwrap().len() == 2);
    let seen = listener.seen.lock().unwrap();
    assert_eq!(seen[0].0, EventKind::PauseRequested);
    assert_eq!(seen[1].0, EventKind::Custom(7));
    assert_eq!(&seen[1].1[..], b"opaque");
}
