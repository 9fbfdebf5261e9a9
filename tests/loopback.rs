//! End-to-end engine tests over an in-memory link.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nd_transport::core::{NdConfig, NdConfigBuilder, NdError, NdResult, PriorityClass};
use nd_transport::protocol::{MemoryPool, Segment, SegmentHeader, SegmentType};
use nd_transport::transport::{ConnState, ConnStats, NdStack, RecvFlags, SendFlags, Transmit};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

const NODE_A: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
const NODE_B: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
const PORT: u16 = 9000;

/// One direction of the link. Optionally loses the first data segment at
/// sequence zero.
struct Pipe {
    from: IpAddr,
    tx: UnboundedSender<(IpAddr, Vec<u8>)>,
    lose_first_data: AtomicBool,
}

impl Transmit for Pipe {
    fn transmit(&self, _peer: IpAddr, _class: PriorityClass, frame: Vec<u8>) -> NdResult<()> {
        let header = SegmentHeader::from_bytes(&frame)?;
        if header.kind == SegmentType::Data
            && header.seq == 0
            && self.lose_first_data.swap(false, Ordering::AcqRel)
        {
            return Ok(());
        }
        self.tx
            .send((self.from, frame))
            .map_err(|_| NdError::NotConnected)
    }
}

async fn pump(mut rx: UnboundedReceiver<(IpAddr, Vec<u8>)>, stack: NdStack) {
    while let Some((from, frame)) = rx.recv().await {
        stack.on_bytes(from, &frame).unwrap();
    }
}

fn config() -> NdConfig {
    NdConfigBuilder::new()
        .rcvbuf(60_000)
        .sndbuf(30_000)
        .segment_cap(1500)
        .max_gso_data(3000)
        .max_grant_batch(15_000)
        .flow_wait_timeout(Duration::from_millis(20))
        .connect_timeout(Duration::from_millis(200))
        .cores(2)
        .build()
        .unwrap()
}

fn pair_with(config: NdConfig, lossy: bool) -> (NdStack, NdStack) {
    let pool = Arc::new(MemoryPool::from_config(&config));
    link(config, lossy, pool)
}

/// Two stacks joined by pipes; `b` draws receive memory from `b_pool`.
fn link(config: NdConfig, lossy: bool, b_pool: Arc<MemoryPool>) -> (NdStack, NdStack) {
    let (to_b, from_a) = mpsc::unbounded_channel();
    let (to_a, from_b) = mpsc::unbounded_channel();
    let a = NdStack::new(
        config.clone(),
        Arc::new(Pipe {
            from: NODE_A,
            tx: to_b,
            lose_first_data: AtomicBool::new(lossy),
        }),
    )
    .unwrap();
    let b = NdStack::with_pool(
        config,
        Arc::new(Pipe {
            from: NODE_B,
            tx: to_a,
            lose_first_data: AtomicBool::new(false),
        }),
        b_pool,
    )
    .unwrap();
    tokio::spawn(pump(from_a, b.clone()));
    tokio::spawn(pump(from_b, a.clone()));
    (a, b)
}

/// Keeps every frame a stack emits instead of carrying it anywhere.
#[derive(Default)]
struct Capture {
    frames: Mutex<Vec<Vec<u8>>>,
}

impl Transmit for Capture {
    fn transmit(&self, _peer: IpAddr, _class: PriorityClass, frame: Vec<u8>) -> NdResult<()> {
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }
}

fn data_frame(source: u16, dest: u16, seq: u32, len: usize) -> Vec<u8> {
    Segment::new(SegmentType::Data, source, dest, seq, vec![0xab; len]).encode()
}

/// Grant geometry where a receive buffer holds exactly `rcvbuf / 1000` segments.
fn tight_config(rcvbuf: usize) -> NdConfig {
    NdConfigBuilder::new()
        .rcvbuf(rcvbuf)
        .sndbuf(10_000)
        .segment_cap(1000)
        .max_gso_data(1000)
        .max_grant_batch(rcvbuf)
        .flow_wait_timeout(Duration::from_millis(20))
        .connect_timeout(Duration::from_millis(500))
        .build()
        .unwrap()
}

fn pair() -> (NdStack, NdStack) {
    pair_with(config(), false)
}

fn message(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_message_delivered_in_order() {
    let (a, b) = pair();
    let mut listener = b.listen(PORT).unwrap();
    let data = message(200_000);

    let sender = a.connect(NODE_B, PORT, data.len() as u32).await.unwrap();
    let receiver = listener.accept().await.unwrap();
    assert_eq!(receiver.key().peer, NODE_A);
    assert_eq!(receiver.key().remote_port, sender.key().local_port);

    let payload = data.clone();
    let send = tokio::spawn(async move {
        let sent = sender.send(&payload, SendFlags::default()).await?;
        Ok::<_, NdError>((sent, sender))
    });

    let received = receiver.recv_to_end().await.unwrap();
    assert_eq!(received.len(), data.len());
    assert!(received == data);

    let (sent, sender) = send.await.unwrap().unwrap();
    assert_eq!(sent, data.len());

    eventually(|| a.connection_count() == 0 && b.connection_count() == 0).await;
    assert_eq!(sender.state(), ConnState::Closed);
    assert_eq!(a.pool().allocated(), 0);
    assert_eq!(b.pool().allocated(), 0);

    // a consumed message reads as end of stream
    assert!(receiver.recv(10, RecvFlags::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_small_writes_coalesce() {
    let (a, b) = pair();
    let mut listener = b.listen(PORT).unwrap();
    let sender = a.connect(NODE_B, PORT, 4000).await.unwrap();
    let receiver = listener.accept().await.unwrap();

    for chunk in message(4000).chunks(400) {
        let n = sender.send(chunk, SendFlags::default().more()).await.unwrap();
        assert_eq!(n, 400);
    }
    sender.send(&[], SendFlags::default()).await.unwrap();

    let received = receiver.recv_to_end().await.unwrap();
    assert!(received == message(4000));
    // 4000 bytes at 1500 per segment
    assert_eq!(sender.stats().write_seq, 4000);
}

#[tokio::test]
async fn test_lost_segment_recovered_by_nudge() {
    let (a, b) = pair_with(config(), true);
    let mut listener = b.listen(PORT).unwrap();
    let data = message(20_000);

    let sender = a.connect(NODE_B, PORT, data.len() as u32).await.unwrap();
    let receiver = listener.accept().await.unwrap();

    let payload = data.clone();
    let send = tokio::spawn(async move {
        sender.send(&payload, SendFlags::default()).await?;
        Ok::<_, NdError>(sender)
    });

    let received = receiver.recv_to_end().await.unwrap();
    assert!(received == data);
    assert!(receiver.stats().anomalies > 0);

    let sender = send.await.unwrap().unwrap();
    assert!(sender.stats().retransmits > 0);
    eventually(|| a.connection_count() == 0).await;
}

#[tokio::test]
async fn test_connect_without_listener_times_out() {
    let (a, _b) = pair();
    let err = a.connect(NODE_B, PORT, 100).await.unwrap_err();
    assert!(matches!(err, NdError::TimedOut));
    assert_eq!(err.status(), -110);
    assert_eq!(a.connection_count(), 0);
}

#[tokio::test]
async fn test_send_beyond_announced_length() {
    let (a, b) = pair();
    let _listener = b.listen(PORT).unwrap();
    let sender = a.connect(NODE_B, PORT, 10).await.unwrap();
    let err = sender.send(&[0u8; 11], SendFlags::default()).await.unwrap_err();
    assert!(matches!(err, NdError::MessageTooLong { limit: 10 }));
}

#[tokio::test]
async fn test_receiver_abort_resets_sender() {
    let (a, b) = pair();
    let mut listener = b.listen(PORT).unwrap();
    let data = message(500_000);
    let sender = a.connect(NODE_B, PORT, data.len() as u32).await.unwrap();
    let receiver = listener.accept().await.unwrap();
    drop(receiver);

    match sender.send(&data, SendFlags::default()).await {
        Ok(sent) => assert!(sent < data.len()),
        Err(err) => assert!(matches!(err, NdError::ConnectionReset)),
    }
    let err = sender.send(b"x", SendFlags::default()).await.unwrap_err();
    assert!(matches!(err, NdError::ConnectionReset));
    eventually(|| a.connection_count() == 0 && b.connection_count() == 0).await;
}

#[tokio::test]
async fn test_nonblocking_recv_would_block() {
    let (a, b) = pair();
    let mut listener = b.listen(PORT).unwrap();
    let _sender = a.connect(NODE_B, PORT, 100).await.unwrap();
    let receiver = listener.accept().await.unwrap();

    let err = receiver
        .recv(100, RecvFlags::default().nonblocking())
        .await
        .unwrap_err();
    assert!(matches!(err, NdError::WouldBlock));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_wait_all_collects_full_length() {
    let (a, b) = pair();
    let mut listener = b.listen(PORT).unwrap();
    let sender = a.connect(NODE_B, PORT, 3000).await.unwrap();
    let receiver = listener.accept().await.unwrap();

    let reader = tokio::spawn(async move {
        let first = receiver.recv(2500, RecvFlags::default().wait_all()).await?;
        let rest = receiver.discard(1000, RecvFlags::default()).await?;
        Ok::<_, NdError>((first, rest))
    });
    sender.send(&message(1000), SendFlags::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    sender.send(&message(2000), SendFlags::default()).await.unwrap();

    let (first, rest) = reader.await.unwrap().unwrap();
    assert_eq!(first.len(), 2500);
    assert_eq!(rest, 500);
}

#[tokio::test]
async fn test_zero_length_message() {
    let (a, b) = pair();
    let mut listener = b.listen(PORT).unwrap();
    let sender = a.connect(NODE_B, PORT, 0).await.unwrap();
    let receiver = listener.accept().await.unwrap();
    assert!(receiver.recv(10, RecvFlags::default()).await.unwrap().is_empty());
    assert!(matches!(
        sender.send(b"", SendFlags::default()).await,
        Err(NdError::BrokenPipe) | Ok(0)
    ));
}

#[tokio::test]
async fn test_interrupt_wakes_receiver() {
    let (a, b) = pair();
    let mut listener = b.listen(PORT).unwrap();
    let _sender = a.connect(NODE_B, PORT, 100).await.unwrap();
    let receiver = Arc::new(listener.accept().await.unwrap());

    let blocked = Arc::clone(&receiver);
    let reader = tokio::spawn(async move { blocked.recv(100, RecvFlags::default()).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    receiver.interrupt();
    let err = reader.await.unwrap().unwrap_err();
    assert!(matches!(err, NdError::Interrupted));
}

#[tokio::test]
async fn test_recv_timeout() {
    let config = NdConfigBuilder::new()
        .rcvbuf(60_000)
        .segment_cap(1500)
        .max_gso_data(3000)
        .max_grant_batch(15_000)
        .recv_timeout(Some(Duration::from_millis(30)))
        .build()
        .unwrap();
    let (a, b) = pair_with(config, false);
    let mut listener = b.listen(PORT).unwrap();
    let _sender = a.connect(NODE_B, PORT, 100).await.unwrap();
    let receiver = listener.accept().await.unwrap();
    let err = receiver.recv(100, RecvFlags::default()).await.unwrap_err();
    assert!(matches!(err, NdError::TimedOut));
}

#[tokio::test]
async fn test_listen_port_in_use() {
    let (_a, b) = pair();
    let _first = b.listen(PORT).unwrap();
    assert!(matches!(b.listen(PORT), Err(NdError::Io(_))));
}

#[tokio::test]
async fn test_shutdown_resets_peer() {
    let (a, b) = pair();
    let mut listener = b.listen(PORT).unwrap();
    let _sender = a.connect(NODE_B, PORT, 1000).await.unwrap();
    let receiver = listener.accept().await.unwrap();

    a.shutdown();
    let err = receiver.recv(1000, RecvFlags::default()).await.unwrap_err();
    assert!(matches!(err, NdError::ConnectionReset));
    assert!(matches!(
        a.connect(NODE_B, PORT, 10).await,
        Err(NdError::NotConnected)
    ));
}

#[tokio::test]
async fn test_legacy_calls_unsupported() {
    let (a, b) = pair();
    let _listener = b.listen(PORT).unwrap();
    let sender = a.connect(NODE_B, PORT, 10).await.unwrap();
    assert!(matches!(sender.ioctl(0x541B), Err(NdError::Unsupported(_))));
    assert!(matches!(sender.poll_events(), Err(NdError::Unsupported(_))));
    assert_eq!(sender.set_option(1, 7, &[0; 4]).unwrap_err().status(), -38);
}

#[tokio::test]
async fn test_grant_boundary_inside_segment() {
    let (a, b) = pair_with(tight_config(1000), false);
    let mut listener = b.listen(PORT).unwrap();
    let data = message(3000);
    let sender = a.connect(NODE_B, PORT, 3000).await.unwrap();
    let receiver = listener.accept().await.unwrap();

    // the second write's segments start at 500, across every 1000-byte grant
    let payload = data.clone();
    let send = tokio::spawn(async move {
        sender.send(&payload[..500], SendFlags::default()).await?;
        sender.send(&payload[500..], SendFlags::default()).await?;
        Ok::<_, NdError>(sender)
    });

    let received = tokio::time::timeout(Duration::from_secs(5), receiver.recv_to_end())
        .await
        .expect("transfer stalled")
        .unwrap();
    assert!(received == data);
    send.await.unwrap().unwrap();
    eventually(|| a.connection_count() == 0 && b.parked_flows() == 0).await;
}

#[tokio::test]
async fn test_full_buffer_parks_flow_until_read() {
    let (a, b) = pair_with(tight_config(3000), false);
    let mut listener = b.listen(PORT).unwrap();
    let data = message(9000);
    let sender = a.connect(NODE_B, PORT, 9000).await.unwrap();
    let receiver = listener.accept().await.unwrap();

    let payload = data.clone();
    let send = tokio::spawn(async move { sender.send(&payload, SendFlags::default()).await });

    // one grant fills the buffer; nothing is read, so no more can be granted
    eventually(|| b.parked_flows() == 1 && receiver.stats().in_pq).await;
    let stats = receiver.stats();
    assert_eq!(stats.rcv_nxt, 3000);
    assert_eq!(stats.grant_nxt, 3000);
    assert_eq!(stats.in_flight_bytes, 0);
    assert_eq!(stats.copied_seq, 0);

    let mut received = receiver.recv(1000, RecvFlags::default()).await.unwrap();
    assert_eq!(received.len(), 1000);
    let stats = receiver.stats();
    assert!(!stats.in_pq);
    assert_eq!(stats.grant_nxt, 4000);
    assert_eq!(b.parked_flows(), 0);

    received.extend(receiver.recv_to_end().await.unwrap());
    assert!(received == data);
    assert_eq!(send.await.unwrap().unwrap(), data.len());
    eventually(|| b.connection_count() == 0 && b.parked_flows() == 0).await;
    assert_eq!(b.pool().allocated(), 0);
}

#[tokio::test]
async fn test_shared_pool_stays_under_high_watermark() {
    // room for two connections' receive quota, not three
    let pool = Arc::new(MemoryPool::new([1, 2, 2]));
    let (a, b) = link(tight_config(3000), false, Arc::clone(&pool));
    let mut listener = b.listen(PORT).unwrap();

    let peak = Arc::new(AtomicUsize::new(0));
    let watching = Arc::new(AtomicBool::new(true));
    let monitor = {
        let (pool, peak, watching) = (Arc::clone(&pool), Arc::clone(&peak), Arc::clone(&watching));
        tokio::spawn(async move {
            while watching.load(Ordering::Acquire) {
                peak.fetch_max(pool.allocated(), Ordering::AcqRel);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };

    let mut sends = Vec::new();
    let mut reads = Vec::new();
    for i in 0..3u8 {
        let sender = a.connect(NODE_B, PORT, 9000).await.unwrap();
        let receiver = listener.accept().await.unwrap();
        sends.push(tokio::spawn(async move {
            sender.send(&[i; 9000], SendFlags::default()).await
        }));
        reads.push(tokio::spawn(async move { receiver.recv_to_end().await }));
    }

    for (i, read) in reads.into_iter().enumerate() {
        let message = tokio::time::timeout(Duration::from_secs(10), read)
            .await
            .expect("transfer stalled")
            .unwrap()
            .unwrap();
        assert_eq!(message, vec![i as u8; 9000]);
    }
    for send in sends {
        assert_eq!(send.await.unwrap().unwrap(), 9000);
    }

    watching.store(false, Ordering::Release);
    monitor.await.unwrap();
    assert!(peak.load(Ordering::Acquire) <= pool.limits()[2]);
    eventually(|| b.connection_count() == 0 && pool.allocated() == 0).await;
}

#[tokio::test]
async fn test_out_of_range_data_is_contained() {
    let capture = Arc::new(Capture::default());
    let b = NdStack::new(config(), Arc::clone(&capture) as Arc<dyn Transmit>).unwrap();
    let mut listener = b.listen(PORT).unwrap();
    let sync = Segment::handshake(SegmentType::Sync, 40000, PORT, 1 << 20);
    b.on_bytes(NODE_A, &sync.encode()).unwrap();
    let receiver = listener.accept().await.unwrap();

    let before = receiver.stats();
    assert_eq!(before.grant_nxt, 15_000);

    // sequence space wraps inside the payload
    b.on_bytes(NODE_A, &data_frame(40000, PORT, u32::MAX - 10, 100)).unwrap();
    // ends past the announced length
    b.on_bytes(NODE_A, &data_frame(40000, PORT, (1 << 20) - 50, 100)).unwrap();
    // ends past the grant
    b.on_bytes(NODE_A, &data_frame(40000, PORT, 15_000, 100)).unwrap();
    // no such flow
    b.on_bytes(NODE_A, &data_frame(40001, PORT, 0, 100)).unwrap();
    b.on_bytes(NODE_A, &data_frame(40000, PORT + 1, 0, 100)).unwrap();

    let after = receiver.stats();
    assert_eq!(after.anomalies, before.anomalies + 3);
    assert_eq!(
        ConnStats {
            anomalies: before.anomalies,
            ..after
        },
        before
    );
    assert_eq!(b.pool().allocated(), 0);
    assert_eq!(b.connection_count(), 1);

    // the connection still takes valid data
    b.on_bytes(NODE_A, &data_frame(40000, PORT, 0, 100)).unwrap();
    assert_eq!(receiver.stats().rcv_nxt, 100);
    let chunk = receiver.recv(1000, RecvFlags::default()).await.unwrap();
    assert_eq!(chunk, vec![0xab; 100]);

    // once torn down, late data finds nothing
    drop(receiver);
    assert_eq!(b.connection_count(), 0);
    let fin = capture.frames.lock().unwrap().last().cloned().unwrap();
    assert_eq!(Segment::decode(&fin).unwrap().kind, SegmentType::Fin);
    b.on_bytes(NODE_A, &data_frame(40000, PORT, 100, 100)).unwrap();
    assert_eq!(b.connection_count(), 0);
    assert_eq!(b.pool().allocated(), 0);
}
