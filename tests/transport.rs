mod support;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mesh_transport::{Config, MediaTransport, TransportObserver};
use tokio::sync::mpsc;
use tokio::time::timeout;

use support::mock_substrate::MockSubstrate;

struct TestObserver {
    frames: mpsc::UnboundedSender<Bytes>,
    reliable: mpsc::UnboundedSender<Bytes>,
    disconnects: mpsc::UnboundedSender<String>,
}

impl TransportObserver for TestObserver {
    fn on_frame_complete(&self, bytes: Bytes) {
        let _ = self.frames.send(bytes);
    }

    fn on_reliable_message_complete(&self, bytes: Bytes) {
        let _ = self.reliable.send(bytes);
    }

    fn on_disconnect(&self, reason: String) {
        let _ = self.disconnects.send(reason);
    }
}

struct Harness {
    transport: Arc<MediaTransport<MockSubstrate>>,
    frames: mpsc::UnboundedReceiver<Bytes>,
    reliable: mpsc::UnboundedReceiver<Bytes>,
    #[allow(dead_code)]
    disconnects: mpsc::UnboundedReceiver<String>,
}

fn build(config: Config) -> Harness {
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let (reliable_tx, reliable_rx) = mpsc::unbounded_channel();
    let (disconnect_tx, disconnect_rx) = mpsc::unbounded_channel();

    let observer = Arc::new(TestObserver {
        frames: frames_tx,
        reliable: reliable_tx,
        disconnects: disconnect_tx,
    });

    Harness {
        transport: MediaTransport::new(config, observer),
        frames: frames_rx,
        reliable: reliable_rx,
        disconnects: disconnect_rx,
    }
}

async fn recv_frame(harness: &mut Harness) -> Bytes {
    timeout(Duration::from_secs(2), harness.frames.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("frame channel closed")
}

#[tokio::test]
async fn delivers_a_single_small_frame_with_no_loss() {
    MockSubstrate::pair("mock://single/a", "mock://single/b", None);

    let mut sender = build(Config::default());
    let mut receiver = build(Config::default());

    sender.transport.connect("mock://single/a").await.unwrap();
    receiver.transport.connect("mock://single/b").await.unwrap();

    let payload = Bytes::from_static(&[7u8; 500]);
    sender.transport.send(payload.clone());

    let received = recv_frame(&mut receiver).await;
    assert_eq!(received, payload);
    assert_eq!(sender.transport.stats().loss_rate, 0.0);
}

#[tokio::test]
async fn reassembles_a_frame_spanning_multiple_fragments() {
    MockSubstrate::pair("mock://multi/a", "mock://multi/b", None);

    let mut config = Config::default();
    config.mtu = 1200;
    config.fragment_header_reserve = 200;

    let mut sender = build(config.clone());
    let mut receiver = build(config);

    sender.transport.connect("mock://multi/a").await.unwrap();
    receiver.transport.connect("mock://multi/b").await.unwrap();

    let payload = Bytes::from(vec![9u8; 3000]);
    sender.transport.send(payload.clone());

    let received = recv_frame(&mut receiver).await;
    assert_eq!(received, payload);
}

#[tokio::test]
async fn recovers_a_single_lost_fragment_via_fec() {
    // Drop exactly the second RTP datagram sent; the FEC parity covering the
    // group should let the receiver rebuild it anyway.
    let dropped = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let drop_predicate: std::sync::Arc<dyn Fn(&[u8]) -> bool + Send + Sync> = {
        let dropped = dropped.clone();
        std::sync::Arc::new(move |bytes: &[u8]| {
            if bytes.first() != Some(&2) {
                // not an RTP packet (tag 2); never drop control traffic.
                return false;
            }
            let count = dropped.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            count == 1
        })
    };

    MockSubstrate::pair("mock://fec/a", "mock://fec/b", Some(drop_predicate));

    let mut config = Config::default();
    // Force every group to size 3 regardless of the (initially zero)
    // measured loss rate, so the group completes after exactly 3 fragments.
    config.fec.group_size_table[0] = (1.0, 3);

    let mut sender = build(config.clone());
    let mut receiver = build(config);

    sender.transport.connect("mock://fec/a").await.unwrap();
    receiver.transport.connect("mock://fec/b").await.unwrap();

    let payload = Bytes::from(vec![3u8; 3000]);
    sender.transport.send(payload.clone());

    let received = recv_frame(&mut receiver).await;
    assert_eq!(received, payload);
}

#[tokio::test]
async fn reliable_message_arrives_whole() {
    MockSubstrate::pair("mock://reliable/a", "mock://reliable/b", None);

    let mut sender = build(Config::default());
    let mut receiver = build(Config::default());

    sender.transport.connect("mock://reliable/a").await.unwrap();
    receiver.transport.connect("mock://reliable/b").await.unwrap();

    let payload = Bytes::from_static(b"a complete control message");
    sender.transport.send_reliable(payload.clone()).await.unwrap();

    let received = timeout(Duration::from_secs(2), receiver.reliable.recv())
        .await
        .expect("timed out waiting for the reliable message")
        .expect("reliable channel closed");

    assert_eq!(received, payload);
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    MockSubstrate::pair("mock://disconnect/a", "mock://disconnect/b", None);

    let sender = build(Config::default());
    let receiver = build(Config::default());

    sender.transport.connect("mock://disconnect/a").await.unwrap();
    receiver.transport.connect("mock://disconnect/b").await.unwrap();

    sender.transport.disconnect(0, "done").await;
    sender.transport.disconnect(0, "done again").await;

    // A connect attempt after close is rejected rather than silently
    // resetting state, since `closed` is terminal for the instance.
    let err = sender.transport.connect("mock://disconnect/a").await;
    assert!(err.is_err());
}
