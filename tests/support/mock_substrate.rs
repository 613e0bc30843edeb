//! An in-memory stand-in for the datagram/stream substrate, used only by
//! integration tests. Two [`MockSubstrate`] halves are created together with
//! [`MockSubstrate::pair`] and registered under URLs a [`MediaTransport`]
//! can `connect` to; nothing here ships in the library.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, OnceLock};

use bytes::{Bytes, BytesMut};
use mesh_transport::substrate::{DatagramChannel, ReliableRecvStream, ReliableSendStream, SessionClose, Substrate};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};

type DropPredicate = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

fn never_drop() -> DropPredicate {
    Arc::new(|_| false)
}

fn registry() -> &'static std::sync::Mutex<HashMap<String, MockSubstrate>> {
    static REGISTRY: OnceLock<std::sync::Mutex<HashMap<String, MockSubstrate>>> = OnceLock::new();
    REGISTRY.get_or_init(Default::default)
}

#[derive(Clone)]
pub struct MockDatagrams {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<Bytes>>>,
    drop_outgoing: DropPredicate,
}

impl DatagramChannel for MockDatagrams {
    async fn send(&mut self, bytes: Bytes) -> io::Result<()> {
        if (self.drop_outgoing)(&bytes) {
            return Ok(());
        }
        self.tx
            .send(bytes)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))
    }

    async fn recv(&mut self) -> io::Result<Bytes> {
        let mut rx = self.rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"))
    }
}

pub struct MockSendStream {
    tx: mpsc::UnboundedSender<Bytes>,
    buffer: BytesMut,
}

impl ReliableSendStream for MockSendStream {
    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    async fn finish(self) -> io::Result<()> {
        self.tx
            .send(self.buffer.freeze())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))
    }
}

pub struct MockRecvStream(Bytes);

impl ReliableRecvStream for MockRecvStream {
    async fn read_to_end(&mut self) -> io::Result<Bytes> {
        Ok(std::mem::take(&mut self.0))
    }
}

pub struct MockSubstrate {
    datagrams: MockDatagrams,
    uni_tx: mpsc::UnboundedSender<Bytes>,
    uni_rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<Bytes>>>,
    close_notify: Arc<Notify>,
    close_info: Arc<std::sync::Mutex<Option<SessionClose>>>,
}

impl MockSubstrate {
    /// Builds two linked halves and registers them under `url_a`/`url_b` so
    /// two transports can `connect` to each other. `drop_a_to_b` decides,
    /// per raw outgoing datagram from the `a` side, whether it is silently
    /// dropped in flight.
    pub fn pair(url_a: &str, url_b: &str, drop_a_to_b: Option<DropPredicate>) {
        let (a_to_b_tx, a_to_b_rx) = mpsc::unbounded_channel();
        let (b_to_a_tx, b_to_a_rx) = mpsc::unbounded_channel();
        let (a_uni_tx, a_uni_rx) = mpsc::unbounded_channel();
        let (b_uni_tx, b_uni_rx) = mpsc::unbounded_channel();

        let a = MockSubstrate {
            datagrams: MockDatagrams {
                tx: a_to_b_tx,
                rx: Arc::new(AsyncMutex::new(b_to_a_rx)),
                drop_outgoing: drop_a_to_b.unwrap_or_else(never_drop),
            },
            uni_tx: a_uni_tx,
            uni_rx: Arc::new(AsyncMutex::new(b_uni_rx)),
            close_notify: Arc::new(Notify::new()),
            close_info: Arc::new(std::sync::Mutex::new(None)),
        };

        let b = MockSubstrate {
            datagrams: MockDatagrams {
                tx: b_to_a_tx,
                rx: Arc::new(AsyncMutex::new(a_to_b_rx)),
                drop_outgoing: never_drop(),
            },
            uni_tx: b_uni_tx,
            uni_rx: Arc::new(AsyncMutex::new(a_uni_rx)),
            close_notify: Arc::new(Notify::new()),
            close_info: Arc::new(std::sync::Mutex::new(None)),
        };

        let mut reg = registry().lock().unwrap();
        reg.insert(url_a.to_string(), a);
        reg.insert(url_b.to_string(), b);
    }
}

impl Substrate for MockSubstrate {
    type Datagrams = MockDatagrams;
    type SendStream = MockSendStream;
    type RecvStream = MockRecvStream;

    async fn connect(url: &str, _token: &str) -> io::Result<Self> {
        registry()
            .lock()
            .unwrap()
            .remove(url)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no mock substrate registered for {url}")))
    }

    fn datagrams(&self) -> Self::Datagrams {
        self.datagrams.clone()
    }

    async fn open_uni(&self) -> io::Result<Self::SendStream> {
        Ok(MockSendStream {
            tx: self.uni_tx.clone(),
            buffer: BytesMut::new(),
        })
    }

    async fn accept_uni(&self) -> io::Result<Self::RecvStream> {
        let mut rx = self.uni_rx.lock().await;
        let bytes = rx
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"))?;
        Ok(MockRecvStream(bytes))
    }

    async fn closed(&self) -> SessionClose {
        self.close_notify.notified().await;
        self.close_info
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(SessionClose {
                code: 0,
                reason: String::new(),
            })
    }

    fn close(&self, code: u32, reason: &str) {
        *self.close_info.lock().unwrap() = Some(SessionClose {
            code,
            reason: reason.to_string(),
        });
        self.close_notify.notify_waiters();
    }
}
