use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use bytes::Bytes;
use codec::{Packet, RtpPacket};
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, Notify};

use crate::config::Config;
use crate::error::TransportError;
use crate::fec::{self, FecEncoder};
use crate::frame_buffer::FrameBuffer;
use crate::loss::LossEstimator;
use crate::nack::NackController;
use crate::pacer::Pacer;
use crate::rtt::RttEstimator;
use crate::substrate::{DatagramChannel, ReliableSendStream, Substrate};

/// Callbacks the embedding application supplies at construction time. Held
/// as plain trait objects rather than channels, mirroring how the server
/// side of this protocol family wires a handler struct straight into its
/// event dispatch instead of routing everything through a queue.
pub trait TransportObserver: Send + Sync + 'static {
    fn on_frame_complete(&self, bytes: Bytes);
    fn on_reliable_message_complete(&self, bytes: Bytes);
    fn on_disconnect(&self, reason: String);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Disconnected,
    Connected,
    Closed,
}

struct Inner {
    next_sequence: u64,
    next_frame_id: u64,
    next_ping_id: u64,
    next_expected_in: u64,
    loss: LossEstimator,
    fec: FecEncoder,
    pacer: Pacer,
    nack: NackController,
    rtt: RttEstimator,
    frame_buffers: AHashMap<u64, FrameBuffer>,
    send_cache: AHashMap<u64, (Bytes, Instant)>,
    receive_cache: AHashMap<u64, (RtpPacket, Instant)>,
    /// Sequence numbers received so far, each stamped with local receive
    /// time so `housekeeping_loop` can prune it the same as every other
    /// per-connection cache.
    received_sequences: AHashMap<u64, Instant>,
    ping_table: AHashMap<u64, Instant>,
    missed_pongs: u32,
    duplicate_count: u64,
}

impl Inner {
    fn new(config: &Config) -> Self {
        Self {
            next_sequence: 0,
            next_frame_id: 0,
            next_ping_id: 0,
            next_expected_in: 0,
            loss: LossEstimator::new(config.loss.clone()),
            fec: FecEncoder::new(config.fec.clone()),
            pacer: Pacer::new(config.pacer.clone()),
            nack: NackController::new(config.nack.clone()),
            rtt: RttEstimator::new(config.rtt.clone()),
            frame_buffers: AHashMap::new(),
            send_cache: AHashMap::new(),
            receive_cache: AHashMap::new(),
            received_sequences: AHashMap::new(),
            ping_table: AHashMap::new(),
            missed_pongs: 0,
            duplicate_count: 0,
        }
    }
}

/// Point-in-time metrics an embedder can poll without affecting the
/// transport's behavior.
#[derive(Debug, Clone, Copy)]
pub struct TransportStats {
    pub srtt: Duration,
    pub rto: Duration,
    pub duplicate_count: u64,
    pub loss_rate: f64,
}

/// The media transport: frame fragmentation and reassembly, adaptive FEC,
/// NACK-driven retransmission and a paced send path, wired together on top
/// of an unreliable-datagram [`Substrate`].
///
/// A transport is constructed once, `connect`ed, used, and `disconnect`ed;
/// it is not reusable afterward. All the bookkeeping objects above live
/// behind a single lock, held only across synchronous, non-suspending work —
/// never across a substrate read or write.
pub struct MediaTransport<S: Substrate> {
    config: Config,
    observer: Arc<dyn TransportObserver>,
    lifecycle: Mutex<Lifecycle>,
    inner: Mutex<Inner>,
    substrate: Mutex<Option<Arc<S>>>,
    /// The single datagram handle the substrate hands out, shared between
    /// the read loop and the pacer's send path behind an async mutex so
    /// `Substrate::datagrams` is called exactly once per connection, as its
    /// contract promises.
    datagrams: Mutex<Option<Arc<AsyncMutex<S::Datagrams>>>>,
    auth_token: Mutex<String>,
    shutdown: Notify,
    epoch: Instant,
}

impl<S: Substrate> MediaTransport<S> {
    pub fn new(config: Config, observer: Arc<dyn TransportObserver>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::new(&config)),
            config,
            observer,
            lifecycle: Mutex::new(Lifecycle::Disconnected),
            substrate: Mutex::new(None),
            datagrams: Mutex::new(None),
            auth_token: Mutex::new(String::new()),
            shutdown: Notify::new(),
            epoch: Instant::now(),
        })
    }

    /// A monotonic, millisecond-resolution clock reading relative to the
    /// transport's construction, used as the `timestamp` field of outgoing
    /// packets. Peers treat it as opaque.
    fn now_ts(&self) -> u64 {
        Instant::now().saturating_duration_since(self.epoch).as_micros() as u64
    }

    /// Must be called before [`Self::connect`].
    pub fn set_auth_token(&self, token: impl Into<String>) {
        *self.auth_token.lock() = token.into();
    }

    pub fn stats(&self) -> TransportStats {
        let inner = self.inner.lock();
        TransportStats {
            srtt: inner.rtt.srtt(),
            rto: inner.rtt.rto(),
            duplicate_count: inner.duplicate_count,
            loss_rate: inner.loss.stats().loss_rate,
        }
    }

    /// Establishes the substrate session and starts every periodic task.
    /// Rejects if the transport is already connected.
    pub async fn connect(self: &Arc<Self>, url: &str) -> Result<(), TransportError> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle != Lifecycle::Disconnected {
                return Err(TransportError::AlreadyConnected);
            }
            *lifecycle = Lifecycle::Connected;
        }

        let token = self.auth_token.lock().clone();
        let substrate = S::connect(url, &token)
            .await
            .map_err(|e| TransportError::Substrate(e.to_string()))?;
        let substrate = Arc::new(substrate);
        let datagrams = Arc::new(AsyncMutex::new(substrate.datagrams()));

        *self.substrate.lock() = Some(substrate.clone());
        *self.datagrams.lock() = Some(datagrams.clone());

        log::info!("media transport connected to {url}");

        self.spawn_tasks(substrate, datagrams);

        Ok(())
    }

    fn spawn_tasks(self: &Arc<Self>, substrate: Arc<S>, datagrams: Arc<AsyncMutex<S::Datagrams>>) {
        let this = self.clone();
        tokio::spawn(async move { this.read_loop(datagrams).await });

        let this = self.clone();
        tokio::spawn(async move { this.pacer_loop().await });

        let this = self.clone();
        tokio::spawn(async move { this.ping_loop().await });

        let this = self.clone();
        tokio::spawn(async move { this.nack_loop().await });

        let this = self.clone();
        tokio::spawn(async move { this.housekeeping_loop().await });

        let this = self.clone();
        let accept_substrate = substrate.clone();
        tokio::spawn(async move { this.accept_loop(accept_substrate).await });

        let this = self.clone();
        tokio::spawn(async move { this.watch_close(substrate).await });
    }

    fn is_closed(&self) -> bool {
        *self.lifecycle.lock() == Lifecycle::Closed
    }

    async fn read_loop(self: &Arc<Self>, datagrams: Arc<AsyncMutex<S::Datagrams>>) {
        loop {
            if self.is_closed() {
                return;
            }

            tokio::select! {
                _ = self.shutdown.notified() => return,
                result = async { datagrams.lock().await.recv().await } => match result {
                    Ok(bytes) => self.on_datagram(&bytes),
                    Err(err) => {
                        log::warn!("datagram read failed: {err}");
                        self.fail("datagram read failed").await;
                        return;
                    }
                },
            }
        }
    }

    fn on_datagram(self: &Arc<Self>, bytes: &[u8]) {
        let packet = match Packet::decode(bytes) {
            Ok(packet) => packet,
            Err(err) => {
                log::trace!("dropping undecodable datagram: {err}");
                return;
            }
        };

        match packet {
            Packet::Ping { timestamp, payload } => self.on_ping(timestamp, payload),
            Packet::Pong { timestamp, payload } => self.on_pong(timestamp, payload),
            Packet::Nack(nack) => self.on_nack(nack.sequences),
            Packet::Rtp(rtp) => self.on_rtp(rtp, true),
            Packet::Fec(fec_packet) => {
                let mut inner = self.inner.lock();
                let available: AHashMap<u64, RtpPacket> = inner
                    .receive_cache
                    .iter()
                    .map(|(seq, (p, _))| (*seq, p.clone()))
                    .collect();
                let recovered = fec::recover_packet(&fec_packet, &available);
                drop(inner);

                if let Some(packet) = recovered {
                    log::trace!("recovered sequence {} via FEC", packet.sequence);
                    self.on_rtp(packet, false);
                }
            }
        }
    }

    fn on_ping(self: &Arc<Self>, timestamp: u64, payload: Bytes) {
        self.enqueue(Packet::Pong { timestamp, payload });
    }

    fn on_pong(self: &Arc<Self>, timestamp: u64, _payload: Bytes) {
        let mut inner = self.inner.lock();
        if let Some(sent_at) = inner.ping_table.remove(&timestamp) {
            let rtt_sample = Instant::now().saturating_duration_since(sent_at);
            inner.rtt.update(rtt_sample);
            inner.missed_pongs = 0;
        }
    }

    fn on_nack(self: &Arc<Self>, sequences: Vec<u64>) {
        let now = Instant::now();
        let mut retransmit = Vec::new();

        {
            let mut inner = self.inner.lock();
            for seq in &sequences {
                inner.loss.record_nacked(*seq, now);
                if let Some((bytes, _)) = inner.send_cache.get(seq) {
                    retransmit.push(bytes.clone());
                }
            }
        }

        for bytes in retransmit {
            self.enqueue_raw(bytes);
        }
    }

    fn on_rtp(self: &Arc<Self>, rtp: RtpPacket, advance_expected: bool) {
        let now = Instant::now();
        let sequence = rtp.sequence;
        let frame_id = rtp.frame_id;

        let (complete_bytes, gap) = {
            let mut inner = self.inner.lock();

            let was_known = inner.received_sequences.contains_key(&sequence);
            if was_known {
                inner.duplicate_count += 1;
            }

            let buffer = inner
                .frame_buffers
                .entry(frame_id)
                .or_insert_with(|| FrameBuffer::new(&rtp, now));
            if !buffer.add(&rtp) {
                log::warn!("dropping divergent fragment for frame {frame_id}");
            }

            inner.nack.on_rtp_received(sequence);
            inner.received_sequences.insert(sequence, now);
            inner.receive_cache.insert(sequence, (rtp.clone(), now));

            let complete_bytes = if inner.frame_buffers[&frame_id].is_complete() {
                let bytes = inner.frame_buffers[&frame_id].reconstruct();
                inner.frame_buffers.remove(&frame_id);
                bytes
            } else {
                None
            };

            let gap = if advance_expected {
                let expected = inner.next_expected_in;
                if sequence > expected {
                    let start = expected;
                    inner.next_expected_in = sequence + 1;
                    Some((start, sequence))
                } else if sequence == expected {
                    inner.next_expected_in = sequence + 1;
                    None
                } else {
                    None
                }
            } else {
                None
            };

            (complete_bytes, gap)
        };

        if let Some((start, end)) = gap {
            let now = Instant::now();
            let mut inner = self.inner.lock();
            inner.nack.on_gap_detected(start, end, &inner.received_sequences, now);
        }

        if let Some(bytes) = complete_bytes {
            self.observer.on_frame_complete(bytes);
        }
    }

    async fn pacer_loop(self: &Arc<Self>) {
        let mut last = Instant::now();
        let mut ticker = tokio::time::interval(self.config.pacer.tick);
        loop {
            ticker.tick().await;
            if self.is_closed() {
                return;
            }

            let now = Instant::now();
            let elapsed = now.saturating_duration_since(last);
            last = now;

            let datagrams = {
                let mut inner = self.inner.lock();
                let loss_rate = inner.loss.stats().loss_rate;
                inner.pacer.drain_tick(elapsed, loss_rate)
            };

            if !datagrams.is_empty() {
                log::debug!("pacer draining {} datagrams", datagrams.len());
            }

            for datagram in datagrams {
                self.send_datagram(datagram).await;
            }
        }
    }

    /// Sends a PING every `ping_interval` and separately expires any
    /// outstanding ping whose own `ping_timeout` has elapsed without a
    /// matching PONG. `missed_pongs` counts consecutive *expired* pings, not
    /// pings merely still in flight — a slow but steady peer whose RTT sits
    /// under `ping_timeout` never accumulates misses just because several
    /// pings are outstanding at once.
    async fn ping_loop(self: &Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.keepalive.ping_interval);
        loop {
            ticker.tick().await;
            if self.is_closed() {
                return;
            }

            let timed_out = {
                let mut inner = self.inner.lock();
                let now = Instant::now();
                let timeout = self.config.keepalive.ping_timeout;

                let expired: Vec<u64> = inner
                    .ping_table
                    .iter()
                    .filter(|(_, sent_at)| now.saturating_duration_since(**sent_at) >= timeout)
                    .map(|(id, _)| *id)
                    .collect();
                for id in expired {
                    inner.ping_table.remove(&id);
                    inner.missed_pongs += 1;
                }

                if inner.missed_pongs >= self.config.keepalive.max_missed_pongs {
                    true
                } else {
                    let ping_id = inner.next_ping_id;
                    inner.next_ping_id += 1;
                    inner.ping_table.insert(ping_id, now);
                    let ping = Packet::Ping {
                        timestamp: ping_id,
                        payload: Bytes::new(),
                    };
                    // inner is already locked here; enqueue_raw would try to
                    // lock it again, so encode straight into the pacer
                    // instead of going through self.enqueue.
                    if let Ok(encoded) = ping.encode(self.config.mtu) {
                        inner.pacer.enqueue(encoded);
                    } else {
                        log::trace!("dropping oversized outgoing packet");
                    }
                    false
                }
            };

            if timed_out {
                self.fail("Connection timed out").await;
                return;
            }
        }
    }

    async fn nack_loop(self: &Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.nack.check_interval);
        loop {
            ticker.tick().await;
            if self.is_closed() {
                return;
            }

            let due = {
                let mut inner = self.inner.lock();
                let now = Instant::now();
                let srtt = inner.rtt.srtt();
                let rto = inner.rtt.rto();
                inner.nack.check_pending_nacks(&inner.received_sequences, srtt, rto, now)
            };

            if !due.is_empty() {
                log::debug!("retransmitting {} NACK entries", due.len());
            }

            for nack in due {
                self.enqueue(Packet::Nack(nack));
            }
        }
    }

    async fn housekeeping_loop(self: &Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.housekeeping.interval);
        loop {
            ticker.tick().await;
            if self.is_closed() {
                return;
            }

            let now = Instant::now();
            let max_age = self.config.housekeeping.max_age;

            let mut inner = self.inner.lock();
            inner.send_cache.retain(|_, (_, at)| now.saturating_duration_since(*at) <= max_age);
            inner.receive_cache.retain(|_, (_, at)| now.saturating_duration_since(*at) <= max_age);
            inner.received_sequences.retain(|_, at| now.saturating_duration_since(*at) <= max_age);
            inner.frame_buffers.retain(|_, buf| now.saturating_duration_since(buf.created_at) <= max_age);
            inner.ping_table.retain(|_, at| now.saturating_duration_since(*at) <= max_age);
            inner.nack.cleanup(now);
            inner.loss.tick(now);
        }
    }

    async fn accept_loop(self: &Arc<Self>, substrate: Arc<S>) {
        loop {
            if self.is_closed() {
                return;
            }

            tokio::select! {
                _ = self.shutdown.notified() => return,
                result = substrate.accept_uni() => match result {
                    Ok(mut stream) => match stream.read_to_end().await {
                        Ok(bytes) => self.observer.on_reliable_message_complete(bytes),
                        Err(err) => log::warn!("reliable stream read failed: {err}"),
                    },
                    Err(err) => {
                        log::warn!("accepting a reliable stream failed: {err}");
                        return;
                    }
                },
            }
        }
    }

    async fn watch_close(self: &Arc<Self>, substrate: Arc<S>) {
        let close = substrate.closed().await;
        self.fail(&close.reason).await;
    }

    /// Fragments `bytes` into one new frame and feeds every fragment through
    /// the loss estimator, FEC encoder and pacer.
    pub fn send(self: &Arc<Self>, bytes: Bytes) {
        if self.is_closed() {
            return;
        }

        let budget = self.config.fragment_payload_budget();
        let chunks: Vec<Bytes> = bytes
            .chunks(budget.max(1))
            .map(Bytes::copy_from_slice)
            .collect();
        let fragment_count = chunks.len() as u16;
        let now = Instant::now();

        let mut inner = self.inner.lock();
        let frame_id = inner.next_frame_id;
        inner.next_frame_id += 1;
        let timestamp = self.now_ts();

        let mut fec_packets = Vec::new();
        let mut rtp_packets = Vec::new();

        for (index, payload) in chunks.into_iter().enumerate() {
            let sequence = inner.next_sequence;
            inner.next_sequence += 1;

            let rtp = RtpPacket {
                sequence,
                timestamp,
                frame_id,
                fragment_index: index as u16,
                fragment_count,
                payload,
            };

            inner.loss.record_sent(sequence, now);

            let srtt = inner.rtt.srtt();
            let loss_rate = inner.loss.stats().loss_rate;
            if let Some(fec_packet) = inner.fec.process_packet(rtp.clone(), loss_rate, srtt) {
                fec_packets.push(fec_packet);
            }

            rtp_packets.push(rtp);
        }

        if let Some(fec_packet) = inner.fec.flush() {
            fec_packets.push(fec_packet);
        }

        for rtp in rtp_packets {
            let sequence = rtp.sequence;
            let packet = Packet::Rtp(rtp);
            if let Ok(encoded) = packet.encode(self.config.mtu) {
                inner.send_cache.insert(sequence, (encoded.clone(), now));
                inner.pacer.enqueue(encoded);
            }
        }

        for fec_packet in fec_packets {
            let packet = Packet::Fec(fec_packet);
            if let Ok(encoded) = packet.encode(self.config.mtu) {
                inner.pacer.enqueue(encoded);
            }
        }
    }

    /// Sends `bytes` over a brand-new reliable unidirectional stream, one
    /// message per stream. On failure, disconnects with the observer
    /// notified first.
    pub async fn send_reliable(self: &Arc<Self>, bytes: Bytes) -> Result<(), TransportError> {
        let substrate = self
            .substrate
            .lock()
            .clone()
            .ok_or(TransportError::NotConnected)?;

        let result = async {
            let mut stream = substrate.open_uni().await?;
            stream.write_all(&bytes).await?;
            stream.finish().await
        }
        .await;

        if let Err(err) = result {
            log::warn!("reliable send failed: {err}");
            self.fail("reliable send failed").await;
            return Err(TransportError::Substrate(err.to_string()));
        }

        Ok(())
    }

    fn enqueue(self: &Arc<Self>, packet: Packet) {
        if let Ok(encoded) = packet.encode(self.config.mtu) {
            self.enqueue_raw(encoded);
        } else {
            log::trace!("dropping oversized outgoing packet");
        }
    }

    fn enqueue_raw(self: &Arc<Self>, datagram: Bytes) {
        self.inner.lock().pacer.enqueue(datagram);
    }

    async fn send_datagram(self: &Arc<Self>, datagram: Bytes) {
        let handle = self.datagrams.lock().clone();
        if let Some(handle) = handle {
            if let Err(err) = handle.lock().await.send(datagram).await {
                log::warn!("substrate send failed: {err}");
            }
        }
    }

    async fn fail(self: &Arc<Self>, reason: &str) {
        self.teardown(reason).await;
    }

    /// Tears the transport down: marks it closed, clears every piece of
    /// mutable state, closes the substrate session, and notifies the
    /// observer exactly once. Safe to call more than once; the second call
    /// is a no-op.
    pub async fn disconnect(self: &Arc<Self>, code: u32, reason: &str) {
        self.teardown_with_code(Some(code), reason).await;
    }

    async fn teardown(self: &Arc<Self>, reason: &str) {
        self.teardown_with_code(None, reason).await;
    }

    async fn teardown_with_code(self: &Arc<Self>, code: Option<u32>, reason: &str) {
        let already_closed = {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle == Lifecycle::Closed {
                true
            } else {
                *lifecycle = Lifecycle::Closed;
                false
            }
        };

        if already_closed {
            return;
        }

        log::info!("media transport disconnecting: {reason}");
        self.shutdown.notify_waiters();

        {
            let mut inner = self.inner.lock();
            inner.frame_buffers.clear();
            inner.send_cache.clear();
            inner.receive_cache.clear();
            inner.received_sequences.clear();
            inner.ping_table.clear();
            inner.pacer.clear();
            inner.nack.clear();
            inner.loss.reset();
            inner.fec.reset();
        }

        if let Some(substrate) = self.substrate.lock().take() {
            substrate.close(code.unwrap_or(0), reason);
        }
        *self.datagrams.lock() = None;

        self.observer.on_disconnect(reason.to_string());
    }
}