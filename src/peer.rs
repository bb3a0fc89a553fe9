//! The per-connection peer engine.
//!
//! A `Peer` owns one transport. `associate` runs the version handshake
//! synchronously and, only on success, starts the four background tasks:
//! input pump, output pump, queue multiplexer and stall monitor. The tasks
//! communicate exclusively through channels; the only shared mutable state
//! is the two narrow field-group locks (identity vs. statistics) and the
//! known-inventory cache.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::cache::{RecencySet, SentNonces};
use crate::config::PeerConfig;
use crate::error::PeerError;
use crate::handshake;
use crate::message::{InvItem, NetworkMessage, RejectCode};
use crate::queue::{self, OutboundMessage};
use crate::stall::{self, StallEvent};
use crate::wire;

/// Peer ids are process-wide and assigned exactly once, after a successful
/// handshake.
static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// How long a farewell reject may wait for the transport before teardown
/// proceeds without it.
const REJECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Peer connected to us.
    Inbound,
    /// We connected to the peer.
    Outbound,
}

/// Identity and handshake state, written rarely (once, at negotiation).
#[derive(Debug, Clone, Default)]
struct Identity {
    id: u64,
    protocol_version: u32,
    advertised_version: u32,
    services: u64,
    user_agent: String,
    start_height: u64,
    time_offset: i64,
    verack_received: bool,
}

/// Traffic statistics, written on every read and write.
#[derive(Debug, Clone, Default)]
struct Traffic {
    bytes_sent: u64,
    bytes_received: u64,
    last_send: Option<Instant>,
    last_recv: Option<Instant>,
    /// Outstanding keep-alive ping, if any.
    ping_nonce: Option<u64>,
    ping_sent_at: Option<Instant>,
    ping_rtt: Option<Duration>,
}

/// Consistent point-in-time copy of a peer's identity and statistics.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub id: u64,
    pub addr: String,
    pub direction: Direction,
    pub connected: bool,
    pub protocol_version: u32,
    pub advertised_version: u32,
    pub services: u64,
    pub user_agent: String,
    pub start_height: u64,
    pub time_offset: i64,
    pub verack_received: bool,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub last_send: Option<Instant>,
    pub last_recv: Option<Instant>,
    pub ping_rtt: Option<Duration>,
}

struct OutboundHandles {
    direct_tx: mpsc::UnboundedSender<OutboundMessage>,
    inv_tx: mpsc::UnboundedSender<InvItem>,
}

/// One live (or setting-up) connection to a remote node.
pub struct Peer {
    addr: String,
    direction: Direction,
    cfg: PeerConfig,
    sent_nonces: Arc<SentNonces>,
    known_inventory: Mutex<RecencySet<InvItem>>,

    associated: AtomicBool,
    connected: AtomicBool,
    disconnecting: AtomicBool,

    quit: CancellationToken,
    tasks: TaskTracker,

    identity: RwLock<Identity>,
    stats: RwLock<Traffic>,
    outbound: OnceLock<OutboundHandles>,
}

impl Peer {
    /// Create a peer for `addr`. The connection itself is handed over later
    /// via [`Peer::associate`] by the external connection manager.
    pub fn new(
        addr: impl Into<String>,
        direction: Direction,
        cfg: PeerConfig,
        sent_nonces: Arc<SentNonces>,
    ) -> Arc<Self> {
        let known_capacity = cfg.known_inventory_capacity;
        Arc::new(Self {
            addr: addr.into(),
            direction,
            cfg,
            sent_nonces,
            known_inventory: Mutex::new(RecencySet::new(known_capacity)),
            associated: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            disconnecting: AtomicBool::new(false),
            quit: CancellationToken::new(),
            tasks: TaskTracker::new(),
            identity: RwLock::new(Identity::default()),
            stats: RwLock::new(Traffic::default()),
            outbound: OnceLock::new(),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Numeric id; zero until the handshake has completed.
    pub fn id(&self) -> u64 {
        self.identity.read().id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(Ordering::SeqCst)
    }

    pub fn verack_received(&self) -> bool {
        self.identity.read().verack_received
    }

    pub(crate) fn config(&self) -> &PeerConfig {
        &self.cfg
    }

    pub(crate) fn quit_token(&self) -> CancellationToken {
        self.quit.clone()
    }

    pub(crate) fn knows_inventory(&self, item: &InvItem) -> bool {
        self.known_inventory.lock().contains(item)
    }

    /// Returns true when `item` was already known; otherwise records it as
    /// most-recently known and returns false.
    pub(crate) fn mark_inventory_known(&self, item: InvItem) -> bool {
        let mut known = self.known_inventory.lock();
        if known.contains(&item) {
            true
        } else {
            known.insert(item);
            false
        }
    }

    /// Take ownership of a transport, run the handshake, and start the
    /// background tasks. Idempotent: only the first call does anything.
    ///
    /// On negotiation failure the error is returned synchronously and no
    /// background task is ever started.
    pub async fn associate<S>(self: &Arc<Self>, stream: S) -> Result<(), PeerError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if self.associated.swap(true, Ordering::SeqCst) {
            debug!("⏭️ Peer {} already associated, ignoring", self.addr);
            return Ok(());
        }

        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = BufReader::with_capacity(64 * 1024, read_half);
        let mut writer = BufWriter::with_capacity(64 * 1024, write_half);

        let outcome = match handshake::negotiate(
            &mut reader,
            &mut writer,
            self.direction,
            &self.addr,
            &self.cfg,
            &self.sent_nonces,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(
                    "❌ [{:?}] Handshake with {} failed: {}",
                    self.direction, self.addr, err
                );
                self.disconnect();
                return Err(err);
            }
        };

        let id = NEXT_PEER_ID.fetch_add(1, Ordering::SeqCst);
        {
            let mut identity = self.identity.write();
            identity.id = id;
            identity.protocol_version = outcome.negotiated.protocol_version;
            identity.advertised_version = outcome.negotiated.advertised_version;
            identity.services = outcome.negotiated.services;
            identity.user_agent = outcome.negotiated.user_agent.clone();
            identity.start_height = outcome.negotiated.start_height;
            identity.time_offset = outcome.negotiated.time_offset;
        }
        {
            let now = Instant::now();
            let mut stats = self.stats.write();
            stats.bytes_sent += outcome.bytes_sent;
            stats.bytes_received += outcome.bytes_received;
            stats.last_send = Some(now);
            stats.last_recv = Some(now);
        }

        let (direct_tx, direct_rx) = mpsc::unbounded_channel();
        let (inv_tx, inv_rx) = mpsc::unbounded_channel();
        let (stall_tx, stall_rx) = mpsc::unbounded_channel();
        // The single write slot between the multiplexer and the output pump.
        let (send_tx, send_rx) = mpsc::channel(1);
        let (send_done_tx, send_done_rx) = mpsc::channel(1);

        let _ = self.outbound.set(OutboundHandles { direct_tx, inv_tx });
        self.connected.store(true, Ordering::SeqCst);

        info!(
            "🔗 [{:?}] New peer {} (id: {}, agent: {}, protocol: {}, height: {})",
            self.direction,
            self.addr,
            id,
            outcome.negotiated.user_agent,
            outcome.negotiated.protocol_version,
            outcome.negotiated.start_height
        );

        // Acknowledge the handshake as our first outbound message, ahead of
        // anything the version callback queues. Both sit buffered in the
        // multiplexer channel until the tasks start below.
        self.queue_message(NetworkMessage::Verack, None);
        self.cfg.handlers.on_version(self, &outcome.negotiated).await;

        self.tasks.spawn(stall::run(self.clone(), stall_rx));
        self.tasks
            .spawn(queue::run(self.clone(), direct_rx, inv_rx, send_tx, send_done_rx));
        self.tasks
            .spawn(self.clone().read_loop(reader, stall_tx.clone()));
        self.tasks
            .spawn(self.clone().write_loop(writer, send_rx, send_done_tx, stall_tx));
        self.tasks.close();

        Ok(())
    }

    /// Queue a message for delivery, FIFO relative to other direct
    /// messages. Never blocks: if the peer is not connected the message is
    /// dropped and the completion signal (if given) fires immediately.
    pub fn queue_message(&self, message: NetworkMessage, done: Option<oneshot::Sender<()>>) {
        if !self.is_connected() {
            if let Some(done) = done {
                let _ = done.send(());
            }
            return;
        }
        match self.outbound.get() {
            Some(handles) => {
                if let Err(mpsc::error::SendError(out)) =
                    handles.direct_tx.send(OutboundMessage::new(message, done))
                {
                    out.finish();
                }
            }
            None => {
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
        }
    }

    /// Queue `message` and wait for the output pump to finish with it, so a
    /// farewell reject reaches the wire before the pumps shut down. Bounded:
    /// gives up after [`REJECT_FLUSH_TIMEOUT`] if the transport is wedged.
    async fn flush_message(&self, message: NetworkMessage) {
        let (done_tx, done_rx) = oneshot::channel();
        self.queue_message(message, Some(done_tx));
        let _ = timeout(REJECT_FLUSH_TIMEOUT, done_rx).await;
    }

    /// Advertise an inventory item to this peer on the next trickle tick.
    /// Silently ignored when the item is already known or the peer is not
    /// connected.
    pub fn queue_inventory(&self, item: InvItem) {
        if !self.is_connected() || self.knows_inventory(&item) {
            return;
        }
        if let Some(handles) = self.outbound.get() {
            let _ = handles.inv_tx.send(item);
        }
    }

    /// Begin teardown. Idempotent under concurrent callers: exactly one
    /// call wins the atomic transition and emits the shared quit signal;
    /// the rest return immediately.
    pub fn disconnect(&self) {
        if self.disconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.connected.swap(false, Ordering::SeqCst) {
            info!("🔌 [{:?}] Disconnecting peer {}", self.direction, self.addr);
        }
        self.tasks.close();
        self.quit.cancel();
    }

    /// Block until the quit signal has been emitted and all four background
    /// tasks have exited.
    pub async fn wait_for_disconnect(&self) {
        self.quit.cancelled().await;
        self.tasks.wait().await;
    }

    /// Point-in-time copy of identity and statistics, taken under the two
    /// narrow field-group locks.
    pub fn snapshot(&self) -> PeerSnapshot {
        let identity = self.identity.read().clone();
        let stats = self.stats.read().clone();
        PeerSnapshot {
            id: identity.id,
            addr: self.addr.clone(),
            direction: self.direction,
            connected: self.is_connected(),
            protocol_version: identity.protocol_version,
            advertised_version: identity.advertised_version,
            services: identity.services,
            user_agent: identity.user_agent,
            start_height: identity.start_height,
            time_offset: identity.time_offset,
            verack_received: identity.verack_received,
            bytes_sent: stats.bytes_sent,
            bytes_received: stats.bytes_received,
            last_send: stats.last_send,
            last_recv: stats.last_recv,
            ping_rtt: stats.ping_rtt,
        }
    }

    /// Input pump: one framed read at a time under the idle deadline.
    async fn read_loop<R>(
        self: Arc<Self>,
        mut reader: R,
        stall_tx: mpsc::UnboundedSender<StallEvent>,
    ) where
        R: AsyncRead + Unpin,
    {
        let idle = self.cfg.idle_timeout;

        'pump: while !self.is_disconnecting() {
            let read = tokio::select! {
                _ = self.quit.cancelled() => break 'pump,
                read = timeout(idle, wire::read_message(&mut reader)) => read,
            };

            let result = match read {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        "⏰ Peer {} has been silent for {:?} -- disconnecting",
                        self.addr, idle
                    );
                    break 'pump;
                }
            };

            match result {
                Ok(Some((message, n))) => {
                    {
                        let mut stats = self.stats.write();
                        stats.bytes_received += n as u64;
                        stats.last_recv = Some(Instant::now());
                    }
                    self.cfg.handlers.on_read(n, Some(&message), None);

                    let command = message.command();
                    let _ = stall_tx.send(StallEvent::MessageReceived(command));

                    match &message {
                        NetworkMessage::Version { .. } => {
                            // At most one version message per connection.
                            warn!(
                                "🚫 Peer {} sent a duplicate version message -- disconnecting",
                                self.addr
                            );
                            self.flush_message(NetworkMessage::reject(
                                "version",
                                RejectCode::Duplicate,
                                "duplicate version message",
                            ))
                            .await;
                            break 'pump;
                        }
                        NetworkMessage::Verack => {
                            let duplicate = {
                                let mut identity = self.identity.write();
                                let dup = identity.verack_received;
                                identity.verack_received = true;
                                dup
                            };
                            if duplicate {
                                warn!(
                                    "🚫 Peer {} sent a duplicate verack -- disconnecting",
                                    self.addr
                                );
                                self.flush_message(NetworkMessage::reject(
                                    "verack",
                                    RejectCode::Duplicate,
                                    "duplicate verack message",
                                ))
                                .await;
                                break 'pump;
                            }
                        }
                        NetworkMessage::Ping { nonce } => {
                            self.queue_message(NetworkMessage::Pong { nonce: *nonce }, None);
                        }
                        NetworkMessage::Pong { nonce } => {
                            let mut stats = self.stats.write();
                            if stats.ping_nonce == Some(*nonce) {
                                stats.ping_rtt = stats.ping_sent_at.map(|sent| sent.elapsed());
                                stats.ping_nonce = None;
                                stats.ping_sent_at = None;
                            }
                        }
                        _ => {}
                    }

                    // Bracket the application handler so its latency extends
                    // pending stall deadlines.
                    let _ = stall_tx.send(StallEvent::HandlerStart(command));
                    self.dispatch(&message).await;
                    let _ = stall_tx.send(StallEvent::HandlerDone);
                }
                Ok(None) => {
                    debug!("🔌 Connection to {} closed by peer (EOF)", self.addr);
                    break 'pump;
                }
                Err(err) => {
                    if self.is_disconnecting() || err.is_expected_disconnect() {
                        debug!("🔌 Read from {} ended: {}", self.addr, err);
                    } else {
                        error!("❌ Unable to read message from {}: {}", self.addr, err);
                        self.cfg.handlers.on_read(0, None, Some(&err));
                        if err.is_malformed() {
                            // Best effort: the write itself may still fail.
                            self.flush_message(NetworkMessage::reject(
                                "malformed",
                                RejectCode::Malformed,
                                err.to_string(),
                            ))
                            .await;
                        }
                    }
                    break 'pump;
                }
            }
        }

        let _ = stall_tx.send(StallEvent::InputDone);
        self.disconnect();
        debug!("🔌 Input pump for {} done", self.addr);
    }

    /// Output pump: owns the write half, drains the single-slot send queue
    /// and emits keep-alive pings.
    async fn write_loop<W>(
        self: Arc<Self>,
        mut writer: W,
        mut send_rx: mpsc::Receiver<OutboundMessage>,
        send_done_tx: mpsc::Sender<()>,
        stall_tx: mpsc::UnboundedSender<StallEvent>,
    ) where
        W: AsyncWrite + Unpin,
    {
        let mut ping = interval_at(
            Instant::now() + self.cfg.ping_interval,
            self.cfg.ping_interval,
        );
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'pump: loop {
            tokio::select! {
                _ = self.quit.cancelled() => break 'pump,

                out = send_rx.recv() => {
                    let Some(out) = out else { break 'pump };

                    // Deadlines are registered before the bytes move so a
                    // peer cannot dodge them by stalling the write itself.
                    let _ = stall_tx.send(StallEvent::MessageSent(out.message.command()));

                    match wire::write_message(&mut writer, &out.message).await {
                        Ok(n) => {
                            {
                                let mut stats = self.stats.write();
                                stats.bytes_sent += n as u64;
                                stats.last_send = Some(Instant::now());
                            }
                            self.cfg.handlers.on_write(n, &out.message, None);
                            out.finish();
                            if send_done_tx.send(()).await.is_err() {
                                break 'pump;
                            }
                        }
                        Err(err) => {
                            if !self.is_disconnecting() && !err.is_expected_disconnect() {
                                error!(
                                    "❌ Failed to send {} to {}: {}",
                                    out.message.command(), self.addr, err
                                );
                            }
                            self.cfg.handlers.on_write(0, &out.message, Some(&err));
                            out.finish();
                            break 'pump;
                        }
                    }
                }

                _ = ping.tick() => {
                    let nonce = rand::random::<u64>();
                    {
                        let mut stats = self.stats.write();
                        stats.ping_nonce = Some(nonce);
                        stats.ping_sent_at = Some(Instant::now());
                    }
                    let message = NetworkMessage::Ping { nonce };
                    // Keep-alive pings bypass stall registration: they may
                    // legitimately queue behind a backlog.
                    match wire::write_message(&mut writer, &message).await {
                        Ok(n) => {
                            {
                                let mut stats = self.stats.write();
                                stats.bytes_sent += n as u64;
                                stats.last_send = Some(Instant::now());
                            }
                            self.cfg.handlers.on_write(n, &message, None);
                            debug!("📤 Sent keep-alive ping to {} (nonce: {})", self.addr, nonce);
                        }
                        Err(err) => {
                            if !self.is_disconnecting() && !err.is_expected_disconnect() {
                                error!("❌ Failed to ping {}: {}", self.addr, err);
                            }
                            break 'pump;
                        }
                    }
                }
            }
        }

        // Drain the send queue; completion signals fire without
        // transmission.
        send_rx.close();
        while let Ok(out) = send_rx.try_recv() {
            out.finish();
        }

        let _ = stall_tx.send(StallEvent::OutputDone);
        self.disconnect();
        debug!("🔌 Output pump for {} done", self.addr);
    }

    /// Route a message to its registered handler. Unset handlers are
    /// default no-ops on the trait.
    async fn dispatch(&self, message: &NetworkMessage) {
        let handlers = &self.cfg.handlers;
        match message {
            // Handled (and rejected) before dispatch.
            NetworkMessage::Version { .. } => {}
            NetworkMessage::Verack => handlers.on_verack(self).await,
            NetworkMessage::Ping { nonce } => handlers.on_ping(self, *nonce).await,
            NetworkMessage::Pong { nonce } => handlers.on_pong(self, *nonce).await,
            NetworkMessage::GetAddr => handlers.on_getaddr(self).await,
            NetworkMessage::Addr(addresses) => handlers.on_addr(self, addresses).await,
            NetworkMessage::Inv(items) => handlers.on_inv(self, items).await,
            NetworkMessage::GetData(items) => handlers.on_getdata(self, items).await,
            NetworkMessage::NotFound(items) => handlers.on_notfound(self, items).await,
            NetworkMessage::Tx(raw) => handlers.on_tx(self, raw).await,
            NetworkMessage::Reject {
                message,
                code,
                reason,
            } => handlers.on_reject(self, message, *code, reason).await,
            NetworkMessage::FilterLoad(filter) => handlers.on_filter_load(self, filter).await,
            NetworkMessage::FilterAdd(data) => handlers.on_filter_add(self, data).await,
            NetworkMessage::FilterClear => handlers.on_filter_clear(self).await,
            NetworkMessage::FeeFilter(rate) => handlers.on_fee_filter(self, *rate).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::InvKind;

    fn test_peer() -> Arc<Peer> {
        Peer::new(
            "127.0.0.1:9333",
            Direction::Outbound,
            PeerConfig::default(),
            SentNonces::new(8),
        )
    }

    #[tokio::test]
    async fn test_queue_message_before_connect_satisfies_signal() {
        let peer = test_peer();
        let (tx, rx) = oneshot::channel();
        peer.queue_message(NetworkMessage::GetAddr, Some(tx));
        rx.await.expect("completion signal must fire");
    }

    #[tokio::test]
    async fn test_queue_inventory_before_connect_is_noop() {
        let peer = test_peer();
        let item = InvItem::new(InvKind::Tx, [7u8; 32]);
        peer.queue_inventory(item);
        assert!(!peer.knows_inventory(&item));
    }

    #[tokio::test]
    async fn test_snapshot_defaults() {
        let peer = test_peer();
        let snap = peer.snapshot();
        assert_eq!(snap.id, 0);
        assert!(!snap.connected);
        assert!(!snap.verack_received);
        assert_eq!(snap.bytes_sent, 0);
        assert_eq!(snap.bytes_received, 0);
    }

    #[tokio::test]
    async fn test_mark_inventory_known_dedups() {
        let peer = test_peer();
        let item = InvItem::new(InvKind::Block, [1u8; 32]);
        assert!(!peer.mark_inventory_known(item));
        assert!(peer.mark_inventory_known(item));
        assert!(peer.knows_inventory(&item));
    }
}
