//! Shared state of one transport connection and its writer task.
//!
//! A [`Connection`] is shared by the session, the channel handles, the
//! dispatcher and the writer task. Outgoing packets go through an unbounded
//! queue to the writer, which owns the write half of the stream and is the
//! only place packets are sealed and sequence numbers assigned.
//!
//! While a key exchange runs, the writer holds every message that is not a
//! transport or key exchange message and sends them in order after its
//! NEWKEYS, under the new keys.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use skiff_platform::{SkiffError, SkiffResult};
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};
use tracing::debug;

use crate::ssh::channel::ChannelTable;
use crate::ssh::crypto::SealingState;
use crate::ssh::handshake::{KexHandshake, KexOutput, KexSummary};
use crate::ssh::kex::NewKeys;
use crate::ssh::logging::{
    log_held_traffic, log_kex_complete, log_kex_start, log_packet, log_state_transition,
    log_transport_closed,
};
use crate::ssh::message::MessageClass;
use crate::ssh::packet_io::PacketWriter;
use crate::ssh::transport::{
    transition, CloseReason, RekeyPolicy, RekeyTracker, TransportEffect, TransportEvent,
    TransportState,
};

/// Work for the writer task.
pub(crate) enum Outbound {
    /// Any message; held during key exchange unless it is a transport message.
    Packet(Vec<u8>),
    /// Our KEXINIT. Starts holding.
    BeginKex(Vec<u8>),
    /// A key exchange message, never held.
    Kex(Vec<u8>),
    /// Send NEWKEYS, switch to these keys and release held messages.
    NewKeys(SealingState),
    /// The peer's NEWKEYS arrived; the exchange is over.
    KexDone,
    /// Shut the stream down.
    Close,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared by every task working on one transport.
pub struct Connection {
    peer: String,
    state: watch::Sender<TransportState>,
    close_reason: Mutex<Option<CloseReason>>,
    outbound: mpsc::UnboundedSender<Outbound>,
    received_bytes: AtomicU64,
    handshake: Mutex<KexHandshake>,
    channels: Mutex<ChannelTable>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Creates a connection in `VersionExchange` together with the queue the
    /// writer task drains.
    pub(crate) fn new(
        peer: String,
        handshake: KexHandshake,
        channels: ChannelTable,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(TransportState::VersionExchange);
        let conn = Arc::new(Self {
            peer,
            state,
            close_reason: Mutex::new(None),
            outbound,
            received_bytes: AtomicU64::new(0),
            handshake: Mutex::new(handshake),
            channels: Mutex::new(channels),
        });
        (conn, rx)
    }

    /// Peer address used in logs.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Current transport state.
    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    pub(crate) fn handshake(&self) -> MutexGuard<'_, KexHandshake> {
        lock(&self.handshake)
    }

    pub(crate) fn channels(&self) -> MutexGuard<'_, ChannelTable> {
        lock(&self.channels)
    }

    pub(crate) fn add_received(&self, bytes: usize) {
        self.received_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn take_received(&self) -> u64 {
        self.received_bytes.swap(0, Ordering::Relaxed)
    }

    /// Feeds `event` to the state machine and carries out its effects.
    pub(crate) fn apply(&self, event: TransportEvent) -> SkiffResult<()> {
        let mut outcome = Ok(Vec::new());
        let mut change = None;
        self.state.send_if_modified(|state| match transition(*state, event) {
            Ok((next, effects)) => {
                outcome = Ok(effects);
                if next == *state {
                    return false;
                }
                change = Some((*state, next));
                *state = next;
                true
            }
            Err(e) => {
                outcome = Err(e);
                false
            }
        });

        let effects = outcome?;
        if let Some((from, to)) = change {
            log_state_transition(&self.peer, &from.to_string(), &to.to_string());
        }
        for effect in effects {
            self.perform(effect, event);
        }
        Ok(())
    }

    fn perform(&self, effect: TransportEffect, event: TransportEvent) {
        match effect {
            TransportEffect::SendKexInit => {
                let mut handshake = self.handshake();
                let initial = handshake.session_id().is_none();
                if let Some(kexinit) = handshake.start() {
                    drop(handshake);
                    let initiator = if event == TransportEvent::PeerKexInit {
                        "peer"
                    } else {
                        "local"
                    };
                    log_kex_start(&self.peer, initial, initiator);
                    self.queue(Outbound::BeginKex(kexinit));
                }
            }
            // The banner is written before the connection exists and the
            // writer task does the holding itself.
            TransportEffect::SendBanner
            | TransportEffect::HoldChannelTraffic
            | TransportEffect::ReleaseChannelTraffic => {}
            TransportEffect::CloseStream => self.queue(Outbound::Close),
            TransportEffect::ZeroizeKeys => self.handshake().abort(),
            TransportEffect::FailPending => {
                let reason = lock(&self.close_reason).clone().unwrap_or_else(|| {
                    CloseReason::from_error(&SkiffError::TransportClosed(
                        "Transport closed".to_string(),
                    ))
                });
                self.channels().fail_all(reason);
            }
        }
    }

    fn queue(&self, msg: Outbound) {
        if self.outbound.send(msg).is_err() {
            debug!(peer = %self.peer, "Writer task already stopped");
        }
    }

    /// Closes the transport because of `error`.
    pub(crate) fn close(&self, error: &SkiffError) {
        let event = match error {
            SkiffError::Timeout(_) => TransportEvent::Timeout,
            _ => TransportEvent::Fatal,
        };
        self.close_with(event, error);
    }

    /// Closes the transport with an explicit event, recording `error` as the
    /// reason pending and later operations fail with.
    pub(crate) fn close_with(&self, event: TransportEvent, error: &SkiffError) {
        {
            let mut reason = lock(&self.close_reason);
            if reason.is_some() {
                return;
            }
            *reason = Some(CloseReason::from_error(error));
        }

        if event != TransportEvent::Disconnect {
            log_transport_closed(&self.peer, &error.to_string());
        }
        if let Err(e) = self.apply(event) {
            debug!(peer = %self.peer, error = %e, "Close event rejected");
        }
    }

    /// The error a closed transport reports.
    pub fn closed_error(&self) -> SkiffError {
        match &*lock(&self.close_reason) {
            Some(reason) => reason.to_error(),
            None => SkiffError::TransportClosed("Transport closed".to_string()),
        }
    }

    /// Queues one message for the writer.
    ///
    /// # Errors
    ///
    /// Fails with the close reason once the transport is closed.
    pub fn send(&self, payload: Vec<u8>) -> SkiffResult<()> {
        if self.state() == TransportState::Closed {
            return Err(self.closed_error());
        }
        self.outbound
            .send(Outbound::Packet(payload))
            .map_err(|_| self.closed_error())
    }

    /// Waits until the first key exchange has completed.
    pub async fn wait_usable(&self) -> SkiffResult<()> {
        let mut rx = self.subscribe();
        let state = *rx
            .wait_for(|s| s.is_usable() || *s == TransportState::Closed)
            .await
            .map_err(|_| self.closed_error())?;
        if state == TransportState::Closed {
            return Err(self.closed_error());
        }
        Ok(())
    }

    /// Starts a key exchange now.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] unless the transport is established
    /// or already rekeying.
    pub fn request_rekey(&self) -> SkiffResult<()> {
        self.apply(TransportEvent::RekeyDue)
    }

    /// Hands key exchange output to the writer.
    pub(crate) fn queue_kex(&self, outputs: Vec<KexOutput>) {
        for output in outputs {
            let msg = match output {
                KexOutput::BeginKex(kexinit) => {
                    let initial = self.handshake().session_id().is_none();
                    log_kex_start(&self.peer, initial, "peer");
                    Outbound::BeginKex(kexinit)
                }
                KexOutput::Send(payload) => Outbound::Kex(payload),
                KexOutput::NewKeys(sealing) => Outbound::NewKeys(sealing),
            };
            self.queue(msg);
        }
    }

    /// Records a finished key exchange.
    pub(crate) fn kex_completed(&self, summary: &KexSummary) -> SkiffResult<()> {
        self.queue(Outbound::KexDone);
        log_kex_complete(&self.peer, &summary.host_key_fingerprint, summary.duration_ms);
        self.apply(TransportEvent::KexCompleted)
    }
}

struct Writer<W> {
    conn: Arc<Connection>,
    packets: PacketWriter<W>,
    tracker: RekeyTracker,
    held: VecDeque<Vec<u8>>,
    holding: bool,
    kex_deadline: Option<Instant>,
    kex_timeout: Duration,
}

impl<W: AsyncWrite + Unpin> Writer<W> {
    async fn write(&mut self, payload: Vec<u8>) -> SkiffResult<()> {
        let msg_type = payload.first().copied().unwrap_or_default();
        let sequence = self.packets.next_sequence();
        let written = self.packets.write_packet(payload).await?;
        log_packet("send", msg_type, sequence, written);

        self.tracker
            .add_bytes(written as u64 + self.conn.take_received());
        if !self.holding && self.tracker.is_due(Instant::now()) {
            self.rekey();
        }
        Ok(())
    }

    fn rekey(&mut self) {
        if let Err(e) = self.conn.request_rekey() {
            debug!(error = %e, "Rekey not started");
            self.tracker.reset(Instant::now());
        }
    }

    async fn handle(&mut self, msg: Outbound) -> SkiffResult<()> {
        match msg {
            Outbound::Packet(payload) => {
                let msg_type = payload.first().copied().unwrap_or_default();
                if self.holding && !MessageClass::of(msg_type).allowed_during_kex() {
                    self.held.push_back(payload);
                    return Ok(());
                }
                self.write(payload).await
            }
            Outbound::BeginKex(kexinit) => {
                self.holding = true;
                self.kex_deadline = Some(Instant::now() + self.kex_timeout);
                self.write(kexinit).await
            }
            Outbound::Kex(payload) => self.write(payload).await,
            Outbound::NewKeys(sealing) => {
                self.write(NewKeys.to_bytes()).await?;
                self.packets.install(sealing);
                self.holding = false;
                log_held_traffic("release", self.held.len());
                while let Some(payload) = self.held.pop_front() {
                    self.write(payload).await?;
                }
                Ok(())
            }
            Outbound::KexDone => {
                self.kex_deadline = None;
                self.tracker.reset(Instant::now());
                self.conn.take_received();
                Ok(())
            }
            Outbound::Close => Ok(()),
        }
    }
}

/// Drains the outbound queue onto the stream until the transport closes.
///
/// Also enforces the key exchange deadline and the time-based rekey
/// threshold.
pub(crate) async fn run_writer<W>(
    conn: Arc<Connection>,
    packets: PacketWriter<W>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    rekey: RekeyPolicy,
    kex_timeout: Duration,
) where
    W: AsyncWrite + Unpin,
{
    let mut writer = Writer {
        conn,
        packets,
        tracker: RekeyTracker::new(rekey),
        held: VecDeque::new(),
        holding: false,
        kex_deadline: None,
        kex_timeout,
    };

    loop {
        let rekey_at = writer.tracker.deadline();
        let kex_deadline = writer.kex_deadline;

        let step = tokio::select! {
            biased;
            msg = rx.recv() => match msg {
                Some(Outbound::Close) | None => break,
                Some(msg) => writer.handle(msg).await,
            },
            _ = time::sleep_until(kex_deadline.unwrap_or(rekey_at)), if kex_deadline.is_some() => {
                writer.kex_deadline = None;
                Err(SkiffError::Timeout("key exchange".to_string()))
            }
            _ = time::sleep_until(rekey_at), if !writer.holding => {
                writer.rekey();
                Ok(())
            }
        };

        if let Err(e) = step {
            writer.conn.close(&e);
            break;
        }
    }

    if !writer.held.is_empty() {
        log_held_traffic("drop", writer.held.len());
    }
    if let Err(e) = writer.packets.shutdown().await {
        debug!(error = %e, "Stream shutdown failed");
    }
}
