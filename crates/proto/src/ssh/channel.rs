//! Channel bookkeeping for one connection.
//!
//! [`ChannelTable`] is owned by the connection and holds every channel it
//! multiplexes. It never performs I/O: each operation mutates the table and
//! hands back the packets the caller must send, so the whole flow-control
//! logic is testable without a transport.
//!
//! Channel handles refer to entries by [`ChannelId`], never by pointer.
//! Local ids are allocated from a counter and never reused.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use skiff_platform::{SkiffError, SkiffResult};
use tokio::sync::Notify;

use crate::ssh::connection::{
    encode_data, ChannelClose, ChannelData, ChannelEof, ChannelExtendedData, ChannelFailure,
    ChannelOpen, ChannelOpenConfirmation, ChannelOpenFailure, ChannelOpenFailureReason,
    ChannelRequest, ChannelRequestType, ChannelSuccess, ChannelType, ChannelWindowAdjust,
    EXTENDED_DATA_STDERR,
};
use crate::ssh::logging::{log_channel_event, log_unexpected_message, log_window_adjust};
use crate::ssh::message::MessageType;
use crate::ssh::packet::MAX_PAYLOAD_SIZE;
use crate::ssh::transport::CloseReason;

/// Local channel number.
pub type ChannelId = u32;

/// Message number, recipient channel and data length of CHANNEL_DATA.
const CHANNEL_DATA_HEADER_LEN: usize = 1 + 4 + 4;

/// Largest data chunk that fits in one packet our codec can frame.
pub const MAX_CHANNEL_DATA: u32 = (MAX_PAYLOAD_SIZE - CHANNEL_DATA_HEADER_LEN) as u32;

/// Window and packet limits we advertise for new channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelDefaults {
    /// Initial receive window in bytes
    pub window_size: u32,
    /// Largest data packet we accept
    pub max_packet_size: u32,
}

impl Default for ChannelDefaults {
    fn default() -> Self {
        Self {
            window_size: 2 * 1024 * 1024,
            max_packet_size: 32 * 1024,
        }
    }
}

/// Flow-control credit in bytes.
///
/// Arithmetic is checked: the window can neither go negative nor wrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    size: u32,
}

impl Window {
    /// Creates a window with `size` bytes of credit.
    pub fn new(size: u32) -> Self {
        Self { size }
    }

    /// Remaining credit.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Spends `bytes` of credit.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] if fewer than `bytes` remain.
    pub fn consume(&mut self, bytes: u32) -> SkiffResult<()> {
        self.size = self.size.checked_sub(bytes).ok_or_else(|| {
            SkiffError::Protocol(format!(
                "{} bytes exceed the remaining window of {}",
                bytes, self.size
            ))
        })?;
        Ok(())
    }

    /// Adds `bytes` of credit.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] if the window would exceed 2^32 - 1.
    pub fn grow(&mut self, bytes: u32) -> SkiffResult<()> {
        self.size = self
            .size
            .checked_add(bytes)
            .ok_or_else(|| SkiffError::Protocol("Window adjust overflows the window".to_string()))?;
        Ok(())
    }
}

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// CHANNEL_OPEN sent, no answer yet
    Opening,
    /// Confirmed by the peer
    Open,
    /// One side has sent CHANNEL_CLOSE
    Closing,
    /// Both sides have sent CHANNEL_CLOSE, or the open was refused
    Closed,
}

/// Outcome of a CHANNEL_OPEN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenStatus {
    /// No answer yet
    Pending,
    /// The peer confirmed the channel
    Confirmed,
    /// The peer refused the channel
    Failed {
        /// Reason code from CHANNEL_OPEN_FAILURE
        reason_code: u32,
        /// Description from CHANNEL_OPEN_FAILURE
        description: String,
    },
}

/// Which incoming stream to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    /// CHANNEL_DATA
    Stdout,
    /// CHANNEL_EXTENDED_DATA with type 1
    Stderr,
}

/// Result of [`ChannelTable::write`].
#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// `written` bytes were packaged into `packet`.
    Sent {
        /// Bytes taken from the caller's buffer
        written: usize,
        /// CHANNEL_DATA to send, absent for an empty write
        packet: Option<Vec<u8>>,
    },
    /// The peer's window is exhausted.
    Blocked,
}

/// Result of [`ChannelTable::read`].
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Buffered bytes, in arrival order.
    Data {
        /// The bytes
        data: Vec<u8>,
        /// WINDOW_ADJUST to send, if enough credit was consumed
        adjust: Option<Vec<u8>>,
    },
    /// The peer will send nothing more on this stream.
    Eof,
    /// Nothing buffered yet.
    Pending,
}

#[derive(Debug)]
struct ChannelEntry {
    remote_id: u32,
    state: ChannelState,
    open_status: OpenStatus,
    send_window: Window,
    remote_max_packet: u32,
    recv_window: Window,
    unacknowledged: u32,
    stdout: VecDeque<u8>,
    stderr: VecDeque<u8>,
    eof_received: bool,
    eof_sent: bool,
    close_sent: bool,
    close_received: bool,
    local_closed: bool,
    abandoned: bool,
    exit_status: Option<u32>,
    exit_signal: Option<String>,
    requests_sent: u64,
    replies_received: u64,
    replies: HashMap<u64, bool>,
    notify: Arc<Notify>,
}

impl ChannelEntry {
    fn new(window: u32) -> Self {
        Self {
            remote_id: 0,
            state: ChannelState::Opening,
            open_status: OpenStatus::Pending,
            send_window: Window::new(0),
            remote_max_packet: 0,
            recv_window: Window::new(window),
            unacknowledged: 0,
            stdout: VecDeque::new(),
            stderr: VecDeque::new(),
            eof_received: false,
            eof_sent: false,
            close_sent: false,
            close_received: false,
            local_closed: false,
            abandoned: false,
            exit_status: None,
            exit_signal: None,
            requests_sent: 0,
            replies_received: 0,
            replies: HashMap::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    fn writable(&self) -> bool {
        self.state == ChannelState::Open && !self.local_closed && !self.close_sent
    }

    fn close_packet(&mut self) -> Vec<u8> {
        self.close_sent = true;
        ChannelClose {
            recipient_channel: self.remote_id,
        }
        .to_bytes()
    }
}

/// All channels of one connection.
#[derive(Debug)]
pub struct ChannelTable {
    defaults: ChannelDefaults,
    next_id: ChannelId,
    channels: HashMap<ChannelId, ChannelEntry>,
    failure: Option<CloseReason>,
}

impl ChannelTable {
    /// Creates an empty table.
    pub fn new(defaults: ChannelDefaults) -> Self {
        Self {
            defaults,
            next_id: 0,
            channels: HashMap::new(),
            failure: None,
        }
    }

    fn check_transport(&self) -> SkiffResult<()> {
        match &self.failure {
            Some(reason) => Err(reason.to_error()),
            None => Ok(()),
        }
    }

    fn entry(&self, id: ChannelId) -> SkiffResult<&ChannelEntry> {
        self.check_transport()?;
        self.channels.get(&id).ok_or(SkiffError::ChannelClosed(id))
    }

    fn entry_mut(&mut self, id: ChannelId) -> SkiffResult<&mut ChannelEntry> {
        self.check_transport()?;
        self.channels
            .get_mut(&id)
            .ok_or(SkiffError::ChannelClosed(id))
    }

    fn peer_entry(&mut self, id: ChannelId, msg: &str) -> SkiffResult<&mut ChannelEntry> {
        self.channels.get_mut(&id).ok_or_else(|| {
            SkiffError::Protocol(format!("{} for unknown channel {}", msg, id))
        })
    }

    /// Allocates a local id and builds the CHANNEL_OPEN for it.
    pub fn open(&mut self, kind: &ChannelType) -> SkiffResult<(ChannelId, Vec<u8>)> {
        self.check_transport()?;
        let id = self.next_id;
        self.next_id = self
            .next_id
            .checked_add(1)
            .ok_or_else(|| SkiffError::Protocol("Channel ids exhausted".to_string()))?;

        self.channels
            .insert(id, ChannelEntry::new(self.defaults.window_size));
        log_channel_event(id, "open");

        let packet = ChannelOpen {
            channel_type: kind.clone(),
            sender_channel: id,
            initial_window_size: self.defaults.window_size,
            maximum_packet_size: self.defaults.max_packet_size,
        }
        .to_bytes();
        Ok((id, packet))
    }

    /// Wake-up handle signalled on every change to the channel.
    pub fn notifier(&self, id: ChannelId) -> SkiffResult<Arc<Notify>> {
        Ok(self.entry(id)?.notify.clone())
    }

    /// Current state of the channel.
    pub fn state(&self, id: ChannelId) -> SkiffResult<ChannelState> {
        Ok(self.entry(id)?.state)
    }

    /// Answer to the CHANNEL_OPEN, if any.
    pub fn open_status(&self, id: ChannelId) -> SkiffResult<OpenStatus> {
        Ok(self.entry(id)?.open_status.clone())
    }

    /// Remaining send credit granted by the peer.
    pub fn send_window(&self, id: ChannelId) -> SkiffResult<u32> {
        Ok(self.entry(id)?.send_window.size())
    }

    /// Remaining receive credit we have granted the peer.
    pub fn recv_window(&self, id: ChannelId) -> SkiffResult<u32> {
        Ok(self.entry(id)?.recv_window.size())
    }

    /// Gives up on a channel whose opener went away.
    ///
    /// A channel still waiting for its answer is closed as soon as the peer
    /// confirms it. Returns packets to send now.
    pub fn abandon(&mut self, id: ChannelId) -> Vec<Vec<u8>> {
        let Some(entry) = self.channels.get_mut(&id) else {
            return Vec::new();
        };

        match entry.open_status {
            OpenStatus::Pending => {
                entry.abandoned = true;
                entry.local_closed = true;
                Vec::new()
            }
            OpenStatus::Confirmed if !entry.close_sent => {
                entry.local_closed = true;
                entry.state = ChannelState::Closing;
                vec![entry.close_packet()]
            }
            OpenStatus::Confirmed => {
                entry.local_closed = true;
                if entry.close_received {
                    self.channels.remove(&id);
                }
                Vec::new()
            }
            OpenStatus::Failed { .. } => {
                self.channels.remove(&id);
                Vec::new()
            }
        }
    }

    /// Forgets a channel whose open was refused.
    pub fn discard(&mut self, id: ChannelId) {
        if let Some(entry) = self.channels.remove(&id) {
            entry.notify.notify_waiters();
        }
    }

    /// Packages as much of `data` as the peer's window and packet limit allow.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::ChannelClosed`] once either side has closed the
    /// channel or after EOF was sent.
    pub fn write(&mut self, id: ChannelId, data: &[u8]) -> SkiffResult<WriteOutcome> {
        let entry = self.entry_mut(id)?;
        if !entry.writable() || entry.eof_sent || entry.close_received {
            return Err(SkiffError::ChannelClosed(id));
        }
        if data.is_empty() {
            return Ok(WriteOutcome::Sent {
                written: 0,
                packet: None,
            });
        }

        let limit = entry.send_window.size().min(entry.remote_max_packet);
        let len = u32::try_from(data.len()).unwrap_or(u32::MAX).min(limit);
        if len == 0 {
            return Ok(WriteOutcome::Blocked);
        }

        entry.send_window.consume(len)?;
        let written = len as usize;
        Ok(WriteOutcome::Sent {
            written,
            packet: Some(encode_data(entry.remote_id, &data[..written])),
        })
    }

    /// Takes everything buffered on `stream`.
    ///
    /// Consumed bytes are re-advertised once half of the initial window has
    /// been read.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::ChannelClosed`] after a local close.
    pub fn read(&mut self, id: ChannelId, stream: Stream) -> SkiffResult<ReadOutcome> {
        let threshold = self.defaults.window_size / 2;
        let entry = self.entry_mut(id)?;
        if entry.local_closed {
            return Err(SkiffError::ChannelClosed(id));
        }

        let buffer = match stream {
            Stream::Stdout => &mut entry.stdout,
            Stream::Stderr => &mut entry.stderr,
        };
        if buffer.is_empty() {
            if entry.eof_received || entry.close_received {
                return Ok(ReadOutcome::Eof);
            }
            return Ok(ReadOutcome::Pending);
        }

        let data: Vec<u8> = buffer.drain(..).collect();
        let read = u32::try_from(data.len()).unwrap_or(u32::MAX);
        entry.unacknowledged = entry.unacknowledged.saturating_add(read);

        let mut adjust = None;
        if entry.unacknowledged >= threshold.max(1) && !entry.close_sent && !entry.close_received {
            let bytes = entry.unacknowledged;
            entry.recv_window.grow(bytes)?;
            entry.unacknowledged = 0;
            log_window_adjust(id, "recv", bytes, entry.recv_window.size());
            adjust = Some(
                ChannelWindowAdjust {
                    recipient_channel: entry.remote_id,
                    bytes_to_add: bytes,
                }
                .to_bytes(),
            );
        }

        Ok(ReadOutcome::Data { data, adjust })
    }

    /// Builds CHANNEL_EOF. Returns `None` if EOF was already sent.
    pub fn send_eof(&mut self, id: ChannelId) -> SkiffResult<Option<Vec<u8>>> {
        let entry = self.entry_mut(id)?;
        if !entry.writable() {
            return Err(SkiffError::ChannelClosed(id));
        }
        if entry.eof_sent {
            return Ok(None);
        }
        entry.eof_sent = true;
        log_channel_event(id, "eof-sent");
        Ok(Some(
            ChannelEof {
                recipient_channel: entry.remote_id,
            }
            .to_bytes(),
        ))
    }

    /// Builds a CHANNEL_REQUEST.
    ///
    /// With `want_reply` the second value is a ticket for
    /// [`ChannelTable::request_result`].
    pub fn request(
        &mut self,
        id: ChannelId,
        request_type: ChannelRequestType,
        want_reply: bool,
    ) -> SkiffResult<(Vec<u8>, Option<u64>)> {
        let entry = self.entry_mut(id)?;
        if !entry.writable() || entry.close_received {
            return Err(SkiffError::ChannelClosed(id));
        }

        let ticket = if want_reply {
            let ticket = entry.requests_sent;
            entry.requests_sent += 1;
            Some(ticket)
        } else {
            None
        };

        let packet = ChannelRequest {
            recipient_channel: entry.remote_id,
            request_type,
            want_reply,
        }
        .to_bytes();
        Ok((packet, ticket))
    }

    /// Reply to a ticketed request, if it has arrived.
    pub fn request_result(&mut self, id: ChannelId, ticket: u64) -> SkiffResult<Option<bool>> {
        let entry = self.entry_mut(id)?;
        if let Some(ok) = entry.replies.remove(&ticket) {
            return Ok(Some(ok));
        }
        if entry.close_received || entry.local_closed {
            return Err(SkiffError::ChannelClosed(id));
        }
        Ok(None)
    }

    /// Closes the channel locally.
    ///
    /// Returns the CHANNEL_CLOSE to send, or `None` if the peer closed first
    /// and was already answered.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::ChannelClosed`] if the channel was already closed
    /// locally.
    pub fn close(&mut self, id: ChannelId) -> SkiffResult<Option<Vec<u8>>> {
        let entry = self.entry_mut(id)?;
        if entry.local_closed {
            return Err(SkiffError::ChannelClosed(id));
        }
        entry.local_closed = true;
        entry.notify.notify_waiters();
        log_channel_event(id, "close");

        if entry.close_received {
            entry.state = ChannelState::Closed;
            self.channels.remove(&id);
            return Ok(None);
        }

        entry.state = ChannelState::Closing;
        if entry.close_sent {
            return Ok(None);
        }
        Ok(Some(entry.close_packet()))
    }

    /// Exit status reported by the peer, if any.
    pub fn exit_status(&self, id: ChannelId) -> SkiffResult<Option<u32>> {
        Ok(self.entry(id)?.exit_status)
    }

    /// Signal name reported by the peer, if any.
    pub fn exit_signal(&self, id: ChannelId) -> SkiffResult<Option<String>> {
        Ok(self.entry(id)?.exit_signal.clone())
    }

    /// Returns true once the peer has sent CHANNEL_CLOSE.
    pub fn remote_closed(&self, id: ChannelId) -> SkiffResult<bool> {
        Ok(self.entry(id)?.close_received)
    }

    /// Applies one connection-protocol message from the peer.
    ///
    /// Returns the packets to send in response.
    ///
    /// # Errors
    ///
    /// Violations of flow control or of the channel lifecycle return
    /// [`SkiffError::Protocol`]; the transport cannot continue after them.
    pub fn handle(&mut self, payload: &[u8]) -> SkiffResult<Vec<Vec<u8>>> {
        let msg_type = payload
            .first()
            .copied()
            .ok_or_else(|| SkiffError::MalformedPacket("Empty message".to_string()))?;

        let (id, replies) = match MessageType::from_u8(msg_type) {
            Some(MessageType::ChannelOpen) => {
                let open = ChannelOpen::from_bytes(payload)?;
                log_unexpected_message(msg_type, open.channel_type.name());
                let refusal = ChannelOpenFailure::new(
                    open.sender_channel,
                    ChannelOpenFailureReason::AdministrativelyProhibited,
                );
                return Ok(vec![refusal.to_bytes()]);
            }
            Some(MessageType::ChannelOpenConfirmation) => {
                let msg = ChannelOpenConfirmation::from_bytes(payload)?;
                (msg.recipient_channel, self.on_confirmation(msg)?)
            }
            Some(MessageType::ChannelOpenFailure) => {
                let msg = ChannelOpenFailure::from_bytes(payload)?;
                (msg.recipient_channel, self.on_open_failure(msg)?)
            }
            Some(MessageType::ChannelWindowAdjust) => {
                let msg = ChannelWindowAdjust::from_bytes(payload)?;
                let entry = self.peer_entry(msg.recipient_channel, "WINDOW_ADJUST")?;
                entry.send_window.grow(msg.bytes_to_add)?;
                log_window_adjust(
                    msg.recipient_channel,
                    "send",
                    msg.bytes_to_add,
                    entry.send_window.size(),
                );
                (msg.recipient_channel, Vec::new())
            }
            Some(MessageType::ChannelData) => {
                let msg = ChannelData::from_bytes(payload)?;
                self.on_data(msg.recipient_channel, Some(Stream::Stdout), msg.data)?;
                (msg.recipient_channel, Vec::new())
            }
            Some(MessageType::ChannelExtendedData) => {
                let msg = ChannelExtendedData::from_bytes(payload)?;
                let stream = (msg.data_type_code == EXTENDED_DATA_STDERR).then_some(Stream::Stderr);
                self.on_data(msg.recipient_channel, stream, msg.data)?;
                (msg.recipient_channel, Vec::new())
            }
            Some(MessageType::ChannelEof) => {
                let msg = ChannelEof::from_bytes(payload)?;
                let entry = self.peer_entry(msg.recipient_channel, "CHANNEL_EOF")?;
                entry.eof_received = true;
                log_channel_event(msg.recipient_channel, "eof-received");
                (msg.recipient_channel, Vec::new())
            }
            Some(MessageType::ChannelClose) => {
                let msg = ChannelClose::from_bytes(payload)?;
                (msg.recipient_channel, self.on_close(msg.recipient_channel)?)
            }
            Some(MessageType::ChannelRequest) => {
                let msg = ChannelRequest::from_bytes(payload)?;
                (msg.recipient_channel, self.on_request(msg)?)
            }
            Some(MessageType::ChannelSuccess) => {
                let msg = ChannelSuccess::from_bytes(payload)?;
                self.on_reply(msg.recipient_channel, true)?;
                (msg.recipient_channel, Vec::new())
            }
            Some(MessageType::ChannelFailure) => {
                let msg = ChannelFailure::from_bytes(payload)?;
                self.on_reply(msg.recipient_channel, false)?;
                (msg.recipient_channel, Vec::new())
            }
            _ => {
                return Err(SkiffError::Protocol(format!(
                    "Message {} is not a channel message",
                    msg_type
                )))
            }
        };

        if let Some(entry) = self.channels.get(&id) {
            entry.notify.notify_waiters();
        }
        Ok(replies)
    }

    fn on_confirmation(&mut self, msg: ChannelOpenConfirmation) -> SkiffResult<Vec<Vec<u8>>> {
        let id = msg.recipient_channel;
        let entry = self.peer_entry(id, "OPEN_CONFIRMATION")?;
        if entry.open_status != OpenStatus::Pending {
            return Err(SkiffError::Protocol(format!(
                "Channel {} confirmed twice",
                id
            )));
        }
        if msg.maximum_packet_size == 0 {
            return Err(SkiffError::Protocol(format!(
                "Channel {} confirmed with a zero packet size",
                id
            )));
        }

        entry.remote_id = msg.sender_channel;
        entry.send_window = Window::new(msg.initial_window_size);
        entry.remote_max_packet = msg.maximum_packet_size.min(MAX_CHANNEL_DATA);
        entry.open_status = OpenStatus::Confirmed;
        entry.state = ChannelState::Open;
        log_channel_event(id, "confirmed");

        if entry.abandoned {
            entry.state = ChannelState::Closing;
            log_channel_event(id, "abandoned");
            return Ok(vec![entry.close_packet()]);
        }
        Ok(Vec::new())
    }

    fn on_open_failure(&mut self, msg: ChannelOpenFailure) -> SkiffResult<Vec<Vec<u8>>> {
        let id = msg.recipient_channel;
        let entry = self.peer_entry(id, "OPEN_FAILURE")?;
        if entry.open_status != OpenStatus::Pending {
            return Err(SkiffError::Protocol(format!(
                "Open failure for established channel {}",
                id
            )));
        }

        if entry.abandoned {
            self.channels.remove(&id);
            return Ok(Vec::new());
        }
        entry.state = ChannelState::Closed;
        entry.open_status = OpenStatus::Failed {
            reason_code: msg.reason_code,
            description: msg.description,
        };
        log_channel_event(id, "refused");
        Ok(Vec::new())
    }

    fn accept_data(&mut self, id: ChannelId, len: usize) -> SkiffResult<&mut ChannelEntry> {
        let entry = self.peer_entry(id, "Channel data")?;
        if entry.open_status != OpenStatus::Confirmed {
            return Err(SkiffError::Protocol(format!(
                "Data on unconfirmed channel {}",
                id
            )));
        }
        if entry.eof_received || entry.close_received {
            return Err(SkiffError::Protocol(format!(
                "Data after EOF on channel {}",
                id
            )));
        }
        let len = u32::try_from(len)
            .map_err(|_| SkiffError::Protocol("Channel data too large".to_string()))?;
        entry.recv_window.consume(len)?;
        Ok(entry)
    }

    fn on_data(
        &mut self,
        id: ChannelId,
        stream: Option<Stream>,
        data: Vec<u8>,
    ) -> SkiffResult<()> {
        let entry = self.accept_data(id, data.len())?;
        if entry.local_closed {
            return Ok(());
        }
        match stream {
            Some(Stream::Stdout) => entry.stdout.extend(data),
            Some(Stream::Stderr) => entry.stderr.extend(data),
            // Unknown data types still use up window credit.
            None => {
                let bytes = u32::try_from(data.len()).unwrap_or(u32::MAX);
                entry.unacknowledged = entry.unacknowledged.saturating_add(bytes);
            }
        }
        Ok(())
    }

    fn on_close(&mut self, id: ChannelId) -> SkiffResult<Vec<Vec<u8>>> {
        let entry = self.peer_entry(id, "CHANNEL_CLOSE")?;
        if entry.close_received {
            return Err(SkiffError::Protocol(format!(
                "Channel {} closed twice by peer",
                id
            )));
        }
        entry.close_received = true;
        entry.state = ChannelState::Closed;
        log_channel_event(id, "close-received");

        let mut replies = Vec::new();
        if !entry.close_sent {
            replies.push(entry.close_packet());
        }
        if entry.local_closed {
            entry.notify.notify_waiters();
            self.channels.remove(&id);
        }
        Ok(replies)
    }

    fn on_request(&mut self, msg: ChannelRequest) -> SkiffResult<Vec<Vec<u8>>> {
        let entry = self.peer_entry(msg.recipient_channel, "CHANNEL_REQUEST")?;
        match msg.request_type {
            ChannelRequestType::ExitStatus { exit_status } => {
                entry.exit_status = Some(exit_status);
                Ok(Vec::new())
            }
            ChannelRequestType::ExitSignal { signal_name, .. } => {
                entry.exit_signal = Some(signal_name);
                Ok(Vec::new())
            }
            other => {
                log_unexpected_message(MessageType::ChannelRequest as u8, other.name());
                if msg.want_reply {
                    Ok(vec![ChannelFailure {
                        recipient_channel: entry.remote_id,
                    }
                    .to_bytes()])
                } else {
                    Ok(Vec::new())
                }
            }
        }
    }

    fn on_reply(&mut self, id: ChannelId, ok: bool) -> SkiffResult<()> {
        let entry = self.peer_entry(id, "Request reply")?;
        if entry.replies_received >= entry.requests_sent {
            return Err(SkiffError::Protocol(format!(
                "Unsolicited request reply on channel {}",
                id
            )));
        }
        entry.replies.insert(entry.replies_received, ok);
        entry.replies_received += 1;
        Ok(())
    }

    /// Fails every channel with the transport's close reason.
    ///
    /// Only the first reason is kept.
    pub fn fail_all(&mut self, reason: CloseReason) {
        if self.failure.is_none() {
            self.failure = Some(reason);
        }
        for entry in self.channels.values() {
            entry.notify.notify_waiters();
        }
    }

    /// Number of live channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Returns true if no channel is live.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER_ID: u32 = 77;

    fn small() -> ChannelDefaults {
        ChannelDefaults {
            window_size: 100,
            max_packet_size: 64,
        }
    }

    fn confirm(table: &mut ChannelTable, id: ChannelId, window: u32, max_packet: u32) {
        let msg = ChannelOpenConfirmation {
            recipient_channel: id,
            sender_channel: PEER_ID,
            initial_window_size: window,
            maximum_packet_size: max_packet,
        };
        assert!(table.handle(&msg.to_bytes()).unwrap().is_empty());
    }

    fn open_confirmed(table: &mut ChannelTable, window: u32) -> ChannelId {
        let (id, _) = table.open(&ChannelType::Session).unwrap();
        confirm(table, id, window, 32);
        id
    }

    fn data(id: ChannelId, bytes: &[u8]) -> Vec<u8> {
        encode_data(id, bytes)
    }

    #[test]
    fn test_window_checked_arithmetic() {
        let mut window = Window::new(10);
        window.consume(4).unwrap();
        assert_eq!(window.size(), 6);
        assert!(window.consume(7).is_err());
        assert_eq!(window.size(), 6);

        let mut full = Window::new(u32::MAX - 1);
        assert!(full.grow(2).is_err());
        full.grow(1).unwrap();
        assert_eq!(full.size(), u32::MAX);
    }

    #[test]
    fn test_open_allocates_fresh_ids() {
        let mut table = ChannelTable::new(ChannelDefaults::default());
        let (first, packet) = table.open(&ChannelType::Session).unwrap();
        let (second, _) = table.open(&ChannelType::Session).unwrap();
        assert_ne!(first, second);

        let open = ChannelOpen::from_bytes(&packet).unwrap();
        assert_eq!(open.sender_channel, first);
        assert_eq!(open.initial_window_size, 2 * 1024 * 1024);
        assert_eq!(open.maximum_packet_size, 32 * 1024);
        assert_eq!(table.state(first).unwrap(), ChannelState::Opening);

        table.discard(first);
        let (third, _) = table.open(&ChannelType::Session).unwrap();
        assert!(third > second);
    }

    #[test]
    fn test_write_respects_window_and_packet_size() {
        let mut table = ChannelTable::new(small());
        let id = open_confirmed(&mut table, 40);

        match table.write(id, &[1u8; 100]).unwrap() {
            WriteOutcome::Sent { written, packet } => {
                assert_eq!(written, 32);
                let msg = ChannelData::from_bytes(&packet.unwrap()).unwrap();
                assert_eq!(msg.recipient_channel, PEER_ID);
                assert_eq!(msg.data.len(), 32);
            }
            WriteOutcome::Blocked => panic!("window was open"),
        }
        match table.write(id, &[1u8; 100]).unwrap() {
            WriteOutcome::Sent { written, .. } => assert_eq!(written, 8),
            WriteOutcome::Blocked => panic!("8 bytes remained"),
        }
        assert_eq!(table.write(id, &[1u8; 10]).unwrap(), WriteOutcome::Blocked);
        assert_eq!(table.send_window(id).unwrap(), 0);
    }

    #[test]
    fn test_large_peer_packet_size_is_capped() {
        let mut table = ChannelTable::new(small());
        let (id, _) = table.open(&ChannelType::Session).unwrap();
        confirm(&mut table, id, 1 << 20, 256 * 1024);

        match table.write(id, &[7u8; 100_000]).unwrap() {
            WriteOutcome::Sent { written, packet } => {
                assert_eq!(written, MAX_CHANNEL_DATA as usize);
                let packet = packet.unwrap();
                crate::ssh::packet::PacketCodec::aead(16).frame(packet).unwrap();
            }
            WriteOutcome::Blocked => panic!("window was open"),
        }
    }

    #[test]
    fn test_window_adjust_unblocks_writes() {
        let mut table = ChannelTable::new(small());
        let id = open_confirmed(&mut table, 0);
        assert_eq!(table.write(id, b"hello").unwrap(), WriteOutcome::Blocked);

        let adjust = ChannelWindowAdjust {
            recipient_channel: id,
            bytes_to_add: 5,
        };
        table.handle(&adjust.to_bytes()).unwrap();
        assert!(matches!(
            table.write(id, b"hello").unwrap(),
            WriteOutcome::Sent { written: 5, .. }
        ));
    }

    #[test]
    fn test_window_adjust_overflow_is_protocol_error() {
        let mut table = ChannelTable::new(small());
        let id = open_confirmed(&mut table, u32::MAX);
        let adjust = ChannelWindowAdjust {
            recipient_channel: id,
            bytes_to_add: 1,
        };
        assert!(matches!(
            table.handle(&adjust.to_bytes()),
            Err(SkiffError::Protocol(_))
        ));
    }

    #[test]
    fn test_read_buffers_in_order_and_readvertises() {
        let mut table = ChannelTable::new(small());
        let id = open_confirmed(&mut table, 100);

        assert_eq!(table.read(id, Stream::Stdout).unwrap(), ReadOutcome::Pending);
        table.handle(&data(id, b"abc")).unwrap();
        table.handle(&data(id, b"def")).unwrap();

        match table.read(id, Stream::Stdout).unwrap() {
            ReadOutcome::Data { data, adjust } => {
                assert_eq!(data, b"abcdef");
                assert!(adjust.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(table.recv_window(id).unwrap(), 94);

        table.handle(&data(id, &[0u8; 50])).unwrap();
        match table.read(id, Stream::Stdout).unwrap() {
            ReadOutcome::Data { adjust: Some(packet), .. } => {
                let msg = ChannelWindowAdjust::from_bytes(&packet).unwrap();
                assert_eq!(msg.recipient_channel, PEER_ID);
                assert_eq!(msg.bytes_to_add, 56);
            }
            other => panic!("expected a window adjust, got {:?}", other),
        }
        assert_eq!(table.recv_window(id).unwrap(), 100);
    }

    #[test]
    fn test_data_beyond_window_is_rejected() {
        let mut table = ChannelTable::new(small());
        let id = open_confirmed(&mut table, 100);
        table.handle(&data(id, &[0u8; 60])).unwrap();
        assert!(matches!(
            table.handle(&data(id, &[0u8; 41])),
            Err(SkiffError::Protocol(_))
        ));
        assert_eq!(table.recv_window(id).unwrap(), 40);
    }

    #[test]
    fn test_stderr_and_eof() {
        let mut table = ChannelTable::new(small());
        let id = open_confirmed(&mut table, 100);

        let stderr = ChannelExtendedData {
            recipient_channel: id,
            data_type_code: EXTENDED_DATA_STDERR,
            data: b"oops".to_vec(),
        };
        table.handle(&stderr.to_bytes()).unwrap();
        table
            .handle(&ChannelEof { recipient_channel: id }.to_bytes())
            .unwrap();

        assert_eq!(table.read(id, Stream::Stdout).unwrap(), ReadOutcome::Eof);
        assert!(matches!(
            table.read(id, Stream::Stderr).unwrap(),
            ReadOutcome::Data { ref data, .. } if data == b"oops"
        ));
        assert_eq!(table.read(id, Stream::Stderr).unwrap(), ReadOutcome::Eof);
        assert!(matches!(
            table.handle(&data(id, b"late")),
            Err(SkiffError::Protocol(_))
        ));
    }

    #[test]
    fn test_close_handshake_local_first() {
        let mut table = ChannelTable::new(small());
        let id = open_confirmed(&mut table, 100);

        let packet = table.close(id).unwrap().unwrap();
        assert_eq!(ChannelClose::from_bytes(&packet).unwrap().recipient_channel, PEER_ID);
        assert_eq!(table.state(id).unwrap(), ChannelState::Closing);
        assert!(matches!(table.write(id, b"x"), Err(SkiffError::ChannelClosed(_))));
        assert!(matches!(table.close(id), Err(SkiffError::ChannelClosed(_))));

        let replies = table
            .handle(&ChannelClose { recipient_channel: id }.to_bytes())
            .unwrap();
        assert!(replies.is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn test_close_handshake_peer_first() {
        let mut table = ChannelTable::new(small());
        let id = open_confirmed(&mut table, 100);
        table.handle(&data(id, b"tail")).unwrap();

        let replies = table
            .handle(&ChannelClose { recipient_channel: id }.to_bytes())
            .unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(table.state(id).unwrap(), ChannelState::Closed);
        assert!(matches!(table.write(id, b"x"), Err(SkiffError::ChannelClosed(_))));

        assert!(matches!(
            table.read(id, Stream::Stdout).unwrap(),
            ReadOutcome::Data { .. }
        ));
        assert_eq!(table.read(id, Stream::Stdout).unwrap(), ReadOutcome::Eof);

        assert_eq!(table.close(id).unwrap(), None);
        assert!(matches!(table.read(id, Stream::Stdout), Err(SkiffError::ChannelClosed(_))));
    }

    #[test]
    fn test_open_failure_is_recorded() {
        let mut table = ChannelTable::new(small());
        let (id, _) = table.open(&ChannelType::Session).unwrap();
        let failure = ChannelOpenFailure {
            recipient_channel: id,
            reason_code: 2,
            description: "connect failed".to_string(),
        };
        table.handle(&failure.to_bytes()).unwrap();
        assert_eq!(
            table.open_status(id).unwrap(),
            OpenStatus::Failed {
                reason_code: 2,
                description: "connect failed".to_string()
            }
        );
        assert_eq!(table.state(id).unwrap(), ChannelState::Closed);
    }

    #[test]
    fn test_abandoned_open_is_closed_on_confirmation() {
        let mut table = ChannelTable::new(small());
        let (id, _) = table.open(&ChannelType::Session).unwrap();
        assert!(table.abandon(id).is_empty());

        let confirmation = ChannelOpenConfirmation {
            recipient_channel: id,
            sender_channel: PEER_ID,
            initial_window_size: 10,
            maximum_packet_size: 10,
        };
        let replies = table.handle(&confirmation.to_bytes()).unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0][0], MessageType::ChannelClose as u8);

        table
            .handle(&ChannelClose { recipient_channel: id }.to_bytes())
            .unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn test_requests_and_ticketed_replies() {
        let mut table = ChannelTable::new(small());
        let id = open_confirmed(&mut table, 100);

        let (_, first) = table
            .request(id, ChannelRequestType::Exec { command: "ls".into() }, true)
            .unwrap();
        let (_, none) = table
            .request(
                id,
                ChannelRequestType::Env {
                    name: "LANG".into(),
                    value: "C".into(),
                },
                false,
            )
            .unwrap();
        let (_, second) = table.request(id, ChannelRequestType::Shell, true).unwrap();
        assert_eq!(none, None);

        let (first, second) = (first.unwrap(), second.unwrap());
        assert_eq!(table.request_result(id, first).unwrap(), None);

        table
            .handle(&ChannelSuccess { recipient_channel: id }.to_bytes())
            .unwrap();
        table
            .handle(&ChannelFailure { recipient_channel: id }.to_bytes())
            .unwrap();
        assert_eq!(table.request_result(id, first).unwrap(), Some(true));
        assert_eq!(table.request_result(id, second).unwrap(), Some(false));

        assert!(matches!(
            table.handle(&ChannelSuccess { recipient_channel: id }.to_bytes()),
            Err(SkiffError::Protocol(_))
        ));
    }

    #[test]
    fn test_exit_status_and_unknown_requests() {
        let mut table = ChannelTable::new(small());
        let id = open_confirmed(&mut table, 100);

        let status = ChannelRequest {
            recipient_channel: id,
            request_type: ChannelRequestType::ExitStatus { exit_status: 3 },
            want_reply: false,
        };
        assert!(table.handle(&status.to_bytes()).unwrap().is_empty());
        assert_eq!(table.exit_status(id).unwrap(), Some(3));

        let keepalive = ChannelRequest {
            recipient_channel: id,
            request_type: ChannelRequestType::Other("keepalive@openssh.com".into()),
            want_reply: true,
        };
        let replies = table.handle(&keepalive.to_bytes()).unwrap();
        let failure = ChannelFailure::from_bytes(&replies[0]).unwrap();
        assert_eq!(failure.recipient_channel, PEER_ID);
    }

    #[test]
    fn test_incoming_open_is_refused() {
        let mut table = ChannelTable::new(small());
        let open = ChannelOpen {
            channel_type: ChannelType::Other("x11".into()),
            sender_channel: 5,
            initial_window_size: 100,
            maximum_packet_size: 100,
        };
        let replies = table.handle(&open.to_bytes()).unwrap();
        let failure = ChannelOpenFailure::from_bytes(&replies[0]).unwrap();
        assert_eq!(failure.recipient_channel, 5);
        assert_eq!(failure.reason_code, 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_unknown_channel_is_protocol_error() {
        let mut table = ChannelTable::new(small());
        assert!(matches!(
            table.handle(&data(9, b"x")),
            Err(SkiffError::Protocol(_))
        ));
    }

    #[test]
    fn test_fail_all_reraises_reason() {
        let mut table = ChannelTable::new(small());
        let id = open_confirmed(&mut table, 100);
        table.fail_all(CloseReason::from_error(&SkiffError::Timeout("key exchange".into())));
        table.fail_all(CloseReason::from_error(&SkiffError::TransportClosed("later".into())));

        assert!(matches!(table.write(id, b"x"), Err(SkiffError::Timeout(_))));
        assert!(matches!(table.read(id, Stream::Stdout), Err(SkiffError::Timeout(_))));
        assert!(matches!(
            table.open(&ChannelType::Session),
            Err(SkiffError::Timeout(_))
        ));
    }
}
