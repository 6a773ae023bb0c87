//! Async channel operations over one connection.
//!
//! [`ChannelMux`] is a cheap, cloneable handle. Every operation follows the
//! same pattern: register for the channel's wake-up, inspect and update the
//! [`ChannelTable`] under its lock, hand any resulting packets to the writer
//! while still holding the lock, and only then wait. All state changes happen
//! synchronously between await points, so dropping a pending `read`, `write`
//! or `request` leaves the channel exactly as it was.

use std::sync::Arc;

use skiff_platform::{SkiffError, SkiffResult};
use tracing::warn;

use crate::ssh::channel::{
    ChannelId, ChannelState, ChannelTable, OpenStatus, ReadOutcome, Stream, WriteOutcome,
};
use crate::ssh::connection::{ChannelRequestType, ChannelType};
use crate::ssh::connection_mgr::Connection;

/// Handle for opening and driving channels.
#[derive(Debug, Clone)]
pub struct ChannelMux {
    conn: Arc<Connection>,
}

/// Closes a channel whose `open` was dropped before the peer answered.
struct PendingOpen<'a> {
    conn: &'a Connection,
    id: ChannelId,
    armed: bool,
}

impl Drop for PendingOpen<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut table = self.conn.channels();
        for packet in table.abandon(self.id) {
            if self.conn.send(packet).is_err() {
                break;
            }
        }
    }
}

impl ChannelMux {
    pub(crate) fn new(conn: Arc<Connection>) -> Self {
        Self { conn }
    }

    async fn wait<T>(
        &self,
        id: ChannelId,
        mut poll: impl FnMut(&mut ChannelTable) -> SkiffResult<Option<T>>,
    ) -> SkiffResult<T> {
        let notify = self.conn.channels().notifier(id)?;
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut table = self.conn.channels();
                if let Some(value) = poll(&mut table)? {
                    return Ok(value);
                }
            }

            notified.await;
        }
    }

    /// Opens a channel and waits for the peer to confirm it.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::ChannelClosed`] if the peer refuses the channel.
    pub async fn open(&self, kind: ChannelType) -> SkiffResult<Channel> {
        let id = {
            let mut table = self.conn.channels();
            let (id, packet) = table.open(&kind)?;
            if let Err(e) = self.conn.send(packet) {
                table.discard(id);
                return Err(e);
            }
            id
        };

        let mut pending = PendingOpen {
            conn: &self.conn,
            id,
            armed: true,
        };
        let status = self
            .wait(id, |table| match table.open_status(id)? {
                OpenStatus::Pending => Ok(None),
                status => Ok(Some(status)),
            })
            .await?;
        pending.armed = false;

        match status {
            OpenStatus::Failed {
                reason_code,
                description,
            } => {
                self.conn.channels().discard(id);
                warn!(
                    channel = id,
                    kind = kind.name(),
                    reason_code = reason_code,
                    description = %description,
                    "Channel open refused"
                );
                Err(SkiffError::ChannelClosed(id))
            }
            _ => Ok(Channel {
                id,
                mux: self.clone(),
            }),
        }
    }

    /// Writes as much of `data` as the peer's window allows, waiting while
    /// the window is exhausted. Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::ChannelClosed`] once the channel is closed.
    pub async fn write(&self, id: ChannelId, data: &[u8]) -> SkiffResult<usize> {
        let conn = &self.conn;
        self.wait(id, |table| match table.write(id, data)? {
            WriteOutcome::Sent { written, packet } => {
                if let Some(packet) = packet {
                    conn.send(packet)?;
                }
                Ok(Some(written))
            }
            WriteOutcome::Blocked => Ok(None),
        })
        .await
    }

    /// Writes all of `data`.
    pub async fn write_all(&self, id: ChannelId, mut data: &[u8]) -> SkiffResult<()> {
        while !data.is_empty() {
            let written = self.write(id, data).await?;
            data = &data[written..];
        }
        Ok(())
    }

    async fn read_stream(&self, id: ChannelId, stream: Stream) -> SkiffResult<Vec<u8>> {
        let conn = &self.conn;
        self.wait(id, |table| match table.read(id, stream)? {
            ReadOutcome::Data { data, adjust } => {
                if let Some(adjust) = adjust {
                    conn.send(adjust)?;
                }
                Ok(Some(data))
            }
            ReadOutcome::Eof => Ok(Some(Vec::new())),
            ReadOutcome::Pending => Ok(None),
        })
        .await
    }

    /// Waits for data and returns everything buffered, in order.
    ///
    /// Returns an empty vector once the peer has sent EOF or closed the
    /// channel and the buffer is drained.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::ChannelClosed`] after a local close.
    pub async fn read(&self, id: ChannelId) -> SkiffResult<Vec<u8>> {
        self.read_stream(id, Stream::Stdout).await
    }

    /// Like [`ChannelMux::read`], for the stderr stream.
    pub async fn read_stderr(&self, id: ChannelId) -> SkiffResult<Vec<u8>> {
        self.read_stream(id, Stream::Stderr).await
    }

    /// Tells the peer no more data will be written.
    pub fn send_eof(&self, id: ChannelId) -> SkiffResult<()> {
        let mut table = self.conn.channels();
        if let Some(packet) = table.send_eof(id)? {
            self.conn.send(packet)?;
        }
        Ok(())
    }

    /// Sends a channel request.
    ///
    /// With `want_reply`, waits for the peer's answer and returns whether it
    /// succeeded; otherwise returns `true` once the request is queued.
    pub async fn request(
        &self,
        id: ChannelId,
        request_type: ChannelRequestType,
        want_reply: bool,
    ) -> SkiffResult<bool> {
        let ticket = {
            let mut table = self.conn.channels();
            let (packet, ticket) = table.request(id, request_type, want_reply)?;
            self.conn.send(packet)?;
            ticket
        };

        match ticket {
            Some(ticket) => self.wait(id, |table| table.request_result(id, ticket)).await,
            None => Ok(true),
        }
    }

    /// Runs `command` on a session channel.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] if the server refuses the request.
    pub async fn exec(&self, id: ChannelId, command: &str) -> SkiffResult<()> {
        let accepted = self
            .request(
                id,
                ChannelRequestType::Exec {
                    command: command.to_string(),
                },
                true,
            )
            .await?;
        if !accepted {
            return Err(SkiffError::Protocol(format!(
                "exec refused on channel {}",
                id
            )));
        }
        Ok(())
    }

    /// Waits for the remote command to finish.
    ///
    /// Returns `None` if the peer closed the channel without an exit status.
    pub async fn exit_status(&self, id: ChannelId) -> SkiffResult<Option<u32>> {
        self.wait(id, |table| {
            if let Some(status) = table.exit_status(id)? {
                return Ok(Some(Some(status)));
            }
            if table.remote_closed(id)? {
                return Ok(Some(None));
            }
            Ok(None)
        })
        .await
    }

    /// Signal that terminated the remote command, if the peer reported one.
    pub fn exit_signal(&self, id: ChannelId) -> SkiffResult<Option<String>> {
        self.conn.channels().exit_signal(id)
    }

    /// Closes the channel.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::ChannelClosed`] if it was already closed.
    pub fn close(&self, id: ChannelId) -> SkiffResult<()> {
        let mut table = self.conn.channels();
        if let Some(packet) = table.close(id)? {
            self.conn.send(packet)?;
        }
        Ok(())
    }

    /// Current state of the channel.
    pub fn state(&self, id: ChannelId) -> SkiffResult<ChannelState> {
        self.conn.channels().state(id)
    }
}

/// A confirmed channel.
///
/// The handle refers to the channel by id; it does not own it. Clones refer
/// to the same channel.
#[derive(Debug, Clone)]
pub struct Channel {
    id: ChannelId,
    mux: ChannelMux,
}

impl Channel {
    /// Local channel id.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// See [`ChannelMux::write`].
    pub async fn write(&self, data: &[u8]) -> SkiffResult<usize> {
        self.mux.write(self.id, data).await
    }

    /// See [`ChannelMux::write_all`].
    pub async fn write_all(&self, data: &[u8]) -> SkiffResult<()> {
        self.mux.write_all(self.id, data).await
    }

    /// See [`ChannelMux::read`].
    pub async fn read(&self) -> SkiffResult<Vec<u8>> {
        self.mux.read(self.id).await
    }

    /// See [`ChannelMux::read_stderr`].
    pub async fn read_stderr(&self) -> SkiffResult<Vec<u8>> {
        self.mux.read_stderr(self.id).await
    }

    /// Reads until EOF.
    pub async fn read_to_end(&self) -> SkiffResult<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let chunk = self.read().await?;
            if chunk.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(&chunk);
        }
    }

    /// See [`ChannelMux::send_eof`].
    pub fn send_eof(&self) -> SkiffResult<()> {
        self.mux.send_eof(self.id)
    }

    /// See [`ChannelMux::request`].
    pub async fn request(
        &self,
        request_type: ChannelRequestType,
        want_reply: bool,
    ) -> SkiffResult<bool> {
        self.mux.request(self.id, request_type, want_reply).await
    }

    /// See [`ChannelMux::exec`].
    pub async fn exec(&self, command: &str) -> SkiffResult<()> {
        self.mux.exec(self.id, command).await
    }

    /// See [`ChannelMux::exit_status`].
    pub async fn exit_status(&self) -> SkiffResult<Option<u32>> {
        self.mux.exit_status(self.id).await
    }

    /// See [`ChannelMux::exit_signal`].
    pub fn exit_signal(&self) -> SkiffResult<Option<String>> {
        self.mux.exit_signal(self.id)
    }

    /// See [`ChannelMux::close`].
    pub fn close(&self) -> SkiffResult<()> {
        self.mux.close(self.id)
    }

    /// See [`ChannelMux::state`].
    pub fn state(&self) -> SkiffResult<ChannelState> {
        self.mux.state(self.id)
    }
}
