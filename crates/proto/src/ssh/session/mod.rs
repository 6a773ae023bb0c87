//! SSH session controller.
//!
//! A [`Session`] composes the transport, authentication and channel
//! multiplexer:
//!
//! 1. [`Session::connect`] opens the stream, exchanges identification
//!    strings and completes the first key exchange.
//! 2. [`Session::authenticate`] runs the user authentication protocol.
//! 3. [`Session::open_channel`] and [`Session::channels`] give access to
//!    channels.
//! 4. [`Session::disconnect`] (or dropping the session) releases the stream
//!    and wipes key material.
//!
//! # Example
//!
//! ```rust,no_run
//! use skiff_proto::ssh::auth::Credentials;
//! use skiff_proto::ssh::connection::ChannelType;
//! use skiff_proto::ssh::session::{Session, SessionConfig};
//!
//! # async fn example() -> skiff_platform::SkiffResult<()> {
//! let mut session = Session::new(SessionConfig::default())?;
//! session.connect("127.0.0.1:22").await?;
//! session
//!     .authenticate(Credentials::new("user").with_password("secret"))
//!     .await?;
//!
//! let channel = session.open_channel(ChannelType::Session).await?;
//! channel.exec("uname -a").await?;
//! let output = channel.read_to_end().await?;
//! println!("{}", String::from_utf8_lossy(&output));
//!
//! session.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod keepalive;

pub use config::SessionConfig;
pub use keepalive::{create_keepalive_message, KeepaliveTask};

use std::sync::Arc;
use std::time::Duration;

use skiff_platform::{SkiffError, SkiffResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::debug;

use crate::ssh::auth::{
    AuthAction, AuthBanner, AuthEvent, AuthFailure, AuthMachine, AuthMethod, AuthOutcome,
    AuthPolicy, AuthRequest, AuthSuccess, Credentials, ServiceAccept, ServiceRequest,
    CONNECTION_SERVICE, USERAUTH_SERVICE,
};
use crate::ssh::channel::ChannelTable;
use crate::ssh::connection::ChannelType;
use crate::ssh::connection_mgr::{run_writer, Connection};
use crate::ssh::dispatcher::run_dispatcher;
use crate::ssh::handshake::KexHandshake;
use crate::ssh::hostkey::fingerprint;
use crate::ssh::logging::{
    log_auth_attempt, log_auth_rejected, log_auth_success, log_banner_received,
    log_state_transition, log_transport_closed,
};
use crate::ssh::message::{Disconnect, DisconnectReason};
use crate::ssh::mux::{Channel, ChannelMux};
use crate::ssh::packet_io::{PacketReader, PacketWriter};
use crate::ssh::transport::{transition, TransportEvent, TransportState};
use crate::ssh::version::Version;

/// How long `disconnect` waits for the writer to flush DISCONNECT.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// One SSH client session.
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    /// State before a [`Connection`] exists.
    local_state: TransportState,
    conn: Option<Arc<Connection>>,
    auth_rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    writer: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
    server_banner: Option<String>,
    authenticated: bool,
    keepalive: Option<KeepaliveTask>,
}

impl Session {
    /// Creates a disconnected session.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Config`] if the configuration is invalid.
    pub fn new(config: SessionConfig) -> SkiffResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            local_state: TransportState::Disconnected,
            conn: None,
            auth_rx: None,
            writer: None,
            dispatcher: None,
            server_banner: None,
            authenticated: false,
            keepalive: None,
        })
    }

    /// Connects over TCP and completes the first key exchange.
    ///
    /// The TCP connect and the identification exchange share
    /// `connect_timeout`; the key exchange is bounded by `kex_timeout`.
    ///
    /// # Errors
    ///
    /// - [`SkiffError::Timeout`] if a deadline passes
    /// - [`SkiffError::ProtocolMismatch`] for an unusable server banner
    /// - [`SkiffError::KeyExchangeFailed`] if negotiation or host key
    ///   verification fails
    pub async fn connect(&mut self, endpoint: &str) -> SkiffResult<()> {
        let deadline = Instant::now() + self.config.connect_timeout;
        self.begin(endpoint)?;

        let stream = match time::timeout_at(deadline, TcpStream::connect(endpoint)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(self.fail_early(endpoint, SkiffError::Io(e))),
            Err(_) => {
                return Err(self.fail_early(endpoint, SkiffError::Timeout("connect".to_string())))
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = endpoint, error = %e, "Failed to set TCP_NODELAY");
        }

        self.establish(stream, endpoint, deadline).await
    }

    /// Runs the session over an already connected byte stream.
    ///
    /// # Errors
    ///
    /// Same as [`Session::connect`].
    pub async fn connect_stream<S>(&mut self, stream: S) -> SkiffResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let deadline = Instant::now() + self.config.connect_timeout;
        self.begin("stream")?;
        self.establish(stream, "stream", deadline).await
    }

    fn begin(&mut self, peer: &str) -> SkiffResult<()> {
        let (next, _) = transition(self.local_state, TransportEvent::Connect).map_err(|_| {
            SkiffError::Protocol(format!("Cannot connect a session in state {}", self.local_state))
        })?;
        log_state_transition(peer, &self.local_state.to_string(), &next.to_string());
        self.local_state = next;
        Ok(())
    }

    /// Closes a session that failed before its connection existed.
    fn fail_early(&mut self, peer: &str, error: SkiffError) -> SkiffError {
        let event = match error {
            SkiffError::Timeout(_) => TransportEvent::Timeout,
            _ => TransportEvent::Fatal,
        };
        if let Ok((next, _)) = transition(self.local_state, event) {
            log_state_transition(peer, &self.local_state.to_string(), &next.to_string());
            self.local_state = next;
        }
        log_transport_closed(peer, &error.to_string());
        error
    }

    async fn establish<S>(&mut self, stream: S, peer: &str, deadline: Instant) -> SkiffResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = PacketReader::new(read_half);
        let mut writer = PacketWriter::new(write_half);
        let client_version = Version::new(&self.config.client_software, None);

        let exchange = async {
            writer.write_banner(&client_version).await?;
            reader.read_banner().await
        };
        let server_line = match time::timeout_at(deadline, exchange).await {
            Ok(Ok((_, line))) => line,
            Ok(Err(e)) => return Err(self.fail_early(peer, e)),
            Err(_) => return Err(self.fail_early(peer, SkiffError::Timeout("connect".to_string()))),
        };
        log_banner_received(peer, &server_line);

        let handshake = KexHandshake::new(
            client_version.to_string(),
            server_line.clone(),
            self.config.algorithms.clone(),
            self.config.host_key_check.clone(),
        );
        let (conn, outbound) = Connection::new(
            peer.to_string(),
            handshake,
            ChannelTable::new(self.config.channel_defaults),
        );
        let (auth_tx, auth_rx) = mpsc::unbounded_channel();

        // KEXINIT may arrive as soon as the dispatcher runs
        conn.apply(TransportEvent::BannerAccepted)?;

        self.writer = Some(tokio::spawn(run_writer(
            Arc::clone(&conn),
            writer,
            outbound,
            self.config.rekey,
            self.config.kex_timeout,
        )));
        self.dispatcher = Some(tokio::spawn(run_dispatcher(Arc::clone(&conn), reader, auth_tx)));
        self.auth_rx = Some(auth_rx);
        self.server_banner = Some(server_line);
        self.conn = Some(Arc::clone(&conn));

        conn.wait_usable().await
    }

    fn connection(&self) -> SkiffResult<Arc<Connection>> {
        match &self.conn {
            Some(conn) => Ok(Arc::clone(conn)),
            None => Err(SkiffError::TransportClosed("Session is not connected".to_string())),
        }
    }

    /// Authenticates as `credentials.user()`.
    ///
    /// Credentials are tried in the order set by the configured
    /// [`AuthPolicy`]; a rejected one moves on to the next.
    ///
    /// # Errors
    ///
    /// - [`SkiffError::AuthExhausted`] once every credential was rejected;
    ///   the transport stays open
    /// - [`SkiffError::Protocol`] for a reply that makes no sense; the
    ///   transport is closed
    pub async fn authenticate(&mut self, credentials: Credentials) -> SkiffResult<AuthOutcome> {
        let conn = self.connection()?;
        if self.authenticated {
            return Err(SkiffError::Protocol("Session is already authenticated".to_string()));
        }
        let auth_rx = self
            .auth_rx
            .as_mut()
            .ok_or_else(|| SkiffError::TransportClosed("Session is not connected".to_string()))?;

        let outcome = match run_auth(&conn, auth_rx, &credentials, &self.config.auth_policy).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.is_fatal() {
                    conn.close(&e);
                }
                return Err(e);
            }
        };

        log_auth_success(credentials.user(), &outcome.method);
        self.authenticated = true;

        if let Some(interval) = self.config.keepalive_interval {
            let mut task = KeepaliveTask::new(interval);
            let keepalive_conn = Arc::clone(&conn);
            task.start(move |msg| keepalive_conn.send(msg));
            self.keepalive = Some(task);
        }

        Ok(outcome)
    }

    /// Returns whether authentication has completed.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Handle for opening and driving channels.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] before authentication.
    pub fn channels(&self) -> SkiffResult<ChannelMux> {
        let conn = self.connection()?;
        if !self.authenticated {
            return Err(SkiffError::Protocol(
                "Channels require an authenticated session".to_string(),
            ));
        }
        Ok(ChannelMux::new(conn))
    }

    /// Opens a channel of the given type.
    ///
    /// Parameters such as the target of a `direct-tcpip` channel travel in
    /// the [`ChannelType`] itself.
    pub async fn open_channel(&self, kind: ChannelType) -> SkiffResult<Channel> {
        self.channels()?.open(kind).await
    }

    /// Sends DISCONNECT and closes the transport.
    ///
    /// Every pending channel operation fails with
    /// [`SkiffError::TransportClosed`]. Calling this twice is harmless.
    pub async fn disconnect(&mut self) -> SkiffResult<()> {
        self.keepalive = None;

        let Some(conn) = self.conn.clone() else {
            self.local_state = TransportState::Closed;
            return Ok(());
        };

        if conn.state() != TransportState::Closed {
            debug!(peer = conn.peer(), channels = conn.channels().len(), "Disconnecting");
            let goodbye = Disconnect::new(DisconnectReason::ByApplication, "Disconnected by user");
            if let Err(e) = conn.send(goodbye.to_bytes()) {
                debug!(peer = conn.peer(), error = %e, "DISCONNECT not sent");
            }
            conn.close_with(
                TransportEvent::Disconnect,
                &SkiffError::TransportClosed("Disconnected by application".to_string()),
            );
        }

        // Both tasks are awaited so the stream halves and keys are gone on return.
        if let Some(mut writer) = self.writer.take() {
            if time::timeout(DISCONNECT_GRACE, &mut writer).await.is_err() {
                debug!(peer = conn.peer(), "Writer did not stop in time");
                writer.abort();
                let _ = writer.await;
            }
        }
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
            let _ = dispatcher.await;
        }
        self.auth_rx = None;
        Ok(())
    }

    /// Current transport state.
    pub fn state(&self) -> TransportState {
        match &self.conn {
            Some(conn) => conn.state(),
            None => self.local_state,
        }
    }

    /// Session identifier, available after the first key exchange.
    pub fn session_id(&self) -> Option<Vec<u8>> {
        let conn = self.conn.as_ref()?;
        let handshake = conn.handshake();
        handshake.session_id().map(<[u8]>::to_vec)
    }

    /// The server's identification line.
    pub fn server_banner(&self) -> Option<&str> {
        self.server_banner.as_deref()
    }

    /// `SHA256:` fingerprint of the server host key.
    pub fn host_key_fingerprint(&self) -> Option<String> {
        let conn = self.conn.as_ref()?;
        let handshake = conn.handshake();
        handshake.host_key().map(fingerprint)
    }

    /// Starts a key exchange now.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] unless the transport is established.
    pub fn request_rekey(&self) -> SkiffResult<()> {
        self.connection()?.request_rekey()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.keepalive = None;
        if let Some(conn) = &self.conn {
            if conn.state() != TransportState::Closed {
                conn.close_with(
                    TransportEvent::Disconnect,
                    &SkiffError::TransportClosed("Session dropped".to_string()),
                );
            }
            conn.handshake().abort();
        }
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
        }
    }
}

/// Drives the authentication state machine against the server.
async fn run_auth(
    conn: &Connection,
    auth_rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    credentials: &Credentials,
    policy: &AuthPolicy,
) -> SkiffResult<AuthOutcome> {
    let user = credentials.user();
    let mut machine = AuthMachine::new(&credentials.methods(), policy.clone())?;
    let session_id = conn
        .handshake()
        .session_id()
        .map(<[u8]>::to_vec)
        .ok_or_else(|| SkiffError::Protocol("No session identifier yet".to_string()))?;

    let mut banners = Vec::new();
    let mut current = "none";
    let mut action = machine.handle(AuthEvent::Start)?;

    loop {
        match action {
            AuthAction::SendServiceRequest => {
                let request = ServiceRequest {
                    service_name: USERAUTH_SERVICE.to_string(),
                };
                conn.send(request.to_bytes())?;
            }
            AuthAction::QueryMethods => {
                let request = AuthRequest::new(user, CONNECTION_SERVICE, AuthMethod::None);
                conn.send(request.to_bytes())?;
            }
            AuthAction::Attempt(index) => {
                let credential = &credentials.list()[index];
                current = credential.method();
                log_auth_attempt(user, current);
                conn.send(credential.request(user, &session_id)?)?;
            }
            AuthAction::Done => {
                return Ok(AuthOutcome {
                    method: current.to_string(),
                    attempted: machine.attempted().to_vec(),
                    banners,
                });
            }
            AuthAction::GiveUp => {
                return Err(SkiffError::AuthExhausted {
                    attempted: machine.attempted().to_vec(),
                });
            }
        }

        let event = loop {
            let payload = auth_rx.recv().await.ok_or_else(|| conn.closed_error())?;
            match payload[0] {
                6 => {
                    let accept = ServiceAccept::from_bytes(&payload)?;
                    if accept.service_name != USERAUTH_SERVICE {
                        return Err(SkiffError::Protocol(format!(
                            "Server accepted unexpected service {}",
                            accept.service_name
                        )));
                    }
                    break AuthEvent::ServiceAccepted;
                }
                51 => {
                    let failure = AuthFailure::from_bytes(&payload)?;
                    if let Some(method) = machine.in_flight() {
                        log_auth_rejected(user, method, failure.methods_can_continue());
                    }
                    break AuthEvent::Failure {
                        methods: failure.methods_can_continue().to_vec(),
                        partial_success: failure.partial_success(),
                    };
                }
                52 => {
                    AuthSuccess::from_bytes(&payload)?;
                    break AuthEvent::Success;
                }
                53 => {
                    let banner = AuthBanner::from_bytes(&payload)?;
                    debug!(peer = conn.peer(), "Authentication banner received");
                    banners.push(banner.message().to_string());
                }
                other => {
                    return Err(SkiffError::Protocol(format!(
                        "Unexpected message {} during authentication",
                        other
                    )));
                }
            }
        };

        action = machine.handle(event)?;
    }
}
