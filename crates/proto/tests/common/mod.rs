//! Scripted SSH server for integration tests.
//!
//! Listens on a loopback TCP port and speaks just enough of the server side
//! of the protocol for a test to drive the client step by step: version
//! exchange, Curve25519 or DH group 14 key exchange, user authentication and
//! channel messages. Everything is built from the crate's public message
//! types, so the server and client share no private state.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use skiff_proto::ssh::auth::{
    construct_signature_data, AuthFailure, AuthMethod, AuthRequest, AuthSuccess, ServiceAccept,
    ServiceRequest, CONNECTION_SERVICE,
};
use skiff_proto::ssh::connection::{
    ChannelClose, ChannelData, ChannelEof, ChannelOpen, ChannelOpenConfirmation, ChannelRequest,
    ChannelRequestType, ChannelSuccess, ChannelWindowAdjust,
};
use skiff_proto::ssh::crypto::{OpeningState, SealingState};
use skiff_proto::ssh::hostkey::{verify_signature, Ed25519Keypair, HostKey};
use skiff_proto::ssh::kex::{
    AlgorithmPreferences, KexDhInit, KexDhReply, KexEcdhInit, KexEcdhReply, KexInit,
    NegotiatedAlgorithms, NewKeys,
};
use skiff_proto::ssh::kex_dh::{Curve25519Exchange, DhGroup14Exchange, ExchangeHash, SessionKeys};
use skiff_proto::ssh::packet_io::{PacketReader, PacketWriter};
use skiff_proto::ssh::session::{Session, SessionConfig};
use skiff_proto::ssh::version::Version;
use skiff_proto::ssh::HostKeyCheck;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

/// Seed of the scripted server's host key.
pub const HOST_KEY_SEED: [u8; 32] = [7u8; 32];

/// Upper bound for any single step of a scenario.
pub const STEP: Duration = Duration::from_secs(10);

/// Installs a `tracing` subscriber once; controlled by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Binds a loopback listener on an ephemeral port.
pub async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

/// Client-side TCP stream whose lifetime a test can observe.
///
/// The returned `Arc` has a strong count of 1 once the stream is dropped.
pub struct TrackedStream {
    inner: TcpStream,
    _alive: Arc<()>,
}

impl TrackedStream {
    pub async fn connect(addr: &str) -> (Self, Arc<()>) {
        let alive = Arc::new(());
        let stream = Self {
            inner: TcpStream::connect(addr).await.unwrap(),
            _alive: Arc::clone(&alive),
        };
        (stream, alive)
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Client configuration trusting the scripted host key.
pub fn client_config() -> SessionConfig {
    let host_key = Ed25519Keypair::from_bytes(&HOST_KEY_SEED).unwrap();
    SessionConfig::default()
        .with_host_key_check(HostKeyCheck::Fingerprints(vec![host_key.fingerprint()]))
        .with_connect_timeout(STEP)
        .with_kex_timeout(STEP)
}

/// How the server answers user authentication requests.
#[derive(Debug, Clone)]
pub struct AuthScript {
    /// Methods listed in USERAUTH_FAILURE
    pub methods: Vec<String>,
    /// Password accepted for the "password" method
    pub password: Option<String>,
    /// Public key blobs accepted for the "publickey" method
    pub keys: Vec<Vec<u8>>,
}

impl AuthScript {
    pub fn password_only(password: &str) -> Self {
        Self {
            methods: vec!["password".to_string()],
            password: Some(password.to_string()),
            keys: Vec::new(),
        }
    }

    pub fn publickey(key: &Ed25519Keypair) -> Self {
        Self {
            methods: vec!["publickey".to_string(), "password".to_string()],
            password: None,
            keys: vec![key.public_key_blob()],
        }
    }
}

/// Server side of one accepted connection.
pub struct ScriptedServer {
    reader: PacketReader<OwnedReadHalf>,
    writer: PacketWriter<OwnedWriteHalf>,
    key: Ed25519Keypair,
    pub prefs: AlgorithmPreferences,
    client_version: String,
    server_version: String,
    session_id: Option<Vec<u8>>,
    /// Sign something other than the exchange hash.
    pub sign_garbage: bool,
    /// Packets read while looking for something else.
    backlog: VecDeque<Vec<u8>>,
    next_channel: u32,
}

impl ScriptedServer {
    /// Accepts one connection and exchanges identification strings.
    pub async fn accept(listener: &TcpListener) -> Self {
        Self::accept_with(listener, AlgorithmPreferences::default()).await
    }

    /// Like [`accept`](Self::accept) with explicit server preferences.
    pub async fn accept_with(listener: &TcpListener, prefs: AlgorithmPreferences) -> Self {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let mut reader = PacketReader::new(read_half);
        let mut writer = PacketWriter::new(write_half);

        let version = Version::new("scripted_1.0", None);
        writer.write_banner(&version).await.unwrap();
        let (_, client_version) = reader.read_banner().await.unwrap();

        Self {
            reader,
            writer,
            key: Ed25519Keypair::from_bytes(&HOST_KEY_SEED).unwrap(),
            prefs,
            client_version,
            server_version: version.to_string(),
            session_id: None,
            sign_garbage: false,
            backlog: VecDeque::new(),
            next_channel: 100,
        }
    }

    /// Replaces the host key, for scenarios with an untrusted server.
    pub fn set_host_key(&mut self, key: Ed25519Keypair) {
        self.key = key;
    }

    /// Sends one payload.
    pub async fn send(&mut self, payload: Vec<u8>) {
        self.writer.write_packet(payload).await.unwrap();
    }

    /// Reads the next payload, skipping SSH_MSG_IGNORE.
    pub async fn recv(&mut self) -> Vec<u8> {
        if let Some(payload) = self.backlog.pop_front() {
            return payload;
        }
        loop {
            let incoming = self.reader.read_packet().await.unwrap();
            if incoming.payload[0] != 2 {
                return incoming.payload;
            }
        }
    }

    /// Reads the next packet as is, SSH_MSG_IGNORE included.
    pub async fn recv_raw(&mut self) -> Vec<u8> {
        if let Some(payload) = self.backlog.pop_front() {
            return payload;
        }
        self.reader.read_packet().await.unwrap().payload
    }

    /// Reads until a message of type `msg_type`, keeping the others for
    /// later [`recv`](Self::recv) calls.
    pub async fn expect(&mut self, msg_type: u8) -> Vec<u8> {
        if let Some(pos) = self.backlog.iter().position(|p| p[0] == msg_type) {
            return self.backlog.remove(pos).unwrap();
        }
        loop {
            let incoming = self.reader.read_packet().await.unwrap();
            match incoming.payload[0] {
                2 => continue,
                t if t == msg_type => return incoming.payload,
                _ => self.backlog.push_back(incoming.payload),
            }
        }
    }

    /// Runs a key exchange started by the client's KEXINIT.
    pub async fn kex(&mut self) {
        let client_kexinit = self.expect(20).await;
        self.kex_with(client_kexinit).await;
    }

    /// Runs a key exchange whose client KEXINIT was already read.
    pub async fn kex_with(&mut self, client_kexinit: Vec<u8>) {
        let (algorithms, keys) = self.kex_reply(client_kexinit).await;

        self.send(NewKeys.to_bytes()).await;
        self.writer.install(
            SealingState::new(
                algorithms.cipher_server_to_client,
                algorithms.mac_server_to_client,
                &keys.server_to_client,
            )
            .unwrap(),
        );

        self.expect(21).await;
        self.reader.install(
            OpeningState::new(
                algorithms.cipher_client_to_server,
                algorithms.mac_client_to_server,
                &keys.client_to_server,
            )
            .unwrap(),
        );
    }

    /// Sends our KEXINIT and the signed reply, stopping before NEWKEYS.
    pub async fn kex_reply(
        &mut self,
        client_kexinit: Vec<u8>,
    ) -> (NegotiatedAlgorithms, SessionKeys) {
        let server_kexinit = self.prefs.kex_init().to_bytes();
        self.send(server_kexinit.clone()).await;

        let client = KexInit::from_bytes(&client_kexinit).unwrap();
        let server = KexInit::from_bytes(&server_kexinit).unwrap();
        let algorithms = NegotiatedAlgorithms::negotiate(&client, &server).unwrap();

        let init = self.expect(30).await;
        let host_key = self.key.public_key_blob();
        let hash = ExchangeHash {
            client_version: &self.client_version,
            server_version: &self.server_version,
            client_kexinit: &client_kexinit,
            server_kexinit: &server_kexinit,
            host_key: &host_key,
        };
        let sign = |h: &[u8]| {
            if self.sign_garbage {
                self.key.sign(b"not the exchange hash").unwrap()
            } else {
                self.key.sign(h).unwrap()
            }
        };

        let (reply, shared_secret, exchange_hash) = if algorithms.kex.is_ecdh() {
            let init = KexEcdhInit::from_bytes(&init).unwrap();
            let exchange = Curve25519Exchange::new().unwrap();
            let server_public = exchange.public_key().to_vec();
            let k = exchange.compute_shared_secret(&init.public_key).unwrap();
            let h = hash.ecdh(&init.public_key, &server_public, &k);
            let reply = KexEcdhReply {
                host_key: host_key.clone(),
                public_key: server_public,
                signature: sign(&h),
            }
            .to_bytes();
            (reply, k.to_vec(), h)
        } else {
            let init = KexDhInit::from_bytes(&init).unwrap();
            let exchange = DhGroup14Exchange::new();
            let k = exchange.compute_shared_secret(&init.e).unwrap();
            let h = hash.dh(&init.e, exchange.public_key(), &k);
            let reply = KexDhReply {
                host_key: host_key.clone(),
                f: exchange.public_key().to_vec(),
                signature: sign(&h),
            }
            .to_bytes();
            (reply, k.to_vec(), h)
        };
        self.send(reply).await;

        let session_id = self
            .session_id
            .get_or_insert_with(|| exchange_hash.clone())
            .clone();
        let keys = SessionKeys::derive(&shared_secret, &exchange_hash, &session_id, &algorithms);
        (algorithms, keys)
    }

    /// Session identifier of the first exchange.
    pub fn session_id(&self) -> &[u8] {
        self.session_id.as_deref().unwrap()
    }

    /// Serves user authentication until success or until the client stops
    /// asking. Returns the methods the client tried, "none" included.
    pub async fn serve_auth(&mut self, script: &AuthScript) -> Vec<String> {
        let request = ServiceRequest::from_bytes(&self.expect(5).await).unwrap();
        self.send(
            ServiceAccept {
                service_name: request.service_name,
            }
            .to_bytes(),
        )
        .await;

        let mut tried = Vec::new();
        loop {
            let request = AuthRequest::from_bytes(&self.expect(50).await).unwrap();
            assert_eq!(request.service_name(), CONNECTION_SERVICE);
            tried.push(request.method().name().to_string());

            if self.accepts(&request, script) {
                self.send(AuthSuccess.to_bytes()).await;
                return tried;
            }
            self.send(AuthFailure::new(script.methods.clone(), false).to_bytes())
                .await;
        }
    }

    fn accepts(&self, request: &AuthRequest, script: &AuthScript) -> bool {
        if !script.methods.iter().any(|m| m == request.method().name()) {
            return false;
        }
        match request.method() {
            AuthMethod::None => false,
            AuthMethod::Password(password) => script.password.as_deref() == Some(password.as_str()),
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                let Some(signature) = signature else {
                    return false;
                };
                if !script.keys.contains(public_key) {
                    return false;
                }
                let data = construct_signature_data(
                    self.session_id(),
                    request.user_name(),
                    CONNECTION_SERVICE,
                    algorithm,
                    public_key,
                );
                verify_signature(public_key, &data, signature).is_ok()
            }
        }
    }

    /// Confirms the next CHANNEL_OPEN. Returns the client's channel number.
    pub async fn accept_channel(&mut self, window: u32, max_packet: u32) -> u32 {
        let open = ChannelOpen::from_bytes(&self.expect(90).await).unwrap();
        let sender_channel = self.next_channel;
        self.next_channel += 1;
        self.send(
            ChannelOpenConfirmation {
                recipient_channel: open.sender_channel,
                sender_channel,
                initial_window_size: window,
                maximum_packet_size: max_packet,
            }
            .to_bytes(),
        )
        .await;
        open.sender_channel
    }

    /// Answers the next CHANNEL_REQUEST with SUCCESS if a reply is wanted.
    pub async fn accept_request(&mut self) -> ChannelRequestType {
        let request = ChannelRequest::from_bytes(&self.expect(98).await).unwrap();
        if request.want_reply {
            self.send(
                ChannelSuccess {
                    recipient_channel: request.recipient_channel,
                }
                .to_bytes(),
            )
            .await;
        }
        request.request_type
    }

    /// Reads CHANNEL_DATA until `len` bytes have arrived for any channel.
    pub async fn read_data(&mut self, len: usize) -> Vec<u8> {
        let mut data = Vec::with_capacity(len);
        while data.len() < len {
            let msg = ChannelData::from_bytes(&self.expect(94).await).unwrap();
            data.extend_from_slice(&msg.data);
        }
        data
    }

    pub async fn send_data(&mut self, channel: u32, data: &[u8]) {
        self.send(
            ChannelData {
                recipient_channel: channel,
                data: data.to_vec(),
            }
            .to_bytes(),
        )
        .await;
    }

    pub async fn adjust_window(&mut self, channel: u32, bytes: u32) {
        self.send(
            ChannelWindowAdjust {
                recipient_channel: channel,
                bytes_to_add: bytes,
            }
            .to_bytes(),
        )
        .await;
    }

    pub async fn send_exit_status(&mut self, channel: u32, exit_status: u32) {
        self.send(
            ChannelRequest {
                recipient_channel: channel,
                request_type: ChannelRequestType::ExitStatus { exit_status },
                want_reply: false,
            }
            .to_bytes(),
        )
        .await;
    }

    pub async fn send_eof(&mut self, channel: u32) {
        self.send(
            ChannelEof {
                recipient_channel: channel,
            }
            .to_bytes(),
        )
        .await;
    }

    pub async fn send_close(&mut self, channel: u32) {
        self.send(
            ChannelClose {
                recipient_channel: channel,
            }
            .to_bytes(),
        )
        .await;
    }
}

/// Connects a session to `addr` while the server side accepts and runs
/// the first key exchange.
pub async fn connected_pair(listener: &TcpListener, addr: &str) -> (Session, ScriptedServer) {
    let mut session = Session::new(client_config()).unwrap();
    let server = async {
        let mut server = ScriptedServer::accept(listener).await;
        server.kex().await;
        server
    };
    let (connected, server) = tokio::join!(session.connect(addr), server);
    connected.unwrap();
    (session, server)
}
