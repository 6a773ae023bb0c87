//! End-to-end session scenarios over real TCP loopback sockets.
//!
//! Each test drives a [`Session`] against the scripted server in
//! `common`, covering:
//! - Authentication fallback and exhaustion
//! - Flow control and window adjustment
//! - Rekeying in the middle of a transfer
//! - Timeouts and protocol failures during connect
//! - Channel-local errors and transport-wide shutdown

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::{connected_pair, listen, AuthScript, ScriptedServer, TrackedStream, STEP};
use skiff_platform::SkiffError;
use skiff_proto::ssh::auth::Credentials;
use skiff_proto::ssh::channel::MAX_CHANNEL_DATA;
use skiff_proto::ssh::connection::{ChannelData, ChannelRequestType, ChannelType};
use skiff_proto::ssh::hostkey::Ed25519Keypair;
use skiff_proto::ssh::message::{Disconnect, DisconnectReason};
use skiff_proto::ssh::session::Session;
use skiff_proto::ssh::{ChannelState, TransportState};
use tokio::time::{timeout, Instant};

/// Connects and authenticates with a password.
async fn authenticated_pair() -> (Session, ScriptedServer) {
    let (listener, addr) = listen().await;
    let (mut session, mut server) = connected_pair(&listener, &addr).await;

    let script = AuthScript::password_only("secret");
    let credentials = Credentials::new("alice").with_password("secret");
    let (outcome, _) = tokio::join!(session.authenticate(credentials), server.serve_auth(&script));
    outcome.unwrap();
    (session, server)
}

async fn wait_for_state(session: &Session, state: TransportState) {
    timeout(STEP, async {
        while session.state() != state {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_connect_establishes_transport() {
    common::init_tracing();
    let (listener, addr) = listen().await;
    let (session, server) = connected_pair(&listener, &addr).await;

    assert_eq!(session.state(), TransportState::Established);
    assert_eq!(session.server_banner(), Some("SSH-2.0-scripted_1.0"));
    assert_eq!(session.session_id().as_deref(), Some(server.session_id()));

    let host_key = Ed25519Keypair::from_bytes(&common::HOST_KEY_SEED).unwrap();
    assert_eq!(session.host_key_fingerprint(), Some(host_key.fingerprint()));
}

#[tokio::test]
async fn test_group14_key_exchange() {
    let (listener, addr) = listen().await;
    let mut session = Session::new(common::client_config()).unwrap();

    let server = async {
        let mut prefs = skiff_proto::ssh::AlgorithmPreferences::default();
        prefs.kex = vec!["diffie-hellman-group14-sha256".to_string()];
        prefs.ciphers = vec!["aes128-ctr".to_string()];
        let mut server = ScriptedServer::accept_with(&listener, prefs).await;
        server.kex().await;
        server
    };
    let (connected, _server) = tokio::join!(session.connect(&addr), server);

    connected.unwrap();
    assert_eq!(session.state(), TransportState::Established);
}

#[tokio::test]
async fn test_auth_falls_back_to_password() {
    let (listener, addr) = listen().await;
    let (mut session, mut server) = connected_pair(&listener, &addr).await;

    let script = AuthScript::password_only("secret");
    let credentials = Credentials::new("alice")
        .with_key(Ed25519Keypair::generate())
        .with_password("secret");
    let (outcome, tried) =
        tokio::join!(session.authenticate(credentials), server.serve_auth(&script));

    let outcome = outcome.unwrap();
    assert_eq!(outcome.method, "password");
    assert_eq!(outcome.attempted, vec!["publickey", "password"]);
    assert_eq!(tried, vec!["none", "publickey", "password"]);
    assert!(session.is_authenticated());
}

#[tokio::test]
async fn test_publickey_auth_succeeds() {
    let (listener, addr) = listen().await;
    let (mut session, mut server) = connected_pair(&listener, &addr).await;

    let key = Ed25519Keypair::generate();
    let script = AuthScript::publickey(&key);
    let credentials = Credentials::new("bob").with_key(key);
    let (outcome, tried) =
        tokio::join!(session.authenticate(credentials), server.serve_auth(&script));

    assert_eq!(outcome.unwrap().method, "publickey");
    assert_eq!(tried, vec!["none", "publickey"]);
}

#[tokio::test]
async fn test_auth_exhausted_keeps_transport_open() {
    let (listener, addr) = listen().await;
    let (mut session, mut server) = connected_pair(&listener, &addr).await;

    let script = AuthScript::password_only("right");
    let credentials = Credentials::new("alice").with_password("wrong");
    let server_side = async {
        let _ = timeout(Duration::from_millis(500), server.serve_auth(&script)).await;
    };
    let (outcome, _) = tokio::join!(session.authenticate(credentials), server_side);

    match outcome {
        Err(SkiffError::AuthExhausted { attempted }) => assert_eq!(attempted, vec!["password"]),
        other => panic!("expected AuthExhausted, got {:?}", other),
    }
    assert!(!session.is_authenticated());
    assert_eq!(session.state(), TransportState::Established);
    assert!(session.channels().is_err());
}

#[tokio::test]
async fn test_window_adjust_unblocks_write() {
    let (session, mut server) = authenticated_pair().await;

    let (channel, client_id) = tokio::join!(
        session.open_channel(ChannelType::Session),
        server.accept_channel(1000, 32768)
    );
    let channel = channel.unwrap();

    channel.write_all(&[0xAA; 1000]).await.unwrap();
    assert_eq!(server.read_data(1000).await.len(), 1000);

    // Window exhausted: the write waits, and cancelling it changes nothing.
    let blocked = timeout(Duration::from_millis(200), channel.write(&[0xBB; 10])).await;
    assert!(blocked.is_err());

    server.adjust_window(client_id, 500).await;
    let written = timeout(STEP, channel.write(&[0xCC; 500])).await.unwrap().unwrap();
    assert_eq!(written, 500);
    assert_eq!(server.read_data(500).await, vec![0xCC; 500]);
}

#[tokio::test]
async fn test_large_peer_packet_size_keeps_transport_open() {
    let (session, mut server) = authenticated_pair().await;

    let (channel, _) = tokio::join!(
        session.open_channel(ChannelType::Session),
        server.accept_channel(1 << 20, 256 * 1024)
    );
    let channel = channel.unwrap();

    let written = channel.write(&[7; 100_000]).await.unwrap();
    assert!(written <= MAX_CHANNEL_DATA as usize);
    channel.write_all(&[7; 100_000][written..]).await.unwrap();

    assert_eq!(server.read_data(100_000).await, vec![7; 100_000]);
    assert_eq!(session.state(), TransportState::Established);
    assert_eq!(channel.state().unwrap(), ChannelState::Open);
}

#[tokio::test]
async fn test_rekey_mid_transfer_preserves_data() {
    let (session, mut server) = authenticated_pair().await;
    let session_id = session.session_id();

    let (channel, _) = tokio::join!(
        session.open_channel(ChannelType::Session),
        server.accept_channel(1 << 20, 32768)
    );
    let channel = channel.unwrap();

    let chunks: Vec<Vec<u8>> = (0..64u8).map(|i| vec![i; 1024]).collect();
    let expected: Vec<u8> = chunks.concat();

    let client = async {
        for (i, chunk) in chunks.iter().enumerate() {
            if i == 16 {
                session.request_rekey().unwrap();
            }
            channel.write_all(chunk).await.unwrap();
        }
    };
    let server_side = async {
        let mut received = Vec::new();
        let mut rekeyed = false;
        while received.len() < expected.len() {
            let payload = server.recv().await;
            match payload[0] {
                20 => {
                    server.kex_with(payload).await;
                    rekeyed = true;
                }
                94 => received.extend(ChannelData::from_bytes(&payload).unwrap().data),
                _ => {}
            }
        }
        (received, rekeyed)
    };
    let (_, (received, rekeyed)) = tokio::join!(client, server_side);

    assert!(rekeyed);
    assert_eq!(received, expected);
    wait_for_state(&session, TransportState::Established).await;
    assert_eq!(session.session_id(), session_id);
}

#[tokio::test]
async fn test_connect_times_out_against_silent_server() {
    let (_listener, addr) = listen().await;
    let config = common::client_config().with_connect_timeout(Duration::from_secs(2));
    let mut session = Session::new(config).unwrap();

    let started = Instant::now();
    let result = session.connect(&addr).await;

    assert!(matches!(result, Err(SkiffError::Timeout(_))));
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(session.state(), TransportState::Closed);
}

#[tokio::test]
async fn test_key_exchange_times_out() {
    let (listener, addr) = listen().await;
    let config = common::client_config().with_kex_timeout(Duration::from_millis(300));
    let mut session = Session::new(config).unwrap();

    let server = async {
        // Identification only, then silence.
        let server = ScriptedServer::accept(&listener).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        server
    };
    let (result, _server) = tokio::join!(session.connect(&addr), server);

    assert!(matches!(result, Err(SkiffError::Timeout(_))));
    assert_eq!(session.state(), TransportState::Closed);
}

#[tokio::test]
async fn test_protocol_mismatch_on_old_server() {
    use tokio::io::AsyncWriteExt;

    let (listener, addr) = listen().await;
    let mut session = Session::new(common::client_config()).unwrap();

    let server = async {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(b"SSH-1.5-ancient\r\n").await.unwrap();
        stream
    };
    let (result, _stream) = tokio::join!(session.connect(&addr), server);

    assert!(matches!(result, Err(SkiffError::ProtocolMismatch(_))));
    assert_eq!(session.state(), TransportState::Closed);
}

#[tokio::test]
async fn test_bad_host_key_signature_fails_key_exchange() {
    let (listener, addr) = listen().await;
    let mut session = Session::new(common::client_config()).unwrap();

    let server = async {
        let mut server = ScriptedServer::accept(&listener).await;
        server.sign_garbage = true;
        let kexinit = server.expect(20).await;
        server.kex_reply(kexinit).await;
        server
    };
    let (result, _server) = tokio::join!(session.connect(&addr), server);

    assert!(matches!(result, Err(SkiffError::KeyExchangeFailed(_))));
    assert_eq!(session.state(), TransportState::Closed);
}

#[tokio::test]
async fn test_untrusted_host_key_fails_key_exchange() {
    let (listener, addr) = listen().await;
    let mut session = Session::new(common::client_config()).unwrap();

    let server = async {
        let mut server = ScriptedServer::accept(&listener).await;
        server.set_host_key(Ed25519Keypair::from_bytes(&[3u8; 32]).unwrap());
        let kexinit = server.expect(20).await;
        server.kex_reply(kexinit).await;
        server
    };
    let (result, _server) = tokio::join!(session.connect(&addr), server);

    assert!(matches!(result, Err(SkiffError::KeyExchangeFailed(_))));
}

#[tokio::test]
async fn test_exec_reads_output_and_exit_status() {
    let (session, mut server) = authenticated_pair().await;

    let (channel, client_id) = tokio::join!(
        session.open_channel(ChannelType::Session),
        server.accept_channel(1 << 20, 32768)
    );
    let channel = channel.unwrap();

    let (exec, request) = tokio::join!(channel.exec("echo hi"), server.accept_request());
    exec.unwrap();
    assert_eq!(
        request,
        ChannelRequestType::Exec {
            command: "echo hi".to_string()
        }
    );

    server.send_data(client_id, b"hi\n").await;
    server.send_exit_status(client_id, 0).await;
    server.send_eof(client_id).await;
    server.send_close(client_id).await;

    assert_eq!(channel.read_to_end().await.unwrap(), b"hi\n");
    assert_eq!(channel.exit_status().await.unwrap(), Some(0));
    assert_eq!(channel.state().unwrap(), ChannelState::Closed);
}

#[tokio::test]
async fn test_channel_close_is_local_to_that_channel() {
    let (session, mut server) = authenticated_pair().await;

    let (first, first_id) = tokio::join!(
        session.open_channel(ChannelType::Session),
        server.accept_channel(1 << 20, 32768)
    );
    let (second, _) = tokio::join!(
        session.open_channel(ChannelType::Session),
        server.accept_channel(1 << 20, 32768)
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    server.send_close(first_id).await;
    let closed = timeout(STEP, first.read()).await.unwrap().unwrap();
    assert!(closed.is_empty());
    assert!(matches!(first.write(b"x").await, Err(SkiffError::ChannelClosed(_))));

    second.write_all(b"still alive").await.unwrap();
    assert_eq!(server.read_data(11).await, b"still alive");
    assert_eq!(session.state(), TransportState::Established);
}

#[tokio::test]
async fn test_concurrent_channel_writes_do_not_interleave() {
    let (session, mut server) = authenticated_pair().await;

    let mut channels = Vec::new();
    for _ in 0..3 {
        let (channel, _) = tokio::join!(
            session.open_channel(ChannelType::Session),
            server.accept_channel(1 << 20, 4096)
        );
        channels.push(channel.unwrap());
    }

    let payloads: Vec<Vec<u8>> = (0..3u8)
        .map(|n| (0..100_000u32).map(|i| (i as u8) ^ (n * 85)).collect())
        .collect();

    let mut writers = Vec::new();
    for (channel, payload) in channels.iter().zip(&payloads) {
        let channel = channel.clone();
        let payload = payload.clone();
        writers.push(tokio::spawn(async move { channel.write_all(&payload).await }));
    }

    let mut received: HashMap<u32, Vec<u8>> = HashMap::new();
    let total: usize = payloads.iter().map(Vec::len).sum();
    let mut seen = 0;
    while seen < total {
        let msg = ChannelData::from_bytes(&server.expect(94).await).unwrap();
        assert!(msg.data.len() <= 4096);
        seen += msg.data.len();
        received.entry(msg.recipient_channel).or_default().extend(msg.data);
    }
    for writer in writers {
        writer.await.unwrap().unwrap();
    }

    for (i, payload) in payloads.iter().enumerate() {
        assert_eq!(&received[&(100 + i as u32)], payload);
    }
}

#[tokio::test]
async fn test_disconnect_fails_pending_reads() {
    let (mut session, mut server) = authenticated_pair().await;

    let (channel, _) = tokio::join!(
        session.open_channel(ChannelType::Session),
        server.accept_channel(1 << 20, 32768)
    );
    let channel = channel.unwrap();
    let reader = tokio::spawn(async move { channel.read().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    session.disconnect().await.unwrap();
    let goodbye = Disconnect::from_bytes(&server.expect(1).await).unwrap();
    assert_eq!(goodbye.reason_code, DisconnectReason::ByApplication as u32);

    let result = timeout(STEP, reader).await.unwrap().unwrap();
    assert!(matches!(result, Err(SkiffError::TransportClosed(_))));
    assert_eq!(session.state(), TransportState::Closed);

    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_releases_stream_blocked_on_silent_peer() {
    let (listener, addr) = listen().await;
    let mut session = Session::new(common::client_config()).unwrap();
    let (stream, alive) = TrackedStream::connect(&addr).await;

    let server = async {
        let mut server = ScriptedServer::accept(&listener).await;
        server.kex().await;
        server
    };
    let (connected, mut server) = tokio::join!(session.connect_stream(stream), server);
    connected.unwrap();

    let script = AuthScript::password_only("secret");
    let (outcome, _) = tokio::join!(
        session.authenticate(Credentials::new("alice").with_password("secret")),
        server.serve_auth(&script)
    );
    outcome.unwrap();
    let (channel, _) = tokio::join!(
        session.open_channel(ChannelType::Session),
        server.accept_channel(u32::MAX, 32768)
    );
    let channel = channel.unwrap();

    // The server reads nothing more, so the writer blocks once the socket buffers fill.
    let bulk = tokio::spawn(async move { channel.write_all(&vec![0x5A; 64 << 20]).await });
    tokio::time::sleep(Duration::from_millis(300)).await;

    timeout(STEP, session.disconnect()).await.unwrap().unwrap();
    assert_eq!(session.state(), TransportState::Closed);
    assert_eq!(Arc::strong_count(&alive), 1);

    let _ = timeout(STEP, bulk).await.unwrap();
    drop(server);
}

#[tokio::test]
async fn test_peer_disconnect_reaches_pending_operations() {
    let (session, mut server) = authenticated_pair().await;

    let (channel, _) = tokio::join!(
        session.open_channel(ChannelType::Session),
        server.accept_channel(1 << 20, 32768)
    );
    let channel = channel.unwrap();
    let reader = tokio::spawn(async move { channel.read().await });

    server
        .send(Disconnect::new(DisconnectReason::ByApplication, "maintenance").to_bytes())
        .await;

    match timeout(STEP, reader).await.unwrap().unwrap() {
        Err(SkiffError::TransportClosed(msg)) => assert!(msg.contains("maintenance")),
        other => panic!("expected TransportClosed, got {:?}", other),
    }
    assert_eq!(session.state(), TransportState::Closed);
}

#[tokio::test]
async fn test_keepalive_sends_ignore_messages() {
    let (listener, addr) = listen().await;
    let config = common::client_config().with_keepalive_interval(Duration::from_millis(50));
    let mut session = Session::new(config).unwrap();

    let server = async {
        let mut server = ScriptedServer::accept(&listener).await;
        server.kex().await;
        server
    };
    let (connected, mut server) = tokio::join!(session.connect(&addr), server);
    connected.unwrap();

    let script = AuthScript::password_only("secret");
    let (outcome, _) = tokio::join!(
        session.authenticate(Credentials::new("alice").with_password("secret")),
        server.serve_auth(&script)
    );
    outcome.unwrap();

    let heartbeat = timeout(STEP, server.recv_raw()).await.unwrap();
    assert_eq!(heartbeat[0], 2);
}
