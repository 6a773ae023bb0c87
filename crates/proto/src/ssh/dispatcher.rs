//! SSH message dispatcher.
//!
//! Owns the read half of the transport. Every packet is routed by message
//! number: transport and key exchange messages are handled here,
//! authentication replies are forwarded to the session, and connection
//! protocol messages go to the channel table.

use std::sync::Arc;

use skiff_platform::{SkiffError, SkiffResult};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::ssh::connection::{request_failure, GlobalRequest};
use crate::ssh::connection_mgr::Connection;
use crate::ssh::logging::{log_packet, log_peer_disconnect, log_unexpected_message};
use crate::ssh::message::{unimplemented_message, DebugMessage, Disconnect, MessageType};
use crate::ssh::packet_io::{Incoming, PacketReader};
use crate::ssh::transport::{TransportEvent, TransportState};

/// Reads and routes packets until the transport closes.
///
/// Any error closes the transport with that error as the reason.
pub(crate) async fn run_dispatcher<R>(
    conn: Arc<Connection>,
    mut reader: PacketReader<R>,
    auth_tx: mpsc::UnboundedSender<Vec<u8>>,
) where
    R: AsyncRead + Unpin,
{
    let mut state = conn.subscribe();
    debug!(peer = conn.peer(), "Message dispatcher started");

    loop {
        let incoming = tokio::select! {
            biased;
            _ = state.wait_for(|s| *s == TransportState::Closed) => break,
            incoming = reader.read_packet() => incoming,
        };

        let result = match incoming {
            Ok(incoming) => route(&conn, &mut reader, &auth_tx, incoming),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            conn.close(&e);
            break;
        }
    }

    debug!(peer = conn.peer(), "Message dispatcher stopped");
}

fn before_keys(conn: &Connection, msg_type: u8) -> SkiffResult<()> {
    if conn.state() == TransportState::KeyExchange {
        return Err(SkiffError::Protocol(format!(
            "Message {} received before the first key exchange completed",
            msg_type
        )));
    }
    Ok(())
}

fn route<R: AsyncRead + Unpin>(
    conn: &Connection,
    reader: &mut PacketReader<R>,
    auth_tx: &mpsc::UnboundedSender<Vec<u8>>,
    incoming: Incoming,
) -> SkiffResult<()> {
    let Incoming {
        sequence,
        payload,
        wire_len,
    } = incoming;
    let msg_type = payload[0];
    conn.add_received(wire_len);
    log_packet("recv", msg_type, sequence, wire_len);

    match msg_type {
        1 => {
            let msg = Disconnect::from_bytes(&payload)?;
            log_peer_disconnect(conn.peer(), msg.reason_code, &msg.description);
            conn.close_with(
                TransportEvent::Disconnect,
                &SkiffError::TransportClosed(format!(
                    "Peer disconnected (code {}): {}",
                    msg.reason_code, msg.description
                )),
            );
        }
        2 => trace!("Ignore message"),
        3 => log_unexpected_message(msg_type, "peer reported an unimplemented message"),
        4 => {
            let msg = DebugMessage::from_bytes(&payload)?;
            debug!(
                always_display = msg.always_display,
                message = %msg.message,
                "Peer debug message"
            );
        }
        20 => {
            conn.apply(TransportEvent::PeerKexInit)?;
            let outputs = conn.handshake().handle_kexinit(&payload)?;
            conn.queue_kex(outputs);
        }
        30..=49 => {
            let outputs = conn.handshake().handle_reply(&payload)?;
            conn.queue_kex(outputs);
        }
        21 => {
            let (opening, summary) = conn.handshake().handle_newkeys()?;
            reader.install(opening);
            conn.kex_completed(&summary)?;
        }
        5 | 6 | 50..=79 => {
            before_keys(conn, msg_type)?;
            if auth_tx.send(payload).is_err() {
                log_unexpected_message(msg_type, "authentication already finished");
            }
        }
        80 => {
            let request = GlobalRequest::from_bytes(&payload)?;
            debug!(name = %request.name, "Refusing global request");
            if request.want_reply {
                conn.send(request_failure())?;
            }
        }
        81 | 82 => log_unexpected_message(msg_type, "global request reply"),
        90..=100 => {
            before_keys(conn, msg_type)?;
            let mut channels = conn.channels();
            for reply in channels.handle(&payload)? {
                conn.send(reply)?;
            }
        }
        _ => {
            let name = MessageType::from_u8(msg_type).map_or("unknown", |t| t.name());
            log_unexpected_message(msg_type, name);
            conn.send(unimplemented_message(sequence))?;
        }
    }

    Ok(())
}
