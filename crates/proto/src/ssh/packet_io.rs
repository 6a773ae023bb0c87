//! Reading and writing binary packets on a byte stream.
//!
//! Each direction owns its own cipher state and sequence counter, so the
//! read half and the write half can run on separate tasks.

use skiff_platform::{SkiffError, SkiffResult};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::ssh::crypto::{OpeningState, SealingState};
use crate::ssh::transport::SequenceCounter;
use crate::ssh::version::{Version, MAX_PRE_BANNER_LINES, MAX_VERSION_LENGTH};

/// One packet as read from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    /// Sequence number the packet was received under
    pub sequence: u32,
    /// Decrypted payload, never empty
    pub payload: Vec<u8>,
    /// Bytes the packet occupied on the wire
    pub wire_len: usize,
}

fn closed_on_eof(err: std::io::Error) -> SkiffError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        SkiffError::TransportClosed("Connection closed by peer".to_string())
    } else {
        SkiffError::Io(err)
    }
}

/// Read half of a transport.
pub struct PacketReader<R> {
    reader: BufReader<R>,
    opening: OpeningState,
    sequence: SequenceCounter,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    /// Wraps the read half of a stream. No keys are in force yet.
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            opening: OpeningState::plain(),
            sequence: SequenceCounter::new(),
        }
    }

    /// Reads the server identification line.
    ///
    /// Up to 32 other lines may precede it. Returns the parsed version and
    /// the raw line without CR LF, which the exchange hash needs.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::ProtocolMismatch`] for an unusable banner and
    /// [`SkiffError::TransportClosed`] if the stream ends first.
    pub async fn read_banner(&mut self) -> SkiffResult<(Version, String)> {
        for _ in 0..=MAX_PRE_BANNER_LINES {
            let mut line = Vec::with_capacity(64);
            let read = (&mut self.reader)
                .take(MAX_VERSION_LENGTH as u64 + 2)
                .read_until(b'\n', &mut line)
                .await?;

            if read == 0 {
                return Err(SkiffError::TransportClosed(
                    "Connection closed before server identification".to_string(),
                ));
            }
            if line.last() != Some(&b'\n') {
                return Err(SkiffError::ProtocolMismatch(format!(
                    "Identification line exceeds {} bytes",
                    MAX_VERSION_LENGTH
                )));
            }

            let text = String::from_utf8(line).map_err(|_| {
                SkiffError::ProtocolMismatch("Identification is not UTF-8".to_string())
            })?;
            let text = text.trim_end_matches('\n').trim_end_matches('\r');

            if text.starts_with("SSH-") {
                let version = Version::parse(text)?;
                return Ok((version, text.to_string()));
            }
            tracing::debug!(line = text, "Skipping pre-identification line");
        }

        Err(SkiffError::ProtocolMismatch(format!(
            "No identification within {} lines",
            MAX_PRE_BANNER_LINES
        )))
    }

    /// Reads, decrypts and verifies the next packet.
    ///
    /// # Errors
    ///
    /// Any error leaves the stream unusable.
    pub async fn read_packet(&mut self) -> SkiffResult<Incoming> {
        let first_len = self.opening.first_block_len();
        let mut packet = vec![0u8; first_len];
        self.reader.read_exact(&mut packet).await.map_err(closed_on_eof)?;

        let remaining = self.opening.begin(&mut packet)?;
        packet.resize(first_len + remaining, 0);
        self.reader
            .read_exact(&mut packet[first_len..])
            .await
            .map_err(closed_on_eof)?;

        let wire_len = packet.len();
        let sequence = self.sequence.advance()?;
        let payload = self.opening.finish(packet, sequence)?;
        if payload.is_empty() {
            return Err(SkiffError::MalformedPacket("Empty payload".to_string()));
        }

        Ok(Incoming {
            sequence,
            payload,
            wire_len,
        })
    }

    /// Switches to keys from a completed exchange.
    pub fn install(&mut self, opening: OpeningState) {
        self.opening = opening;
    }

    /// Sequence number of the next packet to be read.
    pub fn next_sequence(&self) -> u32 {
        self.sequence.peek()
    }
}

/// Write half of a transport.
pub struct PacketWriter<W> {
    writer: W,
    sealing: SealingState,
    sequence: SequenceCounter,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    /// Wraps the write half of a stream. No keys are in force yet.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            sealing: SealingState::plain(),
            sequence: SequenceCounter::new(),
        }
    }

    /// Sends our identification line.
    pub async fn write_banner(&mut self, version: &Version) -> SkiffResult<()> {
        self.writer.write_all(&version.to_wire_format()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Frames, protects and sends one payload. Returns the bytes written.
    pub async fn write_packet(&mut self, payload: Vec<u8>) -> SkiffResult<usize> {
        let sequence = self.sequence.advance()?;
        let wire = self.sealing.seal(payload, sequence)?;
        self.writer.write_all(&wire).await?;
        self.writer.flush().await?;
        Ok(wire.len())
    }

    /// Switches to keys from a completed exchange.
    pub fn install(&mut self, sealing: SealingState) {
        self.sealing = sealing;
    }

    /// Drops the keys and shuts the stream down.
    pub async fn shutdown(&mut self) -> SkiffResult<()> {
        self.sealing = SealingState::plain();
        self.writer.shutdown().await?;
        Ok(())
    }

    /// Sequence number of the next packet to be written.
    pub fn next_sequence(&self) -> u32 {
        self.sequence.peek()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::crypto::{CipherAlgorithm, KeyMaterial};

    fn keys() -> KeyMaterial {
        KeyMaterial {
            iv: vec![3u8; 12],
            encryption_key: vec![4u8; 32],
            integrity_key: vec![],
        }
    }

    #[tokio::test]
    async fn test_banner_after_preamble() {
        let input: &[u8] = b"hello\r\nwelcome to the box\r\nSSH-2.0-OpenSSH_9.6 Ubuntu\r\n";
        let mut reader = PacketReader::new(input);

        let (version, raw) = reader.read_banner().await.unwrap();
        assert_eq!(version.software(), "OpenSSH_9.6");
        assert_eq!(raw, "SSH-2.0-OpenSSH_9.6 Ubuntu");
    }

    #[tokio::test]
    async fn test_banner_rejects_ssh1() {
        let mut reader = PacketReader::new(&b"SSH-1.5-old\r\n"[..]);
        assert!(matches!(
            reader.read_banner().await,
            Err(SkiffError::ProtocolMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_banner_too_many_lines() {
        let input = "noise\r\n".repeat(MAX_PRE_BANNER_LINES + 1) + "SSH-2.0-late\r\n";
        let mut reader = PacketReader::new(input.as_bytes());
        assert!(matches!(
            reader.read_banner().await,
            Err(SkiffError::ProtocolMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_banner_overlong_line() {
        let input = format!("SSH-2.0-{}\r\n", "x".repeat(400));
        let mut reader = PacketReader::new(input.as_bytes());
        assert!(matches!(
            reader.read_banner().await,
            Err(SkiffError::ProtocolMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_banner_eof() {
        let mut reader = PacketReader::new(&b"partial"[..]);
        assert!(reader.read_banner().await.is_err());

        let mut reader = PacketReader::new(&b""[..]);
        assert!(matches!(
            reader.read_banner().await,
            Err(SkiffError::TransportClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_plain_packets_round_trip() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = PacketWriter::new(client);
        let mut reader = PacketReader::new(server);

        writer.write_packet(vec![2, 0, 0, 0, 0]).await.unwrap();
        writer.write_packet(vec![94, 1, 2, 3]).await.unwrap();

        let first = reader.read_packet().await.unwrap();
        let second = reader.read_packet().await.unwrap();
        assert_eq!(first.payload, vec![2, 0, 0, 0, 0]);
        assert_eq!((first.sequence, second.sequence), (0, 1));
        assert_eq!(second.payload, vec![94, 1, 2, 3]);
        assert_eq!(writer.next_sequence(), reader.next_sequence());
    }

    #[tokio::test]
    async fn test_encrypted_packets_after_install() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = PacketWriter::new(client);
        let mut reader = PacketReader::new(server);

        writer.write_packet(vec![21]).await.unwrap();
        assert_eq!(reader.read_packet().await.unwrap().payload, vec![21]);

        writer.install(SealingState::new(CipherAlgorithm::Aes256Gcm, None, &keys()).unwrap());
        reader.install(OpeningState::new(CipherAlgorithm::Aes256Gcm, None, &keys()).unwrap());

        writer.write_packet(b"^secret payload".to_vec()).await.unwrap();
        let incoming = reader.read_packet().await.unwrap();
        assert_eq!(incoming.payload, b"^secret payload".to_vec());
        assert_eq!(incoming.sequence, 1);
    }

    #[tokio::test]
    async fn test_eof_mid_packet_closes() {
        let mut reader = PacketReader::new(&[0u8, 0, 0, 12, 4][..]);
        assert!(matches!(
            reader.read_packet().await,
            Err(SkiffError::TransportClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_length_is_malformed() {
        let mut reader = PacketReader::new(&[0xffu8, 0xff, 0xff, 0xff, 0, 0, 0, 0][..]);
        assert!(matches!(
            reader.read_packet().await,
            Err(SkiffError::MalformedPacket(_))
        ));
    }
}
