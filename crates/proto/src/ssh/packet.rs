//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac (present once a MAC is negotiated)
//! ```
//!
//! # Constraints
//!
//! - `packet_length` does not include the `mac` or the length field itself
//! - `padding_length` is at least 4 bytes
//! - The padded length is a multiple of the cipher block size (minimum 8).
//!   For AEAD modes (RFC 5647) the length field sits in the associated data
//!   and is left out of the alignment computation.
//! - `packet_length` never exceeds 35000 bytes
//!
//! [`PacketCodec`] is a pure transformation between [`Packet`] and plaintext
//! wire bytes. Encryption and MAC computation live in
//! [`crypto`](crate::ssh::crypto), which feeds this codec.
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::packet::PacketCodec;
//!
//! let codec = PacketCodec::plain();
//! let packet = codec.frame(b"SSH-MSG-KEXINIT payload".to_vec()).unwrap();
//!
//! let bytes = codec.encode(&packet);
//! let (parsed, consumed) = codec.decode(&bytes).unwrap();
//!
//! assert_eq!(parsed, packet);
//! assert_eq!(consumed, bytes.len());
//! ```

use bytes::{BufMut, BytesMut};
use rand::RngCore;
use skiff_platform::{SkiffError, SkiffResult};

/// Maximum `packet_length` in bytes (RFC 4253 Section 6.1).
pub const MAX_PACKET_SIZE: usize = 35000;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: usize = 4;

/// Maximum padding length in bytes (fits in u8).
pub const MAX_PADDING_LEN: usize = 255;

/// Smallest block size used for alignment, even for stream ciphers.
pub const MIN_BLOCK_SIZE: usize = 8;

/// Length of the `packet_length` field.
pub const LENGTH_FIELD_LEN: usize = 4;

/// Largest payload that still fits in a packet with maximum padding overhead.
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - 1 - MIN_PADDING_LEN - 32;

/// SSH binary packet.
///
/// # Invariants
///
/// - Padding length is between 4 and 255 bytes
/// - `1 + payload + padding` never exceeds [`MAX_PACKET_SIZE`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    payload: Vec<u8>,
    padding: Vec<u8>,
    mac: Option<Vec<u8>>,
}

impl Packet {
    /// Creates a packet from its parts.
    ///
    /// No alignment check happens here; [`PacketCodec::frame`] builds
    /// correctly padded packets.
    pub fn from_parts(payload: Vec<u8>, padding: Vec<u8>, mac: Option<Vec<u8>>) -> Self {
        Self {
            payload,
            padding,
            mac,
        }
    }

    /// Returns the payload of this packet.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consumes the packet and returns its payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Returns the padding of this packet.
    pub fn padding(&self) -> &[u8] {
        &self.padding
    }

    /// Returns the MAC of this packet (if present).
    pub fn mac(&self) -> Option<&[u8]> {
        self.mac.as_deref()
    }

    /// Sets the MAC for this packet.
    pub fn set_mac(&mut self, mac: Vec<u8>) {
        self.mac = Some(mac);
    }

    /// Returns the value of the `packet_length` field.
    pub fn packet_length(&self) -> usize {
        1 + self.payload.len() + self.padding.len()
    }
}

/// Framing parameters of one direction of the transport.
///
/// Changes whenever new keys are installed: the block size follows the
/// cipher, `mac_len` follows the MAC (or AEAD tag), and `length_in_aad`
/// selects RFC 5647 alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketCodec {
    block_size: usize,
    mac_len: usize,
    length_in_aad: bool,
}

impl PacketCodec {
    /// Codec used before the first NEWKEYS: 8-byte alignment, no MAC.
    pub const fn plain() -> Self {
        Self {
            block_size: MIN_BLOCK_SIZE,
            mac_len: 0,
            length_in_aad: false,
        }
    }

    /// Creates a codec for a cipher block size and MAC length.
    ///
    /// Block sizes below 8 are raised to 8 (RFC 4253 Section 6).
    pub fn new(block_size: usize, mac_len: usize) -> Self {
        Self {
            block_size: block_size.max(MIN_BLOCK_SIZE),
            mac_len,
            length_in_aad: false,
        }
    }

    /// Creates a codec for an AEAD cipher whose length field is associated
    /// data rather than ciphertext.
    pub fn aead(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(MIN_BLOCK_SIZE),
            mac_len: 0,
            length_in_aad: true,
        }
    }

    /// Returns the alignment block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns the number of MAC bytes following each packet.
    pub fn mac_len(&self) -> usize {
        self.mac_len
    }

    /// Returns true if the length field is excluded from alignment.
    pub fn length_in_aad(&self) -> bool {
        self.length_in_aad
    }

    fn aligned_prefix(&self) -> usize {
        if self.length_in_aad {
            0
        } else {
            LENGTH_FIELD_LEN
        }
    }

    /// Computes the padding length for a payload.
    ///
    /// The result is the smallest value of at least 4 that aligns the packet
    /// to the block size.
    pub fn padding_len(&self, payload_len: usize) -> usize {
        let unpadded = self.aligned_prefix() + 1 + payload_len + MIN_PADDING_LEN;
        let remainder = unpadded % self.block_size;
        if remainder == 0 {
            MIN_PADDING_LEN
        } else {
            MIN_PADDING_LEN + self.block_size - remainder
        }
    }

    /// Wraps a payload in a packet with random padding for this codec.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::MalformedPacket`] if the payload is empty or too
    /// large to fit within [`MAX_PACKET_SIZE`].
    pub fn frame(&self, payload: Vec<u8>) -> SkiffResult<Packet> {
        if payload.is_empty() {
            return Err(SkiffError::MalformedPacket(
                "Packet payload must carry a message number".to_string(),
            ));
        }
        let padding_len = self.padding_len(payload.len());
        let packet_length = 1 + payload.len() + padding_len;

        if packet_length > MAX_PACKET_SIZE {
            return Err(SkiffError::MalformedPacket(format!(
                "Packet too large: {} bytes (maximum {})",
                packet_length, MAX_PACKET_SIZE
            )));
        }

        let mut padding = vec![0u8; padding_len];
        rand::thread_rng().fill_bytes(&mut padding);

        Ok(Packet {
            payload,
            padding,
            mac: None,
        })
    }

    /// Serializes a packet to wire format, appending its MAC if present.
    ///
    /// # Example
    ///
    /// ```rust
    /// use skiff_proto::ssh::packet::PacketCodec;
    ///
    /// let codec = PacketCodec::plain();
    /// let bytes = codec.encode(&codec.frame(b"test".to_vec()).unwrap());
    /// assert_eq!(bytes.len() % 8, 0);
    /// ```
    pub fn encode(&self, packet: &Packet) -> Vec<u8> {
        let packet_length = packet.packet_length();
        let mac_len = packet.mac.as_ref().map_or(0, Vec::len);
        let mut buf = BytesMut::with_capacity(LENGTH_FIELD_LEN + packet_length + mac_len);

        buf.put_u32(packet_length as u32);
        buf.put_u8(packet.padding.len() as u8);
        buf.put_slice(&packet.payload);
        buf.put_slice(&packet.padding);

        if let Some(mac) = &packet.mac {
            buf.put_slice(mac);
        }

        buf.to_vec()
    }

    /// Reads and validates the `packet_length` field at the start of `data`.
    ///
    /// Used by the stream reader to learn how many more bytes to read before
    /// the whole packet is available.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::MalformedPacket`] if fewer than four bytes are
    /// given, the length exceeds [`MAX_PACKET_SIZE`], or it is not aligned to
    /// the block size.
    pub fn peek_length(&self, data: &[u8]) -> SkiffResult<usize> {
        let header: [u8; LENGTH_FIELD_LEN] = data
            .get(..LENGTH_FIELD_LEN)
            .and_then(|h| h.try_into().ok())
            .ok_or_else(|| {
                SkiffError::MalformedPacket(format!(
                    "Packet too short: {} bytes (minimum {})",
                    data.len(),
                    LENGTH_FIELD_LEN
                ))
            })?;
        let packet_length = u32::from_be_bytes(header) as usize;

        if packet_length > MAX_PACKET_SIZE {
            return Err(SkiffError::MalformedPacket(format!(
                "Packet too large: {} bytes (maximum {})",
                packet_length, MAX_PACKET_SIZE
            )));
        }

        if packet_length < 1 + MIN_PADDING_LEN + 1 {
            return Err(SkiffError::MalformedPacket(format!(
                "Packet too small: {} bytes",
                packet_length
            )));
        }

        if (self.aligned_prefix() + packet_length) % self.block_size != 0 {
            return Err(SkiffError::MalformedPacket(format!(
                "Packet length {} is not aligned to block size {}",
                packet_length, self.block_size
            )));
        }

        Ok(packet_length)
    }

    /// Parses one packet from the front of `data`.
    ///
    /// Returns the packet and the number of bytes it occupied, including
    /// the MAC. Bytes after that are left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::MalformedPacket`] if:
    /// - the length field is invalid (see [`peek_length`](Self::peek_length))
    /// - the declared length plus MAC exceeds the buffer
    /// - the padding is shorter than 4 bytes or leaves no room for a payload
    pub fn decode(&self, data: &[u8]) -> SkiffResult<(Packet, usize)> {
        let packet_length = self.peek_length(data)?;
        let consumed = LENGTH_FIELD_LEN + packet_length + self.mac_len;

        if data.len() < consumed {
            return Err(SkiffError::MalformedPacket(format!(
                "Length field exceeds buffer: need {} bytes, have {}",
                consumed,
                data.len()
            )));
        }

        let body = &data[LENGTH_FIELD_LEN..LENGTH_FIELD_LEN + packet_length];
        let padding_length = body[0] as usize;

        if padding_length < MIN_PADDING_LEN {
            return Err(SkiffError::MalformedPacket(format!(
                "Padding too short: {} bytes (minimum {})",
                padding_length, MIN_PADDING_LEN
            )));
        }

        if padding_length + 1 >= packet_length {
            return Err(SkiffError::MalformedPacket(format!(
                "Padding length {} leaves no payload in packet of {} bytes",
                padding_length, packet_length
            )));
        }

        let payload_end = packet_length - padding_length;
        let payload = body[1..payload_end].to_vec();
        let padding = body[payload_end..].to_vec();

        let mac = if self.mac_len > 0 {
            let start = LENGTH_FIELD_LEN + packet_length;
            Some(data[start..consumed].to_vec())
        } else {
            None
        };

        Ok((
            Packet {
                payload,
                padding,
                mac,
            },
            consumed,
        ))
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::plain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_alignment() {
        let codec = PacketCodec::plain();
        for len in 1..64 {
            let packet = codec.frame(vec![0xAB; len]).unwrap();
            let bytes = codec.encode(&packet);
            assert_eq!(bytes.len() % 8, 0, "payload length {}", len);
            assert!(packet.padding().len() >= MIN_PADDING_LEN);
        }
    }

    #[test]
    fn test_frame_rejects_empty_payload() {
        for codec in [PacketCodec::plain(), PacketCodec::new(16, 32), PacketCodec::aead(16)] {
            assert!(matches!(
                codec.frame(Vec::new()),
                Err(SkiffError::MalformedPacket(_))
            ));
        }
    }

    #[test]
    fn test_frame_aead_alignment_excludes_length() {
        let codec = PacketCodec::aead(16);
        for len in 1..64 {
            let packet = codec.frame(vec![1; len]).unwrap();
            assert_eq!(packet.packet_length() % 16, 0);
        }
    }

    #[test]
    fn test_round_trip_with_mac() {
        let codec = PacketCodec::new(16, 32);
        let mut packet = codec.frame(b"hello".to_vec()).unwrap();
        packet.set_mac(vec![0x5A; 32]);

        let mut bytes = codec.encode(&packet);
        bytes.extend_from_slice(b"next packet");

        let (parsed, consumed) = codec.decode(&bytes).unwrap();
        assert_eq!(parsed, packet);
        assert_eq!(consumed, bytes.len() - b"next packet".len());
        assert_eq!(parsed.mac(), Some(&[0x5A; 32][..]));
    }

    #[test]
    fn test_decode_too_short() {
        let result = PacketCodec::plain().decode(&[0, 0, 0]);
        assert!(matches!(result, Err(SkiffError::MalformedPacket(_))));
    }

    #[test]
    fn test_decode_length_exceeds_buffer() {
        let codec = PacketCodec::plain();
        let bytes = codec.encode(&codec.frame(b"data".to_vec()).unwrap());
        let result = codec.decode(&bytes[..bytes.len() - 1]);
        assert!(matches!(result, Err(SkiffError::MalformedPacket(_))));
    }

    #[test]
    fn test_decode_missing_mac() {
        let codec = PacketCodec::new(8, 32);
        let bytes = codec.encode(&codec.frame(b"data".to_vec()).unwrap());
        assert!(matches!(
            codec.decode(&bytes),
            Err(SkiffError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_decode_too_large() {
        let data = [0x00, 0x01, 0x00, 0x00, 4, 0, 0, 0, 0];
        let result = PacketCodec::plain().decode(&data);
        assert!(matches!(result, Err(SkiffError::MalformedPacket(_))));
    }

    #[test]
    fn test_decode_misaligned() {
        // packet_length 13 + 4 is not a multiple of 8
        let mut data = vec![0, 0, 0, 13, 4];
        data.extend_from_slice(&[0u8; 12]);
        let result = PacketCodec::plain().decode(&data);
        match result {
            Err(SkiffError::MalformedPacket(msg)) => assert!(msg.contains("block size")),
            other => panic!("expected MalformedPacket, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_short_padding() {
        // packet_length 12, padding_length 3
        let mut data = vec![0, 0, 0, 12, 3];
        data.extend_from_slice(&[0u8; 11]);
        assert!(matches!(
            PacketCodec::plain().decode(&data),
            Err(SkiffError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_decode_padding_consumes_payload() {
        // packet_length 12, padding_length 11: no room for a message byte
        let mut data = vec![0, 0, 0, 12, 11];
        data.extend_from_slice(&[0u8; 11]);
        assert!(matches!(
            PacketCodec::plain().decode(&data),
            Err(SkiffError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_frame_rejects_oversized_payload() {
        let codec = PacketCodec::plain();
        assert!(codec.frame(vec![0; MAX_PACKET_SIZE]).is_err());
        assert!(codec.frame(vec![0; MAX_PAYLOAD_SIZE]).is_ok());
    }

    #[test]
    fn test_block_size_floor() {
        assert_eq!(PacketCodec::new(1, 0).block_size(), 8);
        assert_eq!(PacketCodec::aead(16).block_size(), 16);
    }
}
