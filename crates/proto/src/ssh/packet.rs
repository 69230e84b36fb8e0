//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac (MAC = Message Authentication Code)
//! ```
//!
//! # Constraints
//!
//! - `packet_length`: Does NOT include `mac` or `packet_length` field itself
//! - `padding_length`: Length of padding (minimum 4, maximum 255 bytes)
//! - Total `packet_length` + 4 MUST be a multiple of the cipher block size
//!   (8 before keys are installed); AEAD ciphers align `packet_length` alone
//! - Outbound packets stay below 35000 bytes; inbound packets up to 256 KiB
//!   are accepted
//!
//! # Codec
//!
//! [`PacketCodec`] holds both directions' sequence numbers, ciphers, MACs
//! and compressors. Decoding is resumable: until a whole packet (MAC
//! included) is buffered, [`PacketCodec::decode`] returns
//! [`Decoded::NeedMoreData`] and leaves the input buffer untouched.
//! Sequence numbers advance exactly once per packet and are never reset.
//!
//! # Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use sshwire_proto::ssh::packet::{Decoded, PacketCodec};
//!
//! let mut sender = PacketCodec::new();
//! let mut receiver = PacketCodec::new();
//!
//! let wire = sender.encode(b"\x05payload").unwrap();
//! let mut input = BytesMut::from(&wire[..3]);
//! assert!(matches!(receiver.decode(&mut input).unwrap(), Decoded::NeedMoreData));
//!
//! input.extend_from_slice(&wire[3..]);
//! match receiver.decode(&mut input).unwrap() {
//!     Decoded::Packet(payload) => assert_eq!(payload, b"\x05payload"),
//!     Decoded::NeedMoreData => unreachable!(),
//! }
//! assert!(input.is_empty());
//! ```

use bytes::{Buf, BufMut, BytesMut};
use rand::RngCore;
use sshwire_platform::{SshError, SshResult};

use crate::ssh::crypto::{Compressor, DecryptionKey, Decompressor, EncryptionKey, MacKey};

/// Maximum outbound packet size in bytes (RFC 4253 Section 6.1).
pub const MAX_PACKET_SIZE: usize = 35000;

/// Largest `packet_length` accepted from the peer.
pub const MAX_INCOMING_PACKET_LENGTH: usize = 256 * 1024;

/// Minimum packet size in bytes.
///
/// 5 bytes header + 4 bytes minimum padding, rounded up to the 8-byte block.
pub const MIN_PACKET_SIZE: usize = 16;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: u8 = 4;

/// Maximum padding length in bytes (fits in u8).
pub const MAX_PADDING_LEN: u8 = 255;

/// Block size used before any cipher is installed.
pub const PLAINTEXT_BLOCK_SIZE: usize = 8;

/// SSH binary packet.
///
/// Represents an SSH protocol packet as defined in RFC 4253 Section 6.
///
/// # Invariants
///
/// - Padding length is between 4 and 255 bytes
/// - Packet is aligned to its block size
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    payload: Vec<u8>,
    padding: Vec<u8>,
    mac: Option<Vec<u8>>,
}

impl Packet {
    /// Creates a new SSH packet aligned to the plaintext block size.
    ///
    /// # Example
    ///
    /// ```rust
    /// use sshwire_proto::ssh::Packet;
    ///
    /// let packet = Packet::new(b"Hello, SSH!".to_vec());
    /// assert_eq!(packet.payload(), b"Hello, SSH!");
    /// assert_eq!(packet.to_bytes().len() % 8, 0);
    /// ```
    pub fn new(payload: Vec<u8>) -> Self {
        Self::with_alignment(payload, PLAINTEXT_BLOCK_SIZE, false)
    }

    /// Creates a packet aligned for a specific cipher.
    ///
    /// When `length_in_clear` is set (AEAD ciphers) the 4-byte length field
    /// is excluded from the alignment computation.
    pub fn with_alignment(payload: Vec<u8>, block_size: usize, length_in_clear: bool) -> Self {
        let block_size = block_size.max(PLAINTEXT_BLOCK_SIZE);
        let header_len = if length_in_clear { 1 } else { 5 };
        let unpadded_len = header_len + payload.len();

        let mut padding_len = MIN_PADDING_LEN as usize;
        while (unpadded_len + padding_len) % block_size != 0 {
            padding_len += 1;
        }

        let mut padding = vec![0u8; padding_len];
        rand::thread_rng().fill_bytes(&mut padding);

        Self {
            payload,
            padding,
            mac: None,
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

    /// Serializes this packet to wire format (unencrypted).
    pub fn to_bytes(&self) -> Vec<u8> {
        let packet_length = 1 + self.payload.len() + self.padding.len();
        let mut buf =
            BytesMut::with_capacity(4 + packet_length + self.mac.as_ref().map_or(0, |m| m.len()));

        buf.put_u32(packet_length as u32);
        buf.put_u8(self.padding.len() as u8);
        buf.put_slice(&self.payload);
        buf.put_slice(&self.padding);

        if let Some(mac) = &self.mac {
            buf.put_slice(mac);
        }

        buf.to_vec()
    }

    /// Parses a packet from unencrypted wire format.
    ///
    /// Any bytes after the declared packet are taken as the MAC.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Protocol`] if:
    /// - Data is too short (< 5 bytes for header)
    /// - Packet size exceeds the inbound limit
    /// - Padding length is invalid (< 4 or longer than the packet)
    /// - Data length doesn't match declared packet_length
    pub fn from_bytes(data: &[u8]) -> SshResult<Self> {
        if data.len() < 5 {
            return Err(SshError::Protocol(format!(
                "Packet too short: {} bytes (minimum 5)",
                data.len()
            )));
        }

        let mut buf = data;
        let packet_length = buf.get_u32() as usize;
        validate_length(packet_length)?;

        if buf.len() < packet_length {
            return Err(SshError::Protocol(format!(
                "Incomplete packet: expected {} bytes, got {} bytes",
                packet_length,
                buf.len()
            )));
        }

        let padding_length = buf.get_u8() as usize;
        let payload_length = payload_length(packet_length, padding_length)?;

        let payload = buf[..payload_length].to_vec();
        buf.advance(payload_length);

        let padding = buf[..padding_length].to_vec();
        buf.advance(padding_length);

        let mac = if !buf.is_empty() {
            Some(buf.to_vec())
        } else {
            None
        };

        Ok(Self {
            payload,
            padding,
            mac,
        })
    }
}

fn validate_length(packet_length: usize) -> SshResult<()> {
    if packet_length > MAX_INCOMING_PACKET_LENGTH {
        return Err(SshError::Protocol(format!(
            "Packet too large: {} bytes (maximum {})",
            packet_length, MAX_INCOMING_PACKET_LENGTH
        )));
    }
    if packet_length < 5 {
        return Err(SshError::Protocol(format!(
            "Packet too small: {} bytes (minimum 5 for padding_length + min padding)",
            packet_length
        )));
    }
    Ok(())
}

fn payload_length(packet_length: usize, padding_length: usize) -> SshResult<usize> {
    if padding_length < MIN_PADDING_LEN as usize {
        return Err(SshError::Protocol(format!(
            "Padding too short: {} bytes (minimum {})",
            padding_length, MIN_PADDING_LEN
        )));
    }
    if packet_length < 1 + padding_length {
        return Err(SshError::Protocol(format!(
            "Invalid packet: packet_length ({}) too small for padding ({})",
            packet_length, padding_length
        )));
    }
    Ok(packet_length - 1 - padding_length)
}

/// Result of a decode attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// A complete, authenticated, decompressed payload
    Packet(Vec<u8>),
    /// The buffer does not yet hold a whole packet
    NeedMoreData,
}

#[derive(Debug, Default)]
struct Outbound {
    sequence: u32,
    cipher: Option<EncryptionKey>,
    mac: Option<MacKey>,
    compressor: Option<Compressor>,
}

/// First cipher block of a CTR packet, decrypted once and kept until the
/// rest of the packet arrives.
#[derive(Debug)]
struct PartialBlock {
    plain: Vec<u8>,
    packet_length: usize,
}

#[derive(Debug, Default)]
struct Inbound {
    sequence: u32,
    cipher: Option<DecryptionKey>,
    mac: Option<MacKey>,
    decompressor: Option<Decompressor>,
    partial: Option<PartialBlock>,
}

/// Bidirectional SSH packet codec.
#[derive(Debug, Default)]
pub struct PacketCodec {
    outbound: Outbound,
    inbound: Inbound,
}

impl PacketCodec {
    /// Creates a codec with no encryption, MAC or compression.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number the next outbound packet will carry.
    pub fn send_sequence(&self) -> u32 {
        self.outbound.sequence
    }

    /// Sequence number expected on the next inbound packet.
    pub fn recv_sequence(&self) -> u32 {
        self.inbound.sequence
    }

    /// Installs new outbound keys. Sequence numbers carry on.
    pub fn install_outbound(&mut self, cipher: EncryptionKey, mac: Option<MacKey>) {
        self.outbound.cipher = Some(cipher);
        self.outbound.mac = mac;
    }

    /// Installs new inbound keys. Sequence numbers carry on.
    pub fn install_inbound(&mut self, cipher: DecryptionKey, mac: Option<MacKey>) {
        self.inbound.cipher = Some(cipher);
        self.inbound.mac = mac;
        self.inbound.partial = None;
    }

    /// Enables or disables outbound compression.
    pub fn set_outbound_compression(&mut self, compressor: Option<Compressor>) {
        self.outbound.compressor = compressor;
    }

    /// Enables or disables inbound decompression.
    pub fn set_inbound_compression(&mut self, decompressor: Option<Decompressor>) {
        self.inbound.decompressor = decompressor;
    }

    /// Returns true if outbound packets are compressed.
    pub fn outbound_compressed(&self) -> bool {
        self.outbound.compressor.is_some()
    }

    /// Returns true if inbound packets are decompressed.
    pub fn inbound_compressed(&self) -> bool {
        self.inbound.decompressor.is_some()
    }

    /// Returns true once an outbound cipher is installed.
    pub fn is_encrypted(&self) -> bool {
        self.outbound.cipher.is_some()
    }

    /// Encodes one payload into a complete wire packet.
    ///
    /// The outbound sequence number advances by one.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Protocol`] if the packet would exceed
    /// [`MAX_PACKET_SIZE`].
    pub fn encode(&mut self, payload: &[u8]) -> SshResult<Vec<u8>> {
        let out = &mut self.outbound;

        let compressed;
        let payload = match out.compressor.as_mut() {
            Some(c) => {
                compressed = c.compress(payload)?;
                &compressed[..]
            }
            None => payload,
        };

        let (block_size, aead) = match &out.cipher {
            Some(c) => (c.algorithm().block_size(), c.algorithm().is_aead()),
            None => (PLAINTEXT_BLOCK_SIZE, false),
        };

        let packet = Packet::with_alignment(payload.to_vec(), block_size, aead);
        let mut wire = packet.to_bytes();
        if wire.len() > MAX_PACKET_SIZE {
            return Err(SshError::Protocol(format!(
                "Packet size {} exceeds maximum {}",
                wire.len(),
                MAX_PACKET_SIZE
            )));
        }

        let sequence = out.sequence;
        let mac = match (&out.mac, aead) {
            (Some(mac), false) => Some(mac.compute(sequence, &wire)?),
            _ => None,
        };
        if let Some(cipher) = out.cipher.as_mut() {
            cipher.encrypt_packet(&mut wire)?;
        }
        if let Some(mac) = mac {
            wire.extend_from_slice(&mac);
        }

        out.sequence = sequence.wrapping_add(1);
        Ok(wire)
    }

    /// Decodes at most one packet from the front of `input`.
    ///
    /// Bytes are consumed from `input` only when a whole packet has been
    /// verified; otherwise [`Decoded::NeedMoreData`] is returned.
    ///
    /// # Errors
    ///
    /// - [`SshError::Protocol`] for malformed framing
    /// - [`SshError::Decrypt`] for MAC or tag failures
    /// - [`SshError::Compression`] for corrupt compressed payloads
    pub fn decode(&mut self, input: &mut BytesMut) -> SshResult<Decoded> {
        let inb = &mut self.inbound;
        let aead = inb.cipher.as_ref().map_or(false, |c| c.algorithm().is_aead());

        let mut plain = if aead {
            match Self::decode_aead(inb, input)? {
                Some(plain) => plain,
                None => return Ok(Decoded::NeedMoreData),
            }
        } else {
            match Self::decode_stream(inb, input)? {
                Some(plain) => plain,
                None => return Ok(Decoded::NeedMoreData),
            }
        };

        let packet_length = plain.len() - 4;
        let padding_length = plain[4] as usize;
        let payload_len = payload_length(packet_length, padding_length)?;
        plain.truncate(5 + payload_len);
        plain.drain(..5);

        inb.sequence = inb.sequence.wrapping_add(1);

        let payload = match inb.decompressor.as_mut() {
            Some(d) => d.decompress(&plain)?,
            None => plain,
        };
        Ok(Decoded::Packet(payload))
    }

    fn decode_aead(inb: &mut Inbound, input: &mut BytesMut) -> SshResult<Option<Vec<u8>>> {
        if input.len() < 4 {
            return Ok(None);
        }
        let length = [input[0], input[1], input[2], input[3]];
        let packet_length = u32::from_be_bytes(length) as usize;
        validate_length(packet_length)?;
        if packet_length % 16 != 0 {
            return Err(SshError::Protocol(format!(
                "Packet length {} not aligned to cipher block",
                packet_length
            )));
        }

        let total = 4 + packet_length + 16;
        if input.len() < total {
            return Ok(None);
        }

        let mut body = input[4..total].to_vec();
        let cipher = inb
            .cipher
            .as_mut()
            .ok_or_else(|| SshError::Protocol("AEAD cipher missing".to_string()))?;
        let n = cipher.open_packet(length, &mut body)?;
        body.truncate(n);
        input.advance(total);

        let mut plain = Vec::with_capacity(4 + n);
        plain.extend_from_slice(&length);
        plain.extend_from_slice(&body);
        Ok(Some(plain))
    }

    fn decode_stream(inb: &mut Inbound, input: &mut BytesMut) -> SshResult<Option<Vec<u8>>> {
        let block_size = inb
            .cipher
            .as_ref()
            .map_or(PLAINTEXT_BLOCK_SIZE, |c| c.algorithm().block_size());

        if inb.partial.is_none() {
            if input.len() < block_size {
                return Ok(None);
            }
            let mut first = input[..block_size].to_vec();
            if let Some(cipher) = inb.cipher.as_mut() {
                cipher.decrypt_blocks(&mut first)?;
            }
            let packet_length =
                u32::from_be_bytes([first[0], first[1], first[2], first[3]]) as usize;
            validate_length(packet_length)?;
            if (4 + packet_length) % block_size != 0 {
                return Err(SshError::Protocol(format!(
                    "Packet length {} not aligned to block size {}",
                    packet_length, block_size
                )));
            }
            inb.partial = Some(PartialBlock {
                plain: first,
                packet_length,
            });
        }

        let (first_len, packet_length) = match &inb.partial {
            Some(p) => (p.plain.len(), p.packet_length),
            None => return Ok(None),
        };
        let mac_len = inb.mac.as_ref().map_or(0, |m| m.algorithm().mac_size());
        let total = 4 + packet_length + mac_len;
        if input.len() < total {
            return Ok(None);
        }

        let mut rest = input[first_len..4 + packet_length].to_vec();
        if let Some(cipher) = inb.cipher.as_mut() {
            cipher.decrypt_blocks(&mut rest)?;
        }
        let mut plain = match inb.partial.take() {
            Some(p) => p.plain,
            None => Vec::new(),
        };
        plain.extend_from_slice(&rest);

        if let Some(mac) = &inb.mac {
            mac.verify(inb.sequence, &plain, &input[4 + packet_length..total])?;
        }
        input.advance(total);
        Ok(Some(plain))
    }
}
