//! SSH cryptographic operations.
//!
//! This module implements the per-direction packet protection used after
//! the first key exchange:
//! - AES-128/192/256-CTR (stream ciphers with separate MAC, RFC 4344)
//! - AES-128-GCM, AES-256-GCM (`@openssh.com` AEAD ciphers, RFC 5647)
//! - HMAC-SHA256, HMAC-SHA512, HMAC-SHA1 (MAC algorithms, RFC 6668)
//! - zlib and delayed `zlib@openssh.com` compression
//!
//! # Security
//!
//! - **AEAD nonces** - 4-byte fixed field plus a 64-bit invocation counter
//!   taken from the derived IV, incremented once per packet
//! - **MAC input** - `uint32 sequence_number || unencrypted_packet`
//! - **Key material** - MAC keys are zeroized on drop, cipher keys are
//!   owned by `ring` / `aes`
//!
//! # Example
//!
//! ```rust
//! use sshwire_proto::ssh::crypto::{CipherAlgorithm, DecryptionKey, EncryptionKey};
//!
//! let key = [7u8; 16];
//! let iv = [1u8; 16];
//! let mut enc = EncryptionKey::new(CipherAlgorithm::Aes128Ctr, &key, &iv).unwrap();
//! let mut dec = DecryptionKey::new(CipherAlgorithm::Aes128Ctr, &key, &iv).unwrap();
//!
//! let mut packet = b"0123456789abcdef".to_vec();
//! enc.encrypt_packet(&mut packet).unwrap();
//! dec.decrypt_blocks(&mut packet).unwrap();
//! assert_eq!(packet, b"0123456789abcdef");
//! ```

use aes::{Aes128, Aes192, Aes256};
use cipher::{KeyIvInit, StreamCipher};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use hmac::{Hmac, Mac};
use ring::aead::{Aad, LessSafeKey, Nonce, Tag, UnboundKey, AES_128_GCM, AES_256_GCM};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use sshwire_platform::{SshError, SshResult};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes192Ctr = ctr::Ctr128BE<Aes192>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Largest payload accepted from the decompressor.
pub const MAX_DECOMPRESSED_SIZE: usize = 256 * 1024;

/// Cipher algorithm for SSH encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// AES-128-GCM AEAD cipher
    Aes128Gcm,
    /// AES-256-GCM AEAD cipher
    Aes256Gcm,
    /// AES-128-CTR stream cipher (requires separate MAC)
    Aes128Ctr,
    /// AES-192-CTR stream cipher (requires separate MAC)
    Aes192Ctr,
    /// AES-256-CTR stream cipher (requires separate MAC)
    Aes256Ctr,
}

impl CipherAlgorithm {
    /// All supported ciphers in default preference order.
    pub const ALL: [CipherAlgorithm; 5] = [
        CipherAlgorithm::Aes256Gcm,
        CipherAlgorithm::Aes128Gcm,
        CipherAlgorithm::Aes256Ctr,
        CipherAlgorithm::Aes192Ctr,
        CipherAlgorithm::Aes128Ctr,
    ];

    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::Aes128Gcm => "aes128-gcm@openssh.com",
            CipherAlgorithm::Aes256Gcm => "aes256-gcm@openssh.com",
            CipherAlgorithm::Aes128Ctr => "aes128-ctr",
            CipherAlgorithm::Aes192Ctr => "aes192-ctr",
            CipherAlgorithm::Aes256Ctr => "aes256-ctr",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes128Ctr => 16,
            CipherAlgorithm::Aes192Ctr => 24,
            CipherAlgorithm::Aes256Gcm | CipherAlgorithm::Aes256Ctr => 32,
        }
    }

    /// Returns the IV/nonce size in bytes.
    pub fn iv_size(&self) -> usize {
        if self.is_aead() {
            12
        } else {
            16
        }
    }

    /// Returns the cipher block size, which sets packet alignment.
    pub fn block_size(&self) -> usize {
        16
    }

    /// Returns the authentication tag size in bytes (for AEAD ciphers).
    pub fn tag_size(&self) -> usize {
        if self.is_aead() {
            16
        } else {
            0
        }
    }

    /// Returns true if this is an AEAD cipher.
    pub fn is_aead(&self) -> bool {
        matches!(self, CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm)
    }

    /// Parses cipher algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.name() == name)
    }
}

/// Counter-mode keystream for one direction.
enum CtrStream {
    Aes128(Aes128Ctr),
    Aes192(Aes192Ctr),
    Aes256(Aes256Ctr),
}

impl CtrStream {
    fn new(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> SshResult<Self> {
        let invalid = |_| SshError::KexFailure(format!("Invalid {} key or IV", algorithm.name()));
        let key = &key[..algorithm.key_size()];
        let iv = &iv[..16];
        Ok(match algorithm {
            CipherAlgorithm::Aes128Ctr => CtrStream::Aes128(Aes128Ctr::new_from_slices(key, iv).map_err(invalid)?),
            CipherAlgorithm::Aes192Ctr => CtrStream::Aes192(Aes192Ctr::new_from_slices(key, iv).map_err(invalid)?),
            CipherAlgorithm::Aes256Ctr => CtrStream::Aes256(Aes256Ctr::new_from_slices(key, iv).map_err(invalid)?),
            other => {
                return Err(SshError::KexFailure(format!(
                    "{} is not a stream cipher",
                    other.name()
                )))
            }
        })
    }

    fn apply(&mut self, data: &mut [u8]) {
        match self {
            CtrStream::Aes128(c) => c.apply_keystream(data),
            CtrStream::Aes192(c) => c.apply_keystream(data),
            CtrStream::Aes256(c) => c.apply_keystream(data),
        }
    }
}

/// AES-GCM key with the OpenSSH nonce layout.
struct GcmKey {
    key: LessSafeKey,
    fixed: [u8; 4],
    invocation: u64,
}

impl GcmKey {
    fn new(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> SshResult<Self> {
        let aead = match algorithm {
            CipherAlgorithm::Aes128Gcm => &AES_128_GCM,
            CipherAlgorithm::Aes256Gcm => &AES_256_GCM,
            other => {
                return Err(SshError::KexFailure(format!(
                    "{} is not an AEAD cipher",
                    other.name()
                )))
            }
        };
        let unbound = UnboundKey::new(aead, &key[..algorithm.key_size()]).map_err(|_| {
            SshError::KexFailure(format!("Failed to create {} key", algorithm.name()))
        })?;

        let mut fixed = [0u8; 4];
        fixed.copy_from_slice(&iv[..4]);
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&iv[4..12]);

        Ok(Self {
            key: LessSafeKey::new(unbound),
            fixed,
            invocation: u64::from_be_bytes(counter),
        })
    }

    fn next_nonce(&mut self) -> Nonce {
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&self.fixed);
        nonce[4..].copy_from_slice(&self.invocation.to_be_bytes());
        self.invocation = self.invocation.wrapping_add(1);
        Nonce::assume_unique_for_key(nonce)
    }
}

enum CipherState {
    Ctr(CtrStream),
    Gcm(GcmKey),
}

/// Outbound packet cipher.
pub struct EncryptionKey {
    algorithm: CipherAlgorithm,
    state: CipherState,
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

fn check_material(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> SshResult<()> {
    if key.len() < algorithm.key_size() || iv.len() < algorithm.iv_size() {
        return Err(SshError::KexFailure(format!(
            "Insufficient key material for {}: key {} of {}, iv {} of {}",
            algorithm.name(),
            key.len(),
            algorithm.key_size(),
            iv.len(),
            algorithm.iv_size()
        )));
    }
    Ok(())
}

fn new_state(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> SshResult<CipherState> {
    check_material(algorithm, key, iv)?;
    if algorithm.is_aead() {
        Ok(CipherState::Gcm(GcmKey::new(algorithm, key, iv)?))
    } else {
        Ok(CipherState::Ctr(CtrStream::new(algorithm, key, iv)?))
    }
}

impl EncryptionKey {
    /// Creates a new encryption key from derived key and IV material.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::KexFailure`] if the material is too short.
    pub fn new(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> SshResult<Self> {
        Ok(Self {
            algorithm,
            state: new_state(algorithm, key, iv)?,
        })
    }

    /// Encrypts a complete binary packet (length field included) in place.
    ///
    /// For AEAD ciphers the 4-byte length stays in the clear as associated
    /// data and the tag is appended.
    pub fn encrypt_packet(&mut self, packet: &mut Vec<u8>) -> SshResult<()> {
        match &mut self.state {
            CipherState::Ctr(stream) => {
                stream.apply(packet);
                Ok(())
            }
            CipherState::Gcm(gcm) => {
                if packet.len() < 4 {
                    return Err(SshError::Protocol("Packet shorter than length field".to_string()));
                }
                let nonce = gcm.next_nonce();
                let (length, body) = packet.split_at_mut(4);
                let tag: Tag = gcm
                    .key
                    .seal_in_place_separate_tag(nonce, Aad::from(&*length), body)
                    .map_err(|_| SshError::Protocol("Encryption failed".to_string()))?;
                packet.extend_from_slice(tag.as_ref());
                Ok(())
            }
        }
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }
}

/// Inbound packet cipher.
pub struct DecryptionKey {
    algorithm: CipherAlgorithm,
    state: CipherState,
}

impl std::fmt::Debug for DecryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptionKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl DecryptionKey {
    /// Creates a new decryption key from derived key and IV material.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::KexFailure`] if the material is too short.
    pub fn new(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> SshResult<Self> {
        Ok(Self {
            algorithm,
            state: new_state(algorithm, key, iv)?,
        })
    }

    /// Advances the CTR keystream over `data`.
    ///
    /// Used to reveal the first block (and so the packet length) before the
    /// remainder has arrived, then for the remainder itself. Calling it on
    /// an AEAD key is an error.
    pub fn decrypt_blocks(&mut self, data: &mut [u8]) -> SshResult<()> {
        match &mut self.state {
            CipherState::Ctr(stream) => {
                stream.apply(data);
                Ok(())
            }
            CipherState::Gcm(_) => Err(SshError::Decrypt(
                "AEAD ciphers decrypt whole packets".to_string(),
            )),
        }
    }

    /// Authenticates and decrypts an AEAD packet body.
    ///
    /// `length` is the clear-text length field, `body` holds the encrypted
    /// packet followed by the tag. Returns the plaintext length.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Decrypt`] if the tag does not verify.
    pub fn open_packet(&mut self, length: [u8; 4], body: &mut [u8]) -> SshResult<usize> {
        match &mut self.state {
            CipherState::Gcm(gcm) => {
                let nonce = gcm.next_nonce();
                let plain = gcm
                    .key
                    .open_in_place(nonce, Aad::from(length), body)
                    .map_err(|_| {
                        SshError::Decrypt("Decryption failed or authentication tag mismatch".to_string())
                    })?;
                Ok(plain.len())
            }
            CipherState::Ctr(_) => Err(SshError::Decrypt(
                "Stream ciphers have no authentication tag".to_string(),
            )),
        }
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }
}

/// MAC algorithm for SSH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// HMAC-SHA256
    HmacSha256,
    /// HMAC-SHA512
    HmacSha512,
    /// HMAC-SHA1
    HmacSha1,
}

impl MacAlgorithm {
    /// All supported MACs in default preference order.
    pub const ALL: [MacAlgorithm; 3] = [
        MacAlgorithm::HmacSha256,
        MacAlgorithm::HmacSha512,
        MacAlgorithm::HmacSha1,
    ];

    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::HmacSha256 => "hmac-sha2-256",
            MacAlgorithm::HmacSha512 => "hmac-sha2-512",
            MacAlgorithm::HmacSha1 => "hmac-sha1",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        self.mac_size()
    }

    /// Returns the MAC output size in bytes.
    pub fn mac_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha256 => 32,
            MacAlgorithm::HmacSha512 => 64,
            MacAlgorithm::HmacSha1 => 20,
        }
    }

    /// Parses MAC algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.name() == name)
    }
}

/// MAC key for computing message authentication codes.
///
/// The sequence number is supplied by the caller; it belongs to the
/// transport and is never reset by rekeying.
pub struct MacKey {
    algorithm: MacAlgorithm,
    key: Vec<u8>,
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl MacKey {
    /// Creates a new MAC key.
    pub fn new(algorithm: MacAlgorithm, key_material: &[u8]) -> SshResult<Self> {
        if key_material.len() < algorithm.key_size() {
            return Err(SshError::KexFailure(format!(
                "Insufficient key material for MAC: expected {}, got {}",
                algorithm.key_size(),
                key_material.len()
            )));
        }

        Ok(Self {
            algorithm,
            key: key_material[..algorithm.key_size()].to_vec(),
        })
    }

    /// Computes the MAC over `sequence || packet_data`.
    pub fn compute(&self, sequence: u32, packet_data: &[u8]) -> SshResult<Vec<u8>> {
        let seq = sequence.to_be_bytes();
        let invalid = |_| SshError::KexFailure("Invalid HMAC key".to_string());
        let mac = match self.algorithm {
            MacAlgorithm::HmacSha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(&self.key).map_err(invalid)?;
                mac.update(&seq);
                mac.update(packet_data);
                mac.finalize().into_bytes().to_vec()
            }
            MacAlgorithm::HmacSha512 => {
                let mut mac = Hmac::<Sha512>::new_from_slice(&self.key).map_err(invalid)?;
                mac.update(&seq);
                mac.update(packet_data);
                mac.finalize().into_bytes().to_vec()
            }
            MacAlgorithm::HmacSha1 => {
                let mut mac = Hmac::<Sha1>::new_from_slice(&self.key).map_err(invalid)?;
                mac.update(&seq);
                mac.update(packet_data);
                mac.finalize().into_bytes().to_vec()
            }
        };
        Ok(mac)
    }

    /// Verifies a received MAC in constant time.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Decrypt`] on mismatch.
    pub fn verify(&self, sequence: u32, packet_data: &[u8], received_mac: &[u8]) -> SshResult<()> {
        let computed_mac = self.compute(sequence, packet_data)?;

        if computed_mac.len() != received_mac.len() {
            return Err(SshError::Decrypt("MAC length mismatch".to_string()));
        }

        if computed_mac.ct_eq(received_mac).into() {
            Ok(())
        } else {
            Err(SshError::Decrypt("MAC verification failed".to_string()))
        }
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> MacAlgorithm {
        self.algorithm
    }
}

impl Drop for MacKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Compression algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    /// No compression
    None,
    /// zlib, active from the first NEWKEYS
    Zlib,
    /// zlib, active once user authentication has succeeded
    ZlibOpenssh,
}

impl CompressionAlgorithm {
    /// All supported compression methods.
    pub const ALL: [CompressionAlgorithm; 3] = [
        CompressionAlgorithm::None,
        CompressionAlgorithm::ZlibOpenssh,
        CompressionAlgorithm::Zlib,
    ];

    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Zlib => "zlib",
            CompressionAlgorithm::ZlibOpenssh => "zlib@openssh.com",
        }
    }

    /// Parses compression algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(CompressionAlgorithm::None),
            "zlib" => Some(CompressionAlgorithm::Zlib),
            "zlib@openssh.com" => Some(CompressionAlgorithm::ZlibOpenssh),
            _ => None,
        }
    }

    /// Returns true if compression waits for authentication.
    pub fn is_delayed(&self) -> bool {
        matches!(self, CompressionAlgorithm::ZlibOpenssh)
    }
}

/// Stateful zlib compressor for outbound payloads.
///
/// The deflate stream spans every packet of the direction; each payload is
/// terminated with a partial flush.
pub struct Compressor {
    inner: Compress,
}

impl std::fmt::Debug for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compressor")
            .field("total_in", &self.inner.total_in())
            .finish()
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor {
    /// Creates a compressor with a zlib header.
    pub fn new() -> Self {
        Self {
            inner: Compress::new(Compression::default(), true),
        }
    }

    /// Compresses one payload.
    pub fn compress(&mut self, data: &[u8]) -> SshResult<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() + 64);
        let start = self.inner.total_in();
        loop {
            let consumed = (self.inner.total_in() - start) as usize;
            self.inner
                .compress_vec(&data[consumed..], &mut out, FlushCompress::Partial)
                .map_err(|e| SshError::Compression(e.to_string()))?;
            let consumed = (self.inner.total_in() - start) as usize;
            if consumed == data.len() && out.len() < out.capacity() {
                return Ok(out);
            }
            out.reserve(out.capacity().max(256));
        }
    }
}

/// Stateful zlib decompressor for inbound payloads.
pub struct Decompressor {
    inner: Decompress,
}

impl std::fmt::Debug for Decompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decompressor")
            .field("total_out", &self.inner.total_out())
            .finish()
    }
}

impl Default for Decompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Decompressor {
    /// Creates a decompressor expecting a zlib header.
    pub fn new() -> Self {
        Self {
            inner: Decompress::new(true),
        }
    }

    /// Decompresses one payload.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Compression`] on corrupt input or when the output
    /// exceeds [`MAX_DECOMPRESSED_SIZE`].
    pub fn decompress(&mut self, data: &[u8]) -> SshResult<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() * 2 + 64);
        let start = self.inner.total_in();
        loop {
            let consumed = (self.inner.total_in() - start) as usize;
            let before = out.len();
            let status = self
                .inner
                .decompress_vec(&data[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(|e| SshError::Compression(e.to_string()))?;
            let consumed = (self.inner.total_in() - start) as usize;

            if out.len() > MAX_DECOMPRESSED_SIZE {
                return Err(SshError::Compression(format!(
                    "Decompressed payload exceeds {} bytes",
                    MAX_DECOMPRESSED_SIZE
                )));
            }
            let spare = out.len() < out.capacity();
            match status {
                Status::StreamEnd => return Ok(out),
                _ if consumed == data.len() && spare => return Ok(out),
                Status::BufError if out.len() == before && spare => return Ok(out),
                _ => out.reserve(out.capacity().max(256)),
            }
        }
    }
}
