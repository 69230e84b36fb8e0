//! Key exchange methods (RFC 4253, RFC 5656, RFC 8268, RFC 8731).
//!
//! This module implements:
//! - curve25519-sha256 and curve25519-sha256@libssh.org (RFC 8731)
//! - ecdh-sha2-nistp256 and ecdh-sha2-nistp384 (RFC 5656)
//! - diffie-hellman-group14-sha256 (RFC 8268)
//! - diffie-hellman-group14-sha1 (RFC 4253)
//!
//! plus exchange-hash computation and session key derivation
//! (RFC 4253 Section 7.2).
//!
//! # Security
//!
//! - DH Group14: 2048-bit MODP group, peer values checked to lie in (1, p-1)
//! - Curve25519 / NIST curves: ephemeral keys from `ring`
//! - Private exponents and shared secrets are zeroized on drop
//!
//! # Example
//!
//! ```rust
//! use sshwire_proto::ssh::kex_dh::{KexAlgorithm, KeyExchange};
//!
//! let client = KeyExchange::new(KexAlgorithm::Curve25519Sha256).unwrap();
//! let server = KeyExchange::new(KexAlgorithm::Curve25519Sha256).unwrap();
//! let (client_public, server_public) = (client.public_key(), server.public_key());
//!
//! let k1 = client.compute_shared_secret(&server_public).unwrap();
//! let k2 = server.compute_shared_secret(&client_public).unwrap();
//! assert_eq!(*k1, *k2);
//! ```

use num_bigint::{BigUint, RandBigInt};
use once_cell::sync::Lazy;
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey};
use ring::rand::SystemRandom;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384};
use sshwire_platform::{SshError, SshResult};
use zeroize::{Zeroize, Zeroizing};

use crate::ssh::wire::encode_mpint;

/// Key exchange method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KexAlgorithm {
    /// curve25519-sha256
    Curve25519Sha256,
    /// curve25519-sha256@libssh.org (pre-standard alias)
    Curve25519Sha256Libssh,
    /// ecdh-sha2-nistp256
    EcdhNistp256,
    /// ecdh-sha2-nistp384
    EcdhNistp384,
    /// diffie-hellman-group14-sha256
    DhGroup14Sha256,
    /// diffie-hellman-group14-sha1
    DhGroup14Sha1,
}

impl KexAlgorithm {
    /// All methods in default preference order.
    pub const ALL: [KexAlgorithm; 6] = [
        KexAlgorithm::Curve25519Sha256,
        KexAlgorithm::Curve25519Sha256Libssh,
        KexAlgorithm::EcdhNistp256,
        KexAlgorithm::EcdhNistp384,
        KexAlgorithm::DhGroup14Sha256,
        KexAlgorithm::DhGroup14Sha1,
    ];

    /// Wire name.
    pub fn name(&self) -> &'static str {
        match self {
            KexAlgorithm::Curve25519Sha256 => "curve25519-sha256",
            KexAlgorithm::Curve25519Sha256Libssh => "curve25519-sha256@libssh.org",
            KexAlgorithm::EcdhNistp256 => "ecdh-sha2-nistp256",
            KexAlgorithm::EcdhNistp384 => "ecdh-sha2-nistp384",
            KexAlgorithm::DhGroup14Sha256 => "diffie-hellman-group14-sha256",
            KexAlgorithm::DhGroup14Sha1 => "diffie-hellman-group14-sha1",
        }
    }

    /// Parses a wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|a| a.name() == name)
    }

    /// Hash used for the exchange hash and key derivation.
    pub fn hash(&self) -> KexHash {
        match self {
            KexAlgorithm::EcdhNistp384 => KexHash::Sha384,
            KexAlgorithm::DhGroup14Sha1 => KexHash::Sha1,
            _ => KexHash::Sha256,
        }
    }

    /// True when the ephemeral values travel as mpints (`e`, `f`) rather
    /// than strings (`Q_C`, `Q_S`).
    pub fn uses_mpint(&self) -> bool {
        matches!(self, KexAlgorithm::DhGroup14Sha256 | KexAlgorithm::DhGroup14Sha1)
    }
}

/// Hash function of a key exchange method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexHash {
    /// SHA-1
    Sha1,
    /// SHA-256
    Sha256,
    /// SHA-384
    Sha384,
}

impl KexHash {
    /// Digest size in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            KexHash::Sha1 => 20,
            KexHash::Sha256 => 32,
            KexHash::Sha384 => 48,
        }
    }

    fn hasher(&self) -> Hasher {
        match self {
            KexHash::Sha1 => Hasher::Sha1(Sha1::new()),
            KexHash::Sha256 => Hasher::Sha256(Sha256::new()),
            KexHash::Sha384 => Hasher::Sha384(Sha384::new()),
        }
    }
}

enum Hasher {
    Sha1(Sha1),
    Sha256(Sha256),
    Sha384(Sha384),
}

impl Hasher {
    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha384(h) => h.update(data),
        }
    }

    fn update_string(&mut self, data: &[u8]) {
        self.update(&(data.len() as u32).to_be_bytes());
        self.update(data);
    }

    fn update_mpint(&mut self, magnitude: &[u8]) {
        self.update_string(&encode_mpint(magnitude));
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            Hasher::Sha1(h) => h.finalize().to_vec(),
            Hasher::Sha256(h) => h.finalize().to_vec(),
            Hasher::Sha384(h) => h.finalize().to_vec(),
        }
    }
}

/// Diffie-Hellman Group 14 prime, 2048-bit MODP group (RFC 3526).
const GROUP14_PRIME: [u8; 256] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xc9, 0x0f, 0xda, 0xa2,
    0x21, 0x68, 0xc2, 0x34, 0xc4, 0xc6, 0x62, 0x8b, 0x80, 0xdc, 0x1c, 0xd1,
    0x29, 0x02, 0x4e, 0x08, 0x8a, 0x67, 0xcc, 0x74, 0x02, 0x0b, 0xbe, 0xa6,
    0x3b, 0x13, 0x9b, 0x22, 0x51, 0x4a, 0x08, 0x79, 0x8e, 0x34, 0x04, 0xdd,
    0xef, 0x95, 0x19, 0xb3, 0xcd, 0x3a, 0x43, 0x1b, 0x30, 0x2b, 0x0a, 0x6d,
    0xf2, 0x5f, 0x14, 0x37, 0x4f, 0xe1, 0x35, 0x6d, 0x6d, 0x51, 0xc2, 0x45,
    0xe4, 0x85, 0xb5, 0x76, 0x62, 0x5e, 0x7e, 0xc6, 0xf4, 0x4c, 0x42, 0xe9,
    0xa6, 0x37, 0xed, 0x6b, 0x0b, 0xff, 0x5c, 0xb6, 0xf4, 0x06, 0xb7, 0xed,
    0xee, 0x38, 0x6b, 0xfb, 0x5a, 0x89, 0x9f, 0xa5, 0xae, 0x9f, 0x24, 0x11,
    0x7c, 0x4b, 0x1f, 0xe6, 0x49, 0x28, 0x66, 0x51, 0xec, 0xe4, 0x5b, 0x3d,
    0xc2, 0x00, 0x7c, 0xb8, 0xa1, 0x63, 0xbf, 0x05, 0x98, 0xda, 0x48, 0x36,
    0x1c, 0x55, 0xd3, 0x9a, 0x69, 0x16, 0x3f, 0xa8, 0xfd, 0x24, 0xcf, 0x5f,
    0x83, 0x65, 0x5d, 0x23, 0xdc, 0xa3, 0xad, 0x96, 0x1c, 0x62, 0xf3, 0x56,
    0x20, 0x85, 0x52, 0xbb, 0x9e, 0xd5, 0x29, 0x07, 0x70, 0x96, 0x96, 0x6d,
    0x67, 0x0c, 0x35, 0x4e, 0x4a, 0xbc, 0x98, 0x04, 0xf1, 0x74, 0x6c, 0x08,
    0xca, 0x18, 0x21, 0x7c, 0x32, 0x90, 0x5e, 0x46, 0x2e, 0x36, 0xce, 0x3b,
    0xe3, 0x9e, 0x77, 0x2c, 0x18, 0x0e, 0x86, 0x03, 0x9b, 0x27, 0x83, 0xa2,
    0xec, 0x07, 0xa2, 0x8f, 0xb5, 0xc5, 0x5d, 0xf0, 0x6f, 0x4c, 0x52, 0xc9,
    0xde, 0x2b, 0xcb, 0xf6, 0x95, 0x58, 0x17, 0x18, 0x39, 0x95, 0x49, 0x7c,
    0xea, 0x95, 0x6a, 0xe5, 0x15, 0xd2, 0x26, 0x18, 0x98, 0xfa, 0x05, 0x10,
    0x15, 0x72, 0x8e, 0x5a, 0x8a, 0xac, 0xaa, 0x68, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff,
];

static GROUP14_P: Lazy<BigUint> = Lazy::new(|| BigUint::from_bytes_be(&GROUP14_PRIME));

/// Diffie-Hellman Group 14 key exchange (generator 2).
pub struct DhGroup14Exchange {
    private_key: Vec<u8>,
    public_key: Vec<u8>,
}

impl DhGroup14Exchange {
    /// Generates an ephemeral key pair.
    ///
    /// The private exponent has 512 bits, twice the group's security level.
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        let x = rng.gen_biguint_range(&BigUint::from(2u32), &(BigUint::from(1u32) << 512));
        let y = BigUint::from(2u32).modpow(&x, &GROUP14_P);

        Self {
            private_key: x.to_bytes_be(),
            public_key: y.to_bytes_be(),
        }
    }

    /// Returns the public value `g^x mod p` (unsigned big-endian).
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Computes `K = y^x mod p`.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::KexFailure`] unless `1 < y < p-1`.
    pub fn compute_shared_secret(&self, peer_public: &[u8]) -> SshResult<Zeroizing<Vec<u8>>> {
        let y_peer = BigUint::from_bytes_be(peer_public);
        let p_minus_one = &*GROUP14_P - 1u32;

        if y_peer <= BigUint::from(1u32) || y_peer >= p_minus_one {
            return Err(SshError::KexFailure(
                "Invalid DH peer public value: out of range".to_string(),
            ));
        }

        let x = BigUint::from_bytes_be(&self.private_key);
        Ok(Zeroizing::new(y_peer.modpow(&x, &GROUP14_P).to_bytes_be()))
    }
}

impl Default for DhGroup14Exchange {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DhGroup14Exchange {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

/// Elliptic-curve Diffie-Hellman over X25519, P-256 or P-384.
pub struct EcdhExchange {
    algorithm: &'static ring::agreement::Algorithm,
    private_key: EphemeralPrivateKey,
    public_key: Vec<u8>,
}

impl EcdhExchange {
    /// Generates an ephemeral key pair for the given agreement algorithm.
    pub fn new(algorithm: &'static ring::agreement::Algorithm) -> SshResult<Self> {
        let rng = SystemRandom::new();
        let private_key = EphemeralPrivateKey::generate(algorithm, &rng)
            .map_err(|_| SshError::KexFailure("Failed to generate ECDH key".to_string()))?;
        let public_key = private_key
            .compute_public_key()
            .map_err(|_| SshError::KexFailure("Failed to compute ECDH public key".to_string()))?
            .as_ref()
            .to_vec();

        Ok(Self {
            algorithm,
            private_key,
            public_key,
        })
    }

    /// Returns the encoded public key (32 bytes for X25519, an
    /// uncompressed point for NIST curves).
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Computes the shared secret, consuming the ephemeral key.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::KexFailure`] for invalid peer keys.
    pub fn compute_shared_secret(self, peer_public: &[u8]) -> SshResult<Zeroizing<Vec<u8>>> {
        let peer = UnparsedPublicKey::new(self.algorithm, peer_public);
        agree_ephemeral(self.private_key, &peer, |key_material| {
            Zeroizing::new(key_material.to_vec())
        })
        .map_err(|_| SshError::KexFailure("ECDH key agreement failed".to_string()))
    }
}

/// Ephemeral state of one key exchange.
pub enum KeyExchange {
    /// Curve25519 or NIST ECDH
    Ecdh(EcdhExchange),
    /// Finite-field DH group 14
    DhGroup14(DhGroup14Exchange),
}

impl KeyExchange {
    /// Generates the ephemeral key pair for `algorithm`.
    pub fn new(algorithm: KexAlgorithm) -> SshResult<Self> {
        use ring::agreement::{ECDH_P256, ECDH_P384, X25519};

        Ok(match algorithm {
            KexAlgorithm::Curve25519Sha256 | KexAlgorithm::Curve25519Sha256Libssh => {
                KeyExchange::Ecdh(EcdhExchange::new(&X25519)?)
            }
            KexAlgorithm::EcdhNistp256 => KeyExchange::Ecdh(EcdhExchange::new(&ECDH_P256)?),
            KexAlgorithm::EcdhNistp384 => KeyExchange::Ecdh(EcdhExchange::new(&ECDH_P384)?),
            KexAlgorithm::DhGroup14Sha256 | KexAlgorithm::DhGroup14Sha1 => {
                KeyExchange::DhGroup14(DhGroup14Exchange::new())
            }
        })
    }

    /// Returns the local ephemeral public value.
    pub fn public_key(&self) -> Vec<u8> {
        match self {
            KeyExchange::Ecdh(ex) => ex.public_key().to_vec(),
            KeyExchange::DhGroup14(ex) => ex.public_key().to_vec(),
        }
    }

    /// Computes the shared secret `K` as an unsigned big-endian integer.
    pub fn compute_shared_secret(self, peer_public: &[u8]) -> SshResult<Zeroizing<Vec<u8>>> {
        match self {
            KeyExchange::Ecdh(ex) => ex.compute_shared_secret(peer_public),
            KeyExchange::DhGroup14(ex) => ex.compute_shared_secret(peer_public),
        }
    }
}

impl std::fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyExchange::Ecdh(_) => f.write_str("KeyExchange::Ecdh(<redacted>)"),
            KeyExchange::DhGroup14(_) => f.write_str("KeyExchange::DhGroup14(<redacted>)"),
        }
    }
}

/// Inputs of the exchange hash `H`.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeHashInput<'a> {
    /// V_C, client identification string without CR LF
    pub client_version: &'a str,
    /// V_S, server identification string without CR LF
    pub server_version: &'a str,
    /// I_C, payload of the client's KEXINIT
    pub client_kexinit: &'a [u8],
    /// I_S, payload of the server's KEXINIT
    pub server_kexinit: &'a [u8],
    /// K_S, server host key blob
    pub host_key: &'a [u8],
    /// e or Q_C
    pub client_public: &'a [u8],
    /// f or Q_S
    pub server_public: &'a [u8],
    /// K, unsigned big-endian
    pub shared_secret: &'a [u8],
}

/// Computes the exchange hash `H` (RFC 4253 Section 8, RFC 5656 Section 4).
pub fn compute_exchange_hash(algorithm: KexAlgorithm, input: &ExchangeHashInput<'_>) -> Vec<u8> {
    let mut hasher = algorithm.hash().hasher();

    hasher.update_string(input.client_version.trim_end_matches("\r\n").as_bytes());
    hasher.update_string(input.server_version.trim_end_matches("\r\n").as_bytes());
    hasher.update_string(input.client_kexinit);
    hasher.update_string(input.server_kexinit);
    hasher.update_string(input.host_key);
    if algorithm.uses_mpint() {
        hasher.update_mpint(input.client_public);
        hasher.update_mpint(input.server_public);
    } else {
        hasher.update_string(input.client_public);
        hasher.update_string(input.server_public);
    }
    hasher.update_mpint(input.shared_secret);

    hasher.finalize()
}

/// Derives session key material (RFC 4253 Section 7.2).
///
/// ```text
/// K1 = HASH(K || H || X || session_id)    X is "A" to "F"
/// K2 = HASH(K || H || K1)
/// K3 = HASH(K || H || K1 || K2)
/// key = K1 || K2 || ...
/// ```
///
/// `K` is hashed in mpint form.
pub fn derive_key(
    hash: KexHash,
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    key_type: u8,
    key_length: usize,
) -> Zeroizing<Vec<u8>> {
    let k_mpint = Zeroizing::new(encode_mpint(shared_secret));

    let mut hasher = hash.hasher();
    hasher.update_string(&k_mpint);
    hasher.update(exchange_hash);
    hasher.update(&[key_type]);
    hasher.update(session_id);
    let mut key = Zeroizing::new(hasher.finalize());

    while key.len() < key_length {
        let mut hasher = hash.hasher();
        hasher.update_string(&k_mpint);
        hasher.update(exchange_hash);
        hasher.update(&key);
        let block = hasher.finalize();
        key.extend_from_slice(&block);
    }

    key.truncate(key_length);
    key
}
