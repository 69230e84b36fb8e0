//! SSH Host Key Algorithms
//!
//! This module implements host key algorithms for SSH server authentication
//! according to RFC 4253 Section 6.6, RFC 5656 and RFC 8332.
//!
//! # Supported Algorithms
//!
//! - `ssh-ed25519` - EdDSA signature using Ed25519 (RECOMMENDED, modern)
//! - `ecdsa-sha2-nistp256`, `ecdsa-sha2-nistp384`, `ecdsa-sha2-nistp521`
//! - `rsa-sha2-256`, `rsa-sha2-512` - RSA signatures with SHA-2
//! - `ssh-rsa` - RSA with SHA-1, verification only
//!
//! The same signer types back user keys loaded by
//! [`privatekey`](crate::ssh::privatekey), so a key file can serve as a
//! host key and vice versa.
//!
//! # Example
//!
//! ```rust
//! use sshwire_proto::ssh::hostkey::{Ed25519HostKey, HostKey, PublicKey};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let hostkey = Ed25519HostKey::generate()?;
//! let blob = hostkey.public_key_bytes();
//!
//! let signature = hostkey.sign(b"data to sign")?;
//!
//! let public = PublicKey::from_blob(&blob)?;
//! assert!(public.verify(b"data to sign", &signature)?);
//! # Ok(())
//! # }
//! ```

use bytes::BytesMut;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use md5::Md5;
use ring::signature::{
    RsaPublicKeyComponents, RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY,
    RSA_PKCS1_2048_8192_SHA256, RSA_PKCS1_2048_8192_SHA512,
};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use signature::SignatureEncoding;
use sshwire_platform::{SshError, SshResult};
use zeroize::Zeroizing;

use crate::ssh::wire::{
    pad_be, read_mpint, read_slice, read_string, write_bytes, write_mpint, write_string,
};

/// Host key algorithm identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostKeyAlgorithm {
    /// ssh-ed25519 - EdDSA signature using Ed25519 (RECOMMENDED, modern)
    SshEd25519,
    /// rsa-sha2-256 - RSA signature with SHA-256
    RsaSha2_256,
    /// rsa-sha2-512 - RSA signature with SHA-512
    RsaSha2_512,
    /// ssh-rsa - Legacy RSA with SHA-1 (verification only)
    SshRsa,
    /// ecdsa-sha2-nistp256 - ECDSA signature using P-256 curve
    EcdsaSha2Nistp256,
    /// ecdsa-sha2-nistp384 - ECDSA signature using P-384 curve
    EcdsaSha2Nistp384,
    /// ecdsa-sha2-nistp521 - ECDSA signature using P-521 curve
    EcdsaSha2Nistp521,
}

impl HostKeyAlgorithm {
    /// All supported algorithms in default preference order.
    pub const ALL: [HostKeyAlgorithm; 7] = [
        HostKeyAlgorithm::SshEd25519,
        HostKeyAlgorithm::EcdsaSha2Nistp256,
        HostKeyAlgorithm::EcdsaSha2Nistp384,
        HostKeyAlgorithm::EcdsaSha2Nistp521,
        HostKeyAlgorithm::RsaSha2_512,
        HostKeyAlgorithm::RsaSha2_256,
        HostKeyAlgorithm::SshRsa,
    ];

    /// Get the algorithm name as used on the wire
    pub fn name(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::SshEd25519 => "ssh-ed25519",
            HostKeyAlgorithm::RsaSha2_256 => "rsa-sha2-256",
            HostKeyAlgorithm::RsaSha2_512 => "rsa-sha2-512",
            HostKeyAlgorithm::SshRsa => "ssh-rsa",
            HostKeyAlgorithm::EcdsaSha2Nistp256 => "ecdsa-sha2-nistp256",
            HostKeyAlgorithm::EcdsaSha2Nistp384 => "ecdsa-sha2-nistp384",
            HostKeyAlgorithm::EcdsaSha2Nistp521 => "ecdsa-sha2-nistp521",
        }
    }

    /// Parse algorithm from name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|a| a.name() == name)
    }

    /// Returns the key type carried in the public key blob.
    ///
    /// All RSA signature algorithms use `ssh-rsa` keys.
    pub fn key_type(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::RsaSha2_256 | HostKeyAlgorithm::RsaSha2_512 => "ssh-rsa",
            other => other.name(),
        }
    }
}

/// Digest used by [`hash_host_key`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashType {
    /// MD5 (16 bytes)
    Md5,
    /// SHA-1 (20 bytes)
    Sha1,
    /// SHA-256 (32 bytes)
    Sha256,
}

/// Hashes a host key blob for out-of-band comparison.
pub fn hash_host_key(blob: &[u8], hash: HashType) -> Vec<u8> {
    match hash {
        HashType::Md5 => Md5::digest(blob).to_vec(),
        HashType::Sha1 => Sha1::digest(blob).to_vec(),
        HashType::Sha256 => Sha256::digest(blob).to_vec(),
    }
}

/// Formats an OpenSSH style `SHA256:` fingerprint.
pub fn fingerprint_sha256(blob: &[u8]) -> String {
    use base64::Engine;
    format!(
        "SHA256:{}",
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(Sha256::digest(blob))
    )
}

/// NIST curves usable for ECDSA keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EcdsaCurve {
    /// NIST P-256 (secp256r1)
    NistP256,
    /// NIST P-384 (secp384r1)
    NistP384,
    /// NIST P-521 (secp521r1)
    NistP521,
}

impl EcdsaCurve {
    /// SSH curve identifier.
    pub fn name(&self) -> &'static str {
        match self {
            EcdsaCurve::NistP256 => "nistp256",
            EcdsaCurve::NistP384 => "nistp384",
            EcdsaCurve::NistP521 => "nistp521",
        }
    }

    /// Parses an SSH curve identifier.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "nistp256" => Some(EcdsaCurve::NistP256),
            "nistp384" => Some(EcdsaCurve::NistP384),
            "nistp521" => Some(EcdsaCurve::NistP521),
            _ => None,
        }
    }

    /// Size of a scalar in bytes.
    pub fn field_size(&self) -> usize {
        match self {
            EcdsaCurve::NistP256 => 32,
            EcdsaCurve::NistP384 => 48,
            EcdsaCurve::NistP521 => 66,
        }
    }

    /// Matching signature algorithm.
    pub fn algorithm(&self) -> HostKeyAlgorithm {
        match self {
            EcdsaCurve::NistP256 => HostKeyAlgorithm::EcdsaSha2Nistp256,
            EcdsaCurve::NistP384 => HostKeyAlgorithm::EcdsaSha2Nistp384,
            EcdsaCurve::NistP521 => HostKeyAlgorithm::EcdsaSha2Nistp521,
        }
    }
}

/// SSH public key
///
/// Represents the public portion of an SSH key pair, as carried in host key
/// blobs, `authorized_keys`-style lines and certificates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKey {
    /// RSA public key
    Rsa {
        /// Public exponent (unsigned big-endian)
        e: Vec<u8>,
        /// Modulus (unsigned big-endian)
        n: Vec<u8>,
    },
    /// Ed25519 public key (32 bytes)
    Ed25519([u8; 32]),
    /// ECDSA public key
    Ecdsa {
        /// Curve
        curve: EcdsaCurve,
        /// Public key point (uncompressed SEC1 format)
        point: Vec<u8>,
    },
}

impl PublicKey {
    /// Parses a public key blob (`string key_type` followed by key fields).
    ///
    /// # Errors
    ///
    /// Returns [`SshError::HostKeyInit`] for unknown or malformed keys.
    pub fn from_blob(blob: &[u8]) -> SshResult<Self> {
        let mut offset = 0;
        let key = Self::read_fields(blob, &mut offset)
            .map_err(|e| SshError::HostKeyInit(format!("Malformed public key: {}", e)))?;
        Ok(key)
    }

    /// Reads a key type name and its fields from `data` at `offset`.
    pub(crate) fn read_fields(data: &[u8], offset: &mut usize) -> SshResult<Self> {
        let key_type = read_string(data, offset)?;
        Self::read_typed_fields(&key_type, data, offset)
    }

    /// Reads the fields that follow a known key type name.
    pub(crate) fn read_typed_fields(key_type: &str, data: &[u8], offset: &mut usize) -> SshResult<Self> {
        match key_type {
            "ssh-ed25519" => {
                let raw = read_slice(data, offset)?;
                let key: [u8; 32] = raw.try_into().map_err(|_| {
                    SshError::HostKeyInit("Ed25519 public key must be 32 bytes".to_string())
                })?;
                Ok(PublicKey::Ed25519(key))
            }
            "ssh-rsa" => {
                let e = read_mpint(data, offset)?;
                let n = read_mpint(data, offset)?;
                Ok(PublicKey::Rsa { e, n })
            }
            t if t.starts_with("ecdsa-sha2-") => {
                let curve_name = read_string(data, offset)?;
                let curve = EcdsaCurve::from_name(&curve_name).ok_or_else(|| {
                    SshError::HostKeyInit(format!("Unsupported curve: {}", curve_name))
                })?;
                if t != curve.algorithm().name() {
                    return Err(SshError::HostKeyInit(format!(
                        "Curve {} does not match key type {}",
                        curve_name, t
                    )));
                }
                let point = read_slice(data, offset)?.to_vec();
                Ok(PublicKey::Ecdsa { curve, point })
            }
            other => Err(SshError::HostKeyInit(format!(
                "Unsupported key type: {}",
                other
            ))),
        }
    }

    /// Writes the key fields (without the type name).
    pub(crate) fn write_fields(&self, buf: &mut BytesMut) {
        match self {
            PublicKey::Ed25519(key) => write_bytes(buf, key),
            PublicKey::Rsa { e, n } => {
                write_mpint(buf, e);
                write_mpint(buf, n);
            }
            PublicKey::Ecdsa { curve, point } => {
                write_string(buf, curve.name());
                write_bytes(buf, point);
            }
        }
    }

    /// Encodes the key as an SSH public key blob.
    pub fn to_blob(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_string(&mut buf, self.key_type());
        self.write_fields(&mut buf);
        buf.to_vec()
    }

    /// Key type name, e.g. `ssh-ed25519`.
    pub fn key_type(&self) -> &'static str {
        match self {
            PublicKey::Ed25519(_) => "ssh-ed25519",
            PublicKey::Rsa { .. } => "ssh-rsa",
            PublicKey::Ecdsa { curve, .. } => curve.algorithm().name(),
        }
    }

    /// Signature algorithms this key can verify, most preferred first.
    pub fn algorithms(&self) -> Vec<HostKeyAlgorithm> {
        match self {
            PublicKey::Ed25519(_) => vec![HostKeyAlgorithm::SshEd25519],
            PublicKey::Rsa { .. } => vec![
                HostKeyAlgorithm::RsaSha2_512,
                HostKeyAlgorithm::RsaSha2_256,
                HostKeyAlgorithm::SshRsa,
            ],
            PublicKey::Ecdsa { curve, .. } => vec![curve.algorithm()],
        }
    }

    /// Verifies an SSH signature blob (`string algorithm, string signature`)
    /// over `data`.
    ///
    /// Returns `Ok(false)` when the signature is well formed but does not
    /// verify.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::HostKeySign`] for malformed blobs or algorithms
    /// that do not match this key.
    pub fn verify(&self, data: &[u8], signature_blob: &[u8]) -> SshResult<bool> {
        let mut offset = 0;
        let sig_name = read_string(signature_blob, &mut offset)
            .map_err(|_| SshError::HostKeySign("Malformed signature blob".to_string()))?;
        let sig = read_slice(signature_blob, &mut offset)
            .map_err(|_| SshError::HostKeySign("Malformed signature blob".to_string()))?;

        let algorithm = HostKeyAlgorithm::from_name(&sig_name).ok_or_else(|| {
            SshError::HostKeySign(format!("Unsupported signature algorithm: {}", sig_name))
        })?;
        if !self.algorithms().contains(&algorithm) {
            return Err(SshError::HostKeySign(format!(
                "Signature algorithm {} does not match {} key",
                sig_name,
                self.key_type()
            )));
        }

        match self {
            PublicKey::Ed25519(key) => Ed25519HostKey::verify(key, data, sig),
            PublicKey::Rsa { e, n } => {
                let params = match algorithm {
                    HostKeyAlgorithm::RsaSha2_512 => &RSA_PKCS1_2048_8192_SHA512,
                    HostKeyAlgorithm::RsaSha2_256 => &RSA_PKCS1_2048_8192_SHA256,
                    _ => &RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY,
                };
                let components = RsaPublicKeyComponents { n: &n[..], e: &e[..] };
                Ok(components.verify(params, data, sig).is_ok())
            }
            PublicKey::Ecdsa { curve, point } => {
                let raw = ecdsa_signature_to_fixed(*curve, sig)?;
                match curve {
                    EcdsaCurve::NistP256 => EcdsaP256HostKey::verify(point, data, &raw),
                    EcdsaCurve::NistP384 => EcdsaP384HostKey::verify(point, data, &raw),
                    EcdsaCurve::NistP521 => EcdsaP521HostKey::verify(point, data, &raw),
                }
            }
        }
    }
}

/// Verifies a host key signature over the exchange hash.
///
/// # Errors
///
/// - [`SshError::HostKeyInit`] if the host key blob cannot be parsed
/// - [`SshError::HostKeySign`] if the signature does not verify
pub fn verify_host_signature(host_key_blob: &[u8], data: &[u8], signature_blob: &[u8]) -> SshResult<()> {
    let key = PublicKey::from_blob(host_key_blob)?;
    if key.verify(data, signature_blob)? {
        Ok(())
    } else {
        Err(SshError::HostKeySign(format!(
            "Unable to verify {} host key signature",
            key.key_type()
        )))
    }
}

/// Converts `mpint r, mpint s` into the fixed-width `r || s` form.
fn ecdsa_signature_to_fixed(curve: EcdsaCurve, sig: &[u8]) -> SshResult<Vec<u8>> {
    let bad = || SshError::HostKeySign("Malformed ECDSA signature".to_string());
    let mut offset = 0;
    let r = read_mpint(sig, &mut offset).map_err(|_| bad())?;
    let s = read_mpint(sig, &mut offset).map_err(|_| bad())?;
    let size = curve.field_size();
    let mut out = pad_be(&r, size).ok_or_else(bad)?;
    out.extend(pad_be(&s, size).ok_or_else(bad)?);
    Ok(out)
}

/// Builds `string algorithm, string signature` blobs.
fn signature_blob(algorithm: &str, signature: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(8 + algorithm.len() + signature.len());
    write_string(&mut buf, algorithm);
    write_bytes(&mut buf, signature);
    buf.to_vec()
}

/// Trait for host key operations
///
/// Implemented by every signing key type. The server role signs exchange
/// hashes with it; user authentication signs session data with it.
pub trait HostKey: Send + Sync {
    /// Get the default signature algorithm
    fn algorithm(&self) -> HostKeyAlgorithm;

    /// Get the public key in SSH wire format
    ///
    /// Format: string key_type, followed by key-specific data
    fn public_key_bytes(&self) -> Vec<u8>;

    /// Sign data with the default algorithm and return an SSH signature blob
    fn sign(&self, data: &[u8]) -> SshResult<Vec<u8>>;

    /// Signature algorithms this key can produce, most preferred first
    fn algorithms(&self) -> Vec<HostKeyAlgorithm> {
        vec![self.algorithm()]
    }

    /// Sign data with a specific algorithm
    fn sign_as(&self, algorithm: HostKeyAlgorithm, data: &[u8]) -> SshResult<Vec<u8>> {
        if algorithm == self.algorithm() {
            self.sign(data)
        } else {
            Err(SshError::HostKeySign(format!(
                "{} key cannot produce {} signatures",
                self.algorithm().key_type(),
                algorithm.name()
            )))
        }
    }

    /// Get the algorithm name
    fn algorithm_name(&self) -> &'static str {
        self.algorithm().name()
    }
}

/// Ed25519 host key (ssh-ed25519)
///
/// Provides 128-bit security with constant-time operations.
#[derive(Clone)]
pub struct Ed25519HostKey {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Ed25519HostKey {
    /// Generate a new Ed25519 key pair
    pub fn generate() -> SshResult<Self> {
        let mut csprng = rand::thread_rng();
        let secret_bytes: [u8; SECRET_KEY_LENGTH] = rand::Rng::gen(&mut csprng);
        Self::from_bytes(&secret_bytes)
    }

    /// Create from raw key bytes (32-byte seed)
    pub fn from_bytes(secret_bytes: &[u8]) -> SshResult<Self> {
        let key_bytes: [u8; 32] = secret_bytes
            .try_into()
            .map_err(|_| SshError::KeyFile("Ed25519 secret key must be 32 bytes".to_string()))?;
        let signing_key = SigningKey::from_bytes(&key_bytes);
        let verifying_key = signing_key.verifying_key();
        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    /// Get the secret key bytes (32 bytes)
    ///
    /// WARNING: This exposes the private key material. Handle with care.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }

    /// Get the 32-byte public key
    pub fn public_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Verify a raw 64-byte Ed25519 signature
    pub fn verify(public_key: &[u8], data: &[u8], signature: &[u8]) -> SshResult<bool> {
        let key_bytes: [u8; 32] = public_key
            .try_into()
            .map_err(|_| SshError::HostKeyInit("Ed25519 public key must be 32 bytes".to_string()))?;
        let sig_bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| SshError::HostKeySign("Ed25519 signature must be 64 bytes".to_string()))?;

        let verifying_key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| SshError::HostKeyInit(format!("Invalid Ed25519 public key: {}", e)))?;
        let signature = Signature::from_bytes(&sig_bytes);

        Ok(verifying_key.verify(data, &signature).is_ok())
    }
}

impl HostKey for Ed25519HostKey {
    fn algorithm(&self) -> HostKeyAlgorithm {
        HostKeyAlgorithm::SshEd25519
    }

    fn public_key_bytes(&self) -> Vec<u8> {
        PublicKey::Ed25519(self.public_bytes()).to_blob()
    }

    fn sign(&self, data: &[u8]) -> SshResult<Vec<u8>> {
        let signature = self.signing_key.sign(data);
        Ok(signature_blob("ssh-ed25519", &signature.to_bytes()))
    }
}

impl std::fmt::Debug for Ed25519HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519HostKey")
            .field("algorithm", &"ssh-ed25519")
            .field("public_key", &hex::encode(self.verifying_key.as_bytes()))
            .finish_non_exhaustive()
    }
}

macro_rules! ecdsa_host_key {
    ($(#[$doc:meta])* $name:ident, $krate:ident, $curve:expr) => {
        $(#[$doc])*
        pub struct $name {
            signing_key: $krate::ecdsa::SigningKey,
            verifying_key: $krate::ecdsa::VerifyingKey,
        }

        impl $name {
            /// Generate a new key pair
            pub fn generate() -> SshResult<Self> {
                let signing_key = $krate::ecdsa::SigningKey::random(&mut rand::thread_rng());
                let verifying_key = $krate::ecdsa::VerifyingKey::from(&signing_key);
                Ok(Self {
                    signing_key,
                    verifying_key,
                })
            }

            /// Create from the big-endian private scalar
            pub fn from_scalar(d: &[u8]) -> SshResult<Self> {
                let padded = pad_be(d, $curve.field_size()).ok_or_else(|| {
                    SshError::KeyFile(format!("{} private scalar too long", $curve.name()))
                })?;
                let signing_key = $krate::ecdsa::SigningKey::from_slice(&padded).map_err(|e| {
                    SshError::KeyFile(format!("Invalid {} private key: {}", $curve.name(), e))
                })?;
                let verifying_key = $krate::ecdsa::VerifyingKey::from(&signing_key);
                Ok(Self {
                    signing_key,
                    verifying_key,
                })
            }

            /// Get the big-endian private scalar
            pub fn scalar_bytes(&self) -> Zeroizing<Vec<u8>> {
                Zeroizing::new(self.signing_key.to_bytes().to_vec())
            }

            /// Get the uncompressed public point
            pub fn public_point(&self) -> Vec<u8> {
                #[allow(unused_imports)]
                use $krate::elliptic_curve::sec1::ToEncodedPoint;
                self.verifying_key.to_encoded_point(false).as_bytes().to_vec()
            }

            /// Verify a fixed-width `r || s` signature
            pub fn verify(public_point: &[u8], data: &[u8], signature: &[u8]) -> SshResult<bool> {
                use signature::Verifier;

                let verifying_key = $krate::ecdsa::VerifyingKey::from_sec1_bytes(public_point)
                    .map_err(|e| {
                        SshError::HostKeyInit(format!("Invalid {} public key: {}", $curve.name(), e))
                    })?;
                let sig = $krate::ecdsa::Signature::from_slice(signature).map_err(|e| {
                    SshError::HostKeySign(format!("Invalid {} signature: {}", $curve.name(), e))
                })?;

                Ok(verifying_key.verify(data, &sig).is_ok())
            }
        }

        impl HostKey for $name {
            fn algorithm(&self) -> HostKeyAlgorithm {
                $curve.algorithm()
            }

            fn public_key_bytes(&self) -> Vec<u8> {
                PublicKey::Ecdsa {
                    curve: $curve,
                    point: self.public_point(),
                }
                .to_blob()
            }

            fn sign(&self, data: &[u8]) -> SshResult<Vec<u8>> {
                use signature::Signer;

                let signature: $krate::ecdsa::Signature = self
                    .signing_key
                    .try_sign(data)
                    .map_err(|e| SshError::HostKeySign(format!("ECDSA signing failed: {}", e)))?;
                let (r, s) = signature.split_bytes();

                let mut inner = BytesMut::new();
                write_mpint(&mut inner, &r);
                write_mpint(&mut inner, &s);
                Ok(signature_blob($curve.algorithm().name(), &inner))
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("algorithm", &$curve.algorithm().name())
                    .field("public_key", &hex::encode(self.public_point()))
                    .finish_non_exhaustive()
            }
        }
    };
}

ecdsa_host_key!(
    /// ECDSA key with P-256 curve (ecdsa-sha2-nistp256), SHA-256 digests
    EcdsaP256HostKey,
    p256,
    EcdsaCurve::NistP256
);

ecdsa_host_key!(
    /// ECDSA key with P-384 curve (ecdsa-sha2-nistp384), SHA-384 digests
    EcdsaP384HostKey,
    p384,
    EcdsaCurve::NistP384
);

ecdsa_host_key!(
    /// ECDSA key with P-521 curve (ecdsa-sha2-nistp521), SHA-512 digests
    EcdsaP521HostKey,
    p521,
    EcdsaCurve::NistP521
);

/// RSA key signing with `rsa-sha2-256` or `rsa-sha2-512`.
///
/// Keys are `ssh-rsa` on the wire; SHA-1 signatures are never produced.
#[derive(Clone)]
pub struct RsaHostKey {
    key: rsa::RsaPrivateKey,
}

impl RsaHostKey {
    /// Wraps a parsed RSA private key.
    pub fn new(key: rsa::RsaPrivateKey) -> Self {
        Self { key }
    }

    /// Generates a fresh key of `bits` size.
    pub fn generate(bits: usize) -> SshResult<Self> {
        let key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), bits)
            .map_err(|e| SshError::KeyFile(format!("RSA key generation failed: {}", e)))?;
        Ok(Self { key })
    }

    /// Borrow the underlying key.
    pub fn inner(&self) -> &rsa::RsaPrivateKey {
        &self.key
    }

    /// Returns the public key.
    pub fn public_key(&self) -> PublicKey {
        use rsa::traits::PublicKeyParts;
        PublicKey::Rsa {
            e: self.key.e().to_bytes_be(),
            n: self.key.n().to_bytes_be(),
        }
    }
}

impl HostKey for RsaHostKey {
    fn algorithm(&self) -> HostKeyAlgorithm {
        HostKeyAlgorithm::RsaSha2_256
    }

    fn algorithms(&self) -> Vec<HostKeyAlgorithm> {
        vec![HostKeyAlgorithm::RsaSha2_512, HostKeyAlgorithm::RsaSha2_256]
    }

    fn public_key_bytes(&self) -> Vec<u8> {
        self.public_key().to_blob()
    }

    fn sign(&self, data: &[u8]) -> SshResult<Vec<u8>> {
        self.sign_as(HostKeyAlgorithm::RsaSha2_256, data)
    }

    fn sign_as(&self, algorithm: HostKeyAlgorithm, data: &[u8]) -> SshResult<Vec<u8>> {
        use signature::Signer;

        let failed = |e: signature::Error| SshError::HostKeySign(format!("RSA signing failed: {}", e));
        let raw = match algorithm {
            HostKeyAlgorithm::RsaSha2_256 => rsa::pkcs1v15::SigningKey::<Sha256>::new(self.key.clone())
                .try_sign(data)
                .map_err(failed)?
                .to_vec(),
            HostKeyAlgorithm::RsaSha2_512 => rsa::pkcs1v15::SigningKey::<Sha512>::new(self.key.clone())
                .try_sign(data)
                .map_err(failed)?
                .to_vec(),
            other => {
                return Err(SshError::HostKeySign(format!(
                    "RSA keys do not sign {}",
                    other.name()
                )))
            }
        };
        Ok(signature_blob(algorithm.name(), &raw))
    }
}

impl std::fmt::Debug for RsaHostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use rsa::traits::PublicKeyParts;
        f.debug_struct("RsaHostKey")
            .field("bits", &(self.key.size() * 8))
            .finish_non_exhaustive()
    }
}
