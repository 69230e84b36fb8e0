//! SSH key exchange (KEX) messages and algorithm negotiation (RFC 4253 Section 7).
//!
//! This module implements:
//! - SSH_MSG_KEXINIT message
//! - SSH_MSG_KEXDH_INIT / SSH_MSG_KEXDH_REPLY (shared by ECDH, RFC 5656)
//! - SSH_MSG_NEWKEYS message
//! - Ordered algorithm preferences per category ([`Preferences`])
//! - Algorithm negotiation ([`negotiate`])
//!
//! # Key Exchange Flow
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Algorithm negotiation (first client preference the server supports)
//! 3. Key exchange (DH or ECDH), see [`kex_dh`](crate::ssh::kex_dh)
//! 4. Both sides send SSH_MSG_NEWKEYS
//! 5. Switch to the negotiated keys
//!
//! # Example
//!
//! ```rust
//! use sshwire_proto::ssh::kex::{KexInit, NewKeys};
//!
//! let kexinit = KexInit::new_default();
//! assert!(kexinit.kex_algorithms().contains(&"curve25519-sha256".to_string()));
//!
//! let bytes = NewKeys::new().to_bytes();
//! assert_eq!(bytes, vec![21]);
//! ```

use bytes::{BufMut, BytesMut};
use rand::RngCore;
use sshwire_platform::{SshError, SshResult};

use crate::ssh::crypto::{CipherAlgorithm, CompressionAlgorithm, MacAlgorithm};
use crate::ssh::hostkey::HostKeyAlgorithm;
use crate::ssh::kex_dh::KexAlgorithm;
use crate::ssh::message::MessageType;
use crate::ssh::wire::{read_bool, read_mpint, read_name_list, read_slice, read_u32, write_bytes, write_mpint, write_name_list};

/// Algorithm category negotiated during key exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodType {
    /// Key exchange method
    Kex,
    /// Server host key algorithm
    HostKey,
    /// Cipher, client to server
    CryptCs,
    /// Cipher, server to client
    CryptSc,
    /// MAC, client to server
    MacCs,
    /// MAC, server to client
    MacSc,
    /// Compression, client to server
    CompCs,
    /// Compression, server to client
    CompSc,
    /// Language tag, client to server
    LangCs,
    /// Language tag, server to client
    LangSc,
}

impl MethodType {
    /// All categories in KEXINIT order.
    pub const ALL: [MethodType; 10] = [
        MethodType::Kex,
        MethodType::HostKey,
        MethodType::CryptCs,
        MethodType::CryptSc,
        MethodType::MacCs,
        MethodType::MacSc,
        MethodType::CompCs,
        MethodType::CompSc,
        MethodType::LangCs,
        MethodType::LangSc,
    ];

    fn index(self) -> usize {
        match self {
            MethodType::Kex => 0,
            MethodType::HostKey => 1,
            MethodType::CryptCs => 2,
            MethodType::CryptSc => 3,
            MethodType::MacCs => 4,
            MethodType::MacSc => 5,
            MethodType::CompCs => 6,
            MethodType::CompSc => 7,
            MethodType::LangCs => 8,
            MethodType::LangSc => 9,
        }
    }
}

/// Returns the algorithm names this engine implements for a category.
///
/// Language tags are free-form, so the list for them is empty.
pub fn supported_algorithms(method: MethodType) -> Vec<&'static str> {
    match method {
        MethodType::Kex => KexAlgorithm::ALL.iter().map(|a| a.name()).collect(),
        MethodType::HostKey => HostKeyAlgorithm::ALL.iter().map(|a| a.name()).collect(),
        MethodType::CryptCs | MethodType::CryptSc => {
            CipherAlgorithm::ALL.iter().map(|a| a.name()).collect()
        }
        MethodType::MacCs | MethodType::MacSc => {
            MacAlgorithm::ALL.iter().map(|a| a.name()).collect()
        }
        MethodType::CompCs | MethodType::CompSc => CompressionAlgorithm::ALL
            .iter()
            .map(|a| a.name())
            .collect(),
        MethodType::LangCs | MethodType::LangSc => vec![],
    }
}

/// Ordered algorithm preference lists, one per [`MethodType`].
///
/// Used to build the local KEXINIT. The most preferred algorithm comes
/// first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preferences {
    lists: [Vec<String>; 10],
}

impl Default for Preferences {
    fn default() -> Self {
        let owned = |names: Vec<&'static str>| -> Vec<String> { names.into_iter().map(String::from).collect() };
        let mut lists: [Vec<String>; 10] = Default::default();
        for method in MethodType::ALL {
            lists[method.index()] = owned(supported_algorithms(method));
        }
        let mut prefs = Self { lists };
        prefs.set_compression(false);
        prefs
    }
}

impl Preferences {
    /// Replaces the preference list for one category.
    ///
    /// `prefs` is a comma-separated list. Unknown names are dropped; the
    /// order of the remaining ones is kept.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::MethodNotSupported`] if no listed algorithm is
    /// implemented.
    pub fn set(&mut self, method: MethodType, prefs: &str) -> SshResult<()> {
        let requested = prefs
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty());

        let list: Vec<String> = match method {
            MethodType::LangCs | MethodType::LangSc => requested.map(String::from).collect(),
            _ => {
                let supported = supported_algorithms(method);
                let list: Vec<String> = requested
                    .filter(|name| supported.contains(name))
                    .map(String::from)
                    .collect();
                if list.is_empty() {
                    return Err(SshError::MethodNotSupported(format!(
                        "None of the preferred {:?} methods are supported: {}",
                        method, prefs
                    )));
                }
                list
            }
        };

        self.lists[method.index()] = list;
        Ok(())
    }

    /// Returns the preference list for one category.
    pub fn get(&self, method: MethodType) -> &[String] {
        &self.lists[method.index()]
    }

    /// Enables or disables compression in both directions.
    pub fn set_compression(&mut self, enabled: bool) {
        let list: Vec<String> = if enabled {
            vec!["zlib@openssh.com".into(), "zlib".into(), "none".into()]
        } else {
            vec!["none".into()]
        };
        self.lists[MethodType::CompCs.index()] = list.clone();
        self.lists[MethodType::CompSc.index()] = list;
    }
}

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
///
/// # Wire Format
///
/// ```text
/// byte         SSH_MSG_KEXINIT
/// byte[16]     cookie (random bytes)
/// name-list    kex_algorithms
/// name-list    server_host_key_algorithms
/// name-list    encryption_algorithms_client_to_server
/// name-list    encryption_algorithms_server_to_client
/// name-list    mac_algorithms_client_to_server
/// name-list    mac_algorithms_server_to_client
/// name-list    compression_algorithms_client_to_server
/// name-list    compression_algorithms_server_to_client
/// name-list    languages_client_to_server
/// name-list    languages_server_to_client
/// boolean      first_kex_packet_follows
/// uint32       0 (reserved for future extension)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    cookie: [u8; 16],
    lists: [Vec<String>; 10],
    first_kex_packet_follows: bool,
}

impl KexInit {
    /// Creates a KEXINIT with a fresh random cookie from the given preferences.
    pub fn from_preferences(prefs: &Preferences) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);

        Self {
            cookie,
            lists: prefs.lists.clone(),
            first_kex_packet_follows: false,
        }
    }

    /// Creates a KEXINIT advertising every supported algorithm, without
    /// compression.
    pub fn new_default() -> Self {
        Self::from_preferences(&Preferences::default())
    }

    /// Restricts the host key algorithm list to those in `available`,
    /// keeping order. Used by the server role, which may only offer
    /// algorithms for keys it holds.
    pub fn retain_host_key_algorithms(&mut self, available: &[HostKeyAlgorithm]) {
        self.lists[MethodType::HostKey.index()]
            .retain(|name| available.iter().any(|a| a.name() == name));
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the list for one category.
    pub fn algorithms(&self, method: MethodType) -> &[String] {
        &self.lists[method.index()]
    }

    /// Returns the key exchange algorithms.
    pub fn kex_algorithms(&self) -> &[String] {
        self.algorithms(MethodType::Kex)
    }

    /// Returns the server host key algorithms.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        self.algorithms(MethodType::HostKey)
    }

    /// Returns the client-to-server encryption algorithms.
    pub fn encryption_algorithms_client_to_server(&self) -> &[String] {
        self.algorithms(MethodType::CryptCs)
    }

    /// Returns the server-to-client encryption algorithms.
    pub fn encryption_algorithms_server_to_client(&self) -> &[String] {
        self.algorithms(MethodType::CryptSc)
    }

    /// Returns the client-to-server MAC algorithms.
    pub fn mac_algorithms_client_to_server(&self) -> &[String] {
        self.algorithms(MethodType::MacCs)
    }

    /// Returns the server-to-client MAC algorithms.
    pub fn mac_algorithms_server_to_client(&self) -> &[String] {
        self.algorithms(MethodType::MacSc)
    }

    /// Returns the client-to-server compression algorithms.
    pub fn compression_algorithms_client_to_server(&self) -> &[String] {
        self.algorithms(MethodType::CompCs)
    }

    /// Returns the server-to-client compression algorithms.
    pub fn compression_algorithms_server_to_client(&self) -> &[String] {
        self.algorithms(MethodType::CompSc)
    }

    /// Returns whether a guessed key exchange packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Serializes the KEXINIT message, including the message byte.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::KexInit as u8);
        buf.put_slice(&self.cookie);
        for list in &self.lists {
            write_name_list(&mut buf, list);
        }
        buf.put_u8(u8::from(self.first_kex_packet_follows));
        buf.put_u32(0);
        buf.to_vec()
    }

    /// Parses a KEXINIT message.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Protocol`] if:
    /// - Message type is not SSH_MSG_KEXINIT (20)
    /// - Message is truncated
    /// - A name-list is not valid UTF-8
    pub fn from_bytes(data: &[u8]) -> SshResult<Self> {
        if data.first() != Some(&(MessageType::KexInit as u8)) {
            return Err(SshError::Protocol(format!(
                "Invalid message type: expected 20 (SSH_MSG_KEXINIT), got {:?}",
                data.first()
            )));
        }
        if data.len() < 17 {
            return Err(SshError::Protocol(format!(
                "KEXINIT message too short: {} bytes (minimum 17)",
                data.len()
            )));
        }

        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(&data[1..17]);
        let mut offset = 17;

        let mut lists: [Vec<String>; 10] = Default::default();
        for list in lists.iter_mut() {
            *list = read_name_list(data, &mut offset)?;
        }
        let first_kex_packet_follows = read_bool(data, &mut offset)?;
        let _reserved = read_u32(data, &mut offset)?;

        Ok(Self {
            cookie,
            lists,
            first_kex_packet_follows,
        })
    }
}

/// Algorithms agreed by both sides for one key exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// Key exchange method
    pub kex: KexAlgorithm,
    /// Host key signature algorithm
    pub host_key: HostKeyAlgorithm,
    /// Cipher, client to server
    pub cipher_cs: CipherAlgorithm,
    /// Cipher, server to client
    pub cipher_sc: CipherAlgorithm,
    /// MAC, client to server (`None` for AEAD ciphers)
    pub mac_cs: Option<MacAlgorithm>,
    /// MAC, server to client (`None` for AEAD ciphers)
    pub mac_sc: Option<MacAlgorithm>,
    /// Compression, client to server
    pub comp_cs: CompressionAlgorithm,
    /// Compression, server to client
    pub comp_sc: CompressionAlgorithm,
    /// Language, client to server (empty when none agreed)
    pub lang_cs: String,
    /// Language, server to client (empty when none agreed)
    pub lang_sc: String,
}

impl Negotiated {
    /// Returns the agreed algorithm name for a category.
    pub fn name(&self, method: MethodType) -> String {
        match method {
            MethodType::Kex => self.kex.name().to_string(),
            MethodType::HostKey => self.host_key.name().to_string(),
            MethodType::CryptCs => self.cipher_cs.name().to_string(),
            MethodType::CryptSc => self.cipher_sc.name().to_string(),
            MethodType::MacCs => mac_name(self.cipher_cs, self.mac_cs),
            MethodType::MacSc => mac_name(self.cipher_sc, self.mac_sc),
            MethodType::CompCs => self.comp_cs.name().to_string(),
            MethodType::CompSc => self.comp_sc.name().to_string(),
            MethodType::LangCs => self.lang_cs.clone(),
            MethodType::LangSc => self.lang_sc.clone(),
        }
    }
}

fn mac_name(cipher: CipherAlgorithm, mac: Option<MacAlgorithm>) -> String {
    match mac {
        Some(mac) => mac.name().to_string(),
        None if cipher.is_aead() => cipher.name().to_string(),
        None => "none".to_string(),
    }
}

/// Negotiates a single algorithm (RFC 4253 Section 7.1).
///
/// The chosen algorithm is the first one on the client's list that is also
/// on the server's list.
///
/// # Errors
///
/// Returns [`SshError::KexFailure`] if no common algorithm exists.
///
/// # Example
///
/// ```rust
/// use sshwire_proto::ssh::kex::negotiate_algorithm;
///
/// let client = vec!["aes256-ctr".to_string(), "aes128-ctr".to_string()];
/// let server = vec!["aes128-ctr".to_string(), "aes256-ctr".to_string()];
///
/// assert_eq!(negotiate_algorithm(&client, &server).unwrap(), "aes256-ctr");
/// ```
pub fn negotiate_algorithm(client_list: &[String], server_list: &[String]) -> SshResult<String> {
    client_list
        .iter()
        .find(|alg| server_list.contains(alg))
        .cloned()
        .ok_or_else(|| {
            SshError::KexFailure(format!(
                "No common algorithm: client={:?}, server={:?}",
                client_list, server_list
            ))
        })
}

fn negotiate_category(client: &KexInit, server: &KexInit, method: MethodType) -> SshResult<String> {
    negotiate_algorithm(client.algorithms(method), server.algorithms(method)).map_err(|_| {
        SshError::KexFailure(format!(
            "No common {:?} algorithm: client={:?}, server={:?}",
            method,
            client.algorithms(method),
            server.algorithms(method)
        ))
    })
}

fn negotiate_mac(
    client: &KexInit,
    server: &KexInit,
    method: MethodType,
    cipher: CipherAlgorithm,
) -> SshResult<Option<MacAlgorithm>> {
    if cipher.is_aead() {
        return Ok(None);
    }
    let name = negotiate_category(client, server, method)?;
    MacAlgorithm::from_name(&name)
        .map(Some)
        .ok_or_else(|| SshError::KexFailure(format!("Unsupported MAC: {}", name)))
}

fn negotiate_language(client: &KexInit, server: &KexInit, method: MethodType) -> String {
    negotiate_algorithm(client.algorithms(method), server.algorithms(method)).unwrap_or_default()
}

/// Negotiates every category from the client's and server's KEXINIT.
///
/// MAC negotiation is skipped for AEAD ciphers, which authenticate packets
/// themselves.
///
/// # Errors
///
/// Returns [`SshError::KexFailure`] if any mandatory category has no
/// common algorithm.
pub fn negotiate(client: &KexInit, server: &KexInit) -> SshResult<Negotiated> {
    let kex_name = negotiate_category(client, server, MethodType::Kex)?;
    let kex = KexAlgorithm::from_name(&kex_name)
        .ok_or_else(|| SshError::KexFailure(format!("Unsupported kex: {}", kex_name)))?;

    let host_key_name = negotiate_category(client, server, MethodType::HostKey)?;
    let host_key = HostKeyAlgorithm::from_name(&host_key_name).ok_or_else(|| {
        SshError::KexFailure(format!("Unsupported host key algorithm: {}", host_key_name))
    })?;

    let cipher = |method| -> SshResult<CipherAlgorithm> {
        let name = negotiate_category(client, server, method)?;
        CipherAlgorithm::from_name(&name)
            .ok_or_else(|| SshError::KexFailure(format!("Unsupported cipher: {}", name)))
    };
    let cipher_cs = cipher(MethodType::CryptCs)?;
    let cipher_sc = cipher(MethodType::CryptSc)?;

    let mac_cs = negotiate_mac(client, server, MethodType::MacCs, cipher_cs)?;
    let mac_sc = negotiate_mac(client, server, MethodType::MacSc, cipher_sc)?;

    let comp = |method| -> SshResult<CompressionAlgorithm> {
        let name = negotiate_category(client, server, method)?;
        CompressionAlgorithm::from_name(&name)
            .ok_or_else(|| SshError::KexFailure(format!("Unsupported compression: {}", name)))
    };
    let comp_cs = comp(MethodType::CompCs)?;
    let comp_sc = comp(MethodType::CompSc)?;

    Ok(Negotiated {
        kex,
        host_key,
        cipher_cs,
        cipher_sc,
        mac_cs,
        mac_sc,
        comp_cs,
        comp_sc,
        lang_cs: negotiate_language(client, server, MethodType::LangCs),
        lang_sc: negotiate_language(client, server, MethodType::LangSc),
    })
}

/// Returns true if a guessed first key exchange packet used the right
/// algorithms (RFC 4253 Section 7).
///
/// The guess is right when both sides' first kex and host key algorithms
/// agree.
pub fn guess_matches(client: &KexInit, server: &KexInit) -> bool {
    client.kex_algorithms().first() == server.kex_algorithms().first()
        && client.server_host_key_algorithms().first()
            == server.server_host_key_algorithms().first()
}

/// SSH_MSG_KEXDH_INIT / SSH_MSG_KEX_ECDH_INIT.
///
/// Finite-field DH sends `e` as an mpint; ECDH and Curve25519 send `Q_C`
/// as a string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexDhInit {
    /// Client ephemeral public value
    pub public_key: Vec<u8>,
}

impl KexDhInit {
    /// Serializes the message.
    pub fn to_bytes(&self, as_mpint: bool) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::KexdhInit as u8);
        write_public_value(&mut buf, &self.public_key, as_mpint);
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8], as_mpint: bool) -> SshResult<Self> {
        if data.first() != Some(&(MessageType::KexdhInit as u8)) {
            return Err(SshError::Protocol(
                "Expected SSH_MSG_KEXDH_INIT".to_string(),
            ));
        }
        let mut offset = 1;
        let public_key = read_public_value(data, &mut offset, as_mpint)?;
        Ok(Self { public_key })
    }
}

/// SSH_MSG_KEXDH_REPLY / SSH_MSG_KEX_ECDH_REPLY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexDhReply {
    /// Server public host key blob (K_S)
    pub host_key: Vec<u8>,
    /// Server ephemeral public value (f or Q_S)
    pub public_key: Vec<u8>,
    /// Signature blob over the exchange hash
    pub signature: Vec<u8>,
}

impl KexDhReply {
    /// Serializes the message.
    pub fn to_bytes(&self, as_mpint: bool) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::KexdhReply as u8);
        write_bytes(&mut buf, &self.host_key);
        write_public_value(&mut buf, &self.public_key, as_mpint);
        write_bytes(&mut buf, &self.signature);
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8], as_mpint: bool) -> SshResult<Self> {
        if data.first() != Some(&(MessageType::KexdhReply as u8)) {
            return Err(SshError::Protocol(
                "Expected SSH_MSG_KEXDH_REPLY".to_string(),
            ));
        }
        let mut offset = 1;
        let host_key = read_slice(data, &mut offset)?.to_vec();
        let public_key = read_public_value(data, &mut offset, as_mpint)?;
        let signature = read_slice(data, &mut offset)?.to_vec();
        Ok(Self {
            host_key,
            public_key,
            signature,
        })
    }
}

fn write_public_value(buf: &mut BytesMut, value: &[u8], as_mpint: bool) {
    if as_mpint {
        write_mpint(buf, value);
    } else {
        write_bytes(buf, value);
    }
}

fn read_public_value(data: &[u8], offset: &mut usize, as_mpint: bool) -> SshResult<Vec<u8>> {
    if as_mpint {
        read_mpint(data, offset)
    } else {
        Ok(read_slice(data, offset)?.to_vec())
    }
}

/// SSH_MSG_NEWKEYS message (RFC 4253 Section 7.3).
///
/// ```text
/// byte    SSH_MSG_NEWKEYS (21)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NewKeys;

impl NewKeys {
    /// Creates a new SSH_MSG_NEWKEYS message.
    pub const fn new() -> Self {
        Self
    }

    /// Serializes the NEWKEYS message to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::NewKeys as u8]
    }

    /// Parses a NEWKEYS message from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Protocol`] if the message type is not 21.
    pub fn from_bytes(data: &[u8]) -> SshResult<Self> {
        match data.first() {
            Some(&b) if b == MessageType::NewKeys as u8 => Ok(Self),
            other => Err(SshError::Protocol(format!(
                "Invalid message type: expected 21 (SSH_MSG_NEWKEYS), got {:?}",
                other
            ))),
        }
    }
}
