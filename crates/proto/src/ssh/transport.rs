//! SSH transport layer (RFC 4253).
//!
//! [`Transport`] owns the byte stream, the packet codec and the key exchange
//! state. It performs no blocking of its own: every method makes as much
//! progress as the stream allows and returns [`SshError::WouldBlock`] when
//! the stream does. Bytes already produced stay queued, so calling the same
//! method again resumes where it stopped.
//!
//! # Transport States
//!
//! 1. **VersionExchange** - identification strings are exchanged
//! 2. **KeyExchange** - the first key exchange runs
//! 3. **Established** - packets are encrypted; rekeying happens in place
//! 4. **Closed** - DISCONNECT was sent or received, or a fatal error occurred
//!
//! Each key exchange moves through [`KexPhase`]:
//! `Init -> AlgorithmNegotiation -> KeyExchangeInProgress ->
//! HostKeyVerification -> KeysInstalled`.
//!
//! # Rekeying
//!
//! Either side may send KEXINIT after the first exchange. The local side
//! starts one itself after [`TransportConfig::rekey_bytes_limit`] bytes or
//! [`TransportConfig::rekey_time_limit`]. Outbound connection-layer
//! packets produced meanwhile are held and released right after our
//! NEWKEYS, keeping channel data in order.
//!
//! Both roles are implemented. The client role backs
//! [`Session`](crate::ssh::session::Session); the server role answers key
//! exchanges with the host keys given to [`Transport::with_host_keys`].

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, BytesMut};
use sshwire_platform::{BlockDirections, SessionStream, SshError, SshResult};
use tracing::{debug, info, trace, warn};

use crate::ssh::connection::{DEFAULT_PACKET_SIZE, DEFAULT_WINDOW_SIZE};
use crate::ssh::crypto::{
    CompressionAlgorithm, Compressor, DecryptionKey, Decompressor, EncryptionKey, MacKey,
};
use crate::ssh::hostkey::{verify_host_signature, HostKey, HostKeyAlgorithm, PublicKey};
use crate::ssh::kex::{
    guess_matches, negotiate, KexDhInit, KexDhReply, KexInit, Negotiated, NewKeys, Preferences,
};
use crate::ssh::kex_dh::{compute_exchange_hash, derive_key, ExchangeHashInput, KeyExchange};
use crate::ssh::message::{is_transport_message, MessageType};
use crate::ssh::packet::{Decoded, PacketCodec};
use crate::ssh::version::{scan_identification, Version};
use crate::ssh::wire::{read_bool, read_string, read_u32, write_string};

/// Default rekey threshold in bytes (1 GiB).
pub const DEFAULT_REKEY_BYTES: u64 = 1 << 30;

/// Default rekey interval (1 hour).
pub const DEFAULT_REKEY_INTERVAL: Duration = Duration::from_secs(3600);

const READ_CHUNK: usize = 16 * 1024;

/// Which end of the connection this transport plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates the connection and verifies the host key
    Client,
    /// Accepts the connection and signs with its host key
    Server,
}

/// Transport layer configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection role
    pub role: Role,

    /// Local identification string, without CR LF.
    pub banner: String,

    /// Algorithm preference lists for KEXINIT.
    pub preferences: Preferences,

    /// Bytes after which the local side starts a rekey (default: 1 GiB).
    pub rekey_bytes_limit: u64,

    /// Time after which the local side starts a rekey (default: 1 hour).
    pub rekey_time_limit: Duration,

    /// Receive window advertised for new channels (default: 2 MiB).
    pub window_size: u32,

    /// Maximum packet size advertised for new channels (default: 32 KiB).
    pub max_packet_size: u32,
}

impl TransportConfig {
    /// Creates a configuration with the default banner, algorithms and
    /// limits.
    ///
    /// ```rust
    /// use sshwire_proto::ssh::transport::{Role, TransportConfig};
    ///
    /// let config = TransportConfig::new(Role::Client);
    /// assert!(config.banner.starts_with("SSH-2.0-sshwire_"));
    /// assert_eq!(config.rekey_bytes_limit, 1 << 30);
    /// ```
    pub fn new(role: Role) -> Self {
        Self {
            role,
            banner: Version::default_banner(),
            preferences: Preferences::default(),
            rekey_bytes_limit: DEFAULT_REKEY_BYTES,
            rekey_time_limit: DEFAULT_REKEY_INTERVAL,
            window_size: DEFAULT_WINDOW_SIZE,
            max_packet_size: DEFAULT_PACKET_SIZE,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new(Role::Client)
    }
}

/// Transport lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Identification strings are being exchanged
    VersionExchange,
    /// The first key exchange is running
    KeyExchange,
    /// Keys are installed; connection-layer traffic may flow
    Established,
    /// The connection is gone
    Closed,
}

/// Progress of one key exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexPhase {
    /// No exchange running
    Init,
    /// KEXINIT sent, waiting for the peer's
    AlgorithmNegotiation,
    /// Ephemeral keys are being exchanged
    KeyExchangeInProgress,
    /// Checking the server signature over the exchange hash
    HostKeyVerification,
    /// NEWKEYS sent and received
    KeysInstalled,
}

/// Callback deciding whether a server host key is trusted.
///
/// Receives the raw host key blob. Returning `false` aborts the key exchange
/// before any key is installed.
pub type HostKeyVerifier = Box<dyn FnMut(&[u8]) -> bool + Send>;

/// SSH_MSG_DISCONNECT (RFC 4253 Section 11.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Reason code, see [`crate::ssh::message::disconnect`]
    pub reason: u32,
    /// Human readable description
    pub description: String,
    /// Language tag
    pub language: String,
}

impl Disconnect {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::Disconnect as u8);
        buf.put_u32(self.reason);
        write_string(&mut buf, &self.description);
        write_string(&mut buf, &self.language);
        buf.to_vec()
    }

    /// Parses the message. A missing language tag is tolerated.
    pub fn from_bytes(data: &[u8]) -> SshResult<Self> {
        if data.first() != Some(&(MessageType::Disconnect as u8)) {
            return Err(SshError::Protocol("Expected SSH_MSG_DISCONNECT".to_string()));
        }
        let mut offset = 1;
        let reason = read_u32(data, &mut offset)?;
        let description = read_string(data, &mut offset)?;
        let language = read_string(data, &mut offset).unwrap_or_default();
        Ok(Self {
            reason,
            description,
            language,
        })
    }
}

#[derive(Default)]
struct KexState {
    local_kexinit: Option<(KexInit, Vec<u8>)>,
    remote_kexinit: Option<(KexInit, Vec<u8>)>,
    negotiated: Option<Negotiated>,
    exchange: Option<KeyExchange>,
    client_public: Vec<u8>,
    ignore_next: bool,
    newkeys_sent: bool,
    newkeys_received: bool,
    pending_inbound: Option<(DecryptionKey, Option<MacKey>)>,
}

impl KexState {
    fn in_progress(&self) -> bool {
        self.local_kexinit.is_some() || self.remote_kexinit.is_some()
    }
}

/// Sans-async SSH transport over a [`SessionStream`].
pub struct Transport {
    config: TransportConfig,
    stream: Box<dyn SessionStream>,
    codec: PacketCodec,
    state: State,
    phase: KexPhase,

    inbuf: BytesMut,
    outbuf: BytesMut,
    blocked: BlockDirections,

    banner_queued: bool,
    local_version: String,
    remote_version: Option<String>,

    kex: KexState,
    held: VecDeque<Vec<u8>>,
    session_id: Option<Vec<u8>>,
    host_key: Option<Vec<u8>>,
    negotiated: Option<Negotiated>,
    host_keys: Vec<Arc<dyn HostKey>>,
    verifier: Option<HostKeyVerifier>,

    bytes_since_kex: u64,
    last_kex: Instant,
    kex_count: u32,
    authenticated: bool,
    disconnect_queued: bool,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("role", &self.config.role)
            .field("state", &self.state)
            .field("phase", &self.phase)
            .field("kex_count", &self.kex_count)
            .field("pending_out", &self.outbuf.len())
            .field("pending_in", &self.inbuf.len())
            .finish()
    }
}

impl Transport {
    /// Creates a transport over an already connected stream.
    pub fn new(stream: Box<dyn SessionStream>, config: TransportConfig) -> Self {
        Self {
            config,
            stream,
            codec: PacketCodec::new(),
            state: State::VersionExchange,
            phase: KexPhase::Init,
            inbuf: BytesMut::with_capacity(READ_CHUNK),
            outbuf: BytesMut::new(),
            blocked: BlockDirections::None,
            banner_queued: false,
            local_version: String::new(),
            remote_version: None,
            kex: KexState::default(),
            held: VecDeque::new(),
            session_id: None,
            host_key: None,
            negotiated: None,
            host_keys: Vec::new(),
            verifier: None,
            bytes_since_kex: 0,
            last_kex: Instant::now(),
            kex_count: 0,
            authenticated: false,
            disconnect_queued: false,
        }
    }

    /// Sets the host keys the server role signs with.
    pub fn with_host_keys(mut self, host_keys: Vec<Arc<dyn HostKey>>) -> Self {
        self.host_keys = host_keys;
        self
    }

    /// Installs a host key trust callback for the client role.
    pub fn set_host_key_verifier(&mut self, verifier: Option<HostKeyVerifier>) {
        self.verifier = verifier;
    }

    /// Returns the configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Returns the configuration for changes that apply to the next key
    /// exchange.
    pub fn config_mut(&mut self) -> &mut TransportConfig {
        &mut self.config
    }

    /// Returns the underlying stream.
    pub fn stream(&self) -> &dyn SessionStream {
        self.stream.as_ref()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Phase of the current or last key exchange.
    pub fn kex_phase(&self) -> KexPhase {
        self.phase
    }

    /// Number of completed key exchanges.
    pub fn kex_count(&self) -> u32 {
        self.kex_count
    }

    /// Returns true once the first key exchange completed.
    pub fn is_established(&self) -> bool {
        self.state == State::Established
    }

    /// Returns true after DISCONNECT or a fatal error.
    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Session identifier (the first exchange hash).
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// Server host key blob from the last key exchange.
    pub fn host_key(&self) -> Option<&[u8]> {
        self.host_key.as_deref()
    }

    /// Algorithms agreed in the last key exchange.
    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    /// Local identification string.
    pub fn local_version(&self) -> &str {
        &self.local_version
    }

    /// Remote identification string, once received.
    pub fn remote_version(&self) -> Option<&str> {
        self.remote_version.as_deref()
    }

    /// Directions the last `WouldBlock` was waiting on.
    pub fn block_directions(&self) -> BlockDirections {
        self.blocked
    }

    /// Returns true if outbound packets are compressed.
    pub fn is_compressing(&self) -> bool {
        self.codec.outbound_compressed()
    }

    /// Returns true while queued bytes wait to be written.
    pub fn has_pending_output(&self) -> bool {
        !self.outbuf.is_empty()
    }

    /// Runs the version exchange and first key exchange.
    ///
    /// Calling it again once established is a no-op.
    ///
    /// # Errors
    ///
    /// - [`SshError::WouldBlock`] if the stream is not ready; call again
    /// - [`SshError::Protocol`] for an invalid local or remote banner
    /// - [`SshError::KexFailure`] if no common algorithms exist
    /// - [`SshError::HostKeySign`]/[`SshError::HostKeyInit`] if the host key
    ///   does not verify or is rejected
    pub fn handshake(&mut self) -> SshResult<()> {
        let result = self.drive_handshake();
        self.check(result)
    }

    fn drive_handshake(&mut self) -> SshResult<()> {
        loop {
            self.blocked = BlockDirections::None;
            match self.state {
                State::VersionExchange => {
                    if !self.banner_queued {
                        let banner = Version::validate_local(&self.config.banner)?;
                        info!(banner = %banner, "Sending identification");
                        self.outbuf.extend_from_slice(banner.as_bytes());
                        self.outbuf.extend_from_slice(b"\r\n");
                        self.local_version = banner;
                        self.banner_queued = true;
                        self.start_kex()?;
                    }
                    self.flush().map_err(|e| match e {
                        SshError::SocketSend(msg) => SshError::BannerSend(msg),
                        other => other,
                    })?;

                    match scan_identification(&self.inbuf)? {
                        Some((line, used)) => {
                            self.inbuf.advance(used);
                            Version::parse(&line)?;
                            info!(remote = %line, "Received identification");
                            self.remote_version = Some(line);
                            self.state = State::KeyExchange;
                        }
                        None => {
                            self.fill().map_err(|e| match e {
                                SshError::SocketRecv(msg) | SshError::SocketDisconnect(msg) => {
                                    SshError::BannerRecv(msg)
                                }
                                other => other,
                            })?;
                        }
                    }
                }
                State::KeyExchange => {
                    if self.kex_count > 0 {
                        self.state = State::Established;
                        continue;
                    }
                    if let Some(payload) = self.next_packet()? {
                        return Err(SshError::Protocol(format!(
                            "Unexpected {} before key exchange completed",
                            describe(payload[0])
                        )));
                    }
                }
                State::Established => {
                    return match self.flush() {
                        Ok(()) | Err(SshError::WouldBlock) => Ok(()),
                        Err(e) => Err(e),
                    };
                }
                State::Closed => return Err(closed_error()),
            }
        }
    }

    /// Queues a payload for sending and writes as much as the stream takes.
    ///
    /// Connection-layer payloads produced during a key exchange are held
    /// until our NEWKEYS is out. Once this returns `Ok` the payload is
    /// committed: a later `WouldBlock` from [`flush`](Self::flush) only
    /// delays it.
    pub fn send_payload(&mut self, payload: &[u8]) -> SshResult<()> {
        let result = self.queue_payload(payload);
        self.check(result)
    }

    fn queue_payload(&mut self, payload: &[u8]) -> SshResult<()> {
        self.ensure_open()?;
        let msg = *payload
            .first()
            .ok_or_else(|| SshError::Protocol("Empty payload".to_string()))?;

        if is_transport_message(msg) {
            self.encode_payload(payload)?;
        } else {
            if self.state == State::Established {
                self.maybe_rekey()?;
            }
            if self.holding() || self.state != State::Established {
                trace!(message = %describe(msg), "Holding packet until key exchange completes");
                self.held.push_back(payload.to_vec());
            } else {
                self.encode_payload(payload)?;
            }
        }

        match self.flush() {
            Ok(()) | Err(SshError::WouldBlock) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Reads the next connection- or authentication-layer payload.
    ///
    /// Transport messages (IGNORE, DEBUG, key exchange, ...) are handled
    /// internally.
    pub fn read_packet(&mut self) -> SshResult<Vec<u8>> {
        loop {
            let result = self.next_packet();
            if let Some(payload) = self.check(result)? {
                return Ok(payload);
            }
        }
    }

    /// Writes queued bytes to the stream.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::WouldBlock`] if the stream cannot take all of
    /// them; the rest stays queued.
    pub fn flush(&mut self) -> SshResult<()> {
        while !self.outbuf.is_empty() {
            match self.stream.write(&self.outbuf) {
                Ok(0) => {
                    return Err(SshError::SocketSend("Connection closed".to_string()));
                }
                Ok(n) => self.outbuf.advance(n),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let err = SshError::from_send(e);
                    if err.is_would_block() {
                        self.blocked = self.blocked.union(BlockDirections::Outbound);
                    }
                    return Err(err);
                }
            }
        }
        self.stream.flush().map_err(SshError::from_send)
    }

    /// Starts a key exchange now, unless one is running.
    pub fn rekey(&mut self) -> SshResult<()> {
        self.ensure_open()?;
        if self.state != State::Established {
            return Err(SshError::InvalidRequest(
                "Rekey requested before the first key exchange".to_string(),
            ));
        }
        if !self.kex.in_progress() {
            info!("Starting requested rekey");
            self.start_kex()?;
        }
        match self.flush() {
            Ok(()) | Err(SshError::WouldBlock) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Changes the automatic rekey thresholds.
    pub fn set_rekey_limits(&mut self, bytes: u64, interval: Duration) {
        self.config.rekey_bytes_limit = bytes;
        self.config.rekey_time_limit = interval;
    }

    /// Activates delayed (`zlib@openssh.com`) compression.
    ///
    /// The client calls this on USERAUTH_SUCCESS, the server right after
    /// sending it.
    pub fn set_authenticated(&mut self) {
        self.authenticated = true;
        if let Some(negotiated) = self.negotiated.clone() {
            let (out_alg, in_alg) = self.compression_directions(&negotiated);
            self.apply_outbound_compression(out_alg);
            self.apply_inbound_compression(in_alg);
        }
    }

    /// Sends SSH_MSG_UNIMPLEMENTED for the last received packet.
    pub fn send_unimplemented(&mut self) -> SshResult<()> {
        let sequence = self.codec.recv_sequence().wrapping_sub(1);
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u8(MessageType::Unimplemented as u8);
        buf.put_u32(sequence);
        self.send_payload(&buf)
    }

    /// Sends SSH_MSG_DISCONNECT, flushes it and shuts the stream down.
    ///
    /// Resumable: after `WouldBlock`, call again to finish flushing.
    pub fn disconnect(&mut self, reason: u32, description: &str, language: &str) -> SshResult<()> {
        if self.state == State::Closed && !self.disconnect_queued {
            return Err(closed_error());
        }
        if !self.disconnect_queued {
            let message = Disconnect {
                reason,
                description: description.to_string(),
                language: language.to_string(),
            };
            info!(reason, description, "Sending disconnect");
            self.encode_payload(&message.to_bytes())?;
            self.disconnect_queued = true;
            self.state = State::Closed;
        }
        match self.flush() {
            Err(SshError::WouldBlock) => return Err(SshError::WouldBlock),
            Err(e) => debug!(error = %e, "Disconnect not delivered"),
            Ok(()) => {}
        }
        self.disconnect_queued = false;
        let _ = self.stream.shutdown();
        Ok(())
    }

    /// Marks the transport closed and shuts the stream down without
    /// sending anything.
    pub fn close(&mut self) {
        self.state = State::Closed;
        let _ = self.stream.shutdown();
    }

    fn check<T>(&mut self, result: SshResult<T>) -> SshResult<T> {
        if let Err(e) = &result {
            if e.is_fatal() && self.state != State::Closed {
                warn!(error = %e, "Transport failed");
                self.state = State::Closed;
                let _ = self.stream.shutdown();
            }
        }
        result
    }

    fn ensure_open(&self) -> SshResult<()> {
        if self.state == State::Closed {
            Err(closed_error())
        } else {
            Ok(())
        }
    }

    fn holding(&self) -> bool {
        self.kex.local_kexinit.is_some() && !self.kex.newkeys_sent
    }

    fn fill(&mut self) -> SshResult<()> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.state = State::Closed;
                    return Err(SshError::SocketDisconnect(
                        "Connection closed by peer".to_string(),
                    ));
                }
                Ok(n) => {
                    self.inbuf.extend_from_slice(&chunk[..n]);
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let err = SshError::from_recv(e);
                    if err.is_would_block() {
                        self.blocked = self.blocked.union(BlockDirections::Inbound);
                        if !self.outbuf.is_empty() {
                            self.blocked = self.blocked.union(BlockDirections::Outbound);
                        }
                    }
                    return Err(err);
                }
            }
        }
    }

    fn next_packet(&mut self) -> SshResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        self.blocked = BlockDirections::None;
        if self.state == State::Established {
            self.maybe_rekey()?;
        }
        match self.flush() {
            Ok(()) | Err(SshError::WouldBlock) => {}
            Err(e) => return Err(e),
        }

        loop {
            let before = self.inbuf.len();
            match self.codec.decode(&mut self.inbuf)? {
                Decoded::Packet(payload) => {
                    self.bytes_since_kex += (before - self.inbuf.len()) as u64;
                    return self.handle_packet(payload);
                }
                Decoded::NeedMoreData => self.fill()?,
            }
        }
    }

    fn handle_packet(&mut self, payload: Vec<u8>) -> SshResult<Option<Vec<u8>>> {
        let msg = *payload
            .first()
            .ok_or_else(|| SshError::Protocol("Empty packet".to_string()))?;

        if self.kex.ignore_next && (30..=49).contains(&msg) {
            self.kex.ignore_next = false;
            debug!("Discarding wrongly guessed key exchange packet");
            return Ok(None);
        }

        match msg {
            1 => {
                let disconnect = Disconnect::from_bytes(&payload)?;
                info!(
                    reason = disconnect.reason,
                    description = %disconnect.description,
                    "Peer disconnected"
                );
                self.state = State::Closed;
                let _ = self.stream.shutdown();
                Err(SshError::Disconnected {
                    reason: disconnect.reason,
                    description: disconnect.description,
                })
            }
            2 => {
                trace!("Received SSH_MSG_IGNORE");
                Ok(None)
            }
            3 => {
                let mut offset = 1;
                let sequence = read_u32(&payload, &mut offset)?;
                warn!(sequence, "Peer reported an unimplemented message");
                Ok(None)
            }
            4 => {
                let mut offset = 1;
                let always_display = read_bool(&payload, &mut offset)?;
                let message = read_string(&payload, &mut offset)?;
                debug!(always_display, message = %message, "Peer debug message");
                Ok(None)
            }
            20 => {
                self.on_kexinit(payload)?;
                Ok(None)
            }
            21 => {
                self.on_newkeys()?;
                Ok(None)
            }
            30..=49 => {
                self.on_kex_message(&payload)?;
                Ok(None)
            }
            5..=19 | 50..=255 => {
                if self.kex.remote_kexinit.is_some() && !self.kex.newkeys_received {
                    return Err(SshError::Protocol(format!(
                        "{} received during key exchange",
                        describe(msg)
                    )));
                }
                Ok(Some(payload))
            }
            _ => Err(SshError::Protocol(format!("Reserved message number {}", msg))),
        }
    }

    fn encode_payload(&mut self, payload: &[u8]) -> SshResult<()> {
        let wire = self.codec.encode(payload)?;
        self.bytes_since_kex += wire.len() as u64;
        self.outbuf.extend_from_slice(&wire);
        Ok(())
    }

    fn maybe_rekey(&mut self) -> SshResult<()> {
        if self.kex.in_progress() {
            return Ok(());
        }
        let by_bytes = self.bytes_since_kex >= self.config.rekey_bytes_limit;
        let by_time = self.last_kex.elapsed() >= self.config.rekey_time_limit;
        if by_bytes || by_time {
            info!(
                bytes = self.bytes_since_kex,
                by_time, "Rekey threshold reached"
            );
            self.start_kex()?;
        }
        Ok(())
    }

    fn start_kex(&mut self) -> SshResult<()> {
        let mut kexinit = KexInit::from_preferences(&self.config.preferences);
        if self.config.role == Role::Server {
            let available: Vec<HostKeyAlgorithm> =
                self.host_keys.iter().flat_map(|k| k.algorithms()).collect();
            kexinit.retain_host_key_algorithms(&available);
            if kexinit.server_host_key_algorithms().is_empty() {
                return Err(SshError::HostKeyInit(
                    "No host key matches the configured algorithms".to_string(),
                ));
            }
        }

        let payload = kexinit.to_bytes();
        self.encode_payload(&payload)?;
        self.kex.local_kexinit = Some((kexinit, payload));
        self.kex.newkeys_sent = false;
        self.kex.newkeys_received = false;
        self.phase = KexPhase::AlgorithmNegotiation;
        debug!("Sent KEXINIT");
        Ok(())
    }

    fn on_kexinit(&mut self, payload: Vec<u8>) -> SshResult<()> {
        if self.kex.remote_kexinit.is_some() {
            return Err(SshError::Protocol("Duplicate KEXINIT".to_string()));
        }
        let remote = KexInit::from_bytes(&payload)?;
        if self.kex.local_kexinit.is_none() {
            debug!("Peer started a key exchange");
            self.start_kex()?;
        }

        let (local, _) = self
            .kex
            .local_kexinit
            .as_ref()
            .ok_or_else(|| SshError::Protocol("Missing local KEXINIT".to_string()))?;
        let (client, server) = match self.config.role {
            Role::Client => (local, &remote),
            Role::Server => (&remote, local),
        };
        let negotiated = negotiate(client, server)?;
        if remote.first_kex_packet_follows() && !guess_matches(client, server) {
            self.kex.ignore_next = true;
        }

        info!(
            kex = negotiated.kex.name(),
            host_key = negotiated.host_key.name(),
            cipher_cs = negotiated.cipher_cs.name(),
            cipher_sc = negotiated.cipher_sc.name(),
            comp_cs = negotiated.comp_cs.name(),
            comp_sc = negotiated.comp_sc.name(),
            "Negotiated algorithms"
        );

        self.kex.remote_kexinit = Some((remote, payload));
        self.phase = KexPhase::KeyExchangeInProgress;

        if self.config.role == Role::Client {
            let exchange = KeyExchange::new(negotiated.kex)?;
            let public_key = exchange.public_key();
            let init = KexDhInit {
                public_key: public_key.clone(),
            };
            self.encode_payload(&init.to_bytes(negotiated.kex.uses_mpint()))?;
            self.kex.client_public = public_key;
            self.kex.exchange = Some(exchange);
        }
        self.kex.negotiated = Some(negotiated);
        Ok(())
    }

    fn on_kex_message(&mut self, payload: &[u8]) -> SshResult<()> {
        let negotiated = match (&self.kex.negotiated, self.phase) {
            (Some(n), KexPhase::KeyExchangeInProgress) => n.clone(),
            _ => {
                return Err(SshError::Protocol(format!(
                    "Unexpected {} outside key exchange",
                    describe(payload[0])
                )))
            }
        };
        let as_mpint = negotiated.kex.uses_mpint();

        match (self.config.role, payload[0]) {
            (Role::Client, 31) => {
                let reply = KexDhReply::from_bytes(payload, as_mpint)?;
                self.client_finish(&negotiated, reply)
            }
            (Role::Server, 30) => {
                let init = KexDhInit::from_bytes(payload, as_mpint)?;
                self.server_reply(&negotiated, init)
            }
            (_, other) => Err(SshError::Protocol(format!(
                "Unexpected key exchange message {}",
                other
            ))),
        }
    }

    fn client_finish(&mut self, negotiated: &Negotiated, reply: KexDhReply) -> SshResult<()> {
        self.phase = KexPhase::HostKeyVerification;
        let exchange = self
            .kex
            .exchange
            .take()
            .ok_or_else(|| SshError::Protocol("No key exchange in progress".to_string()))?;
        let shared = exchange.compute_shared_secret(&reply.public_key)?;

        let remote_version = self.remote_version.clone().unwrap_or_default();
        let hash = {
            let (local, remote) = self.kexinit_payloads()?;
            compute_exchange_hash(
                negotiated.kex,
                &ExchangeHashInput {
                    client_version: &self.local_version,
                    server_version: &remote_version,
                    client_kexinit: local,
                    server_kexinit: remote,
                    host_key: &reply.host_key,
                    client_public: &self.kex.client_public,
                    server_public: &reply.public_key,
                    shared_secret: &shared,
                },
            )
        };

        let key = PublicKey::from_blob(&reply.host_key)?;
        if key.key_type() != negotiated.host_key.key_type() {
            return Err(SshError::HostKeyInit(format!(
                "Server sent a {} key for {}",
                key.key_type(),
                negotiated.host_key.name()
            )));
        }
        let mut offset = 0;
        let sig_alg = read_string(&reply.signature, &mut offset)
            .map_err(|_| SshError::HostKeySign("Malformed signature blob".to_string()))?;
        if sig_alg != negotiated.host_key.name() {
            return Err(SshError::HostKeySign(format!(
                "Signature algorithm {} does not match negotiated {}",
                sig_alg,
                negotiated.host_key.name()
            )));
        }
        verify_host_signature(&reply.host_key, &hash, &reply.signature)?;

        if let Some(verifier) = self.verifier.as_mut() {
            if !verifier(&reply.host_key) {
                return Err(SshError::HostKeyInit(
                    "Host key rejected by verifier".to_string(),
                ));
            }
        }
        if let Some(previous) = &self.host_key {
            if previous != &reply.host_key {
                return Err(SshError::HostKeyInit(
                    "Host key changed during rekey".to_string(),
                ));
            }
        }
        debug!(key_type = key.key_type(), "Host key verified");

        self.host_key = Some(reply.host_key);
        self.install_keys(negotiated, &shared, &hash)
    }

    fn server_reply(&mut self, negotiated: &Negotiated, init: KexDhInit) -> SshResult<()> {
        let host_key = self
            .host_keys
            .iter()
            .find(|k| k.algorithms().contains(&negotiated.host_key))
            .cloned()
            .ok_or_else(|| {
                SshError::HostKeyInit(format!("No {} host key", negotiated.host_key.name()))
            })?;

        let exchange = KeyExchange::new(negotiated.kex)?;
        let server_public = exchange.public_key();
        let shared = exchange.compute_shared_secret(&init.public_key)?;
        let host_key_blob = host_key.public_key_bytes();

        let remote_version = self.remote_version.clone().unwrap_or_default();
        let hash = {
            let (local, remote) = self.kexinit_payloads()?;
            compute_exchange_hash(
                negotiated.kex,
                &ExchangeHashInput {
                    client_version: &remote_version,
                    server_version: &self.local_version,
                    client_kexinit: remote,
                    server_kexinit: local,
                    host_key: &host_key_blob,
                    client_public: &init.public_key,
                    server_public: &server_public,
                    shared_secret: &shared,
                },
            )
        };
        let signature = host_key.sign_as(negotiated.host_key, &hash)?;

        let reply = KexDhReply {
            host_key: host_key_blob.clone(),
            public_key: server_public,
            signature,
        };
        self.encode_payload(&reply.to_bytes(negotiated.kex.uses_mpint()))?;
        self.host_key = Some(host_key_blob);
        self.install_keys(negotiated, &shared, &hash)
    }

    fn kexinit_payloads(&self) -> SshResult<(&[u8], &[u8])> {
        match (&self.kex.local_kexinit, &self.kex.remote_kexinit) {
            (Some((_, local)), Some((_, remote))) => Ok((local, remote)),
            _ => Err(SshError::Protocol("KEXINIT missing".to_string())),
        }
    }

    /// Derives keys, sends NEWKEYS and switches the outbound direction.
    fn install_keys(&mut self, negotiated: &Negotiated, shared: &[u8], hash: &[u8]) -> SshResult<()> {
        let session_id = self.session_id.get_or_insert_with(|| hash.to_vec()).clone();
        let kex_hash = negotiated.kex.hash();
        let derive = |letter: u8, len: usize| derive_key(kex_hash, shared, hash, &session_id, letter, len);

        // RFC 4253 Section 7.2: A/C/E are client to server, B/D/F server to client
        let (out_letters, in_letters) = match self.config.role {
            Role::Client => ((b'A', b'C', b'E'), (b'B', b'D', b'F')),
            Role::Server => ((b'B', b'D', b'F'), (b'A', b'C', b'E')),
        };
        let (cipher_out, mac_out, cipher_in, mac_in) = match self.config.role {
            Role::Client => (
                negotiated.cipher_cs,
                negotiated.mac_cs,
                negotiated.cipher_sc,
                negotiated.mac_sc,
            ),
            Role::Server => (
                negotiated.cipher_sc,
                negotiated.mac_sc,
                negotiated.cipher_cs,
                negotiated.mac_cs,
            ),
        };

        let encryption = EncryptionKey::new(
            cipher_out,
            &derive(out_letters.1, cipher_out.key_size()),
            &derive(out_letters.0, cipher_out.iv_size()),
        )?;
        let mac_out_key = mac_out
            .map(|m| MacKey::new(m, &derive(out_letters.2, m.key_size())))
            .transpose()?;
        let decryption = DecryptionKey::new(
            cipher_in,
            &derive(in_letters.1, cipher_in.key_size()),
            &derive(in_letters.0, cipher_in.iv_size()),
        )?;
        let mac_in_key = mac_in
            .map(|m| MacKey::new(m, &derive(in_letters.2, m.key_size())))
            .transpose()?;

        self.encode_payload(&NewKeys::new().to_bytes())?;
        self.codec.install_outbound(encryption, mac_out_key);
        self.kex.newkeys_sent = true;
        self.kex.pending_inbound = Some((decryption, mac_in_key));

        let (out_alg, _) = self.compression_directions(negotiated);
        self.apply_outbound_compression(out_alg);
        debug!(cipher = cipher_out.name(), "Outbound keys installed");

        while let Some(payload) = self.held.pop_front() {
            self.encode_payload(&payload)?;
        }
        self.maybe_finish_kex();
        Ok(())
    }

    fn on_newkeys(&mut self) -> SshResult<()> {
        let (decryption, mac) = self
            .kex
            .pending_inbound
            .take()
            .ok_or_else(|| SshError::Protocol("Unexpected NEWKEYS".to_string()))?;
        let cipher = decryption.algorithm();
        self.codec.install_inbound(decryption, mac);
        self.kex.newkeys_received = true;

        if let Some(negotiated) = self.kex.negotiated.clone() {
            let (_, in_alg) = self.compression_directions(&negotiated);
            self.apply_inbound_compression(in_alg);
        }
        debug!(cipher = cipher.name(), "Inbound keys installed");
        self.maybe_finish_kex();
        Ok(())
    }

    fn maybe_finish_kex(&mut self) {
        if !(self.kex.newkeys_sent && self.kex.newkeys_received) {
            return;
        }
        self.phase = KexPhase::KeysInstalled;
        self.negotiated = self.kex.negotiated.take();
        self.kex = KexState::default();
        self.bytes_since_kex = 0;
        self.last_kex = Instant::now();
        self.kex_count += 1;
        info!(count = self.kex_count, "Key exchange complete");
    }

    fn compression_directions(
        &self,
        negotiated: &Negotiated,
    ) -> (CompressionAlgorithm, CompressionAlgorithm) {
        match self.config.role {
            Role::Client => (negotiated.comp_cs, negotiated.comp_sc),
            Role::Server => (negotiated.comp_sc, negotiated.comp_cs),
        }
    }

    fn compression_active(&self, algorithm: CompressionAlgorithm) -> bool {
        match algorithm {
            CompressionAlgorithm::None => false,
            CompressionAlgorithm::Zlib => true,
            CompressionAlgorithm::ZlibOpenssh => self.authenticated,
        }
    }

    fn apply_outbound_compression(&mut self, algorithm: CompressionAlgorithm) {
        if algorithm == CompressionAlgorithm::None {
            self.codec.set_outbound_compression(None);
        } else if self.compression_active(algorithm) && !self.codec.outbound_compressed() {
            debug!(algorithm = algorithm.name(), "Outbound compression enabled");
            self.codec.set_outbound_compression(Some(Compressor::new()));
        }
    }

    fn apply_inbound_compression(&mut self, algorithm: CompressionAlgorithm) {
        if algorithm == CompressionAlgorithm::None {
            self.codec.set_inbound_compression(None);
        } else if self.compression_active(algorithm) && !self.codec.inbound_compressed() {
            debug!(algorithm = algorithm.name(), "Inbound compression enabled");
            self.codec.set_inbound_compression(Some(Decompressor::new()));
        }
    }
}

fn closed_error() -> SshError {
    SshError::SocketDisconnect("Connection is closed".to_string())
}

fn describe(msg: u8) -> String {
    match MessageType::from_u8(msg) {
        Some(t) => t.to_string(),
        None => format!("message {}", msg),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::ssh::hostkey::Ed25519HostKey;
    use crate::ssh::kex::MethodType;
    use std::os::unix::net::UnixStream;
    use std::thread;

    fn server_keys() -> Vec<Arc<dyn HostKey>> {
        vec![Arc::new(Ed25519HostKey::generate().unwrap())]
    }

    fn pair(
        client_config: TransportConfig,
        server_config: TransportConfig,
    ) -> (Transport, thread::JoinHandle<Transport>) {
        let (a, b) = UnixStream::pair().unwrap();
        let server = thread::spawn(move || {
            let mut server = Transport::new(Box::new(b), server_config).with_host_keys(server_keys());
            server.handshake().unwrap();
            server
        });
        let mut client = Transport::new(Box::new(a), client_config);
        client.handshake().unwrap();
        (client, server)
    }

    fn channel_data(byte: u8, len: usize) -> Vec<u8> {
        let mut payload = vec![MessageType::ChannelData as u8];
        payload.extend(std::iter::repeat(byte).take(len));
        payload
    }

    #[test]
    fn test_handshake_and_exchange() {
        let (mut client, server) = pair(
            TransportConfig::new(Role::Client),
            TransportConfig::new(Role::Server),
        );
        let mut server = server.join().unwrap();

        assert!(client.is_established());
        assert_eq!(client.session_id(), server.session_id());
        assert_eq!(client.host_key(), server.host_key());
        assert_eq!(client.kex_phase(), KexPhase::KeysInstalled);
        assert!(client.remote_version().unwrap().starts_with("SSH-2.0-sshwire_"));

        client.send_payload(&channel_data(1, 100)).unwrap();
        assert_eq!(server.read_packet().unwrap(), channel_data(1, 100));

        server.send_payload(&channel_data(2, 10)).unwrap();
        assert_eq!(client.read_packet().unwrap(), channel_data(2, 10));

        // Handshake again is harmless
        client.handshake().unwrap();
        assert_eq!(client.kex_count(), 1);
    }

    #[test]
    fn test_invalid_local_banner() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut config = TransportConfig::new(Role::Client);
        config.banner = "not an ssh banner".to_string();
        let mut client = Transport::new(Box::new(a), config);
        assert!(matches!(client.handshake(), Err(SshError::Protocol(_))));
        assert!(client.is_closed());
    }

    #[test]
    fn test_invalid_remote_banner() {
        let (a, mut b) = UnixStream::pair().unwrap();
        b.write_all(b"SSH-1.5-ancient\r\n").unwrap();
        let mut client = Transport::new(Box::new(a), TransportConfig::new(Role::Client));
        assert!(matches!(client.handshake(), Err(SshError::Protocol(_))));
    }

    #[test]
    fn test_peer_closes_during_banner() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(b);
        let mut client = Transport::new(Box::new(a), TransportConfig::new(Role::Client));
        match client.handshake() {
            Err(SshError::BannerRecv(_)) | Err(SshError::BannerSend(_)) => {}
            other => panic!("expected banner error, got {:?}", other),
        }
    }

    #[test]
    fn test_no_common_cipher() {
        let mut client_config = TransportConfig::new(Role::Client);
        client_config
            .preferences
            .set(MethodType::CryptCs, "aes128-ctr")
            .unwrap();
        let mut server_config = TransportConfig::new(Role::Server);
        server_config
            .preferences
            .set(MethodType::CryptCs, "aes256-gcm@openssh.com")
            .unwrap();

        let (a, b) = UnixStream::pair().unwrap();
        let server = thread::spawn(move || {
            let mut server = Transport::new(Box::new(b), server_config).with_host_keys(server_keys());
            server.handshake().is_err()
        });
        let mut client = Transport::new(Box::new(a), client_config);
        assert!(matches!(client.handshake(), Err(SshError::KexFailure(_))));
        assert!(server.join().unwrap());
    }

    #[test]
    fn test_verifier_rejects_host_key() {
        let (a, b) = UnixStream::pair().unwrap();
        let server = thread::spawn(move || {
            let mut server = Transport::new(Box::new(b), TransportConfig::new(Role::Server))
                .with_host_keys(server_keys());
            let _ = server.handshake();
        });
        let mut client = Transport::new(Box::new(a), TransportConfig::new(Role::Client));
        client.set_host_key_verifier(Some(Box::new(|_blob: &[u8]| false)));
        assert!(matches!(client.handshake(), Err(SshError::HostKeyInit(_))));
        assert_eq!(client.kex_count(), 0);
        drop(client);
        server.join().unwrap();
    }

    #[test]
    fn test_rekey_preserves_order() {
        let mut client_config = TransportConfig::new(Role::Client);
        client_config.rekey_bytes_limit = 4096;
        let (mut client, server) = pair(client_config, TransportConfig::new(Role::Server));
        let mut server = server.join().unwrap();
        let session_id = client.session_id().unwrap().to_vec();

        let receiver = thread::spawn(move || {
            let mut seen = Vec::new();
            for _ in 0..20 {
                let payload = server.read_packet().unwrap();
                seen.push(payload[1]);
            }
            server.send_payload(&channel_data(99, 1)).unwrap();
            seen
        });
        for i in 0..20u8 {
            client.send_payload(&channel_data(i, 1000)).unwrap();
        }
        // Reading drives the client side of the rekey and releases held data
        assert_eq!(client.read_packet().unwrap(), channel_data(99, 1));
        let seen = receiver.join().unwrap();
        assert_eq!(seen, (0..20).collect::<Vec<u8>>());
        assert!(client.kex_count() > 1);
        assert_eq!(client.session_id().unwrap(), &session_id[..]);
    }

    #[test]
    fn test_zlib_compression() {
        let mut client_config = TransportConfig::new(Role::Client);
        client_config.preferences.set_compression(true);
        client_config
            .preferences
            .set(MethodType::CompCs, "zlib")
            .unwrap();
        client_config
            .preferences
            .set(MethodType::CompSc, "zlib")
            .unwrap();
        let mut server_config = TransportConfig::new(Role::Server);
        server_config.preferences.set_compression(true);

        let (mut client, server) = pair(client_config, server_config);
        let mut server = server.join().unwrap();
        assert!(client.is_compressing());

        client.send_payload(&channel_data(b'z', 20000)).unwrap();
        assert_eq!(server.read_packet().unwrap(), channel_data(b'z', 20000));
    }

    #[test]
    fn test_delayed_compression_waits_for_auth() {
        let mut client_config = TransportConfig::new(Role::Client);
        client_config.preferences.set_compression(true);
        let mut server_config = TransportConfig::new(Role::Server);
        server_config.preferences.set_compression(true);

        let (mut client, server) = pair(client_config, server_config);
        let mut server = server.join().unwrap();
        assert!(!client.is_compressing());

        server.set_authenticated();
        client.set_authenticated();
        assert!(client.is_compressing());
        client.send_payload(&channel_data(b'q', 5000)).unwrap();
        assert_eq!(server.read_packet().unwrap(), channel_data(b'q', 5000));
        server.send_payload(&channel_data(b'r', 5000)).unwrap();
        assert_eq!(client.read_packet().unwrap(), channel_data(b'r', 5000));
    }

    #[test]
    fn test_disconnect_reaches_peer() {
        let (mut client, server) = pair(
            TransportConfig::new(Role::Client),
            TransportConfig::new(Role::Server),
        );
        let mut server = server.join().unwrap();
        client
            .disconnect(crate::ssh::message::disconnect::BY_APPLICATION, "bye", "")
            .unwrap();
        assert!(client.is_closed());
        match server.read_packet() {
            Err(SshError::Disconnected {
                reason,
                description,
            }) => {
                assert_eq!(reason, 11);
                assert_eq!(description, "bye");
            }
            other => panic!("expected disconnect, got {:?}", other),
        }
        assert!(matches!(
            client.send_payload(&channel_data(0, 1)),
            Err(SshError::SocketDisconnect(_))
        ));
    }

    #[test]
    fn test_disconnect_roundtrip() {
        let msg = Disconnect {
            reason: 2,
            description: "protocol error".to_string(),
            language: String::new(),
        };
        assert_eq!(Disconnect::from_bytes(&msg.to_bytes()).unwrap(), msg);
        assert!(Disconnect::from_bytes(&[2, 0]).is_err());
    }
}
