//! SSH client session.
//!
//! [`Session`] is the public entry point: it takes over an already
//! connected stream, runs the handshake, authenticates, and opens
//! [`Channel`]s, [`Listener`]s, SFTP contexts and SCP transfers.
//!
//! # Blocking and non-blocking mode
//!
//! The stream is always driven in non-blocking mode. In blocking mode (the
//! default) every operation waits for socket readiness internally, bounded
//! by [`Session::set_timeout`]. In non-blocking mode operations return
//! [`SshError::WouldBlock`] instead; the caller waits on the socket in the
//! directions reported by [`Session::block_directions`] (or with
//! [`Session::wait_socket`]) and calls the same operation again. Progress is
//! never lost: an operation that returned `WouldBlock` resumes where it
//! stopped.
//!
//! # Example
//!
//! ```no_run
//! use std::io::Read;
//! use std::net::TcpStream;
//! use sshwire_proto::ssh::session::Session;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let tcp = TcpStream::connect("127.0.0.1:22")?;
//! let session = Session::new();
//! session.set_tcp_stream(tcp);
//! session.handshake()?;
//! session.userauth_password("user", "secret")?;
//!
//! let mut channel = session.channel_session()?;
//! channel.exec("uname -a")?;
//! let mut output = String::new();
//! channel.read_to_string(&mut output)?;
//! channel.wait_closed()?;
//! println!("{} (exit {})", output, channel.exit_status()?);
//! # Ok(())
//! # }
//! ```

mod auth;
mod channel;
mod keepalive;

pub use channel::{Channel, Listener, ReadWindow, WriteWindow};
pub use crate::ssh::channel::{ExitSignal, ExtendedData};

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use sshwire_platform::{BlockDirections, SessionStream, SshError, SshResult};
use tracing::{debug, info, trace, warn};

use crate::ssh::agent::Agent;
use crate::ssh::channel::{ChannelState, RequestReply, SshChannel};
use crate::ssh::connection::{
    recipient_channel, request_failure, ChannelClose, ChannelData, ChannelExtendedData,
    ChannelFailure, ChannelOpen, ChannelOpenConfirmation, ChannelOpenFailure,
    ChannelOpenFailureReason, ChannelRequest, ChannelRequestType, ChannelType,
    ChannelWindowAdjust, GlobalRequest, GlobalRequestType, RequestSuccess,
    EXTENDED_DATA_STDERR,
};
use crate::ssh::hostkey::{hash_host_key, HashType, PublicKey};
use crate::ssh::kex::{supported_algorithms, MethodType};
use crate::ssh::message::{disconnect, MessageType};
use crate::ssh::transport::{Role, Transport, TransportConfig};

use keepalive::{Keepalive, KeepaliveAction};

/// Type of the server host key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyType {
    /// `ssh-rsa`
    Rsa,
    /// `ecdsa-sha2-nistp256`
    Ecdsa256,
    /// `ecdsa-sha2-nistp384`
    Ecdsa384,
    /// `ecdsa-sha2-nistp521`
    Ecdsa521,
    /// `ssh-ed25519`
    Ed25519,
    /// Anything else
    Unknown,
}

impl HostKeyType {
    fn from_key_type(name: &str) -> Self {
        match name {
            "ssh-rsa" => HostKeyType::Rsa,
            "ecdsa-sha2-nistp256" => HostKeyType::Ecdsa256,
            "ecdsa-sha2-nistp384" => HostKeyType::Ecdsa384,
            "ecdsa-sha2-nistp521" => HostKeyType::Ecdsa521,
            "ssh-ed25519" => HostKeyType::Ed25519,
            _ => HostKeyType::Unknown,
        }
    }
}

/// Boolean session options set with [`Session::flag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFlag {
    /// Offer `zlib@openssh.com` and `zlib` compression
    Compress,
}

/// Global requests waiting for REQUEST_SUCCESS/REQUEST_FAILURE, in send
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GlobalPending {
    Keepalive,
    Forward,
    CancelForward,
}

/// A reverse forward granted by the server.
#[derive(Debug, Default)]
struct ListenerState {
    address: String,
    port: u32,
    queue_max: usize,
    queue: VecDeque<u32>,
    cancelled: bool,
}

/// Resumable multi-step operations. Each is kept while the operation
/// returns `WouldBlock` so the next call continues it.
#[derive(Debug, Default)]
pub(crate) struct PendingOps {
    /// Channel waiting for OPEN_CONFIRMATION
    pub(crate) open: Option<u32>,
    /// Outstanding `tcpip-forward`: address, port
    pub(crate) forward: Option<(String, u32)>,
    forward_reply: Option<Result<u32, String>>,
    cancel_reply: Option<Result<(), String>>,
    /// Agent authentication: connection and index of the identity in use
    pub(crate) agent: Option<(Agent, usize)>,
    /// SCP transfer in setup
    pub(crate) scp: Option<crate::ssh::scp::ScpSetup>,
    /// SFTP channel in setup
    pub(crate) sftp: Option<crate::ssh::sftp::SftpSetup>,
}

/// Authentication progress.
#[derive(Debug, Default)]
pub(crate) struct AuthState {
    pub(crate) service_requested: bool,
    pub(crate) service_accepted: bool,
    /// Key of the request sent and not yet answered
    pub(crate) pending: Option<String>,
    pub(crate) authenticated: bool,
    pub(crate) banner: Option<String>,
}

/// Shared session state behind the [`Session`] mutex.
pub(crate) struct SessionInner {
    pub(crate) transport: Option<Transport>,
    stream: Option<Box<dyn SessionStream>>,
    pub(crate) config: TransportConfig,
    verifier: Option<crate::ssh::transport::HostKeyVerifier>,
    blocking: bool,
    timeout: Option<Duration>,
    last_error: Option<(i32, String)>,
    disconnected: bool,

    pub(crate) auth: AuthState,
    pub(crate) pending: PendingOps,
    keepalive: Keepalive,
    global_pending: VecDeque<GlobalPending>,

    pub(crate) channels: HashMap<u32, SshChannel>,
    next_channel_id: u32,
    listeners: HashMap<u32, ListenerState>,
    next_listener_id: u32,
}

impl std::fmt::Debug for SessionInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionInner")
            .field("transport", &self.transport)
            .field("blocking", &self.blocking)
            .field("timeout", &self.timeout)
            .field("authenticated", &self.auth.authenticated)
            .field("channels", &self.channels.len())
            .finish()
    }
}

/// An SSH client session.
///
/// Cloning is cheap; clones share the same connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Mutex<SessionInner>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.try_lock() {
            Ok(inner) => inner.fmt(f),
            Err(_) => f.write_str("Session { <locked> }"),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn lock_inner(inner: &Mutex<SessionInner>) -> SshResult<MutexGuard<'_, SessionInner>> {
    inner
        .lock()
        .map_err(|_| SshError::Other("Session state poisoned".into()))
}

impl Session {
    /// Creates a session with default settings and no stream.
    pub fn new() -> Self {
        Self::with_config(TransportConfig::new(Role::Client))
    }

    /// Creates a session with explicit transport settings.
    pub fn with_config(config: TransportConfig) -> Self {
        let inner = SessionInner {
            transport: None,
            stream: None,
            config,
            verifier: None,
            blocking: true,
            timeout: None,
            last_error: None,
            disconnected: false,
            auth: AuthState::default(),
            pending: PendingOps::default(),
            keepalive: Keepalive::default(),
            global_pending: VecDeque::new(),
            channels: HashMap::new(),
            next_channel_id: 0,
            listeners: HashMap::new(),
            next_listener_id: 0,
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    fn lock(&self) -> SshResult<MutexGuard<'_, SessionInner>> {
        lock_inner(&self.inner)
    }

    /// Runs `op` under the session lock, waiting on the socket between
    /// attempts in blocking mode and recording failures as the last error.
    pub(crate) fn run<T>(
        &self,
        op: impl FnMut(&mut SessionInner) -> SshResult<T>,
    ) -> SshResult<T> {
        self.lock()?.block_on(op)
    }

    /// Records a failure raised outside [`run`](Self::run) as the last
    /// error.
    pub(crate) fn recorded<T>(&self, result: SshResult<T>) -> SshResult<T> {
        result.map_err(|error| match self.lock() {
            Ok(mut inner) => inner.record(error),
            Err(_) => error,
        })
    }

    /// Hands the connected stream to the session.
    ///
    /// Replaces any stream set earlier; has no effect after the handshake.
    pub fn set_tcp_stream<S: SessionStream + 'static>(&self, stream: S) {
        if let Ok(mut inner) = self.lock() {
            if inner.transport.is_none() {
                inner.stream = Some(Box::new(stream));
            }
        }
    }

    /// Runs the version exchange and key exchange.
    ///
    /// Safe to call repeatedly: once the handshake completed it returns
    /// `Ok(())` without touching the connection.
    ///
    /// # Errors
    ///
    /// - [`SshError::Protocol`] if the local banner set with
    ///   [`banner_set`](Self::banner_set) or the server banner is invalid
    /// - [`SshError::KexFailure`] if no algorithms are shared
    /// - [`SshError::HostKeyInit`] if the host key verifier rejects the key
    /// - [`SshError::WouldBlock`] in non-blocking mode
    pub fn handshake(&self) -> SshResult<()> {
        self.run(|inner| {
            if inner.transport.is_none() {
                let stream = inner.stream.take().ok_or_else(|| {
                    SshError::InvalidRequest("No stream set; call set_tcp_stream first".to_string())
                })?;
                stream.set_nonblocking(true).map_err(SshError::from)?;
                let mut transport = Transport::new(stream, inner.config.clone());
                transport.set_host_key_verifier(inner.verifier.take());
                inner.transport = Some(transport);
            }
            inner.transport_mut()?.handshake()
        })
    }

    /// Installs a callback deciding whether the server host key is trusted.
    ///
    /// It receives the raw host key blob before any key is installed;
    /// returning `false` fails the handshake with
    /// [`SshError::HostKeyInit`]. Must be set before [`handshake`](Self::handshake).
    pub fn set_hostkey_verifier<F>(&self, verifier: F)
    where
        F: FnMut(&[u8]) -> bool + Send + 'static,
    {
        if let Ok(mut inner) = self.lock() {
            inner.verifier = Some(Box::new(verifier));
        }
    }

    /// Switches between blocking (default) and non-blocking mode.
    pub fn set_blocking(&self, blocking: bool) {
        if let Ok(mut inner) = self.lock() {
            inner.blocking = blocking;
        }
    }

    /// Returns true in blocking mode.
    pub fn is_blocking(&self) -> bool {
        self.lock().map(|inner| inner.blocking).unwrap_or(true)
    }

    /// Sets the timeout for blocking operations in milliseconds; 0 waits
    /// forever.
    pub fn set_timeout(&self, timeout_ms: u32) {
        if let Ok(mut inner) = self.lock() {
            inner.timeout = if timeout_ms == 0 {
                None
            } else {
                Some(Duration::from_millis(u64::from(timeout_ms)))
            };
        }
    }

    /// Returns the blocking timeout in milliseconds; 0 means none.
    pub fn timeout(&self) -> u32 {
        self.lock()
            .ok()
            .and_then(|inner| inner.timeout)
            .map(|t| t.as_millis().min(u128::from(u32::MAX)) as u32)
            .unwrap_or(0)
    }

    /// Returns the code and message of the last failed operation, or
    /// `(0, "")` if none failed.
    pub fn last_error(&self) -> (i32, String) {
        self.lock()
            .ok()
            .and_then(|inner| inner.last_error.clone())
            .unwrap_or((0, String::new()))
    }

    /// Overrides the last error and returns `code`.
    pub fn set_last_error(&self, code: i32, message: &str) -> i32 {
        if let Ok(mut inner) = self.lock() {
            inner.last_error = Some((code, message.to_string()));
        }
        code
    }

    /// Sets the identification string sent during the handshake.
    ///
    /// It is validated when the handshake runs.
    pub fn banner_set(&self, banner: &str) {
        if let Ok(mut inner) = self.lock() {
            inner.config.banner = banner.to_string();
        }
    }

    /// Returns the server identification string once received.
    pub fn banner_get(&self) -> Option<String> {
        self.lock()
            .ok()?
            .transport
            .as_ref()?
            .remote_version()
            .map(String::from)
    }

    /// Sets the algorithm preference list for a category.
    ///
    /// Takes effect at the next key exchange.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::MethodNotSupported`] if none of the listed
    /// algorithms is implemented.
    pub fn method_pref(&self, method: MethodType, prefs: &str) -> SshResult<()> {
        self.run(|inner| {
            inner.config.preferences.set(method, prefs)?;
            let preferences = inner.config.preferences.clone();
            if let Some(transport) = inner.transport.as_mut() {
                transport.config_mut().preferences = preferences;
            }
            Ok(())
        })
    }

    /// Returns the algorithm negotiated for a category.
    pub fn methods(&self, method: MethodType) -> Option<String> {
        self.lock()
            .ok()?
            .transport
            .as_ref()?
            .negotiated()
            .map(|n| n.name(method))
    }

    /// Lists the algorithms implemented for a category.
    pub fn supported_algs(&self, method: MethodType) -> Vec<&'static str> {
        supported_algorithms(method)
    }

    /// Sets a boolean session option. Takes effect at the next key
    /// exchange.
    pub fn flag(&self, flag: SessionFlag, enabled: bool) {
        if let Ok(mut inner) = self.lock() {
            match flag {
                SessionFlag::Compress => inner.config.preferences.set_compression(enabled),
            }
            let preferences = inner.config.preferences.clone();
            if let Some(transport) = inner.transport.as_mut() {
                transport.config_mut().preferences = preferences;
            }
        }
    }

    /// Sets when the session starts a rekey by itself.
    pub fn set_rekey_limits(&self, bytes: u64, interval: Duration) {
        if let Ok(mut inner) = self.lock() {
            inner.config.rekey_bytes_limit = bytes;
            inner.config.rekey_time_limit = interval;
            if let Some(transport) = inner.transport.as_mut() {
                transport.set_rekey_limits(bytes, interval);
            }
        }
    }

    /// Number of completed key exchanges, including the first.
    pub fn kex_count(&self) -> u32 {
        self.lock()
            .ok()
            .and_then(|inner| inner.transport.as_ref().map(Transport::kex_count))
            .unwrap_or(0)
    }

    /// Returns the raw server host key and its type.
    pub fn hostkey(&self) -> Option<(Vec<u8>, HostKeyType)> {
        let inner = self.lock().ok()?;
        let blob = inner.transport.as_ref()?.host_key()?.to_vec();
        let key_type = PublicKey::from_blob(&blob)
            .map(|k| HostKeyType::from_key_type(k.key_type()))
            .unwrap_or(HostKeyType::Unknown);
        Some((blob, key_type))
    }

    /// Returns a digest of the server host key.
    pub fn hostkey_hash(&self, hash: HashType) -> Option<Vec<u8>> {
        let inner = self.lock().ok()?;
        let blob = inner.transport.as_ref()?.host_key()?;
        Some(hash_host_key(blob, hash))
    }

    /// Directions the last `WouldBlock` was waiting on.
    pub fn block_directions(&self) -> BlockDirections {
        self.lock()
            .ok()
            .and_then(|inner| inner.transport.as_ref().map(Transport::block_directions))
            .unwrap_or_default()
    }

    /// Waits until the socket is ready in the directions reported by
    /// [`block_directions`](Self::block_directions).
    ///
    /// Returns `Ok(false)` if `timeout` elapsed first.
    pub fn wait_socket(&self, timeout: Option<Duration>) -> SshResult<bool> {
        let inner = self.lock()?;
        let deadline = timeout.map(|t| Instant::now() + t);
        match inner.wait_ready(deadline) {
            Ok(()) => Ok(true),
            Err(SshError::Timeout) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Configures keep-alives. An interval of 0 disables them.
    pub fn keepalive_config(&self, want_reply: bool, interval_secs: u32) {
        if let Ok(mut inner) = self.lock() {
            inner.keepalive.configure(want_reply, interval_secs);
        }
    }

    /// Sends a keep-alive if one is due.
    ///
    /// Returns the seconds until the next one should be sent, or 0 if
    /// keep-alives are disabled.
    pub fn keepalive_send(&self) -> SshResult<u32> {
        self.run(|inner| {
            let now = Instant::now();
            match inner.keepalive.poll(now) {
                KeepaliveAction::Disabled => Ok(0),
                KeepaliveAction::Wait(secs) => Ok(secs),
                KeepaliveAction::Due => {
                    let request = inner.keepalive.request();
                    inner.send(&request)?;
                    if inner.keepalive.want_reply() {
                        inner.global_pending.push_back(GlobalPending::Keepalive);
                    }
                    inner.keepalive.mark_sent(now);
                    trace!("Keep-alive sent");
                    Ok(inner.keepalive.interval())
                }
            }
        })
    }

    /// Disconnects with reason "by application".
    pub fn disconnect(&self, description: &str) -> SshResult<()> {
        self.disconnect_ex(disconnect::BY_APPLICATION, description, "")
    }

    /// Sends SSH_MSG_DISCONNECT and closes the connection.
    ///
    /// Channels, listeners and SFTP contexts of this session fail with
    /// [`SshError::SocketDisconnect`] afterwards.
    pub fn disconnect_ex(&self, reason: u32, description: &str, language: &str) -> SshResult<()> {
        self.run(|inner| {
            if inner.disconnected {
                return Ok(());
            }
            inner
                .transport_mut()?
                .disconnect(reason, description, language)?;
            inner.mark_disconnected();
            Ok(())
        })
    }
}

impl SessionInner {
    /// Runs `op` until it stops returning `WouldBlock` (blocking mode) or
    /// once (non-blocking mode).
    pub(crate) fn block_on<T>(
        &mut self,
        mut op: impl FnMut(&mut SessionInner) -> SshResult<T>,
    ) -> SshResult<T> {
        let deadline = self.timeout.map(|t| Instant::now() + t);
        loop {
            match op(self) {
                Ok(value) => return Ok(value),
                Err(SshError::WouldBlock) if self.blocking => {
                    if let Err(e) = self.wait_ready(deadline) {
                        return Err(self.record(e));
                    }
                }
                Err(e) => return Err(self.record(e)),
            }
        }
    }

    fn record(&mut self, error: SshError) -> SshError {
        if !error.is_would_block() {
            debug!(code = error.code(), error = %error, "Operation failed");
        }
        self.last_error = Some((error.code(), error.to_string()));
        if error.is_fatal() && self.transport.as_ref().map_or(false, Transport::is_closed) {
            self.mark_disconnected();
        }
        error
    }

    /// Waits for socket readiness according to the transport's block
    /// directions.
    fn wait_ready(&self, deadline: Option<Instant>) -> SshResult<()> {
        let remaining = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(SshError::Timeout);
                }
                Some(deadline - now)
            }
            None => None,
        };
        let transport = self.transport_ref()?;
        let directions = transport.block_directions();

        if directions.outbound() || !directions.inbound() {
            // No portable writable wait on the stream: poll briefly so
            // queued output gets flushed on the next attempt.
            let nap = Duration::from_millis(5);
            let nap = remaining.map_or(nap, |r| r.min(nap));
            transport
                .stream()
                .wait_readable(Some(nap))
                .map_err(SshError::from_recv)?;
            return Ok(());
        }

        let ready = transport
            .stream()
            .wait_readable(remaining)
            .map_err(SshError::from_recv)?;
        if ready {
            Ok(())
        } else {
            Err(SshError::Timeout)
        }
    }

    pub(crate) fn transport_ref(&self) -> SshResult<&Transport> {
        match &self.transport {
            Some(transport) => Ok(transport),
            None if self.disconnected => Err(disconnected_error()),
            None => Err(SshError::InvalidRequest(
                "Handshake has not been performed".to_string(),
            )),
        }
    }

    pub(crate) fn transport_mut(&mut self) -> SshResult<&mut Transport> {
        if self.disconnected {
            return Err(disconnected_error());
        }
        match self.transport.as_mut() {
            Some(transport) => Ok(transport),
            None => Err(SshError::InvalidRequest(
                "Handshake has not been performed".to_string(),
            )),
        }
    }

    pub(crate) fn is_authenticated(&self) -> bool {
        self.auth.authenticated
    }

    pub(crate) fn require_authenticated(&self, what: &str) -> SshResult<()> {
        if self.disconnected {
            return Err(disconnected_error());
        }
        if self.auth.authenticated {
            Ok(())
        } else {
            Err(SshError::InvalidRequest(format!(
                "{} requires an authenticated session",
                what
            )))
        }
    }

    pub(crate) fn send(&mut self, payload: &[u8]) -> SshResult<()> {
        self.transport_mut()?.send_payload(payload)
    }

    fn mark_disconnected(&mut self) {
        if self.disconnected {
            return;
        }
        info!("Session disconnected");
        self.disconnected = true;
        self.channels.clear();
        self.listeners.clear();
        self.pending = PendingOps::default();
    }

    /// Reads one packet and dispatches it.
    ///
    /// Authentication-layer messages outside an authentication exchange are
    /// dropped.
    pub(crate) fn process_one(&mut self) -> SshResult<()> {
        let payload = self.transport_mut()?.read_packet()?;
        if let Some(other) = self.dispatch(payload)? {
            debug!(message = other[0], "Ignoring message outside its exchange");
        }
        Ok(())
    }

    /// Reads packets until one outside the connection layer arrives.
    pub(crate) fn next_non_connection(&mut self) -> SshResult<Vec<u8>> {
        loop {
            let payload = self.transport_mut()?.read_packet()?;
            if let Some(other) = self.dispatch(payload)? {
                return Ok(other);
            }
        }
    }

    /// Handles a connection-layer message. Anything else is returned.
    fn dispatch(&mut self, payload: Vec<u8>) -> SshResult<Option<Vec<u8>>> {
        let Some(kind) = MessageType::from_u8(payload[0]) else {
            debug!(message = payload[0], "Unknown message");
            self.transport_mut()?.send_unimplemented()?;
            return Ok(None);
        };

        match kind {
            MessageType::GlobalRequest => self.on_global_request(&payload)?,
            MessageType::RequestSuccess => {
                let reply = RequestSuccess::from_bytes(&payload)?;
                self.on_global_reply(Ok(reply.bound_port()))
            }
            MessageType::RequestFailure => self.on_global_reply(Err(())),
            MessageType::ChannelOpen => self.on_channel_open(&payload)?,
            MessageType::ChannelOpenConfirmation => {
                let msg = ChannelOpenConfirmation::from_bytes(&payload)?;
                let channel = self.channel_for(msg.recipient_channel())?;
                if let Some(channel) = channel {
                    channel.confirm(
                        msg.sender_channel(),
                        msg.initial_window_size(),
                        msg.maximum_packet_size(),
                    );
                    info!(
                        local = msg.recipient_channel(),
                        remote = msg.sender_channel(),
                        window = msg.initial_window_size(),
                        "Channel opened"
                    );
                }
            }
            MessageType::ChannelOpenFailure => {
                let msg = ChannelOpenFailure::from_bytes(&payload)?;
                if let Some(channel) = self.channel_for(msg.recipient_channel())? {
                    channel.open_failed(msg.reason_code(), msg.description().to_string());
                }
            }
            MessageType::ChannelWindowAdjust => {
                let msg = ChannelWindowAdjust::from_bytes(&payload)?;
                if let Some(channel) = self.channel_for(msg.recipient_channel())? {
                    channel.remote_window_adjust(msg.bytes_to_add());
                    trace!(
                        channel = msg.recipient_channel(),
                        bytes = msg.bytes_to_add(),
                        "Remote window adjusted"
                    );
                }
            }
            MessageType::ChannelData => {
                let msg = ChannelData::from_bytes(&payload)?;
                if let Some(channel) = self.channel_for(msg.recipient_channel())? {
                    channel.receive_data(msg.data())?;
                }
            }
            MessageType::ChannelExtendedData => {
                let msg = ChannelExtendedData::from_bytes(&payload)?;
                let id = msg.recipient_channel();
                let adjust = match self.channel_for(id)? {
                    Some(channel) => {
                        if msg.data_type_code() != EXTENDED_DATA_STDERR {
                            trace!(channel = id, code = msg.data_type_code(), "Extended data treated as stderr");
                        }
                        channel.receive_extended_data(msg.data())?;
                        channel.window_adjust_due()
                    }
                    None => None,
                };
                self.send_window_adjust(id, adjust)?;
            }
            MessageType::ChannelEof => {
                let id = recipient_channel(&payload)?;
                if let Some(channel) = self.channel_for(id)? {
                    channel.set_eof_received();
                    debug!(channel = id, "EOF received");
                }
            }
            MessageType::ChannelClose => {
                let id = recipient_channel(&payload)?;
                self.on_channel_close(id)?;
            }
            MessageType::ChannelRequest => self.on_channel_request(&payload)?,
            MessageType::ChannelSuccess | MessageType::ChannelFailure => {
                let id = recipient_channel(&payload)?;
                let reply = if kind == MessageType::ChannelSuccess {
                    RequestReply::Success
                } else {
                    RequestReply::Failure
                };
                if let Some(channel) = self.channel_for(id)? {
                    channel.set_request_reply(reply);
                }
            }
            _ => return Ok(Some(payload)),
        }
        Ok(None)
    }

    /// Looks up a channel by local ID; unknown IDs are logged and skipped.
    fn channel_for(&mut self, id: u32) -> SshResult<Option<&mut SshChannel>> {
        match self.channels.get_mut(&id) {
            Some(channel) => Ok(Some(channel)),
            None => {
                debug!(channel = id, "Message for unknown channel");
                Ok(None)
            }
        }
    }

    fn send_window_adjust(&mut self, id: u32, adjust: Option<u32>) -> SshResult<()> {
        let Some(bytes) = adjust else {
            return Ok(());
        };
        let remote = match self.channels.get(&id) {
            Some(channel) if !channel.close_sent() => channel.remote_id(),
            _ => return Ok(()),
        };
        trace!(channel = id, bytes, "Sending window adjust");
        self.send(&ChannelWindowAdjust::new(remote, bytes).to_bytes())
    }

    fn on_global_request(&mut self, payload: &[u8]) -> SshResult<()> {
        let request = GlobalRequest::from_bytes(payload)?;
        debug!(request = request.request_type.name(), "Global request from server");
        if request.want_reply {
            self.send(&request_failure())?;
        }
        Ok(())
    }

    fn on_global_reply(&mut self, reply: Result<Option<u32>, ()>) {
        match self.global_pending.pop_front() {
            Some(GlobalPending::Keepalive) => trace!("Keep-alive answered"),
            Some(GlobalPending::Forward) => {
                let port = self.pending.forward.as_ref().map_or(0, |(_, port)| *port);
                self.pending.forward_reply = Some(match reply {
                    Ok(bound) => Ok(bound.unwrap_or(port)),
                    Err(()) => Err("Server refused tcpip-forward".to_string()),
                });
            }
            Some(GlobalPending::CancelForward) => {
                self.pending.cancel_reply = Some(
                    reply
                        .map(|_| ())
                        .map_err(|_| "Server refused cancel-tcpip-forward".to_string()),
                );
            }
            None => warn!("Unsolicited global request reply"),
        }
    }

    fn on_channel_open(&mut self, payload: &[u8]) -> SshResult<()> {
        let open = ChannelOpen::from_bytes(payload)?;
        let listener = match open.channel_type() {
            ChannelType::ForwardedTcpip {
                connected_address,
                connected_port,
                ..
            } => self
                .listeners
                .iter()
                .find(|(_, l)| {
                    !l.cancelled
                        && l.port == *connected_port
                        && (l.address == *connected_address || l.address.is_empty())
                        && l.queue.len() < l.queue_max
                })
                .map(|(id, _)| *id),
            _ => None,
        };

        let Some(listener) = listener else {
            debug!(kind = open.channel_type().name(), "Refusing channel open from server");
            let failure = ChannelOpenFailure::new(
                open.sender_channel(),
                ChannelOpenFailureReason::AdministrativelyProhibited,
                "Channel type not accepted",
            );
            return self.send(&failure.to_bytes());
        };

        let id = self.allocate_channel_id();
        let channel = SshChannel::accepted(
            id,
            self.config.window_size,
            self.config.max_packet_size,
            open.sender_channel(),
            open.initial_window_size(),
            open.maximum_packet_size(),
        );
        self.channels.insert(id, channel);
        let confirm = ChannelOpenConfirmation::new(
            open.sender_channel(),
            id,
            self.config.window_size,
            self.config.max_packet_size,
        );
        self.send(&confirm.to_bytes())?;
        if let Some(state) = self.listeners.get_mut(&listener) {
            state.queue.push_back(id);
        }
        info!(channel = id, listener, "Accepted forwarded connection");
        Ok(())
    }

    fn on_channel_close(&mut self, id: u32) -> SshResult<()> {
        let Some(channel) = self.channel_for(id)? else {
            return Ok(());
        };
        channel.set_close_received();
        let remote = channel.remote_id();
        let reply = !channel.close_sent();
        if reply {
            channel.set_close_sent();
        }
        let drop_now = channel.handle_dropped;
        debug!(channel = id, "Channel closed by peer");
        if reply {
            self.send(&ChannelClose::new(remote).to_bytes())?;
        }
        if drop_now {
            self.channels.remove(&id);
        }
        Ok(())
    }

    fn on_channel_request(&mut self, payload: &[u8]) -> SshResult<()> {
        let request = ChannelRequest::from_bytes(payload)?;
        let id = request.recipient_channel();
        let Some(channel) = self.channel_for(id)? else {
            return Ok(());
        };
        let remote = channel.remote_id();
        let handled = match request.request_type() {
            ChannelRequestType::ExitStatus { exit_status } => {
                channel.set_exit_status(*exit_status);
                debug!(channel = id, status = exit_status, "Exit status");
                true
            }
            ChannelRequestType::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
                language_tag,
            } => {
                channel.set_exit_signal(ExitSignal {
                    signal_name: Some(signal_name.clone()),
                    core_dumped: *core_dumped,
                    error_message: Some(error_message.clone()),
                    language_tag: Some(language_tag.clone()),
                });
                debug!(channel = id, signal = %signal_name, "Exit signal");
                true
            }
            other => {
                debug!(channel = id, request = other.name(), "Unhandled channel request");
                false
            }
        };
        if !handled && request.want_reply() {
            self.send(&ChannelFailure::new(remote).to_bytes())?;
        }
        Ok(())
    }

    pub(crate) fn allocate_channel_id(&mut self) -> u32 {
        loop {
            let id = self.next_channel_id;
            self.next_channel_id = self.next_channel_id.wrapping_add(1);
            if !self.channels.contains_key(&id) {
                return id;
            }
        }
    }

    /// Opens a channel and waits for the server's answer.
    ///
    /// Resumable: the channel being opened is remembered across
    /// `WouldBlock`.
    pub(crate) fn open_channel(&mut self, channel_type: &ChannelType) -> SshResult<u32> {
        self.require_authenticated("Opening a channel")?;
        let id = match self.pending.open {
            Some(id) if self.channels.contains_key(&id) => id,
            _ => {
                let id = self.allocate_channel_id();
                let window = self.config.window_size;
                let max_packet = self.config.max_packet_size;
                self.channels
                    .insert(id, SshChannel::new(id, window, max_packet));
                let open = ChannelOpen::new(channel_type.clone(), id, window, max_packet);
                debug!(channel = id, kind = channel_type.name(), "Opening channel");
                self.send(&open.to_bytes())?;
                self.pending.open = Some(id);
                id
            }
        };

        loop {
            let state = self
                .channels
                .get(&id)
                .map(|c| c.state().clone())
                .ok_or_else(disconnected_error)?;
            match state {
                ChannelState::Opening => self.process_one()?,
                ChannelState::OpenFailed {
                    reason,
                    description,
                } => {
                    self.pending.open = None;
                    self.channels.remove(&id);
                    return Err(match ChannelOpenFailureReason::from_u32(reason) {
                        Some(reason) => ChannelOpenFailure::new(id, reason, description).to_error(),
                        None => SshError::ChannelFailure(format!(
                            "Channel open failure: reason {} ({})",
                            reason, description
                        )),
                    });
                }
                _ => {
                    self.pending.open = None;
                    return Ok(id);
                }
            }
        }
    }

    pub(crate) fn channel_mut(&mut self, id: u32) -> SshResult<&mut SshChannel> {
        if self.disconnected {
            return Err(disconnected_error());
        }
        self.channels
            .get_mut(&id)
            .ok_or(SshError::ChannelClosed)
    }

    /// Sends a channel request and, when `want_reply` is set, waits for the
    /// answer.
    pub(crate) fn channel_request(
        &mut self,
        id: u32,
        request_type: ChannelRequestType,
        want_reply: bool,
    ) -> SshResult<()> {
        let name = request_type.name().to_string();
        let channel = self.channel_mut(id)?;
        if channel.close_sent() || channel.close_received() {
            return Err(SshError::ChannelClosed);
        }
        let remote = channel.remote_id();
        if !want_reply {
            let request = ChannelRequest::new(remote, request_type, false);
            return self.send(&request.to_bytes());
        }

        if channel.request_in_flight() != Some(name.as_str()) {
            channel.begin_request(&name);
            let request = ChannelRequest::new(remote, request_type, true);
            debug!(channel = id, request = %name, "Channel request");
            self.send(&request.to_bytes())?;
        }

        loop {
            let channel = self.channel_mut(id)?;
            if let Some((name, reply)) = channel.take_request_reply() {
                return match reply {
                    RequestReply::Success => Ok(()),
                    RequestReply::Failure => Err(SshError::ChannelRequestDenied(format!(
                        "Channel request {} denied",
                        name
                    ))),
                };
            }
            if channel.close_received() {
                return Err(SshError::ChannelClosed);
            }
            self.process_one()?;
        }
    }

    /// Reads stdout (`stderr == false`) or stderr from a channel.
    pub(crate) fn channel_read(&mut self, id: u32, stderr: bool, buf: &mut [u8]) -> SshResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let channel = self.channel_mut(id)?;
            if !stderr {
                if let Some(limit) = channel.read_limit {
                    if limit.finished {
                        return Ok(0);
                    }
                    if limit.remaining == 0 {
                        if limit.status_ok || crate::ssh::scp::finish_download(channel)? {
                            if !channel.close_received() && !channel.eof_sent() {
                                // `finished` stays unset until the ack is out.
                                self.channel_write(id, false, &[0])?;
                            }
                            if let Some(limit) = self.channel_mut(id)?.read_limit.as_mut() {
                                limit.finished = true;
                            }
                            return Ok(0);
                        }
                        self.process_one()?;
                        continue;
                    }
                }
            }

            let n = if stderr {
                channel.read_stderr(buf)
            } else {
                channel.read_stdout(buf)
            };
            if n > 0 {
                let adjust = channel.window_adjust_due();
                self.send_window_adjust(id, adjust)?;
                return Ok(n);
            }
            if channel.eof_received() {
                if !stderr && channel.read_limit.is_some() {
                    return Err(SshError::Scp(
                        "Connection closed before the whole file arrived".to_string(),
                    ));
                }
                return Ok(0);
            }
            self.process_one()?;
        }
    }

    /// Writes to a channel, waiting for remote window if none is left.
    pub(crate) fn channel_write(&mut self, id: u32, stderr: bool, data: &[u8]) -> SshResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        loop {
            let transport = self.transport_mut()?;
            if transport.has_pending_output() {
                transport.flush()?;
            }

            let channel = self.channel_mut(id)?;
            if channel.close_received() || channel.close_sent() {
                return Err(SshError::ChannelClosed);
            }
            if channel.eof_sent() {
                return Err(SshError::ChannelEof);
            }
            let n = channel.sendable(data.len());
            if n > 0 {
                channel.consume_remote_window(n);
                let remote = channel.remote_id();
                let payload = if stderr {
                    ChannelExtendedData::new(remote, EXTENDED_DATA_STDERR, data[..n].to_vec())
                        .to_bytes()
                } else {
                    ChannelData::new(remote, data[..n].to_vec()).to_bytes()
                };
                self.send(&payload)?;
                return Ok(n);
            }
            trace!(channel = id, "Remote window exhausted");
            self.process_one()?;
        }
    }

    pub(crate) fn channel_flush(&mut self) -> SshResult<()> {
        self.transport_mut()?.flush()
    }

    pub(crate) fn channel_send_eof(&mut self, id: u32) -> SshResult<()> {
        let channel = self.channel_mut(id)?;
        if channel.eof_sent() {
            return Ok(());
        }
        channel.set_eof_sent();
        let remote = channel.remote_id();
        debug!(channel = id, "Sending EOF");
        self.send(&crate::ssh::connection::ChannelEof::new(remote).to_bytes())
    }

    pub(crate) fn channel_close(&mut self, id: u32) -> SshResult<()> {
        let channel = self.channel_mut(id)?;
        if channel.close_sent() {
            return Ok(());
        }
        let remote = channel.remote_id();
        let send_eof = !channel.eof_sent();
        channel.set_close_sent();
        if send_eof {
            self.send(&crate::ssh::connection::ChannelEof::new(remote).to_bytes())?;
        }
        debug!(channel = id, "Closing channel");
        self.send(&ChannelClose::new(remote).to_bytes())
    }

    pub(crate) fn channel_wait_eof(&mut self, id: u32) -> SshResult<()> {
        loop {
            if self.channel_mut(id)?.eof_received() {
                return Ok(());
            }
            self.process_one()?;
        }
    }

    pub(crate) fn channel_wait_closed(&mut self, id: u32) -> SshResult<()> {
        loop {
            if self.channel_mut(id)?.close_received() {
                // Our reply CLOSE may still be queued.
                return self.channel_flush();
            }
            self.process_one()?;
        }
    }

    pub(crate) fn channel_adjust_window(&mut self, id: u32, adjustment: u32, force: bool) -> SshResult<u32> {
        let channel = self.channel_mut(id)?;
        let credit = channel.adjust_receive_window(adjustment, force);
        let window = channel.local_window();
        self.send_window_adjust(id, credit)?;
        Ok(window)
    }

    /// Marks a channel handle as gone; the channel is forgotten once both
    /// sides closed it.
    pub(crate) fn release_channel(&mut self, id: u32) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        channel.handle_dropped = true;
        if channel.close_received() && channel.close_sent() {
            self.channels.remove(&id);
            return;
        }
        if !channel.close_sent() && !self.disconnected {
            if let Err(e) = self.channel_close(id) {
                debug!(channel = id, error = %e, "Close on drop failed");
            }
        }
    }

    pub(crate) fn forward_listen(
        &mut self,
        address: &str,
        port: u32,
        queue_max: usize,
    ) -> SshResult<(u32, u32)> {
        self.require_authenticated("Port forwarding")?;
        if self.pending.forward.is_none() {
            let request = GlobalRequest {
                request_type: GlobalRequestType::TcpipForward {
                    address: address.to_string(),
                    port,
                },
                want_reply: true,
            };
            self.send(&request.to_bytes())?;
            self.global_pending.push_back(GlobalPending::Forward);
            self.pending.forward = Some((address.to_string(), port));
            self.pending.forward_reply = None;
        }

        loop {
            if let Some(reply) = self.pending.forward_reply.take() {
                self.pending.forward = None;
                let bound = reply.map_err(SshError::RequestDenied)?;
                let id = self.next_listener_id;
                self.next_listener_id += 1;
                self.listeners.insert(
                    id,
                    ListenerState {
                        address: address.to_string(),
                        port: bound,
                        queue_max: queue_max.max(1),
                        ..ListenerState::default()
                    },
                );
                info!(address, port = bound, "Remote forward established");
                return Ok((id, bound));
            }
            self.process_one()?;
        }
    }

    pub(crate) fn forward_cancel(&mut self, listener: u32) -> SshResult<()> {
        let state = self
            .listeners
            .get_mut(&listener)
            .ok_or_else(|| SshError::InvalidRequest("Listener already cancelled".to_string()))?;
        if !state.cancelled {
            state.cancelled = true;
            let request = GlobalRequest {
                request_type: GlobalRequestType::CancelTcpipForward {
                    address: state.address.clone(),
                    port: state.port,
                },
                want_reply: true,
            };
            self.send(&request.to_bytes())?;
            self.global_pending.push_back(GlobalPending::CancelForward);
            self.pending.cancel_reply = None;
        }
        loop {
            if let Some(reply) = self.pending.cancel_reply.take() {
                self.listeners.remove(&listener);
                return reply.map_err(SshError::RequestDenied);
            }
            self.process_one()?;
        }
    }

    pub(crate) fn listener_accept(&mut self, listener: u32) -> SshResult<u32> {
        loop {
            if self.disconnected {
                return Err(disconnected_error());
            }
            let state = self
                .listeners
                .get_mut(&listener)
                .ok_or_else(|| SshError::InvalidRequest("Listener was cancelled".to_string()))?;
            if let Some(id) = state.queue.pop_front() {
                return Ok(id);
            }
            self.process_one()?;
        }
    }
}

pub(crate) fn disconnected_error() -> SshError {
    SshError::SocketDisconnect("Session is disconnected".to_string())
}
