//! Error types for sshwire
//!
//! Every fallible operation in the engine returns [`SshResult`]. The error is a
//! tagged enum so callers can branch on the kind without matching strings, and
//! each kind maps to a stable signed numeric code through [`SshError::code`].
//!
//! [`SshError::WouldBlock`] is not a failure: in non-blocking mode it tells the
//! caller to wait for socket readiness and invoke the same operation again.

use std::fmt;

/// Numeric error codes.
///
/// The numbering follows the libssh2 convention so that callers porting code
/// from C bindings can keep their code tables.
pub mod codes {
    /// Banner could not be received.
    pub const BANNER_RECV: i32 = -2;
    /// Banner could not be sent.
    pub const BANNER_SEND: i32 = -3;
    /// Packet could not be sent.
    pub const SOCKET_SEND: i32 = -7;
    /// Key exchange failed.
    pub const KEX_FAILURE: i32 = -8;
    /// Socket read timed out.
    pub const TIMEOUT: i32 = -9;
    /// Host key could not be initialised.
    pub const HOSTKEY_INIT: i32 = -10;
    /// Host key signature did not verify.
    pub const HOSTKEY_SIGN: i32 = -11;
    /// Packet could not be decrypted.
    pub const DECRYPT: i32 = -12;
    /// Peer disconnected.
    pub const SOCKET_DISCONNECT: i32 = -13;
    /// Protocol violation.
    pub const PROTO: i32 = -14;
    /// Local key material is unusable.
    pub const FILE: i32 = -16;
    /// Requested method is not supported.
    pub const METHOD_NOT_SUPPORTED: i32 = -17;
    /// Credentials were rejected.
    pub const AUTHENTICATION_FAILED: i32 = -18;
    /// Public key was not accepted by the server.
    pub const PUBLICKEY_UNVERIFIED: i32 = -19;
    /// Channel open or request failed.
    pub const CHANNEL_FAILURE: i32 = -21;
    /// Request was denied by the server.
    pub const CHANNEL_REQUEST_DENIED: i32 = -22;
    /// Write would exceed the remote window.
    pub const CHANNEL_WINDOW_EXCEEDED: i32 = -24;
    /// Channel is closed.
    pub const CHANNEL_CLOSED: i32 = -26;
    /// Channel already received EOF.
    pub const CHANNEL_EOF_SENT: i32 = -27;
    /// SCP protocol error.
    pub const SCP_PROTOCOL: i32 = -28;
    /// Compression failure.
    pub const ZLIB: i32 = -29;
    /// SFTP protocol error or status.
    pub const SFTP_PROTOCOL: i32 = -31;
    /// Global request denied.
    pub const REQUEST_DENIED: i32 = -32;
    /// Invalid argument or request issued in the wrong state.
    pub const INVAL: i32 = -34;
    /// Operation would block.
    pub const EAGAIN: i32 = -37;
    /// Socket receive failure.
    pub const SOCKET_RECV: i32 = -43;
    /// Agent protocol failure.
    pub const AGENT_PROTOCOL: i32 = -42;
    /// Unclassified failure.
    pub const OTHER: i32 = -1;
}

/// Unified error type for all sshwire operations
#[derive(Debug)]
pub enum SshError {
    /// I/O error not attributable to a specific direction
    Io(std::io::Error),

    /// Writing to the socket failed
    SocketSend(String),

    /// Reading from the socket failed
    SocketRecv(String),

    /// The peer closed the connection, or the session was disconnected
    SocketDisconnect(String),

    /// A blocking operation exceeded the session timeout
    Timeout,

    /// Non-blocking operation needs more I/O; retry after the socket is ready
    WouldBlock,

    /// Identification string could not be received or was malformed
    BannerRecv(String),

    /// Identification string could not be sent
    BannerSend(String),

    /// Protocol violation (malformed packet, unexpected message, bad banner)
    Protocol(String),

    /// Algorithm negotiation or key exchange failed
    KexFailure(String),

    /// Host key could not be parsed or was rejected
    HostKeyInit(String),

    /// Host key signature over the exchange hash did not verify
    HostKeySign(String),

    /// Packet decryption or MAC verification failed
    Decrypt(String),

    /// Compression or decompression failed
    Compression(String),

    /// The server rejected the credentials
    Authentication {
        /// Human readable message
        message: String,
        /// Methods the server still accepts
        methods: Vec<String>,
    },

    /// The server refused the offered public key
    PublicKeyUnverified(String),

    /// Local key material is unreadable or malformed, or the passphrase is wrong
    KeyFile(String),

    /// ssh-agent communication failed or no identity was accepted
    Agent(String),

    /// A global request (e.g. port forward) was denied
    RequestDenied(String),

    /// Operation issued in a state that does not allow it
    InvalidRequest(String),

    /// Channel open failed
    ChannelFailure(String),

    /// Channel request (exec, shell, subsystem, ...) was denied
    ChannelRequestDenied(String),

    /// Channel is closed
    ChannelClosed,

    /// EOF was already sent on this channel
    ChannelEof,

    /// Peer sent more data than the advertised window permits
    ChannelWindowExceeded(String),

    /// SFTP status or protocol error
    Sftp {
        /// SSH_FX_* status code, 0 for framing errors
        code: u32,
        /// Message from the server or the engine
        message: String,
    },

    /// SCP protocol error
    Scp(String),

    /// Requested algorithm or method is not implemented
    MethodNotSupported(String),

    /// Invalid configuration value
    Config(String),

    /// The peer sent SSH_MSG_DISCONNECT
    Disconnected {
        /// Disconnect reason code
        reason: u32,
        /// Description sent by the peer
        description: String,
    },

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl SshError {
    /// Returns the numeric error code for this error.
    pub fn code(&self) -> i32 {
        match self {
            SshError::Io(_) => codes::OTHER,
            SshError::SocketSend(_) => codes::SOCKET_SEND,
            SshError::SocketRecv(_) => codes::SOCKET_RECV,
            SshError::SocketDisconnect(_) => codes::SOCKET_DISCONNECT,
            SshError::Timeout => codes::TIMEOUT,
            SshError::WouldBlock => codes::EAGAIN,
            SshError::BannerRecv(_) => codes::BANNER_RECV,
            SshError::BannerSend(_) => codes::BANNER_SEND,
            SshError::Protocol(_) => codes::PROTO,
            SshError::KexFailure(_) => codes::KEX_FAILURE,
            SshError::HostKeyInit(_) => codes::HOSTKEY_INIT,
            SshError::HostKeySign(_) => codes::HOSTKEY_SIGN,
            SshError::Decrypt(_) => codes::DECRYPT,
            SshError::Compression(_) => codes::ZLIB,
            SshError::Authentication { .. } => codes::AUTHENTICATION_FAILED,
            SshError::PublicKeyUnverified(_) => codes::PUBLICKEY_UNVERIFIED,
            SshError::KeyFile(_) => codes::FILE,
            SshError::Agent(_) => codes::AGENT_PROTOCOL,
            SshError::RequestDenied(_) => codes::REQUEST_DENIED,
            SshError::InvalidRequest(_) => codes::INVAL,
            SshError::ChannelFailure(_) => codes::CHANNEL_FAILURE,
            SshError::ChannelRequestDenied(_) => codes::CHANNEL_REQUEST_DENIED,
            SshError::ChannelClosed => codes::CHANNEL_CLOSED,
            SshError::ChannelEof => codes::CHANNEL_EOF_SENT,
            SshError::ChannelWindowExceeded(_) => codes::CHANNEL_WINDOW_EXCEEDED,
            SshError::Sftp { .. } => codes::SFTP_PROTOCOL,
            SshError::Scp(_) => codes::SCP_PROTOCOL,
            SshError::MethodNotSupported(_) => codes::METHOD_NOT_SUPPORTED,
            SshError::Config(_) => codes::INVAL,
            SshError::Disconnected { .. } => codes::SOCKET_DISCONNECT,
            SshError::Other(_) => codes::OTHER,
        }
    }

    /// Returns true for the non-blocking retry signal.
    pub fn is_would_block(&self) -> bool {
        matches!(self, SshError::WouldBlock)
    }

    /// Returns true if the error leaves the connection unusable.
    ///
    /// Authentication rejections, denied requests and SFTP statuses do not
    /// invalidate the session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SshError::Io(_)
                | SshError::SocketSend(_)
                | SshError::SocketRecv(_)
                | SshError::SocketDisconnect(_)
                | SshError::BannerRecv(_)
                | SshError::BannerSend(_)
                | SshError::Protocol(_)
                | SshError::KexFailure(_)
                | SshError::HostKeyInit(_)
                | SshError::HostKeySign(_)
                | SshError::Decrypt(_)
                | SshError::Compression(_)
                | SshError::Disconnected { .. }
        )
    }

    /// Builds an SFTP error from a status code and message.
    pub fn sftp(code: u32, message: impl Into<String>) -> Self {
        SshError::Sftp {
            code,
            message: message.into(),
        }
    }

    /// Classifies an I/O error raised while writing.
    pub fn from_send(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::WouldBlock => SshError::WouldBlock,
            std::io::ErrorKind::TimedOut => SshError::Timeout,
            _ => SshError::SocketSend(err.to_string()),
        }
    }

    /// Classifies an I/O error raised while reading.
    pub fn from_recv(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::WouldBlock => SshError::WouldBlock,
            std::io::ErrorKind::TimedOut => SshError::Timeout,
            _ => SshError::SocketRecv(err.to_string()),
        }
    }
}

impl fmt::Display for SshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SshError::Io(e) => write!(f, "IO error: {}", e),
            SshError::SocketSend(msg) => write!(f, "Unable to send data: {}", msg),
            SshError::SocketRecv(msg) => write!(f, "Unable to receive data: {}", msg),
            SshError::SocketDisconnect(msg) => write!(f, "Socket disconnected: {}", msg),
            SshError::Timeout => write!(f, "Timed out waiting on socket"),
            SshError::WouldBlock => write!(f, "Would block"),
            SshError::BannerRecv(msg) => write!(f, "Banner receive error: {}", msg),
            SshError::BannerSend(msg) => write!(f, "Banner send error: {}", msg),
            SshError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            SshError::KexFailure(msg) => write!(f, "Key exchange failed: {}", msg),
            SshError::HostKeyInit(msg) => write!(f, "Host key error: {}", msg),
            SshError::HostKeySign(msg) => write!(f, "Host key signature error: {}", msg),
            SshError::Decrypt(msg) => write!(f, "Decryption error: {}", msg),
            SshError::Compression(msg) => write!(f, "Compression error: {}", msg),
            SshError::Authentication { message, methods } => {
                if methods.is_empty() {
                    write!(f, "Authentication failed: {}", message)
                } else {
                    write!(
                        f,
                        "Authentication failed: {} (can continue: {})",
                        message,
                        methods.join(",")
                    )
                }
            }
            SshError::PublicKeyUnverified(msg) => write!(f, "Public key unverified: {}", msg),
            SshError::KeyFile(msg) => write!(f, "Key file error: {}", msg),
            SshError::Agent(msg) => write!(f, "Agent error: {}", msg),
            SshError::RequestDenied(msg) => write!(f, "Request denied: {}", msg),
            SshError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            SshError::ChannelFailure(msg) => write!(f, "Channel failure: {}", msg),
            SshError::ChannelRequestDenied(msg) => write!(f, "Channel request denied: {}", msg),
            SshError::ChannelClosed => write!(f, "Channel is closed"),
            SshError::ChannelEof => write!(f, "EOF already sent on channel"),
            SshError::ChannelWindowExceeded(msg) => write!(f, "Window exceeded: {}", msg),
            SshError::Sftp { code, message } => write!(f, "SFTP error {}: {}", code, message),
            SshError::Scp(msg) => write!(f, "SCP protocol error: {}", msg),
            SshError::MethodNotSupported(msg) => write!(f, "Method not supported: {}", msg),
            SshError::Config(msg) => write!(f, "Configuration error: {}", msg),
            SshError::Disconnected {
                reason,
                description,
            } => write!(f, "Disconnected by peer ({}): {}", reason, description),
            SshError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for SshError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SshError::Io(e) => Some(e),
            SshError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SshError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::WouldBlock => SshError::WouldBlock,
            std::io::ErrorKind::TimedOut => SshError::Timeout,
            _ => SshError::Io(err),
        }
    }
}

impl From<SshError> for std::io::Error {
    fn from(err: SshError) -> Self {
        use std::io::ErrorKind;
        let kind = match &err {
            SshError::WouldBlock => ErrorKind::WouldBlock,
            SshError::Timeout => ErrorKind::TimedOut,
            SshError::SocketDisconnect(_) | SshError::Disconnected { .. } => {
                ErrorKind::ConnectionAborted
            }
            SshError::ChannelClosed => ErrorKind::BrokenPipe,
            SshError::Sftp { code: 2, .. } => ErrorKind::NotFound,
            SshError::Sftp { code: 3, .. } => ErrorKind::PermissionDenied,
            SshError::Io(e) => e.kind(),
            _ => ErrorKind::Other,
        };
        match err {
            SshError::Io(e) => e,
            other => std::io::Error::new(kind, other),
        }
    }
}

/// Result type for sshwire operations
pub type SshResult<T> = Result<T, SshError>;
