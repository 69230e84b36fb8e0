//! SSH connection protocol (RFC 4254).
//!
//! Message codecs for the connection layer:
//! - Channel open / confirmation / failure
//! - Channel flow control (window adjust), data and extended data
//! - Channel EOF and close
//! - Channel requests: pty-req, env, exec, shell, subsystem, window-change,
//!   signal, exit-status, exit-signal
//! - Global requests: tcpip-forward, cancel-tcpip-forward,
//!   keepalive@openssh.com
//!
//! Per-channel bookkeeping lives in [`channel`](crate::ssh::channel).
//!
//! # Example
//!
//! ```rust
//! use sshwire_proto::ssh::connection::{ChannelOpen, ChannelType};
//!
//! // Open a session channel
//! let open = ChannelOpen::new(
//!     ChannelType::Session,
//!     0,           // sender channel
//!     2097152,     // initial window size (2MB)
//!     32768,       // maximum packet size (32KB)
//! );
//! ```

use bytes::{BufMut, BytesMut};
use sshwire_platform::{SshError, SshResult};

use crate::ssh::message::MessageType;
use crate::ssh::wire::{
    read_bool, read_bytes, read_string, read_u32, write_bool, write_bytes, write_string,
};

/// Maximum window size (16 MB).
pub const MAX_WINDOW_SIZE: u32 = 16 * 1024 * 1024;

/// Maximum packet size (256 KB).
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Default receive window offered for new channels (2 MB).
pub const DEFAULT_WINDOW_SIZE: u32 = 2 * 1024 * 1024;

/// Default maximum packet size offered for new channels (32 KB).
pub const DEFAULT_PACKET_SIZE: u32 = 32 * 1024;

/// Extended data type code for stderr (RFC 4254 Section 5.2).
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// Global request name used for keepalives.
pub const KEEPALIVE_REQUEST: &str = "keepalive@openssh.com";

fn expect_type(data: &[u8], expected: MessageType) -> SshResult<()> {
    match data.first() {
        None => Err(SshError::Protocol(format!("{} message is empty", expected.name()))),
        Some(&t) if t != expected as u8 => Err(SshError::Protocol(format!(
            "Invalid message type: expected {}, got {}",
            expected, t
        ))),
        Some(_) => Ok(()),
    }
}

/// Returns the recipient channel of a channel-specific message (types 91-100).
pub fn recipient_channel(payload: &[u8]) -> SshResult<u32> {
    let mut offset = 1;
    read_u32(payload, &mut offset)
}

/// Channel type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelType {
    /// Session channel (interactive shell, exec, subsystem).
    Session,
    /// Direct TCP/IP channel (port forwarding).
    DirectTcpip {
        /// Host to connect to
        host: String,
        /// Port to connect to
        port: u32,
        /// Originator IP address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
    /// Forwarded TCP/IP channel (reverse port forwarding).
    ForwardedTcpip {
        /// Connected address
        connected_address: String,
        /// Connected port
        connected_port: u32,
        /// Originator IP address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
    /// Any other channel type; its type-specific data is kept verbatim.
    Other {
        /// Channel type name
        name: String,
        /// Type-specific data
        data: Vec<u8>,
    },
}

impl ChannelType {
    /// Returns the channel type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelType::Session => "session",
            ChannelType::DirectTcpip { .. } => "direct-tcpip",
            ChannelType::ForwardedTcpip { .. } => "forwarded-tcpip",
            ChannelType::Other { name, .. } => name,
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN message (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    channel_type: ChannelType,
    sender_channel: u32,
    initial_window_size: u32,
    maximum_packet_size: u32,
}

impl ChannelOpen {
    /// Creates a new channel open message.
    pub fn new(
        channel_type: ChannelType,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Self {
        Self {
            channel_type,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        }
    }

    /// Returns the channel type.
    pub fn channel_type(&self) -> &ChannelType {
        &self.channel_type
    }

    /// Returns the sender channel number.
    pub fn sender_channel(&self) -> u32 {
        self.sender_channel
    }

    /// Returns the initial window size.
    pub fn initial_window_size(&self) -> u32 {
        self.initial_window_size
    }

    /// Returns the maximum packet size.
    pub fn maximum_packet_size(&self) -> u32 {
        self.maximum_packet_size
    }

    /// Serializes to bytes.
    ///
    /// Format (RFC 4254 Section 5.1):
    /// ```text
    /// byte      SSH_MSG_CHANNEL_OPEN (90)
    /// string    channel type
    /// uint32    sender channel
    /// uint32    initial window size
    /// uint32    maximum packet size
    /// ....      channel type specific data
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpen as u8);
        write_string(&mut buf, self.channel_type.name());
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);

        match &self.channel_type {
            ChannelType::Session => {}
            ChannelType::DirectTcpip {
                host,
                port,
                originator_address,
                originator_port,
            } => {
                write_string(&mut buf, host);
                buf.put_u32(*port);
                write_string(&mut buf, originator_address);
                buf.put_u32(*originator_port);
            }
            ChannelType::ForwardedTcpip {
                connected_address,
                connected_port,
                originator_address,
                originator_port,
            } => {
                write_string(&mut buf, connected_address);
                buf.put_u32(*connected_port);
                write_string(&mut buf, originator_address);
                buf.put_u32(*originator_port);
            }
            ChannelType::Other { data, .. } => buf.put_slice(data),
        }

        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SshResult<Self> {
        expect_type(data, MessageType::ChannelOpen)?;
        let mut offset = 1;

        let type_name = read_string(data, &mut offset)?;
        let sender_channel = read_u32(data, &mut offset)?;
        let initial_window_size = read_u32(data, &mut offset)?;
        let maximum_packet_size = read_u32(data, &mut offset)?;

        let channel_type = match type_name.as_str() {
            "session" => ChannelType::Session,
            "direct-tcpip" => ChannelType::DirectTcpip {
                host: read_string(data, &mut offset)?,
                port: read_u32(data, &mut offset)?,
                originator_address: read_string(data, &mut offset)?,
                originator_port: read_u32(data, &mut offset)?,
            },
            "forwarded-tcpip" => ChannelType::ForwardedTcpip {
                connected_address: read_string(data, &mut offset)?,
                connected_port: read_u32(data, &mut offset)?,
                originator_address: read_string(data, &mut offset)?,
                originator_port: read_u32(data, &mut offset)?,
            },
            _ => ChannelType::Other {
                name: type_name,
                data: data[offset..].to_vec(),
            },
        };

        Ok(Self {
            channel_type,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION message (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    recipient_channel: u32,
    sender_channel: u32,
    initial_window_size: u32,
    maximum_packet_size: u32,
}

impl ChannelOpenConfirmation {
    /// Creates a new channel open confirmation.
    pub fn new(
        recipient_channel: u32,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Self {
        Self {
            recipient_channel,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the sender channel number.
    pub fn sender_channel(&self) -> u32 {
        self.sender_channel
    }

    /// Returns the initial window size.
    pub fn initial_window_size(&self) -> u32 {
        self.initial_window_size
    }

    /// Returns the maximum packet size.
    pub fn maximum_packet_size(&self) -> u32 {
        self.maximum_packet_size
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpenConfirmation as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SshResult<Self> {
        expect_type(data, MessageType::ChannelOpenConfirmation)?;
        let mut offset = 1;
        Ok(Self {
            recipient_channel: read_u32(data, &mut offset)?,
            sender_channel: read_u32(data, &mut offset)?,
            initial_window_size: read_u32(data, &mut offset)?,
            maximum_packet_size: read_u32(data, &mut offset)?,
        })
    }
}

/// Channel open failure reason codes (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChannelOpenFailureReason {
    /// Administratively prohibited
    AdministrativelyProhibited = 1,
    /// Connect failed
    ConnectFailed = 2,
    /// Unknown channel type
    UnknownChannelType = 3,
    /// Resource shortage
    ResourceShortage = 4,
}

impl ChannelOpenFailureReason {
    /// Converts from u32.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::AdministrativelyProhibited),
            2 => Some(Self::ConnectFailed),
            3 => Some(Self::UnknownChannelType),
            4 => Some(Self::ResourceShortage),
            _ => None,
        }
    }

    /// Returns the reason as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdministrativelyProhibited => "Administratively prohibited",
            Self::ConnectFailed => "Connect failed",
            Self::UnknownChannelType => "Unknown channel type",
            Self::ResourceShortage => "Resource shortage",
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE message (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    recipient_channel: u32,
    reason_code: u32,
    description: String,
    language_tag: String,
}

impl ChannelOpenFailure {
    /// Creates a new channel open failure message.
    pub fn new(
        recipient_channel: u32,
        reason: ChannelOpenFailureReason,
        description: impl Into<String>,
    ) -> Self {
        Self {
            recipient_channel,
            reason_code: reason as u32,
            description: description.into(),
            language_tag: String::new(),
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the raw reason code.
    pub fn reason_code(&self) -> u32 {
        self.reason_code
    }

    /// Returns the reason, if it is one of the RFC codes.
    pub fn reason(&self) -> Option<ChannelOpenFailureReason> {
        ChannelOpenFailureReason::from_u32(self.reason_code)
    }

    /// Returns the description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpenFailure as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.reason_code);
        write_string(&mut buf, &self.description);
        write_string(&mut buf, &self.language_tag);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SshResult<Self> {
        expect_type(data, MessageType::ChannelOpenFailure)?;
        let mut offset = 1;
        Ok(Self {
            recipient_channel: read_u32(data, &mut offset)?,
            reason_code: read_u32(data, &mut offset)?,
            description: read_string(data, &mut offset)?,
            language_tag: read_string(data, &mut offset)?,
        })
    }

    /// Converts the failure into the error surfaced to callers.
    pub fn to_error(&self) -> SshError {
        let reason = self
            .reason()
            .map(|r| r.as_str().to_string())
            .unwrap_or_else(|| format!("reason {}", self.reason_code));
        let message = if self.description.is_empty() {
            format!("Channel open failure: {}", reason)
        } else {
            format!("Channel open failure: {} ({})", reason, self.description)
        };
        match self.reason() {
            Some(ChannelOpenFailureReason::AdministrativelyProhibited) => {
                SshError::RequestDenied(message)
            }
            _ => SshError::ChannelFailure(message),
        }
    }
}

/// SSH_MSG_CHANNEL_WINDOW_ADJUST message (RFC 4254 Section 5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelWindowAdjust {
    recipient_channel: u32,
    bytes_to_add: u32,
}

impl ChannelWindowAdjust {
    /// Creates a new window adjust message.
    pub fn new(recipient_channel: u32, bytes_to_add: u32) -> Self {
        Self {
            recipient_channel,
            bytes_to_add,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the number of bytes to add.
    pub fn bytes_to_add(&self) -> u32 {
        self.bytes_to_add
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelWindowAdjust as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.bytes_to_add);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SshResult<Self> {
        expect_type(data, MessageType::ChannelWindowAdjust)?;
        let mut offset = 1;
        Ok(Self {
            recipient_channel: read_u32(data, &mut offset)?,
            bytes_to_add: read_u32(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_CHANNEL_DATA message (RFC 4254 Section 5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    recipient_channel: u32,
    data: Vec<u8>,
}

impl ChannelData {
    /// Creates a new data message.
    pub fn new(recipient_channel: u32, data: Vec<u8>) -> Self {
        Self {
            recipient_channel,
            data,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the message and returns the data.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(9 + self.data.len());
        buf.put_u8(MessageType::ChannelData as u8);
        buf.put_u32(self.recipient_channel);
        write_bytes(&mut buf, &self.data);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SshResult<Self> {
        expect_type(data, MessageType::ChannelData)?;
        let mut offset = 1;
        Ok(Self {
            recipient_channel: read_u32(data, &mut offset)?,
            data: read_bytes(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_CHANNEL_EXTENDED_DATA message (RFC 4254 Section 5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelExtendedData {
    recipient_channel: u32,
    data_type_code: u32,
    data: Vec<u8>,
}

impl ChannelExtendedData {
    /// Creates a new extended data message.
    pub fn new(recipient_channel: u32, data_type_code: u32, data: Vec<u8>) -> Self {
        Self {
            recipient_channel,
            data_type_code,
            data,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the data type code (1 = stderr).
    pub fn data_type_code(&self) -> u32 {
        self.data_type_code
    }

    /// Returns the data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the message and returns the data.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(13 + self.data.len());
        buf.put_u8(MessageType::ChannelExtendedData as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.data_type_code);
        write_bytes(&mut buf, &self.data);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SshResult<Self> {
        expect_type(data, MessageType::ChannelExtendedData)?;
        let mut offset = 1;
        Ok(Self {
            recipient_channel: read_u32(data, &mut offset)?,
            data_type_code: read_u32(data, &mut offset)?,
            data: read_bytes(data, &mut offset)?,
        })
    }
}

macro_rules! recipient_only_message {
    ($(#[$doc:meta])* $name:ident, $ty:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            recipient_channel: u32,
        }

        impl $name {
            /// Creates the message.
            pub fn new(recipient_channel: u32) -> Self {
                Self { recipient_channel }
            }

            /// Returns the recipient channel number.
            pub fn recipient_channel(&self) -> u32 {
                self.recipient_channel
            }

            /// Serializes to bytes.
            pub fn to_bytes(&self) -> Vec<u8> {
                let mut buf = BytesMut::with_capacity(5);
                buf.put_u8($ty as u8);
                buf.put_u32(self.recipient_channel);
                buf.to_vec()
            }

            /// Parses from bytes.
            pub fn from_bytes(data: &[u8]) -> SshResult<Self> {
                expect_type(data, $ty)?;
                let mut offset = 1;
                Ok(Self {
                    recipient_channel: read_u32(data, &mut offset)?,
                })
            }
        }
    };
}

recipient_only_message!(
    /// SSH_MSG_CHANNEL_EOF message (RFC 4254 Section 5.3).
    ChannelEof,
    MessageType::ChannelEof
);
recipient_only_message!(
    /// SSH_MSG_CHANNEL_CLOSE message (RFC 4254 Section 5.3).
    ChannelClose,
    MessageType::ChannelClose
);
recipient_only_message!(
    /// SSH_MSG_CHANNEL_SUCCESS message (RFC 4254 Section 5.4).
    ChannelSuccess,
    MessageType::ChannelSuccess
);
recipient_only_message!(
    /// SSH_MSG_CHANNEL_FAILURE message (RFC 4254 Section 5.4).
    ChannelFailure,
    MessageType::ChannelFailure
);

/// Channel request type (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequestType {
    /// PTY request (pseudoterminal allocation)
    PtyReq {
        /// Terminal type (e.g., "xterm")
        term: String,
        /// Terminal width in characters
        width_chars: u32,
        /// Terminal height in rows
        height_rows: u32,
        /// Terminal width in pixels
        width_pixels: u32,
        /// Terminal height in pixels
        height_pixels: u32,
        /// Encoded terminal modes
        modes: Vec<u8>,
    },
    /// Terminal size change
    WindowChange {
        /// Terminal width in characters
        width_chars: u32,
        /// Terminal height in rows
        height_rows: u32,
        /// Terminal width in pixels
        width_pixels: u32,
        /// Terminal height in pixels
        height_pixels: u32,
    },
    /// Environment variable
    Env {
        /// Variable name
        name: String,
        /// Variable value
        value: String,
    },
    /// Execute command
    Exec {
        /// Command to execute
        command: String,
    },
    /// Start interactive shell
    Shell,
    /// Start subsystem (e.g., "sftp")
    Subsystem {
        /// Subsystem name
        name: String,
    },
    /// Deliver a signal to the remote process
    Signal {
        /// Signal name without the "SIG" prefix
        signal_name: String,
    },
    /// Exit status
    ExitStatus {
        /// Exit status code
        exit_status: u32,
    },
    /// Exit signal
    ExitSignal {
        /// Signal name
        signal_name: String,
        /// Core dumped flag
        core_dumped: bool,
        /// Error message
        error_message: String,
        /// Language tag
        language_tag: String,
    },
    /// Any other request; its data is kept verbatim.
    Other {
        /// Request name
        name: String,
        /// Request-specific data
        data: Vec<u8>,
    },
}

impl ChannelRequestType {
    /// Returns the request type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelRequestType::PtyReq { .. } => "pty-req",
            ChannelRequestType::WindowChange { .. } => "window-change",
            ChannelRequestType::Env { .. } => "env",
            ChannelRequestType::Exec { .. } => "exec",
            ChannelRequestType::Shell => "shell",
            ChannelRequestType::Subsystem { .. } => "subsystem",
            ChannelRequestType::Signal { .. } => "signal",
            ChannelRequestType::ExitStatus { .. } => "exit-status",
            ChannelRequestType::ExitSignal { .. } => "exit-signal",
            ChannelRequestType::Other { name, .. } => name,
        }
    }
}

/// SSH_MSG_CHANNEL_REQUEST message (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    recipient_channel: u32,
    request_type: ChannelRequestType,
    want_reply: bool,
}

impl ChannelRequest {
    /// Creates a new channel request.
    pub fn new(recipient_channel: u32, request_type: ChannelRequestType, want_reply: bool) -> Self {
        Self {
            recipient_channel,
            request_type,
            want_reply,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the request type.
    pub fn request_type(&self) -> &ChannelRequestType {
        &self.request_type
    }

    /// Returns whether a reply is wanted.
    pub fn want_reply(&self) -> bool {
        self.want_reply
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();

        buf.put_u8(MessageType::ChannelRequest as u8);
        buf.put_u32(self.recipient_channel);
        write_string(&mut buf, self.request_type.name());
        write_bool(&mut buf, self.want_reply);

        match &self.request_type {
            ChannelRequestType::PtyReq {
                term,
                width_chars,
                height_rows,
                width_pixels,
                height_pixels,
                modes,
            } => {
                write_string(&mut buf, term);
                buf.put_u32(*width_chars);
                buf.put_u32(*height_rows);
                buf.put_u32(*width_pixels);
                buf.put_u32(*height_pixels);
                write_bytes(&mut buf, modes);
            }
            ChannelRequestType::WindowChange {
                width_chars,
                height_rows,
                width_pixels,
                height_pixels,
            } => {
                buf.put_u32(*width_chars);
                buf.put_u32(*height_rows);
                buf.put_u32(*width_pixels);
                buf.put_u32(*height_pixels);
            }
            ChannelRequestType::Env { name, value } => {
                write_string(&mut buf, name);
                write_string(&mut buf, value);
            }
            ChannelRequestType::Exec { command } => write_string(&mut buf, command),
            ChannelRequestType::Shell => {}
            ChannelRequestType::Subsystem { name } => write_string(&mut buf, name),
            ChannelRequestType::Signal { signal_name } => write_string(&mut buf, signal_name),
            ChannelRequestType::ExitStatus { exit_status } => buf.put_u32(*exit_status),
            ChannelRequestType::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
                language_tag,
            } => {
                write_string(&mut buf, signal_name);
                write_bool(&mut buf, *core_dumped);
                write_string(&mut buf, error_message);
                write_string(&mut buf, language_tag);
            }
            ChannelRequestType::Other { data, .. } => buf.put_slice(data),
        }

        buf.to_vec()
    }

    /// Parses from bytes.
    ///
    /// Unknown request names parse as [`ChannelRequestType::Other`] so the
    /// receiver can answer them with SSH_MSG_CHANNEL_FAILURE.
    pub fn from_bytes(data: &[u8]) -> SshResult<Self> {
        expect_type(data, MessageType::ChannelRequest)?;
        let mut offset = 1;

        let recipient_channel = read_u32(data, &mut offset)?;
        let request_name = read_string(data, &mut offset)?;
        let want_reply = read_bool(data, &mut offset)?;

        let request_type = match request_name.as_str() {
            "pty-req" => ChannelRequestType::PtyReq {
                term: read_string(data, &mut offset)?,
                width_chars: read_u32(data, &mut offset)?,
                height_rows: read_u32(data, &mut offset)?,
                width_pixels: read_u32(data, &mut offset)?,
                height_pixels: read_u32(data, &mut offset)?,
                modes: read_bytes(data, &mut offset)?,
            },
            "window-change" => ChannelRequestType::WindowChange {
                width_chars: read_u32(data, &mut offset)?,
                height_rows: read_u32(data, &mut offset)?,
                width_pixels: read_u32(data, &mut offset)?,
                height_pixels: read_u32(data, &mut offset)?,
            },
            "env" => ChannelRequestType::Env {
                name: read_string(data, &mut offset)?,
                value: read_string(data, &mut offset)?,
            },
            "exec" => ChannelRequestType::Exec {
                command: read_string(data, &mut offset)?,
            },
            "shell" => ChannelRequestType::Shell,
            "subsystem" => ChannelRequestType::Subsystem {
                name: read_string(data, &mut offset)?,
            },
            "signal" => ChannelRequestType::Signal {
                signal_name: read_string(data, &mut offset)?,
            },
            "exit-status" => ChannelRequestType::ExitStatus {
                exit_status: read_u32(data, &mut offset)?,
            },
            "exit-signal" => ChannelRequestType::ExitSignal {
                signal_name: read_string(data, &mut offset)?,
                core_dumped: read_bool(data, &mut offset)?,
                error_message: read_string(data, &mut offset)?,
                language_tag: read_string(data, &mut offset)?,
            },
            _ => ChannelRequestType::Other {
                name: request_name,
                data: data[offset..].to_vec(),
            },
        };

        Ok(Self {
            recipient_channel,
            request_type,
            want_reply,
        })
    }
}

/// Global request type (RFC 4254 Sections 4 and 7.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalRequestType {
    /// Ask the server to listen on `address:port` and forward connections
    TcpipForward {
        /// Address to bind
        address: String,
        /// Port to bind (0 lets the server choose)
        port: u32,
    },
    /// Cancel a previous `tcpip-forward`
    CancelTcpipForward {
        /// Bound address
        address: String,
        /// Bound port
        port: u32,
    },
    /// OpenSSH keepalive probe
    Keepalive,
    /// Any other request
    Other {
        /// Request name
        name: String,
        /// Request-specific data
        data: Vec<u8>,
    },
}

impl GlobalRequestType {
    /// Returns the request name.
    pub fn name(&self) -> &str {
        match self {
            GlobalRequestType::TcpipForward { .. } => "tcpip-forward",
            GlobalRequestType::CancelTcpipForward { .. } => "cancel-tcpip-forward",
            GlobalRequestType::Keepalive => KEEPALIVE_REQUEST,
            GlobalRequestType::Other { name, .. } => name,
        }
    }
}

/// SSH_MSG_GLOBAL_REQUEST message (RFC 4254 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalRequest {
    /// Request
    pub request_type: GlobalRequestType,
    /// Want reply flag
    pub want_reply: bool,
}

impl GlobalRequest {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::GlobalRequest as u8);
        write_string(&mut buf, self.request_type.name());
        write_bool(&mut buf, self.want_reply);
        match &self.request_type {
            GlobalRequestType::TcpipForward { address, port }
            | GlobalRequestType::CancelTcpipForward { address, port } => {
                write_string(&mut buf, address);
                buf.put_u32(*port);
            }
            GlobalRequestType::Keepalive => {}
            GlobalRequestType::Other { data, .. } => buf.put_slice(data),
        }
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SshResult<Self> {
        expect_type(data, MessageType::GlobalRequest)?;
        let mut offset = 1;
        let name = read_string(data, &mut offset)?;
        let want_reply = read_bool(data, &mut offset)?;
        let request_type = match name.as_str() {
            "tcpip-forward" => GlobalRequestType::TcpipForward {
                address: read_string(data, &mut offset)?,
                port: read_u32(data, &mut offset)?,
            },
            "cancel-tcpip-forward" => GlobalRequestType::CancelTcpipForward {
                address: read_string(data, &mut offset)?,
                port: read_u32(data, &mut offset)?,
            },
            KEEPALIVE_REQUEST => GlobalRequestType::Keepalive,
            _ => GlobalRequestType::Other {
                name,
                data: data[offset..].to_vec(),
            },
        };
        Ok(Self {
            request_type,
            want_reply,
        })
    }
}

/// SSH_MSG_REQUEST_SUCCESS message (RFC 4254 Section 4).
///
/// For `tcpip-forward` with port 0 the data holds the bound port.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestSuccess {
    /// Response-specific data
    pub data: Vec<u8>,
}

impl RequestSuccess {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(1 + self.data.len());
        buf.put_u8(MessageType::RequestSuccess as u8);
        buf.put_slice(&self.data);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SshResult<Self> {
        expect_type(data, MessageType::RequestSuccess)?;
        Ok(Self {
            data: data[1..].to_vec(),
        })
    }

    /// Bound port carried in a `tcpip-forward` reply.
    pub fn bound_port(&self) -> Option<u32> {
        let mut offset = 0;
        read_u32(&self.data, &mut offset).ok()
    }
}

/// SSH_MSG_REQUEST_FAILURE payload.
pub fn request_failure() -> Vec<u8> {
    vec![MessageType::RequestFailure as u8]
}
