//! SSH2 client engine.
//!
//! # Architecture
//!
//! The engine is layered:
//!
//! 1. **Wire codec** ([`wire`], [`packet`]) - SSH data types and the binary
//!    packet protocol (RFC 4251 Section 5, RFC 4253 Section 6)
//! 2. **Transport** ([`transport`], [`kex`], [`kex_dh`], [`crypto`]) - banner
//!    exchange, key exchange, encryption, MAC and compression (RFC 4253)
//! 3. **Authentication** ([`auth`], [`privatekey`], [`agent`]) - user
//!    authentication (RFC 4252, RFC 4256)
//! 4. **Connection** ([`connection`], [`channel`]) - channels, windows and
//!    requests (RFC 4254)
//! 5. **Session API** ([`session`], [`sftp`], [`scp`]) - the public
//!    client surface, blocking or non-blocking
//!
//! The engine does no I/O scheduling of its own. In non-blocking mode each
//! operation either completes or returns
//! [`SshError::WouldBlock`](sshwire_platform::SshError::WouldBlock) with its
//! progress kept, and [`session::Session::block_directions`] says what to
//! wait for. The `async` feature adds [`async_session`], which does that
//! waiting on tokio.
//!
//! # Example
//!
//! ```rust
//! use sshwire_proto::ssh::Packet;
//!
//! let packet = Packet::new(b"SSH-MSG-KEXINIT payload".to_vec());
//! let bytes = packet.to_bytes();
//!
//! let parsed = Packet::from_bytes(&bytes).unwrap();
//! assert_eq!(parsed.payload(), b"SSH-MSG-KEXINIT payload");
//! ```
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol
//! - [RFC 4256](https://datatracker.ietf.org/doc/html/rfc4256) - Keyboard-Interactive Authentication

pub mod agent;
#[cfg(feature = "async")]
pub mod async_session;
pub mod auth;
pub mod channel;
pub mod connection;
pub mod crypto;
pub mod hostkey;
pub mod kex;
pub mod kex_dh;
pub mod known_hosts;
pub mod message;
pub mod packet;
pub mod privatekey;
pub mod scp;
pub mod session;
pub mod sftp;
pub mod transport;
pub mod version;
pub mod wire;

// Re-export main types
pub use agent::{Agent, AgentIdentity};
#[cfg(feature = "async")]
pub use async_session::AsyncSession;
pub use auth::{KeyboardInteractivePrompt, Prompt};
pub use connection::{ChannelOpenFailureReason, ChannelRequestType, ChannelType};
pub use crypto::{CipherAlgorithm, CompressionAlgorithm, MacAlgorithm};
pub use hostkey::{HashType, HostKey, HostKeyAlgorithm, PublicKey};
pub use kex::{MethodType, Preferences};
pub use known_hosts::{CheckResult, KnownHost, KnownHosts};
pub use message::MessageType;
pub use packet::{Decoded, Packet, PacketCodec};
pub use privatekey::{Certificate, PrivateKey, PublicIdentity};
pub use scp::{ControlLine, ScpFileInfo};
pub use session::{
    Channel, ExitSignal, ExtendedData, HostKeyType, Listener, ReadWindow, Session, SessionFlag,
    WriteWindow,
};
pub use sftp::{File, FileAttributes, FileMode, FileOpenFlags, FileType, SftpErrorCode, Sftp};
pub use transport::{Role, Transport, TransportConfig};
pub use version::Version;
