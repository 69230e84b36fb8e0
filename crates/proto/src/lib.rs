//! SSH2 client engine.
//!
//! `sshwire-proto` implements the client side of the SSH2 protocol suite:
//!
//! - **Transport** - banner exchange, key exchange, AES-CTR/GCM, HMAC,
//!   zlib compression and rekeying (RFC 4253)
//! - **Authentication** - password, public key (files, memory, agent,
//!   certificates) and keyboard-interactive (RFC 4252, RFC 4256)
//! - **Channels** - sessions, exec/shell/subsystem, direct and reverse
//!   TCP/IP forwarding with flow-control windows (RFC 4254)
//! - **SFTP** v3 and **SCP** file transfer
//!
//! Every operation works in blocking or non-blocking mode. In non-blocking
//! mode a call that cannot finish returns
//! [`SshError::WouldBlock`](sshwire_platform::SshError::WouldBlock) and
//! resumes where it left off when called again.
//!
//! # Features
//!
//! - `ssh` (default) - the protocol engine
//! - `async` (default) - a tokio driver for non-blocking sessions
//!
//! # Example
//!
//! ```rust,no_run
//! use std::io::Read;
//! use std::net::TcpStream;
//! use sshwire_proto::ssh::Session;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Session::new();
//! session.set_tcp_stream(TcpStream::connect("127.0.0.1:22")?);
//! session.handshake()?;
//! session.userauth_password("user", "password")?;
//!
//! let mut channel = session.channel_session()?;
//! channel.exec("echo hello")?;
//! let mut output = String::new();
//! channel.read_to_string(&mut output)?;
//! channel.wait_closed()?;
//! println!("{} (exit {})", output, channel.exit_status()?);
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - All cryptographic operations use vetted libraries (`ring`, `dalek`,
//!   RustCrypto)
//! - Secret key material is zeroized on drop with `zeroize`
//! - Packet parsing is bounds-checked and fuzzed

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
