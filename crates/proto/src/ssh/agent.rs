//! SSH agent client (draft-miller-ssh-agent).
//!
//! Talks to a running agent over its Unix domain socket, normally the one
//! named by `SSH_AUTH_SOCK`. Only the two requests needed for public key
//! authentication are implemented: listing identities and signing.
//!
//! ```no_run
//! use sshwire_proto::ssh::agent::Agent;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut agent = Agent::connect()?;
//! for identity in agent.list_identities()? {
//!     println!("{} {}", identity.key_type(), identity.comment());
//! }
//! # Ok(())
//! # }
//! ```

use std::io::{Read, Write};
use std::path::Path;

use bytes::{BufMut, BytesMut};
use sshwire_platform::{SshError, SshResult};
use tracing::{debug, trace};

use crate::ssh::hostkey::HostKeyAlgorithm;
use crate::ssh::wire::{read_bytes, read_string, read_u32, read_u8, write_bytes};

/// Environment variable holding the agent socket path.
pub const AUTH_SOCK_ENV: &str = "SSH_AUTH_SOCK";

/// Largest agent reply accepted.
pub const MAX_AGENT_REPLY: usize = 256 * 1024;

/// Agent protocol message numbers.
pub mod message {
    /// Generic failure
    pub const FAILURE: u8 = 5;
    /// Generic success
    pub const SUCCESS: u8 = 6;
    /// List identities request
    pub const REQUEST_IDENTITIES: u8 = 11;
    /// List identities reply
    pub const IDENTITIES_ANSWER: u8 = 12;
    /// Sign request
    pub const SIGN_REQUEST: u8 = 13;
    /// Sign reply
    pub const SIGN_RESPONSE: u8 = 14;

    /// Sign with rsa-sha2-256
    pub const FLAG_RSA_SHA2_256: u32 = 0x02;
    /// Sign with rsa-sha2-512
    pub const FLAG_RSA_SHA2_512: u32 = 0x04;
}

/// One key held by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    blob: Vec<u8>,
    comment: String,
}

impl AgentIdentity {
    /// Creates an identity from a key blob and comment.
    pub fn new(blob: Vec<u8>, comment: impl Into<String>) -> Self {
        Self {
            blob,
            comment: comment.into(),
        }
    }

    /// Public key blob.
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    /// Comment the key was added with.
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// Key type from the blob, or an empty string if it is malformed.
    pub fn key_type(&self) -> String {
        let mut offset = 0;
        read_string(&self.blob, &mut offset).unwrap_or_default()
    }
}

/// Connection to an SSH agent.
pub struct Agent {
    #[cfg(unix)]
    stream: std::os::unix::net::UnixStream,
    identities: Vec<AgentIdentity>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("identities", &self.identities.len())
            .finish()
    }
}

impl Agent {
    /// Connects to the agent named by `SSH_AUTH_SOCK`.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Agent`] if the variable is unset or the socket
    /// cannot be reached.
    pub fn connect() -> SshResult<Self> {
        let path = std::env::var_os(AUTH_SOCK_ENV)
            .ok_or_else(|| SshError::Agent(format!("{} is not set", AUTH_SOCK_ENV)))?;
        Self::connect_to(path)
    }

    /// Connects to the agent socket at `path`.
    #[cfg(unix)]
    pub fn connect_to<P: AsRef<Path>>(path: P) -> SshResult<Self> {
        let path = path.as_ref();
        let stream = std::os::unix::net::UnixStream::connect(path).map_err(|e| {
            SshError::Agent(format!("Unable to connect to {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "Connected to agent");
        Ok(Self {
            stream,
            identities: Vec::new(),
        })
    }

    /// Agent sockets are Unix domain sockets; other platforms have none.
    #[cfg(not(unix))]
    pub fn connect_to<P: AsRef<Path>>(path: P) -> SshResult<Self> {
        Err(SshError::Agent(format!(
            "Agent sockets are not supported on this platform: {}",
            path.as_ref().display()
        )))
    }

    /// Fetches the identities the agent holds.
    pub fn list_identities(&mut self) -> SshResult<&[AgentIdentity]> {
        let reply = self.request(&[message::REQUEST_IDENTITIES])?;
        let mut offset = 0;
        match read_u8(&reply, &mut offset).map_err(agent_error)? {
            message::IDENTITIES_ANSWER => {}
            message::FAILURE => {
                return Err(SshError::Agent("Agent refused to list identities".to_string()))
            }
            other => {
                return Err(SshError::Agent(format!(
                    "Unexpected agent reply {} to identity request",
                    other
                )))
            }
        }

        let count = read_u32(&reply, &mut offset).map_err(agent_error)?;
        let mut identities = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            let blob = read_bytes(&reply, &mut offset).map_err(agent_error)?;
            let comment = read_string(&reply, &mut offset).map_err(agent_error)?;
            identities.push(AgentIdentity { blob, comment });
        }
        debug!(count = identities.len(), "Agent identities loaded");
        self.identities = identities;
        Ok(&self.identities)
    }

    /// Identities from the last [`list_identities`](Self::list_identities).
    pub fn identities(&self) -> &[AgentIdentity] {
        &self.identities
    }

    /// Asks the agent to sign `data` with `identity`.
    ///
    /// For RSA keys `algorithm` selects the hash through the request flags.
    /// Returns the signature blob exactly as the agent produced it.
    pub fn sign(
        &mut self,
        identity: &AgentIdentity,
        data: &[u8],
        algorithm: HostKeyAlgorithm,
    ) -> SshResult<Vec<u8>> {
        let flags = match algorithm {
            HostKeyAlgorithm::RsaSha2_256 => message::FLAG_RSA_SHA2_256,
            HostKeyAlgorithm::RsaSha2_512 => message::FLAG_RSA_SHA2_512,
            _ => 0,
        };

        let mut buf = BytesMut::new();
        buf.put_u8(message::SIGN_REQUEST);
        write_bytes(&mut buf, &identity.blob);
        write_bytes(&mut buf, data);
        buf.put_u32(flags);

        let reply = self.request(&buf)?;
        let mut offset = 0;
        match read_u8(&reply, &mut offset).map_err(agent_error)? {
            message::SIGN_RESPONSE => read_bytes(&reply, &mut offset).map_err(agent_error),
            message::FAILURE => Err(SshError::Agent(format!(
                "Agent refused to sign with {}",
                identity.key_type()
            ))),
            other => Err(SshError::Agent(format!(
                "Unexpected agent reply {} to sign request",
                other
            ))),
        }
    }

    #[cfg(unix)]
    fn request(&mut self, body: &[u8]) -> SshResult<Vec<u8>> {
        trace!(kind = body[0], len = body.len(), "Agent request");
        write_frame(&mut self.stream, body)?;
        read_frame(&mut self.stream)
    }

    #[cfg(not(unix))]
    fn request(&mut self, _body: &[u8]) -> SshResult<Vec<u8>> {
        Err(SshError::Agent("Agent is not connected".to_string()))
    }
}

/// Writes one length-prefixed agent message.
pub fn write_frame<W: Write>(writer: &mut W, body: &[u8]) -> SshResult<()> {
    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    writer
        .write_all(&frame)
        .and_then(|_| writer.flush())
        .map_err(|e| SshError::Agent(format!("Agent write failed: {}", e)))
}

/// Reads one length-prefixed agent message.
pub fn read_frame<R: Read>(reader: &mut R) -> SshResult<Vec<u8>> {
    let mut len = [0u8; 4];
    reader
        .read_exact(&mut len)
        .map_err(|e| SshError::Agent(format!("Agent read failed: {}", e)))?;
    let len = u32::from_be_bytes(len) as usize;
    if len == 0 || len > MAX_AGENT_REPLY {
        return Err(SshError::Agent(format!("Invalid agent message length {}", len)));
    }
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .map_err(|e| SshError::Agent(format!("Agent read failed: {}", e)))?;
    Ok(body)
}

fn agent_error(e: SshError) -> SshError {
    SshError::Agent(format!("Malformed agent reply: {}", e))
}
