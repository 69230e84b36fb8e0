//! Drives a non-blocking [`Session`] from a tokio runtime.
//!
//! The session keeps its own copy of the socket and stays synchronous.
//! [`AsyncSession::drive`] retries an operation until it stops returning
//! [`SshError::WouldBlock`], awaiting readiness on a tokio registration of
//! the same socket in the directions reported by
//! [`Session::block_directions`].
//!
//! # Example
//!
//! ```rust,no_run
//! use sshwire_proto::ssh::async_session::AsyncSession;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let ssh = AsyncSession::connect("127.0.0.1:22").await?;
//! ssh.handshake().await?;
//! ssh.userauth_password("user", "password").await?;
//!
//! let (output, status) = ssh.exec("uname -a").await?;
//! println!("{} (exit {})", String::from_utf8_lossy(&output), status);
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use sshwire_platform::{SshError, SshResult};
use tokio::io::Interest;
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, trace};

use crate::ssh::session::{Channel, Session};
use crate::ssh::transport::TransportConfig;

/// Default time allowed for the TCP connect.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// A [`Session`] paired with a tokio readiness source for its socket.
pub struct AsyncSession {
    session: Session,
    stream: TcpStream,
}

impl std::fmt::Debug for AsyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncSession")
            .field("peer", &self.stream.peer_addr().ok())
            .finish()
    }
}

impl AsyncSession {
    /// Connects with the default transport configuration.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> SshResult<Self> {
        Self::connect_with_config(addr, TransportConfig::default()).await
    }

    /// Connects with `config`.
    pub async fn connect_with_config<A: ToSocketAddrs>(
        addr: A,
        config: TransportConfig,
    ) -> SshResult<Self> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| SshError::Timeout)?
            .map_err(SshError::Io)?;
        let std_stream = stream.into_std().map_err(SshError::Io)?;
        Self::from_std(std_stream, Session::with_config(config))
    }

    /// Wraps an already connected socket and a fresh session.
    ///
    /// The session is switched to non-blocking mode. Must be called inside
    /// a tokio runtime.
    pub fn from_std(stream: std::net::TcpStream, session: Session) -> SshResult<Self> {
        stream.set_nonblocking(true).map_err(SshError::Io)?;
        let session_side = stream.try_clone().map_err(SshError::Io)?;
        let watcher = TcpStream::from_std(stream).map_err(SshError::Io)?;
        session.set_blocking(false);
        session.set_tcp_stream(session_side);
        Ok(Self {
            session,
            stream: watcher,
        })
    }

    /// The underlying non-blocking session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Retries `op` until it completes, awaiting socket readiness between
    /// attempts.
    ///
    /// The session timeout, if set, bounds the whole operation and yields
    /// [`SshError::Timeout`].
    pub async fn drive<T>(&self, op: impl FnMut() -> SshResult<T>) -> SshResult<T> {
        match self.session.timeout() {
            0 => self.drive_inner(op).await,
            ms => tokio::time::timeout(Duration::from_millis(u64::from(ms)), self.drive_inner(op))
                .await
                .map_err(|_| SshError::Timeout)?,
        }
    }

    async fn drive_inner<T>(&self, mut op: impl FnMut() -> SshResult<T>) -> SshResult<T> {
        match op() {
            Err(SshError::WouldBlock) => {}
            other => return other,
        }
        loop {
            let interest = if self.session.block_directions().outbound() {
                Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            trace!(?interest, "Waiting for socket");
            self.stream.ready(interest).await.map_err(SshError::Io)?;

            // try_io clears the readiness when the session reports WouldBlock.
            let attempt = self.stream.try_io(interest, || match op() {
                Err(SshError::WouldBlock) => Err(std::io::ErrorKind::WouldBlock.into()),
                other => Ok(other),
            });
            match attempt {
                Ok(result) => return result,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(SshError::Io(e)),
            }
        }
    }

    /// Runs the version exchange and key exchange.
    pub async fn handshake(&self) -> SshResult<()> {
        self.drive(|| self.session.handshake()).await
    }

    /// Password authentication.
    pub async fn userauth_password(&self, user: &str, password: &str) -> SshResult<()> {
        self.drive(|| self.session.userauth_password(user, password))
            .await
    }

    /// Public key authentication with an OpenSSH or PEM private key in memory.
    pub async fn userauth_pubkey_memory(
        &self,
        user: &str,
        private_key: &str,
        passphrase: Option<&str>,
    ) -> SshResult<()> {
        self.drive(|| {
            self.session
                .userauth_pubkey_memory(user, None, private_key, passphrase)
        })
        .await
    }

    /// Opens a session channel.
    pub async fn channel_session(&self) -> SshResult<Channel> {
        self.drive(|| self.session.channel_session()).await
    }

    /// Reads from a channel's stdout stream; 0 means EOF.
    pub async fn read(&self, channel: &mut Channel, buf: &mut [u8]) -> SshResult<usize> {
        self.drive(|| channel.read(buf)).await
    }

    /// Writes all of `data` to a channel.
    pub async fn write_all(&self, channel: &mut Channel, data: &[u8]) -> SshResult<()> {
        let mut written = 0;
        while written < data.len() {
            let n = self.drive(|| channel.write(&data[written..])).await?;
            written += n;
        }
        Ok(())
    }

    /// Runs `command` on a new channel and collects its stdout and exit
    /// status.
    pub async fn exec(&self, command: &str) -> SshResult<(Vec<u8>, i32)> {
        let mut channel = self.channel_session().await?;
        self.drive(|| channel.exec(command)).await?;

        let mut output = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = self.read(&mut channel, &mut buf).await?;
            if n == 0 {
                break;
            }
            output.extend_from_slice(&buf[..n]);
        }
        self.drive(|| channel.close()).await?;
        self.drive(|| channel.wait_closed()).await?;
        let status = channel.exit_status()?;
        debug!(command, status, bytes = output.len(), "Remote command finished");
        Ok((output, status))
    }

    /// Sends SSH_MSG_DISCONNECT and closes the connection.
    pub async fn disconnect(&self, description: &str) -> SshResult<()> {
        self.drive(|| self.session.disconnect(description)).await
    }
}
