//! Transport boundary traits
//!
//! The engine never opens sockets. Callers hand it an already connected byte
//! stream implementing [`SessionStream`]; the session switches it between
//! blocking and non-blocking mode and uses it for every packet.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

/// A connected, bidirectional byte stream owned by a session.
///
/// Implementations must surface `io::ErrorKind::WouldBlock` from `read` and
/// `write` when in non-blocking mode and no progress is possible.
pub trait SessionStream: Read + Write + Send {
    /// Switches the stream between blocking and non-blocking I/O.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the mode cannot be changed.
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;

    /// Sets the read and write timeout used in blocking mode.
    ///
    /// `None` means block indefinitely.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the timeout cannot be applied.
    fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Waits until the stream has data to read or the timeout elapses.
    ///
    /// Returns `Ok(true)` when readable (including end of stream) and
    /// `Ok(false)` on timeout. The stream is left in non-blocking mode.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error on failure.
    fn wait_readable(&self, timeout: Option<Duration>) -> io::Result<bool>;

    /// Shuts down both directions of the stream.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error on failure.
    fn shutdown(&self) -> io::Result<()> {
        Ok(())
    }
}

impl SessionStream for TcpStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        TcpStream::set_nonblocking(self, nonblocking)
    }

    fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout.filter(|t| !t.is_zero());
        self.set_read_timeout(timeout)?;
        self.set_write_timeout(timeout)
    }

    fn wait_readable(&self, timeout: Option<Duration>) -> io::Result<bool> {
        TcpStream::set_nonblocking(self, false)?;
        self.set_read_timeout(timeout.filter(|t| !t.is_zero()))?;
        let mut probe = [0u8; 1];
        let result = match self.peek(&mut probe) {
            Ok(_) => Ok(true),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(false)
            }
            Err(e) => Err(e),
        };
        self.set_read_timeout(None)?;
        TcpStream::set_nonblocking(self, true)?;
        result
    }

    fn shutdown(&self) -> io::Result<()> {
        match TcpStream::shutdown(self, std::net::Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

#[cfg(unix)]
impl SessionStream for std::os::unix::net::UnixStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_nonblocking(self, nonblocking)
    }

    fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout.filter(|t| !t.is_zero());
        self.set_read_timeout(timeout)?;
        self.set_write_timeout(timeout)
    }

    fn wait_readable(&self, timeout: Option<Duration>) -> io::Result<bool> {
        // No stable peek on UnixStream: sleep briefly and report readable,
        // the caller's retry will surface WouldBlock again if it was not.
        std::os::unix::net::UnixStream::set_nonblocking(self, true)?;
        let nap = timeout.unwrap_or(Duration::from_millis(1));
        std::thread::sleep(nap.min(Duration::from_millis(1)));
        Ok(true)
    }

    fn shutdown(&self) -> io::Result<()> {
        std::os::unix::net::UnixStream::shutdown(self, std::net::Shutdown::Both)
    }
}

/// Which socket directions a non-blocking caller should wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockDirections {
    /// Not blocked
    #[default]
    None,
    /// Waiting for the socket to become readable
    Inbound,
    /// Waiting for the socket to become writable
    Outbound,
    /// Waiting on both directions
    Both,
}

impl BlockDirections {
    /// Returns true if the caller should wait for readability.
    pub fn inbound(&self) -> bool {
        matches!(self, BlockDirections::Inbound | BlockDirections::Both)
    }

    /// Returns true if the caller should wait for writability.
    pub fn outbound(&self) -> bool {
        matches!(self, BlockDirections::Outbound | BlockDirections::Both)
    }

    /// Combines two direction sets.
    pub fn union(self, other: BlockDirections) -> BlockDirections {
        match (self.inbound() || other.inbound(), self.outbound() || other.outbound()) {
            (true, true) => BlockDirections::Both,
            (true, false) => BlockDirections::Inbound,
            (false, true) => BlockDirections::Outbound,
            (false, false) => BlockDirections::None,
        }
    }
}
