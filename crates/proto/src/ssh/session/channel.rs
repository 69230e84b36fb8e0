//! Channel and listener handles.

use std::io;

use bytes::BytesMut;
use sshwire_platform::{SshError, SshResult};
use tracing::debug;

use super::Session;
use crate::ssh::channel::{ExitSignal, ExtendedData};
use crate::ssh::connection::{ChannelRequestType, ChannelType};
use crate::ssh::wire::write_string;

/// Default address for remote forwards when none is given.
const FORWARD_ANY_ADDRESS: &str = "0.0.0.0";

/// Pending connections kept per listener when no limit is given.
const FORWARD_QUEUE_SIZE: u32 = 16;

/// Receive-side window state returned by [`Channel::window_read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadWindow {
    /// Bytes the peer may still send before it needs an adjust
    pub remaining: u32,
    /// Bytes buffered and ready to read
    pub available: u32,
    /// Window size advertised at open
    pub window_size_initial: u32,
}

/// Send-side window state returned by [`Channel::window_write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteWindow {
    /// Bytes that may be written before the peer must adjust the window
    pub remaining: u32,
    /// Window size the peer advertised at open
    pub window_size_initial: u32,
}

/// A channel on a [`Session`].
///
/// Dropping the handle closes the channel if it is still open.
pub struct Channel {
    session: Session,
    id: u32,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("id", &self.id).finish()
    }
}

impl Session {
    /// Opens a `session` channel for exec, shell or subsystem use.
    ///
    /// # Errors
    ///
    /// [`SshError::InvalidRequest`] before authentication.
    pub fn channel_session(&self) -> SshResult<Channel> {
        let id = self.run(|inner| inner.open_channel(&ChannelType::Session))?;
        Ok(Channel::new(self.clone(), id))
    }

    /// Opens a `direct-tcpip` channel to `host:port` through the server.
    ///
    /// `source` is the originator address reported to the server; it
    /// defaults to `127.0.0.1:22`.
    pub fn channel_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        source: Option<(&str, u16)>,
    ) -> SshResult<Channel> {
        let (originator_address, originator_port) = source.unwrap_or(("127.0.0.1", 22));
        let channel_type = ChannelType::DirectTcpip {
            host: host.to_string(),
            port: u32::from(port),
            originator_address: originator_address.to_string(),
            originator_port: u32::from(originator_port),
        };
        let id = self.run(|inner| inner.open_channel(&channel_type))?;
        Ok(Channel::new(self.clone(), id))
    }

    /// Asks the server to listen on `host:port` and forward connections
    /// back over this session.
    ///
    /// Port 0 lets the server pick; the bound port is returned alongside
    /// the listener. At most `queue_max` unaccepted connections are kept.
    ///
    /// # Errors
    ///
    /// [`SshError::RequestDenied`] if the server refuses the forward.
    pub fn channel_forward_listen(
        &self,
        port: u16,
        host: Option<&str>,
        queue_max: Option<u32>,
    ) -> SshResult<(Listener, u16)> {
        let address = host.unwrap_or(FORWARD_ANY_ADDRESS);
        let queue_max = queue_max.unwrap_or(FORWARD_QUEUE_SIZE) as usize;
        let (id, bound) =
            self.run(|inner| inner.forward_listen(address, u32::from(port), queue_max))?;
        let bound = u16::try_from(bound)
            .map_err(|_| SshError::Protocol(format!("Server bound invalid port {}", bound)))?;
        Ok((
            Listener {
                session: self.clone(),
                id,
                port: bound,
            },
            bound,
        ))
    }

    /// Cancels a remote forward.
    pub fn channel_forward_cancel(&self, listener: Listener) -> SshResult<()> {
        listener.cancel()
    }
}

impl Channel {
    pub(crate) fn new(session: Session, id: u32) -> Self {
        Self { session, id }
    }

    /// Local channel number.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn session(&self) -> &Session {
        &self.session
    }

    fn request(&mut self, request: ChannelRequestType, want_reply: bool) -> SshResult<()> {
        let id = self.id;
        self.session
            .run(|inner| inner.channel_request(id, request.clone(), want_reply))
    }

    /// Sets an environment variable for the remote process.
    pub fn setenv(&mut self, name: &str, value: &str) -> SshResult<()> {
        self.request(
            ChannelRequestType::Env {
                name: name.to_string(),
                value: value.to_string(),
            },
            true,
        )
    }

    /// Requests a pseudo terminal.
    ///
    /// `modes` are encoded terminal modes; `dim` is (columns, rows, width
    /// px, height px) and defaults to 80x24.
    pub fn request_pty(
        &mut self,
        term: &str,
        modes: Option<&[u8]>,
        dim: Option<(u32, u32, u32, u32)>,
    ) -> SshResult<()> {
        let (width_chars, height_rows, width_pixels, height_pixels) = dim.unwrap_or((80, 24, 0, 0));
        self.request(
            ChannelRequestType::PtyReq {
                term: term.to_string(),
                width_chars,
                height_rows,
                width_pixels,
                height_pixels,
                modes: modes.map(<[u8]>::to_vec).unwrap_or_default(),
            },
            true,
        )
    }

    /// Changes the pseudo terminal size.
    pub fn request_pty_size(
        &mut self,
        width: u32,
        height: u32,
        width_px: Option<u32>,
        height_px: Option<u32>,
    ) -> SshResult<()> {
        self.request(
            ChannelRequestType::WindowChange {
                width_chars: width,
                height_rows: height,
                width_pixels: width_px.unwrap_or(0),
                height_pixels: height_px.unwrap_or(0),
            },
            false,
        )
    }

    /// Starts a login shell.
    pub fn shell(&mut self) -> SshResult<()> {
        self.request(ChannelRequestType::Shell, true)
    }

    /// Runs `command` on the server.
    ///
    /// # Errors
    ///
    /// [`SshError::ChannelRequestDenied`] if the server refuses to run it.
    pub fn exec(&mut self, command: &str) -> SshResult<()> {
        self.request(
            ChannelRequestType::Exec {
                command: command.to_string(),
            },
            true,
        )
    }

    /// Starts a subsystem such as `sftp`.
    pub fn subsystem(&mut self, name: &str) -> SshResult<()> {
        self.request(
            ChannelRequestType::Subsystem {
                name: name.to_string(),
            },
            true,
        )
    }

    /// Sends a process startup request by name.
    ///
    /// `exec`, `shell` and `subsystem` are mapped to their typed requests;
    /// other names are sent with `message` as a string argument.
    pub fn process_startup(&mut self, request: &str, message: Option<&str>) -> SshResult<()> {
        let request = match (request, message) {
            ("shell", _) => ChannelRequestType::Shell,
            ("exec", Some(command)) => ChannelRequestType::Exec {
                command: command.to_string(),
            },
            ("subsystem", Some(name)) => ChannelRequestType::Subsystem {
                name: name.to_string(),
            },
            (name, message) => {
                let mut data = BytesMut::new();
                if let Some(message) = message {
                    write_string(&mut data, message);
                }
                ChannelRequestType::Other {
                    name: name.to_string(),
                    data: data.to_vec(),
                }
            }
        };
        self.request(request, true)
    }

    /// Reads from stdout. Returns 0 at end of file.
    pub fn read(&mut self, buf: &mut [u8]) -> SshResult<usize> {
        let id = self.id;
        self.session.run(|inner| inner.channel_read(id, false, buf))
    }

    /// Reads from stderr. Returns 0 at end of file.
    pub fn read_stderr(&mut self, buf: &mut [u8]) -> SshResult<usize> {
        let id = self.id;
        self.session.run(|inner| inner.channel_read(id, true, buf))
    }

    /// Writes to the channel, returning how much of `data` was taken.
    ///
    /// At most one packet and the remaining peer window is written per
    /// call.
    ///
    /// # Errors
    ///
    /// - [`SshError::ChannelEof`] after [`send_eof`](Self::send_eof)
    /// - [`SshError::ChannelClosed`] once either side closed the channel
    pub fn write(&mut self, data: &[u8]) -> SshResult<usize> {
        let id = self.id;
        self.session.run(|inner| inner.channel_write(id, false, data))
    }

    /// Writes to the extended data stream 1 (stderr).
    pub fn write_stderr(&mut self, data: &[u8]) -> SshResult<usize> {
        let id = self.id;
        self.session.run(|inner| inner.channel_write(id, true, data))
    }

    /// Pushes queued outbound packets to the socket.
    pub fn flush(&mut self) -> SshResult<()> {
        self.session.run(|inner| inner.channel_flush())
    }

    /// Sends EOF; no more data may be written.
    pub fn send_eof(&mut self) -> SshResult<()> {
        let id = self.id;
        self.session.run(|inner| {
            inner.channel_send_eof(id)?;
            inner.channel_flush()
        })
    }

    /// Returns true once the peer sent EOF and buffered stdout is drained.
    pub fn eof(&self) -> bool {
        let id = self.id;
        self.session
            .lock()
            .ok()
            .and_then(|inner| inner.channels.get(&id).map(|c| c.at_eof()))
            .unwrap_or(true)
    }

    /// Waits until the peer sent EOF.
    pub fn wait_eof(&mut self) -> SshResult<()> {
        let id = self.id;
        self.session.run(|inner| inner.channel_wait_eof(id))
    }

    /// Sends CLOSE, preceded by EOF if not sent yet.
    pub fn close(&mut self) -> SshResult<()> {
        let id = self.id;
        self.session.run(|inner| {
            inner.channel_close(id)?;
            inner.channel_flush()
        })
    }

    /// Waits until the peer sends CLOSE. Works whether or not
    /// [`close`](Self::close) was called first; a peer CLOSE is answered
    /// automatically.
    pub fn wait_closed(&mut self) -> SshResult<()> {
        let id = self.id;
        self.session.run(|inner| inner.channel_wait_closed(id))
    }

    /// Exit status of the remote command, 0 if none was reported.
    pub fn exit_status(&self) -> SshResult<i32> {
        let id = self.id;
        self.session.run(|inner| {
            let status = inner.channel_mut(id)?.exit_status().unwrap_or(0);
            Ok(status as i32)
        })
    }

    /// Signal that terminated the remote command, if any.
    pub fn exit_signal(&self) -> SshResult<ExitSignal> {
        let id = self.id;
        self.session.run(|inner| {
            Ok(inner
                .channel_mut(id)?
                .exit_signal()
                .cloned()
                .unwrap_or_default())
        })
    }

    /// Receive window state.
    pub fn window_read(&self) -> SshResult<ReadWindow> {
        let id = self.id;
        self.session.run(|inner| {
            let channel = inner.channel_mut(id)?;
            Ok(ReadWindow {
                remaining: channel.local_window(),
                available: u32::try_from(channel.stdout_available()).unwrap_or(u32::MAX),
                window_size_initial: channel.local_window_initial(),
            })
        })
    }

    /// Send window state.
    pub fn window_write(&self) -> SshResult<WriteWindow> {
        let id = self.id;
        self.session.run(|inner| {
            let channel = inner.channel_mut(id)?;
            Ok(WriteWindow {
                remaining: channel.remote_window(),
                window_size_initial: channel.remote_window_initial(),
            })
        })
    }

    /// Grows the receive window.
    ///
    /// Adjustments under 1024 bytes are held back and added to the next
    /// one unless `force` is set. Returns the new window size.
    pub fn adjust_receive_window(&mut self, adjustment: u64, force: bool) -> SshResult<u64> {
        let id = self.id;
        let adjustment = u32::try_from(adjustment).unwrap_or(u32::MAX);
        self.session.run(|inner| {
            let window = inner.channel_adjust_window(id, adjustment, force)?;
            Ok(u64::from(window))
        })
    }

    /// Chooses what happens to extended data.
    pub fn handle_extended_data(&mut self, mode: ExtendedData) -> SshResult<()> {
        let id = self.id;
        self.session.run(|inner| {
            inner.channel_mut(id)?.set_extended_data(mode);
            Ok(())
        })
    }
}

impl io::Read for Channel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Channel::read(self, buf).map_err(io::Error::from)
    }
}

impl io::Write for Channel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Channel::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Channel::flush(self).map_err(io::Error::from)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        match self.session.inner.try_lock() {
            Ok(mut inner) => inner.release_channel(self.id),
            Err(_) => debug!(channel = self.id, "Session busy, channel left open"),
        }
    }
}

/// A remote forward created by [`Session::channel_forward_listen`].
pub struct Listener {
    session: Session,
    id: u32,
    port: u16,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("port", &self.port)
            .finish()
    }
}

impl Listener {
    /// Port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Waits for a forwarded connection.
    pub fn accept(&mut self) -> SshResult<Channel> {
        let listener = self.id;
        let id = self.session.run(|inner| inner.listener_accept(listener))?;
        Ok(Channel::new(self.session.clone(), id))
    }

    /// Stops the forward.
    ///
    /// # Errors
    ///
    /// [`SshError::RequestDenied`] if the server refuses to cancel it.
    pub fn cancel(self) -> SshResult<()> {
        let listener = self.id;
        self.session.run(|inner| inner.forward_cancel(listener))
    }
}
