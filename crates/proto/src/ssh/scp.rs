//! SCP transfers over exec channels.
//!
//! The remote side runs `scp -f` (send to us) or `scp -t` (receive from us)
//! and the two ends exchange control lines:
//!
//! ```text
//! T<mtime> 0 <atime> 0\n     optional timestamps (-p)
//! C<mode> <size> <name>\n    file header, followed by <size> bytes and a 0 byte
//! \x01<text>\n               warning
//! \x02<text>\n               fatal error
//! ```
//!
//! Every control line and the file data are acknowledged with a single 0
//! byte. Directory transfers (`D`/`E` lines) are not supported.

use std::fmt;

use sshwire_platform::{SshError, SshResult};
use tracing::{debug, info};

use crate::ssh::channel::{ReadLimit, SshChannel};
use crate::ssh::connection::{ChannelRequestType, ChannelType};
use crate::ssh::session::{Channel, Session, SessionInner};

/// Longest control line accepted.
const MAX_CONTROL_LINE: usize = 1024;

/// Metadata of a file received with [`Session::scp_recv2`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScpFileInfo {
    /// Permission bits
    pub mode: u32,
    /// Size in bytes
    pub size: u64,
    /// Modification time, seconds since the epoch (0 if not sent)
    pub mtime: u64,
    /// Access time, seconds since the epoch (0 if not sent)
    pub atime: u64,
    /// File name as sent by the server
    pub name: String,
}

/// A parsed SCP control line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlLine {
    /// `T` line
    Times {
        /// Modification time
        mtime: u64,
        /// Access time
        atime: u64,
    },
    /// `C` line
    File {
        /// Permission bits
        mode: u32,
        /// Size in bytes
        size: u64,
        /// Base name
        name: String,
    },
    /// `\x01` or `\x02` line
    Error {
        /// True for `\x02`
        fatal: bool,
        /// Message text
        message: String,
    },
}

impl ControlLine {
    /// Parses one line without its trailing newline.
    pub fn parse(line: &[u8]) -> SshResult<Self> {
        let Some((&kind, rest)) = line.split_first() else {
            return Err(SshError::Scp("Empty control line".to_string()));
        };
        if kind == 1 || kind == 2 {
            return Ok(ControlLine::Error {
                fatal: kind == 2,
                message: String::from_utf8_lossy(rest).trim().to_string(),
            });
        }
        let text = std::str::from_utf8(rest)
            .map_err(|_| SshError::Scp("Control line is not valid UTF-8".to_string()))?;
        match kind {
            b'T' => {
                let fields: Vec<&str> = text.split(' ').collect();
                if fields.len() != 4 {
                    return Err(invalid_line(line));
                }
                let mtime = fields[0].parse().map_err(|_| invalid_line(line))?;
                let atime = fields[2].parse().map_err(|_| invalid_line(line))?;
                Ok(ControlLine::Times { mtime, atime })
            }
            b'C' => {
                let mut fields = text.splitn(3, ' ');
                let (Some(mode), Some(size), Some(name)) =
                    (fields.next(), fields.next(), fields.next())
                else {
                    return Err(invalid_line(line));
                };
                let mode = u32::from_str_radix(mode, 8).map_err(|_| invalid_line(line))?;
                let size = size.parse().map_err(|_| invalid_line(line))?;
                if name.is_empty() || name.contains('/') || name == ".." {
                    return Err(invalid_line(line));
                }
                Ok(ControlLine::File {
                    mode,
                    size,
                    name: name.to_string(),
                })
            }
            b'D' | b'E' => Err(SshError::Scp(
                "Directory transfers are not supported".to_string(),
            )),
            _ => Err(invalid_line(line)),
        }
    }

    /// Encodes the line including the trailing newline.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            ControlLine::Error { fatal, message } => {
                let mut out = vec![if *fatal { 2 } else { 1 }];
                out.extend_from_slice(message.as_bytes());
                out.push(b'\n');
                out
            }
            other => format!("{}\n", other).into_bytes(),
        }
    }
}

impl fmt::Display for ControlLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlLine::Times { mtime, atime } => write!(f, "T{} 0 {} 0", mtime, atime),
            ControlLine::File { mode, size, name } => {
                write!(f, "C{:04o} {} {}", mode & 0o7777, size, name)
            }
            ControlLine::Error { message, .. } => f.write_str(message),
        }
    }
}

fn invalid_line(line: &[u8]) -> SshError {
    SshError::Scp(format!(
        "Invalid control line: {}",
        String::from_utf8_lossy(line).trim_end()
    ))
}

/// Quotes `path` for the remote shell.
pub(crate) fn shell_quote(path: &str) -> String {
    let safe = !path.is_empty()
        && path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+:@,%=".contains(c));
    if safe {
        path.to_string()
    } else {
        format!("'{}'", path.replace('\'', "'\\''"))
    }
}

/// Last path component, used as the name in `C` lines.
fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Consumes the status byte that follows a download's data.
///
/// Returns true once the transfer finished cleanly; false if the byte has
/// not arrived yet.
pub(crate) fn finish_download(channel: &mut SshChannel) -> SshResult<bool> {
    match channel.take_stdout_byte() {
        None if channel.eof_received() => Err(SshError::Scp(
            "Connection closed before the transfer completed".to_string(),
        )),
        None => Ok(false),
        Some(0) => {
            if let Some(limit) = channel.read_limit.as_mut() {
                limit.status_ok = true;
            }
            debug!(channel = channel.local_id(), "SCP download complete");
            Ok(true)
        }
        Some(byte) => {
            let mut text = Vec::new();
            while let Some(b) = channel.take_stdout_byte() {
                if b == b'\n' {
                    break;
                }
                text.push(b);
            }
            Err(SshError::Scp(format!(
                "Transfer failed (status {}): {}",
                byte,
                String::from_utf8_lossy(&text).trim()
            )))
        }
    }
}

/// Progress of an SCP transfer being set up. Kept across `WouldBlock`.
#[derive(Debug, Default)]
pub(crate) struct ScpSetup {
    key: String,
    channel: Option<u32>,
    exec_done: bool,
    ready_sent: bool,
    /// Control lines sent (upload) or acknowledged (download)
    lines_done: u8,
    /// Bytes of the current outgoing line already written
    written: usize,
    /// Upload: the server's ack for the current step has been read
    acked: bool,
    line: Vec<u8>,
    /// Download: a control line read but not yet acknowledged
    unacked: Option<ControlLine>,
    times: Option<(u64, u64)>,
}

impl ScpSetup {
    fn new(key: String) -> Self {
        Self {
            key,
            ..Self::default()
        }
    }
}

impl SessionInner {
    /// Runs `step` with the setup state for `key`, keeping it if the step
    /// would block and closing the channel if it fails.
    fn scp_resume<T>(
        &mut self,
        key: String,
        step: impl FnOnce(&mut SessionInner, &mut ScpSetup) -> SshResult<T>,
    ) -> SshResult<T> {
        self.require_authenticated("SCP")?;
        let mut setup = match self.pending.scp.take() {
            Some(setup) if setup.key == key => setup,
            Some(stale) => {
                if let Some(id) = stale.channel {
                    self.release_channel(id);
                }
                ScpSetup::new(key)
            }
            None => ScpSetup::new(key),
        };
        let result = step(self, &mut setup);
        match &result {
            Err(SshError::WouldBlock) => self.pending.scp = Some(setup),
            Err(_) => {
                if let Some(id) = setup.channel {
                    self.release_channel(id);
                }
            }
            Ok(_) => {}
        }
        result
    }

    fn scp_start(&mut self, setup: &mut ScpSetup, command: &str) -> SshResult<u32> {
        let id = match setup.channel {
            Some(id) => id,
            None => {
                let id = self.open_channel(&ChannelType::Session)?;
                setup.channel = Some(id);
                id
            }
        };
        if !setup.exec_done {
            debug!(channel = id, command, "Starting SCP");
            let request = ChannelRequestType::Exec {
                command: command.to_string(),
            };
            self.channel_request(id, request, true)?;
            setup.exec_done = true;
        }
        Ok(id)
    }

    /// Writes all of `data`, resuming at `setup.written`.
    fn scp_write(&mut self, id: u32, setup: &mut ScpSetup, data: &[u8]) -> SshResult<()> {
        while setup.written < data.len() {
            let n = self.channel_write(id, false, &data[setup.written..])?;
            setup.written += n;
        }
        setup.written = 0;
        Ok(())
    }

    /// Reads one newline-terminated line into `setup.line`.
    fn scp_read_line(&mut self, id: u32, setup: &mut ScpSetup) -> SshResult<Vec<u8>> {
        let mut byte = [0u8; 1];
        loop {
            if self.channel_read(id, false, &mut byte)? == 0 {
                return Err(SshError::Scp(
                    "Connection closed while reading control line".to_string(),
                ));
            }
            if byte[0] == b'\n' {
                return Ok(std::mem::take(&mut setup.line));
            }
            if setup.line.len() >= MAX_CONTROL_LINE {
                return Err(SshError::Scp("Control line too long".to_string()));
            }
            setup.line.push(byte[0]);
        }
    }

    /// Reads the one byte acknowledgment of an upload step.
    fn scp_read_ack(&mut self, id: u32, setup: &mut ScpSetup) -> SshResult<()> {
        if setup.line.is_empty() {
            let mut byte = [0u8; 1];
            if self.channel_read(id, false, &mut byte)? == 0 {
                return Err(SshError::Scp(
                    "Connection closed while waiting for acknowledgment".to_string(),
                ));
            }
            if byte[0] == 0 {
                return Ok(());
            }
            setup.line.push(byte[0]);
        }
        let line = self.scp_read_line(id, setup)?;
        match ControlLine::parse(&line) {
            Ok(ControlLine::Error { message, .. }) => Err(SshError::Scp(message)),
            _ => Err(SshError::Scp(format!(
                "Invalid acknowledgment: {}",
                String::from_utf8_lossy(&line).trim_end()
            ))),
        }
    }

    fn scp_download(&mut self, setup: &mut ScpSetup, path: &str, preserve: bool) -> SshResult<(u32, ScpFileInfo)> {
        let command = format!("scp -{}f {}", if preserve { "p" } else { "" }, shell_quote(path));
        let id = self.scp_start(setup, &command)?;
        if !setup.ready_sent {
            self.scp_write(id, setup, &[0])?;
            setup.ready_sent = true;
        }
        loop {
            if setup.unacked.is_none() {
                let line = self.scp_read_line(id, setup)?;
                let control = ControlLine::parse(&line)?;
                debug!(channel = id, line = %control, "SCP control line");
                if let ControlLine::Error { message, .. } = control {
                    return Err(SshError::Scp(message));
                }
                setup.unacked = Some(control);
            }
            // The line stays in `unacked` until the ack is written.
            self.scp_write(id, setup, &[0])?;
            match setup.unacked.take() {
                Some(ControlLine::Times { mtime, atime }) => {
                    setup.times = Some((mtime, atime));
                }
                Some(ControlLine::File { mode, size, name }) => {
                    let (mtime, atime) = setup.times.unwrap_or((0, 0));
                    self.channel_mut(id)?.read_limit = Some(ReadLimit::new(size));
                    info!(path, size, "SCP download started");
                    return Ok((
                        id,
                        ScpFileInfo {
                            mode,
                            size,
                            mtime,
                            atime,
                            name,
                        },
                    ));
                }
                Some(ControlLine::Error { message, .. }) => return Err(SshError::Scp(message)),
                None => {}
            }
        }
    }

    fn scp_upload(
        &mut self,
        setup: &mut ScpSetup,
        path: &str,
        mode: u32,
        size: u64,
        times: Option<(u64, u64)>,
    ) -> SshResult<u32> {
        let command = format!(
            "scp -{}t {}",
            if times.is_some() { "p" } else { "" },
            shell_quote(path)
        );
        let id = self.scp_start(setup, &command)?;
        if !setup.ready_sent {
            self.scp_read_ack(id, setup)?;
            setup.ready_sent = true;
        }

        let mut lines = Vec::with_capacity(2);
        if let Some((mtime, atime)) = times {
            lines.push(ControlLine::Times { mtime, atime });
        }
        lines.push(ControlLine::File {
            mode,
            size,
            name: base_name(path).to_string(),
        });

        while usize::from(setup.lines_done) < lines.len() {
            let control = &lines[usize::from(setup.lines_done)];
            if !setup.acked {
                if setup.written == 0 {
                    debug!(channel = id, line = %control, "SCP control line");
                }
                self.scp_write(id, setup, &control.to_bytes())?;
                setup.acked = true;
            }
            self.scp_read_ack(id, setup)?;
            setup.acked = false;
            setup.lines_done += 1;
        }
        info!(path, size, "SCP upload started");
        Ok(id)
    }
}

impl Session {
    /// Starts downloading `path`.
    ///
    /// Returns a channel positioned at the file data together with the
    /// declared size. Reads stop at the end of the file.
    ///
    /// # Errors
    ///
    /// [`SshError::Scp`] if the server reports an error (such as a missing
    /// file) or sends a malformed control line.
    pub fn scp_recv(&self, path: &str) -> SshResult<(Channel, u64)> {
        let key = format!("recv:{}", path);
        let (id, info) = self.run(|inner| {
            inner.scp_resume(key.clone(), |inner, setup| inner.scp_download(setup, path, false))
        })?;
        Ok((Channel::new(self.clone(), id), info.size))
    }

    /// Starts downloading `path`, asking for its timestamps too.
    pub fn scp_recv2(&self, path: &str) -> SshResult<(Channel, ScpFileInfo)> {
        let key = format!("recv2:{}", path);
        let (id, info) = self.run(|inner| {
            inner.scp_resume(key.clone(), |inner, setup| inner.scp_download(setup, path, true))
        })?;
        Ok((Channel::new(self.clone(), id), info))
    }

    /// Starts uploading `size` bytes to `path` with permission bits `mode`.
    ///
    /// Write the data to the returned channel, then call `send_eof`,
    /// `wait_eof`, `close` and `wait_closed`.
    pub fn scp_send(&self, path: &str, mode: u32, size: u64) -> SshResult<Channel> {
        self.scp_send64(path, mode, size, 0, 0)
    }

    /// Starts an upload that also sets the file times; both 0 leaves them
    /// to the server.
    ///
    /// # Errors
    ///
    /// [`SshError::Scp`] if the server rejects the path.
    pub fn scp_send64(
        &self,
        path: &str,
        mode: u32,
        size: u64,
        mtime: u64,
        atime: u64,
    ) -> SshResult<Channel> {
        let times = if mtime == 0 && atime == 0 {
            None
        } else {
            Some((mtime, atime))
        };
        let key = format!("send:{}", path);
        let id = self.run(|inner| {
            inner.scp_resume(key.clone(), |inner, setup| {
                inner.scp_upload(setup, path, mode, size, times)
            })
        })?;
        Ok(Channel::new(self.clone(), id))
    }
}
