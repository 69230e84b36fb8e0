//! SFTP (SSH File Transfer Protocol) v3 client.
//!
//! SFTP runs as the `sftp` subsystem on a session channel:
//!
//! ```text
//! Client                          Server
//!   |-- SSH_MSG_CHANNEL_OPEN ------>|
//!   |<- SSH_MSG_CHANNEL_OPEN_CONF --|
//!   |-- SSH_MSG_CHANNEL_REQUEST --->|  (subsystem "sftp")
//!   |<- SSH_MSG_CHANNEL_SUCCESS ----|
//!   |-- SSH_FXP_INIT -------------->|
//!   |<- SSH_FXP_VERSION ------------|
//!   |-- SSH_FXP_OPEN -------------->|
//!   |<- SSH_FXP_HANDLE -------------|
//!   |-- SSH_FXP_READ -------------->|
//!   |<- SSH_FXP_DATA ---------------|
//!   |-- SSH_FXP_CLOSE ------------->|
//!   |<- SSH_FXP_STATUS -------------|
//! ```
//!
//! Requests are serialized: each call sends one request and waits for the
//! response with the same ID. A response carrying any other ID is a
//! protocol error.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::io::{Read, Write};
//! use sshwire_proto::ssh::session::Session;
//!
//! # fn run(session: &Session) -> Result<(), Box<dyn std::error::Error>> {
//! let sftp = session.sftp()?;
//! let mut file = sftp.create("/tmp/hello.txt")?;
//! file.write_all(b"hello")?;
//! file.close()?;
//!
//! let mut contents = String::new();
//! sftp.open("/tmp/hello.txt")?.read_to_string(&mut contents)?;
//! for (name, attrs) in sftp.readdir("/tmp")? {
//!     println!("{} {:?}", name, attrs.size);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! - [SFTP Draft v3](https://datatracker.ietf.org/doc/html/draft-ietf-secsh-filexfer-02)

pub mod message;
pub mod types;

pub use message::{NameEntry, Request, Response, SftpMessageType, SFTP_VERSION};
pub use types::{FileAttributes, FileMode, FileOpenFlags, FileType, SftpErrorCode};

use std::collections::VecDeque;
use std::io;
use std::sync::{Mutex, MutexGuard};

use bytes::BytesMut;
use sshwire_platform::{SshError, SshResult};
use tracing::{debug, info, trace};

use crate::ssh::connection::{ChannelRequestType, ChannelType};
use crate::ssh::session::{Channel, Session, SessionInner};
use message::split_frame;

/// Largest READ/WRITE payload per request.
const MAX_IO_CHUNK: usize = 32 * 1024;

/// Channel setup progress kept across `WouldBlock`.
#[derive(Debug, Default)]
pub(crate) struct SftpSetup {
    channel: Option<u32>,
    subsystem_done: bool,
    init_written: usize,
    inbuf: BytesMut,
}

impl SessionInner {
    fn sftp_init(&mut self, setup: &mut SftpSetup) -> SshResult<(u32, BytesMut)> {
        let id = match setup.channel {
            Some(id) => id,
            None => {
                let id = self.open_channel(&ChannelType::Session)?;
                setup.channel = Some(id);
                id
            }
        };
        if !setup.subsystem_done {
            let request = ChannelRequestType::Subsystem {
                name: "sftp".to_string(),
            };
            self.channel_request(id, request, true)?;
            setup.subsystem_done = true;
        }

        let init = Request::Init {
            version: SFTP_VERSION,
        }
        .encode(0);
        while setup.init_written < init.len() {
            setup.init_written += self.channel_write(id, false, &init[setup.init_written..])?;
        }

        loop {
            if let Some((kind, body)) = split_frame(&mut setup.inbuf)? {
                match Response::decode(kind, &body)? {
                    (None, Response::Version { version }) => {
                        if version < SFTP_VERSION {
                            return Err(SshError::sftp(
                                0,
                                format!("Server speaks SFTP version {}", version),
                            ));
                        }
                        info!(channel = id, version, "SFTP session started");
                        return Ok((id, std::mem::take(&mut setup.inbuf)));
                    }
                    (_, other) => {
                        return Err(SshError::sftp(
                            0,
                            format!("Expected SSH_FXP_VERSION, got {:?}", other),
                        ))
                    }
                }
            }
            read_more(self, id, &mut setup.inbuf)?;
        }
    }
}

/// Appends channel data to `inbuf`.
fn read_more(inner: &mut SessionInner, channel: u32, inbuf: &mut BytesMut) -> SshResult<()> {
    let mut chunk = [0u8; 16 * 1024];
    let n = inner.channel_read(channel, false, &mut chunk)?;
    if n == 0 {
        return Err(SshError::sftp(
            SftpErrorCode::ConnectionLost as u32,
            "SFTP channel closed",
        ));
    }
    inbuf.extend_from_slice(&chunk[..n]);
    Ok(())
}

impl Session {
    /// Starts an SFTP session on a new channel.
    ///
    /// # Errors
    ///
    /// - [`SshError::InvalidRequest`] before authentication
    /// - [`SshError::ChannelRequestDenied`] if the server has no SFTP
    ///   subsystem
    pub fn sftp(&self) -> SshResult<Sftp> {
        let (id, inbuf) = self.run(|inner| {
            inner.require_authenticated("SFTP")?;
            let mut setup = inner.pending.sftp.take().unwrap_or_default();
            let result = inner.sftp_init(&mut setup);
            match &result {
                Err(SshError::WouldBlock) => inner.pending.sftp = Some(setup),
                Err(_) => {
                    if let Some(id) = setup.channel {
                        inner.release_channel(id);
                    }
                }
                Ok(_) => {}
            }
            result
        })?;
        Ok(Sftp {
            channel: Channel::new(self.clone(), id),
            state: Mutex::new(SftpState {
                next_id: 1,
                inbuf,
                pending: None,
                last_status: 0,
            }),
        })
    }
}

/// A request written (or being written) and not yet answered.
#[derive(Debug)]
struct Pending {
    id: u32,
    /// Request encoded with ID 0, identifies a retried call
    key: Vec<u8>,
    packet: Vec<u8>,
    written: usize,
}

#[derive(Debug)]
struct SftpState {
    next_id: u32,
    inbuf: BytesMut,
    pending: Option<Pending>,
    last_status: u32,
}

impl SftpState {
    fn exchange(
        &mut self,
        inner: &mut SessionInner,
        channel: u32,
        request: &Request,
    ) -> SshResult<Response> {
        let key = request.encode(0);
        if self.pending.as_ref().map_or(true, |p| p.key != key) {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1).max(1);
            trace!(id, kind = ?request.message_type(), "SFTP request");
            self.pending = Some(Pending {
                id,
                packet: request.encode(id),
                key,
                written: 0,
            });
        }

        let Some(current) = self.pending.as_mut() else {
            return Err(SshError::sftp(0, "No request in flight"));
        };
        while current.written < current.packet.len() {
            current.written +=
                inner.channel_write(channel, false, &current.packet[current.written..])?;
        }
        let expected = current.id;

        loop {
            if let Some((kind, body)) = split_frame(&mut self.inbuf)? {
                self.pending = None;
                let (id, response) = Response::decode(kind, &body)?;
                if id != Some(expected) {
                    return Err(SshError::sftp(
                        0,
                        format!("Response ID {:?} does not match request {}", id, expected),
                    ));
                }
                if let Response::Status { code, .. } = &response {
                    self.last_status = *code;
                } else {
                    self.last_status = 0;
                }
                return Ok(response);
            }
            read_more(inner, channel, &mut self.inbuf)?;
        }
    }
}

fn status_error(code: u32, message: String) -> SshError {
    let message = if message.is_empty() {
        SftpErrorCode::from_u32(code)
            .map(|c| c.message().to_string())
            .unwrap_or_else(|| format!("SFTP status {}", code))
    } else {
        message
    };
    SshError::sftp(code, message)
}

fn unexpected(response: Response, wanted: &str) -> SshError {
    match response {
        Response::Status { code, message } => status_error(code, message),
        other => SshError::sftp(0, format!("Expected {}, got {:?}", wanted, other)),
    }
}

fn expect_ok(response: Response) -> SshResult<()> {
    match response {
        Response::Status { code: 0, .. } => Ok(()),
        other => Err(unexpected(other, "SSH_FXP_STATUS")),
    }
}

fn expect_handle(response: Response) -> SshResult<Vec<u8>> {
    match response {
        Response::Handle(handle) => Ok(handle),
        other => Err(unexpected(other, "SSH_FXP_HANDLE")),
    }
}

fn expect_attrs(response: Response) -> SshResult<FileAttributes> {
    match response {
        Response::Attrs(attrs) => Ok(attrs),
        other => Err(unexpected(other, "SSH_FXP_ATTRS")),
    }
}

fn expect_single_name(response: Response) -> SshResult<String> {
    match response {
        Response::Name(mut entries) if entries.len() == 1 => Ok(entries.remove(0).filename),
        Response::Name(entries) => Err(SshError::sftp(
            0,
            format!("Expected one name, got {}", entries.len()),
        )),
        other => Err(unexpected(other, "SSH_FXP_NAME")),
    }
}

/// An SFTP session.
///
/// Closing happens on drop, together with the channel.
pub struct Sftp {
    channel: Channel,
    state: Mutex<SftpState>,
}

impl std::fmt::Debug for Sftp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sftp")
            .field("channel", &self.channel.id())
            .finish()
    }
}

impl Sftp {
    fn lock_state(&self) -> SshResult<MutexGuard<'_, SftpState>> {
        self.state
            .lock()
            .map_err(|_| SshError::Other("SFTP state poisoned".into()))
    }

    fn request(&self, request: Request) -> SshResult<Response> {
        let mut state = self.lock_state()?;
        let channel = self.channel.id();
        self.channel
            .session()
            .run(|inner| state.exchange(inner, channel, &request))
    }

    /// Sends `request` and converts the reply, recording a failed
    /// conversion as the session's last error.
    fn call<T>(
        &self,
        request: Request,
        convert: impl FnOnce(Response) -> SshResult<T>,
    ) -> SshResult<T> {
        let response = self.request(request)?;
        self.channel.session().recorded(convert(response))
    }

    /// Status code of the last SSH_FXP_STATUS response, 0 if the last
    /// response was not a status.
    pub fn last_error(&self) -> u32 {
        self.lock_state().map(|s| s.last_status).unwrap_or(0)
    }

    /// Opens `path` for reading.
    pub fn open(&self, path: &str) -> SshResult<File<'_>> {
        self.open_mode(path, FileOpenFlags::READ, 0)
    }

    /// Opens `path` with SSH_FXF_* `flags`; `mode` applies if the file is
    /// created.
    pub fn open_mode(&self, path: &str, flags: u32, mode: u32) -> SshResult<File<'_>> {
        let attrs = if flags & FileOpenFlags::CREAT != 0 {
            FileAttributes::with_permissions(mode)
        } else {
            FileAttributes::default()
        };
        let handle = self.call(
            Request::Open {
                path: path.to_string(),
                flags,
                attrs,
            },
            expect_handle,
        )?;
        debug!(path, flags, "SFTP file opened");
        Ok(File::new(self, handle, false))
    }

    /// Creates or truncates `path` for writing with mode 0644.
    pub fn create(&self, path: &str) -> SshResult<File<'_>> {
        self.open_mode(
            path,
            FileOpenFlags::WRITE | FileOpenFlags::CREAT | FileOpenFlags::TRUNC,
            FileMode::DEFAULT_FILE,
        )
    }

    /// Opens a directory for [`File::readdir`].
    pub fn opendir(&self, path: &str) -> SshResult<File<'_>> {
        let handle = self.call(
            Request::OpenDir {
                path: path.to_string(),
            },
            expect_handle,
        )?;
        debug!(path, "SFTP directory opened");
        Ok(File::new(self, handle, true))
    }

    /// Lists a directory, leaving out `.` and `..`.
    pub fn readdir(&self, path: &str) -> SshResult<Vec<(String, FileAttributes)>> {
        let mut dir = self.opendir(path)?;
        let mut entries = Vec::new();
        while let Some((name, attrs)) = dir.readdir()? {
            if name != "." && name != ".." {
                entries.push((name, attrs));
            }
        }
        dir.close()?;
        Ok(entries)
    }

    /// Attributes of `path`, following symlinks.
    pub fn stat(&self, path: &str) -> SshResult<FileAttributes> {
        self.call(
            Request::Stat {
                path: path.to_string(),
            },
            expect_attrs,
        )
    }

    /// Attributes of `path` itself.
    pub fn lstat(&self, path: &str) -> SshResult<FileAttributes> {
        self.call(
            Request::LStat {
                path: path.to_string(),
            },
            expect_attrs,
        )
    }

    /// Changes the attributes of `path`.
    pub fn setstat(&self, path: &str, attrs: &FileAttributes) -> SshResult<()> {
        self.call(
            Request::SetStat {
                path: path.to_string(),
                attrs: attrs.clone(),
            },
            expect_ok,
        )
    }

    /// Creates a directory.
    pub fn mkdir(&self, path: &str, mode: u32) -> SshResult<()> {
        self.call(
            Request::MkDir {
                path: path.to_string(),
                attrs: FileAttributes::with_permissions(mode),
            },
            expect_ok,
        )
    }

    /// Removes an empty directory.
    pub fn rmdir(&self, path: &str) -> SshResult<()> {
        self.call(
            Request::RmDir {
                path: path.to_string(),
            },
            expect_ok,
        )
    }

    /// Removes a file.
    pub fn unlink(&self, path: &str) -> SshResult<()> {
        self.call(
            Request::Remove {
                path: path.to_string(),
            },
            expect_ok,
        )
    }

    /// Renames `from` to `to`.
    pub fn rename(&self, from: &str, to: &str) -> SshResult<()> {
        self.call(
            Request::Rename {
                from: from.to_string(),
                to: to.to_string(),
            },
            expect_ok,
        )
    }

    /// Canonical absolute form of `path`.
    pub fn realpath(&self, path: &str) -> SshResult<String> {
        self.call(
            Request::RealPath {
                path: path.to_string(),
            },
            expect_single_name,
        )
    }

    /// Target of the symlink at `path`.
    pub fn readlink(&self, path: &str) -> SshResult<String> {
        self.call(
            Request::ReadLink {
                path: path.to_string(),
            },
            expect_single_name,
        )
    }

    /// Creates a symlink at `link` pointing to `target`.
    pub fn symlink(&self, target: &str, link: &str) -> SshResult<()> {
        self.call(
            Request::Symlink {
                link: link.to_string(),
                target: target.to_string(),
            },
            expect_ok,
        )
    }
}

/// An open SFTP file or directory handle.
///
/// Borrows its [`Sftp`], so it cannot outlive it. Dropping an open handle
/// closes it in blocking mode.
pub struct File<'sftp> {
    sftp: &'sftp Sftp,
    handle: Vec<u8>,
    position: u64,
    is_dir: bool,
    entries: VecDeque<NameEntry>,
    dir_done: bool,
    closed: bool,
}

impl std::fmt::Debug for File<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("handle", &hex::encode(&self.handle))
            .field("position", &self.position)
            .field("is_dir", &self.is_dir)
            .finish()
    }
}

impl<'sftp> File<'sftp> {
    fn new(sftp: &'sftp Sftp, handle: Vec<u8>, is_dir: bool) -> Self {
        Self {
            sftp,
            handle,
            position: 0,
            is_dir,
            entries: VecDeque::new(),
            dir_done: false,
            closed: false,
        }
    }

    fn check_open(&self) -> SshResult<()> {
        if self.closed {
            Err(SshError::InvalidRequest("SFTP handle is closed".to_string()))
        } else {
            Ok(())
        }
    }

    /// Reads at the current position. Returns 0 at end of file.
    pub fn read(&mut self, buf: &mut [u8]) -> SshResult<usize> {
        self.check_open()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min(MAX_IO_CHUNK);
        let data = self.sftp.call(
            Request::Read {
                handle: self.handle.clone(),
                offset: self.position,
                len: len as u32,
            },
            |response| match response {
                Response::Data(data) if data.len() > len => Err(SshError::sftp(
                    0,
                    format!("Server returned {} bytes for a {} byte read", data.len(), len),
                )),
                Response::Data(data) => Ok(data),
                Response::Status { code: 1, .. } => Ok(Vec::new()),
                other => Err(unexpected(other, "SSH_FXP_DATA")),
            },
        )?;
        buf[..data.len()].copy_from_slice(&data);
        self.position += data.len() as u64;
        Ok(data.len())
    }

    /// Writes at the current position, returning the bytes taken.
    pub fn write(&mut self, data: &[u8]) -> SshResult<usize> {
        self.check_open()?;
        if data.is_empty() {
            return Ok(0);
        }
        let len = data.len().min(MAX_IO_CHUNK);
        self.sftp.call(
            Request::Write {
                handle: self.handle.clone(),
                offset: self.position,
                data: data[..len].to_vec(),
            },
            expect_ok,
        )?;
        self.position += len as u64;
        Ok(len)
    }

    /// Moves the position used by the next read or write.
    pub fn seek(&mut self, position: u64) {
        self.position = position;
    }

    /// Current position.
    pub fn tell(&self) -> u64 {
        self.position
    }

    /// Attributes of the open file.
    pub fn fstat(&mut self) -> SshResult<FileAttributes> {
        self.check_open()?;
        self.sftp.call(
            Request::FStat {
                handle: self.handle.clone(),
            },
            expect_attrs,
        )
    }

    /// Changes the attributes of the open file.
    pub fn fsetstat(&mut self, attrs: &FileAttributes) -> SshResult<()> {
        self.check_open()?;
        self.sftp.call(
            Request::FSetStat {
                handle: self.handle.clone(),
                attrs: attrs.clone(),
            },
            expect_ok,
        )
    }

    /// Next directory entry, `None` after the last.
    pub fn readdir(&mut self) -> SshResult<Option<(String, FileAttributes)>> {
        self.check_open()?;
        if !self.is_dir {
            return Err(SshError::InvalidRequest(
                "readdir on a file handle".to_string(),
            ));
        }
        loop {
            if let Some(entry) = self.entries.pop_front() {
                return Ok(Some((entry.filename, entry.attrs)));
            }
            if self.dir_done {
                return Ok(None);
            }
            let batch = self.sftp.call(
                Request::ReadDir {
                    handle: self.handle.clone(),
                },
                |response| match response {
                    Response::Name(entries) => Ok(Some(entries)),
                    Response::Status { code: 1, .. } => Ok(None),
                    other => Err(unexpected(other, "SSH_FXP_NAME")),
                },
            )?;
            match batch {
                Some(entries) => self.entries.extend(entries),
                None => self.dir_done = true,
            }
        }
    }

    /// Closes the handle.
    pub fn close(&mut self) -> SshResult<()> {
        if self.closed {
            return Ok(());
        }
        self.sftp.call(
            Request::Close {
                handle: self.handle.clone(),
            },
            expect_ok,
        )?;
        self.closed = true;
        Ok(())
    }
}

impl io::Read for File<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        File::read(self, buf).map_err(io::Error::from)
    }
}

impl io::Write for File<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        File::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Seek for File<'_> {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let target = match pos {
            io::SeekFrom::Start(offset) => Some(offset),
            io::SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            io::SeekFrom::End(delta) => {
                let size = self.fstat().map_err(io::Error::from)?.size.ok_or_else(|| {
                    io::Error::new(io::ErrorKind::Unsupported, "Server did not report the size")
                })?;
                size.checked_add_signed(delta)
            }
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "Seek before start of file")
        })?;
        self.position = target;
        Ok(target)
    }
}

impl Drop for File<'_> {
    fn drop(&mut self) {
        if self.closed || !self.sftp.channel.session().is_blocking() {
            return;
        }
        if let Err(e) = self.close() {
            debug!(error = %e, "Closing SFTP handle on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_error_defaults_message() {
        match status_error(2, String::new()) {
            SshError::Sftp { code, message } => {
                assert_eq!(code, 2);
                assert_eq!(message, "No such file or directory");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_expect_helpers() {
        assert!(expect_ok(Response::status(SftpErrorCode::Ok)).is_ok());
        assert!(matches!(
            expect_ok(Response::status(SftpErrorCode::PermissionDenied)),
            Err(SshError::Sftp { code: 3, .. })
        ));
        assert!(matches!(
            expect_handle(Response::Data(vec![])),
            Err(SshError::Sftp { code: 0, .. })
        ));
        assert_eq!(
            expect_single_name(Response::Name(vec![NameEntry {
                filename: "/home/user".to_string(),
                longname: String::new(),
                attrs: FileAttributes::default(),
            }]))
            .unwrap(),
            "/home/user"
        );
    }

    #[test]
    fn test_sftp_requires_auth() {
        let session = Session::new();
        let err = session.sftp().unwrap_err();
        assert!(matches!(err, SshError::InvalidRequest(_)));
        assert!(!err.is_would_block());
    }
}
