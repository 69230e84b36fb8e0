//! SFTP protocol messages.
//!
//! Every SFTP packet is framed as:
//!
//! ```text
//! uint32    length
//! byte      type
//! uint32    request-id      (all types except INIT and VERSION)
//! ...       type specific fields
//! ```

use bytes::{Buf, BufMut, BytesMut};
use sshwire_platform::{SshError, SshResult};

use super::types::{FileAttributes, SftpErrorCode};
use crate::ssh::wire::{read_bytes, read_string, read_u32, read_u64, write_bytes, write_string};

/// SFTP protocol version (v3).
pub const SFTP_VERSION: u32 = 3;

/// Largest SFTP packet accepted.
pub const MAX_SFTP_PACKET: usize = 256 * 1024;

/// SFTP message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SftpMessageType {
    /// SSH_FXP_INIT - Initialize SFTP session
    Init = 1,
    /// SSH_FXP_VERSION - Version response
    Version = 2,
    /// SSH_FXP_OPEN - Open file
    Open = 3,
    /// SSH_FXP_CLOSE - Close file/directory
    Close = 4,
    /// SSH_FXP_READ - Read from file
    Read = 5,
    /// SSH_FXP_WRITE - Write to file
    Write = 6,
    /// SSH_FXP_LSTAT - Get file attributes (no follow symlinks)
    LStat = 7,
    /// SSH_FXP_FSTAT - Get file attributes by handle
    FStat = 8,
    /// SSH_FXP_SETSTAT - Set file attributes
    SetStat = 9,
    /// SSH_FXP_FSETSTAT - Set file attributes by handle
    FSetStat = 10,
    /// SSH_FXP_OPENDIR - Open directory
    OpenDir = 11,
    /// SSH_FXP_READDIR - Read directory
    ReadDir = 12,
    /// SSH_FXP_REMOVE - Remove file
    Remove = 13,
    /// SSH_FXP_MKDIR - Create directory
    MkDir = 14,
    /// SSH_FXP_RMDIR - Remove directory
    RmDir = 15,
    /// SSH_FXP_REALPATH - Canonicalize path
    RealPath = 16,
    /// SSH_FXP_STAT - Get file attributes
    Stat = 17,
    /// SSH_FXP_RENAME - Rename file/directory
    Rename = 18,
    /// SSH_FXP_READLINK - Read symbolic link
    ReadLink = 19,
    /// SSH_FXP_SYMLINK - Create symbolic link
    Symlink = 20,

    // Response messages
    /// SSH_FXP_STATUS - Status response
    Status = 101,
    /// SSH_FXP_HANDLE - File handle response
    Handle = 102,
    /// SSH_FXP_DATA - Data response
    Data = 103,
    /// SSH_FXP_NAME - Name response
    Name = 104,
    /// SSH_FXP_ATTRS - Attributes response
    Attrs = 105,

    // Extended messages
    /// SSH_FXP_EXTENDED - Extended request
    Extended = 200,
    /// SSH_FXP_EXTENDED_REPLY - Extended response
    ExtendedReply = 201,
}

impl SftpMessageType {
    /// Convert from u8.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Init),
            2 => Some(Self::Version),
            3 => Some(Self::Open),
            4 => Some(Self::Close),
            5 => Some(Self::Read),
            6 => Some(Self::Write),
            7 => Some(Self::LStat),
            8 => Some(Self::FStat),
            9 => Some(Self::SetStat),
            10 => Some(Self::FSetStat),
            11 => Some(Self::OpenDir),
            12 => Some(Self::ReadDir),
            13 => Some(Self::Remove),
            14 => Some(Self::MkDir),
            15 => Some(Self::RmDir),
            16 => Some(Self::RealPath),
            17 => Some(Self::Stat),
            18 => Some(Self::Rename),
            19 => Some(Self::ReadLink),
            20 => Some(Self::Symlink),
            101 => Some(Self::Status),
            102 => Some(Self::Handle),
            103 => Some(Self::Data),
            104 => Some(Self::Name),
            105 => Some(Self::Attrs),
            200 => Some(Self::Extended),
            201 => Some(Self::ExtendedReply),
            _ => None,
        }
    }
}

fn protocol(message: impl Into<String>) -> SshError {
    SshError::sftp(0, message)
}

/// Frames a message: length, type, body.
pub fn frame(msg_type: SftpMessageType, body: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(5 + body.len());
    buf.put_u32((body.len() + 1) as u32);
    buf.put_u8(msg_type as u8);
    buf.put_slice(body);
    buf.to_vec()
}

/// Takes one complete packet off the front of `buf`.
///
/// Returns `None` if more bytes are needed; `buf` is left untouched then.
pub fn split_frame(buf: &mut BytesMut) -> SshResult<Option<(u8, Vec<u8>)>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if length == 0 || length > MAX_SFTP_PACKET {
        return Err(protocol(format!("Invalid SFTP packet length {}", length)));
    }
    if buf.len() < 4 + length {
        return Ok(None);
    }
    buf.advance(4);
    let packet = buf.split_to(length);
    Ok(Some((packet[0], packet[1..].to_vec())))
}

/// A client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// SSH_FXP_INIT
    Init {
        /// Protocol version offered
        version: u32,
    },
    /// SSH_FXP_OPEN
    Open {
        /// Path
        path: String,
        /// SSH_FXF_* flags
        flags: u32,
        /// Attributes for a created file
        attrs: FileAttributes,
    },
    /// SSH_FXP_CLOSE
    Close {
        /// Handle
        handle: Vec<u8>,
    },
    /// SSH_FXP_READ
    Read {
        /// Handle
        handle: Vec<u8>,
        /// Offset
        offset: u64,
        /// Maximum length
        len: u32,
    },
    /// SSH_FXP_WRITE
    Write {
        /// Handle
        handle: Vec<u8>,
        /// Offset
        offset: u64,
        /// Data
        data: Vec<u8>,
    },
    /// SSH_FXP_LSTAT
    LStat {
        /// Path
        path: String,
    },
    /// SSH_FXP_FSTAT
    FStat {
        /// Handle
        handle: Vec<u8>,
    },
    /// SSH_FXP_SETSTAT
    SetStat {
        /// Path
        path: String,
        /// New attributes
        attrs: FileAttributes,
    },
    /// SSH_FXP_FSETSTAT
    FSetStat {
        /// Handle
        handle: Vec<u8>,
        /// New attributes
        attrs: FileAttributes,
    },
    /// SSH_FXP_OPENDIR
    OpenDir {
        /// Path
        path: String,
    },
    /// SSH_FXP_READDIR
    ReadDir {
        /// Handle
        handle: Vec<u8>,
    },
    /// SSH_FXP_REMOVE
    Remove {
        /// Path
        path: String,
    },
    /// SSH_FXP_MKDIR
    MkDir {
        /// Path
        path: String,
        /// Attributes
        attrs: FileAttributes,
    },
    /// SSH_FXP_RMDIR
    RmDir {
        /// Path
        path: String,
    },
    /// SSH_FXP_REALPATH
    RealPath {
        /// Path
        path: String,
    },
    /// SSH_FXP_STAT
    Stat {
        /// Path
        path: String,
    },
    /// SSH_FXP_RENAME
    Rename {
        /// Existing path
        from: String,
        /// New path
        to: String,
    },
    /// SSH_FXP_READLINK
    ReadLink {
        /// Path
        path: String,
    },
    /// SSH_FXP_SYMLINK
    ///
    /// Sent as target then link path, the order OpenSSH servers expect.
    Symlink {
        /// Link to create
        link: String,
        /// Target it points to
        target: String,
    },
}

impl Request {
    /// Message type.
    pub fn message_type(&self) -> SftpMessageType {
        match self {
            Request::Init { .. } => SftpMessageType::Init,
            Request::Open { .. } => SftpMessageType::Open,
            Request::Close { .. } => SftpMessageType::Close,
            Request::Read { .. } => SftpMessageType::Read,
            Request::Write { .. } => SftpMessageType::Write,
            Request::LStat { .. } => SftpMessageType::LStat,
            Request::FStat { .. } => SftpMessageType::FStat,
            Request::SetStat { .. } => SftpMessageType::SetStat,
            Request::FSetStat { .. } => SftpMessageType::FSetStat,
            Request::OpenDir { .. } => SftpMessageType::OpenDir,
            Request::ReadDir { .. } => SftpMessageType::ReadDir,
            Request::Remove { .. } => SftpMessageType::Remove,
            Request::MkDir { .. } => SftpMessageType::MkDir,
            Request::RmDir { .. } => SftpMessageType::RmDir,
            Request::RealPath { .. } => SftpMessageType::RealPath,
            Request::Stat { .. } => SftpMessageType::Stat,
            Request::Rename { .. } => SftpMessageType::Rename,
            Request::ReadLink { .. } => SftpMessageType::ReadLink,
            Request::Symlink { .. } => SftpMessageType::Symlink,
        }
    }

    /// Encodes the framed packet with request ID `id`.
    pub fn encode(&self, id: u32) -> Vec<u8> {
        let mut body = BytesMut::new();
        match self {
            Request::Init { version } => {
                body.put_u32(*version);
                return frame(self.message_type(), &body);
            }
            _ => body.put_u32(id),
        }
        match self {
            Request::Init { .. } => {}
            Request::Open { path, flags, attrs } => {
                write_string(&mut body, path);
                body.put_u32(*flags);
                attrs.encode(&mut body);
            }
            Request::Close { handle }
            | Request::FStat { handle }
            | Request::ReadDir { handle } => write_bytes(&mut body, handle),
            Request::Read {
                handle,
                offset,
                len,
            } => {
                write_bytes(&mut body, handle);
                body.put_u64(*offset);
                body.put_u32(*len);
            }
            Request::Write {
                handle,
                offset,
                data,
            } => {
                write_bytes(&mut body, handle);
                body.put_u64(*offset);
                write_bytes(&mut body, data);
            }
            Request::LStat { path }
            | Request::OpenDir { path }
            | Request::Remove { path }
            | Request::RmDir { path }
            | Request::RealPath { path }
            | Request::Stat { path }
            | Request::ReadLink { path } => write_string(&mut body, path),
            Request::SetStat { path, attrs } | Request::MkDir { path, attrs } => {
                write_string(&mut body, path);
                attrs.encode(&mut body);
            }
            Request::FSetStat { handle, attrs } => {
                write_bytes(&mut body, handle);
                attrs.encode(&mut body);
            }
            Request::Rename { from, to } => {
                write_string(&mut body, from);
                write_string(&mut body, to);
            }
            Request::Symlink { link, target } => {
                write_string(&mut body, target);
                write_string(&mut body, link);
            }
        }
        frame(self.message_type(), &body)
    }

    /// Parses a request body. INIT carries no ID and yields 0.
    pub fn decode(msg_type: u8, body: &[u8]) -> SshResult<(u32, Self)> {
        let kind = SftpMessageType::from_u8(msg_type)
            .ok_or_else(|| protocol(format!("Unknown SFTP request type {}", msg_type)))?;
        let mut offset = 0;
        let data = body;
        let off = &mut offset;
        if kind == SftpMessageType::Init {
            return Ok((0, Request::Init { version: read_u32(data, off)? }));
        }
        let id = read_u32(data, off)?;
        let request = match kind {
            SftpMessageType::Open => Request::Open {
                path: read_string(data, off)?,
                flags: read_u32(data, off)?,
                attrs: FileAttributes::decode(data, off)?,
            },
            SftpMessageType::Close => Request::Close {
                handle: read_bytes(data, off)?,
            },
            SftpMessageType::Read => Request::Read {
                handle: read_bytes(data, off)?,
                offset: read_u64(data, off)?,
                len: read_u32(data, off)?,
            },
            SftpMessageType::Write => Request::Write {
                handle: read_bytes(data, off)?,
                offset: read_u64(data, off)?,
                data: read_bytes(data, off)?,
            },
            SftpMessageType::LStat => Request::LStat {
                path: read_string(data, off)?,
            },
            SftpMessageType::FStat => Request::FStat {
                handle: read_bytes(data, off)?,
            },
            SftpMessageType::SetStat => Request::SetStat {
                path: read_string(data, off)?,
                attrs: FileAttributes::decode(data, off)?,
            },
            SftpMessageType::FSetStat => Request::FSetStat {
                handle: read_bytes(data, off)?,
                attrs: FileAttributes::decode(data, off)?,
            },
            SftpMessageType::OpenDir => Request::OpenDir {
                path: read_string(data, off)?,
            },
            SftpMessageType::ReadDir => Request::ReadDir {
                handle: read_bytes(data, off)?,
            },
            SftpMessageType::Remove => Request::Remove {
                path: read_string(data, off)?,
            },
            SftpMessageType::MkDir => Request::MkDir {
                path: read_string(data, off)?,
                attrs: FileAttributes::decode(data, off)?,
            },
            SftpMessageType::RmDir => Request::RmDir {
                path: read_string(data, off)?,
            },
            SftpMessageType::RealPath => Request::RealPath {
                path: read_string(data, off)?,
            },
            SftpMessageType::Stat => Request::Stat {
                path: read_string(data, off)?,
            },
            SftpMessageType::Rename => Request::Rename {
                from: read_string(data, off)?,
                to: read_string(data, off)?,
            },
            SftpMessageType::ReadLink => Request::ReadLink {
                path: read_string(data, off)?,
            },
            SftpMessageType::Symlink => {
                let target = read_string(data, off)?;
                let link = read_string(data, off)?;
                Request::Symlink { link, target }
            }
            other => return Err(protocol(format!("{:?} is not a request", other))),
        };
        Ok((id, request))
    }
}

/// One entry of an SSH_FXP_NAME response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEntry {
    /// File name
    pub filename: String,
    /// `ls -l` style line
    pub longname: String,
    /// Attributes
    pub attrs: FileAttributes,
}

/// A server response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// SSH_FXP_VERSION
    Version {
        /// Protocol version
        version: u32,
    },
    /// SSH_FXP_STATUS
    Status {
        /// SSH_FX_* code
        code: u32,
        /// Message
        message: String,
    },
    /// SSH_FXP_HANDLE
    Handle(Vec<u8>),
    /// SSH_FXP_DATA
    Data(Vec<u8>),
    /// SSH_FXP_NAME
    Name(Vec<NameEntry>),
    /// SSH_FXP_ATTRS
    Attrs(FileAttributes),
}

impl Response {
    /// Status response with the default message for `code`.
    pub fn status(code: SftpErrorCode) -> Self {
        Response::Status {
            code: code as u32,
            message: code.message().to_string(),
        }
    }

    /// Encodes the framed packet answering request `id`.
    pub fn encode(&self, id: u32) -> Vec<u8> {
        let mut body = BytesMut::new();
        let kind = match self {
            Response::Version { version } => {
                body.put_u32(*version);
                return frame(SftpMessageType::Version, &body);
            }
            Response::Status { code, message } => {
                body.put_u32(id);
                body.put_u32(*code);
                write_string(&mut body, message);
                write_string(&mut body, "");
                SftpMessageType::Status
            }
            Response::Handle(handle) => {
                body.put_u32(id);
                write_bytes(&mut body, handle);
                SftpMessageType::Handle
            }
            Response::Data(data) => {
                body.put_u32(id);
                write_bytes(&mut body, data);
                SftpMessageType::Data
            }
            Response::Name(entries) => {
                body.put_u32(id);
                body.put_u32(entries.len() as u32);
                for entry in entries {
                    write_string(&mut body, &entry.filename);
                    write_string(&mut body, &entry.longname);
                    entry.attrs.encode(&mut body);
                }
                SftpMessageType::Name
            }
            Response::Attrs(attrs) => {
                body.put_u32(id);
                attrs.encode(&mut body);
                SftpMessageType::Attrs
            }
        };
        frame(kind, &body)
    }

    /// Parses a response body. VERSION carries no ID and yields `None`.
    pub fn decode(msg_type: u8, body: &[u8]) -> SshResult<(Option<u32>, Self)> {
        let mut offset = 0;
        let off = &mut offset;
        let kind = SftpMessageType::from_u8(msg_type)
            .ok_or_else(|| protocol(format!("Unknown SFTP response type {}", msg_type)))?;
        if kind == SftpMessageType::Version {
            let version = read_u32(body, off)?;
            return Ok((None, Response::Version { version }));
        }
        let id = read_u32(body, off)?;
        let response = match kind {
            SftpMessageType::Status => {
                let code = read_u32(body, off)?;
                // Some servers omit the message and language tag.
                let message = if *off < body.len() {
                    read_string(body, off)?
                } else {
                    String::new()
                };
                Response::Status { code, message }
            }
            SftpMessageType::Handle => Response::Handle(read_bytes(body, off)?),
            SftpMessageType::Data => Response::Data(read_bytes(body, off)?),
            SftpMessageType::Name => {
                let count = read_u32(body, off)? as usize;
                if count > body.len() {
                    return Err(protocol(format!("NAME declares {} entries", count)));
                }
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    entries.push(NameEntry {
                        filename: read_string(body, off)?,
                        longname: read_string(body, off)?,
                        attrs: FileAttributes::decode(body, off)?,
                    });
                }
                Response::Name(entries)
            }
            SftpMessageType::Attrs => Response::Attrs(FileAttributes::decode(body, off)?),
            other => return Err(protocol(format!("{:?} is not a response", other))),
        };
        Ok((Some(id), response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(SftpMessageType::from_u8(1), Some(SftpMessageType::Init));
        assert_eq!(SftpMessageType::from_u8(101), Some(SftpMessageType::Status));
        assert_eq!(SftpMessageType::from_u8(255), None);
    }

    #[test]
    fn test_frame_layout() {
        let bytes = Request::Init {
            version: SFTP_VERSION,
        }
        .encode(99);

        // length (4) + type (1) + version (4), no request ID
        assert_eq!(bytes, vec![0, 0, 0, 5, 1, 0, 0, 0, 3]);
    }

    #[test]
    fn test_split_frame_waits_for_data() {
        let packet = Request::Stat {
            path: "/tmp".to_string(),
        }
        .encode(7);
        let mut buf = BytesMut::from(&packet[..packet.len() - 1]);
        assert!(split_frame(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), packet.len() - 1);

        buf.put_u8(packet[packet.len() - 1]);
        buf.put_slice(&packet);
        let (kind, body) = split_frame(&mut buf).unwrap().unwrap();
        assert_eq!(kind, SftpMessageType::Stat as u8);
        assert_eq!(
            Request::decode(kind, &body).unwrap(),
            (
                7,
                Request::Stat {
                    path: "/tmp".to_string()
                }
            )
        );
        assert!(split_frame(&mut buf).unwrap().is_some());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_split_frame_rejects_oversized() {
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        buf.put_u8(1);
        assert!(matches!(
            split_frame(&mut buf),
            Err(SshError::Sftp { code: 0, .. })
        ));
    }

    #[test]
    fn test_write_request() {
        let request = Request::Write {
            handle: b"h1".to_vec(),
            offset: 4096,
            data: b"payload".to_vec(),
        };
        let mut buf = BytesMut::from(&request.encode(3)[..]);
        let (kind, body) = split_frame(&mut buf).unwrap().unwrap();
        assert_eq!(Request::decode(kind, &body).unwrap(), (3, request));
    }

    #[test]
    fn test_status_without_message() {
        let mut body = BytesMut::new();
        body.put_u32(12);
        body.put_u32(SftpErrorCode::Eof as u32);
        let (id, response) = Response::decode(SftpMessageType::Status as u8, &body).unwrap();
        assert_eq!(id, Some(12));
        assert_eq!(
            response,
            Response::Status {
                code: 1,
                message: String::new()
            }
        );
    }

    #[test]
    fn test_name_response() {
        let response = Response::Name(vec![NameEntry {
            filename: "a.txt".to_string(),
            longname: "-rw-r--r-- 1 u g 4 a.txt".to_string(),
            attrs: FileAttributes {
                size: Some(4),
                ..FileAttributes::default()
            },
        }]);
        let mut buf = BytesMut::from(&response.encode(5)[..]);
        let (kind, body) = split_frame(&mut buf).unwrap().unwrap();
        assert_eq!(Response::decode(kind, &body).unwrap(), (Some(5), response));
    }

    #[test]
    fn test_request_is_not_response() {
        let packet = Request::Close { handle: vec![1] }.encode(1);
        let mut buf = BytesMut::from(&packet[..]);
        let (kind, body) = split_frame(&mut buf).unwrap().unwrap();
        assert!(Response::decode(kind, &body).is_err());
    }
}
