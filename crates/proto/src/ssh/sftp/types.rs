//! SFTP data types and structures.

use bytes::{BufMut, BytesMut};
use sshwire_platform::SshResult;

use crate::ssh::wire::{read_string, read_u32, read_u64};

/// SFTP status codes (SSH_FX_*).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SftpErrorCode {
    /// SSH_FX_OK - Success
    Ok = 0,
    /// SSH_FX_EOF - End of file
    Eof = 1,
    /// SSH_FX_NO_SUCH_FILE - No such file
    NoSuchFile = 2,
    /// SSH_FX_PERMISSION_DENIED - Permission denied
    PermissionDenied = 3,
    /// SSH_FX_FAILURE - General failure
    Failure = 4,
    /// SSH_FX_BAD_MESSAGE - Bad message
    BadMessage = 5,
    /// SSH_FX_NO_CONNECTION - No connection
    NoConnection = 6,
    /// SSH_FX_CONNECTION_LOST - Connection lost
    ConnectionLost = 7,
    /// SSH_FX_OP_UNSUPPORTED - Operation not supported
    OpUnsupported = 8,
}

impl SftpErrorCode {
    /// Convert from u32.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::Eof),
            2 => Some(Self::NoSuchFile),
            3 => Some(Self::PermissionDenied),
            4 => Some(Self::Failure),
            5 => Some(Self::BadMessage),
            6 => Some(Self::NoConnection),
            7 => Some(Self::ConnectionLost),
            8 => Some(Self::OpUnsupported),
            _ => None,
        }
    }

    /// Returns error message.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Ok => "Success",
            Self::Eof => "End of file",
            Self::NoSuchFile => "No such file or directory",
            Self::PermissionDenied => "Permission denied",
            Self::Failure => "Failure",
            Self::BadMessage => "Bad message",
            Self::NoConnection => "No connection",
            Self::ConnectionLost => "Connection lost",
            Self::OpUnsupported => "Operation not supported",
        }
    }
}

/// File type derived from the permission bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Regular file
    Regular,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
    /// Special file
    Special,
    /// Unknown type
    Unknown,
}

/// File open flags (SSH_FXF_*).
#[derive(Debug, Clone, Copy)]
pub struct FileOpenFlags(pub u32);

impl FileOpenFlags {
    /// SSH_FXF_READ - Open for reading
    pub const READ: u32 = 0x00000001;
    /// SSH_FXF_WRITE - Open for writing
    pub const WRITE: u32 = 0x00000002;
    /// SSH_FXF_APPEND - Force writes to append
    pub const APPEND: u32 = 0x00000004;
    /// SSH_FXF_CREAT - Create if doesn't exist
    pub const CREAT: u32 = 0x00000008;
    /// SSH_FXF_TRUNC - Truncate to 0 length
    pub const TRUNC: u32 = 0x00000010;
    /// SSH_FXF_EXCL - Fail if file exists
    pub const EXCL: u32 = 0x00000020;
}

/// File mode (permissions and type bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMode(pub u32);

impl FileMode {
    /// Mask for the file type bits
    pub const TYPE_MASK: u32 = 0o170000;
    /// Regular file
    pub const TYPE_REGULAR: u32 = 0o100000;
    /// Directory
    pub const TYPE_DIRECTORY: u32 = 0o040000;
    /// Symbolic link
    pub const TYPE_SYMLINK: u32 = 0o120000;

    /// Default file permissions (0644 = rw-r--r--)
    pub const DEFAULT_FILE: u32 = 0o644;
    /// Default directory permissions (0755 = rwxr-xr-x)
    pub const DEFAULT_DIR: u32 = 0o755;

    /// Type encoded in the mode.
    pub fn file_type(&self) -> FileType {
        match self.0 & Self::TYPE_MASK {
            Self::TYPE_REGULAR => FileType::Regular,
            Self::TYPE_DIRECTORY => FileType::Directory,
            Self::TYPE_SYMLINK => FileType::Symlink,
            0 => FileType::Unknown,
            _ => FileType::Special,
        }
    }

    /// Permission bits without the type.
    pub fn permissions(&self) -> u32 {
        self.0 & 0o7777
    }
}

/// File attribute flags.
#[derive(Debug, Clone, Copy)]
pub struct AttrFlags(pub u32);

impl AttrFlags {
    /// SSH_FILEXFER_ATTR_SIZE
    pub const SIZE: u32 = 0x00000001;
    /// SSH_FILEXFER_ATTR_UIDGID
    pub const UIDGID: u32 = 0x00000002;
    /// SSH_FILEXFER_ATTR_PERMISSIONS
    pub const PERMISSIONS: u32 = 0x00000004;
    /// SSH_FILEXFER_ATTR_ACMODTIME
    pub const ACMODTIME: u32 = 0x00000008;
    /// SSH_FILEXFER_ATTR_EXTENDED
    pub const EXTENDED: u32 = 0x80000000;
}

/// File attributes.
///
/// Unset fields are left out on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttributes {
    /// File size in bytes
    pub size: Option<u64>,
    /// User ID
    pub uid: Option<u32>,
    /// Group ID
    pub gid: Option<u32>,
    /// Permissions
    pub permissions: Option<FileMode>,
    /// Access time (Unix timestamp)
    pub atime: Option<u32>,
    /// Modification time (Unix timestamp)
    pub mtime: Option<u32>,
}

impl FileAttributes {
    /// Creates empty attributes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attributes carrying only permission bits.
    pub fn with_permissions(mode: u32) -> Self {
        Self {
            permissions: Some(FileMode(mode)),
            ..Self::default()
        }
    }

    /// File type from the permission bits, `Unknown` if absent.
    pub fn file_type(&self) -> FileType {
        self.permissions
            .map(|p| p.file_type())
            .unwrap_or(FileType::Unknown)
    }

    /// True for directories.
    pub fn is_dir(&self) -> bool {
        self.file_type() == FileType::Directory
    }

    /// True for regular files.
    pub fn is_file(&self) -> bool {
        self.file_type() == FileType::Regular
    }

    /// Appends the wire encoding to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut flags = 0u32;
        if self.size.is_some() {
            flags |= AttrFlags::SIZE;
        }
        if self.uid.is_some() && self.gid.is_some() {
            flags |= AttrFlags::UIDGID;
        }
        if self.permissions.is_some() {
            flags |= AttrFlags::PERMISSIONS;
        }
        if self.atime.is_some() && self.mtime.is_some() {
            flags |= AttrFlags::ACMODTIME;
        }

        buf.put_u32(flags);
        if let Some(size) = self.size {
            buf.put_u64(size);
        }
        if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
            buf.put_u32(uid);
            buf.put_u32(gid);
        }
        if let Some(permissions) = self.permissions {
            buf.put_u32(permissions.0);
        }
        if let (Some(atime), Some(mtime)) = (self.atime, self.mtime) {
            buf.put_u32(atime);
            buf.put_u32(mtime);
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.to_vec()
    }

    /// Parses attributes at `offset`, advancing it.
    ///
    /// Extended attribute pairs are skipped.
    pub fn decode(data: &[u8], offset: &mut usize) -> SshResult<Self> {
        let flags = read_u32(data, offset)?;
        let mut attrs = Self::new();

        if flags & AttrFlags::SIZE != 0 {
            attrs.size = Some(read_u64(data, offset)?);
        }
        if flags & AttrFlags::UIDGID != 0 {
            attrs.uid = Some(read_u32(data, offset)?);
            attrs.gid = Some(read_u32(data, offset)?);
        }
        if flags & AttrFlags::PERMISSIONS != 0 {
            attrs.permissions = Some(FileMode(read_u32(data, offset)?));
        }
        if flags & AttrFlags::ACMODTIME != 0 {
            attrs.atime = Some(read_u32(data, offset)?);
            attrs.mtime = Some(read_u32(data, offset)?);
        }
        if flags & AttrFlags::EXTENDED != 0 {
            let count = read_u32(data, offset)?;
            for _ in 0..count {
                read_string(data, offset)?;
                read_string(data, offset)?;
            }
        }
        Ok(attrs)
    }
}
