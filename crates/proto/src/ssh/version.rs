//! SSH protocol version exchange (RFC 4253 Section 4.2).
//!
//! The SSH protocol begins with a version exchange where both client and server
//! send an identification string:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! Example: `SSH-2.0-sshwire_0.1.0`
//!
//! # Security
//!
//! - Maximum line length: 255 characters including CR LF
//! - Must start with "SSH-2.0-" or "SSH-1.99-"
//! - No null bytes allowed in version string
//!
//! # Example
//!
//! ```rust
//! use sshwire_proto::ssh::version::Version;
//!
//! let version = Version::new("sshwire_0.1.0", Some("test"));
//! assert_eq!(version.to_string(), "SSH-2.0-sshwire_0.1.0 test");
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_8.9").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_8.9");
//! ```

use sshwire_platform::{SshError, SshResult};

/// Maximum length of SSH version string, including CR LF.
pub const MAX_VERSION_LENGTH: usize = 255;

/// Upper bound on bytes a server may send before its identification line.
pub const MAX_PRE_BANNER_BYTES: usize = 64 * 1024;

/// SSH protocol version string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    proto_version: String,
    software_version: String,
    comments: Option<String>,
}

impl Version {
    /// Creates a new SSH version string with protocol version "2.0".
    ///
    /// ```rust
    /// use sshwire_proto::ssh::version::Version;
    ///
    /// let version = Version::new("sshwire_0.1.0", None);
    /// assert_eq!(version.to_string(), "SSH-2.0-sshwire_0.1.0");
    /// ```
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
        }
    }

    /// Returns the identification string this crate sends by default.
    ///
    /// ```rust
    /// use sshwire_proto::ssh::version::Version;
    ///
    /// assert!(Version::default_banner().starts_with("SSH-2.0-sshwire_"));
    /// ```
    pub fn default_banner() -> String {
        Self::new(&format!("sshwire_{}", env!("CARGO_PKG_VERSION")), None).to_string()
    }

    /// Validates a locally configured identification string.
    ///
    /// Trailing CR/LF are stripped. The banner must start with `SSH-2.0-`,
    /// fit in 255 bytes with CR LF, and contain no NUL or embedded line
    /// breaks.
    pub fn validate_local(banner: &str) -> SshResult<String> {
        let banner = banner.trim_end_matches(['\r', '\n']);

        if !banner.starts_with("SSH-2.0-") {
            return Err(SshError::Protocol(format!(
                "Local banner must start with 'SSH-2.0-', got '{}'",
                banner
            )));
        }
        if banner.len() + 2 > MAX_VERSION_LENGTH {
            return Err(SshError::Protocol(format!(
                "Local banner too long: {} bytes",
                banner.len()
            )));
        }
        if banner.contains(['\0', '\r', '\n']) {
            return Err(SshError::Protocol(
                "Local banner contains control characters".to_string(),
            ));
        }
        Ok(banner.to_string())
    }

    /// Parses an SSH version string.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Protocol`] if:
    /// - Line is too long (> 255 characters)
    /// - Line doesn't start with "SSH-"
    /// - Protocol version is not "2.0" or "1.99"
    /// - Line contains null bytes
    ///
    /// ```rust
    /// use sshwire_proto::ssh::version::Version;
    ///
    /// let version = Version::parse("SSH-2.0-OpenSSH_8.9\r\n").unwrap();
    /// assert_eq!(version.software(), "OpenSSH_8.9");
    /// ```
    pub fn parse(line: &str) -> SshResult<Self> {
        let line = line.trim_end_matches("\r\n").trim_end_matches('\n');

        if line.len() > MAX_VERSION_LENGTH {
            return Err(SshError::Protocol(format!(
                "Version string too long: {} bytes (max {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }

        if line.contains('\0') {
            return Err(SshError::Protocol(
                "Version string contains null byte".to_string(),
            ));
        }

        if !line.starts_with("SSH-") {
            return Err(SshError::Protocol(format!(
                "Invalid version string: must start with 'SSH-', got '{}'",
                line
            )));
        }

        // SSH-protoversion-softwareversion[ comments]
        let parts: Vec<&str> = line.splitn(3, '-').collect();
        if parts.len() < 3 {
            return Err(SshError::Protocol(format!(
                "Invalid version string format: '{}'",
                line
            )));
        }

        let proto_version = parts[1];
        let rest = parts[2];

        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(SshError::Protocol(format!(
                "Unsupported protocol version: '{}' (expected '2.0' or '1.99')",
                proto_version
            )));
        }

        let (software_version, comments) = match rest.split_once(' ') {
            Some((software, comments)) => (software.to_string(), Some(comments.trim().to_string())),
            None => (rest.to_string(), None),
        };

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version,
            comments,
        })
    }

    /// Returns the protocol version (e.g., "2.0").
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Returns the software version.
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// Converts to wire format (with CR LF).
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SSH-{}-{}", self.proto_version, self.software_version)?;
        if let Some(comments) = &self.comments {
            write!(f, " {}", comments)?;
        }
        Ok(())
    }
}

/// Scans buffered input for the peer identification line.
///
/// Lines before the `SSH-` line are skipped, as servers may send them.
/// Returns the identification line without CR LF and the number of bytes
/// consumed, or `None` if more input is needed.
pub fn scan_identification(buf: &[u8]) -> SshResult<Option<(String, usize)>> {
    let mut start = 0;
    while let Some(pos) = buf[start..].iter().position(|&b| b == b'\n') {
        let end = start + pos + 1;
        let line = &buf[start..end];
        if line.starts_with(b"SSH-") {
            if line.len() > MAX_VERSION_LENGTH {
                return Err(SshError::BannerRecv(format!(
                    "Identification line too long: {} bytes",
                    line.len()
                )));
            }
            let text = String::from_utf8_lossy(line)
                .trim_end_matches(['\r', '\n'])
                .to_string();
            return Ok(Some((text, end)));
        }
        start = end;
    }

    let pending = &buf[start..];
    if pending.starts_with(b"SSH-") && pending.len() > MAX_VERSION_LENGTH {
        return Err(SshError::BannerRecv(
            "Identification line too long".to_string(),
        ));
    }
    if buf.len() > MAX_PRE_BANNER_BYTES {
        return Err(SshError::BannerRecv(
            "No identification line received".to_string(),
        ));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_display() {
        let version = Version::new("sshwire_0.1.0", None);
        assert_eq!(version.proto_version(), "2.0");
        assert_eq!(version.to_string(), "SSH-2.0-sshwire_0.1.0");
        assert_eq!(version.to_wire_format(), b"SSH-2.0-sshwire_0.1.0\r\n");

        let with_comments = Version::new("sshwire_0.1.0", Some("test comment"));
        assert_eq!(with_comments.to_string(), "SSH-2.0-sshwire_0.1.0 test comment");
    }

    #[test]
    fn test_version_parse() {
        let version = Version::parse("SSH-2.0-OpenSSH_8.9 Ubuntu-3ubuntu0.1\r\n").unwrap();
        assert_eq!(version.software(), "OpenSSH_8.9");
        assert_eq!(version.comments(), Some("Ubuntu-3ubuntu0.1"));

        let old = Version::parse("SSH-1.99-Legacy").unwrap();
        assert_eq!(old.proto_version(), "1.99");
    }

    #[test]
    fn test_version_parse_rejects() {
        assert!(matches!(
            Version::parse("INVALID-2.0-Test"),
            Err(SshError::Protocol(_))
        ));
        match Version::parse("SSH-1.0-OldClient") {
            Err(SshError::Protocol(msg)) => assert!(msg.contains("Unsupported protocol version")),
            other => panic!("Expected Protocol error, got {:?}", other),
        }
        assert!(Version::parse(&format!("SSH-2.0-{}", "A".repeat(300))).is_err());
        assert!(Version::parse("SSH-2.0-Test\0Bad").is_err());
        assert!(Version::parse("SSH-2.0").is_err());
    }

    #[test]
    fn test_validate_local() {
        assert_eq!(
            Version::validate_local("SSH-2.0-custom\r\n").unwrap(),
            "SSH-2.0-custom"
        );
        assert!(matches!(
            Version::validate_local("bogus banner"),
            Err(SshError::Protocol(_))
        ));
        assert!(Version::validate_local("SSH-1.99-old").is_err());
        assert!(Version::validate_local("SSH-2.0-a\0b").is_err());
        assert!(Version::validate_local("SSH-2.0-a\r\nb").is_err());
        assert!(Version::validate_local(&format!("SSH-2.0-{}", "x".repeat(250))).is_err());
        assert!(Version::validate_local(&Version::default_banner()).is_ok());
    }

    #[test]
    fn test_scan_identification() {
        assert_eq!(scan_identification(b"SSH-2.0-Open").unwrap(), None);

        let (line, used) = scan_identification(b"SSH-2.0-OpenSSH_9.0\r\nrest")
            .unwrap()
            .unwrap();
        assert_eq!(line, "SSH-2.0-OpenSSH_9.0");
        assert_eq!(used, 21);

        let input = b"hello there\r\nwelcome\nSSH-2.0-srv\r\n\x00\x00";
        let (line, used) = scan_identification(input).unwrap().unwrap();
        assert_eq!(line, "SSH-2.0-srv");
        assert_eq!(&input[used..], b"\x00\x00");
    }

    #[test]
    fn test_scan_identification_limits() {
        let long = format!("SSH-2.0-{}", "A".repeat(300));
        assert!(scan_identification(long.as_bytes()).is_err());

        let noise = vec![b'x'; MAX_PRE_BANNER_BYTES + 1];
        assert!(matches!(
            scan_identification(&noise),
            Err(SshError::BannerRecv(_))
        ));
    }
}
