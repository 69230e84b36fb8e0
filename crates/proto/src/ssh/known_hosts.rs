//! SSH known_hosts file support (OpenSSH format).
//!
//! Host-key trust decisions are left to the caller: after the handshake,
//! [`Session::hostkey`](crate::ssh::session::Session::hostkey) yields the raw
//! key blob, which is checked against a [`KnownHosts`] collection.
//!
//! # Format
//!
//! Each line in a known_hosts file has the format:
//! ```text
//! [hostnames] keytype base64-key [comment]
//! ```
//!
//! Hostnames can be:
//! - Standard: `example.com` or `[example.com]:2222`
//! - Hashed: `|1|salt|hash` (HMAC-SHA1 hashed hostname)
//! - Wildcard: `*.example.com`
//! - Multiple: `host1,host2,host3`
//! - Negated: `*.example.com,!bad.example.com`
//!
//! Marker lines (`@cert-authority`, `@revoked`) are skipped.
//!
//! # Example
//!
//! ```rust,no_run
//! use sshwire_proto::ssh::known_hosts::{CheckResult, KnownHosts};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let host_key: Vec<u8> = Vec::new();
//! let known_hosts = KnownHosts::from_file("/home/me/.ssh/known_hosts")?;
//!
//! match known_hosts.check("example.com", 22, &host_key) {
//!     CheckResult::Match => println!("Host key verified"),
//!     CheckResult::Mismatch => println!("WARNING: Host key changed!"),
//!     CheckResult::NotFound => println!("Unknown host"),
//!     CheckResult::Failure => println!("Host key could not be checked"),
//! }
//! # Ok(())
//! # }
//! ```

use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use sshwire_platform::{SshError, SshResult};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::ssh::wire::read_string;

type HmacSha1 = Hmac<Sha1>;

fn host_port(hostname: &str, port: u16) -> String {
    if port == 22 {
        hostname.to_string()
    } else {
        format!("[{}]:{}", hostname, port)
    }
}

/// A single known_hosts entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownHost {
    /// Hostname pattern (standard, hashed, or wildcard)
    hostname_pattern: String,
    /// Key type (e.g., "ssh-ed25519", "ssh-rsa")
    key_type: String,
    /// Public key data (SSH wire format)
    key_data: Vec<u8>,
    /// Optional comment
    comment: String,
}

impl KnownHost {
    /// Creates a new known host entry.
    pub fn new(hostname_pattern: String, key_type: String, key_data: Vec<u8>) -> Self {
        Self {
            hostname_pattern,
            key_type,
            key_data,
            comment: String::new(),
        }
    }

    /// Returns the hostname pattern.
    pub fn hostname_pattern(&self) -> &str {
        &self.hostname_pattern
    }

    /// Returns the key type.
    pub fn key_type(&self) -> &str {
        &self.key_type
    }

    /// Returns the key data.
    pub fn key_data(&self) -> &[u8] {
        &self.key_data
    }

    /// Returns the comment.
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// Checks if this entry matches a hostname and port.
    ///
    /// Supports:
    /// - Standard matching: `example.com`
    /// - Hashed matching: `|1|salt|hash`
    /// - Wildcard matching: `*.example.com`
    /// - Port matching: `[example.com]:2222`
    pub fn matches(&self, hostname: &str, port: u16) -> SshResult<bool> {
        let full_host = host_port(hostname, port);
        let mut matched = false;

        for pattern in self.hostname_pattern.split(',') {
            let pattern = pattern.trim();

            if let Some(negated) = pattern.strip_prefix('!') {
                if Self::matches_pattern(negated, &full_host)? {
                    return Ok(false);
                }
                continue;
            }

            if Self::matches_pattern(pattern, &full_host)? {
                matched = true;
            }
        }

        Ok(matched)
    }

    /// Matches a single pattern against a hostname.
    fn matches_pattern(pattern: &str, hostname: &str) -> SshResult<bool> {
        if pattern.starts_with("|1|") {
            return Self::verify_hashed_hostname(pattern, hostname);
        }

        if pattern.contains('*') || pattern.contains('?') {
            return Ok(Self::wildcard_match(pattern, hostname));
        }

        Ok(pattern.eq_ignore_ascii_case(hostname))
    }

    /// Verifies a hashed hostname using HMAC-SHA1.
    ///
    /// Format: |1|salt|hash
    /// Where hash = Base64(HMAC-SHA1(salt, hostname))
    fn verify_hashed_hostname(hashed: &str, hostname: &str) -> SshResult<bool> {
        let parts: Vec<&str> = hashed.split('|').collect();

        if parts.len() != 4 || !parts[0].is_empty() || parts[1] != "1" {
            return Ok(false);
        }

        let salt = base64::engine::general_purpose::STANDARD
            .decode(parts[2])
            .map_err(|e| SshError::Protocol(format!("Invalid base64 salt: {}", e)))?;

        let expected_hash = base64::engine::general_purpose::STANDARD
            .decode(parts[3])
            .map_err(|e| SshError::Protocol(format!("Invalid base64 hash: {}", e)))?;

        let computed_hash = Self::hash_hostname(&salt, hostname)?;

        // Constant-time comparison
        use subtle::ConstantTimeEq;
        Ok(computed_hash.ct_eq(&expected_hash[..]).into())
    }

    fn hash_hostname(salt: &[u8], hostname: &str) -> SshResult<Vec<u8>> {
        let mut hmac = HmacSha1::new_from_slice(salt)
            .map_err(|e| SshError::Protocol(format!("HMAC creation failed: {}", e)))?;
        hmac.update(hostname.as_bytes());
        Ok(hmac.finalize().into_bytes().to_vec())
    }

    /// Builds a hashed `|1|salt|hash` pattern for a host.
    pub fn hashed_pattern(hostname: &str, port: u16) -> SshResult<String> {
        let mut salt = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut salt);
        let hash = Self::hash_hostname(&salt, &host_port(hostname, port))?;
        let engine = base64::engine::general_purpose::STANDARD;
        Ok(format!("|1|{}|{}", engine.encode(salt), engine.encode(hash)))
    }

    /// Simple wildcard matching (* and ?).
    fn wildcard_match(pattern: &str, text: &str) -> bool {
        let pattern_chars: Vec<char> = pattern.to_ascii_lowercase().chars().collect();
        let text_chars: Vec<char> = text.to_ascii_lowercase().chars().collect();

        Self::wildcard_match_impl(&pattern_chars, &text_chars)
    }

    fn wildcard_match_impl(pattern: &[char], text: &[char]) -> bool {
        match (pattern.first(), text.first()) {
            (None, None) => true,
            (None, Some(_)) => false,
            (Some('*'), _) => {
                Self::wildcard_match_impl(&pattern[1..], text)
                    || (!text.is_empty() && Self::wildcard_match_impl(pattern, &text[1..]))
            }
            (Some(_), None) => false,
            (Some('?'), Some(_)) => Self::wildcard_match_impl(&pattern[1..], &text[1..]),
            (Some(p), Some(t)) => p == t && Self::wildcard_match_impl(&pattern[1..], &text[1..]),
        }
    }

    /// Parses a single line from a known_hosts file.
    ///
    /// Format: `hostname keytype base64-key [comment]`
    ///
    /// # Examples
    ///
    /// ```rust
    /// use sshwire_proto::ssh::known_hosts::KnownHost;
    ///
    /// let line = "example.com ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIBRanDK33/M2A9M0Lc/TQ/pF5kfd8rplxF34cupZF1gD user@host";
    /// let entry = KnownHost::parse_line(line).unwrap();
    /// assert_eq!(entry.hostname_pattern(), "example.com");
    /// assert_eq!(entry.key_type(), "ssh-ed25519");
    /// ```
    pub fn parse_line(line: &str) -> SshResult<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Err(SshError::Protocol("Empty or comment line".to_string()));
        }
        if line.starts_with('@') {
            return Err(SshError::Protocol("Marker lines are not supported".to_string()));
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            return Err(SshError::Protocol(
                "Invalid known_hosts line: too few fields (need at least 3)".to_string(),
            ));
        }

        let key_data = base64::engine::general_purpose::STANDARD
            .decode(parts[2])
            .map_err(|e| SshError::Protocol(format!("Invalid base64 key data: {}", e)))?;

        Ok(Self {
            hostname_pattern: parts[0].to_string(),
            key_type: parts[1].to_string(),
            key_data,
            comment: parts[3..].join(" "),
        })
    }

    fn to_line(&self) -> String {
        let base64_key = base64::engine::general_purpose::STANDARD.encode(&self.key_data);
        if self.comment.is_empty() {
            format!("{} {} {}\n", self.hostname_pattern, self.key_type, base64_key)
        } else {
            format!(
                "{} {} {} {}\n",
                self.hostname_pattern, self.key_type, base64_key, self.comment
            )
        }
    }
}

/// Outcome of [`KnownHosts::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    /// An entry for the host holds exactly this key.
    Match,
    /// The host is known with a different key of the same type.
    Mismatch,
    /// No entry covers the host and key type.
    NotFound,
    /// The key could not be checked (malformed key blob).
    Failure,
}

/// Collection of known hosts.
#[derive(Debug, Clone, Default)]
pub struct KnownHosts {
    entries: Vec<KnownHost>,
    path: PathBuf,
}

impl KnownHosts {
    /// Creates a new empty collection bound to `path` for [`save`](Self::save).
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            entries: Vec::new(),
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Loads known_hosts from a file.
    ///
    /// A missing file yields an empty collection.
    pub fn from_file<P: AsRef<Path>>(path: P) -> SshResult<Self> {
        let path_ref = path.as_ref();

        if !path_ref.exists() {
            return Ok(Self::new(path_ref));
        }

        let content = std::fs::read_to_string(path_ref)?;
        let mut file = Self::from_string(&content);
        file.path = path_ref.to_path_buf();

        Ok(file)
    }

    /// Parses known_hosts content. Unparseable lines are skipped.
    pub fn from_string(content: &str) -> Self {
        let mut entries = Vec::new();

        for (line_num, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match KnownHost::parse_line(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("known_hosts line {} skipped: {}", line_num + 1, e),
            }
        }

        Self {
            entries,
            path: PathBuf::new(),
        }
    }

    /// Returns the list of known host entries.
    pub fn entries(&self) -> &[KnownHost] {
        &self.entries
    }

    /// Adds a known host entry.
    pub fn add_entry(&mut self, entry: KnownHost) {
        self.entries.push(entry);
    }

    /// Checks a host key blob (as returned by the session) for `hostname`.
    pub fn check(&self, hostname: &str, port: u16, key: &[u8]) -> CheckResult {
        let mut offset = 0;
        let key_type = match read_string(key, &mut offset) {
            Ok(key_type) => key_type,
            Err(_) => return CheckResult::Failure,
        };

        let mut result = CheckResult::NotFound;
        for entry in &self.entries {
            match entry.matches(hostname, port) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!("known_hosts entry {} skipped: {}", entry.hostname_pattern(), e);
                    continue;
                }
            }

            if entry.key_type() != key_type {
                continue;
            }
            if entry.key_data() == key {
                return CheckResult::Match;
            }
            result = CheckResult::Mismatch;
        }

        result
    }

    /// Adds a host with its public key blob.
    ///
    /// With `hash` set the hostname is stored as `|1|salt|hash`.
    pub fn add_host(&mut self, hostname: &str, port: u16, key: &[u8], hash: bool) -> SshResult<()> {
        let mut offset = 0;
        let key_type = read_string(key, &mut offset)?;
        let hostname_pattern = if hash {
            KnownHost::hashed_pattern(hostname, port)?
        } else {
            host_port(hostname, port)
        };

        self.entries
            .push(KnownHost::new(hostname_pattern, key_type, key.to_vec()));
        Ok(())
    }

    /// Removes all entries matching the given hostname and port.
    ///
    /// Returns the number of entries removed.
    pub fn remove_host(&mut self, hostname: &str, port: u16) -> usize {
        let initial_count = self.entries.len();

        self.entries
            .retain(|entry| !entry.matches(hostname, port).unwrap_or(false));

        initial_count - self.entries.len()
    }

    /// Replaces every entry for the host with one holding `key`.
    pub fn update_host(&mut self, hostname: &str, port: u16, key: &[u8]) -> SshResult<()> {
        self.remove_host(hostname, port);
        self.add_host(hostname, port, key, false)
    }

    /// Serializes all entries in known_hosts format.
    pub fn to_string_lossless(&self) -> String {
        self.entries.iter().map(KnownHost::to_line).collect()
    }

    /// Saves the collection to the path it was loaded from or created with.
    pub fn save(&self) -> SshResult<()> {
        use std::fs;
        use std::io::Write;

        if self.path.as_os_str().is_empty() {
            return Err(SshError::Config("known_hosts has no file path".to_string()));
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        // Atomic write via temp file
        let temp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(self.to_string_lossless().as_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &self.path)?;

        Ok(())
    }
}
