//! SSH authentication protocol (RFC 4252, RFC 4256).
//!
//! This module implements the user authentication messages:
//! - "publickey" - Public key authentication, with the try-then-sign query
//! - "password" - Password authentication
//! - "keyboard-interactive" - Challenge/response prompts (RFC 4256)
//! - "none" - Queries the list of acceptable methods
//!
//! The flows that drive these messages live in
//! [`Session`](crate::ssh::session::Session).
//!
//! # Example
//!
//! ```rust
//! use sshwire_proto::ssh::auth::{AuthRequest, AuthMethod};
//!
//! // Create password authentication request
//! let auth = AuthRequest::new(
//!     "user",
//!     "ssh-connection",
//!     AuthMethod::Password("secret".to_string()),
//! );
//! ```

use bytes::{BufMut, BytesMut};
use sha2::{Digest, Sha256};
use sshwire_platform::{SshError, SshResult};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::ssh::message::{MessageType, USERAUTH_INFO_REQUEST};
use crate::ssh::wire::{
    read_bool, read_bytes, read_name_list, read_string, read_u32, write_bool, write_bytes,
    write_name_list, write_string,
};

/// Service name requested before authentication.
pub const SERVICE_USERAUTH: &str = "ssh-userauth";

/// Service name started after authentication.
pub const SERVICE_CONNECTION: &str = "ssh-connection";

fn expect_type(data: &[u8], expected: u8, name: &str) -> SshResult<()> {
    match data.first() {
        None => Err(SshError::Protocol(format!("{} message is empty", name))),
        Some(&t) if t != expected => Err(SshError::Protocol(format!(
            "Invalid message type: expected {} ({}), got {}",
            expected, name, t
        ))),
        Some(_) => Ok(()),
    }
}

/// SSH authentication method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// No authentication; used to learn the acceptable methods.
    None,
    /// Password authentication.
    Password(String),
    /// Public key authentication.
    PublicKey {
        /// Algorithm name (e.g., "ssh-ed25519", "rsa-sha2-256")
        algorithm: String,
        /// Public key blob
        public_key: Vec<u8>,
        /// Signature (if present)
        signature: Option<Vec<u8>>,
    },
    /// Keyboard-interactive authentication (RFC 4256).
    KeyboardInteractive {
        /// Submethod hints, usually empty
        submethods: String,
    },
}

impl AuthMethod {
    /// Returns the method name.
    pub fn name(&self) -> &str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password(_) => "password",
            AuthMethod::PublicKey { .. } => "publickey",
            AuthMethod::KeyboardInteractive { .. } => "keyboard-interactive",
        }
    }
}

impl Drop for AuthMethod {
    fn drop(&mut self) {
        if let AuthMethod::Password(ref mut password) = self {
            password.zeroize();
        }
    }
}

/// SSH_MSG_SERVICE_REQUEST (RFC 4253 Section 10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRequest {
    /// Requested service name
    pub service: String,
}

impl ServiceRequest {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ServiceRequest as u8);
        write_string(&mut buf, &self.service);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SshResult<Self> {
        expect_type(data, MessageType::ServiceRequest as u8, "SSH_MSG_SERVICE_REQUEST")?;
        let mut offset = 1;
        Ok(Self {
            service: read_string(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_SERVICE_ACCEPT (RFC 4253 Section 10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAccept {
    /// Accepted service name
    pub service: String,
}

impl ServiceAccept {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ServiceAccept as u8);
        write_string(&mut buf, &self.service);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SshResult<Self> {
        expect_type(data, MessageType::ServiceAccept as u8, "SSH_MSG_SERVICE_ACCEPT")?;
        let mut offset = 1;
        Ok(Self {
            service: read_string(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_USERAUTH_REQUEST message (RFC 4252 Section 5).
///
/// This message is sent by the client to request authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    user_name: String,
    service_name: String,
    method: AuthMethod,
}

impl AuthRequest {
    /// Creates a new authentication request.
    ///
    /// # Example
    ///
    /// ```rust
    /// use sshwire_proto::ssh::auth::{AuthRequest, AuthMethod};
    ///
    /// let auth = AuthRequest::new(
    ///     "alice",
    ///     "ssh-connection",
    ///     AuthMethod::Password("secret".to_string()),
    /// );
    /// ```
    pub fn new(user_name: &str, service_name: &str, method: AuthMethod) -> Self {
        Self {
            user_name: user_name.to_string(),
            service_name: service_name.to_string(),
            method,
        }
    }

    /// Returns the user name.
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// Returns the service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Returns the authentication method.
    pub fn method(&self) -> &AuthMethod {
        &self.method
    }

    /// Serializes the authentication request to bytes.
    ///
    /// Format (RFC 4252 Section 5):
    /// ```text
    /// byte      SSH_MSG_USERAUTH_REQUEST (50)
    /// string    user name
    /// string    service name
    /// string    method name
    /// ....      method specific fields
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();

        buf.put_u8(MessageType::UserauthRequest as u8);
        write_string(&mut buf, &self.user_name);
        write_string(&mut buf, &self.service_name);
        write_string(&mut buf, self.method.name());

        match &self.method {
            AuthMethod::None => {}
            AuthMethod::Password(password) => {
                // boolean FALSE (not changing password)
                write_bool(&mut buf, false);
                write_string(&mut buf, password);
            }
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                write_bool(&mut buf, signature.is_some());
                write_string(&mut buf, algorithm);
                write_bytes(&mut buf, public_key);
                if let Some(sig) = signature {
                    write_bytes(&mut buf, sig);
                }
            }
            AuthMethod::KeyboardInteractive { submethods } => {
                // string language tag (deprecated)
                write_string(&mut buf, "");
                write_string(&mut buf, submethods);
            }
        }

        buf.to_vec()
    }

    /// Parses an authentication request from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Protocol`] if the data is invalid.
    pub fn from_bytes(data: &[u8]) -> SshResult<Self> {
        expect_type(data, MessageType::UserauthRequest as u8, "SSH_MSG_USERAUTH_REQUEST")?;
        let mut offset = 1;

        let user_name = read_string(data, &mut offset)?;
        let service_name = read_string(data, &mut offset)?;
        let method_name = read_string(data, &mut offset)?;

        let method = match method_name.as_str() {
            "none" => AuthMethod::None,
            "password" => {
                let changing = read_bool(data, &mut offset)?;
                if changing {
                    return Err(SshError::Protocol(
                        "Password change requests are not supported".to_string(),
                    ));
                }
                AuthMethod::Password(read_string(data, &mut offset)?)
            }
            "publickey" => {
                let has_signature = read_bool(data, &mut offset)?;
                let algorithm = read_string(data, &mut offset)?;
                let public_key = read_bytes(data, &mut offset)?;
                let signature = if has_signature {
                    Some(read_bytes(data, &mut offset)?)
                } else {
                    None
                };

                AuthMethod::PublicKey {
                    algorithm,
                    public_key,
                    signature,
                }
            }
            "keyboard-interactive" => {
                let _language = read_string(data, &mut offset)?;
                AuthMethod::KeyboardInteractive {
                    submethods: read_string(data, &mut offset)?,
                }
            }
            _ => {
                return Err(SshError::Protocol(format!(
                    "Unsupported authentication method: '{}'",
                    method_name
                )))
            }
        };

        Ok(Self {
            user_name,
            service_name,
            method,
        })
    }
}

/// SSH_MSG_USERAUTH_FAILURE message (RFC 4252 Section 5.1).
///
/// Sent by the server when authentication fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    methods_can_continue: Vec<String>,
    partial_success: bool,
}

impl AuthFailure {
    /// Creates a new authentication failure message.
    ///
    /// # Example
    ///
    /// ```rust
    /// use sshwire_proto::ssh::auth::AuthFailure;
    ///
    /// let failure = AuthFailure::new(
    ///     vec!["publickey".to_string(), "password".to_string()],
    ///     false,
    /// );
    /// ```
    pub fn new(methods: Vec<String>, partial_success: bool) -> Self {
        Self {
            methods_can_continue: methods,
            partial_success,
        }
    }

    /// Returns the methods that can continue.
    pub fn methods_can_continue(&self) -> &[String] {
        &self.methods_can_continue
    }

    /// Returns whether partial success was achieved.
    pub fn partial_success(&self) -> bool {
        self.partial_success
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthFailure as u8);
        write_name_list(&mut buf, &self.methods_can_continue);
        write_bool(&mut buf, self.partial_success);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SshResult<Self> {
        expect_type(data, MessageType::UserauthFailure as u8, "SSH_MSG_USERAUTH_FAILURE")?;
        let mut offset = 1;

        let methods_can_continue = read_name_list(data, &mut offset)?;
        let partial_success = read_bool(data, &mut offset)?;

        Ok(Self {
            methods_can_continue,
            partial_success,
        })
    }

    /// Converts the failure into the error returned to callers.
    pub fn into_error(self, message: impl Into<String>) -> SshError {
        SshError::Authentication {
            message: message.into(),
            methods: self.methods_can_continue.clone(),
        }
    }
}

/// SSH_MSG_USERAUTH_SUCCESS message (RFC 4252 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuthSuccess;

impl AuthSuccess {
    /// Creates a new authentication success message.
    pub fn new() -> Self {
        Self
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::UserauthSuccess as u8]
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SshResult<Self> {
        expect_type(data, MessageType::UserauthSuccess as u8, "SSH_MSG_USERAUTH_SUCCESS")?;
        Ok(Self)
    }
}

/// SSH_MSG_USERAUTH_BANNER message (RFC 4252 Section 5.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthBanner {
    message: String,
    language_tag: String,
}

impl AuthBanner {
    /// Creates a new banner message.
    pub fn new(message: String) -> Self {
        Self {
            message,
            language_tag: String::new(),
        }
    }

    /// Returns the banner message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthBanner as u8);
        write_string(&mut buf, &self.message);
        write_string(&mut buf, &self.language_tag);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SshResult<Self> {
        expect_type(data, MessageType::UserauthBanner as u8, "SSH_MSG_USERAUTH_BANNER")?;
        let mut offset = 1;

        let message = read_string(data, &mut offset)?;
        let language_tag = read_string(data, &mut offset)?;

        Ok(Self {
            message,
            language_tag,
        })
    }
}

/// SSH_MSG_USERAUTH_PK_OK message (RFC 4252 Section 7).
///
/// Sent by the server to indicate that the public key is acceptable
/// for authentication (in response to a try-then-sign query).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPkOk {
    algorithm: String,
    public_key: Vec<u8>,
}

impl AuthPkOk {
    /// Creates a new SSH_MSG_USERAUTH_PK_OK message.
    pub fn new(algorithm: impl Into<String>, public_key: Vec<u8>) -> Self {
        Self {
            algorithm: algorithm.into(),
            public_key,
        }
    }

    /// Returns the algorithm name.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Returns the public key blob.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Serializes to bytes.
    ///
    /// Format (RFC 4252 Section 7):
    /// ```text
    /// byte      SSH_MSG_USERAUTH_PK_OK (60)
    /// string    public key algorithm name
    /// string    public key blob
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthPkOk as u8);
        write_string(&mut buf, &self.algorithm);
        write_bytes(&mut buf, &self.public_key);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SshResult<Self> {
        expect_type(data, MessageType::UserauthPkOk as u8, "SSH_MSG_USERAUTH_PK_OK")?;
        let mut offset = 1;

        let algorithm = read_string(data, &mut offset)?;
        let public_key = read_bytes(data, &mut offset)?;

        Ok(Self {
            algorithm,
            public_key,
        })
    }
}

/// A single keyboard-interactive prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// Prompt text shown to the user
    pub text: String,
    /// Whether the response may be echoed
    pub echo: bool,
}

/// SSH_MSG_USERAUTH_INFO_REQUEST (RFC 4256 Section 3.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoRequest {
    /// Name of the challenge
    pub name: String,
    /// Instructions for the user
    pub instruction: String,
    /// Prompts to answer, in order
    pub prompts: Vec<Prompt>,
}

impl InfoRequest {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(USERAUTH_INFO_REQUEST);
        write_string(&mut buf, &self.name);
        write_string(&mut buf, &self.instruction);
        write_string(&mut buf, "");
        buf.put_u32(self.prompts.len() as u32);
        for prompt in &self.prompts {
            write_string(&mut buf, &prompt.text);
            write_bool(&mut buf, prompt.echo);
        }
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SshResult<Self> {
        expect_type(data, USERAUTH_INFO_REQUEST, "SSH_MSG_USERAUTH_INFO_REQUEST")?;
        let mut offset = 1;

        let name = read_string(data, &mut offset)?;
        let instruction = read_string(data, &mut offset)?;
        let _language = read_string(data, &mut offset)?;
        let count = read_u32(data, &mut offset)? as usize;
        // each prompt is at least 5 bytes
        if count > data.len() / 5 {
            return Err(SshError::Protocol(format!(
                "INFO_REQUEST declares {} prompts",
                count
            )));
        }

        let mut prompts = Vec::with_capacity(count);
        for _ in 0..count {
            let text = read_string(data, &mut offset)?;
            let echo = read_bool(data, &mut offset)?;
            prompts.push(Prompt { text, echo });
        }

        Ok(Self {
            name,
            instruction,
            prompts,
        })
    }
}

/// SSH_MSG_USERAUTH_INFO_RESPONSE (RFC 4256 Section 3.4).
#[derive(Clone, PartialEq, Eq)]
pub struct InfoResponse {
    /// Responses, one per prompt
    pub responses: Vec<String>,
}

impl InfoResponse {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthInfoResponse as u8);
        buf.put_u32(self.responses.len() as u32);
        for response in &self.responses {
            write_string(&mut buf, response);
        }
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SshResult<Self> {
        expect_type(
            data,
            MessageType::UserauthInfoResponse as u8,
            "SSH_MSG_USERAUTH_INFO_RESPONSE",
        )?;
        let mut offset = 1;
        let count = read_u32(data, &mut offset)? as usize;
        if count > data.len() / 4 {
            return Err(SshError::Protocol(format!(
                "INFO_RESPONSE declares {} responses",
                count
            )));
        }
        let mut responses = Vec::with_capacity(count);
        for _ in 0..count {
            responses.push(read_string(data, &mut offset)?);
        }
        Ok(Self { responses })
    }
}

impl std::fmt::Debug for InfoResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfoResponse")
            .field("responses", &self.responses.len())
            .finish()
    }
}

impl Drop for InfoResponse {
    fn drop(&mut self) {
        for response in &mut self.responses {
            response.zeroize();
        }
    }
}

/// Answers keyboard-interactive challenges.
///
/// Implemented for closures taking `(name, instruction, prompts)`.
pub trait KeyboardInteractivePrompt {
    /// Returns one response per prompt.
    fn prompt(&mut self, name: &str, instruction: &str, prompts: &[Prompt]) -> Vec<String>;
}

impl<F> KeyboardInteractivePrompt for F
where
    F: FnMut(&str, &str, &[Prompt]) -> Vec<String>,
{
    fn prompt(&mut self, name: &str, instruction: &str, prompts: &[Prompt]) -> Vec<String> {
        self(name, instruction, prompts)
    }
}

/// Constructs the data to be signed for public key authentication (RFC 4252 Section 7).
///
/// # Format
///
/// ```text
/// string    session identifier
/// byte      SSH_MSG_USERAUTH_REQUEST (50)
/// string    user name
/// string    service name
/// string    "publickey"
/// boolean   TRUE (has signature)
/// string    public key algorithm name
/// string    public key blob
/// ```
pub fn construct_signature_data(
    session_id: &[u8],
    user_name: &str,
    service_name: &str,
    algorithm: &str,
    public_key_blob: &[u8],
) -> Vec<u8> {
    let mut buf = BytesMut::new();

    write_bytes(&mut buf, session_id);
    buf.put_u8(MessageType::UserauthRequest as u8);
    write_string(&mut buf, user_name);
    write_string(&mut buf, service_name);
    write_string(&mut buf, "publickey");
    write_bool(&mut buf, true);
    write_string(&mut buf, algorithm);
    write_bytes(&mut buf, public_key_blob);

    buf.to_vec()
}

/// Compares two passwords in constant time.
///
/// # Example
///
/// ```rust
/// use sshwire_proto::ssh::auth::constant_time_compare;
///
/// assert!(constant_time_compare("secret", "secret"));
/// assert!(!constant_time_compare("secret", "wrong"));
/// ```
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    // Hash first so lengths do not leak
    let hash_a = Sha256::digest(a.as_bytes());
    let hash_b = Sha256::digest(b.as_bytes());

    hash_a.ct_eq(&hash_b).into()
}
