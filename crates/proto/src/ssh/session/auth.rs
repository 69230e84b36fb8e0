//! User authentication on a [`Session`].
//!
//! Every method is resumable in non-blocking mode: the request that is on
//! the wire is remembered, so calling the same method again after
//! `WouldBlock` waits for its reply instead of sending a second request.
//! A rejected attempt leaves the session usable for another method.

use std::path::Path;

use sshwire_platform::{SshError, SshResult};
use tracing::{debug, info, warn};

use super::{Session, SessionInner};
use crate::ssh::agent::Agent;
use crate::ssh::auth::{
    construct_signature_data, AuthBanner, AuthFailure, AuthMethod, AuthPkOk, AuthRequest,
    InfoRequest, InfoResponse, KeyboardInteractivePrompt, ServiceAccept, ServiceRequest,
    SERVICE_CONNECTION, SERVICE_USERAUTH,
};
use crate::ssh::hostkey::{HostKey, HostKeyAlgorithm};
use crate::ssh::message::MessageType;
use crate::ssh::privatekey::{PrivateKey, PublicIdentity};

const FAILURE: u8 = MessageType::UserauthFailure as u8;
const SUCCESS: u8 = MessageType::UserauthSuccess as u8;
const PK_OK: u8 = MessageType::UserauthPkOk as u8;
const INFO_REQUEST: u8 = MessageType::UserauthPkOk as u8;

impl SessionInner {
    /// Reads the next authentication-layer message, storing banners.
    fn next_auth_message(&mut self) -> SshResult<Vec<u8>> {
        loop {
            let payload = self.next_non_connection()?;
            if payload[0] == MessageType::UserauthBanner as u8 {
                let banner = AuthBanner::from_bytes(&payload)?;
                debug!(banner = banner.message(), "Authentication banner");
                self.auth.banner = Some(banner.message().to_string());
                continue;
            }
            return Ok(payload);
        }
    }

    fn ensure_userauth_service(&mut self) -> SshResult<()> {
        if self.auth.authenticated {
            return Err(SshError::InvalidRequest(
                "Session is already authenticated".to_string(),
            ));
        }
        if self.auth.service_accepted {
            return Ok(());
        }
        if !self.auth.service_requested {
            let request = ServiceRequest {
                service: SERVICE_USERAUTH.to_string(),
            };
            self.send(&request.to_bytes())?;
            self.auth.service_requested = true;
        }
        let payload = self.next_auth_message()?;
        if payload[0] != MessageType::ServiceAccept as u8 {
            return Err(SshError::Protocol(format!(
                "Expected SERVICE_ACCEPT, got message {}",
                payload[0]
            )));
        }
        let accept = ServiceAccept::from_bytes(&payload)?;
        if accept.service != SERVICE_USERAUTH {
            return Err(SshError::Protocol(format!(
                "Server accepted unexpected service {}",
                accept.service
            )));
        }
        self.auth.service_accepted = true;
        Ok(())
    }

    /// Sends the request built by `build` unless the request named `key` is
    /// already outstanding, then reads the reply.
    fn auth_exchange(
        &mut self,
        key: &str,
        build: impl FnOnce() -> SshResult<Vec<u8>>,
    ) -> SshResult<Vec<u8>> {
        if self.auth.pending.as_deref() != Some(key) {
            if let Some(stale) = self.auth.pending.take() {
                warn!(request = %stale, "Abandoning unanswered authentication request");
            }
            let payload = build()?;
            self.send(&payload)?;
            self.auth.pending = Some(key.to_string());
        }
        let reply = self.next_auth_message()?;
        self.auth.pending = None;
        Ok(reply)
    }

    fn auth_succeeded(&mut self, user: &str, method: &str) -> SshResult<()> {
        self.auth.authenticated = true;
        self.transport_mut()?.set_authenticated();
        info!(user, method, "Authentication succeeded");
        Ok(())
    }

    fn auth_rejected(&mut self, reply: &[u8], message: String) -> SshResult<SshError> {
        let failure = AuthFailure::from_bytes(reply)?;
        debug!(methods = ?failure.methods_can_continue(), "{}", message);
        Ok(failure.into_error(message))
    }

    /// Runs `publickey` authentication: an unsigned query, then the signed
    /// request once the server answered PK_OK.
    fn pubkey_auth(
        &mut self,
        user: &str,
        identity: &PublicIdentity,
        algorithm: HostKeyAlgorithm,
        sign: &mut dyn FnMut(&[u8]) -> SshResult<Vec<u8>>,
    ) -> SshResult<()> {
        self.ensure_userauth_service()?;
        let algorithm_name = identity.auth_algorithm(algorithm);
        let blob = identity.blob();
        let sign_key = format!("publickey-sign:{}:{}", user, algorithm_name);

        if self.auth.pending.as_deref() != Some(sign_key.as_str()) {
            let query_key = format!("publickey-query:{}:{}", user, algorithm_name);
            let reply = self.auth_exchange(&query_key, || {
                let method = AuthMethod::PublicKey {
                    algorithm: algorithm_name.clone(),
                    public_key: blob.clone(),
                    signature: None,
                };
                Ok(AuthRequest::new(user, SERVICE_CONNECTION, method).to_bytes())
            })?;
            match reply[0] {
                PK_OK => {
                    let ok = AuthPkOk::from_bytes(&reply)?;
                    debug!(algorithm = ok.algorithm(), "Server will accept public key");
                }
                SUCCESS => return self.auth_succeeded(user, "publickey"),
                FAILURE => {
                    return Err(self.auth_rejected(
                        &reply,
                        format!("Username/public key combination invalid ({})", algorithm_name),
                    )?)
                }
                other => return Err(unexpected(other)),
            }
        }

        let session_id = self
            .transport_ref()?
            .session_id()
            .ok_or_else(|| SshError::Protocol("No session identifier".to_string()))?
            .to_vec();
        let reply = self.auth_exchange(&sign_key, || {
            let data = construct_signature_data(
                &session_id,
                user,
                SERVICE_CONNECTION,
                &algorithm_name,
                &blob,
            );
            let signature = sign(&data)?;
            let method = AuthMethod::PublicKey {
                algorithm: algorithm_name.clone(),
                public_key: blob.clone(),
                signature: Some(signature),
            };
            Ok(AuthRequest::new(user, SERVICE_CONNECTION, method).to_bytes())
        })?;
        match reply[0] {
            SUCCESS => self.auth_succeeded(user, "publickey"),
            FAILURE => {
                debug!(algorithm = %algorithm_name, "Signed public key request rejected");
                Err(SshError::PublicKeyUnverified(format!(
                    "Invalid signature for supplied public key, or bad username/public key combination ({})",
                    algorithm_name
                )))
            }
            other => Err(unexpected(other)),
        }
    }

    fn pubkey_with_private(
        &mut self,
        user: &str,
        identity: &PublicIdentity,
        key: &PrivateKey,
    ) -> SshResult<()> {
        let algorithm = key
            .algorithms()
            .first()
            .copied()
            .unwrap_or_else(|| key.algorithm());
        let mut sign = |data: &[u8]| key.sign_as(algorithm, data);
        self.pubkey_auth(user, identity, algorithm, &mut sign)
    }
}

/// Builds the identity offered for a private key: the given public key or
/// certificate, or the key's own public half.
fn resolve_identity(key: &PrivateKey, public: Option<PublicIdentity>) -> SshResult<PublicIdentity> {
    let own = key.public_key();
    match public {
        None => Ok(PublicIdentity::Key(own)),
        Some(identity) => {
            if identity.key() != &own {
                return Err(SshError::KeyFile(format!(
                    "Public key ({}) does not match the private key ({})",
                    identity.key_type(),
                    key.key_type()
                )));
            }
            Ok(identity)
        }
    }
}

fn unexpected(message: u8) -> SshError {
    SshError::Protocol(format!(
        "Unexpected message {} during authentication",
        message
    ))
}

impl Session {
    /// Asks the server which authentication methods it accepts for `user`.
    ///
    /// Returns the comma separated method list. If the server accepts the
    /// `none` method the session becomes authenticated and the list is
    /// empty.
    pub fn userauth_list(&self, user: &str) -> SshResult<String> {
        self.run(|inner| {
            inner.ensure_userauth_service()?;
            let reply = inner.auth_exchange(&format!("none:{}", user), || {
                Ok(AuthRequest::new(user, SERVICE_CONNECTION, AuthMethod::None).to_bytes())
            })?;
            match reply[0] {
                SUCCESS => {
                    inner.auth_succeeded(user, "none")?;
                    Ok(String::new())
                }
                FAILURE => {
                    let failure = AuthFailure::from_bytes(&reply)?;
                    Ok(failure.methods_can_continue().join(","))
                }
                other => Err(unexpected(other)),
            }
        })
    }

    /// Returns true once authentication succeeded.
    pub fn userauth_authenticated(&self) -> bool {
        self.lock()
            .map(|inner| inner.is_authenticated())
            .unwrap_or(false)
    }

    /// Returns the last banner the server sent during authentication.
    pub fn userauth_banner(&self) -> Option<String> {
        self.lock().ok()?.auth.banner.clone()
    }

    /// Authenticates with a password.
    ///
    /// # Errors
    ///
    /// [`SshError::Authentication`] if the server rejects the password; it
    /// carries the methods that may still succeed.
    pub fn userauth_password(&self, user: &str, password: &str) -> SshResult<()> {
        self.run(|inner| {
            inner.ensure_userauth_service()?;
            let reply = inner.auth_exchange(&format!("password:{}", user), || {
                let method = AuthMethod::Password(password.to_string());
                Ok(AuthRequest::new(user, SERVICE_CONNECTION, method).to_bytes())
            })?;
            match reply[0] {
                SUCCESS => inner.auth_succeeded(user, "password"),
                FAILURE => Err(inner.auth_rejected(&reply, "Invalid username/password".to_string())?),
                other => Err(unexpected(other)),
            }
        })
    }

    /// Authenticates with a private key file.
    ///
    /// `pubkey` may name an OpenSSH public key or certificate file; without
    /// it the public key is derived from the private key. An empty
    /// passphrase is treated as none.
    ///
    /// # Errors
    ///
    /// - [`SshError::KeyFile`] if a file is unreadable, malformed, or the
    ///   passphrase is wrong
    /// - [`SshError::Authentication`] if the server does not accept the key
    /// - [`SshError::PublicKeyUnverified`] if the signed request is rejected
    pub fn userauth_pubkey_file(
        &self,
        user: &str,
        pubkey: Option<&Path>,
        privkey: &Path,
        passphrase: Option<&str>,
    ) -> SshResult<()> {
        let loaded = PrivateKey::from_file(privkey, passphrase).and_then(|key| {
            let public = pubkey.map(PublicIdentity::from_file).transpose()?;
            let identity = resolve_identity(&key, public)?;
            Ok((key, identity))
        });
        let (key, identity) = self.recorded(loaded)?;
        self.run(|inner| inner.pubkey_with_private(user, &identity, &key))
    }

    /// Authenticates with key material held in memory.
    ///
    /// `pubkey` is an OpenSSH public key or certificate line; `privkey` is
    /// the private key in OpenSSH or PEM form.
    pub fn userauth_pubkey_memory(
        &self,
        user: &str,
        pubkey: Option<&str>,
        privkey: &str,
        passphrase: Option<&str>,
    ) -> SshResult<()> {
        let loaded = PrivateKey::from_bytes(privkey.as_bytes(), passphrase).and_then(|key| {
            let public = pubkey
                .map(|line| PublicIdentity::from_openssh(line.as_bytes()))
                .transpose()?;
            let identity = resolve_identity(&key, public)?;
            Ok((key, identity))
        });
        let (key, identity) = self.recorded(loaded)?;
        self.run(|inner| inner.pubkey_with_private(user, &identity, &key))
    }

    /// Authenticates with keyboard-interactive challenges answered by
    /// `prompt`.
    pub fn userauth_keyboard_interactive<P>(&self, user: &str, prompt: &mut P) -> SshResult<()>
    where
        P: KeyboardInteractivePrompt,
    {
        self.run(|inner| {
            inner.ensure_userauth_service()?;
            let key = format!("keyboard-interactive:{}", user);
            let mut reply = inner.auth_exchange(&key, || {
                let method = AuthMethod::KeyboardInteractive {
                    submethods: String::new(),
                };
                Ok(AuthRequest::new(user, SERVICE_CONNECTION, method).to_bytes())
            })?;
            loop {
                match reply[0] {
                    SUCCESS => return inner.auth_succeeded(user, "keyboard-interactive"),
                    FAILURE => {
                        return Err(inner.auth_rejected(
                            &reply,
                            "Keyboard-interactive authentication failed".to_string(),
                        )?)
                    }
                    INFO_REQUEST => {
                        let request = InfoRequest::from_bytes(&reply)?;
                        debug!(prompts = request.prompts.len(), "Keyboard-interactive challenge");
                        let responses =
                            prompt.prompt(&request.name, &request.instruction, &request.prompts);
                        if responses.len() != request.prompts.len() {
                            return Err(SshError::InvalidRequest(format!(
                                "{} responses for {} prompts",
                                responses.len(),
                                request.prompts.len()
                            )));
                        }
                        inner.send(&InfoResponse { responses }.to_bytes())?;
                        inner.auth.pending = Some(key.clone());
                        reply = inner.auth_exchange(&key, || Ok(Vec::new()))?;
                    }
                    other => return Err(unexpected(other)),
                }
            }
        })
    }

    /// Authenticates with the identities held by the SSH agent at
    /// `SSH_AUTH_SOCK`, trying each in turn.
    ///
    /// # Errors
    ///
    /// [`SshError::Agent`] if the agent is unreachable or holds no identity
    /// the server accepts.
    pub fn userauth_agent(&self, user: &str) -> SshResult<()> {
        self.run(|inner| {
            if inner.pending.agent.is_none() {
                let mut agent = Agent::connect()?;
                agent.list_identities()?;
                inner.pending.agent = Some((agent, 0));
            }
            loop {
                let Some((mut agent, index)) = inner.pending.agent.take() else {
                    return Err(SshError::Agent("Agent state lost".to_string()));
                };
                let Some(agent_identity) = agent.identities().get(index).cloned() else {
                    return Err(SshError::Agent(format!(
                        "No agent identity was accepted for {}",
                        user
                    )));
                };
                let identity = match PublicIdentity::from_blob(agent_identity.blob()) {
                    Ok(identity) => identity,
                    Err(e) => {
                        debug!(error = %e, "Skipping unusable agent identity");
                        inner.pending.agent = Some((agent, index + 1));
                        continue;
                    }
                };
                let Some(algorithm) = identity.key().algorithms().first().copied() else {
                    inner.pending.agent = Some((agent, index + 1));
                    continue;
                };

                let result = {
                    let mut sign = |data: &[u8]| agent.sign(&agent_identity, data, algorithm);
                    inner.pubkey_auth(user, &identity, algorithm, &mut sign)
                };
                match result {
                    Ok(()) => {
                        info!(comment = agent_identity.comment(), "Agent identity accepted");
                        return Ok(());
                    }
                    Err(SshError::WouldBlock) => {
                        inner.pending.agent = Some((agent, index));
                        return Err(SshError::WouldBlock);
                    }
                    Err(
                        e @ (SshError::Authentication { .. }
                        | SshError::PublicKeyUnverified(_)
                        | SshError::HostKeySign(_)
                        | SshError::Agent(_)),
                    ) => {
                        debug!(comment = agent_identity.comment(), error = %e, "Agent identity rejected");
                        inner.pending.agent = Some((agent, index + 1));
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }
}
