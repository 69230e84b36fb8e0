//! Loopback SSH server for integration tests.
//!
//! Built on the crate's server-role [`Transport`] over `std::net`, one
//! thread per connection. It understands enough of the connection protocol
//! to exercise the client: a handful of exec commands, SCP in both
//! directions, an SFTP v3 subsystem over an in-memory file store, direct
//! and reverse TCP/IP forwarding and keep-alives.
//!
//! Exec commands:
//!
//! | command                 | behavior                                        |
//! |-------------------------|-------------------------------------------------|
//! | `echo <text>`           | prints `<text>\n`, exit 0                       |
//! | `cat`                   | buffers stdin until EOF, prints it back, exit 0 |
//! | `stderr <text>`         | prints `<text>\n` on stderr, exit 1             |
//! | `exit <n>`              | exit status `n`                                 |
//! | `kill`                  | exits with signal `TERM`                        |
//! | `printenv <name>`       | prints a variable set with `env`                |
//! | `trigger-forward <port>`| opens a forwarded-tcpip channel for `<port>`    |
//! | `scp -[p]f <path>`      | SCP source                                      |
//! | `scp -[p]t <path>`      | SCP sink                                        |

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use sshwire_platform::{SshError, SshResult};
use sshwire_proto::ssh::auth::{
    construct_signature_data, AuthBanner, AuthFailure, AuthMethod, AuthPkOk, AuthRequest,
    AuthSuccess, InfoRequest, InfoResponse, Prompt, ServiceAccept, ServiceRequest,
};
use sshwire_proto::ssh::connection::{
    request_failure, ChannelClose, ChannelData, ChannelEof, ChannelExtendedData, ChannelFailure,
    ChannelOpen, ChannelOpenConfirmation, ChannelOpenFailure, ChannelOpenFailureReason,
    ChannelRequest, ChannelRequestType, ChannelSuccess, ChannelType, ChannelWindowAdjust,
    GlobalRequest, GlobalRequestType, RequestSuccess,
};
use sshwire_proto::ssh::hostkey::{Ed25519HostKey, HostKey};
use sshwire_proto::ssh::message::MessageType;
use sshwire_proto::ssh::privatekey::{PrivateKey, PublicIdentity};
use sshwire_proto::ssh::scp::ControlLine;
use sshwire_proto::ssh::session::Session;
use sshwire_proto::ssh::sftp::message::split_frame;
use sshwire_proto::ssh::sftp::{
    FileAttributes, FileMode, FileOpenFlags, NameEntry, Request, Response, SftpErrorCode,
};
use sshwire_proto::ssh::transport::{Role, Transport, TransportConfig};

/// User accepted by the default configuration.
pub const USER: &str = "tester";
/// Password of [`USER`].
pub const PASSWORD: &str = "secret123";
/// Home directory reported by SFTP `realpath(".")`.
pub const HOME: &str = "/home/tester";

const WINDOW: u32 = 2 * 1024 * 1024;
const MAX_PACKET: u32 = 32 * 1024;

/// Path of a file under `tests/keys`.
pub fn key_path(name: &str) -> std::path::PathBuf {
    std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/keys")
        .join(name)
}

/// Contents of a file under `tests/keys`.
pub fn key_text(name: &str) -> String {
    std::fs::read_to_string(key_path(name)).unwrap()
}

/// Installs a test subscriber once; honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Server behavior knobs.
#[derive(Clone)]
pub struct ServerConfig {
    /// Accepted `(user, password)` pairs
    pub passwords: Vec<(String, String)>,
    /// Public key blobs accepted for any user
    pub authorized_keys: Vec<Vec<u8>>,
    /// CA key blob trusted for user certificates
    pub user_ca: Option<Vec<u8>>,
    /// Whether keyboard-interactive is offered
    pub keyboard_interactive: bool,
    /// Sent as SSH_MSG_USERAUTH_BANNER before the first reply
    pub auth_banner: Option<String>,
    /// Whether tcpip-forward requests are granted
    pub allow_forward: bool,
    /// Receive window granted on each channel
    pub window: u32,
    /// Maximum packet size advertised on each channel
    pub max_packet: u32,
    /// When set, consumed window is granted back only after the output it
    /// triggered was sent and this much time passed
    pub adjust_delay: Option<Duration>,
    /// Server transport settings
    pub transport: TransportConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let authorized_keys = [
            "id_ed25519.pub",
            "id_ed25519_enc.pub",
            "id_ecdsa.pub",
            "id_ecdsa_pem.pub",
            "id_ecdsa384_cbc.pub",
            "id_ecdsa521_pkcs8.pub",
            "id_rsa.pub",
            "id_rsa_pem.pub",
        ]
        .iter()
            .map(|name| {
                PublicIdentity::from_openssh(key_text(name).as_bytes())
                    .unwrap()
                    .blob()
            })
            .collect();
        let ca = PublicIdentity::from_openssh(key_text("ca_ed25519.pub").as_bytes())
            .unwrap()
            .blob();
        let mut transport = TransportConfig::new(Role::Server);
        transport.preferences.set_compression(true);
        Self {
            passwords: vec![(USER.to_string(), PASSWORD.to_string())],
            authorized_keys,
            user_ca: Some(ca),
            keyboard_interactive: true,
            auth_banner: None,
            allow_forward: true,
            window: WINDOW,
            max_packet: MAX_PACKET,
            adjust_delay: None,
            transport,
        }
    }
}

/// A running test server.
pub struct TestServer {
    addr: SocketAddr,
    fs: MemFs,
    host_key: Arc<Ed25519HostKey>,
}

impl TestServer {
    /// Starts a server with the default configuration.
    pub fn start() -> Self {
        Self::start_with(ServerConfig::default())
    }

    /// Starts a server with `config`.
    pub fn start_with(config: ServerConfig) -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let fs = MemFs::new();
        let host_key = Arc::new(Ed25519HostKey::generate().unwrap());
        let config = Arc::new(config);

        let accept_fs = fs.clone();
        let accept_key = Arc::clone(&host_key);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let config = Arc::clone(&config);
                let fs = accept_fs.clone();
                let key: Arc<dyn HostKey> = accept_key.clone();
                thread::spawn(move || Connection::new(stream, config, fs, key).run());
            }
        });
        Self { addr, fs, host_key }
    }

    /// Listening address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shared in-memory file store.
    pub fn fs(&self) -> &MemFs {
        &self.fs
    }

    /// The server's host key blob.
    pub fn host_key_blob(&self) -> Vec<u8> {
        self.host_key.public_key_bytes()
    }

    /// A new session with a connected stream; no handshake yet.
    pub fn session(&self) -> Session {
        let session = Session::new();
        session.set_tcp_stream(TcpStream::connect(self.addr).unwrap());
        session
    }

    /// A session that completed the handshake and password authentication.
    pub fn authenticated(&self) -> Session {
        let session = self.session();
        session.handshake().unwrap();
        session.userauth_password(USER, PASSWORD).unwrap();
        session
    }
}

// ---------------------------------------------------------------------------
// In-memory file store
// ---------------------------------------------------------------------------

/// A file system entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// Regular file
    File {
        /// Contents
        data: Vec<u8>,
        /// Permission bits
        mode: u32,
        /// Modification time
        mtime: u32,
        /// Access time
        atime: u32,
    },
    /// Directory
    Dir {
        /// Permission bits
        mode: u32,
    },
    /// Symbolic link
    Symlink {
        /// Target path
        target: String,
    },
}

/// File store shared by all connections of a server.
#[derive(Debug, Clone)]
pub struct MemFs {
    nodes: Arc<Mutex<BTreeMap<String, Node>>>,
}

/// Resolves `path` against [`HOME`] and removes `.` and `..`.
pub fn normalize(path: &str) -> String {
    let full = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", HOME, path)
    };
    let mut parts: Vec<&str> = Vec::new();
    for part in full.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => path[..i].to_string(),
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

impl MemFs {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        for dir in ["/", "/home", HOME, "/tmp"] {
            nodes.insert(dir.to_string(), Node::Dir { mode: 0o755 });
        }
        Self {
            nodes: Arc::new(Mutex::new(nodes)),
        }
    }

    /// Stores a file.
    pub fn put_file(&self, path: &str, data: &[u8], mode: u32) {
        self.nodes.lock().unwrap().insert(
            normalize(path),
            Node::File {
                data: data.to_vec(),
                mode,
                mtime: 0,
                atime: 0,
            },
        );
    }

    /// Returns an entry.
    pub fn get(&self, path: &str) -> Option<Node> {
        self.nodes.lock().unwrap().get(&normalize(path)).cloned()
    }

    /// Returns a file's contents.
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.get(path)? {
            Node::File { data, .. } => Some(data),
            _ => None,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Node>> {
        self.nodes.lock().unwrap()
    }
}

fn is_dir(nodes: &BTreeMap<String, Node>, path: &str) -> bool {
    matches!(nodes.get(path), Some(Node::Dir { .. }))
}

fn children(nodes: &BTreeMap<String, Node>, dir: &str) -> Vec<String> {
    let prefix = if dir == "/" {
        "/".to_string()
    } else {
        format!("{}/", dir)
    };
    nodes
        .keys()
        .filter(|k| k.len() > prefix.len() && k.starts_with(&prefix) && !k[prefix.len()..].contains('/'))
        .cloned()
        .collect()
}

fn resolve(nodes: &BTreeMap<String, Node>, path: &str) -> String {
    let mut current = normalize(path);
    for _ in 0..8 {
        match nodes.get(&current) {
            Some(Node::Symlink { target }) => {
                current = if target.starts_with('/') {
                    normalize(target)
                } else {
                    normalize(&format!("{}/{}", parent_of(&current), target))
                }
            }
            _ => break,
        }
    }
    current
}

fn attributes(node: &Node) -> FileAttributes {
    let (size, mode, mtime, atime) = match node {
        Node::File {
            data,
            mode,
            mtime,
            atime,
        } => (data.len() as u64, FileMode::TYPE_REGULAR | mode, *mtime, *atime),
        Node::Dir { mode } => (0, FileMode::TYPE_DIRECTORY | mode, 0, 0),
        Node::Symlink { target } => (target.len() as u64, FileMode::TYPE_SYMLINK | 0o777, 0, 0),
    };
    FileAttributes {
        size: Some(size),
        uid: Some(1000),
        gid: Some(1000),
        permissions: Some(FileMode(mode)),
        atime: Some(atime),
        mtime: Some(mtime),
    }
}

fn apply_attributes(node: &mut Node, attrs: &FileAttributes) {
    match node {
        Node::File {
            data,
            mode,
            mtime,
            atime,
        } => {
            if let Some(size) = attrs.size {
                data.resize(size as usize, 0);
            }
            if let Some(perm) = attrs.permissions {
                *mode = perm.permissions();
            }
            if let (Some(a), Some(m)) = (attrs.atime, attrs.mtime) {
                *atime = a;
                *mtime = m;
            }
        }
        Node::Dir { mode } => {
            if let Some(perm) = attrs.permissions {
                *mode = perm.permissions();
            }
        }
        Node::Symlink { .. } => {}
    }
}

// ---------------------------------------------------------------------------
// SFTP subsystem
// ---------------------------------------------------------------------------

enum SftpHandle {
    File { path: String, flags: u32 },
    Dir { path: String, listed: bool },
}

struct SftpServer {
    fs: MemFs,
    inbuf: BytesMut,
    handles: HashMap<Vec<u8>, SftpHandle>,
    next_handle: u32,
}

fn status(code: SftpErrorCode) -> Response {
    Response::status(code)
}

impl SftpServer {
    fn new(fs: MemFs) -> Self {
        Self {
            fs,
            inbuf: BytesMut::new(),
            handles: HashMap::new(),
            next_handle: 1,
        }
    }

    /// Feeds client bytes, returning encoded responses.
    fn input(&mut self, data: &[u8]) -> SshResult<Vec<u8>> {
        self.inbuf.extend_from_slice(data);
        let mut out = Vec::new();
        while let Some((kind, body)) = split_frame(&mut self.inbuf)? {
            let (id, request) = Request::decode(kind, &body)?;
            let response = self.handle(request);
            out.extend_from_slice(&response.encode(id));
        }
        Ok(out)
    }

    fn new_handle(&mut self, handle: SftpHandle) -> Response {
        let id = self.next_handle.to_be_bytes().to_vec();
        self.next_handle += 1;
        self.handles.insert(id.clone(), handle);
        Response::Handle(id)
    }

    fn handle(&mut self, request: Request) -> Response {
        let fs = self.fs.clone();
        let mut nodes = fs.lock();
        match request {
            Request::Init { .. } => Response::Version { version: 3 },
            Request::Open { path, flags, attrs } => {
                let path = resolve(&nodes, &path);
                match nodes.get_mut(&path) {
                    Some(Node::File { data, .. }) => {
                        if flags & FileOpenFlags::CREAT != 0 && flags & FileOpenFlags::EXCL != 0 {
                            return status(SftpErrorCode::Failure);
                        }
                        if flags & FileOpenFlags::TRUNC != 0 {
                            data.clear();
                        }
                    }
                    Some(_) => return status(SftpErrorCode::Failure),
                    None => {
                        if flags & FileOpenFlags::CREAT == 0 {
                            return status(SftpErrorCode::NoSuchFile);
                        }
                        if !is_dir(&nodes, &parent_of(&path)) {
                            return status(SftpErrorCode::NoSuchFile);
                        }
                        let mode = attrs
                            .permissions
                            .map(|p| p.permissions())
                            .unwrap_or(FileMode::DEFAULT_FILE);
                        nodes.insert(
                            path.clone(),
                            Node::File {
                                data: Vec::new(),
                                mode,
                                mtime: 0,
                                atime: 0,
                            },
                        );
                    }
                }
                drop(nodes);
                self.new_handle(SftpHandle::File { path, flags })
            }
            Request::Close { handle } => match self.handles.remove(&handle) {
                Some(_) => status(SftpErrorCode::Ok),
                None => status(SftpErrorCode::Failure),
            },
            Request::Read {
                handle,
                offset,
                len,
            } => {
                let Some(SftpHandle::File { path, .. }) = self.handles.get(&handle) else {
                    return status(SftpErrorCode::Failure);
                };
                match nodes.get(path) {
                    Some(Node::File { data, .. }) => {
                        let offset = offset as usize;
                        if offset >= data.len() {
                            return status(SftpErrorCode::Eof);
                        }
                        let end = (offset + len as usize).min(data.len());
                        Response::Data(data[offset..end].to_vec())
                    }
                    _ => status(SftpErrorCode::NoSuchFile),
                }
            }
            Request::Write {
                handle,
                offset,
                data: chunk,
            } => {
                let Some(SftpHandle::File { path, flags }) = self.handles.get(&handle) else {
                    return status(SftpErrorCode::Failure);
                };
                if flags & (FileOpenFlags::WRITE | FileOpenFlags::APPEND) == 0 {
                    return status(SftpErrorCode::PermissionDenied);
                }
                match nodes.get_mut(path) {
                    Some(Node::File { data, .. }) => {
                        let start = if flags & FileOpenFlags::APPEND != 0 {
                            data.len()
                        } else {
                            offset as usize
                        };
                        if data.len() < start + chunk.len() {
                            data.resize(start + chunk.len(), 0);
                        }
                        data[start..start + chunk.len()].copy_from_slice(&chunk);
                        status(SftpErrorCode::Ok)
                    }
                    _ => status(SftpErrorCode::NoSuchFile),
                }
            }
            Request::LStat { path } => match nodes.get(&normalize(&path)) {
                Some(node) => Response::Attrs(attributes(node)),
                None => status(SftpErrorCode::NoSuchFile),
            },
            Request::Stat { path } => match nodes.get(&resolve(&nodes, &path)) {
                Some(node) => Response::Attrs(attributes(node)),
                None => status(SftpErrorCode::NoSuchFile),
            },
            Request::FStat { handle } => {
                let path = match self.handles.get(&handle) {
                    Some(SftpHandle::File { path, .. }) | Some(SftpHandle::Dir { path, .. }) => path,
                    None => return status(SftpErrorCode::Failure),
                };
                match nodes.get(path) {
                    Some(node) => Response::Attrs(attributes(node)),
                    None => status(SftpErrorCode::NoSuchFile),
                }
            }
            Request::SetStat { path, attrs } => {
                let path = resolve(&nodes, &path);
                match nodes.get_mut(&path) {
                    Some(node) => {
                        apply_attributes(node, &attrs);
                        status(SftpErrorCode::Ok)
                    }
                    None => status(SftpErrorCode::NoSuchFile),
                }
            }
            Request::FSetStat { handle, attrs } => {
                let path = match self.handles.get(&handle) {
                    Some(SftpHandle::File { path, .. }) | Some(SftpHandle::Dir { path, .. }) => path,
                    None => return status(SftpErrorCode::Failure),
                };
                match nodes.get_mut(path) {
                    Some(node) => {
                        apply_attributes(node, &attrs);
                        status(SftpErrorCode::Ok)
                    }
                    None => status(SftpErrorCode::NoSuchFile),
                }
            }
            Request::OpenDir { path } => {
                let path = resolve(&nodes, &path);
                if !is_dir(&nodes, &path) {
                    return status(SftpErrorCode::NoSuchFile);
                }
                drop(nodes);
                self.new_handle(SftpHandle::Dir {
                    path,
                    listed: false,
                })
            }
            Request::ReadDir { handle } => {
                let Some(SftpHandle::Dir { path, listed }) = self.handles.get_mut(&handle) else {
                    return status(SftpErrorCode::Failure);
                };
                if *listed {
                    return status(SftpErrorCode::Eof);
                }
                *listed = true;
                let dir_attrs = attributes(&Node::Dir { mode: 0o755 });
                let mut entries = vec![
                    NameEntry {
                        filename: ".".to_string(),
                        longname: ".".to_string(),
                        attrs: dir_attrs.clone(),
                    },
                    NameEntry {
                        filename: "..".to_string(),
                        longname: "..".to_string(),
                        attrs: dir_attrs,
                    },
                ];
                for child in children(&nodes, path) {
                    let attrs = nodes.get(&child).map(attributes).unwrap_or_default();
                    let name = name_of(&child).to_string();
                    entries.push(NameEntry {
                        longname: name.clone(),
                        filename: name,
                        attrs,
                    });
                }
                Response::Name(entries)
            }
            Request::Remove { path } => {
                let path = normalize(&path);
                match nodes.get(&path) {
                    Some(Node::Dir { .. }) => status(SftpErrorCode::Failure),
                    Some(_) => {
                        nodes.remove(&path);
                        status(SftpErrorCode::Ok)
                    }
                    None => status(SftpErrorCode::NoSuchFile),
                }
            }
            Request::MkDir { path, attrs } => {
                let path = normalize(&path);
                if nodes.contains_key(&path) {
                    return status(SftpErrorCode::Failure);
                }
                if !is_dir(&nodes, &parent_of(&path)) {
                    return status(SftpErrorCode::NoSuchFile);
                }
                let mode = attrs
                    .permissions
                    .map(|p| p.permissions())
                    .unwrap_or(FileMode::DEFAULT_DIR);
                nodes.insert(path, Node::Dir { mode });
                status(SftpErrorCode::Ok)
            }
            Request::RmDir { path } => {
                let path = normalize(&path);
                if !is_dir(&nodes, &path) {
                    return status(SftpErrorCode::NoSuchFile);
                }
                if !children(&nodes, &path).is_empty() {
                    return status(SftpErrorCode::Failure);
                }
                nodes.remove(&path);
                status(SftpErrorCode::Ok)
            }
            Request::RealPath { path } => {
                let path = normalize(&path);
                Response::Name(vec![NameEntry {
                    longname: path.clone(),
                    filename: path,
                    attrs: FileAttributes::default(),
                }])
            }
            Request::Rename { from, to } => {
                let from = normalize(&from);
                let to = normalize(&to);
                if !nodes.contains_key(&from) {
                    return status(SftpErrorCode::NoSuchFile);
                }
                if nodes.contains_key(&to) {
                    return status(SftpErrorCode::Failure);
                }
                let prefix = format!("{}/", from);
                let moved: Vec<String> = nodes
                    .keys()
                    .filter(|k| **k == from || k.starts_with(&prefix))
                    .cloned()
                    .collect();
                for old in moved {
                    if let Some(node) = nodes.remove(&old) {
                        let new = format!("{}{}", to, &old[from.len()..]);
                        nodes.insert(new, node);
                    }
                }
                status(SftpErrorCode::Ok)
            }
            Request::ReadLink { path } => match nodes.get(&normalize(&path)) {
                Some(Node::Symlink { target }) => Response::Name(vec![NameEntry {
                    filename: target.clone(),
                    longname: target.clone(),
                    attrs: FileAttributes::default(),
                }]),
                Some(_) => status(SftpErrorCode::Failure),
                None => status(SftpErrorCode::NoSuchFile),
            },
            Request::Symlink { link, target } => {
                let link = normalize(&link);
                if nodes.contains_key(&link) {
                    return status(SftpErrorCode::Failure);
                }
                nodes.insert(link, Node::Symlink { target });
                status(SftpErrorCode::Ok)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SCP
// ---------------------------------------------------------------------------

/// Splits a command line the way a POSIX shell would for simple quoting.
fn shell_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    current.push(q);
                }
            }
            '\\' => {
                in_word = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ' ' | '\t' => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            other => {
                in_word = true;
                current.push(other);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

enum SourceState {
    WaitReady,
    WaitTimesAck,
    WaitHeaderAck,
    WaitDataAck,
    Done,
}

struct ScpSource {
    path: String,
    preserve: bool,
    state: SourceState,
}

enum SinkState {
    Line(Vec<u8>),
    Data { remaining: u64 },
    Trailer,
    Done,
}

struct ScpSink {
    target: String,
    times: Option<(u64, u64)>,
    header: Option<(u32, String)>,
    data: Vec<u8>,
    state: SinkState,
}

/// Result of feeding bytes to a command.
#[derive(Default)]
struct Output {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit: Option<u32>,
}

impl ScpSource {
    fn input(&mut self, fs: &MemFs, data: &[u8], out: &mut Output) {
        for &byte in data {
            if byte != 0 {
                out.exit = Some(1);
                self.state = SourceState::Done;
                return;
            }
            match self.state {
                SourceState::WaitReady => {
                    let node = fs.get(&self.path);
                    match node {
                        Some(Node::File {
                            mode, mtime, atime, ..
                        }) => {
                            if self.preserve {
                                out.stdout.extend(
                                    ControlLine::Times {
                                        mtime: u64::from(mtime),
                                        atime: u64::from(atime),
                                    }
                                    .to_bytes(),
                                );
                                self.state = SourceState::WaitTimesAck;
                            } else {
                                self.send_header(fs, mode, out);
                            }
                        }
                        _ => {
                            out.stdout.extend(
                                ControlLine::Error {
                                    fatal: false,
                                    message: format!(
                                        "scp: {}: No such file or directory",
                                        self.path
                                    ),
                                }
                                .to_bytes(),
                            );
                            out.exit = Some(1);
                            self.state = SourceState::Done;
                        }
                    }
                }
                SourceState::WaitTimesAck => {
                    let mode = match fs.get(&self.path) {
                        Some(Node::File { mode, .. }) => mode,
                        _ => 0o644,
                    };
                    self.send_header(fs, mode, out);
                }
                SourceState::WaitHeaderAck => {
                    out.stdout.extend(fs.file(&self.path).unwrap_or_default());
                    out.stdout.push(0);
                    self.state = SourceState::WaitDataAck;
                }
                SourceState::WaitDataAck => {
                    out.exit = Some(0);
                    self.state = SourceState::Done;
                }
                SourceState::Done => {}
            }
        }
    }

    fn send_header(&mut self, fs: &MemFs, mode: u32, out: &mut Output) {
        let size = fs.file(&self.path).map(|d| d.len() as u64).unwrap_or(0);
        out.stdout.extend(
            ControlLine::File {
                mode,
                size,
                name: name_of(&normalize(&self.path)).to_string(),
            }
            .to_bytes(),
        );
        self.state = SourceState::WaitHeaderAck;
    }
}

impl ScpSink {
    fn start(fs: &MemFs, path: &str, out: &mut Output) -> Self {
        let target = normalize(path);
        let nodes = fs.lock();
        let parent_ok = is_dir(&nodes, &target) || is_dir(&nodes, &parent_of(&target));
        drop(nodes);
        let state = if parent_ok {
            out.stdout.push(0);
            SinkState::Line(Vec::new())
        } else {
            out.stdout.extend(
                ControlLine::Error {
                    fatal: false,
                    message: format!("scp: {}: No such file or directory", path),
                }
                .to_bytes(),
            );
            out.exit = Some(1);
            SinkState::Done
        };
        Self {
            target,
            times: None,
            header: None,
            data: Vec::new(),
            state,
        }
    }

    fn input(&mut self, fs: &MemFs, data: &[u8], out: &mut Output) {
        let mut rest = data;
        while !rest.is_empty() {
            match &mut self.state {
                SinkState::Line(line) => {
                    let byte = rest[0];
                    rest = &rest[1..];
                    if byte != b'\n' {
                        line.push(byte);
                        continue;
                    }
                    let line = std::mem::take(line);
                    match ControlLine::parse(&line) {
                        Ok(ControlLine::Times { mtime, atime }) => {
                            self.times = Some((mtime, atime));
                            out.stdout.push(0);
                        }
                        Ok(ControlLine::File { mode, size, name }) => {
                            self.header = Some((mode, name));
                            out.stdout.push(0);
                            self.state = if size == 0 {
                                SinkState::Trailer
                            } else {
                                SinkState::Data { remaining: size }
                            };
                        }
                        _ => {
                            out.stdout.extend(
                                ControlLine::Error {
                                    fatal: true,
                                    message: "scp: protocol error".to_string(),
                                }
                                .to_bytes(),
                            );
                            out.exit = Some(1);
                            self.state = SinkState::Done;
                        }
                    }
                }
                SinkState::Data { remaining } => {
                    let take = (*remaining).min(rest.len() as u64) as usize;
                    self.data.extend_from_slice(&rest[..take]);
                    rest = &rest[take..];
                    *remaining -= take as u64;
                    if *remaining == 0 {
                        self.state = SinkState::Trailer;
                    }
                }
                SinkState::Trailer => {
                    rest = &rest[1..];
                    self.store(fs);
                    out.stdout.push(0);
                    self.state = SinkState::Done;
                }
                SinkState::Done => return,
            }
        }
    }

    fn eof(&mut self, fs: &MemFs, out: &mut Output) {
        if matches!(self.state, SinkState::Trailer) {
            self.store(fs);
            self.state = SinkState::Done;
        }
        out.exit.get_or_insert(0);
    }

    fn store(&mut self, fs: &MemFs) {
        let Some((mode, name)) = self.header.take() else {
            return;
        };
        let mut nodes = fs.lock();
        let path = if is_dir(&nodes, &self.target) {
            normalize(&format!("{}/{}", self.target, name))
        } else {
            self.target.clone()
        };
        let (mtime, atime) = self.times.unwrap_or((0, 0));
        nodes.insert(
            path,
            Node::File {
                data: std::mem::take(&mut self.data),
                mode,
                mtime: mtime as u32,
                atime: atime as u32,
            },
        );
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

enum App {
    Idle,
    Cat(Vec<u8>),
    Echo,
    Sftp(Box<SftpServer>),
    Source(ScpSource),
    Sink(ScpSink),
}

struct ServerChannel {
    /// Client's channel ID, `None` until our open is confirmed
    remote: Option<u32>,
    remote_window: u32,
    remote_max: u32,
    consumed: u32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    app: App,
    env: HashMap<String, String>,
    session: bool,
    exit_status: Option<u32>,
    exit_signal: Option<String>,
    finishing: bool,
    close_sent: bool,
}

impl ServerChannel {
    fn new(remote: Option<u32>, remote_window: u32, remote_max: u32, session: bool) -> Self {
        Self {
            remote,
            remote_window,
            remote_max,
            consumed: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
            app: App::Idle,
            env: HashMap::new(),
            session,
            exit_status: None,
            exit_signal: None,
            finishing: false,
            close_sent: false,
        }
    }

    fn apply(&mut self, out: Output) {
        self.stdout.extend(out.stdout);
        self.stderr.extend(out.stderr);
        if let Some(code) = out.exit {
            self.finish(code);
        }
    }

    fn finish(&mut self, code: u32) {
        if !self.finishing {
            self.exit_status = Some(code);
            self.finishing = true;
        }
    }
}

struct Connection {
    transport: Transport,
    config: Arc<ServerConfig>,
    fs: MemFs,
    authenticated: bool,
    banner_sent: bool,
    kbd_user: Option<String>,
    channels: BTreeMap<u32, ServerChannel>,
    next_id: u32,
    forwards: Vec<(String, u32)>,
    next_port: u32,
}

fn msg(byte: u8) -> Option<MessageType> {
    MessageType::from_u8(byte)
}

impl Connection {
    fn new(stream: TcpStream, config: Arc<ServerConfig>, fs: MemFs, key: Arc<dyn HostKey>) -> Self {
        let transport =
            Transport::new(Box::new(stream), config.transport.clone()).with_host_keys(vec![key]);
        Self {
            transport,
            config,
            fs,
            authenticated: false,
            banner_sent: false,
            kbd_user: None,
            channels: BTreeMap::new(),
            next_id: 100,
            forwards: Vec::new(),
            next_port: 40000,
        }
    }

    fn run(mut self) {
        if self.transport.handshake().is_err() {
            return;
        }
        loop {
            if self.pump().is_err() {
                return;
            }
            let payload = match self.transport.read_packet() {
                Ok(payload) => payload,
                Err(_) => return,
            };
            if self.handle(&payload).is_err() {
                return;
            }
        }
    }

    fn send(&mut self, payload: &[u8]) -> SshResult<()> {
        self.transport.send_payload(payload)?;
        self.transport.flush()
    }

    fn handle(&mut self, payload: &[u8]) -> SshResult<()> {
        match msg(payload[0]) {
            Some(MessageType::ServiceRequest) => {
                let request = ServiceRequest::from_bytes(payload)?;
                self.send(
                    &ServiceAccept {
                        service: request.service,
                    }
                    .to_bytes(),
                )
            }
            Some(MessageType::UserauthRequest) => self.on_auth(payload),
            Some(MessageType::UserauthInfoResponse) => self.on_info_response(payload),
            _ if !self.authenticated => Ok(()),
            Some(MessageType::GlobalRequest) => self.on_global_request(payload),
            Some(MessageType::ChannelOpen) => self.on_channel_open(payload),
            Some(MessageType::ChannelOpenConfirmation) => {
                let confirm = ChannelOpenConfirmation::from_bytes(payload)?;
                if let Some(channel) = self.channels.get_mut(&confirm.recipient_channel()) {
                    channel.remote = Some(confirm.sender_channel());
                    channel.remote_window = confirm.initial_window_size();
                    channel.remote_max = confirm.maximum_packet_size();
                    channel.stdout.extend_from_slice(b"hello\n");
                }
                Ok(())
            }
            Some(MessageType::ChannelOpenFailure) => {
                let failure = ChannelOpenFailure::from_bytes(payload)?;
                self.channels.remove(&failure.recipient_channel());
                Ok(())
            }
            Some(MessageType::ChannelWindowAdjust) => {
                let adjust = ChannelWindowAdjust::from_bytes(payload)?;
                if let Some(channel) = self.channels.get_mut(&adjust.recipient_channel()) {
                    channel.remote_window = channel.remote_window.saturating_add(adjust.bytes_to_add());
                }
                Ok(())
            }
            Some(MessageType::ChannelData) => {
                let data = ChannelData::from_bytes(payload)?;
                let id = data.recipient_channel();
                self.on_data(id, &data.into_data())
            }
            Some(MessageType::ChannelExtendedData) => {
                let data = ChannelExtendedData::from_bytes(payload)?;
                let id = data.recipient_channel();
                self.account(id, data.data().len() as u32)
            }
            Some(MessageType::ChannelEof) => {
                let id = ChannelEof::from_bytes(payload)?.recipient_channel();
                self.on_eof(id);
                Ok(())
            }
            Some(MessageType::ChannelClose) => {
                let id = ChannelClose::from_bytes(payload)?.recipient_channel();
                if let Some(channel) = self.channels.remove(&id) {
                    if !channel.close_sent {
                        if let Some(remote) = channel.remote {
                            self.send(&ChannelClose::new(remote).to_bytes())?;
                        }
                    }
                }
                Ok(())
            }
            Some(MessageType::ChannelRequest) => self.on_channel_request(payload),
            _ => Ok(()),
        }
    }

    // -- authentication ----------------------------------------------------

    fn methods(&self) -> Vec<String> {
        let mut methods = vec!["publickey".to_string(), "password".to_string()];
        if self.config.keyboard_interactive {
            methods.push("keyboard-interactive".to_string());
        }
        methods
    }

    fn send_banner(&mut self) -> SshResult<()> {
        if !self.banner_sent {
            self.banner_sent = true;
            if let Some(banner) = self.config.auth_banner.clone() {
                self.send(&AuthBanner::new(banner).to_bytes())?;
            }
        }
        Ok(())
    }

    fn reject(&mut self) -> SshResult<()> {
        let methods = self.methods();
        self.send(&AuthFailure::new(methods, false).to_bytes())
    }

    fn accept(&mut self) -> SshResult<()> {
        self.send(&AuthSuccess::new().to_bytes())?;
        self.transport.set_authenticated();
        self.authenticated = true;
        Ok(())
    }

    fn on_auth(&mut self, payload: &[u8]) -> SshResult<()> {
        self.send_banner()?;
        let request = AuthRequest::from_bytes(payload)?;
        let user = request.user_name().to_string();
        match request.method() {
            AuthMethod::None => self.reject(),
            AuthMethod::Password(password) => {
                let ok = self
                    .config
                    .passwords
                    .iter()
                    .any(|(u, p)| *u == user && p == password);
                if ok {
                    self.accept()
                } else {
                    self.reject()
                }
            }
            AuthMethod::KeyboardInteractive { .. } if self.config.keyboard_interactive => {
                self.kbd_user = Some(user);
                let info = InfoRequest {
                    name: "Login".to_string(),
                    instruction: "Answer the question".to_string(),
                    prompts: vec![Prompt {
                        text: "Password: ".to_string(),
                        echo: false,
                    }],
                };
                self.send(&info.to_bytes())
            }
            AuthMethod::KeyboardInteractive { .. } => self.reject(),
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                let Some(key) = self.acceptable_key(&user, public_key) else {
                    return self.reject();
                };
                match signature {
                    None => self.send(&AuthPkOk::new(algorithm.clone(), public_key.clone()).to_bytes()),
                    Some(signature) => {
                        let session_id = self.transport.session_id().unwrap_or_default().to_vec();
                        let data = construct_signature_data(
                            &session_id,
                            &user,
                            request.service_name(),
                            algorithm,
                            public_key,
                        );
                        if key.verify(&data, signature).unwrap_or(false) {
                            self.accept()
                        } else {
                            self.reject()
                        }
                    }
                }
            }
        }
    }

    /// Returns the key to verify signatures with if `blob` may log in.
    fn acceptable_key(
        &self,
        user: &str,
        blob: &[u8],
    ) -> Option<sshwire_proto::ssh::hostkey::PublicKey> {
        match PublicIdentity::from_blob(blob).ok()? {
            PublicIdentity::Key(key) => self
                .config
                .authorized_keys
                .iter()
                .any(|k| k == blob)
                .then_some(key),
            PublicIdentity::Certificate(cert) => {
                let trusted = self.config.user_ca.as_deref() == Some(&cert.signature_key[..])
                    && cert.verify_signature().unwrap_or(false)
                    && cert.allows_principal(user);
                trusted.then(|| cert.key.clone())
            }
        }
    }

    fn on_info_response(&mut self, payload: &[u8]) -> SshResult<()> {
        let response = InfoResponse::from_bytes(payload)?;
        let Some(user) = self.kbd_user.take() else {
            return self.reject();
        };
        let ok = response.responses.len() == 1
            && self
                .config
                .passwords
                .iter()
                .any(|(u, p)| *u == user && *p == response.responses[0]);
        if ok {
            self.accept()
        } else {
            self.reject()
        }
    }

    // -- global requests ---------------------------------------------------

    fn on_global_request(&mut self, payload: &[u8]) -> SshResult<()> {
        let request = GlobalRequest::from_bytes(payload)?;
        let reply = match request.request_type {
            GlobalRequestType::TcpipForward { address, port } if self.config.allow_forward => {
                let bound = if port == 0 {
                    self.next_port += 1;
                    self.next_port
                } else {
                    port
                };
                self.forwards.push((address, bound));
                let data = if port == 0 {
                    bound.to_be_bytes().to_vec()
                } else {
                    Vec::new()
                };
                RequestSuccess { data }.to_bytes()
            }
            GlobalRequestType::CancelTcpipForward { port, .. } => {
                let before = self.forwards.len();
                self.forwards.retain(|(_, p)| *p != port);
                if self.forwards.len() < before {
                    RequestSuccess::default().to_bytes()
                } else {
                    request_failure()
                }
            }
            // OpenSSH answers keep-alives with a failure
            _ => request_failure(),
        };
        if request.want_reply {
            self.send(&reply)?;
        }
        Ok(())
    }

    // -- channels ----------------------------------------------------------

    fn on_channel_open(&mut self, payload: &[u8]) -> SshResult<()> {
        let open = ChannelOpen::from_bytes(payload)?;
        let remote = open.sender_channel();
        let refuse = |reason, text: &str| ChannelOpenFailure::new(remote, reason, text).to_bytes();
        let mut channel = ServerChannel::new(
            Some(remote),
            open.initial_window_size(),
            open.maximum_packet_size(),
            false,
        );
        match open.channel_type() {
            ChannelType::Session => channel.session = true,
            ChannelType::DirectTcpip { host, .. } if host == "echo.local" => {
                channel.app = App::Echo;
            }
            ChannelType::DirectTcpip { host, .. } if host == "denied.local" => {
                return self.send(&refuse(
                    ChannelOpenFailureReason::AdministrativelyProhibited,
                    "open failed",
                ));
            }
            ChannelType::DirectTcpip { .. } => {
                return self.send(&refuse(ChannelOpenFailureReason::ConnectFailed, "connect failed"));
            }
            _ => {
                return self.send(&refuse(
                    ChannelOpenFailureReason::UnknownChannelType,
                    "unknown channel type",
                ))
            }
        }
        let id = self.next_id;
        self.next_id += 1;
        self.channels.insert(id, channel);
        let (window, max_packet) = (self.config.window, self.config.max_packet);
        self.send(&ChannelOpenConfirmation::new(remote, id, window, max_packet).to_bytes())
    }

    fn open_forwarded(&mut self, port: u32) -> SshResult<bool> {
        let Some((address, _)) = self.forwards.iter().find(|(_, p)| *p == port).cloned() else {
            return Ok(false);
        };
        let id = self.next_id;
        self.next_id += 1;
        let mut channel = ServerChannel::new(None, 0, 0, false);
        channel.app = App::Echo;
        self.channels.insert(id, channel);
        let open = ChannelOpen::new(
            ChannelType::ForwardedTcpip {
                connected_address: address,
                connected_port: port,
                originator_address: "127.0.0.1".to_string(),
                originator_port: 50000,
            },
            id,
            self.config.window,
            self.config.max_packet,
        );
        self.send(&open.to_bytes())?;
        Ok(true)
    }

    /// Counts consumed receive window and replenishes it.
    fn account(&mut self, id: u32, len: u32) -> SshResult<()> {
        let window = self.config.window;
        let delayed = self.config.adjust_delay.is_some();
        let Some(channel) = self.channels.get_mut(&id) else {
            return Ok(());
        };
        channel.consumed += len;
        // Delayed grants go out from `pump`
        if !delayed && channel.consumed >= window / 2 {
            let adjust = channel.consumed;
            channel.consumed = 0;
            if let Some(remote) = channel.remote {
                return self.send(&ChannelWindowAdjust::new(remote, adjust).to_bytes());
            }
        }
        Ok(())
    }

    fn on_data(&mut self, id: u32, data: &[u8]) -> SshResult<()> {
        self.account(id, data.len() as u32)?;
        let fs = self.fs.clone();
        let Some(channel) = self.channels.get_mut(&id) else {
            return Ok(());
        };
        let mut out = Output::default();
        match &mut channel.app {
            App::Cat(buf) => buf.extend_from_slice(data),
            App::Echo => out.stdout.extend_from_slice(data),
            App::Sftp(sftp) => out.stdout = sftp.input(data)?,
            App::Source(source) => source.input(&fs, data, &mut out),
            App::Sink(sink) => sink.input(&fs, data, &mut out),
            App::Idle => {}
        }
        channel.apply(out);
        Ok(())
    }

    fn on_eof(&mut self, id: u32) {
        let fs = self.fs.clone();
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        let mut out = Output::default();
        match &mut channel.app {
            App::Cat(buf) => {
                out.stdout = std::mem::take(buf);
                out.exit = Some(0);
            }
            App::Sink(sink) => sink.eof(&fs, &mut out),
            App::Echo | App::Sftp(_) | App::Idle => out.exit = Some(0),
            App::Source(_) => {}
        }
        channel.apply(out);
    }

    fn on_channel_request(&mut self, payload: &[u8]) -> SshResult<()> {
        let request = ChannelRequest::from_bytes(payload)?;
        let id = request.recipient_channel();
        let fs = self.fs.clone();
        let mut forward_port = None;
        let ok = match self.channels.get_mut(&id) {
            None => false,
            Some(channel) => match request.request_type() {
                ChannelRequestType::PtyReq { .. } | ChannelRequestType::WindowChange { .. } => true,
                ChannelRequestType::Env { name, value } => {
                    channel.env.insert(name.clone(), value.clone());
                    true
                }
                ChannelRequestType::Shell => {
                    channel.app = App::Echo;
                    true
                }
                ChannelRequestType::Subsystem { name } if name == "sftp" => {
                    channel.app = App::Sftp(Box::new(SftpServer::new(fs)));
                    true
                }
                ChannelRequestType::Subsystem { .. } => false,
                ChannelRequestType::Exec { command } => {
                    forward_port = exec(channel, &fs, command);
                    true
                }
                _ => false,
            },
        };

        if request.want_reply() {
            let remote = self
                .channels
                .get(&id)
                .and_then(|c| c.remote)
                .unwrap_or_default();
            let reply = if ok {
                ChannelSuccess::new(remote).to_bytes()
            } else {
                ChannelFailure::new(remote).to_bytes()
            };
            self.send(&reply)?;
        }

        if let Some(port) = forward_port {
            let opened = self.open_forwarded(port)?;
            if let Some(channel) = self.channels.get_mut(&id) {
                channel.finish(if opened { 0 } else { 1 });
            }
        }
        Ok(())
    }

    /// Sends queued output within the client's windows and finishes
    /// channels whose command completed.
    fn pump(&mut self) -> SshResult<()> {
        let mut packets = Vec::new();
        for channel in self.channels.values_mut() {
            let Some(remote) = channel.remote else {
                continue;
            };
            for stderr in [false, true] {
                loop {
                    let pending = if stderr {
                        &mut channel.stderr
                    } else {
                        &mut channel.stdout
                    };
                    if pending.is_empty() || channel.remote_window == 0 {
                        break;
                    }
                    let n = pending
                        .len()
                        .min(channel.remote_window as usize)
                        .min(channel.remote_max.max(1) as usize);
                    let chunk: Vec<u8> = pending.drain(..n).collect();
                    channel.remote_window -= n as u32;
                    packets.push(if stderr {
                        ChannelExtendedData::new(remote, 1, chunk).to_bytes()
                    } else {
                        ChannelData::new(remote, chunk).to_bytes()
                    });
                }
            }
            let drained = channel.stdout.is_empty() && channel.stderr.is_empty();
            if channel.finishing && drained && !channel.close_sent {
                if channel.session {
                    if let Some(signal) = channel.exit_signal.take() {
                        let request = ChannelRequestType::ExitSignal {
                            signal_name: signal,
                            core_dumped: false,
                            error_message: "killed".to_string(),
                            language_tag: String::new(),
                        };
                        packets.push(ChannelRequest::new(remote, request, false).to_bytes());
                    } else if let Some(code) = channel.exit_status {
                        let request = ChannelRequestType::ExitStatus { exit_status: code };
                        packets.push(ChannelRequest::new(remote, request, false).to_bytes());
                    }
                }
                packets.push(ChannelEof::new(remote).to_bytes());
                packets.push(ChannelClose::new(remote).to_bytes());
                channel.close_sent = true;
            }
        }
        for packet in packets {
            self.transport.send_payload(&packet)?;
        }
        self.transport.flush()?;

        let Some(delay) = self.config.adjust_delay else {
            return Ok(());
        };
        let mut grants = Vec::new();
        for channel in self.channels.values_mut() {
            if let (Some(remote), true) = (channel.remote, channel.consumed > 0) {
                grants.push(ChannelWindowAdjust::new(remote, channel.consumed).to_bytes());
                channel.consumed = 0;
            }
        }
        if grants.is_empty() {
            return Ok(());
        }
        thread::sleep(delay);
        for grant in grants {
            self.transport.send_payload(&grant)?;
        }
        self.transport.flush()
    }
}

/// Starts `command` on `channel`. Returns a port to open a forwarded
/// channel for.
fn exec(channel: &mut ServerChannel, fs: &MemFs, command: &str) -> Option<u32> {
    let words = shell_words(command);
    let arg = words.get(1).cloned().unwrap_or_default();
    let rest = command
        .split_once(' ')
        .map(|(_, rest)| rest.to_string())
        .unwrap_or_default();
    let mut out = Output::default();
    match words.first().map(String::as_str) {
        Some("echo") => {
            out.stdout = format!("{}\n", rest).into_bytes();
            out.exit = Some(0);
        }
        Some("cat") => channel.app = App::Cat(Vec::new()),
        Some("stderr") => {
            out.stderr = format!("{}\n", rest).into_bytes();
            out.exit = Some(1);
        }
        Some("exit") => out.exit = Some(arg.parse().unwrap_or(1)),
        Some("kill") => {
            channel.exit_signal = Some("TERM".to_string());
            out.exit = Some(0);
        }
        Some("printenv") => {
            let value = channel.env.get(&arg).cloned().unwrap_or_default();
            out.stdout = format!("{}\n", value).into_bytes();
            out.exit = Some(0);
        }
        Some("trigger-forward") => return arg.parse().ok(),
        Some("scp") => {
            let flags = arg.trim_start_matches('-');
            let path = words.get(2).cloned().unwrap_or_default();
            if flags.contains('f') {
                channel.app = App::Source(ScpSource {
                    path,
                    preserve: flags.contains('p'),
                    state: SourceState::WaitReady,
                });
            } else if flags.contains('t') {
                channel.app = App::Sink(ScpSink::start(fs, &path, &mut out));
            } else {
                out.stderr = b"usage: scp\n".to_vec();
                out.exit = Some(1);
            }
        }
        _ => {
            out.stderr = format!("{}: command not found\n", command).into_bytes();
            out.exit = Some(127);
        }
    }
    channel.apply(out);
    None
}

// ---------------------------------------------------------------------------
// ssh-agent
// ---------------------------------------------------------------------------

/// Serves agent requests on a Unix socket from `keys`, one connection at a
/// time.
#[cfg(unix)]
pub fn spawn_agent(path: &std::path::Path, keys: Vec<PrivateKey>) -> thread::JoinHandle<()> {
    use bytes::BufMut;
    use sshwire_proto::ssh::agent::{message, read_frame, write_frame};
    use sshwire_proto::ssh::hostkey::HostKeyAlgorithm;
    use sshwire_proto::ssh::wire::{read_bytes, read_u32, write_bytes, write_string};
    use std::os::unix::net::UnixListener;

    let listener = UnixListener::bind(path).unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            while let Ok(request) = read_frame(&mut stream) {
                let mut reply = BytesMut::new();
                match request[0] {
                    message::REQUEST_IDENTITIES => {
                        reply.put_u8(message::IDENTITIES_ANSWER);
                        reply.put_u32(keys.len() as u32);
                        for key in &keys {
                            write_bytes(&mut reply, &key.public_key_bytes());
                            write_string(&mut reply, key.key_type());
                        }
                    }
                    message::SIGN_REQUEST => {
                        let mut offset = 1;
                        let blob = read_bytes(&request, &mut offset).unwrap_or_default();
                        let data = read_bytes(&request, &mut offset).unwrap_or_default();
                        let flags = read_u32(&request, &mut offset).unwrap_or(0);
                        let signed = keys
                            .iter()
                            .find(|k| k.public_key_bytes() == blob)
                            .and_then(|key| {
                                let algorithm = if flags & message::FLAG_RSA_SHA2_512 != 0 {
                                    HostKeyAlgorithm::RsaSha2_512
                                } else if flags & message::FLAG_RSA_SHA2_256 != 0 {
                                    HostKeyAlgorithm::RsaSha2_256
                                } else {
                                    key.algorithm()
                                };
                                key.sign_as(algorithm, &data).ok()
                            });
                        match signed {
                            Some(signature) => {
                                reply.put_u8(message::SIGN_RESPONSE);
                                write_bytes(&mut reply, &signature);
                            }
                            None => reply.put_u8(message::FAILURE),
                        }
                    }
                    _ => reply.put_u8(message::FAILURE),
                }
                if write_frame(&mut stream, &reply).is_err() {
                    break;
                }
            }
        }
    })
}

/// Error kinds compared by discriminant, for `assert!(matches!(..))`
/// style checks that print the actual error.
pub fn assert_err<T: std::fmt::Debug>(result: SshResult<T>, expected: fn(&SshError) -> bool) {
    match result {
        Err(e) if expected(&e) => {}
        other => panic!("unexpected result: {:?}", other),
    }
}
