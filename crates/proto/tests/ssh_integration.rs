//! End-to-end tests of the client session against the loopback server in
//! `common`.
//!
//! Each test starts its own server on an ephemeral port, so they run in
//! parallel without sharing state.

mod common;

use std::io::{Read, Seek, SeekFrom, Write};
use std::net::TcpListener;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use common::{key_path, key_text, ServerConfig, TestServer, HOME, PASSWORD, USER};
use sshwire_platform::{codes, SshError, SshResult};
use sshwire_proto::ssh::auth::Prompt;
use sshwire_proto::ssh::hostkey::HashType;
use sshwire_proto::ssh::kex::MethodType;
use sshwire_proto::ssh::session::{Channel, ExtendedData, HostKeyType, Session, SessionFlag};
use sshwire_proto::ssh::sftp::{FileAttributes, FileOpenFlags};

/// Reads a channel to EOF.
fn read_all(channel: &mut Channel) -> Vec<u8> {
    let mut out = Vec::new();
    channel.read_to_end(&mut out).unwrap();
    out
}

/// Runs `command` and returns stdout and the exit status.
fn run(session: &Session, command: &str) -> (String, i32) {
    let mut channel = session.channel_session().unwrap();
    channel.exec(command).unwrap();
    let output = read_all(&mut channel);
    channel.close().unwrap();
    channel.wait_closed().unwrap();
    (
        String::from_utf8(output).unwrap(),
        channel.exit_status().unwrap(),
    )
}

/// Retries a non-blocking operation until it stops returning `WouldBlock`.
fn retry<T>(session: &Session, op: impl FnMut() -> SshResult<T>) -> SshResult<T> {
    retry_counted(session, &mut 0, op)
}

/// Like [`retry`], adding the number of `WouldBlock` returns to `blocked`.
fn retry_counted<T>(
    session: &Session,
    blocked: &mut usize,
    mut op: impl FnMut() -> SshResult<T>,
) -> SshResult<T> {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        match op() {
            Err(SshError::WouldBlock) => {
                *blocked += 1;
                assert!(Instant::now() < deadline, "operation stalled");
                session.wait_socket(Some(Duration::from_secs(1)))?;
            }
            other => return other,
        }
    }
}

// ---------------------------------------------------------------------------
// Handshake and host key
// ---------------------------------------------------------------------------

#[test]
fn test_handshake_reports_host_key() {
    let server = TestServer::start();
    let session = server.session();
    session.handshake().unwrap();

    let (blob, key_type) = session.hostkey().unwrap();
    assert_eq!(blob, server.host_key_blob());
    assert_eq!(key_type, HostKeyType::Ed25519);
    assert_eq!(session.hostkey_hash(HashType::Sha256).unwrap().len(), 32);
    assert_eq!(session.hostkey_hash(HashType::Sha1).unwrap().len(), 20);
    assert_eq!(session.hostkey_hash(HashType::Md5).unwrap().len(), 16);
    assert!(session.banner_get().unwrap().starts_with("SSH-2.0-"));
    assert_eq!(session.kex_count(), 1);
    assert!(session.methods(MethodType::Kex).is_some());
}

#[test]
fn test_hostkey_verifier_rejects() {
    let server = TestServer::start();
    let session = server.session();
    session.set_hostkey_verifier(|_| false);
    assert!(matches!(session.handshake(), Err(SshError::HostKeyInit(_))));
}

#[test]
fn test_hostkey_verifier_sees_server_key() {
    let server = TestServer::start();
    let expected = server.host_key_blob();
    let session = server.session();
    session.set_hostkey_verifier(move |blob| blob == expected.as_slice());
    session.handshake().unwrap();
}

#[test]
fn test_invalid_local_banner() {
    let server = TestServer::start();
    let session = server.session();
    session.banner_set("not-ssh");
    assert!(matches!(session.handshake(), Err(SshError::Protocol(_))));
}

#[test]
fn test_peer_closes_before_banner() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        drop(stream);
    });

    let session = Session::new();
    session.set_tcp_stream(std::net::TcpStream::connect(addr).unwrap());
    let err = session.handshake().unwrap_err();
    assert!(err.is_fatal(), "{:?}", err);
    assert_eq!(session.last_error().0, err.code());
}

#[test]
fn test_handshake_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let hold = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        thread::sleep(Duration::from_secs(2));
        drop(stream);
    });

    let session = Session::new();
    session.set_tcp_stream(std::net::TcpStream::connect(addr).unwrap());
    session.set_timeout(200);
    assert!(matches!(session.handshake(), Err(SshError::Timeout)));
    hold.join().unwrap();
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

#[test]
fn test_userauth_list() {
    let server = TestServer::start();
    let session = server.session();
    session.handshake().unwrap();
    let methods = session.userauth_list(USER).unwrap();
    assert_eq!(methods, "publickey,password,keyboard-interactive");
    assert!(!session.userauth_authenticated());
}

#[test]
fn test_password_failure_then_success() {
    let server = TestServer::start();
    let session = server.session();
    session.handshake().unwrap();

    match session.userauth_password(USER, "wrong") {
        Err(SshError::Authentication { methods, .. }) => {
            assert!(methods.iter().any(|m| m == "password"));
        }
        other => panic!("expected authentication failure, got {:?}", other),
    }
    assert_eq!(session.last_error().0, codes::AUTHENTICATION_FAILED);
    assert!(!session.userauth_authenticated());

    session.userauth_password(USER, PASSWORD).unwrap();
    assert!(session.userauth_authenticated());
}

#[test]
fn test_keyboard_interactive() {
    let server = TestServer::start();
    let session = server.session();
    session.handshake().unwrap();

    let mut seen = Vec::new();
    let mut answer = |_name: &str, _instruction: &str, prompts: &[Prompt]| {
        seen.extend(prompts.iter().map(|p| p.text.clone()));
        vec![PASSWORD.to_string(); prompts.len()]
    };
    session.userauth_keyboard_interactive(USER, &mut answer).unwrap();
    assert!(session.userauth_authenticated());
    assert_eq!(seen, vec!["Password: ".to_string()]);
}

#[test]
fn test_keyboard_interactive_wrong_answer() {
    let server = TestServer::start();
    let session = server.session();
    session.handshake().unwrap();

    let mut answer = |_: &str, _: &str, prompts: &[Prompt]| vec!["nope".to_string(); prompts.len()];
    assert!(matches!(
        session.userauth_keyboard_interactive(USER, &mut answer),
        Err(SshError::Authentication { .. })
    ));
}

#[test]
fn test_auth_banner() {
    let server = TestServer::start_with(ServerConfig {
        auth_banner: Some("Authorized use only\n".to_string()),
        ..ServerConfig::default()
    });
    let session = server.authenticated();
    assert_eq!(
        session.userauth_banner().as_deref(),
        Some("Authorized use only\n")
    );
}

#[test]
fn test_pubkey_file_keys() {
    let server = TestServer::start();
    let cases: &[(&str, Option<&str>)] = &[
        ("id_ed25519", None),
        ("id_ed25519_enc", Some("secret")),
        ("id_ecdsa", Some("")),
        ("id_ecdsa_pem", None),
        ("id_ecdsa384_cbc", Some("secret")),
        ("id_ecdsa521_pkcs8", None),
        ("id_rsa", None),
        ("id_rsa_pem", None),
    ];
    for (name, passphrase) in cases {
        let session = server.session();
        session.handshake().unwrap();
        session
            .userauth_pubkey_file(USER, None, &key_path(name), *passphrase)
            .unwrap_or_else(|e| panic!("{}: {:?}", name, e));
        assert!(session.userauth_authenticated(), "{}", name);
    }
}

#[test]
fn test_ecdsa_key_then_exec() {
    let server = TestServer::start();
    let session = server.session();
    session.handshake().unwrap();
    session
        .userauth_pubkey_file(USER, None, &key_path("id_ecdsa"), Some(""))
        .unwrap();
    let (output, status) = run(&session, "echo me");
    assert_eq!(output, "me\n");
    assert_eq!(status, 0);
}

#[test]
fn test_pubkey_wrong_passphrase() {
    let server = TestServer::start();
    let session = server.session();
    session.handshake().unwrap();
    let result = session.userauth_pubkey_file(USER, None, &key_path("id_ed25519_enc"), Some("bad"));
    assert!(matches!(result, Err(SshError::KeyFile(_))));
}

#[test]
fn test_pubkey_missing_file() {
    let server = TestServer::start();
    let session = server.session();
    session.handshake().unwrap();
    let result = session.userauth_pubkey_file(USER, None, Path::new("/nonexistent/key"), None);
    assert!(matches!(result, Err(SshError::KeyFile(_))));
    assert_eq!(session.last_error().0, codes::FILE);
}

#[test]
fn test_pubkey_memory_bad_key_then_password() {
    let server = TestServer::start();
    let session = server.session();
    session.handshake().unwrap();
    let result = session.userauth_pubkey_memory(USER, None, "not a private key", None);
    assert!(matches!(result, Err(SshError::KeyFile(_))));
    assert_eq!(session.last_error().0, codes::FILE);

    session.userauth_password(USER, PASSWORD).unwrap();
    assert!(session.userauth_authenticated());
}

#[test]
fn test_pubkey_not_authorized() {
    let server = TestServer::start_with(ServerConfig {
        authorized_keys: Vec::new(),
        ..ServerConfig::default()
    });
    let session = server.session();
    session.handshake().unwrap();
    let result = session.userauth_pubkey_file(USER, None, &key_path("id_ed25519"), None);
    assert!(matches!(result, Err(SshError::Authentication { .. })));

    // The session stays usable after a rejection
    session.userauth_password(USER, PASSWORD).unwrap();
}

#[test]
fn test_pubkey_memory() {
    let server = TestServer::start();
    let session = server.session();
    session.handshake().unwrap();
    session
        .userauth_pubkey_memory(
            USER,
            Some(&key_text("id_ed25519.pub")),
            &key_text("id_ed25519"),
            None,
        )
        .unwrap();
    assert!(session.userauth_authenticated());
}

#[test]
fn test_pubkey_memory_mismatched_public_key() {
    let server = TestServer::start();
    let session = server.session();
    session.handshake().unwrap();
    let result = session.userauth_pubkey_memory(
        USER,
        Some(&key_text("id_rsa.pub")),
        &key_text("id_ed25519"),
        None,
    );
    assert!(matches!(result, Err(SshError::KeyFile(_))));
}

#[test]
fn test_certificate_auth() {
    // Only the CA is trusted, so the bare key would be refused
    let server = TestServer::start_with(ServerConfig {
        authorized_keys: Vec::new(),
        ..ServerConfig::default()
    });
    let session = server.session();
    session.handshake().unwrap();
    session
        .userauth_pubkey_file(
            USER,
            Some(&key_path("id_ed25519-cert.pub")),
            &key_path("id_ed25519"),
            None,
        )
        .unwrap();
    assert!(session.userauth_authenticated());
}

#[test]
fn test_certificate_wrong_principal() {
    let server = TestServer::start_with(ServerConfig {
        authorized_keys: Vec::new(),
        passwords: vec![("other".to_string(), "pw".to_string())],
        ..ServerConfig::default()
    });
    let session = server.session();
    session.handshake().unwrap();
    let result = session.userauth_pubkey_file(
        "other",
        Some(&key_path("id_ed25519-cert.pub")),
        &key_path("id_ed25519"),
        None,
    );
    assert!(matches!(result, Err(SshError::Authentication { .. })));
}

#[cfg(unix)]
#[test]
fn test_agent_auth() {
    use sshwire_proto::ssh::agent::AUTH_SOCK_ENV;
    use sshwire_proto::ssh::privatekey::PrivateKey;

    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("agent.sock");
    let keys = vec![
        PrivateKey::from_file(key_path("ca_ed25519"), None).unwrap(),
        PrivateKey::from_file(key_path("id_ed25519"), None).unwrap(),
    ];
    let _agent = common::spawn_agent(&socket, keys);
    std::env::set_var(AUTH_SOCK_ENV, &socket);

    let server = TestServer::start();
    let session = server.session();
    session.handshake().unwrap();
    // The CA key is not authorized; the agent falls through to the next
    session.userauth_agent(USER).unwrap();
    assert!(session.userauth_authenticated());
}

#[test]
fn test_operations_before_auth() {
    let server = TestServer::start();
    let session = server.session();
    session.handshake().unwrap();
    assert!(matches!(
        session.channel_session(),
        Err(SshError::InvalidRequest(_))
    ));
    assert!(matches!(session.sftp(), Err(SshError::InvalidRequest(_))));
    assert_eq!(session.last_error().0, codes::INVAL);
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

#[test]
fn test_exec_exit_status() {
    let server = TestServer::start();
    let session = server.authenticated();

    assert_eq!(run(&session, "echo hello world"), ("hello world\n".to_string(), 0));
    assert_eq!(run(&session, "exit 3").1, 3);
    assert_eq!(run(&session, "no-such-command").1, 127);
}

#[test]
fn test_stderr_stream() {
    let server = TestServer::start();
    let session = server.authenticated();

    let mut channel = session.channel_session().unwrap();
    channel.exec("stderr oops").unwrap();
    let stdout = read_all(&mut channel);
    let mut stderr = [0u8; 64];
    let n = channel.read_stderr(&mut stderr).unwrap();
    assert!(stdout.is_empty());
    assert_eq!(&stderr[..n], b"oops\n");
    channel.wait_closed().unwrap();
    assert_eq!(channel.exit_status().unwrap(), 1);
}

#[test]
fn test_stderr_merged() {
    let server = TestServer::start();
    let session = server.authenticated();

    let mut channel = session.channel_session().unwrap();
    channel.handle_extended_data(ExtendedData::Merge).unwrap();
    channel.exec("stderr merged").unwrap();
    assert_eq!(read_all(&mut channel), b"merged\n");
}

#[test]
fn test_exit_signal() {
    let server = TestServer::start();
    let session = server.authenticated();

    let mut channel = session.channel_session().unwrap();
    channel.exec("kill").unwrap();
    read_all(&mut channel);
    channel.wait_closed().unwrap();
    let signal = channel.exit_signal().unwrap();
    assert_eq!(signal.signal_name.as_deref(), Some("TERM"));
    assert_eq!(signal.error_message.as_deref(), Some("killed"));
}

#[test]
fn test_wait_closed_after_remote_close() {
    let server = TestServer::start();
    let session = server.authenticated();

    let mut channel = session.channel_session().unwrap();
    channel.exec("exit 5").unwrap();
    assert!(read_all(&mut channel).is_empty());
    channel.wait_closed().unwrap();
    assert_eq!(channel.exit_status().unwrap(), 5);
    // Already closed by both sides
    channel.close().unwrap();
    channel.wait_closed().unwrap();
}

#[test]
fn test_setenv() {
    let server = TestServer::start();
    let session = server.authenticated();

    let mut channel = session.channel_session().unwrap();
    channel.setenv("GREETING", "hi there").unwrap();
    channel.exec("printenv GREETING").unwrap();
    assert_eq!(read_all(&mut channel), b"hi there\n");
}

#[test]
fn test_pty_shell_echo() {
    let server = TestServer::start();
    let session = server.authenticated();

    let mut channel = session.channel_session().unwrap();
    channel.request_pty("xterm", None, Some((80, 24, 0, 0))).unwrap();
    channel.shell().unwrap();
    channel.write_all(b"ping\n").unwrap();

    let mut buf = [0u8; 5];
    channel.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping\n");
    channel.request_pty_size(120, 40, None, None).unwrap();
    channel.send_eof().unwrap();
    channel.wait_eof().unwrap();
    assert!(channel.eof());
}

#[test]
fn test_cat_roundtrip_larger_than_window() {
    let server = TestServer::start();
    let session = server.authenticated();

    // Three times the default window in both directions
    let data: Vec<u8> = (0..6 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
    let mut channel = session.channel_session().unwrap();
    channel.exec("cat").unwrap();
    let initial = channel.window_write().unwrap();
    assert_eq!(initial.window_size_initial, 2 * 1024 * 1024);

    channel.write_all(&data).unwrap();
    channel.send_eof().unwrap();
    let echoed = read_all(&mut channel);
    assert_eq!(echoed.len(), data.len());
    assert!(echoed == data);

    let window = channel.window_read().unwrap();
    assert_eq!(window.available, 0);
    assert!(window.remaining > 0);
}

#[test]
fn test_write_larger_than_peer_max_packet() {
    let server = TestServer::start_with(ServerConfig {
        max_packet: 256 * 1024,
        ..ServerConfig::default()
    });
    let session = server.authenticated();

    let data: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();
    let mut channel = session.channel_session().unwrap();
    channel.exec("cat").unwrap();
    let first = channel.write(&data).unwrap();
    assert!(first > 0 && first <= 32 * 1024, "wrote {}", first);
    channel.write_all(&data[first..]).unwrap();
    channel.send_eof().unwrap();
    assert!(read_all(&mut channel) == data);
    assert_eq!(run(&session, "echo still up").0, "still up\n");
}

#[test]
fn test_write_after_eof_fails() {
    let server = TestServer::start();
    let session = server.authenticated();

    let mut channel = session.channel_session().unwrap();
    channel.exec("cat").unwrap();
    channel.send_eof().unwrap();
    assert!(matches!(channel.write(b"late"), Err(SshError::ChannelEof)));
}

#[test]
fn test_many_channels() {
    let server = TestServer::start();
    let session = server.authenticated();

    let mut channels: Vec<Channel> = (0..8)
        .map(|i| {
            let mut channel = session.channel_session().unwrap();
            channel.exec(&format!("echo {}", i)).unwrap();
            channel
        })
        .collect();
    for (i, channel) in channels.iter_mut().enumerate().rev() {
        assert_eq!(read_all(channel), format!("{}\n", i).into_bytes());
    }
}

#[test]
fn test_direct_tcpip() {
    let server = TestServer::start();
    let session = server.authenticated();

    let mut channel = session
        .channel_direct_tcpip("echo.local", 7, Some(("10.0.0.1", 5555)))
        .unwrap();
    channel.write_all(b"tunnelled").unwrap();
    let mut buf = [0u8; 9];
    channel.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"tunnelled");

    assert!(matches!(
        session.channel_direct_tcpip("denied.local", 80, None),
        Err(SshError::RequestDenied(_))
    ));
    assert!(matches!(
        session.channel_direct_tcpip("unreachable.local", 80, None),
        Err(SshError::ChannelFailure(_))
    ));
    assert_eq!(session.last_error().0, codes::CHANNEL_FAILURE);
}

#[test]
fn test_remote_forward_accept() {
    let server = TestServer::start();
    let session = server.authenticated();

    let (mut listener, port) = session.channel_forward_listen(0, None, None).unwrap();
    assert!(port > 0);
    assert_eq!(listener.port(), port);

    let (_, status) = run(&session, &format!("trigger-forward {}", port));
    assert_eq!(status, 0);

    let mut forwarded = listener.accept().unwrap();
    let mut hello = [0u8; 6];
    forwarded.read_exact(&mut hello).unwrap();
    assert_eq!(&hello, b"hello\n");
    forwarded.write_all(b"back").unwrap();
    let mut back = [0u8; 4];
    forwarded.read_exact(&mut back).unwrap();
    assert_eq!(&back, b"back");

    session.channel_forward_cancel(listener).unwrap();
}

#[test]
fn test_remote_forward_denied() {
    let server = TestServer::start_with(ServerConfig {
        allow_forward: false,
        ..ServerConfig::default()
    });
    let session = server.authenticated();
    assert!(matches!(
        session.channel_forward_listen(8080, Some("127.0.0.1"), Some(4)),
        Err(SshError::RequestDenied(_))
    ));
    assert_eq!(session.last_error().0, codes::REQUEST_DENIED);

    // The connection survives the refusal
    assert_eq!(run(&session, "echo still here").0, "still here\n");
}

// ---------------------------------------------------------------------------
// Session options
// ---------------------------------------------------------------------------

#[test]
fn test_keepalive() {
    let server = TestServer::start();
    let session = server.authenticated();

    assert_eq!(session.keepalive_send().unwrap(), 0);
    session.keepalive_config(true, 1);
    let next = session.keepalive_send().unwrap();
    assert!(next >= 1 && next <= 2, "next keep-alive in {}", next);

    // The REQUEST_FAILURE reply is absorbed by the next read
    assert_eq!(run(&session, "echo alive").0, "alive\n");
}

#[test]
fn test_compression() {
    let server = TestServer::start();
    let session = server.session();
    session.flag(SessionFlag::Compress, true);
    session.handshake().unwrap();
    assert_eq!(
        session.methods(MethodType::CompCs).as_deref(),
        Some("zlib@openssh.com")
    );
    session.userauth_password(USER, PASSWORD).unwrap();

    let data = "compressible text ".repeat(20_000).into_bytes();
    let mut channel = session.channel_session().unwrap();
    channel.exec("cat").unwrap();
    channel.write_all(&data).unwrap();
    channel.send_eof().unwrap();
    assert!(read_all(&mut channel) == data);
}

#[test]
fn test_method_pref() {
    let server = TestServer::start();
    let session = server.session();
    session
        .method_pref(MethodType::CryptCs, "aes128-ctr")
        .unwrap();
    assert!(session
        .method_pref(MethodType::CryptCs, "no-such-cipher")
        .is_err());
    session.handshake().unwrap();
    assert_eq!(session.methods(MethodType::CryptCs).as_deref(), Some("aes128-ctr"));
    assert!(session
        .supported_algs(MethodType::CryptCs)
        .contains(&"aes128-ctr"));
}

#[test]
fn test_rekey_by_bytes() {
    let server = TestServer::start();
    let session = server.session();
    session.set_rekey_limits(64 * 1024, Duration::from_secs(3600));
    session.handshake().unwrap();
    session.userauth_password(USER, PASSWORD).unwrap();

    let data = vec![0x5au8; 512 * 1024];
    let mut channel = session.channel_session().unwrap();
    channel.exec("cat").unwrap();
    channel.write_all(&data).unwrap();
    channel.send_eof().unwrap();
    assert!(read_all(&mut channel) == data);
    assert!(session.kex_count() >= 2, "kex count {}", session.kex_count());
}

#[test]
fn test_disconnect() {
    let server = TestServer::start();
    let session = server.authenticated();
    session.disconnect("done").unwrap();
    let err = session.channel_session().unwrap_err();
    assert!(err.is_fatal() || matches!(err, SshError::InvalidRequest(_)), "{:?}", err);
}

#[test]
fn test_non_blocking_session() {
    let server = TestServer::start();
    let session = server.session();
    session.set_blocking(false);
    assert!(!session.is_blocking());

    retry(&session, || session.handshake()).unwrap();
    retry(&session, || session.userauth_password(USER, PASSWORD)).unwrap();
    let mut channel = retry(&session, || session.channel_session()).unwrap();
    retry(&session, || channel.exec("echo async")).unwrap();

    let mut output = Vec::new();
    let mut buf = [0u8; 64];
    loop {
        let n = retry(&session, || channel.read(&mut buf)).unwrap();
        if n == 0 {
            break;
        }
        output.extend_from_slice(&buf[..n]);
    }
    assert_eq!(output, b"async\n");
    retry(&session, || channel.close()).unwrap();
    retry(&session, || channel.wait_closed()).unwrap();
    assert_eq!(channel.exit_status().unwrap(), 0);
}

#[test]
fn test_non_blocking_read_would_block() {
    let server = TestServer::start();
    let session = server.authenticated();

    let mut channel = session.channel_session().unwrap();
    channel.exec("cat").unwrap();
    session.set_blocking(false);
    let mut buf = [0u8; 16];
    assert!(matches!(channel.read(&mut buf), Err(SshError::WouldBlock)));
    assert_eq!(session.last_error().0, codes::EAGAIN);
    assert!(session.block_directions().inbound());
}

// ---------------------------------------------------------------------------
// SCP
// ---------------------------------------------------------------------------

/// A server granting one byte of window at a time, late, so that every
/// acknowledgment the client writes has to wait for window.
fn tight_window_server(window: u32) -> TestServer {
    TestServer::start_with(ServerConfig {
        window,
        adjust_delay: Some(Duration::from_millis(50)),
        ..ServerConfig::default()
    })
}

#[test]
fn test_non_blocking_scp_recv2_waits_for_window() {
    let server = tight_window_server(1);
    server.fs().put_file("/tmp/slow.txt", b"one byte at a time", 0o600);
    let session = server.authenticated();
    session.set_blocking(false);

    let mut blocked = 0;
    let (mut channel, info) =
        retry_counted(&session, &mut blocked, || session.scp_recv2("/tmp/slow.txt")).unwrap();
    assert_eq!(info.size, 18);
    assert_eq!(info.mode, 0o600);

    let mut data = Vec::new();
    let mut buf = [0u8; 8];
    loop {
        let n = retry_counted(&session, &mut blocked, || channel.read(&mut buf)).unwrap();
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
    }
    assert_eq!(data, b"one byte at a time");
    assert!(blocked > 0);

    // The server exits only after the closing ack
    retry(&session, || channel.wait_closed()).unwrap();
    assert_eq!(channel.exit_status().unwrap(), 0);
}

#[test]
fn test_scp_send_and_recv() {
    let server = TestServer::start();
    let session = server.authenticated();

    let mut channel = session.scp_send("/tmp/upload.txt", 0o640, 4).unwrap();
    channel.write_all(b"data").unwrap();
    channel.send_eof().unwrap();
    channel.wait_eof().unwrap();
    channel.close().unwrap();
    channel.wait_closed().unwrap();
    drop(channel);
    assert_eq!(server.fs().file("/tmp/upload.txt").unwrap(), b"data");

    let (mut channel, size) = session.scp_recv("/tmp/upload.txt").unwrap();
    assert_eq!(size, 4);
    assert_eq!(read_all(&mut channel), b"data");
}

#[test]
fn test_scp_send64_sets_times_and_quotes_path() {
    let server = TestServer::start();
    let session = server.authenticated();

    let path = "/tmp/it's here.bin";
    let mut channel = session
        .scp_send64(path, 0o600, 3, 1_700_000_000, 1_600_000_000)
        .unwrap();
    channel.write_all(b"xyz").unwrap();
    channel.send_eof().unwrap();
    channel.wait_eof().unwrap();
    drop(channel);

    match server.fs().get(path).unwrap() {
        common::Node::File {
            data,
            mode,
            mtime,
            atime,
        } => {
            assert_eq!(data, b"xyz");
            assert_eq!(mode, 0o600);
            assert_eq!(mtime, 1_700_000_000);
            assert_eq!(atime, 1_600_000_000);
        }
        other => panic!("unexpected node {:?}", other),
    }
}

#[test]
fn test_scp_recv2_reports_metadata() {
    let server = TestServer::start();
    server.fs().put_file("/tmp/report.txt", b"quarterly", 0o604);
    let session = server.authenticated();

    let (mut channel, info) = session.scp_recv2("/tmp/report.txt").unwrap();
    assert_eq!(info.size, 9);
    assert_eq!(info.mode, 0o604);
    assert_eq!(info.name, "report.txt");
    assert_eq!(read_all(&mut channel), b"quarterly");
}

#[test]
fn test_scp_recv_missing_file() {
    let server = TestServer::start();
    let session = server.authenticated();

    match session.scp_recv2("/tmp/missing") {
        Err(SshError::Scp(message)) => assert!(message.contains("No such file")),
        other => panic!("expected scp error, got {:?}", other),
    }
    assert_eq!(session.last_error().0, codes::SCP_PROTOCOL);
}

#[test]
fn test_scp_send_to_missing_directory() {
    let server = TestServer::start();
    let session = server.authenticated();
    assert!(matches!(
        session.scp_send("/nowhere/file", 0o644, 1),
        Err(SshError::Scp(_))
    ));
}

// ---------------------------------------------------------------------------
// SFTP
// ---------------------------------------------------------------------------

#[test]
fn test_sftp_file_roundtrip() {
    let server = TestServer::start();
    let session = server.authenticated();
    let sftp = session.sftp().unwrap();

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 256) as u8).collect();
    let mut file = sftp.create("/tmp/blob").unwrap();
    file.write_all(&payload).unwrap();
    assert_eq!(file.tell(), payload.len() as u64);
    file.close().unwrap();
    assert!(server.fs().file("/tmp/blob").unwrap() == payload);

    let mut file = sftp.open("/tmp/blob").unwrap();
    let mut read_back = Vec::new();
    file.read_to_end(&mut read_back).unwrap();
    assert!(read_back == payload);

    file.seek(10);
    let mut ten = [0u8; 10];
    file.read_exact(&mut ten).unwrap();
    assert_eq!(ten[0], 10);
    assert_eq!(
        Seek::seek(&mut file, SeekFrom::End(-1)).unwrap(),
        payload.len() as u64 - 1
    );
    assert_eq!(Seek::seek(&mut file, SeekFrom::Current(-9)).unwrap(), payload.len() as u64 - 10);
    assert_eq!(file.fstat().unwrap().size, Some(payload.len() as u64));
}

#[test]
fn test_sftp_metadata_operations() {
    let server = TestServer::start();
    server.fs().put_file("/tmp/a.txt", b"alpha", 0o644);
    let session = server.authenticated();
    let sftp = session.sftp().unwrap();

    let attrs = sftp.stat("/tmp/a.txt").unwrap();
    assert!(attrs.is_file());
    assert_eq!(attrs.size, Some(5));

    sftp.setstat("/tmp/a.txt", &FileAttributes::with_permissions(0o600))
        .unwrap();
    let mode = sftp.stat("/tmp/a.txt").unwrap().permissions.unwrap();
    assert_eq!(mode.permissions(), 0o600);

    sftp.rename("/tmp/a.txt", "/tmp/b.txt").unwrap();
    assert!(server.fs().file("/tmp/a.txt").is_none());
    assert_eq!(server.fs().file("/tmp/b.txt").unwrap(), b"alpha");

    sftp.symlink("/tmp/b.txt", "/tmp/link").unwrap();
    assert_eq!(sftp.readlink("/tmp/link").unwrap(), "/tmp/b.txt");
    assert!(sftp.lstat("/tmp/link").unwrap().permissions.is_some());
    assert!(!sftp.lstat("/tmp/link").unwrap().is_file());
    assert!(sftp.stat("/tmp/link").unwrap().is_file());

    sftp.unlink("/tmp/link").unwrap();
    sftp.unlink("/tmp/b.txt").unwrap();
    assert!(server.fs().get("/tmp/b.txt").is_none());

    assert_eq!(sftp.realpath(".").unwrap(), HOME);
    assert_eq!(sftp.realpath("../tester/./x").unwrap(), format!("{}/x", HOME));
}

#[test]
fn test_sftp_directories() {
    let server = TestServer::start();
    let session = server.authenticated();
    let sftp = session.sftp().unwrap();

    sftp.mkdir("/tmp/dir", 0o750).unwrap();
    assert!(sftp.stat("/tmp/dir").unwrap().is_dir());
    server.fs().put_file("/tmp/dir/one", b"1", 0o644);
    server.fs().put_file("/tmp/dir/two", b"22", 0o644);

    let mut names: Vec<String> = sftp
        .readdir("/tmp/dir")
        .unwrap()
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["one".to_string(), "two".to_string()]);

    let mut handle = sftp.opendir("/tmp/dir").unwrap();
    let mut count = 0;
    while let Some((name, attrs)) = handle.readdir().unwrap() {
        if name == "two" {
            assert_eq!(attrs.size, Some(2));
        }
        count += 1;
    }
    // Handle-level listing keeps "." and ".."
    assert_eq!(count, 4);
    handle.close().unwrap();

    // Not empty
    assert!(matches!(sftp.rmdir("/tmp/dir"), Err(SshError::Sftp { .. })));
    sftp.unlink("/tmp/dir/one").unwrap();
    sftp.unlink("/tmp/dir/two").unwrap();
    sftp.rmdir("/tmp/dir").unwrap();
}

#[test]
fn test_sftp_errors() {
    let server = TestServer::start();
    let session = server.authenticated();
    let sftp = session.sftp().unwrap();

    match sftp.open("/tmp/absent") {
        Err(SshError::Sftp { code, message }) => {
            assert_eq!(code, 2);
            assert!(!message.is_empty());
        }
        other => panic!("expected SFTP status, got {:?}", other.map(|_| ())),
    }
    assert_eq!(sftp.last_error(), 2);
    assert_eq!(session.last_error().0, codes::SFTP_PROTOCOL);

    // Opening read-only then writing is refused by the server
    server.fs().put_file("/tmp/ro", b"r", 0o644);
    let mut file = sftp
        .open_mode("/tmp/ro", FileOpenFlags::READ, 0)
        .unwrap();
    assert!(matches!(file.write(b"x"), Err(SshError::Sftp { code: 3, .. })));
    assert_eq!(sftp.last_error(), 3);

    // A failed request does not disturb later ones
    assert!(sftp.stat("/tmp/ro").is_ok());
    assert_eq!(sftp.last_error(), 0);
}

#[test]
fn test_non_blocking_sftp_with_partial_writes() {
    let server = tight_window_server(4096);
    let session = server.authenticated();
    session.set_blocking(false);

    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 241) as u8).collect();
    let mut blocked = 0;
    let sftp = retry(&session, || session.sftp()).unwrap();
    let mut file = retry(&session, || sftp.create("/tmp/partial")).unwrap();
    let mut written = 0;
    while written < payload.len() {
        written += retry_counted(&session, &mut blocked, || file.write(&payload[written..])).unwrap();
    }
    retry(&session, || file.close()).unwrap();
    assert!(blocked > 0, "requests never outgrew the window");
    assert!(server.fs().file("/tmp/partial").unwrap() == payload);

    let mut file = retry(&session, || sftp.open("/tmp/partial")).unwrap();
    let mut read_back = Vec::new();
    let mut buf = vec![0u8; 8192];
    loop {
        let n = retry(&session, || file.read(&mut buf)).unwrap();
        if n == 0 {
            break;
        }
        read_back.extend_from_slice(&buf[..n]);
    }
    assert!(read_back == payload);
    retry(&session, || file.close()).unwrap();
}

#[test]
fn test_sftp_append_and_exclusive_create() {
    let server = TestServer::start();
    server.fs().put_file("/tmp/log", b"one\n", 0o644);
    let session = server.authenticated();
    let sftp = session.sftp().unwrap();

    let mut file = sftp
        .open_mode("/tmp/log", FileOpenFlags::WRITE | FileOpenFlags::APPEND, 0)
        .unwrap();
    file.write_all(b"two\n").unwrap();
    file.close().unwrap();
    assert_eq!(server.fs().file("/tmp/log").unwrap(), b"one\ntwo\n");

    let exclusive = FileOpenFlags::WRITE | FileOpenFlags::CREAT | FileOpenFlags::EXCL;
    assert!(sftp.open_mode("/tmp/log", exclusive, 0o644).is_err());
    let mut fresh = sftp.open_mode("/tmp/new", exclusive, 0o600).unwrap();
    fresh.close().unwrap();
    match server.fs().get("/tmp/new").unwrap() {
        common::Node::File { mode, .. } => assert_eq!(mode, 0o600),
        other => panic!("unexpected node {:?}", other),
    }
}

#[test]
fn test_sftp_alongside_exec() {
    let server = TestServer::start();
    let session = server.authenticated();
    let sftp = session.sftp().unwrap();
    server.fs().put_file("/tmp/shared", b"x", 0o644);

    assert_eq!(run(&session, "echo between").0, "between\n");
    assert_eq!(sftp.stat("/tmp/shared").unwrap().size, Some(1));
}

// ---------------------------------------------------------------------------
// Async driver
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_async_session_exec() {
    use sshwire_proto::ssh::AsyncSession;

    let server = TestServer::start();
    let ssh = AsyncSession::connect(server.addr()).await.unwrap();
    ssh.handshake().await.unwrap();
    ssh.userauth_pubkey_memory(USER, &key_text("id_ed25519"), None)
        .await
        .unwrap();

    let (output, status) = ssh.exec("echo from tokio").await.unwrap();
    assert_eq!(output, b"from tokio\n");
    assert_eq!(status, 0);

    let mut channel = ssh.channel_session().await.unwrap();
    ssh.drive(|| channel.exec("cat")).await.unwrap();
    ssh.write_all(&mut channel, b"async cat").await.unwrap();
    ssh.drive(|| channel.send_eof()).await.unwrap();
    let mut echoed = Vec::new();
    let mut buf = [0u8; 32];
    loop {
        let n = ssh.read(&mut channel, &mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        echoed.extend_from_slice(&buf[..n]);
    }
    assert_eq!(echoed, b"async cat");

    ssh.disconnect("bye").await.unwrap();
}

#[tokio::test]
async fn test_async_session_timeout() {
    use sshwire_proto::ssh::AsyncSession;

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let hold = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        thread::sleep(Duration::from_secs(1));
        drop(stream);
    });

    let ssh = AsyncSession::connect(addr).await.unwrap();
    ssh.session().set_timeout(100);
    assert!(matches!(ssh.handshake().await, Err(SshError::Timeout)));
    hold.join().unwrap();
}
