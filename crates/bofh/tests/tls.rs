//! HTTPS transport against a local rustls server.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bofh::transport::Transport;
use bofh::{
    xmlrpc, Bofh, BofhError, BofhResult, ConnectorConfig, HttpsTransport, Value,
    MAX_RESPONSE_BYTES,
};
use rustls::{ServerConfig, ServerConnection, StreamOwned};

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn server_config() -> Arc<ServerConfig> {
    let mut pem = BufReader::new(File::open(fixture("server.pem")).unwrap());
    let certs = rustls_pemfile::certs(&mut pem)
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let mut key = BufReader::new(File::open(fixture("server.key")).unwrap());
    let key = rustls_pemfile::private_key(&mut key).unwrap().unwrap();

    let config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .unwrap();
    Arc::new(config)
}

struct TestServer {
    port: u16,
    accepted: Arc<AtomicUsize>,
}

/// What the server does on one accepted connection.
#[derive(Clone)]
enum Behaviour {
    /// Answer every request with this XML-RPC body and keep the connection.
    Serve(String),
    /// Answer one request with `Connection: close`, then hang up.
    ServeOnce(String),
    /// Read the request and drop the connection without answering.
    Hangup,
    /// Write these bytes as the response, then hang up.
    Raw(String),
}

/// Connection `n` follows `plan[n]`; the last entry repeats.
fn spawn_server(plan: Vec<Behaviour>) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));
    let config = server_config();

    let counter = Arc::clone(&accepted);
    thread::spawn(move || {
        for sock in listener.incoming() {
            let Ok(sock) = sock else { break };
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let behaviour = plan[n.min(plan.len() - 1)].clone();
            let config = Arc::clone(&config);
            thread::spawn(move || serve(config, sock, behaviour));
        }
    });

    TestServer { port, accepted }
}

fn spawn_serving(reply: String) -> TestServer {
    spawn_server(vec![Behaviour::Serve(reply)])
}

fn pong() -> String {
    xmlrpc::encode_response(&Value::from("pong"))
}

fn http_ok(body: &str, close: bool) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/xml\r\nContent-Length: {}\r\n{}\r\n{}",
        body.len(),
        if close { "Connection: close\r\n" } else { "" },
        body
    )
}

/// Read one request. `false` once the peer is gone.
fn read_request(stream: &mut BufReader<StreamOwned<ServerConnection, TcpStream>>) -> bool {
    let mut content_length = 0;
    let mut line = String::new();
    loop {
        line.clear();
        match stream.read_line(&mut line) {
            Ok(0) | Err(_) => return false,
            Ok(_) => {}
        }
        if line == "\r\n" {
            break;
        }
        if let Some(v) = line.to_ascii_lowercase().strip_prefix("content-length:") {
            content_length = v.trim().parse().unwrap();
        }
    }

    let mut body = vec![0; content_length];
    stream.read_exact(&mut body).is_ok()
}

fn serve(config: Arc<ServerConfig>, sock: TcpStream, behaviour: Behaviour) {
    let conn = ServerConnection::new(config).unwrap();
    let mut stream = BufReader::new(StreamOwned::new(conn, sock));

    loop {
        if !read_request(&mut stream) {
            return;
        }
        let response = match &behaviour {
            Behaviour::Serve(reply) => http_ok(reply, false),
            Behaviour::ServeOnce(reply) => http_ok(reply, true),
            Behaviour::Hangup => return,
            Behaviour::Raw(raw) => raw.clone(),
        };

        let tls = stream.get_mut();
        if tls.write_all(response.as_bytes()).and_then(|()| tls.flush()).is_err() {
            return;
        }
        if !matches!(behaviour, Behaviour::Serve(_)) {
            tls.conn.send_close_notify();
            let _ = tls.conn.complete_io(&mut tls.sock);
            return;
        }
    }
}

fn trusting(validate_hostname: bool) -> ConnectorConfig {
    ConnectorConfig {
        ca_file: Some(fixture("ca.pem")),
        validate_hostname,
        ..ConnectorConfig::default()
    }
}

fn transport_to(host: &str, server: &TestServer, config: &ConnectorConfig) -> HttpsTransport {
    let url = format!("https://{host}:{}/RPC2", server.port);
    HttpsTransport::new(&url, config).unwrap()
}

// ==================== Certificate validation ====================

#[test]
fn test_hostname_mismatch_is_certificate_error() {
    let server = spawn_serving(pong());
    // The certificate is issued for "localhost" only.
    let mut transport = transport_to("127.0.0.1", &server, &trusting(true));

    let result = transport.call("ping", vec![]);
    assert!(matches!(result, Err(BofhError::CertificateError(_))), "{result:?}");
    assert_eq!(transport.open_channels(), 0);
}

#[test]
fn test_hostname_validation_can_be_disabled() {
    let server = spawn_serving(pong());
    let mut transport = transport_to("127.0.0.1", &server, &trusting(false));
    assert_eq!(transport.call("ping", vec![]).unwrap(), Value::from("pong"));
}

#[test]
fn test_matching_hostname_connects() {
    let server = spawn_serving(pong());
    let mut transport = transport_to("localhost", &server, &trusting(true));
    assert_eq!(transport.call("ping", vec![]).unwrap(), Value::from("pong"));
}

#[test]
fn test_untrusted_chain_rejected_even_without_hostname_check() {
    let server = spawn_serving(pong());
    let config = ConnectorConfig {
        ca_file: None,
        validate_hostname: false,
        ..ConnectorConfig::default()
    };
    let mut transport = transport_to("localhost", &server, &config);
    assert!(matches!(
        transport.call("ping", vec![]),
        Err(BofhError::CertificateError(_))
    ));
}

#[test]
fn test_closed_port_is_connection_error() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let config = ConnectorConfig {
        timeout: Duration::from_secs(2),
        ..trusting(false)
    };
    let mut transport =
        HttpsTransport::new(&format!("https://127.0.0.1:{port}/"), &config).unwrap();
    assert!(matches!(
        transport.call("ping", vec![]),
        Err(BofhError::ConnectionError(_))
    ));
    assert_eq!(transport.open_channels(), 0);
}

// ==================== Channel lifecycle ====================

#[test]
fn test_transport_reuses_channel() {
    let server = spawn_serving(pong());
    let mut transport = transport_to("localhost", &server, &trusting(true));

    for _ in 0..3 {
        assert_eq!(transport.call("ping", vec![]).unwrap(), Value::from("pong"));
    }
    assert_eq!(server.accepted.load(Ordering::SeqCst), 1);
    assert_eq!(transport.open_channels(), 1);

    transport.close();
    assert_eq!(transport.open_channels(), 0);
}

#[test]
fn test_failed_channel_is_evicted_and_replaced() {
    let server = spawn_server(vec![Behaviour::Hangup, Behaviour::Serve(pong())]);
    let mut transport = transport_to("localhost", &server, &trusting(true));

    assert!(matches!(
        transport.call("ping", vec![]),
        Err(BofhError::TransportFault(_))
    ));
    assert_eq!(transport.open_channels(), 0);

    assert_eq!(transport.call("ping", vec![]).unwrap(), Value::from("pong"));
    assert_eq!(server.accepted.load(Ordering::SeqCst), 2);
    assert_eq!(transport.open_channels(), 1);
}

#[test]
fn test_connection_close_evicts_channel() {
    let server = spawn_server(vec![Behaviour::ServeOnce(pong())]);
    let mut transport = transport_to("localhost", &server, &trusting(true));

    assert_eq!(transport.call("ping", vec![]).unwrap(), Value::from("pong"));
    assert_eq!(transport.open_channels(), 0);

    assert_eq!(transport.call("ping", vec![]).unwrap(), Value::from("pong"));
    assert_eq!(server.accepted.load(Ordering::SeqCst), 2);
}

// ==================== Malformed responses ====================

fn call_with_raw_response(raw: &str) -> (BofhResult<Value>, HttpsTransport) {
    let server = spawn_server(vec![Behaviour::Raw(raw.to_string())]);
    let mut transport = transport_to("localhost", &server, &trusting(true));
    let result = transport.call("ping", vec![]);
    (result, transport)
}

#[test]
fn test_http_error_status_is_transport_fault() {
    let (result, _) =
        call_with_raw_response("HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n");
    match result {
        Err(BofhError::TransportFault(message)) => assert!(message.contains("500"), "{message}"),
        other => panic!("expected a transport fault, got {other:?}"),
    }
}

#[test]
fn test_absurd_content_length_is_transport_fault() {
    let (result, transport) =
        call_with_raw_response("HTTP/1.1 200 OK\r\nContent-Length: 18446744073709551615\r\n\r\nx");
    assert!(matches!(result, Err(BofhError::TransportFault(_))), "{result:?}");
    assert_eq!(transport.open_channels(), 0);
}

#[test]
fn test_declared_body_over_limit_is_refused() {
    let raw = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n<methodResponse>",
        MAX_RESPONSE_BYTES + 1
    );
    let (result, transport) = call_with_raw_response(&raw);
    match result {
        Err(BofhError::TransportFault(message)) => {
            assert!(message.contains("too large"), "{message}")
        }
        other => panic!("expected a transport fault, got {other:?}"),
    }
    assert_eq!(transport.open_channels(), 0);
}

#[test]
fn test_overflowing_chunk_size_is_transport_fault() {
    let (result, _) = call_with_raw_response(
        "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n1\r\na\r\nffffffffffffffff\r\nbb",
    );
    assert!(matches!(result, Err(BofhError::TransportFault(_))), "{result:?}");
}

// ==================== XML-RPC over HTTPS ====================

#[test]
fn test_remote_fault_over_https() {
    let server = spawn_serving(xmlrpc::encode_fault(
        1,
        "Cerebrum.modules.bofhd.errors.CerebrumError:No such user",
    ));
    let mut transport = transport_to("localhost", &server, &trusting(true));

    match transport.call("run_command", vec![]) {
        Err(BofhError::RemoteFault { code, message }) => {
            assert_eq!(code, 1);
            assert!(message.ends_with("No such user"));
        }
        other => panic!("expected a remote fault, got {other:?}"),
    }
    // A fault is an application error, the channel stays usable.
    assert_eq!(transport.open_channels(), 1);
}

#[test]
fn test_session_login_over_https() {
    let server = spawn_serving(xmlrpc::encode_response(&Value::from("session-token")));
    let url = format!("https://localhost:{}/", server.port);
    let mut bofh = Bofh::connect(&url, &trusting(true)).unwrap();

    assert_eq!(bofh.login("bob", "secret").unwrap(), "session-token");
    assert_eq!(bofh.session_id(), Some("session-token"));
    bofh.logout().unwrap();
    assert!(!bofh.is_authenticated());
}

#[test]
fn test_plain_http_url_rejected() {
    let result = HttpsTransport::new("http://localhost:8000/", &ConnectorConfig::default());
    assert!(matches!(result, Err(BofhError::UnsupportedTransport(_))));
}
