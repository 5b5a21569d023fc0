//! End-to-end tests: a real server on an ephemeral port, spoken to over TLS
//! with a throwaway self-signed certificate.

use std::env;
use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use nanoid::nanoid;
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use openssl::x509::{X509NameBuilder, X509};

use gemini_serv::gemini::{Client, Error, Handler, Response, ResponseCode, Server, Uri};

fn self_signed_certificate(common_name: &str) -> (X509, PKey<Private>) {
    let rsa = Rsa::generate(2048).unwrap();
    let key = PKey::from_rsa(rsa).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, common_name).unwrap();
    let name = name.build();

    let mut serial = BigNum::new().unwrap();
    serial.rand(159, MsbOption::MAYBE_ZERO, false).unwrap();
    let serial = serial.to_asn1_integer().unwrap();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(1).unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    (builder.build(), key)
}

fn write_certificate_files(cert: &X509, key: &PKey<Private>) -> (PathBuf, PathBuf) {
    let dir = env::temp_dir().join(format!("gemini-serv-test-{}", nanoid!()));
    fs::create_dir_all(&dir).unwrap();
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    fs::write(&cert_path, cert.to_pem().unwrap()).unwrap();
    fs::write(&key_path, key.private_key_to_pem_pkcs8().unwrap()).unwrap();
    (cert_path, key_path)
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

type AcceptHandle = thread::JoinHandle<Result<(), Error>>;

fn start_server<H>(
    handler: H,
    maximum_parallel_connections: usize,
) -> (Arc<Server>, u16, AcceptHandle)
where
    H: Handler + 'static,
{
    let (cert, key) = self_signed_certificate("localhost");
    let (cert_path, key_path) = write_certificate_files(&cert, &key);

    let port = free_port();
    let server = Server::new(Some("127.0.0.1"), port, handler).unwrap();
    server.use_certificate_file(&cert_path).unwrap();
    server.use_private_key_file(&key_path).unwrap();

    let server = Arc::new(server);
    let accepting = Arc::clone(&server);
    let handle = thread::spawn(move || accepting.accept_clients(maximum_parallel_connections));
    (server, port, handle)
}

fn connect_with_retry(port: u16) -> TcpStream {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)) {
            return stream;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("server never started listening on port {}", port);
}

fn plain_connector() -> SslConnector {
    let mut builder = SslConnector::builder(SslMethod::tls()).unwrap();
    builder.set_verify(SslVerifyMode::NONE);
    builder.build()
}

fn request_with_connector(port: u16, request: &[u8], connector: &SslConnector) -> Vec<u8> {
    let tcp = connect_with_retry(port);
    let mut config = connector.configure().unwrap();
    config.set_verify_hostname(false);
    let mut stream = config.connect("localhost", tcp).unwrap();
    stream.write_all(request).unwrap();
    let mut response = Vec::new();
    // The server closes the connection after the response; tolerate an
    // abrupt close too.
    let _ = stream.read_to_end(&mut response);
    response
}

fn request(port: u16, request_line: &[u8]) -> Vec<u8> {
    request_with_connector(port, request_line, &plain_connector())
}

#[test]
fn serves_a_success_response() {
    let handler =
        |_: &Uri, _: &Client| Response::with_text(ResponseCode::Success, "text/gemini", "hello");
    let (server, port, handle) = start_server(handler, 16);

    let response = request(port, b"gemini://localhost/\r\n");
    assert_eq!(response, b"20 text/gemini\r\nhello");

    server.shutdown();
    handle.join().unwrap().unwrap();
}

#[test]
fn rejects_an_oversized_request_line() {
    let handler = |_: &Uri, _: &Client| panic!("handler must not run for malformed requests");
    let (server, port, handle) = start_server(handler, 16);

    // 1026 bytes with no terminator in sight.
    let junk = vec![b'a'; 1026];
    let response = request(port, &junk);
    assert_eq!(response, b"59 invalid uri\r\n");

    server.shutdown();
    handle.join().unwrap().unwrap();
}

#[test]
fn rejects_non_gemini_schemes() {
    let handler = |_: &Uri, _: &Client| panic!("handler must not run for non-gemini requests");
    let (server, port, handle) = start_server(handler, 16);

    let response = request(port, b"http://localhost/\r\n");
    assert_eq!(response, b"59 invalid uri\r\n");

    server.shutdown();
    handle.join().unwrap().unwrap();
}

#[test]
fn rejects_malformed_uris() {
    let handler = |_: &Uri, _: &Client| panic!("handler must not run for malformed requests");
    let (server, port, handle) = start_server(handler, 16);

    let response = request(port, b"gemini://localhost::1965\r\n");
    assert_eq!(response, b"59 invalid uri\r\n");

    server.shutdown();
    handle.join().unwrap().unwrap();
}

#[test]
fn serves_concurrent_clients() {
    let handler = |uri: &Uri, _: &Client| {
        Response::with_text(ResponseCode::Success, "text/gemini", &uri.path())
    };
    let (server, port, handle) = start_server(handler, 16);

    let clients: Vec<_> = ["/first", "/second"]
        .into_iter()
        .map(|path| {
            thread::spawn(move || {
                let line = format!("gemini://localhost{}\r\n", path);
                (path, request(port, line.as_bytes()))
            })
        })
        .collect();

    for client in clients {
        let (path, response) = client.join().unwrap();
        let expected = format!("20 text/gemini\r\n{}", path);
        assert_eq!(response, expected.as_bytes());
    }

    server.shutdown();
    handle.join().unwrap().unwrap();
}

#[test]
fn shutdown_waits_for_inflight_connections() {
    let finished = Arc::new(AtomicBool::new(false));
    let handler_finished = Arc::clone(&finished);
    let handler = move |_: &Uri, _: &Client| {
        thread::sleep(Duration::from_millis(300));
        handler_finished.store(true, Ordering::SeqCst);
        Response::with_text(ResponseCode::Success, "text/gemini", "slow")
    };
    let (server, port, handle) = start_server(handler, 16);

    let client = thread::spawn(move || request(port, b"gemini://localhost/\r\n"));
    // Give the client time to get past accept and into the handler.
    thread::sleep(Duration::from_millis(100));

    assert!(matches!(
        server.accept_clients(16),
        Err(Error::AlreadyRunning)
    ));

    server.shutdown();
    assert!(
        finished.load(Ordering::SeqCst),
        "shutdown returned before the in-flight connection finished"
    );
    handle.join().unwrap().unwrap();

    assert_eq!(client.join().unwrap(), b"20 text/gemini\r\nslow");
}

#[test]
fn serves_inline_when_cap_is_zero() {
    let handler =
        |_: &Uri, _: &Client| Response::with_text(ResponseCode::Success, "text/gemini", "serial");
    let (server, port, handle) = start_server(handler, 0);

    assert_eq!(request(port, b"gemini://localhost/\r\n"), b"20 text/gemini\r\nserial");
    assert_eq!(request(port, b"gemini://localhost/\r\n"), b"20 text/gemini\r\nserial");

    server.shutdown();
    handle.join().unwrap().unwrap();
}

#[test]
fn streams_response_bodies() {
    let handler = |_: &Uri, _: &Client| {
        let body: &[u8] = b"line one\nline two\n";
        Response::with_stream(ResponseCode::Success, "text/gemini", body)
    };
    let (server, port, handle) = start_server(handler, 16);

    let response = request(port, b"gemini://localhost/\r\n");
    assert_eq!(response, b"20 text/gemini\r\nline one\nline two\n");

    server.shutdown();
    handle.join().unwrap().unwrap();
}

#[test]
fn surfaces_the_client_certificate() {
    let seen = Arc::new(Mutex::new(None));
    let handler_seen = Arc::clone(&seen);
    let handler = move |_: &Uri, client: &Client| {
        *handler_seen.lock().unwrap() = Some((
            client.certificate().map(|der| der.to_vec()),
            client.certificate_verified(),
        ));
        Response::new(ResponseCode::NotFound, "not found")
    };
    let (server, port, handle) = start_server(handler, 16);

    // Anonymous client: no certificate surfaces.
    request(port, b"gemini://localhost/\r\n");
    assert_eq!(seen.lock().unwrap().take(), Some((None, false)));

    // Client with a self-signed identity certificate.
    let (client_cert, client_key) = self_signed_certificate("a-gemini-user");
    let mut builder = SslConnector::builder(SslMethod::tls()).unwrap();
    builder.set_verify(SslVerifyMode::NONE);
    builder.set_certificate(&client_cert).unwrap();
    builder.set_private_key(&client_key).unwrap();
    request_with_connector(port, b"gemini://localhost/\r\n", &builder.build());

    let expected_der = client_cert.to_der().unwrap();
    assert_eq!(seen.lock().unwrap().take(), Some((Some(expected_der), true)));

    server.shutdown();
    handle.join().unwrap().unwrap();
}
