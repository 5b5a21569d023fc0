use std::io::{self, Read, Write};
use std::net::{Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{error, info};
use nanoid::nanoid;
use openssl::ssl::{SslAcceptor, SslStream};
use openssl::x509::X509VerifyResult;
use socket2::{Domain, Protocol, Socket, Type};

use crate::gemini::response::Body;
use crate::gemini::tls::{self, TlsContext};
use crate::gemini::{Client, Error, Response, ResponseCode, Result, Uri};
use crate::time::now_unix_millis;

/// Default Gemini port.
pub const DEFAULT_GEMINI_PORT: u16 = 1965;

/// Default cap on concurrently served connections.
pub const DEFAULT_MAX_PARALLEL_CONNECTIONS: usize = 256;

// A request line is at most 1024 bytes of URI plus the CRLF terminator.
const MAX_REQUEST_BYTES: usize = 1026;

// The framed response header (code, space, meta, CRLF) must fit in this.
const MAX_HEADER_BYTES: usize = 1024;

// Largest slice handed to a single TLS write.
const MAX_WRITE_CHUNK: usize = i32::MAX as usize;

// Fill size for streamed bodies.
const STREAM_BUFFER_BYTES: usize = 4096;

// Receive timeout on the listening socket, so the accept loop gets a chance
// to observe the shutdown flag.
const ACCEPT_TIMEOUT: Duration = Duration::from_micros(100);

// Sampling interval for the connected-client count.
const CLIENT_COUNT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// The request handler a host application plugs into the server.
///
/// `respond` is called once per successfully parsed request, from the
/// connection's own thread. Whatever it returns is framed and written back
/// to the client. Calling [`Server::shutdown`] from inside `respond`
/// deadlocks.
pub trait Handler: Send + Sync {
    fn respond(&self, uri: &Uri, client: &Client) -> Response;
}

impl<F> Handler for F
where
    F: Fn(&Uri, &Client) -> Response + Send + Sync,
{
    fn respond(&self, uri: &Uri, client: &Client) -> Response {
        self(uri, client)
    }
}

/// A Gemini server: a TLS listener plus a [`Handler`].
///
/// Construct it, point it at a certificate and private key, then call
/// [`accept_clients`] to serve. [`shutdown`] stops the accept loop and
/// drains in-flight connections.
///
/// [`accept_clients`]: Server::accept_clients
/// [`shutdown`]: Server::shutdown
pub struct Server {
    bind_address: SocketAddr,
    bind_any: bool,
    tls: Mutex<TlsContext>,
    handler: Arc<dyn Handler>,
    connected_clients: Arc<Mutex<usize>>,
    shutting_down: AtomicBool,
    server_running: AtomicBool,
}

impl Server {
    /// Create a server bound to the given host and port.
    ///
    /// `ip_hostname` is resolved immediately; `None` binds a dual-stack
    /// socket on every interface.
    pub fn new<H: Handler + 'static>(
        ip_hostname: Option<&str>,
        port: u16,
        handler: H,
    ) -> Result<Server> {
        let (bind_address, bind_any) = match ip_hostname {
            Some(host) => {
                let mut addresses = (host, port)
                    .to_socket_addrs()
                    .map_err(|_| Error::Resolve(format!("{}:{}", host, port)))?;
                let address = addresses
                    .next()
                    .ok_or_else(|| Error::Resolve(format!("{}:{}", host, port)))?;
                (address, false)
            }
            None => (SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)), true),
        };
        Ok(Server {
            bind_address,
            bind_any,
            tls: Mutex::new(TlsContext::new()?),
            handler: Arc::new(handler),
            connected_clients: Arc::new(Mutex::new(0)),
            shutting_down: AtomicBool::new(false),
            server_running: AtomicBool::new(false),
        })
    }

    /// Set the TLS certificate chain file (PEM format). Legal only before
    /// [`accept_clients`](Server::accept_clients) has been called.
    pub fn use_certificate_file(&self, path: impl AsRef<Path>) -> Result<()> {
        if self.server_running.load(Ordering::SeqCst) {
            return Err(Error::BadState);
        }
        self.tls.lock().unwrap().use_certificate_file(path.as_ref())
    }

    /// Set the TLS private key file (PEM format). Legal only before
    /// [`accept_clients`](Server::accept_clients) has been called.
    pub fn use_private_key_file(&self, path: impl AsRef<Path>) -> Result<()> {
        if self.server_running.load(Ordering::SeqCst) {
            return Err(Error::BadState);
        }
        self.tls.lock().unwrap().use_private_key_file(path.as_ref())
    }

    /// Accept and serve clients until [`shutdown`](Server::shutdown) is
    /// called. Blocks; returns once the accept loop has exited and every
    /// in-flight connection has finished.
    ///
    /// Each connection is served on its own thread, at most
    /// `maximum_parallel_connections` at a time; once the cap is reached the
    /// accept loop waits for a slot instead of queueing without bound. A cap
    /// of 0 serves connections one at a time on the calling thread.
    pub fn accept_clients(&self, maximum_parallel_connections: usize) -> Result<()> {
        if self.server_running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }
        self.shutting_down.store(false, Ordering::SeqCst);
        let result = self.run_accept_loop(maximum_parallel_connections);
        self.server_running.store(false, Ordering::SeqCst);
        result
    }

    /// Stop accepting clients and block until every connection still being
    /// served has finished. Safe to call from any thread, but calling it
    /// from inside [`Handler::respond`] deadlocks.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        while self.connected_count() > 0 {
            thread::sleep(CLIENT_COUNT_POLL_INTERVAL);
        }
    }

    fn run_accept_loop(&self, maximum_parallel_connections: usize) -> Result<()> {
        let acceptor = self.tls.lock().unwrap().acceptor()?;
        let listener = self.create_listener()?;
        info!("Gemini server listening to {}", self.bind_address);

        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                break;
            }

            // Hold off accepting while the parallelism cap is reached.
            if maximum_parallel_connections > 0
                && self.connected_count() >= maximum_parallel_connections
            {
                thread::sleep(CLIENT_COUNT_POLL_INTERVAL);
                continue;
            }

            let (stream, peer_address) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    // Receive timeout; go check the shutdown flag.
                    continue;
                }
                Err(e) => {
                    error!("Failed to accept connection: {:?}", e);
                    continue;
                }
            };

            let guard = self.connect_client();
            let acceptor = acceptor.clone();
            let handler = Arc::clone(&self.handler);
            if maximum_parallel_connections == 0 {
                serve_client(acceptor, stream, peer_address, handler, guard);
            } else {
                thread::spawn(move || serve_client(acceptor, stream, peer_address, handler, guard));
            }
        }

        // The listener is gone; wait for the workers to drain.
        while self.connected_count() > 0 {
            thread::sleep(CLIENT_COUNT_POLL_INTERVAL);
        }
        Ok(())
    }

    fn create_listener(&self) -> Result<TcpListener> {
        let socket = Socket::new(
            Domain::for_address(self.bind_address),
            Type::STREAM,
            Some(Protocol::TCP),
        )
        .map_err(Error::Bind)?;

        // Serve both IPv4 and IPv6 when bound to the wildcard address.
        if self.bind_any {
            socket.set_only_v6(false).map_err(Error::Bind)?;
        }
        // Allow rebinding right after a restart.
        socket.set_reuse_address(true).map_err(Error::Bind)?;
        // Bound the accept call so the loop can notice a shutdown request.
        socket
            .set_read_timeout(Some(ACCEPT_TIMEOUT))
            .map_err(Error::Bind)?;

        socket.bind(&self.bind_address.into()).map_err(Error::Bind)?;
        socket.listen(0).map_err(Error::Listen)?;
        Ok(socket.into())
    }

    fn connect_client(&self) -> ConnectedGuard {
        *self.connected_clients.lock().unwrap() += 1;
        ConnectedGuard {
            connected_clients: Arc::clone(&self.connected_clients),
        }
    }

    fn connected_count(&self) -> usize {
        *self.connected_clients.lock().unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// Decrements the connected-client count when the connection is torn down,
// whichever way the worker exits.
struct ConnectedGuard {
    connected_clients: Arc<Mutex<usize>>,
}

impl Drop for ConnectedGuard {
    fn drop(&mut self) {
        *self.connected_clients.lock().unwrap() -= 1;
    }
}

fn serve_client(
    acceptor: SslAcceptor,
    stream: TcpStream,
    peer_address: SocketAddr,
    handler: Arc<dyn Handler>,
    // Held for the whole connection; its drop decrements the client count.
    _guard: ConnectedGuard,
) {
    let id = nanoid!();
    let ip = peer_address.ip();
    let started = now_unix_millis();

    let mut stream = match acceptor.accept(stream) {
        Ok(stream) => stream,
        Err(e) => {
            error!("{} {} Failed to establish TLS session: {:?}", id, ip, e);
            return;
        }
    };

    let certificate = stream
        .ssl()
        .peer_certificate()
        .and_then(|cert| cert.to_der().ok());
    let certificate_verified =
        certificate.is_some() && stream.ssl().verify_result() == X509VerifyResult::OK;
    let client = Client::new(Some(peer_address), certificate, certificate_verified);

    if let Err(e) = handle_connection(&mut stream, &client, handler.as_ref(), &id) {
        error!("{} {} Connection handling error: {:?}", id, ip, e);
    }

    let _ = stream.shutdown();
    info!("{} {} Finished ({}ms)", id, ip, now_unix_millis() - started);
}

fn handle_connection(
    stream: &mut SslStream<TcpStream>,
    client: &Client,
    handler: &dyn Handler,
    id: &str,
) -> Result<()> {
    let ip = client.ip_address()?;
    let response = match read_request(stream) {
        Ok(uri) => {
            info!(
                "{} {} New request from {}{} {}",
                id,
                ip,
                ip,
                match tls::peer_certificate_digest(stream) {
                    Some(digest) => format!(" TLS digest {}", digest),
                    None => String::new(),
                },
                uri
            );
            handler.respond(&uri, client)
        }
        Err(e) => {
            // A malformed or unreadable request; answer 59 if the stream is
            // still usable.
            info!("{} {} Rejecting request: {}", id, ip, e);
            Response::new(ResponseCode::BadRequest, "invalid uri")
        }
    };

    let code = response.code();
    write_response(stream, response)?;
    info!("{} {} Reply code {}", id, ip, code.value());
    Ok(())
}

/// Read the request line: up to 1024 bytes of URI plus CRLF. Anything the
/// client sends after the terminator is never read.
fn read_request(stream: &mut SslStream<TcpStream>) -> Result<Uri> {
    let mut buffer = [0u8; MAX_REQUEST_BYTES];
    let mut filled = 0;

    loop {
        if filled == buffer.len() {
            return Err(Error::InvalidUri("request line too long".to_string()));
        }
        let read = stream.read(&mut buffer[filled..]).map_err(Error::Read)?;
        if read == 0 {
            return Err(Error::Read(io::ErrorKind::UnexpectedEof.into()));
        }
        filled += read;
        if filled > 2 && buffer[filled - 2..filled] == *b"\r\n" {
            break;
        }
    }

    let line = std::str::from_utf8(&buffer[..filled - 2])
        .map_err(|_| Error::InvalidUri("request is not valid UTF-8".to_string()))?;
    let uri = Uri::new(line)?;

    // Only accept gemini requests.
    if uri.scheme() != "gemini" {
        return Err(Error::InvalidUri(format!(
            "scheme {} is not gemini",
            uri.scheme()
        )));
    }
    Ok(uri)
}

/// Frame and send a response. A response that would violate the protocol is
/// a bug in the handler; it is never put on the wire and the process is
/// terminated instead.
fn write_response(stream: &mut SslStream<TcpStream>, response: Response) -> Result<()> {
    let (code, meta, body) = response.into_parts();

    if body.is_some() && !code.is_success() {
        error!("Tried to send a non-successful response with a body");
        process::abort();
    }
    if meta.is_empty() {
        error!("Tried to send a response without meta");
        process::abort();
    }
    let header = format!("{} {}\r\n", code.value(), meta);
    if header.len() > MAX_HEADER_BYTES {
        error!(
            "Response code and meta line is too long ({} / {} bytes)",
            header.len(),
            MAX_HEADER_BYTES
        );
        process::abort();
    }

    stream.write_all(header.as_bytes()).map_err(Error::Write)?;

    match body {
        None => {}
        Some(Body::Bytes(bytes)) => {
            for chunk in bytes.chunks(MAX_WRITE_CHUNK) {
                stream.write_all(chunk).map_err(Error::Write)?;
            }
        }
        Some(Body::Stream(mut reader)) => {
            let mut buffer = [0u8; STREAM_BUFFER_BYTES];
            loop {
                let read = reader.read(&mut buffer).map_err(Error::Read)?;
                if read == 0 {
                    break;
                }
                stream.write_all(&buffer[..read]).map_err(Error::Write)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{Handler, Server, DEFAULT_GEMINI_PORT};
    use crate::gemini::{Client, Error, Response, ResponseCode, Uri};

    fn refuse(_: &Uri, _: &Client) -> Response {
        Response::new(ResponseCode::ProxyRequestRefused, "no")
    }

    #[test]
    fn resolves_bind_address_at_construction() {
        let server = Server::new(Some("127.0.0.1"), DEFAULT_GEMINI_PORT, refuse).unwrap();
        drop(server);

        let result = Server::new(Some("host.invalid"), DEFAULT_GEMINI_PORT, refuse);
        assert!(matches!(result, Err(Error::Resolve(_))));
    }

    #[test]
    fn closures_are_handlers() {
        let handler = |_: &Uri, _: &Client| Response::new(ResponseCode::NotFound, "not found");
        let uri = Uri::new("gemini://localhost/").unwrap();
        let client = Client::new(None, None, false);
        let response = handler.respond(&uri, &client);
        assert_eq!(response.code(), ResponseCode::NotFound);
    }
}
