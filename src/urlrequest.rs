//! Outbound HTTP request pipe, cleartext only.
//!
//! A [`UrlRequest`] joins a chain as the stage that carries a request out
//! of the process: it connects to the target without blocking, writes the
//! request (body taken from its input channel), and streams the raw
//! response onto its output channel until the peer closes. TLS is the
//! business of an embedding transport; the [`UrlRequestConfig`] carries
//! the certificate bundle path such a transport would need.
//!
//! Chains holding one of these should be added with
//! [`Pump::add_request_chain`](crate::pump::Pump::add_request_chain): the
//! [`UrlRequestAbort`] handle may be flipped from any thread and the pump
//! then retires the chain on its next tick.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, warn};

use crate::buffer::{BufferPtr, Channels};
use crate::error::{Error, Result};
use crate::pipe::{IoPipe, Status};
use crate::pump::{Events, PollCond, PumpContext};
use crate::sd::Sd;
use crate::socket::{Socket, SocketKind, SocketPtr, PORT_EPHEMERAL};

const DEFAULT_HTTP_PORT: u16 = 80;
const READ_BUFFER_SIZE: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestAction {
    Get,
    Put,
    Post,
    Delete,
}

impl RequestAction {
    fn verb(self) -> &'static str {
        match self {
            RequestAction::Get => "GET",
            RequestAction::Put => "PUT",
            RequestAction::Post => "POST",
            RequestAction::Delete => "DELETE",
        }
    }
}

/// Embedder supplied configuration for outbound requests.
#[derive(Clone, Debug, Default)]
pub struct UrlRequestConfig {
    /// Certificate bundle for TLS transports layered over this pipe;
    /// unused for cleartext requests.
    pub ca_info: Option<String>,
}

/// Cancellation handle for an in-flight request. Clone it anywhere,
/// flipping it makes the owning chain invalid.
#[derive(Clone, Default)]
pub struct UrlRequestAbort(Arc<AtomicBool>);

impl UrlRequestAbort {
    pub fn abort(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

enum RequestState {
    Initialized,
    Connecting,
    WritingRequest,
    WaitingForResponse,
}

/// One outbound cleartext HTTP request as a pipe.
pub struct UrlRequest {
    action: RequestAction,
    host: String,
    port: u16,
    path: String,
    headers: Vec<(String, String)>,
    #[allow(dead_code)]
    config: UrlRequestConfig,
    abort: UrlRequestAbort,
    state: RequestState,
    socket: Option<SocketPtr>,
    outgoing: Vec<u8>,
    sent: usize,
}

impl UrlRequest {
    /// Build a request for `url`, which must be `http://host[:port]/path`.
    pub fn new(action: RequestAction, url: &str, config: UrlRequestConfig) -> Result<UrlRequest> {
        let (host, port, path) = parse_url(url)?;
        Ok(UrlRequest {
            action,
            host,
            port,
            path,
            headers: Vec::new(),
            config,
            abort: UrlRequestAbort::default(),
            state: RequestState::Initialized,
            socket: None,
            outgoing: Vec::new(),
            sent: 0,
        })
    }

    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    /// Handle for cancelling this request from anywhere.
    pub fn abort_handle(&self) -> UrlRequestAbort {
        self.abort.clone()
    }

    fn resolve(&self) -> Result<SocketAddr> {
        let candidates = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| Error::ResolveAddress(self.host.clone()))?;
        candidates
            .filter(SocketAddr::is_ipv4)
            .next()
            .ok_or_else(|| Error::ResolveAddress(self.host.clone()))
    }

    /// Assemble the request head and move the body off the input channel.
    fn build_outgoing(&mut self, channels: Channels, buffer: &BufferPtr) {
        let data = buffer.borrow();
        let body_len = data.count(channels.input());

        let mut head = format!("{} {} HTTP/1.0\r\n", self.action.verb(), self.path);
        head.push_str(&format!("Host: {}\r\n", self.host));
        for (name, value) in &self.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        if body_len > 0 {
            head.push_str(&format!("Content-Length: {}\r\n", body_len));
        }
        head.push_str("\r\n");

        self.outgoing = head.into_bytes();
        if body_len > 0 {
            let start = self.outgoing.len();
            self.outgoing.resize(start + body_len, 0);
            data.read_after(channels.input(), None, &mut self.outgoing[start..]);
        }
    }
}

impl IoPipe for UrlRequest {
    fn process(
        &mut self,
        channels: Channels,
        buffer: &BufferPtr,
        eos: &mut bool,
        _context: &mut Sd,
        pump: &mut PumpContext<'_>,
    ) -> Status {
        if let RequestState::Initialized = self.state {
            let addr = match self.resolve() {
                Ok(addr) => addr,
                Err(err) => {
                    warn!("failed to resolve {}: {}", self.host, err);
                    return Status::NoConnection;
                }
            };
            let socket = match Socket::create(SocketKind::StreamTcp, PORT_EPHEMERAL) {
                Ok(socket) => socket,
                Err(err) => {
                    warn!("failed to create request socket: {}", err);
                    return Status::Error;
                }
            };
            debug!("connecting to {}", addr);
            if let Err(err) = socket.start_connect(addr) {
                warn!("connect to {} failed: {}", addr, err);
                return Status::NoConnection;
            }
            pump.set_conditional(Some(PollCond {
                fd: socket.fd(),
                events: Events::OUT,
            }));
            self.socket = Some(socket);
            self.state = RequestState::Connecting;
            return Status::Ok;
        }

        let socket = match &self.socket {
            Some(socket) => socket.clone(),
            None => return Status::PreconditionNotMet,
        };

        if let RequestState::Connecting = self.state {
            if let Err(err) = socket.take_socket_error() {
                warn!("connect to {}:{} failed: {}", self.host, self.port, err);
                return Status::NoConnection;
            }
            self.build_outgoing(channels, buffer);
            self.sent = 0;
            self.state = RequestState::WritingRequest;
        }

        if let RequestState::WritingRequest = self.state {
            while self.sent < self.outgoing.len() {
                match socket.send(&self.outgoing[self.sent..]) {
                    Ok(0) => break,
                    Ok(n) => self.sent += n,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        return Status::Ok;
                    }
                    Err(err) => {
                        warn!("request write error: {}", err);
                        return Status::LostConnection;
                    }
                }
            }
            if self.sent < self.outgoing.len() {
                return Status::Ok;
            }
            self.outgoing.clear();
            pump.set_conditional(Some(PollCond {
                fd: socket.fd(),
                events: Events::IN,
            }));
            self.state = RequestState::WaitingForResponse;
            return Status::Ok;
        }

        // RequestState::WaitingForResponse
        let mut chunk = [0u8; READ_BUFFER_SIZE];
        loop {
            match socket.recv(&mut chunk) {
                Ok(0) => {
                    pump.set_conditional(None);
                    *eos = true;
                    return Status::Done;
                }
                Ok(n) => {
                    buffer.borrow_mut().append(channels.output(), &chunk[..n]);
                    if n < READ_BUFFER_SIZE {
                        return Status::Ok;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Status::Ok;
                }
                Err(err) => {
                    warn!("response read error: {}", err);
                    return Status::LostConnection;
                }
            }
        }
    }

    fn is_valid(&self) -> bool {
        !self.abort.is_aborted()
    }
}

fn parse_url(url: &str) -> Result<(String, u16, String)> {
    let rest = url.strip_prefix("http://").ok_or_else(|| Error::BadUrl {
        url: url.to_string(),
        reason: "only cleartext http urls are supported",
    })?;
    let (authority, path) = match rest.find('/') {
        Some(slash) => (&rest[..slash], &rest[slash..]),
        None => (rest, "/"),
    };
    if authority.is_empty() {
        return Err(Error::BadUrl {
            url: url.to_string(),
            reason: "missing host",
        });
    }
    let (host, port) = match authority.rfind(':') {
        Some(colon) => {
            let port = authority[colon + 1..]
                .parse::<u16>()
                .map_err(|_| Error::BadUrl {
                    url: url.to_string(),
                    reason: "bad port",
                })?;
            (authority[..colon].to_string(), port)
        }
        None => (authority.to_string(), DEFAULT_HTTP_PORT),
    };
    Ok((host, port, path.to_string()))
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::pipe::{pipe_ptr, Chain, FnFactory};
    use crate::pump::{Pump, NEVER_CHAIN_EXPIRY_SECS};
    use crate::socket::ServerSocket;
    use crate::util::{StringExtractor, StringInjector};

    #[test]
    fn url_parsing() {
        let (host, port, path) = parse_url("http://127.0.0.1:8080/status?deep=1").unwrap();
        assert_eq!(host, "127.0.0.1");
        assert_eq!(port, 8080);
        assert_eq!(path, "/status?deep=1");

        let (host, port, path) = parse_url("http://example.test").unwrap();
        assert_eq!(host, "example.test");
        assert_eq!(port, 80);
        assert_eq!(path, "/");

        assert!(parse_url("https://example.test/").is_err());
        assert!(parse_url("http://").is_err());
        assert!(parse_url("http://host:badport/").is_err());
    }

    #[test]
    fn request_round_trip_against_local_server() {
        let mut pump = Pump::new();
        let listener = Socket::create_ephemeral(SocketKind::StreamTcp).unwrap();
        let port = listener.local_port().unwrap();
        let canned = "HTTP/1.0 200 OK\r\nContent-Length: 2\r\n\r\nok";
        let factory = FnFactory(move |chain: &mut Chain, _context: &Sd| {
            chain.push(pipe_ptr(StringInjector::new(canned)));
            true
        });
        let server = ServerSocket::new(listener, Box::new(factory));
        pump.add_chain(vec![pipe_ptr(server)], NEVER_CHAIN_EXPIRY_SECS);
        // let the listener install its conditional
        pump.pump();

        let url = format!("http://127.0.0.1:{}/anything", port);
        let request =
            UrlRequest::new(RequestAction::Get, &url, UrlRequestConfig::default()).unwrap();
        let extractor = StringExtractor::new();
        let text = extractor.shared_string();
        let done = extractor.done_flag();
        pump.add_request_chain(
            vec![pipe_ptr(request), pipe_ptr(extractor)],
            5.0,
        );

        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(3) && !done.get() {
            pump.pump();
            pump.callback();
            thread::sleep(Duration::from_millis(2));
        }
        assert!(done.get(), "request never completed");
        assert_eq!(text.borrow().as_str(), canned);
    }

    #[test]
    fn aborted_request_retires_the_chain() {
        let mut pump = Pump::new();
        let request = UrlRequest::new(
            RequestAction::Get,
            "http://127.0.0.1:9/never",
            UrlRequestConfig::default(),
        )
        .unwrap();
        let abort = request.abort_handle();
        pump.add_request_chain(
            vec![pipe_ptr(request), pipe_ptr(crate::util::Null)],
            NEVER_CHAIN_EXPIRY_SECS,
        );
        abort.abort();
        pump.pump();
        assert_eq!(pump.running_chain_count(), 0);
    }
}
