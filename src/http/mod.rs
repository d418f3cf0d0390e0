//! HTTP/1.0 server built out of pipes.
//!
//! [`Responder`] parses requests off its input channel and routes them
//! through a [`Router`]; matched requests are handed to a sub-chain of
//! `Flush`, the routed handler pipe (the default [`NodePipe`] parses the
//! body and calls the node), a [`ResponseHeader`] writer, and the tail of
//! the original connection chain so the response reaches the socket
//! writer. [`create_server`] wires a listen socket, the accept reactor and
//! a router together onto a pump.

pub mod node;

use std::io::Write as _;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::buffer::{Address, BufferPtr, Channels};
use crate::bufstream::{BufferReader, BufferWriter};
use crate::error::Result;
use crate::notation;
use crate::pipe::{pipe_ptr, Chain, ChainFactory, IoPipe, Status};
use crate::pump::{Link, Links, Pump, PumpContext, DEFAULT_CHAIN_EXPIRY_SECS, NEVER_CHAIN_EXPIRY_SECS};
use crate::sd::Sd;
use crate::socket::{ServerSocket, Socket, SocketKind};
use crate::util::{ChangeChannel, Flush};

use self::node::{ContentType, NodePtr, Response, ResponseSlot, ResponseState, Router};

const HTTP_VERSION_STR: &str = "HTTP/1.0";

pub const CONTEXT_REQUEST: &str = "request";
pub const CONTEXT_RESPONSE: &str = "response";
pub const CONTEXT_VERB: &str = "verb";
pub const CONTEXT_HEADERS: &str = "headers";

pub const HTTP_VERB_GET: &str = "GET";
pub const HTTP_VERB_PUT: &str = "PUT";
pub const HTTP_VERB_POST: &str = "POST";
pub const HTTP_VERB_DELETE: &str = "DELETE";
pub const HTTP_VERB_OPTIONS: &str = "OPTIONS";

/// Longest accepted header line, including the line break.
const HEADER_BUFFER_SIZE: usize = 1024;

////////////////////////////////////////////////////////////////////////////////
// NodePipe
////////////////////////////////////////////////////////////////////////////////

enum NodePipeState {
    Invoke,
    Dispatched,
}

/// Default handler pipe: parses the request body per the node's declared
/// content type, invokes the verb handler, and emits whatever the handler
/// answered. A handler that defers its answer leaves the chain locked
/// until the response object is completed.
pub struct NodePipe {
    node: NodePtr,
    state: NodePipeState,
    slot: Option<Arc<Mutex<ResponseSlot>>>,
}

impl NodePipe {
    pub fn new(node: NodePtr) -> NodePipe {
        NodePipe {
            node,
            state: NodePipeState::Invoke,
            slot: None,
        }
    }
}

impl IoPipe for NodePipe {
    fn process(
        &mut self,
        channels: Channels,
        buffer: &BufferPtr,
        eos: &mut bool,
        context: &mut Sd,
        pump: &mut PumpContext<'_>,
    ) -> Status {
        // we respond only once all the data has arrived
        if !*eos {
            return Status::Break;
        }

        if let NodePipeState::Invoke = self.state {
            self.state = NodePipeState::Dispatched;
            let (response, slot) = Response::new();
            self.slot = Some(slot);

            let verb = context.at(CONTEXT_REQUEST).at(CONTEXT_VERB).as_str().to_string();
            let parse_input = || -> Sd {
                let data = buffer.borrow();
                match self.node.content_type() {
                    ContentType::StructuredData => {
                        let count = data.count(channels.input());
                        let mut istr = BufferReader::new(&data, channels.input());
                        match notation::from_notation(&mut istr, count) {
                            Ok((input, _)) => input,
                            Err(err) => {
                                debug!("failed to parse request body: {}", err);
                                Sd::Undef
                            }
                        }
                    }
                    ContentType::Text => {
                        let mut text = String::new();
                        use std::io::Read as _;
                        let mut istr = BufferReader::new(&data, channels.input());
                        let _ = istr.read_to_string(&mut text);
                        Sd::String(text)
                    }
                }
            };

            match verb.as_str() {
                HTTP_VERB_GET => self.node.get(&response, context),
                HTTP_VERB_PUT => {
                    let input = parse_input();
                    self.node.put(&response, context, input);
                }
                HTTP_VERB_POST => {
                    let input = parse_input();
                    self.node.post(&response, context, input);
                }
                HTTP_VERB_DELETE => self.node.del(&response, context),
                HTTP_VERB_OPTIONS => self.node.options(&response, context),
                _ => response.method_not_allowed(),
            }
            debug!("dispatched {} {}", verb, context.at(CONTEXT_REQUEST).at("path").as_str());
        }

        let slot = match &self.slot {
            Some(slot) => slot.clone(),
            None => return Status::Error,
        };
        let (state, mut headers) = {
            let mut slot = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if matches!(slot.state, ResponseState::Pending) {
                // the handler deferred; freeze the chain until the
                // response object is completed
                let key = pump.set_lock();
                slot.unlock = Some((pump.lock_clearer(), key));
                return Status::Break;
            }
            let state = std::mem::replace(&mut slot.state, ResponseState::Pending);
            (state, std::mem::take(&mut slot.headers))
        };

        match state {
            ResponseState::Result(result) => {
                headers.insert("Content-Type", "application/llsd+notation");
                context
                    .at_mut(CONTEXT_RESPONSE)
                    .insert(CONTEXT_HEADERS, headers);
                let mut data = buffer.borrow_mut();
                let mut ostr = BufferWriter::new(&mut data, channels.output());
                let _ = notation::to_notation(&result, &mut ostr);
                Status::Done
            }
            ResponseState::Status(code, message) => {
                headers.insert("Content-Type", "text/plain");
                let response = context.at_mut(CONTEXT_RESPONSE);
                response.insert(CONTEXT_HEADERS, headers);
                response.insert("statusCode", code);
                response.insert("statusMessage", message.as_str());
                let mut data = buffer.borrow_mut();
                let mut ostr = BufferWriter::new(&mut data, channels.output());
                let _ = ostr.write_all(message.as_bytes());
                Status::Done
            }
            ResponseState::Extended {
                code,
                body,
                headers: extended_headers,
            } => {
                let response = context.at_mut(CONTEXT_RESPONSE);
                response.insert(CONTEXT_HEADERS, extended_headers);
                response.insert("statusCode", code);
                let mut data = buffer.borrow_mut();
                let mut ostr = BufferWriter::new(&mut data, channels.output());
                let _ = ostr.write_all(body.as_bytes());
                Status::Done
            }
            ResponseState::Pending => Status::Error,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// ResponseHeader
////////////////////////////////////////////////////////////////////////////////

/// Waits for end of stream, then prepends the status line, content length
/// and recorded headers to the response body accumulated on its input
/// channel.
pub struct ResponseHeader;

impl IoPipe for ResponseHeader {
    fn process(
        &mut self,
        channels: Channels,
        buffer: &BufferPtr,
        eos: &mut bool,
        context: &mut Sd,
        _pump: &mut PumpContext<'_>,
    ) -> Status {
        if !*eos {
            return Status::Ok;
        }

        let mut code = context.at(CONTEXT_RESPONSE).at("statusCode").as_int();
        let mut message = context
            .at(CONTEXT_RESPONSE)
            .at("statusMessage")
            .as_str()
            .to_string();
        if code < 200 {
            code = 200;
            message = "OK".to_string();
        }

        let content_length = buffer.borrow().count(channels.input());
        let mut header = format!("{} {} {}\r\n", HTTP_VERSION_STR, code, message);
        if content_length > 0 {
            header.push_str(&format!("Content-Length: {}\r\n", content_length));
        }
        for (name, value) in context.at(CONTEXT_RESPONSE).at(CONTEXT_HEADERS).map_iter() {
            header.push_str(&format!("{}: {}\r\n", name, value.as_str()));
        }
        header.push_str("\r\n");

        let mut data = buffer.borrow_mut();
        ChangeChannel::new(channels.input(), channels.output()).apply(&mut data);
        data.prepend(channels.output(), header.as_bytes());
        Status::Done
    }
}

////////////////////////////////////////////////////////////////////////////////
// Responder
////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ResponderState {
    Nothing,
    ReadingHeaders,
    LookingForEos,
    Done,
    ShortCircuit,
}

/// Per-connection HTTP request state machine.
///
/// Parses the request line and headers off the input channel, waits for
/// the full body per `content-length`, routes the path, and hands the
/// request over to a freshly built response chain.
pub struct Responder {
    root: Rc<Router>,
    build_context: Sd,
    state: ResponderState,
    last_read: Option<Address>,
    verb: String,
    abs_path_and_query: String,
    path: String,
    query: String,
    version: String,
    content_length: usize,
    headers: Sd,
}

impl Responder {
    pub fn new(root: Rc<Router>, build_context: Sd) -> Responder {
        Responder {
            root,
            build_context,
            state: ResponderState::Nothing,
            last_read: None,
            verb: String::new(),
            abs_path_and_query: String::new(),
            path: String::new(),
            query: String::new(),
            version: String::new(),
            content_length: 0,
            headers: Sd::Undef,
        }
    }

    /// Read one header line strictly after the last consumed byte. Leaves
    /// the read head on the newline so the next call picks up the next
    /// line. `None` means no full line is buffered yet; a full buffer with
    /// no newline is an oversize line and short-circuits the request.
    fn read_header_line(
        &mut self,
        channels: Channels,
        buffer: &BufferPtr,
        dest: &mut [u8; HEADER_BUFFER_SIZE],
    ) -> Option<usize> {
        let (len, newline) = {
            let data = buffer.borrow();
            let (len, last) =
                data.read_after(channels.input(), self.last_read, &mut dest[..HEADER_BUFFER_SIZE - 1]);
            let newline = dest[..len].iter().position(|&byte| byte == b'\n');
            if let (Some(position), Some(last)) = (newline, last) {
                // move the read head back to the newline
                let backup = ((len - 1) - position) as i64;
                self.last_read =
                    data.seek(channels.input(), crate::buffer::SeekStart::At(last), -backup);
            }
            (len, newline)
        };
        match newline {
            Some(position) => Some(position + 1),
            None => {
                if len > 0 {
                    debug!("header line too long, rejecting request");
                    self.mark_bad(channels, buffer);
                }
                None
            }
        }
    }

    /// Emit `400 Bad Request` and swallow the rest of the stream.
    fn mark_bad(&mut self, channels: Channels, buffer: &BufferPtr) {
        self.state = ResponderState::ShortCircuit;
        let mut data = buffer.borrow_mut();
        let mut out = BufferWriter::new(&mut data, channels.output());
        let _ = write!(
            out,
            "{} 400 Bad Request\r\n\r\n<html>\n<title>Bad Request</title>\n<body>\nBad Request.\n</body>\n</html>\n",
            HTTP_VERSION_STR
        );
    }

    fn parse_request_line(&mut self, line: &str) -> RequestLine {
        let mut words = line.split_whitespace();
        self.verb = words.next().unwrap_or("").to_string();
        match self.verb.as_str() {
            HTTP_VERB_GET | HTTP_VERB_PUT | HTTP_VERB_POST | HTTP_VERB_DELETE
            | HTTP_VERB_OPTIONS => {
                self.abs_path_and_query = words.next().unwrap_or("").to_string();
                self.version = words.next().unwrap_or("").to_string();
                debug!(
                    "http request: {} {} {}",
                    self.verb, self.abs_path_and_query, self.version
                );
                match self.abs_path_and_query.find('?') {
                    Some(delimiter) => {
                        self.path = self.abs_path_and_query[..delimiter].to_string();
                        self.query = self.abs_path_and_query[delimiter + 1..].to_string();
                    }
                    None => {
                        self.path = self.abs_path_and_query.clone();
                        self.query = String::new();
                    }
                }
                if !self.abs_path_and_query.is_empty() && self.version.is_empty() {
                    // an HTTP/0.9 style request has no headers
                    self.version = HTTP_VERSION_STR.to_string();
                    RequestLine::Simple
                } else {
                    RequestLine::Full
                }
            }
            _ => {
                debug!("unknown http verb: {}", self.verb);
                RequestLine::Bad
            }
        }
    }

    /// Parse one `name: value` header. Returns false when the line ends
    /// the header block or is malformed.
    fn parse_header_line(&mut self, line: &[u8], channels: Channels, buffer: &BufferPtr) -> bool {
        if line.starts_with(b"\r\n") || line.first() == Some(&b'\n') {
            self.state = ResponderState::LookingForEos;
            return false;
        }
        let text = String::from_utf8_lossy(line);
        let text = text.trim_end_matches(['\r', '\n'].as_ref());
        match text.find(':') {
            Some(colon) => {
                let name = text[..colon].to_ascii_lowercase();
                let value = text[colon + 1..].trim();
                if name == "content-length" {
                    debug!("Content-Length: {}", value);
                    self.content_length = value.parse().unwrap_or(0);
                } else {
                    self.headers.insert(&name, value);
                }
                true
            }
            None => {
                debug!("bad header: {}", text);
                self.mark_bad(channels, buffer);
                false
            }
        }
    }

    /// Move the request body onto the output channel and hand everything
    /// to a fresh response chain. Returns the status for this pipe.
    fn dispatch(
        &mut self,
        routed: &Router,
        channels: Channels,
        buffer: &BufferPtr,
        context: &mut Sd,
        pump: &mut PumpContext<'_>,
    ) -> Status {
        // everything strictly after the headers is the request body;
        // rechannel it so the handler finds it on its input
        {
            let mut data = buffer.borrow_mut();
            if let Some(last) = self.last_read {
                if let Some(split) = data.split_after(last) {
                    for index in (split + 1)..data.segment_count() {
                        if let Some(segment) = data.segment(index) {
                            if segment.is_on_channel(channels.input()) {
                                data.set_segment_channel(index, channels.output());
                            }
                        }
                    }
                }
            }
        }

        let request = context.at_mut(CONTEXT_REQUEST);
        request.insert("path", self.path.as_str());
        request.insert("query-string", self.query.as_str());
        request.insert(
            "remote-host",
            self.build_context.at("remote-host").clone(),
        );
        request.insert(
            "remote-port",
            self.build_context.at("remote-port").clone(),
        );
        request.insert(CONTEXT_HEADERS, std::mem::take(&mut self.headers));

        // the response chain: flush, handler, header writer, then every
        // pipe that came after us so the response reaches the socket
        let mut chain: Chain = vec![pipe_ptr(Flush)];
        if let Some(factory) = routed.factory() {
            factory.build(&mut chain, context);
        } else if let Some(handler) = routed.handler() {
            chain.push(pipe_ptr(NodePipe::new(handler.clone())));
        }
        chain.push(pipe_ptr(ResponseHeader));

        let current = pump.current_links();
        let this_link = pump.current_link();
        for (index, link) in current.into_iter().enumerate() {
            if index > this_link {
                chain.push(link.pipe);
            }
        }

        let mut links: Links = Vec::with_capacity(chain.len());
        let mut chnl = channels;
        for pipe in chain {
            links.push(Link {
                pipe,
                channels: chnl,
            });
            chnl = Channels::consumer_of(chnl);
        }
        pump.add_links(
            links,
            buffer.clone(),
            context.clone(),
            DEFAULT_CHAIN_EXPIRY_SECS,
        );
        Status::Stop
    }
}

impl IoPipe for Responder {
    fn process(
        &mut self,
        channels: Channels,
        buffer: &BufferPtr,
        _eos: &mut bool,
        context: &mut Sd,
        pump: &mut PumpContext<'_>,
    ) -> Status {
        let mut status = Status::Ok;

        if matches!(
            self.state,
            ResponderState::Nothing | ResponderState::ReadingHeaders
        ) {
            status = Status::Break;
            self.state = ResponderState::ReadingHeaders;
            let mut line_buf = [0u8; HEADER_BUFFER_SIZE];
            if let Some(first_len) = self.read_header_line(channels, buffer, &mut line_buf) {
                let mut parse_headers = true;
                let mut current = Some(first_len);
                if self.verb.is_empty() {
                    let line = String::from_utf8_lossy(&line_buf[..first_len]).into_owned();
                    match self.parse_request_line(&line) {
                        RequestLine::Full => {
                            current = self.read_header_line(channels, buffer, &mut line_buf);
                        }
                        RequestLine::Simple => {
                            parse_headers = false;
                            self.state = ResponderState::Done;
                        }
                        RequestLine::Bad => {
                            parse_headers = false;
                            self.mark_bad(channels, buffer);
                        }
                    }
                }
                if parse_headers {
                    while let Some(line_len) = current {
                        let line = line_buf[..line_len].to_vec();
                        if !self.parse_header_line(&line, channels, buffer) {
                            break;
                        }
                        current = self.read_header_line(channels, buffer, &mut line_buf);
                    }
                }
            }
        }

        if self.state == ResponderState::LookingForEos {
            let body_ready = self.content_length == 0
                || buffer
                    .borrow()
                    .count_after(channels.input(), self.last_read)
                    >= self.content_length;
            if body_ready {
                self.state = ResponderState::Done;
            }
            // else more bytes should be coming
        }

        if self.state == ResponderState::Done {
            context
                .at_mut(CONTEXT_REQUEST)
                .insert(CONTEXT_VERB, self.verb.as_str());
            let root = self.root.clone();
            match root.traverse(&self.path) {
                Some(routed) => {
                    status = self.dispatch(routed, channels, buffer, context, pump);
                }
                None => {
                    warn!("no handler for {}", self.abs_path_and_query);
                    self.state = ResponderState::ShortCircuit;
                    let mut data = buffer.borrow_mut();
                    let mut out = BufferWriter::new(&mut data, channels.output());
                    let _ = write!(
                        out,
                        "{} 404 Not Found\r\n\r\n<html>\n<title>Not Found</title>\n<body>\nNode '{}' not found.\n</body>\n</html>\n",
                        HTTP_VERSION_STR, self.abs_path_and_query
                    );
                }
            }
        }

        if self.state == ResponderState::ShortCircuit {
            status = Status::Done;
        }
        status
    }
}

enum RequestLine {
    Full,
    Simple,
    Bad,
}

////////////////////////////////////////////////////////////////////////////////
// Server wiring
////////////////////////////////////////////////////////////////////////////////

struct ResponderFactory {
    root: Rc<Router>,
}

impl ChainFactory for ResponderFactory {
    fn build(&self, chain: &mut Chain, context: &Sd) -> bool {
        chain.push(pipe_ptr(Responder::new(self.root.clone(), context.clone())));
        true
    }
}

/// Start an HTTP server on `port` (zero for a kernel-assigned port) and
/// add its accept chain to `pump`. Returns the bound port.
pub fn create_server(pump: &mut Pump, port: u16, root: Router) -> Result<u16> {
    let socket = if port == 0 {
        Socket::create_ephemeral(SocketKind::StreamTcp)?
    } else {
        Socket::create(SocketKind::StreamTcp, port)?
    };
    let bound = socket.local_port()?;
    let factory = ResponderFactory {
        root: Rc::new(root),
    };
    let server = ServerSocket::new(socket, Box::new(factory));
    pump.add_chain(vec![pipe_ptr(server)], NEVER_CHAIN_EXPIRY_SECS);
    Ok(bound)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;
    use std::thread;
    use std::time::{Duration, Instant};

    use pretty_assertions::assert_eq;

    use super::node::{ContentType, Node, ResponsePtr};
    use super::*;
    use crate::pipe::pipe_ptr;
    use crate::util::{StringExtractor, StringInjector};

    struct EchoNode;
    impl Node for EchoNode {
        fn put(&self, response: &ResponsePtr, _context: &Sd, input: Sd) {
            response.extended_result(200, input.as_str().to_string(), Sd::Undef);
        }
        fn content_type(&self) -> ContentType {
            ContentType::Text
        }
    }

    struct HelloNode;
    impl Node for HelloNode {
        fn get(&self, response: &ResponsePtr, _context: &Sd) {
            response.result(Sd::from("hello"));
        }
    }

    fn run_request(root: Router, request: &str) -> String {
        let mut pump = Pump::new();
        let root = Rc::new(root);
        let extractor = StringExtractor::new();
        let text = extractor.shared_string();
        let done = extractor.done_flag();
        pump.add_chain(
            vec![
                pipe_ptr(StringInjector::new(request)),
                pipe_ptr(Responder::new(root, Sd::Undef)),
                pipe_ptr(extractor),
            ],
            DEFAULT_CHAIN_EXPIRY_SECS,
        );
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(2) && !done.get() {
            pump.pump();
            pump.callback();
            thread::sleep(Duration::from_millis(2));
        }
        let out = text.borrow().clone();
        out
    }

    #[test]
    fn echo_body_round_trip() {
        let body = "junk in the trunk & some \r\n binary-ish bytes";
        let request = format!(
            "PUT /echo HTTP/1.0\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let mut root = Router::new();
        root.add_node("echo", EchoNode);
        let response = run_request(root, &request);
        assert!(
            response.starts_with("HTTP/1.0 200"),
            "unexpected response: {:?}",
            response
        );
        let split = response.find("\r\n\r\n").expect("header separator");
        assert_eq!(&response[split + 4..], body);
        assert!(response.contains(&format!("Content-Length: {}\r\n", body.len())));
    }

    #[test]
    fn get_returns_notation_body() {
        let mut root = Router::new();
        root.add_node("hello", HelloNode);
        let response = run_request(root, "GET /hello HTTP/1.0\r\n\r\n");
        assert!(response.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(response.contains("Content-Type: application/llsd+notation\r\n"));
        let split = response.find("\r\n\r\n").unwrap();
        assert_eq!(&response[split + 4..], "'hello'");
    }

    #[test]
    fn missing_node_is_not_found() {
        let response = run_request(Router::new(), "GET /nosuch HTTP/1.0\r\n\r\n");
        assert!(
            response.starts_with("HTTP/1.0 404 "),
            "unexpected response: {:?}",
            response
        );
        assert!(response.contains("Not Found"));
    }

    #[test]
    fn unknown_verb_is_bad_request() {
        let mut root = Router::new();
        root.add_node("echo", EchoNode);
        let response = run_request(root, "BOGUS /echo HTTP/1.0\r\n\r\n");
        assert!(response.starts_with("HTTP/1.0 400 Bad Request"));
    }

    #[test]
    fn oversize_header_line_is_bad_request() {
        let mut root = Router::new();
        root.add_node("echo", EchoNode);
        let long = "x".repeat(HEADER_BUFFER_SIZE + 10);
        let request = format!("GET /echo?{} HTTP/1.0\r\n\r\n", long);
        let response = run_request(root, &request);
        assert!(response.starts_with("HTTP/1.0 400 Bad Request"));
    }

    #[test]
    fn header_names_are_lowercased() {
        struct HeaderProbe {
            seen: Rc<Cell<bool>>,
        }
        impl Node for HeaderProbe {
            fn get(&self, response: &ResponsePtr, context: &Sd) {
                let headers = context.at(CONTEXT_REQUEST).at(CONTEXT_HEADERS);
                self.seen
                    .set(headers.at("x-probe").as_str() == "checked");
                response.status(204, "No Content");
            }
        }
        let seen = Rc::new(Cell::new(false));
        let mut root = Router::new();
        root.add_node(
            "probe",
            HeaderProbe { seen: seen.clone() },
        );
        let response = run_request(
            root,
            "GET /probe HTTP/1.0\r\nX-Probe: checked\r\n\r\n",
        );
        assert!(seen.get());
        assert!(response.starts_with("HTTP/1.0 204 No Content"));
    }

    #[test]
    fn deferred_response_completes_later() {
        struct DeferredNode {
            handle: Rc<std::cell::RefCell<Option<ResponsePtr>>>,
        }
        impl Node for DeferredNode {
            fn get(&self, response: &ResponsePtr, _context: &Sd) {
                // keep the response for later instead of answering
                *self.handle.borrow_mut() = Some(response.clone());
            }
        }

        let handle = Rc::new(std::cell::RefCell::new(None));
        let mut root = Router::new();
        root.add_node(
            "slow",
            DeferredNode {
                handle: handle.clone(),
            },
        );

        let mut pump = Pump::new();
        let extractor = StringExtractor::new();
        let text = extractor.shared_string();
        pump.add_chain(
            vec![
                pipe_ptr(StringInjector::new("GET /slow HTTP/1.0\r\n\r\n")),
                pipe_ptr(Responder::new(Rc::new(root), Sd::Undef)),
                pipe_ptr(extractor),
            ],
            DEFAULT_CHAIN_EXPIRY_SECS,
        );

        // run until the handler captured the response object
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(2) && handle.borrow().is_none() {
            pump.pump();
            thread::sleep(Duration::from_millis(2));
        }
        let response = handle.borrow_mut().take().expect("handler invoked");
        // the chain is locked, pumping does not produce output
        for _ in 0..3 {
            pump.pump();
        }
        assert!(text.borrow().is_empty());

        response.result(Sd::from("finally"));
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(2) && text.borrow().is_empty() {
            pump.pump();
            thread::sleep(Duration::from_millis(2));
        }
        let out = text.borrow().clone();
        assert!(out.starts_with("HTTP/1.0 200 OK\r\n"), "got: {:?}", out);
        assert!(out.ends_with("'finally'"));
    }
}
