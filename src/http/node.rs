//! URL-routed tree of request handlers.
//!
//! A [`Router`] maps path components to nodes. Each node is either a
//! [`Node`] handler invoked through the default structured-data pipe, or a
//! [`ChainFactory`](crate::pipe::ChainFactory) that builds its own
//! protocol pipes (the RPC server plugs in this way).
//!
//! Handlers answer through a [`Response`] object, which may outlive the
//! `process` call that created it: a handler that cannot answer yet keeps
//! the response and completes it later, from any thread, and the waiting
//! chain is unlocked at that point.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use crate::pipe::ChainFactory;
use crate::pump::LockClearer;
use crate::sd::Sd;

/// How the default pipe interprets a request body for this node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentType {
    /// Parse the body as structured data notation.
    StructuredData,
    /// Hand the body to the node as a plain string.
    Text,
}

/// A leaf request handler. Default verb implementations answer
/// `405 Method Not Allowed`.
pub trait Node {
    fn get(&self, response: &ResponsePtr, _context: &Sd) {
        response.method_not_allowed();
    }

    fn put(&self, response: &ResponsePtr, _context: &Sd, _input: Sd) {
        response.method_not_allowed();
    }

    fn post(&self, response: &ResponsePtr, _context: &Sd, _input: Sd) {
        response.method_not_allowed();
    }

    fn del(&self, response: &ResponsePtr, _context: &Sd) {
        response.method_not_allowed();
    }

    fn options(&self, response: &ResponsePtr, _context: &Sd) {
        response.method_not_allowed();
    }

    fn content_type(&self) -> ContentType {
        ContentType::StructuredData
    }
}

pub type NodePtr = Rc<dyn Node>;

////////////////////////////////////////////////////////////////////////////////
// Router
////////////////////////////////////////////////////////////////////////////////

/// Tree of handlers addressed by slash separated paths.
#[derive(Default)]
pub struct Router {
    handler: Option<NodePtr>,
    factory: Option<Rc<dyn ChainFactory>>,
    children: HashMap<String, Router>,
}

impl Router {
    pub fn new() -> Router {
        Router::default()
    }

    /// Register a handler node under `path` (for example `"web/echo"`),
    /// creating intermediate routers as needed.
    pub fn add_node(&mut self, path: &str, node: impl Node + 'static) {
        self.subtree(path).handler = Some(Rc::new(node));
    }

    /// Register a protocol chain factory under `path`. The responder asks
    /// the factory for pipes instead of using the default handler pipe.
    pub fn add_factory(&mut self, path: &str, factory: Rc<dyn ChainFactory>) {
        self.subtree(path).factory = Some(factory);
    }

    /// Find the routed node for `path`. Intermediate routers without a
    /// handler or factory do not answer requests.
    pub fn traverse(&self, path: &str) -> Option<&Router> {
        let mut current = self;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current = current.children.get(component)?;
        }
        if current.handler.is_some() || current.factory.is_some() {
            Some(current)
        } else {
            None
        }
    }

    pub fn handler(&self) -> Option<&NodePtr> {
        self.handler.as_ref()
    }

    pub fn factory(&self) -> Option<&Rc<dyn ChainFactory>> {
        self.factory.as_ref()
    }

    fn subtree(&mut self, path: &str) -> &mut Router {
        let mut current = self;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current = current
                .children
                .entry(component.to_string())
                .or_insert_with(Router::new);
        }
        current
    }
}

////////////////////////////////////////////////////////////////////////////////
// Response
////////////////////////////////////////////////////////////////////////////////

pub(crate) enum ResponseState {
    Pending,
    Result(Sd),
    Status(i32, String),
    Extended {
        code: i32,
        body: String,
        headers: Sd,
    },
}

pub(crate) struct ResponseSlot {
    pub state: ResponseState,
    pub headers: Sd,
    pub unlock: Option<(LockClearer, i32)>,
}

/// Completion handle for one request.
///
/// `Send + Sync`: a handler may stash the pointer and complete the request
/// from a worker thread. Completing twice keeps the first answer.
pub struct Response {
    slot: Arc<Mutex<ResponseSlot>>,
}

pub type ResponsePtr = Arc<Response>;

impl Response {
    pub(crate) fn new() -> (ResponsePtr, Arc<Mutex<ResponseSlot>>) {
        let slot = Arc::new(Mutex::new(ResponseSlot {
            state: ResponseState::Pending,
            headers: Sd::Undef,
            unlock: None,
        }));
        (
            Arc::new(Response { slot: slot.clone() }),
            slot,
        )
    }

    /// Record a response header. Emitted in insertion order.
    pub fn header(&self, name: &str, value: &str) {
        let mut slot = self.lock_slot();
        slot.headers.insert(name, value);
    }

    /// Answer with `200 OK` and a structured data body.
    pub fn result(&self, result: Sd) {
        self.complete(ResponseState::Result(result));
    }

    /// Answer with a bare status code and message.
    pub fn status(&self, code: i32, message: &str) {
        self.complete(ResponseState::Status(code, message.to_string()));
    }

    /// Answer with a status code, a verbatim body and an explicit header
    /// map.
    pub fn extended_result(&self, code: i32, body: impl Into<String>, headers: Sd) {
        self.complete(ResponseState::Extended {
            code,
            body: body.into(),
            headers,
        });
    }

    pub fn method_not_allowed(&self) {
        self.status(405, "Method Not Allowed");
    }

    pub fn not_found(&self) {
        self.status(404, "Not Found");
    }

    fn complete(&self, state: ResponseState) {
        let unlock = {
            let mut slot = self.lock_slot();
            if !matches!(slot.state, ResponseState::Pending) {
                return;
            }
            slot.state = state;
            slot.unlock.take()
        };
        if let Some((clearer, key)) = unlock {
            clearer.clear(key);
        }
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, ResponseSlot> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe;
    impl Node for Probe {}

    #[test]
    fn traverse_finds_registered_nodes() {
        let mut router = Router::new();
        router.add_node("web/echo", Probe);
        router.add_node("top", Probe);
        assert!(router.traverse("web/echo").is_some());
        assert!(router.traverse("/web/echo/").is_some());
        assert!(router.traverse("top").is_some());
        assert!(router.traverse("web").is_none());
        assert!(router.traverse("nosuch").is_none());
        assert!(router.traverse("web/echo/deeper").is_none());
    }

    #[test]
    fn second_completion_is_ignored() {
        let (response, slot) = Response::new();
        response.status(404, "Not Found");
        response.status(200, "OK");
        let slot = slot.lock().unwrap();
        match &slot.state {
            ResponseState::Status(code, message) => {
                assert_eq!(*code, 404);
                assert_eq!(message, "Not Found");
            }
            _ => panic!("unexpected response state"),
        }
    }
}
