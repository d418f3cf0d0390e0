//! Structured data RPC server pipe.
//!
//! Requests are `{'method':'NAME', 'parameter':<sd>}` in notation; answers
//! are `{'response':<sd>}` or `{'fault':{'code':i<n>, 'description':'..'}}`.
//! Register method handlers by name on an [`RpcServer`] and link the
//! server into a chain behind whatever transports the request bytes (the
//! HTTP router via [`RpcServer::factory`], or anything else that raises
//! end of stream).
//!
//! A method decides how its response is produced:
//!
//! * [`RpcStatus::Done`] — output was written synchronously.
//! * [`RpcStatus::Callback`] — run the method again on the pump's
//!   [`callback`](crate::pump::Pump::callback) cycle (for work that wants
//!   the callback thread), then unlock.
//! * [`RpcStatus::Deferred`] — the chain stays locked until somebody calls
//!   [`RpcServer::clear_lock`]; the deferred handler then emits the body.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write as _;
use std::rc::{Rc, Weak};

use log::{debug, info};

use crate::buffer::{BufferArray, BufferPtr, Channels};
use crate::bufstream::{BufferReader, BufferWriter};
use crate::notation;
use crate::pipe::{Chain, ChainFactory, IoPipe, PipePtr, Status};
use crate::pump::{Link, LockClearer, PumpContext};
use crate::sd::Sd;

pub const FAULT_GENERIC: i32 = 1000;
pub const FAULT_METHOD_NOT_FOUND: i32 = 1001;
pub const FAULT_BAD_REQUEST: i32 = 2000;
pub const FAULT_NO_RESPONSE: i32 = 2001;

/// Outcome of a method call, steering the pump process/callback split.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RpcStatus {
    /// Response not ready; the chain stays locked until
    /// [`RpcServer::clear_lock`], then the deferred handler runs.
    Deferred,
    /// Handle the method on the pump's callback cycle.
    Callback,
    /// The call finished and generated output.
    Done,
    /// The call failed; a generic fault is sent.
    Error,
}

pub type RpcMethod = Box<dyn FnMut(&Sd, Channels, &mut BufferArray) -> RpcStatus>;
pub type RpcDeferredResponse = Box<dyn FnMut(Channels, &mut BufferArray) -> RpcStatus>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    None,
    Callback,
    Deferred,
    Done,
}

/// Method-table driven RPC server pipe.
pub struct RpcServer {
    state: State,
    request: Sd,
    lock: i32,
    clearer: Option<LockClearer>,
    methods: HashMap<String, RpcMethod>,
    callback_methods: HashMap<String, RpcMethod>,
    deferred: Option<RpcDeferredResponse>,
    self_ref: Weak<RefCell<RpcServer>>,
}

impl RpcServer {
    /// Build a server pipe. The shared handle is needed so the server can
    /// requeue itself on the pump's callback cycle.
    pub fn new_ptr() -> Rc<RefCell<RpcServer>> {
        Rc::new_cyclic(|self_ref| {
            RefCell::new(RpcServer {
                state: State::None,
                request: Sd::Undef,
                lock: 0,
                clearer: None,
                methods: HashMap::new(),
                callback_methods: HashMap::new(),
                deferred: None,
                self_ref: self_ref.clone(),
            })
        })
    }

    /// Register a method handled during `process`.
    pub fn add_method(
        &mut self,
        name: &str,
        method: impl FnMut(&Sd, Channels, &mut BufferArray) -> RpcStatus + 'static,
    ) {
        self.methods.insert(name.to_string(), Box::new(method));
    }

    /// Register a method handled on the pump's callback cycle.
    pub fn add_callback_method(
        &mut self,
        name: &str,
        method: impl FnMut(&Sd, Channels, &mut BufferArray) -> RpcStatus + 'static,
    ) {
        self.callback_methods
            .insert(name.to_string(), Box::new(method));
    }

    /// Handler that emits the body of a deferred response once the chain
    /// is unlocked.
    pub fn set_deferred_response(
        &mut self,
        handler: impl FnMut(Channels, &mut BufferArray) -> RpcStatus + 'static,
    ) {
        self.deferred = Some(Box::new(handler));
    }

    /// Unlock a chain frozen by a [`RpcStatus::Deferred`] method. The pump
    /// revisits the server on its next tick and collects the deferred
    /// response.
    pub fn clear_lock(&mut self) {
        if self.lock != 0 {
            if let Some(clearer) = self.clearer.take() {
                clearer.clear(self.lock);
            }
            self.lock = 0;
        }
    }

    /// A chain factory adding a fresh link to this server, for registering
    /// the server under an HTTP route.
    pub fn factory(server: Rc<RefCell<RpcServer>>) -> impl ChainFactory {
        RpcServerFactory { server }
    }

    fn call_method(
        &mut self,
        method: &str,
        params: &Sd,
        channels: Channels,
        data: &mut BufferArray,
    ) -> RpcStatus {
        if let Some(handler) = self.methods.get_mut(method) {
            return handler(params, channels, data);
        }
        if self.callback_methods.contains_key(method) {
            // found on the callback table; coordinate through the pump
            return RpcStatus::Callback;
        }
        build_fault(
            channels,
            data,
            FAULT_METHOD_NOT_FOUND,
            &format!("rpc server unable to find method: {}", method),
        );
        RpcStatus::Done
    }

    fn call_callback_method(
        &mut self,
        method: &str,
        params: &Sd,
        channels: Channels,
        data: &mut BufferArray,
    ) -> RpcStatus {
        match self.callback_methods.get_mut(method) {
            Some(handler) => handler(params, channels, data),
            None => {
                build_fault(
                    channels,
                    data,
                    FAULT_METHOD_NOT_FOUND,
                    &format!("rpc server unable to find callback method: {}", method),
                );
                RpcStatus::Done
            }
        }
    }
}

impl IoPipe for RpcServer {
    fn process(
        &mut self,
        channels: Channels,
        buffer: &BufferPtr,
        eos: &mut bool,
        context: &mut Sd,
        pump: &mut PumpContext<'_>,
    ) -> Status {
        // respond only once all of the request has arrived
        if !*eos {
            return Status::Break;
        }

        let mut status = Status::Done;
        match self.state {
            State::Deferred => {
                let mut data = buffer.borrow_mut();
                let produced = match &mut self.deferred {
                    Some(handler) => handler(channels, &mut data),
                    None => RpcStatus::Done,
                };
                if produced != RpcStatus::Done {
                    build_fault(
                        channels,
                        &mut data,
                        FAULT_GENERIC,
                        "deferred response failed.",
                    );
                }
                self.state = State::Done;
                return Status::Done;
            }
            State::Done => {}
            State::Callback => {
                let method = self.request.at("method").as_str().to_string();
                if !method.is_empty() && self.request.has("parameter") {
                    let params = self.request.at("parameter").clone();
                    let mut data = buffer.borrow_mut();
                    if self.call_callback_method(&method, &params, channels, &mut data)
                        != RpcStatus::Done
                    {
                        build_fault(
                            channels,
                            &mut data,
                            FAULT_GENERIC,
                            "Callback method call failed.",
                        );
                    }
                } else {
                    // we cannot be in this state without having found the
                    // method during the first process pass
                    let mut data = buffer.borrow_mut();
                    build_fault(
                        channels,
                        &mut data,
                        FAULT_GENERIC,
                        "Invalid rpc server state - callback without method.",
                    );
                }
                pump.clear_lock(self.lock);
                self.lock = 0;
                self.state = State::Done;
            }
            State::None => {
                let count = {
                    let data = buffer.borrow();
                    data.count(channels.input())
                };
                self.request = {
                    let data = buffer.borrow();
                    let mut istr = BufferReader::new(&data, channels.input());
                    match notation::from_notation(&mut istr, count) {
                        Ok((request, _)) => request,
                        Err(err) => {
                            debug!("failed to parse rpc request: {}", err);
                            Sd::Undef
                        }
                    }
                };

                let method = self.request.at("method").as_str().to_string();
                if !method.is_empty() && self.request.has("parameter") {
                    let params = self.request.at("parameter").clone();
                    let produced = {
                        let mut data = buffer.borrow_mut();
                        self.call_method(&method, &params, channels, &mut data)
                    };
                    match produced {
                        RpcStatus::Deferred => {
                            self.lock = pump.set_lock();
                            self.clearer = Some(pump.lock_clearer());
                            self.state = State::Deferred;
                            status = Status::Break;
                        }
                        RpcStatus::Callback => {
                            self.state = State::Callback;
                            match self.self_ref.upgrade() {
                                Some(me) => {
                                    let pipe: PipePtr = me;
                                    let links = vec![Link { pipe, channels }];
                                    pump.respond_links(links, buffer.clone(), context.clone());
                                    self.lock = pump.set_lock();
                                    status = Status::Break;
                                }
                                None => {
                                    let mut data = buffer.borrow_mut();
                                    build_fault(
                                        channels,
                                        &mut data,
                                        FAULT_GENERIC,
                                        "Method call failed.",
                                    );
                                }
                            }
                        }
                        RpcStatus::Done => {
                            self.state = State::Done;
                        }
                        RpcStatus::Error => {
                            let mut data = buffer.borrow_mut();
                            build_fault(channels, &mut data, FAULT_GENERIC, "Method call failed.");
                        }
                    }
                } else {
                    let mut data = buffer.borrow_mut();
                    build_fault(
                        channels,
                        &mut data,
                        FAULT_BAD_REQUEST,
                        "Unable to find method and parameter in request.",
                    );
                }
            }
        }
        status
    }
}

struct RpcServerFactory {
    server: Rc<RefCell<RpcServer>>,
}

impl ChainFactory for RpcServerFactory {
    fn build(&self, chain: &mut Chain, _context: &Sd) -> bool {
        chain.push(self.server.clone());
        true
    }
}

/// Write an rpc fault onto the output channel.
pub fn build_fault(channels: Channels, data: &mut BufferArray, code: i32, message: &str) {
    info!("rpc fault: {} {}", code, message);
    let mut ostr = BufferWriter::new(data, channels.output());
    let _ = write!(
        ostr,
        "{{'fault':{{'code':i{}, 'description':'{}'}}}}",
        code,
        notation::escape_string(message)
    );
}

/// Write an rpc response envelope onto the output channel.
pub fn build_response(channels: Channels, data: &mut BufferArray, response: &Sd) {
    let mut ostr = BufferWriter::new(data, channels.output());
    let _ = write!(ostr, "{{'response':");
    let _ = notation::to_notation(response, &mut ostr);
    let _ = write!(ostr, "}}");
}
