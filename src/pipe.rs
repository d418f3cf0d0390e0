//! The processing stage contract.
//!
//! An [`IoPipe`] is one stage in a chain. The pump calls [`IoPipe::process`]
//! whenever the chain is runnable, handing the pipe its channel pair, the
//! chain's shared buffer and context, the end-of-stream flag, and a
//! [`PumpContext`](crate::pump::PumpContext) through which the pipe can
//! talk back to the scheduler. The returned [`Status`] tells the pump how
//! to move the chain head.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::buffer::{BufferPtr, Channels};
use crate::pump::PumpContext;
use crate::sd::Sd;

////////////////////////////////////////////////////////////////////////////////
// Status
////////////////////////////////////////////////////////////////////////////////

/// Return code of a `process` call.
///
/// The success codes steer the chain head: `Ok` moves on to the next pipe,
/// `Stop` retires the chain for this tick, `Done` advances the head past
/// this pipe and raises end-of-stream, `Break` stops the pass leaving the
/// head alone, and `NeedProcess` pins the head to this pipe so it runs
/// again next tick. Error codes make the pump rewind the chain through
/// [`IoPipe::handle_error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    Stop,
    Done,
    Break,
    NeedProcess,
    Error,
    NotImplemented,
    PreconditionNotMet,
    NoConnection,
    LostConnection,
    Expired,
}

impl Status {
    #[inline]
    pub fn is_error(self) -> bool {
        matches!(
            self,
            Status::Error
                | Status::NotImplemented
                | Status::PreconditionNotMet
                | Status::NoConnection
                | Status::LostConnection
                | Status::Expired
        )
    }

    #[inline]
    pub fn is_success(self) -> bool {
        !self.is_error()
    }

    /// Stable name of the status code for logs. Bijective over the enum.
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::Stop => "stop",
            Status::Done => "done",
            Status::Break => "break",
            Status::NeedProcess => "need_process",
            Status::Error => "error",
            Status::NotImplemented => "not_implemented",
            Status::PreconditionNotMet => "precondition_not_met",
            Status::NoConnection => "no_connection",
            Status::LostConnection => "lost_connection",
            Status::Expired => "expired",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

////////////////////////////////////////////////////////////////////////////////
// IoPipe
////////////////////////////////////////////////////////////////////////////////

/// One stage of stream processing.
///
/// Implementations behave like stateful signal processors: read from
/// `channels.input()`, write to `channels.output()`, and report what the
/// pump should do next. A pipe must not block; readers and writers drain
/// non-blocking descriptors and yield with a conditional instead.
pub trait IoPipe {
    fn process(
        &mut self,
        channels: Channels,
        buffer: &BufferPtr,
        eos: &mut bool,
        context: &mut Sd,
        pump: &mut PumpContext<'_>,
    ) -> Status;

    /// Offered to pipes behind a faulting pipe, in reverse chain order.
    /// Return [`Status::Ok`] to consume the error; returning it (or any
    /// other error) passes it further back.
    fn handle_error(&mut self, status: Status, _pump: &mut PumpContext<'_>) -> Status {
        status
    }

    /// Chains carrying a long-lived outbound request re-check this every
    /// tick; returning `false` retires the chain.
    fn is_valid(&self) -> bool {
        true
    }
}

/// Shared handle to a pipe. Chains hold their pipes through these, and a
/// pipe can be linked into several chains at once (the HTTP responder
/// moves the tail of its chain into a freshly built response chain).
pub type PipePtr = Rc<RefCell<dyn IoPipe>>;

/// Wrap a pipe value into a [`PipePtr`].
pub fn pipe_ptr(pipe: impl IoPipe + 'static) -> PipePtr {
    Rc::new(RefCell::new(pipe))
}

/// An ordered list of pipes, ready to be admitted to a pump.
pub type Chain = Vec<PipePtr>;

/// Builds a protocol chain for a freshly accepted connection.
///
/// The server socket pipe calls this with a context describing the remote
/// peer; the factory pushes its protocol pipes onto `chain` (a reader pipe
/// is already in front, a writer pipe is appended after).
pub trait ChainFactory {
    fn build(&self, chain: &mut Chain, context: &Sd) -> bool;
}

/// Adapter turning a closure into a [`ChainFactory`].
pub struct FnFactory<F>(pub F);

impl<F> ChainFactory for FnFactory<F>
where
    F: Fn(&mut Chain, &Sd) -> bool,
{
    fn build(&self, chain: &mut Chain, context: &Sd) -> bool {
        (self.0)(chain, context)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    const ALL: [Status; 11] = [
        Status::Ok,
        Status::Stop,
        Status::Done,
        Status::Break,
        Status::NeedProcess,
        Status::Error,
        Status::NotImplemented,
        Status::PreconditionNotMet,
        Status::NoConnection,
        Status::LostConnection,
        Status::Expired,
    ];

    #[test]
    fn status_strings_are_bijective() {
        let names: HashSet<&'static str> = ALL.iter().map(|s| s.as_str()).collect();
        assert_eq!(names.len(), ALL.len());
    }

    #[test]
    fn success_and_error_partition() {
        for status in ALL {
            assert_ne!(status.is_error(), status.is_success());
        }
        assert!(Status::Ok.is_success());
        assert!(Status::Expired.is_error());
    }
}
