//! The cooperative chain scheduler.
//!
//! A [`Pump`] owns ordered chains of pipes and drives them against an OS
//! readiness poll set. One [`Pump::pump`] call is a single tick: release
//! expired sleeps, admit pending chains, apply deferred lock clears, poll,
//! then walk every runnable chain translating each pipe's
//! [`Status`](crate::pipe::Status) into chain head motion. The hosting
//! application decides how often to tick and when to run the
//! [`Pump::callback`] cycle for deferred responses.
//!
//! Scheduling is single threaded and cooperative. The only cross-thread
//! re-entry points are [`LockClearer::clear`] for waking a locked chain
//! and filling a shared response slot before doing so.

use std::collections::{HashMap, HashSet};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use crate::buffer::{BufferArray, BufferPtr, Channels};
use crate::clock::{self, Countdown};
use crate::pipe::{Chain, IoPipe, PipePtr, Status};
use crate::sd::Sd;

/// The default (and fallback) expiration time for chains.
pub const DEFAULT_CHAIN_EXPIRY_SECS: f32 = 30.0;
/// Expiry for chains expected to finish almost immediately.
pub const SHORT_CHAIN_EXPIRY_SECS: f32 = 1.0;
/// Zero timeout: the chain never expires.
pub const NEVER_CHAIN_EXPIRY_SECS: f32 = 0.0;

/// Poll timeout used by [`Pump::pump`]. The core is single threaded, so
/// the tick never sleeps in the poll by default; embedders that dedicate a
/// thread to the pump pass their own timeout to
/// [`Pump::pump_with_timeout`].
pub const DEFAULT_POLL_TIMEOUT_MS: i32 = 0;

bitflags::bitflags! {
    /// Poll readiness and error events.
    pub struct Events: i16 {
        const IN = libc::POLLIN;
        const PRI = libc::POLLPRI;
        const OUT = libc::POLLOUT;
        const ERR = libc::POLLERR;
        const HUP = libc::POLLHUP;
        const NVAL = libc::POLLNVAL;
        const CHAIN_ERROR = Self::ERR.bits | Self::HUP.bits | Self::NVAL.bits;
    }
}

/// A poll descriptor a pipe asks to wait on.
#[derive(Clone, Copy, Debug)]
pub struct PollCond {
    pub fd: RawFd,
    pub events: Events,
}

/// One pipe of a chain together with its channel pair.
#[derive(Clone)]
pub struct Link {
    pub pipe: PipePtr,
    pub channels: Channels,
}

pub type Links = Vec<Link>;

/// Pause and resume commands for [`Pump::control`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Control {
    Pause,
    Resume,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunState {
    Normal,
    Pausing,
    Paused,
}

/// Cross-thread handle that releases chain locks.
///
/// Cloneable and `Send`; clearing is deferred, the key is applied at the
/// top of the pump's next tick.
#[derive(Clone)]
pub struct LockClearer {
    keys: Arc<Mutex<HashSet<i32>>>,
}

impl LockClearer {
    pub fn clear(&self, key: i32) {
        if key == 0 {
            return;
        }
        self.keys
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key);
    }
}

struct Sleeper {
    wake_at: f64,
    key: i32,
}

struct ChainState {
    id: u64,
    links: Links,
    data: BufferPtr,
    context: Sd,
    init: bool,
    head: usize,
    eos: bool,
    lock: i32,
    timer: Countdown,
    conditionals: Vec<(usize, PollCond)>,
    has_request: bool,
}

impl ChainState {
    fn set_timeout_seconds(&mut self, timeout: f32) {
        if timeout > 0.0 {
            self.timer.start_in(timeout as f64);
        } else {
            self.timer.stop();
        }
    }
}

/// Everything a running pipe may reach through its [`PumpContext`], kept
/// apart from the chain list so a chain can be processed while new chains,
/// sleeps and callbacks are being registered.
struct PumpSide {
    next_lock: i32,
    next_chain_id: u64,
    clear_locks: Arc<Mutex<HashSet<i32>>>,
    sleepers: Vec<Sleeper>,
    pending_chains: Vec<ChainState>,
    pending_callbacks: Vec<ChainState>,
    rebuild_pollset: bool,
}

impl PumpSide {
    fn next_chain_id(&mut self) -> u64 {
        self.next_chain_id += 1;
        self.next_chain_id
    }

    fn next_lock_key(&mut self) -> i32 {
        self.next_lock = self.next_lock.wrapping_add(1);
        if self.next_lock <= 0 {
            self.next_lock = 1;
        }
        self.next_lock
    }

    fn make_chain(
        &mut self,
        chain: Chain,
        timeout: f32,
        has_request: bool,
    ) -> Option<ChainState> {
        if chain.is_empty() {
            return None;
        }
        let data = BufferArray::new_ptr();
        let links = {
            let mut buffer = data.borrow_mut();
            chain
                .into_iter()
                .map(|pipe| Link {
                    pipe,
                    channels: buffer.next_channel(),
                })
                .collect()
        };
        let mut state = ChainState {
            id: self.next_chain_id(),
            links,
            data,
            context: Sd::Undef,
            init: false,
            head: 0,
            eos: false,
            lock: 0,
            timer: Countdown::new(),
            conditionals: Vec::new(),
            has_request,
        };
        state.set_timeout_seconds(timeout);
        Some(state)
    }

    fn make_link_chain(
        &mut self,
        links: Links,
        data: BufferPtr,
        context: Sd,
        timeout: f32,
    ) -> Option<ChainState> {
        if links.is_empty() {
            return None;
        }
        let mut state = ChainState {
            id: self.next_chain_id(),
            links,
            data,
            context,
            init: false,
            head: 0,
            eos: false,
            lock: 0,
            timer: Countdown::new(),
            conditionals: Vec::new(),
            has_request: false,
        };
        state.set_timeout_seconds(timeout);
        Some(state)
    }
}

struct PollEntry {
    chain_id: u64,
    link: usize,
    fd: RawFd,
    events: Events,
}

////////////////////////////////////////////////////////////////////////////////
// Pump
////////////////////////////////////////////////////////////////////////////////

pub struct Pump {
    state: RunState,
    running: Vec<ChainState>,
    callbacks: Vec<ChainState>,
    pollset: Vec<PollEntry>,
    side: PumpSide,
}

impl Default for Pump {
    fn default() -> Self {
        Pump::new()
    }
}

impl Pump {
    pub fn new() -> Pump {
        Pump {
            state: RunState::Normal,
            running: Vec::new(),
            callbacks: Vec::new(),
            pollset: Vec::new(),
            side: PumpSide {
                next_lock: 0,
                next_chain_id: 0,
                clear_locks: Arc::new(Mutex::new(HashSet::new())),
                sleepers: Vec::new(),
                pending_chains: Vec::new(),
                pending_callbacks: Vec::new(),
                rebuild_pollset: false,
            },
        }
    }

    /// Admit a chain of pipes. Channel pairs are issued in sequence, so
    /// each pipe's output feeds the next pipe's input. The chain starts on
    /// the next tick.
    pub fn add_chain(&mut self, chain: Chain, timeout: f32) -> bool {
        match self.side.make_chain(chain, timeout, false) {
            Some(state) => {
                debug!("adding chain {} with {} links", state.id, state.links.len());
                self.side.pending_chains.push(state);
                true
            }
            None => false,
        }
    }

    /// Like [`Pump::add_chain`] for chains carrying a long-lived outbound
    /// request: every tick the chain is re-checked against
    /// [`IoPipe::is_valid`](crate::pipe::IoPipe::is_valid) and retired as
    /// soon as any pipe reports invalid.
    pub fn add_request_chain(&mut self, chain: Chain, timeout: f32) -> bool {
        match self.side.make_chain(chain, timeout, true) {
            Some(state) => {
                debug!(
                    "adding request chain {} with {} links",
                    state.id,
                    state.links.len()
                );
                self.side.pending_chains.push(state);
                true
            }
            None => false,
        }
    }

    /// Admit a fully described chain: explicit channel assignments, a
    /// shared buffer and a context carried over from another chain.
    pub fn add_links(&mut self, links: Links, data: BufferPtr, context: Sd, timeout: f32) -> bool {
        match self.side.make_link_chain(links, data, context, timeout) {
            Some(state) => {
                self.side.pending_chains.push(state);
                true
            }
            None => false,
        }
    }

    /// Queue a one-shot response chain processed on the next
    /// [`Pump::callback`] call with end-of-stream set.
    pub fn respond(&mut self, pipe: PipePtr) -> bool {
        let data = BufferArray::new_ptr();
        let channels = data.borrow_mut().next_channel();
        let links = vec![Link { pipe, channels }];
        self.respond_links(links, data, Sd::Undef)
    }

    /// Queue a fully described one-shot response chain.
    pub fn respond_links(&mut self, links: Links, data: BufferPtr, context: Sd) -> bool {
        match self.side.make_link_chain(links, data, context, NEVER_CHAIN_EXPIRY_SECS) {
            Some(state) => {
                self.side.pending_callbacks.push(state);
                true
            }
            None => false,
        }
    }

    /// Ask the pump to release a lock at the top of the next tick.
    pub fn clear_lock(&self, key: i32) {
        self.lock_clearer().clear(key);
    }

    /// A `Send` handle other threads can use to release locks.
    pub fn lock_clearer(&self) -> LockClearer {
        LockClearer {
            keys: self.side.clear_locks.clone(),
        }
    }

    pub fn control(&mut self, op: Control) {
        match op {
            Control::Pause => self.state = RunState::Pausing,
            Control::Resume => self.state = RunState::Normal,
        }
    }

    /// Number of chains currently in the running set.
    pub fn running_chain_count(&self) -> usize {
        self.running.len()
    }

    /// One tick with the default poll timeout.
    pub fn pump(&mut self) {
        self.pump_with_timeout(DEFAULT_POLL_TIMEOUT_MS);
    }

    /// One tick. `poll_timeout_ms` is handed to the OS poll when any chain
    /// is waiting on a descriptor.
    pub fn pump_with_timeout(&mut self, poll_timeout_ms: i32) {
        // release sleeps that have come due
        let now = clock::monotonic();
        if !self.side.sleepers.is_empty() {
            let clear_locks = self.side.clear_locks.clone();
            self.side.sleepers.retain(|sleeper| {
                if sleeper.wake_at <= now {
                    clear_locks
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .insert(sleeper.key);
                    false
                } else {
                    true
                }
            });
        }

        if self.state == RunState::Pausing {
            self.state = RunState::Paused;
        }
        if self.state == RunState::Paused {
            return;
        }

        // admit pending chains
        self.running.append(&mut self.side.pending_chains);

        // apply deferred lock clears
        {
            let mut keys = self
                .side
                .clear_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !keys.is_empty() {
                for chain in &mut self.running {
                    if chain.lock != 0 && keys.contains(&chain.lock) {
                        chain.lock = 0;
                    }
                }
                keys.clear();
            }
        }

        if self.side.rebuild_pollset {
            self.rebuild_pollset();
            self.side.rebuild_pollset = false;
        }

        // poll what the chains are waiting on
        let mut signalled: HashMap<(u64, usize), Events> = HashMap::new();
        if !self.pollset.is_empty() {
            let mut fds: Vec<libc::pollfd> = self
                .pollset
                .iter()
                .map(|entry| libc::pollfd {
                    fd: entry.fd,
                    events: entry.events.bits(),
                    revents: 0,
                })
                .collect();
            let rc = unsafe {
                libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, poll_timeout_ms)
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    warn!("poll failed: {}", err);
                }
            } else if rc > 0 {
                for (entry, fd) in self.pollset.iter().zip(&fds) {
                    if fd.revents != 0 {
                        signalled.insert(
                            (entry.chain_id, entry.link),
                            Events::from_bits_truncate(fd.revents),
                        );
                    }
                }
            }
        }

        // process every runnable chain, in admission order
        let mut index = 0;
        while index < self.running.len() {
            let expired = {
                let chain = &self.running[index];
                chain.init && chain.timer.started() && chain.timer.expired()
            };
            if expired {
                if handle_chain_error(&mut self.running[index], &mut self.side, Status::Expired) {
                    let chain = &mut self.running[index];
                    if chain.timer.started() && chain.timer.expired() {
                        info!(
                            "error handler forgot to reset timeout, resetting to {} seconds",
                            DEFAULT_CHAIN_EXPIRY_SECS
                        );
                        chain.set_timeout_seconds(DEFAULT_CHAIN_EXPIRY_SECS);
                    }
                } else {
                    debug!("removing chain {} because it timed out", self.running[index].id);
                    self.remove_running_chain(index);
                    continue;
                }
            } else if chain_request_dead(&self.running[index]) {
                debug!(
                    "removing chain {} because its request is no longer valid",
                    self.running[index].id
                );
                self.remove_running_chain(index);
                continue;
            }

            if self.running[index].lock != 0 {
                index += 1;
                continue;
            }

            let mut process_this_chain = self.running[index].conditionals.is_empty();
            if !process_this_chain && !signalled.is_empty() {
                let id = self.running[index].id;
                let conditionals = self.running[index].conditionals.clone();
                for (link, _cond) in conditionals {
                    let revents = match signalled.get(&(id, link)) {
                        Some(revents) => *revents,
                        None => continue,
                    };
                    if revents.intersects(Events::CHAIN_ERROR) {
                        // If HUP was among the events report that, even if
                        // more errors are pending; the next tick picks
                        // those up.
                        let error = if revents.contains(Events::HUP) {
                            Status::LostConnection
                        } else {
                            Status::Error
                        };
                        if handle_chain_error(&mut self.running[index], &mut self.side, error) {
                            break;
                        }
                        warn!(
                            "removing chain {} because of poll events: {:?}",
                            id, revents
                        );
                        let chain = &mut self.running[index];
                        chain.head = chain.links.len();
                        break;
                    }
                    process_this_chain = true;
                    break;
                }
            }

            if process_this_chain {
                let chain = &mut self.running[index];
                if !chain.init {
                    chain.head = 0;
                    chain.init = true;
                }
                process_chain(chain, &mut self.side);
            }

            if self.running[index].head >= self.running[index].links.len() {
                debug!("removing chain {}, head reached the end", self.running[index].id);
                self.remove_running_chain(index);
                self.side.rebuild_pollset = true;
                continue;
            }
            index += 1;
        }
    }

    /// Run the queued one-shot response chains. Each is processed exactly
    /// once with end-of-stream set.
    pub fn callback(&mut self) {
        self.callbacks.append(&mut self.side.pending_callbacks);
        if self.callbacks.is_empty() {
            return;
        }
        let mut ready = std::mem::take(&mut self.callbacks);
        for chain in &mut ready {
            chain.head = 0;
            chain.init = true;
            chain.eos = true;
            process_chain(chain, &mut self.side);
        }
    }

    fn remove_running_chain(&mut self, index: usize) {
        if !self.running[index].conditionals.is_empty() {
            self.side.rebuild_pollset = true;
        }
        self.running.remove(index);
    }

    fn rebuild_pollset(&mut self) {
        self.pollset.clear();
        for chain in &self.running {
            for &(link, cond) in &chain.conditionals {
                self.pollset.push(PollEntry {
                    chain_id: chain.id,
                    link,
                    fd: cond.fd,
                    events: cond.events,
                });
            }
        }
    }
}

fn chain_request_dead(chain: &ChainState) -> bool {
    chain.has_request && chain.links.iter().any(|link| !link.pipe.borrow().is_valid())
}

/// Run a chain from its head, translating statuses into head motion.
fn process_chain(chain: &mut ChainState, side: &mut PumpSide) {
    let ChainState {
        links,
        data,
        context,
        head,
        eos,
        lock,
        timer,
        conditionals,
        ..
    } = chain;
    let end = links.len();
    let mut index = *head;
    if index >= end {
        return;
    }
    let mut need_process_signalled = false;
    loop {
        let pipe = links[index].pipe.clone();
        let channels = links[index].channels;
        let status = {
            let mut ctx = PumpContext {
                link: index,
                links: links.as_slice(),
                lock: &mut *lock,
                timer: &mut *timer,
                conditionals: &mut *conditionals,
                side: &mut *side,
            };
            pipe.borrow_mut().process(channels, data, eos, context, &mut ctx)
        };
        let mut keep_going = true;
        match status {
            Status::Ok => {}
            Status::Stop => {
                *head = end;
                keep_going = false;
            }
            Status::Done => {
                *head = index + 1;
                *eos = true;
            }
            Status::Break => {
                keep_going = false;
            }
            Status::NeedProcess => {
                if !need_process_signalled {
                    need_process_signalled = true;
                    *head = index;
                }
            }
            error => {
                info!("pump generated pipe error: '{}'", error);
                *head = index;
                keep_going = false;
                if !rewind_chain(links, lock, timer, conditionals, head, side, error) {
                    *head = end;
                }
            }
        }
        index += 1;
        if !keep_going || index >= end {
            break;
        }
    }
}

fn handle_chain_error(chain: &mut ChainState, side: &mut PumpSide, error: Status) -> bool {
    let ChainState {
        links,
        head,
        lock,
        timer,
        conditionals,
        ..
    } = chain;
    rewind_chain(links, lock, timer, conditionals, head, side, error)
}

/// Offer `error` to the pipes at and before the head, in reverse order.
/// A pipe that answers `Ok` consumes the error and becomes the point the
/// chain resumes from.
fn rewind_chain(
    links: &Links,
    lock: &mut i32,
    timer: &mut Countdown,
    conditionals: &mut Vec<(usize, PollCond)>,
    head: &mut usize,
    side: &mut PumpSide,
    error: Status,
) -> bool {
    let end = links.len();
    if end == 0 {
        return false;
    }
    let mut index = if *head >= end { end - 1 } else { *head };
    let mut error = error;
    let mut handled = false;
    loop {
        let pipe = links[index].pipe.clone();
        error = {
            let mut ctx = PumpContext {
                link: index,
                links,
                lock: &mut *lock,
                timer: &mut *timer,
                conditionals: &mut *conditionals,
                side: &mut *side,
            };
            pipe.borrow_mut().handle_error(error, &mut ctx)
        };
        match error {
            Status::Ok => {
                handled = true;
                *head = index + 1;
            }
            Status::Stop | Status::Done | Status::Break | Status::NeedProcess => break,
            Status::Expired => break,
            _ => {}
        }
        if handled || index == 0 {
            break;
        }
        index -= 1;
    }
    handled
}

////////////////////////////////////////////////////////////////////////////////
// PumpContext
////////////////////////////////////////////////////////////////////////////////

/// The pump as seen from inside a `process` call.
///
/// Everything a pipe may do to its own chain and to the scheduler goes
/// through here: installing conditionals, locking and sleeping the chain,
/// adjusting the deadline, spawning new chains and queueing callback
/// responses.
pub struct PumpContext<'a> {
    link: usize,
    links: &'a [Link],
    lock: &'a mut i32,
    timer: &'a mut Countdown,
    conditionals: &'a mut Vec<(usize, PollCond)>,
    side: &'a mut PumpSide,
}

impl PumpContext<'_> {
    /// Position of the currently running pipe within its chain.
    #[inline]
    pub fn current_link(&self) -> usize {
        self.link
    }

    /// Copy of the full link list of the current chain.
    pub fn current_links(&self) -> Links {
        self.links.to_vec()
    }

    /// Wait on (or stop waiting on, with `None`) a poll descriptor. The
    /// chain is then only processed when the descriptor signals, replacing
    /// any descriptor this pipe registered before.
    pub fn set_conditional(&mut self, poll: Option<PollCond>) {
        debug!(
            "setting conditional {:?} for link {}",
            poll.map(|p| p.events),
            self.link
        );
        let link = self.link;
        self.conditionals.retain(|(owner, _)| *owner != link);
        if let Some(cond) = poll {
            self.conditionals.push((link, cond));
        }
        self.side.rebuild_pollset = true;
    }

    /// Freeze the chain under a fresh key. The chain is skipped every tick
    /// until the key is cleared. Keys are strictly positive and never
    /// repeat until wrap.
    pub fn set_lock(&mut self) -> i32 {
        let key = self.side.next_lock_key();
        *self.lock = key;
        key
    }

    /// Deferred unlock, applied at the top of the next tick.
    pub fn clear_lock(&self, key: i32) {
        if key == 0 {
            return;
        }
        self.side
            .clear_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key);
    }

    /// A `Send` handle for releasing locks from other threads.
    pub fn lock_clearer(&self) -> LockClearer {
        LockClearer {
            keys: self.side.clear_locks.clone(),
        }
    }

    /// Lock the chain and schedule the release `seconds` from now.
    pub fn sleep_chain(&mut self, seconds: f64) -> bool {
        if seconds <= 0.0 {
            return false;
        }
        let key = self.set_lock();
        if key == 0 {
            return false;
        }
        self.side.sleepers.push(Sleeper {
            wake_at: clock::monotonic() + seconds,
            key,
        });
        true
    }

    /// Replace the current chain's deadline.
    pub fn set_timeout_seconds(&mut self, timeout: f32) {
        if timeout > 0.0 {
            self.timer.start_in(timeout as f64);
        } else {
            self.timer.stop();
        }
    }

    /// Shift the current chain's deadline.
    pub fn adjust_timeout_seconds(&mut self, delta: f32) {
        self.timer.adjust(delta as f64);
    }

    /// Admit a new chain, starting on the next tick.
    pub fn add_chain(&mut self, chain: Chain, timeout: f32) -> bool {
        match self.side.make_chain(chain, timeout, false) {
            Some(state) => {
                debug!("adding chain {} with {} links", state.id, state.links.len());
                self.side.pending_chains.push(state);
                true
            }
            None => false,
        }
    }

    /// Admit a fully described chain, starting on the next tick.
    pub fn add_links(
        &mut self,
        links: Links,
        data: BufferPtr,
        context: Sd,
        timeout: f32,
    ) -> bool {
        match self.side.make_link_chain(links, data, context, timeout) {
            Some(state) => {
                self.side.pending_chains.push(state);
                true
            }
            None => false,
        }
    }

    /// Queue a one-shot response chain for the next callback cycle.
    pub fn respond_links(&mut self, links: Links, data: BufferPtr, context: Sd) -> bool {
        match self
            .side
            .make_link_chain(links, data, context, NEVER_CHAIN_EXPIRY_SECS)
        {
            Some(state) => {
                self.side.pending_callbacks.push(state);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::pipe::{pipe_ptr, IoPipe};
    use crate::util::{Flush, Null, Sleep, StringExtractor, StringInjector};

    fn pump_until(pump: &mut Pump, mut done: impl FnMut() -> bool, limit: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < limit {
            pump.pump();
            pump.callback();
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        done()
    }

    #[test]
    fn empty_chain_is_rejected() {
        let mut pump = Pump::new();
        assert!(!pump.add_chain(Vec::new(), DEFAULT_CHAIN_EXPIRY_SECS));
    }

    #[test]
    fn flush_and_extract_empty_stream() {
        let mut pump = Pump::new();
        let extractor = StringExtractor::new();
        let done = extractor.done_flag();
        let text = extractor.shared_string();
        pump.add_chain(
            vec![pipe_ptr(Flush), pipe_ptr(extractor)],
            DEFAULT_CHAIN_EXPIRY_SECS,
        );
        assert!(pump_until(&mut pump, || done.get(), Duration::from_secs(2)));
        assert_eq!(text.borrow().as_str(), "");
        // the finished chain leaves the running set
        pump.pump();
        assert_eq!(pump.running_chain_count(), 0);
    }

    #[test]
    fn injector_feeds_extractor() {
        let mut pump = Pump::new();
        let extractor = StringExtractor::new();
        let done = extractor.done_flag();
        let text = extractor.shared_string();
        pump.add_chain(
            vec![
                pipe_ptr(StringInjector::new("the quick brown fox")),
                pipe_ptr(extractor),
            ],
            DEFAULT_CHAIN_EXPIRY_SECS,
        );
        assert!(pump_until(&mut pump, || done.get(), Duration::from_secs(2)));
        assert_eq!(text.borrow().as_str(), "the quick brown fox");
    }

    #[test]
    fn chain_expiry_removes_chain() {
        let mut pump = Pump::new();
        // a Null pipe never finishes, the timeout has to reap the chain
        pump.add_chain(vec![pipe_ptr(Null)], 0.05);
        pump.pump();
        assert_eq!(pump.running_chain_count(), 1);
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(2) && pump.running_chain_count() > 0 {
            pump.pump();
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pump.running_chain_count(), 0);
    }

    #[test]
    fn never_expiry_chain_survives() {
        let mut pump = Pump::new();
        pump.add_chain(vec![pipe_ptr(Null)], NEVER_CHAIN_EXPIRY_SECS);
        for _ in 0..5 {
            pump.pump();
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pump.running_chain_count(), 1);
    }

    #[test]
    fn sleep_delays_the_chain() {
        let mut pump = Pump::new();
        let extractor = StringExtractor::new();
        let done = extractor.done_flag();
        pump.add_chain(
            vec![
                pipe_ptr(Sleep::new(0.05)),
                pipe_ptr(StringInjector::new("later")),
                pipe_ptr(extractor),
            ],
            DEFAULT_CHAIN_EXPIRY_SECS,
        );
        let start = Instant::now();
        assert!(pump_until(&mut pump, || done.get(), Duration::from_secs(2)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn locked_chain_is_skipped_until_cleared() {
        struct Locker {
            key: std::rc::Rc<std::cell::Cell<i32>>,
            calls: std::rc::Rc<std::cell::Cell<u32>>,
        }
        impl IoPipe for Locker {
            fn process(
                &mut self,
                _channels: Channels,
                _buffer: &BufferPtr,
                _eos: &mut bool,
                _context: &mut Sd,
                pump: &mut PumpContext<'_>,
            ) -> Status {
                self.calls.set(self.calls.get() + 1);
                if self.key.get() == 0 {
                    self.key.set(pump.set_lock());
                    return Status::Break;
                }
                Status::Done
            }
        }

        let mut pump = Pump::new();
        let key = std::rc::Rc::new(std::cell::Cell::new(0));
        let calls = std::rc::Rc::new(std::cell::Cell::new(0));
        pump.add_chain(
            vec![pipe_ptr(Locker {
                key: key.clone(),
                calls: calls.clone(),
            })],
            DEFAULT_CHAIN_EXPIRY_SECS,
        );
        pump.pump();
        assert_eq!(calls.get(), 1);
        assert!(key.get() > 0);
        // locked: more ticks do not reach the pipe
        pump.pump();
        pump.pump();
        assert_eq!(calls.get(), 1);

        pump.clear_lock(key.get());
        pump.pump();
        assert_eq!(calls.get(), 2);
        pump.pump();
        assert_eq!(pump.running_chain_count(), 0);
    }

    #[test]
    fn pause_and_resume() {
        let mut pump = Pump::new();
        let extractor = StringExtractor::new();
        let done = extractor.done_flag();
        pump.control(Control::Pause);
        pump.add_chain(
            vec![pipe_ptr(Flush), pipe_ptr(extractor)],
            DEFAULT_CHAIN_EXPIRY_SECS,
        );
        for _ in 0..3 {
            pump.pump();
        }
        assert!(!done.get());
        pump.control(Control::Resume);
        assert!(pump_until(&mut pump, || done.get(), Duration::from_secs(2)));
    }

    #[test]
    fn chains_admitted_in_order() {
        let mut pump = Pump::new();
        let first = StringExtractor::new();
        let second = StringExtractor::new();
        let first_done = first.done_flag();
        let second_done = second.done_flag();
        pump.add_chain(vec![pipe_ptr(Flush), pipe_ptr(first)], 5.0);
        pump.add_chain(vec![pipe_ptr(Flush), pipe_ptr(second)], 5.0);
        pump.pump();
        // both ran on the same tick, admission order is FIFO
        assert!(first_done.get());
        assert!(second_done.get());
    }
}
