//! Small building-block pipes.
//!
//! These are the glue pieces chains are assembled from: a head that just
//! raises end-of-stream, a delay, a pipe that spawns another chain, memory
//! injection and extraction, a sink, and the segment visitor that moves a
//! buffer from one channel to another without copying.

use crate::buffer::{Address, BufferArray, BufferPtr, Channels};
use crate::pipe::{Chain, IoPipe, pipe_ptr, Status};
use crate::pump::{Pump, PumpContext};
use crate::sd::Sd;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Chain head that drains the buffer: raises end-of-stream and lets the
/// rest of the chain run. Useful when all data is already in the buffer.
pub struct Flush;

impl IoPipe for Flush {
    fn process(
        &mut self,
        _channels: Channels,
        _buffer: &BufferPtr,
        eos: &mut bool,
        _context: &mut Sd,
        _pump: &mut PumpContext<'_>,
    ) -> Status {
        *eos = true;
        Status::Ok
    }
}

/// Holds its chain for a number of seconds using the pump's sleep
/// mechanism, then steps aside.
pub struct Sleep {
    seconds: f64,
}

impl Sleep {
    pub fn new(seconds: f64) -> Sleep {
        Sleep { seconds }
    }
}

impl IoPipe for Sleep {
    fn process(
        &mut self,
        _channels: Channels,
        _buffer: &BufferPtr,
        _eos: &mut bool,
        _context: &mut Sd,
        pump: &mut PumpContext<'_>,
    ) -> Status {
        if self.seconds > 0.0 {
            pump.sleep_chain(self.seconds);
            self.seconds = 0.0;
            return Status::Break;
        }
        Status::Done
    }
}

/// Adds a prebuilt chain to the pump, then is done.
pub struct AddChain {
    chain: Chain,
    timeout: f32,
}

impl AddChain {
    pub fn new(chain: Chain, timeout: f32) -> AddChain {
        AddChain { chain, timeout }
    }
}

impl IoPipe for AddChain {
    fn process(
        &mut self,
        _channels: Channels,
        _buffer: &BufferPtr,
        _eos: &mut bool,
        _context: &mut Sd,
        pump: &mut PumpContext<'_>,
    ) -> Status {
        pump.add_chain(std::mem::take(&mut self.chain), self.timeout);
        Status::Done
    }
}

/// Sink that ignores its input. Keeps a chain alive as its tail when the
/// output is deliberately discarded.
pub struct Null;

impl IoPipe for Null {
    fn process(
        &mut self,
        _channels: Channels,
        _buffer: &BufferPtr,
        _eos: &mut bool,
        _context: &mut Sd,
        _pump: &mut PumpContext<'_>,
    ) -> Status {
        Status::Ok
    }
}

/// Memory injector: emits a fixed byte string on its output channel and is
/// done.
pub struct StringInjector {
    data: Vec<u8>,
}

impl StringInjector {
    pub fn new(text: impl Into<Vec<u8>>) -> StringInjector {
        StringInjector { data: text.into() }
    }
}

impl IoPipe for StringInjector {
    fn process(
        &mut self,
        channels: Channels,
        buffer: &BufferPtr,
        _eos: &mut bool,
        _context: &mut Sd,
        _pump: &mut PumpContext<'_>,
    ) -> Status {
        if !self.data.is_empty() {
            buffer.borrow_mut().append(channels.output(), &self.data);
            self.data.clear();
        }
        Status::Done
    }
}

/// Accumulates everything on its input channel into a shared string and
/// reports done once end-of-stream is seen.
pub struct StringExtractor {
    string: Rc<RefCell<String>>,
    done: Rc<Cell<bool>>,
    last: Option<Address>,
}

impl StringExtractor {
    pub fn new() -> StringExtractor {
        StringExtractor {
            string: Rc::new(RefCell::new(String::new())),
            done: Rc::new(Cell::new(false)),
            last: None,
        }
    }

    /// Handle to the collected text, alive independently of the pipe.
    pub fn shared_string(&self) -> Rc<RefCell<String>> {
        self.string.clone()
    }

    /// Handle to the done flag.
    pub fn done_flag(&self) -> Rc<Cell<bool>> {
        self.done.clone()
    }
}

impl Default for StringExtractor {
    fn default() -> Self {
        StringExtractor::new()
    }
}

impl IoPipe for StringExtractor {
    fn process(
        &mut self,
        channels: Channels,
        buffer: &BufferPtr,
        eos: &mut bool,
        _context: &mut Sd,
        _pump: &mut PumpContext<'_>,
    ) -> Status {
        {
            let data = buffer.borrow();
            let mut chunk = [0u8; 1024];
            loop {
                let (n, last) = data.read_after(channels.input(), self.last, &mut chunk);
                if n == 0 {
                    break;
                }
                self.last = last;
                self.string
                    .borrow_mut()
                    .push_str(&String::from_utf8_lossy(&chunk[..n]));
            }
        }
        if *eos {
            self.done.set(true);
            Status::Done
        } else {
            Status::Ok
        }
    }
}

/// Segment visitor that rewrites every segment on one channel to another.
///
/// The HTTP header writer uses this to move a finished response body from
/// the request lane to the response lane in one pass, no bytes move.
pub struct ChangeChannel {
    from: i32,
    to: i32,
}

impl ChangeChannel {
    pub fn new(from: i32, to: i32) -> ChangeChannel {
        ChangeChannel { from, to }
    }

    pub fn apply(&self, buffer: &mut BufferArray) {
        for index in 0..buffer.segment_count() {
            if let Some(segment) = buffer.segment(index) {
                if segment.is_on_channel(self.from) {
                    buffer.set_segment_channel(index, self.to);
                }
            }
        }
    }
}

/// Schedule `chain` to be admitted after `in_seconds`, by pushing a
/// sleep + add-chain pair onto the pump now.
pub fn add_deferred_chain(
    pump: &mut Pump,
    in_seconds: f64,
    chain: Chain,
    chain_timeout: f32,
) -> bool {
    let sleep_chain: Chain = vec![
        pipe_ptr(Sleep::new(in_seconds)),
        pipe_ptr(AddChain::new(chain, chain_timeout)),
    ];
    // a little padding so the sleep itself cannot expire first
    pump.add_chain(sleep_chain, in_seconds as f32 + 10.0)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::pump::DEFAULT_CHAIN_EXPIRY_SECS;

    fn read_all(buffer: &BufferArray, channel: i32) -> Vec<u8> {
        let mut out = vec![0; buffer.count(channel)];
        buffer.read_after(channel, None, &mut out);
        out
    }

    #[test]
    fn change_channel_moves_segments() {
        let mut buffer = BufferArray::new();
        buffer.append(0, b"move me");
        buffer.append(1, b"stay");
        ChangeChannel::new(0, 7).apply(&mut buffer);
        assert_eq!(buffer.count(0), 0);
        assert_eq!(read_all(&buffer, 7), b"move me");
        assert_eq!(read_all(&buffer, 1), b"stay");
    }

    #[test]
    fn change_channel_is_idempotent() {
        let mut buffer = BufferArray::new();
        buffer.append(2, b"once");
        let visitor = ChangeChannel::new(2, 3);
        visitor.apply(&mut buffer);
        let after_once: Vec<_> = (0..buffer.segment_count())
            .map(|i| buffer.segment(i).unwrap())
            .collect();
        visitor.apply(&mut buffer);
        let after_twice: Vec<_> = (0..buffer.segment_count())
            .map(|i| buffer.segment(i).unwrap())
            .collect();
        assert_eq!(after_once, after_twice);
    }

    #[test]
    fn deferred_chain_runs_after_delay() {
        use std::time::{Duration, Instant};

        let mut pump = Pump::new();
        let extractor = StringExtractor::new();
        let done = extractor.done_flag();
        let inner: Chain = vec![
            pipe_ptr(StringInjector::new("deferred")),
            pipe_ptr(extractor),
        ];
        assert!(add_deferred_chain(
            &mut pump,
            0.05,
            inner,
            DEFAULT_CHAIN_EXPIRY_SECS
        ));
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(2) && !done.get() {
            pump.pump();
            pump.callback();
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(done.get());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
