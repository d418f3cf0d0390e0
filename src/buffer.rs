//! Scatter-gather byte buffers for the I/O chains.
//!
//! A [`BufferArray`] owns a list of fixed size heap blocks and an ordered
//! list of [`Segment`]s pointing into them. Bytes never move once they are
//! copied into a block, pipes hand each other data by creating, splitting
//! and re-channeling segments instead of copying payloads around.
//!
//! Positions inside a buffer array are [`Address`]es, a (block, offset)
//! pair. An address stays valid for the life of the buffer array no matter
//! how the segment list is rearranged, which is what lets a pipe remember
//! "the last byte I consumed" across `process` calls.

use std::cell::RefCell;
use std::rc::Rc;

/// Size of a heap block allocated when no existing block has room.
pub const DEFAULT_BLOCK_SIZE: usize = 16384;

/// Shared handle to a buffer array, one per chain.
pub type BufferPtr = Rc<RefCell<BufferArray>>;

////////////////////////////////////////////////////////////////////////////////
// Channels
////////////////////////////////////////////////////////////////////////////////

/// Channel descriptor set for one pipe: an input lane and an output lane.
///
/// Descriptors are triples of consecutive integers starting at a base
/// issued by [`BufferArray::next_channel`]; the third (error) lane is
/// reserved but unused.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Channels {
    base: i32,
}

impl Channels {
    #[inline]
    pub fn new(base: i32) -> Channels {
        Channels { base }
    }

    #[inline]
    pub fn input(&self) -> i32 {
        self.base
    }

    #[inline]
    pub fn output(&self) -> i32 {
        self.base + 1
    }

    /// Descriptor set whose input is the output of `channels`. Chaining one
    /// pipe's output into the next pipe's input is exactly this.
    #[inline]
    pub fn consumer_of(channels: Channels) -> Channels {
        Channels::new(channels.output())
    }
}

////////////////////////////////////////////////////////////////////////////////
// Address and Segment
////////////////////////////////////////////////////////////////////////////////

/// Position of one byte inside a buffer array.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Address {
    block: usize,
    offset: usize,
}

/// A contiguous run of bytes on one channel inside a single block.
///
/// Segments are lightweight views, they do not own storage. Two segments
/// are equal when they cover the same byte range on the same channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    channel: i32,
    block: usize,
    offset: usize,
    len: usize,
}

impl Segment {
    #[inline]
    pub fn channel(&self) -> i32 {
        self.channel
    }

    #[inline]
    pub fn is_on_channel(&self, channel: i32) -> bool {
        self.channel == channel
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address of the byte at `index` within this segment.
    #[inline]
    pub fn address_at(&self, index: usize) -> Address {
        debug_assert!(index < self.len);
        Address {
            block: self.block,
            offset: self.offset + index,
        }
    }

    #[inline]
    pub fn first_address(&self) -> Address {
        self.address_at(0)
    }

    #[inline]
    pub fn last_address(&self) -> Address {
        self.address_at(self.len - 1)
    }

    fn contains(&self, address: Address) -> bool {
        address.block == self.block
            && address.offset >= self.offset
            && address.offset < self.offset + self.len
    }
}

////////////////////////////////////////////////////////////////////////////////
// HeapBuffer
////////////////////////////////////////////////////////////////////////////////

/// A fixed capacity heap block with a bump allocator.
///
/// A block only ever hands out a contiguous prefix; carved space is not
/// reclaimed until the whole buffer array is dropped.
#[derive(Debug)]
pub struct HeapBuffer {
    data: Box<[u8]>,
    next_free: usize,
}

impl HeapBuffer {
    pub fn new() -> HeapBuffer {
        HeapBuffer::with_size(DEFAULT_BLOCK_SIZE)
    }

    pub fn with_size(size: usize) -> HeapBuffer {
        HeapBuffer {
            data: vec![0; size].into_boxed_slice(),
            next_free: 0,
        }
    }

    #[inline]
    pub fn bytes_left(&self) -> usize {
        self.data.len() - self.next_free
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Carve up to `size` bytes off the free tail. Returns a shorter run
    /// when less space is left, `None` when the block is full.
    fn carve(&mut self, size: usize) -> Option<(usize, usize)> {
        let actual = size.min(self.bytes_left());
        if actual == 0 {
            return None;
        }
        let offset = self.next_free;
        self.next_free += actual;
        Some((offset, actual))
    }
}

impl Default for HeapBuffer {
    fn default() -> Self {
        HeapBuffer::new()
    }
}

////////////////////////////////////////////////////////////////////////////////
// BufferArray
////////////////////////////////////////////////////////////////////////////////

/// Ordered segments over a set of heap blocks.
///
/// Segment order defines the byte order on every channel: reading channel
/// `k` walks the segment list in order, skipping segments on other
/// channels.
#[derive(Debug, Default)]
pub struct BufferArray {
    next_base_channel: i32,
    blocks: Vec<HeapBuffer>,
    segments: Vec<Segment>,
}

impl BufferArray {
    pub fn new() -> BufferArray {
        BufferArray::default()
    }

    pub fn new_ptr() -> BufferPtr {
        Rc::new(RefCell::new(BufferArray::new()))
    }

    /// Issue the next channel descriptor set for this buffer.
    pub fn next_channel(&mut self) -> Channels {
        let channels = Channels::new(self.next_base_channel);
        self.next_base_channel += 1;
        channels
    }

    /// Total bytes allocated in blocks. A debugging aid, not an accounting
    /// of usable space.
    pub fn capacity(&self) -> usize {
        self.blocks.iter().map(HeapBuffer::capacity).sum()
    }

    /// Copy `src` onto the end of the logical stream on `channel`.
    pub fn append(&mut self, channel: i32, src: &[u8]) -> bool {
        let mut segments = Vec::new();
        if self.copy_into_buffers(channel, src, &mut segments) {
            self.segments.extend(segments);
            true
        } else {
            false
        }
    }

    /// Copy `src` in front of the logical stream on `channel`.
    pub fn prepend(&mut self, channel: i32, src: &[u8]) -> bool {
        let mut segments = Vec::new();
        if self.copy_into_buffers(channel, src, &mut segments) {
            self.segments.splice(0..0, segments);
            true
        } else {
            false
        }
    }

    /// Copy `src` into new segments placed just after segment `index`.
    /// An index at or past the end appends.
    pub fn insert_after(&mut self, index: usize, channel: i32, src: &[u8]) -> bool {
        let position = if index >= self.segments.len() {
            self.segments.len()
        } else {
            index + 1
        };
        let mut segments = Vec::new();
        if self.copy_into_buffers(channel, src, &mut segments) {
            self.segments.splice(position..position, segments);
            true
        } else {
            false
        }
    }

    /// Bytes on `channel`, counting from the beginning.
    pub fn count(&self, channel: i32) -> usize {
        self.count_after(channel, None)
    }

    /// Bytes on `channel` strictly after `start`. `None` counts everything.
    pub fn count_after(&self, channel: i32, start: Option<Address>) -> usize {
        let mut count = 0;
        let mut offset = 0;
        let mut index = 0;
        if let Some(address) = start {
            let found = match self.segment_index(address) {
                Some(found) => found,
                None => return 0,
            };
            let segment = &self.segments[found];
            if address.offset + 1 < segment.offset + segment.len {
                // more bytes in the same segment
                offset = address.offset + 1 - segment.offset;
                index = found;
            } else if found + 1 >= self.segments.len() {
                return 0;
            } else {
                index = found + 1;
            }
        }
        for segment in &self.segments[index..] {
            if segment.is_on_channel(channel) {
                count += segment.len - offset;
            }
            offset = 0;
        }
        count
    }

    /// Copy up to `dest.len()` bytes of `channel` data strictly after
    /// `start` into `dest`. Returns how many bytes were copied and the
    /// address of the last copied byte (or `start` when nothing was).
    pub fn read_after(
        &self,
        channel: i32,
        start: Option<Address>,
        dest: &mut [u8],
    ) -> (usize, Option<Address>) {
        let mut copied = 0;
        let mut last = start;
        if dest.is_empty() {
            return (copied, last);
        }
        let mut index = 0;
        if let Some(address) = start {
            let found = match self.segment_index(address) {
                Some(found) => found,
                None => return (copied, last),
            };
            let segment = self.segments[found];
            index = found + 1;
            if address.offset + 1 < segment.offset + segment.len
                && segment.is_on_channel(channel)
            {
                // drain the tail of the start segment first
                let from = address.offset + 1 - segment.offset;
                let available = segment.len - from;
                let take = available.min(dest.len());
                let bytes = self.segment_bytes(&segment);
                dest[..take].copy_from_slice(&bytes[from..from + take]);
                copied = take;
                last = Some(Address {
                    block: segment.block,
                    offset: address.offset + take,
                });
            }
        }
        while copied < dest.len() && index < self.segments.len() {
            let segment = self.segments[index];
            if !segment.is_on_channel(channel) {
                index += 1;
                continue;
            }
            let take = segment.len.min(dest.len() - copied);
            let bytes = self.segment_bytes(&segment);
            dest[copied..copied + take].copy_from_slice(&bytes[..take]);
            copied += take;
            last = Some(segment.address_at(take - 1));
            index += 1;
        }
        (copied, last)
    }

    /// Move `delta` bytes along `channel` from `start`.
    ///
    /// `delta == 0` resolves the start itself: `Begin` gives the first byte
    /// of the channel, `End` gives the address one past the last byte, and
    /// an explicit address is returned unchanged when it is on the channel
    /// and `None` when it is not. With a nonzero `delta`, a start address
    /// that is not on the channel comes back unmoved. Seeking past either
    /// end of the channel gives `None`.
    pub fn seek(&self, channel: i32, start: SeekStart, delta: i64) -> Option<Address> {
        if delta == 0 {
            return match start {
                SeekStart::End => self.end_address(channel),
                SeekStart::Begin => self
                    .segments
                    .iter()
                    .find(|s| s.is_on_channel(channel))
                    .map(Segment::first_address),
                SeekStart::At(address) => {
                    let index = self.segment_index(address)?;
                    if self.segments[index].is_on_channel(channel) {
                        Some(address)
                    } else {
                        None
                    }
                }
            };
        }

        let mut remaining = delta;
        let mut position = None;
        let mut index;
        match start {
            SeekStart::At(address) => {
                index = self.segment_index(address)?;
                let segment = self.segments[index];
                if !segment.is_on_channel(channel) {
                    return Some(address);
                }
                if delta > 0 {
                    let in_segment = (segment.offset + segment.len - address.offset) as i64;
                    let local = remaining.min(in_segment);
                    position = Some(Address {
                        block: address.block,
                        offset: address.offset + local as usize,
                    });
                    remaining -= local;
                    index += 1;
                } else {
                    let in_segment = (address.offset - segment.offset) as i64;
                    let local = remaining.abs().min(in_segment);
                    position = Some(Address {
                        block: address.block,
                        offset: address.offset - local as usize,
                    });
                    remaining += local;
                }
            }
            SeekStart::Begin => {
                if delta < 0 {
                    return None;
                }
                index = 0;
            }
            SeekStart::End => {
                if delta > 0 {
                    return None;
                }
                index = self.segments.len();
            }
        }

        if remaining > 0 {
            // forward over whole segments
            while remaining > 0 && index < self.segments.len() {
                let segment = self.segments[index];
                index += 1;
                if !segment.is_on_channel(channel) {
                    continue;
                }
                if remaining <= segment.len as i64 {
                    position = Some(Address {
                        block: segment.block,
                        offset: segment.offset + remaining as usize,
                    });
                }
                remaining -= segment.len as i64;
            }
            if remaining > 0 {
                return None;
            }
        } else if remaining < 0 {
            // backward over whole segments before `index`
            let mut rindex = index;
            while remaining < 0 && rindex > 0 {
                rindex -= 1;
                let segment = self.segments[rindex];
                if !segment.is_on_channel(channel) {
                    continue;
                }
                if remaining.abs() <= segment.len as i64 {
                    position = Some(Address {
                        block: segment.block,
                        offset: segment.offset + (segment.len as i64 + remaining) as usize,
                    });
                    remaining = 0;
                } else {
                    remaining += segment.len as i64;
                }
            }
            if remaining < 0 {
                return None;
            }
        }
        position
    }

    /// Strip all blocks and segments out of `source` and append them to
    /// this array. Afterwards `source` is empty and ready for reuse.
    pub fn take_contents(&mut self, source: &mut BufferArray) -> bool {
        let block_base = self.blocks.len();
        self.blocks.append(&mut source.blocks);
        self.segments.extend(source.segments.drain(..).map(|mut segment| {
            segment.block += block_base;
            segment
        }));
        source.next_base_channel = 0;
        true
    }

    /// Split the segment containing `address` so that `address` becomes the
    /// last byte of the first half. When it already is the last byte no
    /// split happens. Returns the index of the (possibly unchanged) first
    /// half. Never creates zero length segments.
    pub fn split_after(&mut self, address: Address) -> Option<usize> {
        let index = self.segment_index(address)?;
        let segment = self.segments[index];
        if address.offset == segment.offset + segment.len - 1 {
            return Some(index);
        }
        let first_len = address.offset - segment.offset + 1;
        let second = Segment {
            channel: segment.channel,
            block: segment.block,
            offset: address.offset + 1,
            len: segment.len - first_len,
        };
        self.segments[index].len = first_len;
        self.segments.insert(index + 1, second);
        Some(index)
    }

    #[inline]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    #[inline]
    pub fn segment(&self, index: usize) -> Option<Segment> {
        self.segments.get(index).copied()
    }

    pub fn set_segment_channel(&mut self, index: usize, channel: i32) {
        if let Some(segment) = self.segments.get_mut(index) {
            segment.channel = channel;
        }
    }

    /// Index of the segment holding `address`.
    pub fn segment_index(&self, address: Address) -> Option<usize> {
        self.segments.iter().position(|s| s.contains(address))
    }

    /// Largest linear view strictly after `address`, along with the index
    /// of the segment backing it. `None` for `address` starts at the first
    /// segment. The view equals the backing segment except when `address`
    /// points into the middle of one, then it starts one byte past it.
    pub fn construct_segment_after(&self, address: Option<Address>) -> Option<(usize, Segment)> {
        let address = match address {
            None => return self.segments.first().map(|s| (0, *s)),
            Some(address) => address,
        };
        let index = self.segment_index(address)?;
        let segment = self.segments[index];
        if address.offset + 1 < segment.offset + segment.len {
            let skip = address.offset + 1 - segment.offset;
            let sub = Segment {
                channel: segment.channel,
                block: segment.block,
                offset: address.offset + 1,
                len: segment.len - skip,
            };
            Some((index, sub))
        } else {
            self.segments.get(index + 1).map(|s| (index + 1, *s))
        }
    }

    /// Carve a new writable segment of up to `len` bytes at the end of the
    /// array. Blocks are tried from the newest backwards since that is
    /// where the free space lives; a new default sized block is allocated
    /// when none has room. Returns the index of the new segment.
    pub fn make_segment(&mut self, channel: i32, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        let mut carved = None;
        for (block_index, block) in self.blocks.iter_mut().enumerate().rev() {
            if let Some((offset, actual)) = block.carve(len) {
                carved = Some((block_index, offset, actual));
                break;
            }
        }
        let (block, offset, actual) = match carved {
            Some(found) => found,
            None => {
                self.blocks.push(HeapBuffer::new());
                let block_index = self.blocks.len() - 1;
                let (offset, actual) = self.blocks[block_index].carve(len)?;
                (block_index, offset, actual)
            }
        };
        self.segments.push(Segment {
            channel,
            block,
            offset,
            len: actual,
        });
        Some(self.segments.len() - 1)
    }

    /// Drop the segment from the ordering. The bytes stay carved out of
    /// their block until the whole array goes away.
    pub fn erase_segment(&mut self, index: usize) -> bool {
        if index < self.segments.len() {
            self.segments.remove(index);
            true
        } else {
            false
        }
    }

    /// Bytes backing `segment`.
    pub fn segment_bytes(&self, segment: &Segment) -> &[u8] {
        &self.blocks[segment.block].data[segment.offset..segment.offset + segment.len]
    }

    pub(crate) fn segment_bytes_mut(&mut self, segment: &Segment) -> &mut [u8] {
        &mut self.blocks[segment.block].data[segment.offset..segment.offset + segment.len]
    }

    /// Shrink segment `index` to its first `len` bytes, dropping it
    /// entirely when `len` is zero. Used by writers to return the unused
    /// tail of a freshly made segment.
    pub(crate) fn truncate_segment(&mut self, index: usize, len: usize) {
        if len == 0 {
            self.erase_segment(index);
        } else if let Some(segment) = self.segments.get_mut(index) {
            debug_assert!(len <= segment.len);
            segment.len = len;
        }
    }

    /// Address one past the last byte on `channel`.
    fn end_address(&self, channel: i32) -> Option<Address> {
        self.segments
            .iter()
            .rev()
            .find(|s| s.is_on_channel(channel))
            .map(|s| Address {
                block: s.block,
                offset: s.offset + s.len,
            })
    }

    /// Copy `src` into as many segments as it takes, filling free space in
    /// existing blocks first and allocating new ones as needed. On an
    /// allocation-then-carve failure the array stays usable but the copy is
    /// incomplete and `false` is returned.
    fn copy_into_buffers(
        &mut self,
        channel: i32,
        src: &[u8],
        segments: &mut Vec<Segment>,
    ) -> bool {
        if src.is_empty() {
            return false;
        }
        let mut copied = 0;
        for (block_index, block) in self.blocks.iter_mut().enumerate() {
            if copied == src.len() {
                break;
            }
            let (offset, actual) = match block.carve(src.len() - copied) {
                Some(carved) => carved,
                None => continue,
            };
            block.data[offset..offset + actual].copy_from_slice(&src[copied..copied + actual]);
            segments.push(Segment {
                channel,
                block: block_index,
                offset,
                len: actual,
            });
            copied += actual;
        }
        while copied < src.len() {
            self.blocks.push(HeapBuffer::new());
            let block_index = self.blocks.len() - 1;
            let block = &mut self.blocks[block_index];
            let (offset, actual) = match block.carve(src.len() - copied) {
                Some(carved) => carved,
                None => return false,
            };
            block.data[offset..offset + actual].copy_from_slice(&src[copied..copied + actual]);
            segments.push(Segment {
                channel,
                block: block_index,
                offset,
                len: actual,
            });
            copied += actual;
        }
        true
    }
}

/// Where a [`BufferArray::seek`] starts from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekStart {
    /// Before the first byte of the channel.
    Begin,
    /// After the last byte of the channel.
    End,
    At(Address),
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn read_all(buffer: &BufferArray, channel: i32) -> Vec<u8> {
        let mut out = vec![0; buffer.count(channel)];
        let (n, _) = buffer.read_after(channel, None, &mut out);
        assert_eq!(n, out.len());
        out
    }

    #[test]
    fn count_matches_appends() {
        let mut buffer = BufferArray::new();
        let mut expected = 0;
        for chunk in ["abc", "", "defghij", "k"] {
            buffer.append(0, chunk.as_bytes());
            expected += chunk.len();
        }
        assert_eq!(buffer.count(0), expected);
        assert_eq!(buffer.count(1), 0);
    }

    #[test]
    fn appends_and_prepends_keep_channel_order() {
        let mut buffer = BufferArray::new();
        assert!(buffer.append(0, b"in "));
        assert!(buffer.append(1, b"interleaved"));
        assert!(buffer.append(0, b"the trunk"));
        assert!(buffer.prepend(0, b"junk "));
        assert_eq!(read_all(&buffer, 0), b"junk in the trunk");
        assert_eq!(read_all(&buffer, 1), b"interleaved");
    }

    #[test]
    fn insert_after_splices_between_segments() {
        let mut buffer = BufferArray::new();
        buffer.append(0, b"head ");
        buffer.append(0, b"tail");
        assert!(buffer.insert_after(0, 0, b"middle "));
        assert_eq!(read_all(&buffer, 0), b"head middle tail");
        // an index past the end appends
        assert!(buffer.insert_after(99, 0, b" end"));
        assert_eq!(read_all(&buffer, 0), b"head middle tail end");
    }

    #[test]
    fn empty_append_fails() {
        let mut buffer = BufferArray::new();
        assert!(!buffer.append(0, b""));
        assert!(!buffer.prepend(0, b""));
    }

    #[test]
    fn large_append_spans_blocks() {
        let mut buffer = BufferArray::new();
        let big = vec![0xA5u8; DEFAULT_BLOCK_SIZE * 2 + 17];
        assert!(buffer.append(3, &big));
        assert!(buffer.segment_count() >= 3);
        assert_eq!(buffer.count(3), big.len());
        assert_eq!(read_all(&buffer, 3), big);
        for index in 0..buffer.segment_count() {
            assert!(buffer.segment(index).unwrap().len() >= 1);
        }
    }

    #[test]
    fn read_and_seek_through_the_trunk() {
        let mut buffer = BufferArray::new();
        buffer.append(0, b"junk in ");
        buffer.append(0, b"the trunk");

        let mut dest = [0u8; 11];
        let (n, last) = buffer.read_after(0, None, &mut dest);
        assert_eq!(n, 11);
        assert_eq!(&dest, b"junk in the");

        let mid = buffer.seek(0, SeekStart::At(last.unwrap()), -6).unwrap();
        let mut dest = [0u8; 12];
        let (n, _) = buffer.read_after(0, Some(mid), &mut dest);
        assert_eq!(n, 12);
        assert_eq!(&dest, b"in the trunk");
    }

    #[test]
    fn split_after_zippity() {
        let mut buffer = BufferArray::new();
        buffer.append(0, b"zippity do da!");

        let mut dest = [0u8; 7];
        let (n, last) = buffer.read_after(0, None, &mut dest);
        assert_eq!(n, 7);

        let first = buffer.split_after(last.unwrap()).unwrap();
        assert_eq!(buffer.segment_count(), 2);
        let head = buffer.segment(first).unwrap();
        let tail = buffer.segment(first + 1).unwrap();
        assert_eq!(buffer.segment_bytes(&head), b"zippity");
        assert_eq!(buffer.segment_bytes(&tail), b" do da!");
        assert!(head.is_on_channel(0));
        assert!(tail.is_on_channel(0));
        // the two halves are adjacent
        assert_eq!(
            buffer.seek(0, SeekStart::At(head.last_address()), 1),
            Some(tail.first_address())
        );
    }

    #[test]
    fn split_at_last_byte_is_a_no_op() {
        let mut buffer = BufferArray::new();
        buffer.append(0, b"abc");
        let last = buffer.segment(0).unwrap().last_address();
        let index = buffer.split_after(last).unwrap();
        assert_eq!(index, 0);
        assert_eq!(buffer.segment_count(), 1);
    }

    #[test]
    fn seek_edge_cases() {
        let mut buffer = BufferArray::new();
        buffer.append(0, b"hello");
        buffer.append(1, b"world");

        // delta 0 from Begin is the first byte of the channel
        let first = buffer.seek(0, SeekStart::Begin, 0).unwrap();
        assert_eq!(first, buffer.segment(0).unwrap().first_address());

        // delta 0 from End is one past the last byte
        let end = buffer.seek(0, SeekStart::End, 0).unwrap();
        assert_eq!(buffer.seek(0, SeekStart::At(first), 5), Some(end));

        // address on the wrong channel: None for delta 0, unmoved otherwise
        let other = buffer.seek(1, SeekStart::Begin, 0).unwrap();
        assert_eq!(buffer.seek(0, SeekStart::At(other), 0), None);
        assert_eq!(buffer.seek(0, SeekStart::At(other), 2), Some(other));

        // seeking past either end fails
        assert_eq!(buffer.seek(0, SeekStart::Begin, 6), None);
        assert_eq!(buffer.seek(0, SeekStart::Begin, -1), None);
        assert_eq!(buffer.seek(0, SeekStart::End, 1), None);
        assert_eq!(buffer.seek(0, SeekStart::End, -6), None);

        // walking backward from the end recovers the first byte
        assert_eq!(buffer.seek(0, SeekStart::End, -5), Some(first));
    }

    #[test]
    fn seek_skips_other_channels() {
        let mut buffer = BufferArray::new();
        buffer.append(0, b"ab");
        buffer.append(1, b"zzzz");
        buffer.append(0, b"cd");
        let first = buffer.seek(0, SeekStart::Begin, 0).unwrap();
        let past_ab = buffer.seek(0, SeekStart::At(first), 2).unwrap();
        let mut dest = [0u8; 2];
        // everything on channel 0 after the first two bytes is "cd"
        let (n, _) = buffer.read_after(0, Some(past_ab), &mut dest);
        assert_eq!(n, 2);
        assert_eq!(&dest, b"cd");
    }

    #[test]
    fn take_contents_is_a_left_append() {
        let mut left = BufferArray::new();
        left.append(0, b"left ");
        let mut right = BufferArray::new();
        right.append(0, b"right");
        right.append(2, b"aux");
        right.next_channel();

        assert!(left.take_contents(&mut right));
        assert_eq!(read_all(&left, 0), b"left right");
        assert_eq!(read_all(&left, 2), b"aux");
        assert_eq!(right.segment_count(), 0);
        assert_eq!(right.count(0), 0);
        assert_eq!(right.next_channel(), Channels::new(0));
    }

    #[test]
    fn make_segment_reuses_block_tails() {
        let mut buffer = BufferArray::new();
        buffer.append(0, b"seed");
        let index = buffer.make_segment(1, 64).unwrap();
        let segment = buffer.segment(index).unwrap();
        assert_eq!(segment.len(), 64);
        assert!(segment.is_on_channel(1));
        // carved from the same block as the seed bytes
        assert_eq!(buffer.capacity(), DEFAULT_BLOCK_SIZE);

        // a request larger than the block yields a shorter segment
        let index = buffer.make_segment(1, DEFAULT_BLOCK_SIZE * 2).unwrap();
        let segment = buffer.segment(index).unwrap();
        assert!(segment.len() <= DEFAULT_BLOCK_SIZE);
        assert!(segment.len() >= 1);
    }

    #[test]
    fn erase_segment_hides_bytes() {
        let mut buffer = BufferArray::new();
        buffer.append(0, b"abc");
        buffer.append(0, b"def");
        assert!(buffer.erase_segment(0));
        assert_eq!(read_all(&buffer, 0), b"def");
        assert!(!buffer.erase_segment(5));
    }

    #[test]
    fn addresses_survive_splits() {
        let mut buffer = BufferArray::new();
        buffer.append(0, b"0123456789");
        let mut dest = [0u8; 4];
        let (_, last) = buffer.read_after(0, None, &mut dest);
        let last = last.unwrap();
        buffer.split_after(last).unwrap();
        // the remembered address still resolves after the split
        let (n, _) = buffer.read_after(0, Some(last), &mut dest);
        assert_eq!(n, 4);
        assert_eq!(&dest, b"4567");
    }

    #[test]
    fn next_channel_is_sequential() {
        let mut buffer = BufferArray::new();
        let a = buffer.next_channel();
        let b = buffer.next_channel();
        assert_eq!(b.input(), a.output());
        assert_eq!(Channels::consumer_of(a).input(), a.output());
    }
}
