//! `std::io` adapters over one channel of a buffer array.
//!
//! [`BufferReader`] walks the segments of a channel without copying more
//! than the caller asks for; [`BufferWriter`] fills freshly carved
//! segments and returns the unused tail on flush. The protocol pipes use
//! these to parse and emit text and structured data against the
//! scatter-gather storage.

use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::buffer::{Address, BufferArray, SeekStart};

const DEFAULT_OUTPUT_SEGMENT_SIZE: usize = 4096;

////////////////////////////////////////////////////////////////////////////////
// BufferReader
////////////////////////////////////////////////////////////////////////////////

/// Reads the bytes of one channel in segment order.
pub struct BufferReader<'a> {
    buffer: &'a BufferArray,
    channel: i32,
    last: Option<Address>,
}

impl<'a> BufferReader<'a> {
    pub fn new(buffer: &'a BufferArray, channel: i32) -> BufferReader<'a> {
        BufferReader {
            buffer,
            channel,
            last: None,
        }
    }

    /// Resume reading strictly after `last`.
    pub fn after(buffer: &'a BufferArray, channel: i32, last: Option<Address>) -> BufferReader<'a> {
        BufferReader {
            buffer,
            channel,
            last,
        }
    }

    /// Address of the last byte handed out, usable to resume later.
    #[inline]
    pub fn last_address(&self) -> Option<Address> {
        self.last
    }

    fn position(&self) -> u64 {
        let total = self.buffer.count(self.channel);
        let remaining = self.buffer.count_after(self.channel, self.last);
        (total - remaining) as u64
    }
}

impl Read for BufferReader<'_> {
    fn read(&mut self, dest: &mut [u8]) -> io::Result<usize> {
        let (n, last) = self.buffer.read_after(self.channel, self.last, dest);
        if n > 0 {
            self.last = last;
        }
        Ok(n)
    }
}

impl Seek for BufferReader<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let total = self.buffer.count(self.channel) as i64;
        let target = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::End(delta) => total + delta,
            SeekFrom::Current(delta) => self.position() as i64 + delta,
        };
        if target < 0 || target > total {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek out of channel range",
            ));
        }
        self.last = if target == 0 {
            None
        } else {
            let address = self
                .buffer
                .seek(self.channel, SeekStart::Begin, target - 1)
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "seek out of channel range")
                })?;
            Some(address)
        };
        Ok(target as u64)
    }
}

////////////////////////////////////////////////////////////////////////////////
// BufferWriter
////////////////////////////////////////////////////////////////////////////////

/// Appends bytes to one channel through carved segments.
///
/// Output is buffered only in the sense that the final segment is carved
/// ahead of the bytes; flushing (or dropping) the writer trims the unused
/// tail so no zero filled bytes leak into the channel.
pub struct BufferWriter<'a> {
    buffer: &'a mut BufferArray,
    channel: i32,
    segment: Option<usize>,
    used: usize,
}

impl<'a> BufferWriter<'a> {
    pub fn new(buffer: &'a mut BufferArray, channel: i32) -> BufferWriter<'a> {
        BufferWriter {
            buffer,
            channel,
            segment: None,
            used: 0,
        }
    }

    fn trim(&mut self) {
        if let Some(index) = self.segment.take() {
            self.buffer.truncate_segment(index, self.used);
        }
        self.used = 0;
    }
}

impl Write for BufferWriter<'_> {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        if src.is_empty() {
            return Ok(0);
        }
        let index = match self.segment {
            Some(index)
                if self
                    .buffer
                    .segment(index)
                    .map(|s| self.used < s.len())
                    .unwrap_or(false) =>
            {
                index
            }
            _ => {
                self.trim();
                let index = match self.buffer.make_segment(self.channel, DEFAULT_OUTPUT_SEGMENT_SIZE)
                {
                    Some(index) => index,
                    None => {
                        return Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "failed to carve an output segment",
                        ))
                    }
                };
                self.segment = Some(index);
                self.used = 0;
                index
            }
        };
        let segment = match self.buffer.segment(index) {
            Some(segment) => segment,
            None => return Err(io::Error::new(io::ErrorKind::Other, "segment vanished")),
        };
        let take = src.len().min(segment.len() - self.used);
        let offset = self.used;
        self.buffer.segment_bytes_mut(&segment)[offset..offset + take]
            .copy_from_slice(&src[..take]);
        self.used += take;
        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.trim();
        Ok(())
    }
}

impl Drop for BufferWriter<'_> {
    fn drop(&mut self) {
        self.trim();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::buffer::BufferArray;

    #[test]
    fn write_then_read_round_trip() {
        let mut buffer = BufferArray::new();
        let channels = buffer.next_channel();
        {
            let mut out = BufferWriter::new(&mut buffer, channels.output());
            write!(out, "Hello").unwrap();
            write!(out, ", world!").unwrap();
        }
        assert_eq!(buffer.count(channels.output()), 13);

        let mut text = String::new();
        BufferReader::new(&buffer, channels.output())
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text, "Hello, world!");
    }

    #[test]
    fn writer_trims_unused_tail() {
        let mut buffer = BufferArray::new();
        {
            let mut out = BufferWriter::new(&mut buffer, 5);
            out.write_all(b"xyz").unwrap();
        }
        assert_eq!(buffer.count(5), 3);
        // no zero-length or zero-filled segments are left behind
        for index in 0..buffer.segment_count() {
            assert!(buffer.segment(index).unwrap().len() >= 1);
        }
    }

    #[test]
    fn writer_spans_segments() {
        let mut buffer = BufferArray::new();
        let big = vec![b'q'; DEFAULT_OUTPUT_SEGMENT_SIZE * 2 + 5];
        {
            let mut out = BufferWriter::new(&mut buffer, 0);
            out.write_all(&big).unwrap();
        }
        assert_eq!(buffer.count(0), big.len());
        let mut back = Vec::new();
        BufferReader::new(&buffer, 0).read_to_end(&mut back).unwrap();
        assert_eq!(back, big);
    }

    #[test]
    fn reader_resumes_from_address() {
        let mut buffer = BufferArray::new();
        buffer.append(0, b"one two");
        let mut reader = BufferReader::new(&buffer, 0);
        let mut first = [0u8; 3];
        reader.read_exact(&mut first).unwrap();
        let last = reader.last_address();

        let mut rest = String::new();
        BufferReader::after(&buffer, 0, last)
            .read_to_string(&mut rest)
            .unwrap();
        assert_eq!(rest, " two");
    }

    #[test]
    fn reader_seeks() {
        let mut buffer = BufferArray::new();
        buffer.append(0, b"0123456789");
        let mut reader = BufferReader::new(&buffer, 0);
        reader.seek(SeekFrom::Start(4)).unwrap();
        let mut rest = String::new();
        reader.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "456789");

        assert_eq!(reader.seek(SeekFrom::End(-2)).unwrap(), 8);
        let mut rest = String::new();
        reader.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "89");

        assert!(reader.seek(SeekFrom::Current(5)).is_err());
    }

    #[test]
    fn reader_skips_other_channels() {
        let mut buffer = BufferArray::new();
        buffer.append(0, b"keep ");
        buffer.append(9, b"SKIP");
        buffer.append(0, b"these");
        let mut text = String::new();
        BufferReader::new(&buffer, 0)
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text, "keep these");
    }
}
