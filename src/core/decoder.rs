//! Incremental framing of JSON objects over a fixed-size read buffer.

use std::io::{self, Read};

use serde_json::{Deserializer, Value};

pub const BUFFER_CAPACITY: usize = 4096;

/// Result of one framing attempt.
#[derive(Debug)]
pub enum Frame {
    /// A complete top-level value; its bytes have left the buffer.
    Value(Value),
    /// The buffer filled up without completing a value and was dropped.
    Oversized { discarded: usize },
    /// The buffered bytes cannot start a valid value and were dropped.
    Malformed { discarded: usize, reason: String },
}

/// Per-connection read buffer. Bytes accumulate across reads until a full
/// value can be parsed; the buffer never stays full between calls.
#[derive(Debug)]
pub struct Decoder {
    buf: Box<[u8]>,
    len: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::with_capacity(BUFFER_CAPACITY)
    }
}

impl Decoder {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity.max(1)].into_boxed_slice(),
            len: 0,
        }
    }

    pub fn buffered(&self) -> usize {
        self.len
    }

    /// Performs one read into the free tail of the buffer, retrying on
    /// `EINTR`. `Ok(0)` means end of stream.
    pub fn fill_from<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        debug_assert!(self.len < self.buf.len());
        loop {
            match reader.read(&mut self.buf[self.len..]) {
                Ok(read) => {
                    self.len += read;
                    return Ok(read);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Appends bytes directly, as if they had been read. Returns how many
    /// bytes fit.
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        let room = self.buf.len() - self.len;
        let take = room.min(bytes.len());
        self.buf[self.len..self.len + take].copy_from_slice(&bytes[..take]);
        self.len += take;
        take
    }

    /// Attempts to frame the next value. `None` means more input is needed
    /// (or nothing but whitespace was buffered).
    pub fn next_frame(&mut self) -> Option<Frame> {
        if self.len == 0 {
            return None;
        }

        let mut stream = Deserializer::from_slice(&self.buf[..self.len]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) => {
                let consumed = stream.byte_offset();
                self.consume(consumed);
                Some(Frame::Value(value))
            }
            Some(Err(err)) if err.is_eof() => {
                if self.len >= self.buf.len() {
                    let discarded = self.clear();
                    Some(Frame::Oversized { discarded })
                } else {
                    None
                }
            }
            Some(Err(err)) => {
                let discarded = self.clear();
                Some(Frame::Malformed {
                    discarded,
                    reason: err.to_string(),
                })
            }
            None => {
                self.clear();
                None
            }
        }
    }

    fn consume(&mut self, count: usize) {
        let count = count.min(self.len);
        self.buf.copy_within(count..self.len, 0);
        self.len -= count;
    }

    fn clear(&mut self) -> usize {
        let discarded = self.len;
        self.buf[..discarded].fill(0);
        self.len = 0;
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn drain(decoder: &mut Decoder) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = decoder.next_frame() {
            frames.push(frame);
        }
        frames
    }

    fn values(frames: Vec<Frame>) -> Vec<Value> {
        frames
            .into_iter()
            .map(|frame| match frame {
                Frame::Value(value) => value,
                other => panic!("unexpected frame {other:?}"),
            })
            .collect()
    }

    #[test]
    fn fragmented_stream_yields_each_message_once_in_order() {
        let stream = b"{\"QMP\": {\"version\": {}}}\r\n{\"return\": {}}\n{\"event\": \"SHUTDOWN\", \"data\": {\"guest\": true}}\n";
        for chunk_size in [1, 2, 3, 7, 16, stream.len()] {
            let mut decoder = Decoder::default();
            let mut seen = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                assert_eq!(decoder.push(chunk), chunk.len());
                seen.extend(values(drain(&mut decoder)));
            }
            assert_eq!(
                seen,
                vec![
                    json!({"QMP": {"version": {}}}),
                    json!({"return": {}}),
                    json!({"event": "SHUTDOWN", "data": {"guest": true}}),
                ],
                "chunk size {chunk_size}"
            );
            assert_eq!(decoder.buffered(), 0);
        }
    }

    #[test]
    fn partial_message_waits_for_more_input() {
        let mut decoder = Decoder::default();
        decoder.push(b"{\"return\": {\"status\": \"runn");
        assert!(decoder.next_frame().is_none());
        assert!(decoder.buffered() > 0);
        decoder.push(b"ing\"}}");
        let frames = values(drain(&mut decoder));
        assert_eq!(frames, vec![json!({"return": {"status": "running"}})]);
    }

    #[test]
    fn malformed_input_discards_buffer_and_resyncs() {
        let mut decoder = Decoder::default();
        decoder.push(b"{\"event\": ]garbage");
        match decoder.next_frame() {
            Some(Frame::Malformed { discarded, .. }) => assert_eq!(discarded, 18),
            other => panic!("expected malformed frame, got {other:?}"),
        }
        assert_eq!(decoder.buffered(), 0);

        decoder.push(b"{\"return\": {}}");
        assert_eq!(values(drain(&mut decoder)), vec![json!({"return": {}})]);
    }

    #[test]
    fn oversized_message_is_dropped_when_buffer_fills() {
        let mut decoder = Decoder::with_capacity(64);
        let mut oversized = b"{\"event\": \"".to_vec();
        oversized.resize(100, b'x');
        let taken = decoder.push(&oversized);
        assert_eq!(taken, 64);
        match decoder.next_frame() {
            Some(Frame::Oversized { discarded }) => assert_eq!(discarded, 64),
            other => panic!("expected oversized frame, got {other:?}"),
        }
        assert_eq!(decoder.buffered(), 0);

        decoder.push(b"{\"return\": {}}\n");
        assert_eq!(values(drain(&mut decoder)), vec![json!({"return": {}})]);
    }

    #[test]
    fn whitespace_only_buffer_is_cleared() {
        let mut decoder = Decoder::default();
        decoder.push(b"\r\n  \n");
        assert!(decoder.next_frame().is_none());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn fill_from_reads_into_free_space() {
        let mut decoder = Decoder::default();
        let mut input: &[u8] = b"{\"return\": {}}";
        assert_eq!(decoder.fill_from(&mut input).unwrap(), 14);
        assert_eq!(decoder.fill_from(&mut input).unwrap(), 0);
        assert_eq!(values(drain(&mut decoder)), vec![json!({"return": {}})]);
    }
}
