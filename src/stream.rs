//! The streaming reader: a resumable decoder over incrementally buffered
//! input.
//!
//! Every `try_*` call reports through [`DecodeResult`] and leaves the cursor
//! untouched unless it succeeds, so a caller can retry the same read after
//! feeding more bytes. Skipping is iterative and suspends cleanly: when the
//! buffer runs dry mid-structure the pending-structure count is parked on
//! the reader and the next call resumes from exactly where it stopped.

use crate::decode::{self, DecodeResult, Token, TokenStep};
use crate::error::Result;
use crate::integer::Integer;
use crate::marker::Marker;
use crate::segment::{SegmentBuffer, WINDOW};
use crate::timestamp::Timestamp;

/// Snapshot of the reader's resumption state: cursor position, whether the
/// byte source is drained, and any suspended skip progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExchangeInfo {
    pub position: u64,
    pub end_of_stream: bool,
    pub pending_skip: usize,
}

/// A resumable msgpack decoder over a [`SegmentBuffer`].
///
/// The owner feeds refill buffers between calls; suspension points exist
/// only at those refills. Once the source is drained, mark the reader with
/// [`finish_input`][Self::finish_input] so short reads reclassify from
/// "feed me more" to end-of-stream.
#[derive(Clone, Debug, Default)]
pub struct StreamReader {
    buf: SegmentBuffer,
    end_of_stream: bool,
    pending_skip: usize,
}

impl StreamReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a refill buffer.
    pub fn feed(&mut self, bytes: Vec<u8>) {
        self.buf.feed(bytes);
    }

    /// Mark the byte source as drained. Subsequent short reads return
    /// [`DecodeResult::EmptyBuffer`] instead of asking for more bytes.
    pub fn finish_input(&mut self) {
        self.end_of_stream = true;
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    /// Total bytes consumed since creation.
    pub fn position(&self) -> u64 {
        self.buf.position()
    }

    /// Unread bytes currently buffered.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Snapshot of the resumption state.
    pub fn exchange_info(&self) -> ExchangeInfo {
        ExchangeInfo {
            position: self.buf.position(),
            end_of_stream: self.end_of_stream,
            pending_skip: self.pending_skip,
        }
    }

    /// True once a suspended [`try_skip`][Self::try_skip] is waiting to
    /// resume.
    pub fn mid_skip(&self) -> bool {
        self.pending_skip > 0
    }

    /// Number of structures a suspended skip still has to pass.
    pub fn pending_skip(&self) -> usize {
        self.pending_skip
    }

    // Reclassify a short-buffer state once the source is known drained.
    fn reclassify<T>(&self, r: DecodeResult<T>) -> DecodeResult<T> {
        match r {
            DecodeResult::InsufficientBuffer(_) | DecodeResult::EmptyBuffer
                if self.end_of_stream =>
            {
                DecodeResult::EmptyBuffer
            }
            other => other,
        }
    }

    fn read_with<T, F>(&mut self, f: F) -> Result<DecodeResult<T>>
    where
        F: FnOnce(&[u8]) -> Result<DecodeResult<Token<T>>>,
    {
        let r = {
            let mut scratch = [0u8; WINDOW];
            f(self.buf.window(&mut scratch))?
        };
        match r {
            DecodeResult::Success((value, len)) => {
                self.buf.advance(len);
                Ok(DecodeResult::Success(value))
            }
            other => Ok(self.reclassify(other.stall())),
        }
    }

    /// Peek the next marker byte without consuming it.
    pub fn try_peek_marker(&self) -> DecodeResult<Marker> {
        match self.buf.peek() {
            Some(b) => DecodeResult::Success(Marker::from_u8(b)),
            None => self.reclassify(DecodeResult::EmptyBuffer),
        }
    }

    /// Consume a nil token.
    pub fn try_read_nil(&mut self) -> Result<DecodeResult<()>> {
        self.read_with(decode::read_nil)
    }

    pub fn try_read_bool(&mut self) -> Result<DecodeResult<bool>> {
        self.read_with(decode::read_bool)
    }

    pub fn try_read_int(&mut self) -> Result<DecodeResult<Integer>> {
        self.read_with(decode::read_int)
    }

    pub fn try_read_f32(&mut self) -> Result<DecodeResult<f32>> {
        self.read_with(decode::read_f32)
    }

    pub fn try_read_f64(&mut self) -> Result<DecodeResult<f64>> {
        self.read_with(decode::read_f64)
    }

    /// Read a string header, leaving the UTF-8 payload unread.
    pub fn try_read_str_header(&mut self) -> Result<DecodeResult<usize>> {
        self.read_with(decode::read_str_header)
    }

    /// Read a binary header, leaving the payload unread.
    pub fn try_read_bin_header(&mut self) -> Result<DecodeResult<usize>> {
        self.read_with(decode::read_bin_header)
    }

    pub fn try_read_array_header(&mut self) -> Result<DecodeResult<usize>> {
        self.read_with(decode::read_array_header)
    }

    pub fn try_read_map_header(&mut self) -> Result<DecodeResult<usize>> {
        self.read_with(decode::read_map_header)
    }

    /// Read an extension header: `(type code, payload length)`.
    pub fn try_read_ext_header(&mut self) -> Result<DecodeResult<(i8, usize)>> {
        self.read_with(decode::read_ext_header)
    }

    pub fn try_read_timestamp(&mut self) -> Result<DecodeResult<Timestamp>> {
        self.read_with(decode::read_timestamp)
    }

    /// Consume exactly `n` raw bytes (a payload whose header was already
    /// read).
    pub fn try_read_raw(&mut self, n: usize) -> DecodeResult<Vec<u8>> {
        if self.buf.remaining() < n {
            return self.reclassify(DecodeResult::InsufficientBuffer(n - self.buf.remaining()));
        }
        match self.buf.take(n) {
            Some(bytes) => DecodeResult::Success(bytes),
            None => self.reclassify(DecodeResult::InsufficientBuffer(n)),
        }
    }

    /// Advance past exactly one complete msgpack structure.
    ///
    /// Iterative depth-first: a counter of structures-still-to-skip replaces
    /// recursion, so hostile nesting can't exhaust the stack. On a short
    /// buffer the counter is parked and the cursor stays before the
    /// unconsumed token; a later call resumes the same skip. Returns
    /// `Success` with the cursor just past the structure.
    pub fn try_skip(&mut self) -> Result<DecodeResult<()>> {
        // The counter is parked only once the structure is actually entered;
        // a stall before the first token leaves the reader at a clean value
        // boundary, which the unframed stream relies on to detect a clean
        // end of input.
        let mut progressed = self.pending_skip > 0;
        let mut n = self.pending_skip.max(1);
        loop {
            let step = {
                let mut scratch = [0u8; WINDOW];
                decode::token_step(self.buf.window(&mut scratch))?
            };
            let TokenStep { consumed, children } = match step {
                DecodeResult::Success(step) => step,
                other => {
                    if progressed {
                        self.pending_skip = n;
                    }
                    return Ok(self.reclassify(other.stall()));
                }
            };
            if self.buf.remaining() < consumed {
                // The payload itself is short; leave the header unread so
                // resumption re-scans it after a refill.
                if progressed {
                    self.pending_skip = n;
                }
                return Ok(self.reclassify(DecodeResult::InsufficientBuffer(
                    consumed - self.buf.remaining(),
                )));
            }
            self.buf.advance(consumed);
            progressed = true;
            n = n - 1 + children;
            if n == 0 {
                self.pending_skip = 0;
                return Ok(DecodeResult::Success(()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode;

    #[test]
    fn typed_reads_and_mismatch_recovery() {
        let mut bytes = Vec::new();
        encode::put_int(&mut bytes, Integer::from(300u16));
        encode::put_bool(&mut bytes, true);
        let mut rd = StreamReader::new();
        rd.feed(bytes);

        // Wrong-type read leaves the cursor alone.
        match rd.try_read_bool().unwrap() {
            DecodeResult::TokenMismatch(m) => assert_eq!(m, Marker::UInt16),
            other => panic!("expected mismatch, got {:?}", other),
        }
        assert_eq!(rd.position(), 0);
        match rd.try_read_int().unwrap() {
            DecodeResult::Success(v) => assert_eq!(v, Integer::from(300u16)),
            other => panic!("expected 300, got {:?}", other),
        }
        match rd.try_read_bool().unwrap() {
            DecodeResult::Success(v) => assert!(v),
            other => panic!("expected true, got {:?}", other),
        }
    }

    #[test]
    fn refill_resumes_same_read() {
        let mut bytes = Vec::new();
        encode::put_int(&mut bytes, Integer::from(0x1234_5678u32));
        let mut rd = StreamReader::new();
        rd.feed(bytes[..2].to_vec());

        match rd.try_read_int().unwrap() {
            DecodeResult::InsufficientBuffer(need) => assert_eq!(need, 3),
            other => panic!("expected short buffer, got {:?}", other),
        }
        assert_eq!(rd.position(), 0, "failed read must not move the cursor");

        rd.feed(bytes[2..].to_vec());
        match rd.try_read_int().unwrap() {
            DecodeResult::Success(v) => assert_eq!(v, Integer::from(0x1234_5678u32)),
            other => panic!("expected success after refill, got {:?}", other),
        }
    }

    #[test]
    fn end_of_stream_reclassifies() {
        let mut rd = StreamReader::new();
        rd.feed(vec![0xcd, 0x01]);
        match rd.try_read_int().unwrap() {
            DecodeResult::InsufficientBuffer(1) => (),
            other => panic!("expected insufficient, got {:?}", other),
        }
        rd.finish_input();
        match rd.try_read_int().unwrap() {
            DecodeResult::EmptyBuffer => (),
            other => panic!("expected empty after EOS, got {:?}", other),
        }
    }

    #[test]
    fn skip_nested_one_byte_at_a_time() {
        // [[[]]] fed byte by byte: a short buffer before every byte, then
        // success with the cursor at the end and no pending skip left.
        let bytes = [0x91u8, 0x91, 0x90];
        let mut rd = StreamReader::new();

        match rd.try_skip().unwrap() {
            DecodeResult::InsufficientBuffer(_) | DecodeResult::EmptyBuffer => (),
            other => panic!("skip of nothing should stall, got {:?}", other),
        }
        let mut stalls = 1;
        for (i, &b) in bytes.iter().enumerate() {
            rd.feed(vec![b]);
            match rd.try_skip().unwrap() {
                DecodeResult::Success(()) => {
                    assert_eq!(i, bytes.len() - 1, "skip finished early");
                }
                DecodeResult::InsufficientBuffer(_) | DecodeResult::EmptyBuffer => {
                    stalls += 1;
                    assert!(rd.mid_skip(), "suspension must park the counter");
                    assert_eq!(rd.pending_skip(), 1);
                }
                other => panic!("unexpected skip result {:?}", other),
            }
        }
        assert_eq!(stalls, 3, "expected three short-buffer returns");
        assert_eq!(rd.position(), bytes.len() as u64);
        assert!(!rd.mid_skip());
    }

    #[test]
    fn skip_covers_every_token_kind() {
        let mut bytes = Vec::new();
        encode::put_map_header(&mut bytes, 3);
        encode::put_str(&mut bytes, "k1");
        encode::put_array_header(&mut bytes, 2);
        encode::put_f64(&mut bytes, 0.5);
        encode::put_nil(&mut bytes);
        encode::put_str(&mut bytes, "k2");
        encode::put_bin(&mut bytes, &[9u8; 40]);
        encode::put_str(&mut bytes, "k3");
        encode::put_timestamp(&mut bytes, Timestamp::from_secs(77));
        let total = bytes.len();

        // Whole buffer available: one call.
        let mut rd = StreamReader::new();
        rd.feed(bytes.clone());
        assert!(matches!(rd.try_skip().unwrap(), DecodeResult::Success(())));
        assert_eq!(rd.position(), total as u64);

        // Fragmented into 7-byte segments: resumes as needed.
        let mut rd = StreamReader::new();
        let mut fed = 0;
        loop {
            match rd.try_skip().unwrap() {
                DecodeResult::Success(()) => break,
                DecodeResult::InsufficientBuffer(_) | DecodeResult::EmptyBuffer => {
                    assert!(fed < total, "skip demanded bytes past the structure");
                    let next = (fed + 7).min(total);
                    rd.feed(bytes[fed..next].to_vec());
                    fed = next;
                }
                other => panic!("unexpected skip result {:?}", other),
            }
        }
        assert_eq!(rd.position(), total as u64);
        assert_eq!(rd.remaining(), 0, "skip must consume exactly the structure");
    }

    #[test]
    fn skip_leaves_following_data() {
        let mut bytes = Vec::new();
        encode::put_array_header(&mut bytes, 1);
        encode::put_int(&mut bytes, Integer::from(5u8));
        encode::put_bool(&mut bytes, false);
        let mut rd = StreamReader::new();
        rd.feed(bytes);
        assert!(matches!(rd.try_skip().unwrap(), DecodeResult::Success(())));
        match rd.try_read_bool().unwrap() {
            DecodeResult::Success(false) => (),
            other => panic!("expected the trailing bool, got {:?}", other),
        }
    }

    #[test]
    fn exchange_info_snapshot() {
        let mut rd = StreamReader::new();
        rd.feed(vec![0x92, 0x01]);
        assert!(matches!(
            rd.try_skip().unwrap(),
            DecodeResult::InsufficientBuffer(_) | DecodeResult::EmptyBuffer
        ));
        let info = rd.exchange_info();
        assert_eq!(info.position, 2);
        assert!(!info.end_of_stream);
        assert_eq!(info.pending_skip, 1);
    }
}
