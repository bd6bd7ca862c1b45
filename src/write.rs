//! The buffered typed writer.
//!
//! Tokens are appended to an in-memory buffer which drains to an `io::Write`
//! sink whenever the pending bytes pass the configured threshold. Flushes
//! happen only on token boundaries, so the sink always holds a prefix of
//! valid msgpack.

use std::io;

use crate::encode;
use crate::error::Result;
use crate::integer::Integer;
use crate::marker::ExtType;
use crate::timestamp::Timestamp;

/// Default number of pending bytes that triggers a drain to the sink.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 64 * 1024;

pub struct Writer<'a> {
    buf: Vec<u8>,
    sink: Option<&'a mut dyn io::Write>,
    threshold: usize,
    drained: u64,
}

impl<'a> Writer<'a> {
    /// Writer that keeps everything in memory; retrieve it with
    /// [`into_vec`][Self::into_vec].
    pub fn to_vec() -> Writer<'static> {
        Writer {
            buf: Vec::new(),
            sink: None,
            threshold: usize::MAX,
            drained: 0,
        }
    }

    /// Writer draining to `sink` past `threshold` pending bytes. The buffer
    /// is a recycled allocation from the owning serializer's pool.
    pub fn new(sink: &'a mut dyn io::Write, threshold: usize, buf: Vec<u8>) -> Writer<'a> {
        debug_assert!(buf.is_empty());
        Writer {
            buf,
            sink: Some(sink),
            threshold: threshold.max(1),
            drained: 0,
        }
    }

    /// Total bytes written so far, drained or pending.
    pub fn position(&self) -> u64 {
        self.drained + self.buf.len() as u64
    }

    /// Bytes written but not yet handed to the sink.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    fn maybe_drain(&mut self) -> Result<()> {
        if self.buf.len() >= self.threshold {
            self.drain()?;
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        if let Some(sink) = self.sink.as_mut() {
            if !self.buf.is_empty() {
                sink.write_all(&self.buf)?;
                self.drained += self.buf.len() as u64;
                self.buf.clear();
            }
        }
        Ok(())
    }

    pub fn write_nil(&mut self) -> Result<()> {
        encode::put_nil(&mut self.buf);
        self.maybe_drain()
    }

    pub fn write_bool(&mut self, v: bool) -> Result<()> {
        encode::put_bool(&mut self.buf, v);
        self.maybe_drain()
    }

    pub fn write_int(&mut self, v: Integer) -> Result<()> {
        encode::put_int(&mut self.buf, v);
        self.maybe_drain()
    }

    pub fn write_f32(&mut self, v: f32) -> Result<()> {
        encode::put_f32(&mut self.buf, v);
        self.maybe_drain()
    }

    pub fn write_f64(&mut self, v: f64) -> Result<()> {
        encode::put_f64(&mut self.buf, v);
        self.maybe_drain()
    }

    pub fn write_str(&mut self, v: &str) -> Result<()> {
        encode::put_str(&mut self.buf, v);
        self.maybe_drain()
    }

    /// Write a string token from pre-validated UTF-8 bytes (the pre-encoded
    /// property-name path).
    pub fn write_str_bytes(&mut self, v: &[u8]) -> Result<()> {
        encode::put_str_bytes(&mut self.buf, v);
        self.maybe_drain()
    }

    pub fn write_bin(&mut self, v: &[u8]) -> Result<()> {
        encode::put_bin(&mut self.buf, v);
        self.maybe_drain()
    }

    pub fn write_array_header(&mut self, len: usize) -> Result<()> {
        encode::put_array_header(&mut self.buf, len);
        self.maybe_drain()
    }

    pub fn write_map_header(&mut self, len: usize) -> Result<()> {
        encode::put_map_header(&mut self.buf, len);
        self.maybe_drain()
    }

    /// Write a complete extension token.
    pub fn write_ext(&mut self, type_code: i8, payload: &[u8]) -> Result<()> {
        encode::put_ext_header(&mut self.buf, type_code, payload.len());
        self.buf.extend_from_slice(payload);
        self.maybe_drain()
    }

    pub fn write_timestamp(&mut self, v: Timestamp) -> Result<()> {
        encode::put_ext_header(&mut self.buf, ExtType::Timestamp.into(), v.size());
        v.encode_vec(&mut self.buf);
        self.maybe_drain()
    }

    /// Splice pre-encoded bytes (a captured unused-data structure) verbatim.
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(bytes);
        self.maybe_drain()
    }

    /// Bulk-encode unsigned integers; byte-identical to element-wise
    /// [`write_int`][Self::write_int].
    pub fn write_uint_slice(&mut self, vals: &[u64]) -> Result<()> {
        encode::put_uint_slice(&mut self.buf, vals);
        self.maybe_drain()
    }

    /// Bulk-encode signed integers.
    pub fn write_sint_slice(&mut self, vals: &[i64]) -> Result<()> {
        encode::put_sint_slice(&mut self.buf, vals);
        self.maybe_drain()
    }

    /// Drain anything pending and return the (emptied) buffer for reuse.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        self.drain()?;
        Ok(std::mem::take(&mut self.buf))
    }

    /// Consume a sink-less writer, returning everything written.
    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_writes() {
        let mut wr = Writer::to_vec();
        wr.write_map_header(2).unwrap();
        wr.write_str("a").unwrap();
        wr.write_int(Integer::from(1u8)).unwrap();
        wr.write_str("b").unwrap();
        wr.write_int(Integer::from(2u8)).unwrap();
        assert_eq!(
            wr.into_vec(),
            [0x82, 0xa1, 0x61, 0x01, 0xa1, 0x62, 0x02]
        );
    }

    #[test]
    fn threshold_drains_to_sink() {
        let mut sink = Vec::new();
        {
            let mut wr = Writer::new(&mut sink, 8, Vec::new());
            wr.write_bin(&[0u8; 20]).unwrap();
            // One token larger than the threshold drains in one piece.
            assert_eq!(wr.pending(), 0);
            wr.write_bool(true).unwrap();
            assert_eq!(wr.pending(), 1, "small writes stay pending");
            assert_eq!(wr.position(), 23);
            let leftover = wr.finish().unwrap();
            assert!(leftover.is_empty());
        }
        assert_eq!(sink.len(), 23);
        assert_eq!(sink[sink.len() - 1], 0xc3);
    }

    #[test]
    fn ext_token() {
        let mut wr = Writer::to_vec();
        wr.write_ext(113, &[0x05]).unwrap();
        assert_eq!(wr.into_vec(), [0xd4, 0x71, 0x05]);
    }
}
