//! The synchronous typed reader.
//!
//! A thin facade over the wire primitives that converts the recoverable
//! [`DecodeResult`] states into errors: short buffers become `EndOfStream`,
//! mismatched tokens become `TokenMismatch`. Converters run against this
//! reader; resumable decoding stays in [`StreamReader`][crate::StreamReader].

use std::convert::TryFrom;

use crate::decode::{self, DecodeResult, Token};
use crate::error::{Error, Result};
use crate::integer::{Integer, Named};
use crate::marker::Marker;
use crate::timestamp::Timestamp;

#[derive(Clone, Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Reader<'a> {
        Self { data, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == self.data.len()
    }

    fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    // Convert a recoverable decode state into the facade's error.
    fn settle<T>(&mut self, r: Result<DecodeResult<Token<T>>>, expected: &'static str) -> Result<T> {
        match r? {
            DecodeResult::Success((value, len)) => {
                self.pos += len;
                Ok(value)
            }
            DecodeResult::TokenMismatch(m) => Err(Error::TokenMismatch {
                expected,
                found: m.family(),
            }),
            DecodeResult::InsufficientBuffer(_) | DecodeResult::EmptyBuffer => {
                Err(Error::EndOfStream)
            }
        }
    }

    /// Peek the next marker without consuming it.
    pub fn peek_marker(&self) -> Result<Marker> {
        match decode::peek_marker(self.rest()) {
            DecodeResult::Success(m) => Ok(m),
            _ => Err(Error::EndOfStream),
        }
    }

    /// Consume a nil token, failing on anything else.
    pub fn read_nil(&mut self) -> Result<()> {
        self.settle(decode::read_nil(self.rest()), "nil")
    }

    /// Consume a nil token if one is next. Returns whether it did.
    pub fn try_read_nil(&mut self) -> Result<bool> {
        match decode::read_nil(self.rest())? {
            DecodeResult::Success(((), len)) => {
                self.pos += len;
                Ok(true)
            }
            DecodeResult::TokenMismatch(_) => Ok(false),
            DecodeResult::InsufficientBuffer(_) | DecodeResult::EmptyBuffer => {
                Err(Error::EndOfStream)
            }
        }
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        self.settle(decode::read_bool(self.rest()), "bool")
    }

    pub fn read_int(&mut self) -> Result<Integer> {
        self.settle(decode::read_int(self.rest()), "integer")
    }

    /// Read an integer and narrow it, failing with `Overflow` when the wire
    /// value doesn't fit `T`.
    pub fn read_fit<T>(&mut self) -> Result<T>
    where
        T: TryFrom<Integer> + Named,
    {
        self.read_int()?.fit::<T>()
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        self.settle(decode::read_f32(self.rest()), "f32")
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.settle(decode::read_f64(self.rest()), "f64")
    }

    /// Read a complete string token, borrowing the UTF-8 payload.
    pub fn read_str(&mut self) -> Result<&'a str> {
        let len = self.settle(decode::read_str_header(self.rest()), "string")?;
        let bytes = self.read_payload(len)?;
        std::str::from_utf8(bytes)
            .map_err(|e| Error::BadData(format!("string payload is not UTF-8: {}", e)))
    }

    /// Read a complete string token, borrowing the raw payload without
    /// UTF-8 validation. Used for byte-wise property-name comparison.
    pub fn read_str_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.settle(decode::read_str_header(self.rest()), "string")?;
        self.read_payload(len)
    }

    /// Read a complete binary token, borrowing the payload.
    pub fn read_bin(&mut self) -> Result<&'a [u8]> {
        let len = self.settle(decode::read_bin_header(self.rest()), "binary")?;
        self.read_payload(len)
    }

    pub fn read_array_header(&mut self) -> Result<usize> {
        self.settle(decode::read_array_header(self.rest()), "array")
    }

    pub fn read_map_header(&mut self) -> Result<usize> {
        self.settle(decode::read_map_header(self.rest()), "map")
    }

    /// Read an extension header: `(type code, payload length)`.
    pub fn read_ext_header(&mut self) -> Result<(i8, usize)> {
        self.settle(decode::read_ext_header(self.rest()), "extension")
    }

    pub fn read_timestamp(&mut self) -> Result<Timestamp> {
        self.settle(decode::read_timestamp(self.rest()), "timestamp")
    }

    /// Borrow exactly `n` payload bytes and advance past them.
    pub fn read_payload(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::EndOfStream);
        }
        let bytes = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    /// Advance past exactly one complete structure.
    ///
    /// Iterative, like the streaming skip: nesting depth on hostile input
    /// must not translate into stack depth.
    pub fn skip(&mut self) -> Result<()> {
        let mut n = 1usize;
        loop {
            let step = match decode::token_step(self.rest())? {
                DecodeResult::Success(step) => step,
                DecodeResult::TokenMismatch(_)
                | DecodeResult::InsufficientBuffer(_)
                | DecodeResult::EmptyBuffer => return Err(Error::EndOfStream),
            };
            if self.remaining() < step.consumed {
                return Err(Error::EndOfStream);
            }
            self.pos += step.consumed;
            n = n - 1 + step.children;
            if n == 0 {
                return Ok(());
            }
        }
    }

    /// Borrow the exact bytes of the next complete structure, advancing
    /// past it. This is what unused-data capture stores and later replays.
    pub fn read_raw_structure(&mut self) -> Result<&'a [u8]> {
        let start = self.pos;
        self.skip()?;
        Ok(&self.data[start..self.pos])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode;

    #[test]
    fn typed_reads() {
        let mut buf = Vec::new();
        encode::put_int(&mut buf, Integer::from(300u16));
        encode::put_bool(&mut buf, false);
        encode::put_str(&mut buf, "abc");
        encode::put_f32(&mut buf, 1.5);
        encode::put_nil(&mut buf);

        let mut rd = Reader::new(&buf);
        assert_eq!(rd.read_fit::<u16>().unwrap(), 300);
        assert!(!rd.read_bool().unwrap());
        assert_eq!(rd.read_str().unwrap(), "abc");
        assert_eq!(rd.read_f32().unwrap(), 1.5);
        assert!(rd.read_nil().is_ok());
        assert!(rd.is_empty());
    }

    #[test]
    fn narrowing_overflow() {
        let mut buf = Vec::new();
        encode::put_int(&mut buf, Integer::from(300u16));
        let mut rd = Reader::new(&buf);
        match rd.read_fit::<u8>() {
            Err(Error::Overflow { target: "u8" }) => (),
            other => panic!("expected overflow, got {:?}", other),
        }
    }

    #[test]
    fn mismatch_and_eos_errors() {
        let mut rd = Reader::new(&[0xc3]);
        match rd.read_int() {
            Err(Error::TokenMismatch { expected, found }) => {
                assert_eq!(expected, "integer");
                assert_eq!(found, "bool");
            }
            other => panic!("expected mismatch, got {:?}", other),
        }

        let mut rd = Reader::new(&[0xcd, 0x01]);
        match rd.read_int() {
            Err(Error::EndOfStream) => (),
            other => panic!("expected end of stream, got {:?}", other),
        }
    }

    #[test]
    fn optional_nil() {
        let mut rd = Reader::new(&[0xc0, 0x05]);
        assert!(rd.try_read_nil().unwrap());
        assert!(!rd.try_read_nil().unwrap());
        assert_eq!(rd.read_fit::<u8>().unwrap(), 5);
    }

    #[test]
    fn raw_structure_capture() {
        let mut buf = Vec::new();
        encode::put_array_header(&mut buf, 2);
        encode::put_str(&mut buf, "xy");
        encode::put_int(&mut buf, Integer::from(-100i8));
        encode::put_bool(&mut buf, true);

        let mut rd = Reader::new(&buf);
        let raw = rd.read_raw_structure().unwrap();
        assert_eq!(raw, &buf[..buf.len() - 1]);
        assert!(rd.read_bool().unwrap());
    }

    #[test]
    fn invalid_utf8_rejected() {
        let mut rd = Reader::new(&[0xa2, 0xff, 0xfe]);
        match rd.read_str() {
            Err(Error::BadData(_)) => (),
            other => panic!("expected BadData for bad UTF-8, got {:?}", other),
        }
    }
}
