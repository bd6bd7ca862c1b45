//! Wire-level msgpack decoding primitives.
//!
//! Every reader works against a contiguous span and reports through the
//! four-valued [`DecodeResult`] instead of errors: a mismatched token kind
//! and a short buffer are both recoverable states at this layer. Hard
//! conditions that no amount of retrying can fix (the reserved 0xc1 byte,
//! malformed payload content) come back through `Result`.
//!
//! Readers accept every integer encoding, shortest-form or not, and widen
//! into [`Integer`]; narrowing into a concrete primitive happens above this
//! layer so overflow can name the requested type.

use std::convert::TryFrom;

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::integer::Integer;
use crate::marker::Marker;
use crate::timestamp::Timestamp;

/// Outcome of a single decode attempt against a span.
///
/// Only `Success` implies the token was consumed; every other variant leaves
/// the span logically untouched so the caller can retry with a different
/// type or with more bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeResult<T> {
    /// The token decoded as requested.
    Success(T),
    /// The next token is of a different kind. Carries its marker.
    TokenMismatch(Marker),
    /// The token continues past the end of the span; at least this many
    /// further bytes are needed.
    InsufficientBuffer(usize),
    /// The span holds no bytes at all.
    EmptyBuffer,
}

impl<T> DecodeResult<T> {
    /// Apply `f` to the success value, passing the other states through.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> DecodeResult<U> {
        match self {
            DecodeResult::Success(v) => DecodeResult::Success(f(v)),
            DecodeResult::TokenMismatch(m) => DecodeResult::TokenMismatch(m),
            DecodeResult::InsufficientBuffer(n) => DecodeResult::InsufficientBuffer(n),
            DecodeResult::EmptyBuffer => DecodeResult::EmptyBuffer,
        }
    }

    /// True only for `Success`.
    pub fn is_success(&self) -> bool {
        matches!(self, DecodeResult::Success(_))
    }

    // Pass a non-`Success` state through under a different payload type.
    pub(crate) fn stall<U>(self) -> DecodeResult<U> {
        match self {
            DecodeResult::Success(_) => unreachable!("stall on a successful decode"),
            DecodeResult::TokenMismatch(m) => DecodeResult::TokenMismatch(m),
            DecodeResult::InsufficientBuffer(n) => DecodeResult::InsufficientBuffer(n),
            DecodeResult::EmptyBuffer => DecodeResult::EmptyBuffer,
        }
    }
}

/// A decoded token paired with the total number of span bytes it consumed.
pub type Token<T> = (T, usize);

macro_rules! need {
    ($span:expr, $total:expr) => {
        if $span.len() < $total {
            return Ok(DecodeResult::InsufficientBuffer($total - $span.len()));
        }
    };
}

fn marker_of(span: &[u8]) -> Option<Marker> {
    span.first().map(|&b| Marker::from_u8(b))
}

/// Peek the marker byte without consuming anything.
pub fn peek_marker(span: &[u8]) -> DecodeResult<Marker> {
    match marker_of(span) {
        Some(m) => DecodeResult::Success(m),
        None => DecodeResult::EmptyBuffer,
    }
}

/// Read a nil token.
pub fn read_nil(span: &[u8]) -> Result<DecodeResult<Token<()>>> {
    match marker_of(span) {
        None => Ok(DecodeResult::EmptyBuffer),
        Some(Marker::Nil) => Ok(DecodeResult::Success(((), 1))),
        Some(Marker::Reserved) => Err(Error::InvalidCode(span[0])),
        Some(m) => Ok(DecodeResult::TokenMismatch(m)),
    }
}

/// Read a bool token.
pub fn read_bool(span: &[u8]) -> Result<DecodeResult<Token<bool>>> {
    match marker_of(span) {
        None => Ok(DecodeResult::EmptyBuffer),
        Some(Marker::True) => Ok(DecodeResult::Success((true, 1))),
        Some(Marker::False) => Ok(DecodeResult::Success((false, 1))),
        Some(Marker::Reserved) => Err(Error::InvalidCode(span[0])),
        Some(m) => Ok(DecodeResult::TokenMismatch(m)),
    }
}

/// Read any integer token, widening to [`Integer`]. Non-shortest encodings
/// are accepted.
pub fn read_int(span: &[u8]) -> Result<DecodeResult<Token<Integer>>> {
    let marker = match marker_of(span) {
        None => return Ok(DecodeResult::EmptyBuffer),
        Some(m) => m,
    };
    let result = match marker {
        Marker::PosFixInt(v) => (Integer::from(v), 1),
        Marker::NegFixInt(v) => (Integer::from(v), 1),
        Marker::UInt8 => {
            need!(span, 2);
            (Integer::from(span[1]), 2)
        }
        Marker::UInt16 => {
            need!(span, 3);
            (Integer::from(BigEndian::read_u16(&span[1..])), 3)
        }
        Marker::UInt32 => {
            need!(span, 5);
            (Integer::from(BigEndian::read_u32(&span[1..])), 5)
        }
        Marker::UInt64 => {
            need!(span, 9);
            (Integer::from(BigEndian::read_u64(&span[1..])), 9)
        }
        Marker::Int8 => {
            need!(span, 2);
            (Integer::from(span[1] as i8), 2)
        }
        Marker::Int16 => {
            need!(span, 3);
            (Integer::from(BigEndian::read_i16(&span[1..])), 3)
        }
        Marker::Int32 => {
            need!(span, 5);
            (Integer::from(BigEndian::read_i32(&span[1..])), 5)
        }
        Marker::Int64 => {
            need!(span, 9);
            (Integer::from(BigEndian::read_i64(&span[1..])), 9)
        }
        Marker::Reserved => return Err(Error::InvalidCode(span[0])),
        m => return Ok(DecodeResult::TokenMismatch(m)),
    };
    Ok(DecodeResult::Success(result))
}

/// Read an f32 token.
pub fn read_f32(span: &[u8]) -> Result<DecodeResult<Token<f32>>> {
    match marker_of(span) {
        None => Ok(DecodeResult::EmptyBuffer),
        Some(Marker::F32) => {
            need!(span, 5);
            Ok(DecodeResult::Success((
                f32::from_bits(BigEndian::read_u32(&span[1..])),
                5,
            )))
        }
        Some(Marker::Reserved) => Err(Error::InvalidCode(span[0])),
        Some(m) => Ok(DecodeResult::TokenMismatch(m)),
    }
}

/// Read an f64 token. An f32 token widens losslessly.
pub fn read_f64(span: &[u8]) -> Result<DecodeResult<Token<f64>>> {
    match marker_of(span) {
        None => Ok(DecodeResult::EmptyBuffer),
        Some(Marker::F64) => {
            need!(span, 9);
            Ok(DecodeResult::Success((
                f64::from_bits(BigEndian::read_u64(&span[1..])),
                9,
            )))
        }
        Some(Marker::F32) => {
            need!(span, 5);
            Ok(DecodeResult::Success((
                f32::from_bits(BigEndian::read_u32(&span[1..])) as f64,
                5,
            )))
        }
        Some(Marker::Reserved) => Err(Error::InvalidCode(span[0])),
        Some(m) => Ok(DecodeResult::TokenMismatch(m)),
    }
}

/// Read a string header: UTF-8 byte length plus header size.
pub fn read_str_header(span: &[u8]) -> Result<DecodeResult<Token<usize>>> {
    let marker = match marker_of(span) {
        None => return Ok(DecodeResult::EmptyBuffer),
        Some(m) => m,
    };
    let result = match marker {
        Marker::FixStr(len) => (len as usize, 1),
        Marker::Str8 => {
            need!(span, 2);
            (span[1] as usize, 2)
        }
        Marker::Str16 => {
            need!(span, 3);
            (BigEndian::read_u16(&span[1..]) as usize, 3)
        }
        Marker::Str32 => {
            need!(span, 5);
            (BigEndian::read_u32(&span[1..]) as usize, 5)
        }
        Marker::Reserved => return Err(Error::InvalidCode(span[0])),
        m => return Ok(DecodeResult::TokenMismatch(m)),
    };
    Ok(DecodeResult::Success(result))
}

/// Read a binary header: payload length plus header size.
pub fn read_bin_header(span: &[u8]) -> Result<DecodeResult<Token<usize>>> {
    let marker = match marker_of(span) {
        None => return Ok(DecodeResult::EmptyBuffer),
        Some(m) => m,
    };
    let result = match marker {
        Marker::Bin8 => {
            need!(span, 2);
            (span[1] as usize, 2)
        }
        Marker::Bin16 => {
            need!(span, 3);
            (BigEndian::read_u16(&span[1..]) as usize, 3)
        }
        Marker::Bin32 => {
            need!(span, 5);
            (BigEndian::read_u32(&span[1..]) as usize, 5)
        }
        Marker::Reserved => return Err(Error::InvalidCode(span[0])),
        m => return Ok(DecodeResult::TokenMismatch(m)),
    };
    Ok(DecodeResult::Success(result))
}

/// Read an array header: element count plus header size.
pub fn read_array_header(span: &[u8]) -> Result<DecodeResult<Token<usize>>> {
    let marker = match marker_of(span) {
        None => return Ok(DecodeResult::EmptyBuffer),
        Some(m) => m,
    };
    let result = match marker {
        Marker::FixArray(len) => (len as usize, 1),
        Marker::Array16 => {
            need!(span, 3);
            (BigEndian::read_u16(&span[1..]) as usize, 3)
        }
        Marker::Array32 => {
            need!(span, 5);
            (BigEndian::read_u32(&span[1..]) as usize, 5)
        }
        Marker::Reserved => return Err(Error::InvalidCode(span[0])),
        m => return Ok(DecodeResult::TokenMismatch(m)),
    };
    Ok(DecodeResult::Success(result))
}

/// Read a map header: pair count plus header size.
pub fn read_map_header(span: &[u8]) -> Result<DecodeResult<Token<usize>>> {
    let marker = match marker_of(span) {
        None => return Ok(DecodeResult::EmptyBuffer),
        Some(m) => m,
    };
    let result = match marker {
        Marker::FixMap(len) => (len as usize, 1),
        Marker::Map16 => {
            need!(span, 3);
            (BigEndian::read_u16(&span[1..]) as usize, 3)
        }
        Marker::Map32 => {
            need!(span, 5);
            (BigEndian::read_u32(&span[1..]) as usize, 5)
        }
        Marker::Reserved => return Err(Error::InvalidCode(span[0])),
        m => return Ok(DecodeResult::TokenMismatch(m)),
    };
    Ok(DecodeResult::Success(result))
}

/// Read an extension header: `(type code, payload length)` plus header size.
pub fn read_ext_header(span: &[u8]) -> Result<DecodeResult<Token<(i8, usize)>>> {
    let marker = match marker_of(span) {
        None => return Ok(DecodeResult::EmptyBuffer),
        Some(m) => m,
    };
    let result = match marker {
        Marker::FixExt1 => {
            need!(span, 2);
            ((span[1] as i8, 1), 2)
        }
        Marker::FixExt2 => {
            need!(span, 2);
            ((span[1] as i8, 2), 2)
        }
        Marker::FixExt4 => {
            need!(span, 2);
            ((span[1] as i8, 4), 2)
        }
        Marker::FixExt8 => {
            need!(span, 2);
            ((span[1] as i8, 8), 2)
        }
        Marker::FixExt16 => {
            need!(span, 2);
            ((span[1] as i8, 16), 2)
        }
        Marker::Ext8 => {
            need!(span, 3);
            ((span[2] as i8, span[1] as usize), 3)
        }
        Marker::Ext16 => {
            need!(span, 4);
            ((span[3] as i8, BigEndian::read_u16(&span[1..]) as usize), 4)
        }
        Marker::Ext32 => {
            need!(span, 6);
            ((span[5] as i8, BigEndian::read_u32(&span[1..]) as usize), 6)
        }
        Marker::Reserved => return Err(Error::InvalidCode(span[0])),
        m => return Ok(DecodeResult::TokenMismatch(m)),
    };
    Ok(DecodeResult::Success(result))
}

/// Read a timestamp extension token in any of its three payload forms.
pub fn read_timestamp(span: &[u8]) -> Result<DecodeResult<Token<Timestamp>>> {
    let (ext, header) = match read_ext_header(span)? {
        DecodeResult::Success(v) => v,
        other => return Ok(other.stall()),
    };
    let (type_code, len) = ext;
    if type_code != crate::marker::ExtType::Timestamp.into_i8() {
        // Not a timestamp; report the marker we peeked so the caller can
        // route the token elsewhere.
        return Ok(DecodeResult::TokenMismatch(Marker::from_u8(span[0])));
    }
    need!(span, header + len);
    let ts = Timestamp::decode(&span[header..header + len])?;
    Ok(DecodeResult::Success((ts, header + len)))
}

/// One step of a structural scan: how many bytes this token occupies and how
/// many child tokens follow it. Drives the iterative skip.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TokenStep {
    /// Bytes consumed by the token itself (header and any inline payload).
    pub consumed: usize,
    /// Number of complete child structures that follow.
    pub children: usize,
}

/// Classify the token at the head of the span without interpreting payloads.
///
/// Strings, binary, and extensions report their payload as `consumed`;
/// arrays and maps report only the header, with their element (or doubled
/// pair) count in `children`.
pub fn token_step(span: &[u8]) -> Result<DecodeResult<TokenStep>> {
    let marker = match marker_of(span) {
        None => return Ok(DecodeResult::EmptyBuffer),
        Some(m) => m,
    };
    let step = match marker {
        Marker::Nil
        | Marker::False
        | Marker::True
        | Marker::PosFixInt(_)
        | Marker::NegFixInt(_) => TokenStep {
            consumed: 1,
            children: 0,
        },
        Marker::UInt8 | Marker::Int8 => TokenStep {
            consumed: 2,
            children: 0,
        },
        Marker::UInt16 | Marker::Int16 => TokenStep {
            consumed: 3,
            children: 0,
        },
        Marker::UInt32 | Marker::Int32 | Marker::F32 => TokenStep {
            consumed: 5,
            children: 0,
        },
        Marker::UInt64 | Marker::Int64 | Marker::F64 => TokenStep {
            consumed: 9,
            children: 0,
        },
        Marker::FixStr(_) | Marker::Str8 | Marker::Str16 | Marker::Str32 => {
            match read_str_header(span)? {
                DecodeResult::Success((len, header)) => TokenStep {
                    consumed: header + len,
                    children: 0,
                },
                other => return Ok(other.stall()),
            }
        }
        Marker::Bin8 | Marker::Bin16 | Marker::Bin32 => match read_bin_header(span)? {
            DecodeResult::Success((len, header)) => TokenStep {
                consumed: header + len,
                children: 0,
            },
            other => return Ok(other.stall()),
        },
        Marker::Ext8
        | Marker::Ext16
        | Marker::Ext32
        | Marker::FixExt1
        | Marker::FixExt2
        | Marker::FixExt4
        | Marker::FixExt8
        | Marker::FixExt16 => match read_ext_header(span)? {
            DecodeResult::Success(((_, len), header)) => TokenStep {
                consumed: header + len,
                children: 0,
            },
            other => return Ok(other.stall()),
        },
        Marker::FixArray(_) | Marker::Array16 | Marker::Array32 => {
            match read_array_header(span)? {
                DecodeResult::Success((count, header)) => TokenStep {
                    consumed: header,
                    children: count,
                },
                other => return Ok(other.stall()),
            }
        }
        Marker::FixMap(_) | Marker::Map16 | Marker::Map32 => match read_map_header(span)? {
            DecodeResult::Success((count, header)) => TokenStep {
                consumed: header,
                children: count
                    .checked_mul(2)
                    .ok_or_else(|| Error::BadData("map pair count overflows".to_string()))?,
            },
            other => return Ok(other.stall()),
        },
        Marker::Reserved => return Err(Error::InvalidCode(span[0])),
    };
    Ok(DecodeResult::Success(step))
}

/// Interpret a little-endian reference-id payload of 1, 2, 4, or 8 bytes.
pub fn read_backref_payload(payload: &[u8]) -> Result<u64> {
    match payload.len() {
        1 => Ok(payload[0] as u64),
        2 => Ok(LittleEndian::read_u16(payload) as u64),
        4 => Ok(LittleEndian::read_u32(payload) as u64),
        8 => Ok(LittleEndian::read_u64(payload)),
        len => Err(Error::BadData(format!(
            "backreference payload is {} bytes",
            len
        ))),
    }
}

/// Shortest little-endian payload for a reference id.
pub fn backref_payload(id: u64) -> Vec<u8> {
    if u8::try_from(id).is_ok() {
        (id as u8).to_le_bytes().to_vec()
    } else if u16::try_from(id).is_ok() {
        (id as u16).to_le_bytes().to_vec()
    } else if u32::try_from(id).is_ok() {
        (id as u32).to_le_bytes().to_vec()
    } else {
        id.to_le_bytes().to_vec()
    }
}
