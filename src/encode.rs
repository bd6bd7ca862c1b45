//! Wire-level msgpack encoding primitives.
//!
//! Two surfaces over the same shortest-form ladders: `try_write_*` writes a
//! single token into a caller-provided span and refuses (without a partial
//! write) when the span is too small, while `put_*` appends to a growable
//! buffer. Integers always take the shortest encoding that preserves the
//! signedness interpretation.

use crate::integer::{get_int_internal, Integer, IntPriv};
use crate::marker::Marker;
use crate::timestamp::Timestamp;

/// The span handed to a `try_write_*` call can't hold the encoded token.
/// Nothing was written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferTooSmall;

/// Longest encoding of a single integer token: marker plus eight bytes.
pub const MAX_INT_LEN: usize = 9;
/// Longest header this library emits: ext32 (marker, 4 length bytes, type).
pub const MAX_HEADER_LEN: usize = 6;

/// Number of bytes the shortest encoding of `v` occupies, marker included.
pub fn int_len(v: Integer) -> usize {
    match get_int_internal(&v) {
        IntPriv::PosInt(v) => {
            if v <= 127 {
                1
            } else if v <= u8::MAX as u64 {
                2
            } else if v <= u16::MAX as u64 {
                3
            } else if v <= u32::MAX as u64 {
                5
            } else {
                9
            }
        }
        IntPriv::NegInt(v) => {
            if v >= -32 {
                1
            } else if v >= i8::MIN as i64 {
                2
            } else if v >= i16::MIN as i64 {
                3
            } else if v >= i32::MIN as i64 {
                5
            } else {
                9
            }
        }
    }
}

// The single copy of the shortest-form ladder. `tmp` always has room.
fn write_int_into(tmp: &mut [u8; MAX_INT_LEN], v: Integer) -> usize {
    match get_int_internal(&v) {
        IntPriv::PosInt(v) => {
            if v <= 127 {
                tmp[0] = Marker::PosFixInt(v as u8).into();
                1
            } else if v <= u8::MAX as u64 {
                tmp[0] = Marker::UInt8.into();
                tmp[1] = v as u8;
                2
            } else if v <= u16::MAX as u64 {
                tmp[0] = Marker::UInt16.into();
                tmp[1..3].copy_from_slice(&(v as u16).to_be_bytes());
                3
            } else if v <= u32::MAX as u64 {
                tmp[0] = Marker::UInt32.into();
                tmp[1..5].copy_from_slice(&(v as u32).to_be_bytes());
                5
            } else {
                tmp[0] = Marker::UInt64.into();
                tmp[1..9].copy_from_slice(&v.to_be_bytes());
                9
            }
        }
        IntPriv::NegInt(v) => {
            if v >= -32 {
                tmp[0] = Marker::NegFixInt(v as i8).into();
                1
            } else if v >= i8::MIN as i64 {
                tmp[0] = Marker::Int8.into();
                tmp[1] = v as u8;
                2
            } else if v >= i16::MIN as i64 {
                tmp[0] = Marker::Int16.into();
                tmp[1..3].copy_from_slice(&(v as i16).to_be_bytes());
                3
            } else if v >= i32::MIN as i64 {
                tmp[0] = Marker::Int32.into();
                tmp[1..5].copy_from_slice(&(v as i32).to_be_bytes());
                5
            } else {
                tmp[0] = Marker::Int64.into();
                tmp[1..9].copy_from_slice(&v.to_be_bytes());
                9
            }
        }
    }
}

fn header_into(tmp: &mut [u8; MAX_HEADER_LEN], kind: HeaderKind, len: usize) -> usize {
    debug_assert!(len <= u32::MAX as usize);
    match kind {
        HeaderKind::Str => {
            if len <= 31 {
                tmp[0] = Marker::FixStr(len as u8).into();
                1
            } else if len <= u8::MAX as usize {
                tmp[0] = Marker::Str8.into();
                tmp[1] = len as u8;
                2
            } else if len <= u16::MAX as usize {
                tmp[0] = Marker::Str16.into();
                tmp[1..3].copy_from_slice(&(len as u16).to_be_bytes());
                3
            } else {
                tmp[0] = Marker::Str32.into();
                tmp[1..5].copy_from_slice(&(len as u32).to_be_bytes());
                5
            }
        }
        HeaderKind::Bin => {
            if len <= u8::MAX as usize {
                tmp[0] = Marker::Bin8.into();
                tmp[1] = len as u8;
                2
            } else if len <= u16::MAX as usize {
                tmp[0] = Marker::Bin16.into();
                tmp[1..3].copy_from_slice(&(len as u16).to_be_bytes());
                3
            } else {
                tmp[0] = Marker::Bin32.into();
                tmp[1..5].copy_from_slice(&(len as u32).to_be_bytes());
                5
            }
        }
        HeaderKind::Array => {
            if len <= 15 {
                tmp[0] = Marker::FixArray(len as u8).into();
                1
            } else if len <= u16::MAX as usize {
                tmp[0] = Marker::Array16.into();
                tmp[1..3].copy_from_slice(&(len as u16).to_be_bytes());
                3
            } else {
                tmp[0] = Marker::Array32.into();
                tmp[1..5].copy_from_slice(&(len as u32).to_be_bytes());
                5
            }
        }
        HeaderKind::Map => {
            if len <= 15 {
                tmp[0] = Marker::FixMap(len as u8).into();
                1
            } else if len <= u16::MAX as usize {
                tmp[0] = Marker::Map16.into();
                tmp[1..3].copy_from_slice(&(len as u16).to_be_bytes());
                3
            } else {
                tmp[0] = Marker::Map32.into();
                tmp[1..5].copy_from_slice(&(len as u32).to_be_bytes());
                5
            }
        }
    }
}

#[derive(Clone, Copy)]
enum HeaderKind {
    Str,
    Bin,
    Array,
    Map,
}

fn ext_header_into(tmp: &mut [u8; MAX_HEADER_LEN], type_code: i8, len: usize) -> usize {
    debug_assert!(len <= u32::MAX as usize);
    let n = match len {
        1 => {
            tmp[0] = Marker::FixExt1.into();
            1
        }
        2 => {
            tmp[0] = Marker::FixExt2.into();
            1
        }
        4 => {
            tmp[0] = Marker::FixExt4.into();
            1
        }
        8 => {
            tmp[0] = Marker::FixExt8.into();
            1
        }
        16 => {
            tmp[0] = Marker::FixExt16.into();
            1
        }
        len if len <= u8::MAX as usize => {
            tmp[0] = Marker::Ext8.into();
            tmp[1] = len as u8;
            2
        }
        len if len <= u16::MAX as usize => {
            tmp[0] = Marker::Ext16.into();
            tmp[1..3].copy_from_slice(&(len as u16).to_be_bytes());
            3
        }
        len => {
            tmp[0] = Marker::Ext32.into();
            tmp[1..5].copy_from_slice(&(len as u32).to_be_bytes());
            5
        }
    };
    tmp[n] = type_code as u8;
    n + 1
}

macro_rules! span_write {
    ($span:expr, $tmp:ident, $len:expr) => {{
        let len = $len;
        if $span.len() < len {
            return Err(BufferTooSmall);
        }
        $span[..len].copy_from_slice(&$tmp[..len]);
        Ok(len)
    }};
}

/// Write a nil token. Returns the number of bytes written.
pub fn try_write_nil(span: &mut [u8]) -> Result<usize, BufferTooSmall> {
    if span.is_empty() {
        return Err(BufferTooSmall);
    }
    span[0] = Marker::Nil.into();
    Ok(1)
}

/// Write a bool token.
pub fn try_write_bool(span: &mut [u8], v: bool) -> Result<usize, BufferTooSmall> {
    if span.is_empty() {
        return Err(BufferTooSmall);
    }
    span[0] = if v { Marker::True } else { Marker::False }.into();
    Ok(1)
}

/// Write an integer in shortest form.
pub fn try_write_int(span: &mut [u8], v: Integer) -> Result<usize, BufferTooSmall> {
    let mut tmp = [0u8; MAX_INT_LEN];
    let len = write_int_into(&mut tmp, v);
    span_write!(span, tmp, len)
}

/// Write an f32 token. Always 5 bytes; never down-converted.
pub fn try_write_f32(span: &mut [u8], v: f32) -> Result<usize, BufferTooSmall> {
    if span.len() < 5 {
        return Err(BufferTooSmall);
    }
    span[0] = Marker::F32.into();
    span[1..5].copy_from_slice(&v.to_bits().to_be_bytes());
    Ok(5)
}

/// Write an f64 token. Always 9 bytes.
pub fn try_write_f64(span: &mut [u8], v: f64) -> Result<usize, BufferTooSmall> {
    if span.len() < 9 {
        return Err(BufferTooSmall);
    }
    span[0] = Marker::F64.into();
    span[1..9].copy_from_slice(&v.to_bits().to_be_bytes());
    Ok(9)
}

/// Write a string header for `len` UTF-8 bytes.
pub fn try_write_str_header(span: &mut [u8], len: usize) -> Result<usize, BufferTooSmall> {
    let mut tmp = [0u8; MAX_HEADER_LEN];
    let n = header_into(&mut tmp, HeaderKind::Str, len);
    span_write!(span, tmp, n)
}

/// Write a binary header for `len` raw bytes.
pub fn try_write_bin_header(span: &mut [u8], len: usize) -> Result<usize, BufferTooSmall> {
    let mut tmp = [0u8; MAX_HEADER_LEN];
    let n = header_into(&mut tmp, HeaderKind::Bin, len);
    span_write!(span, tmp, n)
}

/// Write an array header for `len` elements.
pub fn try_write_array_header(span: &mut [u8], len: usize) -> Result<usize, BufferTooSmall> {
    let mut tmp = [0u8; MAX_HEADER_LEN];
    let n = header_into(&mut tmp, HeaderKind::Array, len);
    span_write!(span, tmp, n)
}

/// Write a map header for `len` key/value pairs.
pub fn try_write_map_header(span: &mut [u8], len: usize) -> Result<usize, BufferTooSmall> {
    let mut tmp = [0u8; MAX_HEADER_LEN];
    let n = header_into(&mut tmp, HeaderKind::Map, len);
    span_write!(span, tmp, n)
}

/// Write an extension header (marker, length, type code) for a payload of
/// `len` bytes.
pub fn try_write_ext_header(
    span: &mut [u8],
    type_code: i8,
    len: usize,
) -> Result<usize, BufferTooSmall> {
    let mut tmp = [0u8; MAX_HEADER_LEN];
    let n = ext_header_into(&mut tmp, type_code, len);
    span_write!(span, tmp, n)
}

pub fn put_nil(buf: &mut Vec<u8>) {
    buf.push(Marker::Nil.into());
}

pub fn put_bool(buf: &mut Vec<u8>, v: bool) {
    buf.push(if v { Marker::True } else { Marker::False }.into());
}

pub fn put_int(buf: &mut Vec<u8>, v: Integer) {
    let mut tmp = [0u8; MAX_INT_LEN];
    let n = write_int_into(&mut tmp, v);
    buf.extend_from_slice(&tmp[..n]);
}

pub fn put_f32(buf: &mut Vec<u8>, v: f32) {
    buf.push(Marker::F32.into());
    buf.extend_from_slice(&v.to_bits().to_be_bytes());
}

pub fn put_f64(buf: &mut Vec<u8>, v: f64) {
    buf.push(Marker::F64.into());
    buf.extend_from_slice(&v.to_bits().to_be_bytes());
}

pub fn put_str(buf: &mut Vec<u8>, v: &str) {
    let mut tmp = [0u8; MAX_HEADER_LEN];
    let n = header_into(&mut tmp, HeaderKind::Str, v.len());
    buf.extend_from_slice(&tmp[..n]);
    buf.extend_from_slice(v.as_bytes());
}

/// Append a string token whose UTF-8 payload was validated elsewhere (the
/// pre-encoded property-name path).
pub fn put_str_bytes(buf: &mut Vec<u8>, v: &[u8]) {
    let mut tmp = [0u8; MAX_HEADER_LEN];
    let n = header_into(&mut tmp, HeaderKind::Str, v.len());
    buf.extend_from_slice(&tmp[..n]);
    buf.extend_from_slice(v);
}

pub fn put_bin(buf: &mut Vec<u8>, v: &[u8]) {
    let mut tmp = [0u8; MAX_HEADER_LEN];
    let n = header_into(&mut tmp, HeaderKind::Bin, v.len());
    buf.extend_from_slice(&tmp[..n]);
    buf.extend_from_slice(v);
}

pub fn put_array_header(buf: &mut Vec<u8>, len: usize) {
    let mut tmp = [0u8; MAX_HEADER_LEN];
    let n = header_into(&mut tmp, HeaderKind::Array, len);
    buf.extend_from_slice(&tmp[..n]);
}

pub fn put_map_header(buf: &mut Vec<u8>, len: usize) {
    let mut tmp = [0u8; MAX_HEADER_LEN];
    let n = header_into(&mut tmp, HeaderKind::Map, len);
    buf.extend_from_slice(&tmp[..n]);
}

pub fn put_ext_header(buf: &mut Vec<u8>, type_code: i8, len: usize) {
    let mut tmp = [0u8; MAX_HEADER_LEN];
    let n = ext_header_into(&mut tmp, type_code, len);
    buf.extend_from_slice(&tmp[..n]);
}

pub fn put_timestamp(buf: &mut Vec<u8>, v: Timestamp) {
    put_ext_header(buf, crate::marker::ExtType::Timestamp.into(), v.size());
    v.encode_vec(buf);
}

/// Bulk-encode a slice of unsigned integers.
///
/// Chunks of lanes that all land in the positive-fixint range are emitted as
/// a straight byte run; anything else falls back to the scalar ladder. The
/// output is byte-identical to encoding each element with [`put_int`].
pub fn put_uint_slice(buf: &mut Vec<u8>, vals: &[u64]) {
    const LANES: usize = 8;
    buf.reserve(vals.len());
    let mut chunks = vals.chunks_exact(LANES);
    for chunk in &mut chunks {
        let mask = chunk.iter().fold(0u64, |acc, v| acc | v);
        if mask <= 127 {
            let mut lane = [0u8; LANES];
            for (dst, v) in lane.iter_mut().zip(chunk) {
                *dst = *v as u8;
            }
            buf.extend_from_slice(&lane);
        } else {
            for &v in chunk {
                put_int(buf, Integer::from(v));
            }
        }
    }
    for &v in chunks.remainder() {
        put_int(buf, Integer::from(v));
    }
}

/// Bulk-encode a slice of signed integers. Same contract as
/// [`put_uint_slice`]: byte-identical to the element-wise scalar rule.
pub fn put_sint_slice(buf: &mut Vec<u8>, vals: &[i64]) {
    const LANES: usize = 8;
    buf.reserve(vals.len());
    let mut chunks = vals.chunks_exact(LANES);
    for chunk in &mut chunks {
        let fix = chunk.iter().all(|&v| (-32..=127).contains(&v));
        if fix {
            let mut lane = [0u8; LANES];
            for (dst, v) in lane.iter_mut().zip(chunk) {
                *dst = *v as i8 as u8;
            }
            buf.extend_from_slice(&lane);
        } else {
            for &v in chunk {
                put_int(buf, Integer::from(v));
            }
        }
    }
    for &v in chunks.remainder() {
        put_int(buf, Integer::from(v));
    }
}
