//! Converters for scalar shapes.

use std::sync::Arc;

use crate::context::{Context, OpContext};
use crate::convert::Converter;
use crate::error::{Error, Result};
use crate::integer::Integer;
use crate::marker::{ExtType, Marker};
use crate::read::Reader;
use crate::shape::Scalar;
use crate::value::Value;
use crate::write::Writer;

pub(super) fn build(scalar: Scalar, ctx: &Context) -> Arc<dyn Converter> {
    match scalar {
        Scalar::Str if ctx.intern_strings() => Arc::new(InternStrConverter),
        Scalar::Any => Arc::new(AnyConverter),
        other => Arc::new(ScalarConverter(other)),
    }
}

fn wrong_value(expected: &'static str, value: &Value) -> Error {
    Error::BadData(format!(
        "shape expects a {} value, got {}",
        expected,
        value.kind()
    ))
}

// Reject integers outside the declared width on both sides of the wire.
fn check_width(scalar: Scalar, v: Integer) -> Result<()> {
    match scalar {
        Scalar::U8 => v.fit::<u8>().map(|_| ()),
        Scalar::U16 => v.fit::<u16>().map(|_| ()),
        Scalar::U32 => v.fit::<u32>().map(|_| ()),
        Scalar::U64 => v.fit::<u64>().map(|_| ()),
        Scalar::I8 => v.fit::<i8>().map(|_| ()),
        Scalar::I16 => v.fit::<i16>().map(|_| ()),
        Scalar::I32 => v.fit::<i32>().map(|_| ()),
        Scalar::I64 => v.fit::<i64>().map(|_| ()),
        _ => Ok(()),
    }
}

struct ScalarConverter(Scalar);

impl Converter for ScalarConverter {
    fn write(&self, wr: &mut Writer<'_>, value: &Value, ctx: &mut OpContext) -> Result<()> {
        ctx.check_cancel()?;
        match self.0 {
            Scalar::Bool => wr.write_bool(value.as_bool().ok_or_else(|| wrong_value("bool", value))?),
            Scalar::U8
            | Scalar::U16
            | Scalar::U32
            | Scalar::U64
            | Scalar::I8
            | Scalar::I16
            | Scalar::I32
            | Scalar::I64 => {
                let v = value.as_int().ok_or_else(|| wrong_value("integer", value))?;
                check_width(self.0, v)?;
                wr.write_int(v)
            }
            Scalar::F32 => match *value {
                Value::F32(v) => wr.write_f32(v),
                ref other => Err(wrong_value("f32", other)),
            },
            Scalar::F64 => match *value {
                Value::F64(v) => wr.write_f64(v),
                Value::F32(v) => wr.write_f64(v as f64),
                ref other => Err(wrong_value("f64", other)),
            },
            Scalar::Str => wr.write_str(value.as_str().ok_or_else(|| wrong_value("string", value))?),
            Scalar::Bin => wr.write_bin(value.as_bin().ok_or_else(|| wrong_value("binary", value))?),
            Scalar::Timestamp => wr.write_timestamp(
                value
                    .as_timestamp()
                    .ok_or_else(|| wrong_value("timestamp", value))?,
            ),
            Scalar::Any => unreachable!("Any builds its own converter"),
        }
    }

    fn read(&self, rd: &mut Reader<'_>, ctx: &mut OpContext) -> Result<Value> {
        ctx.check_cancel()?;
        match self.0 {
            Scalar::Bool => Ok(Value::Bool(rd.read_bool()?)),
            Scalar::U8
            | Scalar::U16
            | Scalar::U32
            | Scalar::U64
            | Scalar::I8
            | Scalar::I16
            | Scalar::I32
            | Scalar::I64 => {
                let v = rd.read_int()?;
                check_width(self.0, v)?;
                Ok(Value::Int(v))
            }
            Scalar::F32 => Ok(Value::F32(rd.read_f32()?)),
            Scalar::F64 => Ok(Value::F64(rd.read_f64()?)),
            Scalar::Str => Ok(Value::from(rd.read_str()?)),
            Scalar::Bin => Ok(Value::Bin(rd.read_bin()?.to_vec())),
            Scalar::Timestamp => Ok(Value::Timestamp(rd.read_timestamp()?)),
            Scalar::Any => unreachable!("Any builds its own converter"),
        }
    }
}

/// The dedicated string converter selected when interning is on: decoded
/// strings are deduplicated through the operation's pool.
struct InternStrConverter;

impl Converter for InternStrConverter {
    fn write(&self, wr: &mut Writer<'_>, value: &Value, ctx: &mut OpContext) -> Result<()> {
        ctx.check_cancel()?;
        wr.write_str(value.as_str().ok_or_else(|| wrong_value("string", value))?)
    }

    fn read(&self, rd: &mut Reader<'_>, ctx: &mut OpContext) -> Result<Value> {
        ctx.check_cancel()?;
        let s = rd.read_str()?;
        Ok(Value::Str(ctx.intern(s)))
    }
}

/// Self-describing values: whatever token comes next becomes the matching
/// [`Value`] variant. Records are not self-describing and are rejected.
pub(crate) struct AnyConverter;

impl Converter for AnyConverter {
    fn write(&self, wr: &mut Writer<'_>, value: &Value, ctx: &mut OpContext) -> Result<()> {
        write_any(wr, value, ctx)
    }

    fn read(&self, rd: &mut Reader<'_>, ctx: &mut OpContext) -> Result<Value> {
        read_any(rd, ctx)
    }
}

pub(crate) fn write_any(wr: &mut Writer<'_>, value: &Value, ctx: &mut OpContext) -> Result<()> {
    match value {
        Value::Null => wr.write_nil(),
        Value::Bool(v) => wr.write_bool(*v),
        Value::Int(v) => wr.write_int(*v),
        Value::F32(v) => wr.write_f32(*v),
        Value::F64(v) => wr.write_f64(*v),
        Value::Str(v) => wr.write_str(v),
        Value::Bin(v) => wr.write_bin(v),
        Value::Timestamp(v) => wr.write_timestamp(*v),
        Value::Ext(code, payload) => wr.write_ext(*code, payload),
        Value::Array(items) => {
            ctx.enter()?;
            wr.write_array_header(items.len())?;
            for item in items {
                write_any(wr, item, ctx)?;
            }
            ctx.exit();
            Ok(())
        }
        Value::Map(pairs) => {
            ctx.enter()?;
            wr.write_map_header(pairs.len())?;
            for (k, v) in pairs {
                write_any(wr, k, ctx)?;
                write_any(wr, v, ctx)?;
            }
            ctx.exit();
            Ok(())
        }
        Value::Record(_) => Err(Error::BadData(
            "record values are not self-describing; use their object shape".to_string(),
        )),
    }
}

pub(crate) fn read_any(rd: &mut Reader<'_>, ctx: &mut OpContext) -> Result<Value> {
    ctx.check_cancel()?;
    let marker = rd.peek_marker()?;
    match marker.family() {
        "nil" => {
            rd.read_nil()?;
            Ok(Value::Null)
        }
        "bool" => Ok(Value::Bool(rd.read_bool()?)),
        "integer" => Ok(Value::Int(rd.read_int()?)),
        "f32" => Ok(Value::F32(rd.read_f32()?)),
        "f64" => Ok(Value::F64(rd.read_f64()?)),
        "string" => {
            let s = rd.read_str()?;
            if ctx.config().intern_strings() {
                Ok(Value::Str(ctx.intern(s)))
            } else {
                Ok(Value::from(s))
            }
        }
        "binary" => Ok(Value::Bin(rd.read_bin()?.to_vec())),
        "array" => {
            ctx.enter()?;
            let len = rd.read_array_header()?;
            let mut items = Vec::with_capacity(len.min(1024));
            for _ in 0..len {
                items.push(read_any(rd, ctx)?);
            }
            ctx.exit();
            Ok(Value::Array(items))
        }
        "map" => {
            ctx.enter()?;
            let len = rd.read_map_header()?;
            let mut pairs = Vec::with_capacity(len.min(1024));
            for _ in 0..len {
                let k = read_any(rd, ctx)?;
                let v = read_any(rd, ctx)?;
                pairs.push((k, v));
            }
            ctx.exit();
            Ok(Value::Map(pairs))
        }
        "extension" => {
            let (code, len) = rd.read_ext_header()?;
            let payload = rd.read_payload(len)?;
            if code == ExtType::Timestamp.into_i8() {
                Ok(Value::Timestamp(crate::timestamp::Timestamp::decode(
                    payload,
                )?))
            } else {
                Ok(Value::Ext(code, payload.to_vec()))
            }
        }
        _ => Err(Error::InvalidCode(Marker::into_u8(marker))),
    }
}
