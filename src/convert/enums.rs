//! Converters for enum shapes.
//!
//! The in-memory representation is the ordinal. The wire form is the
//! ordinal by default, or the member name when the context asks for
//! names; reads accept both regardless of the write-side setting.

use std::collections::HashMap;
use std::sync::Arc;

use crate::context::{Context, OpContext};
use crate::convert::Converter;
use crate::error::{Error, Result};
use crate::integer::Integer;
use crate::read::Reader;
use crate::shape::{EnumShape, Scalar};
use crate::value::Value;
use crate::write::Writer;

pub(super) fn build(
    type_name: &str,
    shape: &EnumShape,
    ctx: &Context,
) -> Result<Arc<dyn Converter>> {
    let mut by_name = HashMap::new();
    let mut by_value = HashMap::new();
    for (name, value) in &shape.members {
        by_name.insert(name.as_bytes().to_vec(), *value);
        by_value.insert(*value, name.clone());
    }
    Ok(Arc::new(EnumConverter {
        type_name: type_name.to_string(),
        repr: shape.repr,
        write_names: ctx.serialize_enum_values_by_name(),
        by_name,
        by_value,
    }))
}

struct EnumConverter {
    type_name: String,
    repr: Scalar,
    write_names: bool,
    by_name: HashMap<Vec<u8>, Integer>,
    by_value: HashMap<Integer, String>,
}

impl EnumConverter {
    fn check_repr(&self, v: Integer) -> Result<()> {
        let fits = match self.repr {
            Scalar::U8 => v.fit::<u8>().map(|_| ()),
            Scalar::U16 => v.fit::<u16>().map(|_| ()),
            Scalar::U32 => v.fit::<u32>().map(|_| ()),
            Scalar::U64 => v.fit::<u64>().map(|_| ()),
            Scalar::I8 => v.fit::<i8>().map(|_| ()),
            Scalar::I16 => v.fit::<i16>().map(|_| ()),
            Scalar::I32 => v.fit::<i32>().map(|_| ()),
            _ => v.fit::<i64>().map(|_| ()),
        };
        fits
    }

    fn ordinal_of(&self, value: &Value) -> Result<Integer> {
        match value {
            Value::Int(v) => Ok(*v),
            // A member name is accepted in place of the ordinal.
            Value::Str(name) => self
                .by_name
                .get(name.as_bytes())
                .copied()
                .ok_or_else(|| {
                    Error::BadData(format!(
                        "\"{}\" is not a member of enum {}",
                        name, self.type_name
                    ))
                }),
            other => Err(Error::BadData(format!(
                "enum {} expects an ordinal or member name, got {}",
                self.type_name,
                other.kind()
            ))),
        }
    }
}

impl Converter for EnumConverter {
    fn write(&self, wr: &mut Writer<'_>, value: &Value, ctx: &mut OpContext) -> Result<()> {
        ctx.check_cancel()?;
        let ordinal = self.ordinal_of(value)?;
        self.check_repr(ordinal)?;
        if self.write_names {
            match self.by_value.get(&ordinal) {
                Some(name) => wr.write_str(name),
                // Out-of-range ordinals have no name to write.
                None => Err(Error::BadData(format!(
                    "enum {} has no member named for value {}",
                    self.type_name, ordinal
                ))),
            }
        } else {
            wr.write_int(ordinal)
        }
    }

    fn read(&self, rd: &mut Reader<'_>, ctx: &mut OpContext) -> Result<Value> {
        ctx.check_cancel()?;
        match rd.peek_marker()?.family() {
            "string" => {
                let name = rd.read_str_bytes()?;
                match self.by_name.get(name) {
                    Some(ordinal) => Ok(Value::Int(*ordinal)),
                    None => Err(Error::BadData(format!(
                        "\"{}\" is not a member of enum {}",
                        String::from_utf8_lossy(name),
                        self.type_name
                    ))),
                }
            }
            "integer" => {
                // Unknown ordinals pass through; additive evolution keeps
                // old readers working.
                let ordinal = rd.read_int()?;
                self.check_repr(ordinal)?;
                Ok(Value::Int(ordinal))
            }
            family => Err(Error::TokenMismatch {
                expected: "enum ordinal or name",
                found: family,
            }),
        }
    }
}
