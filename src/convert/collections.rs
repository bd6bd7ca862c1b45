//! Converters for dictionary and sequence shapes.

use std::sync::Arc;

use crate::context::{Context, MultiDimFormat, OpContext};
use crate::convert::{Converter, Registry};
use crate::error::{Error, Result};
use crate::integer::Integer;
use crate::read::Reader;
use crate::shape::{Construction, DictShape, Scalar, SeqShape, ShapeKind};
use crate::value::Value;
use crate::write::Writer;

pub(super) fn build_dict(
    registry: &Registry,
    ctx: &Context,
    shape: &DictShape,
) -> Result<Arc<dyn Converter>> {
    Ok(Arc::new(DictConverter {
        key: registry.get(shape.key, ctx)?,
        value: registry.get(shape.value, ctx)?,
        construction: shape.construction,
    }))
}

pub(super) fn build_seq(
    registry: &Registry,
    ctx: &Context,
    shape: &SeqShape,
) -> Result<Arc<dyn Converter>> {
    // An integer element scalar unlocks the bulk encoder.
    let element_scalar = match &registry.graph().get(shape.element).kind {
        ShapeKind::Scalar(s) if s.is_integer() => Some(*s),
        _ => None,
    };
    Ok(Arc::new(SeqConverter {
        element: registry.get(shape.element, ctx)?,
        element_scalar,
        rank: shape.rank,
        flat: ctx.multi_dimensional_array_format() == MultiDimFormat::Flat,
        construction: shape.construction,
    }))
}

fn unconstructible() -> Error {
    Error::Config("this collection shape has no construction strategy".to_string())
}

struct DictConverter {
    key: Arc<dyn Converter>,
    value: Arc<dyn Converter>,
    construction: Construction,
}

impl Converter for DictConverter {
    fn write(&self, wr: &mut Writer<'_>, value: &Value, ctx: &mut OpContext) -> Result<()> {
        let pairs = value.as_map().ok_or_else(|| {
            Error::BadData(format!("dictionary shape expects a map, got {}", value.kind()))
        })?;
        ctx.enter()?;
        wr.write_map_header(pairs.len())?;
        for (k, v) in pairs {
            self.key.write(wr, k, ctx)?;
            self.value.write(wr, v, ctx)?;
        }
        ctx.exit();
        Ok(())
    }

    fn read(&self, rd: &mut Reader<'_>, ctx: &mut OpContext) -> Result<Value> {
        ctx.enter()?;
        let len = rd.read_map_header()?;
        let mut pairs = match self.construction {
            Construction::None => return Err(unconstructible()),
            Construction::Mutable => Vec::new(),
            Construction::Sized => Vec::with_capacity(len.min(1024)),
        };
        for _ in 0..len {
            let k = self.key.read(rd, ctx)?;
            let v = self.value.read(rd, ctx)?;
            pairs.push((k, v));
        }
        ctx.exit();
        Ok(Value::Map(pairs))
    }
}

struct SeqConverter {
    element: Arc<dyn Converter>,
    element_scalar: Option<Scalar>,
    rank: u32,
    flat: bool,
    construction: Construction,
}

impl SeqConverter {
    // All-integer slices take the chunked bulk path; output is identical
    // to the element-wise converter.
    fn try_bulk_write(
        &self,
        wr: &mut Writer<'_>,
        items: &[Value],
    ) -> Result<bool> {
        let scalar = match self.element_scalar {
            Some(s) => s,
            None => return Ok(false),
        };
        // A lane outside the declared width falls back to the element
        // converter, which reports the overflow.
        let unsigned = matches!(scalar, Scalar::U8 | Scalar::U16 | Scalar::U32 | Scalar::U64);
        if unsigned {
            let max = match scalar {
                Scalar::U8 => u8::MAX as u64,
                Scalar::U16 => u16::MAX as u64,
                Scalar::U32 => u32::MAX as u64,
                _ => u64::MAX,
            };
            let mut lanes = Vec::with_capacity(items.len());
            for item in items {
                match item.as_int().and_then(|v| v.as_u64()) {
                    Some(v) if v <= max => lanes.push(v),
                    _ => return Ok(false),
                }
            }
            wr.write_uint_slice(&lanes)?;
        } else {
            let (min, max) = match scalar {
                Scalar::I8 => (i8::MIN as i64, i8::MAX as i64),
                Scalar::I16 => (i16::MIN as i64, i16::MAX as i64),
                Scalar::I32 => (i32::MIN as i64, i32::MAX as i64),
                _ => (i64::MIN, i64::MAX),
            };
            let mut lanes = Vec::with_capacity(items.len());
            for item in items {
                match item.as_int().and_then(|v| v.as_i64()) {
                    Some(v) if (min..=max).contains(&v) => lanes.push(v),
                    _ => return Ok(false),
                }
            }
            wr.write_sint_slice(&lanes)?;
        }
        Ok(true)
    }

    fn write_dim(
        &self,
        wr: &mut Writer<'_>,
        value: &Value,
        dim: u32,
        ctx: &mut OpContext,
    ) -> Result<()> {
        if dim == self.rank {
            return self.element.write(wr, value, ctx);
        }
        let items = value.as_array().ok_or_else(|| {
            Error::BadData(format!("sequence shape expects an array, got {}", value.kind()))
        })?;
        ctx.enter()?;
        wr.write_array_header(items.len())?;
        if dim + 1 == self.rank && self.try_bulk_write(wr, items)? {
            ctx.exit();
            return Ok(());
        }
        for item in items {
            self.write_dim(wr, item, dim + 1, ctx)?;
        }
        ctx.exit();
        Ok(())
    }

    fn read_dim(&self, rd: &mut Reader<'_>, dim: u32, ctx: &mut OpContext) -> Result<Value> {
        if dim == self.rank {
            return self.element.read(rd, ctx);
        }
        ctx.enter()?;
        let len = rd.read_array_header()?;
        let mut items = match self.construction {
            Construction::None => return Err(unconstructible()),
            Construction::Mutable => Vec::new(),
            Construction::Sized => Vec::with_capacity(len.min(1024)),
        };
        for _ in 0..len {
            items.push(self.read_dim(rd, dim + 1, ctx)?);
        }
        ctx.exit();
        Ok(Value::Array(items))
    }

    // Flat layout: one array holding the dimension lengths, then every
    // element in row-major order.
    fn write_flat(&self, wr: &mut Writer<'_>, value: &Value, ctx: &mut OpContext) -> Result<()> {
        let mut dims = Vec::with_capacity(self.rank as usize);
        let mut cursor = value;
        for _ in 0..self.rank {
            let items = cursor.as_array().ok_or_else(|| {
                Error::BadData(format!(
                    "sequence shape expects an array, got {}",
                    cursor.kind()
                ))
            })?;
            dims.push(items.len());
            match items.first() {
                Some(next) => cursor = next,
                None => break,
            }
        }
        while dims.len() < self.rank as usize {
            dims.push(0);
        }

        let total: usize = dims.iter().product();
        ctx.enter()?;
        wr.write_array_header(self.rank as usize + total)?;
        for &d in &dims {
            wr.write_int(Integer::from(d))?;
        }
        self.flatten(wr, value, &dims, 0, ctx)?;
        ctx.exit();
        Ok(())
    }

    fn flatten(
        &self,
        wr: &mut Writer<'_>,
        value: &Value,
        dims: &[usize],
        dim: usize,
        ctx: &mut OpContext,
    ) -> Result<()> {
        if dim == dims.len() {
            return self.element.write(wr, value, ctx);
        }
        let items = value.as_array().ok_or_else(|| {
            Error::BadData(format!("sequence shape expects an array, got {}", value.kind()))
        })?;
        if items.len() != dims[dim] {
            return Err(Error::BadData(format!(
                "ragged multi-dimensional array: expected {} elements, found {}",
                dims[dim],
                items.len()
            )));
        }
        for item in items {
            self.flatten(wr, item, dims, dim + 1, ctx)?;
        }
        Ok(())
    }

    fn read_flat(&self, rd: &mut Reader<'_>, ctx: &mut OpContext) -> Result<Value> {
        if self.construction == Construction::None {
            return Err(unconstructible());
        }
        ctx.enter()?;
        let len = rd.read_array_header()?;
        if len < self.rank as usize {
            return Err(Error::BadData(format!(
                "flat array of rank {} needs at least {} header elements",
                self.rank, self.rank
            )));
        }
        let mut dims = Vec::with_capacity(self.rank as usize);
        for _ in 0..self.rank {
            dims.push(rd.read_fit::<usize>()?);
        }
        let total: usize = dims.iter().product();
        if len != self.rank as usize + total {
            return Err(Error::BadData(format!(
                "flat array claims {} elements but holds {}",
                total,
                len - self.rank as usize
            )));
        }
        let mut flat = Vec::with_capacity(total.min(1024));
        for _ in 0..total {
            flat.push(self.element.read(rd, ctx)?);
        }
        ctx.exit();
        Ok(unflatten(&mut flat.into_iter(), &dims))
    }
}

fn unflatten(flat: &mut std::vec::IntoIter<Value>, dims: &[usize]) -> Value {
    match dims.split_first() {
        None => flat.next().unwrap_or(Value::Null),
        Some((&d, rest)) => {
            let mut items = Vec::with_capacity(d);
            for _ in 0..d {
                items.push(unflatten(flat, rest));
            }
            Value::Array(items)
        }
    }
}

impl Converter for SeqConverter {
    fn write(&self, wr: &mut Writer<'_>, value: &Value, ctx: &mut OpContext) -> Result<()> {
        if self.rank > 1 && self.flat {
            self.write_flat(wr, value, ctx)
        } else {
            self.write_dim(wr, value, 0, ctx)
        }
    }

    fn read(&self, rd: &mut Reader<'_>, ctx: &mut OpContext) -> Result<Value> {
        if self.rank > 1 && self.flat {
            self.read_flat(rd, ctx)
        } else {
            self.read_dim(rd, 0, ctx)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::ShapeGraph;

    fn seq_registry(scalar: Scalar, construction: Construction) -> (Registry, crate::shape::ShapeId) {
        let mut graph = ShapeGraph::new();
        let elem = graph.scalar(scalar);
        let seq = graph.sequence(elem, construction);
        (Registry::new(Arc::new(graph), false), seq)
    }

    fn roundtrip(registry: &Registry, shape: crate::shape::ShapeId, ctx: Context, value: &Value) -> (Vec<u8>, Value) {
        let conv = registry.get(shape, &ctx).unwrap();
        let mut op = OpContext::new(ctx);
        let mut wr = Writer::to_vec();
        conv.write(&mut wr, value, &mut op).unwrap();
        let bytes = wr.into_vec();
        let mut rd = Reader::new(&bytes);
        let back = conv.read(&mut rd, &mut op).unwrap();
        assert!(rd.is_empty());
        (bytes, back)
    }

    #[test]
    fn sequence_roundtrip_and_encoding() {
        let (registry, seq) = seq_registry(Scalar::U32, Construction::Sized);
        let value = Value::Array(vec![Value::from(1u8), Value::from(2u8), Value::from(3u8)]);
        let (bytes, back) = roundtrip(&registry, seq, Context::new(), &value);
        assert_eq!(bytes, [0x93, 0x01, 0x02, 0x03]);
        assert_eq!(back, value);
    }

    #[test]
    fn bulk_path_matches_scalar_encoding() {
        let (registry, seq) = seq_registry(Scalar::U64, Construction::Mutable);
        let items: Vec<Value> = (0..40u64).map(|v| Value::from(v * 7919)).collect();
        let value = Value::Array(items);
        let (_, back) = roundtrip(&registry, seq, Context::new(), &value);
        assert_eq!(back, value);
    }

    #[test]
    fn dict_preserves_order() {
        let mut graph = ShapeGraph::new();
        let key = graph.scalar(Scalar::Str);
        let val = graph.scalar(Scalar::U32);
        let dict = graph.dictionary(key, val, Construction::Mutable);
        let registry = Registry::new(Arc::new(graph), false);
        let value = Value::Map(vec![
            (Value::from("b"), Value::from(2u8)),
            (Value::from("a"), Value::from(1u8)),
        ]);
        let (bytes, back) = roundtrip(&registry, dict, Context::new(), &value);
        assert_eq!(bytes[0], 0x82);
        assert_eq!(back, value, "wire order must survive the round trip");
    }

    #[test]
    fn unconstructible_dict_fails_on_read_only() {
        let mut graph = ShapeGraph::new();
        let key = graph.scalar(Scalar::Str);
        let val = graph.scalar(Scalar::U32);
        let dict = graph.dictionary(key, val, Construction::None);
        let registry = Registry::new(Arc::new(graph), false);
        let ctx = Context::new();
        let conv = registry.get(dict, &ctx).unwrap();
        let mut op = OpContext::new(ctx);

        let value = Value::Map(vec![(Value::from("a"), Value::from(1u8))]);
        let mut wr = Writer::to_vec();
        conv.write(&mut wr, &value, &mut op).unwrap();
        let bytes = wr.into_vec();

        let mut rd = Reader::new(&bytes);
        match conv.read(&mut rd, &mut op) {
            Err(Error::Config(_)) => (),
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn nested_multidim_roundtrip() {
        let mut graph = ShapeGraph::new();
        let elem = graph.scalar(Scalar::U32);
        let grid = graph.multi_array(elem, 2, Construction::Sized).unwrap();
        let registry = Registry::new(Arc::new(graph), false);
        let value = Value::Array(vec![
            Value::Array(vec![Value::from(1u8), Value::from(2u8)]),
            Value::Array(vec![Value::from(3u8), Value::from(4u8)]),
        ]);
        let (bytes, back) = roundtrip(&registry, grid, Context::new(), &value);
        // Nested: [[1,2],[3,4]]
        assert_eq!(bytes, [0x92, 0x92, 0x01, 0x02, 0x92, 0x03, 0x04]);
        assert_eq!(back, value);
    }

    #[test]
    fn flat_multidim_roundtrip() {
        let mut graph = ShapeGraph::new();
        let elem = graph.scalar(Scalar::U32);
        let grid = graph.multi_array(elem, 2, Construction::Sized).unwrap();
        let registry = Registry::new(Arc::new(graph), false);
        let ctx = Context::new().with_multi_dimensional_array_format(MultiDimFormat::Flat);
        let value = Value::Array(vec![
            Value::Array(vec![Value::from(1u8), Value::from(2u8), Value::from(3u8)]),
            Value::Array(vec![Value::from(4u8), Value::from(5u8), Value::from(6u8)]),
        ]);
        let (bytes, back) = roundtrip(&registry, grid, ctx, &value);
        // Flat: [2, 3, 1, 2, 3, 4, 5, 6]
        assert_eq!(bytes, [0x98, 0x02, 0x03, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        assert_eq!(back, value);
    }

    #[test]
    fn ragged_flat_rejected() {
        let mut graph = ShapeGraph::new();
        let elem = graph.scalar(Scalar::U32);
        let grid = graph.multi_array(elem, 2, Construction::Sized).unwrap();
        let registry = Registry::new(Arc::new(graph), false);
        let ctx = Context::new().with_multi_dimensional_array_format(MultiDimFormat::Flat);
        let conv = registry.get(grid, &ctx).unwrap();
        let mut op = OpContext::new(ctx);
        let ragged = Value::Array(vec![
            Value::Array(vec![Value::from(1u8), Value::from(2u8)]),
            Value::Array(vec![Value::from(3u8)]),
        ]);
        let mut wr = Writer::to_vec();
        match conv.write(&mut wr, &ragged, &mut op) {
            Err(Error::BadData(msg)) => assert!(msg.contains("ragged")),
            other => panic!("expected ragged rejection, got {:?}", other),
        }
    }
}
