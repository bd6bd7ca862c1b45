//! The serializer: the crate's synchronous entry points.
//!
//! One [`Serializer`] owns a shape graph, its converter registry, and the
//! pools that recycle per-operation allocations. Operations on one
//! serializer are independent; the registry is the only shared state and
//! is safe for concurrent lookup.

use std::io;
use std::sync::{Arc, Mutex};

use crate::context::{Context, OpContext, WriteRefs};
use crate::convert::{Converter, Registry};
use crate::error::{Error, Result};
use crate::read::Reader;
use crate::shape::{ShapeGraph, ShapeId, UnionCase};
use crate::value::Value;
use crate::write::Writer;

pub struct Serializer {
    registry: Registry,
    pool: Pool,
}

impl Serializer {
    /// A serializer over a shape graph, with map-keyed object layout for
    /// shapes that don't ask otherwise.
    pub fn new(graph: Arc<ShapeGraph>) -> Self {
        Self {
            registry: Registry::new(graph, false),
            pool: Pool::default(),
        }
    }

    /// A serializer that lays every object out as an array, trading schema
    /// stability for compactness.
    pub fn new_array_layout(graph: Arc<ShapeGraph>) -> Self {
        Self {
            registry: Registry::new(graph, true),
            pool: Pool::default(),
        }
    }

    pub fn graph(&self) -> &Arc<ShapeGraph> {
        self.registry.graph()
    }

    /// Override the converter used for a shape. Must happen before the
    /// first operation touching that shape.
    pub fn register_converter(
        &self,
        shape: ShapeId,
        converter: Arc<dyn Converter>,
    ) -> Result<()> {
        self.registry.register_override(shape, converter)
    }

    /// Register a derived-type mapping on a base object shape: values of
    /// that shape thereafter travel with a subtype alias and dispatch back
    /// to the matching case on decode.
    pub fn register_union(&self, base: ShapeId, cases: Vec<UnionCase>) -> Result<()> {
        self.registry.register_union(base, cases, &Context::default())
    }

    /// Encode `value` against `shape`, draining to `sink` whenever pending
    /// bytes pass the context's flush threshold.
    pub fn serialize(
        &self,
        sink: &mut dyn io::Write,
        value: &Value,
        shape: ShapeId,
        ctx: &Context,
    ) -> Result<()> {
        let converter = self.registry.get(shape, ctx)?;
        let mut op = self.pool.take_op(ctx);
        let mut wr = Writer::new(sink, ctx.unflushed_bytes_threshold(), self.pool.take_buf());
        let outcome = converter.write(&mut wr, value, &mut op);
        match outcome {
            Ok(()) => {
                let buf = wr.finish()?;
                self.pool.put_buf(buf);
                self.pool.put_op(op);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Encode `value` against `shape` into a fresh vector.
    pub fn serialize_to_vec(
        &self,
        value: &Value,
        shape: ShapeId,
        ctx: &Context,
    ) -> Result<Vec<u8>> {
        let converter = self.registry.get(shape, ctx)?;
        let mut op = self.pool.take_op(ctx);
        let mut wr = Writer::to_vec();
        converter.write(&mut wr, value, &mut op)?;
        self.pool.put_op(op);
        Ok(wr.into_vec())
    }

    /// Decode one value of `shape` from `bytes`. The buffer must hold
    /// exactly one top-level structure.
    pub fn deserialize(&self, bytes: &[u8], shape: ShapeId, ctx: &Context) -> Result<Value> {
        let converter = self.registry.get(shape, ctx)?;
        let mut op = self.pool.take_op(ctx);
        let mut rd = Reader::new(bytes);
        let value = converter.read(&mut rd, &mut op)?;
        if !rd.is_empty() {
            return Err(Error::BadData(format!(
                "{} bytes of trailing data after the value",
                rd.remaining()
            )));
        }
        self.pool.put_op(op);
        Ok(value)
    }

    /// Decode one value of `shape` from the front of `bytes`, returning it
    /// with the number of bytes consumed. The building block for unframed
    /// concatenated streams.
    pub fn deserialize_prefix(
        &self,
        bytes: &[u8],
        shape: ShapeId,
        ctx: &Context,
    ) -> Result<(Value, usize)> {
        let converter = self.registry.get(shape, ctx)?;
        let mut op = self.pool.take_op(ctx);
        let mut rd = Reader::new(bytes);
        let value = converter.read(&mut rd, &mut op)?;
        let consumed = rd.position();
        self.pool.put_op(op);
        Ok((value, consumed))
    }
}

/// Recycled per-operation allocations: writer buffers and write-side
/// reference trackers. Access is thread-safe; contents are unordered. The
/// read-side tracker holds decoded records and is thread-confined, so it
/// is rebuilt per operation instead.
#[derive(Default)]
struct Pool {
    bufs: Mutex<Vec<Vec<u8>>>,
    trackers: Mutex<Vec<WriteRefs>>,
}

impl Pool {
    fn take_buf(&self) -> Vec<u8> {
        match self.bufs.lock() {
            Ok(mut bufs) => bufs.pop().unwrap_or_default(),
            Err(poisoned) => poisoned.into_inner().pop().unwrap_or_default(),
        }
    }

    fn put_buf(&self, mut buf: Vec<u8>) {
        buf.clear();
        if let Ok(mut bufs) = self.bufs.lock() {
            if bufs.len() < 8 {
                bufs.push(buf);
            }
        }
    }

    fn take_op(&self, ctx: &Context) -> OpContext {
        let tracker = match self.trackers.lock() {
            Ok(mut trackers) => trackers.pop(),
            Err(poisoned) => poisoned.into_inner().pop(),
        };
        OpContext::with_tracker(ctx.clone(), tracker.unwrap_or_default())
    }

    fn put_op(&self, op: OpContext) {
        if let Ok(mut trackers) = self.trackers.lock() {
            if trackers.len() < 8 {
                trackers.push(op.into_tracker());
            }
        }
    }
}
