//! Converter construction and caching.
//!
//! A converter is the pair of functions that move one shape's values across
//! the wire. The registry builds converters on first demand by matching on
//! the shape kind, memoizes them by `(shape, build-relevant options)`, and
//! survives cyclic shape graphs by parking a delayed forwarder in the table
//! before construction starts: a shape that reaches itself during its own
//! build finds the forwarder and links against it.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::context::{Context, MemberInfluence, OpContext};
use crate::error::{Error, Result};
use crate::read::Reader;
use crate::shape::{ShapeGraph, ShapeId, ShapeKind, UnionCase};
use crate::value::Value;
use crate::write::Writer;

mod collections;
mod enums;
mod object;
mod reference;
mod scalar;
mod union;

pub(crate) use reference::RefGuard;

/// The pair of functions that carry one shape across the wire.
///
/// Implementations must be stateless across calls: everything per-operation
/// lives in the [`OpContext`].
pub trait Converter: Send + Sync {
    fn write(&self, wr: &mut Writer<'_>, value: &Value, ctx: &mut OpContext) -> Result<()>;
    fn read(&self, rd: &mut Reader<'_>, ctx: &mut OpContext) -> Result<Value>;
}

type Key = (ShapeId, MemberInfluence);

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Builds and memoizes converters for one serializer.
pub(crate) struct Registry {
    graph: Arc<ShapeGraph>,
    /// Encode objects without explicit indices as arrays anyway, trading
    /// schema stability for compactness.
    array_by_default: bool,
    table: RwLock<HashMap<Key, Arc<dyn Converter>>>,
    overrides: RwLock<HashMap<ShapeId, Arc<dyn Converter>>>,
}

impl Registry {
    pub fn new(graph: Arc<ShapeGraph>, array_by_default: bool) -> Self {
        Self {
            graph,
            array_by_default,
            table: RwLock::new(HashMap::new()),
            overrides: RwLock::new(HashMap::new()),
        }
    }

    pub fn graph(&self) -> &Arc<ShapeGraph> {
        &self.graph
    }

    pub fn array_by_default(&self) -> bool {
        self.array_by_default
    }

    /// Install a runtime converter override for a shape. Rejected once a
    /// converter for the shape has already been handed out.
    pub fn register_override(&self, shape: ShapeId, converter: Arc<dyn Converter>) -> Result<()> {
        let table = read_lock(&self.table);
        if table.keys().any(|(id, _)| *id == shape) {
            return Err(Error::Config(format!(
                "shape \"{}\" already has a built converter",
                self.graph.name(shape)
            )));
        }
        drop(table);
        write_lock(&self.overrides).insert(shape, converter);
        Ok(())
    }

    /// Install a runtime union mapping for a base shape: the base is
    /// thereafter (de)serialized polymorphically.
    pub fn register_union(
        &self,
        base: ShapeId,
        cases: Vec<UnionCase>,
        ctx: &Context,
    ) -> Result<()> {
        let converter = union::build_mapping(self, ctx, base, cases)?;
        self.register_override(base, converter)
    }

    /// Fetch (building if needed) the converter for a shape. Repeated calls
    /// with the same shape and build-relevant options return the same
    /// converter object.
    pub fn get(&self, shape: ShapeId, ctx: &Context) -> Result<Arc<dyn Converter>> {
        let key = (shape, ctx.member_influence());
        if let Some(found) = read_lock(&self.table).get(&key) {
            return Ok(found.clone());
        }

        // Park a forwarder under the key first: a cyclic shape reaching
        // itself mid-build links against the forwarder instead of
        // re-entering construction.
        let delayed = Arc::new(Delayed::default());
        {
            let mut table = write_lock(&self.table);
            if let Some(found) = table.get(&key) {
                return Ok(found.clone());
            }
            table.insert(key, delayed.clone());
        }

        match self.build(shape, ctx) {
            Ok(real) => {
                delayed.fill(real.clone());
                write_lock(&self.table).insert(key, real.clone());
                Ok(real)
            }
            Err(err) => {
                write_lock(&self.table).remove(&key);
                Err(err)
            }
        }
    }

    fn build(&self, shape_id: ShapeId, ctx: &Context) -> Result<Arc<dyn Converter>> {
        // Runtime registration wins, then the shape's own annotation, then
        // the per-kind builders.
        if let Some(reg) = read_lock(&self.overrides).get(&shape_id) {
            return Ok(reg.clone());
        }
        let shape = self.graph.get(shape_id);
        if let Some(custom) = &shape.custom {
            return Ok(custom.clone());
        }
        match &shape.kind {
            ShapeKind::Pending => Err(Error::Config(format!(
                "shape \"{}\" was declared but never defined",
                shape.name
            ))),
            ShapeKind::Scalar(scalar) => Ok(scalar::build(*scalar, ctx)),
            ShapeKind::Object(object) => {
                let inner = object::build(self, ctx, shape_id, &shape.name, object)?;
                Ok(Arc::new(RefGuard::new(shape_id, inner)))
            }
            ShapeKind::Enum(e) => enums::build(&shape.name, e, ctx),
            ShapeKind::Dictionary(d) => collections::build_dict(self, ctx, d),
            ShapeKind::Sequence(s) => collections::build_seq(self, ctx, s),
            ShapeKind::Optional(o) => {
                let element = self.get(o.element, ctx)?;
                Ok(Arc::new(OptionalConverter { element }))
            }
            ShapeKind::Union(u) => union::build_shape(self, ctx, u),
            ShapeKind::Surrogate(s) => {
                let target = self.get(s.target, ctx)?;
                Ok(Arc::new(SurrogateConverter {
                    target,
                    forward: s.forward.clone(),
                    back: s.back.clone(),
                }))
            }
        }
    }
}

/// The forwarder parked in the memo table while a converter is built. Its
/// pointer stays valid inside cyclic converter trees after the real
/// converter replaces it in the table.
#[derive(Default)]
struct Delayed {
    inner: OnceLock<Arc<dyn Converter>>,
}

impl Delayed {
    fn fill(&self, real: Arc<dyn Converter>) {
        // A second fill can only come from a racing build of the same key,
        // which produced an equivalent converter.
        let _ = self.inner.set(real);
    }

    fn resolved(&self) -> Result<&Arc<dyn Converter>> {
        self.inner.get().ok_or_else(|| {
            Error::Config("converter used before its construction finished".to_string())
        })
    }
}

impl Converter for Delayed {
    fn write(&self, wr: &mut Writer<'_>, value: &Value, ctx: &mut OpContext) -> Result<()> {
        self.resolved()?.write(wr, value, ctx)
    }

    fn read(&self, rd: &mut Reader<'_>, ctx: &mut OpContext) -> Result<Value> {
        self.resolved()?.read(rd, ctx)
    }
}

/// Optional shapes: wire nil is the none case.
struct OptionalConverter {
    element: Arc<dyn Converter>,
}

impl Converter for OptionalConverter {
    fn write(&self, wr: &mut Writer<'_>, value: &Value, ctx: &mut OpContext) -> Result<()> {
        match value {
            Value::Null => wr.write_nil(),
            some => self.element.write(wr, some, ctx),
        }
    }

    fn read(&self, rd: &mut Reader<'_>, ctx: &mut OpContext) -> Result<Value> {
        if rd.try_read_nil()? {
            Ok(Value::Null)
        } else {
            self.element.read(rd, ctx)
        }
    }
}

/// Surrogate shapes: re-route through the proxy representation.
struct SurrogateConverter {
    target: Arc<dyn Converter>,
    forward: crate::shape::SurrogateFn,
    back: crate::shape::SurrogateFn,
}

impl Converter for SurrogateConverter {
    fn write(&self, wr: &mut Writer<'_>, value: &Value, ctx: &mut OpContext) -> Result<()> {
        let proxied = (self.forward)(value)?;
        self.target.write(wr, &proxied, ctx)
    }

    fn read(&self, rd: &mut Reader<'_>, ctx: &mut OpContext) -> Result<Value> {
        let proxied = self.target.read(rd, ctx)?;
        (self.back)(&proxied)
    }
}
