//! The reference-preservation layer.
//!
//! Wraps every object converter. With preservation on, the first write of
//! an instance serializes it normally and registers its identity; any
//! repeat becomes a backreference extension token carrying the reference
//! id. The read side mirrors this with a dense id → record table whose
//! slots are reserved before decoding starts, so a cycle can point at an
//! object that is still being read.
//!
//! Value-typed shapes never pass through here; identity only exists for
//! records.

use std::sync::Arc;

use crate::context::{OpContext, PreserveReferences};
use crate::convert::Converter;
use crate::decode;
use crate::error::{Error, Result};
use crate::marker::ExtType;
use crate::read::Reader;
use crate::shape::ShapeId;
use crate::value::Value;
use crate::write::Writer;

pub(crate) struct RefGuard {
    shape: ShapeId,
    inner: Arc<dyn Converter>,
}

impl RefGuard {
    pub fn new(shape: ShapeId, inner: Arc<dyn Converter>) -> Self {
        Self { shape, inner }
    }
}

impl Converter for RefGuard {
    fn write(&self, wr: &mut Writer<'_>, value: &Value, ctx: &mut OpContext) -> Result<()> {
        let mode = ctx.config().preserve_references();
        if mode == PreserveReferences::Off {
            return self.inner.write(wr, value, ctx);
        }
        let rec = match value.as_record() {
            Some(rec) => rec,
            // Not an identity-carrying value; the inner converter reports
            // the mismatch.
            None => return self.inner.write(wr, value, ctx),
        };
        let ptr = rec.ptr_id();
        if let Some(seen) = ctx.write_refs.seen(ptr) {
            if seen.complete || mode == PreserveReferences::AllowCycles {
                return wr.write_ext(
                    ExtType::Backref.into(),
                    &decode::backref_payload(seen.id),
                );
            }
            // Still on the write stack with cycles disallowed.
            return Err(Error::CycleDetected);
        }
        ctx.write_refs.begin(ptr);
        self.inner.write(wr, value, ctx)?;
        ctx.write_refs.finish(ptr);
        Ok(())
    }

    fn read(&self, rd: &mut Reader<'_>, ctx: &mut OpContext) -> Result<Value> {
        let mode = ctx.config().preserve_references();
        if mode == PreserveReferences::Off {
            return self.inner.read(rd, ctx);
        }
        if rd.peek_marker()?.family() == "extension" {
            let mut probe = rd.clone();
            let (code, len) = probe.read_ext_header()?;
            if code == ExtType::Backref.into_i8() {
                let payload = probe.read_payload(len)?;
                let id = decode::read_backref_payload(payload)?;
                let record = ctx
                    .read_refs
                    .get(id, mode == PreserveReferences::RejectCycles)?;
                if record.shape() != self.shape {
                    return Err(Error::BadData(format!(
                        "backreference {} resolves to an object of another shape",
                        id
                    )));
                }
                *rd = probe;
                return Ok(Value::Record(record));
            }
        }
        // A fresh object: reserve its id before decoding so references to
        // it from inside its own subtree can resolve.
        let id = ctx.read_refs.reserve();
        let previous = ctx.pending_slot.replace(id);
        let value = self.inner.read(rd, ctx)?;
        ctx.pending_slot = previous;
        if let Value::Record(rec) = &value {
            // Constructor-bound objects report only after construction;
            // make sure the slot is filled either way.
            ctx.read_refs.fill(id, rec.clone());
        }
        Ok(value)
    }
}
