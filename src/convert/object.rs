//! Converters for object shapes.
//!
//! Two layouts: map-keyed (property names on the wire, forward-compatible)
//! and array-indexed (positions on the wire, compact). Map mode skips
//! properties per the emit policies; array mode always writes every
//! declared position. Both capture members the shape doesn't recognize
//! into the instance's unused-data packet and replay them on the next
//! serialization.

use std::collections::HashMap;
use std::sync::Arc;

use crate::context::{Context, DecodeDefaults, EmitDefaults, OpContext};
use crate::convert::{Converter, Registry};
use crate::error::{Error, Result};
use crate::read::Reader;
use crate::shape::{EmitPolicy, ObjectShape, RecordHook, Scalar, ShapeId, ShapeKind};
use crate::value::{Literal, Record, UnusedData, UnusedKey, Value};
use crate::write::Writer;

pub(super) fn build(
    registry: &Registry,
    ctx: &Context,
    shape_id: ShapeId,
    type_name: &str,
    object: &ObjectShape,
) -> Result<Arc<dyn Converter>> {
    let graph = registry.graph();
    let explicit_indices = object.properties.iter().any(|p| p.index.is_some());
    let array_mode = explicit_indices || registry.array_by_default();

    let ctor_params: Vec<&str> = object
        .ctor
        .as_ref()
        .map(|c| c.params.iter().map(String::as_str).collect())
        .unwrap_or_default();

    let mut props = Vec::with_capacity(object.properties.len());
    for (decl_order, prop) in object.properties.iter().enumerate() {
        let name = match ctx.property_naming_policy() {
            Some(policy) => policy.apply(&prop.name),
            None => prop.name.clone(),
        };
        let position = match (array_mode, prop.index) {
            (true, Some(index)) => Some(index),
            (true, None) => Some(decl_order as u32),
            (false, _) => None,
        };
        let value_type = is_value_type(graph, prop.shape);
        let fallback = prop
            .default
            .clone()
            .unwrap_or_else(|| natural_of(graph, prop.shape));
        props.push(PropPlan {
            name_bytes: name.as_bytes().to_vec(),
            name,
            converter: registry.get(prop.shape, ctx)?,
            position,
            required: prop.required,
            nullable: prop.nullable,
            is_ctor_param: ctor_params.contains(&prop.name.as_str()),
            default: prop.default.clone(),
            fallback,
            emit: prop.emit,
            value_type,
        });
    }

    let mut name_table = HashMap::new();
    for (i, prop) in props.iter().enumerate() {
        if name_table.insert(prop.name_bytes.clone(), i).is_some() {
            // Policies can collapse distinct source names into one key.
            return Err(Error::Config(format!(
                "object \"{}\": naming policy maps two properties to \"{}\"",
                type_name, prop.name
            )));
        }
    }

    let width = props
        .iter()
        .filter_map(|p| p.position)
        .max()
        .map(|max| max as usize + 1)
        .unwrap_or(0);
    let mut slots = vec![None; width];
    for (i, prop) in props.iter().enumerate() {
        if let Some(pos) = prop.position {
            slots[pos as usize] = Some(i);
        }
    }

    Ok(Arc::new(ObjectConverter {
        type_name: type_name.to_string(),
        shape: shape_id,
        array_mode,
        props,
        name_table,
        slots,
        has_ctor: object.ctor.is_some(),
        unused_data: object.unused_data,
        post_deserialize: object.post_deserialize.clone(),
    }))
}

fn is_value_type(graph: &crate::shape::ShapeGraph, shape: ShapeId) -> bool {
    match &graph.get(shape).kind {
        ShapeKind::Scalar(s) => !matches!(s, Scalar::Str | Scalar::Bin | Scalar::Any),
        ShapeKind::Enum(_) => true,
        ShapeKind::Optional(o) => is_value_type(graph, o.element),
        _ => false,
    }
}

// The value an absent property decodes to: its declared default, or the
// natural default of its shape. Shape-based so a skipped zero comes back as
// a zero, not as nil.
fn natural_of(graph: &crate::shape::ShapeGraph, shape: ShapeId) -> Literal {
    match &graph.get(shape).kind {
        ShapeKind::Scalar(s) => match s {
            Scalar::Bool => Literal::Bool(false),
            Scalar::U8
            | Scalar::U16
            | Scalar::U32
            | Scalar::U64
            | Scalar::I8
            | Scalar::I16
            | Scalar::I32
            | Scalar::I64 => Literal::from(0u8),
            Scalar::F32 => Literal::F32(0.0),
            Scalar::F64 => Literal::F64(0.0),
            Scalar::Str => Literal::Str(String::new()),
            Scalar::Bin => Literal::Bin(Vec::new()),
            Scalar::Timestamp => {
                Literal::Timestamp(crate::timestamp::Timestamp::from_secs(0))
            }
            Scalar::Any => Literal::Null,
        },
        ShapeKind::Enum(_) => Literal::from(0u8),
        ShapeKind::Sequence(_) => Literal::Array(Vec::new()),
        ShapeKind::Dictionary(_) => Literal::Map(Vec::new()),
        _ => Literal::Null,
    }
}

fn is_natural_default(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(v) => !v,
        Value::Int(v) => v.as_u64() == Some(0),
        Value::F32(v) => v.to_bits() == 0,
        Value::F64(v) => v.to_bits() == 0,
        Value::Str(v) => v.is_empty(),
        Value::Bin(v) => v.is_empty(),
        Value::Array(v) => v.is_empty(),
        Value::Map(v) => v.is_empty(),
        Value::Timestamp(v) => v.secs() == 0 && v.nanos() == 0,
        Value::Ext(..) | Value::Record(_) => false,
    }
}

struct PropPlan {
    name: String,
    /// The post-policy UTF-8 name, written without re-encoding.
    name_bytes: Vec<u8>,
    converter: Arc<dyn Converter>,
    position: Option<u32>,
    required: bool,
    nullable: bool,
    is_ctor_param: bool,
    default: Option<Literal>,
    /// What an absent member decodes to.
    fallback: Literal,
    emit: EmitPolicy,
    value_type: bool,
}

impl PropPlan {
    fn should_serialize(&self, value: &Value, ctx: &OpContext) -> bool {
        if self.required {
            return true;
        }
        let category = if self.value_type {
            EmitDefaults::VALUE_TYPES
        } else {
            EmitDefaults::REFERENCE_TYPES
        };
        let skip_wanted = self.emit != EmitPolicy::Always
            || !ctx
                .config()
                .serialize_default_values()
                .contains(category);
        if !skip_wanted {
            return true;
        }
        let is_default = match &self.default {
            Some(declared) => declared.matches(value),
            None => is_natural_default(value),
        };
        !is_default
    }

    fn check_null(&self, value: &Value, ctx: &OpContext) -> Result<()> {
        if value.is_null()
            && !self.nullable
            && !ctx
                .config()
                .deserialize_default_values()
                .contains(DecodeDefaults::ALLOW_NULL_FOR_NON_NULLABLE)
        {
            return Err(Error::DisallowedNull {
                property: self.name.clone(),
            });
        }
        Ok(())
    }
}

pub(super) struct ObjectConverter {
    type_name: String,
    shape: ShapeId,
    array_mode: bool,
    props: Vec<PropPlan>,
    /// Map-mode lookup by the exact UTF-8 bytes of the property name.
    name_table: HashMap<Vec<u8>, usize>,
    /// Array-mode position → property.
    slots: Vec<Option<usize>>,
    has_ctor: bool,
    unused_data: bool,
    post_deserialize: Option<RecordHook>,
}

impl ObjectConverter {
    fn expect_record<'v>(&self, value: &'v Value) -> Result<&'v Record> {
        let rec = value.as_record().ok_or_else(|| {
            Error::BadData(format!(
                "object shape \"{}\" expects a record, got {}",
                self.type_name,
                value.kind()
            ))
        })?;
        if rec.shape() != self.shape {
            return Err(Error::BadData(format!(
                "record was built for another shape; register a union on \"{}\" for \
                 polymorphic serialization",
                self.type_name
            )));
        }
        if rec.len() != self.props.len() {
            return Err(Error::BadData(format!(
                "record for \"{}\" has {} fields, shape declares {}",
                self.type_name,
                rec.len(),
                self.props.len()
            )));
        }
        Ok(rec)
    }

    fn write_map(&self, wr: &mut Writer<'_>, rec: &Record, ctx: &mut OpContext) -> Result<()> {
        rec.visit_fields(|fields| {
            let serialize: Vec<bool> = self
                .props
                .iter()
                .zip(fields)
                .map(|(prop, value)| prop.should_serialize(value, ctx))
                .collect();
            let unused = rec.unused();
            let unused_count = unused
                .as_deref()
                .map(|u| {
                    u.iter()
                        .filter(|(key, _)| matches!(key, UnusedKey::Name(_)))
                        .count()
                })
                .unwrap_or(0);
            let count = serialize.iter().filter(|s| **s).count() + unused_count;

            wr.write_map_header(count)?;
            for ((prop, value), serialize) in self.props.iter().zip(fields).zip(&serialize) {
                if !serialize {
                    continue;
                }
                wr.write_str_bytes(&prop.name_bytes)?;
                prop.converter
                    .write(wr, value, ctx)
                    .map_err(|e| e.in_property(&self.type_name, &prop.name))?;
            }
            if let Some(unused) = unused.as_deref() {
                for (key, raw) in unused.iter() {
                    if let UnusedKey::Name(name) = key {
                        wr.write_str_bytes(name)?;
                        wr.write_raw(raw)?;
                    }
                }
            }
            Ok(())
        })
    }

    fn write_array(&self, wr: &mut Writer<'_>, rec: &Record, ctx: &mut OpContext) -> Result<()> {
        rec.visit_fields(|fields| {
            let unused = rec.unused();
            let width = self.slots.len().max(
                unused
                    .as_deref()
                    .and_then(UnusedData::max_index)
                    .map(|i| i as usize + 1)
                    .unwrap_or(0),
            );
            wr.write_array_header(width)?;
            for pos in 0..width {
                if let Some(prop_idx) = self.slots.get(pos).copied().flatten() {
                    let prop = &self.props[prop_idx];
                    prop.converter
                        .write(wr, &fields[prop_idx], ctx)
                        .map_err(|e| e.in_property(&self.type_name, &prop.name))?;
                } else if let Some(raw) = unused.as_deref().and_then(|u| u.get_index(pos as u32)) {
                    wr.write_raw(raw)?;
                } else {
                    wr.write_nil()?;
                }
            }
            Ok(())
        })
    }

    fn assign(
        &self,
        sink: &mut Sink,
        prop_idx: usize,
        value: Value,
        ctx: &OpContext,
    ) -> Result<()> {
        let prop = &self.props[prop_idx];
        prop.check_null(&value, ctx)?;
        match sink {
            Sink::Args { slots } => {
                if slots[prop_idx].is_some() && prop.is_ctor_param {
                    return Err(Error::DoubleAssignment {
                        property: prop.name.clone(),
                    });
                }
                slots[prop_idx] = Some(value);
            }
            Sink::Instance { rec, assigned } => {
                rec.set(prop_idx, value);
                assigned[prop_idx] = true;
            }
        }
        Ok(())
    }

    fn finish_read(
        &self,
        sink: Sink,
        unused: Option<UnusedData>,
        ctx: &mut OpContext,
    ) -> Result<Value> {
        let allow_missing = ctx
            .config()
            .deserialize_default_values()
            .contains(DecodeDefaults::ALLOW_MISSING_REQUIRED);
        let rec = match sink {
            Sink::Args { slots } => {
                let mut fields = Vec::with_capacity(self.props.len());
                for (prop, slot) in self.props.iter().zip(slots) {
                    match slot {
                        Some(value) => fields.push(value),
                        None => {
                            if prop.required && !allow_missing {
                                return Err(Error::MissingRequired {
                                    property: prop.name.clone(),
                                });
                            }
                            fields.push(prop.fallback.to_value());
                        }
                    }
                }
                let rec = Record::with_fields(self.shape, fields);
                // Constructor-bound instances exist only now; a cycle back
                // into one can't resolve earlier.
                ctx.report_constructed(&rec);
                rec
            }
            Sink::Instance { rec, assigned } => {
                for (prop, assigned) in self.props.iter().zip(assigned) {
                    if prop.required && !assigned && !allow_missing {
                        return Err(Error::MissingRequired {
                            property: prop.name.clone(),
                        });
                    }
                }
                rec
            }
        };
        if let Some(unused) = unused {
            if !unused.is_empty() {
                rec.set_unused(unused);
            }
        }
        if let Some(hook) = &self.post_deserialize {
            hook(&rec);
        }
        Ok(Value::Record(rec))
    }

    fn read_map(
        &self,
        rd: &mut Reader<'_>,
        sink: &mut Sink,
        ctx: &mut OpContext,
    ) -> Result<Option<UnusedData>> {
        let count = rd.read_map_header()?;
        let mut unused = self.unused_data.then(UnusedData::new);
        for _ in 0..count {
            ctx.check_cancel()?;
            let name = rd.read_str_bytes()?;
            match self.name_table.get(name).copied() {
                Some(prop_idx) => {
                    let prop = &self.props[prop_idx];
                    let value = prop
                        .converter
                        .read(rd, ctx)
                        .map_err(|e| e.in_property(&self.type_name, &prop.name))?;
                    self.assign(sink, prop_idx, value, ctx)?;
                }
                None => {
                    let name = name.to_vec();
                    let raw = rd.read_raw_structure()?;
                    if let Some(unused) = unused.as_mut() {
                        unused.push_named(&name, raw.to_vec());
                    }
                }
            }
        }
        Ok(unused)
    }

    fn read_array(
        &self,
        rd: &mut Reader<'_>,
        sink: &mut Sink,
        ctx: &mut OpContext,
    ) -> Result<Option<UnusedData>> {
        let count = rd.read_array_header()?;
        let mut unused = self.unused_data.then(UnusedData::new);
        for pos in 0..count {
            ctx.check_cancel()?;
            match self.slots.get(pos).copied().flatten() {
                Some(prop_idx) => {
                    let prop = &self.props[prop_idx];
                    let value = prop
                        .converter
                        .read(rd, ctx)
                        .map_err(|e| e.in_property(&self.type_name, &prop.name))?;
                    self.assign(sink, prop_idx, value, ctx)?;
                }
                None => {
                    let raw = rd.read_raw_structure()?;
                    if let Some(unused) = unused.as_mut() {
                        // Positions past the shape fill with their original
                        // bytes on the next write; plain nils aren't worth
                        // carrying.
                        if raw != [0xc0] {
                            unused.push_indexed(pos as u32, raw.to_vec());
                        }
                    }
                }
            }
        }
        Ok(unused)
    }
}

/// Where decoded property values land: an argument state for constructor
/// binding, or a live instance assigned through setters as members arrive.
enum Sink {
    Args {
        slots: Vec<Option<Value>>,
    },
    Instance {
        rec: Record,
        assigned: Vec<bool>,
    },
}

impl Converter for ObjectConverter {
    fn write(&self, wr: &mut Writer<'_>, value: &Value, ctx: &mut OpContext) -> Result<()> {
        let rec = self.expect_record(value)?;
        ctx.enter()?;
        if self.array_mode {
            self.write_array(wr, rec, ctx)?;
        } else {
            self.write_map(wr, rec, ctx)?;
        }
        ctx.exit();
        Ok(())
    }

    fn read(&self, rd: &mut Reader<'_>, ctx: &mut OpContext) -> Result<Value> {
        ctx.enter()?;
        let mut sink = if self.has_ctor {
            Sink::Args {
                slots: vec![None; self.props.len()],
            }
        } else {
            // Setter-style objects exist before their members decode, so a
            // backreference into a cycle can resolve mid-read.
            let rec = Record::new(self.shape, self.props.len());
            for (i, prop) in self.props.iter().enumerate() {
                rec.set(i, prop.fallback.to_value());
            }
            ctx.report_constructed(&rec);
            Sink::Instance {
                assigned: vec![false; self.props.len()],
                rec,
            }
        };
        let unused = if self.array_mode {
            self.read_array(rd, &mut sink, ctx)?
        } else {
            self.read_map(rd, &mut sink, ctx)?
        };
        let value = self.finish_read(sink, unused, ctx)?;
        ctx.exit();
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::shape::{Ctor, Property, ShapeGraph};

    fn point_graph(unused_data: bool, ctor: bool) -> (Arc<ShapeGraph>, ShapeId) {
        let mut graph = ShapeGraph::new();
        let u32_shape = graph.scalar(Scalar::U32);
        let str_shape = graph.scalar(Scalar::Str);
        let point = graph
            .object(
                "Point",
                ObjectShape {
                    parent: None,
                    properties: vec![
                        Property::new("x", u32_shape).required(),
                        Property::new("y", u32_shape),
                        Property::new("label", str_shape),
                    ],
                    ctor: ctor.then(|| Ctor {
                        params: vec!["x".to_string(), "y".to_string()],
                    }),
                    unused_data,
                    post_deserialize: None,
                },
            )
            .unwrap();
        (Arc::new(graph), point)
    }

    fn run(
        registry: &Registry,
        shape: ShapeId,
        ctx: &Context,
        value: &Value,
    ) -> (Vec<u8>, Value) {
        let conv = registry.get(shape, ctx).unwrap();
        let mut op = OpContext::new(ctx.clone());
        let mut wr = Writer::to_vec();
        conv.write(&mut wr, value, &mut op).unwrap();
        let bytes = wr.into_vec();
        let mut op = OpContext::new(ctx.clone());
        let mut rd = Reader::new(&bytes);
        let back = conv.read(&mut rd, &mut op).unwrap();
        assert!(rd.is_empty(), "converter must consume the whole structure");
        (bytes, back)
    }

    #[test]
    fn map_mode_roundtrip() {
        let (graph, point) = point_graph(false, false);
        let registry = Registry::new(graph, false);
        let ctx = Context::new();
        let rec = Record::with_fields(
            point,
            vec![Value::from(3u8), Value::from(4u8), Value::from("origin")],
        );
        let (bytes, back) = run(&registry, point, &ctx, &Value::Record(rec.clone()));
        assert_eq!(bytes[0], 0x83, "three properties in map mode");
        assert_eq!(back, Value::Record(rec));
    }

    #[test]
    fn array_mode_layout() {
        let mut graph = ShapeGraph::new();
        let u32_shape = graph.scalar(Scalar::U32);
        let pair = graph
            .object(
                "Pair",
                ObjectShape {
                    parent: None,
                    properties: vec![
                        Property::new("a", u32_shape).indexed(0),
                        Property::new("b", u32_shape).indexed(3),
                    ],
                    ctor: None,
                    unused_data: false,
                    post_deserialize: None,
                },
            )
            .unwrap();
        let registry = Registry::new(Arc::new(graph), false);
        let ctx = Context::new();
        let rec = Record::with_fields(pair, vec![Value::from(7u8), Value::from(9u8)]);
        let (bytes, back) = run(&registry, pair, &ctx, &Value::Record(rec.clone()));
        // [7, nil, nil, 9] — uncovered positions hold nil.
        assert_eq!(bytes, [0x94, 0x07, 0xc0, 0xc0, 0x09]);
        assert_eq!(back, Value::Record(rec));
    }

    #[test]
    fn registry_wide_array_layout() {
        let (graph, point) = point_graph(false, false);
        let registry = Registry::new(graph, true);
        let ctx = Context::new();
        let rec = Record::with_fields(
            point,
            vec![Value::from(1u8), Value::from(2u8), Value::from("z")],
        );
        let (bytes, back) = run(&registry, point, &ctx, &Value::Record(rec.clone()));
        assert_eq!(bytes[0], 0x93, "declaration order becomes positions");
        assert_eq!(back, Value::Record(rec));
    }

    #[test]
    fn forward_compatibility_in_map_mode() {
        // A wider writer: {x, y, label, c, d} — then the narrow Point shape
        // with an unused-data packet reads it and writes it back intact.
        let mut payload = Vec::new();
        crate::encode::put_map_header(&mut payload, 5);
        crate::encode::put_str(&mut payload, "x");
        crate::encode::put_int(&mut payload, 1u8.into());
        crate::encode::put_str(&mut payload, "c");
        crate::encode::put_str(&mut payload, "kept");
        crate::encode::put_str(&mut payload, "y");
        crate::encode::put_int(&mut payload, 2u8.into());
        crate::encode::put_str(&mut payload, "d");
        crate::encode::put_array_header(&mut payload, 2);
        crate::encode::put_bool(&mut payload, true);
        crate::encode::put_nil(&mut payload);
        crate::encode::put_str(&mut payload, "label");
        crate::encode::put_str(&mut payload, "p");

        let (graph, point) = point_graph(true, false);
        let registry = Registry::new(graph, false);
        let ctx = Context::new();
        let conv = registry.get(point, &ctx).unwrap();

        let mut op = OpContext::new(ctx.clone());
        let mut rd = Reader::new(&payload);
        let value = conv.read(&mut rd, &mut op).unwrap();
        let rec = value.as_record().unwrap();
        assert_eq!(rec.get(0).unwrap(), Value::from(1u8));
        assert_eq!(rec.unused().unwrap().len(), 2, "c and d were captured");

        let mut wr = Writer::to_vec();
        conv.write(&mut wr, &value, &mut op).unwrap();
        let rewritten = wr.into_vec();
        // Recognized properties lead in declaration order, then the
        // captured members replay byte-for-byte.
        let mut expected = Vec::new();
        crate::encode::put_map_header(&mut expected, 5);
        crate::encode::put_str(&mut expected, "x");
        crate::encode::put_int(&mut expected, 1u8.into());
        crate::encode::put_str(&mut expected, "y");
        crate::encode::put_int(&mut expected, 2u8.into());
        crate::encode::put_str(&mut expected, "label");
        crate::encode::put_str(&mut expected, "p");
        crate::encode::put_str(&mut expected, "c");
        crate::encode::put_str(&mut expected, "kept");
        crate::encode::put_str(&mut expected, "d");
        crate::encode::put_array_header(&mut expected, 2);
        crate::encode::put_bool(&mut expected, true);
        crate::encode::put_nil(&mut expected);
        assert_eq!(rewritten, expected);
    }

    #[test]
    fn array_mode_unused_positions_replay() {
        let mut graph = ShapeGraph::new();
        let u32_shape = graph.scalar(Scalar::U32);
        let narrow = graph
            .object(
                "Narrow",
                ObjectShape {
                    parent: None,
                    properties: vec![
                        Property::new("a", u32_shape).indexed(0),
                        Property::new("b", u32_shape).indexed(1),
                    ],
                    ctor: None,
                    unused_data: true,
                    post_deserialize: None,
                },
            )
            .unwrap();
        let registry = Registry::new(Arc::new(graph), false);
        let ctx = Context::new();
        let conv = registry.get(narrow, &ctx).unwrap();

        // A wider writer produced four positions.
        let mut payload = Vec::new();
        crate::encode::put_array_header(&mut payload, 4);
        crate::encode::put_int(&mut payload, 1u8.into());
        crate::encode::put_int(&mut payload, 2u8.into());
        crate::encode::put_str(&mut payload, "extra");
        crate::encode::put_bool(&mut payload, true);

        let mut op = OpContext::new(ctx.clone());
        let mut rd = Reader::new(&payload);
        let value = conv.read(&mut rd, &mut op).unwrap();
        let rec = value.as_record().unwrap();
        assert_eq!(rec.unused().unwrap().max_index(), Some(3));

        let mut wr = Writer::to_vec();
        conv.write(&mut wr, &value, &mut op).unwrap();
        assert_eq!(
            wr.into_vec(),
            payload,
            "uncovered positions must replay their original bytes"
        );
    }

    #[test]
    fn unknown_members_skipped_without_packet() {
        let mut payload = Vec::new();
        crate::encode::put_map_header(&mut payload, 2);
        crate::encode::put_str(&mut payload, "x");
        crate::encode::put_int(&mut payload, 1u8.into());
        crate::encode::put_str(&mut payload, "ghost");
        crate::encode::put_array_header(&mut payload, 1);
        crate::encode::put_int(&mut payload, 9u8.into());

        let (graph, point) = point_graph(false, false);
        let registry = Registry::new(graph, false);
        let ctx = Context::new();
        let conv = registry.get(point, &ctx).unwrap();
        let mut op = OpContext::new(ctx);
        let mut rd = Reader::new(&payload);
        let value = conv.read(&mut rd, &mut op).unwrap();
        assert!(rd.is_empty(), "unknown member must be skipped past");
        assert!(value.as_record().unwrap().unused().is_none());
    }

    #[test]
    fn required_and_double_assignment() {
        let (graph, point) = point_graph(false, true);
        let registry = Registry::new(graph, false);
        let ctx = Context::new();
        let conv = registry.get(point, &ctx).unwrap();

        // Missing required x.
        let mut payload = Vec::new();
        crate::encode::put_map_header(&mut payload, 1);
        crate::encode::put_str(&mut payload, "y");
        crate::encode::put_int(&mut payload, 2u8.into());
        let mut op = OpContext::new(ctx.clone());
        match conv.read(&mut Reader::new(&payload), &mut op) {
            Err(Error::MissingRequired { property }) => assert_eq!(property, "x"),
            other => panic!("expected missing required, got {:?}", other),
        }

        // Allow-missing policy lets it through.
        let lenient = ctx
            .clone()
            .with_deserialize_default_values(DecodeDefaults::ALLOW_MISSING_REQUIRED);
        let mut op = OpContext::new(lenient);
        assert!(conv.read(&mut Reader::new(&payload), &mut op).is_ok());

        // The same constructor parameter twice.
        let mut payload = Vec::new();
        crate::encode::put_map_header(&mut payload, 2);
        crate::encode::put_str(&mut payload, "x");
        crate::encode::put_int(&mut payload, 1u8.into());
        crate::encode::put_str(&mut payload, "x");
        crate::encode::put_int(&mut payload, 2u8.into());
        let mut op = OpContext::new(ctx.clone());
        match conv.read(&mut Reader::new(&payload), &mut op) {
            Err(Error::DoubleAssignment { property }) => assert_eq!(property, "x"),
            other => panic!("expected double assignment, got {:?}", other),
        }
    }

    #[test]
    fn null_rejection() {
        let mut graph = ShapeGraph::new();
        let str_shape = graph.scalar(Scalar::Str);
        let holder = graph
            .object(
                "Holder",
                ObjectShape {
                    parent: None,
                    properties: vec![Property::new("name", str_shape).non_nullable()],
                    ctor: Some(Ctor {
                        params: vec!["name".to_string()],
                    }),
                    unused_data: false,
                    post_deserialize: None,
                },
            )
            .unwrap();
        let registry = Registry::new(Arc::new(graph), false);
        let ctx = Context::new();
        let conv = registry.get(holder, &ctx).unwrap();

        let mut payload = Vec::new();
        crate::encode::put_map_header(&mut payload, 1);
        crate::encode::put_str(&mut payload, "name");
        crate::encode::put_nil(&mut payload);

        let mut op = OpContext::new(ctx.clone());
        match conv.read(&mut Reader::new(&payload), &mut op) {
            Err(Error::DisallowedNull { property }) => assert_eq!(property, "name"),
            other => panic!("expected disallowed null, got {:?}", other),
        }

        let lenient = ctx
            .with_deserialize_default_values(DecodeDefaults::ALLOW_NULL_FOR_NON_NULLABLE);
        let mut op = OpContext::new(lenient);
        assert!(conv.read(&mut Reader::new(&payload), &mut op).is_ok());
    }

    #[test]
    fn skip_default_emit_policy() {
        let mut graph = ShapeGraph::new();
        let u32_shape = graph.scalar(Scalar::U32);
        let counted = graph
            .object(
                "Counted",
                ObjectShape {
                    parent: None,
                    properties: vec![
                        Property::new("always", u32_shape),
                        Property::new("sparse", u32_shape).emit(EmitPolicy::SkipDefault),
                    ],
                    ctor: None,
                    unused_data: false,
                    post_deserialize: None,
                },
            )
            .unwrap();
        let registry = Registry::new(Arc::new(graph), false);
        let ctx = Context::new();
        let conv = registry.get(counted, &ctx).unwrap();
        let rec = Record::with_fields(counted, vec![Value::from(0u8), Value::from(0u8)]);
        let mut op = OpContext::new(ctx.clone());
        let mut wr = Writer::to_vec();
        conv.write(&mut wr, &Value::Record(rec), &mut op).unwrap();
        let bytes = wr.into_vec();
        assert_eq!(bytes[0], 0x81, "sparse zero must be skipped");

        // The context-wide policy can skip every default.
        let tight = ctx.with_serialize_default_values(crate::context::EmitDefaults::NEVER);
        let rec = Record::with_fields(counted, vec![Value::from(0u8), Value::from(5u8)]);
        let mut op = OpContext::new(tight);
        let mut wr = Writer::to_vec();
        conv.write(&mut wr, &Value::Record(rec), &mut op).unwrap();
        let bytes = wr.into_vec();
        assert_eq!(bytes[0], 0x81, "only the non-default survives");
    }

    #[test]
    fn declared_default_skip_and_restore() {
        let mut graph = ShapeGraph::new();
        let u32_shape = graph.scalar(Scalar::U32);
        let tuned = graph
            .object(
                "Tuned",
                ObjectShape {
                    parent: None,
                    properties: vec![Property::new("n", u32_shape)
                        .with_default(Literal::from(7u8))
                        .emit(EmitPolicy::SkipDeclaredDefault)],
                    ctor: None,
                    unused_data: false,
                    post_deserialize: None,
                },
            )
            .unwrap();
        let registry = Registry::new(Arc::new(graph), false);
        let ctx = Context::new();
        let conv = registry.get(tuned, &ctx).unwrap();

        let rec = Record::with_fields(tuned, vec![Value::from(7u8)]);
        let mut op = OpContext::new(ctx.clone());
        let mut wr = Writer::to_vec();
        conv.write(&mut wr, &Value::Record(rec.clone()), &mut op)
            .unwrap();
        let bytes = wr.into_vec();
        assert_eq!(bytes, [0x80], "the declared default writes nothing");

        let mut rd = Reader::new(&bytes);
        let back = conv.read(&mut rd, &mut op).unwrap();
        assert_eq!(
            back,
            Value::Record(rec),
            "the absent member restores its declared default"
        );

        // A non-default value still travels.
        let rec = Record::with_fields(tuned, vec![Value::from(9u8)]);
        let mut wr = Writer::to_vec();
        conv.write(&mut wr, &Value::Record(rec), &mut op).unwrap();
        assert_eq!(wr.into_vec()[0], 0x81);
    }

    #[test]
    fn post_deserialize_hook_runs() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut graph = ShapeGraph::new();
        let u32_shape = graph.scalar(Scalar::U32);
        let hooked = graph
            .object(
                "Hooked",
                ObjectShape {
                    parent: None,
                    properties: vec![Property::new("v", u32_shape)],
                    ctor: None,
                    unused_data: false,
                    post_deserialize: Some(Arc::new(move |_| {
                        seen.fetch_add(1, Ordering::Relaxed);
                    })),
                },
            )
            .unwrap();
        let registry = Registry::new(Arc::new(graph), false);
        let ctx = Context::new();
        let rec = Record::with_fields(hooked, vec![Value::from(1u8)]);
        let _ = run(&registry, hooked, &ctx, &Value::Record(rec));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn depth_guard_counts_objects() {
        let (graph, point) = point_graph(false, false);
        let registry = Registry::new(graph, false);
        let ctx = Context::new().with_max_depth(0);
        let conv = registry.get(point, &ctx).unwrap();
        let rec = Record::with_fields(
            point,
            vec![Value::from(1u8), Value::from(2u8), Value::from("a")],
        );
        let mut op = OpContext::new(ctx);
        let mut wr = Writer::to_vec();
        match conv.write(&mut wr, &Value::Record(rec), &mut op) {
            Err(Error::DepthExceeded) => (),
            other => panic!("expected depth exceeded, got {:?}", other),
        }
    }

}
