//! The union (polymorphic) converter.
//!
//! Registration maps each case shape to a wire alias, either its integer
//! tag or an explicit UTF-8 string. The envelope is a two-element array:
//! the alias, then the value through the case's own converter. The declared
//! base shape itself travels with a nil alias. Write-side dispatch walks
//! the cases most-derived-first so a value of a subtype registered beneath
//! another subtype picks the deeper one.

use std::collections::HashMap;
use std::sync::Arc;

use crate::context::{Context, OpContext};
use crate::convert::{Converter, Registry};
use crate::error::{Error, Result};
use crate::read::Reader;
use crate::shape::{ShapeGraph, ShapeId, ShapeKind, UnionCase, UnionShape};
use crate::value::Value;
use crate::write::Writer;

/// A wire identifier for a union case: a 32-bit integer or a UTF-8 string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Alias {
    Int(i32),
    Str(String),
}

impl std::fmt::Display for Alias {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Alias::Int(v) => write!(f, "{}", v),
            Alias::Str(v) => write!(f, "\"{}\"", v),
        }
    }
}

pub(super) fn build_shape(
    registry: &Registry,
    ctx: &Context,
    shape: &UnionShape,
) -> Result<Arc<dyn Converter>> {
    build(registry, ctx, shape.base, &shape.cases)
}

pub(super) fn build_mapping(
    registry: &Registry,
    ctx: &Context,
    base: ShapeId,
    cases: Vec<UnionCase>,
) -> Result<Arc<dyn Converter>> {
    let graph = registry.graph();
    crate::shape::validate_union(graph.name(base), &UnionShape {
        base,
        cases: cases.clone(),
    })?;
    build(registry, ctx, base, &cases)
}

fn build(
    registry: &Registry,
    ctx: &Context,
    base: ShapeId,
    cases: &[UnionCase],
) -> Result<Arc<dyn Converter>> {
    let graph = registry.graph();
    for case in cases {
        if !matches!(graph.get(case.shape).kind, ShapeKind::Object(_)) {
            return Err(Error::Config(format!(
                "union case \"{}\" is not an object shape",
                graph.name(case.shape)
            )));
        }
    }

    let mut by_int = HashMap::new();
    let mut by_utf8 = HashMap::new();
    let mut write_order = Vec::with_capacity(cases.len());
    for case in cases {
        let converter = registry.get(case.shape, ctx)?;
        let alias = match &case.alias {
            Some(name) => {
                by_utf8.insert(name.as_bytes().to_vec(), converter.clone());
                Alias::Str(name.clone())
            }
            None => {
                by_int.insert(case.tag, converter.clone());
                Alias::Int(case.tag)
            }
        };
        write_order.push(WriteCase {
            shape: case.shape,
            alias,
            converter,
        });
    }
    // Most-derived-first: deeper parent chains dispatch before their
    // ancestors.
    write_order.sort_by_key(|case| std::cmp::Reverse(graph.derived_depth(case.shape)));

    Ok(Arc::new(UnionConverter {
        type_name: graph.name(base).to_string(),
        graph: graph.clone(),
        base_shape: base,
        base: registry.get(base, ctx)?,
        by_int,
        by_utf8,
        write_order,
    }))
}

struct WriteCase {
    shape: ShapeId,
    alias: Alias,
    converter: Arc<dyn Converter>,
}

struct UnionConverter {
    type_name: String,
    graph: Arc<ShapeGraph>,
    base_shape: ShapeId,
    base: Arc<dyn Converter>,
    by_int: HashMap<i32, Arc<dyn Converter>>,
    by_utf8: HashMap<Vec<u8>, Arc<dyn Converter>>,
    write_order: Vec<WriteCase>,
}

impl Converter for UnionConverter {
    fn write(&self, wr: &mut Writer<'_>, value: &Value, ctx: &mut OpContext) -> Result<()> {
        let rec = value.as_record().ok_or_else(|| {
            Error::BadData(format!(
                "union \"{}\" expects a record, got {}",
                self.type_name,
                value.kind()
            ))
        })?;
        let runtime = rec.shape();
        ctx.enter()?;
        wr.write_array_header(2)?;
        if runtime == self.base_shape {
            // The declared base type needs no alias.
            wr.write_nil()?;
            self.base.write(wr, value, ctx)?;
        } else {
            let case = self
                .write_order
                .iter()
                .find(|case| self.graph.is_ancestor(case.shape, runtime))
                .ok_or_else(|| {
                    Error::UnknownUnionAlias(format!(
                        "{} (runtime type {})",
                        self.type_name,
                        self.graph.name(runtime)
                    ))
                })?;
            match &case.alias {
                Alias::Int(tag) => wr.write_int((*tag).into())?,
                Alias::Str(name) => wr.write_str(name)?,
            }
            case.converter.write(wr, value, ctx)?;
        }
        ctx.exit();
        Ok(())
    }

    fn read(&self, rd: &mut Reader<'_>, ctx: &mut OpContext) -> Result<Value> {
        ctx.enter()?;
        let len = rd.read_array_header()?;
        if len != 2 {
            return Err(Error::BadData(format!(
                "union envelope must be a 2-element array, found {}",
                len
            )));
        }
        let converter = match rd.peek_marker()?.family() {
            "nil" => {
                rd.read_nil()?;
                &self.base
            }
            "integer" => {
                let tag = rd.read_fit::<i32>()?;
                self.by_int
                    .get(&tag)
                    .ok_or_else(|| Error::UnknownUnionAlias(tag.to_string()))?
            }
            "string" => {
                let name = rd.read_str_bytes()?;
                self.by_utf8.get(name).ok_or_else(|| {
                    Error::UnknownUnionAlias(String::from_utf8_lossy(name).into_owned())
                })?
            }
            family => {
                return Err(Error::TokenMismatch {
                    expected: "union alias (integer or string)",
                    found: family,
                })
            }
        };
        let value = converter.read(rd, ctx)?;
        ctx.exit();
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::{ObjectShape, Property, Scalar};
    use crate::value::Record;

    /// Base <- Mid <- Leaf, each with one extra property, plus a union over
    /// all three.
    fn hierarchy() -> (Arc<ShapeGraph>, ShapeId, [ShapeId; 3]) {
        let mut graph = ShapeGraph::new();
        let u32_shape = graph.scalar(Scalar::U32);
        let base = graph
            .object(
                "Base",
                ObjectShape {
                    parent: None,
                    properties: vec![Property::new("id", u32_shape)],
                    ctor: None,
                    unused_data: false,
                    post_deserialize: None,
                },
            )
            .unwrap();
        let mid = graph
            .object(
                "Mid",
                ObjectShape {
                    parent: Some(base),
                    properties: vec![Property::new("id", u32_shape), Property::new("m", u32_shape)],
                    ctor: None,
                    unused_data: false,
                    post_deserialize: None,
                },
            )
            .unwrap();
        let leaf = graph
            .object(
                "Leaf",
                ObjectShape {
                    parent: Some(mid),
                    properties: vec![
                        Property::new("id", u32_shape),
                        Property::new("m", u32_shape),
                        Property::new("l", u32_shape),
                    ],
                    ctor: None,
                    unused_data: false,
                    post_deserialize: None,
                },
            )
            .unwrap();
        let union = graph
            .union(
                "Shape",
                base,
                vec![
                    UnionCase {
                        tag: 1,
                        alias: None,
                        shape: mid,
                    },
                    UnionCase {
                        tag: 2,
                        alias: Some("leaf".to_string()),
                        shape: leaf,
                    },
                ],
            )
            .unwrap();
        (Arc::new(graph), union, [base, mid, leaf])
    }

    fn run(registry: &Registry, union: ShapeId, value: &Value) -> (Vec<u8>, Value) {
        let ctx = Context::new();
        let conv = registry.get(union, &ctx).unwrap();
        let mut op = OpContext::new(ctx.clone());
        let mut wr = Writer::to_vec();
        conv.write(&mut wr, value, &mut op).unwrap();
        let bytes = wr.into_vec();
        let mut op = OpContext::new(ctx);
        let mut rd = Reader::new(&bytes);
        let back = conv.read(&mut rd, &mut op).unwrap();
        assert!(rd.is_empty());
        (bytes, back)
    }

    #[test]
    fn integer_alias_roundtrip() {
        let (graph, union, [_, mid, _]) = hierarchy();
        let registry = Registry::new(graph, false);
        let rec = Record::with_fields(mid, vec![Value::from(1u8), Value::from(2u8)]);
        let (bytes, back) = run(&registry, union, &Value::Record(rec.clone()));
        assert_eq!(bytes[0], 0x92, "union envelope is a 2-array");
        assert_eq!(bytes[1], 0x01, "the integer tag rides first");
        assert_eq!(back, Value::Record(rec));
    }

    #[test]
    fn string_alias_roundtrip() {
        let (graph, union, [_, _, leaf]) = hierarchy();
        let registry = Registry::new(graph, false);
        let rec = Record::with_fields(
            leaf,
            vec![Value::from(1u8), Value::from(2u8), Value::from(3u8)],
        );
        let (bytes, back) = run(&registry, union, &Value::Record(rec.clone()));
        assert_eq!(&bytes[1..6], [0xa4, 0x6c, 0x65, 0x61, 0x66]);
        assert_eq!(back, Value::Record(rec));
    }

    #[test]
    fn base_type_travels_with_nil_alias() {
        let (graph, union, [base, _, _]) = hierarchy();
        let registry = Registry::new(graph, false);
        let rec = Record::with_fields(base, vec![Value::from(9u8)]);
        let (bytes, back) = run(&registry, union, &Value::Record(rec.clone()));
        assert_eq!(bytes[1], 0xc0, "base case has a nil alias");
        assert_eq!(back, Value::Record(rec));
    }

    #[test]
    fn most_derived_wins() {
        // Leaf derives from Mid; a Leaf value must select the leaf alias
        // even though Mid's case would also accept it by ancestry.
        let (graph, union, [_, _, leaf]) = hierarchy();
        let registry = Registry::new(graph, false);
        let rec = Record::with_fields(
            leaf,
            vec![Value::from(1u8), Value::from(2u8), Value::from(3u8)],
        );
        let (bytes, _) = run(&registry, union, &Value::Record(rec));
        assert_eq!(bytes[1], 0xa4, "leaf's string alias, not mid's tag");
    }

    #[test]
    fn unknown_alias_fails() {
        let (graph, union, _) = hierarchy();
        let registry = Registry::new(graph, false);
        let ctx = Context::new();
        let conv = registry.get(union, &ctx).unwrap();
        let mut op = OpContext::new(ctx);
        let payload = [0x92, 0x63, 0xc0]; // tag 99
        match conv.read(&mut Reader::new(&payload), &mut op) {
            Err(Error::UnknownUnionAlias(alias)) => assert_eq!(alias, "99"),
            other => panic!("expected unknown alias, got {:?}", other),
        }
    }

    #[test]
    fn unregistered_runtime_type_fails() {
        let (graph, union, _) = hierarchy();
        let mut other_graph = ShapeGraph::new();
        let stray_shape = other_graph
            .object("Stray", ObjectShape::default())
            .unwrap();
        let registry = Registry::new(graph, false);
        let ctx = Context::new();
        let conv = registry.get(union, &ctx).unwrap();
        let mut op = OpContext::new(ctx);
        let stray = Record::with_fields(stray_shape, vec![]);
        let mut wr = Writer::to_vec();
        match conv.write(&mut wr, &Value::Record(stray), &mut op) {
            Err(Error::UnknownUnionAlias(_)) => (),
            other => panic!("expected unknown alias, got {:?}", other),
        }
    }
}
