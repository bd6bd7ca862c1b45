//! The runtime type model.
//!
//! A shape describes the structure of a type: its properties, constructor,
//! enum members, collection strategies, union cases. Shapes live in a
//! [`ShapeGraph`] arena and reference each other by [`ShapeId`], so a shape
//! that (directly or transitively) contains itself is just an id cycle, not
//! an ownership problem. Two-phase construction — declare, then define —
//! builds such cycles.
//!
//! Illegal combinations are rejected here or at converter build, never
//! during encode/decode.

use std::fmt;
use std::sync::Arc;

use educe::Educe;

use crate::convert::Converter;
use crate::error::{Error, Result};
use crate::integer::Integer;
use crate::value::{Literal, Value};

/// Handle to a shape in a [`ShapeGraph`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShapeId(u32);

impl ShapeId {
    pub fn from_raw(raw: u32) -> ShapeId {
        ShapeId(raw)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ShapeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ShapeId({})", self.0)
    }
}

/// Scalar kinds. The integer widths drive narrowing (and overflow) on
/// decode; `Any` is a self-describing value tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scalar {
    Bool,
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Str,
    Bin,
    Timestamp,
    Any,
}

impl Scalar {
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Scalar::U8
                | Scalar::U16
                | Scalar::U32
                | Scalar::U64
                | Scalar::I8
                | Scalar::I16
                | Scalar::I32
                | Scalar::I64
        )
    }
}

/// When a property is written versus skipped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EmitPolicy {
    /// Always serialize.
    #[default]
    Always,
    /// Skip when equal to the kind's natural default (nil, zero, empty).
    SkipDefault,
    /// Skip when equal to the property's declared default value.
    SkipDeclaredDefault,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Property {
    pub name: String,
    pub shape: ShapeId,
    /// Explicit array-mode position. All-or-none across an object.
    pub index: Option<u32>,
    pub required: bool,
    pub nullable: bool,
    pub default: Option<Literal>,
    pub emit: EmitPolicy,
}

impl Property {
    pub fn new(name: &str, shape: ShapeId) -> Property {
        Property {
            name: name.to_string(),
            shape,
            index: None,
            required: false,
            nullable: true,
            default: None,
            emit: EmitPolicy::Always,
        }
    }

    pub fn indexed(mut self, index: u32) -> Property {
        self.index = Some(index);
        self
    }

    pub fn required(mut self) -> Property {
        self.required = true;
        self
    }

    pub fn non_nullable(mut self) -> Property {
        self.nullable = false;
        self
    }

    pub fn with_default(mut self, default: Literal) -> Property {
        self.default = Some(default);
        self
    }

    pub fn emit(mut self, emit: EmitPolicy) -> Property {
        self.emit = emit;
        self
    }
}

/// A parameterized constructor: the named properties that are bound through
/// an argument state (with double-assignment and required tracking) instead
/// of being set directly.
#[derive(Clone, Debug, PartialEq)]
pub struct Ctor {
    pub params: Vec<String>,
}

/// Callback invoked after an instance finishes decoding.
pub type RecordHook = Arc<dyn Fn(&crate::value::Record) + Send + Sync>;

#[derive(Clone, Default, Educe)]
#[educe(PartialEq)]
pub struct ObjectShape {
    /// Base object shape, giving the subtype relation unions dispatch on.
    pub parent: Option<ShapeId>,
    pub properties: Vec<Property>,
    pub ctor: Option<Ctor>,
    /// Instances capture unrecognized members into an unused-data packet.
    pub unused_data: bool,
    /// Post-deserialization callback.
    #[educe(PartialEq(ignore))]
    pub post_deserialize: Option<RecordHook>,
}

impl fmt::Debug for ObjectShape {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ObjectShape")
            .field("parent", &self.parent)
            .field("properties", &self.properties)
            .field("ctor", &self.ctor)
            .field("unused_data", &self.unused_data)
            .field("post_deserialize", &self.post_deserialize.is_some())
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EnumShape {
    /// Underlying integer kind.
    pub repr: Scalar,
    /// Ordered name/value members.
    pub members: Vec<(String, Integer)>,
}

/// How a collection gets built on decode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Construction {
    /// The collection can't be constructed; decoding it is a configuration
    /// error.
    None,
    /// Build empty, insert one element at a time.
    Mutable,
    /// Collect into a pre-sized buffer, construct once.
    Sized,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DictShape {
    pub key: ShapeId,
    pub value: ShapeId,
    pub construction: Construction,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SeqShape {
    pub element: ShapeId,
    /// Dimensions; above one, the multi-dimensional format option applies.
    pub rank: u32,
    pub construction: Construction,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OptionalShape {
    pub element: ShapeId,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UnionCase {
    pub tag: i32,
    /// Explicit string alias; the integer tag is the wire identifier when
    /// absent.
    pub alias: Option<String>,
    pub shape: ShapeId,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UnionShape {
    pub base: ShapeId,
    pub cases: Vec<UnionCase>,
}

/// Conversion functions re-routing serialization through a proxy shape.
pub type SurrogateFn = Arc<dyn Fn(&Value) -> Result<Value> + Send + Sync>;

#[derive(Clone, Educe)]
#[educe(PartialEq)]
pub struct SurrogateShape {
    pub target: ShapeId,
    /// Value of this shape → value of the target shape.
    #[educe(PartialEq(ignore))]
    pub forward: SurrogateFn,
    /// Value of the target shape → value of this shape.
    #[educe(PartialEq(ignore))]
    pub back: SurrogateFn,
}

impl fmt::Debug for SurrogateShape {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SurrogateShape")
            .field("target", &self.target)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ShapeKind {
    /// Declared but not yet defined. Using one at converter build is a
    /// configuration error.
    Pending,
    Scalar(Scalar),
    Object(ObjectShape),
    Enum(EnumShape),
    Dictionary(DictShape),
    Sequence(SeqShape),
    Optional(OptionalShape),
    Union(UnionShape),
    Surrogate(SurrogateShape),
}

#[derive(Clone, Educe)]
#[educe(PartialEq)]
pub struct Shape {
    pub name: String,
    pub kind: ShapeKind,
    /// A converter annotation attached to the type itself. Consulted before
    /// the per-kind builders.
    #[educe(PartialEq(ignore))]
    pub custom: Option<Arc<dyn Converter>>,
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Shape")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("custom", &self.custom.is_some())
            .finish()
    }
}

/// The arena all shapes live in.
#[derive(Debug, Default)]
pub struct ShapeGraph {
    shapes: Vec<Shape>,
}

impl ShapeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    pub fn get(&self, id: ShapeId) -> &Shape {
        &self.shapes[id.index()]
    }

    pub fn name(&self, id: ShapeId) -> &str {
        &self.shapes[id.index()].name
    }

    fn push(&mut self, shape: Shape) -> ShapeId {
        let id = ShapeId(self.shapes.len() as u32);
        self.shapes.push(shape);
        id
    }

    /// Declare a shape so other shapes (including itself) can reference it
    /// before it is defined. Complete it with [`define`][Self::define].
    pub fn declare(&mut self, name: &str) -> ShapeId {
        self.push(Shape {
            name: name.to_string(),
            kind: ShapeKind::Pending,
            custom: None,
        })
    }

    /// Fill in a previously declared shape.
    pub fn define(&mut self, id: ShapeId, kind: ShapeKind) -> Result<()> {
        let name = self.shapes[id.index()].name.clone();
        if !matches!(self.shapes[id.index()].kind, ShapeKind::Pending) {
            return Err(Error::Config(format!(
                "shape \"{}\" is already defined",
                name
            )));
        }
        validate_kind(&name, &kind)?;
        self.shapes[id.index()].kind = kind;
        Ok(())
    }

    /// Attach a converter annotation to a shape.
    pub fn annotate(&mut self, id: ShapeId, converter: Arc<dyn Converter>) {
        self.shapes[id.index()].custom = Some(converter);
    }

    pub fn scalar(&mut self, scalar: Scalar) -> ShapeId {
        // Scalars are interchangeable; reuse an existing node.
        for (i, shape) in self.shapes.iter().enumerate() {
            if shape.kind == ShapeKind::Scalar(scalar) {
                return ShapeId(i as u32);
            }
        }
        self.push(Shape {
            name: format!("{:?}", scalar).to_lowercase(),
            kind: ShapeKind::Scalar(scalar),
            custom: None,
        })
    }

    /// Define an object shape in one step.
    pub fn object(&mut self, name: &str, object: ObjectShape) -> Result<ShapeId> {
        let id = self.declare(name);
        self.define(id, ShapeKind::Object(object))?;
        Ok(id)
    }

    pub fn enumeration(
        &mut self,
        name: &str,
        repr: Scalar,
        members: Vec<(String, Integer)>,
    ) -> Result<ShapeId> {
        let id = self.declare(name);
        self.define(id, ShapeKind::Enum(EnumShape { repr, members }))?;
        Ok(id)
    }

    pub fn dictionary(
        &mut self,
        key: ShapeId,
        value: ShapeId,
        construction: Construction,
    ) -> ShapeId {
        let name = format!("{{{}: {}}}", self.name(key), self.name(value));
        let id = self.declare(&name);
        // Dictionary shapes have nothing to reject at this point.
        let _ = self.define(
            id,
            ShapeKind::Dictionary(DictShape {
                key,
                value,
                construction,
            }),
        );
        id
    }

    pub fn sequence(&mut self, element: ShapeId, construction: Construction) -> ShapeId {
        let name = format!("[{}]", self.name(element));
        let id = self.declare(&name);
        let _ = self.define(
            id,
            ShapeKind::Sequence(SeqShape {
                element,
                rank: 1,
                construction,
            }),
        );
        id
    }

    /// A multi-dimensional array shape of the given rank.
    pub fn multi_array(
        &mut self,
        element: ShapeId,
        rank: u32,
        construction: Construction,
    ) -> Result<ShapeId> {
        let name = format!("[{}; rank {}]", self.name(element), rank);
        let id = self.declare(&name);
        self.define(
            id,
            ShapeKind::Sequence(SeqShape {
                element,
                rank,
                construction,
            }),
        )?;
        Ok(id)
    }

    pub fn optional(&mut self, element: ShapeId) -> ShapeId {
        let name = format!("{}?", self.name(element));
        let id = self.declare(&name);
        let _ = self.define(id, ShapeKind::Optional(OptionalShape { element }));
        id
    }

    pub fn union(&mut self, name: &str, base: ShapeId, cases: Vec<UnionCase>) -> Result<ShapeId> {
        let id = self.declare(name);
        self.define(id, ShapeKind::Union(UnionShape { base, cases }))?;
        Ok(id)
    }

    pub fn surrogate(
        &mut self,
        name: &str,
        target: ShapeId,
        forward: SurrogateFn,
        back: SurrogateFn,
    ) -> ShapeId {
        let id = self.declare(name);
        let _ = self.define(
            id,
            ShapeKind::Surrogate(SurrogateShape {
                target,
                forward,
                back,
            }),
        );
        id
    }

    /// Length of the parent chain above an object shape. Deeper is more
    /// derived; unions dispatch most-derived-first.
    pub fn derived_depth(&self, id: ShapeId) -> usize {
        let mut depth = 0;
        let mut cursor = id;
        while let ShapeKind::Object(ObjectShape {
            parent: Some(parent),
            ..
        }) = &self.get(cursor).kind
        {
            depth += 1;
            cursor = *parent;
            if depth > self.shapes.len() {
                break;
            }
        }
        depth
    }

    /// Whether `ancestor` is `id` itself or appears on its parent chain.
    pub fn is_ancestor(&self, ancestor: ShapeId, id: ShapeId) -> bool {
        let mut cursor = id;
        let mut hops = 0;
        loop {
            if cursor == ancestor {
                return true;
            }
            match &self.get(cursor).kind {
                ShapeKind::Object(ObjectShape {
                    parent: Some(parent),
                    ..
                }) => {
                    cursor = *parent;
                    hops += 1;
                    if hops > self.shapes.len() {
                        return false;
                    }
                }
                _ => return false,
            }
        }
    }

    /// Whether values of this shape are records (and so carry identity).
    /// Reference preservation applies only to these.
    pub fn produces_records(&self, id: ShapeId) -> bool {
        match &self.get(id).kind {
            ShapeKind::Object(_) => true,
            ShapeKind::Union(u) => self.produces_records(u.base),
            ShapeKind::Surrogate(s) => self.produces_records(s.target),
            _ => false,
        }
    }
}

fn validate_kind(name: &str, kind: &ShapeKind) -> Result<()> {
    match kind {
        ShapeKind::Object(object) => validate_object(name, object),
        ShapeKind::Enum(e) => validate_enum(name, e),
        ShapeKind::Union(u) => validate_union(name, u),
        ShapeKind::Sequence(s) => {
            if s.rank == 0 {
                return Err(Error::Config(format!(
                    "sequence shape \"{}\" has rank zero",
                    name
                )));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn validate_object(name: &str, object: &ObjectShape) -> Result<()> {
    let mut indexed = 0usize;
    for (i, prop) in object.properties.iter().enumerate() {
        if object.properties[..i].iter().any(|p| p.name == prop.name) {
            return Err(Error::Config(format!(
                "object \"{}\" declares property \"{}\" twice",
                name, prop.name
            )));
        }
        if let Some(index) = prop.index {
            indexed += 1;
            if object.properties[..i]
                .iter()
                .any(|p| p.index == Some(index))
            {
                return Err(Error::Config(format!(
                    "object \"{}\" assigns index {} twice",
                    name, index
                )));
            }
        }
    }
    if indexed != 0 && indexed != object.properties.len() {
        return Err(Error::Config(format!(
            "object \"{}\" mixes indexed and non-indexed properties",
            name
        )));
    }
    if let Some(ctor) = &object.ctor {
        for (i, param) in ctor.params.iter().enumerate() {
            if ctor.params[..i].contains(param) {
                return Err(Error::Config(format!(
                    "object \"{}\" constructor lists parameter \"{}\" twice",
                    name, param
                )));
            }
            if !object.properties.iter().any(|p| &p.name == param) {
                return Err(Error::Config(format!(
                    "object \"{}\" constructor parameter \"{}\" matches no property",
                    name, param
                )));
            }
        }
    }
    Ok(())
}

fn validate_enum(name: &str, e: &EnumShape) -> Result<()> {
    if !e.repr.is_integer() {
        return Err(Error::Config(format!(
            "enum \"{}\" repr must be an integer scalar",
            name
        )));
    }
    for (i, (member, value)) in e.members.iter().enumerate() {
        if e.members[..i].iter().any(|(m, _)| m == member) {
            return Err(Error::Config(format!(
                "enum \"{}\" declares member \"{}\" twice",
                name, member
            )));
        }
        if e.members[..i].iter().any(|(_, v)| v == value) {
            return Err(Error::Config(format!(
                "enum \"{}\" assigns value {} twice",
                name, value
            )));
        }
    }
    Ok(())
}

pub(crate) fn validate_union(name: &str, u: &UnionShape) -> Result<()> {
    for (i, case) in u.cases.iter().enumerate() {
        let earlier = &u.cases[..i];
        if earlier.iter().any(|c| c.tag == case.tag) {
            return Err(Error::Config(format!(
                "union \"{}\" registers tag {} twice",
                name, case.tag
            )));
        }
        if let Some(alias) = &case.alias {
            if earlier
                .iter()
                .any(|c| c.alias.as_deref() == Some(alias.as_str()))
            {
                return Err(Error::Config(format!(
                    "union \"{}\" registers alias \"{}\" twice",
                    name, alias
                )));
            }
        }
        if earlier.iter().any(|c| c.shape == case.shape) {
            return Err(Error::Config(format!(
                "union \"{}\" registers the same case shape twice",
                name
            )));
        }
    }
    Ok(())
}
