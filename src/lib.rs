//! shape-pack is a MessagePack codec driven by a runtime type model.
//!
//! Instead of deriving serialization code per type, callers describe their
//! types as *shapes* — objects with properties and constructors, enums,
//! dictionaries, sequences, optionals, unions, surrogates — and the
//! serializer builds and memoizes a converter for each shape on first use.
//! Values travel through a dynamic [`Value`] tree whose object instances
//! ([`Record`]) carry identity, which is what makes reference preservation
//! and cyclic object graphs work.
//!
//! The wire format is canonical msgpack: encoders always emit the shortest
//! integer form, decoders accept any form. Two extension types carry
//! meaning: the msgpack-reserved timestamp (`-1`) and this library's
//! backreference token for reference preservation.
//!
//! ```
//! use shape_pack::{Construction, Context, Scalar, Serializer, ShapeGraph, Value};
//! use std::sync::Arc;
//!
//! let mut graph = ShapeGraph::new();
//! let element = graph.scalar(Scalar::U32);
//! let numbers = graph.sequence(element, Construction::Sized);
//!
//! let serializer = Serializer::new(Arc::new(graph));
//! let ctx = Context::new();
//! let value = Value::Array(vec![Value::from(1u8), Value::from(2u8), Value::from(3u8)]);
//! let bytes = serializer.serialize_to_vec(&value, numbers, &ctx).unwrap();
//! assert_eq!(bytes, [0x93, 0x01, 0x02, 0x03]);
//! assert_eq!(serializer.deserialize(&bytes, numbers, &ctx).unwrap(), value);
//! ```
//!
//! Decoding can also run incrementally: the [`StreamReader`] reports
//! short buffers through [`DecodeResult`] instead of errors and resumes
//! skips across refills, which is what the async pipe endpoints build on.

mod context;
mod convert;
pub mod decode;
pub mod encode;
mod error;
mod integer;
mod marker;
mod pipe;
mod read;
mod segment;
mod serializer;
mod shape;
mod stream;
mod timestamp;
mod value;
mod write;

pub use self::context::{
    CancelToken, Context, DecodeDefaults, EmitDefaults, MultiDimFormat, NamingPolicy, OpContext,
    PreserveReferences,
};
pub use self::convert::Converter;
pub use self::decode::DecodeResult;
pub use self::encode::BufferTooSmall;
pub use self::error::{Error, Result};
pub use self::integer::{Integer, Named};
pub use self::marker::{ExtType, Marker};
pub use self::pipe::DeserializeStream;
pub use self::read::Reader;
pub use self::segment::SegmentBuffer;
pub use self::serializer::Serializer;
pub use self::shape::{
    Construction, Ctor, DictShape, EmitPolicy, EnumShape, ObjectShape, OptionalShape, Property,
    RecordHook, Scalar, SeqShape, Shape, ShapeGraph, ShapeId, ShapeKind, SurrogateFn,
    SurrogateShape, UnionCase, UnionShape,
};
pub use self::stream::{ExchangeInfo, StreamReader};
pub use self::timestamp::Timestamp;
pub use self::value::{Literal, Record, UnusedData, UnusedKey, Value};
pub use self::write::{Writer, DEFAULT_FLUSH_THRESHOLD};

/// Default nesting budget for one (de)serialization.
pub const DEFAULT_MAX_DEPTH: u32 = 64;
