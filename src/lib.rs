//! # wiremodel: schema-driven binary protocol runtime
//!
//! Protocols are described as a graph of types and fields (built in Rust by a schema front
//! end), resolved once into a read-only [`TypeContext`], and decoded/encoded by a single
//! generic [`Codec`] over a bit-addressable buffer.
//!
//! ## Pieces
//!
//! - **Model**: leaf simple types ([`SimpleTypeReference`]), complex and enum definitions,
//!   field variants (simple, const, reserved, array, optional, virtual, discriminator,
//!   switch, implicit, checksum, assert, peek, padding) and switch cases.
//! - **Registry**: [`TypeRegistry`] collects declarations in any order, `resolve()` closes
//!   references into a [`TypeContext`], `validate()` checks the graph.
//! - **Buffers**: [`ReadBuffer`] / [`WriteBuffer`] with bit positions, rewind, byte orders,
//!   custom-width floats, strings and a named-context stack.
//! - **Dispatch**: first-match case selection on discriminator tuples.
//! - **Trace**: [`ParseTrace`] frames entered through scoped guards; errors carry a
//!   snapshot of the trail.
//! - **Structure**: optional [`Structure`] tree of contexts and primitives recorded by the
//!   buffers, rendered as nested boxes ([`Codec::decode_structured`]).
//!
//! ## Example
//!
//! ```
//! use wiremodel::{ByteOrder, Codec, ComplexTypeDefinition, Field, SimpleTypeReference, TypeRegistry, Value};
//! use std::sync::Arc;
//!
//! let mut registry = TypeRegistry::new();
//! registry.declare(ComplexTypeDefinition::new(
//!     "Header",
//!     vec![
//!         Field::simple("version", SimpleTypeReference::uint(4)),
//!         Field::simple("flags", SimpleTypeReference::uint(4)),
//!         Field::simple("length", SimpleTypeReference::uint(16)),
//!     ],
//! ));
//! let codec = Codec::new(Arc::new(registry.resolve()), ByteOrder::BigEndian).unwrap();
//! let value = codec.decode("Header", &[0x12, 0x00, 0x08]).unwrap();
//! let record = value.as_record().unwrap();
//! assert_eq!(record.get("version"), Some(&Value::UInt(1)));
//! assert_eq!(record.get("length"), Some(&Value::UInt(8)));
//! assert_eq!(codec.encode("Header", &value).unwrap(), vec![0x12, 0x00, 0x08]);
//! ```

pub mod address;
pub mod buffer;
pub mod checksum;
pub mod codec;
pub mod dispatch;
pub mod dump;
pub mod error;
pub mod expr;
pub mod frame;
pub mod model;
pub mod registry;
pub mod structure;
pub mod trace;
pub mod value;

pub use address::{AddressError, SdoAddress};
pub use buffer::{ByteOrder, ReadBuffer, TextEncoding, WriteBuffer};
pub use checksum::ChecksumAlgorithm;
pub use codec::{Codec, LAST_ITEM};
pub use error::{CodecError, SchemaError};
pub use expr::{Expr, Literal};
pub use frame::{decode_frame, encode_frame, FrameDecodeResult};
pub use model::{
    ArrayLength, Case, CaseValue, ComplexTypeDefinition, ComplexTypeReference, EnumTypeDefinition, Field,
    Parameter, SimpleKind, SimpleTypeReference, SourceLocation, SwitchField, TypeDefinition, TypeId,
    TypeReference,
};
pub use registry::{TypeContext, TypeRegistry, UnresolvedReference};
pub use structure::{Structure, StructureItem, StructureNode, StructureRecorder};
pub use trace::{ContextGuard, ParseTrace, TraceFrame, Traced};
pub use value::{EnumValue, Record, Value};
