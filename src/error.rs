//! Error types: schema errors raised by validation, codec errors raised while reading or
//! writing a buffer.

use crate::trace::{ParseTrace, TraceFrame};

/// A type graph that cannot be used by a codec.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    #[error("Duplicate type name: {0}")]
    DuplicateTypeName(String),
    #[error("Unresolved type reference(s): {}", .0.join(", "))]
    UnresolvedTypeReferences(Vec<String>),
    #[error("{owner}.{field}: {kind} cannot be {bits} bit(s) wide")]
    BitWidthOutOfRange {
        owner: String,
        field: String,
        kind: &'static str,
        bits: u32,
    },
    #[error("{owner}: cases {first} and {second} share the discriminator tuple ({values})")]
    AmbiguousDiscriminator {
        owner: String,
        first: String,
        second: String,
        values: String,
    },
    #[error("{owner}: case {case} has {found} discriminator value(s), the switch declares {expected}")]
    DiscriminatorArity {
        owner: String,
        case: String,
        expected: usize,
        found: usize,
    },
    #[error("{owner}: switch discriminator {name} is not a field or parameter declared before it")]
    UnknownDiscriminatorField { owner: String, name: String },
    #[error("{owner}.{field}: expression reads {name} before it is declared")]
    UnknownExpressionName { owner: String, field: String, name: String },
    #[error("{owner}: constant {constant} = {value} does not fit in {bits} bit(s)")]
    EnumValueOutOfRange {
        owner: String,
        constant: String,
        value: i128,
        bits: u32,
    },
}

/// Failure while decoding or encoding.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("End of data: {requested} bit(s) requested at bit {position}, {available} available")]
    EndOfData {
        position: u64,
        requested: u64,
        available: u64,
    },
    #[error("Value {value} does not fit in {bits} bit(s)")]
    ValueOutOfRange { value: String, bits: u32 },
    #[error("Invalid bit length {bits} for {what}")]
    InvalidBitLength { what: &'static str, bits: u64 },
    #[error("Position {position} is outside the buffer ({total} bits)")]
    PositionOutOfRange { position: u64, total: u64 },
    #[error("No case for discriminator(s) [{}] = ({})", .fields.join(", "), .values.join(", "))]
    UnknownDiscriminator {
        fields: Vec<String>,
        values: Vec<String>,
    },
    #[error("Const {field}: expected {expected}, found {actual}")]
    ConstMismatch {
        field: String,
        expected: String,
        actual: String,
    },
    #[error("Reserved bits: expected {expected}, found {actual}")]
    ReservedMismatch { expected: String, actual: String },
    #[error("Checksum {field}: computed {expected:#x}, found {actual:#x}")]
    ChecksumMismatch {
        field: String,
        expected: u64,
        actual: u64,
    },
    #[error("Assertion on {field} failed: {condition}")]
    AssertionFailed { field: String, condition: String },
    #[error("Unknown value {raw} for enum {type_name}")]
    UnknownEnumValue { type_name: String, raw: i128 },
    #[error("Missing field: {0}")]
    MissingField(String),
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("Length/count mismatch: {0}")]
    LengthMismatch(String),
    #[error("Unknown type: {0}")]
    UnknownType(String),
    #[error("Expression: {0}")]
    Expression(String),
    #[error("Text encoding: {0}")]
    TextEncoding(String),
    #[error("Context mismatch: expected to leave {expected}, top is {found}")]
    ContextMismatch { expected: String, found: String },
    #[error("{trail}: {source}")]
    At {
        trail: String,
        frames: Vec<TraceFrame>,
        source: Box<CodecError>,
    },
}

impl CodecError {
    /// Attach the current trail unless the error already carries one from a deeper frame.
    pub fn at(self, trace: &ParseTrace) -> CodecError {
        match self {
            CodecError::At { .. } => self,
            other if trace.is_empty() => other,
            other => CodecError::At {
                trail: trace.render(),
                frames: trace.frames().to_vec(),
                source: Box::new(other),
            },
        }
    }

    /// The underlying error with any trail annotation stripped.
    pub fn root(&self) -> &CodecError {
        match self {
            CodecError::At { source, .. } => source.root(),
            other => other,
        }
    }

    /// Frames active when the error was raised, outermost first.
    pub fn frames(&self) -> &[TraceFrame] {
        match self {
            CodecError::At { frames, .. } => frames,
            _ => &[],
        }
    }
}
