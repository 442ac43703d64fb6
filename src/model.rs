//! Type and field model: the declarations a schema front end hands to the registry.
//!
//! Leaf types are [`SimpleTypeReference`]s; everything with fields is a
//! [`ComplexTypeDefinition`]. References to other types start out as names and are patched
//! to [`TypeId`]s by [`crate::TypeRegistry::resolve`].

use crate::buffer::{ByteOrder, TextEncoding};
use crate::checksum::ChecksumAlgorithm;
use crate::expr::{Expr, Literal};
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    pub fn new(line: u32, column: u32) -> Self {
        SourceLocation { line, column }
    }
}

/// Index into the resolved type arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub(crate) usize);

impl TypeId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SimpleKind {
    Bit,
    UInt,
    Int,
    Float { exponent: u32, mantissa: u32 },
    UFloat { exponent: u32, mantissa: u32 },
    Byte,
    Char,
    /// Fixed-width string.
    String,
    /// String whose width in bits is computed from the expression.
    VString(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimpleTypeReference {
    pub kind: SimpleKind,
    pub bit_length: u32,
    pub byte_order: Option<ByteOrder>,
    pub encoding: Option<TextEncoding>,
}

impl SimpleTypeReference {
    fn of(kind: SimpleKind, bit_length: u32) -> Self {
        SimpleTypeReference {
            kind,
            bit_length,
            byte_order: None,
            encoding: None,
        }
    }

    pub fn bit() -> Self {
        Self::of(SimpleKind::Bit, 1)
    }

    pub fn uint(bits: u32) -> Self {
        Self::of(SimpleKind::UInt, bits)
    }

    pub fn int(bits: u32) -> Self {
        Self::of(SimpleKind::Int, bits)
    }

    pub fn byte() -> Self {
        Self::of(SimpleKind::Byte, 8)
    }

    /// Signed float with the given exponent and mantissa widths (plus one sign bit).
    pub fn float(exponent: u32, mantissa: u32) -> Self {
        Self::of(SimpleKind::Float { exponent, mantissa }, 1 + exponent + mantissa)
    }

    pub fn ufloat(exponent: u32, mantissa: u32) -> Self {
        Self::of(SimpleKind::UFloat { exponent, mantissa }, exponent + mantissa)
    }

    pub fn float32() -> Self {
        Self::float(8, 23)
    }

    pub fn float64() -> Self {
        Self::float(11, 52)
    }

    pub fn char(bits: u32) -> Self {
        Self::of(SimpleKind::Char, bits)
    }

    pub fn string(bits: u32) -> Self {
        Self::of(SimpleKind::String, bits)
    }

    pub fn vstring(length_bits: Expr) -> Self {
        Self::of(SimpleKind::VString(Box::new(length_bits)), 0)
    }

    pub fn with_byte_order(mut self, order: ByteOrder) -> Self {
        self.byte_order = Some(order);
        self
    }

    pub fn with_encoding(mut self, encoding: TextEncoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            SimpleKind::Bit => "bit",
            SimpleKind::UInt => "uint",
            SimpleKind::Int => "int",
            SimpleKind::Float { .. } => "float",
            SimpleKind::UFloat { .. } => "ufloat",
            SimpleKind::Byte => "byte",
            SimpleKind::Char => "char",
            SimpleKind::String => "string",
            SimpleKind::VString(_) => "vstring",
        }
    }

    /// Whether `bit_length` is legal for the kind.
    pub fn has_valid_width(&self) -> bool {
        let bits = self.bit_length;
        match &self.kind {
            SimpleKind::Bit => bits == 1,
            SimpleKind::Byte => bits == 8,
            SimpleKind::UInt | SimpleKind::Int => (1..=64).contains(&bits),
            SimpleKind::Float { exponent, mantissa } => {
                float_layout_ok(*exponent, *mantissa) && bits == 1 + exponent + mantissa && bits <= 64
            }
            SimpleKind::UFloat { exponent, mantissa } => {
                float_layout_ok(*exponent, *mantissa) && bits == exponent + mantissa && bits <= 64
            }
            SimpleKind::Char => bits == 8 || bits == 16,
            SimpleKind::String => bits > 0 && bits % 8 == 0,
            SimpleKind::VString(_) => true,
        }
    }
}

fn float_layout_ok(exponent: u32, mantissa: u32) -> bool {
    (1..=11).contains(&exponent) && (1..=52).contains(&mantissa)
}

impl fmt::Display for SimpleTypeReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            SimpleKind::Bit => write!(f, "bit"),
            SimpleKind::Byte => write!(f, "byte"),
            SimpleKind::VString(len) => write!(f, "vstring '{}'", len),
            _ => write!(f, "{} {}", self.kind_name(), self.bit_length),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComplexTypeReference {
    pub name: String,
    /// Arguments bound to the target's parameters, evaluated in the referencing scope.
    pub args: Vec<Expr>,
    /// Set by the resolver.
    pub target: Option<TypeId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeReference {
    Simple(SimpleTypeReference),
    Complex(ComplexTypeReference),
}

impl TypeReference {
    pub fn complex(name: impl Into<String>) -> Self {
        Self::complex_with_args(name, Vec::new())
    }

    pub fn complex_with_args(name: impl Into<String>, args: Vec<Expr>) -> Self {
        TypeReference::Complex(ComplexTypeReference {
            name: name.into(),
            args,
            target: None,
        })
    }

    pub fn as_simple(&self) -> Option<&SimpleTypeReference> {
        match self {
            TypeReference::Simple(s) => Some(s),
            TypeReference::Complex(_) => None,
        }
    }
}

impl From<SimpleTypeReference> for TypeReference {
    fn from(s: SimpleTypeReference) -> Self {
        TypeReference::Simple(s)
    }
}

impl fmt::Display for TypeReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeReference::Simple(s) => write!(f, "{}", s),
            TypeReference::Complex(c) => write!(f, "{}", c.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArrayLength {
    /// Number of elements.
    Count(Expr),
    /// Total size of the elements in bytes.
    LengthInBytes(Expr),
    /// Elements until the end of the enclosing structure (or of the input).
    UntilEnd,
    /// Elements until the expression, with `lastItem` bound to the element just read, is true.
    Terminated(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub type_ref: TypeReference,
}

impl Parameter {
    pub fn new(name: impl Into<String>, type_ref: impl Into<TypeReference>) -> Self {
        Parameter {
            name: name.into(),
            type_ref: type_ref.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaseValue {
    Value(Literal),
    /// Matches any observed value.
    Any,
}

impl fmt::Display for CaseValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaseValue::Value(l) => write!(f, "{}", l),
            CaseValue::Any => write!(f, "*"),
        }
    }
}

impl From<u64> for CaseValue {
    fn from(x: u64) -> Self {
        CaseValue::Value(Literal::UInt(x))
    }
}

impl From<bool> for CaseValue {
    fn from(b: bool) -> Self {
        CaseValue::Value(Literal::Bool(b))
    }
}

impl From<&str> for CaseValue {
    fn from(s: &str) -> Self {
        CaseValue::Value(Literal::Str(s.to_string()))
    }
}

/// One branch of a type switch.
#[derive(Debug, Clone, PartialEq)]
pub struct Case {
    pub name: String,
    /// Empty means "default": matches anything.
    pub discriminator_values: Vec<CaseValue>,
    pub fields: Vec<Field>,
    /// Base type name; set by the resolver.
    pub parent: Option<String>,
    pub location: Option<SourceLocation>,
}

impl Case {
    pub fn new(name: impl Into<String>, discriminator_values: Vec<CaseValue>, fields: Vec<Field>) -> Self {
        Case {
            name: name.into(),
            discriminator_values,
            fields,
            parent: None,
            location: None,
        }
    }

    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.location = Some(SourceLocation::new(line, column));
        self
    }

    pub fn is_default(&self) -> bool {
        self.discriminator_values.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchField {
    pub discriminators: Vec<String>,
    pub cases: Vec<Case>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Simple {
        name: String,
        type_ref: TypeReference,
    },
    Const {
        name: String,
        type_ref: TypeReference,
        value: Literal,
    },
    Reserved {
        type_ref: SimpleTypeReference,
        expected: Literal,
    },
    Array {
        name: String,
        type_ref: TypeReference,
        length: ArrayLength,
    },
    Optional {
        name: String,
        type_ref: TypeReference,
        /// `None`: present if it decodes.
        condition: Option<Expr>,
    },
    Virtual {
        name: String,
        expr: Expr,
    },
    Discriminator {
        name: String,
        type_ref: TypeReference,
    },
    Switch(SwitchField),
    Implicit {
        name: String,
        type_ref: SimpleTypeReference,
        expr: Expr,
    },
    Checksum {
        name: String,
        type_ref: SimpleTypeReference,
        algorithm: ChecksumAlgorithm,
        /// Start of the covered bytes, relative to the enclosing structure.
        from_byte: u64,
    },
    Assert {
        name: String,
        type_ref: TypeReference,
        condition: Expr,
    },
    Peek {
        name: String,
        type_ref: TypeReference,
        /// Bit offset from the current position.
        offset: Option<Expr>,
    },
    Padding {
        type_ref: SimpleTypeReference,
        fill: Literal,
        count: Expr,
    },
}

impl Field {
    pub fn simple(name: impl Into<String>, type_ref: impl Into<TypeReference>) -> Self {
        Field::Simple {
            name: name.into(),
            type_ref: type_ref.into(),
        }
    }

    pub fn constant(name: impl Into<String>, type_ref: impl Into<TypeReference>, value: impl Into<Literal>) -> Self {
        Field::Const {
            name: name.into(),
            type_ref: type_ref.into(),
            value: value.into(),
        }
    }

    pub fn reserved(type_ref: SimpleTypeReference, expected: impl Into<Literal>) -> Self {
        Field::Reserved {
            type_ref,
            expected: expected.into(),
        }
    }

    pub fn array(name: impl Into<String>, type_ref: impl Into<TypeReference>, length: ArrayLength) -> Self {
        Field::Array {
            name: name.into(),
            type_ref: type_ref.into(),
            length,
        }
    }

    pub fn optional(name: impl Into<String>, type_ref: impl Into<TypeReference>, condition: Option<Expr>) -> Self {
        Field::Optional {
            name: name.into(),
            type_ref: type_ref.into(),
            condition,
        }
    }

    pub fn virtual_field(name: impl Into<String>, expr: Expr) -> Self {
        Field::Virtual { name: name.into(), expr }
    }

    pub fn discriminator(name: impl Into<String>, type_ref: impl Into<TypeReference>) -> Self {
        Field::Discriminator {
            name: name.into(),
            type_ref: type_ref.into(),
        }
    }

    pub fn switch(discriminators: &[&str], cases: Vec<Case>) -> Self {
        Field::Switch(SwitchField {
            discriminators: discriminators.iter().map(|d| d.to_string()).collect(),
            cases,
        })
    }

    pub fn implicit(name: impl Into<String>, type_ref: SimpleTypeReference, expr: Expr) -> Self {
        Field::Implicit {
            name: name.into(),
            type_ref,
            expr,
        }
    }

    pub fn checksum(name: impl Into<String>, type_ref: SimpleTypeReference, algorithm: ChecksumAlgorithm, from_byte: u64) -> Self {
        Field::Checksum {
            name: name.into(),
            type_ref,
            algorithm,
            from_byte,
        }
    }

    pub fn assert(name: impl Into<String>, type_ref: impl Into<TypeReference>, condition: Expr) -> Self {
        Field::Assert {
            name: name.into(),
            type_ref: type_ref.into(),
            condition,
        }
    }

    pub fn peek(name: impl Into<String>, type_ref: impl Into<TypeReference>, offset: Option<Expr>) -> Self {
        Field::Peek {
            name: name.into(),
            type_ref: type_ref.into(),
            offset,
        }
    }

    pub fn padding(type_ref: SimpleTypeReference, fill: impl Into<Literal>, count: Expr) -> Self {
        Field::Padding {
            type_ref,
            fill: fill.into(),
            count,
        }
    }

    /// Name the field binds in scope (reserved, padding and switch bind nothing).
    pub fn name(&self) -> Option<&str> {
        match self {
            Field::Simple { name, .. }
            | Field::Const { name, .. }
            | Field::Array { name, .. }
            | Field::Optional { name, .. }
            | Field::Virtual { name, .. }
            | Field::Discriminator { name, .. }
            | Field::Implicit { name, .. }
            | Field::Checksum { name, .. }
            | Field::Assert { name, .. }
            | Field::Peek { name, .. } => Some(name),
            Field::Reserved { .. } | Field::Switch(_) | Field::Padding { .. } => None,
        }
    }

    /// Simple type references carried by the field (for width validation).
    pub fn simple_types(&self) -> Vec<&SimpleTypeReference> {
        match self {
            Field::Simple { type_ref, .. }
            | Field::Const { type_ref, .. }
            | Field::Array { type_ref, .. }
            | Field::Optional { type_ref, .. }
            | Field::Discriminator { type_ref, .. }
            | Field::Assert { type_ref, .. }
            | Field::Peek { type_ref, .. } => type_ref.as_simple().into_iter().collect(),
            Field::Reserved { type_ref, .. }
            | Field::Implicit { type_ref, .. }
            | Field::Checksum { type_ref, .. }
            | Field::Padding { type_ref, .. } => vec![type_ref],
            Field::Virtual { .. } | Field::Switch(_) => Vec::new(),
        }
    }

    pub(crate) fn type_ref(&self) -> Option<&TypeReference> {
        match self {
            Field::Simple { type_ref, .. }
            | Field::Const { type_ref, .. }
            | Field::Array { type_ref, .. }
            | Field::Optional { type_ref, .. }
            | Field::Discriminator { type_ref, .. }
            | Field::Assert { type_ref, .. }
            | Field::Peek { type_ref, .. } => Some(type_ref),
            _ => None,
        }
    }

    /// Complex type reference carried by the field, for the resolver.
    pub(crate) fn type_ref_mut(&mut self) -> Option<&mut TypeReference> {
        match self {
            Field::Simple { type_ref, .. }
            | Field::Const { type_ref, .. }
            | Field::Array { type_ref, .. }
            | Field::Optional { type_ref, .. }
            | Field::Discriminator { type_ref, .. }
            | Field::Assert { type_ref, .. }
            | Field::Peek { type_ref, .. } => Some(type_ref),
            _ => None,
        }
    }

    /// Short label used in parse trace frames.
    pub fn context_label(&self) -> String {
        match self {
            Field::Reserved { .. } => "reserved".to_string(),
            Field::Padding { .. } => "padding".to_string(),
            Field::Switch(s) => format!("switch [{}]", s.discriminators.join(", ")),
            named => format!("field {}", named.name().unwrap_or_default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComplexTypeDefinition {
    pub name: String,
    pub params: Vec<Parameter>,
    pub fields: Vec<Field>,
    /// True iff the field list holds a switch.
    pub is_abstract: bool,
    pub parent: Option<String>,
    pub location: Option<SourceLocation>,
}

impl ComplexTypeDefinition {
    pub fn new(name: impl Into<String>, fields: Vec<Field>) -> Self {
        let is_abstract = fields.iter().any(|f| matches!(f, Field::Switch(_)));
        ComplexTypeDefinition {
            name: name.into(),
            params: Vec::new(),
            fields,
            is_abstract,
            parent: None,
            location: None,
        }
    }

    pub fn with_params(mut self, params: Vec<Parameter>) -> Self {
        self.params = params;
        self
    }

    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.location = Some(SourceLocation::new(line, column));
        self
    }

    pub fn switch_field(&self) -> Option<&SwitchField> {
        self.fields.iter().find_map(|f| match f {
            Field::Switch(s) => Some(s),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumTypeDefinition {
    pub name: String,
    pub base: SimpleTypeReference,
    pub constants: Vec<(String, i128)>,
    pub location: Option<SourceLocation>,
}

impl EnumTypeDefinition {
    pub fn new(name: impl Into<String>, base: SimpleTypeReference, constants: &[(&str, i128)]) -> Self {
        EnumTypeDefinition {
            name: name.into(),
            base,
            constants: constants.iter().map(|(n, v)| (n.to_string(), *v)).collect(),
            location: None,
        }
    }

    pub fn name_of(&self, raw: i128) -> Option<&str> {
        self.constants.iter().find(|(_, v)| *v == raw).map(|(n, _)| n.as_str())
    }

    pub fn value_of(&self, name: &str) -> Option<i128> {
        self.constants.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeDefinition {
    Complex(ComplexTypeDefinition),
    Enum(EnumTypeDefinition),
}

impl TypeDefinition {
    pub fn name(&self) -> &str {
        match self {
            TypeDefinition::Complex(c) => &c.name,
            TypeDefinition::Enum(e) => &e.name,
        }
    }

    pub fn location(&self) -> Option<SourceLocation> {
        match self {
            TypeDefinition::Complex(c) => c.location,
            TypeDefinition::Enum(e) => e.location,
        }
    }

    pub fn as_complex(&self) -> Option<&ComplexTypeDefinition> {
        match self {
            TypeDefinition::Complex(c) => Some(c),
            TypeDefinition::Enum(_) => None,
        }
    }

    pub fn as_enum(&self) -> Option<&EnumTypeDefinition> {
        match self {
            TypeDefinition::Enum(e) => Some(e),
            TypeDefinition::Complex(_) => None,
        }
    }
}

impl From<ComplexTypeDefinition> for TypeDefinition {
    fn from(c: ComplexTypeDefinition) -> Self {
        TypeDefinition::Complex(c)
    }
}

impl From<EnumTypeDefinition> for TypeDefinition {
    fn from(e: EnumTypeDefinition) -> Self {
        TypeDefinition::Enum(e)
    }
}
