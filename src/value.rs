//! Decoded message tree (codec representation).

use crate::expr::Literal;
use indexmap::IndexMap;
use std::fmt;

/// A single decoded value (field, list or nested record).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    UInt(u64),
    Int(i64),
    Float(f64),
    Char(char),
    String(String),
    /// Arrays of `byte`.
    Bytes(Vec<u8>),
    Enum(EnumValue),
    List(Vec<Value>),
    Record(Record),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumValue {
    pub type_name: String,
    pub name: String,
    /// Constant value; negative for signed bases.
    pub raw: i128,
}

/// Instance of a complex type. `case` names the switch case that was decoded (or is to be
/// encoded); its fields are flattened into `fields` after the base fields.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    pub type_name: String,
    pub case: Option<String>,
    pub fields: IndexMap<String, Value>,
}

impl Record {
    pub fn new(type_name: impl Into<String>) -> Self {
        Record {
            type_name: type_name.into(),
            case: None,
            fields: IndexMap::new(),
        }
    }

    pub fn with_case(mut self, case: impl Into<String>) -> Self {
        self.case = Some(case.into());
        self
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    /// Case name if one was selected, else the type name.
    pub fn concrete_name(&self) -> &str {
        self.case.as_deref().unwrap_or(&self.type_name)
    }
}

impl Value {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(x) => Some(*x),
            Value::Int(x) if *x >= 0 => Some(*x as u64),
            Value::Bool(b) => Some(*b as u64),
            Value::Enum(e) => u64::try_from(e.raw).ok(),
            Value::Char(c) => Some(*c as u64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(x) => Some(*x),
            Value::UInt(x) => i64::try_from(*x).ok(),
            Value::Bool(b) => Some(*b as i64),
            Value::Enum(e) => i64::try_from(e.raw).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(x) => Some(*x),
            Value::UInt(x) => Some(*x as f64),
            Value::Int(x) => Some(*x as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::UInt(x) => Some(*x != 0),
            Value::Int(x) => Some(*x != 0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            Value::Enum(e) => Some(&e.name),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Record(r) => Some(r),
            _ => None,
        }
    }

    /// Element count for lists, byte arrays and strings.
    pub fn len(&self) -> Option<usize> {
        match self {
            Value::List(v) => Some(v.len()),
            Value::Bytes(b) => Some(b.len()),
            Value::String(s) => Some(s.len()),
            _ => None,
        }
    }

    /// Short kind name used in type-mismatch errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::UInt(_) => "uint",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Char(_) => "char",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Enum(_) => "enum",
            Value::List(_) => "list",
            Value::Record(_) => "record",
        }
    }

    /// Compares against a schema literal. Numbers compare by value regardless of sign
    /// representation; enums match their constant name or raw value; bools match 0/1.
    pub fn matches_literal(&self, literal: &Literal) -> bool {
        match (self, literal) {
            (Value::Bool(a), Literal::Bool(b)) => a == b,
            (Value::Float(a), lit) => lit.as_f64() == Some(*a),
            (Value::String(a), Literal::Str(b)) => a == b,
            (Value::Char(a), Literal::Str(b)) => b.chars().eq(std::iter::once(*a)),
            (Value::Enum(e), Literal::Str(b)) => &e.name == b,
            (v, Literal::Float(b)) => v.as_f64() == Some(*b),
            (v, lit) => match (v.as_i128(), lit.as_i128()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    /// Equality that ignores numeric representation (`UInt(3) == Int(3)`).
    pub fn loosely_equals(&self, other: &Value) -> bool {
        match (self.as_i128(), other.as_i128()) {
            (Some(a), Some(b)) => a == b,
            _ => match (self, other) {
                (Value::Float(_), _) | (_, Value::Float(_)) => self.as_f64() == other.as_f64(),
                (Value::Enum(a), Value::String(b)) | (Value::String(b), Value::Enum(a)) => &a.name == b,
                _ => self == other,
            },
        }
    }

    pub(crate) fn as_i128(&self) -> Option<i128> {
        match self {
            Value::UInt(x) => Some(*x as i128),
            Value::Int(x) => Some(*x as i128),
            Value::Bool(b) => Some(*b as i128),
            Value::Enum(e) => Some(e.raw),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::UInt(x) => write!(f, "{}", x),
            Value::Int(x) => write!(f, "{}", x),
            Value::Float(x) => write!(f, "{}", x),
            Value::Char(c) => write!(f, "'{}'", c),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Bytes(b) => {
                let hex: Vec<String> = b.iter().map(|x| format!("{:02x}", x)).collect();
                write!(f, "hex({})", hex.join(" "))
            }
            Value::Enum(e) => write!(f, "{}::{}", e.type_name, e.name),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Record(r) => write!(f, "{} {{..{} field(s)}}", r.concrete_name(), r.fields.len()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<u8> for Value {
    fn from(x: u8) -> Self {
        Value::UInt(x as u64)
    }
}

impl From<u16> for Value {
    fn from(x: u16) -> Self {
        Value::UInt(x as u64)
    }
}

impl From<u32> for Value {
    fn from(x: u32) -> Self {
        Value::UInt(x as u64)
    }
}

impl From<u64> for Value {
    fn from(x: u64) -> Self {
        Value::UInt(x)
    }
}

impl From<i64> for Value {
    fn from(x: i64) -> Self {
        Value::Int(x)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<Record> for Value {
    fn from(r: Record) -> Self {
        Value::Record(r)
    }
}

impl From<EnumValue> for Value {
    fn from(e: EnumValue) -> Self {
        Value::Enum(e)
    }
}
