//! Generic encode/decode over a resolved type graph.
//!
//! One walker handles every type: it opens a scope frame per complex type (parameters,
//! implicit values and decoded fields), walks the fields in order, dispatches switches
//! through [`crate::dispatch`] and records each type/field/case/item in the buffer's parse
//! trace via scoped guards. Errors are annotated with the trail at the innermost frame.

use crate::buffer::{ByteOrder, ReadBuffer, WriteBuffer};
use crate::checksum::covered_bytes;
use crate::dispatch;
use crate::error::{CodecError, SchemaError};
use crate::expr::{eval, eval_bool, eval_u64, lookup_path, Scope};
use crate::model::{
    ArrayLength, ComplexTypeDefinition, ComplexTypeReference, EnumTypeDefinition, Field, SimpleKind, SimpleTypeReference, SourceLocation,
    SwitchField, TypeDefinition, TypeId, TypeReference,
};
use crate::registry::TypeContext;
use crate::structure::Structure;
use crate::trace::Traced;
use crate::value::{EnumValue, Record, Value};
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::trace;

/// Name bound to the element just read while evaluating a terminated array's condition.
pub const LAST_ITEM: &str = "lastItem";

#[derive(Debug, Clone)]
pub struct Codec {
    context: Arc<TypeContext>,
    byte_order: ByteOrder,
}

/// Stack of scope frames, innermost last.
#[derive(Debug, Default)]
struct Frames {
    frames: Vec<IndexMap<String, Value>>,
}

impl Frames {
    fn push(&mut self, frame: IndexMap<String, Value>) {
        self.frames.push(frame);
    }

    fn pop(&mut self) {
        self.frames.pop();
    }

    fn bind(&mut self, name: &str, value: Value) {
        if let Some(top) = self.frames.last_mut() {
            top.insert(name.to_string(), value);
        }
    }

    fn current(&self, name: &str) -> Option<&Value> {
        self.frames.last().and_then(|f| f.get(name))
    }

    fn discriminators(&self, switch: &SwitchField) -> Result<Vec<Value>, CodecError> {
        switch
            .discriminators
            .iter()
            .map(|d| {
                let path: Vec<String> = d.split('.').map(str::to_string).collect();
                lookup_path(self, &path)
                    .cloned()
                    .ok_or_else(|| CodecError::MissingField(d.clone()))
            })
            .collect()
    }
}

impl Scope for Frames {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.frames.iter().rev().find_map(|f| f.get(name))
    }
}

#[derive(Debug, Default)]
struct DecodeState {
    scopes: Frames,
    /// End positions (bits) of enclosing length-delimited regions.
    limits: Vec<u64>,
}

impl DecodeState {
    fn limit(&self, buf: &ReadBuffer<'_>) -> u64 {
        self.limits.last().copied().unwrap_or_else(|| buf.total_bits())
    }
}

/// Trace location for the fields being walked and the bit position where the enclosing
/// structure began (checksum offsets are relative to it).
#[derive(Clone, Copy)]
struct Site {
    location: SourceLocation,
    start: u64,
}

impl Codec {
    /// Validates the context; a codec is never built over an invalid graph.
    pub fn new(context: Arc<TypeContext>, byte_order: ByteOrder) -> Result<Self, SchemaError> {
        context.validate()?;
        Ok(Codec { context, byte_order })
    }

    pub fn context(&self) -> &TypeContext {
        &self.context
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn decode(&self, type_name: &str, bytes: &[u8]) -> Result<Value, CodecError> {
        self.decode_with_args(type_name, bytes, &[])
    }

    pub fn decode_with_args(&self, type_name: &str, bytes: &[u8], args: &[Value]) -> Result<Value, CodecError> {
        let mut buf = ReadBuffer::new(bytes, self.byte_order);
        self.decode_from(type_name, &mut buf, args)
    }

    /// Decode one value and return (bytes consumed, result). Used by the frame decoder.
    pub fn decode_with_extent(&self, type_name: &str, bytes: &[u8]) -> (usize, Result<Value, CodecError>) {
        let mut buf = ReadBuffer::new(bytes, self.byte_order);
        let result = self.decode_from(type_name, &mut buf, &[]);
        (buf.get_pos().div_ceil(8) as usize, result)
    }

    /// Decode at the buffer's current position.
    pub fn decode_from(&self, type_name: &str, buf: &mut ReadBuffer<'_>, args: &[Value]) -> Result<Value, CodecError> {
        let id = self
            .context
            .id_of(type_name)
            .ok_or_else(|| CodecError::UnknownType(type_name.to_string()))?;
        let mut state = DecodeState::default();
        self.decode_type(buf, id, args.to_vec(), &mut state)
    }

    /// Decode and also return the structure of what was read. Peeked and rewound reads
    /// are left out, so the tree matches the one [`Codec::encode_structured`] builds.
    pub fn decode_structured(&self, type_name: &str, bytes: &[u8], args: &[Value]) -> Result<(Value, Structure), CodecError> {
        let mut buf = ReadBuffer::new(bytes, self.byte_order);
        buf.record_structure();
        let value = self.decode_from(type_name, &mut buf, args)?;
        Ok((value, buf.take_structure()))
    }

    pub fn encode(&self, type_name: &str, value: &Value) -> Result<Vec<u8>, CodecError> {
        self.encode_with_args(type_name, value, &[])
    }

    pub fn encode_with_args(&self, type_name: &str, value: &Value, args: &[Value]) -> Result<Vec<u8>, CodecError> {
        let mut buf = WriteBuffer::new(self.byte_order);
        self.encode_into(type_name, &mut buf, value, args)?;
        Ok(buf.into_bytes())
    }

    pub fn encode_structured(&self, type_name: &str, value: &Value, args: &[Value]) -> Result<(Vec<u8>, Structure), CodecError> {
        let mut buf = WriteBuffer::new(self.byte_order);
        buf.record_structure();
        self.encode_into(type_name, &mut buf, value, args)?;
        let structure = buf.take_structure();
        Ok((buf.into_bytes(), structure))
    }

    /// Encode at the buffer's current position.
    pub fn encode_into(&self, type_name: &str, buf: &mut WriteBuffer, value: &Value, args: &[Value]) -> Result<(), CodecError> {
        let id = self
            .context
            .id_of(type_name)
            .ok_or_else(|| CodecError::UnknownType(type_name.to_string()))?;
        let mut scopes = Frames::default();
        self.encode_type(buf, id, value, args.to_vec(), &mut scopes)
    }

    fn definition(&self, id: TypeId) -> Result<&TypeDefinition, CodecError> {
        self.context
            .get(id)
            .ok_or_else(|| CodecError::UnknownType(format!("#{}", id.index())))
    }

    fn target(type_ref: &ComplexTypeReference) -> Result<TypeId, CodecError> {
        type_ref.target.ok_or_else(|| CodecError::UnknownType(type_ref.name.clone()))
    }

    // --- Decode ---

    fn decode_type(&self, buf: &mut ReadBuffer<'_>, id: TypeId, args: Vec<Value>, state: &mut DecodeState) -> Result<Value, CodecError> {
        match self.definition(id)? {
            TypeDefinition::Complex(def) => self.decode_complex(buf, def, args, state),
            TypeDefinition::Enum(def) => self.decode_enum(buf, def),
        }
    }

    fn decode_complex(
        &self,
        buf: &mut ReadBuffer<'_>,
        def: &ComplexTypeDefinition,
        args: Vec<Value>,
        state: &mut DecodeState,
    ) -> Result<Value, CodecError> {
        let location = def.location.unwrap_or_default();
        let mut buf = buf.enter(location.line, location.column, format!("type {}", def.name));
        let frame = bind_params(def, args).map_err(|e| e.at(buf.trace()))?;
        let site = Site {
            location,
            start: buf.get_pos(),
        };
        let mut record = Record::new(&def.name);
        state.scopes.push(frame);
        let result = self.decode_fields(&mut buf, site, &def.fields, &mut record, state);
        state.scopes.pop();
        result?;
        Ok(Value::Record(record))
    }

    fn decode_enum(&self, buf: &mut ReadBuffer<'_>, def: &EnumTypeDefinition) -> Result<Value, CodecError> {
        let location = def.location.unwrap_or_default();
        let mut buf = buf.enter(location.line, location.column, format!("type {}", def.name));
        let order = def.base.byte_order.unwrap_or(buf.byte_order());
        let raw = match def.base.kind {
            SimpleKind::Int => buf.read_signed_with_order(def.base.bit_length, order)? as i128,
            _ => buf.read_unsigned_with_order(def.base.bit_length, order)? as i128,
        };
        match def.name_of(raw) {
            Some(name) => Ok(Value::Enum(EnumValue {
                type_name: def.name.clone(),
                name: name.to_string(),
                raw,
            })),
            None => Err(CodecError::UnknownEnumValue {
                type_name: def.name.clone(),
                raw,
            }
            .at(buf.trace())),
        }
    }

    fn decode_fields(
        &self,
        buf: &mut ReadBuffer<'_>,
        site: Site,
        fields: &[Field],
        record: &mut Record,
        state: &mut DecodeState,
    ) -> Result<(), CodecError> {
        for field in fields {
            let mut buf = buf.enter(site.location.line, site.location.column, field.context_label());
            self.decode_field(&mut buf, site, field, record, state)
                .map_err(|e| e.at(buf.trace()))?;
        }
        Ok(())
    }

    fn decode_field(
        &self,
        buf: &mut ReadBuffer<'_>,
        site: Site,
        field: &Field,
        record: &mut Record,
        state: &mut DecodeState,
    ) -> Result<(), CodecError> {
        match field {
            Field::Simple { name, type_ref } | Field::Discriminator { name, type_ref } => {
                let v = self.read_type(buf, type_ref, state)?;
                surface(record, state, name, v);
            }
            Field::Const { name, type_ref, value } => {
                let v = self.read_type(buf, type_ref, state)?;
                if !v.matches_literal(value) {
                    return Err(CodecError::ConstMismatch {
                        field: name.clone(),
                        expected: value.to_string(),
                        actual: v.to_string(),
                    });
                }
                surface(record, state, name, v);
            }
            Field::Reserved { type_ref, expected } => {
                let v = self.read_simple(buf, type_ref, state)?;
                if !v.matches_literal(expected) {
                    return Err(CodecError::ReservedMismatch {
                        expected: expected.to_string(),
                        actual: v.to_string(),
                    });
                }
            }
            Field::Array { name, type_ref, length } => {
                let items = self.read_array(buf, type_ref, length, state)?;
                surface(record, state, name, items);
            }
            Field::Optional { name, type_ref, condition } => match condition {
                Some(condition) => {
                    if eval_bool(condition, &state.scopes)? {
                        let v = self.read_type(buf, type_ref, state)?;
                        surface(record, state, name, v);
                    }
                }
                None => {
                    let mark = buf.get_pos();
                    if mark >= state.limit(buf) {
                        return Ok(());
                    }
                    let recorded = buf.structure_mark();
                    match self.read_type(buf, type_ref, state) {
                        Ok(v) => surface(record, state, name, v),
                        Err(e) => {
                            trace!(field = %name, error = %e.root(), "optional absent, rewinding");
                            buf.reset(mark)?;
                            buf.discard_structure(recorded);
                        }
                    }
                }
            },
            Field::Virtual { name, expr } => {
                let v = eval(expr, &state.scopes)?;
                surface(record, state, name, v);
            }
            Field::Switch(switch) => {
                let observed = state.scopes.discriminators(switch)?;
                let (_, case) = dispatch::select_case(switch, &observed)?;
                let location = case.location.unwrap_or(site.location);
                let mut buf = buf.enter(location.line, location.column, format!("case {}", case.name));
                record.case = Some(case.name.clone());
                let case_site = Site {
                    location,
                    start: site.start,
                };
                self.decode_fields(&mut buf, case_site, &case.fields, record, state)?;
            }
            Field::Implicit { name, type_ref, .. } => {
                let v = self.read_simple(buf, type_ref, state)?;
                state.scopes.bind(name, v);
            }
            Field::Checksum {
                name,
                type_ref,
                algorithm,
                from_byte,
            } => {
                let start = usize::try_from((site.start / 8).saturating_add(*from_byte)).unwrap_or(usize::MAX);
                let end = (buf.get_pos() / 8) as usize;
                let expected = algorithm.compute(covered_bytes(buf.get_bytes(), start, end)?);
                let v = self.read_simple(buf, type_ref, state)?;
                let actual = v.as_u64().ok_or(CodecError::TypeMismatch {
                    expected: "uint",
                    found: v.kind(),
                })?;
                if actual != expected {
                    return Err(CodecError::ChecksumMismatch {
                        field: name.clone(),
                        expected,
                        actual,
                    });
                }
                surface(record, state, name, v);
            }
            Field::Assert {
                name,
                type_ref,
                condition,
            } => {
                let v = self.read_type(buf, type_ref, state)?;
                surface(record, state, name, v);
                if !eval_bool(condition, &state.scopes)? {
                    return Err(CodecError::AssertionFailed {
                        field: name.clone(),
                        condition: condition.to_string(),
                    });
                }
            }
            Field::Peek { name, type_ref, offset } => {
                let mark = buf.get_pos();
                let offset = match offset {
                    Some(expr) => eval_u64(expr, &state.scopes)?,
                    None => 0,
                };
                let target = mark.checked_add(offset).ok_or(CodecError::PositionOutOfRange {
                    position: u64::MAX,
                    total: buf.total_bits(),
                })?;
                buf.reset(target)?;
                let recorded = buf.structure_mark();
                let result = self.read_type(buf, type_ref, state);
                buf.reset(mark)?;
                buf.discard_structure(recorded);
                surface(record, state, name, result?);
            }
            Field::Padding { type_ref, count, .. } => {
                let n = eval_u64(count, &state.scopes)?;
                for _ in 0..n {
                    self.read_simple(buf, type_ref, state)?;
                }
            }
        }
        Ok(())
    }

    fn read_array(
        &self,
        buf: &mut ReadBuffer<'_>,
        type_ref: &TypeReference,
        length: &ArrayLength,
        state: &mut DecodeState,
    ) -> Result<Value, CodecError> {
        let mut items = Vec::new();
        match length {
            ArrayLength::Count(expr) => {
                let n = eval_u64(expr, &state.scopes)?;
                for i in 0..n {
                    items.push(self.read_item(buf, type_ref, i, state)?);
                }
            }
            ArrayLength::LengthInBytes(expr) => {
                let bits = eval_u64(expr, &state.scopes)?.saturating_mul(8);
                let end = match buf.get_pos().checked_add(bits) {
                    Some(end) if end <= state.limit(buf) => end,
                    _ => {
                        return Err(CodecError::EndOfData {
                            position: buf.get_pos(),
                            requested: bits,
                            available: state.limit(buf).saturating_sub(buf.get_pos()),
                        })
                    }
                };
                state.limits.push(end);
                let result = self.read_items_until(buf, type_ref, end, &mut items, state);
                state.limits.pop();
                result?;
                if buf.get_pos() != end {
                    return Err(CodecError::LengthMismatch(format!(
                        "array elements end at bit {}, expected {}",
                        buf.get_pos(),
                        end
                    )));
                }
            }
            ArrayLength::UntilEnd => {
                let end = state.limit(buf);
                self.read_items_until(buf, type_ref, end, &mut items, state)?;
            }
            ArrayLength::Terminated(condition) => loop {
                let item = self.read_item(buf, type_ref, items.len() as u64, state)?;
                let mut frame = IndexMap::new();
                frame.insert(LAST_ITEM.to_string(), item.clone());
                state.scopes.push(frame);
                let stop = eval_bool(condition, &state.scopes);
                state.scopes.pop();
                items.push(item);
                if stop? {
                    break;
                }
            },
        }
        Ok(collect_items(type_ref, items))
    }

    fn read_items_until(
        &self,
        buf: &mut ReadBuffer<'_>,
        type_ref: &TypeReference,
        end: u64,
        items: &mut Vec<Value>,
        state: &mut DecodeState,
    ) -> Result<(), CodecError> {
        while buf.get_pos() < end {
            let before = buf.get_pos();
            items.push(self.read_item(buf, type_ref, items.len() as u64, state)?);
            if buf.get_pos() == before {
                return Err(CodecError::LengthMismatch("array element consumed no data".to_string()));
            }
        }
        Ok(())
    }

    fn read_item(&self, buf: &mut ReadBuffer<'_>, type_ref: &TypeReference, index: u64, state: &mut DecodeState) -> Result<Value, CodecError> {
        let mut buf = buf.enter(0, 0, format!("item {}", index));
        self.read_type(&mut buf, type_ref, state)
    }

    fn read_type(&self, buf: &mut ReadBuffer<'_>, type_ref: &TypeReference, state: &mut DecodeState) -> Result<Value, CodecError> {
        match type_ref {
            TypeReference::Simple(s) => self.read_simple(buf, s, state),
            TypeReference::Complex(c) => {
                let id = Self::target(c)?;
                let args = c
                    .args
                    .iter()
                    .map(|a| eval(a, &state.scopes))
                    .collect::<Result<Vec<_>, _>>()?;
                self.decode_type(buf, id, args, state)
            }
        }
    }

    fn read_simple(&self, buf: &mut ReadBuffer<'_>, s: &SimpleTypeReference, state: &DecodeState) -> Result<Value, CodecError> {
        let order = s.byte_order.unwrap_or(buf.byte_order());
        let encoding = s.encoding.unwrap_or_default();
        Ok(match &s.kind {
            SimpleKind::Bit => Value::Bool(buf.read_bit()?),
            SimpleKind::UInt | SimpleKind::Byte => Value::UInt(buf.read_unsigned_with_order(s.bit_length, order)?),
            SimpleKind::Int => Value::Int(buf.read_signed_with_order(s.bit_length, order)?),
            SimpleKind::Float { exponent, mantissa } => {
                Value::Float(buf.read_float_with_order(true, *exponent, *mantissa, order)?)
            }
            SimpleKind::UFloat { exponent, mantissa } => {
                Value::Float(buf.read_float_with_order(false, *exponent, *mantissa, order)?)
            }
            SimpleKind::Char => Value::Char(buf.read_char(s.bit_length, encoding)?),
            SimpleKind::String => Value::String(buf.read_string(s.bit_length as u64, encoding)?),
            SimpleKind::VString(length) => {
                let bits = eval_u64(length, &state.scopes)?;
                Value::String(buf.read_string(bits, encoding)?)
            }
        })
    }

    // --- Encode ---

    fn encode_type(
        &self,
        buf: &mut WriteBuffer,
        id: TypeId,
        value: &Value,
        args: Vec<Value>,
        scopes: &mut Frames,
    ) -> Result<(), CodecError> {
        match self.definition(id)? {
            TypeDefinition::Complex(def) => self.encode_complex(buf, def, value, args, scopes),
            TypeDefinition::Enum(def) => self.encode_enum(buf, def, value),
        }
    }

    fn encode_complex(
        &self,
        buf: &mut WriteBuffer,
        def: &ComplexTypeDefinition,
        value: &Value,
        args: Vec<Value>,
        scopes: &mut Frames,
    ) -> Result<(), CodecError> {
        let location = def.location.unwrap_or_default();
        let mut buf = buf.enter(location.line, location.column, format!("type {}", def.name));
        let record = value.as_record().ok_or(CodecError::TypeMismatch {
            expected: "record",
            found: value.kind(),
        });
        let record = record.map_err(|e| e.at(buf.trace()))?;
        let mut frame = bind_params(def, args).map_err(|e| e.at(buf.trace()))?;
        for (name, v) in &record.fields {
            frame.insert(name.clone(), v.clone());
        }
        // the chosen case fixes the discriminators of every switch enclosing it
        if let Some(case_name) = record.case.as_deref() {
            let path = def
                .fields
                .iter()
                .find_map(|f| match f {
                    Field::Switch(switch) => dispatch::case_path(switch, case_name),
                    _ => None,
                })
                .unwrap_or_default();
            for (switch, case) in path {
                for (name, v) in dispatch::derive_discriminators(switch, case) {
                    frame.insert(name, v);
                }
            }
        }
        let site = Site {
            location,
            start: buf.get_pos(),
        };
        scopes.push(frame);
        let result = self.encode_fields(&mut buf, site, &def.fields, record, scopes);
        scopes.pop();
        result
    }

    fn encode_enum(&self, buf: &mut WriteBuffer, def: &EnumTypeDefinition, value: &Value) -> Result<(), CodecError> {
        let location = def.location.unwrap_or_default();
        let mut buf = buf.enter(location.line, location.column, format!("type {}", def.name));
        let raw = match value {
            Value::Enum(e) => def.value_of(&e.name),
            Value::String(name) => def.value_of(name),
            other => other.as_i128().filter(|raw| def.name_of(*raw).is_some()),
        };
        let raw = raw.ok_or_else(|| {
            CodecError::UnknownEnumValue {
                type_name: def.name.clone(),
                raw: value.as_i128().unwrap_or_default(),
            }
            .at(buf.trace())
        })?;
        let order = def.base.byte_order.unwrap_or(buf.byte_order());
        let bits = def.base.bit_length;
        let out_of_range = || CodecError::ValueOutOfRange {
            value: raw.to_string(),
            bits,
        };
        let written = match def.base.kind {
            SimpleKind::Int => i64::try_from(raw)
                .map_err(|_| out_of_range())
                .and_then(|v| buf.write_signed_with_order(bits, v, order)),
            _ => u64::try_from(raw)
                .map_err(|_| out_of_range())
                .and_then(|v| buf.write_unsigned_with_order(bits, v, order)),
        };
        written.map_err(|e| e.at(buf.trace()))
    }

    fn encode_fields(
        &self,
        buf: &mut WriteBuffer,
        site: Site,
        fields: &[Field],
        record: &Record,
        scopes: &mut Frames,
    ) -> Result<(), CodecError> {
        for field in fields {
            let mut buf = buf.enter(site.location.line, site.location.column, field.context_label());
            self.encode_field(&mut buf, site, field, record, scopes)
                .map_err(|e| e.at(buf.trace()))?;
        }
        Ok(())
    }

    fn encode_field(
        &self,
        buf: &mut WriteBuffer,
        site: Site,
        field: &Field,
        record: &Record,
        scopes: &mut Frames,
    ) -> Result<(), CodecError> {
        match field {
            Field::Simple { name, type_ref } | Field::Discriminator { name, type_ref } => {
                let v = required(scopes, name)?;
                self.write_type(buf, type_ref, &v, scopes)?;
            }
            Field::Const { name, type_ref, value } => {
                if let Some(given) = record.get(name) {
                    if !given.matches_literal(value) {
                        return Err(CodecError::ConstMismatch {
                            field: name.clone(),
                            expected: value.to_string(),
                            actual: given.to_string(),
                        });
                    }
                }
                self.write_type(buf, type_ref, &value.to_value(), scopes)?;
            }
            Field::Reserved { type_ref, expected } => {
                self.write_simple(buf, type_ref, &expected.to_value(), scopes)?;
            }
            Field::Array { name, type_ref, length } => {
                let v = required(scopes, name)?;
                self.write_array(buf, name, type_ref, length, &v, scopes)?;
            }
            Field::Optional { name, type_ref, condition } => {
                let present = match condition {
                    Some(condition) => eval_bool(condition, scopes)?,
                    None => record.get(name).is_some(),
                };
                if present {
                    let v = required(scopes, name)?;
                    self.write_type(buf, type_ref, &v, scopes)?;
                }
            }
            Field::Virtual { name, expr } => {
                let v = eval(expr, scopes)?;
                scopes.bind(name, v);
            }
            Field::Switch(switch) => {
                let on_path = record
                    .case
                    .as_deref()
                    .and_then(|n| dispatch::case_path(switch, n))
                    .and_then(|path| path.first().map(|(_, case)| *case));
                let case = match on_path {
                    Some(case) => case,
                    None => {
                        let observed = scopes.discriminators(switch)?;
                        dispatch::select_case(switch, &observed)?.1
                    }
                };
                let location = case.location.unwrap_or(site.location);
                let mut buf = buf.enter(location.line, location.column, format!("case {}", case.name));
                let case_site = Site {
                    location,
                    start: site.start,
                };
                self.encode_fields(&mut buf, case_site, &case.fields, record, scopes)?;
            }
            Field::Implicit { name, type_ref, expr } => {
                let v = eval(expr, scopes)?;
                self.write_simple(buf, type_ref, &v, scopes)?;
                scopes.bind(name, v);
            }
            Field::Checksum {
                name,
                type_ref,
                algorithm,
                from_byte,
            } => {
                let start = usize::try_from((site.start / 8).saturating_add(*from_byte)).unwrap_or(usize::MAX);
                let end = (buf.get_pos() / 8) as usize;
                let sum = algorithm.compute(covered_bytes(buf.get_bytes(), start, end)?);
                self.write_simple(buf, type_ref, &Value::UInt(sum), scopes)?;
                scopes.bind(name, Value::UInt(sum));
            }
            Field::Assert {
                name,
                type_ref,
                condition,
            } => {
                let v = required(scopes, name)?;
                if !eval_bool(condition, scopes)? {
                    return Err(CodecError::AssertionFailed {
                        field: name.clone(),
                        condition: condition.to_string(),
                    });
                }
                self.write_type(buf, type_ref, &v, scopes)?;
            }
            Field::Peek { .. } => {}
            Field::Padding { type_ref, fill, count } => {
                let n = eval_u64(count, scopes)?;
                let fill = fill.to_value();
                for _ in 0..n {
                    self.write_simple(buf, type_ref, &fill, scopes)?;
                }
            }
        }
        Ok(())
    }

    fn write_array(
        &self,
        buf: &mut WriteBuffer,
        name: &str,
        type_ref: &TypeReference,
        length: &ArrayLength,
        value: &Value,
        scopes: &mut Frames,
    ) -> Result<(), CodecError> {
        let items: Vec<Value> = match value {
            Value::List(items) => items.clone(),
            Value::Bytes(bytes) => bytes.iter().map(|b| Value::UInt(*b as u64)).collect(),
            Value::String(s) => s.bytes().map(|b| Value::UInt(b as u64)).collect(),
            other => {
                return Err(CodecError::TypeMismatch {
                    expected: "list",
                    found: other.kind(),
                })
            }
        };
        if let ArrayLength::Count(expr) = length {
            let expected = eval_u64(expr, scopes)?;
            if expected != items.len() as u64 {
                return Err(CodecError::LengthMismatch(format!(
                    "{}: count is {}, {} element(s) given",
                    name,
                    expected,
                    items.len()
                )));
            }
        }
        let start = buf.get_pos();
        for (i, item) in items.iter().enumerate() {
            let mut buf = buf.enter(0, 0, format!("item {}", i));
            self.write_type(&mut buf, type_ref, item, scopes)?;
        }
        if let ArrayLength::LengthInBytes(expr) = length {
            let expected = eval_u64(expr, scopes)?;
            let written = buf.get_pos() - start;
            if written != expected.saturating_mul(8) {
                return Err(CodecError::LengthMismatch(format!(
                    "{}: length is {} byte(s), elements take {} bit(s)",
                    name, expected, written
                )));
            }
        }
        Ok(())
    }

    fn write_type(&self, buf: &mut WriteBuffer, type_ref: &TypeReference, value: &Value, scopes: &mut Frames) -> Result<(), CodecError> {
        match type_ref {
            TypeReference::Simple(s) => self.write_simple(buf, s, value, scopes),
            TypeReference::Complex(c) => {
                let id = Self::target(c)?;
                let args = c.args.iter().map(|a| eval(a, scopes)).collect::<Result<Vec<_>, _>>()?;
                self.encode_type(buf, id, value, args, scopes)
            }
        }
    }

    fn write_simple(&self, buf: &mut WriteBuffer, s: &SimpleTypeReference, value: &Value, scopes: &Frames) -> Result<(), CodecError> {
        let order = s.byte_order.unwrap_or(buf.byte_order());
        let encoding = s.encoding.unwrap_or_default();
        match &s.kind {
            SimpleKind::Bit => buf.write_bit(value.as_bool().ok_or_else(|| mismatch("bool", value))?),
            SimpleKind::UInt | SimpleKind::Byte => {
                let n = match value {
                    Value::Int(x) if *x < 0 => {
                        return Err(CodecError::ValueOutOfRange {
                            value: x.to_string(),
                            bits: s.bit_length,
                        })
                    }
                    other => other.as_u64().ok_or_else(|| mismatch("uint", other))?,
                };
                buf.write_unsigned_with_order(s.bit_length, n, order)
            }
            SimpleKind::Int => {
                let n = match value {
                    Value::UInt(x) => i64::try_from(*x).map_err(|_| CodecError::ValueOutOfRange {
                        value: x.to_string(),
                        bits: s.bit_length,
                    })?,
                    other => other.as_i64().ok_or_else(|| mismatch("int", other))?,
                };
                buf.write_signed_with_order(s.bit_length, n, order)
            }
            SimpleKind::Float { exponent, mantissa } => {
                let x = value.as_f64().ok_or_else(|| mismatch("float", value))?;
                buf.write_float_with_order(true, *exponent, *mantissa, x, order)
            }
            SimpleKind::UFloat { exponent, mantissa } => {
                let x = value.as_f64().ok_or_else(|| mismatch("float", value))?;
                buf.write_float_with_order(false, *exponent, *mantissa, x, order)
            }
            SimpleKind::Char => buf.write_char(s.bit_length, char_of(value)?, encoding),
            SimpleKind::String => {
                let text = value.as_str().ok_or_else(|| mismatch("string", value))?;
                buf.write_string(s.bit_length as u64, text, encoding)
            }
            SimpleKind::VString(length) => {
                let text = value.as_str().ok_or_else(|| mismatch("string", value))?;
                let bits = eval_u64(length, scopes)?;
                buf.write_string(bits, text, encoding)
            }
        }
    }
}

fn bind_params(def: &ComplexTypeDefinition, args: Vec<Value>) -> Result<IndexMap<String, Value>, CodecError> {
    if args.len() != def.params.len() {
        return Err(CodecError::Expression(format!(
            "{} takes {} argument(s), {} given",
            def.name,
            def.params.len(),
            args.len()
        )));
    }
    Ok(def.params.iter().map(|p| p.name.clone()).zip(args).collect())
}

/// Binds a decoded field in scope and in the record.
fn surface(record: &mut Record, state: &mut DecodeState, name: &str, value: impl Into<Value>) {
    let value = value.into();
    state.scopes.bind(name, value.clone());
    record.set(name, value);
}

fn required(scopes: &Frames, name: &str) -> Result<Value, CodecError> {
    scopes
        .current(name)
        .cloned()
        .ok_or_else(|| CodecError::MissingField(name.to_string()))
}

fn collect_items(type_ref: &TypeReference, items: Vec<Value>) -> Value {
    let is_byte = matches!(
        type_ref,
        TypeReference::Simple(SimpleTypeReference {
            kind: SimpleKind::Byte,
            ..
        })
    );
    if is_byte {
        Value::Bytes(items.iter().filter_map(Value::as_u64).map(|b| b as u8).collect())
    } else {
        Value::List(items)
    }
}

fn mismatch(expected: &'static str, found: &Value) -> CodecError {
    CodecError::TypeMismatch {
        expected,
        found: found.kind(),
    }
}

fn char_of(value: &Value) -> Result<char, CodecError> {
    match value {
        Value::Char(c) => Ok(*c),
        Value::String(s) if s.chars().count() == 1 => s.chars().next().ok_or_else(|| mismatch("char", value)),
        other => Err(mismatch("char", other)),
    }
}
