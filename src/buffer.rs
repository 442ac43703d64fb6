//! Bit-level read and write buffers.
//!
//! Positions are absolute bit offsets; bits are taken MSB-first within each byte. Multi-byte
//! values are read as a big-endian bit stream and then reordered according to the
//! [`ByteOrder`] of the field (or the buffer default). Byte-aligned 8/16/32/64-bit accesses
//! go straight through `byteorder`.
//!
//! Both buffers carry a [`ParseTrace`] used as the named context stack. With
//! `record_structure` on, they also build a [`Structure`] of contexts and the primitives
//! read or written inside them.

use crate::error::CodecError;
use crate::structure::{bytes_text, int_text, uint_text, Structure, StructureRecorder};
use crate::trace::{ParseTrace, Traced};
use byteorder::{BigEndian, ByteOrder as _};

/// Byte order of multi-byte values, named after the layout of a 32-bit `ABCD`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ByteOrder {
    /// ABCD
    #[default]
    BigEndian,
    /// DCBA
    LittleEndian,
    /// BADC
    BigEndianByteSwap,
    /// CDAB
    LittleEndianByteSwap,
}

impl ByteOrder {
    /// Converts between wire order (as read MSB-first) and numeric order. Its own inverse.
    /// Widths that are not whole bytes (or whole words for the swap orders) are left as is.
    fn reorder(self, value: u64, bits: u32) -> u64 {
        match self {
            ByteOrder::BigEndian => value,
            ByteOrder::LittleEndian if bits % 8 == 0 => value.swap_bytes() >> (64 - bits),
            ByteOrder::BigEndianByteSwap if bits % 16 == 0 => {
                ((value & 0x00FF_00FF_00FF_00FF) << 8) | ((value >> 8) & 0x00FF_00FF_00FF_00FF)
            }
            ByteOrder::LittleEndianByteSwap if bits % 16 == 0 => {
                let words = bits / 16;
                (0..words).fold(0u64, |acc, i| {
                    let word = (value >> (16 * i)) & 0xFFFF;
                    acc | (word << (16 * (words - 1 - i)))
                })
            }
            _ => value,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TextEncoding {
    #[default]
    Utf8,
    Ascii,
    Latin1,
    Utf16Be,
    Utf16Le,
}

fn check_int_bits(what: &'static str, bits: u32) -> Result<(), CodecError> {
    if (1..=64).contains(&bits) {
        Ok(())
    } else {
        Err(CodecError::InvalidBitLength { what, bits: bits as u64 })
    }
}

fn check_float_layout(signed: bool, exponent: u32, mantissa: u32) -> Result<u32, CodecError> {
    let bits = signed as u32 + exponent + mantissa;
    if !(1..=11).contains(&exponent) || !(1..=52).contains(&mantissa) || bits > 64 {
        return Err(CodecError::InvalidBitLength { what: "float", bits: bits as u64 });
    }
    Ok(bits)
}

fn mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Exact power of two as an `f64` (0 or infinity outside the representable range).
fn pow2(exp: i32) -> f64 {
    if exp > 1023 {
        f64::INFINITY
    } else if exp >= -1022 {
        f64::from_bits(((exp + 1023) as u64) << 52)
    } else if exp >= -1074 {
        f64::from_bits(1u64 << (exp + 1074))
    } else {
        0.0
    }
}

/// Interprets `raw` as a float with the given layout: bias `2^(e-1) - 1`, implicit leading
/// one for normal numbers, all-ones exponent for infinity/NaN.
pub fn float_from_bits(raw: u64, signed: bool, exponent: u32, mantissa: u32) -> f64 {
    if signed && exponent == 11 && mantissa == 52 {
        return f64::from_bits(raw);
    }
    if signed && exponent == 8 && mantissa == 23 {
        return f32::from_bits(raw as u32) as f64;
    }
    let m = raw & mask(mantissa);
    let e = (raw >> mantissa) & mask(exponent);
    let negative = signed && (raw >> (exponent + mantissa)) & 1 == 1;
    let bias = (1i32 << (exponent - 1)) - 1;
    let magnitude = if e == mask(exponent) {
        if m == 0 {
            f64::INFINITY
        } else {
            f64::NAN
        }
    } else if e == 0 {
        m as f64 * pow2(1 - bias - mantissa as i32)
    } else {
        (1.0 + m as f64 * pow2(-(mantissa as i32))) * pow2(e as i32 - bias)
    };
    if negative {
        -magnitude
    } else {
        magnitude
    }
}

/// Round-half-to-even right shift.
fn round_shift(value: u128, shift: u32) -> u128 {
    if shift == 0 {
        return value;
    }
    if shift >= 128 {
        return 0;
    }
    let q = value >> shift;
    let rem = value & ((1u128 << shift) - 1);
    let half = 1u128 << (shift - 1);
    if rem > half || (rem == half && q & 1 == 1) {
        q + 1
    } else {
        q
    }
}

/// Encodes `value` in the given float layout, rounding to nearest even.
pub fn float_to_bits(value: f64, signed: bool, exponent: u32, mantissa: u32) -> Result<u64, CodecError> {
    let out_of_range = || CodecError::ValueOutOfRange {
        value: value.to_string(),
        bits: signed as u32 + exponent + mantissa,
    };
    if signed && exponent == 11 && mantissa == 52 {
        return Ok(value.to_bits());
    }
    if signed && exponent == 8 && mantissa == 23 {
        let narrowed = value as f32;
        if value.is_finite() && narrowed.is_infinite() {
            return Err(out_of_range());
        }
        return Ok(narrowed.to_bits() as u64);
    }
    let negative = value.is_sign_negative() && !value.is_nan();
    if negative && !signed && value != 0.0 {
        return Err(out_of_range());
    }
    let sign_bit = if signed && negative { 1u64 << (exponent + mantissa) } else { 0 };
    let e_max = mask(exponent);
    if value.is_nan() {
        return Ok((e_max << mantissa) | (1u64 << (mantissa - 1)));
    }
    if value.is_infinite() {
        return Ok(sign_bit | (e_max << mantissa));
    }
    let magnitude = value.abs();
    if magnitude == 0.0 {
        return Ok(sign_bit);
    }

    // magnitude == significand * 2^(e2 - 52), significand with its top bit at 52
    let bits = magnitude.to_bits();
    let biased64 = ((bits >> 52) & 0x7FF) as i64;
    let fraction = bits & mask(52);
    let (e2, significand) = if biased64 == 0 {
        let top = 63 - fraction.leading_zeros() as i64;
        (top - 1074, fraction << (52 - top))
    } else {
        (biased64 - 1023, fraction | (1u64 << 52))
    };

    let bias = (1i64 << (exponent - 1)) - 1;
    let biased = e2 + bias;
    let encoded = if biased >= 1 {
        let m = if mantissa >= 52 {
            (significand as u128) << (mantissa - 52)
        } else {
            round_shift(significand as u128, 52 - mantissa)
        };
        // `m` carries the implicit bit; rounding may carry into the exponent
        ((biased as u128) << mantissa) + m - (1u128 << mantissa)
    } else {
        let shift = 53 - bias - mantissa as i64 - e2;
        round_shift(significand as u128, shift.clamp(0, 128) as u32)
    };
    if encoded >> mantissa >= e_max as u128 {
        return Err(out_of_range());
    }
    Ok(sign_bit | encoded as u64)
}

/// Cursor over borrowed bytes.
#[derive(Debug, Clone)]
pub struct ReadBuffer<'a> {
    data: &'a [u8],
    pos: u64,
    byte_order: ByteOrder,
    trace: ParseTrace,
    structure: Option<StructureRecorder>,
}

impl<'a> ReadBuffer<'a> {
    pub fn new(data: &'a [u8], byte_order: ByteOrder) -> Self {
        ReadBuffer {
            data,
            pos: 0,
            byte_order,
            trace: ParseTrace::new(),
            structure: None,
        }
    }

    /// Starts building a [`Structure`] of everything read from here on.
    pub fn record_structure(&mut self) {
        self.structure = Some(StructureRecorder::default());
    }

    /// Hands back what was recorded and stops recording (empty if it was never started).
    pub fn take_structure(&mut self) -> Structure {
        self.structure.take().map(StructureRecorder::finish).unwrap_or_default()
    }

    pub fn structure_mark(&self) -> usize {
        self.structure.as_ref().map_or(0, StructureRecorder::mark)
    }

    /// Forgets what was recorded in the current context since `mark`.
    pub fn discard_structure(&mut self, mark: usize) {
        if let Some(recorder) = self.structure.as_mut() {
            recorder.discard_since(mark);
        }
    }

    fn note(&mut self, text: impl FnOnce() -> String) {
        if let Some(recorder) = self.structure.as_mut() {
            recorder.value(text());
        }
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn get_pos(&self) -> u64 {
        self.pos
    }

    pub fn get_bytes(&self) -> &'a [u8] {
        self.data
    }

    pub fn total_bits(&self) -> u64 {
        self.data.len() as u64 * 8
    }

    pub fn remaining_bits(&self) -> u64 {
        self.total_bits().saturating_sub(self.pos)
    }

    pub fn has_more(&self, bits: u64) -> bool {
        self.remaining_bits() >= bits
    }

    pub fn is_aligned(&self) -> bool {
        self.pos % 8 == 0
    }

    /// Moves the cursor; any position up to the end of the data is valid.
    pub fn reset(&mut self, pos: u64) -> Result<(), CodecError> {
        if pos > self.total_bits() {
            return Err(CodecError::PositionOutOfRange {
                position: pos,
                total: self.total_bits(),
            });
        }
        self.pos = pos;
        Ok(())
    }

    /// Skips to the next byte boundary.
    pub fn align(&mut self) -> Result<(), CodecError> {
        let aligned = self.pos.div_ceil(8) * 8;
        self.reset(aligned)
    }

    pub fn push_context(&mut self, context: impl Into<String>) {
        let pos = self.pos;
        self.trace.push_at(0, 0, context, pos);
        self.context_opened();
    }

    /// Pops the innermost context, which must be `context`.
    pub fn pop_context(&mut self, context: &str) -> Result<(), CodecError> {
        match self.trace.top() {
            Some(top) if top.context == context => {
                self.context_closed();
                self.trace.pop();
                Ok(())
            }
            top => Err(CodecError::ContextMismatch {
                expected: context.to_string(),
                found: top.map(|t| t.context.clone()).unwrap_or_else(|| "<empty>".to_string()),
            }),
        }
    }

    fn ensure(&self, bits: u64) -> Result<(), CodecError> {
        if self.has_more(bits) {
            Ok(())
        } else {
            Err(CodecError::EndOfData {
                position: self.pos,
                requested: bits,
                available: self.remaining_bits(),
            })
        }
    }

    /// Next `bits` (1..=64) as a big-endian number.
    fn take_bits(&mut self, bits: u32) -> Result<u64, CodecError> {
        self.ensure(bits as u64)?;
        let start = (self.pos / 8) as usize;
        if self.is_aligned() {
            let fast = match bits {
                8 => Some(self.data[start] as u64),
                16 => Some(BigEndian::read_u16(&self.data[start..]) as u64),
                32 => Some(BigEndian::read_u32(&self.data[start..]) as u64),
                64 => Some(BigEndian::read_u64(&self.data[start..])),
                _ => None,
            };
            if let Some(v) = fast {
                self.pos += bits as u64;
                return Ok(v);
            }
        }
        let mut out = 0u64;
        let mut remaining = bits;
        while remaining > 0 {
            let byte = self.data[(self.pos / 8) as usize];
            let available = 8 - (self.pos % 8) as u32;
            let n = available.min(remaining);
            let chunk = (byte >> (available - n)) & (mask(n) as u8);
            out = (out << n) | chunk as u64;
            self.pos += n as u64;
            remaining -= n;
        }
        Ok(out)
    }

    /// Checked read of `bits` in numeric order.
    fn take_ordered(&mut self, what: &'static str, bits: u32, order: ByteOrder) -> Result<u64, CodecError> {
        check_int_bits(what, bits)?;
        Ok(order.reorder(self.take_bits(bits)?, bits))
    }

    fn take_bytes(&mut self, n: usize) -> Result<Vec<u8>, CodecError> {
        let bits = (n as u64).saturating_mul(8);
        self.ensure(bits)?;
        if self.is_aligned() {
            let start = (self.pos / 8) as usize;
            self.pos += bits;
            return Ok(self.data[start..start + n].to_vec());
        }
        (0..n).map(|_| self.take_bits(8).map(|b| b as u8)).collect()
    }

    pub fn read_bit(&mut self) -> Result<bool, CodecError> {
        let bit = self.take_bits(1)? == 1;
        self.note(|| bit.to_string());
        Ok(bit)
    }

    pub fn read_unsigned(&mut self, bits: u32) -> Result<u64, CodecError> {
        self.read_unsigned_with_order(bits, self.byte_order)
    }

    pub fn read_unsigned_with_order(&mut self, bits: u32, order: ByteOrder) -> Result<u64, CodecError> {
        let value = self.take_ordered("unsigned integer", bits, order)?;
        self.note(|| uint_text(bits, value));
        Ok(value)
    }

    pub fn read_signed(&mut self, bits: u32) -> Result<i64, CodecError> {
        self.read_signed_with_order(bits, self.byte_order)
    }

    pub fn read_signed_with_order(&mut self, bits: u32, order: ByteOrder) -> Result<i64, CodecError> {
        let raw = self.take_ordered("signed integer", bits, order)?;
        let value = if bits < 64 && (raw >> (bits - 1)) & 1 == 1 {
            (raw | !mask(bits)) as i64
        } else {
            raw as i64
        };
        self.note(|| int_text(bits, raw, value));
        Ok(value)
    }

    pub fn read_float(&mut self, signed: bool, exponent: u32, mantissa: u32) -> Result<f64, CodecError> {
        self.read_float_with_order(signed, exponent, mantissa, self.byte_order)
    }

    pub fn read_float_with_order(
        &mut self,
        signed: bool,
        exponent: u32,
        mantissa: u32,
        order: ByteOrder,
    ) -> Result<f64, CodecError> {
        let bits = check_float_layout(signed, exponent, mantissa)?;
        let raw = order.reorder(self.take_bits(bits)?, bits);
        let value = float_from_bits(raw, signed, exponent, mantissa);
        self.note(|| value.to_string());
        Ok(value)
    }

    pub fn read_f32(&mut self) -> Result<f32, CodecError> {
        let value = f32::from_bits(self.take_ordered("float", 32, self.byte_order)? as u32);
        self.note(|| value.to_string());
        Ok(value)
    }

    pub fn read_f64(&mut self) -> Result<f64, CodecError> {
        let value = f64::from_bits(self.take_ordered("float", 64, self.byte_order)?);
        self.note(|| value.to_string());
        Ok(value)
    }

    pub fn read_byte_array(&mut self, n: usize) -> Result<Vec<u8>, CodecError> {
        let bytes = self.take_bytes(n)?;
        self.note(|| bytes_text(&bytes));
        Ok(bytes)
    }

    /// Fixed-width string of `bits` bits, trimmed at the first NUL.
    pub fn read_string(&mut self, bits: u64, encoding: TextEncoding) -> Result<String, CodecError> {
        if bits % 8 != 0 {
            return Err(CodecError::InvalidBitLength { what: "string", bits });
        }
        let bytes = self.take_bytes((bits / 8) as usize)?;
        let text = decode_text(&bytes, encoding)?;
        self.note(|| format!("{:?}", text));
        Ok(text)
    }

    pub fn read_char(&mut self, bits: u32, encoding: TextEncoding) -> Result<char, CodecError> {
        if bits != 8 && bits != 16 {
            return Err(CodecError::InvalidBitLength { what: "char", bits: bits as u64 });
        }
        let order = match encoding {
            TextEncoding::Utf16Le => ByteOrder::LittleEndian,
            _ => ByteOrder::BigEndian,
        };
        let code = self.take_ordered("char", bits, order)?;
        let c = char_from_code(code, encoding)?;
        self.note(|| format!("{:?}", c));
        Ok(c)
    }
}

impl Traced for ReadBuffer<'_> {
    fn trace(&self) -> &ParseTrace {
        &self.trace
    }

    fn trace_mut(&mut self) -> &mut ParseTrace {
        &mut self.trace
    }

    fn bit_position(&self) -> u64 {
        self.pos
    }

    fn context_opened(&mut self) {
        if let (Some(recorder), Some(top)) = (self.structure.as_mut(), self.trace.top()) {
            recorder.open(&top.context);
        }
    }

    fn context_closed(&mut self) {
        if let Some(recorder) = self.structure.as_mut() {
            recorder.close();
        }
    }
}

/// Growing output buffer; writes may be repositioned with [`WriteBuffer::reset`].
#[derive(Debug, Clone, Default)]
pub struct WriteBuffer {
    data: Vec<u8>,
    pos: u64,
    byte_order: ByteOrder,
    trace: ParseTrace,
    structure: Option<StructureRecorder>,
}

impl WriteBuffer {
    pub fn new(byte_order: ByteOrder) -> Self {
        WriteBuffer {
            byte_order,
            ..Default::default()
        }
    }

    /// Starts building a [`Structure`] of everything written from here on.
    pub fn record_structure(&mut self) {
        self.structure = Some(StructureRecorder::default());
    }

    pub fn take_structure(&mut self) -> Structure {
        self.structure.take().map(StructureRecorder::finish).unwrap_or_default()
    }

    pub fn structure_mark(&self) -> usize {
        self.structure.as_ref().map_or(0, StructureRecorder::mark)
    }

    pub fn discard_structure(&mut self, mark: usize) {
        if let Some(recorder) = self.structure.as_mut() {
            recorder.discard_since(mark);
        }
    }

    fn note(&mut self, text: impl FnOnce() -> String) {
        if let Some(recorder) = self.structure.as_mut() {
            recorder.value(text());
        }
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn get_pos(&self) -> u64 {
        self.pos
    }

    pub fn get_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn is_aligned(&self) -> bool {
        self.pos % 8 == 0
    }

    /// Moves the cursor within what has been written so far.
    pub fn reset(&mut self, pos: u64) -> Result<(), CodecError> {
        let total = self.data.len() as u64 * 8;
        if pos > total {
            return Err(CodecError::PositionOutOfRange { position: pos, total });
        }
        self.pos = pos;
        Ok(())
    }

    /// Zero-fills to the next byte boundary.
    pub fn align(&mut self) -> Result<(), CodecError> {
        let pad = (8 - (self.pos % 8) as u32) % 8;
        if pad > 0 {
            self.put_bits(pad, 0);
        }
        Ok(())
    }

    pub fn push_context(&mut self, context: impl Into<String>) {
        let pos = self.pos;
        self.trace.push_at(0, 0, context, pos);
        self.context_opened();
    }

    pub fn pop_context(&mut self, context: &str) -> Result<(), CodecError> {
        match self.trace.top() {
            Some(top) if top.context == context => {
                self.context_closed();
                self.trace.pop();
                Ok(())
            }
            top => Err(CodecError::ContextMismatch {
                expected: context.to_string(),
                found: top.map(|t| t.context.clone()).unwrap_or_else(|| "<empty>".to_string()),
            }),
        }
    }

    /// Writes the low `bits` of `value` MSB-first; callers have range-checked it.
    fn put_bits(&mut self, bits: u32, value: u64) {
        let end = self.pos + bits as u64;
        let needed = end.div_ceil(8) as usize;
        if self.data.len() < needed {
            self.data.resize(needed, 0);
        }
        if self.is_aligned() && matches!(bits, 8 | 16 | 32 | 64) {
            let start = (self.pos / 8) as usize;
            match bits {
                8 => self.data[start] = value as u8,
                16 => BigEndian::write_u16(&mut self.data[start..], value as u16),
                32 => BigEndian::write_u32(&mut self.data[start..], value as u32),
                _ => BigEndian::write_u64(&mut self.data[start..], value),
            }
            self.pos = end;
            return;
        }
        let mut remaining = bits;
        while remaining > 0 {
            let index = (self.pos / 8) as usize;
            let available = 8 - (self.pos % 8) as u32;
            let n = available.min(remaining);
            let chunk = ((value >> (remaining - n)) & mask(n)) as u8;
            let shift = available - n;
            let field_mask = (mask(n) as u8) << shift;
            self.data[index] = (self.data[index] & !field_mask) | (chunk << shift);
            self.pos += n as u64;
            remaining -= n;
        }
    }

    pub fn write_bit(&mut self, bit: bool) -> Result<(), CodecError> {
        self.put_bits(1, bit as u64);
        self.note(|| bit.to_string());
        Ok(())
    }

    pub fn write_unsigned(&mut self, bits: u32, value: u64) -> Result<(), CodecError> {
        self.write_unsigned_with_order(bits, value, self.byte_order)
    }

    pub fn write_unsigned_with_order(&mut self, bits: u32, value: u64, order: ByteOrder) -> Result<(), CodecError> {
        check_int_bits("unsigned integer", bits)?;
        if value & !mask(bits) != 0 {
            return Err(CodecError::ValueOutOfRange {
                value: value.to_string(),
                bits,
            });
        }
        self.put_bits(bits, order.reorder(value, bits));
        self.note(|| uint_text(bits, value));
        Ok(())
    }

    pub fn write_signed(&mut self, bits: u32, value: i64) -> Result<(), CodecError> {
        self.write_signed_with_order(bits, value, self.byte_order)
    }

    pub fn write_signed_with_order(&mut self, bits: u32, value: i64, order: ByteOrder) -> Result<(), CodecError> {
        check_int_bits("signed integer", bits)?;
        let (min, max) = if bits == 64 {
            (i64::MIN, i64::MAX)
        } else {
            (-(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1)
        };
        if value < min || value > max {
            return Err(CodecError::ValueOutOfRange {
                value: value.to_string(),
                bits,
            });
        }
        let raw = value as u64 & mask(bits);
        self.put_bits(bits, order.reorder(raw, bits));
        self.note(|| int_text(bits, raw, value));
        Ok(())
    }

    pub fn write_float(&mut self, signed: bool, exponent: u32, mantissa: u32, value: f64) -> Result<(), CodecError> {
        self.write_float_with_order(signed, exponent, mantissa, value, self.byte_order)
    }

    pub fn write_float_with_order(
        &mut self,
        signed: bool,
        exponent: u32,
        mantissa: u32,
        value: f64,
        order: ByteOrder,
    ) -> Result<(), CodecError> {
        let bits = check_float_layout(signed, exponent, mantissa)?;
        let raw = float_to_bits(value, signed, exponent, mantissa)?;
        self.put_bits(bits, order.reorder(raw, bits));
        self.note(|| value.to_string());
        Ok(())
    }

    pub fn write_f32(&mut self, value: f32) -> Result<(), CodecError> {
        self.put_bits(32, self.byte_order.reorder(value.to_bits() as u64, 32));
        self.note(|| value.to_string());
        Ok(())
    }

    pub fn write_f64(&mut self, value: f64) -> Result<(), CodecError> {
        self.put_bits(64, self.byte_order.reorder(value.to_bits(), 64));
        self.note(|| value.to_string());
        Ok(())
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.put_bits(8, *b as u64);
        }
    }

    pub fn write_byte_array(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        self.put_bytes(bytes);
        self.note(|| bytes_text(bytes));
        Ok(())
    }

    /// Fixed-width string, NUL-padded to `bits`.
    pub fn write_string(&mut self, bits: u64, value: &str, encoding: TextEncoding) -> Result<(), CodecError> {
        if bits % 8 != 0 {
            return Err(CodecError::InvalidBitLength { what: "string", bits });
        }
        let mut bytes = encode_text(value, encoding)?;
        let width = (bits / 8) as usize;
        if bytes.len() > width {
            return Err(CodecError::ValueOutOfRange {
                value: format!("{:?}", value),
                bits: bits as u32,
            });
        }
        bytes.resize(width, 0);
        self.put_bytes(&bytes);
        self.note(|| format!("{:?}", value));
        Ok(())
    }

    pub fn write_char(&mut self, bits: u32, value: char, encoding: TextEncoding) -> Result<(), CodecError> {
        if bits != 8 && bits != 16 {
            return Err(CodecError::InvalidBitLength { what: "char", bits: bits as u64 });
        }
        let code = value as u64;
        let limit = match encoding {
            TextEncoding::Ascii => 0x7F,
            _ => mask(bits),
        };
        if code > limit {
            return Err(CodecError::TextEncoding(format!("{:?} does not fit a {}-bit {:?} char", value, bits, encoding)));
        }
        let order = match encoding {
            TextEncoding::Utf16Le => ByteOrder::LittleEndian,
            _ => ByteOrder::BigEndian,
        };
        self.put_bits(bits, order.reorder(code, bits));
        self.note(|| format!("{:?}", value));
        Ok(())
    }
}

impl Traced for WriteBuffer {
    fn trace(&self) -> &ParseTrace {
        &self.trace
    }

    fn trace_mut(&mut self) -> &mut ParseTrace {
        &mut self.trace
    }

    fn bit_position(&self) -> u64 {
        self.pos
    }

    fn context_opened(&mut self) {
        if let (Some(recorder), Some(top)) = (self.structure.as_mut(), self.trace.top()) {
            recorder.open(&top.context);
        }
    }

    fn context_closed(&mut self) {
        if let Some(recorder) = self.structure.as_mut() {
            recorder.close();
        }
    }
}

fn char_from_code(code: u64, encoding: TextEncoding) -> Result<char, CodecError> {
    if encoding == TextEncoding::Ascii && code > 0x7F {
        return Err(CodecError::TextEncoding(format!("{:#x} is not ASCII", code)));
    }
    u32::try_from(code)
        .ok()
        .and_then(char::from_u32)
        .ok_or_else(|| CodecError::TextEncoding(format!("{:#x} is not a character", code)))
}

fn decode_text(bytes: &[u8], encoding: TextEncoding) -> Result<String, CodecError> {
    match encoding {
        TextEncoding::Utf8 | TextEncoding::Ascii => {
            let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
            let text = &bytes[..end];
            if encoding == TextEncoding::Ascii && !text.is_ascii() {
                return Err(CodecError::TextEncoding("non-ASCII byte in ASCII string".to_string()));
            }
            String::from_utf8(text.to_vec()).map_err(|e| CodecError::TextEncoding(e.to_string()))
        }
        TextEncoding::Latin1 => Ok(bytes.iter().take_while(|b| **b != 0).map(|b| *b as char).collect()),
        TextEncoding::Utf16Be | TextEncoding::Utf16Le => {
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|c| match encoding {
                    TextEncoding::Utf16Le => u16::from_le_bytes([c[0], c[1]]),
                    _ => u16::from_be_bytes([c[0], c[1]]),
                })
                .take_while(|u| *u != 0)
                .collect();
            String::from_utf16(&units).map_err(|e| CodecError::TextEncoding(e.to_string()))
        }
    }
}

fn encode_text(value: &str, encoding: TextEncoding) -> Result<Vec<u8>, CodecError> {
    match encoding {
        TextEncoding::Utf8 => Ok(value.as_bytes().to_vec()),
        TextEncoding::Ascii if value.is_ascii() => Ok(value.as_bytes().to_vec()),
        TextEncoding::Ascii => Err(CodecError::TextEncoding(format!("{:?} is not ASCII", value))),
        TextEncoding::Latin1 => value
            .chars()
            .map(|c| {
                u8::try_from(c as u32).map_err(|_| CodecError::TextEncoding(format!("{:?} is not Latin-1", c)))
            })
            .collect(),
        TextEncoding::Utf16Be => Ok(value.encode_utf16().flat_map(u16::to_be_bytes).collect()),
        TextEncoding::Utf16Le => Ok(value.encode_utf16().flat_map(u16::to_le_bytes).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_are_msb_first() {
        let data = [0b1010_0000, 0xFF];
        let mut r = ReadBuffer::new(&data, ByteOrder::BigEndian);
        assert!(r.read_bit().unwrap());
        assert!(!r.read_bit().unwrap());
        assert_eq!(r.read_unsigned(2).unwrap(), 0b10);
        assert_eq!(r.read_unsigned(8).unwrap(), 0x0F);
        assert_eq!(r.get_pos(), 12);
        assert_eq!(r.remaining_bits(), 4);
        assert!(matches!(
            r.read_unsigned(5),
            Err(CodecError::EndOfData { position: 12, requested: 5, available: 4 })
        ));
        assert_eq!(r.get_pos(), 12);
    }

    #[test]
    fn unsigned_range_is_enforced() {
        for bits in [1u32, 3, 7, 8, 13, 16, 31, 32, 63] {
            let mut w = WriteBuffer::new(ByteOrder::BigEndian);
            assert!(w.write_unsigned(bits, (1u64 << bits) - 1).is_ok(), "{} bits", bits);
            assert!(
                matches!(w.write_unsigned(bits, 1u64 << bits), Err(CodecError::ValueOutOfRange { .. })),
                "{} bits",
                bits
            );
        }
        let mut w = WriteBuffer::new(ByteOrder::BigEndian);
        assert!(w.write_unsigned(64, u64::MAX).is_ok());
        assert!(matches!(w.write_unsigned(0, 0), Err(CodecError::InvalidBitLength { .. })));
        assert!(matches!(w.write_unsigned(65, 0), Err(CodecError::InvalidBitLength { .. })));
    }

    #[test]
    fn signed_values_sign_extend() {
        let mut w = WriteBuffer::new(ByteOrder::BigEndian);
        w.write_signed(4, -3).unwrap();
        w.write_signed(12, 2047).unwrap();
        assert!(w.write_signed(4, 8).is_err());
        assert!(w.write_signed(4, -9).is_err());
        let bytes = w.into_bytes();
        let mut r = ReadBuffer::new(&bytes, ByteOrder::BigEndian);
        assert_eq!(r.read_signed(4).unwrap(), -3);
        assert_eq!(r.read_signed(12).unwrap(), 2047);
    }

    #[test]
    fn byte_orders() {
        let data = [0xAA, 0xBB, 0xCC, 0xDD];
        let read = |order| ReadBuffer::new(&data, order).read_unsigned(32).unwrap();
        assert_eq!(read(ByteOrder::BigEndian), 0xAABBCCDD);
        assert_eq!(read(ByteOrder::LittleEndian), 0xDDCCBBAA);
        assert_eq!(read(ByteOrder::BigEndianByteSwap), 0xBBAADDCC);
        assert_eq!(read(ByteOrder::LittleEndianByteSwap), 0xCCDDAABB);

        for order in [
            ByteOrder::LittleEndian,
            ByteOrder::BigEndianByteSwap,
            ByteOrder::LittleEndianByteSwap,
        ] {
            let mut w = WriteBuffer::new(order);
            w.write_unsigned(32, read(order)).unwrap();
            assert_eq!(w.into_bytes(), data);
        }

        let mut r = ReadBuffer::new(&data, ByteOrder::LittleEndian);
        assert_eq!(r.read_unsigned(24).unwrap(), 0xCCBBAA);
    }

    #[test]
    fn half_precision_float() {
        let mut w = WriteBuffer::new(ByteOrder::BigEndian);
        w.write_float(true, 5, 10, 1.5).unwrap();
        w.write_float(true, 5, 10, -2.0).unwrap();
        w.write_float(true, 5, 10, f64::INFINITY).unwrap();
        assert!(w.write_float(true, 5, 10, 70000.0).is_err());
        let bytes = w.into_bytes();
        assert_eq!(bytes, [0x3E, 0x00, 0xC0, 0x00, 0x7C, 0x00]);
        let mut r = ReadBuffer::new(&bytes, ByteOrder::BigEndian);
        assert_eq!(r.read_float(true, 5, 10).unwrap(), 1.5);
        assert_eq!(r.read_float(true, 5, 10).unwrap(), -2.0);
        assert_eq!(r.read_float(true, 5, 10).unwrap(), f64::INFINITY);
    }

    #[test]
    fn half_precision_subnormals_and_nan() {
        // smallest subnormal 2^-24, largest subnormal (1023/1024) * 2^-14
        assert_eq!(float_from_bits(0x0001, true, 5, 10), 2f64.powi(-24));
        assert_eq!(float_to_bits(2f64.powi(-24), true, 5, 10).unwrap(), 0x0001);
        assert_eq!(float_to_bits(1023.0 / 1024.0 * 2f64.powi(-14), true, 5, 10).unwrap(), 0x03FF);
        assert_eq!(float_to_bits(2f64.powi(-14), true, 5, 10).unwrap(), 0x0400);
        assert!(float_from_bits(0x7E00, true, 5, 10).is_nan());
        assert!(float_from_bits(float_to_bits(f64::NAN, true, 5, 10).unwrap(), true, 5, 10).is_nan());
        assert_eq!(float_to_bits(-0.0, true, 5, 10).unwrap(), 0x8000);
    }

    #[test]
    fn ieee_widths_use_native_layout() {
        let mut w = WriteBuffer::new(ByteOrder::BigEndian);
        w.write_f32(0.1).unwrap();
        w.write_float(true, 11, 52, 0.1).unwrap();
        w.write_float(false, 4, 4, 3.0).unwrap();
        let bytes = w.into_bytes();
        assert_eq!(&bytes[..4], &0.1f32.to_be_bytes());
        let mut r = ReadBuffer::new(&bytes, ByteOrder::BigEndian);
        assert_eq!(r.read_f32().unwrap(), 0.1f32);
        assert_eq!(r.read_f64().unwrap(), 0.1);
        assert_eq!(r.read_float(false, 4, 4).unwrap(), 3.0);
        assert!(WriteBuffer::new(ByteOrder::BigEndian).write_float(false, 4, 4, -1.0).is_err());
    }

    #[test]
    fn reset_rewinds_without_residue() {
        let data = [0x12, 0x34, 0x56];
        let mut r = ReadBuffer::new(&data, ByteOrder::BigEndian);
        r.read_unsigned(4).unwrap();
        let mark = r.get_pos();
        let first = r.read_unsigned(12).unwrap();
        r.reset(mark).unwrap();
        assert_eq!(r.read_unsigned(12).unwrap(), first);
        assert!(matches!(r.reset(25), Err(CodecError::PositionOutOfRange { .. })));
        r.reset(24).unwrap();
        assert!(!r.has_more(1));
    }

    #[test]
    fn unaligned_writes_overlay_bits() {
        let mut w = WriteBuffer::new(ByteOrder::BigEndian);
        w.write_bit(true).unwrap();
        w.write_unsigned(7, 0x05).unwrap();
        w.write_unsigned(3, 0b101).unwrap();
        w.align().unwrap();
        w.write_byte_array(&[0xEE]).unwrap();
        assert_eq!(w.get_bytes(), &[0x85, 0xA0, 0xEE]);
        w.reset(8).unwrap();
        w.write_unsigned(8, 0x11).unwrap();
        assert_eq!(w.into_bytes(), vec![0x85, 0x11, 0xEE]);
    }

    #[test]
    fn strings_and_chars() {
        let mut w = WriteBuffer::new(ByteOrder::BigEndian);
        w.write_string(64, "abc", TextEncoding::Utf8).unwrap();
        w.write_string(32, "\u{e9}", TextEncoding::Utf16Le).unwrap();
        w.write_char(8, 'Z', TextEncoding::Ascii).unwrap();
        assert!(w.write_string(16, "abc", TextEncoding::Utf8).is_err());
        assert!(w.write_string(8, "\u{e9}", TextEncoding::Ascii).is_err());
        let bytes = w.into_bytes();
        assert_eq!(&bytes[..8], b"abc\0\0\0\0\0");
        let mut r = ReadBuffer::new(&bytes, ByteOrder::BigEndian);
        assert_eq!(r.read_string(64, TextEncoding::Utf8).unwrap(), "abc");
        assert_eq!(r.read_string(32, TextEncoding::Utf16Le).unwrap(), "\u{e9}");
        assert_eq!(r.read_char(8, TextEncoding::Ascii).unwrap(), 'Z');
        assert!(matches!(
            ReadBuffer::new(&[0xFF], ByteOrder::BigEndian).read_string(8, TextEncoding::Ascii),
            Err(CodecError::TextEncoding(_))
        ));
    }

    #[test]
    fn oversized_reads_fail_with_end_of_data() {
        let data = [0u8; 4];
        let mut r = ReadBuffer::new(&data, ByteOrder::BigEndian);
        assert!(matches!(
            r.read_byte_array(usize::MAX / 2),
            Err(CodecError::EndOfData { position: 0, available: 32, .. })
        ));
        assert!(matches!(r.read_string(u64::MAX - 7, TextEncoding::Utf8), Err(CodecError::EndOfData { .. })));
        assert_eq!(r.get_pos(), 0);
        assert_eq!(r.read_byte_array(4).unwrap(), vec![0; 4]);
    }

    #[test]
    fn recorded_structure_matches_between_read_and_write() {
        let mut w = WriteBuffer::new(ByteOrder::BigEndian);
        w.record_structure();
        {
            let mut g = w.enter(0, 0, "type Sample");
            g.write_bit(true).unwrap();
            g.write_signed(7, -2).unwrap();
            g.push_context("field name");
            g.write_string(24, "ab", TextEncoding::Ascii).unwrap();
            g.pop_context("field name").unwrap();
            g.write_char(8, 'x', TextEncoding::Utf8).unwrap();
        }
        let written = w.take_structure();
        let bytes = w.into_bytes();

        let mut r = ReadBuffer::new(&bytes, ByteOrder::BigEndian);
        r.record_structure();
        {
            let mut g = r.enter(0, 0, "type Sample");
            assert!(g.read_bit().unwrap());
            assert_eq!(g.read_signed(7).unwrap(), -2);
            g.push_context("field name");
            assert_eq!(g.read_string(24, TextEncoding::Ascii).unwrap(), "ab");
            g.pop_context("field name").unwrap();
            assert_eq!(g.read_char(8, TextEncoding::Utf8).unwrap(), 'x');
        }
        let read = r.take_structure();
        assert_eq!(read, written);

        let root = read.root().unwrap();
        assert_eq!(root.name, "type Sample");
        assert_eq!(root.values(), vec!["true", "0x7e -2", "'x'"]);
        assert_eq!(root.child("field name").map(|n| n.values()), Some(vec!["\"ab\""]));
        assert!(r.take_structure().items.is_empty());
    }

    #[test]
    fn discarded_reads_leave_no_trace_in_the_structure() {
        let data = [0x01, 0x02];
        let mut r = ReadBuffer::new(&data, ByteOrder::BigEndian);
        r.record_structure();
        r.push_context("type T");
        r.read_unsigned(8).unwrap();
        let mark = r.structure_mark();
        r.read_unsigned(8).unwrap();
        r.discard_structure(mark);
        r.pop_context("type T").unwrap();
        let structure = r.take_structure();
        assert_eq!(structure.root().map(|n| n.values()), Some(vec!["0x01 1"]));
    }

    #[test]
    fn context_stack() {
        let data = [0u8; 2];
        let mut r = ReadBuffer::new(&data, ByteOrder::BigEndian);
        r.push_context("header");
        r.read_unsigned(8).unwrap();
        r.push_context("body");
        assert_eq!(r.trace().frames()[1].bit_offset, 8);
        assert!(matches!(r.pop_context("header"), Err(CodecError::ContextMismatch { .. })));
        r.pop_context("body").unwrap();
        r.pop_context("header").unwrap();
        assert!(r.trace().is_empty());
        {
            let mut g = r.enter(1, 1, "scoped");
            g.read_unsigned(4).unwrap();
            assert_eq!(g.trace().depth(), 1);
        }
        assert!(r.trace().is_empty());
    }
}
