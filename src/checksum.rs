//! Checksum algorithms for checksum fields.

use crate::error::CodecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    /// Arithmetic sum of the bytes, modulo 256 (M-Bus, many serial framings).
    Sum8,
    /// Bitwise XOR of the bytes.
    Xor8,
    /// CRC-16 with the reflected polynomial 0xA001 and initial value 0xFFFF (Modbus RTU).
    Crc16Modbus,
}

impl ChecksumAlgorithm {
    pub fn compute(self, bytes: &[u8]) -> u64 {
        match self {
            ChecksumAlgorithm::Sum8 => sum8(bytes) as u64,
            ChecksumAlgorithm::Xor8 => xor8(bytes) as u64,
            ChecksumAlgorithm::Crc16Modbus => crc16_modbus(bytes) as u64,
        }
    }
}

pub fn sum8(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

pub fn xor8(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

pub fn crc16_modbus(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for b in bytes {
        crc ^= *b as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Bytes `[start, end)` of `data`, or `EndOfData` when the range does not fit.
pub fn covered_bytes(data: &[u8], start: usize, end: usize) -> Result<&[u8], CodecError> {
    if start > end || end > data.len() {
        return Err(CodecError::EndOfData {
            position: (start as u64).saturating_mul(8),
            requested: (end.saturating_sub(start) as u64).saturating_mul(8),
            available: (data.len().saturating_sub(start) as u64).saturating_mul(8),
        });
    }
    Ok(&data[start..end])
}
