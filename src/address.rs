//! CANopen SDO tag addresses: `SDO:<node>:<index>/<subIndex>:<DATATYPE>[<count>]`.
//!
//! Numbers are decimal or `0x` hex. The `(index, subIndex)` pair is the discriminator tuple
//! used to select the object-dictionary entry type.

use crate::value::Value;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

static SDO_ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^SDO:(?P<node>0[xX][0-9a-fA-F]+|\d+):(?P<index>0[xX][0-9a-fA-F]+|\d+)/(?P<sub>0[xX][0-9a-fA-F]+|\d+):(?P<type>[A-Za-z_][A-Za-z0-9_]*)(?:\[(?P<count>\d+)\])?$",
    )
    .expect("SDO address pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("Not an SDO address: {0}")]
    Syntax(String),
    #[error("{what} {value} out of range")]
    OutOfRange { what: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdoAddress {
    pub node: u8,
    pub index: u16,
    pub sub_index: u8,
    pub data_type: String,
    pub count: Option<u32>,
}

impl SdoAddress {
    pub fn parse(address: &str) -> Result<Self, AddressError> {
        let caps = SDO_ADDRESS
            .captures(address.trim())
            .ok_or_else(|| AddressError::Syntax(address.to_string()))?;
        let node = number(&caps["node"], "node")?;
        let index = number(&caps["index"], "index")?;
        let sub_index = number(&caps["sub"], "sub-index")?;
        let count = match caps.name("count") {
            Some(m) => Some(number(m.as_str(), "count")?),
            None => None,
        };
        Ok(SdoAddress {
            node,
            index,
            sub_index,
            data_type: caps["type"].to_string(),
            count,
        })
    }

    /// `(index, subIndex)` as discriminator values.
    pub fn discriminators(&self) -> [Value; 2] {
        [Value::UInt(self.index as u64), Value::UInt(self.sub_index as u64)]
    }
}

impl fmt::Display for SdoAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SDO:{}:{:#x}/{:#x}:{}", self.node, self.index, self.sub_index, self.data_type)?;
        if let Some(count) = self.count {
            write!(f, "[{}]", count)?;
        }
        Ok(())
    }
}

fn number<T: TryFrom<u64>>(text: &str, what: &'static str) -> Result<T, AddressError> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse::<u64>(),
    };
    parsed
        .ok()
        .and_then(|v| T::try_from(v).ok())
        .ok_or_else(|| AddressError::OutOfRange {
            what,
            value: text.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_record_address() {
        let a = SdoAddress::parse("SDO:20:0x10/0xAA:RECORD").unwrap();
        assert_eq!(a.node, 20);
        assert_eq!(a.index, 0x10);
        assert_eq!(a.sub_index, 0xAA);
        assert_eq!(a.data_type, "RECORD");
        assert_eq!(a.count, None);
        assert_eq!(a.discriminators(), [Value::UInt(0x10), Value::UInt(0xAA)]);
        assert_eq!(a.to_string(), "SDO:20:0x10/0xaa:RECORD");
    }

    #[test]
    fn decimal_numbers_and_count() {
        let a = SdoAddress::parse("SDO:1:4096/2:UNSIGNED8[4]").unwrap();
        assert_eq!((a.index, a.sub_index, a.count), (0x1000, 2, Some(4)));
    }

    #[test]
    fn rejects_malformed_and_oversized() {
        assert!(matches!(SdoAddress::parse("SDO:20:0x10:RECORD"), Err(AddressError::Syntax(_))));
        assert!(matches!(SdoAddress::parse("PDO:20:0x10/0x1:RECORD"), Err(AddressError::Syntax(_))));
        assert!(matches!(
            SdoAddress::parse("SDO:300:0x10/0x1:RECORD"),
            Err(AddressError::OutOfRange { what: "node", .. })
        ));
        assert!(SdoAddress::parse("SDO:1:0x10000/0x1:RECORD").is_err());
    }
}
