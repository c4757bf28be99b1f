//! EEPROM patch records and how their values are written to the MCU.
//!
//! Records come from a per-variant JSON file:
//!
//! ```json
//! [
//!   { "name": "My TX EUI 1", "address": "0x08080008", "value": "" },
//!   { "name": "Channel", "address": "0x08080020", "value": "10" }
//! ]
//! ```
//!
//! Values are strings. Pure digits are numbers and are written as a hex
//! literal; anything else is text and is written as its UTF-8 bytes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Record that receives the generated unit address.
pub const RADIO_ADDRESS_FIELD: &str = "My TX EUI 1";

/// Multi-byte values at this address are written in reversed byte order;
/// everywhere else they are written in source order. Units already in the
/// field were programmed this way.
pub const REVERSED_ORDER_ADDRESS: u32 = 0x0808_0008;

#[derive(Debug, Error)]
pub enum EepromError {
    #[error("could not read EEPROM file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not write EEPROM file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed EEPROM file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no EEPROM record named '{0}'")]
    MissingField(String),
    #[error("invalid EEPROM address '{0}'")]
    BadAddress(String),
    #[error("value '{0}' is not valid hex")]
    BadValue(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EepromRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub address: String,
    #[serde(default)]
    pub value: Value,
    /// Anything else in the file is kept as is.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl EepromRecord {
    pub fn new(name: Option<&str>, address: &str, value: &str) -> Self {
        Self {
            name: name.map(str::to_string),
            address: address.to_string(),
            value: Value::String(value.to_string()),
            extra: Default::default(),
        }
    }
}

pub fn load_records(path: &Path) -> Result<Vec<EepromRecord>, EepromError> {
    let text = fs::read_to_string(path).map_err(|source| EepromError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| EepromError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn save_records(path: &Path, records: &[EepromRecord]) -> Result<(), EepromError> {
    let text = serde_json::to_string_pretty(records).map_err(|source| EepromError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, text).map_err(|source| EepromError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes `address` into the record named [`RADIO_ADDRESS_FIELD`].
pub fn stamp_address(records: &mut [EepromRecord], address: &str) -> Result<(), EepromError> {
    let mut found = false;
    for record in records
        .iter_mut()
        .filter(|r| r.name.as_deref() == Some(RADIO_ADDRESS_FIELD))
    {
        record.value = Value::String(address.to_string());
        found = true;
    }
    if found {
        Ok(())
    } else {
        Err(EepromError::MissingField(RADIO_ADDRESS_FIELD.to_string()))
    }
}

fn encode_number(n: u128) -> String {
    if n < 256 {
        format!("0x{:02x}", n)
    } else {
        format!("0x{:X}", n)
    }
}

fn encode_text(text: &str) -> String {
    let hex: String = text.bytes().map(|b| format!("{:02X}", b)).collect();
    format!("0x{}", hex)
}

/// Renders a record value as the hex literal handed to the programmer.
///
/// Returns `None` for empty values, which are skipped.
pub fn encode_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if s.is_empty() => None,
        Value::String(s) if s.bytes().all(|b| b.is_ascii_digit()) => match s.parse::<u128>() {
            Ok(n) => Some(encode_number(n)),
            Err(_) => Some(encode_text(s)),
        },
        Value::String(s) => Some(encode_text(s)),
        Value::Number(n) => n.as_u64().map(|n| encode_number(n as u128)),
        _ => None,
    }
}

/// Bytes of an encoded literal, most significant first.
pub fn literal_bytes(literal: &str) -> Result<Vec<u8>, EepromError> {
    let mut digits = literal.trim().to_ascii_lowercase().replace("0x", "");
    if digits.len() % 2 != 0 {
        digits.insert(0, '0');
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&digits[i..i + 2], 16))
        .collect::<Result<Vec<u8>, _>>()
        .map_err(|_| EepromError::BadValue(literal.to_string()))
}

/// How one record reaches the chip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePlan {
    /// One 8-bit write of the literal.
    Byte { address: String, value: String },
    /// One 32-bit write of the literal.
    Word { address: String, value: String },
    /// Individual byte writes at consecutive addresses.
    Bytes(Vec<(u32, u8)>),
}

pub fn parse_address(address: &str) -> Result<u32, EepromError> {
    let digits = address.trim().trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).map_err(|_| EepromError::BadAddress(address.to_string()))
}

pub fn plan_write(address: &str, literal: &str) -> Result<WritePlan, EepromError> {
    let bytes = literal_bytes(literal)?;
    match bytes.len() {
        0..=1 => Ok(WritePlan::Byte {
            address: address.to_string(),
            value: literal.to_string(),
        }),
        2..=4 => Ok(WritePlan::Word {
            address: address.to_string(),
            value: literal.to_string(),
        }),
        _ => {
            let base = parse_address(address)?;
            let ordered: Vec<u8> = if base == REVERSED_ORDER_ADDRESS {
                bytes.into_iter().rev().collect()
            } else {
                bytes
            };
            Ok(WritePlan::Bytes(
                ordered
                    .into_iter()
                    .enumerate()
                    .map(|(i, b)| (base + i as u32, b))
                    .collect(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn s(v: &str) -> Value {
        Value::String(v.to_string())
    }

    // --- Value encoding ---

    #[test]
    fn small_numbers_are_lowercase_two_digit() {
        assert_eq!(encode_value(&s("10")).as_deref(), Some("0x0a"));
        assert_eq!(encode_value(&s("0")).as_deref(), Some("0x00"));
        assert_eq!(encode_value(&s("255")).as_deref(), Some("0xff"));
    }

    #[test]
    fn large_numbers_are_minimal_uppercase() {
        assert_eq!(encode_value(&s("300")).as_deref(), Some("0x12C"));
        assert_eq!(encode_value(&s("65536")).as_deref(), Some("0x10000"));
        assert_eq!(encode_value(&serde_json::json!(300)).as_deref(), Some("0x12C"));
    }

    #[test]
    fn text_is_utf8_hex() {
        assert_eq!(encode_value(&s("AB")).as_deref(), Some("0x4142"));
        assert_eq!(encode_value(&s("0x1F")).as_deref(), Some("0x30783146"));
    }

    #[test]
    fn empty_values_are_skipped() {
        assert_eq!(encode_value(&s("")), None);
        assert_eq!(encode_value(&Value::Null), None);
    }

    // --- Write planning ---

    #[test]
    fn narrow_values_use_single_writes() {
        assert_eq!(
            plan_write("0x08080000", "0x0a").unwrap(),
            WritePlan::Byte {
                address: "0x08080000".into(),
                value: "0x0a".into()
            }
        );
        assert_eq!(
            plan_write("0x08080004", "0x4142").unwrap(),
            WritePlan::Word {
                address: "0x08080004".into(),
                value: "0x4142".into()
            }
        );
        // odd digit count is padded before sizing
        assert!(matches!(plan_write("0x08080004", "0x12C").unwrap(), WritePlan::Word { .. }));
    }

    #[test]
    fn wide_values_keep_source_order() {
        let plan = plan_write("0x08080010", "0x010203040506").unwrap();
        assert_eq!(
            plan,
            WritePlan::Bytes(vec![
                (0x0808_0010, 0x01),
                (0x0808_0011, 0x02),
                (0x0808_0012, 0x03),
                (0x0808_0013, 0x04),
                (0x0808_0014, 0x05),
                (0x0808_0015, 0x06),
            ])
        );
    }

    #[test]
    fn address_field_location_is_written_reversed() {
        let plan = plan_write("0x08080008", "0x010203040506").unwrap();
        assert_eq!(
            plan,
            WritePlan::Bytes(vec![
                (0x0808_0008, 0x06),
                (0x0808_0009, 0x05),
                (0x0808_000A, 0x04),
                (0x0808_000B, 0x03),
                (0x0808_000C, 0x02),
                (0x0808_000D, 0x01),
            ])
        );
    }

    #[test]
    fn bad_inputs_are_rejected() {
        assert!(matches!(literal_bytes("0xZZ"), Err(EepromError::BadValue(_))));
        assert!(matches!(
            plan_write("nowhere", "0x010203040506"),
            Err(EepromError::BadAddress(_))
        ));
    }

    // --- Files ---

    #[test]
    fn stamp_and_round_trip_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"name":"My TX EUI 1","address":"0x08080008","value":"","type":"eui"}},
               {{"name":"Channel","address":"0x08080020","value":"10"}}]"#
        )
        .unwrap();

        let mut records = load_records(file.path()).unwrap();
        stamp_address(&mut records, "0x66F1A2B30000008").unwrap();
        save_records(file.path(), &records).unwrap();

        let reloaded = load_records(file.path()).unwrap();
        assert_eq!(reloaded[0].value, s("0x66F1A2B30000008"));
        assert_eq!(reloaded[0].extra.get("type"), Some(&s("eui")));
        assert_eq!(reloaded[1].value, s("10"));
    }

    #[test]
    fn stamping_requires_the_address_record() {
        let mut records = vec![EepromRecord::new(Some("Channel"), "0x08080020", "10")];
        assert!(matches!(
            stamp_address(&mut records, "0x1"),
            Err(EepromError::MissingField(_))
        ));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        assert!(matches!(
            load_records(Path::new("/no/such/eeprom.json")),
            Err(EepromError::Read { .. })
        ));
    }
}
