//! Opaque byte-string envelope used for [`crate::entities::UserService::data`]
//! and other plug-in-owned payloads.
//!
//! Layout: a 6-byte magic header, a 4-byte big-endian CRC32 of the
//! unprocessed field data, then the field data itself (optionally
//! obfuscated by XOR-ing it against the header, cyclically). Each field
//! is `{name_len: u16, type_len: u16, value_len: u32}` (little-endian)
//! followed by the name, type name, and value bytes back to back.

use thiserror::Error;

const HEADER_BASE: &[u8; 6] = b"MGBAS1";
const CRC_SIZE: usize = 4;
const FIELD_PREFIX_SIZE: usize = 2 + 2 + 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PluginDataError {
    #[error("missing or unrecognized envelope header")]
    InvalidHeader,
    #[error("checksum mismatch, payload corrupt or truncated")]
    ChecksumMismatch,
    #[error("truncated field at offset {0}")]
    TruncatedField(usize),
    #[error("field name/type is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub type_name: String,
    pub value: Vec<u8>,
}

impl Field {
    fn marshal(&self, out: &mut Vec<u8>) {
        let name = self.name.as_bytes();
        let type_name = self.type_name.as_bytes();
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(&(type_name.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.value.len() as u32).to_le_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(type_name);
        out.extend_from_slice(&self.value);
    }

    fn unmarshal(data: &[u8], offset: usize) -> Result<(Field, usize), PluginDataError> {
        if data.len() < offset + FIELD_PREFIX_SIZE {
            return Err(PluginDataError::TruncatedField(offset));
        }
        let name_len = u16::from_le_bytes([data[offset], data[offset + 1]]) as usize;
        let type_len = u16::from_le_bytes([data[offset + 2], data[offset + 3]]) as usize;
        let value_len = u32::from_le_bytes([
            data[offset + 4],
            data[offset + 5],
            data[offset + 6],
            data[offset + 7],
        ]) as usize;

        let name_start = offset + FIELD_PREFIX_SIZE;
        let type_start = name_start + name_len;
        let value_start = type_start + type_len;
        let end = value_start + value_len;
        if data.len() < end {
            return Err(PluginDataError::TruncatedField(offset));
        }

        let name = std::str::from_utf8(&data[name_start..type_start])
            .map_err(|_| PluginDataError::InvalidUtf8)?
            .to_string();
        let type_name = std::str::from_utf8(&data[type_start..value_start])
            .map_err(|_| PluginDataError::InvalidUtf8)?
            .to_string();
        let value = data[value_start..end].to_vec();

        Ok((
            Field {
                name,
                type_name,
                value,
            },
            end,
        ))
    }
}

fn xor_cycle(data: &[u8], key: &[u8]) -> Vec<u8> {
    data.iter()
        .zip(key.iter().cycle())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Serializes a sequence of fields into the on-wire envelope.
pub fn marshal(fields: &[Field]) -> Vec<u8> {
    let mut body = Vec::new();
    for field in fields {
        field.marshal(&mut body);
    }

    let checksum = crc32fast::hash(&body);
    let mut header = Vec::with_capacity(HEADER_BASE.len() + CRC_SIZE);
    header.extend_from_slice(HEADER_BASE);
    header.extend_from_slice(&checksum.to_be_bytes());

    let mut out = header.clone();
    out.extend_from_slice(&xor_cycle(&body, &header));
    out
}

/// Parses an envelope produced by [`marshal`] back into its fields.
pub fn unmarshal(data: &[u8]) -> Result<Vec<Field>, PluginDataError> {
    if data.len() < HEADER_BASE.len() + CRC_SIZE || &data[..HEADER_BASE.len()] != HEADER_BASE {
        return Err(PluginDataError::InvalidHeader);
    }
    let header = &data[..HEADER_BASE.len() + CRC_SIZE];
    let checksum = u32::from_be_bytes([
        header[HEADER_BASE.len()],
        header[HEADER_BASE.len() + 1],
        header[HEADER_BASE.len() + 2],
        header[HEADER_BASE.len() + 3],
    ]);

    let body = xor_cycle(&data[header.len()..], header);
    if crc32fast::hash(&body) != checksum {
        return Err(PluginDataError::ChecksumMismatch);
    }

    let mut fields = Vec::new();
    let mut offset = 0;
    while offset < body.len() {
        let (field, next) = Field::unmarshal(&body, offset)?;
        fields.push(field);
        offset = next;
    }
    Ok(fields)
}

pub fn is_plugin_data(data: &[u8]) -> bool {
    data.len() >= HEADER_BASE.len() && &data[..HEADER_BASE.len()] == HEADER_BASE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, type_name: &str, value: &[u8]) -> Field {
        Field {
            name: name.into(),
            type_name: type_name.into(),
            value: value.to_vec(),
        }
    }

    #[test]
    fn round_trips_a_single_field() {
        let fields = vec![field("counter", "int", b"42")];
        let wire = marshal(&fields);
        assert!(is_plugin_data(&wire));
        assert_eq!(unmarshal(&wire).unwrap(), fields);
    }

    #[test]
    fn round_trips_multiple_heterogeneous_fields() {
        let fields = vec![
            field("name", "str", b"vm-01"),
            field("ready", "bool", b"1"),
            field("tags", "list", b"[\"a\",\"b\"]"),
        ];
        let wire = marshal(&fields);
        assert_eq!(unmarshal(&wire).unwrap(), fields);
    }

    #[test]
    fn round_trips_empty_field_list() {
        let wire = marshal(&[]);
        assert!(unmarshal(&wire).unwrap().is_empty());
    }

    #[test]
    fn rejects_payload_with_wrong_header() {
        let err = unmarshal(b"NOTMAGIC").unwrap_err();
        assert_eq!(err, PluginDataError::InvalidHeader);
    }

    #[test]
    fn rejects_corrupted_payload() {
        let mut wire = marshal(&[field("a", "str", b"b")]);
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;
        assert_eq!(unmarshal(&wire).unwrap_err(), PluginDataError::ChecksumMismatch);
    }

    #[test]
    fn is_plugin_data_rejects_short_input() {
        assert!(!is_plugin_data(b"MG"));
    }
}
