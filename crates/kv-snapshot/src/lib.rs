// kv-snapshot: reader for the RDB snapshot binary format.
//
// The format is a 9-byte `REDIS<version>` header followed by a stream of
// opcoded records:
//
//   0xFA  aux field            two strings (name, value), ignored
//   0xFB  resizedb hints       two length-encoded integers, ignored
//   0xFE  select db            one byte, ignored (single-keyspace server)
//   0xFC  expiry (ms)          u64 LE, then a typed key/value record
//   0xFD  expiry (s)           u32 LE, then a typed key/value record
//   0xFF  end of file          8-byte checksum follows, not verified
//   else  value-type id, then key string and typed value
//
// Only string values (type id 0) are loaded; nothing in the server stores
// other types through snapshots. Strings use the shared length encoding: the
// top two bits of the first byte select a 6-bit inline length, a 14-bit
// length, a 32-bit big-endian length, or a special encoding whose 6-bit
// payload names an 8/16/32-bit little-endian integer rendered as its decimal
// string (LZF-compressed payloads are not supported).

use std::io::Read;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// One key/value record recovered from a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub key: String,
    pub value: String,
    /// Absolute expiry as unix milliseconds; `None` means no expiry.
    pub expires_at_ms: Option<u64>,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad snapshot header")]
    BadHeader,
    #[error("LZF-compressed strings are not supported")]
    LzfUnsupported,
    #[error("unknown special string encoding: {0}")]
    UnknownSpecialEncoding(u8),
    #[error("unsupported value type id: {0:#04x}")]
    UnsupportedValueType(u8),
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
}

/// The canonical empty snapshot a master transfers on `PSYNC ? -1`:
/// header, aux fields, and the end-of-file marker with its checksum.
pub const EMPTY_SNAPSHOT: &[u8] = &[
    0x52, 0x45, 0x44, 0x49, 0x53, 0x30, 0x30, 0x31, 0x31, 0xfa, 0x09, 0x72, 0x65, 0x64, 0x69,
    0x73, 0x2d, 0x76, 0x65, 0x72, 0x05, 0x37, 0x2e, 0x32, 0x2e, 0x30, 0xfa, 0x0a, 0x72, 0x65,
    0x64, 0x69, 0x73, 0x2d, 0x62, 0x69, 0x74, 0x73, 0xc0, 0x40, 0xfa, 0x05, 0x63, 0x74, 0x69,
    0x6d, 0x65, 0xc2, 0x6d, 0x08, 0xbc, 0x65, 0xfa, 0x08, 0x75, 0x73, 0x65, 0x64, 0x2d, 0x6d,
    0x65, 0x6d, 0xc2, 0xb0, 0xc4, 0x10, 0x00, 0xfa, 0x08, 0x61, 0x6f, 0x66, 0x2d, 0x62, 0x61,
    0x73, 0x65, 0xc0, 0x00, 0xff, 0xf0, 0x6e, 0x3b, 0xfe, 0xc0, 0xff, 0x5a, 0xa2,
];

const OP_AUX: u8 = 0xFA;
const OP_RESIZEDB: u8 = 0xFB;
const OP_EXPIRE_MS: u8 = 0xFC;
const OP_EXPIRE_S: u8 = 0xFD;
const OP_SELECTDB: u8 = 0xFE;
const OP_EOF: u8 = 0xFF;

const TYPE_STRING: u8 = 0;

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Parse a full snapshot, returning every string record in file order.
pub fn read_snapshot<R: Read>(mut reader: R) -> Result<Vec<SnapshotRecord>, SnapshotError> {
    let mut header = [0u8; 9];
    reader.read_exact(&mut header)?;
    if &header[..5] != b"REDIS" {
        return Err(SnapshotError::BadHeader);
    }

    let mut records = Vec::new();
    loop {
        let opcode = match read_u8(&mut reader) {
            Ok(b) => b,
            // A snapshot that simply stops at a record boundary is accepted.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };
        match opcode {
            OP_AUX => {
                read_string(&mut reader)?;
                read_string(&mut reader)?;
            }
            OP_RESIZEDB => {
                read_length(&mut reader)?;
                read_length(&mut reader)?;
            }
            OP_SELECTDB => {
                read_u8(&mut reader)?;
            }
            OP_EXPIRE_MS => {
                let expires_at_ms = read_u64_le(&mut reader)?;
                let value_type = read_u8(&mut reader)?;
                records.push(read_record(&mut reader, value_type, Some(expires_at_ms))?);
            }
            OP_EXPIRE_S => {
                let expires_at_s = read_u32_le(&mut reader)?;
                let value_type = read_u8(&mut reader)?;
                records.push(read_record(
                    &mut reader,
                    value_type,
                    Some(u64::from(expires_at_s) * 1000),
                )?);
            }
            OP_EOF => {
                // 8-byte checksum, present but not verified.
                let mut checksum = [0u8; 8];
                let _ = reader.read_exact(&mut checksum);
                break;
            }
            value_type => {
                records.push(read_record(&mut reader, value_type, None)?);
            }
        }
    }
    Ok(records)
}

fn read_record<R: Read>(
    reader: &mut R,
    value_type: u8,
    expires_at_ms: Option<u64>,
) -> Result<SnapshotRecord, SnapshotError> {
    if value_type != TYPE_STRING {
        // Non-string payloads have their own framing; without decoding it we
        // cannot find the next record boundary.
        return Err(SnapshotError::UnsupportedValueType(value_type));
    }
    let key = read_string(reader)?;
    let value = read_string(reader)?;
    Ok(SnapshotRecord {
        key,
        value,
        expires_at_ms,
    })
}

// ---------------------------------------------------------------------------
// Primitive readers
// ---------------------------------------------------------------------------

fn read_u8<R: Read>(reader: &mut R) -> Result<u8, std::io::Error> {
    let mut b = [0u8; 1];
    reader.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_u32_le<R: Read>(reader: &mut R) -> Result<u32, std::io::Error> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64_le<R: Read>(reader: &mut R) -> Result<u64, std::io::Error> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// A decoded length: either a real byte count or the 6-bit payload of a
/// special encoding.
enum Length {
    Plain(u64),
    Special(u8),
}

fn read_length<R: Read>(reader: &mut R) -> Result<Length, SnapshotError> {
    let first = read_u8(reader)?;
    match (first & 0xC0) >> 6 {
        0 => Ok(Length::Plain(u64::from(first & 0x3F))),
        1 => {
            let next = read_u8(reader)?;
            Ok(Length::Plain(
                u64::from(first & 0x3F) << 8 | u64::from(next),
            ))
        }
        2 => {
            let mut buf = [0u8; 4];
            reader.read_exact(&mut buf)?;
            Ok(Length::Plain(u64::from(u32::from_be_bytes(buf))))
        }
        _ => Ok(Length::Special(first & 0x3F)),
    }
}

fn read_string<R: Read>(reader: &mut R) -> Result<String, SnapshotError> {
    match read_length(reader)? {
        Length::Plain(len) => {
            let len = usize::try_from(len).expect("length fits in usize");
            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf)?;
            String::from_utf8(buf).map_err(|_| SnapshotError::InvalidUtf8)
        }
        Length::Special(encoding) => match encoding {
            0 => Ok(format!("{}", read_u8(reader)?)),
            1 => {
                let mut buf = [0u8; 2];
                reader.read_exact(&mut buf)?;
                Ok(format!("{}", u16::from_le_bytes(buf)))
            }
            2 => Ok(format!("{}", read_u32_le(reader)?)),
            3 => Err(SnapshotError::LzfUnsupported),
            other => Err(SnapshotError::UnknownSpecialEncoding(other)),
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn push_plain_string(buf: &mut Vec<u8>, s: &str) {
        assert!(s.len() < 64, "test helper only emits 6-bit lengths");
        buf.push(u8::try_from(s.len()).unwrap());
        buf.extend_from_slice(s.as_bytes());
    }

    fn header() -> Vec<u8> {
        b"REDIS0011".to_vec()
    }

    #[test]
    fn empty_snapshot_has_no_records() {
        let records = read_snapshot(EMPTY_SNAPSHOT).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn plain_and_expiring_records() {
        let mut buf = header();
        // aux field
        buf.push(0xFA);
        push_plain_string(&mut buf, "redis-ver");
        push_plain_string(&mut buf, "7.2.0");
        // select db + resizedb hints
        buf.push(0xFE);
        buf.push(0);
        buf.push(0xFB);
        buf.push(2);
        buf.push(1);
        // plain string record
        buf.push(0x00);
        push_plain_string(&mut buf, "name");
        push_plain_string(&mut buf, "keyva");
        // millisecond expiry record
        buf.push(0xFC);
        buf.extend_from_slice(&1_700_000_000_123u64.to_le_bytes());
        buf.push(0x00);
        push_plain_string(&mut buf, "session");
        push_plain_string(&mut buf, "abc");
        // second expiry record
        buf.push(0xFD);
        buf.extend_from_slice(&1_700_000_000u32.to_le_bytes());
        buf.push(0x00);
        push_plain_string(&mut buf, "lease");
        push_plain_string(&mut buf, "xyz");
        // end marker + checksum
        buf.push(0xFF);
        buf.extend_from_slice(&[0u8; 8]);

        let records = read_snapshot(buf.as_slice()).unwrap();
        assert_eq!(
            records,
            vec![
                SnapshotRecord {
                    key: "name".to_owned(),
                    value: "keyva".to_owned(),
                    expires_at_ms: None,
                },
                SnapshotRecord {
                    key: "session".to_owned(),
                    value: "abc".to_owned(),
                    expires_at_ms: Some(1_700_000_000_123),
                },
                SnapshotRecord {
                    key: "lease".to_owned(),
                    value: "xyz".to_owned(),
                    expires_at_ms: Some(1_700_000_000_000),
                },
            ]
        );
    }

    #[test]
    fn fourteen_bit_lengths() {
        let key = "k".repeat(100);
        let mut buf = header();
        buf.push(0x00);
        buf.push(0x40); // 14-bit length: high 6 bits zero
        buf.push(100);
        buf.extend_from_slice(key.as_bytes());
        push_plain_string(&mut buf, "v");
        buf.push(0xFF);
        buf.extend_from_slice(&[0u8; 8]);

        let records = read_snapshot(buf.as_slice()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, key);
    }

    #[test]
    fn integer_encoded_values() {
        let mut buf = header();
        buf.push(0x00);
        push_plain_string(&mut buf, "small");
        buf.push(0xC0); // 8-bit integer string
        buf.push(64);
        buf.push(0x00);
        push_plain_string(&mut buf, "medium");
        buf.push(0xC1); // 16-bit integer string
        buf.extend_from_slice(&513u16.to_le_bytes());
        buf.push(0x00);
        push_plain_string(&mut buf, "large");
        buf.push(0xC2); // 32-bit integer string
        buf.extend_from_slice(&1_000_000u32.to_le_bytes());
        buf.push(0xFF);
        buf.extend_from_slice(&[0u8; 8]);

        let records = read_snapshot(buf.as_slice()).unwrap();
        let values: Vec<&str> = records.iter().map(|r| r.value.as_str()).collect();
        assert_eq!(values, vec!["64", "513", "1000000"]);
    }

    #[test]
    fn lzf_values_are_rejected() {
        let mut buf = header();
        buf.push(0x00);
        push_plain_string(&mut buf, "k");
        buf.push(0xC3); // LZF special encoding
        match read_snapshot(buf.as_slice()) {
            Err(SnapshotError::LzfUnsupported) => {}
            other => panic!("expected LzfUnsupported, got {other:?}"),
        }
    }

    #[test]
    fn bad_magic_is_rejected() {
        match read_snapshot(&b"NOTRDB011"[..]) {
            Err(SnapshotError::BadHeader) => {}
            other => panic!("expected BadHeader, got {other:?}"),
        }
    }

    #[test]
    fn non_string_value_types_are_refused() {
        let mut buf = header();
        buf.push(0x04); // hash value type
        push_plain_string(&mut buf, "h");
        match read_snapshot(buf.as_slice()) {
            Err(SnapshotError::UnsupportedValueType(0x04)) => {}
            other => panic!("expected UnsupportedValueType, got {other:?}"),
        }
    }
}
