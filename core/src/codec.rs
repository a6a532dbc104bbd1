//! Record codec: self-describing binary framing for a [`Message`]
//!
//! # Layout
//!
//! All integers are little-endian u32.
//!
//! ```text
//! ┌───────────┬────────────┬──────────┬─────────┬──────────┬─────────┬───
//! │ total_len │ part_count │ len(p0)  │ p0 ...  │ len(p1)  │ p1 ...  │ ...
//! └───────────┴────────────┴──────────┴─────────┴──────────┴─────────┴───
//!   4 bytes     4 bytes      4 bytes              4 bytes
//! ```
//!
//! `total_len` covers everything after itself: `4 + Σ(4 + len(part))`. The
//! encoded size of a record is therefore `8 + Σ(4 + len(part))`, and that is
//! the number buffers use for capacity accounting.
//!
//! A `total_len` of zero never describes a valid record. Storage layers that
//! preallocate zeroed space read it as "no more data".

use crate::error::CodecError;
use crate::message::Message;
use bytes::{BufMut, Bytes, BytesMut};

/// Size of the fixed record header (`total_len` + `part_count`)
pub const HEADER_LEN: usize = 8;

/// Size of a length prefix
const LEN_FIELD: usize = 4;

/// Largest record whose length fields fit in `u32`
///
/// Callers must reject bigger messages before encoding them.
pub const MAX_ENCODED_SIZE: usize = u32::MAX as usize;

/// Encoded size of `msg` in bytes, header included
#[inline]
pub fn encoded_size(msg: &Message) -> usize {
    HEADER_LEN + msg.parts().iter().map(|p| LEN_FIELD + p.len()).sum::<usize>()
}

/// Encode `msg` into a freshly allocated record
pub fn encode(msg: &Message) -> Bytes {
    let size = encoded_size(msg);
    let mut buf = BytesMut::with_capacity(size);
    encode_into(msg, &mut buf);
    buf.freeze()
}

/// Append the encoding of `msg` to `buf`
pub fn encode_into(msg: &Message, buf: &mut BytesMut) {
    let size = encoded_size(msg);
    buf.reserve(size);
    buf.put_u32_le((size - LEN_FIELD) as u32);
    buf.put_u32_le(msg.len() as u32);
    for part in msg.parts() {
        buf.put_u32_le(part.len() as u32);
        buf.put_slice(part);
    }
}

/// Read the `total_len` field at the start of `data`
///
/// Returns `None` when fewer than four bytes are available.
#[inline]
pub fn peek_total_len(data: &[u8]) -> Option<u32> {
    data.get(..LEN_FIELD).map(read_u32)
}

/// Decode one record from the start of `data`, copying the parts out
///
/// Returns the message and the number of bytes the record occupied.
pub fn decode(data: &[u8]) -> Result<(Message, usize), CodecError> {
    let spans = scan(data)?;
    let parts = spans
        .ranges
        .into_iter()
        .map(|(start, end)| Bytes::copy_from_slice(&data[start..end]))
        .collect();
    Ok((Message::from_parts(parts), spans.consumed))
}

/// Decode one record from the start of `data` without copying
///
/// Parts are slices of `data`, so they keep the underlying buffer alive.
pub fn decode_shared(data: &Bytes) -> Result<(Message, usize), CodecError> {
    let spans = scan(data)?;
    let parts = spans
        .ranges
        .into_iter()
        .map(|(start, end)| data.slice(start..end))
        .collect();
    Ok((Message::from_parts(parts), spans.consumed))
}

/// Check the record at the start of `data` without decoding it
///
/// Returns the number of bytes the record occupies.
pub fn validate(data: &[u8]) -> Result<usize, CodecError> {
    scan(data).map(|spans| spans.consumed)
}

struct Spans {
    ranges: Vec<(usize, usize)>,
    consumed: usize,
}

/// Validate the record at the start of `data` and locate its parts
fn scan(data: &[u8]) -> Result<Spans, CodecError> {
    if data.len() < HEADER_LEN {
        return Err(CodecError::Truncated {
            needed: HEADER_LEN,
            available: data.len(),
        });
    }

    let total_len = read_u32(&data[..LEN_FIELD]) as usize;
    if total_len == 0 {
        return Err(CodecError::Corrupt {
            reason: "zero length record",
        });
    }
    if total_len < LEN_FIELD {
        return Err(CodecError::Corrupt {
            reason: "total length shorter than part count field",
        });
    }

    let consumed = LEN_FIELD + total_len;
    if data.len() < consumed {
        return Err(CodecError::Truncated {
            needed: consumed,
            available: data.len(),
        });
    }

    let part_count = read_u32(&data[LEN_FIELD..HEADER_LEN]) as usize;
    let prefixes_fit = part_count
        .checked_mul(LEN_FIELD)
        .is_some_and(|n| n <= total_len - LEN_FIELD);
    if !prefixes_fit {
        return Err(CodecError::Corrupt {
            reason: "part count exceeds record length",
        });
    }

    let mut ranges = Vec::with_capacity(part_count);
    let mut pos = HEADER_LEN;
    for _ in 0..part_count {
        if pos + LEN_FIELD > consumed {
            return Err(CodecError::Corrupt {
                reason: "part length prefix past end of record",
            });
        }
        let len = read_u32(&data[pos..pos + LEN_FIELD]) as usize;
        pos += LEN_FIELD;
        let end = pos.checked_add(len).filter(|end| *end <= consumed).ok_or(
            CodecError::Corrupt {
                reason: "part extends past end of record",
            },
        )?;
        ranges.push((pos, end));
        pos = end;
    }

    if pos != consumed {
        return Err(CodecError::Corrupt {
            reason: "part lengths do not sum to total length",
        });
    }

    Ok(Spans { ranges, consumed })
}

#[inline]
fn read_u32(field: &[u8]) -> u32 {
    u32::from_le_bytes([field[0], field[1], field[2], field[3]])
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn msg(parts: &[&str]) -> Message {
        Message::from_slices(parts.iter().copied())
    }

    #[test]
    fn test_encoded_size() {
        assert_eq!(encoded_size(&Message::new()), 8);
        assert_eq!(encoded_size(&msg(&["1234"])), 16);
        assert_eq!(encoded_size(&msg(&["hello", "world"])), 8 + 9 + 9);
    }

    #[test]
    fn test_layout_is_little_endian() {
        let encoded = encode(&msg(&["ab"]));
        assert_eq!(
            encoded.as_ref(),
            &[6, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, b'a', b'b']
        );
        assert_eq!(encoded.len(), encoded_size(&msg(&["ab"])));
        assert_eq!(peek_total_len(&encoded), Some(6));
    }

    #[test]
    fn test_round_trip_preserves_parts() {
        let original = Message::from_parts(vec![
            Bytes::from_static(b"hello"),
            Bytes::new(),
            Bytes::from(vec![0u8, 255, 7]),
        ]);
        let encoded = encode(&original);

        let (copied, used) = decode(&encoded).unwrap();
        assert_eq!(copied, original);
        assert_eq!(used, encoded.len());

        let (shared, used) = decode_shared(&encoded).unwrap();
        assert_eq!(shared, original);
        assert_eq!(used, encoded.len());
    }

    #[test]
    fn test_empty_message_round_trip() {
        let encoded = encode(&Message::new());
        let (decoded, used) = decode(&encoded).unwrap();
        assert!(decoded.is_empty());
        assert_eq!(used, 8);
    }

    #[test]
    fn test_decode_shared_is_zero_copy() {
        let encoded = encode(&msg(&["payload"]));
        let (decoded, _) = decode_shared(&encoded).unwrap();
        let part = decoded.part(0).unwrap();
        assert_eq!(part.as_ptr(), encoded[12..].as_ptr());
    }

    #[test]
    fn test_decode_consumes_one_record_of_many() {
        let mut buf = BytesMut::new();
        encode_into(&msg(&["first"]), &mut buf);
        encode_into(&msg(&["second", "x"]), &mut buf);
        let buf = buf.freeze();

        let (first, used) = decode_shared(&buf).unwrap();
        assert_eq!(first, msg(&["first"]));
        let rest = buf.slice(used..);
        let (second, used2) = decode_shared(&rest).unwrap();
        assert_eq!(second, msg(&["second", "x"]));
        assert_eq!(used + used2, buf.len());
        assert_eq!(validate(&rest).unwrap(), used2);
    }

    #[test]
    fn test_truncated_header() {
        let err = decode(&[1, 0, 0]).unwrap_err();
        assert_eq!(
            err,
            CodecError::Truncated {
                needed: 8,
                available: 3
            }
        );
        assert!(err.is_truncated());
    }

    #[test]
    fn test_truncated_body() {
        let encoded = encode(&msg(&["hello world"]));
        let cut = &encoded[..encoded.len() - 3];
        let err = decode(cut).unwrap_err();
        assert_eq!(
            err,
            CodecError::Truncated {
                needed: encoded.len(),
                available: encoded.len() - 3
            }
        );
    }

    #[test]
    fn test_zero_length_is_corrupt() {
        let err = decode(&[0u8; 16]).unwrap_err();
        assert!(matches!(err, CodecError::Corrupt { .. }));
    }

    #[test]
    fn test_total_len_shorter_than_part_count() {
        let err = decode(&[2, 0, 0, 0, 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, CodecError::Corrupt { .. }));
    }

    #[test]
    fn test_part_count_overflow() {
        // total_len 4, but claims u32::MAX parts
        let data = [4, 0, 0, 0, 255, 255, 255, 255];
        let err = decode(&data).unwrap_err();
        assert!(matches!(err, CodecError::Corrupt { .. }));
    }

    #[test]
    fn test_part_lengths_exceed_total() {
        // total_len 10: part_count(4) + len(4) + 2 bytes, but len says 5
        let data = [10, 0, 0, 0, 1, 0, 0, 0, 5, 0, 0, 0, b'a', b'b'];
        let err = decode(&data).unwrap_err();
        assert!(matches!(err, CodecError::Corrupt { .. }));
    }

    #[test]
    fn test_part_lengths_short_of_total() {
        // total_len 12 covers 4 spare bytes the single part does not use
        let data = [12, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 9, 9, 9, 9];
        let err = decode(&data).unwrap_err();
        assert!(matches!(err, CodecError::Corrupt { .. }));
    }
}
