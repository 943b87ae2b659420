//! Value encoding.
//!
//! Records are CBOR, lz4-compressed once they are large enough to benefit.
//! A one-byte tag leads every value:
//!
//! ```text
//! 0x00 <cbor>
//! 0x01 <lz4 block, size-prepended>
//! ```

use crate::error::{CoreError, CoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

const TAG_PLAIN: u8 = 0x00;
const TAG_LZ4: u8 = 0x01;

/// Encoded records shorter than this are stored uncompressed.
const COMPRESS_THRESHOLD: usize = 128;

/// Upper bound on a decompressed record.
const MAX_DECODED_SIZE: usize = 64 * 1024 * 1024;

/// Serializes and, when worthwhile, compresses a record.
///
/// # Errors
///
/// Returns [`CoreError::Codec`] if the record cannot be serialized.
pub fn encode<T: Serialize>(value: &T) -> CoreResult<Vec<u8>> {
    let mut cbor = Vec::new();
    ciborium::into_writer(value, &mut cbor).map_err(|err| CoreError::codec(err.to_string()))?;

    if cbor.len() < COMPRESS_THRESHOLD {
        let mut out = Vec::with_capacity(1 + cbor.len());
        out.push(TAG_PLAIN);
        out.extend_from_slice(&cbor);
        return Ok(out);
    }

    let compressed = lz4_flex::compress_prepend_size(&cbor);
    let mut out = Vec::with_capacity(1 + compressed.len());
    out.push(TAG_LZ4);
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Decodes a record written by [`encode`].
///
/// # Errors
///
/// Returns [`CoreError::Codec`] for unknown tags, corrupt compression or
/// CBOR that does not match `T`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CoreResult<T> {
    let (&tag, body) = bytes
        .split_first()
        .ok_or_else(|| CoreError::codec("empty value"))?;
    match tag {
        TAG_PLAIN => from_cbor(body),
        TAG_LZ4 => {
            if let Some(size) = body.get(..4) {
                let size = u32::from_le_bytes([size[0], size[1], size[2], size[3]]) as usize;
                if size > MAX_DECODED_SIZE {
                    return Err(CoreError::codec(format!("decoded size {size} exceeds limit")));
                }
            }
            let cbor = lz4_flex::decompress_size_prepended(body)
                .map_err(|err| CoreError::codec(format!("lz4: {err}")))?;
            from_cbor(&cbor)
        }
        other => Err(CoreError::codec(format!("unknown value tag 0x{other:02x}"))),
    }
}

fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> CoreResult<T> {
    ciborium::from_reader(bytes).map_err(|err| CoreError::codec(err.to_string()))
}
