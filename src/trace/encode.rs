//! Binary values inside the JSON trace transport.
//!
//! JSON has no byte type, so byte values are carried as objects with a `__t`
//! discriminator: `buc` (short buffers, plain base64), `bz` (base64 of the
//! zlib-compressed buffer) or `bd` (a byte patch whose records are themselves
//! carried per the first two rules).

use super::diff::BytesPatch;
use super::TraceError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use std::io::{Read, Write};

/// Buffers below this size are not worth compressing.
const COMPRESS_THRESHOLD: usize = 8;

const TYPE_KEY: &str = "__t";
const TYPE_BYTES_UNCOMPRESSED: &str = "buc";
const TYPE_BYTES_ZLIB: &str = "bz";
const TYPE_BYTES_DIFF: &str = "bd";

fn zlib_compress(data: &[u8]) -> Result<Vec<u8>, TraceError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn zlib_decompress(data: &[u8]) -> Result<Vec<u8>, TraceError> {
    let mut out = Vec::new();
    ZlibDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

/// Encodes a byte buffer as its JSON transport object.
pub fn pack_bytes(data: &[u8]) -> Result<Value, TraceError> {
    if data.len() < COMPRESS_THRESHOLD {
        Ok(json!({ TYPE_KEY: TYPE_BYTES_UNCOMPRESSED, "data": BASE64.encode(data) }))
    } else {
        Ok(json!({ TYPE_KEY: TYPE_BYTES_ZLIB, "data": BASE64.encode(zlib_compress(data)?) }))
    }
}

/// Encodes a byte patch as its JSON transport object.
pub fn pack_patch(patch: &BytesPatch) -> Result<Value, TraceError> {
    Ok(json!({ TYPE_KEY: TYPE_BYTES_DIFF, "data": pack_bytes(patch.data())? }))
}

/// The `__t` discriminator of a value, if it carries one.
pub fn packed_type(value: &Value) -> Option<&str> {
    value.get(TYPE_KEY).and_then(Value::as_str)
}

fn data_field(value: &Value) -> Result<&Value, TraceError> {
    value
        .get("data")
        .ok_or_else(|| TraceError::Format("packed value has no data field".into()))
}

/// Decodes a `buc`/`bz` transport object back into bytes.
pub fn unpack_bytes(value: &Value) -> Result<Vec<u8>, TraceError> {
    let encoded = data_field(value)?
        .as_str()
        .ok_or_else(|| TraceError::Format("packed data is not a string".into()))?;
    let raw = BASE64
        .decode(encoded)
        .map_err(|e| TraceError::Format(format!("bad base64 payload: {}", e)))?;
    match packed_type(value) {
        Some(TYPE_BYTES_UNCOMPRESSED) => Ok(raw),
        Some(TYPE_BYTES_ZLIB) => zlib_decompress(&raw),
        other => Err(TraceError::Format(format!(
            "unexpected packed type {:?}",
            other
        ))),
    }
}

/// Decodes a `bd` transport object back into a byte patch.
pub fn unpack_patch(value: &Value) -> Result<BytesPatch, TraceError> {
    if packed_type(value) != Some(TYPE_BYTES_DIFF) {
        return Err(TraceError::Format("value is not a byte patch".into()));
    }
    Ok(BytesPatch::from_data(unpack_bytes(data_field(value)?)?))
}
