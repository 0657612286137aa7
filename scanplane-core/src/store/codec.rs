//! Value encodings. State records are plain JSON; scan reports are JSON
//! compressed with zstd since they carry full vulnerability lists.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Result, ScanError};

const REPORT_COMPRESSION_LEVEL: i32 = 3;

pub fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

pub fn encode_compressed<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let encoded = serde_json::to_vec(value)?;
    zstd::encode_all(encoded.as_slice(), REPORT_COMPRESSION_LEVEL).map_err(ScanError::Io)
}

pub fn decode_compressed<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let decompressed = zstd::decode_all(bytes).map_err(ScanError::Io)?;
    Ok(serde_json::from_slice(&decompressed)?)
}
