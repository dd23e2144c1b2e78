//! Artifact encoding and persistence
//!
//! Every artifact is written as a self-describing envelope:
//!
//! ```text
//! [magic: 4 "CVAF"][format: u16][kind: u8][compression: u8]
//! [stored_len: u64][raw_len: u64][sha256(raw body): 32][body]
//! ```
//!
//! Bodies are bincode (tabular, model) or JSON (metadata). Compression is
//! applied only when it pays for itself, as the content-page compressor
//! does.
//!
//! Writes never leave a truncated artifact readable at the final path:
//! backends that can rename get a staged write, others are verified by
//! length after the put and removed on mismatch.

use crate::error::{RegistryError, Result};
use crate::path::staging_path;
use crate::retry::RetryPolicy;
use crate::storage::StorageClient;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};
use uuid::Uuid;

pub const MAGIC: [u8; 4] = *b"CVAF";
pub const FORMAT_VERSION: u16 = 1;
pub const HEADER_LEN: usize = 4 + 2 + 1 + 1 + 8 + 8 + 32;
/// Largest decoded body an envelope may declare
pub const MAX_RAW_LEN: u64 = 4 << 30;
/// Largest raw/stored ratio a compressed body may declare
const MAX_EXPANSION: u64 = 1 << 16;

/// Kind of payload an artifact holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ArtifactKind {
    /// Columnar table
    Tabular = 1,
    /// Serialized model bytes
    Model = 2,
    /// Free-form JSON document
    Metadata = 3,
}

impl ArtifactKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ArtifactKind::Tabular),
            2 => Some(ArtifactKind::Model),
            3 => Some(ArtifactKind::Metadata),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Tabular => "tabular",
            ArtifactKind::Model => "model",
            ArtifactKind::Metadata => "metadata",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tabular" => Ok(ArtifactKind::Tabular),
            "model" => Ok(ArtifactKind::Model),
            "metadata" => Ok(ArtifactKind::Metadata),
            other => Err(RegistryError::Codec(format!(
                "unknown artifact kind '{}'",
                other
            ))),
        }
    }
}

/// Values of one table column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnData {
    Int64(Vec<i64>),
    Float64(Vec<f64>),
    Utf8(Vec<String>),
    Bool(Vec<bool>),
}

impl ColumnData {
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Int64(v) => v.len(),
            ColumnData::Float64(v) => v.len(),
            ColumnData::Utf8(v) => v.len(),
            ColumnData::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Type name used in DataCard feature maps
    pub fn dtype(&self) -> &'static str {
        match self {
            ColumnData::Int64(_) => "int64",
            ColumnData::Float64(_) => "float64",
            ColumnData::Utf8(_) => "utf8",
            ColumnData::Bool(_) => "bool",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data: ColumnData,
}

/// Named, equal-length columns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<Column>,
}

impl Table {
    /// Build a table, rejecting duplicate names and ragged columns
    pub fn new(columns: Vec<Column>) -> Result<Self> {
        let mut seen = HashSet::new();
        for column in &columns {
            if column.name.is_empty() {
                return Err(RegistryError::Validation(
                    "table column names cannot be empty".to_string(),
                ));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(RegistryError::Validation(format!(
                    "duplicate table column '{}'",
                    column.name
                )));
            }
        }

        if let Some(first) = columns.first() {
            let rows = first.data.len();
            if let Some(ragged) = columns.iter().find(|c| c.data.len() != rows) {
                return Err(RegistryError::Validation(format!(
                    "column '{}' has {} rows, expected {}",
                    ragged.name,
                    ragged.data.len(),
                    rows
                )));
            }
        }

        Ok(Table { columns })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn num_rows(&self) -> usize {
        self.columns.first().map(|c| c.data.len()).unwrap_or(0)
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }
}

/// Opaque serialized model plus enough description to load it again
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelBlob {
    /// e.g. "sklearn", "pytorch", "xgboost"
    pub framework: String,
    /// e.g. "onnx", "joblib", "safetensors"
    pub format: String,
    pub bytes: Vec<u8>,
}

/// Artifact payload attached to a card
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Artifact {
    Tabular(Table),
    Model(ModelBlob),
    Metadata(serde_json::Value),
}

impl Artifact {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            Artifact::Tabular(_) => ArtifactKind::Tabular,
            Artifact::Model(_) => ArtifactKind::Model,
            Artifact::Metadata(_) => ArtifactKind::Metadata,
        }
    }

    fn encode_body(&self) -> Result<Vec<u8>> {
        match self {
            Artifact::Tabular(table) => Ok(bincode::serialize(table)?),
            Artifact::Model(blob) => Ok(bincode::serialize(blob)?),
            Artifact::Metadata(value) => Ok(serde_json::to_vec(value)?),
        }
    }

    fn decode_body(kind: ArtifactKind, body: &[u8]) -> Result<Self> {
        match kind {
            ArtifactKind::Tabular => {
                let table: Table = bincode::deserialize(body)?;
                // re-check shape; a decoded table must satisfy the same rules
                Ok(Artifact::Tabular(Table::new(table.columns)?))
            }
            ArtifactKind::Model => Ok(Artifact::Model(bincode::deserialize(body)?)),
            ArtifactKind::Metadata => Ok(Artifact::Metadata(serde_json::from_slice(body)?)),
        }
    }
}

/// Compression method for artifact bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CompressionMethod {
    None = 0,
    /// fast, moderate ratio
    Lz4 = 1,
    /// slower, better ratio
    Zstd = 2,
}

impl CompressionMethod {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionMethod::None),
            1 => Some(CompressionMethod::Lz4),
            2 => Some(CompressionMethod::Zstd),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompressionConfig {
    pub method: CompressionMethod,

    /// Bodies smaller than this are stored uncompressed
    pub threshold: usize,

    /// Store uncompressed unless compressed_size / raw_size is below this
    pub min_ratio: f32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        CompressionConfig {
            method: CompressionMethod::Zstd,
            threshold: 1024,
            min_ratio: 0.9,
        }
    }
}

impl CompressionConfig {
    pub fn none() -> Self {
        CompressionConfig {
            method: CompressionMethod::None,
            threshold: 0,
            min_ratio: 0.0,
        }
    }

    pub fn lz4() -> Self {
        CompressionConfig {
            method: CompressionMethod::Lz4,
            threshold: 512,
            ..Default::default()
        }
    }
}

fn compress(data: &[u8], method: CompressionMethod) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionMethod::Zstd => zstd::bulk::compress(data, 3)
            .map_err(|e| RegistryError::Codec(format!("zstd compression failed: {}", e))),
    }
}

fn decompress(data: &[u8], method: CompressionMethod, raw_len: usize) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Lz4 => {
            if data.len() < 4 {
                return Err(RegistryError::Codec("lz4 body is truncated".to_string()));
            }
            let prefix = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
            if prefix != raw_len {
                return Err(RegistryError::Codec(format!(
                    "lz4 body claims {} bytes, header says {}",
                    prefix, raw_len
                )));
            }
            lz4_flex::decompress(&data[4..], raw_len)
                .map_err(|e| RegistryError::Codec(format!("lz4 decompression failed: {}", e)))
        }
        CompressionMethod::Zstd => zstd::bulk::decompress(data, raw_len)
            .map_err(|e| RegistryError::Codec(format!("zstd decompression failed: {}", e))),
    }
}

/// Compress if beneficial, returns (data, method_used)
fn compress_if_beneficial(
    data: &[u8],
    config: &CompressionConfig,
) -> Result<(Vec<u8>, CompressionMethod)> {
    if config.method == CompressionMethod::None || data.len() < config.threshold {
        return Ok((data.to_vec(), CompressionMethod::None));
    }

    let compressed = compress(data, config.method)?;
    let ratio = compressed.len() as f32 / data.len() as f32;
    if ratio >= config.min_ratio {
        return Ok((data.to_vec(), CompressionMethod::None));
    }

    Ok((compressed, config.method))
}

fn checksum(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Encode an artifact into its envelope
pub fn encode(artifact: &Artifact, compression: &CompressionConfig) -> Result<Vec<u8>> {
    let raw = artifact.encode_body()?;
    if raw.len() as u64 > MAX_RAW_LEN {
        return Err(RegistryError::Validation(format!(
            "artifact body is {} bytes, the limit is {}",
            raw.len(),
            MAX_RAW_LEN
        )));
    }
    let digest = checksum(&raw);
    let (body, method) = compress_if_beneficial(&raw, compression)?;

    let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
    bytes.extend_from_slice(&MAGIC);
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bytes.push(artifact.kind() as u8);
    bytes.push(method as u8);
    bytes.extend_from_slice(&(body.len() as u64).to_le_bytes());
    bytes.extend_from_slice(&(raw.len() as u64).to_le_bytes());
    bytes.extend_from_slice(&digest);
    bytes.extend_from_slice(&body);

    Ok(bytes)
}

/// Decode an envelope, verifying length and checksum
pub fn decode(bytes: &[u8]) -> Result<Artifact> {
    if bytes.len() < HEADER_LEN {
        return Err(RegistryError::Codec(format!(
            "artifact too short: {} bytes, header needs {}",
            bytes.len(),
            HEADER_LEN
        )));
    }
    if bytes[0..4] != MAGIC {
        return Err(RegistryError::Codec("invalid artifact magic".to_string()));
    }

    let format = u16::from_le_bytes([bytes[4], bytes[5]]);
    if format != FORMAT_VERSION {
        return Err(RegistryError::Codec(format!(
            "unsupported artifact format version {}",
            format
        )));
    }

    let kind = ArtifactKind::from_u8(bytes[6])
        .ok_or_else(|| RegistryError::Codec(format!("unknown artifact kind {}", bytes[6])))?;
    let method = CompressionMethod::from_u8(bytes[7]).ok_or_else(|| {
        RegistryError::Codec(format!("unknown compression method {}", bytes[7]))
    })?;

    let mut len_buf = [0u8; 8];
    len_buf.copy_from_slice(&bytes[8..16]);
    let stored_len = u64::from_le_bytes(len_buf);
    len_buf.copy_from_slice(&bytes[16..24]);
    let raw_len = u64::from_le_bytes(len_buf);

    // bound the declared size before anything is allocated for it
    let max_raw = match method {
        CompressionMethod::None => stored_len,
        _ => stored_len.saturating_mul(MAX_EXPANSION).min(MAX_RAW_LEN),
    };
    if raw_len > max_raw {
        return Err(RegistryError::Codec(format!(
            "artifact declares {} raw bytes from a {} byte {:?} body",
            raw_len, stored_len, method
        )));
    }

    let mut expected = [0u8; 32];
    expected.copy_from_slice(&bytes[24..56]);

    let body = &bytes[HEADER_LEN..];
    if body.len() as u64 != stored_len {
        return Err(RegistryError::Codec(format!(
            "artifact body is {} bytes, header says {}",
            body.len(),
            stored_len
        )));
    }

    let raw_len = raw_len as usize;
    let raw = decompress(body, method, raw_len)?;
    if raw.len() != raw_len || checksum(&raw) != expected {
        return Err(RegistryError::Codec(
            "artifact checksum mismatch".to_string(),
        ));
    }

    Artifact::decode_body(kind, &raw)
}

/// Result of a successful artifact write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenArtifact {
    pub path: String,
    pub kind: ArtifactKind,
    pub size: u64,
}

/// Encode `artifact` and write it at `path` as one logical unit
pub fn write_artifact(
    storage: &dyn StorageClient,
    path: &str,
    artifact: &Artifact,
    compression: &CompressionConfig,
    retry: &RetryPolicy,
) -> Result<WrittenArtifact> {
    let bytes = encode(artifact, compression)?;
    let expected = bytes.len() as u64;

    if storage.supports_rename() {
        let staged = staging_path(path, &Uuid::new_v4().simple().to_string());
        debug!("Staging {} artifact at {}", artifact.kind(), staged);

        let committed = retry
            .run("stage artifact", |_| storage.put(&staged, &bytes))
            .and_then(|_| retry.run("publish artifact", |_| storage.rename(&staged, path)));

        if let Err(err) = committed {
            if let Err(cleanup) = storage.delete(&staged) {
                warn!("Failed to remove staged artifact {}: {}", staged, cleanup);
            }
            return Err(err);
        }
    } else {
        retry.run("write artifact", |_| storage.put(path, &bytes))?;

        let written = retry.run("verify artifact", |_| storage.size(path))?;
        if written != expected {
            if let Err(cleanup) = storage.delete(path) {
                warn!("Failed to remove truncated artifact {}: {}", path, cleanup);
            }
            return Err(RegistryError::transient(
                path,
                format!("wrote {} bytes, expected {}", written, expected),
            ));
        }
    }

    debug!("Wrote {} artifact to {} ({} bytes)", artifact.kind(), path, expected);

    Ok(WrittenArtifact {
        path: path.to_string(),
        kind: artifact.kind(),
        size: expected,
    })
}

/// Read and decode the artifact stored at `path`
pub fn read_artifact(
    storage: &dyn StorageClient,
    path: &str,
    retry: &RetryPolicy,
) -> Result<Artifact> {
    let bytes = retry.run("read artifact", |_| storage.get(path))?;
    decode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_table(rows: usize) -> Table {
        Table::new(vec![
            Column {
                name: "age".into(),
                data: ColumnData::Int64((0..rows as i64).collect()),
            },
            Column {
                name: "score".into(),
                data: ColumnData::Float64((0..rows).map(|i| i as f64 * 0.5).collect()),
            },
            Column {
                name: "segment".into(),
                data: ColumnData::Utf8((0..rows).map(|i| format!("s{}", i % 4)).collect()),
            },
        ])
        .unwrap()
    }

    #[test]
    fn test_table_rejects_ragged_columns() {
        let result = Table::new(vec![
            Column {
                name: "a".into(),
                data: ColumnData::Int64(vec![1, 2]),
            },
            Column {
                name: "b".into(),
                data: ColumnData::Bool(vec![true]),
            },
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_table_rejects_duplicate_columns() {
        let col = Column {
            name: "a".into(),
            data: ColumnData::Int64(vec![1]),
        };
        assert!(Table::new(vec![col.clone(), col]).is_err());
    }

    #[test]
    fn test_each_kind_decodes_to_input() {
        let artifacts = vec![
            Artifact::Tabular(sample_table(10)),
            Artifact::Model(ModelBlob {
                framework: "sklearn".into(),
                format: "joblib".into(),
                bytes: vec![7u8; 300],
            }),
            Artifact::Metadata(json!({"metrics": {"auc": 0.91}})),
        ];

        for artifact in artifacts {
            let bytes = encode(&artifact, &CompressionConfig::default()).unwrap();
            assert_eq!(decode(&bytes).unwrap(), artifact);
        }
    }

    #[test]
    fn test_large_bodies_are_compressed() {
        let artifact = Artifact::Tabular(sample_table(5_000));
        let plain = encode(&artifact, &CompressionConfig::none()).unwrap();
        let zstd = encode(&artifact, &CompressionConfig::default()).unwrap();
        let lz4 = encode(&artifact, &CompressionConfig::lz4()).unwrap();

        assert_eq!(plain[7], CompressionMethod::None as u8);
        assert_eq!(zstd[7], CompressionMethod::Zstd as u8);
        assert_eq!(lz4[7], CompressionMethod::Lz4 as u8);
        assert!(zstd.len() < plain.len());
        assert_eq!(decode(&zstd).unwrap(), artifact);
        assert_eq!(decode(&lz4).unwrap(), artifact);
    }

    #[test]
    fn test_small_bodies_stay_uncompressed() {
        let artifact = Artifact::Metadata(json!({"a": 1}));
        let bytes = encode(&artifact, &CompressionConfig::default()).unwrap();
        assert_eq!(bytes[7], CompressionMethod::None as u8);
    }

    #[test]
    fn test_truncated_artifact_is_rejected() {
        let bytes = encode(
            &Artifact::Tabular(sample_table(100)),
            &CompressionConfig::none(),
        )
        .unwrap();
        assert!(decode(&bytes[..bytes.len() - 1]).is_err());
        assert!(decode(&bytes[..10]).is_err());
    }

    #[test]
    fn test_corrupted_artifact_is_rejected() {
        let mut bytes = encode(
            &Artifact::Metadata(json!({"k": "value"})),
            &CompressionConfig::none(),
        )
        .unwrap();
        let last = bytes.len() - 2;
        bytes[last] ^= 0xFF;
        assert!(matches!(decode(&bytes), Err(RegistryError::Codec(_))));

        let mut bad_magic = encode(
            &Artifact::Metadata(json!(null)),
            &CompressionConfig::none(),
        )
        .unwrap();
        bad_magic[0] = b'X';
        assert!(decode(&bad_magic).is_err());
    }

    #[test]
    fn test_oversized_raw_length_is_rejected() {
        let table = Table::new(vec![Column {
            name: "x".into(),
            data: ColumnData::Int64(vec![7; 4096]),
        }])
        .unwrap();
        let artifact = Artifact::Tabular(table);

        for (compression, method) in [
            (CompressionConfig::default(), CompressionMethod::Zstd),
            (CompressionConfig::lz4(), CompressionMethod::Lz4),
            (CompressionConfig::none(), CompressionMethod::None),
        ] {
            let encoded = encode(&artifact, &compression).unwrap();
            assert_eq!(encoded[7], method as u8);

            for claimed in [u64::MAX, MAX_RAW_LEN + 1, 1 << 40] {
                let mut bytes = encoded.clone();
                bytes[16..24].copy_from_slice(&claimed.to_le_bytes());
                assert!(matches!(decode(&bytes), Err(RegistryError::Codec(_))));
            }

            // within bounds but wrong
            let mut bytes = encoded.clone();
            let raw_len = u64::from_le_bytes(bytes[16..24].try_into().unwrap());
            bytes[16..24].copy_from_slice(&(raw_len - 1).to_le_bytes());
            assert!(matches!(decode(&bytes), Err(RegistryError::Codec(_))));
        }
    }

    #[test]
    fn test_artifact_kind_strings() {
        for kind in [ArtifactKind::Tabular, ArtifactKind::Model, ArtifactKind::Metadata] {
            assert_eq!(kind.as_str().parse::<ArtifactKind>().unwrap(), kind);
            assert_eq!(ArtifactKind::from_u8(kind as u8), Some(kind));
        }
        assert!("image".parse::<ArtifactKind>().is_err());
    }
}
