//! Artifact persistence - append-only JSON lines, one file per record kind.
//!
//! ```text
//! <dir>/addresses.jsonl   GeneratedAddress records
//! <dir>/payments.jsonl    PaymentRecord per broadcast transaction
//! <dir>/summaries.jsonl   RunSummary per funding run
//! ```

use crate::core::defaults::artifacts;
use crate::core::GeneratedAddress;
use crate::funding::{PaymentRecord, RunSummary};
use serde::Serialize;
use serde_json::{json, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Artifact I/O at {path}: {reason}")]
    Io { path: String, reason: String },
    #[error("Artifact encoding: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ArtifactRecord {
    Address(GeneratedAddress),
    Payment(PaymentRecord),
    Summary(RunSummary),
}

impl ArtifactRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            ArtifactRecord::Address(_) => artifacts::ADDRESSES,
            ArtifactRecord::Payment(_) => artifacts::PAYMENTS,
            ArtifactRecord::Summary(_) => artifacts::SUMMARIES,
        }
    }

    /// Record body with its kind and write time.
    pub fn to_json(&self) -> Result<Value, ArtifactError> {
        let body = serde_json::to_value(self).map_err(|e| ArtifactError::Encode(e.to_string()))?;
        Ok(json!({
            "kind": self.kind(),
            "recorded_at": chrono::Utc::now().to_rfc3339(),
            "record": body,
        }))
    }
}

/// Write-only sink for run artifacts. No read-back.
pub trait ArtifactStore: Send + Sync {
    fn write_record(&self, record: &ArtifactRecord) -> Result<(), ArtifactError>;
}

pub struct JsonArtifactStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl JsonArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), lock: Mutex::new(()) }
    }

    pub fn path_for(&self, kind: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", kind))
    }
}

impl ArtifactStore for JsonArtifactStore {
    fn write_record(&self, record: &ArtifactRecord) -> Result<(), ArtifactError> {
        let line = serde_json::to_string(&record.to_json()?).map_err(|e| ArtifactError::Encode(e.to_string()))?;
        let path = self.path_for(record.kind());
        let io_err = |e: std::io::Error| ArtifactError::Io { path: path.display().to_string(), reason: e.to_string() };

        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        std::fs::create_dir_all(&self.dir).map_err(io_err)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&path).map_err(io_err)?;
        writeln!(file, "{}", line).map_err(io_err)
    }
}

/// Keeps records in memory; used when no artifact directory is wanted.
#[derive(Default)]
pub struct MemoryArtifactStore {
    records: Mutex<Vec<Value>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Value> {
        self.records.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn records_of(&self, kind: &str) -> Vec<Value> {
        self.records().into_iter().filter(|r| r["kind"] == kind).collect()
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn write_record(&self, record: &ArtifactRecord) -> Result<(), ArtifactError> {
        let value = record.to_json()?;
        self.records.lock().unwrap_or_else(|p| p.into_inner()).push(value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn address(index: u32) -> GeneratedAddress {
        GeneratedAddress {
            index,
            address: format!("tb1qexample{}", index),
            public_key: "02ab".into(),
            private_key: None,
            wif: Some("cW...".into()),
            network: "testnet".into(),
        }
    }

    #[test]
    fn test_appends_json_lines_per_kind() {
        let dir = TempDir::new().expect("tempdir");
        let store = JsonArtifactStore::new(dir.path().join("nested"));
        store.write_record(&ArtifactRecord::Address(address(1))).expect("write");
        store.write_record(&ArtifactRecord::Address(address(2))).expect("write");

        let content = std::fs::read_to_string(store.path_for("addresses")).expect("read");
        let lines: Vec<Value> = content.lines().map(|l| serde_json::from_str(l).expect("json")).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "addresses");
        assert_eq!(lines[1]["record"]["index"], 2);
        assert!(lines[0]["recorded_at"].as_str().is_some());
        assert!(!store.path_for("payments").exists());
    }

    #[test]
    fn test_memory_store_filters_by_kind() {
        let store = MemoryArtifactStore::new();
        store.write_record(&ArtifactRecord::Address(address(1))).unwrap();
        store.write_record(&ArtifactRecord::Summary(RunSummary::new("w", "tb1q", 0))).unwrap();
        assert_eq!(store.records_of("addresses").len(), 1);
        assert_eq!(store.records_of("summaries").len(), 1);
    }
}
