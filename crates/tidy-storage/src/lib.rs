//! Report persistence for Tidy: the caller-owned key -> JSON metadata store.
//!
//! The engine never writes here; schedulers, the CLI and the admin endpoints
//! hand finished reports to a [`ReportSink`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tidy_core::{CleanupReport, Operation};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "tidy-storage";

pub const METADATA_TABLE: &str = "tidy_metadata";
const LATEST_FILE: &str = "latest.json";

/// A report as persisted: keyed by operation, stamped with the persist time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredReport {
    pub operation: Operation,
    pub recorded_at: DateTime<Utc>,
    pub report: CleanupReport,
}

impl StoredReport {
    pub fn new(operation: Operation, report: &CleanupReport) -> Self {
        Self {
            operation,
            recorded_at: Utc::now(),
            report: report.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("stored value under {key} is not a report: {source}")]
    Malformed {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

pub fn metadata_key(operation: Operation) -> String {
    format!("maintenance:{}", operation.as_key())
}

#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn persist(
        &self,
        operation: Operation,
        report: &CleanupReport,
    ) -> anyhow::Result<StoredReport>;

    async fn latest(&self, operation: Operation) -> anyhow::Result<Option<StoredReport>>;
}

/// In-process sink for single-node deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryReportSink {
    entries: Mutex<HashMap<Operation, StoredReport>>,
}

impl MemoryReportSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReportSink for MemoryReportSink {
    async fn persist(
        &self,
        operation: Operation,
        report: &CleanupReport,
    ) -> anyhow::Result<StoredReport> {
        let stored = StoredReport::new(operation, report);
        self.entries.lock().await.insert(operation, stored.clone());
        Ok(stored)
    }

    async fn latest(&self, operation: Operation) -> anyhow::Result<Option<StoredReport>> {
        Ok(self.entries.lock().await.get(&operation).cloned())
    }
}

/// Postgres-backed metadata table, one row per operation key.
#[derive(Debug, Clone)]
pub struct PgMetadataStore {
    pool: PgPool,
}

impl PgMetadataStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_table(&self) -> anyhow::Result<()> {
        sqlx::query(&create_table_sql())
            .execute(&self.pool)
            .await
            .with_context(|| format!("creating {METADATA_TABLE} table"))?;
        Ok(())
    }
}

fn create_table_sql() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {METADATA_TABLE} (
            key        TEXT PRIMARY KEY,
            value      JSONB NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )"
    )
}

fn upsert_sql() -> String {
    format!(
        "INSERT INTO {METADATA_TABLE} (key, value, updated_at)
         VALUES ($1, $2, $3)
         ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value,
                updated_at = EXCLUDED.updated_at"
    )
}

fn select_sql() -> String {
    format!("SELECT value FROM {METADATA_TABLE} WHERE key = $1")
}

#[async_trait]
impl ReportSink for PgMetadataStore {
    async fn persist(
        &self,
        operation: Operation,
        report: &CleanupReport,
    ) -> anyhow::Result<StoredReport> {
        let stored = StoredReport::new(operation, report);
        let key = metadata_key(operation);
        let value = serde_json::to_value(&stored).context("serializing cleanup report")?;
        sqlx::query(&upsert_sql())
            .bind(&key)
            .bind(&value)
            .bind(stored.recorded_at)
            .execute(&self.pool)
            .await
            .with_context(|| format!("writing metadata key {key}"))?;
        info!(%key, run_id = %report.run_id, "persisted cleanup report");
        Ok(stored)
    }

    async fn latest(&self, operation: Operation) -> anyhow::Result<Option<StoredReport>> {
        let key = metadata_key(operation);
        let row = sqlx::query(&select_sql())
            .bind(&key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("reading metadata key {key}"))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let value: serde_json::Value = row.try_get("value")?;
        let stored = serde_json::from_value(value)
            .map_err(|source| StorageError::Malformed { key, source })?;
        Ok(Some(stored))
    }
}

/// Immutable on-disk archive: every persisted report is written once under a
/// content-hash path, and `<operation>/latest.json` is atomically replaced.
#[derive(Debug, Clone)]
pub struct FsReportArchive {
    root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ArchivedReport {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub deduplicated: bool,
}

impl FsReportArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn report_relative_path(
        &self,
        recorded_at: DateTime<Utc>,
        operation: Operation,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = recorded_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(operation.as_key())
            .join(stamp)
            .join(format!("{content_hash}.json"))
    }

    fn latest_path(&self, operation: Operation) -> PathBuf {
        self.root.join(operation.as_key()).join(LATEST_FILE)
    }

    /// Write-once archive entry; identical content at the same second is deduplicated.
    pub async fn archive(&self, stored: &StoredReport) -> anyhow::Result<ArchivedReport> {
        let bytes = serde_json::to_vec_pretty(stored).context("serializing stored report")?;
        let content_hash = Self::sha256_hex(&bytes);
        let relative_path =
            self.report_relative_path(stored.recorded_at, stored.operation, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking report path {}", absolute_path.display()))?
        {
            return Ok(ArchivedReport {
                content_hash,
                relative_path,
                absolute_path,
                deduplicated: true,
            });
        }

        write_atomic(&absolute_path, &bytes).await?;
        Ok(ArchivedReport {
            content_hash,
            relative_path,
            absolute_path,
            deduplicated: false,
        })
    }
}

#[async_trait]
impl ReportSink for FsReportArchive {
    async fn persist(
        &self,
        operation: Operation,
        report: &CleanupReport,
    ) -> anyhow::Result<StoredReport> {
        let stored = StoredReport::new(operation, report);
        let archived = self.archive(&stored).await?;
        let bytes = serde_json::to_vec_pretty(&stored).context("serializing stored report")?;
        write_atomic(&self.latest_path(operation), &bytes).await?;
        info!(
            path = %archived.absolute_path.display(),
            run_id = %report.run_id,
            "archived cleanup report"
        );
        Ok(stored)
    }

    async fn latest(&self, operation: Operation) -> anyhow::Result<Option<StoredReport>> {
        let path = self.latest_path(operation);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let stored = serde_json::from_str(&text).map_err(|source| StorageError::Malformed {
            key: path.display().to_string(),
            source,
        })?;
        Ok(Some(stored))
    }
}

/// Temp-file write followed by rename, so readers never see a partial file.
async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("report path {} has no parent", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating report directory {}", parent.display()))?;

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("report");
    let staging = parent.join(format!(".{file_name}.{}.partial", Uuid::new_v4().simple()));

    let staged = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&staging)
            .await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        fs::rename(&staging, path).await
    }
    .await;

    if let Err(err) = staged {
        let _ = fs::remove_file(&staging).await;
        return Err(err).with_context(|| {
            format!(
                "writing report {} via {}",
                path.display(),
                staging.display()
            )
        });
    }
    Ok(())
}
