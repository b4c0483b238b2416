//! Backend transport for the import workflow: existing-data fetch, chunked
//! bulk upsert, and the immutable vault for uploaded sheet bytes.
//!
//! The bulk-upsert endpoints are an external collaborator with a fixed
//! contract (accept arrays of records plus a lookup field, return
//! created/updated counts); nothing here knows or cares how they are
//! implemented.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cir-backend";

/// Chunk size for bulk upserts. Exists to stay under the transport payload
/// limit, not for throughput.
pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_LOOKUP_FIELD: &str = "external_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    Accounts,
    Contacts,
    Estimates,
    Jobsites,
}

impl Entity {
    pub fn plural(&self) -> &'static str {
        match self {
            Entity::Accounts => "accounts",
            Entity::Contacts => "contacts",
            Entity::Estimates => "estimates",
            Entity::Jobsites => "jobsites",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpsertResponse {
    pub success: bool,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub updated: u64,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchResponse {
    pub success: bool,
    #[serde(default)]
    pub data: Vec<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("backend rejected {entity} request: {message}")]
    Rejected {
        entity: &'static str,
        message: String,
    },
}

/// Seam for the external backend. The HTTP implementation below is the real
/// one; tests substitute their own.
#[async_trait]
pub trait BackendApi: Send + Sync {
    async fn fetch_existing(&self, entity: Entity) -> Result<Vec<Value>, BackendError>;

    async fn bulk_upsert(
        &self,
        entity: Entity,
        records: &[Value],
        lookup_field: &str,
    ) -> Result<UpsertResponse, BackendError>;
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: String,
}

impl BackendConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("CIR_BACKEND_URL")
                .unwrap_or_else(|_| "http://localhost:8787/api".to_string()),
            timeout: Duration::from_secs(
                std::env::var("CIR_HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            ),
            user_agent: std::env::var("CIR_USER_AGENT")
                .unwrap_or_else(|_| "cir-import/0.1".to_string()),
        }
    }
}

#[derive(Debug)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(config: BackendConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .context("building http client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Self::new(BackendConfig::from_env())
    }

    fn endpoint(&self, entity: Entity) -> String {
        format!("{}/{}", self.base_url, entity.plural())
    }
}

#[async_trait]
impl BackendApi for HttpBackend {
    async fn fetch_existing(&self, entity: Entity) -> Result<Vec<Value>, BackendError> {
        let url = self.endpoint(entity);
        let span = info_span!("fetch_existing", entity = entity.plural(), %url);
        let _guard = span.enter();

        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BackendError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        let body: FetchResponse = resp.json().await?;
        if !body.success {
            return Err(BackendError::Rejected {
                entity: entity.plural(),
                message: body.error.unwrap_or_else(|| "unspecified error".to_string()),
            });
        }
        Ok(body.data)
    }

    async fn bulk_upsert(
        &self,
        entity: Entity,
        records: &[Value],
        lookup_field: &str,
    ) -> Result<UpsertResponse, BackendError> {
        let url = self.endpoint(entity);
        let span = info_span!("bulk_upsert", entity = entity.plural(), records = records.len());
        let _guard = span.enter();

        let mut data = serde_json::Map::new();
        data.insert(entity.plural().to_string(), Value::Array(records.to_vec()));
        data.insert(
            "lookupField".to_string(),
            Value::String(lookup_field.to_string()),
        );
        let body = serde_json::json!({
            "action": "bulk_upsert",
            "data": data,
        });

        let resp = self.client.post(&url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BackendError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        Ok(resp.json().await?)
    }
}

// --- bulk push ----------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityPush {
    pub total: usize,
    pub pushed: usize,
    pub created: u64,
    pub updated: u64,
    pub failed_records: usize,
    pub failed_chunks: usize,
}

/// Result of pushing a whole import. `success` reflects that the push ran to
/// completion; partial failures land in `errors` and the per-entity counters,
/// never in an abort.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportOutcome {
    pub success: bool,
    pub entities: BTreeMap<String, EntityPush>,
    pub errors: Vec<String>,
}

/// Push each entity's records in sequential chunks. A failed chunk is counted
/// and reported, then the loop moves on; there is no retry.
pub async fn push_import(
    api: &dyn BackendApi,
    batches: &[(Entity, Vec<Value>)],
    batch_size: usize,
) -> ImportOutcome {
    let batch_size = batch_size.max(1);
    let mut outcome = ImportOutcome {
        success: true,
        ..Default::default()
    };

    for (entity, records) in batches {
        let mut push = EntityPush {
            total: records.len(),
            ..Default::default()
        };
        for chunk in records.chunks(batch_size) {
            match api.bulk_upsert(*entity, chunk, DEFAULT_LOOKUP_FIELD).await {
                Ok(resp) if resp.success => {
                    push.pushed += chunk.len();
                    push.created += resp.created;
                    push.updated += resp.updated;
                }
                Ok(resp) => {
                    let message = resp
                        .error
                        .unwrap_or_else(|| "backend reported failure".to_string());
                    warn!(entity = entity.plural(), %message, "bulk upsert chunk rejected");
                    push.failed_chunks += 1;
                    push.failed_records += chunk.len();
                    outcome.errors.push(format!(
                        "{}: {} records not imported: {message}",
                        entity.plural(),
                        chunk.len()
                    ));
                }
                Err(err) => {
                    warn!(entity = entity.plural(), "bulk upsert chunk failed: {err}");
                    push.failed_chunks += 1;
                    push.failed_records += chunk.len();
                    outcome.errors.push(format!(
                        "{}: {} records not imported: {err}",
                        entity.plural(),
                        chunk.len()
                    ));
                }
            }
        }
        outcome.entities.insert(entity.plural().to_string(), push);
    }

    outcome
}

// --- sheet vault --------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StoredSheet {
    pub sha256: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub already_present: bool,
}

/// Content-addressed audit storage for uploaded sheet files. Writes are
/// atomic (temp file + rename); re-storing identical bytes on the same day is
/// a no-op.
#[derive(Debug, Clone)]
pub struct SheetVault {
    root: PathBuf,
}

impl SheetVault {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn digest(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn relative_path(
        label: &str,
        received_at: DateTime<Utc>,
        digest: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        let stamp = received_at.format("%Y%m%d").to_string();
        PathBuf::from(label).join(format!("{stamp}_{digest}.{ext}"))
    }

    pub async fn store(
        &self,
        label: &str,
        received_at: DateTime<Utc>,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredSheet> {
        let sha256 = Self::digest(bytes);
        let relative_path = Self::relative_path(label, received_at, &sha256, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .context("vault path always has a parent")?
            .to_path_buf();

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating vault directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking {}", absolute_path.display()))?
        {
            return Ok(StoredSheet {
                sha256,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                already_present: true,
            });
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredSheet {
                sha256,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                already_present: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredSheet {
                    sha256,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    already_present: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!("storing sheet at {}", absolute_path.display())
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Fails every call whose 1-based index appears in `fail_calls`.
    struct ScriptedBackend {
        calls: AtomicUsize,
        fail_calls: Vec<usize>,
        reject_calls: Vec<usize>,
    }

    impl ScriptedBackend {
        fn new(fail_calls: Vec<usize>, reject_calls: Vec<usize>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_calls,
                reject_calls,
            }
        }
    }

    #[async_trait]
    impl BackendApi for ScriptedBackend {
        async fn fetch_existing(&self, _entity: Entity) -> Result<Vec<Value>, BackendError> {
            Ok(Vec::new())
        }

        async fn bulk_upsert(
            &self,
            entity: Entity,
            records: &[Value],
            _lookup_field: &str,
        ) -> Result<UpsertResponse, BackendError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_calls.contains(&call) {
                return Err(BackendError::Rejected {
                    entity: entity.plural(),
                    message: "boom".to_string(),
                });
            }
            if self.reject_calls.contains(&call) {
                return Ok(UpsertResponse {
                    success: false,
                    error: Some("lookup field missing".to_string()),
                    ..Default::default()
                });
            }
            Ok(UpsertResponse {
                success: true,
                created: records.len() as u64,
                updated: 0,
                total: records.len() as u64,
                error: None,
            })
        }
    }

    fn records(n: usize) -> Vec<Value> {
        (0..n)
            .map(|i| serde_json::json!({ "external_id": format!("r{i}") }))
            .collect()
    }

    #[tokio::test]
    async fn push_chunks_at_batch_size() {
        let api = ScriptedBackend::new(vec![], vec![]);
        let outcome =
            push_import(&api, &[(Entity::Contacts, records(1205))], 500).await;
        assert!(outcome.success);
        assert!(outcome.errors.is_empty());
        let push = &outcome.entities["contacts"];
        assert_eq!(push.total, 1205);
        assert_eq!(push.pushed, 1205);
        assert_eq!(push.created, 1205);
        assert_eq!(api.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failed_chunk_is_counted_and_loop_continues() {
        let api = ScriptedBackend::new(vec![2], vec![]);
        let outcome =
            push_import(&api, &[(Entity::Estimates, records(1205))], 500).await;
        // chunk sizes 500/500/205; the middle one fails
        let push = &outcome.entities["estimates"];
        assert_eq!(push.pushed, 705);
        assert_eq!(push.failed_records, 500);
        assert_eq!(push.failed_chunks, 1);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.success);
        assert_eq!(api.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rejected_response_reports_backend_message() {
        let api = ScriptedBackend::new(vec![], vec![1]);
        let outcome = push_import(&api, &[(Entity::Accounts, records(10))], 500).await;
        let push = &outcome.entities["accounts"];
        assert_eq!(push.failed_records, 10);
        assert!(outcome.errors[0].contains("lookup field missing"));
    }

    #[tokio::test]
    async fn vault_store_is_idempotent_per_content() {
        let dir = tempdir().expect("tempdir");
        let vault = SheetVault::new(dir.path());
        let received = DateTime::parse_from_rfc3339("2026-08-01T09:30:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = vault
            .store("contacts", received, "csv", b"Contact ID,Name\nC1,Jane\n")
            .await
            .expect("first store");
        let second = vault
            .store("contacts", received, "csv", b"Contact ID,Name\nC1,Jane\n")
            .await
            .expect("second store");

        assert!(!first.already_present);
        assert!(second.already_present);
        assert_eq!(first.sha256, second.sha256);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
    }
}
