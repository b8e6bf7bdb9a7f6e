//! Artifact gateway: materialize (store → sandbox) and persist (sandbox → store).
//!
//! 文件逐个顺序传输。下载失败会中止整个 materialize（制品不完整不能被静默接受），
//! 上传失败会在 commit 之前中止 persist，未 commit 的 staged 版本对读者不可见。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::mirror::{self, collect_tree, is_mirrorable, relativize, store_to_sandbox};
use crate::sandbox::{Sandbox, SandboxError};
use crate::store::{ArtifactHandle, ArtifactLookup, ArtifactStore, CreateArtifact, StoreError};

pub const PUBLISH_DESCRIPTION: &str = "Build output from the sandbox compilation service";

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Transfer of '{path}' failed: {reason}")]
    Transfer { path: String, reason: String },
}

/// Canonical listing entry, decoded once at the store boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub path: String,
    pub is_file: bool,
}

/// Listing shapes seen from the store, tried in this order.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ListingEntry {
    Bare(String),
    Named {
        name: String,
        #[serde(rename = "type", default)]
        kind: Option<String>,
    },
    Pathed {
        path: String,
        #[serde(rename = "type", default)]
        kind: Option<String>,
    },
    Keyed {
        key: String,
        #[serde(rename = "type", default)]
        kind: Option<String>,
    },
}

impl From<ListingEntry> for FileDescriptor {
    fn from(entry: ListingEntry) -> Self {
        let (path, kind) = match entry {
            ListingEntry::Bare(path) => (path, None),
            ListingEntry::Named { name, kind } => (name, kind),
            ListingEntry::Pathed { path, kind } => (path, kind),
            ListingEntry::Keyed { key, kind } => (key, kind),
        };
        FileDescriptor {
            path,
            // 未标注类型的条目视为文件
            is_file: matches!(kind.as_deref(), None | Some("file")),
        }
    }
}

/// Decode raw listing values; entries of unknown shape are logged and dropped.
pub fn decode_listing(entries: &[Value]) -> Vec<FileDescriptor> {
    entries
        .iter()
        .filter_map(|value| match ListingEntry::deserialize(value) {
            Ok(entry) => Some(FileDescriptor::from(entry)),
            Err(_) => {
                warn!("Unknown listing entry format: {}", value);
                None
            }
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MaterializeReport {
    pub artifact_id: String,
    pub files_loaded: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistReport {
    pub artifact_id: String,
    pub files_published: usize,
}

pub struct ArtifactGateway {
    store: Arc<dyn ArtifactStore>,
    http: reqwest::Client,
}

impl ArtifactGateway {
    pub fn new(store: Arc<dyn ArtifactStore>, http: reqwest::Client) -> Self {
        Self { store, http }
    }

    /// Copy every file of `artifact_id` into the sandbox under `target_dir`.
    #[instrument(skip(self, sandbox))]
    pub async fn materialize(
        &self,
        sandbox: &dyn Sandbox,
        artifact_id: &str,
        target_dir: &str,
    ) -> Result<MaterializeReport, GatewayError> {
        let handle = match self.store.read(artifact_id).await? {
            ArtifactLookup::Found(handle) => handle,
            ArtifactLookup::Absent => {
                return Err(GatewayError::ArtifactNotFound(artifact_id.to_string()))
            }
        };

        let listing = decode_listing(&self.store.list_files(artifact_id).await?);
        info!("Found {} entries in artifact {}", listing.len(), artifact_id);

        let mut loaded = 0;
        for file in listing {
            if !file.is_file {
                debug!(path = %file.path, "Skipping non-file entry");
                continue;
            }
            if !is_mirrorable(&file.path) {
                debug!(path = %file.path, "Skipping excluded entry");
                continue;
            }

            debug!(path = %file.path, "Downloading");
            let url = self.store.get_file(artifact_id, &file.path).await?;
            let content = self.download(&file.path, &url).await?;
            let sandbox_path = store_to_sandbox(&file.path, target_dir);
            mirror::write_entry(sandbox, &sandbox_path, &content).await?;
            loaded += 1;
        }

        info!("Artifact {} loaded: {} files", artifact_id, loaded);
        Ok(MaterializeReport {
            artifact_id: handle.id,
            files_loaded: loaded,
        })
    }

    /// Upload every mirrorable file under `source_dir` into `artifact_id` and commit.
    ///
    /// An existing artifact gets a new staged version; a missing one is created staged.
    #[instrument(skip(self, sandbox))]
    pub async fn persist(
        &self,
        sandbox: &dyn Sandbox,
        source_dir: &str,
        artifact_id: &str,
        target_dir: &str,
    ) -> Result<PersistReport, GatewayError> {
        let files = collect_tree(sandbox, source_dir).await?;
        let artifact = self.open_for_staging(artifact_id).await?;

        let uploads = files
            .into_iter()
            .map(|(path, content)| (relativize(&path, source_dir, target_dir), content));
        let published = self.upload_files(&artifact.id, uploads).await?;
        self.store.commit(&artifact.id).await?;

        info!("Published {} files to artifact {}", published, artifact.id);
        Ok(PersistReport {
            artifact_id: artifact.id,
            files_published: published,
        })
    }

    async fn open_for_staging(&self, artifact_id: &str) -> Result<ArtifactHandle, GatewayError> {
        match self.store.read(artifact_id).await? {
            ArtifactLookup::Found(handle) => {
                self.store.edit(&handle.id, true, Some("new")).await?;
                Ok(handle)
            }
            ArtifactLookup::Absent => {
                info!("Artifact {} not found, creating it", artifact_id);
                self.create_staged(artifact_id, PUBLISH_DESCRIPTION).await
            }
        }
    }

    pub async fn create_staged(
        &self,
        alias: &str,
        description: &str,
    ) -> Result<ArtifactHandle, GatewayError> {
        Ok(self
            .store
            .create(&CreateArtifact::staged(alias, description))
            .await?)
    }

    /// Upload `(store key, content)` pairs one after another. Stops at the first failure.
    pub async fn upload_files<I>(&self, artifact_id: &str, files: I) -> Result<usize, GatewayError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut uploaded = 0;
        for (key, content) in files {
            debug!(key = %key, "Uploading");
            let url = self.store.put_file(artifact_id, &key).await?;
            self.upload(&key, &url, content).await?;
            uploaded += 1;
        }
        Ok(uploaded)
    }

    pub async fn commit(&self, artifact_id: &str) -> Result<(), GatewayError> {
        Ok(self.store.commit(artifact_id).await?)
    }

    pub fn artifact_url(&self, alias: &str) -> Option<String> {
        self.store.artifact_url(alias)
    }

    async fn download(&self, path: &str, url: &str) -> Result<Vec<u8>, GatewayError> {
        let transfer = |reason: String| GatewayError::Transfer {
            path: path.to_string(),
            reason,
        };
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| transfer(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(transfer(format!("GET returned {}", status)));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| transfer(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn upload(&self, key: &str, url: &str, content: String) -> Result<(), GatewayError> {
        let transfer = |reason: String| GatewayError::Transfer {
            path: key.to_string(),
            reason,
        };
        let content_type = mime_guess::from_path(key)
            .first_raw()
            .unwrap_or("text/plain");
        let response = self
            .http
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(content)
            .send()
            .await
            .map_err(|e| transfer(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(transfer(format!("PUT returned {}", status)));
        }
        Ok(())
    }
}
