//! Remote artifact store client
//!
//! 制品仓库是外部协作方：版本化的文件集合，文件本身通过预签名 URL 以普通 HTTP 传输。
//! 编排核心只依赖 [`ArtifactStore`] trait，默认实现为 [`HttpArtifactStore`]。

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

pub use http::HttpArtifactStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Store call '{function}' returned {status}: {body}")]
    Status {
        function: String,
        status: u16,
        body: String,
    },

    #[error("Failed to decode '{function}' response: {reason}")]
    Decode { function: String, reason: String },

    #[error("Store error: {0}")]
    Rpc(String),
}

/// Identifies a versioned object collection in the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactHandle {
    pub id: String,
    #[serde(default)]
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateArtifact {
    pub alias: String,
    pub manifest: Manifest,
    /// 以 staged 状态创建，commit 之前对其他读者不可见
    pub stage: bool,
}

impl CreateArtifact {
    pub fn staged(alias: impl Into<String>, description: impl Into<String>) -> Self {
        let alias = alias.into();
        Self {
            manifest: Manifest {
                name: alias.clone(),
                description: description.into(),
            },
            alias,
            stage: true,
        }
    }
}

/// Result of reading an artifact: a missing artifact is a normal outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactLookup {
    Found(ArtifactHandle),
    Absent,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn create(&self, request: &CreateArtifact) -> Result<ArtifactHandle, StoreError>;

    async fn read(&self, artifact_id: &str) -> Result<ArtifactLookup, StoreError>;

    /// Open a new staged version of an existing artifact.
    async fn edit(
        &self,
        artifact_id: &str,
        stage: bool,
        version: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn commit(&self, artifact_id: &str) -> Result<(), StoreError>;

    /// Raw listing entries; their shape varies between store versions.
    async fn list_files(&self, artifact_id: &str) -> Result<Vec<serde_json::Value>, StoreError>;

    /// Time-limited download URL for one file.
    async fn get_file(&self, artifact_id: &str, file_path: &str) -> Result<String, StoreError>;

    /// Time-limited upload URL for one file.
    async fn put_file(&self, artifact_id: &str, file_path: &str) -> Result<String, StoreError>;

    /// Public URL of a published artifact, if the store exposes one.
    fn artifact_url(&self, alias: &str) -> Option<String>;
}

pub type SharedStore = Arc<dyn ArtifactStore>;
