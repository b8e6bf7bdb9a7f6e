//! Shared fixtures: an in-process artifact store and temp sandboxes.
//!
//! The fake store keeps artifacts in memory and hands out "presigned" URLs that
//! point at a throwaway axum server bound to an ephemeral port.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    routing::get,
    Router,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use sandbox_compiler::config::{ServiceConfig, WorkflowConfig};
use sandbox_compiler::sandbox::LocalSandbox;
use sandbox_compiler::server::ServiceContext;
use sandbox_compiler::store::{
    ArtifactHandle, ArtifactLookup, ArtifactStore, CreateArtifact, StoreError,
};

/// Shape of the entries returned by `list_files`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ListingStyle {
    /// `{"name": .., "type": "file" | "directory"}` including directory entries
    #[default]
    Named,
    /// `{"key": ..}` only
    KeyOnly,
}

#[derive(Default)]
struct FakeArtifact {
    alias: Option<String>,
    staged: BTreeMap<String, Vec<u8>>,
    committed: BTreeMap<String, Vec<u8>>,
    /// listed but never uploaded
    phantoms: Vec<String>,
    commits: usize,
    edits: usize,
}

#[derive(Default)]
struct StoreState {
    artifacts: HashMap<String, FakeArtifact>,
    next_id: usize,
    listing_style: ListingStyle,
    content_types: HashMap<(String, String), String>,
    /// upload keys answered with 500
    rejected_uploads: Vec<String>,
}

impl StoreState {
    fn resolve(&self, artifact_id: &str) -> Option<String> {
        if self.artifacts.contains_key(artifact_id) {
            return Some(artifact_id.to_string());
        }
        self.artifacts
            .iter()
            .find(|(_, a)| a.alias.as_deref() == Some(artifact_id))
            .map(|(id, _)| id.clone())
    }
}

type SharedState = Arc<Mutex<StoreState>>;

pub struct FakeStore {
    state: SharedState,
    base_url: String,
}

impl FakeStore {
    pub async fn start() -> Arc<Self> {
        let state = SharedState::default();
        let app = Router::new()
            .route("/files/:id/*path", get(download).put(upload))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Arc::new(Self {
            state,
            base_url: format!("http://{}", addr),
        })
    }

    /// Create a committed artifact holding `files`. Returns its id.
    pub fn seed(&self, alias: &str, files: &[(&str, &str)]) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("art-{}", state.next_id);
        let committed = files
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect();
        state.artifacts.insert(
            id.clone(),
            FakeArtifact {
                alias: Some(alias.to_string()),
                committed,
                commits: 1,
                ..Default::default()
            },
        );
        id
    }

    pub fn set_listing_style(&self, style: ListingStyle) {
        self.state.lock().unwrap().listing_style = style;
    }

    /// List `path` for `artifact_id` without storing any content for it.
    pub fn add_phantom(&self, artifact_id: &str, path: &str) {
        let mut state = self.state.lock().unwrap();
        let id = state.resolve(artifact_id).unwrap();
        state
            .artifacts
            .get_mut(&id)
            .unwrap()
            .phantoms
            .push(path.to_string());
    }

    /// Make every later PUT of `path` fail with a server error.
    pub fn reject_upload(&self, path: &str) {
        self.state
            .lock()
            .unwrap()
            .rejected_uploads
            .push(path.to_string());
    }

    pub fn aliases(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut aliases: Vec<String> = state
            .artifacts
            .values()
            .filter_map(|a| a.alias.clone())
            .collect();
        aliases.sort();
        aliases
    }

    pub fn exists(&self, artifact_id: &str) -> bool {
        self.state.lock().unwrap().resolve(artifact_id).is_some()
    }

    pub fn commits(&self, artifact_id: &str) -> usize {
        self.with_artifact(artifact_id, |a| a.commits)
    }

    pub fn edits(&self, artifact_id: &str) -> usize {
        self.with_artifact(artifact_id, |a| a.edits)
    }

    pub fn committed_files(&self, artifact_id: &str) -> BTreeMap<String, String> {
        self.with_artifact(artifact_id, |a| {
            a.committed
                .iter()
                .map(|(k, v)| (k.clone(), String::from_utf8_lossy(v).into_owned()))
                .collect()
        })
    }

    pub fn content_type(&self, artifact_id: &str, path: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        let id = state.resolve(artifact_id)?;
        state
            .content_types
            .get(&(id, path.to_string()))
            .cloned()
    }

    fn with_artifact<T>(&self, artifact_id: &str, f: impl FnOnce(&FakeArtifact) -> T) -> T {
        let state = self.state.lock().unwrap();
        let id = state
            .resolve(artifact_id)
            .unwrap_or_else(|| panic!("no artifact {}", artifact_id));
        f(&state.artifacts[&id])
    }

    fn file_url(&self, id: &str, path: &str) -> String {
        format!("{}/files/{}/{}", self.base_url, id, path.trim_start_matches('/'))
    }
}

async fn download(
    State(state): State<SharedState>,
    Path((id, path)): Path<(String, String)>,
) -> Result<Vec<u8>, StatusCode> {
    let state = state.lock().unwrap();
    let artifact = state.artifacts.get(&id).ok_or(StatusCode::NOT_FOUND)?;
    artifact
        .committed
        .get(&path)
        .or_else(|| artifact.staged.get(&path))
        .cloned()
        .ok_or(StatusCode::NOT_FOUND)
}

async fn upload(
    State(state): State<SharedState>,
    Path((id, path)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let mut state = state.lock().unwrap();
    if state.rejected_uploads.contains(&path) {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    let Some(artifact) = state.artifacts.get_mut(&id) else {
        return StatusCode::NOT_FOUND;
    };
    artifact.staged.insert(path.clone(), body.to_vec());
    if let Some(ct) = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        let ct = ct.to_string();
        state.content_types.insert((id, path), ct);
    }
    StatusCode::OK
}

fn not_found(artifact_id: &str) -> StoreError {
    StoreError::Rpc(format!("Artifact {} does not exist", artifact_id))
}

#[async_trait]
impl ArtifactStore for FakeStore {
    async fn create(&self, request: &CreateArtifact) -> Result<ArtifactHandle, StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.resolve(&request.alias).is_some() {
            return Err(StoreError::Rpc(format!(
                "Artifact {} already exists",
                request.alias
            )));
        }
        state.next_id += 1;
        let id = format!("art-{}", state.next_id);
        state.artifacts.insert(
            id.clone(),
            FakeArtifact {
                alias: Some(request.alias.clone()),
                ..Default::default()
            },
        );
        Ok(ArtifactHandle {
            id,
            alias: Some(request.alias.clone()),
        })
    }

    async fn read(&self, artifact_id: &str) -> Result<ArtifactLookup, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(match state.resolve(artifact_id) {
            Some(id) => ArtifactLookup::Found(ArtifactHandle {
                alias: state.artifacts[&id].alias.clone(),
                id,
            }),
            None => ArtifactLookup::Absent,
        })
    }

    async fn edit(
        &self,
        artifact_id: &str,
        _stage: bool,
        _version: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let id = state.resolve(artifact_id).ok_or_else(|| not_found(artifact_id))?;
        let artifact = state.artifacts.get_mut(&id).unwrap();
        artifact.staged.clear();
        artifact.edits += 1;
        Ok(())
    }

    async fn commit(&self, artifact_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let id = state.resolve(artifact_id).ok_or_else(|| not_found(artifact_id))?;
        let artifact = state.artifacts.get_mut(&id).unwrap();
        artifact.committed = std::mem::take(&mut artifact.staged);
        artifact.commits += 1;
        Ok(())
    }

    async fn list_files(&self, artifact_id: &str) -> Result<Vec<Value>, StoreError> {
        let state = self.state.lock().unwrap();
        let id = state.resolve(artifact_id).ok_or_else(|| not_found(artifact_id))?;
        let artifact = &state.artifacts[&id];
        let paths = artifact.committed.keys().chain(artifact.phantoms.iter());

        Ok(match state.listing_style {
            ListingStyle::Named => {
                let mut entries: Vec<Value> = Vec::new();
                let mut dirs: Vec<&str> = Vec::new();
                for path in paths {
                    if let Some((dir, _)) = path.split_once('/') {
                        if !dirs.contains(&dir) {
                            dirs.push(dir);
                            entries.push(json!({"name": dir, "type": "directory"}));
                        }
                    }
                    entries.push(json!({"name": path, "type": "file"}));
                }
                entries
            }
            ListingStyle::KeyOnly => paths.map(|p| json!({ "key": p })).collect(),
        })
    }

    async fn get_file(&self, artifact_id: &str, file_path: &str) -> Result<String, StoreError> {
        let state = self.state.lock().unwrap();
        let id = state.resolve(artifact_id).ok_or_else(|| not_found(artifact_id))?;
        Ok(self.file_url(&id, file_path))
    }

    async fn put_file(&self, artifact_id: &str, file_path: &str) -> Result<String, StoreError> {
        let state = self.state.lock().unwrap();
        let id = state.resolve(artifact_id).ok_or_else(|| not_found(artifact_id))?;
        Ok(self.file_url(&id, file_path))
    }

    fn artifact_url(&self, alias: &str) -> Option<String> {
        Some(format!("http://fake-store/artifacts/{}", alias))
    }
}

pub fn temp_sandbox() -> (TempDir, Arc<LocalSandbox>) {
    let dir = TempDir::new().unwrap();
    let sandbox = LocalSandbox::new(dir.path().join("sandbox")).unwrap();
    (dir, Arc::new(sandbox))
}

/// Service context over a temp sandbox and `store`.
pub fn service_context(store: Arc<FakeStore>, workflow: WorkflowConfig) -> (TempDir, ServiceContext) {
    let (dir, sandbox) = temp_sandbox();
    let config = ServiceConfig {
        workflow,
        ..ServiceConfig::default()
    };
    let ctx = ServiceContext::new(config, sandbox, store, reqwest::Client::new());
    (dir, ctx)
}

/// Workflow config whose commands are plain `sh` scripts, so tests need no node toolchain.
pub fn sh_workflow(install: &str, build: &str, start: &str) -> WorkflowConfig {
    let sh = |script: &str| {
        if script.is_empty() {
            Vec::new()
        } else {
            vec!["sh".to_string(), "-c".to_string(), script.to_string()]
        }
    };
    WorkflowConfig {
        install: sh(install),
        build: sh(build),
        start: sh(start),
        readiness_timeout_ms: 3_000,
        ..WorkflowConfig::default()
    }
}
