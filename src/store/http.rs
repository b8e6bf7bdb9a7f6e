use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, instrument};

use super::{ArtifactHandle, ArtifactLookup, ArtifactStore, CreateArtifact, StoreError};
use crate::config::StoreSection;

/// Artifact store reached through the coordination server's HTTP service gateway:
/// `POST {server_url}/{workspace}/services/{service_id}/{function}` with keyword
/// arguments as the JSON body.
pub struct HttpArtifactStore {
    client: reqwest::Client,
    service_url: String,
    artifacts_url: String,
    token: Option<String>,
}

impl HttpArtifactStore {
    pub fn new(config: &StoreSection) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: reqwest::Client, config: &StoreSection) -> Self {
        let server = config.server_url.trim_end_matches('/');
        Self {
            client,
            service_url: format!(
                "{}/{}/services/{}",
                server, config.workspace, config.service_id
            ),
            artifacts_url: format!("{}/{}/artifacts", server, config.workspace),
            token: config.token.clone(),
        }
    }

    /// 供预签名 URL 传输复用的 HTTP 客户端
    pub fn client(&self) -> reqwest::Client {
        self.client.clone()
    }

    #[instrument(skip(self, kwargs))]
    async fn call<T: DeserializeOwned>(&self, function: &str, kwargs: Value) -> Result<T, StoreError> {
        let url = format!("{}/{}", self.service_url, function);
        let mut request = self.client.post(&url).json(&kwargs);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        debug!(status = status.as_u16(), bytes = body.len(), "Store call finished");

        if !status.is_success() {
            return Err(StoreError::Status {
                function: function.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let value: Value = serde_json::from_str(&body).map_err(|e| StoreError::Decode {
            function: function.to_string(),
            reason: e.to_string(),
        })?;
        // 服务网关在 200 响应里也可能返回 {"success": false, "detail": ...}
        if value.get("success") == Some(&Value::Bool(false)) {
            let detail = value
                .get("detail")
                .map(|d| match d {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_else(|| body.clone());
            return Err(StoreError::Rpc(detail));
        }

        serde_json::from_value(value).map_err(|e| StoreError::Decode {
            function: function.to_string(),
            reason: e.to_string(),
        })
    }
}

fn is_missing(err: &StoreError) -> bool {
    let mentions_missing = |text: &str| {
        let text = text.to_lowercase();
        text.contains("not found") || text.contains("does not exist")
    };
    match err {
        StoreError::Status { status: 404, .. } => true,
        StoreError::Status { body, .. } => mentions_missing(body),
        StoreError::Rpc(message) => mentions_missing(message),
        _ => false,
    }
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
    async fn create(&self, request: &CreateArtifact) -> Result<ArtifactHandle, StoreError> {
        let kwargs = serde_json::to_value(request).map_err(|e| StoreError::Decode {
            function: "create".to_string(),
            reason: e.to_string(),
        })?;
        self.call("create", kwargs).await
    }

    async fn read(&self, artifact_id: &str) -> Result<ArtifactLookup, StoreError> {
        match self
            .call::<ArtifactHandle>("read", json!({ "artifact_id": artifact_id }))
            .await
        {
            Ok(handle) => Ok(ArtifactLookup::Found(handle)),
            Err(e) if is_missing(&e) => Ok(ArtifactLookup::Absent),
            Err(e) => Err(e),
        }
    }

    async fn edit(
        &self,
        artifact_id: &str,
        stage: bool,
        version: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut kwargs = json!({ "artifact_id": artifact_id, "stage": stage });
        if let Some(version) = version {
            kwargs["version"] = json!(version);
        }
        self.call::<Value>("edit", kwargs).await?;
        Ok(())
    }

    async fn commit(&self, artifact_id: &str) -> Result<(), StoreError> {
        self.call::<Value>("commit", json!({ "artifact_id": artifact_id }))
            .await?;
        Ok(())
    }

    async fn list_files(&self, artifact_id: &str) -> Result<Vec<Value>, StoreError> {
        self.call("list_files", json!({ "artifact_id": artifact_id }))
            .await
    }

    async fn get_file(&self, artifact_id: &str, file_path: &str) -> Result<String, StoreError> {
        self.call(
            "get_file",
            json!({ "artifact_id": artifact_id, "file_path": file_path }),
        )
        .await
    }

    async fn put_file(&self, artifact_id: &str, file_path: &str) -> Result<String, StoreError> {
        self.call(
            "put_file",
            json!({ "artifact_id": artifact_id, "file_path": file_path }),
        )
        .await
    }

    fn artifact_url(&self, alias: &str) -> Option<String> {
        Some(format!("{}/{}", self.artifacts_url, alias))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};

    async fn handle(
        Path(function): Path<String>,
        headers: HeaderMap,
        Json(kwargs): Json<Value>,
    ) -> (StatusCode, String) {
        let authorized = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            == Some("Bearer secret");
        if !authorized {
            return (StatusCode::UNAUTHORIZED, "missing token".into());
        }
        let id = kwargs["artifact_id"].as_str().unwrap_or_default().to_string();
        match (function.as_str(), id.as_str()) {
            ("read", "gone") => (StatusCode::NOT_FOUND, "no such artifact".into()),
            ("read", "soft-missing") => (
                StatusCode::OK,
                json!({"success": false, "detail": "Artifact does not exist"}).to_string(),
            ),
            ("read", "broken") => (StatusCode::INTERNAL_SERVER_ERROR, "boom".into()),
            ("read", _) => (StatusCode::OK, json!({"id": id, "alias": "a"}).to_string()),
            ("get_file", _) => (
                StatusCode::OK,
                json!(format!("http://files/{}", kwargs["file_path"].as_str().unwrap_or("")))
                    .to_string(),
            ),
            _ => (StatusCode::OK, "{}".into()),
        }
    }

    async fn store() -> HttpArtifactStore {
        let app = Router::new().route("/ws1/services/artifact-manager/:function", post(handle));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let config = StoreSection {
            server_url: format!("http://{}/", addr),
            workspace: "ws1".into(),
            token: Some("secret".into()),
            ..StoreSection::default()
        };
        HttpArtifactStore::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_read_found_and_absent() {
        let store = store().await;
        assert_eq!(
            store.read("ws1/app").await.unwrap(),
            ArtifactLookup::Found(ArtifactHandle {
                id: "ws1/app".into(),
                alias: Some("a".into())
            })
        );
        assert_eq!(store.read("gone").await.unwrap(), ArtifactLookup::Absent);
        assert_eq!(
            store.read("soft-missing").await.unwrap(),
            ArtifactLookup::Absent
        );
        assert!(matches!(
            store.read("broken").await,
            Err(StoreError::Status { status: 500, .. })
        ));
    }

    #[tokio::test]
    async fn test_get_file_returns_url() {
        let store = store().await;
        let url = store.get_file("ws1/app", "src/index.js").await.unwrap();
        assert_eq!(url, "http://files/src/index.js");
    }

    #[tokio::test]
    async fn test_artifact_url() {
        let store = store().await;
        let url = store.artifact_url("build-output-1").unwrap();
        assert!(url.ends_with("/ws1/artifacts/build-output-1"));
    }
}
