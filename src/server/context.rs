//! 共享上下文与错误类型
//!
//! `ServiceContext` 收拢所有 handler 共享的依赖；`AppError` 统一各协作方的错误，
//! 由调度层转换为 `ServerMessage::Error`。

use std::sync::Arc;
use thiserror::Error;

use crate::compile::gateway::{ArtifactGateway, GatewayError};
use crate::compile::process_registry::{ProcessRegistry, RegistryError, SharedProcessRegistry};
use crate::compile::workflow::{StepError, WorkflowError};
use crate::config::ServiceConfig;
use crate::sandbox::{LocalSandbox, SandboxError, SharedSandbox};
use crate::server::protocol::ServerMessage;
use crate::server::tree_cache::TreeCache;
use crate::store::http::HttpArtifactStore;
use crate::store::{SharedStore, StoreError};

/// Handler 上下文
#[derive(Clone)]
pub struct ServiceContext {
    pub config: Arc<ServiceConfig>,
    pub sandbox: SharedSandbox,
    pub gateway: Arc<ArtifactGateway>,
    pub processes: SharedProcessRegistry,
    pub tree_cache: Arc<TreeCache>,
}

impl ServiceContext {
    pub fn new(
        config: ServiceConfig,
        sandbox: SharedSandbox,
        store: SharedStore,
        http: reqwest::Client,
    ) -> Self {
        Self {
            config: Arc::new(config),
            sandbox,
            gateway: Arc::new(ArtifactGateway::new(store, http)),
            processes: ProcessRegistry::shared(),
            tree_cache: Arc::new(TreeCache::new()),
        }
    }

    /// 本地沙箱 + HTTP 制品存储
    pub fn from_config(config: ServiceConfig) -> Result<Self, AppError> {
        let sandbox = LocalSandbox::new(config.sandbox.root.clone())?;
        let store = HttpArtifactStore::new(&config.store)?;
        let http = store.client();
        Ok(Self::new(config, Arc::new(sandbox), Arc::new(store), http))
    }

    /// 刷新目录树缓存；失败只记日志，不影响调用结果
    pub async fn refresh_tree(&self) {
        if let Err(e) = self.tree_cache.refresh(self.sandbox.as_ref()).await {
            tracing::warn!(error = %e, "Tree cache refresh failed");
        }
    }
}

/// 统一应用错误类型
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Process '{0}' not found")]
    ProcessNotFound(String),

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Artifact '{0}' not found")]
    ArtifactNotFound(String),

    /// 构建阶段中缺失制品，消息保留阶段名
    #[error("{0}")]
    StageArtifactNotFound(String),

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("{0}")]
    Workflow(String),

    #[error("{0}")]
    Cancelled(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// 转换为协议 error code
    pub fn code(&self) -> &str {
        match self {
            AppError::ProcessNotFound(_) => "process_not_found",
            AppError::PathNotFound(_) => "path_not_found",
            AppError::Sandbox(_) => "sandbox_error",
            AppError::Store(_) => "store_error",
            AppError::ArtifactNotFound(_) | AppError::StageArtifactNotFound(_) => {
                "artifact_not_found"
            }
            AppError::Transfer(_) => "transfer_failed",
            AppError::Workflow(_) => "workflow_failed",
            AppError::Cancelled(_) => "cancelled",
            AppError::InvalidParams(_) => "invalid_params",
            AppError::UnknownMethod(_) => "unknown_method",
            AppError::Internal(_) => "internal_error",
        }
    }

    /// 转换为 ServerMessage::Error
    pub fn to_server_error(&self) -> ServerMessage {
        ServerMessage::Error {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

impl From<SandboxError> for AppError {
    fn from(e: SandboxError) -> Self {
        match e {
            SandboxError::NotFound(path) => AppError::PathNotFound(path),
            other => AppError::Sandbox(other.to_string()),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        AppError::Store(e.to_string())
    }
}

impl From<GatewayError> for AppError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::ArtifactNotFound(id) => AppError::ArtifactNotFound(id),
            GatewayError::Transfer { path, reason } => {
                AppError::Transfer(format!("{}: {}", path, reason))
            }
            GatewayError::Sandbox(e) => e.into(),
            GatewayError::Store(e) => e.into(),
        }
    }
}

impl From<RegistryError> for AppError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(id) => AppError::ProcessNotFound(id),
            RegistryError::Sandbox(e) => e.into(),
            other => AppError::Sandbox(other.to_string()),
        }
    }
}

impl From<WorkflowError> for AppError {
    fn from(e: WorkflowError) -> Self {
        match &e {
            WorkflowError::Cancelled(_) => AppError::Cancelled(e.to_string()),
            WorkflowError::StageFailed {
                source: StepError::Gateway(GatewayError::ArtifactNotFound(_)),
                ..
            } => AppError::StageArtifactNotFound(e.to_string()),
            WorkflowError::StageFailed { .. } => AppError::Workflow(e.to_string()),
        }
    }
}

/// 从 tokio JoinError 转换
impl From<tokio::task::JoinError> for AppError {
    fn from(e: tokio::task::JoinError) -> Self {
        AppError::Internal(format!("Task failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::workflow::Stage;

    #[test]
    fn test_error_codes() {
        let err: AppError = SandboxError::NotFound("/missing".into()).into();
        assert_eq!(err.code(), "path_not_found");

        let err: AppError = SandboxError::PathEscape("/../etc".into()).into();
        assert_eq!(err.code(), "sandbox_error");

        let err: AppError = RegistryError::NotFound("proc_9".into()).into();
        assert_eq!(err.code(), "process_not_found");
        assert_eq!(err.to_string(), "Process 'proc_9' not found");

        let err: AppError = GatewayError::ArtifactNotFound("ws/app".into()).into();
        assert_eq!(err.code(), "artifact_not_found");
    }

    #[test]
    fn test_workflow_error_keeps_stage() {
        let err: AppError = WorkflowError::StageFailed {
            stage: Stage::Install,
            source: StepError::ExitCode {
                command: "npm".into(),
                code: 1,
            },
        }
        .into();
        assert_eq!(err.code(), "workflow_failed");
        assert!(err.to_string().contains("install"));

        let err: AppError = WorkflowError::StageFailed {
            stage: Stage::Materialize,
            source: StepError::Gateway(GatewayError::ArtifactNotFound("build-source-1".into())),
        }
        .into();
        assert_eq!(err.code(), "artifact_not_found");
        assert!(err.to_string().contains("materialize"));
        assert!(err.to_string().contains("build-source-1"));

        let err: AppError = WorkflowError::Cancelled(Stage::Build).into();
        assert_eq!(err.code(), "cancelled");

        match err.to_server_error() {
            ServerMessage::Error { code, message } => {
                assert_eq!(code, "cancelled");
                assert!(message.contains("build"));
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }
}
