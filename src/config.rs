//! Service configuration (`config.toml`)
//!
//! 所有字段都有默认值：没有配置文件时服务也能以默认参数启动。
//! 查找顺序：`--config` → `$SANDBOX_COMPILER_CONFIG` → `~/.sandbox-compiler/config.toml`。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_ENV: &str = "SANDBOX_COMPILER_CONFIG";
pub const PORT_ENV: &str = "SANDBOX_COMPILER_PORT";
pub const STORE_TOKEN_ENV: &str = "SANDBOX_COMPILER_STORE_TOKEN";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {reason}")]
    ReadError { path: String, reason: String },
    #[error("Failed to parse config {path}: {reason}")]
    ParseError { path: String, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServiceConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub service: ServiceSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub workflow: WorkflowConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub auth_token: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            auth_token: None,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    47990
}

/// 对外注册的服务身份
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSection {
    #[serde(default = "default_service_id")]
    pub id: String,
    #[serde(default = "default_service_name")]
    pub name: String,
    #[serde(default = "default_service_description")]
    pub description: String,
    #[serde(default)]
    pub visibility: Visibility,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            id: default_service_id(),
            name: default_service_name(),
            description: default_service_description(),
            visibility: Visibility::default(),
        }
    }
}

fn default_service_id() -> String {
    "sandbox-compiler".to_string()
}

fn default_service_name() -> String {
    "Sandbox Compilation Service".to_string()
}

fn default_service_description() -> String {
    "Code compilation, file system operations and process management inside a sandbox"
        .to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Public,
    Protected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSection {
    #[serde(default = "default_sandbox_root")]
    pub root: PathBuf,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            root: default_sandbox_root(),
        }
    }
}

fn default_sandbox_root() -> PathBuf {
    state_dir().join("sandbox")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default = "default_workspace")]
    pub workspace: String,
    #[serde(default = "default_store_service")]
    pub service_id: String,
    pub token: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            workspace: default_workspace(),
            service_id: default_store_service(),
            token: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_server_url() -> String {
    "https://hypha.aicell.io".to_string()
}

fn default_workspace() -> String {
    "public".to_string()
}

fn default_store_service() -> String {
    "artifact-manager".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

/// 构建流程参数：install → build → publish → start
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_install")]
    pub install: Vec<String>,
    #[serde(default = "default_build")]
    pub build: Vec<String>,
    #[serde(default = "default_start")]
    pub start: Vec<String>,
    #[serde(default = "default_workdir")]
    pub workdir: String,
    #[serde(default = "default_dist_dir")]
    pub dist_dir: String,
    #[serde(default = "default_fallback_files")]
    pub fallback_files: Vec<String>,
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_ms: u64,
    #[serde(default = "default_source_prefix")]
    pub source_prefix: String,
    #[serde(default = "default_build_prefix")]
    pub build_prefix: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            install: default_install(),
            build: default_build(),
            start: default_start(),
            workdir: default_workdir(),
            dist_dir: default_dist_dir(),
            fallback_files: default_fallback_files(),
            readiness_timeout_ms: default_readiness_timeout(),
            source_prefix: default_source_prefix(),
            build_prefix: default_build_prefix(),
        }
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn default_install() -> Vec<String> {
    argv(&["npm", "install"])
}

fn default_build() -> Vec<String> {
    argv(&["npm", "run", "build"])
}

fn default_start() -> Vec<String> {
    argv(&["npm", "run", "start"])
}

fn default_workdir() -> String {
    "/".to_string()
}

fn default_dist_dir() -> String {
    "/dist".to_string()
}

fn default_fallback_files() -> Vec<String> {
    argv(&["index.js", "package.json"])
}

fn default_readiness_timeout() -> u64 {
    10_000
}

fn default_source_prefix() -> String {
    "build-source".to_string()
}

fn default_build_prefix() -> String {
    "build-output".to_string()
}

/// `~/.sandbox-compiler`，无法获取 home 目录时退回当前目录
pub fn state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".sandbox-compiler")
}

impl ServiceConfig {
    /// Load config from an explicit path, the env var, or the default location.
    /// A missing file at the default location yields the default config.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match explicit {
            Some(p) => (p.to_path_buf(), true),
            None => match std::env::var(CONFIG_ENV) {
                Ok(p) => (PathBuf::from(p), true),
                Err(_) => (state_dir().join("config.toml"), false),
            },
        };

        let mut config = if !path.exists() && !required {
            Self::default()
        } else {
            Self::from_file(&path)?
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::parse(&content).map_err(|reason| ConfigError::ParseError {
            path: path.display().to_string(),
            reason,
        })
    }

    pub fn parse(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }

    fn apply_env(&mut self) {
        if let Some(port) = std::env::var(PORT_ENV)
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
        {
            self.server.port = port;
        }
        if let Ok(token) = std::env::var(STORE_TOKEN_ENV) {
            if !token.is_empty() {
                self.store.token = Some(token);
            }
        }
    }

    pub fn to_toml(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| e.to_string())
    }
}
