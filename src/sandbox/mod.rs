//! Sandbox runtime
//!
//! 沙箱提供隔离的文件系统与进程派生能力。编排核心只通过 [`Sandbox`] trait 访问它，
//! 默认实现 [`LocalSandbox`] 以宿主机上的一个目录作为沙箱根目录。

pub mod local;
pub mod pty;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};

pub use local::LocalSandbox;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Path escapes sandbox root: {0}")]
    PathEscape(String),

    #[error("Path already exists: {0}")]
    AlreadyExists(String),

    #[error("File is not valid UTF-8: {0}")]
    InvalidUtf8(String),

    #[error("Failed to spawn '{command}': {reason}")]
    SpawnFailed { command: String, reason: String },

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// `readdir(withFileTypes)` 的单个条目
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub is_file: bool,
}

/// Nested tree used by `mount` and `export`:
/// `{"index.js": {"file": {"contents": "..."}}, "src": {"directory": {...}}}`
pub type FileTree = BTreeMap<String, TreeNode>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TreeNode {
    File { file: FileContents },
    Directory { directory: FileTree },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileContents {
    pub contents: String,
}

impl TreeNode {
    pub fn file(contents: impl Into<String>) -> Self {
        TreeNode::File {
            file: FileContents {
                contents: contents.into(),
            },
        }
    }

    pub fn directory(tree: FileTree) -> Self {
        TreeNode::Directory { directory: tree }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    #[default]
    Json,
    Binary,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Exported {
    Tree(FileTree),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnOptions {
    /// 指定后在伪终端中运行进程（支持 resize）
    #[serde(default)]
    pub terminal: Option<TerminalSize>,
    /// false 时输出仍被读取，但不写日志也不广播
    #[serde(default = "default_true")]
    pub output: bool,
    /// 沙箱内的工作目录，默认为沙箱根目录
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            terminal: None,
            output: true,
            cwd: None,
            env: HashMap::new(),
        }
    }
}

impl SpawnOptions {
    pub fn in_dir(cwd: impl Into<String>) -> Self {
        Self {
            cwd: Some(cwd.into()),
            ..Self::default()
        }
    }
}

/// Announced when a process inside the sandbox starts listening on a port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerReady {
    pub port: u16,
    pub url: String,
}

/// Kill/resize capability of a spawned process.
pub trait ProcessControl: Send + Sync {
    fn kill(&self);
    fn resize(&self, size: TerminalSize) -> Result<(), SandboxError>;
}

/// A process running inside the sandbox.
///
/// `exit` resolves only after `output` has received everything the process wrote.
pub struct SandboxProcess {
    pub input: mpsc::Sender<Vec<u8>>,
    pub output: mpsc::Receiver<Vec<u8>>,
    pub exit: oneshot::Receiver<i32>,
    pub control: Box<dyn ProcessControl>,
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Absolute sandbox path commands run in by default.
    fn workdir(&self) -> String;

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, SandboxError>;

    async fn read_file(&self, path: &str) -> Result<String, SandboxError>;

    async fn read_bytes(&self, path: &str) -> Result<Vec<u8>, SandboxError>;

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), SandboxError>;

    async fn mkdir(&self, path: &str, recursive: bool) -> Result<(), SandboxError>;

    async fn remove(&self, path: &str, recursive: bool) -> Result<(), SandboxError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), SandboxError>;

    async fn mount(&self, tree: &FileTree, mount_point: &str) -> Result<(), SandboxError>;

    async fn export(&self, path: &str, format: ExportFormat) -> Result<Exported, SandboxError>;

    async fn spawn(
        &self,
        command: &str,
        args: &[String],
        options: &SpawnOptions,
    ) -> Result<SandboxProcess, SandboxError>;

    /// Subscribe to readiness notifications. Dropping the receiver unsubscribes.
    fn subscribe_ready(&self) -> broadcast::Receiver<ServerReady>;
}

pub type SharedSandbox = Arc<dyn Sandbox>;

/// Join a child name onto an absolute sandbox directory path.
pub fn join_path(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    if dir.is_empty() {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Parent directory of an absolute sandbox path, `None` for entries directly under `/`.
pub fn parent_dir(path: &str) -> Option<&str> {
    let idx = path.rfind('/')?;
    if idx == 0 {
        None
    } else {
        Some(&path[..idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/", "index.js"), "/index.js");
        assert_eq!(join_path("/src", "index.js"), "/src/index.js");
        assert_eq!(join_path("/src/", "/index.js"), "/src/index.js");
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir("/index.js"), None);
        assert_eq!(parent_dir("/dist/index.js"), Some("/dist"));
        assert_eq!(parent_dir("/a/b/c.txt"), Some("/a/b"));
    }

    #[test]
    fn test_tree_node_shapes() {
        let json = r#"{"index.js":{"file":{"contents":"x"}},"src":{"directory":{"a.txt":{"file":{"contents":"a"}}}}}"#;
        let tree: FileTree = serde_json::from_str(json).unwrap();
        assert_eq!(tree["index.js"], TreeNode::file("x"));
        match &tree["src"] {
            TreeNode::Directory { directory } => {
                assert_eq!(directory["a.txt"], TreeNode::file("a"));
            }
            other => panic!("expected directory, got {:?}", other),
        }
        assert_eq!(serde_json::to_string(&tree).unwrap(), json);
    }

    #[test]
    fn test_spawn_options_defaults() {
        let opts: SpawnOptions = serde_json::from_str("{}").unwrap();
        assert!(opts.output);
        assert!(opts.terminal.is_none());
        let opts: SpawnOptions =
            serde_json::from_str(r#"{"output":false,"terminal":{"cols":80,"rows":24}}"#).unwrap();
        assert!(!opts.output);
        assert_eq!(opts.terminal, Some(TerminalSize { cols: 80, rows: 24 }));
    }
}
