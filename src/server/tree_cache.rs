//! 沙箱目录树缓存
//!
//! 每次变更类调用之后刷新，`fs.tree` 直接返回快照。

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use crate::sandbox::{join_path, Sandbox, SandboxError};

/// Directories never descended into.
pub const PRUNED_DIRS: &[&str] = &["node_modules", ".git"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeEntry>,
}

pub struct TreeCache {
    snapshot: RwLock<Vec<TreeEntry>>,
    changed: broadcast::Sender<()>,
}

impl Default for TreeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeCache {
    pub fn new() -> Self {
        let (changed, _) = broadcast::channel(16);
        Self {
            snapshot: RwLock::new(Vec::new()),
            changed,
        }
    }

    pub async fn snapshot(&self) -> Vec<TreeEntry> {
        self.snapshot.read().await.clone()
    }

    /// 订阅刷新通知（`tree_changed` 事件）
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.changed.subscribe()
    }

    /// Rebuild the snapshot from the sandbox root and notify subscribers.
    pub async fn refresh(&self, sandbox: &dyn Sandbox) -> Result<usize, SandboxError> {
        let entries = build_level(sandbox, "/".to_string()).await?;
        let count = count_entries(&entries);
        *self.snapshot.write().await = entries;
        debug!(entries = count, "Tree cache refreshed");
        let _ = self.changed.send(());
        Ok(count)
    }
}

fn build_level<'a>(
    sandbox: &'a dyn Sandbox,
    dir: String,
) -> BoxFuture<'a, Result<Vec<TreeEntry>, SandboxError>> {
    Box::pin(async move {
        let mut level = Vec::new();
        for entry in sandbox.read_dir(&dir).await? {
            let path = join_path(&dir, &entry.name);
            let children = if entry.is_dir && !PRUNED_DIRS.contains(&entry.name.as_str()) {
                match build_level(sandbox, path.clone()).await {
                    Ok(children) => children,
                    Err(e) => {
                        // 子目录读取失败不影响整体快照
                        warn!(path = %path, error = %e, "Skipping unreadable directory");
                        Vec::new()
                    }
                }
            } else {
                Vec::new()
            };
            level.push(TreeEntry {
                name: entry.name,
                path,
                is_dir: entry.is_dir,
                children,
            });
        }
        Ok(level)
    })
}

fn count_entries(entries: &[TreeEntry]) -> usize {
    entries
        .iter()
        .map(|e| 1 + count_entries(&e.children))
        .sum()
}
