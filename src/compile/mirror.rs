//! Path mirror between the sandbox namespace and store-relative keys.
//!
//! 沙箱路径是绝对路径（`/src/index.js`），制品键是不带前导 `/` 的相对路径
//! （`index.js`）。依赖缓存、版本控制元数据与构建产物目录在两个方向上都不会被镜像。

use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::sandbox::{join_path, parent_dir, Sandbox, SandboxError};

/// Directory names whose subtrees are never mirrored.
pub const EXCLUDED_DIRS: &[&str] = &["node_modules", ".git", "dist", "build"];

/// Path → text content. Ordered so traversal results are deterministic.
pub type MirrorMap = BTreeMap<String, String>;

/// Whether no component of `path` is an excluded directory name.
pub fn is_mirrorable(path: &str) -> bool {
    !path
        .split('/')
        .filter(|c| !c.is_empty())
        .any(|c| EXCLUDED_DIRS.contains(&c))
}

/// Collect every mirrorable file under `source_dir`, keyed by absolute sandbox path.
///
/// Excluded directories are pruned before descent. A file that cannot be read is
/// logged and left out; failing to list a directory aborts the traversal.
pub async fn collect_tree(
    sandbox: &dyn Sandbox,
    source_dir: &str,
) -> Result<MirrorMap, SandboxError> {
    let mut files = MirrorMap::new();
    let mut pending = vec![source_dir.to_string()];

    while let Some(dir) = pending.pop() {
        for entry in sandbox.read_dir(&dir).await? {
            let path = join_path(&dir, &entry.name);
            if entry.is_dir {
                if EXCLUDED_DIRS.contains(&entry.name.as_str()) {
                    debug!(path = %path, "Skipping excluded directory");
                    continue;
                }
                pending.push(path);
            } else if entry.is_file {
                match sandbox.read_file(&path).await {
                    Ok(content) => {
                        files.insert(path, content);
                    }
                    Err(e) => warn!(path = %path, "Skipping unreadable file: {}", e),
                }
            }
        }
    }
    Ok(files)
}

/// Translate a sandbox path into a store key.
///
/// `source_dir` is stripped only on a whole-component boundary, so `/srcx/a` is not
/// treated as living under `/src`.
pub fn relativize(sandbox_path: &str, source_dir: &str, target_dir: &str) -> String {
    let source = source_dir.trim_end_matches('/');
    let mut relative = sandbox_path;
    if !source.is_empty() {
        if let Some(rest) = sandbox_path.strip_prefix(source) {
            if rest.is_empty() || rest.starts_with('/') {
                relative = rest;
            }
        }
    }
    let relative = relative.trim_start_matches('/');

    let target = target_dir.trim_matches('/');
    if target.is_empty() {
        relative.to_string()
    } else if relative.is_empty() {
        target.to_string()
    } else {
        format!("{}/{}", target, relative)
    }
}

/// Inverse of [`relativize`] with an empty source prefix: store key → sandbox path.
pub fn store_to_sandbox(store_path: &str, target_dir: &str) -> String {
    join_path(target_dir, store_path.trim_start_matches('/'))
}

/// Write one file, creating its parent directories first.
pub async fn write_entry(
    sandbox: &dyn Sandbox,
    path: &str,
    content: &[u8],
) -> Result<(), SandboxError> {
    if let Some(parent) = parent_dir(path) {
        sandbox.mkdir(parent, true).await?;
    }
    sandbox.write_file(path, content).await
}

/// Write store-keyed files under `target_dir`. Returns the number of files written;
/// keys inside excluded directories are skipped.
pub async fn write_tree(
    sandbox: &dyn Sandbox,
    files: &MirrorMap,
    target_dir: &str,
) -> Result<usize, SandboxError> {
    let mut written = 0;
    for (key, content) in files {
        if !is_mirrorable(key) {
            debug!(key = %key, "Not writing excluded path");
            continue;
        }
        write_entry(sandbox, &store_to_sandbox(key, target_dir), content.as_bytes()).await?;
        written += 1;
    }
    Ok(written)
}
