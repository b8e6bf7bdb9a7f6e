//! Host-directory sandbox
//!
//! 沙箱路径形如 `/src/index.js`，全部映射到 `root` 之下；任何解析到根目录之外的路径
//! （`..` 越界或符号链接逃逸）都会被拒绝。

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};
use url::Url;
use walkdir::WalkDir;

use super::{
    DirEntry, ExportFormat, Exported, FileTree, ProcessControl, Sandbox, SandboxError,
    SandboxProcess, ServerReady, SpawnOptions, TerminalSize, TreeNode,
};

/// Maximum path length in bytes
pub const MAX_PATH_LENGTH: usize = 4096;

/// 进程退出后等待输出读取结束的最长时间（后台子进程可能仍持有管道）
pub(crate) const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// export 不进入的目录
const EXPORT_SKIP_DIRS: &[&str] = &["node_modules", ".git"];

/// 未换行输出的最大缓存长度
const MAX_CARRY: usize = 4096;

pub struct LocalSandbox {
    root: PathBuf,
    ready_tx: broadcast::Sender<ServerReady>,
}

impl LocalSandbox {
    /// Create the root directory if needed and open a sandbox on it.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, SandboxError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;
        let (ready_tx, _) = broadcast::channel(16);
        info!("Sandbox root: {}", root.display());
        Ok(Self { root, ready_tx })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, sandbox_path: &str) -> Result<PathBuf, SandboxError> {
        resolve_in_root(&self.root, sandbox_path)
    }
}

/// Map a sandbox path onto the host directory `root`.
///
/// `root` must already be canonical.
pub fn resolve_in_root(root: &Path, sandbox_path: &str) -> Result<PathBuf, SandboxError> {
    if sandbox_path.len() > MAX_PATH_LENGTH {
        return Err(SandboxError::PathEscape(format!(
            "path longer than {} bytes",
            MAX_PATH_LENGTH
        )));
    }

    let mut components = Vec::new();
    for component in sandbox_path.split(['/', '\\']) {
        match component {
            "" | "." => continue,
            ".." => {
                if components.pop().is_none() {
                    return Err(SandboxError::PathEscape(sandbox_path.to_string()));
                }
            }
            c => components.push(c),
        }
    }

    let mut full_path = root.to_path_buf();
    for component in components {
        full_path.push(component);
    }

    // 已存在的路径需要检查符号链接是否指向根目录之外
    if full_path.exists() {
        let canonical = full_path.canonicalize()?;
        if !canonical.starts_with(root) {
            warn!(
                "Path escape attempt: {:?} not under {:?}",
                canonical, root
            );
            return Err(SandboxError::PathEscape(sandbox_path.to_string()));
        }
    }
    Ok(full_path)
}

fn map_io(path: &str, e: std::io::Error) -> SandboxError {
    match e.kind() {
        std::io::ErrorKind::NotFound => SandboxError::NotFound(path.to_string()),
        std::io::ErrorKind::AlreadyExists => SandboxError::AlreadyExists(path.to_string()),
        _ => SandboxError::Io(e),
    }
}

fn check_entry_name(name: &str) -> Result<(), SandboxError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(SandboxError::PathEscape(name.to_string()));
    }
    Ok(())
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn workdir(&self) -> String {
        "/".to_string()
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, SandboxError> {
        let dir = self.resolve(path)?;
        let mut read_dir = tokio::fs::read_dir(&dir).await.map_err(|e| map_io(path, e))?;

        let mut entries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            // 不跟随符号链接：链接既不是目录也不是文件，遍历不会经由它重入
            let ft = entry.file_type().await?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                is_dir: ft.is_dir(),
                is_file: ft.is_file(),
            });
        }

        // Directories first, then by name
        entries.sort_by(|a, b| match (a.is_dir, b.is_dir) {
            (true, false) => std::cmp::Ordering::Less,
            (false, true) => std::cmp::Ordering::Greater,
            _ => a.name.cmp(&b.name),
        });
        Ok(entries)
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        let bytes = self.read_bytes(path).await?;
        String::from_utf8(bytes).map_err(|_| SandboxError::InvalidUtf8(path.to_string()))
    }

    async fn read_bytes(&self, path: &str) -> Result<Vec<u8>, SandboxError> {
        let full = self.resolve(path)?;
        tokio::fs::read(&full).await.map_err(|e| map_io(path, e))
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), SandboxError> {
        let full = self.resolve(path)?;
        if full == self.root {
            return Err(SandboxError::Unsupported("cannot write to the sandbox root".into()));
        }
        tokio::fs::write(&full, contents)
            .await
            .map_err(|e| map_io(path, e))?;
        debug!(path = %path, bytes = contents.len(), "File written");
        Ok(())
    }

    async fn mkdir(&self, path: &str, recursive: bool) -> Result<(), SandboxError> {
        let full = self.resolve(path)?;
        let result = if recursive {
            tokio::fs::create_dir_all(&full).await
        } else {
            tokio::fs::create_dir(&full).await
        };
        result.map_err(|e| map_io(path, e))
    }

    async fn remove(&self, path: &str, recursive: bool) -> Result<(), SandboxError> {
        let full = self.resolve(path)?;
        if full == self.root {
            return Err(SandboxError::Unsupported("cannot remove the sandbox root".into()));
        }
        let meta = tokio::fs::symlink_metadata(&full)
            .await
            .map_err(|e| map_io(path, e))?;
        let result = if meta.is_dir() {
            if recursive {
                tokio::fs::remove_dir_all(&full).await
            } else {
                tokio::fs::remove_dir(&full).await
            }
        } else {
            tokio::fs::remove_file(&full).await
        };
        result.map_err(|e| map_io(path, e))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SandboxError> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        if src == self.root || dst == self.root {
            return Err(SandboxError::Unsupported("cannot rename the sandbox root".into()));
        }
        tokio::fs::rename(&src, &dst)
            .await
            .map_err(|e| map_io(from, e))
    }

    async fn mount(&self, tree: &FileTree, mount_point: &str) -> Result<(), SandboxError> {
        let base = self.resolve(mount_point)?;
        tokio::fs::create_dir_all(&base)
            .await
            .map_err(|e| map_io(mount_point, e))?;

        let mut pending: Vec<(PathBuf, &FileTree)> = vec![(base, tree)];
        let mut files = 0usize;
        while let Some((dir, subtree)) = pending.pop() {
            for (name, node) in subtree {
                check_entry_name(name)?;
                let target = dir.join(name);
                match node {
                    TreeNode::File { file } => {
                        tokio::fs::write(&target, file.contents.as_bytes()).await?;
                        files += 1;
                    }
                    TreeNode::Directory { directory } => {
                        tokio::fs::create_dir_all(&target).await?;
                        pending.push((target, directory));
                    }
                }
            }
        }
        info!(mount_point = %mount_point, files, "Tree mounted");
        Ok(())
    }

    async fn export(&self, path: &str, format: ExportFormat) -> Result<Exported, SandboxError> {
        let full = self.resolve(path)?;
        let meta = tokio::fs::metadata(&full)
            .await
            .map_err(|e| map_io(path, e))?;

        match format {
            ExportFormat::Binary => {
                if meta.is_dir() {
                    return Err(SandboxError::Unsupported(
                        "binary export is only available for single files".into(),
                    ));
                }
                Ok(Exported::Binary(tokio::fs::read(&full).await?))
            }
            ExportFormat::Json if meta.is_file() => {
                let name = full
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                let bytes = tokio::fs::read(&full).await?;
                let mut tree = FileTree::new();
                tree.insert(name, TreeNode::file(String::from_utf8_lossy(&bytes)));
                Ok(Exported::Tree(tree))
            }
            ExportFormat::Json => {
                let tree = tokio::task::spawn_blocking(move || export_tree(&full))
                    .await
                    .map_err(|e| SandboxError::Io(std::io::Error::other(e.to_string())))??;
                Ok(Exported::Tree(tree))
            }
        }
    }

    async fn spawn(
        &self,
        command: &str,
        args: &[String],
        options: &SpawnOptions,
    ) -> Result<SandboxProcess, SandboxError> {
        let cwd_path = options.cwd.as_deref().unwrap_or("/");
        let cwd = self.resolve(cwd_path)?;
        if !cwd.is_dir() {
            return Err(SandboxError::NotFound(cwd_path.to_string()));
        }
        let detector = Arc::new(ReadyDetector::new(self.ready_tx.clone()));

        if let Some(size) = options.terminal {
            return super::pty::spawn_in_pty(command, args, &cwd, &options.env, size, detector);
        }

        let mut cmd = Command::new(command);
        cmd.args(args)
            .current_dir(&cwd)
            .envs(&options.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // 独立进程组，kill 时连同 npm 派生的子进程一起结束
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| SandboxError::SpawnFailed {
            command: command.to_string(),
            reason: e.to_string(),
        })?;
        debug!(command = %command, ?args, pid = ?child.id(), "Process spawned");

        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(256);
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump_output(
                stdout,
                output_tx.clone(),
                detector.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump_output(
                stderr,
                output_tx.clone(),
                detector.clone(),
            )));
        }
        drop(output_tx);

        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(64);
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                while let Some(data) = input_rx.recv().await {
                    if stdin.write_all(&data).await.is_err() || stdin.flush().await.is_err() {
                        break;
                    }
                }
            });
        }

        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
        let (exit_tx, exit_rx) = oneshot::channel();
        let name = command.to_string();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Some(()) = kill_rx.recv() => {
                    kill_child(&mut child);
                    child.wait().await
                }
            };
            let code = match status {
                Ok(status) => exit_code(&status),
                Err(e) => {
                    warn!(command = %name, "Failed to wait for process: {}", e);
                    -1
                }
            };

            for mut reader in readers {
                if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut reader)
                    .await
                    .is_err()
                {
                    debug!(command = %name, "Output still open after exit, detaching reader");
                    reader.abort();
                }
            }
            let _ = exit_tx.send(code);
        });

        Ok(SandboxProcess {
            input: input_tx,
            output: output_rx,
            exit: exit_rx,
            control: Box::new(PipeControl { kill_tx }),
        })
    }

    fn subscribe_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.ready_tx.subscribe()
    }
}

fn export_tree(dir: &Path) -> std::io::Result<FileTree> {
    let mut tree = FileTree::new();
    let walker = WalkDir::new(dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            !(e.file_type().is_dir()
                && EXPORT_SKIP_DIRS.contains(&e.file_name().to_string_lossy().as_ref()))
        });

    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        let Ok(rel) = entry.path().strip_prefix(dir) else {
            continue;
        };
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        let Some((last, parents)) = parts.split_last() else {
            continue;
        };

        if entry.file_type().is_dir() {
            subtree_mut(&mut tree, &parts);
        } else if entry.file_type().is_file() {
            let bytes = std::fs::read(entry.path())?;
            if let Some(parent) = subtree_mut(&mut tree, parents) {
                parent.insert(
                    last.clone(),
                    TreeNode::file(String::from_utf8_lossy(&bytes)),
                );
            }
        }
    }
    Ok(tree)
}

fn subtree_mut<'a>(tree: &'a mut FileTree, dirs: &[String]) -> Option<&'a mut FileTree> {
    let mut current = tree;
    for name in dirs {
        let node = current
            .entry(name.clone())
            .or_insert_with(|| TreeNode::directory(FileTree::new()));
        current = match node {
            TreeNode::Directory { directory } => directory,
            TreeNode::File { .. } => return None,
        };
    }
    Some(current)
}

async fn pump_output<R: AsyncRead + Unpin>(
    mut reader: R,
    tx: mpsc::Sender<Vec<u8>>,
    detector: Arc<ReadyDetector>,
) {
    let mut buf = [0u8; 8192];
    let mut carry = String::new();
    let mut forward = true;
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = buf[..n].to_vec();
                detector.observe(&mut carry, &chunk);
                // 接收端关闭后继续读空管道，避免进程因 SIGPIPE 退出
                if forward && tx.send(chunk).await.is_err() {
                    forward = false;
                }
            }
            Err(e) => {
                debug!("Output read error: {}", e);
                break;
            }
        }
    }
}

fn kill_child(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: 负 pid 表示向整个进程组发送信号，进程组由 spawn 时的 process_group(0) 建立
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }
    if let Err(e) = child.start_kill() {
        debug!("start_kill: {}", e);
    }
}

fn exit_code(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

struct PipeControl {
    kill_tx: mpsc::Sender<()>,
}

impl ProcessControl for PipeControl {
    fn kill(&self) {
        let _ = self.kill_tx.try_send(());
    }

    fn resize(&self, _size: TerminalSize) -> Result<(), SandboxError> {
        Err(SandboxError::Unsupported(
            "resize requires a process spawned with a terminal".into(),
        ))
    }
}

/// Watches process output for the first local listening URL and announces it once.
pub(crate) struct ReadyDetector {
    announced: AtomicBool,
    tx: broadcast::Sender<ServerReady>,
}

impl ReadyDetector {
    pub(crate) fn new(tx: broadcast::Sender<ServerReady>) -> Self {
        Self {
            announced: AtomicBool::new(false),
            tx,
        }
    }

    /// 只扫描完整的行，未换行的尾部留在 `carry` 中等待下一个 chunk
    pub(crate) fn observe(&self, carry: &mut String, chunk: &[u8]) {
        if self.announced.load(Ordering::Relaxed) {
            return;
        }
        carry.push_str(&String::from_utf8_lossy(chunk));
        let Some(last_newline) = carry.rfind('\n') else {
            if carry.len() > MAX_CARRY {
                let mut cut = carry.len() - MAX_CARRY;
                while !carry.is_char_boundary(cut) {
                    cut += 1;
                }
                carry.drain(..cut);
            }
            return;
        };

        if let Some(ready) = detect_server_url(&carry[..last_newline]) {
            if !self.announced.swap(true, Ordering::SeqCst) {
                info!(port = ready.port, url = %ready.url, "Server ready");
                let _ = self.tx.send(ready);
            }
            carry.clear();
            return;
        }
        carry.drain(..=last_newline);
    }
}

/// Find the first `http(s)://` URL on a loopback or wildcard host with an explicit port.
pub fn detect_server_url(text: &str) -> Option<ServerReady> {
    for (idx, _) in text.match_indices("http") {
        let candidate: String = text[idx..]
            .chars()
            .take_while(|c| {
                !c.is_whitespace()
                    && !c.is_control()
                    && !matches!(c, '"' | '\'' | '<' | '>' | ')' | '`' | ',')
            })
            .collect();
        let Ok(url) = Url::parse(candidate.trim_end_matches(['.', ';', ':'])) else {
            continue;
        };
        if !matches!(url.scheme(), "http" | "https") {
            continue;
        }
        if !matches!(
            url.host_str(),
            Some("localhost" | "127.0.0.1" | "0.0.0.0" | "[::1]")
        ) {
            continue;
        }
        let Some(port) = url.port() else {
            continue;
        };
        return Some(ServerReady {
            port,
            url: url.to_string(),
        });
    }
    None
}
