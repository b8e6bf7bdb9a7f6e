//! Terminal-backed processes
//!
//! 以伪终端方式运行进程：stdout/stderr 合并为同一输出流，支持 resize。
//! portable-pty 的 reader/writer 是阻塞 IO，分别放在独立线程中。

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use super::local::{ReadyDetector, OUTPUT_DRAIN_TIMEOUT};
use super::{ProcessControl, SandboxError, SandboxProcess, TerminalSize};

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

#[instrument(skip(master), fields(cols = size.cols, rows = size.rows))]
fn resize_pty(master: &dyn MasterPty, size: TerminalSize) -> Result<(), SandboxError> {
    master
        .resize(pty_size(size))
        .map_err(|e| SandboxError::Io(std::io::Error::other(e.to_string())))?;
    info!(cols = size.cols, rows = size.rows, "PTY resized");
    Ok(())
}

#[instrument(skip(args, env, detector), fields(cols = size.cols, rows = size.rows))]
pub(crate) fn spawn_in_pty(
    command: &str,
    args: &[String],
    cwd: &Path,
    env: &HashMap<String, String>,
    size: TerminalSize,
    detector: Arc<ReadyDetector>,
) -> Result<SandboxProcess, SandboxError> {
    let spawn_failed = |reason: String| SandboxError::SpawnFailed {
        command: command.to_string(),
        reason,
    };

    let pair = native_pty_system()
        .openpty(pty_size(size))
        .map_err(|e| spawn_failed(format!("openpty: {}", e)))?;

    let mut cmd = CommandBuilder::new(command);
    cmd.args(args);
    cmd.cwd(cwd);
    cmd.env("TERM", "xterm-256color");
    cmd.env("COLORTERM", "truecolor");
    for (key, value) in env {
        cmd.env(key, value);
    }

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| spawn_failed(e.to_string()))?;

    // 关闭父进程中的 slave 端 FD，避免 master reader 永远收不到 EOF
    drop(pair.slave);

    let master = pair.master;
    let mut reader = master
        .try_clone_reader()
        .map_err(|e| spawn_failed(e.to_string()))?;
    let mut writer = master
        .take_writer()
        .map_err(|e| spawn_failed(e.to_string()))?;
    let killer = child.clone_killer();
    info!(command = %command, pid = ?child.process_id(), "PTY process spawned");

    let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(256);
    let (drained_tx, drained_rx) = oneshot::channel::<()>();
    std::thread::spawn(move || {
        let mut buf = [0u8; 8192];
        let mut carry = String::new();
        let mut forward = true;
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = buf[..n].to_vec();
                    detector.observe(&mut carry, &chunk);
                    if forward && output_tx.blocking_send(chunk).is_err() {
                        forward = false;
                    }
                }
                // Linux 上 slave 全部关闭后 read 返回 EIO
                Err(_) => break,
            }
        }
        let _ = drained_tx.send(());
    });

    let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(64);
    std::thread::spawn(move || {
        while let Some(data) = input_rx.blocking_recv() {
            if writer.write_all(&data).and_then(|_| writer.flush()).is_err() {
                break;
            }
        }
    });

    let (exit_tx, exit_rx) = oneshot::channel();
    let name = command.to_string();
    tokio::spawn(async move {
        let code = match tokio::task::spawn_blocking(move || child.wait()).await {
            Ok(Ok(status)) => status.exit_code() as i32,
            Ok(Err(e)) => {
                warn!(command = %name, "Failed to wait for PTY process: {}", e);
                -1
            }
            Err(e) => {
                warn!(command = %name, "PTY wait task failed: {}", e);
                -1
            }
        };
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drained_rx)
            .await
            .is_err()
        {
            debug!(command = %name, "PTY output still open after exit");
        }
        let _ = exit_tx.send(code);
    });

    Ok(SandboxProcess {
        input: input_tx,
        output: output_rx,
        exit: exit_rx,
        control: Box::new(PtyControl {
            master: Mutex::new(master),
            killer: Mutex::new(killer),
        }),
    })
}

struct PtyControl {
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl ProcessControl for PtyControl {
    fn kill(&self) {
        match self.killer.lock() {
            Ok(mut killer) => {
                if let Err(e) = killer.kill() {
                    warn!(error = %e, "Error sending kill signal to PTY process");
                }
            }
            Err(_) => warn!("PTY killer lock poisoned"),
        }
    }

    fn resize(&self, size: TerminalSize) -> Result<(), SandboxError> {
        let master = self
            .master
            .lock()
            .map_err(|_| SandboxError::Unsupported("PTY master lock poisoned".into()))?;
        resize_pty(master.as_ref(), size)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use crate::sandbox::{LocalSandbox, Sandbox, SpawnOptions, TerminalSize};
    use std::time::Duration;
    use tempfile::TempDir;

    fn terminal_options() -> SpawnOptions {
        SpawnOptions {
            terminal: Some(TerminalSize { cols: 100, rows: 30 }),
            ..SpawnOptions::default()
        }
    }

    #[tokio::test]
    async fn test_pty_process_output_and_resize() {
        let dir = TempDir::new().unwrap();
        let sandbox = LocalSandbox::new(dir.path()).unwrap();
        let args = vec!["-c".to_string(), "echo from-pty".to_string()];
        let mut process = sandbox
            .spawn("sh", &args, &terminal_options())
            .await
            .unwrap();
        process
            .control
            .resize(TerminalSize { cols: 120, rows: 40 })
            .unwrap();

        let mut output = Vec::new();
        let collect = async {
            while let Some(chunk) = process.output.recv().await {
                output.extend(chunk);
                if String::from_utf8_lossy(&output).contains("from-pty") {
                    break;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), collect)
            .await
            .unwrap();
        let code = tokio::time::timeout(Duration::from_secs(5), process.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, 0);
    }
}
