//! Process registry
//!
//! 以 `proc_<n>` 为键登记沙箱中的长时进程。每个条目拥有一个后台监视任务：
//! 转发输出（日志 + 广播事件），并在进程退出时恰好一次地移除条目。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::sandbox::{
    ProcessControl, Sandbox, SandboxError, SandboxProcess, SpawnOptions, TerminalSize,
};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Process not found: {0}")]
    NotFound(String),

    #[error("Process {0} no longer accepts input")]
    InputClosed(String),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// Snapshot of one tracked process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessInfo {
    pub process_id: String,
    pub command: String,
    pub args: Vec<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Output { process_id: String, data: String },
    /// `exit_code` is `None` when the process was killed or its exit status was lost.
    Exited {
        process_id: String,
        exit_code: Option<i32>,
    },
}

pub struct TrackedProcess {
    info: ProcessInfo,
    input: mpsc::Sender<Vec<u8>>,
    control: Box<dyn ProcessControl>,
    stop_tx: oneshot::Sender<()>,
}

pub struct ProcessRegistry {
    processes: HashMap<String, TrackedProcess>,
    next_id: u64,
    events: broadcast::Sender<ProcessEvent>,
}

pub type SharedProcessRegistry = Arc<Mutex<ProcessRegistry>>;

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            processes: HashMap::new(),
            next_id: 0,
            events,
        }
    }

    pub fn shared() -> SharedProcessRegistry {
        Arc::new(Mutex::new(Self::new()))
    }

    fn allocate_id(&mut self) -> String {
        self.next_id += 1;
        format!("proc_{}", self.next_id)
    }

    pub fn list(&self) -> Vec<ProcessInfo> {
        let mut list: Vec<ProcessInfo> = self.processes.values().map(|p| p.info.clone()).collect();
        list.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        list
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn contains(&self, process_id: &str) -> bool {
        self.processes.contains_key(process_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.events.subscribe()
    }

    /// Stop the monitor, signal termination and drop the entry without waiting for exit.
    pub fn kill(&mut self, process_id: &str) -> Result<(), RegistryError> {
        let entry = self
            .processes
            .remove(process_id)
            .ok_or_else(|| RegistryError::NotFound(process_id.to_string()))?;
        let _ = entry.stop_tx.send(());
        entry.control.kill();
        info!(process_id = %process_id, "Process killed");
        let _ = self.events.send(ProcessEvent::Exited {
            process_id: process_id.to_string(),
            exit_code: None,
        });
        Ok(())
    }

    pub fn kill_all(&mut self) {
        let ids: Vec<String> = self.processes.keys().cloned().collect();
        for id in ids {
            let _ = self.kill(&id);
        }
    }

    pub fn input_for(&self, process_id: &str) -> Result<mpsc::Sender<Vec<u8>>, RegistryError> {
        self.processes
            .get(process_id)
            .map(|p| p.input.clone())
            .ok_or_else(|| RegistryError::NotFound(process_id.to_string()))
    }

    pub fn resize(&self, process_id: &str, size: TerminalSize) -> Result<(), RegistryError> {
        let entry = self
            .processes
            .get(process_id)
            .ok_or_else(|| RegistryError::NotFound(process_id.to_string()))?;
        entry.control.resize(size)?;
        Ok(())
    }
}

/// Spawn a process and register it. Returns as soon as the process has started.
pub async fn spawn_tracked(
    registry: &SharedProcessRegistry,
    sandbox: &dyn Sandbox,
    command: &str,
    args: &[String],
    options: &SpawnOptions,
) -> Result<ProcessInfo, RegistryError> {
    let (process_id, events) = {
        let mut reg = registry.lock().await;
        (reg.allocate_id(), reg.events.clone())
    };

    let SandboxProcess {
        input,
        output,
        exit,
        control,
    } = sandbox.spawn(command, args, options).await?;

    let info = ProcessInfo {
        process_id: process_id.clone(),
        command: command.to_string(),
        args: args.to_vec(),
        started_at: Utc::now(),
    };
    let (stop_tx, stop_rx) = oneshot::channel();
    registry.lock().await.processes.insert(
        process_id.clone(),
        TrackedProcess {
            info: info.clone(),
            input,
            control,
            stop_tx,
        },
    );
    info!(process_id = %process_id, command = %command, ?args, "Process started");

    let monitor = Monitor {
        process_id,
        forward: options.output,
        events,
        line: String::new(),
        pending: Vec::new(),
    };
    tokio::spawn(monitor.run(registry.clone(), output, exit, stop_rx));

    Ok(info)
}

struct Monitor {
    process_id: String,
    forward: bool,
    events: broadcast::Sender<ProcessEvent>,
    line: String,
    pending: Vec<u8>,
}

impl Monitor {
    async fn run(
        mut self,
        registry: SharedProcessRegistry,
        mut output: mpsc::Receiver<Vec<u8>>,
        mut exit: oneshot::Receiver<i32>,
        mut stop_rx: oneshot::Receiver<()>,
    ) {
        let exit_code = loop {
            tokio::select! {
                biased;
                _ = &mut stop_rx => {
                    debug!(process_id = %self.process_id, "Monitor stopped");
                    return;
                }
                chunk = output.recv() => match chunk {
                    Some(data) => self.emit(&data),
                    None => {
                        tokio::select! {
                            code = &mut exit => break code.ok(),
                            _ = &mut stop_rx => return,
                        }
                    }
                },
                code = &mut exit => {
                    // exit 只在输出读尽后才完成，剩余数据都已在通道中
                    while let Ok(data) = output.try_recv() {
                        self.emit(&data);
                    }
                    break code.ok();
                }
            }
        };
        self.flush_line();

        let removed = registry
            .lock()
            .await
            .processes
            .remove(&self.process_id)
            .is_some();
        if !removed {
            return;
        }
        match exit_code {
            Some(code) => info!(process_id = %self.process_id, exit_code = code, "Process exited"),
            None => warn!(process_id = %self.process_id, "Process exited without a status"),
        }
        let _ = self.events.send(ProcessEvent::Exited {
            process_id: self.process_id.clone(),
            exit_code,
        });
    }

    fn emit(&mut self, data: &[u8]) {
        if !self.forward {
            return;
        }
        // 多字节字符可能被拆在两次读取之间，不完整的尾部留到下一个 chunk
        self.pending.extend_from_slice(data);
        let complete = self.pending.len() - incomplete_utf8_tail(&self.pending);
        let bytes: Vec<u8> = self.pending.drain(..complete).collect();
        self.publish(String::from_utf8_lossy(&bytes).into_owned());
    }

    fn publish(&mut self, text: String) {
        if text.is_empty() {
            return;
        }
        self.line.push_str(&text);
        while let Some(idx) = self.line.find('\n') {
            let line: String = self.line.drain(..=idx).collect();
            info!(process_id = %self.process_id, "[{}] {}", self.process_id, line.trim_end());
        }
        let _ = self.events.send(ProcessEvent::Output {
            process_id: self.process_id.clone(),
            data: text,
        });
    }

    fn flush_line(&mut self) {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.publish(String::from_utf8_lossy(&rest).into_owned());
        }
        if !self.line.is_empty() {
            let line = std::mem::take(&mut self.line);
            info!(process_id = %self.process_id, "[{}] {}", self.process_id, line.trim_end());
        }
    }
}

/// Length of a UTF-8 sequence at the end of `bytes` that is still missing continuation bytes.
fn incomplete_utf8_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let needed = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandOutcome {
    pub exit_code: i32,
    pub output: String,
}

/// Run a command to completion without registering it, capturing all of its output.
pub async fn run_to_completion(
    sandbox: &dyn Sandbox,
    command: &str,
    args: &[String],
    options: &SpawnOptions,
) -> Result<CommandOutcome, SandboxError> {
    info!(command = %command, ?args, "Executing");
    let SandboxProcess {
        input,
        mut output,
        exit,
        control: _control,
    } = sandbox.spawn(command, args, options).await?;
    // 关闭 stdin，交互式提示会直接读到 EOF
    drop(input);

    let mut captured = Vec::new();
    while let Some(chunk) = output.recv().await {
        captured.extend_from_slice(&chunk);
    }
    let exit_code = exit.await.unwrap_or(-1);
    let output = String::from_utf8_lossy(&captured).into_owned();
    for line in output.lines() {
        debug!(command = %command, "  {}", line);
    }
    info!(command = %command, exit_code, "Command completed");
    Ok(CommandOutcome { exit_code, output })
}
