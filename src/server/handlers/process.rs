use tracing::debug;

use crate::compile::process_registry::{run_to_completion, spawn_tracked, RegistryError};
use crate::sandbox::{SpawnOptions, TerminalSize};
use crate::server::context::{AppError, ServiceContext};
use crate::server::protocol::{ClientMessage, ServerMessage};

/// 处理进程相关消息
pub async fn handle_process_message(
    client_msg: &ClientMessage,
    ctx: &ServiceContext,
) -> Result<Option<ServerMessage>, AppError> {
    match client_msg {
        // 阻塞执行，返回退出码与完整输出
        ClientMessage::Spawn { command, args } => {
            let outcome = run_to_completion(
                ctx.sandbox.as_ref(),
                command,
                args,
                &SpawnOptions::default(),
            )
            .await?;
            Ok(Some(ServerMessage::CommandCompleted {
                command: command.clone(),
                exit_code: outcome.exit_code,
                output: outcome.output,
            }))
        }

        ClientMessage::SpawnProcess {
            command,
            args,
            options,
        } => {
            let info = spawn_tracked(
                &ctx.processes,
                ctx.sandbox.as_ref(),
                command,
                args,
                options,
            )
            .await?;
            Ok(Some(ServerMessage::ProcessSpawned(info)))
        }

        ClientMessage::KillProcess { process_id } => {
            ctx.processes.lock().await.kill(process_id)?;
            Ok(Some(ServerMessage::ProcessKilled {
                process_id: process_id.clone(),
            }))
        }

        ClientMessage::ListProcesses => {
            let processes = ctx.processes.lock().await.list();
            Ok(Some(ServerMessage::Processes { processes }))
        }

        ClientMessage::WriteInput { process_id, data } => {
            // 先取出 sender 再释放锁，避免在 send 等待时阻塞整个注册表
            let input = ctx.processes.lock().await.input_for(process_id)?;
            input
                .send(data.as_bytes().to_vec())
                .await
                .map_err(|_| RegistryError::InputClosed(process_id.clone()))?;
            debug!(process_id = %process_id, bytes = data.len(), "Input forwarded");
            Ok(Some(ServerMessage::InputWritten {
                process_id: process_id.clone(),
                bytes: data.len(),
            }))
        }

        ClientMessage::ResizeProcess {
            process_id,
            cols,
            rows,
        } => {
            ctx.processes.lock().await.resize(
                process_id,
                TerminalSize {
                    cols: *cols,
                    rows: *rows,
                },
            )?;
            Ok(Some(ServerMessage::ProcessResized {
                process_id: process_id.clone(),
                cols: *cols,
                rows: *rows,
            }))
        }

        _ => Ok(None),
    }
}
