// handlers module - Protocol message handlers
// 按领域拆分：文件系统、制品、进程、构建流程、系统信息

pub mod artifact;
pub mod build;
pub mod fs;
pub mod process;
pub mod system;

use tokio::sync::watch;

use crate::server::context::{AppError, ServiceContext};
use crate::server::protocol::{ClientMessage, ServerMessage};

/// 按领域分发。每个 handler 返回 `Ok(None)` 表示消息不属于该领域。
pub async fn dispatch(
    client_msg: &ClientMessage,
    ctx: &ServiceContext,
    cancel: watch::Receiver<bool>,
) -> Result<ServerMessage, AppError> {
    if let Some(reply) = system::handle_system_message(client_msg, ctx).await? {
        return Ok(reply);
    }

    if let Some(reply) = fs::handle_fs_message(client_msg, ctx).await? {
        return Ok(reply);
    }

    if let Some(reply) = artifact::handle_artifact_message(client_msg, ctx).await? {
        return Ok(reply);
    }

    if let Some(reply) = process::handle_process_message(client_msg, ctx).await? {
        return Ok(reply);
    }

    if let Some(reply) = build::handle_build_message(client_msg, ctx, cancel).await? {
        return Ok(reply);
    }

    Err(AppError::Internal(format!(
        "Unhandled message: {:?}",
        std::mem::discriminant(client_msg)
    )))
}
