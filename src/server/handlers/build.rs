use tokio::sync::watch;
use tracing::info;

use crate::compile::sample::sample_project;
use crate::compile::workflow::Workflow;
use crate::server::context::{AppError, ServiceContext};
use crate::server::protocol::{ClientMessage, ServerMessage};

/// 处理 runBuild：完整的 上传 → 物化 → 安装 → 构建 → 发布 → 启动 流程
pub async fn handle_build_message(
    client_msg: &ClientMessage,
    ctx: &ServiceContext,
    cancel: watch::Receiver<bool>,
) -> Result<Option<ServerMessage>, AppError> {
    let ClientMessage::RunBuild { sources } = client_msg else {
        return Ok(None);
    };

    let sources = sources.clone().unwrap_or_else(sample_project);
    info!(files = sources.len(), "Starting build workflow");

    let workflow = Workflow::new(
        ctx.sandbox.as_ref(),
        ctx.gateway.as_ref(),
        &ctx.processes,
        &ctx.config.workflow,
        cancel,
    );
    let result = workflow.run(sources).await;
    // 物化与构建会改动沙箱，无论成败都刷新
    ctx.refresh_tree().await;

    Ok(Some(ServerMessage::BuildCompleted(result?)))
}
