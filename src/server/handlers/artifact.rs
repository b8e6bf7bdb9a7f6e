use crate::server::context::{AppError, ServiceContext};
use crate::server::protocol::{ClientMessage, ServerMessage};

/// 处理 loadArtifact / publishArtifact
pub async fn handle_artifact_message(
    client_msg: &ClientMessage,
    ctx: &ServiceContext,
) -> Result<Option<ServerMessage>, AppError> {
    match client_msg {
        ClientMessage::LoadArtifact {
            artifact_id,
            target_dir,
        } => {
            let report = ctx
                .gateway
                .materialize(ctx.sandbox.as_ref(), artifact_id, target_dir)
                .await?;
            ctx.refresh_tree().await;
            Ok(Some(ServerMessage::ArtifactLoaded(report)))
        }

        ClientMessage::PublishArtifact {
            source_dir,
            artifact_id,
            target_dir,
        } => {
            let report = ctx
                .gateway
                .persist(ctx.sandbox.as_ref(), source_dir, artifact_id, target_dir)
                .await?;
            Ok(Some(ServerMessage::ArtifactPublished(report)))
        }

        _ => Ok(None),
    }
}
