use crate::server::context::{AppError, ServiceContext};
use crate::server::protocol::{capabilities, ClientMessage, ServerMessage, ServiceStatus};

/// 处理 ping / getInfo
pub async fn handle_system_message(
    client_msg: &ClientMessage,
    ctx: &ServiceContext,
) -> Result<Option<ServerMessage>, AppError> {
    match client_msg {
        ClientMessage::Ping => Ok(Some(ServerMessage::Pong)),

        ClientMessage::GetInfo => {
            let process_count = ctx.processes.lock().await.len();
            Ok(Some(ServerMessage::Info(ServiceStatus {
                status: "ready".to_string(),
                workdir: ctx.sandbox.workdir(),
                process_count,
                features: capabilities(),
            })))
        }

        _ => Ok(None),
    }
}
