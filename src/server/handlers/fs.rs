use base64::Engine;

use crate::sandbox::Exported;
use crate::server::context::{AppError, ServiceContext};
use crate::server::protocol::{ClientMessage, ServerMessage};

/// 处理文件系统与整树消息。变更类操作完成后刷新目录树缓存。
pub async fn handle_fs_message(
    client_msg: &ClientMessage,
    ctx: &ServiceContext,
) -> Result<Option<ServerMessage>, AppError> {
    let sandbox = ctx.sandbox.as_ref();
    match client_msg {
        ClientMessage::FsMkdir { path, recursive } => {
            sandbox.mkdir(path, *recursive).await?;
            ctx.refresh_tree().await;
            Ok(Some(ServerMessage::DirCreated { path: path.clone() }))
        }

        ClientMessage::FsReaddir { path } => {
            let entries = sandbox.read_dir(path).await?;
            Ok(Some(ServerMessage::DirEntries {
                path: path.clone(),
                entries,
            }))
        }

        ClientMessage::FsReadFile { path } => {
            let content = sandbox.read_file(path).await?;
            Ok(Some(ServerMessage::FileContent {
                path: path.clone(),
                content,
            }))
        }

        ClientMessage::FsWriteFile { path, data } => {
            sandbox.write_file(path, data.as_bytes()).await?;
            ctx.refresh_tree().await;
            Ok(Some(ServerMessage::FileWritten {
                path: path.clone(),
                bytes: data.len(),
            }))
        }

        ClientMessage::FsRm { path, recursive } => {
            sandbox.remove(path, *recursive).await?;
            ctx.refresh_tree().await;
            Ok(Some(ServerMessage::Removed { path: path.clone() }))
        }

        ClientMessage::FsRename { old_path, new_path } => {
            sandbox.rename(old_path, new_path).await?;
            ctx.refresh_tree().await;
            Ok(Some(ServerMessage::Renamed {
                old_path: old_path.clone(),
                new_path: new_path.clone(),
            }))
        }

        ClientMessage::FsTree => Ok(Some(ServerMessage::Tree {
            entries: ctx.tree_cache.snapshot().await,
        })),

        ClientMessage::Mount { tree, mount_point } => {
            sandbox.mount(tree, mount_point).await?;
            ctx.refresh_tree().await;
            Ok(Some(ServerMessage::Mounted {
                mount_point: mount_point.clone(),
            }))
        }

        ClientMessage::Export { path, format } => {
            let (tree, data) = match sandbox.export(path, *format).await? {
                Exported::Tree(tree) => (Some(tree), None),
                Exported::Binary(bytes) => (
                    None,
                    Some(base64::engine::general_purpose::STANDARD.encode(bytes)),
                ),
            };
            Ok(Some(ServerMessage::Exported {
                path: path.clone(),
                format: *format,
                tree,
                data,
            }))
        }

        _ => Ok(None),
    }
}
