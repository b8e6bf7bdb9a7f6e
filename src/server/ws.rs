use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, trace, warn};

use crate::compile::process_registry::ProcessEvent;
use crate::config::{ServiceConfig, Visibility};
use crate::server::context::{AppError, ServiceContext};
use crate::server::handlers;
use crate::server::protocol::{
    capabilities, Encoding, RequestEnvelope, RequestStub, ResponseEnvelope, ServerMessage,
    ServiceIdentity, METHODS, PROTOCOL_VERSION,
};

/// 单个连接待发送响应的缓冲上限
const OUTBOUND_BUFFER: usize = 256;

/// Run the WebSocket server described by `config` until Ctrl-C.
pub async fn run_server(config: ServiceConfig) -> anyhow::Result<()> {
    if config.service.visibility == Visibility::Protected && config.server.auth_token.is_none() {
        anyhow::bail!("visibility = \"protected\" requires server.auth_token");
    }

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let ctx = ServiceContext::from_config(config)?;
    ctx.refresh_tree().await;

    let listener = TcpListener::bind(&addr).await?;
    info!(
        "Listening on ws://{}/ws (protocol v{}, service '{}')",
        addr, PROTOCOL_VERSION, ctx.config.service.id
    );

    let processes = ctx.processes.clone();
    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 服务退出时终止所有仍在运行的受管进程
    processes.lock().await.kill_all();
    info!("Server stopped");
    Ok(())
}

/// Serve on an already bound listener. Used by tests to pick an ephemeral port.
pub async fn serve(listener: TcpListener, ctx: ServiceContext) -> std::io::Result<()> {
    axum::serve(listener, router(ctx)).await
}

pub fn router(ctx: ServiceContext) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(ctx)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[derive(Debug, Default, Deserialize)]
struct ConnectQuery {
    token: Option<String>,
}

fn authorized(config: &ServiceConfig, token: Option<&str>) -> bool {
    match config.service.visibility {
        Visibility::Public => true,
        Visibility::Protected => match (&config.server.auth_token, token) {
            (Some(expected), Some(given)) => expected == given,
            _ => false,
        },
    }
}

/// WebSocket upgrade handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(ctx): State<ServiceContext>,
) -> Response {
    if !authorized(&ctx.config, query.token.as_deref()) {
        warn!("Rejected WebSocket connection: invalid token");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, ctx))
}

/// Handle a WebSocket connection
async fn handle_socket(mut socket: WebSocket, ctx: ServiceContext) {
    let session_id = uuid::Uuid::new_v4().to_string();
    info!(session_id = %session_id, "New WebSocket connection established");

    // 请求在独立 task 中执行，响应统一经由此通道回到写端
    let (out_tx, mut out_rx) = mpsc::channel::<(ResponseEnvelope, Encoding)>(OUTBOUND_BUFFER);
    // 连接断开时置 true，正在执行的 runBuild 在下一阶段边界退出
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let mut process_rx = ctx.processes.lock().await.subscribe();
    let mut ready_rx = ctx.sandbox.subscribe_ready();
    let mut tree_rx = ctx.tree_cache.subscribe();

    // 推送事件沿用最近一次请求的编码
    let mut encoding = Encoding::Json;

    let hello = ServerMessage::Hello {
        version: PROTOCOL_VERSION,
        session_id: session_id.clone(),
        service: ServiceIdentity {
            id: ctx.config.service.id.clone(),
            name: ctx.config.service.name.clone(),
            description: ctx.config.service.description.clone(),
        },
        capabilities: capabilities(),
    };
    if let Err(e) = send_message(&mut socket, &ResponseEnvelope::event(hello), encoding).await {
        error!("Failed to send Hello message: {}", e);
        return;
    }

    loop {
        tokio::select! {
            biased;  // 优先处理 WebSocket 消息

            msg_result = socket.recv() => {
                let (data, frame_encoding) = match msg_result {
                    Some(Ok(Message::Text(text))) => (text.into_bytes(), Encoding::Json),
                    Some(Ok(Message::Binary(data))) => (data, Encoding::MessagePack),
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket connection closed by client");
                        break;
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        // Handled automatically by axum
                        continue;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        break;
                    }
                    None => {
                        info!("WebSocket connection closed (recv returned None)");
                        break;
                    }
                };
                trace!("Received client message: {} bytes", data.len());
                encoding = frame_encoding;
                spawn_request(data, frame_encoding, ctx.clone(), cancel_rx.clone(), out_tx.clone());
            }

            Some((response, response_encoding)) = out_rx.recv() => {
                if let Err(e) = send_message(&mut socket, &response, response_encoding).await {
                    warn!("Failed to send response: {}", e);
                    break;
                }
            }

            Ok(event) = process_rx.recv() => {
                let body = match event {
                    ProcessEvent::Output { process_id, data } => {
                        ServerMessage::ProcessOutput { process_id, data }
                    }
                    ProcessEvent::Exited { process_id, exit_code } => {
                        ServerMessage::ProcessExited { process_id, exit_code }
                    }
                };
                if let Err(e) = send_message(&mut socket, &ResponseEnvelope::event(body), encoding).await {
                    warn!("Failed to send process event: {}", e);
                    break;
                }
            }

            Ok(ready) = ready_rx.recv() => {
                let body = ServerMessage::ServerReady { port: ready.port, url: ready.url };
                if let Err(e) = send_message(&mut socket, &ResponseEnvelope::event(body), encoding).await {
                    warn!("Failed to send server_ready: {}", e);
                    break;
                }
            }

            Ok(()) = tree_rx.recv() => {
                if let Err(e) = send_message(&mut socket, &ResponseEnvelope::event(ServerMessage::TreeChanged), encoding).await {
                    warn!("Failed to send tree_changed: {}", e);
                    break;
                }
            }
        }
    }

    // 取消本连接发起的构建；受管进程不随连接结束
    let _ = cancel_tx.send(true);
    info!(session_id = %session_id, "WebSocket connection finished");
}

fn spawn_request(
    data: Vec<u8>,
    encoding: Encoding,
    ctx: ServiceContext,
    cancel: watch::Receiver<bool>,
    out_tx: mpsc::Sender<(ResponseEnvelope, Encoding)>,
) {
    tokio::spawn(async move {
        let (id, result) = match decode_request(&data, encoding) {
            Ok(envelope) => {
                debug!(id = ?envelope.id, "Dispatching request");
                let result = handlers::dispatch(&envelope.body, &ctx, cancel).await;
                (envelope.id, result)
            }
            Err((id, e)) => (id, Err(e)),
        };

        let body = match result {
            Ok(reply) => reply,
            Err(e) => {
                warn!(code = e.code(), "Request failed: {}", e);
                e.to_server_error()
            }
        };
        // 连接已关闭时丢弃
        let _ = out_tx.send((ResponseEnvelope { id, body }, encoding)).await;
    });
}

/// 解析请求信封；失败时尽量回显 `id`，并区分未知方法与参数错误
fn decode_request(
    data: &[u8],
    encoding: Encoding,
) -> Result<RequestEnvelope, (Option<String>, AppError)> {
    let err = match encoding.decode::<RequestEnvelope>(data) {
        Ok(envelope) => return Ok(envelope),
        Err(e) => e,
    };

    let stub: RequestStub = encoding.decode(data).unwrap_or_default();
    let app_err = match stub.method {
        Some(method) if METHODS.contains(&method.as_str()) => AppError::InvalidParams(err),
        Some(method) => AppError::UnknownMethod(method),
        None => AppError::InvalidParams(format!("missing method: {}", err)),
    };
    Err((stub.id, app_err))
}

async fn send_message(
    socket: &mut WebSocket,
    msg: &ResponseEnvelope,
    encoding: Encoding,
) -> Result<(), String> {
    let bytes = encoding.encode(msg)?;
    let frame = match encoding {
        Encoding::Json => Message::Text(String::from_utf8(bytes).map_err(|e| e.to_string())?),
        Encoding::MessagePack => Message::Binary(bytes),
    };
    socket.send(frame).await.map_err(|e| e.to_string())
}
