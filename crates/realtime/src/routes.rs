//! HTTP 与 WebSocket 路由
//!
//! - `GET /ws/users/{user_id}`：用户在线状态连接，接入时发布 online，断开时发布 offline。
//! - `GET /ws/chats/{chat_id}`：聊天室消息连接。
//! - `POST /api/chats/{chat_id}/messages`：向所有实例上该聊天室的连接推送消息。

use crate::error::ApiError;
use crate::event::PresenceStatus;
use crate::handle::{ChannelHandle, ConnectionHandle, OutboundFrame};
use crate::hub::Hub;
use crate::publisher::StatusPublisher;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// 每个连接的发送缓冲区大小
pub const SEND_BUFFER: usize = 64;

#[derive(Clone)]
pub struct RealtimeState {
    pub user_hub: Hub,
    pub chat_hub: Hub,
    pub publisher: StatusPublisher,
}

pub fn router(state: RealtimeState) -> Router {
    Router::new()
        .route("/ws/users/{user_id}", get(user_socket))
        .route("/ws/chats/{chat_id}", get(chat_socket))
        .route("/api/chats/{chat_id}/messages", post(send_chat_message))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct SendMessagePayload {
    sender_id: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct SendMessageResponse {
    receivers: usize,
}

async fn user_socket(
    ws: WebSocketUpgrade,
    Path(user_id): Path<String>,
    State(state): State<RealtimeState>,
) -> Response {
    ws.on_upgrade(move |socket| {
        serve_connection(socket, state.user_hub, user_id, Some(state.publisher))
    })
}

async fn chat_socket(
    ws: WebSocketUpgrade,
    Path(chat_id): Path<String>,
    State(state): State<RealtimeState>,
) -> Response {
    ws.on_upgrade(move |socket| serve_connection(socket, state.chat_hub, chat_id, None))
}

async fn send_chat_message(
    State(state): State<RealtimeState>,
    Path(chat_id): Path<String>,
    Json(payload): Json<SendMessagePayload>,
) -> Result<(StatusCode, Json<SendMessageResponse>), ApiError> {
    if payload.content.is_empty() || payload.sender_id.is_empty() {
        return Err(ApiError::bad_request("content 和 sender_id 不能为空"));
    }

    let receivers = state
        .publisher
        .publish_chat_message(&chat_id, &payload.content, &payload.sender_id)
        .await
        .map_err(|e| {
            error!(chat_id = %chat_id, "发布聊天消息失败: {}", e);
            ApiError::from(e)
        })?;

    Ok((StatusCode::ACCEPTED, Json(SendMessageResponse { receivers })))
}

/// 单个连接的生命周期：注册、读循环检测断开、注销
async fn serve_connection(
    socket: WebSocket,
    hub: Hub,
    routing_key: String,
    presence: Option<StatusPublisher>,
) {
    let (handle, frames) = ChannelHandle::new(SEND_BUFFER);
    let handle: Arc<dyn ConnectionHandle> = Arc::new(handle);
    let connection_id = handle.id();
    let (sink, mut incoming) = socket.split();
    let writer = tokio::spawn(write_frames(sink, frames));

    if let Err(e) = hub.register(routing_key.clone(), Arc::clone(&handle)).await {
        error!(routing_key = %routing_key, "注册连接失败: {}", e);
        handle.close();
        let _ = writer.await;
        return;
    }
    info!(hub = %hub.name(), routing_key = %routing_key, connection_id = %connection_id, "WebSocket 连接已建立");

    if let Some(publisher) = &presence {
        announce(publisher, &routing_key, PresenceStatus::Online).await;
    }

    while let Some(message) = incoming.next().await {
        match message {
            Ok(WsMessage::Close(_)) => {
                debug!(connection_id = %connection_id, "收到关闭消息");
                break;
            }
            Ok(_) => {
                // 客户端消息不做处理，读循环只用于检测断开
            }
            Err(e) => {
                debug!(connection_id = %connection_id, "读取失败: {}", e);
                break;
            }
        }
    }

    if let Err(e) = hub.unregister(routing_key.clone(), handle).await {
        warn!(routing_key = %routing_key, "注销连接失败: {}", e);
    }
    if let Some(publisher) = &presence {
        announce(publisher, &routing_key, PresenceStatus::Offline).await;
    }
    let _ = writer.await;

    info!(hub = %hub.name(), routing_key = %routing_key, connection_id = %connection_id, "WebSocket 连接已断开");
}

/// 在线状态发布失败不影响连接本身
async fn announce(publisher: &StatusPublisher, user_id: &str, status: PresenceStatus) {
    if let Err(e) = publisher.publish_status(user_id, status.clone()).await {
        warn!(user_id = %user_id, status = %status, "发布在线状态失败: {}", e);
    }
}

/// 写任务：把帧写入套接字，收到关闭帧或写入失败时退出
async fn write_frames(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut frames: mpsc::Receiver<OutboundFrame>,
) {
    while let Some(frame) = frames.recv().await {
        match frame {
            OutboundFrame::Text(text) => {
                if sink.send(WsMessage::Text(text.into())).await.is_err() {
                    debug!("WebSocket 写入失败");
                    break;
                }
            }
            OutboundFrame::Close => {
                let _ = sink.send(WsMessage::Close(None)).await;
                break;
            }
        }
    }
}
