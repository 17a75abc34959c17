//! 连接句柄
//!
//! 注册表只通过 [`ConnectionHandle`] 与连接交互：发送事件、关闭连接。
//! WebSocket 连接使用 [`ChannelHandle`]，由独立的写任务把帧写入套接字。

use crate::error::{HubError, HubResult};
use crate::event::HubEvent;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

/// 已建立的双工连接
pub trait ConnectionHandle: Send + Sync {
    /// 连接标识，注册表按它去重
    fn id(&self) -> Uuid;

    /// 发送一个事件；返回错误时注册表会移除并关闭该连接
    fn send(&self, event: &HubEvent) -> HubResult<()>;

    /// 关闭连接，可重复调用
    fn close(&self);
}

/// 写任务接收的帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Close,
}

/// 基于有界通道的连接句柄
pub struct ChannelHandle {
    id: Uuid,
    sender: mpsc::Sender<OutboundFrame>,
    closed: AtomicBool,
}

impl ChannelHandle {
    /// 创建句柄和写任务使用的接收端
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (sender, receiver) = mpsc::channel(buffer);
        let handle = Self {
            id: Uuid::new_v4(),
            sender,
            closed: AtomicBool::new(false),
        };
        (handle, receiver)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.sender.is_closed()
    }
}

impl ConnectionHandle for ChannelHandle {
    fn id(&self) -> Uuid {
        self.id
    }

    fn send(&self, event: &HubEvent) -> HubResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HubError::SendFailed {
                connection_id: self.id,
                message: "连接已关闭".to_string(),
            });
        }

        let text = serde_json::to_string(event).map_err(|e| HubError::SerializationError {
            message: e.to_string(),
        })?;

        match self.sender.try_send(OutboundFrame::Text(text)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                // 慢客户端丢弃本条事件，连接保留
                warn!(connection_id = %self.id, "发送缓冲区已满，丢弃事件");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(HubError::SendFailed {
                connection_id: self.id,
                message: "写任务已退出".to_string(),
            }),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // 写任务已退出时无需通知
        let _ = self.sender.try_send(OutboundFrame::Close);
    }
}
