//! 频道负载编解码
//!
//! 发布时使用带 `kind` 标签的 JSON；接收时同时兼容旧的冒号分隔格式：
//! 在线状态 `"<userID>:<status>"`，聊天消息 `"<chatID>:<content>:<senderID>"`。
//! 冒号格式字段数必须完全匹配，否则视为无效负载。

use crate::error::{ControlPlaneError, ControlPlaneResult};
use crate::event::{HubEvent, PresenceStatus};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 事件族，每族使用一个频道
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventFamily {
    Presence,
    Chat,
}

impl EventFamily {
    /// 冒号格式的字段数
    fn legacy_arity(self) -> usize {
        match self {
            EventFamily::Presence => 2,
            EventFamily::Chat => 3,
        }
    }
}

impl fmt::Display for EventFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventFamily::Presence => f.write_str("presence"),
            EventFamily::Chat => f.write_str("chat"),
        }
    }
}

/// 频道上传输的消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlMessage {
    Presence {
        user_id: String,
        status: PresenceStatus,
    },
    Chat {
        chat_id: String,
        content: String,
        sender_id: String,
    },
}

impl ControlMessage {
    pub fn presence(user_id: impl Into<String>, status: PresenceStatus) -> Self {
        ControlMessage::Presence {
            user_id: user_id.into(),
            status,
        }
    }

    pub fn chat(
        chat_id: impl Into<String>,
        content: impl Into<String>,
        sender_id: impl Into<String>,
    ) -> Self {
        ControlMessage::Chat {
            chat_id: chat_id.into(),
            content: content.into(),
            sender_id: sender_id.into(),
        }
    }

    pub fn family(&self) -> EventFamily {
        match self {
            ControlMessage::Presence { .. } => EventFamily::Presence,
            ControlMessage::Chat { .. } => EventFamily::Chat,
        }
    }

    pub fn routing_key(&self) -> &str {
        match self {
            ControlMessage::Presence { user_id, .. } => user_id,
            ControlMessage::Chat { chat_id, .. } => chat_id,
        }
    }

    pub fn encode(&self) -> ControlPlaneResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// 按事件族解码负载
    pub fn decode(family: EventFamily, payload: &str) -> ControlPlaneResult<Self> {
        let message = if payload.trim_start().starts_with('{') {
            serde_json::from_str::<ControlMessage>(payload)
                .map_err(|e| ControlPlaneError::invalid_payload(format!("JSON 负载无效: {}", e)))?
        } else {
            Self::decode_legacy(family, payload)?
        };

        if message.family() != family {
            return Err(ControlPlaneError::invalid_payload(format!(
                "{} 频道收到 {} 消息",
                family,
                message.family()
            )));
        }
        if message.routing_key().is_empty() {
            return Err(ControlPlaneError::invalid_payload("路由键为空"));
        }
        Ok(message)
    }

    fn decode_legacy(family: EventFamily, payload: &str) -> ControlPlaneResult<Self> {
        let parts: Vec<&str> = payload.split(':').collect();
        if parts.len() != family.legacy_arity() {
            return Err(ControlPlaneError::invalid_payload(format!(
                "{} 负载需要 {} 个字段，实际 {} 个",
                family,
                family.legacy_arity(),
                parts.len()
            )));
        }

        Ok(match family {
            EventFamily::Presence => ControlMessage::presence(parts[0], parts[1].into()),
            EventFamily::Chat => ControlMessage::chat(parts[0], parts[1], parts[2]),
        })
    }

    /// 转换为推送给客户端的事件
    pub fn into_event(self) -> HubEvent {
        match self {
            ControlMessage::Presence { user_id, status } => HubEvent::StatusUpdate { user_id, status },
            ControlMessage::Chat {
                chat_id,
                content,
                sender_id,
            } => HubEvent::ChatMessage {
                chat_id,
                content,
                sender_id,
            },
        }
    }
}
