//! 推送给客户端的事件

use serde::{Deserialize, Serialize};
use std::fmt;

/// 用户在线状态
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PresenceStatus {
    Online,
    Offline,
    Other(String),
}

impl PresenceStatus {
    pub fn as_str(&self) -> &str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Offline => "offline",
            PresenceStatus::Other(status) => status,
        }
    }
}

impl From<&str> for PresenceStatus {
    fn from(value: &str) -> Self {
        match value {
            "online" => PresenceStatus::Online,
            "offline" => PresenceStatus::Offline,
            other => PresenceStatus::Other(other.to_string()),
        }
    }
}

impl From<String> for PresenceStatus {
    fn from(value: String) -> Self {
        PresenceStatus::from(value.as_str())
    }
}

impl From<PresenceStatus> for String {
    fn from(value: PresenceStatus) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// WebSocket 客户端收到的 JSON 事件，`event` 字段区分类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum HubEvent {
    /// 用户上线/下线
    #[serde(rename = "status_update")]
    StatusUpdate {
        #[serde(rename = "userID")]
        user_id: String,
        status: PresenceStatus,
    },

    /// 聊天室新消息
    #[serde(rename = "send_Message")]
    ChatMessage {
        #[serde(rename = "chatID")]
        chat_id: String,
        content: String,
        #[serde(rename = "senderID")]
        sender_id: String,
    },
}

impl HubEvent {
    pub fn status_update(user_id: impl Into<String>, status: PresenceStatus) -> Self {
        HubEvent::StatusUpdate {
            user_id: user_id.into(),
            status,
        }
    }

    pub fn chat_message(
        chat_id: impl Into<String>,
        content: impl Into<String>,
        sender_id: impl Into<String>,
    ) -> Self {
        HubEvent::ChatMessage {
            chat_id: chat_id.into(),
            content: content.into(),
            sender_id: sender_id.into(),
        }
    }

    /// 事件所属的路由键：用户ID或聊天室ID
    pub fn routing_key(&self) -> &str {
        match self {
            HubEvent::StatusUpdate { user_id, .. } => user_id,
            HubEvent::ChatMessage { chat_id, .. } => chat_id,
        }
    }
}
