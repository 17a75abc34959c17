//! 在线状态与聊天消息发布

use crate::control_plane::{ControlMessage, ControlPlane};
use crate::error::ControlPlaneResult;
use crate::event::PresenceStatus;
use config::RedisConfig;
use std::sync::Arc;
use tracing::debug;

/// 向各实例广播在线状态和聊天消息
#[derive(Clone)]
pub struct StatusPublisher {
    control_plane: Arc<dyn ControlPlane>,
    status_channel: String,
    chat_channel: String,
}

impl StatusPublisher {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        status_channel: impl Into<String>,
        chat_channel: impl Into<String>,
    ) -> Self {
        Self {
            control_plane,
            status_channel: status_channel.into(),
            chat_channel: chat_channel.into(),
        }
    }

    pub fn from_config(control_plane: Arc<dyn ControlPlane>, config: &RedisConfig) -> Self {
        Self::new(
            control_plane,
            config.status_channel.clone(),
            config.chat_channel.clone(),
        )
    }

    pub async fn publish_status(
        &self,
        user_id: &str,
        status: PresenceStatus,
    ) -> ControlPlaneResult<usize> {
        let payload = ControlMessage::presence(user_id, status.clone()).encode()?;
        let receivers = self
            .control_plane
            .publish(&self.status_channel, payload)
            .await?;
        debug!(user_id = %user_id, status = %status, receivers, "在线状态已发布");
        Ok(receivers)
    }

    pub async fn publish_chat_message(
        &self,
        chat_id: &str,
        content: &str,
        sender_id: &str,
    ) -> ControlPlaneResult<usize> {
        let payload = ControlMessage::chat(chat_id, content, sender_id).encode()?;
        let receivers = self
            .control_plane
            .publish(&self.chat_channel, payload)
            .await?;
        debug!(chat_id = %chat_id, sender_id = %sender_id, receivers, "聊天消息已发布");
        Ok(receivers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::{EventFamily, LocalControlPlane};
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_status_published_as_tagged_json() {
        let plane = Arc::new(LocalControlPlane::default());
        let mut stream = plane.subscribe("user_status").await.unwrap();
        let publisher = StatusPublisher::new(plane.clone(), "user_status", "send_Message");

        publisher
            .publish_status("u1", PresenceStatus::Online)
            .await
            .unwrap();

        let payload = stream.next().await.unwrap().unwrap();
        assert_eq!(
            ControlMessage::decode(EventFamily::Presence, &payload).unwrap(),
            ControlMessage::presence("u1", PresenceStatus::Online)
        );
    }

    #[tokio::test]
    async fn test_chat_message_goes_to_chat_channel() {
        let plane = Arc::new(LocalControlPlane::default());
        let mut chat = plane.subscribe("send_Message").await.unwrap();
        let publisher = StatusPublisher::from_config(plane.clone(), &RedisConfig::default());

        let receivers = publisher
            .publish_chat_message("c1", "a:b", "u7")
            .await
            .unwrap();
        assert_eq!(receivers, 1);

        let payload = chat.next().await.unwrap().unwrap();
        assert_eq!(
            ControlMessage::decode(EventFamily::Chat, &payload).unwrap(),
            ControlMessage::chat("c1", "a:b", "u7")
        );
    }
}
