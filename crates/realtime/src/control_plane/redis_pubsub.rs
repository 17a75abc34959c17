//! Redis Pub/Sub 实现

use super::{ControlPlane, PayloadStream};
use crate::error::{ControlPlaneError, ControlPlaneResult};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::{debug, info};

/// 基于 Redis 的发布订阅
///
/// 发布复用一条自动重连的连接；每次订阅使用独立的 PubSub 连接。
#[derive(Clone)]
pub struct RedisControlPlane {
    client: Client,
    publisher: ConnectionManager,
}

impl RedisControlPlane {
    /// 连接 Redis
    pub async fn connect(url: &str) -> ControlPlaneResult<Self> {
        let client = Client::open(url).map_err(|e| ControlPlaneError::ConnectionError {
            message: format!("创建 Redis 客户端失败: {}", e),
        })?;

        let publisher = ConnectionManager::new(client.clone()).await.map_err(|e| {
            ControlPlaneError::ConnectionError {
                message: format!("连接 Redis 失败: {}", e),
            }
        })?;

        info!("Redis 发布订阅已连接");
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl ControlPlane for RedisControlPlane {
    async fn publish(&self, channel: &str, payload: String) -> ControlPlaneResult<usize> {
        let mut conn = self.publisher.clone();
        let receivers: usize =
            conn.publish(channel, payload)
                .await
                .map_err(|e| ControlPlaneError::PublishError {
                    message: format!("发布到频道 {} 失败: {}", channel, e),
                })?;

        debug!(channel = %channel, receivers, "已发布到 Redis 频道");
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> ControlPlaneResult<PayloadStream> {
        let mut pubsub =
            self.client
                .get_async_pubsub()
                .await
                .map_err(|e| ControlPlaneError::ConnectionError {
                    message: format!("获取 PubSub 连接失败: {}", e),
                })?;

        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| ControlPlaneError::SubscribeError {
                message: format!("订阅频道 {} 失败: {}", channel, e),
            })?;

        info!(channel = %channel, "已订阅 Redis 频道");

        let stream = pubsub
            .into_on_message()
            .map(|msg| msg.get_payload::<String>().map_err(ControlPlaneError::from));
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_subscribe_against_live_redis() {
        // 需要运行中的 Redis 实例
        if std::env::var("REDIS_INTEGRATION_TEST").is_ok() {
            let url = std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
            let plane = RedisControlPlane::connect(&url).await.unwrap();

            let mut stream = plane.subscribe("realtime_test_channel").await.unwrap();
            let receivers = plane
                .publish("realtime_test_channel", "u1:online".to_string())
                .await
                .unwrap();
            assert!(receivers >= 1);

            let payload = stream.next().await.unwrap().unwrap();
            assert_eq!(payload, "u1:online");
        }
    }

    #[tokio::test]
    async fn test_invalid_url_is_connection_error() {
        let result = RedisControlPlane::connect("not-a-redis-url").await;
        assert!(matches!(
            result,
            Err(ControlPlaneError::ConnectionError { .. })
        ));
    }
}
