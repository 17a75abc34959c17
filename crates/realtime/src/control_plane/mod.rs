//! 跨实例发布订阅
//!
//! 多个服务实例通过发布订阅频道互相转发在线状态和聊天消息。
//! - [`redis_pubsub`]：生产环境实现，基于 Redis Pub/Sub。
//! - [`local`]：进程内实现，用于测试和单实例部署。

pub mod codec;
pub mod local;
pub mod redis_pubsub;

use crate::error::ControlPlaneResult;
use async_trait::async_trait;
use futures_util::stream::BoxStream;

pub use codec::{ControlMessage, EventFamily};
pub use local::LocalControlPlane;
pub use redis_pubsub::RedisControlPlane;

/// 频道上的负载流；单条接收错误不会结束流
pub type PayloadStream = BoxStream<'static, ControlPlaneResult<String>>;

#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// 发布一条负载，返回收到的订阅者数量
    async fn publish(&self, channel: &str, payload: String) -> ControlPlaneResult<usize>;

    /// 订阅频道
    async fn subscribe(&self, channel: &str) -> ControlPlaneResult<PayloadStream>;
}
