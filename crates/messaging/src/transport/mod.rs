//! 消息代理传输层
//!
//! 把交换器/队列/绑定的语义抽象为 [`BrokerChannel`]，客户端只依赖该接口。
//! - [`kafka`]：生产环境实现，交换器映射为主题，服务队列映射为消费者组。
//! - [`memory`]：进程内实现，用于测试和单进程开发。

pub mod kafka;
pub mod memory;

use crate::error::BrokerResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use kafka::KafkaConnector;
pub use memory::{MemoryBroker, MemoryConnector};

/// 交换器类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// 复制到所有绑定队列
    Fanout,
    /// 按路由键精确匹配
    Direct,
}

/// 队列声明参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
}

/// 待发布的消息及其属性
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub content_type: &'static str,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub priority: u8,
    pub headers: HashMap<String, String>,
    /// 代理重启后仍保留
    pub persistent: bool,
    /// 至少要路由到一个队列
    pub mandatory: bool,
}

/// 投递确认
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> BrokerResult<()>;
    async fn nack(&self, requeue: bool) -> BrokerResult<()>;
}

/// 一次投递
pub struct Delivery {
    pub body: Vec<u8>,
    pub exchange: String,
    pub redelivered: bool,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(body: Vec<u8>, exchange: impl Into<String>, acker: Box<dyn Acker>) -> Self {
        Self {
            body,
            exchange: exchange.into(),
            redelivered: false,
            acker,
        }
    }

    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// 确认，消息从队列移除
    pub async fn ack(self) -> BrokerResult<()> {
        self.acker.ack().await
    }

    /// 否认；`requeue == false` 时消息被丢弃或进入代理的死信配置
    pub async fn nack(self, requeue: bool) -> BrokerResult<()> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("bytes", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// 队列的投递流，通道断开时结束
pub type DeliveryStream = mpsc::UnboundedReceiver<Delivery>;

/// 一条传输连接上的逻辑通道
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// 传输层是否已报告关闭
    fn is_closed(&self) -> bool;

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool)
        -> BrokerResult<()>;

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> BrokerResult<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> BrokerResult<()>;

    /// 开始消费队列，不自动确认
    async fn consume(&self, queue: &str) -> BrokerResult<DeliveryStream>;

    async fn close(&self) -> BrokerResult<()>;
}

/// 建立连接并打开通道
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> BrokerResult<Arc<dyn BrokerChannel>>;
}
