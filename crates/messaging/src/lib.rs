//! 服务间异步消息
//!
//! 提供消息信封、拓扑管理、重试策略以及带自动重连的消息代理客户端。
//! 传输层通过 [`transport::BrokerConnector`] 注入：生产环境使用 Kafka，
//! 测试和单进程开发使用内存代理。

pub mod client;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod retry;
pub mod topology;
pub mod transport;

pub use client::BrokerClient;
pub use consumer::{handler_fn, HandlerError, MessageHandler};
pub use envelope::{Envelope, Headers, ServiceType, MAX_PRIORITY};
pub use error::{BrokerError, BrokerResult};
pub use retry::{Backoff, RetryPolicy};
pub use topology::Topology;
pub use transport::{BrokerConnector, KafkaConnector, MemoryBroker};
