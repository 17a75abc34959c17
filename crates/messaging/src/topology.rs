//! 拓扑管理
//!
//! 每个部署一个 fan-out 广播交换器；每个消费服务一个持久队列，无条件绑定到广播交换器；
//! 开启重试时额外声明一个 direct 重试交换器，服务队列以自身队列名为路由键绑定到它。

use crate::envelope::ServiceType;
use crate::error::{BrokerError, BrokerResult};
use crate::transport::{BrokerChannel, ExchangeKind, QueueOptions};
use config::BrokerConfig;
use tracing::info;

/// 拓扑描述，启动时创建一次，之后不可变
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    broadcast_exchange: String,
    retry_exchange: String,
    retry_enabled: bool,
    queue_options: QueueOptions,
}

impl Topology {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            broadcast_exchange: config.exchange_name.clone(),
            retry_exchange: config.retry_exchange_name.clone(),
            retry_enabled: config.enable_retry,
            queue_options: QueueOptions {
                durable: config.queue_durable,
                auto_delete: config.queue_auto_delete,
            },
        }
    }

    pub fn broadcast_exchange(&self) -> &str {
        &self.broadcast_exchange
    }

    pub fn retry_exchange(&self) -> &str {
        &self.retry_exchange
    }

    pub fn retry_enabled(&self) -> bool {
        self.retry_enabled
    }

    /// 服务的队列名
    pub fn queue_name(service: &ServiceType) -> String {
        format!("{}.queue", service)
    }

    /// 声明广播交换器，开启重试时再声明重试交换器
    pub async fn declare_exchanges(&self, channel: &dyn BrokerChannel) -> BrokerResult<()> {
        channel
            .declare_exchange(&self.broadcast_exchange, ExchangeKind::Fanout, true)
            .await
            .map_err(|e| BrokerError::connection(format!("声明广播交换器失败: {}", e)))?;

        if self.retry_enabled {
            channel
                .declare_exchange(&self.retry_exchange, ExchangeKind::Direct, true)
                .await
                .map_err(|e| BrokerError::connection(format!("声明重试交换器失败: {}", e)))?;
        }
        Ok(())
    }

    /// 声明（或复用）服务队列并完成绑定，返回队列名
    pub async fn declare_service_queue(
        &self,
        channel: &dyn BrokerChannel,
        service: &ServiceType,
    ) -> BrokerResult<String> {
        let queue = Self::queue_name(service);

        channel
            .declare_queue(&queue, self.queue_options)
            .await
            .map_err(|e| BrokerError::consume_setup(format!("声明队列 {} 失败: {}", queue, e)))?;

        channel
            .bind_queue(&queue, &self.broadcast_exchange, "")
            .await
            .map_err(|e| BrokerError::consume_setup(format!("绑定队列 {} 失败: {}", queue, e)))?;

        if self.retry_enabled {
            channel
                .bind_queue(&queue, &self.retry_exchange, &queue)
                .await
                .map_err(|e| {
                    BrokerError::consume_setup(format!("绑定重试队列 {} 失败: {}", queue, e))
                })?;
        }

        info!(queue = %queue, exchange = %self.broadcast_exchange, "服务队列已就绪");
        Ok(queue)
    }
}
