//! 消息代理客户端
//!
//! 显式构造并注入使用，不存在进程级单例。客户端持有一条传输通道，
//! 所有发布都经由内部互斥锁串行化；后台健康检查任务在通道关闭后按固定间隔重连，
//! 重连成功后递增代次，消费循环据此重新订阅。

use crate::consumer::{self, MessageHandler};
use crate::envelope::{Envelope, ServiceType};
use crate::error::{BrokerError, BrokerResult};
use crate::retry::RetryPolicy;
use crate::topology::Topology;
use crate::transport::{BrokerChannel, BrokerConnector, OutboundMessage};
use config::BrokerConfig;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

pub(crate) const CONTENT_TYPE_JSON: &str = "application/json";

/// 客户端内部共享状态，健康检查与消费任务通过它访问通道
pub(crate) struct ClientShared {
    pub(crate) service: ServiceType,
    pub(crate) config: BrokerConfig,
    pub(crate) topology: Topology,
    pub(crate) retry: RetryPolicy,
    connector: Arc<dyn BrokerConnector>,
    channel: Mutex<Arc<dyn BrokerChannel>>,
    closed: AtomicBool,
    connected: AtomicBool,
    reconnects: AtomicU64,
    generation: watch::Sender<u64>,
    monitor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ClientShared {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 当前通道
    pub(crate) async fn channel(&self) -> Arc<dyn BrokerChannel> {
        Arc::clone(&*self.channel.lock().await)
    }

    /// 订阅重连代次
    pub(crate) fn watch_generation(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// 建立连接并声明交换器
    async fn open_channel(
        connector: &dyn BrokerConnector,
        topology: &Topology,
        connect_timeout: Duration,
    ) -> BrokerResult<Arc<dyn BrokerChannel>> {
        let channel = timeout(connect_timeout, connector.connect())
            .await
            .map_err(|_| BrokerError::connection("连接消息代理超时"))??;

        if let Err(e) = topology.declare_exchanges(channel.as_ref()).await {
            let _ = channel.close().await;
            return Err(e);
        }
        Ok(channel)
    }

    /// 把已编码的消息写入指定交换器
    pub(crate) async fn publish_envelope(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> BrokerResult<()> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }

        let body = envelope
            .to_bytes()
            .map_err(|e| BrokerError::publish(format!("编码消息失败: {}", e)))?;

        let message = OutboundMessage {
            body,
            content_type: CONTENT_TYPE_JSON,
            message_id: envelope.id.clone().unwrap_or_default(),
            timestamp: envelope.created_at.unwrap_or_else(chrono::Utc::now),
            priority: envelope.priority,
            headers: header_strings(&envelope.headers),
            persistent: true,
            mandatory: true,
        };

        let channel = self.channel.lock().await;
        if channel.is_closed() {
            return Err(BrokerError::publish("通道已关闭，等待重连"));
        }
        channel
            .publish(exchange, routing_key, message)
            .await
            .map_err(|e| match e {
                BrokerError::PublishError { .. } => e,
                other => BrokerError::publish(other.to_string()),
            })
    }

    /// 重连直到成功或客户端关闭
    async fn reconnect(&self) {
        let mut attempt: u32 = 0;
        loop {
            if self.is_closed() {
                return;
            }
            attempt += 1;

            match Self::open_channel(
                self.connector.as_ref(),
                &self.topology,
                self.config.connection_timeout(),
            )
            .await
            {
                Ok(channel) => {
                    if self.is_closed() {
                        let _ = channel.close().await;
                        return;
                    }
                    *self.channel.lock().await = channel;
                    self.connected.store(true, Ordering::SeqCst);
                    self.reconnects.fetch_add(1, Ordering::SeqCst);
                    self.generation.send_modify(|generation| *generation += 1);
                    info!(service = %self.service, attempt, "已重新连接到消息代理");
                    return;
                }
                Err(e) => {
                    error!(
                        service = %self.service,
                        attempt,
                        "重连消息代理失败: {}，{} 毫秒后重试",
                        e,
                        self.config.reconnect_delay_ms
                    );
                    sleep(self.config.reconnect_delay()).await;
                }
            }
        }
    }

    fn monitor_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.monitor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// 代理消息属性只接受字符串头
fn header_strings(headers: &crate::envelope::Headers) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(key, value)| {
            let value = match value {
                serde_json::Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            (key.clone(), value)
        })
        .collect()
}

/// 健康检查循环
async fn health_monitor(shared: Arc<ClientShared>) {
    let interval = shared.config.health_check_interval();
    debug!(service = %shared.service, "健康检查任务启动，间隔 {:?}", interval);

    loop {
        sleep(interval).await;
        if shared.is_closed() {
            break;
        }

        let channel_closed = shared.channel.lock().await.is_closed();
        if !channel_closed {
            continue;
        }

        shared.connected.store(false, Ordering::SeqCst);
        warn!(service = %shared.service, "消息代理连接已断开，开始重连");
        shared.reconnect().await;
    }

    debug!(service = %shared.service, "健康检查任务退出");
}

/// 消息代理客户端，克隆共享同一连接
#[derive(Clone)]
pub struct BrokerClient {
    shared: Arc<ClientShared>,
}

impl BrokerClient {
    /// 连接消息代理并声明交换器，随后启动健康检查任务
    ///
    /// 失败返回 `ConnectionError`，调用方应视为启动失败。
    pub async fn connect(
        config: BrokerConfig,
        service: ServiceType,
        connector: Arc<dyn BrokerConnector>,
    ) -> BrokerResult<Self> {
        let topology = Topology::from_config(&config);
        let retry = RetryPolicy::from_config(&config);

        info!(
            service = %service,
            url = %config.sanitized_url(),
            "正在连接消息代理"
        );

        let channel =
            ClientShared::open_channel(connector.as_ref(), &topology, config.connection_timeout())
                .await
                .map_err(|e| match e {
                    BrokerError::ConnectionError { .. } => e,
                    other => BrokerError::connection(other.to_string()),
                })?;

        let (generation, _) = watch::channel(0u64);
        let shared = Arc::new(ClientShared {
            service,
            config,
            topology,
            retry,
            connector,
            channel: Mutex::new(channel),
            closed: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            reconnects: AtomicU64::new(0),
            generation,
            monitor: std::sync::Mutex::new(None),
        });

        let monitor = tokio::spawn(health_monitor(Arc::clone(&shared)));
        *shared.monitor_slot() = Some(monitor);

        info!(service = %shared.service, "消息代理客户端已就绪");
        Ok(Self { shared })
    }

    pub fn service(&self) -> &ServiceType {
        &self.shared.service
    }

    pub fn topology(&self) -> &Topology {
        &self.shared.topology
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.shared.retry
    }

    /// 最近一次健康检查时连接是否可用
    pub fn is_connected(&self) -> bool {
        !self.shared.is_closed() && self.shared.connected.load(Ordering::SeqCst)
    }

    /// 启动以来成功重连的次数
    pub fn reconnect_count(&self) -> u64 {
        self.shared.reconnects.load(Ordering::SeqCst)
    }

    /// 发布消息，使用配置的写超时作为截止时间
    pub async fn publish(&self, envelope: Envelope) -> BrokerResult<()> {
        self.publish_with_timeout(envelope, self.shared.config.write_timeout())
            .await
    }

    /// 发布消息到广播交换器
    ///
    /// 缺失的 `id`/`created` 会被补齐，`from_service` 盖章为本服务；
    /// 发给自身的消息返回 `InvalidTargetError`。超过 `deadline` 返回 `TimeoutError`。
    pub async fn publish_with_timeout(
        &self,
        envelope: Envelope,
        deadline: Duration,
    ) -> BrokerResult<()> {
        if self.shared.is_closed() {
            return Err(BrokerError::Closed);
        }

        let envelope = envelope.prepare_for_publish(&self.shared.service)?;
        let exchange = self.shared.topology.broadcast_exchange().to_string();

        timeout(
            deadline,
            self.shared.publish_envelope(&exchange, "", &envelope),
        )
        .await
        .map_err(|_| BrokerError::TimeoutError {
            operation: format!("发布消息 {}", envelope.kind),
        })??;

        debug!(
            service = %self.shared.service,
            message_id = ?envelope.id,
            message_type = %envelope.kind,
            to_service = ?envelope.to_service,
            "消息已发布"
        );
        Ok(())
    }

    /// 声明本服务的队列并启动消费循环
    ///
    /// 队列声明或绑定失败返回 `ConsumeSetupError`。
    pub async fn consume<H>(&self, handler: Arc<H>) -> BrokerResult<()>
    where
        H: MessageHandler + 'static,
    {
        if self.shared.is_closed() {
            return Err(BrokerError::Closed);
        }

        let (queue, deliveries) = consumer::subscribe(&self.shared).await?;
        // 消费循环在投递流结束且客户端已关闭后自行退出
        tokio::spawn(consumer::delivery_loop(
            Arc::clone(&self.shared),
            queue,
            deliveries,
            handler,
        ));
        Ok(())
    }

    /// 关闭客户端，可重复调用
    ///
    /// 先标记关闭以阻止重连，再关闭通道。
    pub async fn close(&self) -> BrokerResult<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.connected.store(false, Ordering::SeqCst);

        if let Some(monitor) = self.shared.monitor_slot().take() {
            monitor.abort();
        }

        let result = self.shared.channel.lock().await.close().await;
        self.shared.generation.send_modify(|generation| *generation += 1);
        info!(service = %self.shared.service, "消息代理客户端已关闭");
        result
    }
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("service", &self.shared.service)
            .field("connected", &self.is_connected())
            .field("reconnects", &self.reconnect_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryBroker;
    use serde_json::json;

    fn test_config() -> BrokerConfig {
        BrokerConfig {
            health_check_interval_ms: 100,
            reconnect_delay_ms: 100,
            ..BrokerConfig::default()
        }
    }

    #[test]
    fn test_header_strings_keeps_text_verbatim() {
        let mut headers = crate::envelope::Headers::new();
        headers.insert("trace".to_string(), json!("t-1"));
        headers.insert("attempt".to_string(), json!(2));

        let converted = header_strings(&headers);
        assert_eq!(converted["trace"], "t-1");
        assert_eq!(converted["attempt"], "2");
    }

    #[tokio::test]
    async fn test_connect_declares_exchanges() {
        let broker = MemoryBroker::new();
        let client = BrokerClient::connect(test_config(), ServiceType::Auth, broker.connector())
            .await
            .unwrap();

        assert!(client.is_connected());
        assert_eq!(client.reconnect_count(), 0);
        assert!(broker.exchange_kind("microservices.broadcast").is_some());
        assert!(broker.exchange_kind("microservices.retry").is_some());
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(1);

        let result =
            BrokerClient::connect(test_config(), ServiceType::Auth, broker.connector()).await;
        assert!(matches!(result, Err(BrokerError::ConnectionError { .. })));
    }

    #[tokio::test]
    async fn test_publish_after_close_fails() {
        let broker = MemoryBroker::new();
        let client = BrokerClient::connect(test_config(), ServiceType::Auth, broker.connector())
            .await
            .unwrap();
        client.close().await.unwrap();

        let result = client
            .publish(Envelope::new("user_created", json!({})))
            .await;
        assert!(matches!(result, Err(BrokerError::Closed)));
        assert!(!client.is_connected());
    }
}
