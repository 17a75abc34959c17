//! Kafka 传输实现
//!
//! 交换器映射为主题；服务队列映射为以队列名为 group.id 的消费者组，
//! 因此每个服务独立收到 fan-out 主题上的全部消息。direct 交换器按记录键过滤：
//! 只有键等于绑定路由键的记录才会投递给该队列。
//! 确认即结算偏移量；Kafka 没有逐条否认，`nack(false)` 同样结算以丢弃消息。
//! 偏移量按分区顺序提交，未结算的记录之后的位置不会被提交。

use super::{
    Acker, BrokerChannel, BrokerConnector, Delivery, DeliveryStream, ExchangeKind,
    OutboundMessage, QueueOptions,
};
use crate::error::{BrokerError, BrokerResult};
use async_trait::async_trait;
use config::BrokerConfig;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::message::{Header, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

/// Kafka 连接器
pub struct KafkaConnector {
    config: BrokerConfig,
}

impl KafkaConnector {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn base_client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", self.config.bootstrap_servers())
            .set(
                "socket.timeout.ms",
                self.config.connection_timeout_ms.to_string(),
            );
        if !self.config.user.is_empty() && !self.config.password.is_empty() {
            client_config
                .set("security.protocol", "SASL_PLAINTEXT")
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", &self.config.user)
                .set("sasl.password", &self.config.password);
        }
        client_config
    }
}

#[async_trait]
impl BrokerConnector for KafkaConnector {
    async fn connect(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        let producer: FutureProducer = self
            .base_client_config()
            .set("message.timeout.ms", self.config.write_timeout_ms.to_string())
            .set("acks", "all") // 持久化语义
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| BrokerError::connection(format!("创建 Kafka 生产者失败: {}", e)))?;

        let admin: AdminClient<DefaultClientContext> = self
            .base_client_config()
            .create()
            .map_err(|e| BrokerError::connection(format!("创建 Kafka 管理客户端失败: {}", e)))?;

        // 客户端创建是惰性的，拉取元数据以确认代理可达
        let metadata_client = producer.clone();
        let timeout = self.config.connection_timeout();
        let metadata = tokio::task::spawn_blocking(move || {
            metadata_client.client().fetch_metadata(None, timeout).map(|_| ())
        });
        metadata
            .await
            .map_err(|e| BrokerError::connection(format!("元数据任务失败: {}", e)))?
            .map_err(|e| BrokerError::connection(format!("连接 Kafka 失败: {}", e)))?;

        info!("Kafka 连接成功: {}", self.config.bootstrap_servers());

        Ok(Arc::new(KafkaChannel {
            connector_config: self.base_client_config(),
            config: self.config.clone(),
            producer,
            admin,
            exchanges: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            bindings: Mutex::new(HashMap::new()),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

/// Kafka 通道
pub struct KafkaChannel {
    connector_config: ClientConfig,
    config: BrokerConfig,
    producer: FutureProducer,
    admin: AdminClient<DefaultClientContext>,
    exchanges: Mutex<HashMap<String, ExchangeKind>>,
    queues: Mutex<HashMap<String, QueueOptions>>,
    /// queue -> [(exchange, routing_key)]
    bindings: Mutex<HashMap<String, Vec<(String, String)>>>,
    closed: Arc<AtomicBool>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl KafkaChannel {
    fn ensure_open(&self) -> BrokerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::connection("Kafka 通道已关闭"))
        } else {
            Ok(())
        }
    }

    /// 代理全部不可达时标记通道关闭，交给健康检查任务重连
    fn observe(&self, err: &rdkafka::error::KafkaError) {
        if matches!(
            err.rdkafka_error_code(),
            Some(RDKafkaErrorCode::AllBrokersDown) | Some(RDKafkaErrorCode::Fatal)
        ) {
            warn!("Kafka 代理不可达，标记通道关闭: {}", err);
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn build_headers(message: &OutboundMessage) -> OwnedHeaders {
        let priority = message.priority.to_string();
        let timestamp = message.timestamp.to_rfc3339();
        let delivery_mode = if message.persistent { "2" } else { "1" };

        let mut headers = OwnedHeaders::new_with_capacity(message.headers.len() + 5)
            .insert(Header {
                key: "content-type",
                value: Some(message.content_type),
            })
            .insert(Header {
                key: "message-id",
                value: Some(message.message_id.as_str()),
            })
            .insert(Header {
                key: "timestamp",
                value: Some(timestamp.as_str()),
            })
            .insert(Header {
                key: "priority",
                value: Some(priority.as_str()),
            })
            .insert(Header {
                key: "delivery-mode",
                value: Some(delivery_mode),
            });
        for (key, value) in &message.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            });
        }
        headers
    }
}

#[async_trait]
impl BrokerChannel for KafkaChannel {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        _durable: bool,
    ) -> BrokerResult<()> {
        self.ensure_open()?;
        let topic = NewTopic::new(
            name,
            self.config.partitions,
            TopicReplication::Fixed(self.config.replication_factor),
        );
        let options = AdminOptions::new().operation_timeout(Some(self.config.connection_timeout()));

        let results = self
            .admin
            .create_topics(&[topic], &options)
            .await
            .map_err(|e| {
                self.observe(&e);
                BrokerError::connection(format!("声明主题 {} 失败: {}", name, e))
            })?;

        for result in results {
            match result {
                Ok(topic) => info!("已创建主题: {}", topic),
                Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!("主题 {} 已存在", topic)
                }
                Err((topic, code)) => {
                    return Err(BrokerError::connection(format!(
                        "声明主题 {} 失败: {:?}",
                        topic, code
                    )));
                }
            }
        }

        lock(&self.exchanges).insert(name.to_string(), kind);
        Ok(())
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> BrokerResult<()> {
        self.ensure_open()?;
        // 消费者组在首次加入时由代理创建
        lock(&self.queues).insert(name.to_string(), options);
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()> {
        self.ensure_open()?;
        if !lock(&self.queues).contains_key(queue) {
            return Err(BrokerError::consume_setup(format!("队列 {} 未声明", queue)));
        }
        if !lock(&self.exchanges).contains_key(exchange) {
            return Err(BrokerError::consume_setup(format!("主题 {} 未声明", exchange)));
        }

        let mut bindings = lock(&self.bindings);
        let entry = bindings.entry(queue.to_string()).or_default();
        let binding = (exchange.to_string(), routing_key.to_string());
        if !entry.contains(&binding) {
            entry.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> BrokerResult<()> {
        self.ensure_open()?;
        let headers = Self::build_headers(&message);

        let mut record: FutureRecord<'_, str, [u8]> = FutureRecord::to(exchange)
            .payload(message.body.as_slice())
            .timestamp(message.timestamp.timestamp_millis())
            .headers(headers);
        if !routing_key.is_empty() {
            record = record.key(routing_key);
        }

        match self
            .producer
            .send(record, Timeout::After(self.config.write_timeout()))
            .await
        {
            Ok(_) => Ok(()),
            Err((kafka_err, _)) => {
                self.observe(&kafka_err);
                Err(BrokerError::publish(format!(
                    "发送消息 {} 失败: {}",
                    message.message_id, kafka_err
                )))
            }
        }
    }

    async fn consume(&self, queue: &str) -> BrokerResult<DeliveryStream> {
        self.ensure_open()?;
        let options = lock(&self.queues)
            .get(queue)
            .copied()
            .ok_or_else(|| BrokerError::consume_setup(format!("队列 {} 未声明", queue)))?;
        let bindings = lock(&self.bindings).get(queue).cloned().unwrap_or_default();
        if bindings.is_empty() {
            return Err(BrokerError::consume_setup(format!(
                "队列 {} 没有任何绑定",
                queue
            )));
        }
        let exchanges = lock(&self.exchanges).clone();

        // 持久队列从未提交的最早位置开始，非持久队列只看新消息
        let offset_reset = if options.durable { "earliest" } else { "latest" };
        let consumer: StreamConsumer = self
            .connector_config
            .clone()
            .set("group.id", queue)
            .set("enable.partition.eof", "false")
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", offset_reset)
            .set("session.timeout.ms", "10000")
            .set("heartbeat.interval.ms", "3000")
            .create()
            .map_err(|e| BrokerError::consume_setup(format!("创建 Kafka 消费者失败: {}", e)))?;

        let topics: Vec<&str> = bindings.iter().map(|(topic, _)| topic.as_str()).collect();
        consumer
            .subscribe(&topics)
            .map_err(|e| BrokerError::consume_setup(format!("订阅主题失败: {}", e)))?;
        info!("队列 {} 已订阅主题: {:?}", queue, topics);

        let routes: Vec<Route> = bindings
            .into_iter()
            .map(|(topic, routing_key)| Route {
                kind: exchanges
                    .get(&topic)
                    .copied()
                    .unwrap_or(ExchangeKind::Fanout),
                topic,
                routing_key,
            })
            .collect();

        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(consume_loop(
            Arc::new(consumer),
            routes,
            Arc::clone(&self.closed),
            self.config.read_timeout(),
            self.config.prefetch_count,
            sender,
        ));
        Ok(receiver)
    }

    async fn close(&self) -> BrokerResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let producer = self.producer.clone();
        let timeout = self.config.write_timeout();
        let flushed = tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| BrokerError::connection(format!("刷新任务失败: {}", e)))?;
        if let Err(e) = flushed {
            warn!("关闭前刷新生产者缓冲区失败: {}", e);
        }
        info!("Kafka 通道已关闭");
        Ok(())
    }
}

struct Route {
    topic: String,
    kind: ExchangeKind,
    routing_key: String,
}

impl Route {
    fn accepts(&self, topic: &str, key: Option<&[u8]>) -> bool {
        if self.topic != topic {
            return false;
        }
        match self.kind {
            ExchangeKind::Fanout => true,
            ExchangeKind::Direct => key == Some(self.routing_key.as_bytes()),
        }
    }
}

/// 按分区记录已取出但未结算的偏移量
///
/// Kafka 提交的是分区水位，只能提交连续结算的前缀：
/// 提交位置为最小的未结算偏移量，没有未结算记录时为最大已结算偏移量加一。
#[derive(Debug, Default)]
struct OffsetTracker {
    partitions: HashMap<(String, i32), PartitionOffsets>,
}

#[derive(Debug, Default)]
struct PartitionOffsets {
    in_flight: BTreeSet<i64>,
    settled_until: Option<i64>,
    committed: Option<i64>,
}

impl OffsetTracker {
    fn track(&mut self, topic: &str, partition: i32, offset: i64) {
        let state = self
            .partitions
            .entry((topic.to_string(), partition))
            .or_default();
        // 第一条记录之前的位置已由消费者组确定
        if state.committed.is_none() {
            state.committed = Some(offset);
        }
        state.in_flight.insert(offset);
    }

    /// 结算一条记录，返回新的可提交位置
    fn settle(&mut self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let state = self.partitions.get_mut(&(topic.to_string(), partition))?;
        if !state.in_flight.remove(&offset) {
            return None;
        }
        state.settled_until = state.settled_until.max(Some(offset + 1));

        let position = match state.in_flight.first() {
            Some(&lowest) => lowest,
            None => state.settled_until?,
        };
        if Some(position) > state.committed {
            state.committed = Some(position);
            Some(position)
        } else {
            None
        }
    }
}

/// 后台消费循环，通道关闭或接收端离开时结束
///
/// 未结算的投递最多 `prefetch` 条，超出时暂停拉取。
async fn consume_loop(
    consumer: Arc<StreamConsumer>,
    routes: Vec<Route>,
    closed: Arc<AtomicBool>,
    poll_timeout: Duration,
    prefetch: usize,
    sender: mpsc::UnboundedSender<Delivery>,
) {
    let offsets = Arc::new(Mutex::new(OffsetTracker::default()));
    let permits = Arc::new(Semaphore::new(prefetch));

    while !closed.load(Ordering::SeqCst) && !sender.is_closed() {
        let permit = tokio::select! {
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = sender.closed() => break,
        };

        let message = match tokio::time::timeout(poll_timeout, consumer.recv()).await {
            Ok(Ok(message)) => message,
            Ok(Err(e)) => {
                error!("接收 Kafka 消息失败: {}", e);
                if matches!(
                    e.rdkafka_error_code(),
                    Some(RDKafkaErrorCode::AllBrokersDown) | Some(RDKafkaErrorCode::Fatal)
                ) {
                    closed.store(true, Ordering::SeqCst);
                    break;
                }
                continue;
            }
            // 超时，继续循环检查信号
            Err(_) => continue,
        };

        lock(&offsets).track(message.topic(), message.partition(), message.offset());
        let acker = KafkaAcker {
            consumer: Arc::clone(&consumer),
            offsets: Arc::clone(&offsets),
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            _permit: permit,
        };

        let accepted = routes
            .iter()
            .any(|route| route.accepts(message.topic(), message.key()));
        if !accepted {
            // direct 主题上发给其他队列的记录，与其他投递一样按顺序结算
            if let Err(e) = acker.settle() {
                warn!("跳过记录时提交偏移量失败: {}", e);
            }
            continue;
        }

        let body = message.payload().map(<[u8]>::to_vec).unwrap_or_default();
        let delivery = Delivery::new(body, message.topic(), Box::new(acker));
        if sender.send(delivery).is_err() {
            warn!("投递流接收端已关闭");
            break;
        }
    }
    debug!("Kafka 消费循环已停止");
}

struct KafkaAcker {
    consumer: Arc<StreamConsumer>,
    offsets: Arc<Mutex<OffsetTracker>>,
    topic: String,
    partition: i32,
    offset: i64,
    /// 结算或丢弃投递时释放预取额度
    _permit: OwnedSemaphorePermit,
}

impl KafkaAcker {
    fn settle(&self) -> BrokerResult<()> {
        let position = lock(&self.offsets).settle(&self.topic, self.partition, self.offset);
        let Some(position) = position else {
            return Ok(());
        };

        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(&self.topic, self.partition, Offset::Offset(position))?;
        self.consumer.commit(&offsets, CommitMode::Async)?;
        Ok(())
    }
}

#[async_trait]
impl Acker for KafkaAcker {
    async fn ack(&self) -> BrokerResult<()> {
        self.settle()
    }

    async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        if requeue {
            // 保持未结算，之后的提交停在此偏移量，重启或重平衡后从这里重投
            warn!(
                "Kafka 不支持逐条重新入队，{}[{}]@{} 将在重启后重投",
                self.topic, self.partition, self.offset
            );
            return Ok(());
        }
        self.settle()
    }
}
