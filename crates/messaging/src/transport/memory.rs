//! 进程内消息代理
//!
//! 实现 fan-out/direct 交换器、持久队列、手动确认和未确认消息的重新入队，
//! 语义与真实代理一致，可在测试中模拟连接断开和连接被拒绝。

use super::{
    Acker, BrokerChannel, BrokerConnector, Delivery, DeliveryStream, ExchangeKind,
    OutboundMessage, QueueOptions,
};
use crate::error::{BrokerError, BrokerResult};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    exchange: String,
    redelivered: bool,
}

struct Consumer {
    channel_id: u64,
    sender: mpsc::UnboundedSender<Delivery>,
}

struct QueueState {
    options: QueueOptions,
    ready: VecDeque<StoredMessage>,
    /// tag -> (channel_id, message)
    unacked: HashMap<u64, (u64, StoredMessage)>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
    dropped: Vec<Vec<u8>>,
}

impl QueueState {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            consumers: Vec::new(),
            next_consumer: 0,
            dropped: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    channels: HashMap<u64, Arc<AtomicBool>>,
    next_channel_id: u64,
    next_tag: u64,
    unroutable: u64,
}

#[derive(Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    refused_connects: AtomicU32,
}

/// 进程内代理，克隆共享同一份状态
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 用于 [`crate::BrokerClient::connect`] 的连接器
    pub fn connector(&self) -> Arc<MemoryConnector> {
        Arc::new(MemoryConnector {
            broker: self.clone(),
        })
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        lock_state(&self.inner)
    }

    fn downgrade(&self) -> Weak<BrokerInner> {
        Arc::downgrade(&self.inner)
    }

    /// 模拟网络中断：所有通道被标记为关闭，消费流结束，未确认消息重新入队
    pub fn sever_connections(&self) {
        let mut state = self.state();
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in ids {
            close_channel(&mut state, &self.downgrade(), id);
        }
        warn!("内存代理：所有连接已断开");
    }

    /// 拒绝接下来的 `count` 次连接
    pub fn refuse_connections(&self, count: u32) {
        self.inner.refused_connects.store(count, Ordering::SeqCst);
    }

    pub fn open_channel_count(&self) -> usize {
        self.state().channels.len()
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.state().exchanges.get(name).copied()
    }

    pub fn queue_options(&self, name: &str) -> Option<QueueOptions> {
        self.state().queues.get(name).map(|queue| queue.options)
    }

    pub fn has_binding(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.state().bindings.iter().any(|binding| {
            binding.queue == queue
                && binding.exchange == exchange
                && binding.routing_key == routing_key
        })
    }

    /// 待投递加未确认的消息数
    pub fn queue_depth(&self, name: &str) -> usize {
        self.state()
            .queues
            .get(name)
            .map(|queue| queue.ready.len() + queue.unacked.len())
            .unwrap_or(0)
    }

    /// 被否认且未重新入队的消息
    pub fn dropped(&self, name: &str) -> Vec<Vec<u8>> {
        self.state()
            .queues
            .get(name)
            .map(|queue| queue.dropped.clone())
            .unwrap_or_default()
    }

    /// mandatory 消息无法路由的次数
    pub fn unroutable_count(&self) -> u64 {
        self.state().unroutable
    }
}

fn lock_state(inner: &BrokerInner) -> MutexGuard<'_, BrokerState> {
    // 持锁期间不会 panic，中毒时沿用内部状态
    inner
        .state
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn close_channel(state: &mut BrokerState, broker: &Weak<BrokerInner>, channel_id: u64) {
    if let Some(flag) = state.channels.remove(&channel_id) {
        flag.store(true, Ordering::SeqCst);
    }

    let queue_names: Vec<String> = state.queues.keys().cloned().collect();
    for name in queue_names {
        let Some(queue) = state.queues.get_mut(&name) else {
            continue;
        };
        queue
            .consumers
            .retain(|consumer| consumer.channel_id != channel_id);

        let orphaned: Vec<u64> = queue
            .unacked
            .iter()
            .filter(|(_, (owner, _))| *owner == channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in orphaned {
            if let Some((_, mut message)) = queue.unacked.remove(&tag) {
                message.redelivered = true;
                queue.ready.push_back(message);
            }
        }
        dispatch(state, broker, &name);
    }
}

/// 把待投递消息推送给队列的消费者（轮询）
fn dispatch(state: &mut BrokerState, broker: &Weak<BrokerInner>, queue_name: &str) {
    let BrokerState {
        queues, next_tag, ..
    } = state;
    let Some(queue) = queues.get_mut(queue_name) else {
        return;
    };

    while !queue.consumers.is_empty() {
        let Some(message) = queue.ready.pop_front() else {
            break;
        };

        let index = queue.next_consumer % queue.consumers.len();
        *next_tag += 1;
        let tag = *next_tag;
        let consumer = &queue.consumers[index];
        let channel_id = consumer.channel_id;

        let delivery = Delivery::new(
            message.body.clone(),
            message.exchange.clone(),
            Box::new(MemoryAcker {
                broker: broker.clone(),
                queue: queue_name.to_string(),
                tag,
            }),
        )
        .redelivered(message.redelivered);

        match consumer.sender.send(delivery) {
            Ok(()) => {
                queue.unacked.insert(tag, (channel_id, message));
                queue.next_consumer = index + 1;
            }
            Err(_) => {
                debug!("队列 {} 的消费者已离开", queue_name);
                queue.consumers.remove(index);
                queue.ready.push_front(message);
            }
        }
    }
}

struct MemoryAcker {
    broker: Weak<BrokerInner>,
    queue: String,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, requeue: Option<bool>) -> BrokerResult<()> {
        let inner = self.broker.upgrade().ok_or(BrokerError::Closed)?;
        let mut state = lock_state(&inner);
        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| BrokerError::AckError {
                message: format!("队列 {} 不存在", self.queue),
            })?;
        let (_, mut message) =
            queue
                .unacked
                .remove(&self.tag)
                .ok_or_else(|| BrokerError::AckError {
                    message: format!("未知的投递标签 {}", self.tag),
                })?;

        match requeue {
            None => {}
            Some(true) => {
                message.redelivered = true;
                queue.ready.push_back(message);
                let queue_name = self.queue.clone();
                dispatch(&mut state, &self.broker, &queue_name);
            }
            Some(false) => queue.dropped.push(message.body),
        }
        Ok(())
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> BrokerResult<()> {
        self.settle(None)
    }

    async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        self.settle(Some(requeue))
    }
}

/// 内存代理上的通道
pub struct MemoryChannel {
    id: u64,
    broker: MemoryBroker,
    closed: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> BrokerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::connection("通道已关闭"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
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
        let mut state = self.broker.state();
        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(BrokerError::ConfigError {
                message: format!("交换器 {} 已以 {:?} 类型声明", name, existing),
            }),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> BrokerResult<()> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        match state.queues.get(name) {
            Some(existing) if existing.options != options => Err(BrokerError::ConfigError {
                message: format!("队列 {} 已以不同参数声明", name),
            }),
            Some(_) => Ok(()),
            None => {
                state
                    .queues
                    .insert(name.to_string(), QueueState::new(options));
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::consume_setup(format!("队列 {} 不存在", queue)));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::consume_setup(format!(
                "交换器 {} 不存在",
                exchange
            )));
        }

        let binding = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
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
        let mut state = self.broker.state();
        let kind = *state
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::publish(format!("交换器 {} 不存在", exchange)))?;

        let targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|binding| binding.exchange == exchange)
            .filter(|binding| kind == ExchangeKind::Fanout || binding.routing_key == routing_key)
            .map(|binding| binding.queue.clone())
            .collect();

        if targets.is_empty() {
            if message.mandatory {
                state.unroutable += 1;
                warn!(
                    exchange = %exchange,
                    message_id = %message.message_id,
                    "mandatory 消息无法路由到任何队列"
                );
            }
            return Ok(());
        }

        for queue_name in targets {
            if let Some(queue) = state.queues.get_mut(&queue_name) {
                queue.ready.push_back(StoredMessage {
                    body: message.body.clone(),
                    exchange: exchange.to_string(),
                    redelivered: false,
                });
            }
            dispatch(&mut state, &self.broker.downgrade(), &queue_name);
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> BrokerResult<DeliveryStream> {
        self.ensure_open()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.broker.state();
        let entry = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::consume_setup(format!("队列 {} 不存在", queue)))?;
        entry.consumers.push(Consumer {
            channel_id: self.id,
            sender,
        });
        dispatch(&mut state, &self.broker.downgrade(), queue);
        Ok(receiver)
    }

    async fn close(&self) -> BrokerResult<()> {
        let mut state = self.broker.state();
        close_channel(&mut state, &self.broker.downgrade(), self.id);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// 内存代理连接器
pub struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl BrokerConnector for MemoryConnector {
    async fn connect(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        let refused = self.broker.inner.refused_connects.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |remaining| remaining.checked_sub(1),
        );
        if refused.is_ok() {
            return Err(BrokerError::connection("connection refused"));
        }

        let mut state = self.broker.state();
        state.next_channel_id += 1;
        let id = state.next_channel_id;
        let closed = Arc::new(AtomicBool::new(false));
        state.channels.insert(id, Arc::clone(&closed));

        Ok(Arc::new(MemoryChannel {
            id,
            broker: self.broker.clone(),
            closed,
        }))
    }
}
