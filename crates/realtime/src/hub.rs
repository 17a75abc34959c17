//! 连接注册表
//!
//! 路由键（用户ID或聊天室ID）到连接集合的映射。所有写操作由单个注册任务串行执行，
//! 广播在读锁下遍历连接；发送失败的连接在释放读锁后交给注册任务移除并关闭。

use crate::error::{HubError, HubResult};
use crate::event::HubEvent;
use crate::handle::ConnectionHandle;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

type Registry = HashMap<String, HashMap<Uuid, Arc<dyn ConnectionHandle>>>;

enum Command {
    Register {
        routing_key: String,
        handle: Arc<dyn ConnectionHandle>,
        ack: oneshot::Sender<()>,
    },
    Unregister {
        routing_key: String,
        handle: Arc<dyn ConnectionHandle>,
        ack: oneshot::Sender<()>,
    },
}

/// 一次广播的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// 连接注册表，克隆共享同一份状态
#[derive(Clone)]
pub struct Hub {
    name: Arc<str>,
    registry: Arc<RwLock<Registry>>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Hub {
    /// 创建注册表并启动注册任务
    pub fn spawn(name: impl Into<String>) -> Self {
        let name: Arc<str> = Arc::from(name.into());
        let registry = Arc::new(RwLock::new(Registry::new()));
        let (commands, receiver) = mpsc::unbounded_channel();

        tokio::spawn(run_registry(
            Arc::clone(&name),
            Arc::clone(&registry),
            receiver,
        ));

        Self {
            name,
            registry,
            commands,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 注册连接；同一连接重复注册不会重复投递
    pub async fn register(
        &self,
        routing_key: impl Into<String>,
        handle: Arc<dyn ConnectionHandle>,
    ) -> HubResult<()> {
        let (ack, done) = oneshot::channel();
        self.submit(Command::Register {
            routing_key: routing_key.into(),
            handle,
            ack,
        })?;
        done.await.map_err(|_| self.stopped())
    }

    /// 注销连接并关闭它；集合为空时路由键被移除
    pub async fn unregister(
        &self,
        routing_key: impl Into<String>,
        handle: Arc<dyn ConnectionHandle>,
    ) -> HubResult<()> {
        let (ack, done) = oneshot::channel();
        self.submit(Command::Unregister {
            routing_key: routing_key.into(),
            handle,
            ack,
        })?;
        done.await.map_err(|_| self.stopped())
    }

    /// 向路由键下的所有连接发送事件
    ///
    /// 单个连接失败不影响其他连接，失败的连接被移除并关闭。
    pub async fn broadcast_to_key(&self, routing_key: &str, event: &HubEvent) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();

        {
            let registry = self.registry.read().await;
            let Some(connections) = registry.get(routing_key) else {
                debug!(hub = %self.name, routing_key = %routing_key, "路由键下没有连接");
                return report;
            };

            for handle in connections.values() {
                match handle.send(event) {
                    Ok(()) => report.delivered += 1,
                    Err(e) => {
                        warn!(
                            hub = %self.name,
                            routing_key = %routing_key,
                            connection_id = %handle.id(),
                            "推送事件失败: {}",
                            e
                        );
                        failed.push(Arc::clone(handle));
                    }
                }
            }
        }

        report.failed = failed.len();
        for handle in failed {
            if let Err(e) = self.unregister(routing_key, handle).await {
                warn!(hub = %self.name, "移除失败连接时出错: {}", e);
            }
        }
        report
    }

    /// 当前路由键数量
    pub async fn key_count(&self) -> usize {
        self.registry.read().await.len()
    }

    /// 路由键下的连接数量
    pub async fn connection_count(&self, routing_key: &str) -> usize {
        self.registry
            .read()
            .await
            .get(routing_key)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    pub async fn contains_key(&self, routing_key: &str) -> bool {
        self.registry.read().await.contains_key(routing_key)
    }

    fn submit(&self, command: Command) -> HubResult<()> {
        self.commands.send(command).map_err(|_| self.stopped())
    }

    fn stopped(&self) -> HubError {
        HubError::Stopped {
            hub: self.name.to_string(),
        }
    }
}

/// 注册任务，所有句柄释放后退出
async fn run_registry(
    name: Arc<str>,
    registry: Arc<RwLock<Registry>>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    info!(hub = %name, "注册表任务启动");

    while let Some(command) = commands.recv().await {
        match command {
            Command::Register {
                routing_key,
                handle,
                ack,
            } => {
                let connection_id = handle.id();
                registry
                    .write()
                    .await
                    .entry(routing_key.clone())
                    .or_default()
                    .insert(connection_id, handle);
                debug!(hub = %name, routing_key = %routing_key, connection_id = %connection_id, "连接已注册");
                let _ = ack.send(());
            }
            Command::Unregister {
                routing_key,
                handle,
                ack,
            } => {
                let connection_id = handle.id();
                {
                    let mut registry = registry.write().await;
                    if let Some(connections) = registry.get_mut(&routing_key) {
                        connections.remove(&connection_id);
                        if connections.is_empty() {
                            registry.remove(&routing_key);
                        }
                    }
                }
                handle.close();
                debug!(hub = %name, routing_key = %routing_key, connection_id = %connection_id, "连接已注销");
                let _ = ack.send(());
            }
        }
    }

    info!(hub = %name, "注册表任务退出");
}
