//! 统一配置中心
//!
//! 提供服务的全局配置管理，包括：
//! - 服务身份
//! - 消息代理（交换器、队列、重试）
//! - Redis 控制平面频道
//! - HTTP/WebSocket 监听地址
//!
//! 加载顺序：默认值 -> 可选配置文件（`APP_CONFIG_FILE`）-> 环境变量（`APP_*`，`__` 分隔层级）。

use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 全局应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// 服务身份配置
    pub service: ServiceConfig,
    /// 消息代理配置
    pub broker: BrokerConfig,
    /// Redis配置
    pub redis: RedisConfig,
    /// 服务器配置
    pub server: ServerConfig,
}

/// 服务身份配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// 服务名，同时决定消费队列名 `<name>.queue`
    pub name: String,
    /// 是否启动消费循环
    pub consume: bool,
    /// 本服务处理的消息类型，为空表示全部确认
    pub handled_types: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "chat".to_string(),
            consume: true,
            handled_types: Vec::new(),
        }
    }
}

/// 重试延迟策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetryBackoff {
    /// 固定间隔
    #[default]
    Fixed,
    /// 指数退避，以 `retry_delay_ms` 为基数
    Exponential,
}

/// 消息代理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,

    /// 广播交换器（fan-out）
    pub exchange_name: String,
    /// 重试交换器（direct）
    pub retry_exchange_name: String,

    pub enable_retry: bool,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_backoff: RetryBackoff,
    /// 允许重试的消息类型
    pub retry_types: Vec<String>,

    pub connection_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,

    pub queue_durable: bool,
    pub queue_auto_delete: bool,
    /// 每个消费者未结算投递的上限
    pub prefetch_count: usize,

    /// 连接健康检查间隔
    pub health_check_interval_ms: u64,
    /// 重连失败后的固定等待
    pub reconnect_delay_ms: u64,

    /// Kafka 主题分区数
    pub partitions: i32,
    /// Kafka 主题副本数
    pub replication_factor: i32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9092,
            user: "user".to_string(),
            password: "password".to_string(),
            vhost: "/".to_string(),
            exchange_name: "microservices.broadcast".to_string(),
            retry_exchange_name: "microservices.retry".to_string(),
            enable_retry: true,
            max_retries: 3,
            retry_delay_ms: 5_000,
            retry_backoff: RetryBackoff::Fixed,
            retry_types: Vec::new(),
            connection_timeout_ms: 30_000,
            read_timeout_ms: 30_000,
            write_timeout_ms: 30_000,
            queue_durable: true,
            queue_auto_delete: false,
            prefetch_count: 32,
            health_check_interval_ms: 5_000,
            reconnect_delay_ms: 5_000,
            partitions: 3,
            replication_factor: 1,
        }
    }
}

impl BrokerConfig {
    /// 带凭据的连接地址，仅用于日志以外的场景
    pub fn url(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }

    /// 隐藏密码的连接地址，用于日志
    pub fn sanitized_url(&self) -> String {
        format!(
            "amqp://{}:[REDACTED]@{}:{}{}",
            self.user, self.host, self.port, self.vhost
        )
    }

    /// Kafka bootstrap.servers
    pub fn bootstrap_servers(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Redis配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    /// 在线状态频道
    pub status_channel: String,
    /// 聊天投递频道
    pub chat_channel: String,
    /// 订阅中断后重新订阅的间隔
    pub resubscribe_interval_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            status_channel: "user_status".to_string(),
            chat_channel: "send_Message".to_string(),
            resubscribe_interval_ms: 1_000,
        }
    }
}

impl RedisConfig {
    pub fn resubscribe_interval(&self) -> Duration {
        Duration::from_millis(self.resubscribe_interval_ms)
    }
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl AppConfig {
    /// 按 默认值 -> 配置文件 -> 环境变量 的顺序加载并验证
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));
        if let Ok(path) = std::env::var("APP_CONFIG_FILE") {
            if path.ends_with(".yml") || path.ends_with(".yaml") {
                figment = figment.merge(Yaml::file(path));
            } else if path.ends_with(".json") {
                figment = figment.merge(Json::file(path));
            } else {
                figment = figment.merge(Toml::file(path));
            }
        }
        figment = figment.merge(Env::prefixed("APP_").split("__"));
        Self::from_figment(figment)
    }

    /// 从任意 figment 提取配置并验证
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: AppConfig = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service.name.trim().is_empty() {
            return Err(ConfigError::InvalidServiceConfig(
                "service name cannot be empty".to_string(),
            ));
        }

        if self.broker.exchange_name.is_empty() || self.broker.retry_exchange_name.is_empty() {
            return Err(ConfigError::InvalidBrokerConfig(
                "exchange names cannot be empty".to_string(),
            ));
        }

        if self.broker.enable_retry && self.broker.exchange_name == self.broker.retry_exchange_name
        {
            return Err(ConfigError::InvalidBrokerConfig(
                "retry exchange must differ from the broadcast exchange".to_string(),
            ));
        }

        if self.broker.port == 0 || self.server.port == 0 {
            return Err(ConfigError::InvalidServerPort(
                "port must be greater than 0".to_string(),
            ));
        }

        if self.broker.health_check_interval_ms == 0 || self.broker.reconnect_delay_ms == 0 {
            return Err(ConfigError::InvalidBrokerConfig(
                "health check interval and reconnect delay must be greater than 0".to_string(),
            ));
        }

        if self.broker.prefetch_count == 0 {
            return Err(ConfigError::InvalidBrokerConfig(
                "prefetch count must be greater than 0".to_string(),
            ));
        }

        if self.broker.partitions <= 0 || self.broker.replication_factor <= 0 {
            return Err(ConfigError::InvalidBrokerConfig(
                "partitions and replication factor must be positive".to_string(),
            ));
        }

        if self.redis.status_channel == self.redis.chat_channel {
            return Err(ConfigError::InvalidRedisConfig(
                "status and chat channels must differ".to_string(),
            ));
        }

        Ok(())
    }
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid service configuration: {0}")]
    InvalidServiceConfig(String),
    #[error("Invalid broker configuration: {0}")]
    InvalidBrokerConfig(String),
    #[error("Invalid redis configuration: {0}")]
    InvalidRedisConfig(String),
    #[error("Invalid server port: {0}")]
    InvalidServerPort(String),
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
}
