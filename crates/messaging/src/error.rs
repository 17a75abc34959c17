//! 消息代理错误类型定义

use thiserror::Error;

/// 消息代理操作错误
#[derive(Error, Debug)]
pub enum BrokerError {
    /// 连接或通道建立失败
    #[error("消息代理连接错误: {message}")]
    ConnectionError { message: String },

    /// 发布失败
    #[error("消息发布错误: {message}")]
    PublishError { message: String },

    /// 服务向自身发送消息
    #[error("无效的目标服务: 服务 {service} 不能向自身发送消息")]
    InvalidTargetError { service: String },

    /// 队列声明或绑定失败
    #[error("消费者初始化错误: {message}")]
    ConsumeSetupError { message: String },

    /// 序列化错误
    #[error("序列化错误: {message}")]
    SerializationError { message: String },

    /// 反序列化错误
    #[error("反序列化错误: {message}")]
    DeserializationError { message: String },

    /// 确认/拒绝失败
    #[error("消息确认错误: {message}")]
    AckError { message: String },

    /// 超时错误
    #[error("操作超时: {operation}")]
    TimeoutError { operation: String },

    /// 客户端已关闭
    #[error("客户端已关闭")]
    Closed,

    /// 配置错误
    #[error("配置错误: {message}")]
    ConfigError { message: String },
}

/// 消息代理结果类型
pub type BrokerResult<T> = Result<T, BrokerError>;

impl BrokerError {
    pub fn connection(message: impl Into<String>) -> Self {
        BrokerError::ConnectionError {
            message: message.into(),
        }
    }

    pub fn publish(message: impl Into<String>) -> Self {
        BrokerError::PublishError {
            message: message.into(),
        }
    }

    pub fn consume_setup(message: impl Into<String>) -> Self {
        BrokerError::ConsumeSetupError {
            message: message.into(),
        }
    }

    /// 是否为传输层错误（会由健康检查任务自动恢复）
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            BrokerError::ConnectionError { .. } | BrokerError::TimeoutError { .. }
        )
    }
}

impl From<rdkafka::error::KafkaError> for BrokerError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        match err {
            rdkafka::error::KafkaError::ClientConfig(..) => BrokerError::ConfigError {
                message: err.to_string(),
            },
            rdkafka::error::KafkaError::MessageProduction(_) => BrokerError::PublishError {
                message: err.to_string(),
            },
            rdkafka::error::KafkaError::ConsumerCommit(_) => BrokerError::AckError {
                message: err.to_string(),
            },
            _ => BrokerError::ConnectionError {
                message: err.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::SerializationError {
            message: err.to_string(),
        }
    }
}
