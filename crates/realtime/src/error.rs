//! 实时推送错误类型定义

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// 注册表（Hub）错误
#[derive(Error, Debug)]
pub enum HubError {
    /// 注册表任务已退出
    #[error("注册表 {hub} 已停止")]
    Stopped { hub: String },

    /// 向连接写入失败
    #[error("连接 {connection_id} 发送失败: {message}")]
    SendFailed {
        connection_id: uuid::Uuid,
        message: String,
    },

    /// 事件序列化失败
    #[error("序列化错误: {message}")]
    SerializationError { message: String },
}

/// 注册表结果类型
pub type HubResult<T> = Result<T, HubError>;

/// 跨实例发布订阅错误
#[derive(Error, Debug)]
pub enum ControlPlaneError {
    /// 连接错误
    #[error("发布订阅连接错误: {message}")]
    ConnectionError { message: String },

    /// 发布错误
    #[error("发布错误: {message}")]
    PublishError { message: String },

    /// 订阅错误
    #[error("订阅错误: {message}")]
    SubscribeError { message: String },

    /// 序列化错误
    #[error("序列化错误: {message}")]
    SerializationError { message: String },

    /// 负载格式无效
    #[error("无效的负载: {message}")]
    InvalidPayload { message: String },
}

/// 发布订阅结果类型
pub type ControlPlaneResult<T> = Result<T, ControlPlaneError>;

impl ControlPlaneError {
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        ControlPlaneError::InvalidPayload {
            message: message.into(),
        }
    }
}

impl From<redis::RedisError> for ControlPlaneError {
    fn from(err: redis::RedisError) -> Self {
        match err.kind() {
            redis::ErrorKind::TypeError => ControlPlaneError::InvalidPayload {
                message: err.to_string(),
            },
            _ => ControlPlaneError::ConnectionError {
                message: err.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for ControlPlaneError {
    fn from(err: serde_json::Error) -> Self {
        ControlPlaneError::SerializationError {
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

/// HTTP 接口错误
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<ControlPlaneError> for ApiError {
    fn from(error: ControlPlaneError) -> Self {
        match error {
            ControlPlaneError::InvalidPayload { message } => {
                ApiError::new(StatusCode::BAD_REQUEST, "INVALID_PAYLOAD", message)
            }
            other => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "PUBSUB_UNAVAILABLE",
                other.to_string(),
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
