//! 服务节点
//!
//! 组装消息代理客户端、实时推送注册表和 HTTP 路由。

pub mod handler;
pub mod routes;
pub mod state;

pub use handler::LoggingHandler;
pub use routes::router;
pub use state::AppState;
