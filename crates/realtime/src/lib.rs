//! 实时推送
//!
//! 按路由键（用户ID、聊天室ID）管理 WebSocket 连接，并通过发布订阅频道
//! 在多个服务实例之间转发在线状态和聊天消息。

pub mod bridge;
pub mod control_plane;
pub mod error;
pub mod event;
pub mod handle;
pub mod hub;
pub mod publisher;
pub mod routes;

pub use bridge::Bridge;
pub use control_plane::{
    ControlMessage, ControlPlane, EventFamily, LocalControlPlane, RedisControlPlane,
};
pub use error::{ApiError, ControlPlaneError, ControlPlaneResult, HubError, HubResult};
pub use event::{HubEvent, PresenceStatus};
pub use handle::{ChannelHandle, ConnectionHandle, OutboundFrame};
pub use hub::{BroadcastReport, Hub};
pub use publisher::StatusPublisher;
pub use routes::{router, RealtimeState};
