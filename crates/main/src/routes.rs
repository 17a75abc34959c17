use crate::state::AppState;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub service: String,
    pub broker: BrokerHealth,
    pub hubs: HubHealth,
}

#[derive(Debug, Serialize)]
pub struct BrokerHealth {
    pub connected: bool,
    pub reconnects: u64,
}

#[derive(Debug, Serialize)]
pub struct HubHealth {
    pub user_keys: usize,
    pub chat_keys: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(state.clone())
        .merge(realtime::router(state.realtime))
        .layer(TraceLayer::new_for_http())
}

/// 消息代理断开时返回 503
async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let connected = state.broker.is_connected();
    let report = HealthReport {
        status: if connected { "ok" } else { "degraded" },
        service: state.broker.service().to_string(),
        broker: BrokerHealth {
            connected,
            reconnects: state.broker.reconnect_count(),
        },
        hubs: HubHealth {
            user_keys: state.realtime.user_hub.key_count().await,
            chat_keys: state.realtime.chat_hub.key_count().await,
        },
    };

    let status = if connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}
