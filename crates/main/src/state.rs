use messaging::BrokerClient;
use realtime::RealtimeState;

#[derive(Clone)]
pub struct AppState {
    pub broker: BrokerClient,
    pub realtime: RealtimeState,
}

impl AppState {
    pub fn new(broker: BrokerClient, realtime: RealtimeState) -> Self {
        Self { broker, realtime }
    }
}
