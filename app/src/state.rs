use cadence::config::RealtimeConfig;
use cadence::{Realtime, SequenceEngine, Services};

/// Shared by every controller
#[derive(Clone)]
pub struct AppState {
    pub engine: SequenceEngine,
    pub realtime: Realtime,
    pub realtime_config: RealtimeConfig,
}

impl AppState {
    pub fn new(engine: SequenceEngine, realtime: Realtime, realtime_config: RealtimeConfig) -> Self {
        Self {
            engine,
            realtime,
            realtime_config,
        }
    }
}

impl From<&Services> for AppState {
    fn from(services: &Services) -> Self {
        Self::new(
            services.engine.clone(),
            services.realtime.clone(),
            services.realtime_config.clone(),
        )
    }
}
