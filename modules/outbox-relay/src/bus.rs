use event_bus::{BusError, EventBus, InMemoryBus, NatsBus};
use std::sync::Arc;

use crate::config::{BusType, Config};

/// Build the event bus selected by `BUS_TYPE`
pub async fn connect_bus(config: &Config) -> Result<Arc<dyn EventBus>, BusError> {
    match config.bus_type {
        BusType::InMemory => {
            tracing::info!("Using in-memory event bus");
            // Nothing reads the publish log in a running relay
            Ok(Arc::new(InMemoryBus::new().with_log_limit(0)))
        }
        BusType::Nats => {
            let nats_url = config
                .nats_url
                .as_deref()
                .ok_or_else(|| BusError::ConnectionError("NATS_URL required for NATS bus".to_string()))?;

            tracing::info!(nats_url = %nats_url, jetstream = config.nats_jetstream, "Connecting to NATS");
            let client = async_nats::connect(nats_url)
                .await
                .map_err(|e| BusError::ConnectionError(e.to_string()))?;

            if config.nats_jetstream {
                Ok(Arc::new(NatsBus::jetstream(client)))
            } else {
                Ok(Arc::new(NatsBus::new(client)))
            }
        }
    }
}
