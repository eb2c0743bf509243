use futures_util::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use prysmalight_api::config::{BrokerBackend, Config, StoreBackend};
use prysmalight_api::{Broker, LightEvent, LightRepository, LightService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "prysmalight_api=debug,rumqttc=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::from_env()?;

    tracing::info!(
        environment = %config.common.environment,
        base_topic = %config.mqtt().base_topic,
        "Starting Prysmalight API"
    );

    let broker = match config.broker_backend {
        BrokerBackend::Mqtt => {
            tracing::info!("Connecting to MQTT broker at {}", config.mqtt().address());
            Broker::connect(config.mqtt()).await
        }
        BrokerBackend::Memory => {
            tracing::warn!("Using in-memory broker, no lights outside this process are reachable");
            Broker::in_memory()
        }
    };

    let store = match config.store_backend {
        StoreBackend::Redis => LightRepository::try_with_redis(config.redis()).await,
        StoreBackend::Memory => LightRepository::new_in_memory(),
    };
    tracing::info!(redis = store.is_redis_backed(), "Light store initialized");

    let service = LightService::new(broker, store, config.service_settings());
    let tracked = service.start().await?;
    tracing::info!(tracked, status = %service.broker_status(), "Light service ready");

    // Log every change the bridge fans out
    let mut changes = service.subscribe_to_all_lights().await?;
    tokio::spawn(async move {
        while let Some(event) = changes.next().await {
            if let LightEvent::Changed { light, changes } = event {
                tracing::debug!(
                    light = %light.id,
                    changes = %serde_json::to_string(&changes).unwrap_or_default(),
                    "Light changed"
                );
            }
        }
    });

    let mut status = service.watch_broker_status();
    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *status.borrow_and_update();
                tracing::info!(%state, "Broker connection state changed");
                if state.is_shut_down() {
                    break;
                }
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "Unable to listen for interrupt signal");
                }
                break;
            }
        }
    }

    service.shutdown().await;
    tracing::info!("Prysmalight API stopped");
    Ok(())
}
