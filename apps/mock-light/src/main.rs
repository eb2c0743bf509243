use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use prysmalight_api::{Broker, Topics};

mod config;
mod fleet;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "prysmalight_mock_light=debug,prysmalight_api=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let config = config::Config::from_env()?;
    tracing::info!(
        lights = config.lights.len(),
        broker = %config.mqtt.address(),
        "Starting mock light fleet"
    );

    // Fleet::shutdown closes the broker once the lights are announced offline
    let broker = Broker::connect_detached(&config.mqtt).await;
    let topics = Topics::new(config.mqtt.base_topic.clone());
    let fleet = fleet::Fleet::spawn(broker, &topics, &config.lights, &config.effects).await?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Unable to listen for interrupt signal");
    }

    let total = fleet.len();
    let announced = fleet.shutdown().await;
    tracing::info!(announced, total, "Offline announcements sent");
    tracing::info!("Mock light fleet stopped");
    Ok(())
}
