//! The simulated lights one process runs

use prysmalight_api::broker::BrokerResult;
use prysmalight_api::{Broker, SimulatedLight, Topics};

pub struct Fleet {
    broker: Broker,
    lights: Vec<SimulatedLight>,
}

impl Fleet {
    /// Bring every light in `ids` online
    pub async fn spawn(
        broker: Broker,
        topics: &Topics,
        ids: &[String],
        effects: &[String],
    ) -> BrokerResult<Self> {
        let mut lights = Vec::with_capacity(ids.len());
        for id in ids {
            let light =
                SimulatedLight::spawn(broker.clone(), topics.clone(), id, effects.to_vec()).await?;
            lights.push(light);
        }
        Ok(Self { broker, lights })
    }

    pub fn len(&self) -> usize {
        self.lights.len()
    }

    /// Announce every light offline, then close the broker connection.
    ///
    /// Returns how many offline announcements went out.
    pub async fn shutdown(self) -> usize {
        let mut announced = 0;
        for light in self.lights {
            let id = light.id();
            match light.stop().await {
                Ok(()) => announced += 1,
                Err(e) => tracing::warn!(light = %id, error = %e, "Offline announcement not sent"),
            }
        }
        self.broker.close().await;
        announced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prysmalight_api::models::{message, ConnectionStatus, DeviceMessage};
    use prysmalight_api::ConnectionState;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_shutdown_announces_offline_before_closing() {
        let broker = Broker::in_memory();
        let topics = Topics::default();
        let ids = vec!["Light 1".to_string(), "Light 2".to_string()];
        let fleet = Fleet::spawn(broker.clone(), &topics, &ids, &["Cylon".to_string()])
            .await
            .unwrap();
        assert_eq!(fleet.len(), 2);

        let (sink, mut announcements) = mpsc::unbounded_channel();
        broker
            .subscribe(&format!("{}/+/connected", topics.base()), sink)
            .await
            .unwrap();

        assert_eq!(fleet.shutdown().await, 2);
        assert_eq!(broker.state(), ConnectionState::Closed);

        // Closing the broker ends the subscription once the backlog is read
        let mut offline = Vec::new();
        while let Some(announcement) = announcements.recv().await {
            let parsed = message::parse(&topics, &announcement.topic, &announcement.payload);
            if let Ok(Some(DeviceMessage::Connection { id, status })) = parsed {
                assert_eq!(status, ConnectionStatus::Offline);
                offline.push(id);
            }
        }
        assert_eq!(offline, ids);
    }
}
