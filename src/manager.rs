use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::broadcast;

use crate::config::AppConfig;
use crate::dispatch::spawn_registry;
use crate::mqtt::MqttClient;
use crate::registry::{DeviceRegistry, RegistrySettings};
use crate::store::{DiscoveryStore, Persister};

// Restored devices are announced in one burst at startup.
const ANNOUNCEMENT_CAPACITY: usize = 1024;

pub struct Manager {
    config: AppConfig,
    store: DiscoveryStore,
    mqtt_client: MqttClient,
    mqtt_event_loop: rumqttc::EventLoop,
}

impl Manager {
    pub fn new(config: AppConfig) -> Self {
        let store = DiscoveryStore::new(config.storage_path());
        let (mqtt_client, mqtt_event_loop) = MqttClient::new(&config.mqtt, &config.presence());
        Manager {
            config,
            store,
            mqtt_client,
            mqtt_event_loop,
        }
    }

    pub async fn run_loop(self) -> anyhow::Result<()> {
        let Manager {
            config,
            store,
            mqtt_client,
            mut mqtt_event_loop,
        } = self;

        let (bus, announcements) = broadcast::channel(ANNOUNCEMENT_CAPACITY);

        let snapshot = store.load().await;
        let mut registry = DeviceRegistry::new(
            RegistrySettings::from_config(&config),
            bus,
            Some(Persister::spawn(store)),
        );
        registry.restore_from(&snapshot);
        info!(
            "Tracking {} known devices, disconnect delay {:?}",
            registry.len(),
            config.disconnect_delay()
        );

        let registry = spawn_registry(registry);

        let publisher = {
            let client = mqtt_client.clone();
            let dispatcher = registry.dispatcher();
            tokio::task::spawn(async move {
                client.publish_announcements(announcements, dispatcher).await;
            })
        };

        let mqtt_handle = {
            let client = mqtt_client.clone();
            let dispatcher = registry.dispatcher();
            tokio::task::spawn(async move {
                client.event_loop(&mut mqtt_event_loop, dispatcher).await;
            })
        };

        tokio::signal::ctrl_c().await?;
        info!("Shutting down");

        registry.shutdown().await;
        publisher.abort();

        mqtt_client.disconnect().await?;
        match tokio::time::timeout(Duration::from_secs(5), mqtt_handle).await {
            Ok(Ok(())) => debug!("MQTT event loop finished"),
            Ok(Err(err)) => error!("Error in MQTT event loop: {:?}", err),
            Err(_) => warn!("Timed out waiting for MQTT disconnect"),
        }
        info!("Exiting manager event loop");

        Ok(())
    }
}
