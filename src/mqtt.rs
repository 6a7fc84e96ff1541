use std::time::Duration;

use log::{debug, error, info, warn};
use rumqttc::{MqttOptions, QoS, SubscribeFilter};
use serde_derive::Serialize;
use tokio::sync::broadcast;

use crate::config;
use crate::dispatch::Dispatcher;
use crate::messages::{DeviceAnnouncement, Presence, StateAnnouncement};

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    topic_path: String,
    discovery_prefix: String,
    webhook_topic: String,
    secret: Option<String>,
}

/// Home Assistant MQTT discovery payload for a `device_tracker` entity.
#[derive(Debug, Serialize)]
struct TrackerDiscoveryMessage<'a> {
    name: &'a str,
    unique_id: String,
    state_topic: String,
    json_attributes_topic: String,
    payload_home: &'static str,
    payload_not_home: &'static str,
    source_type: &'static str,
}

#[derive(Debug, Serialize)]
struct TrackerAttributesMessage<'a> {
    mac: &'a str,
    dev_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip: Option<&'a str>,
}

#[derive(Debug, PartialEq, Eq)]
enum Inbound {
    Webhook { token: Option<String> },
    RememberedState { mac: String },
    Other,
}

impl MqttClient {
    pub fn new(
        config: &config::MqttConfig,
        presence: &config::PresenceConfig,
    ) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .clone()
            .unwrap_or_else(|| "unifi-presence".to_string());

        let mut mqttoptions =
            MqttOptions::new(publisher_id, config.host.clone(), config.port.unwrap_or(1883));

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        let topic_path = config
            .topic_path
            .clone()
            .unwrap_or_else(|| "unifi_presence".to_string());

        (
            MqttClient {
                client,
                webhook_topic: format!("{}/webhook/{}", topic_path, presence.webhook_id()),
                topic_path,
                discovery_prefix: config
                    .discovery_prefix
                    .clone()
                    .unwrap_or_else(|| "homeassistant".to_string()),
                secret: presence.secret().map(str::to_string),
            },
            eventloop,
        )
    }

    pub async fn subscribe(&self) -> Result<(), rumqttc::ClientError> {
        self.client
            .subscribe_many(vec![
                SubscribeFilter::new(self.webhook_topic.clone(), QoS::AtLeastOnce),
                SubscribeFilter::new(format!("{}/+", self.webhook_topic), QoS::AtLeastOnce),
                SubscribeFilter::new(format!("{}/+/state", self.topic_path), QoS::AtMostOnce),
            ])
            .await?;

        Ok(())
    }

    /// Polls the connection and feeds inbound payloads to the registry.
    /// Returns once our own disconnect request has gone out.
    pub async fn event_loop(&self, eventloop: &mut rumqttc::EventLoop, dispatcher: Dispatcher) {
        loop {
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                        debug!("Received MQTT message on topic {}", p.topic);
                        match self.classify(&p.topic) {
                            Inbound::Webhook { token } => {
                                if !self.authorized(token.as_deref()) {
                                    warn!("Dropping webhook relay message with invalid or missing token");
                                    continue;
                                }
                                let processed = dispatcher.ingest(&p.payload).await;
                                debug!("Processed {} webhook events", processed);
                            }
                            // Only retained values are memories of a previous run.
                            Inbound::RememberedState { mac } if p.retain => {
                                match std::str::from_utf8(&p.payload).ok().and_then(Presence::parse) {
                                    Some(presence) => dispatcher.restore(&mac, presence).await,
                                    None => debug!("Ignoring unknown remembered state for {}", mac),
                                }
                            }
                            _ => {}
                        }
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_)) => {
                        debug!("Subscription acknowledged");
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                        debug!("Connection acknowledged");
                        // Requests only drain while this loop polls, so the
                        // subscribe must not be awaited here.
                        let client = self.clone();
                        tokio::spawn(async move {
                            if let Err(err) = client.subscribe().await {
                                error!("Error subscribing to MQTT topics: {:?}", err);
                            }
                        });
                    }
                    rumqttc::Event::Outgoing(rumqttc::Outgoing::Disconnect) => {
                        debug!("MQTT disconnect sent");
                        break;
                    }
                    _ => {}
                },
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Mirrors registry announcements onto Home Assistant topics.
    pub async fn publish_announcements(
        &self,
        mut rx: broadcast::Receiver<StateAnnouncement>,
        dispatcher: Dispatcher,
    ) {
        loop {
            let result = match rx.recv().await {
                Ok(StateAnnouncement::DeviceDiscovered(device)) => {
                    self.announce_device(&device).await
                }
                Ok(StateAnnouncement::PresenceChanged(device)) => {
                    self.publish_state(&device).await
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Missed {} announcements, republishing every device", missed);
                    self.announce_all(&dispatcher.devices().await).await
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Announcement bus closed");
                    break;
                }
            };
            if let Err(err) = result {
                error!("Error publishing to MQTT: {:?}", err);
            }
        }
    }

    async fn announce_all(&self, devices: &[DeviceAnnouncement]) -> Result<(), rumqttc::ClientError> {
        for device in devices {
            self.announce_device(device).await?;
        }
        Ok(())
    }

    pub async fn announce_device(
        &self,
        device: &DeviceAnnouncement,
    ) -> Result<(), rumqttc::ClientError> {
        info!(
            "Announcing device {} ({}) on MQTT",
            device.display_name, device.mac
        );
        let message = TrackerDiscoveryMessage {
            name: &device.display_name,
            unique_id: format!("unifi_presence_{}", device.dev_id),
            state_topic: self.state_topic(&device.dev_id),
            json_attributes_topic: self.attributes_topic(&device.dev_id),
            payload_home: Presence::Home.as_str(),
            payload_not_home: Presence::NotHome.as_str(),
            source_type: "router",
        };
        self.publish_json(
            format!(
                "{}/device_tracker/{}/config",
                self.discovery_prefix, device.dev_id
            ),
            &message,
        )
        .await?;
        self.publish_state(device).await
    }

    pub async fn publish_state(
        &self,
        device: &DeviceAnnouncement,
    ) -> Result<(), rumqttc::ClientError> {
        let attributes = TrackerAttributesMessage {
            mac: &device.mac,
            dev_id: &device.dev_id,
            ip: device.last_known_ip.as_deref(),
        };
        self.publish_json(self.attributes_topic(&device.dev_id), &attributes)
            .await?;

        // Unknown devices keep whatever the broker retained from last time.
        let Some(presence) = device.presence else {
            return Ok(());
        };
        debug!("{} is {}", device.mac, presence.as_str());
        self.client
            .publish(
                self.state_topic(&device.dev_id),
                QoS::AtLeastOnce,
                true,
                presence.as_str(),
            )
            .await
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }

    async fn publish_json<T: serde::Serialize>(
        &self,
        topic: String,
        message: &T,
    ) -> Result<(), rumqttc::ClientError> {
        let payload = match serde_json::to_vec(message) {
            Ok(payload) => payload,
            Err(err) => {
                error!("Could not encode MQTT message for {}: {}", topic, err);
                return Ok(());
            }
        };
        self.client
            .publish(topic, QoS::AtLeastOnce, true, payload)
            .await
    }

    fn state_topic(&self, dev_id: &str) -> String {
        format!("{}/{}/state", self.topic_path, dev_id)
    }

    fn attributes_topic(&self, dev_id: &str) -> String {
        format!("{}/{}/attributes", self.topic_path, dev_id)
    }

    fn classify(&self, topic: &str) -> Inbound {
        if topic == self.webhook_topic {
            return Inbound::Webhook { token: None };
        }
        if let Some(token) = topic
            .strip_prefix(self.webhook_topic.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
        {
            return Inbound::Webhook {
                token: Some(token.to_string()),
            };
        }
        topic
            .strip_prefix(self.topic_path.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .and_then(|rest| rest.strip_suffix("/state"))
            .and_then(mac_from_dev_id)
            .map(|mac| Inbound::RememberedState { mac })
            .unwrap_or(Inbound::Other)
    }

    fn authorized(&self, token: Option<&str>) -> bool {
        match self.secret.as_deref() {
            None => true,
            Some(secret) => token.is_some_and(|t| t.trim() == secret),
        }
    }
}

/// `aabbccddeeff` -> `aa:bb:cc:dd:ee:ff`
fn mac_from_dev_id(dev_id: &str) -> Option<String> {
    if dev_id.len() != 12 || !dev_id.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let octets: Vec<&str> = (0..12).step_by(2).map(|i| &dev_id[i..i + 2]).collect();
    Some(octets.join(":").to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::spawn_registry;
    use crate::registry::{DeviceRegistry, RegistrySettings};
    use crate::store::DiscoverySnapshot;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::{TcpListener, TcpStream};

    fn client(secret: Option<&str>) -> MqttClient {
        let mqtt: config::MqttConfig = toml::de::from_str("host = \"localhost\"").unwrap();
        let presence = config::PresenceConfig {
            webhook_id: Some("hook1".to_string()),
            secret: secret.map(str::to_string),
            ..Default::default()
        };
        MqttClient::new(&mqtt, &presence).0
    }

    #[test]
    fn test_mac_from_dev_id() {
        assert_eq!(
            mac_from_dev_id("AABBCCDDEEFF").as_deref(),
            Some("aa:bb:cc:dd:ee:ff")
        );
        assert_eq!(mac_from_dev_id("aabbcc"), None);
        assert_eq!(mac_from_dev_id("zzbbccddeeff"), None);
    }

    #[tokio::test]
    async fn test_classify_topics() {
        let client = client(None);
        assert_eq!(
            client.classify("unifi_presence/webhook/hook1"),
            Inbound::Webhook { token: None }
        );
        assert_eq!(
            client.classify("unifi_presence/webhook/hook1/s3cret"),
            Inbound::Webhook {
                token: Some("s3cret".to_string())
            }
        );
        assert_eq!(
            client.classify("unifi_presence/aabbccddeeff/state"),
            Inbound::RememberedState {
                mac: "aa:bb:cc:dd:ee:ff".to_string()
            }
        );
        assert_eq!(client.classify("unifi_presence/webhook/other"), Inbound::Other);
        assert_eq!(client.classify("unifi_presence/aabbccddeeff/attributes"), Inbound::Other);
    }

    #[tokio::test]
    async fn test_token_check() {
        assert!(client(None).authorized(None));

        let client = client(Some("s3cret"));
        assert!(client.authorized(Some("s3cret")));
        assert!(!client.authorized(Some("wrong")));
        assert!(!client.authorized(None));
    }

    async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
        let header = stream.read_u8().await?;
        let mut remaining = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await?;
            remaining |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; remaining];
        stream.read_exact(&mut body).await?;
        Ok((header, body))
    }

    fn publish_packet(topic: &str, payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![0x30];
        let mut remaining = 2 + topic.len() + payload.len();
        loop {
            let mut byte = (remaining % 128) as u8;
            remaining /= 128;
            if remaining > 0 {
                byte |= 0x80;
            }
            packet.push(byte);
            if remaining == 0 {
                break;
            }
        }
        packet.extend((topic.len() as u16).to_be_bytes());
        packet.extend(topic.as_bytes());
        packet.extend(payload);
        packet
    }

    /// Minimal MQTT 3.1.1 broker: acks everything, counts publishes and
    /// delivers one webhook body after the first subscription.
    async fn broker(
        listener: TcpListener,
        publishes: Arc<AtomicUsize>,
        webhook_topic: String,
        webhook: Vec<u8>,
    ) -> std::io::Result<()> {
        let (mut stream, _) = listener.accept().await?;
        let mut webhook = Some(webhook);
        loop {
            let (header, body) = read_packet(&mut stream).await?;
            match header >> 4 {
                1 => stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await?,
                3 => {
                    publishes.fetch_add(1, Ordering::SeqCst);
                    if (header >> 1) & 0x03 > 0 {
                        let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
                        let pkid = &body[2 + topic_len..4 + topic_len];
                        stream.write_all(&[0x40, 0x02, pkid[0], pkid[1]]).await?;
                    }
                }
                8 => {
                    let mut filters = 0usize;
                    let mut i = 2;
                    while i + 2 <= body.len() {
                        let len = u16::from_be_bytes([body[i], body[i + 1]]) as usize;
                        i += 2 + len + 1;
                        filters += 1;
                    }
                    let mut suback = vec![0x90, 2 + filters as u8, body[0], body[1]];
                    suback.extend(vec![0x01; filters]);
                    stream.write_all(&suback).await?;
                    if let Some(payload) = webhook.take() {
                        stream
                            .write_all(&publish_packet(&webhook_topic, &payload))
                            .await?;
                    }
                }
                12 => stream.write_all(&[0xD0, 0x00]).await?,
                14 => return Ok(()),
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_restored_devices_do_not_stall_event_loop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let publishes = Arc::new(AtomicUsize::new(0));
        let webhook =
            br#"{"events": [{"id": "event.client_connected", "scope": {"mac": "aa:bb:cc:dd:ee:01"}}]}"#
                .to_vec();
        let broker = tokio::spawn(broker(
            listener,
            Arc::clone(&publishes),
            "unifi_presence/webhook/hook1".to_string(),
            webhook,
        ));

        let mqtt: config::MqttConfig =
            toml::de::from_str(&format!("host = \"127.0.0.1\"\nport = {port}")).unwrap();
        let presence = config::PresenceConfig {
            webhook_id: Some("hook1".to_string()),
            ..Default::default()
        };
        let (client, mut eventloop) = MqttClient::new(&mqtt, &presence);

        // more retained publishes than the request queue holds
        let (bus, announcements) = broadcast::channel(64);
        let mut registry = DeviceRegistry::new(RegistrySettings::default(), bus, None);
        let mut snapshot = DiscoverySnapshot::default();
        for i in 1..=5 {
            snapshot.macs.insert(format!("aa:bb:cc:dd:ee:{i:02x}"));
        }
        registry.restore_from(&snapshot);
        let registry = spawn_registry(registry);

        let publisher = {
            let client = client.clone();
            let dispatcher = registry.dispatcher();
            tokio::spawn(async move {
                client.publish_announcements(announcements, dispatcher).await;
            })
        };
        let poller = {
            let client = client.clone();
            let dispatcher = registry.dispatcher();
            tokio::spawn(async move {
                client.event_loop(&mut eventloop, dispatcher).await;
            })
        };

        let dispatcher = registry.dispatcher();
        let delivered = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let home = dispatcher.devices().await.iter().any(|d| {
                    d.mac == "aa:bb:cc:dd:ee:01" && d.presence == Some(Presence::Home)
                });
                // config + attributes for each restored device
                if home && publishes.load(Ordering::SeqCst) >= 10 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        assert!(
            delivered.is_ok(),
            "event loop stalled: {} publishes reached the broker",
            publishes.load(Ordering::SeqCst)
        );

        registry.shutdown().await;
        publisher.abort();
        poller.abort();
        broker.abort();
    }
}
