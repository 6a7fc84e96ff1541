use std::collections::HashMap;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::broadcast;

use crate::config::AppConfig;
use crate::messages::{DeviceAnnouncement, Presence, StateAnnouncement, Transition};
use crate::store::{DiscoverySnapshot, Persister};
use crate::tracker::{ConnectionState, PresenceSource as _, PresenceTracker};

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub disconnect_delay: Duration,
    pub name_prefix: String,
    /// Friendly names keyed by lowercase MAC.
    pub names: HashMap<String, String>,
}

impl RegistrySettings {
    pub fn from_config(config: &AppConfig) -> Self {
        RegistrySettings {
            disconnect_delay: config.disconnect_delay(),
            name_prefix: config.presence().name_prefix().to_string(),
            names: config
                .known_devices()
                .iter()
                .map(|d| (d.mac(), d.name.clone()))
                .collect(),
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        RegistrySettings {
            disconnect_delay: Duration::from_secs(crate::config::DEFAULT_DISCONNECT_DELAY_SECONDS),
            name_prefix: "uwp_".to_string(),
            names: HashMap::new(),
        }
    }
}

/// All devices tracked by one running instance, keyed by lowercase MAC.
pub struct DeviceRegistry {
    settings: RegistrySettings,
    devices: HashMap<String, PresenceTracker>,
    bus: broadcast::Sender<StateAnnouncement>,
    persister: Option<Persister>,
}

impl DeviceRegistry {
    pub fn new(
        settings: RegistrySettings,
        bus: broadcast::Sender<StateAnnouncement>,
        persister: Option<Persister>,
    ) -> Self {
        DeviceRegistry {
            settings,
            devices: HashMap::new(),
            bus,
            persister,
        }
    }

    /// Recreate every previously seen device, in unknown state, before any
    /// live event is routed.
    pub fn restore_from(&mut self, snapshot: &DiscoverySnapshot) {
        for mac in &snapshot.macs {
            let mac = mac.to_lowercase();
            if self.devices.contains_key(&mac) {
                continue;
            }
            let tracker = self.build(&mac, snapshot.ips.get(&mac).cloned(), ConnectionState::Unknown);
            self.announce(StateAnnouncement::DeviceDiscovered(tracker.announcement()));
            self.devices.insert(mac, tracker);
        }
        info!("Restored {} devices from discovery data", self.devices.len());
    }

    pub fn lookup_or_create(
        &mut self,
        mac: &str,
        ip: Option<&str>,
        transition: Transition,
    ) -> (&PresenceTracker, bool) {
        let mac = mac.to_lowercase();
        let created = match self.devices.get(&mac) {
            Some(tracker) => {
                if tracker.update_ip(ip) {
                    debug!("{} now at {:?}", mac, ip);
                }
                tracker.apply(transition);
                debug!("{} {:?}, now {:?}", mac, transition, tracker.current_state());
                false
            }
            None => {
                // First sighting is taken at face value, no debounce.
                let tracker = self.build(&mac, ip.map(str::to_string), transition.into());
                info!(
                    "Discovered new device {} ({:?})",
                    mac,
                    tracker.state()
                );
                self.announce(StateAnnouncement::DeviceDiscovered(tracker.announcement()));
                self.devices.insert(mac.clone(), tracker);
                self.persist();
                true
            }
        };
        (&self.devices[&mac], created)
    }

    /// Returns true if the device adopted the remembered value.
    pub fn restore_presence(&self, mac: &str, presence: Presence) -> bool {
        self.devices
            .get(&mac.to_lowercase())
            .is_some_and(|tracker| tracker.restore(presence))
    }

    pub fn get(&self, mac: &str) -> Option<&PresenceTracker> {
        self.devices.get(&mac.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Current view of every device, sorted by MAC.
    pub fn devices(&self) -> Vec<DeviceAnnouncement> {
        let mut devices: Vec<_> = self.devices.values().map(|t| t.announcement()).collect();
        devices.sort_by(|a, b| a.mac.cmp(&b.mac));
        devices
    }

    pub fn snapshot(&self) -> DiscoverySnapshot {
        let mut snapshot = DiscoverySnapshot::default();
        for (mac, tracker) in &self.devices {
            snapshot.macs.insert(mac.clone());
            if let Some(ip) = tracker.last_known_ip() {
                snapshot.ips.insert(mac.clone(), ip);
            }
        }
        snapshot
    }

    /// Cancel every pending timer, then let the writer finish its last save.
    pub async fn shutdown(self) {
        for tracker in self.devices.values() {
            tracker.close();
        }
        info!("Stopped tracking {} devices", self.devices.len());
        if let Some(persister) = self.persister {
            persister.close().await;
        }
    }

    fn build(&self, mac: &str, ip: Option<String>, initial: ConnectionState) -> PresenceTracker {
        let display_name = self
            .settings
            .names
            .get(mac)
            .cloned()
            .unwrap_or_else(|| format!("{}{}", self.settings.name_prefix, mac));
        PresenceTracker::new(
            mac.to_string(),
            display_name,
            ip,
            initial,
            self.settings.disconnect_delay,
            self.bus.clone(),
        )
    }

    fn announce(&self, announcement: StateAnnouncement) {
        if self.bus.send(announcement).is_err() {
            debug!("No listeners for device announcement");
        }
    }

    fn persist(&self) {
        if let Some(persister) = &self.persister {
            persister.submit(self.snapshot());
        }
    }
}
