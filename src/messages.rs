#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Connected,
    Disconnected,
}

/// One client connect/disconnect, already pulled out of the controller payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NormalizedEvent {
    pub mac: String,
    pub ip: Option<String>,
    pub transition: Transition,
}

/// Externally visible presence: `None` while nothing is known yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presence {
    Home,
    NotHome,
}

impl Presence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Presence::Home => "home",
            Presence::NotHome => "not_home",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "home" => Some(Presence::Home),
            "not_home" => Some(Presence::NotHome),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceAnnouncement {
    pub mac: String,
    pub dev_id: String,
    pub display_name: String,
    pub last_known_ip: Option<String>,
    pub presence: Option<Presence>,
}

#[derive(Clone, Debug)]
pub enum StateAnnouncement {
    /// First sighting (or restore from disk): the host should register a new entity.
    DeviceDiscovered(DeviceAnnouncement),
    PresenceChanged(DeviceAnnouncement),
}
