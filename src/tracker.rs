//! Per-device presence state machine.
//!
//! A disconnect does not flip a device to `not_home` straight away: the tracker
//! enters [`ConnectionState::AwayPending`] and arms a timer for the configured
//! delay. Any later event for the same device supersedes the timer. Roaming
//! between access points (disconnect then connect within seconds) is therefore
//! never reported as the device leaving.
//!
//! Every transition bumps a sequence number under the tracker lock. The timer
//! task re-checks that number under the same lock before acting, so a timer
//! that was superseded can never move the device to `Away`, even if `abort()`
//! loses the race with the sleep completing.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::messages::{DeviceAnnouncement, Presence, StateAnnouncement, Transition};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Unknown,
    Home,
    AwayPending,
    Away,
}

impl ConnectionState {
    /// AwayPending still counts as present until the delay runs out.
    pub fn presence(&self) -> Option<Presence> {
        match self {
            ConnectionState::Unknown => None,
            ConnectionState::Home | ConnectionState::AwayPending => Some(Presence::Home),
            ConnectionState::Away => Some(Presence::NotHome),
        }
    }
}

impl From<Transition> for ConnectionState {
    fn from(transition: Transition) -> Self {
        match transition {
            Transition::Connected => ConnectionState::Home,
            Transition::Disconnected => ConnectionState::Away,
        }
    }
}

/// What a presentation layer needs from a tracked device.
pub trait PresenceSource {
    fn current_state(&self) -> Option<Presence>;
    fn subscribe(&self) -> watch::Receiver<Option<Presence>>;
}

#[derive(Debug)]
struct TrackerState {
    connection: ConnectionState,
    last_known_ip: Option<String>,
    sequence: u64,
    timer: Option<JoinHandle<()>>,
    // cleared by the first restore or live event
    restorable: bool,
    closed: bool,
}

#[derive(Debug)]
struct Shared {
    mac: String,
    dev_id: String,
    display_name: String,
    disconnect_delay: Duration,
    state: Mutex<TrackerState>,
    presence_tx: watch::Sender<Option<Presence>>,
    bus: broadcast::Sender<StateAnnouncement>,
}

#[derive(Clone, Debug)]
pub struct PresenceTracker {
    shared: Arc<Shared>,
}

impl PresenceTracker {
    pub fn new(
        mac: String,
        display_name: String,
        last_known_ip: Option<String>,
        initial: ConnectionState,
        disconnect_delay: Duration,
        bus: broadcast::Sender<StateAnnouncement>,
    ) -> Self {
        let (presence_tx, _) = watch::channel(initial.presence());
        PresenceTracker {
            shared: Arc::new(Shared {
                dev_id: mac.replace(':', ""),
                mac,
                display_name,
                disconnect_delay,
                state: Mutex::new(TrackerState {
                    connection: initial,
                    last_known_ip,
                    sequence: 0,
                    timer: None,
                    restorable: initial == ConnectionState::Unknown,
                    closed: false,
                }),
                presence_tx,
                bus,
            }),
        }
    }

    pub fn mac(&self) -> &str {
        &self.shared.mac
    }

    pub fn dev_id(&self) -> &str {
        &self.shared.dev_id
    }

    pub fn display_name(&self) -> &str {
        &self.shared.display_name
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.lock().connection
    }

    pub fn last_known_ip(&self) -> Option<String> {
        self.shared.state.lock().last_known_ip.clone()
    }

    /// Returns true if the stored IP changed.
    pub fn update_ip(&self, ip: Option<&str>) -> bool {
        let Some(ip) = ip else {
            return false;
        };
        let mut state = self.shared.state.lock();
        if state.last_known_ip.as_deref() == Some(ip) {
            return false;
        }
        state.last_known_ip = Some(ip.to_string());
        true
    }

    pub fn apply(&self, transition: Transition) {
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        state.sequence += 1;
        state.restorable = false;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }

        match (transition, state.connection) {
            (Transition::Connected, _) => {
                self.shared.transition(&mut state, ConnectionState::Home);
            }
            // Already gone: nothing to debounce.
            (Transition::Disconnected, ConnectionState::Away) => {}
            (Transition::Disconnected, _) => {
                debug!(
                    "{} disconnected, marking away in {:?} unless it reconnects",
                    self.shared.mac, self.shared.disconnect_delay
                );
                let sequence = state.sequence;
                let shared = Arc::clone(&self.shared);
                state.timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(shared.disconnect_delay).await;
                    shared.expire(sequence);
                }));
                self.shared
                    .transition(&mut state, ConnectionState::AwayPending);
            }
        }
    }

    /// Adopt a remembered value for a device nobody has reported on yet.
    /// Only the first call on a still-unknown tracker has any effect.
    pub fn restore(&self, presence: Presence) -> bool {
        let mut state = self.shared.state.lock();
        if state.closed || !state.restorable || state.connection != ConnectionState::Unknown {
            return false;
        }
        state.restorable = false;
        state.connection = match presence {
            Presence::Home => ConnectionState::Home,
            Presence::NotHome => ConnectionState::Away,
        };
        self.shared.presence_tx.send_replace(Some(presence));
        debug!("{} restored as {}", self.shared.mac, presence.as_str());
        true
    }

    /// Cancel any pending timer and stop reacting to events for good.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        state.sequence += 1;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    pub fn announcement(&self) -> DeviceAnnouncement {
        let state = self.shared.state.lock();
        self.shared.announcement(&state)
    }
}

impl Shared {
    fn transition(&self, state: &mut TrackerState, next: ConnectionState) {
        let before = state.connection.presence();
        state.connection = next;
        let after = next.presence();
        if before == after {
            return;
        }
        self.presence_tx.send_replace(after);
        if self
            .bus
            .send(StateAnnouncement::PresenceChanged(self.announcement(state)))
            .is_err()
        {
            debug!("No listeners for presence change of {}", self.mac);
        }
    }

    fn expire(&self, sequence: u64) {
        let mut state = self.state.lock();
        if state.closed
            || state.sequence != sequence
            || state.connection != ConnectionState::AwayPending
        {
            return;
        }
        state.timer = None;
        info!("{} has been gone for {:?}, marking away", self.mac, self.disconnect_delay);
        self.transition(&mut state, ConnectionState::Away);
    }

    fn announcement(&self, state: &TrackerState) -> DeviceAnnouncement {
        DeviceAnnouncement {
            mac: self.mac.clone(),
            dev_id: self.dev_id.clone(),
            display_name: self.display_name.clone(),
            last_known_ip: state.last_known_ip.clone(),
            presence: state.connection.presence(),
        }
    }
}

impl PresenceSource for PresenceTracker {
    fn current_state(&self) -> Option<Presence> {
        self.state().presence()
    }

    fn subscribe(&self) -> watch::Receiver<Option<Presence>> {
        self.shared.presence_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    const DELAY: Duration = Duration::from_secs(120);

    fn new_tracker(initial: ConnectionState) -> (PresenceTracker, broadcast::Receiver<StateAnnouncement>) {
        let (bus, rx) = broadcast::channel(16);
        let tracker = PresenceTracker::new(
            "aa:bb:cc:dd:ee:ff".to_string(),
            "phone".to_string(),
            None,
            initial,
            DELAY,
            bus,
        );
        (tracker, rx)
    }

    fn changes(rx: &mut broadcast::Receiver<StateAnnouncement>) -> Vec<Option<Presence>> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let StateAnnouncement::PresenceChanged(device) = msg {
                out.push(device.presence);
            }
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_goes_home_from_any_state() {
        for initial in [
            ConnectionState::Unknown,
            ConnectionState::Home,
            ConnectionState::Away,
        ] {
            let (tracker, _rx) = new_tracker(initial);
            tracker.apply(Transition::Connected);
            assert_eq!(tracker.state(), ConnectionState::Home);
            assert_eq!(tracker.current_state(), Some(Presence::Home));
        }

        let (tracker, _rx) = new_tracker(ConnectionState::Home);
        tracker.apply(Transition::Disconnected);
        tracker.apply(Transition::Connected);
        assert_eq!(tracker.state(), ConnectionState::Home);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_debounced() {
        let (tracker, mut rx) = new_tracker(ConnectionState::Home);
        tracker.apply(Transition::Disconnected);
        assert_eq!(tracker.state(), ConnectionState::AwayPending);
        assert_eq!(tracker.current_state(), Some(Presence::Home));

        sleep(DELAY - Duration::from_secs(1)).await;
        assert_eq!(tracker.state(), ConnectionState::AwayPending);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(tracker.state(), ConnectionState::Away);
        assert_eq!(tracker.current_state(), Some(Presence::NotHome));
        assert_eq!(changes(&mut rx), vec![Some(Presence::NotHome)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_roaming_blip_never_reports_away() {
        let (tracker, mut rx) = new_tracker(ConnectionState::Home);
        let mut watcher = tracker.subscribe();

        tracker.apply(Transition::Disconnected);
        sleep(Duration::from_secs(5)).await;
        tracker.apply(Transition::Connected);
        sleep(DELAY * 3).await;

        assert_eq!(tracker.state(), ConnectionState::Home);
        assert!(changes(&mut rx).is_empty());
        assert!(!watcher.has_changed().unwrap());
        assert_eq!(*watcher.borrow_and_update(), Some(Presence::Home));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_disconnect_restarts_window() {
        let (tracker, _rx) = new_tracker(ConnectionState::Home);
        tracker.apply(Transition::Disconnected);
        sleep(Duration::from_secs(100)).await;
        tracker.apply(Transition::Disconnected);

        // the first timer would have fired at t=120
        sleep(Duration::from_secs(100)).await;
        assert_eq!(tracker.state(), ConnectionState::AwayPending);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(tracker.state(), ConnectionState::Away);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_disconnect_reports_present_until_timer() {
        let (tracker, mut rx) = new_tracker(ConnectionState::Unknown);
        assert_eq!(tracker.current_state(), None);

        tracker.apply(Transition::Disconnected);
        assert_eq!(tracker.state(), ConnectionState::AwayPending);
        assert_eq!(tracker.current_state(), Some(Presence::Home));

        sleep(DELAY + Duration::from_secs(1)).await;
        assert_eq!(
            changes(&mut rx),
            vec![Some(Presence::Home), Some(Presence::NotHome)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_away_stays_away() {
        let (tracker, mut rx) = new_tracker(ConnectionState::Away);
        tracker.apply(Transition::Disconnected);
        assert_eq!(tracker.state(), ConnectionState::Away);
        sleep(DELAY * 2).await;
        assert_eq!(tracker.state(), ConnectionState::Away);
        assert!(changes(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_pending_away() {
        let (tracker, mut rx) = new_tracker(ConnectionState::Home);
        tracker.apply(Transition::Disconnected);
        tracker.close();

        sleep(DELAY * 2).await;
        assert_eq!(tracker.state(), ConnectionState::AwayPending);
        assert!(changes(&mut rx).is_empty());

        // closed trackers ignore further events
        tracker.apply(Transition::Connected);
        assert_eq!(tracker.state(), ConnectionState::AwayPending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_fire_is_ignored() {
        let (tracker, mut rx) = new_tracker(ConnectionState::Home);
        tracker.apply(Transition::Disconnected);
        let first = tracker.shared.state.lock().sequence;
        tracker.apply(Transition::Connected);

        // a fire that was already past its sleep when the reconnect landed
        tracker.shared.expire(first);
        assert_eq!(tracker.state(), ConnectionState::Home);
        assert!(changes(&mut rx).is_empty());

        tracker.apply(Transition::Disconnected);
        tracker.apply(Transition::Disconnected);
        tracker.shared.expire(first);
        assert_eq!(tracker.state(), ConnectionState::AwayPending);

        let current = tracker.shared.state.lock().sequence;
        tracker.close();
        tracker.shared.expire(current);
        assert_eq!(tracker.state(), ConnectionState::AwayPending);
        assert!(changes(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_once_and_live_event_wins() {
        let (tracker, _rx) = new_tracker(ConnectionState::Unknown);
        assert!(tracker.restore(Presence::NotHome));
        assert_eq!(tracker.state(), ConnectionState::Away);
        assert!(!tracker.restore(Presence::Home));
        assert_eq!(tracker.state(), ConnectionState::Away);

        tracker.apply(Transition::Connected);
        assert_eq!(tracker.state(), ConnectionState::Home);

        let (tracker, _rx) = new_tracker(ConnectionState::Unknown);
        tracker.apply(Transition::Connected);
        assert!(!tracker.restore(Presence::NotHome));
        assert_eq!(tracker.state(), ConnectionState::Home);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_ip() {
        let (tracker, _rx) = new_tracker(ConnectionState::Home);
        assert!(!tracker.update_ip(None));
        assert!(tracker.update_ip(Some("10.0.0.5")));
        assert!(!tracker.update_ip(Some("10.0.0.5")));
        assert_eq!(tracker.last_known_ip().as_deref(), Some("10.0.0.5"));
        assert_eq!(tracker.dev_id(), "aabbccddeeff");
    }
}
