//! Delivery of webhook payloads into the registry.
//!
//! The registry is owned by a single task fed through a channel, so however
//! many transports call [`Dispatcher::ingest`] at once, events reach the
//! trackers one at a time and in the order they were queued.

use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::messages::{DeviceAnnouncement, NormalizedEvent, Presence};
use crate::normalizer;
use crate::registry::DeviceRegistry;

const QUEUE_DEPTH: usize = 256;

#[derive(Debug)]
enum Command {
    Event(NormalizedEvent),
    Restore { mac: String, presence: Presence },
    Devices(oneshot::Sender<Vec<DeviceAnnouncement>>),
}

#[derive(Clone, Debug)]
pub struct Dispatcher {
    tx: mpsc::Sender<Command>,
}

/// Owns the registry task. Dropping it stops the task too, but only
/// `shutdown` waits for pending timers to be cancelled and the last save.
pub struct RegistryHandle {
    dispatcher: Dispatcher,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub fn spawn_registry(registry: DeviceRegistry) -> RegistryHandle {
    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
    let (shutdown, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(run_registry(registry, rx, shutdown_rx));
    RegistryHandle {
        dispatcher: Dispatcher { tx },
        shutdown,
        task,
    }
}

async fn run_registry(
    mut registry: DeviceRegistry,
    mut rx: mpsc::Receiver<Command>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            command = rx.recv() => match command {
                Some(Command::Event(event)) => {
                    registry.lookup_or_create(&event.mac, event.ip.as_deref(), event.transition);
                }
                Some(Command::Restore { mac, presence }) => {
                    if registry.restore_presence(&mac, presence) {
                        debug!("Restored {} as {}", mac, presence.as_str());
                    }
                }
                Some(Command::Devices(reply)) => {
                    let _ = reply.send(registry.devices());
                }
                None => break,
            },
        }
    }
    registry.shutdown().await;
}

impl RegistryHandle {
    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    /// Stop routing events and cancel every pending away timer.
    pub async fn shutdown(self) {
        let RegistryHandle {
            dispatcher,
            shutdown,
            task,
        } = self;
        drop(dispatcher);
        let _ = shutdown.send(());
        if let Err(err) = task.await {
            warn!("Registry task ended abnormally: {:?}", err);
        }
    }
}

impl Dispatcher {
    /// Decode one webhook body and queue every usable event it contains.
    /// Returns how many events were routed; bad input just yields 0.
    pub async fn ingest(&self, raw: &[u8]) -> usize {
        let envelope: serde_json::Value = if raw.iter().all(u8::is_ascii_whitespace) {
            serde_json::Value::Object(Default::default())
        } else {
            match serde_json::from_slice(raw) {
                Ok(value) => value,
                Err(err) => {
                    warn!("Ignoring webhook payload that is not JSON: {}", err);
                    return 0;
                }
            }
        };

        let events = normalizer::extract_events(&envelope);
        if events.is_empty() {
            debug!("Webhook payload carried no events");
            return 0;
        }

        let mut processed = 0;
        for event in &events {
            let Some(event) = normalizer::normalize(event) else {
                debug!("Dropping unrecognized event: {}", event);
                continue;
            };
            debug!("Processing {:?} event for {}", event.transition, event.mac);
            if self.tx.send(Command::Event(event)).await.is_err() {
                warn!("Registry is gone, dropping remaining events");
                break;
            }
            processed += 1;
        }
        processed
    }

    /// Offer a remembered presence for a device that has not reported yet.
    pub async fn restore(&self, mac: &str, presence: Presence) {
        let command = Command::Restore {
            mac: mac.to_lowercase(),
            presence,
        };
        if self.tx.send(command).await.is_err() {
            debug!("Registry is gone, ignoring restore for {}", mac);
        }
    }

    /// Snapshot of every tracked device, in MAC order.
    pub async fn devices(&self) -> Vec<DeviceAnnouncement> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Devices(reply)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}
