//! Durable record of every MAC we have ever seen.
//!
//! The file is small and always rewritten whole: the new contents go to a
//! sibling `.tmp` file which is then renamed over the old one, so a reader
//! sees either the previous snapshot or the new one.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::path::PathBuf;

use anyhow::Context as _;
use log::{debug, error, info, warn};
use serde_derive::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const STORAGE_VERSION: u32 = 1;
const STORAGE_KEY: &str = "unifi_presence_data";

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct DiscoverySnapshot {
    pub macs: BTreeSet<String>,
    #[serde(default)]
    pub ips: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Debug)]
struct StoredDocument {
    version: u32,
    #[serde(default)]
    key: Option<String>,
    data: DiscoverySnapshot,
}

#[derive(Debug, Clone)]
pub struct DiscoveryStore {
    path: PathBuf,
}

impl DiscoveryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DiscoveryStore { path: path.into() }
    }

    /// Missing or unreadable data yields an empty snapshot.
    pub async fn load(&self) -> DiscoverySnapshot {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No discovery data at {:?} (first run)", self.path);
                return DiscoverySnapshot::default();
            }
            Err(e) => {
                error!("Failed to read discovery data {:?}: {}", self.path, e);
                return DiscoverySnapshot::default();
            }
        };

        match serde_json::from_slice::<StoredDocument>(&bytes) {
            Ok(document) => {
                if document.version != STORAGE_VERSION {
                    warn!(
                        "Discovery data {:?} has version {}, expected {}",
                        self.path, document.version, STORAGE_VERSION
                    );
                }
                let mut snapshot = document.data;
                snapshot.macs = snapshot.macs.iter().map(|m| m.to_lowercase()).collect();
                snapshot.ips = snapshot
                    .ips
                    .into_iter()
                    .map(|(mac, ip)| (mac.to_lowercase(), ip))
                    .collect();
                info!(
                    "Loaded {} known devices from {:?}",
                    snapshot.macs.len(),
                    self.path
                );
                snapshot
            }
            Err(e) => {
                warn!("Failed to parse discovery data {:?}: {}", self.path, e);
                DiscoverySnapshot::default()
            }
        }
    }

    pub async fn save(&self, snapshot: &DiscoverySnapshot) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let document = StoredDocument {
            version: STORAGE_VERSION,
            key: Some(STORAGE_KEY.to_string()),
            data: snapshot.clone(),
        };
        let data = serde_json::to_vec_pretty(&document)?;

        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, data)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;

        debug!("Saved {} known devices to {:?}", snapshot.macs.len(), self.path);
        Ok(())
    }

    /// Forget everything. A record that is already gone is not an error.
    pub async fn remove(&self) -> anyhow::Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!("Removed discovery data {:?}", self.path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", self.path.display())),
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = OsString::from(self.path.as_os_str());
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }
}

/// Background writer. Callers hand over the latest snapshot and move on;
/// bursts collapse into one write and writes never go backwards.
pub struct Persister {
    tx: watch::Sender<Option<DiscoverySnapshot>>,
    task: JoinHandle<()>,
}

impl Persister {
    pub fn spawn(store: DiscoveryStore) -> Self {
        let (tx, mut rx) = watch::channel::<Option<DiscoverySnapshot>>(None);
        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let snapshot = rx.borrow_and_update().clone();
                let Some(snapshot) = snapshot else {
                    continue;
                };
                if let Err(err) = store.save(&snapshot).await {
                    error!("Failed to persist discovered devices: {:#}", err);
                }
            }
            debug!("Discovery writer stopped");
        });
        Persister { tx, task }
    }

    pub fn submit(&self, snapshot: DiscoverySnapshot) {
        self.tx.send_replace(Some(snapshot));
    }

    /// Wait for the last submitted snapshot to hit the disk (or fail to).
    pub async fn close(self) {
        let Persister { tx, task } = self;
        drop(tx);
        if let Err(err) = task.await {
            error!("Discovery writer panicked: {:?}", err);
        }
    }
}
