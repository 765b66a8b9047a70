//! Dynamic-resource-allocation device index.
//!
//! Clusters on the DRA scheme advertise GPUs and MIG partitions through
//! driver-managed resource slices instead of the device plugin. An informer
//! feeds slice events into a channel; a background task folds them into a
//! `(pool, device) -> DraDeviceInfo` index that the scrape path reads without
//! blocking the feed.

use crate::error::{ExporterError, Result};
use ahash::AHashMap as HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// How long startup waits for the informer's initial list to land.
pub const DRA_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraMigInfo {
    pub gpu_index: u32,
    pub gpu_instance_id: u32,
    pub profile: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraDeviceInfo {
    pub parent_uuid: String,
    pub mig: Option<DraMigInfo>,
}

/// One change observed on the resource-slice feed.
#[derive(Debug)]
pub enum DraEvent {
    Upsert {
        pool: String,
        device: String,
        info: DraDeviceInfo,
    },
    Remove {
        pool: String,
        device: String,
    },
    /// The informer finished its initial list.
    Synced,
}

/// Read handle over the index. Cheap to clone; all clones observe the same
/// state.
#[derive(Clone)]
pub struct DraIndex {
    devices: Arc<RwLock<HashMap<(String, String), DraDeviceInfo>>>,
    synced: watch::Receiver<bool>,
}

impl DraIndex {
    /// Spawns the folding task and returns the reader plus the sender the
    /// informer writes to. The task ends when the sender side is dropped.
    pub fn spawn() -> (Self, mpsc::Sender<DraEvent>) {
        let devices: Arc<RwLock<HashMap<(String, String), DraDeviceInfo>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let (synced_tx, synced_rx) = watch::channel(false);
        let (event_tx, mut event_rx) = mpsc::channel::<DraEvent>(256);

        let task_devices = Arc::clone(&devices);
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                match event {
                    DraEvent::Upsert { pool, device, info } => {
                        debug!("dra index upsert {pool}/{device}");
                        task_devices
                            .write()
                            .unwrap_or_else(|e| e.into_inner())
                            .insert((pool, device), info);
                    }
                    DraEvent::Remove { pool, device } => {
                        debug!("dra index remove {pool}/{device}");
                        task_devices
                            .write()
                            .unwrap_or_else(|e| e.into_inner())
                            .remove(&(pool, device));
                    }
                    DraEvent::Synced => {
                        info!("dra informer completed initial sync");
                        let _ = synced_tx.send(true);
                    }
                }
            }
        });

        (
            Self {
                devices,
                synced: synced_rx,
            },
            event_tx,
        )
    }

    /// Blocks until the informer reports its initial sync, up to `timeout`.
    pub async fn wait_for_sync(&self, timeout: Duration) -> Result<()> {
        let mut synced = self.synced.clone();
        tokio::time::timeout(timeout, async {
            while !*synced.borrow_and_update() {
                synced
                    .changed()
                    .await
                    .map_err(|_| ExporterError::Enrichment("dra informer stopped".to_string()))?;
            }
            Ok(())
        })
        .await
        .map_err(|_| ExporterError::Enrichment("dra informer sync timed out".to_string()))?
    }

    pub fn get(&self, pool: &str, device: &str) -> Option<DraDeviceInfo> {
        self.devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(pool.to_string(), device.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.devices.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu(parent: &str) -> DraDeviceInfo {
        DraDeviceInfo {
            parent_uuid: parent.to_string(),
            mig: None,
        }
    }

    #[tokio::test]
    async fn upserts_and_removals_fold_into_the_index() {
        let (index, tx) = DraIndex::spawn();
        tx.send(DraEvent::Upsert {
            pool: "node-a".to_string(),
            device: "gpu-0".to_string(),
            info: gpu("GPU-abc"),
        })
        .await
        .unwrap();
        tx.send(DraEvent::Synced).await.unwrap();
        index.wait_for_sync(Duration::from_secs(1)).await.unwrap();

        assert_eq!(index.get("node-a", "gpu-0"), Some(gpu("GPU-abc")));
        assert_eq!(index.get("node-a", "gpu-1"), None);

        tx.send(DraEvent::Remove {
            pool: "node-a".to_string(),
            device: "gpu-0".to_string(),
        })
        .await
        .unwrap();
        drop(tx);
        // Channel closure means every event above has been folded.
        while index.len() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn mig_partitions_carry_their_placement() {
        let (index, tx) = DraIndex::spawn();
        tx.send(DraEvent::Upsert {
            pool: "node-a".to_string(),
            device: "gpu-0-mig-1".to_string(),
            info: DraDeviceInfo {
                parent_uuid: "GPU-abc".to_string(),
                mig: Some(DraMigInfo {
                    gpu_index: 0,
                    gpu_instance_id: 1,
                    profile: "1g.10gb".to_string(),
                }),
            },
        })
        .await
        .unwrap();
        tx.send(DraEvent::Synced).await.unwrap();
        index.wait_for_sync(Duration::from_secs(1)).await.unwrap();

        let info = index.get("node-a", "gpu-0-mig-1").unwrap();
        assert_eq!(info.mig.unwrap().profile, "1g.10gb");
    }

    #[tokio::test]
    async fn sync_wait_times_out_without_an_informer() {
        let (index, _tx) = DraIndex::spawn();
        let err = index.wait_for_sync(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, ExporterError::Enrichment(_)));
    }
}
