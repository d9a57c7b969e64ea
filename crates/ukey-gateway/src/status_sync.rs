//! Status synchroniser — batched, coalesced mirroring of device presence
//! into durable storage.
//!
//! A single consumer task owns the dirty map. Updates for the same device
//! merge; the map flushes when it reaches `batch_size`, on every interval
//! tick, and once more on shutdown. Each flush is one transaction with one
//! UPDATE per dirty device. When the update channel is saturated the
//! producer falls back to an immediate direct write so no update is lost.

use std::collections::HashMap;

use tokio::sync::mpsc;
use uuid::Uuid;

use ukey_common::models::device::DeviceStatusUpdate;
use ukey_db::{Database, repository::devices};

#[derive(Clone)]
pub struct StatusSyncHandle {
    tx: mpsc::Sender<DeviceStatusUpdate>,
    db: Database,
}

impl StatusSyncHandle {
    /// Record a presence flip for a device.
    pub fn device_status(&self, device_id: Uuid, is_online: bool) {
        self.push(DeviceStatusUpdate::presence(device_id, is_online));
    }

    /// Record a heartbeat for an online device.
    pub fn heartbeat(&self, device_id: Uuid) {
        self.push(DeviceStatusUpdate::heartbeat(device_id));
    }

    fn push(&self, update: DeviceStatusUpdate) {
        if let Err(mpsc::error::TrySendError::Full(update)) = self.tx.try_send(update) {
            // Back-pressure: bypass the batcher rather than drop the update.
            tracing::warn!(device_id = %update.device_id,
                "status-sync channel full, writing directly");
            let db = self.db.clone();
            tokio::spawn(async move {
                if let Err(e) = devices::apply_status_update(&db.pool, &update).await {
                    tracing::error!(device_id = %update.device_id, error = %e,
                        "direct status write failed");
                }
            });
        }
    }
}

pub struct StatusSync;

impl StatusSync {
    /// Start the consumer task. The task drains until every handle is
    /// dropped, then flushes the remainder and exits.
    pub fn spawn(
        db: Database,
        batch_size: usize,
        interval: std::time::Duration,
        channel_depth: usize,
    ) -> (StatusSyncHandle, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(channel_depth);
        let handle = StatusSyncHandle { tx, db: db.clone() };
        let task = tokio::spawn(run(db, rx, batch_size, interval));
        (handle, task)
    }
}

async fn run(
    db: Database,
    mut rx: mpsc::Receiver<DeviceStatusUpdate>,
    batch_size: usize,
    interval: std::time::Duration,
) {
    tracing::info!(batch_size, ?interval, "Status synchroniser running");

    let mut dirty: HashMap<Uuid, DeviceStatusUpdate> = HashMap::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(update) => {
                    match dirty.get_mut(&update.device_id) {
                        Some(existing) => existing.merge(&update),
                        None => {
                            dirty.insert(update.device_id, update);
                        }
                    }
                    if dirty.len() >= batch_size {
                        flush(&db, &mut dirty).await;
                    }
                }
                None => break, // every producer handle dropped
            },
            _ = ticker.tick() => flush(&db, &mut dirty).await,
        }
    }

    flush(&db, &mut dirty).await;
    tracing::info!("Status synchroniser stopped");
}

async fn flush(db: &Database, dirty: &mut HashMap<Uuid, DeviceStatusUpdate>) {
    if dirty.is_empty() {
        return;
    }

    let updates: Vec<DeviceStatusUpdate> = dirty.drain().map(|(_, u)| u).collect();
    let count = updates.len();
    if let Err(e) = devices::apply_status_updates(&db.pool, &updates).await {
        tracing::error!(error = %e, count, "Batched status flush failed");
    } else {
        tracing::debug!(count, "Flushed device status batch");
    }
}
