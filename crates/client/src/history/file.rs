// -------------------------------------------------------------------------------------------------
//  Copyright (C) 2015-2025 Nautech Systems Pty Ltd. All rights reserved.
//  https://nautechsystems.io
//
//  Licensed under the GNU Lesser General Public License Version 3.0 (the "License");
//  You may not use this file except in compliance with the License.
//  You may obtain a copy of the License at https://www.gnu.org/licenses/lgpl-3.0.en.html
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.
// -------------------------------------------------------------------------------------------------

//! History storage persisted as JSON files below a configurable root directory.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, Weak},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use termsync_common::MUTEX_POISONED;
use tokio_util::sync::CancellationToken;

use super::{HistoryStorage, memory::MemoryHistoryStorage};
use crate::{
    config::HistoryStorageConfig,
    error::SyncResult,
    identifiers::{AccountId, InstanceKey},
    listener::SynchronizationListener,
    model::{Deal, HistoryOrder},
};

/// History storage which keeps history in memory and flushes modifications to disk.
///
/// History is written to `{root}/{account}-{application}-orders.json` and
/// `{root}/{account}-{application}-deals.json` on a fixed interval and on close.
#[derive(Debug)]
pub struct FileHistoryStorage {
    config: HistoryStorageConfig,
    memory: MemoryHistoryStorage,
    cancel_token: Mutex<CancellationToken>,
    self_ref: Weak<Self>,
}

impl FileHistoryStorage {
    /// Creates a new [`FileHistoryStorage`] instance.
    #[must_use]
    pub fn new(config: HistoryStorageConfig) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            memory: MemoryHistoryStorage::new(),
            cancel_token: Mutex::new(CancellationToken::new()),
            self_ref: self_ref.clone(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &HistoryStorageConfig {
        &self.config
    }

    fn file_paths(&self) -> Option<(PathBuf, PathBuf)> {
        let account_id = self.memory.account_id()?;
        let prefix = format!("{account_id}-{}", self.memory.application());
        Some((
            self.config.root.join(format!("{prefix}-orders.json")),
            self.config.root.join(format!("{prefix}-deals.json")),
        ))
    }

    fn start_flush_task(&self) {
        let weak = self.self_ref.clone();
        let cancel_token = {
            let mut current = self.cancel_token.lock().expect(MUTEX_POISONED);
            current.cancel();
            *current = CancellationToken::new();
            current.clone()
        };
        let interval = self.config.flush_interval();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }

                let Some(storage) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = storage.update_disk_storage().await {
                    tracing::error!("Failed to flush history storage: {e}");
                }
            }
            tracing::debug!("History flush task stopped");
        });
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> SyncResult<Vec<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

async fn write_json<T: Serialize>(path: &Path, items: &[T]) -> SyncResult<()> {
    let bytes = serde_json::to_vec(items)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_file(path: &Path) -> SyncResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl SynchronizationListener for FileHistoryStorage {
    async fn on_synchronization_started(&self, key: &InstanceKey, synchronization_id: &str) {
        self.memory
            .on_synchronization_started(key, synchronization_id)
            .await;
    }

    async fn on_history_order_added(&self, key: &InstanceKey, history_order: &HistoryOrder) {
        self.memory.on_history_order_added(key, history_order).await;
    }

    async fn on_history_orders_synchronized(&self, key: &InstanceKey, synchronization_id: &str) {
        self.memory
            .on_history_orders_synchronized(key, synchronization_id)
            .await;
    }

    async fn on_deal_added(&self, key: &InstanceKey, deal: &Deal) {
        self.memory.on_deal_added(key, deal).await;
    }

    async fn on_deals_synchronized(&self, key: &InstanceKey, synchronization_id: &str) {
        self.memory
            .on_deals_synchronized(key, synchronization_id)
            .await;
    }

    async fn on_stream_closed(&self, key: &InstanceKey) {
        self.memory.on_stream_closed(key).await;
    }
}

#[async_trait]
impl HistoryStorage for FileHistoryStorage {
    async fn initialize(&self, account_id: AccountId, application: &str) -> SyncResult<()> {
        self.memory.bind(account_id, application);
        tokio::fs::create_dir_all(&self.config.root).await?;

        if let Err(e) = self.load_data_from_disk().await {
            tracing::warn!("Discarding unreadable history for {account_id}: {e}");
            self.memory.replace(Vec::new(), Vec::new());
        }

        self.start_flush_task();
        Ok(())
    }

    fn last_history_order_time(&self, instance_number: Option<u32>) -> DateTime<Utc> {
        self.memory.last_history_order_time(instance_number)
    }

    fn last_deal_time(&self, instance_number: Option<u32>) -> DateTime<Utc> {
        self.memory.last_deal_time(instance_number)
    }

    fn history_orders(&self) -> Vec<HistoryOrder> {
        self.memory.history_orders()
    }

    fn deals(&self) -> Vec<Deal> {
        self.memory.deals()
    }

    fn orders_synchronized(&self) -> bool {
        self.memory.orders_synchronized()
    }

    fn deals_synchronized(&self) -> bool {
        self.memory.deals_synchronized()
    }

    async fn clear(&self) -> SyncResult<()> {
        self.memory.clear().await?;
        if let Some((orders_path, deals_path)) = self.file_paths() {
            remove_file(&orders_path).await?;
            remove_file(&deals_path).await?;
        }
        Ok(())
    }

    async fn update_disk_storage(&self) -> SyncResult<()> {
        let Some((orders_path, deals_path)) = self.file_paths() else {
            return Ok(());
        };
        if !self.memory.take_dirty() {
            return Ok(());
        }

        let result = async {
            tokio::fs::create_dir_all(&self.config.root).await?;
            write_json(&orders_path, &self.memory.history_orders()).await?;
            write_json(&deals_path, &self.memory.deals()).await
        }
        .await;

        if result.is_err() {
            self.memory.mark_dirty();
        }
        result
    }

    async fn load_data_from_disk(&self) -> SyncResult<()> {
        let Some((orders_path, deals_path)) = self.file_paths() else {
            return Ok(());
        };
        let history_orders = read_json::<HistoryOrder>(&orders_path).await?;
        let deals = read_json::<Deal>(&deals_path).await?;
        tracing::debug!(
            "Loaded {} history orders and {} deals from {}",
            history_orders.len(),
            deals.len(),
            self.config.root.display(),
        );
        self.memory.replace(history_orders, deals);
        Ok(())
    }

    async fn close(&self) -> SyncResult<()> {
        self.cancel_token.lock().expect(MUTEX_POISONED).cancel();
        self.update_disk_storage().await
    }
}
