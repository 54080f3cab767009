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

//! History storage kept in process memory.

use std::{collections::BTreeMap, sync::Mutex};

use ahash::AHashMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use termsync_common::MUTEX_POISONED;

use super::HistoryStorage;
use crate::{
    error::SyncResult,
    identifiers::{AccountId, InstanceKey},
    listener::SynchronizationListener,
    model::{Deal, HistoryOrder},
};

type OrderKey = (DateTime<Utc>, String);

#[derive(Debug, Default)]
struct SyncFlags {
    orders: bool,
    deals: bool,
}

#[derive(Debug, Default)]
struct MemoryHistoryInner {
    account_id: Option<AccountId>,
    application: String,
    history_orders: BTreeMap<OrderKey, HistoryOrder>,
    history_order_times: AHashMap<String, DateTime<Utc>>,
    deals: BTreeMap<OrderKey, Deal>,
    deal_times: AHashMap<String, DateTime<Utc>>,
    order_watermarks: AHashMap<u32, DateTime<Utc>>,
    deal_watermarks: AHashMap<u32, DateTime<Utc>>,
    flags: AHashMap<InstanceKey, SyncFlags>,
    dirty: bool,
}

impl MemoryHistoryInner {
    fn insert_history_order(&mut self, order: HistoryOrder) {
        let time = order.sort_time();
        if let Some(previous) = self.history_order_times.insert(order.id.clone(), time) {
            self.history_orders.remove(&(previous, order.id.clone()));
        }
        self.history_orders.insert((time, order.id.clone()), order);
    }

    fn insert_deal(&mut self, deal: Deal) {
        let time = deal.time;
        if let Some(previous) = self.deal_times.insert(deal.id.clone(), time) {
            self.deals.remove(&(previous, deal.id.clone()));
        }
        self.deals.insert((time, deal.id.clone()), deal);
    }

    fn clear_history(&mut self) {
        self.history_orders.clear();
        self.history_order_times.clear();
        self.deals.clear();
        self.deal_times.clear();
        self.order_watermarks.clear();
        self.deal_watermarks.clear();
    }
}

fn watermark(
    watermarks: &AHashMap<u32, DateTime<Utc>>,
    latest: Option<DateTime<Utc>>,
    instance_number: Option<u32>,
) -> DateTime<Utc> {
    let overall = latest.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    instance_number
        .and_then(|n| watermarks.get(&n).copied())
        .unwrap_or(overall)
}

/// History storage that only lives as long as the process.
#[derive(Debug, Default)]
pub struct MemoryHistoryStorage {
    inner: Mutex<MemoryHistoryInner>,
}

impl MemoryHistoryStorage {
    /// Creates a new empty [`MemoryHistoryStorage`] instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn account_id(&self) -> Option<AccountId> {
        self.inner.lock().expect(MUTEX_POISONED).account_id
    }

    #[must_use]
    pub fn application(&self) -> String {
        self.inner.lock().expect(MUTEX_POISONED).application.clone()
    }

    pub(crate) fn bind(&self, account_id: AccountId, application: &str) {
        let mut inner = self.inner.lock().expect(MUTEX_POISONED);
        inner.account_id = Some(account_id);
        inner.application = application.to_string();
    }

    /// Replaces stored history without marking it modified.
    pub(crate) fn replace(&self, history_orders: Vec<HistoryOrder>, deals: Vec<Deal>) {
        let mut inner = self.inner.lock().expect(MUTEX_POISONED);
        inner.clear_history();
        for order in history_orders {
            inner.insert_history_order(order);
        }
        for deal in deals {
            inner.insert_deal(deal);
        }
        inner.dirty = false;
    }

    /// Returns whether history changed since the last call, resetting the flag.
    pub(crate) fn take_dirty(&self) -> bool {
        std::mem::take(&mut self.inner.lock().expect(MUTEX_POISONED).dirty)
    }

    pub(crate) fn mark_dirty(&self) {
        self.inner.lock().expect(MUTEX_POISONED).dirty = true;
    }

    fn with_flags(&self, key: &InstanceKey, f: impl FnOnce(&mut SyncFlags)) {
        let mut inner = self.inner.lock().expect(MUTEX_POISONED);
        f(inner.flags.entry(*key).or_default());
    }
}

#[async_trait]
impl SynchronizationListener for MemoryHistoryStorage {
    async fn on_synchronization_started(&self, key: &InstanceKey, _synchronization_id: &str) {
        self.with_flags(key, |flags| *flags = SyncFlags::default());
    }

    async fn on_history_order_added(&self, key: &InstanceKey, history_order: &HistoryOrder) {
        let mut inner = self.inner.lock().expect(MUTEX_POISONED);
        let time = history_order.sort_time();
        let mark = inner
            .order_watermarks
            .entry(key.instance_number)
            .or_insert(time);
        *mark = (*mark).max(time);
        inner.insert_history_order(history_order.clone());
        inner.dirty = true;
    }

    async fn on_history_orders_synchronized(&self, key: &InstanceKey, _synchronization_id: &str) {
        self.with_flags(key, |flags| flags.orders = true);
    }

    async fn on_deal_added(&self, key: &InstanceKey, deal: &Deal) {
        let mut inner = self.inner.lock().expect(MUTEX_POISONED);
        let mark = inner
            .deal_watermarks
            .entry(key.instance_number)
            .or_insert(deal.time);
        *mark = (*mark).max(deal.time);
        inner.insert_deal(deal.clone());
        inner.dirty = true;
    }

    async fn on_deals_synchronized(&self, key: &InstanceKey, _synchronization_id: &str) {
        self.with_flags(key, |flags| flags.deals = true);
    }

    async fn on_stream_closed(&self, key: &InstanceKey) {
        self.inner.lock().expect(MUTEX_POISONED).flags.remove(key);
    }
}

#[async_trait]
impl HistoryStorage for MemoryHistoryStorage {
    async fn initialize(&self, account_id: AccountId, application: &str) -> SyncResult<()> {
        self.bind(account_id, application);
        Ok(())
    }

    fn last_history_order_time(&self, instance_number: Option<u32>) -> DateTime<Utc> {
        let inner = self.inner.lock().expect(MUTEX_POISONED);
        let latest = inner.history_orders.keys().next_back().map(|(t, _)| *t);
        watermark(&inner.order_watermarks, latest, instance_number)
    }

    fn last_deal_time(&self, instance_number: Option<u32>) -> DateTime<Utc> {
        let inner = self.inner.lock().expect(MUTEX_POISONED);
        let latest = inner.deals.keys().next_back().map(|(t, _)| *t);
        watermark(&inner.deal_watermarks, latest, instance_number)
    }

    fn history_orders(&self) -> Vec<HistoryOrder> {
        let inner = self.inner.lock().expect(MUTEX_POISONED);
        inner.history_orders.values().cloned().collect()
    }

    fn deals(&self) -> Vec<Deal> {
        let inner = self.inner.lock().expect(MUTEX_POISONED);
        inner.deals.values().cloned().collect()
    }

    fn orders_synchronized(&self) -> bool {
        let inner = self.inner.lock().expect(MUTEX_POISONED);
        inner.flags.values().any(|flags| flags.orders)
    }

    fn deals_synchronized(&self) -> bool {
        let inner = self.inner.lock().expect(MUTEX_POISONED);
        inner.flags.values().any(|flags| flags.deals)
    }

    async fn clear(&self) -> SyncResult<()> {
        let mut inner = self.inner.lock().expect(MUTEX_POISONED);
        inner.clear_history();
        inner.flags.clear();
        inner.dirty = false;
        Ok(())
    }
}
