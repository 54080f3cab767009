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

//! Storage of an account's order and deal history.
//!
//! A storage listens to the same synchronization events as the terminal state, merges the
//! history streamed by every instance into one account-level view, and exposes the
//! watermarks a synchronize request resumes from.

pub mod file;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::SyncResult,
    identifiers::AccountId,
    listener::SynchronizationListener,
    model::{Deal, HistoryOrder},
};

pub use self::{file::FileHistoryStorage, memory::MemoryHistoryStorage};

#[async_trait]
pub trait HistoryStorage: SynchronizationListener {
    /// Binds the storage to an account and loads any persisted history.
    ///
    /// # Errors
    ///
    /// Returns an error if persisted history cannot be read.
    async fn initialize(&self, account_id: AccountId, application: &str) -> SyncResult<()>;

    /// Time of the most recent history order seen by `instance_number`, falling back to the
    /// account-wide maximum, or the Unix epoch when nothing is stored.
    fn last_history_order_time(&self, instance_number: Option<u32>) -> DateTime<Utc>;

    /// Time of the most recent deal seen by `instance_number`, falling back to the
    /// account-wide maximum, or the Unix epoch when nothing is stored.
    fn last_deal_time(&self, instance_number: Option<u32>) -> DateTime<Utc>;

    /// History orders ordered by completion time, then id.
    fn history_orders(&self) -> Vec<HistoryOrder>;

    /// Deals ordered by time, then id.
    fn deals(&self) -> Vec<Deal>;

    /// Returns whether some instance finished synchronizing history orders.
    fn orders_synchronized(&self) -> bool;

    /// Returns whether some instance finished synchronizing deals.
    fn deals_synchronized(&self) -> bool;

    /// Drops all stored history, including anything persisted.
    ///
    /// # Errors
    ///
    /// Returns an error if persisted history cannot be removed.
    async fn clear(&self) -> SyncResult<()>;

    /// Persists modified history.
    ///
    /// # Errors
    ///
    /// Returns an error if history cannot be written.
    async fn update_disk_storage(&self) -> SyncResult<()> {
        Ok(())
    }

    /// Replaces in-memory history with the persisted copy.
    ///
    /// # Errors
    ///
    /// Returns an error if persisted history cannot be read or parsed.
    async fn load_data_from_disk(&self) -> SyncResult<()> {
        Ok(())
    }

    /// Flushes and stops any background work. Called when the owning connection closes.
    ///
    /// # Errors
    ///
    /// Returns an error if the final flush fails.
    async fn close(&self) -> SyncResult<()> {
        self.update_disk_storage().await
    }

    fn history_orders_by_ticket(&self, ticket: &str) -> Vec<HistoryOrder> {
        self.history_orders()
            .into_iter()
            .filter(|order| order.id == ticket)
            .collect()
    }

    fn history_orders_by_position(&self, position_id: &str) -> Vec<HistoryOrder> {
        self.history_orders()
            .into_iter()
            .filter(|order| order.position_id.as_deref() == Some(position_id))
            .collect()
    }

    /// History orders completed within `[start, end]`.
    fn history_orders_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<HistoryOrder> {
        self.history_orders()
            .into_iter()
            .filter(|order| (start..=end).contains(&order.sort_time()))
            .collect()
    }

    fn deals_by_ticket(&self, ticket: &str) -> Vec<Deal> {
        self.deals()
            .into_iter()
            .filter(|deal| deal.id == ticket)
            .collect()
    }

    fn deals_by_position(&self, position_id: &str) -> Vec<Deal> {
        self.deals()
            .into_iter()
            .filter(|deal| deal.position_id.as_deref() == Some(position_id))
            .collect()
    }

    /// Deals executed within `[start, end]`.
    fn deals_by_time_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Deal> {
        self.deals()
            .into_iter()
            .filter(|deal| (start..=end).contains(&deal.time))
            .collect()
    }
}
