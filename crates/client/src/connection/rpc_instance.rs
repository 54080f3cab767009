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

//! Per-consumer handle on a shared [`RpcConnection`], exposing account queries.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::RpcConnection;
use crate::{
    error::{SyncError, SyncResult},
    identifiers::AccountId,
    model::{
        AccountInformation, AccountTopology, Deals, HistoryOrders, Order, Position, ServerTime,
        SymbolPrice, SymbolSpecification,
    },
    transport::TerminalTransport,
};

/// A consumer's view of an [`RpcConnection`].
#[derive(Debug)]
pub struct RpcConnectionInstance {
    id: Uuid,
    connection: Arc<RpcConnection>,
    transport: Arc<dyn TerminalTransport>,
    opened: AtomicBool,
    closed: AtomicBool,
}

impl RpcConnectionInstance {
    /// Creates a new [`RpcConnectionInstance`] instance with a fresh consumer id.
    #[must_use]
    pub fn new(connection: Arc<RpcConnection>, transport: Arc<dyn TerminalTransport>) -> Self {
        Self {
            id: Uuid::new_v4(),
            connection,
            transport,
            opened: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub const fn connection(&self) -> &Arc<RpcConnection> {
        &self.connection
    }

    #[must_use]
    pub fn account(&self) -> &AccountTopology {
        self.connection.account()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Opens the shared connection for this consumer.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Closed`] if this instance or its connection was closed.
    pub async fn connect(&self) -> SyncResult<()> {
        if self.is_closed() {
            return Err(SyncError::Closed);
        }
        if self.opened.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Err(e) = self.connection.connect(self.id).await {
            self.close().await;
            return Err(e);
        }
        Ok(())
    }

    /// Releases this consumer's reference on the shared connection.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.connection.close(self.id).await;
    }

    fn active_account(&self) -> SyncResult<AccountId> {
        super::check_is_active(self.opened.load(Ordering::Acquire), self.is_closed())?;
        self.connection.check_is_active()?;
        Ok(self.account().id)
    }

    /// See [`RpcConnection::wait_synchronized`].
    ///
    /// # Errors
    ///
    /// Returns an error if the instance is not open or synchronization does not complete.
    pub async fn wait_synchronized(&self, timeout: Option<Duration>) -> SyncResult<()> {
        self.active_account()?;
        self.connection.wait_synchronized(timeout).await
    }

    #[must_use]
    pub fn is_synchronized(&self) -> bool {
        self.connection.is_synchronized()
    }

    /// Returns the account information.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance is not open or the request fails.
    pub async fn get_account_information(&self) -> SyncResult<AccountInformation> {
        let account_id = self.active_account()?;
        self.transport.get_account_information(&account_id).await.map_err(SyncError::from)
    }

    /// Returns the open positions.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance is not open or the request fails.
    pub async fn get_positions(&self) -> SyncResult<Vec<Position>> {
        let account_id = self.active_account()?;
        self.transport.get_positions(&account_id).await.map_err(SyncError::from)
    }

    /// Returns one open position.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance is not open or the request fails.
    pub async fn get_position(&self, position_id: &str) -> SyncResult<Position> {
        let account_id = self.active_account()?;
        self.transport.get_position(&account_id, position_id).await.map_err(SyncError::from)
    }

    /// Returns the pending orders.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance is not open or the request fails.
    pub async fn get_orders(&self) -> SyncResult<Vec<Order>> {
        let account_id = self.active_account()?;
        self.transport.get_orders(&account_id).await.map_err(SyncError::from)
    }

    /// Returns one pending order.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance is not open or the request fails.
    pub async fn get_order(&self, order_id: &str) -> SyncResult<Order> {
        let account_id = self.active_account()?;
        self.transport.get_order(&account_id, order_id).await.map_err(SyncError::from)
    }

    /// # Errors
    ///
    /// Returns an error if the instance is not open or the request fails.
    pub async fn get_history_orders_by_ticket(&self, ticket: &str) -> SyncResult<HistoryOrders> {
        let account_id = self.active_account()?;
        self
            .transport
            .get_history_orders_by_ticket(&account_id, ticket)
            .await
            .map_err(SyncError::from)
    }

    /// # Errors
    ///
    /// Returns an error if the instance is not open or the request fails.
    pub async fn get_history_orders_by_position(
        &self,
        position_id: &str,
    ) -> SyncResult<HistoryOrders> {
        let account_id = self.active_account()?;
        self
            .transport
            .get_history_orders_by_position(&account_id, position_id)
            .await
            .map_err(SyncError::from)
    }

    /// Returns history orders placed within `[start_time, end_time]`, paged by `offset` and `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance is not open or the request fails.
    pub async fn get_history_orders_by_time_range(
        &self,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        offset: u32,
        limit: u32,
    ) -> SyncResult<HistoryOrders> {
        let account_id = self.active_account()?;
        self
            .transport
            .get_history_orders_by_time_range(&account_id, start_time, end_time, offset, limit)
            .await
            .map_err(SyncError::from)
    }

    /// # Errors
    ///
    /// Returns an error if the instance is not open or the request fails.
    pub async fn get_deals_by_ticket(&self, ticket: &str) -> SyncResult<Deals> {
        let account_id = self.active_account()?;
        self.transport.get_deals_by_ticket(&account_id, ticket).await.map_err(SyncError::from)
    }

    /// # Errors
    ///
    /// Returns an error if the instance is not open or the request fails.
    pub async fn get_deals_by_position(&self, position_id: &str) -> SyncResult<Deals> {
        let account_id = self.active_account()?;
        self
            .transport
            .get_deals_by_position(&account_id, position_id)
            .await
            .map_err(SyncError::from)
    }

    /// Returns deals executed within `[start_time, end_time]`, paged by `offset` and `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance is not open or the request fails.
    pub async fn get_deals_by_time_range(
        &self,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        offset: u32,
        limit: u32,
    ) -> SyncResult<Deals> {
        let account_id = self.active_account()?;
        self
            .transport
            .get_deals_by_time_range(&account_id, start_time, end_time, offset, limit)
            .await
            .map_err(SyncError::from)
    }

    /// # Errors
    ///
    /// Returns an error if the instance is not open or the request fails.
    pub async fn get_symbol_specification(&self, symbol: &str) -> SyncResult<SymbolSpecification> {
        let account_id = self.active_account()?;
        self
            .transport
            .get_symbol_specification(&account_id, symbol)
            .await
            .map_err(SyncError::from)
    }

    /// Returns the current price of `symbol`; `keep_subscription` leaves the quote stream open.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance is not open or the request fails.
    pub async fn get_symbol_price(
        &self,
        symbol: &str,
        keep_subscription: bool,
    ) -> SyncResult<SymbolPrice> {
        let account_id = self.active_account()?;
        self
            .transport
            .get_symbol_price(&account_id, symbol, keep_subscription)
            .await
            .map_err(SyncError::from)
    }

    /// # Errors
    ///
    /// Returns an error if the instance is not open or the request fails.
    pub async fn get_server_time(&self) -> SyncResult<ServerTime> {
        let account_id = self.active_account()?;
        self.transport.get_server_time(&account_id).await.map_err(SyncError::from)
    }
}
