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

//! Capability interfaces the transport dispatches synchronization events into.
//!
//! Every event kind is a separate method with a no-op default, so implementors only override
//! the events they care about.

use std::fmt::Debug;

use async_trait::async_trait;
use ustr::Ustr;

use crate::{
    identifiers::InstanceKey,
    model::{
        AccountInformation, Deal, HistoryOrder, MarketDataSubscription, MarketDataUnsubscription,
        Order, Position, SymbolPrice, SymbolSpecification,
    },
};

/// Receives terminal synchronization events for one account.
#[async_trait]
#[allow(unused_variables)]
pub trait SynchronizationListener: Debug + Send + Sync {
    /// The instance connected to the terminal; `replicas` is the number of account replicas.
    async fn on_connected(&self, key: &InstanceKey, replicas: u32) {}

    /// The instance lost its connection to the terminal.
    async fn on_disconnected(&self, key: &InstanceKey) {}

    async fn on_broker_connection_status_changed(&self, key: &InstanceKey, connected: bool) {}

    /// The server started a synchronization requested with `synchronization_id`.
    async fn on_synchronization_started(&self, key: &InstanceKey, synchronization_id: &str) {}

    async fn on_account_information_updated(
        &self,
        key: &InstanceKey,
        account_information: &AccountInformation,
    ) {
    }

    /// Full snapshot of open positions.
    async fn on_positions_replaced(&self, key: &InstanceKey, positions: &[Position]) {}

    async fn on_positions_synchronized(&self, key: &InstanceKey, synchronization_id: &str) {}

    async fn on_position_updated(&self, key: &InstanceKey, position: &Position) {}

    async fn on_position_removed(&self, key: &InstanceKey, position_id: &str) {}

    /// Full snapshot of pending orders.
    async fn on_pending_orders_replaced(&self, key: &InstanceKey, orders: &[Order]) {}

    async fn on_pending_orders_synchronized(&self, key: &InstanceKey, synchronization_id: &str) {}

    async fn on_order_updated(&self, key: &InstanceKey, order: &Order) {}

    async fn on_order_completed(&self, key: &InstanceKey, order_id: &str) {}

    async fn on_history_order_added(&self, key: &InstanceKey, history_order: &HistoryOrder) {}

    /// All history orders requested by `synchronization_id` were delivered.
    async fn on_history_orders_synchronized(&self, key: &InstanceKey, synchronization_id: &str) {}

    async fn on_deal_added(&self, key: &InstanceKey, deal: &Deal) {}

    /// All deals requested by `synchronization_id` were delivered.
    async fn on_deals_synchronized(&self, key: &InstanceKey, synchronization_id: &str) {}

    async fn on_symbol_specifications_updated(
        &self,
        key: &InstanceKey,
        specifications: &[SymbolSpecification],
        removed_symbols: &[Ustr],
    ) {
    }

    async fn on_symbol_price_updated(&self, key: &InstanceKey, price: &SymbolPrice) {}

    /// A batch of price ticks, dispatched tick by tick unless overridden.
    async fn on_symbol_prices_updated(&self, key: &InstanceKey, prices: &[SymbolPrice]) {
        for price in prices {
            self.on_symbol_price_updated(key, price).await;
        }
    }

    /// The server reduced the market data it streams for `symbol`.
    async fn on_subscription_downgraded(
        &self,
        key: &InstanceKey,
        symbol: Ustr,
        updates: Option<&[MarketDataSubscription]>,
        unsubscriptions: Option<&[MarketDataUnsubscription]>,
    ) {
    }

    /// The transport retired the stream for this instance.
    async fn on_stream_closed(&self, key: &InstanceKey) {}

    /// The account was unsubscribed from `region`.
    async fn on_unsubscribe_region(&self, region: Ustr) {}
}

/// Receives notice that a physical socket was re-established.
#[async_trait]
pub trait ReconnectListener: Debug + Send + Sync {
    async fn on_reconnected(&self, region: Ustr, instance_number: u32);
}
