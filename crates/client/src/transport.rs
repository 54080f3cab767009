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

//! The contract of the websocket multiplexer the connections drive.
//!
//! The transport owns the sockets, retries subscriptions and dispatches events to registered
//! listeners. The synchronization core only calls into it.

use std::{fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use ustr::Ustr;

use crate::{
    error::TransportResult,
    identifiers::AccountId,
    listener::{ReconnectListener, SynchronizationListener},
    model::{
        AccountInformation, Deals, HistoryOrders, MarketDataSubscription,
        MarketDataUnsubscription, Order, Position, Reliability, ServerTime, SymbolPrice,
        SymbolSpecification, SymbolSubscriptions, UrlSettings,
    },
    terminal_state::TerminalState,
};

/// Parameters of a synchronize request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SynchronizeRequest {
    pub account_id: AccountId,
    pub instance_number: u32,
    pub host: Ustr,
    pub synchronization_id: String,
    pub starting_history_order_time: DateTime<Utc>,
    pub starting_deal_time: DateTime<Utc>,
}

#[async_trait]
pub trait TerminalTransport: Debug + Send + Sync {
    /// Schedules a subscription of `account_id` on an instance slot. The transport retries it
    /// until it succeeds or the account is unsubscribed.
    async fn ensure_subscribe(&self, account_id: &AccountId, instance_number: u32);

    /// Unsubscribes every instance slot of `account_id`.
    async fn unsubscribe(&self, account_id: &AccountId) -> TransportResult<()>;

    /// Drops the region bookkeeping of an account and notifies its listeners.
    async fn unsubscribe_account_region(&self, account_id: &AccountId, region: Ustr);

    /// Requests a terminal synchronization. The terminal state is passed so the server can
    /// skip data the client already holds.
    async fn synchronize(
        &self,
        request: SynchronizeRequest,
        terminal_state: &TerminalState,
    ) -> TransportResult<()>;

    async fn subscribe_to_market_data(
        &self,
        account_id: &AccountId,
        symbol: Ustr,
        subscriptions: &[MarketDataSubscription],
        reliability: Reliability,
    ) -> TransportResult<()>;

    async fn unsubscribe_from_market_data(
        &self,
        account_id: &AccountId,
        symbol: Ustr,
        unsubscriptions: &[MarketDataUnsubscription],
        reliability: Reliability,
    ) -> TransportResult<()>;

    /// Re-sends the full desired subscription set on an instance slot.
    async fn refresh_market_data_subscriptions(
        &self,
        account_id: &AccountId,
        instance_number: u32,
        subscriptions: &[SymbolSubscriptions],
    ) -> TransportResult<()>;

    /// Waits on the server side until applications matching `application_pattern` are
    /// synchronized.
    async fn wait_synchronized(
        &self,
        account_id: &AccountId,
        instance_number: Option<u32>,
        application_pattern: &str,
        timeout: Duration,
    ) -> TransportResult<()>;

    /// Removes the application from the server, clearing its server-side cache.
    async fn remove_application(&self, account_id: &AccountId) -> TransportResult<()>;

    async fn url_settings(&self, instance_number: u32, region: Ustr)
    -> TransportResult<UrlSettings>;

    /// Token appended to probe connections.
    fn auth_token(&self) -> String;

    fn add_synchronization_listener(
        &self,
        account_id: &AccountId,
        listener: Arc<dyn SynchronizationListener>,
    );

    fn remove_synchronization_listener(
        &self,
        account_id: &AccountId,
        listener: &Arc<dyn SynchronizationListener>,
    );

    fn add_reconnect_listener(&self, listener: Arc<dyn ReconnectListener>, account_id: &AccountId);

    fn remove_reconnect_listener(&self, listener: &Arc<dyn ReconnectListener>);

    /// Records the region topology of an account so events from replicas can be routed.
    fn add_account_cache(&self, account_id: &AccountId, replicas: &IndexMap<Ustr, AccountId>);

    fn remove_account_cache(&self, account_id: &AccountId);

    /// Region to replica id for an account registered through [`Self::add_account_cache`].
    fn account_replicas(&self, account_id: &AccountId) -> IndexMap<Ustr, AccountId>;

    fn primary_account_id(&self, replica_id: &AccountId) -> Option<AccountId>;

    fn account_region(&self, replica_id: &AccountId) -> Option<Ustr>;

    async fn get_account_information(
        &self,
        account_id: &AccountId,
    ) -> TransportResult<AccountInformation>;

    async fn get_positions(&self, account_id: &AccountId) -> TransportResult<Vec<Position>>;

    async fn get_position(
        &self,
        account_id: &AccountId,
        position_id: &str,
    ) -> TransportResult<Position>;

    async fn get_orders(&self, account_id: &AccountId) -> TransportResult<Vec<Order>>;

    async fn get_order(&self, account_id: &AccountId, order_id: &str) -> TransportResult<Order>;

    async fn get_history_orders_by_ticket(
        &self,
        account_id: &AccountId,
        ticket: &str,
    ) -> TransportResult<HistoryOrders>;

    async fn get_history_orders_by_position(
        &self,
        account_id: &AccountId,
        position_id: &str,
    ) -> TransportResult<HistoryOrders>;

    async fn get_history_orders_by_time_range(
        &self,
        account_id: &AccountId,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        offset: u32,
        limit: u32,
    ) -> TransportResult<HistoryOrders>;

    async fn get_deals_by_ticket(&self, account_id: &AccountId, ticket: &str)
    -> TransportResult<Deals>;

    async fn get_deals_by_position(
        &self,
        account_id: &AccountId,
        position_id: &str,
    ) -> TransportResult<Deals>;

    async fn get_deals_by_time_range(
        &self,
        account_id: &AccountId,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        offset: u32,
        limit: u32,
    ) -> TransportResult<Deals>;

    async fn get_symbol_specification(
        &self,
        account_id: &AccountId,
        symbol: &str,
    ) -> TransportResult<SymbolSpecification>;

    async fn get_symbol_price(
        &self,
        account_id: &AccountId,
        symbol: &str,
        keep_subscription: bool,
    ) -> TransportResult<SymbolPrice>;

    async fn get_server_time(&self, account_id: &AccountId) -> TransportResult<ServerTime>;
}
