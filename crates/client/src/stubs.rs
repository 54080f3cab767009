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

//! Recording transport and fixture functions for testing connections without a server.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use ahash::AHashMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rstest::fixture;
use termsync_common::MUTEX_POISONED;
use termsync_network::probe::ProbeError;
use tokio::sync::Notify;
use ustr::Ustr;

use crate::{
    error::{TransportError, TransportResult},
    identifiers::{AccountId, InstanceKey},
    latency::LatencyProbe,
    listener::{ReconnectListener, SynchronizationListener},
    model::{
        AccountInformation, AccountTopology, Deals, HistoryOrders, MarketDataSubscription,
        MarketDataUnsubscription, Order, Position, Reliability, ServerTime, SymbolPrice,
        SymbolSpecification, SymbolSubscriptions, UrlSettings,
    },
    terminal_state::TerminalState,
    transport::{SynchronizeRequest, TerminalTransport},
};

/// Everything a [`MockTransport`] was asked to do.
#[derive(Debug, Default)]
pub struct MockTransportState {
    pub subscribes: Vec<(AccountId, u32)>,
    pub unsubscribes: Vec<AccountId>,
    pub region_unsubscribes: Vec<(AccountId, Ustr)>,
    pub synchronize_requests: Vec<SynchronizeRequest>,
    pub market_data_subscribes: Vec<(AccountId, Ustr, Vec<MarketDataSubscription>)>,
    pub market_data_unsubscribes: Vec<(AccountId, Ustr, Vec<MarketDataUnsubscription>)>,
    pub subscription_refreshes: Vec<(AccountId, u32, Vec<SymbolSubscriptions>)>,
    pub wait_synchronized_calls: Vec<(AccountId, Option<u32>, String)>,
    pub removed_applications: Vec<AccountId>,
    pub synchronization_listeners: Vec<(AccountId, Arc<dyn SynchronizationListener>)>,
    pub reconnect_listeners: Vec<(AccountId, Arc<dyn ReconnectListener>)>,
    pub account_caches: IndexMap<AccountId, IndexMap<Ustr, AccountId>>,
    pub synchronize_failures: u32,
    pub wait_synchronized_failures: u32,
    pub unsubscribe_gate: Option<Arc<Notify>>,
    pub positions: Vec<Position>,
    pub orders: Vec<Order>,
    pub specifications: AHashMap<Ustr, SymbolSpecification>,
    pub prices: AHashMap<Ustr, SymbolPrice>,
}

/// A [`TerminalTransport`] which records every call and answers queries from canned data.
#[derive(Debug, Default)]
pub struct MockTransport {
    state: Mutex<MockTransportState>,
}

impl MockTransport {
    /// Creates a new [`MockTransport`] instance.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Runs `f` with the recorded state locked.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut MockTransportState) -> R) -> R {
        f(&mut self.state.lock().expect(MUTEX_POISONED))
    }

    /// Makes the next `count` synchronize requests fail with a connection error.
    pub fn fail_synchronize(&self, count: u32) {
        self.with_state(|state| state.synchronize_failures = count);
    }

    /// Suspends every unsubscribe after it is recorded until the returned gate is notified.
    pub fn hold_unsubscribes(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.with_state(|state| state.unsubscribe_gate = Some(gate.clone()));
        gate
    }

    /// Makes the next `count` server-side waits fail with a timeout.
    pub fn fail_wait_synchronized(&self, count: u32) {
        self.with_state(|state| state.wait_synchronized_failures = count);
    }

    #[must_use]
    pub fn subscribes(&self) -> Vec<(AccountId, u32)> {
        self.with_state(|state| state.subscribes.clone())
    }

    #[must_use]
    pub fn unsubscribes(&self) -> Vec<AccountId> {
        self.with_state(|state| state.unsubscribes.clone())
    }

    #[must_use]
    pub fn region_unsubscribes(&self) -> Vec<(AccountId, Ustr)> {
        self.with_state(|state| state.region_unsubscribes.clone())
    }

    #[must_use]
    pub fn synchronize_requests(&self) -> Vec<SynchronizeRequest> {
        self.with_state(|state| state.synchronize_requests.clone())
    }

    #[must_use]
    pub fn subscription_refreshes(&self) -> Vec<(AccountId, u32, Vec<SymbolSubscriptions>)> {
        self.with_state(|state| state.subscription_refreshes.clone())
    }

    /// Synchronization listeners registered for `account_id`, in registration order.
    #[must_use]
    pub fn synchronization_listeners(
        &self,
        account_id: &AccountId,
    ) -> Vec<Arc<dyn SynchronizationListener>> {
        self.with_state(|state| {
            state
                .synchronization_listeners
                .iter()
                .filter(|(id, _)| id == account_id)
                .map(|(_, listener)| listener.clone())
                .collect()
        })
    }

    #[must_use]
    pub fn reconnect_listeners(&self, account_id: &AccountId) -> Vec<Arc<dyn ReconnectListener>> {
        self.with_state(|state| {
            state
                .reconnect_listeners
                .iter()
                .filter(|(id, _)| id == account_id)
                .map(|(_, listener)| listener.clone())
                .collect()
        })
    }
}

#[async_trait]
impl TerminalTransport for MockTransport {
    async fn ensure_subscribe(&self, account_id: &AccountId, instance_number: u32) {
        self.with_state(|state| state.subscribes.push((*account_id, instance_number)));
    }

    async fn unsubscribe(&self, account_id: &AccountId) -> TransportResult<()> {
        let gate = self.with_state(|state| {
            state.unsubscribes.push(*account_id);
            state.unsubscribe_gate.clone()
        });
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(())
    }

    async fn unsubscribe_account_region(&self, account_id: &AccountId, region: Ustr) {
        self.with_state(|state| state.region_unsubscribes.push((*account_id, region)));
    }

    async fn synchronize(
        &self,
        request: SynchronizeRequest,
        _terminal_state: &TerminalState,
    ) -> TransportResult<()> {
        self.with_state(|state| {
            state.synchronize_requests.push(request);
            if state.synchronize_failures > 0 {
                state.synchronize_failures -= 1;
                return Err(TransportError::Connection("synchronize failed".to_string()));
            }
            Ok(())
        })
    }

    async fn subscribe_to_market_data(
        &self,
        account_id: &AccountId,
        symbol: Ustr,
        subscriptions: &[MarketDataSubscription],
        _reliability: Reliability,
    ) -> TransportResult<()> {
        self.with_state(|state| {
            state
                .market_data_subscribes
                .push((*account_id, symbol, subscriptions.to_vec()));
        });
        Ok(())
    }

    async fn unsubscribe_from_market_data(
        &self,
        account_id: &AccountId,
        symbol: Ustr,
        unsubscriptions: &[MarketDataUnsubscription],
        _reliability: Reliability,
    ) -> TransportResult<()> {
        self.with_state(|state| {
            state
                .market_data_unsubscribes
                .push((*account_id, symbol, unsubscriptions.to_vec()));
        });
        Ok(())
    }

    async fn refresh_market_data_subscriptions(
        &self,
        account_id: &AccountId,
        instance_number: u32,
        subscriptions: &[SymbolSubscriptions],
    ) -> TransportResult<()> {
        self.with_state(|state| {
            state.subscription_refreshes.push((
                *account_id,
                instance_number,
                subscriptions.to_vec(),
            ));
        });
        Ok(())
    }

    async fn wait_synchronized(
        &self,
        account_id: &AccountId,
        instance_number: Option<u32>,
        application_pattern: &str,
        timeout: Duration,
    ) -> TransportResult<()> {
        self.with_state(|state| {
            state.wait_synchronized_calls.push((
                *account_id,
                instance_number,
                application_pattern.to_string(),
            ));
            if state.wait_synchronized_failures > 0 {
                state.wait_synchronized_failures -= 1;
                return Err(TransportError::Timeout(format!(
                    "Server-side wait timed out after {timeout:?}"
                )));
            }
            Ok(())
        })
    }

    async fn remove_application(&self, account_id: &AccountId) -> TransportResult<()> {
        self.with_state(|state| state.removed_applications.push(*account_id));
        Ok(())
    }

    async fn url_settings(
        &self,
        _instance_number: u32,
        region: Ustr,
    ) -> TransportResult<UrlSettings> {
        Ok(UrlSettings {
            url: format!("https://mt-client-api-v1.{region}.agiliumtrade.ai"),
            is_shared_client_api: true,
        })
    }

    fn auth_token(&self) -> String {
        "token".to_string()
    }

    fn add_synchronization_listener(
        &self,
        account_id: &AccountId,
        listener: Arc<dyn SynchronizationListener>,
    ) {
        self.with_state(|state| {
            state
                .synchronization_listeners
                .push((*account_id, listener));
        });
    }

    fn remove_synchronization_listener(
        &self,
        account_id: &AccountId,
        listener: &Arc<dyn SynchronizationListener>,
    ) {
        self.with_state(|state| {
            state.synchronization_listeners.retain(|(id, existing)| {
                id != account_id || !std::ptr::addr_eq(Arc::as_ptr(existing), Arc::as_ptr(listener))
            });
        });
    }

    fn add_reconnect_listener(&self, listener: Arc<dyn ReconnectListener>, account_id: &AccountId) {
        self.with_state(|state| state.reconnect_listeners.push((*account_id, listener)));
    }

    fn remove_reconnect_listener(&self, listener: &Arc<dyn ReconnectListener>) {
        self.with_state(|state| {
            state.reconnect_listeners.retain(|(_, existing)| {
                !std::ptr::addr_eq(Arc::as_ptr(existing), Arc::as_ptr(listener))
            });
        });
    }

    fn add_account_cache(&self, account_id: &AccountId, replicas: &IndexMap<Ustr, AccountId>) {
        self.with_state(|state| {
            state.account_caches.insert(*account_id, replicas.clone());
        });
    }

    fn remove_account_cache(&self, account_id: &AccountId) {
        self.with_state(|state| {
            state.account_caches.shift_remove(account_id);
        });
    }

    fn account_replicas(&self, account_id: &AccountId) -> IndexMap<Ustr, AccountId> {
        self.with_state(|state| {
            state
                .account_caches
                .get(account_id)
                .cloned()
                .unwrap_or_default()
        })
    }

    fn primary_account_id(&self, replica_id: &AccountId) -> Option<AccountId> {
        self.with_state(|state| {
            state
                .account_caches
                .iter()
                .find(|(_, replicas)| replicas.values().any(|id| id == replica_id))
                .map(|(account_id, _)| *account_id)
        })
    }

    fn account_region(&self, replica_id: &AccountId) -> Option<Ustr> {
        self.with_state(|state| {
            state.account_caches.values().find_map(|replicas| {
                replicas
                    .iter()
                    .find_map(|(region, id)| (id == replica_id).then_some(*region))
            })
        })
    }

    async fn get_account_information(
        &self,
        _account_id: &AccountId,
    ) -> TransportResult<AccountInformation> {
        Ok(AccountInformation {
            balance: 1_000.0,
            equity: 1_000.0,
            ..AccountInformation::default()
        })
    }

    async fn get_positions(&self, _account_id: &AccountId) -> TransportResult<Vec<Position>> {
        Ok(self.with_state(|state| state.positions.clone()))
    }

    async fn get_position(
        &self,
        _account_id: &AccountId,
        position_id: &str,
    ) -> TransportResult<Position> {
        self.with_state(|state| {
            state
                .positions
                .iter()
                .find(|position| position.id == position_id)
                .cloned()
                .ok_or_else(|| TransportError::NotFound(format!("Position {position_id}")))
        })
    }

    async fn get_orders(&self, _account_id: &AccountId) -> TransportResult<Vec<Order>> {
        Ok(self.with_state(|state| state.orders.clone()))
    }

    async fn get_order(&self, _account_id: &AccountId, order_id: &str) -> TransportResult<Order> {
        self.with_state(|state| {
            state
                .orders
                .iter()
                .find(|order| order.id == order_id)
                .cloned()
                .ok_or_else(|| TransportError::NotFound(format!("Order {order_id}")))
        })
    }

    async fn get_history_orders_by_ticket(
        &self,
        _account_id: &AccountId,
        _ticket: &str,
    ) -> TransportResult<HistoryOrders> {
        Ok(HistoryOrders::default())
    }

    async fn get_history_orders_by_position(
        &self,
        _account_id: &AccountId,
        _position_id: &str,
    ) -> TransportResult<HistoryOrders> {
        Ok(HistoryOrders::default())
    }

    async fn get_history_orders_by_time_range(
        &self,
        _account_id: &AccountId,
        _start_time: DateTime<Utc>,
        _end_time: DateTime<Utc>,
        _offset: u32,
        _limit: u32,
    ) -> TransportResult<HistoryOrders> {
        Ok(HistoryOrders::default())
    }

    async fn get_deals_by_ticket(
        &self,
        _account_id: &AccountId,
        _ticket: &str,
    ) -> TransportResult<Deals> {
        Ok(Deals::default())
    }

    async fn get_deals_by_position(
        &self,
        _account_id: &AccountId,
        _position_id: &str,
    ) -> TransportResult<Deals> {
        Ok(Deals::default())
    }

    async fn get_deals_by_time_range(
        &self,
        _account_id: &AccountId,
        _start_time: DateTime<Utc>,
        _end_time: DateTime<Utc>,
        _offset: u32,
        _limit: u32,
    ) -> TransportResult<Deals> {
        Ok(Deals::default())
    }

    async fn get_symbol_specification(
        &self,
        _account_id: &AccountId,
        symbol: &str,
    ) -> TransportResult<SymbolSpecification> {
        self.with_state(|state| {
            state
                .specifications
                .get(&Ustr::from(symbol))
                .cloned()
                .ok_or_else(|| TransportError::NotFound(format!("Specification {symbol}")))
        })
    }

    async fn get_symbol_price(
        &self,
        _account_id: &AccountId,
        symbol: &str,
        _keep_subscription: bool,
    ) -> TransportResult<SymbolPrice> {
        self.with_state(|state| {
            state
                .prices
                .get(&Ustr::from(symbol))
                .cloned()
                .ok_or_else(|| TransportError::NotFound(format!("Price {symbol}")))
        })
    }

    async fn get_server_time(&self, _account_id: &AccountId) -> TransportResult<ServerTime> {
        Ok(ServerTime {
            time: Utc::now(),
            broker_time: "2024-03-01 14:00:00.000".to_string(),
        })
    }
}

/// A [`LatencyProbe`] answering from a fixed table after an optional delay.
#[derive(Debug, Default)]
pub struct StubLatencyProbe {
    latencies: Mutex<AHashMap<Ustr, Duration>>,
    delay: Duration,
    calls: Mutex<Vec<Ustr>>,
}

impl StubLatencyProbe {
    /// Creates a new [`StubLatencyProbe`] instance from `(region, latency ms)` pairs.
    #[must_use]
    pub fn new(latencies: &[(&str, u64)]) -> Arc<Self> {
        Self::with_delay(latencies, Duration::ZERO)
    }

    /// Creates a probe which takes `delay` to answer.
    #[must_use]
    pub fn with_delay(latencies: &[(&str, u64)], delay: Duration) -> Arc<Self> {
        let latencies = latencies
            .iter()
            .map(|(region, ms)| (Ustr::from(*region), Duration::from_millis(*ms)))
            .collect();
        Arc::new(Self {
            latencies: Mutex::new(latencies),
            delay,
            calls: Mutex::default(),
        })
    }

    pub fn set_latency(&self, region: &str, ms: u64) {
        self.latencies
            .lock()
            .expect(MUTEX_POISONED)
            .insert(Ustr::from(region), Duration::from_millis(ms));
    }

    /// Regions probed so far, one entry per probe.
    #[must_use]
    pub fn calls(&self) -> Vec<Ustr> {
        self.calls.lock().expect(MUTEX_POISONED).clone()
    }
}

#[async_trait]
impl LatencyProbe for StubLatencyProbe {
    async fn probe(&self, region: Ustr) -> Result<Duration, ProbeError> {
        self.calls.lock().expect(MUTEX_POISONED).push(region);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.latencies
            .lock()
            .expect(MUTEX_POISONED)
            .get(&region)
            .copied()
            .ok_or_else(|| ProbeError::Connect {
                url: region.to_string(),
                message: "unreachable".to_string(),
            })
    }
}

/// Returns a forex symbol specification with a 0.00001 tick.
#[must_use]
pub fn symbol_specification(symbol: &str) -> SymbolSpecification {
    SymbolSpecification {
        symbol: Ustr::from(symbol),
        tick_size: 0.00001,
        digits: 5,
        contract_size: Some(100_000.0),
        min_volume: 0.01,
        max_volume: 100.0,
        volume_step: 0.01,
    }
}

#[must_use]
pub fn symbol_price(symbol: &str, bid: f64, ask: f64) -> SymbolPrice {
    SymbolPrice {
        symbol: Ustr::from(symbol),
        bid,
        ask,
        profit_tick_value: 1.0,
        loss_tick_value: 1.0,
        time: Utc::now(),
        broker_time: None,
    }
}

#[fixture]
pub fn mock_transport() -> Arc<MockTransport> {
    MockTransport::new()
}

#[fixture]
pub fn account_topology() -> AccountTopology {
    AccountTopology::new("accountId", "vint-hill").with_replica("accountIdReplica", "new-york")
}

#[fixture]
pub fn instance_key() -> InstanceKey {
    InstanceKey::new("vint-hill", 0, "ps-mpa-1")
}
