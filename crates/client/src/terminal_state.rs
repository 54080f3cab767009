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

//! In-memory mirror of a remote terminal's trading state.
//!
//! Events are applied per [`InstanceKey`]. Account information, positions and orders are
//! read from the freshest instance that is connected to both the server and the broker, while
//! prices and specifications are merged across instances.

use std::{sync::Mutex, time::Duration};

use ahash::AHashMap;
use async_trait::async_trait;
use indexmap::IndexMap;
use termsync_common::MUTEX_POISONED;
use tokio::sync::oneshot;
use ustr::Ustr;

use crate::{
    error::{SyncError, SyncResult},
    identifiers::{AccountId, InstanceKey},
    listener::SynchronizationListener,
    model::{
        AccountInformation, Order, Position, PositionSide, SymbolPrice, SymbolSpecification,
    },
};

#[derive(Debug, Default)]
struct InstanceTerminalState {
    connected: bool,
    connected_to_broker: bool,
    account_information: Option<AccountInformation>,
    positions: IndexMap<String, Position>,
    orders: IndexMap<String, Order>,
    specifications: IndexMap<Ustr, SymbolSpecification>,
    prices: IndexMap<Ustr, SymbolPrice>,
    positions_initialized: bool,
    orders_initialized: bool,
    last_update: u64,
}

impl InstanceTerminalState {
    const fn is_live(&self) -> bool {
        self.connected && self.connected_to_broker
    }
}

#[derive(Debug, Default)]
struct TerminalStateInner {
    states: AHashMap<InstanceKey, InstanceTerminalState>,
    prices: AHashMap<Ustr, SymbolPrice>,
    specifications: IndexMap<Ustr, SymbolSpecification>,
    price_waiters: AHashMap<Ustr, Vec<oneshot::Sender<SymbolPrice>>>,
    sequence: u64,
}

impl TerminalStateInner {
    fn state_mut(&mut self, key: &InstanceKey) -> &mut InstanceTerminalState {
        self.sequence += 1;
        let sequence = self.sequence;
        let state = self.states.entry(*key).or_default();
        state.last_update = sequence;
        state
    }

    fn best_state(&self) -> Option<&InstanceTerminalState> {
        self.states
            .values()
            .filter(|state| state.is_live())
            .max_by_key(|state| state.last_update)
    }
}

/// Local mirror of one account's terminal.
#[derive(Debug)]
pub struct TerminalState {
    account_id: AccountId,
    inner: Mutex<TerminalStateInner>,
}

impl TerminalState {
    /// Creates a new empty [`TerminalState`] for `account_id`.
    #[must_use]
    pub fn new(account_id: AccountId) -> Self {
        Self {
            account_id,
            inner: Mutex::new(TerminalStateInner::default()),
        }
    }

    #[must_use]
    pub const fn account_id(&self) -> AccountId {
        self.account_id
    }

    /// Returns whether any instance is connected to the server.
    #[must_use]
    pub fn connected(&self) -> bool {
        let inner = self.inner.lock().expect(MUTEX_POISONED);
        inner.states.values().any(|state| state.connected)
    }

    /// Returns whether any instance reports the terminal connected to the broker.
    #[must_use]
    pub fn connected_to_broker(&self) -> bool {
        let inner = self.inner.lock().expect(MUTEX_POISONED);
        inner.states.values().any(|state| state.connected_to_broker)
    }

    #[must_use]
    pub fn account_information(&self) -> Option<AccountInformation> {
        let inner = self.inner.lock().expect(MUTEX_POISONED);
        inner
            .best_state()
            .and_then(|state| state.account_information.clone())
    }

    #[must_use]
    pub fn positions(&self) -> Vec<Position> {
        let inner = self.inner.lock().expect(MUTEX_POISONED);
        inner
            .best_state()
            .map(|state| state.positions.values().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn orders(&self) -> Vec<Order> {
        let inner = self.inner.lock().expect(MUTEX_POISONED);
        inner
            .best_state()
            .map(|state| state.orders.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns whether the best instance has received full position and order snapshots.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        let inner = self.inner.lock().expect(MUTEX_POISONED);
        inner
            .best_state()
            .is_some_and(|state| state.positions_initialized && state.orders_initialized)
    }

    #[must_use]
    pub fn specifications(&self) -> Vec<SymbolSpecification> {
        let inner = self.inner.lock().expect(MUTEX_POISONED);
        inner.specifications.values().cloned().collect()
    }

    #[must_use]
    pub fn specification(&self, symbol: &str) -> Option<SymbolSpecification> {
        let inner = self.inner.lock().expect(MUTEX_POISONED);
        inner.specifications.get(&Ustr::from(symbol)).cloned()
    }

    #[must_use]
    pub fn price(&self, symbol: &str) -> Option<SymbolPrice> {
        let inner = self.inner.lock().expect(MUTEX_POISONED);
        inner.prices.get(&Ustr::from(symbol)).cloned()
    }

    /// Waits for the first price of `symbol`, returning immediately if one is known.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Timeout`] if no price arrives within `timeout`.
    pub async fn wait_for_price(&self, symbol: &str, timeout: Duration) -> SyncResult<SymbolPrice> {
        let symbol = Ustr::from(symbol);
        let rx = {
            let mut inner = self.inner.lock().expect(MUTEX_POISONED);
            if let Some(price) = inner.prices.get(&symbol) {
                return Ok(price.clone());
            }
            let (tx, rx) = oneshot::channel();
            let waiters = inner.price_waiters.entry(symbol).or_default();
            waiters.retain(|tx| !tx.is_closed());
            waiters.push(tx);
            rx
        };

        // Receiver must be dropped before pruning so this waiter reads as closed
        let result = tokio::time::timeout(timeout, rx).await;
        match result {
            Ok(Ok(price)) => Ok(price),
            Ok(Err(_)) => Err(SyncError::Stopped(format!(
                "Price wait for {symbol} abandoned"
            ))),
            Err(_) => {
                self.prune_price_waiters(symbol);
                Err(SyncError::wait_timeout(
                    &format!("first price of {symbol} on account {}", self.account_id),
                    timeout,
                ))
            }
        }
    }

    fn prune_price_waiters(&self, symbol: Ustr) {
        let mut inner = self.inner.lock().expect(MUTEX_POISONED);
        if let Some(waiters) = inner.price_waiters.get_mut(&symbol) {
            waiters.retain(|tx| !tx.is_closed());
            if waiters.is_empty() {
                inner.price_waiters.remove(&symbol);
            }
        }
    }

    #[cfg(test)]
    fn price_waiter_count(&self, symbol: &str) -> usize {
        let inner = self.inner.lock().expect(MUTEX_POISONED);
        inner
            .price_waiters
            .get(&Ustr::from(symbol))
            .map_or(0, Vec::len)
    }

    fn apply_price(inner: &mut TerminalStateInner, key: &InstanceKey, price: &SymbolPrice) {
        let specification = inner.specifications.get(&price.symbol).cloned();
        let state = inner.state_mut(key);

        for position in state
            .positions
            .values_mut()
            .filter(|p| p.symbol == price.symbol)
        {
            update_position_price(position, price, specification.as_ref());
        }
        for order in state
            .orders
            .values_mut()
            .filter(|o| o.symbol == price.symbol)
        {
            order.current_price = Some(if order.order_type.is_buy() {
                price.ask
            } else {
                price.bid
            });
        }
        state.prices.insert(price.symbol, price.clone());

        let is_newer = inner
            .prices
            .get(&price.symbol)
            .is_none_or(|existing| existing.time <= price.time);
        if is_newer {
            inner.prices.insert(price.symbol, price.clone());
        }

        if let Some(waiters) = inner.price_waiters.remove(&price.symbol) {
            for waiter in waiters {
                let _ = waiter.send(price.clone());
            }
        }
    }
}

fn update_position_price(
    position: &mut Position,
    price: &SymbolPrice,
    specification: Option<&SymbolSpecification>,
) {
    let (current_price, direction) = match position.side {
        PositionSide::Buy => (price.bid, 1.0),
        PositionSide::Sell => (price.ask, -1.0),
    };
    let price_change = (current_price - position.open_price) * direction;
    let tick_value = if price_change >= 0.0 {
        price.profit_tick_value
    } else {
        price.loss_tick_value
    };

    position.current_price = current_price;
    position.current_tick_value = Some(tick_value);

    if let Some(specification) = specification.filter(|s| s.tick_size > 0.0) {
        position.unrealized_profit =
            Some(price_change * tick_value * position.volume / specification.tick_size);
    }
}

#[async_trait]
impl SynchronizationListener for TerminalState {
    async fn on_connected(&self, key: &InstanceKey, _replicas: u32) {
        let mut inner = self.inner.lock().expect(MUTEX_POISONED);
        inner.state_mut(key).connected = true;
    }

    async fn on_disconnected(&self, key: &InstanceKey) {
        let mut inner = self.inner.lock().expect(MUTEX_POISONED);
        let state = inner.state_mut(key);
        state.connected = false;
        state.connected_to_broker = false;
    }

    async fn on_broker_connection_status_changed(&self, key: &InstanceKey, connected: bool) {
        let mut inner = self.inner.lock().expect(MUTEX_POISONED);
        inner.state_mut(key).connected_to_broker = connected;
    }

    async fn on_synchronization_started(&self, key: &InstanceKey, _synchronization_id: &str) {
        let mut inner = self.inner.lock().expect(MUTEX_POISONED);
        let state = inner.state_mut(key);
        state.positions_initialized = false;
        state.orders_initialized = false;
    }

    async fn on_account_information_updated(
        &self,
        key: &InstanceKey,
        account_information: &AccountInformation,
    ) {
        let mut inner = self.inner.lock().expect(MUTEX_POISONED);
        inner.state_mut(key).account_information = Some(account_information.clone());
    }

    async fn on_positions_replaced(&self, key: &InstanceKey, positions: &[Position]) {
        let mut inner = self.inner.lock().expect(MUTEX_POISONED);
        let state = inner.state_mut(key);
        state.positions = positions
            .iter()
            .map(|p| (p.id.clone(), p.clone()))
            .collect();
        state.positions_initialized = true;
    }

    async fn on_positions_synchronized(&self, key: &InstanceKey, _synchronization_id: &str) {
        let mut inner = self.inner.lock().expect(MUTEX_POISONED);
        inner.state_mut(key).positions_initialized = true;
    }

    async fn on_position_updated(&self, key: &InstanceKey, position: &Position) {
        let mut inner = self.inner.lock().expect(MUTEX_POISONED);
        inner
            .state_mut(key)
            .positions
            .insert(position.id.clone(), position.clone());
    }

    async fn on_position_removed(&self, key: &InstanceKey, position_id: &str) {
        let mut inner = self.inner.lock().expect(MUTEX_POISONED);
        inner.state_mut(key).positions.shift_remove(position_id);
    }

    async fn on_pending_orders_replaced(&self, key: &InstanceKey, orders: &[Order]) {
        let mut inner = self.inner.lock().expect(MUTEX_POISONED);
        let state = inner.state_mut(key);
        state.orders = orders.iter().map(|o| (o.id.clone(), o.clone())).collect();
        state.orders_initialized = true;
    }

    async fn on_pending_orders_synchronized(&self, key: &InstanceKey, _synchronization_id: &str) {
        let mut inner = self.inner.lock().expect(MUTEX_POISONED);
        inner.state_mut(key).orders_initialized = true;
    }

    async fn on_order_updated(&self, key: &InstanceKey, order: &Order) {
        let mut inner = self.inner.lock().expect(MUTEX_POISONED);
        inner
            .state_mut(key)
            .orders
            .insert(order.id.clone(), order.clone());
    }

    async fn on_order_completed(&self, key: &InstanceKey, order_id: &str) {
        let mut inner = self.inner.lock().expect(MUTEX_POISONED);
        inner.state_mut(key).orders.shift_remove(order_id);
    }

    async fn on_symbol_specifications_updated(
        &self,
        key: &InstanceKey,
        specifications: &[SymbolSpecification],
        removed_symbols: &[Ustr],
    ) {
        let mut inner = self.inner.lock().expect(MUTEX_POISONED);
        let state = inner.state_mut(key);
        for specification in specifications {
            state
                .specifications
                .insert(specification.symbol, specification.clone());
        }
        for symbol in removed_symbols {
            state.specifications.shift_remove(symbol);
        }

        for specification in specifications {
            inner
                .specifications
                .insert(specification.symbol, specification.clone());
        }
        for symbol in removed_symbols {
            inner.specifications.shift_remove(symbol);
        }
    }

    async fn on_symbol_price_updated(&self, key: &InstanceKey, price: &SymbolPrice) {
        let mut inner = self.inner.lock().expect(MUTEX_POISONED);
        Self::apply_price(&mut inner, key, price);
    }

    async fn on_stream_closed(&self, key: &InstanceKey) {
        let mut inner = self.inner.lock().expect(MUTEX_POISONED);
        inner.states.remove(key);
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use rstest::{fixture, rstest};

    use super::*;
    use crate::model::OrderType;

    #[fixture]
    fn key() -> InstanceKey {
        InstanceKey::new("vint-hill", 0, "ps-mpa-1")
    }

    #[fixture]
    fn state() -> TerminalState {
        TerminalState::new(AccountId::new("accountId"))
    }

    fn position(id: &str, side: PositionSide) -> Position {
        Position {
            id: id.to_string(),
            symbol: Ustr::from("EURUSD"),
            side,
            volume: 2.0,
            open_price: 1.0,
            current_price: 1.0,
            current_tick_value: None,
            profit: 0.0,
            unrealized_profit: None,
            time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            update_time: None,
        }
    }

    fn price(symbol: &str, bid: f64, ask: f64, second: u32) -> SymbolPrice {
        SymbolPrice {
            symbol: Ustr::from(symbol),
            bid,
            ask,
            profit_tick_value: 1.0,
            loss_tick_value: 2.0,
            time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, second).unwrap(),
            broker_time: None,
        }
    }

    async fn make_live(state: &TerminalState, key: &InstanceKey) {
        state.on_connected(key, 1).await;
        state.on_broker_connection_status_changed(key, true).await;
    }

    #[rstest]
    #[tokio::test]
    async fn test_connection_flags(state: TerminalState, key: InstanceKey) {
        assert!(!state.connected());

        make_live(&state, &key).await;
        assert!(state.connected());
        assert!(state.connected_to_broker());

        state.on_disconnected(&key).await;
        assert!(!state.connected());
        assert!(!state.connected_to_broker());
    }

    #[rstest]
    #[tokio::test]
    async fn test_position_upsert_and_remove(state: TerminalState, key: InstanceKey) {
        make_live(&state, &key).await;
        state
            .on_positions_replaced(&key, &[position("1", PositionSide::Buy)])
            .await;

        let mut updated = position("1", PositionSide::Buy);
        updated.volume = 5.0;
        state.on_position_updated(&key, &updated).await;
        state
            .on_position_updated(&key, &position("2", PositionSide::Sell))
            .await;

        let positions = state.positions();
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0].volume, 5.0);

        state.on_position_removed(&key, "1").await;
        let ids: Vec<String> = state.positions().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["2".to_string()]);
    }

    #[rstest]
    #[tokio::test]
    async fn test_views_hidden_until_broker_connected(state: TerminalState, key: InstanceKey) {
        state.on_connected(&key, 1).await;
        state
            .on_position_updated(&key, &position("1", PositionSide::Buy))
            .await;
        assert!(state.positions().is_empty());

        state.on_broker_connection_status_changed(&key, true).await;
        assert_eq!(state.positions().len(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn test_freshest_instance_wins(state: TerminalState, key: InstanceKey) {
        let other = InstanceKey::new("new-york", 0, "ps-mpa-2");
        make_live(&state, &key).await;
        make_live(&state, &other).await;

        let mut info = AccountInformation {
            balance: 100.0,
            ..AccountInformation::default()
        };
        state.on_account_information_updated(&key, &info).await;
        info.balance = 200.0;
        state.on_account_information_updated(&other, &info).await;

        assert_eq!(state.account_information().unwrap().balance, 200.0);
    }

    #[rstest]
    #[tokio::test]
    async fn test_order_lifecycle(state: TerminalState, key: InstanceKey) {
        make_live(&state, &key).await;
        let order = Order {
            id: "7".to_string(),
            symbol: Ustr::from("EURUSD"),
            order_type: OrderType::BuyLimit,
            volume: 1.0,
            open_price: Some(1.05),
            current_price: None,
            time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        };
        state.on_pending_orders_replaced(&key, &[]).await;
        state.on_order_updated(&key, &order).await;
        state
            .on_symbol_price_updated(&key, &price("EURUSD", 1.1, 1.2, 1))
            .await;

        assert_eq!(state.orders()[0].current_price, Some(1.2));

        state.on_order_completed(&key, "7").await;
        assert!(state.orders().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn test_price_tick_updates_positions(state: TerminalState, key: InstanceKey) {
        make_live(&state, &key).await;
        state
            .on_symbol_specifications_updated(
                &key,
                &[SymbolSpecification {
                    symbol: Ustr::from("EURUSD"),
                    tick_size: 0.5,
                    digits: 5,
                    contract_size: None,
                    min_volume: 0.01,
                    max_volume: 100.0,
                    volume_step: 0.01,
                }],
                &[],
            )
            .await;
        state
            .on_positions_replaced(
                &key,
                &[
                    position("buy", PositionSide::Buy),
                    position("sell", PositionSide::Sell),
                ],
            )
            .await;

        state
            .on_symbol_price_updated(&key, &price("EURUSD", 2.0, 2.5, 1))
            .await;

        let positions = state.positions();
        let buy = &positions[0];
        let sell = &positions[1];
        assert_eq!(buy.current_price, 2.0);
        assert_eq!(buy.current_tick_value, Some(1.0));
        assert_eq!(buy.unrealized_profit, Some(4.0));
        assert_eq!(sell.current_price, 2.5);
        assert_eq!(sell.current_tick_value, Some(2.0));
        assert_eq!(sell.unrealized_profit, Some(-12.0));
    }

    #[rstest]
    #[tokio::test]
    async fn test_price_keeps_latest_tick(state: TerminalState, key: InstanceKey) {
        let other = InstanceKey::new("new-york", 0, "ps-mpa-2");
        state
            .on_symbol_price_updated(&key, &price("EURUSD", 1.2, 1.3, 5))
            .await;
        state
            .on_symbol_price_updated(&other, &price("EURUSD", 1.1, 1.2, 3))
            .await;

        assert_eq!(state.price("EURUSD").unwrap().bid, 1.2);
        assert!(state.price("GBPUSD").is_none());
    }

    #[rstest]
    #[tokio::test]
    async fn test_specifications_removed(state: TerminalState, key: InstanceKey) {
        let spec = SymbolSpecification {
            symbol: Ustr::from("EURUSD"),
            tick_size: 0.00001,
            digits: 5,
            contract_size: Some(100_000.0),
            min_volume: 0.01,
            max_volume: 100.0,
            volume_step: 0.01,
        };
        state
            .on_symbol_specifications_updated(&key, &[spec.clone()], &[])
            .await;
        assert_eq!(state.specification("EURUSD"), Some(spec));

        state
            .on_symbol_specifications_updated(&key, &[], &[Ustr::from("EURUSD")])
            .await;
        assert!(state.specification("EURUSD").is_none());
    }

    #[rstest]
    #[tokio::test]
    async fn test_wait_for_price_resolves_on_tick(key: InstanceKey) {
        let state = Arc::new(TerminalState::new(AccountId::new("accountId")));
        let waiter = {
            let state = state.clone();
            tokio::spawn(async move {
                state
                    .wait_for_price("EURUSD", Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        state
            .on_symbol_prices_updated(&key, &[price("EURUSD", 1.1, 1.2, 1)])
            .await;

        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result.ask, 1.2);
    }

    #[rstest]
    #[tokio::test]
    async fn test_wait_for_price_times_out(state: TerminalState) {
        let result = state
            .wait_for_price("EURUSD", Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(SyncError::Timeout(_))));
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_timed_out_price_waits_are_released(state: TerminalState) {
        for _ in 0..3 {
            let result = state.wait_for_price("NOPE", Duration::from_secs(1)).await;
            assert!(matches!(result, Err(SyncError::Timeout(_))));
        }

        assert_eq!(state.price_waiter_count("NOPE"), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn test_stream_closed_drops_instance(state: TerminalState, key: InstanceKey) {
        make_live(&state, &key).await;
        state
            .on_position_updated(&key, &position("1", PositionSide::Buy))
            .await;

        state.on_stream_closed(&key).await;

        assert!(!state.connected());
        assert!(state.positions().is_empty());
    }
}
