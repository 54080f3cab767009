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

//! Streaming connection keeping a local terminal mirror synchronized for one account.
//!
//! Every backend instance serving the account gets its own synchronization state, keyed by
//! [`InstanceKey`]. An instance goes through subscribe, synchronize and history delivery;
//! a failed synchronize is retried with exponential backoff for as long as the instance stays
//! connected and the connection stays open.

use std::{
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use ahash::{AHashMap, AHashSet};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rand::RngExt;
use regex::Regex;
use termsync_common::MUTEX_POISONED;
use termsync_network::retry::{RetryConfig, RetryManager};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use ustr::Ustr;
use uuid::Uuid;

use super::{check_is_active, subscribe_replicas};
use crate::{
    config::ConnectionConfig,
    error::{SyncError, SyncResult},
    history::HistoryStorage,
    identifiers::{AccountId, InstanceKey},
    listener::{ReconnectListener, SynchronizationListener},
    model::{
        AccountTopology, MarketDataSubscription, MarketDataType, MarketDataUnsubscription,
        SymbolSubscriptions,
    },
    registry::ConnectionRegistry,
    terminal_state::TerminalState,
    transport::{SynchronizeRequest, TerminalTransport},
};

/// Options for [`StreamingConnection::wait_synchronized`].
#[derive(Clone, Debug, Default)]
pub struct WaitSynchronizedOptions {
    /// Only consider this instance.
    pub instance: Option<InstanceKey>,
    /// Only consider history delivered for this synchronization.
    pub synchronization_id: Option<String>,
    /// Regular expression of the server-side applications to wait for.
    pub application_pattern: Option<String>,
    pub timeout: Option<Duration>,
    pub interval: Option<Duration>,
}

impl WaitSynchronizedOptions {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    #[must_use]
    pub fn with_synchronization_id(mut self, synchronization_id: &str) -> Self {
        self.synchronization_id = Some(synchronization_id.to_string());
        self
    }

    #[must_use]
    pub fn with_application_pattern(mut self, pattern: &str) -> Self {
        self.application_pattern = Some(pattern.to_string());
        self
    }
}

fn default_application_pattern(application: &str) -> &'static str {
    if application == "CopyFactory" {
        "CopyFactory.*|RPC"
    } else {
        "RPC"
    }
}

fn random_delay(min: Duration, max: Duration) -> Duration {
    let min_ms = u64::try_from(min.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX).max(min_ms);
    Duration::from_millis(rand::rng().random_range(min_ms..=max_ms))
}

#[derive(Debug, Default)]
struct InstanceSyncState {
    orders_synchronized: AHashSet<String>,
    deals_synchronized: AHashSet<String>,
    synchronize_token: Option<CancellationToken>,
    last_synchronization_id: Option<String>,
    last_disconnected_synchronization_id: Option<String>,
    disconnected: bool,
}

impl InstanceSyncState {
    fn is_synchronized(&self, synchronization_id: Option<&str>) -> bool {
        match synchronization_id {
            Some(id) => {
                self.orders_synchronized.contains(id) && self.deals_synchronized.contains(id)
            }
            None => self
                .orders_synchronized
                .iter()
                .any(|id| self.deals_synchronized.contains(id)),
        }
    }

    fn cancel_synchronization(&mut self) {
        if let Some(token) = self.synchronize_token.take() {
            token.cancel();
        }
    }
}

#[derive(Debug, Default)]
struct StreamingInner {
    opened: bool,
    closed: bool,
    opened_instances: AHashSet<Uuid>,
    states: AHashMap<InstanceKey, InstanceSyncState>,
    subscriptions: IndexMap<Ustr, Vec<MarketDataSubscription>>,
    refresh_jobs: AHashMap<(Ustr, u32), CancellationToken>,
}

impl StreamingInner {
    fn state_mut(&mut self, key: &InstanceKey) -> &mut InstanceSyncState {
        self.states.entry(*key).or_default()
    }

    fn remove_states(&mut self, predicate: impl Fn(&InstanceKey) -> bool) {
        self.states.retain(|key, state| {
            if predicate(key) {
                state.cancel_synchronization();
                false
            } else {
                true
            }
        });
    }

    fn cancel_refresh_jobs(&mut self, predicate: impl Fn(Ustr, u32) -> bool) {
        self.refresh_jobs.retain(|(region, instance_number), token| {
            if predicate(*region, *instance_number) {
                token.cancel();
                false
            } else {
                true
            }
        });
    }
}

/// Keeps a [`TerminalState`] and a [`HistoryStorage`] synchronized with the account's
/// terminal, shared by every [`StreamingConnectionInstance`](super::StreamingConnectionInstance)
/// of the account.
#[derive(Debug)]
pub struct StreamingConnection {
    account: AccountTopology,
    transport: Arc<dyn TerminalTransport>,
    registry: Weak<ConnectionRegistry>,
    config: ConnectionConfig,
    terminal_state: Arc<TerminalState>,
    history_storage: Arc<dyn HistoryStorage>,
    history_start_time: Option<DateTime<Utc>>,
    retry_manager: RetryManager<SyncError>,
    cancel_token: CancellationToken,
    inner: Mutex<StreamingInner>,
    self_ref: Weak<Self>,
}

impl StreamingConnection {
    /// Creates a new [`StreamingConnection`] instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the synchronize retry settings in `config` are inconsistent.
    pub fn new(
        account: AccountTopology,
        transport: Arc<dyn TerminalTransport>,
        registry: Weak<ConnectionRegistry>,
        config: ConnectionConfig,
        history_storage: Arc<dyn HistoryStorage>,
        history_start_time: Option<DateTime<Utc>>,
    ) -> SyncResult<Arc<Self>> {
        let retry_manager = RetryManager::new(RetryConfig::unbounded(
            config.synchronize_retry_initial_ms,
            config.synchronize_retry_max_ms,
        ))
        .map_err(|e| SyncError::Validation(e.to_string()))?;

        Ok(Arc::new_cyclic(|self_ref| Self {
            terminal_state: Arc::new(TerminalState::new(account.id)),
            account,
            transport,
            registry,
            config,
            history_storage,
            history_start_time,
            retry_manager,
            cancel_token: CancellationToken::new(),
            inner: Mutex::new(StreamingInner::default()),
            self_ref: self_ref.clone(),
        }))
    }

    #[must_use]
    pub const fn account(&self) -> &AccountTopology {
        &self.account
    }

    #[must_use]
    pub fn application(&self) -> &str {
        &self.config.application
    }

    #[must_use]
    pub const fn terminal_state(&self) -> &Arc<TerminalState> {
        &self.terminal_state
    }

    #[must_use]
    pub const fn history_storage(&self) -> &Arc<dyn HistoryStorage> {
        &self.history_storage
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect(MUTEX_POISONED).closed
    }

    fn check_is_active(&self) -> SyncResult<()> {
        let inner = self.inner.lock().expect(MUTEX_POISONED);
        check_is_active(inner.opened, inner.closed)
    }

    fn replica_id(&self, region: Ustr) -> SyncResult<AccountId> {
        self.account
            .account_regions()
            .get(&region)
            .copied()
            .ok_or_else(|| {
                SyncError::Validation(format!(
                    "Account {} is not deployed in region {region}",
                    self.account.id
                ))
            })
    }

    /// Opens the connection for the consumer `instance_id`. Only the first call for the
    /// connection subscribes and registers listeners; later calls just record the consumer.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Closed`] if the connection was closed, or the error raised while
    /// opening it, in which case the consumer is released again.
    pub async fn connect(&self, instance_id: Uuid) -> SyncResult<()> {
        let first = {
            let mut inner = self.inner.lock().expect(MUTEX_POISONED);
            if inner.closed {
                return Err(SyncError::Closed);
            }
            inner.opened_instances.insert(instance_id);
            !std::mem::replace(&mut inner.opened, true)
        };
        if !first {
            return Ok(());
        }

        if let Err(e) = self.open().await {
            tracing::error!(account_id = %self.account.id, error = %e, "Failed to open streaming connection");
            self.close(instance_id).await;
            return Err(e);
        }
        Ok(())
    }

    async fn open(&self) -> SyncResult<()> {
        let Some(this) = self.self_ref.upgrade() else {
            return Err(SyncError::Closed);
        };
        let account_id = self.account.id;

        self.history_storage
            .initialize(account_id, &self.config.application)
            .await?;
        self.transport
            .add_account_cache(&account_id, &self.account.account_regions());

        self.transport
            .add_synchronization_listener(&account_id, this.clone());
        self.transport
            .add_synchronization_listener(&account_id, self.terminal_state.clone());
        self.transport
            .add_synchronization_listener(&account_id, self.history_storage.clone());
        self.transport.add_reconnect_listener(this, &account_id);

        self.subscribe().await?;
        tracing::info!(account_id = %account_id, "Opened streaming connection");
        Ok(())
    }

    /// Schedules a subscription of every account replica on both instance slots.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not open.
    pub async fn subscribe(&self) -> SyncResult<()> {
        self.check_is_active()?;
        subscribe_replicas(self.transport.as_ref(), &self.account.account_regions()).await;
        Ok(())
    }

    /// Requests synchronization of `key`, resuming history from the stored watermarks or the
    /// configured history start time, whichever is later.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not open, the key's region is not part of the
    /// account, or the transport rejects the request.
    pub async fn synchronize(&self, key: &InstanceKey) -> SyncResult<()> {
        self.check_is_active()?;
        let replica_id = self.replica_id(key.region)?;

        let start_time = self
            .history_start_time
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let instance = Some(key.instance_number);
        let starting_history_order_time = start_time.max(
            self.history_storage
                .last_history_order_time(instance),
        );
        let starting_deal_time = start_time.max(self.history_storage.last_deal_time(instance));
        let synchronization_id = Uuid::new_v4().simple().to_string();

        {
            let mut inner = self.inner.lock().expect(MUTEX_POISONED);
            inner.state_mut(key).last_synchronization_id = Some(synchronization_id.clone());
        }

        tracing::debug!(
            account_id = %self.account.id,
            instance = %key,
            synchronization_id = %synchronization_id,
            "Synchronizing",
        );
        let request = SynchronizeRequest {
            account_id: replica_id,
            instance_number: key.instance_number,
            host: key.host,
            synchronization_id,
            starting_history_order_time,
            starting_deal_time,
        };
        self.transport
            .synchronize(request, &self.terminal_state)
            .await?;
        Ok(())
    }

    /// Keeps `key` synchronized until `token` is canceled: retries failed requests with
    /// backoff, and re-synchronizes when deals do not arrive within the synchronization
    /// timeout.
    async fn ensure_synchronized(self: Arc<Self>, key: InstanceKey, token: CancellationToken) {
        let this = self.as_ref();
        let key_ref = &key;

        loop {
            let result = this
                .retry_manager
                .execute_with_retry_with_cancel(
                    "synchronize",
                    move || this.synchronize(key_ref),
                    |e| matches!(e, SyncError::Transport(_)),
                    SyncError::Timeout,
                    SyncError::Stopped,
                    &token,
                )
                .await;

            if let Err(e) = result {
                if !token.is_cancelled() {
                    tracing::error!(
                        account_id = %this.account.id,
                        instance = %key,
                        error = %e,
                        "Failed to synchronize",
                    );
                }
                return;
            }

            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(this.config.synchronization_timeout()) => {}
            }

            let pending = {
                let inner = this.inner.lock().expect(MUTEX_POISONED);
                if inner.closed {
                    return;
                }
                inner.states.get(&key).and_then(|state| {
                    state
                        .last_synchronization_id
                        .clone()
                        .filter(|id| !state.deals_synchronized.contains(id))
                })
            };
            let Some(synchronization_id) = pending else {
                return;
            };
            tracing::warn!(
                account_id = %this.account.id,
                instance = %key,
                "Resynchronizing since synchronization {synchronization_id} did not finish in time",
            );
        }
    }

    /// Returns whether history orders and deals were both delivered for the same
    /// synchronization.
    ///
    /// `key` restricts the check to one instance; `synchronization_id` restricts it to one
    /// synchronization, otherwise any completed synchronization counts.
    #[must_use]
    pub fn is_synchronized(&self, key: Option<&InstanceKey>, synchronization_id: Option<&str>) -> bool {
        let inner = self.inner.lock().expect(MUTEX_POISONED);
        inner
            .states
            .iter()
            .filter(|(state_key, _)| key.is_none_or(|key| key == *state_key))
            .any(|(_, state)| state.is_synchronized(synchronization_id))
    }

    /// Returns whether any instance is synchronized.
    #[must_use]
    pub fn synchronized(&self) -> bool {
        self.is_synchronized(None, None)
    }

    /// Waits until the terminal is synchronized locally, then until the server reports the
    /// matching applications synchronized.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Timeout`] if synchronization does not complete in time,
    /// [`SyncError::Validation`] for an invalid application pattern, or the transport error of
    /// the server-side wait.
    pub async fn wait_synchronized(&self, options: WaitSynchronizedOptions) -> SyncResult<()> {
        self.check_is_active()?;
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.config.wait_synchronized_timeout());
        let interval = options
            .interval
            .unwrap_or_else(|| self.config.wait_synchronized_interval());
        let pattern = options.application_pattern.clone().unwrap_or_else(|| {
            default_application_pattern(&self.config.application).to_string()
        });
        // The server matches applications with this pattern, reject it before polling
        Regex::new(&pattern).map_err(|e| {
            SyncError::Validation(format!("Invalid application pattern '{pattern}': {e}"))
        })?;

        let synchronization_id = options.synchronization_id.as_deref();
        let deadline = Instant::now() + timeout;
        let synchronized = loop {
            if self.is_synchronized(options.instance.as_ref(), synchronization_id) {
                break true;
            }
            let now = Instant::now();
            if now >= deadline {
                break false;
            }
            let jitter = random_delay(Duration::ZERO, interval / 10);
            tokio::time::sleep((interval + jitter).min(deadline - now)).await;
        };

        let (key, state_synchronization_id) = {
            let inner = self.inner.lock().expect(MUTEX_POISONED);
            let found = match options.instance {
                Some(key) => inner.states.get_key_value(&key),
                None => inner
                    .states
                    .iter()
                    .filter(|(_, state)| state.is_synchronized(synchronization_id))
                    .min_by_key(|(key, _)| **key),
            };
            match found {
                Some((key, state)) => (
                    Some(*key),
                    state
                        .last_synchronization_id
                        .clone()
                        .or_else(|| state.last_disconnected_synchronization_id.clone()),
                ),
                None => (None, None),
            }
        };

        if !synchronized {
            let id = synchronization_id
                .map(ToString::to_string)
                .or(state_synchronization_id);
            return Err(SyncError::synchronization_timeout(
                self.account.id.as_str(),
                id.as_deref(),
            ));
        }

        let Some(key) = key else {
            return Err(SyncError::synchronization_timeout(
                self.account.id.as_str(),
                synchronization_id,
            ));
        };
        let replica_id = self.replica_id(key.region)?;
        let time_left = deadline.saturating_duration_since(Instant::now());
        self.transport
            .wait_synchronized(&replica_id, Some(key.instance_number), &pattern, time_left)
            .await?;
        Ok(())
    }

    /// Subscribes to market data of `symbol`, merging `subscriptions` (quotes when `None`)
    /// into the desired set, and waits for the first quote when quotes are requested.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] if the symbol has no specification,
    /// [`SyncError::Timeout`] if no quote arrives within `timeout`, or a transport error.
    pub async fn subscribe_to_market_data(
        &self,
        symbol: &str,
        subscriptions: Option<Vec<MarketDataSubscription>>,
        timeout: Option<Duration>,
        wait_for_quote: bool,
    ) -> SyncResult<()> {
        self.check_is_active()?;
        if self.terminal_state.specification(symbol).is_none() {
            return Err(SyncError::Validation(format!(
                "{}: Cannot subscribe to market data for symbol {symbol} because symbol does not exist",
                self.account.id
            )));
        }

        let symbol = Ustr::from(symbol);
        let subscriptions = subscriptions.unwrap_or_else(|| vec![MarketDataSubscription::quotes()]);
        {
            let mut inner = self.inner.lock().expect(MUTEX_POISONED);
            let desired = inner.subscriptions.entry(symbol).or_default();
            for subscription in &subscriptions {
                match desired.iter_mut().find(|s| s.is_same_stream(subscription)) {
                    Some(existing) => *existing = subscription.clone(),
                    None => desired.push(subscription.clone()),
                }
            }
        }

        self.transport
            .subscribe_to_market_data(
                &self.account.id,
                symbol,
                &subscriptions,
                self.account.reliability,
            )
            .await?;

        if wait_for_quote
            && subscriptions
                .iter()
                .any(|s| s.kind == MarketDataType::Quotes)
        {
            let timeout = timeout.unwrap_or_else(|| self.config.market_data_timeout());
            self.terminal_state.wait_for_price(&symbol, timeout).await?;
        }
        Ok(())
    }

    /// Unsubscribes from market data of `symbol`; every stream when `unsubscriptions` is
    /// `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not open or the transport call fails.
    pub async fn unsubscribe_from_market_data(
        &self,
        symbol: &str,
        unsubscriptions: Option<Vec<MarketDataUnsubscription>>,
    ) -> SyncResult<()> {
        self.check_is_active()?;
        let symbol = Ustr::from(symbol);
        {
            let mut inner = self.inner.lock().expect(MUTEX_POISONED);
            match &unsubscriptions {
                None => {
                    inner.subscriptions.shift_remove(&symbol);
                }
                Some(unsubscriptions) => {
                    if let Some(desired) = inner.subscriptions.get_mut(&symbol) {
                        desired.retain(|s| !unsubscriptions.iter().any(|u| u.matches(s)));
                        if desired.is_empty() {
                            inner.subscriptions.shift_remove(&symbol);
                        }
                    }
                }
            }
        }

        self.transport
            .unsubscribe_from_market_data(
                &self.account.id,
                symbol,
                unsubscriptions.as_deref().unwrap_or_default(),
                self.account.reliability,
            )
            .await?;
        Ok(())
    }

    /// Desired market data subscriptions of `symbol`.
    #[must_use]
    pub fn subscriptions(&self, symbol: &str) -> Option<Vec<MarketDataSubscription>> {
        let inner = self.inner.lock().expect(MUTEX_POISONED);
        inner.subscriptions.get(&Ustr::from(symbol)).cloned()
    }

    #[must_use]
    pub fn subscribed_symbols(&self) -> Vec<Ustr> {
        let inner = self.inner.lock().expect(MUTEX_POISONED);
        inner.subscriptions.keys().copied().collect()
    }

    /// Clears the history of this application and removes the application from the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not open, the history cannot be cleared or the
    /// transport call fails.
    pub async fn remove_application(&self) -> SyncResult<()> {
        self.check_is_active()?;
        self.history_storage.clear().await?;
        self.transport.remove_application(&self.account.id).await?;
        Ok(())
    }

    async fn refresh_market_data_subscriptions(&self, key: &InstanceKey) {
        let Ok(replica_id) = self.replica_id(key.region) else {
            return;
        };
        let subscriptions: Vec<SymbolSubscriptions> = {
            let inner = self.inner.lock().expect(MUTEX_POISONED);
            inner
                .subscriptions
                .iter()
                .map(|(symbol, subscriptions)| SymbolSubscriptions {
                    symbol: *symbol,
                    subscriptions: subscriptions.clone(),
                })
                .collect()
        };

        if let Err(e) = self
            .transport
            .refresh_market_data_subscriptions(&replica_id, key.instance_number, &subscriptions)
            .await
        {
            tracing::warn!(
                account_id = %self.account.id,
                instance = %key,
                error = %e,
                "Failed to refresh market data subscriptions",
            );
        }
    }

    fn spawn_refresh_job(&self, key: InstanceKey, token: CancellationToken) {
        let weak = self.self_ref.clone();
        let (min_delay, max_delay) = self.config.refresh_subscriptions_delay();

        tokio::spawn(async move {
            loop {
                let delay = random_delay(min_delay, max_delay);
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }

                let Some(connection) = weak.upgrade() else {
                    break;
                };
                connection.refresh_market_data_subscriptions(&key).await;
            }
        });
    }

    /// Releases the consumer `instance_id`. When no consumer is left, stops every job,
    /// unregisters the listeners and removes the connection from its registry.
    pub async fn close(&self, instance_id: Uuid) {
        {
            let mut inner = self.inner.lock().expect(MUTEX_POISONED);
            if !inner.opened {
                return;
            }
            inner.opened_instances.remove(&instance_id);
            if !inner.opened_instances.is_empty() || inner.closed {
                return;
            }
            inner.closed = true;
            for state in inner.states.values_mut() {
                state.cancel_synchronization();
            }
            inner.cancel_refresh_jobs(|_, _| true);
        }
        self.cancel_token.cancel();

        let account_id = self.account.id;
        if let Some(this) = self.self_ref.upgrade() {
            let listener: Arc<dyn SynchronizationListener> = this.clone();
            self.transport
                .remove_synchronization_listener(&account_id, &listener);
            let reconnect_listener: Arc<dyn ReconnectListener> = this;
            self.transport.remove_reconnect_listener(&reconnect_listener);
        }
        let terminal_state: Arc<dyn SynchronizationListener> = self.terminal_state.clone();
        self.transport
            .remove_synchronization_listener(&account_id, &terminal_state);
        let history_storage: Arc<dyn SynchronizationListener> = self.history_storage.clone();
        self.transport
            .remove_synchronization_listener(&account_id, &history_storage);

        if let Err(e) = self.history_storage.close().await {
            tracing::warn!(account_id = %account_id, error = %e, "Failed to close history storage");
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_streaming(&self.account).await;
        }
        tracing::info!(account_id = %account_id, "Closed streaming connection");
    }
}

#[async_trait]
impl SynchronizationListener for StreamingConnection {
    async fn on_connected(&self, key: &InstanceKey, _replicas: u32) {
        let token = self.cancel_token.child_token();
        {
            let mut inner = self.inner.lock().expect(MUTEX_POISONED);
            if !inner.opened || inner.closed {
                return;
            }
            let state = inner.state_mut(key);
            state.cancel_synchronization();
            state.synchronize_token = Some(token.clone());
            state.disconnected = false;
        }
        tracing::debug!(account_id = %self.account.id, instance = %key, "Connected");

        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(this.ensure_synchronized(*key, token));
    }

    async fn on_disconnected(&self, key: &InstanceKey) {
        let mut inner = self.inner.lock().expect(MUTEX_POISONED);
        let state = inner.state_mut(key);
        state.cancel_synchronization();
        state.last_disconnected_synchronization_id = state.last_synchronization_id.take();
        state.orders_synchronized.clear();
        state.deals_synchronized.clear();
        state.disconnected = true;
        tracing::debug!(account_id = %self.account.id, instance = %key, "Disconnected");
    }

    async fn on_synchronization_started(&self, key: &InstanceKey, _synchronization_id: &str) {
        let token = self.cancel_token.child_token();
        {
            let mut inner = self.inner.lock().expect(MUTEX_POISONED);
            if inner.closed {
                return;
            }
            if let Some(previous) = inner
                .refresh_jobs
                .insert((key.region, key.instance_number), token.clone())
            {
                previous.cancel();
            }
        }

        self.refresh_market_data_subscriptions(key).await;
        self.spawn_refresh_job(*key, token);
    }

    async fn on_history_orders_synchronized(&self, key: &InstanceKey, synchronization_id: &str) {
        let mut inner = self.inner.lock().expect(MUTEX_POISONED);
        inner
            .state_mut(key)
            .orders_synchronized
            .insert(synchronization_id.to_string());
    }

    async fn on_deals_synchronized(&self, key: &InstanceKey, synchronization_id: &str) {
        let mut inner = self.inner.lock().expect(MUTEX_POISONED);
        inner
            .state_mut(key)
            .deals_synchronized
            .insert(synchronization_id.to_string());
    }

    async fn on_subscription_downgraded(
        &self,
        _key: &InstanceKey,
        symbol: Ustr,
        updates: Option<&[MarketDataSubscription]>,
        unsubscriptions: Option<&[MarketDataUnsubscription]>,
    ) {
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };

        if let Some(unsubscriptions) = unsubscriptions.filter(|u| !u.is_empty()) {
            let unsubscriptions = unsubscriptions.to_vec();
            let connection = this.clone();
            tokio::spawn(async move {
                if let Err(e) = connection
                    .unsubscribe_from_market_data(&symbol, Some(unsubscriptions))
                    .await
                {
                    tracing::warn!(symbol = %symbol, error = %e, "Failed to unsubscribe on downgrade");
                }
            });
        }

        if let Some(updates) = updates.filter(|u| !u.is_empty()) {
            let updates = updates.to_vec();
            tokio::spawn(async move {
                if let Err(e) = this
                    .subscribe_to_market_data(&symbol, Some(updates), None, true)
                    .await
                {
                    tracing::warn!(symbol = %symbol, error = %e, "Failed to resubscribe on downgrade");
                }
            });
        }
    }

    async fn on_stream_closed(&self, key: &InstanceKey) {
        let mut inner = self.inner.lock().expect(MUTEX_POISONED);
        inner.remove_states(|state_key| state_key == key);
    }

    async fn on_unsubscribe_region(&self, region: Ustr) {
        let mut inner = self.inner.lock().expect(MUTEX_POISONED);
        inner.cancel_refresh_jobs(|job_region, _| job_region == region);
        inner.remove_states(|key| key.region == region);
    }
}

#[async_trait]
impl ReconnectListener for StreamingConnection {
    async fn on_reconnected(&self, region: Ustr, instance_number: u32) {
        let mut inner = self.inner.lock().expect(MUTEX_POISONED);
        inner.remove_states(|key| key.is_slot(&region, instance_number));
        inner.cancel_refresh_jobs(|job_region, job_instance| {
            job_region == region && job_instance == instance_number
        });
    }
}
