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

//! Per-consumer handle on a shared [`StreamingConnection`].

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use termsync_common::MUTEX_POISONED;
use uuid::Uuid;

use super::{StreamingConnection, WaitSynchronizedOptions};
use crate::{
    error::{SyncError, SyncResult},
    history::HistoryStorage,
    identifiers::InstanceKey,
    listener::SynchronizationListener,
    model::{AccountTopology, MarketDataSubscription, MarketDataUnsubscription},
    terminal_state::TerminalState,
    transport::TerminalTransport,
};

/// A consumer's view of a [`StreamingConnection`].
///
/// Each instance holds one reference on the shared connection: the connection closes when its
/// last instance closes. Listeners added through an instance are removed when it closes.
#[derive(Debug)]
pub struct StreamingConnectionInstance {
    id: Uuid,
    connection: Arc<StreamingConnection>,
    transport: Arc<dyn TerminalTransport>,
    listeners: Mutex<Vec<Arc<dyn SynchronizationListener>>>,
    opened: AtomicBool,
    closed: AtomicBool,
}

impl StreamingConnectionInstance {
    /// Creates a new [`StreamingConnectionInstance`] instance with a fresh consumer id.
    #[must_use]
    pub fn new(connection: Arc<StreamingConnection>, transport: Arc<dyn TerminalTransport>) -> Self {
        Self {
            id: Uuid::new_v4(),
            connection,
            transport,
            listeners: Mutex::new(Vec::new()),
            opened: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub const fn connection(&self) -> &Arc<StreamingConnection> {
        &self.connection
    }

    #[must_use]
    pub fn account(&self) -> &AccountTopology {
        self.connection.account()
    }

    #[must_use]
    pub fn terminal_state(&self) -> &Arc<TerminalState> {
        self.connection.terminal_state()
    }

    #[must_use]
    pub fn history_storage(&self) -> &Arc<dyn HistoryStorage> {
        self.connection.history_storage()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Opens the shared connection for this consumer. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Closed`] if this instance was closed, or the error of the shared
    /// connect, in which case this instance is closed as well.
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

    fn check_is_active(&self) -> SyncResult<()> {
        super::check_is_active(self.opened.load(Ordering::Acquire), self.is_closed())
    }

    /// Adds a listener receiving this account's synchronization events until the instance closes.
    pub fn add_synchronization_listener(&self, listener: Arc<dyn SynchronizationListener>) {
        self.transport
            .add_synchronization_listener(&self.account().id, listener.clone());
        self.listeners.lock().expect(MUTEX_POISONED).push(listener);
    }

    pub fn remove_synchronization_listener(&self, listener: &Arc<dyn SynchronizationListener>) {
        self.listeners
            .lock()
            .expect(MUTEX_POISONED)
            .retain(|l| !Arc::ptr_eq(l, listener));
        self.transport
            .remove_synchronization_listener(&self.account().id, listener);
    }

    /// See [`StreamingConnection::subscribe`].
    ///
    /// # Errors
    ///
    /// Returns an error if the instance is not open.
    pub async fn subscribe(&self) -> SyncResult<()> {
        self.check_is_active()?;
        self.connection.subscribe().await
    }

    /// See [`StreamingConnection::wait_synchronized`].
    ///
    /// # Errors
    ///
    /// Returns an error if the instance is not open or synchronization does not complete.
    pub async fn wait_synchronized(&self, options: WaitSynchronizedOptions) -> SyncResult<()> {
        self.check_is_active()?;
        self.connection.wait_synchronized(options).await
    }

    #[must_use]
    pub fn is_synchronized(&self, key: Option<&InstanceKey>, synchronization_id: Option<&str>) -> bool {
        self.connection.is_synchronized(key, synchronization_id)
    }

    #[must_use]
    pub fn synchronized(&self) -> bool {
        self.connection.synchronized()
    }

    /// See [`StreamingConnection::subscribe_to_market_data`].
    ///
    /// # Errors
    ///
    /// Returns an error if the instance is not open or the subscription fails.
    pub async fn subscribe_to_market_data(
        &self,
        symbol: &str,
        subscriptions: Option<Vec<MarketDataSubscription>>,
        timeout: Option<Duration>,
        wait_for_quote: bool,
    ) -> SyncResult<()> {
        self.check_is_active()?;
        self.connection
            .subscribe_to_market_data(symbol, subscriptions, timeout, wait_for_quote)
            .await
    }

    /// See [`StreamingConnection::unsubscribe_from_market_data`].
    ///
    /// # Errors
    ///
    /// Returns an error if the instance is not open or the transport call fails.
    pub async fn unsubscribe_from_market_data(
        &self,
        symbol: &str,
        unsubscriptions: Option<Vec<MarketDataUnsubscription>>,
    ) -> SyncResult<()> {
        self.check_is_active()?;
        self.connection
            .unsubscribe_from_market_data(symbol, unsubscriptions)
            .await
    }

    #[must_use]
    pub fn subscriptions(&self, symbol: &str) -> Option<Vec<MarketDataSubscription>> {
        self.connection.subscriptions(symbol)
    }

    /// See [`StreamingConnection::remove_application`].
    ///
    /// # Errors
    ///
    /// Returns an error if the instance is not open or the removal fails.
    pub async fn remove_application(&self) -> SyncResult<()> {
        self.check_is_active()?;
        self.connection.remove_application().await
    }

    /// Removes this instance's listeners and releases its reference on the shared connection.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let listeners = std::mem::take(&mut *self.listeners.lock().expect(MUTEX_POISONED));
        for listener in &listeners {
            self.transport
                .remove_synchronization_listener(&self.account().id, listener);
        }
        self.connection.close(self.id).await;
    }
}
