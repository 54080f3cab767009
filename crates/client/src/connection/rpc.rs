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

//! RPC connection tracking which instances are ready to answer account queries.

use std::{
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use ahash::{AHashMap, AHashSet};
use async_trait::async_trait;
use termsync_common::MUTEX_POISONED;
use tokio::time::Instant;
use ustr::Ustr;
use uuid::Uuid;

use super::{check_is_active, subscribe_replicas};
use crate::{
    config::ConnectionConfig,
    error::{SyncError, SyncResult},
    identifiers::InstanceKey,
    listener::{ReconnectListener, SynchronizationListener},
    model::AccountTopology,
    registry::ConnectionRegistry,
    transport::TerminalTransport,
};

const RPC_APPLICATION_PATTERN: &str = "RPC";

#[derive(Debug, Default)]
struct RpcInner {
    opened: bool,
    closed: bool,
    opened_instances: AHashSet<Uuid>,
    states: AHashMap<InstanceKey, bool>,
}

/// Account connection used for request/response queries, shared by every
/// [`RpcConnectionInstance`](super::RpcConnectionInstance) of the account.
#[derive(Debug)]
pub struct RpcConnection {
    account: AccountTopology,
    transport: Arc<dyn TerminalTransport>,
    registry: Weak<ConnectionRegistry>,
    config: ConnectionConfig,
    inner: Mutex<RpcInner>,
    self_ref: Weak<Self>,
}

impl RpcConnection {
    /// Creates a new [`RpcConnection`] instance.
    #[must_use]
    pub fn new(
        account: AccountTopology,
        transport: Arc<dyn TerminalTransport>,
        registry: Weak<ConnectionRegistry>,
        config: ConnectionConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            account,
            transport,
            registry,
            config,
            inner: Mutex::new(RpcInner::default()),
            self_ref: self_ref.clone(),
        })
    }

    #[must_use]
    pub const fn account(&self) -> &AccountTopology {
        &self.account
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect(MUTEX_POISONED).closed
    }

    pub(crate) fn check_is_active(&self) -> SyncResult<()> {
        let inner = self.inner.lock().expect(MUTEX_POISONED);
        check_is_active(inner.opened, inner.closed)
    }

    /// Opens the connection for the consumer `instance_id`; only the first call subscribes.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Closed`] if the connection was closed.
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

        let Some(this) = self.self_ref.upgrade() else {
            return Err(SyncError::Closed);
        };
        let account_id = self.account.id;
        let account_regions = self.account.account_regions();
        self.transport.add_account_cache(&account_id, &account_regions);
        self.transport
            .add_synchronization_listener(&account_id, this.clone());
        self.transport.add_reconnect_listener(this, &account_id);
        subscribe_replicas(self.transport.as_ref(), &account_regions).await;

        tracing::info!(account_id = %account_id, "Opened RPC connection");
        Ok(())
    }

    /// Releases the consumer `instance_id`, closing the connection when none is left.
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
            inner.states.clear();
        }

        let account_id = self.account.id;
        if let Some(this) = self.self_ref.upgrade() {
            let listener: Arc<dyn SynchronizationListener> = this.clone();
            self.transport
                .remove_synchronization_listener(&account_id, &listener);
            let reconnect_listener: Arc<dyn ReconnectListener> = this;
            self.transport.remove_reconnect_listener(&reconnect_listener);
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_rpc(&self.account).await;
        }
        tracing::info!(account_id = %account_id, "Closed RPC connection");
    }

    /// Returns whether any instance is connected and able to serve requests.
    #[must_use]
    pub fn is_synchronized(&self) -> bool {
        let inner = self.inner.lock().expect(MUTEX_POISONED);
        inner.states.values().any(|synchronized| *synchronized)
    }

    /// Waits until an instance is connected, then until the server reports the RPC
    /// application synchronized.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Timeout`] if no instance connects in time, or the last server-side
    /// wait error once the deadline has passed.
    pub async fn wait_synchronized(&self, timeout: Option<Duration>) -> SyncResult<()> {
        self.check_is_active()?;
        let timeout = timeout.unwrap_or_else(|| self.config.wait_synchronized_timeout());
        let interval = self.config.wait_synchronized_interval();
        let deadline = Instant::now() + timeout;

        while !self.is_synchronized() {
            let now = Instant::now();
            if now >= deadline {
                return Err(SyncError::synchronization_timeout(
                    self.account.id.as_str(),
                    None,
                ));
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
        }

        loop {
            match self
                .transport
                .wait_synchronized(
                    &self.account.id,
                    None,
                    RPC_APPLICATION_PATTERN,
                    self.config.rpc_wait_timeout(),
                )
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(e.into());
                    }
                    tracing::debug!(account_id = %self.account.id, error = %e, "RPC application not synchronized yet");
                    tokio::time::sleep(interval.min(deadline - now)).await;
                }
            }
        }
    }
}

#[async_trait]
impl SynchronizationListener for RpcConnection {
    async fn on_connected(&self, key: &InstanceKey, _replicas: u32) {
        let mut inner = self.inner.lock().expect(MUTEX_POISONED);
        inner.states.insert(*key, true);
    }

    async fn on_disconnected(&self, key: &InstanceKey) {
        let mut inner = self.inner.lock().expect(MUTEX_POISONED);
        inner.states.insert(*key, false);
    }

    async fn on_stream_closed(&self, key: &InstanceKey) {
        let mut inner = self.inner.lock().expect(MUTEX_POISONED);
        inner.states.remove(key);
    }
}

#[async_trait]
impl ReconnectListener for RpcConnection {
    async fn on_reconnected(&self, region: Ustr, instance_number: u32) {
        let mut inner = self.inner.lock().expect(MUTEX_POISONED);
        inner
            .states
            .retain(|key, _| !key.is_slot(&region, instance_number));
    }
}
