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

//! Registry sharing one streaming and one RPC connection per account across consumers.

use std::sync::{Arc, Mutex, Weak};

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use termsync_common::MUTEX_POISONED;

use crate::{
    config::ConnectionConfig,
    connection::{
        RpcConnection, RpcConnectionInstance, StreamingConnection, StreamingConnectionInstance,
    },
    error::{SyncError, SyncResult},
    history::{HistoryStorage, MemoryHistoryStorage},
    identifiers::AccountId,
    model::AccountTopology,
    transport::TerminalTransport,
};

#[derive(Debug, Default)]
struct RegistryInner {
    streaming: AHashMap<AccountId, Arc<StreamingConnection>>,
    rpc: AHashMap<AccountId, Arc<RpcConnection>>,
}

/// Maps each account to at most one [`StreamingConnection`] and one [`RpcConnection`].
///
/// Consumers receive lightweight instance handles. The account is unsubscribed from every
/// region once the last streaming and the last RPC instance have both closed.
#[derive(Debug)]
pub struct ConnectionRegistry {
    transport: Arc<dyn TerminalTransport>,
    config: ConnectionConfig,
    inner: Mutex<RegistryInner>,
    self_ref: Weak<Self>,
}

impl ConnectionRegistry {
    /// Creates a new [`ConnectionRegistry`] instance.
    #[must_use]
    pub fn new(transport: Arc<dyn TerminalTransport>, config: ConnectionConfig) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            transport,
            config,
            inner: Mutex::new(RegistryInner::default()),
            self_ref: self_ref.clone(),
        })
    }

    #[must_use]
    pub fn application(&self) -> &str {
        &self.config.application
    }

    #[must_use]
    pub const fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    fn check_region(&self, account: &AccountTopology) -> SyncResult<()> {
        match self.config.region {
            Some(region) if !account.is_deployed_in(&region) => {
                Err(SyncError::Validation(format!(
                    "Account {} is not on specified region {region}",
                    account.id
                )))
            }
            _ => Ok(()),
        }
    }

    /// Returns a new consumer handle on the account's streaming connection, creating the
    /// connection if none is registered.
    ///
    /// `history_storage` (in-memory when `None`) and `history_start_time` only apply when a new
    /// connection is created.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] if the registry is pinned to a region the account is
    /// not deployed in.
    pub fn connect_streaming(
        &self,
        account: &AccountTopology,
        history_storage: Option<Arc<dyn HistoryStorage>>,
        history_start_time: Option<DateTime<Utc>>,
    ) -> SyncResult<StreamingConnectionInstance> {
        self.check_region(account)?;

        let connection = {
            let mut inner = self.inner.lock().expect(MUTEX_POISONED);
            match inner.streaming.get(&account.id) {
                Some(connection) if !connection.is_closed() => connection.clone(),
                _ => {
                    let history_storage = history_storage
                        .unwrap_or_else(|| Arc::new(MemoryHistoryStorage::new()));
                    let connection = StreamingConnection::new(
                        account.clone(),
                        self.transport.clone(),
                        self.self_ref.clone(),
                        self.config.clone(),
                        history_storage,
                        history_start_time,
                    )?;
                    inner.streaming.insert(account.id, connection.clone());
                    tracing::debug!(account_id = %account.id, "Registered streaming connection");
                    connection
                }
            }
        };

        Ok(StreamingConnectionInstance::new(
            connection,
            self.transport.clone(),
        ))
    }

    /// Returns a new consumer handle on the account's RPC connection, creating the connection
    /// if none is registered.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] if the registry is pinned to a region the account is
    /// not deployed in.
    pub fn connect_rpc(&self, account: &AccountTopology) -> SyncResult<RpcConnectionInstance> {
        self.check_region(account)?;

        let connection = {
            let mut inner = self.inner.lock().expect(MUTEX_POISONED);
            match inner.rpc.get(&account.id) {
                Some(connection) if !connection.is_closed() => connection.clone(),
                _ => {
                    let connection = RpcConnection::new(
                        account.clone(),
                        self.transport.clone(),
                        self.self_ref.clone(),
                        self.config.clone(),
                    );
                    inner.rpc.insert(account.id, connection.clone());
                    tracing::debug!(account_id = %account.id, "Registered RPC connection");
                    connection
                }
            }
        };

        Ok(RpcConnectionInstance::new(connection, self.transport.clone()))
    }

    #[must_use]
    pub fn streaming_connection(&self, account_id: &AccountId) -> Option<Arc<StreamingConnection>> {
        let inner = self.inner.lock().expect(MUTEX_POISONED);
        inner.streaming.get(account_id).cloned()
    }

    #[must_use]
    pub fn rpc_connection(&self, account_id: &AccountId) -> Option<Arc<RpcConnection>> {
        let inner = self.inner.lock().expect(MUTEX_POISONED);
        inner.rpc.get(account_id).cloned()
    }

    /// Drops the account's closed streaming connection, unsubscribing the account when no RPC
    /// connection remains either.
    pub async fn remove_streaming(&self, account: &AccountTopology) {
        let unused = {
            let mut inner = self.inner.lock().expect(MUTEX_POISONED);
            if inner
                .streaming
                .get(&account.id)
                .is_some_and(|connection| connection.is_closed())
            {
                inner.streaming.remove(&account.id);
            }
            inner.is_unused(&account.id)
        };

        if unused {
            self.unsubscribe(account).await;
        }
    }

    /// Drops the account's closed RPC connection, unsubscribing the account when no streaming
    /// connection remains either.
    pub async fn remove_rpc(&self, account: &AccountTopology) {
        let unused = {
            let mut inner = self.inner.lock().expect(MUTEX_POISONED);
            if inner
                .rpc
                .get(&account.id)
                .is_some_and(|connection| connection.is_closed())
            {
                inner.rpc.remove(&account.id);
            }
            inner.is_unused(&account.id)
        };

        if unused {
            self.unsubscribe(account).await;
        }
    }

    /// Forgets both connections of the account without unsubscribing it.
    pub fn remove(&self, account_id: &AccountId) {
        let mut inner = self.inner.lock().expect(MUTEX_POISONED);
        inner.streaming.remove(account_id);
        inner.rpc.remove(account_id);
    }

    async fn unsubscribe(&self, account: &AccountTopology) {
        let account_regions = account.account_regions();
        let results = join_all(
            account_regions
                .values()
                .map(|replica_id| self.transport.unsubscribe(replica_id)),
        )
        .await;

        for (replica_id, result) in account_regions.values().zip(results) {
            if let Err(e) = result {
                tracing::warn!(account_id = %replica_id, error = %e, "Failed to unsubscribe");
            }
        }

        // A connection registered while the unsubscribes were in flight owns the cache now
        let inner = self.inner.lock().expect(MUTEX_POISONED);
        if inner.is_unused(&account.id) {
            self.transport.remove_account_cache(&account.id);
            tracing::info!(account_id = %account.id, "Unsubscribed account");
        } else {
            tracing::debug!(
                account_id = %account.id,
                "Account reconnected during unsubscribe, keeping account cache",
            );
        }
    }
}

impl RegistryInner {
    fn is_unused(&self, account_id: &AccountId) -> bool {
        !self.streaming.contains_key(account_id) && !self.rpc.contains_key(account_id)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;
    use termsync_common::testing::wait_until_async;

    use super::*;
    use crate::stubs::{MockTransport, account_topology, mock_transport};

    fn registry(transport: &Arc<MockTransport>, config: ConnectionConfig) -> Arc<ConnectionRegistry> {
        ConnectionRegistry::new(transport.clone(), config)
    }

    #[rstest]
    #[tokio::test]
    async fn test_streaming_connection_is_shared(
        mock_transport: Arc<MockTransport>,
        account_topology: AccountTopology,
    ) {
        let registry = registry(&mock_transport, ConnectionConfig::default());

        let first = registry
            .connect_streaming(&account_topology, None, None)
            .unwrap();
        let second = registry
            .connect_streaming(&account_topology, None, None)
            .unwrap();

        assert!(Arc::ptr_eq(first.connection(), second.connection()));
        assert_ne!(first.id(), second.id());
        assert!(registry.rpc_connection(&account_topology.id).is_none());
    }

    #[rstest]
    #[tokio::test]
    async fn test_unsubscribes_after_last_streaming_and_rpc_close(
        mock_transport: Arc<MockTransport>,
        account_topology: AccountTopology,
    ) {
        let registry = registry(&mock_transport, ConnectionConfig::default());
        let streaming = registry
            .connect_streaming(&account_topology, None, None)
            .unwrap();
        let rpc = registry.connect_rpc(&account_topology).unwrap();
        streaming.connect().await.unwrap();
        rpc.connect().await.unwrap();

        streaming.close().await;
        assert!(mock_transport.unsubscribes().is_empty());
        assert!(registry.streaming_connection(&account_topology.id).is_none());

        rpc.close().await;
        assert_eq!(
            mock_transport.unsubscribes(),
            vec![
                AccountId::new("accountId"),
                AccountId::new("accountIdReplica"),
            ]
        );
        assert!(
            !mock_transport
                .with_state(|state| state.account_caches.contains_key(&account_topology.id))
        );
    }

    #[rstest]
    #[tokio::test]
    async fn test_closed_connection_is_replaced(
        mock_transport: Arc<MockTransport>,
        account_topology: AccountTopology,
    ) {
        let registry = registry(&mock_transport, ConnectionConfig::default());
        let first = registry
            .connect_streaming(&account_topology, None, None)
            .unwrap();
        first.connect().await.unwrap();
        first.close().await;

        let second = registry
            .connect_streaming(&account_topology, None, None)
            .unwrap();

        assert!(!Arc::ptr_eq(first.connection(), second.connection()));
        second.connect().await.unwrap();
    }

    #[rstest]
    fn test_region_pin_rejects_other_accounts(mock_transport: Arc<MockTransport>) {
        let registry = registry(
            &mock_transport,
            ConnectionConfig::default().with_region("london"),
        );
        let account = AccountTopology::new("accountId", "vint-hill");

        let result = registry.connect_rpc(&account);

        assert_eq!(
            result.unwrap_err(),
            SyncError::Validation("Account accountId is not on specified region london".to_string())
        );
    }

    #[rstest]
    fn test_region_pin_accepts_replica_region(
        mock_transport: Arc<MockTransport>,
        account_topology: AccountTopology,
    ) {
        let registry = registry(
            &mock_transport,
            ConnectionConfig::default().with_region("new-york"),
        );

        assert!(registry.connect_rpc(&account_topology).is_ok());
    }

    #[rstest]
    #[tokio::test]
    async fn test_reconnect_during_unsubscribe_keeps_account_cache(
        mock_transport: Arc<MockTransport>,
        account_topology: AccountTopology,
    ) {
        let registry = registry(&mock_transport, ConnectionConfig::default());
        let first = registry
            .connect_streaming(&account_topology, None, None)
            .unwrap();
        first.connect().await.unwrap();
        let gate = mock_transport.hold_unsubscribes();

        let closing = tokio::spawn(async move { first.close().await });
        let transport = mock_transport.clone();
        wait_until_async(
            move || {
                let transport = transport.clone();
                async move { transport.unsubscribes().len() == 2 }
            },
            Duration::from_secs(2),
        )
        .await;

        let second = registry
            .connect_streaming(&account_topology, None, None)
            .unwrap();
        second.connect().await.unwrap();
        gate.notify_waiters();
        closing.await.unwrap();

        assert!(
            mock_transport
                .with_state(|state| state.account_caches.contains_key(&account_topology.id))
        );
        assert!(registry.streaming_connection(&account_topology.id).is_some());
    }

    #[rstest]
    #[tokio::test]
    async fn test_remove_forgets_without_unsubscribing(
        mock_transport: Arc<MockTransport>,
        account_topology: AccountTopology,
    ) {
        let registry = registry(&mock_transport, ConnectionConfig::default());
        let _instance = registry.connect_rpc(&account_topology).unwrap();

        registry.remove(&account_topology.id);

        assert!(registry.rpc_connection(&account_topology.id).is_none());
        assert!(mock_transport.unsubscribes().is_empty());
    }
}
