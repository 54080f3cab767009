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

//! Integration tests driving a streaming connection through transport events.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use chrono::{TimeZone, Utc};
use rstest::rstest;
use termsync_client::{
    config::ConnectionConfig,
    connection::{StreamingConnectionInstance, WaitSynchronizedOptions},
    error::SyncError,
    identifiers::InstanceKey,
    listener::SynchronizationListener,
    model::{AccountTopology, Deal, Position, PositionSide},
    registry::ConnectionRegistry,
    stubs::{MockTransport, account_topology, instance_key, mock_transport},
};
use termsync_common::testing::wait_until_async;
use tokio::time::Instant;
use ustr::Ustr;

fn position(id: &str) -> Position {
    Position {
        id: id.to_string(),
        symbol: Ustr::from("EURUSD"),
        side: PositionSide::Buy,
        volume: 0.1,
        open_price: 1.1,
        current_price: 1.1,
        current_tick_value: None,
        profit: 0.0,
        unrealized_profit: None,
        time: Utc::now(),
        update_time: None,
    }
}

fn deal(id: &str, second: u32) -> Deal {
    Deal {
        id: id.to_string(),
        symbol: Some(Ustr::from("EURUSD")),
        deal_type: "DEAL_TYPE_BUY".to_string(),
        order_id: None,
        position_id: Some("46214692".to_string()),
        volume: Some(0.1),
        price: Some(1.1),
        profit: 0.0,
        time: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, second).unwrap(),
    }
}

fn listeners(
    transport: &MockTransport,
    account: &AccountTopology,
) -> Vec<Arc<dyn SynchronizationListener>> {
    transport.synchronization_listeners(&account.id)
}

async fn connected_instance(
    transport: &Arc<MockTransport>,
    account: &AccountTopology,
) -> StreamingConnectionInstance {
    let registry = ConnectionRegistry::new(transport.clone(), ConnectionConfig::default());
    let instance = registry.connect_streaming(account, None, None).unwrap();
    instance.connect().await.unwrap();
    instance
}

async fn wait_for_synchronize_requests(transport: &Arc<MockTransport>, count: usize) {
    let transport = transport.clone();
    wait_until_async(
        move || {
            let transport = transport.clone();
            async move { transport.synchronize_requests().len() >= count }
        },
        Duration::from_secs(2),
    )
    .await;
}

/// Delivers a full synchronization for `key` and returns its id.
async fn synchronize(
    transport: &Arc<MockTransport>,
    account: &AccountTopology,
    key: &InstanceKey,
    expected_requests: usize,
    deals: &[Deal],
) -> String {
    for listener in listeners(transport, account) {
        listener.on_connected(key, 2).await;
    }
    wait_for_synchronize_requests(transport, expected_requests).await;
    let synchronization_id = transport.synchronize_requests()[expected_requests - 1]
        .synchronization_id
        .clone();

    for listener in listeners(transport, account) {
        listener
            .on_synchronization_started(key, &synchronization_id)
            .await;
        listener.on_broker_connection_status_changed(key, true).await;
        listener
            .on_positions_replaced(key, &[position("46214692")])
            .await;
        listener.on_pending_orders_replaced(key, &[]).await;
        for deal in deals {
            listener.on_deal_added(key, deal).await;
        }
        listener
            .on_history_orders_synchronized(key, &synchronization_id)
            .await;
        listener.on_deals_synchronized(key, &synchronization_id).await;
    }
    synchronization_id
}

#[rstest]
#[tokio::test]
async fn test_full_synchronization_populates_state(
    mock_transport: Arc<MockTransport>,
    account_topology: AccountTopology,
    instance_key: InstanceKey,
) {
    let instance = connected_instance(&mock_transport, &account_topology).await;

    let synchronization_id = synchronize(
        &mock_transport,
        &account_topology,
        &instance_key,
        1,
        &[deal("1", 10), deal("2", 20)],
    )
    .await;
    instance
        .wait_synchronized(
            WaitSynchronizedOptions::default().with_synchronization_id(&synchronization_id),
        )
        .await
        .unwrap();

    assert!(instance.is_synchronized(Some(&instance_key), Some(&synchronization_id)));
    assert_eq!(instance.terminal_state().positions().len(), 1);
    assert!(instance.terminal_state().is_initialized());
    assert_eq!(instance.history_storage().deals().len(), 2);
    assert!(instance.history_storage().deals_synchronized());
}

#[rstest]
#[tokio::test]
async fn test_reconnect_resumes_from_last_deal(
    mock_transport: Arc<MockTransport>,
    account_topology: AccountTopology,
    instance_key: InstanceKey,
) {
    let instance = connected_instance(&mock_transport, &account_topology).await;
    synchronize(
        &mock_transport,
        &account_topology,
        &instance_key,
        1,
        &[deal("1", 10), deal("2", 20)],
    )
    .await;

    for listener in mock_transport.reconnect_listeners(&account_topology.id) {
        listener
            .on_reconnected(instance_key.region, instance_key.instance_number)
            .await;
    }
    assert!(!instance.synchronized());

    synchronize(&mock_transport, &account_topology, &instance_key, 2, &[]).await;

    let requests = mock_transport.synchronize_requests();
    assert_ne!(requests[0].synchronization_id, requests[1].synchronization_id);
    assert_eq!(
        requests[1].starting_deal_time,
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 20).unwrap()
    );
    assert!(instance.synchronized());
}

#[rstest]
#[tokio::test]
async fn test_reconnect_keeps_other_slot(
    mock_transport: Arc<MockTransport>,
    account_topology: AccountTopology,
) {
    let instance = connected_instance(&mock_transport, &account_topology).await;
    let first = InstanceKey::new("vint-hill", 0, "ps-mpa-1");
    let second = InstanceKey::new("vint-hill", 1, "ps-mpa-1");
    synchronize(&mock_transport, &account_topology, &first, 1, &[]).await;
    synchronize(&mock_transport, &account_topology, &second, 2, &[]).await;

    for listener in mock_transport.reconnect_listeners(&account_topology.id) {
        listener.on_reconnected(Ustr::from("vint-hill"), 0).await;
    }

    assert!(!instance.is_synchronized(Some(&first), None));
    assert!(instance.is_synchronized(Some(&second), None));
}

#[rstest]
#[tokio::test]
async fn test_wait_synchronized_times_out_after_timeout(
    mock_transport: Arc<MockTransport>,
    account_topology: AccountTopology,
) {
    let instance = connected_instance(&mock_transport, &account_topology).await;
    let start = Instant::now();

    let result = instance
        .wait_synchronized(WaitSynchronizedOptions::default().with_timeout(Duration::from_secs(1)))
        .await;

    let elapsed = start.elapsed();
    assert!(matches!(result, Err(SyncError::Timeout(_))));
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_millis(1_500));
}

#[rstest]
#[tokio::test]
async fn test_no_synchronize_after_close(
    mock_transport: Arc<MockTransport>,
    account_topology: AccountTopology,
    instance_key: InstanceKey,
) {
    let instance = connected_instance(&mock_transport, &account_topology).await;
    let listeners = listeners(&mock_transport, &account_topology);

    instance.close().await;
    for listener in &listeners {
        listener.on_connected(&instance_key, 2).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(mock_transport.synchronize_requests().is_empty());
}

#[rstest]
#[tokio::test]
async fn test_instance_listener_receives_events_until_close(
    mock_transport: Arc<MockTransport>,
    account_topology: AccountTopology,
) {
    #[derive(Debug, Default)]
    struct CountingListener(AtomicUsize);

    #[async_trait::async_trait]
    impl SynchronizationListener for CountingListener {
        async fn on_disconnected(&self, _key: &InstanceKey) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    let registry = ConnectionRegistry::new(mock_transport.clone(), ConnectionConfig::default());
    let first = registry
        .connect_streaming(&account_topology, None, None)
        .unwrap();
    let second = registry
        .connect_streaming(&account_topology, None, None)
        .unwrap();
    first.connect().await.unwrap();
    second.connect().await.unwrap();
    let counter = Arc::new(CountingListener::default());
    first.add_synchronization_listener(counter.clone());
    let key = InstanceKey::new("vint-hill", 0, "ps-mpa-1");
    for listener in listeners(&mock_transport, &account_topology) {
        listener.on_disconnected(&key).await;
    }
    assert_eq!(counter.0.load(Ordering::Relaxed), 1);

    first.close().await;
    for listener in listeners(&mock_transport, &account_topology) {
        listener.on_disconnected(&key).await;
    }

    assert_eq!(counter.0.load(Ordering::Relaxed), 1);
    assert_eq!(listeners(&mock_transport, &account_topology).len(), 3);
    assert!(!second.is_closed());
    assert!(!second.connection().is_closed());
}
