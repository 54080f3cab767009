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

//! Integration tests for latency-based region failover.

use std::{sync::Arc, time::Duration};

use rstest::rstest;
use termsync_client::{
    config::LatencyServiceConfig,
    identifiers::{AccountId, AccountInstanceId, InstanceKey},
    latency::LatencyService,
    model::AccountTopology,
    stubs::{MockTransport, StubLatencyProbe, account_topology, mock_transport},
    transport::TerminalTransport,
};
use termsync_common::testing::wait_until_async;
use ustr::Ustr;

fn instance(account: &AccountTopology, region: &str, instance_number: u32) -> AccountInstanceId {
    AccountInstanceId::new(account.id, InstanceKey::new(region, instance_number, "ps-mpa-1"))
}

fn service(
    transport: &Arc<MockTransport>,
    account: &AccountTopology,
    probe: Arc<StubLatencyProbe>,
) -> Arc<LatencyService> {
    transport.add_account_cache(&account.id, &account.account_regions());
    LatencyService::new(transport.clone(), probe, LatencyServiceConfig::default())
}

async fn wait_for_region_unsubscribes(transport: &Arc<MockTransport>, count: usize) {
    let transport = transport.clone();
    wait_until_async(
        move || {
            let transport = transport.clone();
            async move { transport.region_unsubscribes().len() >= count }
        },
        Duration::from_secs(2),
    )
    .await;
}

#[rstest]
#[case(120, 50, "vint-hill", "accountId")]
#[case(50, 120, "new-york", "accountIdReplica")]
#[tokio::test]
async fn test_slower_region_is_unsubscribed(
    mock_transport: Arc<MockTransport>,
    account_topology: AccountTopology,
    #[case] vint_hill_ms: u64,
    #[case] new_york_ms: u64,
    #[case] slow_region: &str,
    #[case] slow_replica: &str,
) {
    let probe = StubLatencyProbe::new(&[("vint-hill", vint_hill_ms), ("new-york", new_york_ms)]);
    let service = service(&mock_transport, &account_topology, probe);

    service
        .on_connected(instance(&account_topology, "vint-hill", 0))
        .await;
    service
        .on_connected(instance(&account_topology, "new-york", 0))
        .await;
    wait_for_region_unsubscribes(&mock_transport, 1).await;

    assert_eq!(mock_transport.unsubscribes(), vec![AccountId::new(slow_replica)]);
    assert_eq!(
        mock_transport.region_unsubscribes(),
        vec![(account_topology.id, Ustr::from(slow_region))]
    );
}

#[rstest]
#[tokio::test]
async fn test_concurrent_connects_share_one_probe(
    mock_transport: Arc<MockTransport>,
    account_topology: AccountTopology,
) {
    let probe = StubLatencyProbe::with_delay(&[("vint-hill", 50)], Duration::from_millis(100));
    let service = service(&mock_transport, &account_topology, probe.clone());

    tokio::join!(
        service.on_connected(instance(&account_topology, "vint-hill", 0)),
        service.on_connected(instance(&account_topology, "vint-hill", 1)),
    );

    assert_eq!(probe.calls(), vec![Ustr::from("vint-hill")]);
    assert_eq!(service.latency("vint-hill"), Some(Duration::from_millis(50)));
}

#[rstest]
#[tokio::test]
async fn test_refresh_moves_account_to_faster_region(
    mock_transport: Arc<MockTransport>,
    account_topology: AccountTopology,
) {
    let probe = StubLatencyProbe::new(&[("vint-hill", 50), ("new-york", 120)]);
    let service = service(&mock_transport, &account_topology, probe.clone());
    let replica = AccountId::new("accountIdReplica");

    service
        .on_connected(instance(&account_topology, "vint-hill", 0))
        .await;
    service
        .on_connected(instance(&account_topology, "new-york", 0))
        .await;
    wait_for_region_unsubscribes(&mock_transport, 1).await;
    service.on_unsubscribe(&replica);
    assert_eq!(service.active_account_instances(&account_topology.id).len(), 1);

    probe.set_latency("new-york", 10);
    service.refresh_latencies().await;

    assert_eq!(service.latency("new-york"), Some(Duration::from_millis(10)));
    assert_eq!(mock_transport.subscribes(), vec![(replica, 0), (replica, 1)]);
}

#[rstest]
#[tokio::test]
async fn test_wait_connected_instance_resolves_on_connect(
    mock_transport: Arc<MockTransport>,
    account_topology: AccountTopology,
) {
    let probe = StubLatencyProbe::new(&[("vint-hill", 50)]);
    let service = service(&mock_transport, &account_topology, probe);
    let connected = instance(&account_topology, "vint-hill", 1);

    let waiter = {
        let service = service.clone();
        let account_id = account_topology.id;
        tokio::spawn(async move { service.wait_connected_instance(&account_id).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    service.on_connected(connected).await;

    assert_eq!(waiter.await.unwrap(), Ok(connected));
}
