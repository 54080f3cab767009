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

//! Region latency measurement and latency-driven replica failover.
//!
//! The service keeps, per [`LatencyService`] instance, the measured latency of every region it
//! has probed and which account instances are connected or synchronized. Whenever an account
//! ends up with more than one live instance, every region except the fastest is unsubscribed.

use std::{
    fmt::Debug,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use ahash::AHashMap;
use async_trait::async_trait;
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use indexmap::IndexMap;
use termsync_common::MUTEX_POISONED;
use termsync_network::{
    probe::{ProbeError, build_probe_url, probe_connect_latency},
    retry::{RetryConfig, RetryManager},
};
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;
use ustr::Ustr;

use crate::{
    config::LatencyServiceConfig,
    error::{SyncError, SyncResult},
    identifiers::{AccountId, AccountInstanceId},
    transport::TerminalTransport,
};

/// Measures the round-trip time to a region's endpoint.
#[async_trait]
pub trait LatencyProbe: Debug + Send + Sync {
    async fn probe(&self, region: Ustr) -> Result<Duration, ProbeError>;
}

/// Probes a region by opening a websocket to the URL the transport resolves for it.
///
/// Failed handshakes are retried until the probe budget is spent; the reported latency spans
/// every attempt.
#[derive(Debug)]
pub struct WebsocketLatencyProbe {
    transport: Arc<dyn TerminalTransport>,
    config: LatencyServiceConfig,
}

impl WebsocketLatencyProbe {
    /// Creates a new [`WebsocketLatencyProbe`] instance.
    #[must_use]
    pub fn new(transport: Arc<dyn TerminalTransport>, config: LatencyServiceConfig) -> Self {
        Self { transport, config }
    }
}

#[async_trait]
impl LatencyProbe for WebsocketLatencyProbe {
    async fn probe(&self, region: Ustr) -> Result<Duration, ProbeError> {
        let settings = self
            .transport
            .url_settings(0, region)
            .await
            .map_err(|e| ProbeError::Connect {
                url: region.to_string(),
                message: e.to_string(),
            })?;
        let url = build_probe_url(&settings.url, &self.transport.auth_token())?;

        let budget_ms = u64::try_from(self.config.probe_budget().as_millis()).unwrap_or(u64::MAX);
        let retry_manager = RetryManager::<ProbeError>::new(RetryConfig::deadline(budget_ms))
            .map_err(|e| ProbeError::Connect {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        let timeout = self.config.probe_timeout();

        let start = Instant::now();
        retry_manager
            .execute_with_retry(
                &format!("probe {region}"),
                || probe_connect_latency(&url, timeout),
                |e| !matches!(e, ProbeError::InvalidUrl { .. }),
                |message| ProbeError::Connect {
                    url: url.to_string(),
                    message,
                },
            )
            .await?;
        Ok(start.elapsed())
    }
}

type ProbeFuture = Shared<BoxFuture<'static, Result<Duration, ProbeError>>>;

#[derive(Default)]
struct LatencyCaches {
    latencies: IndexMap<Ustr, Duration>,
    connected: IndexMap<AccountInstanceId, bool>,
    synchronized: IndexMap<AccountInstanceId, bool>,
    probes: AHashMap<Ustr, ProbeFuture>,
    connect_waiters: AHashMap<AccountId, watch::Sender<()>>,
}

impl Debug for LatencyCaches {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(LatencyCaches))
            .field("latencies", &self.latencies)
            .field("connected", &self.connected)
            .field("synchronized", &self.synchronized)
            .field("probes", &self.probes.keys().collect::<Vec<_>>())
            .field("connect_waiters", &self.connect_waiters.len())
            .finish()
    }
}

impl LatencyCaches {
    fn account_instances(&self, account_id: &AccountId) -> impl Iterator<Item = &AccountInstanceId> {
        self.connected
            .keys()
            .filter(move |instance| instance.account_id == *account_id)
    }

    fn active_instances(&self, account_id: &AccountId) -> Vec<AccountInstanceId> {
        self.account_instances(account_id)
            .filter(|instance| self.connected.get(*instance).copied().unwrap_or(false))
            .copied()
            .collect()
    }

    fn synchronized_instances(&self, account_id: &AccountId) -> Vec<AccountInstanceId> {
        self.account_instances(account_id)
            .filter(|instance| self.synchronized.get(*instance).copied().unwrap_or(false))
            .copied()
            .collect()
    }

    fn account_regions(&self, account_id: &AccountId) -> Vec<Ustr> {
        let mut regions = Vec::new();
        for instance in self.account_instances(account_id) {
            if !regions.contains(&instance.region()) {
                regions.push(instance.region());
            }
        }
        regions
    }

    fn disconnect_instance(&mut self, instance: &AccountInstanceId) {
        self.connected.insert(*instance, false);
        if let Some(synchronized) = self.synchronized.get_mut(instance) {
            *synchronized = false;
        }
    }

    fn sorted_regions(&self, regions: &[Ustr]) -> Vec<Ustr> {
        let mut known: Vec<(Ustr, Duration)> = self
            .latencies
            .iter()
            .filter(|(region, _)| regions.contains(region))
            .map(|(region, latency)| (*region, *latency))
            .collect();
        known.sort_by_key(|(_, latency)| *latency);
        known.into_iter().map(|(region, _)| region).collect()
    }

    /// Regions to drop so only the fastest region among `instances` stays subscribed.
    fn regions_to_disconnect(&self, instances: &[AccountInstanceId]) -> Vec<Ustr> {
        let regions: Vec<Ustr> = instances.iter().map(AccountInstanceId::region).collect();
        self.sorted_regions(&regions).into_iter().skip(1).collect()
    }
}

/// Tracks region latencies and account instance liveness, and fails accounts over to their
/// fastest region.
#[derive(Debug)]
pub struct LatencyService {
    transport: Arc<dyn TerminalTransport>,
    probe: Arc<dyn LatencyProbe>,
    config: LatencyServiceConfig,
    caches: Mutex<LatencyCaches>,
    cancel_token: CancellationToken,
    self_ref: Weak<Self>,
}

impl LatencyService {
    /// Creates a new [`LatencyService`] instance. Call [`Self::start`] to begin periodic
    /// latency refreshes.
    #[must_use]
    pub fn new(
        transport: Arc<dyn TerminalTransport>,
        probe: Arc<dyn LatencyProbe>,
        config: LatencyServiceConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            transport,
            probe,
            config,
            caches: Mutex::new(LatencyCaches::default()),
            cancel_token: CancellationToken::new(),
            self_ref: self_ref.clone(),
        })
    }

    /// Creates a service probing regions over websockets resolved by `transport`.
    #[must_use]
    pub fn with_websocket_probe(
        transport: Arc<dyn TerminalTransport>,
        config: LatencyServiceConfig,
    ) -> Arc<Self> {
        let probe = Arc::new(WebsocketLatencyProbe::new(transport.clone(), config.clone()));
        Self::new(transport, probe, config)
    }

    /// Spawns the periodic latency refresh job.
    pub fn start(&self) {
        let weak = self.self_ref.clone();
        let cancel_token = self.cancel_token.clone();
        let interval = self.config.refresh_interval();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }

                let Some(service) = weak.upgrade() else {
                    break;
                };
                service.refresh_latencies().await;
            }
            tracing::debug!("Latency refresh job stopped");
        });
    }

    /// Stops the refresh job and clears every cache.
    pub fn stop(&self) {
        self.cancel_token.cancel();
        *self.caches.lock().expect(MUTEX_POISONED) = LatencyCaches::default();
    }

    #[must_use]
    pub fn latency(&self, region: &str) -> Option<Duration> {
        let caches = self.caches.lock().expect(MUTEX_POISONED);
        caches.latencies.get(&Ustr::from(region)).copied()
    }

    /// Returns the given regions with a measured latency, fastest first. Regions with equal
    /// latency keep the order they were first measured in.
    #[must_use]
    pub fn regions_sorted_by_latency(&self, regions: &[Ustr]) -> Vec<Ustr> {
        self.caches
            .lock()
            .expect(MUTEX_POISONED)
            .sorted_regions(regions)
    }

    /// Instances of `account_id` currently connected, in the order they first connected.
    #[must_use]
    pub fn active_account_instances(&self, account_id: &AccountId) -> Vec<AccountInstanceId> {
        self.caches
            .lock()
            .expect(MUTEX_POISONED)
            .active_instances(account_id)
    }

    /// Instances of `account_id` currently synchronized.
    #[must_use]
    pub fn synchronized_account_instances(&self, account_id: &AccountId) -> Vec<AccountInstanceId> {
        self.caches
            .lock()
            .expect(MUTEX_POISONED)
            .synchronized_instances(account_id)
    }

    /// Invoked when an account instance connected.
    pub async fn on_connected(&self, instance: AccountInstanceId) {
        let account_id = instance.account_id;
        let needs_probe = {
            let mut caches = self.caches.lock().expect(MUTEX_POISONED);
            caches.connected.insert(instance, true);
            !caches.latencies.contains_key(&instance.region())
        };
        if needs_probe {
            self.refresh_latency(instance.region()).await;
        }

        let regions_to_disconnect = {
            let mut caches = self.caches.lock().expect(MUTEX_POISONED);
            let active = caches.active_instances(&account_id);
            let regions = if active.len() > 1 && caches.synchronized_instances(&account_id).is_empty()
            {
                caches.regions_to_disconnect(&active)
            } else {
                Vec::new()
            };
            if let Some(waiter) = caches.connect_waiters.remove(&account_id) {
                waiter.send_replace(());
            }
            regions
        };

        for region in regions_to_disconnect {
            self.unsubscribe_region(account_id, region);
        }
    }

    /// Invoked when an account instance finished synchronizing deals.
    pub async fn on_deals_synchronized(&self, instance: AccountInstanceId) {
        let account_id = instance.account_id;
        let needs_probe = {
            let mut caches = self.caches.lock().expect(MUTEX_POISONED);
            caches.synchronized.insert(instance, true);
            !caches.latencies.contains_key(&instance.region())
        };
        if needs_probe {
            self.refresh_latency(instance.region()).await;
        }

        let regions_to_disconnect = {
            let caches = self.caches.lock().expect(MUTEX_POISONED);
            let synchronized = caches.synchronized_instances(&account_id);
            if synchronized.len() > 1 {
                caches.regions_to_disconnect(&synchronized)
            } else {
                Vec::new()
            }
        };

        for region in regions_to_disconnect {
            self.unsubscribe_region(account_id, region);
        }
    }

    /// Invoked when an account instance disconnected. When the account has no connected
    /// instance left, every other region is subscribed so the account can fail over.
    pub async fn on_disconnected(&self, instance: AccountInstanceId) {
        let account_id = instance.account_id;
        let regions = {
            let mut caches = self.caches.lock().expect(MUTEX_POISONED);
            caches.disconnect_instance(&instance);
            if caches.active_instances(&account_id).is_empty() {
                caches.account_regions(&account_id)
            } else {
                Vec::new()
            }
        };

        for region in regions.into_iter().filter(|r| *r != instance.region()) {
            self.subscribe_replica(&account_id, region).await;
        }
    }

    /// Invoked when a replica was unsubscribed; drops the liveness of every instance of the
    /// replica's region.
    pub fn on_unsubscribe(&self, replica_id: &AccountId) {
        let (Some(region), Some(account_id)) = (
            self.transport.account_region(replica_id),
            self.transport.primary_account_id(replica_id),
        ) else {
            tracing::warn!(replica_id = %replica_id, "Unsubscribed replica is not cached");
            return;
        };

        let mut caches = self.caches.lock().expect(MUTEX_POISONED);
        let instances: Vec<AccountInstanceId> = caches
            .account_instances(&account_id)
            .filter(|instance| instance.region() == region)
            .copied()
            .collect();
        for instance in &instances {
            caches.disconnect_instance(instance);
        }
    }

    /// Waits until some instance of `account_id` is connected and returns it. Concurrent
    /// callers for the same account share one wait.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Stopped`] if the service is stopped while waiting.
    pub async fn wait_connected_instance(
        &self,
        account_id: &AccountId,
    ) -> SyncResult<AccountInstanceId> {
        loop {
            if self.cancel_token.is_cancelled() {
                return Err(SyncError::Stopped(format!(
                    "Latency service stopped while waiting for account {account_id}"
                )));
            }

            let mut receiver = {
                let mut caches = self.caches.lock().expect(MUTEX_POISONED);
                if let Some(instance) = caches.active_instances(account_id).first() {
                    return Ok(*instance);
                }
                caches
                    .connect_waiters
                    .entry(*account_id)
                    .or_insert_with(|| watch::channel(()).0)
                    .subscribe()
            };

            tokio::select! {
                _ = receiver.changed() => {}
                () = self.cancel_token.cancelled() => {}
            }
        }
    }

    /// Re-probes every known region and moves accounts with a single live instance to a
    /// faster region when one is available.
    pub async fn refresh_latencies(&self) {
        let regions: Vec<Ustr> = {
            let caches = self.caches.lock().expect(MUTEX_POISONED);
            caches.latencies.keys().copied().collect()
        };
        for region in regions {
            self.refresh_latency(region).await;
        }

        let switches: Vec<(AccountId, Ustr)> = {
            let caches = self.caches.lock().expect(MUTEX_POISONED);
            let mut accounts: Vec<AccountId> = Vec::new();
            for (instance, connected) in &caches.connected {
                if *connected && !accounts.contains(&instance.account_id) {
                    accounts.push(instance.account_id);
                }
            }

            accounts
                .into_iter()
                .filter_map(|account_id| {
                    let active = caches.active_instances(&account_id);
                    let [instance] = active.as_slice() else {
                        return None;
                    };
                    let best = caches
                        .sorted_regions(&caches.account_regions(&account_id))
                        .first()
                        .copied()?;
                    (best != instance.region()).then_some((account_id, best))
                })
                .collect()
        };

        for (account_id, region) in switches {
            tracing::info!(account_id = %account_id, region = %region, "Switching to a faster region");
            self.subscribe_replica(&account_id, region).await;
        }
    }

    /// Measures `region`, sharing one in-flight probe between concurrent callers.
    async fn refresh_latency(&self, region: Ustr) -> Option<Duration> {
        let future = {
            let mut caches = self.caches.lock().expect(MUTEX_POISONED);
            caches
                .probes
                .entry(region)
                .or_insert_with(|| {
                    let probe = self.probe.clone();
                    async move { probe.probe(region).await }.boxed().shared()
                })
                .clone()
        };

        let result = future.clone().await;

        let mut caches = self.caches.lock().expect(MUTEX_POISONED);
        if caches
            .probes
            .get(&region)
            .is_some_and(|current| current.ptr_eq(&future))
        {
            caches.probes.remove(&region);
            match &result {
                Ok(latency) => {
                    tracing::debug!(region = %region, latency = ?latency, "Measured region latency");
                }
                Err(e) => tracing::warn!(region = %region, error = %e, "Failed to measure latency"),
            }
        }

        match result {
            Ok(latency) => {
                caches.latencies.insert(region, latency);
                Some(latency)
            }
            Err(_) => None,
        }
    }

    async fn subscribe_replica(&self, account_id: &AccountId, region: Ustr) {
        let Some(replica_id) = self.transport.account_replicas(account_id).get(&region).copied()
        else {
            tracing::warn!(account_id = %account_id, region = %region, "No replica cached for region");
            return;
        };
        self.transport.ensure_subscribe(&replica_id, 0).await;
        self.transport.ensure_subscribe(&replica_id, 1).await;
    }

    fn unsubscribe_region(&self, account_id: AccountId, region: Ustr) {
        let Some(replica_id) = self.transport.account_replicas(&account_id).get(&region).copied()
        else {
            tracing::warn!(account_id = %account_id, region = %region, "No replica cached for region");
            return;
        };

        tracing::info!(account_id = %account_id, region = %region, "Unsubscribing slower region");
        let transport = self.transport.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.unsubscribe(&replica_id).await {
                tracing::warn!(replica_id = %replica_id, error = %e, "Failed to unsubscribe replica");
            }
            transport.unsubscribe_account_region(&account_id, region).await;
        });
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use rstest::rstest;
    use termsync_common::testing::wait_until_async;

    use super::*;
    use crate::{
        identifiers::InstanceKey,
        model::AccountTopology,
        stubs::{MockTransport, StubLatencyProbe, account_topology, mock_transport},
    };

    fn instance(account: &AccountTopology, region: &str, n: u32) -> AccountInstanceId {
        AccountInstanceId::new(account.id, InstanceKey::new(region, n, "ps-mpa-1"))
    }

    fn service(
        transport: &Arc<MockTransport>,
        account: &AccountTopology,
        probe: Arc<StubLatencyProbe>,
    ) -> Arc<LatencyService> {
        transport.add_account_cache(&account.id, &account.account_regions());
        LatencyService::new(transport.clone(), probe, LatencyServiceConfig::default())
    }

    #[rstest]
    #[tokio::test]
    async fn test_on_connected_probes_unknown_region(
        mock_transport: Arc<MockTransport>,
        account_topology: AccountTopology,
    ) {
        let probe = StubLatencyProbe::new(&[("vint-hill", 50)]);
        let service = service(&mock_transport, &account_topology, probe.clone());

        service
            .on_connected(instance(&account_topology, "vint-hill", 0))
            .await;
        service
            .on_connected(instance(&account_topology, "vint-hill", 1))
            .await;

        assert_eq!(service.latency("vint-hill"), Some(Duration::from_millis(50)));
        assert_eq!(probe.calls().len(), 1);
        assert_eq!(service.active_account_instances(&account_topology.id).len(), 2);
        assert!(mock_transport.unsubscribes().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn test_connected_instances_fail_over_to_fastest_region(
        mock_transport: Arc<MockTransport>,
        account_topology: AccountTopology,
    ) {
        let probe = StubLatencyProbe::new(&[("vint-hill", 120), ("new-york", 50)]);
        let service = service(&mock_transport, &account_topology, probe);

        service
            .on_connected(instance(&account_topology, "vint-hill", 0))
            .await;
        service
            .on_connected(instance(&account_topology, "new-york", 0))
            .await;

        let transport = mock_transport.clone();
        wait_until_async(
            move || {
                let transport = transport.clone();
                async move { !transport.region_unsubscribes().is_empty() }
            },
            Duration::from_secs(1),
        )
        .await;

        assert_eq!(mock_transport.unsubscribes(), vec![account_topology.id]);
        assert_eq!(
            mock_transport.region_unsubscribes(),
            vec![(account_topology.id, Ustr::from("vint-hill"))]
        );
    }

    #[rstest]
    #[tokio::test]
    async fn test_no_failover_on_connect_once_synchronized(
        mock_transport: Arc<MockTransport>,
        account_topology: AccountTopology,
    ) {
        let probe = StubLatencyProbe::new(&[("vint-hill", 120), ("new-york", 50)]);
        let service = service(&mock_transport, &account_topology, probe);
        let first = instance(&account_topology, "vint-hill", 0);

        service.on_connected(first).await;
        service.on_deals_synchronized(first).await;
        service
            .on_connected(instance(&account_topology, "new-york", 0))
            .await;
        tokio::task::yield_now().await;

        assert!(mock_transport.unsubscribes().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn test_synchronized_instances_keep_fastest_region(
        mock_transport: Arc<MockTransport>,
        account_topology: AccountTopology,
    ) {
        let probe = StubLatencyProbe::new(&[("vint-hill", 50), ("new-york", 120)]);
        let service = service(&mock_transport, &account_topology, probe);
        let fast = instance(&account_topology, "vint-hill", 0);
        let slow = instance(&account_topology, "new-york", 0);

        service.on_connected(fast).await;
        service.on_deals_synchronized(fast).await;
        service.on_connected(slow).await;
        service.on_deals_synchronized(slow).await;

        let transport = mock_transport.clone();
        wait_until_async(
            move || {
                let transport = transport.clone();
                async move { !transport.region_unsubscribes().is_empty() }
            },
            Duration::from_secs(1),
        )
        .await;

        assert_eq!(
            mock_transport.unsubscribes(),
            vec![AccountId::new("accountIdReplica")]
        );
        assert_eq!(
            mock_transport.region_unsubscribes(),
            vec![(account_topology.id, Ustr::from("new-york"))]
        );
    }

    #[rstest]
    #[tokio::test]
    async fn test_on_disconnected_subscribes_other_regions(
        mock_transport: Arc<MockTransport>,
        account_topology: AccountTopology,
    ) {
        let probe = StubLatencyProbe::new(&[("vint-hill", 50), ("new-york", 120)]);
        let service = service(&mock_transport, &account_topology, probe);
        let fast = instance(&account_topology, "vint-hill", 0);
        let slow = instance(&account_topology, "new-york", 0);
        service.on_connected(fast).await;
        service.on_connected(slow).await;
        service.on_disconnected(slow).await;
        assert!(mock_transport.subscribes().is_empty());

        service.on_disconnected(fast).await;

        let replica = AccountId::new("accountIdReplica");
        assert_eq!(mock_transport.subscribes(), vec![(replica, 0), (replica, 1)]);
        assert!(service.active_account_instances(&account_topology.id).is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn test_on_unsubscribe_disconnects_region_instances(
        mock_transport: Arc<MockTransport>,
        account_topology: AccountTopology,
    ) {
        let probe = StubLatencyProbe::new(&[("vint-hill", 50), ("new-york", 120)]);
        let service = service(&mock_transport, &account_topology, probe);
        let primary = instance(&account_topology, "vint-hill", 0);
        let replica = instance(&account_topology, "new-york", 0);
        service.on_connected(primary).await;
        service.on_deals_synchronized(primary).await;
        service.on_connected(replica).await;

        service.on_unsubscribe(&AccountId::new("accountIdReplica"));

        assert_eq!(service.active_account_instances(&account_topology.id), vec![primary]);
        assert_eq!(
            service.synchronized_account_instances(&account_topology.id),
            vec![primary]
        );
    }

    #[rstest]
    #[tokio::test]
    async fn test_regions_sorted_by_latency_skips_unknown(
        mock_transport: Arc<MockTransport>,
        account_topology: AccountTopology,
    ) {
        let probe = StubLatencyProbe::new(&[("vint-hill", 120), ("new-york", 50)]);
        let service = service(&mock_transport, &account_topology, probe);
        service
            .on_connected(instance(&account_topology, "vint-hill", 0))
            .await;
        service
            .on_connected(instance(&account_topology, "new-york", 1))
            .await;

        let sorted = service.regions_sorted_by_latency(&[
            Ustr::from("vint-hill"),
            Ustr::from("singapore"),
            Ustr::from("new-york"),
        ]);

        assert_eq!(sorted, vec![Ustr::from("new-york"), Ustr::from("vint-hill")]);
    }

    #[rstest]
    #[tokio::test]
    async fn test_concurrent_probes_share_one_request(
        mock_transport: Arc<MockTransport>,
        account_topology: AccountTopology,
    ) {
        let probe = StubLatencyProbe::with_delay(&[("vint-hill", 50)], Duration::from_millis(50));
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
    async fn test_refresh_latencies_switches_to_faster_region(
        mock_transport: Arc<MockTransport>,
        account_topology: AccountTopology,
    ) {
        let probe = StubLatencyProbe::new(&[("vint-hill", 50), ("new-york", 120)]);
        let service = service(&mock_transport, &account_topology, probe.clone());
        let fast = instance(&account_topology, "vint-hill", 0);
        let slow = instance(&account_topology, "new-york", 0);
        service.on_connected(slow).await;
        service.on_connected(fast).await;
        service.on_disconnected(fast).await;

        service.refresh_latencies().await;

        assert_eq!(
            mock_transport.subscribes(),
            vec![(account_topology.id, 0), (account_topology.id, 1)]
        );
    }

    #[rstest]
    #[tokio::test]
    async fn test_wait_connected_instance(
        mock_transport: Arc<MockTransport>,
        account_topology: AccountTopology,
    ) {
        let probe = StubLatencyProbe::new(&[("vint-hill", 50)]);
        let service = service(&mock_transport, &account_topology, probe);
        let connected = instance(&account_topology, "vint-hill", 0);

        let (first, second, ()) = tokio::join!(
            service.wait_connected_instance(&account_topology.id),
            service.wait_connected_instance(&account_topology.id),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                service.on_connected(connected).await;
            },
        );

        assert_eq!(first.unwrap(), connected);
        assert_eq!(second.unwrap(), connected);
    }

    #[rstest]
    #[tokio::test]
    async fn test_stop_clears_caches_and_releases_waiters(
        mock_transport: Arc<MockTransport>,
        account_topology: AccountTopology,
    ) {
        let probe = StubLatencyProbe::new(&[("vint-hill", 50)]);
        let service = service(&mock_transport, &account_topology, probe);
        service.start();
        service
            .on_connected(instance(&account_topology, "vint-hill", 0))
            .await;
        service.stop();

        assert_eq!(service.latency("vint-hill"), None);
        assert!(service.active_account_instances(&account_topology.id).is_empty());
        let result = service
            .wait_connected_instance(&AccountId::new("other"))
            .await;
        assert!(matches!(result, Err(SyncError::Stopped(_))));
    }
}
