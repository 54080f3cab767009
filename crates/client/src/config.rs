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

//! Configuration structures for connections and the latency service.

use std::{path::PathBuf, time::Duration};

use ustr::Ustr;

/// Default application name used in history file names and server-side filtering.
pub const DEFAULT_APPLICATION: &str = "MetaApi";

/// Configuration shared by the streaming and RPC connections of a registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Application name.
    pub application: String,
    /// When set, only accounts deployed in this region may be connected.
    pub region: Option<Ustr>,
    /// Lower bound of the market data subscription refresh interval in seconds.
    pub refresh_subscriptions_min_delay_secs: u64,
    /// Upper bound of the market data subscription refresh interval in seconds.
    pub refresh_subscriptions_max_delay_secs: u64,
    /// Time to wait for deals to synchronize before re-issuing a synchronize request.
    pub synchronization_timeout_secs: u64,
    /// Default timeout for `wait_synchronized`.
    pub wait_synchronized_timeout_secs: u64,
    /// Default poll interval for `wait_synchronized`.
    pub wait_synchronized_interval_ms: u64,
    /// Initial synchronize retry delay.
    pub synchronize_retry_initial_ms: u64,
    /// Maximum synchronize retry delay.
    pub synchronize_retry_max_ms: u64,
    /// Timeout of each server-side wait issued by the RPC connection.
    pub rpc_wait_timeout_secs: u64,
    /// Default time to wait for the first quote after subscribing to market data.
    pub market_data_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            application: DEFAULT_APPLICATION.to_string(),
            region: None,
            refresh_subscriptions_min_delay_secs: 1,
            refresh_subscriptions_max_delay_secs: 600,
            synchronization_timeout_secs: 120,
            wait_synchronized_timeout_secs: 300,
            wait_synchronized_interval_ms: 1_000,
            synchronize_retry_initial_ms: 1_000,
            synchronize_retry_max_ms: 300_000,
            rpc_wait_timeout_secs: 5,
            market_data_timeout_secs: 30,
        }
    }
}

impl ConnectionConfig {
    /// Creates a new configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_application(mut self, application: &str) -> Self {
        self.application = application.to_string();
        self
    }

    #[must_use]
    pub fn with_region(mut self, region: &str) -> Self {
        self.region = Some(Ustr::from(region));
        self
    }

    /// Returns the bounds of the refresh interval, normalized so that `min <= max`.
    #[must_use]
    pub fn refresh_subscriptions_delay(&self) -> (Duration, Duration) {
        let min = self.refresh_subscriptions_min_delay_secs;
        let max = self.refresh_subscriptions_max_delay_secs.max(min);
        (Duration::from_secs(min), Duration::from_secs(max))
    }

    #[must_use]
    pub const fn synchronization_timeout(&self) -> Duration {
        Duration::from_secs(self.synchronization_timeout_secs)
    }

    #[must_use]
    pub const fn wait_synchronized_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_synchronized_timeout_secs)
    }

    #[must_use]
    pub const fn wait_synchronized_interval(&self) -> Duration {
        Duration::from_millis(self.wait_synchronized_interval_ms)
    }

    #[must_use]
    pub const fn rpc_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_wait_timeout_secs)
    }

    #[must_use]
    pub const fn market_data_timeout(&self) -> Duration {
        Duration::from_secs(self.market_data_timeout_secs)
    }
}

/// Configuration for the latency service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LatencyServiceConfig {
    /// Interval between latency refreshes in seconds.
    pub refresh_interval_secs: u64,
    /// Timeout of one probe handshake in seconds.
    pub probe_timeout_secs: u64,
    /// Total time budget for probing one region, including retries, in seconds.
    pub probe_budget_secs: u64,
}

impl Default for LatencyServiceConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 15 * 60,
            probe_timeout_secs: 10,
            probe_budget_secs: 60,
        }
    }
}

impl LatencyServiceConfig {
    /// Creates a new configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    #[must_use]
    pub const fn probe_budget(&self) -> Duration {
        Duration::from_secs(self.probe_budget_secs)
    }
}

/// Configuration for the file-backed history storage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryStorageConfig {
    /// Directory the history files are written to.
    pub root: PathBuf,
    /// Interval between background flushes of modified history in seconds.
    pub flush_interval_secs: u64,
}

impl Default for HistoryStorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".metaapi"),
            flush_interval_secs: 60,
        }
    }
}

impl HistoryStorageConfig {
    /// Creates a new configuration writing below `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}
