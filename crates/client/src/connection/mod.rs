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

//! Shared account connections and the per-consumer handles wrapping them.
//!
//! A connection is created once per account by the
//! [`ConnectionRegistry`](crate::registry::ConnectionRegistry) and shared by every consumer
//! handle. It stays open while at least one handle remains open.

pub mod rpc;
pub mod rpc_instance;
pub mod streaming;
pub mod streaming_instance;

use indexmap::IndexMap;
use ustr::Ustr;

pub use self::{
    rpc::RpcConnection,
    rpc_instance::RpcConnectionInstance,
    streaming::{StreamingConnection, WaitSynchronizedOptions},
    streaming_instance::StreamingConnectionInstance,
};
use crate::{
    error::{SyncError, SyncResult},
    identifiers::AccountId,
    transport::TerminalTransport,
};

/// Instance slots subscribed for every account replica.
pub const INSTANCE_SLOTS: [u32; 2] = [0, 1];

pub(crate) fn check_is_active(opened: bool, closed: bool) -> SyncResult<()> {
    if !opened {
        return Err(SyncError::NotInitialized);
    }
    if closed {
        return Err(SyncError::Closed);
    }
    Ok(())
}

/// Subscribes every replica of an account on every instance slot.
pub(crate) async fn subscribe_replicas(
    transport: &dyn TerminalTransport,
    account_regions: &IndexMap<Ustr, AccountId>,
) {
    for replica_id in account_regions.values() {
        for instance_number in INSTANCE_SLOTS {
            transport.ensure_subscribe(replica_id, instance_number).await;
        }
    }
}
