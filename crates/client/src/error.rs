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

//! Error types for connection and synchronization operations.

use std::time::Duration;

use thiserror::Error;

/// Result alias for transport calls.
pub type TransportResult<T> = Result<T, TransportError>;

/// Result alias for synchronization operations surfaced to consumers.
pub type SyncResult<T> = Result<T, SyncError>;

/// Error returned by a [`TerminalTransport`](crate::transport::TerminalTransport) call.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The socket for the target region is not connected.
    #[error("Transport not connected: {0}")]
    Connection(String),

    /// The server did not answer in time.
    #[error("Transport request timed out: {0}")]
    Timeout(String),

    /// The server rejected the request.
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// The requested entity does not exist on the server.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The transport has been closed.
    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    /// Returns whether the failure is transient and worth retrying.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }
}

/// Error surfaced by connections, storages and the latency service.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    /// A bounded wait expired.
    #[error("{0}")]
    Timeout(String),

    /// Invalid arguments or topology.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The connection was used before `connect` was called.
    #[error("This connection has not been initialized yet, please invoke connect() first")]
    NotInitialized,

    /// The connection was used after `close` was called.
    #[error("This connection has been closed, please create a new connection")]
    Closed,

    /// A transport call failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A background operation was stopped before it completed.
    #[error("Stopped: {0}")]
    Stopped(String),

    /// History persistence failed.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl SyncError {
    /// Creates a timeout error naming the account being waited on.
    #[must_use]
    pub fn synchronization_timeout(account_id: &str, synchronization_id: Option<&str>) -> Self {
        match synchronization_id {
            Some(id) => Self::Timeout(format!(
                "Timed out waiting for MetaApi to synchronize to MetaTrader account {account_id}, synchronization id {id}"
            )),
            None => Self::Timeout(format!(
                "Timed out waiting for MetaApi to synchronize to MetaTrader account {account_id}"
            )),
        }
    }

    /// Creates a timeout error for a wait of the given duration.
    #[must_use]
    pub fn wait_timeout(what: &str, timeout: Duration) -> Self {
        Self::Timeout(format!("Timed out waiting for {what} after {timeout:?}"))
    }
}

impl From<std::io::Error> for SyncError {
    fn from(error: std::io::Error) -> Self {
        Self::Storage(error.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(error: serde_json::Error) -> Self {
        Self::Storage(error.to_string())
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn test_synchronization_timeout_message() {
        let error = SyncError::synchronization_timeout("accountId", None);
        assert_eq!(
            error.to_string(),
            "Timed out waiting for MetaApi to synchronize to MetaTrader account accountId"
        );

        let error = SyncError::synchronization_timeout("accountId", Some("ABC"));
        assert!(error.to_string().ends_with("synchronization id ABC"));
    }

    #[rstest]
    #[case(TransportError::Connection("down".into()), true)]
    #[case(TransportError::Timeout("slow".into()), true)]
    #[case(TransportError::Rejected("bad".into()), false)]
    #[case(TransportError::Closed, false)]
    fn test_transport_error_is_transient(#[case] error: TransportError, #[case] expected: bool) {
        assert_eq!(error.is_transient(), expected);
    }

    #[rstest]
    fn test_transport_error_converts_transparently() {
        let error: SyncError = TransportError::NotFound("position".into()).into();
        assert_eq!(error.to_string(), "Not found: position");
    }
}
