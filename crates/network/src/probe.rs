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

//! Round-trip latency probe for a region's websocket endpoint.
//!
//! A probe opens a throwaway websocket connection, measures the wall-clock time until the
//! handshake completes, then closes it.

use std::time::Duration;

use tokio::time::Instant;
use url::Url;

/// Protocol revision requested by probe connections.
pub const PROBE_PROTOCOL_VERSION: &str = "3";

/// Errors raised by a latency probe.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProbeError {
    #[error("Invalid probe URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },
    #[error("Probe to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },
    #[error("Probe to {url} failed: {message}")]
    Connect { url: String, message: String },
}

/// Builds the websocket URL used to probe a region from its REST base URL.
///
/// `http`/`https` schemes are mapped onto `ws`/`wss`, and the auth token and protocol
/// revision are appended as query parameters.
///
/// # Errors
///
/// Returns [`ProbeError::InvalidUrl`] if the base URL cannot be parsed or has an unsupported scheme.
pub fn build_probe_url(base_url: &str, auth_token: &str) -> Result<Url, ProbeError> {
    let invalid = |message: String| ProbeError::InvalidUrl {
        url: base_url.to_string(),
        message,
    };

    let mut url = Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(invalid(format!("unsupported scheme '{other}'"))),
    };
    url.set_scheme(scheme)
        .map_err(|()| invalid(format!("cannot switch scheme to '{scheme}'")))?;
    url.query_pairs_mut()
        .append_pair("auth-token", auth_token)
        .append_pair("protocol", PROBE_PROTOCOL_VERSION);

    Ok(url)
}

/// Connects to `url`, returning the time taken to complete the websocket handshake.
///
/// # Errors
///
/// Returns [`ProbeError::Timeout`] if the handshake does not finish within `timeout`, or
/// [`ProbeError::Connect`] if the connection is refused or the handshake fails.
pub async fn probe_connect_latency(url: &Url, timeout: Duration) -> Result<Duration, ProbeError> {
    let start = Instant::now();

    let connect = tokio_tungstenite::connect_async(url.as_str());
    let (mut stream, _response) = tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| ProbeError::Timeout {
            url: url.to_string(),
            timeout,
        })?
        .map_err(|e| ProbeError::Connect {
            url: url.to_string(),
            message: e.to_string(),
        })?;

    let elapsed = start.elapsed();

    if let Err(e) = stream.close(None).await {
        tracing::debug!(url = %url, error = %e, "Error closing probe connection");
    }

    Ok(elapsed)
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("https://mt-client-api-v1.new-york.example.com", "wss")]
    #[case("http://localhost:8080", "ws")]
    #[case("ws://localhost:8080/ws", "ws")]
    fn test_build_probe_url_maps_scheme(#[case] base: &str, #[case] scheme: &str) {
        let url = build_probe_url(base, "token").unwrap();

        assert_eq!(url.scheme(), scheme);
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("auth-token".to_string(), "token".to_string()),
                ("protocol".to_string(), "3".to_string()),
            ]
        );
    }

    #[rstest]
    #[case("not a url")]
    #[case("ftp://example.com")]
    fn test_build_probe_url_rejects_invalid(#[case] base: &str) {
        assert!(matches!(
            build_probe_url(base, "token"),
            Err(ProbeError::InvalidUrl { .. })
        ));
    }

    #[tokio::test]
    async fn test_probe_refused_connection() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let url = Url::parse(&format!("ws://{addr}")).unwrap();
        let result = probe_connect_latency(&url, Duration::from_secs(2)).await;

        assert!(matches!(result, Err(ProbeError::Connect { .. })));
    }
}
