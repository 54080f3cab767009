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

//! Integration tests for the latency probe against a local websocket server.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Router,
    extract::{
        Query, State,
        ws::{WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use rstest::rstest;
use termsync_network::probe::{ProbeError, build_probe_url, probe_connect_latency};

#[derive(Clone, Default)]
struct TestServerState {
    connection_count: Arc<AtomicUsize>,
    tokens: Arc<tokio::sync::Mutex<Vec<String>>>,
}

#[derive(serde::Deserialize)]
struct ProbeQuery {
    #[serde(rename = "auth-token")]
    auth_token: String,
}

async fn handle_websocket(
    ws: WebSocketUpgrade,
    Query(query): Query<ProbeQuery>,
    State(state): State<TestServerState>,
) -> Response {
    state.tokens.lock().await.push(query.auth_token);
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: TestServerState) {
    state.connection_count.fetch_add(1, Ordering::Relaxed);
    while let Some(Ok(_)) = socket.recv().await {}
}

async fn start_test_server() -> (SocketAddr, TestServerState) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = TestServerState::default();
    let router = Router::new()
        .route("/", get(handle_websocket))
        .with_state(state.clone());

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    (addr, state)
}

#[rstest]
#[tokio::test]
async fn test_probe_measures_handshake() {
    let (addr, state) = start_test_server().await;
    let url = build_probe_url(&format!("http://{addr}/"), "secret").unwrap();

    let latency = probe_connect_latency(&url, Duration::from_secs(5))
        .await
        .unwrap();

    assert!(latency < Duration::from_secs(5));
    assert_eq!(state.connection_count.load(Ordering::Relaxed), 1);
    assert_eq!(*state.tokens.lock().await, vec!["secret".to_string()]);
}

#[rstest]
#[tokio::test]
async fn test_probe_times_out_on_silent_server() {
    // Accepts TCP but never answers the websocket handshake
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let url = build_probe_url(&format!("http://{addr}/"), "secret").unwrap();
    let result = probe_connect_latency(&url, Duration::from_millis(200)).await;

    assert!(matches!(result, Err(ProbeError::Timeout { .. })));
}
