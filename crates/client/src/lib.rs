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

//! Terminal state synchronization and multi-region connection management.
//!
//! The `termsync-client` crate keeps a local mirror of a trading terminal up to date over a
//! streaming transport, for accounts deployed across several regions:
//!
//! - [`registry`]: shares one streaming and one RPC connection per account across consumers.
//! - [`connection`]: the streaming synchronization state machine and the RPC connection.
//! - [`terminal_state`]: the local mirror of positions, orders, specifications and prices.
//! - [`history`]: in-memory and file-backed history order and deal storage.
//! - [`latency`]: region latency measurement and failover to the fastest region.
//!
//! The websocket multiplexer itself is a collaborator behind [`transport::TerminalTransport`].
//!
//! # Feature flags
//!
//! - `stubs`: enables a recording mock transport and test fixtures.

#![deny(unsafe_code)]
#![deny(nonstandard_style)]
#![deny(missing_debug_implementations)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod connection;
pub mod error;
pub mod history;
pub mod identifiers;
pub mod latency;
pub mod listener;
pub mod model;
pub mod registry;
pub mod terminal_state;
pub mod transport;

#[cfg(any(test, feature = "stubs"))]
pub mod stubs;
