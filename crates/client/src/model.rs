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

//! Account topology and the terminal payloads mirrored by the synchronization engine.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use ustr::Ustr;

use crate::identifiers::AccountId;

/// Redundancy level requested when subscribing to market data.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Display, EnumString, AsRefStr, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Reliability {
    #[default]
    High,
    Regular,
}

/// A region-pinned copy of an account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaTopology {
    pub id: AccountId,
    pub region: Ustr,
}

/// Identity and region layout of a trading account, as provisioned externally.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountTopology {
    pub id: AccountId,
    pub region: Ustr,
    pub reliability: Reliability,
    replicas: Vec<ReplicaTopology>,
}

impl AccountTopology {
    /// Creates a new [`AccountTopology`] instance with no replicas.
    #[must_use]
    pub fn new(id: &str, region: &str) -> Self {
        Self {
            id: AccountId::new(id),
            region: Ustr::from(region),
            reliability: Reliability::default(),
            replicas: Vec::new(),
        }
    }

    /// Adds a replica deployed in `region`.
    #[must_use]
    pub fn with_replica(mut self, id: &str, region: &str) -> Self {
        self.replicas.push(ReplicaTopology {
            id: AccountId::new(id),
            region: Ustr::from(region),
        });
        self
    }

    #[must_use]
    pub const fn with_reliability(mut self, reliability: Reliability) -> Self {
        self.reliability = reliability;
        self
    }

    #[must_use]
    pub fn replicas(&self) -> &[ReplicaTopology] {
        &self.replicas
    }

    /// Returns the account or replica id serving each region, primary region first.
    #[must_use]
    pub fn account_regions(&self) -> IndexMap<Ustr, AccountId> {
        let mut regions = IndexMap::with_capacity(self.replicas.len() + 1);
        regions.insert(self.region, self.id);
        for replica in &self.replicas {
            regions.insert(replica.region, replica.id);
        }
        regions
    }

    /// Returns the id serving `region`, if the account is deployed there.
    #[must_use]
    pub fn replica_for_region(&self, region: &str) -> Option<AccountId> {
        self.account_regions()
            .into_iter()
            .find_map(|(r, id)| (r.as_str() == region).then_some(id))
    }

    #[must_use]
    pub fn is_deployed_in(&self, region: &str) -> bool {
        self.replica_for_region(region).is_some()
    }
}

/// Settings for reaching a region's endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlSettings {
    pub url: String,
    pub is_shared_client_api: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInformation {
    pub platform: String,
    pub broker: String,
    pub currency: String,
    pub server: String,
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,
    pub free_margin: f64,
    pub leverage: f64,
    pub margin_level: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
pub enum PositionSide {
    #[serde(rename = "POSITION_TYPE_BUY")]
    #[strum(serialize = "POSITION_TYPE_BUY")]
    Buy,
    #[serde(rename = "POSITION_TYPE_SELL")]
    #[strum(serialize = "POSITION_TYPE_SELL")]
    Sell,
}

/// An open position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub id: String,
    pub symbol: Ustr,
    #[serde(rename = "type")]
    pub side: PositionSide,
    pub volume: f64,
    pub open_price: f64,
    pub current_price: f64,
    pub current_tick_value: Option<f64>,
    pub profit: f64,
    pub unrealized_profit: Option<f64>,
    pub time: DateTime<Utc>,
    pub update_time: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
pub enum OrderType {
    #[serde(rename = "ORDER_TYPE_BUY")]
    #[strum(serialize = "ORDER_TYPE_BUY")]
    Buy,
    #[serde(rename = "ORDER_TYPE_SELL")]
    #[strum(serialize = "ORDER_TYPE_SELL")]
    Sell,
    #[serde(rename = "ORDER_TYPE_BUY_LIMIT")]
    #[strum(serialize = "ORDER_TYPE_BUY_LIMIT")]
    BuyLimit,
    #[serde(rename = "ORDER_TYPE_SELL_LIMIT")]
    #[strum(serialize = "ORDER_TYPE_SELL_LIMIT")]
    SellLimit,
    #[serde(rename = "ORDER_TYPE_BUY_STOP")]
    #[strum(serialize = "ORDER_TYPE_BUY_STOP")]
    BuyStop,
    #[serde(rename = "ORDER_TYPE_SELL_STOP")]
    #[strum(serialize = "ORDER_TYPE_SELL_STOP")]
    SellStop,
    #[serde(rename = "ORDER_TYPE_BUY_STOP_LIMIT")]
    #[strum(serialize = "ORDER_TYPE_BUY_STOP_LIMIT")]
    BuyStopLimit,
    #[serde(rename = "ORDER_TYPE_SELL_STOP_LIMIT")]
    #[strum(serialize = "ORDER_TYPE_SELL_STOP_LIMIT")]
    SellStopLimit,
}

impl OrderType {
    #[must_use]
    pub const fn is_buy(&self) -> bool {
        matches!(
            self,
            Self::Buy | Self::BuyLimit | Self::BuyStop | Self::BuyStopLimit
        )
    }
}

/// A pending order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub symbol: Ustr,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub volume: f64,
    pub open_price: Option<f64>,
    pub current_price: Option<f64>,
    pub time: DateTime<Utc>,
}

/// A completed or canceled order from the account history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryOrder {
    pub id: String,
    pub symbol: Option<Ustr>,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub state: String,
    pub position_id: Option<String>,
    pub volume: f64,
    pub time: DateTime<Utc>,
    pub done_time: Option<DateTime<Utc>>,
}

impl HistoryOrder {
    /// Returns the timestamp the order is ordered and watermarked by.
    #[must_use]
    pub fn sort_time(&self) -> DateTime<Utc> {
        self.done_time.unwrap_or(self.time)
    }
}

/// A deal from the account history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deal {
    pub id: String,
    pub symbol: Option<Ustr>,
    #[serde(rename = "type")]
    pub deal_type: String,
    pub order_id: Option<String>,
    pub position_id: Option<String>,
    pub volume: Option<f64>,
    pub price: Option<f64>,
    pub profit: f64,
    pub time: DateTime<Utc>,
}

/// A page of history orders returned by a query.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryOrders {
    pub history_orders: Vec<HistoryOrder>,
    pub synchronizing: bool,
}

/// A page of deals returned by a query.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deals {
    pub deals: Vec<Deal>,
    pub synchronizing: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolSpecification {
    pub symbol: Ustr,
    pub tick_size: f64,
    pub digits: u32,
    pub contract_size: Option<f64>,
    pub min_volume: f64,
    pub max_volume: f64,
    pub volume_step: f64,
}

/// Latest quote for a symbol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolPrice {
    pub symbol: Ustr,
    pub bid: f64,
    pub ask: f64,
    pub profit_tick_value: f64,
    pub loss_tick_value: f64,
    pub time: DateTime<Utc>,
    pub broker_time: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerTime {
    pub time: DateTime<Utc>,
    pub broker_time: String,
}

/// Kind of market data stream.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, AsRefStr, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum MarketDataType {
    Quotes,
    Candles,
    Ticks,
    MarketDepth,
}

/// A requested market data stream for one symbol.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketDataSubscription {
    #[serde(rename = "type")]
    pub kind: MarketDataType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeframe: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_in_milliseconds: Option<u64>,
}

impl MarketDataSubscription {
    #[must_use]
    pub const fn new(kind: MarketDataType) -> Self {
        Self {
            kind,
            timeframe: None,
            interval_in_milliseconds: None,
        }
    }

    #[must_use]
    pub const fn quotes() -> Self {
        Self::new(MarketDataType::Quotes)
    }

    #[must_use]
    pub fn candles(timeframe: &str) -> Self {
        Self {
            timeframe: Some(timeframe.to_string()),
            ..Self::new(MarketDataType::Candles)
        }
    }

    /// Returns whether both subscriptions address the same stream, in which case the newer
    /// one replaces the older. Candle streams are distinguished by timeframe.
    #[must_use]
    pub fn is_same_stream(&self, other: &Self) -> bool {
        self.kind == other.kind
            && (self.kind != MarketDataType::Candles || self.timeframe == other.timeframe)
    }
}

/// A market data stream to stop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketDataUnsubscription {
    #[serde(rename = "type")]
    pub kind: MarketDataType,
    /// Restricts a candles unsubscription to one timeframe.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timeframe: Option<String>,
}

impl MarketDataUnsubscription {
    #[must_use]
    pub const fn new(kind: MarketDataType) -> Self {
        Self {
            kind,
            timeframe: None,
        }
    }

    #[must_use]
    pub fn candles(timeframe: &str) -> Self {
        Self {
            kind: MarketDataType::Candles,
            timeframe: Some(timeframe.to_string()),
        }
    }

    /// Returns whether this unsubscription stops `subscription`.
    #[must_use]
    pub fn matches(&self, subscription: &MarketDataSubscription) -> bool {
        self.kind == subscription.kind
            && self
                .timeframe
                .as_ref()
                .is_none_or(|timeframe| subscription.timeframe.as_ref() == Some(timeframe))
    }
}

/// The desired subscription set for one symbol, re-sent by the refresh job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolSubscriptions {
    pub symbol: Ustr,
    pub subscriptions: Vec<MarketDataSubscription>,
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn test_account_regions_primary_first() {
        let account = AccountTopology::new("accountId", "vint-hill")
            .with_replica("accountIdReplica", "new-york")
            .with_replica("accountIdReplica2", "singapore");

        let regions: Vec<(String, String)> = account
            .account_regions()
            .into_iter()
            .map(|(r, id)| (r.to_string(), id.to_string()))
            .collect();

        assert_eq!(
            regions,
            vec![
                ("vint-hill".to_string(), "accountId".to_string()),
                ("new-york".to_string(), "accountIdReplica".to_string()),
                ("singapore".to_string(), "accountIdReplica2".to_string()),
            ]
        );
        assert_eq!(
            account.replica_for_region("new-york"),
            Some(AccountId::new("accountIdReplica"))
        );
        assert!(!account.is_deployed_in("tokyo"));
    }

    #[rstest]
    #[case(MarketDataSubscription::quotes(), MarketDataSubscription::quotes(), true)]
    #[case(MarketDataSubscription::candles("1m"), MarketDataSubscription::candles("1m"), true)]
    #[case(MarketDataSubscription::candles("1m"), MarketDataSubscription::candles("5m"), false)]
    #[case(
        MarketDataSubscription::quotes(),
        MarketDataSubscription::new(MarketDataType::Ticks),
        false
    )]
    fn test_is_same_stream(
        #[case] a: MarketDataSubscription,
        #[case] b: MarketDataSubscription,
        #[case] expected: bool,
    ) {
        assert_eq!(a.is_same_stream(&b), expected);
    }

    #[rstest]
    fn test_unsubscription_matches_timeframe() {
        let all_candles = MarketDataUnsubscription::new(MarketDataType::Candles);
        let five_minutes = MarketDataUnsubscription::candles("5m");

        assert!(all_candles.matches(&MarketDataSubscription::candles("1m")));
        assert!(five_minutes.matches(&MarketDataSubscription::candles("5m")));
        assert!(!five_minutes.matches(&MarketDataSubscription::candles("1m")));
        assert!(!five_minutes.matches(&MarketDataSubscription::quotes()));
    }

    #[rstest]
    fn test_position_deserializes_wire_names() {
        let json = r#"{
            "id": "46214692",
            "symbol": "GBPUSD",
            "type": "POSITION_TYPE_BUY",
            "volume": 0.07,
            "openPrice": 1.26101,
            "currentPrice": 1.24883,
            "currentTickValue": 1,
            "profit": -85.25999999999966,
            "unrealizedProfit": -85.25999999999901,
            "time": "2020-04-15T02:45:06.521Z",
            "updateTime": null
        }"#;

        let position: Position = serde_json::from_str(json).unwrap();

        assert_eq!(position.side, PositionSide::Buy);
        assert_eq!(position.symbol.as_str(), "GBPUSD");
        assert_eq!(position.current_tick_value, Some(1.0));
    }

    #[rstest]
    fn test_subscription_serializes_type_field() {
        let json = serde_json::to_value(MarketDataSubscription::candles("1m")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "candles", "timeframe": "1m"}));
    }
}
