//! Declarative event definitions and their rule checks.
//!
//! What the tracker learns to anticipate is defined here as a table of
//! small pure predicates keyed by event type, each tagged with a severity
//! and a category for notification filtering. Extending the system means
//! adding a row, not a code path.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Category used for notification filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Crypto,
    Earthquake,
    SpaceWeather,
    Blockchain,
    /// Recorded for statistics, never surfaced to users.
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// An externally observed discrete occurrence (price swing, quake, storm).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternEvent {
    pub timestamp: f64,
    pub event_type: String,
    pub severity: EventSeverity,
    pub metadata: serde_json::Value,
    /// (lat, lon) for geographic events.
    pub location: Option<(f64, f64)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Asset {
    Btc,
    Eth,
}

impl Asset {
    pub fn symbol(self) -> &'static str {
        match self {
            Asset::Btc => "BTCUSDT",
            Asset::Eth => "ETHUSDT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Pump,
    Dump,
}

/// The pure predicate behind one event type.
#[derive(Debug, Clone, Copy)]
pub enum RuleKind {
    /// Percentage move over a horizon, judged against rolling history.
    CryptoMove {
        asset: Asset,
        direction: Direction,
        hours: f64,
        threshold_pct: f64,
    },
    /// 24h change magnitude reported directly by the sensor.
    CryptoVolatility { threshold_pct: f64 },
    /// Any network reporting block times at 2x expected or worse.
    BlockchainBlockTime,
    Earthquake { min_magnitude: f64 },
    /// Kp threshold, with a high solar-wind alternative for minor storms.
    SolarStorm { min_kp: f64 },
    /// Legacy Kp-only check kept for statistics continuity.
    GeomagneticStorm { min_kp: f64 },
    NewsSpike { multiplier: f64 },
    QuantumAnomaly { threshold: f64 },
}

pub struct EventRule {
    pub event_type: &'static str,
    pub kind: RuleKind,
    pub severity: EventSeverity,
    pub category: EventCategory,
    pub description: &'static str,
}

const fn rule(
    event_type: &'static str,
    kind: RuleKind,
    severity: EventSeverity,
    category: EventCategory,
    description: &'static str,
) -> EventRule {
    EventRule {
        event_type,
        kind,
        severity,
        category,
        description,
    }
}

const fn crypto_move(
    event_type: &'static str,
    asset: Asset,
    direction: Direction,
    hours: f64,
    threshold_pct: f64,
    severity: EventSeverity,
    description: &'static str,
) -> EventRule {
    rule(
        event_type,
        RuleKind::CryptoMove {
            asset,
            direction,
            hours,
            threshold_pct,
        },
        severity,
        EventCategory::Crypto,
        description,
    )
}

/// Every event type the tracker learns about.
pub static EVENT_RULES: &[EventRule] = &[
    // BTC short/swing/position horizons.
    crypto_move("btc_pump_1h", Asset::Btc, Direction::Pump, 1.0, 2.0, EventSeverity::Medium, "BTC surge > 2% in 1h"),
    crypto_move("btc_dump_1h", Asset::Btc, Direction::Dump, 1.0, 2.0, EventSeverity::Medium, "BTC drop > 2% in 1h"),
    crypto_move("btc_pump_4h", Asset::Btc, Direction::Pump, 4.0, 4.0, EventSeverity::High, "BTC surge > 4% in 4h"),
    crypto_move("btc_dump_4h", Asset::Btc, Direction::Dump, 4.0, 4.0, EventSeverity::High, "BTC drop > 4% in 4h"),
    crypto_move("btc_pump_24h", Asset::Btc, Direction::Pump, 24.0, 7.0, EventSeverity::High, "BTC surge > 7% in 24h"),
    crypto_move("btc_dump_24h", Asset::Btc, Direction::Dump, 24.0, 7.0, EventSeverity::High, "BTC drop > 7% in 24h"),
    // ETH.
    crypto_move("eth_pump_1h", Asset::Eth, Direction::Pump, 1.0, 2.5, EventSeverity::Medium, "ETH surge > 2.5% in 1h"),
    crypto_move("eth_dump_1h", Asset::Eth, Direction::Dump, 1.0, 2.5, EventSeverity::Medium, "ETH drop > 2.5% in 1h"),
    crypto_move("eth_pump_4h", Asset::Eth, Direction::Pump, 4.0, 5.0, EventSeverity::High, "ETH surge > 5% in 4h"),
    crypto_move("eth_dump_4h", Asset::Eth, Direction::Dump, 4.0, 5.0, EventSeverity::High, "ETH drop > 5% in 4h"),
    crypto_move("eth_pump_24h", Asset::Eth, Direction::Pump, 24.0, 10.0, EventSeverity::High, "ETH surge > 10% in 24h"),
    crypto_move("eth_dump_24h", Asset::Eth, Direction::Dump, 24.0, 10.0, EventSeverity::High, "ETH drop > 10% in 24h"),
    // Volatility bands.
    rule("btc_volatility_high", RuleKind::CryptoVolatility { threshold_pct: 2.5 }, EventSeverity::High, EventCategory::Crypto, "BTC high volatility > 2.5%"),
    rule("btc_volatility_medium", RuleKind::CryptoVolatility { threshold_pct: 1.5 }, EventSeverity::Medium, EventCategory::Crypto, "BTC medium volatility > 1.5%"),
    // Blockchain.
    rule("blockchain_anomaly", RuleKind::BlockchainBlockTime, EventSeverity::Medium, EventCategory::Blockchain, "Blockchain anomaly (block time)"),
    // Earthquakes.
    rule("earthquake_moderate", RuleKind::Earthquake { min_magnitude: 5.0 }, EventSeverity::Medium, EventCategory::Earthquake, "Earthquake M5.0+"),
    rule("earthquake_strong", RuleKind::Earthquake { min_magnitude: 6.0 }, EventSeverity::High, EventCategory::Earthquake, "Earthquake M6.0+"),
    rule("earthquake_major", RuleKind::Earthquake { min_magnitude: 7.0 }, EventSeverity::Critical, EventCategory::Earthquake, "Earthquake M7.0+"),
    // Space weather.
    rule("solar_storm_moderate", RuleKind::SolarStorm { min_kp: 5.0 }, EventSeverity::Medium, EventCategory::SpaceWeather, "Solar storm Kp5+"),
    rule("solar_storm_strong", RuleKind::SolarStorm { min_kp: 7.0 }, EventSeverity::High, EventCategory::SpaceWeather, "Solar storm Kp7+"),
    rule("solar_storm_extreme", RuleKind::SolarStorm { min_kp: 9.0 }, EventSeverity::Critical, EventCategory::SpaceWeather, "Solar storm Kp9 (extreme)"),
    // Recorded for statistics only, never displayed.
    rule("earthquake_significant", RuleKind::Earthquake { min_magnitude: 5.5 }, EventSeverity::High, EventCategory::Other, "Earthquake > 5.5"),
    rule("earthquake_moderate_old", RuleKind::Earthquake { min_magnitude: 5.0 }, EventSeverity::Medium, EventCategory::Other, "Earthquake > 5.0"),
    rule("news_spike", RuleKind::NewsSpike { multiplier: 2.0 }, EventSeverity::Medium, EventCategory::Other, "News spike > 2x"),
    rule("space_weather_storm", RuleKind::GeomagneticStorm { min_kp: 5.0 }, EventSeverity::High, EventCategory::Other, "Geomagnetic storm Kp > 5"),
    rule("quantum_anomaly", RuleKind::QuantumAnomaly { threshold: 0.90 }, EventSeverity::Medium, EventCategory::Other, "Quantum anomaly"),
];

/// Look up a rule row by event type.
pub fn rule_for(event_type: &str) -> Option<&'static EventRule> {
    EVENT_RULES.iter().find(|r| r.event_type == event_type)
}

/// Baseline for the news-spike multiplier (typical new items per poll).
const NEWS_BASELINE_ITEMS: f64 = 25.0;
/// Solar wind speed treated as storm-equivalent for minor-storm checks.
const STORM_WIND_SPEED_KMS: f64 = 700.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: f64,
    pub price: f64,
}

/// Bounded rolling price history per asset, for percentage-move checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceHistory {
    btc: VecDeque<PricePoint>,
    eth: VecDeque<PricePoint>,
    cap: usize,
}

impl Default for PriceHistory {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAP)
    }
}

impl PriceHistory {
    /// Roughly three days of 30-second samples.
    pub const DEFAULT_CAP: usize = 10_000;

    pub fn new(cap: usize) -> Self {
        Self {
            btc: VecDeque::new(),
            eth: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    fn series(&self, asset: Asset) -> &VecDeque<PricePoint> {
        match asset {
            Asset::Btc => &self.btc,
            Asset::Eth => &self.eth,
        }
    }

    pub fn record(&mut self, asset: Asset, timestamp: f64, price: f64) {
        if price <= 0.0 {
            return;
        }
        let series = match asset {
            Asset::Btc => &mut self.btc,
            Asset::Eth => &mut self.eth,
        };
        if series.len() == self.cap {
            series.pop_front();
        }
        series.push_back(PricePoint { timestamp, price });
    }

    /// Most recent sample at or before `target` time.
    pub fn price_at_or_before(&self, asset: Asset, target: f64) -> Option<f64> {
        self.series(asset)
            .iter()
            .rev()
            .find(|p| p.timestamp <= target)
            .map(|p| p.price)
    }

    pub fn len(&self, asset: Asset) -> usize {
        self.series(asset).len()
    }

    pub fn is_empty(&self) -> bool {
        self.btc.is_empty() && self.eth.is_empty()
    }

    /// Pull the per-asset spot prices out of a crypto sensor payload.
    pub fn record_from_payload(&mut self, payload: &serde_json::Value, now: f64) {
        if str_field(payload, "source") != Some("crypto") {
            return;
        }
        for asset in [Asset::Btc, Asset::Eth] {
            if let Some(price) = pair_price(payload, asset) {
                self.record(asset, now, price);
            }
        }
    }
}

fn num_field(payload: &serde_json::Value, key: &str) -> Option<f64> {
    payload.get(key).and_then(serde_json::Value::as_f64)
}

fn str_field<'a>(payload: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(serde_json::Value::as_str)
}

/// Spot price for an asset from the payload's `pairs` list.
fn pair_price(payload: &serde_json::Value, asset: Asset) -> Option<f64> {
    let pairs = payload.get("pairs")?.as_array()?;
    let pair = pairs
        .iter()
        .find(|p| str_field(p, "symbol") == Some(asset.symbol()))?;
    let price = num_field(pair, "price")?;
    (price > 0.0).then_some(price)
}

impl EventRule {
    /// Evaluate this rule against one sensor payload. Missing or
    /// malformed fields simply mean "no event".
    pub fn check(&self, payload: &serde_json::Value, now: f64, prices: &PriceHistory) -> bool {
        match self.kind {
            RuleKind::CryptoMove {
                asset,
                direction,
                hours,
                threshold_pct,
            } => check_crypto_move(payload, now, prices, asset, direction, hours, threshold_pct),
            RuleKind::CryptoVolatility { threshold_pct } => {
                str_field(payload, "source") == Some("crypto")
                    && num_field(payload, "btcusdt.price_change_24h_percent")
                        .map_or(false, |change| change.abs() >= threshold_pct)
            }
            RuleKind::BlockchainBlockTime => check_blockchain(payload),
            RuleKind::Earthquake { min_magnitude } => {
                num_field(payload, "max_magnitude").map_or(false, |m| m >= min_magnitude)
            }
            RuleKind::SolarStorm { min_kp } => {
                if str_field(payload, "source") != Some("space_weather") {
                    return false;
                }
                let kp = num_field(payload, "kp_index").unwrap_or(0.0);
                if kp >= min_kp {
                    return true;
                }
                // Minor-storm check also accepts very fast solar wind.
                min_kp <= 5.0
                    && num_field(payload, "solar_wind_speed").unwrap_or(0.0)
                        >= STORM_WIND_SPEED_KMS
            }
            RuleKind::GeomagneticStorm { min_kp } => {
                str_field(payload, "source") == Some("space_weather")
                    && num_field(payload, "kp_index").unwrap_or(0.0) >= min_kp
            }
            RuleKind::NewsSpike { multiplier } => {
                str_field(payload, "source") == Some("news")
                    && num_field(payload, "new_items_count").unwrap_or(0.0)
                        >= NEWS_BASELINE_ITEMS * multiplier
            }
            RuleKind::QuantumAnomaly { threshold } => {
                num_field(payload, "randomness_score").map_or(false, |score| score < threshold)
            }
        }
    }

    /// Lat/lon attached to geographic events when the payload carries it.
    pub fn location_from(&self, payload: &serde_json::Value) -> Option<(f64, f64)> {
        if !self.event_type.contains("earthquake") {
            return None;
        }
        Some((
            num_field(payload, "latitude")?,
            num_field(payload, "longitude")?,
        ))
    }
}

fn check_crypto_move(
    payload: &serde_json::Value,
    now: f64,
    prices: &PriceHistory,
    asset: Asset,
    direction: Direction,
    hours: f64,
    threshold_pct: f64,
) -> bool {
    if str_field(payload, "source") != Some("crypto") {
        return false;
    }
    let Some(current) = pair_price(payload, asset) else {
        return false;
    };
    let Some(old) = prices.price_at_or_before(asset, now - hours * 3600.0) else {
        return false;
    };
    if old <= 0.0 {
        return false;
    }
    let change_pct = (current - old) / old * 100.0;
    match direction {
        Direction::Pump => change_pct >= threshold_pct,
        Direction::Dump => change_pct <= -threshold_pct,
    }
}

fn check_blockchain(payload: &serde_json::Value) -> bool {
    if str_field(payload, "source") != Some("blockchain") {
        return false;
    }
    let Some(networks) = payload.get("networks").and_then(|n| n.as_object()) else {
        return false;
    };
    networks.values().any(|net| {
        let block_time = num_field(net, "block_time_seconds").unwrap_or(0.0);
        let expected = num_field(net, "expected_block_time").unwrap_or(0.0);
        expected > 0.0 && block_time > 0.0 && block_time >= expected * 2.0
    })
}
