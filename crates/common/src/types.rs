use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One finalized OHLCV candle from the market data collaborator.
/// Candles are immutable once received and strictly ordered by `open_time`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1.0 for Long, -1.0 for Short. Used in stop/target arithmetic.
    pub fn sign(self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

/// Output of the indicator engine for one candle tick.
///
/// `valid` is false until the rolling window has accumulated enough candles.
/// An invalid snapshot must never drive a trading decision; the numeric
/// fields are zero in that case and must not be read.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub adx: f64,
    pub di_plus: f64,
    pub di_minus: f64,
    pub atr: f64,
    pub timestamp: DateTime<Utc>,
    pub valid: bool,
}

impl IndicatorSnapshot {
    /// The not-yet-warm snapshot for a given tick.
    pub fn unready(timestamp: DateTime<Utc>) -> Self {
        Self {
            adx: 0.0,
            di_plus: 0.0,
            di_minus: 0.0,
            atr: 0.0,
            timestamp,
            valid: false,
        }
    }
}

/// Scalar feature set consumed by the regime classifier and the signal
/// quality filter. Recomputed from the rolling windows on every tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    /// Mean ADX over the feature window (trend strength, 0-100).
    pub trend_strength: f64,
    /// ATR as a percentage of the close price.
    pub volatility_ratio: f64,
    /// Rate of change of the close over the momentum window, in percent.
    pub momentum: f64,
    /// Last volume relative to its rolling mean.
    pub volume_ratio: f64,
    /// (short MA - long MA) as a percentage of the close price.
    pub ma_spread: f64,
}

impl FeatureVector {
    pub const DIM: usize = 5;

    pub fn as_array(&self) -> [f64; Self::DIM] {
        [
            self.trend_strength,
            self.volatility_ratio,
            self.momentum,
            self.volume_ratio,
            self.ma_spread,
        ]
    }
}

/// Discrete market-condition label. Exactly one is active per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegimeLabel {
    Sideways,
    Uptrend,
    Downtrend,
    HighVolatility,
}

impl RegimeLabel {
    pub const ALL: [RegimeLabel; 4] = [
        RegimeLabel::Sideways,
        RegimeLabel::Uptrend,
        RegimeLabel::Downtrend,
        RegimeLabel::HighVolatility,
    ];

    /// Key used in the parameter persistence file.
    pub fn key(self) -> &'static str {
        match self {
            RegimeLabel::Sideways => "sideways",
            RegimeLabel::Uptrend => "uptrend",
            RegimeLabel::Downtrend => "downtrend",
            RegimeLabel::HighVolatility => "high_volatility",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.key() == key)
    }
}

impl std::fmt::Display for RegimeLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// A classified regime with the model's confidence in [0, 1].
///
/// Confidence 0.0 means "no usable classification"; the decision engine
/// must fall back to baseline parameters and apply no regime overrides.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeCall {
    pub label: RegimeLabel,
    pub confidence: f64,
}

impl RegimeCall {
    /// Fails-closed default when no classifier model is loaded.
    pub fn unclassified() -> Self {
        Self {
            label: RegimeLabel::Sideways,
            confidence: 0.0,
        }
    }
}

/// Raw directional signal derived deterministically from the indicator
/// comparison (never learned).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub direction: Direction,
    pub origin_time: DateTime<Utc>,
    pub snapshot: IndicatorSnapshot,
}

/// Quality score assigned to a raw signal by the filter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalScore {
    pub probability: f64,
    pub accepted: bool,
}

/// An open trading position. At most one per instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub pair: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub size: f64,
    pub stop_price: f64,
    pub target_price: f64,
    pub opened_at: DateTime<Utc>,
}

/// An order handed to the execution collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub id: String,
    pub pair: String,
    pub direction: Direction,
    pub size: f64,
    /// `None` = market order; `Some(price)` = limit order.
    pub price: Option<f64>,
}

impl OrderRequest {
    pub fn market(pair: impl Into<String>, direction: Direction, size: f64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pair: pair.into(),
            direction,
            size,
            price: None,
        }
    }
}

/// Outcome reported by the execution collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderResult {
    Filled { price: f64, timestamp: DateTime<Utc> },
    Rejected { reason: String },
    Pending,
}

/// Why an open position is being exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopHit,
    TargetHit,
    Flatten,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::StopHit => write!(f, "stop-loss"),
            ExitReason::TargetHit => write!(f, "take-profit"),
            ExitReason::Flatten => write!(f, "external flatten"),
        }
    }
}

/// Commands sent to the live engine via its command channel.
#[derive(Debug, Clone)]
pub enum EngineCommand {
    Start,
    Stop,
    /// Close any open position via the standard exit path, then idle.
    Flatten,
}

/// Events emitted by the decision engine, one batch per processed candle.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A state-machine transition (names from the lifecycle states).
    Transition { from: &'static str, to: &'static str },
    /// A raw signal passed the filter and an entry order is wanted.
    EntryRequested { signal: Signal, atr: f64 },
    /// The filter scored a raw signal below the acceptance threshold.
    SignalRejected { signal: Signal, score: SignalScore },
    PositionOpened { position: Position },
    StopTrailed { old_stop: f64, new_stop: f64 },
    /// Stop/target breached or an external flatten was requested.
    ExitRequested { reason: ExitReason, price: f64 },
    PositionClosed { position: Position, exit_price: f64, pnl: f64 },
    /// A hole in the candle sequence; the indicator window was reset.
    GapDetected {
        expected: DateTime<Utc>,
        actual: DateTime<Utc>,
    },
    /// A model did not answer within its deadline; degraded behavior applied.
    Degraded { component: &'static str },
}
