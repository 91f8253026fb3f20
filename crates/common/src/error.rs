use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Insufficient candle history. Deferred, not fatal: the caller skips
    /// the tick and waits for more data.
    #[error("insufficient data: have {have} candles, need {need}")]
    DataUnready { have: usize, need: usize },

    /// Classifier or filter model missing or unresponsive. Degrade to
    /// baseline parameters / auto-reject, warning level.
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// A persisted or optimized parameter violates its domain. The value is
    /// dropped and the baseline set is used instead.
    #[error("parameter out of bounds: {field}={value} for regime '{regime}'")]
    ParameterOutOfBounds {
        regime: String,
        field: &'static str,
        value: f64,
    },

    /// One optimizer trial failed. Recorded with a penalty value; the run
    /// continues.
    #[error("objective evaluation failed: {0}")]
    ObjectiveEvaluationFailed(String),

    /// An invalid state-machine transition was attempted. This indicates a
    /// correctness bug, not an environmental condition: the instrument's
    /// engine halts immediately.
    #[error("inconsistent state: illegal transition {from} -> {to}")]
    InconsistentState {
        from: &'static str,
        to: &'static str,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Only `InconsistentState` is non-recoverable; everything else is
    /// absorbed locally with explicit degraded-mode behavior.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::InconsistentState { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
