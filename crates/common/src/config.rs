/// All runtime configuration loaded from environment variables at startup.
/// Missing required variables cause an immediate panic with a clear message.
#[derive(Debug, Clone)]
pub struct Config {
    // Instrument
    pub pair: String,
    /// Expected spacing between candle open times, in seconds. Used for gap
    /// detection on the incoming feed.
    pub candle_interval_secs: i64,
    /// Order size in quote currency notional.
    pub position_size: f64,

    // Signal quality filter
    pub use_signal_filter: bool,
    pub signal_probability_threshold: f64,

    // Model artifacts (optional; missing models degrade, never abort)
    pub regime_model_path: Option<String>,
    pub filter_model_path: Option<String>,

    // Parameter persistence
    pub parameters_path: String,

    // Candle source for run/backtest modes
    pub candle_file: Option<String>,

    // Execution
    pub slippage_bps: f64,
    /// Bounded retry count after an order rejection. 0 = no retry.
    pub max_order_retries: u32,

    // Inference
    pub inference_deadline_ms: u64,

    // Entry confirmation: require this many preceding ADX values below the
    // threshold before a cross counts (0 disables the cross trigger).
    pub adx_previous_candles: usize,
}

impl Config {
    /// Load all configuration from environment variables.
    /// Loads `.env` if present. Panics on any malformed value.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv(); // ignore error if .env not present

        Config {
            pair: optional_env("TRADING_PAIR").unwrap_or_else(|| "BTCUSDT".to_string()),
            candle_interval_secs: parsed_env("CANDLE_INTERVAL_SECS", 3600),
            position_size: parsed_env("POSITION_SIZE", 10.0),
            use_signal_filter: bool_env("USE_SIGNAL_FILTER", true),
            signal_probability_threshold: parsed_env("SIGNAL_PROBABILITY_THRESHOLD", 0.65),
            regime_model_path: optional_env("REGIME_MODEL_PATH"),
            filter_model_path: optional_env("FILTER_MODEL_PATH"),
            parameters_path: optional_env("PARAMETERS_PATH")
                .unwrap_or_else(|| "config/parameters.toml".to_string()),
            candle_file: optional_env("CANDLE_FILE"),
            slippage_bps: parsed_env("SLIPPAGE_BPS", 0.0),
            max_order_retries: parsed_env("MAX_ORDER_RETRIES", 0),
            inference_deadline_ms: parsed_env("INFERENCE_DEADLINE_MS", 250),
            adx_previous_candles: parsed_env("ADX_PREVIOUS_CANDLES", 0),
        }
    }
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn parsed_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .unwrap_or_else(|_| panic!("Environment variable '{key}' has invalid value: '{v}'")),
        Err(_) => default,
    }
}

fn bool_env(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}
