use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use backtest::{BacktestConfig, Backtester, ReplayFeed, SimExecution, TrackedFeed};
use common::{
    Candle, Config, EngineCommand, ParameterSet, ParameterStore, RegimeLabel,
};
use engine::{DecisionConfig, DecisionEngine, Engine};
use indicators::{FeatureWindow, IndicatorEngine};
use ml::{FilterArtifact, RegimeArtifact, RegimeClassifier, SignalQualityFilter};
use optimizer::{tune_regimes, BayesianOptimizer, OptimizerSettings};

/// Per-regime tuning history must at least cover warmup plus a few trades.
const MIN_SEGMENT_LEN: usize = 40;

const REPORT_PATH: &str = "optimization_report.json";

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ──────────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    // ── Config ───────────────────────────────────────────────────────────────
    let cfg = Config::from_env();
    let mode = std::env::args().nth(1).unwrap_or_else(|| "run".to_string());
    info!(mode = %mode, pair = %cfg.pair, "AdxBot starting");

    match mode.as_str() {
        "run" => run(cfg).await,
        "backtest" => backtest_mode(cfg),
        "optimize" => optimize_mode(cfg),
        other => bail!("unknown mode '{other}', expected run | backtest | optimize"),
    }
}

// ── Shared wiring ────────────────────────────────────────────────────────────

fn load_candles(cfg: &Config) -> Result<Vec<Candle>> {
    let path = cfg
        .candle_file
        .as_deref()
        .context("CANDLE_FILE must point at a JSON candle file for this mode")?;
    let feed = ReplayFeed::from_file(path)
        .with_context(|| format!("failed to load candle file '{path}'"))?;
    Ok(feed.into_candles())
}

fn load_store(cfg: &Config) -> Arc<ParameterStore> {
    match ParameterStore::load(&cfg.parameters_path) {
        Ok(store) => {
            info!(path = %cfg.parameters_path, "Parameter store loaded");
            Arc::new(store)
        }
        Err(e) => {
            warn!(path = %cfg.parameters_path, error = %e, "No usable parameter file, baseline defaults in effect");
            Arc::new(ParameterStore::new(ParameterSet::default()))
        }
    }
}

fn load_classifier(cfg: &Config) -> Arc<RegimeClassifier> {
    match &cfg.regime_model_path {
        Some(path) => match RegimeArtifact::load(path) {
            Ok(artifact) => Arc::new(RegimeClassifier::new(Arc::new(artifact))),
            Err(e) => {
                warn!(path = %path, error = %e, "Regime model failed to load, classification disabled");
                Arc::new(RegimeClassifier::unloaded())
            }
        },
        None => Arc::new(RegimeClassifier::unloaded()),
    }
}

fn load_filter(cfg: &Config) -> Arc<SignalQualityFilter> {
    if !cfg.use_signal_filter {
        return Arc::new(SignalQualityFilter::disabled());
    }
    let threshold = cfg.signal_probability_threshold;
    match &cfg.filter_model_path {
        Some(path) => match FilterArtifact::load(path) {
            Ok(artifact) => Arc::new(SignalQualityFilter::new(Arc::new(artifact), threshold)),
            Err(e) => {
                warn!(path = %path, error = %e, "Filter model failed to load, signals pass unfiltered");
                Arc::new(SignalQualityFilter::unloaded(threshold))
            }
        },
        None => {
            warn!("Signal filter enabled without FILTER_MODEL_PATH, signals pass unfiltered");
            Arc::new(SignalQualityFilter::unloaded(threshold))
        }
    }
}

fn decision_engine(cfg: &Config, store: Arc<ParameterStore>, with_deadline: bool) -> DecisionEngine {
    let mut decision_cfg = DecisionConfig::from_config(cfg);
    if !with_deadline {
        decision_cfg.inference_deadline = None;
    }
    DecisionEngine::new(decision_cfg, store, load_classifier(cfg), load_filter(cfg))
}

// ── run: paper trading over a replayed feed ─────────────────────────────────

async fn run(cfg: Config) -> Result<()> {
    let candles = load_candles(&cfg)?;
    let store = load_store(&cfg);
    let decision = decision_engine(&cfg, store, true);

    let (feed, price) = TrackedFeed::new(ReplayFeed::new(candles));
    let execution = Arc::new(SimExecution::new(price, cfg.slippage_bps));
    let (engine, handle) = Engine::new(
        decision,
        Box::new(feed),
        execution,
        cfg.max_order_retries,
    );

    let mut events = handle.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(?event, "engine event");
        }
    });

    let engine_task = tokio::spawn(engine.run());
    handle.send(EngineCommand::Start).await;

    tokio::select! {
        _ = engine_task => info!("Engine finished"),
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, flattening");
            handle.send(EngineCommand::Flatten).await;
            handle.send(EngineCommand::Stop).await;
        }
    }
    Ok(())
}

// ── backtest: one deterministic replay, report on stdout ────────────────────

fn backtest_mode(cfg: Config) -> Result<()> {
    let candles = load_candles(&cfg)?;
    let store = load_store(&cfg);
    let decision = decision_engine(&cfg, store, false);

    let mut backtester = Backtester::new(
        decision,
        BacktestConfig {
            slippage_bps: cfg.slippage_bps,
            entry_latency_candles: 0,
        },
    );

    let report = backtester.run(&candles).context("backtest failed")?;
    let json = serde_json::to_string_pretty(&report).context("report serialization failed")?;
    println!("{json}");
    Ok(())
}

// ── optimize: per-regime Bayesian tuning over regime-labeled history ────────

fn optimize_mode(cfg: Config) -> Result<()> {
    let candles = load_candles(&cfg)?;
    let store = load_store(&cfg);
    let classifier = load_classifier(&cfg);
    let labels = label_candles(&candles, &classifier);

    let optimizer = BayesianOptimizer::new(OptimizerSettings::default(), store.bounds().clone());

    let report = tune_regimes(&optimizer, &store, |regime, set| {
        let segments = regime_segments(&candles, &labels, regime);
        let slices: Vec<&[Candle]> = if segments.is_empty() {
            vec![&candles[..]]
        } else {
            segments
        };

        let mut net = 0.0;
        for slice in slices {
            let trial_store = Arc::new(ParameterStore::new(set.clone()));
            let decision = DecisionEngine::new(
                DecisionConfig {
                    pair: cfg.pair.clone(),
                    position_size: cfg.position_size,
                    candle_interval_secs: cfg.candle_interval_secs,
                    adx_previous_candles: cfg.adx_previous_candles,
                    inference_deadline: None,
                },
                trial_store,
                Arc::new(RegimeClassifier::unloaded()),
                Arc::new(SignalQualityFilter::disabled()),
            );
            let mut backtester = Backtester::new(
                decision,
                BacktestConfig {
                    slippage_bps: cfg.slippage_bps,
                    entry_latency_candles: 0,
                },
            );
            net += backtester.run(slice)?.net_profit;
        }
        Ok(net)
    });

    let report = report.context("optimization failed")?;
    if let Err(e) = store.save(&cfg.parameters_path) {
        warn!(error = %e, "Tuned parameters could not be persisted");
    }
    if let Err(e) = report.save(REPORT_PATH) {
        warn!(error = %e, "Optimization report could not be written");
    }
    info!(path = %cfg.parameters_path, report = REPORT_PATH, "Optimization complete");
    Ok(())
}

/// Label each candle with the regime observed at its close, using baseline
/// indicator settings. `None` until classification has enough history.
fn label_candles(candles: &[Candle], classifier: &RegimeClassifier) -> Vec<Option<RegimeLabel>> {
    let baseline = ParameterSet::default();
    let mut indicators = IndicatorEngine::new(&baseline);
    let mut window = FeatureWindow::new();

    candles
        .iter()
        .map(|candle| {
            let snapshot = indicators.update(candle);
            window.push(*candle, snapshot);
            let features = window.compute()?;
            let call = classifier.classify(&features);
            (call.confidence > 0.0).then_some(call.label)
        })
        .collect()
}

/// Contiguous stretches of one regime, long enough to backtest.
fn regime_segments<'a>(
    candles: &'a [Candle],
    labels: &[Option<RegimeLabel>],
    regime: RegimeLabel,
) -> Vec<&'a [Candle]> {
    let mut segments = Vec::new();
    let mut start: Option<usize> = None;
    for (i, label) in labels.iter().enumerate() {
        let matches = *label == Some(regime);
        match (matches, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                if i - s >= MIN_SEGMENT_LEN {
                    segments.push(&candles[s..i]);
                }
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        if labels.len() - s >= MIN_SEGMENT_LEN {
            segments.push(&candles[s..]);
        }
    }
    segments
}
