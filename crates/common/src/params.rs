use std::collections::{BTreeMap, HashMap};
use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::types::RegimeCall;
use crate::types::RegimeLabel;

/// One complete set of strategy parameters. Keyed by regime in the
/// `ParameterStore`; exactly one set is active per regime at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    pub adx_period: usize,
    pub adx_threshold: f64,
    pub di_plus_period: usize,
    pub di_minus_period: usize,
    pub atr_period: usize,
    pub stop_multiplier: f64,
    pub gain_multiplier: f64,
}

impl Default for ParameterSet {
    /// The reserved baseline set, used when classification confidence is
    /// zero or a regime has no tuned set yet.
    fn default() -> Self {
        Self {
            adx_period: 14,
            adx_threshold: 25.0,
            di_plus_period: 14,
            di_minus_period: 14,
            atr_period: 14,
            stop_multiplier: 2.5,
            gain_multiplier: 4.0,
        }
    }
}

impl ParameterSet {
    /// Longest indicator lookback in this set. The indicator engine keeps a
    /// window of `max_period() + 1` candles.
    pub fn max_period(&self) -> usize {
        self.adx_period
            .max(self.di_plus_period)
            .max(self.di_minus_period)
            .max(self.atr_period)
    }

    /// Check every field against the configured domain. Returns the first
    /// violation as `ParameterOutOfBounds`.
    pub fn validate(&self, bounds: &ParameterBounds, regime: &str) -> Result<()> {
        let period_checks: [(&'static str, usize); 4] = [
            ("adx_period", self.adx_period),
            ("di_plus_period", self.di_plus_period),
            ("di_minus_period", self.di_minus_period),
            ("atr_period", self.atr_period),
        ];
        for (field, value) in period_checks {
            if !bounds.period.contains(&value) {
                return Err(Error::ParameterOutOfBounds {
                    regime: regime.to_string(),
                    field,
                    value: value as f64,
                });
            }
        }
        if !bounds.threshold.contains(&self.adx_threshold) {
            return Err(Error::ParameterOutOfBounds {
                regime: regime.to_string(),
                field: "adx_threshold",
                value: self.adx_threshold,
            });
        }
        let mult_checks: [(&'static str, f64); 2] = [
            ("stop_multiplier", self.stop_multiplier),
            ("gain_multiplier", self.gain_multiplier),
        ];
        for (field, value) in mult_checks {
            if !bounds.multiplier.contains(&value) {
                return Err(Error::ParameterOutOfBounds {
                    regime: regime.to_string(),
                    field,
                    value,
                });
            }
        }
        Ok(())
    }
}

/// Configured domain for each parameter family.
#[derive(Debug, Clone)]
pub struct ParameterBounds {
    pub period: RangeInclusive<usize>,
    pub threshold: RangeInclusive<f64>,
    pub multiplier: RangeInclusive<f64>,
}

impl Default for ParameterBounds {
    fn default() -> Self {
        Self {
            period: 2..=50,
            threshold: 5.0..=60.0,
            multiplier: 0.5..=6.0,
        }
    }
}

#[derive(Debug)]
struct StoreInner {
    baseline: Arc<ParameterSet>,
    by_regime: HashMap<RegimeLabel, Arc<ParameterSet>>,
}

/// Regime -> parameter-set mapping with a reserved baseline entry.
///
/// Readers take an `Arc` snapshot of a whole immutable set, so a concurrent
/// writer swapping the pointer can never expose a torn record. The lock is
/// held only for the pointer clone/swap, never across a decision.
#[derive(Debug)]
pub struct ParameterStore {
    inner: RwLock<StoreInner>,
    bounds: ParameterBounds,
}

impl ParameterStore {
    pub fn new(baseline: ParameterSet) -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                baseline: Arc::new(baseline),
                by_regime: HashMap::new(),
            }),
            bounds: ParameterBounds::default(),
        }
    }

    pub fn bounds(&self) -> &ParameterBounds {
        &self.bounds
    }

    pub fn baseline(&self) -> Arc<ParameterSet> {
        self.inner.read().expect("store lock poisoned").baseline.clone()
    }

    /// The active set for a classified regime.
    ///
    /// Zero-confidence calls and regimes without a tuned set resolve to the
    /// baseline; regime-specific overrides only apply to a real
    /// classification.
    pub fn active(&self, call: &RegimeCall) -> Arc<ParameterSet> {
        let inner = self.inner.read().expect("store lock poisoned");
        if call.confidence <= 0.0 {
            return inner.baseline.clone();
        }
        inner
            .by_regime
            .get(&call.label)
            .cloned()
            .unwrap_or_else(|| inner.baseline.clone())
    }

    pub fn get(&self, regime: RegimeLabel) -> Option<Arc<ParameterSet>> {
        self.inner
            .read()
            .expect("store lock poisoned")
            .by_regime
            .get(&regime)
            .cloned()
    }

    /// Atomically install a tuned set for one regime. Out-of-bounds values
    /// are rejected and the previous set stays active.
    pub fn update(&self, regime: RegimeLabel, set: ParameterSet) -> Result<()> {
        set.validate(&self.bounds, regime.key())?;
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner.by_regime.insert(regime, Arc::new(set));
        Ok(())
    }

    pub fn set_baseline(&self, set: ParameterSet) -> Result<()> {
        set.validate(&self.bounds, "baseline")?;
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner.baseline = Arc::new(set);
        Ok(())
    }

    /// Load a store from the TOML persistence file: one table per regime
    /// name plus `baseline`. Records failing bounds validation are dropped
    /// with a warning and the baseline covers that regime.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let records: BTreeMap<String, ParameterSet> = toml::from_str(&content)?;
        let store = Self::new(ParameterSet::default());

        for (key, set) in records {
            if key == "baseline" {
                match store.set_baseline(set) {
                    Ok(()) => {}
                    Err(e) => warn!(error = %e, "Persisted baseline rejected, using defaults"),
                }
                continue;
            }
            let Some(regime) = RegimeLabel::from_key(&key) else {
                warn!(key = %key, "Unknown regime in parameter file, record dropped");
                continue;
            };
            match store.update(regime, set) {
                Ok(()) => info!(regime = %regime, "Loaded tuned parameters"),
                Err(e) => warn!(regime = %regime, error = %e, "Persisted parameters rejected, baseline stays in effect"),
            }
        }
        Ok(store)
    }

    /// Serialize the current mapping back to the TOML persistence format.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let inner = self.inner.read().expect("store lock poisoned");
        let mut records: BTreeMap<String, ParameterSet> = BTreeMap::new();
        records.insert("baseline".to_string(), (*inner.baseline).clone());
        for (regime, set) in &inner.by_regime {
            records.insert(regime.key().to_string(), (**set).clone());
        }
        drop(inner);

        let content = toml::to_string_pretty(&records)
            .map_err(|e| Error::Config(format!("failed to serialize parameters: {e}")))?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }
}
