use common::{Candle, IndicatorSnapshot, ParameterSet};

/// True range of `candle` given the previous close.
fn true_range(candle: &Candle, prev_close: f64) -> f64 {
    let hl = candle.high - candle.low;
    let hc = (candle.high - prev_close).abs();
    let lc = (candle.low - prev_close).abs();
    hl.max(hc).max(lc)
}

/// Directional movement (+DM, -DM) between two consecutive candles.
fn directional_movement(prev: &Candle, candle: &Candle) -> (f64, f64) {
    let up = candle.high - prev.high;
    let down = prev.low - candle.low;
    let plus = if up > down && up > 0.0 { up } else { 0.0 };
    let minus = if down > up && down > 0.0 { down } else { 0.0 };
    (plus, minus)
}

/// Wilder-smoothed directional-movement stream at one period.
///
/// The smoothing uses Wilder's running-sum recurrence
/// `s[t] = s[t-1] - s[t-1]/period + new`, seeded with the plain sum of the
/// first `period` values, which matches the standard (TA-Lib) DI semantics.
#[derive(Debug, Clone)]
struct DiStream {
    period: usize,
    seen: usize,
    s_tr: f64,
    s_plus: f64,
    s_minus: f64,
}

impl DiStream {
    fn new(period: usize) -> Self {
        Self {
            period,
            seen: 0,
            s_tr: 0.0,
            s_plus: 0.0,
            s_minus: 0.0,
        }
    }

    /// Feed one (TR, +DM, -DM) triple. Returns `(di_plus, di_minus)` once
    /// `period` values have accumulated.
    fn update(&mut self, tr: f64, plus_dm: f64, minus_dm: f64) -> Option<(f64, f64)> {
        self.seen += 1;
        if self.seen <= self.period {
            self.s_tr += tr;
            self.s_plus += plus_dm;
            self.s_minus += minus_dm;
            if self.seen < self.period {
                return None;
            }
        } else {
            let p = self.period as f64;
            self.s_tr = self.s_tr - self.s_tr / p + tr;
            self.s_plus = self.s_plus - self.s_plus / p + plus_dm;
            self.s_minus = self.s_minus - self.s_minus / p + minus_dm;
        }
        if self.s_tr <= 0.0 {
            return Some((0.0, 0.0));
        }
        Some((
            100.0 * self.s_plus / self.s_tr,
            100.0 * self.s_minus / self.s_tr,
        ))
    }

    fn reset(&mut self) {
        *self = Self::new(self.period);
    }
}

/// Wilder-smoothed ATR at one period, seeded with the mean of the first
/// `period` true ranges.
#[derive(Debug, Clone)]
struct AtrStream {
    period: usize,
    seen: usize,
    acc: f64,
    value: Option<f64>,
}

impl AtrStream {
    fn new(period: usize) -> Self {
        Self {
            period,
            seen: 0,
            acc: 0.0,
            value: None,
        }
    }

    fn update(&mut self, tr: f64) -> Option<f64> {
        self.seen += 1;
        let p = self.period as f64;
        match self.value {
            None => {
                self.acc += tr;
                if self.seen == self.period {
                    self.value = Some(self.acc / p);
                }
            }
            Some(prev) => {
                self.value = Some((prev * (p - 1.0) + tr) / p);
            }
        }
        self.value
    }

    fn reset(&mut self) {
        *self = Self::new(self.period);
    }
}

/// ADX at one period: DX from the same-period DI pair, the first ADX being
/// the mean of the first `period` DX values, then Wilder-smoothed.
#[derive(Debug, Clone)]
struct AdxStream {
    period: usize,
    di: DiStream,
    dx_seen: usize,
    dx_acc: f64,
    value: Option<f64>,
}

impl AdxStream {
    fn new(period: usize) -> Self {
        Self {
            period,
            di: DiStream::new(period),
            dx_seen: 0,
            dx_acc: 0.0,
            value: None,
        }
    }

    fn update(&mut self, tr: f64, plus_dm: f64, minus_dm: f64) -> Option<f64> {
        let (di_plus, di_minus) = self.di.update(tr, plus_dm, minus_dm)?;
        let denom = di_plus + di_minus;
        let dx = if denom > 0.0 {
            100.0 * (di_plus - di_minus).abs() / denom
        } else {
            0.0
        };

        let p = self.period as f64;
        match self.value {
            None => {
                self.dx_seen += 1;
                self.dx_acc += dx;
                if self.dx_seen == self.period {
                    self.value = Some(self.dx_acc / p);
                }
            }
            Some(prev) => {
                self.value = Some((prev * (p - 1.0) + dx) / p);
            }
        }
        self.value
    }

    fn reset(&mut self) {
        *self = Self::new(self.period);
    }
}

/// Streaming ADX / DI+ / DI- / ATR engine over a candle feed.
///
/// DI+ and DI- run at their own configured periods (the system allows them
/// to differ from the ADX period); ADX derives its DX internally at
/// `adx_period`. Until every stream is warm the engine returns snapshots
/// with `valid = false`; it never raises on insufficient data.
#[derive(Debug, Clone)]
pub struct IndicatorEngine {
    prev: Option<Candle>,
    adx: AdxStream,
    di_plus: DiStream,
    di_minus: DiStream,
    atr: AtrStream,
    candles_seen: usize,
}

impl IndicatorEngine {
    pub fn new(params: &ParameterSet) -> Self {
        Self {
            prev: None,
            adx: AdxStream::new(params.adx_period),
            di_plus: DiStream::new(params.di_plus_period),
            di_minus: DiStream::new(params.di_minus_period),
            atr: AtrStream::new(params.atr_period),
            candles_seen: 0,
        }
    }

    /// Number of candles required before snapshots become valid.
    pub fn warmup_len(&self) -> usize {
        // The first candle only seeds the previous close; ADX then needs
        // `period` deltas for its first DI and `period` DX values on top,
        // the last of which land on the same delta.
        let adx_warm = 2 * self.adx.period;
        let di_warm = self.di_plus.period.max(self.di_minus.period) + 1;
        let atr_warm = self.atr.period + 1;
        adx_warm.max(di_warm).max(atr_warm)
    }

    pub fn candles_seen(&self) -> usize {
        self.candles_seen
    }

    /// Feed one candle, returning the snapshot for its close time.
    pub fn update(&mut self, candle: &Candle) -> IndicatorSnapshot {
        self.candles_seen += 1;
        let Some(prev) = self.prev.replace(*candle) else {
            return IndicatorSnapshot::unready(candle.open_time);
        };

        let tr = true_range(candle, prev.close);
        let (plus_dm, minus_dm) = directional_movement(&prev, candle);

        let adx = self.adx.update(tr, plus_dm, minus_dm);
        let di_p = self.di_plus.update(tr, plus_dm, minus_dm).map(|(p, _)| p);
        let di_m = self.di_minus.update(tr, plus_dm, minus_dm).map(|(_, m)| m);
        let atr = self.atr.update(tr);

        match (adx, di_p, di_m, atr) {
            (Some(adx), Some(di_plus), Some(di_minus), Some(atr)) => IndicatorSnapshot {
                adx,
                di_plus,
                di_minus,
                atr,
                timestamp: candle.open_time,
                valid: true,
            },
            _ => IndicatorSnapshot::unready(candle.open_time),
        }
    }

    /// Drop all accumulated state. Called after a gap in the candle
    /// sequence so smoothing never bridges missing data.
    pub fn reset(&mut self) {
        self.prev = None;
        self.candles_seen = 0;
        self.adx.reset();
        self.di_plus.reset();
        self.di_minus.reset();
        self.atr.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn candle(i: usize, open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time: Utc.timestamp_opt(1_700_000_000 + i as i64 * 3600, 0).unwrap(),
            open,
            high,
            low,
            close,
            volume: 1_000.0,
        }
    }

    /// Deterministic 100-candle fixture: a wavy series with a trend leg.
    fn fixture(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + i as f64 * 0.3 + (i as f64 * 0.7).sin() * 2.0;
                let high = base + 1.2 + (i as f64 * 1.3).cos().abs();
                let low = base - 1.2 - (i as f64 * 0.9).sin().abs();
                candle(i, base - 0.2, high, low, base + 0.2)
            })
            .collect()
    }

    /// Straightforward batch Wilder reference: plain vectors, no streaming
    /// state. Returns per-candle (adx, di_plus, di_minus, atr) options.
    #[allow(clippy::type_complexity)]
    fn batch_reference(
        candles: &[Candle],
        period: usize,
    ) -> Vec<(Option<f64>, Option<f64>, Option<f64>, Option<f64>)> {
        let n = candles.len();
        let mut out = vec![(None, None, None, None); n];
        if n < 2 {
            return out;
        }

        let mut tr = Vec::with_capacity(n - 1);
        let mut pdm = Vec::with_capacity(n - 1);
        let mut mdm = Vec::with_capacity(n - 1);
        for i in 1..n {
            tr.push(true_range(&candles[i], candles[i - 1].close));
            let (p, m) = directional_movement(&candles[i - 1], &candles[i]);
            pdm.push(p);
            mdm.push(m);
        }

        let p = period as f64;
        let mut s_tr = 0.0;
        let mut s_p = 0.0;
        let mut s_m = 0.0;
        let mut atr = 0.0;
        let mut dx_hist: Vec<f64> = Vec::new();
        let mut adx: Option<f64> = None;

        for t in 0..tr.len() {
            if t < period {
                s_tr += tr[t];
                s_p += pdm[t];
                s_m += mdm[t];
                atr += tr[t];
                if t + 1 < period {
                    continue;
                }
                if t + 1 == period {
                    atr /= p;
                }
            } else {
                s_tr = s_tr - s_tr / p + tr[t];
                s_p = s_p - s_p / p + pdm[t];
                s_m = s_m - s_m / p + mdm[t];
                atr = (atr * (p - 1.0) + tr[t]) / p;
            }

            let di_p = if s_tr > 0.0 { 100.0 * s_p / s_tr } else { 0.0 };
            let di_m = if s_tr > 0.0 { 100.0 * s_m / s_tr } else { 0.0 };
            let dx = if di_p + di_m > 0.0 {
                100.0 * (di_p - di_m).abs() / (di_p + di_m)
            } else {
                0.0
            };
            dx_hist.push(dx);

            adx = match adx {
                None if dx_hist.len() == period => {
                    Some(dx_hist.iter().sum::<f64>() / p)
                }
                None => None,
                Some(prev) => Some((prev * (p - 1.0) + dx) / p),
            };

            out[t + 1] = (adx, Some(di_p), Some(di_m), Some(atr));
        }
        out
    }

    #[test]
    fn snapshots_invalid_until_window_filled() {
        let params = ParameterSet::default();
        let mut engine = IndicatorEngine::new(&params);
        let warm = engine.warmup_len();

        for (i, c) in fixture(warm + 10).iter().enumerate() {
            let snap = engine.update(c);
            if i + 1 < warm {
                assert!(!snap.valid, "snapshot valid too early at candle {i}");
            } else {
                assert!(snap.valid, "snapshot still invalid at candle {i}");
            }
        }
    }

    #[test]
    fn streaming_matches_batch_reference_within_tolerance() {
        let period = 14;
        let params = ParameterSet {
            adx_period: period,
            di_plus_period: period,
            di_minus_period: period,
            atr_period: period,
            ..ParameterSet::default()
        };
        let candles = fixture(100);
        let reference = batch_reference(&candles, period);

        let mut engine = IndicatorEngine::new(&params);
        for (i, c) in candles.iter().enumerate() {
            let snap = engine.update(c);
            if !snap.valid {
                continue;
            }
            let (Some(adx), Some(di_p), Some(di_m), Some(atr)) = reference[i] else {
                panic!("streaming valid before batch reference at candle {i}");
            };
            assert!((snap.adx - adx).abs() < 1e-6, "adx mismatch at {i}");
            assert!((snap.di_plus - di_p).abs() < 1e-6, "di+ mismatch at {i}");
            assert!((snap.di_minus - di_m).abs() < 1e-6, "di- mismatch at {i}");
            assert!((snap.atr - atr).abs() < 1e-6, "atr mismatch at {i}");
        }
    }

    #[test]
    fn uptrend_pushes_di_plus_above_di_minus() {
        let params = ParameterSet::default();
        let mut engine = IndicatorEngine::new(&params);
        let mut last = IndicatorSnapshot::unready(Utc::now());
        for i in 0..60 {
            let base = 100.0 + i as f64 * 2.0;
            last = engine.update(&candle(i, base, base + 2.0, base - 0.5, base + 1.5));
        }
        assert!(last.valid);
        assert!(last.di_plus > last.di_minus);
        assert!(last.adx > 25.0, "steady uptrend should read as a strong trend");
    }

    #[test]
    fn reset_clears_warmth() {
        let params = ParameterSet::default();
        let mut engine = IndicatorEngine::new(&params);
        for c in fixture(engine.warmup_len() + 5) {
            engine.update(&c);
        }
        engine.reset();
        let snap = engine.update(&candle(0, 100.0, 101.0, 99.0, 100.5));
        assert!(!snap.valid);
        assert_eq!(engine.candles_seen(), 1);
    }

    #[test]
    fn constant_prices_yield_zero_directional_movement() {
        let params = ParameterSet {
            adx_period: 3,
            di_plus_period: 3,
            di_minus_period: 3,
            atr_period: 3,
            ..ParameterSet::default()
        };
        let mut engine = IndicatorEngine::new(&params);
        let mut last = IndicatorSnapshot::unready(Utc::now());
        for i in 0..20 {
            last = engine.update(&candle(i, 100.0, 100.0, 100.0, 100.0));
        }
        assert!(last.valid);
        assert_eq!(last.di_plus, 0.0);
        assert_eq!(last.di_minus, 0.0);
        assert_eq!(last.adx, 0.0);
    }
}
