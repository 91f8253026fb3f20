use rand::Rng;

use common::{ParameterBounds, ParameterSet};

/// Number of tunable dimensions in a `ParameterSet`.
pub const DIM: usize = 7;

/// Maps between `ParameterSet` and the unit hypercube the surrogate model
/// works in. Integer dimensions round on the way out, so two nearby cube
/// points can map to the same candidate set.
#[derive(Debug, Clone)]
pub struct SearchSpace {
    bounds: ParameterBounds,
}

impl SearchSpace {
    pub fn new(bounds: ParameterBounds) -> Self {
        Self { bounds }
    }

    pub fn bounds(&self) -> &ParameterBounds {
        &self.bounds
    }

    pub fn sample(&self, rng: &mut impl Rng) -> [f64; DIM] {
        let mut point = [0.0; DIM];
        for x in &mut point {
            *x = rng.gen::<f64>();
        }
        point
    }

    pub fn decode(&self, point: &[f64; DIM]) -> ParameterSet {
        let period = |u: f64| {
            let lo = *self.bounds.period.start() as f64;
            let hi = *self.bounds.period.end() as f64;
            (lo + u.clamp(0.0, 1.0) * (hi - lo)).round() as usize
        };
        let scale = |u: f64, lo: f64, hi: f64| lo + u.clamp(0.0, 1.0) * (hi - lo);

        ParameterSet {
            adx_period: period(point[0]),
            adx_threshold: scale(
                point[1],
                *self.bounds.threshold.start(),
                *self.bounds.threshold.end(),
            ),
            di_plus_period: period(point[2]),
            di_minus_period: period(point[3]),
            atr_period: period(point[4]),
            stop_multiplier: scale(
                point[5],
                *self.bounds.multiplier.start(),
                *self.bounds.multiplier.end(),
            ),
            gain_multiplier: scale(
                point[6],
                *self.bounds.multiplier.start(),
                *self.bounds.multiplier.end(),
            ),
        }
    }

    pub fn encode(&self, set: &ParameterSet) -> [f64; DIM] {
        let period = |v: usize| {
            let lo = *self.bounds.period.start() as f64;
            let hi = *self.bounds.period.end() as f64;
            ((v as f64 - lo) / (hi - lo)).clamp(0.0, 1.0)
        };
        let unscale = |v: f64, lo: f64, hi: f64| ((v - lo) / (hi - lo)).clamp(0.0, 1.0);

        [
            period(set.adx_period),
            unscale(
                set.adx_threshold,
                *self.bounds.threshold.start(),
                *self.bounds.threshold.end(),
            ),
            period(set.di_plus_period),
            period(set.di_minus_period),
            period(set.atr_period),
            unscale(
                set.stop_multiplier,
                *self.bounds.multiplier.start(),
                *self.bounds.multiplier.end(),
            ),
            unscale(
                set.gain_multiplier,
                *self.bounds.multiplier.start(),
                *self.bounds.multiplier.end(),
            ),
        ]
    }
}
