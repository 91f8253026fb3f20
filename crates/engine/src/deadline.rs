//! Bounded-latency calls into the ML collaborators.
//!
//! Inference runs on a long-lived worker thread; the caller waits with
//! `recv_timeout`. `None` means the deadline elapsed and the decision path
//! applies its degraded behavior (baseline parameters for the classifier,
//! rejection for the filter) instead of stalling the candle loop. A lane
//! that misses its deadline is abandoned and a fresh one is spawned on the
//! next call, so a hung model costs at most one thread per hang and its
//! late answer can never be mistaken for a fresh one.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use common::{FeatureVector, RegimeCall, Signal, SignalScore};
use ml::{RegimeClassifier, SignalQualityFilter};

enum Request {
    Classify(FeatureVector),
    Score(FeatureVector, Signal),
}

enum Response {
    Regime(RegimeCall),
    Quality(SignalScore),
}

struct Lane {
    request_tx: Sender<Request>,
    response_rx: Receiver<Response>,
}

/// Deadline-bounded front for the classifier and the signal filter.
pub struct InferenceWorker {
    classifier: Arc<RegimeClassifier>,
    filter: Arc<SignalQualityFilter>,
    deadline: Duration,
    lane: Mutex<Option<Lane>>,
}

impl InferenceWorker {
    pub fn new(
        classifier: Arc<RegimeClassifier>,
        filter: Arc<SignalQualityFilter>,
        deadline: Duration,
    ) -> Self {
        Self {
            classifier,
            filter,
            deadline,
            lane: Mutex::new(None),
        }
    }

    pub fn classify(&self, features: &FeatureVector) -> Option<RegimeCall> {
        match self.request(Request::Classify(*features))? {
            Response::Regime(call) => Some(call),
            // A lane never has more than one request in flight, so the
            // variants always match.
            Response::Quality(_) => None,
        }
    }

    pub fn score(&self, features: &FeatureVector, signal: &Signal) -> Option<SignalScore> {
        match self.request(Request::Score(*features, *signal))? {
            Response::Quality(score) => Some(score),
            Response::Regime(_) => None,
        }
    }

    fn request(&self, request: Request) -> Option<Response> {
        let mut slot = self.lane.lock().expect("inference lane poisoned");
        let lane = slot.take().unwrap_or_else(|| self.spawn_lane());
        if lane.request_tx.send(request).is_err() {
            return None;
        }
        match lane.response_rx.recv_timeout(self.deadline) {
            Ok(response) => {
                *slot = Some(lane);
                Some(response)
            }
            // Deadline elapsed or the worker died. Dropping the lane lets
            // the stuck thread exit once its model call returns.
            Err(_) => None,
        }
    }

    fn spawn_lane(&self) -> Lane {
        let (request_tx, request_rx) = mpsc::channel::<Request>();
        let (response_tx, response_rx) = mpsc::channel::<Response>();
        let classifier = self.classifier.clone();
        let filter = self.filter.clone();
        thread::spawn(move || {
            while let Ok(request) = request_rx.recv() {
                let response = match request {
                    Request::Classify(features) => {
                        Response::Regime(classifier.classify(&features))
                    }
                    Request::Score(features, signal) => {
                        Response::Quality(filter.score(&features, &signal))
                    }
                };
                if response_tx.send(response).is_err() {
                    break;
                }
            }
        });
        Lane {
            request_tx,
            response_rx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use common::{Direction, FeatureVector, IndicatorSnapshot, RegimeLabel};
    use ml::{FilterModel, RegimeModel};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct SlowRegimeModel(Duration);

    impl RegimeModel for SlowRegimeModel {
        fn predict(&self, _features: &FeatureVector) -> [f64; 4] {
            thread::sleep(self.0);
            [0.1, 0.7, 0.1, 0.1]
        }
    }

    struct SlowFilterModel(Duration);

    impl FilterModel for SlowFilterModel {
        fn probability(&self, _features: &FeatureVector, _signal: &Signal) -> f64 {
            thread::sleep(self.0);
            0.9
        }
    }

    /// Sleeps through the first prediction only.
    struct SlowFirstCall(AtomicBool);

    impl RegimeModel for SlowFirstCall {
        fn predict(&self, _features: &FeatureVector) -> [f64; 4] {
            if !self.0.swap(true, Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(300));
            }
            [0.1, 0.7, 0.1, 0.1]
        }
    }

    fn worker(classifier: RegimeClassifier, filter: SignalQualityFilter, ms: u64) -> InferenceWorker {
        InferenceWorker::new(
            Arc::new(classifier),
            Arc::new(filter),
            Duration::from_millis(ms),
        )
    }

    fn features() -> FeatureVector {
        FeatureVector {
            trend_strength: 30.0,
            volatility_ratio: 1.0,
            momentum: 1.0,
            volume_ratio: 1.0,
            ma_spread: 0.1,
        }
    }

    fn signal() -> Signal {
        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        Signal {
            direction: Direction::Long,
            origin_time: ts,
            snapshot: IndicatorSnapshot::unready(ts),
        }
    }

    #[test]
    fn fast_model_answers_within_deadline() {
        let worker = worker(
            RegimeClassifier::new(Arc::new(SlowRegimeModel(Duration::from_millis(1)))),
            SignalQualityFilter::disabled(),
            2_000,
        );
        let call = worker
            .classify(&features())
            .expect("model should answer in time");
        assert_eq!(call.label, RegimeLabel::Uptrend);
    }

    #[test]
    fn slow_classifier_misses_deadline() {
        let worker = worker(
            RegimeClassifier::new(Arc::new(SlowRegimeModel(Duration::from_secs(5)))),
            SignalQualityFilter::disabled(),
            20,
        );
        assert!(worker.classify(&features()).is_none());
    }

    #[test]
    fn slow_filter_misses_deadline() {
        let worker = worker(
            RegimeClassifier::unloaded(),
            SignalQualityFilter::new(Arc::new(SlowFilterModel(Duration::from_secs(5))), 0.65),
            20,
        );
        assert!(worker.score(&features(), &signal()).is_none());
    }

    #[test]
    fn worker_recovers_after_a_missed_deadline() {
        let worker = worker(
            RegimeClassifier::new(Arc::new(SlowFirstCall(AtomicBool::new(false)))),
            SignalQualityFilter::disabled(),
            50,
        );
        assert!(worker.classify(&features()).is_none());
        let call = worker
            .classify(&features())
            .expect("a fresh lane must serve the next call");
        assert_eq!(call.label, RegimeLabel::Uptrend);
    }

    #[test]
    fn consecutive_calls_reuse_the_lane() {
        let worker = worker(
            RegimeClassifier::new(Arc::new(SlowRegimeModel(Duration::from_millis(1)))),
            SignalQualityFilter::disabled(),
            2_000,
        );
        for _ in 0..5 {
            assert!(worker.classify(&features()).is_some());
        }
        assert!(worker.score(&features(), &signal()).is_some());
    }
}
