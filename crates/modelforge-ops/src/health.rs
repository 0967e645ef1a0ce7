//! Per-model serving health: latency percentiles, throughput, a
//! concurrency estimate from overlapping processing windows, and accuracy
//! from feedback-carrying predictions.

use chrono::{Duration as ChronoDuration, Utc};
use modelforge_core::ModelId;
use modelforge_serve::PredictionLog;
use serde::Serialize;
use std::sync::Arc;

const WINDOW_SECONDS: i64 = 60;
const SAMPLE_WINDOW: usize = 1_000;

#[derive(Debug, Clone, Serialize)]
pub struct LatencySummary {
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub mean_ms: f64,
    pub max_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelHealthReport {
    pub model_id: ModelId,
    pub sample_count: usize,
    pub latency: Option<LatencySummary>,
    /// Requests per second over the trailing 60-second window.
    pub throughput_rps: f64,
    /// Mean number of requests in flight, estimated from the total busy
    /// time inside the window.
    pub concurrency_estimate: f64,
    /// Fraction of feedback-carrying predictions marked correct.
    pub accuracy: Option<f64>,
    pub level: HealthLevel,
}

pub struct HealthMonitor {
    log: Arc<PredictionLog>,
    /// Latency above this p95 marks the model degraded.
    pub degraded_p95_ms: u64,
    /// Accuracy below this marks the model unhealthy.
    pub unhealthy_accuracy: f64,
}

impl HealthMonitor {
    pub fn new(log: Arc<PredictionLog>) -> Self {
        Self {
            log,
            degraded_p95_ms: 1_000,
            unhealthy_accuracy: 0.5,
        }
    }

    pub fn report(&self, model_id: ModelId) -> ModelHealthReport {
        let recent = self.log.recent(model_id, SAMPLE_WINDOW);
        let sample_count = recent.len();

        let mut latencies: Vec<u64> = recent.iter().map(|r| r.processing_ms).collect();
        latencies.sort_unstable();
        let latency = (!latencies.is_empty()).then(|| LatencySummary {
            p50_ms: percentile(&latencies, 50.0),
            p95_ms: percentile(&latencies, 95.0),
            p99_ms: percentile(&latencies, 99.0),
            mean_ms: latencies.iter().sum::<u64>() as f64 / latencies.len() as f64,
            max_ms: *latencies.last().unwrap(),
        });

        let window_start = Utc::now() - ChronoDuration::seconds(WINDOW_SECONDS);
        let in_window: Vec<_> = recent
            .iter()
            .filter(|r| r.created_at >= window_start)
            .collect();
        let throughput_rps = in_window.len() as f64 / WINDOW_SECONDS as f64;
        let busy_ms: u64 = in_window.iter().map(|r| r.processing_ms).sum();
        let concurrency_estimate = busy_ms as f64 / (WINDOW_SECONDS * 1_000) as f64;

        let with_feedback: Vec<_> = recent
            .iter()
            .filter_map(|r| r.feedback.as_ref())
            .filter_map(|f| f.is_correct)
            .collect();
        let accuracy = (!with_feedback.is_empty()).then(|| {
            with_feedback.iter().filter(|&&correct| correct).count() as f64
                / with_feedback.len() as f64
        });

        let level = self.classify(&latency, accuracy);
        ModelHealthReport {
            model_id,
            sample_count,
            latency,
            throughput_rps,
            concurrency_estimate,
            accuracy,
            level,
        }
    }

    fn classify(&self, latency: &Option<LatencySummary>, accuracy: Option<f64>) -> HealthLevel {
        if let Some(acc) = accuracy {
            if acc < self.unhealthy_accuracy {
                return HealthLevel::Unhealthy;
            }
        }
        if let Some(lat) = latency {
            if lat.p95_ms > self.degraded_p95_ms {
                return HealthLevel::Degraded;
            }
        }
        HealthLevel::Healthy
    }
}

fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let pos = (p / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted[pos.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use modelforge_core::{PredictionFeedback, PredictionOutput, PredictionRecord, Row};
    use uuid::Uuid;

    fn record(model_id: ModelId, latency: u64, correct: Option<bool>) -> PredictionRecord {
        let id = Uuid::new_v4();
        PredictionRecord {
            id,
            model_id,
            version: "1.0.0".into(),
            input: Row::new(),
            output: PredictionOutput {
                prediction: serde_json::json!(1),
                confidence: 0.9,
                probabilities: None,
                metadata: None,
            },
            processing_ms: latency,
            created_at: Utc::now(),
            feedback: correct.map(|is_correct| PredictionFeedback {
                prediction_id: id,
                actual_value: serde_json::json!(1),
                is_correct: Some(is_correct),
                comment: None,
                provided_by: None,
                submitted_at: Utc::now(),
            }),
        }
    }

    #[test]
    fn empty_log_is_healthy_with_no_latency() {
        let log = Arc::new(PredictionLog::new(100));
        let monitor = HealthMonitor::new(log);
        let report = monitor.report(Uuid::new_v4());
        assert_eq!(report.sample_count, 0);
        assert!(report.latency.is_none());
        assert_eq!(report.level, HealthLevel::Healthy);
    }

    #[test]
    fn percentiles_and_throughput_reflect_the_window() {
        let log = Arc::new(PredictionLog::new(1000));
        let model = Uuid::new_v4();
        for latency in [10, 20, 30, 40, 50, 60, 70, 80, 90, 600] {
            log.record(record(model, latency, None));
        }
        let monitor = HealthMonitor::new(log);
        let report = monitor.report(model);
        let latency = report.latency.unwrap();
        assert_eq!(latency.max_ms, 600);
        assert!(latency.p50_ms <= latency.p95_ms);
        assert!(latency.p95_ms <= latency.p99_ms);
        assert!(report.throughput_rps > 0.0);
        assert!(report.concurrency_estimate > 0.0);
    }

    #[test]
    fn poor_feedback_accuracy_is_unhealthy() {
        let log = Arc::new(PredictionLog::new(100));
        let model = Uuid::new_v4();
        for _ in 0..8 {
            log.record(record(model, 10, Some(false)));
        }
        log.record(record(model, 10, Some(true)));
        let monitor = HealthMonitor::new(log);
        let report = monitor.report(model);
        assert!(report.accuracy.unwrap() < 0.5);
        assert_eq!(report.level, HealthLevel::Unhealthy);
    }

    #[test]
    fn slow_p95_degrades() {
        let log = Arc::new(PredictionLog::new(100));
        let model = Uuid::new_v4();
        for _ in 0..20 {
            log.record(record(model, 2_000, None));
        }
        let monitor = HealthMonitor::new(log);
        assert_eq!(monitor.report(model).level, HealthLevel::Degraded);
    }
}
