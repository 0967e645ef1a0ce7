//! A/B coordination between two deployed versions: traffic routing by
//! split percentage, per-side metric accumulation, and a simple winner
//! call once both sides have enough samples.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use modelforge_core::{ForgeError, ModelId, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestSide {
    A,
    B,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbTestConfig {
    pub model_id: ModelId,
    pub version_a: String,
    pub version_b: String,
    /// Percentage of traffic routed to side B, 0..=100.
    pub traffic_to_b: u8,
    pub min_samples: usize,
    /// Metric deciding the winner.
    pub primary_metric: String,
}

#[derive(Debug, Clone)]
struct SideState {
    samples: Vec<HashMap<String, f64>>,
}

#[derive(Debug, Clone)]
struct AbTest {
    config: AbTestConfig,
    side_a: SideState,
    side_b: SideState,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AbSideSummary {
    pub samples: usize,
    pub averages: HashMap<String, f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AbResults {
    pub test_id: String,
    pub version_a: String,
    pub version_b: String,
    pub side_a: AbSideSummary,
    pub side_b: AbSideSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<TestSide>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub started_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct AbCoordinator {
    tests: DashMap<String, AbTest>,
}

fn averages(samples: &[HashMap<String, f64>]) -> HashMap<String, f64> {
    let mut sums: HashMap<String, (f64, usize)> = HashMap::new();
    for sample in samples {
        for (metric, value) in sample {
            let entry = sums.entry(metric.clone()).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
    }
    sums.into_iter()
        .map(|(metric, (sum, count))| (metric, sum / count.max(1) as f64))
        .collect()
}

impl AbCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_test(&self, test_id: &str, config: AbTestConfig) -> Result<()> {
        if config.traffic_to_b > 100 {
            return Err(ForgeError::Validation(
                "traffic split must be within 0..=100".into(),
            ));
        }
        if self.tests.contains_key(test_id) {
            return Err(ForgeError::ConflictOrBusy(format!(
                "A/B test '{test_id}' already exists"
            )));
        }
        info!(
            test_id,
            version_a = %config.version_a,
            version_b = %config.version_b,
            split = config.traffic_to_b,
            "A/B test started"
        );
        self.tests.insert(
            test_id.to_string(),
            AbTest {
                config,
                side_a: SideState { samples: Vec::new() },
                side_b: SideState { samples: Vec::new() },
                started_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Per-request routing decision; independent uniform draw per call.
    pub fn route(&self, test_id: &str) -> Result<TestSide> {
        let test = self
            .tests
            .get(test_id)
            .ok_or_else(|| ForgeError::NotFound(format!("A/B test '{test_id}' not found")))?;
        let draw: u8 = rand::rng().random_range(0..100);
        Ok(if draw < test.config.traffic_to_b {
            TestSide::B
        } else {
            TestSide::A
        })
    }

    pub fn version_for(&self, test_id: &str, side: TestSide) -> Result<String> {
        let test = self
            .tests
            .get(test_id)
            .ok_or_else(|| ForgeError::NotFound(format!("A/B test '{test_id}' not found")))?;
        Ok(match side {
            TestSide::A => test.config.version_a.clone(),
            TestSide::B => test.config.version_b.clone(),
        })
    }

    pub fn record_result(
        &self,
        test_id: &str,
        side: TestSide,
        metrics: HashMap<String, f64>,
    ) -> Result<()> {
        let mut test = self
            .tests
            .get_mut(test_id)
            .ok_or_else(|| ForgeError::NotFound(format!("A/B test '{test_id}' not found")))?;
        match side {
            TestSide::A => test.side_a.samples.push(metrics),
            TestSide::B => test.side_b.samples.push(metrics),
        }
        Ok(())
    }

    pub fn results(&self, test_id: &str) -> Result<AbResults> {
        let test = self
            .tests
            .get(test_id)
            .ok_or_else(|| ForgeError::NotFound(format!("A/B test '{test_id}' not found")))?;
        Ok(Self::summarize(test_id, &test))
    }

    /// Finalize and remove the test, returning the closing results.
    pub fn stop_test(&self, test_id: &str) -> Result<AbResults> {
        let (_, test) = self
            .tests
            .remove(test_id)
            .ok_or_else(|| ForgeError::NotFound(format!("A/B test '{test_id}' not found")))?;
        info!(test_id, "A/B test stopped");
        Ok(Self::summarize(test_id, &test))
    }

    pub fn active_count(&self) -> usize {
        self.tests.len()
    }

    fn summarize(test_id: &str, test: &AbTest) -> AbResults {
        let avg_a = averages(&test.side_a.samples);
        let avg_b = averages(&test.side_b.samples);

        let metric = &test.config.primary_metric;
        let enough = test.side_a.samples.len() >= test.config.min_samples
            && test.side_b.samples.len() >= test.config.min_samples;
        let (winner, confidence) = match (enough, avg_a.get(metric), avg_b.get(metric)) {
            (true, Some(&a), Some(&b)) if a != b => {
                let winner = if a > b { TestSide::A } else { TestSide::B };
                let denom = a.abs().max(b.abs()).max(f64::EPSILON);
                let confidence = (0.5 + (a - b).abs() / denom / 2.0).min(0.99);
                (Some(winner), Some(confidence))
            }
            _ => (None, None),
        };

        AbResults {
            test_id: test_id.to_string(),
            version_a: test.config.version_a.clone(),
            version_b: test.config.version_b.clone(),
            side_a: AbSideSummary {
                samples: test.side_a.samples.len(),
                averages: avg_a,
            },
            side_b: AbSideSummary {
                samples: test.side_b.samples.len(),
                averages: avg_b,
            },
            winner,
            confidence,
            started_at: test.started_at,
        }
    }
}
