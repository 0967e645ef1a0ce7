//! Bounded per-model prediction log.
//!
//! Recording is best-effort from the serving path and feeds pagination,
//! feedback attachment, and the drift/health monitor's recent windows.

use dashmap::DashMap;
use modelforge_core::{
    ForgeError, ModelId, PredictionFeedback, PredictionId, PredictionRecord, Result,
};
use std::collections::VecDeque;

pub struct PredictionLog {
    per_model: DashMap<ModelId, VecDeque<PredictionRecord>>,
    index: DashMap<PredictionId, ModelId>,
    capacity: usize,
}

impl PredictionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            per_model: DashMap::new(),
            index: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, record: PredictionRecord) {
        self.index.insert(record.id, record.model_id);
        let mut log = self.per_model.entry(record.model_id).or_default();
        if log.len() >= self.capacity {
            if let Some(evicted) = log.pop_front() {
                self.index.remove(&evicted.id);
            }
        }
        log.push_back(record);
    }

    /// Newest-first page of a model's predictions.
    pub fn list(
        &self,
        model_id: ModelId,
        page: usize,
        per_page: usize,
    ) -> (Vec<PredictionRecord>, usize) {
        let Some(log) = self.per_model.get(&model_id) else {
            return (Vec::new(), 0);
        };
        let total = log.len();
        let items = log
            .iter()
            .rev()
            .skip(page.saturating_mul(per_page))
            .take(per_page)
            .cloned()
            .collect();
        (items, total)
    }

    /// The most recent `n` predictions, oldest first.
    pub fn recent(&self, model_id: ModelId, n: usize) -> Vec<PredictionRecord> {
        self.per_model
            .get(&model_id)
            .map(|log| {
                let skip = log.len().saturating_sub(n);
                log.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub fn attach_feedback(
        &self,
        prediction_id: PredictionId,
        feedback: PredictionFeedback,
    ) -> Result<PredictionRecord> {
        let model_id = self
            .index
            .get(&prediction_id)
            .map(|m| *m)
            .ok_or_else(|| ForgeError::NotFound(format!("prediction {prediction_id} not found")))?;
        let mut log = self
            .per_model
            .get_mut(&model_id)
            .ok_or_else(|| ForgeError::NotFound(format!("prediction {prediction_id} not found")))?;
        let record = log
            .iter_mut()
            .find(|r| r.id == prediction_id)
            .ok_or_else(|| ForgeError::NotFound(format!("prediction {prediction_id} not found")))?;
        record.feedback = Some(feedback);
        Ok(record.clone())
    }

    pub fn get(&self, prediction_id: PredictionId) -> Result<PredictionRecord> {
        let model_id = self
            .index
            .get(&prediction_id)
            .map(|m| *m)
            .ok_or_else(|| ForgeError::NotFound(format!("prediction {prediction_id} not found")))?;
        self.per_model
            .get(&model_id)
            .and_then(|log| log.iter().find(|r| r.id == prediction_id).cloned())
            .ok_or_else(|| ForgeError::NotFound(format!("prediction {prediction_id} not found")))
    }

    pub fn total_recorded(&self) -> usize {
        self.per_model.iter().map(|l| l.len()).sum()
    }
}
