//! Deployment control: a per-deployment state machine
//! (pending → deploying → deployed | failed | rolling_back → rolled_back)
//! with immediate, rolling, canary and blue-green strategies, health-check
//! gating, and automatic rollback to the previous version by creation time.

use crate::health::{HealthMonitor, LatencySummary};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use modelforge_core::config::DeploymentSettings;
use modelforge_core::{ForgeError, ModelId, ModelStatus, Result, VersionStage};
use modelforge_registry::ModelRegistry;
use modelforge_serve::PredictionLog;
use modelforge_storage::StorageBackend;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Immediate,
    Rolling,
    Canary,
    BlueGreen,
}

impl Strategy {
    pub fn parse(name: &str) -> Strategy {
        match name {
            "rolling" => Strategy::Rolling,
            "canary" => Strategy::Canary,
            "blue_green" => Strategy::BlueGreen,
            _ => Strategy::Immediate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployState {
    Pending,
    Deploying,
    Deployed,
    Failed,
    RollingBack,
    RolledBack,
    Cancelled,
}

impl DeployState {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            DeployState::Deployed
                | DeployState::Failed
                | DeployState::RolledBack
                | DeployState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessCriteria {
    pub max_error_rate: f64,
    pub max_p95_ms: u64,
    pub min_requests: usize,
}

impl Default for SuccessCriteria {
    fn default() -> Self {
        Self {
            max_error_rate: 0.1,
            max_p95_ms: 2_000,
            min_requests: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryConfig {
    pub traffic_percent: u8,
    pub duration_ms: u64,
    pub criteria: SuccessCriteria,
    pub auto_promote: bool,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            traffic_percent: 10,
            duration_ms: 60_000,
            criteria: SuccessCriteria::default(),
            auto_promote: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlueGreenConfig {
    pub warmup_ms: u64,
    /// Minimum health-check pass rate before traffic switches.
    pub switch_threshold: f64,
    pub retain_old_ms: u64,
}

impl Default for BlueGreenConfig {
    fn default() -> Self {
        Self {
            warmup_ms: 30_000,
            switch_threshold: 0.9,
            retain_old_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollingConfig {
    pub instance_count: usize,
}

impl Default for RollingConfig {
    fn default() -> Self {
        Self { instance_count: 3 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOp {
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricTrigger {
    /// One of error_rate, p95_ms, accuracy.
    pub metric: String,
    pub threshold: f64,
    pub operator: TriggerOp,
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CheckKind {
    ModelAvailability,
    PredictionLatency { max_p95_ms: u64 },
    ErrorRate { max_rate: f64 },
    ResourceUsage { max_memory_bytes: u64 },
    DataQuality { max_missing_rate: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    pub strategy: Strategy,
    pub stage: VersionStage,
    #[serde(default)]
    pub rolling: RollingConfig,
    #[serde(default)]
    pub canary: CanaryConfig,
    #[serde(default)]
    pub blue_green: BlueGreenConfig,
    #[serde(default = "default_checks")]
    pub health_checks: Vec<CheckKind>,
    pub rollback_enabled: bool,
    #[serde(default)]
    pub rollback_triggers: Vec<MetricTrigger>,
}

fn default_checks() -> Vec<CheckKind> {
    vec![
        CheckKind::ModelAvailability,
        CheckKind::PredictionLatency { max_p95_ms: 2_000 },
        CheckKind::ErrorRate { max_rate: 0.2 },
    ]
}

impl DeployConfig {
    pub fn from_settings(settings: &DeploymentSettings) -> Self {
        Self {
            strategy: Strategy::parse(&settings.default_strategy),
            stage: VersionStage::Production,
            rolling: RollingConfig::default(),
            canary: CanaryConfig {
                traffic_percent: settings.canary_traffic_percent,
                ..CanaryConfig::default()
            },
            blue_green: BlueGreenConfig::default(),
            health_checks: default_checks(),
            rollback_enabled: settings.rollback_enabled,
            rollback_triggers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Deployment {
    pub id: Uuid,
    pub model_id: ModelId,
    pub version: String,
    pub stage: VersionStage,
    pub strategy: Strategy,
    pub state: DeployState,
    /// Monotonic 0..=100.
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub events: Vec<String>,
    pub checks: Vec<CheckResult>,
}

pub struct DeploymentController {
    registry: Arc<ModelRegistry>,
    storage: Arc<dyn StorageBackend>,
    monitor: Arc<HealthMonitor>,
    log: Arc<PredictionLog>,
    deployments: DashMap<Uuid, Deployment>,
    active: DashMap<ModelId, Uuid>,
}

impl DeploymentController {
    pub fn new(
        registry: Arc<ModelRegistry>,
        storage: Arc<dyn StorageBackend>,
        monitor: Arc<HealthMonitor>,
        log: Arc<PredictionLog>,
    ) -> Self {
        Self {
            registry,
            storage,
            monitor,
            log,
            deployments: DashMap::new(),
            active: DashMap::new(),
        }
    }

    pub fn get(&self, deployment_id: Uuid) -> Result<Deployment> {
        self.deployments
            .get(&deployment_id)
            .map(|d| d.clone())
            .ok_or_else(|| ForgeError::NotFound(format!("deployment {deployment_id} not found")))
    }

    /// The last deployment for a model that reached `deployed`.
    pub fn get_active(&self, model_id: ModelId) -> Option<Deployment> {
        self.active
            .get(&model_id)
            .and_then(|id| self.deployments.get(&id).map(|d| d.clone()))
    }

    /// Cancel a deployment that has not reached a terminal state.
    pub fn cancel(&self, deployment_id: Uuid) -> Result<Deployment> {
        let mut deployment = self
            .deployments
            .get_mut(&deployment_id)
            .ok_or_else(|| ForgeError::NotFound(format!("deployment {deployment_id} not found")))?;
        if deployment.state.is_terminal() {
            return Err(ForgeError::ConflictOrBusy(format!(
                "deployment {deployment_id} is already {:?}",
                deployment.state
            )));
        }
        deployment.state = DeployState::Cancelled;
        deployment.updated_at = Utc::now();
        deployment.events.push("cancelled by request".into());
        Ok(deployment.clone())
    }

    /// Run a deployment to completion and return its final record.
    pub async fn deploy(
        &self,
        model_id: ModelId,
        version: &str,
        config: &DeployConfig,
    ) -> Result<Deployment> {
        let record = self.registry.get(model_id)?;
        if record.status != ModelStatus::Ready {
            return Err(ForgeError::Validation(format!(
                "model {model_id} is not ready to deploy"
            )));
        }
        if record.version(version).is_none() {
            return Err(ForgeError::NotFound(format!(
                "version {version} of model {model_id} not found"
            )));
        }

        let deployment_id = Uuid::new_v4();
        self.deployments.insert(
            deployment_id,
            Deployment {
                id: deployment_id,
                model_id,
                version: version.to_string(),
                stage: config.stage,
                strategy: config.strategy,
                state: DeployState::Pending,
                progress: 0,
                created_at: Utc::now(),
                updated_at: Utc::now(),
                error: None,
                events: vec![format!("created with {:?} strategy", config.strategy)],
                checks: Vec::new(),
            },
        );
        info!(model_id = %model_id, version, strategy = ?config.strategy, "deployment started");

        let outcome = self.execute(deployment_id, model_id, version, config).await;
        match outcome {
            Ok(()) => {
                self.transition(deployment_id, DeployState::Deployed, 100, "deployed");
                self.registry.promote(model_id, version, config.stage)?;
                self.active.insert(model_id, deployment_id);
                self.get(deployment_id)
            }
            Err(err) if self.cancelled(deployment_id) => {
                warn!(model_id = %model_id, error = %err, "deployment cancelled");
                self.get(deployment_id)
            }
            Err(err) => {
                warn!(model_id = %model_id, error = %err, "deployment failed");
                self.record_error(deployment_id, &err);
                if config.rollback_enabled {
                    self.transition(
                        deployment_id,
                        DeployState::RollingBack,
                        self.progress_of(deployment_id),
                        "rolling back after failure",
                    );
                    match self.rollback_internal(model_id, config.stage).await {
                        Ok(rollback) => {
                            self.transition(
                                deployment_id,
                                DeployState::RolledBack,
                                self.progress_of(deployment_id),
                                &format!("rolled back via deployment {}", rollback.id),
                            );
                        }
                        Err(rollback_err) => {
                            self.transition(
                                deployment_id,
                                DeployState::Failed,
                                self.progress_of(deployment_id),
                                &format!("rollback unavailable: {rollback_err}"),
                            );
                        }
                    }
                } else {
                    self.transition(
                        deployment_id,
                        DeployState::Failed,
                        self.progress_of(deployment_id),
                        "failed",
                    );
                }
                Err(err)
            }
        }
    }

    /// Explicit rollback: redeploy the previous version with the
    /// immediate strategy at the currently active stage.
    pub async fn rollback(&self, model_id: ModelId) -> Result<Deployment> {
        let stage = self
            .get_active(model_id)
            .map(|d| d.stage)
            .unwrap_or(VersionStage::Production);
        self.rollback_internal(model_id, stage).await
    }

    async fn rollback_internal(
        &self,
        model_id: ModelId,
        stage: VersionStage,
    ) -> Result<Deployment> {
        let record = self.registry.get(model_id)?;
        let current = record
            .current_version
            .clone()
            .ok_or_else(|| ForgeError::Validation("model has no deployed version".into()))?;
        let target = self.registry.previous_version(model_id, &current)?;

        let config = DeployConfig {
            strategy: Strategy::Immediate,
            stage,
            rolling: RollingConfig::default(),
            canary: CanaryConfig::default(),
            blue_green: BlueGreenConfig::default(),
            health_checks: vec![CheckKind::ModelAvailability],
            rollback_enabled: false,
            rollback_triggers: Vec::new(),
        };
        info!(model_id = %model_id, from = %current, to = %target.version, "rollback");
        Box::pin(self.deploy(model_id, &target.version, &config)).await
    }

    /// Watch a deployed model's rollback triggers, rolling back
    /// automatically when one fires. The task ends after the first
    /// rollback or once the model no longer has an active deployment.
    pub fn spawn_trigger_monitor(
        self: &Arc<Self>,
        model_id: ModelId,
        triggers: Vec<MetricTrigger>,
        period: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period.max(Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if controller.get_active(model_id).is_none() {
                    return;
                }
                if let Some(metric) = controller.firing_trigger(model_id, &triggers) {
                    warn!(model_id = %model_id, metric, "rollback trigger fired");
                    if let Err(err) = controller.rollback(model_id).await {
                        warn!(model_id = %model_id, error = %err, "automatic rollback failed");
                    }
                    return;
                }
            }
        })
    }

    /// Evaluate rollback triggers against live health; returns the name of
    /// the first firing trigger.
    pub fn firing_trigger(
        &self,
        model_id: ModelId,
        triggers: &[MetricTrigger],
    ) -> Option<String> {
        let report = self.monitor.report(model_id);
        for trigger in triggers {
            let value = match trigger.metric.as_str() {
                "error_rate" => report.accuracy.map(|a| 1.0 - a),
                "p95_ms" => report.latency.as_ref().map(|l| l.p95_ms as f64),
                "accuracy" => report.accuracy,
                _ => None,
            };
            let Some(value) = value else { continue };
            let fired = match trigger.operator {
                TriggerOp::Gt => value > trigger.threshold,
                TriggerOp::Gte => value >= trigger.threshold,
                TriggerOp::Lt => value < trigger.threshold,
                TriggerOp::Lte => value <= trigger.threshold,
            };
            if fired {
                return Some(trigger.metric.clone());
            }
        }
        None
    }

    /// Run the configured health checks for a model version.
    pub async fn run_health_checks(
        &self,
        model_id: ModelId,
        version: &str,
        checks: &[CheckKind],
    ) -> Vec<CheckResult> {
        let mut results = Vec::with_capacity(checks.len());
        for check in checks {
            let started = Instant::now();
            let (name, status, message) = match check {
                CheckKind::ModelAvailability => {
                    let available = self
                        .storage
                        .exists(model_id, version)
                        .await
                        .unwrap_or(false);
                    (
                        "model_availability",
                        if available {
                            CheckStatus::Pass
                        } else {
                            CheckStatus::Fail
                        },
                        if available {
                            "artifacts present".to_string()
                        } else {
                            "manifest missing at canonical location".to_string()
                        },
                    )
                }
                CheckKind::PredictionLatency { max_p95_ms } => {
                    let report = self.monitor.report(model_id);
                    latency_check(report.latency.as_ref(), *max_p95_ms)
                }
                CheckKind::ErrorRate { max_rate } => {
                    let report = self.monitor.report(model_id);
                    match report.accuracy {
                        None => (
                            "error_rate",
                            CheckStatus::Pass,
                            "no feedback yet".to_string(),
                        ),
                        Some(accuracy) => {
                            let error_rate = 1.0 - accuracy;
                            if error_rate > *max_rate {
                                (
                                    "error_rate",
                                    CheckStatus::Fail,
                                    format!("error rate {error_rate:.3} above {max_rate}"),
                                )
                            } else if error_rate > max_rate * 0.8 {
                                (
                                    "error_rate",
                                    CheckStatus::Warn,
                                    format!("error rate {error_rate:.3} approaching {max_rate}"),
                                )
                            } else {
                                (
                                    "error_rate",
                                    CheckStatus::Pass,
                                    format!("error rate {error_rate:.3}"),
                                )
                            }
                        }
                    }
                }
                CheckKind::ResourceUsage { max_memory_bytes } => {
                    resource_check(*max_memory_bytes)
                }
                CheckKind::DataQuality { max_missing_rate } => {
                    let recent = self.log.recent(model_id, 200);
                    let mut fields = 0usize;
                    let mut missing = 0usize;
                    for prediction in &recent {
                        for value in prediction.input.values() {
                            fields += 1;
                            if value.is_absent() {
                                missing += 1;
                            }
                        }
                    }
                    let rate = if fields == 0 {
                        0.0
                    } else {
                        missing as f64 / fields as f64
                    };
                    (
                        "data_quality",
                        if rate > *max_missing_rate {
                            CheckStatus::Fail
                        } else {
                            CheckStatus::Pass
                        },
                        format!("missing-value rate {rate:.3}"),
                    )
                }
            };
            results.push(CheckResult {
                name: name.to_string(),
                status,
                message,
                duration_ms: started.elapsed().as_millis() as u64,
            });
        }
        results
    }

    async fn execute(
        &self,
        deployment_id: Uuid,
        model_id: ModelId,
        version: &str,
        config: &DeployConfig,
    ) -> Result<()> {
        self.transition(deployment_id, DeployState::Deploying, 5, "deploying");

        match config.strategy {
            Strategy::Immediate => {
                self.gate_on_checks(deployment_id, model_id, version, &config.health_checks)
                    .await?;
                self.bump_progress(deployment_id, 90, "health checks passed");
            }
            Strategy::Rolling => {
                let instances = config.rolling.instance_count.max(1);
                let batch = instances.div_ceil(3);
                let mut updated = 0usize;
                while updated < instances {
                    self.ensure_not_cancelled(deployment_id)?;
                    updated = (updated + batch).min(instances);
                    self.gate_on_checks(deployment_id, model_id, version, &config.health_checks)
                        .await?;
                    let progress = 5 + (85 * updated / instances) as u8;
                    self.bump_progress(
                        deployment_id,
                        progress,
                        &format!("{updated}/{instances} instances updated"),
                    );
                }
            }
            Strategy::Canary => {
                self.gate_on_checks(deployment_id, model_id, version, &config.health_checks)
                    .await?;
                self.bump_progress(
                    deployment_id,
                    30,
                    &format!("canary taking {}% of traffic", config.canary.traffic_percent),
                );

                // Monitor the canary window in slices so cancellation and
                // failures surface quickly.
                let slices = 5u64;
                let slice = Duration::from_millis(config.canary.duration_ms / slices.max(1));
                for i in 0..slices {
                    self.ensure_not_cancelled(deployment_id)?;
                    tokio::time::sleep(slice).await;
                    self.bump_progress(
                        deployment_id,
                        30 + (50 * (i + 1) / slices) as u8,
                        "canary window progressing",
                    );
                }

                let report = self.monitor.report(model_id);
                let criteria = &config.canary.criteria;
                let requests = (report.throughput_rps
                    * (config.canary.duration_ms as f64 / 1_000.0))
                    .round() as usize;
                let error_rate = report.accuracy.map(|a| 1.0 - a).unwrap_or(0.0);
                let p95 = report.latency.as_ref().map(|l| l.p95_ms).unwrap_or(0);

                if requests < criteria.min_requests {
                    self.bump_progress(
                        deployment_id,
                        85,
                        "not enough canary traffic, accepting by default",
                    );
                } else if error_rate > criteria.max_error_rate || p95 > criteria.max_p95_ms {
                    return Err(ForgeError::Validation(format!(
                        "canary criteria failed: error rate {error_rate:.3}, p95 {p95}ms"
                    )));
                } else if !config.canary.auto_promote {
                    return Err(ForgeError::ConflictOrBusy(
                        "canary succeeded but auto-promote is disabled".into(),
                    ));
                } else {
                    self.bump_progress(deployment_id, 90, "canary criteria met");
                }
            }
            Strategy::BlueGreen => {
                self.bump_progress(deployment_id, 20, "green environment starting");
                tokio::time::sleep(Duration::from_millis(config.blue_green.warmup_ms)).await;
                self.ensure_not_cancelled(deployment_id)?;
                self.bump_progress(deployment_id, 50, "warmup complete");

                let results = self
                    .run_health_checks(model_id, version, &config.health_checks)
                    .await;
                let passed = results
                    .iter()
                    .filter(|r| r.status == CheckStatus::Pass)
                    .count();
                let rate = passed as f64 / results.len().max(1) as f64;
                self.attach_checks(deployment_id, results);
                if rate < config.blue_green.switch_threshold {
                    return Err(ForgeError::Validation(format!(
                        "green health rate {rate:.2} below switch threshold"
                    )));
                }
                self.bump_progress(deployment_id, 90, "traffic switched to green");
            }
        }
        self.ensure_not_cancelled(deployment_id)?;
        Ok(())
    }

    async fn gate_on_checks(
        &self,
        deployment_id: Uuid,
        model_id: ModelId,
        version: &str,
        checks: &[CheckKind],
    ) -> Result<()> {
        let results = self.run_health_checks(model_id, version, checks).await;
        let failed: Vec<&CheckResult> = results
            .iter()
            .filter(|r| r.status == CheckStatus::Fail)
            .collect();
        let message = failed
            .iter()
            .map(|r| format!("{}: {}", r.name, r.message))
            .collect::<Vec<_>>()
            .join("; ");
        let any_failed = !failed.is_empty();
        self.attach_checks(deployment_id, results);
        if any_failed {
            return Err(ForgeError::Validation(format!(
                "health checks failed: {message}"
            )));
        }
        Ok(())
    }

    fn ensure_not_cancelled(&self, deployment_id: Uuid) -> Result<()> {
        if self.cancelled(deployment_id) {
            return Err(ForgeError::ConflictOrBusy("deployment cancelled".into()));
        }
        Ok(())
    }

    fn cancelled(&self, deployment_id: Uuid) -> bool {
        self.deployments
            .get(&deployment_id)
            .map(|d| d.state == DeployState::Cancelled)
            .unwrap_or(false)
    }

    fn progress_of(&self, deployment_id: Uuid) -> u8 {
        self.deployments
            .get(&deployment_id)
            .map(|d| d.progress)
            .unwrap_or(0)
    }

    fn transition(&self, deployment_id: Uuid, state: DeployState, progress: u8, event: &str) {
        if let Some(mut deployment) = self.deployments.get_mut(&deployment_id) {
            if deployment.state == DeployState::Cancelled && state != DeployState::Cancelled {
                return;
            }
            deployment.state = state;
            deployment.progress = deployment.progress.max(progress.min(100));
            deployment.updated_at = Utc::now();
            deployment.events.push(event.to_string());
        }
    }

    fn bump_progress(&self, deployment_id: Uuid, progress: u8, event: &str) {
        if let Some(mut deployment) = self.deployments.get_mut(&deployment_id) {
            deployment.progress = deployment.progress.max(progress.min(100));
            deployment.updated_at = Utc::now();
            deployment.events.push(event.to_string());
        }
    }

    fn record_error(&self, deployment_id: Uuid, err: &ForgeError) {
        if let Some(mut deployment) = self.deployments.get_mut(&deployment_id) {
            deployment.error = Some(err.to_string());
            deployment.updated_at = Utc::now();
        }
    }

    fn attach_checks(&self, deployment_id: Uuid, results: Vec<CheckResult>) {
        if let Some(mut deployment) = self.deployments.get_mut(&deployment_id) {
            deployment.checks = results;
        }
    }
}

fn latency_check(
    latency: Option<&LatencySummary>,
    max_p95_ms: u64,
) -> (&'static str, CheckStatus, String) {
    match latency {
        None => (
            "prediction_latency",
            CheckStatus::Pass,
            "no traffic yet".to_string(),
        ),
        Some(summary) if summary.p95_ms > max_p95_ms => (
            "prediction_latency",
            CheckStatus::Fail,
            format!("p95 {}ms above {max_p95_ms}ms", summary.p95_ms),
        ),
        Some(summary) if summary.p95_ms * 10 > max_p95_ms * 8 => (
            "prediction_latency",
            CheckStatus::Warn,
            format!("p95 {}ms approaching {max_p95_ms}ms", summary.p95_ms),
        ),
        Some(summary) => (
            "prediction_latency",
            CheckStatus::Pass,
            format!("p95 {}ms", summary.p95_ms),
        ),
    }
}

fn resource_check(max_memory_bytes: u64) -> (&'static str, CheckStatus, String) {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    let used = system.used_memory();
    if used > max_memory_bytes {
        (
            "resource_usage",
            CheckStatus::Warn,
            format!("memory use {used} above budget {max_memory_bytes}"),
        )
    } else {
        (
            "resource_usage",
            CheckStatus::Pass,
            format!("memory use {used} within budget"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelforge_core::{Algorithm, ModelConfig, ModelKind, ModelRecord};
    use modelforge_storage::LocalBackend;
    use std::collections::HashMap;

    async fn harness(
        root: &std::path::Path,
    ) -> (
        Arc<DeploymentController>,
        Arc<ModelRegistry>,
        ModelId,
        Arc<PredictionLog>,
    ) {
        let registry = Arc::new(ModelRegistry::new());
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalBackend::new(root));
        let log = Arc::new(PredictionLog::new(1000));
        let monitor = Arc::new(HealthMonitor::new(Arc::clone(&log)));

        let mut record = ModelRecord::new(
            "t1",
            "m",
            ModelKind::Classification,
            ModelConfig {
                algorithm: Algorithm::DenseNn,
                parameters: HashMap::new(),
                features: vec!["x".into()],
                target: Some("y".into()),
                text_features: vec![],
                use_embeddings: false,
                transformer: None,
            },
        );
        record.status = ModelStatus::Ready;
        let model_id = registry.insert(record);

        for (i, version) in ["1.0.0", "1.1.0"].iter().enumerate() {
            let dir = root.join(model_id.to_string()).join(version);
            tokio::fs::create_dir_all(&dir).await.unwrap();
            tokio::fs::write(dir.join("model.json"), "{}").await.unwrap();
            let mut perf = HashMap::new();
            perf.insert("accuracy".into(), 0.8 + i as f64 * 0.05);
            registry
                .register_version(model_id, version, perf, "file:///x", None)
                .unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        registry
            .update_with(model_id, |r| r.current_version = Some("1.1.0".into()))
            .unwrap();

        let controller = Arc::new(DeploymentController::new(
            registry.clone(),
            storage,
            monitor,
            Arc::clone(&log),
        ));
        (controller, registry, model_id, log)
    }

    fn fast_config(strategy: Strategy) -> DeployConfig {
        DeployConfig {
            strategy,
            stage: VersionStage::Production,
            rolling: RollingConfig { instance_count: 4 },
            canary: CanaryConfig {
                traffic_percent: 20,
                duration_ms: 10,
                criteria: SuccessCriteria::default(),
                auto_promote: true,
            },
            blue_green: BlueGreenConfig {
                warmup_ms: 10,
                switch_threshold: 0.5,
                retain_old_ms: 0,
            },
            health_checks: vec![CheckKind::ModelAvailability],
            rollback_enabled: false,
            rollback_triggers: Vec::new(),
        }
    }

    #[tokio::test]
    async fn immediate_deploy_reaches_deployed_and_promotes() {
        let root = tempfile::tempdir().unwrap();
        let (controller, registry, model_id, _log) = harness(root.path()).await;

        let deployment = controller
            .deploy(model_id, "1.1.0", &fast_config(Strategy::Immediate))
            .await
            .unwrap();
        assert_eq!(deployment.state, DeployState::Deployed);
        assert_eq!(deployment.progress, 100);

        let record = registry.get(model_id).unwrap();
        assert_eq!(
            record.version("1.1.0").unwrap().stage,
            VersionStage::Production
        );
        assert_eq!(
            controller.get_active(model_id).unwrap().version,
            "1.1.0"
        );
    }

    #[tokio::test]
    async fn missing_artifacts_fail_the_deployment() {
        let root = tempfile::tempdir().unwrap();
        let (controller, registry, model_id, _log) = harness(root.path()).await;
        registry
            .register_version(model_id, "2.0.0", HashMap::new(), "file:///x", None)
            .unwrap();

        let err = controller
            .deploy(model_id, "2.0.0", &fast_config(Strategy::Immediate))
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::Validation(_)));
    }

    #[tokio::test]
    async fn rolling_and_canary_and_blue_green_complete() {
        let root = tempfile::tempdir().unwrap();
        let (controller, _registry, model_id, _log) = harness(root.path()).await;

        for strategy in [Strategy::Rolling, Strategy::Canary, Strategy::BlueGreen] {
            let deployment = controller
                .deploy(model_id, "1.1.0", &fast_config(strategy))
                .await
                .unwrap();
            assert_eq!(deployment.state, DeployState::Deployed, "{strategy:?}");
        }
    }

    #[tokio::test]
    async fn rollback_targets_the_previous_version() {
        let root = tempfile::tempdir().unwrap();
        let (controller, registry, model_id, _log) = harness(root.path()).await;

        controller
            .deploy(model_id, "1.1.0", &fast_config(Strategy::Immediate))
            .await
            .unwrap();
        let rollback = controller.rollback(model_id).await.unwrap();

        assert_eq!(rollback.version, "1.0.0");
        assert_eq!(rollback.strategy, Strategy::Immediate);
        assert_eq!(rollback.stage, VersionStage::Production);
        assert_ne!(
            rollback.version,
            "1.1.0",
            "rollback target must differ from the active version"
        );
        let record = registry.get(model_id).unwrap();
        assert_eq!(
            record.version("1.0.0").unwrap().stage,
            VersionStage::Production
        );
    }

    #[tokio::test]
    async fn failed_deploy_with_rollback_enabled_rolls_back() {
        let root = tempfile::tempdir().unwrap();
        let (controller, registry, model_id, _log) = harness(root.path()).await;

        controller
            .deploy(model_id, "1.1.0", &fast_config(Strategy::Immediate))
            .await
            .unwrap();

        // A version with no artifacts fails availability checks.
        registry
            .register_version(model_id, "2.0.0", HashMap::new(), "file:///x", None)
            .unwrap();
        registry
            .update_with(model_id, |r| r.current_version = Some("2.0.0".into()))
            .unwrap();

        let mut config = fast_config(Strategy::Immediate);
        config.rollback_enabled = true;
        let err = controller.deploy(model_id, "2.0.0", &config).await;
        assert!(err.is_err());

        // The failed deployment transitioned through rolling_back.
        let failed = controller
            .deployments
            .iter()
            .find(|d| d.version == "2.0.0")
            .map(|d| d.clone())
            .unwrap();
        assert_eq!(failed.state, DeployState::RolledBack);
    }

    #[tokio::test]
    async fn cancel_before_terminal_state_sticks() {
        let root = tempfile::tempdir().unwrap();
        let (controller, _registry, model_id, _log) = harness(root.path()).await;

        let deployment = controller
            .deploy(model_id, "1.1.0", &fast_config(Strategy::Immediate))
            .await
            .unwrap();
        let err = controller.cancel(deployment.id).unwrap_err();
        assert!(matches!(err, ForgeError::ConflictOrBusy(_)));
    }

    fn failed_prediction(model_id: ModelId) -> modelforge_core::PredictionRecord {
        let id = Uuid::new_v4();
        modelforge_core::PredictionRecord {
            id,
            model_id,
            version: "1.1.0".into(),
            input: modelforge_core::Row::new(),
            output: modelforge_core::PredictionOutput {
                prediction: serde_json::json!("Class 0"),
                confidence: 0.9,
                probabilities: None,
                metadata: None,
            },
            processing_ms: 5,
            created_at: Utc::now(),
            feedback: Some(modelforge_core::PredictionFeedback {
                prediction_id: id,
                actual_value: serde_json::json!("Class 1"),
                is_correct: Some(false),
                comment: None,
                provided_by: None,
                submitted_at: Utc::now(),
            }),
        }
    }

    #[tokio::test]
    async fn trigger_monitor_rolls_back_on_high_error_rate() {
        let root = tempfile::tempdir().unwrap();
        let (controller, _registry, model_id, log) = harness(root.path()).await;

        controller
            .deploy(model_id, "1.1.0", &fast_config(Strategy::Immediate))
            .await
            .unwrap();
        for _ in 0..10 {
            log.record(failed_prediction(model_id));
        }

        let triggers = vec![MetricTrigger {
            metric: "error_rate".into(),
            threshold: 0.5,
            operator: TriggerOp::Gt,
            duration_secs: 0,
        }];
        let monitor = controller.spawn_trigger_monitor(
            model_id,
            triggers,
            Duration::from_millis(20),
        );
        monitor.await.unwrap();

        assert_eq!(controller.get_active(model_id).unwrap().version, "1.0.0");
    }
}
