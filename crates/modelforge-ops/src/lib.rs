//! Operations for Modelforge: the deployment controller and its health
//! checks, statistical drift detection, serving-health reporting, input
//! security, and the AutoML search loop.

pub mod automl;
pub mod deploy;
pub mod drift;
pub mod health;
pub mod security;

pub use automl::{
    AutomlEngine, SearchConstraints, SearchOutcome, TrialParams, TrialRecord, TrialStatus,
};
pub use deploy::{
    BlueGreenConfig, CanaryConfig, CheckKind, CheckResult, CheckStatus, DeployConfig, DeployState,
    Deployment, DeploymentController, MetricTrigger, RollingConfig, Strategy, SuccessCriteria,
    TriggerOp,
};
pub use drift::{
    chi_square, ks_distance, psi, wasserstein, AlertSink, DriftDetector, DriftMethod, DriftReport,
    FeatureDrift, LogAlertSink,
};
pub use health::{HealthLevel, HealthMonitor, LatencySummary, ModelHealthReport};
pub use security::{
    anonymize_input, sanitize_input, AdversarialDetector, AdversarialVerdict, FieldRule,
    InputValidator, PrivacyLevel, RiskLevel, RuleViolation, SanitizeAction, SanitizeOptions,
    SanitizedInput, ValidationVerdict,
};
