//! Environment-driven configuration.
//!
//! Every knob is an `AI_*` environment variable with a documented default.
//! Invalid values never abort startup; they fall back to the default with a
//! warning so a typo in one variable cannot take the platform down.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!(%key, value = %raw, "invalid value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// AI_TRAIN_EPOCHS, default 50.
    pub epochs: usize,
    /// AI_BATCH_SIZE, default 32.
    pub batch_size: usize,
    /// AI_LEARNING_RATE, default 0.001.
    pub learning_rate: f64,
    /// AI_TRAIN_LIMIT: row cap per training fetch, default 50_000.
    pub train_limit: usize,
    /// AI_TRAIN_SEED, default 42.
    pub seed: u64,
    /// AI_VALIDATION_SPLIT, default 0.1.
    pub validation_split: f64,
    /// AI_HIDDEN_UNITS, default 64.
    pub hidden_units: usize,
    /// AI_DROPOUT_RATE, default 0.2.
    pub dropout_rate: f64,
    /// AI_ACTIVATION, default "relu".
    pub activation: String,
    /// AI_OPTIMIZER, default "adam".
    pub optimizer: String,
    /// AI_MAX_CONCURRENT_TRAINING, default 2.
    pub max_concurrent: usize,
    /// AI_LOCK_TIMEOUT_SECS: advisory-lock acquisition budget, default 10.
    pub lock_timeout_secs: u64,
    /// AI_KEEP_VERSIONS: archive-eligibility keep count, default 5.
    pub keep_versions: usize,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            epochs: 50,
            batch_size: 32,
            learning_rate: 0.001,
            train_limit: 50_000,
            seed: 42,
            validation_split: 0.1,
            hidden_units: 64,
            dropout_rate: 0.2,
            activation: "relu".into(),
            optimizer: "adam".into(),
            max_concurrent: 2,
            lock_timeout_secs: 10,
            keep_versions: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionSettings {
    /// AI_MAX_PREDICTION_BATCH, default 100.
    pub max_batch: usize,
    /// AI_PREDICTION_TIMEOUT (seconds), default 5.
    pub timeout_secs: u64,
    /// AI_MOCK_FALLBACK: synthetic response on inference failure, default off.
    pub mock_fallback: bool,
    /// Payload cap on predict routes in bytes, default 200 KiB.
    pub max_payload_bytes: usize,
}

impl Default for PredictionSettings {
    fn default() -> Self {
        Self {
            max_batch: 100,
            timeout_secs: 5,
            mock_fallback: false,
            max_payload_bytes: 200 * 1024,
        }
    }
}

impl PredictionSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// AI_RATE_LIMIT_PREDICT: single predictions per tenant per window, default 30.
    pub predict_per_window: u32,
    /// AI_RATE_LIMIT_BATCH: batch predictions per tenant per window, default 10.
    pub batch_per_window: u32,
    /// AI_RATE_LIMIT_WINDOW_SECS, default 60.
    pub window_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            predict_per_window: 30,
            batch_per_window: 10,
            window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// AI_QUEUE_MAX_PENDING: bounded training queue depth, default 100.
    pub max_pending: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self { max_pending: 100 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepSettings {
    /// AI_MAX_CATEGORICAL: distinct-value cap before a string feature is text, default 100.
    pub max_categorical: usize,
    /// AI_MIN_TEXT_LENGTH: minimum length for text-scalar features, default 1.
    pub min_text_length: usize,
    /// AI_HANDLE_MISSING: one of zero|mean|median|mode|drop, default "zero".
    pub handle_missing: String,
    /// AI_OUTLIER_DETECTION: enable IQR handling in the schema pipeline, default false.
    pub outlier_detection: bool,
}

impl Default for PrepSettings {
    fn default() -> Self {
        Self {
            max_categorical: 100,
            min_text_length: 1,
            handle_missing: "zero".into(),
            outlier_detection: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// AI_MODEL_POOL_MAX: loaded entries per (model, version), default 3.
    pub max_pool_size: usize,
    /// AI_MODEL_POOL_MIN: floor the sweeper never shrinks below, default 1.
    pub min_pool_size: usize,
    /// AI_MODEL_POOL_IDLE_SECS: idle eviction threshold, default 300.
    pub max_idle_secs: u64,
    /// AI_MODEL_POOL_SWEEP_SECS: sweeper period, default 60.
    pub sweep_interval_secs: u64,
    /// AI_MODEL_POOL_DISK_DIR: second-level cache directory, default "data/model-cache".
    pub disk_dir: String,
    /// AI_MODEL_POOL_DISK_MAX_BYTES: disk-cache cap, default 2 GiB.
    pub disk_max_bytes: u64,
    /// AI_MODEL_POOL_DISK_TTL_DAYS, default 7.
    pub disk_ttl_days: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_pool_size: 3,
            min_pool_size: 1,
            max_idle_secs: 300,
            sweep_interval_secs: 60,
            disk_dir: "data/model-cache".into(),
            disk_max_bytes: 2 * 1024 * 1024 * 1024,
            disk_ttl_days: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdversarialSettings {
    /// AI_ADVERSARIAL_ENABLED, default true.
    pub enabled: bool,
    /// AI_ADVERSARIAL_THRESHOLD: combined-score alarm level, default 0.7.
    pub threshold: f64,
    /// AI_ADVERSARIAL_METHODS: comma list of statistical|gradient|reconstruction.
    pub methods: Vec<String>,
}

impl Default for AdversarialSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.7,
            methods: vec![
                "statistical".into(),
                "gradient".into(),
                "reconstruction".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftSettings {
    /// AI_DRIFT_THRESHOLD: per-feature affected threshold, default 0.1.
    pub threshold: f64,
    /// AI_DRIFT_METHOD: psi|ks|chi_square|wasserstein, default "psi".
    pub method: String,
    /// AI_DRIFT_MIN_SAMPLES before scores are meaningful, default 20.
    pub min_samples: usize,
}

impl Default for DriftSettings {
    fn default() -> Self {
        Self {
            threshold: 0.1,
            method: "psi".into(),
            min_samples: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomlSettings {
    /// AI_AUTOML_MAX_TRIALS, default 20.
    pub max_trials: usize,
    /// AI_AUTOML_MAX_SECONDS: search time budget, default 300.
    pub max_seconds: u64,
    /// AI_AUTOML_EARLY_STOP_WINDOW: trials without improvement before stop, default 5.
    pub early_stop_window: usize,
}

impl Default for AutomlSettings {
    fn default() -> Self {
        Self {
            max_trials: 20,
            max_seconds: 300,
            early_stop_window: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentSettings {
    /// AI_DEFAULT_DEPLOYMENT_STRATEGY: immediate|rolling|canary|blue_green, default "immediate".
    pub default_strategy: String,
    /// AI_CANARY_TRAFFIC_PERCENT, default 10.
    pub canary_traffic_percent: u8,
    /// AI_ROLLBACK_ENABLED, default true.
    pub rollback_enabled: bool,
}

impl Default for DeploymentSettings {
    fn default() -> Self {
        Self {
            default_strategy: "immediate".into(),
            canary_traffic_percent: 10,
            rollback_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// MODEL_STORAGE: local|s3|gcs, default "local".
    pub backend: String,
    /// MODEL_STORAGE_ROOT: local root path, default "data/models".
    pub local_root: String,
    /// MODEL_STORAGE_BUCKET for object-store backends.
    pub bucket: String,
    /// MODEL_STORAGE_PREFIX inside the bucket, default "models".
    pub prefix: String,
    /// MODEL_STORAGE_ENDPOINT: object-store endpoint URL.
    pub endpoint: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: "local".into(),
            local_root: "data/models".into(),
            bucket: String::new(),
            prefix: "models".into(),
            endpoint: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementalSettings {
    /// AI_INCREMENTAL_BUFFER_MAX: ring buffer cap per model, default 1000.
    pub max_buffer_size: usize,
    /// AI_INCREMENTAL_UPDATE_FREQUENCY: buffered samples per update, default 100.
    pub update_frequency: usize,
    /// AI_INCREMENTAL_LEARNING_RATE, default 1e-4.
    pub learning_rate: f64,
    /// AI_INCREMENTAL_EPOCHS, default 3.
    pub epochs: usize,
    /// AI_INCREMENTAL_HOLDOUT: held-out evaluation fraction, default 0.2.
    pub holdout: f64,
    /// AI_INCREMENTAL_HISTORY_MAX: bounded history per model, default 50.
    pub history_max: usize,
}

impl Default for IncrementalSettings {
    fn default() -> Self {
        Self {
            max_buffer_size: 1000,
            update_frequency: 100,
            learning_rate: 1e-4,
            epochs: 3,
            holdout: 0.2,
            history_max: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingSettings {
    /// AI_EMBEDDING_ENDPOINT: HTTP embedding service URL; empty disables
    /// embeddings (text features fall back to scalar encoding).
    pub endpoint: String,
    /// AI_EMBEDDING_MODEL, default "nomic-embed-text".
    pub model: String,
    /// AI_EMBEDDING_DIM, default 768.
    pub dimension: usize,
    /// AI_EMBEDDING_CACHE_MAX: cached (feature, value) vectors, default 50_000.
    pub cache_capacity: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            model: "nomic-embed-text".into(),
            dimension: 768,
            cache_capacity: 50_000,
        }
    }
}

/// Full platform configuration, grouped by subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    pub training: TrainingSettings,
    pub prediction: PredictionSettings,
    pub rate_limit: RateLimitSettings,
    pub queue: QueueSettings,
    pub prep: PrepSettings,
    pub pool: PoolSettings,
    pub adversarial: AdversarialSettings,
    pub drift: DriftSettings,
    pub automl: AutomlSettings,
    pub deployment: DeploymentSettings,
    pub storage: StorageSettings,
    pub incremental: IncrementalSettings,
    pub embedding: EmbeddingSettings,
}

impl Settings {
    /// Load from the process environment, defaulting every missing or
    /// malformed variable.
    pub fn from_env() -> Self {
        let d = Settings::default();
        Self {
            training: TrainingSettings {
                epochs: env_parse("AI_TRAIN_EPOCHS", d.training.epochs),
                batch_size: env_parse("AI_BATCH_SIZE", d.training.batch_size),
                learning_rate: env_parse("AI_LEARNING_RATE", d.training.learning_rate),
                train_limit: env_parse("AI_TRAIN_LIMIT", d.training.train_limit),
                seed: env_parse("AI_TRAIN_SEED", d.training.seed),
                validation_split: env_parse("AI_VALIDATION_SPLIT", d.training.validation_split),
                hidden_units: env_parse("AI_HIDDEN_UNITS", d.training.hidden_units),
                dropout_rate: env_parse("AI_DROPOUT_RATE", d.training.dropout_rate),
                activation: env_string("AI_ACTIVATION", &d.training.activation),
                optimizer: env_string("AI_OPTIMIZER", &d.training.optimizer),
                max_concurrent: env_parse("AI_MAX_CONCURRENT_TRAINING", d.training.max_concurrent),
                lock_timeout_secs: env_parse("AI_LOCK_TIMEOUT_SECS", d.training.lock_timeout_secs),
                keep_versions: env_parse("AI_KEEP_VERSIONS", d.training.keep_versions),
            },
            prediction: PredictionSettings {
                max_batch: env_parse("AI_MAX_PREDICTION_BATCH", d.prediction.max_batch),
                timeout_secs: env_parse("AI_PREDICTION_TIMEOUT", d.prediction.timeout_secs),
                mock_fallback: env_parse("AI_MOCK_FALLBACK", d.prediction.mock_fallback),
                max_payload_bytes: env_parse(
                    "AI_MAX_PAYLOAD_BYTES",
                    d.prediction.max_payload_bytes,
                ),
            },
            rate_limit: RateLimitSettings {
                predict_per_window: env_parse(
                    "AI_RATE_LIMIT_PREDICT",
                    d.rate_limit.predict_per_window,
                ),
                batch_per_window: env_parse("AI_RATE_LIMIT_BATCH", d.rate_limit.batch_per_window),
                window_secs: env_parse("AI_RATE_LIMIT_WINDOW_SECS", d.rate_limit.window_secs),
            },
            queue: QueueSettings {
                max_pending: env_parse("AI_QUEUE_MAX_PENDING", d.queue.max_pending),
            },
            prep: PrepSettings {
                max_categorical: env_parse("AI_MAX_CATEGORICAL", d.prep.max_categorical),
                min_text_length: env_parse("AI_MIN_TEXT_LENGTH", d.prep.min_text_length),
                handle_missing: env_string("AI_HANDLE_MISSING", &d.prep.handle_missing),
                outlier_detection: env_parse("AI_OUTLIER_DETECTION", d.prep.outlier_detection),
            },
            pool: PoolSettings {
                max_pool_size: env_parse("AI_MODEL_POOL_MAX", d.pool.max_pool_size),
                min_pool_size: env_parse("AI_MODEL_POOL_MIN", d.pool.min_pool_size),
                max_idle_secs: env_parse("AI_MODEL_POOL_IDLE_SECS", d.pool.max_idle_secs),
                sweep_interval_secs: env_parse(
                    "AI_MODEL_POOL_SWEEP_SECS",
                    d.pool.sweep_interval_secs,
                ),
                disk_dir: env_string("AI_MODEL_POOL_DISK_DIR", &d.pool.disk_dir),
                disk_max_bytes: env_parse("AI_MODEL_POOL_DISK_MAX_BYTES", d.pool.disk_max_bytes),
                disk_ttl_days: env_parse("AI_MODEL_POOL_DISK_TTL_DAYS", d.pool.disk_ttl_days),
            },
            adversarial: AdversarialSettings {
                enabled: env_parse("AI_ADVERSARIAL_ENABLED", d.adversarial.enabled),
                threshold: env_parse("AI_ADVERSARIAL_THRESHOLD", d.adversarial.threshold),
                methods: env::var("AI_ADVERSARIAL_METHODS")
                    .map(|v| v.split(',').map(|m| m.trim().to_string()).collect())
                    .unwrap_or(d.adversarial.methods),
            },
            drift: DriftSettings {
                threshold: env_parse("AI_DRIFT_THRESHOLD", d.drift.threshold),
                method: env_string("AI_DRIFT_METHOD", &d.drift.method),
                min_samples: env_parse("AI_DRIFT_MIN_SAMPLES", d.drift.min_samples),
            },
            automl: AutomlSettings {
                max_trials: env_parse("AI_AUTOML_MAX_TRIALS", d.automl.max_trials),
                max_seconds: env_parse("AI_AUTOML_MAX_SECONDS", d.automl.max_seconds),
                early_stop_window: env_parse(
                    "AI_AUTOML_EARLY_STOP_WINDOW",
                    d.automl.early_stop_window,
                ),
            },
            deployment: DeploymentSettings {
                default_strategy: env_string(
                    "AI_DEFAULT_DEPLOYMENT_STRATEGY",
                    &d.deployment.default_strategy,
                ),
                canary_traffic_percent: env_parse(
                    "AI_CANARY_TRAFFIC_PERCENT",
                    d.deployment.canary_traffic_percent,
                ),
                rollback_enabled: env_parse("AI_ROLLBACK_ENABLED", d.deployment.rollback_enabled),
            },
            storage: StorageSettings {
                backend: env_string("MODEL_STORAGE", &d.storage.backend),
                local_root: env_string("MODEL_STORAGE_ROOT", &d.storage.local_root),
                bucket: env_string("MODEL_STORAGE_BUCKET", &d.storage.bucket),
                prefix: env_string("MODEL_STORAGE_PREFIX", &d.storage.prefix),
                endpoint: env_string("MODEL_STORAGE_ENDPOINT", &d.storage.endpoint),
            },
            embedding: EmbeddingSettings {
                endpoint: env_string("AI_EMBEDDING_ENDPOINT", &d.embedding.endpoint),
                model: env_string("AI_EMBEDDING_MODEL", &d.embedding.model),
                dimension: env_parse("AI_EMBEDDING_DIM", d.embedding.dimension),
                cache_capacity: env_parse(
                    "AI_EMBEDDING_CACHE_MAX",
                    d.embedding.cache_capacity,
                ),
            },
            incremental: IncrementalSettings {
                max_buffer_size: env_parse(
                    "AI_INCREMENTAL_BUFFER_MAX",
                    d.incremental.max_buffer_size,
                ),
                update_frequency: env_parse(
                    "AI_INCREMENTAL_UPDATE_FREQUENCY",
                    d.incremental.update_frequency,
                ),
                learning_rate: env_parse(
                    "AI_INCREMENTAL_LEARNING_RATE",
                    d.incremental.learning_rate,
                ),
                epochs: env_parse("AI_INCREMENTAL_EPOCHS", d.incremental.epochs),
                holdout: env_parse("AI_INCREMENTAL_HOLDOUT", d.incremental.holdout),
                history_max: env_parse("AI_INCREMENTAL_HISTORY_MAX", d.incremental.history_max),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.training.epochs, 50);
        assert_eq!(s.training.max_concurrent, 2);
        assert_eq!(s.training.lock_timeout_secs, 10);
        assert_eq!(s.training.train_limit, 50_000);
        assert_eq!(s.prep.max_categorical, 100);
        assert_eq!(s.rate_limit.predict_per_window, 30);
        assert_eq!(s.rate_limit.batch_per_window, 10);
        assert_eq!(s.pool.disk_max_bytes, 2 * 1024 * 1024 * 1024);
        assert_eq!(s.incremental.update_frequency, 100);
        assert!((s.drift.threshold - 0.1).abs() < f64::EPSILON);
        assert!((s.adversarial.threshold - 0.7).abs() < f64::EPSILON);
    }
}
