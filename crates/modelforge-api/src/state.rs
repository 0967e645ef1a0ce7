//! The composition root: every subsystem is constructed once here and
//! passed down explicitly, so tests can assemble the same graph with
//! fakes in place of real backends.

use crate::rate_limit::RateLimiter;
use modelforge_core::{DocumentStore, MemoryDocumentStore, Result, Settings};
use modelforge_ops::{
    AdversarialDetector, AutomlEngine, DeploymentController, DriftDetector, HealthMonitor,
    InputValidator,
};
use modelforge_pool::{DiskCache, ModelPool};
use modelforge_prep::{EmbeddingCache, HttpEmbeddingProvider};
use modelforge_registry::{AbCoordinator, ModelComparator, ModelRegistry};
use modelforge_serve::{Evaluator, PredictionLog, PredictionService, TransformerRegistry};
use modelforge_storage::StorageBackend;
use modelforge_train::{IncrementalLearner, LockRegistry, TrainingOrchestrator};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub documents: Arc<dyn DocumentStore>,
    pub registry: Arc<ModelRegistry>,
    pub storage: Arc<dyn StorageBackend>,
    pub pool: Arc<ModelPool>,
    pub embeddings: Arc<EmbeddingCache>,
    pub orchestrator: Arc<TrainingOrchestrator>,
    pub learner: Arc<IncrementalLearner>,
    pub prediction: Arc<PredictionService>,
    pub prediction_log: Arc<PredictionLog>,
    pub evaluator: Arc<Evaluator>,
    pub ab: Arc<AbCoordinator>,
    pub comparator: Arc<ModelComparator>,
    pub transformers: Arc<TransformerRegistry>,
    pub drift: Arc<DriftDetector>,
    pub health: Arc<HealthMonitor>,
    pub deployments: Arc<DeploymentController>,
    pub automl: Arc<AutomlEngine>,
    pub validator: Arc<InputValidator>,
    pub adversarial: Arc<AdversarialDetector>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    /// Wire the full graph. `documents` is the host's database; the
    /// in-memory store serves as the default when none is attached.
    pub async fn new(
        settings: Settings,
        documents: Option<Arc<dyn DocumentStore>>,
    ) -> Result<Self> {
        let settings = Arc::new(settings);
        let documents =
            documents.unwrap_or_else(|| Arc::new(MemoryDocumentStore::new()) as Arc<dyn DocumentStore>);

        let storage = modelforge_storage::from_settings(&settings.storage)?;
        let disk = DiskCache::open(
            &settings.pool.disk_dir,
            settings.pool.disk_max_bytes,
            settings.pool.disk_ttl_days,
        )
        .await?;
        let pool = Arc::new(ModelPool::new(settings.pool.clone(), Some(disk)));
        pool.spawn_sweeper();

        let registry = Arc::new(ModelRegistry::new());
        let locks = Arc::new(LockRegistry::new(&settings.storage.local_root));
        let embedding_provider = HttpEmbeddingProvider::from_settings(&settings.embedding)
            .map(|p| Arc::new(p) as Arc<dyn modelforge_core::EmbeddingProvider>);
        let embeddings = Arc::new(EmbeddingCache::new(
            embedding_provider,
            settings.embedding.cache_capacity,
        ));
        let prediction_log = Arc::new(PredictionLog::new(10_000));
        let ab = Arc::new(AbCoordinator::new());
        let transformers = Arc::new(TransformerRegistry::new());

        let orchestrator = Arc::new(TrainingOrchestrator::new(
            Arc::clone(&settings),
            Arc::clone(&registry),
            Arc::clone(&storage),
            Arc::clone(&pool),
            Arc::clone(&locks),
            Arc::clone(&documents),
            Arc::clone(&embeddings),
        ));
        let learner = Arc::new(IncrementalLearner::new(
            Arc::clone(&settings),
            Arc::clone(&registry),
            Arc::clone(&storage),
            Arc::clone(&pool),
            Arc::clone(&locks),
            Arc::clone(&embeddings),
        ));
        let prediction = Arc::new(PredictionService::new(
            Arc::clone(&settings),
            Arc::clone(&registry),
            Arc::clone(&storage),
            Arc::clone(&pool),
            Arc::clone(&embeddings),
            Arc::clone(&prediction_log),
            Arc::clone(&ab),
            Arc::clone(&transformers),
        ));
        let evaluator = Arc::new(Evaluator::new(
            Arc::clone(&registry),
            Arc::clone(&storage),
            Arc::clone(&embeddings),
        ));
        let comparator = Arc::new(ModelComparator::new(Arc::clone(&storage)));
        let health = Arc::new(HealthMonitor::new(Arc::clone(&prediction_log)));
        let deployments = Arc::new(DeploymentController::new(
            Arc::clone(&registry),
            Arc::clone(&storage),
            Arc::clone(&health),
            Arc::clone(&prediction_log),
        ));
        let drift = Arc::new(DriftDetector::new(settings.drift.clone()));
        let automl = Arc::new(AutomlEngine::new(settings.automl.clone()));
        let validator = Arc::new(InputValidator::new());
        let adversarial = Arc::new(AdversarialDetector::new(settings.adversarial.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(settings.rate_limit.window_secs));

        Ok(Self {
            settings,
            documents,
            registry,
            storage,
            pool,
            embeddings,
            orchestrator,
            learner,
            prediction,
            prediction_log,
            evaluator,
            ab,
            comparator,
            transformers,
            drift,
            health,
            deployments,
            automl,
            validator,
            adversarial,
            rate_limiter,
        })
    }
}
