//! Route handlers. Thin: parse, authorize by tenant header, rate-limit
//! where required, delegate to the owning subsystem, wrap in the envelope.

use crate::envelope::Envelope;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use modelforge_core::{
    ForgeError, ModelConfig, ModelId, ModelKind, ModelRecord, Row, TrainingDataInfo, VersionStage,
};
use modelforge_ops::{DeployConfig, SearchConstraints, Strategy};
use modelforge_prep::PrepConfig;
use modelforge_registry::AbTestConfig;
use modelforge_serve::{PredictOptions, TransformerSpec};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};
use uuid::Uuid;

const TENANT_HEADER: &str = "x-tenant-id";

fn tenant(headers: &HeaderMap) -> ApiResult<String> {
    headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::BadRequest(format!("missing {TENANT_HEADER} header")))
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub page: usize,
    pub per_page: Option<usize>,
}

impl PageQuery {
    fn per_page(&self) -> usize {
        self.per_page.unwrap_or(20).clamp(1, 100)
    }
}

// ---------------------------------------------------------------------------
// Service-level routes
// ---------------------------------------------------------------------------

pub async fn service_health() -> Json<Value> {
    Json(json!({
        "status": "success",
        "data": {
            "service": "modelforge",
            "version": env!("CARGO_PKG_VERSION"),
        }
    }))
}

pub async fn service_stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "success",
        "data": {
            "models": state.registry.model_count(),
            "models_by_status": state.registry.status_counts(),
            "predictions_recorded": state.prediction_log.total_recorded(),
            "trainings_active": state.orchestrator.active_count(),
            "trainings_queued": state.orchestrator.queue_depth(),
            "trainings_completed": state.orchestrator.completed_count(),
            "ab_tests_active": state.ab.active_count(),
            "pool": state.pool.stats(),
            "disk_cache": state.pool.disk_stats(),
            "embedding_cache": state.embeddings.stats(),
        }
    }))
}

// ---------------------------------------------------------------------------
// Model CRUD + lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct TrainingSource {
    pub source: String,
    pub seed: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateModelRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ModelKind,
    pub config: ModelConfig,
    pub training_data: TrainingSource,
}

pub async fn list_models(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<Envelope<Vec<ModelRecord>>>> {
    let tenant = tenant(&headers)?;
    let per_page = query.per_page();
    let (models, total) = state.registry.list_for_tenant(&tenant, query.page, per_page);
    Ok(Json(Envelope::paginated(models, query.page, per_page, total)))
}

pub async fn get_model(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ModelId>,
) -> ApiResult<Json<Envelope<ModelRecord>>> {
    let tenant = tenant(&headers)?;
    Ok(Json(Envelope::success(
        state.registry.get_for_tenant(id, &tenant)?,
    )))
}

pub async fn create_model(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateModelRequest>,
) -> ApiResult<Json<Envelope<ModelRecord>>> {
    let tenant = tenant(&headers)?;
    if request.name.trim().is_empty() {
        return Err(ApiError::BadRequest("model name is required".into()));
    }
    if request.config.features.is_empty() {
        return Err(ApiError::BadRequest("at least one feature is required".into()));
    }

    let mut record = ModelRecord::new(&tenant, &request.name, request.kind, request.config);
    record.training_data = Some(TrainingDataInfo {
        source: request.training_data.source,
        record_count: 0,
        seed: request
            .training_data
            .seed
            .unwrap_or(state.settings.training.seed),
        dataset_hash: String::new(),
        epochs: 0,
    });
    let model_id = state.registry.insert(record.clone());
    info!(model_id = %model_id, tenant = %tenant, "model created, training enqueued");

    // Training runs in the background; the record transitions through
    // training -> ready | error as it progresses.
    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        if let Err(err) = orchestrator.train(model_id).await {
            error!(model_id = %model_id, error = %err, "background training failed");
        }
    });

    Ok(Json(Envelope::success_with_message(
        record,
        "training enqueued",
    )))
}

pub async fn delete_model(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ModelId>,
) -> ApiResult<Json<Envelope<Value>>> {
    let tenant = tenant(&headers)?;
    state.registry.get_for_tenant(id, &tenant)?;
    state.registry.remove(id)?;
    state.pool.invalidate_model_with_disk(id).await;
    state.storage.delete_model(id).await?;
    Ok(Json(Envelope::success(json!({ "deleted": id }))))
}

#[derive(Debug, Deserialize)]
pub struct PromoteRequest {
    pub version: String,
    pub stage: VersionStage,
}

pub async fn promote_version(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ModelId>,
    Json(request): Json<PromoteRequest>,
) -> ApiResult<Json<Envelope<Value>>> {
    let tenant = tenant(&headers)?;
    state.registry.get_for_tenant(id, &tenant)?;
    let entry = state.registry.promote(id, &request.version, request.stage)?;
    Ok(Json(Envelope::success(json!({ "version": entry }))))
}

#[derive(Debug, Deserialize)]
pub struct ArchiveRequest {
    pub keep_count: Option<usize>,
}

pub async fn archive_versions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ModelId>,
    Json(request): Json<ArchiveRequest>,
) -> ApiResult<Json<Envelope<Value>>> {
    let tenant = tenant(&headers)?;
    state.registry.get_for_tenant(id, &tenant)?;
    let keep = request
        .keep_count
        .unwrap_or(state.settings.training.keep_versions);
    let archived = state.registry.archive_old_versions(id, keep)?;
    Ok(Json(Envelope::success(json!({ "archived": archived }))))
}

#[derive(Debug, Deserialize)]
pub struct MetricQuery {
    pub metric: Option<String>,
}

pub async fn best_version(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ModelId>,
    Query(query): Query<MetricQuery>,
) -> ApiResult<Json<Envelope<Value>>> {
    let tenant = tenant(&headers)?;
    state.registry.get_for_tenant(id, &tenant)?;
    let metric = query.metric.as_deref().unwrap_or("accuracy");
    let entry = state.registry.best_version(id, metric)?;
    Ok(Json(Envelope::success(json!({ "metric": metric, "version": entry }))))
}

// ---------------------------------------------------------------------------
// Prediction
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct PredictRequest {
    pub input: Row,
    pub version: Option<String>,
    pub stage: Option<VersionStage>,
    pub ab_test_id: Option<String>,
}

fn guard_security(state: &AppState, model: &ModelRecord, input: Row) -> ApiResult<Row> {
    let verdict = state.validator.validate(model.id, &input);
    if !verdict.valid {
        return Err(ApiError::Forge(ForgeError::Security(format!(
            "input blocked on fields: {}",
            verdict.blocked_fields.join(", ")
        ))));
    }
    let sanitized = modelforge_ops::sanitize_input(input, &Default::default());
    if !sanitized.blocked_fields.is_empty() {
        return Err(ApiError::Forge(ForgeError::Security(format!(
            "input blocked on fields: {}",
            sanitized.blocked_fields.join(", ")
        ))));
    }
    let adversarial = state.adversarial.inspect(model, &sanitized.row);
    if adversarial.flagged {
        return Err(ApiError::Forge(ForgeError::Security(format!(
            "adversarial input score {:.2}",
            adversarial.score
        ))));
    }
    Ok(sanitized.row)
}

pub async fn predict(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ModelId>,
    Json(request): Json<PredictRequest>,
) -> ApiResult<Json<Envelope<Value>>> {
    let tenant = tenant(&headers)?;
    let decision = state.rate_limiter.check(
        &tenant,
        "predict",
        state.settings.rate_limit.predict_per_window,
    );
    if !decision.allowed {
        return Err(ApiError::RateLimited {
            retry_after_secs: decision.retry_after_secs,
        });
    }

    let model = state.registry.get_for_tenant(id, &tenant)?;
    let input = guard_security(&state, &model, request.input)?;

    let options = PredictOptions {
        version: request.version,
        stage: request.stage,
        ab_test_id: request.ab_test_id,
    };
    let prediction = state.prediction.predict(id, &tenant, input, &options).await?;
    Ok(Json(Envelope::success(json!({
        "prediction_id": prediction.id,
        "version": prediction.version,
        "output": prediction.output,
        "processing_ms": prediction.processing_ms,
        "rate_limit_remaining": decision.remaining,
    }))))
}

#[derive(Debug, Deserialize)]
pub struct BatchPredictRequest {
    pub inputs: Vec<Row>,
    pub version: Option<String>,
    pub stage: Option<VersionStage>,
}

pub async fn batch_predict(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ModelId>,
    Json(request): Json<BatchPredictRequest>,
) -> ApiResult<Json<Envelope<Value>>> {
    let tenant = tenant(&headers)?;
    let decision = state.rate_limiter.check(
        &tenant,
        "batch-predict",
        state.settings.rate_limit.batch_per_window,
    );
    if !decision.allowed {
        return Err(ApiError::RateLimited {
            retry_after_secs: decision.retry_after_secs,
        });
    }

    let options = PredictOptions {
        version: request.version,
        stage: request.stage,
        ab_test_id: None,
    };
    let outcome = state
        .prediction
        .predict_batch(id, &tenant, request.inputs, &options)
        .await?;
    Ok(Json(Envelope::success(serde_json::to_value(outcome)?)))
}

pub async fn list_predictions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ModelId>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<Envelope<Value>>> {
    let tenant = tenant(&headers)?;
    state.registry.get_for_tenant(id, &tenant)?;
    let per_page = query.per_page();
    let (items, total) = state.prediction_log.list(id, query.page, per_page);
    Ok(Json(Envelope::paginated(
        serde_json::to_value(items)?,
        query.page,
        per_page,
        total,
    )))
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub actual_value: Value,
    pub is_correct: Option<bool>,
    pub comments: Option<String>,
    pub provided_by: Option<String>,
    #[serde(default)]
    pub trigger_learning: bool,
}

pub async fn submit_feedback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(prediction_id): Path<Uuid>,
    Json(request): Json<FeedbackRequest>,
) -> ApiResult<Json<Envelope<Value>>> {
    let tenant = tenant(&headers)?;
    let (updated, learning_row) = state
        .prediction
        .submit_feedback(
            &tenant,
            prediction_id,
            request.actual_value,
            request.is_correct,
            request.comments,
            request.provided_by,
        )
        .await?;

    let mut update_triggered = false;
    if request.trigger_learning {
        if let Some(row) = learning_row {
            let result = state.learner.add_sample(updated.model_id, row).await?;
            update_triggered = result.is_some();
        }
    }
    Ok(Json(Envelope::success(json!({
        "prediction_id": updated.id,
        "feedback": updated.feedback,
        "update_triggered": update_triggered,
    }))))
}

// ---------------------------------------------------------------------------
// Incremental learning
// ---------------------------------------------------------------------------

pub async fn incremental_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ModelId>,
) -> ApiResult<Json<Envelope<Value>>> {
    let tenant = tenant(&headers)?;
    state.registry.get_for_tenant(id, &tenant)?;
    let result = state.learner.force_update(id).await?;
    Ok(Json(match result {
        Some(record) => Envelope::success(serde_json::to_value(record)?),
        None => Envelope::success_with_message(
            Value::Null,
            "no update performed (empty buffer or update already in flight)",
        ),
    }))
}

pub async fn incremental_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ModelId>,
) -> ApiResult<Json<Envelope<Value>>> {
    let tenant = tenant(&headers)?;
    state.registry.get_for_tenant(id, &tenant)?;
    Ok(Json(Envelope::success(json!({
        "buffered": state.learner.buffered_count(id),
        "history": state.learner.history(id),
    }))))
}

// ---------------------------------------------------------------------------
// A/B testing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AbTestRequest {
    pub id: Option<String>,
    pub model_id: ModelId,
    pub version_a: String,
    pub version_b: String,
    pub traffic_to_b: u8,
    pub min_samples: Option<usize>,
    pub primary_metric: Option<String>,
}

pub async fn start_ab_test(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AbTestRequest>,
) -> ApiResult<Json<Envelope<Value>>> {
    let tenant = tenant(&headers)?;
    let record = state.registry.get_for_tenant(request.model_id, &tenant)?;
    for version in [&request.version_a, &request.version_b] {
        if record.version(version).is_none() {
            return Err(ApiError::Forge(ForgeError::NotFound(format!(
                "version {version} of model {} not found",
                request.model_id
            ))));
        }
    }
    let test_id = request.id.unwrap_or_else(|| Uuid::new_v4().to_string());
    state.ab.start_test(
        &test_id,
        AbTestConfig {
            model_id: request.model_id,
            version_a: request.version_a,
            version_b: request.version_b,
            traffic_to_b: request.traffic_to_b,
            min_samples: request.min_samples.unwrap_or(30),
            primary_metric: request.primary_metric.unwrap_or_else(|| "accuracy".into()),
        },
    )?;
    Ok(Json(Envelope::success(json!({ "test_id": test_id }))))
}

pub async fn ab_test_results(
    State(state): State<AppState>,
    Path(test_id): Path<String>,
) -> ApiResult<Json<Envelope<Value>>> {
    Ok(Json(Envelope::success(serde_json::to_value(
        state.ab.results(&test_id)?,
    )?)))
}

pub async fn stop_ab_test(
    State(state): State<AppState>,
    Path(test_id): Path<String>,
) -> ApiResult<Json<Envelope<Value>>> {
    Ok(Json(Envelope::success(serde_json::to_value(
        state.ab.stop_test(&test_id)?,
    )?)))
}

// ---------------------------------------------------------------------------
// Evaluation, importance, drift, health
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RowsRequest {
    pub rows: Vec<Row>,
}

pub async fn evaluate_model(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ModelId>,
    Json(request): Json<RowsRequest>,
) -> ApiResult<Json<Envelope<Value>>> {
    let tenant = tenant(&headers)?;
    let metrics = state.evaluator.evaluate(id, &tenant, &request.rows).await?;
    Ok(Json(Envelope::success(json!({ "metrics": metrics }))))
}

pub async fn feature_importance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ModelId>,
    Json(request): Json<RowsRequest>,
) -> ApiResult<Json<Envelope<Value>>> {
    let tenant = tenant(&headers)?;
    let importances = state
        .evaluator
        .feature_importance(id, &tenant, &request.rows)
        .await?;
    Ok(Json(Envelope::success(serde_json::to_value(importances)?)))
}

#[derive(Debug, Deserialize)]
pub struct CompareRequest {
    pub version_a: String,
    pub version_b: String,
    pub rows: Vec<Row>,
}

pub async fn compare_versions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ModelId>,
    Json(request): Json<CompareRequest>,
) -> ApiResult<Json<Envelope<Value>>> {
    let tenant = tenant(&headers)?;
    let record = state.registry.get_for_tenant(id, &tenant)?;
    if request.rows.is_empty() {
        return Err(ApiError::BadRequest("no comparison rows supplied".into()));
    }

    // Both versions share one preprocessing contract per the immutability
    // of saved artifacts; replay with the newer side's metadata.
    let dir = state.storage.fetch(id, &request.version_b).await?;
    let metadata = modelforge_prep::PrepMetadata::from_json(
        &tokio::fs::read_to_string(dir.join(modelforge_prep::PREP_FILE))
            .await
            .map_err(|_| {
                ApiError::Forge(ForgeError::Storage(
                    "comparison version has no preprocessing metadata".into(),
                ))
            })?,
    )
    .map_err(ApiError::Forge)?;

    let width = metadata.input_dim();
    let mut x = ndarray::Array2::zeros((request.rows.len(), width));
    for (i, row) in request.rows.iter().enumerate() {
        let vector = modelforge_prep::transform_input(row, &metadata, None).await;
        for (c, v) in vector.iter().enumerate() {
            x[[i, c]] = *v;
        }
    }
    let y = modelforge_prep::encode_labels_with_metadata(&request.rows, &metadata)
        .map_err(ForgeError::from)?;

    let result = state
        .comparator
        .compare(
            id,
            &request.version_a,
            id,
            &request.version_b,
            &x,
            &y,
            record.kind,
        )
        .await?;
    Ok(Json(Envelope::success(serde_json::to_value(result)?)))
}

#[derive(Debug, Deserialize)]
pub struct DriftRequest {
    pub current: Vec<Row>,
    /// Reference rows; defaults to the recent prediction window.
    pub reference: Option<Vec<Row>>,
    pub method: Option<String>,
}

pub async fn drift_detection(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ModelId>,
    Json(request): Json<DriftRequest>,
) -> ApiResult<Json<Envelope<Value>>> {
    let tenant = tenant(&headers)?;
    let record = state.registry.get_for_tenant(id, &tenant)?;

    let reference = match request.reference {
        Some(rows) => rows,
        None => state
            .prediction_log
            .recent(id, 1_000)
            .into_iter()
            .map(|p| p.input)
            .collect(),
    };
    let method = request
        .method
        .as_deref()
        .map(modelforge_ops::DriftMethod::parse);
    let report = state.drift.detect(
        id,
        &record.config.features,
        &reference,
        &request.current,
        method,
    )?;
    Ok(Json(Envelope::success(serde_json::to_value(report)?)))
}

pub async fn model_health(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ModelId>,
) -> ApiResult<Json<Envelope<Value>>> {
    let tenant = tenant(&headers)?;
    state.registry.get_for_tenant(id, &tenant)?;
    Ok(Json(Envelope::success(serde_json::to_value(
        state.health.report(id),
    )?)))
}

pub async fn model_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ModelId>,
) -> ApiResult<Json<Envelope<Value>>> {
    let tenant = tenant(&headers)?;
    let record = state.registry.get_for_tenant(id, &tenant)?;
    Ok(Json(Envelope::success(json!({
        "performance": record.performance,
        "versions": record.versions.len(),
        "feedback_count": record.feedback.len(),
        "training_data": record.training_data,
    }))))
}

// ---------------------------------------------------------------------------
// Deployment
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    pub version: Option<String>,
    pub strategy: Option<String>,
    pub stage: Option<VersionStage>,
    #[serde(default)]
    pub rollback_triggers: Vec<modelforge_ops::MetricTrigger>,
}

pub async fn deploy_model(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ModelId>,
    Json(request): Json<DeployRequest>,
) -> ApiResult<Json<Envelope<Value>>> {
    let tenant = tenant(&headers)?;
    let record = state.registry.get_for_tenant(id, &tenant)?;
    let version = request
        .version
        .or(record.current_version)
        .ok_or_else(|| ApiError::BadRequest("model has no version to deploy".into()))?;

    let mut config = DeployConfig::from_settings(&state.settings.deployment);
    if let Some(strategy) = request.strategy.as_deref() {
        config.strategy = Strategy::parse(strategy);
    }
    if let Some(stage) = request.stage {
        config.stage = stage;
    }
    config.rollback_triggers = request.rollback_triggers;

    let deployment = state.deployments.deploy(id, &version, &config).await?;
    if config.rollback_enabled && !config.rollback_triggers.is_empty() {
        state.deployments.spawn_trigger_monitor(
            id,
            config.rollback_triggers.clone(),
            std::time::Duration::from_secs(30),
        );
    }
    Ok(Json(Envelope::success(serde_json::to_value(deployment)?)))
}

pub async fn cancel_deployment(
    State(state): State<AppState>,
    Path(deployment_id): Path<Uuid>,
) -> ApiResult<Json<Envelope<Value>>> {
    let deployment = state.deployments.cancel(deployment_id)?;
    Ok(Json(Envelope::success(serde_json::to_value(deployment)?)))
}

pub async fn rollback_model(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ModelId>,
) -> ApiResult<Json<Envelope<Value>>> {
    let tenant = tenant(&headers)?;
    state.registry.get_for_tenant(id, &tenant)?;
    let deployment = state.deployments.rollback(id).await?;
    Ok(Json(Envelope::success(serde_json::to_value(deployment)?)))
}

// ---------------------------------------------------------------------------
// Embedding cache, transformers, AutoML
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ValidationRulesRequest {
    pub rules: Vec<modelforge_ops::FieldRule>,
}

pub async fn set_validation_rules(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ModelId>,
    Json(request): Json<ValidationRulesRequest>,
) -> ApiResult<Json<Envelope<Value>>> {
    let tenant = tenant(&headers)?;
    state.registry.get_for_tenant(id, &tenant)?;
    let count = request.rules.len();
    state.validator.set_rules(id, request.rules);
    Ok(Json(Envelope::success(json!({ "rules": count }))))
}

#[derive(Debug, Deserialize)]
pub struct WarmupRequest {
    pub feature: String,
    pub values: Vec<String>,
}

pub async fn warmup_embeddings(
    State(state): State<AppState>,
    Json(request): Json<WarmupRequest>,
) -> ApiResult<Json<Envelope<Value>>> {
    let warmed = state
        .embeddings
        .warmup(&request.feature, &request.values)
        .await?;
    Ok(Json(Envelope::success(json!({ "warmed": warmed }))))
}

pub async fn embedding_stats(State(state): State<AppState>) -> Json<Envelope<Value>> {
    Json(Envelope::success(
        serde_json::to_value(state.embeddings.stats()).unwrap_or(Value::Null),
    ))
}

pub async fn list_transformers(State(state): State<AppState>) -> ApiResult<Json<Envelope<Value>>> {
    Ok(Json(Envelope::success(serde_json::to_value(
        state.transformers.list(),
    )?)))
}

pub async fn register_transformer(
    State(state): State<AppState>,
    Json(spec): Json<TransformerSpec>,
) -> ApiResult<Json<Envelope<Value>>> {
    let name = spec.name.clone();
    state.transformers.register(spec)?;
    Ok(Json(Envelope::success(json!({ "registered": name }))))
}

#[derive(Debug, Deserialize)]
pub struct AutomlRequest {
    pub source: String,
    pub features: Vec<String>,
    pub target: Option<String>,
    #[serde(rename = "type")]
    pub kind: ModelKind,
    pub seed: Option<u64>,
}

pub async fn automl_train(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AutomlRequest>,
) -> ApiResult<Json<Envelope<Value>>> {
    let tenant = tenant(&headers)?;
    let provider = modelforge_core::resolve_provider(
        &request.source,
        &tenant,
        std::sync::Arc::clone(&state.documents),
    )?;
    let rows = provider
        .fetch(state.settings.training.train_limit)
        .await?;

    let seed = request.seed.unwrap_or(state.settings.training.seed);
    let prep = PrepConfig {
        features: request.features,
        target: request.target,
        text_features: vec![],
        use_embeddings: false,
        model_kind: request.kind,
        max_categorical: state.settings.prep.max_categorical,
        seed,
    };
    let constraints = SearchConstraints::for_kind(request.kind);
    let outcome = state.automl.search(&rows, &prep, &constraints, seed).await?;
    Ok(Json(Envelope::success(serde_json::to_value(outcome)?)))
}
