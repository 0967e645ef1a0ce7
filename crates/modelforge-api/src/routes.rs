use crate::{handlers, AppState};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub fn create_router(state: AppState) -> Router {
    let payload_cap = state.settings.prediction.max_payload_bytes;

    // Predict routes carry the payload cap; everything else uses the
    // framework default.
    let predict_routes = Router::new()
        .route("/ai/models/{id}/predict", post(handlers::predict))
        .route(
            "/ai/models/{id}/batch-predict",
            post(handlers::batch_predict),
        )
        .layer(DefaultBodyLimit::max(payload_cap));

    Router::new()
        // Service
        .route("/ai/health", get(handlers::service_health))
        .route("/ai/stats", get(handlers::service_stats))
        // Models
        .route(
            "/ai/models",
            get(handlers::list_models).post(handlers::create_model),
        )
        .route(
            "/ai/models/{id}",
            get(handlers::get_model).delete(handlers::delete_model),
        )
        .route("/ai/models/{id}/promote", post(handlers::promote_version))
        .route("/ai/models/{id}/archive", post(handlers::archive_versions))
        .route("/ai/models/{id}/best-version", get(handlers::best_version))
        // Predictions
        .merge(predict_routes)
        .route(
            "/ai/models/{id}/predictions",
            get(handlers::list_predictions),
        )
        .route(
            "/ai/predictions/{id}/feedback",
            post(handlers::submit_feedback),
        )
        // Incremental learning
        .route(
            "/ai/models/{id}/incremental-update",
            post(handlers::incremental_update),
        )
        .route(
            "/ai/models/{id}/incremental-history",
            get(handlers::incremental_history),
        )
        // A/B testing
        .route("/ai/ab-tests", post(handlers::start_ab_test))
        .route("/ai/ab-tests/{id}", get(handlers::ab_test_results))
        .route("/ai/ab-tests/{id}/stop", post(handlers::stop_ab_test))
        // Evaluation and monitoring
        .route(
            "/ai/models/{id}/feature-importance",
            post(handlers::feature_importance),
        )
        .route("/ai/models/{id}/evaluate", post(handlers::evaluate_model))
        .route("/ai/models/{id}/compare", post(handlers::compare_versions))
        .route("/ai/models/{id}/health", get(handlers::model_health))
        .route("/ai/models/{id}/metrics", get(handlers::model_metrics))
        .route(
            "/ai/models/{id}/drift-detection",
            post(handlers::drift_detection),
        )
        // Deployment
        .route("/ai/models/{id}/deploy", post(handlers::deploy_model))
        .route("/ai/models/{id}/rollback", post(handlers::rollback_model))
        .route(
            "/ai/deployments/{id}/cancel",
            post(handlers::cancel_deployment),
        )
        .route(
            "/ai/models/{id}/validation-rules",
            post(handlers::set_validation_rules),
        )
        // Embeddings and transformers
        .route(
            "/ai/embeddings/cache/warmup",
            post(handlers::warmup_embeddings),
        )
        .route("/ai/embeddings/cache/stats", get(handlers::embedding_stats))
        .route(
            "/ai/transformers",
            get(handlers::list_transformers).post(handlers::register_transformer),
        )
        // AutoML
        .route("/ai/automl/train", post(handlers::automl_train))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
