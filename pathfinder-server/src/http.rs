//! Pathfinder HTTP API
//!
//! Axum router over the persistence and synthesis subsystems. Handlers are
//! thin: they extract path, query and body, call into `subsystems`, and let
//! `ApiError` shape failures as `{"error", "status": "error"}`.
//!
//! Service endpoints:
//! - GET /         - greeting with the server version
//! - GET /health   - DB status (200 or 503)
//! - GET /version  - version and protocol

use std::sync::Arc;

use anyhow::Result;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use pathfinder_core::llm::LlmBackend;
use pathfinder_core::models::{
    Chat, ChatMessage, ContentSource, ConversationMetrics, PromptVersion, Realm, Reflection,
    SynthesisJob, Text,
};
use pathfinder_core::prompts::{ContentAnalysis, QualityAssessment};
use pathfinder_core::PathfinderConfig;
use serde::Deserialize;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::extract::{optional_json, ApiJson, ApiPath, ApiQuery};
use crate::subsystems::chats::{
    self, ChatFilter, CreateChat, CreateMessage, Exchange, SendMessage, UpdateChat,
};
use crate::subsystems::content_sources::{
    self, ContentMap, CreateContentSource, Insights, MigrationReport, SourceFilter,
    UpdateContentSource,
};
use crate::subsystems::jobs::{self, JobAccepted, StartJob};
use crate::subsystems::metrics::{self, RealmAnalytics};
use crate::subsystems::realms::{self, CreateRealm, UpdateRealm};
use crate::subsystems::reflections::{self, AnswerReflection, GenerateParams};
use crate::subsystems::smart::{
    self, BatchOutcome, CreateParams, CreatedSource, UpdateParams, WeightParams, WeightUpdate,
};
use crate::subsystems::synthesis::{self, AnalyzeParams, SynthesisResult, TextSynthesisRequest};
use crate::subsystems::texts::{self, CreateText, UpdateText};
use crate::subsystems::versions;

pub const PROTOCOL: &str = "pathfinder/1";

/// Shared state for all HTTP handlers
#[derive(Clone)]
pub struct HttpState {
    pub pool: PgPool,
    pub config: PathfinderConfig,
    pub llm: Arc<dyn LlmBackend>,
}

type AppState = State<Arc<HttpState>>;

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    let cors = cors_layer(&state.config.http.cors_origins);

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Realms
        .route("/realms", get(list_realms).post(create_realm))
        .route(
            "/realms/:id",
            get(get_realm).put(update_realm).delete(delete_realm),
        )
        .route("/realms/:id/prompt-versions", get(list_versions))
        .route("/realms/:id/analytics", get(realm_analytics))
        // Synthesis
        .route("/realms/:id/synthesize", post(synthesize_simple))
        .route("/realms/:id/synthesize/advanced", post(start_advanced))
        .route("/realms/:id/synthesis-jobs", get(list_jobs))
        .route("/realms/:id/force-full-synthesis", post(force_full_synthesis))
        .route("/realms/:id/process-batch-queue", post(process_batch_queue))
        .route("/realms/:id/content-analysis", get(realm_content_analysis))
        .route("/realms/:id/content-map", get(content_map))
        .route("/realms/:id/content-sources", get(realm_sources))
        .route("/synthesis-jobs/:id", get(get_job).delete(cancel_job))
        .route("/prompt-versions/:id", get(get_version))
        .route("/prompts/:id/assess-quality", post(assess_quality))
        // Reflections
        .route("/realms/:id/generate-questions", post(generate_questions))
        .route("/realms/:id/reflections", get(unanswered_reflections))
        .route("/realms/:id/reflections/archived", get(answered_reflections))
        .route(
            "/reflections/:id",
            put(answer_reflection).delete(delete_reflection),
        )
        // Texts
        .route("/texts", get(list_texts).post(create_text))
        .route(
            "/texts/:id",
            get(get_text).put(update_text).delete(delete_text),
        )
        .route("/texts/:id/synthesize/advanced", post(synthesize_text))
        // Chats
        .route("/chats", get(list_chats).post(create_chat))
        .route(
            "/chats/:id",
            get(get_chat).put(update_chat).delete(delete_chat),
        )
        .route("/chats/:id/messages", get(list_messages).post(create_message))
        .route("/chats/:id/send", post(send_message))
        .route("/chats/:id/stream", post(stream_message))
        .route("/chats/:id/metrics", get(chat_metrics))
        // Content sources
        .route("/content-sources", get(list_sources).post(create_source))
        .route(
            "/content-sources/migrate-from-reflections",
            post(migrate_reflections),
        )
        .route("/content-sources/migrate-from-texts", post(migrate_texts))
        .route(
            "/content-sources/:id",
            get(get_source).put(update_source).delete(delete_source),
        )
        .route("/content-sources/:id/weight", put(update_weight))
        .route("/content-sources/:id/analyze", post(analyze_source))
        .route(
            "/content-sources/:id/extract-lightweight-insights",
            post(extract_insights),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// CORS for the configured frontend origins. Unparsable origins are skipped.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    pool: PgPool,
    config: PathfinderConfig,
    llm: Arc<dyn LlmBackend>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", config.http.host, config.http.port);
    let state = Arc::new(HttpState { pool, config, llm });

    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Pathfinder HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Service endpoints
// ============================================================================

/// Queries the DB and returns (status_code, json_body).
pub async fn health_inner(pool: &PgPool, llm: &dyn LlmBackend) -> (StatusCode, serde_json::Value) {
    match pathfinder_core::db::health_check(pool).await {
        Ok(pg_ver) => (
            StatusCode::OK,
            serde_json::json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "postgresql": pg_ver,
                "llm": { "backend": llm.name(), "model": llm.model() },
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "unhealthy",
                "error": e.to_string(),
            }),
        ),
    }
}

pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL,
    })
}

pub fn root_inner() -> serde_json::Value {
    serde_json::json!({
        "message": "Pathfinder API",
        "version": env!("CARGO_PKG_VERSION"),
    })
}

async fn root_handler() -> impl IntoResponse {
    Json(root_inner())
}

async fn health_handler(State(state): AppState) -> impl IntoResponse {
    let (status, body) = health_inner(&state.pool, state.llm.as_ref()).await;
    (status, Json(body))
}

async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

// ============================================================================
// Realms and versions
// ============================================================================

async fn list_realms(State(state): AppState) -> ApiResult<Json<Vec<Realm>>> {
    Ok(Json(realms::list(&state.pool).await?))
}

async fn create_realm(
    State(state): AppState,
    ApiJson(req): ApiJson<CreateRealm>,
) -> ApiResult<(StatusCode, Json<Realm>)> {
    Ok((StatusCode::CREATED, Json(realms::create(&state.pool, req).await?)))
}

async fn get_realm(State(state): AppState, ApiPath(id): ApiPath<Uuid>) -> ApiResult<Json<Realm>> {
    Ok(Json(realms::get(&state.pool, id).await?))
}

async fn update_realm(
    State(state): AppState,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<UpdateRealm>,
) -> ApiResult<Json<Realm>> {
    Ok(Json(realms::update(&state.pool, id, req).await?))
}

async fn delete_realm(State(state): AppState, ApiPath(id): ApiPath<Uuid>) -> ApiResult<StatusCode> {
    realms::delete(&state.pool, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_versions(
    State(state): AppState,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<Vec<PromptVersion>>> {
    Ok(Json(versions::list_for_realm(&state.pool, id).await?))
}

async fn get_version(
    State(state): AppState,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<PromptVersion>> {
    Ok(Json(versions::get(&state.pool, id).await?))
}

async fn realm_analytics(
    State(state): AppState,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<RealmAnalytics>> {
    Ok(Json(metrics::for_realm(&state.pool, id).await?))
}

// ============================================================================
// Synthesis
// ============================================================================

async fn synthesize_simple(
    State(state): AppState,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<SynthesisResult>> {
    Ok(Json(
        synthesis::synthesize_simple(&state.pool, state.llm.as_ref(), id).await?,
    ))
}

async fn start_advanced(
    State(state): AppState,
    ApiPath(id): ApiPath<Uuid>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<JobAccepted>)> {
    let req: StartJob = optional_json(&body)?;
    let accepted = jobs::start(
        &state.pool,
        state.llm.clone(),
        &state.config.synthesis,
        id,
        req,
    )
    .await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

async fn list_jobs(
    State(state): AppState,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<Vec<SynthesisJob>>> {
    Ok(Json(jobs::list_for_realm(&state.pool, id).await?))
}

async fn get_job(State(state): AppState, ApiPath(id): ApiPath<Uuid>) -> ApiResult<Json<SynthesisJob>> {
    Ok(Json(jobs::get(&state.pool, id).await?))
}

async fn cancel_job(
    State(state): AppState,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<SynthesisJob>> {
    Ok(Json(jobs::cancel(&state.pool, id).await?))
}

async fn force_full_synthesis(
    State(state): AppState,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    Ok(Json(
        synthesis::force_full(&state.pool, state.llm.as_ref(), id).await?,
    ))
}

async fn process_batch_queue(
    State(state): AppState,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<BatchOutcome>> {
    Ok(Json(
        smart::process_batch_queue(
            &state.pool,
            state.llm.as_ref(),
            &state.config.synthesis,
            id,
        )
        .await?,
    ))
}

async fn realm_content_analysis(
    State(state): AppState,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    Ok(Json(
        synthesis::realm_content_analysis(&state.pool, state.llm.as_ref(), id).await?,
    ))
}

async fn content_map(State(state): AppState, ApiPath(id): ApiPath<Uuid>) -> ApiResult<Json<ContentMap>> {
    Ok(Json(content_sources::content_map(&state.pool, id).await?))
}

async fn assess_quality(
    State(state): AppState,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<QualityAssessment>> {
    Ok(Json(
        synthesis::assess_version(&state.pool, state.llm.as_ref(), id).await?,
    ))
}

async fn synthesize_text(
    State(state): AppState,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<TextSynthesisRequest>,
) -> ApiResult<Json<SynthesisResult>> {
    Ok(Json(
        synthesis::synthesize_text(&state.pool, state.llm.as_ref(), id, req).await?,
    ))
}

// ============================================================================
// Reflections
// ============================================================================

async fn generate_questions(
    State(state): AppState,
    ApiPath(id): ApiPath<Uuid>,
    ApiQuery(params): ApiQuery<GenerateParams>,
) -> ApiResult<Json<Vec<Reflection>>> {
    Ok(Json(
        reflections::generate_questions(
            &state.pool,
            state.llm.as_ref(),
            &state.config.synthesis,
            id,
            params,
        )
        .await?,
    ))
}

async fn unanswered_reflections(
    State(state): AppState,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<Vec<Reflection>>> {
    Ok(Json(reflections::unanswered(&state.pool, id).await?))
}

async fn answered_reflections(
    State(state): AppState,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<Vec<Reflection>>> {
    Ok(Json(reflections::answered(&state.pool, id).await?))
}

async fn answer_reflection(
    State(state): AppState,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<AnswerReflection>,
) -> ApiResult<Json<Reflection>> {
    Ok(Json(reflections::answer(&state.pool, id, req).await?))
}

async fn delete_reflection(State(state): AppState, ApiPath(id): ApiPath<Uuid>) -> ApiResult<StatusCode> {
    reflections::delete(&state.pool, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Texts
// ============================================================================

async fn list_texts(State(state): AppState) -> ApiResult<Json<Vec<Text>>> {
    Ok(Json(texts::list(&state.pool).await?))
}

async fn create_text(
    State(state): AppState,
    ApiJson(req): ApiJson<CreateText>,
) -> ApiResult<(StatusCode, Json<Text>)> {
    Ok((StatusCode::CREATED, Json(texts::create(&state.pool, req).await?)))
}

async fn get_text(State(state): AppState, ApiPath(id): ApiPath<Uuid>) -> ApiResult<Json<Text>> {
    Ok(Json(texts::get(&state.pool, id).await?))
}

async fn update_text(
    State(state): AppState,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<UpdateText>,
) -> ApiResult<Json<Text>> {
    Ok(Json(texts::update(&state.pool, id, req).await?))
}

async fn delete_text(State(state): AppState, ApiPath(id): ApiPath<Uuid>) -> ApiResult<StatusCode> {
    texts::delete(&state.pool, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Chats
// ============================================================================

async fn list_chats(
    State(state): AppState,
    ApiQuery(filter): ApiQuery<ChatFilter>,
) -> ApiResult<Json<Vec<Chat>>> {
    Ok(Json(chats::list(&state.pool, filter).await?))
}

async fn create_chat(
    State(state): AppState,
    ApiJson(req): ApiJson<CreateChat>,
) -> ApiResult<(StatusCode, Json<Chat>)> {
    Ok((StatusCode::CREATED, Json(chats::create(&state.pool, req).await?)))
}

async fn get_chat(State(state): AppState, ApiPath(id): ApiPath<Uuid>) -> ApiResult<Json<Chat>> {
    Ok(Json(chats::get(&state.pool, id).await?))
}

async fn update_chat(
    State(state): AppState,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<UpdateChat>,
) -> ApiResult<Json<Chat>> {
    Ok(Json(chats::update(&state.pool, id, req).await?))
}

async fn delete_chat(State(state): AppState, ApiPath(id): ApiPath<Uuid>) -> ApiResult<StatusCode> {
    chats::delete(&state.pool, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_messages(
    State(state): AppState,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<Vec<ChatMessage>>> {
    Ok(Json(chats::messages(&state.pool, id).await?))
}

async fn create_message(
    State(state): AppState,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<CreateMessage>,
) -> ApiResult<(StatusCode, Json<ChatMessage>)> {
    Ok((
        StatusCode::CREATED,
        Json(chats::create_message(&state.pool, id, req).await?),
    ))
}

async fn send_message(
    State(state): AppState,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<SendMessage>,
) -> ApiResult<Json<Exchange>> {
    Ok(Json(
        chats::send(&state.pool, state.llm.as_ref(), id, &req.content).await?,
    ))
}

async fn stream_message(
    State(state): AppState,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<SendMessage>,
) -> ApiResult<Response> {
    let chunks = chats::stream(&state.pool, state.llm.as_ref(), id, &req.content).await?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(chunks),
    )
        .into_response())
}

async fn chat_metrics(
    State(state): AppState,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<ConversationMetrics>> {
    Ok(Json(metrics::for_chat(&state.pool, id).await?))
}

// ============================================================================
// Content sources
// ============================================================================

#[derive(Debug, Deserialize, Default)]
pub struct RealmScope {
    pub realm_id: Option<Uuid>,
}

async fn list_sources(
    State(state): AppState,
    ApiQuery(filter): ApiQuery<SourceFilter>,
) -> ApiResult<Json<Vec<ContentSource>>> {
    Ok(Json(content_sources::list(&state.pool, filter).await?))
}

async fn realm_sources(
    State(state): AppState,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<Vec<ContentSource>>> {
    Ok(Json(content_sources::list_for_realm(&state.pool, id).await?))
}

async fn create_source(
    State(state): AppState,
    ApiQuery(params): ApiQuery<CreateParams>,
    ApiJson(req): ApiJson<CreateContentSource>,
) -> ApiResult<(StatusCode, Json<CreatedSource>)> {
    let created = smart::add_content_source(
        &state.pool,
        state.llm.as_ref(),
        &state.config.synthesis,
        req,
        params,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_source(
    State(state): AppState,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<ContentSource>> {
    Ok(Json(content_sources::get(&state.pool, id).await?))
}

async fn update_source(
    State(state): AppState,
    ApiPath(id): ApiPath<Uuid>,
    ApiQuery(params): ApiQuery<UpdateParams>,
    ApiJson(req): ApiJson<UpdateContentSource>,
) -> ApiResult<Json<ContentSource>> {
    Ok(Json(
        smart::update_content_source(&state.pool, state.llm.as_ref(), id, req, params).await?,
    ))
}

async fn delete_source(State(state): AppState, ApiPath(id): ApiPath<Uuid>) -> ApiResult<StatusCode> {
    content_sources::delete(&state.pool, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn update_weight(
    State(state): AppState,
    ApiPath(id): ApiPath<Uuid>,
    ApiQuery(params): ApiQuery<WeightParams>,
) -> ApiResult<Json<WeightUpdate>> {
    Ok(Json(
        smart::update_weight(&state.pool, state.llm.as_ref(), id, params).await?,
    ))
}

async fn analyze_source(
    State(state): AppState,
    ApiPath(id): ApiPath<Uuid>,
    ApiQuery(params): ApiQuery<AnalyzeParams>,
) -> ApiResult<Json<ContentAnalysis>> {
    Ok(Json(
        synthesis::analyze_source(&state.pool, state.llm.as_ref(), id, params).await?,
    ))
}

async fn extract_insights(
    State(state): AppState,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<Insights>> {
    Ok(Json(content_sources::extract_insights(&state.pool, id).await?))
}

async fn migrate_reflections(
    State(state): AppState,
    ApiQuery(scope): ApiQuery<RealmScope>,
) -> ApiResult<Json<MigrationReport>> {
    Ok(Json(
        content_sources::migrate_from_reflections(&state.pool, scope.realm_id).await?,
    ))
}

async fn migrate_texts(State(state): AppState) -> ApiResult<Json<MigrationReport>> {
    Ok(Json(content_sources::migrate_from_texts(&state.pool).await?))
}
