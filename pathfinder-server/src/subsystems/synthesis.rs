//! Prompt synthesis.
//!
//! - **simple**: answered reflections and weighted sources, one model call
//! - **advanced**: four stages (content analysis, persona extraction,
//!   prompt engineering, quality assessment)
//!
//! Model calls happen before any transaction is opened. A run that fails
//! upstream writes nothing. Stage replies that are not valid JSON fall back
//! to the stage defaults in `pathfinder_core::prompts`.

use std::time::Instant;

use pathfinder_core::llm::{GenerateRequest, LlmBackend, LlmError};
use pathfinder_core::models::{
    ContentSource, PromptVersion, Realm, Reflection, SynthesisMethod, SynthesisType,
};
use pathfinder_core::prompts::{
    self, ContentAnalysis, PersonaProfile, QaPair, QualityAssessment,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::subsystems::content_sources;
use crate::subsystems::realms;
use crate::subsystems::versions::{commit_version, NewVersion};

#[derive(Debug, Serialize)]
pub struct SynthesisResult {
    pub realm_id: Uuid,
    pub version_number: i32,
    pub synthesized_prompt: String,
}

impl From<PromptVersion> for SynthesisResult {
    fn from(version: PromptVersion) -> Self {
        Self {
            realm_id: version.realm_id,
            version_number: version.version_number,
            synthesized_prompt: version.content,
        }
    }
}

// ============================================================================
// Simple synthesis
// ============================================================================

pub fn answered_pairs(reflections: &[Reflection]) -> Vec<QaPair> {
    reflections
        .iter()
        .filter(|r| r.is_answered())
        .map(|r| QaPair {
            question: r.question.clone(),
            answer: r.answer.clone().unwrap_or_default(),
        })
        .collect()
}

/// Model output with any surrounding code fence removed; empty output is an upstream failure.
fn clean_prompt(reply: &str) -> ApiResult<String> {
    let prompt = prompts::strip_code_fences(reply);
    if prompt.is_empty() {
        return Err(ApiError::Upstream("Model returned an empty prompt".to_string()));
    }
    Ok(prompt)
}

pub async fn synthesize_simple(
    pool: &PgPool,
    llm: &dyn LlmBackend,
    realm_id: Uuid,
) -> ApiResult<SynthesisResult> {
    let realm = realms::get(pool, realm_id).await?;

    let reflections: Vec<Reflection> =
        sqlx::query_as("SELECT * FROM reflections WHERE realm_id = $1 ORDER BY created_at")
            .bind(realm_id)
            .fetch_all(pool)
            .await?;
    let qa_pairs = answered_pairs(&reflections);
    let sources = content_sources::list_for_realm(pool, realm_id).await?;

    if qa_pairs.is_empty() && sources.is_empty() {
        return Err(ApiError::bad_request(
            "Nothing to synthesize: answer a reflection or add a content source first",
        ));
    }

    let prompt = prompts::simple_synthesis_prompt(
        &realm.name,
        realm.system_prompt.as_deref(),
        &qa_pairs,
        &sources,
    );
    let reply = llm.generate(&GenerateRequest::prompt(prompt)).await?;
    let synthesized = clean_prompt(&reply)?;

    let source_ids: Vec<Uuid> = sources.iter().map(|s| s.id).collect();
    let mut version = NewVersion::new(synthesized, SynthesisMethod::Simple);
    version.effectiveness_metrics = serde_json::json!({
        "answered_reflections": qa_pairs.len(),
        "content_sources": source_ids.len(),
        "model": llm.model(),
    });

    let mut tx = pool.begin().await?;
    let committed = commit_version(&mut *tx, realm_id, version).await?;
    content_sources::mark_used(&mut *tx, &source_ids).await?;
    tx.commit().await?;

    tracing::info!(
        realm_id = %realm_id,
        version = committed.version_number,
        reflections = qa_pairs.len(),
        sources = source_ids.len(),
        "Simple synthesis complete"
    );

    Ok(committed.into())
}

// ============================================================================
// Advanced pipeline
// ============================================================================

/// Everything the four stages produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutcome {
    pub prompt: String,
    pub content_analysis: ContentAnalysis,
    pub persona_profile: PersonaProfile,
    pub quality_assessment: QualityAssessment,
    pub source_ids: Vec<Uuid>,
    pub processing_time_ms: i64,
}

impl PipelineOutcome {
    /// The JSON stored as a job's `quality_analysis`.
    pub fn analysis_json(&self, synthesis_type: SynthesisType) -> serde_json::Value {
        serde_json::json!({
            "content_analysis": self.content_analysis,
            "persona_profile": self.persona_profile,
            "quality_assessment": self.quality_assessment,
            "synthesis_metadata": {
                "method": SynthesisMethod::Advanced,
                "content_sources_count": self.source_ids.len(),
                "content_source_ids": self.source_ids,
                "processing_time_ms": self.processing_time_ms,
                "synthesis_type": synthesis_type,
            },
        })
    }

    pub fn into_version(self) -> NewVersion {
        let quality = self.quality_assessment;
        NewVersion {
            quality_score: Some(quality.overall_quality),
            improvement_suggestions: quality.improvement_suggestions.clone(),
            effectiveness_metrics: serde_json::to_value(&quality)
                .unwrap_or_else(|_| serde_json::json!({})),
            content: self.prompt,
            method: SynthesisMethod::Advanced,
        }
    }
}

async fn ask(llm: &dyn LlmBackend, prompt: String) -> Result<String, LlmError> {
    llm.generate(&GenerateRequest::prompt(prompt)).await
}

pub async fn analyze_sources(
    llm: &dyn LlmBackend,
    realm_name: &str,
    existing_prompt: Option<&str>,
    sources: &[ContentSource],
) -> Result<ContentAnalysis, LlmError> {
    let reply = ask(
        llm,
        prompts::content_analysis_prompt(realm_name, existing_prompt, sources),
    )
    .await?;
    Ok(prompts::parse_or_fallback("content_analysis", &reply, ContentAnalysis::fallback))
}

pub async fn assess_prompt(
    llm: &dyn LlmBackend,
    realm_name: &str,
    prompt: &str,
    persona: Option<&PersonaProfile>,
    source_count: usize,
) -> Result<QualityAssessment, LlmError> {
    let reply = ask(
        llm,
        prompts::quality_prompt(realm_name, prompt, persona, source_count),
    )
    .await?;
    Ok(prompts::parse_or_fallback("quality_assessment", &reply, QualityAssessment::fallback))
}

/// Run the four stages. Touches no storage.
pub async fn run_pipeline(
    llm: &dyn LlmBackend,
    realm: &Realm,
    sources: &[ContentSource],
) -> ApiResult<PipelineOutcome> {
    if sources.is_empty() {
        return Err(ApiError::bad_request("No content sources to synthesize"));
    }

    let started = Instant::now();
    let existing = realm.system_prompt.as_deref();
    tracing::info!(realm_id = %realm.id, sources = sources.len(), "Starting advanced synthesis");

    let content_analysis = analyze_sources(llm, &realm.name, existing, sources).await?;
    tracing::debug!(themes = content_analysis.themes.len(), "Stage 1 (analysis) done");

    let reply = ask(
        llm,
        prompts::persona_prompt(&realm.name, &content_analysis, sources),
    )
    .await?;
    let persona_profile = prompts::parse_or_fallback("persona", &reply, PersonaProfile::fallback);
    tracing::debug!("Stage 2 (persona) done");

    let reply = ask(
        llm,
        prompts::engineering_prompt(&realm.name, &persona_profile, &content_analysis, existing),
    )
    .await?;
    let prompt = clean_prompt(&reply)?;
    tracing::debug!(chars = prompt.chars().count(), "Stage 3 (engineering) done");

    let quality_assessment = assess_prompt(
        llm,
        &realm.name,
        &prompt,
        Some(&persona_profile),
        sources.len(),
    )
    .await?;

    let processing_time_ms = started.elapsed().as_millis() as i64;
    tracing::info!(
        realm_id = %realm.id,
        quality = quality_assessment.overall_quality,
        processing_time_ms,
        "Advanced synthesis pipeline finished"
    );

    Ok(PipelineOutcome {
        prompt,
        content_analysis,
        persona_profile,
        quality_assessment,
        source_ids: sources.iter().map(|s| s.id).collect(),
        processing_time_ms,
    })
}

/// The given sources, or every source of the realm when `ids` is empty.
pub async fn load_sources(
    pool: &PgPool,
    realm_id: Uuid,
    ids: &[Uuid],
) -> ApiResult<Vec<ContentSource>> {
    if ids.is_empty() {
        content_sources::list_for_realm(pool, realm_id).await
    } else {
        content_sources::get_many(pool, ids).await
    }
}

/// Run the pipeline and commit its result as an `advanced` version.
pub async fn synthesize_advanced(
    pool: &PgPool,
    llm: &dyn LlmBackend,
    realm_id: Uuid,
    source_ids: &[Uuid],
) -> ApiResult<(PromptVersion, PipelineOutcome)> {
    let realm = realms::get(pool, realm_id).await?;
    let sources = load_sources(pool, realm_id, source_ids).await?;
    let outcome = run_pipeline(llm, &realm, &sources).await?;

    let mut tx = pool.begin().await?;
    let committed = commit_version(&mut *tx, realm_id, outcome.clone().into_version()).await?;
    content_sources::mark_used(&mut *tx, &outcome.source_ids).await?;
    tx.commit().await?;

    Ok((committed, outcome))
}

/// Synchronous full synthesis over every source of the realm.
pub async fn force_full(
    pool: &PgPool,
    llm: &dyn LlmBackend,
    realm_id: Uuid,
) -> ApiResult<serde_json::Value> {
    let (version, outcome) = synthesize_advanced(pool, llm, realm_id, &[]).await?;
    Ok(serde_json::json!({
        "message": "Full synthesis completed",
        "realm_id": realm_id,
        "version_number": version.version_number,
        "quality_score": version.quality_score,
        "prompt_preview": content_sources::preview(&version.content, 300),
        "processing_time_ms": outcome.processing_time_ms,
        "operation": "full_synthesis",
    }))
}

#[derive(Debug, Deserialize)]
pub struct TextSynthesisRequest {
    pub realm_id: Uuid,
}

/// Run the pipeline on the content source carried over from one text.
pub async fn synthesize_text(
    pool: &PgPool,
    llm: &dyn LlmBackend,
    text_id: Uuid,
    req: TextSynthesisRequest,
) -> ApiResult<SynthesisResult> {
    let source = content_sources::get_or_create_for_text(pool, text_id, req.realm_id).await?;
    let (version, _) = synthesize_advanced(pool, llm, req.realm_id, &[source.id]).await?;
    Ok(version.into())
}

// ============================================================================
// Single-stage endpoints
// ============================================================================

#[derive(Debug, Deserialize, Default)]
pub struct AnalyzeParams {
    pub target_realm_id: Option<Uuid>,
}

const UNKNOWN_REALM: &str = "Unknown Realm";

/// Stage 1 on one source, in the context of `target_realm_id` when given.
pub async fn analyze_source(
    pool: &PgPool,
    llm: &dyn LlmBackend,
    source_id: Uuid,
    params: AnalyzeParams,
) -> ApiResult<ContentAnalysis> {
    let source = content_sources::get(pool, source_id).await?;

    let realm = match params.target_realm_id.or(source.realm_id) {
        Some(realm_id) => Some(realms::get(pool, realm_id).await?),
        None => None,
    };
    let realm_name = realm.as_ref().map(|r| r.name.as_str()).unwrap_or(UNKNOWN_REALM);
    let existing = realm.as_ref().and_then(|r| r.system_prompt.as_deref());

    Ok(analyze_sources(llm, realm_name, existing, std::slice::from_ref(&source)).await?)
}

/// Stage 4 on a stored version.
pub async fn assess_version(
    pool: &PgPool,
    llm: &dyn LlmBackend,
    version_id: Uuid,
) -> ApiResult<QualityAssessment> {
    let version = crate::subsystems::versions::get(pool, version_id).await?;
    let realm = realms::get(pool, version.realm_id).await?;

    let (source_count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM content_sources WHERE realm_id = $1")
            .bind(realm.id)
            .fetch_one(pool)
            .await?;

    Ok(assess_prompt(llm, &realm.name, &version.content, None, source_count as usize).await?)
}

/// Stage 1 over every source of the realm.
pub async fn realm_content_analysis(
    pool: &PgPool,
    llm: &dyn LlmBackend,
    realm_id: Uuid,
) -> ApiResult<serde_json::Value> {
    let realm = realms::get(pool, realm_id).await?;
    let sources = content_sources::list_for_realm(pool, realm_id).await?;

    if sources.is_empty() {
        return Ok(serde_json::json!({
            "realm_id": realm_id,
            "realm_name": realm.name,
            "message": "No content sources found for analysis",
            "content_sources_count": 0,
        }));
    }

    let analysis =
        analyze_sources(llm, &realm.name, realm.system_prompt.as_deref(), &sources).await?;

    Ok(serde_json::json!({
        "realm_id": realm_id,
        "realm_name": realm.name,
        "content_sources_count": sources.len(),
        "analysis": analysis,
        "analyzed_at": chrono::Utc::now(),
    }))
}
