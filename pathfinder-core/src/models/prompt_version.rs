use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

text_enum! {
    /// How a prompt version was produced.
    SynthesisMethod {
        Simple => "simple",
        Advanced => "advanced",
        Incremental => "incremental",
        Manual => "manual",
        Legacy => "legacy",
    }
}

/// Immutable record of a realm's system prompt at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PromptVersion {
    pub id: Uuid,
    pub realm_id: Uuid,
    pub version_number: i32,
    pub content: String,
    pub synthesis_method: SynthesisMethod,
    pub quality_score: Option<f64>,
    pub effectiveness_metrics: serde_json::Value,
    pub improvement_suggestions: Vec<String>,
    pub created_at: DateTime<Utc>,
}
