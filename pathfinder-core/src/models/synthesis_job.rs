use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

text_enum! {
    JobStatus {
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

impl JobStatus {
    /// Completed, failed and cancelled jobs never change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

text_enum! {
    SynthesisType {
        Full => "full",
        Incremental => "incremental",
    }
}

impl Default for SynthesisType {
    fn default() -> Self {
        SynthesisType::Full
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SynthesisJob {
    pub id: Uuid,
    pub realm_id: Uuid,
    pub status: JobStatus,
    pub synthesis_type: SynthesisType,
    pub input_sources: Vec<Uuid>,
    pub configuration: serde_json::Value,
    pub result_prompt: Option<String>,
    pub quality_analysis: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub processing_time_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SynthesisQueueEntry {
    pub id: Uuid,
    pub realm_id: Uuid,
    pub content_source_id: Uuid,
    pub queued_at: DateTime<Utc>,
    pub processed: bool,
}
