use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Reflection {
    pub id: Uuid,
    pub realm_id: Uuid,
    pub question: String,
    pub answer: Option<String>,
    pub category: String,
    pub importance_score: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reflection {
    /// A reflection counts as answered once it holds non-blank text.
    pub fn is_answered(&self) -> bool {
        self.answer.as_deref().is_some_and(|a| !a.trim().is_empty())
    }
}
