use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConversationMetrics {
    pub chat_id: Uuid,
    pub realm_id: Option<Uuid>,
    pub message_count: i64,
    pub user_message_count: i64,
    pub model_message_count: i64,
    pub total_characters: i64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationMetrics {
    /// Metrics for a chat that has no messages yet.
    pub fn empty(chat_id: Uuid, realm_id: Option<Uuid>) -> Self {
        Self {
            chat_id,
            realm_id,
            message_count: 0,
            user_message_count: 0,
            model_message_count: 0,
            total_characters: 0,
            last_message_at: None,
            updated_at: Utc::now(),
        }
    }
}
