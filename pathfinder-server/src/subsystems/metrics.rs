//! Conversation metrics and realm analytics.
//!
//! `conversation_metrics` holds one running-total row per chat, upserted in
//! the same transaction as each message insert.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use pathfinder_core::models::{ConversationMetrics, MessageRole};
use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};

pub async fn record_message(
    conn: &mut PgConnection,
    chat_id: Uuid,
    realm_id: Option<Uuid>,
    role: MessageRole,
    characters: usize,
) -> Result<(), sqlx::Error> {
    let (user, model): (i64, i64) = match role {
        MessageRole::User => (1, 0),
        MessageRole::Model => (0, 1),
    };

    sqlx::query(
        r#"
        INSERT INTO conversation_metrics
            (chat_id, realm_id, message_count, user_message_count, model_message_count,
             total_characters, last_message_at, updated_at)
        VALUES ($1, $2, 1, $3, $4, $5, now(), now())
        ON CONFLICT (chat_id) DO UPDATE SET
            realm_id = EXCLUDED.realm_id,
            message_count = conversation_metrics.message_count + 1,
            user_message_count = conversation_metrics.user_message_count + EXCLUDED.user_message_count,
            model_message_count = conversation_metrics.model_message_count + EXCLUDED.model_message_count,
            total_characters = conversation_metrics.total_characters + EXCLUDED.total_characters,
            last_message_at = now(),
            updated_at = now()
        "#,
    )
    .bind(chat_id)
    .bind(realm_id)
    .bind(user)
    .bind(model)
    .bind(characters as i64)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Zeros for a chat with no messages yet.
pub async fn for_chat(pool: &PgPool, chat_id: Uuid) -> ApiResult<ConversationMetrics> {
    let realm: Option<(Option<Uuid>,)> = sqlx::query_as("SELECT realm_id FROM chats WHERE id = $1")
        .bind(chat_id)
        .fetch_optional(pool)
        .await?;
    let (realm_id,) = realm.ok_or_else(|| ApiError::not_found("Chat"))?;

    let metrics: Option<ConversationMetrics> =
        sqlx::query_as("SELECT * FROM conversation_metrics WHERE chat_id = $1")
            .bind(chat_id)
            .fetch_optional(pool)
            .await?;

    Ok(metrics.unwrap_or_else(|| ConversationMetrics::empty(chat_id, realm_id)))
}

#[derive(Debug, Clone, Serialize)]
pub struct RealmAnalytics {
    pub realm_id: Uuid,
    pub chat_count: i64,
    pub message_count: i64,
    pub answered_reflections: i64,
    pub unanswered_reflections: i64,
    pub content_sources_total: i64,
    pub content_sources_by_type: BTreeMap<String, i64>,
    pub prompt_version_count: i64,
    pub current_version: i32,
    pub quality_score: Option<f64>,
    pub last_synthesis_at: Option<DateTime<Utc>>,
    pub pending_queue: i64,
}

pub async fn for_realm(pool: &PgPool, realm_id: Uuid) -> ApiResult<RealmAnalytics> {
    let realm = crate::subsystems::realms::get(pool, realm_id).await?;

    let (chat_count, message_count): (i64, i64) = sqlx::query_as(
        r#"
        SELECT COUNT(DISTINCT c.id), COUNT(m.id)
        FROM chats c
        LEFT JOIN chat_messages m ON m.chat_id = c.id
        WHERE c.realm_id = $1
        "#,
    )
    .bind(realm_id)
    .fetch_one(pool)
    .await?;

    let (answered, unanswered): (i64, i64) = sqlx::query_as(
        r#"
        SELECT
            COUNT(*) FILTER (WHERE answer IS NOT NULL AND btrim(answer) <> ''),
            COUNT(*) FILTER (WHERE answer IS NULL OR btrim(answer) = '')
        FROM reflections
        WHERE realm_id = $1
        "#,
    )
    .bind(realm_id)
    .fetch_one(pool)
    .await?;

    let by_type: Vec<(String, i64)> = sqlx::query_as(
        "SELECT source_type, COUNT(*) FROM content_sources WHERE realm_id = $1 GROUP BY source_type",
    )
    .bind(realm_id)
    .fetch_all(pool)
    .await?;

    let (prompt_version_count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM prompt_versions WHERE realm_id = $1")
            .bind(realm_id)
            .fetch_one(pool)
            .await?;

    let pending_queue = crate::subsystems::smart::pending_queue_size(pool, realm_id).await?;

    let content_sources_by_type: BTreeMap<String, i64> = by_type.into_iter().collect();

    Ok(RealmAnalytics {
        realm_id,
        chat_count,
        message_count,
        answered_reflections: answered,
        unanswered_reflections: unanswered,
        content_sources_total: content_sources_by_type.values().sum(),
        content_sources_by_type,
        prompt_version_count,
        current_version: realm.current_version,
        quality_score: realm.quality_score,
        last_synthesis_at: realm.last_synthesis_at,
        pending_queue,
    })
}
