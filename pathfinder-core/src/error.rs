use thiserror::Error;

use crate::llm::LlmError;

#[derive(Error, Debug)]
pub enum PathfinderError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}
