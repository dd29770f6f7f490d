pub mod analysis;
pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod models;
pub mod prompts;
pub mod triggers;

pub use config::PathfinderConfig;
pub use error::PathfinderError;
pub use llm::{ChatTurn, GeminiClient, GenerateRequest, LlmBackend, LlmError, TextStream};
pub use triggers::{should_trigger, TriggerDecision, TriggerInputs};
