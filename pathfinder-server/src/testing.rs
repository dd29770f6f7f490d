//! Canned model backend for unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use pathfinder_core::llm::{GenerateRequest, LlmBackend, LlmError, TextStream};

/// Replies with the scripted strings in order and records every prompt.
/// Once the script runs out, calls fail with an API error.
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new(replies: Vec<&str>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(String::from).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Same as `new`; named for tests that rely on the failure after the script.
    pub fn failing_after(replies: Vec<&str>) -> Self {
        Self::new(replies)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    fn next(&self, request: &GenerateRequest) -> Result<String, LlmError> {
        let prompt = request
            .turns
            .iter()
            .map(|t| t.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        self.prompts.lock().unwrap().push(prompt);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::Api {
                code: 503,
                message: "script exhausted".to_string(),
            })
    }
}

#[async_trait]
impl LlmBackend for ScriptedLlm {
    async fn generate(&self, request: &GenerateRequest) -> Result<String, LlmError> {
        self.next(request)
    }

    async fn stream(&self, request: &GenerateRequest) -> Result<TextStream, LlmError> {
        let reply = self.next(request)?;
        let chunks: Vec<Result<String, LlmError>> = reply
            .split_inclusive(' ')
            .map(|c| Ok(c.to_string()))
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }

    fn model(&self) -> &str {
        "scripted"
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
