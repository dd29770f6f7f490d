//! Decides whether a newly added content source synthesizes immediately or
//! waits in the batch queue.

use chrono::{DateTime, Utc};

use crate::config::SynthesisConfig;

/// Realm state needed to judge one new source.
#[derive(Debug, Clone)]
pub struct TriggerInputs {
    pub weight: f64,
    /// Character length of the new source.
    pub content_length: usize,
    /// Character length of all realm sources, the new one included.
    pub total_content_length: usize,
    pub last_synthesis_at: Option<DateTime<Utc>>,
    /// Unprocessed entries in the realm's synthesis queue.
    pub pending_queue_size: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TriggerDecision {
    HighWeight,
    /// Synthesized too recently and the source is not important enough to override.
    TooRecent,
    SignificantContent { ratio: f64 },
    BatchThreshold { pending: i64 },
    Queue,
}

impl TriggerDecision {
    pub fn triggers(&self) -> bool {
        matches!(
            self,
            TriggerDecision::HighWeight
                | TriggerDecision::SignificantContent { .. }
                | TriggerDecision::BatchThreshold { .. }
        )
    }

    pub fn reason(&self) -> &'static str {
        match self {
            TriggerDecision::HighWeight => "high_weight",
            TriggerDecision::TooRecent => "too_recent",
            TriggerDecision::SignificantContent { .. } => "significant_content",
            TriggerDecision::BatchThreshold { .. } => "batch_threshold",
            TriggerDecision::Queue => "queued",
        }
    }
}

/// Apply the thresholds in order; the first rule that matches decides.
pub fn should_trigger(
    inputs: &TriggerInputs,
    config: &SynthesisConfig,
    now: DateTime<Utc>,
) -> TriggerDecision {
    if inputs.weight >= config.high_weight_threshold {
        return TriggerDecision::HighWeight;
    }

    if let Some(last) = inputs.last_synthesis_at {
        let hours_since = (now - last).num_milliseconds() as f64 / 3_600_000.0;
        if hours_since < config.recent_synthesis_hours
            && inputs.weight < config.recent_override_weight
        {
            return TriggerDecision::TooRecent;
        }
    }

    let ratio = inputs.content_length as f64 / inputs.total_content_length.max(1) as f64;
    if ratio >= config.significant_content_ratio {
        return TriggerDecision::SignificantContent { ratio };
    }

    if inputs.pending_queue_size >= config.batch_size_threshold {
        return TriggerDecision::BatchThreshold {
            pending: inputs.pending_queue_size,
        };
    }

    TriggerDecision::Queue
}
