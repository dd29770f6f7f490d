use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

text_enum! {
    /// Kind of material a content source was built from.
    SourceType {
        Reflection => "reflection",
        Text => "text",
        Conversation => "conversation",
        Document => "document",
        Structured => "structured",
    }
}

pub const MIN_WEIGHT: f64 = 0.0;
pub const MAX_WEIGHT: f64 = 5.0;
pub const DEFAULT_WEIGHT: f64 = 1.0;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("Weight must be between 0 and 5, got {0}")]
pub struct WeightError(pub f64);

/// Accept a weight only inside the closed range `[0, 5]`.
pub fn validate_weight(weight: f64) -> Result<f64, WeightError> {
    if weight.is_finite() && (MIN_WEIGHT..=MAX_WEIGHT).contains(&weight) {
        Ok(weight)
    } else {
        Err(WeightError(weight))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ContentSource {
    pub id: Uuid,
    pub realm_id: Option<Uuid>,
    pub source_type: SourceType,
    pub title: Option<String>,
    pub content: String,
    pub weight: f64,
    pub metadata: serde_json::Value,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContentSource {
    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or("Untitled")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weight_bounds_are_inclusive() {
        assert_eq!(validate_weight(0.0), Ok(0.0));
        assert_eq!(validate_weight(5.0), Ok(5.0));
        assert_eq!(validate_weight(2.5), Ok(2.5));
    }

    #[test]
    fn test_weight_outside_range_is_rejected() {
        assert!(validate_weight(-0.1).is_err());
        assert!(validate_weight(5.01).is_err());
        assert!(validate_weight(f64::NAN).is_err());
        assert!(validate_weight(f64::INFINITY).is_err());
    }
}
