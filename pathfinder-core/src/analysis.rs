//! Keyword heuristics run on every new content source. No model calls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata key the analysis is stored under on a content source.
pub const METADATA_KEY: &str = "lightweight_analysis";

const THEME_KEYWORDS: &[(&str, &[&str])] = &[
    ("professional", &["work", "job", "career", "professional"]),
    ("learning", &["learn", "study", "education", "knowledge"]),
    ("goals", &["goal", "aspiration", "dream", "want to"]),
    ("values", &["value", "believe", "principle", "important"]),
];

const TRAIT_KEYWORDS: &[(&str, &[&str])] = &[
    ("detail-oriented", &["detail", "precise", "accurate", "careful"]),
    ("creative", &["creative", "innovative", "artistic", "design"]),
    ("collaborative", &["help", "support", "assist", "collaborate"]),
];

const IMPORTANCE_WORDS: &[&str] = &["important", "key", "essential", "critical"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightweightAnalysis {
    pub themes: Vec<String>,
    pub traits: Vec<String>,
    /// Length of the content in characters.
    pub content_length: usize,
    /// How many of the importance words occur at least once.
    pub importance_indicators: usize,
    pub analyzed_at: DateTime<Utc>,
}

fn matching_labels(lowered: &str, table: &[(&str, &[&str])]) -> Vec<String> {
    table
        .iter()
        .filter(|(_, words)| words.iter().any(|w| lowered.contains(w)))
        .map(|(label, _)| label.to_string())
        .collect()
}

/// Substring matching on the lowercased text, so "teamwork" counts as "work".
pub fn analyze(content: &str) -> LightweightAnalysis {
    let lowered = content.to_lowercase();

    LightweightAnalysis {
        themes: matching_labels(&lowered, THEME_KEYWORDS),
        traits: matching_labels(&lowered, TRAIT_KEYWORDS),
        content_length: content.chars().count(),
        importance_indicators: IMPORTANCE_WORDS
            .iter()
            .filter(|w| lowered.contains(*w))
            .count(),
        analyzed_at: Utc::now(),
    }
}

/// Return `metadata` with the analysis stored under [`METADATA_KEY`].
///
/// Non-object metadata is replaced by a fresh object.
pub fn merge_into_metadata(
    metadata: &serde_json::Value,
    analysis: &LightweightAnalysis,
) -> serde_json::Value {
    let mut map = match metadata {
        serde_json::Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    map.insert(
        METADATA_KEY.to_string(),
        serde_json::to_value(analysis).unwrap_or(serde_json::Value::Null),
    );
    serde_json::Value::Object(map)
}

/// Read a previously stored analysis back out of source metadata.
pub fn from_metadata(metadata: &serde_json::Value) -> Option<LightweightAnalysis> {
    metadata
        .get(METADATA_KEY)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_themes_and_traits() {
        let analysis = analyze(
            "I want to grow my career. I believe careful design work and helping my team matter.",
        );
        assert_eq!(
            analysis.themes,
            vec!["professional", "goals", "values"]
        );
        assert_eq!(
            analysis.traits,
            vec!["detail-oriented", "creative", "collaborative"]
        );
    }

    #[test]
    fn test_matching_is_case_insensitive() {
        let analysis = analyze("STUDY hard");
        assert_eq!(analysis.themes, vec!["learning"]);
    }

    #[test]
    fn test_counts_distinct_importance_words() {
        let analysis = analyze("Key point. Another key point. This is critical.");
        assert_eq!(analysis.importance_indicators, 2);
    }

    #[test]
    fn test_plain_text_yields_empty_labels() {
        let analysis = analyze("The sky was grey on Tuesday.");
        assert!(analysis.themes.is_empty());
        assert!(analysis.traits.is_empty());
        assert_eq!(analysis.importance_indicators, 0);
        assert_eq!(analysis.content_length, 28);
    }

    #[test]
    fn test_merge_preserves_existing_metadata() {
        let metadata = serde_json::json!({ "original_text_id": "abc" });
        let merged = merge_into_metadata(&metadata, &analyze("learn"));
        assert_eq!(merged["original_text_id"], "abc");
        assert_eq!(merged[METADATA_KEY]["themes"][0], "learning");

        let restored = from_metadata(&merged).unwrap();
        assert_eq!(restored.themes, vec!["learning"]);
    }

    #[test]
    fn test_merge_replaces_non_object_metadata() {
        let merged = merge_into_metadata(&serde_json::Value::Null, &analyze("x"));
        assert!(merged.is_object());
        assert!(from_metadata(&serde_json::json!({})).is_none());
    }
}
