//! Prompt templates for synthesis, analysis and question generation, plus the
//! typed replies the JSON-returning stages are parsed into.
//!
//! Every stage that asks for JSON has a `fallback()` value used when the
//! model's reply cannot be parsed.

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::models::ContentSource;

/// Weight at or above which a source is labelled high priority.
pub const HIGH_PRIORITY_WEIGHT: f64 = 3.0;
/// Weight at or above which a source is labelled medium priority.
pub const MEDIUM_PRIORITY_WEIGHT: f64 = 2.0;

pub const MAX_QUESTION_COUNT: u32 = 20;

pub fn priority_label(weight: f64) -> &'static str {
    if weight >= HIGH_PRIORITY_WEIGHT {
        "HIGH PRIORITY"
    } else if weight >= MEDIUM_PRIORITY_WEIGHT {
        "MEDIUM PRIORITY"
    } else {
        "NORMAL"
    }
}

fn existing_or<'a>(existing_prompt: Option<&'a str>, none: &'a str) -> &'a str {
    existing_prompt
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or(none)
}

/// Sources ordered by descending weight, each headed by its priority label.
pub fn format_weighted_sources(sources: &[ContentSource]) -> String {
    let mut sorted: Vec<&ContentSource> = sources.iter().collect();
    sorted.sort_by(|a, b| b.weight.total_cmp(&a.weight));

    sorted
        .iter()
        .map(|source| {
            format!(
                "[{}] {} (Weight: {:.1})\nTitle: {}\n{}",
                priority_label(source.weight),
                source.source_type.as_str().to_uppercase(),
                source.weight,
                source.display_title(),
                source.content.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n---\n")
}

fn format_sources_with_metadata(sources: &[ContentSource]) -> String {
    sources
        .iter()
        .map(|source| {
            let metadata = match &source.metadata {
                serde_json::Value::Object(map) if !map.is_empty() => {
                    serde_json::to_string_pretty(&source.metadata).unwrap_or_default()
                }
                _ => "None".to_string(),
            };
            format!(
                "SOURCE: {} (Weight: {:.1})\nTitle: {}\nContent: {}\nMetadata: {}\n---",
                source.source_type.as_str().to_uppercase(),
                source.weight,
                source.display_title(),
                source.content.trim(),
                metadata
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        return "- (none)".to_string();
    }
    items
        .iter()
        .map(|item| format!("- {}", item))
        .collect::<Vec<_>>()
        .join("\n")
}

// ============================================================================
// Simple synthesis
// ============================================================================

/// One answered reflection as fed into simple synthesis.
#[derive(Debug, Clone, PartialEq)]
pub struct QaPair {
    pub question: String,
    pub answer: String,
}

pub fn simple_synthesis_prompt(
    realm_name: &str,
    existing_prompt: Option<&str>,
    qa_pairs: &[QaPair],
    sources: &[ContentSource],
) -> String {
    let qa_section = if qa_pairs.is_empty() {
        "(no answered reflections)".to_string()
    } else {
        qa_pairs
            .iter()
            .map(|qa| format!("Q: {}\nA: {}", qa.question.trim(), qa.answer.trim()))
            .collect::<Vec<_>>()
            .join("\n\n")
    };

    let sources_section = if sources.is_empty() {
        "(no content sources)".to_string()
    } else {
        format_weighted_sources(sources)
    };

    format!(
        r#"You are writing the system prompt for a personal AI assistant working in the "{realm_name}" realm.

Existing system prompt:
{existing}

Reflections (question and the user's answer):
{qa_section}

Content sources, highest weight first. Give HIGH PRIORITY material the most influence:
{sources_section}

Write a new system prompt that:
1. Describes the user's context, values, goals and preferences in concrete terms
2. Keeps anything from the existing prompt that is still accurate
3. Tells the assistant how to adapt its tone and focus to this user
4. Stays under 400 words, written in the second person to the assistant

Return ONLY the system prompt text, with no preamble, JSON or markup."#,
        realm_name = realm_name,
        existing = existing_or(existing_prompt, "No existing prompt"),
        qa_section = qa_section,
        sources_section = sources_section,
    )
}

// ============================================================================
// Stage 1: content analysis
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentAnalysis {
    #[serde(default)]
    pub themes: Vec<String>,
    #[serde(default)]
    pub persona_traits: Vec<String>,
    #[serde(default)]
    pub content_gaps: Vec<String>,
    pub quality_score: f64,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl ContentAnalysis {
    pub fn fallback() -> Self {
        Self {
            themes: vec!["General information".to_string()],
            persona_traits: vec!["User information available".to_string()],
            content_gaps: vec!["Analysis failed - manual review needed".to_string()],
            quality_score: 0.5,
            suggestions: vec!["Re-run analysis with valid content".to_string()],
        }
    }
}

pub fn content_analysis_prompt(
    realm_name: &str,
    existing_prompt: Option<&str>,
    sources: &[ContentSource],
) -> String {
    format!(
        r#"You are an expert content analyst specializing in personal profiling and AI system design.

Analyze the following content sources for the "{realm_name}" realm to extract:
1. Major themes and topics
2. Personal traits, characteristics and behavioral patterns
3. Values, beliefs and worldview elements
4. Content gaps and missing information areas
5. Quality assessment of the content collection

Existing context: {existing}

Content Sources:
{sources}

Return analysis as JSON with this exact structure:
{{
    "themes": ["theme1", "theme2"],
    "persona_traits": ["trait1", "trait2"],
    "content_gaps": ["gap1", "gap2"],
    "quality_score": 0.85,
    "suggestions": ["suggestion1", "suggestion2"]
}}

Focus on actionable insights that would help an AI assistant provide more personalized responses."#,
        realm_name = realm_name,
        existing = existing_or(existing_prompt, "No existing prompt"),
        sources = format_sources_with_metadata(sources),
    )
}

// ============================================================================
// Stage 2: persona extraction
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaProfile {
    pub core_identity: String,
    #[serde(default)]
    pub values_beliefs: Vec<String>,
    #[serde(default)]
    pub communication_style: String,
    #[serde(default)]
    pub goals_aspirations: Vec<String>,
    #[serde(default)]
    pub context_background: String,
    #[serde(default)]
    pub preferences_patterns: Vec<String>,
}

impl PersonaProfile {
    pub fn fallback() -> Self {
        Self {
            core_identity: "User profile extraction failed".to_string(),
            values_beliefs: vec!["Manual review needed".to_string()],
            communication_style: "Standard interaction style".to_string(),
            goals_aspirations: vec!["Profile completion needed".to_string()],
            context_background: "Limited information available".to_string(),
            preferences_patterns: vec!["Analysis incomplete".to_string()],
        }
    }
}

pub fn persona_prompt(
    realm_name: &str,
    analysis: &ContentAnalysis,
    sources: &[ContentSource],
) -> String {
    format!(
        r#"Based on the content analysis, create a detailed persona profile for the "{realm_name}" realm.

Analysis Results:
- Themes: {themes}
- Traits: {traits}
- Quality Score: {quality:.2}

Weighted Content Sources:
{sources}

Extract a persona profile with these categories:
1. Core Identity (who they are fundamentally)
2. Values & Beliefs (what drives them)
3. Communication Style (how they prefer to interact)
4. Goals & Aspirations (what they're working toward)
5. Context & Background (relevant life details)
6. Preferences & Patterns (behavioral tendencies)

Return as structured JSON:
{{
    "core_identity": "description",
    "values_beliefs": ["value1", "value2"],
    "communication_style": "description",
    "goals_aspirations": ["goal1", "goal2"],
    "context_background": "description",
    "preferences_patterns": ["pattern1", "pattern2"]
}}

Be specific and actionable. Focus on details that would help an AI provide better responses."#,
        realm_name = realm_name,
        themes = analysis.themes.join(", "),
        traits = analysis.persona_traits.join(", "),
        quality = analysis.quality_score,
        sources = format_weighted_sources(sources),
    )
}

// ============================================================================
// Stage 3: prompt engineering
// ============================================================================

pub fn engineering_prompt(
    realm_name: &str,
    persona: &PersonaProfile,
    analysis: &ContentAnalysis,
    existing_prompt: Option<&str>,
) -> String {
    format!(
        r#"You are an expert prompt engineer specializing in personalized AI system prompts.

Create a system prompt for the "{realm_name}" realm using this persona profile:

Core Identity: {core_identity}
Values & Beliefs: {values}
Communication Style: {style}
Goals & Aspirations: {goals}
Context & Background: {background}
Preferences & Patterns: {patterns}

Quality Score: {quality:.2}
Content Gaps: {gaps}

Existing Prompt: {existing}

Engineering Guidelines:
1. Write in a natural, conversational tone
2. Include specific details that enable personalized responses
3. Focus on actionable context, not generic statements
4. Keep it concise but comprehensive (200-400 words)
5. Avoid overly complimentary language
6. Structure it for easy AI comprehension

Return ONLY the engineered system prompt text, no JSON or markup."#,
        realm_name = realm_name,
        core_identity = persona.core_identity,
        values = persona.values_beliefs.join("; "),
        style = persona.communication_style,
        goals = persona.goals_aspirations.join("; "),
        background = persona.context_background,
        patterns = persona.preferences_patterns.join("; "),
        quality = analysis.quality_score,
        gaps = analysis.content_gaps.join("; "),
        existing = existing_or(existing_prompt, "None"),
    )
}

// ============================================================================
// Stage 4: quality assessment
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
    pub coherence_score: f64,
    pub completeness_score: f64,
    pub effectiveness_score: f64,
    pub overall_quality: f64,
    #[serde(default)]
    pub improvement_suggestions: Vec<String>,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub weaknesses: Vec<String>,
}

impl QualityAssessment {
    pub fn fallback() -> Self {
        Self {
            coherence_score: 0.5,
            completeness_score: 0.5,
            effectiveness_score: 0.5,
            overall_quality: 0.5,
            improvement_suggestions: vec![
                "Quality assessment failed - manual review needed".to_string()
            ],
            strengths: vec!["Basic prompt structure".to_string()],
            weaknesses: vec!["Assessment incomplete".to_string()],
        }
    }
}

/// `persona` is `None` when assessing a stored version with no profile at hand.
pub fn quality_prompt(
    realm_name: &str,
    system_prompt: &str,
    persona: Option<&PersonaProfile>,
    source_count: usize,
) -> String {
    let persona_section = persona
        .and_then(|p| serde_json::to_string_pretty(p).ok())
        .unwrap_or_else(|| "Not available".to_string());

    format!(
        r#"Evaluate the quality of this system prompt for the "{realm_name}" realm:

SYSTEM PROMPT:
---
{system_prompt}
---

ORIGINAL PERSONA PROFILE:
{persona_section}

CONTENT SOURCES COUNT: {source_count}

Assess the prompt on these dimensions (0.0 to 1.0):
1. COHERENCE: Does the prompt flow well and make logical sense?
2. COMPLETENESS: Does it capture the key aspects of the persona?
3. EFFECTIVENESS: Would this help an AI provide better responses?

Also identify the key strengths, the weaknesses, and specific suggestions for improvement.

Return assessment as JSON:
{{
    "coherence_score": 0.85,
    "completeness_score": 0.78,
    "effectiveness_score": 0.82,
    "overall_quality": 0.82,
    "improvement_suggestions": ["suggestion1", "suggestion2"],
    "strengths": ["strength1", "strength2"],
    "weaknesses": ["weakness1", "weakness2"]
}}"#,
        realm_name = realm_name,
        system_prompt = system_prompt.trim(),
        persona_section = persona_section,
        source_count = source_count,
    )
}

// ============================================================================
// Incremental integration
// ============================================================================

pub fn integration_prompt(existing_prompt: Option<&str>, new_sources: &[ContentSource]) -> String {
    format!(
        r#"You are updating an existing AI assistant system prompt by integrating new content.

EXISTING PROMPT:
{existing}

NEW CONTENT TO INTEGRATE:
{sources}

Instructions:
1. Identify key information from the new content, weighting HIGH PRIORITY items most
2. Integrate it into the existing prompt without changing its tone or structure
3. Do not repeat information the prompt already contains
4. Keep the update concise

Return only the updated system prompt."#,
        existing = existing_or(existing_prompt, "(empty: write a new prompt from the content)"),
        sources = format_weighted_sources(new_sources),
    )
}

// ============================================================================
// Question generation
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedQuestion {
    pub question: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub importance_score: Option<f64>,
}

pub fn question_generation_prompt(
    realm_name: &str,
    realm_description: Option<&str>,
    existing_prompt: Option<&str>,
    asked_questions: &[String],
    count: u32,
) -> String {
    format!(
        r#"You help a person reflect on themselves so an AI assistant can understand them better.

Realm: "{realm_name}"
Description: {description}
Current system prompt: {existing}

Questions already asked (do not repeat or rephrase these):
{asked}

Write {count} new open-ended reflection questions for this realm. Each should uncover
values, goals, context or preferences that the current prompt does not yet cover.

Return ONLY a JSON array:
[
    {{"question": "...", "category": "values", "importance_score": 1.0}}
]
category is a short lowercase label; importance_score is between 0.5 and 2.0."#,
        realm_name = realm_name,
        description = existing_or(realm_description, "None"),
        existing = existing_or(existing_prompt, "None"),
        asked = bullet_list(asked_questions),
        count = count,
    )
}

// ============================================================================
// Reply parsing
// ============================================================================

/// Remove a surrounding Markdown code fence (```` ```json ... ``` ````) if present.
pub fn strip_code_fences(reply: &str) -> String {
    let trimmed = reply.trim();
    if let Ok(re) = Regex::new(r"(?s)^```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)\r?\n?```$") {
        if let Some(caps) = re.captures(trimmed) {
            if let Some(body) = caps.get(1) {
                return body.as_str().trim().to_string();
            }
        }
    }
    trimmed.to_string()
}

/// Strip fences and deserialize a JSON reply.
pub fn parse_json_reply<T: DeserializeOwned>(reply: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(&strip_code_fences(reply))
}

/// Parse a stage reply, logging and substituting `fallback` when it is not valid JSON.
pub fn parse_or_fallback<T, F>(stage: &str, reply: &str, fallback: F) -> T
where
    T: DeserializeOwned,
    F: FnOnce() -> T,
{
    match parse_json_reply(reply) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(stage, error = %e, "Unparsable stage reply, using fallback");
            fallback()
        }
    }
}

/// Parse the question-generation reply. Blank questions are dropped and at
/// most `limit` are kept.
pub fn parse_questions(reply: &str, limit: u32) -> Result<Vec<GeneratedQuestion>, serde_json::Error> {
    let questions: Vec<GeneratedQuestion> = parse_json_reply(reply)?;
    Ok(questions
        .into_iter()
        .filter(|q| !q.question.trim().is_empty())
        .take(limit as usize)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceType;
    use chrono::Utc;
    use uuid::Uuid;

    fn source(title: &str, content: &str, weight: f64) -> ContentSource {
        ContentSource {
            id: Uuid::new_v4(),
            realm_id: None,
            source_type: SourceType::Text,
            title: Some(title.to_string()),
            content: content.to_string(),
            weight,
            metadata: serde_json::json!({}),
            last_used_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_priority_labels() {
        assert_eq!(priority_label(5.0), "HIGH PRIORITY");
        assert_eq!(priority_label(3.0), "HIGH PRIORITY");
        assert_eq!(priority_label(2.0), "MEDIUM PRIORITY");
        assert_eq!(priority_label(1.99), "NORMAL");
        assert_eq!(priority_label(0.0), "NORMAL");
    }

    #[test]
    fn test_weighted_sources_are_sorted_and_labelled() {
        let formatted = format_weighted_sources(&[
            source("low", "minor note", 1.0),
            source("high", "core belief", 4.0),
        ]);
        let high = formatted.find("core belief").unwrap();
        let low = formatted.find("minor note").unwrap();
        assert!(high < low, "higher weight must come first");
        assert!(formatted.contains("[HIGH PRIORITY] TEXT (Weight: 4.0)"));
        assert!(formatted.contains("[NORMAL] TEXT (Weight: 1.0)"));
    }

    #[test]
    fn test_simple_prompt_includes_existing_prompt_and_answers() {
        let prompt = simple_synthesis_prompt(
            "Career",
            Some("You coach an engineer."),
            &[QaPair {
                question: "What motivates you?".into(),
                answer: "Shipping useful tools.".into(),
            }],
            &[source("Resume", "Ten years of backend work", 3.5)],
        );
        assert!(prompt.contains("\"Career\""));
        assert!(prompt.contains("You coach an engineer."));
        assert!(prompt.contains("Q: What motivates you?\nA: Shipping useful tools."));
        assert!(prompt.contains("HIGH PRIORITY"));
        assert!(prompt.contains("Weight: 3.5"));
    }

    #[test]
    fn test_blank_existing_prompt_is_reported_as_missing() {
        let prompt = content_analysis_prompt("R", Some("   "), &[source("t", "c", 1.0)]);
        assert!(prompt.contains("Existing context: No existing prompt"));
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_code_fences("```\nplain\n```"), "plain");
        assert_eq!(strip_code_fences("  {\"a\": 1}  "), "{\"a\": 1}");
        assert_eq!(strip_code_fences("```json{\"a\":1}```"), "{\"a\":1}");
    }

    #[test]
    fn test_parse_fenced_analysis() {
        let reply = "```json\n{\"themes\": [\"work\"], \"persona_traits\": [], \"content_gaps\": [], \"quality_score\": 0.9, \"suggestions\": []}\n```";
        let analysis: ContentAnalysis = parse_json_reply(reply).unwrap();
        assert_eq!(analysis.themes, vec!["work".to_string()]);
        assert_eq!(analysis.quality_score, 0.9);
    }

    #[test]
    fn test_unparsable_reply_uses_stage_fallback() {
        let analysis = parse_or_fallback("analysis", "not json at all", ContentAnalysis::fallback);
        assert_eq!(analysis.quality_score, 0.5);
        assert_eq!(analysis.themes, vec!["General information".to_string()]);

        let quality = parse_or_fallback("quality", "{\"oops\": true}", QualityAssessment::fallback);
        assert_eq!(quality.overall_quality, 0.5);

        let persona = parse_or_fallback("persona", "", PersonaProfile::fallback);
        assert_eq!(persona.core_identity, "User profile extraction failed");
    }

    #[test]
    fn test_parse_questions_limits_and_drops_blank() {
        let reply = r#"[
            {"question": "What matters most?", "category": "values", "importance_score": 1.5},
            {"question": "  "},
            {"question": "Where do you want to be in five years?"},
            {"question": "Extra"}
        ]"#;
        let questions = parse_questions(reply, 2).unwrap();
        assert_eq!(questions.len(), 2);
        assert_eq!(questions[0].category.as_deref(), Some("values"));
        assert_eq!(questions[1].category, None);
    }

    #[test]
    fn test_parse_questions_rejects_non_array() {
        assert!(parse_questions("{\"question\": \"x\"}", 5).is_err());
        assert!(parse_questions("Here are some questions!", 5).is_err());
    }

    #[test]
    fn test_quality_prompt_without_persona() {
        let prompt = quality_prompt("R", "Be helpful.", None, 3);
        assert!(prompt.contains("Not available"));
        assert!(prompt.contains("CONTENT SOURCES COUNT: 3"));
    }

    #[test]
    fn test_question_prompt_lists_asked_questions() {
        let prompt = question_generation_prompt(
            "Health",
            None,
            None,
            &["How do you sleep?".to_string()],
            4,
        );
        assert!(prompt.contains("- How do you sleep?"));
        assert!(prompt.contains("Write 4 new"));
    }
}
