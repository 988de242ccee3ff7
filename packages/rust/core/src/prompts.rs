//! Prompt construction and response parsing for the model-backed stages.

use std::fmt::Write as _;

use serde::Deserialize;
use serde_json::Value;

use trendradar_llm::{Prompt, strip_code_fences, truncate_to_char_boundary};
use trendradar_shared::{
    Analysis, FALLBACK_CATEGORY, PersonaConfig, RawItem, Result, Sentiment, Statement,
    TopicInsight, TrendRadarError, topic_id,
};

const ANALYST_SYSTEM: &str = "You are a senior public-opinion analyst. You merge headlines \
that describe the same event, judge sentiment, and estimate how hot each event is.";

/// Longest model response echoed back in a parse error.
const ERROR_EXCERPT_BYTES: usize = 200;

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

/// Prompt for one analysis batch.
///
/// Items are numbered from 1 so the model can point back at the headlines
/// each topic was merged from.
pub fn analysis_prompt(batch: &[RawItem], categories: &[String]) -> Prompt {
    let mut user = String::from("Analyse the following trending headlines:\n\n");
    for (i, item) in batch.iter().enumerate() {
        let _ = write!(user, "{}. [{}] {}", i + 1, item.platform_label(), item.title);
        if item.rank > 0 {
            let _ = write!(user, " (rank {})", item.rank);
        }
        user.push('\n');
    }

    let category_list = categories
        .iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ");

    let _ = write!(
        user,
        r#"
Tasks:
1. Merge headlines that describe the same real-world event into one topic. Name each topic after the concrete event, not an abstract theme.
2. For every topic give a sentiment (positive, negative or neutral), a short comment, and a heat score from 0 to 100. More related headlines, higher ranks and bigger platforms mean more heat.
3. Assign each topic exactly one category from: [{category_list}].
4. List the numbers of the headlines each topic was merged from.
5. Summarise the overall trend in one or two sentences.

Return only JSON in this shape, without Markdown fences:
{{
  "top_topics": [
    {{"topic": "...", "sentiment": "negative", "comment": "...", "heat_score": 92.5, "category": "...", "items": [1, 4]}}
  ],
  "summary": "..."
}}
"#
    );

    Prompt::new(ANALYST_SYSTEM, user)
}

#[derive(Debug, Deserialize)]
struct AnalysisResponse {
    #[serde(default)]
    top_topics: Vec<TopicEntry>,
    #[serde(default)]
    summary: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TopicEntry {
    topic: String,
    #[serde(default)]
    sentiment: String,
    #[serde(default)]
    comment: String,
    #[serde(default)]
    heat_score: Option<Value>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    items: Vec<Value>,
}

/// Topics and summary extracted from one batch response.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchAnalysis {
    pub topics: Vec<TopicInsight>,
    pub summary: Option<String>,
}

/// Parse one analysis response into topic insights.
///
/// Tolerates a surrounding code fence, numeric or string heat scores and
/// unknown categories (mapped to the fallback category). A response with
/// no usable topic is a parse error so the batch can be retried.
pub fn parse_analysis_response(
    text: &str,
    batch: &[RawItem],
    categories: &[String],
) -> Result<BatchAnalysis> {
    let body = strip_code_fences(text);
    let response: AnalysisResponse = serde_json::from_str(body).map_err(|e| {
        TrendRadarError::parse(format!(
            "analysis response is not valid JSON: {e} (got: {})",
            truncate_to_char_boundary(body, ERROR_EXCERPT_BYTES)
        ))
    })?;

    let topics: Vec<TopicInsight> = response
        .top_topics
        .into_iter()
        .filter(|t| !t.topic.trim().is_empty())
        .map(|t| {
            let name = t.topic.trim().to_string();
            let sources = t
                .items
                .iter()
                .filter_map(item_index)
                .filter_map(|n| n.checked_sub(1).and_then(|i| batch.get(i)))
                .map(RawItem::key)
                .collect();
            TopicInsight {
                id: topic_id(&name),
                name,
                sentiment: Sentiment::from_label(&t.sentiment),
                salience: t.heat_score.as_ref().and_then(heat_score),
                cluster: resolve_category(t.category.as_deref(), categories),
                summary: t.comment.trim().to_string(),
                sources,
                placeholder: false,
            }
        })
        .collect();

    if topics.is_empty() {
        return Err(TrendRadarError::parse("analysis response contained no topics"));
    }

    Ok(BatchAnalysis {
        topics,
        summary: response
            .summary
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
    })
}

fn item_index(value: &Value) -> Option<usize> {
    match value {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Heat score clamped to `0..=100`.
fn heat_score(value: &Value) -> Option<f64> {
    let raw = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').parse().ok(),
        _ => None,
    }?;
    raw.is_finite().then(|| raw.clamp(0.0, 100.0))
}

fn resolve_category(label: Option<&str>, categories: &[String]) -> String {
    label
        .map(str::trim)
        .and_then(|l| categories.iter().find(|c| c.eq_ignore_ascii_case(l)))
        .cloned()
        .unwrap_or_else(|| FALLBACK_CATEGORY.to_string())
}

// ---------------------------------------------------------------------------
// Discussion
// ---------------------------------------------------------------------------

/// Prompt for one persona's turn, seeded with the transcript so far.
pub fn discussion_prompt(
    persona: &PersonaConfig,
    analysis: &Analysis,
    focus: &[&TopicInsight],
    transcript: &[Statement],
) -> Prompt {
    let system = format!(
        "You are {}, the {} on a panel reviewing today's public-opinion trends. {} \
         Answer in two to four sentences of plain prose, without lists or code blocks.",
        persona.name,
        persona.role,
        persona.brief.trim()
    );

    let mut user = String::new();
    if let Some(summary) = &analysis.summary {
        let _ = writeln!(user, "Overall trend: {summary}\n");
    }
    user.push_str("Topics under discussion:\n");
    for topic in focus {
        let _ = write!(
            user,
            "- {} [{}; sentiment {}",
            topic.name, topic.cluster, topic.sentiment
        );
        if let Some(heat) = topic.salience {
            let _ = write!(user, "; heat {heat:.1}");
        }
        user.push(']');
        if !topic.summary.is_empty() {
            let _ = write!(user, ": {}", topic.summary);
        }
        user.push('\n');
    }

    if transcript.is_empty() {
        user.push_str("\nYou speak first.\n");
    } else {
        user.push_str("\nDiscussion so far:\n");
        for statement in transcript {
            let _ = writeln!(
                user,
                "{} ({}): {}",
                statement.persona,
                statement.role,
                statement.text.trim()
            );
        }
        user.push_str("\nBuild on what was said rather than repeating it.\n");
    }
    let _ = write!(user, "Give your view as {}.", persona.name);

    Prompt::new(system, user)
}

/// Focus topics a statement mentions by name; all focus topics when it
/// names none of them.
pub fn topic_refs(text: &str, focus: &[&TopicInsight]) -> Vec<String> {
    let lowered = text.to_lowercase();
    let named: Vec<String> = focus
        .iter()
        .filter(|t| lowered.contains(&t.name.to_lowercase()))
        .map(|t| t.id.clone())
        .collect();
    if named.is_empty() {
        focus.iter().map(|t| t.id.clone()).collect()
    } else {
        named
    }
}

// ---------------------------------------------------------------------------
// Executive summary
// ---------------------------------------------------------------------------

/// Prompt for the optional executive summary at the top of the report.
pub fn executive_summary_prompt(items: &[RawItem], analysis: Option<&Analysis>) -> Prompt {
    let mut user = String::new();
    let _ = writeln!(user, "{} trending headlines were collected.", items.len());

    match analysis {
        Some(analysis) if !analysis.is_empty() => {
            if let Some(summary) = &analysis.summary {
                let _ = writeln!(user, "Analyst summary: {summary}");
            }
            user.push_str("Hottest topics:\n");
            for topic in analysis.ranked().into_iter().take(8) {
                let _ = writeln!(
                    user,
                    "- {} ({}, {}, heat {:.1})",
                    topic.name,
                    topic.cluster,
                    topic.sentiment,
                    topic.salience.unwrap_or(0.0)
                );
            }
        }
        _ => {
            user.push_str("No topic analysis is available. Top headlines:\n");
            for item in items.iter().take(15) {
                let _ = writeln!(user, "- [{}] {}", item.platform_label(), item.title);
            }
        }
    }
    user.push_str(
        "\nWrite a three to five sentence executive summary of today's public-opinion \
         landscape for a busy reader. Plain prose only.",
    );

    Prompt::new(ANALYST_SYSTEM, user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn item(platform: &str, title: &str, rank: u32) -> RawItem {
        RawItem {
            platform: platform.into(),
            title: title.into(),
            rank,
            url: String::new(),
            fetched_at: Utc::now(),
            metadata: None,
        }
    }

    fn categories() -> Vec<String> {
        vec!["economy".into(), "technology".into(), "other".into()]
    }

    #[test]
    fn analysis_prompt_numbers_items_and_lists_categories() {
        let batch = vec![item("weibo", "Rate cut", 1), item("zhihu", "New chip", 3)];
        let prompt = analysis_prompt(&batch, &categories());
        assert!(prompt.user.contains("1. [weibo] Rate cut (rank 1)"));
        assert!(prompt.user.contains("2. [zhihu] New chip (rank 3)"));
        assert!(prompt.user.contains(r#"["economy", "technology", "other"]"#));
        assert!(prompt.system.contains("public-opinion analyst"));
    }

    #[test]
    fn parses_fenced_response() {
        let batch = vec![item("weibo", "Rate cut", 1), item("zhihu", "Rates lowered", 2)];
        let text = r#"```json
{"top_topics": [
  {"topic": "Central bank cuts rates", "sentiment": "正面", "comment": "Markets up.",
   "heat_score": "88.5", "category": "Economy", "items": [1, 2, 9]}
], "summary": "Money is cheaper."}
```"#;
        let parsed = parse_analysis_response(text, &batch, &categories()).unwrap();
        assert_eq!(parsed.topics.len(), 1);
        let topic = &parsed.topics[0];
        assert_eq!(topic.id, topic_id("Central bank cuts rates"));
        assert_eq!(topic.sentiment, Sentiment::Positive);
        assert_eq!(topic.salience, Some(88.5));
        assert_eq!(topic.cluster, "economy");
        assert_eq!(topic.sources, vec![batch[0].key(), batch[1].key()]);
        assert_eq!(parsed.summary.as_deref(), Some("Money is cheaper."));
    }

    #[test]
    fn clamps_heat_and_falls_back_on_category() {
        let text = r#"{"top_topics": [{"topic": "Storm", "sentiment": "negative", "heat_score": 140, "category": "weather"}]}"#;
        let parsed = parse_analysis_response(text, &[], &categories()).unwrap();
        assert_eq!(parsed.topics[0].salience, Some(100.0));
        assert_eq!(parsed.topics[0].cluster, "other");
        assert!(parsed.summary.is_none());
    }

    #[test]
    fn rejects_invalid_or_empty_responses() {
        let err = parse_analysis_response("not json", &[], &categories()).unwrap_err();
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("not valid JSON"));

        let err =
            parse_analysis_response(r#"{"top_topics": [], "summary": "x"}"#, &[], &categories())
                .unwrap_err();
        assert!(err.to_string().contains("no topics"));
    }

    fn topic(name: &str, heat: f64) -> TopicInsight {
        TopicInsight {
            id: topic_id(name),
            name: name.into(),
            sentiment: Sentiment::Neutral,
            salience: Some(heat),
            cluster: "economy".into(),
            summary: "comment".into(),
            sources: vec![],
            placeholder: false,
        }
    }

    #[test]
    fn discussion_prompt_includes_prior_statements() {
        let persona = PersonaConfig::new("Media", "media commentator", "Explain coverage.");
        let analysis = Analysis {
            summary: Some("Calm day.".into()),
            acceptable: true,
            ..Default::default()
        };
        let budget = topic("Budget", 70.0);
        let prior = vec![Statement {
            persona: "Insight".into(),
            role: "analyst".into(),
            text: "Budget is tight.".into(),
            topic_refs: vec![],
        }];

        let prompt = discussion_prompt(&persona, &analysis, &[&budget], &prior);
        assert!(prompt.system.starts_with("You are Media, the media commentator"));
        assert!(prompt.user.contains("Overall trend: Calm day."));
        assert!(prompt.user.contains("- Budget [economy; sentiment neutral; heat 70.0]: comment"));
        assert!(prompt.user.contains("Insight (analyst): Budget is tight."));

        let first = discussion_prompt(&persona, &analysis, &[&budget], &[]);
        assert!(first.user.contains("You speak first."));
    }

    #[test]
    fn topic_refs_prefer_named_topics() {
        let a = topic("Budget", 70.0);
        let b = topic("Chip export", 60.0);
        assert_eq!(topic_refs("The budget matters most", &[&a, &b]), vec![a.id.clone()]);
        assert_eq!(topic_refs("Hard to say", &[&a, &b]), vec![a.id.clone(), b.id.clone()]);
    }
}
