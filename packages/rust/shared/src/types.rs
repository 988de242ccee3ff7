//! Core domain types flowing through a TrendRadar run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for pipeline run identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Raw items
// ---------------------------------------------------------------------------

/// Optional per-item data some platforms provide.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemMetadata {
    /// Human-readable platform name (e.g., "Weibo Hot Search").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_name: Option<String>,
    /// Mobile-friendly link, preferred in reports when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mobile_url: Option<String>,
    /// Platform-reported heat value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hot_value: Option<f64>,
}

/// A single trending entry collected from one platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    /// Platform identifier (e.g., `weibo`).
    pub platform: String,
    /// Entry title as shown on the platform.
    pub title: String,
    /// 1-based position in the platform's list.
    pub rank: u32,
    /// Link to the entry (may be empty).
    #[serde(default)]
    pub url: String,
    /// When the entry was fetched.
    pub fetched_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ItemMetadata>,
}

impl RawItem {
    /// Deduplication key: `(platform, title)`.
    pub fn key(&self) -> ItemKey {
        ItemKey {
            platform: self.platform.clone(),
            title: self.title.clone(),
        }
    }

    /// Display name of the platform, falling back to its identifier.
    pub fn platform_label(&self) -> &str {
        self.metadata
            .as_ref()
            .and_then(|m| m.platform_name.as_deref())
            .unwrap_or(&self.platform)
    }

    /// Best link for a reader: the mobile URL when known, else `url`.
    pub fn link(&self) -> &str {
        self.metadata
            .as_ref()
            .and_then(|m| m.mobile_url.as_deref())
            .filter(|u| !u.is_empty())
            .unwrap_or(&self.url)
    }

    pub fn hot_value(&self) -> Option<f64> {
        self.metadata.as_ref().and_then(|m| m.hot_value)
    }
}

/// Identifies a raw item independently of its rank or fetch time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    pub platform: String,
    pub title: String,
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

/// Sentiment label attached to a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
    Unknown,
}

impl Sentiment {
    /// Parse a model-provided label. Accepts English and Chinese labels.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "positive" | "pos" | "正面" | "积极" => Self::Positive,
            "negative" | "neg" | "负面" | "消极" => Self::Negative,
            "neutral" | "mixed" | "中性" => Self::Neutral,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Negative => "negative",
            Self::Neutral => "neutral",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Sentiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derived insight for one merged topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicInsight {
    /// Stable identifier derived from the topic name (see [`topic_id`]).
    pub id: String,
    /// Topic name.
    pub name: String,
    pub sentiment: Sentiment,
    /// Heat score in `0..=100`; `None` when unknown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salience: Option<f64>,
    /// Cluster / category group.
    pub cluster: String,
    /// Free-text commentary.
    #[serde(default)]
    pub summary: String,
    /// Raw items this topic was merged from.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<ItemKey>,
    /// Set only for items whose batch could not be analysed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub placeholder: bool,
}

impl TopicInsight {
    /// Placeholder for an item whose batch could not be analysed.
    pub fn unknown(item: &RawItem, cluster: &str) -> Self {
        Self {
            id: topic_id(&format!("{}:{}", item.platform, item.title)),
            name: item.title.clone(),
            sentiment: Sentiment::Unknown,
            salience: None,
            cluster: cluster.to_string(),
            summary: String::new(),
            sources: vec![item.key()],
            placeholder: true,
        }
    }

    /// Whether this entry is a degraded placeholder rather than real analysis.
    pub fn is_placeholder(&self) -> bool {
        self.placeholder
    }
}

/// Structured analysis output keyed by topic identifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub topics: BTreeMap<String, TopicInsight>,
    /// Overall trend summary across batches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Number of batches requested.
    pub batches_total: usize,
    /// 1-based numbers of batches that degraded to placeholders.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub batches_failed: Vec<usize>,
    /// Whether enough batches succeeded for downstream stages to rely on it.
    pub acceptable: bool,
}

impl Analysis {
    /// Topics backed by a successful model response.
    pub fn analyzed(&self) -> impl Iterator<Item = &TopicInsight> {
        self.topics.values().filter(|t| !t.is_placeholder())
    }

    /// Empty means: nothing downstream can build on.
    pub fn is_empty(&self) -> bool {
        !self.acceptable || self.analyzed().next().is_none()
    }

    /// Analysed topics ordered by salience (highest first), then name.
    pub fn ranked(&self) -> Vec<&TopicInsight> {
        let mut topics: Vec<&TopicInsight> = self.analyzed().collect();
        topics.sort_by(|a, b| {
            b.salience
                .unwrap_or(0.0)
                .total_cmp(&a.salience.unwrap_or(0.0))
                .then_with(|| a.name.cmp(&b.name))
        });
        topics
    }
}

/// Derive a stable topic identifier from a name (12 hex chars of SHA-256).
pub fn topic_id(name: &str) -> String {
    let normalized = name.trim().to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..12].to_string()
}

// ---------------------------------------------------------------------------
// Discussion
// ---------------------------------------------------------------------------

/// One persona's contribution to the discussion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub persona: String,
    pub role: String,
    pub text: String,
    /// Topic identifiers the statement refers to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topic_refs: Vec<String>,
}

/// Ordered discussion transcript.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Discussion {
    pub statements: Vec<Statement>,
    /// Set when too few personas produced a statement.
    #[serde(default)]
    pub degraded: bool,
}

impl Discussion {
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Which part of the report a section represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    ExecutiveSummary,
    Overview,
    Topics,
    Discussion,
    Sources,
}

/// Topics sharing one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicGroup {
    pub cluster: String,
    pub topics: Vec<TopicInsight>,
}

/// Renderer-independent content of a section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SectionBody {
    Text(String),
    Topics(Vec<TopicGroup>),
    Transcript(Vec<Statement>),
    Sources(Vec<RawItem>),
    /// Explicit "data unavailable" marker for degraded runs.
    Unavailable { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSection {
    pub kind: SectionKind,
    pub title: String,
    pub body: SectionBody,
}

impl ReportSection {
    pub fn is_unavailable(&self) -> bool {
        matches!(self.body, SectionBody::Unavailable { .. })
    }
}

/// Everything a renderer needs to produce the final document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportDocument {
    pub title: String,
    pub generated_at: DateTime<Utc>,
    /// Earliest and latest fetch time among the source items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub item_count: usize,
    pub topic_count: usize,
    pub sections: Vec<ReportSection>,
}

/// The rendered report stored in the shared state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub document: ReportDocument,
    /// Rendered markup (HTML or Markdown).
    pub markup: String,
    /// File extension matching `markup` (e.g., `html`).
    pub extension: String,
    /// Whether any section is marked unavailable.
    pub degraded: bool,
}
