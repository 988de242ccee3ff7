//! Application configuration for TrendRadar.
//!
//! User config lives at `~/.trendradar/trendradar.toml`.
//! CLI flags override config file values, which override defaults.
//! The file is read once per run; [`RunConfig`] is the validated, immutable
//! view every stage receives.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrendRadarError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "trendradar.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".trendradar";

/// Environment variables consulted for the model API key, after `llm.api_key_env`.
pub const API_KEY_FALLBACK_ENVS: &[&str] = &[
    "TRENDRADAR_API_KEY",
    "INSIGHT_ENGINE_API_KEY",
    "KIMI_API_KEY",
    "OPENAI_API_KEY",
];

/// Environment overrides for `llm.base_url`, first set wins.
pub const BASE_URL_ENVS: &[&str] = &[
    "TRENDRADAR_BASE_URL",
    "INSIGHT_ENGINE_BASE_URL",
    "KIMI_BASE_URL",
    "OPENAI_BASE_URL",
];

/// Environment overrides for `llm.model`, first set wins.
pub const MODEL_ENVS: &[&str] = &[
    "TRENDRADAR_MODEL",
    "INSIGHT_ENGINE_MODEL_NAME",
    "KIMI_MODEL_NAME",
    "KIMI_MODEL",
];

/// Names an explicit dotenv file to load instead of searching for one.
pub const ENV_FILE_VAR: &str = "ENV_FILE";

/// How many directories above the working directory are searched for `.env`.
const ENV_FILE_PARENT_DEPTH: usize = 3;

/// Cluster used when the model returns a category outside the configured list.
pub const FALLBACK_CATEGORY: &str = "other";

// ---------------------------------------------------------------------------
// Config structs (matching trendradar.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Language-model endpoint settings.
    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub collection: CollectionConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub discussion: DiscussionConfig,

    #[serde(default)]
    pub report: ReportConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Platforms to collect from, in report order.
    #[serde(default = "default_platforms")]
    pub platforms: Vec<PlatformConfig>,

    /// Discussion personas, in speaking order.
    #[serde(default = "default_personas")]
    pub personas: Vec<PersonaConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            defaults: DefaultsConfig::default(),
            llm: LlmConfig::default(),
            collection: CollectionConfig::default(),
            analysis: AnalysisConfig::default(),
            discussion: DiscussionConfig::default(),
            report: ReportConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            platforms: default_platforms(),
            personas: default_personas(),
        }
    }
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Directory receiving reports, snapshots and the run database.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// History window merged into the current collection (0 disables).
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: u32,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            lookback_hours: default_lookback_hours(),
        }
    }
}

fn default_output_dir() -> String {
    "~/trendradar-reports".into()
}
fn default_lookback_hours() -> u32 {
    24
}

/// `[llm]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Reuse completions for identical prompts across runs.
    #[serde(default = "default_true")]
    pub cache: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: None,
            cache: true,
        }
    }
}

fn default_api_key_env() -> String {
    "TRENDRADAR_API_KEY".into()
}
fn default_base_url() -> String {
    "https://api.moonshot.cn/v1".into()
}
fn default_model() -> String {
    "moonshot-v1-8k".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_true() -> bool {
    true
}

/// `[collection]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Hot-list endpoint; `{id}` is replaced by the platform id.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_collection_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_retries")]
    pub retries: u32,

    #[serde(default = "default_collection_backoff")]
    pub backoff_ms: u64,

    #[serde(default = "default_collection_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_items")]
    pub max_items_per_platform: usize,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            concurrency: default_collection_concurrency(),
            retries: default_retries(),
            backoff_ms: default_collection_backoff(),
            timeout_secs: default_collection_timeout(),
            max_items_per_platform: default_max_items(),
        }
    }
}

fn default_endpoint() -> String {
    "https://newsnow.busiyi.world/api/s?id={id}&latest".into()
}
fn default_collection_concurrency() -> usize {
    4
}
fn default_retries() -> u32 {
    2
}
fn default_collection_backoff() -> u64 {
    250
}
fn default_collection_timeout() -> u64 {
    10
}
fn default_max_items() -> usize {
    30
}

/// `[analysis]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Items per model request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_analysis_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_retries")]
    pub retries: u32,

    #[serde(default = "default_llm_backoff")]
    pub backoff_ms: u64,

    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    /// Fraction of batches that must succeed for the analysis to be usable.
    #[serde(default)]
    pub min_success_ratio: f64,

    /// Allowed cluster names, in tie-break order.
    #[serde(default = "default_categories")]
    pub categories: Vec<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            concurrency: default_analysis_concurrency(),
            retries: default_retries(),
            backoff_ms: default_llm_backoff(),
            timeout_secs: default_llm_timeout(),
            min_success_ratio: 0.0,
            categories: default_categories(),
        }
    }
}

fn default_batch_size() -> usize {
    40
}
fn default_analysis_concurrency() -> usize {
    2
}
fn default_llm_backoff() -> u64 {
    500
}
fn default_llm_timeout() -> u64 {
    90
}
fn default_categories() -> Vec<String> {
    [
        "economy",
        "breaking-news",
        "law",
        "entertainment",
        "science-education",
        "international",
        "health",
        "governance",
        "livelihood",
        "environment",
        FALLBACK_CATEGORY,
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// `[discussion]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscussionConfig {
    #[serde(default = "default_retries")]
    pub retries: u32,

    #[serde(default = "default_llm_backoff")]
    pub backoff_ms: u64,

    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    /// Below this fraction of successful personas the transcript is flagged degraded.
    #[serde(default)]
    pub min_success_ratio: f64,

    /// How many of the hottest topics personas are asked to focus on.
    #[serde(default = "default_focus_topics")]
    pub focus_topics: usize,
}

impl Default for DiscussionConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            backoff_ms: default_llm_backoff(),
            timeout_secs: default_llm_timeout(),
            min_success_ratio: 0.0,
            focus_topics: default_focus_topics(),
        }
    }
}

fn default_focus_topics() -> usize {
    3
}

/// Output format of the rendered report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Html,
    Markdown,
}

impl ReportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::Markdown => "md",
        }
    }
}

/// `[report]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default = "default_report_title")]
    pub title: String,

    #[serde(default)]
    pub format: ReportFormat,

    /// Ask the model for an executive summary section.
    #[serde(default)]
    pub executive_summary: bool,

    #[serde(default = "default_retries")]
    pub retries: u32,

    #[serde(default = "default_llm_backoff")]
    pub backoff_ms: u64,

    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            title: default_report_title(),
            format: ReportFormat::default(),
            executive_summary: false,
            retries: default_retries(),
            backoff_ms: default_llm_backoff(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

fn default_report_title() -> String {
    "TrendRadar Public Opinion Report".into()
}

/// `[orchestrator]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Whole-stage retries after a recoverable stage failure.
    #[serde(default)]
    pub stage_retries: u32,
}

/// `[[platforms]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Identifier passed to the scraper (e.g., `weibo`).
    pub id: String,
    /// Display name used in reports.
    #[serde(default)]
    pub name: String,
}

impl PlatformConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

fn default_platforms() -> Vec<PlatformConfig> {
    vec![
        PlatformConfig::new("weibo", "Weibo Hot Search"),
        PlatformConfig::new("zhihu", "Zhihu Hot List"),
        PlatformConfig::new("bilibili-hot-search", "Bilibili Hot Search"),
        PlatformConfig::new("toutiao", "Toutiao"),
        PlatformConfig::new("douyin", "Douyin Hot List"),
        PlatformConfig::new("36kr", "36Kr"),
        PlatformConfig::new("sspai", "SSPAI"),
    ]
}

/// `[[personas]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonaConfig {
    pub name: String,
    pub role: String,
    /// Instructions describing the persona's perspective.
    pub brief: String,
}

impl PersonaConfig {
    pub fn new(name: &str, role: &str, brief: &str) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            brief: brief.into(),
        }
    }
}

fn default_personas() -> Vec<PersonaConfig> {
    vec![
        PersonaConfig::new(
            "Insight",
            "analyst",
            "Look beneath the headlines: underlying causes, likely consequences and structural shifts.",
        ),
        PersonaConfig::new(
            "Media",
            "media commentator",
            "Describe how mainstream media and social platforms frame the events and the overall mood.",
        ),
        PersonaConfig::new(
            "Query",
            "fact checker",
            "Separate confirmed facts from open questions and flag claims that still need verification.",
        ),
        PersonaConfig::new(
            "Host",
            "moderator",
            "Synthesize the previous speakers into a balanced closing assessment.",
        ),
    ]
}

// ---------------------------------------------------------------------------
// Run config (runtime, validated, merged from config + CLI flags + env)
// ---------------------------------------------------------------------------

/// Endpoint, credentials and sampling settings passed through to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

/// Retry behaviour for one kind of collaborator call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    /// Delay before the first retry; doubled after each attempt.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Budget for a single attempt.
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_ms: u64, timeout_secs: u64) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(backoff_ms),
            max_delay: Duration::from_secs(30),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct CollectionSettings {
    pub endpoint: String,
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub max_items_per_platform: usize,
}

#[derive(Debug, Clone)]
pub struct AnalysisSettings {
    pub batch_size: usize,
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub min_success_ratio: f64,
    pub categories: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DiscussionSettings {
    pub retry: RetryPolicy,
    pub min_success_ratio: f64,
    pub focus_topics: usize,
}

#[derive(Debug, Clone)]
pub struct ReportSettings {
    pub title: String,
    pub format: ReportFormat,
    pub executive_summary: bool,
    pub retry: RetryPolicy,
}

/// Validated configuration for a single run. Never mutated once built.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub output_dir: PathBuf,
    pub lookback_hours: u32,
    pub cache_completions: bool,
    pub model: ModelConfig,
    pub collection: CollectionSettings,
    pub analysis: AnalysisSettings,
    pub discussion: DiscussionSettings,
    pub report: ReportSettings,
    pub stage_retries: u32,
    pub platforms: Vec<PlatformConfig>,
    pub personas: Vec<PersonaConfig>,
}

impl RunConfig {
    /// Validate `config` and resolve environment-dependent values.
    ///
    /// Returns a configuration error naming the first offending key.
    pub fn from_app(config: &AppConfig) -> Result<Self> {
        validate(config)?;

        let base_url = first_set(BASE_URL_ENVS, env_override)
            .unwrap_or_else(|| config.llm.base_url.clone());
        let model = first_set(MODEL_ENVS, env_override).unwrap_or_else(|| config.llm.model.clone());

        Ok(Self {
            output_dir: expand_home(&config.defaults.output_dir),
            lookback_hours: config.defaults.lookback_hours,
            cache_completions: config.llm.cache,
            model: ModelConfig {
                base_url,
                api_key: resolve_api_key(&config.llm),
                model,
                temperature: config.llm.temperature,
                max_tokens: config.llm.max_tokens,
            },
            collection: CollectionSettings {
                endpoint: config.collection.endpoint.clone(),
                concurrency: config.collection.concurrency,
                retry: RetryPolicy::new(
                    config.collection.retries,
                    config.collection.backoff_ms,
                    config.collection.timeout_secs,
                ),
                max_items_per_platform: config.collection.max_items_per_platform,
            },
            analysis: AnalysisSettings {
                batch_size: config.analysis.batch_size,
                concurrency: config.analysis.concurrency,
                retry: RetryPolicy::new(
                    config.analysis.retries,
                    config.analysis.backoff_ms,
                    config.analysis.timeout_secs,
                ),
                min_success_ratio: config.analysis.min_success_ratio,
                categories: config.analysis.categories.clone(),
            },
            discussion: DiscussionSettings {
                retry: RetryPolicy::new(
                    config.discussion.retries,
                    config.discussion.backoff_ms,
                    config.discussion.timeout_secs,
                ),
                min_success_ratio: config.discussion.min_success_ratio,
                focus_topics: config.discussion.focus_topics,
            },
            report: ReportSettings {
                title: config.report.title.clone(),
                format: config.report.format,
                executive_summary: config.report.executive_summary,
                retry: RetryPolicy::new(
                    config.report.retries,
                    config.report.backoff_ms,
                    config.report.timeout_secs,
                ),
            },
            stage_retries: config.orchestrator.stage_retries,
            platforms: config.platforms.clone(),
            personas: config.personas.clone(),
        })
    }

    /// Restrict collection to the given platform ids, keeping configured order.
    pub fn restrict_platforms(&mut self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        for id in ids {
            if !self.platforms.iter().any(|p| &p.id == id) {
                return Err(TrendRadarError::config(format!(
                    "platform '{id}' is not configured"
                )));
            }
        }
        self.platforms.retain(|p| ids.contains(&p.id));
        Ok(())
    }

    /// Path of the run database inside the output directory.
    pub fn database_path(&self) -> PathBuf {
        self.output_dir.join("trendradar.db")
    }
}

fn validate(config: &AppConfig) -> Result<()> {
    if config.platforms.is_empty() {
        return Err(TrendRadarError::config("no platforms configured"));
    }
    let mut seen = HashSet::new();
    for platform in &config.platforms {
        if platform.id.trim().is_empty() {
            return Err(TrendRadarError::config("platform id must not be empty"));
        }
        if !seen.insert(platform.id.as_str()) {
            return Err(TrendRadarError::config(format!(
                "platform '{}' is configured twice",
                platform.id
            )));
        }
    }

    if config.personas.is_empty() {
        return Err(TrendRadarError::config("no personas configured"));
    }
    let mut seen = HashSet::new();
    for persona in &config.personas {
        if persona.name.trim().is_empty() {
            return Err(TrendRadarError::config("persona name must not be empty"));
        }
        if !seen.insert(persona.name.as_str()) {
            return Err(TrendRadarError::config(format!(
                "persona '{}' is configured twice",
                persona.name
            )));
        }
    }

    if !config.collection.endpoint.contains("{id}") {
        return Err(TrendRadarError::config(
            "collection.endpoint must contain an {id} placeholder",
        ));
    }
    positive("collection.concurrency", config.collection.concurrency)?;
    positive(
        "collection.max_items_per_platform",
        config.collection.max_items_per_platform,
    )?;
    positive("collection.timeout_secs", config.collection.timeout_secs)?;
    positive("analysis.timeout_secs", config.analysis.timeout_secs)?;
    positive("discussion.timeout_secs", config.discussion.timeout_secs)?;
    positive("report.timeout_secs", config.report.timeout_secs)?;
    positive("analysis.batch_size", config.analysis.batch_size)?;
    positive("analysis.concurrency", config.analysis.concurrency)?;
    ratio("analysis.min_success_ratio", config.analysis.min_success_ratio)?;
    ratio(
        "discussion.min_success_ratio",
        config.discussion.min_success_ratio,
    )?;
    if config.analysis.categories.is_empty() {
        return Err(TrendRadarError::config("analysis.categories must not be empty"));
    }
    if !(0.0..=2.0).contains(&config.llm.temperature) {
        return Err(TrendRadarError::config(
            "llm.temperature must be between 0 and 2",
        ));
    }
    if config.llm.base_url.trim().is_empty() {
        return Err(TrendRadarError::config("llm.base_url must not be empty"));
    }
    Ok(())
}

fn positive<T: Default + PartialEq>(key: &str, value: T) -> Result<()> {
    if value == T::default() {
        return Err(TrendRadarError::config(format!("{key} must be at least 1")));
    }
    Ok(())
}

fn ratio(key: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(TrendRadarError::config(format!(
            "{key} must be between 0 and 1, got {value}"
        )));
    }
    Ok(())
}

fn env_override(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn first_set(names: &[&str], lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    names.iter().find_map(|name| lookup(name))
}

/// Resolve the model API key: `llm.api_key_env` first, then the fallbacks.
pub fn resolve_api_key(llm: &LlmConfig) -> Option<String> {
    std::iter::once(llm.api_key_env.as_str())
        .chain(API_KEY_FALLBACK_ENVS.iter().copied())
        .find_map(env_override)
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.trendradar/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| TrendRadarError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.trendradar/trendradar.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| TrendRadarError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| TrendRadarError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Candidate dotenv files in search order.
///
/// `explicit` (from `ENV_FILE`) replaces the search. Otherwise the working
/// directory and a few of its parents are tried, then the config directory.
pub fn env_file_candidates(explicit: Option<PathBuf>, cwd: &Path, config_dir: Option<&Path>) -> Vec<PathBuf> {
    if let Some(path) = explicit {
        return vec![path];
    }
    let mut candidates: Vec<PathBuf> = cwd
        .ancestors()
        .take(ENV_FILE_PARENT_DEPTH + 1)
        .map(|dir| dir.join(".env"))
        .collect();
    if let Some(dir) = config_dir {
        candidates.push(dir.join(".env"));
    }
    candidates.dedup();
    candidates
}

/// Load the first existing dotenv file into the process environment.
///
/// Variables already set are kept. Returns the file that was loaded; an
/// unreadable file is skipped with a warning.
pub fn load_env_file() -> Option<PathBuf> {
    let explicit = std::env::var_os(ENV_FILE_VAR).map(PathBuf::from);
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let config_dir = config_dir().ok();
    load_first_env_file(env_file_candidates(explicit, &cwd, config_dir.as_deref()))
}

fn load_first_env_file(candidates: Vec<PathBuf>) -> Option<PathBuf> {
    candidates
        .into_iter()
        .filter(|path| path.is_file())
        .find_map(|path| match dotenvy::from_path(&path) {
            Ok(()) => Some(path),
            Err(e) => {
                tracing::warn!(?path, error = %e, "failed to load env file");
                None
            }
        })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file. An existing file is left untouched
/// unless `force` is set.
pub fn init_config(force: bool) -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| TrendRadarError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    if path.exists() && !force {
        return Err(TrendRadarError::config(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }

    let content = toml::to_string_pretty(&AppConfig::default())
        .map_err(|e| TrendRadarError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| TrendRadarError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
