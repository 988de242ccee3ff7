//! Shared types, error model, and configuration for TrendRadar.
//!
//! This crate is the foundation depended on by all other TrendRadar crates.
//! It provides:
//! - [`TrendRadarError`] and [`ErrorClass`], the unified error model
//! - Domain types ([`RawItem`], [`Analysis`], [`Discussion`], [`Report`], [`RunId`])
//! - Configuration ([`AppConfig`], [`RunConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    API_KEY_FALLBACK_ENVS, AppConfig, AnalysisSettings, BASE_URL_ENVS, CollectionSettings,
    DiscussionSettings, ENV_FILE_VAR, FALLBACK_CATEGORY, MODEL_ENVS, ModelConfig, PersonaConfig,
    PlatformConfig, ReportFormat, ReportSettings, RetryPolicy, RunConfig, config_dir,
    config_file_path, env_file_candidates, expand_home, init_config, load_config, load_config_from,
    load_env_file, resolve_api_key,
};
pub use error::{ErrorClass, Result, TrendRadarError};
pub use types::{
    Analysis, Discussion, ItemKey, ItemMetadata, RawItem, Report, ReportDocument, ReportSection,
    RunId, SectionBody, SectionKind, Sentiment, Statement, TopicGroup, TopicInsight, topic_id,
};
