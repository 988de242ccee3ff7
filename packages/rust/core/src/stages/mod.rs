//! The four standard stages.

pub mod analysis;
pub mod collection;
pub mod discussion;
pub mod report;

pub use analysis::AnalysisStage;
pub use collection::{CollectionStage, History};
pub use discussion::DiscussionStage;
pub use report::{ReportStage, group_topics};
