//! Report rendering for TrendRadar.
//!
//! A [`ReportDocument`] is built by the pipeline independent of any output
//! format; a [`ReportRenderer`] turns it into bytes. Two renderers ship:
//! [`HtmlRenderer`] (the default, self-contained page) and
//! [`MarkdownRenderer`].

mod html;
mod markdown;

use trendradar_shared::{ReportDocument, ReportFormat, Result};

pub use html::HtmlRenderer;
pub use markdown::MarkdownRenderer;

/// The render contract: `render(document) -> bytes | failure`.
pub trait ReportRenderer: Send + Sync {
    fn render(&self, document: &ReportDocument) -> Result<Vec<u8>>;

    /// File extension for rendered output, without the dot.
    fn extension(&self) -> &'static str;
}

/// Renderer for a configured format.
pub fn renderer_for(format: ReportFormat) -> Box<dyn ReportRenderer> {
    match format {
        ReportFormat::Html => Box::new(HtmlRenderer),
        ReportFormat::Markdown => Box::new(MarkdownRenderer),
    }
}

/// Format a heat score without a trailing `.0`.
pub(crate) fn format_heat(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        format!("{value:.1}")
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heat_formatting() {
        assert_eq!(format_heat(92.0), "92");
        assert_eq!(format_heat(92.5), "92.5");
    }

    #[test]
    fn renderer_for_format() {
        assert_eq!(renderer_for(ReportFormat::Html).extension(), "html");
        assert_eq!(renderer_for(ReportFormat::Markdown).extension(), "md");
    }
}
