//! Plain Markdown report, for terminals and chat tools.

use std::fmt::Write as _;

use trendradar_shared::{ReportDocument, Result, SectionBody, TrendRadarError};

use crate::{ReportRenderer, format_heat};

#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownRenderer;

impl ReportRenderer for MarkdownRenderer {
    fn render(&self, document: &ReportDocument) -> Result<Vec<u8>> {
        render_markdown(document)
            .map(String::into_bytes)
            .map_err(|e| TrendRadarError::Render(format!("failed to write Markdown: {e}")))
    }

    fn extension(&self) -> &'static str {
        "md"
    }
}

fn render_markdown(doc: &ReportDocument) -> std::result::Result<String, std::fmt::Error> {
    let mut out = String::new();

    writeln!(out, "# {}", doc.title)?;
    writeln!(out)?;
    writeln!(
        out,
        "_Generated {} · {} items · {} topics_",
        doc.generated_at.format("%Y-%m-%d %H:%M UTC"),
        doc.item_count,
        doc.topic_count
    )?;

    for section in &doc.sections {
        writeln!(out)?;
        writeln!(out, "## {}", section.title)?;
        writeln!(out)?;

        match &section.body {
            SectionBody::Text(text) => writeln!(out, "{}", text.trim())?,
            SectionBody::Topics(groups) => {
                for group in groups {
                    writeln!(out, "### {}", group.cluster)?;
                    writeln!(out)?;
                    for topic in &group.topics {
                        let heat = topic
                            .salience
                            .map(|h| format!(", heat {}", format_heat(h)))
                            .unwrap_or_default();
                        writeln!(out, "- **{}** ({}{heat})", topic.name, topic.sentiment)?;
                        if !topic.summary.is_empty() {
                            writeln!(out, "  {}", topic.summary)?;
                        }
                    }
                    writeln!(out)?;
                }
            }
            SectionBody::Transcript(statements) => {
                for statement in statements {
                    writeln!(
                        out,
                        "**{} ({}):** {}",
                        statement.persona,
                        statement.role,
                        statement.text.trim()
                    )?;
                    writeln!(out)?;
                }
            }
            SectionBody::Sources(items) => {
                writeln!(out, "| Platform | Rank | Title |")?;
                writeln!(out, "|---|---|---|")?;
                for item in items {
                    let title = item.title.replace('|', "\\|");
                    let cell = if item.link().is_empty() {
                        title
                    } else {
                        format!("[{title}]({})", item.link())
                    };
                    writeln!(out, "| {} | {} | {cell} |", item.platform_label(), item.rank)?;
                }
            }
            SectionBody::Unavailable { reason } => {
                writeln!(out, "> Data unavailable: {reason}")?;
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    fn render(doc: &ReportDocument) -> String {
        String::from_utf8(MarkdownRenderer.render(doc).unwrap()).unwrap()
    }

    #[test]
    fn renders_headings_and_topics() {
        let md = render(&fixtures::document());
        assert!(md.starts_with("# Daily Radar\n"));
        assert!(md.contains("## Topic analysis"));
        assert!(md.contains("### economy"));
        assert!(md.contains("- **Rate cut <announced>** (positive, heat 92.5)"));
        assert!(md.contains("**Insight (analyst):** Structural shift."));
    }

    #[test]
    fn source_rows_link_when_url_known() {
        let md = render(&fixtures::document());
        assert!(md.contains("| Weibo | 1 | [Rate cut](https://example.com/1?a=1&b=2) |"));
        assert!(md.contains("| zhihu | 2 | No link |"));
    }

    #[test]
    fn unavailable_marker() {
        let md = render(&fixtures::degraded_document());
        assert!(md.contains("> Data unavailable: all personas failed"));
    }
}
