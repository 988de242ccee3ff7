//! Self-contained HTML report.

use std::fmt::Write as _;

use tracing::{debug, instrument};

use trendradar_shared::{
    RawItem, ReportDocument, ReportSection, Result, SectionBody, SectionKind, Statement,
    TopicGroup, TrendRadarError,
};

use crate::{ReportRenderer, format_heat};

const STYLE: &str = r#"
* { box-sizing: border-box; }
body { font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', system-ui, sans-serif; margin: 0; padding: 16px; background: #fafafa; color: #333; line-height: 1.5; }
.container { max-width: 720px; margin: 0 auto; background: white; border-radius: 12px; overflow: hidden; box-shadow: 0 2px 16px rgba(0,0,0,0.06); }
.header { background: linear-gradient(135deg, #4f46e5 0%, #7c3aed 100%); color: white; padding: 32px 24px; text-align: center; }
.header-title { font-size: 22px; font-weight: 700; margin: 0 0 20px 0; }
.header-info { display: grid; grid-template-columns: 1fr 1fr; gap: 16px; font-size: 14px; }
.info-label { display: block; font-size: 12px; opacity: 0.8; margin-bottom: 4px; }
.info-value { font-weight: 600; font-size: 16px; }
.content { padding: 24px; }
.section { margin-bottom: 32px; }
.section-title { font-size: 16px; font-weight: 600; color: #1a1a1a; margin: 0 0 16px 0; padding-bottom: 8px; border-bottom: 1px solid #f0f0f0; }
.section-body { font-size: 14px; color: #374151; line-height: 1.6; white-space: pre-wrap; }
.unavailable { font-size: 14px; color: #92400e; background: #fffbeb; border: 1px solid #fde68a; border-radius: 8px; padding: 12px; }
.topic-category { margin: 18px 0 8px 0; font-size: 14px; font-weight: 600; color: #4b5563; }
.topic-item { margin-bottom: 16px; padding: 12px; background: #f8fafc; border-radius: 8px; border-left: 4px solid #4f46e5; }
.topic-name { font-weight: 600; color: #1e293b; margin-bottom: 4px; }
.topic-meta { font-size: 12px; color: #64748b; margin-bottom: 6px; }
.topic-comment { font-size: 13px; color: #475569; }
.statement { margin-bottom: 16px; }
.speaker { font-weight: 600; color: #4f46e5; font-size: 13px; }
.statement-text { font-size: 14px; color: #374151; white-space: pre-wrap; }
.raw-table { width: 100%; border-collapse: collapse; font-size: 13px; }
.raw-table th, .raw-table td { padding: 8px 10px; border-bottom: 1px solid #e5e7eb; text-align: left; }
.raw-table th { color: #4b5563; font-weight: 600; font-size: 12px; background: #f1f5f9; }
.platform-cell { white-space: nowrap; font-weight: 500; }
.rank-cell { width: 60px; color: #6b7280; }
.news-link { color: #2563eb; text-decoration: none; }
.hot-badge { margin-left: 6px; font-size: 11px; color: #b91c1c; }
.footer { padding: 20px 24px; background: #f8f9fa; border-top: 1px solid #e5e7eb; text-align: center; font-size: 13px; color: #6b7280; }
@media (max-width: 480px) { .header-info { grid-template-columns: 1fr; } }
"#;

/// Renders a [`ReportDocument`] as a single HTML page with inline CSS.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlRenderer;

impl ReportRenderer for HtmlRenderer {
    #[instrument(skip_all, fields(sections = document.sections.len()))]
    fn render(&self, document: &ReportDocument) -> Result<Vec<u8>> {
        let html = render_page(document)
            .map_err(|e| TrendRadarError::Render(format!("failed to write HTML: {e}")))?;
        debug!(bytes = html.len(), "rendered HTML report");
        Ok(html.into_bytes())
    }

    fn extension(&self) -> &'static str {
        "html"
    }
}

fn render_page(doc: &ReportDocument) -> std::result::Result<String, std::fmt::Error> {
    let mut out = String::with_capacity(16 * 1024);

    writeln!(out, "<!DOCTYPE html>")?;
    writeln!(out, "<html lang=\"zh-CN\">")?;
    writeln!(out, "<head>")?;
    writeln!(out, "<meta charset=\"UTF-8\">")?;
    writeln!(
        out,
        "<meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\">"
    )?;
    writeln!(out, "<title>{}</title>", escape(&doc.title))?;
    writeln!(out, "<style>{STYLE}</style>")?;
    writeln!(out, "</head>")?;
    writeln!(out, "<body>")?;
    writeln!(out, "<div class=\"container\">")?;

    // Header
    writeln!(out, "<div class=\"header\">")?;
    writeln!(out, "<h1 class=\"header-title\">{}</h1>", escape(&doc.title))?;
    writeln!(out, "<div class=\"header-info\">")?;
    info_item(&mut out, "Items collected", &doc.item_count.to_string())?;
    info_item(&mut out, "Topics", &doc.topic_count.to_string())?;
    let window = match doc.window {
        Some((start, end)) => format!(
            "{} ~ {}",
            start.format("%m-%d %H:%M"),
            end.format("%m-%d %H:%M")
        ),
        None => "-".to_string(),
    };
    info_item(&mut out, "Time window", &window)?;
    info_item(
        &mut out,
        "Generated",
        &doc.generated_at.format("%Y-%m-%d %H:%M UTC").to_string(),
    )?;
    writeln!(out, "</div>")?;
    writeln!(out, "</div>")?;

    writeln!(out, "<div class=\"content\">")?;
    for section in &doc.sections {
        render_section(&mut out, section)?;
    }
    writeln!(out, "</div>")?;

    writeln!(out, "<div class=\"footer\">Generated by TrendRadar</div>")?;
    writeln!(out, "</div>")?;
    writeln!(out, "</body>")?;
    writeln!(out, "</html>")?;

    Ok(out)
}

fn info_item(out: &mut String, label: &str, value: &str) -> std::fmt::Result {
    writeln!(
        out,
        "<div class=\"info-item\"><span class=\"info-label\">{}</span><span class=\"info-value\">{}</span></div>",
        escape(label),
        escape(value)
    )
}

fn render_section(out: &mut String, section: &ReportSection) -> std::fmt::Result {
    let kind = section_anchor(section.kind);
    writeln!(out, "<section class=\"section\" id=\"{kind}\">")?;
    writeln!(out, "<h2 class=\"section-title\">{}</h2>", escape(&section.title))?;

    match &section.body {
        SectionBody::Text(text) => {
            writeln!(out, "<div class=\"section-body\">{}</div>", escape(text))?;
        }
        SectionBody::Topics(groups) => render_topics(out, groups)?,
        SectionBody::Transcript(statements) => render_transcript(out, statements)?,
        SectionBody::Sources(items) => render_sources(out, items)?,
        SectionBody::Unavailable { reason } => {
            writeln!(
                out,
                "<div class=\"unavailable\">Data unavailable: {}</div>",
                escape(reason)
            )?;
        }
    }

    writeln!(out, "</section>")
}

fn section_anchor(kind: SectionKind) -> &'static str {
    match kind {
        SectionKind::ExecutiveSummary => "executive-summary",
        SectionKind::Overview => "overview",
        SectionKind::Topics => "topics",
        SectionKind::Discussion => "discussion",
        SectionKind::Sources => "sources",
    }
}

fn render_topics(out: &mut String, groups: &[TopicGroup]) -> std::fmt::Result {
    for group in groups {
        writeln!(
            out,
            "<div class=\"topic-category\">{}</div>",
            escape(&group.cluster)
        )?;
        for topic in &group.topics {
            writeln!(out, "<div class=\"topic-item\" data-topic-id=\"{}\">", escape(&topic.id))?;
            writeln!(out, "<div class=\"topic-name\">{}</div>", escape(&topic.name))?;

            let mut meta = vec![format!("sentiment: {}", topic.sentiment)];
            if let Some(heat) = topic.salience {
                meta.push(format!("heat: {}", format_heat(heat)));
            }
            writeln!(
                out,
                "<div class=\"topic-meta\">{}</div>",
                escape(&meta.join(" · "))
            )?;

            if !topic.summary.is_empty() {
                writeln!(
                    out,
                    "<div class=\"topic-comment\">{}</div>",
                    escape(&topic.summary)
                )?;
            }
            writeln!(out, "</div>")?;
        }
    }
    Ok(())
}

fn render_transcript(out: &mut String, statements: &[Statement]) -> std::fmt::Result {
    for statement in statements {
        writeln!(out, "<div class=\"statement\">")?;
        writeln!(
            out,
            "<div class=\"speaker\">{} ({})</div>",
            escape(&statement.persona),
            escape(&statement.role)
        )?;
        writeln!(
            out,
            "<div class=\"statement-text\">{}</div>",
            escape(&statement.text)
        )?;
        writeln!(out, "</div>")?;
    }
    Ok(())
}

fn render_sources(out: &mut String, items: &[RawItem]) -> std::fmt::Result {
    writeln!(out, "<table class=\"raw-table\">")?;
    writeln!(
        out,
        "<thead><tr><th>Platform</th><th>Rank</th><th>Title</th></tr></thead>"
    )?;
    writeln!(out, "<tbody>")?;
    for item in items {
        write!(
            out,
            "<tr><td class=\"platform-cell\">{}</td><td class=\"rank-cell\">{}</td><td class=\"title-cell\">",
            escape(item.platform_label()),
            item.rank
        )?;
        let link = item.link();
        if link.is_empty() {
            write!(out, "{}", escape(&item.title))?;
        } else {
            write!(
                out,
                "<a href=\"{}\" target=\"_blank\" rel=\"noopener\" class=\"news-link\">{}</a>",
                escape(link),
                escape(&item.title)
            )?;
        }
        if let Some(hot) = item.hot_value().filter(|v| *v > 0.0) {
            write!(out, "<span class=\"hot-badge\">heat {}</span>", format_heat(hot))?;
        }
        writeln!(out, "</td></tr>")?;
    }
    writeln!(out, "</tbody>")?;
    writeln!(out, "</table>")
}

/// Escape text for HTML element content and double-quoted attributes.
pub fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use scraper::{Html, Selector};

    fn render(doc: &ReportDocument) -> Html {
        let bytes = HtmlRenderer.render(doc).expect("render");
        Html::parse_document(&String::from_utf8(bytes).expect("utf-8"))
    }

    fn texts(html: &Html, selector: &str) -> Vec<String> {
        let sel = Selector::parse(selector).unwrap();
        html.select(&sel)
            .map(|el| el.text().collect::<String>().trim().to_string())
            .collect()
    }

    #[test]
    fn escape_special_characters() {
        assert_eq!(
            escape(r#"<a href="x">&'"#),
            "&lt;a href=&quot;x&quot;&gt;&amp;&#x27;"
        );
    }

    #[test]
    fn renders_sections_in_order() {
        let html = render(&fixtures::document());
        let ids: Vec<String> = html
            .select(&Selector::parse("section.section").unwrap())
            .filter_map(|el| el.value().attr("id").map(String::from))
            .collect();
        assert_eq!(ids, vec!["overview", "topics", "discussion", "sources"]);
        assert_eq!(texts(&html, "h1.header-title"), vec!["Daily Radar"]);
    }

    #[test]
    fn topic_text_is_escaped() {
        let html = render(&fixtures::document());
        // Parsed text equals the original, proving it was escaped rather than injected.
        assert_eq!(texts(&html, ".topic-name"), vec!["Rate cut <announced>"]);
        assert_eq!(
            texts(&html, ".topic-meta"),
            vec!["sentiment: positive · heat: 92.5"]
        );
        assert_eq!(texts(&html, ".topic-category"), vec!["economy"]);
    }

    #[test]
    fn source_table_links_and_badges() {
        let html = render(&fixtures::document());
        let rows = texts(&html, ".raw-table tbody tr");
        assert_eq!(rows.len(), 2);

        let links: Vec<String> = html
            .select(&Selector::parse("a.news-link").unwrap())
            .filter_map(|el| el.value().attr("href").map(String::from))
            .collect();
        assert_eq!(links, vec!["https://example.com/1?a=1&b=2"]);
        assert_eq!(texts(&html, ".hot-badge"), vec!["heat 12000"]);
        assert_eq!(texts(&html, ".platform-cell"), vec!["Weibo", "zhihu"]);
    }

    #[test]
    fn unavailable_section_has_marker() {
        let html = render(&fixtures::degraded_document());
        let markers = texts(&html, "#discussion .unavailable");
        assert_eq!(markers, vec!["Data unavailable: all personas failed"]);
        assert!(texts(&html, ".statement").is_empty());
    }
}
