//! Trending-list collection for TrendRadar.
//!
//! This crate provides:
//! - [`Scraper`]: the fetch contract the pipeline calls once per platform
//! - [`NewsNowScraper`]: a JSON hot-list client for NewsNow-compatible APIs
//! - [`merge_items`]: `(platform, title)` deduplication across fetches

pub mod newsnow;

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use trendradar_shared::{ItemKey, PlatformConfig, RawItem, Result};

pub use newsnow::NewsNowScraper;

/// Per-call options passed through to a [`Scraper`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    /// Keep at most this many entries, ranked 1..=N in list order.
    pub max_items: usize,
    /// Budget for the whole request.
    pub timeout: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            max_items: 30,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Fetches the current trending list of one platform.
///
/// Implementations return items in platform order. Any error is treated by
/// the caller as a failure of that platform only.
#[async_trait]
pub trait Scraper: Send + Sync {
    async fn fetch(&self, platform: &PlatformConfig, options: &FetchOptions)
    -> Result<Vec<RawItem>>;
}

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Collapse internal whitespace runs and trim, so the same entry fetched
/// twice produces the same dedup key.
pub fn normalize_title(title: &str) -> String {
    WHITESPACE.replace_all(title.trim(), " ").into_owned()
}

/// Merge item lists in the given order, deduplicating by `(platform, title)`.
///
/// A later occurrence replaces an earlier one (its rank, url and metadata
/// win) while keeping the position of the first occurrence. Entries with an
/// empty title are dropped.
pub fn merge_items<I>(batches: I) -> Vec<RawItem>
where
    I: IntoIterator<Item = Vec<RawItem>>,
{
    let mut merged: Vec<RawItem> = Vec::new();
    let mut index: HashMap<ItemKey, usize> = HashMap::new();

    for batch in batches {
        for item in batch {
            if item.title.trim().is_empty() {
                continue;
            }
            match index.get(&item.key()) {
                Some(&pos) => merged[pos] = item,
                None => {
                    index.insert(item.key(), merged.len());
                    merged.push(item);
                }
            }
        }
    }

    merged
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

    #[test]
    fn normalize_collapses_whitespace() {
        assert_eq!(normalize_title("  rate \n\t cut  "), "rate cut");
    }

    #[test]
    fn merge_dedups_last_write_wins() {
        let first = vec![item("weibo", "a", 1), item("weibo", "b", 2)];
        let second = vec![item("weibo", "b", 1), item("zhihu", "a", 1)];

        let merged = merge_items([first, second]);

        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].title, "a");
        assert_eq!(merged[1].title, "b");
        assert_eq!(merged[1].rank, 1, "later rank replaces earlier");
        assert_eq!(merged[2].platform, "zhihu");
    }

    #[test]
    fn merge_drops_empty_titles() {
        let merged = merge_items([vec![item("weibo", "  ", 1), item("weibo", "x", 2)]]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].title, "x");
    }
}
