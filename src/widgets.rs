//! Index-page widgets: "recently updated" and "recently stale" page
//! lists, derived from the same batch metadata read as the sidebar and
//! cached with the same invalidate-together discipline under independent
//! keys.

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::cache::{self, Cache};
use crate::config::WidgetsConfig;
use crate::store::{ContentStore, PageSummary};

pub const RECENTLY_UPDATED_KEY: &str = "wiki:widgets:recently_updated";
pub const RECENTLY_STALE_KEY: &str = "wiki:widgets:recently_stale";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetEntry {
    pub path: String,
    pub title: String,
    pub date: NaiveDateTime,
}

pub struct WidgetService {
    cache: Arc<dyn Cache>,
    config: WidgetsConfig,
}

impl WidgetService {
    pub fn new(cache: Arc<dyn Cache>, config: WidgetsConfig) -> Self {
        Self { cache, config }
    }

    pub fn default_limit(&self) -> usize {
        self.config.limit
    }

    /// Most recently updated pages, newest first. The full sorted list is
    /// cached; `limit` is applied per call.
    pub async fn recently_updated(&self, store: &ContentStore, limit: usize) -> Vec<WidgetEntry> {
        self.recently_updated_with(|| store.get_pages_with_dates(), limit)
            .await
    }

    pub(crate) async fn recently_updated_with<F>(&self, fetch: F, limit: usize) -> Vec<WidgetEntry>
    where
        F: FnOnce() -> Vec<PageSummary>,
    {
        if let Some(mut entries) =
            cache::get_json::<Vec<WidgetEntry>>(self.cache.as_ref(), RECENTLY_UPDATED_KEY).await
        {
            entries.truncate(limit);
            return entries;
        }

        let mut entries: Vec<WidgetEntry> = fetch()
            .into_iter()
            .filter_map(|summary| {
                summary.content_date.map(|date| WidgetEntry {
                    path: summary.path,
                    title: summary.title,
                    date,
                })
            })
            .collect();
        entries.sort_by(|a, b| b.date.cmp(&a.date).then(a.path.cmp(&b.path)));

        cache::set_json(self.cache.as_ref(), RECENTLY_UPDATED_KEY, &entries).await;
        tracing::debug!(pages = entries.len(), "rebuilt recently-updated cache");

        entries.truncate(limit);
        entries
    }

    /// Pages inside the stale window (approaching outdated but not past
    /// it), oldest first.
    pub async fn recently_stale(&self, store: &ContentStore, limit: usize) -> Vec<WidgetEntry> {
        self.recently_stale_with(|| store.get_pages_with_dates(), limit)
            .await
    }

    pub(crate) async fn recently_stale_with<F>(&self, fetch: F, limit: usize) -> Vec<WidgetEntry>
    where
        F: FnOnce() -> Vec<PageSummary>,
    {
        if let Some(mut entries) =
            cache::get_json::<Vec<WidgetEntry>>(self.cache.as_ref(), RECENTLY_STALE_KEY).await
        {
            entries.truncate(limit);
            return entries;
        }

        let now = Local::now().naive_local();
        let mut candidates: Vec<(WidgetEntry, i64)> = fetch()
            .into_iter()
            .filter_map(|summary| {
                let date = summary.content_date?;
                let days_old = (now - date).num_days();
                if days_old >= self.config.stale_min_days && days_old < self.config.stale_max_days {
                    Some((
                        WidgetEntry {
                            path: summary.path,
                            title: summary.title,
                            date,
                        },
                        days_old,
                    ))
                } else {
                    None
                }
            })
            .collect();

        // Closest to the outdated threshold first
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.path.cmp(&b.0.path)));
        let entries: Vec<WidgetEntry> = candidates.into_iter().map(|(entry, _)| entry).collect();

        cache::set_json(self.cache.as_ref(), RECENTLY_STALE_KEY, &entries).await;
        tracing::debug!(pages = entries.len(), "rebuilt recently-stale cache");

        let mut entries = entries;
        entries.truncate(limit);
        entries
    }

    pub async fn invalidate(&self) {
        self.cache.delete(RECENTLY_UPDATED_KEY).await;
        self.cache.delete(RECENTLY_STALE_KEY).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn service() -> WidgetService {
        WidgetService::new(
            Arc::new(MemoryCache::new(Duration::from_secs(60))),
            WidgetsConfig::default(),
        )
    }

    fn summary(path: &str, days_ago: i64) -> PageSummary {
        PageSummary {
            path: path.to_string(),
            title: path.to_string(),
            content_date: Some(Local::now().naive_local() - ChronoDuration::days(days_ago)),
        }
    }

    #[tokio::test]
    async fn recently_updated_sorts_newest_first() {
        let service = service();
        let entries = service
            .recently_updated_with(
                || vec![summary("old", 30), summary("new", 1), summary("mid", 10)],
                8,
            )
            .await;

        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["new", "mid", "old"]);
    }

    #[tokio::test]
    async fn recently_updated_applies_limit_per_call() {
        let service = service();
        service
            .recently_updated_with(
                || (0..10).map(|i| summary(&format!("p{}", i), i)).collect(),
                3,
            )
            .await;

        // Second call hits the cache but asks for more
        let entries = service
            .recently_updated_with(|| panic!("should not refetch"), 5)
            .await;
        assert_eq!(entries.len(), 5);
    }

    #[tokio::test]
    async fn pages_without_dates_are_skipped() {
        let service = service();
        let entries = service
            .recently_updated_with(
                || {
                    vec![
                        summary("dated", 1),
                        PageSummary {
                            path: "undated".into(),
                            title: "Undated".into(),
                            content_date: None,
                        },
                    ]
                },
                8,
            )
            .await;

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "dated");
    }

    #[tokio::test]
    async fn stale_window_filters_and_orders_by_age() {
        let service = service();
        let entries = service
            .recently_stale_with(
                || {
                    vec![
                        summary("fresh", 30),
                        summary("approaching", 280),
                        summary("nearly-out", 360),
                        summary("already-out", 400),
                    ]
                },
                8,
            )
            .await;

        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["nearly-out", "approaching"]);
    }

    #[tokio::test]
    async fn caches_are_fetched_once() {
        let service = service();
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            service
                .recently_updated_with(
                    || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        vec![summary("a", 1)]
                    },
                    8,
                )
                .await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_clears_both_keys() {
        let service = service();
        service
            .recently_updated_with(|| vec![summary("a", 1)], 8)
            .await;
        service
            .recently_stale_with(|| vec![summary("b", 300)], 8)
            .await;

        service.invalidate().await;

        assert!(service.cache.get_raw(RECENTLY_UPDATED_KEY).await.is_none());
        assert!(service.cache.get_raw(RECENTLY_STALE_KEY).await.is_none());
    }
}
