//! Sidebar navigation: a two-tier derived cache over the page tree.
//!
//! Tier 1 is the raw `path -> title` mapping from the store's batch
//! header read; tier 2 is the fully-built category tree (grouped,
//! sorted, expansion-blind). A tier-2 hit skips all grouping and sorting
//! work, not just the filesystem read. `is_current`/`is_expanded` are a
//! per-request overlay computed on a clone of the cached tree, so
//! marking the current page never busts the cache.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cache::{self, Cache};
use crate::store::{humanize_slug, ContentStore};

pub const SIDEBAR_TITLES_KEY: &str = "wiki:sidebar:titles";
pub const SIDEBAR_STRUCTURE_KEY: &str = "wiki:sidebar:structure";

/// The sidebar-definition page itself never appears in the tree.
pub const SIDEBAR_PAGE: &str = "Sidebar";
/// Archived pages are excluded from navigation.
pub const ARCHIVE_PREFIX: &str = "archive/";

const GENERAL_SLUG: &str = "_general";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidebarItem {
    pub path: String,
    pub title: String,
    #[serde(default)]
    pub is_current: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidebarCategory {
    pub name: String,
    pub slug: String,
    pub items: Vec<SidebarItem>,
    #[serde(default)]
    pub is_expanded: bool,
}

pub struct SidebarService {
    cache: Arc<dyn Cache>,
}

impl SidebarService {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    /// Tier 1: cached `path -> title` mapping.
    pub async fn page_titles(&self, store: &ContentStore) -> BTreeMap<String, String> {
        self.titles_with(|| store.get_page_titles()).await
    }

    pub(crate) async fn titles_with<F>(&self, fetch: F) -> BTreeMap<String, String>
    where
        F: FnOnce() -> BTreeMap<String, String>,
    {
        if let Some(titles) = cache::get_json(self.cache.as_ref(), SIDEBAR_TITLES_KEY).await {
            return titles;
        }

        let titles = fetch();
        cache::set_json(self.cache.as_ref(), SIDEBAR_TITLES_KEY, &titles).await;
        tracing::debug!(pages = titles.len(), "rebuilt sidebar title cache");
        titles
    }

    /// Tier 2 plus overlay: the category tree with the current page
    /// marked.
    pub async fn categories(
        &self,
        store: &ContentStore,
        current_path: Option<&str>,
    ) -> Vec<SidebarCategory> {
        self.categories_with(|| store.get_page_titles(), current_path).await
    }

    pub(crate) async fn categories_with<F>(
        &self,
        fetch_titles: F,
        current_path: Option<&str>,
    ) -> Vec<SidebarCategory>
    where
        F: FnOnce() -> BTreeMap<String, String>,
    {
        let mut categories: Vec<SidebarCategory> =
            match cache::get_json(self.cache.as_ref(), SIDEBAR_STRUCTURE_KEY).await {
                Some(categories) => categories,
                None => {
                    let titles = self.titles_with(fetch_titles).await;
                    let categories = build_structure(&titles);
                    cache::set_json(self.cache.as_ref(), SIDEBAR_STRUCTURE_KEY, &categories).await;
                    categories
                }
            };

        apply_current(&mut categories, current_path);
        categories
    }

    /// Clear both tiers. Called by every mutation that could change the
    /// tree (new page, title change, move/archive), deliberately not by
    /// title-stable edits.
    pub async fn invalidate(&self) {
        self.cache.delete(SIDEBAR_TITLES_KEY).await;
        self.cache.delete(SIDEBAR_STRUCTURE_KEY).await;
    }
}

/// Build the request-independent category tree from the title mapping.
///
/// Root-level pages land in a "General" bucket sorted first; the rest
/// group by their first path segment, humanized, alphabetical.
pub fn build_structure(titles: &BTreeMap<String, String>) -> Vec<SidebarCategory> {
    let mut buckets: BTreeMap<String, Vec<SidebarItem>> = BTreeMap::new();

    for (path, title) in titles {
        if path == SIDEBAR_PAGE || path.starts_with(ARCHIVE_PREFIX) {
            continue;
        }

        let slug = match path.split_once('/') {
            Some((first, _)) => first.to_string(),
            None => GENERAL_SLUG.to_string(),
        };

        buckets.entry(slug).or_default().push(SidebarItem {
            path: path.clone(),
            title: title.clone(),
            is_current: false,
        });
    }

    let mut categories = Vec::new();

    if let Some(mut items) = buckets.remove(GENERAL_SLUG) {
        items.sort_by(|a, b| a.title.cmp(&b.title).then(a.path.cmp(&b.path)));
        categories.push(SidebarCategory {
            name: "General".to_string(),
            slug: GENERAL_SLUG.to_string(),
            items,
            is_expanded: false,
        });
    }

    // BTreeMap iteration keeps the remaining buckets alphabetical
    for (slug, mut items) in buckets {
        items.sort_by(|a, b| a.title.cmp(&b.title).then(a.path.cmp(&b.path)));
        categories.push(SidebarCategory {
            name: humanize_slug(&slug),
            slug,
            items,
            is_expanded: false,
        });
    }

    categories
}

/// Per-request overlay: one linear pass, no tree rebuild.
pub fn apply_current(categories: &mut [SidebarCategory], current_path: Option<&str>) {
    let current_category = current_path.map(|path| match path.split_once('/') {
        Some((first, _)) => first,
        None => GENERAL_SLUG,
    });

    for category in categories.iter_mut() {
        category.is_expanded = current_category == Some(category.slug.as_str());
        for item in &mut category.items {
            item.is_current = current_path == Some(item.path.as_str());
        }
    }
}
