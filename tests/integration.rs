//! End-to-end scenarios against a temp repository, a scripted git
//! runner, and the real worker pool.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use gitwiki::config::{
    CacheConfig, Config, DbConfig, NotificationsConfig, RepoConfig, WidgetsConfig, WorkerConfig,
};
use gitwiki::frontmatter::{MetaValue, Metadata};
use gitwiki::git::{GitOutput, GitRunner};
use gitwiki::ops;
use gitwiki::services::Services;
use gitwiki::sidebar::{SIDEBAR_STRUCTURE_KEY, SIDEBAR_TITLES_KEY};
use gitwiki::tasks::{dispatch, JobKind, TaskStatus};

const WAIT: Duration = Duration::from_secs(30);

/// Scripted git: always succeeds, reports a dirty tree so commits
/// "happen", and optionally claims a remote so pull paths run.
struct FakeGit {
    has_remote: bool,
}

impl GitRunner for FakeGit {
    fn run(&self, args: &[&str], _cwd: &Path) -> std::io::Result<GitOutput> {
        let stdout = match args[0] {
            "status" => " M pages/x.md\n".to_string(),
            "remote" if self.has_remote => "origin\n".to_string(),
            _ => String::new(),
        };
        Ok(GitOutput {
            status: 0,
            stdout,
            stderr: String::new(),
        })
    }
}

fn test_config(root: &Path, webhook_url: &str) -> Config {
    Config {
        repo: RepoConfig {
            path: root.join("repo"),
            branch: String::new(),
            remote_url: String::new(),
            site_url: "https://wiki.example.com".to_string(),
        },
        db: DbConfig {
            path: root.join("data/wiki.sqlite"),
        },
        cache: CacheConfig::default(),
        widgets: WidgetsConfig::default(),
        notifications: NotificationsConfig {
            webhook_url: webhook_url.to_string(),
            timeout_secs: 1,
        },
        worker: WorkerConfig::default(),
    }
}

async fn start(webhook_url: &str, has_remote: bool) -> (TempDir, Arc<Services>) {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), webhook_url);
    let services = Services::start_with_runner(config, Box::new(FakeGit { has_remote }))
        .await
        .unwrap();
    (dir, services)
}

fn meta(pairs: &[(&str, &str)]) -> Metadata {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), MetaValue::parse(v)))
        .collect()
}

async fn settle(services: &Services, outcome: &ops::SaveOutcome) {
    if let Some(task) = &outcome.sync_task {
        services.wait_for_task(&task.id, WAIT).await.unwrap();
    }
    if let Some(task) = &outcome.notify_task {
        services.wait_for_task(&task.id, WAIT).await.unwrap();
    }
}

#[tokio::test]
async fn scenario_new_page_is_readable_searchable_and_in_sidebar() {
    let (_dir, services) = start("", false).await;

    let outcome = ops::save_page(&services, "hello-page", "Hello", Metadata::new())
        .await
        .unwrap();
    assert!(outcome.content_changed);
    settle(&services, &outcome).await;

    // readable
    let page = services.store.get("hello-page").unwrap().unwrap();
    assert_eq!(page.content, "Hello");
    assert_eq!(page.title(), "Hello Page");

    // searchable
    let results = services.search.search("Hello", 50).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].path, "hello-page");

    // in the sidebar, under General
    let categories = services.sidebar.categories(&services.store, None).await;
    let general = categories.iter().find(|c| c.name == "General").unwrap();
    assert!(general.items.iter().any(|i| i.path == "hello-page"));

    // the deferred commit task finished successfully
    let sync = services
        .ledger
        .get(&outcome.sync_task.unwrap().id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sync.status, TaskStatus::Success);
}

#[tokio::test]
async fn scenario_title_stable_edit_keeps_caches_warm() {
    let (_dir, services) = start("", false).await;

    let outcome = ops::save_page(&services, "page", "v1", meta(&[("title", "Old")]))
        .await
        .unwrap();
    settle(&services, &outcome).await;

    // Warm both tiers, then make a title-stable edit.
    services.sidebar.categories(&services.store, None).await;
    assert!(services.cache.get_raw(SIDEBAR_TITLES_KEY).await.is_some());

    let outcome = ops::save_page(&services, "page", "v2", meta(&[("title", "Old")]))
        .await
        .unwrap();
    assert!(outcome.content_changed);
    settle(&services, &outcome).await;

    // No invalidation: both tiers still warm.
    assert!(services.cache.get_raw(SIDEBAR_TITLES_KEY).await.is_some());
    assert!(services.cache.get_raw(SIDEBAR_STRUCTURE_KEY).await.is_some());

    // A title change does invalidate.
    let outcome = ops::save_page(&services, "page", "v2", meta(&[("title", "New")]))
        .await
        .unwrap();
    assert!(outcome.content_changed);
    settle(&services, &outcome).await;

    assert!(services.cache.get_raw(SIDEBAR_TITLES_KEY).await.is_none());
    assert!(services.cache.get_raw(SIDEBAR_STRUCTURE_KEY).await.is_none());

    // And the rebuilt tree shows the new title.
    let categories = services.sidebar.categories(&services.store, None).await;
    let general = categories.iter().find(|c| c.name == "General").unwrap();
    assert!(general.items.iter().any(|i| i.title == "New"));
}

#[tokio::test]
async fn scenario_reindex_tracks_progress_and_restores_search() {
    let (_dir, services) = start("", false).await;

    for path in ["a", "b", "c"] {
        let outcome = ops::save_page(
            &services,
            path,
            &format!("shared marker content for {}", path),
            Metadata::new(),
        )
        .await
        .unwrap();
        settle(&services, &outcome).await;
    }

    // Wipe the index so only the rebuild can restore it.
    services.search.rebuild(&[]).await.unwrap();
    assert!(services.search.search("marker", 50).await.unwrap().is_empty());

    let task = dispatch(
        &services.ledger,
        &services.jobs,
        JobKind::RebuildSearchIndex,
        "test reindex",
    )
    .await
    .unwrap();
    let snapshot = services.wait_for_task(&task.id, WAIT).await.unwrap();

    assert_eq!(snapshot.status, "success");
    assert_eq!(snapshot.total_items, Some(3));
    assert_eq!(snapshot.completed_items, 3);
    assert_eq!(snapshot.progress_percent, Some(100.0));

    let results = services.search.search("marker", 50).await.unwrap();
    assert_eq!(results.len(), 3);
}

#[tokio::test]
async fn scenario_notification_failure_never_fails_the_save() {
    // Nothing listens on this port; delivery fails fast.
    let (_dir, services) = start("http://127.0.0.1:9/webhook", false).await;

    let outcome = ops::save_page(&services, "watched", "content", Metadata::new())
        .await
        .unwrap();
    assert!(outcome.content_changed);

    let notify_task = outcome.notify_task.as_ref().expect("webhook configured");
    let snapshot = services.wait_for_task(&notify_task.id, WAIT).await.unwrap();

    assert_eq!(snapshot.status, "completed_with_errors");
    assert!(snapshot.logs.contains("Notification delivery failed"));

    // The page itself saved fine and the sync task is unaffected.
    assert!(services.store.get("watched").unwrap().is_some());
    let sync = services
        .wait_for_task(&outcome.sync_task.unwrap().id, WAIT)
        .await
        .unwrap();
    assert_eq!(sync.status, "success");
}

#[tokio::test]
async fn pull_without_remote_completes_with_note() {
    let (_dir, services) = start("", false).await;

    let task = dispatch(
        &services.ledger,
        &services.jobs,
        JobKind::SyncFromRemote,
        "test pull",
    )
    .await
    .unwrap();
    let snapshot = services.wait_for_task(&task.id, WAIT).await.unwrap();

    assert_eq!(snapshot.status, "success");
    assert!(snapshot.logs.contains("No remote configured"));
}

#[tokio::test]
async fn pull_with_remote_reindexes_and_rewarms() {
    let (_dir, services) = start("", true).await;

    // Seed a page directly on disk, as a remote pull would.
    let pages_dir = services.config.repo.path.join("pages");
    std::fs::write(pages_dir.join("pulled.md"), "fresh remote content").unwrap();

    let task = dispatch(
        &services.ledger,
        &services.jobs,
        JobKind::SyncFromRemote,
        "test pull",
    )
    .await
    .unwrap();
    let snapshot = services.wait_for_task(&task.id, WAIT).await.unwrap();
    assert_eq!(snapshot.status, "success");
    assert!(snapshot.logs.contains("Dispatched search reindex task"));

    // Wait for the chained tasks (reindex + warm) to settle.
    for task in services.ledger.list(10).await.unwrap() {
        services.wait_for_task(&task.id, WAIT).await.unwrap();
    }

    let results = services.search.search("fresh", 50).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].path, "pulled");

    // Caches were re-warmed by the warm task.
    assert!(services.cache.get_raw(SIDEBAR_STRUCTURE_KEY).await.is_some());
}

#[tokio::test]
async fn delete_removes_page_from_index_and_sidebar() {
    let (_dir, services) = start("", false).await;

    let outcome = ops::save_page(&services, "doomed", "shortlived text", Metadata::new())
        .await
        .unwrap();
    settle(&services, &outcome).await;

    let outcome = ops::delete_page(&services, "doomed").await.unwrap();
    assert!(outcome.applied);
    services
        .wait_for_task(&outcome.sync_task.unwrap().id, WAIT)
        .await
        .unwrap();

    assert!(services.store.get("doomed").unwrap().is_none());
    assert!(services.search.search("shortlived", 50).await.unwrap().is_empty());

    let categories = services.sidebar.categories(&services.store, None).await;
    assert!(!categories
        .iter()
        .flat_map(|c| c.items.iter())
        .any(|i| i.path == "doomed"));
}

#[tokio::test]
async fn archiving_hides_page_from_sidebar_but_keeps_it_searchable() {
    let (_dir, services) = start("", false).await;

    let outcome = ops::save_page(&services, "old-notes", "ancient wisdom", Metadata::new())
        .await
        .unwrap();
    settle(&services, &outcome).await;

    let outcome = ops::move_page(&services, "old-notes", "archive/old-notes", true)
        .await
        .unwrap();
    assert!(outcome.applied);
    services
        .wait_for_task(&outcome.sync_task.unwrap().id, WAIT)
        .await
        .unwrap();

    let categories = services.sidebar.categories(&services.store, None).await;
    assert!(!categories
        .iter()
        .flat_map(|c| c.items.iter())
        .any(|i| i.path.contains("old-notes")));

    let results = services.search.search("ancient", 50).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].path, "archive/old-notes");
}

#[tokio::test]
async fn cancelling_a_finished_task_is_rejected() {
    let (_dir, services) = start("", false).await;

    let task = dispatch(&services.ledger, &services.jobs, JobKind::WarmCaches, "warm")
        .await
        .unwrap();
    services.wait_for_task(&task.id, WAIT).await.unwrap();

    let err = ops::cancel_task(&services, &task.id).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<gitwiki::error::WikiError>(),
        Some(gitwiki::error::WikiError::TerminalTask(_))
    ));
}

#[tokio::test]
async fn noop_save_dispatches_nothing() {
    let (_dir, services) = start("", false).await;

    let outcome = ops::save_page(&services, "stable", "same", meta(&[("title", "T")]))
        .await
        .unwrap();
    settle(&services, &outcome).await;

    let before = services.ledger.list(50).await.unwrap().len();
    let outcome = ops::save_page(&services, "stable", "same", meta(&[("title", "T")]))
        .await
        .unwrap();

    assert!(!outcome.content_changed);
    assert!(outcome.sync_task.is_none());
    assert!(outcome.notify_task.is_none());
    assert_eq!(services.ledger.list(50).await.unwrap().len(), before);
}
