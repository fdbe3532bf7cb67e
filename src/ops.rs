//! Background Operation Set: the orchestrations that compose the store,
//! search index, caches, and task ledger.
//!
//! Request-path helpers (`save_page`, `delete_page`, `move_page`) do the
//! fast local work inline (file write, index update, conditional cache
//! invalidation, in that order) and defer the slow git/network steps to
//! dispatched tasks. Worker jobs call `start()` first and exactly one
//! terminal `complete(...)` on every exit path; failure of a
//! non-essential step (notification delivery, cache warm) downgrades to
//! `completed_with_errors`, and only failure of the primary effect
//! produces `failed`.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;

use crate::error::WikiError;
use crate::frontmatter::Metadata;
use crate::notify;
use crate::services::Services;
use crate::sidebar::ARCHIVE_PREFIX;
use crate::store::Page;
use crate::tasks::{dispatch, Job, JobKind, Task};

/// Progress log cadence for long reindex runs.
const REINDEX_LOG_EVERY: i64 = 10;

#[derive(Debug)]
pub struct SaveOutcome {
    pub page: Page,
    pub content_changed: bool,
    pub sync_task: Option<Task>,
    pub notify_task: Option<Task>,
}

#[derive(Debug)]
pub struct MutationOutcome {
    pub applied: bool,
    pub sync_task: Option<Task>,
    pub notify_task: Option<Task>,
}

/// Save a page and kick off the sync pipeline.
///
/// Ordering is deliberate: index update happens before cache
/// invalidation happens before the git dispatch, so a reader hitting a
/// warm cache never sees navigation for a page the index does not know
/// about yet. The commit/push task is dispatched only when the store
/// reported a genuine change.
pub async fn save_page(
    services: &Services,
    path: &str,
    content: &str,
    metadata: Metadata,
) -> Result<SaveOutcome> {
    let existing = services.store.get(path)?;
    let is_new = existing.is_none();
    let old_title = existing.map(|page| page.title());

    let (page, content_changed) = services.store.save(path, content, metadata)?;

    if !content_changed {
        return Ok(SaveOutcome {
            page,
            content_changed,
            sync_task: None,
            notify_task: None,
        });
    }

    services.search.add(&page.path, &page.content).await?;

    // A title-stable edit cannot change the navigation tree; skip the
    // invalidation so warm caches survive routine edits.
    let title_changed = old_title.as_deref() != Some(page.title().as_str());
    if is_new || title_changed {
        invalidate_all(services).await;
    }

    let sync_task = dispatch(
        &services.ledger,
        &services.jobs,
        JobKind::SyncToRemote {
            message: format!("Update {}", page.path),
        },
        &format!("Page save triggered sync: {}", page.path),
    )
    .await?;

    let operation = if is_new { "created" } else { "updated" };
    let notify_task = dispatch_notification(services, operation, &page.path, &page.title()).await?;

    Ok(SaveOutcome {
        page,
        content_changed,
        sync_task: Some(sync_task),
        notify_task,
    })
}

/// Delete a page: file removal, index removal, cache invalidation, then
/// the deferred git/notification tasks.
pub async fn delete_page(services: &Services, path: &str) -> Result<MutationOutcome> {
    let title = services
        .store
        .get(path)?
        .map(|page| page.title())
        .unwrap_or_else(|| path.to_string());

    if !services.store.delete(path)? {
        return Ok(MutationOutcome {
            applied: false,
            sync_task: None,
            notify_task: None,
        });
    }

    services.search.remove(path).await?;
    invalidate_all(services).await;

    let sync_task = dispatch(
        &services.ledger,
        &services.jobs,
        JobKind::SyncToRemote {
            message: format!("Delete {}", path),
        },
        &format!("Page delete triggered sync: {}", path),
    )
    .await?;

    let notify_task = dispatch_notification(services, "deleted", path, &title).await?;

    Ok(MutationOutcome {
        applied: true,
        sync_task: Some(sync_task),
        notify_task,
    })
}

/// Move (or archive) a page, re-keying its search entry.
pub async fn move_page(
    services: &Services,
    old_path: &str,
    new_path: &str,
    move_attachments: bool,
) -> Result<MutationOutcome> {
    if !services.store.move_page(old_path, new_path, move_attachments)? {
        return Ok(MutationOutcome {
            applied: false,
            sync_task: None,
            notify_task: None,
        });
    }

    services.search.remove(old_path).await?;
    let moved = services.store.get(new_path)?;
    if let Some(page) = &moved {
        services.search.add(&page.path, &page.content).await?;
    }
    invalidate_all(services).await;

    let sync_task = dispatch(
        &services.ledger,
        &services.jobs,
        JobKind::SyncToRemote {
            message: format!("Move {} to {}", old_path, new_path),
        },
        &format!("Page move triggered sync: {} -> {}", old_path, new_path),
    )
    .await?;

    let operation = if new_path.starts_with(ARCHIVE_PREFIX) {
        "archived"
    } else {
        "moved"
    };
    let title = moved
        .map(|page| page.title())
        .unwrap_or_else(|| new_path.to_string());
    let notify_task = dispatch_notification(services, operation, new_path, &title).await?;

    Ok(MutationOutcome {
        applied: true,
        sync_task: Some(sync_task),
        notify_task,
    })
}

async fn dispatch_notification(
    services: &Services,
    operation: &str,
    page_path: &str,
    title: &str,
) -> Result<Option<Task>> {
    if !services.config.notifications.is_enabled() {
        return Ok(None);
    }

    let task = dispatch(
        &services.ledger,
        &services.jobs,
        JobKind::SendNotification {
            operation: operation.to_string(),
            page_path: page_path.to_string(),
            title: title.to_string(),
        },
        &format!("Notify {}: {}", operation, page_path),
    )
    .await?;
    Ok(Some(task))
}

/// Cancel a task and send the best-effort termination signal to its job.
pub async fn cancel_task(services: &Services, task_id: &str) -> Result<Task> {
    let task = services.ledger.cancel(task_id).await?;
    if let Some(job_id) = &task.job_id {
        let aborted = services.jobs.abort(job_id);
        tracing::info!(task = %task.id, job = %job_id, aborted, "task cancelled");
    }
    Ok(task)
}

/// Clear every derived cache: both sidebar tiers and both widget keys.
pub async fn invalidate_all(services: &Services) {
    services.sidebar.invalidate().await;
    services.widgets.invalidate().await;
}

// ---- worker loop ----

pub fn spawn_workers(services: Arc<Services>, rx: UnboundedReceiver<Job>, count: usize) {
    let rx = Arc::new(Mutex::new(rx));
    for worker in 0..count.max(1) {
        let services = services.clone();
        let rx = rx.clone();
        tokio::spawn(async move {
            tracing::debug!(worker, "worker started");
            run_worker(services, rx).await;
            tracing::debug!(worker, "worker stopped");
        });
    }
}

async fn run_worker(services: Arc<Services>, rx: Arc<Mutex<UnboundedReceiver<Job>>>) {
    loop {
        let job = { rx.lock().await.recv().await };
        let Some(job) = job else { break };

        // The dispatcher enqueues only after the creating transaction
        // commits; a brief retry covers backends without that guarantee.
        if !wait_for_task_row(&services, &job.task_id).await {
            tracing::error!(task = %job.task_id, "job references a task that never appeared");
            continue;
        }

        let handle = tokio::spawn(execute_job(services.clone(), job.clone()));
        services.jobs.register(&job.job_id, handle.abort_handle());
        let joined = handle.await;
        services.jobs.unregister(&job.job_id);

        if let Err(e) = joined {
            if e.is_cancelled() {
                tracing::debug!(task = %job.task_id, "job aborted after cancellation");
            } else {
                tracing::error!(task = %job.task_id, error = %e, "job panicked");
                let _ = services
                    .ledger
                    .complete(&job.task_id, false, false, "\n\nJob terminated unexpectedly")
                    .await;
            }
        }
    }
}

async fn wait_for_task_row(services: &Services, task_id: &str) -> bool {
    for _ in 0..10 {
        match services.ledger.get(task_id).await {
            Ok(Some(_)) => return true,
            Ok(None) => tokio::time::sleep(Duration::from_millis(25)).await,
            Err(e) => {
                tracing::warn!(task = %task_id, error = %e, "task lookup failed, retrying");
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        }
    }
    false
}

fn is_terminal_rejection(e: &anyhow::Error) -> bool {
    matches!(e.downcast_ref::<WikiError>(), Some(WikiError::TerminalTask(_)))
}

async fn execute_job(services: Arc<Services>, job: Job) {
    match services.ledger.start(&job.task_id).await {
        Ok(()) => {}
        Err(e) if is_terminal_rejection(&e) => {
            // Cancelled while still queued; nothing to run.
            tracing::debug!(task = %job.task_id, "skipping job for terminal task");
            return;
        }
        Err(e) => {
            tracing::error!(task = %job.task_id, error = %e, "failed to start task");
            return;
        }
    }

    let result = match job.kind.clone() {
        JobKind::SyncToRemote { message } => run_sync_to_remote(&services, &job.task_id, &message).await,
        JobKind::SyncFromRemote => run_sync_from_remote(&services, &job.task_id).await,
        JobKind::RebuildSearchIndex => run_rebuild_index(&services, &job.task_id).await,
        JobKind::WarmCaches => run_warm_caches(&services, &job.task_id).await,
        JobKind::SendNotification {
            operation,
            page_path,
            title,
        } => run_send_notification(&services, &job.task_id, &operation, &page_path, &title).await,
    };

    if let Err(e) = result {
        tracing::error!(task = %job.task_id, error = %format!("{:#}", e), "task failed");
        let outcome = services
            .ledger
            .complete(&job.task_id, false, false, &format!("\n\nError: {:#}", e))
            .await;
        if let Err(complete_err) = outcome {
            if !is_terminal_rejection(&complete_err) {
                tracing::error!(task = %job.task_id, error = %complete_err, "failed to record task failure");
            }
        }
    }
}

/// Commit and push local changes. "Nothing to commit" is a success.
async fn run_sync_to_remote(services: &Services, task_id: &str, message: &str) -> Result<()> {
    match services.store.commit_and_push(message) {
        Ok(true) => {
            services
                .ledger
                .complete(task_id, true, false, "\n\nCommitted and pushed changes")
                .await
        }
        Ok(false) => {
            services
                .ledger
                .complete(task_id, true, false, "\n\nNothing to commit")
                .await
        }
        Err(e) => {
            // Content is already on disk; only the sync failed.
            services
                .ledger
                .complete(task_id, false, false, &format!("\n\n{}", e))
                .await
        }
    }
}

/// Pull from the remote and rebuild everything derived from page
/// content: a fresh reindex task, cache invalidation, cache re-warm.
async fn run_sync_from_remote(services: &Services, task_id: &str) -> Result<()> {
    match services.store.pull() {
        Ok(false) => {
            services
                .ledger
                .complete(task_id, true, false, "\n\nNo remote configured; nothing to pull")
                .await
        }
        Ok(true) => {
            let mut has_errors = false;
            let mut logs = String::from("\n\nPulled latest changes");

            match dispatch(
                &services.ledger,
                &services.jobs,
                JobKind::RebuildSearchIndex,
                "Reindex after remote sync",
            )
            .await
            {
                Ok(task) => logs.push_str(&format!("\nDispatched search reindex task {}", task.id)),
                Err(e) => {
                    has_errors = true;
                    logs.push_str(&format!("\nFailed to dispatch reindex: {:#}", e));
                }
            }

            invalidate_all(services).await;

            match dispatch(
                &services.ledger,
                &services.jobs,
                JobKind::WarmCaches,
                "Warm caches after remote sync",
            )
            .await
            {
                Ok(task) => logs.push_str(&format!("\nDispatched cache warm task {}", task.id)),
                Err(e) => {
                    has_errors = true;
                    logs.push_str(&format!("\nFailed to dispatch cache warm: {:#}", e));
                }
            }

            services.ledger.complete(task_id, true, has_errors, &logs).await
        }
        Err(e) => {
            services
                .ledger
                .complete(task_id, false, false, &format!("\n\n{}", e))
                .await
        }
    }
}

/// Full reindex with visible progress: one counter bump per page, a log
/// line every few pages.
async fn run_rebuild_index(services: &Services, task_id: &str) -> Result<()> {
    let paths = services.store.list_pages(None, 0);
    let total = paths.len() as i64;
    services.ledger.set_progress(task_id, 0, Some(total)).await?;

    let mut pages = Vec::with_capacity(paths.len());
    let mut completed = 0i64;
    for path in paths {
        if let Some(page) = services.store.get(&path)? {
            pages.push((page.path, page.content));
        }
        completed += 1;
        services.ledger.set_progress(task_id, completed, None).await?;
        if completed % REINDEX_LOG_EVERY == 0 {
            services
                .ledger
                .append_logs(task_id, &format!("\nIndexed {}/{} pages", completed, total))
                .await?;
        }
    }

    let count = services.search.rebuild(&pages).await?;
    services
        .ledger
        .complete(
            task_id,
            true,
            false,
            &format!("\n\nRebuilt search index with {} pages", count),
        )
        .await
}

/// Populate every derived cache so the first request after startup does
/// not pay the build cost. Safe to run redundantly.
async fn run_warm_caches(services: &Services, task_id: &str) -> Result<()> {
    services.sidebar.categories(&services.store, None).await;
    let limit = services.widgets.default_limit();
    services.widgets.recently_updated(&services.store, limit).await;
    services.widgets.recently_stale(&services.store, limit).await;

    services
        .ledger
        .complete(task_id, true, false, "\n\nCaches warmed")
        .await
}

/// Deliver a page-operation notification. Delivery failure is never a
/// task failure: the page mutation already succeeded and the webhook is
/// best-effort.
async fn run_send_notification(
    services: &Services,
    task_id: &str,
    operation: &str,
    page_path: &str,
    title: &str,
) -> Result<()> {
    let Some(webhook_url) = services.config.notifications.webhook_url() else {
        return services
            .ledger
            .complete(task_id, true, false, "\n\nNotifications disabled; nothing to send")
            .await;
    };

    let mut has_errors = false;
    let mut logs = String::new();

    let page_url = if operation == "deleted" {
        None
    } else {
        match notify::page_url(&services.config.repo.site_url, page_path) {
            Ok(url) => Some(url),
            Err(e) => {
                has_errors = true;
                logs.push_str(&format!("\n\nCould not resolve page URL: {:#}", e));
                None
            }
        }
    };

    let card = notify::build_card(operation, title, page_url.as_deref());
    let timeout = Duration::from_secs(services.config.notifications.timeout_secs);

    match notify::send_webhook(&services.http, webhook_url, &card, timeout).await {
        Ok(()) => logs.push_str("\n\nNotification sent"),
        Err(e) => {
            has_errors = true;
            logs.push_str(&format!("\n\nNotification delivery failed: {:#}", e));
        }
    }

    services.ledger.complete(task_id, true, has_errors, &logs).await
}
