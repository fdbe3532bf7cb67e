//! Explicitly constructed service bundle.
//!
//! Everything the wiki core needs (store, search index, caches, task
//! ledger, job queue, HTTP client) is built once at process start and
//! passed around by reference. There is no global state; tests construct
//! a fresh bundle per case.

use anyhow::Result;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{build_cache, Cache};
use crate::config::Config;
use crate::db;
use crate::git::{GitRunner, SystemGit};
use crate::migrate;
use crate::ops;
use crate::search::SearchIndex;
use crate::sidebar::SidebarService;
use crate::store::ContentStore;
use crate::tasks::{JobQueue, TaskLedger, TaskSnapshot, TaskStatus};
use crate::widgets::WidgetService;

pub struct Services {
    pub config: Config,
    pub pool: SqlitePool,
    pub store: ContentStore,
    pub search: SearchIndex,
    pub cache: Arc<dyn Cache>,
    pub sidebar: SidebarService,
    pub widgets: WidgetService,
    pub ledger: TaskLedger,
    pub jobs: JobQueue,
    pub http: reqwest::Client,
}

impl Services {
    /// Build the full bundle against the real git binary and spawn the
    /// worker pool.
    pub async fn start(config: Config) -> Result<Arc<Services>> {
        Self::start_with_runner(config, Box::new(SystemGit)).await
    }

    /// Same as [`start`](Self::start) with an injected git runner, for
    /// tests that script git behavior.
    pub async fn start_with_runner(
        config: Config,
        runner: Box<dyn GitRunner>,
    ) -> Result<Arc<Services>> {
        let store = ContentStore::with_runner(
            config.repo.path.clone(),
            config.repo.branch.clone(),
            config.repo.remote_url.clone(),
            runner,
        );
        store.ensure_repo_exists()?;

        let pool = db::connect(&config.db.path).await?;
        migrate::run_migrations(&pool).await?;

        let cache = build_cache(&config, &pool);
        let sidebar = SidebarService::new(cache.clone());
        let widgets = WidgetService::new(cache.clone(), config.widgets.clone());
        let ledger = TaskLedger::new(pool.clone());
        let search = SearchIndex::new(pool.clone());
        let (jobs, rx) = JobQueue::new();

        let worker_count = config.worker.count;
        let services = Arc::new(Services {
            config,
            pool,
            store,
            search,
            cache,
            sidebar,
            widgets,
            ledger,
            jobs,
            http: reqwest::Client::new(),
        });

        ops::spawn_workers(services.clone(), rx, worker_count);
        Ok(services)
    }

    /// Poll the ledger until the task reaches a terminal state. This is
    /// the same read model a polling UI consumes.
    pub async fn wait_for_task(&self, task_id: &str, timeout: Duration) -> Result<TaskSnapshot> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let snapshot = self
                .ledger
                .snapshot(task_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("unknown task: {}", task_id))?;

            let terminal = TaskStatus::parse(&snapshot.status)
                .map(|status| status.is_terminal())
                .unwrap_or(false);
            if terminal {
                return Ok(snapshot);
            }

            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("timed out waiting for task {}", task_id);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
