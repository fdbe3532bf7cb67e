use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Task ledger
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'queued',
            logs TEXT NOT NULL DEFAULT '',
            job_id TEXT,
            task_type TEXT NOT NULL,
            task_args TEXT NOT NULL DEFAULT '{}',
            total_items INTEGER,
            completed_items INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Append-only audit trail; derived task timestamps come from here
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS task_audit (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL,
            event TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (task_id) REFERENCES tasks(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // TTL key-value cache backend
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kv_cache (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create FTS5 virtual table over page content
    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='pages_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE pages_fts USING fts5(
                path,
                content,
                tokenize='porter unicode61'
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_task_audit_task ON task_audit(task_id, created_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
