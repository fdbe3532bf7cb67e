//! # gitwiki CLI (`gwiki`)
//!
//! The `gwiki` binary drives the wiki content core: page CRUD against
//! the git-backed store, full-text search, index rebuilds, remote sync,
//! and task inspection.
//!
//! ## Usage
//!
//! ```bash
//! gwiki --config ./config/gwiki.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `gwiki init` | Create the working copy and database, warm the caches |
//! | `gwiki save <path>` | Save a page from a file or stdin |
//! | `gwiki show <path>` | Print a page's metadata and content |
//! | `gwiki rm <path>` | Delete a page |
//! | `gwiki mv <old> <new>` | Move or archive a page |
//! | `gwiki ls` | List page paths |
//! | `gwiki search "<query>"` | Search page content |
//! | `gwiki reindex` | Rebuild the full-text index |
//! | `gwiki push` | Commit and push local changes |
//! | `gwiki pull` | Pull from the remote and rebuild derived state |
//! | `gwiki log` | Show recent page changes from git history |
//! | `gwiki warm` | Warm the sidebar and widget caches |
//! | `gwiki tasks list\|show\|cancel` | Inspect and cancel background tasks |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use gitwiki::config::load_config;
use gitwiki::frontmatter::{MetaValue, Metadata};
use gitwiki::ops;
use gitwiki::services::Services;
use gitwiki::tasks::{dispatch, JobKind, TaskSnapshot};

/// How long interactive commands wait for their background tasks.
const TASK_WAIT: Duration = Duration::from_secs(300);

/// gitwiki CLI — a git-backed wiki content core.
///
/// All commands accept a `--config` flag pointing to a TOML
/// configuration file describing the repository, database, cache, and
/// notification settings.
#[derive(Parser)]
#[command(
    name = "gwiki",
    about = "gitwiki — a git-backed wiki with full-text search and tracked background sync",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/gwiki.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the working copy and database.
    ///
    /// Clones the configured remote (or creates an empty local
    /// repository), runs schema migrations, and warms the derived
    /// caches. Idempotent.
    Init,

    /// Save a page.
    ///
    /// Reads content from `--file` or stdin. Metadata fields are passed
    /// as repeated `--meta key=value` flags; values are coerced to the
    /// same types the page header supports.
    Save {
        /// Page path, e.g. `docs/deployment`.
        path: String,
        /// Read content from this file instead of stdin.
        #[arg(long)]
        file: Option<PathBuf>,
        /// Metadata field, repeatable: `--meta title="Deploy Guide"`.
        #[arg(long = "meta", value_name = "KEY=VALUE")]
        meta: Vec<String>,
    },

    /// Print a page's metadata and content.
    Show { path: String },

    /// Delete a page.
    Rm { path: String },

    /// Move a page to a new path.
    ///
    /// Moving under `archive/` archives the page (it disappears from
    /// the sidebar). Attachments move with the page unless
    /// `--leave-attachments` is given.
    Mv {
        old_path: String,
        new_path: String,
        #[arg(long)]
        leave_attachments: bool,
    },

    /// List page paths, alphabetical.
    Ls {
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// Search page content.
    Search {
        query: String,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },

    /// Rebuild the full-text search index from all pages.
    Reindex,

    /// Commit and push local changes to the remote.
    Push {
        /// Commit message.
        #[arg(long, default_value = "Update wiki content")]
        message: String,
    },

    /// Pull from the remote, then reindex and re-warm caches.
    Pull,

    /// Show recent page changes from git history.
    Log {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Warm the sidebar and widget caches.
    Warm,

    /// Inspect background tasks.
    Tasks {
        #[command(subcommand)]
        command: TaskCommands,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// List recent tasks.
    List {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show one task's full status and audit trail.
    Show { id: String },
    /// Cancel a queued or running task.
    Cancel { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let services = Services::start(config).await?;

    match cli.command {
        Commands::Init => {
            let task = dispatch(&services.ledger, &services.jobs, JobKind::WarmCaches, "Startup cache warm")
                .await?;
            let snapshot = services.wait_for_task(&task.id, TASK_WAIT).await?;
            println!("initialized ({})", snapshot.status);
        }

        Commands::Save { path, file, meta } => {
            let content = match file {
                Some(file) => std::fs::read_to_string(file)?,
                None => {
                    let mut buffer = String::new();
                    std::io::stdin().read_to_string(&mut buffer)?;
                    buffer
                }
            };
            let metadata = parse_meta_flags(&meta)?;

            let outcome = ops::save_page(&services, &path, &content, metadata).await?;
            if outcome.content_changed {
                println!("saved {}", outcome.page.path);
                wait_and_report(&services, outcome.sync_task.as_ref().map(|t| t.id.as_str())).await;
                wait_and_report(&services, outcome.notify_task.as_ref().map(|t| t.id.as_str()))
                    .await;
            } else {
                println!("no changes for {}", outcome.page.path);
            }
        }

        Commands::Show { path } => match services.store.get(&path)? {
            Some(page) => {
                println!("path: {}", page.path);
                println!("title: {}", page.title());
                for (key, value) in page.display_metadata() {
                    println!("{}: {}", key, value);
                }
                println!();
                println!("{}", page.content);
            }
            None => {
                println!("not found: {}", path);
                std::process::exit(1);
            }
        },

        Commands::Rm { path } => {
            let outcome = ops::delete_page(&services, &path).await?;
            if outcome.applied {
                println!("deleted {}", path);
                wait_and_report(&services, outcome.sync_task.as_ref().map(|t| t.id.as_str())).await;
                wait_and_report(&services, outcome.notify_task.as_ref().map(|t| t.id.as_str()))
                    .await;
            } else {
                println!("not found: {}", path);
                std::process::exit(1);
            }
        }

        Commands::Mv {
            old_path,
            new_path,
            leave_attachments,
        } => {
            let outcome =
                ops::move_page(&services, &old_path, &new_path, !leave_attachments).await?;
            if outcome.applied {
                println!("moved {} -> {}", old_path, new_path);
                wait_and_report(&services, outcome.sync_task.as_ref().map(|t| t.id.as_str())).await;
                wait_and_report(&services, outcome.notify_task.as_ref().map(|t| t.id.as_str()))
                    .await;
            } else {
                println!("not found: {}", old_path);
                std::process::exit(1);
            }
        }

        Commands::Ls { limit, offset } => {
            for path in services.store.list_pages(limit, offset) {
                println!("{}", path);
            }
        }

        Commands::Search { query, limit } => {
            let results = services.search.search(&query, limit).await?;
            if results.is_empty() {
                println!("No results.");
            }
            for (i, result) in results.iter().enumerate() {
                println!("{}. [{:.2}] {}", i + 1, result.score, result.path);
                println!("    {}", result.snippet.replace('\n', " "));
            }
        }

        Commands::Reindex => {
            let task = dispatch(
                &services.ledger,
                &services.jobs,
                JobKind::RebuildSearchIndex,
                "Manual reindex",
            )
            .await?;
            let snapshot = services.wait_for_task(&task.id, TASK_WAIT).await?;
            print_task(&snapshot);
        }

        Commands::Push { message } => {
            let task = dispatch(
                &services.ledger,
                &services.jobs,
                JobKind::SyncToRemote { message },
                "Manual sync to remote",
            )
            .await?;
            let snapshot = services.wait_for_task(&task.id, TASK_WAIT).await?;
            print_task(&snapshot);
        }

        Commands::Pull => {
            let task = dispatch(
                &services.ledger,
                &services.jobs,
                JobKind::SyncFromRemote,
                "Manual sync from remote",
            )
            .await?;
            let snapshot = services.wait_for_task(&task.id, TASK_WAIT).await?;
            print_task(&snapshot);

            // The pull dispatches its own reindex; let it finish before
            // the process exits.
            for task in services.ledger.list(10).await? {
                if !task.status.is_terminal() {
                    let _ = services.wait_for_task(&task.id, TASK_WAIT).await;
                }
            }
        }

        Commands::Log { limit } => {
            for change in services.store.recent_changes(limit) {
                println!("{}  {}  {}", &change.sha[..change.sha.len().min(8)], change.date, change.message);
                for file in &change.files {
                    println!("    {}", file);
                }
            }
        }

        Commands::Warm => {
            let task = dispatch(&services.ledger, &services.jobs, JobKind::WarmCaches, "Manual cache warm")
                .await?;
            let snapshot = services.wait_for_task(&task.id, TASK_WAIT).await?;
            print_task(&snapshot);
        }

        Commands::Tasks { command } => match command {
            TaskCommands::List { limit } => {
                println!("{:<14} {:<20} {:<24} {}", "ID", "NAME", "STATUS", "TYPE");
                for task in services.ledger.list(limit).await? {
                    println!(
                        "{:<14} {:<20} {:<24} {}",
                        task.id,
                        task.name,
                        task.status.label(),
                        task.task_type
                    );
                }
            }
            TaskCommands::Show { id } => match services.ledger.snapshot(&id).await? {
                Some(snapshot) => {
                    print_task(&snapshot);
                    println!();
                    println!("audit trail:");
                    for entry in services.ledger.audit_view(&id).await? {
                        println!("  {}  {}", entry.created_at.format("%Y-%m-%d %H:%M:%S"), entry.event_label);
                    }
                    if !snapshot.logs.is_empty() {
                        println!();
                        println!("logs:{}", snapshot.logs);
                    }
                }
                None => {
                    println!("not found: {}", id);
                    std::process::exit(1);
                }
            },
            TaskCommands::Cancel { id } => {
                let task = ops::cancel_task(&services, &id).await?;
                println!("cancelled {} ({})", task.id, task.name);
            }
        },
    }

    Ok(())
}

fn parse_meta_flags(flags: &[String]) -> Result<Metadata> {
    let mut metadata = Metadata::new();
    for flag in flags {
        let (key, value) = flag
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("--meta expects KEY=VALUE, got: {}", flag))?;
        metadata.insert(key.trim(), MetaValue::parse(value));
    }
    Ok(metadata)
}

async fn wait_and_report(services: &Services, task_id: Option<&str>) {
    let Some(task_id) = task_id else { return };
    match services.wait_for_task(task_id, TASK_WAIT).await {
        Ok(snapshot) => println!("task {} ({}): {}", snapshot.id, snapshot.name, snapshot.status_label),
        Err(e) => eprintln!("task {}: {:#}", task_id, e),
    }
}

fn print_task(snapshot: &TaskSnapshot) {
    println!("task {} ({})", snapshot.id, snapshot.name);
    println!("  status: {}", snapshot.status_label);
    if let Some(percent) = snapshot.progress_percent {
        println!(
            "  progress: {}/{} ({:.0}%)",
            snapshot.completed_items,
            snapshot.total_items.unwrap_or(0),
            percent
        );
    }
    if let Some(duration) = snapshot.duration_seconds {
        println!("  duration: {:.2}s", duration);
    }
}
