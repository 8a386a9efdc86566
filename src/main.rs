//! CCA Memory CLI
//!
//! Hierarchical context memory for AI coding assistants.

use anyhow::Context;
use cca_memory::beads::{spawn_auto_learning, BeadsIntegration, BeadsIssue};
use cca_memory::config::discover_config_file;
use cca_memory::server::ToolServer;
use cca_memory::{Artifact, ArtifactType, HierarchicalMemory, MemoryConfig, ScopeType, TaskContext};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// CCA Memory - hierarchical context memory for coding assistants
#[derive(Parser, Debug)]
#[command(name = "cca-memory")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Repository root
    #[arg(short = 'C', long, default_value = ".")]
    repo: PathBuf,

    /// Config file (defaults to <repo>/.confucius.toml, then the user config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Comma-separated submodule names, overriding the config
    #[arg(long, value_delimiter = ',')]
    submodules: Option<Vec<String>>,

    /// Storage directory, overriding the config
    #[arg(long)]
    storage_path: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store an artifact
    Store {
        /// Artifact content
        content: String,
        #[arg(long, default_value = "repository")]
        scope: ScopeType,
        #[arg(long = "type", default_value = "pattern")]
        artifact_type: String,
        #[arg(long)]
        submodule: Option<String>,
        #[arg(long)]
        task: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        confidence: Option<f64>,
        /// Explicit artifact id (generated when omitted)
        #[arg(long)]
        id: Option<String>,
    },
    /// Retrieve compressed context across scopes
    Retrieve {
        query: String,
        /// Task scope to include, e.g. task:bd-123
        #[arg(long)]
        active_scope: Option<String>,
    },
    /// Search one scope, or durable storage when no scope is given
    Search {
        query: String,
        #[arg(long)]
        scope: Option<String>,
    },
    /// Create a task scope and inject relevant context
    Task {
        task_id: String,
        #[arg(long, default_value = "")]
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Read title, description and labels from `bd show`
        #[arg(long)]
        from_beads: bool,
    },
    /// Show memory statistics
    Stats,
    /// Empty every scope (lasting only with --purge)
    Clear {
        /// Also delete persisted artifacts
        #[arg(long)]
        purge: bool,
    },
    /// Query the Beads issue tracker
    Issues {
        /// Only issues with no blockers
        #[arg(long)]
        ready: bool,
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        label: Option<String>,
        /// Print counts by status instead of issues
        #[arg(long)]
        stats: bool,
    },
    /// Serve memory tools over stdio (JSON-RPC)
    Serve {
        /// Learn notes from closed issues while serving
        #[arg(long)]
        auto_learning: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Stdout is reserved for command output and protocol traffic
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let repo = std::fs::canonicalize(&cli.repo)
        .with_context(|| format!("Repository not found: {}", cli.repo.display()))?;
    let config = load_config(&cli, &repo).await?;

    match cli.command {
        Command::Issues {
            ready,
            search,
            label,
            stats,
        } => {
            let beads = BeadsIntegration::new(config.beads_database_path());
            run_issues(&beads, ready, search.as_deref(), label.as_deref(), stats).await
        }
        command => run_memory_command(command, config).await,
    }
}

async fn run_memory_command(command: Command, config: MemoryConfig) -> anyhow::Result<()> {
    let memory = Arc::new(HierarchicalMemory::new(config)?);
    let expired = memory.storage().purge_expired(Utc::now()).await?;
    if expired > 0 {
        info!("Removed {} expired artifacts", expired);
    }
    memory.initialize().await?;

    match command {
        Command::Store {
            content,
            scope,
            artifact_type,
            submodule,
            task,
            tags,
            confidence,
            id,
        } => {
            let artifact_type = ArtifactType::from(artifact_type);
            let id = id.unwrap_or_else(|| format!("{}-{}-{}", scope, artifact_type, Uuid::new_v4().simple()));
            let mut artifact = Artifact::new(id, artifact_type, content, scope).with_tags(tags);
            artifact.metadata.submodule = submodule;
            artifact.metadata.task_id = task;
            artifact.metadata.confidence = confidence;

            let id = artifact.id.clone();
            let scope_name = artifact.scope_name();
            memory.store(artifact).await?;
            println!("Stored {} in {}", id, scope_name);
        }
        Command::Retrieve { query, active_scope } => {
            let context = memory.retrieve(&query, active_scope.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&context)?);
        }
        Command::Search { query, scope } => {
            let artifacts = match scope {
                Some(scope) => memory.retrieve_from_scope(&scope, &query).await?,
                None => memory.storage().search(&query).await?,
            };
            println!("{}", serde_json::to_string_pretty(&artifacts)?);
        }
        Command::Task {
            task_id,
            title,
            description,
            from_beads,
        } => {
            let task_context = if from_beads {
                let beads = BeadsIntegration::new(memory.config().beads_database_path());
                task_context_from_issue(beads.get_issue(&task_id).await?)
            } else {
                TaskContext::new(title, description)
            };
            let injected = memory.create_task_scope(&task_id, task_context).await?;
            println!("Created task:{} ({} artifacts injected)", task_id, injected);
        }
        Command::Stats => {
            let stats = memory.stats().await;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            for name in memory.scope_names().await {
                if let Some(scope_stats) = memory.scope_stats(&name).await {
                    println!(
                        "  {:<32} {:>6} artifacts {:>8} tokens",
                        name, scope_stats.artifacts, scope_stats.tokens
                    );
                }
            }
        }
        Command::Clear { purge } => {
            if purge {
                memory.purge().await?;
                println!("Cleared all scopes and durable storage");
            } else {
                memory.clear().await;
                // Scopes are rebuilt from storage on every run
                println!("Cleared in-memory scopes for this run only. Persisted records remain and reload next time; use --purge to delete them");
            }
        }
        Command::Serve { auto_learning } => {
            let learner = (auto_learning || memory.config().beads.auto_learning).then(|| {
                let beads = BeadsIntegration::new(memory.config().beads_database_path());
                let interval = Duration::from_secs(memory.config().beads.poll_interval_secs.max(1));
                info!("Auto-learning from closed issues every {:?}", interval);
                spawn_auto_learning(memory.clone(), beads, interval)
            });

            info!("Repository: {:?}", memory.config().repository);
            info!("Submodules: {}", memory.config().submodules.join(", "));
            info!("Memory path: {:?}", memory.config().storage_path());

            let result = ToolServer::new(memory.clone()).run().await;
            if let Some(handle) = learner {
                handle.abort();
            }
            result?;
        }
        // Runs without opening memory
        Command::Issues { .. } => {}
    }

    Ok(())
}

/// Explicit `--config`, else a discovered file, else defaults; then env and flag overrides
async fn load_config(cli: &Cli, repo: &Path) -> anyhow::Result<MemoryConfig> {
    let path = cli.config.clone().or_else(|| discover_config_file(repo));
    let mut config = match path {
        Some(path) => MemoryConfig::load(&path)
            .await
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => MemoryConfig::default(),
    };

    if config.repository == Path::new(".") {
        config.repository = repo.to_path_buf();
    } else if config.repository.is_relative() {
        config.repository = repo.join(&config.repository);
    }
    let mut config = config.with_env_overrides()?;
    if let Some(submodules) = &cli.submodules {
        config = config.with_submodules(submodules.iter().map(|s| s.trim().to_string()));
    }
    if let Some(path) = &cli.storage_path {
        config = config.with_storage_path(path.clone());
    }
    Ok(config)
}

fn task_context_from_issue(issue: BeadsIssue) -> TaskContext {
    let mut context = TaskContext::new(issue.title, issue.description);
    context.labels = issue.labels;
    context
}

async fn run_issues(
    beads: &BeadsIntegration,
    ready: bool,
    search: Option<&str>,
    label: Option<&str>,
    stats: bool,
) -> anyhow::Result<()> {
    if !beads.is_available().await {
        warn!("bd not found in PATH");
    }

    if stats {
        println!("{}", serde_json::to_string_pretty(&beads.stats().await?)?);
        return Ok(());
    }

    let issues = match (search, label) {
        (Some(query), _) => beads.search_issues(query).await?,
        (None, Some(label)) => beads.issues_by_label(label).await?,
        (None, None) if ready => beads.ready_issues().await?,
        (None, None) => beads.list_issues().await?,
    };

    if issues.is_empty() {
        println!("No issues.");
    }
    for issue in &issues {
        println!("- [{}] {} ({:?})", issue.id, issue.title, issue.status);
    }
    Ok(())
}
