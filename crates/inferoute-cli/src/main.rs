//! Inferoute CLI - adaptive inference request router

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use inferoute_core::backend::{Backend, EchoBackend, OpenRouterBackend, OpenRouterClient};
use inferoute_core::config::Config;
use inferoute_core::routing::{
    FeedbackOutcome, InferenceRouter, RouteContext, RouterSnapshot, SnapshotStore,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Snapshots kept in the state database after each save
const KEEP_SNAPSHOTS: usize = 10;

#[derive(Parser)]
#[command(name = "inferoute")]
#[command(author, version, about = "Adaptive inference request router", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Router state database (defaults to the user data directory)
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, PartialEq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Route a prompt to the best backend
    Route {
        /// Prompt text
        prompt: String,
        /// How urgent the answer is (0.0 to 1.0)
        #[arg(long)]
        urgency: Option<f64>,
        /// How much answer quality matters (0.0 to 1.0)
        #[arg(long)]
        quality: Option<f64>,
        /// Willingness to spend (0.0 to 1.0)
        #[arg(long)]
        budget: Option<f64>,
        /// User identity for learned preferences
        #[arg(short, long)]
        user: Option<String>,
        /// Largest cached request that may answer this one, in tokens
        #[arg(long)]
        max_tokens: Option<usize>,
    },

    /// Rate a previous response from 1 to 5
    Feedback {
        /// Response ID printed by `route`
        response_id: String,
        /// Rating from 1 (worst) to 5 (best)
        rating: f64,
        /// Optional comment
        #[arg(short, long)]
        comment: Option<String>,
        /// User giving the rating
        #[arg(short, long)]
        user: Option<String>,
    },

    /// List registered backends with their statistics
    Backends,

    /// Show routing, cache and feedback statistics
    Stats,

    /// Export router state as JSON
    Export {
        /// Output file
        file: PathBuf,
    },

    /// Import router state from JSON
    Import {
        /// Input file
        file: PathBuf,
    },

    /// Manage saved state snapshots
    Snapshots {
        #[command(subcommand)]
        action: SnapshotAction,
    },

    /// Configuration management; a `[[backends]]` table overrides the saved registry
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum SnapshotAction {
    /// List saved snapshots
    List,
    /// Keep only the newest snapshots
    Prune {
        #[arg(long, default_value_t = KEEP_SNAPSHOTS)]
        keep: usize,
    },
    /// Delete all saved snapshots
    Clear {
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// List all config values
    List,
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("inferoute=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let state = cli.state.as_deref();

    match cli.command {
        Commands::Route {
            prompt,
            urgency,
            quality,
            budget,
            user,
            max_tokens,
        } => {
            let mut context = RouteContext::new();
            context.urgency = urgency;
            context.quality = quality;
            context.budget = budget;
            context.user_id = user;
            context.max_tokens = max_tokens;
            cmd_route(state, &prompt, context, cli.format, cli.quiet).await
        }

        Commands::Feedback {
            response_id,
            rating,
            comment,
            user,
        } => {
            cmd_feedback(
                state,
                &response_id,
                rating,
                comment.as_deref(),
                user.as_deref(),
                cli.quiet,
            )
            .await
        }

        Commands::Backends => cmd_backends(state, cli.format).await,

        Commands::Stats => cmd_stats(state, cli.format).await,

        Commands::Export { file } => cmd_export(state, &file, cli.quiet).await,

        Commands::Import { file } => cmd_import(state, &file, cli.quiet).await,

        Commands::Snapshots { action } => cmd_snapshots(state, action, cli.quiet).await,

        Commands::Config { action } => cmd_config(action, cli.quiet),
    }
}

// ============================================================================
// Session
// ============================================================================

/// A router restored from the state database
struct Session {
    router: InferenceRouter,
    store: SnapshotStore,
}

impl Session {
    async fn open(state: Option<&Path>) -> anyhow::Result<Self> {
        let config = Config::load().context("Failed to load configuration")?;
        let store = open_store(state).await?;

        let mut snapshot = store
            .load_latest()
            .await
            .context("Failed to load saved router state")?;
        if let Some(snapshot) = snapshot.as_mut() {
            prefer_configured_backends(&config, snapshot);
        }

        let mut ids: BTreeSet<String> = config.profiles().into_iter().map(|p| p.id).collect();
        ids.insert(config.router.default_backend.clone());
        ids.insert(config.router.baseline_backend.clone());
        if let Some(snapshot) = &snapshot {
            ids.extend(snapshot.registry.iter().map(|p| p.id.clone()));
        }

        let router = InferenceRouter::builder()
            .backends(bind_backends(&config, ids)?)
            .config(config)
            .build()?;

        if let Some(snapshot) = snapshot {
            router.import_state(snapshot)?;
        }

        Ok(Self { router, store })
    }

    async fn persist(&self) -> anyhow::Result<()> {
        self.store
            .save(&self.router.export_state())
            .await
            .context("Failed to save router state")?;
        self.store.prune(KEEP_SNAPSHOTS).await?;
        Ok(())
    }
}

/// A non-empty `[[backends]]` table in the config wins over a saved registry
fn prefer_configured_backends(config: &Config, snapshot: &mut RouterSnapshot) {
    if config.backends.is_empty() || snapshot.registry.is_empty() {
        return;
    }
    info!(
        configured = config.backends.len(),
        saved = snapshot.registry.len(),
        "Using backends from config instead of the saved registry"
    );
    snapshot.registry.clear();
}

async fn open_store(state: Option<&Path>) -> anyhow::Result<SnapshotStore> {
    let path = match state {
        Some(path) => path.to_path_buf(),
        None => default_state_path()?,
    };
    let store = SnapshotStore::connect(&path)
        .await
        .with_context(|| format!("Failed to open state database at {}", path.display()))?;
    store.init().await?;
    Ok(store)
}

fn default_state_path() -> anyhow::Result<PathBuf> {
    let dir = dirs::data_dir().ok_or_else(|| anyhow!("Could not determine data directory"))?;
    Ok(dir.join("inferoute").join("state.db"))
}

/// One backend per id: OpenRouter when an API key is available, echo otherwise
fn bind_backends(
    config: &Config,
    ids: BTreeSet<String>,
) -> anyhow::Result<Vec<Arc<dyn Backend>>> {
    match config.llm.resolved_api_key()? {
        Some(key) => {
            let client = Arc::new(
                OpenRouterClient::builder()
                    .config(config.llm.clone())
                    .api_key(key)
                    .build()?,
            );
            Ok(ids
                .into_iter()
                .map(|id| Arc::new(OpenRouterBackend::new(id, client.clone())) as Arc<dyn Backend>)
                .collect())
        }
        None => {
            warn!("No API key configured, answering locally with echo backends");
            Ok(ids
                .into_iter()
                .map(|id| Arc::new(EchoBackend::new(id)) as Arc<dyn Backend>)
                .collect())
        }
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_route(
    state: Option<&Path>,
    prompt: &str,
    context: RouteContext,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let session = Session::open(state).await?;

    // Ctrl-C aborts the in-flight backend call
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let result = session
        .router
        .route(prompt, context.with_cancellation(cancel))
        .await;

    // Failures are learned from too
    session.persist().await?;
    let response = result?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&response)?),
        OutputFormat::Text => {
            println!("{}", response.content);
            if !quiet {
                println!();
                println!("  Response ID: {}", response.response_id);
                println!("  Backend: {}", response.backend_id);
                println!("  Category: {}", response.analysis.category);
                println!("  Duration: {}ms", response.duration_ms);
                println!("  Cached: {}", if response.cached { "yes" } else { "no" });
                if response.fallbacks_used > 0 {
                    println!("  Fallbacks used: {}", response.fallbacks_used);
                }
            }
        }
    }
    Ok(())
}

async fn cmd_feedback(
    state: Option<&Path>,
    response_id: &str,
    rating: f64,
    comment: Option<&str>,
    user: Option<&str>,
    quiet: bool,
) -> anyhow::Result<()> {
    let session = Session::open(state).await?;

    match session
        .router
        .submit_feedback(response_id, rating, comment, user)
    {
        FeedbackOutcome::Applied {
            backend_id,
            satisfaction,
        } => {
            session.persist().await?;
            if !quiet {
                println!(
                    "Feedback recorded for {} (satisfaction {:.2})",
                    backend_id, satisfaction
                );
            }
        }
        FeedbackOutcome::UnknownResponse => {
            if !quiet {
                println!("Unknown response '{}', feedback ignored", response_id);
            }
        }
        FeedbackOutcome::Rejected { reason } => {
            if !quiet {
                println!("Feedback rejected: {}", reason);
            }
        }
    }
    Ok(())
}

async fn cmd_backends(state: Option<&Path>, format: OutputFormat) -> anyhow::Result<()> {
    let session = Session::open(state).await?;
    let router = &session.router;

    let mut profiles = router.registry().list();
    profiles.sort_by(|a, b| a.id.cmp(&b.id));

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&profiles)?);
        return Ok(());
    }

    println!("Registered Backends:");
    for profile in profiles {
        let capabilities: Vec<String> =
            profile.capabilities.iter().map(|c| c.to_string()).collect();
        println!();
        println!("  {}", profile.id);
        println!(
            "    Speed: {:.2}  Cost: {:.2}  Quality: {:.2}",
            profile.speed, profile.cost, profile.quality
        );
        println!("    Max tokens: {}", profile.max_tokens);
        println!("    Capabilities: {}", capabilities.join(", "));

        match router.ledger().get(&profile.id) {
            Some(record) => {
                println!(
                    "    Calls: {} ({:.0}% success)",
                    record.total_calls,
                    record.success_rate() * 100.0
                );
                if let Some(latency) = record.observed_latency_ms() {
                    println!("    Avg latency: {:.0}ms", latency);
                }
                if let Some(last) = record.recent_errors.back() {
                    println!("    Last error: {}", last.message);
                }
            }
            None => println!("    Calls: 0"),
        }
    }
    Ok(())
}

async fn cmd_stats(state: Option<&Path>, format: OutputFormat) -> anyhow::Result<()> {
    let session = Session::open(state).await?;
    let router = &session.router;

    let summary = router.ledger().summary();
    let cache = router.cache_stats();
    let users = router.preferences().len();

    if format == OutputFormat::Json {
        let stats = serde_json::json!({
            "ledger": summary,
            "cache": cache,
            "users": users,
            "performance": router.ledger().snapshot(),
        });
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Routing Statistics:");
    println!("  Backends with history: {}", summary.backends);
    println!("  Total calls: {}", summary.total_calls);
    println!("  Success rate: {:.1}%", summary.success_rate() * 100.0);
    println!("  Feedback received: {}", summary.total_feedback);
    println!();
    println!("Semantic Cache:");
    println!("  Entries: {}", cache.entries);
    println!("  Hits: {}  Misses: {}", cache.hits, cache.misses);
    println!("  Hit rate: {:.1}%", cache.hit_rate() * 100.0);
    println!();
    println!("Users with preferences: {}", users);
    Ok(())
}

async fn cmd_export(state: Option<&Path>, file: &Path, quiet: bool) -> anyhow::Result<()> {
    let session = Session::open(state).await?;
    let snapshot = session.router.export_state();

    let json = serde_json::to_string_pretty(&snapshot)?;
    std::fs::write(file, json)
        .with_context(|| format!("Failed to write snapshot to {}", file.display()))?;

    if !quiet {
        println!(
            "Exported {} backends, {} users, {} cache entries to {}",
            snapshot.registry.len(),
            snapshot.preferences.len(),
            snapshot.cache_sample.len(),
            file.display()
        );
    }
    Ok(())
}

async fn cmd_import(state: Option<&Path>, file: &Path, quiet: bool) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read snapshot from {}", file.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&text).context("Snapshot is not valid JSON")?;
    let mut snapshot = RouterSnapshot::from_json(value)?;
    let config = Config::load().context("Failed to load configuration")?;
    prefer_configured_backends(&config, &mut snapshot);
    let summary = (
        snapshot.registry.len(),
        snapshot.performance.len(),
        snapshot.preferences.len(),
    );

    let session = Session::open(state).await?;
    session.router.import_state(snapshot)?;
    session.persist().await?;

    info!(file = %file.display(), "Imported router state");
    if !quiet {
        println!(
            "Imported {} backends, {} performance records, {} users",
            summary.0, summary.1, summary.2
        );
    }
    Ok(())
}

async fn cmd_snapshots(
    state: Option<&Path>,
    action: SnapshotAction,
    quiet: bool,
) -> anyhow::Result<()> {
    let store = open_store(state).await?;

    match action {
        SnapshotAction::List => {
            let snapshots = store.list().await?;
            if snapshots.is_empty() {
                println!("No saved snapshots.");
            }
            for snapshot in snapshots {
                println!(
                    "{:>6}  {}  v{}  {} bytes",
                    snapshot.id,
                    snapshot.created_at.format("%Y-%m-%d %H:%M:%S"),
                    snapshot.version,
                    snapshot.size
                );
            }
        }
        SnapshotAction::Prune { keep } => {
            let deleted = store.prune(keep).await?;
            if !quiet {
                println!("Deleted {} snapshots.", deleted);
            }
        }
        SnapshotAction::Clear { force } => {
            if !force {
                return Err(anyhow!("Refusing to delete all snapshots without --force"));
            }
            let deleted = store.clear_all().await?;
            if !quiet {
                println!("Deleted {} snapshots.", deleted);
            }
        }
    }
    Ok(())
}

fn cmd_config(action: ConfigAction, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            let value = config.get(&key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load()?;
            config.set(&key, &value)?;
            config.save()?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = Config::load()?;
            let items = config.list()?;
            for (key, value) in items {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use inferoute_core::routing::CapabilityProfile;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_route_arguments() {
        let cli = Cli::parse_from([
            "inferoute",
            "route",
            "What is Rust?",
            "--urgency",
            "0.9",
            "--user",
            "alice",
            "--format",
            "json",
        ]);
        assert!(cli.format == OutputFormat::Json);
        match cli.command {
            Commands::Route {
                prompt,
                urgency,
                user,
                quality,
                ..
            } => {
                assert_eq!(prompt, "What is Rust?");
                assert_eq!(urgency, Some(0.9));
                assert_eq!(user.as_deref(), Some("alice"));
                assert_eq!(quality, None);
            }
            _ => panic!("expected route command"),
        }
    }

    #[test]
    fn test_configured_backends_win_over_saved_registry() {
        let saved = || RouterSnapshot {
            registry: vec![CapabilityProfile::new("saved/model")],
            ..RouterSnapshot::default()
        };

        // No explicit table: the saved registry is kept
        let mut snapshot = saved();
        prefer_configured_backends(&Config::default(), &mut snapshot);
        assert_eq!(snapshot.registry.len(), 1);

        let mut config = Config::default();
        config.backends = vec![CapabilityProfile::new("configured/model")];
        let mut snapshot = saved();
        prefer_configured_backends(&config, &mut snapshot);
        assert!(snapshot.registry.is_empty());
    }

    #[test]
    fn test_bind_backends_offline_uses_echo() {
        // Only meaningful without a key in the environment
        let config = Config::default();
        if config.llm.resolved_api_key().unwrap().is_some() {
            return;
        }
        let ids = BTreeSet::from(["a".to_string(), "b".to_string()]);
        let backends = bind_backends(&config, ids).unwrap();
        let bound: Vec<&str> = backends.iter().map(|b| b.id()).collect();
        assert_eq!(bound, vec!["a", "b"]);
    }
}
