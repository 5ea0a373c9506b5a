//! ctxwarden - token-budgeted context windows CLI
//!
//! The `ctxwarden` command operates conversations, windows and items stored
//! in SurrealDB, and drives the pruning engine and window monitor.
//!
//! ## Commands
//!
//! - `conversation`: create or delete a conversation
//! - `window`: show or rotate the active window
//! - `add` / `items`: attach and list context items
//! - `prune` / `prune-all` / `watch`: evict items to fit budgets
//! - `health` / `stats` / `status` / `verify`: inspect windows
//! - `segments`: preview summarization segments of a message file

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};

use ctxwarden_core::{
    segments, should_summarize, ContextStore, ConversationId, CtxwardenConfig, ItemSpec,
    ItemSource, ItemType, Message, Priority, PruningService, StrategyKind, StrategyRegistry,
    WindowMonitor,
};
use ctxwarden_state::fakes::MemoryCounterCache;
use ctxwarden_state::{ContextWindow, SurrealConfig, SurrealWindowRepository};

#[derive(Parser)]
#[command(name = "ctxwarden")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Token-budgeted context windows for LLM conversations", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// SurrealDB endpoint (mem://, surrealkv://path, ws://host:port)
    #[arg(long, global = true, env = "CTXWARDEN_DB")]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or delete conversations
    Conversation {
        #[command(subcommand)]
        action: ConversationAction,
    },

    /// Inspect or rotate a conversation's active window
    Window {
        #[command(subcommand)]
        action: WindowAction,
    },

    /// Attach an item to a conversation's active window
    Add {
        /// Conversation ID
        conversation: String,

        /// Item text
        content: String,

        /// Item type: message, summary, preference, system, metadata
        #[arg(short = 't', long = "type", default_value = "message")]
        item_type: String,

        /// Priority: critical, high, medium, low
        #[arg(short, long, default_value = "medium")]
        priority: String,

        /// Relevance score in [0, 1]
        #[arg(short, long, default_value = "1.0")]
        relevance: f64,

        /// Originating message ID; the item then keeps only the reference
        #[arg(long)]
        message_id: Option<String>,
    },

    /// List the items of a conversation's active window
    Items {
        /// Conversation ID
        conversation: String,

        /// Include evicted items
        #[arg(short, long)]
        all: bool,
    },

    /// Prune a conversation's active window
    Prune {
        /// Conversation ID
        conversation: String,

        /// Strategy: priority, relevance, time, hybrid
        #[arg(short, long, default_value = "hybrid")]
        strategy: String,

        /// Budget override (default: the window's max tokens)
        #[arg(short, long)]
        max_tokens: Option<u64>,
    },

    /// Prune every active window at or above the usage threshold
    PruneAll {
        /// Usage percentage (default: configured prune threshold)
        #[arg(long)]
        threshold: Option<f64>,

        /// Strategy: priority, relevance, time, hybrid
        #[arg(short, long, default_value = "hybrid")]
        strategy: String,
    },

    /// Periodically prune every window over the threshold
    Watch {
        /// Seconds between passes
        #[arg(short, long, default_value = "60")]
        interval: u64,

        /// Usage percentage (default: configured prune threshold)
        #[arg(long)]
        threshold: Option<f64>,

        /// Strategy: priority, relevance, time, hybrid
        #[arg(short, long, default_value = "hybrid")]
        strategy: String,

        /// Stop after this many passes (default: run until Ctrl-C)
        #[arg(long)]
        passes: Option<u64>,
    },

    /// Show the health of a conversation's active window
    Health {
        /// Conversation ID
        conversation: String,
    },

    /// Show item statistics of a conversation's active window
    Stats {
        /// Conversation ID
        conversation: String,
    },

    /// Show store-wide status and pruning telemetry
    Status,

    /// Check token accounting and repair drifted windows
    Verify {
        /// Conversation ID (default: every window)
        conversation: Option<String>,
    },

    /// Preview summarization segments of a JSON message file
    Segments {
        /// File holding a JSON array of {id, role, content}
        #[arg(short, long)]
        file: PathBuf,

        /// Messages per segment (default: configured segment size)
        #[arg(long)]
        size: Option<usize>,

        /// Messages shared by consecutive segments (default: configured overlap)
        #[arg(long)]
        overlap: Option<usize>,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum ConversationAction {
    /// Register a conversation and open its first window
    Create {
        /// Window budget (default: configured default max tokens)
        #[arg(short, long)]
        max_tokens: Option<u64>,
    },
    /// Delete a conversation with all of its windows and items
    Delete {
        /// Conversation ID
        conversation: String,
    },
}

#[derive(Subcommand)]
enum WindowAction {
    /// Show the active window
    Show {
        /// Conversation ID
        conversation: String,
    },
    /// Retire the active window and open a new one
    Rotate {
        /// Conversation ID
        conversation: String,

        /// Budget of the new window (default: configured default max tokens)
        #[arg(short, long)]
        max_tokens: Option<u64>,
    },
}

/// Everything a command needs, wired once per process.
struct App {
    config: CtxwardenConfig,
    store: ContextStore,
    monitor: WindowMonitor,
    pruning: PruningService,
}

impl App {
    async fn connect(db: Option<&str>, config: CtxwardenConfig) -> Result<Self> {
        let surreal = match db {
            Some(endpoint) => SurrealConfig::new(endpoint),
            None => SurrealConfig::from_env(),
        };
        let repo = SurrealWindowRepository::connect(&surreal)
            .await
            .with_context(|| format!("Failed to connect to {}", surreal.endpoint))?;
        Self::with_repository(Arc::new(repo), config)
    }

    fn with_repository(
        repo: Arc<dyn ctxwarden_state::WindowRepository>,
        config: CtxwardenConfig,
    ) -> Result<Self> {
        let store = ContextStore::new(repo);
        // Telemetry lives for the lifetime of this process only.
        let monitor = WindowMonitor::new(
            store.clone(),
            Arc::new(MemoryCounterCache::new()),
            config.monitor.clone(),
        );
        let registry = StrategyRegistry::from_config(&config.strategies)?;
        let pruning = PruningService::new(store.clone(), monitor.clone(), Arc::new(registry));
        Ok(Self {
            config,
            store,
            monitor,
            pruning,
        })
    }

    async fn active_window(&self, conversation: &str) -> Result<ContextWindow> {
        let id = ConversationId::from(conversation);
        match self.store.active_window(&id).await? {
            Some(window) => Ok(window),
            None => bail!("Conversation '{}' has no active window", conversation),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    ctxwarden_core::init_tracing(cli.json, level);

    let config = CtxwardenConfig::from_env().context("Invalid ctxwarden configuration")?;

    // Commands that need no database
    match &cli.command {
        Commands::Segments {
            file,
            size,
            overlap,
        } => return cmd_segments(&config, file, *size, *overlap),
        Commands::Config => return cmd_config(&config),
        _ => {}
    }

    let app = App::connect(cli.db.as_deref(), config)
        .await
        .context("Failed to open ctxwarden store")?;

    match cli.command {
        Commands::Conversation { action } => match action {
            ConversationAction::Create { max_tokens } => {
                cmd_conversation_create(&app, max_tokens).await.map(|_| ())
            }
            ConversationAction::Delete { conversation } => {
                cmd_conversation_delete(&app, &conversation).await
            }
        },
        Commands::Window { action } => match action {
            WindowAction::Show { conversation } => cmd_window_show(&app, &conversation).await,
            WindowAction::Rotate {
                conversation,
                max_tokens,
            } => cmd_window_rotate(&app, &conversation, max_tokens).await,
        },
        Commands::Add {
            conversation,
            content,
            item_type,
            priority,
            relevance,
            message_id,
        } => {
            cmd_add(
                &app,
                &conversation,
                &content,
                &item_type,
                &priority,
                relevance,
                message_id.as_deref(),
            )
            .await
        }
        Commands::Items { conversation, all } => cmd_items(&app, &conversation, all).await,
        Commands::Prune {
            conversation,
            strategy,
            max_tokens,
        } => cmd_prune(&app, &conversation, &strategy, max_tokens).await,
        Commands::PruneAll {
            threshold,
            strategy,
        } => cmd_prune_all(&app, threshold, &strategy).await.map(|_| ()),
        Commands::Watch {
            interval,
            threshold,
            strategy,
            passes,
        } => cmd_watch(&app, interval, threshold, &strategy, passes).await,
        Commands::Health { conversation } => cmd_health(&app, &conversation).await,
        Commands::Stats { conversation } => cmd_stats(&app, &conversation).await,
        Commands::Status => cmd_status(&app).await,
        Commands::Verify { conversation } => cmd_verify(&app, conversation.as_deref()).await,
        Commands::Segments { .. } | Commands::Config => Ok(()),
    }
}

fn parse_strategy(name: &str) -> Result<StrategyKind> {
    name.parse::<StrategyKind>()
        .with_context(|| "Expected one of: priority, relevance, time, hybrid")
}

/// Create a conversation and its first window
async fn cmd_conversation_create(app: &App, max_tokens: Option<u64>) -> Result<ContextWindow> {
    let conversation = app.store.create_conversation().await?;
    let window = app
        .store
        .get_or_create_active_window(
            &conversation,
            max_tokens.unwrap_or(app.config.default_max_tokens),
        )
        .await?;

    println!("Conversation: {}", conversation);
    println!("Window:       {} (max {} tokens)", window.id, window.max_tokens);
    Ok(window)
}

async fn cmd_conversation_delete(app: &App, conversation: &str) -> Result<()> {
    let id = ConversationId::from(conversation);
    app.store
        .delete_conversation(&id)
        .await
        .with_context(|| format!("Failed to delete conversation '{}'", conversation))?;
    println!("Deleted conversation '{}'", conversation);
    Ok(())
}

async fn cmd_window_show(app: &App, conversation: &str) -> Result<()> {
    let window = app.active_window(conversation).await?;
    print_window(&window);
    Ok(())
}

async fn cmd_window_rotate(app: &App, conversation: &str, max_tokens: Option<u64>) -> Result<()> {
    let id = ConversationId::from(conversation);
    let previous = app.store.active_window(&id).await?;
    let window = app
        .store
        .rotate_window(&id, max_tokens.unwrap_or(app.config.default_max_tokens))
        .await?;

    if let Some(previous) = previous {
        println!("Retired window {} ({} tokens)", previous.id, previous.current_tokens);
    }
    print_window(&window);
    Ok(())
}

fn print_window(window: &ContextWindow) {
    println!("window {}", window.id);
    println!("Conversation: {}", window.conversation_id);
    println!(
        "Tokens:       {} / {} ({:.1}%)",
        window.current_tokens,
        window.max_tokens,
        window.usage_percent()
    );
    println!("Active:       {}", window.is_active);
    println!(
        "Created:      {}",
        window.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
}

async fn cmd_add(
    app: &App,
    conversation: &str,
    content: &str,
    item_type: &str,
    priority: &str,
    relevance: f64,
    message_id: Option<&str>,
) -> Result<()> {
    let item_type: ItemType = item_type.parse().map_err(anyhow::Error::msg)?;
    let priority: Priority = priority.parse().map_err(anyhow::Error::msg)?;
    let source = match message_id {
        Some(id) => ItemSource::Message {
            message_id: id.to_string(),
            text: content.to_string(),
        },
        None => ItemSource::Inline(content.to_string()),
    };
    let spec = ItemSpec::new(item_type, source)
        .with_priority(priority)
        .with_relevance(relevance);

    let window = app
        .store
        .get_or_create_active_window(
            &ConversationId::from(conversation),
            app.config.default_max_tokens,
        )
        .await?;
    let item = app.store.add_item(&window.id, spec).await?;
    let window = app.store.window(&window.id).await?;

    println!(
        "Added {} item {} at position {} ({} tokens)",
        item.item_type, item.id, item.position, item.token_count
    );
    println!(
        "Window {}: {} / {} tokens",
        window.id, window.current_tokens, window.max_tokens
    );
    Ok(())
}

async fn cmd_items(app: &App, conversation: &str, all: bool) -> Result<()> {
    let window = app.active_window(conversation).await?;
    let items = app.store.items_for_window(&window.id, !all).await?;

    if items.is_empty() {
        println!("No items in window {}", window.id);
        return Ok(());
    }

    println!(
        "{:>4}  {:<10} {:<9} {:>5} {:>7}  {:<3} {}",
        "pos", "type", "priority", "rel", "tokens", "in", "id"
    );
    for item in items {
        println!(
            "{:>4}  {:<10} {:<9} {:>5.2} {:>7}  {:<3} {}",
            item.position,
            item.item_type.as_str(),
            item.priority.as_str(),
            item.relevance_score,
            item.token_count,
            if item.is_included { "yes" } else { "no" },
            item.id
        );
    }
    Ok(())
}

async fn cmd_prune(
    app: &App,
    conversation: &str,
    strategy: &str,
    max_tokens: Option<u64>,
) -> Result<()> {
    let kind = parse_strategy(strategy)?;
    let report = app
        .pruning
        .prune_conversation(&ConversationId::from(conversation), kind, max_tokens)
        .await?;

    println!(
        "{} on window {}: {} -> {} tokens (budget {}), {} item(s) evicted",
        report.strategy,
        report.window_id,
        report.tokens_before,
        report.tokens_after,
        report.budget,
        report.items_removed
    );
    if !report.success {
        bail!("Pruning stopped early on a storage error; evictions so far were kept");
    }
    Ok(())
}

async fn cmd_prune_all(app: &App, threshold: Option<f64>, strategy: &str) -> Result<usize> {
    let kind = parse_strategy(strategy)?;
    let threshold = threshold.unwrap_or(app.config.monitor.prune_threshold_percent);
    let reports = app.pruning.prune_all(threshold, kind).await?;

    if reports.is_empty() {
        println!("No windows at or above {:.1}% usage", threshold);
        return Ok(0);
    }
    for report in &reports {
        println!(
            "{}  {} -> {} tokens, {} evicted{}",
            report.window_id,
            report.tokens_before,
            report.tokens_after,
            report.items_removed,
            if report.success { "" } else { " (incomplete)" }
        );
    }
    Ok(reports.len())
}

async fn cmd_watch(
    app: &App,
    interval: u64,
    threshold: Option<f64>,
    strategy: &str,
    passes: Option<u64>,
) -> Result<()> {
    if interval == 0 {
        bail!("Interval must be at least one second");
    }
    let mut ticker = tokio::time::interval(Duration::from_secs(interval));
    let mut completed = 0u64;
    info!(interval, strategy, "watching windows");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!(passes = completed, "watch interrupted");
                return Ok(());
            }
        }

        if let Err(e) = cmd_prune_all(app, threshold, strategy).await {
            warn!(error = %e, "prune pass failed");
        }
        completed += 1;
        if passes.is_some_and(|limit| completed >= limit) {
            return Ok(());
        }
    }
}

async fn cmd_health(app: &App, conversation: &str) -> Result<()> {
    let window = app.active_window(conversation).await?;
    let health = app.monitor.window_health(&window.id).await?;
    println!("[{}] {}", health.level, health.message);
    if !health.is_healthy {
        println!(
            "Consider: ctxwarden prune {} --strategy hybrid",
            conversation
        );
    }
    Ok(())
}

async fn cmd_stats(app: &App, conversation: &str) -> Result<()> {
    let window = app.active_window(conversation).await?;
    let stats = app.monitor.window_statistics(&window.id).await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn cmd_status(app: &App) -> Result<()> {
    let status = app.monitor.global_status().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn cmd_verify(app: &App, conversation: Option<&str>) -> Result<()> {
    let windows = match conversation {
        Some(conversation) => vec![app.active_window(conversation).await?],
        None => app.store.windows(false).await?,
    };

    let mut repaired = 0;
    for window in &windows {
        let report = app.store.verify_window(&window.id).await?;
        if report.repaired {
            repaired += 1;
            println!(
                "Repaired {}: cached {} -> actual {}",
                report.window_id, report.cached_tokens, report.actual_tokens
            );
        }
    }
    println!("Verified {} window(s), {} repaired", windows.len(), repaired);
    Ok(())
}

fn read_messages(path: &Path) -> Result<Vec<Message>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid message file {}", path.display()))
}

fn cmd_segments(
    config: &CtxwardenConfig,
    file: &Path,
    size: Option<usize>,
    overlap: Option<usize>,
) -> Result<()> {
    let messages = read_messages(file)?;
    let summarization = &config.summarization;
    let size = size.unwrap_or(summarization.segment_size);
    let overlap = overlap.unwrap_or(summarization.segment_overlap);

    let due = should_summarize(
        &messages,
        summarization.token_threshold,
        summarization.count_threshold,
    );
    println!(
        "{} message(s), summarization {}",
        messages.len(),
        if due { "due" } else { "not due" }
    );

    let plan = segments(&messages, size, overlap)?;
    if plan.is_empty() {
        println!("History fits in a single segment of {}", size);
        return Ok(());
    }
    for segment in &plan {
        println!(
            "[{}-{}] {}..{}  {}",
            segment.start_idx,
            segment.end_idx,
            segment.start_id(),
            segment.end_id(),
            &segment.digest()[..12]
        );
    }
    Ok(())
}

fn cmd_config(config: &CtxwardenConfig) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
