//! CLI binary for banter.
//!
//! `banter` runs the bot; `banter check` validates the configuration and
//! exits. Startup is deliberately forgiving: only the Discord token is
//! required, and every other missing piece (API key, database, embedding
//! model) switches off the features that need it instead of aborting.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use banter::background::TaskQueue;
use banter::chat::ChatHandler;
use banter::config::BotConfig;
use banter::discord::DiscordTransport;
use banter::embedding::SharedEmbedder;
use banter::llm::LlmClient;
use banter::memory::{MemoryStore, StoreCaps, backfill_missing_embeddings};
use banter::transport::ChatTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Suppress noisy dependency logs by default; RUST_LOG overrides.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("banter=info,hf_hub=warn,ort=warn")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mut config_path: Option<PathBuf> = None;
    let mut check_only = false;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                let Some(path) = args.get(i) else {
                    print_usage();
                    anyhow::bail!("--config requires a path");
                };
                config_path = Some(PathBuf::from(path));
            }
            "check" => check_only = true,
            "help" | "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            other => {
                print_usage();
                anyhow::bail!("unknown argument `{other}`");
            }
        }
        i += 1;
    }

    let config = BotConfig::load(config_path.as_deref())?;
    let issues = config.validate();

    if check_only {
        if issues.is_empty() {
            println!("configuration ok");
            return Ok(());
        }
        for issue in &issues {
            println!("issue: {issue}");
        }
        anyhow::bail!("{} configuration issue(s)", issues.len());
    }

    for issue in &issues {
        warn!("{issue}");
    }

    run(config).await
}

fn print_usage() {
    println!("banter - Discord group-chat bot with long-term memory");
    println!();
    println!("Usage:");
    println!("  banter [--config <path>]        run the bot");
    println!("  banter check [--config <path>]  validate configuration and exit");
}

async fn run(config: BotConfig) -> anyhow::Result<()> {
    println!("Banter v{}", env!("CARGO_PKG_VERSION"));

    // The transport is the one hard requirement.
    let Some(token) = config.discord.resolve_token() else {
        anyhow::bail!(
            "no Discord token: set [discord].token or the DISCORD_BOT_TOKEN environment variable"
        );
    };

    let llm = LlmClient::from_config(&config.llm)?;
    if llm.is_none() {
        warn!("no LLM API key: replies disabled, repost callouts still active");
    }

    let db_path = config.memory.resolve_db_path();
    let caps = StoreCaps {
        max_user_facts: config.memory.max_user_facts,
        max_group_facts: config.memory.max_group_facts,
        max_summaries: config.memory.max_summaries,
    };
    let store = match MemoryStore::open(&db_path, caps) {
        Ok(store) => {
            info!(path = %db_path.display(), "memory store open");
            Some(Arc::new(store))
        }
        Err(e) => {
            warn!(error = %e, "memory store unavailable, running without memory");
            None
        }
    };

    let embedder = if config.embedding.enabled && store.is_some() {
        match SharedEmbedder::bootstrap().await {
            Ok(embedder) => Some(embedder),
            Err(e) => {
                warn!(error = %e, "embedding engine unavailable, semantic retrieval disabled");
                None
            }
        }
    } else {
        None
    };

    let queue = TaskQueue::default();

    // Rows written while the embedder was down get their vectors filled in
    // behind the scenes.
    if let (Some(store), Some(embedder)) = (store.clone(), embedder.clone()) {
        queue.spawn("embedding backfill", async move {
            backfill_missing_embeddings(&store, &embedder).await;
            Ok(())
        });
    }

    let transport = Arc::new(DiscordTransport::new(token));
    let handler = ChatHandler::new(
        &config,
        Arc::clone(&transport) as Arc<dyn ChatTransport>,
        llm,
        store,
        embedder,
        queue.clone(),
    );

    let (tx, rx) = tokio::sync::mpsc::channel(256);
    let gateway = tokio::spawn(async move { transport.run(tx).await });

    info!("banter is up");
    tokio::select! {
        () = handler.run(rx) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl+C, shutting down...");
        }
    }

    gateway.abort();
    let stats = queue.stats();
    info!(
        spawned = stats.spawned,
        completed = stats.completed,
        failed = stats.failed,
        rejected = stats.rejected,
        "background queue totals"
    );
    Ok(())
}
