//! Server binary: wire the store, registry, retriever and router together
//! and serve the HTTP surface.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use askdb::api::{build_router, AppState};
use askdb::chat::{ChatOrchestrator, Store};
use askdb::config::Config;
use askdb::crypto::SecretCipher;
use askdb::db::{ConnectionRegistry, SchemaLoader};
use askdb::knowledge::{KnowledgeIndex, Retriever};
use askdb::llm::{LlmRouter, ProviderRegistry};
use askdb::logging;

#[derive(Debug, Parser)]
#[command(name = "askdb", about = "Ask questions, get SQL answers")]
struct Args {
    /// Path to the TOML config file.
    #[arg(short, long, env = "ASKDB_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address override, e.g. 0.0.0.0:8080.
    #[arg(short, long)]
    bind: Option<String>,

    /// Log filter override (RUST_LOG syntax).
    #[arg(long)]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    logging::init(args.log.as_deref());

    let mut config = Config::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    let cipher = SecretCipher::from_base64_key(&Config::encryption_key()?)
        .context("initializing secret cipher")?;

    let store = Arc::new(
        Store::open(&config.store.dsn, cipher)
            .await
            .context("opening self-storage")?,
    );

    let index = Arc::new(KnowledgeIndex::new());
    index.replace(store.load_knowledge().await.context("loading knowledge")?);

    let registry = Arc::new(ConnectionRegistry::new(store.clone(), config.pool));
    let schema_loader = Arc::new(SchemaLoader::new(
        registry.clone(),
        Duration::from_secs(60),
        Duration::from_secs(config.timeouts.schema_secs),
    ));
    let retriever = Arc::new(Retriever::new(index, None, config.retrieval));
    let router = Arc::new(LlmRouter::new(ProviderRegistry::with_builtins()));

    let orchestrator = Arc::new(ChatOrchestrator::new(
        store.clone(),
        registry.clone(),
        schema_loader,
        retriever,
        router,
        config.clone(),
    ));

    if config.server.api_tokens.is_empty() {
        warn!("No API tokens configured; authentication is DISABLED");
    }

    let state = Arc::new(AppState {
        store,
        registry,
        orchestrator,
        api_tokens: config.server.api_tokens.clone(),
    });

    let app = build_router(state, &config.server.allowed_origins);

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("binding {}", config.server.bind))?;
    info!("Listening on {}", config.server.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutting down");
}
