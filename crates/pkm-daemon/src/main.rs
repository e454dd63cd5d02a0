//! PKM Assistant Daemon
//!
//! Local ingestion service for the personal-knowledge capture pipeline. A
//! browser companion posts page visits and tab events here; the daemon
//! resolves referrers, queues visits, classifies them with memory-enhanced
//! filtering, and indexes the keepers into the relational store, the vector
//! store and the markdown index.
//!
//! The bound port is OS-assigned and advertised in well-known files so the
//! companion and the `pkm` CLI can find it.

mod intake;
mod port;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use pkm_core::{
    client_from_config, Config, EnhancedFilter, EpisodicMemory, LlmClient, MarkdownIndex,
    OrphanManager, ProceduralMemory, ReconciliationWorkflow, Storage, TabTracker, VectorStore,
    VisitProcessor, VisitQueue,
};

use crate::intake::AppState;

struct Args {
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    port: Option<u16>,
}

/// Parse command-line arguments. Exits the process for `--help`,
/// `--version`, or malformed input.
fn parse_args() -> Args {
    let argv: Vec<String> = std::env::args().collect();
    let mut args = Args {
        data_dir: None,
        config: None,
        port: None,
    };
    let mut i = 1;

    while i < argv.len() {
        match argv[i].as_str() {
            "--help" | "-h" => {
                println!("PKM Assistant Daemon v{}", env!("CARGO_PKG_VERSION"));
                println!();
                println!("Local ingestion service for browser-captured knowledge.");
                println!();
                println!("USAGE:");
                println!("    pkm-daemon [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -h, --help              Print help information");
                println!("    -V, --version           Print version information");
                println!("    --data-dir <PATH>       Custom data directory");
                println!("    --config <PATH>         Custom config file");
                println!("    --port <PORT>           Bind a fixed port (default: OS-assigned)");
                println!();
                println!("ENVIRONMENT:");
                println!("    RUST_LOG                Log level filter (e.g., debug, info, warn)");
                println!("    PKM_API_KEY             LLM provider API key");
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("pkm-daemon {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--data-dir" => {
                i += 1;
                if i >= argv.len() {
                    eprintln!("error: --data-dir requires a path argument");
                    std::process::exit(1);
                }
                args.data_dir = Some(PathBuf::from(&argv[i]));
            }
            "--config" => {
                i += 1;
                if i >= argv.len() {
                    eprintln!("error: --config requires a path argument");
                    std::process::exit(1);
                }
                args.config = Some(PathBuf::from(&argv[i]));
            }
            "--port" => {
                i += 1;
                let parsed = argv.get(i).and_then(|p| p.parse().ok());
                match parsed {
                    Some(p) => args.port = Some(p),
                    None => {
                        eprintln!("error: --port requires a port number");
                        std::process::exit(1);
                    }
                }
            }
            arg => {
                eprintln!("error: unknown argument '{}'", arg);
                eprintln!("Try 'pkm-daemon --help' for more information.");
                std::process::exit(1);
            }
        }
        i += 1;
    }

    args
}

#[tokio::main]
async fn main() {
    let args = parse_args();

    // Logging to stderr; intake responses own stdout-free silence anyway.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_writer(io::stderr)
        .with_target(false)
        .with_ansi(false)
        .init();

    info!("PKM Assistant Daemon v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = match Config::load(args.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Resolve storage locations: --data-dir beats the config file, which
    // beats the platform default.
    let db_path = args
        .data_dir
        .as_ref()
        .map(|d| d.join("pkm.db"))
        .or_else(|| config.paths.database.clone());
    let vector_dir = args
        .data_dir
        .as_ref()
        .map(|d| d.join("vectors"))
        .or_else(|| config.paths.vector_dir.clone());
    let markdown_path = match config.paths.markdown_index.clone() {
        Some(p) => p,
        None => match args.data_dir.as_ref() {
            Some(d) => d.join("knowledge.md"),
            None => match Storage::default_path() {
                Ok(db) => db.with_file_name("knowledge.md"),
                Err(e) => {
                    error!("Could not resolve data directory: {}", e);
                    std::process::exit(1);
                }
            },
        },
    };

    let storage = match Storage::new(db_path) {
        Ok(s) => {
            info!("Relational store initialized");
            Arc::new(s)
        }
        Err(e) => {
            error!("Failed to initialize relational store: {}", e);
            std::process::exit(1);
        }
    };
    let vectors = match VectorStore::new(vector_dir) {
        Ok(v) => {
            info!("Vector store initialized");
            Arc::new(v)
        }
        Err(e) => {
            error!("Failed to initialize vector store: {}", e);
            std::process::exit(1);
        }
    };

    let llm: Arc<dyn LlmClient> = match client_from_config(&config.llm) {
        Ok(client) => Arc::from(client),
        Err(e) => {
            error!("Failed to configure LLM provider: {}", e);
            error!("Hint: set PKM_API_KEY, or switch \"llm.provider\" to \"ollama\"");
            std::process::exit(1);
        }
    };

    let episodic = Arc::new(EpisodicMemory::new(
        storage.clone(),
        vectors.clone(),
        Arc::clone(&llm),
    ));
    let procedural = match ProceduralMemory::new(storage.clone()) {
        Ok(p) => {
            let quarantined = p.quarantined().len();
            if quarantined > 0 {
                warn!(quarantined, "Some procedural rules failed to compile");
            }
            info!(rules = p.rule_count(), "Procedural memory loaded");
            Arc::new(p)
        }
        Err(e) => {
            error!("Failed to load procedural rules: {}", e);
            std::process::exit(1);
        }
    };
    let filter = Arc::new(EnhancedFilter::new(
        Arc::clone(&llm),
        episodic,
        procedural,
        config.filter.clone(),
        config.llm.default_model.clone(),
    ));

    info!(markdown_index = %markdown_path.display(), "Markdown index location");
    let workflow: Arc<dyn VisitProcessor> = Arc::new(ReconciliationWorkflow::new(
        llm,
        filter.clone(),
        storage.clone(),
        vectors,
        MarkdownIndex::new(markdown_path),
        config.llm.default_model.clone(),
    ));

    let tracker = Arc::new(Mutex::new(TabTracker::new()));
    let orphans = Arc::new(Mutex::new(OrphanManager::new()));

    let (queue, queue_handles) = VisitQueue::spawn(
        workflow,
        storage.clone(),
        tracker.clone(),
        orphans.clone(),
        config.queue.clone(),
    );

    let state = Arc::new(AppState {
        queue: queue.clone(),
        storage,
        tracker,
        orphans,
        filter,
        started_at: Instant::now(),
    });
    let app = intake::router(state);

    let bind_port = args.port.unwrap_or(config.intake.port);
    let addr = format!("{}:{}", config.intake.host, bind_port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    let local_addr = match listener.local_addr() {
        Ok(a) => a,
        Err(e) => {
            error!("Failed to read bound address: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = port::advertise(local_addr.port()) {
        warn!("Could not advertise port: {}", e);
    }
    info!("Intake service listening on http://{}", local_addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
    }

    // Orderly shutdown: refuse new work, let the consumer finish its batch,
    // stop the ticker, withdraw the advertised port.
    info!("Shutting down: draining visit queue");
    queue.shutdown();
    for handle in queue_handles {
        if let Err(e) = handle.await {
            warn!("Queue task ended abnormally: {}", e);
        }
    }
    port::withdraw();
    info!("PKM Assistant Daemon stopped");
}

/// Resolve on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
