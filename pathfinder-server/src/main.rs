use std::sync::Arc;

use clap::Parser;
use pathfinder_core::{GeminiClient, LlmBackend, PathfinderConfig};
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "pathfinder.toml")]
    config: String,

    /// Check database connectivity and exit
    #[arg(long)]
    health: bool,

    /// Apply migrations and exit
    #[arg(long)]
    migrate_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config
    let config = match PathfinderConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // Init logging: RUST_LOG wins over [service] log_level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.service.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    // Connect to DB; migrations are skipped for a plain health check
    let migrate = !args.health && (config.database.run_migrations || args.migrate_only);
    let pool = match pathfinder_core::db::connect(&config.database, migrate).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to prepare database: {}", e);
            std::process::exit(1);
        }
    };

    if args.health {
        match pathfinder_core::db::health_check(&pool).await {
            Ok(v) => println!("✅ PostgreSQL connected: {}", v),
            Err(e) => {
                println!("❌ PostgreSQL connection failed: {}", e);
                std::process::exit(1);
            }
        }
        println!("✅ Pathfinder DB health check passed");
        return Ok(());
    }

    if args.migrate_only {
        println!("✅ Migrations applied");
        return Ok(());
    }

    let llm: Arc<dyn LlmBackend> = match GeminiClient::new(config.llm.clone()) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("Failed to create Gemini client: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!(backend = llm.name(), model = llm.model(), "LLM backend ready");

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    pathfinder_server::http::start_http_server(pool, config, llm, tx.subscribe()).await?;

    Ok(())
}
