use anyhow::Context;
use clap::Parser;
use herald_core::HeraldConfig;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use herald_server::{http, wiring};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "herald.toml")]
    config: String,

    /// Check the database and exit
    #[arg(long)]
    health: bool,

    /// Upload existing videos and articles to the knowledge base without publishing, then exit
    #[arg(long)]
    backfill: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience, production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config
    let config = match HeraldConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // Init logging; RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.service.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    // Connect to DB
    let pool = match herald_core::db::connect(&config.database).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to open database {}: {}", config.database.url, e);
            std::process::exit(1);
        }
    };

    if args.health {
        match herald_core::db::health_check(&pool).await {
            Ok(v) => println!("✅ SQLite connected: {}", v),
            Err(e) => {
                println!("❌ SQLite check failed: {}", e);
                std::process::exit(1);
            }
        }
        println!("✅ Herald DB health check passed");
        return Ok(());
    }

    let client = wiring::build_client(&config)?;
    client.open().await.context("opening service client")?;

    if args.backfill {
        let reports = wiring::backfill(&config, pool.clone(), &client).await;
        client.close().await;
        for (stream, report) in reports? {
            println!(
                "{}: fetched {}, uploaded {}, skipped {}, failed {}",
                stream, report.fetched, report.uploaded, report.skipped, report.failed
            );
        }
        return Ok(());
    }

    let (tx, mut shutdown_rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    // Content sync loops
    let scheduler = wiring::build_scheduler(&config, pool.clone(), client.clone())?.map(Arc::new);
    if let Some(scheduler) = &scheduler {
        let report = scheduler.start().await;
        tracing::info!(
            pruned = report.pruned,
            known = report.known,
            seeded = report.seeded,
            "Content sync running"
        );
    }

    // HTTP API
    let http_task = if config.http.enabled {
        let state = wiring::build_http_state(pool.clone(), client.clone(), scheduler.clone());
        let http_config = config.http.clone();
        let http_shutdown = tx.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = http::start_http_server(state, &http_config, http_shutdown).await {
                tracing::error!("HTTP server error: {}", e);
            }
        }))
    } else {
        None
    };

    let _ = shutdown_rx.recv().await;

    if let Some(scheduler) = &scheduler {
        if !scheduler.stop().await {
            tracing::warn!("Content sync did not stop cleanly");
        }
    }
    if let Some(task) = http_task {
        let _ = task.await;
    }
    client.close().await;
    pool.close().await;
    tracing::info!("Herald stopped");

    Ok(())
}
