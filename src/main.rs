use clap::Parser;
use colored::*;
use std::path::Path;
use std::sync::Arc;
use toolfix::log_rotation::{LogRotationConfig, LogRotationManager};
use toolfix::logging::{self, TracingSink};
use toolfix::{build_router, AppState, Args};

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, draining connections");
}

fn print_banner(args: &Args) {
    println!("{}", "toolfix".bold().cyan());
    println!("  listening  {}:{}", args.host, args.port);
    println!("  backend    {}", args.backend_url);
    let repair = if args.enable_streaming_tool_parser {
        "on".green()
    } else {
        "off".yellow()
    };
    println!("  repair     {}", repair);
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let _guards = logging::init_tracing(&args);
    logging::setup_panic_hook();

    if args.enable_file_logging {
        let manager = LogRotationManager::new(LogRotationConfig::default());
        for name in logging::log_file_names(&args.log_file) {
            if let Err(e) = manager.check_and_rotate(Path::new(&args.log_dir), &name) {
                tracing::warn!("Log retention check failed for {}: {}", name, e);
            }
        }
    }

    print_banner(&args);
    let addr = format!("{}:{}", args.host, args.port);

    let state = match AppState::new(args, Arc::new(TracingSink)) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!(
        "Repair grammars: {}",
        state.rules.grammar_names().join(", ")
    );

    let app = build_router(state);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("toolfix listening on {}", addr);
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!("Server error: {}", e);
    }
}
