// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use extempore_genai::GeminiClient;
use extempore_server::{Gateway, WorkerPool, DEFAULT_NUM_WORKERS, DEFAULT_QUEUE_PER_WORKER};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "extempore", version, about = "An improvisational web server")]
struct CliArgs {
    /// Host address to listen on.
    #[arg(long, short = 'H', default_value = "localhost")]
    host: String,
    /// Port to listen on.
    #[arg(long, short = 'p', default_value_t = 8080)]
    port: u16,
    /// Base URL for absolute links in social cards (e.g. https://example.com).
    #[arg(long, default_value = "")]
    base_url: String,
    /// Location for generated HTML and images. Defaults to the user cache
    /// directory.
    #[arg(long)]
    content: Option<PathBuf>,
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .and_then(|v| match v.as_str() {
            "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
            "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if env_bool("EXTEMPORE_LOG_JSON", false) {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn default_content_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(env::temp_dir)
        .join("extempore")
}

async fn wait_for_shutdown_signal() -> Result<(), String> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| format!("failed to register SIGTERM handler: {e}"))?;
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| format!("failed to register SIGINT handler: {e}"))?;
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| format!("failed to register ctrl-c handler: {e}"))?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let cli = CliArgs::parse();
    init_tracing();

    let _ = dotenvy::from_filename(".env.local");

    let api_key = env::var("GEMINI_API_KEY").unwrap_or_default();
    if api_key.is_empty() {
        return Err(concat!(
            "GEMINI_API_KEY is not set. Set the environment variable or put it in ",
            ".env.local; keys are available free from https://aistudio.google.com/apikey."
        )
        .to_string());
    }

    let content_dir = cli.content.unwrap_or_else(default_content_dir);
    std::fs::create_dir_all(&content_dir).map_err(|e| {
        format!(
            "failed to create content directory {}: {e}",
            content_dir.display()
        )
    })?;

    let model = Arc::new(
        GeminiClient::new(api_key).map_err(|e| format!("failed to create model client: {e}"))?,
    );

    let num_workers = env_usize("EXTEMPORE_WORKERS", DEFAULT_NUM_WORKERS).max(1);
    let queue_per_worker = env_usize("EXTEMPORE_QUEUE_PER_WORKER", DEFAULT_QUEUE_PER_WORKER).max(1);
    let pool = Arc::new(WorkerPool::new(num_workers, num_workers * queue_per_worker));

    let gateway = Gateway::new(
        content_dir.clone(),
        cli.base_url.clone(),
        model,
        Arc::clone(&pool),
    );
    let app = gateway.router();

    let addr = format!("{}:{}", cli.host, cli.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("failed to bind {addr}: {e}"))?;

    info!("serving from {}", content_dir.display());
    info!("listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = wait_for_shutdown_signal().await {
                warn!("shutdown signal handler failed: {err}");
            }
        })
        .await
        .map_err(|e| format!("server failed: {e}"))?;

    // Let queued generations finish writing before exit.
    pool.close().await;
    Ok(())
}
