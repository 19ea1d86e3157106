use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use web_extract_agent::agent::{Agent, AgentSettings};
use web_extract_agent::brain::Brain;
use web_extract_agent::config::Config;
use web_extract_agent::hands::ChromeLauncher;
use web_extract_agent::screenshots::{DirectorySink, NullSink, ScreenshotSink};
use web_extract_agent::server::{AppState, RateLimiter, router};
use web_extract_agent::session::SessionRegistry;
use web_extract_agent::store::SqliteJobStore;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,web_extract_agent=debug")),
        )
        .init();

    let config = Config::parse();

    // 1. Job store
    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let store = Arc::new(SqliteJobStore::new(&db_path)?);
    tracing::info!(path = %db_path.display(), "job store ready");

    // 2. Model and screenshot sink
    let brain = Arc::new(Brain::new(config.model_config())?);
    let screenshots: Arc<dyn ScreenshotSink> = if config.no_screenshots {
        Arc::new(NullSink)
    } else {
        Arc::new(DirectorySink::new(config.screenshot_root()))
    };

    // 3. Browser sessions are launched lazily on the first request
    let launcher = Arc::new(ChromeLauncher::new(config.chrome_options()));
    let sessions = Arc::new(SessionRegistry::new(launcher, config.keep_alive()));

    let settings = AgentSettings {
        session_key: config.session_key.clone(),
        policy: config.turn_policy(),
        ..AgentSettings::default()
    };
    let agent = Arc::new(Agent::new(
        brain,
        store,
        screenshots,
        sessions.clone(),
        settings,
    ));

    let app = router(AppState {
        agent,
        limiter: Arc::new(RateLimiter::per_minute(config.rate_limit)),
    });

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Could not bind to {}", config.listen))?;
    tracing::info!("listening on http://{}", config.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    sessions.shutdown().await;
    Ok(())
}
