mod api;
mod artifact_store;
mod bundle;
mod config;
mod error;
mod glyph_cache;
mod manager;
mod models;
mod pipeline;
mod preprocess;
mod tools;

use std::sync::Arc;

use anyhow::Result;
use config::Config;
use glyph_cache::{GlyphCache, HttpGlyphFetcher};
use manager::JobManager;
use pipeline::PipelineContext;
use preprocess::Preprocessor;
use tools::ExternalTools;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub manager: JobManager,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "notes_convert_api=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    artifact_store::ensure_dir(&config.work_root).await?;
    artifact_store::ensure_dir(&config.glyph_cache_dir).await?;

    let fetcher = HttpGlyphFetcher::new(config.glyph_base_url.clone(), config.glyph_fetch_timeout())?;
    let ctx = PipelineContext {
        preprocessor: Preprocessor::new(
            GlyphCache::new(config.glyph_cache_dir.clone(), Arc::new(fetcher)),
            config.glyph_size.clone(),
        ),
        tools: Arc::new(ExternalTools::from_config(&config)),
    };

    let manager = JobManager::start(config.clone(), ctx);
    manager::spawn_cleanup_worker(manager.clone(), config.cleanup_interval_seconds);

    info!(
        concurrency = config.concurrency_limit,
        work_root = %config.work_root.display(),
        artifact_retention_seconds = config.artifact_retention_seconds,
        record_retention_seconds = config.record_retention_seconds,
        "Conversion service configured"
    );

    let app = api::router(AppState {
        config: config.clone(),
        manager,
    });

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("notes-convert-api listening on {}", config.bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
