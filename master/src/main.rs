mod error;
mod handlers;
mod state;

use std::sync::Arc;

use anyhow::{Context, Result};
use common::{JobQueue, JobRepository, JobService, KvStore, Settings, SqliteStore};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("master=debug,common=debug,tower_http=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = Arc::new(Settings::from_env()?);
    std::fs::create_dir_all(&settings.storage_root).with_context(|| {
        format!(
            "no se pudo crear el storage root {}",
            settings.storage_root.display()
        )
    })?;

    // el store es compartido con los workers: mismo archivo sqlite
    let store: Arc<dyn KvStore> = Arc::new(
        SqliteStore::open(&settings.store_path)
            .with_context(|| format!("abriendo store {}", settings.store_path.display()))?,
    );

    let service = JobService::new(
        JobRepository::new(store.clone()),
        JobQueue::new(store),
        settings.clone(),
    );
    let app = handlers::build_router(AppState::new(service));

    let listener = TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("no se pudo escuchar en {}", settings.bind_addr))?;
    info!("master escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
