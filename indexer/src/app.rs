use crate::cursor_store::{CursorStore, FileCursorStore};
use crate::ingest::{HttpSource, PasswordGrantAuthenticator};
use crate::model::{PersistOutcome, RecordKind, RunReport};
use crate::persist::Persister;
use crate::pipeline::{EngineSettings, SyncEngine};
use crate::store::Store;
use crate::window::Window;
use fleet_sync_core::config::{CursorBackend, DatabaseConfig};
use fleet_sync_core::{Config, Error, Result, SystemClock};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

pub async fn connect(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .connect(&config.url)
        .await?;
    Ok(pool)
}

/// Cursor slots for the configured backend. The database backend needs `store`.
pub fn cursor_store(config: &Config, store: Option<Arc<Store>>) -> Result<Arc<dyn CursorStore>> {
    match config.sync.cursor_backend {
        CursorBackend::File => Ok(Arc::new(FileCursorStore::new(config.sync.cursor_dir.clone()))),
        CursorBackend::Database => store
            .map(|store| store as Arc<dyn CursorStore>)
            .ok_or_else(|| Error::Config("database cursor backend requires a connection".into())),
    }
}

pub struct App {
    config: Config,
    engine: SyncEngine,
}

impl App {
    #[instrument(skip(config, pool))]
    pub async fn new(config: Config, pool: PgPool) -> Result<Self> {
        info!("Initializing application");

        let display_tz = config.sync.display_offset()?;

        let store = Arc::new(Store::new(pool));

        info!("Performing health checks");
        store.health_check().await?;

        let timeout = Duration::from_secs(config.api.request_timeout_secs);
        let source = HttpSource::new(&config.api)?;
        let auth = PasswordGrantAuthenticator::new(config.auth.clone(), timeout)?;
        let cursors = cursor_store(&config, Some(Arc::clone(&store)))?;
        let window = Window::from_config(&config.sync, Arc::new(SystemClock))?;

        info!(
            source = %config.api.base_url,
            organisation = %config.api.organisation_id,
            drain_mode = ?config.sync.drain_mode,
            cursor_backend = ?config.sync.cursor_backend,
            "Sync engine ready"
        );

        let engine = SyncEngine::new(
            Arc::new(source),
            Arc::new(auth),
            cursors,
            Persister::new(store, display_tz),
            window,
            EngineSettings::from(&config),
        );

        Ok(Self { config, engine })
    }

    pub async fn sync(&self, kinds: &[RecordKind]) -> Vec<(RecordKind, Result<RunReport>)> {
        self.engine.run_all(kinds).await
    }

    pub async fn sync_drivers(&self) -> Result<PersistOutcome> {
        self.engine.refresh_snapshot(RecordKind::Drivers).await
    }

    pub async fn watch(&self) -> Result<()> {
        let interval = Duration::from_secs(self.config.sync.poll_interval_secs);
        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        };
        self.engine
            .watch(&RecordKind::INCREMENTAL, interval, shutdown)
            .await
    }
}
