//! Database wiring: connection pool, embedded migrations and store handles.

use sqlx::PgPool;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, instrument};

use crate::checkpoint::PostgresCheckpointStore;
use crate::config::DbConfig;
use crate::event_store::postgres::map_sqlx_error;
use crate::event_store::{EventStoreError, PostgresEventStore, ReadPolicy};
use crate::idempotency::PostgresIdempotencyStore;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Shared Postgres pool plus constructors for every Postgres-backed store.
#[derive(Debug, Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    #[instrument(skip_all, fields(max_connections = config.max_connections), err)]
    pub async fn connect(config: &DbConfig) -> Result<Self, EventStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        info!("connected to postgres");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded migrations (idempotent).
    pub async fn run_migrations(&self) -> Result<(), EventStoreError> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| EventStoreError::Storage(format!("migrations failed: {e}")))?;
        info!("migrations applied");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), EventStoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("health_check", e))?;
        Ok(())
    }

    pub fn event_store(&self, read_policy: ReadPolicy) -> PostgresEventStore {
        PostgresEventStore::new(self.pool.clone()).with_read_policy(read_policy)
    }

    pub fn idempotency_store(&self) -> PostgresIdempotencyStore {
        PostgresIdempotencyStore::new(self.pool.clone())
    }

    pub fn checkpoint_store(&self) -> PostgresCheckpointStore {
        PostgresCheckpointStore::new(self.pool.clone())
    }
}
