//! Process-wide store handle.
//!
//! With the `database` feature the configured SQLite database backs the
//! engine; without it, or when no database is configured, state lives in an
//! [`InMemoryStore`] for the life of the process.

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use crate::config::DossierFlowConfig;
use crate::store::{DossierStore, InMemoryStore};

#[cfg(feature = "database")]
use crate::store::sqlite::SqliteStore;

#[cfg(feature = "database")]
static DB_STORE: std::sync::LazyLock<tokio::sync::RwLock<Option<Arc<SqliteStore>>>> =
    std::sync::LazyLock::new(|| tokio::sync::RwLock::new(None));

/// Opens the store described by `config`.
#[cfg(feature = "database")]
pub async fn open_store(config: &DossierFlowConfig) -> Result<Arc<dyn DossierStore>> {
    match &config.database {
        Some(db_config) => {
            info!("Opening database at {}", db_config.url);
            let store = SqliteStore::connect(
                &db_config.url,
                db_config.max_connections,
                db_config.auto_migrate,
            )
            .await?;
            Ok(Arc::new(store))
        }
        None => {
            info!("Database not configured, using in-memory store");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

#[cfg(not(feature = "database"))]
pub async fn open_store(_config: &DossierFlowConfig) -> Result<Arc<dyn DossierStore>> {
    info!("Database feature not enabled, using in-memory store");
    Ok(Arc::new(InMemoryStore::new()))
}

#[cfg(feature = "database")]
/// Connect the global database handle and run migrations
pub async fn init_database() -> Result<()> {
    let config = crate::config::config()?;

    if let Some(db_config) = &config.database {
        info!("Initializing database at {}", db_config.url);

        let store = SqliteStore::connect(
            &db_config.url,
            db_config.max_connections,
            db_config.auto_migrate,
        )
        .await?;

        let mut guard = DB_STORE.write().await;
        *guard = Some(Arc::new(store));

        info!("Database initialized successfully");
    } else {
        info!("Database not configured, skipping initialization");
    }

    Ok(())
}

#[cfg(feature = "database")]
/// Shutdown database connections
pub async fn shutdown_database() {
    let guard = DB_STORE.read().await;
    if let Some(store) = guard.as_ref() {
        store.shutdown().await;
    }
}

// Stub implementations for when database feature is not enabled
#[cfg(not(feature = "database"))]
pub async fn init_database() -> Result<()> {
    info!("Database feature not enabled, skipping database initialization");
    Ok(())
}

#[cfg(not(feature = "database"))]
pub async fn shutdown_database() {
    info!("Database feature not enabled, no database to shutdown");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UserId;

    #[tokio::test]
    async fn test_open_store_without_database_is_in_memory() {
        let mut config = DossierFlowConfig::default();
        config.database = None;

        let store = open_store(&config).await.unwrap();
        assert!(store
            .get_client_profile(&UserId::from("c1"))
            .await
            .unwrap()
            .is_none());
    }
}
