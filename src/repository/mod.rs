use std::sync::Arc;

use crate::config;

pub mod default;
pub mod interface;
#[cfg(feature = "catalog-postgres")]
pub mod postgres;
pub mod sqlite;

/// Initialize the catalog repository picked by the configuration, running
/// migrations on the way up.
pub async fn from_config(config: &config::PlatformConfig) -> Arc<dyn interface::Repository> {
    match &config.catalog {
        #[cfg(feature = "catalog-postgres")]
        config::Catalog::Postgres(config::Postgres { dsn, schema }) => Arc::new(
            postgres::PostgresRepository::try_new(dsn.to_string(), schema.to_string())
                .await
                .expect("Error setting up the database"),
        ),
        config::Catalog::Sqlite(config::Sqlite { dsn }) => Arc::new(
            sqlite::SqliteRepository::try_new(dsn.to_string())
                .await
                .expect("Error setting up the database"),
        ),
    }
}
