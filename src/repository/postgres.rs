use std::time::Duration;

use async_trait::async_trait;
use itertools::Itertools;
use serde_json::Value as JsonValue;
use sqlx::{
    migrate::{MigrateDatabase, Migrator},
    postgres::PgPoolOptions,
    types::Json,
    Executor, PgPool, Postgres, QueryBuilder, Row,
};

use crate::data_types::{DataTableId, DatasetId, FieldId, TableId, VersionId};
use crate::fields::{ColumnSpec, FieldType};
use crate::filters::FilterOp;
use crate::implement_repository;
use crate::naming::quote_ident;
use crate::query::{DataQuery, OrderKey};
use crate::synthesizer::{IndexKind, RuntimeColumn, RuntimeTable, SEARCH_COLUMN};

use super::{
    default::{
        json_text, search_language, RepositoryQueries, DATASET_QUERY, TABLE_COLUMNS,
    },
    interface::{
        DataTableRecord, DatasetRecord, Error, FieldRecord, NewDataset, NewField,
        NewTable, NewVersion, Repository, Result, TableRecord, VersionRecord,
    },
};

#[derive(Debug)]
pub struct PostgresRepository {
    pub executor: PgPool,
    pub schema_name: String,
}

impl PostgresRepository {
    pub const MIGRATOR: Migrator = sqlx::migrate!("migrations/postgres");
    pub const QUERIES: RepositoryQueries = RepositoryQueries {
        cast_timestamp: "CAST(EXTRACT(EPOCH FROM timestamp_column) AS INT8)",
        // current_schema() scopes the lookup to our search_path, so a table
        // with the same name in another schema doesn't shadow the estimate
        approximate_row_count: r#"SELECT CAST(c.reltuples AS TEXT) AS estimate
            FROM pg_class c
            INNER JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = current_schema() AND c.relname = "#,
        search_term_predicate: "search_data @@ plainto_tsquery('{language}', {})",
        search_term_rank:
            "CAST(ts_rank(search_data, plainto_tsquery('{language}', {})) AS FLOAT8)",
        search_vector: "to_tsvector('{language}', {})",
        search_column_type: "TSVECTOR",
        search_index: "CREATE INDEX index_name ON table_name USING GIN (search_data)",
        ilike: "ILIKE",
        pk_column: r#""id" BIGSERIAL PRIMARY KEY"#,
        analyze: "VACUUM ANALYZE table_name",
    };

    pub async fn try_new(
        dsn: String,
        schema_name: String,
    ) -> std::result::Result<Self, sqlx::Error> {
        if !Postgres::database_exists(&dsn).await? {
            let _ = Postgres::create_database(&dsn).await;
        }

        let repo = PostgresRepository::connect(dsn, schema_name.clone()).await?;

        repo.executor
            .execute(format!("CREATE SCHEMA IF NOT EXISTS {schema_name};").as_str())
            .await?;

        // Setup the schema
        repo.setup().await;
        Ok(repo)
    }

    pub async fn connect(
        dsn: String,
        schema_name: String,
    ) -> std::result::Result<Self, sqlx::Error> {
        let schema_name_2 = schema_name.clone();

        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(16)
            .idle_timeout(Duration::from_millis(30000))
            .test_before_acquire(true)
            .after_connect(move |c, _m| {
                let schema_name = schema_name.to_owned();
                Box::pin(async move {
                    let query = format!("SET search_path TO {schema_name},public;");
                    c.execute(sqlx::query(&query)).await?;
                    Ok(())
                })
            })
            .connect(&dsn)
            .await?;

        Ok(Self {
            executor: pool,
            schema_name: schema_name_2,
        })
    }

    pub fn interpret_error(error: sqlx::Error) -> Error {
        if let sqlx::Error::Database(ref d) = error {
            // Reference: https://www.postgresql.org/docs/current/errcodes-appendix.html
            if let Some(code) = d.code() {
                if code == "23505" {
                    return Error::UniqueConstraintViolation(error);
                } else if code == "23503" {
                    return Error::FKConstraintViolation(error);
                } else if code == "42P01" {
                    // undefined_table
                    return Error::MissingStructure(error);
                }
            }
        }
        Error::SqlxError(error)
    }

    pub fn sql_type(spec: &ColumnSpec) -> String {
        match spec.field_type {
            FieldType::String | FieldType::Email => {
                format!("VARCHAR({})", spec.options.max_length.unwrap_or(255))
            }
            FieldType::Integer => "BIGINT".to_string(),
            FieldType::Float => "DOUBLE PRECISION".to_string(),
            FieldType::Decimal => match (
                spec.options.max_digits,
                spec.options.decimal_places,
            ) {
                (Some(digits), Some(places)) => format!("NUMERIC({digits}, {places})"),
                _ => "NUMERIC".to_string(),
            },
            FieldType::Boolean => "BOOLEAN".to_string(),
            FieldType::Date => "DATE".to_string(),
            FieldType::DateTime => "TIMESTAMP".to_string(),
            FieldType::Binary => "BYTEA".to_string(),
            FieldType::Json => "JSONB".to_string(),
            FieldType::Text => "TEXT".to_string(),
        }
    }

    /// Text parameters need explicit casts into non-text columns; binaries
    /// arrive hex-encoded.
    pub fn value_template(field_type: FieldType) -> &'static str {
        match field_type {
            FieldType::Integer => "CAST({} AS INT8)",
            FieldType::Float => "CAST({} AS FLOAT8)",
            FieldType::Decimal => "CAST({} AS NUMERIC)",
            FieldType::Boolean => "CAST({} AS BOOLEAN)",
            FieldType::Date => "CAST({} AS DATE)",
            FieldType::DateTime => "CAST({} AS TIMESTAMP)",
            FieldType::Json => "CAST({} AS JSONB)",
            FieldType::Binary => "decode({}, 'hex')",
            _ => "{}",
        }
    }

    pub fn select_expr(column: &RuntimeColumn) -> String {
        let ident = quote_ident(&column.name);
        match column.spec.field_type {
            FieldType::Decimal
            | FieldType::Date
            | FieldType::DateTime
            | FieldType::Json => format!("CAST({ident} AS TEXT) AS {ident}"),
            FieldType::Binary => format!("encode({ident}, 'hex') AS {ident}"),
            _ => ident,
        }
    }
}

implement_repository!(PostgresRepository, Postgres);

pub mod testutils {
    use rand::Rng;

    use super::PostgresRepository;

    pub fn get_random_schema() -> String {
        let mut rng = rand::thread_rng();
        (&mut rng)
            .sample_iter(rand::distributions::Alphanumeric)
            .filter(|c| c.is_ascii_alphabetic())
            .take(20)
            .map(char::from)
            .collect::<String>()
    }

    pub async fn make_repository(dsn: &str) -> PostgresRepository {
        let schema_name = get_random_schema();

        PostgresRepository::try_new(dsn.to_string(), schema_name)
            .await
            .expect("Error setting up the database")
    }
}

#[cfg(test)]
mod tests {
    use std::{env, sync::Arc};

    use super::super::interface::tests::run_generic_repository_tests;
    use super::testutils::make_repository;

    #[tokio::test]
    async fn test_postgres_repository() {
        // Needs a running Postgres instance; skipped otherwise
        let Ok(dsn) = env::var("DATABASE_URL") else {
            return;
        };
        let repository = Arc::new(make_repository(&dsn).await);

        run_generic_repository_tests(repository).await;
    }
}
