use std::str::FromStr;

use async_trait::async_trait;
use itertools::Itertools;
use serde_json::Value as JsonValue;
use sqlx::{
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    types::Json,
    Pool, QueryBuilder, Row, Sqlite,
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
pub struct SqliteRepository {
    pub executor: Pool<Sqlite>,
}

impl SqliteRepository {
    pub const MIGRATOR: Migrator = sqlx::migrate!("migrations/sqlite");
    pub const QUERIES: RepositoryQueries = RepositoryQueries {
        cast_timestamp: "CAST(strftime('%s', timestamp_column) AS INTEGER)",
        // ANALYZE writes one row per index into sqlite_stat1; the row count
        // is the first number in `stat`
        approximate_row_count:
            "SELECT CAST(stat AS TEXT) AS estimate FROM sqlite_stat1 WHERE tbl = ",
        // Substring matching over the lowercased concatenated search text;
        // no tokenizer, so the `{language}` setting is ignored here
        search_term_predicate: "instr(search_data, {}) > 0",
        search_term_rank: "CAST((length(search_data) - length(replace(search_data, {}, ''))) / length({}) AS REAL)",
        search_vector: "{}",
        search_column_type: "TEXT",
        search_index: "CREATE INDEX index_name ON table_name (search_data)",
        // SQLite's LIKE is already case-insensitive for ASCII
        ilike: "LIKE",
        pk_column: r#""id" INTEGER PRIMARY KEY"#,
        analyze: "ANALYZE table_name",
    };

    pub async fn try_new(dsn: String) -> std::result::Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(&dsn)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let repo = Self { executor: pool };
        repo.setup().await;
        Ok(repo)
    }

    pub fn interpret_error(error: sqlx::Error) -> Error {
        if let sqlx::Error::Database(ref d) = error {
            // Reference: https://www.sqlite.org/rescode.html
            let message = d.message();

            // For some reason, sqlx doesn't return the proper errcode for FK violations,
            // even though it's calling sqlite3_extended_errcode which is meant to return full codes.
            // Unique constraint violations do return the correct code though.
            if message.contains("FOREIGN KEY constraint failed") {
                return Error::FKConstraintViolation(error);
            }
            if message.contains("UNIQUE constraint failed") {
                return Error::UniqueConstraintViolation(error);
            }
            if message.contains("no such table") {
                return Error::MissingStructure(error);
            }
        }
        Error::SqlxError(error)
    }

    pub fn sql_type(spec: &ColumnSpec) -> String {
        match spec.field_type {
            FieldType::Integer => "INTEGER",
            FieldType::Float => "REAL",
            // NUMERIC affinity keeps comparisons and sorting numeric
            FieldType::Decimal => "NUMERIC",
            FieldType::Boolean => "BOOLEAN",
            // Dates, JSON and hex-encoded binaries all travel as text
            _ => "TEXT",
        }
        .to_string()
    }

    pub fn value_template(_field_type: FieldType) -> &'static str {
        "{}"
    }

    pub fn select_expr(column: &RuntimeColumn) -> String {
        let ident = quote_ident(&column.name);
        match column.spec.field_type {
            FieldType::Decimal => format!("CAST({ident} AS TEXT) AS {ident}"),
            _ => ident,
        }
    }
}

implement_repository!(SqliteRepository, Sqlite);

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::super::interface::tests::run_generic_repository_tests;
    use super::{DataQuery, NewDataset, Repository, SqliteRepository};
    use crate::synthesizer::test_fixtures::{
        field_record, generation_record, table_record,
    };
    use crate::synthesizer::{BehaviorRegistry, Synthesizer};

    #[tokio::test]
    async fn test_sqlite_repository() {
        let repository = Arc::new(
            SqliteRepository::try_new("sqlite::memory:".to_string())
                .await
                .unwrap(),
        );

        run_generic_repository_tests(repository).await;
    }

    #[tokio::test]
    async fn test_sqlite_repository_on_disk() {
        // The on-disk variant exercises create_if_missing and WAL mode
        let temp_dir = tempfile::tempdir().unwrap();
        let dsn = temp_dir
            .path()
            .join("catalog.sqlite")
            .to_string_lossy()
            .to_string();

        let repository = SqliteRepository::try_new(dsn.clone()).await.unwrap();
        let id = repository
            .create_dataset(&NewDataset {
                name: "Gazettes",
                slug: "gazettes",
                ..Default::default()
            })
            .await
            .unwrap();
        drop(repository);

        // Reopen: the data survived
        let repository = SqliteRepository::try_new(dsn).await.unwrap();
        assert_eq!(
            repository.get_dataset_by_slug("gazettes").await.unwrap().id,
            id
        );
    }

    #[tokio::test]
    async fn test_undecodable_json_column_reads_as_null() {
        let repository = SqliteRepository::try_new("sqlite::memory:".to_string())
            .await
            .unwrap();

        let table = table_record(1, "payloads", &["name"], &[], &[]);
        let fields = vec![
            field_record(1, "name", "string"),
            field_record(1, "payload", "json"),
        ];
        let generation = generation_record(1, "data_d_payloads_aaaaaaaa");
        let runtime = Synthesizer::new(4, BehaviorRegistry::default())
            .synthesize("d", &table, &fields, &generation, true)
            .unwrap();
        repository.create_physical_table(&runtime).await.unwrap();

        // JSON travels as text on this backend, so a mangled value can land
        // in the column; reading it back degrades to null instead of failing
        // the whole fetch
        repository
            .insert_rows(&runtime, &[json!({"name": "a", "payload": "{not json"})])
            .await
            .unwrap();

        let query = DataQuery::new(runtime).apply_ordering(&[]);
        let rows = query.fetch(&repository, None, None).await.unwrap();
        assert_eq!(rows[0]["name"], json!("a"));
        assert_eq!(rows[0]["payload"], json!(null));
    }
}
