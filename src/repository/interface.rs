use std::fmt::Debug;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::types::Json;

use crate::data_types::{
    DataTableId, DatasetId, FieldId, TableId, Timestamp, VersionId,
};
use crate::query::DataQuery;
use crate::synthesizer::RuntimeTable;

#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Eq)]
pub struct DatasetRecord {
    pub id: DatasetId,
    pub name: String,
    pub slug: String,
    pub description: String,
    pub author_name: String,
    pub author_url: Option<String>,
    pub code_url: String,
    pub license_name: String,
    pub license_url: String,
    pub source_name: String,
    pub source_url: String,
    pub show: bool,
}

#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Eq)]
pub struct VersionRecord {
    pub id: VersionId,
    pub dataset_id: DatasetId,
    pub name: String,
    pub collected_at: String,
    pub download_url: String,
    pub order: i64,
}

#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Eq)]
pub struct TableRecord {
    pub id: TableId,
    pub dataset_id: DatasetId,
    pub version_id: VersionId,
    pub name: String,
    pub default: bool,
    pub hidden: bool,
    pub ordering: Json<Vec<String>>,
    pub filtering: Json<Vec<String>>,
    pub search: Json<Vec<String>>,
    pub options: Option<Json<JsonValue>>,
    pub description: Option<String>,
    pub import_date: Option<String>,
}

#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Eq)]
pub struct FieldRecord {
    pub id: FieldId,
    pub dataset_id: DatasetId,
    pub version_id: Option<VersionId>,
    pub table_id: TableId,
    pub name: String,
    pub title: String,
    pub r#type: String,
    pub order: i64,
    pub nullable: bool,
    pub options: Option<Json<JsonValue>>,
    pub choices: Option<Json<JsonValue>>,
    pub description: Option<String>,
    pub link_template: Option<String>,
    pub has_choices: bool,
    pub frontend_filter: bool,
    pub obfuscate: bool,
    pub show: bool,
    pub show_on_frontend: bool,
}

/// One physical storage generation of a logical table. `table_id` goes NULL
/// when the logical table is deleted from the catalog, leaving the record
/// behind for physical cleanup.
#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Eq)]
pub struct DataTableRecord {
    pub id: DataTableId,
    pub table_id: Option<TableId>,
    pub db_table_name: String,
    pub created_at: Timestamp,
    pub active: bool,
}

#[derive(Debug, Default)]
pub struct NewDataset<'a> {
    pub name: &'a str,
    pub slug: &'a str,
    pub description: &'a str,
    pub author_name: &'a str,
    pub author_url: Option<&'a str>,
    pub code_url: &'a str,
    pub license_name: &'a str,
    pub license_url: &'a str,
    pub source_name: &'a str,
    pub source_url: &'a str,
    pub show: bool,
}

#[derive(Debug)]
pub struct NewVersion<'a> {
    pub dataset_id: DatasetId,
    pub name: &'a str,
    pub collected_at: &'a str,
    pub download_url: &'a str,
    pub order: i64,
}

#[derive(Debug)]
pub struct NewTable<'a> {
    pub dataset_id: DatasetId,
    pub version_id: VersionId,
    pub name: &'a str,
    pub default: bool,
    pub hidden: bool,
    pub ordering: Vec<String>,
    pub filtering: Vec<String>,
    pub search: Vec<String>,
    pub options: Option<JsonValue>,
}

#[derive(Debug)]
pub struct NewField<'a> {
    pub dataset_id: DatasetId,
    pub version_id: Option<VersionId>,
    pub table_id: TableId,
    pub name: &'a str,
    pub title: &'a str,
    pub r#type: &'a str,
    pub order: i64,
    pub nullable: bool,
    pub options: Option<JsonValue>,
    pub has_choices: bool,
    pub frontend_filter: bool,
    pub obfuscate: bool,
    pub show: bool,
    pub show_on_frontend: bool,
}

/// Wrapper for conversion of database-specific error codes into actual errors
#[derive(Debug)]
pub enum Error {
    UniqueConstraintViolation(sqlx::Error),
    FKConstraintViolation(sqlx::Error),
    /// The physical structure the statement targeted does not exist
    /// (dropped table / never materialized)
    MissingStructure(sqlx::Error),

    // All other errors
    SqlxError(sqlx::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[async_trait]
pub trait Repository: Send + Sync + Debug {
    async fn setup(&self);

    // Catalog records

    async fn create_dataset(&self, dataset: &NewDataset<'_>) -> Result<DatasetId>;

    async fn get_dataset(&self, dataset_id: DatasetId) -> Result<DatasetRecord>;

    async fn get_dataset_by_slug(&self, slug: &str) -> Result<DatasetRecord>;

    async fn list_datasets(&self) -> Result<Vec<DatasetRecord>>;

    async fn create_version(&self, version: &NewVersion<'_>) -> Result<VersionId>;

    async fn latest_version(
        &self,
        dataset_id: DatasetId,
    ) -> Result<Option<VersionRecord>>;

    async fn create_table(&self, table: &NewTable<'_>) -> Result<TableId>;

    async fn get_table(
        &self,
        dataset_slug: &str,
        table_name: &str,
        include_hidden: bool,
    ) -> Result<TableRecord>;

    async fn get_table_by_id(&self, table_id: TableId) -> Result<TableRecord>;

    async fn get_default_table(&self, dataset_slug: &str) -> Result<TableRecord>;

    async fn list_tables(
        &self,
        version_id: VersionId,
        include_hidden: bool,
    ) -> Result<Vec<TableRecord>>;

    /// Delete a logical table (fields cascade; generation records are kept,
    /// detached, for physical cleanup).
    async fn delete_table(&self, table_id: TableId) -> Result<()>;

    async fn create_field(&self, field: &NewField<'_>) -> Result<FieldId>;

    async fn list_fields(&self, table_id: TableId) -> Result<Vec<FieldRecord>>;

    async fn update_field_choices(
        &self,
        field_id: FieldId,
        choices: &JsonValue,
    ) -> Result<()>;

    // Physical generations

    async fn create_data_table(
        &self,
        table_id: TableId,
        db_table_name: &str,
    ) -> Result<DataTableRecord>;

    async fn get_data_table(&self, data_table_id: DataTableId)
        -> Result<DataTableRecord>;

    async fn active_data_table(
        &self,
        table_id: TableId,
    ) -> Result<Option<DataTableRecord>>;

    async fn most_recent_inactive_data_table(
        &self,
        table_id: TableId,
        exclude: DataTableId,
    ) -> Result<Option<DataTableRecord>>;

    async fn list_data_tables(&self, table_id: TableId) -> Result<Vec<DataTableRecord>>;

    /// Atomically deactivate the table's current active generation (if any)
    /// and activate `data_table_id` instead. Returns the previously active
    /// generation. Readers never observe zero or two active generations.
    async fn activate_data_table(
        &self,
        table_id: TableId,
        data_table_id: DataTableId,
    ) -> Result<Option<DataTableRecord>>;

    async fn set_data_table_inactive(&self, data_table_id: DataTableId) -> Result<()>;

    /// Delete a generation record. Guarded: refuses (with `RowNotFound`) when
    /// the record is active, so a concurrent activation cannot race a delete.
    async fn delete_data_table(&self, data_table_id: DataTableId) -> Result<()>;

    // Data plane over synthesized tables

    async fn create_physical_table(&self, runtime: &RuntimeTable) -> Result<()>;

    async fn drop_physical_table(&self, db_table_name: &str) -> Result<()>;

    async fn insert_rows(
        &self,
        runtime: &RuntimeTable,
        rows: &[JsonValue],
    ) -> Result<u64>;

    async fn fetch_rows(
        &self,
        query: &DataQuery,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<JsonValue>>;

    async fn count_rows(&self, query: &DataQuery) -> Result<i64>;

    /// Planner-statistics row estimate for an unconstrained count. `None`
    /// when the engine has no statistics for the table; negative values mean
    /// the statistics exist but were never populated.
    async fn approximate_row_count(&self, db_table_name: &str) -> Result<Option<i64>>;

    async fn distinct_values(
        &self,
        runtime: &RuntimeTable,
        field_name: &str,
    ) -> Result<Vec<String>>;

    async fn analyze_physical_table(&self, db_table_name: &str) -> Result<()>;
}
