/// Catalog facade: typed lookups over the repository plus runtime-table
/// synthesis. Maps the repository's storage-level errors onto the domain
/// error taxonomy consumers are meant to match on.
use std::sync::Arc;

use serde_json::json;

use crate::config::PlatformConfig;
use crate::data_types::TableId;
use crate::fields::FieldType;
use crate::repository::interface::{
    DataTableRecord, DatasetRecord, Error as RepositoryError, FieldRecord, Repository,
    TableRecord,
};
use crate::synthesizer::{BehaviorRegistry, RuntimeTable, Synthesizer};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Dataset {slug:?} doesn't exist")]
    DatasetNotFound { slug: String },

    #[error("Table {name:?} doesn't exist")]
    TableNotFound { name: String },

    #[error("Field type {name:?} is not supported")]
    UnknownFieldType { name: String },

    #[error("Table {table:?} has no active generation")]
    NoActiveGeneration { table: String },

    #[error("Generation {name:?} is still active and can't be deleted")]
    ActiveGenerationDeletion { name: String },

    #[error("Generation {name:?} is no longer attached to a logical table")]
    DetachedGeneration { name: String },

    #[error("Error decoding field options: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    #[error("Catalog store error: {0}")]
    SqlxError(sqlx::Error),
}

pub type CatalogResult<T> = Result<T, CatalogError>;

impl From<RepositoryError> for CatalogError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::UniqueConstraintViolation(e)
            | RepositoryError::FKConstraintViolation(e)
            | RepositoryError::MissingStructure(e)
            | RepositoryError::SqlxError(e) => Self::SqlxError(e),
        }
    }
}

/// Turn a `RowNotFound` from a lookup into a typed not-found error.
fn not_found(
    error: RepositoryError,
    missing: impl FnOnce() -> CatalogError,
) -> CatalogError {
    match error {
        RepositoryError::SqlxError(sqlx::Error::RowNotFound) => missing(),
        other => other.into(),
    }
}

#[derive(Clone)]
pub struct Catalog {
    repository: Arc<dyn Repository>,
    synthesizer: Arc<Synthesizer>,
}

impl Catalog {
    pub fn new(repository: Arc<dyn Repository>, config: &PlatformConfig) -> Self {
        let synthesizer = Arc::new(Synthesizer::new(
            config.runtime.type_cache_capacity,
            BehaviorRegistry::new(config.behaviors.clone()),
        ));
        Self {
            repository,
            synthesizer,
        }
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    pub async fn get_dataset(&self, slug: &str) -> CatalogResult<DatasetRecord> {
        self.repository
            .get_dataset_by_slug(slug)
            .await
            .map_err(|e| {
                not_found(e, || CatalogError::DatasetNotFound {
                    slug: slug.to_string(),
                })
            })
    }

    pub async fn list_datasets(&self) -> CatalogResult<Vec<DatasetRecord>> {
        Ok(self.repository.list_datasets().await?)
    }

    /// Tables of the dataset's latest version. A dataset with no versions has
    /// no tables yet.
    pub async fn dataset_tables(
        &self,
        slug: &str,
        include_hidden: bool,
    ) -> CatalogResult<Vec<TableRecord>> {
        let dataset = self.get_dataset(slug).await?;
        match self.repository.latest_version(dataset.id).await? {
            Some(version) => Ok(self
                .repository
                .list_tables(version.id, include_hidden)
                .await?),
            None => Ok(vec![]),
        }
    }

    pub async fn get_table(
        &self,
        dataset_slug: &str,
        table_name: &str,
        include_hidden: bool,
    ) -> CatalogResult<TableRecord> {
        self.repository
            .get_table(dataset_slug, table_name, include_hidden)
            .await
            .map_err(|e| {
                not_found(e, || CatalogError::TableNotFound {
                    name: format!("{dataset_slug}/{table_name}"),
                })
            })
    }

    pub async fn get_default_table(
        &self,
        dataset_slug: &str,
    ) -> CatalogResult<TableRecord> {
        self.repository
            .get_default_table(dataset_slug)
            .await
            .map_err(|e| {
                not_found(e, || CatalogError::TableNotFound {
                    name: format!("{dataset_slug}/default"),
                })
            })
    }

    pub async fn table_fields(&self, table_id: TableId) -> CatalogResult<Vec<FieldRecord>> {
        Ok(self.repository.list_fields(table_id).await?)
    }

    /// Ordered (name, type) pairs for a table. Strict: a field whose type
    /// name is not in the registry fails the whole schema rather than
    /// degrading to text.
    pub async fn table_schema(
        &self,
        table: &TableRecord,
    ) -> CatalogResult<Vec<(String, FieldType)>> {
        self.table_fields(table.id)
            .await?
            .into_iter()
            .map(|field| {
                let field_type: FieldType = field.r#type.parse().map_err(|_| {
                    CatalogError::UnknownFieldType {
                        name: field.r#type.clone(),
                    }
                })?;
                Ok((field.name, field_type))
            })
            .collect()
    }

    /// Synthesize (or fetch from the registry) the runtime table bound to
    /// the currently active generation.
    pub async fn get_runtime_table(
        &self,
        dataset_slug: &str,
        table: &TableRecord,
        use_cache: bool,
    ) -> CatalogResult<Arc<RuntimeTable>> {
        let generation = self
            .repository
            .active_data_table(table.id)
            .await?
            .ok_or_else(|| CatalogError::NoActiveGeneration {
                table: format!("{dataset_slug}/{}", table.name),
            })?;
        self.runtime_for_generation(dataset_slug, table, &generation, use_cache)
            .await
    }

    /// Same as `get_runtime_table` but for an explicitly chosen generation
    /// (e.g. one not yet activated, being filled by an import).
    pub async fn runtime_for_generation(
        &self,
        dataset_slug: &str,
        table: &TableRecord,
        generation: &DataTableRecord,
        use_cache: bool,
    ) -> CatalogResult<Arc<RuntimeTable>> {
        let fields = self.table_fields(table.id).await?;
        self.synthesizer
            .synthesize(dataset_slug, table, &fields, generation, use_cache)
    }

    /// Declaration of the dataset's default table, as currently active.
    pub async fn model_declaration(&self, dataset_slug: &str) -> CatalogResult<String> {
        let table = self.get_default_table(dataset_slug).await?;
        let runtime = self.get_runtime_table(dataset_slug, &table, true).await?;
        Ok(crate::synthesizer::model_declaration(&runtime))
    }

    /// Recompute the stored value choices for every field flagged
    /// `frontend_filter`, from the distinct values currently in the active
    /// generation. Meant to run after an import.
    pub async fn refresh_field_choices(
        &self,
        runtime: &RuntimeTable,
        fields: &[FieldRecord],
    ) -> CatalogResult<()> {
        for field in fields {
            if !field.frontend_filter {
                continue;
            }
            let values = self
                .repository
                .distinct_values(runtime, &field.name)
                .await?;
            self.repository
                .update_field_choices(field.id, &json!({ "data": values }))
                .await?;
        }
        Ok(())
    }
}
