/// Generation lifecycle: allocating, activating, retiring and deleting the
/// physical generations backing a logical table.
///
/// The catalog transition (exactly one active generation per table) happens
/// in a single repository transaction; physical drops and cache invalidation
/// follow it, tolerating structures that are already gone.
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::catalog::{CatalogError, CatalogResult};
use crate::data_types::TableId;
use crate::naming;
use crate::repository::interface::{
    DataTableRecord, Error as RepositoryError, Repository, TableRecord,
};
use crate::synthesizer::RuntimeTable;

/// Hook for invalidating externally cached query results when the data
/// behind a physical table changes or disappears.
#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn invalidate(&self, physical_table: &str);
}

#[derive(Debug, Default)]
pub struct NoopResultCache;

#[async_trait]
impl ResultCache for NoopResultCache {
    async fn invalidate(&self, _physical_table: &str) {}
}

pub struct GenerationManager {
    repository: Arc<dyn Repository>,
    result_cache: Arc<dyn ResultCache>,
}

impl GenerationManager {
    pub fn new(
        repository: Arc<dyn Repository>,
        result_cache: Arc<dyn ResultCache>,
    ) -> Self {
        Self {
            repository,
            result_cache,
        }
    }

    /// Allocate a generation record with a fresh randomized physical name.
    /// The physical table itself is created separately, once the caller has
    /// a synthesized runtime for it.
    pub async fn create_generation(
        &self,
        dataset_slug: &str,
        table: &TableRecord,
    ) -> CatalogResult<DataTableRecord> {
        let db_table_name = naming::physical_table_name(dataset_slug, &table.name);
        let generation = self
            .repository
            .create_data_table(table.id, &db_table_name)
            .await?;
        debug!(
            table = %table.name,
            db_table = %db_table_name,
            "allocated generation"
        );
        Ok(generation)
    }

    pub async fn create_physical_table(
        &self,
        runtime: &RuntimeTable,
    ) -> CatalogResult<()> {
        self.repository.create_physical_table(runtime).await?;
        Ok(())
    }

    /// Make this generation the table's active one, retiring whichever was
    /// active before. With `drop_previous`, the retired generation's physical
    /// table is dropped (its record stays behind as a tombstone). Returns the
    /// previously active generation.
    pub async fn activate(
        &self,
        generation: &DataTableRecord,
        drop_previous: bool,
    ) -> CatalogResult<Option<DataTableRecord>> {
        let table_id = self.attached_table_id(generation)?;
        let previous = self
            .repository
            .activate_data_table(table_id, generation.id)
            .await?;
        info!(
            table_id,
            db_table = %generation.db_table_name,
            "activated generation"
        );
        self.result_cache.invalidate(&generation.db_table_name).await;

        if let Some(previous) = &previous {
            self.result_cache.invalidate(&previous.db_table_name).await;
            if drop_previous && previous.id != generation.id {
                self.drop_physical_structure(&previous.db_table_name).await?;
            }
        }
        Ok(previous)
    }

    /// Retire a generation. With `activate_most_recent`, retiring the active
    /// generation promotes the most recently created inactive one in its
    /// place (returned when that happens).
    pub async fn deactivate(
        &self,
        generation: &DataTableRecord,
        drop_table: bool,
        activate_most_recent: bool,
    ) -> CatalogResult<Option<DataTableRecord>> {
        let table_id = self.attached_table_id(generation)?;
        let was_active = self.repository.get_data_table(generation.id).await?.active;

        self.repository.set_data_table_inactive(generation.id).await?;
        info!(
            table_id,
            db_table = %generation.db_table_name,
            "deactivated generation"
        );
        self.result_cache.invalidate(&generation.db_table_name).await;
        if drop_table {
            self.drop_physical_structure(&generation.db_table_name).await?;
        }

        if was_active && activate_most_recent {
            if let Some(candidate) = self
                .repository
                .most_recent_inactive_data_table(table_id, generation.id)
                .await?
            {
                self.repository
                    .activate_data_table(table_id, candidate.id)
                    .await?;
                info!(
                    table_id,
                    db_table = %candidate.db_table_name,
                    "promoted previous generation"
                );
                self.result_cache.invalidate(&candidate.db_table_name).await;
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// Delete a generation record and its physical table. Refuses for the
    /// active generation; a generation must be retired first.
    pub async fn delete_generation(
        &self,
        generation: &DataTableRecord,
    ) -> CatalogResult<()> {
        let record = self.repository.get_data_table(generation.id).await?;
        if record.active {
            return Err(CatalogError::ActiveGenerationDeletion {
                name: record.db_table_name,
            });
        }
        self.repository.delete_data_table(record.id).await?;
        self.drop_physical_structure(&record.db_table_name).await?;
        self.result_cache.invalidate(&record.db_table_name).await;
        Ok(())
    }

    /// Delete a logical table: every generation is retired and its physical
    /// table dropped, then the catalog record goes away. Generation records
    /// survive, detached, so operators can audit what was dropped.
    pub async fn delete_table(&self, table: &TableRecord) -> CatalogResult<()> {
        for generation in self.repository.list_data_tables(table.id).await? {
            if generation.active {
                self.repository
                    .set_data_table_inactive(generation.id)
                    .await?;
            }
            self.drop_physical_structure(&generation.db_table_name).await?;
            self.result_cache.invalidate(&generation.db_table_name).await;
        }
        self.repository.delete_table(table.id).await?;
        info!(table_id = table.id, table = %table.name, "deleted logical table");
        Ok(())
    }

    fn attached_table_id(&self, generation: &DataTableRecord) -> CatalogResult<TableId> {
        generation
            .table_id
            .ok_or_else(|| CatalogError::DetachedGeneration {
                name: generation.db_table_name.clone(),
            })
    }

    /// Physical drops are tolerant: a structure that's already gone (never
    /// materialized, or dropped by an earlier pass) is not an error.
    async fn drop_physical_structure(&self, db_table_name: &str) -> CatalogResult<()> {
        match self.repository.drop_physical_table(db_table_name).await {
            Ok(()) => Ok(()),
            Err(RepositoryError::MissingStructure(_)) => {
                debug!(db_table = %db_table_name, "physical table already gone");
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::repository::interface::{NewDataset, NewField, NewTable, NewVersion};
    use crate::repository::sqlite::SqliteRepository;
    use crate::synthesizer::{BehaviorRegistry, Synthesizer};

    #[derive(Debug, Default)]
    struct RecordingCache {
        invalidated: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ResultCache for RecordingCache {
        async fn invalidate(&self, physical_table: &str) {
            self.invalidated
                .lock()
                .unwrap()
                .push(physical_table.to_string());
        }
    }

    struct Fixture {
        repository: Arc<dyn Repository>,
        cache: Arc<RecordingCache>,
        manager: GenerationManager,
        table: TableRecord,
        synthesizer: Synthesizer,
    }

    impl Fixture {
        async fn new() -> Self {
            let repository: Arc<dyn Repository> = Arc::new(
                SqliteRepository::try_new("sqlite::memory:".to_string())
                    .await
                    .unwrap(),
            );
            let cache = Arc::new(RecordingCache::default());
            let manager = GenerationManager::new(repository.clone(), cache.clone());

            let dataset_id = repository
                .create_dataset(&NewDataset {
                    name: "Cities",
                    slug: "cities",
                    ..Default::default()
                })
                .await
                .unwrap();
            let version_id = repository
                .create_version(&NewVersion {
                    dataset_id,
                    name: "1",
                    collected_at: "2020-01-01",
                    download_url: "",
                    order: 1,
                })
                .await
                .unwrap();
            let table_id = repository
                .create_table(&NewTable {
                    dataset_id,
                    version_id,
                    name: "population",
                    default: true,
                    hidden: false,
                    ordering: vec!["name".to_string()],
                    filtering: vec![],
                    search: vec![],
                    options: None,
                })
                .await
                .unwrap();
            repository
                .create_field(&NewField {
                    dataset_id,
                    version_id: Some(version_id),
                    table_id,
                    name: "name",
                    title: "Name",
                    r#type: "string",
                    order: 0,
                    nullable: false,
                    options: None,
                    has_choices: false,
                    frontend_filter: false,
                    obfuscate: false,
                    show: true,
                    show_on_frontend: true,
                })
                .await
                .unwrap();
            let table = repository.get_table_by_id(table_id).await.unwrap();

            Self {
                repository,
                cache,
                manager,
                table,
                synthesizer: Synthesizer::new(16, BehaviorRegistry::default()),
            }
        }

        /// Allocate a generation and materialize its physical table.
        async fn materialized_generation(&self) -> DataTableRecord {
            let generation = self
                .manager
                .create_generation("cities", &self.table)
                .await
                .unwrap();
            let fields = self.repository.list_fields(self.table.id).await.unwrap();
            let runtime = self
                .synthesizer
                .synthesize("cities", &self.table, &fields, &generation, false)
                .unwrap();
            self.manager.create_physical_table(&runtime).await.unwrap();
            generation
        }

        fn invalidated(&self) -> Vec<String> {
            self.cache.invalidated.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn test_rollover_with_tolerant_drop() {
        let fixture = Fixture::new().await;

        let g1 = fixture.materialized_generation().await;
        assert!(g1.db_table_name.starts_with("data_cities_population_"));
        assert_eq!(fixture.manager.activate(&g1, false).await.unwrap(), None);

        let g2 = fixture.materialized_generation().await;
        let previous = fixture.manager.activate(&g2, true).await.unwrap();
        assert_eq!(previous.map(|g| g.id), Some(g1.id));

        // g1's physical table was dropped, its record remains as a tombstone
        assert!(matches!(
            fixture
                .repository
                .drop_physical_table(&g1.db_table_name)
                .await
                .unwrap_err(),
            RepositoryError::MissingStructure(_)
        ));
        let g1 = fixture.repository.get_data_table(g1.id).await.unwrap();
        assert!(!g1.active);

        // Re-activating g1 tolerates the missing structure too
        fixture.manager.activate(&g1, false).await.unwrap();
        assert!(fixture.invalidated().contains(&g2.db_table_name));
        assert!(fixture.invalidated().contains(&g1.db_table_name));
    }

    #[tokio::test]
    async fn test_active_generation_cannot_be_deleted() {
        let fixture = Fixture::new().await;
        let generation = fixture.materialized_generation().await;
        fixture.manager.activate(&generation, false).await.unwrap();

        assert!(matches!(
            fixture
                .manager
                .delete_generation(&generation)
                .await
                .unwrap_err(),
            CatalogError::ActiveGenerationDeletion { .. }
        ));

        fixture
            .manager
            .deactivate(&generation, false, false)
            .await
            .unwrap();
        fixture.manager.delete_generation(&generation).await.unwrap();
        assert!(fixture
            .repository
            .list_data_tables(fixture.table.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_deactivation_promotes_most_recent() {
        let fixture = Fixture::new().await;
        let g1 = fixture.materialized_generation().await;
        fixture.manager.activate(&g1, false).await.unwrap();
        let g2 = fixture.materialized_generation().await;
        fixture.manager.activate(&g2, false).await.unwrap();

        let promoted = fixture
            .manager
            .deactivate(&g2, true, true)
            .await
            .unwrap();
        assert_eq!(promoted.map(|g| g.id), Some(g1.id));
        assert_eq!(
            fixture
                .repository
                .active_data_table(fixture.table.id)
                .await
                .unwrap()
                .map(|g| g.id),
            Some(g1.id)
        );

        // Deactivating an inactive generation promotes nothing
        assert_eq!(
            fixture.manager.deactivate(&g2, false, true).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_delete_table_detaches_generations() {
        let fixture = Fixture::new().await;
        let generation = fixture.materialized_generation().await;
        fixture.manager.activate(&generation, false).await.unwrap();

        fixture.manager.delete_table(&fixture.table).await.unwrap();

        // The generation record survives, detached from the deleted table
        let detached = fixture
            .repository
            .get_data_table(generation.id)
            .await
            .unwrap();
        assert_eq!(detached.table_id, None);
        assert!(matches!(
            fixture.manager.activate(&detached, false).await.unwrap_err(),
            CatalogError::DetachedGeneration { .. }
        ));
    }
}
