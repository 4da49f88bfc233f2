/// Dynamic table synthesizer: turns a logical table's catalog records plus a
/// chosen physical generation into a `RuntimeTable`, the runtime handle every
/// other component (DDL rendering, query composition, lifecycle) operates on.
use std::fmt::Write;
use std::sync::Arc;

use itertools::Itertools;
use moka::sync::Cache;
use strum_macros::Display;
use tracing::debug;

use crate::catalog::{CatalogError, CatalogResult};
use crate::config::TableBehavior;
use crate::data_types::TableId;
use crate::fields::{ColumnSpec, FieldType};
use crate::naming::make_index_name;
use crate::repository::interface::{DataTableRecord, FieldRecord, TableRecord};

/// Implicit full-text search column present on every synthesized table. It
/// stays empty when the table declares no `search` fields.
pub const SEARCH_COLUMN: &str = "search_data";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum IndexKind {
    Order,
    Filter,
    Search,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub name: String,
    pub kind: IndexKind,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeColumn {
    pub name: String,
    pub spec: ColumnSpec,
}

/// Synthesized runtime type for one (logical table, physical generation)
/// pair. Not persisted; rebuilt on demand and cached by the synthesizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeTable {
    pub table_id: TableId,
    pub db_table_name: String,
    pub columns: Vec<RuntimeColumn>,
    pub indexes: Vec<IndexDef>,
    /// Default sort order (entries may carry a `-` prefix for descending).
    pub ordering: Vec<String>,
    pub filtering: Vec<String>,
    pub search: Vec<String>,
    pub behavior: TableBehavior,
}

impl RuntimeTable {
    pub fn column(&self, name: &str) -> Option<&RuntimeColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_type(&self, name: &str) -> Option<FieldType> {
        self.column(name).map(|c| c.spec.field_type)
    }

    pub fn has_search(&self) -> bool {
        !self.search.is_empty()
    }
}

/// Closed registry of per-table behavioral overrides, built from
/// configuration at startup.
#[derive(Debug, Clone, Default)]
pub struct BehaviorRegistry {
    entries: Vec<TableBehavior>,
}

impl BehaviorRegistry {
    pub fn new(entries: Vec<TableBehavior>) -> Self {
        Self { entries }
    }

    pub fn lookup(&self, dataset_slug: &str, table_name: &str) -> TableBehavior {
        self.entries
            .iter()
            .find(|b| b.dataset == dataset_slug && b.table == table_name)
            .cloned()
            .unwrap_or_default()
    }
}

pub struct Synthesizer {
    /// Runtime-type registry keyed by (logical table id, physical name).
    /// Bounded: stale entries from rolled-over generations age out instead
    /// of accumulating for the process lifetime.
    registry: Cache<(TableId, String), Arc<RuntimeTable>>,
    behaviors: BehaviorRegistry,
}

impl Synthesizer {
    pub fn new(cache_capacity: u64, behaviors: BehaviorRegistry) -> Self {
        Self {
            registry: Cache::new(cache_capacity),
            behaviors,
        }
    }

    /// Build (or fetch from the registry) the runtime type for a logical
    /// table bound to the given physical generation.
    ///
    /// `use_cache = false` rebuilds and replaces the registry entry; callers
    /// pass it right after a generation change so a stale runtime type
    /// pointing at a retired physical table is not reused.
    pub fn synthesize(
        &self,
        dataset_slug: &str,
        table: &TableRecord,
        table_fields: &[FieldRecord],
        generation: &DataTableRecord,
        use_cache: bool,
    ) -> CatalogResult<Arc<RuntimeTable>> {
        let key = (table.id, generation.db_table_name.clone());
        if use_cache {
            if let Some(runtime) = self.registry.get(&key) {
                return Ok(runtime);
            }
        }

        let runtime = Arc::new(self.build(dataset_slug, table, table_fields, generation)?);
        debug!(
            table = %table.name,
            db_table = %generation.db_table_name,
            "synthesized runtime table"
        );
        self.registry.insert(key, runtime.clone());
        Ok(runtime)
    }

    fn build(
        &self,
        dataset_slug: &str,
        table: &TableRecord,
        table_fields: &[FieldRecord],
        generation: &DataTableRecord,
    ) -> CatalogResult<RuntimeTable> {
        let columns = table_fields
            .iter()
            .map(|field| {
                let field_type: FieldType = field.r#type.parse().map_err(|_| {
                    CatalogError::UnknownFieldType {
                        name: field.r#type.clone(),
                    }
                })?;
                let spec = ColumnSpec::new(
                    field_type,
                    field.options.as_deref(),
                    field.nullable,
                )?;
                Ok(RuntimeColumn {
                    name: field.name.clone(),
                    spec,
                })
            })
            .collect::<CatalogResult<Vec<_>>>()?;

        let db_table = &generation.db_table_name;
        let ordering = table.ordering.0.clone();
        let filtering = table.filtering.0.clone();
        let search = table.search.0.clone();

        let ordering_fields: Vec<String> = ordering
            .iter()
            .map(|f| f.trim_start_matches('-').to_string())
            .collect();

        let mut indexes = Vec::new();
        if !ordering_fields.is_empty() {
            let fields: Vec<&str> = ordering_fields.iter().map(String::as_str).collect();
            indexes.push(IndexDef {
                name: make_index_name(db_table, "order", &fields),
                kind: IndexKind::Order,
                fields: ordering_fields.clone(),
            });
        }
        for field_name in &filtering {
            // Already covered by a single-field ordering index
            if ordering_fields.len() == 1 && &ordering_fields[0] == field_name {
                continue;
            }
            indexes.push(IndexDef {
                name: make_index_name(db_table, "filter", &[field_name]),
                kind: IndexKind::Filter,
                fields: vec![field_name.clone()],
            });
        }
        if !search.is_empty() {
            indexes.push(IndexDef {
                name: make_index_name(db_table, "search", &[SEARCH_COLUMN]),
                kind: IndexKind::Search,
                fields: vec![SEARCH_COLUMN.to_string()],
            });
        }

        Ok(RuntimeTable {
            table_id: table.id,
            db_table_name: db_table.clone(),
            columns,
            indexes,
            ordering,
            filtering,
            search,
            behavior: self.behaviors.lookup(dataset_slug, &table.name),
        })
    }
}

/// Human-readable declaration of a synthesized schema, for documentation and
/// debugging. Not used by any runtime path.
pub fn model_declaration(runtime: &RuntimeTable) -> String {
    let mut out = String::new();
    writeln!(out, "table {} {{", runtime.db_table_name).unwrap();
    for column in &runtime.columns {
        let mut options = Vec::new();
        if let Some(max_length) = column.spec.options.max_length {
            options.push(format!("max_length={max_length}"));
        }
        if let Some(max_digits) = column.spec.options.max_digits {
            options.push(format!("max_digits={max_digits}"));
        }
        if let Some(decimal_places) = column.spec.options.decimal_places {
            options.push(format!("decimal_places={decimal_places}"));
        }
        let options = if options.is_empty() {
            String::new()
        } else {
            format!("({})", options.iter().join(", "))
        };
        let nullable = if column.spec.nullable { "null" } else { "not null" };
        writeln!(
            out,
            "    {}: {}{} {}",
            column.name, column.spec.field_type, options, nullable
        )
        .unwrap();
    }
    writeln!(out, "    {}: fulltext", SEARCH_COLUMN).unwrap();
    writeln!(out, "}}").unwrap();
    if !runtime.ordering.is_empty() {
        writeln!(out, "order by: {}", runtime.ordering.iter().join(", ")).unwrap();
    }
    for index in &runtime.indexes {
        writeln!(
            out,
            "index {} {} ({})",
            index.name,
            index.kind,
            index.fields.iter().join(", ")
        )
        .unwrap();
    }
    out
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::*;
    use super::*;

    fn test_synthesizer() -> Synthesizer {
        Synthesizer::new(16, BehaviorRegistry::default())
    }

    fn population_fixture() -> (TableRecord, Vec<FieldRecord>, DataTableRecord) {
        let table = table_record(
            7,
            "population",
            &["name"],
            &["state", "population"],
            &["name", "state"],
        );
        let fields = vec![
            field_record(7, "name", "string"),
            field_record(7, "state", "string"),
            field_record(7, "population", "integer"),
        ];
        let generation = generation_record(7, "data_cities_population_abcdefgh");
        (table, fields, generation)
    }

    #[test]
    fn test_synthesis_builds_expected_indexes() {
        let (table, fields, generation) = population_fixture();
        let runtime = test_synthesizer()
            .synthesize("cities", &table, &fields, &generation, true)
            .unwrap();

        let kinds: Vec<IndexKind> = runtime.indexes.iter().map(|i| i.kind).collect();
        assert_eq!(
            kinds,
            vec![IndexKind::Order, IndexKind::Filter, IndexKind::Filter, IndexKind::Search]
        );
        assert_eq!(runtime.indexes[0].fields, vec!["name"]);
        assert_eq!(runtime.indexes[3].fields, vec![SEARCH_COLUMN]);
        assert!(runtime.indexes.iter().all(|i| i.name.starts_with("idx_")));
        assert_eq!(runtime.db_table_name, "data_cities_population_abcdefgh");
        assert_eq!(runtime.columns.len(), 3);
    }

    #[test]
    fn test_synthesis_is_deterministic() {
        let (table, fields, generation) = population_fixture();
        let synthesizer = test_synthesizer();
        let a = synthesizer
            .synthesize("cities", &table, &fields, &generation, false)
            .unwrap();
        let b = synthesizer
            .synthesize("cities", &table, &fields, &generation, false)
            .unwrap();
        assert_eq!(a.indexes, b.indexes);
        assert_eq!(a.columns, b.columns);
    }

    #[test]
    fn test_filtering_index_skipped_when_covered_by_ordering() {
        let table = table_record(1, "t", &["state"], &["state", "year"], &[]);
        let fields = vec![
            field_record(1, "state", "string"),
            field_record(1, "year", "integer"),
        ];
        let generation = generation_record(1, "data_d_t_aaaaaaaa");
        let runtime = test_synthesizer()
            .synthesize("d", &table, &fields, &generation, true)
            .unwrap();

        // One ordering index on state, one filter index on year only, no
        // search index
        assert_eq!(runtime.indexes.len(), 2);
        assert_eq!(runtime.indexes[1].kind, IndexKind::Filter);
        assert_eq!(runtime.indexes[1].fields, vec!["year"]);
    }

    #[test]
    fn test_unknown_field_type_fails_synthesis() {
        let table = table_record(1, "t", &[], &[], &[]);
        let fields = vec![field_record(1, "ip", "inet")];
        let generation = generation_record(1, "data_d_t_aaaaaaaa");
        let result = test_synthesizer().synthesize("d", &table, &fields, &generation, true);

        assert!(matches!(
            result,
            Err(CatalogError::UnknownFieldType { name }) if name == "inet"
        ));
    }

    #[test]
    fn test_cache_reuse_and_bypass() {
        let (table, fields, generation) = population_fixture();
        let synthesizer = test_synthesizer();

        let cached = synthesizer
            .synthesize("cities", &table, &fields, &generation, true)
            .unwrap();
        let reused = synthesizer
            .synthesize("cities", &table, &fields, &generation, true)
            .unwrap();
        assert!(Arc::ptr_eq(&cached, &reused));

        let rebuilt = synthesizer
            .synthesize("cities", &table, &fields, &generation, false)
            .unwrap();
        assert!(!Arc::ptr_eq(&cached, &rebuilt));

        // The rebuild replaced the registry entry
        let reused = synthesizer
            .synthesize("cities", &table, &fields, &generation, true)
            .unwrap();
        assert!(Arc::ptr_eq(&rebuilt, &reused));
    }

    #[test]
    fn test_behavior_override_lookup() {
        let (table, fields, generation) = population_fixture();
        let behaviors = BehaviorRegistry::new(vec![TableBehavior {
            dataset: "cities".to_string(),
            table: "population".to_string(),
            search_language: "portuguese".to_string(),
            exact_count: true,
        }]);
        let synthesizer = Synthesizer::new(16, behaviors);

        let runtime = synthesizer
            .synthesize("cities", &table, &fields, &generation, true)
            .unwrap();
        assert_eq!(runtime.behavior.search_language, "portuguese");
        assert!(runtime.behavior.exact_count);

        // Unlisted pair falls back to the default behavior
        let other = table_record(8, "area", &[], &[], &[]);
        let runtime = synthesizer
            .synthesize("cities", &other, &[], &generation, true)
            .unwrap();
        assert_eq!(runtime.behavior, TableBehavior::default());
    }

    #[test]
    fn test_model_declaration() {
        let (table, fields, generation) = population_fixture();
        let runtime = test_synthesizer()
            .synthesize("cities", &table, &fields, &generation, true)
            .unwrap();

        let declaration = model_declaration(&runtime);
        assert!(declaration.contains("table data_cities_population_abcdefgh {"));
        assert!(declaration.contains("population: integer null"));
        assert!(declaration.contains("search_data: fulltext"));
        assert!(declaration.contains("order by: name"));
    }
}
