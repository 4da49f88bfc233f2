/// Query composition over a synthesized table: full-text search, whitelisted
/// filtering and ordering, and an approximate-then-exact count strategy.
///
/// A `DataQuery` only accumulates a description of the query; SQL rendering
/// and execution live in the repository, which knows the backend dialect.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::sync::OnceCell;

use crate::filters::{self, Filter};
use crate::repository::interface::{Repository, Result};
use crate::synthesizer::RuntimeTable;

/// Querystring keys understood by `from_querystring`; everything else is
/// treated as a (candidate) filter.
const ORDER_BY_KEY: &str = "order-by";
const SEARCH_KEY: &str = "search";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderKey {
    /// Relevance rank derived from the search predicate, always descending.
    Rank,
    Field {
        name: String,
        descending: bool,
    },
}

impl OrderKey {
    fn parse(raw: &str) -> Self {
        let descending = raw.starts_with('-');
        Self::Field {
            name: raw.trim_start_matches('-').trim().to_lowercase(),
            descending,
        }
    }
}

pub struct DataQuery {
    runtime: Arc<RuntimeTable>,
    filters: Vec<Filter>,
    terms: BTreeSet<String>,
    order: Vec<OrderKey>,
    count: OnceCell<i64>,
}

impl DataQuery {
    pub fn new(runtime: Arc<RuntimeTable>) -> Self {
        Self {
            runtime,
            filters: Vec::new(),
            terms: BTreeSet::new(),
            order: Vec::new(),
            count: OnceCell::new(),
        }
    }

    /// Apply search, filters and ordering in that fixed order: search
    /// introduces the rank sort key the others build on top of, and ordering
    /// falls back to the table default only after everything else accepted
    /// or rejected its fields.
    pub fn composed_query(
        runtime: Arc<RuntimeTable>,
        filter_query: &BTreeMap<String, String>,
        search_query: &str,
        order_by: &[String],
    ) -> Self {
        Self::new(runtime)
            .search(search_query)
            .apply_filters(filter_query)
            .apply_ordering(order_by)
    }

    /// Build a query straight from querystring pairs: `search` and
    /// `order-by` (comma-separated, `-` prefix for descending) are pulled
    /// out, the rest is treated as a filter map.
    pub fn from_querystring(runtime: Arc<RuntimeTable>, pairs: &[(String, String)]) -> Self {
        let mut search_query = String::new();
        let mut order_by = Vec::new();
        let mut filter_query = BTreeMap::new();

        for (key, value) in pairs {
            match key.as_str() {
                SEARCH_KEY => search_query = value.clone(),
                ORDER_BY_KEY => {
                    order_by = value
                        .split(',')
                        .map(|f| f.trim().to_lowercase())
                        .filter(|f| !f.is_empty())
                        .collect()
                }
                _ if !value.is_empty() => {
                    filter_query.insert(key.clone(), value.clone());
                }
                _ => {}
            }
        }

        Self::composed_query(runtime, &filter_query, &search_query, &order_by)
    }

    /// Full-text search. Terms are whitespace-split and de-duplicated:
    /// repeating a word neither narrows the predicate nor boosts the rank,
    /// trading ranking completeness for a deterministic, order-independent
    /// term set.
    pub fn search(mut self, search_query: &str) -> Self {
        if self.runtime.search.is_empty() {
            return self;
        }
        let terms: BTreeSet<String> = search_query
            .split_whitespace()
            .map(str::to_lowercase)
            .collect();
        if terms.is_empty() {
            return self;
        }
        self.terms.extend(terms);
        if !self.order.contains(&OrderKey::Rank) {
            self.order.push(OrderKey::Rank);
        }
        self
    }

    pub fn apply_filters(mut self, filter_query: &BTreeMap<String, String>) -> Self {
        self.filters
            .extend(filters::process(filter_query, &self.runtime.filtering));
        self
    }

    /// Whitelisted dynamic ordering: requested fields must appear in the
    /// table's declared `ordering` or `filtering` lists (those are the
    /// indexed ones). Accepted fields APPEND to any ordering already present
    /// (e.g. the search rank); an empty intersection falls back to the
    /// table's default ordering.
    pub fn apply_ordering(mut self, order_by: &[String]) -> Self {
        let allowed: BTreeSet<String> = self
            .runtime
            .ordering
            .iter()
            .chain(self.runtime.filtering.iter())
            .map(|f| f.trim_start_matches('-').trim().to_lowercase())
            .collect();

        let accepted: Vec<OrderKey> = order_by
            .iter()
            .map(|raw| OrderKey::parse(raw))
            .filter(|key| match key {
                OrderKey::Field { name, .. } => allowed.contains(name),
                OrderKey::Rank => false,
            })
            .collect();

        if !accepted.is_empty() {
            self.order.extend(accepted);
        } else {
            self.order
                .extend(self.runtime.ordering.iter().map(|raw| OrderKey::parse(raw)));
        }
        self
    }

    pub fn runtime(&self) -> &Arc<RuntimeTable> {
        &self.runtime
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn terms(&self) -> &BTreeSet<String> {
        &self.terms
    }

    pub fn order_keys(&self) -> &[OrderKey] {
        &self.order
    }

    pub fn has_predicates(&self) -> bool {
        !self.filters.is_empty() || !self.terms.is_empty()
    }

    pub async fn fetch(
        &self,
        repository: &dyn Repository,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<JsonValue>> {
        repository.fetch_rows(self, limit, offset).await
    }

    /// Row count, cached per query instance.
    ///
    /// An unconstrained query first tries the storage engine's planner
    /// statistics, trading exactness for latency on large listings; stale,
    /// absent or negative statistics fall back to the exact count. Any
    /// predicate forces the exact path.
    pub async fn count(&self, repository: &dyn Repository) -> Result<i64> {
        self.count
            .get_or_try_init(|| async {
                if !self.has_predicates() && !self.runtime.behavior.exact_count {
                    if let Ok(Some(estimate)) = repository
                        .approximate_row_count(&self.runtime.db_table_name)
                        .await
                    {
                        if estimate >= 0 {
                            return Ok(estimate);
                        }
                    }
                }
                repository.count_rows(self).await
            })
            .await
            .copied()
    }
}
