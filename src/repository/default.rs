/// Default implementation for a Repository that factors out common
/// query patterns / SQL queries between Postgres and SQLite.
///
/// Usage:
///
/// The struct has to have certain fields and inherent items, since this macro
/// relies on them:
///
/// ```ignore
/// pub struct MyRepository {
///     pub executor: sqlx::Pool<sqlx::SqlxDatabaseType>
/// }
///
/// impl MyRepository {
///     pub const MIGRATOR: sqlx::Migrator = sqlx::migrate!("my/migrations");
///     pub const QUERIES: RepositoryQueries = RepositoryQueries {
///         cast_timestamp: "CAST(...)",
///         // ...
///     };
///     pub fn interpret_error(error: sqlx::Error) -> Error {
///         // Interpret the database-specific error code and turn some sqlx errors
///         // into the Error enum values like UniqueConstraintViolation/FKConstraintViolation
///         // ...
///     }
///     pub fn sql_type(spec: &ColumnSpec) -> String { /* ... */ }
///     pub fn value_template(field_type: FieldType) -> &'static str { /* ... */ }
///     pub fn select_expr(column: &RuntimeColumn) -> String { /* ... */ }
/// }
///
/// implement_repository!(SqliteRepository, Sqlite)
/// ```
///
/// Gigajank alert: why are we doing this? The code between PG and SQLite is
/// extremely similar, but a generic implementation over any `sqlx::Database`
/// needs a wall of `where` clauses on the query/argument/row types and still
/// trips the borrow checker when a `QueryBuilder` is involved
/// (https://github.com/launchbadge/sqlx/issues/1978), and `Pool<Any>` hits the
/// same error. A macro keeps every method written exactly once, at the cost of
/// compile-time query checking (which dynamic DDL rules out anyway).

/// Queries and SQL fragments that are different between SQLite and PG
pub struct RepositoryQueries {
    /// Expression converting `timestamp_column` to epoch seconds.
    pub cast_timestamp: &'static str,
    /// Planner-statistics row estimate, as text; the physical table name is
    /// bound right after this prefix.
    pub approximate_row_count: &'static str,
    /// Full-text predicate for a single term (`{}` binds the term).
    pub search_term_predicate: &'static str,
    /// Per-term relevance expression (`{}` binds the term); terms are summed.
    pub search_term_rank: &'static str,
    /// Wraps the concatenated search text on insert.
    pub search_vector: &'static str,
    pub search_column_type: &'static str,
    /// Index DDL for the search column (`index_name`/`table_name`
    /// placeholders).
    pub search_index: &'static str,
    /// Case-insensitive LIKE operator.
    pub ilike: &'static str,
    /// Synthetic primary key column definition for physical tables.
    pub pk_column: &'static str,
    /// Statistics refresh statement (`table_name` placeholder).
    pub analyze: &'static str,
}

/// Sanitized full-text search language: interpolated into generated SQL, so
/// everything but ASCII letters is stripped.
pub fn search_language(behavior: &crate::config::TableBehavior) -> String {
    let language: String = behavior
        .search_language
        .chars()
        .filter(char::is_ascii_alphabetic)
        .collect();
    if language.is_empty() {
        "simple".to_string()
    } else {
        language
    }
}

/// Textual rendition of a JSON value for the search vector (nulls vanish,
/// strings drop their quotes).
pub fn json_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Base query for `DatasetRecord` rows.
pub const DATASET_QUERY: &str = r#"SELECT id, name, slug, description,
    author_name, author_url, code_url, license_name, license_url, source_name,
    source_url, "show"
    FROM dataset"#;

/// Column list shared by every query returning `TableRecord` rows.
pub const TABLE_COLUMNS: &str = r#"dataset_table.id, dataset_table.dataset_id,
    dataset_table.version_id, dataset_table.name, dataset_table."default",
    dataset_table.hidden, dataset_table.ordering, dataset_table.filtering,
    dataset_table.search, dataset_table.options, dataset_table.description,
    dataset_table.import_date"#;

#[macro_export]
macro_rules! implement_repository {
    ($repo: ident, $db: ty) => {

impl $repo {
    fn data_table_columns() -> String {
        format!(
            r#"id, table_id, db_table_name, {} AS created_at, active"#,
            $repo::QUERIES
                .cast_timestamp
                .replace("timestamp_column", "created_at")
        )
    }

    /// Push a SQL template, binding `value` at every `{}` placeholder.
    fn push_template(
        builder: &mut QueryBuilder<'_, $db>,
        template: &str,
        value: &str,
    ) {
        let mut parts = template.split("{}").peekable();
        while let Some(part) = parts.next() {
            builder.push(part);
            if parts.peek().is_some() {
                builder.push_bind(value.to_string());
            }
        }
    }

    /// Bind a raw filter value with the type of the column it compares
    /// against, so the engine doesn't compare e.g. an integer column with a
    /// text parameter. Unparsable values degrade to the backend's cast
    /// template and fail (or match nothing) there.
    fn push_typed_value(
        builder: &mut QueryBuilder<'_, $db>,
        field_type: FieldType,
        raw: &str,
    ) {
        match field_type {
            FieldType::Integer => {
                if let Ok(value) = raw.parse::<i64>() {
                    builder.push_bind(value);
                    return;
                }
            }
            FieldType::Float => {
                if let Ok(value) = raw.parse::<f64>() {
                    builder.push_bind(value);
                    return;
                }
            }
            FieldType::Boolean => {
                if let Ok(JsonValue::Bool(value)) = FieldType::Boolean.parse_value(raw)
                {
                    builder.push_bind(value);
                    return;
                }
            }
            _ => {}
        }
        Self::push_template(builder, $repo::value_template(field_type), raw);
    }

    /// WHERE clause shared by fetch and count: AND of one full-text predicate
    /// per search term plus one comparison per filter.
    fn push_predicates(builder: &mut QueryBuilder<'_, $db>, query: &DataQuery) {
        let runtime = query.runtime();
        let language = search_language(&runtime.behavior);
        let mut prefix = " WHERE ";

        let predicate = $repo::QUERIES
            .search_term_predicate
            .replace("{language}", &language);
        for term in query.terms() {
            builder.push(prefix);
            prefix = " AND ";
            Self::push_template(builder, &predicate, term);
        }

        for filter in query.filters() {
            builder.push(prefix);
            prefix = " AND ";
            builder.push(quote_ident(&filter.field));
            if filter.op == FilterOp::Contains {
                builder.push(" ");
                builder.push($repo::QUERIES.ilike);
                builder.push(" ");
                builder.push_bind(format!("%{}%", filter.value));
            } else {
                builder.push(" ");
                builder.push(filter.op.sql_operator());
                builder.push(" ");
                let field_type = runtime
                    .column_type(&filter.field)
                    .unwrap_or(FieldType::Text);
                Self::push_typed_value(builder, field_type, &filter.value);
            }
        }
    }

    fn decode_value(
        row: &<$db as sqlx::Database>::Row,
        column: &RuntimeColumn,
    ) -> Result<JsonValue> {
        let name = column.name.as_str();
        let value = match column.spec.field_type {
            FieldType::Integer => row
                .try_get::<Option<i64>, _>(name)
                .map(|v| v.map(JsonValue::from)),
            FieldType::Float => row
                .try_get::<Option<f64>, _>(name)
                .map(|v| v.map(JsonValue::from)),
            FieldType::Boolean => row
                .try_get::<Option<bool>, _>(name)
                .map(|v| v.map(JsonValue::from)),
            FieldType::Json => row.try_get::<Option<String>, _>(name).map(|v| {
                v.and_then(|raw| match serde_json::from_str(&raw) {
                    Ok(value) => Some(value),
                    Err(error) => {
                        tracing::warn!(
                            column = name,
                            %error,
                            "Stored JSON value doesn't decode, returning null"
                        );
                        None
                    }
                })
            }),
            // Everything else is selected as (or stored as) text
            _ => row
                .try_get::<Option<String>, _>(name)
                .map(|v| v.map(JsonValue::from)),
        };
        Ok(value.map_err(Error::SqlxError)?.unwrap_or(JsonValue::Null))
    }
}

#[async_trait]
impl Repository for $repo {
    async fn setup(&self) {
        $repo::MIGRATOR
            .run(&self.executor)
            .await
            .expect("error running migrations");
    }

    async fn create_dataset(&self, dataset: &NewDataset<'_>) -> Result<DatasetId> {
        let row = sqlx::query(
            r#"INSERT INTO dataset (name, slug, description, author_name, author_url,
                code_url, license_name, license_url, source_name, source_url, "show")
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id"#,
        )
        .bind(dataset.name)
        .bind(dataset.slug)
        .bind(dataset.description)
        .bind(dataset.author_name)
        .bind(dataset.author_url)
        .bind(dataset.code_url)
        .bind(dataset.license_name)
        .bind(dataset.license_url)
        .bind(dataset.source_name)
        .bind(dataset.source_url)
        .bind(dataset.show)
        .fetch_one(&self.executor)
        .await
        .map_err($repo::interpret_error)?;
        row.try_get("id").map_err(Error::SqlxError)
    }

    async fn get_dataset(&self, dataset_id: DatasetId) -> Result<DatasetRecord> {
        sqlx::query_as(&format!("{} WHERE id = $1", DATASET_QUERY))
            .bind(dataset_id)
            .fetch_one(&self.executor)
            .await
            .map_err($repo::interpret_error)
    }

    async fn get_dataset_by_slug(&self, slug: &str) -> Result<DatasetRecord> {
        sqlx::query_as(&format!("{} WHERE slug = $1", DATASET_QUERY))
            .bind(slug)
            .fetch_one(&self.executor)
            .await
            .map_err($repo::interpret_error)
    }

    async fn list_datasets(&self) -> Result<Vec<DatasetRecord>> {
        sqlx::query_as(&format!("{} ORDER BY slug", DATASET_QUERY))
            .fetch_all(&self.executor)
            .await
            .map_err($repo::interpret_error)
    }

    async fn create_version(&self, version: &NewVersion<'_>) -> Result<VersionId> {
        let row = sqlx::query(
            r#"INSERT INTO version (dataset_id, name, collected_at, download_url, "order")
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id"#,
        )
        .bind(version.dataset_id)
        .bind(version.name)
        .bind(version.collected_at)
        .bind(version.download_url)
        .bind(version.order)
        .fetch_one(&self.executor)
        .await
        .map_err($repo::interpret_error)?;
        row.try_get("id").map_err(Error::SqlxError)
    }

    async fn latest_version(
        &self,
        dataset_id: DatasetId,
    ) -> Result<Option<VersionRecord>> {
        sqlx::query_as(
            r#"SELECT id, dataset_id, name, collected_at, download_url, "order"
            FROM version
            WHERE dataset_id = $1
            ORDER BY "order" DESC, id DESC
            LIMIT 1"#,
        )
        .bind(dataset_id)
        .fetch_optional(&self.executor)
        .await
        .map_err($repo::interpret_error)
    }

    async fn create_table(&self, table: &NewTable<'_>) -> Result<TableId> {
        let row = sqlx::query(
            r#"INSERT INTO dataset_table
                (dataset_id, version_id, name, "default", hidden, ordering,
                filtering, search, options)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id"#,
        )
        .bind(table.dataset_id)
        .bind(table.version_id)
        .bind(table.name)
        .bind(table.default)
        .bind(table.hidden)
        .bind(Json(table.ordering.clone()))
        .bind(Json(table.filtering.clone()))
        .bind(Json(table.search.clone()))
        .bind(table.options.clone().map(Json))
        .fetch_one(&self.executor)
        .await
        .map_err($repo::interpret_error)?;
        row.try_get("id").map_err(Error::SqlxError)
    }

    /// Resolve a logical table by dataset slug and table name. When the name
    /// recurs across dataset versions, the table from the latest version
    /// wins.
    async fn get_table(
        &self,
        dataset_slug: &str,
        table_name: &str,
        include_hidden: bool,
    ) -> Result<TableRecord> {
        let mut builder: QueryBuilder<$db> = QueryBuilder::new(format!(
            r#"SELECT {TABLE_COLUMNS}
            FROM dataset_table
            INNER JOIN dataset ON dataset.id = dataset_table.dataset_id
            INNER JOIN version ON version.id = dataset_table.version_id
            WHERE dataset.slug = "#
        ));
        builder.push_bind(dataset_slug.to_string());
        builder.push(" AND dataset_table.name = ");
        builder.push_bind(table_name.to_string());
        if !include_hidden {
            builder.push(" AND NOT dataset_table.hidden");
        }
        builder.push(r#" ORDER BY version."order" DESC, dataset_table.id DESC LIMIT 1"#);

        builder
            .build_query_as()
            .fetch_one(&self.executor)
            .await
            .map_err($repo::interpret_error)
    }

    async fn get_table_by_id(&self, table_id: TableId) -> Result<TableRecord> {
        sqlx::query_as(&format!(
            "SELECT {TABLE_COLUMNS} FROM dataset_table WHERE dataset_table.id = $1"
        ))
        .bind(table_id)
        .fetch_one(&self.executor)
        .await
        .map_err($repo::interpret_error)
    }

    async fn get_default_table(&self, dataset_slug: &str) -> Result<TableRecord> {
        sqlx::query_as(&format!(
            r#"SELECT {TABLE_COLUMNS}
            FROM dataset_table
            INNER JOIN dataset ON dataset.id = dataset_table.dataset_id
            INNER JOIN version ON version.id = dataset_table.version_id
            WHERE dataset.slug = $1 AND dataset_table."default"
            ORDER BY version."order" DESC, dataset_table.id DESC
            LIMIT 1"#
        ))
        .bind(dataset_slug)
        .fetch_one(&self.executor)
        .await
        .map_err($repo::interpret_error)
    }

    async fn list_tables(
        &self,
        version_id: VersionId,
        include_hidden: bool,
    ) -> Result<Vec<TableRecord>> {
        let mut builder: QueryBuilder<$db> = QueryBuilder::new(format!(
            "SELECT {TABLE_COLUMNS} FROM dataset_table WHERE dataset_table.version_id = "
        ));
        builder.push_bind(version_id);
        if !include_hidden {
            builder.push(" AND NOT dataset_table.hidden");
        }
        builder.push(" ORDER BY dataset_table.name");

        builder
            .build_query_as()
            .fetch_all(&self.executor)
            .await
            .map_err($repo::interpret_error)
    }

    async fn delete_table(&self, table_id: TableId) -> Result<()> {
        let deleted = sqlx::query("DELETE FROM dataset_table WHERE id = $1")
            .bind(table_id)
            .execute(&self.executor)
            .await
            .map_err($repo::interpret_error)?;
        if deleted.rows_affected() == 0 {
            return Err(Error::SqlxError(sqlx::Error::RowNotFound));
        }
        Ok(())
    }

    async fn create_field(&self, field: &NewField<'_>) -> Result<FieldId> {
        let row = sqlx::query(
            r#"INSERT INTO field
                (dataset_id, version_id, table_id, name, title, type, "order",
                nullable, options, has_choices, frontend_filter, obfuscate,
                "show", show_on_frontend)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING id"#,
        )
        .bind(field.dataset_id)
        .bind(field.version_id)
        .bind(field.table_id)
        .bind(field.name)
        .bind(field.title)
        .bind(field.r#type)
        .bind(field.order)
        .bind(field.nullable)
        .bind(field.options.clone().map(Json))
        .bind(field.has_choices)
        .bind(field.frontend_filter)
        .bind(field.obfuscate)
        .bind(field.show)
        .bind(field.show_on_frontend)
        .fetch_one(&self.executor)
        .await
        .map_err($repo::interpret_error)?;
        row.try_get("id").map_err(Error::SqlxError)
    }

    async fn list_fields(&self, table_id: TableId) -> Result<Vec<FieldRecord>> {
        sqlx::query_as(
            r#"SELECT id, dataset_id, version_id, table_id, name, title, type,
                "order", nullable, options, choices, description, link_template,
                has_choices, frontend_filter, obfuscate, "show", show_on_frontend
            FROM field
            WHERE table_id = $1
            ORDER BY "order", id"#,
        )
        .bind(table_id)
        .fetch_all(&self.executor)
        .await
        .map_err($repo::interpret_error)
    }

    async fn update_field_choices(
        &self,
        field_id: FieldId,
        choices: &JsonValue,
    ) -> Result<()> {
        let updated =
            sqlx::query("UPDATE field SET choices = $1, has_choices = TRUE WHERE id = $2")
                .bind(Json(choices.clone()))
                .bind(field_id)
                .execute(&self.executor)
                .await
                .map_err($repo::interpret_error)?;
        if updated.rows_affected() == 0 {
            return Err(Error::SqlxError(sqlx::Error::RowNotFound));
        }
        Ok(())
    }

    async fn create_data_table(
        &self,
        table_id: TableId,
        db_table_name: &str,
    ) -> Result<DataTableRecord> {
        sqlx::query_as(&format!(
            "INSERT INTO data_table (table_id, db_table_name) VALUES ($1, $2) RETURNING {}",
            $repo::data_table_columns()
        ))
        .bind(table_id)
        .bind(db_table_name)
        .fetch_one(&self.executor)
        .await
        .map_err($repo::interpret_error)
    }

    async fn get_data_table(
        &self,
        data_table_id: DataTableId,
    ) -> Result<DataTableRecord> {
        sqlx::query_as(&format!(
            "SELECT {} FROM data_table WHERE id = $1",
            $repo::data_table_columns()
        ))
        .bind(data_table_id)
        .fetch_one(&self.executor)
        .await
        .map_err($repo::interpret_error)
    }

    async fn active_data_table(
        &self,
        table_id: TableId,
    ) -> Result<Option<DataTableRecord>> {
        sqlx::query_as(&format!(
            "SELECT {} FROM data_table WHERE table_id = $1 AND active",
            $repo::data_table_columns()
        ))
        .bind(table_id)
        .fetch_optional(&self.executor)
        .await
        .map_err($repo::interpret_error)
    }

    async fn most_recent_inactive_data_table(
        &self,
        table_id: TableId,
        exclude: DataTableId,
    ) -> Result<Option<DataTableRecord>> {
        sqlx::query_as(&format!(
            r#"SELECT {} FROM data_table
            WHERE table_id = $1 AND NOT active AND id != $2
            ORDER BY created_at DESC, id DESC
            LIMIT 1"#,
            $repo::data_table_columns()
        ))
        .bind(table_id)
        .bind(exclude)
        .fetch_optional(&self.executor)
        .await
        .map_err($repo::interpret_error)
    }

    async fn list_data_tables(
        &self,
        table_id: TableId,
    ) -> Result<Vec<DataTableRecord>> {
        sqlx::query_as(&format!(
            "SELECT {} FROM data_table WHERE table_id = $1 ORDER BY id",
            $repo::data_table_columns()
        ))
        .bind(table_id)
        .fetch_all(&self.executor)
        .await
        .map_err($repo::interpret_error)
    }

    async fn activate_data_table(
        &self,
        table_id: TableId,
        data_table_id: DataTableId,
    ) -> Result<Option<DataTableRecord>> {
        let mut tx = self
            .executor
            .begin()
            .await
            .map_err($repo::interpret_error)?;

        let previous: Option<DataTableRecord> = sqlx::query_as(&format!(
            "SELECT {} FROM data_table WHERE table_id = $1 AND active",
            $repo::data_table_columns()
        ))
        .bind(table_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err($repo::interpret_error)?;

        // Deactivate-then-activate inside one transaction, so the partial
        // unique index on (table_id) WHERE active never sees two rows and
        // readers never see zero
        sqlx::query("UPDATE data_table SET active = FALSE WHERE table_id = $1 AND active")
            .bind(table_id)
            .execute(&mut *tx)
            .await
            .map_err($repo::interpret_error)?;

        let activated = sqlx::query(
            "UPDATE data_table SET active = TRUE WHERE id = $1 AND table_id = $2",
        )
        .bind(data_table_id)
        .bind(table_id)
        .execute(&mut *tx)
        .await
        .map_err($repo::interpret_error)?;
        if activated.rows_affected() == 0 {
            // Dropping the transaction rolls the deactivation back
            return Err(Error::SqlxError(sqlx::Error::RowNotFound));
        }

        tx.commit().await.map_err($repo::interpret_error)?;
        Ok(previous)
    }

    async fn set_data_table_inactive(&self, data_table_id: DataTableId) -> Result<()> {
        let updated =
            sqlx::query("UPDATE data_table SET active = FALSE WHERE id = $1")
                .bind(data_table_id)
                .execute(&self.executor)
                .await
                .map_err($repo::interpret_error)?;
        if updated.rows_affected() == 0 {
            return Err(Error::SqlxError(sqlx::Error::RowNotFound));
        }
        Ok(())
    }

    async fn delete_data_table(&self, data_table_id: DataTableId) -> Result<()> {
        // The `NOT active` guard makes the check-then-delete race-free: a
        // generation activated in between is left alone
        let deleted =
            sqlx::query("DELETE FROM data_table WHERE id = $1 AND NOT active")
                .bind(data_table_id)
                .execute(&self.executor)
                .await
                .map_err($repo::interpret_error)?;
        if deleted.rows_affected() == 0 {
            return Err(Error::SqlxError(sqlx::Error::RowNotFound));
        }
        Ok(())
    }

    async fn create_physical_table(&self, runtime: &RuntimeTable) -> Result<()> {
        let mut ddl = format!(
            "CREATE TABLE {} (\n    {}",
            quote_ident(&runtime.db_table_name),
            $repo::QUERIES.pk_column
        );
        for column in &runtime.columns {
            ddl.push_str(&format!(
                ",\n    {} {}",
                quote_ident(&column.name),
                $repo::sql_type(&column.spec)
            ));
            if !column.spec.nullable {
                ddl.push_str(" NOT NULL");
            }
        }
        ddl.push_str(&format!(
            ",\n    {} {}\n)",
            quote_ident(SEARCH_COLUMN),
            $repo::QUERIES.search_column_type
        ));
        sqlx::query(&ddl)
            .execute(&self.executor)
            .await
            .map_err($repo::interpret_error)?;

        for index in &runtime.indexes {
            let statement = if index.kind == IndexKind::Search {
                $repo::QUERIES
                    .search_index
                    .replace("index_name", &quote_ident(&index.name))
                    .replace("table_name", &quote_ident(&runtime.db_table_name))
            } else {
                format!(
                    "CREATE INDEX {} ON {} ({})",
                    quote_ident(&index.name),
                    quote_ident(&runtime.db_table_name),
                    index.fields.iter().map(|f| quote_ident(f)).join(", ")
                )
            };
            sqlx::query(&statement)
                .execute(&self.executor)
                .await
                .map_err($repo::interpret_error)?;
        }
        Ok(())
    }

    async fn drop_physical_table(&self, db_table_name: &str) -> Result<()> {
        sqlx::query(&format!("DROP TABLE {}", quote_ident(db_table_name)))
            .execute(&self.executor)
            .await
            .map_err($repo::interpret_error)?;
        Ok(())
    }

    async fn insert_rows(
        &self,
        runtime: &RuntimeTable,
        rows: &[JsonValue],
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let search_vector = $repo::QUERIES
            .search_vector
            .replace("{language}", &search_language(&runtime.behavior));

        let mut tx = self
            .executor
            .begin()
            .await
            .map_err($repo::interpret_error)?;
        let mut inserted = 0u64;
        for row in rows {
            let mut builder: QueryBuilder<$db> = QueryBuilder::new("INSERT INTO ");
            builder.push(quote_ident(&runtime.db_table_name));
            builder.push(" (");
            {
                let mut columns = builder.separated(", ");
                for column in &runtime.columns {
                    columns.push(quote_ident(&column.name));
                }
                columns.push(quote_ident(SEARCH_COLUMN));
            }
            builder.push(") VALUES (");

            for (position, column) in runtime.columns.iter().enumerate() {
                if position > 0 {
                    builder.push(", ");
                }
                match &row[column.name.as_str()] {
                    JsonValue::Null => {
                        builder.push("NULL");
                    }
                    JsonValue::Bool(value) => {
                        builder.push_bind(*value);
                    }
                    JsonValue::Number(number) => {
                        if let Some(value) = number.as_i64() {
                            builder.push_bind(value);
                        } else {
                            builder.push_bind(number.as_f64().unwrap_or(f64::NAN));
                        }
                    }
                    JsonValue::String(value) => Self::push_template(
                        &mut builder,
                        $repo::value_template(column.spec.field_type),
                        value,
                    ),
                    other => Self::push_template(
                        &mut builder,
                        $repo::value_template(column.spec.field_type),
                        &other.to_string(),
                    ),
                }
            }

            builder.push(", ");
            let search_text = runtime
                .search
                .iter()
                .map(|field| json_text(&row[field.as_str()]))
                .filter(|text| !text.is_empty())
                .join(" ")
                .to_lowercase();
            Self::push_template(&mut builder, &search_vector, &search_text);
            builder.push(")");

            inserted += builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err($repo::interpret_error)?
                .rows_affected();
        }
        tx.commit().await.map_err($repo::interpret_error)?;
        Ok(inserted)
    }

    async fn fetch_rows(
        &self,
        query: &DataQuery,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<JsonValue>> {
        let runtime = query.runtime();
        let searching = !query.terms().is_empty();

        let mut builder: QueryBuilder<$db> = QueryBuilder::new("SELECT ");
        {
            let mut columns = builder.separated(", ");
            for column in &runtime.columns {
                columns.push($repo::select_expr(column));
            }
        }
        if searching {
            builder.push(", ");
            let rank = $repo::QUERIES
                .search_term_rank
                .replace("{language}", &search_language(&runtime.behavior));
            for (position, term) in query.terms().iter().enumerate() {
                if position > 0 {
                    builder.push(" + ");
                }
                Self::push_template(&mut builder, &rank, term);
            }
            builder.push(" AS search_rank");
        }
        builder.push(" FROM ");
        builder.push(quote_ident(&runtime.db_table_name));
        Self::push_predicates(&mut builder, query);

        let order_sql: Vec<String> = query
            .order_keys()
            .iter()
            .filter_map(|key| match key {
                OrderKey::Rank if searching => Some("search_rank DESC".to_string()),
                OrderKey::Rank => None,
                OrderKey::Field { name, descending } => {
                    runtime.column(name).map(|column| {
                        format!(
                            "{} {}",
                            quote_ident(&column.name),
                            if *descending { "DESC" } else { "ASC" }
                        )
                    })
                }
            })
            .collect();
        if !order_sql.is_empty() {
            builder.push(" ORDER BY ");
            builder.push(order_sql.join(", "));
        }
        if limit.is_some() || offset.is_some() {
            builder.push(" LIMIT ");
            builder.push_bind(limit.unwrap_or(i64::MAX));
            builder.push(" OFFSET ");
            builder.push_bind(offset.unwrap_or(0));
        }

        let rows = builder
            .build()
            .fetch_all(&self.executor)
            .await
            .map_err($repo::interpret_error)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut object = serde_json::Map::new();
            for column in &runtime.columns {
                object.insert(column.name.clone(), Self::decode_value(row, column)?);
            }
            if searching {
                let rank: f64 =
                    row.try_get("search_rank").map_err(Error::SqlxError)?;
                object.insert("search_rank".to_string(), JsonValue::from(rank));
            }
            out.push(JsonValue::Object(object));
        }
        Ok(out)
    }

    async fn count_rows(&self, query: &DataQuery) -> Result<i64> {
        let mut builder: QueryBuilder<$db> =
            QueryBuilder::new("SELECT COUNT(*) AS count FROM ");
        builder.push(quote_ident(&query.runtime().db_table_name));
        Self::push_predicates(&mut builder, query);

        let row = builder
            .build()
            .fetch_one(&self.executor)
            .await
            .map_err($repo::interpret_error)?;
        row.try_get("count").map_err(Error::SqlxError)
    }

    async fn approximate_row_count(
        &self,
        db_table_name: &str,
    ) -> Result<Option<i64>> {
        let mut builder: QueryBuilder<$db> =
            QueryBuilder::new($repo::QUERIES.approximate_row_count);
        builder.push_bind(db_table_name.to_string());
        builder.push(" LIMIT 1");

        let row = builder
            .build()
            .fetch_optional(&self.executor)
            .await
            .map_err($repo::interpret_error)?;
        let estimate = match row {
            Some(row) => row
                .try_get::<String, _>("estimate")
                .map_err(Error::SqlxError)?,
            None => return Ok(None),
        };
        // SQLite statistics pack extra per-index numbers after the row count
        Ok(estimate
            .split_whitespace()
            .next()
            .and_then(|count| count.parse::<f64>().ok())
            .map(|count| count as i64))
    }

    async fn distinct_values(
        &self,
        runtime: &RuntimeTable,
        field_name: &str,
    ) -> Result<Vec<String>> {
        let column = runtime.column(field_name).ok_or_else(|| {
            Error::SqlxError(sqlx::Error::ColumnNotFound(field_name.to_string()))
        })?;
        let ident = quote_ident(&column.name);
        let statement = format!(
            "SELECT DISTINCT CAST({ident} AS TEXT) AS value FROM {} WHERE {ident} IS NOT NULL ORDER BY value",
            quote_ident(&runtime.db_table_name)
        );
        let rows = sqlx::query(&statement)
            .fetch_all(&self.executor)
            .await
            .map_err($repo::interpret_error)?;
        rows.iter()
            .map(|row| row.try_get("value").map_err(Error::SqlxError))
            .collect()
    }

    async fn analyze_physical_table(&self, db_table_name: &str) -> Result<()> {
        let statement = $repo::QUERIES
            .analyze
            .replace("table_name", &quote_ident(db_table_name));
        sqlx::query(&statement)
            .execute(&self.executor)
            .await
            .map_err($repo::interpret_error)?;
        Ok(())
    }
}

    };
}
