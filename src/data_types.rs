pub type DatasetId = i64;
pub type VersionId = i64;
pub type TableId = i64;
pub type FieldId = i64;
pub type DataTableId = i64;
pub type Timestamp = i64;
