//! The metadata client: a catalog of tables and segment files, and the
//! single source of truth for which files are currently visible to queries.
//! All operations are atomic from the caller's point of view.

mod metrics;
mod sqlite;
mod types;

use std::collections::BTreeMap;

pub use crate::{
    sqlite::SqliteMetadataClient,
    types::{
        Date,
        FileDescriptor,
        FileId,
        FileType,
        FileUpdate,
        Metric,
        NewFile,
        TableSchema,
    },
};

pub trait MetadataClient: Send + Sync {
    fn create_table(&self, table_id: &str, dim: usize, metric: Metric) -> anyhow::Result<()>;
    fn describe_table(&self, table_id: &str) -> anyhow::Result<TableSchema>;
    fn has_table(&self, table_id: &str) -> anyhow::Result<bool>;
    fn all_tables(&self) -> anyhow::Result<Vec<TableSchema>>;
    /// Sum of `row_count` over this table's non-deleted files.
    fn count_rows(&self, table_id: &str) -> anyhow::Result<u64>;

    /// Allocate `file_id` and `location`; the new file starts as `New`.
    fn add_file(&self, descriptor: NewFile) -> anyhow::Result<FileDescriptor>;

    /// Apply every transition in `updates` as a single atomic batch.
    fn update_files(&self, updates: &[FileUpdate]) -> anyhow::Result<()>;

    /// Files with `file_type ∈ {Raw, Index}` intersecting `dates`, grouped
    /// by date. An empty `dates` list returns an empty map (no error).
    fn files_to_search(
        &self,
        table_id: &str,
        dates: &[Date],
    ) -> anyhow::Result<BTreeMap<Date, Vec<FileDescriptor>>>;

    /// `Raw` files for `table_id`, grouped by date.
    fn files_to_merge(&self, table_id: &str) -> anyhow::Result<BTreeMap<Date, Vec<FileDescriptor>>>;

    /// `ToIndex` files across every table.
    fn files_to_index(&self) -> anyhow::Result<Vec<FileDescriptor>>;

    /// Resolve an explicit list of file ids to their descriptors, for the
    /// `Query (explicit)` entry point. Unknown ids are silently omitted.
    fn files_by_id(&self, file_ids: &[FileId]) -> anyhow::Result<Vec<FileDescriptor>>;

    /// Physically delete `ToDelete` files older than `ttl_seconds`. Returns
    /// the number of files reclaimed.
    fn cleanup_ttl(&self, ttl_seconds: u64) -> anyhow::Result<usize>;

    /// Mark every file for `table_id` intersecting `dates` (or every file of
    /// the table if `dates` is empty) as `ToDelete`.
    fn delete_table(&self, table_id: &str, dates: &[Date]) -> anyhow::Result<()>;

    /// Drop every table and file from the catalog.
    fn drop_all(&self) -> anyhow::Result<()>;
}
