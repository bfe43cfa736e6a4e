use std::fmt;

pub use segment::Metric;

/// A day partition, e.g. `"2024-01-01"`. Opaque to everything except the
/// catalog, which groups segment files by it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Date(pub String);

impl Date {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl fmt::Display for Date {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Date {
    fn from(s: &str) -> Self {
        Date(s.to_owned())
    }
}

pub(crate) fn metric_to_str(metric: Metric) -> &'static str {
    match metric {
        Metric::L2 => "l2",
        Metric::Ip => "ip",
    }
}

pub(crate) fn metric_from_str(s: &str) -> anyhow::Result<Metric> {
    match s {
        "l2" => Ok(Metric::L2),
        "ip" => Ok(Metric::Ip),
        other => Err(errors::EngineError::internal(format!(
            "unrecognized metric {other:?} in catalog"
        ))
        .into()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub table_id: String,
    pub dim: usize,
    pub metric: Metric,
}

pub type FileId = i64;

/// The segment file states from the data model: a file starts life as `New`
/// the instant the catalog allocates it, then moves forward through exactly
/// one of the two state-machine paths described in the compaction design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    New,
    Raw,
    ToIndex,
    Index,
    ToDelete,
}

impl FileType {
    fn as_str(self) -> &'static str {
        match self {
            FileType::New => "new",
            FileType::Raw => "raw",
            FileType::ToIndex => "to_index",
            FileType::Index => "index",
            FileType::ToDelete => "to_delete",
        }
    }

    pub(crate) fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "new" => Ok(FileType::New),
            "raw" => Ok(FileType::Raw),
            "to_index" => Ok(FileType::ToIndex),
            "index" => Ok(FileType::Index),
            "to_delete" => Ok(FileType::ToDelete),
            other => Err(errors::EngineError::internal(format!(
                "unrecognized file_type {other:?} in catalog"
            ))
            .into()),
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub file_id: FileId,
    pub table_id: String,
    pub date: Date,
    pub dimension: usize,
    pub row_count: u64,
    pub location: String,
    pub file_type: FileType,
    pub created_at: i64,
}

/// What the caller supplies to allocate a new file; the catalog fills in
/// `file_id`, `location`, `file_type = New`, and `created_at`.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub table_id: String,
    pub date: Date,
    pub dimension: usize,
}

/// One atomic state transition applied by `update_files`.
#[derive(Debug, Clone)]
pub struct FileUpdate {
    pub file_id: FileId,
    pub file_type: FileType,
    pub row_count: Option<u64>,
}

impl FileUpdate {
    pub fn new(file_id: FileId, file_type: FileType) -> Self {
        Self {
            file_id,
            file_type,
            row_count: None,
        }
    }

    pub fn with_row_count(mut self, row_count: u64) -> Self {
        self.row_count = Some(row_count);
        self
    }
}
