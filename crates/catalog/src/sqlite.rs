use std::{
    collections::BTreeMap,
    path::{
        Path,
        PathBuf,
    },
    time::{
        SystemTime,
        UNIX_EPOCH,
    },
};

use errors::EngineError;
use parking_lot::Mutex;
use rusqlite::{
    params,
    Connection,
    Row,
};

use crate::{
    metrics::log_files_reclaimed,
    types::{
        metric_from_str,
        metric_to_str,
    },
    Date,
    FileDescriptor,
    FileId,
    FileType,
    FileUpdate,
    Metric,
    MetadataClient,
    NewFile,
    TableSchema,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tables (
    table_id TEXT PRIMARY KEY,
    dim INTEGER NOT NULL,
    metric TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS files (
    file_id INTEGER PRIMARY KEY AUTOINCREMENT,
    table_id TEXT NOT NULL,
    date TEXT NOT NULL,
    dimension INTEGER NOT NULL,
    row_count INTEGER NOT NULL,
    location TEXT NOT NULL,
    file_type TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS files_by_table ON files (table_id, file_type, date);
";

/// A `rusqlite`-backed catalog. A single connection guarded by a mutex is
/// sufficient: every operation here is a handful of statements, and
/// serializing them is what gives us the atomicity the trait promises.
pub struct SqliteMetadataClient {
    connection: Mutex<Connection>,
    segment_dir: PathBuf,
}

impl SqliteMetadataClient {
    pub fn open(db_path: &Path, segment_dir: PathBuf) -> anyhow::Result<Self> {
        let connection = Connection::open(db_path)
            .map_err(|e| EngineError::catalog(format!("opening catalog database: {e}")))?;
        connection
            .execute_batch(SCHEMA)
            .map_err(|e| EngineError::catalog(format!("initializing catalog schema: {e}")))?;
        Ok(Self {
            connection: Mutex::new(connection),
            segment_dir,
        })
    }

    pub fn open_in_memory(segment_dir: PathBuf) -> anyhow::Result<Self> {
        let connection = Connection::open_in_memory()
            .map_err(|e| EngineError::catalog(format!("opening in-memory catalog: {e}")))?;
        connection
            .execute_batch(SCHEMA)
            .map_err(|e| EngineError::catalog(format!("initializing catalog schema: {e}")))?;
        Ok(Self {
            connection: Mutex::new(connection),
            segment_dir,
        })
    }

    fn location_for(&self, table_id: &str, file_id: FileId) -> String {
        self.segment_dir
            .join(table_id)
            .join(format!("{file_id}.seg"))
            .to_string_lossy()
            .into_owned()
    }
}

fn file_descriptor_from_row(row: &Row<'_>) -> rusqlite::Result<FileDescriptor> {
    let file_type_str: String = row.get("file_type")?;
    Ok(FileDescriptor {
        file_id: row.get("file_id")?,
        table_id: row.get("table_id")?,
        date: Date(row.get("date")?),
        dimension: row.get::<_, i64>("dimension")? as usize,
        row_count: row.get::<_, i64>("row_count")? as u64,
        location: row.get("location")?,
        file_type: FileType::parse(&file_type_str)
            .map_err(|e| rusqlite::Error::InvalidColumnName(e.to_string()))?,
        created_at: row.get("created_at")?,
    })
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_secs() as i64
}

impl MetadataClient for SqliteMetadataClient {
    fn create_table(&self, table_id: &str, dim: usize, metric: Metric) -> anyhow::Result<()> {
        let conn = self.connection.lock();
        let existing: Option<(i64, String)> = conn
            .query_row(
                "SELECT dim, metric FROM tables WHERE table_id = ?1",
                params![table_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => None,
                other => Some(other),
            })
            .unwrap_or(None);

        if let Some((existing_dim, existing_metric)) = existing {
            if existing_dim as usize == dim && existing_metric == metric_to_str(metric) {
                return Ok(());
            }
            return Err(EngineError::invalid_argument(
                "TableAlreadyExists",
                format!("table {table_id:?} already exists with a different schema"),
            )
            .into());
        }

        conn.execute(
            "INSERT INTO tables (table_id, dim, metric) VALUES (?1, ?2, ?3)",
            params![table_id, dim as i64, metric_to_str(metric)],
        )
        .map_err(|e| EngineError::catalog(format!("creating table {table_id:?}: {e}")))?;
        Ok(())
    }

    fn describe_table(&self, table_id: &str) -> anyhow::Result<TableSchema> {
        let conn = self.connection.lock();
        conn.query_row(
            "SELECT dim, metric FROM tables WHERE table_id = ?1",
            params![table_id],
            |row| {
                let dim: i64 = row.get(0)?;
                let metric_str: String = row.get(1)?;
                Ok((dim, metric_str))
            },
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => EngineError::table_not_found(table_id).into(),
            other => EngineError::catalog(format!("describing table {table_id:?}: {other}")).into(),
        })
        .and_then(|(dim, metric_str)| {
            Ok(TableSchema {
                table_id: table_id.to_owned(),
                dim: dim as usize,
                metric: metric_from_str(&metric_str)?,
            })
        })
    }

    fn has_table(&self, table_id: &str) -> anyhow::Result<bool> {
        let conn = self.connection.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM tables WHERE table_id = ?1",
                params![table_id],
                |row| row.get(0),
            )
            .map_err(|e| EngineError::catalog(format!("checking table {table_id:?}: {e}")))?;
        Ok(count > 0)
    }

    fn all_tables(&self) -> anyhow::Result<Vec<TableSchema>> {
        let conn = self.connection.lock();
        let mut stmt = conn
            .prepare("SELECT table_id, dim, metric FROM tables ORDER BY table_id")
            .map_err(|e| EngineError::catalog(format!("listing tables: {e}")))?;
        let rows = stmt
            .query_map([], |row| {
                let table_id: String = row.get(0)?;
                let dim: i64 = row.get(1)?;
                let metric_str: String = row.get(2)?;
                Ok((table_id, dim, metric_str))
            })
            .map_err(|e| EngineError::catalog(format!("listing tables: {e}")))?;
        let mut tables = Vec::new();
        for row in rows {
            let (table_id, dim, metric_str) =
                row.map_err(|e| EngineError::catalog(format!("listing tables: {e}")))?;
            tables.push(TableSchema {
                table_id,
                dim: dim as usize,
                metric: metric_from_str(&metric_str)?,
            });
        }
        Ok(tables)
    }

    fn count_rows(&self, table_id: &str) -> anyhow::Result<u64> {
        let conn = self.connection.lock();
        let total: i64 = conn
            .query_row(
                "SELECT COALESCE(SUM(row_count), 0) FROM files WHERE table_id = ?1 AND \
                 file_type != 'to_delete'",
                params![table_id],
                |row| row.get(0),
            )
            .map_err(|e| EngineError::catalog(format!("counting rows for {table_id:?}: {e}")))?;
        Ok(total as u64)
    }

    fn add_file(&self, descriptor: NewFile) -> anyhow::Result<FileDescriptor> {
        let conn = self.connection.lock();
        let created_at = now_unix();
        conn.execute(
            "INSERT INTO files (table_id, date, dimension, row_count, location, file_type, \
             created_at) VALUES (?1, ?2, ?3, 0, '', 'new', ?4)",
            params![
                descriptor.table_id,
                descriptor.date.0,
                descriptor.dimension as i64,
                created_at
            ],
        )
        .map_err(|e| EngineError::catalog(format!("allocating file: {e}")))?;
        let file_id = conn.last_insert_rowid();
        let location = self.location_for(&descriptor.table_id, file_id);
        conn.execute(
            "UPDATE files SET location = ?1 WHERE file_id = ?2",
            params![location, file_id],
        )
        .map_err(|e| EngineError::catalog(format!("assigning file location: {e}")))?;
        Ok(FileDescriptor {
            file_id,
            table_id: descriptor.table_id,
            date: descriptor.date,
            dimension: descriptor.dimension,
            row_count: 0,
            location,
            file_type: FileType::New,
            created_at,
        })
    }

    fn update_files(&self, updates: &[FileUpdate]) -> anyhow::Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection.lock();
        let tx = conn
            .transaction()
            .map_err(|e| EngineError::catalog(format!("starting file update batch: {e}")))?;
        for update in updates {
            let affected = tx
                .execute(
                    "UPDATE files SET file_type = ?1, row_count = COALESCE(?2, row_count) WHERE \
                     file_id = ?3",
                    params![
                        update.file_type.to_string(),
                        update.row_count.map(|c| c as i64),
                        update.file_id
                    ],
                )
                .map_err(|e| {
                    EngineError::catalog(format!("updating file {}: {e}", update.file_id))
                })?;
            if affected != 1 {
                return Err(EngineError::not_found(
                    "FileNotFound",
                    format!("no file with id {}", update.file_id),
                )
                .into());
            }
        }
        tx.commit()
            .map_err(|e| EngineError::catalog(format!("committing file update batch: {e}")))?;
        Ok(())
    }

    fn files_to_search(
        &self,
        table_id: &str,
        dates: &[Date],
    ) -> anyhow::Result<BTreeMap<Date, Vec<FileDescriptor>>> {
        if dates.is_empty() {
            return Ok(BTreeMap::new());
        }
        let conn = self.connection.lock();
        let placeholders = dates.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!(
            "SELECT * FROM files WHERE table_id = ? AND file_type IN ('raw', 'index') AND date \
             IN ({placeholders}) ORDER BY file_id ASC"
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| EngineError::catalog(format!("listing searchable files: {e}")))?;
        let mut params: Vec<&dyn rusqlite::ToSql> = vec![&table_id];
        let date_strs: Vec<&str> = dates.iter().map(|d| d.0.as_str()).collect();
        for date in &date_strs {
            params.push(date);
        }
        let rows = stmt
            .query_map(params.as_slice(), file_descriptor_from_row)
            .map_err(|e| EngineError::catalog(format!("listing searchable files: {e}")))?;
        let mut grouped: BTreeMap<Date, Vec<FileDescriptor>> = BTreeMap::new();
        for row in rows {
            let file = row.map_err(|e| EngineError::catalog(format!("listing files: {e}")))?;
            grouped.entry(file.date.clone()).or_default().push(file);
        }
        Ok(grouped)
    }

    fn files_to_merge(&self, table_id: &str) -> anyhow::Result<BTreeMap<Date, Vec<FileDescriptor>>> {
        let conn = self.connection.lock();
        let mut stmt = conn
            .prepare(
                "SELECT * FROM files WHERE table_id = ?1 AND file_type = 'raw' ORDER BY file_id \
                 ASC",
            )
            .map_err(|e| EngineError::catalog(format!("listing mergeable files: {e}")))?;
        let rows = stmt
            .query_map(params![table_id], file_descriptor_from_row)
            .map_err(|e| EngineError::catalog(format!("listing mergeable files: {e}")))?;
        let mut grouped: BTreeMap<Date, Vec<FileDescriptor>> = BTreeMap::new();
        for row in rows {
            let file = row.map_err(|e| EngineError::catalog(format!("listing files: {e}")))?;
            grouped.entry(file.date.clone()).or_default().push(file);
        }
        Ok(grouped)
    }

    fn files_to_index(&self) -> anyhow::Result<Vec<FileDescriptor>> {
        let conn = self.connection.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM files WHERE file_type = 'to_index' ORDER BY file_id ASC")
            .map_err(|e| EngineError::catalog(format!("listing files to index: {e}")))?;
        let rows = stmt
            .query_map([], file_descriptor_from_row)
            .map_err(|e| EngineError::catalog(format!("listing files to index: {e}")))?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row.map_err(|e| EngineError::catalog(format!("listing files: {e}")))?);
        }
        Ok(files)
    }

    fn files_by_id(&self, file_ids: &[FileId]) -> anyhow::Result<Vec<FileDescriptor>> {
        if file_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.connection.lock();
        let placeholders = file_ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!(
            "SELECT * FROM files WHERE file_id IN ({placeholders}) AND file_type IN ('raw', \
             'index')"
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| EngineError::catalog(format!("resolving files by id: {e}")))?;
        let params: Vec<&dyn rusqlite::ToSql> =
            file_ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
        let rows = stmt
            .query_map(params.as_slice(), file_descriptor_from_row)
            .map_err(|e| EngineError::catalog(format!("resolving files by id: {e}")))?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row.map_err(|e| EngineError::catalog(format!("resolving files: {e}")))?);
        }
        Ok(files)
    }

    fn cleanup_ttl(&self, ttl_seconds: u64) -> anyhow::Result<usize> {
        let conn = self.connection.lock();
        let cutoff = now_unix() - ttl_seconds as i64;
        let mut stmt = conn
            .prepare("SELECT file_id, location FROM files WHERE file_type = 'to_delete' AND \
                      created_at <= ?1")
            .map_err(|e| EngineError::catalog(format!("listing files to reclaim: {e}")))?;
        let rows = stmt
            .query_map(params![cutoff], |row| {
                Ok((row.get::<_, FileId>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| EngineError::catalog(format!("listing files to reclaim: {e}")))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| EngineError::catalog(format!("listing files to reclaim: {e}")))?;

        let mut reclaimed = 0;
        for (file_id, location) in rows {
            if let Err(e) = std::fs::remove_file(&location) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(file_id, location, error = %e, "failed to reclaim segment file");
                    continue;
                }
            }
            conn.execute("DELETE FROM files WHERE file_id = ?1", params![file_id])
                .map_err(|e| EngineError::catalog(format!("deleting file {file_id}: {e}")))?;
            reclaimed += 1;
        }
        log_files_reclaimed(reclaimed);
        Ok(reclaimed)
    }

    fn delete_table(&self, table_id: &str, dates: &[Date]) -> anyhow::Result<()> {
        let conn = self.connection.lock();
        if dates.is_empty() {
            conn.execute(
                "UPDATE files SET file_type = 'to_delete' WHERE table_id = ?1 AND file_type != \
                 'to_delete'",
                params![table_id],
            )
            .map_err(|e| EngineError::catalog(format!("deleting table {table_id:?}: {e}")))?;
            return Ok(());
        }
        let placeholders = dates.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!(
            "UPDATE files SET file_type = 'to_delete' WHERE table_id = ? AND file_type != \
             'to_delete' AND date IN ({placeholders})"
        );
        let mut params: Vec<&dyn rusqlite::ToSql> = vec![&table_id];
        let date_strs: Vec<&str> = dates.iter().map(|d| d.0.as_str()).collect();
        for date in &date_strs {
            params.push(date);
        }
        conn.execute(&sql, params.as_slice())
            .map_err(|e| EngineError::catalog(format!("deleting table {table_id:?}: {e}")))?;
        Ok(())
    }

    fn drop_all(&self) -> anyhow::Result<()> {
        let conn = self.connection.lock();
        let mut stmt = conn
            .prepare("SELECT location FROM files")
            .map_err(|e| EngineError::catalog(format!("listing files to drop: {e}")))?;
        let locations = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| EngineError::catalog(format!("listing files to drop: {e}")))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| EngineError::catalog(format!("listing files to drop: {e}")))?;
        for location in locations {
            let _ = std::fs::remove_file(location);
        }
        conn.execute("DELETE FROM files", [])
            .map_err(|e| EngineError::catalog(format!("dropping files: {e}")))?;
        conn.execute("DELETE FROM tables", [])
            .map_err(|e| EngineError::catalog(format!("dropping tables: {e}")))?;
        Ok(())
    }
}
