use std::path::PathBuf;

use catalog::{
    Date,
    FileDescriptor,
    FileId,
    FileType,
    MetadataClient,
};
use futures::{
    stream,
    StreamExt,
    TryStreamExt,
};
use segment::{
    IndexEngine,
    Metric,
    RawEngine,
    SegmentEngine,
    SegmentHandle,
    SegmentSearchResult,
    SENTINEL_ID,
};

use crate::metrics::log_query_timer;

/// Run `nq` queries against every `Raw`/`Index` file of `table_id` whose date
/// falls in `dates`. An empty `dates` searches no files and returns an
/// all-sentinel result rather than an error.
pub async fn query(
    catalog: &dyn MetadataClient,
    table_id: &str,
    k: usize,
    nq: usize,
    queries: &[f32],
    dates: &[Date],
    fanout_parallelism: usize,
) -> anyhow::Result<SegmentSearchResult> {
    let schema = catalog.describe_table(table_id)?;
    let groups = catalog.files_to_search(table_id, dates)?;
    let files: Vec<FileDescriptor> = groups.into_values().flatten().collect();
    run_query(files, schema.metric, k, nq, queries, fanout_parallelism).await
}

/// Run `nq` queries against an explicit list of files, for the `Query
/// (explicit)` entry point. Unknown ids are silently omitted, matching
/// `MetadataClient::files_by_id`.
pub async fn query_explicit(
    catalog: &dyn MetadataClient,
    table_id: &str,
    k: usize,
    nq: usize,
    queries: &[f32],
    file_ids: &[FileId],
    fanout_parallelism: usize,
) -> anyhow::Result<SegmentSearchResult> {
    let schema = catalog.describe_table(table_id)?;
    let files = catalog.files_by_id(file_ids)?;
    run_query(files, schema.metric, k, nq, queries, fanout_parallelism).await
}

async fn run_query(
    files: Vec<FileDescriptor>,
    metric: Metric,
    k: usize,
    nq: usize,
    queries: &[f32],
    fanout_parallelism: usize,
) -> anyhow::Result<SegmentSearchResult> {
    let timer = log_query_timer();
    match run_query_inner(files, metric, k, nq, queries, fanout_parallelism.max(1)).await {
        Ok(result) => {
            timer.finish();
            Ok(result)
        },
        Err(e) => {
            timer.finish_with("error");
            Err(e)
        },
    }
}

/// Per-file search results are fanned out with bounded concurrency, then
/// reduced query-by-query with the same top-k heap a single segment uses
/// internally. A file that fails to load or search fails the whole query,
/// per the external-interfaces error policy.
async fn run_query_inner(
    files: Vec<FileDescriptor>,
    metric: Metric,
    k: usize,
    nq: usize,
    queries: &[f32],
    fanout_parallelism: usize,
) -> anyhow::Result<SegmentSearchResult> {
    if nq == 0 || k == 0 {
        return Ok(SegmentSearchResult::default());
    }
    let owned_queries = queries.to_vec();
    let per_file: Vec<SegmentSearchResult> = stream::iter(files.into_iter().map(|file| {
        let queries = owned_queries.clone();
        async move { search_one_file(file, metric, k, nq, &queries) }
    }))
    .buffer_unordered(fanout_parallelism)
    .try_collect()
    .await?;

    let mut ids = Vec::with_capacity(nq * k);
    let mut distances = Vec::with_capacity(nq * k);
    for q in 0..nq {
        let candidates = per_file.iter().flat_map(|result| {
            let start = q * k;
            result.ids[start..start + k]
                .iter()
                .copied()
                .zip(result.distances[start..start + k].iter().copied())
        });
        let mut row = segment::select_top_k(metric, candidates, k);
        row.resize(k, (SENTINEL_ID, sentinel_distance(metric)));
        for (id, distance) in row {
            ids.push(id);
            distances.push(distance);
        }
    }
    Ok(SegmentSearchResult { ids, distances })
}

fn search_one_file(
    file: FileDescriptor,
    metric: Metric,
    k: usize,
    nq: usize,
    queries: &[f32],
) -> anyhow::Result<SegmentSearchResult> {
    let handle = SegmentHandle::new(PathBuf::from(&file.location), file.dimension, metric);
    let mut engine: Box<dyn SegmentEngine> = if file.file_type == FileType::Index {
        Box::new(IndexEngine::new(handle))
    } else {
        Box::new(RawEngine::new(handle))
    };
    engine.load()?;
    engine.search(queries, nq, k)
}

fn sentinel_distance(metric: Metric) -> f32 {
    match metric {
        Metric::L2 => f32::INFINITY,
        Metric::Ip => f32::NEG_INFINITY,
    }
}

#[cfg(test)]
mod tests {
    use catalog::SqliteMetadataClient;
    use tempfile::tempdir;

    use super::*;
    use crate::memory::MemoryManager;

    fn catalog_with_table() -> (SqliteMetadataClient, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let catalog = SqliteMetadataClient::open_in_memory(dir.path().to_path_buf()).unwrap();
        catalog.create_table("widgets", 2, Metric::L2).unwrap();
        (catalog, dir)
    }

    #[tokio::test]
    async fn query_with_no_dates_returns_all_sentinel_rows() {
        let (catalog, _dir) = catalog_with_table();
        let result = query(&catalog, "widgets", 3, 1, &[1.0, 0.0], &[], 4)
            .await
            .unwrap();
        assert_eq!(result.ids, vec![SENTINEL_ID; 3]);
    }

    #[tokio::test]
    async fn query_finds_exact_match_across_raw_segments() {
        let (catalog, _dir) = catalog_with_table();
        let memory = MemoryManager::new();
        memory.insert("widgets", 2, &[1.0, 0.0, 0.0, 1.0]).unwrap();
        memory
            .serialize(&catalog, &Date::from("2024-01-01"))
            .unwrap();

        let result = query(
            &catalog,
            "widgets",
            1,
            1,
            &[1.0, 0.0],
            &[Date::from("2024-01-01")],
            4,
        )
        .await
        .unwrap();
        assert_eq!(result.ids, vec![1]);
    }

    #[tokio::test]
    async fn query_explicit_resolves_named_files_only() {
        let (catalog, _dir) = catalog_with_table();
        let memory = MemoryManager::new();
        memory.insert("widgets", 2, &[1.0, 0.0]).unwrap();
        memory
            .serialize(&catalog, &Date::from("2024-01-01"))
            .unwrap();
        let files = catalog.files_to_merge("widgets").unwrap();
        let file_id = files[&Date::from("2024-01-01")][0].file_id;

        let result = query_explicit(&catalog, "widgets", 1, 1, &[1.0, 0.0], &[file_id], 4)
            .await
            .unwrap();
        assert_eq!(result.ids, vec![1]);

        let missing = query_explicit(&catalog, "widgets", 1, 1, &[1.0, 0.0], &[999], 4)
            .await
            .unwrap();
        assert_eq!(missing.ids, vec![SENTINEL_ID]);
    }

    #[tokio::test]
    async fn k_zero_returns_empty_result() {
        let (catalog, _dir) = catalog_with_table();
        let result = query(&catalog, "widgets", 0, 1, &[1.0, 0.0], &[], 4)
            .await
            .unwrap();
        assert!(result.ids.is_empty());
    }

    #[tokio::test]
    async fn unknown_table_is_not_found() {
        let (catalog, _dir) = catalog_with_table();
        let err = query(&catalog, "ghost", 1, 1, &[1.0, 0.0], &[], 4)
            .await
            .unwrap_err();
        assert!(errors::EngineErrorExt::is_not_found(&err));
    }
}
