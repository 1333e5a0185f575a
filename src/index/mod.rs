// Vector index module
// LanceDB-backed chunk store with load-or-rebuild lifecycle


use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{
    Array, FixedSizeListArray, Float32Array, RecordBatchIterator, StringArray, UInt32Array,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use futures::TryStreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use lancedb::{Connection, DistanceType, Table};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::documents::Chunk;
use crate::model::{LanguageModel, run_blocking};
use crate::{QaError, Result};

pub const TABLE_NAME: &str = "chunks";
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Result of checking whether a persisted index exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexProbe {
    Missing,
    Present,
}

/// Lifecycle of the index owned by a QA system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexPhase {
    Uninitialized,
    Loading,
    Building,
    Ready,
}

impl std::fmt::Display for IndexPhase {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Loading => "loading",
            Self::Building => "building",
            Self::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// A retrieved chunk with its similarity to the query
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub chunk: Chunk,
    /// Cosine similarity, higher is closer
    pub similarity: f32,
    pub distance: f32,
    /// Insertion order of the record, used to break ties
    pub position: u32,
}

/// Persisted similarity-search table over chunk embeddings.
///
/// A value of this type is always ready to search: it is only produced by
/// opening a complete index or by finishing a build.
pub struct VectorIndex {
    table: Table,
    path: PathBuf,
    dimension: usize,
    record_count: usize,
}

impl std::fmt::Debug for VectorIndex {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("path", &self.path)
            .field("dimension", &self.dimension)
            .field("record_count", &self.record_count)
            .finish_non_exhaustive()
    }
}

/// Check for a persisted index. Existence only; contents are not inspected.
#[inline]
pub fn probe(path: &Path) -> IndexProbe {
    if path.exists() {
        IndexProbe::Present
    } else {
        IndexProbe::Missing
    }
}

impl VectorIndex {
    /// Open the index at `path`, or build it from `chunks` when it is missing
    /// or `force_rebuild` is set.
    ///
    /// `on_phase` is told whether the index is being loaded or built before
    /// any work starts.
    #[inline]
    pub async fn build_or_load<P, F>(
        chunks: P,
        path: &Path,
        force_rebuild: bool,
        embedder: Arc<dyn LanguageModel>,
        batch_size: usize,
        mut on_phase: F,
    ) -> Result<Self>
    where
        P: FnOnce() -> Result<Vec<Chunk>> + Send + 'static,
        F: FnMut(IndexPhase) + Send,
    {
        match probe(path) {
            IndexProbe::Present if !force_rebuild => {
                on_phase(IndexPhase::Loading);
                info!("Loading existing vector index from {}", path.display());
                Self::open(path).await
            }
            probed => {
                on_phase(IndexPhase::Building);
                if probed == IndexProbe::Present {
                    info!("Force rebuild requested for {}", path.display());
                } else {
                    info!("No vector index at {}, building", path.display());
                }

                let chunks = run_blocking(chunks).await?;

                Self::build(&chunks, path, embedder, batch_size).await
            }
        }
    }

    /// Open a persisted index
    #[inline]
    pub async fn open(path: &Path) -> Result<Self> {
        let corrupt = |reason: String| QaError::CorruptIndex {
            path: path.to_path_buf(),
            reason,
        };

        let connection = connect(path)
            .await
            .map_err(|e| corrupt(format!("cannot connect: {e}")))?;

        let table_names = connection
            .table_names()
            .execute()
            .await
            .map_err(|e| corrupt(format!("cannot list tables: {e}")))?;
        if !table_names.iter().any(|name| name == TABLE_NAME) {
            return Err(corrupt(format!("table '{TABLE_NAME}' not found")));
        }

        let table = connection
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(|e| corrupt(format!("cannot open table: {e}")))?;

        let schema = table
            .schema()
            .await
            .map_err(|e| corrupt(format!("cannot read schema: {e}")))?;
        let dimension = vector_dimension(&schema)
            .ok_or_else(|| corrupt("missing or malformed 'vector' column".to_string()))?;

        for column in ["text", "source_path", "page_number", "position"] {
            if schema.field_with_name(column).is_err() {
                return Err(corrupt(format!("missing '{column}' column")));
            }
        }

        let record_count = table
            .count_rows(None)
            .await
            .map_err(|e| corrupt(format!("cannot count rows: {e}")))?;

        info!(
            "Opened vector index at {} ({} records, {} dimensions)",
            path.display(),
            record_count,
            dimension
        );

        Ok(Self {
            table,
            path: path.to_path_buf(),
            dimension,
            record_count,
        })
    }

    /// Embed `chunks` in batches and persist them at `path`.
    ///
    /// The table is written to a sibling staging directory and moved onto
    /// `path` once every batch is stored, replacing any previous index.
    #[inline]
    pub async fn build(
        chunks: &[Chunk],
        path: &Path,
        embedder: Arc<dyn LanguageModel>,
        batch_size: usize,
    ) -> Result<Self> {
        if chunks.is_empty() {
            return Err(QaError::EmptyCorpus(path.to_path_buf()));
        }

        let batch_size = batch_size.max(1);
        let staging = staging_path(path)?;
        if let Some(parent) = staging.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if staging.exists() {
            warn!("Removing stale staging directory {}", staging.display());
            std::fs::remove_dir_all(&staging)?;
        }
        std::fs::create_dir_all(&staging)?;

        info!(
            "Building vector index from {} chunks in batches of {}",
            chunks.len(),
            batch_size
        );

        let result = write_batches(chunks, &staging, embedder, batch_size).await;
        if let Err(e) = result {
            if let Err(cleanup) = std::fs::remove_dir_all(&staging) {
                warn!(
                    "Could not remove staging directory {}: {}",
                    staging.display(),
                    cleanup
                );
            }
            return Err(e);
        }

        if path.exists() {
            debug!("Replacing previous index at {}", path.display());
            if path.is_dir() {
                std::fs::remove_dir_all(path)?;
            } else {
                std::fs::remove_file(path)?;
            }
        }
        std::fs::rename(&staging, path)?;
        info!("Vector index saved to {}", path.display());

        Self::open(path).await
    }

    /// The `k` records most similar to `query`, closest first.
    ///
    /// Ties are broken by insertion order, including ties that straddle the
    /// `k` cutoff. Returns every record when `k` exceeds the record count.
    #[inline]
    pub async fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        if k == 0 || self.record_count == 0 {
            return Ok(Vec::new());
        }
        if query.len() != self.dimension {
            return Err(QaError::Database(format!(
                "query vector has {} dimensions, index has {}",
                query.len(),
                self.dimension
            )));
        }

        debug!("Searching {} records for top {}", self.record_count, k);

        let k = k.min(self.record_count);
        let mut limit = k;
        let mut ranking = loop {
            let ranking = self.rank(query, limit).await?;
            let settled = ranking.len() >= self.record_count
                || ranking.len() < limit
                || ranking
                    .last()
                    .zip(ranking.get(k - 1))
                    .is_some_and(|(last, kth)| last.0 > kth.0);
            if settled {
                break ranking;
            }
            // Records tied with the k-th may have been cut off
            limit = limit.saturating_mul(2).min(self.record_count);
        };
        ranking.truncate(k);

        let mut chunks = self.fetch_chunks(&ranking).await?;
        let hits = ranking
            .into_iter()
            .map(|(distance, position)| {
                let chunk = chunks.remove(&position).ok_or_else(|| {
                    QaError::Database(format!("Record at position {position} vanished"))
                })?;
                Ok(SearchHit {
                    chunk,
                    similarity: 1.0 - distance,
                    distance,
                    position,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!("Search returned {} hits", hits.len());
        Ok(hits)
    }

    /// `(distance, position)` of the `limit` closest records, sorted
    async fn rank(&self, query: &[f32], limit: usize) -> Result<Vec<(f32, u32)>> {
        let mut results = self
            .table
            .vector_search(query)
            .map_err(|e| QaError::Database(format!("Failed to create vector search: {e}")))?
            .column("vector")
            .distance_type(DistanceType::Cosine)
            .select(Select::columns(&["position"]))
            .limit(limit)
            .execute()
            .await
            .map_err(|e| QaError::Database(format!("Failed to execute search: {e}")))?;

        let mut ranking = Vec::new();
        while let Some(batch) = results
            .try_next()
            .await
            .map_err(|e| QaError::Database(format!("Failed to read result stream: {e}")))?
        {
            ranking.extend(parse_ranking(&batch)?);
        }

        ranking.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        Ok(ranking)
    }

    async fn fetch_chunks(&self, ranking: &[(f32, u32)]) -> Result<HashMap<u32, Chunk>> {
        let positions = ranking
            .iter()
            .map(|(_, position)| position.to_string())
            .collect::<Vec<_>>()
            .join(", ");

        let mut results = self
            .table
            .query()
            .only_if(format!("position IN ({positions})"))
            .limit(ranking.len())
            .execute()
            .await
            .map_err(|e| QaError::Database(format!("Failed to fetch records: {e}")))?;

        let mut chunks = HashMap::with_capacity(ranking.len());
        while let Some(batch) = results
            .try_next()
            .await
            .map_err(|e| QaError::Database(format!("Failed to read result stream: {e}")))?
        {
            chunks.extend(parse_chunks(&batch)?);
        }
        Ok(chunks)
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.record_count
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

async fn connect(path: &Path) -> Result<Connection> {
    let uri = path.to_string_lossy();
    lancedb::connect(&uri)
        .execute()
        .await
        .map_err(|e| QaError::Database(format!("Failed to connect to LanceDB: {e}")))
}

/// Embed and store each batch in order; the first batch creates the table
async fn write_batches(
    chunks: &[Chunk],
    staging: &Path,
    embedder: Arc<dyn LanguageModel>,
    batch_size: usize,
) -> Result<()> {
    let connection = connect(staging).await?;
    let created_at = chrono::Utc::now().to_rfc3339();

    let bar = if console::user_attended_stderr() {
        ProgressBar::new(chunks.len() as u64).with_style(
            ProgressStyle::with_template("{bar:40} [{pos}/{len}] Embedding chunks")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        )
    } else {
        ProgressBar::hidden()
    };

    let mut table: Option<Table> = None;
    let mut dimension: Option<usize> = None;

    for (batch_index, batch) in chunks.chunks(batch_size).enumerate() {
        let start = batch_index * batch_size;
        let texts: Vec<String> = batch.iter().map(|chunk| chunk.text.clone()).collect();

        let model = Arc::clone(&embedder);
        let embeddings = run_blocking(move || model.embed_batch(&texts)).await?;

        if embeddings.len() != batch.len() {
            return Err(QaError::Upstream(format!(
                "expected {} embeddings, got {}",
                batch.len(),
                embeddings.len()
            )));
        }

        let dim = *dimension.get_or_insert_with(|| embeddings.first().map_or(0, Vec::len));
        if dim == 0 {
            return Err(QaError::Upstream("endpoint returned an empty embedding".to_string()));
        }

        let record_batch = build_record_batch(batch, &embeddings, start, dim, &created_at)?;
        let schema = record_batch.schema();
        let reader = RecordBatchIterator::new(std::iter::once(Ok(record_batch)), schema);

        match &table {
            None => {
                let created = connection
                    .create_table(TABLE_NAME, reader)
                    .execute()
                    .await
                    .map_err(|e| QaError::Database(format!("Failed to create table: {e}")))?;
                debug!("Created table '{}' with {} dimensions", TABLE_NAME, dim);
                table = Some(created);
            }
            Some(existing) => {
                existing
                    .add(reader)
                    .execute()
                    .await
                    .map_err(|e| QaError::Database(format!("Failed to insert records: {e}")))?;
            }
        }

        bar.inc(batch.len() as u64);
        debug!(
            "Stored batch {} ({} records)",
            batch_index + 1,
            batch.len()
        );
    }

    bar.finish_and_clear();
    Ok(())
}

fn schema(dimension: usize) -> Result<Arc<Schema>> {
    let dim = i32::try_from(dimension)
        .map_err(|_| QaError::Database(format!("vector dimension {dimension} is too large")))?;

    Ok(Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new(
            "vector",
            DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), dim),
            false,
        ),
        Field::new("text", DataType::Utf8, false),
        Field::new("source_path", DataType::Utf8, false),
        Field::new("page_number", DataType::UInt32, false),
        Field::new("position", DataType::UInt32, false),
        Field::new("created_at", DataType::Utf8, false),
    ])))
}

fn build_record_batch(
    chunks: &[Chunk],
    embeddings: &[Vec<f32>],
    start: usize,
    dimension: usize,
    created_at: &str,
) -> Result<RecordBatch> {
    let len = chunks.len();
    let mut ids = Vec::with_capacity(len);
    let mut texts = Vec::with_capacity(len);
    let mut sources = Vec::with_capacity(len);
    let mut pages = Vec::with_capacity(len);
    let mut positions = Vec::with_capacity(len);
    let mut flat_values = Vec::with_capacity(len * dimension);

    for (offset, (chunk, embedding)) in chunks.iter().zip(embeddings).enumerate() {
        if embedding.len() != dimension {
            return Err(QaError::Upstream(format!(
                "embedding has {} dimensions, expected {}",
                embedding.len(),
                dimension
            )));
        }

        let position = u32::try_from(start + offset)
            .map_err(|_| QaError::Database("too many records for one index".to_string()))?;

        ids.push(record_id(chunk, position).to_string());
        texts.push(chunk.text.as_str());
        sources.push(chunk.source_path.as_str());
        pages.push(chunk.page_number);
        positions.push(position);
        flat_values.extend_from_slice(embedding);
    }

    let schema = schema(dimension)?;
    let field = Arc::new(Field::new("item", DataType::Float32, true));
    let dim = i32::try_from(dimension)
        .map_err(|_| QaError::Database(format!("vector dimension {dimension} is too large")))?;
    let vector_array =
        FixedSizeListArray::try_new(field, dim, Arc::new(Float32Array::from(flat_values)), None)
            .map_err(|e| QaError::Database(format!("Failed to create vector array: {e}")))?;

    let arrays: Vec<Arc<dyn Array>> = vec![
        Arc::new(StringArray::from(ids)),
        Arc::new(vector_array),
        Arc::new(StringArray::from(texts)),
        Arc::new(StringArray::from(sources)),
        Arc::new(UInt32Array::from(pages)),
        Arc::new(UInt32Array::from(positions)),
        Arc::new(StringArray::from(vec![created_at; len])),
    ];

    RecordBatch::try_new(schema, arrays)
        .map_err(|e| QaError::Database(format!("Failed to create record batch: {e}")))
}

fn parse_ranking(batch: &RecordBatch) -> Result<Vec<(f32, u32)>> {
    let positions = u32_column(batch, "position")?;
    let distances = batch
        .column_by_name("_distance")
        .and_then(|col| col.as_any().downcast_ref::<Float32Array>());

    Ok((0..batch.num_rows())
        .map(|row| {
            let distance = distances.map_or(0.0, |d| if d.is_null(row) { 0.0 } else { d.value(row) });
            (distance, positions.value(row))
        })
        .collect())
}

fn parse_chunks(batch: &RecordBatch) -> Result<Vec<(u32, Chunk)>> {
    let texts = string_column(batch, "text")?;
    let sources = string_column(batch, "source_path")?;
    let pages = u32_column(batch, "page_number")?;
    let positions = u32_column(batch, "position")?;

    Ok((0..batch.num_rows())
        .map(|row| {
            let chunk = Chunk {
                text: texts.value(row).to_string(),
                source_path: sources.value(row).to_string(),
                page_number: pages.value(row),
            };
            (positions.value(row), chunk)
        })
        .collect())
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .ok_or_else(|| QaError::Database(format!("Missing {name} column")))?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| QaError::Database(format!("Invalid {name} column type")))
}

fn u32_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a UInt32Array> {
    batch
        .column_by_name(name)
        .ok_or_else(|| QaError::Database(format!("Missing {name} column")))?
        .as_any()
        .downcast_ref::<UInt32Array>()
        .ok_or_else(|| QaError::Database(format!("Invalid {name} column type")))
}

fn vector_dimension(schema: &Schema) -> Option<usize> {
    let field = schema.field_with_name("vector").ok()?;
    match field.data_type() {
        DataType::FixedSizeList(item, size) if *item.data_type() == DataType::Float32 => {
            usize::try_from(*size).ok().filter(|dim| *dim > 0)
        }
        _ => None,
    }
}

/// Sibling directory the next build is written to before it replaces `path`
fn staging_path(path: &Path) -> Result<PathBuf> {
    let name = path.file_name().ok_or_else(|| {
        QaError::Config(format!("index path {} has no final component", path.display()))
    })?;
    let mut staging_name = std::ffi::OsString::from(".");
    staging_name.push(name);
    staging_name.push(".staging");
    Ok(path.with_file_name(staging_name))
}

fn record_id(chunk: &Chunk, position: u32) -> Uuid {
    let key = format!("{}#{}#{}", chunk.source_path, chunk.page_number, position);
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes())
}
