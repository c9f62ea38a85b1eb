//! Entity store contract, store implementations, batched persistence and the HTTP page fetcher.

mod postgres;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use carwatch_core::{ListingSnapshot, WatchCatalog};
use futures::future::try_join_all;
use reqwest::redirect::Policy;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info_span, Instrument};

pub use postgres::PgEntityStore;
pub use reqwest::StatusCode;

pub const CRATE_NAME: &str = "carwatch-storage";

/// Largest chunk the store accepts in one grouped upsert.
pub const MAX_BATCH_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid batch: {0}")]
    InvalidBatch(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Connection settings handed to a store at construction.
#[derive(Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub max_connections: u32,
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("database_url", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    /// All watch definitions and notification rules in one read.
    async fn load_catalog(&self) -> Result<WatchCatalog, StoreError>;

    async fn read_partition(&self, partition_key: &str) -> Result<Vec<ListingSnapshot>, StoreError>;

    /// Atomic merge-upsert of one chunk. The chunk must hold at most [`MAX_BATCH_SIZE`]
    /// snapshots, all sharing one partition key.
    async fn upsert_batch(&self, chunk: &[ListingSnapshot]) -> Result<(), StoreError>;
}

/// Checks the chunk contract shared by every store implementation.
pub fn validate_chunk(chunk: &[ListingSnapshot]) -> Result<(), StoreError> {
    if chunk.len() > MAX_BATCH_SIZE {
        return Err(StoreError::InvalidBatch(format!(
            "chunk of {} exceeds limit of {MAX_BATCH_SIZE}",
            chunk.len()
        )));
    }
    if let Some(first) = chunk.first() {
        if let Some(other) = chunk.iter().find(|s| s.partition_key != first.partition_key) {
            return Err(StoreError::InvalidBatch(format!(
                "chunk spans partitions {} and {}",
                first.partition_key, other.partition_key
            )));
        }
    }
    Ok(())
}

/// Merge `incoming` into an existing record: `first_seen` and the key are kept, optional
/// text fields only overwrite when present.
pub fn merge_snapshot(existing: &mut ListingSnapshot, incoming: ListingSnapshot) {
    existing.trim = incoming.trim;
    existing.price = incoming.price;
    existing.km_driven = incoming.km_driven;
    existing.year = incoming.year;
    existing.href = incoming.href;
    existing.last_seen = incoming.last_seen;
    if incoming.description.is_some() {
        existing.description = incoming.description;
    }
    if incoming.region.is_some() {
        existing.region = incoming.region;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertRecord {
    pub partition_key: String,
    pub size: usize,
}

/// Process-local store. Keeps a log of accepted chunks and can be told to reject
/// writes for a partition.
#[derive(Debug, Default)]
pub struct InMemoryEntityStore {
    catalog: RwLock<WatchCatalog>,
    partitions: RwLock<BTreeMap<String, BTreeMap<String, ListingSnapshot>>>,
    upserts: Mutex<Vec<UpsertRecord>>,
    failing_partitions: RwLock<Vec<String>>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_catalog(catalog: WatchCatalog) -> Self {
        Self {
            catalog: RwLock::new(catalog),
            ..Self::default()
        }
    }

    pub async fn insert_snapshots(&self, snapshots: impl IntoIterator<Item = ListingSnapshot>) {
        let mut partitions = self.partitions.write().await;
        for snapshot in snapshots {
            partitions
                .entry(snapshot.partition_key.clone())
                .or_default()
                .insert(snapshot.id.clone(), snapshot);
        }
    }

    pub async fn snapshot(&self, partition_key: &str, id: &str) -> Option<ListingSnapshot> {
        self.partitions
            .read()
            .await
            .get(partition_key)
            .and_then(|p| p.get(id))
            .cloned()
    }

    pub async fn partition_len(&self, partition_key: &str) -> usize {
        self.partitions
            .read()
            .await
            .get(partition_key)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    pub async fn upsert_log(&self) -> Vec<UpsertRecord> {
        self.upserts.lock().await.clone()
    }

    pub async fn fail_upserts_for(&self, partition_key: impl Into<String>) {
        self.failing_partitions.write().await.push(partition_key.into());
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn load_catalog(&self) -> Result<WatchCatalog, StoreError> {
        Ok(self.catalog.read().await.clone())
    }

    async fn read_partition(&self, partition_key: &str) -> Result<Vec<ListingSnapshot>, StoreError> {
        Ok(self
            .partitions
            .read()
            .await
            .get(partition_key)
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert_batch(&self, chunk: &[ListingSnapshot]) -> Result<(), StoreError> {
        validate_chunk(chunk)?;
        let Some(first) = chunk.first() else {
            return Ok(());
        };
        if self
            .failing_partitions
            .read()
            .await
            .iter()
            .any(|p| p == &first.partition_key)
        {
            return Err(StoreError::Unavailable(format!(
                "writes to partition {} rejected",
                first.partition_key
            )));
        }

        let mut partitions = self.partitions.write().await;
        let partition = partitions.entry(first.partition_key.clone()).or_default();
        for incoming in chunk {
            match partition.get_mut(&incoming.id) {
                Some(existing) => merge_snapshot(existing, incoming.clone()),
                None => {
                    partition.insert(incoming.id.clone(), incoming.clone());
                }
            }
        }
        drop(partitions);

        self.upserts.lock().await.push(UpsertRecord {
            partition_key: first.partition_key.clone(),
            size: chunk.len(),
        });
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("chunk {chunk_index} of partition {partition_key} failed: {source}")]
    Chunk {
        partition_key: String,
        chunk_index: usize,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistReport {
    pub partitions: usize,
    pub chunks: usize,
    pub entities: usize,
}

/// Groups snapshots by partition and writes each partition as a sequence of chunks.
#[derive(Debug, Clone, Copy)]
pub struct BatchPersister {
    batch_size: usize,
}

impl Default for BatchPersister {
    fn default() -> Self {
        Self {
            batch_size: MAX_BATCH_SIZE,
        }
    }
}

impl BatchPersister {
    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.clamp(1, MAX_BATCH_SIZE),
        }
    }

    /// Partition key -> chunks, in key order. Chunks never mix partitions.
    pub fn plan(&self, entities: Vec<ListingSnapshot>) -> BTreeMap<String, Vec<Vec<ListingSnapshot>>> {
        let mut grouped: BTreeMap<String, Vec<ListingSnapshot>> = BTreeMap::new();
        for entity in entities {
            grouped
                .entry(entity.partition_key.clone())
                .or_default()
                .push(entity);
        }

        grouped
            .into_iter()
            .map(|(key, items)| {
                let chunks = items
                    .chunks(self.batch_size)
                    .map(<[ListingSnapshot]>::to_vec)
                    .collect();
                (key, chunks)
            })
            .collect()
    }

    /// Chunks of one partition go out in order and the first failure stops that partition.
    /// Separate partitions are written concurrently.
    pub async fn persist(
        &self,
        entities: Vec<ListingSnapshot>,
        store: &dyn EntityStore,
    ) -> Result<PersistReport, PersistError> {
        if entities.is_empty() {
            return Ok(PersistReport::default());
        }

        let entity_count = entities.len();
        let plan = self.plan(entities);
        let partition_count = plan.len();

        let writes = plan.into_iter().map(|(partition_key, chunks)| {
            let span = info_span!("persist_partition", partition_key = %partition_key);
            async move {
                let chunk_count = chunks.len();
                for (chunk_index, chunk) in chunks.iter().enumerate() {
                    store
                        .upsert_batch(chunk)
                        .await
                        .map_err(|source| PersistError::Chunk {
                            partition_key: partition_key.clone(),
                            chunk_index,
                            source,
                        })?;
                    debug!(chunk_index, size = chunk.len(), "chunk persisted");
                }
                Ok::<usize, PersistError>(chunk_count)
            }
            .instrument(span)
        });

        let chunk_counts = try_join_all(writes).await?;
        Ok(PersistReport {
            partitions: partition_count,
            chunks: chunk_counts.into_iter().sum(),
            entities: entity_count,
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Single-attempt GET client. Redirects are returned as-is rather than followed.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .redirect(Policy::none())
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().map_err(FetchError::Client)?;
        Ok(Self { client })
    }

    /// Returns the page for any status; only transport failures are errors.
    pub async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let request_error = |source| FetchError::Request {
                url: url.to_string(),
                source,
            };
            let resp = self.client.get(url).send().await.map_err(request_error)?;
            let status = resp.status();
            let body = if status.is_success() {
                resp.text().await.map_err(request_error)?
            } else {
                String::new()
            };
            debug!(%status, bytes = body.len(), "page fetched");
            Ok(FetchedPage { status, body })
        }
        .instrument(span)
        .await
    }
}
