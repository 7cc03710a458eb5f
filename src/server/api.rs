//! HTTP API over the cache.
//!
//! - POST /v1/cache/query  : KV state for `path + [next]` from the sealed snapshot
//! - POST /v1/cache/match  : longest cached prefix of a token sequence
//! - POST /v1/cache/update : store KV state in the open revision
//! - POST /v1/cache/evict  : evict oldest leaf entries
//! - POST /v1/cache/seal   : publish the open revision
//! - GET  /v1/cache/stats
//! - GET  /health
//! - GET  /metrics

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::{BuilderStats, Cache, CacheBuilder, CacheMeta, Evictor, Token, VersionAuthority};
use crate::config::{Config, StorageBackend};
use crate::error::CacheError;
use crate::server::metrics::CacheMetrics;
use crate::storage::{ObjectStore, StoreError};

/// File next to the disk store recording the current published revision.
const MANIFEST: &str = "current.json";

/// Application state shared across handlers.
pub struct AppState {
    /// The single open revision; writers serialize on this lock.
    pub builder: Mutex<CacheBuilder>,
    /// Last sealed snapshot, read without touching the builder.
    pub published: RwLock<Option<Arc<Cache>>>,
    pub authority: VersionAuthority,
    pub evictor: Evictor,
    pub store: Arc<dyn ObjectStore>,
    pub config: Arc<Config>,
    pub metrics: CacheMetrics,
    pub start_time: Instant,
}

impl AppState {
    /// Build the state, resuming from the last published revision when the
    /// disk store has one.
    pub fn new(config: Arc<Config>, store: Arc<dyn ObjectStore>) -> anyhow::Result<Self> {
        let (builder, published, authority) = match load_manifest(&config)? {
            Some(meta) => {
                let cache = Arc::new(Cache::resolve(&meta, store.as_ref())?);
                let configured = &config.cache;
                if (configured.tensor_nbytes, configured.layer, configured.block_size, configured.cache_capacity)
                    != (meta.tensor_nbytes, meta.layer, meta.block_size, meta.cache_capacity)
                {
                    warn!(
                        configured_tensor_nbytes = configured.tensor_nbytes,
                        configured_layer = configured.layer,
                        configured_block_size = configured.block_size,
                        configured_capacity = configured.cache_capacity,
                        layout = ?cache.layout(),
                        capacity = meta.cache_capacity,
                        "Cache config differs from the persisted revision; keeping the persisted layout"
                    );
                }
                info!(
                    version = cache.version(),
                    entries = cache.len(),
                    blocks = cache.block_ids().len(),
                    "Resumed published cache"
                );
                let builder = CacheBuilder::from_cache(&cache, store.clone());
                (builder, Some(cache), VersionAuthority::with_published(meta))
            }
            None => (
                CacheBuilder::from_config(&config.cache, store.clone())?,
                None,
                VersionAuthority::new(),
            ),
        };

        Ok(Self {
            builder: Mutex::new(builder),
            published: RwLock::new(published),
            authority,
            evictor: Evictor::new(),
            store,
            config,
            metrics: CacheMetrics::new()?,
            start_time: Instant::now(),
        })
    }
}

fn manifest_path(config: &Config) -> Option<PathBuf> {
    (config.storage.backend == StorageBackend::Disk).then(|| config.storage.path.join(MANIFEST))
}

fn load_manifest(config: &Config) -> anyhow::Result<Option<CacheMeta>> {
    let Some(path) = manifest_path(config) else {
        return Ok(None);
    };
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(&path)?;
    Ok(Some(CacheMeta::from_json(&data)?))
}

fn store_manifest(config: &Config, meta: &CacheMeta) -> Result<(), CacheError> {
    if let Some(path) = manifest_path(config) {
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, meta.to_json()?)
            .and_then(|_| std::fs::rename(&tmp, &path))
            .map_err(StoreError::from)?;
    }
    Ok(())
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/cache/query", post(query))
        .route("/v1/cache/match", post(match_prefix))
        .route("/v1/cache/update", post(update))
        .route("/v1/cache/evict", post(evict))
        .route("/v1/cache/seal", post(seal))
        .route("/v1/cache/stats", get(cache_stats))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

// ─── Errors ────────────────────────────────────────────────────────────────

/// A cache error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub CacheError);

impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        ApiError(err)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub retryable: bool,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            CacheError::KeyNotFound | CacheError::UnknownBlock(_) => StatusCode::NOT_FOUND,
            CacheError::CapacityExceeded(_) => StatusCode::INSUFFICIENT_STORAGE,
            CacheError::VersionConflict { .. }
            | CacheError::NotOpen(_)
            | CacheError::NothingToRollback => StatusCode::CONFLICT,
            CacheError::PayloadSize { .. }
            | CacheError::StaleHandle
            | CacheError::IncompatibleLayout(_)
            | CacheError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            CacheError::Corruption(_) | CacheError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "Cache request failed");
        }
        let body = ErrorResponse {
            error: self.0.to_string(),
            retryable: self.0.is_retryable(),
        };
        (status, Json(body)).into_response()
    }
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub path: Vec<Token>,
    pub next: Token,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryResponse {
    pub version: u64,
    /// Per-layer KV state, layers concatenated.
    pub kv: Vec<u8>,
}

#[derive(Debug, Deserialize)]
pub struct MatchRequest {
    pub tokens: Vec<Token>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MatchResponse {
    pub version: u64,
    /// Number of leading tokens whose KV state is cached.
    pub matched: usize,
}

#[derive(Debug, Deserialize)]
pub struct UpdateRequest {
    pub path: Vec<Token>,
    pub next: Token,
    pub kv: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateResponse {
    pub version: u64,
    /// Entries evicted to make room for this update.
    pub evicted: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct EvictRequest {
    /// Entries to evict; defaults to the configured batch size.
    #[serde(default)]
    pub count: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EvictResponse {
    pub version: u64,
    pub evicted: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SealResponse {
    pub version: u64,
    pub entries: usize,
    pub blocks: usize,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub published_version: u64,
    pub published_entries: usize,
    pub builder: BuilderStats,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub published_version: u64,
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn snapshot(state: &AppState) -> Option<Arc<Cache>> {
    state.published.read().await.clone()
}

async fn query(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, ApiError> {
    let result = match snapshot(&state).await {
        Some(cache) => cache.query(&req.path, req.next).map(|kv| (cache.version(), kv)),
        None => Err(CacheError::KeyNotFound),
    };
    state.metrics.record_query(result.is_ok());

    let (version, kv) = result?;
    Ok(Json(QueryResponse {
        version,
        kv: kv.into_bytes().to_vec(),
    }))
}

async fn match_prefix(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MatchRequest>,
) -> Json<MatchResponse> {
    let (version, matched) = match snapshot(&state).await {
        Some(cache) => (cache.version(), cache.match_prefix(&req.tokens)),
        None => (0, 0),
    };
    Json(MatchResponse { version, matched })
}

async fn update(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UpdateRequest>,
) -> Result<Json<UpdateResponse>, ApiError> {
    let mut builder = state.builder.lock().await;
    let splits_before = builder.stats().splits;
    let mut evicted = 0;

    let result = match builder.update(&req.path, req.next, &req.kv) {
        Err(CacheError::CapacityExceeded(reason)) => {
            let batch = state.config.eviction.batch_size;
            warn!(%reason, batch, "Cache full, evicting before retry");
            evicted = builder.evict(&state.evictor, batch)?.len();
            state.metrics.evictions.inc_by(evicted as u64);
            builder.update(&req.path, req.next, &req.kv)
        }
        other => other,
    };
    result?;

    let stats = builder.stats();
    state.metrics.record_update();
    state.metrics.splits.inc_by(stats.splits.saturating_sub(splits_before));
    state.metrics.observe(&stats);

    Ok(Json(UpdateResponse {
        version: stats.version,
        evicted,
    }))
}

async fn evict(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EvictRequest>,
) -> Result<Json<EvictResponse>, ApiError> {
    let count = req.count.unwrap_or(state.config.eviction.batch_size);
    let mut builder = state.builder.lock().await;
    let evicted = builder.evict(&state.evictor, count)?.len();

    let stats = builder.stats();
    state.metrics.evictions.inc_by(evicted as u64);
    state.metrics.observe(&stats);
    info!(requested = count, evicted, "Eviction request");

    Ok(Json(EvictResponse {
        version: stats.version,
        evicted,
    }))
}

async fn seal(State(state): State<Arc<AppState>>) -> Result<Json<SealResponse>, ApiError> {
    let request_id = Uuid::new_v4().to_string();
    let mut builder = state.builder.lock().await;

    let cache = Arc::new(builder.publish(&state.authority)?);
    // The manifest must name the new revision before the old one's objects go.
    let recorded = store_manifest(&state.config, cache.meta());
    let collected = match &recorded {
        Ok(()) => builder.collect_garbage(),
        Err(e) => {
            error!(request_id, error = %e, "Failed to record published revision, keeping superseded objects");
            0
        }
    };
    *builder = CacheBuilder::from_cache(&cache, state.store.clone());
    *state.published.write().await = Some(cache.clone());

    state.metrics.seals.inc();
    state.metrics.observe(&builder.stats());
    recorded?;
    info!(
        request_id,
        version = cache.version(),
        entries = cache.len(),
        collected,
        "Published cache revision"
    );

    Ok(Json(SealResponse {
        version: cache.version(),
        entries: cache.len(),
        blocks: cache.block_ids().len(),
    }))
}

async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let builder = state.builder.lock().await.stats();
    let (published_version, published_entries) = match snapshot(&state).await {
        Some(cache) => (cache.version(), cache.len()),
        None => (0, 0),
    };
    Json(StatsResponse {
        published_version,
        published_entries,
        builder,
    })
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        published_version: state.authority.published(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.encode() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {e}"),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{open_store, MemoryStore};

    fn state(capacity: usize) -> Arc<AppState> {
        let mut config = Config::default();
        config.cache.tensor_nbytes = 2;
        config.cache.layer = 2;
        config.cache.block_size = 2;
        config.cache.cache_capacity = capacity;
        config.eviction.batch_size = 1;
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new(1 << 20));
        Arc::new(AppState::new(Arc::new(config), store).unwrap())
    }

    fn update_req(path: Vec<Token>, next: Token, byte: u8) -> Json<UpdateRequest> {
        Json(UpdateRequest {
            path,
            next,
            kv: vec![byte; 4],
        })
    }

    #[tokio::test]
    async fn test_update_seal_query() {
        let state = state(16);
        update(State(state.clone()), update_req(vec![1, 2], 3, 7))
            .await
            .unwrap();

        // Not visible to readers before the seal.
        let miss = query(
            State(state.clone()),
            Json(QueryRequest { path: vec![1, 2], next: 3 }),
        )
        .await
        .unwrap_err();
        assert_eq!(miss.status(), StatusCode::NOT_FOUND);

        let sealed = seal(State(state.clone())).await.unwrap();
        assert_eq!(sealed.version, 1);
        assert_eq!(sealed.entries, 1);

        let hit = query(
            State(state.clone()),
            Json(QueryRequest { path: vec![1, 2], next: 3 }),
        )
        .await
        .unwrap();
        assert_eq!(hit.kv, vec![7; 4]);
        assert_eq!(state.metrics.queries(true), 1);
        assert_eq!(state.metrics.queries(false), 1);

        let matched = match_prefix(
            State(state.clone()),
            Json(MatchRequest { tokens: vec![1, 2, 3, 4] }),
        )
        .await;
        assert_eq!(matched.matched, 3);
    }

    #[tokio::test]
    async fn test_update_evicts_when_full() {
        // Two blocks of two slots.
        let state = state(4);
        for token in 0..4 {
            update(State(state.clone()), update_req(vec![token], 0, 1))
                .await
                .unwrap();
        }
        let resp = update(State(state.clone()), update_req(vec![9], 0, 2))
            .await
            .unwrap();
        assert_eq!(resp.evicted, 1);

        let stats = cache_stats(State(state.clone())).await;
        assert_eq!(stats.builder.entries, 4);
        assert_eq!(stats.builder.live_blocks, 2);
    }

    #[tokio::test]
    async fn test_payload_size_is_bad_request() {
        let state = state(16);
        let err = update(
            State(state),
            Json(UpdateRequest {
                path: vec![1],
                next: 2,
                kv: vec![0; 3],
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_seal_opens_next_revision() {
        let state = state(16);
        update(State(state.clone()), update_req(vec![1], 2, 1))
            .await
            .unwrap();
        seal(State(state.clone())).await.unwrap();
        update(State(state.clone()), update_req(vec![1], 3, 1))
            .await
            .unwrap();
        let second = seal(State(state.clone())).await.unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.entries, 2);
        assert_eq!(state.authority.published(), 2);

        let health = health(State(state)).await;
        assert_eq!(health.published_version, 2);
    }

    fn disk_state(dir: &std::path::Path) -> Arc<AppState> {
        disk_state_with(dir, |_| {})
    }

    fn disk_state_with(dir: &std::path::Path, adjust: impl FnOnce(&mut Config)) -> Arc<AppState> {
        let mut config = Config::default();
        config.cache.tensor_nbytes = 2;
        config.cache.layer = 2;
        config.cache.block_size = 2;
        config.cache.cache_capacity = 16;
        config.storage.backend = StorageBackend::Disk;
        config.storage.path = dir.to_path_buf();
        config.storage.zstd_compression = false;
        adjust(&mut config);
        let store = open_store(&config.storage).unwrap();
        Arc::new(AppState::new(Arc::new(config), store).unwrap())
    }

    fn query_req(path: Vec<Token>, next: Token) -> Json<QueryRequest> {
        Json(QueryRequest { path, next })
    }

    #[tokio::test]
    async fn test_restart_resumes_latest_revision() {
        let dir = tempfile::tempdir().unwrap();
        let state = disk_state(dir.path());
        update(State(state.clone()), update_req(vec![1], 2, 1))
            .await
            .unwrap();
        seal(State(state.clone())).await.unwrap();
        update(State(state.clone()), update_req(vec![1], 3, 2))
            .await
            .unwrap();
        // Collects the first revision's tree object.
        seal(State(state.clone())).await.unwrap();
        drop(state);

        let resumed = disk_state(dir.path());
        assert_eq!(resumed.authority.published(), 2);
        let hit = query(State(resumed.clone()), query_req(vec![1], 3)).await.unwrap();
        assert_eq!(hit.kv, vec![2; 4]);
        let hit = query(State(resumed), query_req(vec![1], 2)).await.unwrap();
        assert_eq!(hit.kv, vec![1; 4]);
    }

    #[tokio::test]
    async fn test_unrecorded_seal_keeps_previous_revision() {
        let dir = tempfile::tempdir().unwrap();
        let state = disk_state(dir.path());
        update(State(state.clone()), update_req(vec![1], 2, 1))
            .await
            .unwrap();
        seal(State(state.clone())).await.unwrap();

        // A directory in the way of the manifest's temporary file.
        let blocker = dir.path().join("current.json.tmp");
        std::fs::create_dir(&blocker).unwrap();
        update(State(state.clone()), update_req(vec![1], 2, 9))
            .await
            .unwrap();
        let err = seal(State(state.clone())).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(state.authority.published(), 2);
        std::fs::remove_dir(&blocker).unwrap();
        drop(state);

        let resumed = disk_state(dir.path());
        assert_eq!(resumed.authority.published(), 1);
        let hit = query(State(resumed), query_req(vec![1], 2)).await.unwrap();
        assert_eq!(hit.kv, vec![1; 4]);
    }

    #[tokio::test]
    async fn test_resume_keeps_persisted_layout() {
        let dir = tempfile::tempdir().unwrap();
        let state = disk_state(dir.path());
        update(State(state.clone()), update_req(vec![4], 5, 3))
            .await
            .unwrap();
        seal(State(state.clone())).await.unwrap();
        drop(state);

        let resumed = disk_state_with(dir.path(), |config| {
            config.cache.tensor_nbytes = 8;
            config.cache.block_size = 4;
        });
        let stats = cache_stats(State(resumed.clone())).await;
        assert_eq!(stats.published_version, 1);
        assert_eq!(resumed.builder.lock().await.layout().tensor_nbytes, 2);

        // Payloads are still sized by the persisted layout.
        update(State(resumed.clone()), update_req(vec![4], 6, 1))
            .await
            .unwrap();
        let hit = query(State(resumed), query_req(vec![4], 5)).await.unwrap();
        assert_eq!(hit.kv, vec![3; 4]);
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (CacheError::KeyNotFound, StatusCode::NOT_FOUND),
            (CacheError::CapacityExceeded("full".into()), StatusCode::INSUFFICIENT_STORAGE),
            (
                CacheError::VersionConflict { builder: 1, published: 2 },
                StatusCode::CONFLICT,
            ),
            (CacheError::corruption("bad"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status(), status);
        }
    }
}
