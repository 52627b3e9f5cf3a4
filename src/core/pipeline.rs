//! Folder scan, feature extraction and similarity search.
//!
//! A scan runs `Scanning -> Extracting -> ThumbnailLoading -> Ready`.
//! Starting a new scan for a folder role cancels the previous one for that
//! role; its results are dropped, never merged.

use crate::config::{AppConfig, FeatureMode};
use crate::core::embedding::EmbeddingService;
use crate::core::hash::HashService;
use crate::core::image::{FileStamp, ImageRecord};
use crate::core::scanner::{new_cancellation_token, CancellationToken, ScanError, ScannerService};
use crate::core::similarity::score_records;
use crate::core::thumbnail::ThumbnailService;
use crate::database::FeatureCache;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Scan error: {0}")]
    Scan(ScanError),

    #[error("Embedding model unavailable: {reason}")]
    ModelUnavailable { reason: String },

    #[error("Worker pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl From<ScanError> for PipelineError {
    fn from(e: ScanError) -> Self {
        match e {
            ScanError::Cancelled => PipelineError::Cancelled,
            other => PipelineError::Scan(other),
        }
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(e: tokio::task::JoinError) -> Self {
        PipelineError::Task(e.to_string())
    }
}

/// Search precondition failures. `Display` is the user-facing status.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SearchError {
    #[error("No folder has been scanned yet")]
    NotScanned,

    #[error("{0} is not part of the current scan")]
    SourceNotFound(String),

    #[error("{0} has no features to compare")]
    SourceHasNoFeatures(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FolderRole {
    Primary,
    Compare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    Idle,
    Scanning,
    Extracting,
    ThumbnailLoading,
    Ready,
    Searching,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanPhase {
    Discovery,
    Extracting,
    Hashing,
    ThumbnailLoading,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanProgress {
    pub role: FolderRole,
    pub phase: ScanPhase,
    pub processed: usize,
    pub total: usize,
    pub current_file: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub folder: PathBuf,
    pub total_images: usize,
    pub cache_hits: usize,
    pub extracted: usize,
    pub embedding_failures: usize,
    pub hashed: usize,
    /// Images with neither an embedding nor a hash.
    pub failed: usize,
    pub model_available: bool,
}

#[derive(Clone)]
struct ProgressReporter {
    sender: Option<mpsc::UnboundedSender<ScanProgress>>,
}

impl ProgressReporter {
    fn report(&self, role: FolderRole, phase: ScanPhase, processed: usize, total: usize, file: &str) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(ScanProgress {
                role,
                phase,
                processed,
                total,
                current_file: file.to_string(),
            });
        }
    }
}

struct FolderSlot {
    folder: Option<PathBuf>,
    token: CancellationToken,
    generation: u64,
    records: Vec<ImageRecord>,
    cache: Option<Arc<FeatureCache>>,
}

impl Default for FolderSlot {
    fn default() -> Self {
        Self {
            folder: None,
            token: new_cancellation_token(),
            generation: 0,
            records: Vec::new(),
            cache: None,
        }
    }
}

struct ScanContext {
    role: FolderRole,
    generation: u64,
    token: CancellationToken,
}

impl ScanContext {
    fn check(&self) -> Result<(), PipelineError> {
        if self.token.load(Ordering::Relaxed) {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// The folder's cache, consulted only while caching stays enabled.
struct CacheHandle {
    cache: Option<Arc<FeatureCache>>,
    enabled: Arc<AtomicBool>,
}

impl CacheHandle {
    fn active(&self) -> Option<&FeatureCache> {
        self.cache
            .as_deref()
            .filter(|_| self.enabled.load(Ordering::Relaxed))
    }
}

#[derive(Default)]
struct ExtractionCounts {
    cache_hits: usize,
    extracted: usize,
    failed: usize,
}

pub struct Pipeline {
    config: AppConfig,
    scanner: Arc<ScannerService>,
    hasher: Arc<HashService>,
    hash_pool: Arc<rayon::ThreadPool>,
    embedder: Option<Arc<EmbeddingService>>,
    thumbnails: Arc<ThumbnailService>,
    primary: Mutex<FolderSlot>,
    compare: Mutex<FolderSlot>,
    state: Mutex<PipelineState>,
    cache_enabled: Arc<AtomicBool>,
    cache_gate: tokio::sync::Mutex<()>,
    reporter: ProgressReporter,
}

impl Pipeline {
    /// Build a pipeline whose embedder loads `config.model_path`, if set.
    pub fn new(config: AppConfig) -> Result<Self, PipelineError> {
        let embedder = config.model_path.as_ref().map(|path| {
            Arc::new(EmbeddingService::onnx(
                path.clone(),
                config.model_input_size,
                config.prefer_gpu,
            ))
        });
        Self::with_embedder(config, embedder)
    }

    pub fn with_embedder(
        config: AppConfig,
        embedder: Option<Arc<EmbeddingService>>,
    ) -> Result<Self, PipelineError> {
        let hash_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.parallel_workers)
            .build()?;

        Ok(Self {
            scanner: Arc::new(ScannerService::new(&config.supported_formats)),
            hasher: Arc::new(HashService::new()),
            hash_pool: Arc::new(hash_pool),
            embedder,
            thumbnails: Arc::new(ThumbnailService::new(
                config.thumbnail_size,
                config.thumbnail_cache_bytes,
            )),
            primary: Mutex::new(FolderSlot::default()),
            compare: Mutex::new(FolderSlot::default()),
            state: Mutex::new(PipelineState::Idle),
            cache_enabled: Arc::new(AtomicBool::new(config.cache_enabled)),
            cache_gate: tokio::sync::Mutex::new(()),
            reporter: ProgressReporter { sender: None },
            config,
        })
    }

    pub fn with_progress_sender(mut self, sender: mpsc::UnboundedSender<ScanProgress>) -> Self {
        self.reporter = ProgressReporter {
            sender: Some(sender),
        };
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn embedder(&self) -> Option<&Arc<EmbeddingService>> {
        self.embedder.as_ref()
    }

    /// Visible records for `role`, in file-name order.
    pub fn records(&self, role: FolderRole) -> Vec<ImageRecord> {
        self.lock_slot(role).records.clone()
    }

    pub fn folder(&self, role: FolderRole) -> Option<PathBuf> {
        self.lock_slot(role).folder.clone()
    }

    pub fn cache(&self, role: FolderRole) -> Option<Arc<FeatureCache>> {
        self.lock_slot(role).cache.clone()
    }

    pub fn set_cache_enabled(&self, enabled: bool) {
        self.cache_enabled.store(enabled, Ordering::Relaxed);
        if !enabled {
            self.lock_slot(FolderRole::Primary).cache = None;
            self.lock_slot(FolderRole::Compare).cache = None;
        }
    }

    /// Forget the compare folder; searches go back to the primary scan.
    pub fn clear_compare(&self) {
        let mut slot = self.lock_slot(FolderRole::Compare);
        slot.token.store(true, Ordering::Relaxed);
        let generation = slot.generation + 1;
        *slot = FolderSlot {
            generation,
            ..FolderSlot::default()
        };
    }

    /// Cancel running scans and release the model session.
    pub fn shutdown(&self) {
        for role in [FolderRole::Primary, FolderRole::Compare] {
            let mut slot = self.lock_slot(role);
            slot.token.store(true, Ordering::Relaxed);
            slot.cache = None;
        }
        if let Some(embedder) = &self.embedder {
            embedder.dispose();
        }
        self.thumbnails.clear();
        self.set_state(PipelineState::Idle);
    }

    /// Scan `folder`, extract features and load thumbnails.
    ///
    /// Records become visible through `records` as their thumbnails finish.
    pub async fn scan_folder(
        &self,
        folder: &Path,
        role: FolderRole,
    ) -> Result<ScanSummary, PipelineError> {
        let ctx = self.begin_scan(folder, role);
        self.attach_cache(folder, &ctx).await;
        let result = self.run_scan(folder, &ctx).await;

        match &result {
            Ok(summary) => log::info!(
                "Scanned {}: {} images, {} cached, {} extracted, {} embedding failures, {} hashed, {} skipped",
                folder.display(),
                summary.total_images,
                summary.cache_hits,
                summary.extracted,
                summary.embedding_failures,
                summary.hashed,
                summary.failed
            ),
            Err(PipelineError::Cancelled) => {
                log::info!("Scan of {} cancelled", folder.display())
            }
            Err(e) => {
                log::error!("Scan of {} failed: {}", folder.display(), e);
                self.set_state_if_current(&ctx, PipelineState::Idle);
            }
        }
        result
    }

    /// Rank candidates against `source`, a record of the primary scan.
    ///
    /// Candidates come from the compare scan when one is set, otherwise from
    /// the primary scan minus the source itself. Results are sorted by
    /// descending similarity; ties keep file-name order.
    pub fn search(
        &self,
        source: &Path,
        threshold: Option<f32>,
    ) -> Result<Vec<ImageRecord>, SearchError> {
        let threshold = threshold.unwrap_or(self.config.similarity_threshold);

        let (primary_folder, primary) = {
            let slot = self.lock_slot(FolderRole::Primary);
            (slot.folder.clone(), slot.records.clone())
        };
        if primary_folder.is_none() {
            return Err(SearchError::NotScanned);
        }

        let source_record = primary
            .iter()
            .find(|r| r.path == source)
            .cloned()
            .ok_or_else(|| SearchError::SourceNotFound(source.display().to_string()))?;
        if !source_record.has_features() {
            return Err(SearchError::SourceHasNoFeatures(source_record.file_name));
        }

        let candidates = {
            let slot = self.lock_slot(FolderRole::Compare);
            if slot.folder.is_some() {
                slot.records.clone()
            } else {
                primary
            }
        };

        let was_ready = self.enter_search();
        let mut results: Vec<ImageRecord> = self.hash_pool.install(|| {
            candidates
                .into_par_iter()
                .filter(|candidate| candidate.path != source_record.path)
                .filter_map(|mut candidate| {
                    let (score, _) = score_records(&source_record, &candidate)?;
                    candidate.similarity = score;
                    Some(candidate)
                })
                .filter(|candidate| candidate.similarity >= threshold)
                .collect()
        });
        results.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        if was_ready {
            self.set_state(PipelineState::Ready);
        }

        log::debug!(
            "Search for {} returned {} results at threshold {}",
            source_record.file_name,
            results.len(),
            threshold
        );
        Ok(results)
    }

    fn begin_scan(&self, folder: &Path, role: FolderRole) -> ScanContext {
        let token = new_cancellation_token();

        let (generation, folder_changed) = {
            let mut slot = self.lock_slot(role);
            slot.token.store(true, Ordering::Relaxed);
            slot.token = token.clone();
            slot.generation += 1;
            slot.records.clear();

            let folder_changed = slot.folder.as_deref() != Some(folder);
            if folder_changed {
                // Release the old folder's cache before opening the next one.
                slot.cache = None;
                slot.folder = Some(folder.to_path_buf());
            }
            (slot.generation, folder_changed)
        };

        if folder_changed {
            self.thumbnails.clear();
        }
        self.set_state(PipelineState::Scanning);

        ScanContext {
            role,
            generation,
            token,
        }
    }

    async fn run_scan(
        &self,
        folder: &Path,
        ctx: &ScanContext,
    ) -> Result<ScanSummary, PipelineError> {
        self.reporter.report(
            ctx.role,
            ScanPhase::Discovery,
            0,
            0,
            &folder.to_string_lossy(),
        );

        let mut records = self.discover(folder, ctx).await?;

        let mut summary = ScanSummary {
            folder: folder.to_path_buf(),
            total_images: records.len(),
            ..ScanSummary::default()
        };

        if self.config.feature_mode == FeatureMode::Embedding {
            self.set_state_if_current(ctx, PipelineState::Extracting);
            records = self.extract_embeddings(records, ctx, &mut summary).await?;
        }
        if self.config.feature_mode == FeatureMode::Hash || self.config.fallback_to_hash {
            self.set_state_if_current(ctx, PipelineState::Extracting);
            records = self.compute_hashes(records, ctx).await?;
            summary.hashed = records.iter().filter(|r| r.hash.is_some()).count();
        }

        summary.failed = records.iter().filter(|r| !r.has_features()).count();
        if summary.failed > 0 {
            log::info!(
                "{} of {} images in {} have no features and are excluded from search",
                summary.failed,
                summary.total_images,
                folder.display()
            );
        }
        ctx.check()?;

        self.set_state_if_current(ctx, PipelineState::ThumbnailLoading);
        self.load_thumbnails(records, ctx).await?;

        self.set_state_if_current(ctx, PipelineState::Ready);
        self.reporter.report(
            ctx.role,
            ScanPhase::Complete,
            summary.total_images,
            summary.total_images,
            "",
        );
        Ok(summary)
    }

    /// Open the folder's cache off the runtime threads. A folder scanned
    /// under both roles shares one instance.
    async fn attach_cache(&self, folder: &Path, ctx: &ScanContext) {
        if !self.cache_enabled.load(Ordering::Relaxed)
            || self.config.feature_mode != FeatureMode::Embedding
        {
            return;
        }

        let _gate = self.cache_gate.lock().await;
        if self.lock_slot(ctx.role).cache.is_some() {
            return;
        }

        let other = match ctx.role {
            FolderRole::Primary => FolderRole::Compare,
            FolderRole::Compare => FolderRole::Primary,
        };
        let shared = {
            let slot = self.lock_slot(other);
            if slot.folder.as_deref() == Some(folder) {
                slot.cache.clone()
            } else {
                None
            }
        };

        let cache = match shared {
            Some(cache) => Some(cache),
            None => {
                let root = folder.to_path_buf();
                let opened = tokio::task::spawn_blocking(move || {
                    if root.is_dir() {
                        FeatureCache::open_for_folder(&root).map(Some)
                    } else {
                        Ok(None)
                    }
                })
                .await;
                match opened {
                    Ok(Ok(cache)) => cache.map(Arc::new),
                    Ok(Err(e)) => {
                        log::warn!("Feature cache unavailable for {}: {}", folder.display(), e);
                        None
                    }
                    Err(e) => {
                        log::warn!("Opening feature cache for {} failed: {}", folder.display(), e);
                        None
                    }
                }
            }
        };

        let mut slot = self.lock_slot(ctx.role);
        if slot.generation == ctx.generation && self.cache_enabled.load(Ordering::Relaxed) {
            slot.cache = cache;
        }
    }

    /// Enumerate the folder and stamp every file, off the runtime threads.
    async fn discover(
        &self,
        folder: &Path,
        ctx: &ScanContext,
    ) -> Result<Vec<ImageRecord>, PipelineError> {
        let scanner = self.scanner.clone();
        let root = folder.to_path_buf();
        let recursive = self.config.recursive;
        let token = ctx.token.clone();

        let records = tokio::task::spawn_blocking(move || -> Result<Vec<ImageRecord>, ScanError> {
            let files = scanner.discover_files(&root, recursive, &token)?;
            let mut records = Vec::with_capacity(files.len());
            for path in files {
                if token.load(Ordering::Relaxed) {
                    return Err(ScanError::Cancelled);
                }
                match FileStamp::probe(&path) {
                    Ok(stamp) => records.push(ImageRecord::new(path, stamp)),
                    Err(e) => log::warn!("Skipping {}: {}", path.display(), e),
                }
            }
            Ok(records)
        })
        .await??;

        ctx.check()?;
        Ok(records)
    }

    async fn extract_embeddings(
        &self,
        records: Vec<ImageRecord>,
        ctx: &ScanContext,
        summary: &mut ScanSummary,
    ) -> Result<Vec<ImageRecord>, PipelineError> {
        let Some(embedder) = self.embedder.clone() else {
            return self.model_unavailable("no model configured".to_string(), records);
        };

        let init = {
            let embedder = embedder.clone();
            tokio::task::spawn_blocking(move || embedder.initialize()).await?
        };
        if let Err(e) = init {
            return self.model_unavailable(e.to_string(), records);
        }
        summary.model_available = true;

        let cache = CacheHandle {
            cache: self.lock_slot(ctx.role).cache.clone(),
            enabled: self.cache_enabled.clone(),
        };
        let token = ctx.token.clone();
        let reporter = self.reporter.clone();
        let role = ctx.role;

        let (records, counts) = tokio::task::spawn_blocking(move || {
            run_extraction_lane(records, &embedder, &cache, &token, |done, total, file| {
                reporter.report(role, ScanPhase::Extracting, done, total, file)
            })
        })
        .await??;

        summary.cache_hits = counts.cache_hits;
        summary.extracted = counts.extracted;
        summary.embedding_failures = counts.failed;
        Ok(records)
    }

    fn model_unavailable(
        &self,
        reason: String,
        records: Vec<ImageRecord>,
    ) -> Result<Vec<ImageRecord>, PipelineError> {
        if self.config.fallback_to_hash {
            log::warn!(
                "Embedding model unavailable ({}); falling back to perceptual hashes",
                reason
            );
            Ok(records)
        } else {
            log::error!("critical: embedding model unavailable: {}", reason);
            Err(PipelineError::ModelUnavailable { reason })
        }
    }

    async fn compute_hashes(
        &self,
        mut records: Vec<ImageRecord>,
        ctx: &ScanContext,
    ) -> Result<Vec<ImageRecord>, PipelineError> {
        let hasher = self.hasher.clone();
        let pool = self.hash_pool.clone();
        let token = ctx.token.clone();
        let reporter = self.reporter.clone();
        let role = ctx.role;

        tokio::task::spawn_blocking(move || -> Result<Vec<ImageRecord>, PipelineError> {
            let total = records.len();
            let processed = AtomicUsize::new(0);
            pool.install(|| {
                records.par_iter_mut().try_for_each(|record| {
                    if token.load(Ordering::Relaxed) {
                        return Err(PipelineError::Cancelled);
                    }
                    match hasher.try_hash(&record.path) {
                        Ok(hash) => record.hash = Some(hash),
                        Err(e) => log::warn!("Failed to hash {}: {}", record.path.display(), e),
                    }
                    let done = processed.fetch_add(1, Ordering::Relaxed) + 1;
                    reporter.report(role, ScanPhase::Hashing, done, total, &record.file_name);
                    Ok(())
                })
            })?;
            Ok(records)
        })
        .await?
    }

    /// Decode thumbnails with bounded concurrency and publish records in
    /// file-name order as each prefix completes.
    async fn load_thumbnails(
        &self,
        records: Vec<ImageRecord>,
        ctx: &ScanContext,
    ) -> Result<(), PipelineError> {
        let total = records.len();
        let semaphore = Arc::new(Semaphore::new(self.config.thumbnail_concurrency));
        let mut tasks = JoinSet::new();

        for (index, record) in records.iter().enumerate() {
            let semaphore = semaphore.clone();
            let thumbnails = self.thumbnails.clone();
            let token = ctx.token.clone();
            let path = record.path.clone();

            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (index, None);
                };
                if token.load(Ordering::Relaxed) {
                    return (index, None);
                }
                let loaded =
                    tokio::task::spawn_blocking(move || match thumbnails.load_thumbnail(&path) {
                        Ok(thumbnail) => Some(thumbnail),
                        Err(e) => {
                            log::warn!("Thumbnail failed for {}: {}", path.display(), e);
                            None
                        }
                    })
                    .await;
                (index, loaded.ok().flatten())
            });
        }

        let mut pending: Vec<Option<ImageRecord>> = records.into_iter().map(Some).collect();
        let mut done = vec![false; total];
        let mut cursor = 0;

        while let Some(joined) = tasks.join_next().await {
            ctx.check()?;
            let (index, thumbnail) = match joined {
                Ok(result) => result,
                Err(e) => {
                    log::warn!("Thumbnail task failed: {}", e);
                    continue;
                }
            };

            if let Some(record) = pending[index].as_mut() {
                record.thumbnail = thumbnail;
            }
            done[index] = true;

            let mut batch = Vec::new();
            while cursor < total && done[cursor] {
                if let Some(record) = pending[cursor].take() {
                    batch.push(record);
                }
                cursor += 1;
            }
            if let Some(last) = batch.last() {
                let file_name = last.file_name.clone();
                self.publish(ctx, batch)?;
                self.reporter.report(
                    ctx.role,
                    ScanPhase::ThumbnailLoading,
                    cursor,
                    total,
                    &file_name,
                );
            }
        }

        let leftovers: Vec<ImageRecord> = pending.into_iter().flatten().collect();
        if !leftovers.is_empty() {
            self.publish(ctx, leftovers)?;
        }
        Ok(())
    }

    fn publish(&self, ctx: &ScanContext, batch: Vec<ImageRecord>) -> Result<(), PipelineError> {
        let mut slot = self.lock_slot(ctx.role);
        if slot.generation != ctx.generation || ctx.token.load(Ordering::Relaxed) {
            return Err(PipelineError::Cancelled);
        }
        slot.records.extend(batch);
        Ok(())
    }

    fn enter_search(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == PipelineState::Ready {
            *state = PipelineState::Searching;
            true
        } else {
            false
        }
    }

    fn set_state(&self, next: PipelineState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }

    fn set_state_if_current(&self, ctx: &ScanContext, next: PipelineState) {
        let current = {
            let slot = self.lock_slot(ctx.role);
            slot.generation == ctx.generation && !ctx.token.load(Ordering::Relaxed)
        };
        if current {
            self.set_state(next);
        }
    }

    fn lock_slot(&self, role: FolderRole) -> MutexGuard<'_, FolderSlot> {
        let slot = match role {
            FolderRole::Primary => &self.primary,
            FolderRole::Compare => &self.compare,
        };
        slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Embed every record one at a time, consulting the cache first.
fn run_extraction_lane(
    mut records: Vec<ImageRecord>,
    embedder: &EmbeddingService,
    cache: &CacheHandle,
    token: &CancellationToken,
    on_progress: impl Fn(usize, usize, &str),
) -> Result<(Vec<ImageRecord>, ExtractionCounts), PipelineError> {
    let total = records.len();
    let mut counts = ExtractionCounts::default();

    for (index, record) in records.iter_mut().enumerate() {
        if token.load(Ordering::Relaxed) {
            return Err(PipelineError::Cancelled);
        }

        let stamp = record.stamp();
        let cached = cache.active().and_then(|cache| {
            cache
                .lookup_with_stamp(&record.path, &stamp)
                .unwrap_or_else(|e| {
                    log::warn!("Cache lookup failed for {}: {}", record.path.display(), e);
                    None
                })
        });

        match cached {
            Some(entry) => {
                record.embedding = Some(entry.embedding);
                counts.cache_hits += 1;
            }
            None => match embedder.extract(&record.path) {
                Ok(embedding) => {
                    if let Some(cache) = cache.active() {
                        if let Err(e) = cache.store_with_stamp(&record.path, &stamp, &embedding) {
                            log::warn!("Cache write failed for {}: {}", record.path.display(), e);
                        }
                    }
                    record.embedding = Some(embedding);
                    counts.extracted += 1;
                }
                Err(_) => counts.failed += 1,
            },
        }

        on_progress(index + 1, total, &record.file_name);
    }

    Ok((records, counts))
}
