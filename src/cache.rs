// Snapshot cache: holds the last classified feed and refreshes it at most
// once at a time, however many readers ask concurrently.

use crate::classifier::UnmatchedTown;
use crate::parser::ParseWarning;
use crate::pipeline::{FeedError, FeedPipeline, PipelineOutput, SourceReport};
use crate::record::PropertyRecord;
use crate::region_map::normalize_town_key;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Time source for expiry decisions.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

/// One complete, immutable view of the classified feed. Readers share it
/// through an `Arc`; a refresh replaces it wholesale.
#[derive(Debug, Clone)]
pub struct FeedSnapshot {
    pub records: Vec<PropertyRecord>,
    pub fetched_at: Instant,
    pub generated_at: DateTime<Utc>,
    /// Increments with every refresh attempt of the owning cache.
    pub generation: u64,
    pub unmatched: Vec<UnmatchedTown>,
    pub warnings: Vec<ParseWarning>,
    pub sources: Vec<SourceReport>,
}

impl FeedSnapshot {
    pub fn new(records: Vec<PropertyRecord>, fetched_at: Instant, generation: u64) -> Self {
        Self {
            records,
            fetched_at,
            generated_at: Utc::now(),
            generation,
            unmatched: Vec::new(),
            warnings: Vec::new(),
            sources: Vec::new(),
        }
    }

    fn from_output(output: PipelineOutput, fetched_at: Instant, generation: u64) -> Self {
        Self {
            records: output.records,
            fetched_at,
            generated_at: Utc::now(),
            generation,
            unmatched: output.unmatched,
            warnings: output.warnings,
            sources: output.sources,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.fetched_at)
    }

    /// Fresh while `now - fetched_at < ttl`.
    pub fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        self.age(now) >= ttl
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    /// After a failed refresh, a stale snapshot is served without refetching
    /// for this long.
    pub failure_cooldown: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            failure_cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("Feed refresh failed: {0}")]
    Refresh(#[from] FeedError),

    #[error("Snapshot request cancelled")]
    Cancelled,

    #[error("Refresh task failed: {0}")]
    TaskFailed(String),
}

#[derive(Debug, Default)]
pub struct CacheStats {
    pub hit_count: AtomicUsize,
    pub miss_count: AtomicUsize,
    pub coalesced_count: AtomicUsize,
    pub stale_served_count: AtomicUsize,
    pub refresh_count: AtomicUsize,
    pub refresh_failure_count: AtomicUsize,
    pub cancelled_count: AtomicUsize,
    pub average_lookup_time_ns: AtomicU64,
    pub total_lookups: AtomicUsize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStatsReport {
    pub hit_count: usize,
    pub miss_count: usize,
    pub coalesced_count: usize,
    pub stale_served_count: usize,
    pub refresh_count: usize,
    pub refresh_failure_count: usize,
    pub cancelled_count: usize,
    pub average_lookup_time_ns: u64,
    pub total_lookups: usize,
    pub generation: u64,
    pub records: usize,
}

/// A town seen in the feed but missing from the Region Map, tracked across
/// refreshes so the map can be curated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnmatchedTownEntry {
    pub town: String,
    /// Listings carrying this town in the most recent snapshot that had it.
    pub listings: usize,
    pub first_seen_generation: u64,
    pub last_seen_generation: u64,
}

type RefreshResult = Result<Arc<FeedSnapshot>, CacheError>;
type SharedRefresh = Shared<BoxFuture<'static, RefreshResult>>;

#[derive(Default)]
struct CacheState {
    current: Option<Arc<FeedSnapshot>>,
    inflight: Option<SharedRefresh>,
    last_failure: Option<Instant>,
    generation: u64,
    force_refresh: bool,
}

pub struct SnapshotCache {
    pipeline: Arc<FeedPipeline>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    state: Arc<Mutex<CacheState>>,
    stats: Arc<CacheStats>,
    unmatched_log: Arc<DashMap<String, UnmatchedTownEntry>>,
}

impl SnapshotCache {
    pub fn new(pipeline: FeedPipeline, config: CacheConfig) -> Self {
        Self::with_clock(pipeline, config, Arc::new(SystemClock))
    }

    pub fn with_clock(pipeline: FeedPipeline, config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            clock,
            config,
            state: Arc::new(Mutex::new(CacheState::default())),
            stats: Arc::new(CacheStats::default()),
            unmatched_log: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Return the current snapshot, refreshing it first if it is missing or
    /// expired. Concurrent callers during a refresh all wait on the same
    /// upstream fetch and receive the same snapshot.
    ///
    /// If the refresh fails and an older snapshot exists, the older snapshot
    /// is returned; otherwise the error is.
    pub async fn get_snapshot(&self) -> Result<Arc<FeedSnapshot>, CacheError> {
        let started = Instant::now();
        self.stats.total_lookups.fetch_add(1, Ordering::SeqCst);

        let refresh = {
            let mut state = self.state.lock();
            let now = self.clock.now();

            if let Some(current) = state.current.clone() {
                if !state.force_refresh && !current.is_expired(now, self.config.ttl) {
                    self.stats.hit_count.fetch_add(1, Ordering::SeqCst);
                    drop(state);
                    self.store_lookup_time(started);
                    return Ok(current);
                }
                let cooling_down = state
                    .last_failure
                    .is_some_and(|failed| now.saturating_duration_since(failed) < self.config.failure_cooldown);
                if cooling_down && state.inflight.is_none() && !state.force_refresh {
                    self.stats.stale_served_count.fetch_add(1, Ordering::SeqCst);
                    drop(state);
                    debug!(generation = current.generation, "serving stale snapshot during failure cooldown");
                    self.store_lookup_time(started);
                    return Ok(current);
                }
            }

            match state.inflight.clone() {
                Some(inflight) => {
                    self.stats.coalesced_count.fetch_add(1, Ordering::SeqCst);
                    inflight
                }
                None => {
                    self.stats.miss_count.fetch_add(1, Ordering::SeqCst);
                    self.start_refresh(&mut state)
                }
            }
        };

        let result = refresh.await;
        self.store_lookup_time(started);
        result
    }

    /// Like `get_snapshot`, but returns `Cancelled` as soon as `token` fires.
    /// The refresh itself keeps running for the other waiters and later
    /// callers.
    pub async fn get_snapshot_with_cancel(
        &self,
        token: &CancellationToken,
    ) -> Result<Arc<FeedSnapshot>, CacheError> {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                self.stats.cancelled_count.fetch_add(1, Ordering::SeqCst);
                Err(CacheError::Cancelled)
            }
            result = self.get_snapshot() => result,
        }
    }

    /// Current snapshot without triggering a refresh.
    pub fn peek(&self) -> Option<Arc<FeedSnapshot>> {
        self.state.lock().current.clone()
    }

    /// Force the next `get_snapshot` to refresh. The current snapshot stays
    /// available as a fallback.
    pub fn invalidate(&self) {
        let mut state = self.state.lock();
        state.force_refresh = true;
        info!(generation = state.generation, "snapshot invalidated");
    }

    pub fn stats(&self) -> CacheStatsReport {
        let state = self.state.lock();
        CacheStatsReport {
            hit_count: self.stats.hit_count.load(Ordering::SeqCst),
            miss_count: self.stats.miss_count.load(Ordering::SeqCst),
            coalesced_count: self.stats.coalesced_count.load(Ordering::SeqCst),
            stale_served_count: self.stats.stale_served_count.load(Ordering::SeqCst),
            refresh_count: self.stats.refresh_count.load(Ordering::SeqCst),
            refresh_failure_count: self.stats.refresh_failure_count.load(Ordering::SeqCst),
            cancelled_count: self.stats.cancelled_count.load(Ordering::SeqCst),
            average_lookup_time_ns: self.stats.average_lookup_time_ns.load(Ordering::SeqCst),
            total_lookups: self.stats.total_lookups.load(Ordering::SeqCst),
            generation: state.generation,
            records: state.current.as_ref().map_or(0, |s| s.len()),
        }
    }

    /// Every unmatched town seen since the cache was created, most listings
    /// first.
    pub fn unmatched_towns(&self) -> Vec<UnmatchedTownEntry> {
        let mut entries: Vec<UnmatchedTownEntry> = self
            .unmatched_log
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        entries.sort_by(|a, b| b.listings.cmp(&a.listings).then_with(|| a.town.cmp(&b.town)));
        entries
    }

    // Called with the state lock held, so exactly one refresh can be started.
    fn start_refresh(&self, state: &mut CacheState) -> SharedRefresh {
        state.generation += 1;
        let generation = state.generation;

        let pipeline = Arc::clone(&self.pipeline);
        let clock = Arc::clone(&self.clock);
        let shared_state = Arc::clone(&self.state);
        let stats = Arc::clone(&self.stats);
        let unmatched_log = Arc::clone(&self.unmatched_log);

        // Spawned so that a caller dropping its future cannot abort the
        // refresh other callers are waiting on. The pipeline runs in its own
        // task so a panic in a source still goes through the bookkeeping
        // below and releases `inflight`.
        let handle = tokio::spawn(async move {
            info!(generation, "refreshing feed snapshot");
            let started = Instant::now();
            let result = match tokio::spawn(async move { pipeline.run().await }).await {
                Ok(result) => result.map_err(CacheError::Refresh),
                Err(join_error) => Err(CacheError::TaskFailed(join_error.to_string())),
            };

            let mut state = shared_state.lock();
            state.inflight = None;
            match result {
                Ok(output) => {
                    let snapshot = Arc::new(FeedSnapshot::from_output(output, clock.now(), generation));
                    record_unmatched(&unmatched_log, &snapshot);
                    state.current = Some(Arc::clone(&snapshot));
                    state.last_failure = None;
                    state.force_refresh = false;
                    stats.refresh_count.fetch_add(1, Ordering::SeqCst);
                    info!(
                        generation,
                        records = snapshot.len(),
                        unmatched = snapshot.unmatched.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "feed snapshot refreshed"
                    );
                    Ok(snapshot)
                }
                Err(err) => {
                    stats.refresh_failure_count.fetch_add(1, Ordering::SeqCst);
                    state.last_failure = Some(clock.now());
                    state.force_refresh = false;
                    match state.current.clone() {
                        Some(previous) => {
                            stats.stale_served_count.fetch_add(1, Ordering::SeqCst);
                            warn!(
                                generation,
                                serving_generation = previous.generation,
                                error = %err,
                                "feed refresh failed, serving stale snapshot"
                            );
                            Ok(previous)
                        }
                        None => {
                            error!(generation, error = %err, "feed refresh failed with no snapshot to fall back on");
                            Err(err)
                        }
                    }
                }
            }
        });

        let refresh = async move {
            match handle.await {
                Ok(result) => result,
                Err(join_error) => Err(CacheError::TaskFailed(join_error.to_string())),
            }
        }
        .boxed()
        .shared();

        state.inflight = Some(refresh.clone());
        refresh
    }

    fn store_lookup_time(&self, started: Instant) {
        let duration_ns = started.elapsed().as_nanos();
        let total_lookups = self.stats.total_lookups.load(Ordering::SeqCst) as u128;
        let current_avg = u128::from(self.stats.average_lookup_time_ns.load(Ordering::SeqCst));

        // weighted sum can exceed u64 on long runs
        let new_avg = if total_lookups <= 1 {
            duration_ns
        } else {
            (current_avg * (total_lookups - 1) + duration_ns) / total_lookups
        };
        let new_avg = u64::try_from(new_avg).unwrap_or(u64::MAX);

        self.stats
            .average_lookup_time_ns
            .store(new_avg, Ordering::SeqCst);
    }
}

fn record_unmatched(log: &DashMap<String, UnmatchedTownEntry>, snapshot: &FeedSnapshot) {
    let mut counts: BTreeMap<String, (String, usize)> = BTreeMap::new();
    for entry in &snapshot.unmatched {
        let slot = counts
            .entry(normalize_town_key(&entry.town))
            .or_insert_with(|| (entry.town.clone(), 0));
        slot.1 += 1;
    }

    for (key, (town, listings)) in counts {
        log.entry(key)
            .and_modify(|e| {
                e.listings = listings;
                e.last_seen_generation = snapshot.generation;
            })
            .or_insert(UnmatchedTownEntry {
                town,
                listings,
                first_seen_generation: snapshot.generation,
                last_seen_generation: snapshot.generation,
            });
    }
}
