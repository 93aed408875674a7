//! Read path: staleness policy, request deduplication and ordering.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use metrics::{counter, histogram};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::data::CacheData;
use super::entry::{EntryPatch, EntryState, QueryStatus};
use super::error::TransportError;
use super::key::ResourceKey;
use super::lock::lock;
use super::reaction::FailureReactor;
use super::store::CacheStore;

const SOURCE: &str = "sync::query";
const METRIC_QUERY_HIT: &str = "almanac_sync_query_hit_total";
const METRIC_QUERY_MISS: &str = "almanac_sync_query_miss_total";
const METRIC_QUERY_DEDUP: &str = "almanac_sync_query_dedup_total";
const METRIC_QUERY_SUPERSEDED: &str = "almanac_sync_query_superseded_total";
const METRIC_FETCH_MS: &str = "almanac_sync_fetch_ms";

type SharedFetch = Shared<BoxFuture<'static, EntryState>>;

struct InFlight {
    seq: u64,
    /// Invalidation generation of the entry when the request started.
    generation: u64,
    fetch: SharedFetch,
}

struct KeyTrack {
    latest: u64,
    in_flight: Option<InFlight>,
}

type Tracks = Arc<Mutex<HashMap<String, KeyTrack>>>;

#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
    /// Staleness window written on success; the entry keeps its current
    /// window when unset.
    pub stale_after: Option<Duration>,
    /// Ignore freshness and any in-flight request.
    pub force: bool,
}

impl QueryOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }

    pub fn stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = Some(stale_after);
        self
    }
}

/// Fetch orchestration over a shared [`CacheStore`].
pub struct QueryRunner {
    store: Arc<CacheStore>,
    reactor: Arc<FailureReactor>,
    tracks: Tracks,
    sequence: Arc<AtomicU64>,
}

impl QueryRunner {
    pub fn new(store: Arc<CacheStore>, reactor: Arc<FailureReactor>) -> Self {
        Self {
            store,
            reactor,
            tracks: Arc::new(Mutex::new(HashMap::new())),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Resolve `key` from the cache or through `fetcher`.
    ///
    /// Fetch failures never surface as `Err`; they are stored on the entry
    /// and returned as part of the state. `fetcher` is only called when a new
    /// request is issued and must not block.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn run<F, Fut>(
        &self,
        key: &ResourceKey,
        fetcher: F,
        options: QueryOptions,
    ) -> EntryState
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheData, TransportError>> + Send + 'static,
    {
        if let Some(state) = self.cached(key, options) {
            return state;
        }
        self.begin(key, fetcher, options).await
    }

    /// Fetch `key` regardless of freshness or an in-flight request.
    pub async fn refetch<F, Fut>(&self, key: &ResourceKey, fetcher: F) -> EntryState
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheData, TransportError>> + Send + 'static,
    {
        self.run(key, fetcher, QueryOptions::forced()).await
    }

    /// Warm `key` in the background. Must be called within a Tokio runtime.
    pub fn prefetch<F, Fut>(&self, key: &ResourceKey, fetcher: F, options: QueryOptions)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheData, TransportError>> + Send + 'static,
    {
        if self.cached(key, options).is_none() {
            drop(self.begin(key, fetcher, options));
        }
    }

    /// True while a request for `key` has not settled.
    pub fn is_fetching(&self, key: &ResourceKey) -> bool {
        lock(&self.tracks, SOURCE, "is_fetching")
            .get(key.serialize())
            .is_some_and(|track| track.in_flight.is_some())
    }

    fn cached(&self, key: &ResourceKey, options: QueryOptions) -> Option<EntryState> {
        if options.force {
            return None;
        }
        let entry = self.store.get(key)?;
        if !entry.is_fresh(Instant::now()) {
            return None;
        }
        counter!(METRIC_QUERY_HIT).increment(1);
        debug!(key = %key, version = entry.version, "Serving fresh cache entry");
        Some(entry.state())
    }

    fn begin<F, Fut>(&self, key: &ResourceKey, fetcher: F, options: QueryOptions) -> SharedFetch
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheData, TransportError>> + Send + 'static,
    {
        let (fetch, loading) = {
            let mut tracks = lock(&self.tracks, SOURCE, "begin");
            let entry = self.store.get(key);
            let generation = entry.as_ref().map_or(0, |entry| entry.invalidations);
            let track = tracks
                .entry(key.serialize().to_string())
                .or_insert(KeyTrack {
                    latest: 0,
                    in_flight: None,
                });

            if !options.force
                && let Some(in_flight) = &track.in_flight
                && in_flight.generation == generation
            {
                counter!(METRIC_QUERY_DEDUP).increment(1);
                debug!(key = %key, seq = in_flight.seq, "Joining in-flight fetch");
                return in_flight.fetch.clone();
            }

            let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
            track.latest = seq;
            let fetch = settle_when_done(
                Arc::clone(&self.store),
                Arc::clone(&self.reactor),
                Arc::clone(&self.tracks),
                key.clone(),
                seq,
                fetcher(),
                options,
            )
            .boxed()
            .shared();
            track.in_flight = Some(InFlight {
                seq,
                generation,
                fetch: fetch.clone(),
            });

            // An invalidated entry that still holds data refreshes silently.
            let silent = entry.as_ref().is_some_and(|entry| {
                entry.data.is_some() && entry.fetched_at.is_none() && entry.invalidations > 0
            });
            let loading = (!silent).then(|| {
                self.store
                    .set_silently(key, EntryPatch::new().status(QueryStatus::Loading))
            });
            debug!(key = %key, seq, silent, "Issuing fetch");
            (fetch, loading)
        };

        counter!(METRIC_QUERY_MISS).increment(1);
        if let Some(version) = loading {
            self.store.announce(key, version);
        }
        // Detached so the entry settles even if every caller goes away.
        drop(tokio::spawn(fetch.clone()));
        fetch
    }
}

fn settle_when_done<Fut>(
    store: Arc<CacheStore>,
    reactor: Arc<FailureReactor>,
    tracks: Tracks,
    key: ResourceKey,
    seq: u64,
    request: Fut,
    options: QueryOptions,
) -> impl Future<Output = EntryState> + Send + 'static
where
    Fut: Future<Output = Result<CacheData, TransportError>> + Send + 'static,
{
    async move {
        let started_at = std::time::Instant::now();
        let result = request.await;
        histogram!(
            METRIC_FETCH_MS,
            "outcome" => if result.is_ok() { "success" } else { "failure" }
        )
        .record(started_at.elapsed().as_secs_f64() * 1000.0);
        settle(&store, &reactor, &tracks, &key, seq, result, options)
    }
}

fn settle(
    store: &CacheStore,
    reactor: &FailureReactor,
    tracks: &Mutex<HashMap<String, KeyTrack>>,
    key: &ResourceKey,
    seq: u64,
    result: Result<CacheData, TransportError>,
    options: QueryOptions,
) -> EntryState {
    // The sequence check and the write happen under one lock so a newer
    // request cannot settle in between.
    let written = {
        let mut tracks = lock(tracks, SOURCE, "settle");
        let canonical = key.serialize();
        let latest = tracks.get(canonical).map_or(0, |track| track.latest);

        if seq != latest {
            None
        } else {
            tracks.remove(canonical);
            Some(match result {
                // Pending optimistic patches are applied over the result.
                Ok(data) => (
                    store.set_fetched_silently(key, data, options.stale_after),
                    None,
                ),
                Err(error) => {
                    let mapped = reactor.fetch_error(key, error.clone());
                    (store.set_silently(key, EntryPatch::new().failed(mapped)), Some(error))
                }
            })
        }
    };

    match written {
        None => {
            counter!(METRIC_QUERY_SUPERSEDED).increment(1);
            debug!(key = %key, seq, "Discarding superseded fetch result");
        }
        Some((version, failure)) => {
            store.announce(key, version);
            if let Some(error) = failure {
                warn!(
                    key = %key,
                    seq,
                    kind = %error.kind,
                    message = %error.message,
                    "Fetch failed; cached data kept"
                );
                reactor.react(&error, std::slice::from_ref(key));
            }
        }
    }
    store.state(key)
}
