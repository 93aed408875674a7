//! Cache entries and the partial updates applied to them.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use super::data::CacheData;
use super::error::SyncError;

/// Lifecycle of a query entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueryStatus {
    #[default]
    Idle,
    Loading,
    Success,
    Error,
}

impl QueryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryStatus::Idle => "idle",
            QueryStatus::Loading => "loading",
            QueryStatus::Success => "success",
            QueryStatus::Error => "error",
        }
    }
}

/// Server-owned data cached under one key.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub data: Option<CacheData>,
    pub status: QueryStatus,
    /// Present iff `status` is [`QueryStatus::Error`].
    pub error: Option<SyncError>,
    /// Time of the last confirmed server write; `None` once invalidated.
    pub fetched_at: Option<Instant>,
    pub stale_after: Duration,
    /// The data reflects an unconfirmed local patch. True exactly while
    /// `optimistic_writers` is not empty.
    pub is_optimistic: bool,
    /// Mutations whose optimistic patch is applied here and has not settled.
    pub optimistic_writers: BTreeSet<Uuid>,
    /// Store version of the last change to this entry.
    pub version: u64,
    /// Bumped on every invalidation; in-flight fetches started under an older
    /// generation are not joined.
    pub invalidations: u64,
    pub updated_at: Instant,
}

impl CacheEntry {
    pub(crate) fn new(stale_after: Duration, version: u64) -> Self {
        Self {
            data: None,
            status: QueryStatus::Idle,
            error: None,
            fetched_at: None,
            stale_after,
            is_optimistic: false,
            optimistic_writers: BTreeSet::new(),
            version,
            invalidations: 0,
            updated_at: Instant::now(),
        }
    }

    /// Fresh entries satisfy reads without a fetch.
    pub fn is_fresh(&self, now: Instant) -> bool {
        self.status == QueryStatus::Success
            && self
                .fetched_at
                .is_some_and(|fetched| now.saturating_duration_since(fetched) < self.stale_after)
    }

    pub fn state(&self) -> EntryState {
        EntryState {
            data: self.data.clone(),
            status: self.status,
            error: self.error.clone(),
            is_optimistic: self.is_optimistic,
        }
    }

    pub(crate) fn apply(&mut self, patch: EntryPatch, version: u64, now: Instant) {
        let EntryPatch {
            data,
            status,
            error,
            fetched_at,
            stale_after,
            optimistic,
        } = patch;

        if let Some(data) = data {
            self.data = data;
        }
        if let Some(status) = status {
            self.status = status;
            self.error = if status == QueryStatus::Error {
                error
            } else {
                None
            };
        }
        match fetched_at {
            Some(FetchedAt::Now) => self.fetched_at = Some(now),
            Some(FetchedAt::Clear) => self.fetched_at = None,
            None => {}
        }
        if let Some(stale_after) = stale_after {
            self.stale_after = stale_after;
        }
        match optimistic {
            Some(Writers::Add(mutation)) => {
                self.optimistic_writers.insert(mutation);
            }
            Some(Writers::Settle(mutation)) => {
                self.optimistic_writers.remove(&mutation);
            }
            Some(Writers::Replace(writers)) => self.optimistic_writers = writers,
            None => {}
        }
        self.is_optimistic = !self.optimistic_writers.is_empty();
        self.version = version;
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, Copy)]
enum FetchedAt {
    Now,
    Clear,
}

#[derive(Debug, Clone)]
enum Writers {
    Add(Uuid),
    Settle(Uuid),
    Replace(BTreeSet<Uuid>),
}

/// Partial update applied by [`CacheStore::set`](super::store::CacheStore::set).
///
/// Setting a non-error status always clears the entry error.
#[derive(Debug, Clone, Default)]
pub struct EntryPatch {
    data: Option<Option<CacheData>>,
    status: Option<QueryStatus>,
    error: Option<SyncError>,
    fetched_at: Option<FetchedAt>,
    stale_after: Option<Duration>,
    optimistic: Option<Writers>,
}

impl EntryPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entry data (`None` removes it).
    pub fn data(mut self, data: Option<CacheData>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn status(mut self, status: QueryStatus) -> Self {
        self.status = Some(status);
        self.error = None;
        self
    }

    pub fn failed(mut self, error: SyncError) -> Self {
        self.status = Some(QueryStatus::Error);
        self.error = Some(error);
        self
    }

    pub fn fetched_now(mut self) -> Self {
        self.fetched_at = Some(FetchedAt::Now);
        self
    }

    pub fn clear_fetched(mut self) -> Self {
        self.fetched_at = Some(FetchedAt::Clear);
        self
    }

    pub fn stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = Some(stale_after);
        self
    }

    /// Record `mutation` as a pending optimistic writer of the entry.
    pub fn optimistic_by(mut self, mutation: Uuid) -> Self {
        self.optimistic = Some(Writers::Add(mutation));
        self
    }

    /// `mutation` confirmed or rolled back; the entry stays optimistic while
    /// other writers are pending.
    pub fn settled(mut self, mutation: Uuid) -> Self {
        self.optimistic = Some(Writers::Settle(mutation));
        self
    }

    pub(crate) fn optimistic_writers(mut self, writers: BTreeSet<Uuid>) -> Self {
        self.optimistic = Some(Writers::Replace(writers));
        self
    }
}

/// What a view reads for one key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryState {
    pub data: Option<CacheData>,
    pub status: QueryStatus,
    pub error: Option<SyncError>,
    pub is_optimistic: bool,
}

impl EntryState {
    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::error::TransportError;

    fn failure() -> SyncError {
        SyncError::FetchFailed {
            key: "[\"users\"]".to_string(),
            source: TransportError::network("offline"),
        }
    }

    #[test]
    fn error_is_present_only_with_error_status() {
        let now = Instant::now();
        let mut entry = CacheEntry::new(Duration::from_secs(30), 1);

        entry.apply(EntryPatch::new().failed(failure()), 2, now);
        assert_eq!(entry.status, QueryStatus::Error);
        assert!(entry.error.is_some());

        entry.apply(EntryPatch::new().status(QueryStatus::Loading), 3, now);
        assert_eq!(entry.status, QueryStatus::Loading);
        assert!(entry.error.is_none());
        assert_eq!(entry.version, 3);
    }

    #[test]
    fn patch_without_status_keeps_error() {
        let now = Instant::now();
        let mut entry = CacheEntry::new(Duration::from_secs(30), 1);
        entry.apply(EntryPatch::new().failed(failure()), 2, now);
        entry.apply(EntryPatch::new().optimistic_by(Uuid::new_v4()), 3, now);
        assert!(entry.error.is_some());
        assert!(entry.is_optimistic);
    }

    #[test]
    fn optimistic_until_the_last_writer_settles() {
        let now = Instant::now();
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        let mut entry = CacheEntry::new(Duration::from_secs(30), 1);

        entry.apply(EntryPatch::new().optimistic_by(first), 2, now);
        entry.apply(EntryPatch::new().optimistic_by(second), 3, now);
        entry.apply(EntryPatch::new().settled(first), 4, now);
        assert!(entry.is_optimistic);
        assert!(entry.state().is_optimistic);

        entry.apply(EntryPatch::new().settled(second), 5, now);
        assert!(!entry.is_optimistic);
        assert!(entry.optimistic_writers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn freshness_follows_stale_after() {
        let mut entry = CacheEntry::new(Duration::from_secs(10), 1);
        entry.apply(
            EntryPatch::new().status(QueryStatus::Success).fetched_now(),
            2,
            Instant::now(),
        );
        assert!(entry.is_fresh(Instant::now()));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!entry.is_fresh(Instant::now()));

        entry.apply(EntryPatch::new().fetched_now(), 3, Instant::now());
        entry.apply(EntryPatch::new().clear_fetched(), 4, Instant::now());
        assert!(!entry.is_fresh(Instant::now()));
    }
}
