//! The normalized cache of server state.
//!
//! Every operation takes the entry lock once and releases it before any
//! listener runs, so listeners observe a settled store and may call back
//! into it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use metrics::{counter, gauge};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::broker::{ChangeCause, Notification, Subscription, SubscriptionBroker};
use super::data::CacheData;
use super::entry::{CacheEntry, EntryPatch, EntryState, QueryStatus};
use super::key::ResourceKey;
use super::lock::{lock, read, write};
use super::mutation::OptimisticPatch;

const SOURCE: &str = "sync::store";
const METRIC_ENTRIES: &str = "almanac_sync_entries";
const METRIC_INVALIDATED: &str = "almanac_sync_invalidated_total";
const METRIC_EVICTED: &str = "almanac_sync_evicted_total";

type Entries = HashMap<String, (ResourceKey, CacheEntry)>;

/// Optimistic patch of a mutation that has not settled yet.
struct Layer {
    mutation: Uuid,
    prefixes: Vec<ResourceKey>,
    patch: OptimisticPatch,
}

fn covers(prefixes: &[ResourceKey], key: &ResourceKey) -> bool {
    prefixes.iter().any(|prefix| prefix.is_prefix_of(key))
}

/// Copy of a set of entries taken before an optimistic patch.
///
/// Keys that had no entry are recorded as `None` so a restore removes
/// entries the patch created.
#[derive(Debug, Clone)]
pub struct Snapshot {
    entries: BTreeMap<String, (ResourceKey, Option<CacheEntry>)>,
    taken_at: u64,
    patched_at: u64,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ResourceKey> {
        self.entries.values().map(|(key, _)| key)
    }

    pub fn entry(&self, key: &ResourceKey) -> Option<&CacheEntry> {
        self.entries
            .get(key.serialize())
            .and_then(|(_, entry)| entry.as_ref())
    }

    /// Store version at which the snapshot was taken.
    pub fn version(&self) -> u64 {
        self.taken_at
    }

    /// Record the version of the owner's own patch; later writes to
    /// snapshotted keys are reported as overlaps on restore.
    pub fn mark_patched(&mut self, version: u64) {
        self.patched_at = self.patched_at.max(version);
    }
}

/// Result of [`CacheStore::restore`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: usize,
    pub removed: usize,
    /// Keys holding an optimistic write newer than the snapshot owner's patch.
    pub overwritten: Vec<ResourceKey>,
}

/// Process-wide cache of server state, keyed by canonical [`ResourceKey`].
pub struct CacheStore {
    entries: RwLock<Entries>,
    // Locked only while `entries` is held for writing, or on its own.
    layers: Mutex<Vec<Layer>>,
    version: AtomicU64,
    broker: Arc<SubscriptionBroker>,
    default_stale_after: Duration,
}

impl CacheStore {
    pub fn new(default_stale_after: Duration) -> Self {
        Self::with_broker(default_stale_after, SubscriptionBroker::new())
    }

    pub fn with_broker(default_stale_after: Duration, broker: Arc<SubscriptionBroker>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            layers: Mutex::new(Vec::new()),
            version: AtomicU64::new(0),
            broker,
            default_stale_after,
        }
    }

    pub fn broker(&self) -> &Arc<SubscriptionBroker> {
        &self.broker
    }

    pub fn default_stale_after(&self) -> Duration {
        self.default_stale_after
    }

    /// Latest version handed out.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    // Called with the entry lock held so versions follow write order.
    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Register a listener for changes at or below `key`.
    pub fn subscribe<F>(&self, key: ResourceKey, listener: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.broker.subscribe(key, listener)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn get(&self, key: &ResourceKey) -> Option<CacheEntry> {
        read(&self.entries, SOURCE, "get")
            .get(key.serialize())
            .map(|(_, entry)| entry.clone())
    }

    /// View state for `key`; an unknown key reads as idle with no data.
    pub fn state(&self, key: &ResourceKey) -> EntryState {
        read(&self.entries, SOURCE, "state")
            .get(key.serialize())
            .map(|(_, entry)| entry.state())
            .unwrap_or_default()
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        read(&self.entries, SOURCE, "contains").contains_key(key.serialize())
    }

    /// Keys equal to or below `prefix`, in canonical order.
    pub fn keys_under(&self, prefix: &ResourceKey) -> Vec<ResourceKey> {
        let entries = read(&self.entries, SOURCE, "keys_under");
        let mut keys: Vec<ResourceKey> = entries
            .values()
            .filter(|(key, _)| prefix.is_prefix_of(key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort_by(|a, b| a.serialize().cmp(b.serialize()));
        keys
    }

    pub fn len(&self) -> usize {
        read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Merge `patch` into the entry at `key`, creating an idle entry first
    /// when none exists. Returns the new entry version.
    pub fn set(&self, key: &ResourceKey, patch: EntryPatch) -> u64 {
        let version = self.set_silently(key, patch);
        self.announce(key, version);
        version
    }

    /// [`set`](Self::set) without notifying; the caller must
    /// [`announce`](Self::announce) the returned version once it holds no
    /// lock a listener could need.
    pub(crate) fn set_silently(&self, key: &ResourceKey, patch: EntryPatch) -> u64 {
        let (version, count) = {
            let mut entries = write(&self.entries, SOURCE, "set");
            let version = self.next_version();
            let stale_after = self.default_stale_after;
            let (_, entry) = entries
                .entry(key.serialize().to_string())
                .or_insert_with(|| (key.clone(), CacheEntry::new(stale_after, version)));
            entry.apply(patch, version, Instant::now());
            (version, entries.len())
        };
        gauge!(METRIC_ENTRIES).set(count as f64);
        version
    }

    pub(crate) fn announce(&self, key: &ResourceKey, version: u64) {
        self.broker.notify(key, version, ChangeCause::Updated);
    }

    /// Apply `patch` to `key` only if its entry version still equals
    /// `expected`. Returns the new version when applied.
    pub fn set_if_version(
        &self,
        key: &ResourceKey,
        expected: u64,
        patch: EntryPatch,
    ) -> Option<u64> {
        let version = {
            let mut entries = write(&self.entries, SOURCE, "set_if_version");
            let (_, entry) = entries.get_mut(key.serialize())?;
            if entry.version != expected {
                return None;
            }
            let version = self.next_version();
            entry.apply(patch, version, Instant::now());
            version
        };
        self.broker.notify(key, version, ChangeCause::Updated);
        Some(version)
    }

    /// Patch every existing entry equal to or below one of `prefixes` for
    /// which `f` returns a patch, in a single atomic step.
    ///
    /// Returns the patched keys and the version they share.
    pub fn patch_under<F>(&self, prefixes: &[ResourceKey], mut f: F) -> (Vec<ResourceKey>, u64)
    where
        F: FnMut(&ResourceKey, &CacheEntry) -> Option<EntryPatch>,
    {
        let (touched, version) = {
            let mut entries = write(&self.entries, SOURCE, "patch_under");
            let version = self.next_version();
            let now = Instant::now();
            let mut touched = Vec::new();
            for (key, entry) in entries.values_mut() {
                if !covers(prefixes, key) {
                    continue;
                }
                if let Some(patch) = f(key, entry) {
                    entry.apply(patch, version, now);
                    touched.push(key.clone());
                }
            }
            (touched, version)
        };
        if !touched.is_empty() {
            self.broker
                .notify_batch(&touched, &[], version, ChangeCause::Updated);
        }
        (touched, version)
    }

    // ========================================================================
    // Optimistic layers
    // ========================================================================

    /// Snapshot every entry under `prefixes`, then apply `patch` on behalf of
    /// `mutation` to each entry with data, in one atomic step. The layer stays
    /// registered until [`release_optimistic`](Self::release_optimistic).
    ///
    /// Fetch results written while the layer is registered are patched again,
    /// so a pending mutation stays visible over fresh server data.
    pub fn apply_optimistic(
        &self,
        mutation: Uuid,
        prefixes: &[ResourceKey],
        patch: OptimisticPatch,
    ) -> (Snapshot, Vec<ResourceKey>) {
        let (snapshot, touched, version) = {
            let mut entries = write(&self.entries, SOURCE, "apply_optimistic");
            let mut snapshot = capture(&entries, prefixes, self.version());
            let version = self.next_version();
            snapshot.mark_patched(version);
            let now = Instant::now();
            let mut touched = Vec::new();
            for (key, entry) in entries.values_mut() {
                if !covers(prefixes, key) {
                    continue;
                }
                let Some(next) = entry.data.as_ref().and_then(|current| patch(key, current))
                else {
                    continue;
                };
                entry.apply(
                    EntryPatch::new().data(Some(next)).optimistic_by(mutation),
                    version,
                    now,
                );
                touched.push(key.clone());
            }
            lock(&self.layers, SOURCE, "apply_optimistic").push(Layer {
                mutation,
                prefixes: prefixes.to_vec(),
                patch,
            });
            (snapshot, touched, version)
        };
        if !touched.is_empty() {
            self.broker
                .notify_batch(&touched, &[], version, ChangeCause::Updated);
        }
        (snapshot, touched)
    }

    /// Stop re-applying the layer of `mutation`. Entries keep their data and
    /// writer marks; the caller settles them.
    pub fn release_optimistic(&self, mutation: Uuid) -> bool {
        let mut layers = lock(&self.layers, SOURCE, "release_optimistic");
        let before = layers.len();
        layers.retain(|layer| layer.mutation != mutation);
        layers.len() != before
    }

    /// Mutations with a registered optimistic layer, oldest first.
    pub fn pending_optimistic(&self) -> Vec<Uuid> {
        lock(&self.layers, SOURCE, "pending_optimistic")
            .iter()
            .map(|layer| layer.mutation)
            .collect()
    }

    /// Write a successful fetch result without notifying.
    ///
    /// Registered layers covering `key` are applied over `data` in the order
    /// they were registered, and become the entry's optimistic writers.
    pub(crate) fn set_fetched_silently(
        &self,
        key: &ResourceKey,
        data: CacheData,
        stale_after: Option<Duration>,
    ) -> u64 {
        let (version, count) = {
            let mut entries = write(&self.entries, SOURCE, "set_fetched");
            let version = self.next_version();
            let mut data = data;
            let mut writers = BTreeSet::new();
            for layer in lock(&self.layers, SOURCE, "set_fetched").iter() {
                if !covers(&layer.prefixes, key) {
                    continue;
                }
                if let Some(next) = (layer.patch)(key, &data) {
                    data = next;
                    writers.insert(layer.mutation);
                }
            }

            let mut patch = EntryPatch::new()
                .data(Some(data))
                .status(QueryStatus::Success)
                .fetched_now()
                .optimistic_writers(writers);
            if let Some(stale_after) = stale_after {
                patch = patch.stale_after(stale_after);
            }
            let default_stale_after = self.default_stale_after;
            let (_, entry) = entries
                .entry(key.serialize().to_string())
                .or_insert_with(|| (key.clone(), CacheEntry::new(default_stale_after, version)));
            entry.apply(patch, version, Instant::now());
            (version, entries.len())
        };
        gauge!(METRIC_ENTRIES).set(count as f64);
        version
    }

    // ========================================================================
    // Invalidation, snapshots, eviction
    // ========================================================================

    /// Mark every entry equal to or below `prefix` stale.
    ///
    /// Data and optimistic flags are kept so views keep rendering while a
    /// refetch runs. Subscribers at or above a touched key and subscribers
    /// below `prefix` are each notified once. Returns the number of entries
    /// touched.
    pub fn invalidate(&self, prefix: &ResourceKey) -> usize {
        let (touched, version) = {
            let mut entries = write(&self.entries, SOURCE, "invalidate");
            let version = self.next_version();
            let touched = mark_stale(&mut entries, version, |key| prefix.is_prefix_of(key));
            (touched, version)
        };

        counter!(METRIC_INVALIDATED).increment(touched.len() as u64);
        debug!(prefix = %prefix, touched = touched.len(), version, "Cache prefix invalidated");
        self.broker.notify_batch(
            &touched,
            std::slice::from_ref(prefix),
            version,
            ChangeCause::Invalidated,
        );
        touched.len()
    }

    /// Mark every entry stale and notify every subscriber.
    pub fn invalidate_all(&self) -> usize {
        let (touched, version) = {
            let mut entries = write(&self.entries, SOURCE, "invalidate_all");
            let version = self.next_version();
            (mark_stale(&mut entries, version, |_| true).len(), version)
        };

        counter!(METRIC_INVALIDATED).increment(touched as u64);
        debug!(touched, version, "Entire cache invalidated");
        self.broker.notify_all(version, ChangeCause::Invalidated);
        touched
    }

    /// Copy every entry equal to or below each prefix.
    pub fn snapshot(&self, prefixes: &[ResourceKey]) -> Snapshot {
        let entries = read(&self.entries, SOURCE, "snapshot");
        capture(&entries, prefixes, self.version())
    }

    /// Put every snapshotted key back exactly as captured, under one lock.
    ///
    /// A restored entry keeps only the optimistic writers it had at snapshot
    /// time that are still marked on the current entry; writers that settled
    /// since are not brought back.
    pub fn restore(&self, snapshot: &Snapshot) -> RestoreReport {
        let mut report = RestoreReport::default();
        let (keys, version, count) = {
            let mut entries = write(&self.entries, SOURCE, "restore");
            let version = self.next_version();
            let now = Instant::now();
            let mut keys = Vec::with_capacity(snapshot.entries.len());

            for (canonical, (key, saved)) in &snapshot.entries {
                let current = entries.get(canonical).map(|(_, entry)| entry);
                if current.is_some_and(|entry| {
                    entry.is_optimistic && entry.version > snapshot.patched_at
                }) {
                    report.overwritten.push(key.clone());
                }
                let invalidations = current.map_or(0, |entry| entry.invalidations);
                let live_writers: BTreeSet<Uuid> = current
                    .map(|entry| entry.optimistic_writers.clone())
                    .unwrap_or_default();

                match saved {
                    Some(saved) => {
                        let mut entry = saved.clone();
                        entry.version = version;
                        entry.invalidations = entry.invalidations.max(invalidations);
                        entry
                            .optimistic_writers
                            .retain(|writer| live_writers.contains(writer));
                        entry.is_optimistic = !entry.optimistic_writers.is_empty();
                        entry.updated_at = now;
                        entries.insert(canonical.clone(), (key.clone(), entry));
                        report.restored += 1;
                        keys.push(key.clone());
                    }
                    None => {
                        if entries.remove(canonical).is_some() {
                            report.removed += 1;
                            keys.push(key.clone());
                        }
                    }
                }
            }
            (keys, version, entries.len())
        };

        gauge!(METRIC_ENTRIES).set(count as f64);
        if !keys.is_empty() {
            self.broker
                .notify_batch(&keys, &[], version, ChangeCause::Restored);
        }
        report
    }

    /// Remove `prefix` and everything below it. Returns the number removed.
    pub fn evict(&self, prefix: &ResourceKey) -> usize {
        let (removed, version, count) = {
            let mut entries = write(&self.entries, SOURCE, "evict");
            let version = self.next_version();
            let removed = remove_where(&mut entries, |key, _| prefix.is_prefix_of(key));
            (removed, version, entries.len())
        };

        gauge!(METRIC_ENTRIES).set(count as f64);
        if !removed.is_empty() {
            counter!(METRIC_EVICTED, "reason" => "explicit").increment(removed.len() as u64);
            self.broker
                .notify_batch(&removed, &[], version, ChangeCause::Evicted);
        }
        removed.len()
    }

    /// Drop entries that no subscription covers and that have not changed
    /// for `idle`. Loading entries are kept.
    pub fn evict_unobserved(&self, idle: Duration) -> usize {
        let now = Instant::now();
        let (removed, count) = {
            let mut entries = write(&self.entries, SOURCE, "evict_unobserved");
            let removed = remove_where(&mut entries, |key, entry| {
                entry.status != QueryStatus::Loading
                    && now.saturating_duration_since(entry.updated_at) >= idle
                    && !self.broker.has_observers(key)
            });
            (removed.len(), entries.len())
        };

        gauge!(METRIC_ENTRIES).set(count as f64);
        if removed > 0 {
            counter!(METRIC_EVICTED, "reason" => "unobserved").increment(removed as u64);
            debug!(removed, remaining = count, "Collected unobserved cache entries");
        }
        removed
    }

    pub fn clear(&self) {
        let version = {
            let mut entries = write(&self.entries, SOURCE, "clear");
            entries.clear();
            self.next_version()
        };
        gauge!(METRIC_ENTRIES).set(0.0);
        self.broker.notify_all(version, ChangeCause::Evicted);
    }
}

impl fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("entries", &self.len())
            .field("version", &self.version())
            .finish()
    }
}

fn capture(entries: &Entries, prefixes: &[ResourceKey], taken_at: u64) -> Snapshot {
    let mut copied = BTreeMap::new();
    for prefix in prefixes {
        for (canonical, (key, entry)) in entries.iter() {
            if prefix.is_prefix_of(key) {
                copied.insert(canonical.clone(), (key.clone(), Some(entry.clone())));
            }
        }
        copied
            .entry(prefix.serialize().to_string())
            .or_insert_with(|| (prefix.clone(), None));
    }

    Snapshot {
        entries: copied,
        taken_at,
        patched_at: taken_at,
    }
}

fn mark_stale(
    entries: &mut Entries,
    version: u64,
    predicate: impl Fn(&ResourceKey) -> bool,
) -> Vec<ResourceKey> {
    let mut touched = Vec::new();
    for (key, entry) in entries.values_mut() {
        if predicate(key) {
            entry.fetched_at = None;
            entry.invalidations += 1;
            entry.version = version;
            touched.push(key.clone());
        }
    }
    touched
}

fn remove_where(
    entries: &mut Entries,
    predicate: impl Fn(&ResourceKey, &CacheEntry) -> bool,
) -> Vec<ResourceKey> {
    let doomed: Vec<String> = entries
        .iter()
        .filter(|(_, (key, entry))| predicate(key, entry))
        .map(|(canonical, _)| canonical.clone())
        .collect();
    doomed
        .into_iter()
        .filter_map(|canonical| entries.remove(&canonical).map(|(key, _)| key))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use almanac_api_types::{AccountStatus, SellerRecord};
    use serde_json::json;

    use super::*;
    use crate::sync::data::{CacheData, Record};

    fn key(value: serde_json::Value) -> ResourceKey {
        ResourceKey::from_json(&value).expect("valid key")
    }

    fn seller(id: &str) -> CacheData {
        CacheData::Record(Record::Seller(SellerRecord {
            id: id.to_string(),
            business_name: "Gems".to_string(),
            owner_name: "Ira".to_string(),
            email: "ira@example.com".to_string(),
            status: AccountStatus::Pending,
            product_count: 0,
            created_at: None,
        }))
    }

    fn loaded(data: CacheData) -> EntryPatch {
        EntryPatch::new()
            .data(Some(data))
            .status(QueryStatus::Success)
            .fetched_now()
    }

    fn store() -> CacheStore {
        CacheStore::new(Duration::from_secs(30))
    }

    fn counter_listener() -> (Arc<Mutex<usize>>, impl Fn(&Notification) + Send + Sync) {
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        (count, move |_: &Notification| {
            *sink.lock().expect("count lock") += 1
        })
    }

    #[test]
    fn set_creates_idle_entry_then_patches() {
        let store = store();
        let detail = key(json!(["sellers", "detail", "S1"]));

        store.set(&detail, EntryPatch::new());
        let entry = store.get(&detail).expect("entry created");
        assert_eq!(entry.status, QueryStatus::Idle);
        assert!(entry.data.is_none());

        let version = store.set(&detail, loaded(seller("S1")));
        let entry = store.get(&detail).expect("entry exists");
        assert_eq!(entry.status, QueryStatus::Success);
        assert_eq!(entry.version, version);
        assert!(entry.fetched_at.is_some());
    }

    #[test]
    fn unknown_key_reads_idle() {
        let state = store().state(&key(json!(["users", "list"])));
        assert_eq!(state.status, QueryStatus::Idle);
        assert!(!state.has_data());
    }

    #[test]
    fn invalidate_keeps_data_and_clears_freshness() {
        let store = store();
        let list = key(json!(["sellers", "list", {"status": "pending"}]));
        let detail = key(json!(["sellers", "detail", "S1"]));
        let other = key(json!(["astrologers", "list"]));
        for k in [&list, &detail, &other] {
            store.set(k, loaded(seller("S1")));
        }

        assert_eq!(store.invalidate(&key(json!(["sellers"]))), 2);

        let entry = store.get(&list).expect("list kept");
        assert!(entry.data.is_some());
        assert!(entry.fetched_at.is_none());
        assert_eq!(entry.invalidations, 1);
        assert!(store.get(&other).expect("other kept").fetched_at.is_some());
    }

    #[test]
    fn invalidate_notifies_subscribers_once_including_below_prefix() {
        let store = store();
        let list = key(json!(["sellers", "list", {"status": "pending"}]));
        store.set(&list, loaded(seller("S1")));

        let (root_count, root) = counter_listener();
        let (list_count, on_list) = counter_listener();
        let (idle_count, idle) = counter_listener();
        let _a = store.subscribe(key(json!(["sellers"])), root);
        let _b = store.subscribe(list.clone(), on_list);
        let _c = store.subscribe(key(json!(["sellers", "detail", "S9"])), idle);

        store.invalidate(&key(json!(["sellers"])));

        assert_eq!(*root_count.lock().expect("count lock"), 1);
        assert_eq!(*list_count.lock().expect("count lock"), 1);
        assert_eq!(*idle_count.lock().expect("count lock"), 1);
    }

    #[test]
    fn snapshot_restore_round_trips_and_removes_created_entries() {
        let store = store();
        let root = key(json!(["sellers"]));
        let list = key(json!(["sellers", "list"]));
        store.set(&list, loaded(seller("S1")));

        let snapshot = store.snapshot(std::slice::from_ref(&root));
        assert_eq!(snapshot.len(), 2);

        store.set(&list, EntryPatch::new().data(Some(seller("S2"))).optimistic_by(Uuid::new_v4()));
        store.set(&root, EntryPatch::new().optimistic_by(Uuid::new_v4()));

        let report = store.restore(&snapshot);
        assert_eq!(report.restored, 1);
        assert_eq!(report.removed, 1);
        assert!(!store.contains(&root));
        let state = store.state(&list);
        assert_eq!(state.data, Some(seller("S1")));
        assert!(!state.is_optimistic);
    }

    #[test]
    fn restore_reports_newer_optimistic_writes() {
        let store = store();
        let list = key(json!(["sellers", "list"]));
        store.set(&list, loaded(seller("S1")));

        let mut snapshot = store.snapshot(std::slice::from_ref(&list));
        let own = store.set(&list, EntryPatch::new().optimistic_by(Uuid::new_v4()));
        snapshot.mark_patched(own);
        store.set(&list, EntryPatch::new().data(Some(seller("S2"))).optimistic_by(Uuid::new_v4()));

        let report = store.restore(&snapshot);
        assert_eq!(report.overwritten, vec![list]);
    }

    fn approve_all() -> OptimisticPatch {
        Arc::new(|_: &ResourceKey, data: &CacheData| match data {
            CacheData::Record(Record::Seller(seller)) => {
                let mut seller = seller.clone();
                seller.status = AccountStatus::Active;
                Some(CacheData::Record(Record::Seller(seller)))
            }
            _ => None,
        })
    }

    fn seller_status(store: &CacheStore, key: &ResourceKey) -> Option<AccountStatus> {
        match store.state(key).data {
            Some(CacheData::Record(Record::Seller(seller))) => Some(seller.status),
            _ => None,
        }
    }

    #[test]
    fn fetched_data_keeps_pending_optimistic_layers() {
        let store = store();
        let detail = key(json!(["sellers", "detail", "S1"]));
        store.set(&detail, loaded(seller("S1")));
        let mutation = Uuid::new_v4();

        let (snapshot, touched) =
            store.apply_optimistic(mutation, &[key(json!(["sellers"]))], approve_all());
        assert_eq!(touched, vec![detail.clone()]);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(store.pending_optimistic(), vec![mutation]);

        let version = store.set_fetched_silently(&detail, seller("S1"), None);
        store.announce(&detail, version);
        let entry = store.get(&detail).expect("entry");
        assert!(entry.is_optimistic);
        assert!(entry.fetched_at.is_some());
        assert_eq!(seller_status(&store, &detail), Some(AccountStatus::Active));

        assert!(store.release_optimistic(mutation));
        store.set_fetched_silently(&detail, seller("S1"), None);
        assert!(!store.state(&detail).is_optimistic);
        assert_eq!(seller_status(&store, &detail), Some(AccountStatus::Pending));
    }

    #[test]
    fn restore_does_not_revive_settled_writers() {
        let store = store();
        let list = key(json!(["sellers", "list"]));
        store.set(&list, loaded(seller("S1")));
        let earlier = store.set(&list, EntryPatch::new().optimistic_by(Uuid::new_v4()));
        let earlier_writer = store
            .get(&list)
            .and_then(|entry| entry.optimistic_writers.first().copied())
            .expect("writer");

        let snapshot = store.snapshot(std::slice::from_ref(&list));
        store.set(&list, EntryPatch::new().optimistic_by(Uuid::new_v4()));
        store.set(&list, EntryPatch::new().settled(earlier_writer));

        store.restore(&snapshot);
        let entry = store.get(&list).expect("entry");
        assert!(entry.version > earlier);
        assert!(entry.optimistic_writers.is_empty());
        assert!(!entry.is_optimistic);
    }

    #[test]
    fn patch_under_is_one_version() {
        let store = store();
        store.set(&key(json!(["blogs", "list"])), loaded(seller("S1")));
        store.set(&key(json!(["blogs", "detail", "B1"])), loaded(seller("S1")));
        store.set(&key(json!(["notices", "list"])), loaded(seller("S1")));

        let (touched, version) = store.patch_under(&[key(json!(["blogs"]))], |_, entry| {
            entry.data.as_ref().map(|_| EntryPatch::new().optimistic_by(Uuid::new_v4()))
        });

        assert_eq!(touched.len(), 2);
        for k in touched {
            assert_eq!(store.get(&k).expect("entry").version, version);
        }
    }

    #[test]
    fn set_if_version_rejects_stale_writers() {
        let store = store();
        let list = key(json!(["users", "list"]));
        let first = store.set(&list, EntryPatch::new().status(QueryStatus::Loading));
        store.set(&list, EntryPatch::new().optimistic_by(Uuid::new_v4()));
        assert!(store
            .set_if_version(&list, first, EntryPatch::new().status(QueryStatus::Success))
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn evict_unobserved_keeps_watched_and_recent_entries() {
        let store = store();
        let watched = key(json!(["users", "list"]));
        let orphan = key(json!(["courses", "list"]));
        store.set(&watched, loaded(seller("S1")));
        store.set(&orphan, loaded(seller("S1")));
        let _sub = store.subscribe(key(json!(["users"])), |_: &Notification| {});

        assert_eq!(store.evict_unobserved(Duration::from_secs(60)), 0);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(store.evict_unobserved(Duration::from_secs(60)), 1);
        assert!(store.contains(&watched));
        assert!(!store.contains(&orphan));
    }

    #[test]
    fn evict_removes_subtree() {
        let store = store();
        store.set(&key(json!(["sellers", "list"])), loaded(seller("S1")));
        store.set(&key(json!(["sellers", "detail", "S1"])), loaded(seller("S1")));
        store.set(&key(json!(["users", "list"])), loaded(seller("S1")));

        assert_eq!(store.evict(&key(json!(["sellers"]))), 2);
        assert_eq!(store.keys_under(&key(json!(["sellers"]))).len(), 0);
        assert_eq!(store.len(), 1);
    }
}
