//! Write path: optimistic patch, confirmation or rollback, invalidation.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use metrics::{counter, histogram};
use serde::Serialize;
use serde_json::Value;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use super::data::{CacheData, Record, Resource};
use super::entry::EntryPatch;
use super::error::{SyncError, TransportError};
use super::key::ResourceKey;
use super::reaction::FailureReactor;
use super::store::{CacheStore, Snapshot};

const METRIC_MUTATION_TOTAL: &str = "almanac_sync_mutation_total";
const METRIC_MUTATION_MS: &str = "almanac_sync_mutation_ms";
const METRIC_ROLLBACK_OVERLAP: &str = "almanac_sync_rollback_overlap_total";

/// Kind of write sent to the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update { id: String },
    Delete { id: String },
    /// A named custom action such as `approve` or `suspend`.
    Action { id: String, name: String },
}

impl Operation {
    pub fn name(&self) -> &str {
        match self {
            Operation::Create => "create",
            Operation::Update { .. } => "update",
            Operation::Delete { .. } => "delete",
            Operation::Action { name, .. } => name,
        }
    }

    pub fn record_id(&self) -> Option<&str> {
        match self {
            Operation::Create => None,
            Operation::Update { id } | Operation::Delete { id } | Operation::Action { id, .. } => {
                Some(id)
            }
        }
    }
}

/// One write and the keys it may patch or invalidate.
#[derive(Debug, Clone)]
pub struct MutationRequest {
    pub id: Uuid,
    pub resource: Resource,
    pub operation: Operation,
    pub payload: Value,
    /// Keys or key prefixes patched optimistically and invalidated on success.
    pub affects: Vec<ResourceKey>,
}

impl MutationRequest {
    /// A request affecting the whole resource collection.
    pub fn new(resource: Resource, operation: Operation, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            resource,
            operation,
            payload,
            affects: vec![resource.root_key()],
        }
    }

    pub fn affecting(mut self, affects: Vec<ResourceKey>) -> Self {
        self.affects = affects;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPhase {
    Idle,
    OptimisticApplied,
    Confirmed,
    RolledBack,
}

impl MutationPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            MutationPhase::Idle => "idle",
            MutationPhase::OptimisticApplied => "optimistic_applied",
            MutationPhase::Confirmed => "confirmed",
            MutationPhase::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for MutationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Computes the optimistic value of one cached entry, or `None` to leave it.
pub type OptimisticPatch = Arc<dyn Fn(&ResourceKey, &CacheData) -> Option<CacheData> + Send + Sync>;

/// Confirmed result of a mutation.
#[derive(Debug, Clone)]
pub struct MutationOutcome {
    pub mutation: Uuid,
    pub phase: MutationPhase,
    /// Server record decoded from the response, when it returned one.
    pub record: Option<Record>,
    pub response: Value,
    pub reconciled: usize,
    pub invalidated: usize,
}

pub struct MutationRunner {
    store: Arc<CacheStore>,
    reactor: Arc<FailureReactor>,
    pending: Arc<AtomicUsize>,
}

impl MutationRunner {
    pub fn new(store: Arc<CacheStore>, reactor: Arc<FailureReactor>) -> Self {
        Self {
            store,
            reactor,
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Mutations whose lifecycle has not finished.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Start a mutation.
    ///
    /// The optimistic patch is applied before this returns. The rest of the
    /// lifecycle runs on a spawned task, so it reaches `Confirmed` or
    /// `RolledBack` even if the returned future is dropped. Must be called
    /// within a Tokio runtime.
    pub fn run<F, Fut>(
        &self,
        request: MutationRequest,
        mutate_fn: F,
        optimistic: Option<OptimisticPatch>,
    ) -> impl Future<Output = Result<MutationOutcome, SyncError>> + Send + 'static
    where
        F: FnOnce(Value) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, TransportError>> + Send + 'static,
    {
        let mutation = request.id;
        let span = info_span!(
            "mutation",
            mutation = %request.id,
            resource = %request.resource,
            operation = request.operation.name()
        );
        let snapshot = {
            let _entered = span.enter();
            optimistic.map(|patch| apply_optimistic(&self.store, &request, patch))
        };

        self.pending.fetch_add(1, Ordering::AcqRel);
        let lifecycle = Lifecycle {
            store: Arc::clone(&self.store),
            reactor: Arc::clone(&self.reactor),
            pending: Arc::clone(&self.pending),
            request,
            snapshot,
        };
        let handle = tokio::spawn(lifecycle.finish(mutate_fn).instrument(span));

        async move {
            match handle.await {
                Ok(result) => result,
                Err(err) => Err(SyncError::RollbackFailed {
                    mutation,
                    reason: err.to_string(),
                }),
            }
        }
    }
}

fn apply_optimistic(
    store: &CacheStore,
    request: &MutationRequest,
    patch: OptimisticPatch,
) -> Snapshot {
    let (snapshot, patched) = store.apply_optimistic(request.id, &request.affects, patch);

    info!(
        mutation = %request.id,
        phase = %MutationPhase::OptimisticApplied,
        patched = patched.len(),
        snapshotted = snapshot.len(),
        "Optimistic patch applied"
    );
    snapshot
}

struct Lifecycle {
    store: Arc<CacheStore>,
    reactor: Arc<FailureReactor>,
    pending: Arc<AtomicUsize>,
    request: MutationRequest,
    snapshot: Option<Snapshot>,
}

impl Lifecycle {
    async fn finish<F, Fut>(self, mutate_fn: F) -> Result<MutationOutcome, SyncError>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = Result<Value, TransportError>>,
    {
        let started_at = std::time::Instant::now();
        let result = mutate_fn(self.request.payload.clone()).await;

        let outcome = match result {
            Ok(response) => Ok(self.confirm(response)),
            Err(error) => Err(self.roll_back(error)),
        };

        let label = if outcome.is_ok() {
            MutationPhase::Confirmed
        } else {
            MutationPhase::RolledBack
        };
        counter!(METRIC_MUTATION_TOTAL, "outcome" => label.as_str()).increment(1);
        histogram!(METRIC_MUTATION_MS, "outcome" => label.as_str())
            .record(started_at.elapsed().as_secs_f64() * 1000.0);
        self.pending.fetch_sub(1, Ordering::AcqRel);
        outcome
    }

    fn confirm(&self, response: Value) -> MutationOutcome {
        let request = &self.request;
        let record = match (&request.operation, &response) {
            (Operation::Delete { .. }, _) | (_, Value::Null) => None,
            _ => match Record::decode(request.resource, response.clone()) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(
                        mutation = %request.id,
                        error = %err,
                        "Mutation response is not a record; relying on refetch"
                    );
                    None
                }
            },
        };

        self.store.release_optimistic(request.id);
        // Entries patched by other pending mutations stay optimistic.
        let (reconciled, _) = self.store.patch_under(&request.affects, |_, entry| {
            let next = entry
                .data
                .as_ref()
                .and_then(|current| current.reconcile(&request.operation, record.as_ref()));
            let wrote = entry.optimistic_writers.contains(&request.id);
            match next {
                Some(next) => Some(EntryPatch::new().data(Some(next)).settled(request.id)),
                None if wrote => Some(EntryPatch::new().settled(request.id)),
                None => None,
            }
        });

        let invalidated = request
            .affects
            .iter()
            .map(|prefix| self.store.invalidate(prefix))
            .sum();

        info!(
            mutation = %request.id,
            phase = %MutationPhase::Confirmed,
            reconciled = reconciled.len(),
            invalidated,
            "Mutation confirmed"
        );

        MutationOutcome {
            mutation: request.id,
            phase: MutationPhase::Confirmed,
            record,
            response,
            reconciled: reconciled.len(),
            invalidated,
        }
    }

    fn roll_back(&self, error: TransportError) -> SyncError {
        let request = &self.request;
        self.store.release_optimistic(request.id);
        if let Some(snapshot) = &self.snapshot {
            let report = self.store.restore(snapshot);
            if !report.overwritten.is_empty() {
                counter!(METRIC_ROLLBACK_OVERLAP).increment(report.overwritten.len() as u64);
                warn!(
                    mutation = %request.id,
                    keys = ?report.overwritten,
                    "Rollback overwrote a newer optimistic patch"
                );
            }
        }
        // Keys first fetched while this mutation was pending carry its patch
        // but are not in the snapshot; drop the mark and force a refetch.
        self.store.patch_under(&request.affects, |_, entry| {
            entry
                .optimistic_writers
                .contains(&request.id)
                .then(|| EntryPatch::new().settled(request.id).clear_fetched())
        });

        warn!(
            mutation = %request.id,
            phase = %MutationPhase::RolledBack,
            kind = %error.kind,
            message = %error.message,
            "Mutation failed; optimistic patch rolled back"
        );
        self.reactor.react(&error, &request.affects);
        self.reactor
            .mutation_error(request.id, request.resource.as_str(), error)
    }
}
