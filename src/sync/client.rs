//! Facade wiring the store, runners and transport together.

use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::broker::{Notification, Subscription};
use super::config::SyncConfig;
use super::data::{CacheData, Descriptor};
use super::entry::EntryState;
use super::error::{SyncError, TransportError};
use super::key::ResourceKey;
use super::mutation::{MutationOutcome, MutationRequest, MutationRunner, OptimisticPatch};
use super::query::{QueryOptions, QueryRunner};
use super::reaction::{FailureReactor, SessionState};
use super::store::CacheStore;
use super::transport::{MutationTarget, Transport};

type FetchFuture = BoxFuture<'static, Result<CacheData, TransportError>>;

/// One synchronization session: a single store shared by every view.
pub struct SyncClient {
    config: SyncConfig,
    store: Arc<CacheStore>,
    reactor: Arc<FailureReactor>,
    queries: QueryRunner,
    mutations: MutationRunner,
    transport: Arc<dyn Transport>,
}

impl SyncClient {
    pub fn new(config: SyncConfig, transport: Arc<dyn Transport>) -> Self {
        let store = Arc::new(CacheStore::new(config.stale_after()));
        let reactor = Arc::new(FailureReactor::new(Arc::clone(&store)));
        Self {
            queries: QueryRunner::new(Arc::clone(&store), Arc::clone(&reactor)),
            mutations: MutationRunner::new(Arc::clone(&store), Arc::clone(&reactor)),
            config,
            store,
            reactor,
            transport,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn queries(&self) -> &QueryRunner {
        &self.queries
    }

    pub fn mutations(&self) -> &MutationRunner {
        &self.mutations
    }

    /// Read `key`, fetching when it is missing or stale.
    ///
    /// Only an unresolvable key is an `Err`; fetch failures are reported in
    /// the returned state.
    pub async fn query(&self, key: &ResourceKey) -> Result<EntryState, SyncError> {
        let fetcher = self.fetcher(key)?;
        Ok(self.queries.run(key, fetcher, QueryOptions::default()).await)
    }

    pub async fn refetch(&self, key: &ResourceKey) -> Result<EntryState, SyncError> {
        let fetcher = self.fetcher(key)?;
        Ok(self.queries.refetch(key, fetcher).await)
    }

    pub fn prefetch(&self, key: &ResourceKey) -> Result<(), SyncError> {
        let fetcher = self.fetcher(key)?;
        self.queries.prefetch(key, fetcher, QueryOptions::default());
        Ok(())
    }

    pub fn state(&self, key: &ResourceKey) -> EntryState {
        self.store.state(key)
    }

    pub fn subscribe<F>(&self, key: ResourceKey, listener: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.store.subscribe(key, listener)
    }

    /// Subscribe and receive notifications on a channel.
    pub fn changes(&self, key: ResourceKey) -> (Subscription, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.store.subscribe(key, move |notification: &Notification| {
            let _ = tx.send(notification.clone());
        });
        (subscription, rx)
    }

    pub fn invalidate(&self, prefix: &ResourceKey) -> usize {
        self.store.invalidate(prefix)
    }

    /// Send `request` through the transport. See [`MutationRunner::run`].
    pub fn mutate(
        &self,
        request: MutationRequest,
        optimistic: Option<OptimisticPatch>,
    ) -> impl Future<Output = Result<MutationOutcome, SyncError>> + Send + 'static {
        let transport = Arc::clone(&self.transport);
        let target = MutationTarget {
            resource: request.resource,
            operation: request.operation.clone(),
        };
        self.mutations.run(
            request,
            move |payload| async move { transport.mutate(&target, &payload).await },
            optimistic,
        )
    }

    /// Observe re-authentication requests.
    pub fn session(&self) -> watch::Receiver<SessionState> {
        self.reactor.session()
    }

    pub fn mark_session_active(&self) {
        self.reactor.mark_active();
    }

    /// Start the periodic collection of unobserved entries.
    ///
    /// Returns `None` when collection is disabled.
    pub fn spawn_maintenance(&self) -> Option<JoinHandle<()>> {
        if !self.config.enable_gc {
            return None;
        }

        let store = Arc::clone(&self.store);
        let period = self.config.gc_interval();
        let idle = self.config.gc_idle();
        info!(
            interval_ms = self.config.gc_interval_ms,
            idle_ms = self.config.gc_idle_ms,
            "Starting cache maintenance"
        );
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // Skip the first immediate tick
            loop {
                interval.tick().await;
                let removed = store.evict_unobserved(idle);
                debug!(removed, "Cache maintenance sweep finished");
            }
        }))
    }

    fn fetcher(
        &self,
        key: &ResourceKey,
    ) -> Result<impl FnOnce() -> FetchFuture + use<>, SyncError> {
        let descriptor = Descriptor::from_key(key)?;
        let transport = Arc::clone(&self.transport);
        Ok(move || {
            async move {
                let value = transport.fetch(&descriptor).await?;
                CacheData::decode(&descriptor, value)
            }
            .boxed()
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use super::*;
    use crate::sync::data::{ListParams, Resource, View};
    use crate::sync::entry::QueryStatus;

    #[derive(Default)]
    struct StubTransport {
        fetches: AtomicUsize,
        sent: Mutex<Vec<(MutationTarget, Value)>>,
    }

    #[async_trait]
    impl Transport for StubTransport {
        async fn fetch(&self, descriptor: &Descriptor) -> Result<Value, TransportError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            match &descriptor.view {
                View::List(_) => Ok(json!({
                    "items": [{"id": "u1", "name": "Asha", "email": "a@example.com", "status": "active"}],
                    "total": 1
                })),
                View::Detail(id) => Err(TransportError::not_found(format!("{id} is gone"))),
            }
        }

        async fn mutate(
            &self,
            target: &MutationTarget,
            payload: &Value,
        ) -> Result<Value, TransportError> {
            self.sent
                .lock()
                .expect("sent lock")
                .push((target.clone(), payload.clone()));
            Ok(Value::Null)
        }
    }

    fn client() -> (Arc<StubTransport>, SyncClient) {
        let transport = Arc::new(StubTransport::default());
        let client = SyncClient::new(SyncConfig::default(), transport.clone());
        (transport, client)
    }

    #[tokio::test]
    async fn query_decodes_through_the_descriptor() {
        let (transport, client) = client();
        let key = Resource::Users.list_key(&ListParams::default());

        let state = client.query(&key).await.expect("resolvable key");
        assert_eq!(state.status, QueryStatus::Success);
        assert!(state.data.as_ref().and_then(|d| d.record("u1")).is_some());

        client.query(&key).await.expect("resolvable key");
        assert_eq!(transport.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unresolvable_key_is_rejected_before_fetching() {
        let (transport, client) = client();
        let err = client
            .query(&Resource::Users.root_key())
            .await
            .expect_err("root key is not fetchable");
        assert!(matches!(err, SyncError::InvalidKey { .. }));
        assert_eq!(transport.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fetch_failure_is_absorbed() {
        let (_, client) = client();
        let key = Resource::Users.detail_key("u9").expect("key");
        let state = client.query(&key).await.expect("resolvable key");
        assert!(state.is_error());
        assert!(!state.has_data());
    }

    #[tokio::test]
    async fn mutate_routes_through_the_transport() {
        let (transport, client) = client();
        let request = MutationRequest::new(
            Resource::Users,
            crate::sync::mutation::Operation::Delete {
                id: "u1".to_string(),
            },
            Value::Null,
        );

        client.mutate(request, None).await.expect("confirmed");

        let sent = transport.sent.lock().expect("sent lock");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.resource, Resource::Users);
    }

    #[tokio::test]
    async fn changes_forwards_notifications() {
        let (_, client) = client();
        let (_sub, mut rx) = client.changes(Resource::Users.root_key());
        client.query(&Resource::Users.lists_key()).await.expect("resolvable key");

        let first = rx.recv().await.expect("notification");
        assert_eq!(first.subscribed, Resource::Users.root_key());
    }

    #[tokio::test]
    async fn maintenance_can_be_disabled() {
        let transport = Arc::new(StubTransport::default());
        let client = SyncClient::new(
            SyncConfig {
                enable_gc: false,
                ..SyncConfig::default()
            },
            transport,
        );
        assert!(client.spawn_maintenance().is_none());
    }
}
