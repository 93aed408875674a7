//! Almanac server-state synchronization core.
//!
//! An in-memory cache of server-owned entities shared by every dashboard
//! view:
//!
//! - **Keys**: hierarchical [`ResourceKey`]s; a prefix addresses a subtree
//! - **Store**: [`CacheStore`] entries with staleness and optimistic flags
//! - **Queries**: [`QueryRunner`] dedupes fetches and applies the newest
//!   result
//! - **Mutations**: [`MutationRunner`] patches optimistically, then confirms
//!   or rolls back
//! - **Subscriptions**: [`SubscriptionBroker`] tells views about changes in
//!   their subtree
//!
//! ## Configuration
//!
//! ```toml
//! [sync]
//! stale_after_ms = 30000
//! gc_interval_ms = 60000
//! gc_idle_ms = 300000
//! enable_gc = true
//! ```

pub mod actions;
mod broker;
mod client;
mod config;
mod data;
mod entry;
mod error;
mod key;
mod lock;
mod mutation;
mod query;
mod reaction;
mod store;
mod transport;

pub use broker::{ChangeCause, Listener, Notification, Subscription, SubscriptionBroker};
pub use client::SyncClient;
pub use config::SyncConfig;
pub use data::{
    CacheData, Descriptor, ListParams, Reconcile, Record, RecordList, Resource, StatusChange,
    UnknownResource, View,
};
pub use entry::{CacheEntry, EntryPatch, EntryState, QueryStatus};
pub use error::{ErrorKind, SyncError, TransportError};
pub use key::{ResourceKey, Segment, equals, is_ancestor, serialize};
pub use mutation::{
    MutationOutcome, MutationPhase, MutationRequest, MutationRunner, Operation, OptimisticPatch,
};
pub use query::{QueryOptions, QueryRunner};
pub use reaction::{FailureReactor, Reaction, SessionState};
pub use store::{CacheStore, RestoreReport, Snapshot};
pub use transport::{MutationTarget, Transport};

#[doc(hidden)]
pub use serde_json::json as __json;
