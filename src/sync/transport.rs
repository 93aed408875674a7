//! Boundary to the external HTTP collaborator.

use async_trait::async_trait;
use serde_json::Value;

use super::data::{Descriptor, Resource};
use super::error::TransportError;
use super::mutation::Operation;

/// Where a mutation is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationTarget {
    pub resource: Resource,
    pub operation: Operation,
}

/// Fetch and mutate capabilities the core consumes.
///
/// Implementations perform their own retries; an `Err` is final.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, descriptor: &Descriptor) -> Result<Value, TransportError>;

    async fn mutate(
        &self,
        target: &MutationTarget,
        payload: &Value,
    ) -> Result<Value, TransportError>;
}
