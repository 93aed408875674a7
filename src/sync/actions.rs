//! Moderation mutations issued from the dashboard.
//!
//! Each action affects the whole resource collection, so list and detail
//! views of the resource are patched together and refetched after
//! confirmation.

use std::future::Future;
use std::sync::Arc;

use serde_json::{Value, json};

use super::client::SyncClient;
use super::data::{CacheData, Record, Resource, StatusChange};
use super::error::SyncError;
use super::key::ResourceKey;
use super::mutation::{MutationOutcome, MutationRequest, Operation, OptimisticPatch};

/// A prepared mutation with its optimistic patch.
pub struct AdminAction {
    pub request: MutationRequest,
    pub optimistic: Option<OptimisticPatch>,
}

impl AdminAction {
    pub fn submit(
        self,
        client: &SyncClient,
    ) -> impl Future<Output = Result<MutationOutcome, SyncError>> + Send + 'static {
        client.mutate(self.request, self.optimistic)
    }
}

/// Move a record to another review or publication status.
pub fn set_status(resource: Resource, id: &str, status: StatusChange) -> AdminAction {
    let target = id.to_string();
    let request = MutationRequest::new(
        resource,
        Operation::Action {
            id: target.clone(),
            name: "status".to_string(),
        },
        json!({ "status": status.as_str() }),
    );
    let optimistic: OptimisticPatch = Arc::new(move |_: &ResourceKey, data: &CacheData| {
        data.map_record(&target, |record| {
            record.apply_status(status);
        })
    });
    AdminAction {
        request,
        optimistic: Some(optimistic),
    }
}

/// Replace a record with a locally edited copy.
pub fn update(record: Record) -> Result<AdminAction, serde_json::Error> {
    let payload = serde_json::to_value(&record)?;
    let request = MutationRequest::new(
        record.resource(),
        Operation::Update {
            id: record.id().to_string(),
        },
        payload,
    );
    let optimistic: OptimisticPatch = Arc::new(move |_: &ResourceKey, data: &CacheData| {
        data.map_record(record.id(), |current| *current = record.clone())
    });
    Ok(AdminAction {
        request,
        optimistic: Some(optimistic),
    })
}

/// Delete a record; it disappears from cached lists right away.
pub fn delete(resource: Resource, id: &str) -> AdminAction {
    let target = id.to_string();
    let request = MutationRequest::new(
        resource,
        Operation::Delete { id: target.clone() },
        Value::Null,
    );
    let optimistic: OptimisticPatch =
        Arc::new(move |_: &ResourceKey, data: &CacheData| data.without_record(&target));
    AdminAction {
        request,
        optimistic: Some(optimistic),
    }
}

/// Create a record. The server assigns the id, so there is no optimistic
/// patch; lists pick the record up when they refetch.
pub fn create(resource: Resource, payload: Value) -> AdminAction {
    AdminAction {
        request: MutationRequest::new(resource, Operation::Create, payload),
        optimistic: None,
    }
}

#[cfg(test)]
mod tests {
    use almanac_api_types::{AccountStatus, PublishStatus, UserRecord};

    use super::*;
    use crate::sync::data::RecordList;

    fn users() -> CacheData {
        CacheData::List(RecordList {
            resource: Resource::Users,
            items: vec![Record::User(UserRecord {
                id: "u1".to_string(),
                name: "Asha".to_string(),
                email: "asha@example.com".to_string(),
                status: AccountStatus::Pending,
                created_at: None,
            })],
            total: 1,
            page: 1,
        })
    }

    fn apply(action: &AdminAction, data: &CacheData) -> Option<CacheData> {
        let patch = action.optimistic.as_ref().expect("has optimistic patch");
        patch(&Resource::Users.lists_key(), data)
    }

    #[test]
    fn set_status_patches_the_matching_record() {
        let action = set_status(
            Resource::Users,
            "u1",
            StatusChange::Account(AccountStatus::Suspended),
        );
        assert_eq!(action.request.payload, json!({"status": "suspended"}));
        assert_eq!(action.request.affects, vec![Resource::Users.root_key()]);

        let patched = apply(&action, &users()).expect("record present");
        assert_eq!(
            patched.record("u1").map(Record::status),
            Some(StatusChange::Account(AccountStatus::Suspended))
        );
    }

    #[test]
    fn mismatched_status_leaves_the_record_unchanged() {
        let action = set_status(
            Resource::Users,
            "u1",
            StatusChange::Publication(PublishStatus::Published),
        );
        let patched = apply(&action, &users()).expect("record present");
        assert_eq!(patched, users());
    }

    #[test]
    fn delete_removes_from_lists() {
        let action = delete(Resource::Users, "u1");
        let patched = apply(&action, &users()).expect("list changes");
        assert!(patched.record("u1").is_none());
        assert!(apply(&action, &patched).is_none());
    }

    #[test]
    fn update_replaces_the_record() {
        let edited = Record::User(UserRecord {
            id: "u1".to_string(),
            name: "Asha K".to_string(),
            email: "asha@example.com".to_string(),
            status: AccountStatus::Pending,
            created_at: None,
        });
        let action = update(edited.clone()).expect("serializable");
        assert_eq!(action.request.payload["name"], "Asha K");
        let patched = apply(&action, &users()).expect("record present");
        assert_eq!(patched.record("u1"), Some(&edited));
    }

    #[test]
    fn create_has_no_optimistic_patch() {
        let action = create(Resource::Notices, json!({"title": "Maintenance"}));
        assert!(action.optimistic.is_none());
        assert_eq!(action.request.operation, Operation::Create);
    }
}
