//! Typed cache payloads.
//!
//! Server payloads are decoded into one variant per entity type and merged
//! with hand-written, per-entity functions. A generic deep merge would drop
//! fields silently whenever the record shapes drift.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use almanac_api_types::{
    AccountStatus, AstrologerRecord, BlogRecord, CourseRecord, ListPage, NoticeRecord,
    PublishStatus, SellerRecord, UserRecord,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::error::{SyncError, TransportError};
use super::key::{ResourceKey, Segment};
use super::mutation::Operation;

const LIST_SEGMENT: &str = "list";
const DETAIL_SEGMENT: &str = "detail";

/// Entity collections managed from the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Users,
    Astrologers,
    Sellers,
    Courses,
    Blogs,
    Notices,
}

#[derive(Debug, Error)]
#[error("unknown resource `{0}`")]
pub struct UnknownResource(pub String);

impl Resource {
    pub const ALL: [Resource; 6] = [
        Resource::Users,
        Resource::Astrologers,
        Resource::Sellers,
        Resource::Courses,
        Resource::Blogs,
        Resource::Notices,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Resource::Users => "users",
            Resource::Astrologers => "astrologers",
            Resource::Sellers => "sellers",
            Resource::Courses => "courses",
            Resource::Blogs => "blogs",
            Resource::Notices => "notices",
        }
    }

    /// Key covering every list and detail entry of this resource.
    pub fn root_key(self) -> ResourceKey {
        ResourceKey::trusted([Segment::from(self.as_str())])
    }

    /// Key covering every list variant of this resource.
    pub fn lists_key(self) -> ResourceKey {
        ResourceKey::trusted([Segment::from(self.as_str()), Segment::from(LIST_SEGMENT)])
    }

    pub fn list_key(self, params: &ListParams) -> ResourceKey {
        ResourceKey::trusted([
            Segment::from(self.as_str()),
            Segment::from(LIST_SEGMENT),
            params.to_segment(),
        ])
    }

    pub fn detail_key(self, id: &str) -> Result<ResourceKey, SyncError> {
        ResourceKey::new([
            Segment::from(self.as_str()),
            Segment::from(DETAIL_SEGMENT),
            Segment::from(id),
        ])
    }

    /// Parse a status name valid for this resource.
    pub fn parse_status(self, value: &str) -> Option<StatusChange> {
        let normalized = value.trim().to_ascii_lowercase();
        match self {
            Resource::Users | Resource::Astrologers | Resource::Sellers => {
                let status = match normalized.as_str() {
                    "pending" => AccountStatus::Pending,
                    "active" | "approve" | "approved" => AccountStatus::Active,
                    "suspended" | "suspend" => AccountStatus::Suspended,
                    "rejected" | "reject" => AccountStatus::Rejected,
                    _ => return None,
                };
                Some(StatusChange::Account(status))
            }
            Resource::Courses | Resource::Blogs | Resource::Notices => {
                let status = match normalized.as_str() {
                    "draft" => PublishStatus::Draft,
                    "published" | "publish" => PublishStatus::Published,
                    "archived" | "archive" => PublishStatus::Archived,
                    _ => return None,
                };
                Some(StatusChange::Publication(status))
            }
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resource {
    type Err = UnknownResource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Resource::ALL
            .into_iter()
            .find(|resource| resource.as_str() == s)
            .ok_or_else(|| UnknownResource(s.to_string()))
    }
}

/// Filters of a list view. Unset fields are omitted from the key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListParams {
    pub status: Option<String>,
    pub page: Option<u32>,
    pub search: Option<String>,
}

impl ListParams {
    pub fn with_status(status: impl Into<String>) -> Self {
        Self {
            status: Some(status.into()),
            ..Default::default()
        }
    }

    fn to_segment(&self) -> Segment {
        let mut record = BTreeMap::new();
        if let Some(status) = &self.status {
            record.insert("status".to_string(), Value::from(status.as_str()));
        }
        if let Some(page) = self.page {
            record.insert("page".to_string(), Value::from(page));
        }
        if let Some(search) = &self.search {
            record.insert("search".to_string(), Value::from(search.as_str()));
        }
        Segment::Record(record)
    }

    fn from_segment(segment: Option<&Segment>) -> Result<Self, SyncError> {
        let record = match segment {
            None | Some(Segment::Absent) => return Ok(Self::default()),
            Some(Segment::Record(record)) => record,
            Some(other) => {
                return Err(SyncError::invalid_key(format!(
                    "list parameters must be a record, got {other:?}"
                )));
            }
        };

        let mut params = Self::default();
        for (name, value) in record {
            match (name.as_str(), value) {
                ("status", Value::String(status)) => params.status = Some(status.clone()),
                ("search", Value::String(search)) => params.search = Some(search.clone()),
                ("page", Value::Number(page)) => {
                    let page = page
                        .as_u64()
                        .and_then(|page| u32::try_from(page).ok())
                        .ok_or_else(|| {
                            SyncError::invalid_key(format!("page `{page}` is out of range"))
                        })?;
                    params.page = Some(page);
                }
                _ => {
                    return Err(SyncError::invalid_key(format!(
                        "unsupported list parameter `{name}`"
                    )));
                }
            }
        }
        Ok(params)
    }

    /// Query string pairs for the list endpoint.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(status) = &self.status {
            pairs.push(("status", status.clone()));
        }
        if let Some(page) = self.page {
            pairs.push(("page", page.to_string()));
        }
        if let Some(search) = &self.search {
            pairs.push(("search", search.clone()));
        }
        pairs
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum View {
    List(ListParams),
    Detail(String),
}

/// What a key asks the transport for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub resource: Resource,
    pub view: View,
}

impl Descriptor {
    /// Resolve a fetchable key (`[resource, "list", params?]` or
    /// `[resource, "detail", id]`).
    pub fn from_key(key: &ResourceKey) -> Result<Self, SyncError> {
        let resource = Resource::from_str(key.resource_name())
            .map_err(|err| SyncError::invalid_key(err.to_string()))?;
        let segments = key.segments();

        let view = match segments.get(1) {
            Some(Segment::Text(view)) if view == LIST_SEGMENT && segments.len() <= 3 => {
                View::List(ListParams::from_segment(segments.get(2))?)
            }
            Some(Segment::Text(view)) if view == DETAIL_SEGMENT && segments.len() == 3 => {
                // Record ids are strings on the wire; a numeric segment would
                // name a different cache entry than the one refetched.
                match &segments[2] {
                    Segment::Text(id) => View::Detail(id.clone()),
                    other => {
                        return Err(SyncError::invalid_key(format!(
                            "detail id must be text, got {other:?}"
                        )));
                    }
                }
            }
            _ => {
                return Err(SyncError::invalid_key(format!(
                    "key {key} does not address a list or a record"
                )));
            }
        };

        Ok(Self { resource, view })
    }

    pub fn key(&self) -> Result<ResourceKey, SyncError> {
        match &self.view {
            View::List(params) => Ok(self.resource.list_key(params)),
            View::Detail(id) => self.resource.detail_key(id),
        }
    }
}

/// A status transition requested from the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    Account(AccountStatus),
    Publication(PublishStatus),
}

impl StatusChange {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusChange::Account(status) => status.as_str(),
            StatusChange::Publication(status) => status.as_str(),
        }
    }
}

/// Per-entity reconciliation of a server-confirmed record into local state.
pub trait Reconcile {
    /// Take every server field, keeping local values only where the server
    /// legitimately omits them.
    fn merge_from_server(&mut self, server: &Self);
}

impl Reconcile for UserRecord {
    fn merge_from_server(&mut self, server: &Self) {
        let UserRecord {
            id,
            name,
            email,
            status,
            created_at,
        } = server;
        self.id.clone_from(id);
        self.name.clone_from(name);
        self.email.clone_from(email);
        self.status = *status;
        if created_at.is_some() {
            self.created_at = *created_at;
        }
    }
}

impl Reconcile for AstrologerRecord {
    fn merge_from_server(&mut self, server: &Self) {
        let AstrologerRecord {
            id,
            name,
            email,
            phone,
            status,
            specialties,
            experience_years,
            created_at,
        } = server;
        self.id.clone_from(id);
        self.name.clone_from(name);
        self.email.clone_from(email);
        self.phone.clone_from(phone);
        self.status = *status;
        self.specialties.clone_from(specialties);
        self.experience_years = *experience_years;
        if created_at.is_some() {
            self.created_at = *created_at;
        }
    }
}

impl Reconcile for SellerRecord {
    fn merge_from_server(&mut self, server: &Self) {
        let SellerRecord {
            id,
            business_name,
            owner_name,
            email,
            status,
            product_count,
            created_at,
        } = server;
        self.id.clone_from(id);
        self.business_name.clone_from(business_name);
        self.owner_name.clone_from(owner_name);
        self.email.clone_from(email);
        self.status = *status;
        self.product_count = *product_count;
        if created_at.is_some() {
            self.created_at = *created_at;
        }
    }
}

impl Reconcile for CourseRecord {
    fn merge_from_server(&mut self, server: &Self) {
        let CourseRecord {
            id,
            title,
            instructor,
            price_cents,
            status,
            created_at,
        } = server;
        self.id.clone_from(id);
        self.title.clone_from(title);
        self.instructor.clone_from(instructor);
        self.price_cents = *price_cents;
        self.status = *status;
        if created_at.is_some() {
            self.created_at = *created_at;
        }
    }
}

impl Reconcile for BlogRecord {
    fn merge_from_server(&mut self, server: &Self) {
        let BlogRecord {
            id,
            title,
            author,
            status,
            created_at,
        } = server;
        self.id.clone_from(id);
        self.title.clone_from(title);
        self.author.clone_from(author);
        self.status = *status;
        if created_at.is_some() {
            self.created_at = *created_at;
        }
    }
}

impl Reconcile for NoticeRecord {
    fn merge_from_server(&mut self, server: &Self) {
        let NoticeRecord {
            id,
            title,
            body,
            audience,
            status,
            created_at,
        } = server;
        self.id.clone_from(id);
        self.title.clone_from(title);
        self.body.clone_from(body);
        self.audience = *audience;
        self.status = *status;
        if created_at.is_some() {
            self.created_at = *created_at;
        }
    }
}

/// One entity record, tagged by resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Record {
    User(UserRecord),
    Astrologer(AstrologerRecord),
    Seller(SellerRecord),
    Course(CourseRecord),
    Blog(BlogRecord),
    Notice(NoticeRecord),
}

impl Record {
    pub fn decode(resource: Resource, value: Value) -> Result<Self, TransportError> {
        let record = match resource {
            Resource::Users => Record::User(decode_json(resource, value)?),
            Resource::Astrologers => Record::Astrologer(decode_json(resource, value)?),
            Resource::Sellers => Record::Seller(decode_json(resource, value)?),
            Resource::Courses => Record::Course(decode_json(resource, value)?),
            Resource::Blogs => Record::Blog(decode_json(resource, value)?),
            Resource::Notices => Record::Notice(decode_json(resource, value)?),
        };
        Ok(record)
    }

    pub fn id(&self) -> &str {
        match self {
            Record::User(record) => &record.id,
            Record::Astrologer(record) => &record.id,
            Record::Seller(record) => &record.id,
            Record::Course(record) => &record.id,
            Record::Blog(record) => &record.id,
            Record::Notice(record) => &record.id,
        }
    }

    pub fn resource(&self) -> Resource {
        match self {
            Record::User(_) => Resource::Users,
            Record::Astrologer(_) => Resource::Astrologers,
            Record::Seller(_) => Resource::Sellers,
            Record::Course(_) => Resource::Courses,
            Record::Blog(_) => Resource::Blogs,
            Record::Notice(_) => Resource::Notices,
        }
    }

    pub fn status(&self) -> StatusChange {
        match self {
            Record::User(record) => StatusChange::Account(record.status),
            Record::Astrologer(record) => StatusChange::Account(record.status),
            Record::Seller(record) => StatusChange::Account(record.status),
            Record::Course(record) => StatusChange::Publication(record.status),
            Record::Blog(record) => StatusChange::Publication(record.status),
            Record::Notice(record) => StatusChange::Publication(record.status),
        }
    }

    /// Apply a status change; returns false when it does not fit the entity.
    pub fn apply_status(&mut self, change: StatusChange) -> bool {
        match (self, change) {
            (Record::User(record), StatusChange::Account(status)) => record.status = status,
            (Record::Astrologer(record), StatusChange::Account(status)) => record.status = status,
            (Record::Seller(record), StatusChange::Account(status)) => record.status = status,
            (Record::Course(record), StatusChange::Publication(status)) => record.status = status,
            (Record::Blog(record), StatusChange::Publication(status)) => record.status = status,
            (Record::Notice(record), StatusChange::Publication(status)) => record.status = status,
            _ => return false,
        }
        true
    }

    /// Merge a server record of the same entity type; returns false on a
    /// type mismatch.
    pub fn merge_from_server(&mut self, server: &Record) -> bool {
        match (self, server) {
            (Record::User(local), Record::User(server)) => local.merge_from_server(server),
            (Record::Astrologer(local), Record::Astrologer(server)) => {
                local.merge_from_server(server)
            }
            (Record::Seller(local), Record::Seller(server)) => local.merge_from_server(server),
            (Record::Course(local), Record::Course(server)) => local.merge_from_server(server),
            (Record::Blog(local), Record::Blog(server)) => local.merge_from_server(server),
            (Record::Notice(local), Record::Notice(server)) => local.merge_from_server(server),
            _ => return false,
        }
        true
    }
}

/// A page of records from a list endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordList {
    pub resource: Resource,
    pub items: Vec<Record>,
    pub total: u64,
    pub page: u32,
}

impl RecordList {
    pub fn get(&self, id: &str) -> Option<&Record> {
        self.items.iter().find(|record| record.id() == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Record> {
        self.items.iter_mut().find(|record| record.id() == id)
    }

    fn remove(&mut self, id: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|record| record.id() != id);
        let removed = before - self.items.len();
        self.total = self.total.saturating_sub(removed as u64);
        removed > 0
    }
}

/// Value stored in a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum CacheData {
    Record(Record),
    List(RecordList),
}

impl CacheData {
    /// Decode a transport payload for the given descriptor.
    pub fn decode(descriptor: &Descriptor, value: Value) -> Result<Self, TransportError> {
        let resource = descriptor.resource;
        match &descriptor.view {
            View::Detail(_) => Ok(CacheData::Record(Record::decode(resource, value)?)),
            View::List(_) => {
                let list = match resource {
                    Resource::Users => decode_list(resource, value, Record::User)?,
                    Resource::Astrologers => decode_list(resource, value, Record::Astrologer)?,
                    Resource::Sellers => decode_list(resource, value, Record::Seller)?,
                    Resource::Courses => decode_list(resource, value, Record::Course)?,
                    Resource::Blogs => decode_list(resource, value, Record::Blog)?,
                    Resource::Notices => decode_list(resource, value, Record::Notice)?,
                };
                Ok(CacheData::List(list))
            }
        }
    }

    /// The record with `id`, whether this is its detail entry or a list holding it.
    pub fn record(&self, id: &str) -> Option<&Record> {
        match self {
            CacheData::Record(record) => (record.id() == id).then_some(record),
            CacheData::List(list) => list.get(id),
        }
    }

    /// Copy of this data with `f` applied to the record `id`, or `None` when
    /// the record is not present.
    pub fn map_record(&self, id: &str, f: impl FnOnce(&mut Record)) -> Option<CacheData> {
        let mut next = self.clone();
        let target = match &mut next {
            CacheData::Record(record) => (record.id() == id).then_some(record),
            CacheData::List(list) => list.get_mut(id),
        }?;
        f(target);
        Some(next)
    }

    /// Copy of a list without the record `id`; `None` when nothing changes.
    pub fn without_record(&self, id: &str) -> Option<CacheData> {
        match self {
            CacheData::List(list) => {
                let mut next = list.clone();
                next.remove(id).then_some(CacheData::List(next))
            }
            CacheData::Record(_) => None,
        }
    }

    /// Fold a confirmed mutation result into this data.
    ///
    /// Returns `None` when the data is unaffected.
    pub fn reconcile(&self, operation: &Operation, server: Option<&Record>) -> Option<CacheData> {
        match operation {
            Operation::Create => None,
            Operation::Delete { id } => self.without_record(id),
            Operation::Update { id } | Operation::Action { id, .. } => {
                let server = server?;
                let target = if server.id().is_empty() {
                    id.as_str()
                } else {
                    server.id()
                };
                let mut merged = true;
                let next = self.map_record(target, |record| {
                    merged = record.merge_from_server(server);
                })?;
                merged.then_some(next)
            }
        }
    }
}

fn decode_json<T: DeserializeOwned>(resource: Resource, value: Value) -> Result<T, TransportError> {
    serde_json::from_value(value).map_err(|err| {
        TransportError::server(format!("malformed {resource} payload: {err}"))
    })
}

fn decode_list<T: DeserializeOwned>(
    resource: Resource,
    value: Value,
    wrap: fn(T) -> Record,
) -> Result<RecordList, TransportError> {
    let page: ListPage<T> = decode_json(resource, value)?;
    Ok(RecordList {
        resource,
        items: page.items.into_iter().map(wrap).collect(),
        total: page.total,
        page: page.page,
    })
}
