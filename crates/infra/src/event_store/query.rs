//! Read API: cursor-paginated, filtered access to the global order.
//!
//! Reads are authorized by a [`ReadScope`]. Org callers only ever see their
//! own org's events; internal consumers see everything except
//! infrastructure-only aggregates; elevated callers see the whole log.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use eventlog_core::{AggregateType, EventId, OrgId};

use super::r#trait::{EventStoreError, StoredEvent};

pub const DEFAULT_READ_LIMIT: usize = 100;
pub const MAX_READ_LIMIT: usize = 1000;

/// Clamp a requested page size to `[1, MAX_READ_LIMIT]`.
pub fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_READ_LIMIT).clamp(1, MAX_READ_LIMIT)
}

/// Optional equality filters; `None` matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadFilter {
    pub org_id: Option<OrgId>,
    pub aggregate_type: Option<AggregateType>,
    pub aggregate_id: Option<String>,
    pub event_type: Option<String>,
}

impl ReadFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn org(mut self, org_id: OrgId) -> Self {
        self.org_id = Some(org_id);
        self
    }

    pub fn aggregate_type(mut self, aggregate_type: AggregateType) -> Self {
        self.aggregate_type = Some(aggregate_type);
        self
    }

    pub fn aggregate_id(mut self, aggregate_id: impl Into<String>) -> Self {
        self.aggregate_id = Some(aggregate_id.into());
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn matches(&self, event: &StoredEvent) -> bool {
        self.org_id.is_none_or(|org| event.metadata.org_id == Some(org))
            && self
                .aggregate_type
                .as_ref()
                .is_none_or(|t| &event.aggregate.aggregate_type == t)
            && self
                .aggregate_id
                .as_deref()
                .is_none_or(|id| event.aggregate.aggregate_id == id)
            && self.event_type.as_deref().is_none_or(|t| event.event_type == t)
    }
}

/// Who is reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "org_id")]
pub enum ReadScope {
    /// A tenant: only events of this org, infrastructure-only aggregates excluded.
    Org(OrgId),
    /// Control-plane consumers: everything but infrastructure-only aggregates.
    Internal,
    /// Operators and infrastructure agents: the whole log.
    Elevated,
}

/// Which aggregate types are infrastructure-only (visible to `Elevated` only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPolicy {
    infrastructure_aggregate_types: BTreeSet<AggregateType>,
}

impl ReadPolicy {
    pub fn new(infrastructure_aggregate_types: impl IntoIterator<Item = AggregateType>) -> Self {
        Self {
            infrastructure_aggregate_types: infrastructure_aggregate_types.into_iter().collect(),
        }
    }

    pub fn is_infrastructure(&self, aggregate_type: &AggregateType) -> bool {
        self.infrastructure_aggregate_types.contains(aggregate_type)
    }

    pub fn infrastructure_aggregate_types(&self) -> impl Iterator<Item = &AggregateType> {
        self.infrastructure_aggregate_types.iter()
    }
}

impl Default for ReadPolicy {
    fn default() -> Self {
        let node = AggregateType::new("node").map(|t| vec![t]).unwrap_or_default();
        Self::new(node)
    }
}

/// One page of the global order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPage {
    pub events: Vec<StoredEvent>,
    /// Where to resume: the last returned id when the page is full, else the
    /// log head observed by the same read.
    pub next_after_event_id: EventId,
    pub has_more: bool,
}

impl EventPage {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// A read after authorization: the effective filter every backend executes.
#[derive(Debug, Clone)]
pub(crate) struct ReadPlan {
    pub after: EventId,
    pub limit: usize,
    pub filter: ReadFilter,
    pub excluded_types: Vec<AggregateType>,
}

impl ReadPlan {
    pub fn authorize(
        after: EventId,
        limit: Option<usize>,
        filter: &ReadFilter,
        scope: &ReadScope,
        policy: &ReadPolicy,
    ) -> Result<Self, EventStoreError> {
        let mut effective = filter.clone();
        let mut excluded_types = Vec::new();

        match scope {
            ReadScope::Org(org) => {
                if let Some(requested) = filter.org_id {
                    if requested != *org {
                        return Err(EventStoreError::Forbidden(format!(
                            "org {org} may not read events of org {requested}"
                        )));
                    }
                }
                Self::deny_infrastructure(filter, policy)?;
                effective.org_id = Some(*org);
                excluded_types.extend(policy.infrastructure_aggregate_types().cloned());
            }
            ReadScope::Internal => {
                Self::deny_infrastructure(filter, policy)?;
                excluded_types.extend(policy.infrastructure_aggregate_types().cloned());
            }
            ReadScope::Elevated => {}
        }

        Ok(Self {
            after,
            limit: clamp_limit(limit),
            filter: effective,
            excluded_types,
        })
    }

    fn deny_infrastructure(filter: &ReadFilter, policy: &ReadPolicy) -> Result<(), EventStoreError> {
        match &filter.aggregate_type {
            Some(t) if policy.is_infrastructure(t) => Err(EventStoreError::Forbidden(format!(
                "aggregate type '{t}' requires an elevated read scope"
            ))),
            _ => Ok(()),
        }
    }

    pub fn matches(&self, event: &StoredEvent) -> bool {
        event.event_id > self.after
            && !self.excluded_types.contains(&event.aggregate.aggregate_type)
            && self.filter.matches(event)
    }

    /// Build the page from up to `limit + 1` matching events and the head
    /// observed in the same snapshot.
    pub fn into_page(self, mut events: Vec<StoredEvent>, head: EventId) -> EventPage {
        let has_more = events.len() > self.limit;
        events.truncate(self.limit);
        let next_after_event_id = if has_more {
            events.last().map(|e| e.event_id).unwrap_or(self.after)
        } else {
            head.max(self.after)
        };
        EventPage {
            events,
            next_after_event_id,
            has_more,
        }
    }
}
