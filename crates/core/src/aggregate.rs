//! Aggregate identity and the optimistic concurrency token.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::AggregateType;

/// Identity of an event stream: `(aggregate_type, aggregate_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregateRef {
    pub aggregate_type: AggregateType,
    pub aggregate_id: String,
}

impl AggregateRef {
    pub fn new(aggregate_type: AggregateType, aggregate_id: impl Into<String>) -> DomainResult<Self> {
        let aggregate_id = aggregate_id.into();
        if aggregate_id.trim().is_empty() {
            return Err(DomainError::validation("aggregate_id must not be empty"));
        }
        if aggregate_id.len() > 255 {
            return Err(DomainError::validation("aggregate_id must be at most 255 bytes"));
        }
        Ok(Self {
            aggregate_type,
            aggregate_id,
        })
    }
}

impl core::fmt::Display for AggregateRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.aggregate_type, self.aggregate_id)
    }
}

/// The caller's belief of an aggregate's highest `aggregate_seq`.
///
/// There is deliberately no "any version" escape hatch: every append names the
/// head it was decided against, and `0` means "the aggregate does not exist yet".
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExpectedSeq(u64);

impl ExpectedSeq {
    /// Expect a brand-new aggregate (no events yet).
    pub const NEW: ExpectedSeq = ExpectedSeq(0);

    pub const fn exact(seq: u64) -> Self {
        Self(seq)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    /// First `aggregate_seq` that an append against this expectation assigns.
    pub const fn first_assigned(self) -> u64 {
        self.0 + 1
    }

    pub fn matches(self, actual: u64) -> bool {
        self.0 == actual
    }
}

impl From<u64> for ExpectedSeq {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
