//! `eventlog-core`: identifiers and invariants shared by every event log component.
//!
//! This crate contains **pure** primitives (no IO, no storage assumptions).

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{AggregateRef, ExpectedSeq};
pub use error::{DomainError, DomainResult};
pub use id::{ActorType, AggregateType, EventId, OrgId, RequestId};
