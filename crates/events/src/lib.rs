//! Event envelopes, typed payloads and projection building blocks.
//!
//! Everything here is pure: no IO, no async, no storage assumptions. The
//! infrastructure crate feeds committed events into these types.

pub mod envelope;
pub mod event;
pub mod projection;
pub mod registry;
pub mod runner;

pub use envelope::EventEnvelope;
pub use event::EventPayload;
pub use projection::{Projection, ProjectionError, RegistryProjection};
pub use registry::HandlerRegistry;
pub use runner::{Applied, ProjectionCursor, ProjectionRunner};
