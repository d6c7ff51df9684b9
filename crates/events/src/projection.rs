use serde_json::Value as JsonValue;
use thiserror::Error;

use eventlog_core::{EventId, OrgId};

use crate::{EventEnvelope, HandlerRegistry};

/// Failure while folding an event into derived state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProjectionError {
    /// No handler for this `(event_type, event_version)` and not declared ignored.
    #[error("no handler registered for {event_type} v{event_version}")]
    UnknownEvent { event_type: String, event_version: u32 },

    /// A handler was registered twice for the same key.
    #[error("duplicate handler for {event_type} v{event_version}")]
    DuplicateHandler { event_type: String, event_version: u32 },

    /// The payload does not decode into the registered schema.
    #[error("invalid payload for {event_type} v{event_version}: {reason}")]
    Payload {
        event_type: String,
        event_version: u32,
        reason: String,
    },

    /// An org-pinned runner received another org's event.
    #[error("org mismatch (expected {expected}, found {found:?})")]
    OrgMismatch { expected: OrgId, found: Option<OrgId> },

    /// The handler refused the event (projection-specific reason).
    #[error("event {event_id} rejected: {reason}")]
    Rejected { event_id: EventId, reason: String },
}

impl ProjectionError {
    pub fn rejected(event_id: EventId, reason: impl Into<String>) -> Self {
        Self::Rejected {
            event_id,
            reason: reason.into(),
        }
    }
}

/// A projection builds derived state from the global event order.
///
/// Delivery is at-least-once: after a crash between applying a batch and
/// checkpointing it, the same events arrive again. Implementations must make a
/// redelivered event a no-op, typically by keeping their own applied
/// watermark next to the state they derive (see [`RegistryProjection`]).
///
/// Derived state is disposable. `reset` must bring the projection back to its
/// empty state so it can be rebuilt from event 0.
pub trait Projection {
    /// Fold one event into the projection.
    fn apply(&mut self, envelope: &EventEnvelope<JsonValue>) -> Result<(), ProjectionError>;

    /// Highest `event_id` whose effects are reflected in the state.
    fn watermark(&self) -> EventId;

    /// Drop all derived state.
    fn reset(&mut self);
}

/// Projection whose state is a value folded through a [`HandlerRegistry`].
///
/// The watermark travels with the state, so state and "what has been applied"
/// can never disagree: an event at or below the watermark is skipped.
#[derive(Debug)]
pub struct RegistryProjection<S> {
    registry: HandlerRegistry<S>,
    initial: S,
    state: S,
    watermark: EventId,
}

impl<S> RegistryProjection<S>
where
    S: Clone + 'static,
{
    pub fn new(registry: HandlerRegistry<S>, initial: S) -> Self {
        Self {
            registry,
            state: initial.clone(),
            initial,
            watermark: EventId::ZERO,
        }
    }

    /// Resume from previously persisted state and watermark.
    pub fn resume(registry: HandlerRegistry<S>, initial: S, state: S, watermark: EventId) -> Self {
        Self {
            registry,
            initial,
            state,
            watermark,
        }
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn into_state(self) -> S {
        self.state
    }
}

impl<S> Projection for RegistryProjection<S>
where
    S: Clone + 'static,
{
    fn apply(&mut self, envelope: &EventEnvelope<JsonValue>) -> Result<(), ProjectionError> {
        if envelope.event_id() <= self.watermark {
            tracing::trace!(
                event_id = %envelope.event_id(),
                watermark = %self.watermark,
                "skipping redelivered event"
            );
            return Ok(());
        }
        // On error the previous state is kept untouched.
        let next = self.registry.apply(self.state.clone(), envelope)?;
        self.state = next;
        self.watermark = envelope.event_id();
        Ok(())
    }

    fn watermark(&self) -> EventId {
        self.watermark
    }

    fn reset(&mut self) {
        self.state = self.initial.clone();
        self.watermark = EventId::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use eventlog_core::{AggregateRef, AggregateType};

    use super::*;

    fn counter() -> RegistryProjection<u64> {
        let mut registry = HandlerRegistry::new();
        registry
            .register_raw("org.created", 1, |count, _| Ok(count + 1))
            .unwrap();
        RegistryProjection::new(registry, 0)
    }

    fn created(id: u64) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            EventId::new(id),
            None,
            AggregateRef::new(AggregateType::new("org").unwrap(), format!("o{id}")).unwrap(),
            1,
            "org.created",
            1,
            Utc::now(),
            json!({}),
        )
    }

    #[test]
    fn redelivered_events_are_no_ops() {
        let mut p = counter();
        for id in [1, 2, 3, 2, 3, 1, 4] {
            p.apply(&created(id)).unwrap();
        }
        assert_eq!(*p.state(), 4);
        assert_eq!(p.watermark(), EventId::new(4));
    }

    #[test]
    fn failed_apply_keeps_previous_state() {
        let mut p = counter();
        p.apply(&created(1)).unwrap();
        let mut unknown = created(2);
        unknown = EventEnvelope::new(
            unknown.event_id(),
            None,
            unknown.aggregate().clone(),
            1,
            "org.deleted",
            1,
            unknown.occurred_at(),
            json!({}),
        );
        assert!(p.apply(&unknown).is_err());
        assert_eq!(*p.state(), 1);
        assert_eq!(p.watermark(), EventId::new(1));
    }

    #[test]
    fn reset_returns_to_initial_state() {
        let mut p = counter();
        p.apply(&created(1)).unwrap();
        p.reset();
        assert_eq!(*p.state(), 0);
        assert_eq!(p.watermark(), EventId::ZERO);
        p.apply(&created(1)).unwrap();
        assert_eq!(*p.state(), 1);
    }
}
