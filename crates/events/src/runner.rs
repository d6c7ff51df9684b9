//! Projection runner utilities (read model builders).
//!
//! Read models are **disposable**; events are the source of truth.
//! This module provides deterministic replay and cursor tracking over the
//! global event order without making storage assumptions.

use serde_json::Value as JsonValue;

use eventlog_core::{EventId, OrgId};

use crate::{EventEnvelope, Projection, ProjectionError};

/// Tracks how far a runner has progressed through the global order.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProjectionCursor {
    org_id: Option<OrgId>,
    last_event_id: EventId,
}

impl ProjectionCursor {
    pub fn org_id(&self) -> Option<OrgId> {
        self.org_id
    }

    pub fn last_event_id(&self) -> EventId {
        self.last_event_id
    }
}

/// What happened to one delivered envelope.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Applied {
    /// The projection folded the event in.
    Applied,
    /// At or below the cursor: a redelivery, skipped.
    Duplicate,
}

/// Runs envelopes through a projection and tracks progress.
#[derive(Debug)]
pub struct ProjectionRunner<P>
where
    P: Projection,
{
    projection: P,
    cursor: ProjectionCursor,
}

impl<P> ProjectionRunner<P>
where
    P: Projection,
{
    pub fn new(projection: P) -> Self {
        let last_event_id = projection.watermark();
        Self {
            projection,
            cursor: ProjectionCursor {
                org_id: None,
                last_event_id,
            },
        }
    }

    /// Create a runner pinned to a single org.
    ///
    /// This prevents an org-scoped projection from ever folding in another
    /// org's events (or org-less infrastructure events).
    pub fn new_for_org(org_id: OrgId, projection: P) -> Self {
        let mut runner = Self::new(projection);
        runner.cursor.org_id = Some(org_id);
        runner
    }

    pub fn projection(&self) -> &P {
        &self.projection
    }

    pub fn projection_mut(&mut self) -> &mut P {
        &mut self.projection
    }

    pub fn into_projection(self) -> P {
        self.projection
    }

    pub fn cursor(&self) -> ProjectionCursor {
        self.cursor
    }

    /// Apply a single envelope, enforcing org pinning and skipping redeliveries.
    pub fn apply(&mut self, envelope: &EventEnvelope<JsonValue>) -> Result<Applied, ProjectionError> {
        if let Some(expected) = self.cursor.org_id {
            if envelope.org_id() != Some(expected) {
                return Err(ProjectionError::OrgMismatch {
                    expected,
                    found: envelope.org_id(),
                });
            }
        }

        if envelope.event_id() <= self.cursor.last_event_id {
            return Ok(Applied::Duplicate);
        }

        self.projection.apply(envelope)?;
        self.cursor.last_event_id = envelope.event_id();
        Ok(Applied::Applied)
    }

    /// Apply many envelopes in order, stopping at the first failure.
    pub fn run<'a>(
        &mut self,
        envelopes: impl IntoIterator<Item = &'a EventEnvelope<JsonValue>>,
    ) -> Result<usize, ProjectionError> {
        let mut applied = 0;
        for env in envelopes {
            if self.apply(env)? == Applied::Applied {
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Drop derived state and rewind the cursor to the start of the log.
    pub fn reset(&mut self) {
        self.projection.reset();
        self.cursor.last_event_id = EventId::ZERO;
    }

    /// Rebuild a projection from scratch by replaying the full event history.
    ///
    /// The factory is used to create a fresh projection instance.
    pub fn rebuild_from_scratch<'a>(
        factory: impl FnOnce() -> P,
        envelopes: impl IntoIterator<Item = &'a EventEnvelope<JsonValue>>,
    ) -> Result<(P, ProjectionCursor), ProjectionError> {
        let mut runner = ProjectionRunner::new(factory());
        runner.reset();
        runner.run(envelopes)?;
        Ok((runner.projection, runner.cursor))
    }
}
