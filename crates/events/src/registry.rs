//! Closed dispatch table from `(event_type, event_version)` to pure handlers.

use std::collections::{HashMap, HashSet};

use serde_json::Value as JsonValue;

use crate::{EventEnvelope, EventPayload, ProjectionError};

type HandlerFn<S> =
    Box<dyn Fn(S, &EventEnvelope<JsonValue>) -> Result<S, ProjectionError> + Send + Sync>;

/// Registry of pure state transition functions, keyed by type and version.
///
/// Dispatch is explicit: every `(event_type, event_version)` a projection can
/// meet must either have a handler or be listed with [`HandlerRegistry::ignore`].
/// Anything else is [`ProjectionError::UnknownEvent`], including a new version
/// of a type whose older version is registered. A projection that silently
/// skipped an event it did not understand would diverge from the log without
/// anyone noticing.
pub struct HandlerRegistry<S> {
    handlers: HashMap<(String, u32), HandlerFn<S>>,
    ignored: HashSet<String>,
}

impl<S> HandlerRegistry<S>
where
    S: 'static,
{
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            ignored: HashSet::new(),
        }
    }

    /// Register a handler for a typed payload.
    ///
    /// The JSON payload is decoded into `P` before the handler runs; a decode
    /// failure is [`ProjectionError::Payload`].
    pub fn register<P, F>(&mut self, handler: F) -> Result<&mut Self, ProjectionError>
    where
        P: EventPayload,
        F: Fn(S, &EventEnvelope<P>) -> Result<S, ProjectionError> + Send + Sync + 'static,
    {
        self.register_raw(P::EVENT_TYPE, P::EVENT_VERSION, move |state, envelope| {
            let typed: P = serde_json::from_value(envelope.payload().clone()).map_err(|e| {
                ProjectionError::Payload {
                    event_type: envelope.event_type().to_string(),
                    event_version: envelope.event_version(),
                    reason: e.to_string(),
                }
            })?;
            handler(state, &envelope.with_payload(typed))
        })
    }

    /// Register a handler that works on the raw JSON payload.
    pub fn register_raw<F>(
        &mut self,
        event_type: &str,
        event_version: u32,
        handler: F,
    ) -> Result<&mut Self, ProjectionError>
    where
        F: Fn(S, &EventEnvelope<JsonValue>) -> Result<S, ProjectionError> + Send + Sync + 'static,
    {
        let key = (event_type.to_string(), event_version);
        if self.handlers.contains_key(&key) || self.ignored.contains(event_type) {
            return Err(ProjectionError::DuplicateHandler {
                event_type: event_type.to_string(),
                event_version,
            });
        }
        self.handlers.insert(key, Box::new(handler));
        Ok(self)
    }

    /// Declare that every version of `event_type` is irrelevant to this projection.
    pub fn ignore(&mut self, event_type: &str) -> Result<&mut Self, ProjectionError> {
        if self.handlers.keys().any(|(t, _)| t == event_type) {
            return Err(ProjectionError::DuplicateHandler {
                event_type: event_type.to_string(),
                event_version: 0,
            });
        }
        self.ignored.insert(event_type.to_string());
        Ok(self)
    }

    pub fn handles(&self, event_type: &str, event_version: u32) -> bool {
        self.handlers
            .contains_key(&(event_type.to_string(), event_version))
    }

    pub fn ignores(&self, event_type: &str) -> bool {
        self.ignored.contains(event_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Apply one event: `(state, event) -> state`.
    pub fn apply(&self, state: S, envelope: &EventEnvelope<JsonValue>) -> Result<S, ProjectionError> {
        if self.ignored.contains(envelope.event_type()) {
            return Ok(state);
        }
        let key = (envelope.event_type().to_string(), envelope.event_version());
        match self.handlers.get(&key) {
            Some(handler) => handler(state, envelope),
            None => Err(ProjectionError::UnknownEvent {
                event_type: key.0,
                event_version: key.1,
            }),
        }
    }
}

impl<S> Default for HandlerRegistry<S>
where
    S: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S> core::fmt::Debug for HandlerRegistry<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut keys: Vec<_> = self.handlers.keys().collect();
        keys.sort();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &keys)
            .field("ignored", &self.ignored)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use eventlog_core::{AggregateRef, AggregateType, EventId};

    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct OrgCreated {
        name: String,
    }

    impl EventPayload for OrgCreated {
        const EVENT_TYPE: &'static str = "org.created";
        const EVENT_VERSION: u32 = 1;
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct OrgRenamedV2 {
        display_name: String,
    }

    impl EventPayload for OrgRenamedV2 {
        const EVENT_TYPE: &'static str = "org.renamed";
        const EVENT_VERSION: u32 = 2;
    }

    fn envelope(event_type: &str, version: u32, payload: JsonValue) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            EventId::new(1),
            None,
            AggregateRef::new(AggregateType::new("org").unwrap(), "o1").unwrap(),
            1,
            event_type,
            version,
            Utc::now(),
            payload,
        )
    }

    fn names_registry() -> HandlerRegistry<Vec<String>> {
        let mut registry = HandlerRegistry::<Vec<String>>::new();
        registry
            .register::<OrgCreated, _>(|mut names, e| {
                names.push(e.payload().name.clone());
                Ok(names)
            })
            .unwrap()
            .register::<OrgRenamedV2, _>(|mut names, e| {
                names.push(e.payload().display_name.clone());
                Ok(names)
            })
            .unwrap();
        registry
    }

    #[test]
    fn dispatches_on_type_and_version() {
        let registry = names_registry();
        let state = registry
            .apply(vec![], &envelope("org.created", 1, json!({"name": "acme"})))
            .unwrap();
        let state = registry
            .apply(state, &envelope("org.renamed", 2, json!({"display_name": "Acme"})))
            .unwrap();
        assert_eq!(state, vec!["acme".to_string(), "Acme".to_string()]);
    }

    #[test]
    fn unknown_version_of_known_type_is_a_hard_error() {
        let registry = names_registry();
        let err = registry
            .apply(vec![], &envelope("org.renamed", 1, json!({"name": "x"})))
            .unwrap_err();
        assert_eq!(
            err,
            ProjectionError::UnknownEvent {
                event_type: "org.renamed".into(),
                event_version: 1
            }
        );
    }

    #[test]
    fn unknown_type_is_a_hard_error_unless_ignored() {
        let mut registry = names_registry();
        let node = envelope("node.enrolled", 1, json!({}));
        assert!(matches!(
            registry.apply(vec![], &node),
            Err(ProjectionError::UnknownEvent { .. })
        ));

        registry.ignore("node.enrolled").unwrap();
        assert_eq!(registry.apply(vec!["kept".into()], &node).unwrap(), vec!["kept".to_string()]);
    }

    #[test]
    fn malformed_payload_is_reported() {
        let registry = names_registry();
        let err = registry
            .apply(vec![], &envelope("org.created", 1, json!({"nom": 1})))
            .unwrap_err();
        assert!(matches!(err, ProjectionError::Payload { .. }));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = names_registry();
        assert!(registry.register_raw("org.created", 1, |s, _| Ok(s)).is_err());
        assert!(registry.ignore("org.created").is_err());
        assert!(registry.register_raw("org.created", 2, |s, _| Ok(s)).is_ok());
        assert_eq!(registry.len(), 3);
    }
}
