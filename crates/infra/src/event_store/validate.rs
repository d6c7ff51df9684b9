//! Checks run on every batch before anything is written.

use serde_json::Value as JsonValue;

use eventlog_core::id::validate_type_name;

use super::r#trait::{EventStoreError, NewEvent};

/// Payload keys that must never reach the log (matched exactly or as a `_suffix`).
const SECRET_KEYS: &[&str] = &[
    "password",
    "secret",
    "token",
    "private_key",
    "credential",
    "credentials",
    "api_key",
];

const MAX_KEY_LEN: usize = 255;

pub(crate) fn validate_batch(events: &[NewEvent]) -> Result<(), EventStoreError> {
    if events.is_empty() {
        return Err(EventStoreError::Validation("append requires at least one event".to_string()));
    }
    for (idx, event) in events.iter().enumerate() {
        validate_event(event).map_err(|e| match e {
            EventStoreError::Validation(msg) => EventStoreError::Validation(format!("event {idx}: {msg}")),
            other => other,
        })?;
    }
    Ok(())
}

fn validate_event(event: &NewEvent) -> Result<(), EventStoreError> {
    validate_type_name("event_type", &event.event_type)?;
    if event.event_version == 0 {
        return Err(EventStoreError::Validation("event_version must be at least 1".to_string()));
    }

    let meta = &event.metadata;
    if meta.actor_id.trim().is_empty() {
        return Err(EventStoreError::Validation("actor_id must not be empty".to_string()));
    }
    if meta.request_id.as_uuid().is_nil() {
        return Err(EventStoreError::Validation("request_id must not be nil".to_string()));
    }
    if let Some(key) = &meta.idempotency_key {
        if key.trim().is_empty() || key.len() > MAX_KEY_LEN {
            return Err(EventStoreError::Validation(format!(
                "idempotency_key must be 1..={MAX_KEY_LEN} bytes"
            )));
        }
    }

    if !event.payload.is_object() {
        return Err(EventStoreError::Validation("payload must be a JSON object".to_string()));
    }
    if let Some(path) = find_secret_key(&event.payload, "") {
        return Err(EventStoreError::Validation(format!(
            "payload key '{path}' looks like secret material"
        )));
    }
    Ok(())
}

fn looks_secret(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SECRET_KEYS.iter().any(|s| {
        key == *s
            || key
                .strip_suffix(s)
                .is_some_and(|prefix| prefix.ends_with('_') || prefix.ends_with('-'))
    })
}

fn find_secret_key(value: &JsonValue, path: &str) -> Option<String> {
    match value {
        JsonValue::Object(map) => map.iter().find_map(|(key, child)| {
            let child_path = if path.is_empty() {
                key.clone()
            } else {
                format!("{path}.{key}")
            };
            if looks_secret(key) {
                Some(child_path)
            } else {
                find_secret_key(child, &child_path)
            }
        }),
        JsonValue::Array(items) => items
            .iter()
            .enumerate()
            .find_map(|(i, item)| find_secret_key(item, &format!("{path}[{i}]"))),
        _ => None,
    }
}
