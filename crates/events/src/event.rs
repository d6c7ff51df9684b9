use serde::Serialize;
use serde::de::DeserializeOwned;

/// A typed, schema-versioned event payload.
///
/// Each payload struct names its stable `(event_type, event_version)` pair.
/// A breaking change to the shape gets a new struct with a bumped version;
/// both versions stay registered with projections for as long as old events
/// exist in the log.
///
/// Payloads are facts about validated state transitions. They must never
/// carry secret material or raw credentials; the store rejects payload keys
/// that look like secrets.
pub trait EventPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable event type name (e.g. `"org.created"`).
    const EVENT_TYPE: &'static str;

    /// Schema version of this payload shape, starting at 1.
    const EVENT_VERSION: u32;
}
