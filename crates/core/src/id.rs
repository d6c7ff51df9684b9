//! Strongly-typed identifiers used across the event log.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of an organization (tenant boundary).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrgId(Uuid);

/// Identifier of the request that produced an event (tracing/audit).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
            /// for determinism.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_uuid_newtype!(OrgId, "OrgId");
impl_uuid_newtype!(RequestId, "RequestId");

/// Position of an event in the global order.
///
/// Assigned by the storage engine at commit time. `EventId::ZERO` is never
/// assigned to an event; it is the cursor position "before the first event".
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(u64);

impl EventId {
    pub const ZERO: EventId = EventId(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Signed representation used by SQL backends (`BIGINT`).
    pub fn as_i64(self) -> i64 {
        i64::try_from(self.0).unwrap_or(i64::MAX)
    }

    /// Convert from a SQL `BIGINT`; negative values clamp to zero.
    pub fn from_i64(value: i64) -> Self {
        Self(u64::try_from(value).unwrap_or(0))
    }
}

impl core::fmt::Display for EventId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<u64> for EventId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Kind of entity that owns an event stream (e.g. `org`, `app`, `node`).
///
/// The catalog of aggregate types lives with the command handlers; this type
/// only enforces the naming rules: non-empty, lowercase ASCII letters, digits,
/// `_` and `.`, at most 64 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AggregateType(String);

impl AggregateType {
    pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        validate_type_name("aggregate_type", &value)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for AggregateType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AggregateType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for AggregateType {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AggregateType> for String {
    fn from(value: AggregateType) -> Self {
        value.0
    }
}

/// Validate a dotted type name (`org`, `org.created`, `volume_attachment`).
pub fn validate_type_name(field: &str, value: &str) -> Result<(), DomainError> {
    if value.is_empty() {
        return Err(DomainError::validation(format!("{field} must not be empty")));
    }
    if value.len() > 64 {
        return Err(DomainError::validation(format!(
            "{field} must be at most 64 bytes (got {})",
            value.len()
        )));
    }
    let valid = value
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'.');
    if !valid || value.starts_with('.') || value.ends_with('.') {
        return Err(DomainError::validation(format!(
            "{field} '{value}' must be lowercase [a-z0-9_.] without leading or trailing dots"
        )));
    }
    Ok(())
}

/// Who caused an event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// A human user.
    User,
    /// A service principal (API key, service account).
    ServicePrincipal,
    /// The control plane itself (scheduler, reconciler).
    #[default]
    System,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::User => "user",
            ActorType::ServicePrincipal => "service_principal",
            ActorType::System => "system",
        }
    }
}

impl core::fmt::Display for ActorType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActorType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(ActorType::User),
            "service_principal" => Ok(ActorType::ServicePrincipal),
            "system" => Ok(ActorType::System),
            other => Err(DomainError::invalid_id(format!("unknown actor type '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_type_accepts_dotted_snake_case() {
        assert!(AggregateType::new("org").is_ok());
        assert!(AggregateType::new("volume_attachment").is_ok());
        assert!(AggregateType::new("edge.route2").is_ok());
    }

    #[test]
    fn aggregate_type_rejects_malformed_names() {
        for bad in ["", "Org", "org created", ".org", "org.", "org-x"] {
            assert!(
                matches!(AggregateType::new(bad), Err(DomainError::Validation(_))),
                "{bad:?} should be rejected"
            );
        }
        assert!(AggregateType::new("a".repeat(65)).is_err());
    }

    #[test]
    fn aggregate_type_deserialization_is_validated() {
        let ok: AggregateType = serde_json::from_str("\"org\"").unwrap();
        assert_eq!(ok.as_str(), "org");
        assert!(serde_json::from_str::<AggregateType>("\"NOPE\"").is_err());
    }

    #[test]
    fn actor_type_round_trips_through_display() {
        for actor in [ActorType::User, ActorType::ServicePrincipal, ActorType::System] {
            assert_eq!(actor.to_string().parse::<ActorType>().unwrap(), actor);
        }
        assert!("robot".parse::<ActorType>().is_err());
    }

    #[test]
    fn event_id_sql_conversion_clamps_negative() {
        assert_eq!(EventId::from_i64(-4), EventId::ZERO);
        assert_eq!(EventId::from_i64(42).value(), 42);
        assert_eq!(EventId::new(7).as_i64(), 7);
    }

    #[test]
    fn org_id_parse_rejects_garbage() {
        let org = OrgId::new();
        assert_eq!(org.to_string().parse::<OrgId>().unwrap(), org);
        assert!(matches!("not-a-uuid".parse::<OrgId>(), Err(DomainError::InvalidId(_))));
    }
}
