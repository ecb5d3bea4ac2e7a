//! Field mapping seam.
//!
//! The orchestrator never hard-codes provider field tables; a [`FieldMapper`]
//! is injected per run. Mapping failures are `mapping_error` - never retried,
//! confined to the item being mapped.

use crate::canonical::CanonicalArtifact;
use crate::error::{CallError, ErrorKind};

/// Maps provider payloads into and out of the canonical form.
///
/// Implementations must be pure with respect to the run: the round trip
/// `canonical_to_target` then `source_to_canonical` preserves every canonical
/// field the mapper covers.
pub trait FieldMapper: Send + Sync {
    /// Map a source provider's native payload to the canonical artifact.
    fn source_to_canonical(
        &self,
        source_provider: &str,
        payload: &serde_json::Value,
    ) -> std::result::Result<CanonicalArtifact, CallError>;

    /// Map a canonical artifact to the target provider's create payload.
    fn canonical_to_target(
        &self,
        target_provider: &str,
        artifact: &CanonicalArtifact,
    ) -> std::result::Result<serde_json::Value, CallError>;
}

/// Default mapper: treats payloads as canonically-shaped JSON and preserves
/// non-canonical status/priority values under the `original*` attributes.
///
/// Real deployments inject provider-specific mappers; this one keeps simple
/// source/target pairs and every test harness working without field tables.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFieldMapper;

impl FieldMapper for DefaultFieldMapper {
    fn source_to_canonical(
        &self,
        source_provider: &str,
        payload: &serde_json::Value,
    ) -> std::result::Result<CanonicalArtifact, CallError> {
        // Status/priority may be non-canonical strings; lift them out first
        // so deserialization cannot reject the payload.
        let mut value = payload.clone();
        let status = take_string(&mut value, "status");
        let priority = take_string(&mut value, "priority");

        let mut artifact: CanonicalArtifact = serde_json::from_value(value).map_err(|e| {
            CallError::new(
                ErrorKind::MappingError,
                format!("source payload from '{source_provider}' is not artifact-shaped: {e}"),
            )
        })?;
        if artifact.source_id.is_empty() {
            return Err(CallError::new(
                ErrorKind::MappingError,
                format!("source payload from '{source_provider}' is missing 'source_id'"),
            ));
        }
        if let Some(status) = status {
            artifact.set_status_from(&status);
        }
        if let Some(priority) = priority {
            artifact.set_priority_from(&priority);
        }
        Ok(artifact)
    }

    fn canonical_to_target(
        &self,
        target_provider: &str,
        artifact: &CanonicalArtifact,
    ) -> std::result::Result<serde_json::Value, CallError> {
        serde_json::to_value(artifact).map_err(|e| {
            CallError::new(
                ErrorKind::MappingError,
                format!("artifact '{}' not serializable for '{target_provider}': {e}", artifact.source_id),
            )
        })
    }
}

fn take_string(value: &mut serde_json::Value, key: &str) -> Option<String> {
    let obj = value.as_object_mut()?;
    match obj.remove(key) {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => {
            obj.insert(key.to_string(), other);
            None
        }
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::{Priority, Status, ORIGINAL_STATUS_KEY};

    #[test]
    fn round_trip_preserves_covered_fields() {
        let mapper = DefaultFieldMapper;
        let payload = serde_json::json!({
            "source_id": "TC-42",
            "title": "Login succeeds",
            "description": "happy path",
            "steps": [{"action": "open login", "expected": "form shown"}],
            "priority": "HIGH",
            "status": "READY",
            "tags": ["auth"],
        });

        let canonical = mapper.source_to_canonical("alpha", &payload).unwrap();
        let target = mapper.canonical_to_target("beta", &canonical).unwrap();
        let again = mapper.source_to_canonical("beta", &target).unwrap();

        assert_eq!(canonical, again);
        assert_eq!(again.title, "Login succeeds");
        assert_eq!(again.priority, Priority::High);
        assert_eq!(again.status, Status::Ready);
        assert_eq!(again.steps.len(), 1);
    }

    #[test]
    fn non_canonical_status_survives_via_original_attribute() {
        let mapper = DefaultFieldMapper;
        let payload = serde_json::json!({
            "source_id": "TC-7",
            "title": "Weird status",
            "status": "Awaiting Sign-off",
        });
        let canonical = mapper.source_to_canonical("alpha", &payload).unwrap();
        assert_eq!(canonical.status, Status::Other);
        assert_eq!(
            canonical.custom_attributes[ORIGINAL_STATUS_KEY],
            serde_json::json!("Awaiting Sign-off")
        );
    }

    #[test]
    fn missing_source_id_is_mapping_error() {
        let mapper = DefaultFieldMapper;
        let err = mapper
            .source_to_canonical("alpha", &serde_json::json!({"title": "no id"}))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::MappingError);
    }

    #[test]
    fn non_object_payload_is_mapping_error() {
        let mapper = DefaultFieldMapper;
        let err = mapper
            .source_to_canonical("alpha", &serde_json::json!(["not", "an", "object"]))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::MappingError);
    }
}
