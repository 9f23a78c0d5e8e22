//! Common search parameters that apply to all FHIR resources.
//!
//! These are registered once as common entries; resource-specific
//! registrations with the same name take precedence.

use crate::parameters::{SearchParamConfig, SearchParameterType};
use crate::registry::SearchParameterRegistry;

/// Register all common (Resource-level) search parameters.
pub fn register_common_parameters(registry: &SearchParameterRegistry) {
    // _id - logical id of the resource
    registry.register_common(SearchParamConfig::new(
        "_id",
        "fhir_id",
        SearchParameterType::Token,
    ));

    // _lastUpdated - when the resource was last changed
    registry.register_common(SearchParamConfig::new(
        "_lastUpdated",
        "last_updated",
        SearchParameterType::Date,
    ));

    // _tag - tags applied to this resource
    registry.register_common(
        SearchParamConfig::new("_tag", "tag_code", SearchParameterType::Token)
            .with_system_column("tag_system"),
    );

    // _profile - profiles this resource claims to conform to
    registry.register_common(SearchParamConfig::new(
        "_profile",
        "profile",
        SearchParameterType::Uri,
    ));

    // _source - where the resource came from
    registry.register_common(SearchParamConfig::new(
        "_source",
        "source",
        SearchParameterType::Uri,
    ));

    tracing::debug!(count = 5, "registered common search parameters");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_parameters_apply_to_every_type() {
        let registry = SearchParameterRegistry::new();
        register_common_parameters(&registry);

        for resource_type in ["Patient", "Observation", "MedicationRequest"] {
            let id = registry.get(resource_type, "_id").unwrap();
            assert_eq!(id.column, "fhir_id");
            assert_eq!(id.kind, SearchParameterType::Token);

            let tag = registry.get(resource_type, "_tag").unwrap();
            assert_eq!(tag.system_column.as_deref(), Some("tag_system"));
        }
        assert_eq!(
            registry.get("Patient", "_lastUpdated").unwrap().kind,
            SearchParameterType::Date
        );
        assert_eq!(registry.get_all_for_type("Patient").len(), 5);
    }

    #[test]
    fn test_resource_registration_shadows_common() {
        let registry = SearchParameterRegistry::new();
        register_common_parameters(&registry);
        registry.register(
            "Patient",
            SearchParamConfig::new("_source", "meta_source", SearchParameterType::Uri),
        );
        assert_eq!(registry.get("Patient", "_source").unwrap().column, "meta_source");
        assert_eq!(registry.get("Observation", "_source").unwrap().column, "source");
        assert_eq!(registry.get_all_for_type("Patient").len(), 5);
    }
}
