//! Bridge type descriptors, image references, container naming and
//! configuration validation.

pub mod descriptor;
pub mod image;
pub mod naming;
pub mod validation;

pub use descriptor::{BridgeTypeDescriptor, FieldKind, FieldSpec, TypeSettings, VolumeSource};
pub use image::ImageReference;
pub use naming::{
    container_name, parse_container_name, validate_id, ContainerPrefix, ParsedContainerName,
};
pub use validation::{ConfigValidator, RuleValidator, ValidationErrors};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to parse descriptor: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("descriptor registry must not be empty")]
    EmptyRegistry,
    #[error("invalid image reference: '{0}'")]
    InvalidImage(String),
    #[error("invalid identifier '{0}': must match [a-zA-Z0-9_]")]
    InvalidId(String),
    #[error("unknown validation rule '{0}'")]
    UnknownRule(String),
    #[error("validation failed: {0}")]
    Validation(ValidationErrors),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_error_display_invalid_image() {
        let e = SchemaError::InvalidImage("::".to_owned());
        assert!(e.to_string().contains("::"));
    }

    #[test]
    fn schema_error_display_invalid_id() {
        let e = SchemaError::InvalidId("a-b".to_owned());
        assert!(e.to_string().contains("a-b"));
    }
}
