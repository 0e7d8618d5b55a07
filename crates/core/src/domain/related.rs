// Related business entities
//
// A job can be tagged with the business object it acts on, so callers can ask
// "is there already an import job for invoice 42?". The (class, identifier)
// pair is not unique across jobs.

use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedEntity {
    class: String,
    identifier: Value,
}

impl RelatedEntity {
    /// The identifier must be a non-empty JSON object; its serialized form is
    /// the storage and lookup key.
    pub fn new(class: impl Into<String>, identifier: Value) -> Result<Self> {
        let class = class.into();
        if class.is_empty() {
            return Err(AppError::InvalidArgument(
                "related entity class must not be empty".to_string(),
            ));
        }
        match &identifier {
            Value::Object(map) if map.is_empty() => Err(AppError::InvalidArgument(format!(
                "related entity identifier for '{class}' must not be empty"
            ))),
            Value::Object(_) => Ok(Self { class, identifier }),
            _ => Err(AppError::InvalidArgument(format!(
                "related entity identifier for '{class}' must be a JSON object"
            ))),
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn identifier(&self) -> &Value {
        &self.identifier
    }

    /// Canonical serialized identifier. serde_json keeps object keys sorted,
    /// so equal identifiers serialize identically.
    pub fn identifier_json(&self) -> String {
        self.identifier.to_string()
    }
}
