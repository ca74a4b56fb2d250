//! In-memory models produced by database actions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single object of a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelObject {
    /// Object id, unique within the database
    pub oid: i64,

    /// Type name, e.g. "Wall" or "Door"
    #[serde(rename = "type")]
    pub type_name: String,

    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

/// An object as submitted for import, before it has an oid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewObject {
    #[serde(rename = "type")]
    pub type_name: String,

    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

/// An object row as stored, attributes still encoded
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub oid: i64,
    pub type_name: String,
    pub attributes: String,
}

impl StoredObject {
    /// Decode the stored attributes into a model object
    pub fn decode(&self) -> Result<ModelObject, serde_json::Error> {
        Ok(ModelObject {
            oid: self.oid,
            type_name: self.type_name.clone(),
            attributes: serde_json::from_str(&self.attributes)?,
        })
    }
}

/// The model of one revision, loaded inside a transaction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Model {
    /// Display name, used as the output file name
    pub name: String,

    /// Revision number the model was loaded from
    pub revision_number: u32,

    /// Cleared when some stored objects could not be decoded
    pub valid: bool,

    pub objects: Vec<ModelObject>,
}

impl Model {
    pub fn new(name: impl Into<String>, revision_number: u32, objects: Vec<ModelObject>) -> Self {
        Self {
            name: name.into(),
            revision_number,
            valid: true,
            objects,
        }
    }

    /// Mark the model as incomplete
    pub fn invalidate(mut self) -> Self {
        self.valid = false;
        self
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_object_decode() {
        let stored = StoredObject {
            oid: 5,
            type_name: "Wall".to_string(),
            attributes: r#"{"height": 3.0}"#.to_string(),
        };

        let object = stored.decode().unwrap();
        assert_eq!(object.oid, 5);
        assert_eq!(object.attributes["height"], 3.0);
    }

    #[test]
    fn test_stored_object_decode_rejects_garbage() {
        let stored = StoredObject {
            oid: 5,
            type_name: "Wall".to_string(),
            attributes: "not json".to_string(),
        };

        assert!(stored.decode().is_err());
    }

    #[test]
    fn test_new_object_uses_type_key() {
        let parsed: NewObject =
            serde_json::from_str(r#"{"type": "Door", "attributes": {"width": 0.9}}"#).unwrap();
        assert_eq!(parsed.type_name, "Door");
    }

    #[test]
    fn test_model_validity() {
        let model = Model::new("site-r1", 1, Vec::new());
        assert!(model.is_valid());
        assert!(!model.invalidate().is_valid());
    }
}
