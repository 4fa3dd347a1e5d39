use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::MergeError;

/// Ontology schema snapshot of one branch: entity types with their properties and links
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OntologySchema {
    #[serde(default)]
    pub entities: BTreeMap<String, EntityDef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityDef {
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyDef>,
    #[serde(default)]
    pub links: BTreeMap<String, LinkDef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    String,
    Text,
    Integer,
    Float,
    Boolean,
    Date,
    Datetime,
    Json,
    #[serde(untagged)]
    Other(String),
}

impl PropertyType {
    /// The wider of two types when they form a known-safe widening pair
    pub fn widen(&self, other: &PropertyType) -> Option<PropertyType> {
        match (self, other) {
            (PropertyType::String, PropertyType::Text)
            | (PropertyType::Text, PropertyType::String) => Some(PropertyType::Text),
            (PropertyType::Integer, PropertyType::Float)
            | (PropertyType::Float, PropertyType::Integer) => Some(PropertyType::Float),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PropertyType::String => "string",
            PropertyType::Text => "text",
            PropertyType::Integer => "integer",
            PropertyType::Float => "float",
            PropertyType::Boolean => "boolean",
            PropertyType::Date => "date",
            PropertyType::Datetime => "datetime",
            PropertyType::Json => "json",
            PropertyType::Other(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDef {
    #[serde(rename = "type")]
    pub property_type: PropertyType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub unique: bool,
}

impl PropertyDef {
    pub fn new(property_type: PropertyType) -> Self {
        Self {
            property_type,
            required: false,
            unique: false,
        }
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Cardinality {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkDef {
    pub target: String,
    pub cardinality: Cardinality,
}

impl OntologySchema {
    /// Interpret a JSON payload as a schema. Accepts `{"entities": {...}}` or a
    /// bare map of entity name to entity definition.
    pub fn from_value(value: &serde_json::Value, side: &'static str) -> Result<Self, MergeError> {
        let malformed = |reason: String| MergeError::MalformedSchema { side, reason };

        let object = value
            .as_object()
            .ok_or_else(|| malformed(format!("expected a JSON object, got {}", json_kind(value))))?;

        let entities = match object.get("entities") {
            Some(entities) if entities.is_object() => entities.clone(),
            Some(other) => {
                return Err(malformed(format!(
                    "'entities' must be an object, got {}",
                    json_kind(other)
                )))
            }
            None => value.clone(),
        };

        let entities: BTreeMap<String, EntityDef> =
            serde_json::from_value(entities).map_err(|e| malformed(e.to_string()))?;
        Ok(Self { entities })
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn entity(&self, name: &str) -> Option<&EntityDef> {
        self.entities.get(name)
    }

    pub fn property(&self, entity: &str, property: &str) -> Option<&PropertyDef> {
        self.entities.get(entity)?.properties.get(property)
    }

    pub fn link(&self, entity: &str, link: &str) -> Option<&LinkDef> {
        self.entities.get(entity)?.links.get(link)
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parses_wrapped_and_bare_payloads() {
        let wrapped = json!({"entities": {"Product": {"properties": {"price": {"type": "integer"}}}}});
        let bare = json!({"Product": {"properties": {"price": {"type": "integer"}}}});

        let a = OntologySchema::from_value(&wrapped, "source").unwrap();
        let b = OntologySchema::from_value(&bare, "source").unwrap();
        assert_eq!(a, b);

        let price = a.property("Product", "price").unwrap();
        assert_eq!(price.property_type, PropertyType::Integer);
        assert!(!price.required);
        assert!(!price.unique);
    }

    #[test]
    fn test_unknown_type_names_are_kept() {
        let value = json!({"Doc": {"properties": {"geo": {"type": "geopoint"}}}});
        let schema = OntologySchema::from_value(&value, "target").unwrap();
        assert_eq!(
            schema.property("Doc", "geo").unwrap().property_type,
            PropertyType::Other("geopoint".to_string())
        );
    }

    #[test]
    fn test_rejects_uninterpretable_payloads() {
        for value in [json!(null), json!([1, 2]), json!("schema"), json!({"entities": 3})] {
            let err = OntologySchema::from_value(&value, "source").unwrap_err();
            assert!(matches!(err, MergeError::MalformedSchema { side: "source", .. }));
        }
        let bad_property = json!({"Product": {"properties": {"price": {"required": true}}}});
        assert!(OntologySchema::from_value(&bad_property, "target").is_err());
    }

    #[test]
    fn test_widening_pairs() {
        use PropertyType::*;
        assert_eq!(String.widen(&Text), Some(Text));
        assert_eq!(Text.widen(&String), Some(Text));
        assert_eq!(Integer.widen(&Float), Some(Float));
        assert_eq!(Float.widen(&Integer), Some(Float));
        assert_eq!(String.widen(&Integer), None);
        assert_eq!(Boolean.widen(&String), None);
    }
}
