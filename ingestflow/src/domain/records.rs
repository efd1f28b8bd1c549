//! Records owned by the external datastore and their update rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, Result};

/// Fields no update payload may touch.
pub const IMMUTABLE_FIELDS: [&str; 4] = ["id", "chatbot_id", "created_at", "updated_at"];

/// Record types the pipeline writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Document,
    Chat,
    Article,
    Product,
}

/// Accepted JSON shape of an updatable field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldShape {
    String,
    NullableString,
    Number,
    Boolean,
    StringList,
    Object,
}

impl FieldShape {
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldShape::String => value.is_string(),
            FieldShape::NullableString => value.is_string() || value.is_null(),
            FieldShape::Number => value.is_number(),
            FieldShape::Boolean => value.is_boolean(),
            FieldShape::StringList => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string)),
            FieldShape::Object => value.is_object(),
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            FieldShape::String => "a string",
            FieldShape::NullableString => "a string or null",
            FieldShape::Number => "a number",
            FieldShape::Boolean => "a boolean",
            FieldShape::StringList => "a list of strings",
            FieldShape::Object => "an object",
        }
    }
}

const DOCUMENT_FIELDS: &[(&str, FieldShape)] = &[
    ("content", FieldShape::String),
    ("char_count", FieldShape::Number),
    ("status", FieldShape::String),
    ("title", FieldShape::NullableString),
    ("error", FieldShape::NullableString),
    ("metadata", FieldShape::Object),
];

const CHAT_FIELDS: &[(&str, FieldShape)] = &[
    ("title", FieldShape::NullableString),
    ("summary", FieldShape::NullableString),
    ("insights", FieldShape::Object),
    ("sentiment", FieldShape::NullableString),
    ("topics", FieldShape::StringList),
    ("resolved", FieldShape::Boolean),
];

const ARTICLE_FIELDS: &[(&str, FieldShape)] = &[
    ("title", FieldShape::String),
    ("content", FieldShape::String),
    ("status", FieldShape::String),
    ("summary", FieldShape::NullableString),
    ("metadata", FieldShape::Object),
];

const PRODUCT_FIELDS: &[(&str, FieldShape)] = &[
    ("name", FieldShape::String),
    ("description", FieldShape::NullableString),
    ("price", FieldShape::Number),
    ("screenshot_url", FieldShape::NullableString),
    ("url", FieldShape::String),
    ("metadata", FieldShape::Object),
];

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Document => "document",
            RecordKind::Chat => "chat",
            RecordKind::Article => "article",
            RecordKind::Product => "product",
        }
    }

    /// Fields an update may set, with their shapes.
    pub fn updatable_fields(&self) -> &'static [(&'static str, FieldShape)] {
        match self {
            RecordKind::Document => DOCUMENT_FIELDS,
            RecordKind::Chat => CHAT_FIELDS,
            RecordKind::Article => ARTICLE_FIELDS,
            RecordKind::Product => PRODUCT_FIELDS,
        }
    }

    pub fn field_shape(&self, field: &str) -> Option<FieldShape> {
        self.updatable_fields()
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, shape)| *shape)
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row in the datastore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub kind: RecordKind,
    pub chatbot_id: String,
    pub fields: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record {
    pub fn new(kind: RecordKind, chatbot_id: impl Into<String>, fields: Map<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            chatbot_id: chatbot_id.into(),
            fields,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }
}

/// Check an update payload against the allow-list of `kind`.
///
/// Returns the field map to write. Any identity field, unknown field, or
/// wrongly shaped value rejects the whole payload with `InvalidUpdatePayload`.
pub fn validate_update(kind: RecordKind, payload: &Value) -> Result<Map<String, Value>> {
    let Some(fields) = payload.as_object() else {
        return Err(Error::invalid_update(format!(
            "{} update must be an object",
            kind
        )));
    };

    if fields.is_empty() {
        return Err(Error::invalid_update(format!("{} update is empty", kind)));
    }

    for (name, value) in fields {
        if IMMUTABLE_FIELDS.contains(&name.as_str()) {
            return Err(Error::invalid_update(format!(
                "field '{}' of {} is not updatable",
                name, kind
            )));
        }
        let Some(shape) = kind.field_shape(name) else {
            return Err(Error::invalid_update(format!(
                "field '{}' is not allowed on {}",
                name, kind
            )));
        };
        if !shape.accepts(value) {
            return Err(Error::invalid_update(format!(
                "field '{}' of {} must be {}",
                name,
                kind,
                shape.describe()
            )));
        }
    }

    Ok(fields.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_accepts_allowed_fields() {
        let fields = validate_update(
            RecordKind::Document,
            &json!({"content": "hello", "char_count": 5, "status": "completed", "title": null}),
        )
        .unwrap();
        assert_eq!(fields.len(), 4);

        validate_update(RecordKind::Product, &json!({"screenshot_url": "https://cdn/x.png"}))
            .unwrap();
        validate_update(RecordKind::Chat, &json!({"topics": ["billing"], "resolved": true}))
            .unwrap();
    }

    #[test]
    fn test_rejects_identity_fields() {
        for field in IMMUTABLE_FIELDS {
            let mut payload = Map::new();
            payload.insert(field.to_string(), json!("x"));
            let err = validate_update(RecordKind::Document, &Value::Object(payload)).unwrap_err();
            assert!(matches!(err, Error::InvalidUpdatePayload(_)), "{field}");
        }
    }

    #[test]
    fn test_rejects_unknown_field_and_bad_shape() {
        let err = validate_update(RecordKind::Article, &json!({"price": 3})).unwrap_err();
        assert!(matches!(err, Error::InvalidUpdatePayload(ref m) if m.contains("price")));

        let err = validate_update(RecordKind::Document, &json!({"char_count": "12"})).unwrap_err();
        assert!(matches!(err, Error::InvalidUpdatePayload(ref m) if m.contains("a number")));

        let err = validate_update(RecordKind::Chat, &json!({"topics": ["a", 1]})).unwrap_err();
        assert!(matches!(err, Error::InvalidUpdatePayload(_)));
    }

    #[test]
    fn test_rejects_non_object_and_empty() {
        assert!(validate_update(RecordKind::Product, &json!("x")).is_err());
        assert!(validate_update(RecordKind::Product, &json!({})).is_err());
        assert!(!validate_update(RecordKind::Product, &json!([])).unwrap_err().is_retryable());
    }
}
