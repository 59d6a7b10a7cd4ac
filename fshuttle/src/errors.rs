use crate::models::EntityKey;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShuttleError {
    #[error("SQLite operation failed: {0}")]
    SQLite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid UUID: {0}")]
    Uuid(#[from] uuid::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid extraction plan '{plan}': {reason}")]
    InvalidPlan { plan: String, reason: String },

    #[error("Property type '{property_type}' is not known to the catalog (entity set '{entity_set}')")]
    UnknownPropertyType {
        entity_set: String,
        property_type: String,
    },

    #[error("Entity set '{0}' is not known to the catalog")]
    UnknownEntitySet(String),

    #[error(
        "Property type {property_type_id} is not authorized for entity set {entity_set_id} (entity '{entity_id}')"
    )]
    UnauthorizedProperty {
        entity_set_id: uuid::Uuid,
        entity_id: String,
        property_type_id: uuid::Uuid,
    },

    #[error(
        "Value for property type {property_type_id} of entity '{entity_id}' in entity set {entity_set_id} cannot be stored as {expected}: {value}"
    )]
    TypeMismatch {
        entity_set_id: uuid::Uuid,
        entity_id: String,
        property_type_id: uuid::Uuid,
        expected: String,
        value: String,
    },

    #[error("Extraction failed at row {row} ({context}): {reason}")]
    Extraction {
        row: u64,
        context: String,
        reason: String,
    },

    #[error("Key resolution incomplete: {0}")]
    Resolution(String),

    #[error("No destination registered for {0}")]
    MissingDestination(String),

    #[error("Row source failed: {0}")]
    Source(String),

    #[error("Object store unavailable: {0}")]
    ObjectStore(String),

    #[error("Remote API rejected the request: {0}")]
    RemoteApi(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ShuttleError {
    /// Transient failures a destination may retry without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ShuttleError::ObjectStore(_) | ShuttleError::Io(_))
    }

    /// Names the entity a coercion failure belongs to. Other errors pass through.
    pub fn for_entity(self, key: &EntityKey) -> Self {
        match self {
            ShuttleError::TypeMismatch {
                property_type_id,
                expected,
                value,
                ..
            } => ShuttleError::TypeMismatch {
                entity_set_id: key.entity_set_id,
                entity_id: key.entity_id.clone(),
                property_type_id,
                expected,
                value,
            },
            other => other,
        }
    }

    /// Whether this error must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable()
    }
}

pub type Result<T> = std::result::Result<T, ShuttleError>;
