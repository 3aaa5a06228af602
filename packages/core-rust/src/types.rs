use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Scalar value that identifies one saga instance.
///
/// Correlation values are read out of a message document by field name and
/// matched exactly against the same-named field of stored saga state. Only
/// scalars with a stable equality are accepted: floats, nulls, arrays and
/// objects are rejected at extraction time.
///
/// Serializes untagged so the value written into a state document is the
/// plain JSON scalar (`"3f2a..."`, `42`, `true`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CorrelationValue {
    /// Boolean correlation (rare, but valid JSON scalar).
    Boolean(bool),
    /// Signed 64-bit integer identifier.
    Integer(i64),
    /// Text identifier. UUIDs serialize to this variant.
    Text(String),
}

impl CorrelationValue {
    /// Converts a JSON scalar into a correlation value.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidCorrelation`] for null, float, array or
    /// object values.
    pub fn from_json(field: &str, value: &serde_json::Value) -> Result<Self, CodecError> {
        match value {
            serde_json::Value::String(s) => Ok(Self::Text(s.clone())),
            serde_json::Value::Bool(b) => Ok(Self::Boolean(*b)),
            serde_json::Value::Number(n) => {
                n.as_i64()
                    .map(Self::Integer)
                    .ok_or_else(|| CodecError::InvalidCorrelation {
                        field: field.to_string(),
                        reason: format!("number {n} is not a 64-bit integer"),
                    })
            }
            serde_json::Value::Null => Err(CodecError::InvalidCorrelation {
                field: field.to_string(),
                reason: "value is null".to_string(),
            }),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                Err(CodecError::InvalidCorrelation {
                    field: field.to_string(),
                    reason: "value is not a scalar".to_string(),
                })
            }
        }
    }

    /// Returns the JSON scalar for this value.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Boolean(b) => serde_json::Value::Bool(*b),
            Self::Integer(i) => serde_json::Value::from(*i),
            Self::Text(s) => serde_json::Value::String(s.clone()),
        }
    }

    /// Whether this value equals the given JSON scalar.
    #[must_use]
    pub fn matches(&self, value: &serde_json::Value) -> bool {
        match (self, value) {
            (Self::Boolean(a), serde_json::Value::Bool(b)) => a == b,
            (Self::Integer(a), serde_json::Value::Number(n)) => n.as_i64() == Some(*a),
            (Self::Text(a), serde_json::Value::String(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for CorrelationValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for CorrelationValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for CorrelationValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for CorrelationValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}
