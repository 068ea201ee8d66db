//! Telemetry samples and their validation
//!
//! A sample is an ordered set of named scalar readings. Validation is pure and
//! always happens before anything is handed to the transport.

use chrono::{DateTime, Utc};
use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Telemetry input rejected locally
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("telemetry sample has no fields")]
    Empty,
    #[error("required field '{0}' is missing")]
    MissingField(String),
    #[error("field '{field}' is not numeric: {value}")]
    NotNumeric { field: String, value: String },
    #[error("field '{0}' is not a finite number")]
    NotFinite(String),
    #[error("field names must not be empty")]
    EmptyFieldName,
    #[error("field '{0}' appears more than once")]
    DuplicateField(String),
    #[error("invalid telemetry input: {0}")]
    InvalidInput(String),
}

/// One set of readings taken at a point in time
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    fields: Vec<(String, f64)>,
    timestamp: DateTime<Utc>,
}

impl TelemetrySample {
    /// Build a sample from ordered readings, timestamped now
    pub fn new<I, K>(fields: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        let mut collected: Vec<(String, f64)> = Vec::new();
        for (name, value) in fields {
            let name = name.into();
            if name.is_empty() {
                return Err(ValidationError::EmptyFieldName);
            }
            if !value.is_finite() {
                return Err(ValidationError::NotFinite(name));
            }
            if collected.iter().any(|(existing, _)| *existing == name) {
                return Err(ValidationError::DuplicateField(name));
            }
            collected.push((name, value));
        }

        if collected.is_empty() {
            return Err(ValidationError::Empty);
        }

        Ok(Self {
            fields: collected,
            timestamp: Utc::now(),
        })
    }

    /// Validate raw caller input; every value must be a JSON number
    pub fn from_values(values: &Map<String, Value>) -> Result<Self, ValidationError> {
        let mut fields = Vec::with_capacity(values.len());
        for (name, value) in values {
            let number = match value {
                Value::Number(number) => number.as_f64(),
                _ => None,
            };
            let number = number.ok_or_else(|| ValidationError::NotNumeric {
                field: name.clone(),
                value: value.to_string(),
            })?;
            fields.push((name.clone(), number));
        }
        Self::new(fields)
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn fields(&self) -> &[(String, f64)] {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| *value)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Check that every required field is present
    pub fn validate_required(&self, required: &[String]) -> Result<(), ValidationError> {
        match required.iter().find(|name| self.get(name).is_none()) {
            Some(missing) => Err(ValidationError::MissingField(missing.clone())),
            None => Ok(()),
        }
    }

    /// JSON body for the telemetry topic, keys in insertion order.
    ///
    /// With `include_timestamp` the `{"ts": <unix ms>, "values": {...}}` form
    /// is produced instead of the flat object.
    pub fn to_payload(&self, include_timestamp: bool) -> Value {
        let mut values = Map::with_capacity(self.fields.len());
        for (name, value) in &self.fields {
            // finite by construction
            if let Some(number) = Number::from_f64(*value) {
                values.insert(name.clone(), Value::Number(number));
            }
        }

        if include_timestamp {
            let mut body = Map::with_capacity(2);
            body.insert("ts".to_string(), Value::from(self.timestamp.timestamp_millis()));
            body.insert("values".to_string(), Value::Object(values));
            Value::Object(body)
        } else {
            Value::Object(values)
        }
    }

    pub fn to_bytes(&self, include_timestamp: bool) -> Vec<u8> {
        self.to_payload(include_timestamp).to_string().into_bytes()
    }
}

/// Parse a line of caller input into raw telemetry values.
///
/// Accepts a JSON object (`{"temperature": 25}`) or whitespace separated
/// `name=value` pairs (`temperature=25 humidity=40`).
pub fn parse_field_assignments(line: &str) -> Result<Map<String, Value>, ValidationError> {
    let line = line.trim();
    if line.starts_with('{') {
        return match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(ValidationError::InvalidInput(
                "expected a JSON object".to_string(),
            )),
            Err(e) => Err(ValidationError::InvalidInput(e.to_string())),
        };
    }

    let mut values = Map::new();
    for pair in line.split_whitespace() {
        let (name, raw) = pair
            .split_once('=')
            .ok_or_else(|| ValidationError::InvalidInput(format!("expected name=value, got '{pair}'")))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::EmptyFieldName);
        }
        let number = raw
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .ok_or_else(|| ValidationError::NotNumeric {
                field: name.to_string(),
                value: raw.to_string(),
            })?;
        values.insert(name.to_string(), Value::Number(number));
    }

    if values.is_empty() {
        return Err(ValidationError::Empty);
    }
    Ok(values)
}
