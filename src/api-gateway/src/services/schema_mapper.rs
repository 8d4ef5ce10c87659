//! Schema registry, document validation, and lookup tables
//!
//! Schemas are JSON descriptors recognizing `required` and `properties`
//! (with `type`, `minLength`, `maxLength`, `pattern`, `minimum`,
//! `maximum`). Registered documents are held by reference and never
//! mutated. Lookup tables keep a process-local copy as the authority and
//! replicate into the counter store for cross-instance consistency.

use dashmap::DashMap;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::CounterStore;
use crate::error::Result;

/// Replicated lookup entries outlive any single deploy
const LOOKUP_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// One typed validation failure
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
    pub code: String,
    pub actual_value: Option<Value>,
}

/// Result of validating a document against a registered schema
#[derive(Debug, Clone, Serialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
}

impl ValidationOutcome {
    fn valid_with_warnings(warnings: Vec<String>) -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings,
        }
    }
}

/// Schema registry plus lookup-table resolution
pub struct SchemaMapper {
    schemas: DashMap<String, Arc<Value>>,
    lookup_tables: DashMap<String, HashMap<String, String>>,
    store: Arc<dyn CounterStore>,
}

impl SchemaMapper {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            schemas: DashMap::new(),
            lookup_tables: DashMap::new(),
            store,
        }
    }

    pub fn register_schema(&self, name: impl Into<String>, schema: Value) {
        let name = name.into();
        debug!(schema = %name, "Schema registered");
        self.schemas.insert(name, Arc::new(schema));
    }

    /// Register a table locally and replicate entries into the counter store
    pub async fn register_lookup_table(
        &self,
        name: impl Into<String>,
        mappings: HashMap<String, String>,
    ) -> Result<()> {
        let name = name.into();
        for (key, value) in &mappings {
            self.store
                .set(&format!("lookup:{}:{}", name, key), value, LOOKUP_TTL)
                .await?;
        }
        debug!(table = %name, entries = mappings.len(), "Lookup table registered");
        self.lookup_tables.insert(name, mappings);
        Ok(())
    }

    /// Resolve a value: process-local table first, then the counter store
    pub async fn lookup(&self, source_value: &str, table_name: &str) -> Result<Option<String>> {
        if let Some(table) = self.lookup_tables.get(table_name) {
            if let Some(value) = table.get(source_value) {
                return Ok(Some(value.clone()));
            }
        }

        let key = format!("lookup:{}:{}", table_name, source_value);
        match self.store.get(&key).await? {
            Some(value) => Ok(Some(value)),
            None => {
                warn!(table = table_name, key = source_value, "Lookup miss");
                Ok(None)
            }
        }
    }

    /// Validate a document against a registered schema.
    ///
    /// An unknown schema yields a valid outcome with a warning; validation
    /// is a pure function of the document and the registered schema.
    pub fn validate(&self, document: &Value, schema_name: &str) -> ValidationOutcome {
        let schema = match self.schemas.get(schema_name) {
            Some(schema) => Arc::clone(schema.value()),
            None => {
                warn!(schema = schema_name, "Unknown schema, passing document through");
                return ValidationOutcome::valid_with_warnings(vec![format!(
                    "schema '{}' is not registered",
                    schema_name
                )]);
            }
        };

        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for field in required.iter().filter_map(Value::as_str) {
                if document.get(field).map_or(true, Value::is_null) {
                    errors.push(ValidationError {
                        path: format!("$.{}", field),
                        message: format!("required field '{}' is missing", field),
                        code: "REQUIRED_FIELD_MISSING".to_string(),
                        actual_value: None,
                    });
                }
            }
        }

        if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
            for (field, constraints) in properties {
                let Some(actual) = document.get(field) else {
                    continue;
                };
                if actual.is_null() {
                    continue;
                }
                check_field(field, actual, constraints, &mut errors, &mut warnings);
            }
        }

        ValidationOutcome {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

fn check_field(
    field: &str,
    actual: &Value,
    constraints: &Value,
    errors: &mut Vec<ValidationError>,
    warnings: &mut Vec<String>,
) {
    let path = format!("$.{}", field);

    if let Some(declared) = constraints.get("type").and_then(Value::as_str) {
        if !kind_matches(declared, actual) {
            errors.push(ValidationError {
                path: path.clone(),
                message: format!(
                    "expected {}, found {}",
                    declared,
                    kind_name(actual)
                ),
                code: if declared == "integer" && actual.is_number() {
                    "NOT_INTEGER".to_string()
                } else {
                    "INVALID_TYPE".to_string()
                },
                actual_value: Some(actual.clone()),
            });
            return;
        }
    }

    if let Some(s) = actual.as_str() {
        let length = s.chars().count();
        if let Some(min) = constraints.get("minLength").and_then(Value::as_u64) {
            if (length as u64) < min {
                errors.push(ValidationError {
                    path: path.clone(),
                    message: format!("length {} is below the minimum of {}", length, min),
                    code: "MIN_LENGTH".to_string(),
                    actual_value: Some(Value::from(length)),
                });
            }
        }
        if let Some(max) = constraints.get("maxLength").and_then(Value::as_u64) {
            if (length as u64) > max {
                errors.push(ValidationError {
                    path: path.clone(),
                    message: format!("length {} exceeds the maximum of {}", length, max),
                    code: "MAX_LENGTH".to_string(),
                    actual_value: Some(Value::from(length)),
                });
            }
        }
        if let Some(pattern) = constraints.get("pattern").and_then(Value::as_str) {
            match Regex::new(pattern) {
                Ok(re) => {
                    if !re.is_match(s) {
                        errors.push(ValidationError {
                            path: path.clone(),
                            message: format!("value does not match pattern '{}'", pattern),
                            code: "PATTERN_MISMATCH".to_string(),
                            actual_value: Some(actual.clone()),
                        });
                    }
                }
                Err(e) => warnings.push(format!(
                    "pattern '{}' on {} failed to compile: {}",
                    pattern, path, e
                )),
            }
        }
    }

    if let Some(n) = actual.as_f64() {
        if let Some(min) = constraints.get("minimum").and_then(Value::as_f64) {
            if n < min {
                errors.push(ValidationError {
                    path: path.clone(),
                    message: format!("{} is below the minimum of {}", n, min),
                    code: "MIN_VALUE".to_string(),
                    actual_value: Some(actual.clone()),
                });
            }
        }
        if let Some(max) = constraints.get("maximum").and_then(Value::as_f64) {
            if n > max {
                errors.push(ValidationError {
                    path,
                    message: format!("{} exceeds the maximum of {}", n, max),
                    code: "MAX_VALUE".to_string(),
                    actual_value: Some(actual.clone()),
                });
            }
        }
    }
}

fn kind_matches(declared: &str, actual: &Value) -> bool {
    match declared {
        "string" => actual.is_string(),
        "number" => actual.is_number(),
        "integer" => actual.as_i64().is_some() || actual.as_u64().is_some(),
        "boolean" => actual.is_boolean(),
        "array" => actual.is_array(),
        "object" => actual.is_object(),
        "null" => actual.is_null(),
        _ => true,
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
