//! Payload transformer: registered source→target field mappings
//!
//! A mapping is an ordered list of per-field operators over path-addressed
//! fields. Requests transform under `(gateway.incoming → service.request)`
//! and responses under `(service.response → gateway.outgoing)`; a missing
//! or inactive mapping passes the document through unchanged.

use chrono::DateTime;
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::error::{GatewayError, Result};
use crate::services::paths::JsonPath;
use crate::services::schema_mapper::{SchemaMapper, ValidationOutcome};

/// Operator applied to a source field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorKind {
    /// Deep-copy the source value
    Direct,
    /// Emit the operator argument as a string value
    Constant,
    /// Reformat timestamps and decimals, pass anything else through
    Format,
    /// Inline key→value table keyed by the stringified source value
    Map,
    /// Resolve through a named lookup table
    Lookup,
    /// Minimal expression: a constant or a single path interpolation
    Computed,
    /// Template with `$.path` tokens replaced by source values
    Concat,
}

/// One field of a schema mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Logical field name
    pub name: String,
    pub source_path: String,
    pub target_path: String,
    pub operator: OperatorKind,
    /// Lookup-table name, format string, inline map, or constant
    #[serde(default)]
    pub argument: Option<Value>,
    #[serde(default)]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub required: bool,
}

/// Registered source→target mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaMapping {
    pub source_schema: String,
    pub target_schema: String,
    pub fields: Vec<FieldMapping>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

struct CompiledField {
    mapping: FieldMapping,
    source: JsonPath,
    target: JsonPath,
}

struct CompiledMapping {
    active: bool,
    fields: Vec<CompiledField>,
}

/// Mapping registry and transform engine
pub struct PayloadTransformer {
    mappings: DashMap<String, Arc<CompiledMapping>>,
    schema_mapper: Arc<SchemaMapper>,
}

impl PayloadTransformer {
    pub fn new(schema_mapper: Arc<SchemaMapper>) -> Self {
        Self {
            mappings: DashMap::new(),
            schema_mapper,
        }
    }

    /// Compile and register a mapping; path errors surface here
    pub fn register_mapping(&self, mapping: SchemaMapping) -> Result<()> {
        let key = mapping_key(&mapping.source_schema, &mapping.target_schema);
        let mut fields = Vec::with_capacity(mapping.fields.len());
        for field in &mapping.fields {
            fields.push(CompiledField {
                source: JsonPath::parse(&field.source_path)?,
                target: JsonPath::parse(&field.target_path)?,
                mapping: field.clone(),
            });
        }
        debug!(mapping = %key, fields = fields.len(), "Mapping registered");
        self.mappings.insert(
            key,
            Arc::new(CompiledMapping {
                active: mapping.active,
                fields,
            }),
        );
        Ok(())
    }

    pub fn unregister_mapping(&self, source: &str, target: &str) -> bool {
        self.mappings.remove(&mapping_key(source, target)).is_some()
    }

    pub fn has_mapping(&self, source: &str, target: &str) -> bool {
        self.mappings
            .get(&mapping_key(source, target))
            .map(|m| m.active)
            .unwrap_or(false)
    }

    pub async fn transform_request(
        &self,
        document: &Value,
        source: &str,
        target: &str,
    ) -> Result<Value> {
        self.transform(document, source, target).await
    }

    pub async fn transform_response(
        &self,
        document: &Value,
        source: &str,
        target: &str,
    ) -> Result<Value> {
        self.transform(document, source, target).await
    }

    pub fn validate(&self, document: &Value, schema_name: &str) -> ValidationOutcome {
        self.schema_mapper.validate(document, schema_name)
    }

    async fn transform(&self, document: &Value, source: &str, target: &str) -> Result<Value> {
        let mapping = match self.mappings.get(&mapping_key(source, target)) {
            Some(entry) if entry.active => Arc::clone(entry.value()),
            _ => return Ok(document.clone()),
        };

        let mut output = Value::Object(serde_json::Map::new());
        for field in &mapping.fields {
            let produced = self.apply_operator(field, document).await?;
            let value = match produced {
                Value::Null => match &field.mapping.default_value {
                    Some(default) => default.clone(),
                    None if field.mapping.required => {
                        return Err(GatewayError::transform(
                            field.mapping.source_path.clone(),
                            format!("required field '{}' produced no value", field.mapping.name),
                        ));
                    }
                    None => continue,
                },
                value => value,
            };
            field.target.set(&mut output, value)?;
        }
        Ok(output)
    }

    async fn apply_operator(&self, field: &CompiledField, document: &Value) -> Result<Value> {
        let source = field.source.get(document);
        match field.mapping.operator {
            OperatorKind::Direct => Ok(source.cloned().unwrap_or(Value::Null)),
            OperatorKind::Constant => Ok(field
                .mapping
                .argument
                .as_ref()
                .map(|arg| Value::String(stringify(arg)))
                .unwrap_or(Value::Null)),
            OperatorKind::Format => Ok(apply_format(source, field.mapping.argument.as_ref())),
            OperatorKind::Map => Ok(apply_map(source, field.mapping.argument.as_ref())),
            OperatorKind::Lookup => {
                let Some(source) = source else {
                    return Ok(Value::Null);
                };
                let table = field
                    .mapping
                    .argument
                    .as_ref()
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        GatewayError::transform(
                            field.mapping.source_path.clone(),
                            "lookup operator needs a table-name argument",
                        )
                    })?;
                let resolved = self.schema_mapper.lookup(&stringify(source), table).await?;
                Ok(resolved.map(Value::String).unwrap_or(Value::Null))
            }
            OperatorKind::Computed => Ok(apply_computed(
                field.mapping.argument.as_ref(),
                document,
            )),
            OperatorKind::Concat => apply_concat(field.mapping.argument.as_ref(), document),
        }
    }
}

fn mapping_key(source: &str, target: &str) -> String {
    format!("{}->{}", source, target)
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Timestamps reformat with a chrono format string; decimals reformat to
/// the argument's precision; everything else passes through.
fn apply_format(source: Option<&Value>, argument: Option<&Value>) -> Value {
    let Some(source) = source else {
        return Value::Null;
    };
    let Some(format) = argument.and_then(Value::as_str) else {
        return source.clone();
    };

    if let Some(s) = source.as_str() {
        if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
            return Value::String(ts.format(format).to_string());
        }
        if let Ok(n) = s.parse::<f64>() {
            return Value::String(format_decimal(n, format));
        }
        return source.clone();
    }
    if let Some(n) = source.as_f64() {
        return Value::String(format_decimal(n, format));
    }
    source.clone()
}

/// Precision comes from the digits after the format's decimal point,
/// e.g. `0.00` → two places.
fn format_decimal(n: f64, format: &str) -> String {
    let precision = format
        .rsplit_once('.')
        .map(|(_, frac)| frac.chars().filter(|c| c.is_ascii_digit()).count())
        .unwrap_or(0);
    format!("{:.*}", precision, n)
}

fn apply_map(source: Option<&Value>, argument: Option<&Value>) -> Value {
    let Some(source) = source else {
        return Value::Null;
    };
    let key = stringify(source);
    match argument.and_then(Value::as_object) {
        Some(table) => table.get(&key).cloned().unwrap_or_else(|| source.clone()),
        None => source.clone(),
    }
}

/// Default strategy: a lone `$.path` expression resolves against the
/// source; any other expression is emitted as its literal text.
fn apply_computed(argument: Option<&Value>, document: &Value) -> Value {
    let Some(expression) = argument.and_then(Value::as_str) else {
        return Value::Null;
    };
    if expression.starts_with("$.") || expression == "$" {
        if let Ok(path) = JsonPath::parse(expression) {
            if let Some(value) = path.get(document) {
                return value.clone();
            }
            return Value::Null;
        }
    }
    Value::String(expression.to_string())
}

fn apply_concat(argument: Option<&Value>, document: &Value) -> Result<Value> {
    let Some(template) = argument.and_then(Value::as_str) else {
        return Ok(Value::Null);
    };
    // `$.a.b.0` tokens inside the template
    let token = Regex::new(r"\$(?:\.[A-Za-z0-9_]+)+").expect("token pattern is valid");
    let mut output = String::new();
    let mut last = 0;
    for found in token.find_iter(template) {
        output.push_str(&template[last..found.start()]);
        let path = JsonPath::parse(found.as_str())?;
        if let Some(value) = path.get(document) {
            output.push_str(&stringify(value));
        }
        last = found.end();
    }
    output.push_str(&template[last..]);
    Ok(Value::String(output))
}
