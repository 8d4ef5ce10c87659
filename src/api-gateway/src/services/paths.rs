//! Path selectors over JSON documents
//!
//! A minimal embedded language: `$`-rooted, `.field` descent, numeric
//! segments index into arrays. Unsupported constructs are rejected when a
//! mapping is registered, not at transform time.

use serde_json::Value;
use std::fmt;

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Field(String),
    Index(usize),
}

/// A compiled `$.a.b.0.c` selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    raw: String,
    segments: Vec<Segment>,
}

impl JsonPath {
    /// Parse and validate a selector. `$` alone addresses the root.
    pub fn parse(path: &str) -> Result<Self> {
        let rest = path
            .strip_prefix('$')
            .ok_or_else(|| GatewayError::transform(path, "path must start with '$'"))?;

        let mut segments = Vec::new();
        if !rest.is_empty() {
            let rest = rest.strip_prefix('.').ok_or_else(|| {
                GatewayError::transform(path, "expected '.' after '$'")
            })?;
            for part in rest.split('.') {
                if part.is_empty() {
                    return Err(GatewayError::transform(path, "empty path segment"));
                }
                if part.contains(['[', ']', '*', ' ']) {
                    return Err(GatewayError::transform(
                        path,
                        format!("unsupported construct in segment '{}'", part),
                    ));
                }
                if part.chars().all(|c| c.is_ascii_digit()) {
                    let index: usize = part.parse().map_err(|_| {
                        GatewayError::transform(path, format!("invalid index '{}'", part))
                    })?;
                    segments.push(Segment::Index(index));
                } else {
                    segments.push(Segment::Field(part.to_string()));
                }
            }
        }

        Ok(Self {
            raw: path.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Read the value addressed by the path
    pub fn get<'a>(&self, document: &'a Value) -> Option<&'a Value> {
        let mut current = document;
        for segment in &self.segments {
            current = match segment {
                Segment::Field(name) => current.get(name)?,
                Segment::Index(i) => current.get(i)?,
            };
        }
        Some(current)
    }

    /// Write `value` at the path, creating missing intermediate containers.
    ///
    /// An array write at the current length appends; anything past that is
    /// out of range and errors.
    pub fn set(&self, document: &mut Value, value: Value) -> Result<()> {
        if self.segments.is_empty() {
            *document = value;
            return Ok(());
        }

        let mut current = document;
        for (position, segment) in self.segments.iter().enumerate() {
            let last = position == self.segments.len() - 1;
            match segment {
                Segment::Field(name) => {
                    if !current.is_object() {
                        if current.is_null() {
                            *current = Value::Object(serde_json::Map::new());
                        } else {
                            return Err(GatewayError::transform(
                                &self.raw,
                                format!("cannot descend into non-object at '{}'", name),
                            ));
                        }
                    }
                    let map = current.as_object_mut().expect("object checked above");
                    if last {
                        map.insert(name.clone(), value);
                        return Ok(());
                    }
                    current = map.entry(name.clone()).or_insert(Value::Null);
                }
                Segment::Index(i) => {
                    if !current.is_array() {
                        if current.is_null() {
                            *current = Value::Array(Vec::new());
                        } else {
                            return Err(GatewayError::transform(
                                &self.raw,
                                format!("cannot index into non-array at {}", i),
                            ));
                        }
                    }
                    let array = current.as_array_mut().expect("array checked above");
                    if *i > array.len() {
                        return Err(GatewayError::transform(
                            &self.raw,
                            format!("index {} out of range for array of length {}", i, array.len()),
                        ));
                    }
                    if *i == array.len() {
                        array.push(Value::Null);
                    }
                    if last {
                        array[*i] = value;
                        return Ok(());
                    }
                    current = &mut array[*i];
                }
            }
        }
        unreachable!("loop returns on the last segment");
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_rejects_unsupported_constructs() {
        assert!(JsonPath::parse("$.a.b").is_ok());
        assert!(JsonPath::parse("$").is_ok());
        assert!(JsonPath::parse("$.items.0.sku").is_ok());
        assert!(JsonPath::parse("a.b").is_err());
        assert!(JsonPath::parse("$.a..b").is_err());
        assert!(JsonPath::parse("$.items[0]").is_err());
        assert!(JsonPath::parse("$.items.*").is_err());
    }

    #[test]
    fn test_get_descends_objects_and_arrays() {
        let doc = json!({ "order": { "lines": [ { "sku": "A-1" }, { "sku": "B-2" } ] } });
        let path = JsonPath::parse("$.order.lines.1.sku").unwrap();
        assert_eq!(path.get(&doc), Some(&json!("B-2")));
        assert_eq!(JsonPath::parse("$.order.missing").unwrap().get(&doc), None);
        assert_eq!(JsonPath::parse("$").unwrap().get(&doc), Some(&doc));
    }

    #[test]
    fn test_set_creates_intermediate_objects() {
        let mut doc = json!({});
        JsonPath::parse("$.customer.address.city")
            .unwrap()
            .set(&mut doc, json!("Oslo"))
            .unwrap();
        assert_eq!(doc, json!({ "customer": { "address": { "city": "Oslo" } } }));
    }

    #[test]
    fn test_set_array_append_and_out_of_range() {
        let mut doc = json!({ "items": ["a"] });

        // Overwrite in range
        JsonPath::parse("$.items.0")
            .unwrap()
            .set(&mut doc, json!("z"))
            .unwrap();
        // Append at the boundary
        JsonPath::parse("$.items.1")
            .unwrap()
            .set(&mut doc, json!("b"))
            .unwrap();
        assert_eq!(doc, json!({ "items": ["z", "b"] }));

        // Past the boundary is an error
        let err = JsonPath::parse("$.items.5")
            .unwrap()
            .set(&mut doc, json!("x"))
            .unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_set_root_replaces_document() {
        let mut doc = json!({ "a": 1 });
        JsonPath::parse("$").unwrap().set(&mut doc, json!([1, 2])).unwrap();
        assert_eq!(doc, json!([1, 2]));
    }
}
