//! Backend results and their shaping into a conversion output.
//!
//! Backends return whatever form is natural for their format. The orchestrator
//! turns that into one of three caller-facing shapes:
//!
//! | Backend output | Conversion output |
//! |---|---|
//! | `Text` | `Text`, unchanged |
//! | `Queries`, all-string `Sequence` | `Text`, joined with a blank line |
//! | other `Sequence`, `Mapping` | `Structured` |
//! | `Binary` | `Binary`, unchanged |
//! | `Other` | `Text` of its `Display` form |
//!
//! # Examples
//!
//! ```rust
//! use sigma_convert::output::{shape, BackendOutput, ConversionOutput};
//!
//! let output = shape(BackendOutput::Queries(vec!["a".into(), "b".into()]));
//! assert_eq!(output, ConversionOutput::Text("a\n\nb".to_string()));
//! ```

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

/// Separator placed between the queries of a multi-query result.
pub const QUERY_SEPARATOR: &str = "\n\n";

/// Raw result of a backend conversion.
pub enum BackendOutput {
    Text(String),
    Queries(Vec<String>),
    Sequence(Vec<Value>),
    Mapping(Map<String, Value>),
    Binary(Vec<u8>),
    Other(Box<dyn fmt::Display + Send>),
}

impl fmt::Debug for BackendOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendOutput::Text(text) => f.debug_tuple("Text").field(text).finish(),
            BackendOutput::Queries(queries) => f.debug_tuple("Queries").field(queries).finish(),
            BackendOutput::Sequence(items) => f.debug_tuple("Sequence").field(items).finish(),
            BackendOutput::Mapping(map) => f.debug_tuple("Mapping").field(map).finish(),
            BackendOutput::Binary(bytes) => write!(f, "Binary({} bytes)", bytes.len()),
            BackendOutput::Other(value) => write!(f, "Other({value})"),
        }
    }
}

/// Final output of a successful conversion.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ConversionOutput {
    Text(String),
    Structured(Value),
    Binary(Vec<u8>),
}

impl ConversionOutput {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ConversionOutput::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn into_text(self) -> Option<String> {
        match self {
            ConversionOutput::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_structured(&self) -> Option<&Value> {
        match self {
            ConversionOutput::Structured(value) => Some(value),
            _ => None,
        }
    }
}

impl From<BackendOutput> for ConversionOutput {
    fn from(output: BackendOutput) -> Self {
        shape(output)
    }
}

/// Shape a backend result into a conversion output.
pub fn shape(output: BackendOutput) -> ConversionOutput {
    match output {
        BackendOutput::Text(text) => ConversionOutput::Text(text),
        BackendOutput::Queries(queries) => ConversionOutput::Text(queries.join(QUERY_SEPARATOR)),
        BackendOutput::Sequence(items) => {
            if items.iter().all(Value::is_string) {
                let texts: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
                ConversionOutput::Text(texts.join(QUERY_SEPARATOR))
            } else {
                ConversionOutput::Structured(Value::Array(items))
            }
        }
        BackendOutput::Mapping(map) => ConversionOutput::Structured(Value::Object(map)),
        BackendOutput::Binary(bytes) => ConversionOutput::Binary(bytes),
        BackendOutput::Other(value) => ConversionOutput::Text(value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_text_passes_through() {
        assert_eq!(
            shape(BackendOutput::Text("q".to_string())),
            ConversionOutput::Text("q".to_string())
        );
    }

    #[test]
    fn test_queries_are_joined() {
        let output = shape(BackendOutput::Queries(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(output.as_text(), Some("a\n\nb"));
        assert_eq!(
            shape(BackendOutput::Queries(Vec::new())).as_text(),
            Some("")
        );
    }

    #[test]
    fn test_string_sequence_is_joined() {
        let output = shape(BackendOutput::Sequence(vec![json!("x"), json!("y")]));
        assert_eq!(output.as_text(), Some("x\n\ny"));
    }

    #[test]
    fn test_structured_sequence_passes_through() {
        let items = vec![json!({"query": "a"}), json!("b")];
        let output = shape(BackendOutput::Sequence(items.clone()));
        assert_eq!(output, ConversionOutput::Structured(Value::Array(items)));
    }

    #[test]
    fn test_mapping_and_binary() {
        let mut map = Map::new();
        map.insert("rules".to_string(), json!([]));
        assert_eq!(
            shape(BackendOutput::Mapping(map)).as_structured(),
            Some(&json!({"rules": []}))
        );
        assert_eq!(
            shape(BackendOutput::Binary(vec![0, 1])),
            ConversionOutput::Binary(vec![0, 1])
        );
    }

    #[test]
    fn test_other_uses_display() {
        let output = shape(BackendOutput::Other(Box::new(42u32)));
        assert_eq!(output.into_text().as_deref(), Some("42"));
    }
}
