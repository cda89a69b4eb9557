//! Backends lowering rule collections into target query languages.
//!
//! A backend is described statically by a [`BackendDescriptor`]: its key,
//! declared output formats and correlation methods, and a factory building a
//! fresh [`Backend`] instance from a [`BackendConfig`]. Instances are created
//! per conversion and used once.
//!
//! The bundled backends share the text lowering engine in [`text`] and differ
//! only in their grammar and in how they assemble the final output:
//!
//! - [`splunk`] - Splunk SPL, with `stats` based correlations
//! - [`lucene`] - Lucene query strings, Elasticsearch DSL and SIEM rules
//! - [`kusto`] - Kusto (Microsoft 365 Defender advanced hunting)

pub mod kusto;
pub mod lucene;
pub mod registry;
pub mod splunk;
pub mod text;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::attack::{AttackData, EmptyAttackData};
use crate::error::RuleFailure;
use crate::output::BackendOutput;
use crate::pipeline::ProcessingPipeline;
use crate::rule::SigmaCollection;

pub use registry::BackendRegistry;
pub use text::{QueryGrammar, TextQueryBackend};

/// Backend specific options, keyed by option name.
pub type BackendOptions = BTreeMap<String, serde_json::Value>;

/// A named output format or correlation method with its description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FormatInfo {
    pub name: &'static str,
    pub description: &'static str,
}

impl FormatInfo {
    pub const fn new(name: &'static str, description: &'static str) -> Self {
        Self { name, description }
    }
}

/// Names of a format table.
pub fn format_names(formats: &[FormatInfo]) -> Vec<String> {
    formats.iter().map(|f| f.name.to_string()).collect()
}

/// A backend option refused by a backend constructor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionRejection {
    /// The single offending option key.
    pub key: String,
    pub reason: String,
}

impl OptionRejection {
    pub fn unknown(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            reason: "unknown option".to_string(),
        }
    }

    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for OptionRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "option '{}': {}", self.key, self.reason)
    }
}

impl std::error::Error for OptionRejection {}

/// Construction parameters of a backend instance.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Record per-rule failures and keep converting; otherwise stop at the
    /// first failure.
    pub collect_errors: bool,
    pub pipeline: Option<ProcessingPipeline>,
    pub options: BackendOptions,
    /// Reference data for backends emitting threat metadata.
    pub attack: Arc<dyn AttackData>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            collect_errors: false,
            pipeline: None,
            options: BackendOptions::new(),
            attack: Arc::new(EmptyAttackData),
        }
    }
}

impl BackendConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collect_errors(mut self, collect_errors: bool) -> Self {
        self.collect_errors = collect_errors;
        self
    }

    pub fn with_pipeline(mut self, pipeline: ProcessingPipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Reject the first option, in key order, that is not in `accepted`.
    pub fn check_options(&self, accepted: &[&str]) -> Result<(), OptionRejection> {
        match self.options.keys().find(|key| !accepted.contains(&key.as_str())) {
            Some(key) => Err(OptionRejection::unknown(key.as_str())),
            None => Ok(()),
        }
    }

    /// A string option.
    pub fn string_option(&self, key: &str) -> Result<Option<String>, OptionRejection> {
        match self.options.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(OptionRejection::invalid(key, "expected a string")),
        }
    }

    /// A string or list-of-strings option.
    pub fn strings_option(&self, key: &str) -> Result<Option<Vec<String>>, OptionRejection> {
        match self.options.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::String(s)) => Ok(Some(vec![s.clone()])),
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| OptionRejection::invalid(key, "expected a list of strings"))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
            Some(_) => Err(OptionRejection::invalid(key, "expected a string or a list of strings")),
        }
    }
}

/// A backend instance, created for one conversion.
pub trait Backend: Send {
    /// Declared correlation methods; `None` when correlations are unsupported.
    fn correlation_methods(&self) -> Option<&'static [FormatInfo]>;

    /// Convert a collection. Rules that cannot be expressed are recorded in
    /// [`Backend::errors`] and left out of the output.
    fn convert(
        &mut self,
        collection: &SigmaCollection,
        format: &str,
        correlation_method: Option<&str>,
    ) -> BackendOutput;

    /// Per-rule failures recorded by the last conversion.
    fn errors(&self) -> &[RuleFailure];
}

/// Factory building a backend instance.
pub type BackendFactory = fn(BackendConfig) -> Result<Box<dyn Backend>, OptionRejection>;

/// Static description of a backend.
#[derive(Clone, Copy)]
pub struct BackendDescriptor {
    pub key: &'static str,
    pub name: &'static str,
    /// Name of the query language produced.
    pub language: &'static str,
    pub formats: &'static [FormatInfo],
    pub correlation_methods: Option<&'static [FormatInfo]>,
    pub factory: BackendFactory,
}

impl BackendDescriptor {
    pub fn supports_format(&self, format: &str) -> bool {
        self.formats.iter().any(|f| f.name == format)
    }

    pub fn instantiate(&self, config: BackendConfig) -> Result<Box<dyn Backend>, OptionRejection> {
        (self.factory)(config)
    }
}

impl fmt::Debug for BackendDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendDescriptor")
            .field("key", &self.key)
            .field("name", &self.name)
            .field("language", &self.language)
            .field("formats", &self.formats)
            .field("correlation_methods", &self.correlation_methods)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_check_options_names_single_key() {
        let config = BackendConfig::new()
            .with_option("app", json!("search"))
            .with_option("bogus", json!(1))
            .with_option("zzz", json!(1));
        assert_eq!(config.check_options(&["app", "zzz"]), Err(OptionRejection::unknown("bogus")));
        assert!(BackendConfig::new().check_options(&[]).is_ok());
    }

    #[test]
    fn test_typed_options() {
        let config = BackendConfig::new()
            .with_option("index_names", json!(["a", "b"]))
            .with_option("table", json!("T"))
            .with_option("bad", json!(3));
        assert_eq!(
            config.strings_option("index_names").unwrap(),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(
            config.strings_option("table").unwrap(),
            Some(vec!["T".to_string()])
        );
        assert_eq!(config.string_option("missing").unwrap(), None);
        assert_eq!(config.string_option("bad").unwrap_err().key, "bad");
    }
}
