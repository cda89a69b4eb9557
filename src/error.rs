//! Error types for the sigma-convert crate.
//!
//! Three layers of errors exist:
//! - [`RuleError`] for failures while reading rule documents,
//! - [`PipelineError`] for failures while reading processing pipelines,
//! - [`ConvertError`] for the terminal failure of one conversion request.
//!
//! Per-rule lowering problems collected by a backend are recorded as
//! [`RuleFailure`] values and only become a [`ConvertError::Conversion`] when
//! unsupported rules are not skipped.

use std::fmt;

use thiserror::Error;

use crate::rule::RuleSource;

pub type Result<T> = std::result::Result<T, ConvertError>;

/// Errors raised while parsing SIGMA rule documents.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("document is not a YAML mapping")]
    NotAMapping,

    #[error("missing required field '{0}'")]
    MissingField(String),

    #[error("invalid detection: {0}")]
    InvalidDetection(String),

    #[error("condition error: {0}")]
    Condition(String),

    #[error("unknown modifier '{0}'")]
    UnknownModifier(String),

    #[error("invalid correlation rule: {0}")]
    InvalidCorrelation(String),

    #[error("invalid timespan '{0}'")]
    InvalidTimespan(String),

    #[error("unknown collection action '{0}'")]
    InvalidAction(String),

    #[error("no rules found in input")]
    EmptyCollection,

    #[error("input of {size} bytes exceeds the limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },

    #[error("input contains {count} documents, the limit is {limit}")]
    TooManyDocuments { count: usize, limit: usize },

    #[error("document {index}: {source}")]
    Document {
        index: usize,
        fragment: String,
        #[source]
        source: Box<RuleError>,
    },
}

impl RuleError {
    /// Wrap an error with the position and text of the document it came from.
    pub(crate) fn in_document(self, index: usize, fragment: &str) -> Self {
        match self {
            err @ RuleError::Document { .. } => err,
            other => RuleError::Document {
                index,
                fragment: fragment.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Source text of the offending document, when known.
    pub fn fragment(&self) -> Option<&str> {
        match self {
            RuleError::Document { fragment, .. } => Some(fragment),
            _ => None,
        }
    }
}

/// Errors raised while reading or loading processing pipelines.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid pipeline: {0}")]
    Invalid(String),

    #[error("unknown transformation type '{0}'")]
    UnknownTransformation(String),

    #[error("unknown condition type '{0}'")]
    UnknownCondition(String),

    #[error("invalid regex in pipeline: {0}")]
    Regex(#[from] regex::Error),

    #[error("cannot read pipeline file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("pipeline discovery failed: {0}")]
    Discovery(String),
}

/// A rule that a backend could not express in its target language.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleFailure {
    pub source: RuleSource,
    pub message: String,
}

impl RuleFailure {
    pub fn new(source: RuleSource, message: impl Into<String>) -> Self {
        Self {
            source,
            message: message.into(),
        }
    }
}

impl fmt::Display for RuleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.source, self.message)
    }
}

/// Stable classification of a [`ConvertError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    RuleParse,
    FilterMerge,
    PipelineResolution,
    PipelineDefinition,
    UnknownBackend,
    UnsupportedOption,
    UnsupportedFormat,
    CorrelationUnsupported,
    UnknownCorrelationMethod,
    Conversion,
}

/// Terminal failure of a conversion request.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("Rule parse error: {source}")]
    RuleParse { fragment: String, source: RuleError },

    #[error("Filter processing error: {source}")]
    FilterMerge { fragment: String, source: RuleError },

    #[error(
        "Error loading pipelines [{}]: not found. Available: [{}]",
        .unresolved.join(", "),
        .available.join(", ")
    )]
    PipelineResolution {
        unresolved: Vec<String>,
        available: Vec<String>,
    },

    #[error("Error processing custom pipeline #{index}: {source}")]
    PipelineDefinition { index: usize, source: PipelineError },

    #[error(
        "Backend '{target}' is not installed or does not exist. Available: [{}]",
        .available.join(", ")
    )]
    UnknownBackend {
        target: String,
        available: Vec<String>,
    },

    #[error("Parameter '{key}' is not supported by backend '{backend}'.")]
    UnsupportedOption { key: String, backend: String },

    #[error(
        "Output format '{format}' is not supported by backend '{backend}'. Available: [{}]",
        .available.join(", ")
    )]
    UnsupportedFormat {
        format: String,
        backend: String,
        available: Vec<String>,
    },

    #[error("Backend '{backend}' does not support correlations.")]
    CorrelationUnsupported { backend: String },

    #[error(
        "Correlation method '{method}' is not supported by backend '{backend}'. Available: [{}]",
        .available.join(", ")
    )]
    UnknownCorrelationMethod {
        method: String,
        backend: String,
        available: Vec<String>,
    },

    #[error("{}", join_failures(.failures))]
    Conversion { failures: Vec<RuleFailure> },
}

impl ConvertError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConvertError::RuleParse { .. } => ErrorKind::RuleParse,
            ConvertError::FilterMerge { .. } => ErrorKind::FilterMerge,
            ConvertError::PipelineResolution { .. } => ErrorKind::PipelineResolution,
            ConvertError::PipelineDefinition { .. } => ErrorKind::PipelineDefinition,
            ConvertError::UnknownBackend { .. } => ErrorKind::UnknownBackend,
            ConvertError::UnsupportedOption { .. } => ErrorKind::UnsupportedOption,
            ConvertError::UnsupportedFormat { .. } => ErrorKind::UnsupportedFormat,
            ConvertError::CorrelationUnsupported { .. } => ErrorKind::CorrelationUnsupported,
            ConvertError::UnknownCorrelationMethod { .. } => ErrorKind::UnknownCorrelationMethod,
            ConvertError::Conversion { .. } => ErrorKind::Conversion,
        }
    }
}

fn join_failures(failures: &[RuleFailure]) -> String {
    failures
        .iter()
        .map(|failure| failure.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}
