//! # SIGMA Rule Converter
//!
//! A Rust library for translating [SIGMA detection rules](https://github.com/SigmaHQ/sigma)
//! into the query languages of SIEM and EDR products.
//!
//! A conversion parses a rule document (optionally merged with a filter
//! document), adapts it to the target environment with processing pipelines,
//! and lowers it with a backend into queries of the target language.
//!
//! ## Quick Start
//!
//! ### Basic Usage
//!
//! ```rust
//! use sigma_convert::{ConversionRequest, Converter};
//!
//! let rule_yaml = r#"
//! title: Windows Logon Failure
//! logsource:
//!     product: windows
//!     service: security
//! detection:
//!     selection:
//!         EventID: 4625
//!         LogonType: [2, 10]
//!     condition: selection
//! "#;
//!
//! let converter = Converter::with_builtins();
//! let output = converter.convert(&ConversionRequest::new(rule_yaml, "splunk"))?;
//! assert_eq!(output.as_text(), Some("EventID=4625 (LogonType=2 OR LogonType=10)"));
//! # Ok::<(), sigma_convert::ConvertError>(())
//! ```
//!
//! ### Pipelines and Output Formats
//!
//! ```rust
//! use sigma_convert::{ConversionRequest, Converter};
//!
//! let rule_yaml = r#"
//! title: Whoami Execution
//! level: high
//! logsource:
//!     category: process_creation
//!     product: windows
//! detection:
//!     selection:
//!         Image|endswith: '\whoami.exe'
//!     condition: selection
//! "#;
//!
//! let request = ConversionRequest::new(rule_yaml, "lucene")
//!     .with_pipeline("ecs_windows")
//!     .with_output_format("siem_rule");
//! let output = Converter::global().convert(&request)?;
//!
//! let rules = output.as_structured().and_then(|v| v.as_array()).unwrap();
//! assert_eq!(rules[0]["index"][0], "winlogbeat-*");
//! assert_eq!(rules[0]["severity"], "high");
//! # Ok::<(), sigma_convert::ConvertError>(())
//! ```
//!
//! ### Skipping Unsupported Rules
//!
//! By default a request fails as a whole when any rule cannot be expressed by
//! the backend. With `skip_unsupported` those rules are left out instead.
//!
//! ```rust
//! use sigma_convert::{ConversionRequest, Converter, ErrorKind};
//!
//! let rules = r#"
//! title: Supported
//! logsource:
//!     product: windows
//! detection:
//!     selection:
//!         EventID: 1
//!     condition: selection
//! ---
//! title: Regex
//! logsource:
//!     product: windows
//! detection:
//!     selection:
//!         CommandLine|re: 'a.*b'
//!     condition: selection
//! "#;
//!
//! let converter = Converter::with_builtins();
//! let request = ConversionRequest::new(rules, "splunk");
//! assert_eq!(converter.convert(&request).unwrap_err().kind(), ErrorKind::Conversion);
//!
//! let output = converter.convert(&request.with_skip_unsupported(true))?;
//! assert_eq!(output.as_text(), Some("EventID=1"));
//! # Ok::<(), sigma_convert::ConvertError>(())
//! ```

pub mod attack;
pub mod backend;
pub mod config;
pub mod converter;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod rule;

// Orchestrator
pub use converter::{BackendInfo, ConversionRequest, Converter};

// Configuration
pub use config::{ConverterConfig, LimitsConfig, ParallelConfig, DEFAULT_OUTPUT_FORMAT};

// Core types and errors
pub use error::{ConvertError, ErrorKind, PipelineError, Result, RuleError, RuleFailure};
pub use output::{BackendOutput, ConversionOutput};
pub use rule::{CorrelationRule, RuleSource, SigmaCollection, SigmaRule};

// Pipelines
pub use pipeline::{
    DirectoryCatalog, PipelineCatalog, PipelineInfo, PipelineRegistry, ProcessingPipeline,
};

// Backends
pub use backend::{
    Backend, BackendConfig, BackendDescriptor, BackendOptions, BackendRegistry, FormatInfo,
    OptionRejection,
};

// ATT&CK data
pub use attack::{AttackData, EmptyAttackData, StaticAttackData};
