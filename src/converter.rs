//! Conversion orchestrator.
//!
//! A [`Converter`] turns one [`ConversionRequest`] into one
//! [`ConversionOutput`] or exactly one [`ConvertError`]. Every request runs
//! through the same stages, each of which aborts the request on failure:
//!
//! 1. merge the filter, if any, and parse the rule collection
//! 2. resolve named and inline pipelines
//! 3. look up and instantiate the backend
//! 4. validate the output format and correlation method
//! 5. convert
//! 6. apply the `skip_unsupported` error policy
//! 7. shape the backend result
//!
//! Registries are read-only after construction, so a converter can be shared
//! between threads and used for any number of concurrent requests.
//!
//! # Examples
//!
//! ```rust
//! use sigma_convert::{ConversionRequest, Converter};
//!
//! let rule = r#"
//! title: Whoami Execution
//! logsource:
//!     category: process_creation
//!     product: windows
//! detection:
//!     selection:
//!         Image|endswith: '\whoami.exe'
//!     condition: selection
//! "#;
//!
//! let converter = Converter::with_builtins();
//! let request = ConversionRequest::new(rule, "splunk").with_pipeline("sysmon");
//! let output = converter.convert(&request)?;
//! assert_eq!(
//!     output.as_text(),
//!     Some(r#"EventID=1 Image="*\\whoami.exe""#)
//! );
//! # Ok::<(), sigma_convert::ConvertError>(())
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, field, instrument, Span};

use crate::attack::{AttackData, EmptyAttackData};
use crate::backend::{BackendConfig, BackendOptions, BackendRegistry, FormatInfo};
use crate::config::ConverterConfig;
use crate::error::{ConvertError, Result};
use crate::output::{shape, ConversionOutput};
use crate::pipeline::registry::{list_pipelines, resolve};
use crate::pipeline::{PipelineCatalog, PipelineInfo, PipelineRegistry};
use crate::rule::{merge_filter, SigmaCollection};

/// Parameters of one conversion.
#[derive(Debug, Clone, Default)]
pub struct ConversionRequest {
    /// Rule document text, possibly a multi-document stream.
    pub rule: String,
    /// Backend key.
    pub target: String,
    /// Named pipelines, applied in this order.
    pub pipelines: Vec<String>,
    /// Inline pipeline definitions, applied after the named ones in this order.
    pub inline_pipelines: Vec<String>,
    /// Filter document prepended to the rule text.
    pub filter: Option<String>,
    /// Output format; the converter's default format when `None`.
    pub output_format: Option<String>,
    pub correlation_method: Option<String>,
    pub options: BackendOptions,
    /// Drop rules the backend cannot express instead of failing the request.
    pub skip_unsupported: bool,
}

impl ConversionRequest {
    pub fn new(rule: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            target: target.into(),
            ..Self::default()
        }
    }

    pub fn with_pipeline(mut self, name: impl Into<String>) -> Self {
        self.pipelines.push(name.into());
        self
    }

    pub fn with_pipelines<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pipelines.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn with_inline_pipeline(mut self, source: impl Into<String>) -> Self {
        self.inline_pipelines.push(source.into());
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_output_format(mut self, format: impl Into<String>) -> Self {
        self.output_format = Some(format.into());
        self
    }

    pub fn with_correlation_method(mut self, method: impl Into<String>) -> Self {
        self.correlation_method = Some(method.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    pub fn with_skip_unsupported(mut self, skip: bool) -> Self {
        self.skip_unsupported = skip;
        self
    }
}

/// Description of a registered backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendInfo {
    pub key: &'static str,
    pub name: &'static str,
    pub language: &'static str,
    pub formats: Vec<FormatInfo>,
    pub correlation_methods: Option<Vec<FormatInfo>>,
}

/// Conversion orchestrator over a pipeline catalog and a backend registry.
#[derive(Clone)]
pub struct Converter {
    pipelines: Arc<dyn PipelineCatalog>,
    backends: Arc<BackendRegistry>,
    config: ConverterConfig,
    attack: Arc<dyn AttackData>,
}

impl fmt::Debug for Converter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Converter")
            .field("backends", &self.backends.keys())
            .field("config", &self.config)
            .field("attack", &self.attack)
            .finish_non_exhaustive()
    }
}

impl Converter {
    pub fn new(
        pipelines: Arc<dyn PipelineCatalog>,
        backends: Arc<BackendRegistry>,
        config: ConverterConfig,
    ) -> Self {
        Self {
            pipelines,
            backends,
            config,
            attack: Arc::new(EmptyAttackData),
        }
    }

    /// Create a converter over the bundled pipelines and backends.
    pub fn with_builtins() -> Self {
        Self::new(
            Arc::new(PipelineRegistry::with_builtins()),
            Arc::new(BackendRegistry::with_builtins()),
            ConverterConfig::default(),
        )
    }

    /// Use the given ATT&CK data for backends that emit threat metadata.
    pub fn with_attack_data(mut self, attack: Arc<dyn AttackData>) -> Self {
        self.attack = attack;
        self
    }

    /// Process-wide converter over the bundled pipelines and backends.
    ///
    /// Built on first access and never torn down.
    pub fn global() -> &'static Converter {
        static GLOBAL: OnceLock<Converter> = OnceLock::new();
        GLOBAL.get_or_init(Converter::with_builtins)
    }

    pub fn config(&self) -> &ConverterConfig {
        &self.config
    }

    /// Convert one request.
    ///
    /// # Errors
    /// Returns the error of the first stage that fails; see [`ConvertError`].
    #[instrument(
        name = "convert",
        skip_all,
        fields(target = %request.target, format = field::Empty)
    )]
    pub fn convert(&self, request: &ConversionRequest) -> Result<ConversionOutput> {
        self.convert_target(request, &request.target)
    }

    /// Convert one request for several backends; `request.target` is ignored.
    ///
    /// Targets are converted on the rayon pool when parallelism is enabled and
    /// there are enough of them. Every target gets its own result.
    pub fn convert_multi(
        &self,
        request: &ConversionRequest,
        targets: &[&str],
    ) -> BTreeMap<String, Result<ConversionOutput>> {
        let parallel = &self.config.parallel;
        let convert_one = |target: &&str| {
            let span = tracing::debug_span!("convert", target = %target, format = field::Empty);
            let _entered = span.enter();
            (target.to_string(), self.convert_target(request, target))
        };

        if parallel.enable_parallel_multi && targets.len() >= parallel.min_targets_for_parallelism {
            targets.par_iter().map(convert_one).collect()
        } else {
            targets.iter().map(convert_one).collect()
        }
    }

    /// Pipelines of the catalog, restricted to those usable with `backend`.
    ///
    /// Never fails; a catalog that cannot be read lists nothing.
    pub fn list_pipelines(&self, backend: Option<&str>) -> Vec<PipelineInfo> {
        list_pipelines(self.pipelines.as_ref(), backend)
    }

    /// Registered backends, sorted by key.
    pub fn backends(&self) -> Vec<BackendInfo> {
        self.backends
            .descriptors()
            .into_iter()
            .map(|d| BackendInfo {
                key: d.key,
                name: d.name,
                language: d.language,
                formats: d.formats.to_vec(),
                correlation_methods: d.correlation_methods.map(<[FormatInfo]>::to_vec),
            })
            .collect()
    }

    fn convert_target(&self, request: &ConversionRequest, target: &str) -> Result<ConversionOutput> {
        let format = request
            .output_format
            .as_deref()
            .unwrap_or(&self.config.default_output_format);
        Span::current().record("format", format);

        let result = self.run(request, target, format);
        match &result {
            Ok(_) => debug!(stage = "succeeded", "conversion finished"),
            Err(e) => debug!(stage = "failed", kind = ?e.kind(), error = %e, "conversion failed"),
        }
        result
    }

    fn run(&self, request: &ConversionRequest, target: &str, format: &str) -> Result<ConversionOutput> {
        let collection = self.parse(request)?;
        debug!(
            stage = "parsed",
            rules = collection.rules.len(),
            correlations = collection.correlations.len(),
        );

        let pipeline = resolve(
            self.pipelines.as_ref(),
            &request.pipelines,
            &request.inline_pipelines,
        )?;
        debug!(
            stage = "pipeline_resolved",
            items = pipeline.as_ref().map_or(0, |p| p.items.len()),
        );

        let descriptor = self.backends.lookup(target)?;
        let config = BackendConfig {
            collect_errors: request.skip_unsupported,
            pipeline,
            options: request.options.clone(),
            attack: Arc::clone(&self.attack),
        };
        let mut backend = descriptor.instantiate(config).map_err(|rejection| {
            debug!(option = %rejection.key, reason = %rejection.reason, "backend rejected option");
            ConvertError::UnsupportedOption {
                key: rejection.key,
                backend: descriptor.key.to_string(),
            }
        })?;

        if !descriptor.supports_format(format) {
            return Err(ConvertError::UnsupportedFormat {
                format: format.to_string(),
                backend: descriptor.key.to_string(),
                available: crate::backend::format_names(descriptor.formats),
            });
        }
        if let Some(method) = request.correlation_method.as_deref() {
            let methods = backend
                .correlation_methods()
                .ok_or_else(|| ConvertError::CorrelationUnsupported {
                    backend: descriptor.key.to_string(),
                })?;
            if !methods.iter().any(|m| m.name == method) {
                return Err(ConvertError::UnknownCorrelationMethod {
                    method: method.to_string(),
                    backend: descriptor.key.to_string(),
                    available: crate::backend::format_names(methods),
                });
            }
        }
        debug!(stage = "backend_ready", backend = descriptor.key);

        let output = backend.convert(&collection, format, request.correlation_method.as_deref());
        let failures = backend.errors();
        debug!(stage = "converted", failures = failures.len());

        if !failures.is_empty() {
            if !request.skip_unsupported {
                return Err(ConvertError::Conversion {
                    failures: failures.to_vec(),
                });
            }
            for failure in failures {
                debug!(rule = %failure.source, reason = %failure.message, "skipping unsupported rule");
            }
        }

        Ok(shape(output))
    }

    fn parse(&self, request: &ConversionRequest) -> Result<SigmaCollection> {
        let limits = &self.config.limits;
        match request.filter.as_deref().filter(|f| !f.trim().is_empty()) {
            Some(filter) => {
                let merged = merge_filter(filter, &request.rule);
                SigmaCollection::from_yaml_with_limits(&merged, limits).map_err(|source| {
                    ConvertError::FilterMerge {
                        fragment: source.fragment().unwrap_or(&merged).to_string(),
                        source,
                    }
                })
            }
            None => SigmaCollection::from_yaml_with_limits(&request.rule, limits).map_err(|source| {
                ConvertError::RuleParse {
                    fragment: source.fragment().unwrap_or(&request.rule).to_string(),
                    source,
                }
            }),
        }
    }
}
