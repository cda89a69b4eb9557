//! Converter configuration.
//!
//! Configuration is plain data with sensible defaults, grouped by concern:
//! input limits applied while parsing rule streams, and the parallelism used
//! when one request is converted for several backends.

/// The canonical output format name every backend is expected to declare.
pub const DEFAULT_OUTPUT_FORMAT: &str = "default";

/// Limits on rule input accepted by a conversion request.
///
/// # Examples
///
/// ```rust
/// use sigma_convert::LimitsConfig;
///
/// // Tight limits for an endpoint accepting user-submitted rules
/// let limits = LimitsConfig {
///     max_input_bytes: 64 * 1024,
///     max_documents: 16,
/// };
/// assert!(limits.max_documents < LimitsConfig::default().max_documents);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitsConfig {
    /// Maximum size of the rule text (filter included), in bytes.
    ///
    /// **Default**: 16MB
    pub max_input_bytes: usize,

    /// Maximum number of non-blank YAML documents in one stream.
    ///
    /// **Default**: 10000
    pub max_documents: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_input_bytes: 16 * 1024 * 1024, // 16MB
            max_documents: 10_000,
        }
    }
}

/// Parallelism of multi-backend conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelConfig {
    /// Convert targets of a multi-backend request on the rayon pool.
    pub enable_parallel_multi: bool,
    /// Minimum number of targets before the rayon pool is used.
    pub min_targets_for_parallelism: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            enable_parallel_multi: true,
            min_targets_for_parallelism: 2,
        }
    }
}

/// Configuration of a [`Converter`](crate::Converter).
///
/// # Example
/// ```rust
/// use sigma_convert::ConverterConfig;
///
/// let config = ConverterConfig::new()
///     .with_max_input_bytes(1024 * 1024)
///     .with_parallel_multi(false);
/// assert_eq!(config.limits.max_input_bytes, 1024 * 1024);
/// assert!(!config.parallel.enable_parallel_multi);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConverterConfig {
    /// Output format used when a request does not name one.
    pub default_output_format: String,
    /// Input limits
    pub limits: LimitsConfig,
    /// Multi-backend parallelism
    pub parallel: ParallelConfig,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            default_output_format: DEFAULT_OUTPUT_FORMAT.to_string(),
            limits: LimitsConfig::default(),
            parallel: ParallelConfig::default(),
        }
    }
}

impl ConverterConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration for services converting untrusted input.
    pub fn strict() -> Self {
        Self {
            limits: LimitsConfig {
                max_input_bytes: 1024 * 1024, // 1MB
                max_documents: 100,
            },
            parallel: ParallelConfig {
                enable_parallel_multi: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn with_default_output_format(mut self, format: impl Into<String>) -> Self {
        self.default_output_format = format.into();
        self
    }

    pub fn with_max_input_bytes(mut self, bytes: usize) -> Self {
        self.limits.max_input_bytes = bytes;
        self
    }

    pub fn with_max_documents(mut self, documents: usize) -> Self {
        self.limits.max_documents = documents;
        self
    }

    pub fn with_parallel_multi(mut self, enable: bool) -> Self {
        self.parallel.enable_parallel_multi = enable;
        self
    }

    pub fn with_min_targets_for_parallelism(mut self, min_targets: usize) -> Self {
        self.parallel.min_targets_for_parallelism = min_targets;
        self
    }
}
