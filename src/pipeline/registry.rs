//! Named pipeline catalogs and pipeline resolution.
//!
//! The orchestrator only sees a [`PipelineCatalog`]. [`PipelineRegistry`] is an
//! explicit registration table filled at startup; [`DirectoryCatalog`] loads a
//! directory of pipeline files on first use and keeps the result for the life
//! of the process.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{ConvertError, PipelineError};

use super::{builtin, ProcessingPipeline};

type Result<T> = std::result::Result<T, PipelineError>;

/// Entry of a pipeline listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineInfo {
    pub name: String,
    /// Display name of the pipeline, or its key when it has none.
    pub description: String,
}

/// A source of named processing pipelines.
pub trait PipelineCatalog: Send + Sync {
    /// All pipelines, ordered by key.
    fn entries(&self) -> Result<Vec<(&str, &ProcessingPipeline)>>;

    fn lookup(&self, name: &str) -> Result<Option<&ProcessingPipeline>>;
}

/// Registration table of named pipelines, hashed by key.
#[derive(Debug, Clone, Default)]
pub struct PipelineRegistry {
    pipelines: HashMap<String, ProcessingPipeline>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the bundled pipelines.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for (key, source) in builtin::SOURCES {
            match ProcessingPipeline::from_yaml(source) {
                Ok(pipeline) => registry.register(*key, pipeline),
                Err(e) => warn!(pipeline = %key, error = %e, "skipping bundled pipeline"),
            }
        }
        registry
    }

    /// Load every `*.yml` / `*.yaml` file of a directory, keyed by file stem.
    ///
    /// # Errors
    /// Returns an error if the directory or a file cannot be read, or a file
    /// is not a valid pipeline.
    pub fn load_dir(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let io_error = |source| PipelineError::Io {
            path: path.display().to_string(),
            source,
        };

        let mut files = Vec::new();
        for entry in fs::read_dir(path).map_err(io_error)? {
            let file = entry.map_err(io_error)?.path();
            let is_yaml = matches!(
                file.extension().and_then(|e| e.to_str()),
                Some("yml") | Some("yaml")
            );
            if is_yaml && file.is_file() {
                files.push(file);
            }
        }
        files.sort();

        let mut registry = Self::new();
        for file in files {
            let Some(key) = file.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let text = fs::read_to_string(&file).map_err(|source| PipelineError::Io {
                path: file.display().to_string(),
                source,
            })?;
            let pipeline = ProcessingPipeline::from_yaml(&text).map_err(|e| {
                PipelineError::Invalid(format!("{}: {e}", file.display()))
            })?;
            debug!(pipeline = %key, "loaded pipeline file");
            registry.register(key, pipeline);
        }
        Ok(registry)
    }

    /// Register a pipeline, replacing any pipeline with the same key.
    pub fn register(&mut self, key: impl Into<String>, pipeline: ProcessingPipeline) {
        self.pipelines.insert(key.into(), pipeline);
    }

    pub fn get(&self, key: &str) -> Option<&ProcessingPipeline> {
        self.pipelines.get(key)
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.pipelines.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}

impl PipelineCatalog for PipelineRegistry {
    fn entries(&self) -> Result<Vec<(&str, &ProcessingPipeline)>> {
        let mut entries: Vec<(&str, &ProcessingPipeline)> = self
            .pipelines
            .iter()
            .map(|(key, pipeline)| (key.as_str(), pipeline))
            .collect();
        entries.sort_unstable_by_key(|(key, _)| *key);
        Ok(entries)
    }

    fn lookup(&self, name: &str) -> Result<Option<&ProcessingPipeline>> {
        Ok(self.get(name))
    }
}

/// A catalog discovered from a directory on first access.
///
/// Discovery runs at most once; a failure is remembered and reported on every
/// later access.
#[derive(Debug)]
pub struct DirectoryCatalog {
    dir: PathBuf,
    loaded: OnceLock<std::result::Result<PipelineRegistry, String>>,
}

impl DirectoryCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            loaded: OnceLock::new(),
        }
    }

    fn registry(&self) -> Result<&PipelineRegistry> {
        self.loaded
            .get_or_init(|| PipelineRegistry::load_dir(&self.dir).map_err(|e| e.to_string()))
            .as_ref()
            .map_err(|e| PipelineError::Discovery(e.clone()))
    }
}

impl PipelineCatalog for DirectoryCatalog {
    fn entries(&self) -> Result<Vec<(&str, &ProcessingPipeline)>> {
        self.registry()?.entries()
    }

    fn lookup(&self, name: &str) -> Result<Option<&ProcessingPipeline>> {
        Ok(self.registry()?.get(name))
    }
}

/// List the pipelines of a catalog, optionally restricted to those usable with
/// `backend`.
///
/// Discovery failures yield an empty list.
pub fn list_pipelines(catalog: &dyn PipelineCatalog, backend: Option<&str>) -> Vec<PipelineInfo> {
    let entries = match catalog.entries() {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, "pipeline discovery failed, listing no pipelines");
            return Vec::new();
        }
    };

    entries
        .into_iter()
        .filter(|(_, pipeline)| backend.map_or(true, |b| pipeline.allows_backend(b)))
        .map(|(key, pipeline)| PipelineInfo {
            name: key.to_string(),
            description: pipeline.name.clone().unwrap_or_else(|| key.to_string()),
        })
        .collect()
}

/// Resolve named and inline pipelines into one pipeline.
///
/// Named pipelines come first, in the given order, followed by the inline
/// definitions in the given order. Returns `None` when there is nothing to
/// compose. Blank inline sources are skipped.
///
/// # Errors
/// - [`ConvertError::PipelineResolution`] listing every unknown name
/// - [`ConvertError::PipelineDefinition`] for the first inline source that
///   does not parse, with its 1-based position
pub fn resolve(
    catalog: &dyn PipelineCatalog,
    names: &[String],
    inline_sources: &[String],
) -> std::result::Result<Option<ProcessingPipeline>, ConvertError> {
    let mut resolved: Vec<ProcessingPipeline> = Vec::with_capacity(names.len() + inline_sources.len());
    let mut unresolved = Vec::new();

    for name in names {
        match catalog.lookup(name) {
            Ok(Some(pipeline)) => resolved.push(pipeline.clone()),
            Ok(None) => unresolved.push(name.clone()),
            Err(e) => {
                warn!(pipeline = %name, error = %e, "pipeline discovery failed");
                unresolved.push(name.clone());
            }
        }
    }

    if !unresolved.is_empty() {
        let available = catalog
            .entries()
            .map(|entries| entries.into_iter().map(|(key, _)| key.to_string()).collect())
            .unwrap_or_default();
        return Err(ConvertError::PipelineResolution {
            unresolved,
            available,
        });
    }

    for (position, source) in inline_sources.iter().enumerate() {
        if source.trim().is_empty() {
            continue;
        }
        let pipeline = ProcessingPipeline::from_yaml(source).map_err(|source| {
            ConvertError::PipelineDefinition {
                index: position + 1,
                source,
            }
        })?;
        resolved.push(pipeline);
    }

    Ok(resolved.into_iter().reduce(|acc, next| acc.concat(&next)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn restricted(backend: &str, name: &str) -> ProcessingPipeline {
        ProcessingPipeline {
            name: Some(name.to_string()),
            allowed_backends: Some(BTreeSet::from([backend.to_string()])),
            ..Default::default()
        }
    }

    fn registry() -> PipelineRegistry {
        let mut registry = PipelineRegistry::new();
        registry.register("x_only", restricted("x", "X pipeline"));
        registry.register("generic", ProcessingPipeline::default());
        registry
    }

    struct BrokenCatalog;

    impl PipelineCatalog for BrokenCatalog {
        fn entries(&self) -> Result<Vec<(&str, &ProcessingPipeline)>> {
            Err(PipelineError::Discovery("boom".to_string()))
        }

        fn lookup(&self, _name: &str) -> Result<Option<&ProcessingPipeline>> {
            Err(PipelineError::Discovery("boom".to_string()))
        }
    }

    #[test]
    fn test_listing_filters_by_backend() {
        let registry = registry();
        let names = |backend| -> Vec<String> {
            list_pipelines(&registry, backend)
                .into_iter()
                .map(|p| p.name)
                .collect()
        };
        assert_eq!(names(None), vec!["generic", "x_only"]);
        assert_eq!(names(Some("x")), vec!["generic", "x_only"]);
        assert_eq!(names(Some("y")), vec!["generic"]);
    }

    #[test]
    fn test_description_falls_back_to_key() {
        let listing = list_pipelines(&registry(), None);
        assert_eq!(listing[0].description, "generic");
        assert_eq!(listing[1].description, "X pipeline");
    }

    #[test]
    fn test_listing_degrades_to_empty() {
        assert!(list_pipelines(&BrokenCatalog, None).is_empty());
    }

    #[test]
    fn test_resolve_nothing() {
        assert!(resolve(&registry(), &[], &[]).unwrap().is_none());
        assert!(resolve(&registry(), &[], &["  \n".to_string()]).unwrap().is_none());
    }

    #[test]
    fn test_resolve_reports_all_unknown_names() {
        let names = vec![
            "nope".to_string(),
            "generic".to_string(),
            "missing".to_string(),
        ];
        match resolve(&registry(), &names, &[]) {
            Err(ConvertError::PipelineResolution {
                unresolved,
                available,
            }) => {
                assert_eq!(unresolved, vec!["nope", "missing"]);
                assert_eq!(available, vec!["generic", "x_only"]);
            }
            other => panic!("Expected PipelineResolution, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_with_broken_discovery() {
        let err = resolve(&BrokenCatalog, &["any".to_string()], &[]).unwrap_err();
        assert!(matches!(
            err,
            ConvertError::PipelineResolution { ref available, .. } if available.is_empty()
        ));
    }

    #[test]
    fn test_resolve_inline_definition_error_has_index() {
        let inline = vec![
            "name: ok".to_string(),
            "transformations: [{type: nope}]".to_string(),
        ];
        match resolve(&registry(), &[], &inline) {
            Err(ConvertError::PipelineDefinition { index, source }) => {
                assert_eq!(index, 2);
                assert!(matches!(source, PipelineError::UnknownTransformation(_)));
            }
            other => panic!("Expected PipelineDefinition, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_named_before_inline() {
        let inline = vec!["name: inline".to_string()];
        let pipeline = resolve(&registry(), &["x_only".to_string()], &inline)
            .unwrap()
            .unwrap();
        assert_eq!(pipeline.name.as_deref(), Some("X pipeline + inline"));
    }

    #[test]
    fn test_load_dir_and_directory_catalog() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("custom.yml"),
            "name: Custom\nallowed_backends: [splunk]\n",
        )
        .unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let registry = PipelineRegistry::load_dir(dir.path()).unwrap();
        assert_eq!(registry.keys(), vec!["custom"]);

        let catalog = DirectoryCatalog::new(dir.path());
        assert!(catalog.lookup("custom").unwrap().is_some());
        assert_eq!(list_pipelines(&catalog, Some("kusto")), Vec::new());
    }

    #[test]
    fn test_directory_catalog_failure_is_remembered() {
        let catalog = DirectoryCatalog::new("/nonexistent/sigma-convert/pipelines");
        assert!(matches!(catalog.entries(), Err(PipelineError::Discovery(_))));
        assert!(matches!(catalog.lookup("x"), Err(PipelineError::Discovery(_))));
    }

    #[test]
    fn test_builtins_all_parse() {
        let registry = PipelineRegistry::with_builtins();
        assert_eq!(registry.len(), builtin::SOURCES.len());
    }
}
