//! Behavioral properties every conversion must satisfy.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use sigma_convert::output::BackendOutput;
use sigma_convert::pipeline::registry::{list_pipelines, resolve};
use sigma_convert::rule::merge_filter;
use sigma_convert::{
    Backend, BackendConfig, BackendDescriptor, BackendRegistry, ConversionOutput,
    ConversionRequest, ConvertError, Converter, ConverterConfig, FormatInfo, OptionRejection,
    PipelineRegistry, ProcessingPipeline, RuleFailure, SigmaCollection,
};

fn fixture(name: &str) -> String {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("rules")
        .join(name);
    fs::read_to_string(&path).unwrap_or_else(|e| panic!("cannot read {}: {e}", path.display()))
}

/// Backend returning a fixed result selected by its `shape` option, whatever
/// the rules.
struct FixedBackend {
    shape: String,
}

const FIXED_FORMATS: &[FormatInfo] = &[FormatInfo::new("default", "Fixed output")];

impl FixedBackend {
    fn create(config: BackendConfig) -> Result<Box<dyn Backend>, OptionRejection> {
        config.check_options(&["shape"])?;
        let shape = config.string_option("shape")?.unwrap_or_default();
        Ok(Box::new(FixedBackend { shape }))
    }
}

impl Backend for FixedBackend {
    fn correlation_methods(&self) -> Option<&'static [FormatInfo]> {
        None
    }

    fn convert(&mut self, _: &SigmaCollection, _: &str, _: Option<&str>) -> BackendOutput {
        match self.shape.as_str() {
            "queries" => BackendOutput::Queries(vec!["a".to_string(), "b".to_string()]),
            "strings" => BackendOutput::Sequence(vec![json!("a"), json!("b")]),
            "objects" => BackendOutput::Sequence(vec![json!({"q": 1})]),
            "binary" => BackendOutput::Binary(vec![0, 159, 146, 150]),
            "other" => BackendOutput::Other(Box::new(42)),
            _ => BackendOutput::Text("q".to_string()),
        }
    }

    fn errors(&self) -> &[RuleFailure] {
        &[]
    }
}

fn fixed_converter() -> Converter {
    let mut backends = BackendRegistry::with_builtins();
    backends.register(BackendDescriptor {
        key: "fixed",
        name: "Fixed",
        language: "none",
        formats: FIXED_FORMATS,
        correlation_methods: None,
        factory: FixedBackend::create,
    });
    Converter::new(
        Arc::new(PipelineRegistry::with_builtins()),
        Arc::new(backends),
        ConverterConfig::default(),
    )
}

fn fixed(shape: &str) -> ConversionOutput {
    let request = ConversionRequest::new(fixture("network_connection.yml"), "fixed")
        .with_option("shape", json!(shape));
    fixed_converter().convert(&request).unwrap()
}

// P1
#[test]
fn test_conversion_is_deterministic() {
    let converter = Converter::with_builtins();
    let requests = [
        ConversionRequest::new(fixture("whoami_execution.yml"), "splunk")
            .with_pipelines(["sysmon", "splunk_windows"])
            .with_filter(fixture("exclude_admin_hosts.yml")),
        ConversionRequest::new(fixture("whoami_execution.yml"), "lucene")
            .with_pipeline("ecs_windows")
            .with_output_format("siem_rule"),
        ConversionRequest::new(fixture("mixed_support.yml"), "kusto")
            .with_pipeline("microsoft_xdr")
            .with_skip_unsupported(true),
    ];

    for request in &requests {
        let first = converter.convert(request).unwrap();
        let second = converter.convert(request).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    let parallel = converter.convert_multi(&requests[0], &["splunk", "lucene", "kusto"]);
    let again = converter.convert_multi(&requests[0], &["splunk", "lucene", "kusto"]);
    for (target, result) in &parallel {
        assert_eq!(
            result.as_ref().ok(),
            again[target].as_ref().ok(),
            "target {target}"
        );
    }
}

// P2
#[test]
fn test_pipeline_order_is_significant() {
    let first = "name: first\ntransformations:\n  - type: field_name_mapping\n    mapping:\n      Image: ProcessPath\n";
    let second = "name: second\ntransformations:\n  - type: field_name_mapping\n    mapping:\n      ProcessPath: process.executable\n";
    let mut registry = PipelineRegistry::new();
    registry.register("first", ProcessingPipeline::from_yaml(first).unwrap());
    registry.register("second", ProcessingPipeline::from_yaml(second).unwrap());

    let names = |order: [&str; 2]| order.map(str::to_string).to_vec();
    let forward = resolve(&registry, &names(["first", "second"]), &[]).unwrap().unwrap();
    let backward = resolve(&registry, &names(["second", "first"]), &[]).unwrap().unwrap();
    assert_eq!(forward.items.len(), backward.items.len());

    let collection = SigmaCollection::from_yaml(&fixture("whoami_execution.yml")).unwrap();
    let rule = &collection.rules[0];
    let forward = forward.apply(rule).rule;
    let backward = backward.apply(rule).rule;
    assert_ne!(forward, backward);

    let converter = Converter::new(
        Arc::new(registry),
        Arc::new(BackendRegistry::with_builtins()),
        ConverterConfig::default(),
    );
    let convert = |order: [&str; 2]| {
        let request = ConversionRequest::new(fixture("whoami_execution.yml"), "lucene").with_pipelines(order);
        converter.convert(&request).unwrap().into_text().unwrap()
    };
    assert!(convert(["first", "second"]).starts_with(r"process.executable:*\\whoami.exe"));
    assert!(convert(["second", "first"]).starts_with(r"ProcessPath:*\\whoami.exe"));
}

// P3
#[test]
fn test_filter_merge_equals_concatenation() {
    let rule = fixture("whoami_execution.yml");
    let filter = fixture("exclude_admin_hosts.yml");

    let concatenated = format!("{filter}\n---\n{rule}");
    assert_eq!(merge_filter(&filter, &rule), concatenated);
    assert_eq!(
        SigmaCollection::from_yaml(&merge_filter(&filter, &rule)).unwrap(),
        SigmaCollection::from_yaml(&concatenated).unwrap()
    );

    let converter = Converter::with_builtins();
    for target in ["splunk", "lucene"] {
        let with_filter = converter
            .convert(&ConversionRequest::new(rule.as_str(), target).with_filter(filter.as_str()))
            .unwrap();
        let direct = converter
            .convert(&ConversionRequest::new(concatenated.as_str(), target))
            .unwrap();
        assert_eq!(with_filter, direct, "target {target}");
    }
}

// P4
#[test]
fn test_unknown_backend_lists_valid_keys() {
    for converter in [Converter::with_builtins(), fixed_converter()] {
        let expected: Vec<String> = converter.backends().into_iter().map(|b| b.key.to_string()).collect();
        match converter.convert(&ConversionRequest::new(fixture("network_connection.yml"), "qradar")) {
            Err(ConvertError::UnknownBackend { target, available }) => {
                assert_eq!(target, "qradar");
                assert_eq!(available, expected);
            }
            other => panic!("Expected UnknownBackend, got {other:?}"),
        }
    }
}

// P5
#[test]
fn test_undeclared_format_is_rejected() {
    let request = ConversionRequest::new(fixture("network_connection.yml"), "fixed")
        .with_output_format("anything");
    assert!(matches!(
        fixed_converter().convert(&request),
        Err(ConvertError::UnsupportedFormat { ref format, .. }) if format == "anything"
    ));

    let request = ConversionRequest::new(fixture("network_connection.yml"), "splunk")
        .with_output_format("dsl_lucene");
    assert!(matches!(
        Converter::with_builtins().convert(&request),
        Err(ConvertError::UnsupportedFormat { .. })
    ));
}

// P6
#[test]
fn test_skip_unsupported_policy() {
    let converter = Converter::with_builtins();
    let request = ConversionRequest::new(fixture("mixed_support.yml"), "splunk");

    match converter.convert(&request) {
        Err(err @ ConvertError::Conversion { .. }) => {
            let message = err.to_string();
            assert!(message.contains("'Suspicious Regex Command Line'"));
            assert!(!message.contains("'Encoded PowerShell'"));
            assert!(!message.contains("'Certutil Download'"));
        }
        other => panic!("Expected Conversion error, got {other:?}"),
    }

    let output = converter
        .convert(&request.with_skip_unsupported(true))
        .unwrap();
    let text = output.into_text().unwrap();
    let queries: Vec<&str> = text.split("\n\n").collect();
    assert_eq!(
        queries,
        vec![
            r#"Image="*\\powershell.exe" CommandLine IN ("* -enc *", "* -EncodedCommand *")"#,
            r#"Image="*\\certutil.exe" CommandLine="*urlcache*" CommandLine="*http*""#,
        ]
    );
}

// P7
#[test]
fn test_result_shaping() {
    assert_eq!(fixed("queries"), ConversionOutput::Text("a\n\nb".to_string()));
    assert_eq!(fixed("text"), ConversionOutput::Text("q".to_string()));
    assert_eq!(fixed("strings"), ConversionOutput::Text("a\n\nb".to_string()));
    assert_eq!(fixed("objects"), ConversionOutput::Structured(json!([{"q": 1}])));
    assert_eq!(fixed("binary"), ConversionOutput::Binary(vec![0, 159, 146, 150]));
    assert_eq!(fixed("other"), ConversionOutput::Text("42".to_string()));
}

// P8
#[test]
fn test_pipeline_listing_filter() {
    let mut registry = PipelineRegistry::new();
    registry.register(
        "only_x",
        ProcessingPipeline::from_yaml("name: Only X\nallowed_backends: [x]\ntransformations: []\n").unwrap(),
    );
    registry.register("anywhere", ProcessingPipeline::new());

    let names = |backend: Option<&str>| -> Vec<String> {
        list_pipelines(&registry, backend).into_iter().map(|p| p.name).collect()
    };
    assert_eq!(names(Some("y")), vec!["anywhere"]);
    assert_eq!(names(Some("x")), vec!["anywhere", "only_x"]);
    assert_eq!(names(None), vec!["anywhere", "only_x"]);
}
