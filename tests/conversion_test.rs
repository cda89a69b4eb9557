//! End-to-end tests of the conversion orchestrator.
//!
//! These tests drive complete requests through the bundled pipelines and
//! backends using the rule fixtures in `tests/rules/`.

use std::fs;
use std::path::Path;

use serde_json::json;
use sigma_convert::{ConversionRequest, ConvertError, Converter, ErrorKind};

fn fixture(name: &str) -> String {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("rules")
        .join(name);
    fs::read_to_string(&path).unwrap_or_else(|e| panic!("cannot read {}: {e}", path.display()))
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("sigma_convert=debug"))
        .with_test_writer()
        .try_init();
}

#[test]
fn test_splunk_with_windows_pipelines() -> anyhow::Result<()> {
    init_tracing();
    let request = ConversionRequest::new(fixture("whoami_execution.yml"), "splunk")
        .with_pipelines(["sysmon", "splunk_windows"]);
    let output = Converter::with_builtins().convert(&request)?;

    assert_eq!(
        output.as_text(),
        Some(
            r#"source="WinEventLog:Microsoft-Windows-Sysmon/Operational" EventID=1 Image="*\\whoami.exe" NOT User IN ("*AUTHORI*", "*AUTORI*")"#
        )
    );
    Ok(())
}

#[test]
fn test_lucene_with_ecs_pipeline() -> anyhow::Result<()> {
    let request =
        ConversionRequest::new(fixture("whoami_execution.yml"), "lucene").with_pipeline("ecs_windows");
    let output = Converter::with_builtins().convert(&request)?;

    assert_eq!(
        output.as_text(),
        Some(r"process.executable:*\\whoami.exe AND NOT user.name:(*AUTHORI* OR *AUTORI*)")
    );
    Ok(())
}

#[test]
fn test_kusto_with_xdr_pipeline() -> anyhow::Result<()> {
    let request = ConversionRequest::new(fixture("whoami_execution.yml"), "kusto")
        .with_pipeline("microsoft_xdr");
    let output = Converter::with_builtins().convert(&request)?;

    assert_eq!(
        output.as_text(),
        Some(
            "DeviceProcessEvents\n| where FolderPath endswith \"\\\\whoami.exe\" and not(AccountName contains \"AUTHORI\" or AccountName contains \"AUTORI\")"
        )
    );
    Ok(())
}

#[test]
fn test_filter_document_is_applied() -> anyhow::Result<()> {
    let request = ConversionRequest::new(fixture("whoami_execution.yml"), "splunk")
        .with_filter(fixture("exclude_admin_hosts.yml"));
    let output = Converter::with_builtins().convert(&request)?;

    let text = output.as_text().unwrap_or_default();
    assert!(text.starts_with(r#"Image="*\\whoami.exe""#));
    assert!(text.ends_with(r#"NOT ComputerName="ADM-*""#));
    Ok(())
}

#[test]
fn test_xdr_pipeline_failure_reported_per_rule() {
    let request = ConversionRequest::new(fixture("failed_logons.yml"), "kusto")
        .with_pipeline("microsoft_xdr");
    let err = Converter::with_builtins().convert(&request).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Conversion);
    assert!(err
        .to_string()
        .starts_with("document 1 'Failed Logon' (8d1c2f4e-3a5b-4c6d-9e7f-0a1b2c3d4e5f): "));
}

#[test]
fn test_correlation_with_splunk() -> anyhow::Result<()> {
    let request = ConversionRequest::new(fixture("failed_logons.yml"), "splunk")
        .with_correlation_method("stats");
    let output = Converter::with_builtins().convert(&request)?;

    assert_eq!(
        output.as_text(),
        Some(
            "EventID=4625\n| bin _time span=5m\n| stats count as event_count by _time, TargetUserName\n| search event_count >= 10"
        )
    );
    Ok(())
}

#[test]
fn test_correlation_without_backend_support() {
    let converter = Converter::with_builtins();
    let request = ConversionRequest::new(fixture("failed_logons.yml"), "lucene");

    match converter.convert(&request) {
        Err(ConvertError::Conversion { failures }) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].source.title, "Brute Force Against One Account");
        }
        other => panic!("Expected Conversion error, got {other:?}"),
    }

    let output = converter
        .convert(&request.with_skip_unsupported(true))
        .unwrap();
    assert_eq!(output.as_text(), Some("EventID:4625"));
}

#[test]
fn test_error_messages_are_displayable() {
    let converter = Converter::with_builtins();
    let rule = fixture("whoami_execution.yml");

    let err = converter
        .convert(&ConversionRequest::new(rule.as_str(), "qradar"))
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Backend 'qradar' is not installed or does not exist. Available: [kusto, lucene, splunk]"
    );

    let request = ConversionRequest::new(rule.as_str(), "splunk").with_pipelines(["foo", "sysmon", "bar"]);
    assert_eq!(
        converter.convert(&request).unwrap_err().to_string(),
        "Error loading pipelines [foo, bar]: not found. Available: [ecs_windows, microsoft_xdr, splunk_windows, sysmon, windows_audit]"
    );

    let request = ConversionRequest::new(rule.as_str(), "splunk").with_option("bogus", json!(true));
    assert_eq!(
        converter.convert(&request).unwrap_err().to_string(),
        "Parameter 'bogus' is not supported by backend 'splunk'."
    );

    let request = ConversionRequest::new(rule.as_str(), "splunk").with_output_format("siem_rule");
    assert_eq!(
        converter.convert(&request).unwrap_err().to_string(),
        "Output format 'siem_rule' is not supported by backend 'splunk'. Available: [default, savedsearches]"
    );

    let request = ConversionRequest::new(rule.as_str(), "kusto").with_correlation_method("stats");
    assert_eq!(
        converter.convert(&request).unwrap_err().to_string(),
        "Backend 'kusto' does not support correlations."
    );
}

#[test]
fn test_inline_pipeline_errors_carry_position() {
    let request = ConversionRequest::new(fixture("whoami_execution.yml"), "splunk")
        .with_inline_pipeline("transformations: []")
        .with_inline_pipeline("transformations:\n  - type: explode\n");

    match Converter::with_builtins().convert(&request) {
        Err(ConvertError::PipelineDefinition { index, .. }) => assert_eq!(index, 2),
        other => panic!("Expected PipelineDefinition, got {other:?}"),
    }
}

#[test]
fn test_parse_error_keeps_fragment() {
    let text = format!("{}\n---\ntitle: Broken\ndetection: 3\n", fixture("network_connection.yml"));
    match Converter::with_builtins().convert(&ConversionRequest::new(text, "splunk")) {
        Err(ConvertError::RuleParse { fragment, source }) => {
            assert!(fragment.contains("title: Broken"));
            assert!(source.to_string().starts_with("document 2: "));
        }
        other => panic!("Expected RuleParse, got {other:?}"),
    }
}

#[test]
fn test_multi_target_conversion() {
    let request = ConversionRequest::new(fixture("network_connection.yml"), "")
        .with_pipeline("sysmon")
        .with_option("query_table", json!("DeviceNetworkEvents"));
    let results = Converter::with_builtins().convert_multi(&request, &["kusto", "splunk"]);

    assert_eq!(
        results["kusto"].as_ref().ok().and_then(|o| o.as_text()),
        Some(
            "DeviceNetworkEvents\n| where EventID == 3 and (Image endswith \"\\\\winword.exe\" or Image endswith \"\\\\excel.exe\") and DestinationPort == 445"
        )
    );
    // Splunk does not accept the Kusto option.
    assert!(matches!(
        results["splunk"],
        Err(ConvertError::UnsupportedOption { ref key, .. }) if key == "query_table"
    ));
}

#[test]
fn test_huge_timespans_are_structured_errors() {
    let converter = Converter::with_builtins();

    let request = ConversionRequest::new(fixture("network_connection.yml"), "lucene")
        .with_option("schedule_interval", json!("999999999999999999y"));
    assert!(matches!(
        converter.convert(&request),
        Err(ConvertError::UnsupportedOption { ref key, .. }) if key == "schedule_interval"
    ));

    let rules = fixture("failed_logons.yml").replace("timespan: 5m", "timespan: 999999999999999999y");
    assert!(rules.contains("999999999999999999y"));
    match converter.convert(&ConversionRequest::new(rules, "splunk")) {
        Err(ConvertError::RuleParse { fragment, source }) => {
            assert!(fragment.contains("999999999999999999y"));
            assert!(source.to_string().starts_with("document 2: "));
        }
        other => panic!("Expected RuleParse, got {other:?}"),
    }
}
