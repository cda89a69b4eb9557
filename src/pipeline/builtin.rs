//! Pipelines bundled with the crate.
//!
//! Each pipeline is kept in its YAML definition form so that bundled and
//! user-supplied pipelines go through the same parser.

/// Map generic Windows log source categories to Sysmon events.
pub const SYSMON: &str = r#"
name: Generic Log Sources to Sysmon Transformation
priority: 10
transformations:
  - id: sysmon_process_creation_eventid
    type: add_condition
    conditions:
      EventID: 1
    rule_conditions:
      - type: logsource
        category: process_creation
        product: windows
  - id: sysmon_network_connection_eventid
    type: add_condition
    conditions:
      EventID: 3
    rule_conditions:
      - type: logsource
        category: network_connection
        product: windows
  - id: sysmon_file_event_eventid
    type: add_condition
    conditions:
      EventID: 11
    rule_conditions:
      - type: logsource
        category: file_event
        product: windows
  - id: sysmon_dns_query_eventid
    type: add_condition
    conditions:
      EventID: 22
    rule_conditions:
      - type: logsource
        category: dns_query
        product: windows
  - id: sysmon_logsource
    type: change_logsource
    product: windows
    service: sysmon
    rule_cond_op: or
    rule_conditions:
      - type: processing_item_applied
        processing_item_id: sysmon_process_creation_eventid
      - type: processing_item_applied
        processing_item_id: sysmon_network_connection_eventid
      - type: processing_item_applied
        processing_item_id: sysmon_file_event_eventid
      - type: processing_item_applied
        processing_item_id: sysmon_dns_query_eventid
"#;

/// Map process creation rules to Windows Security audit event 4688.
pub const WINDOWS_AUDIT: &str = r#"
name: Windows Security audit process creation
priority: 10
transformations:
  - id: windows_audit_process_creation_eventid
    type: add_condition
    conditions:
      EventID: 4688
    rule_conditions:
      - type: logsource
        category: process_creation
        product: windows
  - id: windows_audit_process_creation_fields
    type: field_name_mapping
    mapping:
      Image: NewProcessName
      ParentImage: ParentProcessName
      User: SubjectUserName
    rule_conditions:
      - type: processing_item_applied
        processing_item_id: windows_audit_process_creation_eventid
  - id: windows_audit_logsource
    type: change_logsource
    product: windows
    service: security
    rule_conditions:
      - type: processing_item_applied
        processing_item_id: windows_audit_process_creation_eventid
"#;

/// Elastic Common Schema field names for Windows rules.
pub const ECS_WINDOWS: &str = r#"
name: Elastic Common Schema mapping for Windows
priority: 20
allowed_backends: [lucene]
transformations:
  - id: ecs_windows_index
    type: set_state
    key: index
    val: winlogbeat-*
    rule_conditions:
      - type: logsource
        product: windows
  - id: ecs_windows_field_mapping
    type: field_name_mapping
    mapping:
      EventID: event.code
      Image: process.executable
      ParentImage: process.parent.executable
      CommandLine: process.command_line
      ParentCommandLine: process.parent.command_line
      OriginalFileName: process.pe.original_file_name
      User: user.name
      TargetFilename: file.path
      DestinationIp: destination.ip
      DestinationPort: destination.port
      DestinationHostname: destination.domain
      QueryName: dns.question.name
    rule_conditions:
      - type: logsource
        product: windows
  - id: ecs_windows_event_data_prefix
    type: field_name_prefix
    prefix: winlog.event_data.
    rule_conditions:
      - type: logsource
        product: windows
    field_name_conditions:
      - type: exclude_fields
        match_type: re
        fields: ['\.']
"#;

/// Splunk `source` conditions for Windows event log services.
pub const SPLUNK_WINDOWS: &str = r#"
name: Splunk Windows log source conditions
priority: 20
allowed_backends: [splunk]
transformations:
  - id: splunk_windows_sysmon_source
    type: add_condition
    conditions:
      source: WinEventLog:Microsoft-Windows-Sysmon/Operational
    rule_conditions:
      - type: logsource
        product: windows
        service: sysmon
  - id: splunk_windows_security_source
    type: add_condition
    conditions:
      source: WinEventLog:Security
    rule_conditions:
      - type: logsource
        product: windows
        service: security
  - id: splunk_windows_powershell_source
    type: add_condition
    conditions:
      source: WinEventLog:Microsoft-Windows-PowerShell/Operational
    rule_conditions:
      - type: logsource
        product: windows
        service: powershell
"#;

/// Microsoft 365 Defender advanced hunting tables and columns.
pub const MICROSOFT_XDR: &str = r#"
name: Microsoft 365 Defender XDR
priority: 10
allowed_backends: [kusto]
transformations:
  - id: microsoft_xdr_process_table
    type: set_state
    key: query_table
    val: DeviceProcessEvents
    rule_conditions:
      - type: logsource
        category: process_creation
        product: windows
  - id: microsoft_xdr_network_table
    type: set_state
    key: query_table
    val: DeviceNetworkEvents
    rule_conditions:
      - type: logsource
        category: network_connection
        product: windows
  - id: microsoft_xdr_file_table
    type: set_state
    key: query_table
    val: DeviceFileEvents
    rule_conditions:
      - type: logsource
        category: file_event
        product: windows
  - id: microsoft_xdr_unsupported
    type: rule_failure
    message: Rule log source is not supported by the Microsoft XDR pipeline
    rule_cond_op: or
    rule_cond_not: true
    rule_conditions:
      - type: processing_item_applied
        processing_item_id: microsoft_xdr_process_table
      - type: processing_item_applied
        processing_item_id: microsoft_xdr_network_table
      - type: processing_item_applied
        processing_item_id: microsoft_xdr_file_table
  - id: microsoft_xdr_process_fields
    type: field_name_mapping
    mapping:
      Image: FolderPath
      ParentImage: InitiatingProcessFolderPath
      CommandLine: ProcessCommandLine
      ParentCommandLine: InitiatingProcessCommandLine
      OriginalFileName: ProcessVersionInfoOriginalFileName
      User: AccountName
    rule_conditions:
      - type: processing_item_applied
        processing_item_id: microsoft_xdr_process_table
  - id: microsoft_xdr_network_fields
    type: field_name_mapping
    mapping:
      Image: InitiatingProcessFolderPath
      DestinationIp: RemoteIP
      DestinationPort: RemotePort
      DestinationHostname: RemoteUrl
      User: InitiatingProcessAccountName
    rule_conditions:
      - type: processing_item_applied
        processing_item_id: microsoft_xdr_network_table
  - id: microsoft_xdr_file_fields
    type: field_name_mapping
    mapping:
      Image: InitiatingProcessFolderPath
      TargetFilename: FolderPath
      User: InitiatingProcessAccountName
    rule_conditions:
      - type: processing_item_applied
        processing_item_id: microsoft_xdr_file_table
"#;

/// Bundled pipelines by registry key.
pub const SOURCES: &[(&str, &str)] = &[
    ("ecs_windows", ECS_WINDOWS),
    ("microsoft_xdr", MICROSOFT_XDR),
    ("splunk_windows", SPLUNK_WINDOWS),
    ("sysmon", SYSMON),
    ("windows_audit", WINDOWS_AUDIT),
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ProcessingPipeline;
    use crate::rule::{SigmaCollection, SigmaRule};

    fn rule(category: &str) -> SigmaRule {
        let yaml = format!(
            r#"
title: Test
logsource:
    category: {category}
    product: windows
detection:
    selection:
        Image|endswith: '\rundll32.exe'
        CommandLine|contains: 'javascript:'
    condition: selection
"#
        );
        SigmaCollection::from_yaml(&yaml).unwrap().rules.remove(0)
    }

    #[test]
    fn test_sysmon_adds_event_id() {
        let pipeline = ProcessingPipeline::from_yaml(SYSMON).unwrap();
        let processed = pipeline.apply(&rule("process_creation"));
        assert!(processed.rule.detection.contains("_cond1"));
        assert_eq!(processed.rule.logsource.service.as_deref(), Some("sysmon"));
        assert_eq!(
            processed.rule.detection.conditions[0].to_string(),
            "(_cond1 and selection)"
        );
    }

    #[test]
    fn test_sysmon_ignores_unknown_category() {
        let pipeline = ProcessingPipeline::from_yaml(SYSMON).unwrap();
        let processed = pipeline.apply(&rule("image_load"));
        assert!(!processed.rule.detection.contains("_cond1"));
        assert_eq!(processed.rule.logsource.category.as_deref(), Some("image_load"));
    }

    #[test]
    fn test_microsoft_xdr_selects_table() {
        let pipeline = ProcessingPipeline::from_yaml(MICROSOFT_XDR).unwrap();
        let processed = pipeline.apply(&rule("process_creation"));
        assert!(processed.failure.is_none());
        assert_eq!(
            processed.state.get("query_table"),
            Some(&serde_json::json!("DeviceProcessEvents"))
        );
        assert!(processed.state.was_applied("microsoft_xdr_process_fields"));
    }

    #[test]
    fn test_microsoft_xdr_rejects_unmapped_category() {
        let pipeline = ProcessingPipeline::from_yaml(MICROSOFT_XDR).unwrap();
        let processed = pipeline.apply(&rule("registry_set"));
        assert!(processed
            .failure
            .as_deref()
            .is_some_and(|m| m.contains("not supported")));
    }

    #[test]
    fn test_backend_restrictions() {
        let ecs = ProcessingPipeline::from_yaml(ECS_WINDOWS).unwrap();
        assert!(ecs.allows_backend("lucene"));
        assert!(!ecs.allows_backend("splunk"));
        let sysmon = ProcessingPipeline::from_yaml(SYSMON).unwrap();
        assert!(sysmon.allows_backend("splunk"));
    }
}
