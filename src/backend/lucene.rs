//! Lucene query string backend for Elasticsearch.
//!
//! Besides plain query strings, this backend emits Elasticsearch query DSL
//! documents and detection rules for the Elastic SIEM. SIEM rules carry a
//! `threat` section built from the `attack.*` tags of a rule, resolved
//! through the configured [`AttackData`].

use serde_json::{json, Value};

use crate::attack::AttackData;
use crate::error::RuleFailure;
use crate::output::BackendOutput;
use crate::rule::{Level, SigmaCollection, Timespan};

use super::text::{ConvertedRule, QueryGrammar, TextQueryBackend};
use super::{Backend, BackendConfig, BackendDescriptor, FormatInfo, OptionRejection};

fn regex_literal(regex: &str) -> String {
    format!("/{}/", regex.replace('/', "\\/"))
}

pub static GRAMMAR: QueryGrammar = QueryGrammar {
    and_token: " AND ",
    or_token: " OR ",
    not_expression: "NOT {expr}",
    not_delimits_operand: false,
    group_open: "(",
    group_close: ")",
    eq_expression: "{field}:{value}",
    number_eq_expression: "{field}:{value}",
    str_quote: "",
    escape_char: '\\',
    escaped_chars: "+-=&|!(){}[]^\"~:/ <>*?",
    wildcard_multi: "*",
    wildcard_single: "?",
    field_quote: None,
    startswith_expression: None,
    endswith_expression: None,
    contains_expression: None,
    wildcard_match_expression: None,
    in_expression: Some("{field}:({list})"),
    in_allows_wildcards: true,
    list_separator: " OR ",
    re_expression: Some("{field}:{regex}"),
    regex_literal,
    cidr_expression: Some("{field}:{value}"),
    compare_expression: Some("{field}:{op}{value}"),
    exists_expression: Some("_exists_:{field}"),
    not_exists_expression: Some("NOT _exists_:{field}"),
    null_expression: Some("NOT _exists_:{field}"),
    field_ref_expression: None,
    cased_expression: None,
    keyword_expression: Some("{value}"),
    bool_values: ("true", "false"),
};

pub const FORMATS: &[FormatInfo] = &[
    FormatInfo::new("default", "Plain Lucene queries"),
    FormatInfo::new("dsl_lucene", "Elasticsearch query DSL with embedded Lucene queries"),
    FormatInfo::new("siem_rule", "Elastic SIEM detection rules"),
];

pub const OPTIONS: &[&str] = &["index_names", "schedule_interval"];

pub const DESCRIPTOR: BackendDescriptor = BackendDescriptor {
    key: "lucene",
    name: "Elasticsearch Lucene",
    language: "Lucene",
    formats: FORMATS,
    correlation_methods: None,
    factory: LuceneBackend::create,
};

const DEFAULT_INDEX: &str = "logs-*";
const DEFAULT_INTERVAL: &str = "5m";
const ATTACK_URL: &str = "https://attack.mitre.org";

pub struct LuceneBackend {
    text: TextQueryBackend,
    index_names: Option<Vec<String>>,
    interval: Timespan,
}

impl LuceneBackend {
    /// # Errors
    /// Rejects unknown options and a `schedule_interval` that is not a
    /// timespan such as `5m`.
    pub fn new(config: BackendConfig) -> Result<Self, OptionRejection> {
        config.check_options(OPTIONS)?;
        let index_names = config.strings_option("index_names")?;
        let interval = config
            .string_option("schedule_interval")?
            .unwrap_or_else(|| DEFAULT_INTERVAL.to_string());
        let interval = Timespan::parse(&interval)
            .map_err(|e| OptionRejection::invalid("schedule_interval", e.to_string()))?;
        Ok(Self {
            text: TextQueryBackend::new(&GRAMMAR, config),
            index_names,
            interval,
        })
    }

    fn create(config: BackendConfig) -> Result<Box<dyn Backend>, OptionRejection> {
        Ok(Box::new(Self::new(config)?))
    }

    /// Target indices: the option, then the pipeline state, then the default.
    fn indices(&self, converted: &ConvertedRule) -> Vec<String> {
        if let Some(names) = &self.index_names {
            return names.clone();
        }
        match converted.state.get("index") {
            Some(Value::String(index)) => vec![index.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => vec![DEFAULT_INDEX.to_string()],
        }
    }

    fn siem_rule(&self, converted: &ConvertedRule, query: &str) -> Value {
        let rule = &converted.rule;
        let (risk_score, severity) = risk(rule.level);
        let mut document = json!({
            "name": rule.title,
            "description": rule.description.as_deref().unwrap_or(&rule.title),
            "enabled": true,
            "index": self.indices(converted),
            "interval": self.interval.to_string(),
            "from": format!("now-{}", self.interval),
            "language": "lucene",
            "query": query,
            "risk_score": risk_score,
            "severity": severity,
            "tags": rule.tags,
            "references": rule.references,
            "false_positives": rule.falsepositives,
            "type": "query",
            "threat": threat(self.text.config().attack.as_ref(), &rule.tags),
        });
        if let (Some(id), Value::Object(map)) = (&rule.id, &mut document) {
            map.insert("rule_id".to_string(), json!(id));
        }
        if let (Some(author), Value::Object(map)) = (&rule.author, &mut document) {
            map.insert("author".to_string(), json!([author]));
        }
        document
    }
}

fn dsl_query(query: &str) -> Value {
    json!({
        "query": {
            "bool": {
                "must": [
                    { "query_string": { "query": query, "analyze_wildcard": true } }
                ]
            }
        }
    })
}

fn risk(level: Option<Level>) -> (u32, &'static str) {
    match level {
        Some(Level::Informational) | Some(Level::Low) => (21, "low"),
        Some(Level::High) => (73, "high"),
        Some(Level::Critical) => (99, "critical"),
        Some(Level::Medium) | None => (47, "medium"),
    }
}

/// Technique ids look like `t1059` or `t1059.001`.
fn is_technique_tag(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some('t' | 'T')) && chars.next().is_some_and(|c| c.is_ascii_digit())
}

struct TacticEntry {
    id: String,
    name: String,
    shortname: String,
    techniques: Vec<TechniqueEntry>,
}

struct TechniqueEntry {
    id: String,
    name: String,
    subtechniques: Vec<(String, String)>,
}

fn technique_reference(id: &str) -> String {
    format!("{ATTACK_URL}/techniques/{}/", id.replace('.', "/"))
}

/// Build the SIEM `threat` section from `attack.*` tags.
///
/// Tactics unknown to the data source are dropped; unknown techniques keep
/// their raw id as name and are attached to every tagged tactic.
fn threat(attack: &dyn AttackData, tags: &[String]) -> Value {
    let names: Vec<&str> = tags
        .iter()
        .filter_map(|tag| tag.strip_prefix("attack."))
        .collect();

    let mut tactics: Vec<TacticEntry> = Vec::new();
    for name in names.iter().filter(|n| !is_technique_tag(n)) {
        if let Some(tactic) = attack.tactic(&name.replace('_', "-")) {
            if !tactics.iter().any(|t| t.id == tactic.id) {
                tactics.push(TacticEntry {
                    id: tactic.id.clone(),
                    name: tactic.name.clone(),
                    shortname: tactic.shortname.clone(),
                    techniques: Vec::new(),
                });
            }
        }
    }

    for name in names.iter().filter(|n| is_technique_tag(n)) {
        let id = name.to_ascii_uppercase();
        let parent_id = id.split('.').next().unwrap_or(&id).to_string();
        let known = attack.technique(&id);
        let technique_name = known.map_or_else(|| id.clone(), |t| t.name.clone());
        let parent_name = attack
            .technique(&parent_id)
            .map_or_else(|| parent_id.clone(), |t| t.name.clone());
        let owners: Vec<&str> = known.map(|t| t.tactics.iter().map(String::as_str).collect()).unwrap_or_default();
        let attach_all = !tactics.iter().any(|t| owners.contains(&t.shortname.as_str()));

        for tactic in tactics
            .iter_mut()
            .filter(|t| attach_all || owners.contains(&t.shortname.as_str()))
        {
            let position = match tactic.techniques.iter().position(|t| t.id == parent_id) {
                Some(position) => position,
                None => {
                    tactic.techniques.push(TechniqueEntry {
                        id: parent_id.clone(),
                        name: parent_name.clone(),
                        subtechniques: Vec::new(),
                    });
                    tactic.techniques.len() - 1
                }
            };
            if id != parent_id {
                let entry = &mut tactic.techniques[position];
                if !entry.subtechniques.iter().any(|(sub, _)| *sub == id) {
                    entry.subtechniques.push((id.clone(), technique_name.clone()));
                }
            }
        }
    }

    Value::Array(
        tactics
            .into_iter()
            .map(|tactic| {
                let techniques: Vec<Value> = tactic
                    .techniques
                    .into_iter()
                    .map(|technique| {
                        let subtechniques: Vec<Value> = technique
                            .subtechniques
                            .iter()
                            .map(|(id, name)| {
                                json!({ "id": id, "name": name, "reference": technique_reference(id) })
                            })
                            .collect();
                        json!({
                            "id": technique.id,
                            "name": technique.name,
                            "reference": technique_reference(&technique.id),
                            "subtechnique": subtechniques,
                        })
                    })
                    .collect();
                json!({
                    "framework": "MITRE ATT&CK",
                    "tactic": {
                        "id": tactic.id,
                        "name": tactic.name,
                        "reference": format!("{ATTACK_URL}/tactics/{}/", tactic.id),
                    },
                    "technique": techniques,
                })
            })
            .collect(),
    )
}

impl Backend for LuceneBackend {
    fn correlation_methods(&self) -> Option<&'static [FormatInfo]> {
        None
    }

    fn convert(
        &mut self,
        collection: &SigmaCollection,
        format: &str,
        _correlation_method: Option<&str>,
    ) -> BackendOutput {
        let converted = self.text.convert_rules(collection);
        self.text.reject_correlations(collection);

        let queries = converted
            .iter()
            .flat_map(|c| c.queries.iter().map(move |q| (c, q.as_str())));
        match format {
            "dsl_lucene" => BackendOutput::Sequence(queries.map(|(_, q)| dsl_query(q)).collect()),
            "siem_rule" => {
                BackendOutput::Sequence(queries.map(|(c, q)| self.siem_rule(c, q)).collect())
            }
            _ => BackendOutput::Queries(queries.map(|(_, q)| q.to_string()).collect()),
        }
    }

    fn errors(&self) -> &[RuleFailure] {
        self.text.errors()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attack::StaticAttackData;
    use crate::pipeline::ProcessingPipeline;
    use serde_json::json;
    use std::sync::Arc;

    const RULE: &str = r#"
title: Whoami Execution
id: 8c3a6f8e-1d4b-4b4e-9f51-0a2c6a4e7a11
description: Detects whoami
level: high
tags:
    - attack.discovery
    - attack.t1033
logsource:
    category: process_creation
    product: windows
detection:
    selection:
        Image|endswith: '\whoami.exe'
    condition: selection
"#;

    fn convert(config: BackendConfig, yaml: &str, format: &str) -> (BackendOutput, Vec<RuleFailure>) {
        let collection = SigmaCollection::from_yaml(yaml).unwrap();
        let mut backend = LuceneBackend::new(config).unwrap();
        let output = backend.convert(&collection, format, None);
        (output, backend.errors().to_vec())
    }

    fn sequence(output: BackendOutput) -> Vec<Value> {
        match output {
            BackendOutput::Sequence(items) => items,
            other => panic!("Expected sequence, got {other:?}"),
        }
    }

    #[test]
    fn test_query_escaping() {
        let (output, errors) = convert(BackendConfig::new(), RULE, "default");
        assert!(errors.is_empty());
        match output {
            BackendOutput::Queries(queries) => assert_eq!(queries, vec![r"Image:*\\whoami.exe"]),
            other => panic!("Expected queries, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_interval_rejected() {
        let config = BackendConfig::new().with_option("schedule_interval", json!("soon"));
        let rejection = LuceneBackend::new(config).err().unwrap();
        assert_eq!(rejection.key, "schedule_interval");
    }

    #[test]
    fn test_overflowing_interval_rejected() {
        let config =
            BackendConfig::new().with_option("schedule_interval", json!("999999999999999999y"));
        let rejection = LuceneBackend::new(config).err().unwrap();
        assert_eq!(rejection.key, "schedule_interval");
        assert!(rejection.reason.contains("999999999999999999y"));
    }

    #[test]
    fn test_dsl_output() {
        let items = sequence(convert(BackendConfig::new(), RULE, "dsl_lucene").0);
        assert_eq!(
            items[0]["query"]["bool"]["must"][0]["query_string"]["query"],
            json!(r"Image:*\\whoami.exe")
        );
    }

    #[test]
    fn test_siem_rule_index_sources() {
        let items = sequence(convert(BackendConfig::new(), RULE, "siem_rule").0);
        assert_eq!(items[0]["index"], json!(["logs-*"]));
        assert_eq!(items[0]["risk_score"], json!(73));
        assert_eq!(items[0]["severity"], json!("high"));
        assert_eq!(items[0]["rule_id"], json!("8c3a6f8e-1d4b-4b4e-9f51-0a2c6a4e7a11"));

        let pipeline = ProcessingPipeline::from_yaml(
            "transformations:\n  - type: set_state\n    key: index\n    val: winlogbeat-*\n",
        )
        .unwrap();
        let items = sequence(
            convert(BackendConfig::new().with_pipeline(pipeline.clone()), RULE, "siem_rule").0,
        );
        assert_eq!(items[0]["index"], json!(["winlogbeat-*"]));

        let config = BackendConfig::new()
            .with_pipeline(pipeline)
            .with_option("index_names", json!(["a-*", "b-*"]));
        let items = sequence(convert(config, RULE, "siem_rule").0);
        assert_eq!(items[0]["index"], json!(["a-*", "b-*"]));
    }

    #[test]
    fn test_threat_mapping() {
        let data = StaticAttackData::from_json(
            r#"{
                "tactics": [
                    {"id": "TA0007", "name": "Discovery", "shortname": "discovery"},
                    {"id": "TA0002", "name": "Execution", "shortname": "execution"}
                ],
                "techniques": [
                    {"id": "T1033", "name": "System Owner/User Discovery", "tactics": ["discovery"]},
                    {"id": "T1059", "name": "Command and Scripting Interpreter", "tactics": ["execution"]},
                    {"id": "T1059.001", "name": "PowerShell", "tactics": ["execution"]}
                ]
            }"#,
        )
        .unwrap();
        let tags: Vec<String> = ["attack.discovery", "attack.execution", "attack.t1033", "attack.t1059.001"]
            .iter()
            .map(|t| t.to_string())
            .collect();
        let threat = threat(&data, &tags);

        assert_eq!(threat[0]["tactic"]["id"], json!("TA0007"));
        assert_eq!(threat[0]["technique"][0]["id"], json!("T1033"));
        assert_eq!(threat[1]["technique"][0]["id"], json!("T1059"));
        assert_eq!(threat[1]["technique"][0]["subtechnique"][0]["name"], json!("PowerShell"));
        assert_eq!(
            threat[1]["technique"][0]["subtechnique"][0]["reference"],
            json!("https://attack.mitre.org/techniques/T1059/001/")
        );
    }

    #[test]
    fn test_threat_with_siem_rule_config() {
        let data = StaticAttackData::from_json(
            r#"{"tactics": [{"id": "TA0007", "name": "Discovery", "shortname": "discovery"}]}"#,
        )
        .unwrap();
        let config = BackendConfig {
            attack: Arc::new(data),
            ..BackendConfig::new()
        };
        let items = sequence(convert(config, RULE, "siem_rule").0);
        assert_eq!(items[0]["threat"][0]["technique"][0]["name"], json!("T1033"));
        assert!(sequence(convert(BackendConfig::new(), RULE, "siem_rule").0)[0]["threat"]
            .as_array()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_correlations_rejected() {
        let yaml = format!(
            "{RULE}---\ntitle: Corr\ncorrelation:\n    type: event_count\n    rules: [x]\n    timespan: 1h\n    condition:\n        gte: 3\n"
        );
        let config = BackendConfig::new().with_collect_errors(true);
        let (output, errors) = convert(config, &yaml, "default");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].source.title, "Corr");
        assert!(matches!(output, BackendOutput::Queries(q) if q.len() == 1));
    }
}
