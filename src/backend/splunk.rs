//! Splunk SPL backend.

use crate::error::RuleFailure;
use crate::output::BackendOutput;
use crate::rule::{CorrelationRule, CorrelationType, SigmaCollection};

use super::text::{ConvertedRule, QueryGrammar, TextQueryBackend};
use super::{Backend, BackendConfig, BackendDescriptor, FormatInfo, OptionRejection};

fn regex_literal(regex: &str) -> String {
    format!("\"{}\"", regex.replace('\\', "\\\\").replace('"', "\\\""))
}

pub static GRAMMAR: QueryGrammar = QueryGrammar {
    and_token: " ",
    or_token: " OR ",
    not_expression: "NOT {expr}",
    not_delimits_operand: false,
    group_open: "(",
    group_close: ")",
    eq_expression: "{field}={value}",
    number_eq_expression: "{field}={value}",
    str_quote: "\"",
    escape_char: '\\',
    escaped_chars: "",
    wildcard_multi: "*",
    wildcard_single: "*",
    field_quote: Some("\"{field}\""),
    startswith_expression: None,
    endswith_expression: None,
    contains_expression: None,
    wildcard_match_expression: None,
    in_expression: Some("{field} IN ({list})"),
    in_allows_wildcards: true,
    list_separator: ", ",
    re_expression: None,
    regex_literal,
    cidr_expression: Some("{field}={value}"),
    compare_expression: Some("{field}{op}{value}"),
    exists_expression: Some("{field}=*"),
    not_exists_expression: Some("NOT {field}=*"),
    null_expression: Some("NOT {field}=*"),
    field_ref_expression: None,
    cased_expression: None,
    keyword_expression: Some("{value}"),
    bool_values: ("true", "false"),
};

pub const FORMATS: &[FormatInfo] = &[
    FormatInfo::new("default", "Plain SPL queries"),
    FormatInfo::new("savedsearches", "Splunk savedsearches.conf stanzas"),
];

pub const CORRELATION_METHODS: &[FormatInfo] = &[FormatInfo::new(
    "stats",
    "Correlation with the stats command",
)];

pub const OPTIONS: &[&str] = &["min_time", "max_time", "app"];

pub const DESCRIPTOR: BackendDescriptor = BackendDescriptor {
    key: "splunk",
    name: "Splunk",
    language: "SPL",
    formats: FORMATS,
    correlation_methods: Some(CORRELATION_METHODS),
    factory: SplunkBackend::create,
};

const DEFAULT_MIN_TIME: &str = "-30d";
const DEFAULT_MAX_TIME: &str = "now";

/// A query ready for output, with the metadata of its rule.
struct Search {
    title: String,
    description: Option<String>,
    query: String,
}

pub struct SplunkBackend {
    text: TextQueryBackend,
    min_time: Option<String>,
    max_time: Option<String>,
    app: Option<String>,
}

impl SplunkBackend {
    /// # Errors
    /// Rejects options other than `min_time`, `max_time` and `app`.
    pub fn new(config: BackendConfig) -> Result<Self, OptionRejection> {
        config.check_options(OPTIONS)?;
        Ok(Self {
            min_time: config.string_option("min_time")?,
            max_time: config.string_option("max_time")?,
            app: config.string_option("app")?,
            text: TextQueryBackend::new(&GRAMMAR, config),
        })
    }

    fn create(config: BackendConfig) -> Result<Box<dyn Backend>, OptionRejection> {
        Ok(Box::new(Self::new(config)?))
    }

    fn correlation_query(
        &self,
        collection: &SigmaCollection,
        converted: &[ConvertedRule],
        correlation: &CorrelationRule,
    ) -> Result<String, String> {
        let inputs = self
            .text
            .correlation_inputs(collection, converted, correlation)?;

        let search = if inputs.len() == 1 && correlation.correlation_type != CorrelationType::Temporal
        {
            inputs[0].combined_query(&GRAMMAR)
        } else {
            let subsearches = inputs
                .iter()
                .map(|input| {
                    let event_type = input
                        .rule
                        .name
                        .as_deref()
                        .or(input.rule.id.as_deref())
                        .unwrap_or(&input.rule.title);
                    format!(
                        "[ search {} | eval event_type={} ]",
                        input.combined_query(&GRAMMAR),
                        GRAMMAR.quote(event_type)
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");
            format!("| multisearch\n{subsearches}")
        };

        let (aggregate, alias) = match correlation.correlation_type {
            CorrelationType::EventCount => ("count".to_string(), "event_count"),
            CorrelationType::ValueCount => {
                let field = correlation
                    .condition
                    .field
                    .as_deref()
                    .ok_or_else(|| "value_count correlation without field".to_string())?;
                (format!("dc({})", GRAMMAR.field_name(field)), "value_count")
            }
            CorrelationType::Temporal => ("dc(event_type)".to_string(), "event_type_count"),
        };

        let mut group_by = vec!["_time".to_string()];
        group_by.extend(correlation.group_by.iter().map(|f| GRAMMAR.field_name(f)));

        Ok(format!(
            "{search}\n| bin _time span={span}\n| stats {aggregate} as {alias} by {by}\n| search {alias} {op} {count}",
            span = correlation.timespan,
            by = group_by.join(", "),
            op = correlation.condition.op.symbol(),
            count = correlation.condition.count,
        ))
    }

    fn saved_searches(&self, searches: &[Search]) -> String {
        let mut conf = String::from("[default]\n");
        conf.push_str(&format!(
            "dispatch.earliest_time = {}\n",
            self.min_time.as_deref().unwrap_or(DEFAULT_MIN_TIME)
        ));
        conf.push_str(&format!(
            "dispatch.latest_time = {}\n",
            self.max_time.as_deref().unwrap_or(DEFAULT_MAX_TIME)
        ));
        if let Some(app) = &self.app {
            conf.push_str(&format!("request.ui_dispatch_app = {app}\n"));
        }

        let mut used: Vec<String> = Vec::with_capacity(searches.len());
        for search in searches {
            let mut stanza = search.title.replace(['[', ']'], "");
            let mut n = 2;
            while used.contains(&stanza) {
                stanza = format!("{} ({n})", search.title.replace(['[', ']'], ""));
                n += 1;
            }
            used.push(stanza.clone());

            conf.push_str(&format!("\n[{stanza}]\n"));
            if let Some(description) = &search.description {
                conf.push_str(&format!(
                    "description = {}\n",
                    description.split_whitespace().collect::<Vec<_>>().join(" ")
                ));
            }
            conf.push_str(&format!("search = {}\n", search.query.replace('\n', " \\\n")));
        }
        conf
    }
}

impl Backend for SplunkBackend {
    fn correlation_methods(&self) -> Option<&'static [FormatInfo]> {
        Some(CORRELATION_METHODS)
    }

    fn convert(
        &mut self,
        collection: &SigmaCollection,
        format: &str,
        correlation_method: Option<&str>,
    ) -> BackendOutput {
        let converted = self.text.convert_rules(collection);

        let mut searches: Vec<Search> = converted
            .iter()
            .filter(|c| c.standalone)
            .flat_map(|c| {
                c.queries.iter().map(move |query| Search {
                    title: c.rule.title.clone(),
                    description: c.rule.description.clone(),
                    query: query.clone(),
                })
            })
            .collect();

        let method = correlation_method.unwrap_or(CORRELATION_METHODS[0].name);
        for correlation in &collection.correlations {
            if self.text.is_halted() {
                break;
            }
            if method != "stats" {
                self.text.fail(
                    &correlation.source,
                    format!("correlation method '{method}' is not supported"),
                );
                continue;
            }
            match self.correlation_query(collection, &converted, correlation) {
                Ok(query) => searches.push(Search {
                    title: correlation.title.clone(),
                    description: None,
                    query,
                }),
                Err(message) => self.text.fail(&correlation.source, message),
            }
        }

        match format {
            "savedsearches" => BackendOutput::Text(self.saved_searches(&searches)),
            _ => BackendOutput::Queries(searches.into_iter().map(|s| s.query).collect()),
        }
    }

    fn errors(&self) -> &[RuleFailure] {
        self.text.errors()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const RULES: &str = r#"
title: Failed Logon
name: failed_logon
logsource:
    product: windows
    service: security
detection:
    selection:
        EventID: 4625
    condition: selection
---
title: Many Failed Logons
correlation:
    type: event_count
    rules: [failed_logon]
    group-by: [TargetUserName]
    timespan: 5m
    condition:
        gte: 10
"#;

    fn convert(config: BackendConfig, yaml: &str, format: &str) -> (BackendOutput, Vec<RuleFailure>) {
        let collection = SigmaCollection::from_yaml(yaml).unwrap();
        let mut backend = SplunkBackend::new(config).unwrap();
        let output = backend.convert(&collection, format, None);
        (output, backend.errors().to_vec())
    }

    #[test]
    fn test_rejects_unknown_option() {
        let config = BackendConfig::new().with_option("index", json!("main"));
        assert_eq!(
            SplunkBackend::new(config).err(),
            Some(OptionRejection::unknown("index"))
        );
    }

    #[test]
    fn test_query_syntax() {
        let yaml = r#"
title: Test
logsource:
    product: windows
detection:
    selection:
        Image|endswith: '\whoami.exe'
        CommandLine|contains: [' /all', ' /priv']
    filter:
        User: SYSTEM
    condition: selection and not filter
"#;
        let (output, errors) = convert(BackendConfig::new(), yaml, "default");
        assert!(errors.is_empty());
        match output {
            BackendOutput::Queries(queries) => assert_eq!(
                queries,
                vec![r#"Image="*\\whoami.exe" CommandLine IN ("* /all*", "* /priv*") NOT User="SYSTEM""#]
            ),
            other => panic!("Expected queries, got {other:?}"),
        }
    }

    #[test]
    fn test_regex_is_unsupported() {
        let yaml = "title: R\nlogsource:\n    product: x\ndetection:\n    s:\n        A|re: 'a.*b'\n    condition: s\n";
        let (_, errors) = convert(BackendConfig::new(), yaml, "default");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "regular expressions are not supported");
    }

    #[test]
    fn test_correlation_hides_referenced_rule() {
        let (output, errors) = convert(BackendConfig::new(), RULES, "default");
        assert!(errors.is_empty());
        match output {
            BackendOutput::Queries(queries) => {
                assert_eq!(queries.len(), 1);
                assert_eq!(
                    queries[0],
                    "EventID=4625\n| bin _time span=5m\n| stats count as event_count by _time, TargetUserName\n| search event_count >= 10"
                );
            }
            other => panic!("Expected queries, got {other:?}"),
        }
    }

    #[test]
    fn test_saved_searches() {
        let config = BackendConfig::new()
            .with_option("app", json!("security"))
            .with_option("min_time", json!("-1d"));
        let (output, _) = convert(config, RULES, "savedsearches");
        let BackendOutput::Text(conf) = output else {
            panic!("Expected text");
        };
        assert!(conf.starts_with("[default]\ndispatch.earliest_time = -1d\n"));
        assert!(conf.contains("request.ui_dispatch_app = security\n"));
        assert!(conf.contains("\n[Many Failed Logons]\n"));
        assert!(conf.contains("search = EventID=4625 \\\n| bin _time span=5m"));
    }
}
