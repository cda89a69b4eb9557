//! Kusto Query Language backend for Microsoft 365 Defender advanced hunting.
//!
//! Every query starts from a table. The table is taken from the
//! `query_table` option or, failing that, from the `query_table` pipeline
//! state set by a pipeline such as `microsoft_xdr`.

use serde_json::Value;

use crate::error::RuleFailure;
use crate::output::BackendOutput;
use crate::rule::SigmaCollection;

use super::text::{ConvertedRule, QueryGrammar, TextQueryBackend};
use super::{Backend, BackendConfig, BackendDescriptor, FormatInfo, OptionRejection};

fn regex_literal(regex: &str) -> String {
    format!("@\"{}\"", regex.replace('"', "\"\""))
}

pub static GRAMMAR: QueryGrammar = QueryGrammar {
    and_token: " and ",
    or_token: " or ",
    not_expression: "not({expr})",
    not_delimits_operand: true,
    group_open: "(",
    group_close: ")",
    eq_expression: "{field} =~ {value}",
    number_eq_expression: "{field} == {value}",
    str_quote: "\"",
    escape_char: '\\',
    escaped_chars: "",
    wildcard_multi: "*",
    wildcard_single: "?",
    field_quote: Some("['{field}']"),
    startswith_expression: Some("{field} startswith {value}"),
    endswith_expression: Some("{field} endswith {value}"),
    contains_expression: Some("{field} contains {value}"),
    wildcard_match_expression: Some("{field} matches regex {regex}"),
    in_expression: Some("{field} in~ ({list})"),
    in_allows_wildcards: false,
    list_separator: ", ",
    re_expression: Some("{field} matches regex {regex}"),
    regex_literal,
    cidr_expression: Some("ipv4_is_in_range({field}, {value})"),
    compare_expression: Some("{field} {op} {value}"),
    exists_expression: Some("isnotempty({field})"),
    not_exists_expression: Some("isempty({field})"),
    null_expression: Some("isempty({field})"),
    field_ref_expression: Some("{field} =~ {other}"),
    cased_expression: Some("{field} == {value}"),
    keyword_expression: None,
    bool_values: ("true", "false"),
};

pub const FORMATS: &[FormatInfo] = &[FormatInfo::new("default", "Plain KQL queries")];

pub const OPTIONS: &[&str] = &["query_table"];

pub const DESCRIPTOR: BackendDescriptor = BackendDescriptor {
    key: "kusto",
    name: "Microsoft 365 Defender KQL",
    language: "KQL",
    formats: FORMATS,
    correlation_methods: None,
    factory: KustoBackend::create,
};

pub struct KustoBackend {
    text: TextQueryBackend,
    query_table: Option<String>,
}

impl KustoBackend {
    /// # Errors
    /// Rejects options other than `query_table`.
    pub fn new(config: BackendConfig) -> Result<Self, OptionRejection> {
        config.check_options(OPTIONS)?;
        Ok(Self {
            query_table: config.string_option("query_table")?,
            text: TextQueryBackend::new(&GRAMMAR, config),
        })
    }

    fn create(config: BackendConfig) -> Result<Box<dyn Backend>, OptionRejection> {
        Ok(Box::new(Self::new(config)?))
    }

    fn table<'a>(&'a self, converted: &'a ConvertedRule) -> Option<&'a str> {
        self.query_table.as_deref().or_else(|| {
            converted
                .state
                .get("query_table")
                .and_then(Value::as_str)
        })
    }
}

impl Backend for KustoBackend {
    fn correlation_methods(&self) -> Option<&'static [FormatInfo]> {
        None
    }

    fn convert(
        &mut self,
        collection: &SigmaCollection,
        _format: &str,
        _correlation_method: Option<&str>,
    ) -> BackendOutput {
        let converted = self.text.convert_rules(collection);

        let mut queries = Vec::new();
        for rule in &converted {
            if self.text.is_halted() {
                break;
            }
            match self.table(rule).map(str::to_string) {
                Some(table) => queries.extend(
                    rule.queries
                        .iter()
                        .map(|query| format!("{table}\n| where {query}")),
                ),
                None => self.text.fail(
                    &rule.rule.source,
                    "no query table selected; set the 'query_table' option or use a pipeline that selects one",
                ),
            }
        }

        if !self.text.is_halted() {
            self.text.reject_correlations(collection);
        }
        BackendOutput::Queries(queries)
    }

    fn errors(&self) -> &[RuleFailure] {
        self.text.errors()
    }
}
