//! Lowering of processed rules into text queries.
//!
//! A [`QueryGrammar`] is a table of tokens and templates describing one text
//! query language. Lowering walks the condition of a rule, resolves detection
//! identifiers and selectors, expands value modifiers and renders every
//! detection item through the grammar. Constructs without a template are
//! reported as per-rule failures rather than approximated.
//!
//! [`TextQueryBackend`] drives the conversion of a whole collection: pipeline
//! application, lowering, failure recording and the correlation-only
//! bookkeeping. Concrete backends wrap it and assemble the final output.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::debug;

use crate::error::RuleFailure;
use crate::pipeline::{PipelineState, ProcessedRule};
use crate::rule::{
    ConditionExpr, CorrelationRule, Detection, DetectionItem, Modifier, Quantifier, RuleSource,
    SigmaCollection, SigmaRule, SigmaString, SigmaValue, SpecialChar, StringPart,
};

use super::BackendConfig;

/// Upper bound of AND-combinations generated for an `N of` selector.
const MAX_SELECTOR_COMBINATIONS: usize = 256;

type Lowering<T> = std::result::Result<T, String>;

/// Tokens and templates of a text query language.
///
/// Templates contain `{name}` slots: `{field}`, `{value}`, `{regex}`, `{op}`,
/// `{list}`, `{other}` and `{expr}`. A `None` template marks a construct the
/// language cannot express.
pub struct QueryGrammar {
    pub and_token: &'static str,
    pub or_token: &'static str,
    /// Negation of `{expr}`.
    pub not_expression: &'static str,
    /// The negation template already delimits its operand.
    pub not_delimits_operand: bool,
    pub group_open: &'static str,
    pub group_close: &'static str,

    /// String equality, `{field}` and `{value}`.
    pub eq_expression: &'static str,
    /// Numeric and boolean equality, `{field}` and `{value}`.
    pub number_eq_expression: &'static str,
    pub str_quote: &'static str,
    pub escape_char: char,
    /// Characters escaped in literal string parts, besides the quote and the
    /// escape character.
    pub escaped_chars: &'static str,
    pub wildcard_multi: &'static str,
    pub wildcard_single: &'static str,
    /// Template for field names that are not plain identifiers; when `None`
    /// the offending characters are escaped.
    pub field_quote: Option<&'static str>,

    pub startswith_expression: Option<&'static str>,
    pub endswith_expression: Option<&'static str>,
    pub contains_expression: Option<&'static str>,
    /// Values with inner wildcards, `{field}` and `{regex}`. When `None`,
    /// wildcards are rendered with the wildcard tokens.
    pub wildcard_match_expression: Option<&'static str>,

    /// OR of plain values, `{field}` and `{list}`.
    pub in_expression: Option<&'static str>,
    pub in_allows_wildcards: bool,
    pub list_separator: &'static str,

    /// `{field}` and `{regex}`.
    pub re_expression: Option<&'static str>,
    /// Turn a regular expression into a literal of the language.
    pub regex_literal: fn(&str) -> String,
    pub cidr_expression: Option<&'static str>,
    /// `{field}`, `{op}` and `{value}`.
    pub compare_expression: Option<&'static str>,
    pub exists_expression: Option<&'static str>,
    pub not_exists_expression: Option<&'static str>,
    pub null_expression: Option<&'static str>,
    /// `{field}` and `{other}`.
    pub field_ref_expression: Option<&'static str>,
    pub cased_expression: Option<&'static str>,
    /// Values not bound to a field, `{value}`.
    pub keyword_expression: Option<&'static str>,
    pub bool_values: (&'static str, &'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Precedence {
    Atom,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Junction {
    And,
    Or,
}

impl Junction {
    fn precedence(self) -> Precedence {
        match self {
            Junction::And => Precedence::And,
            Junction::Or => Precedence::Or,
        }
    }
}

/// A lowered sub-expression with the operator at its top.
#[derive(Debug, Clone)]
struct Lowered {
    text: String,
    precedence: Precedence,
}

impl Lowered {
    fn atom(text: String) -> Self {
        Self {
            text,
            precedence: Precedence::Atom,
        }
    }
}

/// Wildcard layout of a string value.
#[derive(Debug, PartialEq)]
enum Shape {
    Exact,
    StartsWith(SigmaString),
    EndsWith(SigmaString),
    Contains(SigmaString),
    Pattern,
}

impl Shape {
    fn of(s: &SigmaString) -> Self {
        if !s.contains_wildcards() {
            return Shape::Exact;
        }
        let leading = s.starts_with_wildcard();
        let trailing = s.ends_with_wildcard();
        let start = usize::from(leading);
        let end = s.parts.len() - usize::from(trailing);
        if start >= end {
            return Shape::Pattern;
        }
        let inner = &s.parts[start..end];
        if inner.iter().any(|p| matches!(p, StringPart::Special(_))) {
            return Shape::Pattern;
        }
        let inner = SigmaString {
            parts: inner.to_vec(),
        };
        match (leading, trailing) {
            (true, true) => Shape::Contains(inner),
            (false, true) => Shape::StartsWith(inner),
            (true, false) => Shape::EndsWith(inner),
            (false, false) => Shape::Pattern,
        }
    }
}

/// Value during modifier expansion.
enum Expanded {
    Value(SigmaValue),
    Bytes(Vec<u8>),
}

impl QueryGrammar {
    /// Lower every condition of a rule into one query each.
    pub fn lower_rule(&self, rule: &SigmaRule) -> Lowering<Vec<String>> {
        if rule.detection.conditions.is_empty() {
            return Err("rule has no condition".to_string());
        }
        rule.detection
            .conditions
            .iter()
            .map(|condition| self.lower_condition(rule, condition).map(|l| l.text))
            .collect()
    }

    /// Quote and escape a literal string.
    pub fn quote(&self, text: &str) -> String {
        self.quote_string(&SigmaString::from_raw(text))
    }

    /// Render a field name.
    pub fn field_name(&self, name: &str) -> String {
        let simple = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '@'));
        if simple {
            return name.to_string();
        }
        match self.field_quote {
            Some(template) => fill(template, &[("field", name)]),
            None => self.escape(name),
        }
    }

    fn lower_condition(&self, rule: &SigmaRule, expr: &ConditionExpr) -> Lowering<Lowered> {
        match expr {
            ConditionExpr::Identifier(name) => {
                let detection = rule
                    .detection
                    .get(name)
                    .ok_or_else(|| format!("unknown detection '{name}'"))?;
                self.lower_detection(detection)
            }
            ConditionExpr::And(left, right) => {
                let parts = vec![
                    self.lower_condition(rule, left)?,
                    self.lower_condition(rule, right)?,
                ];
                Ok(self.join(Junction::And, parts))
            }
            ConditionExpr::Or(left, right) => {
                let parts = vec![
                    self.lower_condition(rule, left)?,
                    self.lower_condition(rule, right)?,
                ];
                Ok(self.join(Junction::Or, parts))
            }
            ConditionExpr::Not(inner) => Ok(self.negate(self.lower_condition(rule, inner)?)),
            ConditionExpr::Selector {
                quantifier,
                pattern,
            } => {
                let selected = rule
                    .detection
                    .named
                    .iter()
                    .filter(|(name, _)| pattern.matches(name))
                    .map(|(_, detection)| self.lower_detection(detection))
                    .collect::<Lowering<Vec<_>>>()?;
                if selected.is_empty() {
                    return Err(format!("no detection matches '{expr}'"));
                }
                match quantifier {
                    Quantifier::Any => Ok(self.join(Junction::Or, selected)),
                    Quantifier::All => Ok(self.join(Junction::And, selected)),
                    Quantifier::Count(n) => self.lower_count(expr, *n as usize, selected),
                }
            }
        }
    }

    /// `N of` selectors become an OR over every N-element AND-combination.
    fn lower_count(&self, expr: &ConditionExpr, n: usize, selected: Vec<Lowered>) -> Lowering<Lowered> {
        let k = selected.len();
        if n > k {
            return Err(format!("'{expr}' needs {n} detections, only {k} match"));
        }
        if n == k {
            return Ok(self.join(Junction::And, selected));
        }
        if n <= 1 {
            return Ok(self.join(Junction::Or, selected));
        }

        let combos = combinations(k, n, MAX_SELECTOR_COMBINATIONS)
            .ok_or_else(|| format!("'{expr}' expands to too many combinations"))?;
        let alternatives = combos
            .into_iter()
            .map(|combo| {
                let parts = combo.into_iter().map(|i| selected[i].clone()).collect();
                self.join(Junction::And, parts)
            })
            .collect();
        Ok(self.join(Junction::Or, alternatives))
    }

    fn lower_detection(&self, detection: &Detection) -> Lowering<Lowered> {
        match detection {
            Detection::Item(item) => self.lower_item(item),
            Detection::AllOf(children) | Detection::AnyOf(children) if children.is_empty() => {
                Err("detection is empty".to_string())
            }
            Detection::AllOf(children) => {
                let parts = children
                    .iter()
                    .map(|child| self.lower_detection(child))
                    .collect::<Lowering<Vec<_>>>()?;
                Ok(self.join(Junction::And, parts))
            }
            Detection::AnyOf(children) => {
                let parts = children
                    .iter()
                    .map(|child| self.lower_detection(child))
                    .collect::<Lowering<Vec<_>>>()?;
                Ok(self.join(Junction::Or, parts))
            }
        }
    }

    fn lower_item(&self, item: &DetectionItem) -> Lowering<Lowered> {
        for value in &item.values {
            if let SigmaValue::String(s) = value {
                if s.has_placeholders() {
                    return Err(format!(
                        "unresolved placeholder %{}%",
                        s.placeholders().join("%, %")
                    ));
                }
            }
        }

        let has = |modifier| item.field.has_modifier(modifier);
        let junction = if has(Modifier::All) {
            Junction::And
        } else {
            Junction::Or
        };

        let Some(name) = item.field.name.as_deref() else {
            return self.lower_keywords(item, junction);
        };
        let field_name = self.field_name(name);
        let field = field_name.as_str();

        if has(Modifier::Exists) {
            let parts = item
                .values
                .iter()
                .map(|value| {
                    let template = match value {
                        SigmaValue::Bool(false) => self.not_exists_expression,
                        _ => self.exists_expression,
                    };
                    template
                        .map(|t| Lowered::atom(fill(t, &[("field", field)])))
                        .ok_or_else(|| "field existence checks are not supported".to_string())
                })
                .collect::<Lowering<Vec<_>>>()?;
            return Ok(self.join(junction, parts));
        }

        if has(Modifier::Re) {
            let template = self
                .re_expression
                .ok_or_else(|| "regular expressions are not supported".to_string())?;
            let parts = item
                .values
                .iter()
                .map(|value| {
                    let regex = value
                        .as_sigma_string()
                        .map(SigmaString::plain_text)
                        .ok_or_else(|| "regular expressions must be strings".to_string())?;
                    let literal = (self.regex_literal)(&regex);
                    Ok(Lowered::atom(fill(
                        template,
                        &[("field", field), ("regex", literal.as_str())],
                    )))
                })
                .collect::<Lowering<Vec<_>>>()?;
            return Ok(self.join(junction, parts));
        }

        if has(Modifier::Cidr) {
            let template = self
                .cidr_expression
                .ok_or_else(|| "CIDR matching is not supported".to_string())?;
            let parts = item
                .values
                .iter()
                .map(|value| {
                    let network = value
                        .as_sigma_string()
                        .map(SigmaString::plain_text)
                        .ok_or_else(|| "CIDR values must be strings".to_string())?;
                    let quoted = self.quote(&network);
                    Ok(Lowered::atom(fill(
                        template,
                        &[("field", field), ("value", quoted.as_str())],
                    )))
                })
                .collect::<Lowering<Vec<_>>>()?;
            return Ok(self.join(junction, parts));
        }

        let comparison = [
            (Modifier::Lt, "<"),
            (Modifier::Lte, "<="),
            (Modifier::Gt, ">"),
            (Modifier::Gte, ">="),
        ]
        .into_iter()
        .find(|(modifier, _)| has(*modifier));
        if let Some((_, op)) = comparison {
            let template = self
                .compare_expression
                .ok_or_else(|| "numeric comparisons are not supported".to_string())?;
            let parts = item
                .values
                .iter()
                .map(|value| {
                    let number = match value {
                        SigmaValue::Integer(n) => n.to_string(),
                        SigmaValue::Float(n) => n.to_string(),
                        _ => return Err("comparisons require numeric values".to_string()),
                    };
                    Ok(Lowered::atom(fill(
                        template,
                        &[("field", field), ("op", op), ("value", number.as_str())],
                    )))
                })
                .collect::<Lowering<Vec<_>>>()?;
            return Ok(self.join(junction, parts));
        }

        if has(Modifier::FieldRef) {
            let template = self
                .field_ref_expression
                .ok_or_else(|| "field references are not supported".to_string())?;
            let parts = item
                .values
                .iter()
                .map(|value| {
                    let other = value
                        .as_sigma_string()
                        .and_then(SigmaString::as_plain)
                        .ok_or_else(|| "field references must be plain field names".to_string())?;
                    let other = self.field_name(&other);
                    Ok(Lowered::atom(fill(
                        template,
                        &[("field", field), ("other", other.as_str())],
                    )))
                })
                .collect::<Lowering<Vec<_>>>()?;
            return Ok(self.join(junction, parts));
        }

        let values = expand_values(&item.values, &item.field.modifiers)?;
        if values.is_empty() {
            return Err("value modifiers produced no values".to_string());
        }
        let cased = has(Modifier::Cased);

        if junction == Junction::Or && values.len() > 1 && !cased {
            if let Some(list) = self.in_list(field, &values) {
                return Ok(Lowered::atom(list));
            }
        }

        let parts = values
            .iter()
            .map(|value| self.lower_value(field, value, cased))
            .collect::<Lowering<Vec<_>>>()?;
        Ok(self.join(junction, parts))
    }

    fn lower_keywords(&self, item: &DetectionItem, junction: Junction) -> Lowering<Lowered> {
        let template = self
            .keyword_expression
            .ok_or_else(|| "keyword detections are not supported".to_string())?;
        let parts = expand_values(&item.values, &item.field.modifiers)?
            .iter()
            .map(|value| {
                let rendered = match value {
                    SigmaValue::String(s) => self.quote_string(s),
                    SigmaValue::Integer(n) => n.to_string(),
                    SigmaValue::Float(n) => n.to_string(),
                    SigmaValue::Bool(b) => self.bool_literal(*b).to_string(),
                    SigmaValue::Null => return Err("null keywords are not supported".to_string()),
                };
                Ok(Lowered::atom(fill(template, &[("value", rendered.as_str())])))
            })
            .collect::<Lowering<Vec<_>>>()?;
        if parts.is_empty() {
            return Err("value modifiers produced no values".to_string());
        }
        Ok(self.join(junction, parts))
    }

    fn lower_value(&self, field: &str, value: &SigmaValue, cased: bool) -> Lowering<Lowered> {
        let text = match value {
            SigmaValue::Null => {
                let template = self
                    .null_expression
                    .ok_or_else(|| "null values are not supported".to_string())?;
                fill(template, &[("field", field)])
            }
            SigmaValue::Integer(n) => {
                fill(self.number_eq_expression, &[("field", field), ("value", n.to_string().as_str())])
            }
            SigmaValue::Float(n) => {
                fill(self.number_eq_expression, &[("field", field), ("value", n.to_string().as_str())])
            }
            SigmaValue::Bool(b) => fill(
                self.number_eq_expression,
                &[("field", field), ("value", self.bool_literal(*b))],
            ),
            SigmaValue::String(s) => self.lower_string(field, s, cased)?,
        };
        Ok(Lowered::atom(text))
    }

    fn lower_string(&self, field: &str, s: &SigmaString, cased: bool) -> Lowering<String> {
        let shape = Shape::of(s);

        if cased {
            if shape != Shape::Exact {
                return Err("case-sensitive wildcard matching is not supported".to_string());
            }
            let template = self
                .cased_expression
                .ok_or_else(|| "case-sensitive matching is not supported".to_string())?;
            return Ok(fill(
                template,
                &[("field", field), ("value", self.quote_string(s).as_str())],
            ));
        }

        let (template, value) = match shape {
            Shape::Exact => (Some(self.eq_expression), s.clone()),
            Shape::StartsWith(inner) => (self.startswith_expression, inner),
            Shape::EndsWith(inner) => (self.endswith_expression, inner),
            Shape::Contains(inner) => (self.contains_expression, inner),
            Shape::Pattern => (None, s.clone()),
        };
        if let Some(template) = template {
            return Ok(fill(
                template,
                &[("field", field), ("value", self.quote_string(&value).as_str())],
            ));
        }

        match self.wildcard_match_expression {
            Some(template) => {
                let literal = (self.regex_literal)(&wildcard_regex(s));
                Ok(fill(template, &[("field", field), ("regex", literal.as_str())]))
            }
            None => Ok(fill(
                self.eq_expression,
                &[("field", field), ("value", self.quote_string(s).as_str())],
            )),
        }
    }

    fn in_list(&self, field: &str, values: &[SigmaValue]) -> Option<String> {
        let template = self.in_expression?;
        let mut items = Vec::with_capacity(values.len());
        for value in values {
            let s = value.as_sigma_string()?;
            if s.contains_wildcards() && !self.in_allows_wildcards {
                return None;
            }
            items.push(self.quote_string(s));
        }
        let list = items.join(self.list_separator);
        Some(fill(template, &[("field", field), ("list", list.as_str())]))
    }

    fn quote_string(&self, s: &SigmaString) -> String {
        let body = s.render(
            |plain| self.escape(plain),
            |special| match special {
                SpecialChar::WildcardMulti => self.wildcard_multi.to_string(),
                SpecialChar::WildcardSingle => self.wildcard_single.to_string(),
            },
        );
        if body.is_empty() && self.str_quote.is_empty() {
            return "\"\"".to_string();
        }
        format!("{q}{body}{q}", q = self.str_quote)
    }

    fn escape(&self, plain: &str) -> String {
        let mut out = String::with_capacity(plain.len());
        for c in plain.chars() {
            if c == self.escape_char || self.escaped_chars.contains(c) || self.str_quote.contains(c)
            {
                out.push(self.escape_char);
            }
            out.push(c);
        }
        out
    }

    fn bool_literal(&self, value: bool) -> &'static str {
        if value {
            self.bool_values.0
        } else {
            self.bool_values.1
        }
    }

    fn group(&self, text: &str) -> String {
        format!("{}{text}{}", self.group_open, self.group_close)
    }

    fn join(&self, junction: Junction, mut parts: Vec<Lowered>) -> Lowered {
        if parts.len() == 1 {
            return parts.remove(0);
        }
        let precedence = junction.precedence();
        let token = match junction {
            Junction::And => self.and_token,
            Junction::Or => self.or_token,
        };
        let text = parts
            .iter()
            .map(|part| {
                if part.precedence == Precedence::Atom || part.precedence == precedence {
                    part.text.clone()
                } else {
                    self.group(&part.text)
                }
            })
            .collect::<Vec<_>>()
            .join(token);
        Lowered { text, precedence }
    }

    fn negate(&self, operand: Lowered) -> Lowered {
        let inner = if operand.precedence == Precedence::Atom || self.not_delimits_operand {
            operand.text
        } else {
            self.group(&operand.text)
        };
        Lowered::atom(fill(self.not_expression, &[("expr", inner.as_str())]))
    }
}

/// Substitute `{name}` slots in one pass; unknown slots are kept verbatim.
fn fill(template: &str, slots: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len() + 16);
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let slot = after
            .find('}')
            .and_then(|close| {
                let name = &after[..close];
                slots
                    .iter()
                    .find(|(slot, _)| *slot == name)
                    .map(|(_, value)| (close, *value))
            });
        match slot {
            Some((close, value)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Case-insensitive anchored regular expression equivalent to a wildcard string.
fn wildcard_regex(s: &SigmaString) -> String {
    let body = s.render(|plain| regex::escape(plain), |special| match special {
        SpecialChar::WildcardMulti => ".*".to_string(),
        SpecialChar::WildcardSingle => ".".to_string(),
    });
    format!("(?i)^{body}$")
}

/// Index combinations of `n` out of `k`, or `None` beyond `limit` combinations.
fn combinations(k: usize, n: usize, limit: usize) -> Option<Vec<Vec<usize>>> {
    let mut out = Vec::new();
    let mut combo: Vec<usize> = (0..n).collect();
    loop {
        if out.len() == limit {
            return None;
        }
        out.push(combo.clone());

        let Some(i) = (0..n).rev().find(|&i| combo[i] < k - n + i) else {
            return Some(out);
        };
        combo[i] += 1;
        for j in i + 1..n {
            combo[j] = combo[j - 1] + 1;
        }
    }
}

/// Apply the value-transforming modifiers of an item in their written order.
fn expand_values(values: &[SigmaValue], modifiers: &[Modifier]) -> Lowering<Vec<SigmaValue>> {
    let mut current: Vec<Expanded> = values.iter().cloned().map(Expanded::Value).collect();

    for &modifier in modifiers {
        current = match modifier {
            Modifier::Wide => current
                .into_iter()
                .map(|value| match value {
                    Expanded::Value(v) => plain_of(&v, modifier).map(|text| {
                        Expanded::Bytes(text.encode_utf16().flat_map(u16::to_le_bytes).collect())
                    }),
                    Expanded::Bytes(_) => Err("the wide modifier is applied twice".to_string()),
                })
                .collect::<Lowering<Vec<_>>>()?,
            Modifier::Base64 => current
                .into_iter()
                .map(|value| {
                    let bytes = bytes_of(value, modifier)?;
                    Ok(encoded(&STANDARD.encode(bytes)))
                })
                .collect::<Lowering<Vec<_>>>()?,
            Modifier::Base64Offset => {
                let mut expanded = Vec::new();
                for value in current {
                    let bytes = bytes_of(value, modifier)?;
                    expanded.extend(base64_offsets(&bytes).into_iter().map(|v| encoded(&v)));
                }
                expanded
            }
            Modifier::Windash => {
                let mut expanded = Vec::new();
                for value in current {
                    let s = string_of(value, modifier)?;
                    expanded.extend(
                        windash_variants(&s)
                            .into_iter()
                            .map(|v| Expanded::Value(SigmaValue::String(v))),
                    );
                }
                expanded
            }
            Modifier::Contains | Modifier::StartsWith | Modifier::EndsWith => current
                .into_iter()
                .map(|value| {
                    let mut s = string_of(value, modifier)?;
                    if modifier != Modifier::StartsWith {
                        s.prepend_wildcard();
                    }
                    if modifier != Modifier::EndsWith {
                        s.append_wildcard();
                    }
                    Ok(Expanded::Value(SigmaValue::String(s)))
                })
                .collect::<Lowering<Vec<_>>>()?,
            _ => current,
        };
    }

    current
        .into_iter()
        .map(|value| match value {
            Expanded::Value(v) => Ok(v),
            Expanded::Bytes(_) => {
                Err("the wide modifier must be followed by base64 or base64offset".to_string())
            }
        })
        .collect()
}

fn encoded(text: &str) -> Expanded {
    Expanded::Value(SigmaValue::String(SigmaString::from_raw(text)))
}

fn plain_of(value: &SigmaValue, modifier: Modifier) -> Lowering<String> {
    match value {
        SigmaValue::String(s) => s.as_plain().ok_or_else(|| {
            format!(
                "the {} modifier requires values without wildcards",
                modifier.as_str()
            )
        }),
        SigmaValue::Integer(n) => Ok(n.to_string()),
        SigmaValue::Float(n) => Ok(n.to_string()),
        _ => Err(format!("the {} modifier requires string values", modifier.as_str())),
    }
}

fn bytes_of(value: Expanded, modifier: Modifier) -> Lowering<Vec<u8>> {
    match value {
        Expanded::Bytes(bytes) => Ok(bytes),
        Expanded::Value(v) => plain_of(&v, modifier).map(String::into_bytes),
    }
}

fn string_of(value: Expanded, modifier: Modifier) -> Lowering<SigmaString> {
    match value {
        Expanded::Value(SigmaValue::String(s)) => Ok(s),
        Expanded::Value(SigmaValue::Integer(n)) => Ok(SigmaString::from_raw(&n.to_string())),
        Expanded::Value(SigmaValue::Float(n)) => Ok(SigmaString::from_raw(&n.to_string())),
        Expanded::Value(_) => Err(format!(
            "the {} modifier requires string values",
            modifier.as_str()
        )),
        Expanded::Bytes(_) => Err(format!(
            "the {} modifier cannot follow wide",
            modifier.as_str()
        )),
    }
}

/// The three base64 encodings of `bytes` at every alignment, trimmed to the
/// characters that do not depend on surrounding data.
fn base64_offsets(bytes: &[u8]) -> Vec<String> {
    const START: [usize; 3] = [0, 2, 3];
    let mut variants = Vec::with_capacity(3);
    for shift in 0..3 {
        let mut padded = vec![b' '; shift];
        padded.extend_from_slice(bytes);
        let encoded = STANDARD.encode(&padded);
        let end = match (bytes.len() + shift) % 3 {
            0 => encoded.len(),
            1 => encoded.len().saturating_sub(3),
            _ => encoded.len().saturating_sub(2),
        };
        if let Some(variant) = encoded.get(START[shift]..end) {
            if !variant.is_empty() {
                variants.push(variant.to_string());
            }
        }
    }
    variants
}

/// Variants of a command line with every option dash replaced by each of the
/// characters Windows accepts as option prefix.
fn windash_variants(s: &SigmaString) -> Vec<SigmaString> {
    const DASHES: [char; 5] = ['-', '/', '\u{2013}', '\u{2014}', '\u{2015}'];
    let mut variants: Vec<SigmaString> = Vec::with_capacity(DASHES.len());
    for dash in DASHES {
        let mut variant = s.clone();
        let mut word_start = true;
        variant.map_plain(|plain| {
            plain
                .chars()
                .map(|c| {
                    let replaced = if word_start && matches!(c, '-' | '/') {
                        dash
                    } else {
                        c
                    };
                    word_start = c.is_whitespace();
                    replaced
                })
                .collect()
        });
        if !variants.contains(&variant) {
            variants.push(variant);
        }
    }
    variants
}

/// A detection rule after lowering.
#[derive(Debug, Clone)]
pub struct ConvertedRule {
    /// The rule as processed by the pipeline.
    pub rule: SigmaRule,
    pub state: PipelineState,
    /// One query per condition.
    pub queries: Vec<String>,
    /// False for rules only used as input of a non-generating correlation.
    pub standalone: bool,
}

impl ConvertedRule {
    /// All queries of the rule as a single expression.
    pub fn combined_query(&self, grammar: &QueryGrammar) -> String {
        match self.queries.as_slice() {
            [single] => single.clone(),
            many => many
                .iter()
                .map(|q| grammar.group(q))
                .collect::<Vec<_>>()
                .join(grammar.or_token),
        }
    }
}

/// Conversion driver shared by text backends.
pub struct TextQueryBackend {
    grammar: &'static QueryGrammar,
    config: BackendConfig,
    errors: Vec<RuleFailure>,
    halted: bool,
}

impl TextQueryBackend {
    pub fn new(grammar: &'static QueryGrammar, config: BackendConfig) -> Self {
        Self {
            grammar,
            config,
            errors: Vec::new(),
            halted: false,
        }
    }

    pub fn grammar(&self) -> &'static QueryGrammar {
        self.grammar
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn errors(&self) -> &[RuleFailure] {
        &self.errors
    }

    /// Set once a failure occurred while errors are not collected.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Process and lower every detection rule of a collection.
    ///
    /// Resets the failures of any previous run.
    pub fn convert_rules(&mut self, collection: &SigmaCollection) -> Vec<ConvertedRule> {
        self.errors.clear();
        self.halted = false;

        let correlation_only = collection.correlation_only_references();
        let mut converted = Vec::with_capacity(collection.rules.len());

        for rule in &collection.rules {
            if self.halted {
                break;
            }
            let processed = match &self.config.pipeline {
                Some(pipeline) => pipeline.apply(rule),
                None => ProcessedRule::unprocessed(rule),
            };
            if let Some(message) = processed.failure {
                self.fail(&rule.source, message);
                continue;
            }
            match self.grammar.lower_rule(&processed.rule) {
                Ok(queries) => converted.push(ConvertedRule {
                    standalone: !correlation_only.iter().any(|r| rule.is_referenced_by(r)),
                    rule: processed.rule,
                    state: processed.state,
                    queries,
                }),
                Err(message) => self.fail(&rule.source, message),
            }
        }
        converted
    }

    /// Record a per-rule failure.
    pub fn fail(&mut self, source: &RuleSource, message: impl Into<String>) {
        let failure = RuleFailure::new(source.clone(), message);
        debug!(rule = %failure.source, reason = %failure.message, "rule not converted");
        self.errors.push(failure);
        if !self.config.collect_errors {
            self.halted = true;
        }
    }

    /// Report every correlation rule of the collection as unsupported.
    pub fn reject_correlations(&mut self, collection: &SigmaCollection) {
        for correlation in &collection.correlations {
            if self.halted {
                break;
            }
            self.fail(
                &correlation.source,
                "correlation rules are not supported by this backend",
            );
        }
    }

    /// The converted rules referenced by a correlation, in reference order.
    pub fn correlation_inputs<'a>(
        &self,
        collection: &SigmaCollection,
        converted: &'a [ConvertedRule],
        correlation: &CorrelationRule,
    ) -> Lowering<Vec<&'a ConvertedRule>> {
        correlation
            .rules
            .iter()
            .map(|reference| {
                converted
                    .iter()
                    .find(|c| c.rule.is_referenced_by(reference))
                    .ok_or_else(|| match collection.find_rule(reference) {
                        Some(_) => format!("referenced rule '{reference}' could not be converted"),
                        None => format!("correlation references unknown rule '{reference}'"),
                    })
            })
            .collect()
    }
}
