//! In-memory model of SIGMA rules.
//!
//! A conversion request parses its input into a [`SigmaCollection`]: an ordered
//! set of detection rules, correlation rules and filters. The collection is
//! created per request and never shared between requests.
//!
//! The model is organized into several sub-modules:
//! - [`value`] - Typed detection values with wildcard structure
//! - [`condition`] - Tokenization and parsing of condition expressions
//! - [`parser`] - YAML documents to collection
//!
//! # Examples
//!
//! ```rust
//! use sigma_convert::rule::SigmaCollection;
//!
//! let rule_yaml = r#"
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
//! let collection = SigmaCollection::from_yaml(rule_yaml)?;
//! assert_eq!(collection.rules.len(), 1);
//! assert_eq!(collection.rules[0].title, "Whoami Execution");
//! # Ok::<(), sigma_convert::RuleError>(())
//! ```

pub mod condition;
pub mod parser;
pub mod value;

use std::fmt;

pub use condition::{parse_condition, ConditionExpr, Quantifier, SelectorPattern};
pub use parser::{merge_filter, DOCUMENT_SEPARATOR};
pub use value::{SigmaString, SigmaValue, SpecialChar, StringPart, Timespan};

/// Severity level of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Level {
    Informational,
    Low,
    Medium,
    High,
    Critical,
}

impl Level {
    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "informational" => Some(Level::Informational),
            "low" => Some(Level::Low),
            "medium" => Some(Level::Medium),
            "high" => Some(Level::High),
            "critical" => Some(Level::Critical),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Informational => "informational",
            Level::Low => "low",
            Level::Medium => "medium",
            Level::High => "high",
            Level::Critical => "critical",
        }
    }
}

/// SIGMA field modifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Modifier {
    Contains,
    StartsWith,
    EndsWith,
    All,
    Base64,
    Base64Offset,
    Wide,
    Windash,
    Re,
    Cidr,
    Cased,
    Exists,
    Expand,
    FieldRef,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Modifier {
    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "contains" => Some(Modifier::Contains),
            "startswith" => Some(Modifier::StartsWith),
            "endswith" => Some(Modifier::EndsWith),
            "all" => Some(Modifier::All),
            "base64" => Some(Modifier::Base64),
            "base64offset" => Some(Modifier::Base64Offset),
            "wide" | "utf16le" => Some(Modifier::Wide),
            "windash" => Some(Modifier::Windash),
            "re" => Some(Modifier::Re),
            "cidr" => Some(Modifier::Cidr),
            "cased" => Some(Modifier::Cased),
            "exists" => Some(Modifier::Exists),
            "expand" => Some(Modifier::Expand),
            "fieldref" => Some(Modifier::FieldRef),
            "gt" => Some(Modifier::Gt),
            "gte" => Some(Modifier::Gte),
            "lt" => Some(Modifier::Lt),
            "lte" => Some(Modifier::Lte),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Modifier::Contains => "contains",
            Modifier::StartsWith => "startswith",
            Modifier::EndsWith => "endswith",
            Modifier::All => "all",
            Modifier::Base64 => "base64",
            Modifier::Base64Offset => "base64offset",
            Modifier::Wide => "wide",
            Modifier::Windash => "windash",
            Modifier::Re => "re",
            Modifier::Cidr => "cidr",
            Modifier::Cased => "cased",
            Modifier::Exists => "exists",
            Modifier::Expand => "expand",
            Modifier::FieldRef => "fieldref",
            Modifier::Gt => "gt",
            Modifier::Gte => "gte",
            Modifier::Lt => "lt",
            Modifier::Lte => "lte",
        }
    }
}

/// Field name with its ordered modifiers, e.g. `CommandLine|contains|all`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    /// `None` for keyword detections.
    pub name: Option<String>,
    pub modifiers: Vec<Modifier>,
}

impl FieldSpec {
    pub fn new(name: Option<String>, modifiers: Vec<Modifier>) -> Self {
        Self { name, modifiers }
    }

    pub fn has_modifier(&self, modifier: Modifier) -> bool {
        self.modifiers.contains(&modifier)
    }

    pub fn is_keyword(&self) -> bool {
        self.name.is_none()
    }
}

/// A field with its values. Multiple values are OR-linked unless the `all`
/// modifier is present.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionItem {
    pub field: FieldSpec,
    pub values: Vec<SigmaValue>,
    /// Ids of processing items that transformed this item.
    pub applied_items: Vec<String>,
}

impl DetectionItem {
    pub fn new(field: FieldSpec, values: Vec<SigmaValue>) -> Self {
        Self {
            field,
            values,
            applied_items: Vec::new(),
        }
    }
}

/// A detection tree.
///
/// YAML mappings become [`Detection::AllOf`], lists of mappings become
/// [`Detection::AnyOf`], and lists of plain values become a keyword
/// [`Detection::Item`].
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    Item(DetectionItem),
    AllOf(Vec<Detection>),
    AnyOf(Vec<Detection>),
}

impl Detection {
    /// Visit every detection item mutably.
    pub fn for_each_item_mut(&mut self, f: &mut impl FnMut(&mut DetectionItem)) {
        match self {
            Detection::Item(item) => f(item),
            Detection::AllOf(children) | Detection::AnyOf(children) => {
                for child in children {
                    child.for_each_item_mut(f);
                }
            }
        }
    }

    /// Visit every detection item.
    pub fn for_each_item(&self, f: &mut impl FnMut(&DetectionItem)) {
        match self {
            Detection::Item(item) => f(item),
            Detection::AllOf(children) | Detection::AnyOf(children) => {
                for child in children {
                    child.for_each_item(f);
                }
            }
        }
    }
}

/// The detection section of a rule: named detections and conditions.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Detections {
    /// Named detections in document order.
    pub named: Vec<(String, Detection)>,
    pub conditions: Vec<ConditionExpr>,
    pub timeframe: Option<String>,
}

impl Detections {
    pub fn get(&self, name: &str) -> Option<&Detection> {
        self.named
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, detection)| detection)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Insert or replace a named detection, keeping the position of an
    /// existing entry.
    pub fn insert(&mut self, name: String, detection: Detection) {
        match self.named.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = detection,
            None => self.named.push((name, detection)),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.named.iter().map(|(n, _)| n.as_str())
    }
}

/// Log source of a rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSource {
    pub category: Option<String>,
    pub product: Option<String>,
    pub service: Option<String>,
    pub definition: Option<String>,
}

/// Where a rule came from, used to identify it in error messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSource {
    /// 1-based position of the document in the input stream.
    pub index: usize,
    pub title: String,
    pub id: Option<String>,
    /// Source text of the document.
    pub fragment: String,
}

impl RuleSource {
    pub fn new(index: usize, title: String, id: Option<String>, fragment: String) -> Self {
        Self {
            index,
            title,
            id,
            fragment,
        }
    }
}

impl fmt::Display for RuleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "document {} '{}' ({id})", self.index, self.title),
            None => write!(f, "document {} '{}'", self.index, self.title),
        }
    }
}

/// A SIGMA detection rule.
#[derive(Debug, Clone, PartialEq)]
pub struct SigmaRule {
    pub title: String,
    pub id: Option<String>,
    pub name: Option<String>,
    pub status: Option<String>,
    pub level: Option<Level>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub date: Option<String>,
    pub modified: Option<String>,
    pub tags: Vec<String>,
    pub references: Vec<String>,
    pub falsepositives: Vec<String>,
    pub fields: Vec<String>,
    pub logsource: LogSource,
    pub detection: Detections,
    pub source: RuleSource,
}

impl SigmaRule {
    /// Check whether `reference` names this rule by id or by name.
    pub fn is_referenced_by(&self, reference: &str) -> bool {
        self.id.as_deref() == Some(reference) || self.name.as_deref() == Some(reference)
    }
}

/// Kinds of correlation rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorrelationType {
    EventCount,
    ValueCount,
    Temporal,
}

impl CorrelationType {
    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "event_count" => Some(CorrelationType::EventCount),
            "value_count" => Some(CorrelationType::ValueCount),
            "temporal" => Some(CorrelationType::Temporal),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CorrelationType::EventCount => "event_count",
            CorrelationType::ValueCount => "value_count",
            CorrelationType::Temporal => "temporal",
        }
    }
}

/// Comparison operator of a correlation threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionOperator {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
}

impl ConditionOperator {
    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "lt" => Some(ConditionOperator::Lt),
            "lte" => Some(ConditionOperator::Lte),
            "gt" => Some(ConditionOperator::Gt),
            "gte" => Some(ConditionOperator::Gte),
            "eq" => Some(ConditionOperator::Eq),
            _ => None,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            ConditionOperator::Lt => "<",
            ConditionOperator::Lte => "<=",
            ConditionOperator::Gt => ">",
            ConditionOperator::Gte => ">=",
            ConditionOperator::Eq => "=",
        }
    }
}

/// Threshold of a correlation rule, e.g. `gte: 10`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationCondition {
    pub op: ConditionOperator,
    pub count: u64,
    /// Field whose distinct values are counted (`value_count` only).
    pub field: Option<String>,
}

/// A SIGMA correlation rule combining the matches of other rules.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationRule {
    pub title: String,
    pub id: Option<String>,
    pub name: Option<String>,
    pub level: Option<Level>,
    pub tags: Vec<String>,
    pub correlation_type: CorrelationType,
    pub rules: Vec<String>,
    pub group_by: Vec<String>,
    pub timespan: Timespan,
    pub condition: CorrelationCondition,
    pub generate: bool,
    pub source: RuleSource,
}

/// A SIGMA filter adding conditions to the rules it references.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterRule {
    pub title: String,
    pub id: Option<String>,
    pub logsource: Option<LogSource>,
    pub rules: Vec<String>,
    pub detection: Detections,
    pub source: RuleSource,
}

/// An ordered collection of parsed SIGMA documents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SigmaCollection {
    pub rules: Vec<SigmaRule>,
    pub correlations: Vec<CorrelationRule>,
    pub filters: Vec<FilterRule>,
}

impl SigmaCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rules and correlation rules, the units a backend converts.
    pub fn len(&self) -> usize {
        self.rules.len() + self.correlations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find a detection rule by id or name.
    pub fn find_rule(&self, reference: &str) -> Option<&SigmaRule> {
        self.rules.iter().find(|r| r.is_referenced_by(reference))
    }

    /// Ids and names of rules referenced by non-generating correlations.
    ///
    /// Such rules are only used as correlation inputs and are not emitted as
    /// standalone queries.
    pub fn correlation_only_references(&self) -> Vec<&str> {
        self.correlations
            .iter()
            .filter(|c| !c.generate)
            .flat_map(|c| c.rules.iter().map(String::as_str))
            .collect()
    }
}
