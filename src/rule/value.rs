//! Typed values of detection items.
//!
//! SIGMA string values use `*` and `?` as wildcards and `\` as escape
//! character. Values of `expand` items may additionally contain `%name%`
//! placeholders that a processing pipeline is expected to resolve.

use std::fmt;

use crate::error::RuleError;

/// Wildcards that may appear inside a [`SigmaString`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialChar {
    WildcardMulti,
    WildcardSingle,
}

/// One part of a [`SigmaString`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StringPart {
    Plain(String),
    Special(SpecialChar),
    Placeholder(String),
}

/// A string value that keeps its wildcard structure.
///
/// Backslash only consumes itself when followed by `*`, `?` or `\`; before
/// any other character it is kept literally, so Windows paths such as
/// `C:\Windows\` survive unchanged.
///
/// # Examples
///
/// ```rust
/// use sigma_convert::rule::{SigmaString, SpecialChar, StringPart};
///
/// let s = SigmaString::new(r"*\cmd.exe");
/// assert!(s.contains_wildcards());
/// assert_eq!(s.parts[0], StringPart::Special(SpecialChar::WildcardMulti));
/// assert_eq!(s.parts[1], StringPart::Plain(r"\cmd.exe".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SigmaString {
    pub parts: Vec<StringPart>,
}

impl SigmaString {
    /// Parse a string interpreting wildcards and escapes.
    pub fn new(s: &str) -> Self {
        let mut parts = Vec::new();
        let mut acc = String::new();
        let mut escaped = false;

        for c in s.chars() {
            if escaped {
                if !matches!(c, '*' | '?' | '\\') {
                    acc.push('\\');
                }
                acc.push(c);
                escaped = false;
                continue;
            }
            match c {
                '\\' => escaped = true,
                '*' | '?' => {
                    if !acc.is_empty() {
                        parts.push(StringPart::Plain(std::mem::take(&mut acc)));
                    }
                    let special = if c == '*' {
                        SpecialChar::WildcardMulti
                    } else {
                        SpecialChar::WildcardSingle
                    };
                    parts.push(StringPart::Special(special));
                }
                _ => acc.push(c),
            }
        }

        if escaped {
            acc.push('\\');
        }
        if !acc.is_empty() {
            parts.push(StringPart::Plain(acc));
        }

        Self { parts }
    }

    /// Create a string without wildcard interpretation, used for `re` values.
    pub fn from_raw(s: &str) -> Self {
        let parts = if s.is_empty() {
            Vec::new()
        } else {
            vec![StringPart::Plain(s.to_string())]
        };
        Self { parts }
    }

    /// Parse a string and additionally split out `%name%` placeholders.
    pub fn with_placeholders(s: &str) -> Self {
        let base = Self::new(s);
        let mut parts = Vec::new();
        for part in base.parts {
            match part {
                StringPart::Plain(text) => split_placeholders(&text, &mut parts),
                other => parts.push(other),
            }
        }
        Self { parts }
    }

    pub fn is_plain(&self) -> bool {
        self.parts.iter().all(|p| matches!(p, StringPart::Plain(_)))
    }

    pub fn contains_wildcards(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, StringPart::Special(_)))
    }

    pub fn has_placeholders(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, StringPart::Placeholder(_)))
    }

    /// Names of all placeholders in this string, in order of appearance.
    pub fn placeholders(&self) -> Vec<&str> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                StringPart::Placeholder(name) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// The string content when it contains neither wildcards nor placeholders.
    pub fn as_plain(&self) -> Option<String> {
        if !self.is_plain() {
            return None;
        }
        Some(self.plain_text())
    }

    /// Concatenation of all plain parts, ignoring wildcards.
    pub fn plain_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                StringPart::Plain(s) => Some(s.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn starts_with_wildcard(&self) -> bool {
        matches!(
            self.parts.first(),
            Some(StringPart::Special(SpecialChar::WildcardMulti))
        )
    }

    pub fn ends_with_wildcard(&self) -> bool {
        matches!(
            self.parts.last(),
            Some(StringPart::Special(SpecialChar::WildcardMulti))
        )
    }

    /// Prepend a multi-character wildcard unless one is already there.
    pub fn prepend_wildcard(&mut self) {
        if !self.starts_with_wildcard() {
            self.parts
                .insert(0, StringPart::Special(SpecialChar::WildcardMulti));
        }
    }

    /// Append a multi-character wildcard unless one is already there.
    pub fn append_wildcard(&mut self) {
        if !self.ends_with_wildcard() {
            self.parts
                .push(StringPart::Special(SpecialChar::WildcardMulti));
        }
    }

    /// Render the string, mapping plain text and wildcards through callbacks.
    pub fn render<P, S>(&self, mut plain: P, mut special: S) -> String
    where
        P: FnMut(&str) -> String,
        S: FnMut(SpecialChar) -> String,
    {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                StringPart::Plain(text) => out.push_str(&plain(text)),
                StringPart::Special(c) => out.push_str(&special(*c)),
                StringPart::Placeholder(name) => {
                    out.push('%');
                    out.push_str(name);
                    out.push('%');
                }
            }
        }
        out
    }

    /// Apply a function to every plain part.
    pub fn map_plain<F>(&mut self, mut f: F)
    where
        F: FnMut(&str) -> String,
    {
        for part in &mut self.parts {
            if let StringPart::Plain(text) = part {
                *text = f(text);
            }
        }
    }
}

fn split_placeholders(text: &str, parts: &mut Vec<StringPart>) {
    let mut rest = text;
    while let Some(start) = rest.find('%') {
        let after = &rest[start + 1..];
        let Some(len) = after.find('%') else {
            break;
        };
        let name = &after[..len];
        if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
            // Not a placeholder; keep the first '%' and move on.
            push_plain(parts, &rest[..start + 1]);
            rest = after;
            continue;
        }
        push_plain(parts, &rest[..start]);
        parts.push(StringPart::Placeholder(name.to_string()));
        rest = &after[len + 1..];
    }
    push_plain(parts, rest);
}

fn push_plain(parts: &mut Vec<StringPart>, text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(StringPart::Plain(last)) = parts.last_mut() {
        last.push_str(text);
    } else {
        parts.push(StringPart::Plain(text.to_string()));
    }
}

impl fmt::Display for SigmaString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self.render(
            |plain| {
                plain
                    .replace('\\', "\\\\")
                    .replace('*', "\\*")
                    .replace('?', "\\?")
            },
            |special| match special {
                SpecialChar::WildcardMulti => "*".to_string(),
                SpecialChar::WildcardSingle => "?".to_string(),
            },
        );
        f.write_str(&text)
    }
}

/// A typed detection value.
#[derive(Debug, Clone, PartialEq)]
pub enum SigmaValue {
    String(SigmaString),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl SigmaValue {
    pub fn from_yaml(v: &serde_yaml::Value) -> Self {
        match v {
            serde_yaml::Value::String(s) => SigmaValue::String(SigmaString::new(s)),
            serde_yaml::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    SigmaValue::Integer(i)
                } else if let Some(f) = n.as_f64() {
                    SigmaValue::Float(f)
                } else {
                    SigmaValue::Null
                }
            }
            serde_yaml::Value::Bool(b) => SigmaValue::Bool(*b),
            serde_yaml::Value::Null => SigmaValue::Null,
            other => SigmaValue::String(SigmaString::from_raw(
                serde_yaml::to_string(other)
                    .unwrap_or_default()
                    .trim_end(),
            )),
        }
    }

    pub fn as_sigma_string(&self) -> Option<&SigmaString> {
        match self {
            SigmaValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SigmaValue::Null)
    }

    /// Numeric value when the detection value is a number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            SigmaValue::Integer(i) => Some(*i as f64),
            SigmaValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Textual form used by string-oriented transformations.
    pub fn to_plain_string(&self) -> String {
        match self {
            SigmaValue::String(s) => s.plain_text(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for SigmaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SigmaValue::String(s) => write!(f, "{s}"),
            SigmaValue::Integer(n) => write!(f, "{n}"),
            SigmaValue::Float(n) => write!(f, "{n}"),
            SigmaValue::Bool(b) => write!(f, "{b}"),
            SigmaValue::Null => write!(f, "null"),
        }
    }
}

/// A duration such as `5m` or `1h`, used by correlation rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timespan {
    pub count: u64,
    pub unit: char,
    pub seconds: u64,
}

impl Timespan {
    pub fn parse(s: &str) -> Result<Self, RuleError> {
        let s = s.trim();
        let Some(unit) = s.chars().last() else {
            return Err(RuleError::InvalidTimespan(s.to_string()));
        };
        let count: u64 = s[..s.len() - unit.len_utf8()]
            .parse()
            .map_err(|_| RuleError::InvalidTimespan(s.to_string()))?;

        let multiplier = match unit {
            's' => 1,
            'm' => 60,
            'h' => 3_600,
            'd' => 86_400,
            'w' => 604_800,
            'M' => 2_629_746,
            'y' => 31_556_952,
            _ => return Err(RuleError::InvalidTimespan(s.to_string())),
        };

        let seconds = count
            .checked_mul(multiplier)
            .ok_or_else(|| RuleError::InvalidTimespan(s.to_string()))?;

        Ok(Self {
            count,
            unit,
            seconds,
        })
    }
}

impl fmt::Display for Timespan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.count, self.unit)
    }
}
