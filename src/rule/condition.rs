//! SIGMA condition expression parsing.
//!
//! This module provides tokenization and parsing of SIGMA condition expressions
//! such as `selection and not 1 of filter_*` into a [`ConditionExpr`] tree.
//! Operator precedence is `not` > `and` > `or`.

use std::fmt;

use crate::error::RuleError;

type Result<T> = std::result::Result<T, RuleError>;

/// Tokens in a SIGMA condition expression.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Identifier(String),
    And,
    Or,
    Not,
    LeftParen,
    RightParen,
    Of,
    Them,
    All,
    Any,
    Number(u64),
    Wildcard(String),
}

/// Quantifier of a selector expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Quantifier {
    /// `1 of ...` or `any of ...`
    Any,
    /// `all of ...`
    All,
    /// `N of ...` with N > 1
    Count(u64),
}

impl fmt::Display for Quantifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quantifier::Any => write!(f, "1"),
            Quantifier::All => write!(f, "all"),
            Quantifier::Count(n) => write!(f, "{n}"),
        }
    }
}

/// Target of a selector expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorPattern {
    Them,
    Pattern(String),
}

impl SelectorPattern {
    /// Check whether a detection name is selected by this pattern.
    pub fn matches(&self, name: &str) -> bool {
        match self {
            SelectorPattern::Them => !name.starts_with('_'),
            SelectorPattern::Pattern(pattern) => wildcard_match(pattern, name),
        }
    }
}

impl fmt::Display for SelectorPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectorPattern::Them => write!(f, "them"),
            SelectorPattern::Pattern(p) => write!(f, "{p}"),
        }
    }
}

/// Parsed condition expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionExpr {
    Identifier(String),
    And(Box<ConditionExpr>, Box<ConditionExpr>),
    Or(Box<ConditionExpr>, Box<ConditionExpr>),
    Not(Box<ConditionExpr>),
    Selector {
        quantifier: Quantifier,
        pattern: SelectorPattern,
    },
}

impl ConditionExpr {
    pub fn and(left: ConditionExpr, right: ConditionExpr) -> Self {
        ConditionExpr::And(Box::new(left), Box::new(right))
    }

    /// All detection identifiers referenced directly by name.
    pub fn identifiers(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_identifiers(&mut out);
        out
    }

    fn collect_identifiers<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            ConditionExpr::Identifier(name) => out.push(name),
            ConditionExpr::And(l, r) | ConditionExpr::Or(l, r) => {
                l.collect_identifiers(out);
                r.collect_identifiers(out);
            }
            ConditionExpr::Not(inner) => inner.collect_identifiers(out),
            ConditionExpr::Selector { .. } => {}
        }
    }

    /// Rename identifiers and selector patterns through `f`; `them` becomes `f("*")`.
    pub(crate) fn rename(&mut self, f: &impl Fn(&str) -> String) {
        match self {
            ConditionExpr::Identifier(name) => *name = f(name),
            ConditionExpr::And(l, r) | ConditionExpr::Or(l, r) => {
                l.rename(f);
                r.rename(f);
            }
            ConditionExpr::Not(inner) => inner.rename(f),
            ConditionExpr::Selector { pattern, .. } => {
                let renamed = match pattern {
                    SelectorPattern::Them => f("*"),
                    SelectorPattern::Pattern(p) => f(p),
                };
                *pattern = SelectorPattern::Pattern(renamed);
            }
        }
    }
}

impl fmt::Display for ConditionExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionExpr::Identifier(name) => write!(f, "{name}"),
            ConditionExpr::And(l, r) => write!(f, "({l} and {r})"),
            ConditionExpr::Or(l, r) => write!(f, "({l} or {r})"),
            ConditionExpr::Not(inner) => write!(f, "not {inner}"),
            ConditionExpr::Selector {
                quantifier,
                pattern,
            } => write!(f, "{quantifier} of {pattern}"),
        }
    }
}

/// Recursive descent parser for SIGMA conditions.
pub(crate) struct ConditionParser<'a> {
    tokens: &'a [Token],
    position: usize,
}

impl<'a> ConditionParser<'a> {
    pub(crate) fn new(tokens: &'a [Token]) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    fn current_token(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.current_token().cloned();
        self.position += 1;
        token
    }

    fn is_finished(&self) -> bool {
        self.position >= self.tokens.len()
    }

    /// Parse OR expressions (lowest precedence).
    pub(crate) fn parse_or_expression(&mut self) -> Result<ConditionExpr> {
        let mut left = self.parse_and_expression()?;

        while let Some(Token::Or) = self.current_token() {
            self.advance();
            let right = self.parse_and_expression()?;
            left = ConditionExpr::Or(Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    /// Parse AND expressions (medium precedence).
    fn parse_and_expression(&mut self) -> Result<ConditionExpr> {
        let mut left = self.parse_not_expression()?;

        while let Some(Token::And) = self.current_token() {
            self.advance();
            let right = self.parse_not_expression()?;
            left = ConditionExpr::And(Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    /// Parse NOT expressions (highest precedence).
    fn parse_not_expression(&mut self) -> Result<ConditionExpr> {
        if let Some(Token::Not) = self.current_token() {
            self.advance();
            let operand = self.parse_not_expression()?;
            Ok(ConditionExpr::Not(Box::new(operand)))
        } else {
            self.parse_primary()
        }
    }

    fn parse_primary(&mut self) -> Result<ConditionExpr> {
        match self.advance() {
            Some(Token::LeftParen) => {
                let expr = self.parse_or_expression()?;
                match self.advance() {
                    Some(Token::RightParen) => Ok(expr),
                    _ => Err(RuleError::Condition(
                        "expected closing parenthesis".to_string(),
                    )),
                }
            }
            Some(Token::Identifier(name)) => Ok(ConditionExpr::Identifier(name)),
            Some(Token::Number(count)) => {
                let quantifier = match count {
                    0 => {
                        return Err(RuleError::Condition(
                            "quantifier must be at least 1".to_string(),
                        ))
                    }
                    1 => Quantifier::Any,
                    n => Quantifier::Count(n),
                };
                self.parse_selector(quantifier)
            }
            Some(Token::Any) => self.parse_selector(Quantifier::Any),
            Some(Token::All) => self.parse_selector(Quantifier::All),
            Some(other) => Err(RuleError::Condition(format!(
                "unexpected token {other:?} in condition"
            ))),
            None => Err(RuleError::Condition(
                "unexpected end of condition".to_string(),
            )),
        }
    }

    fn parse_selector(&mut self, quantifier: Quantifier) -> Result<ConditionExpr> {
        if self.advance() != Some(Token::Of) {
            return Err(RuleError::Condition(format!(
                "expected 'of' after '{quantifier}'"
            )));
        }

        let pattern = match self.advance() {
            Some(Token::Them) => SelectorPattern::Them,
            Some(Token::Wildcard(pattern)) | Some(Token::Identifier(pattern)) => {
                SelectorPattern::Pattern(pattern)
            }
            _ => {
                return Err(RuleError::Condition(
                    "expected 'them' or pattern after 'of'".to_string(),
                ))
            }
        };

        Ok(ConditionExpr::Selector {
            quantifier,
            pattern,
        })
    }
}

/// Tokenize a SIGMA condition string.
pub(crate) fn tokenize_condition(condition: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = condition.chars().peekable();

    while let Some(&ch) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                tokens.push(Token::LeftParen);
                chars.next();
            }
            ')' => {
                tokens.push(Token::RightParen);
                chars.next();
            }
            c if c.is_ascii_alphanumeric() || c == '_' || c == '*' => {
                let mut word = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_alphanumeric() || matches!(ch, '_' | '*' | '-' | '.') {
                        word.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }

                let token = match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "of" => Token::Of,
                    "them" => Token::Them,
                    "all" => Token::All,
                    "any" => Token::Any,
                    _ if word.chars().all(|c| c.is_ascii_digit()) => {
                        let number = word.parse::<u64>().map_err(|_| {
                            RuleError::Condition(format!("invalid number '{word}'"))
                        })?;
                        Token::Number(number)
                    }
                    _ if word.contains('*') => Token::Wildcard(word),
                    _ => Token::Identifier(word),
                };
                tokens.push(token);
            }
            _ => {
                return Err(RuleError::Condition(format!(
                    "unexpected character in condition: '{ch}'"
                )));
            }
        }
    }

    Ok(tokens)
}

/// Parse a condition string into an expression tree.
///
/// # Examples
///
/// ```rust
/// use sigma_convert::rule::parse_condition;
///
/// let expr = parse_condition("selection and not 1 of filter_*")?;
/// assert_eq!(expr.to_string(), "(selection and not 1 of filter_*)");
/// # Ok::<(), sigma_convert::RuleError>(())
/// ```
pub fn parse_condition(condition: &str) -> Result<ConditionExpr> {
    let tokens = tokenize_condition(condition)?;
    if tokens.is_empty() {
        return Err(RuleError::Condition("empty condition".to_string()));
    }

    let mut parser = ConditionParser::new(&tokens);
    let expr = parser.parse_or_expression()?;
    if !parser.is_finished() {
        return Err(RuleError::Condition(format!(
            "unexpected trailing tokens in condition '{condition}'"
        )));
    }
    Ok(expr)
}

/// Match a name against a pattern where `*` matches any run of characters.
pub(crate) fn wildcard_match(pattern: &str, name: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == name;
    }

    let mut rest = name;
    for (i, part) in parts.iter().enumerate() {
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else if let Some(pos) = rest.find(part) {
            rest = &rest[pos + part.len()..];
        } else {
            return false;
        }
    }
    true
}
