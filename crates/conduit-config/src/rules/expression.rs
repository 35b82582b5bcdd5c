//! `rules:if` expressions.
//!
//! Grammar, lowest precedence first:
//!
//! ```text
//! or      := and ( "||" and )*
//! and     := primary ( "&&" primary )*
//! primary := "(" or ")" | operand ( op operand )?
//! op      := "==" | "!=" | "=~" | "!~"
//! operand := $VAR | ${VAR} | "string" | 'string' | null | /regex/flags
//! ```

use regex::{Regex, RegexBuilder};
use std::collections::BTreeMap;

use crate::error::RuleError;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Variable(String),
    Str(String),
    Null,
    Pattern { source: String, flags: String },
    Equals,
    NotEquals,
    Matches,
    NotMatches,
    And,
    Or,
    LParen,
    RParen,
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Variable(String),
    Str(String),
    Null,
    Pattern { source: String, flags: String },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Comparison {
    Equals,
    NotEquals,
    Matches,
    NotMatches,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Operand(Operand),
    Compare(Operand, Comparison, Operand),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

/// A parsed `if` expression.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    root: Expr,
}

/// Evaluated operand value.
enum Resolved {
    Str(String),
    Null,
    Pattern { source: String, flags: String },
}

impl Resolved {
    fn truthy(&self) -> bool {
        match self {
            Resolved::Str(s) => !s.is_empty(),
            Resolved::Null => false,
            Resolved::Pattern { .. } => true,
        }
    }

    /// Text used for equality; null and undefined compare as empty.
    fn text(&self) -> String {
        match self {
            Resolved::Str(s) => s.clone(),
            Resolved::Null => String::new(),
            Resolved::Pattern { source, flags } => format!("/{}/{}", source, flags),
        }
    }
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, RuleError> {
        let tokens = tokenize(source).map_err(|message| RuleError::Expression {
            expression: source.to_string(),
            message,
        })?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser
            .parse()
            .map_err(|message| RuleError::Expression {
                expression: source.to_string(),
                message,
            })?;
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against a variable environment. Undefined variables are empty.
    pub fn evaluate(&self, variables: &BTreeMap<String, String>) -> Result<bool, RuleError> {
        self.eval(&self.root, variables)
    }

    fn eval(&self, expr: &Expr, variables: &BTreeMap<String, String>) -> Result<bool, RuleError> {
        match expr {
            Expr::Operand(operand) => Ok(resolve(operand, variables).truthy()),
            Expr::And(lhs, rhs) => Ok(self.eval(lhs, variables)? && self.eval(rhs, variables)?),
            Expr::Or(lhs, rhs) => Ok(self.eval(lhs, variables)? || self.eval(rhs, variables)?),
            Expr::Compare(lhs, op, rhs) => {
                let lhs = resolve(lhs, variables);
                let rhs = resolve(rhs, variables);
                match op {
                    Comparison::Equals => Ok(lhs.text() == rhs.text()),
                    Comparison::NotEquals => Ok(lhs.text() != rhs.text()),
                    Comparison::Matches => self.matches(&lhs, &rhs),
                    Comparison::NotMatches => self.matches(&lhs, &rhs).map(|m| !m),
                }
            }
        }
    }

    fn matches(&self, lhs: &Resolved, rhs: &Resolved) -> Result<bool, RuleError> {
        let regex = match rhs {
            Resolved::Pattern { source, flags } => self.compile(source, flags)?,
            // A variable may hold a `/pattern/` literal.
            Resolved::Str(s) => match split_pattern(s) {
                Some((source, flags)) => self.compile(source, flags)?,
                None => {
                    return Err(self.error(format!(
                        "right-hand side of a match must be a pattern, got {:?}",
                        s
                    )));
                }
            },
            Resolved::Null => return Ok(false),
        };
        Ok(regex.is_match(&lhs.text()))
    }

    fn compile(&self, source: &str, flags: &str) -> Result<Regex, RuleError> {
        let mut builder = RegexBuilder::new(source);
        for flag in flags.chars() {
            match flag {
                'i' => builder.case_insensitive(true),
                'm' => builder.multi_line(true),
                's' => builder.dot_matches_new_line(true),
                'x' => builder.ignore_whitespace(true),
                other => return Err(self.error(format!("unknown pattern flag `{}`", other))),
            };
        }
        builder.build().map_err(|e| RuleError::Pattern {
            pattern: format!("/{}/{}", source, flags),
            message: e.to_string(),
        })
    }

    fn error(&self, message: String) -> RuleError {
        RuleError::Expression {
            expression: self.source.clone(),
            message,
        }
    }
}

fn resolve(operand: &Operand, variables: &BTreeMap<String, String>) -> Resolved {
    match operand {
        Operand::Variable(name) => match variables.get(name) {
            Some(value) => Resolved::Str(value.clone()),
            None => Resolved::Str(String::new()),
        },
        Operand::Str(s) => Resolved::Str(s.clone()),
        Operand::Null => Resolved::Null,
        Operand::Pattern { source, flags } => Resolved::Pattern {
            source: source.clone(),
            flags: flags.clone(),
        },
    }
}

/// Split `/source/flags` into its parts.
fn split_pattern(text: &str) -> Option<(&str, &str)> {
    let rest = text.strip_prefix('/')?;
    let end = rest.rfind('/')?;
    let (source, flags) = (&rest[..end], &rest[end + 1..]);
    flags
        .chars()
        .all(|c| c.is_ascii_alphabetic())
        .then_some((source, flags))
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            _ if c.is_whitespace() => i += 1,
            '$' => {
                i += 1;
                let braced = chars.get(i) == Some(&'{');
                if braced {
                    i += 1;
                }
                let start = i;
                while i < chars.len() && is_name_char(chars[i]) {
                    i += 1;
                }
                if start == i {
                    return Err(format!("expected a variable name at position {}", start));
                }
                let name: String = chars[start..i].iter().collect();
                if braced {
                    if chars.get(i) != Some(&'}') {
                        return Err(format!("unclosed `${{{}`", name));
                    }
                    i += 1;
                }
                tokens.push(Token::Variable(name));
            }
            '"' | '\'' => {
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == c)
                    .map(|offset| start + offset)
                    .ok_or_else(|| format!("unterminated string at position {}", i))?;
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            '/' => {
                let mut j = i + 1;
                let mut pattern = String::new();
                loop {
                    match chars.get(j) {
                        None => return Err(format!("unterminated pattern at position {}", i)),
                        Some('\\') if chars.get(j + 1) == Some(&'/') => {
                            pattern.push('/');
                            j += 2;
                        }
                        Some('/') => break,
                        Some(&ch) => {
                            pattern.push(ch);
                            j += 1;
                        }
                    }
                }
                j += 1;
                let flags_start = j;
                while j < chars.len() && chars[j].is_ascii_alphabetic() {
                    j += 1;
                }
                tokens.push(Token::Pattern {
                    source: pattern,
                    flags: chars[flags_start..j].iter().collect(),
                });
                i = j;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' | '!' | '&' | '|' => {
                let pair: String = chars[i..(i + 2).min(chars.len())].iter().collect();
                let token = match pair.as_str() {
                    "==" => Token::Equals,
                    "!=" => Token::NotEquals,
                    "=~" => Token::Matches,
                    "!~" => Token::NotMatches,
                    "&&" => Token::And,
                    "||" => Token::Or,
                    _ => return Err(format!("unknown operator `{}` at position {}", pair, i)),
                };
                tokens.push(token);
                i += 2;
            }
            _ if c.is_ascii_alphabetic() => {
                let start = i;
                while i < chars.len() && is_name_char(chars[i]) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                if word == "null" {
                    tokens.push(Token::Null);
                } else {
                    return Err(format!("unexpected word `{}` at position {}", word, start));
                }
            }
            _ => return Err(format!("unexpected character `{}` at position {}", c, i)),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn parse(&mut self) -> Result<Expr, String> {
        if self.tokens.is_empty() {
            return Err("expression is empty".to_string());
        }
        let expr = self.or()?;
        match self.tokens.get(self.pos) {
            None => Ok(expr),
            Some(token) => Err(format!("unexpected {:?}", token)),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn or(&mut self) -> Result<Expr, String> {
        let mut lhs = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, String> {
        let mut lhs = self.primary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.primary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn primary(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.or()?;
            return match self.next() {
                Some(Token::RParen) => Ok(inner),
                _ => Err("missing closing parenthesis".to_string()),
            };
        }

        let lhs = self.operand()?;
        let op = match self.peek() {
            Some(Token::Equals) => Comparison::Equals,
            Some(Token::NotEquals) => Comparison::NotEquals,
            Some(Token::Matches) => Comparison::Matches,
            Some(Token::NotMatches) => Comparison::NotMatches,
            _ => return Ok(Expr::Operand(lhs)),
        };
        self.pos += 1;
        let rhs = self.operand()?;
        Ok(Expr::Compare(lhs, op, rhs))
    }

    fn operand(&mut self) -> Result<Operand, String> {
        match self.next() {
            Some(Token::Variable(name)) => Ok(Operand::Variable(name)),
            Some(Token::Str(s)) => Ok(Operand::Str(s)),
            Some(Token::Null) => Ok(Operand::Null),
            Some(Token::Pattern { source, flags }) => Ok(Operand::Pattern { source, flags }),
            Some(other) => Err(format!("expected a value, found {:?}", other)),
            None => Err("expected a value at end of expression".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn eval(source: &str, pairs: &[(&str, &str)]) -> bool {
        Expression::parse(source).unwrap().evaluate(&vars(pairs)).unwrap()
    }

    #[test]
    fn test_equality() {
        assert!(eval("$CI_COMMIT_BRANCH == \"main\"", &[("CI_COMMIT_BRANCH", "main")]));
        assert!(!eval("$CI_COMMIT_BRANCH == 'main'", &[("CI_COMMIT_BRANCH", "dev")]));
        assert!(eval("${A} != $B", &[("A", "1"), ("B", "2")]));
    }

    #[test]
    fn test_undefined_variables_are_empty() {
        assert!(!eval("$MISSING", &[]));
        assert!(eval("$MISSING == null", &[]));
        assert!(eval("$MISSING == \"\"", &[]));
        assert!(!eval("$MISSING == \"x\"", &[]));
        assert!(eval("$SET != null", &[("SET", "1")]));
    }

    #[test]
    fn test_patterns() {
        assert!(eval("$CI_COMMIT_TAG =~ /^v\\d+/", &[("CI_COMMIT_TAG", "v12")]));
        assert!(eval("$BRANCH =~ /^FEATURE/i", &[("BRANCH", "feature-x")]));
        assert!(eval("$BRANCH !~ /^release/", &[("BRANCH", "main")]));
        assert!(eval(
            "$BRANCH =~ $RELEASE_PATTERN",
            &[("BRANCH", "release-1"), ("RELEASE_PATTERN", "/^release-\\d$/")]
        ));
        assert!(eval("$PATH_VAR =~ /a\\/b/", &[("PATH_VAR", "x/a/b")]));
    }

    #[test]
    fn test_precedence_and_parentheses() {
        // && binds tighter than ||
        assert!(eval("$A || $B && $C", &[("A", "1")]));
        assert!(!eval("($A || $B) && $C", &[("A", "1")]));
        assert!(eval("($A == 'x' || $B == 'y') && $C", &[("B", "y"), ("C", "1")]));
    }

    #[test]
    fn test_malformed_expressions() {
        for source in ["", "$A ==", "$A = 'x'", "($A", "'open", "$A == 'x' extra", "$"] {
            let err = Expression::parse(source).unwrap_err();
            assert!(matches!(err, RuleError::Expression { .. }), "{}", source);
        }
    }

    #[test]
    fn test_match_requires_pattern() {
        let expr = Expression::parse("$A =~ \"plain\"").unwrap();
        let err = expr.evaluate(&vars(&[("A", "x")])).unwrap_err();
        assert!(matches!(err, RuleError::Expression { .. }));
    }

    #[test]
    fn test_invalid_regex() {
        let expr = Expression::parse("$A =~ /(unclosed/").unwrap();
        let err = expr.evaluate(&vars(&[])).unwrap_err();
        assert!(matches!(err, RuleError::Pattern { .. }));
    }
}
