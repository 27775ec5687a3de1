// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Key patterns for invalidation.
//!
//! One glob dialect, translated for every tier:
//!
//! | Syntax | Meaning               | Redis `MATCH` | SQL `LIKE` |
//! |--------|-----------------------|---------------|------------|
//! | `*`    | any run (incl. empty) | `*`           | `%`        |
//! | `?`    | exactly one character | `?`           | `_`        |
//! | `\x`   | literal `x`           | escaped       | escaped    |
//!
//! Everything else is literal, including `[`, `]`, `%` and `_`.
//!
//! # Example
//!
//! ```
//! use doc_cache::KeyPattern;
//!
//! let pattern = KeyPattern::parse("q:doc42:*").unwrap();
//! assert!(pattern.matches("q:doc42:chunk-1"));
//! assert!(!pattern.matches("q:doc43:chunk-1"));
//! assert_eq!(pattern.to_sql_like(), "q:doc42:%");
//! ```

use std::str::FromStr;
use thiserror::Error;

/// Escape character used in generated `LIKE` patterns (`ESCAPE '!'`).
///
/// Not a backslash: MySQL treats `\` inside string literals as an escape.
pub const SQL_LIKE_ESCAPE: char = '!';

#[derive(Error, Debug)]
#[error("invalid key pattern '{pattern}': {reason}")]
pub struct PatternError {
    pub pattern: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    AnyRun,
    AnyOne,
}

/// A parsed invalidation pattern.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    source: String,
    tokens: Vec<Token>,
    matcher: glob::Pattern,
}

impl KeyPattern {
    /// Parse a pattern in the dialect described in the module docs.
    pub fn parse(source: &str) -> Result<Self, PatternError> {
        let tokens = Self::tokenize(source);
        let glob_source: String = tokens
            .iter()
            .map(|t| match t {
                Token::Literal(lit) => glob::Pattern::escape(lit),
                Token::AnyRun => "*".to_string(),
                Token::AnyOne => "?".to_string(),
            })
            .collect();

        let matcher = glob::Pattern::new(&glob_source).map_err(|e| PatternError {
            pattern: source.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            source: source.to_string(),
            tokens,
            matcher,
        })
    }

    /// A pattern matching exactly one key.
    pub fn exact(key: &str) -> Result<Self, PatternError> {
        Self::parse(&Self::escape(key))
    }

    /// Escape a literal key so it can be embedded in a pattern.
    #[must_use]
    pub fn escape(literal: &str) -> String {
        let mut escaped = String::with_capacity(literal.len());
        for c in literal.chars() {
            if matches!(c, '*' | '?' | '\\') {
                escaped.push('\\');
            }
            escaped.push(c);
        }
        escaped
    }

    fn tokenize(source: &str) -> Vec<Token> {
        let mut tokens = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars();

        while let Some(c) = chars.next() {
            match c {
                '\\' => literal.push(chars.next().unwrap_or('\\')),
                '*' | '?' => {
                    if !literal.is_empty() {
                        tokens.push(Token::Literal(std::mem::take(&mut literal)));
                    }
                    let token = if c == '*' { Token::AnyRun } else { Token::AnyOne };
                    // Collapse "**" into one run
                    if !(token == Token::AnyRun && tokens.last() == Some(&Token::AnyRun)) {
                        tokens.push(token);
                    }
                }
                _ => literal.push(c),
            }
        }
        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }
        tokens
    }

    /// The pattern as written by the caller.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        self.matcher.matches(key)
    }

    /// The single key this pattern addresses, if it has no wildcards.
    #[must_use]
    pub fn literal(&self) -> Option<&str> {
        match self.tokens.as_slice() {
            [Token::Literal(lit)] => Some(lit.as_str()),
            _ => None,
        }
    }

    /// Translate to a Redis `SCAN ... MATCH` glob, with an optional key prefix.
    #[must_use]
    pub fn to_redis_match(&self, prefix: &str) -> String {
        let mut out = String::new();
        Self::push_redis_literal(&mut out, prefix);
        for token in &self.tokens {
            match token {
                Token::Literal(lit) => Self::push_redis_literal(&mut out, lit),
                Token::AnyRun => out.push('*'),
                Token::AnyOne => out.push('?'),
            }
        }
        out
    }

    fn push_redis_literal(out: &mut String, lit: &str) {
        for c in lit.chars() {
            if matches!(c, '*' | '?' | '[' | ']' | '\\' | '^') {
                out.push('\\');
            }
            out.push(c);
        }
    }

    /// Translate to a SQL `LIKE` pattern using [`SQL_LIKE_ESCAPE`].
    #[must_use]
    pub fn to_sql_like(&self) -> String {
        let mut out = String::new();
        for token in &self.tokens {
            match token {
                Token::Literal(lit) => {
                    for c in lit.chars() {
                        if c == '%' || c == '_' || c == SQL_LIKE_ESCAPE {
                            out.push(SQL_LIKE_ESCAPE);
                        }
                        out.push(c);
                    }
                }
                Token::AnyRun => out.push('%'),
                Token::AnyOne => out.push('_'),
            }
        }
        out
    }
}

impl FromStr for KeyPattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> KeyPattern {
        KeyPattern::parse(s).unwrap()
    }

    #[test]
    fn test_prefix_match() {
        let pat = p("q:*");
        assert!(pat.matches("q:abc"));
        assert!(pat.matches("q:"));
        assert!(!pat.matches("emb:abc"));
    }

    #[test]
    fn test_single_char_wildcard() {
        let pat = p("q:a?c");
        assert!(pat.matches("q:abc"));
        assert!(!pat.matches("q:abbc"));
        assert!(!pat.matches("q:ac"));
    }

    #[test]
    fn test_brackets_are_literal() {
        let pat = p("q:[x]");
        assert!(pat.matches("q:[x]"));
        assert!(!pat.matches("q:x"));
    }

    #[test]
    fn test_escaped_wildcards_are_literal() {
        let pat = p(r"q:\*");
        assert!(pat.matches("q:*"));
        assert!(!pat.matches("q:abc"));
        assert_eq!(pat.literal(), Some("q:*"));
    }

    #[test]
    fn test_wildcard_crosses_separators() {
        assert!(p("docs/*").matches("docs/a/b/c"));
    }

    #[test]
    fn test_exact_helper() {
        let pat = KeyPattern::exact("q:a*b?").unwrap();
        assert!(pat.matches("q:a*b?"));
        assert!(!pat.matches("q:aXXbY"));
        assert_eq!(pat.literal(), Some("q:a*b?"));
    }

    #[test]
    fn test_literal_none_with_wildcards() {
        assert_eq!(p("q:*").literal(), None);
        assert_eq!(p("q:abc").literal(), Some("q:abc"));
    }

    #[test]
    fn test_to_sql_like_escapes() {
        assert_eq!(p("q:*").to_sql_like(), "q:%");
        assert_eq!(p("a_b%c?").to_sql_like(), "a!_b!%c_");
        assert_eq!(p("wow!*").to_sql_like(), "wow!!%");
    }

    #[test]
    fn test_to_redis_match() {
        assert_eq!(p("q:*").to_redis_match(""), "q:*");
        assert_eq!(p("q:[1]?").to_redis_match("app:"), r"app:q:\[1\]?");
        assert_eq!(p(r"q:\*").to_redis_match(""), r"q:\*");
    }

    #[test]
    fn test_double_star_collapses() {
        assert_eq!(p("a**b").to_sql_like(), "a%b");
    }

    #[test]
    fn test_trailing_backslash_is_literal() {
        let pat = p("a\\");
        assert!(pat.matches("a\\"));
    }
}
