//! Shell-style key patterns.
//!
//! The persistent store evaluates patterns with SQLite `GLOB`, and the memory
//! tier evicts exactly the keys the store removed. [`KeyPattern::matches`]
//! applies the same rules in process: `*`, `?`, `[abc]`, `[a-z]` and
//! `[^abc]`, case-sensitively, with wildcards matching any character.

use crate::error::{CacheError, Result};
use regex::Regex;

/// A validated glob over cache keys.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    glob: String,
    regex: Regex,
}

impl KeyPattern {
    pub fn new(glob: &str) -> Result<Self> {
        if glob.is_empty() {
            return Err(CacheError::Validation {
                field: "pattern".to_string(),
                message: "pattern must not be empty".to_string(),
            });
        }

        let source = glob_to_regex(glob)?;
        let regex = Regex::new(&source).map_err(|e| CacheError::Validation {
            field: "pattern".to_string(),
            message: format!("'{}' is not a valid pattern: {}", glob, e),
        })?;

        Ok(Self {
            glob: glob.to_string(),
            regex,
        })
    }

    /// The pattern as written, suitable for SQLite `GLOB`.
    pub fn as_glob(&self) -> &str {
        &self.glob
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }
}

fn glob_to_regex(glob: &str) -> Result<String> {
    let chars: Vec<char> = glob.chars().collect();
    let mut out = String::with_capacity(glob.len() * 2 + 2);
    // GLOB wildcards match newlines too.
    out.push_str("(?s)^");

    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                let (class, next) = parse_class(&chars, i, glob)?;
                out.push_str(&class);
                i = next;
                continue;
            }
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }

    out.push('$');
    Ok(out)
}

/// Parse a `[...]` class starting at `start`; returns the regex class and the
/// index just past the closing bracket.
fn parse_class(chars: &[char], start: usize, glob: &str) -> Result<(String, usize)> {
    let mut i = start + 1;
    let mut class = String::from("[");

    if chars.get(i) == Some(&'^') {
        class.push('^');
        i += 1;
    }
    // A leading ']' is a literal member.
    if chars.get(i) == Some(&']') {
        class.push_str("\\]");
        i += 1;
    }

    while i < chars.len() {
        match chars[i] {
            ']' => {
                class.push(']');
                return Ok((class, i + 1));
            }
            '-' => class.push('-'),
            c @ ('\\' | '[' | '^' | '&' | '~') => {
                class.push('\\');
                class.push(c);
            }
            c => class.push(c),
        }
        i += 1;
    }

    Err(CacheError::Validation {
        field: "pattern".to_string(),
        message: format!("unterminated character class in '{}'", glob),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_star_prefix() {
        let pattern = KeyPattern::new("wishlist_*").unwrap();
        assert!(pattern.matches("wishlist_"));
        assert!(pattern.matches("wishlist_page_2"));
        assert!(!pattern.matches("library_wishlist_1"));
    }

    #[test]
    fn test_question_mark() {
        let pattern = KeyPattern::new("item_B0?").unwrap();
        assert!(pattern.matches("item_B08"));
        assert!(!pattern.matches("item_B0"));
        assert!(!pattern.matches("item_B089"));
    }

    #[test]
    fn test_classes() {
        let digits = KeyPattern::new("page_[0-9]").unwrap();
        assert!(digits.matches("page_4"));
        assert!(!digits.matches("page_x"));

        let negated = KeyPattern::new("page_[^0-9]").unwrap();
        assert!(negated.matches("page_x"));
        assert!(!negated.matches("page_4"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let pattern = KeyPattern::new("search:(fantasy)+*").unwrap();
        assert!(pattern.matches("search:(fantasy)+page1"));
        assert!(!pattern.matches("search:fantasyy"));
    }

    #[test]
    fn test_wildcards_match_newlines() {
        assert!(KeyPattern::new("foo_*").unwrap().matches("foo_a\nb"));
        assert!(KeyPattern::new("a?b").unwrap().matches("a\nb"));
    }

    #[test]
    fn test_case_sensitive() {
        let pattern = KeyPattern::new("B08*").unwrap();
        assert!(!pattern.matches("b08xyz"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(KeyPattern::new("").is_err());
        assert!(KeyPattern::new("page_[0-9").is_err());
    }
}
