//! Text normalization and FTS5 query building.

/// Lower-case `text`, drop punctuation, and collapse whitespace.
///
/// Characters that are neither alphanumeric nor whitespace are removed
/// outright, so "J.K. Rowling" becomes "jk rowling".
pub fn normalize_text(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalized, de-duplicated tokens in first-seen order.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    for token in normalize_text(text).split(' ').filter(|t| !t.is_empty()) {
        if !tokens.iter().any(|t| t == token) {
            tokens.push(token.to_string());
        }
    }
    tokens
}

/// Quote a term so FTS5 treats it as a literal string.
pub fn escape_fts5_term(term: &str) -> String {
    format!("\"{}\"", term.replace('"', "\"\""))
}

/// Build an FTS5 `MATCH` expression requiring every token.
///
/// - "Harry Potter" → `"harry" AND "potter"`
/// - "J.K." → `"jk"`
///
/// Returns `None` when the query has no searchable tokens.
pub fn build_match_query(query: &str) -> Option<String> {
    let tokens = tokenize(query);
    if tokens.is_empty() {
        return None;
    }
    Some(
        tokens
            .iter()
            .map(|t| escape_fts5_term(t))
            .collect::<Vec<_>>()
            .join(" AND "),
    )
}

/// How many occurrences of the query tokens appear in the indexed fields.
pub fn match_count(query_tokens: &[String], fields: &[&str]) -> usize {
    fields
        .iter()
        .flat_map(|field| field.split(' '))
        .filter(|word| query_tokens.iter().any(|t| t == word))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_punctuation() {
        assert_eq!(normalize_text("J.K. Rowling"), "jk rowling");
        assert_eq!(
            normalize_text("  Harry Potter and the Chamber of Secrets! "),
            "harry potter and the chamber of secrets"
        );
        assert_eq!(normalize_text("Sci-Fi"), "scifi");
    }

    #[test]
    fn test_normalize_keeps_non_ascii_letters() {
        assert_eq!(normalize_text("Mémoires d'Outre-Tombe"), "mémoires doutretombe");
    }

    #[test]
    fn test_tokenize_dedupes() {
        assert_eq!(tokenize("Potter, potter POTTER"), vec!["potter"]);
        assert!(tokenize("...").is_empty());
    }

    #[test]
    fn test_escape_quotes() {
        assert_eq!(escape_fts5_term("test\"quote"), "\"test\"\"quote\"");
    }

    #[test]
    fn test_build_match_query() {
        assert_eq!(
            build_match_query("Harry Potter").as_deref(),
            Some("\"harry\" AND \"potter\"")
        );
        assert_eq!(build_match_query("J.K.").as_deref(), Some("\"jk\""));
        assert_eq!(build_match_query("   "), None);
        assert_eq!(build_match_query("?!"), None);
    }

    #[test]
    fn test_match_count() {
        let tokens = tokenize("harry potter");
        assert_eq!(
            match_count(&tokens, &["harry potter and the harry", "jk rowling"]),
            3
        );
        assert_eq!(match_count(&tokens, &["fantastic beasts"]), 0);
    }
}
