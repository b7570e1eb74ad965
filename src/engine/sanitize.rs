/// Characters the FTS query parser treats as operator syntax.
const SPECIAL: &[char] = &['"', '-', ':', '(', ')', '*'];

/// Rewrite a raw query so the full-text index cannot misread punctuation
/// as operator syntax.
///
/// Queries without special characters pass through untouched. Otherwise
/// each whitespace token containing a special character is wrapped in
/// double quotes (turning it into a phrase), with embedded quotes doubled.
/// `node-llama-cpp` becomes `"node-llama-cpp"` rather than a NOT query.
pub fn sanitize_query(raw: &str) -> String {
    let trimmed = raw.trim();
    if !trimmed.contains(|c| SPECIAL.contains(&c)) {
        return trimmed.to_string();
    }

    trimmed
        .split_whitespace()
        .map(|token| {
            if token.contains(|c| SPECIAL.contains(&c)) {
                format!("\"{}\"", token.replace('"', "\"\""))
            } else {
                token.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_queries_pass_through() {
        assert_eq!(sanitize_query("hello world"), "hello world");
        assert_eq!(sanitize_query("  spaced  "), "spaced");
    }

    #[test]
    fn hyphenated_token_is_quoted() {
        assert_eq!(sanitize_query("node-llama-cpp"), "\"node-llama-cpp\"");
        assert_eq!(
            sanitize_query("install node-llama-cpp now"),
            "install \"node-llama-cpp\" now"
        );
    }

    #[test]
    fn every_special_character_triggers_quoting() {
        assert_eq!(sanitize_query("a:b"), "\"a:b\"");
        assert_eq!(sanitize_query("f(x)"), "\"f(x)\"");
        assert_eq!(sanitize_query("wild*"), "\"wild*\"");
    }

    #[test]
    fn embedded_quotes_are_doubled() {
        assert_eq!(sanitize_query("say\"hi\""), "\"say\"\"hi\"\"\"");
    }

    #[test]
    fn empty_input_stays_empty() {
        assert_eq!(sanitize_query(""), "");
        assert_eq!(sanitize_query("   "), "");
    }
}
