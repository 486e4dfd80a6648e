//! Textual rate-limit detection over agent responses
//!
//! Structured 429 errors are the primary signal, but some providers bury the
//! condition in the final response text. A small closed phrase set is
//! scanned case-insensitively; matches embedded in identifier-like tokens
//! (`GitHubRateLimitedError`, `error_429_handler`) do not count.

/// Phrases that mark a final response as rate-limited
const RATE_LIMIT_PHRASES: &[&str] = &["rate limit exceeded", "too many requests", "hit your limit", "429"];

/// True when the final response text indicates the agent was rate limited
pub fn response_mentions_rate_limit(text: &str) -> bool {
    let lower = text.to_lowercase();
    RATE_LIMIT_PHRASES
        .iter()
        .any(|phrase| contains_standalone(&lower, phrase))
}

/// Substring search requiring non-identifier characters on both sides
fn contains_standalone(haystack: &str, needle: &str) -> bool {
    let mut from = 0;
    while let Some(pos) = haystack[from..].find(needle) {
        let start = from + pos;
        let end = start + needle.len();

        let before_ok = start == 0 || !is_ident_char(haystack[..start].chars().next_back().unwrap_or(' '));
        let after_ok = end == haystack.len() || !is_ident_char(haystack[end..].chars().next().unwrap_or(' '));

        if before_ok && after_ok {
            return true;
        }
        from = end;
    }
    false
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}
