//! JSON extraction from LLM output
//!
//! Agents are asked for bare JSON but routinely wrap it in markdown fences
//! or prose. Extraction order: first fenced code block, then the first
//! parseable top-level JSON value in the text.

use serde_json::Value;

/// Pull the first JSON value out of an agent response
pub fn extract_json(text: &str) -> Option<Value> {
    if let Some(block) = fenced_block(text)
        && let Ok(value) = serde_json::from_str(block.trim())
    {
        return Some(value);
    }
    first_json_value(text)
}

/// Contents of the first ``` fence (with or without a language tag)
fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_ticks = &text[open + 3..];
    // Skip the language tag line
    let body_start = after_ticks.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_ticks[body_start..];
    let close = body.find("```")?;
    Some(&body[..close])
}

/// Parse the first top-level `{...}` or `[...]`, tolerating trailing prose
fn first_json_value(text: &str) -> Option<Value> {
    for (index, c) in text.char_indices() {
        if c != '{' && c != '[' {
            continue;
        }
        let mut stream = serde_json::Deserializer::from_str(&text[index..]).into_iter::<Value>();
        if let Some(Ok(value)) = stream.next() {
            return Some(value);
        }
    }
    None
}
