//! LLM integration module.
//!
//! Provides an OpenAI-compatible client for LLM API calls, the
//! [`CompletionModel`] seam used by the judges and the generator, and
//! the prompts for every stage.

mod client;
mod prompts;

pub use client::{CompletionModel, ContentPart, LlmClient, LlmResponse, Message, MessageContent};
pub use prompts::Prompts;

/// Extract JSON from a potentially markdown-wrapped response.
///
/// Prefers the last fenced block, then the first complete JSON object in
/// the prose (braces in reasoning text before it are skipped). Returns the
/// trimmed input unchanged when nothing JSON-shaped is found.
pub fn extract_json(response: &str) -> String {
    let response = response.trim();

    if let Some(block) = last_fenced_block(response) {
        return block.to_string();
    }

    if let Some(object) = first_json_object(response) {
        return object.to_string();
    }

    // Nothing parses; hand back the widest brace span for lenient parsing.
    if let (Some(start), Some(end)) = (response.find('{'), response.rfind('}')) {
        if end > start {
            return response[start..=end].to_string();
        }
    }

    response.to_string()
}

fn last_fenced_block(response: &str) -> Option<&str> {
    let close = response.rfind("```")?;
    let open = response[..close].rfind("```")?;
    let body = &response[open + 3..close];

    // Drop a language tag such as `json` on the opening line.
    let body = match body.split_once('\n') {
        Some((tag, rest)) if !tag.contains(['{', '[']) => rest,
        _ => body,
    };

    let body = body.trim();
    (!body.is_empty()).then_some(body)
}

fn first_json_object(response: &str) -> Option<&str> {
    response.match_indices('{').find_map(|(start, _)| {
        let mut values =
            serde_json::Deserializer::from_str(&response[start..]).into_iter::<serde_json::Value>();
        match values.next() {
            Some(Ok(serde_json::Value::Object(_))) => {
                Some(&response[start..start + values.byte_offset()])
            }
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_plain() {
        let response = r#"{"score": 80}"#;
        assert_eq!(extract_json(response), r#"{"score": 80}"#);
    }

    #[test]
    fn test_extract_json_markdown() {
        let response = "```json\n{\"score\": 80}\n```";
        assert_eq!(extract_json(response), r#"{"score": 80}"#);
    }

    #[test]
    fn test_extract_json_bare_fence() {
        let response = "```\n{\"score\": 80}\n```";
        assert_eq!(extract_json(response), r#"{"score": 80}"#);
    }

    #[test]
    fn test_extract_json_with_text() {
        let response = "Here is my verdict:\n{\"score\": 80}\nThanks.";
        assert_eq!(extract_json(response), r#"{"score": 80}"#);
    }

    #[test]
    fn test_extract_json_skips_braces_in_reasoning() {
        let response = "The template {total} is cited twice.\n{\"score\": 4, \"rationale\": \"ok\"}";
        assert_eq!(
            extract_json(response),
            r#"{"score": 4, "rationale": "ok"}"#
        );
    }

    #[test]
    fn test_extract_json_prefers_last_fence() {
        let response = "Reasoning mentions {vendor}.\n```json\n{\"score\": 3}\n```";
        assert_eq!(extract_json(response), r#"{"score": 3}"#);
    }

    #[test]
    fn test_extract_json_ignores_trailing_braces() {
        let response = "{\"score\": 2} and a stray {note} afterwards";
        assert_eq!(extract_json(response), r#"{"score": 2}"#);
    }

    #[test]
    fn test_extract_json_no_json() {
        assert_eq!(extract_json("  no verdict  "), "no verdict");
    }
}
