//! C5 — command parser. Strips/dispatches `/image` and `/ignore` directives in user input.

/// Result of parsing a raw user message for slash-command directives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub processed_text: String,
    pub image_prompt: Option<String>,
    pub skip_ai: bool,
}

/// `Parse(input) → {processed-text, image-prompt, skip-ai}`.
///
/// Priority, evaluated top-down: `/image` (or any configured trigger) wins over `/ignore`; an
/// empty trigger list disables image detection entirely.
pub fn parse(input: &str, image_triggers: &[String]) -> ParsedCommand {
    let normalized = input.replace("\r\n", "\n");

    if !image_triggers.is_empty() {
        if let Some((trigger_start, trigger_len)) = find_first_trigger(&normalized, image_triggers) {
            let tail = normalized[trigger_start + trigger_len..].trim();
            if !tail.is_empty() {
                return ParsedCommand {
                    processed_text: String::new(),
                    image_prompt: Some(tail.to_string()),
                    skip_ai: true,
                };
            }
        }
    }

    let mut lines: Vec<String> = Vec::new();
    for line in normalized.split('\n') {
        let stripped = strip_ignore(line);
        if !stripped.trim().is_empty() {
            lines.push(stripped);
        }
    }
    let processed = lines.join("\n");

    if processed.trim().is_empty() {
        ParsedCommand {
            processed_text: String::new(),
            image_prompt: None,
            skip_ai: true,
        }
    } else {
        ParsedCommand {
            processed_text: processed,
            image_prompt: None,
            skip_ai: false,
        }
    }
}

/// Find the earliest case-insensitive occurrence of any trigger phrase, returning its byte
/// offset and byte length in `text`.
fn find_first_trigger(text: &str, triggers: &[String]) -> Option<(usize, usize)> {
    let lower = text.to_lowercase();
    let mut best: Option<(usize, usize)> = None;
    for trigger in triggers {
        if trigger.is_empty() {
            continue;
        }
        let trigger_lower = trigger.to_lowercase();
        if let Some(pos) = lower.find(&trigger_lower) {
            let candidate = (pos, trigger_lower.len());
            best = match best {
                Some(existing) if existing.0 <= candidate.0 => Some(existing),
                _ => Some(candidate),
            };
        }
    }
    best
}

/// Drop the first case-insensitive occurrence of `/ignore` and everything after it on this
/// line, trimming trailing whitespace before the command.
fn strip_ignore(line: &str) -> String {
    let lower = line.to_lowercase();
    match lower.find("/ignore") {
        Some(pos) => line[..pos].trim_end().to_string(),
        None => line.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triggers() -> Vec<String> {
        vec!["/image".to_string(), "@image".to_string()]
    }

    #[test]
    fn command_only_image() {
        let parsed = parse("/image a red cube", &triggers());
        assert!(parsed.skip_ai);
        assert_eq!(parsed.image_prompt.as_deref(), Some("a red cube"));
        assert_eq!(parsed.processed_text, "");
    }

    #[test]
    fn mixed_ignore_drops_tail_of_line() {
        let parsed = parse("Hello\n/ignore secret\nWorld", &triggers());
        assert_eq!(parsed.processed_text, "Hello\nWorld");
        assert!(!parsed.skip_ai);
        assert!(parsed.image_prompt.is_none());
    }

    #[test]
    fn image_wins_over_ignore() {
        let parsed = parse("/ignore nope /image a dog", &triggers());
        assert_eq!(parsed.image_prompt.as_deref(), Some("a dog"));
    }

    #[test]
    fn empty_trigger_list_disables_image_detection() {
        let parsed = parse("/image a red cube", &[]);
        assert!(parsed.image_prompt.is_none());
        assert!(!parsed.skip_ai);
    }

    #[test]
    fn whitespace_only_after_stripping_skips_ai() {
        let parsed = parse("/ignore everything", &triggers());
        assert!(parsed.skip_ai);
        assert!(parsed.image_prompt.is_none());
    }

    #[test]
    fn crlf_and_lf_normalize_identically() {
        let crlf = parse("Hello\r\n/ignore x\r\nWorld", &triggers());
        let lf = parse("Hello\n/ignore x\nWorld", &triggers());
        assert_eq!(crlf, lf);
    }

    #[test]
    fn empty_tail_after_trigger_is_not_image_prompt() {
        let parsed = parse("/image", &triggers());
        assert!(parsed.image_prompt.is_none());
        assert!(parsed.skip_ai);
    }
}
