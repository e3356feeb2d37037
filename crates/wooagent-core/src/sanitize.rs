use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::OnceLock;

pub const MAX_MESSAGE_CHARS: usize = 1000;
pub const MAX_DETAILS_CHARS: usize = 2000;
const TRUNCATED_SUFFIX: &str = "... (truncated)";

struct Patterns {
    traceback: Regex,
    frame_line: Regex,
    stack_frames: Regex,
    ansi: Regex,
    escaped_unicode: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        traceback: Regex::new(r"(?s)Traceback \(most recent call last\):?.*?(\w*Error:)")
            .expect("traceback pattern"),
        frame_line: Regex::new(r#"File "[^"]*", line \d+, in [^\n]*\n"#).expect("frame pattern"),
        stack_frames: Regex::new(r"(?:\n[ \t]+at [^\n]*){11,}").expect("stack pattern"),
        ansi: Regex::new(r"\x1b(?:\[[0-?]*[ -/]*[@-~]|\][^\x07\x1b]*(?:\x07|\x1b\\)|[@-Z\\-_])")
            .expect("ansi pattern"),
        escaped_unicode: Regex::new(r"\\u([0-9a-fA-F]{4})").expect("unicode pattern"),
    })
}

/// Normalizes a message for storage: strips noisy stack frames and terminal
/// escapes, decodes literal escapes, and caps the length.
pub fn clean_message(message: &str) -> String {
    if message.is_empty() {
        return String::new();
    }
    let patterns = patterns();
    let cleaned = patterns.traceback.replace_all(message, "$1");
    let cleaned = patterns.frame_line.replace_all(&cleaned, "");
    let cleaned = patterns
        .stack_frames
        .replace_all(&cleaned, "\n  ... (stack frames omitted)");
    let cleaned = truncate_chars(&cleaned, MAX_MESSAGE_CHARS);
    strip_control(&decode_escapes(&cleaned))
}

/// Caps structured details; oversized payloads collapse into a truncated string.
pub fn clean_details(details: Value) -> Option<Value> {
    match details {
        Value::Null => None,
        Value::String(text) => {
            let fixed = strip_control(&decode_escapes(&text));
            Some(Value::String(truncate_chars(&fixed, MAX_DETAILS_CHARS)))
        }
        other => {
            let serialized = other.to_string();
            if serialized.chars().count() > MAX_DETAILS_CHARS {
                Some(Value::String(truncate_chars(&serialized, MAX_DETAILS_CHARS)))
            } else {
                Some(other)
            }
        }
    }
}

pub fn strip_control(input: &str) -> String {
    let without_ansi = patterns().ansi.replace_all(input, "");
    without_ansi
        .chars()
        .filter(|ch| *ch == '\n' || *ch == '\t' || (!ch.is_control() && *ch != '\u{FFFD}'))
        .collect()
}

fn decode_escapes(input: &str) -> String {
    let decoded = patterns()
        .escaped_unicode
        .replace_all(input, |caps: &Captures<'_>| {
            u32::from_str_radix(&caps[1], 16)
                .ok()
                .and_then(char::from_u32)
                .map(|ch| ch.to_string())
                .unwrap_or_default()
        });
    decoded.replace("\\n", "\n").replace("\\t", "\t")
}

pub fn truncate_chars(input: &str, max: usize) -> String {
    match input.char_indices().nth(max) {
        Some((cut, _)) => format!("{}{TRUNCATED_SUFFIX}", &input[..cut]),
        None => input.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_ansi_and_control_sequences() {
        let raw = "\x1b[32mINFO\x1b[0m ready\x07 \u{FFFD}now\r";
        assert_eq!(clean_message(raw), "INFO ready now");
    }

    #[test]
    fn keeps_newlines_and_decodes_literal_escapes() {
        assert_eq!(clean_message("a\\nb\\tc"), "a\nb\tc");
        assert_eq!(clean_message("\\u05e9\\u05dc\\u05d5\\u05dd"), "שלום");
    }

    #[test]
    fn collapses_python_traceback() {
        let raw = "Traceback (most recent call last):\n  File \"app.py\", line 10, in main\n    run()\nValueError: bad input";
        assert_eq!(clean_message(raw), "ValueError: bad input");
    }

    #[test]
    fn collapses_long_stack_frame_runs() {
        let mut raw = String::from("Stack trace:");
        for idx in 0..15 {
            raw.push_str(&format!("\n    at frame{idx} (file.js:1:1)"));
        }
        let cleaned = clean_message(&raw);
        assert!(cleaned.starts_with("Stack trace:"));
        assert!(cleaned.contains("... (stack frames omitted)"));
        assert!(!cleaned.contains("frame14"));
    }

    #[test]
    fn caps_message_length_on_char_boundaries() {
        let raw = "ש".repeat(MAX_MESSAGE_CHARS + 5);
        let cleaned = clean_message(&raw);
        assert!(cleaned.ends_with(TRUNCATED_SUFFIX));
        assert_eq!(
            cleaned.chars().count(),
            MAX_MESSAGE_CHARS + TRUNCATED_SUFFIX.chars().count()
        );
    }

    #[test]
    fn oversized_details_become_truncated_string() {
        let small = json!({"ok": true});
        assert_eq!(clean_details(small.clone()), Some(small));
        assert_eq!(clean_details(Value::Null), None);

        let big = json!({"blob": "x".repeat(MAX_DETAILS_CHARS * 2)});
        match clean_details(big) {
            Some(Value::String(text)) => assert!(text.ends_with(TRUNCATED_SUFFIX)),
            other => panic!("unexpected details: {other:?}"),
        }
    }
}
