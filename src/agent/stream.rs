use serde::Deserialize;
use serde_json::Value;

/// Tool results are cut to this many characters.
pub const TOOL_RESULT_MAX_CHARS: usize = 200;
const TOOL_ARG_MAX_CHARS: usize = 120;

/// Events from the agent CLI's stream-json output format
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "system")]
    System {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },

    #[serde(rename = "assistant")]
    Assistant { message: Message },

    #[serde(rename = "user")]
    User { message: Message },

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        num_turns: Option<u32>,
        #[serde(default)]
        duration_ms: Option<u64>,
    },

    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        #[serde(default)]
        content: Value,
    },

    #[serde(other)]
    Other,
}

/// Reduce one stream-json line to the display lines it produces. Lines that
/// are not valid events are passed through unchanged.
pub fn summarize_line(line: &str) -> Vec<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let Ok(event) = serde_json::from_str::<StreamEvent>(trimmed) else {
        return vec![line.to_string()];
    };

    match event {
        StreamEvent::System {
            subtype,
            session_id,
            model,
        } if subtype == "init" => {
            let mut out = String::from("Agent session started");
            if let Some(id) = session_id {
                out.push_str(&format!(" ({})", id));
            }
            if let Some(model) = model {
                out.push_str(&format!(" using {}", model));
            }
            vec![out]
        }
        StreamEvent::System { .. } | StreamEvent::Unknown => Vec::new(),
        StreamEvent::Assistant { message } => message
            .content
            .iter()
            .flat_map(|block| match block {
                ContentBlock::Text { text } => text
                    .lines()
                    .filter(|l| !l.trim().is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>(),
                ContentBlock::ToolUse { name, input } => vec![describe_tool_use(name, input)],
                _ => Vec::new(),
            })
            .collect(),
        StreamEvent::User { message } => message
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolResult { content } => Some(format!(
                    "\u{2192} {}",
                    truncate_chars(&tool_result_text(content), TOOL_RESULT_MAX_CHARS)
                )),
                _ => None,
            })
            .collect(),
        StreamEvent::Result {
            subtype,
            result,
            is_error,
            num_turns,
            duration_ms,
        } => {
            if is_error || subtype != "success" {
                let detail = result.filter(|r| !r.trim().is_empty()).unwrap_or(subtype);
                vec![format!("Agent finished with error: {}", detail)]
            } else {
                let mut out = String::from("Agent finished successfully");
                if let Some(turns) = num_turns {
                    out.push_str(&format!(" after {} turns", turns));
                }
                if let Some(ms) = duration_ms {
                    out.push_str(&format!(" in {:.1}s", ms as f64 / 1000.0));
                }
                vec![out]
            }
        }
    }
}

/// `<tool> <primary argument>`, where the primary argument is the first of
/// the well-known input keys present.
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    const PRIMARY_KEYS: [&str; 7] = [
        "file_path",
        "path",
        "command",
        "pattern",
        "url",
        "description",
        "query",
    ];
    let arg = PRIMARY_KEYS
        .iter()
        .find_map(|k| input.get(*k).and_then(|v| v.as_str()));
    match arg {
        Some(arg) => format!("{} {}", name, truncate_chars(&flatten(arg), TOOL_ARG_MAX_CHARS)),
        None => name.to_string(),
    }
}

fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(s) => flatten(s),
        Value::Array(parts) => flatten(
            &parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join(" "),
        ),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn flatten(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncate to `max` characters, appending `...` when anything was cut.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_init_produces_session_line() {
        let out = summarize_line(
            r#"{"type":"system","subtype":"init","session_id":"abc","model":"sonnet","tools":[]}"#,
        );
        assert_eq!(out, vec!["Agent session started (abc) using sonnet"]);
    }

    #[test]
    fn test_other_system_subtypes_are_silent() {
        assert!(summarize_line(r#"{"type":"system","subtype":"compact_boundary"}"#).is_empty());
    }

    #[test]
    fn test_assistant_text_splits_lines() {
        let out = summarize_line(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"First\n\nSecond"}]}}"#,
        );
        assert_eq!(out, vec!["First", "Second"]);
    }

    #[test]
    fn test_assistant_tool_use_uses_primary_argument() {
        let out = summarize_line(
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"Edit","input":{"file_path":"src/lib.rs","old_string":"a"}},{"type":"tool_use","name":"Bash","input":{"command":"cargo test"}}]}}"#,
        );
        assert_eq!(out, vec!["Edit src/lib.rs", "Bash cargo test"]);
    }

    #[test]
    fn test_tool_use_without_known_argument() {
        let input = serde_json::json!({"todos": []});
        assert_eq!(describe_tool_use("TodoWrite", &input), "TodoWrite");
    }

    #[test]
    fn test_thinking_block_is_silent() {
        let out = summarize_line(
            r#"{"type":"assistant","message":{"content":[{"type":"thinking","thinking":"hmm"}]}}"#,
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_tool_result_is_truncated() {
        let long = "x".repeat(500);
        let line = format!(
            r#"{{"type":"user","message":{{"content":[{{"type":"tool_result","tool_use_id":"t1","content":"{}"}}]}}}}"#,
            long
        );
        let out = summarize_line(&line);
        assert_eq!(out.len(), 1);
        let expected = format!("\u{2192} {}...", "x".repeat(200));
        assert_eq!(out[0], expected);
    }

    #[test]
    fn test_tool_result_array_content() {
        let out = summarize_line(
            r#"{"type":"user","message":{"content":[{"type":"tool_result","content":[{"type":"text","text":"ok\nall good"}]}]}}"#,
        );
        assert_eq!(out, vec!["\u{2192} ok all good"]);
    }

    #[test]
    fn test_result_success_and_error() {
        let ok = summarize_line(
            r#"{"type":"result","subtype":"success","is_error":false,"num_turns":4,"duration_ms":12500,"result":"done"}"#,
        );
        assert_eq!(ok, vec!["Agent finished successfully after 4 turns in 12.5s"]);

        let err = summarize_line(
            r#"{"type":"result","subtype":"error_max_turns","is_error":true}"#,
        );
        assert_eq!(err, vec!["Agent finished with error: error_max_turns"]);
    }

    #[test]
    fn test_unparseable_line_forwarded_raw() {
        assert_eq!(summarize_line("plain warning text"), vec!["plain warning text"]);
        assert_eq!(summarize_line("{not json"), vec!["{not json"]);
    }

    #[test]
    fn test_unknown_event_type_is_silent() {
        assert!(summarize_line(r#"{"type":"stream_event","event":{}}"#).is_empty());
    }

    #[test]
    fn test_truncate_chars_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo wörld", 5), "héllo...");
        assert_eq!(truncate_chars("short", 10), "short");
    }
}
