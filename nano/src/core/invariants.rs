//! Structural checks over a recorded conversation.

use crate::core::types::{Message, Role};

/// Check the transcript shape every finished run must have:
/// - Starts with a system message
/// - Only assistant messages carry tool calls
/// - Each assistant message is followed by exactly one tool message per call, in call order
/// - No tool message appears without a matching call
pub fn validate_transcript(messages: &[Message]) -> Vec<String> {
    let mut errors = Vec::new();

    match messages.first() {
        Some(first) if first.role == Role::System => {}
        Some(first) => errors.push(format!(
            "message 0: expected system message, found {}",
            first.role.as_str()
        )),
        None => {
            errors.push("transcript is empty".to_string());
            return errors;
        }
    }

    let mut idx = 0;
    while idx < messages.len() {
        let message = &messages[idx];
        if message.role != Role::Assistant && !message.tool_calls.is_empty() {
            errors.push(format!(
                "message {idx}: {} message carries tool calls",
                message.role.as_str()
            ));
        }
        if message.role == Role::Tool {
            errors.push(format!("message {idx}: tool result without a preceding call"));
            idx += 1;
            continue;
        }
        if message.role != Role::Assistant {
            idx += 1;
            continue;
        }

        let calls = &message.tool_calls;
        let mut next = idx + 1;
        for (position, call) in calls.iter().enumerate() {
            match messages.get(next) {
                Some(result) if result.role == Role::Tool => {
                    if result.tool_call_id.as_deref() != Some(call.id.as_str()) {
                        errors.push(format!(
                            "message {next}: result for call {position} of message {idx} has id {:?}, expected {:?}",
                            result.tool_call_id.as_deref().unwrap_or_default(),
                            call.id
                        ));
                    }
                    next += 1;
                }
                _ => {
                    errors.push(format!(
                        "message {idx}: call {:?} has no tool result",
                        call.id
                    ));
                    break;
                }
            }
        }
        idx = next;
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ToolCall, ToolResult};

    fn call(id: &str) -> ToolCall {
        ToolCall::new(id, "shell", r#"{"cmd":"ls"}"#)
    }

    #[test]
    fn complete_transcript_has_no_errors() {
        let messages = vec![
            Message::system("sys"),
            Message::user("task"),
            Message::assistant("", None, vec![call("a"), call("b")]),
            Message::tool(ToolResult::ok("a", "x")),
            Message::tool(ToolResult::failed("b", "y")),
            Message::assistant("done", None, Vec::new()),
        ];
        assert!(validate_transcript(&messages).is_empty());
    }

    #[test]
    fn missing_result_is_reported() {
        let messages = vec![
            Message::system("sys"),
            Message::assistant("", None, vec![call("a"), call("b")]),
            Message::tool(ToolResult::ok("a", "x")),
        ];
        let errors = validate_transcript(&messages);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("\"b\""));
    }

    #[test]
    fn out_of_order_and_orphan_results_are_reported() {
        let messages = vec![
            Message::system("sys"),
            Message::assistant("", None, vec![call("a"), call("b")]),
            Message::tool(ToolResult::ok("b", "x")),
            Message::tool(ToolResult::ok("a", "y")),
            Message::tool(ToolResult::ok("c", "z")),
        ];
        let errors = validate_transcript(&messages);
        assert_eq!(errors.len(), 3, "{errors:?}");
    }

    #[test]
    fn transcript_must_start_with_system() {
        let errors = validate_transcript(&[Message::user("task")]);
        assert_eq!(errors, vec!["message 0: expected system message, found user"]);
    }
}
