//! Claude Messages → CodeWhisperer `conversationState` (C2, §4.2).

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use serde_json::{json, Value};
use uuid::Uuid;

use super::{ClaudeMessage, ClaudeRequest, ContentBlock, MessageContent, ToolDef, ToolResultContent};

const MAX_TOOLS: usize = 25;
const MAX_TOOL_DESCRIPTION_LEN: usize = 1024;
const MAX_TOOL_RESULT_BYTES: usize = 64 * 1024;
const TRUNCATION_SUFFIX: &str = "\n... [truncated]";

const BUILTIN_ALLOW_LIST: &[&str] = &[
    "web_search",
    "bash",
    "code_execution",
    "computer",
    "str_replace_editor",
    "str_replace_based_edit_tool",
];

/// Tools removed outright regardless of allow-list status (§4.2 "static
/// name-mapping table"). Empty by default; operators extend via config if a
/// future upstream revision needs more removals.
static REMOVED_TOOLS: Lazy<HashSet<&'static str>> = Lazy::new(HashSet::new);

/// Parameter rename + fixed-value injection applied to tool-use `input`
/// before sending upstream, keyed by tool name (§4.2). Reversed in C3 before
/// handing tool calls back to the client.
static PARAM_RENAME_TABLE: Lazy<HashMap<&'static str, Vec<(&'static str, &'static str)>>> =
    Lazy::new(|| {
        let mut m = HashMap::new();
        m.insert("str_replace_editor", vec![("path", "file_path")]);
        m
    });

const THINKING_INSTRUCTION: &str =
    "You may use <thinking>...</thinking> tags to reason before responding.";

/// Build the `conversationState` object (§4.2 output shape).
pub fn build_conversation_state(request: &ClaudeRequest) -> Value {
    let mut messages = sanitize_messages(request.messages.clone());
    drop_trailing_literal_brace(&mut messages);
    let messages = merge_adjacent_same_role(messages);

    let thinking_enabled = request.thinking.as_ref().map(|t| t.enabled).unwrap_or(false);
    let mut system_text = request.system.as_ref().map(SystemTextExt::as_text_owned).unwrap_or_default();
    if thinking_enabled && !system_text.is_empty() {
        system_text = format!("{THINKING_INSTRUCTION}\n\n{system_text}");
    } else if thinking_enabled {
        system_text = THINKING_INSTRUCTION.to_string();
    }

    let tool_name_map = build_tool_name_map(&request.tools);
    let filtered_tools = filter_and_cap_tools(&request.tools);

    let (mut history, current) = split_history_and_current(messages, &tool_name_map);
    inject_system_prompt(&mut history, &system_text);

    let history_sanitized = sanitize_history_tool_uses(history, &current);

    let mut state = json!({
        "chatTriggerType": "MANUAL",
        "conversationId": Uuid::new_v4().to_string(),
        "currentMessage": { "userInputMessage": current },
    });

    if !history_sanitized.is_empty() {
        state["history"] = Value::Array(history_sanitized);
    }
    if !filtered_tools.is_empty() {
        state["currentMessage"]["userInputMessage"]["userInputMessageContext"]["tools"] =
            Value::Array(filtered_tools);
    }

    state
}

trait SystemTextExt {
    fn as_text_owned(&self) -> String;
}
impl SystemTextExt for super::SystemField {
    fn as_text_owned(&self) -> String {
        self.as_text()
    }
}

/// Step 1: drop malformed messages (empty role, no content at all).
fn sanitize_messages(messages: Vec<ClaudeMessage>) -> Vec<ClaudeMessage> {
    messages
        .into_iter()
        .filter(|m| !m.role.is_empty())
        .collect()
}

/// Step 2: drop a trailing assistant message whose only content is the
/// literal `"{"` (an observed upstream artefact).
fn drop_trailing_literal_brace(messages: &mut Vec<ClaudeMessage>) {
    if let Some(last) = messages.last() {
        if last.role == "assistant" {
            if let MessageContent::Text(t) = &last.content {
                if t == "{" {
                    messages.pop();
                }
            }
        }
    }
}

/// Step 3: merge adjacent same-role messages; strings concatenate, arrays
/// append, mixed cases coerce to array.
fn merge_adjacent_same_role(messages: Vec<ClaudeMessage>) -> Vec<ClaudeMessage> {
    let mut out: Vec<ClaudeMessage> = Vec::with_capacity(messages.len());
    for msg in messages {
        if let Some(prev) = out.last_mut() {
            if prev.role == msg.role {
                prev.content = merge_content(prev.content.clone(), msg.content);
                continue;
            }
        }
        out.push(msg);
    }
    out
}

fn merge_content(a: MessageContent, b: MessageContent) -> MessageContent {
    match (a, b) {
        (MessageContent::Text(mut a), MessageContent::Text(b)) => {
            a.push('\n');
            a.push_str(&b);
            MessageContent::Text(a)
        }
        (MessageContent::Blocks(mut a), MessageContent::Blocks(b)) => {
            a.extend(b);
            MessageContent::Blocks(a)
        }
        (MessageContent::Text(a), MessageContent::Blocks(mut b)) => {
            let mut blocks = vec![ContentBlock::Text { text: a }];
            blocks.append(&mut b);
            MessageContent::Blocks(blocks)
        }
        (MessageContent::Blocks(mut a), MessageContent::Text(b)) => {
            a.push(ContentBlock::Text { text: b });
            MessageContent::Blocks(a)
        }
    }
}

/// Builds the id→name map from prior assistant `tool_use` blocks, used both
/// for tool-pruning propagation and for resolving `tool_result` blocks back
/// to the tool they answer.
fn build_tool_use_id_map(messages: &[ClaudeMessage]) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for msg in messages {
        if let MessageContent::Blocks(blocks) = &msg.content {
            for block in blocks {
                if let ContentBlock::ToolUse { id, name, .. } = block {
                    map.insert(id.clone(), name.clone());
                }
            }
        }
    }
    map
}

fn build_tool_name_map(tools: &[ToolDef]) -> HashSet<String> {
    let mut removed = HashSet::new();
    for tool in tools {
        let builtin = BUILTIN_ALLOW_LIST.contains(&tool.name.as_str());
        let statically_removed = REMOVED_TOOLS.contains(tool.name.as_str());
        if builtin || statically_removed {
            removed.insert(tool.name.clone());
        }
    }
    removed
}

fn filter_and_cap_tools(tools: &[ToolDef]) -> Vec<Value> {
    tools
        .iter()
        .filter(|t| !BUILTIN_ALLOW_LIST.contains(&t.name.as_str()) && !REMOVED_TOOLS.contains(t.name.as_str()))
        .take(MAX_TOOLS)
        .map(|tool| {
            let mut description = tool.description.clone();
            if description.len() > MAX_TOOL_DESCRIPTION_LEN {
                description.truncate(MAX_TOOL_DESCRIPTION_LEN);
            }
            json!({
                "toolSpecification": {
                    "name": tool.name,
                    "description": description,
                    "inputSchema": { "json": compress_schema(tool.input_schema.clone()) },
                }
            })
        })
        .collect()
}

/// Strip keys upstream doesn't support, recursively. Validation keywords
/// (min/max/pattern) pass through untouched.
fn compress_schema(schema: Value) -> Value {
    const DROP_KEYS: &[&str] = &["$schema", "$id", "definitions", "examples", "allOf", "anyOf", "oneOf", "not"];

    match schema {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                if DROP_KEYS.contains(&k.as_str()) {
                    continue;
                }
                out.insert(k, compress_schema(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(compress_schema).collect()),
        other => other,
    }
}

fn apply_param_renames(tool_name: &str, input: Value) -> Value {
    let Some(renames) = PARAM_RENAME_TABLE.get(tool_name) else {
        return input;
    };
    let Value::Object(mut map) = input else {
        return input;
    };
    for (from, to) in renames {
        if let Some(v) = map.remove(*from) {
            map.insert(to.to_string(), v);
        }
    }
    Value::Object(map)
}

/// Inverse of [`apply_param_renames`] — used by C3 to translate a completed
/// tool call's upstream parameter names back to the names the client's tool
/// definition used, before handing the call back to the client.
pub fn reverse_param_renames(tool_name: &str, input: Value) -> Value {
    let Some(renames) = PARAM_RENAME_TABLE.get(tool_name) else {
        return input;
    };
    let Value::Object(mut map) = input else {
        return input;
    };
    for (from, to) in renames {
        if let Some(v) = map.remove(*to) {
            map.insert(from.to_string(), v);
        }
    }
    Value::Object(map)
}

fn extract_text(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(t) => t.clone(),
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.clone()),
                ContentBlock::Thinking { thinking } => Some(format!("<thinking>{thinking}</thinking>\n")),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(""),
    }
}

fn extract_tool_uses(content: &MessageContent, removed_tools: &HashSet<String>) -> Vec<Value> {
    let MessageContent::Blocks(blocks) = content else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::ToolUse { id, name, input } if !removed_tools.contains(name) => Some(json!({
                "toolUseId": id,
                "name": name,
                "input": apply_param_renames(name, input.clone()),
            })),
            _ => None,
        })
        .collect()
}

fn extract_tool_results(content: &MessageContent, removed_by_id: &HashMap<String, String>, removed_tools: &HashSet<String>) -> Vec<Value> {
    let MessageContent::Blocks(blocks) = content else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for b in blocks {
        if let ContentBlock::ToolResult { tool_use_id, content } = b {
            if let Some(name) = removed_by_id.get(tool_use_id) {
                if removed_tools.contains(name) {
                    continue;
                }
            }
            if !seen.insert(tool_use_id.clone()) {
                continue;
            }
            let mut text = match content {
                ToolResultContent::Empty => String::new(),
                ToolResultContent::Text(t) => t.clone(),
                ToolResultContent::Blocks(blocks) => blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text { text } => Some(text.clone()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join(""),
            };
            if text.len() > MAX_TOOL_RESULT_BYTES {
                text.truncate(MAX_TOOL_RESULT_BYTES);
                text.push_str(TRUNCATION_SUFFIX);
            }
            out.push(json!({
                "toolUseId": tool_use_id,
                "status": "success",
                "content": [{ "text": text }],
            }));
        }
    }
    out
}

fn extract_images(content: &MessageContent) -> Vec<Value> {
    let MessageContent::Blocks(blocks) = content else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Image { source } => {
                let format = resolve_image_format(source);
                let bytes = source.data.clone().unwrap_or_default();
                Some(json!({ "format": format, "source": { "bytes": bytes } }))
            }
            _ => None,
        })
        .collect()
}

fn resolve_image_format(source: &super::ImageSource) -> String {
    if let Some(media_type) = &source.media_type {
        if let Some(subtype) = media_type.split('/').nth(1) {
            return subtype.to_string();
        }
    }
    if let Some(data) = &source.data {
        if let Ok(decoded) = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, data) {
            if decoded.starts_with(b"\x89PNG") {
                return "png".to_string();
            }
            if decoded.starts_with(&[0xFF, 0xD8]) {
                return "jpeg".to_string();
            }
            if decoded.starts_with(b"GIF8") {
                return "gif".to_string();
            }
        }
    }
    if let Some(url) = &source.url {
        if let Some(ext) = url.rsplit('.').next() {
            if ["png", "jpeg", "jpg", "gif", "webp"].contains(&ext) {
                return if ext == "jpg" { "jpeg".into() } else { ext.to_string() };
            }
        }
    }
    "jpeg".to_string()
}

/// History construction + current-message split (§4.2). Returns
/// `(history_entries, current_user_input_message)`.
fn split_history_and_current(
    mut messages: Vec<ClaudeMessage>,
    removed_tools: &HashSet<String>,
) -> (Vec<Value>, Value) {
    let removed_by_id = build_tool_use_id_map(&messages);

    let last_is_assistant = messages.last().map(|m| m.role == "assistant").unwrap_or(false);

    let mut history = Vec::new();
    let tail_entry = if last_is_assistant {
        let tail = messages.pop().unwrap();
        Some(message_to_history_entry(&tail, removed_tools, &removed_by_id))
    } else {
        None
    };
    let current_message = if tail_entry.is_some() {
        build_user_input_message("Continue", &[], &[], &[])
    } else if let Some(last) = messages.pop() {
        let text = extract_text(&last.content);
        let tools = extract_tool_uses(&last.content, removed_tools);
        let results = extract_tool_results(&last.content, &removed_by_id, removed_tools);
        let images = extract_images(&last.content);
        let text = if text.is_empty() && !results.is_empty() {
            "Tool results provided.".to_string()
        } else if text.is_empty() {
            "Continue".to_string()
        } else {
            text
        };
        let _ = tools; // current message carries no toolUses of its own; retained for symmetry
        build_user_input_message(&text, &results, &images, &[])
    } else {
        build_user_input_message("Continue", &[], &[], &[])
    };

    for msg in &messages {
        history.push(message_to_history_entry(msg, removed_tools, &removed_by_id));
    }
    if let Some(entry) = tail_entry {
        history.push(entry);
    }

    (history, current_message)
}

fn message_to_history_entry(
    msg: &ClaudeMessage,
    removed_tools: &HashSet<String>,
    removed_by_id: &HashMap<String, String>,
) -> Value {
    let text = extract_text(&msg.content);
    if msg.role == "assistant" {
        let tool_uses = extract_tool_uses(&msg.content, removed_tools);
        let text = if text.is_empty() && !tool_uses.is_empty() {
            "Calling tools...".to_string()
        } else if text.is_empty() {
            "...".to_string()
        } else {
            text
        };
        let mut entry = json!({ "assistantResponseMessage": { "content": text } });
        if !tool_uses.is_empty() {
            entry["assistantResponseMessage"]["toolUses"] = Value::Array(tool_uses);
        }
        entry
    } else {
        let results = extract_tool_results(&msg.content, removed_by_id, removed_tools);
        let images = extract_images(&msg.content);
        let text = if text.is_empty() && !results.is_empty() {
            "Tool results provided.".to_string()
        } else if text.is_empty() {
            "Continue".to_string()
        } else {
            text
        };
        json!({ "userInputMessage": build_user_input_message(&text, &results, &images, &[]) })
    }
}

fn build_user_input_message(text: &str, tool_results: &[Value], images: &[Value], tools: &[Value]) -> Value {
    let mut msg = json!({ "content": text });
    let mut context = serde_json::Map::new();
    if !tool_results.is_empty() {
        context.insert("toolResults".into(), Value::Array(tool_results.to_vec()));
    }
    if !tools.is_empty() {
        context.insert("tools".into(), Value::Array(tools.to_vec()));
    }
    if !context.is_empty() {
        msg["userInputMessageContext"] = Value::Object(context);
    }
    if !images.is_empty() {
        msg["images"] = Value::Array(images.to_vec());
    }
    msg
}

fn inject_system_prompt(history: &mut Vec<Value>, system_text: &str) {
    if system_text.is_empty() {
        return;
    }
    if let Some(first) = history.first_mut() {
        if let Some(user_msg) = first.get_mut("userInputMessage") {
            if let Some(content) = user_msg.get("content").and_then(Value::as_str) {
                let merged = format!("{system_text}\n\n{content}");
                user_msg["content"] = Value::String(merged);
                return;
            }
        }
    }
    history.insert(0, json!({ "userInputMessage": { "content": system_text } }));
}

/// Final pass (§4.2): strip `toolUses` from any history entry whose ids have
/// no matching `toolResults` later in history or in the current message.
fn sanitize_history_tool_uses(history: Vec<Value>, current: &Value) -> Vec<Value> {
    let mut answered: HashSet<String> = HashSet::new();
    for entry in &history {
        if let Some(results) = entry.pointer("/userInputMessage/userInputMessageContext/toolResults") {
            if let Some(arr) = results.as_array() {
                for r in arr {
                    if let Some(id) = r.get("toolUseId").and_then(Value::as_str) {
                        answered.insert(id.to_string());
                    }
                }
            }
        }
    }
    if let Some(results) = current.pointer("/userInputMessageContext/toolResults") {
        if let Some(arr) = results.as_array() {
            for r in arr {
                if let Some(id) = r.get("toolUseId").and_then(Value::as_str) {
                    answered.insert(id.to_string());
                }
            }
        }
    }

    history
        .into_iter()
        .map(|mut entry| {
            if let Some(tool_uses) = entry.pointer("/assistantResponseMessage/toolUses").and_then(Value::as_array) {
                let all_answered = tool_uses
                    .iter()
                    .all(|tu| tu.get("toolUseId").and_then(Value::as_str).map(|id| answered.contains(id)).unwrap_or(false));
                if !all_answered {
                    if let Some(obj) = entry.get_mut("assistantResponseMessage").and_then(Value::as_object_mut) {
                        obj.remove("toolUses");
                    }
                }
            }
            entry
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::{ClaudeMessage, ClaudeRequest, MessageContent};

    fn text_message(role: &str, text: &str) -> ClaudeMessage {
        ClaudeMessage { role: role.into(), content: MessageContent::Text(text.into()) }
    }

    #[test]
    fn reverse_param_renames_undoes_apply_param_renames() {
        let applied = apply_param_renames("str_replace_editor", json!({"path": "/tmp/a"}));
        assert_eq!(applied, json!({"file_path": "/tmp/a"}));
        let reversed = reverse_param_renames("str_replace_editor", applied);
        assert_eq!(reversed, json!({"path": "/tmp/a"}));
    }

    fn request(messages: Vec<ClaudeMessage>) -> ClaudeRequest {
        ClaudeRequest {
            model: "claude-sonnet-4-20250514".into(),
            messages,
            system: None,
            tools: Vec::new(),
            stream: false,
            thinking: None,
        }
    }

    #[test]
    fn current_message_is_always_user_input_message() {
        let req = request(vec![text_message("user", "hi")]);
        let state = build_conversation_state(&req);
        assert!(state["currentMessage"]["userInputMessage"].is_object());
    }

    #[test]
    fn trailing_assistant_message_becomes_history_plus_synthetic_continue() {
        let req = request(vec![text_message("user", "hi"), text_message("assistant", "hello")]);
        let state = build_conversation_state(&req);
        assert_eq!(state["currentMessage"]["userInputMessage"]["content"], "Continue");
        let history = state["history"].as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].get("userInputMessage").is_some(), "first history entry should be the original user message");
        assert!(history[1].get("assistantResponseMessage").is_some(), "trailing assistant message should be appended last");
    }

    #[test]
    fn history_is_absent_when_empty() {
        let req = request(vec![text_message("user", "only message")]);
        let state = build_conversation_state(&req);
        assert!(state.get("history").is_none());
    }

    #[test]
    fn tools_cap_at_25_after_filtering_builtins() {
        let mut tools = vec![ToolDef { tool_type: None, name: "bash".into(), description: String::new(), input_schema: json!({}) }];
        for i in 0..30 {
            tools.push(ToolDef {
                tool_type: None,
                name: format!("custom_tool_{i}"),
                description: String::new(),
                input_schema: json!({}),
            });
        }
        let mut req = request(vec![text_message("user", "hi")]);
        req.tools = tools;
        let state = build_conversation_state(&req);
        let tool_list = state["currentMessage"]["userInputMessage"]["userInputMessageContext"]["tools"]
            .as_array()
            .unwrap();
        assert_eq!(tool_list.len(), MAX_TOOLS);
    }

    #[test]
    fn tool_result_text_truncates_at_64_kib() {
        let blocks = vec![ContentBlock::ToolResult {
            tool_use_id: "t1".into(),
            content: ToolResultContent::Text("x".repeat(MAX_TOOL_RESULT_BYTES + 100)),
        }];
        let mut req = request(vec![
            ClaudeMessage { role: "user".into(), content: MessageContent::Blocks(blocks) },
        ]);
        req.messages.push(text_message("assistant", "ok"));
        req.messages.push(text_message("user", "next"));
        let state = build_conversation_state(&req);
        let history = state["history"].as_array().unwrap();
        let results = history[0].pointer("/userInputMessage/userInputMessageContext/toolResults").unwrap();
        let text = results[0]["content"][0]["text"].as_str().unwrap();
        assert!(text.len() <= MAX_TOOL_RESULT_BYTES + TRUNCATION_SUFFIX.len());
        assert!(text.ends_with(TRUNCATION_SUFFIX));
    }

    #[test]
    fn schema_compression_strips_unsupported_keys() {
        let schema = json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "properties": { "x": { "type": "string", "minLength": 1 } },
            "anyOf": [{"type": "string"}],
        });
        let compressed = compress_schema(schema);
        assert!(compressed.get("$schema").is_none());
        assert!(compressed.get("anyOf").is_none());
        assert_eq!(compressed["properties"]["x"]["minLength"], 1);
    }

    #[test]
    fn history_sanitizer_strips_unanswered_tool_uses() {
        let assistant_blocks = vec![ContentBlock::ToolUse {
            id: "t1".into(),
            name: "bash".into(),
            input: json!({"cmd": "ls"}),
        }];
        let req = request(vec![
            text_message("user", "run ls"),
            ClaudeMessage { role: "assistant".into(), content: MessageContent::Blocks(assistant_blocks) },
            text_message("user", "what happened"),
        ]);
        let state = build_conversation_state(&req);
        let history = state["history"].as_array().unwrap();
        let assistant_entry = history.iter().find(|e| e.get("assistantResponseMessage").is_some()).unwrap();
        assert!(assistant_entry.pointer("/assistantResponseMessage/toolUses").is_none());
    }

    proptest::proptest! {
        /// Whatever number of tools a client sends, the request builder must
        /// never forward more than `MAX_TOOLS`, and must forward all of them
        /// when the count is already at or under the cap.
        #[test]
        fn tool_list_never_exceeds_cap(tool_count in 0usize..60) {
            let tools = (0..tool_count)
                .map(|i| ToolDef {
                    tool_type: None,
                    name: format!("tool_{i}"),
                    description: String::new(),
                    input_schema: json!({}),
                })
                .collect::<Vec<_>>();

            let mut req = request(vec![text_message("user", "hi")]);
            req.tools = tools;
            let state = build_conversation_state(&req);
            let tool_list = state["currentMessage"]["userInputMessage"]["userInputMessageContext"]["tools"]
                .as_array()
                .cloned()
                .unwrap_or_default();

            proptest::prop_assert!(tool_list.len() <= MAX_TOOLS);
            proptest::prop_assert_eq!(tool_list.len(), tool_count.min(MAX_TOOLS));
        }
    }
}
