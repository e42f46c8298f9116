//! Internal events → Claude SSE chunk sequence (C3, §4.3).

use std::collections::HashMap;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::codec::InternalEvent;

#[derive(Debug, Clone, PartialEq)]
enum ThinkingState {
    Outside,
    InsideTag,
    TagClosed,
    BlockClosed,
}

#[derive(Debug, Clone)]
struct ToolCallState {
    name: String,
    accumulated_input: String,
    server_side_execute: bool,
}

#[derive(Debug, Clone)]
struct CompletedToolCall {
    id: String,
    name: String,
    input: Value,
}

/// Per-request streaming state (§4.3).
pub struct StreamTranslator {
    message_id: String,
    block_index: i64,
    text_block_open: bool,
    thinking_block_open: bool,
    thinking_state: ThinkingState,
    tool_calls: HashMap<String, ToolCallState>,
    tool_call_order: Vec<String>,
    completed_tool_calls: Vec<CompletedToolCall>,
    last_content_emitted: Option<String>,
    code_references: Option<Vec<Value>>,
    conversation_id: Option<String>,
    input_tokens: u64,
    output_tokens_estimate: u64,
    prompt_uses_injected_thinking: bool,
    emitted_any_tool_use: bool,
}

/// One outbound SSE chunk: `(event_name, json_data)`.
pub type SseChunk = (&'static str, Value);

impl StreamTranslator {
    pub fn new(input_tokens: u64, prompt_uses_injected_thinking: bool) -> Self {
        Self {
            message_id: format!("msg_{}", Uuid::new_v4().simple()),
            block_index: -1,
            text_block_open: false,
            thinking_block_open: false,
            thinking_state: ThinkingState::Outside,
            tool_calls: HashMap::new(),
            tool_call_order: Vec::new(),
            completed_tool_calls: Vec::new(),
            last_content_emitted: None,
            code_references: None,
            conversation_id: None,
            input_tokens,
            output_tokens_estimate: 0,
            prompt_uses_injected_thinking,
            emitted_any_tool_use: false,
        }
    }

    pub fn message_start(&self) -> SseChunk {
        (
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": "",
                    "stop_reason": Value::Null,
                    "usage": { "input_tokens": self.input_tokens, "output_tokens": 0 },
                }
            }),
        )
    }

    fn open_text_block(&mut self, out: &mut Vec<SseChunk>) {
        if !self.text_block_open {
            self.close_thinking_block(out);
            self.block_index += 1;
            out.push((
                "content_block_start",
                json!({"type":"content_block_start","index":self.block_index,"content_block":{"type":"text","text":""}}),
            ));
            self.text_block_open = true;
        }
    }

    fn close_text_block(&mut self, out: &mut Vec<SseChunk>) {
        if self.text_block_open {
            out.push(("content_block_stop", json!({"type":"content_block_stop","index":self.block_index})));
            self.text_block_open = false;
        }
    }

    fn open_thinking_block(&mut self, out: &mut Vec<SseChunk>) {
        if !self.thinking_block_open {
            self.block_index += 1;
            out.push((
                "content_block_start",
                json!({"type":"content_block_start","index":self.block_index,"content_block":{"type":"thinking","thinking":""}}),
            ));
            self.thinking_block_open = true;
        }
    }

    fn close_thinking_block(&mut self, out: &mut Vec<SseChunk>) {
        if self.thinking_block_open {
            out.push(("content_block_stop", json!({"type":"content_block_stop","index":self.block_index})));
            self.thinking_block_open = false;
        }
    }

    /// Process one internal event, appending zero or more SSE chunks.
    pub fn handle_event(&mut self, event: InternalEvent, out: &mut Vec<SseChunk>) {
        match event {
            InternalEvent::Content(text) => self.handle_content(text, out),
            InternalEvent::Thinking(text) => {
                self.open_thinking_block(out);
                self.block_index_delta("thinking_delta", "thinking", &text, out);
            }
            InternalEvent::ToolUse { id, name } => {
                let server_side_execute = name == "webSearch";
                self.tool_calls.insert(
                    id.clone(),
                    ToolCallState { name, accumulated_input: String::new(), server_side_execute },
                );
                self.tool_call_order.push(id);
            }
            InternalEvent::ToolUseInput { id, partial_json } => {
                if let Some(state) = self.tool_calls.get_mut(&id) {
                    state.accumulated_input.push_str(&partial_json);
                }
            }
            InternalEvent::ToolUseStop { id, stop } => {
                if !stop {
                    return;
                }
                if let Some(state) = self.tool_calls.remove(&id) {
                    if state.server_side_execute {
                        return;
                    }
                    let input = serde_json::from_str(&state.accumulated_input)
                        .unwrap_or(Value::String(state.accumulated_input.clone()));
                    self.completed_tool_calls.push(CompletedToolCall { id, name: state.name, input });
                }
            }
            InternalEvent::Metering { units } => {
                self.output_tokens_estimate = (units * 1000.0).ceil() as u64;
            }
            InternalEvent::Followup(_) | InternalEvent::CodeReference(_) | InternalEvent::Metadata { .. } => {
                self.handle_side_channel(event);
            }
        }
    }

    fn handle_side_channel(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::CodeReference(refs) => self.code_references = Some(refs),
            InternalEvent::Metadata { conversation_id } => self.conversation_id = Some(conversation_id),
            _ => {}
        }
    }

    fn handle_content(&mut self, text: String, out: &mut Vec<SseChunk>) {
        if self.last_content_emitted.as_deref() == Some(text.as_str()) {
            return;
        }
        self.last_content_emitted = Some(text.clone());

        if self.prompt_uses_injected_thinking {
            self.split_thinking_tags(&text, out);
        } else {
            self.open_text_block(out);
            self.block_index_delta("text_delta", "text", &text, out);
        }
    }

    fn block_index_delta(&mut self, delta_type: &'static str, field: &'static str, text: &str, out: &mut Vec<SseChunk>) {
        let key = if delta_type == "thinking_delta" { "thinking" } else { "text" };
        let _ = field;
        out.push((
            "content_block_delta",
            json!({"type":"content_block_delta","index":self.block_index,"delta":{"type":delta_type, key: text}}),
        ));
    }

    /// Character-by-character splitter for prompt-injected thinking (§4.3):
    /// routes text before `<thinking>` to the text block, text inside to the
    /// thinking block, and resumes text after `</thinking>`.
    fn split_thinking_tags(&mut self, text: &str, out: &mut Vec<SseChunk>) {
        const OPEN: &str = "<thinking>";
        const CLOSE: &str = "</thinking>";
        let mut rest = text;

        loop {
            match self.thinking_state {
                ThinkingState::Outside => {
                    if let Some(pos) = rest.find(OPEN) {
                        let (before, after) = rest.split_at(pos);
                        if !before.is_empty() {
                            self.open_text_block(out);
                            self.block_index_delta("text_delta", "text", before, out);
                        }
                        self.thinking_state = ThinkingState::InsideTag;
                        rest = &after[OPEN.len()..];
                    } else {
                        self.open_text_block(out);
                        self.block_index_delta("text_delta", "text", rest, out);
                        return;
                    }
                }
                ThinkingState::InsideTag => {
                    if let Some(pos) = rest.find(CLOSE) {
                        let (before, after) = rest.split_at(pos);
                        if !before.is_empty() {
                            self.open_thinking_block(out);
                            self.block_index_delta("thinking_delta", "thinking", before, out);
                        }
                        self.close_thinking_block(out);
                        self.thinking_state = ThinkingState::TagClosed;
                        rest = &after[CLOSE.len()..];
                    } else {
                        if !rest.is_empty() {
                            self.open_thinking_block(out);
                            self.block_index_delta("thinking_delta", "thinking", rest, out);
                        }
                        return;
                    }
                }
                ThinkingState::TagClosed | ThinkingState::BlockClosed => {
                    self.thinking_state = ThinkingState::BlockClosed;
                    if !rest.is_empty() {
                        self.open_text_block(out);
                        self.block_index_delta("text_delta", "text", rest, out);
                    }
                    return;
                }
            }
        }
    }

    /// Emit the tool-use phase, code-references, and terminal chunks
    /// (§4.3 steps 4-7). Call once after the upstream stream is exhausted.
    pub fn finish(mut self, reverse_param_map: &dyn Fn(&str, Value) -> Value) -> Vec<SseChunk> {
        let mut out = Vec::new();
        self.close_text_block(&mut out);
        self.close_thinking_block(&mut out);

        let order = self.tool_call_order.clone();
        let mut by_id: HashMap<String, CompletedToolCall> =
            self.completed_tool_calls.drain(..).map(|c| (c.id.clone(), c)).collect();

        for id in &order {
            let Some(call) = by_id.remove(id) else { continue };
            self.emitted_any_tool_use = true;
            self.block_index += 1;
            out.push((
                "content_block_start",
                json!({"type":"content_block_start","index":self.block_index,"content_block":{"type":"tool_use","id":call.id,"name":call.name,"input":{}}}),
            ));
            let reversed_input = reverse_param_map(&call.name, call.input);
            out.push((
                "content_block_delta",
                json!({"type":"content_block_delta","index":self.block_index,"delta":{"type":"input_json_delta","partial_json":reversed_input.to_string()}}),
            ));
            out.push(("content_block_stop", json!({"type":"content_block_stop","index":self.block_index})));
        }

        if let Some(refs) = &self.code_references {
            out.push(("content_block_delta", json!({"type":"content_block_delta","delta":{"type":"code_references","references":refs}})));
        }

        let stop_reason = if self.emitted_any_tool_use { "tool_use" } else { "end_turn" };
        out.push((
            "message_delta",
            json!({"type":"message_delta","delta":{"stop_reason":stop_reason},"usage":{"output_tokens":self.output_tokens_estimate}}),
        ));
        out.push(("message_stop", json!({"type":"message_stop"})));

        out
    }

    /// §4.3 error injection: one `error` chunk emitted in-band after the
    /// message has started, then the stream ends.
    pub fn error_chunk(message: &str) -> SseChunk {
        ("error", json!({"type":"error","error":{"type":"api_error","message":message}}))
    }
}

/// Replays a chunk sequence (`message_start` .. `message_stop`) into the
/// single non-streaming Claude Message body §4.8 returns when the caller
/// didn't ask for `stream: true`. Both response shapes come from the same
/// chunk sequence so there is exactly one place that knows the mapping.
pub fn assemble_message(chunks: &[SseChunk], model: &str) -> Value {
    let mut message = chunks
        .iter()
        .find(|(name, _)| *name == "message_start")
        .map(|(_, v)| v["message"].clone())
        .unwrap_or_else(|| json!({"id": "", "type": "message", "role": "assistant"}));
    message["model"] = Value::String(model.to_string());

    let mut blocks: HashMap<i64, Value> = HashMap::new();
    let mut order: Vec<i64> = Vec::new();
    let mut code_references: Option<Value> = None;

    for (name, value) in chunks {
        match *name {
            "content_block_start" => {
                let index = value["index"].as_i64().unwrap_or(0);
                order.push(index);
                blocks.insert(index, value["content_block"].clone());
            }
            "content_block_delta" => {
                let delta = &value["delta"];
                if let Some(index) = value.get("index").and_then(Value::as_i64) {
                    let Some(block) = blocks.get_mut(&index) else { continue };
                    match delta["type"].as_str() {
                        Some("text_delta") => {
                            let existing = block["text"].as_str().unwrap_or("").to_string();
                            block["text"] = Value::String(existing + delta["text"].as_str().unwrap_or(""));
                        }
                        Some("thinking_delta") => {
                            let existing = block["thinking"].as_str().unwrap_or("").to_string();
                            block["thinking"] =
                                Value::String(existing + delta["thinking"].as_str().unwrap_or(""));
                        }
                        Some("input_json_delta") => {
                            let parsed = delta["partial_json"]
                                .as_str()
                                .and_then(|s| serde_json::from_str::<Value>(s).ok())
                                .unwrap_or(Value::Object(Default::default()));
                            block["input"] = parsed;
                        }
                        _ => {}
                    }
                } else if delta["type"] == "code_references" {
                    code_references = Some(delta["references"].clone());
                }
            }
            "message_delta" => {
                message["stop_reason"] = value["delta"]["stop_reason"].clone();
                if let Some(usage) = message.get_mut("usage") {
                    usage["output_tokens"] = value["usage"]["output_tokens"].clone();
                } else {
                    message["usage"] = json!({"output_tokens": value["usage"]["output_tokens"]});
                }
            }
            _ => {}
        }
    }

    let content: Vec<Value> = order.into_iter().filter_map(|i| blocks.remove(&i)).collect();
    message["content"] = Value::Array(content);
    if let Some(refs) = code_references {
        message["code_references"] = refs;
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_reverse(_name: &str, input: Value) -> Value {
        input
    }

    #[test]
    fn suppresses_duplicate_content_events() {
        let mut translator = StreamTranslator::new(10, false);
        let mut out = Vec::new();
        translator.handle_event(InternalEvent::Content("hi".into()), &mut out);
        translator.handle_event(InternalEvent::Content("hi".into()), &mut out);
        let deltas = out.iter().filter(|(name, _)| *name == "content_block_delta").count();
        assert_eq!(deltas, 1);
    }

    #[test]
    fn stop_reason_is_tool_use_when_a_tool_call_completed() {
        let mut translator = StreamTranslator::new(10, false);
        let mut out = Vec::new();
        translator.handle_event(InternalEvent::ToolUse { id: "t1".into(), name: "bash".into() }, &mut out);
        translator.handle_event(
            InternalEvent::ToolUseInput { id: "t1".into(), partial_json: r#"{"cmd":"ls"}"#.into() },
            &mut out,
        );
        translator.handle_event(InternalEvent::ToolUseStop { id: "t1".into(), stop: true }, &mut out);
        let chunks = translator.finish(&noop_reverse);
        let delta = chunks.iter().find(|(name, _)| *name == "message_delta").unwrap();
        assert_eq!(delta.1["delta"]["stop_reason"], "tool_use");
    }

    #[test]
    fn stop_reason_is_end_turn_with_no_tool_calls() {
        let mut translator = StreamTranslator::new(10, false);
        let mut out = Vec::new();
        translator.handle_event(InternalEvent::Content("hi".into()), &mut out);
        let chunks = translator.finish(&noop_reverse);
        let delta = chunks.iter().find(|(name, _)| *name == "message_delta").unwrap();
        assert_eq!(delta.1["delta"]["stop_reason"], "end_turn");
    }

    #[test]
    fn web_search_tool_use_is_server_side_and_not_emitted() {
        let mut translator = StreamTranslator::new(10, false);
        let mut out = Vec::new();
        translator.handle_event(InternalEvent::ToolUse { id: "t1".into(), name: "webSearch".into() }, &mut out);
        translator.handle_event(InternalEvent::ToolUseStop { id: "t1".into(), stop: true }, &mut out);
        let chunks = translator.finish(&noop_reverse);
        assert!(chunks.iter().all(|(_, v)| v["content_block"]["type"] != "tool_use"));
    }

    #[test]
    fn thinking_tag_splitter_routes_text_before_inside_and_after() {
        let mut translator = StreamTranslator::new(10, true);
        let mut out = Vec::new();
        translator.handle_event(InternalEvent::Content("before<thinking>middle</thinking>after".into()), &mut out);
        let thinking_deltas: Vec<_> = out
            .iter()
            .filter(|(name, v)| *name == "content_block_delta" && v["delta"]["type"] == "thinking_delta")
            .collect();
        let text_deltas: Vec<_> = out
            .iter()
            .filter(|(name, v)| *name == "content_block_delta" && v["delta"]["type"] == "text_delta")
            .collect();
        assert_eq!(thinking_deltas.len(), 1);
        assert_eq!(thinking_deltas[0].1["delta"]["thinking"], "middle");
        assert_eq!(text_deltas.len(), 2);
        assert_eq!(text_deltas[0].1["delta"]["text"], "before");
        assert_eq!(text_deltas[1].1["delta"]["text"], "after");
    }

    #[test]
    fn error_chunk_has_native_shape() {
        let (name, value) = StreamTranslator::error_chunk("boom");
        assert_eq!(name, "error");
        assert_eq!(value["type"], "error");
        assert_eq!(value["error"]["message"], "boom");
    }
}
