//! AWS binary event-stream codec (C1, §4.1).
//!
//! Parses the `application/vnd.amazon.eventstream` framing CodeWhisperer uses
//! for `generateAssistantResponse`: a 12-byte prelude, a headers region, a
//! UTF-8 JSON payload, and a trailing 4-byte message checksum. Checksums are
//! present on the wire but this codec does not validate them — §4.1 treats
//! the total-length field as the only boundary signal that matters.

use serde::Deserialize;
use serde_json::Value;

const PRELUDE_LEN: usize = 12;
const TRAILING_CHECKSUM_LEN: usize = 4;

/// One parsed frame, still in upstream vocabulary (`:event-type` header plus
/// raw JSON payload) — the mapping into [`InternalEvent`] happens separately
/// so the two failure modes (framing vs. payload shape) stay distinguishable.
/// `payload` is `None` when the bytes weren't valid UTF-8/JSON: framing is
/// still sound (the length fields checked out), so this is a skip-and-log
/// case, not a terminal one.
#[derive(Debug, Clone)]
pub struct Message {
    pub event_type: Option<String>,
    pub payload: Option<Value>,
}

/// Result of parsing one frame out of a buffer.
pub enum ParseOutcome {
    Parsed { message: Message, next_offset: usize },
    NeedMore,
    Malformed(String),
}

/// Parse a single frame starting at `offset`. Never skips ahead on a bad
/// frame: the length prefix is the only thing that tells us where the next
/// frame starts, so a malformed frame poisons the rest of the buffer.
pub fn parse_one(buf: &[u8], offset: usize) -> ParseOutcome {
    let remaining = &buf[offset..];
    if remaining.len() < PRELUDE_LEN {
        return ParseOutcome::NeedMore;
    }

    let total_len = u32::from_be_bytes(remaining[0..4].try_into().unwrap()) as usize;
    let headers_len = u32::from_be_bytes(remaining[4..8].try_into().unwrap()) as usize;
    // remaining[8..12] is the prelude checksum; not validated.

    if total_len < PRELUDE_LEN + TRAILING_CHECKSUM_LEN {
        return ParseOutcome::Malformed(format!("frame total_length {total_len} too small"));
    }
    if remaining.len() < total_len {
        return ParseOutcome::NeedMore;
    }

    let headers_region = &remaining[PRELUDE_LEN..];
    if headers_len > headers_region.len() {
        return ParseOutcome::Malformed("headers_length exceeds frame".into());
    }

    let headers = match parse_headers(&headers_region[..headers_len]) {
        Ok(h) => h,
        Err(e) => return ParseOutcome::Malformed(e),
    };

    let payload_start = PRELUDE_LEN + headers_len;
    let payload_end = total_len - TRAILING_CHECKSUM_LEN;
    if payload_end < payload_start {
        return ParseOutcome::Malformed("payload region has negative length".into());
    }
    let payload_bytes = &remaining[payload_start..payload_end];

    // Framing is sound once we get here — a bad payload is this one event's
    // problem, not the stream's, so it degrades to `None` instead of
    // aborting the parse (§4.1: "never fail the stream on one bad frame's
    // JSON — log and continue").
    let payload = std::str::from_utf8(payload_bytes)
        .ok()
        .filter(|s| !s.is_empty())
        .and_then(|s| serde_json::from_str(s).ok());

    let event_type = headers
        .into_iter()
        .find(|(name, _)| name == ":event-type")
        .map(|(_, value)| value);

    ParseOutcome::Parsed {
        message: Message { event_type, payload },
        next_offset: offset + total_len,
    }
}

/// Headers are `{name_len: u8, name, value_type: u8, value}` repeated until
/// the region is exhausted, where `value`'s own length depends on
/// `value_type` (fixed-width for bool/byte/short/int/long/timestamp/uuid,
/// `u16be`-length-prefixed for byte-array/string). Only `value_type == 7`
/// (string) is recognized by anything in §4.1's mapping table; other known
/// types are skipped (their bytes consumed so later headers stay aligned,
/// the value itself dropped) rather than failing the frame.
fn parse_headers(region: &[u8]) -> Result<Vec<(String, String)>, String> {
    let mut out = Vec::new();
    let mut pos = 0usize;

    while pos < region.len() {
        if pos + 1 > region.len() {
            return Err("truncated header name length".into());
        }
        let name_len = region[pos] as usize;
        pos += 1;

        if pos + name_len > region.len() {
            return Err("truncated header name".into());
        }
        let name = String::from_utf8_lossy(&region[pos..pos + name_len]).into_owned();
        pos += name_len;

        if pos + 1 > region.len() {
            return Err("truncated header value type".into());
        }
        let value_type = region[pos];
        pos += 1;

        // AWS event-stream header value types: 0/1 bool, 2 byte, 3 short,
        // 4 int, 5 long, 6 byte-array (length-prefixed), 7 string
        // (length-prefixed), 8 timestamp (int64), 9 uuid (16 bytes).
        let fixed_width = match value_type {
            0 | 1 => Some(0),
            2 => Some(1),
            3 => Some(2),
            4 => Some(4),
            5 | 8 => Some(8),
            9 => Some(16),
            _ => None,
        };

        if let Some(width) = fixed_width {
            if pos + width > region.len() {
                return Err("truncated fixed-width header value".into());
            }
            pos += width;
            continue;
        }

        if value_type != 6 && value_type != 7 {
            return Err(format!("unrecognized header value type {value_type}"));
        }

        if pos + 2 > region.len() {
            return Err("truncated header value length".into());
        }
        let value_len = u16::from_be_bytes(region[pos..pos + 2].try_into().unwrap()) as usize;
        pos += 2;

        if pos + value_len > region.len() {
            return Err("truncated header value".into());
        }
        if value_type == 7 {
            let value = String::from_utf8_lossy(&region[pos..pos + value_len]).into_owned();
            out.push((name, value));
        }
        pos += value_len;
    }

    Ok(out)
}

/// Internal event emitted toward C3 (§3 "Internal event").
#[derive(Debug, Clone, PartialEq)]
pub enum InternalEvent {
    Content(String),
    Thinking(String),
    ToolUse { id: String, name: String },
    ToolUseInput { id: String, partial_json: String },
    ToolUseStop { id: String, stop: bool },
    Metering { units: f64 },
    Followup(String),
    CodeReference(Vec<Value>),
    Metadata { conversation_id: String },
}

#[derive(Deserialize, Default)]
struct ToolUsePayload {
    #[serde(rename = "toolUseId")]
    tool_use_id: Option<String>,
    name: Option<String>,
    input: Option<Value>,
    stop: Option<bool>,
}

/// Incremental buffer-to-events parser. Holds back the tail of an incomplete
/// final frame so callers can feed bytes as they arrive from the network.
#[derive(Default)]
pub struct StreamCodec {
    buf: Vec<u8>,
}

impl StreamCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append newly-received bytes and drain as many complete frames as
    /// possible, mapped to internal events. A malformed frame is terminal:
    /// returns `Err` and the codec should not be fed further.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<InternalEvent>, String> {
        self.buf.extend_from_slice(bytes);

        let mut events = Vec::new();
        let mut offset = 0usize;

        loop {
            match parse_one(&self.buf, offset) {
                ParseOutcome::Parsed { message, next_offset } => {
                    map_message(&message, &mut events);
                    offset = next_offset;
                }
                ParseOutcome::NeedMore => break,
                ParseOutcome::Malformed(reason) => return Err(reason),
            }
        }

        self.buf.drain(..offset);
        Ok(events)
    }
}

/// §4.1's upstream-type → internal-event table. A frame whose JSON payload
/// doesn't match the expected shape for its `:event-type` is dropped with a
/// warning rather than failing the whole stream.
fn map_message(message: &Message, out: &mut Vec<InternalEvent>) {
    let Some(event_type) = message.event_type.as_deref() else {
        return;
    };
    let Some(payload) = message.payload.as_ref() else {
        tracing::warn!(event_type, "frame payload was not valid JSON, skipping");
        return;
    };

    match event_type {
        "assistantResponseEvent" => {
            if let Some(content) = payload.get("content").and_then(Value::as_str) {
                out.push(InternalEvent::Content(content.to_string()));
            }
        }
        "toolUseEvent" => match serde_json::from_value::<ToolUsePayload>(payload.clone()) {
            Ok(p) => {
                let Some(id) = p.tool_use_id else {
                    tracing::warn!("toolUseEvent missing toolUseId, dropping");
                    return;
                };
                if let Some(name) = p.name {
                    out.push(InternalEvent::ToolUse { id: id.clone(), name });
                }
                if let Some(input) = p.input {
                    let partial_json = if input.is_string() {
                        input.as_str().unwrap_or_default().to_string()
                    } else {
                        input.to_string()
                    };
                    out.push(InternalEvent::ToolUseInput { id: id.clone(), partial_json });
                }
                if p.stop == Some(true) {
                    out.push(InternalEvent::ToolUseStop { id, stop: true });
                }
            }
            Err(e) => tracing::warn!(err = %e, "malformed toolUseEvent payload, skipping"),
        },
        "meteringEvent" => {
            if let Some(units) = payload.get("usage").and_then(Value::as_f64) {
                out.push(InternalEvent::Metering { units });
            }
        }
        "reasoningContentEvent" => {
            let text = payload
                .get("text")
                .or_else(|| payload.get("reasoningText"))
                .and_then(Value::as_str);
            if let Some(text) = text {
                out.push(InternalEvent::Thinking(text.to_string()));
            }
        }
        "followupPromptEvent" => {
            if let Some(prompt) = payload.get("followupPrompt").and_then(Value::as_str) {
                out.push(InternalEvent::Followup(prompt.to_string()));
            }
        }
        "codeReferenceEvent" => {
            if let Some(refs) = payload.get("references").and_then(Value::as_array) {
                if !refs.is_empty() {
                    out.push(InternalEvent::CodeReference(refs.clone()));
                }
            }
        }
        "messageMetadataEvent" => {
            if let Some(cid) = payload.get("conversationId").and_then(Value::as_str) {
                out.push(InternalEvent::Metadata { conversation_id: cid.to_string() });
            }
        }
        other => {
            tracing::debug!(event_type = other, "unrecognized event type, skipping");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_frame(event_type: &str, payload_json: &str) -> Vec<u8> {
        let mut headers = Vec::new();
        let name = ":event-type";
        headers.push(name.len() as u8);
        headers.extend_from_slice(name.as_bytes());
        headers.push(7u8); // string type
        headers.extend_from_slice(&(event_type.len() as u16).to_be_bytes());
        headers.extend_from_slice(event_type.as_bytes());

        let payload = payload_json.as_bytes();
        let total_len = PRELUDE_LEN + headers.len() + payload.len() + TRAILING_CHECKSUM_LEN;

        let mut frame = Vec::new();
        frame.extend_from_slice(&(total_len as u32).to_be_bytes());
        frame.extend_from_slice(&(headers.len() as u32).to_be_bytes());
        frame.extend_from_slice(&0u32.to_be_bytes()); // prelude checksum, unchecked
        frame.extend_from_slice(&headers);
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&0u32.to_be_bytes()); // message checksum, unchecked

        frame
    }

    #[test]
    fn parses_content_event() {
        let frame = build_frame("assistantResponseEvent", r#"{"content":"hello"}"#);
        let mut codec = StreamCodec::new();
        let events = codec.push(&frame).unwrap();
        assert_eq!(events, vec![InternalEvent::Content("hello".into())]);
    }

    #[test]
    fn incomplete_frame_waits_for_more_bytes() {
        let frame = build_frame("assistantResponseEvent", r#"{"content":"hello"}"#);
        let mut codec = StreamCodec::new();
        let events = codec.push(&frame[..frame.len() - 3]).unwrap();
        assert!(events.is_empty());

        let events = codec.push(&frame[frame.len() - 3..]).unwrap();
        assert_eq!(events, vec![InternalEvent::Content("hello".into())]);
    }

    #[test]
    fn splitting_at_every_byte_boundary_yields_the_same_events_as_one_shot() {
        let mut frames = Vec::new();
        frames.extend(build_frame("assistantResponseEvent", r#"{"content":"a"}"#));
        frames.extend(build_frame(
            "toolUseEvent",
            r#"{"toolUseId":"t1","name":"bash","input":"{\"cmd\":\"ls\"}","stop":true}"#,
        ));
        frames.extend(build_frame("meteringEvent", r#"{"usage":2.5}"#));

        let mut one_shot = StreamCodec::new();
        let whole = one_shot.push(&frames).unwrap();

        let mut incremental = StreamCodec::new();
        let mut piecewise = Vec::new();
        for byte in &frames {
            piecewise.extend(incremental.push(std::slice::from_ref(byte)).unwrap());
        }

        assert_eq!(whole, piecewise);
    }

    #[test]
    fn tool_use_event_emits_use_then_input_then_stop() {
        let frame = build_frame(
            "toolUseEvent",
            r#"{"toolUseId":"t1","name":"bash","input":"{\"cmd\":\"ls\"}","stop":true}"#,
        );
        let mut codec = StreamCodec::new();
        let events = codec.push(&frame).unwrap();
        assert_eq!(
            events,
            vec![
                InternalEvent::ToolUse { id: "t1".into(), name: "bash".into() },
                InternalEvent::ToolUseInput {
                    id: "t1".into(),
                    partial_json: r#"{"cmd":"ls"}"#.into()
                },
                InternalEvent::ToolUseStop { id: "t1".into(), stop: true },
            ]
        );
    }

    #[test]
    fn malformed_length_is_terminal() {
        let mut frame = build_frame("assistantResponseEvent", r#"{"content":"x"}"#);
        frame[0..4].copy_from_slice(&4u32.to_be_bytes()); // total_length too small
        let mut codec = StreamCodec::new();
        assert!(codec.push(&frame).is_err());
    }

    #[test]
    fn non_string_header_value_is_skipped_not_fatal() {
        // A `:content-type` header of int type (4) ahead of the usual
        // `:event-type` string header. The int's 4 value bytes must be
        // skipped without throwing off the rest of the header region.
        let mut headers = Vec::new();
        let ct_name = ":content-type";
        headers.push(ct_name.len() as u8);
        headers.extend_from_slice(ct_name.as_bytes());
        headers.push(4u8); // int type
        headers.extend_from_slice(&42i32.to_be_bytes());

        let event_name = ":event-type";
        headers.push(event_name.len() as u8);
        headers.extend_from_slice(event_name.as_bytes());
        headers.push(7u8); // string type
        let event_type = "assistantResponseEvent";
        headers.extend_from_slice(&(event_type.len() as u16).to_be_bytes());
        headers.extend_from_slice(event_type.as_bytes());

        let payload = br#"{"content":"hi"}"#;
        let total_len = PRELUDE_LEN + headers.len() + payload.len() + TRAILING_CHECKSUM_LEN;

        let mut frame = Vec::new();
        frame.extend_from_slice(&(total_len as u32).to_be_bytes());
        frame.extend_from_slice(&(headers.len() as u32).to_be_bytes());
        frame.extend_from_slice(&0u32.to_be_bytes());
        frame.extend_from_slice(&headers);
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&0u32.to_be_bytes());

        let mut codec = StreamCodec::new();
        let events = codec.push(&frame).unwrap();
        assert_eq!(events, vec![InternalEvent::Content("hi".into())]);
    }

    #[test]
    fn unknown_event_type_is_skipped_not_fatal() {
        let frame = build_frame("someFutureEvent", r#"{"foo":"bar"}"#);
        let mut codec = StreamCodec::new();
        let events = codec.push(&frame).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn malformed_payload_json_in_one_frame_does_not_fail_stream() {
        let mut both = build_frame("assistantResponseEvent", "not json");
        both.extend(build_frame("assistantResponseEvent", r#"{"content":"ok"}"#));
        let mut codec = StreamCodec::new();
        let events = codec.push(&both).unwrap();
        assert_eq!(events, vec![InternalEvent::Content("ok".into())]);
    }

    proptest::proptest! {
        /// Feeding a run of well-formed frames one byte at a time must yield
        /// the same events as feeding the whole buffer in one `push`,
        /// regardless of how many frames or how long each `content` string is.
        #[test]
        fn incremental_push_matches_one_shot_push(
            contents in proptest::collection::vec("[a-zA-Z0-9 ]{0,40}", 0..12)
        ) {
            let mut frames = Vec::new();
            for content in &contents {
                let payload = serde_json::json!({ "content": content }).to_string();
                frames.extend(build_frame("assistantResponseEvent", &payload));
            }

            let mut one_shot = StreamCodec::new();
            let whole = one_shot.push(&frames).unwrap();

            let mut incremental = StreamCodec::new();
            let mut piecewise = Vec::new();
            for byte in &frames {
                piecewise.extend(incremental.push(std::slice::from_ref(byte)).unwrap());
            }

            proptest::prop_assert_eq!(whole, piecewise);
        }
    }
}
