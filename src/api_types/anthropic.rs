//! Anthropic Messages wire types.
//!
//! Request shapes callers POST to `/v1/messages`, the response shape the
//! bridge assembles from OpenAI replies, and the streaming event shapes it
//! emits. Unknown content-block types deserialize into
//! [`ContentBlockParam::Unknown`] and are dropped during conversion rather
//! than failing the request.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Request Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    pub messages: Vec<MessageParam>,
    pub max_tokens: u32,
    #[serde(default)]
    pub system: Option<SystemPrompt>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    pub tools: Option<Vec<ToolParam>>,
    #[serde(default)]
    pub tool_choice: Option<ToolChoiceParam>,
    #[serde(default)]
    pub metadata: Option<RequestMetadata>,
}

/// `system` is either a plain string or an array of text blocks.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<SystemBlock>),
}

#[derive(Debug, Deserialize)]
pub struct SystemBlock {
    #[serde(rename = "type")]
    #[allow(dead_code)] // Deserialization field
    pub type_: String,
    #[serde(default)]
    pub text: String,
}

impl SystemPrompt {
    /// Flatten to a single string, joining blocks with newlines.
    pub fn flatten(&self) -> String {
        match self {
            SystemPrompt::Text(s) => s.clone(),
            SystemPrompt::Blocks(blocks) => blocks
                .iter()
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MessageParam {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlockParam>),
}

/// A content block as received on the wire. Blocks with an unrecognized
/// `type` land in `Unknown` so shape drift never fails admission.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ContentBlockParam {
    Known(KnownBlock),
    Unknown(Value),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KnownBlock {
    Text {
        text: String,
    },
    Image {
        source: BlockSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Option<Value>,
    },
    Document {
        source: BlockSource,
    },
}

/// Source for image and document blocks: inline base64 or a URL.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockSource {
    Base64 {
        media_type: String,
        data: String,
    },
    Url {
        url: String,
    },
}

#[derive(Debug, Deserialize)]
pub struct ToolParam {
    #[serde(default)]
    pub name: Option<String>,
    /// Present on built-in (server) tools, which carry no `input_schema`.
    #[serde(rename = "type", default)]
    pub type_: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoiceParam {
    Auto,
    Any,
    Tool { name: String },
    None,
}

#[derive(Debug, Deserialize)]
pub struct RequestMetadata {
    #[serde(default)]
    pub user_id: Option<String>,
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct MessagesResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: &'static str,
    pub role: &'static str,
    pub model: String,
    pub content: Vec<ResponseBlock>,
    pub stop_reason: Option<&'static str>,
    pub stop_sequence: Option<String>,
    pub usage: MessagesUsage,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
}

#[derive(Debug, Default, Serialize, PartialEq)]
pub struct MessagesUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<i64>,
}

// ============================================================================
// Streaming Event Types
// ============================================================================

/// Events emitted by the streaming bridge, framed as
/// `event: <name>\ndata: <json>\n\n`.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message: StreamMessageStub,
    },
    ContentBlockStart {
        index: usize,
        content_block: StreamContentBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: StreamDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: StreamMessageDelta,
        usage: MessagesUsage,
    },
    MessageStop,
}

impl StreamEvent {
    /// SSE event name matching the tagged `type` field.
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::MessageStart { .. } => "message_start",
            StreamEvent::ContentBlockStart { .. } => "content_block_start",
            StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            StreamEvent::ContentBlockStop { .. } => "content_block_stop",
            StreamEvent::MessageDelta { .. } => "message_delta",
            StreamEvent::MessageStop => "message_stop",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StreamMessageStub {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: &'static str,
    pub role: &'static str,
    pub model: String,
    pub content: Vec<ResponseBlock>,
    pub stop_reason: Option<&'static str>,
    pub usage: MessagesUsage,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamContentBlock {
    Text { text: &'static str },
    ToolUse { id: String, name: String, input: Value },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Serialize)]
pub struct StreamMessageDelta {
    pub stop_reason: &'static str,
    pub stop_sequence: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_block_type_deserializes_as_unknown() {
        let raw = serde_json::json!([
            {"type": "text", "text": "hi"},
            {"type": "server_tool_use_result", "payload": {"x": 1}},
        ]);
        let blocks: Vec<ContentBlockParam> = serde_json::from_value(raw).unwrap();
        assert!(matches!(
            blocks[0],
            ContentBlockParam::Known(KnownBlock::Text { .. })
        ));
        assert!(matches!(blocks[1], ContentBlockParam::Unknown(_)));
    }

    #[test]
    fn system_prompt_accepts_string_and_blocks() {
        let s: SystemPrompt = serde_json::from_value(serde_json::json!("be terse")).unwrap();
        assert_eq!(s.flatten(), "be terse");

        let b: SystemPrompt = serde_json::from_value(serde_json::json!([
            {"type": "text", "text": "a"},
            {"type": "text", "text": "b"},
        ]))
        .unwrap();
        assert_eq!(b.flatten(), "a\nb");
    }

    #[test]
    fn stream_event_names_match_tag() {
        let ev = StreamEvent::MessageStop;
        assert_eq!(ev.name(), "message_stop");
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "message_stop");
    }
}
