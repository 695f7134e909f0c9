//! Unary dialect conversion.
//!
//! Requests arriving on `/v1/messages` for providers that only speak Chat
//! Completions are rewritten on the way up, and their replies rewritten on
//! the way back down.

use serde_json::{Value, json};

use crate::api_types::{
    anthropic::{
        BlockSource, ContentBlockParam, KnownBlock, MessageContent, MessagesRequest,
        MessagesResponse, MessagesUsage, ResponseBlock, ToolChoiceParam,
    },
    openai::{
        ChatCompletionRequest, ChatCompletionResponse, ChatContent, ChatContentPart,
        ChatErrorBody, ChatMessage, ChatToolChoice, FilePart, FunctionCall, FunctionDefinition,
        FunctionTool, ImageUrl, NamedFunction, ToolCall,
    },
};

/// Map an OpenAI `finish_reason` to an Anthropic `stop_reason`.
pub fn map_stop_reason(finish_reason: Option<&str>) -> &'static str {
    match finish_reason {
        Some("length") => "max_tokens",
        Some("tool_calls") | Some("function_call") => "tool_use",
        // stop, content_filter, and anything unrecognized
        _ => "end_turn",
    }
}

/// Synthesize a message id when the upstream did not provide one.
pub fn synthesize_message_id() -> String {
    format!("msg_{}", chrono::Utc::now().timestamp_millis())
}

// ============================================================================
// Request: Anthropic Messages -> OpenAI Chat Completions
// ============================================================================

pub fn chat_request_from_messages(req: MessagesRequest) -> ChatCompletionRequest {
    let mut messages = Vec::with_capacity(req.messages.len() + 1);

    if let Some(system) = &req.system {
        messages.push(ChatMessage::text("system", system.flatten()));
    }

    for message in req.messages {
        convert_message(message.role, message.content, &mut messages);
    }

    ChatCompletionRequest {
        model: req.model,
        messages,
        max_tokens: req.max_tokens,
        stream: req.stream,
        temperature: req.temperature,
        top_p: req.top_p,
        stop: req.stop_sequences,
        tools: req.tools.map(|tools| {
            tools.into_iter().filter_map(convert_tool).collect::<Vec<_>>()
        }),
        tool_choice: req.tool_choice.and_then(convert_tool_choice),
        user: req.metadata.and_then(|m| m.user_id),
    }
}

/// Walk one Anthropic message into OpenAI form. Tool results become
/// separate `role: "tool"` messages appended after the main one.
fn convert_message(role: String, content: MessageContent, out: &mut Vec<ChatMessage>) {
    let blocks = match content {
        MessageContent::Text(text) => {
            out.push(ChatMessage::text(role, text));
            return;
        }
        MessageContent::Blocks(blocks) => blocks,
    };

    let mut parts: Vec<ChatContentPart> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut tool_messages: Vec<ChatMessage> = Vec::new();

    for block in blocks {
        let block = match block {
            ContentBlockParam::Known(known) => known,
            // Shape drift: unrecognized block types drop silently.
            ContentBlockParam::Unknown(_) => continue,
        };
        match block {
            KnownBlock::Text { text } => parts.push(ChatContentPart::Text { text }),
            KnownBlock::Image { source } => parts.push(ChatContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: source_url(source),
                },
            }),
            KnownBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id,
                type_: "function".to_string(),
                function: FunctionCall {
                    name,
                    arguments: serde_json::to_string(&input).unwrap_or_else(|_| "{}".to_string()),
                },
            }),
            KnownBlock::ToolResult {
                tool_use_id,
                content,
            } => tool_messages.push(ChatMessage {
                role: "tool".to_string(),
                content: ChatContent::Text(stringify_tool_result(content)),
                tool_calls: None,
                tool_call_id: Some(tool_use_id),
            }),
            KnownBlock::Document { source } => parts.push(ChatContentPart::File {
                file: match source {
                    BlockSource::Url { url } => FilePart {
                        file_url: Some(url),
                        file_data: None,
                        mime_type: None,
                    },
                    BlockSource::Base64 { media_type, data } => FilePart {
                        file_url: None,
                        file_data: Some(data),
                        mime_type: Some(media_type),
                    },
                },
            }),
        }
    }

    if !parts.is_empty() || !tool_calls.is_empty() {
        // A single text block simplifies to plain string content; a message
        // that only carries tool calls needs an empty string.
        let content = if parts.is_empty() {
            ChatContent::Text(String::new())
        } else if parts.len() == 1 && matches!(parts[0], ChatContentPart::Text { .. }) {
            match parts.pop() {
                Some(ChatContentPart::Text { text }) => ChatContent::Text(text),
                _ => unreachable!(),
            }
        } else {
            ChatContent::Parts(parts)
        };
        out.push(ChatMessage {
            role,
            content,
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            tool_call_id: None,
        });
    }

    out.extend(tool_messages);
}

fn source_url(source: BlockSource) -> String {
    match source {
        BlockSource::Url { url } => url,
        BlockSource::Base64 { media_type, data } => {
            format!("data:{media_type};base64,{data}")
        }
    }
}

fn stringify_tool_result(content: Option<Value>) -> String {
    match content {
        None => String::new(),
        Some(Value::String(s)) => s,
        Some(other) => serde_json::to_string(&other).unwrap_or_default(),
    }
}

/// Regular tools map their `input_schema` onto `function.parameters`.
/// Built-in (server) tools have a `type` but no schema; they become
/// functions named `name || type` with an empty object schema.
fn convert_tool(tool: crate::api_types::anthropic::ToolParam) -> Option<FunctionTool> {
    let crate::api_types::anthropic::ToolParam {
        name,
        type_,
        description,
        input_schema,
    } = tool;
    let name = name.or(type_)?;
    Some(FunctionTool {
        type_: "function".to_string(),
        function: FunctionDefinition {
            name,
            description,
            parameters: input_schema.unwrap_or_else(|| json!({})),
        },
    })
}

fn convert_tool_choice(choice: ToolChoiceParam) -> Option<ChatToolChoice> {
    match choice {
        ToolChoiceParam::Auto => Some(ChatToolChoice::Mode("auto".to_string())),
        ToolChoiceParam::Any => Some(ChatToolChoice::Mode("required".to_string())),
        ToolChoiceParam::Tool { name } => Some(ChatToolChoice::Named {
            type_: "function".to_string(),
            function: NamedFunction { name },
        }),
        ToolChoiceParam::None => None,
    }
}

// ============================================================================
// Response: OpenAI Chat Completions -> Anthropic Messages
// ============================================================================

pub fn messages_response_from_chat(
    response: ChatCompletionResponse,
    requested_model: &str,
) -> MessagesResponse {
    let mut content = Vec::new();
    let mut finish_reason = None;

    if let Some(choice) = response.choices.into_iter().next() {
        finish_reason = choice.finish_reason;
        if let Some(text) = choice.message.content {
            content.push(ResponseBlock::Text { text });
        }
        if let Some(tool_calls) = choice.message.tool_calls {
            for call in tool_calls {
                content.push(ResponseBlock::ToolUse {
                    id: call.id,
                    name: call.function.name,
                    input: serde_json::from_str(&call.function.arguments)
                        .unwrap_or_else(|_| json!({})),
                });
            }
        }
    }

    if content.is_empty() {
        content.push(ResponseBlock::Text {
            text: String::new(),
        });
    }

    let usage = response.usage.unwrap_or_default();
    MessagesResponse {
        id: response.id.unwrap_or_else(synthesize_message_id),
        type_: "message",
        role: "assistant",
        model: response.model.unwrap_or_else(|| requested_model.to_string()),
        content,
        stop_reason: Some(map_stop_reason(finish_reason.as_deref())),
        stop_sequence: None,
        usage: MessagesUsage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            cache_read_input_tokens: usage
                .prompt_tokens_details
                .map(|d| d.cached_tokens),
            cache_creation_input_tokens: usage
                .prompt_tokens_details
                .map(|d| d.cache_creation_input_tokens),
        },
    }
}

/// Re-wrap a non-2xx upstream body as `{error: {...}, provider}`.
pub fn messages_error_from_chat(body: &[u8], provider: &str) -> Value {
    let parsed: ChatErrorBody = serde_json::from_slice(body).unwrap_or_default();
    let detail = parsed.error.unwrap_or_default();
    json!({
        "error": {
            "message": detail.message.unwrap_or_else(|| "Upstream provider error".to_string()),
            "type": detail.type_.unwrap_or_else(|| "api_error".to_string()),
            "param": detail.param,
            "code": detail.code,
        },
        "provider": provider,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_types::openai::ChatUsage;

    fn messages_request(value: Value) -> MessagesRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn system_becomes_leading_system_message() {
        let req = messages_request(json!({
            "model": "m",
            "max_tokens": 64,
            "system": "be kind",
            "messages": [{"role": "user", "content": "hi"}],
        }));
        let chat = chat_request_from_messages(req);
        assert_eq!(chat.messages.len(), 2);
        assert_eq!(chat.messages[0].role, "system");
        assert!(matches!(&chat.messages[0].content, ChatContent::Text(t) if t == "be kind"));
        assert_eq!(chat.messages[1].role, "user");
    }

    #[test]
    fn single_text_block_simplifies_to_string() {
        let req = messages_request(json!({
            "model": "m",
            "max_tokens": 64,
            "messages": [{"role": "user", "content": [{"type": "text", "text": "hello"}]}],
        }));
        let chat = chat_request_from_messages(req);
        assert!(matches!(&chat.messages[0].content, ChatContent::Text(t) if t == "hello"));
    }

    #[test]
    fn tool_use_block_becomes_tool_call_with_empty_content() {
        let req = messages_request(json!({
            "model": "m",
            "max_tokens": 64,
            "messages": [{
                "role": "assistant",
                "content": [
                    {"type": "tool_use", "id": "c1", "name": "get_weather", "input": {"city": "NYC"}},
                ],
            }],
        }));
        let chat = chat_request_from_messages(req);
        let msg = &chat.messages[0];
        assert!(matches!(&msg.content, ChatContent::Text(t) if t.is_empty()));
        let calls = msg.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "c1");
        assert_eq!(calls[0].function.name, "get_weather");
        assert_eq!(
            serde_json::from_str::<Value>(&calls[0].function.arguments).unwrap(),
            json!({"city": "NYC"})
        );
    }

    #[test]
    fn tool_result_emits_separate_tool_message() {
        let req = messages_request(json!({
            "model": "m",
            "max_tokens": 64,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "tool_result", "tool_use_id": "c1", "content": "72F"},
                    {"type": "text", "text": "thanks"},
                ],
            }],
        }));
        let chat = chat_request_from_messages(req);
        assert_eq!(chat.messages.len(), 2);
        assert_eq!(chat.messages[0].role, "user");
        assert_eq!(chat.messages[1].role, "tool");
        assert_eq!(chat.messages[1].tool_call_id.as_deref(), Some("c1"));
        assert!(matches!(&chat.messages[1].content, ChatContent::Text(t) if t == "72F"));
    }

    #[test]
    fn image_sources_map_to_urls() {
        let req = messages_request(json!({
            "model": "m",
            "max_tokens": 64,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "image", "source": {"type": "url", "url": "https://img.example/a.png"}},
                    {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "AAAA"}},
                ],
            }],
        }));
        let chat = chat_request_from_messages(req);
        let parts = match &chat.messages[0].content {
            ChatContent::Parts(parts) => parts,
            other => panic!("expected parts, got {other:?}"),
        };
        assert!(matches!(&parts[0], ChatContentPart::ImageUrl { image_url } if image_url.url == "https://img.example/a.png"));
        assert!(matches!(&parts[1], ChatContentPart::ImageUrl { image_url } if image_url.url == "data:image/png;base64,AAAA"));
    }

    #[test]
    fn unknown_blocks_drop_silently() {
        let req = messages_request(json!({
            "model": "m",
            "max_tokens": 64,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "mystery", "payload": 1},
                    {"type": "text", "text": "still here"},
                ],
            }],
        }));
        let chat = chat_request_from_messages(req);
        assert_eq!(chat.messages.len(), 1);
        assert!(matches!(&chat.messages[0].content, ChatContent::Text(t) if t == "still here"));
    }

    #[test]
    fn builtin_tool_gets_empty_schema_and_type_name() {
        let req = messages_request(json!({
            "model": "m",
            "max_tokens": 64,
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [
                {"name": "lookup", "input_schema": {"type": "object", "properties": {"q": {"type": "string"}}}},
                {"type": "web_search_20250305"},
            ],
        }));
        let chat = chat_request_from_messages(req);
        let tools = chat.tools.unwrap();
        assert_eq!(tools[0].function.name, "lookup");
        assert_eq!(tools[0].function.parameters["properties"]["q"]["type"], "string");
        assert_eq!(tools[1].function.name, "web_search_20250305");
        assert_eq!(tools[1].function.parameters, json!({}));
    }

    #[test]
    fn tool_choice_mapping() {
        let choice = |v: Value| {
            convert_tool_choice(serde_json::from_value::<ToolChoiceParam>(v).unwrap())
        };
        assert!(matches!(
            choice(json!({"type": "auto"})),
            Some(ChatToolChoice::Mode(m)) if m == "auto"
        ));
        assert!(matches!(
            choice(json!({"type": "any"})),
            Some(ChatToolChoice::Mode(m)) if m == "required"
        ));
        assert!(matches!(
            choice(json!({"type": "tool", "name": "get_weather"})),
            Some(ChatToolChoice::Named { function, .. }) if function.name == "get_weather"
        ));
    }

    #[test]
    fn stop_sequences_and_user_metadata_carry_over() {
        let req = messages_request(json!({
            "model": "m",
            "max_tokens": 64,
            "messages": [{"role": "user", "content": "hi"}],
            "stop_sequences": ["END"],
            "metadata": {"user_id": "u-42"},
        }));
        let chat = chat_request_from_messages(req);
        assert_eq!(chat.stop.as_deref(), Some(&["END".to_string()][..]));
        assert_eq!(chat.user.as_deref(), Some("u-42"));
    }

    #[test]
    fn stop_reason_table() {
        assert_eq!(map_stop_reason(Some("stop")), "end_turn");
        assert_eq!(map_stop_reason(Some("content_filter")), "end_turn");
        assert_eq!(map_stop_reason(Some("length")), "max_tokens");
        assert_eq!(map_stop_reason(Some("tool_calls")), "tool_use");
        assert_eq!(map_stop_reason(Some("function_call")), "tool_use");
        assert_eq!(map_stop_reason(Some("weird")), "end_turn");
        assert_eq!(map_stop_reason(None), "end_turn");
    }

    #[test]
    fn tool_call_response_translates_to_tool_use() {
        let response: ChatCompletionResponse = serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "model": "gpt-x",
            "choices": [{
                "message": {
                    "tool_calls": [{
                        "id": "c1",
                        "type": "function",
                        "function": {"name": "get_weather", "arguments": "{\"city\":\"NYC\"}"},
                    }],
                },
                "finish_reason": "tool_calls",
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 7},
        }))
        .unwrap();
        let anthropic = messages_response_from_chat(response, "req-model");
        assert_eq!(anthropic.stop_reason, Some("tool_use"));
        assert_eq!(anthropic.content.len(), 1);
        assert_eq!(
            anthropic.content[0],
            ResponseBlock::ToolUse {
                id: "c1".to_string(),
                name: "get_weather".to_string(),
                input: json!({"city": "NYC"}),
            }
        );
        assert_eq!(anthropic.usage.input_tokens, 12);
        assert_eq!(anthropic.usage.output_tokens, 7);
    }

    #[test]
    fn empty_choice_yields_single_empty_text_block() {
        let response: ChatCompletionResponse =
            serde_json::from_value(json!({"choices": [{"message": {}}]})).unwrap();
        let anthropic = messages_response_from_chat(response, "m");
        assert_eq!(
            anthropic.content,
            vec![ResponseBlock::Text {
                text: String::new()
            }]
        );
        assert!(anthropic.id.starts_with("msg_"));
        assert_eq!(anthropic.model, "m");
    }

    #[test]
    fn unparseable_arguments_fall_back_to_empty_object() {
        let response: ChatCompletionResponse = serde_json::from_value(json!({
            "choices": [{
                "message": {
                    "tool_calls": [{
                        "id": "c1",
                        "type": "function",
                        "function": {"name": "f", "arguments": "not json"},
                    }],
                },
            }],
        }))
        .unwrap();
        let anthropic = messages_response_from_chat(response, "m");
        assert_eq!(
            anthropic.content[0],
            ResponseBlock::ToolUse {
                id: "c1".to_string(),
                name: "f".to_string(),
                input: json!({}),
            }
        );
    }

    #[test]
    fn usage_cache_fields_pass_through() {
        let usage: ChatUsage = serde_json::from_value(json!({
            "prompt_tokens": 100,
            "completion_tokens": 20,
            "prompt_tokens_details": {"cached_tokens": 80, "cache_creation_input_tokens": 5},
        }))
        .unwrap();
        let response = ChatCompletionResponse {
            id: Some("id".to_string()),
            model: None,
            choices: vec![],
            usage: Some(usage),
        };
        let anthropic = messages_response_from_chat(response, "m");
        assert_eq!(anthropic.usage.cache_read_input_tokens, Some(80));
        assert_eq!(anthropic.usage.cache_creation_input_tokens, Some(5));
    }

    #[test]
    fn upstream_error_rewraps_with_provider() {
        let body = br#"{"error": {"message": "model overloaded", "type": "overloaded_error", "code": 529}}"#;
        let wrapped = messages_error_from_chat(body, "openrouter");
        assert_eq!(wrapped["error"]["message"], "model overloaded");
        assert_eq!(wrapped["error"]["type"], "overloaded_error");
        assert_eq!(wrapped["error"]["code"], 529);
        assert_eq!(wrapped["provider"], "openrouter");

        let defaulted = messages_error_from_chat(b"not json at all", "azure");
        assert_eq!(defaulted["error"]["message"], "Upstream provider error");
        assert_eq!(defaulted["error"]["type"], "api_error");
    }
}
