//! Streaming dialect bridge: OpenAI SSE in, Anthropic SSE out.
//!
//! One instance lives for one stream and is its only writer. The `[DONE]`
//! sentinel and a premature EOF are equivalent terminators: both produce
//! the closing `content_block_stop* / message_delta / message_stop`
//! sequence so Anthropic clients never hang on a dropped upstream.

use std::{
    collections::BTreeMap,
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures_util::Stream;

use super::convert::{map_stop_reason, synthesize_message_id};
use crate::api_types::{
    anthropic::{
        MessagesUsage, StreamContentBlock, StreamDelta, StreamEvent, StreamMessageDelta,
        StreamMessageStub,
    },
    openai::ChatCompletionChunk,
};

#[derive(Debug, Default)]
struct BridgeState {
    message_id: String,
    model: String,
    has_started: bool,
    /// A text block is open at `current_content_index`.
    content_block_started: bool,
    current_content_index: usize,
    /// OpenAI tool-call index -> Anthropic content index, for every
    /// tool block we have started.
    started_tools: BTreeMap<u32, usize>,
    last_finish_reason: Option<String>,
    input_tokens: i64,
    output_tokens: i64,
    /// Carry for a line split across chunks.
    buffer: String,
}

pub struct MessagesStreamBridge<S> {
    inner: S,
    state: BridgeState,
    /// Events framed and ready to yield.
    output: Vec<Bytes>,
    /// Terminal sequence has been emitted; later input is ignored.
    closed: bool,
}

impl<S> MessagesStreamBridge<S> {
    pub fn new(inner: S, requested_model: &str) -> Self {
        Self {
            inner,
            state: BridgeState {
                model: requested_model.to_string(),
                ..BridgeState::default()
            },
            output: Vec::new(),
            closed: false,
        }
    }

    fn emit(&mut self, event: &StreamEvent) {
        let data = match serde_json::to_string(event) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize bridge event");
                return;
            }
        };
        let frame = format!("event: {}\ndata: {}\n\n", event.name(), data);
        self.output.push(Bytes::from(frame));
    }

    fn process_chunk(&mut self, chunk: &[u8]) {
        self.state.buffer.push_str(&String::from_utf8_lossy(chunk));
        while let Some(newline) = self.state.buffer.find('\n') {
            let line = self.state.buffer[..newline].trim_end_matches('\r').to_string();
            self.state.buffer.drain(..=newline);
            self.process_line(&line);
            if self.closed {
                return;
            }
        }
    }

    fn process_line(&mut self, line: &str) {
        let Some(payload) = line.strip_prefix("data: ") else {
            // event: lines, comments, blanks
            return;
        };
        let payload = payload.trim();
        if payload.is_empty() {
            return;
        }
        if payload == "[DONE]" {
            self.close();
            return;
        }
        match serde_json::from_str::<ChatCompletionChunk>(payload) {
            Ok(parsed) => self.handle_parsed(parsed),
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unparseable upstream chunk");
            }
        }
    }

    fn handle_parsed(&mut self, chunk: ChatCompletionChunk) {
        if !self.state.has_started {
            self.state.has_started = true;
            if let Some(id) = chunk.id.clone() {
                self.state.message_id = id;
            } else {
                self.state.message_id = synthesize_message_id();
            }
            if let Some(model) = chunk.model.clone() {
                self.state.model = model;
            }
            self.emit(&StreamEvent::MessageStart {
                message: StreamMessageStub {
                    id: self.state.message_id.clone(),
                    type_: "message",
                    role: "assistant",
                    model: self.state.model.clone(),
                    content: Vec::new(),
                    stop_reason: None,
                    usage: MessagesUsage::default(),
                },
            });
        }

        // Any usage replaces the running totals; the terminal chunk wins.
        if let Some(usage) = chunk.usage {
            self.state.input_tokens = usage.prompt_tokens;
            self.state.output_tokens = usage.completion_tokens;
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return;
        };

        if let Some(tool_calls) = choice.delta.tool_calls {
            for call in tool_calls {
                let is_new = call.id.is_some()
                    && call.function.as_ref().is_some_and(|f| f.name.is_some())
                    && !self.state.started_tools.contains_key(&call.index);
                if is_new {
                    if self.state.content_block_started {
                        self.emit(&StreamEvent::ContentBlockStop {
                            index: self.state.current_content_index,
                        });
                        self.state.content_block_started = false;
                    }
                    let index =
                        self.state.current_content_index + 1 + call.index as usize;
                    self.state.started_tools.insert(call.index, index);
                    let function = call.function.as_ref();
                    self.emit(&StreamEvent::ContentBlockStart {
                        index,
                        content_block: StreamContentBlock::ToolUse {
                            id: call.id.clone().unwrap_or_default(),
                            name: function
                                .and_then(|f| f.name.clone())
                                .unwrap_or_default(),
                            input: serde_json::json!({}),
                        },
                    });
                }
                if let Some(arguments) =
                    call.function.and_then(|f| f.arguments).filter(|a| !a.is_empty())
                    && let Some(&index) = self.state.started_tools.get(&call.index)
                {
                    self.emit(&StreamEvent::ContentBlockDelta {
                        index,
                        delta: StreamDelta::InputJsonDelta {
                            partial_json: arguments,
                        },
                    });
                }
            }
        }

        if let Some(text) = choice.delta.content {
            if !self.state.content_block_started {
                self.emit(&StreamEvent::ContentBlockStart {
                    index: self.state.current_content_index,
                    content_block: StreamContentBlock::Text { text: "" },
                });
                self.state.content_block_started = true;
            }
            self.emit(&StreamEvent::ContentBlockDelta {
                index: self.state.current_content_index,
                delta: StreamDelta::TextDelta { text },
            });
        }

        if let Some(reason) = choice.finish_reason {
            self.state.last_finish_reason = Some(reason);
        }
    }

    /// Emit the terminal event sequence. Called for `[DONE]` and for EOF
    /// alike; idempotent.
    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if !self.state.has_started {
            // Upstream died before its first chunk; synthesize enough for
            // the client to terminate cleanly.
            self.state.message_id = synthesize_message_id();
            self.emit(&StreamEvent::MessageStart {
                message: StreamMessageStub {
                    id: self.state.message_id.clone(),
                    type_: "message",
                    role: "assistant",
                    model: self.state.model.clone(),
                    content: Vec::new(),
                    stop_reason: None,
                    usage: MessagesUsage::default(),
                },
            });
        }

        if self.state.content_block_started {
            self.emit(&StreamEvent::ContentBlockStop {
                index: self.state.current_content_index,
            });
            self.state.content_block_started = false;
        }
        let tool_indices: Vec<usize> = self.state.started_tools.values().copied().collect();
        for index in tool_indices {
            self.emit(&StreamEvent::ContentBlockStop { index });
        }

        let stop_reason = map_stop_reason(self.state.last_finish_reason.as_deref());
        self.emit(&StreamEvent::MessageDelta {
            delta: StreamMessageDelta {
                stop_reason,
                stop_sequence: None,
            },
            usage: MessagesUsage {
                input_tokens: self.state.input_tokens,
                output_tokens: self.state.output_tokens,
                cache_read_input_tokens: None,
                cache_creation_input_tokens: None,
            },
        });
        self.emit(&StreamEvent::MessageStop);
    }
}

impl<S, E> Stream for MessagesStreamBridge<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    type Item = Result<Bytes, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if !self.output.is_empty() {
                let frame = self.output.remove(0);
                return Poll::Ready(Some(Ok(frame)));
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    if !self.closed {
                        self.process_chunk(&chunk);
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    // An upstream transport error mid-stream is an EOF for
                    // the client's purposes; close out rather than hang.
                    tracing::warn!(error = %e, "Upstream stream failed mid-flight");
                    self.close();
                }
                Poll::Ready(None) => {
                    if !self.closed {
                        self.close();
                        continue;
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::{StreamExt, stream};
    use serde_json::Value;

    use super::*;

    fn sse(json: Value) -> Result<Bytes, io::Error> {
        Ok(Bytes::from(format!("data: {json}\n\n")))
    }

    fn done() -> Result<Bytes, io::Error> {
        Ok(Bytes::from("data: [DONE]\n\n"))
    }

    /// Collect (event_name, data) pairs from the bridge output.
    async fn run(chunks: Vec<Result<Bytes, io::Error>>) -> Vec<(String, Value)> {
        let bridge = MessagesStreamBridge::new(stream::iter(chunks), "req-model");
        let frames: Vec<_> = bridge.collect().await;
        let mut events = Vec::new();
        for frame in frames {
            let frame = frame.unwrap();
            let text = std::str::from_utf8(&frame).unwrap();
            let mut name = String::new();
            let mut data = Value::Null;
            for line in text.lines() {
                if let Some(n) = line.strip_prefix("event: ") {
                    name = n.to_string();
                } else if let Some(d) = line.strip_prefix("data: ") {
                    data = serde_json::from_str(d).unwrap();
                }
            }
            events.push((name, data));
        }
        events
    }

    fn text_chunk(text: &str) -> Result<Bytes, io::Error> {
        sse(serde_json::json!({
            "id": "chatcmpl-1",
            "model": "gpt-x",
            "choices": [{"delta": {"content": text}}],
        }))
    }

    #[tokio::test]
    async fn text_stream_event_order() {
        let events = run(vec![
            text_chunk("He"),
            text_chunk("llo"),
            sse(serde_json::json!({
                "choices": [{"delta": {}, "finish_reason": "stop"}],
            })),
            done(),
        ])
        .await;

        let names: Vec<&str> = events.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        assert_eq!(events[0].1["message"]["id"], "chatcmpl-1");
        assert_eq!(events[0].1["message"]["usage"]["output_tokens"], 0);
        assert_eq!(events[1].1["index"], 0);
        assert_eq!(events[1].1["content_block"]["type"], "text");
        assert_eq!(events[2].1["delta"]["text"], "He");
        assert_eq!(events[3].1["delta"]["text"], "llo");
        assert_eq!(events[4].1["index"], 0);
        assert_eq!(events[5].1["delta"]["stop_reason"], "end_turn");
    }

    #[tokio::test]
    async fn eof_without_done_still_terminates() {
        let events = run(vec![text_chunk("partial")]).await;
        let names: Vec<&str> = events.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
    }

    #[tokio::test]
    async fn empty_stream_still_sends_message_stop() {
        let events = run(vec![]).await;
        let names: Vec<&str> = events.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["message_start", "message_delta", "message_stop"]);
        assert!(
            events[0].1["message"]["id"]
                .as_str()
                .unwrap()
                .starts_with("msg_")
        );
        assert_eq!(events[0].1["message"]["model"], "req-model");
    }

    #[tokio::test]
    async fn tool_call_stream_closes_text_and_indexes_after_it() {
        let events = run(vec![
            text_chunk("thinking"),
            sse(serde_json::json!({
                "choices": [{"delta": {"tool_calls": [{
                    "index": 0,
                    "id": "call_1",
                    "function": {"name": "get_weather", "arguments": ""},
                }]}}],
            })),
            sse(serde_json::json!({
                "choices": [{"delta": {"tool_calls": [{
                    "index": 0,
                    "function": {"arguments": "{\"city\":"},
                }]}}],
            })),
            sse(serde_json::json!({
                "choices": [{"delta": {"tool_calls": [{
                    "index": 0,
                    "function": {"arguments": "\"NYC\"}"},
                }]}}],
            })),
            sse(serde_json::json!({
                "choices": [{"delta": {}, "finish_reason": "tool_calls"}],
            })),
            done(),
        ])
        .await;

        let names: Vec<&str> = events.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start", // text at 0
                "content_block_delta",
                "content_block_stop", // text closed when the tool starts
                "content_block_start", // tool_use at 1
                "content_block_delta",
                "content_block_delta",
                "content_block_stop", // tool block
                "message_delta",
                "message_stop",
            ]
        );
        assert_eq!(events[4].1["index"], 1);
        assert_eq!(events[4].1["content_block"]["type"], "tool_use");
        assert_eq!(events[4].1["content_block"]["id"], "call_1");
        assert_eq!(events[4].1["content_block"]["name"], "get_weather");
        assert_eq!(events[5].1["delta"]["type"], "input_json_delta");
        assert_eq!(events[5].1["delta"]["partial_json"], "{\"city\":");
        assert_eq!(events[7].1["index"], 1);
        let (_, message_delta) = &events[8];
        assert_eq!(message_delta["delta"]["stop_reason"], "tool_use");
    }

    #[tokio::test]
    async fn usage_is_last_wins_into_message_delta() {
        let events = run(vec![
            text_chunk("hi"),
            sse(serde_json::json!({
                "choices": [{"delta": {}}],
                "usage": {"prompt_tokens": 5, "completion_tokens": 1},
            })),
            sse(serde_json::json!({
                "choices": [{"delta": {}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 5, "completion_tokens": 9},
            })),
            done(),
        ])
        .await;
        let (_, message_delta) = events
            .iter()
            .find(|(n, _)| n == "message_delta")
            .unwrap();
        assert_eq!(message_delta["usage"]["input_tokens"], 5);
        assert_eq!(message_delta["usage"]["output_tokens"], 9);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let events = run(vec![
            Ok(Bytes::from("data: {not json}\n\n: comment\n\n")),
            text_chunk("ok"),
            done(),
        ])
        .await;
        let deltas: Vec<&Value> = events
            .iter()
            .filter(|(n, _)| n == "content_block_delta")
            .map(|(_, d)| d)
            .collect();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0]["delta"]["text"], "ok");
    }

    #[tokio::test]
    async fn lines_split_across_chunks_reassemble() {
        let whole = r#"data: {"id":"c","choices":[{"delta":{"content":"split"}}]}"#;
        let (a, b) = whole.split_at(25);
        let events = run(vec![
            Ok(Bytes::from(a.to_string())),
            Ok(Bytes::from(format!("{b}\n\n"))),
            done(),
        ])
        .await;
        let (_, delta) = events
            .iter()
            .find(|(n, _)| n == "content_block_delta")
            .unwrap();
        assert_eq!(delta["delta"]["text"], "split");
    }

    #[tokio::test]
    async fn data_after_done_is_ignored() {
        let events = run(vec![text_chunk("a"), done(), text_chunk("b")]).await;
        let deltas: Vec<&Value> = events
            .iter()
            .filter(|(n, _)| n == "content_block_delta")
            .map(|(_, d)| d)
            .collect();
        assert_eq!(deltas.len(), 1);
        assert_eq!(
            events.iter().filter(|(n, _)| n == "message_stop").count(),
            1
        );
    }
}
