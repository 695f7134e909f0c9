//! Dialect bridge between Anthropic Messages and OpenAI Chat Completions.
//!
//! `convert` handles unary request/response rewriting; `stream` rewrites a
//! live Chat Completions SSE stream into Anthropic Messages events.

mod convert;
mod stream;

pub use convert::{
    chat_request_from_messages, map_stop_reason, messages_error_from_chat,
    messages_response_from_chat,
};
pub use stream::MessagesStreamBridge;
