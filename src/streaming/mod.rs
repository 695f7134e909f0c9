//! Usage extraction from response bodies.
//!
//! The tee wrapper passes every byte through to the caller unchanged and
//! harvests token counts on the side. For SSE bodies it scans `data:`
//! lines as they flow; many providers emit `usage` on every delta, so the
//! last one seen wins. When the stream finishes cleanly the record is
//! enqueued fire-and-forget; an aborted stream abandons its state.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};

use bytes::Bytes;
use futures_util::Stream;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::{
    models::{RequestContext, SpendMode, UsageRecord},
    spend::UsageEnqueue,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
}

/// Read a `usage` object in either dialect's field naming.
pub fn usage_from_json(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    if !usage.is_object() {
        return None;
    }
    let input_tokens = usage
        .get("prompt_tokens")
        .or_else(|| usage.get("input_tokens"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let output_tokens = usage
        .get("completion_tokens")
        .or_else(|| usage.get("output_tokens"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    Some(TokenUsage {
        input_tokens,
        output_tokens,
    })
}

/// Unary path: parse the completed JSON body and read its `usage`.
pub fn extract_unary_usage(body: &[u8]) -> Option<TokenUsage> {
    let value: Value = serde_json::from_slice(body).ok()?;
    usage_from_json(&value)
}

/// Scan one SSE line for a usage payload. `[DONE]` and unparseable lines
/// yield nothing.
fn usage_from_sse_line(line: &str) -> Option<TokenUsage> {
    let payload = line.strip_prefix("data: ")?.trim();
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }
    let value: Value = serde_json::from_str(payload).ok()?;
    usage_from_json(&value)
}

/// Everything needed to mint a [`UsageRecord`] once the counts are known.
#[derive(Debug, Clone)]
pub struct UsageContext {
    pub endpoint: String,
    pub status: u16,
    pub account_id: Option<i64>,
    pub key_id: Option<i64>,
    pub deployment_id: i64,
    pub provider: String,
    pub model: String,
    pub input_cost_per_token: Decimal,
    pub output_cost_per_token: Decimal,
    pub spend_mode: SpendMode,
}

impl UsageContext {
    pub fn from_request(ctx: &RequestContext, endpoint: &str, status: u16) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            status,
            account_id: ctx.account.as_ref().map(|a| a.id),
            key_id: ctx.key.as_ref().map(|k| k.id),
            deployment_id: ctx.deployment.id,
            provider: ctx.deployment.provider.clone(),
            model: ctx.requested_model.clone(),
            input_cost_per_token: ctx.deployment.input_cost_per_token,
            output_cost_per_token: ctx.deployment.output_cost_per_token,
            spend_mode: ctx.spend_mode,
        }
    }

    pub fn into_record(self, usage: TokenUsage, started: Instant) -> UsageRecord {
        UsageRecord {
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            endpoint: self.endpoint,
            status: self.status,
            duration_ms: started.elapsed().as_millis() as i64,
            input_tokens: usage.input_tokens.max(0),
            output_tokens: usage.output_tokens.max(0),
            account_id: self.account_id,
            key_id: self.key_id,
            deployment_id: self.deployment_id,
            provider: self.provider,
            model: self.model,
            input_cost_per_token: self.input_cost_per_token,
            output_cost_per_token: self.output_cost_per_token,
            spend_mode: self.spend_mode,
        }
    }
}

/// Pass-through SSE wrapper that harvests the last-seen usage and enqueues
/// a record when the stream ends.
pub struct UsageTeeStream<S> {
    inner: S,
    queue: Arc<dyn UsageEnqueue>,
    context: Option<UsageContext>,
    started: Instant,
    last_usage: Option<TokenUsage>,
    /// Carry for a line split across chunks.
    buffer: String,
    flushed: bool,
}

impl<S> UsageTeeStream<S> {
    pub fn new(
        inner: S,
        queue: Arc<dyn UsageEnqueue>,
        context: UsageContext,
        started: Instant,
    ) -> Self {
        Self {
            inner,
            queue,
            context: Some(context),
            started,
            last_usage: None,
            buffer: String::new(),
            flushed: false,
        }
    }

    fn scan_chunk(&mut self, chunk: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        while let Some(newline) = self.buffer.find('\n') {
            if let Some(usage) = usage_from_sse_line(self.buffer[..newline].trim_end_matches('\r'))
            {
                self.last_usage = Some(usage);
            }
            self.buffer.drain(..=newline);
        }
    }

    /// Enqueue before the terminal item reaches the caller. Best-effort:
    /// the enqueue task owns the record and swallows its own failures.
    fn flush(&mut self) {
        if self.flushed {
            return;
        }
        self.flushed = true;
        if !self.buffer.is_empty() {
            let tail = std::mem::take(&mut self.buffer);
            if let Some(usage) = usage_from_sse_line(tail.trim_end_matches('\r')) {
                self.last_usage = Some(usage);
            }
        }
        let (Some(context), Some(usage)) = (self.context.take(), self.last_usage) else {
            return;
        };
        let record = context.into_record(usage, self.started);
        let queue = Arc::clone(&self.queue);
        tokio::spawn(async move {
            queue.enqueue(record).await;
        });
    }
}

impl<S, E> Stream for UsageTeeStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.scan_chunk(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                // Aborts abandon the in-flight state; nothing is enqueued.
                self.context = None;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.flush();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use futures_util::{StreamExt, stream};
    use rust_decimal::dec;

    use super::*;

    #[derive(Default)]
    struct RecordingQueue {
        records: Mutex<Vec<UsageRecord>>,
    }

    #[async_trait]
    impl UsageEnqueue for RecordingQueue {
        async fn enqueue(&self, record: UsageRecord) {
            self.records.lock().unwrap().push(record);
        }
    }

    fn context() -> UsageContext {
        UsageContext {
            endpoint: "/v1/chat/completions".to_string(),
            status: 200,
            account_id: Some(1),
            key_id: Some(2),
            deployment_id: 3,
            provider: "openrouter".to_string(),
            model: "gpt-x".to_string(),
            input_cost_per_token: dec!(0.000001),
            output_cost_per_token: dec!(0.000002),
            spend_mode: SpendMode::Regular,
        }
    }

    fn chunk(s: &str) -> Result<Bytes, std::io::Error> {
        Ok(Bytes::from(s.to_string()))
    }

    async fn run_tee(
        chunks: Vec<Result<Bytes, std::io::Error>>,
    ) -> (Vec<Bytes>, Arc<RecordingQueue>) {
        let queue = Arc::new(RecordingQueue::default());
        let tee = UsageTeeStream::new(
            stream::iter(chunks),
            Arc::clone(&queue) as Arc<dyn UsageEnqueue>,
            context(),
            Instant::now(),
        );
        let out: Vec<_> = tee.map(|r| r.unwrap()).collect().await;
        // Let the spawned enqueue land.
        tokio::task::yield_now().await;
        (out, queue)
    }

    #[tokio::test]
    async fn passes_bytes_through_unchanged() {
        let input = vec![
            chunk("data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n"),
            chunk("data: [DONE]\n\n"),
        ];
        let (out, _) = run_tee(input).await;
        assert_eq!(out[0], Bytes::from("data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n"));
        assert_eq!(out[1], Bytes::from("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn keeps_last_usage_across_chunks() {
        let input = vec![
            chunk("data: {\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":1}}\n\n"),
            chunk("data: {\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":8}}\n\n"),
            chunk("data: [DONE]\n\n"),
        ];
        let (_, queue) = run_tee(input).await;
        let records = queue.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].input_tokens, 5);
        assert_eq!(records[0].output_tokens, 8);
        assert_eq!(records[0].spend_mode, SpendMode::Regular);
    }

    #[tokio::test]
    async fn anthropic_field_names_are_understood() {
        let input = vec![chunk(
            "data: {\"type\":\"message_delta\",\"usage\":{\"input_tokens\":12,\"output_tokens\":3}}\n\n",
        )];
        let (_, queue) = run_tee(input).await;
        let records = queue.records.lock().unwrap();
        assert_eq!(records[0].input_tokens, 12);
        assert_eq!(records[0].output_tokens, 3);
    }

    #[tokio::test]
    async fn no_usage_means_no_record() {
        let input = vec![
            chunk("data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n"),
            chunk("data: [DONE]\n\n"),
        ];
        let (_, queue) = run_tee(input).await;
        assert!(queue.records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stream_error_abandons_the_record() {
        let queue = Arc::new(RecordingQueue::default());
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            chunk("data: {\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":1}}\n\n"),
            Err(std::io::Error::other("client went away")),
        ];
        let mut tee = UsageTeeStream::new(
            stream::iter(chunks),
            Arc::clone(&queue) as Arc<dyn UsageEnqueue>,
            context(),
            Instant::now(),
        );
        while let Some(_item) = tee.next().await {}
        tokio::task::yield_now().await;
        assert!(queue.records.lock().unwrap().is_empty());
    }

    #[test]
    fn unary_extraction_reads_both_dialects() {
        let openai = br#"{"choices":[],"usage":{"prompt_tokens":7,"completion_tokens":2}}"#;
        assert_eq!(
            extract_unary_usage(openai),
            Some(TokenUsage {
                input_tokens: 7,
                output_tokens: 2
            })
        );
        let anthropic = br#"{"content":[],"usage":{"input_tokens":9,"output_tokens":4}}"#;
        assert_eq!(
            extract_unary_usage(anthropic),
            Some(TokenUsage {
                input_tokens: 9,
                output_tokens: 4
            })
        );
        assert_eq!(extract_unary_usage(b"{}"), None);
        assert_eq!(extract_unary_usage(b"not json"), None);
    }
}
