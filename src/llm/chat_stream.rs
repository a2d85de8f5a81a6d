use anyhow::{Context, Result};
use futures_util::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::LlmConfig;
use crate::llm::generate::{GeminiRequest, GeminiResponse};

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Stream a completion for `prompt` from the configured provider.
/// Yields content fragments as they arrive.
pub async fn stream_generate(
    client: &reqwest::Client,
    config: &LlmConfig,
    prompt: &str,
) -> Result<ChatStream> {
    match config.provider.as_str() {
        "gemini" => stream_gemini(client, config, prompt).await,
        "ollama" => stream_ollama(client, config, prompt).await,
        "openai" => stream_openai(client, config, prompt).await,
        other => anyhow::bail!("Unsupported LLM provider for streaming: {other}"),
    }
}

/// Drive `stream` on its own task, forwarding fragments into a bounded
/// channel.
///
/// The task stops as soon as the receiver is dropped (client disconnect),
/// which drops the upstream response and closes the model connection. It
/// also stops after forwarding the first error.
pub fn spawn_producer(mut stream: ChatStream, capacity: usize) -> mpsc::Receiver<Result<String>> {
    let (tx, rx) = mpsc::channel(capacity.max(1));

    tokio::spawn(async move {
        let mut forwarded = 0usize;
        loop {
            tokio::select! {
                _ = tx.closed() => {
                    tracing::debug!("Consumer dropped after {forwarded} fragments, cancelling generation");
                    break;
                }
                next = stream.next() => match next {
                    Some(item) => {
                        let failed = item.is_err();
                        if tx.send(item).await.is_err() {
                            tracing::debug!("Consumer dropped mid-send, cancelling generation");
                            break;
                        }
                        forwarded += 1;
                        if failed {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });

    rx
}

// ─── Gemini streaming ────────────────────────────────────

async fn stream_gemini(
    client: &reqwest::Client,
    config: &LlmConfig,
    prompt: &str,
) -> Result<ChatStream> {
    let url = format!(
        "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
        config.base_url, config.chat_model
    );

    let resp = client
        .post(&url)
        .timeout(Duration::from_secs(300))
        .header("x-goog-api-key", config.api_key.as_deref().unwrap_or(""))
        .json(&GeminiRequest::user(prompt))
        .send()
        .await
        .context("Failed to connect to Gemini for streaming")?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("Gemini streaming API returned {status}: {body}");
    }

    let stream = stream_lines(resp.bytes_stream()).filter_map(|line_result| async move {
        match line_result {
            Ok(line) => parse_gemini_line(&line),
            Err(e) => Some(Err(e)),
        }
    });

    Ok(Box::pin(stream))
}

/// Parse a single Gemini SSE line. Non-data lines and empty deltas are skipped.
fn parse_gemini_line(line: &str) -> Option<Result<String>> {
    let data = line.trim().strip_prefix("data:")?.trim();
    if data.is_empty() {
        return None;
    }

    match serde_json::from_str::<GeminiResponse>(data) {
        Ok(chunk) => {
            let content = chunk.text();
            if content.is_empty() {
                return None;
            }
            Some(Ok(content))
        }
        Err(e) => Some(Err(anyhow::anyhow!("Failed to parse Gemini chunk: {e}"))),
    }
}

// ─── Ollama streaming ────────────────────────────────────

#[derive(Serialize)]
struct OllamaStreamRequest {
    model: String,
    messages: Vec<StreamMessage>,
    stream: bool,
}

#[derive(Serialize, Deserialize)]
struct StreamMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OllamaStreamChunk {
    message: StreamMessage,
    done: bool,
}

fn user_message(prompt: &str) -> Vec<StreamMessage> {
    vec![StreamMessage {
        role: "user".to_string(),
        content: prompt.to_string(),
    }]
}

async fn stream_ollama(
    client: &reqwest::Client,
    config: &LlmConfig,
    prompt: &str,
) -> Result<ChatStream> {
    let url = format!("{}/api/chat", config.base_url);

    let req = OllamaStreamRequest {
        model: config.chat_model.clone(),
        messages: user_message(prompt),
        stream: true,
    };

    let resp = client
        .post(&url)
        .timeout(Duration::from_secs(300))
        .json(&req)
        .send()
        .await
        .context("Failed to connect to Ollama for chat streaming")?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("Ollama chat API returned {status}: {body}");
    }

    let stream = stream_lines(resp.bytes_stream()).filter_map(|line_result| async move {
        match line_result {
            Ok(line) => parse_ollama_line(&line),
            Err(e) => Some(Err(e)),
        }
    });

    Ok(Box::pin(stream))
}

/// Parse a single Ollama streaming line. Returns:
/// - Some(Ok(content)) for content deltas
/// - Some(Err(e)) for parse errors
/// - None to skip (empty content or done signal)
fn parse_ollama_line(line: &str) -> Option<Result<String>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    match serde_json::from_str::<OllamaStreamChunk>(line) {
        Ok(chunk) => {
            if chunk.done {
                return None;
            }
            let content = chunk.message.content;
            if content.is_empty() {
                return None;
            }
            Some(Ok(content))
        }
        Err(e) => Some(Err(anyhow::anyhow!("Failed to parse Ollama chunk: {e}"))),
    }
}

// ─── OpenAI streaming ────────────────────────────────────

#[derive(Serialize)]
struct OpenAiStreamRequest {
    model: String,
    messages: Vec<StreamMessage>,
    stream: bool,
}

#[derive(Deserialize)]
struct OpenAiStreamChunk {
    choices: Vec<OpenAiStreamChoice>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiStreamDelta,
}

#[derive(Deserialize)]
struct OpenAiStreamDelta {
    content: Option<String>,
}

async fn stream_openai(
    client: &reqwest::Client,
    config: &LlmConfig,
    prompt: &str,
) -> Result<ChatStream> {
    let url = format!("{}/v1/chat/completions", config.base_url);

    let req = OpenAiStreamRequest {
        model: config.chat_model.clone(),
        messages: user_message(prompt),
        stream: true,
    };

    let resp = client
        .post(&url)
        .timeout(Duration::from_secs(300))
        .header(
            "Authorization",
            format!("Bearer {}", config.api_key.as_deref().unwrap_or("")),
        )
        .json(&req)
        .send()
        .await
        .context("Failed to connect to OpenAI for chat streaming")?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("OpenAI chat API returned {status}: {body}");
    }

    let stream = stream_lines(resp.bytes_stream()).filter_map(|line_result| async move {
        match line_result {
            Ok(line) => parse_openai_line(&line),
            Err(e) => Some(Err(e)),
        }
    });

    Ok(Box::pin(stream))
}

/// Parse a single OpenAI SSE line. Returns:
/// - Some(Ok(content)) for content deltas
/// - Some(Err(e)) for parse errors
/// - None to skip (empty lines, [DONE], role-only chunks)
fn parse_openai_line(line: &str) -> Option<Result<String>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let data = line.strip_prefix("data: ")?.trim();

    if data == "[DONE]" {
        return None;
    }

    match serde_json::from_str::<OpenAiStreamChunk>(data) {
        Ok(chunk) => {
            let content = chunk
                .choices
                .first()
                .and_then(|c| c.delta.content.clone())
                .unwrap_or_default();
            if content.is_empty() {
                return None;
            }
            Some(Ok(content))
        }
        Err(e) => Some(Err(anyhow::anyhow!("Failed to parse OpenAI chunk: {e}"))),
    }
}

// ─── Line buffering ──────────────────────────────────────

/// Convert a byte stream into a stream of complete lines.
///
/// Bytes are buffered until a newline arrives, so a UTF-8 sequence split
/// across chunks is decoded whole.
fn stream_lines<E>(
    byte_stream: impl Stream<Item = std::result::Result<bytes::Bytes, E>> + Send + 'static,
) -> impl Stream<Item = Result<String>> + Send
where
    E: std::fmt::Display + Send + 'static,
{
    futures_util::stream::unfold(
        (Box::pin(byte_stream), Vec::<u8>::new()),
        |(mut stream, mut buffer)| async move {
            loop {
                // First, try to extract a complete line from the buffer
                if let Some(newline_pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=newline_pos).collect();
                    let line = String::from_utf8_lossy(&line[..newline_pos]).into_owned();
                    if !line.trim().is_empty() {
                        return Some((Ok(line), (stream, buffer)));
                    }
                    continue;
                }

                match stream.next().await {
                    Some(Ok(bytes)) => {
                        buffer.extend_from_slice(&bytes);
                    }
                    Some(Err(e)) => {
                        return Some((
                            Err(anyhow::anyhow!("Stream read error: {e}")),
                            (stream, buffer),
                        ));
                    }
                    None => {
                        // Stream ended; emit remaining buffer if non-empty
                        let remaining = String::from_utf8_lossy(&buffer).into_owned();
                        buffer.clear();
                        if !remaining.trim().is_empty() {
                            return Some((Ok(remaining), (stream, buffer)));
                        }
                        return None;
                    }
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    // ─── Gemini parsing ──────────────────────────────────

    #[test]
    fn test_parse_gemini_data_line() {
        let line = r#"data: {"candidates":[{"content":{"role":"model","parts":[{"text":"Purpose"}]}}]}"#;
        assert_eq!(parse_gemini_line(line).unwrap().unwrap(), "Purpose");
    }

    #[test]
    fn test_parse_gemini_skips_non_data() {
        assert!(parse_gemini_line("").is_none());
        assert!(parse_gemini_line(": keep-alive").is_none());
    }

    #[test]
    fn test_parse_gemini_empty_parts() {
        let line = r#"data: {"candidates":[{"content":{"role":"model","parts":[]}}]}"#;
        assert!(parse_gemini_line(line).is_none());
    }

    #[test]
    fn test_parse_gemini_malformed() {
        assert!(parse_gemini_line("data: {oops").unwrap().is_err());
    }

    // ─── Ollama parsing ──────────────────────────────────

    #[test]
    fn test_parse_ollama_chunk() {
        let line = r#"{"message":{"role":"assistant","content":"The main"},"done":false}"#;
        assert_eq!(parse_ollama_line(line).unwrap().unwrap(), "The main");
    }

    #[test]
    fn test_parse_ollama_done() {
        let line = r#"{"message":{"role":"assistant","content":""},"done":true}"#;
        assert!(parse_ollama_line(line).is_none());
    }

    #[test]
    fn test_parse_ollama_malformed() {
        assert!(parse_ollama_line("not valid json{{{").unwrap().is_err());
    }

    // ─── OpenAI parsing ──────────────────────────────────

    #[test]
    fn test_parse_openai_data_line() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#;
        assert_eq!(parse_openai_line(line).unwrap().unwrap(), "Hello");
    }

    #[test]
    fn test_parse_openai_done() {
        assert!(parse_openai_line("data: [DONE]").is_none());
    }

    #[test]
    fn test_parse_openai_role_only() {
        let line = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert!(parse_openai_line(line).is_none());
    }

    // ─── Line buffering ──────────────────────────────────

    #[tokio::test]
    async fn test_stream_lines_reassembles_split_lines() {
        let parts: Vec<std::result::Result<bytes::Bytes, std::io::Error>> = vec![
            Ok(bytes::Bytes::from("data: one\nda")),
            Ok(bytes::Bytes::from("ta: two\n\n")),
            Ok(bytes::Bytes::from("data: three")),
        ];
        let lines: Vec<String> = stream_lines(futures_util::stream::iter(parts))
            .map(|l| l.unwrap())
            .collect()
            .await;
        assert_eq!(lines, vec!["data: one", "data: two", "data: three"]);
    }

    #[tokio::test]
    async fn test_stream_lines_keeps_multibyte_char_split_across_chunks() {
        let raw = "data: café \u{201c}ok\u{201d}\n".as_bytes();
        // Byte 10 falls inside the two-byte 'é'; byte 14 inside the opening quote
        let parts: Vec<std::result::Result<bytes::Bytes, std::io::Error>> = vec![
            Ok(bytes::Bytes::copy_from_slice(&raw[..10])),
            Ok(bytes::Bytes::copy_from_slice(&raw[10..14])),
            Ok(bytes::Bytes::copy_from_slice(&raw[14..])),
        ];
        let lines: Vec<String> = stream_lines(futures_util::stream::iter(parts))
            .map(|l| l.unwrap())
            .collect()
            .await;
        assert_eq!(lines, vec!["data: café \u{201c}ok\u{201d}"]);
    }

    // ─── Producer / consumer ─────────────────────────────

    #[tokio::test]
    async fn test_producer_forwards_all_fragments() {
        let fragments: Vec<Result<String>> = vec![
            Ok("Money ".to_string()),
            Ok("is a ".to_string()),
            Ok("tool.".to_string()),
        ];
        let fragments = futures_util::stream::iter(fragments);
        let mut rx = spawn_producer(Box::pin(fragments), 4);
        let mut text = String::new();
        while let Some(item) = rx.recv().await {
            text.push_str(&item.unwrap());
        }
        assert_eq!(text, "Money is a tool.");
    }

    #[tokio::test]
    async fn test_producer_stops_after_error() {
        let fragments: Vec<Result<String>> = vec![
            Ok("partial".to_string()),
            Err(anyhow::anyhow!("upstream died")),
            Ok("never sent".to_string()),
        ];
        let fragments = futures_util::stream::iter(fragments);
        let mut rx = spawn_producer(Box::pin(fragments), 4);
        assert!(rx.recv().await.unwrap().is_ok());
        assert!(rx.recv().await.unwrap().is_err());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_producer_stops_when_consumer_drops() {
        let produced = Arc::new(AtomicUsize::new(0));
        let counter = produced.clone();
        let endless = futures_util::stream::unfold(0usize, move |n| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
                Some((Ok::<_, anyhow::Error>(format!("tok{n}")), n + 1))
            }
        });

        let mut rx = spawn_producer(Box::pin(endless), 1);
        assert_eq!(rx.recv().await.unwrap().unwrap(), "tok0");
        drop(rx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let after_drop = produced.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(produced.load(Ordering::SeqCst), after_drop);
    }
}
