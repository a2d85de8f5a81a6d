use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::EmbeddingConfig;
use crate::search::normalize::normalize;

/// Maximum characters to send per text to the embedding API.
/// Book paragraphs are short; the cap only guards against a malformed book
/// with no blank lines turning into one giant paragraph.
const MAX_EMBED_CHARS: usize = 8_000;

/// Dimension of the offline `hash` encoder.
pub const HASH_ENCODER_DIM: usize = 256;

/// Turns text into fixed-length vectors. Must be deterministic for a given
/// model so that cached paragraph embeddings and fresh query embeddings are
/// comparable.
#[async_trait]
pub trait TextEncoder: Send + Sync {
    /// Encode a batch; the output is parallel with `texts`.
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Model identifier recorded alongside cached embeddings.
    fn model(&self) -> &str;

    /// Encode a single text.
    async fn encode_one(&self, text: &str) -> Result<Vec<f32>> {
        let results = self.encode(&[text.to_string()]).await?;
        results.into_iter().next().context("No embedding returned")
    }
}

/// Build the encoder named by `config.provider`.
pub fn encoder_from_config(
    client: reqwest::Client,
    config: &EmbeddingConfig,
) -> Result<Arc<dyn TextEncoder>> {
    match config.provider.as_str() {
        "hash" => Ok(Arc::new(HashEncoder::new(HASH_ENCODER_DIM))),
        "ollama" | "openai" | "gemini" => Ok(Arc::new(HttpEncoder::new(client, config.clone()))),
        other => anyhow::bail!("Unknown embedding provider: {other}"),
    }
}

/// Truncate `text` to at most `MAX_EMBED_CHARS`, splitting on a UTF-8 char boundary.
fn truncate_for_embedding(text: &str) -> &str {
    if text.len() <= MAX_EMBED_CHARS {
        return text;
    }
    let mut end = MAX_EMBED_CHARS;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Encoder backed by a hosted or local embedding API.
pub struct HttpEncoder {
    client: reqwest::Client,
    config: EmbeddingConfig,
}

impl HttpEncoder {
    pub fn new(client: reqwest::Client, config: EmbeddingConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl TextEncoder for HttpEncoder {
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let truncated: Vec<String> = texts
            .iter()
            .map(|t| truncate_for_embedding(t).to_string())
            .collect();

        let embeddings = match self.config.provider.as_str() {
            "ollama" => embed_ollama(&self.client, &self.config, &truncated).await?,
            "openai" => embed_openai(&self.client, &self.config, &truncated).await?,
            "gemini" => embed_gemini(&self.client, &self.config, &truncated).await?,
            other => anyhow::bail!("Unknown embedding provider: {other}"),
        };

        if embeddings.len() != texts.len() {
            anyhow::bail!(
                "Embedding API returned {} vectors for {} inputs",
                embeddings.len(),
                texts.len()
            );
        }
        Ok(embeddings)
    }

    fn model(&self) -> &str {
        &self.config.model
    }
}

// ─── Ollama ──────────────────────────────────────────────

#[derive(Serialize)]
struct OllamaEmbedRequest {
    model: String,
    input: Vec<String>,
    truncate: bool,
}

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

async fn embed_ollama(
    client: &reqwest::Client,
    config: &EmbeddingConfig,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    let url = format!("{}/api/embed", config.base_url);

    let batch_size = 32;
    let mut all_embeddings = Vec::new();

    for chunk in texts.chunks(batch_size) {
        let req = OllamaEmbedRequest {
            model: config.model.clone(),
            input: chunk.to_vec(),
            truncate: true,
        };

        let resp = client
            .post(&url)
            .json(&req)
            .send()
            .await
            .context("Failed to call Ollama embed API")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Ollama embed API returned {status}: {body}");
        }

        let body: OllamaEmbedResponse = resp
            .json()
            .await
            .context("Failed to parse Ollama embed response")?;

        all_embeddings.extend(body.embeddings);
    }

    Ok(all_embeddings)
}

// ─── OpenAI-compatible ───────────────────────────────────

#[derive(Serialize)]
struct OpenAiEmbedRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct OpenAiEmbedResponse {
    data: Vec<OpenAiEmbedData>,
}

#[derive(Deserialize)]
struct OpenAiEmbedData {
    embedding: Vec<f32>,
}

async fn embed_openai(
    client: &reqwest::Client,
    config: &EmbeddingConfig,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    let url = format!("{}/v1/embeddings", config.base_url);
    let api_key = config.api_key.as_deref().unwrap_or_default();

    let batch_size = 64;
    let mut all_embeddings = Vec::new();

    for chunk in texts.chunks(batch_size) {
        let req = OpenAiEmbedRequest {
            model: config.model.clone(),
            input: chunk.to_vec(),
        };

        let resp = client
            .post(&url)
            .header("Authorization", format!("Bearer {api_key}"))
            .json(&req)
            .send()
            .await
            .context("Failed to call OpenAI embed API")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI embed API returned {status}: {body}");
        }

        let body: OpenAiEmbedResponse = resp
            .json()
            .await
            .context("Failed to parse OpenAI embed response")?;

        all_embeddings.extend(body.data.into_iter().map(|d| d.embedding));
    }

    Ok(all_embeddings)
}

// ─── Gemini ──────────────────────────────────────────────

#[derive(Serialize)]
struct GeminiBatchEmbedRequest {
    requests: Vec<GeminiEmbedRequest>,
}

#[derive(Serialize)]
struct GeminiEmbedRequest {
    model: String,
    content: GeminiContent,
}

#[derive(Serialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Deserialize)]
struct GeminiBatchEmbedResponse {
    embeddings: Vec<GeminiEmbedding>,
}

#[derive(Deserialize)]
struct GeminiEmbedding {
    values: Vec<f32>,
}

async fn embed_gemini(
    client: &reqwest::Client,
    config: &EmbeddingConfig,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    let url = format!(
        "{}/v1beta/models/{}:batchEmbedContents",
        config.base_url, config.model
    );
    let api_key = config.api_key.as_deref().unwrap_or_default();

    // batchEmbedContents accepts at most 100 requests
    let batch_size = 100;
    let mut all_embeddings = Vec::new();

    for chunk in texts.chunks(batch_size) {
        let req = GeminiBatchEmbedRequest {
            requests: chunk
                .iter()
                .map(|text| GeminiEmbedRequest {
                    model: format!("models/{}", config.model),
                    content: GeminiContent {
                        parts: vec![GeminiPart { text: text.clone() }],
                    },
                })
                .collect(),
        };

        let resp = client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&req)
            .send()
            .await
            .context("Failed to call Gemini embed API")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Gemini embed API returned {status}: {body}");
        }

        let body: GeminiBatchEmbedResponse = resp
            .json()
            .await
            .context("Failed to parse Gemini embed response")?;

        all_embeddings.extend(body.embeddings.into_iter().map(|e| e.values));
    }

    Ok(all_embeddings)
}

// ─── Offline ─────────────────────────────────────────────

/// Feature-hashing bag-of-stems encoder. Needs no model or network, so it
/// backs tests and offline runs. Texts sharing stems point in similar
/// directions; identical texts produce identical vectors.
pub struct HashEncoder {
    dimension: usize,
    model: String,
}

impl HashEncoder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
            model: format!("hash-{}", dimension.max(1)),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0f32; self.dimension];
        for token in normalize(text) {
            let hash = blake3::hash(token.as_bytes());
            let bytes = hash.as_bytes();
            let slot = u64::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]) as usize
                % self.dimension;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            embedding[slot] += sign;
        }

        // L2 normalize
        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut embedding {
                *x /= norm;
            }
        }
        embedding
    }
}

#[async_trait]
impl TextEncoder for HashEncoder {
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed(t)).collect())
    }

    fn model(&self) -> &str {
        &self.model
    }
}
