//! Cliente de servicios LLM: embeddings (vía Rig) y chat en streaming
//! (API de chat completions compatible con OpenAI, vía SSE).

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use rig::{
    client::EmbeddingsClient as _, // <- para client.embedding_model(...)
    embeddings::EmbeddingModel,    // <- para .embed_texts
    providers::openai::{self, TEXT_EMBEDDING_3_SMALL},
};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{config::AppConfig, models::ChatMessage};

/// Flujo de tokens de una respuesta en streaming.
pub type TokenStream = mpsc::Receiver<Result<String>>;

/// Calcula representaciones vectoriales de textos.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f64>>>;
}

/// Modelo de chat capaz de devolver la respuesta token a token.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn stream_chat(&self, request: ChatRequest) -> Result<TokenStream>;
}

/// Parámetros de generación. `None` deja el valor por defecto del modelo.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GenerationSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
}

impl GenerationSettings {
    /// Ajustes fijos de la fase de reescritura con la voz de la persona.
    pub fn persona() -> Self {
        Self {
            temperature: Some(0.3),
            max_tokens: Some(500),
            top_p: Some(1.0),
            frequency_penalty: Some(0.0),
            presence_penalty: Some(0.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub settings: GenerationSettings,
}

#[derive(Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(flatten)]
    settings: &'a GenerationSettings,
}

/// Gestor de LLMs y embeddings. Se construye una vez en `main` y se
/// comparte con todas las sesiones.
#[derive(Clone)]
pub struct LlmManager {
    api_key: String,
    base_url: String,
    pub embedding_model: String,
    pub chat_model: String,
    http: reqwest::Client,
    embeddings: openai::Client,
}

impl std::fmt::Debug for LlmManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmManager")
            .field("base_url", &self.base_url)
            .field("embedding_model", &self.embedding_model)
            .field("chat_model", &self.chat_model)
            .finish()
    }
}

impl LlmManager {
    /// Construye el manager a partir de la configuración.
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        let base_url = cfg.openai_base_url.trim_end_matches('/').to_string();
        // Embeddings y chat comparten endpoint.
        let embeddings = openai::Client::builder(&cfg.openai_api_key)
            .base_url(&base_url)
            .build();
        Ok(Self {
            api_key: cfg.openai_api_key.clone(),
            base_url,
            embedding_model: cfg.llm_embedding_model.clone(),
            chat_model: cfg.llm_chat_model.clone(),
            http: reqwest::Client::new(),
            embeddings,
        })
    }

    // ---------------------------------------------------------------------
    // EMBEDDINGS
    // ---------------------------------------------------------------------

    async fn embed_with_openai(&self, texts: Vec<String>) -> Result<Vec<Vec<f64>>> {
        let model_name = if self.embedding_model.is_empty() {
            TEXT_EMBEDDING_3_SMALL
        } else {
            self.embedding_model.as_str()
        };
        let embedding_model = self.embeddings.embedding_model(model_name);

        let expected = texts.len();
        let embeddings = embedding_model.embed_texts(texts).await?;

        if embeddings.len() != expected {
            return Err(anyhow!(
                "Número de embeddings ({}) distinto al número de textos ({})",
                embeddings.len(),
                expected
            ));
        }

        Ok(embeddings.into_iter().map(|e| e.vec).collect())
    }

    // ---------------------------------------------------------------------
    // CHAT / COMPLETION
    // ---------------------------------------------------------------------

    async fn stream_with_openai(&self, request: ChatRequest) -> Result<TokenStream> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = CompletionBody {
            model: &request.model,
            messages: &request.messages,
            stream: true,
            settings: &request.settings,
        };

        let res = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(anyhow!("Error de la API de chat ({status}): {text}"));
        }

        let (tx, rx) = mpsc::channel(32);
        let mut stream = res.bytes_stream();

        tokio::spawn(async move {
            let mut buffer = LineBuffer::default();
            while let Some(item) = stream.next().await {
                let bytes = match item {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(Err(anyhow!("Stream interrumpido: {e}"))).await;
                        return;
                    }
                };
                buffer.extend(&bytes);

                while let Some(line) = buffer.next_line() {
                    let line = match line {
                        Ok(line) => line,
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    };
                    match parse_sse_line(&line) {
                        SseLine::Done => return,
                        SseLine::Token(token) => {
                            if tx.send(Ok(token)).await.is_err() {
                                return;
                            }
                        }
                        SseLine::Failure(message) => {
                            let _ = tx.send(Err(anyhow!(message))).await;
                            return;
                        }
                        SseLine::Skip => {}
                    }
                }
            }
            debug!("Stream de chat cerrado sin [DONE].");
        });

        Ok(rx)
    }
}

#[async_trait]
impl Embedder for LlmManager {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f64>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.embed_with_openai(texts).await
    }
}

#[async_trait]
impl ChatModel for LlmManager {
    async fn stream_chat(&self, request: ChatRequest) -> Result<TokenStream> {
        self.stream_with_openai(request).await
    }
}

/// Bytes pendientes del stream. Un carácter multibyte puede llegar partido
/// entre dos fragmentos, así que sólo se decodifican líneas completas.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    fn next_line(&mut self) -> Option<Result<String>> {
        let pos = self.pending.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.pending.drain(..=pos).collect();
        Some(String::from_utf8(line).map_err(|e| anyhow!("Línea SSE con UTF-8 no válido: {e}")))
    }
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Token(String),
    Failure(String),
    Done,
    Skip,
}

/// Interpreta una línea del stream SSE de chat completions.
fn parse_sse_line(line: &str) -> SseLine {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }

    match serde_json::from_str::<Value>(data) {
        Ok(json) => {
            if let Some(message) = json["error"]["message"].as_str() {
                return SseLine::Failure(format!("Error de la API de chat: {message}"));
            }
            match json["choices"][0]["delta"]["content"].as_str() {
                Some(content) if !content.is_empty() => SseLine::Token(content.to_string()),
                _ => SseLine::Skip,
            }
        }
        Err(e) => {
            warn!("Fragmento SSE no válido ({e}): '{data}'");
            SseLine::Skip
        }
    }
}
