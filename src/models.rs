//! Modelos de dominio (chunks de documentos, mensajes de chat y respuestas en curso).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadatos de procedencia de un chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Ruta del PDF del que procede el texto.
    pub source: String,
    /// Página (empezando en 1).
    pub page: usize,
    pub total_pages: usize,
    /// Desplazamiento en caracteres dentro del texto de la página.
    pub start_index: usize,
}

/// Un trozo de texto acotado, unidad de embedding y de recuperación.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
}

impl DocumentChunk {
    pub fn new(text: String, metadata: ChunkMetadata) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text,
            metadata,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Entrada del historial de conversación, con el formato de la API de chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Mensaje del asistente que se va rellenando token a token.
#[derive(Debug, Clone, Serialize)]
pub struct StreamedReply {
    pub id: Uuid,
    pub author: String,
    pub content: String,
    pub complete: bool,
}

impl StreamedReply {
    pub fn new(author: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            author: author.into(),
            content: String::new(),
            complete: false,
        }
    }

    pub fn push_token(&mut self, token: &str) {
        self.content.push_str(token);
    }

    pub fn finish(&mut self) {
        self.complete = true;
    }
}

/// Resultado estructurado de una etapa de ingesta o indexación.
///
/// `Degraded` conserva el valor producido junto con las incidencias que no
/// impidieron obtenerlo; `Failed` indica que no hay valor utilizable.
#[derive(Debug)]
pub enum StageOutcome<T> {
    Complete(T),
    Degraded { value: T, issues: Vec<String> },
    Failed(String),
}

impl<T> StageOutcome<T> {
    /// Combina un valor con una lista de incidencias.
    pub fn from_parts(value: T, issues: Vec<String>) -> Self {
        if issues.is_empty() {
            Self::Complete(value)
        } else {
            Self::Degraded { value, issues }
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Complete(value) | Self::Degraded { value, .. } => Some(value),
            Self::Failed(_) => None,
        }
    }

    pub fn issues(&self) -> Vec<String> {
        match self {
            Self::Complete(_) => Vec::new(),
            Self::Degraded { issues, .. } => issues.clone(),
            Self::Failed(reason) => vec![reason.clone()],
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_roles_serialize_like_the_chat_api() {
        let json = serde_json::to_string(&ChatMessage::assistant("hola")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"hola"}"#);
    }

    #[test]
    fn streamed_reply_accumulates_tokens() {
        let mut reply = StreamedReply::new("Onki");
        reply.push_token("Hal");
        reply.push_token("lo");
        assert!(!reply.complete);
        reply.finish();
        assert_eq!(reply.content, "Hallo");
        assert!(reply.complete);
    }

    #[test]
    fn stage_outcome_degrades_only_with_issues() {
        assert!(matches!(StageOutcome::from_parts(1, vec![]), StageOutcome::Complete(1)));
        let degraded = StageOutcome::from_parts(2, vec!["fallo".to_string()]);
        assert_eq!(degraded.issues(), vec!["fallo".to_string()]);
        assert_eq!(degraded.into_value(), Some(2));
        let failed: StageOutcome<i32> = StageOutcome::Failed("nada".into());
        assert!(failed.is_failed());
        assert_eq!(failed.into_value(), None);
    }
}
