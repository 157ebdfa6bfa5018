//! Consulta RAG y generación de respuestas en streaming.
//!
//! Flujo de un turno:
//!   1. Recuperar los chunks más relevantes para el mensaje del usuario.
//!   2. Rellenar la plantilla del sistema con `{context}` y `{question}` y
//!      emitir la respuesta del modelo token a token.
//!   3. Pedir al modelo, sobre todo el historial, que hable como la persona
//!      y añadir esa segunda respuesta al mismo mensaje.
//!   4. Registrar la respuesta completa en el historial.

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::{
    frontend::ChatFrontend,
    llm::{ChatModel, ChatRequest, Embedder, GenerationSettings},
    models::{ChatMessage, DocumentChunk, StreamedReply},
    session::ConversationSession,
    vector_store::VectorIndex,
};

/// Plantilla con los marcadores `{context}` y `{question}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    template: String,
}

impl PromptTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self { template: template.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    pub fn render(&self, context: &str, question: &str) -> String {
        self.template
            .replace("{context}", context)
            .replace("{question}", question)
    }
}

/// Recupera los chunks más similares a una consulta.
pub struct Retriever {
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    top_k: usize,
}

impl Retriever {
    pub fn new(index: Arc<VectorIndex>, embedder: Arc<dyn Embedder>, top_k: usize) -> Self {
        Self { index, embedder, top_k }
    }

    /// Sin efectos secundarios. Un índice vacío o no disponible devuelve una
    /// lista vacía en lugar de un error.
    pub async fn retrieve(&self, query: &str) -> Vec<DocumentChunk> {
        if self.index.is_empty() {
            return Vec::new();
        }

        let query_vec = match self.embedder.embed(vec![query.to_string()]).await {
            Ok(mut vectors) if !vectors.is_empty() => vectors.swap_remove(0),
            Ok(_) => {
                warn!("No se pudo generar embedding de la consulta.");
                return Vec::new();
            }
            Err(e) => {
                warn!("Índice no disponible para la consulta: {e}");
                return Vec::new();
            }
        };

        self.index
            .search(&query_vec, self.top_k)
            .into_iter()
            .map(|(_, chunk)| chunk)
            .collect()
    }
}

/// Une el texto de los chunks recuperados, separados por una línea en blanco.
pub fn format_context(chunks: &[DocumentChunk]) -> String {
    chunks
        .iter()
        .map(|c| c.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Tubería recuperación + generación de una sesión.
pub struct RagPipeline {
    retriever: Option<Retriever>,
    prompt: PromptTemplate,
    chat: Arc<dyn ChatModel>,
    model: String,
}

impl RagPipeline {
    pub fn new(
        retriever: Option<Retriever>,
        prompt: PromptTemplate,
        chat: Arc<dyn ChatModel>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            retriever,
            prompt,
            chat,
            model: model.into(),
        }
    }

    /// Plantilla sin rellenar; es también el mensaje de sistema de la sesión.
    pub fn system_prompt(&self) -> &str {
        self.prompt.as_str()
    }

    pub fn has_retrieval(&self) -> bool {
        self.retriever.is_some()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn chat(&self) -> &Arc<dyn ChatModel> {
        &self.chat
    }

    /// Petición de la fase con contexto para una pregunta.
    pub async fn grounded_request(&self, question: &str) -> ChatRequest {
        let chunks = match &self.retriever {
            Some(retriever) => retriever.retrieve(question).await,
            None => Vec::new(),
        };
        info!("Recuperados {} chunks para la consulta.", chunks.len());

        let rendered = self.prompt.render(&format_context(&chunks), question);
        ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage::user(rendered)],
            settings: GenerationSettings::default(),
        }
    }
}

/// Responde a un mensaje del usuario en dos fases consecutivas y devuelve la
/// respuesta final. Los errores del modelo o del frontend cortan el turno.
pub async fn respond(
    user_message: &str,
    session: &mut ConversationSession,
    frontend: &dyn ChatFrontend,
) -> Result<StreamedReply> {
    session.push_message(ChatMessage::user(user_message));

    let persona = session.persona().to_string();
    let mut reply = StreamedReply::new(persona.clone());
    frontend.start_reply(&reply).await?;

    let pipeline = session.pipeline();

    // Fase 1: respuesta basada en los documentos.
    let grounded = pipeline.grounded_request(user_message).await;
    stream_into(pipeline.chat().as_ref(), grounded, &mut reply, frontend).await?;

    // Fase 2: la misma conversación, con la voz de la persona.
    let mut messages = session.history().to_vec();
    messages.push(ChatMessage::user(format!("speak as {persona}")));
    let restyle = ChatRequest {
        model: pipeline.model().to_string(),
        messages,
        settings: GenerationSettings::persona(),
    };
    stream_into(pipeline.chat().as_ref(), restyle, &mut reply, frontend).await?;

    reply.finish();
    session.push_message(ChatMessage::assistant(reply.content.clone()));
    frontend.finish_reply(&reply).await?;

    Ok(reply)
}

async fn stream_into(
    chat: &dyn ChatModel,
    request: ChatRequest,
    reply: &mut StreamedReply,
    frontend: &dyn ChatFrontend,
) -> Result<()> {
    let mut tokens = chat.stream_chat(request).await?;
    while let Some(token) = tokens.recv().await {
        let token = token?;
        reply.push_token(&token);
        frontend.stream_token(reply, &token).await?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        llm::TokenStream,
        session::{ConversationSession, DEFAULT_SYSTEM_PROMPT},
        vector_store::tests::{chunk, KeywordEmbedder},
    };
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::{
        collections::VecDeque,
        sync::Mutex,
        time::Duration,
    };
    use tokio::sync::mpsc;

    /// Modelo de chat con respuestas guionizadas que guarda las peticiones.
    pub(crate) struct ScriptedChat {
        pub requests: Mutex<Vec<ChatRequest>>,
        replies: Mutex<VecDeque<Vec<Result<String>>>>,
    }

    impl ScriptedChat {
        pub(crate) fn new(replies: Vec<Vec<Result<String>>>) -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                replies: Mutex::new(replies.into()),
            }
        }

        pub(crate) fn tokens(parts: &[&str]) -> Vec<Result<String>> {
            parts.iter().map(|p| Ok(p.to_string())).collect()
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedChat {
        async fn stream_chat(&self, request: ChatRequest) -> Result<TokenStream> {
            self.requests.lock().unwrap().push(request);
            let script = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow!("503 Service Unavailable"))?;
            let (tx, rx) = mpsc::channel(script.len().max(1));
            for item in script {
                tx.send(item).await.unwrap();
            }
            Ok(rx)
        }
    }

    /// Frontend que registra lo que vería el cliente.
    #[derive(Default)]
    pub(crate) struct RecordingFrontend {
        pub messages: Mutex<Vec<(String, String)>>,
        pub streamed: Mutex<String>,
        pub finished: Mutex<Vec<String>>,
        pub answer: Option<String>,
    }

    #[async_trait]
    impl ChatFrontend for RecordingFrontend {
        async fn send_message(&self, author: &str, content: &str) -> Result<()> {
            self.messages
                .lock()
                .unwrap()
                .push((author.to_string(), content.to_string()));
            Ok(())
        }

        async fn start_reply(&self, _reply: &StreamedReply) -> Result<()> {
            Ok(())
        }

        async fn stream_token(&self, _reply: &StreamedReply, token: &str) -> Result<()> {
            self.streamed.lock().unwrap().push_str(token);
            Ok(())
        }

        async fn finish_reply(&self, reply: &StreamedReply) -> Result<()> {
            self.finished.lock().unwrap().push(reply.content.clone());
            Ok(())
        }

        async fn ask_user(
            &self,
            _author: &str,
            _prompt: &str,
            _timeout: Duration,
        ) -> Result<Option<String>> {
            Ok(self.answer.clone())
        }
    }

    async fn session_with(chat: Arc<ScriptedChat>, with_index: bool) -> ConversationSession {
        let embedder: Arc<dyn Embedder> = Arc::new(KeywordEmbedder::new());
        let retriever = if with_index {
            let chunks = vec![
                chunk("STORE/it.pdf", "VPN: Öffne FortiClient und melde dich mit deinem SSO-Konto an."),
                chunk("STORE/hr.pdf", "Urlaub beantragst du im HR-Portal."),
            ];
            let index = VectorIndex::build(&chunks, embedder.as_ref())
                .await
                .into_value()
                .unwrap();
            Some(Retriever::new(Arc::new(index), embedder, 1))
        } else {
            None
        };
        let pipeline = RagPipeline::new(
            retriever,
            PromptTemplate::new(DEFAULT_SYSTEM_PROMPT),
            chat,
            "gpt-4-1106-preview",
        );
        ConversationSession::ready(pipeline, "Onki")
    }

    #[test]
    fn template_renders_both_placeholders() {
        let template = PromptTemplate::new("Kontext:{context} Frage: {question}.");
        assert_eq!(template.render("A\n\nB", "Wo?"), "Kontext:A\n\nB Frage: Wo?.");
    }

    #[test]
    fn context_joins_chunks_with_blank_lines() {
        let chunks = vec![chunk("a.pdf", "eins"), chunk("a.pdf", "zwei")];
        assert_eq!(format_context(&chunks), "eins\n\nzwei");
    }

    #[tokio::test]
    async fn retriever_on_empty_index_returns_nothing() {
        let retriever = Retriever::new(
            Arc::new(VectorIndex::new()),
            Arc::new(KeywordEmbedder::new()),
            4,
        );
        assert!(retriever.retrieve("VPN").await.is_empty());
    }

    #[tokio::test]
    async fn vpn_question_puts_matching_chunk_into_the_prompt() {
        let chat = Arc::new(ScriptedChat::new(vec![
            ScriptedChat::tokens(&["Nutze ", "FortiClient."]),
            ScriptedChat::tokens(&[" Onki sagt: ", "Viel Spaß!"]),
        ]));
        let mut session = session_with(chat.clone(), true).await;
        let frontend = RecordingFrontend::default();

        respond("Wie melde ich mich im VPN an?", &mut session, &frontend)
            .await
            .unwrap();

        let requests = chat.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        let grounded = &requests[0].messages[0].content;
        assert!(grounded.contains(
            "VPN: Öffne FortiClient und melde dich mit deinem SSO-Konto an."
        ));
        assert!(grounded.contains("Frage: Wie melde ich mich im VPN an?"));
        assert!(!grounded.contains("Urlaub"));
        assert_eq!(requests[0].settings, GenerationSettings::default());
    }

    #[tokio::test]
    async fn history_entry_matches_streamed_text() {
        let chat = Arc::new(ScriptedChat::new(vec![
            ScriptedChat::tokens(&["Erste ", "Antwort."]),
            ScriptedChat::tokens(&[" Zweite ", "Antwort."]),
        ]));
        let mut session = session_with(chat.clone(), true).await;
        let frontend = RecordingFrontend::default();

        let reply = respond("Wo ist die Kantine?", &mut session, &frontend)
            .await
            .unwrap();

        let streamed = frontend.streamed.lock().unwrap().clone();
        assert_eq!(streamed, "Erste Antwort. Zweite Antwort.");
        assert_eq!(reply.content, streamed);
        assert!(reply.complete);

        let history = session.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[1], ChatMessage::user("Wo ist die Kantine?"));
        assert_eq!(history[2], ChatMessage::assistant(streamed.clone()));
        assert_eq!(frontend.finished.lock().unwrap().as_slice(), &[streamed]);
    }

    #[tokio::test]
    async fn persona_phase_uses_history_and_fixed_settings() {
        let chat = Arc::new(ScriptedChat::new(vec![
            ScriptedChat::tokens(&["a"]),
            ScriptedChat::tokens(&["b"]),
        ]));
        let mut session = session_with(chat.clone(), false).await;
        let frontend = RecordingFrontend::default();

        respond("Hallo", &mut session, &frontend).await.unwrap();

        let requests = chat.requests.lock().unwrap();
        let restyle = &requests[1];
        assert_eq!(restyle.settings, GenerationSettings::persona());
        assert_eq!(restyle.model, "gpt-4-1106-preview");
        assert_eq!(restyle.messages[0], ChatMessage::system(DEFAULT_SYSTEM_PROMPT));
        assert_eq!(restyle.messages[1], ChatMessage::user("Hallo"));
        assert_eq!(restyle.messages.last().unwrap(), &ChatMessage::user("speak as Onki"));
    }

    #[tokio::test]
    async fn without_retrieval_the_context_is_empty() {
        let chat = Arc::new(ScriptedChat::new(vec![
            ScriptedChat::tokens(&["a"]),
            ScriptedChat::tokens(&["b"]),
        ]));
        let mut session = session_with(chat.clone(), false).await;
        let frontend = RecordingFrontend::default();

        respond("VPN?", &mut session, &frontend).await.unwrap();

        let requests = chat.requests.lock().unwrap();
        assert!(requests[0].messages[0].content.contains("Kontext: Frage: VPN?"));
    }

    #[tokio::test]
    async fn generation_errors_abort_the_turn() {
        let chat = Arc::new(ScriptedChat::new(vec![vec![
            Ok("Teil".to_string()),
            Err(anyhow!("connection reset")),
        ]]));
        let mut session = session_with(chat, true).await;
        let frontend = RecordingFrontend::default();

        let result = respond("VPN?", &mut session, &frontend).await;
        assert!(result.is_err());
        assert_eq!(frontend.streamed.lock().unwrap().as_str(), "Teil");
        assert!(session
            .history()
            .iter()
            .all(|m| m.role != crate::models::Role::Assistant));
        assert!(frontend.finished.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_phase_failure_also_aborts() {
        let chat = Arc::new(ScriptedChat::new(vec![ScriptedChat::tokens(&["nur eins"])]));
        let mut session = session_with(chat, false).await;
        let frontend = RecordingFrontend::default();

        tokio_test::assert_err!(respond("Hallo", &mut session, &frontend).await);
        assert_eq!(frontend.streamed.lock().unwrap().as_str(), "nur eins");
    }
}
