//! Sesiones de conversación: estado tipado por usuario y su arranque.
//!
//! Arranque de una sesión:
//!   1. Ingesta de los PDFs y construcción del índice vectorial propio.
//!   2. Indexación incremental contra el registro persistente.
//!   3. Prompt del sistema fijo y tubería RAG.
//!   4. Pregunta del nombre al usuario (con tiempo límite).

use std::{path::PathBuf, sync::Arc, time::Duration};

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    config::AppConfig,
    frontend::ChatFrontend,
    ingest,
    llm::{ChatModel, Embedder},
    models::{ChatMessage, StageOutcome},
    rag::{PromptTemplate, RagPipeline, Retriever},
    records::RecordStore,
    splitter::TextSplitter,
    vector_store::VectorIndex,
};

pub const DEFAULT_SYSTEM_PROMPT: &str = "Dein Name ist Onki und du bist humorvoll und machst gelegentliche witze, als Onboarding-Assistent und technisches Genie bei MetallicaTech GmbH, ist es deine Aufgabe, neue Teammitglieder durch ihren Einstieg zu führen. Basierend auf dem folgenden Kontext:{context} Frage: {question}. Antworte präzise und vermeide lange Texte";

/// Estado de una sesión: sólo existe la transición `Uninitialized → Ready`.
#[derive(Default)]
pub enum SessionState {
    #[default]
    Uninitialized,
    Ready(Box<ConversationSession>),
}

impl SessionState {
    pub fn session_mut(&mut self) -> Option<&mut ConversationSession> {
        match self {
            Self::Ready(session) => Some(session.as_mut()),
            Self::Uninitialized => None,
        }
    }
}

/// Estado de conversación de un usuario. No se persiste.
pub struct ConversationSession {
    id: Uuid,
    history: Vec<ChatMessage>,
    pipeline: RagPipeline,
    persona: String,
    user_name: Option<String>,
}

impl ConversationSession {
    /// Crea una sesión lista con el prompt del sistema como primera entrada.
    pub fn ready(pipeline: RagPipeline, persona: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            history: vec![ChatMessage::system(pipeline.system_prompt())],
            pipeline,
            persona: persona.to_string(),
            user_name: None,
        }
    }

    /// Sustituye el identificador generado por uno asignado desde fuera.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn push_message(&mut self, message: ChatMessage) {
        self.history.push(message);
    }

    pub fn pipeline(&self) -> &RagPipeline {
        &self.pipeline
    }

    pub fn persona(&self) -> &str {
        &self.persona
    }

    pub fn user_name(&self) -> Option<&str> {
        self.user_name.as_deref()
    }

    pub fn set_user_name(&mut self, name: impl Into<String>) {
        self.user_name = Some(name.into());
    }
}

/// Construye sesiones a partir de la configuración y los clientes compartidos.
#[derive(Clone)]
pub struct SessionFactory {
    pdf_storage_path: PathBuf,
    chunk_size: usize,
    chunk_overlap: usize,
    record_store_path: PathBuf,
    record_namespace: String,
    chat_model: String,
    top_k: usize,
    persona: String,
    name_prompt_timeout: Duration,
    embedder: Arc<dyn Embedder>,
    chat: Arc<dyn ChatModel>,
}

impl SessionFactory {
    pub fn new(cfg: &AppConfig, embedder: Arc<dyn Embedder>, chat: Arc<dyn ChatModel>) -> Self {
        Self {
            pdf_storage_path: cfg.pdf_storage_path.clone(),
            chunk_size: cfg.chunk_size,
            chunk_overlap: cfg.chunk_overlap,
            record_store_path: cfg.record_store_path.clone(),
            record_namespace: cfg.record_namespace.clone(),
            chat_model: cfg.llm_chat_model.clone(),
            top_k: cfg.retrieval_top_k,
            persona: cfg.persona_name.clone(),
            name_prompt_timeout: cfg.name_prompt_timeout,
            embedder,
            chat,
        }
    }

    /// Ingesta + índice + indexación incremental.
    ///
    /// Los fallos de la indexación incremental degradan el resultado pero
    /// conservan el índice ya construido.
    pub async fn prepare_index(&self) -> StageOutcome<VectorIndex> {
        let splitter = match TextSplitter::new(self.chunk_size, self.chunk_overlap) {
            Ok(splitter) => splitter,
            Err(e) => return StageOutcome::Failed(e.to_string()),
        };

        let root = self.pdf_storage_path.clone();
        let ingested = match tokio::task::spawn_blocking(move || {
            ingest::ingest_directory(&root, &splitter)
        })
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => return StageOutcome::Failed(format!("La ingesta se interrumpió: {e}")),
        };

        let mut issues = ingested.issues();
        let Some(chunks) = ingested.into_value() else {
            return StageOutcome::Failed(issues.join("; "));
        };

        let built = VectorIndex::build(&chunks, self.embedder.as_ref()).await;
        issues.extend(built.issues());
        let Some(mut index) = built.into_value() else {
            return StageOutcome::Failed(issues.join("; "));
        };

        let indexing = async {
            let mut records = RecordStore::open(&self.record_store_path, &self.record_namespace)?;
            index
                .upsert_incremental(&chunks, self.embedder.as_ref(), &mut records)
                .await
        };
        match indexing.await {
            Ok(summary) => info!("Resultado de la indexación: {summary}"),
            Err(e) => {
                error!("Error en el registro o en la indexación incremental: {e}");
                issues.push(format!("Indexación incremental: {e}"));
            }
        }

        info!(
            "Índice vectorial listo: {} chunks de {} documentos.",
            index.len(),
            index.sources().len()
        );
        StageOutcome::from_parts(index, issues)
    }

    /// Lleva una sesión nueva al estado `Ready` y pregunta el nombre al usuario.
    pub async fn start_session(&self, id: Uuid, frontend: &dyn ChatFrontend) -> ConversationSession {
        let retriever = match self.prepare_index().await {
            StageOutcome::Complete(index) => Some(index),
            StageOutcome::Degraded { value, issues } => {
                warn!("Índice disponible con incidencias: {}", issues.join("; "));
                Some(value)
            }
            StageOutcome::Failed(reason) => {
                warn!("La inicialización del índice falló, la sesión seguirá sin contexto: {reason}");
                None
            }
        }
        .map(|index| Retriever::new(Arc::new(index), self.embedder.clone(), self.top_k));

        let pipeline = RagPipeline::new(
            retriever,
            PromptTemplate::new(DEFAULT_SYSTEM_PROMPT),
            self.chat.clone(),
            self.chat_model.clone(),
        );
        let mut session = ConversationSession::ready(pipeline, &self.persona).with_id(id);
        info!(
            "Sesión {} lista (recuperación activa: {}).",
            session.id(),
            session.pipeline().has_retrieval()
        );

        if let Some(name) = self.prompt_for_user_name(frontend).await {
            session.set_user_name(name);
        }
        if let Some(name) = session.user_name() {
            let greeting = format!(
                "Willkommen an Bord, {name}! Es ist toll, dich hier zu haben. Wenn du Fragen hast oder Hilfe beim Einstieg benötigst, zögere nicht, mich zu fragen."
            );
            if let Err(e) = frontend.send_message(&self.persona, &greeting).await {
                warn!("No se pudo enviar el saludo: {e}");
            }
        }

        session
    }

    async fn prompt_for_user_name(&self, frontend: &dyn ChatFrontend) -> Option<String> {
        let prompt = format!(
            "Hallo, ich bin {}, dein Onboarding-Assistent. Wie heißt du?",
            self.persona
        );
        match frontend
            .ask_user(&self.persona, &prompt, self.name_prompt_timeout)
            .await
        {
            Ok(Some(answer)) if !answer.trim().is_empty() => {
                let name = answer.trim().to_string();
                info!("Nombre guardado: {name}");
                Some(name)
            }
            Ok(_) => None,
            Err(e) => {
                warn!("Error al preguntar el nombre: {e}");
                None
            }
        }
    }
}
