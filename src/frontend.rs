//! Frontera con la interfaz de chat.
//!
//! El núcleo sólo depende de [`ChatFrontend`]. [`EventFrontend`] lo
//! implementa publicando [`UiEvent`]s en un canal que la API web expone
//! como Server-Sent Events. Cada suscripción nueva sustituye a la anterior,
//! de modo que un cliente que recarga la página recupera la sesión.

use std::{sync::Mutex, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::StreamedReply;

#[async_trait]
pub trait ChatFrontend: Send + Sync {
    /// Envía un mensaje completo.
    async fn send_message(&self, author: &str, content: &str) -> Result<()>;

    /// Abre un mensaje vacío que se rellenará en streaming.
    async fn start_reply(&self, reply: &StreamedReply) -> Result<()>;

    async fn stream_token(&self, reply: &StreamedReply, token: &str) -> Result<()>;

    /// Marca el mensaje como terminado con su contenido final.
    async fn finish_reply(&self, reply: &StreamedReply) -> Result<()>;

    /// Pregunta al usuario y espera su respuesta como mucho `timeout`.
    /// `Ok(None)` significa que no hubo respuesta a tiempo.
    async fn ask_user(&self, author: &str, prompt: &str, timeout: Duration)
        -> Result<Option<String>>;
}

/// Capacidad del canal de eventos de una suscripción.
const EVENT_BUFFER: usize = 1024;

/// Identidad visual de la persona.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Avatar {
    pub name: String,
    pub url: String,
}

/// Eventos que recibe el cliente web.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiEvent {
    Message {
        author: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        avatar_url: Option<String>,
    },
    ReplyStarted {
        id: Uuid,
        author: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        avatar_url: Option<String>,
    },
    Token { id: Uuid, token: String },
    ReplyFinished { id: Uuid, content: String },
    Ask { author: String, prompt: String, timeout_secs: u64 },
}

/// Implementación de [`ChatFrontend`] basada en un canal de eventos acotado.
///
/// Los eventos emitidos antes de la primera suscripción quedan en el canal
/// inicial; si el buffer se llena o el cliente se ha desconectado, los
/// eventos se descartan sin interrumpir el turno.
pub struct EventFrontend {
    events: Mutex<mpsc::Sender<UiEvent>>,
    initial: Mutex<Option<mpsc::Receiver<UiEvent>>>,
    pending_answer: Mutex<Option<oneshot::Sender<String>>>,
    avatar: Option<Avatar>,
}

impl EventFrontend {
    pub fn new() -> Self {
        let (events, receiver) = mpsc::channel(EVENT_BUFFER);
        Self {
            events: Mutex::new(events),
            initial: Mutex::new(Some(receiver)),
            pending_answer: Mutex::new(None),
            avatar: None,
        }
    }

    /// Asocia una imagen a los mensajes cuyo autor es `avatar.name`.
    pub fn with_avatar(mut self, avatar: Option<Avatar>) -> Self {
        self.avatar = avatar;
        self
    }

    /// Abre una suscripción a los eventos de la sesión. La primera recibe
    /// lo emitido hasta ahora; las siguientes reemplazan el canal y cierran
    /// el stream del suscriptor anterior.
    pub fn subscribe(&self) -> Result<mpsc::Receiver<UiEvent>> {
        let initial = self
            .initial
            .lock()
            .map_err(|_| anyhow!("Canal de eventos envenenado"))?
            .take();
        if let Some(receiver) = initial {
            return Ok(receiver);
        }

        let (events, receiver) = mpsc::channel(EVENT_BUFFER);
        *self
            .events
            .lock()
            .map_err(|_| anyhow!("Canal de eventos envenenado"))? = events;
        debug!("Nueva suscripción a los eventos de la sesión.");
        Ok(receiver)
    }

    /// Resuelve la pregunta pendiente. Devuelve `false` si no había ninguna.
    pub fn answer(&self, text: String) -> bool {
        let sender = match self.pending_answer.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        match sender {
            Some(sender) => sender.send(text).is_ok(),
            None => false,
        }
    }

    fn emit(&self, event: UiEvent) -> Result<()> {
        let events = self
            .events
            .lock()
            .map_err(|_| anyhow!("Canal de eventos envenenado"))?;
        match events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Buffer de eventos lleno; se descarta un evento.");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Cliente de chat desconectado; evento descartado.");
            }
        }
        Ok(())
    }

    fn avatar_for(&self, author: &str) -> Option<String> {
        self.avatar
            .as_ref()
            .filter(|a| a.name == author)
            .map(|a| a.url.clone())
    }
}

impl Default for EventFrontend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatFrontend for EventFrontend {
    async fn send_message(&self, author: &str, content: &str) -> Result<()> {
        self.emit(UiEvent::Message {
            author: author.to_string(),
            content: content.to_string(),
            avatar_url: self.avatar_for(author),
        })
    }

    async fn start_reply(&self, reply: &StreamedReply) -> Result<()> {
        self.emit(UiEvent::ReplyStarted {
            id: reply.id,
            author: reply.author.clone(),
            avatar_url: self.avatar_for(&reply.author),
        })
    }

    async fn stream_token(&self, reply: &StreamedReply, token: &str) -> Result<()> {
        self.emit(UiEvent::Token {
            id: reply.id,
            token: token.to_string(),
        })
    }

    async fn finish_reply(&self, reply: &StreamedReply) -> Result<()> {
        self.emit(UiEvent::ReplyFinished {
            id: reply.id,
            content: reply.content.clone(),
        })
    }

    async fn ask_user(
        &self,
        author: &str,
        prompt: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        let (tx, rx) = oneshot::channel();
        *self
            .pending_answer
            .lock()
            .map_err(|_| anyhow!("Estado de pregunta pendiente envenenado"))? = Some(tx);

        self.emit(UiEvent::Ask {
            author: author.to_string(),
            prompt: prompt.to_string(),
            timeout_secs: timeout.as_secs(),
        })?;

        let answer = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(text)) => Some(text),
            Ok(Err(_)) => {
                debug!("La pregunta se canceló antes de recibir respuesta.");
                None
            }
            Err(_) => {
                info!("Sin respuesta tras {}s.", timeout.as_secs());
                None
            }
        };

        if let Ok(mut pending) = self.pending_answer.lock() {
            pending.take();
        }
        Ok(answer)
    }
}
