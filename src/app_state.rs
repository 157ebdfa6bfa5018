use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::{
    config::AppConfig,
    frontend::{Avatar, EventFrontend},
    session::{SessionFactory, SessionState},
};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub factory: SessionFactory,
    pub sessions: Arc<Mutex<HashMap<Uuid, Arc<SessionSlot>>>>,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl AppState {
    pub fn new(config: AppConfig, factory: SessionFactory, shutdown: oneshot::Sender<()>) -> Self {
        Self {
            config,
            factory,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            shutdown_sender: Arc::new(Mutex::new(Some(shutdown))),
        }
    }

    pub fn session(&self, id: &Uuid) -> Option<Arc<SessionSlot>> {
        self.sessions.lock().ok()?.get(id).cloned()
    }
}

/// Una sesión de usuario: su canal con el cliente y su estado.
/// El mutex asíncrono serializa los turnos de una misma sesión.
pub struct SessionSlot {
    pub frontend: Arc<EventFrontend>,
    pub state: Arc<tokio::sync::Mutex<SessionState>>,
}

impl SessionSlot {
    pub fn new(avatar: Option<Avatar>) -> Self {
        Self {
            frontend: Arc::new(EventFrontend::new().with_avatar(avatar)),
            state: Arc::new(tokio::sync::Mutex::new(SessionState::Uninitialized)),
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Status {
    pub message: String,
    pub active_sessions: usize,
}
