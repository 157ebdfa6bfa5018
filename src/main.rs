// Módulos de la aplicación
mod api;
mod app_state;
mod config;
mod frontend;
mod ingest;
mod llm;
mod models;
mod rag;
mod records;
mod session;
mod splitter;
mod vector_store;

use crate::{app_state::AppState, session::SessionFactory};
use axum::Router;
use std::sync::Arc;
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Cargar configuración
    let cfg = config::AppConfig::from_env().expect("Error al cargar la configuración");

    // 3. Inicializar el cliente de LLMs, compartido por todas las sesiones
    let llm_manager =
        Arc::new(llm::LlmManager::from_config(&cfg).expect("Error inicializando LLM Manager"));
    info!(
        "Cliente LLM inicializado (chat: {}, embeddings: {}).",
        llm_manager.chat_model, llm_manager.embedding_model
    );
    let factory = SessionFactory::new(&cfg, llm_manager.clone(), llm_manager);

    // Crear canal para la señal de apagado.
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    // 4. Crear estado compartido de la aplicación
    let app_state = AppState::new(cfg, factory, shutdown_tx);

    // 5. Configurar el router de la API
    let app = Router::new()
        .merge(api::create_router(app_state.clone()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // 6. Iniciar el servidor
    let server_addr = &app_state.config.server_addr;
    let listener = tokio::net::TcpListener::bind(server_addr)
        .await
        .expect("No se pudo abrir la dirección del servidor");
    info!("🚀 Servidor escuchando en http://{}", server_addr);

    // Configurar el apagado ordenado.
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await
        .expect("Error en el servidor");

    info!("✅ Servidor cerrado correctamente.");
}
