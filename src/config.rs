//! Carga y gestión de configuración de la aplicación (OpenAI + documentos + sesión).

use std::{env, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{anyhow, Result};

use crate::frontend::Avatar;

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub server_addr: String,

    pub pdf_storage_path: PathBuf,
    pub chunk_size: usize,
    pub chunk_overlap: usize,

    pub record_store_path: PathBuf,
    pub record_namespace: String,

    pub llm_embedding_model: String,
    pub llm_chat_model: String,
    pub retrieval_top_k: usize,

    pub persona_name: String,
    pub persona_avatar_url: Option<String>,
    pub name_prompt_timeout: Duration,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Construye la configuración a partir de una función de búsqueda de claves.
    pub fn from_vars<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let openai_api_key = lookup("OPENAI_API_KEY")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| anyhow!("Falta OPENAI_API_KEY en el entorno"))?;

        let openai_base_url = lookup("OPENAI_BASE_URL")
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        let server_addr = lookup("SERVER_ADDR").unwrap_or_else(|| "127.0.0.1:3322".to_string());

        let pdf_storage_path =
            PathBuf::from(lookup("PDF_STORAGE_PATH").unwrap_or_else(|| "./STORE".to_string()));
        let chunk_size = parse_or(&lookup, "CHUNK_SIZE", 2048)?;
        let chunk_overlap = parse_or(&lookup, "CHUNK_OVERLAP", 100)?;
        if chunk_overlap >= chunk_size {
            return Err(anyhow!(
                "CHUNK_OVERLAP ({chunk_overlap}) debe ser menor que CHUNK_SIZE ({chunk_size})"
            ));
        }

        let record_store_path = PathBuf::from(
            lookup("RECORD_STORE_PATH").unwrap_or_else(|| "./record_manager_cache.json".to_string()),
        );
        let record_namespace =
            lookup("RECORD_NAMESPACE").unwrap_or_else(|| "vectorindex/my_documents".to_string());

        let llm_embedding_model = lookup("LLM_EMBEDDING_MODEL")
            .unwrap_or_else(|| "text-embedding-3-small".to_string());
        let llm_chat_model =
            lookup("LLM_CHAT_MODEL").unwrap_or_else(|| "gpt-4-1106-preview".to_string());
        let retrieval_top_k = parse_or(&lookup, "RETRIEVAL_TOP_K", 4)?;

        let persona_name = lookup("PERSONA_NAME").unwrap_or_else(|| "Onki".to_string());
        let persona_avatar_url = lookup("PERSONA_AVATAR_URL").filter(|v| !v.trim().is_empty());
        let name_prompt_timeout =
            Duration::from_secs(parse_or(&lookup, "NAME_PROMPT_TIMEOUT_SECS", 30)?);

        Ok(Self {
            openai_api_key,
            openai_base_url,
            server_addr,
            pdf_storage_path,
            chunk_size,
            chunk_overlap,
            record_store_path,
            record_namespace,
            llm_embedding_model,
            llm_chat_model,
            retrieval_top_k,
            persona_name,
            persona_avatar_url,
            name_prompt_timeout,
        })
    }

    /// Avatar de la persona, si se ha configurado una imagen.
    pub fn persona_avatar(&self) -> Option<Avatar> {
        self.persona_avatar_url.as_ref().map(|url| Avatar {
            name: self.persona_name.clone(),
            url: url.clone(),
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow!("Valor no válido para {key}: '{raw}'")),
        None => Ok(default),
    }
}
