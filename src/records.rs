//! Registro persistente de chunks ya indexados (indexación incremental).
//!
//! Cada registro asocia la huella de un chunk con su fichero de origen. El
//! registro se guarda como JSON en disco, agrupado por un `namespace`.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use crate::models::DocumentChunk;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub source: String,
    pub indexed_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RecordFile {
    namespace: String,
    records: BTreeMap<String, IndexRecord>,
}

/// Almacén de registros respaldado por un fichero JSON.
#[derive(Debug)]
pub struct RecordStore {
    path: Option<PathBuf>,
    namespace: String,
    records: BTreeMap<String, IndexRecord>,
}

impl RecordStore {
    /// Abre (o crea vacío) el registro en `path`. Si el fichero pertenece a
    /// otro namespace se empieza con un registro vacío.
    pub fn open(path: &Path, namespace: &str) -> Result<Self> {
        let records = if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("No se pudo leer el registro {}", path.display()))?;
            let file: RecordFile = serde_json::from_str(&raw)
                .with_context(|| format!("Registro corrupto en {}", path.display()))?;
            if file.namespace == namespace {
                file.records
            } else {
                info!(
                    "El registro {} pertenece al namespace '{}'; se ignora.",
                    path.display(),
                    file.namespace
                );
                BTreeMap::new()
            }
        } else {
            BTreeMap::new()
        };

        let store = Self {
            path: Some(path.to_path_buf()),
            namespace: namespace.to_string(),
            records,
        };
        if store.is_empty() {
            info!("Registro de indexación vacío en {}.", path.display());
        }
        Ok(store)
    }

    /// Registro sin fichero asociado.
    pub fn in_memory(namespace: &str) -> Self {
        Self {
            path: None,
            namespace: namespace.to_string(),
            records: BTreeMap::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.records.contains_key(fingerprint)
    }

    /// Inserta o actualiza el registro de una huella.
    pub fn record(&mut self, fingerprint: String, source: &str) {
        self.records.insert(
            fingerprint,
            IndexRecord {
                source: source.to_string(),
                indexed_at: Utc::now(),
            },
        );
    }

    pub fn remove(&mut self, fingerprint: &str) -> Option<IndexRecord> {
        self.records.remove(fingerprint)
    }

    /// Huellas registradas que no figuran en `live`.
    pub fn stale_keys(&self, live: &BTreeSet<String>) -> Vec<String> {
        self.records
            .keys()
            .filter(|key| !live.contains(*key))
            .cloned()
            .collect()
    }

    /// Escribe el registro en disco (no hace nada si es sólo en memoria).
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = RecordFile {
            namespace: self.namespace.clone(),
            records: self.records.clone(),
        };
        let raw = serde_json::to_string_pretty(&file)?;

        // Fichero temporal en el mismo directorio + rename.
        let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        fs::write(&tmp, raw)
            .with_context(|| format!("No se pudo escribir el registro {}", tmp.display()))?;
        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(e)
                .with_context(|| format!("No se pudo reemplazar el registro {}", path.display()));
        }
        Ok(())
    }
}

/// Huella SHA-256 del contenido y la procedencia de un chunk.
pub fn fingerprint(chunk: &DocumentChunk) -> String {
    let mut hasher = Sha256::new();
    hasher.update(chunk.metadata.source.as_bytes());
    hasher.update(chunk.metadata.page.to_le_bytes());
    hasher.update(chunk.metadata.start_index.to_le_bytes());
    hasher.update(chunk.text.as_bytes());
    format!("{:x}", hasher.finalize())
}
