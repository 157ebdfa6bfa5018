//! Ingesta de un directorio de PDFs: extracción de texto por página y
//! troceado con solapamiento en [`DocumentChunk`]s.

use std::{
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Result};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::{
    models::{ChunkMetadata, DocumentChunk, StageOutcome},
    splitter::TextSplitter,
};

/// Resumen de los resultados de una operación de ingesta.
#[derive(Debug, Default, Clone)]
pub struct IngestionSummary {
    pub files_scanned: u32,
    pub files_ingested: u32,
    pub files_skipped: u32,
    pub chunks_created: usize,
}

impl std::fmt::Display for IngestionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Resumen: {} PDFs encontrados, {} ingeridos, {} omitidos. {} chunks creados.",
            self.files_scanned, self.files_ingested, self.files_skipped, self.chunks_created
        )
    }
}

/// Lee todos los PDFs de `root` (sin recursión) y los divide en chunks.
///
/// Nunca devuelve error: un directorio inexistente, la ausencia de PDFs o un
/// resultado vacío producen [`StageOutcome::Failed`]; los ficheros que no se
/// pueden cargar se omiten y quedan como incidencias en `Degraded`.
pub fn ingest_directory(root: &Path, splitter: &TextSplitter) -> StageOutcome<Vec<DocumentChunk>> {
    ingest_directory_with(root, splitter, load_pdf_pages)
}

/// Variante de [`ingest_directory`] con un cargador de páginas inyectable.
pub fn ingest_directory_with<L>(
    root: &Path,
    splitter: &TextSplitter,
    load_pages: L,
) -> StageOutcome<Vec<DocumentChunk>>
where
    L: Fn(&Path) -> Result<Vec<String>>,
{
    if !root.is_dir() {
        warn!("El directorio {} no existe.", root.display());
        return StageOutcome::Failed(format!("El directorio {} no existe", root.display()));
    }

    let pdf_files = list_pdf_files(root);
    if pdf_files.is_empty() {
        warn!("No se encontraron PDFs en el directorio: {}", root.display());
        return StageOutcome::Failed(format!(
            "No se encontraron PDFs en el directorio {}",
            root.display()
        ));
    }

    let mut summary = IngestionSummary::default();
    let mut chunks = Vec::new();
    let mut issues = Vec::new();

    for path in &pdf_files {
        summary.files_scanned += 1;
        info!("Cargando PDF: {}", path.display());

        let pages = match load_guarded(&load_pages, path) {
            Ok(pages) => pages,
            Err(e) => {
                warn!("No se pudo extraer texto del PDF {}: {}. Saltando fichero.", path.display(), e);
                summary.files_skipped += 1;
                issues.push(format!("{}: {e}", path.display()));
                continue;
            }
        };

        let file_chunks = chunk_pages(&path.to_string_lossy(), &pages, splitter);
        if file_chunks.is_empty() {
            warn!("Fichero vacío o sin texto útil: {}", path.display());
            summary.files_skipped += 1;
            issues.push(format!("{}: sin texto utilizable", path.display()));
            continue;
        }

        summary.files_ingested += 1;
        summary.chunks_created += file_chunks.len();
        chunks.extend(file_chunks);
    }

    if chunks.is_empty() {
        warn!("No hay documentos disponibles para crear los embeddings.");
        return StageOutcome::Failed("No hay documentos disponibles para indexar".to_string());
    }

    info!("{summary}");
    StageOutcome::from_parts(chunks, issues)
}

/// Divide el texto de cada página y adjunta los metadatos de procedencia.
pub fn chunk_pages(source: &str, pages: &[String], splitter: &TextSplitter) -> Vec<DocumentChunk> {
    let total_pages = pages.len();
    pages
        .iter()
        .enumerate()
        .flat_map(|(idx, page)| {
            splitter
                .split_with_offsets(page)
                .into_iter()
                .map(move |(start_index, text)| {
                    DocumentChunk::new(
                        text,
                        ChunkMetadata {
                            source: source.to_string(),
                            page: idx + 1,
                            total_pages,
                            start_index,
                        },
                    )
                })
        })
        .collect()
}

/// PDFs directamente contenidos en `root`, en orden lexicográfico de ruta.
fn list_pdf_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension()
                .and_then(std::ffi::OsStr::to_str)
                .map(|ext| ext.eq_ignore_ascii_case("pdf"))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    files
}

/// Ejecuta el cargador convirtiendo un pánico en un error de ese fichero.
/// `pdf_extract` entra en pánico con algunos PDFs mal formados.
fn load_guarded<L>(load_pages: &L, path: &Path) -> Result<Vec<String>>
where
    L: Fn(&Path) -> Result<Vec<String>>,
{
    panic::catch_unwind(AssertUnwindSafe(|| load_pages(path))).unwrap_or_else(|payload| {
        let reason = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "pánico sin mensaje".to_string());
        Err(anyhow!("el extractor de PDF falló: {reason}"))
    })
}

fn load_pdf_pages(path: &Path) -> Result<Vec<String>> {
    pdf_extract::extract_text_by_pages(path).map_err(|e| anyhow!("{e}"))
}
