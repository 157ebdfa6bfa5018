//! Índice vectorial en memoria para los chunks de una sesión.
//!
//! API pública:
//!   - `VectorIndex::build(chunks, embedder)`
//!   - `VectorIndex::upsert_incremental(chunks, embedder, records)`
//!   - `VectorIndex::search(query_vec, top_k)`.

use std::collections::{BTreeSet, HashMap};

use anyhow::{anyhow, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    llm::Embedder,
    models::{DocumentChunk, StageOutcome},
    records::{fingerprint, RecordStore},
};

/// Tamaño de lote para las peticiones de embeddings.
const EMBED_BATCH_SIZE: usize = 64;

/// Chunk almacenado junto con su vector.
#[derive(Debug, Clone)]
pub struct IndexedChunk {
    pub fingerprint: String,
    pub chunk: DocumentChunk,
    pub embedding: Vec<f64>,
}

/// Recuento de una pasada de indexación incremental.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexingSummary {
    pub added: usize,
    pub skipped: usize,
    pub removed: usize,
}

impl std::fmt::Display for IndexingSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{added: {}, skipped: {}, removed: {}}}",
            self.added, self.skipped, self.removed
        )
    }
}

#[derive(Debug, Default)]
pub struct VectorIndex {
    entries: Vec<IndexedChunk>,
    positions: HashMap<String, usize>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calcula los embeddings de todos los chunks y construye un índice nuevo.
    pub async fn build(chunks: &[DocumentChunk], embedder: &dyn Embedder) -> StageOutcome<Self> {
        let mut index = Self::new();
        match index.insert_embedded(chunks, embedder).await {
            Ok(inserted) => {
                info!("Índice vectorial construido con {inserted} chunks.");
                StageOutcome::Complete(index)
            }
            Err(e) => {
                warn!("Error construyendo el índice vectorial: {e}");
                StageOutcome::Failed(format!("Error construyendo el índice vectorial: {e}"))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.positions.contains_key(fingerprint)
    }

    /// Fuentes distintas presentes en el índice.
    pub fn sources(&self) -> BTreeSet<String> {
        self.entries
            .iter()
            .map(|e| e.chunk.metadata.source.clone())
            .collect()
    }

    /// Sincroniza el índice con `chunks` usando el registro persistente:
    /// omite lo ya registrado, añade lo nuevo y elimina lo que ya no existe.
    pub async fn upsert_incremental(
        &mut self,
        chunks: &[DocumentChunk],
        embedder: &dyn Embedder,
        records: &mut RecordStore,
    ) -> Result<IndexingSummary> {
        let mut summary = IndexingSummary::default();
        let mut live = BTreeSet::new();
        let mut pending: Vec<DocumentChunk> = Vec::new();

        for chunk in chunks {
            let fp = fingerprint(chunk);
            if !live.insert(fp.clone()) {
                continue;
            }
            if records.contains(&fp) && self.contains(&fp) {
                summary.skipped += 1;
                continue;
            }
            if !self.contains(&fp) {
                pending.push(chunk.clone());
            }
            records.record(fp, &chunk.metadata.source);
            summary.added += 1;
        }

        self.insert_embedded(&pending, embedder).await?;

        for stale in records.stale_keys(&live) {
            records.remove(&stale);
            if self.remove(&stale) {
                summary.removed += 1;
            }
        }
        // Entradas del índice que ya no corresponden a ningún chunk vivo.
        let orphaned: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !live.contains(&e.fingerprint))
            .map(|e| e.fingerprint.clone())
            .collect();
        for fp in orphaned {
            if self.remove(&fp) {
                summary.removed += 1;
            }
        }

        records.save()?;
        info!(
            "Indexación incremental ({}): {summary}, {} registros.",
            records.namespace(),
            records.len()
        );
        Ok(summary)
    }

    /// Los `top_k` chunks más similares (coseno) a `query`, de mayor a menor.
    pub fn search(&self, query: &[f64], top_k: usize) -> Vec<(f64, DocumentChunk)> {
        let mut scored: Vec<(f64, &IndexedChunk)> = self
            .entries
            .iter()
            .map(|e| (cosine_similarity(query, &e.embedding), e))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored
            .into_iter()
            .take(top_k)
            .map(|(score, e)| (score, e.chunk.clone()))
            .collect()
    }

    async fn insert_embedded(
        &mut self,
        chunks: &[DocumentChunk],
        embedder: &dyn Embedder,
    ) -> Result<usize> {
        let mut inserted = 0;
        for batch in chunks.chunks(EMBED_BATCH_SIZE) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = embedder.embed(texts).await?;
            if vectors.len() != batch.len() {
                return Err(anyhow!(
                    "Número de embeddings ({}) distinto al número de chunks ({})",
                    vectors.len(),
                    batch.len()
                ));
            }
            for (chunk, embedding) in batch.iter().zip(vectors) {
                if self.insert(chunk.clone(), embedding) {
                    inserted += 1;
                }
            }
        }
        Ok(inserted)
    }

    fn insert(&mut self, chunk: DocumentChunk, embedding: Vec<f64>) -> bool {
        let fp = fingerprint(&chunk);
        if self.positions.contains_key(&fp) {
            return false;
        }
        self.positions.insert(fp.clone(), self.entries.len());
        self.entries.push(IndexedChunk {
            fingerprint: fp,
            chunk,
            embedding,
        });
        true
    }

    fn remove(&mut self, fingerprint: &str) -> bool {
        let Some(pos) = self.positions.remove(fingerprint) else {
            return false;
        };
        self.entries.swap_remove(pos);
        if let Some(moved) = self.entries.get(pos) {
            self.positions.insert(moved.fingerprint.clone(), pos);
        }
        true
    }
}

fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a < f64::EPSILON || norm_b < f64::EPSILON {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::ChunkMetadata;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Embedder determinista: cuenta apariciones de palabras clave.
    pub(crate) struct KeywordEmbedder {
        pub calls: AtomicUsize,
        pub embedded: AtomicUsize,
    }

    const KEYWORDS: [&str; 4] = ["vpn", "urlaub", "kantine", "laptop"];

    impl KeywordEmbedder {
        pub(crate) fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                embedded: AtomicUsize::new(0),
            }
        }

        pub(crate) fn vector_for(text: &str) -> Vec<f64> {
            let lower = text.to_lowercase();
            let mut v: Vec<f64> = KEYWORDS
                .iter()
                .map(|k| lower.matches(k).count() as f64)
                .collect();
            v.push(0.01);
            v
        }
    }

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f64>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.embedded.fetch_add(texts.len(), Ordering::SeqCst);
            Ok(texts.iter().map(|t| Self::vector_for(t)).collect())
        }
    }

    struct BrokenEmbedder;

    #[async_trait]
    impl Embedder for BrokenEmbedder {
        async fn embed(&self, _texts: Vec<String>) -> Result<Vec<Vec<f64>>> {
            Err(anyhow!("401 Unauthorized"))
        }
    }

    pub(crate) fn chunk(source: &str, text: &str) -> DocumentChunk {
        DocumentChunk::new(
            text.to_string(),
            ChunkMetadata {
                source: source.to_string(),
                page: 1,
                total_pages: 1,
                start_index: 0,
            },
        )
    }

    fn corpus() -> Vec<DocumentChunk> {
        vec![
            chunk("STORE/it.pdf", "Das VPN startest du über den Client, VPN Login mit SSO."),
            chunk("STORE/it.pdf", "Dein Laptop wird am ersten Tag ausgegeben."),
            chunk("STORE/hr.pdf", "Urlaub beantragst du im HR-Portal."),
            chunk("STORE/hr.pdf", "Die Kantine öffnet um 11:30."),
        ]
    }

    #[tokio::test]
    async fn build_then_search_ranks_by_similarity() {
        let embedder = KeywordEmbedder::new();
        let index = VectorIndex::build(&corpus(), &embedder).await.into_value().unwrap();
        assert_eq!(index.len(), 4);

        let query = KeywordEmbedder::vector_for("Wie melde ich mich im VPN an?");
        let hits = index.search(&query, 2);
        assert_eq!(hits.len(), 2);
        assert!(hits[0].1.text.contains("VPN"));
        assert!(hits[0].0 >= hits[1].0);
    }

    #[tokio::test]
    async fn embedding_failures_fail_the_build() {
        let outcome = VectorIndex::build(&corpus(), &BrokenEmbedder).await;
        assert!(outcome.is_failed());
    }

    #[tokio::test]
    async fn incremental_indexing_is_idempotent() {
        let embedder = KeywordEmbedder::new();
        let chunks = corpus();
        let mut records = RecordStore::in_memory("docs");
        let mut index = VectorIndex::build(&chunks, &embedder).await.into_value().unwrap();
        let embedded_after_build = embedder.embedded.load(Ordering::SeqCst);

        let first = index.upsert_incremental(&chunks, &embedder, &mut records).await.unwrap();
        assert_eq!(first, IndexingSummary { added: 4, skipped: 0, removed: 0 });
        // El build ya calculó los vectores: registrar no vuelve a embeber.
        assert_eq!(embedder.embedded.load(Ordering::SeqCst), embedded_after_build);

        let second = index.upsert_incremental(&chunks, &embedder, &mut records).await.unwrap();
        assert_eq!(second, IndexingSummary { added: 0, skipped: 4, removed: 0 });
        assert_eq!(index.len(), 4);
        assert_eq!(records.len(), 4);
    }

    #[tokio::test]
    async fn removed_sources_disappear_from_the_index() {
        let embedder = KeywordEmbedder::new();
        let chunks = corpus();
        let mut records = RecordStore::in_memory("docs");
        let mut index = VectorIndex::new();
        index.upsert_incremental(&chunks, &embedder, &mut records).await.unwrap();
        assert_eq!(index.len(), 4);

        let remaining: Vec<DocumentChunk> = chunks
            .into_iter()
            .filter(|c| c.metadata.source == "STORE/it.pdf")
            .collect();
        let summary = index.upsert_incremental(&remaining, &embedder, &mut records).await.unwrap();

        assert_eq!(summary.removed, 2);
        assert_eq!(summary.skipped, 2);
        assert_eq!(index.len(), 2);
        assert_eq!(index.sources(), BTreeSet::from(["STORE/it.pdf".to_string()]));
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn records_from_a_previous_run_are_reembedded_into_a_fresh_index() {
        let embedder = KeywordEmbedder::new();
        let chunks = corpus();
        let mut records = RecordStore::in_memory("docs");
        for c in &chunks {
            records.record(fingerprint(c), &c.metadata.source);
        }

        let mut index = VectorIndex::new();
        let summary = index.upsert_incremental(&chunks, &embedder, &mut records).await.unwrap();
        assert_eq!(summary.added, 4);
        assert_eq!(index.len(), 4);
    }

    #[test]
    fn empty_index_returns_nothing() {
        let index = VectorIndex::new();
        assert!(index.search(&[1.0, 0.0], 4).is_empty());
    }

    #[test]
    fn cosine_handles_degenerate_vectors() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 1.0], &[2.0, 2.0]) - 1.0).abs() < 1e-9);
    }
}
