//! Índice vectorial en proceso para los chunks de documentos.
//!
//! API pública:
//!   - `VectorIndex::build` / `add` (embeddings por lotes acotados)
//!   - `VectorIndex::search` (vecinos más cercanos con filtro de acceso)
//!   - `VectorIndex::persist` / `load` (blob JSON opaco y versionado)

use std::cmp::Ordering;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::PipelineError;
use crate::llm::LlmManager;
use crate::models::{AccessLevel, DocumentChunk};

/// Tamaño de lote para el cálculo de embeddings durante la construcción.
pub const EMBED_BATCH_SIZE: usize = 500;

const INDEX_FORMAT_VERSION: u32 = 1;

/// Entrada del índice: embedding + chunk. Nunca se expone fuera de los
/// resultados de búsqueda (sólo sale el chunk).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    embedding: Vec<f64>,
    chunk: DocumentChunk,
}

/// Envoltorio persistido. El nombre del modelo de embeddings guarda la
/// dimensionalidad: un índice construido con otro modelo se descarta y se
/// reconstruye en lugar de mezclar dimensionalidades.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedIndex {
    version: u32,
    embedding_model: String,
    entries: Vec<IndexEntry>,
}

#[derive(Debug)]
pub struct VectorIndex {
    entries: Vec<IndexEntry>,
    embedding_model: String,
}

impl VectorIndex {
    pub fn new(embedding_model: &str) -> Self {
        Self {
            entries: Vec::new(),
            embedding_model: embedding_model.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Construye un índice nuevo embebiendo los chunks por lotes. Los lotes
    /// se añaden directamente al almacén vivo; el índice no se expone a
    /// consultas hasta que el coordinador lo publica.
    pub async fn build(llm: &LlmManager, chunks: Vec<DocumentChunk>) -> Result<Self> {
        let mut index = Self::new(llm.embedding_model());
        index.add(llm, chunks).await?;
        Ok(index)
    }

    /// Añade chunks a un índice existente, en lotes de `EMBED_BATCH_SIZE`.
    pub async fn add(&mut self, llm: &LlmManager, chunks: Vec<DocumentChunk>) -> Result<()> {
        let total = self.entries.len() + chunks.len();
        for batch in chunks.chunks(EMBED_BATCH_SIZE) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = llm.embed_texts(texts).await?;
            for (chunk, embedding) in batch.iter().zip(vectors) {
                self.entries.push(IndexEntry {
                    embedding,
                    chunk: chunk.clone(),
                });
            }
            info!("Indexados {}/{} chunks.", self.entries.len(), total);
        }
        Ok(())
    }

    /// Embebe la consulta y devuelve los `k` chunks más cercanos que pasan
    /// el filtro de acceso.
    pub async fn search(
        &self,
        llm: &LlmManager,
        query: &str,
        k: usize,
        public_only: bool,
    ) -> Result<Vec<DocumentChunk>> {
        let mut vectors = llm.embed_texts(vec![query.to_string()]).await?;
        let query_vec = vectors
            .pop()
            .ok_or_else(|| anyhow!("No se pudo generar el embedding de la consulta"))?;
        Ok(self.rank(&query_vec, k, public_only))
    }

    /// Ranking por similitud coseno. El filtro de acceso se aplica ANTES de
    /// la selección top-k: un usuario público nunca recibe menos de `k`
    /// resultados por culpa de vecinos restringidos mejor puntuados. A
    /// igualdad de similitud desempata el orden de inserción.
    pub fn rank(&self, query_vec: &[f64], k: usize, public_only: bool) -> Vec<DocumentChunk> {
        let mut scored: Vec<(f64, usize)> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| {
                !public_only || entry.chunk.access_level == AccessLevel::Public
            })
            .map(|(idx, entry)| (cosine_similarity(query_vec, &entry.embedding), idx))
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then(a.1.cmp(&b.1))
        });

        scored
            .into_iter()
            .take(k)
            .map(|(_, idx)| self.entries[idx].chunk.clone())
            .collect()
    }

    /// Serializa el conjunto completo de entradas.
    pub fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let state = PersistedIndex {
            version: INDEX_FORMAT_VERSION,
            embedding_model: self.embedding_model.clone(),
            entries: self.entries.clone(),
        };
        fs::write(path, serde_json::to_string(&state)?)?;
        info!(
            "Índice persistido en {} ({} entradas).",
            path.display(),
            self.entries.len()
        );
        Ok(())
    }

    /// Intenta cargar un índice persistido. Cualquier fallo (fichero
    /// ausente, corrupto o construido con otro modelo de embeddings) se
    /// traduce en `None`: "no hay índice", lo que dispara una
    /// reconstrucción desde cero.
    pub fn load(path: &Path, expected_model: &str) -> Option<Self> {
        if !path.exists() {
            info!("No hay índice persistido en {}.", path.display());
            return None;
        }
        match Self::try_load(path, expected_model) {
            Ok(index) => {
                info!(
                    "Índice cargado de {} ({} entradas).",
                    path.display(),
                    index.entries.len()
                );
                Some(index)
            }
            Err(err) => {
                warn!("{}", PipelineError::IndexLoad(err.to_string()));
                None
            }
        }
    }

    fn try_load(path: &Path, expected_model: &str) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        let state: PersistedIndex = serde_json::from_str(&data)?;
        if state.version != INDEX_FORMAT_VERSION {
            return Err(anyhow!("versión de formato desconocida: {}", state.version));
        }
        if state.embedding_model != expected_model {
            return Err(anyhow!(
                "el índice fue construido con '{}' y el modelo actual es '{}'",
                state.embedding_model,
                expected_model
            ));
        }
        Ok(Self {
            entries: state.entries,
            embedding_model: state.embedding_model,
        })
    }
}

fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str, access_level: AccessLevel) -> DocumentChunk {
        DocumentChunk {
            text: text.to_string(),
            source_name: "prueba.pdf".to_string(),
            access_level,
        }
    }

    fn index_with(entries: Vec<(Vec<f64>, DocumentChunk)>) -> VectorIndex {
        let mut index = VectorIndex::new("modelo-prueba");
        for (embedding, chunk) in entries {
            index.entries.push(IndexEntry { embedding, chunk });
        }
        index
    }

    #[test]
    fn filtro_de_acceso_antes_del_top_k() {
        // Los chunks de asesor están MÁS cerca de la consulta que los
        // públicos; aun así un usuario público recibe k resultados públicos.
        let index = index_with(vec![
            (vec![1.0, 0.0], chunk("interno 1", AccessLevel::Advisor)),
            (vec![0.99, 0.01], chunk("interno 2", AccessLevel::Advisor)),
            (vec![0.5, 0.5], chunk("público 1", AccessLevel::Public)),
            (vec![0.2, 0.8], chunk("público 2", AccessLevel::Public)),
        ]);

        let query = vec![1.0, 0.0];
        let results = index.rank(&query, 2, true);

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|c| c.access_level == AccessLevel::Public));
        assert_eq!(results[0].text, "público 1");
        assert_eq!(results[1].text, "público 2");
    }

    #[test]
    fn asesor_ve_todo_sin_filtro() {
        let index = index_with(vec![
            (vec![1.0, 0.0], chunk("interno", AccessLevel::Advisor)),
            (vec![0.5, 0.5], chunk("público", AccessLevel::Public)),
        ]);

        let results = index.rank(&[1.0, 0.0], 2, false);
        assert_eq!(results[0].text, "interno");
        assert_eq!(results[1].text, "público");
    }

    #[test]
    fn desempate_estable_por_orden_de_insercion() {
        let index = index_with(vec![
            (vec![1.0, 0.0], chunk("primero", AccessLevel::Public)),
            (vec![1.0, 0.0], chunk("segundo", AccessLevel::Public)),
            (vec![1.0, 0.0], chunk("tercero", AccessLevel::Public)),
        ]);

        let results = index.rank(&[1.0, 0.0], 3, true);
        let texts: Vec<&str> = results.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["primero", "segundo", "tercero"]);
    }

    #[test]
    fn indice_vacio_devuelve_cero_resultados() {
        let index = VectorIndex::new("modelo-prueba");
        assert!(index.rank(&[1.0, 0.0], 10, true).is_empty());
    }

    #[test]
    fn persistencia_ida_y_vuelta() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index/chunks.json");

        let index = index_with(vec![
            (vec![1.0, 0.0], chunk("interno", AccessLevel::Advisor)),
            (vec![0.3, 0.7], chunk("público", AccessLevel::Public)),
        ]);
        index.persist(&path).unwrap();

        let reloaded = VectorIndex::load(&path, "modelo-prueba").unwrap();
        assert_eq!(reloaded.len(), 2);

        let query = vec![0.6, 0.4];
        let before: Vec<String> = index.rank(&query, 5, false).into_iter().map(|c| c.text).collect();
        let after: Vec<String> = reloaded.rank(&query, 5, false).into_iter().map(|c| c.text).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn persistencia_de_indice_vacio() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunks.json");

        VectorIndex::new("modelo-prueba").persist(&path).unwrap();
        let reloaded = VectorIndex::load(&path, "modelo-prueba").unwrap();
        assert!(reloaded.is_empty());
    }

    #[test]
    fn cargar_con_otro_modelo_de_embeddings_descarta_el_indice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunks.json");

        index_with(vec![(vec![1.0], chunk("x", AccessLevel::Public))])
            .persist(&path)
            .unwrap();

        assert!(VectorIndex::load(&path, "otro-modelo").is_none());
    }

    #[test]
    fn carga_fallida_no_propaga_error() {
        let dir = tempfile::tempdir().unwrap();
        // Ausente.
        assert!(VectorIndex::load(&dir.path().join("nada.json"), "m").is_none());
        // Corrupto.
        let path = dir.path().join("roto.json");
        std::fs::write(&path, "{no es json").unwrap();
        assert!(VectorIndex::load(&path, "m").is_none());
    }
}
