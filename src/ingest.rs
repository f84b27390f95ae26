//! Ingesta de documentos: extracción de texto, limpieza, troceado en
//! ventanas solapadas y etiquetado de nivel de acceso por documento.

use std::ffi::OsStr;
use std::fs;
use std::path::Path;

use anyhow::Result;
use regex::Regex;

use crate::errors::PipelineError;
use crate::models::{AccessLevel, DocumentChunk};

/// Palabras que marcan un documento como restringido a asesores.
/// Se comparan como subcadenas del nombre de fichero, sin mayúsculas.
const RESTRICTED_KEYWORDS: &[&str] = &["manual", "operativo"];

/// Jerarquía de separadores para el troceado: siempre se prefiere el más
/// grueso que siga produciendo fragmentos dentro del tamaño objetivo.
const SEPARATORS: &[&str] = &["\n\n", "\n", " "];

const DEFAULT_CHUNK_SIZE: usize = 1000;
const DEFAULT_CHUNK_OVERLAP: usize = 200;

/// Convierte texto crudo extraído en chunks limpios y etiquetados.
#[derive(Debug, Clone)]
pub struct DocumentIngestor {
    chunk_size: usize,
    chunk_overlap: usize,
    url_re: Regex,
    footer_re: Regex,
    blank_re: Regex,
}

impl DocumentIngestor {
    pub fn new() -> Result<Self> {
        Self::with_limits(DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_OVERLAP)
    }

    pub fn with_limits(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        Ok(Self {
            chunk_size,
            chunk_overlap,
            url_re: Regex::new(r"http\S+")?,
            // Pies de página tipo "Página 3 de 12" / "Page 3 of 12".
            footer_re: Regex::new(r"(?i)p[áa]g(?:ina|e)\s*\d+\s*(?:de|of)\s*\d+")?,
            blank_re: Regex::new(r"\n\s*\n")?,
        })
    }

    /// Extrae el texto crudo de un fichero según su extensión. Un fallo se
    /// devuelve como `PipelineError::Extraction` para que el llamante salte
    /// el documento y continúe con el resto.
    pub fn extract_text(path: &Path) -> Result<String> {
        let extraction_error = |reason: String| PipelineError::Extraction {
            path: path.display().to_string(),
            reason,
        };

        let extension = path
            .extension()
            .and_then(OsStr::to_str)
            .unwrap_or("")
            .to_lowercase();

        match extension.as_str() {
            "pdf" => pdf_extract::extract_text(path)
                .map_err(|e| extraction_error(e.to_string()).into()),
            "txt" | "md" => {
                fs::read_to_string(path).map_err(|e| extraction_error(e.to_string()).into())
            }
            other => {
                Err(extraction_error(format!("extensión no soportada '.{other}'")).into())
            }
        }
    }

    /// Limpieza del texto extraído: URLs, pies de página, signos de
    /// interrogación literales y colapso de líneas en blanco consecutivas.
    /// La eliminación de TODOS los '?' es deliberada y se conserva tal cual:
    /// cambiarla alteraría los chunks ya indexados.
    pub fn clean_text(&self, text: &str) -> String {
        let text = self.url_re.replace_all(text, "");
        let text = self.footer_re.replace_all(&text, "");
        let text = text.replace('?', "");
        let text = self.blank_re.replace_all(&text, "\n\n");
        text.trim().to_string()
    }

    /// Nivel de acceso derivado del nombre del documento fuente. Se calcula
    /// una vez por documento y se propaga a todos sus chunks.
    pub fn access_level_for(source_name: &str) -> AccessLevel {
        let lowered = source_name.to_lowercase();
        if RESTRICTED_KEYWORDS.iter().any(|kw| lowered.contains(kw)) {
            AccessLevel::Advisor
        } else {
            AccessLevel::Public
        }
    }

    /// Limpia, trocea y etiqueta el texto de un documento. Un texto vacío
    /// produce cero chunks, no un error.
    pub fn ingest(&self, raw_text: &str, source_name: &str) -> Vec<DocumentChunk> {
        let cleaned = self.clean_text(raw_text);
        if cleaned.is_empty() {
            return Vec::new();
        }

        let access_level = Self::access_level_for(source_name);
        self.split_text(&cleaned)
            .into_iter()
            .map(|text| DocumentChunk {
                text,
                source_name: source_name.to_string(),
                access_level,
            })
            .collect()
    }

    /// Trocea el texto en ventanas de ~`chunk_size` caracteres con
    /// ~`chunk_overlap` de solapamiento, usando la jerarquía de separadores.
    pub fn split_text(&self, text: &str) -> Vec<String> {
        self.split_with(text, SEPARATORS)
    }

    fn split_with(&self, text: &str, separators: &[&str]) -> Vec<String> {
        if char_len(text) <= self.chunk_size {
            let trimmed = text.trim();
            return if trimmed.is_empty() {
                Vec::new()
            } else {
                vec![trimmed.to_string()]
            };
        }

        let Some((sep, finer)) = separators.split_first() else {
            // Sin separadores restantes: ventanas duras por caracteres.
            return self.split_chars(text);
        };

        let mut pieces: Vec<String> = Vec::new();
        for part in text.split(sep) {
            if char_len(part) > self.chunk_size {
                // Un fragmento que no cabe baja al siguiente separador.
                pieces.extend(self.split_with(part, finer));
            } else if !part.trim().is_empty() {
                pieces.push(part.to_string());
            }
        }
        self.merge_pieces(pieces, sep)
    }

    /// Acumula piezas hasta el tamaño objetivo; al cerrar un chunk conserva
    /// una cola de piezas (~`chunk_overlap` caracteres) como solapamiento.
    fn merge_pieces(&self, pieces: Vec<String>, sep: &str) -> Vec<String> {
        let sep_len = char_len(sep);
        let total = |items: &[String]| -> usize {
            if items.is_empty() {
                0
            } else {
                items.iter().map(|p| char_len(p)).sum::<usize>() + sep_len * (items.len() - 1)
            }
        };

        let mut chunks = Vec::new();
        let mut current: Vec<String> = Vec::new();

        for piece in pieces {
            let piece_len = char_len(&piece);
            if !current.is_empty() && total(&current) + sep_len + piece_len > self.chunk_size {
                chunks.push(current.join(sep));
                while !current.is_empty()
                    && (total(&current) > self.chunk_overlap
                        || total(&current) + sep_len + piece_len > self.chunk_size)
                {
                    current.remove(0);
                }
            }
            current.push(piece);
        }

        if !current.is_empty() {
            chunks.push(current.join(sep));
        }
        chunks
    }

    fn split_chars(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        let step = self.chunk_size.saturating_sub(self.chunk_overlap).max(1);

        let mut chunks = Vec::new();
        let mut start = 0;
        while start < chars.len() {
            let end = (start + self.chunk_size).min(chars.len());
            chunks.push(chars[start..end].iter().collect());
            if end == chars.len() {
                break;
            }
            start += step;
        }
        chunks
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}
