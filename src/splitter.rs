//! Troceado recursivo de texto por caracteres con solapamiento.
//!
//! Se intenta cortar primero por párrafos (`"\n\n"`), después por líneas,
//! por espacios y, en último término, carácter a carácter. Los trozos
//! resultantes nunca superan `chunk_size` caracteres y dos trozos
//! consecutivos comparten como mucho `chunk_overlap` caracteres.

use std::collections::VecDeque;

use anyhow::{anyhow, Result};

const DEFAULT_SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

#[derive(Debug, Clone)]
pub struct TextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: Vec<&'static str>,
}

impl TextSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(anyhow!("chunk_size debe ser mayor que cero"));
        }
        if chunk_overlap >= chunk_size {
            return Err(anyhow!(
                "chunk_overlap ({chunk_overlap}) debe ser menor que chunk_size ({chunk_size})"
            ));
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
            separators: DEFAULT_SEPARATORS.to_vec(),
        })
    }

    /// Divide `text` en trozos que respetan el tamaño y el solapamiento.
    pub fn split_text(&self, text: &str) -> Vec<String> {
        self.split_recursive(text, &self.separators)
    }

    /// Igual que [`split_text`](Self::split_text), pero devuelve además la
    /// posición (en caracteres) de cada trozo dentro de `text`.
    pub fn split_with_offsets(&self, text: &str) -> Vec<(usize, String)> {
        let mut result: Vec<(usize, String)> = Vec::new();

        for chunk in self.split_text(text) {
            let search_from = match result.last() {
                Some((prev_start, prev)) => {
                    let overlapped = (prev_start + char_len(prev)).saturating_sub(self.chunk_overlap);
                    overlapped.max(prev_start + 1)
                }
                None => 0,
            };
            let byte_from = byte_offset(text, search_from);
            let char_start = text[byte_from..]
                .find(chunk.as_str())
                .map(|pos| text[..byte_from + pos].chars().count())
                .unwrap_or(search_from);
            result.push((char_start, chunk));
        }

        result
    }

    fn split_recursive(&self, text: &str, separators: &[&'static str]) -> Vec<String> {
        let mut final_chunks = Vec::new();
        let (separator, remaining) = pick_separator(text, separators);

        let splits: Vec<&str> = if separator.is_empty() {
            text.char_indices()
                .map(|(i, c)| &text[i..i + c.len_utf8()])
                .collect()
        } else {
            text.split(separator).filter(|s| !s.is_empty()).collect()
        };

        let mut good: Vec<&str> = Vec::new();
        for piece in splits {
            if char_len(piece) < self.chunk_size {
                good.push(piece);
                continue;
            }
            if !good.is_empty() {
                final_chunks.extend(self.merge_splits(&good, separator));
                good.clear();
            }
            if remaining.is_empty() {
                final_chunks.push(piece.to_string());
            } else {
                final_chunks.extend(self.split_recursive(piece, remaining));
            }
        }
        if !good.is_empty() {
            final_chunks.extend(self.merge_splits(&good, separator));
        }

        final_chunks
    }

    /// Agrupa piezas pequeñas en trozos de hasta `chunk_size`, arrastrando
    /// la cola del trozo anterior mientras quepa en `chunk_overlap`.
    fn merge_splits(&self, splits: &[&str], separator: &str) -> Vec<String> {
        let sep_len = char_len(separator);
        let mut docs = Vec::new();
        let mut current: VecDeque<&str> = VecDeque::new();
        let mut total = 0usize;

        for piece in splits {
            let len = char_len(piece);
            let joined = if current.is_empty() { 0 } else { sep_len };

            if total + len + joined > self.chunk_size && !current.is_empty() {
                if let Some(doc) = join_docs(&current, separator) {
                    docs.push(doc);
                }
                while total > self.chunk_overlap
                    || (total + len + if current.is_empty() { 0 } else { sep_len } > self.chunk_size
                        && total > 0)
                {
                    let Some(first) = current.pop_front() else {
                        break;
                    };
                    total -= char_len(first) + if current.is_empty() { 0 } else { sep_len };
                }
            }

            current.push_back(piece);
            total += len + if current.len() > 1 { sep_len } else { 0 };
        }

        if let Some(doc) = join_docs(&current, separator) {
            docs.push(doc);
        }
        docs
    }
}

fn pick_separator<'a>(
    text: &str,
    separators: &'a [&'static str],
) -> (&'static str, &'a [&'static str]) {
    for (i, sep) in separators.iter().enumerate() {
        if sep.is_empty() {
            return ("", &[]);
        }
        if text.contains(sep) {
            return (sep, &separators[i + 1..]);
        }
    }
    (separators.last().copied().unwrap_or(""), &[])
}

fn join_docs(parts: &VecDeque<&str>, separator: &str) -> Option<String> {
    let joined = parts.iter().copied().collect::<Vec<_>>().join(separator);
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn byte_offset(text: &str, char_index: usize) -> usize {
    text.char_indices()
        .nth(char_index)
        .map(|(byte, _)| byte)
        .unwrap_or(text.len())
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}
