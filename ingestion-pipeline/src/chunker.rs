use common::error::AppError;
use common::storage::types::source::Source;
use sha2::{Digest, Sha256};
use text_splitter::{ChunkCapacity, ChunkConfig, TextSplitter};
use unicode_normalization::UnicodeNormalization;

/// Character budget per estimated token; used both for splitting and for
/// cost estimation so the two always agree.
pub const CHARS_PER_TOKEN: usize = 4;

/// One pipeline-sized span of the parsed document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentChunk {
    pub index: u32,
    pub text: String,
    /// Byte span within the canonical document text.
    pub char_start: usize,
    pub char_end: usize,
    pub source_id: String,
}

/// Canonical UTF-8 form: NFC-normalized with unified line endings. The
/// document hash and every offset downstream are computed over this text.
pub fn canonicalize(text: &str) -> String {
    text.replace("\r\n", "\n").nfc().collect()
}

pub fn document_hash(canonical_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_text.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Split canonical text into ordered, overlapping chunks. Splitting prefers
/// paragraph boundaries, then sentences, then hard cuts; a pure function of
/// text and parameters.
pub fn chunk_document(
    canonical_text: &str,
    doc_hash: &str,
    target_tokens: usize,
    overlap_tokens: usize,
) -> Result<Vec<DocumentChunk>, AppError> {
    if target_tokens == 0 {
        return Err(AppError::Validation(
            "chunk_target_tokens must be greater than zero".into(),
        ));
    }
    if overlap_tokens >= target_tokens {
        return Err(AppError::Validation(format!(
            "chunk_target_tokens must exceed the configured overlap of {overlap_tokens}"
        )));
    }

    let max_chars = target_tokens.saturating_mul(CHARS_PER_TOKEN);
    let min_chars = max_chars.saturating_div(2).max(1);
    let overlap_chars = overlap_tokens.saturating_mul(CHARS_PER_TOKEN);

    let chunk_capacity = ChunkCapacity::new(min_chars)
        .with_max(max_chars)
        .map_err(|e| AppError::Validation(format!("invalid chunk bounds: {e}")))?;
    let chunk_config = ChunkConfig::new(chunk_capacity)
        .with_overlap(overlap_chars)
        .map_err(|e| AppError::Validation(format!("invalid chunk overlap: {e}")))?;
    let splitter = TextSplitter::new(chunk_config);

    let chunks = splitter
        .chunk_indices(canonical_text)
        .enumerate()
        .map(|(index, (offset, text))| {
            let index = u32::try_from(index).unwrap_or(u32::MAX);
            DocumentChunk {
                index,
                text: text.to_owned(),
                char_start: offset,
                char_end: offset + text.len(),
                source_id: Source::deterministic_id(doc_hash, index),
            }
        })
        .collect();

    Ok(chunks)
}
