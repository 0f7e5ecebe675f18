use common::{
    error::AppError,
    storage::types::job::{CostBand, CostEstimate, JobAnalysis, TotalCostBand},
    utils::config::{AppConfig, EmbeddingBackend},
};

use crate::chunker::{canonicalize, chunk_document, document_hash, estimate_tokens, DocumentChunk};

/// Everything the synchronous submit-time analysis produces: canonical text,
/// the chunk plan, and the cost estimate. No model is ever called here.
pub struct IngressAnalysis {
    pub canonical_text: String,
    pub document_hash: String,
    pub chunks: Vec<DocumentChunk>,
    pub analysis: JobAnalysis,
}

/// USD per 1M tokens, (input, output) for chat models.
fn extraction_price(model: &str) -> (f64, f64) {
    match model {
        m if m.starts_with("gpt-4o-mini") => (0.15, 0.60),
        m if m.starts_with("gpt-4o") => (2.50, 10.00),
        m if m.starts_with("gpt-4.1-mini") => (0.40, 1.60),
        m if m.starts_with("gpt-4.1") => (2.00, 8.00),
        _ => (0.50, 2.00),
    }
}

/// USD per 1M tokens for embeddings; the hashed backend is free.
fn embedding_price(backend: EmbeddingBackend, model: &str) -> f64 {
    match backend {
        EmbeddingBackend::Hashed => 0.0,
        EmbeddingBackend::OpenAi => match model {
            m if m.starts_with("text-embedding-3-large") => 0.13,
            m if m.starts_with("text-embedding-3-small") => 0.02,
            _ => 0.10,
        },
    }
}

pub fn analyse(raw_text: &str, config: &AppConfig) -> Result<IngressAnalysis, AppError> {
    let canonical_text = canonicalize(raw_text);
    if canonical_text.trim().is_empty() {
        return Err(AppError::Validation("submitted content is empty".into()));
    }

    let doc_hash = document_hash(&canonical_text);
    let chunks = chunk_document(
        &canonical_text,
        &doc_hash,
        config.chunk_target_tokens,
        config.chunk_overlap_tokens,
    )?;

    let chunk_tokens: usize = chunks.iter().map(|chunk| estimate_tokens(&chunk.text)).sum();
    let tokens = chunk_tokens as f64;

    let (input_price, output_price) = extraction_price(&config.extraction_model);
    // Low band assumes terse structured output; high band assumes output
    // comparable to the input.
    let extraction = CostBand {
        cost_low: tokens * input_price / 1e6,
        cost_high: tokens * (input_price + output_price) / 1e6,
    };

    let embedding_rate = embedding_price(config.embedding_backend, &config.embedding_model);
    let embeddings = CostBand {
        cost_low: tokens * embedding_rate / 1e6,
        cost_high: tokens * embedding_rate * 1.25 / 1e6,
    };

    let total = TotalCostBand {
        cost_low: extraction.cost_low + embeddings.cost_low,
        cost_high: extraction.cost_high + embeddings.cost_high,
        currency: "USD".into(),
    };

    let analysis = JobAnalysis {
        cost_estimate: CostEstimate {
            extraction,
            embeddings,
            total,
        },
        chunk_count: u32::try_from(chunks.len()).unwrap_or(u32::MAX),
        document_hash: doc_hash.clone(),
    };

    Ok(IngressAnalysis {
        canonical_text,
        document_hash: doc_hash,
        chunks,
        analysis,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analyse_counts_chunks_and_prices_them() {
        let config = AppConfig::for_tests();
        let text = "Apache AGE extends PostgreSQL with graph capabilities. \
                    It uses Cypher queries.";

        let result = analyse(text, &config).expect("analyse");
        assert_eq!(result.analysis.chunk_count, 1);
        assert_eq!(result.chunks.len(), 1);
        assert_eq!(result.analysis.document_hash, result.document_hash);

        let estimate = &result.analysis.cost_estimate;
        assert!(estimate.extraction.cost_high > estimate.extraction.cost_low);
        assert!(estimate.extraction.cost_low > 0.0);
        // Hashed backend embeds for free.
        assert!(estimate.embeddings.cost_low.abs() < f64::EPSILON);
        assert_eq!(estimate.total.currency, "USD");
    }

    #[test]
    fn analyse_rejects_empty_content() {
        let config = AppConfig::for_tests();
        assert!(matches!(
            analyse("   \n", &config),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn identical_content_hashes_identically() {
        let config = AppConfig::for_tests();
        let a = analyse("same content", &config).expect("a");
        let b = analyse("same content", &config).expect("b");
        assert_eq!(a.document_hash, b.document_hash);
        assert_eq!(a.analysis.chunk_count, b.analysis.chunk_count);
    }
}
