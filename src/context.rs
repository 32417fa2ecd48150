//! Context assembly for prompting.
//!
//! Takes the ranked retrieval results, collapses near-duplicate chunks from
//! the same document, and greedily packs chunks into the configured token
//! budget without ever splitting one. Ordering always preserves the
//! retriever's descending-score order.

use crate::config::{ChunkingConfig, ContextConfig};
use crate::models::{ContextSnippet, ScoredChunk};

/// Approximate chars-per-token ratio used for the budget estimate.
const CHARS_PER_TOKEN: usize = 4;

/// Estimate the token count of a text under the chars-per-token ratio.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Final assembled context: the ordered snippet list plus the rendered
/// text block passed to the generator.
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub snippets: Vec<ContextSnippet>,
    pub rendered: String,
}

impl AssembledContext {
    pub fn is_empty(&self) -> bool {
        self.snippets.is_empty()
    }
}

#[derive(Clone)]
pub struct ContextAssembler {
    config: ContextConfig,
    chunking: ChunkingConfig,
}

impl ContextAssembler {
    pub fn new(config: ContextConfig, chunking: ChunkingConfig) -> Self {
        Self { config, chunking }
    }

    /// Deduplicate, order, and truncate retrieved chunks to the token
    /// budget.
    pub fn assemble(&self, ranked: &[ScoredChunk]) -> AssembledContext {
        let deduped = self.dedup(ranked);

        let mut snippets = Vec::new();
        let mut used_tokens = 0usize;

        for chunk in deduped {
            let cost = estimate_tokens(&chunk.content);
            if used_tokens + cost > self.config.max_context_tokens {
                // Never split a chunk across the truncation boundary.
                break;
            }
            used_tokens += cost;
            snippets.push(ContextSnippet {
                document_id: chunk.document_id.clone(),
                chunk_index: chunk.chunk_index,
                score: chunk.score,
                text: chunk.content.clone(),
            });
        }

        let rendered = snippets
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        AssembledContext { snippets, rendered }
    }

    /// Collapse chunks from the same document whose character spans overlap
    /// by more than the configured fraction, keeping the higher-scored one.
    /// Input order (descending score) is preserved.
    fn dedup<'a>(&self, ranked: &'a [ScoredChunk]) -> Vec<&'a ScoredChunk> {
        let mut kept: Vec<&ScoredChunk> = Vec::new();

        'outer: for candidate in ranked {
            for existing in &kept {
                if existing.document_id != candidate.document_id {
                    continue;
                }
                let overlap = self.span_overlap_fraction(existing, candidate);
                if overlap > self.config.dedup_overlap_fraction {
                    // The earlier (higher-scored) chunk wins.
                    continue 'outer;
                }
            }
            kept.push(candidate);
        }

        kept
    }

    /// Fraction of the smaller chunk's span covered by the overlap of the
    /// two chunks' character spans within their document.
    fn span_overlap_fraction(&self, a: &ScoredChunk, b: &ScoredChunk) -> f32 {
        let step = (self.chunking.chunk_size - self.chunking.chunk_overlap) as i64;

        let (a_start, a_len) = (a.chunk_index * step, a.content.chars().count() as i64);
        let (b_start, b_len) = (b.chunk_index * step, b.content.chars().count() as i64);

        let overlap = (a_start + a_len).min(b_start + b_len) - a_start.max(b_start);
        if overlap <= 0 {
            return 0.0;
        }

        overlap as f32 / a_len.min(b_len).max(1) as f32
    }
}
