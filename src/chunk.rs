//! Sliding-window text chunker.
//!
//! Splits document text into overlapping windows of `chunk_size` characters
//! with `chunk_overlap` characters shared between consecutive chunks. The
//! split is deterministic: identical input and configuration always yield
//! identical chunk boundaries, which is what makes re-ingestion idempotent.
//!
//! Concatenating chunk 0 with every later chunk minus its leading overlap
//! reconstructs the original text exactly.

/// Split text into overlapping character windows.
///
/// An empty document yields zero chunks. A document no longer than one
/// window yields exactly one chunk. All boundaries fall on UTF-8 character
/// boundaries. Callers must guarantee `chunk_overlap < chunk_size`
/// (validated at config load).
pub fn chunk_text(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }

    // Byte offset of every character boundary, plus the end of the string.
    let mut bounds: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    bounds.push(text.len());
    let total_chars = bounds.len() - 1;

    if total_chars <= chunk_size {
        return vec![text.to_string()];
    }

    let step = chunk_size - chunk_overlap;
    let mut chunks = Vec::new();
    let mut start = 0usize;

    loop {
        let end = (start + chunk_size).min(total_chars);
        chunks.push(text[bounds[start]..bounds[end]].to_string());
        if end == total_chars {
            break;
        }
        start += step;
    }

    chunks
}
