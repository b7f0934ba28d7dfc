//! Paragraph-boundary text chunker for uploaded files.
//!
//! Splits file text into [`TextChunk`]s that respect a `max_tokens` limit,
//! preferring `\n\n` paragraph boundaries so each chunk stays coherent.
//! Oversized paragraphs are hard-split at the nearest newline or space.
//!
//! Unlike a document store, blank input yields no chunks at all: an empty
//! chunk cannot be embedded, so there is nothing to index.
//!
//! # Example
//!
//! ```rust
//! use specter_rag_core::chunk::chunk_text;
//!
//! let chunks = chunk_text("Invoice 42.\n\nTotal due: $500.", 256);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].index, 0);
//! ```

/// Approximate characters-per-token ratio (4 chars ≈ 1 token).
const CHARS_PER_TOKEN: usize = 4;

/// One piece of an uploaded file, ready to embed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// Position within the file, contiguous from 0.
    pub index: usize,
    pub text: String,
}

/// Split `text` into chunks of at most `max_tokens × 4` characters.
///
/// Guarantees:
/// - Indices are contiguous: `0, 1, …, N-1`.
/// - No chunk is empty or whitespace-only.
/// - Splits never land inside a multi-byte UTF-8 character.
pub fn chunk_text(text: &str, max_tokens: usize) -> Vec<TextChunk> {
    let max_chars = (max_tokens * CHARS_PER_TOKEN).max(1);
    let mut pieces: Vec<String> = Vec::new();
    let mut buf = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if buf.is_empty() {
            trimmed.len()
        } else {
            buf.len() + 2 + trimmed.len()
        };
        if would_be > max_chars && !buf.is_empty() {
            pieces.push(std::mem::take(&mut buf));
        }

        if trimmed.len() > max_chars {
            hard_split(trimmed, max_chars, &mut pieces);
        } else {
            if !buf.is_empty() {
                buf.push_str("\n\n");
            }
            buf.push_str(trimmed);
        }
    }
    if !buf.is_empty() {
        pieces.push(buf);
    }

    pieces
        .into_iter()
        .enumerate()
        .map(|(index, text)| TextChunk { index, text })
        .collect()
}

/// Break one oversized paragraph at newline/space boundaries.
fn hard_split(paragraph: &str, max_chars: usize, out: &mut Vec<String>) {
    let mut remaining = paragraph;
    while !remaining.is_empty() {
        let limit = snap_to_char_boundary(remaining, remaining.len().min(max_chars));
        let mut split_at = if limit < remaining.len() {
            remaining[..limit]
                .rfind('\n')
                .or_else(|| remaining[..limit].rfind(' '))
                .map(|pos| pos + 1)
                .unwrap_or(limit)
        } else {
            limit
        };
        if split_at == 0 {
            // A single character wider than the limit still has to move forward.
            split_at = remaining
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(remaining.len());
        }
        let piece = remaining[..split_at].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        remaining = &remaining[split_at..];
    }
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
