//! Paragraph-first text chunking.
//!
//! Paragraphs (blank-line separated) are packed into chunks up to a target
//! size. A paragraph that is too large by itself is split on `". "` and its
//! sentences are packed the same way.

use crate::context::token::estimate_tokens;
use threadline_core::document::NewChunk;

/// Splits document text into ordered chunks of roughly `target_tokens`.
#[derive(Debug, Clone, Copy)]
pub struct TextChunker {
    target_tokens: usize,
}

impl Default for TextChunker {
    fn default() -> Self {
        Self::new(500)
    }
}

struct Packer {
    target: usize,
    chunks: Vec<String>,
    current: String,
    current_tokens: usize,
}

impl Packer {
    fn push(&mut self, piece: &str, separator: &str) {
        let tokens = estimate_tokens(piece);
        if !self.current.is_empty() && self.current_tokens + tokens > self.target {
            self.chunks.push(std::mem::take(&mut self.current));
            self.current_tokens = 0;
        }
        if !self.current.is_empty() {
            self.current.push_str(separator);
        }
        self.current.push_str(piece);
        self.current_tokens += tokens;
    }

    fn finish(mut self) -> Vec<String> {
        if !self.current.is_empty() {
            self.chunks.push(self.current);
        }
        self.chunks
    }
}

impl TextChunker {
    pub fn new(target_tokens: usize) -> Self {
        Self {
            target_tokens: target_tokens.max(1),
        }
    }

    /// Chunk texts in document order.
    pub fn split(&self, text: &str) -> Vec<String> {
        let mut packer = Packer {
            target: self.target_tokens,
            chunks: Vec::new(),
            current: String::new(),
            current_tokens: 0,
        };

        for paragraph in split_paragraphs(text) {
            if estimate_tokens(paragraph) > self.target_tokens {
                for sentence in paragraph.split(". ").map(str::trim).filter(|s| !s.is_empty()) {
                    packer.push(sentence, " ");
                }
            } else {
                packer.push(paragraph, "\n\n");
            }
        }

        packer.finish()
    }

    /// Chunk and number, ready for storage.
    pub fn chunk(&self, text: &str) -> Vec<NewChunk> {
        self.split(text)
            .into_iter()
            .enumerate()
            .map(|(i, text)| NewChunk {
                chunk_index: i as u32,
                token_count: estimate_tokens(&text) as u32,
                text,
            })
            .collect()
    }
}

/// Blank-line separated paragraphs, trimmed, empties skipped.
fn split_paragraphs(text: &str) -> impl Iterator<Item = &str> {
    let normalized_breaks = text.split("\n\n").flat_map(|p| p.split("\r\n\r\n"));
    normalized_breaks.map(str::trim).filter(|p| !p.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_text_is_one_chunk() {
        let chunker = TextChunker::new(500);
        let chunks = chunker.split("First paragraph.\n\nSecond paragraph.");
        assert_eq!(chunks, vec!["First paragraph.\n\nSecond paragraph."]);
    }

    #[test]
    fn empty_paragraphs_are_skipped() {
        let chunker = TextChunker::new(500);
        let chunks = chunker.split("\n\n  \n\nOnly one.\n\n\n\n");
        assert_eq!(chunks, vec!["Only one."]);
        assert!(chunker.split("   ").is_empty());
    }

    #[test]
    fn paragraphs_pack_up_to_target() {
        // Each paragraph is 40 chars = 10 tokens; target 25 fits two.
        let para = "a".repeat(40);
        let text = vec![para.clone(); 5].join("\n\n");
        let chunks = TextChunker::new(25).split(&text);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], format!("{para}\n\n{para}"));
        assert_eq!(chunks[2], para);
    }

    #[test]
    fn oversized_paragraph_splits_on_sentences() {
        let sentence = "b".repeat(36); // 9 tokens
        let paragraph = vec![sentence.clone(); 4].join(". ");
        let chunks = TextChunker::new(20).split(&paragraph);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], format!("{sentence} {sentence}"));
    }

    #[test]
    fn chunk_numbers_and_counts_tokens() {
        let para = "c".repeat(80);
        let text = vec![para; 3].join("\n\n");
        let chunks = TextChunker::new(20).chunk(&text);
        let indexes: Vec<u32> = chunks.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
        assert!(chunks.iter().all(|c| c.token_count == 20));
    }

    #[test]
    fn windows_line_endings_separate_paragraphs() {
        let chunks = TextChunker::new(1).split("one one one one\r\n\r\ntwo two two two");
        assert_eq!(chunks.len(), 2);
    }
}
