//! Document chunking strategies.
//!
//! This module provides the [`Chunker`] trait and two implementations:
//!
//! - [`RecursiveChunker`]: windows that end on the best natural break
//!   (paragraph, line, sentence, word) and fall back to hard cuts
//! - [`FixedSizeChunker`]: hard character windows
//!
//! Both count Unicode scalar values rather than bytes, and both start every
//! window exactly `chunk_overlap` characters before the previous one ended,
//! so consecutive chunks overlap and together cover the whole text.

/// A strategy for splitting text into bounded, overlapping pieces.
pub trait Chunker: Send + Sync {
    /// Split `text` into pieces of at most the configured size.
    ///
    /// Returns an empty `Vec` for empty or whitespace-only text.
    fn split(&self, text: &str) -> Vec<String>;
}

/// Break classes, tried in order of preference.
const PARAGRAPH: &[&str] = &["\n\n"];
const LINE: &[&str] = &["\n"];
const SENTENCE: &[&str] = &[". ", "! ", "? ", "。", "！", "？", "；"];
const WORD: &[&str] = &[" ", "\t"];

const BREAK_CLASSES: &[&[&str]] = &[PARAGRAPH, LINE, SENTENCE, WORD];

/// Splits text into fixed-size windows by character count with overlap.
///
/// # Example
///
/// ```rust,ignore
/// use yuelu_rag::FixedSizeChunker;
///
/// let chunker = FixedSizeChunker::new(256, 50);
/// let pieces = chunker.split(&text);
/// ```
#[derive(Debug, Clone)]
pub struct FixedSizeChunker {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl FixedSizeChunker {
    /// Create a new `FixedSizeChunker`.
    ///
    /// An overlap that is not smaller than `chunk_size` is clamped to
    /// `chunk_size - 1` so the windows always advance.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self { chunk_size, chunk_overlap: chunk_overlap.min(chunk_size - 1) }
    }
}

impl Chunker for FixedSizeChunker {
    fn split(&self, text: &str) -> Vec<String> {
        windows(text, self.chunk_size, self.chunk_overlap, |_, _, end| end)
    }
}

/// Splits text into windows that prefer to end on natural separators.
///
/// Inside each window the last paragraph break is taken if there is one,
/// otherwise the last line break, sentence end, or whitespace. A break is
/// only accepted in the second half of the window (and past the overlap)
/// so chunks stay close to `chunk_size`; without one the window is cut
/// at exactly `chunk_size` characters.
///
/// # Example
///
/// ```rust,ignore
/// use yuelu_rag::RecursiveChunker;
///
/// let chunker = RecursiveChunker::new(800, 100);
/// let pieces = chunker.split(&text);
/// ```
#[derive(Debug, Clone)]
pub struct RecursiveChunker {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl RecursiveChunker {
    /// Create a new `RecursiveChunker`.
    ///
    /// An overlap that is not smaller than `chunk_size` is clamped to
    /// `chunk_size - 1` so the windows always advance.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self { chunk_size, chunk_overlap: chunk_overlap.min(chunk_size - 1) }
    }
}

impl Chunker for RecursiveChunker {
    fn split(&self, text: &str) -> Vec<String> {
        let overlap = self.chunk_overlap;
        let half = self.chunk_size / 2;
        windows(text, self.chunk_size, overlap, |chars, start, end| {
            let earliest = start + overlap.max(half) + 1;
            find_break(chars, earliest, end).unwrap_or(end)
        })
    }
}

/// Cut `text` into windows of at most `size` chars.
///
/// `choose_end(chars, start, hard_end)` picks where a window that does not
/// reach the end of the text stops; it must return a value in
/// `(start + overlap, hard_end]`.
fn windows(
    text: &str,
    size: usize,
    overlap: usize,
    choose_end: impl Fn(&[char], usize, usize) -> usize,
) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = text.chars().collect();
    let mut pieces = Vec::new();
    let mut start = 0;

    loop {
        let hard_end = (start + size).min(chars.len());
        let end = if hard_end == chars.len() {
            hard_end
        } else {
            choose_end(&chars, start, hard_end).clamp(start + overlap + 1, hard_end)
        };

        pieces.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start = end - overlap;
    }

    pieces
}

/// Find the end position (exclusive) of the most preferred separator that
/// ends within `[earliest, end]`, scanning backwards so the window stays long.
fn find_break(chars: &[char], earliest: usize, end: usize) -> Option<usize> {
    if earliest > end {
        return None;
    }
    BREAK_CLASSES.iter().find_map(|separators| {
        (earliest..=end).rev().find(|&pos| {
            separators.iter().any(|sep| ends_with_at(chars, pos, sep))
        })
    })
}

/// Whether `chars[..pos]` ends with `sep`.
fn ends_with_at(chars: &[char], pos: usize, sep: &str) -> bool {
    let sep_len = sep.chars().count();
    pos >= sep_len && chars[pos - sep_len..pos].iter().copied().eq(sep.chars())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    /// Rebuild the source text from overlapping pieces, asserting that every
    /// piece starts exactly `overlap` chars before the previous one ended.
    fn reassemble(pieces: &[String], overlap: usize) -> String {
        let mut out: Vec<char> = Vec::new();
        for (i, piece) in pieces.iter().enumerate() {
            let chars: Vec<char> = piece.chars().collect();
            if i == 0 {
                out.extend(chars);
            } else {
                let shared = &out[out.len() - overlap..];
                assert_eq!(shared, &chars[..overlap], "piece {i} does not overlap its predecessor");
                out.extend(&chars[overlap..]);
            }
        }
        out.into_iter().collect()
    }

    #[test]
    fn short_sentences_overlap_without_gaps() {
        let text = "The sky is blue. The grass is green.";
        let pieces = RecursiveChunker::new(20, 5).split(text);

        assert!(pieces.len() >= 2);
        assert!(pieces.iter().all(|p| p.chars().count() <= 20));
        assert_eq!(pieces[0], "The sky is blue. ");
        assert_eq!(reassemble(&pieces, 5), text);
    }

    #[test]
    fn prefers_paragraph_breaks_over_sentences() {
        let text = "First para. Still first.\n\nSecond para here. More text follows on.";
        let pieces = RecursiveChunker::new(40, 4).split(text);
        assert_eq!(pieces[0], "First para. Still first.\n\n");
        assert_eq!(reassemble(&pieces, 4), text);
    }

    #[test]
    fn splits_chinese_sentences_by_characters() {
        let text = "岳麓书院位于湖南长沙。它是中国古代四大书院之一。书院始建于北宋。";
        let pieces = RecursiveChunker::new(16, 2).split(text);
        assert!(pieces.iter().all(|p| p.chars().count() <= 16));
        assert_eq!(pieces[0], "岳麓书院位于湖南长沙。");
        assert_eq!(reassemble(&pieces, 2), text);
    }

    #[test]
    fn falls_back_to_hard_cuts_without_separators() {
        let text = "a".repeat(25);
        let pieces = RecursiveChunker::new(10, 2).split(&text);
        assert_eq!(pieces.iter().map(|p| p.len()).collect::<Vec<_>>(), vec![10, 10, 9]);
        assert_eq!(reassemble(&pieces, 2), text);
    }

    #[test]
    fn fixed_size_uses_exact_windows() {
        let pieces = FixedSizeChunker::new(4, 1).split("abcdefghij");
        assert_eq!(pieces, vec!["abcd", "defg", "ghij"]);
    }

    #[test]
    fn empty_text_yields_nothing() {
        assert!(RecursiveChunker::new(10, 2).split("").is_empty());
        assert!(FixedSizeChunker::new(10, 2).split("  \n ").is_empty());
    }

    #[test]
    fn text_shorter_than_a_chunk_is_kept_whole() {
        assert_eq!(RecursiveChunker::new(800, 100).split("short"), vec!["short"]);
    }

    #[test]
    fn oversized_overlap_is_clamped() {
        let pieces = FixedSizeChunker::new(3, 10).split("abcdef");
        assert_eq!(pieces, vec!["abc", "bcd", "cde", "def"]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn chunks_are_bounded_and_cover_the_text(
            text in "[a-z .。\n]{1,300}",
            size in 2usize..60,
            overlap_seed in 0usize..60,
        ) {
            prop_assume!(!text.trim().is_empty());
            let overlap = overlap_seed % size;
            let pieces = RecursiveChunker::new(size, overlap).split(&text);

            prop_assert!(!pieces.is_empty());
            for piece in &pieces {
                prop_assert!(piece.chars().count() <= size);
            }
            prop_assert_eq!(reassemble(&pieces, overlap), text);
        }

        #[test]
        fn splitting_is_deterministic(text in "[a-z .\n]{0,200}") {
            let chunker = RecursiveChunker::new(25, 5);
            prop_assert_eq!(chunker.split(&text), chunker.split(&text));
        }
    }
}
