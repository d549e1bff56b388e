//! Text chunking with overlap for optimal embedding.
//!
//! Documents arrive as page-marked markdown (`## Page N` between pages).
//! Chunks carry the page number and nearest section heading they start under,
//! so search results can point back into the source document.

use crate::models::{Document, DocumentChunk, IngestConfig};

/// Text chunker that splits documents into overlapping chunks.
#[derive(Debug, Clone)]
pub struct TextChunker {
    /// Target chunk size in characters.
    chunk_size: usize,
    /// Overlap size in characters.
    overlap: usize,
}

impl TextChunker {
    /// Create a new text chunker with the given configuration.
    pub fn new(config: &IngestConfig) -> Self {
        Self {
            chunk_size: config.chunk_size as usize,
            overlap: config.chunk_overlap as usize,
        }
    }

    /// Create a chunker with default settings.
    pub fn with_defaults() -> Self {
        Self::new(&IngestConfig::default())
    }

    /// Chunk a document into overlapping segments.
    pub fn chunk(&self, document: &Document) -> Vec<DocumentChunk> {
        let content = &document.text;

        if content.trim().is_empty() {
            return Vec::new();
        }

        let chars: Vec<char> = content.chars().collect();
        let annotations = annotate(&chars);

        // Small documents become a single chunk
        if chars.len() <= self.chunk_size {
            let page = annotations.page_at(0);
            let section = annotations.section_at(0);
            return vec![DocumentChunk::new(document, content.clone(), 0, page, section)];
        }

        let mut ordinal = 0;
        let mut chunks = Vec::new();
        for (text, start) in self.split_with_overlap(&chars) {
            if !has_meaningful_content(&text) {
                continue;
            }
            let page = annotations.page_at(start);
            let section = annotations.section_at(start);
            chunks.push(DocumentChunk::new(document, text, ordinal, page, section));
            ordinal += 1;
        }
        chunks
    }

    /// Split content into overlapping chunks with start positions.
    fn split_with_overlap(&self, chars: &[char]) -> Vec<(String, usize)> {
        let total_chars = chars.len();
        let mut chunks = Vec::new();

        let mut start = 0;
        while start < total_chars {
            let end = (start + self.chunk_size).min(total_chars);

            // Try to find a natural break point (newline, period, space)
            let adjusted_end = self.find_break_point(chars, end, total_chars);

            let text: String = chars[start..adjusted_end].iter().collect();
            chunks.push((text, start));

            if adjusted_end >= total_chars {
                break;
            }

            // The next chunk overlaps the tail of this one. Stepping from
            // the break point, not the target end, so an early break never
            // leaves characters outside every chunk.
            start = adjusted_end.saturating_sub(self.overlap).max(start + 1);
        }

        chunks
    }

    /// Find a natural break point near the target end position.
    fn find_break_point(&self, chars: &[char], target_end: usize, total: usize) -> usize {
        if target_end >= total {
            return total;
        }

        // Look for a natural break point within the last 20% of the chunk
        let search_start = target_end.saturating_sub(self.chunk_size / 5);
        let search_range = &chars[search_start..target_end];

        // Priority: double newline > single newline > period+space > space
        let mut best_break = None;
        let mut last_newline = None;
        let mut last_sentence = None;
        let mut last_space = None;

        for (i, c) in search_range.iter().enumerate() {
            let pos = search_start + i;
            match c {
                '\n' => {
                    if i > 0 && search_range.get(i.saturating_sub(1)) == Some(&'\n') {
                        best_break = Some(pos + 1);
                    }
                    last_newline = Some(pos + 1);
                }
                '.' | '!' | '?' => {
                    if search_range.get(i + 1).is_some_and(|c| c.is_whitespace()) {
                        last_sentence = Some(pos + 1);
                    }
                }
                ' ' | '\t' => {
                    last_space = Some(pos + 1);
                }
                _ => {}
            }
        }

        best_break
            .or(last_newline)
            .or(last_sentence)
            .or(last_space)
            .unwrap_or(target_end)
    }
}

/// Per-character page and section annotations built in one pass.
struct Annotations {
    /// (start offset, page number) in ascending offset order.
    pages: Vec<(usize, u32)>,
    /// (start offset, heading text) in ascending offset order.
    sections: Vec<(usize, String)>,
}

impl Annotations {
    fn page_at(&self, offset: usize) -> Option<u32> {
        self.pages
            .iter()
            .take_while(|(start, _)| *start <= offset)
            .last()
            .map(|(_, page)| *page)
    }

    fn section_at(&self, offset: usize) -> Option<String> {
        self.sections
            .iter()
            .take_while(|(start, _)| *start <= offset)
            .last()
            .map(|(_, section)| section.clone())
    }
}

/// Scan for `#`-prefixed heading lines; page markers (`## Page N`) double as
/// both a section and a page boundary.
fn annotate(chars: &[char]) -> Annotations {
    let mut pages = Vec::new();
    let mut sections = Vec::new();

    let mut line_start = 0;
    let mut i = 0;
    while i <= chars.len() {
        let at_line_end = i == chars.len() || chars[i] == '\n';
        if at_line_end {
            let line: String = chars[line_start..i].iter().collect();
            let trimmed = line.trim();
            if trimmed.starts_with('#') {
                let heading = trimmed.trim_start_matches('#').trim().to_string();
                if !heading.is_empty() {
                    if let Some(page) = parse_page_marker(&heading) {
                        pages.push((line_start, page));
                    }
                    sections.push((line_start, heading));
                }
            }
            line_start = i + 1;
        }
        i += 1;
    }

    Annotations { pages, sections }
}

/// Parse a page number out of a `Page N` heading.
pub fn parse_page_marker(heading: &str) -> Option<u32> {
    let rest = heading.trim().strip_prefix("Page")?;
    rest.trim().parse().ok()
}

/// Chunks that are pure whitespace or markup noise are not worth embedding.
fn has_meaningful_content(text: &str) -> bool {
    text.chars().filter(|c| c.is_alphanumeric()).count() >= 3
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_document(text: &str) -> Document {
        Document::new("doc-1", "test.pdf", "https://x.org/test.pdf", 1, text.to_string())
    }

    #[test]
    fn test_small_document_single_chunk() {
        let chunker = TextChunker::with_defaults();
        let doc = create_test_document("Hello, world!");
        let chunks = chunker.chunk(&doc);

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!(chunks[0].ordinal, 0);
    }

    #[test]
    fn test_empty_document() {
        let chunker = TextChunker::with_defaults();
        let doc = create_test_document("");
        assert!(chunker.chunk(&doc).is_empty());
    }

    #[test]
    fn test_chunk_ids_deterministic_across_runs() {
        let config = IngestConfig {
            chunk_size: 200,
            chunk_overlap: 40,
            ..Default::default()
        };
        let chunker = TextChunker::new(&config);
        let content = "word ".repeat(300);
        let doc = create_test_document(&content);

        let first = chunker.chunk(&doc);
        let second = chunker.chunk(&doc);
        assert!(first.len() > 1);
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.id, b.id);
        }
    }

    #[test]
    fn test_ordinals_are_sequential() {
        let config = IngestConfig {
            chunk_size: 100,
            chunk_overlap: 10,
            ..Default::default()
        };
        let chunker = TextChunker::new(&config);
        let doc = create_test_document(&"sentence one. ".repeat(100));
        let chunks = chunker.chunk(&doc);

        assert!(chunks.len() > 1);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.ordinal, i as u32);
        }
    }

    #[test]
    fn test_early_break_point_never_drops_text() {
        let config = IngestConfig {
            chunk_size: 100,
            chunk_overlap: 10,
            ..Default::default()
        };
        let chunker = TextChunker::new(&config);

        // A paragraph break just before the chunk boundary pulls the first
        // chunk's end back well before the target; the text after the break
        // must still land in a chunk.
        let mut text = "alpha ".repeat(14);
        text.push_str("\n\nZZZMARKER ");
        text.push_str(&"omega ".repeat(40));
        let doc = create_test_document(&text);

        let chunks = chunker.chunk(&doc);
        assert!(chunks.len() > 1);
        assert!(
            chunks.iter().any(|c| c.text.contains("ZZZMARKER")),
            "text after an early break point must be chunked"
        );
    }

    #[test]
    fn test_page_tracking() {
        let config = IngestConfig {
            chunk_size: 80,
            chunk_overlap: 0,
            ..Default::default()
        };
        let chunker = TextChunker::new(&config);
        let text = format!(
            "## Page 1\n\n{}\n\n## Page 2\n\n{}",
            "alpha beta gamma. ".repeat(5),
            "delta epsilon zeta. ".repeat(5)
        );
        let doc = create_test_document(&text);
        let chunks = chunker.chunk(&doc);

        assert!(chunks.first().unwrap().page == Some(1));
        assert!(chunks.last().unwrap().page == Some(2));
    }

    #[test]
    fn test_section_tracking() {
        let chunker = TextChunker::with_defaults();
        let doc = create_test_document("## Page 3\n\nsome page text here");
        let chunks = chunker.chunk(&doc);
        assert_eq!(chunks[0].section.as_deref(), Some("Page 3"));
        assert_eq!(chunks[0].page, Some(3));
    }

    #[test]
    fn test_parse_page_marker() {
        assert_eq!(parse_page_marker("Page 12"), Some(12));
        assert_eq!(parse_page_marker("Page12"), Some(12));
        assert_eq!(parse_page_marker("Introduction"), None);
    }
}
