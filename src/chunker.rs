use std::collections::{HashMap, VecDeque};

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

use crate::models::Chunk;

pub const DEFAULT_CHUNK_SIZE: usize = 7500;
pub const DEFAULT_CHUNK_OVERLAP: usize = 500;

const SOURCE_PREFIX: &str = "## Source: ";
const SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

lazy_static! {
    static ref DOCUMENT_HEADING: Regex = Regex::new(r"^# Document (\d+)\s*$").unwrap();
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("document {webpage} has no \"## Source:\" line")]
    MissingSource { webpage: usize },

    #[error("chunk size {size} must be larger than overlap {overlap} and at least 2")]
    InvalidSize { size: usize, overlap: usize },
}

/// One source document's slice of the markdown corpus, heading removed.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub webpage: usize,
    pub content: String,
}

/// Splits the markdown corpus on its `# Document {n}` headings.
///
/// Text before the first heading belongs to no document and is dropped.
pub fn split_on_documents(markdown: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut current: Option<(usize, Vec<&str>)> = None;

    for line in markdown.split('\n') {
        let heading = DOCUMENT_HEADING
            .captures(line)
            .and_then(|caps| caps[1].parse::<usize>().ok());

        match heading {
            Some(webpage) => {
                if let Some((idx, lines)) = current.take() {
                    blocks.push(finish_block(idx, &lines));
                }
                current = Some((webpage, Vec::new()));
            }
            None => match current.as_mut() {
                Some((_, lines)) => lines.push(line),
                None if !line.trim().is_empty() => {
                    tracing::debug!("Dropping text before first document heading: {:?}", line);
                }
                None => {}
            },
        }
    }

    if let Some((idx, lines)) = current {
        blocks.push(finish_block(idx, &lines));
    }

    blocks
}

fn finish_block(webpage: usize, lines: &[&str]) -> Block {
    Block {
        webpage,
        content: lines.join("\n").trim().to_string(),
    }
}

/// Reads the `## Source: ` line out of a block.
pub fn block_source(block: &Block) -> Result<String, ChunkError> {
    block
        .content
        .lines()
        .find_map(|line| line.strip_prefix(SOURCE_PREFIX))
        .map(|source| source.trim().to_string())
        .ok_or(ChunkError::MissingSource {
            webpage: block.webpage,
        })
}

pub fn source_line(source: &str) -> String {
    format!("{}{}", SOURCE_PREFIX, source)
}

/// Character-count splitter that tries paragraph, line, word and finally
/// character boundaries, carrying up to `chunk_overlap` characters of the
/// previous chunk into the next one.
#[derive(Debug, Clone, Copy)]
pub struct RecursiveSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl Default for RecursiveSplitter {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

impl RecursiveSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self, ChunkError> {
        if chunk_size < 2 || chunk_overlap >= chunk_size {
            return Err(ChunkError::InvalidSize {
                size: chunk_size,
                overlap: chunk_overlap,
            });
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
        })
    }

    pub fn split_text(&self, text: &str) -> Vec<String> {
        self.split_with(text, &SEPARATORS)
    }

    fn split_with(&self, text: &str, separators: &[&str]) -> Vec<String> {
        let position = separators
            .iter()
            .position(|sep| sep.is_empty() || text.contains(sep))
            .unwrap_or(separators.len() - 1);
        let separator = separators[position];
        let finer = &separators[position + 1..];

        let pieces: Vec<&str> = if separator.is_empty() {
            text.char_indices()
                .map(|(i, c)| &text[i..i + c.len_utf8()])
                .collect()
        } else {
            text.split(separator).filter(|p| !p.is_empty()).collect()
        };

        let mut chunks = Vec::new();
        let mut fitting: Vec<&str> = Vec::new();

        for piece in pieces {
            if char_len(piece) < self.chunk_size {
                fitting.push(piece);
                continue;
            }
            if !fitting.is_empty() {
                chunks.extend(self.merge(&fitting, separator));
                fitting.clear();
            }
            if finer.is_empty() {
                chunks.push(piece.to_string());
            } else {
                chunks.extend(self.split_with(piece, finer));
            }
        }

        if !fitting.is_empty() {
            chunks.extend(self.merge(&fitting, separator));
        }

        chunks
    }

    /// Greedily packs pieces into chunks no longer than `chunk_size`.
    fn merge(&self, pieces: &[&str], separator: &str) -> Vec<String> {
        let sep_len = char_len(separator);
        let mut merged = Vec::new();
        let mut window: VecDeque<&str> = VecDeque::new();
        let mut total = 0usize;

        for &piece in pieces {
            let len = char_len(piece);
            let joiner = if window.is_empty() { 0 } else { sep_len };

            if total + len + joiner > self.chunk_size && !window.is_empty() {
                if let Some(chunk) = join_window(&window, separator) {
                    merged.push(chunk);
                }
                // Shrink from the front until only the overlap remains and the next piece fits.
                loop {
                    let joiner = if window.is_empty() { 0 } else { sep_len };
                    let must_shrink = total > self.chunk_overlap
                        || (total > 0 && total + len + joiner > self.chunk_size);
                    if !must_shrink {
                        break;
                    }
                    match window.pop_front() {
                        Some(front) => {
                            total -= char_len(front) + if window.is_empty() { 0 } else { sep_len };
                        }
                        None => break,
                    }
                }
            }

            total += len + if window.is_empty() { 0 } else { sep_len };
            window.push_back(piece);
        }

        if let Some(chunk) = join_window(&window, separator) {
            merged.push(chunk);
        }

        merged
    }
}

fn join_window(window: &VecDeque<&str>, separator: &str) -> Option<String> {
    let joined = window.iter().copied().collect::<Vec<_>>().join(separator);
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Splits the markdown corpus into bounded chunks, each of which names its source.
pub fn chunk_markdown(markdown: &str, splitter: &RecursiveSplitter) -> Result<Vec<Chunk>, ChunkError> {
    let blocks = split_on_documents(markdown);

    let mut sources: HashMap<usize, String> = HashMap::new();
    for block in &blocks {
        sources.insert(block.webpage, block_source(block)?);
    }

    let mut chunks = Vec::new();
    let mut repaired = 0usize;

    for block in &blocks {
        let source = &sources[&block.webpage];
        let line = source_line(source);

        for piece in splitter.split_text(&block.content) {
            let content = if piece.contains(&line) {
                piece
            } else {
                repaired += 1;
                format!("{}\n{}\n", piece, line)
            };
            chunks.push(Chunk {
                webpage: block.webpage,
                source: source.clone(),
                content,
            });
        }
    }

    tracing::info!(
        "Split {} documents into {} chunks ({} needed a source line re-attached)",
        blocks.len(),
        chunks.len(),
        repaired
    );

    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document_store::render_markdown_corpus;
    use crate::models::SourceDocument;

    fn long_body(lines: usize) -> String {
        (0..lines)
            .map(|i| {
                format!(
                    "Line {:04}: students must complete the business core and meet with an advisor.",
                    i
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn corpus(docs: &[SourceDocument]) -> String {
        render_markdown_corpus(docs)
    }

    #[test]
    fn test_split_on_document_headings() {
        let docs = vec![
            SourceDocument::new(
                "https://bulletin.miamioh.edu/courses-instruction/isa/".into(),
                "ISA Courses".into(),
                "ISA 401. Prerequisite: ISA 245 or CSE 385.".into(),
            ),
            SourceDocument::new(
                "https://bulletin.miamioh.edu/farmer-business/".into(),
                "Farmer School".into(),
                "Business core requirements.".into(),
            ),
        ];
        let blocks = split_on_documents(&corpus(&docs));

        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].webpage, 0);
        assert_eq!(blocks[1].webpage, 1);
        assert!(!blocks[0].content.contains("# Document"));
        assert!(blocks[0].content.starts_with("## Title: ISA Courses"));
        assert_eq!(
            block_source(&blocks[0]).unwrap(),
            "https://bulletin.miamioh.edu/courses-instruction/isa/"
        );
    }

    #[test]
    fn test_subheadings_are_not_document_boundaries() {
        let md = "# Document 3\n## Title: t\n## Source: s\n## Document 4\nbody\n";
        let blocks = split_on_documents(md);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].webpage, 3);
        assert!(blocks[0].content.contains("## Document 4"));
    }

    #[test]
    fn test_missing_source_is_an_error() {
        let md = "# Document 0\n## Title: no source here\nbody";
        let err = chunk_markdown(md, &RecursiveSplitter::default()).unwrap_err();
        assert_eq!(err, ChunkError::MissingSource { webpage: 0 });
    }

    #[test]
    fn test_every_chunk_names_its_source_exactly_once() {
        let docs = vec![
            SourceDocument::new("https://example.edu/a/".into(), "A".into(), long_body(400)),
            SourceDocument::new("https://example.edu/b/".into(), "B".into(), "Short page.".into()),
            SourceDocument::new("https://example.edu/c/".into(), "C".into(), long_body(250)),
        ];
        let chunks = chunk_markdown(&corpus(&docs), &RecursiveSplitter::default()).unwrap();

        assert!(chunks.len() > docs.len(), "long documents should be split");
        for chunk in &chunks {
            let expected = &docs[chunk.webpage].source;
            assert_eq!(&chunk.source, expected);
            assert_eq!(chunk.content.matches(SOURCE_PREFIX).count(), 1, "{}", chunk.content);
            assert!(chunk.content.contains(&source_line(expected)));
        }
    }

    #[test]
    fn test_chunk_size_bound_after_repair() {
        let source = "https://example.edu/long/";
        let docs = vec![SourceDocument::new(source.into(), "Long".into(), long_body(600))];
        let chunks = chunk_markdown(&corpus(&docs), &RecursiveSplitter::default()).unwrap();
        let repair_len = char_len(&format!("\n{}\n", source_line(source)));

        for chunk in &chunks {
            assert!(char_len(&chunk.content) <= DEFAULT_CHUNK_SIZE + repair_len);
        }
    }

    #[test]
    fn test_consecutive_chunks_overlap() {
        let source = "https://example.edu/long/";
        let docs = vec![SourceDocument::new(source.into(), "Long".into(), long_body(400))];
        let chunks = chunk_markdown(&corpus(&docs), &RecursiveSplitter::default()).unwrap();
        let suffix = format!("\n{}\n", source_line(source));

        for pair in chunks.windows(2) {
            let previous = pair[0].content.trim_end_matches(suffix.as_str());
            let last_line = previous.lines().last().unwrap();
            assert!(
                pair[1].content.contains(last_line),
                "expected {:?} to be carried into the next chunk",
                last_line
            );
        }
    }

    #[test]
    fn test_small_splitter_respects_bound() {
        let splitter = RecursiveSplitter::new(20, 5).unwrap();
        let text = "alpha beta gamma delta epsilon zeta eta theta iota kappa lambda mu";
        let pieces = splitter.split_text(text);
        assert!(pieces.len() > 1);
        for piece in &pieces {
            assert!(char_len(piece) <= 20, "{:?}", piece);
        }
        assert!(pieces[0].starts_with("alpha"));
        assert!(pieces.last().unwrap().ends_with("mu"));
    }

    #[test]
    fn test_unbroken_text_falls_back_to_characters() {
        let splitter = RecursiveSplitter::new(10, 2).unwrap();
        let text = "é".repeat(35);
        let pieces = splitter.split_text(&text);
        assert!(pieces.iter().all(|p| char_len(p) <= 10));
        assert!(pieces.len() >= 4);
    }

    #[test]
    fn test_invalid_sizes_rejected() {
        assert!(RecursiveSplitter::new(100, 100).is_err());
        assert!(RecursiveSplitter::new(1, 0).is_err());
        assert!(RecursiveSplitter::new(100, 10).is_ok());
    }
}
