//! Local artifacts shared between the scrape, index and upload stages.

use std::fs;
use std::path::PathBuf;

use crate::error::{AdvisorError, AdvisorResult};
use crate::models::SourceDocument;

const URLS_FILE: &str = "website_urls.json";
const DOCUMENTS_FILE: &str = "website_data.json";
const XML_CORPUS_FILE: &str = "website_data_string.txt";
const MARKDOWN_CORPUS_FILE: &str = "website_data_string_md.txt";

/// Rough tokens-per-word ratio used for the corpus size estimate.
const TOKENS_PER_WORD: f64 = 1.30;

pub struct DocumentStore {
    dir: PathBuf,
}

impl DocumentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Writes the URL list, the documents and both rendered corpora.
    pub fn save(&self, urls: &[String], documents: &[SourceDocument]) -> AdvisorResult<()> {
        fs::create_dir_all(&self.dir)?;

        fs::write(self.path(URLS_FILE), serde_json::to_vec_pretty(urls)?)?;
        fs::write(self.path(DOCUMENTS_FILE), serde_json::to_vec_pretty(documents)?)?;

        let xml = render_xml_corpus(documents);
        log_corpus_size("XML", &xml);
        fs::write(self.path(XML_CORPUS_FILE), xml)?;

        let markdown = render_markdown_corpus(documents);
        log_corpus_size("markdown", &markdown);
        fs::write(self.path(MARKDOWN_CORPUS_FILE), markdown)?;

        tracing::info!("Saved {} documents to {}", documents.len(), self.dir.display());
        Ok(())
    }

    pub fn load_urls(&self) -> AdvisorResult<Vec<String>> {
        let bytes = self.read(URLS_FILE)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn load_documents(&self) -> AdvisorResult<Vec<SourceDocument>> {
        let bytes = self.read(DOCUMENTS_FILE)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    #[cfg(test)]
    pub fn load_xml_corpus(&self) -> AdvisorResult<String> {
        Ok(String::from_utf8_lossy(&self.read(XML_CORPUS_FILE)?).into_owned())
    }

    pub fn load_markdown_corpus(&self) -> AdvisorResult<String> {
        Ok(String::from_utf8_lossy(&self.read(MARKDOWN_CORPUS_FILE)?).into_owned())
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn read(&self, name: &str) -> AdvisorResult<Vec<u8>> {
        let path = self.path(name);
        fs::read(&path).map_err(|e| {
            AdvisorError::Io(std::io::Error::new(
                e.kind(),
                format!("{}: {} (run `chatadv scrape` first?)", path.display(), e),
            ))
        })
    }
}

/// One document as a markdown block; also the body of each uploaded file.
pub fn render_markdown_document(index: usize, doc: &SourceDocument) -> String {
    format!(
        "# Document {}\n## Title: {}\n## Source: {}\n## Contents:\n{}\n",
        index, doc.title, doc.source, doc.content
    )
}

pub fn render_markdown_corpus(documents: &[SourceDocument]) -> String {
    let mut out = String::new();
    for (index, doc) in documents.iter().enumerate() {
        out.push_str(&render_markdown_document(index, doc));
        out.push_str("\n\n");
    }
    out
}

pub fn render_xml_corpus(documents: &[SourceDocument]) -> String {
    let mut out = String::from("<documents>");
    for (index, doc) in documents.iter().enumerate() {
        out.push_str(&format!(
            "<document index='{}'><source>{}</source><document_content>{}</document_content></document>",
            index, doc.source, doc.content
        ));
    }
    out.push_str("</documents>");
    out
}

/// (words, approximate tokens)
pub fn corpus_size(text: &str) -> (usize, f64) {
    let words = text.matches(' ').count() + 1;
    (words, words as f64 * TOKENS_PER_WORD)
}

fn log_corpus_size(kind: &str, text: &str) {
    let (words, tokens) = corpus_size(text);
    tracing::info!(
        "{} corpus: {} words, approximately {:.0} tokens",
        kind,
        words,
        tokens
    );
}
