use std::path::Path;

use crate::error::{AdvisorError, AdvisorResult};
use crate::models::ScoredChunk;

const QUESTION: &str = "{question}";
const CONTEXT: &str = "{context}";

/// Instruction template with one `{question}` slot followed by one `{context}` slot.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    before_question: String,
    between: String,
    after_context: String,
}

impl PromptTemplate {
    pub fn load(path: &Path) -> AdvisorResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            AdvisorError::Template(format!("cannot read {}: {}", path.display(), e))
        })?;
        let template = Self::parse(&text)?;
        tracing::debug!("Loaded prompt template from {}", path.display());
        Ok(template)
    }

    pub fn parse(text: &str) -> AdvisorResult<Self> {
        for placeholder in [QUESTION, CONTEXT] {
            match text.matches(placeholder).count() {
                1 => {}
                0 => return Err(AdvisorError::Template(format!("missing {}", placeholder))),
                n => {
                    return Err(AdvisorError::Template(format!(
                        "{} appears {} times",
                        placeholder, n
                    )))
                }
            }
        }

        let (before_question, rest) = text
            .split_once(QUESTION)
            .ok_or_else(|| AdvisorError::Template(format!("missing {}", QUESTION)))?;
        let (between, after_context) = rest
            .split_once(CONTEXT)
            .ok_or_else(|| AdvisorError::Template(format!("{} must come after {}", CONTEXT, QUESTION)))?;

        Ok(Self {
            before_question: before_question.to_string(),
            between: between.to_string(),
            after_context: after_context.to_string(),
        })
    }

    /// Fills both slots in a single pass; braces inside the inputs are left alone.
    pub fn render(&self, question: &str, context: &str) -> String {
        let mut out = String::with_capacity(
            self.before_question.len()
                + question.len()
                + self.between.len()
                + context.len()
                + self.after_context.len(),
        );
        out.push_str(&self.before_question);
        out.push_str(question);
        out.push_str(&self.between);
        out.push_str(context);
        out.push_str(&self.after_context);
        out
    }

    pub fn assemble(&self, question: &str, chunks: &[ScoredChunk]) -> String {
        self.render(question, &format_context(chunks))
    }
}

/// Retrieved chunk texts in rank order, separated by blank lines.
pub fn format_context(chunks: &[ScoredChunk]) -> String {
    chunks
        .iter()
        .map(|c| c.chunk.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}
