//! Parsing of the tagged reply the model is instructed to produce.
//!
//! The reply carries a `<quotes>...</quotes>` block followed by an
//! `<answer>...</answer>` block. Only the answer text reaches the student.

use thiserror::Error;

const ANSWER_OPEN: &str = "<answer>";
const ANSWER_CLOSE: &str = "</answer>";
const QUOTES_OPEN: &str = "<quotes>";
const QUOTES_CLOSE: &str = "</quotes>";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedOutput {
    #[error("no <answer> tag in model output")]
    MissingAnswerOpen,

    #[error("no </answer> tag after <answer> in model output")]
    MissingAnswerClose,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerEnvelope {
    pub quotes: Option<String>,
    pub answer: String,
}

/// Extracts the text strictly between the first `<answer>` and the first
/// `</answer>` that follows it. A repeated `<answer>` ends the text early,
/// so the result never contains either tag.
pub fn extract_answer(raw: &str) -> Result<&str, MalformedOutput> {
    let answer = between(raw, ANSWER_OPEN, ANSWER_CLOSE).map_err(|missing| match missing {
        Missing::Open => MalformedOutput::MissingAnswerOpen,
        Missing::Close => MalformedOutput::MissingAnswerClose,
    })?;
    Ok(match answer.find(ANSWER_OPEN) {
        Some(end) => &answer[..end],
        None => answer,
    })
}

pub fn parse_envelope(raw: &str) -> Result<AnswerEnvelope, MalformedOutput> {
    let answer = extract_answer(raw)?.to_string();
    let quotes = between(raw, QUOTES_OPEN, QUOTES_CLOSE)
        .ok()
        .map(|q| q.trim().to_string());
    Ok(AnswerEnvelope { quotes, answer })
}

enum Missing {
    Open,
    Close,
}

fn between<'a>(raw: &'a str, open: &str, close: &str) -> Result<&'a str, Missing> {
    let start = raw.find(open).ok_or(Missing::Open)? + open.len();
    let rest = &raw[start..];
    let end = rest.find(close).ok_or(Missing::Close)?;
    Ok(&rest[..end])
}
