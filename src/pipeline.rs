//! Query path: question → retrieval → prompt → model → answer.
//!
//! An `AdvisorBackend` is built once at startup and handed to every surface
//! (terminal chat, HTTP API, one-shot `ask`); nothing here is global.

use std::sync::Arc;

use crate::answer::{parse_envelope, AnswerEnvelope};
use crate::config::Settings;
use crate::embedder::{Embedder, OpenAiEmbedder};
use crate::error::{AdvisorError, AdvisorResult};
use crate::hosted::HostedAdvisor;
use crate::llm::{ChatModel, OpenAiChatModel};
use crate::models::ScoredChunk;
use crate::prompt::PromptTemplate;
use crate::vector_store::VectorIndex;

pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: VectorIndex,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, index: VectorIndex) -> Self {
        if embedder.model() != index.model() {
            tracing::warn!(
                "Index was built with {} but queries use {}",
                index.model(),
                embedder.model()
            );
        }
        Self { embedder, index }
    }

    pub async fn retrieve(&self, question: &str, k: usize) -> AdvisorResult<Vec<ScoredChunk>> {
        let query = self.embedder.embed(question).await?;
        self.index.search(&query, k)
    }
}

#[derive(Debug, Clone)]
pub struct Answer {
    pub text: String,
    pub quotes: Option<String>,
    pub sources: Vec<ScoredChunk>,
}

pub struct Advisor {
    retriever: Retriever,
    template: PromptTemplate,
    model: Arc<dyn ChatModel>,
    top_k: usize,
}

impl Advisor {
    pub fn new(
        retriever: Retriever,
        template: PromptTemplate,
        model: Arc<dyn ChatModel>,
        top_k: usize,
    ) -> Self {
        Self {
            retriever,
            template,
            model,
            top_k,
        }
    }

    /// Wires the OpenAI-backed collaborators from settings and loads the persisted index.
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let api_key = settings.require_api_key()?;
        let embedder = OpenAiEmbedder::new(api_key, &settings.base_url, &settings.embedding_model)?;
        let model = OpenAiChatModel::new(api_key, &settings.base_url, &settings.chat_model)?;
        let index = VectorIndex::load(&settings.index_dir)?;
        let template = PromptTemplate::load(&settings.prompt_path)?;

        tracing::info!(
            "Advisor ready: {} chunks, chat model {}, top_k {}",
            index.len(),
            settings.chat_model,
            settings.top_k
        );

        Ok(Self::new(
            Retriever::new(Arc::new(embedder), index),
            template,
            Arc::new(model),
            settings.top_k,
        ))
    }

    pub async fn answer(&self, question: &str) -> AdvisorResult<Answer> {
        let question = question.trim();
        if question.is_empty() {
            return Err(AdvisorError::EmptyQuestion);
        }

        let sources = self.retriever.retrieve(question, self.top_k).await?;
        tracing::debug!(
            "Retrieved {} chunks: {:?}",
            sources.len(),
            sources.iter().map(|s| s.chunk.source.as_str()).collect::<Vec<_>>()
        );

        let prompt = self.template.assemble(question, &sources);
        let raw = self.model.complete(&prompt).await?;

        let AnswerEnvelope { quotes, answer } = parse_envelope(&raw).map_err(|e| {
            tracing::warn!("Model reply could not be parsed ({}): {:?}", e, raw);
            AdvisorError::from(e)
        })?;

        if let Some(quotes) = &quotes {
            tracing::debug!("Model quotes: {}", quotes);
        }

        Ok(Answer {
            text: answer,
            quotes,
            sources,
        })
    }

    /// The answer text only, as the chat surfaces consume it.
    pub async fn answer_for(&self, question: &str) -> AdvisorResult<String> {
        Ok(self.answer(question).await?.text)
    }
}

/// One answered turn. `response_id` is set only by the hosted backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub response_id: Option<String>,
}

/// Where answers come from: the local index, or file search over the hosted store.
pub enum AdvisorBackend {
    Local(Advisor),
    Hosted(HostedAdvisor),
}

impl From<Advisor> for AdvisorBackend {
    fn from(advisor: Advisor) -> Self {
        AdvisorBackend::Local(advisor)
    }
}

impl From<HostedAdvisor> for AdvisorBackend {
    fn from(advisor: HostedAdvisor) -> Self {
        AdvisorBackend::Hosted(advisor)
    }
}

impl AdvisorBackend {
    pub fn from_settings(settings: &Settings, hosted: bool) -> anyhow::Result<Self> {
        if !hosted {
            return Ok(Advisor::from_settings(settings)?.into());
        }

        let instructions = HostedAdvisor::load_instructions(&settings.instructions_path)?;
        let advisor = HostedAdvisor::new(
            settings.require_api_key()?,
            &settings.base_url,
            &settings.chat_model,
            settings.require_vector_store_id()?,
            instructions,
        )?;
        tracing::info!(
            "Hosted advisor ready: vector store {}, chat model {}",
            advisor.vector_store_id(),
            settings.chat_model
        );
        Ok(advisor.into())
    }

    /// Answers one question. `previous_response_id` continues a hosted
    /// conversation; the local backend is stateless and ignores it.
    pub async fn reply(&self, question: &str, previous_response_id: Option<&str>) -> AdvisorResult<Reply> {
        match self {
            AdvisorBackend::Local(advisor) => Ok(Reply {
                text: advisor.answer_for(question).await?,
                response_id: None,
            }),
            AdvisorBackend::Hosted(advisor) => {
                let question = question.trim();
                if question.is_empty() {
                    return Err(AdvisorError::EmptyQuestion);
                }

                let hosted = advisor.respond(question, previous_response_id).await?;
                let AnswerEnvelope { answer, .. } = parse_envelope(&hosted.text).map_err(|e| {
                    tracing::warn!("Hosted reply could not be parsed ({}): {:?}", e, hosted.text);
                    AdvisorError::from(e)
                })?;

                Ok(Reply {
                    text: answer,
                    response_id: Some(hosted.response_id),
                })
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::chunker::{chunk_markdown, RecursiveSplitter};
    use crate::document_store::render_markdown_corpus;
    use crate::embedder::testing::KeywordEmbedder;
    use crate::llm::testing::ScriptedModel;
    use crate::models::SourceDocument;

    pub const ISA_SOURCE: &str = "https://bulletin.miamioh.edu/courses-instruction/isa/";
    pub const FIN_SOURCE: &str = "https://bulletin.miamioh.edu/farmer-business/finance-bsb/";

    pub const WELL_FORMED_REPLY: &str = "<quotes>\n[1] Prerequisite: ISA 245 or CSE 385.\n</quotes>\n<answer>\nThe prerequisite for ISA 401 is ISA 245 or CSE 385 [1].\n\n**Source:** \n[1] https://bulletin.miamioh.edu/courses-instruction/isa/\n</answer>";

    pub fn two_document_corpus() -> Vec<SourceDocument> {
        vec![
            SourceDocument::new(
                ISA_SOURCE.into(),
                "Information Systems and Analytics (ISA) Courses".into(),
                "ISA 401. Business Intelligence and Data Visualization. 3 cr.\nPrerequisite: ISA 245 or CSE 385.".into(),
            ),
            SourceDocument::new(
                FIN_SOURCE.into(),
                "Finance, BSB".into(),
                "Program Requirements\nFIN 301 Money and Banking\nFIN 401 Principles of Investments".into(),
            ),
        ]
    }

    pub async fn advisor_with_reply(reply: &str) -> (Advisor, Arc<ScriptedModel>) {
        let embedder = Arc::new(KeywordEmbedder::new(&["isa", "prerequisite", "finance", "investments"]));
        let chunks = chunk_markdown(
            &render_markdown_corpus(&two_document_corpus()),
            &RecursiveSplitter::default(),
        )
        .unwrap();
        let index = VectorIndex::build(embedder.as_ref(), &chunks).await.unwrap();
        let template = PromptTemplate::parse(include_str!("../prompts/advising_prompt.txt")).unwrap();
        let model = Arc::new(ScriptedModel::new(reply));

        let advisor = Advisor::new(Retriever::new(embedder, index), template, model.clone(), 1);
        (advisor, model)
    }
}
