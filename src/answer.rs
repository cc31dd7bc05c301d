//! Answering questions from retrieved passages.
//!
//! The generator only sees the passages a search returned; the prompt asks it
//! to answer from them alone and to say so when they are not enough.

use std::fmt::Write as _;

use serde::Serialize;

use crate::{doc_id::DocumentId, error::Result, knowledge_base::SearchResult};

/// Response given when a search found nothing to answer from.
pub const NO_CONTEXT_RESPONSE: &str =
    "No relevant information was found in the knowledge base to answer this question.";

/// Where a passage used for an answer came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnswerSource {
    pub doc_id: DocumentId,
    pub doc_name: String,
    pub chunk_id: usize,
    pub title: String,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub response: String,
    pub sources: Vec<AnswerSource>,
}

impl Answer {
    /// The answer given when there are no passages.
    pub fn no_context() -> Self {
        Self {
            response: NO_CONTEXT_RESPONSE.to_string(),
            sources: Vec::new(),
        }
    }
}

/// Produces a natural-language answer from ranked passages.
pub trait AnswerGenerator: Send + Sync {
    fn generate(&self, query: &str, passages: &[SearchResult]) -> Result<Answer>;
}

pub fn sources(passages: &[SearchResult]) -> Vec<AnswerSource> {
    passages
        .iter()
        .map(|p| AnswerSource {
            doc_id: p.metadata.doc_id,
            doc_name: p.metadata.doc_name.clone(),
            chunk_id: p.metadata.chunk_id,
            title: p.metadata.title.clone(),
            score: p.score,
        })
        .collect()
}

/// Render the passages as numbered excerpts followed by the question.
pub fn build_prompt(query: &str, passages: &[SearchResult]) -> String {
    let mut context = String::new();
    for (i, passage) in passages.iter().enumerate() {
        let _ = write!(
            context,
            "\n\nExcerpt {} ({}, {}):\n{}",
            i + 1,
            passage.metadata.doc_name,
            passage.metadata.title,
            passage.content
        );
    }

    format!(
        "You answer questions using only the information in the excerpts below.\n\
         If the excerpts do not contain the answer, say that there is not enough \
         information to answer. Do not use outside knowledge.\n\n\
         Context:{context}\n\n\
         Question: {query}\n\n\
         Answer clearly and concisely, and cite the excerpts you used."
    )
}
