use thiserror::Error;

use crate::backend::BackendError;

/// Failures the pipeline surfaces to its caller. Everything else (missing
/// DOM nodes, unparseable text, single-question backend errors, single-field
/// fill errors) degrades to a partial result instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Unknown question id: {0}")]
    UnknownQuestion(String),

    #[error("Generation backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("Generation failed for {question_id}: {source}")]
    Generation {
        question_id: String,
        #[source]
        source: BackendError,
    },

    #[error("Not a supported job page: {0}")]
    NotJobBoard(String),

    #[error("No screening questions detected on this page")]
    NoQuestions,

    #[error("Malformed command: {0}")]
    Malformed(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
