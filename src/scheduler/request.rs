//! Request and outcome types

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use super::registry::RequestTicket;
use crate::config::{CompletionParams, EmbeddingParams, RerankParams, TokenizeParams};
use crate::engine::TokenizeOutput;
use crate::error::{FailureKind, SchedulerError};
use crate::streaming::Emitter;

/// Opaque request handle, unique for the lifetime of a scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Completion,
    Embedding,
    Rerank,
    Tokenize,
}

/// Lifecycle of a request
///
/// `Queued -> Running <-> Streaming -> {Completed, Cancelled, Failed}`;
/// nothing leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RequestState {
    Queued = 0,
    Running = 1,
    Streaming = 2,
    Completed = 3,
    Cancelled = 4,
    Failed = 5,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Cancelled | RequestState::Failed
        )
    }

    /// Holding a slot
    pub fn is_active(self) -> bool {
        matches!(self, RequestState::Running | RequestState::Streaming)
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => RequestState::Queued,
            1 => RequestState::Running,
            2 => RequestState::Streaming,
            3 => RequestState::Completed,
            4 => RequestState::Cancelled,
            _ => RequestState::Failed,
        }
    }
}

/// Input of a queued request
#[derive(Debug, Clone)]
pub(crate) enum Payload {
    Completion(CompletionParams),
    Embedding {
        text: String,
        params: EmbeddingParams,
    },
    Rerank {
        query: String,
        documents: Vec<String>,
        params: RerankParams,
    },
    Tokenize {
        text: String,
        params: TokenizeParams,
    },
}

impl Payload {
    pub fn kind(&self) -> RequestKind {
        match self {
            Payload::Completion(_) => RequestKind::Completion,
            Payload::Embedding { .. } => RequestKind::Embedding,
            Payload::Rerank { .. } => RequestKind::Rerank,
            Payload::Tokenize { .. } => RequestKind::Tokenize,
        }
    }

    pub fn batch_units(&self) -> usize {
        match self {
            Payload::Completion(params) => params.batch_units,
            Payload::Embedding { params, .. } => params.batch_units,
            Payload::Rerank { params, .. } => params.batch_units,
            Payload::Tokenize { params, .. } => params.batch_units,
        }
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        match self {
            Payload::Completion(params) => params.validate(),
            Payload::Embedding { params, .. } => params.validate(),
            Payload::Rerank {
                documents, params, ..
            } => {
                if documents.is_empty() {
                    return Err(SchedulerError::config("rerank needs at least one document"));
                }
                params.validate()
            }
            Payload::Tokenize { params, .. } => params.validate(),
        }
    }
}

/// A request owned by the dispatcher from enqueue until its outcome
pub(crate) struct Request {
    pub id: RequestId,
    pub payload: Payload,
    pub created_at: Instant,
    pub ticket: Arc<RequestTicket>,
    pub emitter: Emitter,
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        self.payload.kind()
    }
}

/// Why a completion stopped generating
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The engine produced end-of-generation
    Eos,
    /// `max_tokens` or the context edge was reached
    Limit,
    /// A stop sequence appeared
    StopWord(String),
    Cancelled,
}

/// Wall-clock timings of a completion
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Timings {
    pub prompt_ms: f64,
    pub predicted_ms: f64,
    pub predicted_per_second: f64,
}

impl Timings {
    pub(crate) fn new(prompt_ms: f64, predicted_ms: f64, predicted: usize) -> Self {
        let predicted_per_second = if predicted_ms > 0.0 {
            predicted as f64 * 1000.0 / predicted_ms
        } else {
            0.0
        };
        Self {
            prompt_ms,
            predicted_ms,
            predicted_per_second,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompletionOutput {
    /// Full text produced, ending before any stop word
    pub text: String,
    /// Number of tokens delivered through token callbacks
    pub tokens_predicted: usize,
    /// Prompt length in tokens
    pub tokens_evaluated: usize,
    pub stop_reason: Option<StopReason>,
    pub timings: Timings,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RerankScore {
    /// Position of the document in the request
    pub index: usize,
    pub score: f32,
}

impl RerankScore {
    /// Scores ordered best first, ties by document order
    pub fn ranked(scores: &[f32]) -> Vec<RerankScore> {
        let mut ranked: Vec<RerankScore> = scores
            .iter()
            .enumerate()
            .map(|(index, &score)| RerankScore { index, score })
            .collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Output {
    Completion(CompletionOutput),
    Embedding { embedding: Vec<f32> },
    Rerank { results: Vec<RerankScore> },
    Tokenize(TokenizeOutput),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    Completed,
    Cancelled,
    Failed {
        #[serde(rename = "error_type")]
        kind: FailureKind,
        message: String,
    },
}

/// Final result of a request, delivered exactly once
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome {
    pub id: RequestId,
    pub kind: RequestKind,
    #[serde(flatten)]
    pub status: OutcomeStatus,
    /// Always present for completions, including partial text on cancel or failure
    pub output: Option<Output>,
}

impl Outcome {
    pub(crate) fn completed(id: RequestId, kind: RequestKind, output: Output) -> Self {
        Self {
            id,
            kind,
            status: OutcomeStatus::Completed,
            output: Some(output),
        }
    }

    pub(crate) fn cancelled(id: RequestId, kind: RequestKind) -> Self {
        Self {
            id,
            kind,
            status: OutcomeStatus::Cancelled,
            output: Self::empty_output(kind, Some(StopReason::Cancelled)),
        }
    }

    pub(crate) fn failed(
        id: RequestId,
        kind: RequestKind,
        failure: FailureKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id,
            kind,
            status: OutcomeStatus::Failed {
                kind: failure,
                message: message.into(),
            },
            output: Self::empty_output(kind, None),
        }
    }

    fn empty_output(kind: RequestKind, stop_reason: Option<StopReason>) -> Option<Output> {
        (kind == RequestKind::Completion).then(|| {
            Output::Completion(CompletionOutput {
                stop_reason,
                ..Default::default()
            })
        })
    }

    /// Terminal state this outcome moves its request into
    pub fn state(&self) -> RequestState {
        match self.status {
            OutcomeStatus::Completed => RequestState::Completed,
            OutcomeStatus::Cancelled => RequestState::Cancelled,
            OutcomeStatus::Failed { .. } => RequestState::Failed,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == OutcomeStatus::Completed
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == OutcomeStatus::Cancelled
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match &self.status {
            OutcomeStatus::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn completion(&self) -> Option<&CompletionOutput> {
        match &self.output {
            Some(Output::Completion(out)) => Some(out),
            _ => None,
        }
    }

    /// Completion text, if this is a completion
    pub fn text(&self) -> Option<&str> {
        self.completion().map(|out| out.text.as_str())
    }
}
