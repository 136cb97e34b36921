//! Query pipeline: history fetch ∥ similarity search → prompt → generation
//! → persistence.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::Instrument;
use uuid::Uuid;

use super::events::StreamEvent;
use crate::core::config::OrchestratorSettings;
use crate::core::errors::{Dependency, ErrorBody, RagError};
use crate::embedding::{EmbeddingIndex, Retrieval, ScoredDocument};
use crate::history::{ConversationStore, NewTurn, SourceRef, Turn};
use crate::llm::LlmGateway;
use crate::prompt::{Prompt, PromptAssembler};

const EVENT_BUFFER: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerRequest {
    pub question: String,
    pub user_id: String,
    /// Overrides the configured number of retrieved documents.
    #[serde(default)]
    pub max_results: Option<usize>,
    #[serde(default = "default_true")]
    pub include_history: bool,
}

fn default_true() -> bool {
    true
}

impl AnswerRequest {
    pub fn new(question: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            user_id: user_id.into(),
            max_results: None,
            include_history: true,
        }
    }

    fn validate(&self) -> Result<(), RagError> {
        if self.question.trim().is_empty() {
            return Err(RagError::InvalidRequest("question cannot be empty".to_string()));
        }
        if self.user_id.trim().is_empty() {
            return Err(RagError::InvalidRequest("user_id cannot be empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnswerResponse {
    pub request_id: String,
    pub user_id: String,
    pub response: String,
    pub sources: Vec<ScoredDocument>,
    pub citations: Vec<String>,
    pub history_saved: bool,
    /// Dependencies that failed without failing the request.
    pub degraded: Vec<ErrorBody>,
}

/// Lifecycle of one request, logged at debug level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Received,
    HistoryFetched,
    ContextRetrieved,
    PromptAssembled,
    Generating,
    Persisted,
    Done,
    Failed,
}

impl fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestPhase::Received => "RECEIVED",
            RequestPhase::HistoryFetched => "HISTORY_FETCHED",
            RequestPhase::ContextRetrieved => "CONTEXT_RETRIEVED",
            RequestPhase::PromptAssembled => "PROMPT_ASSEMBLED",
            RequestPhase::Generating => "GENERATING",
            RequestPhase::Persisted => "PERSISTED",
            RequestPhase::Done => "DONE",
            RequestPhase::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

fn enter(phase: RequestPhase) {
    tracing::debug!(phase = %phase, "Request phase");
}

/// Inputs gathered before generation.
struct Gathered {
    retrieval: Retrieval,
    prompt: Prompt,
    degraded: Vec<ErrorBody>,
}

enum StreamOutcome {
    Completed,
    Failed(RagError),
    Cancelled,
}

#[derive(Clone)]
pub struct RagOrchestrator {
    index: Arc<EmbeddingIndex>,
    history: Arc<dyn ConversationStore>,
    gateway: Arc<LlmGateway>,
    assembler: PromptAssembler,
    settings: OrchestratorSettings,
}

impl RagOrchestrator {
    pub fn new(
        index: Arc<EmbeddingIndex>,
        history: Arc<dyn ConversationStore>,
        gateway: Arc<LlmGateway>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            index,
            history,
            gateway,
            assembler: PromptAssembler::new(settings.history_turns, settings.max_context_chars),
            settings,
        }
    }

    /// Batch mode: generate the whole answer, persist the exchange, return.
    ///
    /// Only generation failures fail the request. History and retrieval
    /// failures degrade to empty inputs; a persistence failure is reported
    /// through `history_saved` and `degraded`.
    pub async fn answer(&self, request: AnswerRequest) -> Result<AnswerResponse, RagError> {
        request.validate()?;
        let request_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!("rag_answer", request_id = %request_id, user_id = %request.user_id);

        async move {
            enter(RequestPhase::Received);
            let Gathered {
                retrieval,
                prompt,
                mut degraded,
            } = self.gather(&request).await;

            enter(RequestPhase::Generating);
            let generation = self.generation_timeout();
            let response = match tokio::time::timeout(generation, self.gateway.generate(prompt.to_request())).await {
                Ok(Ok(text)) => text,
                Ok(Err(err)) => return Err(fail(err)),
                Err(_) => return Err(fail(timeout_error(Dependency::Generation, generation))),
            };

            let citations = prompt.citations(&response);
            let history_saved = match self
                .persist(&request, &response, &retrieval, false)
                .await
            {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!("Answer delivered but history was not saved: {}", err);
                    degraded.push(err.to_body());
                    false
                }
            };

            enter(RequestPhase::Done);
            tracing::info!(
                sources = retrieval.len(),
                chars = response.len(),
                history_saved,
                "Answer generated"
            );
            Ok(AnswerResponse {
                request_id,
                user_id: request.user_id.clone(),
                response,
                sources: retrieval,
                citations,
                history_saved,
                degraded,
            })
        }
        .instrument(span)
        .await
    }

    /// Streaming mode. Events arrive as `sources`, `chunk`*, then `done` or
    /// a terminal `error`.
    ///
    /// Dropping the receiver cancels generation: the upstream stream is
    /// released and, when `persist_partial_on_cancel` is set, the text
    /// produced so far is stored as an incomplete turn.
    pub async fn answer_stream(
        &self,
        request: AnswerRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, RagError> {
        request.validate()?;
        let request_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!("rag_stream", request_id = %request_id, user_id = %request.user_id);

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let this = self.clone();
        tokio::spawn(
            async move {
                this.run_stream(request, request_id, tx).await;
            }
            .instrument(span),
        );
        Ok(rx)
    }

    async fn run_stream(&self, request: AnswerRequest, request_id: String, tx: mpsc::Sender<StreamEvent>) {
        enter(RequestPhase::Received);
        let Gathered {
            retrieval,
            prompt,
            mut degraded,
        } = self.gather(&request).await;

        let sources = StreamEvent::Sources {
            request_id,
            sources: retrieval.clone(),
        };
        if tx.send(sources).await.is_err() {
            tracing::info!("Caller disconnected before generation");
            return;
        }

        enter(RequestPhase::Generating);
        let generation = self.generation_timeout();
        let opened = tokio::select! {
            _ = tx.closed() => {
                tracing::info!("Caller disconnected before the stream opened");
                return;
            }
            opened = tokio::time::timeout(generation, self.gateway.generate_stream(prompt.to_request())) => opened,
        };
        let mut upstream = match opened {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                let _ = tx.send(StreamEvent::error(&fail(err))).await;
                return;
            }
            Err(_) => {
                let err = fail(timeout_error(Dependency::Generation, generation));
                let _ = tx.send(StreamEvent::error(&err)).await;
                return;
            }
        };

        let mut text = String::new();
        let outcome = loop {
            let next = tokio::select! {
                _ = tx.closed() => break StreamOutcome::Cancelled,
                next = tokio::time::timeout(generation, upstream.recv()) => next,
            };
            match next {
                Ok(Some(Ok(chunk))) => {
                    text.push_str(&chunk);
                    if tx.send(StreamEvent::Chunk { content: chunk }).await.is_err() {
                        break StreamOutcome::Cancelled;
                    }
                }
                Ok(Some(Err(err))) => break StreamOutcome::Failed(err),
                Ok(None) => break StreamOutcome::Completed,
                Err(_) => break StreamOutcome::Failed(timeout_error(Dependency::Generation, generation)),
            }
        };
        drop(upstream);

        match outcome {
            StreamOutcome::Completed => {
                let history_saved = match self.persist(&request, &text, &retrieval, false).await {
                    Ok(()) => true,
                    Err(err) => {
                        tracing::warn!("Stream delivered but history was not saved: {}", err);
                        degraded.push(err.to_body());
                        false
                    }
                };
                enter(RequestPhase::Done);
                tracing::info!(chars = text.len(), history_saved, "Stream completed");
                let _ = tx
                    .send(StreamEvent::Done {
                        history_saved,
                        citations: prompt.citations(&text),
                        degraded,
                    })
                    .await;
            }
            StreamOutcome::Failed(err) => {
                let err = fail(err);
                if !text.is_empty() {
                    self.persist_partial(&request, &text, &retrieval).await;
                }
                let _ = tx.send(StreamEvent::error(&err)).await;
            }
            StreamOutcome::Cancelled => {
                tracing::info!(chars = text.len(), "Caller disconnected mid-stream");
                if self.settings.persist_partial_on_cancel && !text.is_empty() {
                    self.persist_partial(&request, &text, &retrieval).await;
                }
            }
        }
    }

    /// Runs history fetch and similarity search concurrently and assembles
    /// the prompt. Failures of either branch degrade to an empty input.
    async fn gather(&self, request: &AnswerRequest) -> Gathered {
        let history_turns = if request.include_history {
            self.settings.history_turns
        } else {
            0
        };
        let k = request.max_results.unwrap_or(self.settings.max_results).max(1);

        let history_branch = async {
            if history_turns == 0 {
                return Ok(Vec::new());
            }
            let result = self
                .guarded(Dependency::HistoryFetch, self.settings.history_timeout_ms, move || {
                    self.history.get_recent(&request.user_id, history_turns)
                })
                .await;
            enter(RequestPhase::HistoryFetched);
            result
        };
        let search_branch = async {
            let result = self
                .guarded(Dependency::SimilaritySearch, self.settings.search_timeout_ms, move || {
                    self.index.search(&request.question, k)
                })
                .await;
            enter(RequestPhase::ContextRetrieved);
            result
        };
        let (history, retrieval) = tokio::join!(history_branch, search_branch);

        let mut degraded = Vec::new();
        let history: Vec<Turn> = history.unwrap_or_else(|err| {
            tracing::warn!("Continuing without history: {}", err);
            degraded.push(err.to_body());
            Vec::new()
        });
        let retrieval: Retrieval = retrieval.unwrap_or_else(|err| {
            tracing::warn!("Continuing without retrieved context: {}", err);
            degraded.push(err.to_body());
            Vec::new()
        });

        let prompt = self.assembler.assemble(&request.question, &retrieval, &history);
        enter(RequestPhase::PromptAssembled);
        Gathered {
            retrieval,
            prompt,
            degraded,
        }
    }

    /// Applies the dependency's deadline to each attempt and, when enabled,
    /// retries once after a short backoff.
    async fn guarded<T, F, Fut>(&self, dependency: Dependency, timeout_ms: u64, mut op: F) -> Result<T, RagError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RagError>>,
    {
        let deadline = Duration::from_millis(timeout_ms);
        let attempts = if self.settings.retry_dependencies { 2 } else { 1 };

        let mut last_error = None;
        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(Duration::from_millis(self.settings.retry_backoff_ms)).await;
            }
            let err = match tokio::time::timeout(deadline, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => err,
                Err(_) => timeout_error(dependency, deadline),
            };
            tracing::debug!(%dependency, attempt, "Dependency call failed: {}", err);
            last_error = Some(err);
        }
        Err(last_error.unwrap_or_else(|| timeout_error(dependency, deadline)))
    }

    fn generation_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.generation_timeout_ms)
    }

    /// Stores the question and answer as one unit so concurrent requests
    /// from the same user never interleave their turns.
    async fn persist(
        &self,
        request: &AnswerRequest,
        answer: &str,
        retrieval: &[ScoredDocument],
        incomplete: bool,
    ) -> Result<(), RagError> {
        let sources = retrieval
            .iter()
            .map(|s| SourceRef {
                id: s.document.id.clone(),
                score: s.score,
            })
            .collect();
        let mut assistant = NewTurn::assistant(answer, sources);
        assistant.incomplete = incomplete;

        self.history
            .append_all(
                &request.user_id,
                vec![NewTurn::user(request.question.clone()), assistant],
            )
            .await?;
        enter(RequestPhase::Persisted);
        Ok(())
    }

    async fn persist_partial(&self, request: &AnswerRequest, text: &str, retrieval: &[ScoredDocument]) {
        match self.persist(request, text, retrieval, true).await {
            Ok(()) => tracing::info!(chars = text.len(), "Partial answer saved as incomplete"),
            Err(err) => tracing::warn!("Partial answer was not saved: {}", err),
        }
    }
}

fn timeout_error(dependency: Dependency, after: Duration) -> RagError {
    RagError::DependencyTimeout {
        dependency,
        after_ms: after.as_millis() as u64,
    }
}

fn fail(err: RagError) -> RagError {
    enter(RequestPhase::Failed);
    tracing::warn!(tag = err.tag(), "Request failed: {}", err);
    err
}
