//! End-to-end behaviour of the query pipeline against in-process backends.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::json;
use tokio::sync::mpsc;

use plugrag_backend::core::config::OrchestratorSettings;
use plugrag_backend::core::errors::RagError;
use plugrag_backend::embedding::{Document, Embedder, EmbeddingIndex, MemoryVectorStore};
use plugrag_backend::history::{
    ConversationStore, MemoryConversationStore, NewTurn, Role, Turn,
};
use plugrag_backend::llm::{
    ChatRequest, LlmGateway, LlmProvider, ProviderInfo, ProviderRegistry, TextStream,
};
use plugrag_backend::rag::{AnswerRequest, RagOrchestrator, StreamEvent};

/// What the scripted provider does for each call.
#[derive(Clone)]
enum Script {
    Reply(Vec<&'static str>),
    /// Emits the chunks, then fails.
    FailAfter(Vec<&'static str>, &'static str),
    /// Emits a chunk every `delay` forever.
    Endless(Duration),
    Stall(Duration),
    Echo,
}

struct Scripted {
    script: Script,
    prompts: Mutex<Vec<String>>,
}

impl Scripted {
    fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn last_prompt(&self) -> String {
        self.prompts.lock().unwrap().last().cloned().unwrap_or_default()
    }

    fn record(&self, request: &ChatRequest) -> String {
        let prompt = request
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        self.prompts.lock().unwrap().push(prompt.clone());
        prompt
    }
}

#[async_trait]
impl LlmProvider for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            provider: "scripted".to_string(),
            model: "script".to_string(),
            endpoint: None,
            has_api_key: false,
            supports_streaming: true,
        }
    }

    async fn generate(&self, request: ChatRequest) -> Result<String, RagError> {
        let prompt = self.record(&request);
        match &self.script {
            Script::Reply(chunks) => Ok(chunks.concat()),
            Script::FailAfter(_, reason) => Err(RagError::generation(*reason)),
            Script::Endless(_) => Ok("endless".to_string()),
            Script::Stall(delay) => {
                tokio::time::sleep(*delay).await;
                Ok("too late".to_string())
            }
            Script::Echo => Ok(last_question(&prompt)),
        }
    }

    async fn generate_stream(&self, request: ChatRequest) -> Result<TextStream, RagError> {
        let prompt = self.record(&request);
        let script = self.script.clone();
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            match script {
                Script::Reply(chunks) => {
                    for chunk in chunks {
                        if tx.send(Ok(chunk.to_string())).await.is_err() {
                            return;
                        }
                    }
                }
                Script::FailAfter(chunks, reason) => {
                    for chunk in chunks {
                        if tx.send(Ok(chunk.to_string())).await.is_err() {
                            return;
                        }
                    }
                    let _ = tx.send(Err(RagError::generation(reason))).await;
                }
                Script::Endless(delay) => loop {
                    if tx.send(Ok("tick ".to_string())).await.is_err() {
                        return;
                    }
                    tokio::time::sleep(delay).await;
                },
                Script::Stall(delay) => {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Ok("too late".to_string())).await;
                }
                Script::Echo => {
                    let _ = tx.send(Ok(last_question(&prompt))).await;
                }
            }
        });
        Ok(rx)
    }
}

fn last_question(prompt: &str) -> String {
    prompt
        .split("=== CURRENT QUESTION ===")
        .nth(1)
        .and_then(|rest| rest.trim().lines().next())
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// History backend that is down, or slow to answer reads.
enum Broken {
    Down,
    SlowReads(Duration, MemoryConversationStore),
}

#[async_trait]
impl ConversationStore for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    async fn append_all(&self, user_id: &str, turns: Vec<NewTurn>) -> Result<Vec<Turn>, RagError> {
        match self {
            Broken::Down => Err(RagError::history("connection refused")),
            Broken::SlowReads(_, inner) => inner.append_all(user_id, turns).await,
        }
    }

    async fn get_recent(&self, user_id: &str, limit: usize) -> Result<Vec<Turn>, RagError> {
        match self {
            Broken::Down => Err(RagError::history("connection refused")),
            Broken::SlowReads(delay, inner) => {
                tokio::time::sleep(*delay).await;
                inner.get_recent(user_id, limit).await
            }
        }
    }

    async fn clear(&self, _user_id: &str) -> Result<usize, RagError> {
        Err(RagError::history("connection refused"))
    }

    async fn count(&self, _user_id: &str) -> Result<usize, RagError> {
        Err(RagError::history("connection refused"))
    }
}

/// Embedding backend that refuses every call.
struct Unreachable;

#[async_trait]
impl Embedder for Unreachable {
    fn model(&self) -> &str {
        "unreachable"
    }

    fn dimensions(&self) -> usize {
        64
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        Err(RagError::retrieval("embedding service refused connection"))
    }
}

fn fast_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        history_timeout_ms: 200,
        search_timeout_ms: 1_000,
        generation_timeout_ms: 1_000,
        retry_backoff_ms: 10,
        ..OrchestratorSettings::default()
    }
}

async fn sales_index() -> Arc<EmbeddingIndex> {
    let index = Arc::new(EmbeddingIndex::in_memory(1024));
    let rows = [
        ("a1-q3", "a1", "Q3", 1_200_000),
        ("a1-q1", "a1", "Q1", 900_000),
        ("b2-q1", "b2", "Q1", 50_000),
        ("c7-q4", "c7", "Q4", 310_000),
    ];
    let documents = rows
        .iter()
        .map(|(id, account, quarter, revenue)| {
            let mut doc = Document::new(
                *id,
                format!("account: {} | quarter: {} | revenue: {}", account, quarter, revenue),
            );
            doc.metadata = json!({ "account": account, "quarter": quarter, "revenue": revenue })
                .as_object()
                .cloned()
                .unwrap();
            doc
        })
        .collect();
    index.embed_and_store(documents).await.unwrap();
    index
}

fn orchestrator(
    index: Arc<EmbeddingIndex>,
    history: Arc<dyn ConversationStore>,
    provider: Arc<Scripted>,
    settings: OrchestratorSettings,
) -> RagOrchestrator {
    let gateway = Arc::new(LlmGateway::with_provider(
        ProviderRegistry::with_builtin(),
        provider,
    ));
    RagOrchestrator::new(index, history, gateway, settings)
}

async fn collect(mut events: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut collected = Vec::new();
    while let Some(event) = events.recv().await {
        collected.push(event);
    }
    collected
}

#[tokio::test]
async fn answers_q3_revenue_from_retrieved_record() {
    let history: Arc<dyn ConversationStore> = Arc::new(MemoryConversationStore::new(100));
    let provider = Scripted::new(Script::Reply(vec![
        "Account a1 had Q3 revenue of 1,200,000 ",
        "[1].",
    ]));
    let rag = orchestrator(sales_index().await, history.clone(), provider.clone(), fast_settings());

    let response = rag
        .answer(AnswerRequest::new("What was the Q3 revenue for account a1?", "alice"))
        .await
        .unwrap();

    assert_eq!(response.user_id, "alice");
    assert_eq!(response.sources[0].document.id, "a1-q3");
    assert!(response.sources.len() <= 5);
    assert_eq!(response.response, "Account a1 had Q3 revenue of 1,200,000 [1].");
    assert_eq!(response.citations, vec!["a1-q3".to_string()]);
    assert!(response.history_saved);
    assert!(response.degraded.is_empty());

    let prompt = provider.last_prompt();
    assert!(prompt.contains("=== RELEVANT DATA ==="));
    assert!(prompt.contains("1200000"));

    let turns = history.get_recent("alice", 10).await.unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].role, Role::User);
    assert_eq!(turns[0].content, "What was the Q3 revenue for account a1?");
    assert_eq!(turns[1].role, Role::Assistant);
    assert_eq!(turns[1].sources[0].id, "a1-q3");
}

#[tokio::test]
async fn follow_up_sees_previous_exchange() {
    let history: Arc<dyn ConversationStore> = Arc::new(MemoryConversationStore::new(100));
    let provider = Scripted::new(Script::Reply(vec!["1,200,000."]));
    let rag = orchestrator(sales_index().await, history, provider.clone(), fast_settings());

    rag.answer(AnswerRequest::new("What was the Q3 revenue for account a1?", "alice"))
        .await
        .unwrap();
    rag.answer(AnswerRequest::new("And in Q1?", "alice")).await.unwrap();

    let prompt = provider.last_prompt();
    assert!(prompt.contains("=== PREVIOUS CONVERSATION ==="));
    assert!(prompt.contains("What was the Q3 revenue for account a1?"));

    let mut without_history = AnswerRequest::new("And in Q1?", "alice");
    without_history.include_history = false;
    rag.answer(without_history).await.unwrap();
    assert!(!provider.last_prompt().contains("=== PREVIOUS CONVERSATION ==="));
}

#[tokio::test]
async fn empty_index_still_answers() {
    let history: Arc<dyn ConversationStore> = Arc::new(MemoryConversationStore::new(100));
    let provider = Scripted::new(Script::Reply(vec!["I could not find that in the data."]));
    let rag = orchestrator(
        Arc::new(EmbeddingIndex::in_memory(64)),
        history.clone(),
        provider.clone(),
        fast_settings(),
    );

    let response = rag
        .answer(AnswerRequest::new("What was the Q3 revenue for account a1?", "bob"))
        .await
        .unwrap();

    assert!(response.sources.is_empty());
    assert!(response.citations.is_empty());
    assert!(provider.last_prompt().contains("=== NO RELEVANT DATA FOUND ==="));
    assert_eq!(history.count("bob").await.unwrap(), 2);
}

#[tokio::test]
async fn history_store_down_degrades_without_failing() {
    let provider = Scripted::new(Script::Reply(vec!["Q3 revenue was 1,200,000 [1]."]));
    let rag = orchestrator(
        sales_index().await,
        Arc::new(Broken::Down),
        provider.clone(),
        fast_settings(),
    );

    let response = rag
        .answer(AnswerRequest::new("What was the Q3 revenue for account a1?", "carol"))
        .await
        .unwrap();

    assert_eq!(response.sources[0].document.id, "a1-q3");
    assert!(!response.history_saved);
    let tags: Vec<&str> = response.degraded.iter().map(|e| e.tag.as_str()).collect();
    assert_eq!(tags, vec!["HistoryUnavailable", "HistoryUnavailable"]);
    assert!(!provider.last_prompt().contains("=== PREVIOUS CONVERSATION ==="));
}

#[tokio::test]
async fn retrieval_down_degrades_to_no_context() {
    let history: Arc<dyn ConversationStore> = Arc::new(MemoryConversationStore::new(100));
    let provider = Scripted::new(Script::Reply(vec!["I could not check the data."]));
    let index = Arc::new(EmbeddingIndex::new(
        Arc::new(Unreachable),
        Arc::new(MemoryVectorStore::new()),
        10,
    ));
    let rag = orchestrator(index, history.clone(), provider.clone(), fast_settings());

    let response = rag
        .answer(AnswerRequest::new("What was the Q3 revenue for account a1?", "erin"))
        .await
        .unwrap();

    assert_eq!(response.response, "I could not check the data.");
    assert!(response.sources.is_empty());
    assert!(response.citations.is_empty());
    let tags: Vec<&str> = response.degraded.iter().map(|e| e.tag.as_str()).collect();
    assert_eq!(tags, vec!["RetrievalUnavailable"]);
    assert!(provider.last_prompt().contains("=== NO RELEVANT DATA FOUND ==="));
    assert!(response.history_saved);
    assert_eq!(history.count("erin").await.unwrap(), 2);
}

#[tokio::test]
async fn searches_run_while_ingestion_writes() {
    let index = Arc::new(EmbeddingIndex::in_memory(256));

    let writers = (0..4).map(|writer| {
        let index = index.clone();
        tokio::spawn(async move {
            for batch in 0..5 {
                let documents = (0..5)
                    .map(|n| {
                        let id = format!("w{}-b{}-d{}", writer, batch, n);
                        let text = format!("account {} batch {} row {}", writer, batch, n);
                        Document::new(id, text)
                    })
                    .collect();
                let report = index.embed_and_store(documents).await?;
                assert_eq!(report.stored, 5);
                tokio::task::yield_now().await;
            }
            Ok::<_, RagError>(())
        })
    });
    let readers = (0..4).map(|reader| {
        let index = index.clone();
        tokio::spawn(async move {
            for _ in 0..20 {
                let hits = index.search(&format!("account {}", reader), 3).await?;
                assert!(hits.len() <= 3);
                tokio::task::yield_now().await;
            }
            Ok::<_, RagError>(())
        })
    });

    let (written, read) = tokio::join!(join_all(writers), join_all(readers));
    for outcome in written.into_iter().chain(read) {
        outcome.unwrap().unwrap();
    }

    assert_eq!(index.stats().await.unwrap().document_count, 100);
    let hits = index.search("account 2 batch 3 row 4", 1).await.unwrap();
    assert_eq!(hits[0].document.id, "w2-b3-d4");
}

#[tokio::test]
async fn slow_history_times_out_in_its_branch_only() {
    let history = Arc::new(Broken::SlowReads(
        Duration::from_millis(500),
        MemoryConversationStore::new(100),
    ));
    let settings = OrchestratorSettings {
        history_timeout_ms: 20,
        retry_dependencies: false,
        ..fast_settings()
    };
    let rag = orchestrator(
        sales_index().await,
        history,
        Scripted::new(Script::Reply(vec!["ok"])),
        settings,
    );

    let response = rag
        .answer(AnswerRequest::new("Q3 revenue for a1", "dave"))
        .await
        .unwrap();

    assert_eq!(response.degraded.len(), 1);
    assert_eq!(response.degraded[0].tag, "DependencyTimeout");
    assert!(response.degraded[0].message.contains("history fetch"));
    assert!(!response.sources.is_empty());
    assert!(response.history_saved);
}

#[tokio::test]
async fn generation_failure_persists_nothing() {
    let history: Arc<dyn ConversationStore> = Arc::new(MemoryConversationStore::new(100));
    let rag = orchestrator(
        sales_index().await,
        history.clone(),
        Scripted::new(Script::FailAfter(vec![], "rate limited")),
        fast_settings(),
    );

    let err = rag
        .answer(AnswerRequest::new("Q3 revenue for a1", "erin"))
        .await
        .unwrap_err();

    assert_eq!(err.tag(), "GenerationError");
    assert_eq!(history.count("erin").await.unwrap(), 0);
}

#[tokio::test]
async fn generation_timeout_is_reported() {
    let settings = OrchestratorSettings {
        generation_timeout_ms: 50,
        ..fast_settings()
    };
    let rag = orchestrator(
        sales_index().await,
        Arc::new(MemoryConversationStore::new(100)),
        Scripted::new(Script::Stall(Duration::from_millis(500))),
        settings,
    );

    let err = rag
        .answer(AnswerRequest::new("Q3 revenue for a1", "frank"))
        .await
        .unwrap_err();
    assert_eq!(err.tag(), "DependencyTimeout");

    let events = collect(
        rag.answer_stream(AnswerRequest::new("Q3 revenue for a1", "frank"))
            .await
            .unwrap(),
    )
    .await;
    assert!(matches!(events.last(), Some(StreamEvent::Error { tag, .. }) if tag == "DependencyTimeout"));
}

#[tokio::test]
async fn rejects_blank_question_and_user() {
    let rag = orchestrator(
        sales_index().await,
        Arc::new(MemoryConversationStore::new(100)),
        Scripted::new(Script::Reply(vec!["unused"])),
        fast_settings(),
    );

    let err = rag.answer(AnswerRequest::new("  ", "gina")).await.unwrap_err();
    assert_eq!(err.tag(), "InvalidRequest");
    let err = rag.answer_stream(AnswerRequest::new("hi", "")).await.unwrap_err();
    assert_eq!(err.tag(), "InvalidRequest");
}

#[tokio::test]
async fn concurrent_users_never_see_each_other() {
    let history: Arc<dyn ConversationStore> = Arc::new(MemoryConversationStore::new(100));
    let rag = Arc::new(orchestrator(
        sales_index().await,
        history.clone(),
        Scripted::new(Script::Echo),
        fast_settings(),
    ));

    let requests = (0..8).flat_map(|user| {
        (0..3).map(move |n| (format!("user-{}", user), format!("question {} from user-{}", n, user)))
    });
    let results = join_all(requests.map(|(user, question)| {
        let rag = rag.clone();
        async move { rag.answer(AnswerRequest::new(question, user)).await }
    }))
    .await;
    for result in &results {
        let response = result.as_ref().unwrap();
        assert!(response.response.ends_with(&response.user_id));
    }

    for user in 0..8 {
        let user_id = format!("user-{}", user);
        let turns = history.get_recent(&user_id, 100).await.unwrap();
        assert_eq!(turns.len(), 6);
        for pair in turns.chunks(2) {
            assert_eq!(pair[0].role, Role::User);
            assert_eq!(pair[1].role, Role::Assistant);
            assert_eq!(pair[0].content, pair[1].content);
        }
        assert!(turns.iter().all(|t| t.user_id == user_id && t.content.ends_with(&user_id)));
    }
}

#[tokio::test]
async fn stream_emits_sources_chunks_then_done() {
    let history: Arc<dyn ConversationStore> = Arc::new(MemoryConversationStore::new(100));
    let rag = orchestrator(
        sales_index().await,
        history.clone(),
        Scripted::new(Script::Reply(vec!["Q3 revenue ", "was 1,200,000 ", "[1]."])),
        fast_settings(),
    );

    let events = collect(
        rag.answer_stream(AnswerRequest::new("What was the Q3 revenue for account a1?", "hana"))
            .await
            .unwrap(),
    )
    .await;

    assert_eq!(events.len(), 5);
    match &events[0] {
        StreamEvent::Sources { sources, .. } => assert_eq!(sources[0].document.id, "a1-q3"),
        other => panic!("expected sources first, got {:?}", other),
    }
    let text: String = events[1..4]
        .iter()
        .map(|event| match event {
            StreamEvent::Chunk { content } => content.as_str(),
            other => panic!("expected chunk, got {:?}", other),
        })
        .collect();
    assert_eq!(text, "Q3 revenue was 1,200,000 [1].");
    match &events[4] {
        StreamEvent::Done {
            history_saved,
            citations,
            ..
        } => {
            assert!(history_saved);
            assert_eq!(citations, &vec!["a1-q3".to_string()]);
        }
        other => panic!("expected done, got {:?}", other),
    }

    let turns = history.get_recent("hana", 10).await.unwrap();
    assert_eq!(turns[1].content, text);
    assert!(!turns[1].incomplete);
}

#[tokio::test]
async fn stream_error_is_terminal_and_keeps_partial_text() {
    let history: Arc<dyn ConversationStore> = Arc::new(MemoryConversationStore::new(100));
    let rag = orchestrator(
        sales_index().await,
        history.clone(),
        Scripted::new(Script::FailAfter(vec!["Q3 revenue "], "connection reset")),
        fast_settings(),
    );

    let events = collect(
        rag.answer_stream(AnswerRequest::new("Q3 revenue for a1?", "ivan"))
            .await
            .unwrap(),
    )
    .await;

    assert!(matches!(events[0], StreamEvent::Sources { .. }));
    assert!(matches!(events[1], StreamEvent::Chunk { .. }));
    assert!(matches!(&events[2], StreamEvent::Error { tag, .. } if tag == "GenerationError"));
    assert_eq!(events.len(), 3);

    let turns = history.get_recent("ivan", 10).await.unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[1].content, "Q3 revenue ");
    assert!(turns[1].incomplete);
}

#[tokio::test]
async fn disconnect_cancels_and_persists_partial_answer() {
    let history: Arc<dyn ConversationStore> = Arc::new(MemoryConversationStore::new(100));
    let rag = orchestrator(
        sales_index().await,
        history.clone(),
        Scripted::new(Script::Endless(Duration::from_millis(5))),
        fast_settings(),
    );

    let mut events = rag
        .answer_stream(AnswerRequest::new("Q3 revenue for a1?", "judy"))
        .await
        .unwrap();
    assert!(matches!(events.recv().await, Some(StreamEvent::Sources { .. })));
    assert!(matches!(events.recv().await, Some(StreamEvent::Chunk { .. })));
    drop(events);

    let mut turns = Vec::new();
    for _ in 0..100 {
        turns = history.get_recent("judy", 10).await.unwrap();
        if !turns.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(turns.len(), 2);
    assert!(turns[1].incomplete);
    assert!(turns[1].content.starts_with("tick"));
}

#[tokio::test]
async fn disconnect_without_persist_policy_stores_nothing() {
    let history: Arc<dyn ConversationStore> = Arc::new(MemoryConversationStore::new(100));
    let settings = OrchestratorSettings {
        persist_partial_on_cancel: false,
        ..fast_settings()
    };
    let rag = orchestrator(
        sales_index().await,
        history.clone(),
        Scripted::new(Script::Endless(Duration::from_millis(5))),
        settings,
    );

    let mut events = rag
        .answer_stream(AnswerRequest::new("Q3 revenue for a1?", "kim"))
        .await
        .unwrap();
    events.recv().await;
    events.recv().await;
    drop(events);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(history.count("kim").await.unwrap(), 0);
}

#[tokio::test]
async fn single_document_scenario_cites_it() {
    let index = Arc::new(EmbeddingIndex::in_memory(1024));
    let mut a1 = Document::new("a1", "Our Q3 revenue grew 12%.");
    a1.metadata = json!({ "quarter": "Q3" }).as_object().cloned().unwrap();
    index
        .embed_and_store(vec![a1, Document::new("menu", "The cafeteria serves pasta on Fridays.")])
        .await
        .unwrap();

    let provider = Scripted::new(Script::Reply(vec!["Revenue grew 12% in Q3 [1]."]));
    let rag = orchestrator(
        index,
        Arc::new(MemoryConversationStore::new(100)),
        provider.clone(),
        fast_settings(),
    );

    let response = rag
        .answer(AnswerRequest::new("How did revenue perform?", "lee"))
        .await
        .unwrap();

    assert_eq!(response.sources[0].document.id, "a1");
    assert!(provider.last_prompt().contains("Our Q3 revenue grew 12%."));
    assert_eq!(response.citations, vec!["a1".to_string()]);
}
