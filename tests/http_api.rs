//! HTTP surface served on an ephemeral port.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use plugrag_backend::core::config::{AppConfig, AppPaths, ConfigService};
use plugrag_backend::core::errors::RagError;
use plugrag_backend::embedding::EmbeddingIndex;
use plugrag_backend::history::{ConversationStore, MemoryConversationStore};
use plugrag_backend::llm::{
    ChatRequest, LlmGateway, LlmProvider, ProviderInfo, ProviderRegistry, TextStream,
};
use plugrag_backend::server::router::router;
use plugrag_backend::state::AppState;

struct Canned;

#[async_trait]
impl LlmProvider for Canned {
    fn name(&self) -> &str {
        "canned"
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            provider: "canned".to_string(),
            model: "canned".to_string(),
            endpoint: None,
            has_api_key: false,
            supports_streaming: true,
        }
    }

    async fn generate(&self, _request: ChatRequest) -> Result<String, RagError> {
        Ok("Widgets ship in 3 days [1].".to_string())
    }

    async fn generate_stream(&self, _request: ChatRequest) -> Result<TextStream, RagError> {
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            for chunk in ["Widgets ship ", "in 3 days [1]."] {
                if tx.send(Ok(chunk.to_string())).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

struct Server {
    base: String,
    client: reqwest::Client,
    _dir: tempfile::TempDir,
}

async fn spawn_server() -> Server {
    let dir = tempfile::tempdir().unwrap();
    let paths = Arc::new(AppPaths::with_data_dir(
        dir.path().to_path_buf(),
        dir.path().to_path_buf(),
    ));
    std::fs::write(dir.path().join("secrets.yaml"), "llm:\n  api_key: sk-very-secret\n").unwrap();
    let config = ConfigService::new(paths.clone());

    let history: Arc<dyn ConversationStore> = Arc::new(MemoryConversationStore::new(100));
    let gateway = Arc::new(LlmGateway::with_provider(
        ProviderRegistry::with_builtin(),
        Arc::new(Canned),
    ));
    let state = AppState::from_parts(
        paths,
        config,
        AppConfig::default(),
        Arc::new(EmbeddingIndex::in_memory(256)),
        history,
        gateway,
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(Arc::new(state))).await.unwrap();
    });

    Server {
        base: format!("http://{}", addr),
        client: reqwest::Client::new(),
        _dir: dir,
    }
}

impl Server {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let res = self.client.get(self.url(path)).send().await.unwrap();
        (res.status().as_u16(), res.json().await.unwrap())
    }

    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let res = self.client.post(self.url(path)).json(&body).send().await.unwrap();
        (res.status().as_u16(), res.json().await.unwrap())
    }
}

async fn ingest_catalog(server: &Server, dir: &std::path::Path) {
    let path = dir.join("catalog.jsonl");
    std::fs::write(
        &path,
        "{\"id\":\"w1\",\"name\":\"widget\",\"shipping\":\"ships in 3 days\"}\n{\"id\":\"g1\",\"name\":\"gadget\",\"shipping\":\"ships in 2 weeks\"}\n",
    )
    .unwrap();

    let (status, body) = server
        .post(
            "/ingest",
            json!({
                "source": { "type": "jsonl", "path": path },
                "mapping": { "text_fields": ["name", "shipping"] }
            }),
        )
        .await;
    assert_eq!(status, 202);
    let job_id = body["job_id"].as_str().unwrap().to_string();

    for _ in 0..100 {
        let (_, job) = server.get(&format!("/ingest/{}", job_id)).await;
        if job["status"] == "completed" {
            assert_eq!(job["documents_embedded"], 2);
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("ingestion job did not complete");
}

#[tokio::test]
async fn chat_round_trip_over_http() {
    let server = spawn_server().await;
    let data = tempfile::tempdir().unwrap();
    ingest_catalog(&server, data.path()).await;

    let (status, body) = server
        .post("/chat", json!({ "question": "How fast does the widget ship?", "user_id": "u1" }))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["user_id"], "u1");
    assert_eq!(body["sources"][0]["id"], "w1");
    assert_eq!(body["citations"], json!(["w1"]));

    let (status, body) = server.get("/history/u1?limit=10").await;
    assert_eq!(status, 200);
    assert_eq!(body["count"], 2);
    assert_eq!(body["turns"][0]["role"], "user");

    let res = server.client.delete(server.url("/history/u1")).send().await.unwrap();
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["deleted"], 2);

    let (_, stats) = server.get("/api/index/stats").await;
    assert_eq!(stats["document_count"], 2);
}

#[tokio::test]
async fn stream_endpoint_emits_named_events_in_order() {
    let server = spawn_server().await;

    let res = server
        .client
        .post(server.url("/chat/stream"))
        .json(&json!({ "question": "How fast does the widget ship?", "user_id": "u2" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 200);
    let text = res.text().await.unwrap();

    let names: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("event: "))
        .collect();
    assert_eq!(names, vec!["sources", "chunk", "chunk", "done"]);
}

#[tokio::test]
async fn invalid_requests_map_to_error_bodies() {
    let server = spawn_server().await;

    let (status, body) = server
        .post("/chat", json!({ "question": "", "user_id": "u3" }))
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["tag"], "InvalidRequest");

    let (status, body) = server
        .post("/api/llm/switch", json!({ "provider": "nonexistent" }))
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["tag"], "InvalidRequest");
    let (_, current) = server.get("/api/llm/current").await;
    assert_eq!(current["provider"], "canned");

    let (status, body) = server.get("/ingest/missing-job").await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["tag"], "NotFound");
}

#[tokio::test]
async fn source_preview_reports_fields_and_sample() {
    let server = spawn_server().await;
    let data = tempfile::tempdir().unwrap();
    let path = data.path().join("catalog.jsonl");
    std::fs::write(
        &path,
        "{\"id\":\"w1\",\"price\":12.5}\nnot json\n{\"id\":\"g1\",\"price\":30}\n{\"id\":\"x1\"}\n",
    )
    .unwrap();

    let (status, body) = server
        .post(
            "/sources/preview",
            json!({ "source": { "type": "jsonl", "path": path }, "rows": 2 }),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["rows"].as_array().unwrap().len(), 2);
    assert_eq!(body["decode_errors"], 1);
    assert_eq!(body["fields"][0]["name"], "id");
    assert_eq!(body["fields"][1]["kind"], "number");

    let (status, body) = server
        .post(
            "/sources/preview",
            json!({ "source": { "type": "csv", "path": data.path().join("absent.csv") } }),
        )
        .await;
    assert_eq!(status, 503);
    assert_eq!(body["error"]["tag"], "SourceUnavailable");
}

#[tokio::test]
async fn status_and_config_endpoints() {
    let server = spawn_server().await;

    let (status, health) = server.get("/health").await;
    assert_eq!(status, 200);
    assert_eq!(health["status"], "ok");

    let (_, status_body) = server.get("/api/status").await;
    assert_eq!(status_body["history_store"], "memory");
    assert_eq!(status_body["llm"]["provider"], "canned");

    let (_, providers) = server.get("/api/llm/providers").await;
    let names: Vec<&str> = providers["providers"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|p| p["name"].as_str())
        .collect();
    assert!(names.contains(&"ollama"));
    assert!(names.contains(&"gemini"));

    let (_, config) = server.get("/api/config").await;
    assert_eq!(config["llm"]["api_key"], "****");
    assert_eq!(config["orchestrator"]["max_results"], 5);
}
