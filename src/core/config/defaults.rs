use serde_json::{json, Value};

/// Baseline document that `config.yml` and `secrets.yaml` are merged onto.
pub fn default_config() -> Value {
    json!({
        "server": {
            "host": "127.0.0.1",
            "port": 8000,
            "cors_allowed_origins": []
        },
        "llm": {
            "provider": "ollama",
            "temperature": 0.7,
            "max_tokens": 2000,
            "timeout_secs": 60
        },
        "embedding": {
            "embedder": "hashing",
            "model": "all-MiniLM-L6-v2",
            "dimensions": 384,
            "batch_size": 100,
            "store": "sqlite"
        },
        "history": {
            "store": "sqlite",
            "retention_cap": 100
        },
        "orchestrator": {
            "max_results": 5,
            "history_turns": 10,
            "history_timeout_ms": 2000,
            "search_timeout_ms": 5000,
            "generation_timeout_ms": 60000,
            "retry_dependencies": true,
            "retry_backoff_ms": 100,
            "persist_partial_on_cancel": true,
            "max_context_chars": 8000
        },
        "ingest": {
            "page_size": 100,
            "job_history": 50
        }
    })
}

/// Environment variables layered over the file configuration.
pub const ENV_OVERRIDES: [(&str, &[&str]); 7] = [
    ("PLUGRAG_LLM_PROVIDER", &["llm", "provider"]),
    ("PLUGRAG_LLM_MODEL", &["llm", "model_name"]),
    ("PLUGRAG_LLM_ENDPOINT", &["llm", "endpoint_url"]),
    ("PLUGRAG_LLM_API_KEY", &["llm", "api_key"]),
    ("PLUGRAG_EMBEDDING_ENDPOINT", &["embedding", "endpoint"]),
    ("PLUGRAG_EMBEDDING_API_KEY", &["embedding", "api_key"]),
    ("PORT", &["server", "port"]),
];
