pub mod core;
pub mod embedding;
pub mod history;
pub mod ingest;
pub mod llm;
pub mod prompt;
pub mod rag;
pub mod server;
pub mod sources;
pub mod state;
