pub mod chat;
pub mod config;
pub mod health;
pub mod history;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod sources;
