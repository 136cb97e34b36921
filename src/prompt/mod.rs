//! Prompt assembly: system instructions, recent history, retrieved context
//! and the question, always in that order.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::embedding::ScoredDocument;
use crate::history::{Role, Turn};
use crate::llm::{ChatMessage, ChatRequest};

pub const SYSTEM_INSTRUCTIONS: &str = "\
You are an assistant that answers questions about the user's data using retrieved records.

Rules:
1. Answer only from the RELEVANT DATA and PREVIOUS CONVERSATION sections below.
2. Cite the documents that informed your answer with their reference number, e.g. [1] or [2].
3. If the answer is not in the provided data, say so explicitly. Never invent facts, figures or records.
4. Be concise and structured; summarise numerical data when it helps.";

const NO_DATA_NOTE: &str = "Note: No relevant documents were found for this question. \
Tell the user that the available data does not contain the answer.";

const CLOSING: &str = "Answer the question using only the information above.";

/// Ephemeral prompt for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system_instructions: String,
    /// Empty when there is no prior conversation.
    pub history_section: String,
    pub context_section: String,
    pub question: String,
    /// Document ids by reference number: `references[0]` is `[1]`.
    pub references: Vec<String>,
}

impl Prompt {
    fn user_content(&self) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(4);
        if !self.history_section.is_empty() {
            parts.push(&self.history_section);
        }
        parts.push(&self.context_section);
        let question = format!("=== CURRENT QUESTION ===\n{}", self.question);
        let mut content = parts.join("\n\n");
        content.push_str("\n\n");
        content.push_str(&question);
        content.push_str("\n\n");
        content.push_str(CLOSING);
        content
    }

    /// `[system, user]` messages for chat-style backends.
    pub fn to_messages(&self) -> Vec<ChatMessage> {
        vec![
            ChatMessage::system(self.system_instructions.clone()),
            ChatMessage::user(self.user_content()),
        ]
    }

    pub fn to_request(&self) -> ChatRequest {
        ChatRequest::new(self.to_messages())
    }

    /// Document ids cited in `answer`; see [`extract_citations`].
    pub fn citations(&self, answer: &str) -> Vec<String> {
        extract_citations(answer, &self.references)
    }
}

#[derive(Debug, Clone)]
pub struct PromptAssembler {
    history_turns: usize,
    max_context_chars: usize,
}

impl Default for PromptAssembler {
    fn default() -> Self {
        Self::new(10, 8_000)
    }
}

impl PromptAssembler {
    pub fn new(history_turns: usize, max_context_chars: usize) -> Self {
        Self {
            history_turns,
            max_context_chars,
        }
    }

    /// Pure: same inputs, same prompt.
    pub fn assemble(&self, question: &str, retrieval: &[ScoredDocument], history: &[Turn]) -> Prompt {
        let (context_section, references) = self.context_section(retrieval);
        Prompt {
            system_instructions: SYSTEM_INSTRUCTIONS.to_string(),
            history_section: self.history_section(history),
            context_section,
            question: question.to_string(),
            references,
        }
    }

    fn history_section(&self, history: &[Turn]) -> String {
        if history.is_empty() || self.history_turns == 0 {
            return String::new();
        }
        let skip = history.len().saturating_sub(self.history_turns);

        let mut section = String::from("=== PREVIOUS CONVERSATION ===");
        for turn in &history[skip..] {
            let role = match turn.role {
                Role::User => "USER",
                Role::Assistant => "ASSISTANT",
            };
            let marker = if turn.incomplete { " (incomplete)" } else { "" };
            let _ = write!(section, "\n{}{}: {}", role, marker, turn.content);
        }
        section
    }

    /// Blocks are added in retrieval order until the character budget is
    /// spent; later documents are dropped, never reordered. The first
    /// document is always kept, clipped if it alone exceeds the budget.
    fn context_section(&self, retrieval: &[ScoredDocument]) -> (String, Vec<String>) {
        if retrieval.is_empty() {
            return (format!("=== NO RELEVANT DATA FOUND ===\n{}", NO_DATA_NOTE), Vec::new());
        }

        let mut section = String::from("=== RELEVANT DATA ===");
        let mut references = Vec::new();
        let mut used = 0usize;

        for (index, scored) in retrieval.iter().enumerate() {
            let block = document_block(index + 1, scored);
            let size = block.chars().count();
            if used + size > self.max_context_chars {
                if references.is_empty() {
                    let clipped: String = block.chars().take(self.max_context_chars).collect();
                    section.push_str(&clipped);
                    references.push(scored.document.id.clone());
                }
                break;
            }
            used += size;
            section.push_str(&block);
            references.push(scored.document.id.clone());
        }

        if references.len() < retrieval.len() {
            tracing::debug!(
                included = references.len(),
                retrieved = retrieval.len(),
                "Context budget reached"
            );
        }
        (section, references)
    }
}

fn document_block(reference: usize, scored: &ScoredDocument) -> String {
    let document = &scored.document;
    let mut block = format!(
        "\n\n[{}] Document {} (relevance {:.3})\nContent: {}",
        reference, document.id, scored.score, document.text
    );
    let fields: Vec<(&String, &Value)> = document
        .metadata
        .iter()
        .filter(|(_, value)| !value.is_null())
        .collect();
    if !fields.is_empty() {
        block.push_str("\nRaw data:");
        for (key, value) in fields {
            let value = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            let _ = write!(block, "\n  - {}: {}", key, value);
        }
    }
    block
}

fn citation_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\[(\d+(?:\s*,\s*\d+)*)\]").expect("citation pattern is valid")
    })
}

/// Maps `[n]` (or `[n, m]`) markers in `answer` to document ids.
/// Unknown references are ignored; ids are deduplicated in first-mention
/// order.
pub fn extract_citations(answer: &str, references: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut cited = Vec::new();

    for capture in citation_pattern().captures_iter(answer) {
        for number in capture[1].split(',') {
            let Ok(n) = number.trim().parse::<usize>() else {
                continue;
            };
            let Some(id) = n.checked_sub(1).and_then(|i| references.get(i)) else {
                continue;
            };
            if seen.insert(id.clone()) {
                cited.push(id.clone());
            }
        }
    }
    cited
}
