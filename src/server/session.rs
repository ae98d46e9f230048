//! Conversation history with automatic trimming.

use crate::config::ConversationConfig;
use crate::llm::ChatMessage;

/// Per-connection conversation session.
///
/// Trimming runs after every insert: the history is truncated to the last
/// `2 * max_turns` entries, then oldest pairs are dropped while the
/// estimated token count (`total_chars / 4`) exceeds the budget and more
/// than two turns remain.
pub struct Session {
    max_turns: usize,
    max_tokens_budget: usize,
    history: Vec<ChatMessage>,
}

impl Session {
    pub fn new(config: &ConversationConfig) -> Self {
        Self {
            max_turns: config.max_turns,
            max_tokens_budget: config.max_tokens_budget,
            history: Vec::new(),
        }
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.history.push(ChatMessage::user(text));
        self.trim();
    }

    pub fn push_assistant(&mut self, text: impl Into<String>) {
        self.history.push(ChatMessage::assistant(text));
        self.trim();
    }

    /// Conversation history in emission order (no system prompt).
    pub fn messages(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    fn estimated_tokens(&self) -> usize {
        let total_chars: usize = self.history.iter().map(|m| m.content.chars().count()).sum();
        total_chars / 4
    }

    fn trim(&mut self) {
        let max_messages = self.max_turns * 2;
        if self.history.len() > max_messages {
            let excess = self.history.len() - max_messages;
            self.history.drain(..excess);
        }

        while self.history.len() > 2 && self.estimated_tokens() > self.max_tokens_budget {
            self.history.drain(..2);
        }
    }
}
