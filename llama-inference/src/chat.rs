#[cfg(test)]
#[path = "../tests/unit/chat_test.rs"]
mod chat_test;

use crate::tokenizer::Tokenizer;
use anyhow::{Context, Result};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }
}

/// Llama 3 instruct prompt format:
///
/// ```text
/// <|begin_of_text|><|start_header_id|>role<|end_header_id|>\ncontent<|eot_id|>...
/// ```
pub struct ChatFormat<'t> {
    tokenizer: &'t dyn Tokenizer,
    pub begin_of_text: usize,
    pub start_header: usize,
    pub end_header: usize,
    pub end_of_turn: usize,
    pub end_of_text: usize,
}

impl<'t> ChatFormat<'t> {
    pub fn new(tokenizer: &'t dyn Tokenizer) -> Result<Self> {
        let special_tokens = tokenizer.special_tokens();
        let special = |name: &str| {
            special_tokens.get(name).copied().with_context(|| format!("Tokenizer has no special token {name}"))
        };

        Ok(Self {
            tokenizer,
            begin_of_text: special("<|begin_of_text|>")?,
            start_header: special("<|start_header_id|>")?,
            end_header: special("<|end_header_id|>")?,
            end_of_turn: special("<|eot_id|>")?,
            end_of_text: special("<|end_of_text|>")?,
        })
    }

    pub fn tokenizer(&self) -> &'t dyn Tokenizer {
        self.tokenizer
    }

    pub fn stop_tokens(&self) -> HashSet<usize> {
        HashSet::from([self.end_of_text, self.end_of_turn])
    }

    pub fn encode_header(&self, role: Role) -> Vec<usize> {
        let mut tokens = vec![self.start_header];
        tokens.extend(self.tokenizer.encode(role.as_str()));
        tokens.push(self.end_header);
        tokens.extend(self.tokenizer.encode("\n"));
        tokens
    }

    pub fn encode_message(&self, message: &Message) -> Vec<usize> {
        let mut tokens = self.encode_header(message.role);
        tokens.extend(self.tokenizer.encode(message.content.trim()));
        tokens.push(self.end_of_turn);
        tokens
    }

    /// Encodes a whole dialog, optionally opening an assistant turn for the model to complete.
    pub fn encode_dialog_prompt(&self, append_assistant_turn: bool, dialog: &[Message]) -> Vec<usize> {
        let mut tokens = vec![self.begin_of_text];
        for message in dialog {
            tokens.extend(self.encode_message(message));
        }
        if append_assistant_turn {
            tokens.extend(self.encode_header(Role::Assistant));
        }
        tokens
    }
}

impl std::fmt::Debug for ChatFormat<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatFormat")
            .field("begin_of_text", &self.begin_of_text)
            .field("end_of_turn", &self.end_of_turn)
            .field("end_of_text", &self.end_of_text)
            .finish_non_exhaustive()
    }
}
