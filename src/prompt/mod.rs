//! Prompt assembly
//!
//! The model input is, in order: the rendered system prompt with the output
//! format, the retrieved knowledge as a second system message, a window of
//! recent conversation, and the new inbound message. When the whole exceeds
//! the character budget, knowledge goes first (lowest similarity first),
//! then the oldest history. The new message is never dropped.

mod template;

pub use template::*;

use tracing::{debug, warn};

use crate::complete::{PromptMessage, ResponseSchema};
use crate::config::PromptConfig;
use crate::fields::FieldSchema;
use crate::models::{ChatMessage, Direction, LeadStatus, ScoredChunk};

/// Inputs of one assembly
#[derive(Debug, Clone, Copy)]
pub struct PromptInput<'a> {
    /// Org template; the built-in prompt when `None`
    pub template: Option<&'a str>,
    pub schema: &'a FieldSchema,
    /// Retrieved chunks, best first
    pub context: &'a [ScoredChunk],
    /// Earlier messages, oldest first
    pub history: &'a [ChatMessage],
    pub inbound: &'a str,
}

#[derive(Debug, Clone)]
pub struct AssembledPrompt {
    pub messages: Vec<PromptMessage>,
    pub response_schema: ResponseSchema,
    /// Chunks that survived budgeting; only these belong in the trace
    pub included_context: Vec<ScoredChunk>,
    pub dropped_context: usize,
    pub dropped_history: usize,
}

impl AssembledPrompt {
    pub fn total_chars(&self) -> usize {
        self.messages.iter().map(PromptMessage::len).sum()
    }
}

#[derive(Debug, Clone)]
pub struct PromptAssembler {
    history_window: usize,
    max_input_chars: usize,
}

impl PromptAssembler {
    pub fn new(config: &PromptConfig) -> Self {
        Self {
            history_window: config.history_window,
            max_input_chars: config.max_input_chars,
        }
    }

    /// Keys and statuses the model may emit
    pub fn response_schema(schema: &FieldSchema) -> ResponseSchema {
        ResponseSchema::new(
            schema.keys().map(String::from).collect(),
            LeadStatus::ALL
                .iter()
                .filter(|s| s.is_ai_target())
                .map(|s| s.to_string())
                .collect(),
        )
    }

    pub fn assemble(&self, input: PromptInput<'_>) -> AssembledPrompt {
        let response_schema = Self::response_schema(input.schema);
        let system = format!(
            "{}\n\n{}",
            render_template(input.template.unwrap_or(DEFAULT_SYSTEM_PROMPT), input.schema),
            response_schema.instructions()
        );
        let system = PromptMessage::system(system);
        let inbound = PromptMessage::user(input.inbound.trim());

        let skip = input.history.len().saturating_sub(self.history_window);
        let mut history: Vec<PromptMessage> = input.history[skip..]
            .iter()
            .filter(|m| !m.content.trim().is_empty())
            .map(|m| match m.direction {
                Direction::Inbound => PromptMessage::user(&m.content),
                Direction::Outbound => PromptMessage::assistant(&m.content),
            })
            .collect();
        let mut context: Vec<ScoredChunk> = input.context.to_vec();

        let fixed = system.len() + inbound.len();
        let mut dropped_context = 0;
        let mut dropped_history = 0;

        let size = |context: &[ScoredChunk], history: &[PromptMessage]| {
            fixed
                + render_context(context).map_or(0, |m| m.len())
                + history.iter().map(PromptMessage::len).sum::<usize>()
        };

        while size(&context, &history) > self.max_input_chars && !context.is_empty() {
            context.pop();
            dropped_context += 1;
        }
        while size(&context, &history) > self.max_input_chars && !history.is_empty() {
            history.remove(0);
            dropped_history += 1;
        }
        if dropped_context + dropped_history > 0 {
            debug!(
                "Prompt over budget: dropped {} context chunks and {} history messages",
                dropped_context, dropped_history
            );
        }
        if size(&context, &history) > self.max_input_chars {
            warn!(
                "Prompt still exceeds {} chars with only the system prompt and the new message",
                self.max_input_chars
            );
        }

        let mut messages = Vec::with_capacity(history.len() + 3);
        messages.push(system);
        if let Some(block) = render_context(&context) {
            messages.push(block);
        }
        messages.extend(history);
        messages.push(inbound);

        AssembledPrompt {
            messages,
            response_schema,
            included_context: context,
            dropped_context,
            dropped_history,
        }
    }
}

/// Knowledge block as a system message, `None` without chunks
fn render_context(chunks: &[ScoredChunk]) -> Option<PromptMessage> {
    if chunks.is_empty() {
        return None;
    }
    let blocks = chunks
        .iter()
        .enumerate()
        .map(|(i, c)| {
            format!(
                "[{}] {} ({}, similarity {:.2})\n{}",
                i + 1,
                c.chunk.title,
                c.chunk.category,
                c.score,
                c.chunk.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    Some(PromptMessage::system(format!(
        "RELEVANT KNOWLEDGE:\n\n{}\n\nUse this context to answer accurately.",
        blocks
    )))
}
