//! Reading input and prompt assembly
//!
//! Card data and interpretation text live outside this crate. What arrives
//! here is the drawn spread as plain values; a [`PromptAssembler`] turns it
//! into the model-specific prompt string.

use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// One card as drawn, with the spread position it landed in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawnCard {
    pub name: String,
    /// Spread position, e.g. "past" or "obstacle"
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub reversed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadingInput {
    /// The querent's question; blank for a general reading
    #[serde(default)]
    pub question: String,
    pub cards: Vec<DrawnCard>,
    /// Free-form tone hint, e.g. "gentle" or "direct"
    #[serde(default)]
    pub style: Option<String>,
}

/// Turns a reading into a prompt string, chat delimiters included
pub trait PromptAssembler: Send + Sync {
    fn assemble(&self, input: &ReadingInput) -> String;
}

/// ChatML layout (`<|im_start|>role ... <|im_end|>`) with a fixed system turn
#[derive(Debug, Clone)]
pub struct ChatMlAssembler {
    system_prompt: String,
}

impl Default for ChatMlAssembler {
    fn default() -> Self {
        Self {
            system_prompt: "You are a thoughtful tarot reader. Interpret the drawn cards in \
                            relation to each other and to the question. Speak to the querent \
                            directly and keep the reading under 300 words."
                .to_string(),
        }
    }
}

impl ChatMlAssembler {
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    fn user_turn(input: &ReadingInput) -> String {
        let mut turn = String::new();
        let question = input.question.trim();
        if question.is_empty() {
            turn.push_str("Give me a general reading.\n");
        } else {
            let _ = writeln!(turn, "My question: {}", question);
        }

        turn.push_str("Cards drawn:\n");
        for (i, card) in input.cards.iter().enumerate() {
            let _ = write!(turn, "{}. {}", i + 1, card.name.trim());
            if card.reversed {
                turn.push_str(" (reversed)");
            }
            if let Some(position) = card.position.as_deref().filter(|p| !p.trim().is_empty()) {
                let _ = write!(turn, " as {}", position.trim());
            }
            turn.push('\n');
        }

        if let Some(style) = input.style.as_deref().filter(|s| !s.trim().is_empty()) {
            let _ = writeln!(turn, "Tone: {}", style.trim());
        }
        turn
    }
}

impl PromptAssembler for ChatMlAssembler {
    fn assemble(&self, input: &ReadingInput) -> String {
        let mut prompt = String::new();
        prompt.push_str("<|im_start|>system\n");
        prompt.push_str(&self.system_prompt);
        prompt.push_str("<|im_end|>\n");
        prompt.push_str("<|im_start|>user\n");
        prompt.push_str(&Self::user_turn(input));
        prompt.push_str("<|im_end|>\n");
        prompt.push_str("<|im_start|>assistant\n");
        prompt
    }
}
