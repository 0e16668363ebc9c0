//! Chat session state: system message, history and per-session settings.
//!
//! History is stored in full. Only the most recent `context_length` completed
//! exchanges are sent with a request, so shrinking the context never deletes
//! anything.

use crate::config::{GenerationConfig, SpeechConfig};
use crate::mood::Mood;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// One chat message, serialized in the OpenAI wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Conversation state for one console session.
#[derive(Debug, Clone)]
pub struct ChatSession {
    pub system_message: Option<String>,
    history: Vec<ChatMessage>,
    context_length: usize,
    pub temperature: f64,
    pub max_tokens: usize,
    pub voice: String,
    pub audio_enabled: bool,
    pub mood: String,
}

impl ChatSession {
    /// New session from configuration, with `mood` applied.
    ///
    /// A non-empty `system_message` in the config overrides the mood's.
    pub fn new(generation: &GenerationConfig, speech: &SpeechConfig, mood: Option<&Mood>) -> Self {
        let mut session = Self {
            system_message: None,
            history: Vec::new(),
            context_length: generation.context_length,
            temperature: generation.temperature,
            max_tokens: generation.max_tokens,
            voice: speech.voice.clone(),
            audio_enabled: speech.enabled,
            mood: generation.mood.clone(),
        };
        if let Some(mood) = mood {
            session.apply_mood(mood);
        }
        if !generation.system_message.trim().is_empty() {
            session.system_message = Some(generation.system_message.clone());
        }
        session
    }

    /// Switch to `mood`: system message, temperature, token budget and (if set) voice.
    pub fn apply_mood(&mut self, mood: &Mood) {
        self.mood = mood.name.clone();
        self.system_message = if mood.system_message.trim().is_empty() {
            None
        } else {
            Some(mood.system_message.clone())
        };
        self.temperature = mood.temperature;
        self.max_tokens = mood.max_tokens;
        if let Some(voice) = &mood.voice {
            self.voice = voice.clone();
        }
    }

    pub fn context_length(&self) -> usize {
        self.context_length
    }

    /// Change how many past exchanges are sent. Stored history is untouched.
    pub fn set_context_length(&mut self, pairs: usize) {
        self.context_length = pairs;
    }

    /// Full stored history, oldest first.
    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Drop all history.
    pub fn clear(&mut self) {
        self.history.clear();
    }

    /// Message array for a request carrying `user_message`: system message,
    /// the last `context_length` completed pairs, then the new message.
    pub fn build_messages(&self, user_message: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::new();
        if let Some(system) = &self.system_message {
            messages.push(ChatMessage::system(system.clone()));
        }

        let pairs = self.completed_pairs();
        let skip = pairs.len().saturating_sub(self.context_length);
        for (user, assistant) in pairs.into_iter().skip(skip) {
            messages.push(user.clone());
            messages.push(assistant.clone());
        }

        messages.push(ChatMessage::user(user_message));
        messages
    }

    /// Record the user turn and return the request message array.
    pub fn begin_exchange(&mut self, user_message: &str) -> Vec<ChatMessage> {
        let messages = self.build_messages(user_message);
        self.history.push(ChatMessage::user(user_message));
        messages
    }

    /// Record the assistant reply for the pending user turn.
    pub fn complete_exchange(&mut self, reply: impl Into<String>) {
        if self.has_pending_user() {
            self.history.push(ChatMessage::assistant(reply));
        }
    }

    /// Remove the pending user turn. Returns whether one was removed.
    pub fn rollback(&mut self) -> bool {
        if self.has_pending_user() {
            self.history.pop();
            true
        } else {
            false
        }
    }

    fn has_pending_user(&self) -> bool {
        self.history
            .last()
            .is_some_and(|message| message.role == Role::User)
    }

    fn completed_pairs(&self) -> Vec<(&ChatMessage, &ChatMessage)> {
        self.history
            .windows(2)
            .filter(|w| w[0].role == Role::User && w[1].role == Role::Assistant)
            .map(|w| (&w[0], &w[1]))
            .collect()
    }
}
