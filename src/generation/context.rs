use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly, professional assistant on a live phone call.

Guidelines:
- Speak naturally; your words are converted to speech
- Keep every reply to 1-3 short sentences
- Ask one follow-up question at a time
- Offer to schedule a callback or appointment when it helps the caller
- If you did not understand, politely ask the caller to repeat
- Never use lists, markdown, or emoji

The caller can interrupt you at any moment; if they do, stop and listen.";

/// Utterances kept in history; older ones are dropped first.
pub const DEFAULT_MAX_HISTORY: usize = 40;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Utterance {
    pub role: Role,
    pub content: String,
    pub timestamp: u64,
}

/// Persona plus the conversation so far.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationContext {
    pub system_prompt: String,
    pub history: Vec<Utterance>,
    pub caller_profile: Option<Value>,
    pub max_history: usize,
}

impl Default for ConversationContext {
    fn default() -> Self {
        Self::realtime()
    }
}

impl ConversationContext {
    #[must_use]
    pub fn realtime() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            history: Vec::new(),
            caller_profile: None,
            max_history: DEFAULT_MAX_HISTORY,
        }
    }

    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    #[must_use]
    pub fn with_caller_profile(mut self, profile: Value) -> Self {
        self.caller_profile = Some(profile);
        self
    }

    #[must_use]
    pub const fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }

    pub fn push(&mut self, role: Role, content: impl Into<String>, timestamp: u64) {
        self.history.push(Utterance {
            role,
            content: content.into(),
            timestamp,
        });
        let excess = self.history.len().saturating_sub(self.max_history);
        if excess > 0 {
            self.history.drain(..excess);
        }
    }

    /// Role-tagged messages for a chat completion: persona, caller profile,
    /// history, then `prompt`.
    #[must_use]
    pub fn messages(&self, prompt: &str) -> Vec<(Role, String)> {
        let mut out = Vec::with_capacity(self.history.len() + 3);
        out.push((Role::System, self.system_prompt.clone()));
        if let Some(profile) = &self.caller_profile {
            out.push((Role::System, format!("Caller profile: {profile}")));
        }
        out.extend(self.history.iter().map(|u| (u.role, u.content.clone())));
        out.push((Role::User, prompt.to_string()));
        out
    }
}
