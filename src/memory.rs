use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

const MAX_TURNS_PER_CHAT: usize = 64;
const MAX_TRACKED_CHATS: usize = 10_000;
const IDLE_RETENTION_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Bot,
}

impl Role {
    fn label(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Bot => "bot",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

#[derive(Debug, Default)]
struct ChatHistory {
    turns: VecDeque<Turn>,
    last_active: Option<DateTime<Utc>>,
}

/// Per-chat conversation history, kept in-process for the lifetime of the
/// server. Each chat holds only its most recent turns, and chats idle past
/// the retention horizon are dropped once the map grows past capacity.
pub struct ConversationStore {
    chats: Mutex<HashMap<i64, ChatHistory>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self {
            chats: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, chat_id: i64, role: Role, text: &str, now: DateTime<Utc>) {
        let mut chats = self.chats.lock().unwrap_or_else(|e| e.into_inner());
        if chats.len() > MAX_TRACKED_CHATS {
            let horizon = now - Duration::hours(IDLE_RETENTION_HOURS);
            chats.retain(|_, history| history.last_active.is_some_and(|t| t > horizon));
        }
        let history = chats.entry(chat_id).or_default();
        history.turns.push_back(Turn {
            role,
            text: text.to_string(),
        });
        while history.turns.len() > MAX_TURNS_PER_CHAT {
            history.turns.pop_front();
        }
        history.last_active = Some(now);
    }

    // Renders the flat prompt the model sees: the system instruction followed
    // by the chat's turns in order.
    pub fn transcript(&self, chat_id: i64, system_instruction: &str) -> String {
        let chats = self.chats.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = format!("system: {}\n\n", system_instruction);
        if let Some(history) = chats.get(&chat_id) {
            for turn in &history.turns {
                out.push_str(turn.role.label());
                out.push_str(": ");
                out.push_str(&turn.text);
                out.push('\n');
            }
        }
        out
    }

    pub fn tracked(&self) -> usize {
        self.chats.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}
