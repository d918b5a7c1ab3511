use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Reject,
}

impl Verdict {
    pub fn is_allowed(self) -> bool {
        self == Verdict::Allow
    }
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub min_interval: Duration,
    pub cooldown: Duration,
    pub flood_max_messages: usize,
    pub flood_window: Duration,
    pub flood_block: Duration,
    pub max_tracked: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::seconds(5),
            cooldown: Duration::seconds(10),
            flood_max_messages: 10,
            flood_window: Duration::seconds(60),
            flood_block: Duration::seconds(300),
            max_tracked: 10_000,
        }
    }
}

#[derive(Debug, Default)]
struct ChatState {
    last_message: Option<DateTime<Utc>>,
    cooldown_until: Option<DateTime<Utc>>,
    recent: VecDeque<DateTime<Utc>>,
    blocked_until: Option<DateTime<Utc>>,
}

impl ChatState {
    // An entry is idle once neither block is in force and no timestamp is
    // recent enough to influence a future admit.
    fn is_idle(&self, now: DateTime<Utc>, config: &GateConfig) -> bool {
        !self.blocked_until.is_some_and(|t| now < t)
            && !self.cooldown_until.is_some_and(|t| now < t)
            && !self
                .last_message
                .is_some_and(|t| now - t < config.min_interval)
            && !self
                .recent
                .back()
                .is_some_and(|t| now - *t < config.flood_window)
    }
}

/// Per-chat admission filter: a short-interval cooldown plus a sliding-window
/// flood check, consulted once per inbound message before any downstream
/// call. Rejections are silent; the caller must produce no reply for them.
///
/// Time is injected by the caller, so verdicts are a pure function of stored
/// state and `now`.
pub struct AbuseGate<K> {
    config: GateConfig,
    chats: Mutex<HashMap<K, ChatState>>,
}

impl<K: Eq + Hash> AbuseGate<K> {
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            chats: Mutex::new(HashMap::new()),
        }
    }

    pub fn admit(&self, chat: K, now: DateTime<Utc>) -> Verdict {
        let mut chats = self.chats.lock().unwrap_or_else(|e| e.into_inner());
        if chats.len() > self.config.max_tracked {
            chats.retain(|_, state| !state.is_idle(now, &self.config));
        }
        let state = chats.entry(chat).or_default();

        // Flood check runs first: a burst installs the long block even while
        // a cooldown is active, and a blocked message must not refresh
        // last_message below.
        if let Some(until) = state.blocked_until {
            if now < until {
                return Verdict::Reject;
            }
            state.blocked_until = None;
        }
        state.recent.retain(|t| now - *t < self.config.flood_window);
        state.recent.push_back(now);
        if state.recent.len() > self.config.flood_max_messages {
            state.blocked_until = Some(now + self.config.flood_block);
            return Verdict::Reject;
        }

        if let Some(until) = state.cooldown_until {
            if now < until {
                return Verdict::Reject;
            }
            state.cooldown_until = None;
        }
        if let Some(last) = state.last_message {
            if now - last < self.config.min_interval {
                state.cooldown_until = Some(now + self.config.cooldown);
                return Verdict::Reject;
            }
        }
        state.last_message = Some(now);
        Verdict::Allow
    }

    pub fn tracked(&self) -> usize {
        self.chats.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
