use crate::gate::{AbuseGate, GateConfig};
use crate::gemini::{GeminiClient, GenerateApi};
use crate::memory::{ConversationStore, Role};
use crate::telegram::{TelegramApi, TelegramClient, Update};
use anyhow::Result;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use constant_time_eq::constant_time_eq;
use std::{collections::HashMap, env, net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, warn};

const MAX_BODY_BYTES: usize = 1024 * 1024; // 1MB safety cap
const GLOBAL_LIMIT: u32 = 200; // updates per minute
const GLOBAL_BURST: u32 = 20;
const DEDUPE_TTL_SECS: i64 = 600; // Telegram redelivers for a while
const MAX_DEDUPE_ENTRIES: usize = 10_000;
const MAX_CONCURRENT_REPLIES: usize = 8;
const DEFAULT_PORT: u16 = 8080;

const TYPING_ACTION_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_TYPING_TOTAL: Duration = Duration::from_secs(45);

const GREETING: &str = "hey, what's on your mind?";
const FALLBACK_REPLY: &str = "error processing your message.";
const EMPTY_REPLY: &str = "...";

const SYSTEM_INSTRUCTION: &str = "reply in fully lower-case only. never use capital letters. \
    respond like a slow, relaxed human who thinks before speaking. \
    keep the tone casual, natural, and unhurried. \
    adopt a neutral, critical-thinking style: question assumptions, \
    ask thoughtful analytical questions, and encourage examining evidence \
    without promoting misinformation. do not deny scientific facts. \
    do not promote flat-earth ideas. stay curious and reflective.";

#[derive(Clone)]
pub struct AppState {
    pub telegram: Arc<dyn TelegramApi>,
    pub model: Arc<dyn GenerateApi>,
    pub gate: Arc<AbuseGate<i64>>,
    pub memory: Arc<ConversationStore>,
    pub webhook_secret: String,
    pub global_limit: Arc<Mutex<WindowCounter>>,
    pub recent_updates: Arc<Mutex<HashMap<i64, i64>>>,
    pub reply_sem: Arc<Semaphore>,
    pub typing_total: Duration,
}

#[derive(Clone, Debug)]
pub struct WindowCounter {
    pub window: u64,
    pub count: u32,
}

pub async fn run_server() -> Result<()> {
    let telegram: Arc<dyn TelegramApi> = Arc::new(TelegramClient::from_env()?);
    match telegram.get_me().await {
        Ok(me) => info!(
            "Authorized as @{} (id {})",
            me.username.as_deref().unwrap_or("unknown"),
            me.id
        ),
        Err(e) => warn!("Could not verify bot token at startup: {}", e),
    }

    let model: Arc<dyn GenerateApi> = Arc::new(GeminiClient::from_env()?);

    let webhook_secret = env::var("TELEGRAM_WEBHOOK_SECRET")
        .ok()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow::anyhow!("TELEGRAM_WEBHOOK_SECRET must be set"))?;
    info!("Webhook requests will be checked against TELEGRAM_WEBHOOK_SECRET");

    let state = AppState {
        telegram,
        model,
        gate: Arc::new(AbuseGate::new(GateConfig::default())),
        memory: Arc::new(ConversationStore::new()),
        webhook_secret,
        global_limit: Arc::new(Mutex::new(WindowCounter {
            window: 0,
            count: 0,
        })),
        recent_updates: Arc::new(Mutex::new(HashMap::new())),
        reply_sem: Arc::new(Semaphore::new(MAX_CONCURRENT_REPLIES)),
        typing_total: DEFAULT_TYPING_TOTAL,
    };

    let app = build_router(state);

    let port = env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(handle_update))
        .route("/health", get(health))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn handle_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if !check_global_rate_limit(&state).await {
        warn!("Global update rate exceeded");
        return StatusCode::TOO_MANY_REQUESTS;
    }

    if body.len() > MAX_BODY_BYTES {
        warn!(
            "Rejecting request: body too large ({} bytes > {} bytes)",
            body.len(),
            MAX_BODY_BYTES
        );
        return StatusCode::PAYLOAD_TOO_LARGE;
    }

    // Enforce content type
    let content_type_ok = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        == Some(true);
    if !content_type_ok {
        warn!(
            "Rejecting request: unsupported content-type {:?}",
            headers.get(header::CONTENT_TYPE)
        );
        return StatusCode::UNSUPPORTED_MEDIA_TYPE;
    }

    if !verify_secret_token(&headers, &state.webhook_secret) {
        warn!("Webhook secret token verification failed");
        return StatusCode::UNAUTHORIZED;
    }

    let update: Update = match serde_json::from_slice(&body) {
        Ok(u) => u,
        Err(e) => {
            warn!("Rejecting request: invalid JSON body: {}", e);
            return StatusCode::BAD_REQUEST;
        }
    };

    if !dedupe_update(&state, update.update_id).await {
        debug!("Ignoring redelivered update {}", update.update_id);
        return StatusCode::OK;
    }

    // Edited messages, joins, callback queries and the like carry no
    // `message`; media messages carry no `text`. All are ignored.
    let Some(message) = update.message else {
        debug!("Ignoring update {} without a message", update.update_id);
        return StatusCode::OK;
    };
    let chat_id = message.chat.id;
    let Some(text) = message.text.filter(|t| !t.is_empty()) else {
        debug!(
            "Ignoring non-text message {} in chat {}",
            message.message_id, chat_id
        );
        return StatusCode::OK;
    };

    if let Some(command) = parse_command(&text) {
        if command == "start" {
            let state = state.clone();
            tokio::spawn(async move {
                if let Err(e) = state.telegram.send_message(chat_id, GREETING).await {
                    warn!("Failed to send greeting to chat {}: {}", chat_id, e);
                }
            });
        } else {
            debug!("Ignoring /{} command in chat {}", command, chat_id);
        }
        return StatusCode::OK;
    }

    // Admission runs before anything expensive. Rejected chats get no reply,
    // no error, and no state change outside the gate.
    if !state.gate.admit(chat_id, Utc::now()).is_allowed() {
        debug!("Dropping message from chat {}", chat_id);
        return StatusCode::OK;
    }

    info!("Accepted message from chat {}", chat_id);

    let state_for_task = state.clone();
    tokio::spawn(async move {
        let _permit = match state_for_task.reply_sem.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return,
        };

        if let Err(err) = process_message(&state_for_task, chat_id, &text).await {
            error!("Failed to process message in chat {}: {:?}", chat_id, err);
        }
    });

    StatusCode::OK
}

async fn process_message(state: &AppState, chat_id: i64, text: &str) -> Result<()> {
    state.memory.record(chat_id, Role::User, text, Utc::now());
    let transcript = state.memory.transcript(chat_id, SYSTEM_INSTRUCTION);

    let reply = match state.model.generate(&transcript).await {
        Ok(raw) if raw.is_empty() => EMPTY_REPLY.to_string(),
        Ok(raw) => raw.to_lowercase(),
        Err(e) => {
            error!("Generation failed for chat {}: {}", chat_id, e);
            state.telegram.send_message(chat_id, FALLBACK_REPLY).await?;
            return Ok(());
        }
    };

    state.memory.record(chat_id, Role::Bot, &reply, Utc::now());

    simulate_typing(state, chat_id).await;

    state.telegram.send_message(chat_id, &reply).await?;
    info!("Replied in chat {}", chat_id);
    Ok(())
}

// Keeps the "typing" indicator alive for a while before the reply lands,
// re-sent on the Bot API's indicator refresh interval.
async fn simulate_typing(state: &AppState, chat_id: i64) {
    let rounds = state.typing_total.as_secs() / TYPING_ACTION_INTERVAL.as_secs();
    for _ in 0..rounds {
        if let Err(e) = state.telegram.send_chat_action(chat_id, "typing").await {
            warn!("Failed to send typing action to chat {}: {}", chat_id, e);
            return;
        }
        tokio::time::sleep(TYPING_ACTION_INTERVAL).await;
    }
}

fn parse_command(text: &str) -> Option<&str> {
    let rest = text.trim().strip_prefix('/')?;
    let name = rest.split_whitespace().next().unwrap_or("");
    // Commands in groups arrive as /start@botname.
    Some(name.split('@').next().unwrap_or(name))
}

fn verify_secret_token(headers: &HeaderMap, secret: &str) -> bool {
    let Some(provided) = headers
        .get("x-telegram-bot-api-secret-token")
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    provided.len() == secret.len() && constant_time_eq(provided.as_bytes(), secret.as_bytes())
}

async fn check_global_rate_limit(state: &AppState) -> bool {
    let window = (Utc::now().timestamp() / 60) as u64;
    let mut guard = state.global_limit.lock().await;
    if guard.window != window {
        guard.window = window;
        guard.count = 0;
    }
    if guard.count >= GLOBAL_LIMIT + GLOBAL_BURST {
        return false;
    }
    guard.count += 1;
    true
}

async fn dedupe_update(state: &AppState, update_id: i64) -> bool {
    let now = Utc::now().timestamp();
    let mut guard = state.recent_updates.lock().await;
    guard.retain(|_, ts| now - *ts <= DEDUPE_TTL_SECS);
    if guard.len() > MAX_DEDUPE_ENTRIES {
        guard.clear();
    }
    if guard.contains_key(&update_id) {
        return false;
    }
    guard.insert(update_id, now);
    true
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        term.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Shutdown signal received (Ctrl+C)");
        }
        _ = terminate => {
            info!("Shutdown signal received (SIGTERM)");
        }
    }
}
