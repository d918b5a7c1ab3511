use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::env;
use std::time::Duration;

const TELEGRAM_BASE: &str = "https://api.telegram.org";

// Inbound webhook payloads. Telegram sends many more fields; everything the
// relay does not consume is ignored on deserialization.
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotProfile {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

#[async_trait]
pub trait TelegramApi: Send + Sync {
    async fn get_me(&self) -> Result<BotProfile>;
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<()>;
    async fn send_chat_action(&self, chat_id: i64, action: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct TelegramClient {
    client: Client,
    token: String,
}

impl TelegramClient {
    pub fn from_env() -> Result<Self> {
        let token = env::var("TELEGRAM_BOT_TOKEN").context("TELEGRAM_BOT_TOKEN not set")?;
        let user_agent = format!("chatlink/{}", env!("CARGO_PKG_VERSION"));
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .user_agent(user_agent)
            .build()
            .context("Failed to build Telegram HTTP client")?;
        Ok(Self { client, token })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, payload: &serde_json::Value) -> Result<T> {
        #[derive(Deserialize)]
        struct ApiResponse<T> {
            ok: bool,
            description: Option<String>,
            result: Option<T>,
        }

        let url = format!("{TELEGRAM_BASE}/bot{}/{}", self.token, method);
        let res = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .await
            .with_context(|| format!("Telegram {} request failed", method))?;
        let status = res.status();
        let body: ApiResponse<T> = res
            .json()
            .await
            .with_context(|| format!("Telegram {} response was not valid JSON", method))?;
        if !body.ok {
            return Err(anyhow!(
                "Telegram {} returned {}: {}",
                method,
                status,
                body.description.as_deref().unwrap_or("no description")
            ));
        }
        body.result
            .ok_or_else(|| anyhow!("Telegram {} returned ok without a result", method))
    }
}

#[async_trait]
impl TelegramApi for TelegramClient {
    async fn get_me(&self) -> Result<BotProfile> {
        self.call("getMe", &json!({})).await
    }

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        let payload = json!({
            "chat_id": chat_id,
            "text": text,
        });
        let _: serde_json::Value = self.call("sendMessage", &payload).await?;
        Ok(())
    }

    async fn send_chat_action(&self, chat_id: i64, action: &str) -> Result<()> {
        let payload = json!({
            "chat_id": chat_id,
            "action": action,
        });
        let _: serde_json::Value = self.call("sendChatAction", &payload).await?;
        Ok(())
    }
}
