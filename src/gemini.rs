use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::env;
use std::time::Duration;

const GEMINI_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "gemini-2.5-flash";

#[async_trait]
pub trait GenerateApi: Send + Sync {
    /// Sends the rendered transcript and returns the model's reply text.
    /// A well-formed response carrying no text yields an empty string.
    async fn generate(&self, transcript: &str) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct GeminiClient {
    client: Client,
    api_key: String,
    model: String,
}

impl GeminiClient {
    pub fn from_env() -> Result<Self> {
        let api_key = env::var("GEMINI_API_KEY").context("GEMINI_API_KEY not set")?;
        let model = env::var("GEMINI_MODEL")
            .ok()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let user_agent = format!("chatlink/{}", env!("CARGO_PKG_VERSION"));
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(120))
            .user_agent(user_agent)
            .build()
            .context("Failed to build Gemini HTTP client")?;
        Ok(Self {
            client,
            api_key,
            model,
        })
    }
}

#[async_trait]
impl GenerateApi for GeminiClient {
    async fn generate(&self, transcript: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct GenerateResponse {
            candidates: Option<Vec<Candidate>>,
        }
        #[derive(Deserialize)]
        struct Candidate {
            content: Option<CandidateContent>,
        }
        #[derive(Deserialize)]
        struct CandidateContent {
            parts: Option<Vec<Part>>,
        }
        #[derive(Deserialize)]
        struct Part {
            text: Option<String>,
        }

        let url = format!("{GEMINI_BASE}/models/{}:generateContent", self.model);
        let payload = json!({
            "contents": [
                {
                    "role": "user",
                    "parts": [{ "text": transcript }]
                }
            ]
        });

        let res = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&payload)
            .send()
            .await
            .context("Gemini request failed")?;
        let status = res.status();
        let text = res.text().await.context("reading Gemini body failed")?;
        if !status.is_success() {
            anyhow::bail!("Gemini returned {}: {}", status, text);
        }
        let parsed: GenerateResponse =
            serde_json::from_str(&text).context("Gemini JSON parse failed")?;

        let reply = parsed
            .candidates
            .and_then(|mut c| if c.is_empty() { None } else { Some(c.remove(0)) })
            .and_then(|c| c.content)
            .and_then(|c| c.parts)
            .and_then(|mut p| if p.is_empty() { None } else { Some(p.remove(0)) })
            .and_then(|p| p.text)
            .unwrap_or_default();
        Ok(reply)
    }
}
