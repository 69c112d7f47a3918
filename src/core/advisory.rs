//! Advisory collaborator
//!
//! A single request/response text call used by advised agents and by the
//! optional advisory debate. The collaborator owns its own timeout: a call
//! always resolves, either with text or with an error the caller falls back on.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

use super::types::{clamp_unit, Direction};
use crate::config::AdvisoryConfig;

/// Instruction sent ahead of every prompt
const SYSTEM_PROMPT: &str = "You are a trading analyst. Answer with one direction token \
(LONG, SHORT or FLAT) followed by a confidence between 0 and 1.";

/// Text-in, text-out advisory call
#[async_trait]
pub trait AdvisoryClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Direction and confidence parsed from advisory text
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Advice {
    pub direction: Direction,
    pub confidence: f64,
}

/// Parse a direction token and a confidence out of free text
///
/// The first recognised direction word wins. The first number in [0, 1] is
/// taken as-is; a number in (1, 100] is read as a percentage. Returns `None`
/// unless both are found.
pub fn parse_advice(text: &str) -> Option<Advice> {
    let tokens: Vec<&str> = text
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '.' || c == '%'))
        .filter(|t| !t.is_empty())
        .collect();

    let direction = tokens
        .iter()
        .find_map(|t| Direction::from_token(t.trim_matches('.')))?;

    let confidence = tokens.iter().find_map(|t| {
        let raw = t.trim_end_matches('.').trim_end_matches('%');
        let value: f64 = raw.parse().ok()?;
        if !value.is_finite() || value < 0.0 {
            None
        } else if value <= 1.0 {
            Some(value)
        } else if value <= 100.0 {
            Some(value / 100.0)
        } else {
            None
        }
    })?;

    Some(Advice {
        direction,
        confidence: clamp_unit(confidence),
    })
}

/// Round-robin API key rotation
#[derive(Debug)]
pub struct KeyRing {
    keys: Vec<String>,
    next: AtomicUsize,
}

impl KeyRing {
    /// Build from a comma-separated list; an empty list yields one empty key
    pub fn from_list(list: &str) -> Self {
        let mut keys: Vec<String> = list
            .split(',')
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        if keys.is_empty() {
            keys.push(String::new());
        }
        Self {
            keys,
            next: AtomicUsize::new(0),
        }
    }

    pub fn next_key(&self) -> &str {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.keys.len();
        &self.keys[idx]
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat-completions client
pub struct ChatCompletionsClient {
    endpoint: String,
    model: String,
    max_tokens: u32,
    temperature: f64,
    keys: KeyRing,
    client: reqwest::Client,
}

impl ChatCompletionsClient {
    pub fn new(cfg: &AdvisoryConfig, keys: KeyRing) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .context("failed to build advisory HTTP client")?;

        Ok(Self {
            endpoint: cfg.endpoint.clone(),
            model: cfg.model.clone(),
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
            keys,
            client,
        })
    }

    /// Build from config, reading keys from the configured environment variable
    pub fn from_config(cfg: &AdvisoryConfig) -> Result<Self> {
        let list = std::env::var(&cfg.api_keys_env).unwrap_or_default();
        Self::new(cfg, KeyRing::from_list(&list))
    }
}

#[async_trait]
impl AdvisoryClient for ChatCompletionsClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage { role: "system", content: SYSTEM_PROMPT },
                ChatMessage { role: "user", content: prompt },
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.keys.next_key())
            .json(&request)
            .send()
            .await
            .context("advisory request failed")?
            .error_for_status()
            .context("advisory service returned an error status")?;

        let body: ChatResponse = resp.json().await.context("advisory response not JSON")?;
        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow!("advisory response had no content"))?;

        debug!(model = %self.model, chars = text.len(), "advisory reply");
        Ok(text)
    }
}
