//! Completion service boundary.
//!
//! The loop only depends on [`CompletionClient`]. The shipped implementation
//! talks to an OpenAI-compatible chat completions endpoint (OpenRouter by
//! default) over blocking HTTP.

use std::env;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::core::message::{Message, Role};
use crate::io::config::TaskConfig;

/// One completion: reply text, history including the reply, and token usage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub messages: Vec<Message>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Abstraction over the model service.
pub trait CompletionClient {
    /// Complete the conversation. The returned history must be `messages`
    /// followed by the assistant reply.
    fn complete(&self, messages: Vec<Message>) -> Result<Completion>;
}

/// Client for OpenAI-compatible chat completion endpoints.
pub struct OpenRouterClient {
    http: Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_retries: u32,
}

impl OpenRouterClient {
    /// Build from config, reading the API key from the configured env var.
    pub fn from_config(cfg: &TaskConfig) -> Result<Self> {
        let key_var = &cfg.completion.api_key_env;
        let api_key = env::var(key_var)
            .with_context(|| format!("read API key from environment variable {key_var}"))?;
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.completion.timeout_secs))
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            endpoint: cfg.completion.endpoint.clone(),
            api_key,
            model: cfg.model.clone(),
            max_retries: cfg.completion.max_retries,
        })
    }

    fn post(&self, body: &Value) -> Result<String> {
        let mut attempt = 0u32;
        loop {
            let result = self
                .http
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(body)
                .send();

            let retry_reason = match result {
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().context("read completion response body")?;
                    if status.is_success() {
                        return Ok(text);
                    }
                    if !is_retryable(status) {
                        bail!("completion request failed with status {status}: {text}");
                    }
                    format!("status {status}")
                }
                Err(err) => format!("transport error: {err}"),
            };

            if attempt >= self.max_retries {
                return Err(anyhow!(
                    "completion request failed after {} attempts ({retry_reason})",
                    attempt + 1
                ));
            }
            let backoff = Duration::from_secs(2u64.pow(attempt));
            warn!(attempt, reason = %retry_reason, backoff_secs = backoff.as_secs(), "retrying completion request");
            thread::sleep(backoff);
            attempt += 1;
        }
    }
}

impl CompletionClient for OpenRouterClient {
    #[instrument(skip_all, fields(model = %self.model, messages = messages.len()))]
    fn complete(&self, mut messages: Vec<Message>) -> Result<Completion> {
        let body = request_body(&self.model, &messages);
        let raw = self.post(&body)?;
        let reply = parse_response(&raw)?;
        debug!(
            prompt_tokens = reply.prompt_tokens,
            completion_tokens = reply.completion_tokens,
            "completion received"
        );
        messages.push(Message::assistant(reply.text.clone()));
        Ok(Completion {
            text: reply.text,
            messages,
            prompt_tokens: reply.prompt_tokens,
            completion_tokens: reply.completion_tokens,
        })
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Chat completions request body. Multi-segment messages use content parts.
fn request_body(model: &str, messages: &[Message]) -> Value {
    let messages: Vec<Value> = messages
        .iter()
        .map(|msg| match msg.role {
            Role::User => json!({
                "role": msg.role.as_str(),
                "content": msg
                    .content
                    .iter()
                    .map(|text| json!({ "type": "text", "text": text }))
                    .collect::<Vec<_>>(),
            }),
            Role::System | Role::Assistant => json!({
                "role": msg.role.as_str(),
                "content": msg.text(),
            }),
        })
        .collect();
    json!({ "model": model, "messages": messages })
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, PartialEq, Eq)]
struct Reply {
    text: String,
    prompt_tokens: u64,
    completion_tokens: u64,
}

fn parse_response(raw: &str) -> Result<Reply> {
    let parsed: ChatResponse = serde_json::from_str(raw).context("parse completion response")?;
    if let Some(error) = parsed.error {
        bail!("completion service returned an error: {error}");
    }
    let text = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| anyhow!("completion response has no message content"))?;
    let (prompt_tokens, completion_tokens) = parsed
        .usage
        .map(|u| (u.prompt_tokens, u.completion_tokens))
        .unwrap_or((0, 0));
    Ok(Reply {
        text,
        prompt_tokens,
        completion_tokens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_uses_content_parts_for_user_segments() {
        let messages = vec![
            Message::system("rules"),
            Message::user(vec!["<task>x</task>".to_string(), "env".to_string()]),
            Message::assistant("<list_files><path>.</path></list_files>"),
        ];
        let body = request_body("m/x", &messages);
        assert_eq!(body["model"], "m/x");
        assert_eq!(body["messages"][0]["content"], "rules");
        assert_eq!(body["messages"][1]["content"][1]["text"], "env");
        assert_eq!(body["messages"][1]["content"][1]["type"], "text");
        assert_eq!(body["messages"][2]["role"], "assistant");
    }

    #[test]
    fn parse_response_extracts_text_and_usage() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"hi"}}],"usage":{"prompt_tokens":12,"completion_tokens":3,"total_tokens":15}}"#;
        assert_eq!(
            parse_response(raw).expect("parse"),
            Reply {
                text: "hi".to_string(),
                prompt_tokens: 12,
                completion_tokens: 3
            }
        );
    }

    #[test]
    fn parse_response_without_usage_counts_zero() {
        let raw = r#"{"choices":[{"message":{"content":"ok"}}]}"#;
        let reply = parse_response(raw).expect("parse");
        assert_eq!((reply.prompt_tokens, reply.completion_tokens), (0, 0));
    }

    #[test]
    fn parse_response_surfaces_service_errors() {
        let err = parse_response(r#"{"error":{"message":"quota exceeded"}}"#).unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
        let err = parse_response(r#"{"choices":[]}"#).unwrap_err();
        assert!(err.to_string().contains("no message content"));
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable(StatusCode::UNAUTHORIZED));
    }
}
