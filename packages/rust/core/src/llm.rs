//! LLM collaborator over an OpenAI-compatible chat-completions endpoint.
//!
//! Defaults target a local Ollama server. The model is asked for a JSON object
//! (`{"summary": ...}` / `{"tags": [...]}`); plain-text replies are accepted too.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use bookmarks_shared::{BookmarkError, LlmConfig, Result, normalize_tag, resolve_api_key};

use crate::collaborators::LanguageModel;

const SUMMARIZE_PROMPT: &str = "Please summarize the following content in one or two concise \
sentences. Do not output anything other than the summarisation. \
Respond with a JSON object of the form {\"summary\": \"...\"}.";

const SUGGEST_TAGS_PROMPT: &str = "Based on the following text, suggest 3-5 relevant tags. \
Use lowercase and no numbers. Prefer single words but use '-' as a delimiter for multiple \
words if needed. Example: python programming distributed-systems ai. \
Respond with a JSON object of the form {\"tags\": [\"...\"]}.";

const TRUNCATION_MARKER: &str = "\n\n[... content truncated ...]";

static THINK_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>.*?(?:</think>|$)").expect("valid regex"));

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ReplyMessage,
}

#[derive(Debug, Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    content: Option<String>,
}

// ---------------------------------------------------------------------------
// LlmClient
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LlmClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    max_input_chars: usize,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("bookmarks/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BookmarkError::config(format!("failed to build LLM client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: resolve_api_key(config),
            max_input_chars: config.max_input_chars,
        })
    }

    /// Send one user message and return the reply with reasoning blocks removed.
    async fn complete(&self, instruction: &str, text: &str) -> Result<String> {
        let prompt = format!(
            "{instruction}\n\n{}",
            truncate_content(text, self.max_input_chars)
        );
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &prompt,
            }],
            temperature: 0.2,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| BookmarkError::Llm {
            message: format!("request failed: {e}"),
            transient: true,
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BookmarkError::Llm {
                message: format!("{status}: {}", body.chars().take(200).collect::<String>()),
                transient: is_transient_status(status),
            });
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| BookmarkError::Llm {
            message: format!("invalid completion response: {e}"),
            transient: false,
        })?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();
        let content = strip_reasoning(&content);
        debug!(reply_len = content.len(), "completion received");
        Ok(content)
    }
}

#[async_trait]
impl LanguageModel for LlmClient {
    fn model_id(&self) -> &str {
        &self.model
    }

    #[instrument(skip_all, fields(model = %self.model, text_len = text.len()))]
    async fn summarize(&self, text: &str) -> Result<String> {
        let reply = self.complete(SUMMARIZE_PROMPT, text).await?;
        let summary = match serde_json::from_str::<Value>(&reply) {
            Ok(Value::Object(map)) => map
                .get("summary")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string(),
            _ => reply.trim().to_string(),
        };

        if summary.is_empty() {
            return Err(BookmarkError::Llm {
                message: "model returned an empty summary".into(),
                transient: false,
            });
        }
        Ok(summary)
    }

    #[instrument(skip_all, fields(model = %self.model, text_len = text.len()))]
    async fn suggest_tags(&self, text: &str) -> Result<Vec<String>> {
        let reply = self.complete(SUGGEST_TAGS_PROMPT, text).await?;
        let raw = match serde_json::from_str::<Value>(&reply) {
            Ok(Value::Object(map)) => match map.get("tags") {
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(" "),
                Some(Value::String(line)) => line.clone(),
                _ => String::new(),
            },
            _ => reply,
        };
        Ok(parse_tags(&raw))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn strip_reasoning(content: &str) -> String {
    THINK_BLOCK.replace_all(content, "").trim().to_string()
}

/// Split on whitespace and commas, normalize, drop numbers-only and duplicate tags.
fn parse_tags(raw: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for candidate in raw.split(|c: char| c.is_whitespace() || c == ',') {
        let Some(tag) = normalize_tag(candidate.trim_start_matches('#')) else {
            continue;
        };
        if tag.chars().all(|c| c.is_ascii_digit()) || tags.contains(&tag) {
            continue;
        }
        tags.push(tag);
    }
    tags
}

/// Cut `content` to at most `max_chars` characters, marking the cut.
fn truncate_content(content: &str, max_chars: usize) -> String {
    match content.char_indices().nth(max_chars) {
        None => content.to_string(),
        Some((byte_idx, _)) => format!("{}{TRUNCATION_MARKER}", &content[..byte_idx]),
    }
}
