//! Reasoner backed by an OpenAI-compatible chat completions endpoint.
//!
//! Each invocation walks the request's model chain (primary model, then each
//! fallback) and returns the first opinion that parses. Validation of the
//! opinion itself is left to the invoker.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use coordination::{Reasoner, ReasonerError, ReasonerOpinion, ReasonerRequest, ReasonerResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ReasonerEndpoint;
use crate::prompts;

static FENCED_JSON_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(\{.*\})\s*```").expect("fenced JSON regex should compile")
});

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    reasoning_content: Option<String>,
}

pub struct HttpReasoner {
    http: reqwest::Client,
    endpoint: ReasonerEndpoint,
}

impl HttpReasoner {
    pub fn new(endpoint: ReasonerEndpoint) -> ReasonerResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(endpoint.request_timeout())
            .build()
            .map_err(|e| ReasonerError::Unavailable(e.to_string()))?;
        Ok(Self { http, endpoint })
    }

    pub fn endpoint(&self) -> &ReasonerEndpoint {
        &self.endpoint
    }

    /// One chat completion against `model`; returns the message text.
    async fn complete(&self, model: &str, system: &str, user: &str) -> ReasonerResult<String> {
        let request = ChatRequest {
            model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            max_tokens: self.endpoint.max_tokens,
            temperature: self.endpoint.temperature,
        };

        let mut builder = self
            .http
            .post(self.endpoint.chat_completions_url())
            .json(&request);
        if let Some(key) = &self.endpoint.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_connect() {
                ReasonerError::Unavailable(e.to_string())
            } else {
                ReasonerError::RequestFailed(e.to_string())
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(0);
            return Err(ReasonerError::RateLimited(Duration::from_secs(retry_after)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ReasonerError::RequestFailed(format!("HTTP {}: {}", status, body)));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| ReasonerError::Malformed(e.to_string()))?;
        let message = chat
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| ReasonerError::Malformed("no choices in response".into()))?;

        message
            .content
            .filter(|c| !c.trim().is_empty())
            .or(message.reasoning_content)
            .ok_or_else(|| ReasonerError::Malformed("empty message content".into()))
    }
}

#[async_trait]
impl Reasoner for HttpReasoner {
    async fn invoke(&self, request: &ReasonerRequest) -> ReasonerResult<ReasonerOpinion> {
        let system = prompts::system_prompt(request.agent);
        let user = prompts::user_prompt(request);
        let mut failures: Vec<(String, ReasonerError)> = Vec::new();

        for model in request.model_chain() {
            let result = match self.complete(model, &system, &user).await {
                Ok(content) => parse_opinion(&content),
                Err(err) => Err(err),
            };
            match result {
                Ok(opinion) => {
                    if !failures.is_empty() {
                        info!(
                            agent = %request.agent,
                            model,
                            failed = failures.len(),
                            "Fallback model answered"
                        );
                    }
                    debug!(agent = %request.agent, model, prompt_version = prompts::PROMPT_VERSION, "Opinion parsed");
                    return Ok(opinion);
                }
                Err(err) => {
                    warn!(agent = %request.agent, model, error = %err, "Model failed, trying next in chain");
                    failures.push((model.to_string(), err));
                }
            }
        }

        Err(chain_error(failures))
    }
}

/// Single failure keeps its kind; several collapse into one request failure.
fn chain_error(mut failures: Vec<(String, ReasonerError)>) -> ReasonerError {
    if failures.len() == 1 {
        if let Some((_, err)) = failures.pop() {
            return err;
        }
    }
    let summary: Vec<String> = failures
        .iter()
        .map(|(model, err)| format!("{model}: {err}"))
        .collect();
    ReasonerError::RequestFailed(format!("every model in the chain failed ({})", summary.join("; ")))
}

/// JSON object inside `content`: a fenced block if present, otherwise the
/// outermost braces.
pub fn extract_json(content: &str) -> Option<&str> {
    if let Some(caps) = FENCED_JSON_RE.captures(content) {
        return caps.get(1).map(|m| m.as_str());
    }
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    (end > start).then(|| &content[start..=end])
}

/// Parse a model reply into an opinion.
pub fn parse_opinion(content: &str) -> ReasonerResult<ReasonerOpinion> {
    let json = extract_json(content)
        .ok_or_else(|| ReasonerError::Malformed("no JSON object in model output".into()))?;
    serde_json::from_str(json).map_err(|e| ReasonerError::Malformed(e.to_string()))
}
