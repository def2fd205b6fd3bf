//! HTTP gateway to the chat and embeddings provider.
//!
//! The gateway is stateless; callers own the message sequence. Transport
//! failures are retried with capped exponential backoff, provider errors
//! are surfaced to the caller.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::types::{ChatMessage, ChatOutcome, ToolCallRequest, ToolChoice, ToolDefinition};

/// Seam between the answer pipeline and the model provider. The agent
/// controller, safety gate, and doc index all speak through this.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        tool_choice: ToolChoice,
    ) -> Result<ChatOutcome>;

    async fn embed(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDefinition]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'a str>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<WireMessage>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallRequest>>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

pub struct LlmGateway {
    base_url: String,
    api_key: String,
    http_client: reqwest::Client,
    max_retries: u32,
}

impl LlmGateway {
    pub fn new(base_url: String, api_key: String, timeout_seconds: u64, max_retries: u32) -> Self {
        Self {
            base_url,
            api_key,
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(timeout_seconds))
                .build()
                .unwrap_or_default(),
            max_retries,
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    fn embeddings_url(&self) -> String {
        format!("{}/v1/embeddings", self.base_url)
    }

    /// POST a JSON body, retrying transport-level failures (send errors,
    /// 429, 5xx) with exponential backoff. 4xx responses are provider
    /// errors and surface immediately.
    async fn post_with_retry<B: Serialize>(&self, url: &str, body: &B) -> Result<reqwest::Response> {
        let mut attempt = 0u32;
        loop {
            let result = self
                .http_client
                .post(url)
                .bearer_auth(&self.api_key)
                .json(body)
                .send()
                .await;

            let retryable = match &result {
                Ok(resp) => {
                    let status = resp.status();
                    status.as_u16() == 429 || status.is_server_error()
                }
                Err(_) => true,
            };

            if !retryable {
                let resp = result.expect("non-retryable implies a response");
                if !resp.status().is_success() {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    return Err(anyhow!("LLM provider returned {}: {}", status, body));
                }
                return Ok(resp);
            }

            attempt += 1;
            if attempt > self.max_retries {
                return match result {
                    Ok(resp) => {
                        let status = resp.status();
                        Err(anyhow!("LLM provider returned {} after {} attempts", status, attempt))
                    }
                    Err(e) => Err(anyhow!("LLM request failed after {} attempts: {}", attempt, e)),
                };
            }

            let backoff = Duration::from_millis(500u64.saturating_mul(1 << (attempt - 1).min(4)));
            warn!(
                "LLM request attempt {} failed, retrying in {:?}",
                attempt, backoff
            );
            tokio::time::sleep(backoff).await;
        }
    }
}

#[async_trait]
impl ChatBackend for LlmGateway {
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        tool_choice: ToolChoice,
    ) -> Result<ChatOutcome> {
        debug!(
            "Chat call: model={}, {} messages, {} tools",
            model,
            messages.len(),
            tools.len()
        );
        let request = ChatCompletionRequest {
            model,
            messages,
            tools: if tools.is_empty() { None } else { Some(tools) },
            tool_choice: if tools.is_empty() {
                None
            } else {
                Some(tool_choice.as_str())
            },
            max_tokens: 2000,
            temperature: 0.0,
        };

        let response = self
            .post_with_retry(&self.completions_url(), &request)
            .await?;
        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse chat response: {}", e))?;

        let message = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .ok_or_else(|| anyhow!("Chat response carried no message"))?;

        Ok(ChatOutcome {
            text: message.content.filter(|t| !t.trim().is_empty()),
            tool_calls: message.tool_calls.unwrap_or_default(),
        })
    }

    async fn embed(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!("Embedding {} text(s) with model {}", texts.len(), model);
        let request = EmbeddingRequest {
            model,
            input: texts,
        };

        let response = self
            .post_with_retry(&self.embeddings_url(), &request)
            .await?;
        let embedding_response: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse embedding response: {}", e))?;

        let embeddings: Vec<Vec<f32>> = embedding_response
            .data
            .into_iter()
            .map(|d| d.embedding)
            .collect();
        if embeddings.len() != texts.len() {
            return Err(anyhow!(
                "Embedding count mismatch: {} inputs, {} vectors",
                texts.len(),
                embeddings.len()
            ));
        }
        debug!(
            "Embedded {} text(s) (dim={})",
            embeddings.len(),
            embeddings.first().map(|e| e.len()).unwrap_or(0)
        );
        Ok(embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let gw = LlmGateway::new("https://api.openai.com".into(), "key".into(), 60, 3);
        assert_eq!(
            gw.completions_url(),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(gw.embeddings_url(), "https://api.openai.com/v1/embeddings");
    }

    #[test]
    fn test_request_omits_tools_when_empty() {
        let messages = vec![ChatMessage::user("hi")];
        let request = ChatCompletionRequest {
            model: "m",
            messages: &messages,
            tools: None,
            tool_choice: None,
            max_tokens: 2000,
            temperature: 0.0,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("tools").is_none());
        assert!(json.get("tool_choice").is_none());
    }

    #[test]
    fn test_parses_tool_call_response() {
        let raw = serde_json::json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": {"name": "queryData", "arguments": "{\"sql\":\"SELECT 1\"}"}
                    }]
                }
            }]
        });
        let parsed: ChatCompletionResponse = serde_json::from_value(raw).unwrap();
        let message = parsed.choices.into_iter().next().unwrap().message.unwrap();
        let calls = message.tool_calls.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "queryData");
    }
}
