//! Vendor-agnostic chat-with-tools contract (§4.8). Concrete wire formats
//! are out of scope (§1); adapters translate to/from them.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
    pub usage: Option<Usage>,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API error ({status}): {body}")]
    ApiError { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> Result<ChatResponse, LlmError>;
}

/// Deterministic provider for tests and dry runs, the way the teacher's
/// `BackendConfig::Mock` stands in for a real coding agent in `main.rs`.
pub struct MockProvider {
    pub fixed_response: ChatResponse,
}

impl MockProvider {
    pub fn stop_with(content: impl Into<String>) -> Self {
        Self {
            fixed_response: ChatResponse {
                content: content.into(),
                tool_calls: Vec::new(),
                finish_reason: FinishReason::Stop,
                usage: None,
            },
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for MockProvider {
    async fn chat(&self, _messages: &[Message], _tools: &[ToolSpec]) -> Result<ChatResponse, LlmError> {
        Ok(self.fixed_response.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vendor {
    OpenAi,
    Anthropic,
}

impl Vendor {
    fn env_var(&self) -> &'static str {
        match self {
            Vendor::OpenAi => "OPENAI_API_KEY",
            Vendor::Anthropic => "ANTHROPIC_API_KEY",
        }
    }
}

pub struct HttpProvider {
    pub vendor: Vendor,
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub client: reqwest::Client,
}

impl HttpProvider {
    pub fn from_config(vendor: Vendor, base_url: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Option<Self> {
        let api_key = api_key.or_else(|| std::env::var(vendor.env_var()).ok())?;
        Some(Self {
            vendor,
            base_url: base_url.into(),
            model: model.into(),
            api_key,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait::async_trait]
impl LlmProvider for HttpProvider {
    async fn chat(&self, messages: &[Message], tools: &[ToolSpec]) -> Result<ChatResponse, LlmError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "tools": tools,
        });
        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::ApiError { status, body });
        }

        let value: serde_json::Value = response.json().await?;
        let content = value["content"].as_str().unwrap_or_default().to_string();
        let tool_calls = value["tool_calls"]
            .as_array()
            .map(|calls| {
                calls
                    .iter()
                    .map(|call| ToolCall {
                        name: call["name"].as_str().unwrap_or_default().to_string(),
                        arguments: call["arguments"].as_object().cloned().unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let finish_reason = match value["finish_reason"].as_str() {
            Some("tool_calls") => FinishReason::ToolCalls,
            Some("length") => FinishReason::Length,
            Some("error") => FinishReason::Error,
            _ => FinishReason::Stop,
        };

        Ok(ChatResponse {
            content,
            tool_calls,
            finish_reason,
            usage: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_provider_returns_fixed_response() {
        let provider = MockProvider::stop_with("done");
        let response = provider.chat(&[], &[]).await.unwrap();
        assert_eq!(response.content, "done");
        assert_eq!(response.finish_reason, FinishReason::Stop);
    }

    #[test]
    fn http_provider_requires_credential() {
        std::env::remove_var("OPENAI_API_KEY");
        let provider = HttpProvider::from_config(Vendor::OpenAi, "https://api.openai.com", "gpt", None);
        assert!(provider.is_none());
    }

    #[test]
    fn http_provider_falls_back_to_env_var() {
        std::env::set_var("OPENAI_API_KEY", "sk-test");
        let provider = HttpProvider::from_config(Vendor::OpenAi, "https://api.openai.com", "gpt", None);
        assert!(provider.is_some());
        std::env::remove_var("OPENAI_API_KEY");
    }
}
