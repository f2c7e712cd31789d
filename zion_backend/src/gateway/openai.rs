use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{transport, GatewayError, ModelGateway};
use crate::conversation::Turn;

/// OpenAI-style `/chat/completions` backend. Also serves Cerebras.
pub struct OpenAiCompatGateway {
    label: &'static str,
    api_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Turn],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiCompatGateway {
    pub fn new(
        label: &'static str,
        api_url: String,
        api_key: String,
        model: String,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            label,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            client,
        })
    }
}

#[async_trait]
impl ModelGateway for OpenAiCompatGateway {
    async fn chat(&self, turns: &[Turn]) -> Result<String, GatewayError> {
        let url = format!("{}/chat/completions", self.api_url);
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: turns,
            temperature: 0.3,
            max_tokens: 4096,
        };

        let mut req = self.client.post(&url).json(&request);
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req.send().await.map_err(transport)?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            return Err(GatewayError::Api { status, body });
        }

        let completion: ChatCompletionResponse = response.json().await.map_err(transport)?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(GatewayError::EmptyResponse)
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.label, self.model)
    }
}
