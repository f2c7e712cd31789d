use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{transport, GatewayError, ModelGateway};
use crate::conversation::Turn;

/// Native Ollama `/api/chat`, non-streaming.
pub struct OllamaGateway {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    messages: &'a [Turn],
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    num_predict: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    message: Option<OllamaMessage>,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

impl OllamaGateway {
    pub fn new(base_url: String, model: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            client,
        })
    }
}

#[async_trait]
impl ModelGateway for OllamaGateway {
    async fn chat(&self, turns: &[Turn]) -> Result<String, GatewayError> {
        let url = format!("{}/api/chat", self.base_url);
        let request = OllamaRequest {
            model: &self.model,
            messages: turns,
            stream: false,
            options: OllamaOptions {
                num_predict: 4096,
                temperature: 0.3,
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(transport)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            return Err(GatewayError::Api { status, body });
        }

        let parsed: OllamaResponse = response.json().await.map_err(transport)?;
        parsed
            .message
            .map(|m| m.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(GatewayError::EmptyResponse)
    }

    fn describe(&self) -> String {
        format!("ollama:{}", self.model)
    }
}
