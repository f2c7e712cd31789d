//! Model backends behind a single `chat(turns) -> text` seam.

mod ollama;
mod openai;
mod scripted;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{AgentConfig, Provider};
use crate::conversation::Turn;

pub use ollama::OllamaGateway;
pub use openai::OpenAiCompatGateway;
pub use scripted::{ScriptedGateway, ScriptedReply};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("LLM request timed out after {0} seconds")]
    Timeout(u64),
    #[error("LLM request cancelled")]
    Cancelled,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("API returned error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("empty response from model")]
    EmptyResponse,
}

#[async_trait]
pub trait ModelGateway: Send + Sync {
    async fn chat(&self, turns: &[Turn]) -> Result<String, GatewayError>;

    /// Provider and model label for logs and status lines.
    fn describe(&self) -> String;
}

/// Race one gateway call against a deadline and a cancellation token.
pub async fn call_with_deadline(
    gateway: &dyn ModelGateway,
    turns: &[Turn],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<String, GatewayError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(GatewayError::Cancelled),
        result = tokio::time::timeout(timeout, gateway.chat(turns)) => match result {
            Ok(inner) => inner,
            Err(_) => Err(GatewayError::Timeout(timeout.as_secs())),
        },
    }
}

/// Build the configured backend. Missing credentials are an error naming the variable.
pub fn gateway_from_config(config: &AgentConfig) -> Result<Arc<dyn ModelGateway>> {
    let timeout = Duration::from_secs(config.request_timeout_secs);
    let gateway: Arc<dyn ModelGateway> = match config.provider {
        Provider::Ollama => Arc::new(OllamaGateway::new(
            config.ollama_base_url.clone(),
            config.model.clone(),
            timeout,
        )?),
        Provider::OpenAi => {
            let key = config
                .openai_api_key
                .clone()
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| anyhow::anyhow!("OPENAI_API_KEY is not set"))?;
            Arc::new(OpenAiCompatGateway::new(
                "openai",
                config.openai_base_url.clone(),
                key,
                config.model.clone(),
                timeout,
            )?)
        }
        Provider::Cerebras => {
            let key = config
                .cerebras_api_key
                .clone()
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| anyhow::anyhow!("CEREBRAS_API_KEY is not set"))?;
            Arc::new(OpenAiCompatGateway::new(
                "cerebras",
                config.cerebras_base_url.clone(),
                key,
                config.model.clone(),
                timeout,
            )?)
        }
    };
    tracing::info!("Using model gateway {}", gateway.describe());
    Ok(gateway)
}

fn transport(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Transport(format!("request timed out: {}", err))
    } else {
        GatewayError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deadline_turns_a_hang_into_timeout() {
        let gateway = ScriptedGateway::new(vec![ScriptedReply::Hang]);
        let cancel = CancellationToken::new();
        let result = call_with_deadline(
            &gateway,
            &[Turn::user("hi")],
            Duration::from_millis(50),
            &cancel,
        )
        .await;
        assert_eq!(result, Err(GatewayError::Timeout(0)));
    }

    #[tokio::test]
    async fn cancellation_wins_over_a_hang() {
        let gateway = ScriptedGateway::new(vec![ScriptedReply::Hang]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result =
            call_with_deadline(&gateway, &[Turn::user("hi")], Duration::from_secs(5), &cancel)
                .await;
        assert_eq!(result, Err(GatewayError::Cancelled));
    }

    #[test]
    fn missing_key_names_the_variable() {
        let config = AgentConfig {
            provider: Provider::Cerebras,
            cerebras_api_key: None,
            ..AgentConfig::default()
        };
        let err = gateway_from_config(&config).err().unwrap();
        assert!(err.to_string().contains("CEREBRAS_API_KEY"));
    }

    #[test]
    fn ollama_needs_no_key() {
        let gateway = gateway_from_config(&AgentConfig::default()).unwrap();
        assert!(gateway.describe().starts_with("ollama"));
    }
}
