use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{GatewayError, ModelGateway};
use crate::conversation::Turn;

/// One canned gateway behavior.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    Error(GatewayError),
    /// Never resolves; exercises deadlines and cancellation.
    Hang,
}

impl From<&str> for ScriptedReply {
    fn from(text: &str) -> Self {
        ScriptedReply::Text(text.to_string())
    }
}

/// Replays canned replies in order and records every prompt it was sent.
/// Once the script runs out it answers `"Done."`.
#[derive(Debug, Default)]
pub struct ScriptedGateway {
    replies: Mutex<VecDeque<ScriptedReply>>,
    prompts: Mutex<Vec<Vec<Turn>>>,
}

impl ScriptedGateway {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Every prompt received so far, in call order.
    pub fn prompts(&self) -> Vec<Vec<Turn>> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().map(|p| p.len()).unwrap_or_default()
    }
}

#[async_trait]
impl ModelGateway for ScriptedGateway {
    async fn chat(&self, turns: &[Turn]) -> Result<String, GatewayError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(turns.to_vec());
        }
        let next = self.replies.lock().ok().and_then(|mut r| r.pop_front());
        match next {
            Some(ScriptedReply::Text(text)) => Ok(text),
            Some(ScriptedReply::Error(err)) => Err(err),
            Some(ScriptedReply::Hang) => std::future::pending().await,
            None => Ok("Done.".to_string()),
        }
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}
