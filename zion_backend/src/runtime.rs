use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use flume::{Receiver, Sender};

use crate::agent::{AgentController, AgentEvent};
use crate::analytics::{RunObserver, SqliteObservationStore};
use crate::config::AgentConfig;
use crate::gateway::{gateway_from_config, ModelGateway};

/// A fully wired controller plus the config it was built from.
pub struct BackendRuntime {
    pub config: AgentConfig,
    pub controller: AgentController,
    pub analytics: Option<Arc<SqliteObservationStore>>,
}

pub struct BackendRuntimeBuilder {
    config: AgentConfig,
    workspace: PathBuf,
    event_tx: Option<Sender<AgentEvent>>,
    operator_input: Option<Receiver<String>>,
    gateway: Option<Arc<dyn ModelGateway>>,
}

impl BackendRuntimeBuilder {
    pub fn new(config: AgentConfig, workspace: impl Into<PathBuf>) -> Self {
        Self {
            config,
            workspace: workspace.into(),
            event_tx: None,
            operator_input: None,
            gateway: None,
        }
    }

    pub fn with_events(mut self, event_tx: Sender<AgentEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn with_operator_input(mut self, input: Receiver<String>) -> Self {
        self.operator_input = Some(input);
        self
    }

    /// Use this gateway instead of the one the config describes.
    pub fn with_gateway(mut self, gateway: Arc<dyn ModelGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn build(self) -> Result<BackendRuntime> {
        let config = self.config;
        let gateway = match self.gateway {
            Some(gateway) => gateway,
            None => gateway_from_config(&config).context("Failed to configure model gateway")?,
        };

        let mut controller = AgentController::new(config.clone(), self.workspace, gateway)
            .context("Failed to initialize agent")?;
        if let Some(tx) = self.event_tx {
            controller = controller.with_events(tx);
        }
        if let Some(rx) = self.operator_input {
            controller = controller.with_operator_input(rx);
        }

        let analytics = open_analytics(&config);
        if let Some(store) = &analytics {
            controller = controller.with_observer(store.clone() as Arc<dyn RunObserver>);
        }

        Ok(BackendRuntime {
            config,
            controller,
            analytics,
        })
    }
}

impl BackendRuntime {
    pub fn bootstrap(
        config: AgentConfig,
        workspace: impl Into<PathBuf>,
        event_tx: Sender<AgentEvent>,
    ) -> Result<Self> {
        BackendRuntimeBuilder::new(config, workspace)
            .with_events(event_tx)
            .build()
    }
}

/// Analytics are optional; failing to open the store only disables them.
fn open_analytics(config: &AgentConfig) -> Option<Arc<SqliteObservationStore>> {
    if !config.enable_analytics {
        return None;
    }
    let path = config
        .analytics_db_path
        .as_ref()
        .map(PathBuf::from)
        .or_else(SqliteObservationStore::default_path)?;
    match SqliteObservationStore::open(&path) {
        Ok(store) => {
            tracing::info!("Run analytics enabled ({})", path.display());
            Some(Arc::new(store))
        }
        Err(e) => {
            tracing::warn!("Run analytics disabled: {:#}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ScriptedGateway;

    #[test]
    fn builds_with_injected_gateway_and_analytics_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::default();
        config.analytics_db_path = Some(
            dir.path()
                .join("analytics")
                .join("learning.db")
                .display()
                .to_string(),
        );

        let runtime = BackendRuntimeBuilder::new(config, dir.path())
            .with_gateway(Arc::new(ScriptedGateway::default()))
            .build()
            .unwrap();
        assert!(runtime.analytics.is_some());
        assert!(runtime.controller.analytics_enabled());
        assert_eq!(runtime.controller.model_label(), "scripted");
    }

    #[test]
    fn analytics_can_be_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::default();
        config.enable_analytics = false;
        let runtime = BackendRuntimeBuilder::new(config, dir.path())
            .with_gateway(Arc::new(ScriptedGateway::default()))
            .build()
            .unwrap();
        assert!(!runtime.controller.analytics_enabled());
    }

    #[test]
    fn missing_credentials_fail_the_build() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::default();
        config.provider = crate::config::Provider::Cerebras;
        config.cerebras_api_key = None;
        config.enable_analytics = false;
        let err = BackendRuntimeBuilder::new(config, dir.path())
            .build()
            .err()
            .unwrap();
        assert!(format!("{:#}", err).contains("CEREBRAS_API_KEY"));
    }
}
