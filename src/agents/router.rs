//! `AgentRouter` — selects and drives the configured backend.
//!
//! One backend exists at a time, constructed lazily on first use from the
//! settings snapshot. [`reset`](AgentRouter::reset) drops it so the next run
//! rebuilds from fresh settings (the orchestrator resets after timeouts and
//! on configuration changes). The router forwards events untouched; it never
//! interprets the stream.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::Settings;
use crate::memory::ChatMessage;

use super::backend::{AgentBackend, AgentEventStream, BackendError, BackendInfo};
use super::native::{NativeBackend, NativeBackendConfig};

/// Builds a backend from settings; injected so tests and alternative
/// deployments can supply their own.
pub type BackendFactory =
    Arc<dyn Fn(&Settings) -> Result<Arc<dyn AgentBackend>, BackendError> + Send + Sync>;

/// The default factory: `"native"` (and, with a warning, anything unknown)
/// maps to [`NativeBackend`].
pub fn default_backend_factory(api_key: String) -> BackendFactory {
    Arc::new(move |settings: &Settings| {
        let backend = settings.agent_backend.as_str();
        if backend != "native" {
            log::warn!("unknown backend '{backend}' → using native");
        }
        let config = NativeBackendConfig::new(
            api_key.clone(),
            settings.api_base_url.clone(),
            settings.model.clone(),
        );
        Ok(Arc::new(NativeBackend::new(config)?) as Arc<dyn AgentBackend>)
    })
}

// ─── AgentRouter ──────────────────────────────────────────────────────────────

pub struct AgentRouter {
    settings: Settings,
    factory: BackendFactory,
    backend: Mutex<Option<Arc<dyn AgentBackend>>>,
}

impl AgentRouter {
    pub fn new(settings: Settings, factory: BackendFactory) -> Self {
        Self {
            settings,
            factory,
            backend: Mutex::new(None),
        }
    }

    async fn backend(&self) -> Result<Arc<dyn AgentBackend>, BackendError> {
        let mut slot = self.backend.lock().await;
        if let Some(backend) = slot.as_ref() {
            return Ok(backend.clone());
        }
        let backend = (self.factory)(&self.settings)?;
        log::info!("agent backend initialized: {}", backend.info().display_name);
        *slot = Some(backend.clone());
        Ok(backend)
    }

    /// Static info of the configured backend.
    pub async fn info(&self) -> Result<BackendInfo, BackendError> {
        Ok(self.backend().await?.info())
    }

    /// Start one run on the configured backend.
    pub async fn run(
        &self,
        message: &str,
        system_prompt: Option<&str>,
        history: &[ChatMessage],
        session_key: Option<&str>,
    ) -> Result<AgentEventStream, BackendError> {
        self.backend()
            .await?
            .run(message, system_prompt, history, session_key)
            .await
    }

    /// Stop the current backend's in-flight run, if any.
    pub async fn stop(&self) {
        let backend = self.backend.lock().await.clone();
        if let Some(backend) = backend {
            backend.stop().await;
        }
    }

    /// Drop the backend; the next call rebuilds it.
    pub async fn reset(&self) {
        *self.backend.lock().await = None;
    }

    pub async fn get_status(&self) -> serde_json::Value {
        match self.backend.lock().await.as_ref() {
            Some(backend) => backend.get_status().await,
            None => serde_json::json!({"backend": self.settings.agent_backend, "initialized": false}),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
