//! Component lifecycle registry.
//!
//! Replaces lazy per-module singletons with one explicit registry: each
//! long-lived component (adapters, the agent loop) registers a shutdown
//! hook, and teardown runs them in reverse registration order — adapters
//! stop (and unsubscribe) before the loop, the loop before the bus drops.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::Mutex;

/// A component the registry can shut down.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    fn name(&self) -> &str;

    async fn shutdown(&self);
}

// ─── LifecycleRegistry ────────────────────────────────────────────────────────

pub struct LifecycleRegistry {
    components: Mutex<Vec<Arc<dyn Lifecycle>>>,
    /// Per-component shutdown deadline.
    timeout: Duration,
}

impl Default for LifecycleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleRegistry {
    pub fn new() -> Self {
        Self {
            components: Mutex::new(Vec::new()),
            timeout: Duration::from_secs(15),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Register a component. Registration order defines teardown order
    /// (reversed).
    pub async fn register(&self, component: Arc<dyn Lifecycle>) {
        log::debug!("lifecycle: registered {}", component.name());
        self.components.lock().await.push(component);
    }

    /// Shut everything down, newest first. A component exceeding the
    /// deadline is logged and skipped; the rest still run.
    pub async fn shutdown_all(&self) {
        let components: Vec<_> = {
            let mut guard = self.components.lock().await;
            guard.drain(..).rev().collect()
        };
        for component in components {
            log::info!("lifecycle: stopping {}", component.name());
            if tokio::time::timeout(self.timeout, component.shutdown())
                .await
                .is_err()
            {
                log::warn!("lifecycle: {} exceeded shutdown deadline", component.name());
            }
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
