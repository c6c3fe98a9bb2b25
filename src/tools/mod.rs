//! Tool system: the `Tool` trait and the registry backends expose to the
//! model.

pub mod sessions;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;

// ─── Tool trait ───────────────────────────────────────────────────────────────

/// A callable capability exposed to the agent backend.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name (e.g. `"new_session"`).
    fn name(&self) -> &str;

    /// One-paragraph description shown to the model.
    fn description(&self) -> &str;

    /// JSON-schema object describing the accepted arguments.
    fn parameters_schema(&self) -> Value;

    /// Execute with the given arguments. The `Ok` string is returned to the
    /// model verbatim; `Err` strings are surfaced as tool errors.
    async fn execute(&self, args: Value) -> Result<String, String>;
}

// ─── ToolRegistry ─────────────────────────────────────────────────────────────

/// Name-keyed collection of tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool; a later registration under the same name replaces
    /// the earlier one.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_owned(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
