//! Append-only audit trail.
//!
//! Every security-relevant decision (scanner verdicts, blocked turns,
//! credential events) lands as one JSON line in `~/.pocketpaw/audit.log`
//! and, when a bus is attached, as an `audit_entry` system event for live
//! observers.

use std::{fs, path::PathBuf, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bus::{MessageBus, SystemEvent, SystemEventKind};

// ─── AuditSeverity ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Info,
    Warning,
    Alert,
}

// ─── AuditEvent ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub severity: AuditSeverity,
    /// Component that made the decision (`"scanner"`, `"orchestrator"`, ...).
    pub actor: String,
    pub action: String,
    /// What the decision applied to (a session key, a channel, a secret name).
    pub target: String,
    /// Outcome: `"allow"`, `"block"`, `"error"`, ...
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    pub fn new(
        severity: AuditSeverity,
        actor: impl Into<String>,
        action: impl Into<String>,
        target: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            severity,
            actor: actor.into(),
            action: action.into(),
            target: target.into(),
            status: status.into(),
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

// ─── AuditLogger ──────────────────────────────────────────────────────────────

pub struct AuditLogger {
    path: PathBuf,
    bus: Option<Arc<MessageBus>>,
}

impl AuditLogger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            bus: None,
        }
    }

    /// Attach a bus so entries also surface as `audit_entry` system events.
    pub fn with_bus(mut self, bus: Arc<MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Record one event. Disk failures are logged, never propagated — an
    /// unwritable audit log must not take down the turn that triggered it.
    pub async fn log(&self, event: AuditEvent) {
        let path = self.path.clone();
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                log::error!("unserializable audit event: {e}");
                return;
            }
        };

        let write = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            use std::io::Write as _;
            let mut file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
            writeln!(file, "{line}")?;
            Ok(())
        })
        .await;
        match write {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("audit log write failed: {e}"),
            Err(e) => log::error!("audit log task failed: {e}"),
        }

        if let Some(bus) = &self.bus {
            let data = serde_json::to_value(&event).unwrap_or(serde_json::Value::Null);
            bus.publish_system(SystemEvent::new(SystemEventKind::AuditEntry, data))
                .await;
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
