//! `AgentLoop` — the conversation orchestrator.
//!
//! # Turn algorithm
//!
//! ```text
//! consume_inbound
//!       │
//!       ▼ (spawned task per message)
//! resolve alias → acquire global semaphore → acquire session mutex
//!       │
//!       ▼ process_inner
//! command? ──► reply + stream_end, done
//!       │
//! welcome hint (first message on external channels)
//!       │
//! injection scan ──► HIGH ──► system error + refusal + stream_end, done
//!       │ (sanitized content flows on)
//! persist user turn → build system prompt → compacted history
//!       │
//! backend event stream (per-item timeouts)
//!   message/code/output/error → stream chunks, accumulate
//!   thinking/tool_use/tool_result → system events only
//!   done → stop
//!       │
//! stream_end → persist assistant turn → schedule auto-learn
//! ```
//!
//! Concurrency: same resolved session key ⇒ strictly serial; different keys
//! ⇒ parallel up to `max_concurrent_conversations`.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::StreamExt;
use serde_json::json;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

use crate::bus::{
    Channel, CommandHandler, InboundMessage, MessageBus, OutboundMessage, SystemEvent,
    SystemEventKind,
};
use crate::config::Settings;
use crate::memory::{ChatMessage, MemoryManager, Role};
use crate::prompts::ContextBuilder;
use crate::security::{AuditEvent, AuditLogger, AuditSeverity, InjectionScanner, ThreatLevel};

use super::backend::AgentEvent;
use super::router::{AgentRouter, BackendFactory};

const WELCOME_TEXT: &str =
    "Welcome to PocketPaw! Type /help (or !help) to see available commands.";

const BLOCKED_TEXT: &str = "Your message was flagged by the security scanner and blocked.";

const TIMEOUT_TEXT: &str = "Request timed out — the agent backend didn't respond.\n\n\
**Possible causes:**\n\
- The API key is missing or invalid (check your credentials)\n\
- The backend service is unreachable\n\
- Try switching the agent backend in settings";

/// Channels that never get the first-contact welcome hint.
fn welcome_excluded(channel: Channel) -> bool {
    matches!(channel, Channel::Websocket | Channel::Cli | Channel::System)
}

// ─── AgentLoop ────────────────────────────────────────────────────────────────

pub struct AgentLoop {
    settings: Settings,
    bus: Arc<MessageBus>,
    memory: Arc<MemoryManager>,
    context_builder: Arc<ContextBuilder>,
    command_handler: Arc<CommandHandler>,
    scanner: Option<Arc<InjectionScanner>>,
    audit: Option<Arc<AuditLogger>>,
    backend_factory: BackendFactory,
    /// Current router; `None` forces a rebuild on next use.
    router: Mutex<Option<Arc<AgentRouter>>>,
    /// Per-resolved-session mutexes, created lazily and pruned when the
    /// releasing holder is the last reference besides the map's.
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Bounds total concurrent conversations.
    global_semaphore: Arc<Semaphore>,
    /// In-flight turn tasks.
    turn_tasks: Mutex<JoinSet<()>>,
    /// Background auto-learn tasks; aborted with a short grace on shutdown.
    learn_tasks: Mutex<JoinSet<()>>,
    running: AtomicBool,
}

impl AgentLoop {
    pub fn new(
        settings: Settings,
        bus: Arc<MessageBus>,
        memory: Arc<MemoryManager>,
        context_builder: Arc<ContextBuilder>,
        command_handler: Arc<CommandHandler>,
        backend_factory: BackendFactory,
    ) -> Self {
        let cap = settings.max_concurrent_conversations.max(1);
        Self {
            settings,
            bus,
            memory,
            context_builder,
            command_handler,
            scanner: None,
            audit: None,
            backend_factory,
            router: Mutex::new(None),
            session_locks: Mutex::new(HashMap::new()),
            global_semaphore: Arc::new(Semaphore::new(cap)),
            turn_tasks: Mutex::new(JoinSet::new()),
            learn_tasks: Mutex::new(JoinSet::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn with_scanner(mut self, scanner: Arc<InjectionScanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// The consumer loop: drain the inbound queue, spawning one task per
    /// message. Returns after [`shutdown`](Self::shutdown).
    pub async fn run(self: Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        log::info!("agent loop started (backend: {})", self.settings.agent_backend);

        while self.running.load(Ordering::SeqCst) {
            let Some(message) = self.bus.consume_inbound(Duration::from_secs(1)).await else {
                continue;
            };
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            let this = self.clone();
            let mut tasks = self.turn_tasks.lock().await;
            tasks.spawn(async move { this.process_message(message).await });
            // Reap finished turns so the set stays bounded.
            while tasks.try_join_next().is_some() {}
        }
        log::info!("agent loop stopped");
    }

    /// Stop consuming, await in-flight turns to a bounded deadline, then
    /// abort auto-learn tasks after a short grace.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);

        let mut turns = self.turn_tasks.lock().await;
        let drained = tokio::time::timeout(Duration::from_secs(10), async {
            while turns.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            log::warn!("shutdown deadline hit, aborting in-flight turns");
            turns.abort_all();
        }
        drop(turns);

        let mut learns = self.learn_tasks.lock().await;
        let drained = tokio::time::timeout(Duration::from_secs(2), async {
            while learns.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            learns.abort_all();
        }
    }

    /// Drop the router so the next turn rebuilds it from fresh settings.
    pub async fn reset_router(&self) {
        *self.router.lock().await = None;
    }

    async fn router(&self) -> Arc<AgentRouter> {
        let mut slot = self.router.lock().await;
        if let Some(router) = slot.as_ref() {
            return router.clone();
        }
        let router = Arc::new(AgentRouter::new(
            self.settings.clone(),
            self.backend_factory.clone(),
        ));
        *slot = Some(router.clone());
        router
    }

    // ── Per-message flow ─────────────────────────────────────────────────────

    /// Concurrency wrapper: alias resolution, global semaphore, session
    /// mutex, lock pruning.
    pub async fn process_message(&self, message: InboundMessage) {
        let base = message.session_key();
        log::info!("processing message from {base}");

        // Resolve first so aliased chats serialize on the same mutex.
        let resolved = match self.memory.resolve_session_key(&base).await {
            Ok(resolved) => resolved,
            Err(e) => {
                log::error!("alias resolution failed for {base}: {e}");
                base.clone()
            }
        };

        let Ok(permit) = self.global_semaphore.clone().acquire_owned().await else {
            return; // semaphore closed — shutting down
        };

        let lock = {
            let mut locks = self.session_locks.lock().await;
            locks
                .entry(resolved.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        {
            let _guard = lock.lock().await;
            self.process_inner(&message, &resolved).await;
        }

        // Prune the lock entry when nobody else holds a reference.
        {
            let mut locks = self.session_locks.lock().await;
            if let Some(entry) = locks.get(&resolved)
                && Arc::strong_count(entry) == 2
            {
                locks.remove(&resolved);
            }
        }
        drop(permit);
    }

    /// One turn, already serialized. Every exit path emits exactly one
    /// stream_end once the message is past command handling.
    async fn process_inner(&self, message: &InboundMessage, resolved: &str) {
        let channel = message.channel;
        let chat_id = message.chat_id.clone();

        // ── Command interception — before scanning, memory, or backend ──────
        if self.command_handler.is_command(&message.content) {
            if let Some(reply) = self.command_handler.handle(message).await {
                self.bus.publish_outbound(reply).await;
                self.bus
                    .publish_outbound(OutboundMessage::stream_end(channel, &chat_id))
                    .await;
                return;
            }
        }

        // ── Welcome hint on first contact over external channels ────────────
        if self.settings.welcome_hint_enabled && !welcome_excluded(channel) {
            match self.memory.get_session_history(resolved, 1).await {
                Ok(history) if history.is_empty() => {
                    self.bus
                        .publish_outbound(OutboundMessage::text(channel, &chat_id, WELCOME_TEXT))
                        .await;
                }
                Ok(_) => {}
                Err(e) => log::warn!("welcome-hint history probe failed: {e}"),
            }
        }

        // ── Injection scan ──────────────────────────────────────────────────
        let mut content = message.content.clone();
        if self.settings.injection_scan_enabled
            && let Some(scanner) = self.scanner.as_ref()
        {
            let source = message
                .metadata
                .get("source")
                .and_then(|v| v.as_str())
                .unwrap_or(channel.as_str())
                .to_owned();
            let mut scan = scanner.scan(&content, &source).await;

            if scan.threat_level == ThreatLevel::High && self.settings.injection_scan_llm {
                scan = scanner.deep_scan(&content, &source, scan).await;
            }

            if scan.threat_level == ThreatLevel::High {
                log::warn!(
                    "blocked HIGH threat injection from {source}: {:?}",
                    scan.matched_patterns
                );
                if let Some(audit) = self.audit.as_ref() {
                    audit
                        .log(
                            AuditEvent::new(
                                AuditSeverity::Alert,
                                "scanner",
                                "inbound_scan",
                                resolved,
                                "block",
                            )
                            .with_reason(scan.matched_patterns.join(", ")),
                        )
                        .await;
                }
                self.bus
                    .publish_system(SystemEvent::new(
                        SystemEventKind::Error,
                        json!({
                            "message": "Message blocked by injection scanner",
                            "patterns": scan.matched_patterns,
                        }),
                    ))
                    .await;
                self.bus
                    .publish_outbound(OutboundMessage::text(channel, &chat_id, BLOCKED_TEXT))
                    .await;
                self.bus
                    .publish_outbound(OutboundMessage::stream_end(channel, &chat_id))
                    .await;
                return;
            }

            if scan.threat_level != ThreatLevel::None {
                content = scan.sanitized_content;
            }
        }

        // ── Persist the user turn ───────────────────────────────────────────
        if let Err(e) = self
            .memory
            .add_to_session(resolved, Role::User, &content, message.metadata.clone())
            .await
        {
            log::error!("failed to persist user turn for {resolved}: {e}");
        }

        // ── Build prompt and history ────────────────────────────────────────
        // Session tools get the base key — the one the chat operates under.
        let system_prompt = self
            .context_builder
            .build_system_prompt(
                Some(&content),
                Some(channel),
                Some(&message.sender_id),
                Some(&message.session_key()),
            )
            .await;

        let history = match self
            .memory
            .get_compacted_history(resolved, &self.settings.compaction)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                log::error!("compacted history unavailable for {resolved}: {e}");
                Vec::new()
            }
        };

        self.bus
            .publish_system(SystemEvent::new(
                SystemEventKind::Thinking,
                json!({"session_key": resolved}),
            ))
            .await;

        // ── Drive the backend ───────────────────────────────────────────────
        let router = self.router().await;
        let stream = router
            .run(&content, Some(&system_prompt), &history, None)
            .await;
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                router.stop().await;
                self.bus
                    .publish_outbound(OutboundMessage::text(
                        channel,
                        &chat_id,
                        format!("An error occurred: {e}"),
                    ))
                    .await;
                self.bus
                    .publish_outbound(OutboundMessage::stream_end(channel, &chat_id))
                    .await;
                return;
            }
        };

        let first_timeout = Duration::from_secs(self.settings.first_event_timeout_secs);
        let event_timeout = Duration::from_secs(self.settings.event_timeout_secs);
        let mut full_response = String::new();
        let mut first = true;

        loop {
            let item_timeout = if first { first_timeout } else { event_timeout };
            let event = match tokio::time::timeout(item_timeout, stream.next()).await {
                Err(_) => {
                    // Hung backend: kill it so it releases resources, and
                    // force a rebuild on the next message.
                    log::error!("agent backend timed out on {resolved}");
                    router.stop().await;
                    self.reset_router().await;
                    self.bus
                        .publish_outbound(OutboundMessage::chunk(channel, &chat_id, TIMEOUT_TEXT))
                        .await;
                    self.bus
                        .publish_outbound(OutboundMessage::stream_end(channel, &chat_id))
                        .await;
                    return;
                }
                Ok(None) => break, // producer gone — treat as done
                Ok(Some(event)) => event,
            };
            first = false;

            match event {
                AgentEvent::Message { content } => {
                    full_response.push_str(&content);
                    self.bus
                        .publish_outbound(OutboundMessage::chunk(channel, &chat_id, content))
                        .await;
                }
                AgentEvent::Code { language, content } => {
                    self.bus
                        .publish_system(SystemEvent::new(
                            SystemEventKind::ToolStart,
                            json!({
                                "name": format!("run_{language}"),
                                "params": {"code": head_chars(&content, 100)},
                            }),
                        ))
                        .await;
                    let block = format!("\n```{language}\n{content}\n```\n");
                    full_response.push_str(&block);
                    self.bus
                        .publish_outbound(OutboundMessage::chunk(channel, &chat_id, block))
                        .await;
                }
                AgentEvent::Output { content } => {
                    self.bus
                        .publish_system(SystemEvent::new(
                            SystemEventKind::ToolResult,
                            json!({
                                "name": "code_execution",
                                "result": head_chars(&content, 200),
                                "status": "success",
                            }),
                        ))
                        .await;
                    let block = format!("\n```output\n{content}\n```\n");
                    full_response.push_str(&block);
                    self.bus
                        .publish_outbound(OutboundMessage::chunk(channel, &chat_id, block))
                        .await;
                }
                AgentEvent::Thinking { content } => {
                    self.bus
                        .publish_system(SystemEvent::new(
                            SystemEventKind::Thinking,
                            json!({"content": content, "session_key": resolved}),
                        ))
                        .await;
                }
                AgentEvent::ThinkingDone => {
                    self.bus
                        .publish_system(SystemEvent::new(
                            SystemEventKind::ThinkingDone,
                            json!({"session_key": resolved}),
                        ))
                        .await;
                }
                AgentEvent::ToolUse { name, input } => {
                    self.bus
                        .publish_system(SystemEvent::new(
                            SystemEventKind::ToolStart,
                            json!({"name": name, "params": input}),
                        ))
                        .await;
                }
                AgentEvent::ToolResult { name, content } => {
                    self.bus
                        .publish_system(SystemEvent::new(
                            SystemEventKind::ToolResult,
                            json!({
                                "name": name,
                                "result": head_chars(&content, 200),
                                "status": "success",
                            }),
                        ))
                        .await;
                }
                AgentEvent::Error { content } => {
                    self.bus
                        .publish_system(SystemEvent::new(
                            SystemEventKind::ToolResult,
                            json!({"name": "agent", "result": content, "status": "error"}),
                        ))
                        .await;
                    full_response.push_str(&content);
                    self.bus
                        .publish_outbound(OutboundMessage::chunk(channel, &chat_id, content))
                        .await;
                }
                AgentEvent::Done => break,
            }
        }
        // Dropping the stream tears down the backend's producer task.
        drop(stream);

        // ── Stream end ──────────────────────────────────────────────────────
        self.bus
            .publish_outbound(OutboundMessage::stream_end(channel, &chat_id))
            .await;

        // ── Persist the assistant turn ──────────────────────────────────────
        if !full_response.is_empty() {
            if let Err(e) = self
                .memory
                .add_to_session(resolved, Role::Assistant, &full_response, HashMap::new())
                .await
            {
                log::error!("failed to persist assistant turn for {resolved}: {e}");
            }

            // ── Auto-learn in the background ────────────────────────────────
            if self.settings.auto_learn_enabled() {
                let memory = self.memory.clone();
                let sender_id = message.sender_id.clone();
                let user_content = message.content.clone();
                let session = resolved.to_owned();
                self.learn_tasks.lock().await.spawn(async move {
                    let turn = [
                        ChatMessage::new(Role::User, user_content),
                        ChatMessage::new(Role::Assistant, full_response),
                    ];
                    match memory.auto_learn(&turn, Some(&sender_id)).await {
                        Ok(0) => {}
                        Ok(n) => log::debug!("auto-learned {n} facts from {session}"),
                        Err(e) => log::debug!("auto-learn failed for {session}: {e}"),
                    }
                });
            }
        }
    }
}

fn head_chars(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

// ─── Tests ────────────────────────────────────────────────────────────────────
