//! Shared fixtures: a scripted backend, outbound probes, and a fully wired
//! engine over a temp-dir memory store.
#![allow(dead_code)]

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use std::time::Duration;

use async_trait::async_trait;
use pocketpaw::agents::{
    AgentBackend, AgentEventStream, BackendCapabilities, BackendError, BackendFactory, BackendInfo,
};
use pocketpaw::prelude::*;
use tempfile::TempDir;
use tokio::sync::Mutex;

// ─── ScriptedBackend ──────────────────────────────────────────────────────────

/// Replays a fixed event script per run, optionally sleeping before the
/// first event, and tracks how many runs were in flight at once.
pub struct ScriptedBackend {
    script: Vec<AgentEvent>,
    delay: Duration,
    pub runs: AtomicUsize,
    active: Arc<AtomicUsize>,
    pub max_active: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    pub fn factory(script: Vec<AgentEvent>) -> (Arc<Self>, BackendFactory) {
        Self::factory_with_delay(script, Duration::ZERO)
    }

    pub fn factory_with_delay(
        script: Vec<AgentEvent>,
        delay: Duration,
    ) -> (Arc<Self>, BackendFactory) {
        let backend = Arc::new(Self {
            script,
            delay,
            runs: AtomicUsize::new(0),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        });
        let for_factory = backend.clone();
        let factory: BackendFactory =
            Arc::new(move |_| Ok(for_factory.clone() as Arc<dyn AgentBackend>));
        (backend, factory)
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            name: "scripted".to_owned(),
            display_name: "Scripted".to_owned(),
            capabilities: BackendCapabilities::default(),
            builtin_tools: Vec::new(),
            tool_policy_map: Default::default(),
            required_keys: Vec::new(),
            supported_providers: Vec::new(),
        }
    }

    async fn run(
        &self,
        _message: &str,
        _system_prompt: Option<&str>,
        _history: &[ChatMessage],
        _session_key: Option<&str>,
    ) -> Result<AgentEventStream, BackendError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let script = self.script.clone();
        let delay = self.delay;
        let active = self.active.clone();
        let max_active = self.max_active.clone();

        let stream = futures::stream::unfold(
            (script.into_iter(), true),
            move |(mut events, first)| {
                let active = active.clone();
                let max_active = max_active.clone();
                async move {
                    if first {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        max_active.fetch_max(now, Ordering::SeqCst);
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                    let event = events.next()?;
                    if event == AgentEvent::Done {
                        active.fetch_sub(1, Ordering::SeqCst);
                    }
                    Some((event, (events, false)))
                }
            },
        );
        Ok(Box::pin(stream))
    }

    async fn stop(&self) {}
}

// ─── OutboundProbe ────────────────────────────────────────────────────────────

/// Records everything delivered for its subscribed channels.
pub struct OutboundProbe(pub Mutex<Vec<OutboundMessage>>);

impl OutboundProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(Mutex::new(Vec::new())))
    }

    pub async fn messages(&self) -> Vec<OutboundMessage> {
        self.0.lock().await.clone()
    }

    pub async fn stream_ends(&self) -> usize {
        self.0.lock().await.iter().filter(|m| m.is_stream_end).count()
    }

    /// Block until `n` stream ends were observed (5 s deadline).
    pub async fn wait_for_stream_ends(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if self.stream_ends().await >= n {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {n} stream ends"));
    }
}

#[async_trait]
impl OutboundSubscriber for OutboundProbe {
    async fn deliver(&self, message: OutboundMessage) -> Result<(), String> {
        self.0.lock().await.push(message);
        Ok(())
    }
}

// ─── Engine fixture ───────────────────────────────────────────────────────────

pub struct Engine {
    pub _dir: TempDir,
    pub bus: Arc<MessageBus>,
    pub memory: Arc<MemoryManager>,
    pub agent_loop: Arc<AgentLoop>,
    pub probe: Arc<OutboundProbe>,
}

pub async fn engine(settings: Settings, factory: BackendFactory) -> Engine {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn MemoryStore> =
        Arc::new(FileMemoryStore::new(dir.path().join("memory")).unwrap());
    let memory = Arc::new(MemoryManager::new(store, settings.owner_id.clone()));
    let bus = Arc::new(MessageBus::new());
    let context_builder = Arc::new(ContextBuilder::new(
        IdentityLoader::new(dir.path().join("identity")),
        memory.clone(),
        settings.owner_id.clone(),
    ));
    let command_handler = Arc::new(CommandHandler::new(memory.clone(), "scripted"));
    let agent_loop = Arc::new(
        AgentLoop::new(
            settings,
            bus.clone(),
            memory.clone(),
            context_builder,
            command_handler,
            factory,
        )
        .with_scanner(Arc::new(InjectionScanner::new())),
    );

    let probe = OutboundProbe::new();
    for channel in [
        Channel::Websocket,
        Channel::Telegram,
        Channel::Slack,
        Channel::Discord,
    ] {
        bus.subscribe_outbound(channel, probe.clone()).await;
    }

    Engine {
        _dir: dir,
        bus,
        memory,
        agent_loop,
        probe,
    }
}

pub fn quiet_settings() -> Settings {
    Settings {
        welcome_hint_enabled: false,
        ..Settings::default()
    }
}

pub fn inbound(channel: Channel, chat_id: &str, content: &str) -> InboundMessage {
    InboundMessage::new(channel, "u1", chat_id, content)
}
