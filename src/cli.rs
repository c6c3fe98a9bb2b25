//! Headless CLI for the PocketPaw engine.
//!
//! `pocketpaw` (or `pocketpaw chat`) starts the full engine with the
//! terminal as the only channel: stdin lines become inbound messages, the
//! assistant streams back to stdout. `pocketpaw credentials ...` manages the
//! encrypted secret store.

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use async_trait::async_trait;
use clap::{Parser, Subcommand};

use pocketpaw::agents::default_backend_factory;
use pocketpaw::config::{load_default_settings, load_settings};
use pocketpaw::lifecycle::{Lifecycle, LifecycleRegistry};
use pocketpaw::memory::MemoryStore;
use pocketpaw::prelude::*;
use pocketpaw::security::AuditLogger;

#[derive(Parser)]
#[command(name = "pocketpaw", version, about = "Self-hosted personal AI agent")]
struct Cli {
    /// Path to config.toml (default: ~/.pocketpaw/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive terminal chat (the default).
    Chat,
    /// Manage the encrypted credential store.
    Credentials {
        #[command(subcommand)]
        action: CredentialAction,
    },
}

#[derive(Subcommand)]
enum CredentialAction {
    /// Store a secret.
    Set { name: String, value: String },
    /// Print a stored secret.
    Get { name: String },
    /// Remove a secret.
    Delete { name: String },
    /// List stored secret names (never values).
    List,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match cli.config.as_deref() {
        Some(path) => match load_settings(path) {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("error: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => load_default_settings(),
    };

    match cli.command.unwrap_or(Command::Chat) {
        Command::Chat => run_chat(settings).await,
        Command::Credentials { action } => run_credentials(settings, action),
    }
}

// ─── credentials ──────────────────────────────────────────────────────────────

fn run_credentials(settings: Settings, action: CredentialAction) -> ExitCode {
    let store = CredentialStore::new(settings.home());
    match action {
        CredentialAction::Set { name, value } => match store.set(&name, &value) {
            Ok(()) => {
                println!("stored '{name}'");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("error: {e}");
                ExitCode::FAILURE
            }
        },
        CredentialAction::Get { name } => match store.get(&name) {
            Some(value) => {
                println!("{value}");
                ExitCode::SUCCESS
            }
            None => {
                eprintln!("no credential named '{name}'");
                ExitCode::FAILURE
            }
        },
        CredentialAction::Delete { name } => match store.delete(&name) {
            Ok(()) => {
                println!("deleted '{name}'");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("error: {e}");
                ExitCode::FAILURE
            }
        },
        CredentialAction::List => {
            for name in store.get_all().keys() {
                println!("{name}");
            }
            ExitCode::SUCCESS
        }
    }
}

// ─── chat ─────────────────────────────────────────────────────────────────────

struct AdapterComponent(Arc<CliAdapter>);

#[async_trait]
impl Lifecycle for AdapterComponent {
    fn name(&self) -> &str {
        "cli-adapter"
    }
    async fn shutdown(&self) {
        if let Err(e) = self.0.stop().await {
            log::warn!("adapter stop failed: {e}");
        }
    }
}

struct LoopComponent(Arc<AgentLoop>);

#[async_trait]
impl Lifecycle for LoopComponent {
    fn name(&self) -> &str {
        "agent-loop"
    }
    async fn shutdown(&self) {
        self.0.shutdown().await;
    }
}

async fn run_chat(settings: Settings) -> ExitCode {
    let home = settings.home();
    let _log_guard = pocketpaw::logging::init(Some(&home.join("logs")));

    let credentials = CredentialStore::new(&home);
    let api_key = credentials
        .get("anthropic_api_key")
        .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
        .unwrap_or_default();
    if api_key.is_empty() {
        eprintln!(
            "warning: no API key configured — set one with\n  \
             pocketpaw credentials set anthropic_api_key <key>"
        );
    }

    let store: Arc<dyn MemoryStore> = match FileMemoryStore::new(settings.memory_dir()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("error: could not open memory store: {e}");
            return ExitCode::FAILURE;
        }
    };

    // One plain-completion client backs the ambient model hooks.
    let hooks_backend = if api_key.is_empty() {
        None
    } else {
        pocketpaw::agents::NativeBackend::new(pocketpaw::agents::NativeBackendConfig::new(
            api_key.clone(),
            settings.api_base_url.clone(),
            settings.model.clone(),
        ))
        .map(Arc::new)
        .ok()
    };

    let mut memory = MemoryManager::new(store, settings.owner_id.clone());
    if let Some(backend) = hooks_backend.as_ref() {
        memory = memory
            .with_summarizer(backend.clone())
            .with_fact_extractor(backend.clone());
    }
    let memory = Arc::new(memory);

    let bus = Arc::new(MessageBus::new());
    let context_builder = Arc::new(ContextBuilder::new(
        IdentityLoader::new(settings.identity_dir()),
        memory.clone(),
        settings.owner_id.clone(),
    ));
    let command_handler = Arc::new(CommandHandler::new(
        memory.clone(),
        settings.agent_backend.clone(),
    ));

    let mut scanner = InjectionScanner::new();
    if let Some(backend) = hooks_backend.as_ref() {
        scanner = scanner.with_deep_scanner(backend.clone());
    }

    let audit = Arc::new(AuditLogger::new(home.join("audit.log")).with_bus(bus.clone()));

    let agent_loop = Arc::new(
        AgentLoop::new(
            settings.clone(),
            bus.clone(),
            memory,
            context_builder,
            command_handler,
            default_backend_factory(api_key),
        )
        .with_scanner(Arc::new(scanner))
        .with_audit(audit),
    );

    let adapter = Arc::new(CliAdapter::new("owner", "local"));
    if let Err(e) = adapter.clone().start(bus.clone()).await {
        eprintln!("error: could not start CLI adapter: {e}");
        return ExitCode::FAILURE;
    }

    let registry = LifecycleRegistry::new();
    registry.register(Arc::new(LoopComponent(agent_loop.clone()))).await;
    registry.register(Arc::new(AdapterComponent(adapter))).await;

    println!("PocketPaw ready — type a message, /help for commands, Ctrl-C to exit.");
    let runner = tokio::spawn(agent_loop.clone().run());

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("signal handling failed: {e}");
    }
    println!("\nshutting down...");
    registry.shutdown_all().await;
    runner.abort();
    // The stdin reader may still be parked in a blocking read; exit directly
    // rather than waiting on it during runtime teardown.
    std::process::exit(0);
}
