//! Terminal LLM assistant with prioritized multi-provider fallback.
//!
//! Provider policies are read from `~/.config/terminal-ai/providers.json`
//! (created on first run); API keys, endpoints and models come from
//! `<NAME>_API_KEY`, `<NAME>_ENDPOINT` and `<NAME>_MODEL`.
//!
//! # Examples
//!
//! ```sh
//! # Ask a question, streaming the reply
//! terminal-ai chat "Explain the borrow checker in two sentences"
//!
//! # Pin a provider, no fallback, buffered reply
//! terminal-ai chat --provider groq --no-fallback --no-stream "hello"
//!
//! # Pipe content from stdin
//! git diff | terminal-ai chat --system "You review diffs." --stdin "Review this"
//!
//! # Manage providers
//! terminal-ai provider list
//! terminal-ai provider priority gemini 0
//! terminal-ai provider byok enable
//! terminal-ai provider byok add Cerebras cerebras/llama-3.1-8b
//! ```
//!
//! Set `TERMINAL_AI_LOG=debug` for request-level diagnostics on stderr.

use clap::{ArgAction, Args, Parser, Subcommand};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use terminal_ai::events::SkipReason;
use terminal_ai::prelude::*;
use terminal_ai::registry::ByokState;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Terminal LLM assistant with prioritized multi-provider fallback.
#[derive(Parser)]
#[command(name = "terminal-ai", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send a message and print the reply
    Chat(ChatArgs),
    /// Inspect and configure providers
    Provider {
        #[command(subcommand)]
        command: ProviderCommand,
    },
}

#[derive(Args)]
struct ChatArgs {
    /// Provider to try first
    #[arg(long)]
    provider: Option<String>,

    /// Stream the reply as it is generated
    #[arg(long, conflicts_with = "no_stream")]
    stream: bool,

    /// Wait for the whole reply
    #[arg(long)]
    no_stream: bool,

    /// System prompt to set the assistant's behavior
    #[arg(long)]
    system: Option<String>,

    /// Append content read from stdin to the message
    #[arg(long)]
    stdin: bool,

    /// Model slug for every attempt, overriding each provider's model
    #[arg(long)]
    model: Option<String>,

    /// Only try the chosen (or default) provider
    #[arg(long)]
    no_fallback: bool,

    /// Message to send
    message: Vec<String>,
}

#[derive(Subcommand)]
enum ProviderCommand {
    /// Show providers in priority order
    List,
    /// Send a short test message to one provider
    Test { name: String },
    /// Include a provider in fallback
    Enable { name: String },
    /// Exclude a provider from fallback
    Disable { name: String },
    /// Set a provider's priority (0 = tried first)
    Priority { name: String, priority: i32 },
    /// Set how many times a failed request is retried on a provider
    Retries { name: String, retries: u32 },
    /// Add or update an OpenAI-compatible provider
    Add {
        name: String,
        /// Chat completions URL
        #[arg(long)]
        endpoint: String,
        /// Model slug
        #[arg(long)]
        model: String,
        /// API key to test the provider with right away. It is not saved;
        /// export <NAME>_API_KEY to keep using it
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long, default_value_t = 1)]
        priority: i32,
    },
    /// Set the default provider
    Default { name: String },
    /// Manage BYOK upstream routing for the aggregator
    Byok {
        #[command(subcommand)]
        command: ByokCommand,
    },
}

#[derive(Subcommand)]
enum ByokCommand {
    /// Route through your own upstream keys
    Enable,
    /// Use the aggregator's default routing
    Disable,
    /// Append an upstream with its model slug
    Add { name: String, model: String },
    /// Remove an upstream
    Remove { name: String },
    /// Show the BYOK configuration
    List,
    /// Replace the upstream order (comma-separated)
    Order {
        #[arg(value_delimiter = ',', required = true)]
        order: Vec<String>,
    },
    /// Send a short test message through BYOK routing
    Test,
    /// Change an upstream's model slug
    Model { name: String, model: String },
    /// Allow the aggregator's shared keys when every upstream fails
    Fallback {
        #[arg(action = ArgAction::Set)]
        allow: bool,
    },
}

// ── Workspace ──────────────────────────────────────────────────────

/// The config file, its path, and the registry built from it.
struct Workspace {
    path: PathBuf,
    file: ProviderConfigFile,
    registry: ProviderRegistry,
    env: ProcessEnv,
}

impl Workspace {
    fn load() -> Result<Self, String> {
        let path = config::providers_path()?;
        let file = ProviderConfigFile::load_or_create(&path)?;
        let env = ProcessEnv::from_env();
        let registry = file.to_registry(&env);
        Ok(Self {
            path,
            file,
            registry,
            env,
        })
    }

    fn save(&mut self) -> Result<(), String> {
        self.file.absorb(&self.registry);
        self.file.save(&self.path)
    }
}

// ── Progress output ────────────────────────────────────────────────

/// Prints dispatch progress to stderr and streamed text to stdout.
#[derive(Default)]
struct CliEventHandler {
    /// Streamed text has been written without a trailing newline.
    mid_line: AtomicBool,
}

impl CliEventHandler {
    fn end_line(&self) {
        if self.mid_line.swap(false, Ordering::Relaxed) {
            println!();
        }
    }
}

impl EventHandler for CliEventHandler {
    fn on_event(&self, event: &DispatchEvent<'_>) {
        match event {
            DispatchEvent::ProviderSkipped { provider, reason } => match reason {
                SkipReason::MissingCredential => {
                    eprintln!("  [skip] {provider}: no API key");
                }
                SkipReason::NotConfigured => eprintln!("  [skip] {provider}: not configured"),
            },
            DispatchEvent::AttemptStarted {
                provider,
                priority,
                attempt: 1,
                ..
            } => {
                eprintln!("  [provider] {provider} (priority {priority})");
            }
            DispatchEvent::ByokRouting { order, .. } => {
                eprintln!("  [byok] upstream order: {}", order.join(", "));
            }
            DispatchEvent::AttemptFailed {
                category, error, ..
            } => {
                self.end_line();
                eprintln!("  [{category}] {error}");
            }
            DispatchEvent::RetryScheduled {
                retry, max_retries, ..
            } => {
                eprintln!("  [retry {retry}/{max_retries}]");
            }
            DispatchEvent::TextDelta(text) => {
                let mut stdout = io::stdout().lock();
                let _ = stdout.write_all(text.as_bytes());
                let _ = stdout.flush();
                self.mid_line.store(true, Ordering::Relaxed);
            }
            DispatchEvent::Succeeded { provider, .. } => {
                self.end_line();
                eprintln!("  [ok] {provider}");
            }
            _ => {}
        }
    }
}

// ── Chat ───────────────────────────────────────────────────────────

fn read_stdin_content() -> Result<String, String> {
    let mut buf = String::new();
    io::stdin()
        .read_to_string(&mut buf)
        .map_err(|e| format!("failed to read stdin: {e}"))?;
    Ok(buf)
}

fn build_user_content(args: &ChatArgs) -> Result<String, String> {
    let message = args.message.join(" ");
    let piped = if args.stdin {
        Some(read_stdin_content()?)
    } else {
        None
    };

    match (message.trim().is_empty(), piped) {
        (false, Some(piped)) => Ok(format!("{message}\n\n{piped}")),
        (false, None) => Ok(message),
        (true, Some(piped)) if !piped.trim().is_empty() => Ok(piped),
        _ => Err("provide a message, --stdin, or both".to_string()),
    }
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    token
}

async fn dispatch(
    ws: &Workspace,
    request: &ChatRequest,
    options: &DispatchOptions,
) -> Result<Reply, String> {
    let transport = HttpTransport::new()?;
    let handler = CompositeEventHandler::new()
        .with(LoggingHandler)
        .with(CliEventHandler::default());
    Dispatcher::new(&ws.registry, &transport)
        .with_retry_policy(ws.file.retry_policy())
        .with_cancellation(cancel_on_interrupt())
        .with_event_handler(&handler)
        .send(request, options)
        .await
        .map_err(|e| e.to_string())
}

fn print_reply(reply: &Reply) {
    match reply {
        Reply::Buffered(completion) => match completion.content() {
            Some(text) => println!("{text}"),
            None => eprintln!("  [empty] {} returned no content", completion.provider),
        },
        Reply::Streamed(_) => {}
    }
}

async fn chat(ws: &Workspace, args: ChatArgs) -> Result<(), String> {
    let content = build_user_content(&args)?;

    let mut messages = Vec::new();
    if let Some(system) = &args.system {
        messages.push(Message::system(system));
    }
    messages.push(Message::user(content));

    let stream = if args.stream {
        true
    } else if args.no_stream {
        false
    } else {
        config::streaming_default(&ws.env)
    };
    let mut request = ChatRequest::new(messages).with_stream(stream);
    request.model = args.model;

    let options = DispatchOptions {
        preferred: args.provider,
        fallback_enabled: ws.file.fallback_enabled && !args.no_fallback,
    };
    let reply = dispatch(ws, &request, &options).await?;
    print_reply(&reply);
    Ok(())
}

// ── Providers ──────────────────────────────────────────────────────

const TEST_PROMPT: &str = "Reply with the single word: ok";

fn list_providers(ws: &Workspace) {
    let registry = &ws.registry;
    let default = registry.default_provider().unwrap_or_default();
    let mut names: Vec<&str> = registry.names().collect();
    names.sort_by_key(|name| registry.policy(name).map_or(i32::MAX, |p| p.priority));

    println!("Fallback enabled: {}", ws.file.fallback_enabled);
    println!("Default provider: {default}");
    println!("Retry delay: {}ms", ws.file.retry_delay_ms);
    println!();
    for name in names {
        let (Some(identity), Some(policy)) = (registry.identity(name), registry.policy(name))
        else {
            continue;
        };
        let marker = if name == default { "*" } else { " " };
        let state = if policy.enabled { "enabled" } else { "disabled" };
        let key = if identity.has_credential() { "key set" } else { "no key" };
        println!(
            "{marker} {name:<12} priority {:<3} {state:<8} retries {}  {key}",
            policy.priority, policy.max_retries
        );
        println!("    model:    {}", identity.model);
        println!("    endpoint: {}", identity.endpoint);
        if let Some(entry) = ws.file.providers.get(name)
            && !entry.description.is_empty()
        {
            println!("    {}", entry.description);
        }
        if policy.byok.is_enabled() {
            println!("    BYOK routing enabled");
        }
    }
}

async fn test_provider(ws: &Workspace, name: &str, model: Option<String>) -> Result<(), String> {
    let mut request = ChatRequest::new(vec![Message::user(TEST_PROMPT)]);
    request.model = model;
    let options = DispatchOptions::prefer(name).with_fallback(false);
    let reply = dispatch(ws, &request, &options).await?;
    print_reply(&reply);
    Ok(())
}

async fn provider(ws: &mut Workspace, command: ProviderCommand) -> Result<(), String> {
    match command {
        ProviderCommand::List => {
            list_providers(ws);
            return Ok(());
        }
        ProviderCommand::Test { name } => return test_provider(ws, &name, None).await,
        ProviderCommand::Byok { command } => return byok(ws, command).await,
        ProviderCommand::Enable { name } => {
            ws.registry.set_enabled(&name, true).map_err(|e| e.to_string())?;
            println!("Provider '{name}' enabled");
        }
        ProviderCommand::Disable { name } => {
            ws.registry.set_enabled(&name, false).map_err(|e| e.to_string())?;
            println!("Provider '{name}' disabled");
        }
        ProviderCommand::Priority { name, priority } => {
            ws.registry
                .set_priority(&name, priority)
                .map_err(|e| e.to_string())?;
            println!("Provider '{name}' priority set to {priority}");
        }
        ProviderCommand::Retries { name, retries } => {
            ws.registry
                .set_max_retries(&name, retries)
                .map_err(|e| e.to_string())?;
            println!("Provider '{name}' retries set to {retries}");
        }
        ProviderCommand::Add {
            name,
            endpoint,
            model,
            api_key,
            priority,
        } => {
            let test_now =
                add_provider(&mut ws.registry, &name, &endpoint, &model, api_key, priority);
            println!("Provider '{name}' added");
            println!("  Priority: {priority}");
            println!("  Endpoint: {endpoint}");
            println!("  Model:    {model}");
            println!("  Export {}_API_KEY to use it", name.to_uppercase());
            ws.save()?;
            if test_now {
                println!();
                println!("Testing '{name}' with the given key...");
                return test_provider(ws, &name, None).await;
            }
            return Ok(());
        }
        ProviderCommand::Default { name } => {
            ws.registry
                .set_default_provider(&name)
                .map_err(|e| e.to_string())?;
            println!("Default provider set to '{name}'");
        }
    }
    ws.save()
}

/// Add or update a provider, keeping the rest of an existing policy.
/// Returns whether `api_key` was given, so the new provider can be tested
/// before the key is forgotten.
fn add_provider(
    registry: &mut ProviderRegistry,
    name: &str,
    endpoint: &str,
    model: &str,
    api_key: Option<String>,
    priority: i32,
) -> bool {
    let policy = registry
        .policy(name)
        .cloned()
        .map(|p| ProviderPolicy { priority, ..p })
        .unwrap_or_else(|| ProviderPolicy::with_priority(priority));
    let test_now = api_key.as_deref().is_some_and(|key| !key.is_empty());
    let credential = api_key.filter(|key| !key.is_empty()).unwrap_or_else(|| {
        registry
            .identity(name)
            .map(|i| i.credential.clone())
            .unwrap_or_default()
    });
    registry.upsert(ProviderIdentity::new(name, endpoint, model, credential), policy);
    test_now
}

fn list_byok(ws: &Workspace) -> Result<(), String> {
    let state = ws.registry.byok().map_err(|e| e.to_string())?;
    let Some(route) = state.route() else {
        println!("BYOK not configured. Enable it with: terminal-ai provider byok enable");
        return Ok(());
    };
    println!("BYOK enabled: {}", state.is_enabled());
    println!("Fallback to shared keys: {}", route.allow_fallback_to_shared);
    if route.order.is_empty() {
        println!("No upstreams. Add one with: terminal-ai provider byok add <name> <model>");
    }
    for (i, upstream) in route.order.iter().enumerate() {
        let model = route.model_for(upstream).unwrap_or("(aggregator default)");
        println!("  {}. {upstream:<20} {model}", i + 1);
    }
    Ok(())
}

async fn byok(ws: &mut Workspace, command: ByokCommand) -> Result<(), String> {
    match command {
        ByokCommand::List => return list_byok(ws),
        ByokCommand::Test => {
            let model = match ws.registry.byok().map_err(|e| e.to_string())? {
                ByokState::Enabled(route) => route
                    .order
                    .first()
                    .and_then(|first| route.model_for(first))
                    .map(str::to_string),
                _ => return Err("BYOK is not enabled".to_string()),
            };
            return test_provider(ws, terminal_ai::AGGREGATOR_PROVIDER, model).await;
        }
        ByokCommand::Enable => {
            ws.registry.set_byok_enabled(true).map_err(|e| e.to_string())?;
            println!("BYOK enabled");
        }
        ByokCommand::Disable => {
            ws.registry.set_byok_enabled(false).map_err(|e| e.to_string())?;
            println!("BYOK disabled");
        }
        ByokCommand::Add { name, model } => {
            ws.registry
                .add_byok_upstream(&name, &model)
                .map_err(|e| e.to_string())?;
            println!("Added BYOK upstream '{name}' with model {model}");
        }
        ByokCommand::Remove { name } => {
            ws.registry
                .remove_byok_upstream(&name)
                .map_err(|e| e.to_string())?;
            println!("Removed BYOK upstream '{name}'");
        }
        ByokCommand::Order { order } => {
            let order: Vec<String> = order.into_iter().map(|s| s.trim().to_string()).collect();
            ws.registry.set_byok_order(&order).map_err(|e| e.to_string())?;
            println!("BYOK order: {}", order.join(", "));
        }
        ByokCommand::Model { name, model } => {
            ws.registry
                .set_byok_model(&name, &model)
                .map_err(|e| e.to_string())?;
            println!("BYOK upstream '{name}' now uses {model}");
        }
        ByokCommand::Fallback { allow } => {
            ws.registry.set_byok_fallback(allow).map_err(|e| e.to_string())?;
            println!("Fallback to shared keys: {allow}");
        }
    }
    ws.save()
}

// ── Entry point ────────────────────────────────────────────────────

fn init_tracing() {
    let filter =
        EnvFilter::try_from_env("TERMINAL_AI_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

async fn run(cli: Cli) -> Result<(), String> {
    let mut ws = Workspace::load()?;
    match cli.command {
        Command::Chat(args) => chat(&ws, args).await,
        Command::Provider { command } => provider(&mut ws, command).await,
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn added_provider_uses_the_given_key() {
        let mut registry = ProviderRegistry::new();
        let test_now = add_provider(
            &mut registry,
            "cerebras",
            "https://api.cerebras.ai/v1/chat/completions",
            "llama-3.1-8b",
            Some("csk-1".to_string()),
            4,
        );

        assert!(test_now);
        let identity = registry.identity("cerebras").unwrap();
        assert_eq!(identity.credential, "csk-1");
        assert_eq!(identity.model, "llama-3.1-8b");
        assert_eq!(registry.policy("cerebras").unwrap().priority, 4);
    }

    #[test]
    fn update_without_key_keeps_credential_and_policy() {
        let mut registry = ProviderRegistry::new().with_provider(
            ProviderIdentity::new("groq", "https://old.test", "old", "gk"),
            ProviderPolicy::with_priority(3).max_retries(5).disabled(),
        );

        let test_now = add_provider(&mut registry, "groq", "https://new.test", "new", None, 0);

        assert!(!test_now);
        let identity = registry.identity("groq").unwrap();
        assert_eq!(identity.credential, "gk");
        assert_eq!(identity.endpoint, "https://new.test");
        let policy = registry.policy("groq").unwrap();
        assert_eq!(policy.priority, 0);
        assert_eq!(policy.max_retries, 5);
        assert!(!policy.enabled);
    }

    #[test]
    fn provider_retries_command_parses() {
        let cli = Cli::try_parse_from(["terminal-ai", "provider", "retries", "groq", "4"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Provider {
                command: ProviderCommand::Retries { ref name, retries: 4 }
            } if name == "groq"
        ));
    }
}
