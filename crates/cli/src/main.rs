use base64::Engine;
use clap::{Parser, Subcommand, ValueEnum};
use lib::config::{BackendKind, Config};
use lib::orchestrator::{ChatEvent, Orchestrator};
use lib::store::{ChatStore, MemoryStore};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "clawchat")]
#[command(about = "clawchat CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Local,
    Gateway,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// List models offered by the configured backend (the gateway reports a
    /// single agent pseudo-model).
    Models {
        /// Config file path (default: CLAWCHAT_CONFIG_PATH or ~/.clawchat/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Backend override (default from config).
        #[arg(long, value_enum)]
        backend: Option<BackendArg>,
    },

    /// Probe the configured backend (5s timeout).
    Health {
        /// Config file path (default: CLAWCHAT_CONFIG_PATH or ~/.clawchat/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Backend override (default from config).
        #[arg(long, value_enum)]
        backend: Option<BackendArg>,
    },

    /// Interactive streaming chat. /retry re-runs the last turn, /regen
    /// regenerates the last reply, /title regenerates the chat title,
    /// /attach queues an image for the next message, /exit quits.
    Chat {
        /// Config file path (default: CLAWCHAT_CONFIG_PATH or ~/.clawchat/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Backend override (default from config).
        #[arg(long, value_enum)]
        backend: Option<BackendArg>,

        /// Model name override (default from config).
        #[arg(long, short, value_name = "NAME")]
        model: Option<String>,

        /// System prompt override (default from config).
        #[arg(long, value_name = "TEXT")]
        system: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("clawchat {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Models { config, backend }) => {
            if let Err(e) = run_models(config, backend).await {
                log::error!("models failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Health { config, backend }) => {
            if let Err(e) = run_health(config, backend).await {
                log::error!("health failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat {
            config,
            backend,
            model,
            system,
        }) => {
            if let Err(e) = run_chat(config, backend, model, system).await {
                log::error!("chat failed: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn load(
    config_path: Option<std::path::PathBuf>,
    backend: Option<BackendArg>,
) -> anyhow::Result<Config> {
    let (mut config, _) = lib::config::load_config(config_path)?;
    if let Some(b) = backend {
        config.backend = match b {
            BackendArg::Local => BackendKind::Local,
            BackendArg::Gateway => BackendKind::Gateway,
        };
    }
    Ok(config)
}

async fn run_models(
    config_path: Option<std::path::PathBuf>,
    backend: Option<BackendArg>,
) -> anyhow::Result<()> {
    let config = load(config_path, backend)?;
    let backend = lib::config::build_backend(&config);
    let models = backend.list_models().await?;
    if models.is_empty() {
        println!("no models reported by the {}", backend.name());
    }
    for m in models {
        println!("{}", m.name);
    }
    Ok(())
}

async fn run_health(
    config_path: Option<std::path::PathBuf>,
    backend: Option<BackendArg>,
) -> anyhow::Result<()> {
    let config = load(config_path, backend)?;
    let backend = lib::config::build_backend(&config);
    if backend.test_connection().await {
        println!("{}: ok", backend.name());
        Ok(())
    } else {
        anyhow::bail!("{} is not reachable", backend.name());
    }
}

async fn run_chat(
    config_path: Option<std::path::PathBuf>,
    backend: Option<BackendArg>,
    model: Option<String>,
    system: Option<String>,
) -> anyhow::Result<()> {
    use std::io::{self, Write};

    let config = load(config_path, backend)?;
    let backend = lib::config::build_backend(&config);
    let model = model.unwrap_or_else(|| lib::config::default_model(&config));
    let system = system
        .or_else(|| config.chat.system_prompt.clone())
        .unwrap_or_default();

    let store = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::new(backend, store.clone());
    orchestrator.load().await?;
    let chat = orchestrator
        .new_chat(&model, &system, config.chat.options)
        .await?;
    log::info!("chatting with model {}", model);

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut pending_images: Vec<String> = Vec::new();
    let mut first_turn = true;

    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
            break;
        }
        if input.eq_ignore_ascii_case("/retry") {
            let mut events = orchestrator.subscribe();
            orchestrator.retry_last(&chat.id).await?;
            stream_reply(&mut events, &chat.id).await?;
            continue;
        }
        if input.eq_ignore_ascii_case("/regen") {
            let last_assistant = store
                .messages(&chat.id)
                .await?
                .into_iter()
                .rev()
                .find(|m| m.role == lib::chat::Role::Assistant);
            let Some(target) = last_assistant else {
                println!("nothing to regenerate yet");
                continue;
            };
            let mut events = orchestrator.subscribe();
            orchestrator.regenerate(&chat.id, &target.id).await?;
            stream_reply(&mut events, &chat.id).await?;
            continue;
        }
        if input.eq_ignore_ascii_case("/title") {
            let mut events = orchestrator.subscribe();
            orchestrator.generate_title(&chat.id).await?;
            show_title(&mut events, &chat.id).await;
            continue;
        }
        if let Some(path) = input.strip_prefix("/attach ") {
            match std::fs::read(path.trim()) {
                Ok(bytes) => {
                    pending_images
                        .push(base64::engine::general_purpose::STANDARD.encode(bytes));
                    println!("attached {} (sent with your next message)", path.trim());
                }
                Err(e) => eprintln!("could not read {}: {}", path.trim(), e),
            }
            continue;
        }

        let mut events = orchestrator.subscribe();
        orchestrator
            .send_prompt(&chat.id, input, std::mem::take(&mut pending_images))
            .await?;
        stream_reply(&mut events, &chat.id).await?;

        if first_turn {
            first_turn = false;
            orchestrator.generate_title(&chat.id).await?;
        }
    }

    Ok(())
}

/// Print deltas for one chat until its stream ends or fails.
async fn stream_reply(
    events: &mut tokio::sync::broadcast::Receiver<ChatEvent>,
    chat_id: &str,
) -> anyhow::Result<()> {
    use std::io::Write;
    use tokio::sync::broadcast::error::RecvError;

    let mut stdout = std::io::stdout();
    loop {
        match events.recv().await {
            Ok(ChatEvent::Delta { chat_id: id, delta }) if id == chat_id => {
                write!(stdout, "{}", delta)?;
                stdout.flush()?;
            }
            Ok(ChatEvent::StreamEnded { chat_id: id }) if id == chat_id => {
                writeln!(stdout)?;
                return Ok(());
            }
            Ok(ChatEvent::StreamError {
                chat_id: id,
                message,
            }) if id == chat_id => {
                eprintln!("error: {}", message);
                return Ok(());
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                log::debug!("event stream lagged, skipped {}", skipped);
            }
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}

/// Wait for title generation to settle and print the result. The final
/// title is re-emitted once persisted; a quiet window after at least one
/// update also counts as settled.
async fn show_title(events: &mut tokio::sync::broadcast::Receiver<ChatEvent>, chat_id: &str) {
    let settled = tokio::time::timeout(Duration::from_secs(30), async {
        let mut last: Option<String> = None;
        loop {
            let received = tokio::time::timeout(Duration::from_secs(2), events.recv()).await;
            match received {
                Ok(Ok(ChatEvent::TitleUpdated { chat_id: id, title })) if id == chat_id => {
                    if last.as_deref() == Some(title.as_str()) {
                        return Some(title);
                    }
                    last = Some(title);
                }
                Ok(Ok(_)) => {}
                Ok(Err(_)) => return last,
                Err(_) if last.is_some() => return last,
                Err(_) => {}
            }
        }
    })
    .await;
    match settled {
        Ok(Some(title)) => println!("title: {}", title),
        _ => println!("title generation did not finish"),
    }
}
