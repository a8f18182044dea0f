use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures_util::StreamExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ollama_chat::{
    assembler_from_settings, validate_input, BackendKind, Config, HttpBackend, Overrides, Settings,
    ERROR_MARKER,
};

mod app;
mod handler;
mod tui;
mod ui;

use app::App;

#[derive(Parser)]
#[command(name = "ollama-chat", version)]
#[command(about = "Chat with a locally running Ollama model")]
struct Cli {
    #[command(flatten)]
    options: GlobalOptions,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct GlobalOptions {
    /// Model to talk to (overrides OLLAMA_MODEL)
    #[arg(short, long, global = true)]
    model: Option<String>,

    /// How to reach the model
    #[arg(long, value_enum, global = true)]
    backend: Option<BackendKind>,

    /// Wait for the complete reply instead of streaming it
    #[arg(long, global = true)]
    no_stream: bool,

    /// System instruction sent ahead of the conversation
    #[arg(long, global = true)]
    system: Option<String>,

    /// User/assistant pairs to keep as context (0 keeps everything)
    #[arg(long, global = true)]
    history_turns: Option<usize>,

    /// Seconds to wait for a complete reply
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Ollama server URL
    #[arg(long, global = true)]
    host: Option<String>,
}

impl GlobalOptions {
    fn into_overrides(self) -> Overrides {
        Overrides {
            model: self.model,
            system_prompt: self.system,
            history_turns: self.history_turns,
            timeout_secs: self.timeout,
            backend: self.backend,
            atomic: self.no_stream,
            host: self.host,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chat in the terminal (default)
    Chat,
    /// Send one message and print the reply
    Ask {
        /// Your message
        #[arg(required = true)]
        message: Vec<String>,
    },
    /// List models installed in Ollama
    Models,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Chat);

    // The TUI owns the terminal, so it logs to a file instead of stderr
    init_logging(matches!(command, Commands::Chat))?;

    let file_config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(error = %e, "ignoring unreadable config file");
            Config::default()
        }
    };
    let settings = Settings::from_environment(&file_config, &cli.options.into_overrides());
    info!(
        model = %settings.model,
        backend = settings.backend.as_str(),
        mode = settings.mode.as_str(),
        "starting"
    );

    match command {
        Commands::Chat => run_tui(settings).await,
        Commands::Ask { message } => ask(&settings, &message.join(" ")).await,
        Commands::Models => list_models(&settings).await,
    }
}

fn init_logging(to_file: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ollama_chat=info"));

    if to_file {
        let path = log_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("could not open log file {}", path.display()))?;

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(true)
            .init();
    }
    Ok(())
}

fn log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("ollama-chat")
        .join("ollama-chat.log")
}

async fn run_tui(settings: Settings) -> Result<()> {
    let assembler = assembler_from_settings(&settings);

    tui::install_panic_hook();
    let mut terminal = tui::init()?;
    let mut events = tui::EventHandler::new();
    let mut app = App::new(settings, assembler, events.sender());

    let result = run_app(&mut terminal, &mut app, &mut events).await;
    tui::restore()?;
    result
}

async fn run_app(terminal: &mut tui::Tui, app: &mut App, events: &mut tui::EventHandler) -> Result<()> {
    while !app.should_quit {
        terminal.draw(|frame| ui::render(app, frame))?;

        match events.next().await {
            Some(event) => handler::handle_event(app, event)?,
            None => break,
        }
    }
    Ok(())
}

/// One exchange outside the TUI; streamed text is printed as it grows.
///
/// A failed reply goes to stderr and the command exits non-zero.
async fn ask(settings: &Settings, message: &str) -> Result<()> {
    if validate_input(message).is_err() {
        bail!("nothing to send: the message is empty");
    }

    let assembler = assembler_from_settings(settings);
    let replies = assembler.handle_user_message(message, &settings.model);
    tokio::pin!(replies);

    let mut stdout = std::io::stdout();
    let mut shown = String::new();
    let mut last = String::new();
    while let Some(snapshot) = replies.next().await {
        let snapshot = snapshot?;
        let Some(reply) = snapshot.last() else { continue };
        last = reply.content().to_string();
        if is_failure(&last) {
            continue;
        }

        if let Some(new_text) = last.strip_prefix(shown.as_str()) {
            write!(stdout, "{}", new_text)?;
            stdout.flush()?;
        }
        shown = last.clone();
    }
    if !shown.is_empty() {
        writeln!(stdout)?;
    }

    if let Some(reason) = failure_reason(&last) {
        bail!("{}", reason);
    }
    Ok(())
}

fn is_failure(content: &str) -> bool {
    content.starts_with(ERROR_MARKER)
}

/// The description carried by an error turn.
fn failure_reason(content: &str) -> Option<&str> {
    content.strip_prefix(ERROR_MARKER).map(str::trim)
}

async fn list_models(settings: &Settings) -> Result<()> {
    let ollama = HttpBackend::new(&settings.host);

    println!("Available Ollama models at {}", ollama.base_url());
    println!("{}", "=".repeat(30));

    match ollama.list_models().await {
        Ok(models) => {
            if models.is_empty() {
                println!("No models found. Pull a model with: ollama pull llama3.2");
            } else {
                for model in models {
                    let marker = if model == settings.model { "*" } else { "•" };
                    println!("  {} {}", marker, model);
                }
            }
        }
        Err(e) => {
            println!("Error connecting to Ollama: {}", e);
            println!("Make sure Ollama is running: ollama serve");
            println!("Then pull a model: ollama pull llama3.2");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_strips_marker() {
        assert_eq!(
            failure_reason("[Error] model backend timed out after 60s"),
            Some("model backend timed out after 60s")
        );
        assert!(is_failure("[Error] model backend failed: exit 1"));
    }

    #[test]
    fn test_normal_reply_is_not_a_failure() {
        assert_eq!(failure_reason("Hello there"), None);
        assert!(!is_failure("Errors are fine to talk about"));
    }

    #[test]
    fn test_ask_parses_message_words() {
        let cli = Cli::parse_from(["ollama-chat", "--no-stream", "ask", "hola", "amigo"]);
        assert!(cli.options.no_stream);
        match cli.command {
            Some(Commands::Ask { message }) => assert_eq!(message.join(" "), "hola amigo"),
            _ => panic!("expected ask"),
        }
    }
}
