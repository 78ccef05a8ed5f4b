use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;

use clap::Parser;
use mux_backend::{api, registry, StreamOptions};
use mux_core::attachment::load_image;
use mux_core::batch::{run_batch, BatchOutput};
use mux_core::config::Config;
use mux_core::select::{configure_registry, register_echo, select};
use mux_protocol::{Context, ConversationMessage};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Stream one prompt through an LLM API and print the answer.
#[derive(Parser, Debug)]
#[command(name = "llmux", version, about, long_about = None)]
struct Cli {
    /// API identifier, e.g. openai-completions, google-vertex, anthropic-messages
    #[arg(short, long)]
    api: Option<String>,

    /// Model name; defaults to the configured model for the API
    #[arg(short, long)]
    model: Option<String>,

    /// System prompt
    #[arg(short, long)]
    system: Option<String>,

    /// Attach an image (png, jpg, gif, webp); may be repeated
    #[arg(short, long = "image")]
    images: Vec<PathBuf>,

    /// Maximum output tokens
    #[arg(long)]
    max_tokens: Option<u32>,

    /// Sampling temperature
    #[arg(long)]
    temperature: Option<f32>,

    /// Echo the prompt back through the mock adapter instead of calling an API
    #[arg(long)]
    mock: bool,

    /// Prompt text; read from stdin when omitted
    prompt: Option<String>,
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("LLMUX_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn read_prompt(arg: Option<String>) -> Option<String> {
    if let Some(prompt) = arg.filter(|p| !p.trim().is_empty()) {
        return Some(prompt);
    }
    if io::stdin().is_terminal() {
        return None;
    }
    let mut buf = String::new();
    match io::stdin().read_to_string(&mut buf) {
        Ok(_) if !buf.trim().is_empty() => Some(buf.trim().to_string()),
        _ => None,
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging();

    let Some(prompt) = read_prompt(cli.prompt) else {
        eprintln!("error: no prompt given (pass it as an argument or on stdin)");
        std::process::exit(2);
    };

    let mut images = Vec::with_capacity(cli.images.len());
    for path in &cli.images {
        match load_image(path) {
            Ok(image) => images.push(image),
            Err(e) => {
                eprintln!("error: {e}");
                std::process::exit(2);
            }
        }
    }

    let config = Config::load_or_default();
    let registry = registry::global();
    configure_registry(registry, &config.backend);

    let api_id = if cli.mock {
        register_echo(registry, &prompt);
        Some(api::MOCK)
    } else {
        cli.api.as_deref()
    };
    let selection = match select(registry, &config.backend, api_id, cli.model.as_deref()) {
        Ok(selection) => selection,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(2);
        }
    };

    let mut context = Context::new(vec![ConversationMessage::user_with_images(prompt, images)]);
    if let Some(system) = cli.system {
        context = context.with_system_prompt(system);
    }

    let cancel = CancellationToken::new();
    let mut options = StreamOptions::new()
        .with_cancel(cancel.clone())
        .with_queue_capacity(config.transport.queue_capacity)
        .with_transport(config.transport.transport_config());
    if let Some(key) = selection.api_key {
        options = options.with_api_key(key);
    }
    if let Some(max_tokens) = cli.max_tokens {
        options = options.with_max_tokens(max_tokens);
    }
    if let Some(temperature) = cli.temperature {
        options = options.with_temperature(temperature);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to create async runtime: {e}");
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(async {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
        let stream = selection.provider.stream(&selection.model, &context, options);
        let mut output = BatchOutput::new(io::stdout(), io::stderr());
        run_batch(stream, &mut output).await
    });
    std::process::exit(code);
}
