//! relaybot main binary.

mod config;
mod gateway;
mod router;
mod routes;
mod sanitize;
mod server;
mod session;
#[cfg(test)]
mod testing;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

const DEFAULT_LOG_FILTER: &str =
    "info,relaybot=debug,rb_app=debug,rb_channels=debug,rb_backend=debug,tower_http=info";

#[derive(Debug, Parser)]
#[command(
    name = "relaybot",
    version,
    about = "Routes chat messages between a classifier and an escalation backend"
)]
struct Cli {
    /// Log output format.
    #[arg(
        long,
        global = true,
        env = "RELAYBOT_LOG_FORMAT",
        value_enum,
        default_value_t = LogFormat::Json
    )]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
    Compact,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the bot and the health server (default).
    Serve,
    /// Validate configuration from the environment and exit.
    Doctor,
    /// Send one message to a Telegram chat and exit.
    Send { chat_id: String, message: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);
    install_panic_hook();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => server::serve().await,
        Command::Doctor => server::doctor().await,
        Command::Send { chat_id, message } => server::send_one_shot(&chat_id, &message).await,
    }
}

fn init_tracing(format: LogFormat) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    match format {
        LogFormat::Json => builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Compact => builder.compact().init(),
    }

    tracing::info!(
        log_format = ?format,
        env_filter = ?std::env::var("RUST_LOG").ok(),
        "tracing initialized"
    );
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_payload_to_string(panic_info.payload());
        tracing::error!(
            panic_location = %location,
            panic_payload = %payload,
            "panic captured"
        );
        default_hook(panic_info);
    }));
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}
