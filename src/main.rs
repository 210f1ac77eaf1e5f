use std::io::Write;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use secrecy::SecretString;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::Level;

use murmur_client::{ChatConnection, ClientConfig, ClientEvent, ConnectionStatus, Transcript};
use murmur_core::OutboundEvent;
use murmur_llm::CompletionConfig;
use murmur_server::ServerConfig;
use murmur_telemetry::{LogFormat, TelemetryConfig};

#[derive(Parser, Debug)]
#[command(name = "murmur", version, about = "Streaming chat relay")]
struct Cli {
    #[command(flatten)]
    log: LogArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct LogArgs {
    /// Default log level; RUST_LOG takes precedence.
    #[arg(long, env = "MURMUR_LOG_LEVEL", default_value = "info", global = true)]
    log_level: Level,

    /// `pretty` or `json`.
    #[arg(long, env = "MURMUR_LOG_FORMAT", default_value = "pretty", global = true)]
    log_format: LogFormat,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the WebSocket relay server.
    Serve(ServeArgs),
    /// Interactive chat against a running server.
    Chat(ChatArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(long, env = "MURMUR_PORT", default_value_t = murmur_server::config::DEFAULT_PORT)]
    port: u16,

    /// Without a valid key the server answers with demo responses.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[arg(long, env = "MURMUR_BASE_URL", default_value = murmur_llm::config::DEFAULT_BASE_URL)]
    base_url: String,

    #[arg(long, env = "MURMUR_MODEL", default_value = murmur_llm::config::DEFAULT_MODEL)]
    model: String,

    /// Disable the in-process metrics recorder.
    #[arg(long)]
    no_metrics: bool,
}

#[derive(Args, Debug)]
struct ChatArgs {
    #[arg(long, env = "MURMUR_URL", default_value = murmur_client::config::DEFAULT_URL)]
    url: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine.
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let metrics_enabled = matches!(&cli.command, Command::Serve(args) if !args.no_metrics);
    let guard = murmur_telemetry::init_telemetry(TelemetryConfig {
        log_level: cli.log.log_level,
        format: cli.log.log_format,
        metrics_enabled,
        ..Default::default()
    });

    match cli.command {
        Command::Serve(args) => serve(args, guard.metrics()).await,
        Command::Chat(args) => chat(args).await,
    }
}

async fn serve(
    args: ServeArgs,
    metrics: Option<std::sync::Arc<murmur_telemetry::MetricsRecorder>>,
) -> anyhow::Result<()> {
    let completion = CompletionConfig {
        api_key: args.api_key.map(SecretString::from),
        base_url: args.base_url,
        model: args.model,
        ..Default::default()
    };
    let client = murmur_llm::build_client(&completion);

    let config = ServerConfig {
        port: args.port,
        ..Default::default()
    };
    let handle = murmur_server::start(config, client, metrics)
        .await
        .with_context(|| format!("failed to bind port {}", args.port))?;
    tracing::info!(port = handle.port(), "murmur ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    tracing::info!("shutdown signal received");
    handle.shutdown().await;
    Ok(())
}

async fn chat(args: ChatArgs) -> anyhow::Result<()> {
    let (handle, mut events) = ChatConnection::connect(ClientConfig::new(args.url));
    let mut transcript = Transcript::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    eprintln!("type a message, /clear to reset, /quit to exit");

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else { break };
                match line.trim() {
                    "/quit" => break,
                    "/clear" => {
                        transcript.clear();
                        continue;
                    }
                    _ => {}
                }
                match handle.send(line.as_str()).await {
                    Ok(()) => {
                        transcript.begin(line);
                    }
                    Err(e) => eprintln!("! {e}"),
                }
            }
            event = events.next_event() => {
                let Some(event) = event else { break };
                render(&event, &mut transcript)?;
            }
        }
    }

    handle.close().await;
    Ok(())
}

fn render(event: &ClientEvent, transcript: &mut Transcript) -> anyhow::Result<()> {
    let mut out = std::io::stdout().lock();
    match event {
        ClientEvent::Outbound(outbound) => {
            transcript.apply(outbound);
            match outbound {
                OutboundEvent::Token { value } => write!(out, "{value}")?,
                OutboundEvent::Done => writeln!(out)?,
                OutboundEvent::Error { message } => writeln!(out, "[Error] {message}")?,
            }
            out.flush()?;
        }
        ClientEvent::Status(status) => {
            if *status != ConnectionStatus::Connected && transcript.abort("Connection lost") {
                writeln!(out)?;
            }
            eprintln!("[{status}]");
        }
        ClientEvent::Reconnecting { attempt, delay } => {
            eprintln!("reconnecting in {} (attempt {attempt})", format_delay(*delay));
        }
        ClientEvent::GaveUp { attempts } => {
            eprintln!("gave up after {attempts} reconnect attempts");
        }
    }
    Ok(())
}

fn format_delay(delay: Duration) -> String {
    if delay.subsec_millis() == 0 {
        format!("{}s", delay.as_secs())
    } else {
        format!("{}ms", delay.as_millis())
    }
}
