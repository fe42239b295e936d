use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::{io::AsyncReadExt, sync::mpsc};
use tokio_util::sync::CancellationToken;

use session_relay::{
    chat::{ChatApi, ChatEvent},
    config::{Config, DEFAULT_HOOK_PORT},
    events::{init_logging, EventEmitter},
    hook_api,
    process::ProcessManager,
    relay::Relay,
    remote_control::RemoteControl,
    session::Session,
    telegram::TelegramClient,
};

#[derive(Debug, Parser)]
#[command(name = "session-relay")]
#[command(about = "Relay assistant session hooks to Telegram and drive sessions from replies")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the hook listener and the Telegram bot.
    Serve(Config),
    /// Forward a hook payload read from stdin to a running relay.
    Notify(NotifyCommand),
}

#[derive(Debug, clap::Args)]
struct NotifyCommand {
    #[arg(long, env = "RELAY_HOOK_PORT", default_value_t = DEFAULT_HOOK_PORT)]
    port: u16,

    #[arg(long, default_value_t = 5)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(config) => run_serve(config).await,
        Commands::Notify(cmd) => run_notify(cmd).await,
    }
}

async fn run_serve(config: Config) -> Result<()> {
    init_logging(&config.log_level)?;
    let settings = config.resolve().context("invalid configuration")?;

    let telegram = Arc::new(
        TelegramClient::new(&settings.api_base_url, &settings.bot_token)
            .context("failed to build Telegram client")?,
    );
    if let Err(error) = telegram.delete_webhook().await {
        tracing::warn!(error = %error, "deleteWebhook failed; polling may be rejected");
    }

    let processes = ProcessManager::new(settings.claude.clone());
    let chat: Arc<dyn ChatApi> = telegram.clone();
    let relay = Relay::new(chat, processes.clone(), settings.chat_id, settings.editor)
        .with_remote_control(
            settings
                .rc_command
                .clone()
                .map(|command| RemoteControl::new(command, settings.rc_wait)),
        )
        .with_events(EventEmitter::new(config.json_events));

    // Hook handlers only construct sessions; the main loop dispatches them.
    let (session_tx, mut session_rx) = mpsc::channel::<Session>(32);
    let listener = hook_api::bind(settings.port).await?;
    let server = tokio::spawn(async move {
        if let Err(error) = hook_api::serve(listener, session_tx).await {
            tracing::error!(error = ?error, "hook listener stopped");
        }
    });

    let (chat_tx, mut chat_rx) = mpsc::channel::<ChatEvent>(64);
    let cancel = CancellationToken::new();
    let poller = tokio::spawn(telegram.clone().run_polling(chat_tx, cancel.clone()));

    tracing::info!(
        port = settings.port,
        chat_id = settings.chat_id,
        claude = %settings.claude.program,
        remote_control = settings.rc_command.is_some(),
        "session relay started"
    );

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut running = true;

    while running {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                running = false;
            }

            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                running = false;
            }

            Some(session) = session_rx.recv() => {
                let relay = relay.clone();
                tokio::spawn(async move {
                    if let Err(error) = relay.send_alarm(session).await {
                        tracing::error!(error = ?error, "alarm dispatch failed");
                    }
                });
            }

            Some(event) = chat_rx.recv() => {
                let relay = relay.clone();
                tokio::spawn(async move {
                    relay.handle_event(event).await;
                });
            }
        }
    }

    cancel.cancel();
    processes.kill_current().await;
    server.abort();
    if tokio::time::timeout(Duration::from_secs(2), poller).await.is_err() {
        tracing::warn!("Telegram poller did not stop in time");
    }
    tracing::info!("session relay stopped");
    Ok(())
}

async fn run_notify(cmd: NotifyCommand) -> Result<()> {
    let mut payload = String::new();
    tokio::io::stdin()
        .read_to_string(&mut payload)
        .await
        .context("failed to read hook payload from stdin")?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(cmd.timeout_secs))
        .build()?;
    let url = format!("http://127.0.0.1:{}/hook", cmd.port);
    let response = client
        .post(&url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(payload)
        .send()
        .await
        .with_context(|| format!("failed to reach relay at {url}"))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("relay rejected hook ({status}): {body}");
    }
    Ok(())
}
