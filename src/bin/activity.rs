//! activity CLI: run the service or operate on the event log directly.

use activity_rs::api::{self, AppState};
use activity_rs::config::Config;
use activity_rs::config::secrets::redact_url;
use activity_rs::consumer::{ActivityProcessor, Consumer, ConsumerConfig};
use activity_rs::event::Envelope;
use activity_rs::log::{self, EventLog};
use activity_rs::store::{Appender, Reader, StreamNaming};
use activity_rs::telemetry::init_telemetry;
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "activity", about = "Event-sourced project activity log")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP service and the subscription consumer
    Serve,
    /// Project stream operations
    Events {
        #[command(subcommand)]
        action: EventsAction,
    },
    /// Parked events of the configured subscription group
    Parked {
        #[command(subcommand)]
        action: ParkedAction,
    },
}

#[derive(Subcommand)]
enum EventsAction {
    /// Append one event given as a JSON envelope
    Append {
        /// Envelope JSON: {"type", "time", "projectId", "event"}
        json: String,
    },
    /// List a project's events
    List {
        project_id: String,
        /// Revision to start from
        #[arg(long, default_value_t = 0)]
        from: u64,
        /// Maximum events to show
        #[arg(long, default_value_t = 100)]
        limit: u64,
    },
    /// List events across all projects
    All {
        #[arg(long, default_value_t = 100)]
        limit: u64,
    },
}

#[derive(Subcommand)]
enum ParkedAction {
    /// Show parked events
    List,
    /// Queue every parked event for redelivery
    Replay,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;
    let _guard = init_telemetry(config.telemetry("activity"))?;

    match cli.command {
        Command::Serve => cmd_serve(config).await,
        Command::Events { action } => {
            let event_log = log::connect(config.event_log_url.expose_secret()).await?;
            let naming = StreamNaming::new(config.stream_prefix.clone());
            let result = match action {
                EventsAction::Append { json } => cmd_events_append(&event_log, naming, &json).await,
                EventsAction::List {
                    project_id,
                    from,
                    limit,
                } => cmd_events_list(&event_log, naming, &project_id, from, limit).await,
                EventsAction::All { limit } => cmd_events_all(&event_log, naming, limit).await,
            };
            event_log.close().await;
            result
        }
        Command::Parked { action } => {
            let event_log = log::connect(config.event_log_url.expose_secret()).await?;
            let group = config.subscription_group.as_str();
            let result = match action {
                ParkedAction::List => cmd_parked_list(event_log.as_ref(), group).await,
                ParkedAction::Replay => cmd_parked_replay(event_log.as_ref(), group).await,
            };
            event_log.close().await;
            result
        }
    }
}

async fn cmd_serve(config: Config) -> anyhow::Result<()> {
    info!(url = %redact_url(&config.event_log_url), "connecting to event log");
    let event_log = log::connect(config.event_log_url.expose_secret()).await?;
    log::ensure_subscription(event_log.as_ref(), &config.subscription_group).await?;

    let consumer = Consumer::start(
        Arc::clone(&event_log),
        ConsumerConfig::new(config.subscription_group.clone()),
    )
    .await?;

    let shutdown = CancellationToken::new();
    let consumer_task = tokio::spawn({
        let cancel = shutdown.child_token();
        async move {
            let processor = ActivityProcessor;
            consumer.run(&processor, cancel).await;
        }
    });

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            info!("received terminate signal, shutting down gracefully");
            shutdown.cancel();
        }
    });

    let state = AppState::new(
        Arc::clone(&event_log),
        StreamNaming::new(config.stream_prefix.clone()),
    );
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    let served = api::serve(listener, api::router(state), shutdown.clone()).await;

    // Stop the consumer whether the server exited cleanly or not.
    shutdown.cancel();
    consumer_task.await?;
    event_log.close().await;
    served?;

    info!("server gracefully stopped");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(_) => {
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

async fn cmd_events_append(
    log: &Arc<dyn EventLog>,
    naming: StreamNaming,
    json: &str,
) -> anyhow::Result<()> {
    let envelope: Envelope = serde_json::from_str(json)?;
    let kind = envelope.validate()?;
    let landed = Appender::new(Arc::clone(log), naming)
        .append(&envelope)
        .await?;
    println!(
        "{} (position {}, revision {})",
        kind.confirmation(),
        landed.position,
        landed.revision
    );
    Ok(())
}

async fn cmd_events_list(
    log: &Arc<dyn EventLog>,
    naming: StreamNaming,
    project_id: &str,
    from: u64,
    limit: u64,
) -> anyhow::Result<()> {
    let page = Reader::new(Arc::clone(log), naming)
        .read_page(project_id, from, limit)
        .await?;

    if page.events.is_empty() {
        println!("No events found.");
        return Ok(());
    }
    print_events(&page.events);
    if let Some(next) = page.next_from {
        println!("(more events follow; continue with --from {next})");
    }
    Ok(())
}

async fn cmd_events_all(
    log: &Arc<dyn EventLog>,
    naming: StreamNaming,
    limit: u64,
) -> anyhow::Result<()> {
    let events = Reader::new(Arc::clone(log), naming).read_all(limit).await?;
    if events.is_empty() {
        println!("No events found.");
        return Ok(());
    }
    print_events(&events);
    Ok(())
}

fn print_events(events: &[Envelope]) {
    println!("{:<20}  {:<18}  {:<16}  EVENT", "TIME", "TYPE", "PROJECT");
    println!("{}", "-".repeat(100));
    for envelope in events {
        let body = serde_json::to_string(&envelope.payload).unwrap_or_else(|_| "-".to_string());
        println!(
            "{:<20}  {:<18}  {:<16}  {}",
            envelope.time.format("%Y-%m-%d %H:%M:%S"),
            envelope.type_tag(),
            envelope.project_id,
            body
        );
    }
    println!("\n{} event(s)", events.len());
}

async fn cmd_parked_list(log: &dyn EventLog, group: &str) -> anyhow::Result<()> {
    let parked = log.parked_events(group).await?;
    if parked.is_empty() {
        println!("No parked events for {group}.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<24}  {:<18}  {:<9}  REASON",
        "POS", "STREAM", "TYPE", "STATE"
    );
    println!("{}", "-".repeat(100));
    for p in &parked {
        println!(
            "{:<8}  {:<24}  {:<18}  {:<9}  {}",
            p.record.position,
            p.record.stream,
            p.record.event_type,
            if p.replaying { "replaying" } else { "parked" },
            p.reason
        );
    }
    println!("\n{} parked event(s)", parked.len());
    Ok(())
}

async fn cmd_parked_replay(log: &dyn EventLog, group: &str) -> anyhow::Result<()> {
    let queued = log.replay_parked(group).await?;
    println!("Queued {queued} parked event(s) for redelivery to {group}.");
    Ok(())
}
