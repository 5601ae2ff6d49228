//! `rundown`: command-line client for Rundown service timers.
//!
//! ```bash
//! # List services
//! rundown --server-url ws://127.0.0.1:9100/ws --token tok-mike list
//!
//! # Follow the live timer of a service
//! RUNDOWN_URL=ws://127.0.0.1:9100/ws RUNDOWN_TOKEN=tok-rachel rundown watch <service-id>
//!
//! # Drive the timer
//! rundown timer <service-id> start <item-id>
//! rundown timer <service-id> pause
//! ```

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;

use rundown::clock::format_clock;
use rundown::config::{CliArgs, ClientConfig, Command, TimerAction};
use rundown::session::{ServiceSession, SessionUpdate};
use rundown::sync::SyncClient;
use rundown_proto::agenda::{NewItem, Service, minutes_to_seconds};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("rundown starting");

    let Some(command) = cli.command else {
        eprintln!("nothing to do; see `rundown --help`");
        return ExitCode::FAILURE;
    };

    match run(&config, command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(err = %e, "command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize file-based logging so stdout stays free for output.
///
/// Returns a guard that must be held for the lifetime of the program
/// to ensure logs are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("rundown.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

async fn run(config: &ClientConfig, command: Command) -> Result<(), Box<dyn std::error::Error>> {
    if let Command::Watch { service } = command {
        return watch(config, service).await;
    }

    let (url, token) = config.credentials()?;
    let (client, _events) = SyncClient::connect(url, token, &config.client_options()).await?;

    match command {
        Command::List => {
            for service in client.list_services().await? {
                println!(
                    "{}  {}  {}  ({} items, {})",
                    service.id,
                    service.date,
                    service.title,
                    service.items.len(),
                    format_clock(service.total_duration_secs()),
                );
            }
        }
        Command::Create { title, date } => {
            let service = client.create_service(title, date).await?;
            println!("{}", service.id);
        }
        Command::Delete { service } => {
            client.delete_service(service).await?;
        }
        Command::Show { service } => {
            print_agenda(&client.subscribe(service).await?);
        }
        Command::AddItem {
            service,
            title,
            minutes,
        } => {
            let secs = minutes_to_seconds(minutes)?;
            client.subscribe(service).await?;
            print_agenda(&client.add_item(NewItem::new(title, secs)).await?);
        }
        Command::RemoveItem { service, item } => {
            client.subscribe(service).await?;
            print_agenda(&client.delete_item(item).await?);
        }
        Command::Timer { service, action } => {
            client.subscribe(service).await?;
            let state = match action {
                TimerAction::Start { item } => client.start(item).await?,
                TimerAction::Pause => client.pause().await?,
                TimerAction::Resume => client.resume().await?,
                TimerAction::Reset => client.reset().await?,
                TimerAction::Skip { item } => client.skip_to_item(item).await?,
            };
            println!("{} (version {})", state.phase(), state.version);
        }
        Command::Watch { .. } => {}
    }

    client.close().await;
    Ok(())
}

async fn watch(
    config: &ClientConfig,
    service_id: rundown_proto::agenda::ServiceId,
) -> Result<(), Box<dyn std::error::Error>> {
    let options = config.session_options()?;
    let (_session, mut updates) = ServiceSession::spawn(options, service_id);

    while let Some(update) = updates.recv().await {
        match update {
            SessionUpdate::Frame(frame) => println!("{}", frame.render_line()),
            SessionUpdate::Connected => println!("-- connected"),
            SessionUpdate::Disconnected => println!("-- connection lost, reconnecting"),
            SessionUpdate::ServiceRemoved => {
                println!("-- service was deleted");
                break;
            }
            SessionUpdate::GaveUp(reason) => return Err(reason.into()),
        }
    }
    Ok(())
}

fn print_agenda(service: &Service) {
    println!("{}  {}", service.title, service.date);
    for (index, item) in service.items.iter().enumerate() {
        println!(
            "{:>3}. {}  {}  {}",
            index + 1,
            format_clock(u64::from(item.duration_secs)),
            item.title,
            item.id,
        );
    }
    println!(
        "     total {}",
        format_clock(service.total_duration_secs())
    );
}
