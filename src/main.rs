use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use ruma::{OwnedEventId, OwnedRoomId};
use tokio_util::sync::CancellationToken;
use tracing::info;

use roomserv::{
    authz::PermissiveAuthorizer,
    config::load_or_default,
    federation::{FederationSender, LoggingFederationClient},
    notifier::Notifier,
    rooms::RoomsDb,
    store::Store,
};

#[derive(Parser)]
#[command(author, version, about = "roomserv homeserver rooms core")]
struct Cli {
    /// Path to the configuration file. Defaults to ./.roomserv/config.toml
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the rooms core with its background workers
    Start,
    /// Print a stored event as JSON
    Event {
        #[arg(long)]
        event_id: String,
    },
    /// Print a room's current state event ids
    RoomState {
        #[arg(long)]
        room_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    roomserv::logging::init();

    let cli = Cli::parse();
    let (config, config_path) = load_or_default(cli.config)?;
    info!(config = %config_path.display(), server_name = %config.server_name, "Loaded configuration");

    let store = Store::open(config.rooms_db_path(), &config.database)?;
    let notifier = Notifier::new("rooms", None);
    let rooms = RoomsDb::new(&config, store, notifier.clone(), Arc::new(PermissiveAuthorizer));

    match cli.command {
        Commands::Start => {
            let sender = FederationSender::new(
                config.clone(),
                rooms.clone(),
                notifier.clone(),
                LoggingFederationClient,
            );
            sender.start().await?;

            info!("roomserv started; press ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            info!("Shutting down...");

            sender.stop().await;
            notifier.stop();
        }
        Commands::Event { event_id } => {
            let ctx = CancellationToken::new();
            let event_id =
                OwnedEventId::try_from(event_id.as_str()).map_err(|err| anyhow!("{err}"))?;
            let event = rooms
                .get_event(&ctx, &event_id)
                .await?
                .context("event not found")?;
            println!("{}", serde_json::to_string_pretty(&event.to_sync_json()?)?);
        }
        Commands::RoomState { room_id } => {
            let ctx = CancellationToken::new();
            let room_id =
                OwnedRoomId::try_from(room_id.as_str()).map_err(|err| anyhow!("{err}"))?;
            let events = rooms.get_current_room_state_events(&ctx, &room_id).await?;
            for ev in events {
                println!(
                    "{} {} {}",
                    ev.id,
                    ev.kind,
                    ev.state_key.as_deref().unwrap_or("")
                );
            }
        }
    }

    Ok(())
}
