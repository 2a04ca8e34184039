use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use libre2_rs::pairing;
use libre2_rs::transport::bluez::BluezTransport;
use libre2_rs::{JsonStore, ManagerConfig, SensorEvent, SensorManager, SensorStore};

#[derive(Parser)]
#[command(name = "libre2-monitor", about = "Stream glucose from a paired Libre2 sensor")]
struct Cli {
    /// Path of the persisted sensor store.
    #[arg(long, default_value = "libre2-store.json")]
    store: PathBuf,

    #[command(flatten)]
    verbosity: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Feed the outputs of an NFC pairing session into the store.
    Pair {
        /// Sensor UID, 6 hex bytes.
        #[arg(long)]
        uid: String,
        /// Patch info, at least 6 hex bytes.
        #[arg(long)]
        patch_info: String,
        /// File holding the 344-byte encrypted FRAM dump.
        #[arg(long)]
        fram: PathBuf,
    },
    /// Scan for the paired sensor and print measurements as they arrive.
    Run,
    /// Clear the pairing and the unlock counter.
    Reset,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(cli.verbosity.tracing_level_filter().into())
                .from_env_lossy(),
        )
        .init();

    let store = Arc::new(JsonStore::open(&cli.store)?);

    match cli.command {
        Commands::Pair { uid, patch_info, fram } => {
            let uid: [u8; 6] = hex::decode(uid)?
                .try_into()
                .map_err(|_| "uid must be exactly 6 hex bytes")?;
            let patch_info = hex::decode(patch_info)?;
            let fram = std::fs::read(fram)?;

            pairing::apply_identity(store.as_ref(), uid, patch_info)?;
            let state = pairing::apply_fram(store.as_ref(), &fram)?;
            println!("Paired; sensor lifecycle state: {state}");
        }
        Commands::Run => {
            if !store.paired() {
                return Err("not paired; run `libre2-monitor pair` first".into());
            }

            let transport = BluezTransport::new().await?;
            let (manager, mut events) =
                SensorManager::start(transport, store, ManagerConfig::default());

            while let Some(event) = events.recv().await {
                match event {
                    SensorEvent::Connection(state) => println!("[state] {state}"),
                    SensorEvent::Data(data) => {
                        println!("wear time: {} min", data.wear_time_minutes);
                        for m in &data.trend {
                            println!("  trend   {m}");
                        }
                        for m in &data.history {
                            println!("  history {m}");
                        }
                    }
                }
            }
            manager.shutdown();
        }
        Commands::Reset => {
            store.clear();
            println!("Pairing cleared");
        }
    }

    Ok(())
}
