//! `devicekit` drives a device's connection to the Cacophony API from the
//! shell: provisioning, registration, renames, uploads and downloads.
//!
//! Set `DEVICEKIT_ROOT` (or `--root`) to keep every device file under a
//! directory other than `/`. Log output is controlled with `RUST_LOG`.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use devicekit_core::{Device, DeviceIdentity, DevicePaths, OsFileSystem, RecordingType};
use eyre::WrapErr;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory the device files live under.
    #[arg(long, global = true, env = "DEVICEKIT_ROOT")]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the device identity config
    Provision {
        /// Base URL of the API server
        #[arg(long)]
        server_url: String,
        /// Group the device belongs to
        #[arg(long)]
        group: String,
        /// Device name, unique within the server
        #[arg(long)]
        name: String,
    },
    /// Register or authenticate, storing the credential on first use
    Connect,
    /// Print the identity config and whether a credential is stored
    Show,
    /// Rename and regroup the device, updating the host name files
    Rename {
        /// New device name
        #[arg(long)]
        name: String,
        /// New group
        #[arg(long)]
        group: String,
    },
    /// Upload a recording
    Upload {
        /// Recording file to send
        file: PathBuf,
        /// Recording type sent in the upload metadata
        #[arg(long, default_value_t = RecordingType::ThermalRaw)]
        kind: RecordingType,
    },
    /// Report an event
    Event {
        /// Event description as a JSON object
        #[arg(long)]
        details: String,
        /// Occurrence times (RFC 3339); defaults to now
        #[arg(long = "time")]
        times: Vec<DateTime<Utc>>,
    },
    /// Print the device's recording schedule
    Schedule,
    /// Download a stored file
    Download {
        /// Server-side file id
        file_id: u64,
        /// Destination path; must not exist
        dest: PathBuf,
    },
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let paths = cli
        .root
        .as_ref()
        .map_or_else(DevicePaths::default, DevicePaths::rooted);
    tracing::debug!(
        device_config = %paths.device_config().display(),
        lock_file = %paths.lock_file().display(),
        "using device paths"
    );
    let device = Device::new(paths, Arc::new(OsFileSystem));
    run(&device, cli.command).await
}

async fn run(device: &Device, command: Commands) -> eyre::Result<()> {
    match command {
        Commands::Provision {
            server_url,
            group,
            name,
        } => {
            let identity = DeviceIdentity::new(server_url, group, name);
            device
                .provision(&identity)
                .wrap_err("failed to write device config")?;
            println!("provisioned {}", identity.device_name);
        }
        Commands::Connect => {
            let api = device.connect().await.wrap_err("failed to connect")?;
            tracing::info!(
                device_id = api.device_id(),
                registered = api.just_registered(),
                "connected"
            );
            if api.just_registered() {
                println!("registered as device {}", api.device_id());
            } else {
                println!("authenticated");
            }
        }
        Commands::Show => show(device)?,
        Commands::Rename { name, group } => {
            let identity = device
                .rename(&name, &group)
                .await
                .wrap_err("rename failed")?;
            println!("renamed to {} in {}", identity.device_name, identity.group);
        }
        Commands::Upload { file, kind } => {
            let reader = tokio::fs::File::open(&file)
                .await
                .wrap_err_with(|| format!("failed to open {}", file.display()))?;
            let api = device.connect().await.wrap_err("failed to connect")?;
            api.upload_recording_as(kind, reader)
                .await
                .wrap_err("upload failed")?;
            println!("uploaded {}", file.display());
        }
        Commands::Event { details, times } => {
            let times = if times.is_empty() {
                vec![Utc::now()]
            } else {
                times
            };
            let api = device.connect().await.wrap_err("failed to connect")?;
            api.report_event(details.as_bytes(), &times)
                .await
                .wrap_err("event report failed")?;
            println!("reported {} event(s)", times.len());
        }
        Commands::Schedule => {
            let api = device.connect().await.wrap_err("failed to connect")?;
            let schedule = api.get_schedule().await.wrap_err("schedule fetch failed")?;
            println!("{}", String::from_utf8_lossy(&schedule));
        }
        Commands::Download { file_id, dest } => {
            let api = device.connect().await.wrap_err("failed to connect")?;
            let file = api
                .get_file_details(file_id)
                .await
                .wrap_err("file lookup failed")?;
            api.download_file(&file, &dest)
                .await
                .wrap_err("download failed")?;
            println!(
                "downloaded {} to {}",
                file.file.details.original_name,
                dest.display()
            );
        }
    }
    Ok(())
}

fn show(device: &Device) -> eyre::Result<()> {
    let identity = device.identity().wrap_err("failed to read device config")?;
    print!("{}", serde_yaml::to_string(&identity)?);
    match device
        .private_credential()
        .wrap_err("failed to read credential")?
    {
        Some(credential) if credential.is_valid() => {
            println!("device-id: {}", credential.device_id);
            println!("credential: stored");
        }
        Some(_) => println!("credential: incomplete"),
        None => println!("credential: none"),
    }
    Ok(())
}
