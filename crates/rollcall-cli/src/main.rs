use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    fn mark_attendance(&self, image_path: &str) -> zbus::Result<String>;
    fn register(
        &self,
        name: &str,
        roll: &str,
        front: &str,
        left: &str,
        right: &str,
    ) -> zbus::Result<String>;
    fn replace(
        &self,
        name: &str,
        roll: &str,
        front: &str,
        left: &str,
        right: &str,
    ) -> zbus::Result<String>;
    fn get_records(&self, date: &str) -> zbus::Result<String>;
    fn list_dates(&self) -> zbus::Result<String>;
    fn list_identities(&self) -> zbus::Result<String>;
    fn remove_identity(&self, id: &str) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face attendance CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a person from three pose photos
    Register {
        /// Display name
        #[arg(short, long)]
        name: String,
        /// Roll number (non-alphanumeric characters are dropped)
        #[arg(short, long)]
        roll: String,
        /// Photo facing the camera
        #[arg(long)]
        front: PathBuf,
        /// Photo turned to the left
        #[arg(long)]
        left: PathBuf,
        /// Photo turned to the right
        #[arg(long)]
        right: PathBuf,
        /// Re-enroll an existing person, replacing all three photos
        #[arg(long)]
        replace: bool,
    },
    /// Mark attendance from a group photo
    Mark {
        /// Image file
        image: PathBuf,
    },
    /// Show attendance records for a day
    Records {
        /// Date as YYYY-MM-DD (default: today)
        #[arg(short, long, conflicts_with = "list")]
        date: Option<String>,
        /// List the dates that have records instead
        #[arg(long)]
        list: bool,
    },
    /// List registered people
    List,
    /// Remove a registered person
    Remove {
        /// Identity id (sanitized roll number)
        id: String,
    },
    /// Show daemon status
    Status,
}

fn encode_photo(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(STANDARD.encode(bytes))
}

/// Pretty-print a JSON reply; returns false when it reports `"success": false`.
fn print_reply(raw: &str) -> Result<bool> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(value.get("success").and_then(|s| s.as_bool()).unwrap_or(true))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let connection = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = AttendanceProxy::new(&connection)
        .await
        .context("rollcalld is not reachable")?;

    let ok = match cli.command {
        Commands::Register { name, roll, front, left, right, replace } => {
            let front = encode_photo(&front)?;
            let left = encode_photo(&left)?;
            let right = encode_photo(&right)?;
            let reply = if replace {
                proxy.replace(&name, &roll, &front, &left, &right).await?
            } else {
                proxy.register(&name, &roll, &front, &left, &right).await?
            };
            print_reply(&reply)?
        }
        Commands::Mark { image } => {
            let image = std::fs::canonicalize(&image)
                .with_context(|| format!("image not found: {}", image.display()))?;
            tracing::debug!(image = %image.display(), "submitting image");
            print_reply(&proxy.mark_attendance(&image.to_string_lossy()).await?)?
        }
        Commands::Records { list: true, .. } => print_reply(&proxy.list_dates().await?)?,
        Commands::Records { date, .. } => {
            print_reply(&proxy.get_records(date.as_deref().unwrap_or("")).await?)?
        }
        Commands::List => print_reply(&proxy.list_identities().await?)?,
        Commands::Remove { id } => print_reply(&proxy.remove_identity(&id).await?)?,
        Commands::Status => print_reply(&proxy.status().await?)?,
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
