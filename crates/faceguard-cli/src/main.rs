use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "faceguard", about = "FaceGuard attendance kiosk CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session_bus: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a person from a reference photo
    Register {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        department: String,
        /// JPEG, PNG or WebP file with the person's face, or a text file
        /// holding a `data:image/...;base64,` URL
        #[arg(short, long)]
        photo: PathBuf,
    },
    /// Register a person using the kiosk camera
    Enroll {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        department: String,
    },
    /// Scan the person in front of the camera and record attendance
    Scan,
    /// Show daemon status
    Status,
    /// List registered identities
    List,
    /// Show attendance records, newest first
    Records {
        /// Maximum number of records (0 = all)
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
    /// Delete all attendance records
    Clear {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
    /// Show today's dashboard figures
    Stats,
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        /// Write the captured still to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long, default_value = "/dev/video0")]
        device: String,
    },
}

#[zbus::proxy(
    interface = "org.freedesktop.FaceGuard1",
    default_service = "org.freedesktop.FaceGuard1",
    default_path = "/org/freedesktop/FaceGuard1"
)]
trait FaceGuard {
    async fn register(&self, name: &str, department: &str, photo: &[u8]) -> zbus::Result<String>;
    async fn register_data_url(
        &self,
        name: &str,
        department: &str,
        photo: &str,
    ) -> zbus::Result<String>;
    async fn enroll(&self, name: &str, department: &str) -> zbus::Result<String>;
    async fn scan(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn list_records(&self, limit: u32) -> zbus::Result<String>;
    async fn clear_attendance(&self) -> zbus::Result<u32>;
    async fn stats(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let session_bus =
        cli.session_bus || std::env::var("FACEGUARD_SESSION_BUS").is_ok_and(|v| v != "0");

    match cli.command {
        Commands::Test { output, device } => camera_test(&device, output.as_deref()),
        Commands::Clear { yes: false } => bail!("refusing to clear attendance without --yes"),
        command => run_command(command, session_bus).await,
    }
}

async fn run_command(command: Commands, session_bus: bool) -> Result<()> {
    let conn = if session_bus {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("connecting to D-Bus")?;
    let proxy = FaceGuardProxy::new(&conn)
        .await
        .context("faceguardd is not reachable")?;

    match command {
        Commands::Register {
            name,
            department,
            photo,
        } => {
            let bytes = std::fs::read(&photo)
                .with_context(|| format!("reading {}", photo.display()))?;
            let reply = match Photo::from_file_contents(bytes) {
                Photo::Encoded(bytes) => proxy.register(&name, &department, &bytes).await?,
                Photo::DataUrl(url) => proxy.register_data_url(&name, &department, &url).await?,
            };
            print_json(&reply)?;
        }
        Commands::Enroll { name, department } => {
            println!("Look at the camera...");
            let reply = proxy.enroll(&name, &department).await?;
            print_json(&reply)?;
        }
        Commands::Scan => {
            let reply = proxy.scan().await?;
            let value: serde_json::Value = serde_json::from_str(&reply)?;
            if let Some(message) = value["message"].as_str() {
                println!("{message}");
            }
            if let Some(details) = value["details"].as_str() {
                println!("  {details}");
            }
        }
        Commands::Status => print_json(&proxy.status().await?)?,
        Commands::List => print_json(&proxy.list_identities().await?)?,
        Commands::Records { limit } => print_json(&proxy.list_records(limit).await?)?,
        Commands::Clear { .. } => {
            let removed = proxy.clear_attendance().await?;
            println!("Removed {removed} attendance record(s)");
        }
        Commands::Stats => print_json(&proxy.stats().await?)?,
        Commands::Test { .. } => bail!("camera diagnostics run without the daemon"),
    }

    Ok(())
}

/// Reference photo as read from disk.
#[derive(Debug, PartialEq)]
enum Photo {
    Encoded(Vec<u8>),
    DataUrl(String),
}

impl Photo {
    fn from_file_contents(bytes: Vec<u8>) -> Self {
        match std::str::from_utf8(&bytes) {
            Ok(text) if text.trim_start().starts_with("data:") => {
                Photo::DataUrl(text.trim().to_string())
            }
            _ => Photo::Encoded(bytes),
        }
    }
}

fn print_json(reply: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(reply)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn camera_test(device: &str, output: Option<&std::path::Path>) -> Result<()> {
    println!("Running camera diagnostics...");

    let devices = faceguard_hw::Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for d in &devices {
        println!("  {}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }

    let camera = faceguard_hw::Camera::open(device)?;
    let format = camera.format();
    println!(
        "Opened {} at {}x{} ({:?})",
        camera.path(),
        format.width,
        format.height,
        format.pixel
    );
    camera.warm_up(4)?;
    let jpeg = camera.capture_still(5, 85)?;
    println!("Captured still: {} bytes", jpeg.len());

    if let Some(path) = output {
        std::fs::write(path, &jpeg).with_context(|| format!("writing {}", path.display()))?;
        println!("Saved to {}", path.display());
    }
    Ok(())
}
