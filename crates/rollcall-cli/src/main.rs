use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face-recognition attendance CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a new identity from several photos
    Register {
        roll: String,
        #[arg(short, long)]
        name: String,
        #[arg(long, default_value = "")]
        father_name: String,
        #[arg(long, default_value = "")]
        phone: String,
        /// Probe images (JPEG, PNG, ...)
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Check in as ROLL and mark attendance
    Login { roll: String, image: PathBuf },
    /// Verify ROLL with the compact model (no attendance)
    CompactLogin { roll: String, image: PathBuf },
    /// Recognize every face in a photo and mark attendance
    Recognize { image: PathBuf },
    /// Recognize every face in a photo without marking attendance
    Identify { image: PathBuf },
    /// List enrolled identities
    Users,
    /// Set the role of an identity
    Role {
        roll: String,
        /// user or admin
        role: String,
    },
    /// Delete an identity and its attendance
    Remove { roll: String },
    /// Show stored details by name or roll number
    Show {
        key: String,
        /// Write the stored thumbnail (base64 in the response) to this file
        #[arg(long)]
        thumbnail: Option<PathBuf>,
    },
    /// Show attendance for one identity, or for everyone
    Attendance { roll: Option<String> },
    /// Rewrite malformed stored roles
    RepairRoles {
        #[arg(long)]
        dry_run: bool,
    },
    /// Show daemon status
    Status,
}

#[zbus::proxy(
    interface = "org.rollcall.Rollcall1",
    default_service = "org.rollcall.Rollcall1",
    default_path = "/org/rollcall/Rollcall1"
)]
trait Rollcall {
    async fn register(
        &self,
        roll: &str,
        name: &str,
        father_name: &str,
        phone: &str,
        images: Vec<Vec<u8>>,
    ) -> zbus::Result<String>;
    async fn login(&self, roll: &str, image: Vec<u8>) -> zbus::Result<String>;
    async fn compact_login(&self, roll: &str, image: Vec<u8>) -> zbus::Result<String>;
    async fn recognize(&self, image: Vec<u8>) -> zbus::Result<String>;
    async fn identify(&self, image: Vec<u8>) -> zbus::Result<String>;
    async fn list_users(&self) -> zbus::Result<String>;
    async fn update_role(&self, roll: &str, role: &str) -> zbus::Result<String>;
    async fn delete_user(&self, roll: &str) -> zbus::Result<String>;
    async fn user_details(&self, key: &str) -> zbus::Result<String>;
    async fn user_attendance(&self, roll: &str) -> zbus::Result<String>;
    async fn attendance(&self) -> zbus::Result<String>;
    async fn repair_roles(&self, dry_run: bool) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

/// Pretty-print a JSON response; anything else is printed verbatim.
fn print_response(raw: &str) {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(pretty) => println!("{pretty}"),
            Err(_) => println!("{raw}"),
        },
        Err(_) => println!("{raw}"),
    }
}

/// Daemon-side errors arrive as `org.rollcall.Error.*` with a message.
fn describe(err: zbus::Error) -> anyhow::Error {
    match err {
        zbus::Error::MethodError(name, Some(msg), _) => {
            let kind = name.as_str().rsplit('.').next().unwrap_or_default().to_string();
            anyhow::anyhow!("{kind}: {msg}")
        }
        other => anyhow::Error::new(other).context("calling rollcalld"),
    }
}

fn write_thumbnail(response: &str, path: &Path) -> Result<()> {
    use base64::Engine as _;

    let value: serde_json::Value = serde_json::from_str(response)?;
    let encoded = value["details"]["thumbnail"]
        .as_str()
        .context("identity has no stored thumbnail")?;
    let jpeg = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .context("decoding thumbnail")?;
    std::fs::write(path, jpeg).with_context(|| format!("writing {}", path.display()))?;
    println!("thumbnail written to {}", path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("connecting to D-Bus")?;
    let proxy = RollcallProxy::new(&conn).await?;
    tracing::debug!(session = cli.session, "connected to rollcalld");

    let response = match cli.command {
        Commands::Register {
            roll,
            name,
            father_name,
            phone,
            images,
        } => {
            let images = images
                .iter()
                .map(|p| read_image(p))
                .collect::<Result<Vec<_>>>()?;
            proxy.register(&roll, &name, &father_name, &phone, images).await
        }
        Commands::Login { roll, image } => proxy.login(&roll, read_image(&image)?).await,
        Commands::CompactLogin { roll, image } => {
            proxy.compact_login(&roll, read_image(&image)?).await
        }
        Commands::Recognize { image } => proxy.recognize(read_image(&image)?).await,
        Commands::Identify { image } => proxy.identify(read_image(&image)?).await,
        Commands::Users => proxy.list_users().await,
        Commands::Role { roll, role } => proxy.update_role(&roll, &role).await,
        Commands::Remove { roll } => proxy.delete_user(&roll).await,
        Commands::Show { key, thumbnail } => {
            let response = proxy.user_details(&key).await.map_err(describe)?;
            if let Some(path) = thumbnail {
                write_thumbnail(&response, &path)?;
            }
            Ok(response)
        }
        Commands::Attendance { roll: Some(roll) } => proxy.user_attendance(&roll).await,
        Commands::Attendance { roll: None } => proxy.attendance().await,
        Commands::RepairRoles { dry_run } => proxy.repair_roles(dry_run).await,
        Commands::Status => proxy.status().await,
    }
    .map_err(describe)?;

    print_response(&response);
    Ok(())
}
