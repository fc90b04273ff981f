use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facegate_models::{ModelConfig, ModelSet};
use image::ImageFormat;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

#[zbus::proxy(
    interface = "org.facegate.Gate1",
    default_service = "org.facegate.Gate1",
    default_path = "/org/facegate/Gate1"
)]
trait Gate {
    async fn enroll(&self, identity: &str, content_type: &str, image: &[u8]) -> zbus::Result<String>;
    async fn identify(&self, content_type: &str, image: &[u8]) -> zbus::Result<String>;
    async fn has_face(&self, content_type: &str, image: &[u8]) -> zbus::Result<bool>;
    async fn update(&self, id: i64, patch: &str, content_type: &str, image: &[u8]) -> zbus::Result<String>;
    async fn remove(&self, id: i64) -> zbus::Result<String>;
    async fn get_identity(&self, id: i64) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facegate", about = "facegate face recognition CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Daemon(DaemonCommand),
    /// Check (or fetch) model weights without the daemon
    Models {
        #[arg(long)]
        model_dir: Option<PathBuf>,
        #[arg(long)]
        bundled_dir: Option<PathBuf>,
        #[arg(long)]
        weights_url: Option<String>,
        /// Copy or download missing models
        #[arg(long)]
        fetch: bool,
    },
}

/// Requests served by the running daemon.
#[derive(Subcommand)]
enum DaemonCommand {
    /// Enroll a new identity from a face photo
    Enroll {
        #[arg(long)]
        given: String,
        #[arg(long)]
        family: String,
        #[arg(long)]
        email: Option<String>,
        /// JPEG or PNG photo
        image: PathBuf,
    },
    /// Identify the face in a photo
    Identify { image: PathBuf },
    /// Check whether a photo contains a face
    Check { image: PathBuf },
    /// Update an identity's attributes and/or face
    Update {
        id: i64,
        #[arg(long)]
        given: Option<String>,
        #[arg(long)]
        family: Option<String>,
        #[arg(long)]
        email: Option<String>,
        /// Replace the enrolled face with this photo
        #[arg(long)]
        image: Option<PathBuf>,
    },
    /// Remove an identity
    Remove { id: i64 },
    /// Show one identity
    Show { id: i64 },
    /// List enrolled identities
    List,
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Models {
            model_dir,
            bundled_dir,
            weights_url,
            fetch,
        } => models(model_dir, bundled_dir, weights_url, fetch).await,
        Commands::Daemon(command) => {
            let proxy = connect(cli.session).await?;
            run(&proxy, command).await
        }
    }
}

async fn run(proxy: &GateProxy<'_>, command: DaemonCommand) -> Result<ExitCode> {
    match command {
        DaemonCommand::Enroll {
            given,
            family,
            email,
            image,
        } => {
            let (content_type, bytes) = read_image(&image)?;
            let identity = json!({ "given_name": given, "family_name": family, "email": email });
            let enrolled = proxy
                .enroll(&identity.to_string(), content_type, &bytes)
                .await
                .map_err(describe)?;
            print_json(&enrolled)?;
        }
        DaemonCommand::Identify { image } => {
            let (content_type, bytes) = read_image(&image)?;
            let result = proxy.identify(content_type, &bytes).await.map_err(describe)?;
            let (line, recognized) = summarize_recognition(&result)?;
            println!("{line}");
            if !recognized {
                return Ok(ExitCode::FAILURE);
            }
        }
        DaemonCommand::Check { image } => {
            let (content_type, bytes) = read_image(&image)?;
            let found = proxy.has_face(content_type, &bytes).await.map_err(describe)?;
            println!("{}", if found { "face detected" } else { "no face detected" });
            if !found {
                return Ok(ExitCode::FAILURE);
            }
        }
        DaemonCommand::Update {
            id,
            given,
            family,
            email,
            image,
        } => {
            let patch = update_patch(given, family, email);
            let (content_type, bytes) = match &image {
                Some(path) => read_image(path)?,
                None => ("", Vec::new()),
            };
            if patch.as_object().is_some_and(|o| o.is_empty()) && bytes.is_empty() {
                bail!("nothing to update: pass --given, --family, --email or --image");
            }
            let updated = proxy
                .update(id, &patch.to_string(), content_type, &bytes)
                .await
                .map_err(describe)?;
            print_json(&updated)?;
        }
        DaemonCommand::Remove { id } => {
            let removed = proxy.remove(id).await.map_err(describe)?;
            print_json(&removed)?;
        }
        DaemonCommand::Show { id } => {
            print_json(&proxy.get_identity(id).await.map_err(describe)?)?;
        }
        DaemonCommand::List => {
            let list = proxy.list_identities().await.map_err(describe)?;
            let identities: Vec<Value> = serde_json::from_str(&list)?;
            if identities.is_empty() {
                println!("No identities enrolled");
            }
            for identity in &identities {
                println!(
                    "{:>6}  {} {}  {}",
                    identity["id"].as_i64().unwrap_or_default(),
                    identity["given_name"].as_str().unwrap_or_default(),
                    identity["family_name"].as_str().unwrap_or_default(),
                    identity["email"].as_str().unwrap_or("-"),
                );
            }
        }
        DaemonCommand::Status => {
            print_json(&proxy.status().await.map_err(describe)?)?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn connect(session: bool) -> Result<GateProxy<'static>> {
    let builder = if session {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let bus = if session { "session" } else { "system" };
    tracing::debug!(bus, "connecting to facegated");
    // Extraction on a cold engine can take several seconds.
    let conn = builder
        .method_timeout(Duration::from_secs(60))
        .build()
        .await
        .context("connecting to D-Bus")?;
    Ok(GateProxy::new(&conn).await?)
}

async fn models(
    model_dir: Option<PathBuf>,
    bundled_dir: Option<PathBuf>,
    weights_url: Option<String>,
    fetch: bool,
) -> Result<ExitCode> {
    let mut config = ModelConfig::default();
    if let Some(dir) = model_dir {
        config.model_dir = dir;
    }
    config.bundled_dir = bundled_dir;
    config.weights_url = weights_url;

    let set = if fetch {
        facegate_models::provision(&config).await
    } else {
        ModelSet::verify(&config)
    };

    match set {
        Ok(set) => {
            println!("recognizer      {}", set.recognizer.display());
            println!("detector        {}", set.detector.display());
            println!("quick detector  {}", set.quick_detector.display());
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("models not ready: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Read a photo and sniff its content type from the bytes.
fn read_image(path: &Path) -> Result<(&'static str, Vec<u8>)> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let content_type = sniff_content_type(&bytes);
    tracing::debug!(path = %path.display(), content_type, bytes = bytes.len(), "image read");
    Ok((content_type, bytes))
}

/// Unknown formats are sent as-is; the daemon rejects them.
fn sniff_content_type(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Jpeg) => "image/jpeg",
        Ok(ImageFormat::Png) => "image/png",
        _ => "application/octet-stream",
    }
}

fn update_patch(given: Option<String>, family: Option<String>, email: Option<String>) -> Value {
    let mut patch = serde_json::Map::new();
    for (key, value) in [("given_name", given), ("family_name", family), ("email", email)] {
        if let Some(value) = value {
            patch.insert(key.into(), Value::String(value));
        }
    }
    Value::Object(patch)
}

/// One-line description of an Identify result, plus whether it matched.
fn summarize_recognition(raw: &str) -> Result<(String, bool)> {
    let value: Value = serde_json::from_str(raw)?;
    let distance = value["distance"].as_f64().unwrap_or(f64::NAN);
    match value["status"].as_str() {
        Some("recognized") => {
            let identity = &value["identity"];
            Ok((
                format!(
                    "recognized: {} {} (id {}, distance {distance:.4})",
                    identity["given_name"].as_str().unwrap_or_default(),
                    identity["family_name"].as_str().unwrap_or_default(),
                    identity["id"],
                ),
                true,
            ))
        }
        Some("unrecognized") => Ok((format!("not recognized (nearest distance {distance:.4})"), false)),
        _ => bail!("unexpected identify response: {raw}"),
    }
}

fn print_json(raw: &str) -> Result<()> {
    let value: Value = serde_json::from_str(raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Turn `org.facegate.Gate1.Error.NoFaceDetected: no face detected` style
/// replies into a short message.
fn describe(err: zbus::Error) -> anyhow::Error {
    match &err {
        zbus::Error::MethodError(name, detail, _) => {
            let kind = name.as_str().rsplit('.').next().unwrap_or(name.as_str());
            anyhow::anyhow!("{kind}: {}", detail.as_deref().unwrap_or("no details"))
        }
        _ => anyhow::Error::new(err).context("daemon request failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_sniff_content_type() {
        let img = image::RgbImage::new(4, 4);
        let mut png = Cursor::new(Vec::new());
        img.write_to(&mut png, ImageFormat::Png).unwrap();
        assert_eq!(sniff_content_type(png.get_ref()), "image/png");

        let mut jpeg = Cursor::new(Vec::new());
        img.write_to(&mut jpeg, ImageFormat::Jpeg).unwrap();
        assert_eq!(sniff_content_type(jpeg.get_ref()), "image/jpeg");

        assert_eq!(sniff_content_type(b"hello"), "application/octet-stream");
    }

    #[test]
    fn test_read_image() {
        let path = std::env::temp_dir().join(format!("facegate-cli-{}.png", std::process::id()));
        let mut png = Cursor::new(Vec::new());
        image::RgbImage::new(4, 4).write_to(&mut png, ImageFormat::Png).unwrap();
        std::fs::write(&path, png.get_ref()).unwrap();

        let (content_type, bytes) = read_image(&path).unwrap();
        assert_eq!(content_type, "image/png");
        assert_eq!(&bytes, png.get_ref());

        std::fs::remove_file(&path).unwrap();
        let err = read_image(&path).unwrap_err();
        assert!(err.to_string().contains("facegate-cli-"), "{err}");
    }

    #[test]
    fn test_update_patch_only_given_fields() {
        let patch = update_patch(None, Some("Vega".into()), None);
        assert_eq!(patch, json!({ "family_name": "Vega" }));
        assert_eq!(update_patch(None, None, None), json!({}));
    }

    #[test]
    fn test_summarize_recognition() {
        let raw = r#"{"status":"recognized","identity":{"id":3,"given_name":"Ana","family_name":"Rojas"},"distance":0.12}"#;
        let (line, recognized) = summarize_recognition(raw).unwrap();
        assert!(recognized);
        assert_eq!(line, "recognized: Ana Rojas (id 3, distance 0.1200)");

        let (line, recognized) = summarize_recognition(r#"{"status":"unrecognized","distance":0.71}"#).unwrap();
        assert!(!recognized);
        assert_eq!(line, "not recognized (nearest distance 0.7100)");

        assert!(summarize_recognition(r#"{"status":"maybe"}"#).is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "facegate", "--session", "enroll", "--given", "Ana", "--family", "Rojas", "ana.jpg",
        ])
        .unwrap();
        assert!(cli.session);
        assert!(matches!(
            cli.command,
            Commands::Daemon(DaemonCommand::Enroll { email: None, .. })
        ));

        let cli = Cli::try_parse_from(["facegate", "update", "4", "--image", "new.png"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Daemon(DaemonCommand::Update { id: 4, image: Some(_), .. })
        ));

        let cli = Cli::try_parse_from(["facegate", "models", "--fetch"]).unwrap();
        assert!(matches!(cli.command, Commands::Models { fetch: true, .. }));
    }
}
