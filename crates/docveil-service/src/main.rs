use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use docveil_core::{
    parse_signed_url, DeliveryEngine, DeliveryFailure, DocumentVault, EngineConfig,
    FileSessionStore, HeuristicClassifier, InMemoryDirectory, JsonlAuditSink, LogAnnouncer,
    RequestContext, SigningSecret, StreamRequest, VaultKey,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

const AUDIT_MAX_BYTES: u64 = 5 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(author, version, about = "Docveil secure delivery service", long_about = None)]
struct Cli {
    /// Data directory override (library/, scratch/, logs/, sessions.json)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a fresh signing secret and vault key
    Keygen,

    /// Issue a signed delivery link for a subject
    Issue {
        #[arg(long)]
        subject: u64,
        #[arg(long, default_value_t = 1)]
        resource: u64,
        /// Base URL embedded in the link
        #[arg(long, default_value = "http://localhost:3000")]
        base_url: String,
    },

    /// Start a session for a subject
    Login {
        #[arg(long)]
        subject: u64,
    },

    /// Revoke a subject's session (idempotent)
    Revoke {
        #[arg(long)]
        subject: u64,
    },

    /// Redeem a signed link and write the marked document
    Deliver {
        /// Full signed URL as issued
        #[arg(long)]
        url: String,
        /// Optional document name overriding the URL's file parameter
        #[arg(long)]
        file: Option<String>,
        /// Where to write the marked copy
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value = "127.0.0.1")]
        source_ip: String,
        #[arg(long, default_value = "cli")]
        device_hash: String,
    },

    /// List deliverable documents in the library
    Ls,

    /// Scan an image for a covert provenance payload
    Trace {
        image: PathBuf,
    },

    /// Encrypt a document into the vault format
    Seal {
        input: PathBuf,
        output: PathBuf,
    },

    /// Decrypt a vault blob
    Unseal {
        input: PathBuf,
        output: PathBuf,
    },

    /// Show the newest audit records
    Logs {
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },

    /// Run a violation drill: classify, alert, audit
    SimulateViolation {
        #[arg(long)]
        subject: u64,
    },

    /// Remove stale scratch copies left behind by crashes
    Sweep,
}

fn data_dir(override_path: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = override_path {
        return Ok(path);
    }
    let dirs = directories::ProjectDirs::from("com", "docveil", "docveil")
        .ok_or_else(|| anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

fn signing_secret() -> Result<SigningSecret> {
    let hex = std::env::var("DOCVEIL_SIGNING_SECRET")
        .context("DOCVEIL_SIGNING_SECRET is not set (run keygen)")?;
    Ok(SigningSecret::from_hex(&hex)?)
}

fn vault_key() -> Result<Option<VaultKey>> {
    match std::env::var("DOCVEIL_VAULT_KEY") {
        Ok(hex) => Ok(Some(VaultKey::from_hex(&hex)?)),
        Err(_) => Ok(None),
    }
}

/// Optional id → identity map at `<data>/users.json`; the external user
/// store in production deployments.
fn load_directory(data: &std::path::Path) -> Result<Arc<InMemoryDirectory>> {
    let directory = InMemoryDirectory::new();
    let path = data.join("users.json");
    if path.exists() {
        let raw = std::fs::read(&path)?;
        let users: HashMap<u64, String> = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;
        for (id, identity) in users {
            directory.insert(id, identity);
        }
    }
    Ok(Arc::new(directory))
}

fn build_engine(data: &std::path::Path, base_url: &str) -> Result<DeliveryEngine> {
    let library = data.join("library");
    std::fs::create_dir_all(&library)?;
    let config = EngineConfig::new(library, data.join("scratch"), base_url);
    let audit = JsonlAuditSink::new(data.join("logs").join("audit.jsonl"), AUDIT_MAX_BYTES)?;
    let engine = DeliveryEngine::new(
        config,
        signing_secret()?,
        vault_key()?,
        Arc::new(FileSessionStore::new(data.join("sessions.json"))),
        Arc::new(audit),
        Arc::new(HeuristicClassifier),
        Arc::new(LogAnnouncer::new(Some(data.join("alerts")))),
        load_directory(data)?,
    )?;
    Ok(engine)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let data = data_dir(cli.data_dir.clone())?;
    std::fs::create_dir_all(&data)?;

    match cli.command {
        Commands::Keygen => {
            let secret = SigningSecret::generate();
            let key = VaultKey::generate();
            println!("DOCVEIL_SIGNING_SECRET={}", secret.to_hex());
            println!("DOCVEIL_VAULT_KEY={}", key.to_hex());
            Ok(())
        }

        Commands::Issue {
            subject,
            resource,
            base_url,
        } => {
            let engine = build_engine(&data, &base_url)?;
            let link = engine.issue_link(subject, resource);
            println!("{}", serde_json::to_string_pretty(&link)?);
            Ok(())
        }

        Commands::Login { subject } => {
            let engine = build_engine(&data, "http://localhost:3000")?;
            let token = engine.login(subject)?;
            println!("session started for subject {subject}: {token}");
            Ok(())
        }

        Commands::Revoke { subject } => {
            let engine = build_engine(&data, "http://localhost:3000")?;
            engine.revoke_session(subject)?;
            println!("session revoked for user {subject}");
            Ok(())
        }

        Commands::Deliver {
            url,
            file,
            out,
            source_ip,
            device_hash,
        } => {
            let engine = build_engine(&data, "http://localhost:3000")?;
            let mut request: StreamRequest = parse_signed_url(&url)?;
            if file.is_some() {
                request.file = file;
            }
            let ctx = RequestContext {
                source_ip,
                device_hash,
            };
            match engine.deliver(request, ctx).await {
                Ok(delivered) => {
                    std::fs::write(&out, &delivered.media)?;
                    info!(file = %delivered.file_name, out = %out.display(), "delivered");
                    println!(
                        "{} ({} bytes) -> {}",
                        delivered.file_name,
                        delivered.media.len(),
                        out.display()
                    );
                    // dropping `delivered` purges the scratch copy
                    Ok(())
                }
                Err(failure @ DeliveryFailure::Rejected(_)) => {
                    Err(anyhow!("rejected: {failure}"))
                }
                Err(DeliveryFailure::Internal(e)) => {
                    Err(anyhow::Error::new(e).context("delivery failed"))
                }
            }
        }

        Commands::Ls => {
            let engine = build_engine(&data, "http://localhost:3000")?;
            let documents = engine.list_documents()?;
            println!("{}", serde_json::to_string_pretty(&documents)?);
            Ok(())
        }

        Commands::Trace { image } => {
            let engine = build_engine(&data, "http://localhost:3000")?;
            let bytes = std::fs::read(&image)
                .with_context(|| format!("reading {}", image.display()))?;
            let report = engine.trace(bytes).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }

        Commands::Seal { input, output } => {
            let key = vault_key()?
                .ok_or_else(|| anyhow!("DOCVEIL_VAULT_KEY is not set (run keygen)"))?;
            DocumentVault::new(key).seal_file(&input, &output)?;
            println!("sealed {} -> {}", input.display(), output.display());
            Ok(())
        }

        Commands::Unseal { input, output } => {
            let key = vault_key()?
                .ok_or_else(|| anyhow!("DOCVEIL_VAULT_KEY is not set (run keygen)"))?;
            DocumentVault::new(key).open_file(&input, &output)?;
            println!("opened {} -> {}", input.display(), output.display());
            Ok(())
        }

        Commands::Logs { limit } => {
            let audit =
                JsonlAuditSink::new(data.join("logs").join("audit.jsonl"), AUDIT_MAX_BYTES)?;
            if let Some(broken) = audit.verify_chain()? {
                eprintln!("WARNING: audit chain broken at seq {broken}");
            }
            for record in audit.tail(limit)? {
                println!("{}", serde_json::to_string(&record)?);
            }
            Ok(())
        }

        Commands::SimulateViolation { subject } => {
            let engine = build_engine(&data, "http://localhost:3000")?;
            let assessment = engine
                .simulate_violation(subject, RequestContext::unknown())
                .await?;
            println!(
                "violation simulated: threat level {} ({})",
                assessment.level, assessment.analysis
            );
            Ok(())
        }

        Commands::Sweep => {
            let engine = build_engine(&data, "http://localhost:3000")?;
            let removed = engine.sweep_scratch()?;
            println!("removed {removed} stale scratch copies");
            Ok(())
        }
    }
}
