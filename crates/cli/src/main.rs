use anyhow::Context;
use clap::{Parser, Subcommand};
use fhir::{Bundle, BusinessIdentifier, Entity, LogicalId, ResourceType};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tie_core::config::{
    max_reference_depth_from_env_value, request_timeout_from_env_value,
    retry_policy_from_env_values, store_target_from_env_values,
};
use tie_core::{
    CallContext, CoreConfig, DocumentCanonicalizer, Engine, TracingAuditEmitter,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tie")]
#[command(about = "Clinical integration engine CLI")]
struct Cli {
    /// Give up on store calls after this many milliseconds
    #[arg(long, global = true)]
    deadline_ms: Option<u64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update the canonical record for one resource
    Upsert {
        /// JSON or YAML resource file
        path: PathBuf,
    },
    /// Find a canonical record by business identifier
    Lookup {
        /// Resource type, e.g. Organization
        resource_type: String,
        /// Identifier system URI
        system: String,
        /// Identifier value
        value: String,
    },
    /// Upsert every entry of a message or collection bundle
    Process {
        /// JSON or YAML bundle file
        path: PathBuf,
    },
    /// Resolve a transaction bundle and submit it to the store
    Transaction {
        /// JSON or YAML bundle file
        path: PathBuf,
        /// Print the prepared bundle without submitting it
        #[arg(long)]
        dry_run: bool,
    },
    /// Rewrite a bundle as a self-contained document
    Canonicalize {
        /// JSON or YAML bundle file
        path: PathBuf,
        /// fullUrl or Type/id of the document subject
        #[arg(long)]
        subject: String,
    },
    /// Delete a canonical record
    Delete {
        /// Resource type, e.g. Patient
        resource_type: String,
        /// Logical id assigned by the store
        id: String,
    },
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    )
}

fn read_entity(path: &Path) -> anyhow::Result<Entity> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let entity = if is_yaml(path) {
        Entity::parse_yaml(&text)
    } else {
        Entity::parse_json(&text)
    };
    entity.with_context(|| format!("failed to parse {}", path.display()))
}

fn read_bundle(path: &Path) -> anyhow::Result<Bundle> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let bundle = if is_yaml(path) {
        Bundle::parse_yaml(&text)
    } else {
        Bundle::parse_json(&text)
    };
    bundle.with_context(|| format!("failed to parse {}", path.display()))
}

/// Resolves core configuration from the process environment.
fn load_config() -> anyhow::Result<CoreConfig> {
    let env = |name: &str| std::env::var(name).ok();
    let store = store_target_from_env_values(env("TIE_STORE_URL"), env("TIE_STORE_DIR"))?;
    let retry = retry_policy_from_env_values(
        env("TIE_RETRY_ATTEMPTS"),
        env("TIE_RETRY_BACKOFF_MS"),
        env("TIE_RETRY_BACKOFF_MAX_MS"),
    )?;
    let timeout = request_timeout_from_env_value(env("TIE_REQUEST_TIMEOUT_MS"))?;
    let depth = max_reference_depth_from_env_value(env("TIE_MAX_REFERENCE_DEPTH"))?;
    Ok(CoreConfig::new(store, retry, timeout, depth)?)
}

fn engine() -> anyhow::Result<Engine> {
    let config = load_config()?;
    Ok(Engine::from_config(&config, Arc::new(TracingAuditEmitter))?)
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("tie=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let ctx = match cli.deadline_ms {
        Some(ms) => CallContext::with_timeout(Duration::from_millis(ms)),
        None => CallContext::new(),
    };

    match cli.command {
        Some(Commands::Upsert { path }) => {
            let outcome = engine()?.upsert(&ctx, read_entity(&path)?)?;
            println!(
                "{} {}/{}",
                outcome.action, outcome.record.resource_type, outcome.record.id
            );
        }
        Some(Commands::Lookup {
            resource_type,
            system,
            value,
        }) => {
            let resource_type = ResourceType::parse(&resource_type)?;
            let identifier = BusinessIdentifier::from_parts(Some(&system), Some(&value));
            match engine()?.lookup(&ctx, resource_type, &identifier)? {
                Some(record) => println!("{}", record.entity.render_json()?),
                None => println!("No canonical {resource_type} carries that identifier."),
            }
        }
        Some(Commands::Process { path }) => {
            let outcomes = engine()?.process_bundle(&ctx, &read_bundle(&path)?)?;
            for entry in outcomes {
                println!(
                    "entry {}: {} {}/{}",
                    entry.entry,
                    entry.outcome.action,
                    entry.outcome.record.resource_type,
                    entry.outcome.record.id
                );
            }
        }
        Some(Commands::Transaction { path, dry_run }) => {
            let engine = engine()?;
            let bundle = read_bundle(&path)?;
            let result = if dry_run {
                engine.prepare_transaction(&ctx, &bundle)?
            } else {
                engine.submit_transaction(&ctx, &bundle)?
            };
            println!("{}", result.render_json()?);
        }
        Some(Commands::Canonicalize { path, subject }) => {
            let bundle = read_bundle(&path)?;
            let document = DocumentCanonicalizer::random().canonicalize_bundle(&bundle, &subject)?;
            println!("{}", document.to_bundle().render_json()?);
        }
        Some(Commands::Delete { resource_type, id }) => {
            let resource_type = ResourceType::parse(&resource_type)?;
            let id = LogicalId::new(&id)?;
            let deleted = engine()?.delete(&ctx, resource_type, &id)?;
            println!("deleted {}/{}", deleted.resource_type, deleted.id);
        }
        None => {
            println!("Use 'tie --help' for commands");
        }
    }

    Ok(())
}
