use anyhow::Context;
use fhir::{Bundle, BundleType, Entity};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tie_core::config::{
    max_reference_depth_from_env_value, request_timeout_from_env_value,
    retry_policy_from_env_values, store_target_from_env_values,
};
use tie_core::{CallContext, CoreConfig, Engine, TracingAuditEmitter};

const DEFAULT_INBOX_DIR: &str = "inbox";

/// One inbound file, decoded.
enum Inbound {
    Resource(Entity),
    Bundle(Bundle),
}

/// Main entry point for the intake runner
///
/// Processes every `.json`, `.yaml` and `.yml` file named on the command line, or, with no
/// arguments, every such file in the inbox directory in name order. Single resources are
/// upserted, transaction bundles submitted, and other bundles processed entry by entry.
///
/// A failing file is logged and the run continues; the exit status reports whether any
/// file failed.
///
/// # Environment Variables
/// - `TIE_INBOX_DIR`: directory scanned when no files are given (default: "inbox")
/// - `TIE_STORE_URL` / `TIE_STORE_DIR`: canonical store (default: "canonical_store")
/// - `TIE_RETRY_ATTEMPTS`, `TIE_RETRY_BACKOFF_MS`, `TIE_RETRY_BACKOFF_MAX_MS`: retry policy
/// - `TIE_REQUEST_TIMEOUT_MS`: per-request timeout for the HTTP store
/// - `TIE_MAX_REFERENCE_DEPTH`: maximum nesting of embedded references
fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("tie=info".parse()?))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config()?;
    let engine = Engine::from_config(&config, Arc::new(TracingAuditEmitter))?;

    let args: Vec<PathBuf> = std::env::args_os().skip(1).map(PathBuf::from).collect();
    let files = if args.is_empty() {
        let inbox = std::env::var("TIE_INBOX_DIR").unwrap_or_else(|_| DEFAULT_INBOX_DIR.into());
        tracing::info!("++ Scanning inbox {}", inbox);
        inbox_files(Path::new(&inbox))?
    } else {
        args
    };

    let mut failed = 0usize;
    for path in &files {
        if let Err(e) = process_file(&engine, path) {
            failed += 1;
            tracing::error!(file = %path.display(), "intake failed: {:#}", e);
        }
    }

    tracing::info!(files = files.len(), failed, "intake run complete");
    if failed > 0 {
        anyhow::bail!("{failed} of {} files failed", files.len());
    }
    Ok(())
}

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

fn is_inbound(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("json" | "yaml" | "yml")
    )
}

/// Inbound files directly under `inbox`, sorted by name.
fn inbox_files(inbox: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(inbox)
        .with_context(|| format!("failed to read inbox {}", inbox.display()))?
    {
        let path = entry?.path();
        if path.is_file() && is_inbound(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Decodes a file as a bundle or a single resource, by its `resourceType`.
fn decode(path: &Path) -> anyhow::Result<Inbound> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value: Value = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml" | "yml") => serde_yaml::from_str(&text)?,
        _ => serde_json::from_str(&text)?,
    };
    if value.get("resourceType").and_then(Value::as_str) == Some("Bundle") {
        Ok(Inbound::Bundle(Bundle::from_value(value)?))
    } else {
        Ok(Inbound::Resource(Entity::from_value(value)?))
    }
}

fn process_file(engine: &Engine, path: &Path) -> anyhow::Result<()> {
    let ctx = CallContext::new();
    match decode(path)? {
        Inbound::Resource(entity) => {
            let outcome = engine.upsert(&ctx, entity)?;
            tracing::info!(
                file = %path.display(),
                resource_type = %outcome.record.resource_type,
                id = %outcome.record.id,
                action = %outcome.action,
                "resource ingested"
            );
        }
        Inbound::Bundle(bundle) if bundle.bundle_type == BundleType::Transaction => {
            let response = engine.submit_transaction(&ctx, &bundle)?;
            tracing::info!(
                file = %path.display(),
                entries = response.entries.len(),
                "transaction ingested"
            );
        }
        Inbound::Bundle(bundle) => {
            let outcomes = engine.process_bundle(&ctx, &bundle)?;
            tracing::info!(
                file = %path.display(),
                entries = outcomes.len(),
                "bundle ingested"
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn inbox_lists_inbound_files_in_name_order() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        for name in ["b.json", "a.yaml", "notes.txt", "c.yml"] {
            std::fs::write(temp_dir.path().join(name), "{}").expect("write");
        }
        let files = inbox_files(temp_dir.path()).expect("list");
        let names: Vec<String> = files
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_owned))
            .collect();
        assert_eq!(names, vec!["a.yaml", "b.json", "c.yml"]);
    }

    #[test]
    fn decode_distinguishes_bundles_from_resources() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let bundle = temp_dir.path().join("bundle.yaml");
        std::fs::write(&bundle, "resourceType: Bundle\ntype: collection\n").expect("write");
        let resource = temp_dir.path().join("org.json");
        std::fs::write(
            &resource,
            r#"{"resourceType": "Organization", "identifier": [{"system": "https://fhir.nhs.uk/Id/ods-organization-code", "value": "RR8"}]}"#,
        )
        .expect("write");

        assert!(matches!(decode(&bundle).expect("bundle"), Inbound::Bundle(_)));
        assert!(matches!(decode(&resource).expect("resource"), Inbound::Resource(_)));
    }

    #[test]
    fn files_are_ingested_into_a_directory_store() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store_dir = temp_dir.path().join("store");
        let config = CoreConfig::with_store(tie_core::StoreTarget::Directory(store_dir));
        let engine = Engine::from_config(&config, Arc::new(TracingAuditEmitter)).expect("engine");

        let resource = temp_dir.path().join("org.json");
        std::fs::write(
            &resource,
            r#"{"resourceType": "Organization", "identifier": [{"system": "https://fhir.nhs.uk/Id/ods-organization-code", "value": "RR8"}]}"#,
        )
        .expect("write");

        process_file(&engine, &resource).expect("first ingest");
        process_file(&engine, &resource).expect("replay");
        let hit = engine
            .lookup(
                &CallContext::new(),
                fhir::ResourceType::Organization,
                &fhir::BusinessIdentifier::from_parts(
                    Some("https://fhir.nhs.uk/Id/ods-organization-code"),
                    Some("RR8"),
                ),
            )
            .expect("lookup");
        assert!(hit.is_some());
    }
}
