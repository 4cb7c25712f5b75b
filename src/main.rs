use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fluux_warden::analyzer::StaticAnalyzer;
use fluux_warden::capability::{CapabilityToken, TokenValidator, TrustStore};
use fluux_warden::config::Config;
use fluux_warden::llm::build_client;
use fluux_warden::policy::{
    ConstraintCompiler, DenyAllVerifier, HttpSemanticVerifier, PolicyContext, SemanticVerifier,
};
use fluux_warden::repair::{LlmCodeGenerator, RepairSettings, SelfRepairController, TaskRequest};
use fluux_warden::sandbox::{HttpToolBackend, SandboxExecutor};
use fluux_warden::schema::{InMemorySchemaSource, SchemaRegistry, ToolCatalog};
use fluux_warden::WardenError;

#[derive(Parser)]
#[command(name = "fluux-warden")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Runs LLM-generated tool-calling code under capability tokens", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(short, long, global = true, default_value = "config/warden.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate, verify and run code for a task, repairing it on failure
    Run {
        /// Task description handed to the model
        #[arg(short, long)]
        task: String,

        /// JSON file with the capability tokens for this task
        #[arg(long)]
        tokens: PathBuf,

        /// Identity the task runs as ($principal in token predicates)
        #[arg(long, env = "WARDEN_PRINCIPAL")]
        principal: Option<String>,

        /// Context attribute as NAME=VALUE ($NAME in token predicates);
        /// VALUE is parsed as JSON, falling back to a string
        #[arg(long = "attr")]
        attributes: Vec<String>,

        /// Write the call trace of the last execution to this file
        #[arg(long)]
        trace_out: Option<PathBuf>,
    },

    /// Parse a program and check it against the configured catalog
    Check {
        /// Program file
        file: PathBuf,
    },

    /// Verify the signature and expiry of every token in a file
    VerifyTokens {
        /// JSON file with capability tokens
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("fluux_warden=info")),
        )
        .init();

    info!("Loading configuration from {}", cli.config);
    let config = Config::load(&cli.config)?;

    let succeeded = match cli.command {
        Commands::Run {
            task,
            tokens,
            principal,
            attributes,
            trace_out,
        } => {
            let mut context = principal
                .map(PolicyContext::for_principal)
                .unwrap_or_default();
            for attr in &attributes {
                let (name, value) = parse_attribute(attr)?;
                context = context.with_attribute(name, value);
            }
            run(&config, task, &tokens, context, trace_out.as_deref()).await?
        }
        Commands::Check { file } => check(&config, &file).await?,
        Commands::VerifyTokens { file } => verify_tokens(&config, &file)?,
    };

    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}

async fn load_catalog(config: &Config) -> Result<(Arc<SchemaRegistry>, Arc<ToolCatalog>)> {
    let source = InMemorySchemaSource::from_file(&config.registry.schemas)
        .with_context(|| format!("loading schemas from {}", config.registry.schemas.display()))?;
    let registry = Arc::new(SchemaRegistry::new(Arc::new(source)));
    let catalog = Arc::new(registry.catalog().await?);
    info!("Catalog: {} tools", catalog.len());
    Ok((registry, catalog))
}

/// The configured remote verifier, or one that fails every semantic check.
fn semantic_verifier(config: &Config) -> Result<Arc<dyn SemanticVerifier>> {
    match &config.verifier {
        Some(verifier) => {
            info!("Semantic checks: {}", verifier.url);
            Ok(Arc::new(HttpSemanticVerifier::new(
                &verifier.url,
                config.sandbox.semantic_timeout(),
                verifier.auth_token.clone(),
            )?))
        }
        None => {
            info!("No [verifier] configured, semantic checks will fail");
            Ok(Arc::new(DenyAllVerifier))
        }
    }
}

fn validator(config: &Config) -> Result<TokenValidator> {
    let trust = TrustStore::from_base64(&config.trust.issuers)?;
    info!("Trusted issuers: {}", trust.len());
    Ok(TokenValidator::new(Arc::new(trust)))
}

async fn run(
    config: &Config,
    task: String,
    tokens: &Path,
    context: PolicyContext,
    trace_out: Option<&Path>,
) -> Result<bool> {
    let (registry, catalog) = load_catalog(config).await?;
    let tokens = CapabilityToken::load_all(tokens)?;

    let backend = HttpToolBackend::new(
        &config.backend.base_url,
        Duration::from_secs(config.backend.timeout_secs),
        config.backend.auth_token.clone(),
    )?;
    let executor = SandboxExecutor::new(
        registry,
        Arc::new(ConstraintCompiler::new()),
        validator(config)?,
        Arc::new(backend),
    )
    .with_verifier(semantic_verifier(config)?, config.sandbox.semantic_timeout());

    let client = build_client(&config.llm)?;
    info!("LLM: {}", client.description());
    let controller = SelfRepairController::new(
        Arc::new(executor),
        Arc::new(LlmCodeGenerator::new(client)),
        catalog,
        RepairSettings::from(&config.repair),
    );

    let request = TaskRequest {
        task,
        tokens,
        context,
        budget: config.sandbox.budget(),
    };
    let result = tokio::select! {
        result = controller.run_task(request) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Shutdown signal received, abandoning task");
            return Ok(false);
        }
    };

    if let Some(path) = trace_out {
        std::fs::write(path, serde_json::to_string_pretty(&result.trace)?)
            .with_context(|| format!("writing trace to {}", path.display()))?;
        info!("Trace ({} calls) written to {}", result.trace.len(), path.display());
    }
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(result.is_success())
}

async fn check(config: &Config, file: &Path) -> Result<bool> {
    let (_, catalog) = load_catalog(config).await?;
    let code = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;

    match StaticAnalyzer::new(&catalog).check_source(&code) {
        Ok((_, report)) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.fully_checked() {
                warn!("Some calls can only be checked at run time");
            }
            Ok(true)
        }
        Err(e) => {
            error!("{}: {e}", file.display());
            if let WardenError::UnknownTool { ref tool } = e {
                if let Some(hint) = catalog.closest(tool) {
                    error!("Did you mean '{hint}'?");
                }
            }
            Ok(false)
        }
    }
}

fn verify_tokens(config: &Config, file: &Path) -> Result<bool> {
    let validator = validator(config)?;
    let tokens = CapabilityToken::load_all(file)?;
    let mut all_valid = true;
    for token in &tokens {
        match validator.verify(token) {
            Ok(()) => println!(
                "{}: ok ({} {:?}, expires {})",
                token.id, token.pattern, token.operations, token.expires_at
            ),
            Err(e) => {
                println!("{}: {e}", token.id);
                all_valid = false;
            }
        }
    }
    Ok(all_valid)
}

/// Splits `NAME=VALUE`; VALUE is JSON when it parses as JSON.
fn parse_attribute(raw: &str) -> Result<(String, Value)> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("Invalid attribute '{raw}' (expected NAME=VALUE)"))?;
    if name.is_empty() {
        return Err(anyhow!("Invalid attribute '{raw}' (empty name)"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serde_json::json;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_attribute() {
        assert_eq!(parse_attribute("team=\"sales\"").unwrap(), ("team".into(), json!("sales")));
        assert_eq!(parse_attribute("team=sales").unwrap(), ("team".into(), json!("sales")));
        assert_eq!(parse_attribute("quota=50").unwrap(), ("quota".into(), json!(50)));
        assert!(parse_attribute("novalue").is_err());
        assert!(parse_attribute("=x").is_err());
    }

    const CONFIG: &str = r#"
[llm]
provider = "ollama"
model = "qwen2.5-coder"

[registry]
schemas = "./schemas.json"

[backend]
base_url = "http://localhost:8080"

[trust]
issuers = { authority = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=" }
"#;

    #[tokio::test]
    async fn test_semantic_verifier_selection() {
        let ctx = PolicyContext::default();

        let config = Config::parse(CONFIG).unwrap();
        let deny = semantic_verifier(&config).unwrap();
        assert!(deny.verify("record_exists", "a.b", &json!("x"), &ctx).await.is_err());

        let config = Config::parse(&format!("{CONFIG}\n[verifier]\nurl = \"http://127.0.0.1:9\"\n")).unwrap();
        assert!(semantic_verifier(&config).is_ok());

        let config = Config::parse(&format!("{CONFIG}\n[verifier]\nurl = \"ftp://checks\"\n")).unwrap();
        assert!(semantic_verifier(&config).is_err());
    }

    #[test]
    fn test_run_arguments() {
        let cli = Cli::parse_from([
            "fluux-warden",
            "run",
            "--task",
            "list leads",
            "--tokens",
            "tokens.json",
            "--attr",
            "team=sales",
        ]);
        assert_eq!(cli.config, "config/warden.toml");
        match cli.command {
            Commands::Run { task, attributes, .. } => {
                assert_eq!(task, "list leads");
                assert_eq!(attributes, vec!["team=sales"]);
            }
            _ => panic!("expected run"),
        }
    }
}
