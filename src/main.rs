use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use judge_engine::{Engine, EngineConfig, Environment, Executor, LanguageRegistry, Submission};

const DEFAULT_ENGINE_CONFIG: &str = "./files/engine.toml";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("judge_engine=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_engine_config()?;
    let languages = load_languages()?;
    info!(
        "Engine ready: environment={:?}, boxes {}..{}, {} language names",
        config.environment,
        config.box_id_start,
        config.box_id_start + config.box_id_count,
        languages.names().len()
    );

    let engine = Engine::new(config);
    if let Err(e) = engine.probe().await {
        match engine.config().environment {
            Environment::Production => return Err(e).context("isolate is not usable"),
            Environment::Development => warn!("{}", e),
        }
    }
    let executor = Arc::new(Executor::new(engine, Arc::new(languages)));

    // Each argument is a submission JSON file; with none, read one from stdin.
    let paths: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();
    if paths.is_empty() {
        let mut raw = String::new();
        tokio::io::stdin()
            .read_to_string(&mut raw)
            .await
            .context("Failed to read submission from stdin")?;
        let submission: Submission =
            serde_json::from_str(&raw).context("Invalid submission JSON on stdin")?;
        let result = executor.execute(&submission).await?;
        println!("{}", serde_json::to_string(&result)?);
        return Ok(());
    }

    let mut tasks = JoinSet::new();
    for path in paths {
        let executor = Arc::clone(&executor);
        tasks.spawn(async move {
            let outcome = run_file(&executor, &path).await;
            (path, outcome)
        });
    }

    let mut failures = 0;
    while let Some(joined) = tasks.join_next().await {
        let (path, outcome) = joined.context("Submission task panicked")?;
        match outcome {
            Ok(line) => println!("{}", line),
            Err(e) => {
                failures += 1;
                error!("Submission {:?} failed: {:#}", path, e);
                println!(
                    "{}",
                    serde_json::json!({ "file": path, "error": format!("{:#}", e) })
                );
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} submission(s) could not be executed", failures);
    }
    Ok(())
}

async fn run_file(executor: &Executor, path: &Path) -> Result<String> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read submission {:?}", path))?;
    let submission: Submission = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid submission JSON in {:?}", path))?;
    let result = executor.execute(&submission).await?;
    Ok(serde_json::to_string(&result)?)
}

fn load_engine_config() -> Result<EngineConfig> {
    match std::env::var("ENGINE_CONFIG") {
        Ok(path) => {
            let config = EngineConfig::load(&path)?;
            info!("Loaded engine configuration from {}", path);
            Ok(config)
        }
        Err(_) if Path::new(DEFAULT_ENGINE_CONFIG).exists() => {
            let config = EngineConfig::load(DEFAULT_ENGINE_CONFIG)?;
            info!("Loaded engine configuration from {}", DEFAULT_ENGINE_CONFIG);
            Ok(config)
        }
        Err(_) => {
            warn!("ENGINE_CONFIG not set, using built-in defaults");
            Ok(EngineConfig::default())
        }
    }
}

fn load_languages() -> Result<LanguageRegistry> {
    match std::env::var("LANGUAGES_CONFIG") {
        Ok(path) => {
            let registry = LanguageRegistry::load(&path)?;
            info!("Loaded language configurations from {}", path);
            Ok(registry)
        }
        Err(_) => LanguageRegistry::builtin().context("Built-in language table is invalid"),
    }
}
