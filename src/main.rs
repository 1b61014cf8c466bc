use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use omg_exec::reporter::ConsoleReporter;
use omg_exec::{Engine, EngineConfig, ExecRequest, Invocation, Microservice};

#[derive(Parser, Debug)]
#[command(name = "omg-exec", version, about = "Run microservice actions inside Docker containers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Verbose logs
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Only print the action output
    #[arg(short, long, global = true)]
    quiet: bool,
    /// Path to the microservice descriptor (JSON)
    #[arg(short, long, global = true, default_value = "microservice.json")]
    descriptor: PathBuf,
    /// Image the microservice runs from
    #[arg(short, long, global = true)]
    image: Option<String>,
}

#[derive(Args, Debug, Default)]
struct Inputs {
    /// Action argument, repeatable
    #[arg(short = 'a', long = "arg", value_name = "NAME=VALUE", value_parser = parse_pair)]
    args: Vec<(String, String)>,
    /// Environment variable passed to the container, repeatable
    #[arg(short = 'e', long = "env", value_name = "KEY=VALUE", value_parser = parse_pair)]
    env: Vec<(String, String)>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run an action once
    Run {
        action: String,
        #[command(flatten)]
        inputs: Inputs,
    },
    /// Subscribe to an event, starting the lifecycle container if needed
    Subscribe {
        action: String,
        event: String,
        #[command(flatten)]
        inputs: Inputs,
        /// URL the container should deliver events to
        #[arg(long)]
        callback: Option<String>,
    },
    /// Unsubscribe from an event
    Unsubscribe {
        action: String,
        event: String,
        #[command(flatten)]
        inputs: Inputs,
    },
    /// Stop the lifecycle container started from this directory
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("OMG_LOG").unwrap_or_else(|_| filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let engine = Engine::from_config(EngineConfig::from_env())
        .with_reporter(Arc::new(ConsoleReporter::new(cli.quiet)));
    let cwd = current_dir()?;

    let (invocation, inputs, callback) = match cli.command {
        Commands::Stop => {
            engine.shutdown(&cwd).await?;
            return Ok(());
        }
        Commands::Run { action, inputs } => (Invocation::Action(action), inputs, None),
        Commands::Subscribe { action, event, inputs, callback } => {
            (Invocation::Subscribe { action, event }, inputs, callback)
        }
        Commands::Unsubscribe { action, event, inputs } => {
            (Invocation::Unsubscribe { action, event }, inputs, None)
        }
    };

    let Some(image) = cli.image else {
        bail!("--image is required for this command");
    };
    let microservice = load_descriptor(&cli.descriptor)?;
    let request = ExecRequest {
        image,
        arguments: to_map(inputs.args),
        environment: to_map(inputs.env),
        cwd,
        callback,
    };

    let output = engine.run(&microservice, &invocation, request).await?;
    match output {
        serde_json::Value::String(s) => println!("{s}"),
        other => println!("{}", serde_json::to_string_pretty(&other)?),
    }
    Ok(())
}

fn load_descriptor(path: &Path) -> Result<Microservice> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read descriptor {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid descriptor {}", path.display()))
}

fn current_dir() -> Result<String> {
    let dir = std::env::current_dir().context("failed to resolve working directory")?;
    let dir = dir.canonicalize().unwrap_or(dir);
    Ok(dir.to_string_lossy().into_owned())
}

fn to_map(pairs: Vec<(String, String)>) -> HashMap<String, String> {
    pairs.into_iter().collect()
}

fn parse_pair(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected NAME=VALUE, got `{raw}`")),
    }
}
