//! rscx - statechart runner
//!
//! Runs a chart definition to completion with a scripted list of events, or
//! checks that a definition compiles.

use clap::{Parser, Subcommand};
use rscx_core::{ChartDefinition, Event, EventName};
use rscx_runtime::{Config, DispatchRouter, SessionOptions, SessionStatus};
use rscx_value::{Object, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rscx")]
#[command(about = "Hierarchical statechart runner")]
#[command(version)]
struct Cli {
    /// YAML config file (overrides RSCX_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a chart, feeding it the given events in order
    Run {
        /// Chart definition (.json, .yaml or .yml)
        chart: PathBuf,

        /// Event to send, as NAME or NAME=JSON (repeatable)
        #[arg(short, long = "event")]
        events: Vec<String>,

        /// JSON object overriding top-level data declarations
        #[arg(short, long)]
        args: Option<String>,

        /// Log state entry, exit and transitions
        #[arg(long)]
        trace: bool,
    },

    /// Validate and compile a chart without running it
    Check {
        /// Chart definition (.json, .yaml or .yml)
        chart: PathBuf,
    },

    /// Write the default configuration to a file
    InitConfig {
        /// Output path
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { chart } => {
            let definition = load_chart(&chart)?;
            let model = definition.compile()?;
            println!(
                "{}: ok ({} states, checksum {})",
                chart.display(),
                model.state_count(),
                model.checksum
            );
        }
        Commands::InitConfig { path } => {
            Config::default().save(&path)?;
            tracing::info!("Wrote default configuration to {}", path.display());
        }
        Commands::Run {
            chart,
            events,
            args,
            trace,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            config.session.tracing_enabled |= trace;
            // A scripted run has no further events to wait for.
            config.session.idle_timeout_ms = 0;

            let status = run_chart(config, &chart, &events, args.as_deref()).await?;
            if !matches!(status, SessionStatus::Completed | SessionStatus::QueueClosed) {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<Config, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => {
            let mut config = Config::from_file(path)?;
            config.apply_env_overrides();
            config.validate()?;
            tracing::info!("Loaded config from {}", path.display());
            config
        }
        None => Config::load()?,
    };
    Ok(config)
}

fn load_chart(path: &Path) -> Result<ChartDefinition, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)?;
    let definition = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => serde_yaml::from_str(&text)?,
        _ => ChartDefinition::from_json_str(&text)?,
    };
    Ok(definition)
}

/// Parses `NAME` or `NAME=JSON`.
fn parse_event(arg: &str) -> Result<Event, Box<dyn std::error::Error>> {
    let (name, data) = match arg.split_once('=') {
        Some((name, json)) => (name, Some(serde_json::from_str::<serde_json::Value>(json)?)),
        None => (arg, None),
    };
    let mut event = Event::external(EventName::parse(name.trim())?);
    if let Some(data) = data {
        event = event.with_data(Value::from_json(&data));
    }
    Ok(event)
}

fn parse_args(json: &str) -> Result<Object, Box<dyn std::error::Error>> {
    match Value::from_json(&serde_json::from_str(json)?) {
        Value::Object(obj) => Ok(obj),
        other => Err(format!("--args must be a JSON object, got {}", other.type_name()).into()),
    }
}

async fn run_chart(
    config: Config,
    chart: &Path,
    events: &[String],
    args: Option<&str>,
) -> Result<SessionStatus, Box<dyn std::error::Error>> {
    let definition = load_chart(chart)?;
    let name = definition
        .name
        .clone()
        .unwrap_or_else(|| chart.display().to_string());
    let events = events
        .iter()
        .map(|e| parse_event(e))
        .collect::<Result<Vec<_>, _>>()?;

    let router = DispatchRouter::new(config)?;
    router.register_chart(name.clone(), definition.compile()?);

    let mut options = SessionOptions::default();
    if let Some(args) = args {
        options = options.with_arguments(parse_args(args)?);
    }
    let session = router.create_session(&name, options)?;
    session.start().await?;
    tracing::info!("Session {} accepted", session.session_id());

    for event in events {
        session.send(event)?;
    }
    session.close();

    let outcome = session.execute().await;
    router.shutdown();

    let result = match outcome.result.to_json() {
        Ok(json) => json,
        Err(e) => serde_json::Value::String(format!("<{}>", e)),
    };
    let report = serde_json::json!({
        "session": session.session_id().as_str(),
        "status": outcome.status,
        "result": result,
        "error": outcome.error,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(outcome.status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_event() {
        let plain = parse_event("go").unwrap();
        assert_eq!(plain.name.to_string(), "go");
        assert!(plain.data.is_undefined());

        let with_data = parse_event("order.placed={\"qty\": 2}").unwrap();
        assert_eq!(with_data.name.to_string(), "order.placed");
        assert_eq!(with_data.data.get_path(&["qty"]), Value::Number(2.0));

        assert!(parse_event("bad name").is_err());
        assert!(parse_event("x={oops").is_err());
    }

    #[test]
    fn test_parse_args_requires_object() {
        let args = parse_args("{\"limit\": 3}").unwrap();
        assert_eq!(args.get("limit"), Value::Number(3.0));
        assert!(parse_args("[1, 2]").is_err());
    }

    #[test]
    fn test_load_yaml_chart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("door.yaml");
        std::fs::write(
            &path,
            "name: door\nstates:\n  - id: closed\n    transitions:\n      - event: open\n        target: opened\n  - id: opened\n",
        )
        .unwrap();
        let definition = load_chart(&path).unwrap();
        assert_eq!(definition.name.as_deref(), Some("door"));
        assert!(definition.compile().unwrap().state_by_id("opened").is_some());
    }
}
