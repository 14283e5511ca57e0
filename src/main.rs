// src/main.rs

//! Command-line client: connects, runs one request, prints the result as JSON.

use anyhow::{Context, Result, anyhow, bail};
use std::env;
use std::path::Path;
use tntwire::config::ClientConfig;
use tntwire::connection::{IndexRef, SpaceRef};
use tntwire::{Connection, SelectOptions, Value};
use tracing::{debug, error};
use tracing_subscriber::filter::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "tntwire.toml";

const USAGE: &str = "Usage: tntwire [--config PATH] [--host HOST] [--port PORT] <command>

Commands:
  ping
  call NAME [JSON-ARGS]
  eval EXPR [JSON-ARGS]
  select SPACE [INDEX]";

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().skip(1).collect();

    if args.iter().any(|a| a == "--version") {
        println!("tntwire version {VERSION}");
        return Ok(());
    }
    if args.is_empty() || args.iter().any(|a| a == "--help" || a == "-h") {
        println!("{USAGE}");
        return Ok(());
    }

    let (config, command) = match parse_args(&args) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("{e}\n\n{USAGE}");
            std::process::exit(2);
        }
    };

    // Logs go to stderr so stdout carries only the JSON result.
    let log_level = env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .with_writer(std::io::stderr)
        .compact()
        .with_ansi(true)
        .init();

    if let Err(e) = run(config, command).await {
        error!("{e:#}");
        return Err(e);
    }
    Ok(())
}

#[derive(Debug)]
enum Command {
    Ping,
    Call { name: String, args: Vec<Value> },
    Eval { expr: String, args: Vec<Value> },
    Select { space: String, index: Option<String> },
}

fn parse_args(args: &[String]) -> Result<(ClientConfig, Command)> {
    let mut config_path: Option<&str> = None;
    let mut host: Option<&str> = None;
    let mut port: Option<u16> = None;
    let mut positional: Vec<&str> = Vec::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                config_path = Some(
                    iter.next()
                        .map(String::as_str)
                        .context("--config flag requires a value")?,
                );
            }
            "--host" => {
                host = Some(
                    iter.next()
                        .map(String::as_str)
                        .context("--host flag requires a value")?,
                );
            }
            "--port" => {
                let value = iter.next().context("--port flag requires a value")?;
                port = Some(
                    value
                        .parse()
                        .map_err(|_| anyhow!("Invalid port number: {value}"))?,
                );
            }
            other => positional.push(other),
        }
    }

    let mut config = match config_path {
        Some(path) => ClientConfig::from_file(path)?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            ClientConfig::from_file(DEFAULT_CONFIG_PATH)?
        }
        None => ClientConfig::default(),
    };
    if let Some(host) = host {
        config.host = host.to_string();
    }
    if let Some(port) = port {
        config.port = port;
    }
    config.validate()?;

    let command = match positional.as_slice() {
        ["ping"] => Command::Ping,
        ["call", name, rest @ ..] => Command::Call {
            name: name.to_string(),
            args: parse_json_args(rest)?,
        },
        ["eval", expr, rest @ ..] => Command::Eval {
            expr: expr.to_string(),
            args: parse_json_args(rest)?,
        },
        ["select", space] => Command::Select {
            space: space.to_string(),
            index: None,
        },
        ["select", space, index] => Command::Select {
            space: space.to_string(),
            index: Some(index.to_string()),
        },
        [] => bail!("No command given"),
        other => bail!("Unrecognized command: {}", other.join(" ")),
    };
    Ok((config, command))
}

/// Parses an optional JSON array into call arguments.
fn parse_json_args(rest: &[&str]) -> Result<Vec<Value>> {
    let Some(raw) = rest.first() else {
        return Ok(Vec::new());
    };
    if rest.len() > 1 {
        bail!("Arguments must be given as a single JSON array");
    }
    let json: serde_json::Value =
        serde_json::from_str(raw).with_context(|| format!("Invalid JSON arguments: {raw}"))?;
    let serde_json::Value::Array(items) = json else {
        bail!("Arguments must be a JSON array");
    };
    items
        .into_iter()
        .map(|item| rmpv::ext::to_value(item).context("Unsupported argument value"))
        .collect()
}

async fn run(config: ClientConfig, command: Command) -> Result<()> {
    debug!("Connecting to {}", config.address());
    let connection = Connection::open(config)
        .await
        .context("Failed to connect")?;

    let outcome = execute(&connection, command).await;
    connection.close().await;

    let rows = outcome?;
    let json = serde_json::to_string_pretty(&Value::Array(rows))?;
    println!("{json}");
    Ok(())
}

async fn execute(connection: &Connection, command: Command) -> Result<Vec<Value>> {
    let rows = match command {
        Command::Ping => {
            let response = connection.ping(None).await?;
            debug!("Ping answered with sync={}", response.sync);
            Vec::new()
        }
        Command::Call { name, args } => connection.call(&name, args, None).await?.into_rows(),
        Command::Eval { expr, args } => connection.eval(&expr, args, None).await?.into_rows(),
        Command::Select { space, index } => {
            let space = match space.parse::<u32>() {
                Ok(id) => SpaceRef::Id(id),
                Err(_) => SpaceRef::Name(space),
            };
            let index = match index {
                Some(index) => match index.parse::<u32>() {
                    Ok(id) => IndexRef::Id(id),
                    Err(_) => IndexRef::Name(index),
                },
                None => IndexRef::default(),
            };
            connection
                .select(space, index, Vec::new(), SelectOptions::all())
                .await?
                .collect_rows()
                .await?
        }
    };
    Ok(rows)
}
