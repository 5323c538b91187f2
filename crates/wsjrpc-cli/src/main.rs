//! # wsjrpc-cli
//!
//! Interactive peer: connects to a hub, exposes `greet`, prints `hello`
//! notifications, and reads commands from stdin.

#![deny(unsafe_code)]

mod command;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use wsjrpc_client::{Peer, PeerBuilder};
use wsjrpc_rpc::handler_fn;
use wsjrpc_rpc::params::require_str;

use crate::command::{Command, USAGE, parse_command};

/// Interactive JSON-RPC hub peer.
#[derive(Parser, Debug)]
#[command(name = "wsjrpc-cli", about = "Interactive JSON-RPC hub peer")]
struct Cli {
    /// Hub URL (defaults to the `client.url` setting).
    #[arg(long)]
    url: Option<String>,

    /// Name to introduce as (defaults to `cli@<pid>`).
    #[arg(long)]
    name: Option<String>,
}

fn default_name() -> String {
    format!("cli@{}", std::process::id())
}

fn render(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Execute one command; returns `false` when the REPL should stop.
async fn run_command(peer: &Peer, command: Command) -> bool {
    match command {
        Command::Invoke { method, params } => match peer.invoke(&method, params).await {
            Ok(result) => println!("{}", render(&result)),
            Err(error) => println!("error {}: {error}", error.code()),
        },
        Command::Notice { method, params } => {
            if let Err(error) = peer.notify(&method, params) {
                println!("error: {error}");
            }
        }
        Command::Help => println!("{USAGE}"),
        Command::Exit => return false,
        Command::Empty => {}
    }
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = wsjrpc_settings::load_settings().context("Failed to load settings")?;
    wsjrpc_logging::init_subscriber(settings.logging.level, settings.logging.format);

    let url = args.url.unwrap_or(settings.client.url);
    let name = args
        .name
        .or(settings.client.name)
        .unwrap_or_else(default_name);

    let peer = PeerBuilder::new(name.clone())
        .description("interactive cli")
        .call_timeout(settings.rpc.call_timeout())
        .expose(
            "greet",
            handler_fn(|params, _ctx| async move {
                require_str(params.as_ref(), "name").map(|who| json!(format!("hello {who}")))
            }),
        )
        .subscribe("hello", |_event, params| {
            println!("hello: {}", params.as_ref().map_or_else(String::new, render));
        })
        .connect(&url)
        .await
        .with_context(|| format!("Failed to connect to {url}"))?;

    println!("connected to {url} as {name}");
    println!("{USAGE}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            () = peer.closed() => {
                println!("hub closed the connection");
                break;
            }
        };
        let Some(line) = line else { break };
        match parse_command(&line) {
            Ok(command) => {
                if !run_command(&peer, command).await {
                    break;
                }
            }
            Err(error) => {
                println!("{error}");
                if matches!(error, command::CommandError::Unknown(_)) {
                    println!("{USAGE}");
                }
            }
        }
    }

    peer.close().await;
    Ok(())
}
