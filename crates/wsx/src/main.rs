//! # wsx
//!
//! Command-line entry point: `wsx serve` runs the demo echo/rooms server,
//! `wsx echo` sends a single echo and prints the reply.

#![deny(unsafe_code)]

mod demo;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tracing::{info, warn};
use wsx_client::{Client, ClientOptions};
use wsx_core::CloseInfo;
use wsx_core::logging::{LogFormat, init_subscriber};
use wsx_server::{Server, ServerConfig, ServerOptions, load_config};

/// Typed publish/subscribe over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "wsx", about = "Typed publish/subscribe over WebSocket", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the demo echo/rooms server.
    Serve(ServeArgs),
    /// Send one `echo` message and print the reply.
    Echo(EchoArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// JSON config file, merged over the defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides config and `WSX_HOST`).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides config and `WSX_PORT`).
    #[arg(long)]
    port: Option<u16>,
}

impl ServeArgs {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
    }
}

#[derive(Args, Debug)]
struct EchoArgs {
    /// Server URL, e.g. `ws://127.0.0.1:8080/ws`.
    #[arg(long)]
    url: String,

    /// Text to echo.
    #[arg(long)]
    text: String,

    /// Seconds to wait for the reply.
    #[arg(long, default_value_t = 5)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Echo(args) => echo(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref()).context("failed to load configuration")?;
    args.apply(&mut config);
    init_subscriber(&config.log_level, config.log_format);

    let metrics =
        wsx_server::metrics::install_recorder().context("failed to install metrics recorder")?;
    let server = Server::new(ServerOptions::with_config(config).plugin(move |server| {
        server.set_metrics_handle(metrics);
        demo::install(server.hub());
    }));
    let handle = server.listen().await.context("failed to bind listener")?;
    info!(url = %handle.url(), "ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    if !handle.shutdown(None).await {
        warn!("some sessions did not close in time");
    }
    Ok(())
}

async fn echo(args: EchoArgs) -> Result<()> {
    init_subscriber("warn", LogFormat::Compact);

    let client = Client::new(args.url, ClientOptions::default());
    let (tx, rx) = oneshot::channel();
    let _ = client.once("echo", move |payload| {
        let _ = tx.send(payload.cloned());
    });

    client.connect().await.context("failed to connect")?;
    client.send("echo", json!({ "text": args.text }))?;

    let deadline = Duration::from_secs(args.timeout_secs);
    let reply = tokio::time::timeout(deadline, rx)
        .await
        .context("timed out waiting for echo")?
        .context("connection closed before the reply")?;
    println!("{}", reply_text(reply.as_ref()).unwrap_or_default());

    let _ = client.disconnect(CloseInfo::NORMAL, "done");
    if tokio::time::timeout(deadline, client.closed()).await.is_err() {
        warn!("close handshake did not finish");
    }
    Ok(())
}

fn reply_text(payload: Option<&Value>) -> Option<&str> {
    payload?.get("text")?.as_str()
}
