//! Sandbox RPC peer - serves or calls an RPC channel over TCP.
//!
//! `serve` plays the sandbox side: every accepted connection gets its own
//! channel exposing the demo handler table. `call` plays the host side for a
//! single call and prints the result as JSON.

mod handlers;
mod server;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sandbox_rpc::{Channel, Handlers, PeerConfig, StreamTransport};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "sandbox-rpc-peer")]
#[command(about = "TCP peer for the sandbox RPC channel")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the demo handlers to every connecting peer
    Serve {
        /// Port to listen on (0 = auto-assign)
        #[arg(short, long, default_value = "0")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = PeerConfig::DEFAULT_HOST)]
        host: String,

        /// Channel identifier to serve
        #[arg(long, default_value = PeerConfig::DEFAULT_CHANNEL)]
        channel: String,
    },
    /// Connect to a serving peer and perform one call
    Call {
        /// Address of the serving peer
        #[arg(long)]
        addr: SocketAddr,

        /// Channel identifier to call on
        #[arg(long, default_value = PeerConfig::DEFAULT_CHANNEL)]
        channel: String,

        /// Give up after this many milliseconds (waits forever if unset)
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Operation name
        handler: String,

        /// Arguments; each is parsed as JSON, falling back to a plain string
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries the port line and call results.
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match args.command {
        Command::Serve {
            port,
            host,
            channel,
        } => serve(&host, port, channel).await,
        Command::Call {
            addr,
            channel,
            timeout_ms,
            handler,
            args,
        } => call(addr, channel, timeout_ms, handler, args).await,
    }
}

async fn serve(host: &str, port: u16, channel: String) -> Result<()> {
    info!("Starting sandbox RPC peer");

    let mut handle = server::start_server(host, port, channel).await?;

    // Print port for a parent process to read (intentional stdout)
    println!("{}{}", PeerConfig::PORT_LINE_PREFIX, handle.addr().port());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    handle.shutdown();

    Ok(())
}

async fn call(
    addr: SocketAddr,
    channel_id: String,
    timeout_ms: Option<u64>,
    handler: String,
    raw_args: Vec<String>,
) -> Result<()> {
    let transport = StreamTransport::connect(addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;
    let channel = Channel::new(Arc::new(transport), channel_id);
    channel.start(Handlers::new()).await?;

    let args = raw_args.iter().map(|raw| parse_arg(raw)).collect();
    let pending = channel.call(handler.as_str(), args);
    let result = match timeout_ms {
        Some(ms) => tokio::time::timeout(Duration::from_millis(ms), pending)
            .await
            .with_context(|| format!("call to {handler} timed out after {ms}ms"))??,
        None => pending.await?,
    };

    println!("{}", serde_json::to_string(&result)?);
    channel.stop()?;
    Ok(())
}

fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_arg() {
        assert_eq!(parse_arg("21"), json!(21));
        assert_eq!(parse_arg(r#"{"a":1}"#), json!({"a": 1}));
        assert_eq!(parse_arg("hello"), json!("hello"));
        assert_eq!(parse_arg(r#""quoted""#), json!("quoted"));
    }

    #[test]
    fn test_cli_parses_call() {
        let args = Args::parse_from([
            "sandbox-rpc-peer",
            "call",
            "--addr",
            "127.0.0.1:9000",
            "double",
            "21",
        ]);
        match args.command {
            Command::Call {
                addr,
                channel,
                handler,
                args,
                timeout_ms,
            } => {
                assert_eq!(addr.port(), 9000);
                assert_eq!(channel, PeerConfig::DEFAULT_CHANNEL);
                assert_eq!(handler, "double");
                assert_eq!(args, vec!["21".to_string()]);
                assert_eq!(timeout_ms, None);
            }
            other => panic!("Expected Call, got: {:?}", other),
        }
    }
}
