//! Standalone echo server binary.
//!
//! Usage:
//!   cargo run -p neteria_server -- [--addr 0.0.0.0:40080] [--compression] [--encryption]
//!
//! Accepts every event as legal and prints its data. CTRL+C to quit.

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use neteria_server::ServerEngine;
use neteria_shared::config::ServerConfig;
use neteria_shared::ids::{ClientId, EventId};
use neteria_shared::policy::Policy;
use serde_json::Value;
use tracing::info;

/// Accepts every event as legal and prints its data.
struct EchoPolicy;

#[async_trait]
impl Policy for EchoPolicy {
    fn event_legal(&self, _cuuid: ClientId, _euuid: EventId, _event_data: &Value) -> bool {
        true
    }

    async fn event_execute(&self, cuuid: ClientId, euuid: EventId, event_data: Value) {
        println!("<{cuuid}> <{euuid}> {event_data}");
    }
}

struct Args {
    addr: SocketAddr,
    compression: bool,
    encryption: bool,
}

fn parse_args() -> Args {
    let mut addr: SocketAddr = "0.0.0.0:40080".parse().unwrap();
    let mut compression = false;
    let mut encryption = false;

    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                addr = args[i + 1].parse().unwrap_or(addr);
                i += 2;
            }
            "--compression" => {
                compression = true;
                i += 1;
            }
            "--encryption" => {
                encryption = true;
                i += 1;
            }
            _ => i += 1,
        }
    }

    Args { addr, compression, encryption }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args();
    let config = ServerConfig {
        listen_address: args.addr.ip().to_string(),
        listen_port: args.addr.port(),
        compression: args.compression,
        encryption: args.encryption,
        ..ServerConfig::default()
    };

    let server = ServerEngine::bind(config, Arc::new(EchoPolicy)).await.context("bind server")?;
    let local = server.local_addr()?;
    info!(%local, "Neteria server listening");
    println!("Server started. Press CTRL+C to quit.");

    server.run().await.context("server receive loop")?;
    Ok(())
}
