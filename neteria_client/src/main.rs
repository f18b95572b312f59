//! Standalone echo client binary.
//!
//! Usage:
//!   cargo run -p neteria_client -- [--server-port 40080] [--compression] [--encryption] [--auto-register]
//!
//! Discovers a server on the local broadcast domain, registers, then reads
//! lines from stdin and submits each as a `normal`-priority event.
//! CTRL+C to quit.

use std::env;
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use neteria_client::ClientEngine;
use neteria_shared::config::ClientConfig;
use neteria_shared::message::Priority;
use tokio::sync::mpsc;
use tracing::{info, warn};

struct Args {
    server_port: u16,
    compression: bool,
    encryption: bool,
    auto_register: bool,
}

fn parse_args() -> Args {
    let mut server_port = 40080;
    let mut compression = false;
    let mut encryption = false;
    let mut auto_register = true;

    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--server-port" if i + 1 < args.len() => {
                server_port = args[i + 1].parse().unwrap_or(server_port);
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
            "--no-auto-register" => {
                auto_register = false;
                i += 1;
            }
            _ => i += 1,
        }
    }

    Args { server_port, compression, encryption, auto_register }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args();
    let config = ClientConfig {
        server_port: args.server_port,
        compression: args.compression,
        encryption: args.encryption,
        ..ClientConfig::default()
    };

    let client = ClientEngine::bind(config).await.context("bind client")?;
    info!(cuuid = %client.cuuid(), local = ?client.local_addr()?, "Neteria client starting");

    let engine = client.clone();
    let run_handle = tokio::spawn(async move {
        if let Err(e) = engine.run().await {
            warn!(error = %e, "receive loop ended");
        }
    });

    client.discover(args.auto_register).await.context("send discovery broadcast")?;
    println!("Discovering servers on the broadcast domain...");

    // Give discovery/registration a moment to land before accepting input.
    for _ in 0..20 {
        if client.is_registered().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    if client.is_registered().await {
        println!("Registered. Type a line and press enter to submit a normal-priority event.");
    } else {
        println!("Not registered yet; events submitted before registration are dropped.");
    }

    let (line_tx, mut line_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) if !line.trim().is_empty() => {
                    if line_tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    });

    while let Some(line) = line_rx.recv().await {
        match client
            .event(serde_json::json!({"text": line}), Priority::Normal)
            .await
        {
            Some(euuid) => info!(%euuid, "event submitted"),
            None => println!("Not registered yet, dropping event."),
        }
    }

    run_handle.abort();
    Ok(())
}
