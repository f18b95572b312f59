//! Server engine: discovery replies, registration admission, event
//! adjudication, and notification delivery.
//!
//! One struct owns the `Transport` plus the registry and in-flight
//! `HashMap`s, with `tracing` events at each state transition.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

use neteria_shared::codec::Codec;
use neteria_shared::config::ServerConfig;
use neteria_shared::crypto::{KeyPair, PublicKeyParams};
use neteria_shared::error::Result;
use neteria_shared::ids::{ClientId, EventId};
use neteria_shared::message::{Message, Priority};
use neteria_shared::policy::Policy;
use neteria_shared::scheduler::Scheduler;
use neteria_shared::transport::{SendMode, Transport};

/// A client's registration record, keyed by `ClientId` (not address) so a
/// client that changes address keeps its session across a re-register.
#[derive(Debug, Clone)]
pub struct ClientRegistryEntry {
    pub address: SocketAddr,
    pub registered_at: DateTime<Utc>,
    pub public_key: Option<PublicKeyParams>,
}

/// One event or notification this side is retrying until acknowledged.
#[derive(Debug, Clone)]
struct ServerPendingEvent {
    cuuid: ClientId,
    response: Vec<u8>,
    retry_count: u32,
}

struct State {
    registry: HashMap<ClientId, ClientRegistryEntry>,
    encrypted_hosts: HashMap<SocketAddr, ClientId>,
    in_flight: HashMap<EventId, ServerPendingEvent>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            registry: HashMap::new(),
            encrypted_hosts: HashMap::new(),
            in_flight: HashMap::new(),
        }
    }
}

struct Inner {
    config: ServerConfig,
    transport: Transport,
    codec: Codec,
    keypair: Option<KeyPair>,
    scheduler: Scheduler,
    policy: Arc<dyn Policy>,
    state: Mutex<State>,
}

/// The server half of the Neteria protocol. Cheap to clone; everything is
/// shared behind `Arc` so a retransmit callback can hold its own handle
/// back into the engine.
#[derive(Clone)]
pub struct ServerEngine {
    inner: Arc<Inner>,
}

impl ServerEngine {
    pub async fn bind(config: ServerConfig, policy: Arc<dyn Policy>) -> Result<Self> {
        let bind_addr: SocketAddr = format!("{}:{}", config.listen_address, config.listen_port)
            .parse()
            .expect("listen_address/listen_port must form a valid socket address");
        let transport = Transport::bind(bind_addr, config.max_datagram_size).await?;
        let codec = Codec::new(config.compression, config.encryption);
        let keypair = if config.encryption {
            Some(KeyPair::generate(config.rsa_key_bits)?)
        } else {
            None
        };

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                transport,
                codec,
                keypair,
                scheduler: Scheduler::new(),
                policy,
                state: Mutex::new(State::default()),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.transport.local_addr()
    }

    pub async fn registry_size(&self) -> usize {
        self.inner.state.lock().await.registry.len()
    }

    pub async fn registered_clients(&self) -> Vec<ClientId> {
        self.inner.state.lock().await.registry.keys().copied().collect()
    }

    /// Runs the receive loop and the scheduler loop concurrently. Returns
    /// only if the receive loop hits a fatal socket error.
    pub async fn run(&self) -> std::io::Result<()> {
        let scheduler = self.inner.scheduler.clone();
        let scheduler_task = tokio::spawn(async move { scheduler.run().await });

        let this = self.clone();
        let recv_result = self
            .inner
            .transport
            .recv_loop(move |payload, source| {
                let this = this.clone();
                async move { this.handle_incoming(payload, source).await }
            })
            .await;

        scheduler_task.abort();
        recv_result
    }

    /// Dispatches one inbound datagram. Decode failures and unrecognized
    /// methods are dropped without reply, per protocol.
    pub async fn handle_incoming(&self, payload: Vec<u8>, source: SocketAddr) {
        let is_encrypted_host = {
            let state = self.inner.state.lock().await;
            state.encrypted_hosts.contains_key(&source)
        };
        let keypair = if is_encrypted_host { self.inner.keypair.as_ref() } else { None };
        let msg = match self.inner.codec.decode(&payload, keypair) {
            Ok(msg) => msg,
            Err(_) => return,
        };

        match msg {
            Message::Ohai { cuuid, version } => self.handle_ohai(cuuid, version, source).await,
            Message::Register { cuuid, encryption } => {
                self.handle_register(cuuid, encryption, source).await
            }
            Message::Event {
                cuuid,
                euuid,
                event_data,
                priority,
                ..
            } => self.handle_event(cuuid, euuid, event_data, priority, source).await,
            Message::OkEvent { euuid, .. } | Message::OkNotify { euuid, .. } => {
                let mut state = self.inner.state.lock().await;
                if state.in_flight.remove(&euuid).is_none() {
                    tracing::debug!(%euuid, "OK EVENT/NOTIFY for unknown or already-settled euuid");
                }
            }
            // OHAI Client, OK REGISTER, BYE REGISTER, LEGAL, ILLEGAL, NOTIFY,
            // BYE EVENT are client-bound and not meaningful here.
            _ => {}
        }
    }

    async fn send_plain(&self, msg: &Message, dest: SocketAddr) {
        if let Ok(bytes) = self.inner.codec.encode(msg, None) {
            let _ = self.inner.transport.send(&bytes, dest, SendMode::Unicast).await;
        }
    }

    async fn handle_ohai(&self, _cuuid: ClientId, version: String, source: SocketAddr) {
        if self.inner.config.allowed_versions.contains(&version) {
            let reply = Message::OhaiClient {
                version: self.inner.config.version.clone(),
                server_name: self.inner.config.server_name.clone(),
            };
            self.send_plain(&reply, source).await;
        } else {
            tracing::warn!(%version, "client version not in allowed_versions");
            self.send_plain(&Message::ByeRegister, source).await;
        }
    }

    async fn handle_register(
        &self,
        cuuid: ClientId,
        encryption: Option<neteria_shared::message::EncryptionParams>,
        source: SocketAddr,
    ) {
        let mut state = self.inner.state.lock().await;

        if state.registry.len() > self.inner.config.registration_limit {
            tracing::warn!(%cuuid, "registration limit exceeded");
            drop(state);
            self.send_plain(&Message::ByeRegister, source).await;
            return;
        }

        let client_key = if self.inner.config.encryption {
            encryption.as_ref().and_then(|p| PublicKeyParams::from_wire(p).ok())
        } else {
            None
        };

        let entry = state.registry.entry(cuuid).or_insert_with(|| ClientRegistryEntry {
            address: source,
            registered_at: Utc::now(),
            public_key: None,
        });
        entry.address = source;
        entry.registered_at = Utc::now();
        if client_key.is_some() {
            entry.public_key = client_key.clone();
        }

        if client_key.is_some() {
            state.encrypted_hosts.insert(source, cuuid);
        }

        let reply_encryption = if self.inner.config.encryption && client_key.is_some() {
            self.inner.keypair.as_ref().map(|k| k.public_params().to_wire())
        } else {
            None
        };
        drop(state);

        self.send_plain(&Message::OkRegister { encryption: reply_encryption }, source).await;
    }

    async fn handle_event(
        &self,
        cuuid: ClientId,
        euuid: EventId,
        event_data: Value,
        priority: Priority,
        source: SocketAddr,
    ) {
        let client_key = {
            let state = self.inner.state.lock().await;

            let registered = state
                .registry
                .get(&cuuid)
                .is_some_and(|entry| entry.address.ip() == source.ip());
            if !registered {
                drop(state);
                tracing::warn!(%cuuid, "EVENT from unregistered client");
                self.send_encrypted_or_plain(
                    &Message::ByeEvent { data: "Not registered".to_string() },
                    source,
                    None,
                )
                .await;
                return;
            }

            if state.in_flight.contains_key(&euuid) {
                tracing::debug!(%cuuid, %euuid, "duplicate in-flight EVENT, dropping silently");
                return;
            }

            state.registry.get(&cuuid).and_then(|e| e.public_key.clone())
        };

        {
            let mut state = self.inner.state.lock().await;
            state.in_flight.insert(
                euuid,
                ServerPendingEvent { cuuid, response: Vec::new(), retry_count: 0 },
            );
        }

        let legal = self.inner.policy.event_legal(cuuid, euuid, &event_data);
        let reply = if legal {
            Message::Legal { euuid, priority }
        } else {
            Message::Illegal { euuid, priority }
        };

        if legal {
            let policy = self.inner.policy.clone();
            tokio::spawn(async move {
                policy.event_execute(cuuid, euuid, event_data).await;
            });
        }

        let Ok(bytes) = self.inner.codec.encode(&reply, client_key.as_ref()) else {
            self.inner.state.lock().await.in_flight.remove(&euuid);
            return;
        };
        let _ = self.inner.transport.send(&bytes, source, SendMode::Unicast).await;

        {
            let mut state = self.inner.state.lock().await;
            if let Some(pending) = state.in_flight.get_mut(&euuid) {
                pending.response = bytes;
            }
        }

        self.schedule_retransmit(euuid).await;
    }

    async fn send_encrypted_or_plain(
        &self,
        msg: &Message,
        dest: SocketAddr,
        peer_key: Option<&PublicKeyParams>,
    ) {
        if let Ok(bytes) = self.inner.codec.encode(msg, peer_key) {
            let _ = self.inner.transport.send(&bytes, dest, SendMode::Unicast).await;
        }
    }

    /// Pushes an unsolicited notification to a registered client, encrypted
    /// with its stored public key if present. Returns `None` if `cuuid`
    /// is not (or no longer) registered.
    pub async fn notify(&self, cuuid: ClientId, event_data: Value) -> Result<Option<EventId>> {
        let (address, client_key) = {
            let state = self.inner.state.lock().await;
            match state.registry.get(&cuuid) {
                Some(entry) => (entry.address, entry.public_key.clone()),
                None => {
                    tracing::warn!(%cuuid, "notify target not found in registry, canceled");
                    return Ok(None);
                }
            }
        };

        let euuid = EventId::new();
        let msg = Message::Notify { euuid, event_data };
        let bytes = self.inner.codec.encode(&msg, client_key.as_ref())?;
        self.inner.transport.send(&bytes, address, SendMode::Unicast).await?;

        {
            let mut state = self.inner.state.lock().await;
            state
                .in_flight
                .insert(euuid, ServerPendingEvent { cuuid, response: bytes, retry_count: 0 });
        }

        self.schedule_retransmit(euuid).await;
        Ok(Some(euuid))
    }

    async fn schedule_retransmit(&self, euuid: EventId) {
        let this = self.clone();
        let timeout = self.inner.config.timeout();
        self.inner
            .scheduler
            .call_later(timeout, move || async move {
                this.retransmit(euuid).await;
            })
            .await;
    }

    /// Retransmit callback: resends the cached response from the *current*
    /// registry address (re-read every retry, not captured at schedule
    /// time) unless the client has left the registry or retries are
    /// exhausted, in which case the in-flight record is deleted silently.
    async fn retransmit(&self, euuid: EventId) {
        let (cuuid, retry_count, response) = {
            let state = self.inner.state.lock().await;
            let Some(pending) = state.in_flight.get(&euuid) else {
                return; // already acknowledged
            };
            (pending.cuuid, pending.retry_count, pending.response.clone())
        };

        let address = {
            let mut state = self.inner.state.lock().await;
            let Some(entry) = state.registry.get(&cuuid) else {
                state.in_flight.remove(&euuid);
                tracing::debug!(%cuuid, %euuid, "client left registry, abandoning retransmit");
                return;
            };
            if retry_count >= self.inner.config.max_retries {
                state.in_flight.remove(&euuid);
                tracing::warn!(%cuuid, %euuid, "event retransmit retries exhausted");
                return;
            }
            let address = entry.address;
            if let Some(pending) = state.in_flight.get_mut(&euuid) {
                pending.retry_count += 1;
            }
            address
        };

        let _ = self.inner.transport.send(&response, address, SendMode::Unicast).await;
        self.schedule_retransmit(euuid).await;
    }
}

/// Binds a loopback server on an OS-assigned ephemeral port, for tests.
pub async fn bind_ephemeral(
    config: ServerConfig,
    policy: Arc<dyn Policy>,
) -> Result<ServerEngine> {
    let mut config = config;
    config.listen_address = "127.0.0.1".to_string();
    config.listen_port = 0;
    ServerEngine::bind(config, policy).await
}
