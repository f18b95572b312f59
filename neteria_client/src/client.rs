//! Client engine: discovery, registration, and event submission.
//!
//! One struct owns the transport plus connection state behind a
//! `tokio::sync::Mutex`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use neteria_shared::codec::Codec;
use neteria_shared::config::ClientConfig;
use neteria_shared::crypto::{KeyPair, PublicKeyParams};
use neteria_shared::error::Result;
use neteria_shared::ids::{ClientId, EventId};
use neteria_shared::message::{EncryptionParams, Message, Priority};
use neteria_shared::scheduler::Scheduler;
use neteria_shared::transport::{SendMode, Transport};

/// The client's connection state. `Unregistered` is re-entered only
/// after retry exhaustion or an explicit `BYE REGISTER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Unregistered,
    Registering,
    Registered,
}

/// One event the client is waiting to have acknowledged.
#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub method: String,
    pub event_data: Value,
    pub priority: Priority,
    pub retry_count: u32,
}

struct State {
    conn_state: ConnState,
    registered: bool,
    server_address: Option<SocketAddr>,
    server_public_key: Option<PublicKeyParams>,
    register_retries: u32,
    auto_register: bool,
    pending_events: HashMap<EventId, PendingEvent>,
    rollbacks: HashMap<EventId, PendingEvent>,
    notify_inbox: HashMap<EventId, Value>,
    event_confirmations: HashMap<EventId, PendingEvent>,
    discovered: HashMap<SocketAddr, (String, String)>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            conn_state: ConnState::Unregistered,
            registered: false,
            server_address: None,
            server_public_key: None,
            register_retries: 0,
            auto_register: false,
            pending_events: HashMap::new(),
            rollbacks: HashMap::new(),
            notify_inbox: HashMap::new(),
            event_confirmations: HashMap::new(),
            discovered: HashMap::new(),
        }
    }
}

struct Inner {
    config: ClientConfig,
    transport: Transport,
    codec: Codec,
    cuuid: ClientId,
    keypair: Option<KeyPair>,
    scheduler: Scheduler,
    state: Mutex<State>,
}

/// The client half of the Neteria protocol. Cheap to clone; everything is
/// shared behind `Arc`, so a retransmit callback scheduled from `event()`
/// can hold its own handle back into the engine.
#[derive(Clone)]
pub struct ClientEngine {
    inner: Arc<Inner>,
}

impl ClientEngine {
    pub async fn bind(config: ClientConfig) -> Result<Self> {
        let bind_addr: SocketAddr =
            format!("{}:{}", config.listen_address, config.resolved_listen_port())
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
                cuuid: ClientId::new(),
                keypair,
                scheduler: Scheduler::new(),
                state: Mutex::new(State::default()),
            }),
        })
    }

    pub fn cuuid(&self) -> ClientId {
        self.inner.cuuid
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.transport.local_addr()
    }

    pub async fn is_registered(&self) -> bool {
        self.inner.state.lock().await.registered
    }

    pub async fn discovered_servers(&self) -> HashMap<SocketAddr, (String, String)> {
        self.inner.state.lock().await.discovered.clone()
    }

    pub async fn notify_inbox(&self) -> HashMap<EventId, Value> {
        self.inner.state.lock().await.notify_inbox.clone()
    }

    pub async fn rollbacks(&self) -> HashMap<EventId, PendingEvent> {
        self.inner.state.lock().await.rollbacks.clone()
    }

    pub async fn event_confirmations(&self) -> HashMap<EventId, PendingEvent> {
        self.inner.state.lock().await.event_confirmations.clone()
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

    /// Broadcasts an `OHAI` to discover servers. If `auto_register` is
    /// set, the client registers with the first server that answers.
    pub async fn discover(&self, auto_register: bool) -> Result<()> {
        {
            let mut state = self.inner.state.lock().await;
            state.auto_register = auto_register;
        }
        let msg = Message::Ohai {
            cuuid: self.inner.cuuid,
            version: self.inner.config.version.clone(),
        };
        let bytes = self.inner.codec.encode(&msg, None).map_err(to_neteria_err)?;
        let dest: SocketAddr = format!("255.255.255.255:{}", self.inner.config.server_port)
            .parse()
            .expect("broadcast address is always valid");
        self.inner.transport.send(&bytes, dest, SendMode::Broadcast).await
    }

    /// Sends `REGISTER` to `address`. `retry` true means this is the
    /// caller's initial attempt (resets the retry counter); a false value
    /// is used internally by the retransmit loop.
    pub async fn register(&self, address: SocketAddr, retry: bool) -> Result<()> {
        let encryption = if self.inner.config.encryption {
            self.inner.keypair.as_ref().map(|k| k.public_params().to_wire())
        } else {
            None
        };

        {
            let mut state = self.inner.state.lock().await;
            if retry {
                state.register_retries = 0;
                state.conn_state = ConnState::Registering;
            }
        }

        let msg = Message::Register {
            cuuid: self.inner.cuuid,
            encryption,
        };
        // REGISTER is always sent in the clear (compression still applies):
        // neither side has the other's confirmed key yet.
        let bytes = self.inner.codec.encode(&msg, None).map_err(to_neteria_err)?;
        self.inner.transport.send(&bytes, address, SendMode::Unicast).await?;

        let this = self.clone();
        let timeout = self.inner.config.timeout();
        self.inner
            .scheduler
            .call_later(timeout, move || async move {
                this.retransmit_register(address).await;
            })
            .await;
        Ok(())
    }

    async fn retransmit_register(&self, address: SocketAddr) {
        let mut state = self.inner.state.lock().await;
        if state.registered || state.conn_state != ConnState::Registering {
            return;
        }
        if state.register_retries >= self.inner.config.max_retries {
            state.conn_state = ConnState::Unregistered;
            tracing::warn!(%address, "register retries exhausted, giving up");
            return;
        }
        state.register_retries += 1;
        drop(state);

        if let Err(e) = self.register(address, false).await {
            tracing::warn!(error = %e, "failed to retransmit REGISTER");
        }
    }

    /// Submits an event for server adjudication. Returns `None` when the
    /// client is not registered.
    pub async fn event(&self, event_data: Value, priority: Priority) -> Option<EventId> {
        let (server_address, registered) = {
            let state = self.inner.state.lock().await;
            (state.server_address, state.registered)
        };
        if !registered {
            return None;
        }
        let server_address = server_address?;

        let euuid = EventId::new();
        let msg = Message::Event {
            cuuid: self.inner.cuuid,
            euuid,
            event_data: event_data.clone(),
            timestamp: chrono::Utc::now().to_string(),
            priority,
            retry: 0,
        };

        let peer_key = self.inner.state.lock().await.server_public_key.clone();
        let bytes = self.inner.codec.encode(&msg, peer_key.as_ref()).ok()?;
        if self
            .inner
            .transport
            .send(&bytes, server_address, SendMode::Unicast)
            .await
            .is_err()
        {
            return None;
        }

        {
            let mut state = self.inner.state.lock().await;
            state.pending_events.insert(
                euuid,
                PendingEvent {
                    method: "EVENT".to_string(),
                    event_data,
                    priority,
                    retry_count: 0,
                },
            );
        }

        let this = self.clone();
        let timeout = self.inner.config.timeout();
        self.inner
            .scheduler
            .call_later(timeout, move || async move {
                this.retransmit_event(euuid).await;
            })
            .await;

        Some(euuid)
    }

    async fn retransmit_event(&self, euuid: EventId) {
        let (server_address, pending) = {
            let state = self.inner.state.lock().await;
            (state.server_address, state.pending_events.get(&euuid).cloned())
        };
        let Some(mut pending) = pending else {
            return; // already acknowledged
        };
        let Some(server_address) = server_address else {
            return;
        };

        if pending.retry_count >= self.inner.config.max_retries {
            self.inner.state.lock().await.pending_events.remove(&euuid);
            tracing::warn!(%euuid, "event retries exhausted, dropping silently");
            return;
        }
        pending.retry_count += 1;

        let msg = Message::Event {
            cuuid: self.inner.cuuid,
            euuid,
            event_data: pending.event_data.clone(),
            timestamp: chrono::Utc::now().to_string(),
            priority: pending.priority,
            retry: pending.retry_count,
        };
        let peer_key = self.inner.state.lock().await.server_public_key.clone();
        if let Ok(bytes) = self.inner.codec.encode(&msg, peer_key.as_ref()) {
            let _ = self
                .inner
                .transport
                .send(&bytes, server_address, SendMode::Unicast)
                .await;
        }

        {
            let mut state = self.inner.state.lock().await;
            if let Some(entry) = state.pending_events.get_mut(&euuid) {
                *entry = pending;
            }
        }

        let this = self.clone();
        let timeout = self.inner.config.timeout();
        self.inner
            .scheduler
            .call_later(timeout, move || async move {
                this.retransmit_event(euuid).await;
            })
            .await;
    }

    async fn reply(&self, msg: &Message, dest: SocketAddr) {
        let peer_key = self.inner.state.lock().await.server_public_key.clone();
        if let Ok(bytes) = self.inner.codec.encode(msg, peer_key.as_ref()) {
            let _ = self.inner.transport.send(&bytes, dest, SendMode::Unicast).await;
        }
    }

    /// Dispatches one inbound datagram. Decode failures and unrecognized
    /// methods are dropped without reply, per protocol.
    pub async fn handle_incoming(&self, payload: Vec<u8>, source: SocketAddr) {
        // Only attempt decryption once the encrypted channel is actually
        // established (we know the server's key); until then, treat every
        // inbound datagram as compressed-but-plaintext.
        let channel_established = self.inner.state.lock().await.server_public_key.is_some();
        let keypair = if channel_established {
            self.inner.keypair.as_ref()
        } else {
            None
        };
        let msg = match self.inner.codec.decode(&payload, keypair) {
            Ok(msg) => msg,
            Err(_) => return,
        };

        match msg {
            Message::OhaiClient { version, server_name } => {
                let should_register = {
                    let mut state = self.inner.state.lock().await;
                    state.discovered.insert(source, (version, server_name));
                    if state.auto_register {
                        state.auto_register = false;
                        true
                    } else {
                        false
                    }
                };
                if should_register {
                    if let Err(e) = self.register(source, true).await {
                        tracing::warn!(error = %e, "auto-register failed");
                    }
                }
            }
            Message::OkRegister { encryption } => {
                let mut state = self.inner.state.lock().await;
                state.registered = true;
                state.conn_state = ConnState::Registered;
                state.server_address = Some(source);
                if self.inner.config.encryption {
                    if let Some(params) = encryption.as_ref().and_then(|p| parse_wire_key(p)) {
                        state.server_public_key = Some(params);
                    }
                }
            }
            Message::ByeRegister => {
                let mut state = self.inner.state.lock().await;
                state.registered = false;
                state.conn_state = ConnState::Unregistered;
            }
            Message::Notify { euuid, event_data } => {
                self.inner.state.lock().await.notify_inbox.insert(euuid, event_data);
                self.reply(&Message::OkNotify { cuuid: self.inner.cuuid, euuid }, source)
                    .await;
            }
            Message::Legal { euuid, priority } => {
                let pending = {
                    let mut state = self.inner.state.lock().await;
                    state.pending_events.remove(&euuid)
                };
                if let Some(pending) = pending {
                    if priority == Priority::High {
                        self.inner.state.lock().await.event_confirmations.insert(euuid, pending);
                    }
                }
                self.reply(&Message::OkEvent { cuuid: self.inner.cuuid, euuid }, source)
                    .await;
            }
            Message::Illegal { euuid, priority: _ } => {
                let pending = {
                    let mut state = self.inner.state.lock().await;
                    state.pending_events.remove(&euuid)
                };
                if let Some(pending) = pending {
                    self.inner.state.lock().await.rollbacks.insert(euuid, pending);
                }
                self.reply(&Message::OkEvent { cuuid: self.inner.cuuid, euuid }, source)
                    .await;
            }
            // Everything else (OHAI, REGISTER, EVENT, OK EVENT, OK NOTIFY,
            // BYE EVENT) is server-bound or not meaningful to this side.
            _ => {}
        }
    }
}

fn parse_wire_key(params: &EncryptionParams) -> Option<PublicKeyParams> {
    PublicKeyParams::from_wire(params).ok()
}

fn to_neteria_err(e: neteria_shared::codec::CodecError) -> neteria_shared::error::NeteriaError {
    neteria_shared::error::NeteriaError::Crypto(e.to_string())
}
