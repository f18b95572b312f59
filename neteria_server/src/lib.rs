//! `neteria_server`
//!
//! Server-side engine: discovery replies, registration admission with
//! per-`ClientId` session tracking, event adjudication through a
//! caller-supplied policy hook, and notification delivery -- all driven by
//! the same retry/retransmission machinery as the client engine.

pub mod server;

pub use server::{ClientRegistryEntry, ServerEngine};
