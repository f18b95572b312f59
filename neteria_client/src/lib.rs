//! `neteria_client`
//!
//! Client-side engine: discovery, registration with optional confidentiality,
//! and event submission with automatic retry over UDP.

pub mod client;

pub use client::ClientEngine;
