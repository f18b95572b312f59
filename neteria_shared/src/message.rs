//! Wire message types.
//!
//! Every datagram decodes to one of these variants, discriminated by the
//! `method` field. Field names and the (sometimes space-containing) method
//! strings are part of the wire contract and must not be renamed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ClientId, EventId};

/// Public-key parameters carried on the wire as the two-element array
/// `[n, e]` (decimal-string encoded, since RSA moduli routinely exceed
/// what a JSON number can hold losslessly).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptionParams(pub String, pub String);

impl EncryptionParams {
    pub fn n(&self) -> &str {
        &self.0
    }

    pub fn e(&self) -> &str {
        &self.1
    }
}

/// Priority of a client-submitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Normal,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum Message {
    #[serde(rename = "OHAI")]
    Ohai { cuuid: ClientId, version: String },

    #[serde(rename = "OHAI Client")]
    OhaiClient { version: String, server_name: String },

    #[serde(rename = "REGISTER")]
    Register {
        cuuid: ClientId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        encryption: Option<EncryptionParams>,
    },

    #[serde(rename = "OK REGISTER")]
    OkRegister {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        encryption: Option<EncryptionParams>,
    },

    #[serde(rename = "BYE REGISTER")]
    ByeRegister,

    #[serde(rename = "EVENT")]
    Event {
        cuuid: ClientId,
        euuid: EventId,
        event_data: Value,
        timestamp: String,
        priority: Priority,
        retry: u32,
    },

    #[serde(rename = "LEGAL")]
    Legal { euuid: EventId, priority: Priority },

    #[serde(rename = "ILLEGAL")]
    Illegal { euuid: EventId, priority: Priority },

    #[serde(rename = "OK EVENT")]
    OkEvent { cuuid: ClientId, euuid: EventId },

    #[serde(rename = "NOTIFY")]
    Notify { euuid: EventId, event_data: Value },

    #[serde(rename = "OK NOTIFY")]
    OkNotify { cuuid: ClientId, euuid: EventId },

    #[serde(rename = "BYE EVENT")]
    ByeEvent { data: String },
}
