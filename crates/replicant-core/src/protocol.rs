//! Wire frames exchanged between client and server.
//!
//! Frames are JSON objects tagged by `type`. An `update` frame is a
//! [`ChangeSet`] with the tag inline, which lets the client queue the raw
//! text and decode the change set later.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::change::ChangeSet;
use crate::channel::ChannelAddress;
use crate::error::ProtocolError;
use crate::Filter;

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Ping {
        req: u32,
    },
    Auth {
        req: u32,
        token: String,
    },
    Sub {
        req: u32,
        channel: ChannelAddress,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<Filter>,
    },
    /// Subscribe to several instances of one channel type.
    BulkSub {
        req: u32,
        channels: Vec<ChannelAddress>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<Filter>,
    },
    Unsub {
        req: u32,
        channel: ChannelAddress,
    },
    BulkUnsub {
        req: u32,
        channels: Vec<ChannelAddress>,
    },
    /// ETags of channel payloads the client holds in its cache.
    Etags {
        req: u32,
        etags: BTreeMap<String, String>,
    },
    Exec {
        req: u32,
        command: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
}

impl ClientMessage {
    pub fn request_id(&self) -> u32 {
        match self {
            ClientMessage::Ping { req }
            | ClientMessage::Auth { req, .. }
            | ClientMessage::Sub { req, .. }
            | ClientMessage::BulkSub { req, .. }
            | ClientMessage::Unsub { req, .. }
            | ClientMessage::BulkUnsub { req, .. }
            | ClientMessage::Etags { req, .. }
            | ClientMessage::Exec { req, .. } => *req,
        }
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::Ping { .. } => "ping",
            ClientMessage::Auth { .. } => "auth",
            ClientMessage::Sub { .. } => "sub",
            ClientMessage::BulkSub { .. } => "bulk-sub",
            ClientMessage::Unsub { .. } => "unsub",
            ClientMessage::BulkUnsub { .. } => "bulk-unsub",
            ClientMessage::Etags { .. } => "etags",
            ClientMessage::Exec { .. } => "exec",
        }
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// A request completed without producing a change set.
    Ok { req: u32 },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        req: Option<u32>,
        message: String,
    },
    /// The client's cached payload for `channel` is current.
    UseCache {
        req: u32,
        channel: ChannelAddress,
        etag: String,
    },
    SessionCreated {
        session_id: String,
    },
    Update(ChangeSet),
}

impl ServerMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Just the tag of a frame, for dispatch without a full decode.
#[derive(Debug, Deserialize)]
pub struct FrameHeader {
    #[serde(rename = "type")]
    pub kind: String,
}

impl FrameHeader {
    pub const UPDATE: &'static str = "update";

    pub fn peek(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}
