use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{GateError, Result};

/// Close codes carried on the wire when the gateway terminates a
/// connection. Distinct codes let clients choose between immediate
/// reconnect and re-authentication.
pub const CLOSE_SERVER_SHUTDOWN: u16 = 1001;
pub const CLOSE_AUTH_REVOKED: u16 = 4001;
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4002;
pub const CLOSE_RATE_LIMITED: u16 = 4003;
pub const CLOSE_TOKEN_REFRESH: u16 = 4004;

/// Reserved frame types for the heartbeat round-trip.
pub const FRAME_PING: &str = "ping";
pub const FRAME_PONG: &str = "pong";

/// An event as received from the business-logic collaborator.
///
/// `event_type` is an opaque routing key; the gateway never interprets
/// it beyond the static routing policy lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub tenant_id: u64,
    #[serde(default)]
    pub branch_id: Option<u64>,
    #[serde(default)]
    pub sector_id: Option<u64>,
    #[serde(default)]
    pub session_id: Option<u64>,
    pub entity: Value,
    pub timestamp: String,
}

impl InboundEvent {
    /// Schema validation applied to every ingress event before routing.
    /// Malformed events are counted and dropped, never forwarded.
    pub fn validate(&self) -> Result<()> {
        if self.event_type.is_empty() {
            return Err(GateError::MalformedEvent("empty event type".into()));
        }
        if self.event_type == FRAME_PING || self.event_type == FRAME_PONG {
            return Err(GateError::MalformedEvent(format!(
                "reserved event type: {}",
                self.event_type
            )));
        }
        if self.tenant_id == 0 {
            return Err(GateError::MalformedEvent("tenant_id is zero".into()));
        }
        if self.timestamp.parse::<DateTime<Utc>>().is_err() {
            return Err(GateError::MalformedEvent(format!(
                "unparseable timestamp: {}",
                self.timestamp
            )));
        }
        Ok(())
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let event: InboundEvent = serde_json::from_slice(raw)
            .map_err(|e| GateError::MalformedEvent(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }
}

/// One message delivered to a client connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub payload: Value,
}

impl OutboundFrame {
    pub fn new(frame_type: impl Into<String>, payload: Value) -> Self {
        Self {
            frame_type: frame_type.into(),
            payload,
        }
    }

    pub fn ping() -> Self {
        Self::new(FRAME_PING, Value::Null)
    }

    /// Final frame before a server-initiated close, carrying the code.
    pub fn close(code: u16) -> Self {
        Self::new("close", serde_json::json!({ "code": code }))
    }

    /// Frame sent as the event payload of a broadcast. The entity is
    /// expected to carry a monotonic version field; clients order by it,
    /// not by arrival order.
    pub fn from_event(event: &InboundEvent) -> Self {
        Self::new(event.event_type.clone(), event.entity.clone())
    }

    pub fn encode(&self) -> Bytes {
        // serde_json cannot fail on this shape
        Bytes::from(serde_json::to_vec(self).unwrap_or_default())
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).map_err(|e| GateError::MalformedEvent(e.to_string()))
    }
}

/// Delivery scope an event type routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteScope {
    /// Every eligible connection of the branch
    Branch,
    /// Sector floor staff plus branch management
    Sector,
    /// The single dining session
    Session,
}

/// Loss tolerance of an event type; selects the bus path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    /// Pub/sub path; loss is tolerable
    BestEffort,
    /// Consumer-group stream path; at-least-once
    Durable,
}

/// Static mapping from event type to its routing treatment, configured
/// outside this core and never mutated at runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingPolicy {
    entries: HashMap<String, (RouteScope, Criticality)>,
}

impl RoutingPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(
        mut self,
        event_type: impl Into<String>,
        scope: RouteScope,
        criticality: Criticality,
    ) -> Self {
        self.entries.insert(event_type.into(), (scope, criticality));
        self
    }

    /// Unknown event types default to branch-wide best-effort delivery.
    pub fn scope_of(&self, event_type: &str) -> RouteScope {
        self.entries
            .get(event_type)
            .map(|(s, _)| *s)
            .unwrap_or(RouteScope::Branch)
    }

    pub fn criticality_of(&self, event_type: &str) -> Criticality {
        self.entries
            .get(event_type)
            .map(|(_, c)| *c)
            .unwrap_or(Criticality::BestEffort)
    }
}
