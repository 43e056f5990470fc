use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GateError, Result};

/// Opaque handle identifying one live client connection.
///
/// The registry stores handles plus metadata only; the live socket is
/// owned by its connection task and looked up by handle when needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnId(Uuid);

impl ConnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Connection roles, a closed set.
///
/// Role-specific routing behavior is selected by this tag rather than
/// by a hierarchy of connection kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Floor staff, scoped to a sector within a branch
    Waiter,
    /// Kitchen display, scoped to a branch
    Kitchen,
    /// Till operator, scoped to a branch
    Cashier,
    /// Branch management; receives everything for its branch
    Manager,
    /// Tenant administration; treated as management for routing
    Admin,
    /// Diner-facing connection, scoped to a dining session
    Diner,
}

impl Role {
    /// Management roles receive all events for their branch regardless
    /// of sector narrowing.
    pub fn is_management(&self) -> bool {
        matches!(self, Role::Manager | Role::Admin)
    }

    /// Floor-staff roles are eligible for sector-scoped delivery.
    pub fn is_floor_staff(&self) -> bool {
        matches!(self, Role::Waiter)
    }
}

/// Identity and partition context of one connection.
///
/// Created at a successful authentication handshake, immutable except
/// for revalidation refresh, destroyed at disconnect or forced close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnContext {
    /// Tenant boundary; never absent, never crossed
    pub tenant_id: u64,
    /// Physical location under the tenant; required for branch/sector routing
    pub branch_id: Option<u64>,
    pub user_id: u64,
    pub role: Role,
    /// Sub-partition of the branch, floor staff only
    pub sector_id: Option<u64>,
    /// Dining session, diner-facing connections only
    pub session_id: Option<u64>,
}

impl ConnContext {
    pub fn builder() -> ConnContextBuilder {
        ConnContextBuilder::default()
    }
}

/// Builder for [`ConnContext`]; the tenant id is mandatory so a context
/// without a tenant cannot be constructed at all.
#[derive(Debug, Default)]
pub struct ConnContextBuilder {
    tenant_id: Option<u64>,
    branch_id: Option<u64>,
    user_id: Option<u64>,
    role: Option<Role>,
    sector_id: Option<u64>,
    session_id: Option<u64>,
}

impl ConnContextBuilder {
    pub fn tenant_id(mut self, v: u64) -> Self {
        self.tenant_id = Some(v);
        self
    }
    pub fn branch_id(mut self, v: u64) -> Self {
        self.branch_id = Some(v);
        self
    }
    pub fn user_id(mut self, v: u64) -> Self {
        self.user_id = Some(v);
        self
    }
    pub fn role(mut self, v: Role) -> Self {
        self.role = Some(v);
        self
    }
    pub fn sector_id(mut self, v: u64) -> Self {
        self.sector_id = Some(v);
        self
    }
    pub fn session_id(mut self, v: u64) -> Self {
        self.session_id = Some(v);
        self
    }

    pub fn build(self) -> Result<ConnContext> {
        let role = self
            .role
            .ok_or_else(|| GateError::InvalidConfig("role missing".into()))?;
        let ctx = ConnContext {
            tenant_id: self
                .tenant_id
                .ok_or_else(|| GateError::InvalidConfig("tenant_id missing".into()))?,
            branch_id: self.branch_id,
            user_id: self
                .user_id
                .ok_or_else(|| GateError::InvalidConfig("user_id missing".into()))?,
            role,
            sector_id: self.sector_id,
            session_id: self.session_id,
        };
        if ctx.sector_id.is_some() && !role.is_floor_staff() {
            return Err(GateError::InvalidConfig(
                "sector_id only valid for floor staff".into(),
            ));
        }
        if ctx.session_id.is_some() && role != Role::Diner {
            return Err(GateError::InvalidConfig(
                "session_id only valid for diner connections".into(),
            ));
        }
        Ok(ctx)
    }
}

/// Reasons why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The remote peer closed the connection
    PeerClosed,
    /// Credential was revoked or failed revalidation
    AuthRevoked,
    /// Heartbeat round-trip exceeded the timeout
    HeartbeatTimeout,
    /// Connection exceeded its rate limit
    RateLimited,
    /// Server asked the client to reconnect with a fresh token
    TokenRefresh,
    /// Gateway shutdown
    ServerShutdown,
    /// Wire-level protocol violation
    ProtocolError,
}

impl CloseReason {
    /// Close code sent on the wire for server-initiated closes.
    pub fn code(&self) -> u16 {
        use crate::protocol;
        match self {
            CloseReason::AuthRevoked => protocol::CLOSE_AUTH_REVOKED,
            CloseReason::HeartbeatTimeout => protocol::CLOSE_HEARTBEAT_TIMEOUT,
            CloseReason::RateLimited => protocol::CLOSE_RATE_LIMITED,
            CloseReason::TokenRefresh => protocol::CLOSE_TOKEN_REFRESH,
            CloseReason::ServerShutdown
            | CloseReason::PeerClosed
            | CloseReason::ProtocolError => protocol::CLOSE_SERVER_SHUTDOWN,
        }
    }
}
