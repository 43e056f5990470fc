use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::context::{CloseReason, ConnContext, ConnId};
use crate::error::{GateError, Result};
use crate::locks::{LockManager, OrderToken};
use crate::metrics::{GatewayMetrics, RejectReason};
use crate::protocol::OutboundFrame;
use crate::registry::ConnectionRegistry;

/// Lifecycle states of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Authenticated,
    Registered,
    Revalidating,
    Disconnecting,
    Closed,
}

/// Authentication collaborator: hands the gateway a validated context
/// at handshake and re-confirms it during the revalidation sweep.
/// Re-validation may re-confirm role and branch but never escalates
/// them; a changed or revoked credential invalidates the connection.
#[async_trait]
pub trait CredentialValidator: Send + Sync + 'static {
    async fn is_valid(&self, context: &ConnContext) -> bool;
}

/// Validator that accepts everything; embedded and test deployments.
pub struct AcceptAll;

#[async_trait]
impl CredentialValidator for AcceptAll {
    async fn is_valid(&self, _context: &ConnContext) -> bool {
        true
    }
}

/// TTL-bounded sector-assignment lookup, consulted when a floor-staff
/// connection arrives without a sector. Not authoritative: a miss means
/// the connection registers without a sector and receives branch-wide
/// events only.
#[async_trait]
pub trait SectorAssignmentCache: Send + Sync + 'static {
    async fn sector_for(&self, tenant_id: u64, user_id: u64) -> Option<u64>;
}

/// Cache that never has an assignment; deployments without sectoring.
pub struct NoSectorAssignments;

#[async_trait]
impl SectorAssignmentCache for NoSectorAssignments {
    async fn sector_for(&self, _tenant_id: u64, _user_id: u64) -> Option<u64> {
        None
    }
}

/// In-memory TTL cache of sector assignments keyed by tenant and user.
pub struct TtlSectorCache {
    ttl: Duration,
    entries: Mutex<HashMap<(u64, u64), (u64, std::time::Instant)>>,
}

impl TtlSectorCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, tenant_id: u64, user_id: u64, sector_id: u64) {
        self.entries
            .lock()
            .expect("sector cache lock poisoned")
            .insert((tenant_id, user_id), (sector_id, std::time::Instant::now()));
    }
}

#[async_trait]
impl SectorAssignmentCache for TtlSectorCache {
    async fn sector_for(&self, tenant_id: u64, user_id: u64) -> Option<u64> {
        let mut entries = self.entries.lock().expect("sector cache lock poisoned");
        match entries.get(&(tenant_id, user_id)) {
            Some((sector, stored)) if stored.elapsed() < self.ttl => Some(*sector),
            Some(_) => {
                entries.remove(&(tenant_id, user_id));
                None
            }
            None => None,
        }
    }
}

/// Registers and deregisters connections under the fixed lock order and
/// runs the periodic sweeps (revalidation, heartbeat, dead-connection
/// reaping).
pub struct ConnectionLifecycle {
    registry: Arc<ConnectionRegistry>,
    locks: Arc<LockManager>,
    metrics: Arc<GatewayMetrics>,
    validator: Arc<dyn CredentialValidator>,
    sectors: Arc<dyn SectorAssignmentCache>,
    frame_capacity: usize,
    states: Mutex<HashMap<ConnId, ConnState>>,
}

impl ConnectionLifecycle {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        locks: Arc<LockManager>,
        metrics: Arc<GatewayMetrics>,
        validator: Arc<dyn CredentialValidator>,
        sectors: Arc<dyn SectorAssignmentCache>,
        frame_capacity: usize,
    ) -> Self {
        Self {
            registry,
            locks,
            metrics,
            validator,
            sectors,
            frame_capacity,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Register an authenticated connection: counter, user, branch, then
    /// sector or session lock per the fixed order, one atomic index
    /// insertion, and the frame receiver handed back to the connection
    /// task. A floor-staff connection without a sector first consults
    /// the sector-assignment cache.
    pub async fn register(
        &self,
        context: ConnContext,
    ) -> Result<(ConnId, mpsc::Receiver<OutboundFrame>)> {
        let mut context = context;
        if context.role.is_floor_staff() && context.sector_id.is_none() {
            context.sector_id = self
                .sectors
                .sector_for(context.tenant_id, context.user_id)
                .await;
        }

        let id = ConnId::new();
        self.set_state(id, ConnState::Connecting);
        self.set_state(id, ConnState::Authenticated);

        let (tx, rx) = mpsc::channel(self.frame_capacity);
        let mut token = OrderToken::new();
        self.locks.with_counter(&mut token, |n| *n += 1)?;
        self.with_partition_locks(&mut token, &context, || {
            self.registry.add(id, context.clone(), tx.clone())
        })?;

        self.set_state(id, ConnState::Registered);
        self.metrics.connection_opened();
        debug!(conn = %id, tenant = context.tenant_id, "connection registered");
        Ok((id, rx))
    }

    /// Acquire the partition locks a context touches, in order: user,
    /// branch, then sector or session, and run `f` with all of them held.
    fn with_partition_locks<T>(
        &self,
        token: &mut OrderToken,
        context: &ConnContext,
        f: impl FnOnce() -> T,
    ) -> Result<T> {
        self.locks.with_user_lock(token, context.user_id, |t| {
            match context.branch_id {
                Some(branch) => self.locks.with_branch_lock(t, branch, |t| {
                    if context.sector_id.is_some() {
                        self.locks.with_sector_lock(t, |_| f())
                    } else if context.session_id.is_some() {
                        self.locks.with_session_lock(t, |_| f())
                    } else {
                        Ok(f())
                    }
                })?,
                None => Ok(f()),
            }
        })?
    }

    /// Remove a connection from the index under the same lock order and
    /// decrement the counter. Safe to call multiple times.
    pub fn unregister(&self, id: ConnId) -> Result<Option<ConnContext>> {
        let Some(context) = self.registry.context_of(id) else {
            return Ok(None);
        };
        self.set_state(id, ConnState::Disconnecting);

        let mut token = OrderToken::new();
        let removed =
            self.with_partition_locks(&mut token, &context, || self.registry.remove(id))?;

        if removed.is_some() {
            // Separate critical section; nothing else is held
            let mut token = OrderToken::new();
            self.locks
                .with_counter(&mut token, |n| *n = n.saturating_sub(1))?;
            self.metrics.connection_closed();
        }
        self.states.lock().expect("state lock poisoned").remove(&id);
        debug!(conn = %id, "connection unregistered");
        Ok(removed)
    }

    /// Force-close a connection with a distinguishing close code and
    /// unregister it immediately. Fails with
    /// [`GateError::UnknownConnection`] if the handle is not registered.
    pub async fn force_close(&self, id: ConnId, reason: CloseReason) -> Result<()> {
        let Some(tx) = self.registry.sender_for(id) else {
            return Err(GateError::UnknownConnection(id.to_string()));
        };
        let _ = tx
            .send_timeout(
                OutboundFrame::close(reason.code()),
                Duration::from_millis(100),
            )
            .await;
        match reason {
            CloseReason::AuthRevoked => self.metrics.rejected(RejectReason::AuthRevoked),
            CloseReason::HeartbeatTimeout => self.metrics.rejected(RejectReason::HeartbeatTimeout),
            CloseReason::RateLimited => self.metrics.rejected(RejectReason::RateLimited),
            _ => {}
        }
        info!(conn = %id, ?reason, "connection force-closed");
        self.unregister(id)?;
        Ok(())
    }

    pub fn record_pong(&self, id: ConnId) {
        self.registry.record_pong(id);
    }

    pub fn state_of(&self, id: ConnId) -> Option<ConnState> {
        self.states.lock().expect("state lock poisoned").get(&id).copied()
    }

    fn set_state(&self, id: ConnId, state: ConnState) {
        self.states
            .lock()
            .expect("state lock poisoned")
            .insert(id, state);
    }

    /// Periodic credential re-check. Revoked credentials stop receiving
    /// events without waiting for the client to disconnect.
    pub fn spawn_revalidation(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for id in this.registry.all() {
                            let Some(context) = this.registry.context_of(id) else {
                                continue;
                            };
                            this.set_state(id, ConnState::Revalidating);
                            if this.validator.is_valid(&context).await {
                                this.set_state(id, ConnState::Registered);
                            } else {
                                warn!(conn = %id, user = context.user_id, "credential invalid, closing");
                                let _ = this.force_close(id, CloseReason::AuthRevoked).await;
                            }
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    /// Heartbeat sweep: emit pings each interval and close connections
    /// whose last pong is older than the timeout.
    pub fn spawn_heartbeat(
        self: &Arc<Self>,
        interval: Duration,
        timeout: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for id in this.registry.stale_connections(timeout) {
                            let _ = this.force_close(id, CloseReason::HeartbeatTimeout).await;
                        }
                        for id in this.registry.all() {
                            if let Some(tx) = this.registry.sender_for(id) {
                                // Best effort; a full channel is a slow
                                // client, the timeout will catch it
                                let _ = tx.try_send(OutboundFrame::ping());
                            }
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    /// Drain the dead-connections list the broadcaster fills and
    /// unregister each handle outside any broadcast.
    pub fn spawn_reaper(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(Duration::from_millis(500));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let mut token = OrderToken::new();
                        let dead = match this.locks.with_dead_conns(&mut token, std::mem::take) {
                            Ok(dead) => dead,
                            Err(_) => continue,
                        };
                        for id in dead {
                            let _ = this.unregister(id);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }
}
