use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::context::ConnId;
use crate::error::{GateError, Result};

/// Lock classes in their fixed acquisition order.
///
/// Any code path touching more than one class must acquire them in
/// ascending order; per-user and per-branch locks additionally order by
/// ascending id within the class. Two operations needing the same two
/// locks therefore always request them in the same relative order, so
/// circular wait is structurally excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockClass {
    /// Global connection counter
    Counter,
    /// Per-user lock, ascending user id
    User,
    /// Per-branch lock, ascending branch id
    Branch,
    /// Sector-assignment lock
    Sector,
    /// Dining-session lock
    Session,
    /// Dead-connections cleanup list
    DeadConns,
}

/// Per-operation record of the highest lock taken so far.
///
/// Created fresh for each logical operation; the acquisition helpers
/// check and advance it before locking. A violation fails fast with
/// [`GateError::LockOrder`] instead of risking a deadlock at runtime.
#[derive(Debug, Default)]
pub struct OrderToken {
    held: Option<(LockClass, u64)>,
}

impl OrderToken {
    pub fn new() -> Self {
        Self::default()
    }

    fn advance(&mut self, class: LockClass, id: u64) -> Result<()> {
        if let Some((held_class, held_id)) = self.held {
            let ordered = class > held_class || (class == held_class && id > held_id);
            if !ordered {
                return Err(GateError::LockOrder {
                    held: held_class,
                    requested: class,
                });
            }
        }
        self.held = Some((class, id));
        Ok(())
    }
}

/// Sharded lock manager for the gateway's shared in-memory state.
///
/// Per-user and per-branch mutexes are created lazily on first use and
/// never removed; the population is bounded by distinct users/branches.
/// All acquisition helpers take synchronous closures, so no lock can be
/// held across an await point.
pub struct LockManager {
    counter: Mutex<u64>,
    users: Mutex<HashMap<u64, Arc<Mutex<()>>>>,
    branches: Mutex<HashMap<u64, Arc<Mutex<()>>>>,
    sector: Mutex<()>,
    session: Mutex<()>,
    dead_conns: Mutex<Vec<ConnId>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            counter: Mutex::new(0),
            users: Mutex::new(HashMap::new()),
            branches: Mutex::new(HashMap::new()),
            sector: Mutex::new(()),
            session: Mutex::new(()),
            dead_conns: Mutex::new(Vec::new()),
        }
    }

    /// Run `f` with the global connection counter held.
    pub fn with_counter<T>(
        &self,
        token: &mut OrderToken,
        f: impl FnOnce(&mut u64) -> T,
    ) -> Result<T> {
        token.advance(LockClass::Counter, 0)?;
        let mut guard = self.counter.lock().expect("counter lock poisoned");
        Ok(f(&mut guard))
    }

    /// Run `f` with the lock for `user_id` held, creating it on first
    /// use. The token is passed through so `f` can take further locks
    /// in order (e.g. user then branch).
    pub fn with_user_lock<T>(
        &self,
        token: &mut OrderToken,
        user_id: u64,
        f: impl FnOnce(&mut OrderToken) -> T,
    ) -> Result<T> {
        token.advance(LockClass::User, user_id)?;
        let lock = self.shard(&self.users, user_id);
        let _guard = lock.lock().expect("user lock poisoned");
        Ok(f(token))
    }

    /// Run `f` with the lock for `branch_id` held, creating it on first use.
    pub fn with_branch_lock<T>(
        &self,
        token: &mut OrderToken,
        branch_id: u64,
        f: impl FnOnce(&mut OrderToken) -> T,
    ) -> Result<T> {
        token.advance(LockClass::Branch, branch_id)?;
        let lock = self.shard(&self.branches, branch_id);
        let _guard = lock.lock().expect("branch lock poisoned");
        Ok(f(token))
    }

    pub fn with_sector_lock<T>(
        &self,
        token: &mut OrderToken,
        f: impl FnOnce(&mut OrderToken) -> T,
    ) -> Result<T> {
        token.advance(LockClass::Sector, 0)?;
        let _guard = self.sector.lock().expect("sector lock poisoned");
        Ok(f(token))
    }

    pub fn with_session_lock<T>(
        &self,
        token: &mut OrderToken,
        f: impl FnOnce(&mut OrderToken) -> T,
    ) -> Result<T> {
        token.advance(LockClass::Session, 0)?;
        let _guard = self.session.lock().expect("session lock poisoned");
        Ok(f(token))
    }

    /// Run `f` with the dead-connections list held. The broadcaster
    /// pushes failed handles here; the reaper drains it.
    pub fn with_dead_conns<T>(
        &self,
        token: &mut OrderToken,
        f: impl FnOnce(&mut Vec<ConnId>) -> T,
    ) -> Result<T> {
        token.advance(LockClass::DeadConns, 0)?;
        let mut guard = self.dead_conns.lock().expect("dead-conns lock poisoned");
        Ok(f(&mut guard))
    }

    fn shard(&self, map: &Mutex<HashMap<u64, Arc<Mutex<()>>>>, id: u64) -> Arc<Mutex<()>> {
        let mut guard = map.lock().expect("shard map poisoned");
        Arc::clone(guard.entry(id).or_default())
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}
