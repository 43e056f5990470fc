use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::warn;

use crate::context::{ConnContext, ConnId, Role};
use crate::protocol::OutboundFrame;

/// Per-connection registry entry: context plus the lightweight outbound
/// handle. The live socket is never stored here; it is owned by the
/// connection task and fed through the frame channel.
#[derive(Debug)]
pub struct ConnEntry {
    pub context: ConnContext,
    pub frames: mpsc::Sender<OutboundFrame>,
    pub last_pong: Instant,
}

#[derive(Debug, Default)]
struct Indexes {
    primary: HashMap<ConnId, ConnEntry>,
    by_tenant: HashMap<u64, HashSet<ConnId>>,
    by_branch: HashMap<u64, HashSet<ConnId>>,
    by_user: HashMap<u64, HashSet<ConnId>>,
    by_sector: HashMap<(u64, u64), HashSet<ConnId>>,
    by_role: HashMap<(u64, Role), HashSet<ConnId>>,
}

impl Indexes {
    fn insert_derived(&mut self, id: ConnId, ctx: &ConnContext) {
        self.by_tenant.entry(ctx.tenant_id).or_default().insert(id);
        self.by_user.entry(ctx.user_id).or_default().insert(id);
        if let Some(branch) = ctx.branch_id {
            self.by_branch.entry(branch).or_default().insert(id);
            self.by_role.entry((branch, ctx.role)).or_default().insert(id);
            if let Some(sector) = ctx.sector_id {
                self.by_sector.entry((branch, sector)).or_default().insert(id);
            }
        }
    }

    fn remove_derived(&mut self, id: ConnId, ctx: &ConnContext) {
        remove_from(&mut self.by_tenant, ctx.tenant_id, id);
        remove_from(&mut self.by_user, ctx.user_id, id);
        if let Some(branch) = ctx.branch_id {
            remove_from(&mut self.by_branch, branch, id);
            remove_from(&mut self.by_role, (branch, ctx.role), id);
            if let Some(sector) = ctx.sector_id {
                remove_from(&mut self.by_sector, (branch, sector), id);
            }
        }
    }
}

fn remove_from<K: std::hash::Hash + Eq>(
    map: &mut HashMap<K, HashSet<ConnId>>,
    key: K,
    id: ConnId,
) {
    if let Some(set) = map.get_mut(&key) {
        set.remove(&id);
        if set.is_empty() {
            map.remove(&key);
        }
    }
}

/// In-memory connection index: primary map plus derived sets for O(1)
/// lookup by tenant, branch, user, sector, and role-within-branch.
///
/// One `RwLock` guards the whole structure so insertion and removal are
/// atomic across the primary map and every derived set; there is no
/// window where a derived set holds a handle absent from the primary
/// map. Lookups return point-in-time snapshot copies so callers iterate
/// outside the lock. The index performs no I/O.
pub struct ConnectionRegistry {
    inner: RwLock<Indexes>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Indexes::default()),
        }
    }

    /// Insert a connection into the primary map and all derived sets in
    /// one critical section. A duplicate handle replaces the existing
    /// entry (last-write-wins) and logs a warning; duplicates should not
    /// happen but must not corrupt the derived sets if they do.
    pub fn add(&self, id: ConnId, context: ConnContext, frames: mpsc::Sender<OutboundFrame>) {
        let entry = ConnEntry {
            context,
            frames,
            last_pong: Instant::now(),
        };
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if let Some(old) = inner.primary.remove(&id) {
            warn!(conn = %id, "duplicate registration, replacing existing entry");
            let old_ctx = old.context;
            inner.remove_derived(id, &old_ctx);
        }
        let ctx = entry.context.clone();
        inner.primary.insert(id, entry);
        inner.insert_derived(id, &ctx);
    }

    /// Remove a connection from the primary map and every derived set,
    /// returning the removed context for cleanup decisions. Idempotent:
    /// an absent handle returns `None`.
    pub fn remove(&self, id: ConnId) -> Option<ConnContext> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let entry = inner.primary.remove(&id)?;
        let ctx = entry.context;
        inner.remove_derived(id, &ctx);
        Some(ctx)
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("registry lock poisoned").primary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .primary
            .contains_key(&id)
    }

    pub fn context_of(&self, id: ConnId) -> Option<ConnContext> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .primary
            .get(&id)
            .map(|e| e.context.clone())
    }

    /// Clone of the outbound frame sender for a connection.
    pub fn sender_for(&self, id: ConnId) -> Option<mpsc::Sender<OutboundFrame>> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .primary
            .get(&id)
            .map(|e| e.frames.clone())
    }

    pub fn record_pong(&self, id: ConnId) {
        if let Some(entry) = self
            .inner
            .write()
            .expect("registry lock poisoned")
            .primary
            .get_mut(&id)
        {
            entry.last_pong = Instant::now();
        }
    }

    /// Handles whose last pong is older than `timeout`.
    pub fn stale_connections(&self, timeout: std::time::Duration) -> Vec<ConnId> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .primary
            .iter()
            .filter(|(_, e)| e.last_pong.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn lookup_by_branch(&self, branch_id: u64) -> Vec<ConnId> {
        self.snapshot(|ix| ix.by_branch.get(&branch_id))
    }

    pub fn lookup_by_user(&self, user_id: u64) -> Vec<ConnId> {
        self.snapshot(|ix| ix.by_user.get(&user_id))
    }

    pub fn lookup_by_tenant(&self, tenant_id: u64) -> Vec<ConnId> {
        self.snapshot(|ix| ix.by_tenant.get(&tenant_id))
    }

    pub fn lookup_by_sector(&self, branch_id: u64, sector_id: u64) -> Vec<ConnId> {
        self.snapshot(|ix| ix.by_sector.get(&(branch_id, sector_id)))
    }

    pub fn lookup_by_role(&self, branch_id: u64, role: Role) -> Vec<ConnId> {
        self.snapshot(|ix| ix.by_role.get(&(branch_id, role)))
    }

    /// All registered handles; used by the revalidation sweep.
    pub fn all(&self) -> Vec<ConnId> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.primary.keys().copied().collect()
    }

    /// Run `f` under the registry read lock. The router uses this so its
    /// candidate resolution and final tenant filter happen in one lock
    /// scope; `f` must not perform I/O.
    pub fn with_read<T>(&self, f: impl FnOnce(&RegistryView<'_>) -> T) -> T {
        let inner = self.inner.read().expect("registry lock poisoned");
        f(&RegistryView { inner: &inner })
    }

    fn snapshot(&self, pick: impl FnOnce(&Indexes) -> Option<&HashSet<ConnId>>) -> Vec<ConnId> {
        let inner = self.inner.read().expect("registry lock poisoned");
        pick(&inner)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Invariant check used by tests: every handle in a derived set must
    /// be present in the primary map with a matching context.
    #[doc(hidden)]
    pub fn check_coherence(&self) -> bool {
        let inner = self.inner.read().expect("registry lock poisoned");
        let derived = inner
            .by_tenant
            .values()
            .chain(inner.by_branch.values())
            .chain(inner.by_user.values())
            .chain(inner.by_sector.values())
            .chain(inner.by_role.values())
            .flatten();
        for id in derived {
            if !inner.primary.contains_key(id) {
                return false;
            }
        }
        true
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Borrowed view of the index for single-lock-scope resolution.
pub struct RegistryView<'a> {
    inner: &'a Indexes,
}

impl RegistryView<'_> {
    pub fn by_branch(&self, branch_id: u64) -> Vec<ConnId> {
        self.set(self.inner.by_branch.get(&branch_id))
    }

    pub fn by_sector(&self, branch_id: u64, sector_id: u64) -> Vec<ConnId> {
        self.set(self.inner.by_sector.get(&(branch_id, sector_id)))
    }

    pub fn by_role(&self, branch_id: u64, role: Role) -> Vec<ConnId> {
        self.set(self.inner.by_role.get(&(branch_id, role)))
    }

    pub fn context_of(&self, id: ConnId) -> Option<&ConnContext> {
        self.inner.primary.get(&id).map(|e| &e.context)
    }

    fn set(&self, s: Option<&HashSet<ConnId>>) -> Vec<ConnId> {
        s.map(|set| set.iter().copied().collect()).unwrap_or_default()
    }
}
