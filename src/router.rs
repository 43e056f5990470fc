use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::context::ConnId;
use crate::protocol::{InboundEvent, RouteScope, RoutingPolicy};
use crate::registry::ConnectionRegistry;

/// Maps an inbound domain event to its target connection set.
///
/// Resolution order: branch candidates, sector narrowing (floor staff
/// in the sector plus branch management), session narrowing, and as the
/// final non-skippable step the tenant filter. The whole resolution
/// runs inside one registry read scope, so a connection registered or
/// deregistered mid-resolution can never leak across tenants.
pub struct EventRouter {
    registry: Arc<ConnectionRegistry>,
    policy: RoutingPolicy,
}

impl EventRouter {
    pub fn new(registry: Arc<ConnectionRegistry>, policy: RoutingPolicy) -> Self {
        Self { registry, policy }
    }

    pub fn policy(&self) -> &RoutingPolicy {
        &self.policy
    }

    /// Resolve the target snapshot for an event. Returns an empty set
    /// for events that cannot be routed; a lost notification is never a
    /// correctness risk, crossing a tenant boundary would be.
    pub fn route(&self, event: &InboundEvent) -> Vec<ConnId> {
        let branch_id = match event.branch_id {
            Some(b) => b,
            None => {
                debug!(event_type = %event.event_type, "event without branch, dropped");
                return Vec::new();
            }
        };

        let scope = self.policy.scope_of(&event.event_type);

        self.registry.with_read(|view| {
            let mut candidates: Vec<ConnId> = view.by_branch(branch_id);

            if scope == RouteScope::Sector || scope == RouteScope::Session {
                if let Some(sector_id) = event.sector_id {
                    let in_sector: HashSet<ConnId> =
                        view.by_sector(branch_id, sector_id).into_iter().collect();
                    candidates.retain(|id| {
                        let Some(ctx) = view.context_of(*id) else {
                            return false;
                        };
                        // Floor staff narrowed to the sector; management
                        // always receives everything for its branch.
                        (ctx.role.is_floor_staff() && in_sector.contains(id))
                            || ctx.role.is_management()
                    });
                }
            }

            if scope == RouteScope::Session {
                if let Some(session_id) = event.session_id {
                    candidates.retain(|id| {
                        let Some(ctx) = view.context_of(*id) else {
                            return false;
                        };
                        ctx.session_id == Some(session_id) || ctx.role.is_management()
                    });
                }
            }

            // Final, non-skippable tenant filter, inside the same lock
            // scope that produced the candidates.
            candidates.retain(|id| match view.context_of(*id) {
                Some(ctx) if ctx.tenant_id == event.tenant_id => true,
                Some(ctx) => {
                    warn!(
                        conn = %id,
                        conn_tenant = ctx.tenant_id,
                        event_tenant = event.tenant_id,
                        "tenant mismatch, connection excluded from delivery"
                    );
                    false
                }
                None => false,
            });

            candidates
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ConnContext, Role};
    use crate::protocol::Criticality;
    use chrono::Utc;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn register(
        registry: &ConnectionRegistry,
        tenant: u64,
        branch: u64,
        user: u64,
        role: Role,
        sector: Option<u64>,
        session: Option<u64>,
    ) -> ConnId {
        let mut b = ConnContext::builder()
            .tenant_id(tenant)
            .branch_id(branch)
            .user_id(user)
            .role(role);
        if let Some(s) = sector {
            b = b.sector_id(s);
        }
        if let Some(s) = session {
            b = b.session_id(s);
        }
        let id = ConnId::new();
        registry.add(id, b.build().unwrap(), mpsc::channel(4).0);
        id
    }

    fn event(
        event_type: &str,
        tenant: u64,
        branch: Option<u64>,
        sector: Option<u64>,
        session: Option<u64>,
    ) -> InboundEvent {
        InboundEvent {
            event_type: event_type.into(),
            tenant_id: tenant,
            branch_id: branch,
            sector_id: sector,
            session_id: session,
            entity: json!({"version": 1}),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    fn router(registry: Arc<ConnectionRegistry>) -> EventRouter {
        let policy = RoutingPolicy::new()
            .with_rule("ROUND_READY", RouteScope::Sector, Criticality::Durable)
            .with_rule("BILL_REQUESTED", RouteScope::Session, Criticality::Durable)
            .with_rule("MENU_CHANGED", RouteScope::Branch, Criticality::BestEffort);
        EventRouter::new(registry, policy)
    }

    #[test]
    fn branch_event_reaches_whole_branch() {
        let registry = Arc::new(ConnectionRegistry::new());
        let a = register(&registry, 1, 7, 1, Role::Kitchen, None, None);
        let b = register(&registry, 1, 7, 2, Role::Manager, None, None);
        let other = register(&registry, 1, 8, 3, Role::Kitchen, None, None);

        let targets = router(Arc::clone(&registry)).route(&event("MENU_CHANGED", 1, Some(7), None, None));
        let set: HashSet<_> = targets.into_iter().collect();
        assert!(set.contains(&a));
        assert!(set.contains(&b));
        assert!(!set.contains(&other));
    }

    #[test]
    fn sector_event_narrows_floor_staff_and_keeps_management() {
        let registry = Arc::new(ConnectionRegistry::new());
        let sector3 = register(&registry, 1, 7, 1, Role::Waiter, Some(3), None);
        let sector4 = register(&registry, 1, 7, 2, Role::Waiter, Some(4), None);
        let manager = register(&registry, 1, 7, 3, Role::Manager, None, None);
        let kitchen = register(&registry, 1, 7, 4, Role::Kitchen, None, None);

        let targets =
            router(Arc::clone(&registry)).route(&event("ROUND_READY", 1, Some(7), Some(3), None));
        let set: HashSet<_> = targets.into_iter().collect();
        assert!(set.contains(&sector3));
        assert!(set.contains(&manager));
        assert!(!set.contains(&sector4));
        assert!(!set.contains(&kitchen));
    }

    #[test]
    fn session_event_reaches_only_matching_session() {
        let registry = Arc::new(ConnectionRegistry::new());
        let diner = register(&registry, 1, 7, 1, Role::Diner, None, Some(99));
        let other_diner = register(&registry, 1, 7, 2, Role::Diner, None, Some(42));
        let manager = register(&registry, 1, 7, 3, Role::Manager, None, None);

        let targets = router(Arc::clone(&registry))
            .route(&event("BILL_REQUESTED", 1, Some(7), None, Some(99)));
        let set: HashSet<_> = targets.into_iter().collect();
        assert!(set.contains(&diner));
        assert!(set.contains(&manager));
        assert!(!set.contains(&other_diner));
    }

    #[test]
    fn tenant_filter_blocks_colliding_branch_ids() {
        let registry = Arc::new(ConnectionRegistry::new());
        // Two tenants sharing the same branch and sector ids
        let ours = register(&registry, 1, 7, 1, Role::Waiter, Some(3), None);
        let theirs = register(&registry, 2, 7, 2, Role::Waiter, Some(3), None);
        let their_manager = register(&registry, 2, 7, 3, Role::Manager, None, None);

        let targets =
            router(Arc::clone(&registry)).route(&event("ROUND_READY", 1, Some(7), Some(3), None));
        let set: HashSet<_> = targets.into_iter().collect();
        assert!(set.contains(&ours));
        assert!(!set.contains(&theirs));
        assert!(!set.contains(&their_manager));
    }

    #[test]
    fn event_without_branch_is_dropped() {
        let registry = Arc::new(ConnectionRegistry::new());
        register(&registry, 1, 7, 1, Role::Kitchen, None, None);
        let targets = router(Arc::clone(&registry)).route(&event("MENU_CHANGED", 1, None, None, None));
        assert!(targets.is_empty());
    }

    #[test]
    fn unknown_type_defaults_to_branch_scope() {
        let registry = Arc::new(ConnectionRegistry::new());
        let a = register(&registry, 1, 7, 1, Role::Kitchen, None, None);
        let targets =
            router(Arc::clone(&registry)).route(&event("SOMETHING_NEW", 1, Some(7), None, None));
        assert_eq!(targets, vec![a]);
    }
}
