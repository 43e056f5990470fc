#![doc = include_str!("../README.md")]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod broadcast;
pub mod client;
pub mod config;
pub mod context;
pub mod deadletter;
pub mod error;
pub mod gateway;
pub mod ingress;
pub mod lifecycle;
pub mod locks;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod resilience;
pub mod router;

pub use broadcast::{BroadcastObserver, BroadcastOutcome, Broadcaster};
pub use client::{EventHandler, GatewayClient};
pub use config::{BreakerConfig, BroadcastConfig, GatewayConfig, IngressConfig, RetryConfig};
pub use context::{CloseReason, ConnContext, ConnId, Role};
pub use deadletter::{DeadLetterRecord, DeadLetterSink, FileDeadLetterSink, MemoryDeadLetterSink};
pub use error::{GateError, Result};
pub use gateway::{ClientConn, Gateway, GatewayHandle};
pub use ingress::{EventBus, EventIngress, InMemoryBus, PubSubItem, StreamEntry};
pub use lifecycle::{
    AcceptAll, ConnectionLifecycle, CredentialValidator, NoSectorAssignments,
    SectorAssignmentCache, TtlSectorCache,
};
pub use metrics::{GatewayMetrics, HealthReport, MetricsSnapshot};
pub use protocol::{Criticality, InboundEvent, OutboundFrame, RouteScope, RoutingPolicy};
pub use registry::ConnectionRegistry;
pub use resilience::{BreakerState, CircuitBreaker, RetrySchedule};
pub use router::EventRouter;
