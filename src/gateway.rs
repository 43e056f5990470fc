use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

use crate::broadcast::{BroadcastObserver, Broadcaster};
use crate::config::GatewayConfig;
use crate::context::{CloseReason, ConnContext, ConnId};
use crate::deadletter::DeadLetterSink;
use crate::error::{GateError, Result};
use crate::ingress::{EventBus, EventIngress};
use crate::lifecycle::{ConnectionLifecycle, CredentialValidator, SectorAssignmentCache};
use crate::locks::LockManager;
use crate::metrics::{GatewayMetrics, HealthReport, MetricsSnapshot};
use crate::protocol::{InboundEvent, OutboundFrame, RoutingPolicy};
use crate::registry::ConnectionRegistry;
use crate::resilience::CircuitBreaker;
use crate::router::EventRouter;

/// A registered client connection: the opaque handle plus the outbound
/// frame stream. The socket task owns this; the registry only keeps the
/// handle and the sender side.
#[derive(Debug)]
pub struct ClientConn {
    pub conn_id: ConnId,
    pub frames: mpsc::Receiver<OutboundFrame>,
}

#[derive(Debug)]
pub enum GatewayCommand {
    Register {
        context: ConnContext,
        respond_to: oneshot::Sender<Result<ClientConn>>,
    },
    Disconnect {
        id: ConnId,
    },
    Pong {
        id: ConnId,
    },
    /// Local event injection, bypassing the bus
    Publish {
        event: InboundEvent,
    },
    Shutdown,
}

/// Cloneable handle to a running gateway.
#[derive(Clone)]
pub struct GatewayHandle {
    cmd_tx: mpsc::Sender<GatewayCommand>,
    metrics: Arc<GatewayMetrics>,
    breaker: Arc<CircuitBreaker>,
    ingress: Arc<EventIngress>,
}

impl GatewayHandle {
    pub async fn register(&self, context: ConnContext) -> Result<ClientConn> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(GatewayCommand::Register {
                context,
                respond_to: tx,
            })
            .await
            .map_err(|_| GateError::ChannelClosed)?;
        rx.await.map_err(|_| GateError::ChannelClosed)?
    }

    pub async fn disconnect(&self, id: ConnId) -> Result<()> {
        self.cmd_tx
            .send(GatewayCommand::Disconnect { id })
            .await
            .map_err(|_| GateError::ChannelClosed)
    }

    /// Record a heartbeat pong from a connection.
    pub async fn pong(&self, id: ConnId) -> Result<()> {
        self.cmd_tx
            .send(GatewayCommand::Pong { id })
            .await
            .map_err(|_| GateError::ChannelClosed)
    }

    /// Inject an event directly, as if it arrived over the bus.
    pub async fn publish(&self, event: InboundEvent) -> Result<()> {
        event.validate()?;
        self.cmd_tx
            .send(GatewayCommand::Publish { event })
            .await
            .map_err(|_| GateError::ChannelClosed)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.cmd_tx
            .send(GatewayCommand::Shutdown)
            .await
            .map_err(|_| GateError::ChannelClosed)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport {
            breaker_state: self.breaker.state().to_string(),
            ingress_pending: self.ingress.pending().await,
            active_connections: self.metrics.snapshot().active_connections,
        }
    }
}

/// The event-distribution gateway core.
///
/// One instance per process, constructed at startup and torn down with
/// [`GatewayHandle::shutdown`]; there is no ambient global state.
pub struct Gateway;

impl Gateway {
    #[allow(clippy::too_many_arguments)]
    pub async fn spawn(
        config: GatewayConfig,
        policy: RoutingPolicy,
        bus: Arc<dyn EventBus>,
        validator: Arc<dyn CredentialValidator>,
        sectors: Arc<dyn SectorAssignmentCache>,
        sink: Arc<dyn DeadLetterSink>,
        observers: Vec<Arc<dyn BroadcastObserver>>,
    ) -> Result<GatewayHandle> {
        let registry = Arc::new(ConnectionRegistry::new());
        let locks = Arc::new(LockManager::new());
        let metrics = Arc::new(GatewayMetrics::new());
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));

        let broadcaster = Arc::new(Broadcaster::new(
            config.broadcast.clone(),
            Arc::clone(&registry),
            Arc::clone(&locks),
            Arc::clone(&metrics),
            observers,
        ));
        let router = Arc::new(EventRouter::new(Arc::clone(&registry), policy));
        let lifecycle = Arc::new(ConnectionLifecycle::new(
            Arc::clone(&registry),
            Arc::clone(&locks),
            Arc::clone(&metrics),
            validator,
            sectors,
            config.frame_channel_capacity,
        ));
        let ingress = Arc::new(EventIngress::new(
            config.ingress.clone(),
            config.retry.clone(),
            bus,
            Arc::clone(&router),
            Arc::clone(&broadcaster),
            Arc::clone(&breaker),
            sink,
            Arc::clone(&metrics),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::clone(&ingress).spawn(shutdown_rx.clone());
        lifecycle.spawn_revalidation(config.revalidation_interval(), shutdown_rx.clone());
        lifecycle.spawn_heartbeat(
            config.heartbeat_interval(),
            config.heartbeat_timeout(),
            shutdown_rx.clone(),
        );
        lifecycle.spawn_reaper(shutdown_rx);

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<GatewayCommand>(1024);
        let handle = GatewayHandle {
            cmd_tx,
            metrics: Arc::clone(&metrics),
            breaker: Arc::clone(&breaker),
            ingress: Arc::clone(&ingress),
        };

        tokio::spawn({
            let lifecycle = Arc::clone(&lifecycle);
            let registry = Arc::clone(&registry);
            async move {
                while let Some(cmd) = cmd_rx.recv().await {
                    match cmd {
                        GatewayCommand::Register { context, respond_to } => {
                            let result = lifecycle.register(context).await.map(
                                |(conn_id, frames)| ClientConn { conn_id, frames },
                            );
                            let _ = respond_to.send(result);
                        }
                        GatewayCommand::Disconnect { id } => {
                            let _ = lifecycle.unregister(id);
                        }
                        GatewayCommand::Pong { id } => {
                            lifecycle.record_pong(id);
                        }
                        GatewayCommand::Publish { event } => {
                            let targets = router.route(&event);
                            if targets.is_empty() {
                                continue;
                            }
                            let frame = OutboundFrame::from_event(&event);
                            let _ = broadcaster
                                .broadcast(&targets, frame, &event.event_type)
                                .await;
                        }
                        GatewayCommand::Shutdown => {
                            info!("gateway shutting down");
                            let _ = shutdown_tx.send(true);
                            for id in registry.all() {
                                let _ = lifecycle
                                    .force_close(id, CloseReason::ServerShutdown)
                                    .await;
                            }
                            break;
                        }
                    }
                }
                debug!("gateway command loop stopped");
            }
        });

        Ok(handle)
    }
}
