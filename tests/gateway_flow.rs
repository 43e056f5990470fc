use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

use evgate::{
    AcceptAll, BreakerConfig, ClientConn, ConnContext, Criticality, EventBus, Gateway,
    GatewayConfig, GatewayHandle, InMemoryBus, InboundEvent, MemoryDeadLetterSink,
    NoSectorAssignments, OutboundFrame, RetryConfig, Role, RouteScope, RoutingPolicy,
    TtlSectorCache,
};

fn policy() -> RoutingPolicy {
    RoutingPolicy::new()
        .with_rule("ROUND_READY", RouteScope::Sector, Criticality::Durable)
        .with_rule("BILL_REQUESTED", RouteScope::Session, Criticality::Durable)
        .with_rule("MENU_CHANGED", RouteScope::Branch, Criticality::BestEffort)
}

fn fast_config() -> GatewayConfig {
    GatewayConfig::builder()
        .retry(RetryConfig {
            base_delay_ms: 1,
            max_delay_ms: 5,
        })
        .build()
        .unwrap()
}

async fn spawn_gateway(bus: Arc<InMemoryBus>) -> GatewayHandle {
    Gateway::spawn(
        fast_config(),
        policy(),
        bus,
        Arc::new(AcceptAll),
        Arc::new(NoSectorAssignments),
        Arc::new(MemoryDeadLetterSink::new()),
        Vec::new(),
    )
    .await
    .unwrap()
}

async fn connect(
    handle: &GatewayHandle,
    tenant: u64,
    branch: u64,
    user: u64,
    role: Role,
    sector: Option<u64>,
    session: Option<u64>,
) -> ClientConn {
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
    handle.register(b.build().unwrap()).await.unwrap()
}

fn event(event_type: &str, tenant: u64, branch: u64, sector: Option<u64>) -> InboundEvent {
    InboundEvent {
        event_type: event_type.into(),
        tenant_id: tenant,
        branch_id: Some(branch),
        sector_id: sector,
        session_id: None,
        entity: json!({"round_id": 42, "version": 5}),
        timestamp: Utc::now().to_rfc3339(),
    }
}

async fn expect_frame(conn: &mut ClientConn, frame_type: &str) -> OutboundFrame {
    loop {
        let frame = timeout(Duration::from_secs(5), conn.frames.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("frame channel closed");
        // Heartbeat pings may interleave with event frames
        if frame.frame_type == frame_type {
            return frame;
        }
    }
}

async fn expect_silence(conn: &mut ClientConn, frame_type: &str) {
    if let Ok(Some(frame)) = timeout(Duration::from_millis(300), conn.frames.recv()).await {
        assert_ne!(frame.frame_type, frame_type, "unexpected delivery");
    }
}

#[tokio::test]
async fn sector_event_through_durable_stream() {
    let bus = Arc::new(InMemoryBus::new());
    let handle = spawn_gateway(Arc::clone(&bus)).await;

    let mut sector3 = connect(&handle, 1, 7, 1, Role::Waiter, Some(3), None).await;
    let mut sector4 = connect(&handle, 1, 7, 2, Role::Waiter, Some(4), None).await;
    let mut manager = connect(&handle, 1, 7, 3, Role::Manager, None, None).await;

    let raw = serde_json::to_vec(&event("ROUND_READY", 1, 7, Some(3))).unwrap();
    bus.stream_add("events.durable", Bytes::from(raw))
        .await
        .unwrap();

    let frame = expect_frame(&mut sector3, "ROUND_READY").await;
    assert_eq!(frame.payload["round_id"], 42);
    expect_frame(&mut manager, "ROUND_READY").await;
    expect_silence(&mut sector4, "ROUND_READY").await;

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn volatile_event_through_pubsub() {
    let bus = Arc::new(InMemoryBus::new());
    let handle = spawn_gateway(Arc::clone(&bus)).await;

    let mut kitchen = connect(&handle, 1, 7, 1, Role::Kitchen, None, None).await;

    // The pub/sub loop needs to be subscribed before publishing
    tokio::time::sleep(Duration::from_millis(100)).await;
    let raw = serde_json::to_vec(&event("MENU_CHANGED", 1, 7, None)).unwrap();
    bus.publish("events.volatile", Bytes::from(raw))
        .await
        .unwrap();

    expect_frame(&mut kitchen, "MENU_CHANGED").await;
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn colliding_branch_ids_never_cross_tenants() {
    let bus = Arc::new(InMemoryBus::new());
    let handle = spawn_gateway(Arc::clone(&bus)).await;

    // Same branch id 7 under two different tenants
    let mut ours = connect(&handle, 1, 7, 1, Role::Waiter, Some(3), None).await;
    let mut theirs = connect(&handle, 2, 7, 2, Role::Waiter, Some(3), None).await;
    let mut their_manager = connect(&handle, 2, 7, 3, Role::Manager, None, None).await;

    handle
        .publish(event("ROUND_READY", 1, 7, Some(3)))
        .await
        .unwrap();

    expect_frame(&mut ours, "ROUND_READY").await;
    expect_silence(&mut theirs, "ROUND_READY").await;
    expect_silence(&mut their_manager, "ROUND_READY").await;

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn large_fanout_reaches_every_branch_connection() {
    let bus = Arc::new(InMemoryBus::new());
    let handle = spawn_gateway(Arc::clone(&bus)).await;

    // 400 connections across 8 branches, 50 each; one branch gets the event
    let mut target_conns = Vec::new();
    for branch in 0..8u64 {
        for i in 0..50u64 {
            let conn = connect(&handle, 1, branch + 1, branch * 100 + i, Role::Kitchen, None, None)
                .await;
            if branch == 0 {
                target_conns.push(conn);
            }
        }
    }

    handle
        .publish(event("MENU_CHANGED", 1, 1, None))
        .await
        .unwrap();

    for conn in target_conns.iter_mut() {
        expect_frame(conn, "MENU_CHANGED").await;
    }
    let snap = handle.metrics();
    assert_eq!(snap.active_connections, 400);
    assert!(snap.broadcasts_sent >= 50);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn exhausted_retries_land_in_dead_letter_sink() {
    let bus = Arc::new(InMemoryBus::new());
    let sink = Arc::new(MemoryDeadLetterSink::new());
    let handle = Gateway::spawn(
        fast_config(),
        policy(),
        Arc::clone(&bus) as Arc<dyn EventBus>,
        Arc::new(AcceptAll),
        Arc::new(NoSectorAssignments),
        Arc::clone(&sink) as Arc<dyn evgate::DeadLetterSink>,
        Vec::new(),
    )
    .await
    .unwrap();

    // A sector-scoped target whose frame channel is closed: every
    // delivery fails
    let mut conn = connect(&handle, 1, 7, 1, Role::Manager, None, None).await;
    conn.frames.close();

    let raw = serde_json::to_vec(&event("ROUND_READY", 1, 7, Some(3))).unwrap();
    bus.stream_add("events.durable", Bytes::from(raw))
        .await
        .unwrap();

    let mut records = Vec::new();
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        records = sink.records();
        if !records.is_empty() {
            break;
        }
    }
    assert_eq!(records.len(), 1, "entry was not dead-lettered");
    assert_eq!(records[0].retry_count, 3);
    assert_eq!(records[0].stream, "events.durable");
    assert_eq!(records[0].payload["type"], "ROUND_READY");
    assert_eq!(handle.metrics().dead_letters, 1);

    // The entry was acknowledged: exactly one record, no redelivery
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sink.records().len(), 1);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn malformed_stream_entries_are_counted_and_dropped() {
    let bus = Arc::new(InMemoryBus::new());
    let sink = Arc::new(MemoryDeadLetterSink::new());
    let handle = Gateway::spawn(
        fast_config(),
        policy(),
        Arc::clone(&bus) as Arc<dyn EventBus>,
        Arc::new(AcceptAll),
        Arc::new(NoSectorAssignments),
        Arc::clone(&sink) as Arc<dyn evgate::DeadLetterSink>,
        Vec::new(),
    )
    .await
    .unwrap();

    bus.stream_add("events.durable", Bytes::from_static(b"{broken"))
        .await
        .unwrap();

    let mut malformed = 0;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        malformed = handle.metrics().events_malformed;
        if malformed > 0 {
            break;
        }
    }
    assert_eq!(malformed, 1);
    // Malformed entries are dropped, never dead-lettered
    assert!(sink.records().is_empty());

    handle.shutdown().await.unwrap();
}

struct FailingBus;

#[async_trait::async_trait]
impl EventBus for FailingBus {
    async fn publish(&self, _channel: &str, _payload: Bytes) -> evgate::Result<()> {
        Err(evgate::GateError::Bus("down".into()))
    }
    async fn subscribe(
        &self,
        _channel: &str,
    ) -> evgate::Result<mpsc::Receiver<evgate::PubSubItem>> {
        Err(evgate::GateError::Bus("down".into()))
    }
    async fn stream_add(&self, _stream: &str, _payload: Bytes) -> evgate::Result<String> {
        Err(evgate::GateError::Bus("down".into()))
    }
    async fn read_group(
        &self,
        _stream: &str,
        _group: &str,
        _consumer: &str,
        _count: usize,
    ) -> evgate::Result<Vec<evgate::StreamEntry>> {
        Err(evgate::GateError::Bus("down".into()))
    }
    async fn ack(&self, _stream: &str, _group: &str, _id: &str) -> evgate::Result<()> {
        Err(evgate::GateError::Bus("down".into()))
    }
    async fn claim_idle(
        &self,
        _stream: &str,
        _group: &str,
        _consumer: &str,
        _min_idle: Duration,
    ) -> evgate::Result<Vec<evgate::StreamEntry>> {
        Err(evgate::GateError::Bus("down".into()))
    }
    async fn pending_count(&self, _stream: &str, _group: &str) -> evgate::Result<u64> {
        Err(evgate::GateError::Bus("down".into()))
    }
}

#[tokio::test]
async fn failing_bus_opens_the_breaker() {
    let config = GatewayConfig::builder()
        .retry(RetryConfig {
            base_delay_ms: 1,
            max_delay_ms: 5,
        })
        .breaker(BreakerConfig {
            failure_threshold: 5,
            open_secs: 3600,
            half_open_trials: 1,
        })
        .build()
        .unwrap();
    let handle = Gateway::spawn(
        config,
        policy(),
        Arc::new(FailingBus),
        Arc::new(AcceptAll),
        Arc::new(NoSectorAssignments),
        Arc::new(MemoryDeadLetterSink::new()),
        Vec::new(),
    )
    .await
    .unwrap();

    let mut health = handle.health().await;
    for _ in 0..200 {
        if health.breaker_state == "open" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        health = handle.health().await;
    }
    assert_eq!(health.breaker_state, "open");
    assert!(handle.metrics().bus_reconnects >= 5);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn concurrent_register_disconnect_and_publish() {
    let bus = Arc::new(InMemoryBus::new());
    let handle = spawn_gateway(Arc::clone(&bus)).await;

    let mut tasks = Vec::new();
    for user in 0..20u64 {
        let handle = handle.clone();
        tasks.push(tokio::spawn(async move {
            for round in 0..10u64 {
                let conn = connect(&handle, 1, user % 4 + 1, user, Role::Kitchen, None, None).await;
                if round % 2 == 0 {
                    handle.disconnect(conn.conn_id).await.unwrap();
                } else {
                    // Dropped receiver; the broadcaster flags it dead and
                    // the reaper cleans it up
                    drop(conn);
                }
                handle
                    .publish(event("MENU_CHANGED", 1, user % 4 + 1, None))
                    .await
                    .unwrap();
            }
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }

    let snap = handle.metrics();
    assert!(snap.broadcasts_sent + snap.broadcasts_failed > 0);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn ingress_pending_reflects_unacked_entries() {
    let bus = Arc::new(InMemoryBus::new());
    let handle = spawn_gateway(Arc::clone(&bus)).await;

    // No connections: durable entries route to nobody and are acked
    let raw = serde_json::to_vec(&event("ROUND_READY", 1, 7, Some(3))).unwrap();
    bus.stream_add("events.durable", Bytes::from(raw))
        .await
        .unwrap();

    let mut pending = u64::MAX;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        pending = handle.health().await.ingress_pending;
        if pending == 0 {
            break;
        }
    }
    assert_eq!(pending, 0);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn cached_sector_assignment_scopes_routing() {
    let bus = Arc::new(InMemoryBus::new());
    let sectors = Arc::new(TtlSectorCache::new(Duration::from_secs(60)));
    sectors.insert(1, 1, 3);
    let handle = Gateway::spawn(
        fast_config(),
        policy(),
        Arc::clone(&bus) as Arc<dyn EventBus>,
        Arc::new(AcceptAll),
        Arc::clone(&sectors) as Arc<dyn evgate::SectorAssignmentCache>,
        Arc::new(MemoryDeadLetterSink::new()),
        Vec::new(),
    )
    .await
    .unwrap();

    // Both waiters connect without a sector; only user 1 has a cached
    // assignment
    let mut assigned = connect(&handle, 1, 7, 1, Role::Waiter, None, None).await;
    let mut unassigned = connect(&handle, 1, 7, 2, Role::Waiter, None, None).await;

    handle
        .publish(event("ROUND_READY", 1, 7, Some(3)))
        .await
        .unwrap();

    expect_frame(&mut assigned, "ROUND_READY").await;
    expect_silence(&mut unassigned, "ROUND_READY").await;

    handle.shutdown().await.unwrap();
}
