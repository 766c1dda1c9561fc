use super::*;
use crate::network::container::{ContainerNetworkManager, FilterRule};
use crate::network::gateway::GatewaySettings;
use crate::network::ingress::RouterIngressService;
use crate::network::vlan::PersistentVlanAllocator;
use crate::paths::DefaultPathResolver;
use crate::router::{PATH_BRIDGE_PORT, PATH_DHCP_CLIENT, PATH_IP_ADDRESS, PATH_VLAN};
use crate::testing::{FakeDhcp, FakeLinkTable, RecordingPacketFilter, RecordingRouter, ScriptedSupervisor};
use crate::types::{InterfaceStatus, VirtualInterface};
use serde_json::json;
use std::time::SystemTime;

struct Harness {
    orchestrator: BridgeOrchestrator,
    router: Arc<RecordingRouter>,
    state: Arc<StateManager>,
    allocator: Arc<PersistentVlanAllocator>,
    supervisor: Arc<ScriptedSupervisor>,
    filter: Arc<RecordingPacketFilter>,
    dhcp: Arc<FakeDhcp>,
    events: EventBus,
    _dir: tempfile::TempDir,
}

async fn harness_with(config: Option<VifConfig>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let router = Arc::new(RecordingRouter::new());
    let state = Arc::new(StateManager::new_in_memory().await.unwrap());
    let events = EventBus::new();
    let allocator = Arc::new(
        PersistentVlanAllocator::new(state.clone(), 100, 199)
            .unwrap()
            .with_router_check(router.clone())
            .with_events(events.clone()),
    );

    let supervisor = Arc::new(ScriptedSupervisor::new());
    let links = Arc::new(FakeLinkTable::new());
    supervisor.bring_up_links(links.clone());
    let gateways = Arc::new(GatewayManager::new(
        supervisor.clone(),
        links,
        Arc::new(DefaultPathResolver::with_base(dir.path())),
        GatewaySettings::default(),
    ));
    let factory = Arc::new(InterfaceFactory::new(router.clone(), state.clone(), events.clone(), "ether1"));

    let filter = Arc::new(RecordingPacketFilter::new());
    let dhcp = Arc::new(FakeDhcp::new());
    let ingress = Arc::new(RouterIngressService::new(router.clone(), dhcp.clone(), allocator.clone(), "ether1"));

    let mut orchestrator = BridgeOrchestrator::new(
        state.clone(),
        allocator.clone(),
        factory,
        gateways,
        router.clone(),
        events.clone(),
    );
    if let Some(config) = config {
        orchestrator = orchestrator
            .with_dual_vlan(ingress, Arc::new(ContainerNetworkManager::new(filter.clone())))
            .with_config(&config);
    }

    Harness { orchestrator, router, state, allocator, supervisor, filter, dhcp, events, _dir: dir }
}

async fn harness() -> Harness {
    harness_with(None).await
}

async fn dual_harness() -> Harness {
    let config = VifConfig {
        ingress_bridge: Some("bridge-lan".to_string()),
        dns_redirect_port: Some(5353),
        ..VifConfig::default()
    };
    harness_with(Some(config)).await
}

async fn tor_instance(h: &Harness, id: &str) -> ServiceInstance {
    let instance = ServiceInstance::new(id, "router-1", "tor", id).with_config("socks_port", json!(9050));
    h.state.insert_instance(&instance).await.unwrap();
    instance
}

// ======================== Single-VLAN Bridge ========================

#[tokio::test]
async fn test_setup_bridge_provisions_everything() {
    let h = harness().await;
    let mut sub = h.events.subscribe(vec!["bridge.*".to_string()]);
    let instance = tor_instance(&h, "usa").await;

    let result = h.orchestrator.setup_bridge(&instance, &FeatureManifest::new("tor")).await.unwrap();
    assert_eq!(result.vlan_id, 100);
    assert_eq!(result.bind_ip, "10.99.100.1");
    assert_eq!(result.interface.interface_name, "nnc-tor-usa");
    assert_eq!(result.interface.gateway_status, GatewayStatus::Running);

    let gateway = result.gateway.unwrap();
    assert_eq!(gateway.tun_name, "tun-tor-usa");
    // Bind address injected into the gateway's SOCKS endpoint
    assert_eq!(gateway.socks_addr, "10.99.100.1");
    assert_eq!(gateway.socks_port, 9050);

    let stored = h.state.get_instance("usa").await.unwrap();
    assert_eq!(stored.vlan_id, Some(100));
    assert_eq!(stored.bind_ip.as_deref(), Some("10.99.100.1"));

    let vif = h.state.find_interface_by_instance("usa").await.unwrap().unwrap();
    assert_eq!(vif.status, InterfaceStatus::Active);
    assert_eq!(vif.gateway_type, GatewayType::HevSocks5Tunnel);
    assert_eq!(vif.gateway_status, GatewayStatus::Running);
    assert!(h.allocator.is_allocated("router-1", 100).await.unwrap());

    let event = sub.recv().await.unwrap();
    assert!(event.is(EventType::BridgeSetupComplete));
    assert_eq!(event.metadata.get("vlan_id").map(String::as_str), Some("100"));
}

#[tokio::test]
async fn test_setup_without_gateway() {
    let h = harness().await;
    let instance = ServiceInstance::new("dns-1", "router-1", "adguard", "home");
    h.state.insert_instance(&instance).await.unwrap();

    let result = h.orchestrator.setup_bridge(&instance, &FeatureManifest::new("adguard")).await.unwrap();
    assert!(result.gateway.is_none());
    assert_eq!(result.interface.gateway_type, GatewayType::None);
    assert!(h.supervisor.calls().is_empty());
}

#[tokio::test]
async fn test_explicit_socks_address_is_kept() {
    let h = harness().await;
    let instance = ServiceInstance::new("sb-1", "router-1", "singbox", "sg")
        .with_config("socks_address", json!("172.17.0.5"))
        .with_config("socks_port", json!("1080"));
    h.state.insert_instance(&instance).await.unwrap();

    let result = h.orchestrator.setup_bridge(&instance, &FeatureManifest::new("singbox")).await.unwrap();
    let gateway = result.gateway.unwrap();
    assert_eq!(gateway.socks_addr, "172.17.0.5");
    assert!(gateway.udp_enabled);
}

#[tokio::test]
async fn test_gateway_failure_rolls_back_interface_and_vlan() {
    let h = harness().await;
    h.supervisor.fail_start(true);
    let instance = tor_instance(&h, "usa").await;

    let err = h.orchestrator.setup_bridge(&instance, &FeatureManifest::new("tor")).await.unwrap_err();
    assert!(matches!(err, VifError::GatewayStartFailed { .. }), "got {:?}", err);

    assert!(h.state.find_interface_by_instance("usa").await.unwrap().is_none());
    assert!(h.router.items(PATH_VLAN).is_empty());
    assert!(h.router.items(PATH_IP_ADDRESS).is_empty());
    assert!(!h.allocator.is_allocated("router-1", 100).await.unwrap());
    assert_eq!(h.state.get_instance("usa").await.unwrap().vlan_id, None);
}

#[tokio::test]
async fn test_interface_failure_releases_vlan() {
    let h = harness().await;
    h.router.fail_on(PATH_IP_ADDRESS, "add");
    let instance = tor_instance(&h, "usa").await;

    let err = h.orchestrator.setup_bridge(&instance, &FeatureManifest::new("tor")).await.unwrap_err();
    assert!(matches!(err, VifError::ProvisioningFailed { ref step, .. } if step == "ip-address"));
    assert!(!h.allocator.is_allocated("router-1", 100).await.unwrap());
    assert!(h.supervisor.calls().is_empty());
}

#[tokio::test]
async fn test_retry_after_failed_setup_succeeds() {
    let h = harness().await;
    h.router.fail_on(PATH_IP_ADDRESS, "add");
    let instance = tor_instance(&h, "usa").await;
    assert!(h.orchestrator.setup_bridge(&instance, &FeatureManifest::new("tor")).await.is_err());
    assert!(h.state.find_interface_by_instance("usa").await.unwrap().is_none());

    h.router.clear_failures();
    let result = h.orchestrator.setup_bridge(&instance, &FeatureManifest::new("tor")).await.unwrap();
    // The cursor has moved past the released ID
    assert_eq!(result.vlan_id, 101);
    assert!(!h.allocator.is_allocated("router-1", 100).await.unwrap());
    assert_eq!(h.state.get_instance("usa").await.unwrap().vlan_id, Some(101));
    assert_eq!(h.router.items(PATH_VLAN).len(), 1);
}

#[tokio::test]
async fn test_teardown_keeps_vlan_reassigned_to_another_instance() {
    let h = harness().await;
    h.router.fail_on(PATH_IP_ADDRESS, "add");
    let first = tor_instance(&h, "first").await;
    assert!(h.orchestrator.setup_bridge(&first, &FeatureManifest::new("tor")).await.is_err());
    h.router.clear_failures();

    // Take 101..=199 so the released 100 is the only free ID
    for id in 101..=199 {
        h.state.upsert_vlan_allocation("router-1", id, "filler", "tor", "").await.unwrap();
    }
    let second = tor_instance(&h, "second").await;
    let result = h.orchestrator.setup_bridge(&second, &FeatureManifest::new("tor")).await.unwrap();
    assert_eq!(result.vlan_id, 100);

    // Stale bridge fields on the first instance still pointing at 100
    h.state.set_instance_bridge("first", 100, "10.99.100.1").await.unwrap();

    h.orchestrator.teardown_bridge("first").await.unwrap();
    assert_eq!(h.state.get_instance("first").await.unwrap().vlan_id, None);
    assert!(h.allocator.is_allocated("router-1", 100).await.unwrap());
    assert_eq!(h.allocator.owner_of("router-1", 100).await.unwrap().as_deref(), Some("second"));
    assert_eq!(h.router.items(PATH_VLAN).len(), 1);

    h.orchestrator.teardown_bridge("second").await.unwrap();
    assert!(!h.allocator.is_allocated("router-1", 100).await.unwrap());
}

#[tokio::test]
async fn test_persist_failure_stops_gateway() {
    let h = harness().await;
    // Instance was never stored, so recording the bridge on it fails
    let instance = ServiceInstance::new("ghost", "router-1", "tor", "ghost").with_config("socks_port", json!(9050));

    let err = h.orchestrator.setup_bridge(&instance, &FeatureManifest::new("tor")).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(h.supervisor.calls().contains(&"stop:gw-ghost".to_string()));
    assert!(h.state.find_interface_by_instance("ghost").await.unwrap().is_none());
    assert!(!h.allocator.is_allocated("router-1", 100).await.unwrap());
}

#[tokio::test]
async fn test_teardown_reverses_setup() {
    let h = harness().await;
    let instance = tor_instance(&h, "usa").await;
    h.orchestrator.setup_bridge(&instance, &FeatureManifest::new("tor")).await.unwrap();
    let mut sub = h.events.subscribe(vec!["bridge.teardown.complete".to_string()]);

    h.orchestrator.teardown_bridge("usa").await.unwrap();

    assert!(h.supervisor.calls().contains(&"stop:gw-usa".to_string()));
    assert!(h.state.find_interface_by_instance("usa").await.unwrap().is_none());
    assert!(h.router.items(PATH_VLAN).is_empty());
    assert!(!h.allocator.is_allocated("router-1", 100).await.unwrap());
    let stored = h.state.get_instance("usa").await.unwrap();
    assert_eq!(stored.vlan_id, None);
    assert_eq!(stored.bind_ip, None);
    assert!(sub.recv().await.unwrap().is(EventType::BridgeTeardownComplete));

    // Repeatable
    h.orchestrator.teardown_bridge("usa").await.unwrap();
}

#[tokio::test]
async fn test_teardown_unknown_instance_is_ok() {
    let h = harness().await;
    h.orchestrator.teardown_bridge("nope").await.unwrap();
    assert!(h.router.commands().is_empty());
}

#[tokio::test]
async fn test_concurrent_operation_rejected() {
    let h = harness().await;
    let instance = tor_instance(&h, "usa").await;

    let guard = h.orchestrator.in_flight.acquire("usa").unwrap();
    assert!(h.orchestrator.is_busy("usa"));
    let err = h.orchestrator.setup_bridge(&instance, &FeatureManifest::new("tor")).await.unwrap_err();
    assert!(matches!(err, VifError::OperationInProgress { .. }));
    let err = h.orchestrator.teardown_bridge("usa").await.unwrap_err();
    assert!(matches!(err, VifError::OperationInProgress { .. }));
    assert!(h.router.commands().is_empty());

    drop(guard);
    h.orchestrator.setup_bridge(&instance, &FeatureManifest::new("tor")).await.unwrap();
    assert!(!h.orchestrator.is_busy("usa"));
}

// ======================== Dual-VLAN Bridge ========================

#[tokio::test]
async fn test_dual_vlan_bridge_lifecycle() {
    let h = dual_harness().await;
    let instance = tor_instance(&h, "usa").await;
    let mut sub = h.events.subscribe(vec!["bridge.*".to_string()]);

    let bridge = h.orchestrator.setup_dual_vlan_bridge(&instance, &FeatureManifest::new("tor")).await.unwrap();
    let event = sub.recv().await.unwrap();
    assert!(event.is(EventType::BridgeSetupComplete));
    assert_eq!(event.resource_id, "usa");
    assert_eq!(event.metadata["mode"], "dual");
    assert_eq!(event.metadata["vlan_id"], "100");
    assert_eq!(event.metadata["ingress_vlan_id"], "101");
    assert_eq!(bridge.egress.vlan_id, 100);
    assert_eq!(bridge.ingress.vlan_id, 101);
    assert_eq!(bridge.ingress.router_interface, "nnc-ingress-tor-usa");
    assert_eq!(bridge.routing.ingress_interface, "eth0.101");
    assert_eq!(bridge.routing.egress_interface, "eth0.100");
    assert_eq!(bridge.bridge_name.as_deref(), Some("bridge-lan"));

    assert!(h.dhcp.running(101).is_some());
    assert_eq!(h.router.items(PATH_BRIDGE_PORT).len(), 1);
    let rules = h.filter.active_rules();
    assert_eq!(rules.len(), 5);
    assert!(rules.iter().any(|r| matches!(r, FilterRule::DnsRedirect { to_port: 5353, .. })));
    assert_eq!(h.orchestrator.list_dual_bridges().len(), 1);

    h.orchestrator.teardown_dual_vlan_bridge("usa").await.unwrap();
    let event = sub.recv().await.unwrap();
    assert!(event.is(EventType::BridgeTeardownComplete));
    assert_eq!(event.metadata["mode"], "dual");
    assert_eq!(event.metadata["ingress_vlan_id"], "101");
    assert!(h.filter.active_rules().is_empty());
    assert!(h.dhcp.running(101).is_none());
    assert!(h.router.items(PATH_BRIDGE_PORT).is_empty());
    assert!(h.router.items(PATH_DHCP_CLIENT).is_empty());
    assert!(h.router.items(PATH_VLAN).is_empty());
    assert!(!h.allocator.is_allocated("router-1", 100).await.unwrap());
    assert!(!h.allocator.is_allocated("router-1", 101).await.unwrap());
    assert!(h.orchestrator.list_dual_bridges().is_empty());
}

#[tokio::test]
async fn test_dual_vlan_forwarding_failure_unwinds() {
    let h = dual_harness().await;
    let instance = tor_instance(&h, "usa").await;
    h.filter.fail_append_call(2);

    let err = h.orchestrator.setup_dual_vlan_bridge(&instance, &FeatureManifest::new("tor")).await.unwrap_err();
    assert!(matches!(err, VifError::PacketFilterFailed { .. }));

    assert!(h.filter.active_rules().is_empty());
    assert!(h.dhcp.running(101).is_none());
    assert!(h.router.items(PATH_BRIDGE_PORT).is_empty());
    assert!(h.router.items(PATH_VLAN).is_empty());
    assert!(h.state.find_interface_by_instance("usa").await.unwrap().is_none());
    assert!(!h.allocator.is_allocated("router-1", 100).await.unwrap());
    assert!(!h.allocator.is_allocated("router-1", 101).await.unwrap());
    assert!(h.orchestrator.list_dual_bridges().is_empty());
    assert!(!h.orchestrator.is_busy("usa"));
}

#[tokio::test]
async fn test_dual_vlan_bridge_attach_failure_unwinds() {
    let h = dual_harness().await;
    let instance = tor_instance(&h, "usa").await;
    h.router.fail_on(PATH_BRIDGE_PORT, "add");

    let err = h.orchestrator.setup_dual_vlan_bridge(&instance, &FeatureManifest::new("tor")).await.unwrap_err();
    assert!(matches!(err, VifError::RouterCommandFailed { .. }));
    assert!(h.router.items(PATH_VLAN).is_empty());
    assert!(h.filter.active_rules().is_empty());
    assert!(h.supervisor.calls().contains(&"stop:gw-usa".to_string()));
}

#[tokio::test]
async fn test_dual_vlan_requires_collaborators() {
    let h = harness().await;
    let instance = tor_instance(&h, "usa").await;
    let err = h.orchestrator.setup_dual_vlan_bridge(&instance, &FeatureManifest::new("tor")).await.unwrap_err();
    assert!(matches!(err, VifError::InvalidConfig { .. }));
    assert!(h.router.commands().is_empty());
}

// ======================== Startup Reconciliation ========================

fn record(instance_id: &str, name: &str, vlan_id: u16) -> VirtualInterface {
    VirtualInterface {
        id: format!("vif-{}", instance_id),
        instance_id: instance_id.to_string(),
        interface_name: name.to_string(),
        vlan_id,
        ip_address: VirtualInterface::address_for(vlan_id),
        gateway_type: GatewayType::None,
        gateway_status: GatewayStatus::Stopped,
        routing_mark: name.to_string(),
        status: InterfaceStatus::Active,
        created_at: SystemTime::now(),
        updated_at: SystemTime::now(),
    }
}

#[tokio::test]
async fn test_reconcile_removes_only_orphans() {
    let h = harness().await;
    for name in ["nnc-a", "nnc-b", "eth1"] {
        h.router.seed(PATH_VLAN, &[("name", name)]);
    }
    h.state.insert_interface(&record("inst-a", "nnc-a", 100)).await.unwrap();

    let report = h.orchestrator.reconcile_on_startup().await.unwrap();
    assert_eq!(
        report,
        ReconcileReport { router_interfaces: 2, db_records: 1, orphans_found: 1, orphans_removed: 1 }
    );

    let mut remaining: Vec<String> =
        h.router.items(PATH_VLAN).into_iter().filter_map(|mut row| row.remove("name")).collect();
    remaining.sort();
    assert_eq!(remaining, vec!["eth1".to_string(), "nnc-a".to_string()]);
    assert_eq!(h.router.count(PATH_VLAN, "remove"), 1);
}

#[tokio::test]
async fn test_reconcile_keeps_tracked_ingress_vlans() {
    let h = dual_harness().await;
    let instance = tor_instance(&h, "usa").await;
    h.orchestrator.setup_dual_vlan_bridge(&instance, &FeatureManifest::new("tor")).await.unwrap();
    h.router.seed(PATH_VLAN, &[("name", "nnc-ingress-stale")]);

    let report = h.orchestrator.reconcile_on_startup().await.unwrap();
    assert_eq!(report.router_interfaces, 3);
    assert_eq!(report.orphans_removed, 1);
    assert_eq!(h.router.items(PATH_VLAN).len(), 2);
}

#[tokio::test]
async fn test_reconcile_counts_failed_removals() {
    let h = harness().await;
    h.router.seed(PATH_VLAN, &[("name", "nnc-x")]);
    h.router.fail_on(PATH_VLAN, "remove");

    let report = h.orchestrator.reconcile_on_startup().await.unwrap();
    assert_eq!(report.orphans_found, 1);
    assert_eq!(report.orphans_removed, 0);
}
