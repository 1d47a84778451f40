//! Domain-by-domain rollout driven by the background scan

use std::time::Duration;

use strata_core::{ErrorCodeValue, FailoverConfig, NodeId, TaskRegistry};
use strata_failover::{
    CancelFabricUpgradeReply, HealthEntity, HealthState, NodeCache, NodeUpMessage, NodeUpReply,
};
use strata_testkit::{init_tracing, node, node_instance, request, version, FmHarness};

fn cluster(config: FailoverConfig) -> FmHarness {
    FmHarness::new(
        config,
        version("1.0", 3),
        [node(1, "0", version("1.0", 3)), node(2, "1", version("1.0", 3))],
    )
}

fn asked(h: &FmHarness) -> Vec<NodeId> {
    h.sender
        .upgrade_requests()
        .into_iter()
        .map(|(to, _)| to.id)
        .collect()
}

#[test]
fn upgrade_rolls_through_domains_in_order() {
    init_tracing();
    let h = cluster(FailoverConfig::default());
    h.fm.process_upgrade_fabric_request(&request("2.0", 5));

    h.scan().unwrap();
    assert_eq!(asked(&h), vec![NodeId::new(1)]);
    assert!(h.nodes.get_node(NodeId::new(1)).unwrap().is_pending_fabric_upgrade);
    assert!(h.fm.upgrade_manager().completed_upgrade_domains().is_empty());

    h.node_reached(node_instance(1, 1), version("2.0", 5));
    let upgraded = h.nodes.get_node(NodeId::new(1)).unwrap();
    assert_eq!(upgraded.version_instance, version("2.0", 5));
    assert!(!upgraded.is_pending_fabric_upgrade);

    h.scan().unwrap();
    assert_eq!(h.fm.upgrade_manager().completed_upgrade_domains(), vec!["0".to_string()]);

    h.scan().unwrap();
    assert_eq!(asked(&h), vec![NodeId::new(1), NodeId::new(2)]);

    h.node_reached(node_instance(2, 1), version("2.0", 5));
    h.scan().unwrap();

    let manager = h.fm.upgrade_manager();
    assert!(!manager.is_upgrade_in_progress());
    assert_eq!(manager.current_version_instance(), version("2.0", 5));
    assert_eq!(h.store.version(), Some(version("2.0", 5)));
}

#[test]
fn pending_node_is_asked_again_on_every_scan() {
    let h = cluster(FailoverConfig::default());
    h.fm.process_upgrade_fabric_request(&request("2.0", 5));

    h.scan().unwrap();
    h.scan().unwrap();

    assert_eq!(asked(&h), vec![NodeId::new(1), NodeId::new(1)]);
    let live = h.fm.upgrade_manager().upgrade().unwrap();
    assert!(live.progress().pending.contains(&NodeId::new(1)));
}

#[test]
fn reply_for_domain_not_yet_started_is_ignored() {
    let h = cluster(FailoverConfig::default());
    h.fm.process_upgrade_fabric_request(&request("2.0", 5));

    h.node_reached(node_instance(2, 1), version("2.0", 5));

    assert_eq!(h.nodes.get_node(NodeId::new(2)).unwrap().version_instance, version("1.0", 3));
}

#[test]
fn cancel_reply_at_target_clears_pending_flag() {
    let h = cluster(FailoverConfig::default());
    h.fm.process_upgrade_fabric_request(&request("2.0", 5));
    h.scan().unwrap();

    let mismatched = CancelFabricUpgradeReply {
        version_instance: version("1.0", 3),
    };
    h.runtime
        .block_on(h.fm.process_cancel_fabric_upgrade_reply(&mismatched, node_instance(1, 1)));
    assert!(h.nodes.get_node(NodeId::new(1)).unwrap().is_pending_fabric_upgrade);

    let reply = CancelFabricUpgradeReply {
        version_instance: version("2.0", 5),
    };
    h.runtime
        .block_on(h.fm.process_cancel_fabric_upgrade_reply(&reply, node_instance(1, 1)));

    let node = h.nodes.get_node(NodeId::new(1)).unwrap();
    assert!(!node.is_pending_fabric_upgrade);
    assert_eq!(node.version_instance, version("1.0", 3));
}

#[test]
fn unsafe_node_waits_for_the_check_timeout() {
    let h = cluster(FailoverConfig::default());
    let mut upgrade = request("2.0", 5);
    upgrade.upgrade_replica_set_check_timeout = Duration::from_secs(60);
    h.fm.process_upgrade_fabric_request(&upgrade);
    h.safety.block(NodeId::new(1));

    h.scan().unwrap();
    assert!(asked(&h).is_empty());
    let live = h.fm.upgrade_manager().upgrade().unwrap();
    assert!(live.progress().waiting.contains(&NodeId::new(1)));

    h.runtime.advance(Duration::from_secs(30));
    h.scan().unwrap();
    assert!(asked(&h).is_empty());

    h.runtime.advance(Duration::from_secs(30));
    h.scan().unwrap();
    assert_eq!(asked(&h), vec![NodeId::new(1)]);
}

#[test]
fn released_node_goes_before_the_timeout() {
    let h = cluster(FailoverConfig::default());
    let mut upgrade = request("2.0", 5);
    upgrade.upgrade_replica_set_check_timeout = Duration::from_secs(600);
    h.fm.process_upgrade_fabric_request(&upgrade);
    h.safety.block(NodeId::new(1));
    h.scan().unwrap();

    h.safety.release(NodeId::new(1));
    h.scan().unwrap();

    assert_eq!(asked(&h), vec![NodeId::new(1)]);
}

#[test]
fn down_node_does_not_hold_its_domain() {
    let h = cluster(FailoverConfig::default());
    h.fm.process_upgrade_fabric_request(&request("2.0", 5));
    h.fm.process_node_down(node_instance(1, 1)).unwrap();

    h.scan().unwrap();

    assert!(asked(&h).is_empty());
    assert_eq!(h.fm.upgrade_manager().completed_upgrade_domains(), vec!["0".to_string()]);
}

#[test]
fn manual_upgrade_waits_for_verified_domains() {
    let h = cluster(FailoverConfig::default());
    let mut manual = request("2.0", 5);
    manual.specification.is_manual = true;
    h.fm.process_upgrade_fabric_request(&manual);

    h.scan().unwrap();
    h.node_reached(node_instance(1, 1), version("2.0", 5));
    h.scan().unwrap();
    h.scan().unwrap();

    assert_eq!(h.fm.upgrade_manager().completed_upgrade_domains(), vec!["0".to_string()]);
    assert_eq!(asked(&h), vec![NodeId::new(1)]);

    manual.verified_upgrade_domains = vec!["0".to_string()];
    manual.sequence_number = 1;
    let reply = h.fm.process_upgrade_fabric_request(&manual);
    assert_eq!(reply.error, ErrorCodeValue::Success);

    h.scan().unwrap();
    assert_eq!(asked(&h), vec![NodeId::new(1), NodeId::new(2)]);
}

#[test]
fn new_domain_joins_the_live_upgrade() {
    let h = cluster(FailoverConfig::default());
    h.fm.process_upgrade_fabric_request(&request("2.0", 5));

    let reply = h.fm.process_node_up(&NodeUpMessage {
        node: node_instance(3, 1),
        upgrade_domain: "2".to_string(),
        version_instance: version("1.0", 3),
    });
    assert_eq!(reply.error, ErrorCodeValue::Success);
    h.scan().unwrap();

    let live = h.fm.upgrade_manager().upgrade().unwrap();
    assert_eq!(
        live.upgrade_domains().domains().to_vec(),
        vec!["0".to_string(), "1".to_string(), "2".to_string()]
    );
}

#[test]
fn scan_reports_upgrade_health() {
    let h = cluster(FailoverConfig::default());
    h.fm.process_upgrade_fabric_request(&request("2.0", 5));

    h.scan().unwrap();
    let report = h.health.reports().pop().unwrap();
    assert_eq!(report.entity, HealthEntity::Cluster);
    assert_eq!(report.property, "FabricUpgrade");
    assert_eq!(report.state, HealthState::Ok);
    assert_eq!(report.attributes["CurrentUpgradeDomain"], "0");

    h.runtime.advance(Duration::from_secs(31 * 60));
    h.scan().unwrap();
    let slow = h.health.reports().pop().unwrap();
    assert_eq!(slow.state, HealthState::Warning);
    assert!(slow.sequence_number > report.sequence_number);
}

#[tokio::test(start_paused = true)]
async fn background_task_scans_every_interval_until_shutdown() {
    let h = cluster(FailoverConfig::default());
    h.fm.process_upgrade_fabric_request(&request("2.0", 5));
    let tasks = TaskRegistry::current().unwrap();

    h.fm.start_background(&tasks);
    tokio::time::sleep(Duration::from_millis(7_500)).await;
    assert_eq!(asked(&h), vec![NodeId::new(1), NodeId::new(1)]);

    tasks.shutdown();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(asked(&h).len(), 2);
}

#[test]
fn scan_without_upgrade_does_nothing() {
    let h = cluster(FailoverConfig::default());

    h.scan().unwrap();

    assert!(asked(&h).is_empty());
    assert!(h.health.reports().is_empty());
    assert_eq!(h.store.write_count(), 0);
}

// =============================================================================
// Gatekeeping
// =============================================================================

fn node_up(h: &FmHarness, id: u128, domain: &str, code: &str, inst: u64) -> NodeUpReply {
    h.fm.process_node_up(&NodeUpMessage {
        node: node_instance(id, 2),
        upgrade_domain: domain.to_string(),
        version_instance: version(code, inst),
    })
}

#[test]
fn node_ahead_of_its_domain_is_turned_away() {
    let h = cluster(FailoverConfig::default());
    h.fm.process_upgrade_fabric_request(&request("2.0", 5));

    let reply = node_up(&h, 2, "1", "2.0", 5);

    assert_eq!(reply.error, ErrorCodeValue::InvalidRolloutVersion);
    assert_eq!(reply.target_version_instance, version("1.0", 3));
    assert_eq!(h.nodes.get_node(NodeId::new(2)).unwrap().instance, node_instance(2, 1));
}

#[test]
fn started_domain_accepts_old_and_new_versions() {
    let h = cluster(FailoverConfig::default());
    h.fm.process_upgrade_fabric_request(&request("2.0", 5));

    let old = node_up(&h, 1, "0", "1.0", 3);
    let new = node_up(&h, 4, "0", "2.0", 5);

    assert_eq!(old.error, ErrorCodeValue::Success);
    assert_eq!(new.error, ErrorCodeValue::Success);
    assert_eq!(old.target_version_instance, version("2.0", 5));
}

#[test]
fn gatekeeping_can_be_turned_off() {
    let config = FailoverConfig {
        fabric_upgrade_gatekeeping_enabled: false,
        ..FailoverConfig::default()
    };
    let h = cluster(config);
    h.fm.process_upgrade_fabric_request(&request("2.0", 5));

    let reply = node_up(&h, 2, "1", "2.0", 5);

    assert_eq!(reply.error, ErrorCodeValue::Success);
    assert_eq!(h.nodes.get_node(NodeId::new(2)).unwrap().version_instance, version("2.0", 5));
}
