// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Integration tests for the Ethernet shim over an in-memory segment.

mod common;

use aris::loopback::Segment;
use aris::{
    AppName, DifConfig, EthShim, FactoryRegistry, FlowSpec, Gha, ShimError, ShimInstance,
    register_eth_factories,
};
use aris::eth::{ETH_P_RINA, FrameType, build_frame};
use common::{ArrivalPolicy, TestController, wait_for};
use std::sync::Arc;
use std::time::Duration;

const MAC_A: Gha = Gha::new([0x02, 0, 0, 0, 0, 0x0A]);
const MAC_B: Gha = Gha::new([0x02, 0, 0, 0, 0, 0x0B]);

struct EthPair {
    controller: Arc<TestController>,
    segment: Arc<Segment>,
    _family: Arc<EthShim>,
    a: Arc<dyn ShimInstance>,
    b: Arc<dyn ShimInstance>,
}

fn eth_pair(policy: ArrivalPolicy) -> EthPair {
    let controller = TestController::new(policy);
    let segment = Segment::new();
    segment.add_device("ethA", MAC_A, 1500);
    segment.add_device("ethB", MAC_B, 1500);

    let family = EthShim::with_resolve_timeout(
        controller.clone(),
        segment.clone(),
        Duration::from_millis(200),
    );
    segment.attach(&family);

    let registry = FactoryRegistry::new();
    register_eth_factories(&registry, &family).unwrap();
    let handle = registry.find("shim-eth").unwrap();

    let a = registry
        .create(handle, &AppName::from_process_name("eth.A"), 1, 0)
        .unwrap();
    let b = registry
        .create(handle, &AppName::from_process_name("eth.B"), 2, 0)
        .unwrap();
    controller.add_instance(a.clone());
    controller.add_instance(b.clone());

    let dif = AppName::from_process_name("eth-dif");
    a.assign_to_dif(&dif, &DifConfig::from_entries(&[("interface-name", "ethA")]))
        .unwrap();
    b.assign_to_dif(&dif, &DifConfig::from_entries(&[("interface-name", "ethB")]))
        .unwrap();

    EthPair {
        controller,
        segment,
        _family: family,
        a,
        b,
    }
}

#[test]
fn test_local_allocate_and_transfer() {
    let pair = eth_pair(ArrivalPolicy::Accept);
    let alpha_name = AppName::from_process_name("alpha");
    let beta_name = AppName::from_process_name("beta");
    let alpha = pair.controller.add_user("alpha");
    let beta = pair.controller.add_user("beta");

    pair.a.application_register(&alpha_name, None).unwrap();
    pair.b.application_register(&beta_name, None).unwrap();

    let port_a = pair.controller.reserve(1);
    pair.a
        .flow_allocate_request(
            alpha.clone(),
            &alpha_name,
            &beta_name,
            &FlowSpec::default(),
            port_a,
        )
        .unwrap();

    // Address resolution succeeds and A's side reaches ALLOCATED.
    assert_eq!(
        pair.controller.wait_alloc_result(port_a, Duration::from_secs(2)),
        Some(true)
    );

    pair.a.du_write(port_a, vec![1, 2, 3], false).unwrap();

    // The first data frame makes B's controller observe the arrival,
    // named after the resolver's reverse lookup.
    let arrival = pair
        .controller
        .wait_arrival(2, Duration::from_secs(2))
        .expect("no flow arrived on B");
    assert_eq!(arrival.local_app, beta_name);
    assert_eq!(arrival.remote_app.process_name, "alpha");

    assert!(beta.wait_received(1, Duration::from_secs(2)));
    assert_eq!(beta.received.lock().unwrap()[0], vec![1, 2, 3]);

    // A second SDU follows the live path.
    pair.a.du_write(port_a, vec![4, 5], false).unwrap();
    assert!(beta.wait_received(2, Duration::from_secs(2)));
    assert_eq!(beta.received.lock().unwrap()[1], vec![4, 5]);
}

#[test]
fn test_remote_first_frame_synthesizes_pending_flow() {
    let pair = eth_pair(ArrivalPolicy::Manual);
    let alpha_name = AppName::from_process_name("alpha");
    let alpha = pair.controller.add_user("alpha");
    pair.a.application_register(&alpha_name, None).unwrap();

    // A frame from an unknown peer arrives before any allocation.
    let rogue = Gha::new([0x02, 0, 0, 0, 0, 0x99]);
    let frame = build_frame(MAC_A, rogue, ETH_P_RINA, &[0xEE]);
    pair._family.receive_frame("ethA", &frame, FrameType::Host);

    let arrival = pair
        .controller
        .wait_arrival(1, Duration::from_secs(2))
        .expect("no flow arrived");
    assert_eq!(arrival.remote_app.process_name, "Unknown app");

    // Another frame lands in the SDU queue while PENDING.
    let frame = build_frame(MAC_A, rogue, ETH_P_RINA, &[0xEF]);
    pair._family.receive_frame("ethA", &frame, FrameType::Host);
    pair.segment.settle(Duration::from_secs(1));

    // On accept, queued SDUs drain in arrival order.
    pair.a
        .flow_allocate_response(
            Some(alpha.clone() as Arc<dyn aris::UserIpcp>),
            arrival.port_id,
            true,
        )
        .unwrap();
    assert!(alpha.wait_received(2, Duration::from_secs(2)));
    let received = alpha.received.lock().unwrap();
    assert_eq!(*received, vec![vec![0xEE], vec![0xEF]]);
}

#[test]
fn test_refused_flow_stays_as_null_stub() {
    let pair = eth_pair(ArrivalPolicy::Manual);
    let alpha_name = AppName::from_process_name("alpha");
    pair.a.application_register(&alpha_name, None).unwrap();

    let rogue = Gha::new([0x02, 0, 0, 0, 0, 0x98]);
    let frame = build_frame(MAC_A, rogue, ETH_P_RINA, &[0x01]);
    pair._family.receive_frame("ethA", &frame, FrameType::Host);
    let arrival = pair
        .controller
        .wait_arrival(1, Duration::from_secs(2))
        .unwrap();

    pair.a
        .flow_allocate_response(None, arrival.port_id, false)
        .unwrap();

    // The stub survives with no queue; later frames are dropped, and
    // the port-id still resolves until the controller deallocates.
    let snapshot = pair.a.snapshot();
    assert_eq!(snapshot.flows.len(), 1);
    assert_eq!(snapshot.flows[0].queued_sdus, 0);

    let frame = build_frame(MAC_A, rogue, ETH_P_RINA, &[0x02]);
    pair._family.receive_frame("ethA", &frame, FrameType::Host);
    pair.segment.settle(Duration::from_secs(1));
    assert_eq!(pair.a.snapshot().flows[0].queued_sdus, 0);

    pair.a.flow_deallocate(arrival.port_id).unwrap();
    assert!(pair.a.snapshot().flows.is_empty());
}

#[test]
fn test_allocate_request_to_unknown_peer_fails() {
    let pair = eth_pair(ArrivalPolicy::Accept);
    let alpha_name = AppName::from_process_name("alpha");
    let alpha = pair.controller.add_user("alpha");
    pair.a.application_register(&alpha_name, None).unwrap();

    let port_a = pair.controller.reserve(1);
    pair.a
        .flow_allocate_request(
            alpha,
            &alpha_name,
            &AppName::from_process_name("nobody"),
            &FlowSpec::default(),
            port_a,
        )
        .unwrap();

    // Resolution times out and the allocation fails.
    assert_eq!(
        pair.controller.wait_alloc_result(port_a, Duration::from_secs(2)),
        Some(false)
    );
    assert!(pair.a.snapshot().flows.is_empty());
}

#[test]
fn test_mtu_bounds_egress_sdu_size() {
    let pair = eth_pair(ArrivalPolicy::Accept);
    let alpha_name = AppName::from_process_name("alpha");
    let beta_name = AppName::from_process_name("beta");
    let alpha = pair.controller.add_user("alpha");
    pair.controller.add_user("beta");
    pair.a.application_register(&alpha_name, None).unwrap();
    pair.b.application_register(&beta_name, None).unwrap();

    let port_a = pair.controller.reserve(1);
    pair.a
        .flow_allocate_request(alpha, &alpha_name, &beta_name, &FlowSpec::default(), port_a)
        .unwrap();
    pair.controller
        .wait_alloc_result(port_a, Duration::from_secs(2))
        .unwrap();

    assert_eq!(pair.a.max_sdu_size(), 1500 - 14);
    // Exactly mtu - header fits; one byte more does not.
    pair.a
        .du_write(port_a, vec![0u8; 1500 - 14], false)
        .unwrap();
    assert!(matches!(
        pair.a.du_write(port_a, vec![0u8; 1500 - 14 + 1], false),
        Err(ShimError::BadArgument(_))
    ));
}

#[test]
fn test_tx_busy_backpressure_and_reenable() {
    let pair = eth_pair(ArrivalPolicy::Accept);
    let alpha_name = AppName::from_process_name("alpha");
    let beta_name = AppName::from_process_name("beta");
    let alpha = pair.controller.add_user("alpha");
    pair.controller.add_user("beta");
    pair.a.application_register(&alpha_name, None).unwrap();
    pair.b.application_register(&beta_name, None).unwrap();

    let port_a = pair.controller.reserve(1);
    pair.a
        .flow_allocate_request(
            alpha.clone(),
            &alpha_name,
            &beta_name,
            &FlowSpec::default(),
            port_a,
        )
        .unwrap();
    pair.controller
        .wait_alloc_result(port_a, Duration::from_secs(2))
        .unwrap();

    let seg_dev = pair.segment.device("ethA").unwrap();
    seg_dev.set_busy(true);

    assert!(matches!(
        pair.a.du_write(port_a, vec![9], false),
        Err(ShimError::WouldBlock)
    ));
    // Until the device recovers, every write would block.
    assert!(matches!(
        pair.a.du_write(port_a, vec![9], false),
        Err(ShimError::WouldBlock)
    ));

    seg_dev.set_busy(false);
    pair._family.transmit_completed("ethA");
    assert!(
        wait_for(Duration::from_secs(1), || {
            (alpha.enable_writes.load(std::sync::atomic::Ordering::SeqCst) > 0).then_some(())
        })
        .is_some()
    );
    pair.a.du_write(port_a, vec![9], false).unwrap();
}

#[test]
fn test_device_state_change_notifies_users() {
    let pair = eth_pair(ArrivalPolicy::Accept);
    let alpha_name = AppName::from_process_name("alpha");
    let beta_name = AppName::from_process_name("beta");
    let alpha = pair.controller.add_user("alpha");
    pair.controller.add_user("beta");
    pair.a.application_register(&alpha_name, None).unwrap();
    pair.b.application_register(&beta_name, None).unwrap();

    let port_a = pair.controller.reserve(1);
    pair.a
        .flow_allocate_request(
            alpha.clone(),
            &alpha_name,
            &beta_name,
            &FlowSpec::default(),
            port_a,
        )
        .unwrap();
    pair.controller
        .wait_alloc_result(port_a, Duration::from_secs(2))
        .unwrap();

    pair._family.device_state_changed("ethA", false);
    pair._family.device_state_changed("ethA", true);
    let events = alpha.nm1_events.lock().unwrap().clone();
    assert_eq!(events, vec![false, true]);
}

#[test]
fn test_vlan_compat_mode_binds_tagged_interface() {
    let controller = TestController::new(ArrivalPolicy::Accept);
    let segment = Segment::new();
    segment.add_device("eth0", MAC_A, 1500);
    segment.add_device("eth0.42", MAC_A, 1496);

    let family = EthShim::new(controller.clone(), segment.clone());
    let registry = FactoryRegistry::new();
    register_eth_factories(&registry, &family).unwrap();
    let handle = registry.find("shim-eth-vlan").unwrap();

    let instance = registry
        .create(handle, &AppName::from_process_name("eth.vlan"), 1, 0)
        .unwrap();

    // The DIF process name carries the VLAN id in compat mode.
    instance
        .assign_to_dif(
            &AppName::from_process_name("42"),
            &DifConfig::from_entries(&[("interface-name", "eth0")]),
        )
        .unwrap();
    assert_eq!(instance.max_sdu_size(), 1496 - 14);

    // Reserved VLAN ids are refused.
    let other = registry
        .create(handle, &AppName::from_process_name("eth.vlan2"), 2, 0)
        .unwrap();
    for bad in ["0", "1", "4095", "4096"] {
        assert!(
            other
                .assign_to_dif(
                    &AppName::from_process_name(bad),
                    &DifConfig::from_entries(&[("interface-name", "eth0")]),
                )
                .is_err(),
            "VLAN id {bad} must be rejected"
        );
    }
}

#[test]
fn test_register_unregister_round_trip() {
    let pair = eth_pair(ArrivalPolicy::Accept);
    let alpha_name = AppName::from_process_name("alpha");

    let before = serde_json::to_string(&pair.a.snapshot()).unwrap();
    pair.a.application_register(&alpha_name, None).unwrap();
    assert!(
        pair.a
            .application_register(&alpha_name, None)
            .is_err(),
        "double registration must conflict"
    );
    pair.a.application_unregister(&alpha_name).unwrap();
    let after = serde_json::to_string(&pair.a.snapshot()).unwrap();
    assert_eq!(before, after);
}
