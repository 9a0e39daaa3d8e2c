// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Integration tests for the hypervisor shim over a cross-linked VMPI
//! pair.

mod common;

use aris::hv::HvShim;
use aris::loopback::{LoopVmpi, StaticVmpiProvider};
use aris::{AppName, DifConfig, FactoryRegistry, FlowSpec, ShimError, ShimInstance};
use common::{ArrivalPolicy, TestController};
use std::sync::Arc;
use std::time::Duration;

struct HvPair {
    controller: Arc<TestController>,
    _family: Arc<HvShim>,
    a: Arc<dyn ShimInstance>,
    b: Arc<dyn ShimInstance>,
}

fn hv_pair(policy: ArrivalPolicy) -> HvPair {
    let controller = TestController::new(policy);
    let provider = StaticVmpiProvider::new();
    let (end_a, end_b) = LoopVmpi::pair();
    provider.insert(1, end_a);
    provider.insert(2, end_b);

    let family = HvShim::new(controller.clone(), provider);
    let registry = FactoryRegistry::new();
    registry.register("shim-hv", family.clone()).unwrap();
    let handle = registry.find("shim-hv").unwrap();

    let a = registry
        .create(handle, &AppName::from_process_name("hv.A"), 1, 0)
        .unwrap();
    let b = registry
        .create(handle, &AppName::from_process_name("hv.B"), 2, 0)
        .unwrap();
    controller.add_instance(a.clone());
    controller.add_instance(b.clone());

    let dif = AppName::from_process_name("hv-dif");
    a.assign_to_dif(&dif, &DifConfig::from_entries(&[("vmpi-id", "1")]))
        .unwrap();
    b.assign_to_dif(&dif, &DifConfig::from_entries(&[("vmpi-id", "2")]))
        .unwrap();

    HvPair {
        controller,
        _family: family,
        a,
        b,
    }
}

#[test]
fn test_allocate_and_transfer_over_channel() {
    let pair = hv_pair(ArrivalPolicy::Accept);
    let guest = pair.controller.add_user("guest");
    let host = pair.controller.add_user("host");
    pair.b
        .application_register(&AppName::from_process_name("host"), None)
        .unwrap();

    let port_a = pair.controller.reserve(1);
    pair.a
        .flow_allocate_request(
            guest.clone(),
            &AppName::from_process_name("guest"),
            &AppName::from_process_name("host"),
            &FlowSpec::default(),
            port_a,
        )
        .unwrap();

    // The peer sees the request with both names intact.
    let arrival = pair
        .controller
        .wait_arrival(2, Duration::from_secs(2))
        .expect("ALLOCATE_REQ never arrived");
    assert_eq!(arrival.local_app.process_name, "host");
    assert_eq!(arrival.remote_app.process_name, "guest");

    // The RESP_OK travels back and completes the initiator side.
    assert_eq!(
        pair.controller.wait_alloc_result(port_a, Duration::from_secs(2)),
        Some(true)
    );

    pair.a.du_write(port_a, vec![7, 8, 9], false).unwrap();
    assert!(host.wait_received(1, Duration::from_secs(2)));
    assert_eq!(host.received.lock().unwrap()[0], vec![7, 8, 9]);

    // And the reverse direction over the same channel.
    pair.b
        .du_write(arrival.port_id, vec![4, 2], false)
        .unwrap();
    assert!(guest.wait_received(1, Duration::from_secs(2)));
    assert_eq!(guest.received.lock().unwrap()[0], vec![4, 2]);
}

#[test]
fn test_rejected_allocation_releases_channel() {
    let pair = hv_pair(ArrivalPolicy::Reject);
    let guest = pair.controller.add_user("guest");

    let port_a = pair.controller.reserve(1);
    pair.a
        .flow_allocate_request(
            guest,
            &AppName::from_process_name("guest"),
            &AppName::from_process_name("host"),
            &FlowSpec::default(),
            port_a,
        )
        .unwrap();

    assert_eq!(
        pair.controller.wait_alloc_result(port_a, Duration::from_secs(2)),
        Some(false)
    );
    // Both sides end with no bound channel.
    assert!(pair.a.snapshot().flows.is_empty());
    assert!(pair.b.snapshot().flows.is_empty());
}

#[test]
fn test_deallocate_propagates_to_peer() {
    let pair = hv_pair(ArrivalPolicy::Accept);
    let guest = pair.controller.add_user("guest");
    pair.controller.add_user("host");

    let port_a = pair.controller.reserve(1);
    pair.a
        .flow_allocate_request(
            guest,
            &AppName::from_process_name("guest"),
            &AppName::from_process_name("host"),
            &FlowSpec::default(),
            port_a,
        )
        .unwrap();
    assert_eq!(
        pair.controller.wait_alloc_result(port_a, Duration::from_secs(2)),
        Some(true)
    );
    let arrival = pair.controller.wait_arrival(2, Duration::from_secs(2)).unwrap();

    pair.a.flow_deallocate(port_a).unwrap();

    // The peer observes a remote release for its port-id.
    let (port_id, remote) = pair
        .controller
        .wait_dealloc(2, Duration::from_secs(2))
        .expect("DEALLOCATE never arrived");
    assert_eq!(port_id, arrival.port_id);
    assert!(remote);
    assert!(pair.a.snapshot().flows.is_empty());
    assert!(pair.b.snapshot().flows.is_empty());
}

#[test]
fn test_missing_vmpi_id_is_rejected() {
    let controller = TestController::new(ArrivalPolicy::Accept);
    let provider = StaticVmpiProvider::new();
    let family = HvShim::new(controller, provider);
    let registry = FactoryRegistry::new();
    registry.register("shim-hv", family).unwrap();
    let handle = registry.find("shim-hv").unwrap();
    let instance = registry
        .create(handle, &AppName::from_process_name("hv.X"), 9, 0)
        .unwrap();

    assert!(matches!(
        instance.assign_to_dif(
            &AppName::from_process_name("hv-dif"),
            &DifConfig::from_entries(&[("unrelated", "1")]),
        ),
        Err(ShimError::Config(_))
    ));
    assert!(matches!(
        instance.assign_to_dif(
            &AppName::from_process_name("hv-dif"),
            &DifConfig::from_entries(&[("vmpi-id", "5")]),
        ),
        Err(ShimError::NotFound(_))
    ));
}

#[test]
fn test_du_write_requires_allocated_channel() {
    let pair = hv_pair(ArrivalPolicy::Accept);
    assert!(matches!(
        pair.a.du_write(1234, vec![1], false),
        Err(ShimError::NotFound(_))
    ));
}
