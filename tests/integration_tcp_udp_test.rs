// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Integration tests for the TCP/UDP shim over real loopback sockets.

mod common;

use aris::tcp_udp::{TCP_UDP_BUFFER_SIZE, TcpUdpShim};
use aris::{AppName, DifConfig, FactoryRegistry, FlowSpec, ShimError, ShimInstance};
use common::{ArrivalPolicy, TestController, wait_for};
use std::io::Write;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

fn unreliable() -> FlowSpec {
    FlowSpec {
        max_allowable_gap: -1,
        ..FlowSpec::default()
    }
}

fn reliable() -> FlowSpec {
    FlowSpec {
        max_allowable_gap: 0,
        ordered_delivery: true,
        partial_delivery: false,
        ..FlowSpec::default()
    }
}

struct TcpUdpPair {
    controller: Arc<TestController>,
    _family: Arc<TcpUdpShim>,
    a: Arc<dyn ShimInstance>,
    b: Arc<dyn ShimInstance>,
}

/// Two instances in one family: `a` (the initiator, 127.0.0.2) knows
/// `server` lives at 127.0.0.1:`port`; `b` expects `server` to
/// register on that port.
fn tcp_udp_pair(policy: ArrivalPolicy, port: u16) -> TcpUdpPair {
    let controller = TestController::new(policy);
    let family = TcpUdpShim::new(controller.clone());

    let registry = FactoryRegistry::new();
    registry.register("shim-tcp-udp", family.clone()).unwrap();
    let handle = registry.find("shim-tcp-udp").unwrap();

    let a = registry
        .create(handle, &AppName::from_process_name("tcpudp.A"), 1, 0)
        .unwrap();
    let b = registry
        .create(handle, &AppName::from_process_name("tcpudp.B"), 2, 0)
        .unwrap();
    controller.add_instance(a.clone());
    controller.add_instance(b.clone());

    let dif = AppName::from_process_name("ip-dif");
    a.assign_to_dif(
        &dif,
        &DifConfig::from_entries(&[
            ("hostname", "127.0.0.2"),
            ("dirEntry", &format!(":1:server::127.0.0.1:{port}")),
        ]),
    )
    .unwrap();
    b.assign_to_dif(
        &dif,
        &DifConfig::from_entries(&[
            ("hostname", "127.0.0.1"),
            ("expReg", &format!(":1:server::{port}")),
        ]),
    )
    .unwrap();

    TcpUdpPair {
        controller,
        _family: family,
        a,
        b,
    }
}

#[test]
fn test_udp_flow_queues_until_accepted() {
    let pair = tcp_udp_pair(ArrivalPolicy::Manual, 47011);
    let server_name = AppName::new("server", "", "", "");
    let server = pair.controller.add_user("server");
    let client = pair.controller.add_user("client");
    pair.b.application_register(&server_name, None).unwrap();

    let port_a = pair.controller.reserve(1);
    pair.a
        .flow_allocate_request(
            client,
            &AppName::from_process_name("client"),
            &server_name,
            &unreliable(),
            port_a,
        )
        .unwrap();
    // UDP allocation completes locally right away.
    assert_eq!(
        pair.controller.wait_alloc_result(port_a, Duration::from_secs(2)),
        Some(true)
    );

    pair.a.du_write(port_a, b"one".to_vec(), false).unwrap();

    let arrival = pair
        .controller
        .wait_arrival(2, Duration::from_secs(2))
        .expect("no flow arrived on the server side");
    assert_eq!(arrival.local_app.process_name, "server");
    // Source is synthesized from the assigned port-id.
    assert_eq!(arrival.remote_app.process_name, "Unknown app");
    assert_eq!(arrival.remote_app.process_instance, arrival.port_id.to_string());

    // A second SDU lands in the flow's queue while still PENDING.
    pair.a.du_write(port_a, b"two".to_vec(), false).unwrap();
    wait_for(Duration::from_secs(1), || {
        let snapshot = pair.b.snapshot();
        (snapshot.flows.first().map(|f| f.queued_sdus) == Some(2)).then_some(())
    })
    .expect("SDUs were not queued on the pending flow");

    pair.b
        .flow_allocate_response(
            Some(server.clone() as Arc<dyn aris::UserIpcp>),
            arrival.port_id,
            true,
        )
        .unwrap();
    assert!(server.wait_received(2, Duration::from_secs(2)));
    {
        let received = server.received.lock().unwrap();
        assert_eq!(*received, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    // After the transition, SDUs take the live path in order.
    pair.a.du_write(port_a, b"three".to_vec(), false).unwrap();
    assert!(server.wait_received(3, Duration::from_secs(2)));
    assert_eq!(server.received.lock().unwrap()[2], b"three".to_vec());
}

#[test]
fn test_tcp_flow_end_to_end_both_directions() {
    let pair = tcp_udp_pair(ArrivalPolicy::Accept, 47012);
    let server_name = AppName::new("server", "", "", "");
    let server = pair.controller.add_user("server");
    let client = pair.controller.add_user("client");
    pair.b.application_register(&server_name, None).unwrap();

    let port_a = pair.controller.reserve(1);
    pair.a
        .flow_allocate_request(
            client.clone(),
            &AppName::from_process_name("client"),
            &server_name,
            &reliable(),
            port_a,
        )
        .unwrap();
    assert_eq!(
        pair.controller.wait_alloc_result(port_a, Duration::from_secs(2)),
        Some(true)
    );

    let arrival = pair
        .controller
        .wait_arrival(2, Duration::from_secs(2))
        .expect("accept never reached the controller");

    pair.a
        .du_write(port_a, vec![0xAA, 0xBB, 0xCC], false)
        .unwrap();
    assert!(server.wait_received(1, Duration::from_secs(2)));
    assert_eq!(server.received.lock().unwrap()[0], vec![0xAA, 0xBB, 0xCC]);

    // And back, over the accepted socket.
    pair.b
        .du_write(arrival.port_id, vec![0x01, 0x02], false)
        .unwrap();
    assert!(client.wait_received(1, Duration::from_secs(2)));
    assert_eq!(client.received.lock().unwrap()[0], vec![0x01, 0x02]);
}

#[test]
fn test_tcp_split_length_prefix() {
    let pair = tcp_udp_pair(ArrivalPolicy::Accept, 47013);
    let server_name = AppName::new("server", "", "", "");
    let server = pair.controller.add_user("server");
    pair.b.application_register(&server_name, None).unwrap();

    let mut raw = TcpStream::connect("127.0.0.1:47013").unwrap();
    pair.controller
        .wait_arrival(2, Duration::from_secs(2))
        .expect("accept never reached the controller");

    // Only the first byte of the length prefix...
    raw.write_all(&[0x00]).unwrap();
    raw.flush().unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert!(server.received.lock().unwrap().is_empty());

    // ...then the rest: exactly one SDU comes out.
    raw.write_all(&[0x03, 0xAA, 0xBB, 0xCC]).unwrap();
    raw.flush().unwrap();
    assert!(server.wait_received(1, Duration::from_secs(2)));
    let received = server.received.lock().unwrap();
    assert_eq!(*received, vec![vec![0xAA, 0xBB, 0xCC]]);
}

#[test]
fn test_tcp_partial_payload() {
    let pair = tcp_udp_pair(ArrivalPolicy::Accept, 47014);
    let server_name = AppName::new("server", "", "", "");
    let server = pair.controller.add_user("server");
    pair.b.application_register(&server_name, None).unwrap();

    let mut raw = TcpStream::connect("127.0.0.1:47014").unwrap();
    pair.controller
        .wait_arrival(2, Duration::from_secs(2))
        .expect("accept never reached the controller");

    raw.write_all(&[0x00, 0x04, 0xAA, 0xBB]).unwrap();
    raw.flush().unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert!(server.received.lock().unwrap().is_empty());

    raw.write_all(&[0xCC, 0xDD]).unwrap();
    raw.flush().unwrap();
    assert!(server.wait_received(1, Duration::from_secs(2)));
    let received = server.received.lock().unwrap();
    assert_eq!(*received, vec![vec![0xAA, 0xBB, 0xCC, 0xDD]]);
}

#[test]
fn test_tcp_remote_release() {
    let pair = tcp_udp_pair(ArrivalPolicy::Accept, 47015);
    let server_name = AppName::new("server", "", "", "");
    pair.controller.add_user("server");
    pair.b.application_register(&server_name, None).unwrap();

    let raw = TcpStream::connect("127.0.0.1:47015").unwrap();
    let arrival = pair
        .controller
        .wait_arrival(2, Duration::from_secs(2))
        .expect("accept never reached the controller");

    // The peer closing its end tears the flow down remotely.
    drop(raw);
    let (port_id, remote) = pair
        .controller
        .wait_dealloc(2, Duration::from_secs(2))
        .expect("remote release was not reported");
    assert_eq!(port_id, arrival.port_id);
    assert!(remote);
    assert!(
        pair.controller
            .released_ports
            .lock()
            .unwrap()
            .contains(&arrival.port_id)
    );
    assert!(pair.b.snapshot().flows.is_empty());
}

#[test]
fn test_sdu_size_bounds() {
    let pair = tcp_udp_pair(ArrivalPolicy::Accept, 47016);
    let server_name = AppName::new("server", "", "", "");
    let server = pair.controller.add_user("server");
    let client = pair.controller.add_user("client");
    pair.b.application_register(&server_name, None).unwrap();

    let tcp_port = pair.controller.reserve(1);
    pair.a
        .flow_allocate_request(
            client.clone(),
            &AppName::from_process_name("client"),
            &server_name,
            &reliable(),
            tcp_port,
        )
        .unwrap();
    assert_eq!(
        pair.controller.wait_alloc_result(tcp_port, Duration::from_secs(2)),
        Some(true)
    );

    // The length prefix costs a reliable flow two bytes.
    pair.a
        .du_write(tcp_port, vec![0u8; TCP_UDP_BUFFER_SIZE - 2], false)
        .unwrap();
    assert!(matches!(
        pair.a.du_write(tcp_port, vec![0u8; TCP_UDP_BUFFER_SIZE - 1], false),
        Err(ShimError::BadArgument(_))
    ));
    assert!(server.wait_received(1, Duration::from_secs(5)));
    assert_eq!(
        server.received.lock().unwrap()[0].len(),
        TCP_UDP_BUFFER_SIZE - 2
    );

    let udp_port = pair.controller.reserve(1);
    pair.a
        .flow_allocate_request(
            client,
            &AppName::from_process_name("client"),
            &server_name,
            &unreliable(),
            udp_port,
        )
        .unwrap();
    // An unreliable SDU may fill the whole buffer, one byte more is
    // detected and refused at the gate.
    pair.a
        .du_write(udp_port, vec![0u8; TCP_UDP_BUFFER_SIZE], false)
        .unwrap();
    assert!(matches!(
        pair.a.du_write(udp_port, vec![0u8; TCP_UDP_BUFFER_SIZE + 1], false),
        Err(ShimError::BadArgument(_))
    ));
}

#[test]
fn test_dir_entry_update_and_removal() {
    let pair = tcp_udp_pair(ArrivalPolicy::Accept, 47017);
    let client = pair.controller.add_user("client");
    let server_name = AppName::new("server", "", "", "");

    // Re-assigning identical content is accepted and harmless.
    pair.a
        .update_dif_config(&DifConfig::from_entries(&[(
            "dirEntry",
            ":1:server::127.0.0.1:47017",
        )]))
        .unwrap();

    // A batch can update and then remove: an entry with an empty
    // address drops the mapping.
    pair.a
        .update_dif_config(&DifConfig::from_entries(&[(
            "dirEntry",
            ":2:server::127.0.0.1:47017:server:::",
        )]))
        .unwrap();
    let port = pair.controller.reserve(1);
    assert!(matches!(
        pair.a.flow_allocate_request(
            client,
            &AppName::from_process_name("client"),
            &server_name,
            &unreliable(),
            port,
        ),
        Err(ShimError::NotFound(_))
    ));
}

#[test]
fn test_legacy_config_syntax() {
    let controller = TestController::new(ArrivalPolicy::Accept);
    let family = TcpUdpShim::new(controller.clone());
    let instance = {
        use aris::ShimFactory;
        family
            .create(&AppName::from_process_name("tcpudp.L"), 9, 0)
            .unwrap()
    };

    instance
        .assign_to_dif(
            &AppName::from_process_name("ip-dif"),
            &DifConfig::from_entries(&[
                ("hostname", "127.0.0.3"),
                ("dirEntry", "1:6:server0:9:127.0.0.15:47018"),
                ("expReg", "1:6:server0:5:47018"),
            ]),
        )
        .unwrap();

    // The parsed expected registration admits the application.
    instance
        .application_register(&AppName::new("server", "", "", ""), None)
        .unwrap();
}

#[test]
fn test_registration_requires_expected_entry() {
    let pair = tcp_udp_pair(ArrivalPolicy::Accept, 47019);
    assert!(matches!(
        pair.b
            .application_register(&AppName::from_process_name("stranger"), None),
        Err(ShimError::NotFound(_))
    ));
}

#[test]
fn test_duplicate_hostname_rejected() {
    let pair = tcp_udp_pair(ArrivalPolicy::Accept, 47020);
    let registry = FactoryRegistry::new();
    registry
        .register("shim-tcp-udp", pair._family.clone())
        .unwrap();
    let handle = registry.find("shim-tcp-udp").unwrap();
    let c = registry
        .create(handle, &AppName::from_process_name("tcpudp.C"), 3, 0)
        .unwrap();
    assert!(matches!(
        c.assign_to_dif(
            &AppName::from_process_name("ip-dif"),
            &DifConfig::from_entries(&[("hostname", "127.0.0.1")]),
        ),
        Err(ShimError::NameConflict(_))
    ));
}
