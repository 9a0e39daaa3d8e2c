// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! TCP/UDP shim engine
//!
//! Carries RINA flows over IP: unreliable flows map onto UDP (one SDU
//! per datagram), reliable flows onto TCP with a 16-bit big-endian
//! length prefix per SDU. Destinations are resolved through a static
//! directory; local registrations bind the UDP/TCP socket pair listed
//! in the expected-registration table. A single receive worker polls
//! all sockets of all instances; egress goes through a bounded send
//! queue shared by the whole family.

use crate::controller::{Controller, UserIpcp};
use crate::error::ShimError;
use crate::factory::ShimFactory;
use crate::flow::{FlowState, Sdu, SduQueue, drain_sdu_queue};
use crate::ipcp::{
    ConfigEntry, DifConfig, FlowSnapshot, FlowSpec, InstanceSnapshot, IpcpId, PortId, ShimInstance,
    UpstreamPort,
};
use crate::name::AppName;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

/// Receive buffer size; also the largest SDU an unreliable flow
/// carries. Reliable flows lose two bytes to the length prefix.
pub const TCP_UDP_BUFFER_SIZE: usize = 65535;
const _: () = assert!(TCP_UDP_BUFFER_SIZE >= 2 && TCP_UDP_BUFFER_SIZE <= 65535);

/// Egress queue capacity; writes beyond this see WouldBlock.
pub const SEND_WQ_MAX_SIZE: usize = 1000;

const CUBE_UNRELIABLE: usize = 0;
const CUBE_RELIABLE: usize = 1;

/// Identity of one socket within the family, the demux key for flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SockId(u64);

fn next_sock_id() -> SockId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    SockId(NEXT.fetch_add(1, Ordering::Relaxed))
}

struct DirEntry {
    app_name: AppName,
    addr: SocketAddr,
}

struct ExpReg {
    app_name: AppName,
    port: u16,
}

struct RegApp {
    app_name: AppName,
    port: u16,
    udp: Arc<UdpSocket>,
    udp_id: SockId,
    tcp: Arc<TcpListener>,
    tcp_id: SockId,
}

enum FlowSock {
    /// UDP flows are keyed by `(socket, remote sockaddr)`. `owned` is
    /// set for the ephemeral client-side socket; server-side flows
    /// share the registered application's socket.
    Udp {
        sock: Arc<UdpSocket>,
        sock_id: SockId,
        peer: SocketAddr,
        owned: bool,
    },
    /// TCP flows are keyed by their connected socket.
    Tcp {
        stream: Arc<TcpStream>,
        sock_id: SockId,
    },
}

struct TcpUdpFlow {
    port_id: PortId,
    state: FlowState,
    sock: FlowSock,
    user_ipcp: Option<Arc<dyn UserIpcp>>,
    sdu_queue: Option<SduQueue>,
    sock_closed: bool,
    // Partial-receive accumulator for the TCP record parser.
    bytes_left: usize,
    partial: Option<Vec<u8>>,
}

impl TcpUdpFlow {
    fn is_reliable(&self) -> bool {
        matches!(self.sock, FlowSock::Tcp { .. })
    }

    fn matches_udp(&self, sock_id: SockId, peer: &SocketAddr) -> bool {
        matches!(&self.sock, FlowSock::Udp { sock_id: id, peer: p, .. }
                 if *id == sock_id && p == peer)
    }

    fn matches_tcp(&self, sock_id: SockId) -> bool {
        matches!(&self.sock, FlowSock::Tcp { sock_id: id, .. } if *id == sock_id)
    }

    fn close_socket(&mut self) {
        if let FlowSock::Tcp { stream, .. } = &self.sock {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.sock_closed = true;
    }
}

#[derive(Default)]
struct TcpUdpState {
    dif_name: Option<AppName>,
    hostname: Option<IpAddr>,
    directory: Vec<DirEntry>,
    exp_regs: Vec<ExpReg>,
    apps: Vec<RegApp>,
    flows: Vec<TcpUdpFlow>,
}

/// One TCP/UDP shim IPCP instance.
pub struct TcpUdpInstance {
    id: IpcpId,
    name: AppName,
    #[allow(dead_code)]
    upstream_port: UpstreamPort,
    qos: [FlowSpec; 2],
    family: Weak<TcpUdpShim>,
    state: Mutex<TcpUdpState>,
}

struct SndItem {
    instance: Weak<TcpUdpInstance>,
    port_id: PortId,
    sdu: Sdu,
}

#[derive(Default)]
struct SendQueueState {
    items: VecDeque<SndItem>,
    closed: bool,
}

/// The bounded egress queue shared by every instance of the family.
struct SendQueue {
    state: Mutex<SendQueueState>,
    cond: Condvar,
}

impl SendQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(SendQueueState::default()),
            cond: Condvar::new(),
        }
    }

    fn push(&self, item: SndItem) -> Result<(), ShimError> {
        let mut state = self.state.lock().unwrap();
        if state.items.len() == SEND_WQ_MAX_SIZE {
            log::debug!("output SDU queue is full, try later");
            return Err(ShimError::WouldBlock);
        }
        state.items.push_back(item);
        self.cond.notify_one();
        Ok(())
    }

    /// Blocks for the next item. The second value reports whether this
    /// pop just brought the queue below the high-water mark, i.e. the
    /// moment to re-enable writes.
    fn pop(&self) -> Option<(SndItem, bool)> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(item) = state.items.pop_front() {
                let drained = state.items.len() == SEND_WQ_MAX_SIZE - 1;
                return Some((item, drained));
            }
            if state.closed {
                return None;
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.cond.notify_all();
    }
}

/// Family-wide state; also the `shim-tcp-udp` factory.
pub struct TcpUdpShim {
    controller: Arc<dyn Controller>,
    self_ref: Weak<TcpUdpShim>,
    instances: Mutex<Vec<Arc<TcpUdpInstance>>>,
    send_q: Arc<SendQueue>,
    shutdown: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpUdpShim {
    pub fn new(controller: Arc<dyn Controller>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<TcpUdpShim>| TcpUdpShim {
            controller,
            self_ref: weak.clone(),
            instances: Mutex::new(Vec::new()),
            send_q: Arc::new(SendQueue::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Self::spawn_workers(weak.clone())),
        })
    }

    fn spawn_workers(weak: Weak<TcpUdpShim>) -> Vec<JoinHandle<()>> {
        let rcv_weak = weak.clone();
        let rcv = std::thread::Builder::new()
            .name("shim-tcp-udp-rwq".to_string())
            .spawn(move || {
                loop {
                    let Some(family) = rcv_weak.upgrade() else {
                        break;
                    };
                    if family.shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    let progress = family.poll_once();
                    drop(family);
                    if !progress {
                        std::thread::sleep(Duration::from_millis(2));
                    }
                }
            })
            .expect("failed to spawn receive worker");

        let snd_weak = weak;
        let snd = std::thread::Builder::new()
            .name("shim-tcp-udp-wwq".to_string())
            .spawn(move || {
                let send_q = loop {
                    match snd_weak.upgrade() {
                        Some(family) => break family.send_q.clone(),
                        None => std::thread::sleep(Duration::from_millis(1)),
                    }
                };
                while let Some((item, drained)) = send_q.pop() {
                    if drained {
                        if let Some(family) = snd_weak.upgrade() {
                            family.enable_all_flows();
                        }
                    }
                    if let Some(instance) = item.instance.upgrade() {
                        instance.sdu_write_now(item.port_id, item.sdu);
                    }
                }
            })
            .expect("failed to spawn send worker");

        vec![rcv, snd]
    }

    fn enable_all_flows(&self) {
        let instances: Vec<Arc<TcpUdpInstance>> = self.instances.lock().unwrap().clone();
        for instance in instances {
            let targets: Vec<(Arc<dyn UserIpcp>, PortId)> = {
                let state = instance.state.lock().unwrap();
                state
                    .flows
                    .iter()
                    .filter_map(|f| f.user_ipcp.clone().map(|u| (u, f.port_id)))
                    .collect()
            };
            for (user, port_id) in targets {
                user.enable_write(port_id);
            }
        }
    }

    fn poll_once(self: &Arc<Self>) -> bool {
        let instances: Vec<Arc<TcpUdpInstance>> = self.instances.lock().unwrap().clone();
        let mut progress = false;
        for instance in instances {
            progress |= instance.poll_sockets(self);
        }
        progress
    }

    fn find_instance_by_hostname(&self, hostname: &IpAddr) -> Option<Arc<TcpUdpInstance>> {
        let instances = self.instances.lock().unwrap();
        instances
            .iter()
            .find(|inst| inst.state.lock().unwrap().hostname.as_ref() == Some(hostname))
            .cloned()
    }
}

impl Drop for TcpUdpShim {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.send_q.close();
        let current = std::thread::current().id();
        for worker in self.workers.lock().unwrap().drain(..) {
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
    }
}

impl ShimFactory for TcpUdpShim {
    fn create(
        &self,
        name: &AppName,
        id: IpcpId,
        upstream_port: UpstreamPort,
    ) -> Result<Arc<dyn ShimInstance>, ShimError> {
        let mut instances = self.instances.lock().unwrap();
        if instances.iter().any(|inst| inst.id == id) {
            return Err(ShimError::NameConflict(format!(
                "there's a shim instance with id {id} already"
            )));
        }

        let qos_unreliable = FlowSpec {
            max_allowable_gap: -1,
            ordered_delivery: false,
            partial_delivery: true,
            max_sdu_size: TCP_UDP_BUFFER_SIZE as u32,
            ..FlowSpec::default()
        };
        let qos_reliable = FlowSpec {
            max_allowable_gap: 0,
            ordered_delivery: true,
            partial_delivery: false,
            max_sdu_size: (TCP_UDP_BUFFER_SIZE - 2) as u32,
            ..FlowSpec::default()
        };

        let instance = Arc::new(TcpUdpInstance {
            id,
            name: name.clone(),
            upstream_port,
            qos: [qos_unreliable, qos_reliable],
            family: self.self_ref.clone(),
            state: Mutex::new(TcpUdpState::default()),
        });
        instances.push(instance.clone());
        Ok(instance)
    }

    fn destroy(&self, instance: Arc<dyn ShimInstance>) -> Result<(), ShimError> {
        let id = instance.ipcp_id();
        let own = {
            let mut instances = self.instances.lock().unwrap();
            let pos = instances
                .iter()
                .position(|inst| inst.id == id)
                .ok_or_else(|| ShimError::NotFound(format!("instance {id}")))?;
            instances.swap_remove(pos)
        };
        own.teardown();
        Ok(())
    }

    fn instance_count(&self) -> usize {
        self.instances.lock().unwrap().len()
    }
}

impl TcpUdpInstance {
    fn family(&self) -> Result<Arc<TcpUdpShim>, ShimError> {
        self.family
            .upgrade()
            .ok_or_else(|| ShimError::Resource("shim family gone".to_string()))
    }

    fn teardown(&self) {
        let (flows, apps) = {
            let mut state = self.state.lock().unwrap();
            (std::mem::take(&mut state.flows), std::mem::take(&mut state.apps))
        };
        for mut flow in flows {
            flow.close_socket();
            if let Some(user) = &flow.user_ipcp {
                user.flow_unbinding_ipcp(flow.port_id);
            }
        }
        drop(apps);
    }

    // ---- receive path -------------------------------------------------

    /// Polls every socket of this instance once; returns whether any
    /// made progress. Runs only on the family receive worker.
    fn poll_sockets(self: &Arc<Self>, family: &Arc<TcpUdpShim>) -> bool {
        let (app_socks, udp_flow_socks, tcp_flow_socks) = {
            let state = self.state.lock().unwrap();
            let app_socks: Vec<(Arc<UdpSocket>, SockId, Arc<TcpListener>, SockId)> = state
                .apps
                .iter()
                .map(|a| (a.udp.clone(), a.udp_id, a.tcp.clone(), a.tcp_id))
                .collect();
            let udp_flow_socks: Vec<(Arc<UdpSocket>, SockId)> = state
                .flows
                .iter()
                .filter(|f| !f.sock_closed)
                .filter_map(|f| match &f.sock {
                    FlowSock::Udp { sock, sock_id, owned: true, .. } => {
                        Some((sock.clone(), *sock_id))
                    }
                    _ => None,
                })
                .collect();
            let tcp_flow_socks: Vec<(Arc<TcpStream>, SockId)> = state
                .flows
                .iter()
                .filter(|f| !f.sock_closed)
                .filter_map(|f| match &f.sock {
                    FlowSock::Tcp { stream, sock_id } => Some((stream.clone(), *sock_id)),
                    _ => None,
                })
                .collect();
            (app_socks, udp_flow_socks, tcp_flow_socks)
        };

        let mut progress = false;
        for (udp, udp_id, tcp, tcp_id) in app_socks {
            progress |= self.poll_udp_socket(family, &udp, udp_id);
            progress |= self.poll_accept(family, &tcp, tcp_id);
        }
        for (udp, udp_id) in udp_flow_socks {
            progress |= self.poll_udp_socket(family, &udp, udp_id);
        }
        for (stream, sock_id) in tcp_flow_socks {
            loop {
                match self.tcp_process_msg(family, &stream, sock_id) {
                    TcpProgress::Did => progress = true,
                    TcpProgress::Idle => break,
                    TcpProgress::Closed => {
                        progress = true;
                        break;
                    }
                }
            }
        }
        progress
    }

    fn poll_udp_socket(
        self: &Arc<Self>,
        family: &Arc<TcpUdpShim>,
        sock: &Arc<UdpSocket>,
        sock_id: SockId,
    ) -> bool {
        let mut buf = vec![0u8; TCP_UDP_BUFFER_SIZE];
        let mut progress = false;
        loop {
            match sock.recv_from(&mut buf) {
                Ok((size, peer)) => {
                    progress = true;
                    self.udp_process_msg(family, sock_id, peer, buf[..size].to_vec());
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::debug!("error during UDP recv: {e}");
                    break;
                }
            }
        }
        progress
    }

    /// §4.2 `ingress_sdu` for one datagram.
    fn udp_process_msg(
        self: &Arc<Self>,
        family: &Arc<TcpUdpShim>,
        sock_id: SockId,
        peer: SocketAddr,
        sdu: Sdu,
    ) {
        let mut deliver: Option<(Arc<dyn UserIpcp>, PortId)> = None;
        {
            let mut state = self.state.lock().unwrap();
            if let Some(flow) = state
                .flows
                .iter_mut()
                .find(|f| f.matches_udp(sock_id, &peer))
            {
                match flow.state {
                    FlowState::Allocated => match &flow.user_ipcp {
                        Some(user) => deliver = Some((user.clone(), flow.port_id)),
                        None => {
                            log::debug!("flow is being deallocated, dropping SDU");
                        }
                    },
                    FlowState::Pending => {
                        if let Some(queue) = flow.sdu_queue.as_mut() {
                            queue.push(sdu);
                        }
                        return;
                    }
                    FlowState::Null => {
                        log::debug!("port is NULL, dropping SDU");
                        return;
                    }
                }
            }
            if deliver.is_none() && state
                .flows
                .iter()
                .any(|f| f.matches_udp(sock_id, &peer))
            {
                return;
            }
        }

        if let Some((user, port_id)) = deliver {
            if let Err(e) = user.du_enqueue(port_id, sdu) {
                log::error!("couldn't enqueue SDU to user IPCP: {e}");
            }
            return;
        }

        // No flow yet: a remote peer is allocating towards a
        // registered application.
        self.create_remote_udp_flow(family, sock_id, peer, sdu);
    }

    fn create_remote_udp_flow(
        self: &Arc<Self>,
        family: &Arc<TcpUdpShim>,
        sock_id: SockId,
        peer: SocketAddr,
        sdu: Sdu,
    ) {
        let (app_name, app_sock, dif_name) = {
            let state = self.state.lock().unwrap();
            let Some(app) = state.apps.iter().find(|a| a.udp_id == sock_id) else {
                log::error!(
                    "no app registered yet, someone is doing something bad on the network"
                );
                return;
            };
            let Some(dif_name) = state.dif_name.clone() else {
                return;
            };
            (app.app_name.clone(), app.udp.clone(), dif_name)
        };

        let user_ipcp = family.controller.find_user_ipcp_by_name(&app_name);
        let port_id = match family.controller.reserve_port_id(self.id) {
            Ok(port_id) => port_id,
            Err(e) => {
                log::error!("port-id reservation failed: {e}");
                return;
            }
        };

        {
            let mut state = self.state.lock().unwrap();
            let mut queue = SduQueue::new();
            queue.push(sdu);
            state.flows.push(TcpUdpFlow {
                port_id,
                state: FlowState::Pending,
                sock: FlowSock::Udp {
                    sock: app_sock,
                    sock_id,
                    peer,
                    owned: false,
                },
                user_ipcp,
                sdu_queue: Some(queue),
                sock_closed: false,
                bytes_left: 0,
                partial: None,
            });
        }

        let source_name = AppName::unknown_app(&port_id.to_string());
        if let Err(e) = family.controller.notify_flow_arrived(
            self.id,
            port_id,
            &dif_name,
            &app_name,
            &source_name,
            &self.qos[CUBE_UNRELIABLE],
        ) {
            log::error!("couldn't tell the controller about the flow: {e}");
            family.controller.release_port_id(port_id);
            self.remove_flow_by_port(port_id);
        }
    }

    fn poll_accept(
        self: &Arc<Self>,
        family: &Arc<TcpUdpShim>,
        listener: &Arc<TcpListener>,
        _listener_id: SockId,
    ) -> bool {
        let mut progress = false;
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    progress = true;
                    log::debug!("socket accepted from {peer}");
                    if let Err(e) = stream.set_nonblocking(true) {
                        log::error!("could not make accepted socket non-blocking: {e}");
                        continue;
                    }
                    self.create_remote_tcp_flow(family, listener, stream);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::error!("could not accept socket: {e}");
                    break;
                }
            }
        }
        progress
    }

    fn create_remote_tcp_flow(
        self: &Arc<Self>,
        family: &Arc<TcpUdpShim>,
        listener: &Arc<TcpListener>,
        stream: TcpStream,
    ) {
        let (app_name, dif_name) = {
            let state = self.state.lock().unwrap();
            let Some(app) = state
                .apps
                .iter()
                .find(|a| Arc::ptr_eq(&a.tcp, listener))
            else {
                return;
            };
            let Some(dif_name) = state.dif_name.clone() else {
                return;
            };
            (app.app_name.clone(), dif_name)
        };

        let user_ipcp = family.controller.find_user_ipcp_by_name(&app_name);
        let port_id = match family.controller.reserve_port_id(self.id) {
            Ok(port_id) => port_id,
            Err(e) => {
                log::error!("port-id reservation failed: {e}");
                return;
            }
        };

        {
            let mut state = self.state.lock().unwrap();
            state.flows.push(TcpUdpFlow {
                port_id,
                state: FlowState::Pending,
                sock: FlowSock::Tcp {
                    stream: Arc::new(stream),
                    sock_id: next_sock_id(),
                },
                user_ipcp,
                sdu_queue: Some(SduQueue::new()),
                sock_closed: false,
                bytes_left: 0,
                partial: None,
            });
        }

        let source_name = AppName::unknown_app(&port_id.to_string());
        if let Err(e) = family.controller.notify_flow_arrived(
            self.id,
            port_id,
            &dif_name,
            &app_name,
            &source_name,
            &self.qos[CUBE_RELIABLE],
        ) {
            log::error!("couldn't tell the controller about the flow: {e}");
            family.controller.release_port_id(port_id);
            self.remove_flow_by_port(port_id);
        }
    }

    /// One step of the TCP record parser for `sock_id`.
    fn tcp_process_msg(
        self: &Arc<Self>,
        family: &Arc<TcpUdpShim>,
        stream: &Arc<TcpStream>,
        sock_id: SockId,
    ) -> TcpProgress {
        let bytes_left = {
            let state = self.state.lock().unwrap();
            match state.flows.iter().find(|f| f.matches_tcp(sock_id)) {
                Some(flow) if !flow.sock_closed => flow.bytes_left,
                _ => return TcpProgress::Idle,
            }
        };

        if bytes_left == 0 {
            self.tcp_recv_new_message(family, stream, sock_id)
        } else {
            self.tcp_recv_partial_message(family, stream, sock_id)
        }
    }

    fn tcp_recv_new_message(
        self: &Arc<Self>,
        family: &Arc<TcpUdpShim>,
        stream: &Arc<TcpStream>,
        sock_id: SockId,
    ) -> TcpProgress {
        let mut prefix = [0u8; 2];
        let mut got = match (&**stream).read(&mut prefix) {
            Ok(0) => return self.tcp_remote_release(family, sock_id),
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return TcpProgress::Idle,
            Err(e) => {
                log::error!("error during TCP receive: {e}");
                return self.tcp_remote_release(family, sock_id);
            }
        };

        // The length prefix is atomic at the protocol level: if only
        // the first byte made it, wait for the second.
        while got < 2 {
            if family.shutdown.load(Ordering::SeqCst) {
                return TcpProgress::Idle;
            }
            match (&**stream).read(&mut prefix[got..]) {
                Ok(0) => return self.tcp_remote_release(family, sock_id),
                Ok(n) => got += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_micros(200));
                }
                Err(e) => {
                    log::error!("can't read second length byte: {e}");
                    return self.tcp_remote_release(family, sock_id);
                }
            }
        }

        let length = u16::from_be_bytes(prefix) as usize;
        log::debug!("incoming message is {length} bytes long");
        let mut payload = vec![0u8; length];
        let mut read = 0;
        while read < length {
            match (&**stream).read(&mut payload[read..]) {
                Ok(0) => return self.tcp_remote_release(family, sock_id),
                Ok(n) => read += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::error!("error during TCP receive: {e}");
                    return self.tcp_remote_release(family, sock_id);
                }
            }
        }

        if read == length {
            self.tcp_deliver(sock_id, payload);
        } else {
            let mut state = self.state.lock().unwrap();
            if let Some(flow) = state.flows.iter_mut().find(|f| f.matches_tcp(sock_id)) {
                log::debug!(
                    "didn't receive complete message, missing {} bytes",
                    length - read
                );
                flow.bytes_left = length - read;
                flow.partial = Some(payload);
            }
        }
        TcpProgress::Did
    }

    fn tcp_recv_partial_message(
        self: &Arc<Self>,
        family: &Arc<TcpUdpShim>,
        stream: &Arc<TcpStream>,
        sock_id: SockId,
    ) -> TcpProgress {
        let (mut payload, bytes_left) = {
            let mut state = self.state.lock().unwrap();
            let Some(flow) = state.flows.iter_mut().find(|f| f.matches_tcp(sock_id)) else {
                return TcpProgress::Idle;
            };
            match flow.partial.take() {
                Some(partial) => (partial, flow.bytes_left),
                None => return TcpProgress::Idle,
            }
        };

        let start = payload.len() - bytes_left;
        let mut read = start;
        let mut closed = false;
        while read < payload.len() {
            match (&**stream).read(&mut payload[read..]) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(n) => read += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::error!("error during TCP receive: {e}");
                    closed = true;
                    break;
                }
            }
        }

        if closed {
            return self.tcp_remote_release(family, sock_id);
        }

        if read == payload.len() {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(flow) = state.flows.iter_mut().find(|f| f.matches_tcp(sock_id)) {
                    flow.bytes_left = 0;
                }
            }
            self.tcp_deliver(sock_id, payload);
            TcpProgress::Did
        } else {
            let mut state = self.state.lock().unwrap();
            if let Some(flow) = state.flows.iter_mut().find(|f| f.matches_tcp(sock_id)) {
                flow.bytes_left = payload.len() - read;
                flow.partial = Some(payload);
                if read > start {
                    log::debug!(
                        "still didn't receive complete message, missing {} bytes",
                        flow.bytes_left
                    );
                }
            }
            if read > start { TcpProgress::Did } else { TcpProgress::Idle }
        }
    }

    /// Delivers one complete TCP record per §4.2 `ingress_sdu`.
    fn tcp_deliver(self: &Arc<Self>, sock_id: SockId, sdu: Sdu) {
        let deliver = {
            let mut state = self.state.lock().unwrap();
            let Some(flow) = state.flows.iter_mut().find(|f| f.matches_tcp(sock_id)) else {
                return;
            };
            match flow.state {
                FlowState::Allocated => match &flow.user_ipcp {
                    Some(user) => Some((user.clone(), flow.port_id)),
                    None => {
                        log::debug!("flow is being deallocated, dropping SDU");
                        None
                    }
                },
                FlowState::Pending => {
                    if let Some(queue) = flow.sdu_queue.as_mut() {
                        queue.push(sdu);
                    }
                    return;
                }
                FlowState::Null => return,
            }
        };
        if let Some((user, port_id)) = deliver {
            if let Err(e) = user.du_enqueue(port_id, sdu) {
                log::error!("couldn't enqueue SDU to user IPCP: {e}");
            }
        }
    }

    /// A zero-byte read on an ALLOCATED or PENDING flow means the peer
    /// released the flow.
    fn tcp_remote_release(self: &Arc<Self>, family: &Arc<TcpUdpShim>, sock_id: SockId) -> TcpProgress {
        let removed = {
            let mut state = self.state.lock().unwrap();
            let Some(pos) = state.flows.iter().position(|f| f.matches_tcp(sock_id)) else {
                return TcpProgress::Idle;
            };
            match state.flows[pos].state {
                FlowState::Allocated | FlowState::Pending => {
                    let mut flow = state.flows.swap_remove(pos);
                    flow.close_socket();
                    Some(flow)
                }
                FlowState::Null => {
                    // Refused stub: just stop polling the socket.
                    state.flows[pos].close_socket();
                    None
                }
            }
        };

        let Some(flow) = removed else {
            return TcpProgress::Closed;
        };
        log::debug!("got 0 size message, closing flow {}", flow.port_id);
        if let Some(user) = &flow.user_ipcp {
            user.flow_unbinding_ipcp(flow.port_id);
        }
        family
            .controller
            .notify_flow_dealloc(self.id, 0, flow.port_id, true);
        family.controller.release_port_id(flow.port_id);
        TcpProgress::Closed
    }

    // ---- send path ----------------------------------------------------

    /// Executed on the send worker; the blocking half of `du_write`.
    fn sdu_write_now(self: &Arc<Self>, port_id: PortId, sdu: Sdu) {
        enum Target {
            Udp(Arc<UdpSocket>, SocketAddr),
            Tcp(Arc<TcpStream>),
        }

        let target = {
            let state = self.state.lock().unwrap();
            let Some(flow) = state.flows.iter().find(|f| f.port_id == port_id) else {
                log::error!("could not find flow with port-id {port_id}");
                return;
            };
            if flow.state != FlowState::Allocated {
                log::error!("flow {port_id} is not in the right state to call this");
                return;
            }
            match &flow.sock {
                FlowSock::Udp { sock, peer, .. } => Target::Udp(sock.clone(), *peer),
                FlowSock::Tcp { stream, .. } => Target::Tcp(stream.clone()),
            }
        };

        match target {
            Target::Udp(sock, peer) => match Self::udp_send(&sock, &sdu, peer) {
                Ok(size) if size < sdu.len() => {
                    log::error!("could not completely send SDU ({size}/{})", sdu.len());
                }
                Ok(_) => {}
                Err(e) => log::error!("error during SDU write (udp): {e}"),
            },
            Target::Tcp(stream) => {
                if let Err(e) = Self::tcp_send(&stream, &sdu) {
                    log::error!("error during SDU write (tcp): {e}");
                }
            }
        }
    }

    fn udp_send(sock: &UdpSocket, sdu: &[u8], peer: SocketAddr) -> std::io::Result<usize> {
        loop {
            match sock.send_to(sdu, peer) {
                Ok(size) => return Ok(size),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_micros(200));
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn tcp_send(stream: &Arc<TcpStream>, sdu: &[u8]) -> std::io::Result<()> {
        let length = (sdu.len() as u16).to_be_bytes();
        Self::tcp_send_all(stream, &length)?;
        Self::tcp_send_all(stream, sdu)
    }

    fn tcp_send_all(stream: &Arc<TcpStream>, mut buf: &[u8]) -> std::io::Result<()> {
        while !buf.is_empty() {
            match (&**stream).write(buf) {
                Ok(0) => {
                    return Err(std::io::Error::from(std::io::ErrorKind::WriteZero));
                }
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_micros(200));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    // ---- shared helpers ----------------------------------------------

    fn remove_flow_by_port(&self, port_id: PortId) -> Option<TcpUdpFlow> {
        let mut state = self.state.lock().unwrap();
        let pos = state.flows.iter().position(|f| f.port_id == port_id)?;
        Some(state.flows.swap_remove(pos))
    }

    /// Drains the queue, then promotes to ALLOCATED once it runs dry,
    /// keeping queued SDUs strictly ahead of direct deliveries.
    fn promote_and_drain(
        &self,
        port_id: PortId,
        user_ipcp: &Arc<dyn UserIpcp>,
    ) -> Result<(), ShimError> {
        loop {
            let mut batch = {
                let mut state = self.state.lock().unwrap();
                let Some(flow) = state.flows.iter_mut().find(|f| f.port_id == port_id) else {
                    return Err(ShimError::NotFound(format!("flow {port_id}")));
                };
                match flow.sdu_queue.as_mut() {
                    Some(queue) if !queue.is_empty() => std::mem::take(queue),
                    _ => {
                        flow.state = FlowState::Allocated;
                        flow.sdu_queue = None;
                        return Ok(());
                    }
                }
            };
            drain_sdu_queue(&mut batch, user_ipcp, port_id).inspect_err(|_| {
                let mut state = self.state.lock().unwrap();
                if let Some(flow) = state.flows.iter_mut().find(|f| f.port_id == port_id) {
                    flow.state = FlowState::Allocated;
                    flow.sdu_queue = None;
                }
            })?;
        }
    }
}

enum TcpProgress {
    Did,
    Idle,
    Closed,
}

impl ShimInstance for TcpUdpInstance {
    fn flow_allocate_request(
        &self,
        user_ipcp: Arc<dyn UserIpcp>,
        _source: &AppName,
        dest: &AppName,
        fspec: &FlowSpec,
        port_id: PortId,
    ) -> Result<(), ShimError> {
        let family = self.family()?;

        let (hostname, dest_addr) = {
            let state = self.state.lock().unwrap();
            if let Some(flow) = state.flows.iter().find(|f| f.port_id == port_id) {
                return Err(ShimError::WrongState(flow.state.to_string()));
            }
            let hostname = state
                .hostname
                .ok_or_else(|| ShimError::WrongState("not assigned to a DIF".to_string()))?;
            let entry = state
                .directory
                .iter()
                .find(|e| e.app_name.matches_apn_aen(dest))
                .ok_or_else(|| {
                    ShimError::NotFound(format!("directory entry for {}", dest.process_name))
                })?;
            (hostname, entry.addr)
        };

        let sock = if !fspec.is_reliable() {
            log::debug!("unreliable flow requested");
            let sock = UdpSocket::bind((hostname, 0))
                .map_err(|e| ShimError::Resource(format!("could not create UDP socket: {e}")))?;
            sock.set_nonblocking(true)
                .map_err(|e| ShimError::Resource(e.to_string()))?;
            FlowSock::Udp {
                sock: Arc::new(sock),
                sock_id: next_sock_id(),
                peer: dest_addr,
                owned: true,
            }
        } else {
            log::debug!("reliable flow requested");
            let stream = TcpStream::connect(dest_addr).map_err(|e| {
                if e.kind() == std::io::ErrorKind::ConnectionRefused {
                    ShimError::PeerRefused
                } else {
                    ShimError::Transient(format!("could not connect TCP socket: {e}"))
                }
            })?;
            stream
                .set_nonblocking(true)
                .map_err(|e| ShimError::Resource(e.to_string()))?;
            FlowSock::Tcp {
                stream: Arc::new(stream),
                sock_id: next_sock_id(),
            }
        };

        {
            let mut state = self.state.lock().unwrap();
            state.flows.push(TcpUdpFlow {
                port_id,
                state: FlowState::Allocated,
                sock,
                user_ipcp: Some(user_ipcp.clone()),
                sdu_queue: None,
                sock_closed: false,
                bytes_left: 0,
                partial: None,
            });
        }

        if let Err(e) = user_ipcp.flow_binding_ipcp(port_id) {
            log::error!("could not bind flow with user IPCP: {e}");
            if let Some(mut flow) = self.remove_flow_by_port(port_id) {
                flow.close_socket();
            }
            return Err(e);
        }

        family
            .controller
            .notify_flow_alloc_result(self.id, port_id, true);
        Ok(())
    }

    fn flow_allocate_response(
        &self,
        user_ipcp: Option<Arc<dyn UserIpcp>>,
        port_id: PortId,
        accepted: bool,
    ) -> Result<(), ShimError> {
        let family = self.family()?;
        {
            let state = self.state.lock().unwrap();
            let Some(flow) = state.flows.iter().find(|f| f.port_id == port_id) else {
                family.controller.release_port_id(port_id);
                return Err(ShimError::NotFound(format!("flow {port_id}")));
            };
            if flow.state != FlowState::Pending {
                return Err(ShimError::WrongState(flow.state.to_string()));
            }
        }

        if accepted {
            let Some(user_ipcp) = user_ipcp else {
                family.controller.release_port_id(port_id);
                return Err(ShimError::BadArgument("no user IPCP supplied".to_string()));
            };
            if let Err(e) = user_ipcp.flow_binding_ipcp(port_id) {
                family.controller.release_port_id(port_id);
                if let Some(mut flow) = self.remove_flow_by_port(port_id) {
                    flow.close_socket();
                }
                return Err(e);
            }
            {
                let mut state = self.state.lock().unwrap();
                if let Some(flow) = state.flows.iter_mut().find(|f| f.port_id == port_id) {
                    flow.user_ipcp = Some(user_ipcp.clone());
                }
            }
            self.promote_and_drain(port_id, &user_ipcp)?;
        } else {
            // Keep the refused flow as a NULL stub; only the shared
            // server-side UDP socket survives, a private socket is
            // closed.
            let mut state = self.state.lock().unwrap();
            if let Some(flow) = state.flows.iter_mut().find(|f| f.port_id == port_id) {
                flow.state = FlowState::Null;
                flow.sdu_queue = None;
                match &flow.sock {
                    FlowSock::Udp { owned: false, .. } => {}
                    _ => flow.close_socket(),
                }
            }
        }
        Ok(())
    }

    fn flow_deallocate(&self, port_id: PortId) -> Result<(), ShimError> {
        let mut flow = self
            .remove_flow_by_port(port_id)
            .ok_or_else(|| ShimError::NotFound(format!("flow {port_id}")))?;

        let shared_udp = matches!(&flow.sock, FlowSock::Udp { owned: false, .. });
        if !shared_udp {
            flow.close_socket();
        }
        if let Some(user) = &flow.user_ipcp {
            user.flow_unbinding_ipcp(port_id);
        }
        Ok(())
    }

    fn application_register(
        &self,
        name: &AppName,
        _daf_name: Option<&AppName>,
    ) -> Result<(), ShimError> {
        let mut state = self.state.lock().unwrap();
        if state.apps.iter().any(|a| a.app_name == *name) {
            return Err(ShimError::NameConflict(format!(
                "application {name} is already registered"
            )));
        }
        let hostname = state
            .hostname
            .ok_or_else(|| ShimError::WrongState("not assigned to a DIF".to_string()))?;
        let port = state
            .exp_regs
            .iter()
            .find(|e| e.app_name.matches_apn_aen(name))
            .map(|e| e.port)
            .ok_or_else(|| {
                ShimError::NotFound(format!(
                    "application {} is not expected to register",
                    name.process_name
                ))
            })?;

        let udp = UdpSocket::bind((hostname, port))
            .map_err(|e| ShimError::Resource(format!("could not bind UDP socket: {e}")))?;
        udp.set_nonblocking(true)
            .map_err(|e| ShimError::Resource(e.to_string()))?;

        // Rolls the UDP socket back implicitly if the TCP side fails.
        let tcp = TcpListener::bind((hostname, port))
            .map_err(|e| ShimError::Resource(format!("could not bind TCP socket: {e}")))?;
        tcp.set_nonblocking(true)
            .map_err(|e| ShimError::Resource(e.to_string()))?;

        state.apps.push(RegApp {
            app_name: name.clone(),
            port,
            udp: Arc::new(udp),
            udp_id: next_sock_id(),
            tcp: Arc::new(tcp),
            tcp_id: next_sock_id(),
        });
        log::debug!("application {name} registered on port {port}");
        Ok(())
    }

    fn application_unregister(&self, name: &AppName) -> Result<(), ShimError> {
        let (app, mut orphaned) = {
            let mut state = self.state.lock().unwrap();
            let pos = state
                .apps
                .iter()
                .position(|a| a.app_name == *name)
                .ok_or_else(|| {
                    ShimError::NotFound("application is not registered".to_string())
                })?;
            let app = state.apps.swap_remove(pos);

            // Flows riding this registration's sockets go down with it.
            let mut orphaned = Vec::new();
            let mut i = 0;
            while i < state.flows.len() {
                let on_app_sock = match &state.flows[i].sock {
                    FlowSock::Udp { sock_id, owned: false, .. } => *sock_id == app.udp_id,
                    _ => false,
                };
                if on_app_sock {
                    orphaned.push(state.flows.swap_remove(i));
                } else {
                    i += 1;
                }
            }
            (app, orphaned)
        };

        for flow in &mut orphaned {
            flow.close_socket();
            if let Some(user) = &flow.user_ipcp {
                user.flow_unbinding_ipcp(flow.port_id);
            }
        }
        drop(app);
        Ok(())
    }

    fn assign_to_dif(&self, dif_name: &AppName, config: &DifConfig) -> Result<(), ShimError> {
        {
            let state = self.state.lock().unwrap();
            if let Some(assigned) = state.dif_name.as_ref() {
                return Err(ShimError::NameConflict(format!(
                    "this IPC process is already assigned to the DIF {assigned}"
                )));
            }
        }
        self.state.lock().unwrap().dif_name = Some(dif_name.clone());
        if let Err(e) = self.parse_assign_conf(config) {
            let mut state = self.state.lock().unwrap();
            state.dif_name = None;
            state.directory.clear();
            state.exp_regs.clear();
            return Err(e);
        }
        Ok(())
    }

    fn update_dif_config(&self, config: &DifConfig) -> Result<(), ShimError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.dif_name.is_none() {
                return Err(ShimError::WrongState("not assigned to a DIF".to_string()));
            }
            state.directory.clear();
            state.exp_regs.clear();
        }
        self.parse_assign_conf(config)
    }

    fn du_write(&self, port_id: PortId, sdu: Sdu, _blocking: bool) -> Result<(), ShimError> {
        let family = self.family()?;
        {
            let state = self.state.lock().unwrap();
            let flow = state
                .flows
                .iter()
                .find(|f| f.port_id == port_id)
                .ok_or_else(|| ShimError::NotFound(format!("flow {port_id}")))?;
            let max = if flow.is_reliable() {
                TCP_UDP_BUFFER_SIZE - 2
            } else {
                TCP_UDP_BUFFER_SIZE
            };
            if sdu.len() > max {
                return Err(ShimError::BadArgument(format!(
                    "SDU too large ({} bytes)",
                    sdu.len()
                )));
            }
        }

        let instance = {
            let instances = family.instances.lock().unwrap();
            instances
                .iter()
                .find(|inst| inst.id == self.id)
                .cloned()
                .ok_or_else(|| ShimError::NotFound(format!("instance {}", self.id)))?
        };

        family.send_q.push(SndItem {
            instance: Arc::downgrade(&instance),
            port_id,
            sdu,
        })
    }

    fn flow_unbinding_user_ipcp(&self, port_id: PortId) -> Result<(), ShimError> {
        let mut state = self.state.lock().unwrap();
        let flow = state
            .flows
            .iter_mut()
            .find(|f| f.port_id == port_id)
            .ok_or_else(|| ShimError::NotFound(format!("flow {port_id}")))?;
        flow.user_ipcp = None;
        Ok(())
    }

    fn ipcp_name(&self) -> AppName {
        self.name.clone()
    }

    fn dif_name(&self) -> Option<AppName> {
        self.state.lock().unwrap().dif_name.clone()
    }

    fn ipcp_id(&self) -> IpcpId {
        self.id
    }

    fn max_sdu_size(&self) -> usize {
        TCP_UDP_BUFFER_SIZE
    }

    fn snapshot(&self) -> InstanceSnapshot {
        let state = self.state.lock().unwrap();
        InstanceSnapshot {
            ipcp_id: self.id,
            name: self.name.to_string(),
            dif_name: state.dif_name.as_ref().map(|n| n.to_string()),
            registered_apps: state.apps.iter().map(|a| a.app_name.to_string()).collect(),
            flows: state
                .flows
                .iter()
                .map(|f| FlowSnapshot {
                    port_id: Some(f.port_id),
                    state: f.state,
                    peer: match &f.sock {
                        FlowSock::Udp { peer, .. } => peer.to_string(),
                        FlowSock::Tcp { stream, .. } => stream
                            .peer_addr()
                            .map(|a| a.to_string())
                            .unwrap_or_else(|_| "?".to_string()),
                    },
                    queued_sdus: f.sdu_queue.as_ref().map(|q| q.len()).unwrap_or(0),
                })
                .collect(),
        }
    }
}

// ---- configuration parsing --------------------------------------------

/// The two accepted encodings of `dirEntry`/`expReg` values:
/// the legacy `count:length:field…` form and the newer
/// `:count:field:field…` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigSyntax {
    HasCount,
    NoCount,
}

struct FieldReader<'a> {
    rest: &'a str,
    syntax: ConfigSyntax,
}

impl<'a> FieldReader<'a> {
    /// Detects the syntax and reads the leading entry count.
    fn new(value: &'a str) -> Result<(Self, usize), ShimError> {
        if let Some(rest) = value.strip_prefix(':') {
            let digits = rest
                .find(':')
                .map(|pos| &rest[..pos])
                .unwrap_or(rest);
            let count = parse_count(digits, value)?;
            Ok((
                Self {
                    rest: &rest[digits.len()..],
                    syntax: ConfigSyntax::NoCount,
                },
                count,
            ))
        } else {
            let pos = value.find(':').ok_or_else(|| syntax_error(value))?;
            let count = parse_count(&value[..pos], value)?;
            Ok((
                Self {
                    rest: &value[pos + 1..],
                    syntax: ConfigSyntax::HasCount,
                },
                count,
            ))
        }
    }

    fn next_field(&mut self) -> Result<&'a str, ShimError> {
        match self.syntax {
            ConfigSyntax::HasCount => {
                let pos = self.rest.find(':').ok_or_else(|| syntax_error(self.rest))?;
                let len: usize = self.rest[..pos]
                    .parse()
                    .map_err(|_| syntax_error(self.rest))?;
                let body = &self.rest[pos + 1..];
                let field = body.get(..len).ok_or_else(|| syntax_error(self.rest))?;
                self.rest = &body[len..];
                Ok(field)
            }
            ConfigSyntax::NoCount => {
                let body = self.rest.strip_prefix(':').ok_or_else(|| syntax_error(self.rest))?;
                let end = body.find(':').unwrap_or(body.len());
                let field = &body[..end];
                self.rest = &body[end..];
                Ok(field)
            }
        }
    }
}

fn parse_count(digits: &str, whole: &str) -> Result<usize, ShimError> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(syntax_error(whole));
    }
    digits.parse().map_err(|_| syntax_error(whole))
}

fn syntax_error(at: &str) -> ShimError {
    ShimError::Config(format!("unable to parse configuration near '{at}'"))
}

impl TcpUdpInstance {
    fn parse_assign_conf(&self, config: &DifConfig) -> Result<(), ShimError> {
        let family = self.family()?;
        for ConfigEntry { name, value } in &config.entries {
            match name.as_str() {
                "hostname" => {
                    let hostname: IpAddr = value
                        .parse()
                        .map_err(|_| ShimError::Config("failed to parse hostname".to_string()))?;
                    if let Some(other) = family.find_instance_by_hostname(&hostname) {
                        if other.id != self.id {
                            return Err(ShimError::NameConflict(format!(
                                "hostname {hostname} is already in use"
                            )));
                        }
                    }
                    self.state.lock().unwrap().hostname = Some(hostname);
                }
                "dirEntry" => {
                    let (mut reader, count) = FieldReader::new(value)?;
                    for _ in 0..count {
                        self.parse_dir_entry(&mut reader)?;
                    }
                }
                "expReg" => {
                    let (mut reader, count) = FieldReader::new(value)?;
                    for _ in 0..count {
                        self.parse_exp_reg_entry(&mut reader)?;
                    }
                }
                other => {
                    log::warn!("unknown config parameter '{other}'");
                }
            }
        }
        Ok(())
    }

    /// One `dirEntry` record: process name, entity name, IP, port. An
    /// empty IP removes the mapping; identical names update in place.
    fn parse_dir_entry(&self, reader: &mut FieldReader<'_>) -> Result<(), ShimError> {
        let pn = reader.next_field()?.to_string();
        let en = reader.next_field()?.to_string();
        let ip = reader.next_field()?.to_string();
        let port = reader.next_field()?.to_string();

        let app_name = AppName::new(&pn, "", &en, "");
        let addr = if ip.is_empty() {
            None
        } else {
            let ip: IpAddr = ip
                .parse()
                .map_err(|_| ShimError::Config("failed to parse ip".to_string()))?;
            let port: u16 = port
                .parse()
                .map_err(|_| ShimError::Config("failed to parse port".to_string()))?;
            Some(SocketAddr::new(ip, port))
        };

        let mut state = self.state.lock().unwrap();
        match state
            .directory
            .iter_mut()
            .find(|e| e.app_name.matches_apn_aen(&app_name))
        {
            Some(entry) => match addr {
                Some(addr) => {
                    entry.addr = addr;
                    log::debug!("updated an existing dir entry");
                }
                None => {
                    state
                        .directory
                        .retain(|e| !e.app_name.matches_apn_aen(&app_name));
                    log::debug!("removed a dir entry");
                }
            },
            None => {
                if let Some(addr) = addr {
                    state.directory.push(DirEntry { app_name, addr });
                    log::debug!("added a new dir entry");
                }
            }
        }
        Ok(())
    }

    /// One `expReg` record: process name, entity name, port.
    fn parse_exp_reg_entry(&self, reader: &mut FieldReader<'_>) -> Result<(), ShimError> {
        let pn = reader.next_field()?.to_string();
        let en = reader.next_field()?.to_string();
        let port: u16 = reader
            .next_field()?
            .parse()
            .map_err(|_| ShimError::Config("failed to parse port".to_string()))?;

        let app_name = AppName::new(&pn, "", &en, "");
        let mut state = self.state.lock().unwrap();
        match state
            .exp_regs
            .iter_mut()
            .find(|e| e.app_name.matches_apn_aen(&app_name))
        {
            Some(entry) => entry.port = port,
            None => state.exp_regs.push(ExpReg { app_name, port }),
        }
        log::debug!("added a new exp reg entry");
        Ok(())
    }
}
