// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Ethernet shim engine
//!
//! Turns raw 802.3 frames into RINA flows. Each instance binds one
//! network device (optionally a VLAN pseudo-device), registers at most
//! one application with the ARP-like resolver, and demultiplexes
//! ingress frames by source MAC. Flow allocation resolves the peer
//! name to a MAC through the resolver; frames that arrive before an
//! allocation completes are queued per flow and drained in order.
//!
//! The engine registers under four factory names (`shim-eth`,
//! `shim-eth-vlan`, `shim-wifi-ap`, `shim-wifi-sta`) sharing one data
//! path; only the VLAN interpretation mode differs.

use crate::arp::{ArpHandle, Resolver};
use crate::controller::{Controller, UserIpcp};
use crate::dispatch::WorkQueue;
use crate::error::ShimError;
use crate::factory::{FactoryRegistry, ShimFactory};
use crate::flow::{FlowState, Sdu, SduQueue, drain_sdu_queue};
use crate::ipcp::{
    ConfigEntry, DifConfig, FlowSnapshot, FlowSpec, InstanceSnapshot, IpcpId, PortId, ShimInstance,
    UpstreamPort,
};
use crate::name::{AppName, Gha, Gpa};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// EtherType of RINA data frames.
pub const ETH_P_RINA: u16 = 0xD1F0;

/// EtherType of the resolver's request/reply packets.
pub const ETH_P_RINARP: u16 = 0x0806;

/// Destination MAC + source MAC + EtherType.
pub const ETH_HEADER_LEN: usize = 14;

/// Delivery classification of a received frame, as reported by the
/// lower layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Host,
    Broadcast,
    Multicast,
    OtherHost,
    Loopback,
}

/// Transmit refusal reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxError {
    /// The device queue cannot accept the frame right now.
    Busy,
    /// The device is administratively or operationally down.
    Down,
}

impl fmt::Display for TxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxError::Busy => write!(f, "transmit queue busy"),
            TxError::Down => write!(f, "device down"),
        }
    }
}

/// One network device as seen by the shim.
pub trait EthDevice: Send + Sync {
    fn name(&self) -> &str;
    fn mtu(&self) -> usize;
    fn hw_addr(&self) -> Gha;
    fn is_up(&self) -> bool;

    /// Hands one complete frame to the device queue. The engine treats
    /// [`TxError::Busy`] as back-pressure and waits for
    /// [`EthShim::transmit_completed`].
    fn transmit(&self, frame: Vec<u8>) -> Result<(), TxError>;

    /// For VLAN pseudo-devices: the underlying physical device name
    /// and the VLAN id.
    fn vlan_info(&self) -> Option<(String, u16)>;
}

/// Resolves interface names to devices, the userspace stand-in for the
/// kernel device table.
pub trait DeviceResolver: Send + Sync {
    fn get_by_name(&self, name: &str) -> Option<Arc<dyn EthDevice>>;
}

/// Parsed Ethernet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthHeader {
    pub dest: Gha,
    pub src: Gha,
    pub ethertype: u16,
}

/// Builds a complete frame from header fields and payload.
pub fn build_frame(dest: Gha, src: Gha, ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ETH_HEADER_LEN + payload.len());
    frame.extend_from_slice(&dest.octets());
    frame.extend_from_slice(&src.octets());
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Splits a frame into header and payload.
pub fn parse_frame(frame: &[u8]) -> Result<(EthHeader, &[u8]), ShimError> {
    if frame.len() < ETH_HEADER_LEN {
        return Err(ShimError::BadArgument(format!(
            "frame too short ({} bytes)",
            frame.len()
        )));
    }
    let dest = Gha::from_slice(&frame[0..6])?;
    let src = Gha::from_slice(&frame[6..12])?;
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    Ok((
        EthHeader {
            dest,
            src,
            ethertype,
        },
        &frame[ETH_HEADER_LEN..],
    ))
}

/// How the engine derives the device binding from its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VlanMode {
    /// Historic behavior: the DIF process name carries the VLAN id and
    /// the engine binds `<interface>.<vlanid>`.
    Compat,
    /// The interface name is used as-is; VLAN pseudo-devices are
    /// detected by asking the device.
    Auto,
}

/// 0, 1 and 4095 are reserved; ids above 4094 do not fit the tag.
fn vlan_id_is_ok(vlan_id: u16) -> bool {
    (2..=4094).contains(&vlan_id)
}

struct EthFlow {
    port_id: Option<PortId>,
    state: FlowState,
    dest_ha: Option<Gha>,
    dest_pa: Option<Gpa>,
    user_ipcp: Option<Arc<dyn UserIpcp>>,
    sdu_queue: Option<SduQueue>,
}

struct EthRegistration {
    app_name: AppName,
    daf_name: Option<AppName>,
    app_handle: ArpHandle,
    daf_handle: Option<ArpHandle>,
}

#[derive(Default)]
struct EthState {
    dif_name: Option<AppName>,
    interface_name: Option<String>,
    vlan_id: u16,
    spoof_mac: Option<Gha>,
    dev: Option<Arc<dyn EthDevice>>,
    phy_dev_name: Option<String>,
    registration: Option<EthRegistration>,
    flows: Vec<EthFlow>,
    tx_busy: bool,
    fspec: FlowSpec,
}

/// One Ethernet shim IPCP instance.
pub struct EthInstance {
    id: IpcpId,
    name: AppName,
    #[allow(dead_code)]
    upstream_port: UpstreamPort,
    vlan_mode: VlanMode,
    family: Weak<EthShim>,
    state: Mutex<EthState>,
}

/// Work deferred from the frame callback to the family worker: a
/// remotely-initiated flow needs a port-id and a controller
/// notification. Only the keys are recorded; the worker re-resolves
/// the instance, which may have been destroyed meanwhile.
struct RcvWork {
    dev_name: String,
    src_gha: Gha,
}

/// Family-wide state shared by the `shim-eth*` factories: the device
/// mapping, the resolver, and the single-consumer receive worker.
pub struct EthShim {
    controller: Arc<dyn Controller>,
    devices: Arc<dyn DeviceResolver>,
    resolver: Resolver,
    instances: Mutex<Vec<Arc<EthInstance>>>,
    rcv_wq: WorkQueue<RcvWork>,
}

impl EthShim {
    pub fn new(controller: Arc<dyn Controller>, devices: Arc<dyn DeviceResolver>) -> Arc<Self> {
        Self::with_resolve_timeout(controller, devices, crate::arp::DEFAULT_RESOLVE_TIMEOUT)
    }

    pub fn with_resolve_timeout(
        controller: Arc<dyn Controller>,
        devices: Arc<dyn DeviceResolver>,
        resolve_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<EthShim>| {
            let worker_family = weak.clone();
            EthShim {
                controller,
                devices,
                resolver: Resolver::with_timeout(resolve_timeout),
                instances: Mutex::new(Vec::new()),
                rcv_wq: WorkQueue::spawn("shim-eth-rcv", move |work: RcvWork| {
                    if let Some(family) = worker_family.upgrade() {
                        family.handle_rcv_work(work);
                    }
                }),
            }
        })
    }

    fn find_instance_by_dev(&self, dev_name: &str) -> Option<Arc<EthInstance>> {
        let instances = self.instances.lock().unwrap();
        instances
            .iter()
            .find(|inst| {
                let state = inst.state.lock().unwrap();
                state
                    .dev
                    .as_ref()
                    .is_some_and(|dev| dev.name() == dev_name)
            })
            .cloned()
    }

    /// Entry point for frames delivered by the lower layer.
    pub fn receive_frame(&self, dev_name: &str, frame: &[u8], frame_type: FrameType) {
        if matches!(frame_type, FrameType::OtherHost | FrameType::Loopback) {
            return;
        }

        let (header, payload) = match parse_frame(frame) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::debug!("dropping unparseable frame on {dev_name}: {e}");
                return;
            }
        };

        let Some(instance) = self.find_instance_by_dev(dev_name) else {
            log::debug!("no shim instance bound to {dev_name}, dropping frame");
            return;
        };

        match header.ethertype {
            ETH_P_RINARP => {
                let dev = instance.state.lock().unwrap().dev.clone();
                if let Some(dev) = dev {
                    self.resolver.handle_packet(&dev, payload);
                }
            }
            ETH_P_RINA => instance.ingress_sdu(self, dev_name, header.src, payload.to_vec()),
            other => {
                log::debug!("unexpected ethertype {other:#06x} on {dev_name}");
            }
        }
    }

    /// Transmit-completion hook: the device released a previously
    /// queued frame. Clears `tx_busy` on every instance whose physical
    /// device matches and re-enables write on their flows.
    pub fn transmit_completed(&self, phy_dev_name: &str) {
        let instances: Vec<Arc<EthInstance>> = self.instances.lock().unwrap().clone();
        for instance in instances {
            let mut to_enable = Vec::new();
            {
                let mut state = instance.state.lock().unwrap();
                if state.phy_dev_name.as_deref() != Some(phy_dev_name) {
                    continue;
                }
                if !state.tx_busy {
                    continue;
                }
                state.tx_busy = false;
                for flow in &state.flows {
                    if let (Some(user), Some(port_id)) = (&flow.user_ipcp, flow.port_id) {
                        to_enable.push((user.clone(), port_id));
                    }
                }
            }
            for (user, port_id) in to_enable {
                user.enable_write(port_id);
            }
        }
    }

    /// Netdev notifier: `up`/`down` transitions of a physical device.
    /// Flows survive a down transition; their user IPCPs are told the
    /// N-1 flow state changed.
    pub fn device_state_changed(&self, phy_dev_name: &str, up: bool) {
        let instances: Vec<Arc<EthInstance>> = self.instances.lock().unwrap().clone();
        for instance in instances {
            let mut to_notify = Vec::new();
            {
                let mut state = instance.state.lock().unwrap();
                if state.phy_dev_name.as_deref() != Some(phy_dev_name) {
                    continue;
                }
                if up {
                    state.tx_busy = false;
                }
                for flow in &state.flows {
                    if let (Some(user), Some(port_id)) = (&flow.user_ipcp, flow.port_id) {
                        to_notify.push((user.clone(), port_id));
                    }
                }
            }
            for (user, port_id) in to_notify {
                user.nm1_flow_state_change(port_id, up);
                if up {
                    user.enable_write(port_id);
                }
            }
        }
    }

    /// Deferred creation path for remotely-initiated flows.
    fn handle_rcv_work(&self, work: RcvWork) {
        let Some(instance) = self.find_instance_by_dev(&work.dev_name) else {
            log::debug!("instance for {} gone, dropping work item", work.dev_name);
            return;
        };

        let (app_name, app_handle, dif_name, fspec) = {
            let state = instance.state.lock().unwrap();
            let Some(reg) = state.registration.as_ref() else {
                log::error!("no application registered on {}, dropping flow", work.dev_name);
                drop(state);
                instance.destroy_flow_by_gha(&work.src_gha);
                return;
            };
            let Some(dif_name) = state.dif_name.clone() else {
                return;
            };
            (
                reg.app_name.clone(),
                reg.app_handle,
                dif_name,
                state.fspec.clone(),
            )
        };

        let port_id = match self.controller.reserve_port_id(instance.id) {
            Ok(port_id) => port_id,
            Err(e) => {
                log::error!("port-id reservation failed: {e}");
                instance.destroy_flow_by_gha(&work.src_gha);
                return;
            }
        };

        let user_ipcp = self.controller.find_user_ipcp_by_name(&app_name);

        // Reverse-lookup the peer name; fall back to the placeholder.
        let source_gpa = self.resolver.find_gpa(app_handle, &work.src_gha);
        let source_name = source_gpa
            .as_ref()
            .and_then(|gpa| gpa.to_name())
            .unwrap_or_else(|| AppName::unknown_app(""));

        {
            let mut state = instance.state.lock().unwrap();
            let Some(flow) = state.flows.iter_mut().find(|f| {
                f.dest_ha == Some(work.src_gha)
                    && f.port_id.is_none()
                    && f.state == FlowState::Pending
            }) else {
                // Torn down between enqueue and execution.
                self.controller.release_port_id(port_id);
                return;
            };
            flow.port_id = Some(port_id);
            flow.user_ipcp = user_ipcp;
            flow.dest_pa = source_gpa.or_else(|| Some(Gpa::from_name(&source_name)));
        }

        if let Err(e) = self.controller.notify_flow_arrived(
            instance.id,
            port_id,
            &dif_name,
            &app_name,
            &source_name,
            &fspec,
        ) {
            log::error!("couldn't tell the controller about the flow: {e}");
            self.controller.release_port_id(port_id);
            instance.destroy_flow_by_gha(&work.src_gha);
        }
    }

    fn destroy_instance(&self, instance: &Arc<EthInstance>) {
        instance.teardown(self);
        let mut instances = self.instances.lock().unwrap();
        instances.retain(|other| other.id != instance.id);
    }
}

impl EthInstance {
    fn family(&self) -> Result<Arc<EthShim>, ShimError> {
        self.family
            .upgrade()
            .ok_or_else(|| ShimError::Resource("shim family gone".to_string()))
    }

    /// §4.2 `ingress_sdu` for one RINA data frame. Runs on the frame
    /// callback; creating a new flow defers the heavy half to the
    /// family worker.
    fn ingress_sdu(&self, family: &EthShim, dev_name: &str, src: Gha, sdu: Sdu) {
        let deliver: (Arc<dyn UserIpcp>, PortId) = {
            let mut state = self.state.lock().unwrap();
            if state.registration.is_none() {
                log::error!("no application registered on {dev_name}, dropping frame");
                return;
            }
            match state.flows.iter_mut().find(|f| f.dest_ha == Some(src)) {
                Some(flow) => match flow.state {
                    FlowState::Allocated => match (&flow.user_ipcp, flow.port_id) {
                        (Some(user), Some(port_id)) => (user.clone(), port_id),
                        _ => {
                            log::debug!("flow is being deallocated, dropping SDU");
                            return;
                        }
                    },
                    FlowState::Pending => {
                        if let Some(queue) = flow.sdu_queue.as_mut() {
                            queue.push(sdu);
                        }
                        return;
                    }
                    FlowState::Null => {
                        log::debug!("flow is NULL, dropping SDU");
                        return;
                    }
                },
                None => {
                    // New peer: queue the SDU on a fresh PENDING flow
                    // and let the family worker finish the creation.
                    let mut queue = SduQueue::new();
                    queue.push(sdu);
                    state.flows.push(EthFlow {
                        port_id: None,
                        state: FlowState::Pending,
                        dest_ha: Some(src),
                        dest_pa: None,
                        user_ipcp: None,
                        sdu_queue: Some(queue),
                    });
                    family.rcv_wq.post(RcvWork {
                        dev_name: dev_name.to_string(),
                        src_gha: src,
                    });
                    return;
                }
            }
        };

        let (user, port_id) = deliver;
        if let Err(e) = user.du_enqueue(port_id, sdu) {
            log::error!("couldn't enqueue SDU to user IPCP: {e}");
        }
    }

    fn destroy_flow_by_gha(&self, gha: &Gha) {
        let mut state = self.state.lock().unwrap();
        state.flows.retain(|f| f.dest_ha.as_ref() != Some(gha));
    }

    /// Completion of an address resolution started by
    /// `flow_allocate_request`. `result == None` is a timeout.
    fn resolve_completed(self: &Arc<Self>, target: Gpa, result: Option<(Gpa, Gha)>) {
        let family = match self.family() {
            Ok(family) => family,
            Err(_) => return,
        };

        let Some((gpa, gha)) = result else {
            // Resolution failed: the allocation fails and the flow is
            // torn down.
            let port_id = {
                let mut state = self.state.lock().unwrap();
                let Some(pos) = state
                    .flows
                    .iter()
                    .position(|f| f.dest_pa.as_ref() == Some(&target) && f.state == FlowState::Pending)
                else {
                    return;
                };
                let flow = state.flows.swap_remove(pos);
                flow.port_id
            };
            if let Some(port_id) = port_id {
                family
                    .controller
                    .notify_flow_alloc_result(self.id, port_id, false);
            }
            return;
        };

        let (user_ipcp, port_id) = {
            let mut state = self.state.lock().unwrap();
            let Some(flow) = state
                .flows
                .iter_mut()
                .find(|f| f.dest_pa.as_ref() == Some(&gpa))
            else {
                log::error!("no flow found for resolved address {gpa}");
                return;
            };
            // A completion for a flow no longer PENDING is ignored.
            if flow.state != FlowState::Pending {
                return;
            }
            flow.dest_ha = Some(gha);
            match (flow.user_ipcp.clone(), flow.port_id) {
                (Some(user), Some(port_id)) => (user, port_id),
                _ => return,
            }
        };

        if let Err(e) = user_ipcp.flow_binding_ipcp(port_id) {
            log::error!("could not bind flow with user IPCP: {e}");
            self.destroy_flow_by_port(port_id);
            family
                .controller
                .notify_flow_alloc_result(self.id, port_id, false);
            return;
        }

        if self.promote_and_drain(port_id, &user_ipcp).is_err() {
            return;
        }

        family
            .controller
            .notify_flow_alloc_result(self.id, port_id, true);
    }

    /// Drains the SDU queue and promotes the flow to ALLOCATED once it
    /// runs dry, so queued SDUs are delivered strictly before any
    /// direct enqueue from the ingress path.
    fn promote_and_drain(
        &self,
        port_id: PortId,
        user_ipcp: &Arc<dyn UserIpcp>,
    ) -> Result<(), ShimError> {
        loop {
            let mut batch = {
                let mut state = self.state.lock().unwrap();
                let Some(flow) = state
                    .flows
                    .iter_mut()
                    .find(|f| f.port_id == Some(port_id))
                else {
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
                // Leave the flow usable; the SDUs already handed to the
                // lower layer are in flight.
                let mut state = self.state.lock().unwrap();
                if let Some(flow) = state
                    .flows
                    .iter_mut()
                    .find(|f| f.port_id == Some(port_id))
                {
                    flow.state = FlowState::Allocated;
                    flow.sdu_queue = None;
                }
            })?;
        }
    }

    fn destroy_flow_by_port(&self, port_id: PortId) -> Option<EthFlow> {
        let mut state = self.state.lock().unwrap();
        let pos = state
            .flows
            .iter()
            .position(|f| f.port_id == Some(port_id))?;
        Some(state.flows.swap_remove(pos))
    }

    fn set_net_devs(&self, state: &mut EthState, devices: &dyn DeviceResolver) -> Result<(), ShimError> {
        let interface_name = state
            .interface_name
            .clone()
            .ok_or_else(|| ShimError::Config("didn't get an interface name".to_string()))?;

        match self.vlan_mode {
            VlanMode::Compat => {
                let dif_name = state
                    .dif_name
                    .as_ref()
                    .ok_or_else(|| ShimError::WrongState("not assigned to a DIF".to_string()))?;
                let vlan_id = match dif_name.process_name.parse::<u32>() {
                    Ok(id) => {
                        if !u16::try_from(id).is_ok_and(vlan_id_is_ok) {
                            return Err(ShimError::BadArgument(format!("bad VLAN id {id}")));
                        }
                        id as u16
                    }
                    Err(_) => {
                        log::warn!(
                            "DIF name '{}' is not a VLAN number, using full interface",
                            dif_name.process_name
                        );
                        0
                    }
                };
                state.vlan_id = vlan_id;

                let complete_interface = if state.vlan_id != 0 {
                    format!("{interface_name}.{}", state.vlan_id)
                } else {
                    interface_name.clone()
                };
                let dev = devices.get_by_name(&complete_interface).ok_or_else(|| {
                    ShimError::NotFound(format!("ethernet device '{complete_interface}'"))
                })?;
                if state.vlan_id != 0 {
                    devices.get_by_name(&interface_name).ok_or_else(|| {
                        ShimError::NotFound(format!("ethernet device '{interface_name}'"))
                    })?;
                    state.phy_dev_name = Some(interface_name);
                } else {
                    state.phy_dev_name = Some(dev.name().to_string());
                }
                state.dev = Some(dev);
            }
            VlanMode::Auto => {
                let dev = devices
                    .get_by_name(&interface_name)
                    .ok_or_else(|| ShimError::NotFound(format!("device '{interface_name}'")))?;
                match dev.vlan_info() {
                    Some((phy_name, vlan_id)) => {
                        if vlan_id != 0 && !vlan_id_is_ok(vlan_id) {
                            return Err(ShimError::BadArgument(format!("bad VLAN id {vlan_id}")));
                        }
                        log::debug!("using pseudo-interface {interface_name}, VLAN id {vlan_id}");
                        state.vlan_id = vlan_id;
                        state.phy_dev_name = Some(phy_name);
                    }
                    None => {
                        log::debug!("using physical interface {interface_name}");
                        state.phy_dev_name = Some(dev.name().to_string());
                    }
                }
                state.dev = Some(dev);
            }
        }
        Ok(())
    }

    fn parse_config(state: &mut EthState, config: &DifConfig) -> Result<(), ShimError> {
        for ConfigEntry { name, value } in &config.entries {
            match name.as_str() {
                "interface-name" => {
                    state.interface_name = Some(value.clone());
                }
                "spoof-mac" => {
                    let mac: Gha = value.parse()?;
                    log::info!("Ethernet shim will pretend its MAC address is {mac}");
                    state.spoof_mac = Some(mac);
                }
                other => {
                    log::debug!("ignoring unknown config param: {other}");
                }
            }
        }
        Ok(())
    }

    fn teardown(&self, family: &EthShim) {
        let (flows, registration) = {
            let mut state = self.state.lock().unwrap();
            (
                std::mem::take(&mut state.flows),
                state.registration.take(),
            )
        };
        for flow in flows {
            if let (Some(user), Some(port_id)) = (&flow.user_ipcp, flow.port_id) {
                user.flow_unbinding_ipcp(port_id);
            }
        }
        if let Some(reg) = registration {
            let _ = family.resolver.remove(reg.app_handle);
            if let Some(daf_handle) = reg.daf_handle {
                let _ = family.resolver.remove(daf_handle);
            }
        }
    }
}

impl ShimInstance for EthInstance {
    fn flow_allocate_request(
        &self,
        user_ipcp: Arc<dyn UserIpcp>,
        _source: &AppName,
        dest: &AppName,
        _fspec: &FlowSpec,
        port_id: PortId,
    ) -> Result<(), ShimError> {
        let family = self.family()?;
        if !dest.is_ok() {
            return Err(ShimError::BadArgument(
                "destination protocol address is not ok".to_string(),
            ));
        }
        let dest_gpa = Gpa::from_name(dest);

        let (app_handle, daf_handle) = {
            let mut state = self.state.lock().unwrap();
            if state.dev.is_none() {
                return Err(ShimError::WrongState("not assigned to a DIF".to_string()));
            }
            let Some(reg) = state.registration.as_ref() else {
                return Err(ShimError::NotFound("no application registered".to_string()));
            };
            let handles = (reg.app_handle, reg.daf_handle);

            if let Some(flow) = state.flows.iter().find(|f| f.port_id == Some(port_id)) {
                // An existing PENDING flow is retained; the request is
                // still an error.
                return Err(ShimError::WrongState(flow.state.to_string()));
            }

            state.flows.push(EthFlow {
                port_id: Some(port_id),
                state: FlowState::Pending,
                dest_ha: None,
                dest_pa: Some(dest_gpa.clone()),
                user_ipcp: Some(user_ipcp),
                sdu_queue: Some(SduQueue::new()),
            });
            handles
        };

        let Some(this) = family.find_instance_by_id(self.id) else {
            self.destroy_flow_by_port(port_id);
            return Err(ShimError::NotFound(format!("instance {}", self.id)));
        };

        let target = dest_gpa.clone();
        let callback_instance = this.clone();
        let result = family.resolver.resolve(
            app_handle,
            &dest_gpa,
            Box::new(move |result| {
                callback_instance.resolve_completed(target, result);
            }),
        );

        let result = match (result, daf_handle) {
            (Ok(()), _) => Ok(()),
            (Err(_), Some(daf_handle)) => {
                let target = dest_gpa.clone();
                let callback_instance = this.clone();
                family.resolver.resolve(
                    daf_handle,
                    &dest_gpa,
                    Box::new(move |result| {
                        callback_instance.resolve_completed(target, result);
                    }),
                )
            }
            (Err(e), None) => Err(e),
        };

        if let Err(e) = result {
            log::error!("failed to start address resolution: {e}");
            self.destroy_flow_by_port(port_id);
            return Err(ShimError::Transient(format!("resolution failed: {e}")));
        }
        Ok(())
    }

    fn flow_allocate_response(
        &self,
        user_ipcp: Option<Arc<dyn UserIpcp>>,
        port_id: PortId,
        accepted: bool,
    ) -> Result<(), ShimError> {
        {
            let state = self.state.lock().unwrap();
            let flow = state
                .flows
                .iter()
                .find(|f| f.port_id == Some(port_id))
                .ok_or_else(|| ShimError::NotFound(format!("flow {port_id}")))?;
            if flow.state != FlowState::Pending {
                return Err(ShimError::WrongState(flow.state.to_string()));
            }
        }

        if accepted {
            let user_ipcp = user_ipcp
                .ok_or_else(|| ShimError::BadArgument("no user IPCP supplied".to_string()))?;
            if let Err(e) = user_ipcp.flow_binding_ipcp(port_id) {
                self.destroy_flow_by_port(port_id);
                return Err(e);
            }
            {
                let mut state = self.state.lock().unwrap();
                if let Some(flow) = state
                    .flows
                    .iter_mut()
                    .find(|f| f.port_id == Some(port_id))
                {
                    flow.user_ipcp = Some(user_ipcp.clone());
                }
            }
            self.promote_and_drain(port_id, &user_ipcp)?;
        } else {
            // The refused flow is retained as a NULL stub so the peer
            // cannot loop on re-allocation; the controller deallocates
            // it explicitly.
            let mut state = self.state.lock().unwrap();
            if let Some(flow) = state
                .flows
                .iter_mut()
                .find(|f| f.port_id == Some(port_id))
            {
                flow.state = FlowState::Null;
                flow.sdu_queue = None;
            }
        }
        Ok(())
    }

    fn flow_deallocate(&self, port_id: PortId) -> Result<(), ShimError> {
        let flow = self
            .destroy_flow_by_port(port_id)
            .ok_or_else(|| ShimError::NotFound(format!("flow {port_id}")))?;

        if let Some(user) = &flow.user_ipcp {
            user.flow_unbinding_ipcp(port_id);
        }
        // A resolution still in flight must not outlive the flow.
        if let (Ok(family), Some(dest_pa)) = (self.family(), flow.dest_pa.as_ref()) {
            let handle = {
                let state = self.state.lock().unwrap();
                state.registration.as_ref().map(|r| r.app_handle)
            };
            if let Some(handle) = handle {
                family.resolver.cancel(handle, dest_pa);
            }
        }
        Ok(())
    }

    fn application_register(
        &self,
        name: &AppName,
        daf_name: Option<&AppName>,
    ) -> Result<(), ShimError> {
        let family = self.family()?;
        let mut state = self.state.lock().unwrap();
        if let Some(reg) = state.registration.as_ref() {
            return Err(ShimError::NameConflict(format!(
                "application {} is already registered",
                reg.app_name
            )));
        }
        let dev = state
            .dev
            .clone()
            .ok_or_else(|| ShimError::WrongState("not assigned to a DIF".to_string()))?;

        let gha = state.spoof_mac.unwrap_or_else(|| dev.hw_addr());
        let app_handle = family
            .resolver
            .add(dev.clone(), Gpa::from_name(name), gha)?;

        let daf_handle = match daf_name {
            Some(daf_name) => match family.resolver.add(dev, Gpa::from_name(daf_name), gha) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    let _ = family.resolver.remove(app_handle);
                    return Err(e);
                }
            },
            None => None,
        };

        state.registration = Some(EthRegistration {
            app_name: name.clone(),
            daf_name: daf_name.cloned(),
            app_handle,
            daf_handle,
        });
        Ok(())
    }

    fn application_unregister(&self, name: &AppName) -> Result<(), ShimError> {
        let family = self.family()?;
        let mut state = self.state.lock().unwrap();
        let Some(reg) = state.registration.as_ref() else {
            return Err(ShimError::NotFound(
                "no application registered".to_string(),
            ));
        };
        if reg.app_name != *name {
            return Err(ShimError::BadArgument(
                "registered application differs from the one specified".to_string(),
            ));
        }
        let reg = state.registration.take().unwrap();
        family.resolver.remove(reg.app_handle)?;
        if let Some(daf_handle) = reg.daf_handle {
            family.resolver.remove(daf_handle)?;
        }
        Ok(())
    }

    fn assign_to_dif(&self, dif_name: &AppName, config: &DifConfig) -> Result<(), ShimError> {
        let family = self.family()?;
        let mut state = self.state.lock().unwrap();
        if let Some(assigned) = state.dif_name.as_ref() {
            return Err(ShimError::NameConflict(format!(
                "already assigned to DIF {assigned}"
            )));
        }
        state.dif_name = Some(dif_name.clone());

        if let Err(e) = Self::parse_config(&mut state, config) {
            state.dif_name = None;
            return Err(e);
        }
        if let Err(e) = self.set_net_devs(&mut state, family.devices.as_ref()) {
            state.dif_name = None;
            state.interface_name = None;
            state.dev = None;
            state.phy_dev_name = None;
            return Err(e);
        }

        let mtu = state.dev.as_ref().map(|d| d.mtu()).unwrap_or(0);
        state.fspec = FlowSpec {
            max_sdu_size: mtu.saturating_sub(ETH_HEADER_LEN) as u32,
            ..FlowSpec::default()
        };
        log::debug!("configured Ethernet shim IPC process {}", self.name);
        Ok(())
    }

    fn update_dif_config(&self, config: &DifConfig) -> Result<(), ShimError> {
        let family = self.family()?;
        let mut state = self.state.lock().unwrap();
        if state.dif_name.is_none() {
            return Err(ShimError::WrongState("not assigned to a DIF".to_string()));
        }
        Self::parse_config(&mut state, config)?;
        self.set_net_devs(&mut state, family.devices.as_ref())?;
        let mtu = state.dev.as_ref().map(|d| d.mtu()).unwrap_or(0);
        state.fspec.max_sdu_size = mtu.saturating_sub(ETH_HEADER_LEN) as u32;
        Ok(())
    }

    fn du_write(&self, port_id: PortId, sdu: Sdu, _blocking: bool) -> Result<(), ShimError> {
        let (dev, dest, src) = {
            let state = self.state.lock().unwrap();
            let dev = state
                .dev
                .clone()
                .ok_or_else(|| ShimError::WrongState("not assigned to a DIF".to_string()))?;
            if sdu.len() > dev.mtu().saturating_sub(ETH_HEADER_LEN) {
                return Err(ShimError::BadArgument(format!(
                    "SDU too large ({} bytes)",
                    sdu.len()
                )));
            }
            let spoof = state.spoof_mac;
            let flow = state
                .flows
                .iter()
                .find(|f| f.port_id == Some(port_id))
                .ok_or_else(|| ShimError::NotFound(format!("flow {port_id}")))?;
            if flow.state != FlowState::Allocated {
                return Err(ShimError::WrongState(flow.state.to_string()));
            }
            if state.tx_busy {
                return Err(ShimError::WouldBlock);
            }
            let dest = flow
                .dest_ha
                .ok_or_else(|| ShimError::Transient("destination MAC unknown".to_string()))?;
            let src = spoof.unwrap_or_else(|| dev.hw_addr());
            (dev, dest, src)
        };

        let frame = build_frame(dest, src, ETH_P_RINA, &sdu);
        match dev.transmit(frame) {
            Ok(()) => Ok(()),
            Err(TxError::Busy) => {
                let mut state = self.state.lock().unwrap();
                log::debug!("device queue cannot enqueue now, try later");
                state.tx_busy = true;
                Err(ShimError::WouldBlock)
            }
            Err(TxError::Down) => Err(ShimError::Transient("device down".to_string())),
        }
    }

    fn flow_unbinding_user_ipcp(&self, port_id: PortId) -> Result<(), ShimError> {
        let mut state = self.state.lock().unwrap();
        let flow = state
            .flows
            .iter_mut()
            .find(|f| f.port_id == Some(port_id))
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
        let state = self.state.lock().unwrap();
        state
            .dev
            .as_ref()
            .map(|dev| dev.mtu().saturating_sub(ETH_HEADER_LEN))
            .unwrap_or(0)
    }

    fn snapshot(&self) -> InstanceSnapshot {
        let state = self.state.lock().unwrap();
        InstanceSnapshot {
            ipcp_id: self.id,
            name: self.name.to_string(),
            dif_name: state.dif_name.as_ref().map(|n| n.to_string()),
            registered_apps: state
                .registration
                .iter()
                .map(|r| r.app_name.to_string())
                .collect(),
            flows: state
                .flows
                .iter()
                .map(|f| FlowSnapshot {
                    port_id: f.port_id,
                    state: f.state,
                    peer: f
                        .dest_ha
                        .map(|gha| gha.to_string())
                        .unwrap_or_else(|| "?".to_string()),
                    queued_sdus: f.sdu_queue.as_ref().map(|q| q.len()).unwrap_or(0),
                })
                .collect(),
        }
    }
}

impl EthShim {
    fn find_instance_by_id(&self, id: IpcpId) -> Option<Arc<EthInstance>> {
        let instances = self.instances.lock().unwrap();
        instances.iter().find(|inst| inst.id == id).cloned()
    }
}

/// One factory alias over the shared Ethernet engine.
pub struct EthFactory {
    family: Arc<EthShim>,
    vlan_mode: VlanMode,
    instances: Mutex<Vec<Arc<EthInstance>>>,
}

impl EthFactory {
    pub fn new(family: Arc<EthShim>, vlan_mode: VlanMode) -> Arc<Self> {
        Arc::new(Self {
            family,
            vlan_mode,
            instances: Mutex::new(Vec::new()),
        })
    }
}

impl ShimFactory for EthFactory {
    fn create(
        &self,
        name: &AppName,
        id: IpcpId,
        upstream_port: UpstreamPort,
    ) -> Result<Arc<dyn ShimInstance>, ShimError> {
        {
            let family_instances = self.family.instances.lock().unwrap();
            if family_instances.iter().any(|inst| inst.id == id) {
                return Err(ShimError::NameConflict(format!(
                    "there's a shim instance with id {id} already"
                )));
            }
        }
        let instance = Arc::new(EthInstance {
            id,
            name: name.clone(),
            upstream_port,
            vlan_mode: self.vlan_mode,
            family: Arc::downgrade(&self.family),
            state: Mutex::new(EthState::default()),
        });
        self.family
            .instances
            .lock()
            .unwrap()
            .push(instance.clone());
        self.instances.lock().unwrap().push(instance.clone());
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
        self.family.destroy_instance(&own);
        Ok(())
    }

    fn instance_count(&self) -> usize {
        self.instances.lock().unwrap().len()
    }
}

/// Registers the engine under its four factory names.
pub fn register_eth_factories(
    registry: &FactoryRegistry,
    family: &Arc<EthShim>,
) -> Result<(), ShimError> {
    registry.register("shim-eth", EthFactory::new(family.clone(), VlanMode::Auto))?;
    registry.register(
        "shim-eth-vlan",
        EthFactory::new(family.clone(), VlanMode::Compat),
    )?;
    registry.register(
        "shim-wifi-ap",
        EthFactory::new(family.clone(), VlanMode::Auto),
    )?;
    registry.register(
        "shim-wifi-sta",
        EthFactory::new(family.clone(), VlanMode::Auto),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vlan_id_boundaries() {
        assert!(!vlan_id_is_ok(0));
        assert!(!vlan_id_is_ok(1));
        assert!(vlan_id_is_ok(2));
        assert!(vlan_id_is_ok(4094));
        assert!(!vlan_id_is_ok(4095));
        assert!(!vlan_id_is_ok(4096));
    }

    #[test]
    fn test_frame_round_trip() {
        let dest = Gha::new([1, 2, 3, 4, 5, 6]);
        let src = Gha::new([6, 5, 4, 3, 2, 1]);
        let frame = build_frame(dest, src, ETH_P_RINA, &[0xAA, 0xBB]);
        let (header, payload) = parse_frame(&frame).unwrap();
        assert_eq!(header.dest, dest);
        assert_eq!(header.src, src);
        assert_eq!(header.ethertype, ETH_P_RINA);
        assert_eq!(payload, &[0xAA, 0xBB]);
    }

    #[test]
    fn test_parse_frame_rejects_short_input() {
        assert!(parse_frame(&[0u8; 13]).is_err());
    }
}
