// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Hypervisor shim engine
//!
//! Bridges RINA flows onto a VMPI para-virtual channel set. Channel 0
//! is reserved for a small control protocol (ALLOCATE_REQ /
//! ALLOCATE_RESP / DEALLOCATE); channels 1..N each carry the SDUs of
//! at most one flow. Allocation claims the first free channel and
//! negotiates with the peer over the control channel.

use crate::controller::{Controller, UserIpcp};
use crate::error::{CodecError, ShimError};
use crate::factory::ShimFactory;
use crate::flow::{FlowState, Sdu};
use crate::ipcp::{
    ConfigEntry, DifConfig, FlowSnapshot, FlowSpec, InstanceSnapshot, IpcpId, PortId, ShimInstance,
    UpstreamPort,
};
use crate::name::AppName;
use std::sync::{Arc, Mutex, Weak};

/// Channels per VMPI instance, control channel included.
pub const VMPI_NUM_CHANNELS: u32 = 64;

/// Upper bound on one serialized control message.
pub const CTRL_MSG_MAX_SIZE: usize = 2000;

/// Largest SDU accepted on a data channel.
pub const HV_MAX_SDU_SIZE: usize = 65535;

const CMD_ALLOCATE_REQ: u8 = 0;
const CMD_ALLOCATE_RESP: u8 = 1;
const CMD_DEALLOCATE: u8 = 2;

const RESP_OK: u8 = 0;
const RESP_KO: u8 = 1;

/// Callbacks the shim registers with the VMPI transport.
pub trait VmpiCallbacks: Send + Sync {
    /// One inbound buffer on `channel`.
    fn receive(&self, channel: u32, data: Vec<u8>);

    /// The transport can accept writes again.
    fn write_restart(&self);
}

/// One VMPI channel-set endpoint.
pub trait VmpiDevice: Send + Sync {
    fn num_channels(&self) -> u32;
    fn write(&self, channel: u32, data: Vec<u8>) -> Result<(), ShimError>;
    fn register_callbacks(&self, callbacks: Arc<dyn VmpiCallbacks>) -> Result<(), ShimError>;
}

/// Resolves `vmpi-id` configuration values to VMPI endpoints.
pub trait VmpiProvider: Send + Sync {
    fn find_instance(&self, vmpi_id: u32) -> Option<Arc<dyn VmpiDevice>>;
}

// ---- control message codec --------------------------------------------
//
// Wire format, bit-exact: u8 command, u32 channel in native byte
// order, strings NUL-terminated with the NUL transmitted.

fn ser_u8(out: &mut Vec<u8>, x: u8) {
    out.push(x);
}

fn ser_u32(out: &mut Vec<u8>, x: u32) {
    out.extend_from_slice(&x.to_ne_bytes());
}

fn ser_cstr(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

struct Des<'a> {
    buf: &'a [u8],
}

impl<'a> Des<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, CodecError> {
        let (&first, rest) = self.buf.split_first().ok_or(CodecError::Truncated(what))?;
        self.buf = rest;
        Ok(first)
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, CodecError> {
        if self.buf.len() < 4 {
            return Err(CodecError::Truncated(what));
        }
        let (bytes, rest) = self.buf.split_at(4);
        self.buf = rest;
        Ok(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn cstr(&mut self, what: &'static str) -> Result<&'a str, CodecError> {
        let nul = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or(CodecError::Truncated(what))?;
        let (bytes, rest) = self.buf.split_at(nul);
        self.buf = &rest[1..];
        std::str::from_utf8(bytes).map_err(|_| CodecError::Truncated(what))
    }
}

/// Decoded control message.
#[derive(Debug, PartialEq, Eq)]
enum CtrlMsg {
    AllocateReq {
        channel: u32,
        src_name: String,
        dst_name: String,
    },
    AllocateResp {
        channel: u32,
        response: u8,
    },
    Deallocate {
        channel: u32,
    },
}

fn encode_allocate_req(channel: u32, src: &AppName, dst: &AppName) -> Result<Vec<u8>, CodecError> {
    let src = src.to_wire();
    let dst = dst.to_wire();
    let msg_len = 1 + 4 + src.len() + 1 + dst.len() + 1;
    if msg_len >= CTRL_MSG_MAX_SIZE {
        return Err(CodecError::TooLong(msg_len));
    }
    let mut out = Vec::with_capacity(msg_len);
    ser_u8(&mut out, CMD_ALLOCATE_REQ);
    ser_u32(&mut out, channel);
    ser_cstr(&mut out, &src);
    ser_cstr(&mut out, &dst);
    Ok(out)
}

fn encode_allocate_resp(channel: u32, response: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(6);
    ser_u8(&mut out, CMD_ALLOCATE_RESP);
    ser_u32(&mut out, channel);
    ser_u8(&mut out, response);
    out
}

fn encode_deallocate(channel: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(5);
    ser_u8(&mut out, CMD_DEALLOCATE);
    ser_u32(&mut out, channel);
    out
}

fn decode_ctrl_msg(buf: &[u8]) -> Result<CtrlMsg, CodecError> {
    let mut des = Des::new(buf);
    match des.u8("command")? {
        CMD_ALLOCATE_REQ => Ok(CtrlMsg::AllocateReq {
            channel: des.u32("channel")?,
            src_name: des.cstr("source application name")?.to_string(),
            dst_name: des.cstr("destination application name")?.to_string(),
        }),
        CMD_ALLOCATE_RESP => Ok(CtrlMsg::AllocateResp {
            channel: des.u32("channel")?,
            response: des.u8("response")?,
        }),
        CMD_DEALLOCATE => Ok(CtrlMsg::Deallocate {
            channel: des.u32("channel")?,
        }),
        other => Err(CodecError::UnknownCommand(other)),
    }
}

// ---- engine -----------------------------------------------------------

struct HvChannel {
    state: FlowState,
    port_id: Option<PortId>,
    app_name: Option<AppName>,
    user_ipcp: Option<Arc<dyn UserIpcp>>,
}

impl Default for HvChannel {
    fn default() -> Self {
        Self {
            state: FlowState::Null,
            port_id: None,
            app_name: None,
            user_ipcp: None,
        }
    }
}

impl HvChannel {
    fn reset(&mut self) {
        self.state = FlowState::Null;
        self.port_id = None;
        self.app_name = None;
        self.user_ipcp = None;
    }
}

struct HvVc {
    assigned: bool,
    dif_name: Option<AppName>,
    vmpi_id: Option<u32>,
    vmpi: Option<Arc<dyn VmpiDevice>>,
    channels: Vec<HvChannel>,
}

/// One hypervisor shim IPCP instance.
pub struct HvInstance {
    id: IpcpId,
    name: AppName,
    #[allow(dead_code)]
    upstream_port: UpstreamPort,
    fspec: FlowSpec,
    family: Weak<HvShim>,
    self_ref: Weak<HvInstance>,
    reg: Mutex<Vec<AppName>>,
    vc: Mutex<HvVc>,
}

/// Family-wide state; also the `shim-hv` factory.
pub struct HvShim {
    controller: Arc<dyn Controller>,
    provider: Arc<dyn VmpiProvider>,
    self_ref: Weak<HvShim>,
    instances: Mutex<Vec<Arc<HvInstance>>>,
}

impl HvShim {
    pub fn new(controller: Arc<dyn Controller>, provider: Arc<dyn VmpiProvider>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<HvShim>| HvShim {
            controller,
            provider,
            self_ref: weak.clone(),
            instances: Mutex::new(Vec::new()),
        })
    }
}

impl ShimFactory for HvShim {
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
        let instance = Arc::new_cyclic(|weak: &Weak<HvInstance>| HvInstance {
            id,
            name: name.clone(),
            upstream_port,
            fspec: FlowSpec {
                max_sdu_size: HV_MAX_SDU_SIZE as u32,
                ..FlowSpec::default()
            },
            family: self.self_ref.clone(),
            self_ref: weak.clone(),
            reg: Mutex::new(Vec::new()),
            vc: Mutex::new(HvVc {
                assigned: false,
                dif_name: None,
                vmpi_id: None,
                vmpi: None,
                channels: Vec::new(),
            }),
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

impl HvInstance {
    fn family(&self) -> Result<Arc<HvShim>, ShimError> {
        self.family
            .upgrade()
            .ok_or_else(|| ShimError::Resource("shim family gone".to_string()))
    }

    fn teardown(&self) {
        let users: Vec<(Arc<dyn UserIpcp>, PortId)> = {
            let mut vc = self.vc.lock().unwrap();
            let users = vc
                .channels
                .iter()
                .filter_map(|ch| ch.user_ipcp.clone().zip(ch.port_id))
                .collect();
            for channel in vc.channels.iter_mut() {
                channel.reset();
            }
            users
        };
        for (user, port_id) in users {
            user.flow_unbinding_ipcp(port_id);
        }
        self.reg.lock().unwrap().clear();
    }

    fn send_ctrl_msg(&self, vmpi: &Arc<dyn VmpiDevice>, msg: Vec<u8>) {
        if let Err(e) = vmpi.write(0, msg) {
            log::error!("control message write failed: {e}");
        }
    }

    fn port_id_to_channel(vc: &HvVc, port_id: PortId) -> Option<usize> {
        vc.channels
            .iter()
            .position(|ch| ch.state != FlowState::Null && ch.port_id == Some(port_id))
    }

    /// Dispatch for one inbound control-channel message.
    fn handle_control_msg(&self, data: &[u8]) {
        match decode_ctrl_msg(data) {
            Ok(CtrlMsg::AllocateReq {
                channel,
                src_name,
                dst_name,
            }) => self.handle_allocate_req(channel, &src_name, &dst_name),
            Ok(CtrlMsg::AllocateResp { channel, response }) => {
                self.handle_allocate_resp(channel, response)
            }
            Ok(CtrlMsg::Deallocate { channel }) => self.handle_deallocate(channel),
            Err(e) => log::error!("bad control message: {e}"),
        }
    }

    fn handle_allocate_req(&self, channel: u32, src_name: &str, dst_name: &str) {
        log::debug!("received ALLOCATE_REQ(ch = {channel}, src = {src_name}, dst = {dst_name})");
        let Ok(family) = self.family() else { return };

        let vmpi = {
            let vc = self.vc.lock().unwrap();
            if channel as usize >= vc.channels.len() {
                log::error!("bogus channel {channel}");
                return;
            }
            vc.vmpi.clone()
        };
        let Some(vmpi) = vmpi else { return };

        let src_application = AppName::from_wire(src_name);
        let dst_application = AppName::from_wire(dst_name);

        let reject = |this: &Self| {
            this.send_ctrl_msg(&vmpi, encode_allocate_resp(channel, RESP_KO));
        };

        if !src_application.is_ok() || !dst_application.is_ok() {
            log::error!("invalid application names in ALLOCATE_REQ");
            reject(self);
            return;
        }

        {
            let vc = self.vc.lock().unwrap();
            if vc.channels[channel as usize].state != FlowState::Null {
                log::error!(
                    "channel {channel} in invalid state {}",
                    vc.channels[channel as usize].state
                );
                reject(self);
                return;
            }
        }

        let port_id = match family.controller.reserve_port_id(self.id) {
            Ok(port_id) => port_id,
            Err(e) => {
                log::error!("port-id reservation failed: {e}");
                reject(self);
                return;
            }
        };

        // Move to PENDING before telling the controller, whose
        // allocate-response must already find the channel by port-id.
        let dif_name = {
            let mut vc = self.vc.lock().unwrap();
            let Some(dif_name) = vc.dif_name.clone() else {
                drop(vc);
                family.controller.release_port_id(port_id);
                reject(self);
                return;
            };
            let ch = &mut vc.channels[channel as usize];
            ch.state = FlowState::Pending;
            ch.port_id = Some(port_id);
            ch.app_name = Some(dst_application.clone());
            log::debug!("channel {channel} --> PENDING");
            dif_name
        };

        if let Err(e) = family.controller.notify_flow_arrived(
            self.id,
            port_id,
            &dif_name,
            &dst_application,
            &src_application,
            &self.fspec,
        ) {
            log::error!("couldn't tell the controller about the flow: {e}");
            self.vc.lock().unwrap().channels[channel as usize].reset();
            family.controller.release_port_id(port_id);
            reject(self);
        }
    }

    fn handle_allocate_resp(&self, channel: u32, response: u8) {
        log::debug!("received ALLOCATE_RESP(ch = {channel}, resp = {response})");
        let Ok(family) = self.family() else { return };

        let (port_id, user_ipcp) = {
            let mut vc = self.vc.lock().unwrap();
            if channel as usize >= vc.channels.len() {
                log::error!("bogus channel {channel}");
                return;
            }
            let ch = &mut vc.channels[channel as usize];
            if ch.state != FlowState::Pending {
                log::error!("channel {channel} in invalid state {}", ch.state);
                return;
            }
            let (Some(port_id), Some(user_ipcp)) = (ch.port_id, ch.user_ipcp.clone()) else {
                ch.reset();
                return;
            };
            if response == RESP_OK {
                // The ALLOCATED state must be visible before any upward
                // notification, so a racing du_write on the fresh flow
                // already passes the state check.
                ch.state = FlowState::Allocated;
                log::debug!("channel {channel} --> ALLOCATED");
            }
            (port_id, user_ipcp)
        };

        let mut ok = response == RESP_OK;
        if ok {
            if let Err(e) = user_ipcp.flow_binding_ipcp(port_id) {
                log::error!("could not bind flow with user IPCP: {e}");
                ok = false;
            }
        }

        family
            .controller
            .notify_flow_alloc_result(self.id, port_id, ok);

        if !ok {
            let mut vc = self.vc.lock().unwrap();
            vc.channels[channel as usize].reset();
            drop(vc);
            family.controller.release_port_id(port_id);
            user_ipcp.flow_unbinding_ipcp(port_id);
            log::debug!("channel {channel} --> NULL");
        }
    }

    fn handle_deallocate(&self, channel: u32) {
        log::debug!("received DEALLOCATE(ch = {channel})");
        let Ok(family) = self.family() else { return };

        let (user, port_id) = {
            let mut vc = self.vc.lock().unwrap();
            if channel == 0 || channel as usize >= vc.channels.len() {
                log::error!("invalid channel {channel}");
                return;
            }
            let ch = &mut vc.channels[channel as usize];
            if ch.state == FlowState::Null {
                log::debug!("channel state is already NULL");
                return;
            }
            let user = ch.user_ipcp.clone();
            let port_id = ch.port_id;
            ch.reset();
            log::debug!("channel {channel} --> NULL");
            (user, port_id)
        };

        if let Some(port_id) = port_id {
            if let Some(user) = user {
                user.flow_unbinding_ipcp(port_id);
            }
            family
                .controller
                .notify_flow_dealloc(self.id, 0, port_id, true);
            family.controller.release_port_id(port_id);
        }
    }
}

impl VmpiCallbacks for HvInstance {
    fn receive(&self, channel: u32, data: Vec<u8>) {
        if channel == 0 {
            self.handle_control_msg(&data);
            return;
        }

        let deliver = {
            let vc = self.vc.lock().unwrap();
            if channel as usize >= vc.channels.len() {
                log::error!("invalid channel {channel}");
                return;
            }
            let ch = &vc.channels[channel as usize];
            if ch.state != FlowState::Allocated {
                log::debug!("dropping packet from channel {channel}: no associated flow");
                return;
            }
            match (&ch.user_ipcp, ch.port_id) {
                (Some(user), Some(port_id)) => Some((user.clone(), port_id)),
                _ => {
                    log::debug!("flow is being deallocated, dropping SDU");
                    None
                }
            }
        };

        if let Some((user, port_id)) = deliver {
            if let Err(e) = user.du_enqueue(port_id, data) {
                log::error!("couldn't enqueue SDU to user IPCP: {e}");
            }
        }
    }

    fn write_restart(&self) {
        let targets: Vec<(Arc<dyn UserIpcp>, PortId)> = {
            let vc = self.vc.lock().unwrap();
            vc.channels
                .iter()
                .filter(|ch| ch.state == FlowState::Allocated)
                .filter_map(|ch| ch.user_ipcp.clone().zip(ch.port_id))
                .collect()
        };
        for (user, port_id) in targets {
            user.enable_write(port_id);
        }
    }
}

impl ShimInstance for HvInstance {
    fn flow_allocate_request(
        &self,
        user_ipcp: Arc<dyn UserIpcp>,
        source: &AppName,
        dest: &AppName,
        _fspec: &FlowSpec,
        port_id: PortId,
    ) -> Result<(), ShimError> {
        let mut vc = self.vc.lock().unwrap();
        if !vc.assigned {
            return Err(ShimError::WrongState("IPC process not ready".to_string()));
        }
        let vmpi = vc
            .vmpi
            .clone()
            .ok_or_else(|| ShimError::WrongState("IPC process not ready".to_string()))?;

        // Claim the first free channel; channel 0 is control.
        let Some(channel) = (1..vc.channels.len()).find(|&i| vc.channels[i].state == FlowState::Null)
        else {
            log::info!("no free channels available, try later");
            return Err(ShimError::WouldBlock);
        };

        let msg = encode_allocate_req(channel as u32, source, dest).map_err(|e| {
            log::error!("cannot build ALLOCATE_REQ: {e}");
            ShimError::Codec(e)
        })?;
        self.send_ctrl_msg(&vmpi, msg);

        let ch = &mut vc.channels[channel];
        ch.state = FlowState::Pending;
        ch.port_id = Some(port_id);
        ch.user_ipcp = Some(user_ipcp);
        ch.app_name = Some(source.clone());
        log::debug!("channel {channel} --> PENDING");
        Ok(())
    }

    fn flow_allocate_response(
        &self,
        user_ipcp: Option<Arc<dyn UserIpcp>>,
        port_id: PortId,
        accepted: bool,
    ) -> Result<(), ShimError> {
        let family = self.family()?;

        let (vmpi, channel) = {
            let vc = self.vc.lock().unwrap();
            if !vc.assigned {
                family.controller.release_port_id(port_id);
                return Err(ShimError::WrongState("IPC process not ready".to_string()));
            }
            let Some(channel) = Self::port_id_to_channel(&vc, port_id) else {
                family.controller.release_port_id(port_id);
                return Err(ShimError::NotFound(format!("port-id {port_id}")));
            };
            let vmpi = vc.vmpi.clone();
            (vmpi, channel)
        };
        let Some(vmpi) = vmpi else {
            return Err(ShimError::WrongState("IPC process not ready".to_string()));
        };

        let mut response = RESP_KO;
        let mut result = Ok(());

        {
            let mut vc = self.vc.lock().unwrap();
            let ch = &mut vc.channels[channel];
            if ch.state != FlowState::Pending {
                result = Err(ShimError::WrongState(ch.state.to_string()));
            } else if accepted {
                match user_ipcp {
                    Some(user) => {
                        ch.user_ipcp = Some(user);
                        ch.state = FlowState::Allocated;
                        response = RESP_OK;
                        log::debug!("channel {channel} --> ALLOCATED");
                    }
                    None => {
                        result = Err(ShimError::BadArgument(
                            "no user IPCP supplied".to_string(),
                        ));
                    }
                }
            } else {
                ch.reset();
                log::debug!("channel {channel} --> NULL");
            }
        }

        if response == RESP_OK {
            // Bind outside the channel lock; undo on failure.
            let user = {
                let vc = self.vc.lock().unwrap();
                vc.channels[channel].user_ipcp.clone()
            };
            if let Some(user) = user {
                if let Err(e) = user.flow_binding_ipcp(port_id) {
                    log::error!("could not bind flow with user IPCP: {e}");
                    let mut vc = self.vc.lock().unwrap();
                    vc.channels[channel].reset();
                    response = RESP_KO;
                    result = Err(e);
                }
            }
        }

        self.send_ctrl_msg(&vmpi, encode_allocate_resp(channel as u32, response));
        if response != RESP_OK {
            family.controller.release_port_id(port_id);
        }
        result
    }

    fn flow_deallocate(&self, port_id: PortId) -> Result<(), ShimError> {
        let (vmpi, channel, user) = {
            let mut vc = self.vc.lock().unwrap();
            if !vc.assigned {
                return Err(ShimError::WrongState("IPC process not ready".to_string()));
            }
            let Some(channel) = Self::port_id_to_channel(&vc, port_id) else {
                // Already deallocated.
                return Ok(());
            };
            let vmpi = vc.vmpi.clone();
            let user = vc.channels[channel].user_ipcp.clone();
            vc.channels[channel].reset();
            log::debug!("channel {channel} --> NULL");
            (vmpi, channel, user)
        };

        if let Some(user) = user {
            user.flow_unbinding_ipcp(port_id);
        }
        if let Some(vmpi) = vmpi {
            self.send_ctrl_msg(&vmpi, encode_deallocate(channel as u32));
        }
        Ok(())
    }

    fn application_register(
        &self,
        name: &AppName,
        _daf_name: Option<&AppName>,
    ) -> Result<(), ShimError> {
        let mut reg = self.reg.lock().unwrap();
        if reg.iter().any(|n| n == name) {
            return Err(ShimError::NameConflict(format!(
                "application {name} already registered"
            )));
        }
        reg.push(name.clone());
        log::debug!("application {name} registered");
        Ok(())
    }

    fn application_unregister(&self, name: &AppName) -> Result<(), ShimError> {
        let mut reg = self.reg.lock().unwrap();
        let pos = reg
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| ShimError::NotFound(format!("application {name}")))?;
        reg.swap_remove(pos);
        log::debug!("application {name} unregistered");
        Ok(())
    }

    fn assign_to_dif(&self, dif_name: &AppName, config: &DifConfig) -> Result<(), ShimError> {
        let family = self.family()?;
        let mut vc = self.vc.lock().unwrap();
        if vc.assigned {
            return Err(ShimError::NameConflict(format!(
                "IPC process already assigned to the DIF {}",
                vc.dif_name.as_ref().map(|n| n.to_string()).unwrap_or_default()
            )));
        }

        let mut vmpi_id = None;
        for ConfigEntry { name, value } in &config.entries {
            match name.as_str() {
                "vmpi-id" => {
                    vmpi_id = Some(value.parse::<u32>().map_err(|_| {
                        ShimError::Config("invalid vmpi-id".to_string())
                    })?);
                }
                other => {
                    log::warn!("unknown config param '{other}'");
                }
            }
        }
        let vmpi_id = vmpi_id.ok_or_else(|| {
            ShimError::Config("missing vmpi-id configuration parameter".to_string())
        })?;

        let vmpi = family
            .provider
            .find_instance(vmpi_id)
            .ok_or_else(|| ShimError::NotFound(format!("VMPI instance {vmpi_id}")))?;

        let callbacks = self
            .self_ref
            .upgrade()
            .ok_or_else(|| ShimError::Resource("instance gone".to_string()))?;
        vmpi.register_callbacks(callbacks)?;

        let num_channels = vmpi.num_channels().max(1);
        vc.channels = (0..num_channels).map(|_| HvChannel::default()).collect();
        vc.vmpi = Some(vmpi);
        vc.vmpi_id = Some(vmpi_id);
        vc.dif_name = Some(dif_name.clone());
        vc.assigned = true;
        log::debug!(
            "ipcp {} assigned to DIF {dif_name}, VMPI instance {vmpi_id}",
            self.id
        );
        Ok(())
    }

    fn update_dif_config(&self, config: &DifConfig) -> Result<(), ShimError> {
        let vc = self.vc.lock().unwrap();
        if !vc.assigned {
            return Err(ShimError::WrongState("IPC process not ready".to_string()));
        }
        // The VMPI binding cannot be changed; accept a config that
        // repeats the current one.
        match config.get("vmpi-id").map(str::parse::<u32>) {
            Some(Ok(id)) if Some(id) == vc.vmpi_id => Ok(()),
            Some(_) => Err(ShimError::BadArgument(
                "vmpi-id cannot be changed".to_string(),
            )),
            None => Ok(()),
        }
    }

    fn du_write(&self, port_id: PortId, sdu: Sdu, _blocking: bool) -> Result<(), ShimError> {
        if sdu.len() > HV_MAX_SDU_SIZE {
            return Err(ShimError::BadArgument(format!(
                "SDU too large ({} bytes)",
                sdu.len()
            )));
        }
        let (vmpi, channel) = {
            let vc = self.vc.lock().unwrap();
            if !vc.assigned {
                return Err(ShimError::WrongState("IPC process not ready".to_string()));
            }
            let channel = Self::port_id_to_channel(&vc, port_id)
                .ok_or_else(|| ShimError::NotFound(format!("port-id {port_id}")))?;
            if vc.channels[channel].state != FlowState::Allocated {
                return Err(ShimError::WrongState(vc.channels[channel].state.to_string()));
            }
            (vc.vmpi.clone(), channel)
        };
        let vmpi = vmpi.ok_or_else(|| ShimError::WrongState("IPC process not ready".to_string()))?;
        vmpi.write(channel as u32, sdu)
    }

    fn flow_unbinding_user_ipcp(&self, port_id: PortId) -> Result<(), ShimError> {
        let mut vc = self.vc.lock().unwrap();
        if let Some(channel) = Self::port_id_to_channel(&vc, port_id) {
            vc.channels[channel].user_ipcp = None;
        }
        Ok(())
    }

    fn ipcp_name(&self) -> AppName {
        self.name.clone()
    }

    fn dif_name(&self) -> Option<AppName> {
        self.vc.lock().unwrap().dif_name.clone()
    }

    fn ipcp_id(&self) -> IpcpId {
        self.id
    }

    fn max_sdu_size(&self) -> usize {
        HV_MAX_SDU_SIZE
    }

    fn snapshot(&self) -> InstanceSnapshot {
        let vc = self.vc.lock().unwrap();
        InstanceSnapshot {
            ipcp_id: self.id,
            name: self.name.to_string(),
            dif_name: vc.dif_name.as_ref().map(|n| n.to_string()),
            registered_apps: self
                .reg
                .lock()
                .unwrap()
                .iter()
                .map(|n| n.to_string())
                .collect(),
            flows: vc
                .channels
                .iter()
                .enumerate()
                .filter(|(i, ch)| *i != 0 && ch.state != FlowState::Null)
                .map(|(i, ch)| FlowSnapshot {
                    port_id: ch.port_id,
                    state: ch.state,
                    peer: match &ch.app_name {
                        Some(app) => format!("channel {i} ({app})"),
                        None => format!("channel {i}"),
                    },
                    queued_sdus: 0,
                })
                .collect(),
        }
    }
}
