// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Shim IPCP instance interface
//!
//! The operations every shim instance exposes to the controller,
//! together with the flow-spec and DIF-configuration types they
//! consume. Each engine (Ethernet, TCP/UDP, hypervisor) implements
//! [`ShimInstance`] for its instance type.

use crate::controller::UserIpcp;
use crate::error::ShimError;
use crate::flow::{FlowState, Sdu};
use crate::name::AppName;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Process-wide flow endpoint identifier, assigned by the controller.
pub type PortId = u32;

/// Identifier of one IPC process instance.
pub type IpcpId = u16;

/// Upstream messaging port associated with an instance at creation.
pub type UpstreamPort = u32;

/// Per-flow QoS descriptor.
///
/// `max_allowable_gap < 0` means unordered delivery is acceptable;
/// `0` requests a reliable, gap-free flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSpec {
    pub average_bandwidth: u32,
    pub average_sdu_bandwidth: u32,
    pub delay: u32,
    pub jitter: u32,
    pub max_allowable_gap: i32,
    pub max_sdu_size: u32,
    pub ordered_delivery: bool,
    pub partial_delivery: bool,
    pub undetected_bit_error_rate: u32,
}

impl Default for FlowSpec {
    fn default() -> Self {
        Self {
            average_bandwidth: 0,
            average_sdu_bandwidth: 0,
            delay: 0,
            jitter: 0,
            max_allowable_gap: -1,
            max_sdu_size: 0,
            ordered_delivery: false,
            partial_delivery: true,
            undetected_bit_error_rate: 0,
        }
    }
}

impl FlowSpec {
    /// True if the spec asks for a reliable (gap-free) flow.
    pub fn is_reliable(&self) -> bool {
        self.max_allowable_gap == 0
    }
}

/// One key/value configuration entry, as handed down by the IPC
/// manager on DIF assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub name: String,
    pub value: String,
}

impl ConfigEntry {
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

/// The configuration blob attached to an `assign_to_dif` or
/// `update_dif_config` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DifConfig {
    pub entries: Vec<ConfigEntry>,
}

impl DifConfig {
    pub fn from_entries(entries: &[(&str, &str)]) -> Self {
        Self {
            entries: entries
                .iter()
                .map(|(n, v)| ConfigEntry::new(n, v))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value.as_str())
    }
}

/// Serializable view of one flow, for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct FlowSnapshot {
    pub port_id: Option<PortId>,
    pub state: FlowState,
    pub peer: String,
    pub queued_sdus: usize,
}

/// Serializable view of one instance, for introspection. The userspace
/// counterpart of the original per-instance debug files.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub ipcp_id: IpcpId,
    pub name: String,
    pub dif_name: Option<String>,
    pub registered_apps: Vec<String>,
    pub flows: Vec<FlowSnapshot>,
}

/// Operations a shim IPCP instance exposes to the controller.
pub trait ShimInstance: Send + Sync {
    /// Starts a locally-initiated flow allocation on `port_id`.
    /// Completion is asynchronous and reported through the controller.
    fn flow_allocate_request(
        &self,
        user_ipcp: Arc<dyn UserIpcp>,
        source: &AppName,
        dest: &AppName,
        fspec: &FlowSpec,
        port_id: PortId,
    ) -> Result<(), ShimError>;

    /// Completes a remotely-initiated allocation. `accepted == false`
    /// leaves the flow as a NULL stub until the controller deallocates
    /// it.
    fn flow_allocate_response(
        &self,
        user_ipcp: Option<Arc<dyn UserIpcp>>,
        port_id: PortId,
        accepted: bool,
    ) -> Result<(), ShimError>;

    /// Local flow tear-down.
    fn flow_deallocate(&self, port_id: PortId) -> Result<(), ShimError>;

    /// Registers an application (and optionally the DAF it belongs to)
    /// on this instance.
    fn application_register(
        &self,
        name: &AppName,
        daf_name: Option<&AppName>,
    ) -> Result<(), ShimError>;

    fn application_unregister(&self, name: &AppName) -> Result<(), ShimError>;

    /// Binds the instance to a DIF and parses the engine-specific
    /// configuration entries. May be called once.
    fn assign_to_dif(&self, dif_name: &AppName, config: &DifConfig) -> Result<(), ShimError>;

    /// Re-parses configuration on an already-assigned instance.
    fn update_dif_config(&self, config: &DifConfig) -> Result<(), ShimError>;

    /// Egress data path. Never blocks: returns
    /// [`ShimError::WouldBlock`] under back-pressure.
    fn du_write(&self, port_id: PortId, sdu: Sdu, blocking: bool) -> Result<(), ShimError>;

    /// Drops the user-IPCP reference of a flow while keeping the flow;
    /// used while the upper IPCP is being torn down.
    fn flow_unbinding_user_ipcp(&self, port_id: PortId) -> Result<(), ShimError>;

    fn ipcp_name(&self) -> AppName;

    fn dif_name(&self) -> Option<AppName>;

    fn ipcp_id(&self) -> IpcpId;

    /// Largest SDU the instance can carry in one lower-layer unit.
    fn max_sdu_size(&self) -> usize;

    /// Introspection snapshot of the instance state.
    fn snapshot(&self) -> InstanceSnapshot;
}
